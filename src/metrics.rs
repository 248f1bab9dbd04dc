//! Request counters for the broker.
//!
//! Tracks how requests end (success, failure, cancellation), how many
//! interaction detours were taken and how many late interaction results were
//! dropped. Exported as a serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::RequestOutcome;

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub interactions: u64,
    pub correlation_mismatches: u64,
}

impl MetricsSnapshot {
    pub fn resolved(&self) -> u64 {
        self.succeeded + self.failed + self.canceled
    }
}

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    interactions: AtomicU64,
    correlation_mismatches: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_interaction(&self) {
        self.interactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_correlation_mismatch(&self) {
        self.correlation_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_resolved(&self, outcome: &RequestOutcome) {
        let counter = match outcome {
            RequestOutcome::Success(_) => &self.succeeded,
            RequestOutcome::Failure(_) => &self.failed,
            RequestOutcome::Canceled => &self.canceled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            interactions: self.interactions.load(Ordering::Relaxed),
            correlation_mismatches: self.correlation_mismatches.load(Ordering::Relaxed),
        }
    }
}
