//! Correlation registry: every unresolved request, keyed by correlation id.
//!
//! An entry is inserted on first dispatch and removed exactly once, when the
//! request resolves. Interaction round-trips move the entry between
//! `Dispatching` and `AwaitingInteraction` without ever re-inserting it.
//! All operations take the one registry lock, so insert, lookup and removal
//! are atomic with respect to each other.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::envelope::Completion;
use crate::types::{AgentId, AgentPayload, CorrelationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Dispatching,
    AwaitingInteraction,
}

#[derive(Debug)]
struct PendingRequest {
    target: AgentId,
    payload: AgentPayload,
    completion: Completion,
    state: PendingState,
    hops: u32,
    submitted_at: Instant,
}

/// Why an interaction result could not be matched to a waiting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMiss {
    /// Never registered, or resolved so long ago it was forgotten.
    Unknown,
    /// Resolved recently; the result is a late duplicate.
    AlreadyResolved,
    /// In flight but not waiting on an interaction.
    NotAwaitingInteraction,
}

/// Bounded record of recently resolved ids, used only to classify late results.
#[derive(Debug)]
struct ResolvedLog {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<CorrelationId, Instant>,
    order: VecDeque<(CorrelationId, Instant)>,
}

impl ResolvedLog {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, id: CorrelationId, now: Instant) {
        self.evict(now);
        if self.seen.insert(id, now).is_some() {
            self.order.retain(|(seen_id, _)| *seen_id != id);
        }
        self.order.push_back((id, now));
        while self.seen.len() > self.max_entries {
            if let Some((old_id, _)) = self.order.pop_front() {
                self.seen.remove(&old_id);
            }
        }
    }

    fn contains(&mut self, id: &CorrelationId, now: Instant) -> bool {
        self.evict(now);
        self.seen.contains_key(id)
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, ts)) = self.order.front().copied() {
            if now.duration_since(ts) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    pending: HashMap<CorrelationId, PendingRequest>,
    resolved: ResolvedLog,
}

#[derive(Debug)]
pub struct CorrelationRegistry {
    inner: Mutex<RegistryInner>,
}

/// How many resolved ids are remembered for late-result diagnostics.
const RESOLVED_LOG_CAPACITY: usize = 4096;

impl CorrelationRegistry {
    pub fn new(resolved_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                pending: HashMap::new(),
                resolved: ResolvedLog::new(resolved_ttl, RESOLVED_LOG_CAPACITY),
            }),
        }
    }

    /// Register a new request. Hands the completion back if the id is taken.
    pub(crate) fn insert(
        &self,
        id: CorrelationId,
        target: AgentId,
        payload: AgentPayload,
        completion: Completion,
    ) -> Result<(), Completion> {
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(&id) {
            return Err(completion);
        }
        inner.pending.insert(
            id,
            PendingRequest {
                target,
                payload,
                completion,
                state: PendingState::Dispatching,
                hops: 0,
                submitted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Target and current payload for the next gateway invocation.
    pub(crate) fn dispatch_snapshot(&self, id: &CorrelationId) -> Option<(AgentId, AgentPayload)> {
        let mut inner = self.inner.lock();
        let entry = inner.pending.get_mut(id)?;
        entry.state = PendingState::Dispatching;
        Some((entry.target.clone(), entry.payload.clone()))
    }

    /// Mark the request as waiting on the user. Returns the hop number.
    pub(crate) fn park_for_interaction(&self, id: &CorrelationId) -> Option<u32> {
        let mut inner = self.inner.lock();
        let entry = inner.pending.get_mut(id)?;
        entry.state = PendingState::AwaitingInteraction;
        entry.hops += 1;
        Some(entry.hops)
    }

    /// Claim a parked request for resumption, merging the interaction result
    /// into its payload when one is given.
    pub(crate) fn begin_resume(
        &self,
        id: &CorrelationId,
        update: Option<AgentPayload>,
    ) -> Result<(), ResumeMiss> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let RegistryInner { pending, resolved } = &mut *inner;
        match pending.get_mut(id) {
            Some(entry) if entry.state == PendingState::AwaitingInteraction => {
                entry.state = PendingState::Dispatching;
                if let Some(update) = update {
                    entry.payload.merge(update);
                }
                Ok(())
            }
            Some(_) => Err(ResumeMiss::NotAwaitingInteraction),
            None if resolved.contains(id, now) => Err(ResumeMiss::AlreadyResolved),
            None => Err(ResumeMiss::Unknown),
        }
    }

    /// Remove a request for terminal resolution. Only the first call for an id
    /// gets the completion.
    pub(crate) fn complete(&self, id: &CorrelationId) -> Option<Completion> {
        let mut inner = self.inner.lock();
        let entry = inner.pending.remove(id)?;
        inner.resolved.record(*id, Instant::now());
        tracing::trace!(
            target = "agent_broker::registry",
            correlation_id = %id,
            hops = entry.hops,
            elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
            "registry entry removed"
        );
        Some(entry.completion)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.lock().pending.contains_key(id)
    }

    pub fn state(&self, id: &CorrelationId) -> Option<PendingState> {
        self.inner.lock().pending.get(id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    pub fn in_flight(&self) -> Vec<CorrelationId> {
        self.inner.lock().pending.keys().copied().collect()
    }

    /// Remove every entry, e.g. on shutdown. Caller resolves the completions.
    pub(crate) fn drain(&self) -> Vec<(CorrelationId, Completion)> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let drained: Vec<_> = inner
            .pending
            .drain()
            .map(|(id, entry)| (id, entry.completion))
            .collect();
        for (id, _) in &drained {
            inner.resolved.record(*id, now);
        }
        drained
    }
}
