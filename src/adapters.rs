//! Caller-facing ways to run a request: block for it, await it, get a
//! callback, or get a message posted to a queue the caller owns.
//!
//! All of them build a [`RequestEnvelope`] and hand it to [`Broker::submit`];
//! they differ only in the completion they attach.

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::envelope::{BrokerMessage, Completion, RequestEnvelope};
use crate::error::AgentError;
use crate::types::{AgentId, AgentPayload, CorrelationId, RequestOutcome};

impl Broker {
    /// Submit and block the calling thread until the request resolves.
    ///
    /// Returns `Ok(None)` when the user canceled. Refuses to run on the UI
    /// thread, since the interactions this request may need are presented
    /// there, and inside a current-thread runtime, which could never drive
    /// the request to completion. On a multi-thread runtime worker the wait
    /// goes through `block_in_place`; prefer [`execute`](Self::execute) there.
    pub fn execute_blocking(
        &self,
        target: AgentId,
        payload: AgentPayload,
    ) -> Result<Option<AgentPayload>, AgentError> {
        if self.is_ui_thread() {
            tracing::warn!(
                target = "agent_broker::adapters",
                agent = %target,
                "blocking request refused on the UI thread"
            );
            return Err(AgentError::BlockingOnUiThread);
        }
        if let Ok(handle) = Handle::try_current() {
            if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
                tracing::warn!(
                    target = "agent_broker::adapters",
                    agent = %target,
                    "blocking request refused inside a current-thread runtime"
                );
                return Err(AgentError::BlockingInAsyncContext);
            }
        }

        let (completion, rx) = Completion::waiter();
        self.submit(RequestEnvelope::new(target, payload, completion));
        match tokio::task::block_in_place(|| rx.blocking_recv()) {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(AgentError::BrokerShutdown),
        }
    }

    /// Submit and await the outcome.
    pub async fn execute(&self, target: AgentId, payload: AgentPayload) -> RequestOutcome {
        let (completion, rx) = Completion::waiter();
        self.submit(RequestEnvelope::new(target, payload, completion));
        rx.await
            .unwrap_or(RequestOutcome::Failure(AgentError::BrokerShutdown))
    }

    /// Submit and return at once; `on_done` runs exactly once on whichever
    /// thread resolves the request.
    pub fn execute_with_callback<F>(
        &self,
        target: AgentId,
        payload: AgentPayload,
        on_done: F,
    ) -> CorrelationId
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        self.submit(RequestEnvelope::new(
            target,
            payload,
            Completion::callback(on_done),
        ))
    }

    /// Submit and return at once; the outcome is posted to `target_queue`
    /// tagged with the returned correlation id.
    pub fn execute_with_message(
        &self,
        target: AgentId,
        payload: AgentPayload,
        target_queue: mpsc::UnboundedSender<BrokerMessage>,
    ) -> CorrelationId {
        self.submit(RequestEnvelope::new(
            target,
            payload,
            Completion::message(target_queue),
        ))
    }
}
