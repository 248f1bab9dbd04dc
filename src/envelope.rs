//! Request envelopes and the completions that deliver their outcome.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::types::{AgentId, AgentPayload, CorrelationId, RequestOutcome};

/// Posted to a message target when a request resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub correlation_id: CorrelationId,
    pub outcome: RequestOutcome,
}

/// How the outcome of a request reaches its caller. Resolving consumes the
/// completion, so it can fire at most once.
pub enum Completion {
    /// Wait handle for a blocked thread or an awaiting task.
    Waiter(oneshot::Sender<RequestOutcome>),
    /// Invoked on whichever thread resolves the request.
    Callback(Box<dyn FnOnce(RequestOutcome) + Send + 'static>),
    /// Posted to a queue owned by the caller, typically the UI thread.
    Message(mpsc::UnboundedSender<BrokerMessage>),
}

impl Completion {
    pub fn waiter() -> (Self, oneshot::Receiver<RequestOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Waiter(tx), rx)
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(RequestOutcome) + Send + 'static,
    {
        Completion::Callback(Box::new(f))
    }

    pub fn message(target: mpsc::UnboundedSender<BrokerMessage>) -> Self {
        Completion::Message(target)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Completion::Waiter(_) => "waiter",
            Completion::Callback(_) => "callback",
            Completion::Message(_) => "message",
        }
    }

    pub(crate) fn resolve(self, correlation_id: CorrelationId, outcome: RequestOutcome) {
        match self {
            Completion::Waiter(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(
                        target = "agent_broker::envelope",
                        correlation_id = %correlation_id,
                        "waiter dropped before the outcome arrived"
                    );
                }
            }
            Completion::Callback(f) => f(outcome),
            Completion::Message(target) => {
                if target
                    .send(BrokerMessage {
                        correlation_id,
                        outcome,
                    })
                    .is_err()
                {
                    tracing::debug!(
                        target = "agent_broker::envelope",
                        correlation_id = %correlation_id,
                        "message target closed, outcome dropped"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion").field(&self.kind()).finish()
    }
}

/// One logical request on its way to an agent.
#[derive(Debug)]
pub struct RequestEnvelope {
    pub(crate) correlation_id: Option<CorrelationId>,
    pub(crate) target: AgentId,
    pub(crate) payload: AgentPayload,
    pub(crate) completion: Completion,
}

impl RequestEnvelope {
    pub fn new(target: AgentId, payload: AgentPayload, completion: Completion) -> Self {
        Self {
            correlation_id: None,
            target,
            payload,
            completion,
        }
    }

    /// Pin the correlation id instead of letting the broker assign one.
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn target(&self) -> &AgentId {
        &self.target
    }

    pub fn payload(&self) -> &AgentPayload {
        &self.payload
    }
}
