//! Foreground interaction runner.
//!
//! Runs on the one context allowed to show interaction UI. Tokens arrive over
//! an unbounded FIFO queue and are presented one at a time: the next token is
//! not taken off the queue until the current interaction has reported back.
//! Every token taken off the queue is reported to the broker exactly once,
//! including when the surface disappears or the runner itself is dropped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::broker::{Broker, WeakBroker};
use crate::types::{
    AgentId, AgentPayload, CorrelationId, InteractionDescriptor, InteractionResult,
    InteractionToken,
};

/// Receiving end of the broker's interaction tokens.
#[derive(Debug)]
pub struct InteractionQueue {
    rx: mpsc::UnboundedReceiver<InteractionToken>,
}

impl InteractionQueue {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<InteractionToken>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<InteractionToken> {
        self.rx.recv().await
    }

    fn close_and_drain(&mut self) -> Vec<InteractionToken> {
        self.rx.close();
        let mut drained = Vec::new();
        while let Ok(token) = self.rx.try_recv() {
            drained.push(token);
        }
        drained
    }
}

/// One interaction handed to the surface. Dropping it without answering
/// counts as a cancellation.
#[derive(Debug)]
pub struct InteractionLaunch {
    pub correlation_id: CorrelationId,
    pub agent: AgentId,
    pub descriptor: InteractionDescriptor,
    reply: oneshot::Sender<InteractionResult>,
}

impl InteractionLaunch {
    pub fn respond(self, result: InteractionResult) {
        let _ = self.reply.send(result);
    }

    pub fn complete(self, result: AgentPayload) {
        self.respond(InteractionResult::Completed(result));
    }

    pub fn cancel(self) {
        self.respond(InteractionResult::Canceled);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.respond(InteractionResult::Failed(reason.into()));
    }
}

/// The platform facility that shows an interaction and eventually answers.
///
/// `launch` must return promptly; the answer is delivered later through the
/// [`InteractionLaunch`].
pub trait InteractionSurface: Send + Sync {
    fn launch(&self, launch: InteractionLaunch);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Presenting(CorrelationId),
    Completed(CorrelationId),
    Canceled(CorrelationId),
    Failed(CorrelationId),
}

/// Read-only view of a runner's state, usable from any thread.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    state: Arc<Mutex<RunnerState>>,
}

impl RunnerHandle {
    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self.state(), RunnerState::Presenting(_))
    }
}

/// Reports `Canceled` if a presentation is abandoned before it reported.
struct PresentGuard {
    broker: WeakBroker,
    id: CorrelationId,
    armed: bool,
}

impl Drop for PresentGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Some(broker) = self.broker.upgrade() {
                broker.resume_after_interaction(self.id, InteractionResult::Canceled);
            }
        }
    }
}

pub struct ForegroundRunner {
    broker: WeakBroker,
    queue: InteractionQueue,
    surface: Weak<dyn InteractionSurface>,
    state: Arc<Mutex<RunnerState>>,
}

impl ForegroundRunner {
    /// The runner keeps only weak references to the broker and the surface.
    pub fn new(
        broker: &Broker,
        queue: InteractionQueue,
        surface: &Arc<dyn InteractionSurface>,
    ) -> Self {
        Self {
            broker: broker.downgrade(),
            queue,
            surface: Arc::downgrade(surface),
            state: Arc::new(Mutex::new(RunnerState::Idle)),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            state: self.state.clone(),
        }
    }

    /// Present tokens until the broker goes away.
    ///
    /// Must be driven on the UI thread (`block_on` on that thread, or a
    /// current-thread runtime owned by it): the thread is registered with the
    /// broker so blocking calls made from it are refused.
    pub async fn run(mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.register_ui_thread(std::thread::current().id());
        }
        tracing::debug!(target = "agent_broker::runner", "interaction runner started");

        while let Some(token) = self.queue.recv().await {
            self.present(token).await;
        }

        tracing::debug!(target = "agent_broker::runner", "interaction runner stopped");
    }

    /// Present one interaction and report its outcome to the broker.
    pub async fn present(&mut self, token: InteractionToken) -> InteractionResult {
        let InteractionToken {
            correlation_id,
            agent,
            descriptor,
            hop,
        } = token;
        let mut guard = PresentGuard {
            broker: self.broker.clone(),
            id: correlation_id,
            armed: true,
        };
        *self.state.lock() = RunnerState::Presenting(correlation_id);
        tracing::debug!(
            target = "agent_broker::runner",
            correlation_id = %correlation_id,
            agent = %agent,
            hop,
            "presenting interaction"
        );

        let result = match self.surface.upgrade() {
            Some(surface) => {
                let (reply, answer) = oneshot::channel();
                surface.launch(InteractionLaunch {
                    correlation_id,
                    agent,
                    descriptor,
                    reply,
                });
                drop(surface);
                answer.await.unwrap_or_else(|_| {
                    tracing::info!(
                        target = "agent_broker::runner",
                        correlation_id = %correlation_id,
                        "interaction abandoned without an answer"
                    );
                    InteractionResult::Canceled
                })
            }
            None => {
                tracing::info!(
                    target = "agent_broker::runner",
                    correlation_id = %correlation_id,
                    "interaction surface is gone, canceling"
                );
                InteractionResult::Canceled
            }
        };

        *self.state.lock() = match &result {
            InteractionResult::Completed(_) => RunnerState::Completed(correlation_id),
            InteractionResult::Canceled => RunnerState::Canceled(correlation_id),
            InteractionResult::Failed(_) => RunnerState::Failed(correlation_id),
        };

        guard.armed = false;
        if let Some(broker) = self.broker.upgrade() {
            broker.resume_after_interaction(correlation_id, result.clone());
        }
        result
    }
}

impl Drop for ForegroundRunner {
    fn drop(&mut self) {
        let pending = self.queue.close_and_drain();
        if pending.is_empty() {
            return;
        }
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        tracing::info!(
            target = "agent_broker::runner",
            count = pending.len(),
            "runner stopped with queued interactions, canceling them"
        );
        for token in pending {
            broker.resume_after_interaction(token.correlation_id, InteractionResult::Canceled);
        }
    }
}
