//! The request broker.
//!
//! Every request lives in the correlation registry from submission until its
//! completion fires. Gateway invocations run as tasks on the broker's runtime;
//! interaction tokens go to the foreground runner's queue and come back through
//! [`Broker::resume_after_interaction`].

use std::{
    sync::{Arc, Weak},
    thread::ThreadId,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc};

use crate::config::BrokerConfig;
use crate::envelope::RequestEnvelope;
use crate::error::AgentError;
use crate::events::{BrokerEvent, EventEmitter};
use crate::gateway::Gateway;
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::registry::{CorrelationRegistry, ResumeMiss};
use crate::runner::InteractionQueue;
use crate::types::{
    AgentId, AgentOutcome, CorrelationId, InteractionDescriptor, InteractionResult,
    InteractionToken, RequestOutcome,
};

struct BrokerInner {
    gateway: Gateway,
    registry: CorrelationRegistry,
    interactions: mpsc::UnboundedSender<InteractionToken>,
    runtime: Handle,
    config: BrokerConfig,
    metrics: BrokerMetrics,
    events: EventEmitter,
    ui_thread: Mutex<Option<ThreadId>>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Non-owning reference to a broker, held by the foreground runner.
#[derive(Clone)]
pub struct WeakBroker {
    inner: Weak<BrokerInner>,
}

impl WeakBroker {
    pub fn upgrade(&self) -> Option<Broker> {
        self.inner.upgrade().map(|inner| Broker { inner })
    }
}

pub struct BrokerBuilder {
    gateway: Gateway,
    config: BrokerConfig,
    events: EventEmitter,
    runtime: Option<Handle>,
}

impl BrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Runtime that gateway invocations are spawned on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the broker and the queue its interaction tokens are delivered to.
    ///
    /// Without an explicit [`runtime`](Self::runtime) this must be called from
    /// within a tokio runtime.
    pub fn build(self) -> (Broker, InteractionQueue) {
        let (interactions, queue) = InteractionQueue::channel();
        let registry = CorrelationRegistry::new(self.config.resolved_ttl);
        let broker = Broker {
            inner: Arc::new(BrokerInner {
                gateway: self.gateway,
                registry,
                interactions,
                runtime: self.runtime.unwrap_or_else(Handle::current),
                config: self.config,
                metrics: BrokerMetrics::new(),
                events: self.events,
                ui_thread: Mutex::new(None),
            }),
        };
        (broker, queue)
    }
}

/// Resolves the request with `BrokerShutdown` if a dispatch future is dropped
/// before the gateway answers (runtime shutting down).
struct DispatchGuard<'a> {
    broker: &'a Broker,
    id: CorrelationId,
    armed: bool,
}

impl DispatchGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.broker
                .resolve(self.id, RequestOutcome::Failure(AgentError::BrokerShutdown));
        }
    }
}

impl Broker {
    pub fn builder(gateway: Gateway) -> BrokerBuilder {
        BrokerBuilder {
            gateway,
            config: BrokerConfig::default(),
            events: EventEmitter::disabled(),
            runtime: None,
        }
    }

    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn register_ui_thread(&self, thread: ThreadId) {
        *self.inner.ui_thread.lock() = Some(thread);
    }

    /// True on the thread the foreground runner presents interactions from.
    pub fn is_ui_thread(&self) -> bool {
        *self.inner.ui_thread.lock() == Some(std::thread::current().id())
    }

    /// Register the envelope and dispatch it in the background.
    ///
    /// Never blocks and never fails: every error, including a correlation id
    /// that is already in flight, is delivered through the envelope's
    /// completion.
    pub fn submit(&self, envelope: RequestEnvelope) -> CorrelationId {
        let RequestEnvelope {
            correlation_id,
            target,
            payload,
            completion,
        } = envelope;
        let id = correlation_id.unwrap_or_default();
        self.inner.metrics.on_submit();

        let action = payload.action.clone();
        let completion_kind = completion.kind();
        if let Err(completion) = self
            .inner
            .registry
            .insert(id, target.clone(), payload, completion)
        {
            tracing::warn!(
                target = "agent_broker::broker",
                correlation_id = %id,
                agent = %target,
                "rejecting request with a correlation id already in flight"
            );
            let outcome = RequestOutcome::Failure(AgentError::DuplicateCorrelation(id));
            self.inner.metrics.on_resolved(&outcome);
            self.inner.runtime.spawn(async move {
                completion.resolve(id, outcome);
            });
            return id;
        }

        tracing::debug!(
            target = "agent_broker::broker",
            correlation_id = %id,
            agent = %target,
            action = %action,
            completion = completion_kind,
            "request submitted"
        );
        self.inner.events.record(BrokerEvent::RequestSubmitted {
            correlation_id: id,
            agent: &target,
            action: &action,
        });

        self.spawn_dispatch(id);
        id
    }

    fn spawn_dispatch(&self, id: CorrelationId) {
        let broker = self.clone();
        self.inner.runtime.spawn(async move {
            broker.dispatch(id).await;
        });
    }

    /// Invoke the gateway for a registered request and act on the outcome.
    pub(crate) async fn dispatch(&self, id: CorrelationId) {
        let Some((target, payload)) = self.inner.registry.dispatch_snapshot(&id) else {
            tracing::debug!(
                target = "agent_broker::broker",
                correlation_id = %id,
                "dispatch skipped, request already resolved"
            );
            return;
        };

        let mut guard = DispatchGuard {
            broker: self,
            id,
            armed: true,
        };
        let outcome = self.inner.gateway.invoke(id, &target, &payload).await;
        guard.disarm();

        match outcome {
            AgentOutcome::Success(response) => self.resolve(id, RequestOutcome::Success(response)),
            AgentOutcome::Failure(error) => self.resolve(id, RequestOutcome::Failure(error)),
            AgentOutcome::InteractionRequired(descriptor) => {
                self.request_interaction(id, target, descriptor)
            }
        }
    }

    fn request_interaction(
        &self,
        id: CorrelationId,
        agent: AgentId,
        descriptor: InteractionDescriptor,
    ) {
        let Some(hop) = self.inner.registry.park_for_interaction(&id) else {
            return;
        };

        let max_hops = self.inner.config.max_interaction_hops;
        if hop > max_hops {
            tracing::warn!(
                target = "agent_broker::broker",
                correlation_id = %id,
                agent = %agent,
                hop,
                "agent keeps asking for interaction, giving up"
            );
            self.resolve(
                id,
                RequestOutcome::Failure(AgentError::protocol(format!(
                    "agent requested more than {max_hops} interactions"
                ))),
            );
            return;
        }

        self.inner.metrics.on_interaction();
        tracing::info!(
            target = "agent_broker::broker",
            correlation_id = %id,
            agent = %agent,
            hop,
            title = %descriptor.title,
            "agent requires user interaction"
        );
        self.inner.events.record(BrokerEvent::InteractionRequired {
            correlation_id: id,
            agent: &agent,
            hop,
        });

        let token = InteractionToken {
            correlation_id: id,
            agent,
            descriptor,
            hop,
        };
        if self.inner.interactions.send(token).is_err() {
            tracing::warn!(
                target = "agent_broker::broker",
                correlation_id = %id,
                "no interaction runner, canceling request"
            );
            self.resolve(id, RequestOutcome::Canceled);
        }
    }

    /// Feed an interaction's result back into the request it belongs to.
    ///
    /// Results for ids that are not waiting on an interaction are logged and
    /// dropped; they never affect other requests.
    pub fn resume_after_interaction(&self, id: CorrelationId, result: InteractionResult) {
        let claimed = match result {
            InteractionResult::Completed(update) => self
                .inner
                .registry
                .begin_resume(&id, Some(update))
                .map(|()| None),
            InteractionResult::Canceled => self
                .inner
                .registry
                .begin_resume(&id, None)
                .map(|()| Some(RequestOutcome::Canceled)),
            InteractionResult::Failed(reason) => {
                self.inner.registry.begin_resume(&id, None).map(|()| {
                    Some(RequestOutcome::Failure(AgentError::Interaction(reason)))
                })
            }
        };

        match claimed {
            Ok(None) => {
                tracing::debug!(
                    target = "agent_broker::broker",
                    correlation_id = %id,
                    "interaction completed, re-dispatching"
                );
                self.spawn_dispatch(id);
            }
            Ok(Some(outcome)) => self.resolve(id, outcome),
            Err(miss) => self.report_mismatch(id, miss),
        }
    }

    fn report_mismatch(&self, id: CorrelationId, miss: ResumeMiss) {
        self.inner.metrics.on_correlation_mismatch();
        let error = AgentError::CorrelationMismatch(id);
        tracing::warn!(
            target = "agent_broker::broker",
            correlation_id = %id,
            reason = ?miss,
            error = %error,
            "dropping interaction result"
        );
        self.inner.events.record(BrokerEvent::CorrelationMismatch {
            correlation_id: id,
            reason: format!("{miss:?}"),
        });
    }

    fn resolve(&self, id: CorrelationId, outcome: RequestOutcome) {
        let Some(completion) = self.inner.registry.complete(&id) else {
            tracing::debug!(
                target = "agent_broker::broker",
                correlation_id = %id,
                "request already resolved"
            );
            return;
        };

        self.inner.metrics.on_resolved(&outcome);
        match &outcome {
            RequestOutcome::Failure(error) => tracing::info!(
                target = "agent_broker::broker",
                correlation_id = %id,
                error = %error,
                "request failed"
            ),
            other => tracing::debug!(
                target = "agent_broker::broker",
                correlation_id = %id,
                outcome = other.kind(),
                "request resolved"
            ),
        }
        self.inner.events.record(BrokerEvent::RequestResolved {
            correlation_id: id,
            outcome: outcome.kind(),
            error: match &outcome {
                RequestOutcome::Failure(error) => Some(error.code()),
                _ => None,
            },
        });
        completion.resolve(id, outcome);
    }

    /// Fail every in-flight request with `BrokerShutdown`.
    pub fn shutdown(&self) {
        for (id, completion) in self.inner.registry.drain() {
            let outcome = RequestOutcome::Failure(AgentError::BrokerShutdown);
            self.inner.metrics.on_resolved(&outcome);
            completion.resolve(id, outcome);
        }
    }
}
