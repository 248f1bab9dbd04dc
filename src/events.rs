use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::types::{AgentId, CorrelationId};

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout is reserved for command output
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Request lifecycle milestones reported by the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BrokerEvent<'a> {
    RequestSubmitted {
        correlation_id: CorrelationId,
        agent: &'a AgentId,
        action: &'a str,
    },
    InteractionRequired {
        correlation_id: CorrelationId,
        agent: &'a AgentId,
        hop: u32,
    },
    RequestResolved {
        correlation_id: CorrelationId,
        outcome: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
    },
    CorrelationMismatch {
        correlation_id: CorrelationId,
        reason: String,
    },
}

impl BrokerEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::RequestSubmitted { .. } => "request_submitted",
            BrokerEvent::InteractionRequired { .. } => "interaction_required",
            BrokerEvent::RequestResolved { .. } => "request_resolved",
            BrokerEvent::CorrelationMismatch { .. } => "correlation_mismatch",
        }
    }
}

/// Writes request lifecycle events as JSON lines on stderr when enabled.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.json_output
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }

    pub fn record(&self, event: BrokerEvent<'_>) {
        self.emit(event.name(), &event);
    }
}

#[cfg(test)]
mod tests {
    use super::{BrokerEvent, EventEmitter};
    use crate::types::{AgentId, CorrelationId};
    use serde_json::json;

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::disabled();
        assert!(!emitter.is_enabled());
        emitter.emit("request_submitted", json!({"correlation_id": "x"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("request_resolved", json!({"outcome": "canceled"}));
        emitter.emit("interaction_required", "plain string payload");
        emitter.emit("correlation_mismatch", 1);
    }

    #[test]
    fn broker_events_serialize_without_tag() {
        let agent = AgentId::new("okc");
        let id = CorrelationId::new();
        let event = BrokerEvent::InteractionRequired {
            correlation_id: id,
            agent: &agent,
            hop: 2,
        };
        assert_eq!(event.name(), "interaction_required");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"correlation_id": id.to_string(), "agent": "okc", "hop": 2})
        );

        let resolved = BrokerEvent::RequestResolved {
            correlation_id: id,
            outcome: "canceled",
            error: None,
        };
        let value = serde_json::to_value(&resolved).unwrap();
        assert!(value.get("error").is_none());
    }
}
