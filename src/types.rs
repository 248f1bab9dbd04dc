use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AgentError;

/// Identifies one logical request across every interaction round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identity of an out-of-process agent (for example its package or socket name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Request or response content exchanged with an agent: an action name plus
/// free-form extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl AgentPayload {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extras: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(Value::as_str)
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extras.get(key).and_then(Value::as_i64)
    }

    /// Overlay an interaction result onto this request. Keys present in
    /// `update` win; a non-empty action in `update` replaces ours.
    pub fn merge(&mut self, update: AgentPayload) {
        if !update.action.is_empty() {
            self.action = update.action;
        }
        self.extras.extend(update.extras);
    }
}

/// What the foreground surface needs to launch an interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionDescriptor {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// Agent-defined data handed back when the interaction completes.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// An interaction waiting to be presented, tied to its originating request.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionToken {
    pub correlation_id: CorrelationId,
    pub agent: AgentId,
    pub descriptor: InteractionDescriptor,
    /// 1 for the first interaction of a request, 2 for the second, ...
    pub hop: u32,
}

/// Outcome of a single agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Success(AgentPayload),
    Failure(AgentError),
    InteractionRequired(InteractionDescriptor),
}

/// Terminal outcome delivered to the caller of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success(AgentPayload),
    Failure(AgentError),
    Canceled,
}

impl RequestOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestOutcome::Success(_) => "success",
            RequestOutcome::Failure(_) => "failure",
            RequestOutcome::Canceled => "canceled",
        }
    }

    /// `Ok(None)` when the user canceled.
    pub fn into_result(self) -> Result<Option<AgentPayload>, AgentError> {
        match self {
            RequestOutcome::Success(payload) => Ok(Some(payload)),
            RequestOutcome::Failure(error) => Err(error),
            RequestOutcome::Canceled => Ok(None),
        }
    }
}

/// What the foreground surface reports back after presenting an interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionResult {
    Completed(AgentPayload),
    Canceled,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AgentPayload, CorrelationId, RequestOutcome};
    use crate::error::AgentError;

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn merge_overlays_extras_and_keeps_action() {
        let mut request = AgentPayload::new("sign")
            .with_extra("key_id", "k1")
            .with_extra("challenge", "AAEC");
        request.merge(AgentPayload::default().with_extra("unlock_handle", 42));

        assert_eq!(request.action, "sign");
        assert_eq!(request.extra_str("key_id"), Some("k1"));
        assert_eq!(request.extra_i64("unlock_handle"), Some(42));
    }

    #[test]
    fn merge_replaces_action_and_conflicting_keys() {
        let mut request = AgentPayload::new("select_key").with_extra("hint", "old");
        request.merge(AgentPayload::new("public_key").with_extra("hint", "new"));

        assert_eq!(request.action, "public_key");
        assert_eq!(request.extra("hint"), Some(&json!("new")));
    }

    #[test]
    fn canceled_outcome_is_not_an_error() {
        assert_eq!(RequestOutcome::Canceled.into_result(), Ok(None));
        assert_eq!(
            RequestOutcome::Failure(AgentError::connection("down")).into_result(),
            Err(AgentError::connection("down"))
        );
    }
}
