//! Error types for the agent broker.

use std::time::Duration;

use thiserror::Error;

use crate::types::CorrelationId;

/// Errors that can terminate an agent request or a caller-facing operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent could not be reached or the channel failed to bind.
    #[error("agent connection error: {0}")]
    Connection(String),

    /// The agent answered with something that does not fit the outcome contract.
    #[error("agent protocol error: {0}")]
    Protocol(String),

    /// The agent reported an error of its own.
    #[error("agent error ({code}): {message}")]
    Agent {
        /// Agent-specific error code.
        code: i64,
        /// Human readable message from the agent.
        message: String,
    },

    /// The user dismissed the interaction.
    #[error("canceled by user")]
    UserCanceled,

    /// The requested algorithm has no counterpart in the agent vocabulary.
    #[error("algorithm not supported: {0}")]
    AlgorithmUnsupported(String),

    /// A result arrived for a correlation id that is not in flight.
    #[error("no in-flight request for correlation id {0}")]
    CorrelationMismatch(CorrelationId),

    /// A request was submitted under an id that is already in flight.
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelation(CorrelationId),

    /// The agent did not answer in time.
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),

    /// The interaction surface failed to present the interaction.
    #[error("interaction failed: {0}")]
    Interaction(String),

    /// A blocking call was made on the thread that presents interactions.
    #[error("blocking agent call on the interaction thread would deadlock")]
    BlockingOnUiThread,

    /// A blocking call was made where the calling thread drives the runtime.
    #[error("blocking agent call inside a current-thread async runtime")]
    BlockingInAsyncContext,

    /// The broker went away before the request was resolved.
    #[error("broker shut down before the request completed")]
    BrokerShutdown,
}

impl AgentError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Check if this error means the user declined rather than the system failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCanceled)
    }

    /// Transient failures a caller may choose to retry. The broker itself never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Stable snake_case code for event output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Protocol(_) => "protocol_error",
            Self::Agent { .. } => "agent_error",
            Self::UserCanceled => "user_canceled",
            Self::AlgorithmUnsupported(_) => "algorithm_unsupported",
            Self::CorrelationMismatch(_) => "correlation_mismatch",
            Self::DuplicateCorrelation(_) => "duplicate_correlation",
            Self::Timeout(_) => "timeout",
            Self::Interaction(_) => "interaction_failed",
            Self::BlockingOnUiThread => "blocking_on_ui_thread",
            Self::BlockingInAsyncContext => "blocking_in_async_context",
            Self::BrokerShutdown => "broker_shutdown",
        }
    }
}

/// Result type alias for agent broker operations.
pub type Result<T> = std::result::Result<T, AgentError>;
