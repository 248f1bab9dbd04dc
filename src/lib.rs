mod adapters;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod gateway;
pub mod keys;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod types;

pub use broker::{Broker, BrokerBuilder, WeakBroker};
pub use envelope::{BrokerMessage, Completion, RequestEnvelope};
pub use error::{AgentError, Result};
pub use gateway::{AgentChannel, AgentTransport, Gateway};
pub use keys::{AgentKey, KeySelection, KeyService, PublicKeyInfo};
pub use runner::{ForegroundRunner, InteractionLaunch, InteractionQueue, InteractionSurface};
pub use types::{
    AgentId, AgentOutcome, AgentPayload, CorrelationId, InteractionDescriptor, InteractionResult,
    InteractionToken, RequestOutcome,
};
