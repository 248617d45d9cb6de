//! corelink framework: service discovery, connection management and
//! session-multiplexed request processing for a hub and its peers.
//!
//! - [`Message`]: the typed envelope every service exchanges.
//! - [`Endpoint`]: finds the hub (or is the hub), keeps heartbeat-checked
//!   sessions to every remote service and routes messages by name.
//! - [`TransactionEngine`]: gives each inbound request its own session id
//!   and task, then routes follow-up messages back to it.
//! - [`Runner`]: start/stop plumbing for a long-lived background routine.
//!
//! Transports and directories come from `corelink-transport`.
pub mod codec;
pub mod endpoint;
pub mod engine;
mod error;
pub mod ids;
mod message;
pub mod runner;

pub use codec::WireFormat;
pub use endpoint::{
    ConnectionInfo, ConnectionStatus, Endpoint, EndpointConfig, EndpointHandle, EndpointStats,
    EndpointStatus, Identity, MessageSender, Role, ServiceHandler,
};
pub use engine::{EngineConfig, EngineStats, TransactionEngine, TransactionExecutor};
pub use error::FrameworkError;
pub use ids::{MessageId, ParamKey, ServiceType, SessionId, TransactionId};
pub use message::Message;
pub use runner::{RoutineController, Runner};
