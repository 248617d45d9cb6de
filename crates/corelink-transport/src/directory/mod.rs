//! Group directory: how peers find the hub.
//!
//! The hub announces a [`ServiceRecord`] and starts answering; peers
//! `query` with a bounded timeout and get [`Candidate`]s back, each one
//! carrying the local address the peer should bind to in order to reach
//! the advertised service.
mod memory;
mod udp;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TransportError;

pub use memory::MemoryDirectory;
pub use udp::{DirectoryConfig, UdpDirectory};

/// What a service publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service kind, e.g. `"core"` for the hub.
    pub kind: String,
    /// Transport protocol name (see [`SessionTransport::protocol`](crate::SessionTransport::protocol)).
    pub protocol: String,
    pub address: String,
    pub port: u16,
}

impl ServiceRecord {
    pub fn new(kind: &str, protocol: &str, address: &str, port: u16) -> Self {
        Self {
            kind: kind.to_string(),
            protocol: protocol.to_string(),
            address: address.to_string(),
            port,
        }
    }
}

/// One answer to a directory query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: String,
    /// Local address the querying side used to reach the responder.
    pub local_address: String,
    pub address: String,
    pub port: u16,
}

impl Candidate {
    pub(crate) fn from_record(record: &ServiceRecord, local_address: &str) -> Self {
        Self {
            kind: record.kind.clone(),
            local_address: local_address.to_string(),
            address: record.address.clone(),
            port: record.port,
        }
    }
}

/// Discovery capability consumed by the endpoint.
#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Queue a record for publication. Takes effect on [`start`](Self::start).
    async fn announce(&self, record: ServiceRecord) -> Result<(), TransportError>;

    /// Begin answering queries with the announced records.
    async fn start(&self) -> Result<(), TransportError>;

    /// Ask the group for services. Fails with
    /// [`TransportError::QueryTimeout`] when nobody answers in time.
    async fn query(&self, timeout: Duration) -> Result<Vec<Candidate>, TransportError>;

    /// Withdraw and forget announced records, stop answering. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;
}
