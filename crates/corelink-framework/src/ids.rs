//! Message ids, parameter keys and service types the framework itself needs.
//!
//! A [`MessageId`] packs three 8-bit fields: `operate << 16 | resource << 8 | kind`.
//! Application ids are built the same way with their own resources.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::FrameworkError;

pub type SessionId = u32;
pub type TransactionId = u32;
pub type ParamKey = u32;

// ── Message ids ───────────────────────────────────────────────────────

/// Flat opcode identifying what a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u32);

impl MessageId {
    pub const fn new(operate: u8, resource: u8, kind: u8) -> Self {
        Self(((operate as u32) << 16) | ((resource as u32) << 8) | kind as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn operate(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn resource(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn kind(self) -> u8 {
        self.0 as u8
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind() {
            KIND_REQUEST => "request",
            KIND_RESPONSE => "response",
            KIND_EVENT => "event",
            _ => "kind?",
        };
        match self.resource() {
            RESOURCE_SERVICE => write!(f, "{kind}(service, {})", self.operate()),
            RESOURCE_CONNECTION => write!(f, "{kind}(connection, {})", self.operate()),
            other => write!(f, "{kind}({other}, {})", self.operate()),
        }
    }
}

pub const KIND_REQUEST: u8 = 0;
pub const KIND_RESPONSE: u8 = 1;
pub const KIND_EVENT: u8 = 2;

pub const RESOURCE_SERVICE: u8 = 0;
pub const RESOURCE_CONNECTION: u8 = 1;

pub const EVENT_AVAILABLE: u8 = 0;
pub const EVENT_READY: u8 = 1;
pub const EVENT_HEARTBEAT: u8 = 2;
pub const EVENT_OPEN: u8 = 3;
pub const EVENT_CLOSE: u8 = 4;
pub const EVENT_CONNECT: u8 = 11;
pub const EVENT_DISCONNECT: u8 = 12;

/// A dependency service announced it exists.
pub const SERVICE_AVAILABLE: MessageId =
    MessageId::new(EVENT_AVAILABLE, RESOURCE_SERVICE, KIND_EVENT);
/// A dependency service is ready to take requests.
pub const SERVICE_READY: MessageId = MessageId::new(EVENT_READY, RESOURCE_SERVICE, KIND_EVENT);
/// Local notification: a remote service connected.
pub const SERVICE_CONNECTED: MessageId =
    MessageId::new(EVENT_CONNECT, RESOURCE_SERVICE, KIND_EVENT);
/// Local notification: a remote service went away.
pub const SERVICE_DISCONNECTED: MessageId =
    MessageId::new(EVENT_DISCONNECT, RESOURCE_SERVICE, KIND_EVENT);

/// Handshake carrying `{name, type}`.
pub const CONNECTION_OPENED: MessageId =
    MessageId::new(EVENT_OPEN, RESOURCE_CONNECTION, KIND_EVENT);
/// Graceful goodbye on a connection.
pub const CONNECTION_CLOSED: MessageId =
    MessageId::new(EVENT_CLOSE, RESOURCE_CONNECTION, KIND_EVENT);
/// Liveness ping.
pub const CONNECTION_KEEP_ALIVE: MessageId =
    MessageId::new(EVENT_HEARTBEAT, RESOURCE_CONNECTION, KIND_EVENT);

// ── Parameter keys ────────────────────────────────────────────────────

pub const PARAM_KEY_NAME: ParamKey = 0;
pub const PARAM_KEY_TYPE: ParamKey = 1;
pub const PARAM_KEY_FLAG: ParamKey = 15;
pub const PARAM_KEY_ADDRESS: ParamKey = 21;

// ── Service types ─────────────────────────────────────────────────────

/// Kind string the hub publishes in the group directory.
pub const HUB_KIND: &str = "core";

/// Declared role of a service in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Core,
    Cell,
    Image,
    Router,
}

impl ServiceType {
    pub fn as_u64(self) -> u64 {
        match self {
            ServiceType::Core => 0,
            ServiceType::Cell => 1,
            ServiceType::Image => 2,
            ServiceType::Router => 3,
        }
    }

    pub fn from_u64(raw: u64) -> Result<Self, FrameworkError> {
        match raw {
            0 => Ok(ServiceType::Core),
            1 => Ok(ServiceType::Cell),
            2 => Ok(ServiceType::Image),
            3 => Ok(ServiceType::Router),
            other => Err(FrameworkError::InvalidServiceType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Core => "core",
            ServiceType::Cell => "cell",
            ServiceType::Image => "image",
            ServiceType::Router => "router",
        }
    }

    pub fn is_hub(self) -> bool {
        self == ServiceType::Core
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_three_fields() {
        let id = MessageId::new(0x12, 0x34, 0x02);
        assert_eq!(id.raw(), 0x0012_3402);
        assert_eq!(id.operate(), 0x12);
        assert_eq!(id.resource(), 0x34);
        assert_eq!(id.kind(), KIND_EVENT);
    }

    #[test]
    fn system_ids_are_distinct() {
        let ids = [
            SERVICE_AVAILABLE,
            SERVICE_READY,
            SERVICE_CONNECTED,
            SERVICE_DISCONNECTED,
            CONNECTION_OPENED,
            CONNECTION_CLOSED,
            CONNECTION_KEEP_ALIVE,
        ];
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn control_ids_live_in_connection_resource() {
        for id in [CONNECTION_OPENED, CONNECTION_CLOSED, CONNECTION_KEEP_ALIVE] {
            assert_eq!(id.resource(), RESOURCE_CONNECTION);
        }
        assert_eq!(CONNECTION_KEEP_ALIVE.to_string(), "event(connection, 2)");
    }

    #[test]
    fn service_type_roundtrip() {
        for t in [
            ServiceType::Core,
            ServiceType::Cell,
            ServiceType::Image,
            ServiceType::Router,
        ] {
            assert_eq!(ServiceType::from_u64(t.as_u64()).unwrap(), t);
        }
        assert!(ServiceType::from_u64(9).is_err());
        assert!(ServiceType::Core.is_hub());
        assert_eq!(ServiceType::Core.as_str(), HUB_KIND);
    }
}
