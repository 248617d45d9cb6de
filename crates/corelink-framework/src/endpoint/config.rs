use std::time::Duration;

use crate::codec::WireFormat;
use crate::ids::ServiceType;
use crate::FrameworkError;

/// Default group address announced in [`Identity`].
pub const DEFAULT_GROUP_ADDRESS: &str = "224.0.0.226";
/// Default group port announced in [`Identity`].
pub const DEFAULT_GROUP_PORT: u16 = 5599;
/// Default discovery domain.
pub const DEFAULT_DOMAIN: &str = "corelink";

// ── Endpoint timing and capacities ───────────────────────────────────

/// Tunables for an [`Endpoint`](super::Endpoint).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How often every connected service is sent a keep-alive.
    pub keepalive_interval: Duration,
    /// How often the connection table is health-checked.
    pub check_interval: Duration,
    /// Silence after which a connected service is marked lost.
    pub lost_timeout: Duration,
    /// Silence after which a lost service is disconnected.
    pub disconnect_timeout: Duration,
    /// Upper bound on waiting for a torn-down connection's flow.
    pub teardown_timeout: Duration,
    /// Directory query timeout, at start and during hub recovery.
    pub query_timeout: Duration,
    /// Pause between hub recovery attempts.
    pub recovery_interval: Duration,
    /// How long a new session may take to introduce itself.
    pub handshake_timeout: Duration,
    /// Capacity of the inbound, event and per-connection outgoing queues.
    pub queue_capacity: usize,
    /// Pending receive bytes above this are discarded.
    pub buffer_capacity: usize,
    /// Size of a single session read.
    pub read_chunk: usize,
    pub wire_format: WireFormat,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(3),
            check_interval: Duration::from_secs(5),
            lost_timeout: Duration::from_secs(9),
            disconnect_timeout: Duration::from_secs(15),
            teardown_timeout: Duration::from_secs(3),
            query_timeout: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            queue_capacity: 1 << 10,
            buffer_capacity: 2 << 20,
            read_chunk: 64 * 1024,
            wire_format: WireFormat::Json,
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keep-alive, health-check, lost and disconnect timings.
    pub fn liveness(
        mut self,
        keepalive: Duration,
        check: Duration,
        lost: Duration,
        disconnect: Duration,
    ) -> Self {
        self.keepalive_interval = keepalive;
        self.check_interval = check;
        self.lost_timeout = lost;
        self.disconnect_timeout = disconnect;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    pub fn wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }
}

// ── Identity ──────────────────────────────────────────────────────────

/// Who an endpoint is and where it looks for its cluster.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    service_type: ServiceType,
    domain: String,
    group_address: String,
    group_port: u16,
    listen_address: String,
}

impl Identity {
    pub fn new(name: &str, service_type: ServiceType) -> Self {
        Self {
            name: name.to_string(),
            service_type,
            domain: DEFAULT_DOMAIN.to_string(),
            group_address: DEFAULT_GROUP_ADDRESS.to_string(),
            group_port: DEFAULT_GROUP_PORT,
            listen_address: "127.0.0.1".to_string(),
        }
    }

    /// Build an identity named `"<Prefix>_<hex>"` from a hardware id
    /// (typically a MAC address). Without one, a random suffix is used.
    pub fn generate(
        service_type: ServiceType,
        hardware_id: Option<&[u8]>,
    ) -> Result<Self, FrameworkError> {
        let name = generate_name(service_type, hardware_id)?;
        Ok(Self::new(&name, service_type))
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn group(mut self, address: &str, port: u16) -> Self {
        self.group_address = address.to_string();
        self.group_port = port;
        self
    }

    /// Address the hub listens on and announces. Peers listen on the
    /// local address their directory query came back with instead.
    pub fn listen_address(mut self, address: &str) -> Self {
        self.listen_address = address.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn domain_name(&self) -> &str {
        &self.domain
    }

    pub fn group_address(&self) -> &str {
        &self.group_address
    }

    pub fn group_port(&self) -> u16 {
        self.group_port
    }

    pub fn configured_listen_address(&self) -> &str {
        &self.listen_address
    }
}

/// `"<Prefix>_<hex>"` for the nameable service types.
pub fn generate_name(
    service_type: ServiceType,
    hardware_id: Option<&[u8]>,
) -> Result<String, FrameworkError> {
    let prefix = match service_type {
        ServiceType::Core => "Core",
        ServiceType::Cell => "Cell",
        ServiceType::Image => "Image",
        ServiceType::Router => {
            return Err(FrameworkError::UnnameableServiceType(
                service_type.to_string(),
            ))
        }
    };
    let suffix = match hardware_id {
        Some(bytes) if !bytes.is_empty() => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        _ => uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
    };
    Ok(format!("{prefix}_{suffix}"))
}
