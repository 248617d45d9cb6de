use std::ops::Range;

use crate::TransportError;

/// First port tried by the listener search.
pub const LISTEN_PORT_RANGE_START: u16 = 5600;

/// End (exclusive) of the listener search.
pub const LISTEN_PORT_RANGE_END: u16 = LISTEN_PORT_RANGE_START + 200;

/// Configuration for a [`TcpTransport`](crate::TcpTransport).
///
/// ```rust
/// use corelink_transport::TransportConfig;
///
/// let config = TransportConfig::new().port_range(7000..7010);
/// assert_eq!(config.ports(), 7000..7010);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ports tried in order when listening; the first successful bind wins.
    pub(crate) ports: Range<u16>,
    /// Disable Nagle on every session.
    pub(crate) nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults.
    ///
    /// If `CORELINK_PORT_RANGE` is set (`"start-end"`, end exclusive) and
    /// parses, it replaces the default port range. Invalid values are
    /// ignored with a warning.
    pub fn new() -> Self {
        let ports = match std::env::var("CORELINK_PORT_RANGE") {
            Ok(raw) => match parse_port_range(&raw) {
                Ok(range) => range,
                Err(e) => {
                    tracing::warn!("transport: ignoring CORELINK_PORT_RANGE: {e}");
                    LISTEN_PORT_RANGE_START..LISTEN_PORT_RANGE_END
                }
            },
            Err(_) => LISTEN_PORT_RANGE_START..LISTEN_PORT_RANGE_END,
        };
        Self {
            ports,
            nodelay: true,
        }
    }

    /// Set the listener port search range (end exclusive).
    pub fn port_range(mut self, ports: Range<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Enable or disable `TCP_NODELAY` (default: enabled).
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    pub fn ports(&self) -> Range<u16> {
        self.ports.clone()
    }
}

/// Parse `"start-end"` into a port range.
pub fn parse_port_range(raw: &str) -> Result<Range<u16>, TransportError> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| TransportError::Config(format!("expected start-end, got '{raw}'")))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| TransportError::Config(format!("invalid start port '{start}'")))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| TransportError::Config(format!("invalid end port '{end}'")))?;
    if start >= end {
        return Err(TransportError::Config(format!(
            "empty port range {start}-{end}"
        )));
    }
    Ok(start..end)
}
