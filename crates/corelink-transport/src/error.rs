use std::time::Duration;

/// Errors returned by the corelink transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no port available in range {start} ~ {end} on {host}")]
    NoPortAvailable { host: String, start: u16, end: u16 },

    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session closed")]
    Closed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("no service answered within {0:?}")]
    QueryTimeout(Duration),

    #[error("directory failure: {0}")]
    Directory(#[source] anyhow::Error),

    #[error("datagram encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the error means the other side (or we) closed the session,
    /// as opposed to a failure worth a warning.
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::Closed | TransportError::ListenerClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_port_available() {
        let err = TransportError::NoPortAvailable {
            host: "10.0.0.1".into(),
            start: 5600,
            end: 5800,
        };
        assert_eq!(
            err.to_string(),
            "no port available in range 5600 ~ 5800 on 10.0.0.1"
        );
    }

    #[test]
    fn closed_classification() {
        assert!(TransportError::Closed.is_closed());
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(TransportError::Io(reset).is_closed());
        assert!(!TransportError::Config("bad".into()).is_closed());
    }
}
