use crate::ids::{MessageId, ParamKey, SessionId};

/// Errors returned by the corelink framework.
///
/// Wraps transport errors and adds endpoint, engine and envelope variants.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("transport error: {0}")]
    Transport(#[from] corelink_transport::TransportError),

    // ── Envelope ────────────────────────────────────────────────────
    #[error("missing parameter {key}")]
    MissingParam { key: ParamKey },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ── Endpoint ────────────────────────────────────────────────────
    #[error("endpoint is not stopped")]
    NotStopped,

    #[error("endpoint is not running")]
    NotRunning,

    #[error("no hub available")]
    NoHubAvailable,

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("submodule '{0}' already registered")]
    DuplicateSubmodule(String),

    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("service '{0}' already connected")]
    AlreadyConnected(String),

    #[error("queue for '{0}' is closed")]
    QueueClosed(String),

    #[error("invalid service type {0}")]
    InvalidServiceType(u64),

    #[error("service type {0} has no name prefix")]
    UnnameableServiceType(String),

    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    // ── Engine ──────────────────────────────────────────────────────
    #[error("executor already registered for {0}")]
    DuplicateExecutor(MessageId),

    #[error("engine already started")]
    EngineRunning,

    #[error("engine stopped")]
    EngineStopped,

    #[error("no executor for {0}")]
    NoExecutor(MessageId),

    #[error("request already bound to session {0}")]
    SessionPreset(SessionId),

    #[error("invalid session {0}")]
    InvalidSession(SessionId),

    #[error("session {0} not allocated")]
    SessionNotAllocated(SessionId),

    // ── Runner ──────────────────────────────────────────────────────
    #[error("routine already running")]
    RoutineRunning,

    #[error("routine not running")]
    RoutineStopped,
}

impl From<serde_json::Error> for FrameworkError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            FrameworkError::Deserialization(e.to_string())
        } else {
            FrameworkError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for FrameworkError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FrameworkError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FrameworkError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FrameworkError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    #[test]
    fn test_display_missing_param() {
        let err = FrameworkError::MissingParam {
            key: ids::PARAM_KEY_NAME,
        };
        assert_eq!(err.to_string(), "missing parameter 0");
    }

    #[test]
    fn test_display_no_executor() {
        let err = FrameworkError::NoExecutor(ids::SERVICE_READY);
        assert_eq!(err.to_string(), "no executor for event(service, 1)");
    }

    #[test]
    fn test_display_unknown_target() {
        let err = FrameworkError::UnknownTarget("Cell_0a".into());
        assert_eq!(err.to_string(), "unknown target 'Cell_0a'");
    }

    #[test]
    fn test_from_transport() {
        let err: FrameworkError = corelink_transport::TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: session closed");
    }

    #[test]
    fn test_from_json_syntax_error() {
        let err: FrameworkError = serde_json::from_slice::<u32>(b"{")
            .map_err(FrameworkError::from)
            .unwrap_err();
        assert!(matches!(err, FrameworkError::Deserialization(_)));
    }
}
