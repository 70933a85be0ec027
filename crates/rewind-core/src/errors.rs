use std::time::Duration;

/// Missing or invalid client configuration. Fatal at initialization.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("relay endpoint URI is not configured")]
    MissingEndpoint,
    #[error("session id is not configured")]
    MissingSessionId,
    #[error("invalid endpoint URI {uri}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },
    #[error("invalid stack trace filter: {0}")]
    InvalidStackTraceFilter(String),
}

impl ConfigError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingEndpoint => "missing_endpoint",
            Self::MissingSessionId => "missing_session_id",
            Self::InvalidEndpoint { .. } => "invalid_endpoint",
            Self::InvalidStackTraceFilter(_) => "invalid_stack_trace_filter",
        }
    }
}

/// Rejection of a single relay call. Never affects other connections.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("no session joined, join a session first")]
    NoSessionJoined,
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Wire error code carried in completion frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSessionJoined => "NO_SESSION",
            Self::EmptySessionId | Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Self::Malformed(_) => "PARSE_ERROR",
        }
    }

    pub fn invalid_arguments(method: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of the bidirectional transport or of a remote invocation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("remote call {method} rejected ({code}): {message}")]
    Remote {
        method: String,
        code: String,
        message: String,
    },
    #[error("remote call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// True when the underlying connection is gone rather than a single call failing.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed | Self::Connect { .. })
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::NotConnected => "not_connected",
            Self::Closed => "closed",
            Self::Remote { .. } => "remote",
            Self::Timeout { .. } => "timeout",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

/// Failure installing a restored state into a live feature.
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("state for feature {feature} does not match its type: {source}")]
    StateMismatch {
        feature: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reducer for {action} failed: {reason}")]
    Reducer { action: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_codes() {
        assert_eq!(ProtocolError::NoSessionJoined.code(), "NO_SESSION");
        assert_eq!(ProtocolError::EmptySessionId.code(), "INVALID_ARGUMENTS");
        assert_eq!(
            ProtocolError::invalid_arguments("Dispatch", "expected 3 args").code(),
            "INVALID_ARGUMENTS"
        );
        assert_eq!(ProtocolError::MethodNotFound("Nope".into()).code(), "METHOD_NOT_FOUND");
        assert_eq!(ProtocolError::Malformed("eof".into()).code(), "PARSE_ERROR");
    }

    #[test]
    fn no_session_message_mentions_join() {
        let msg = ProtocolError::NoSessionJoined.to_string();
        assert!(msg.contains("join a session first"), "got: {msg}");
    }

    #[test]
    fn disconnect_classification() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(TransportError::NotConnected.is_disconnect());
        assert!(TransportError::Connect {
            endpoint: "ws://x".into(),
            reason: "refused".into()
        }
        .is_disconnect());

        let remote = TransportError::Remote {
            method: "Dispatch".into(),
            code: "NO_SESSION".into(),
            message: "join first".into(),
        };
        assert!(!remote.is_disconnect());
        assert!(!TransportError::Timeout {
            method: "Dispatch".into(),
            timeout: Duration::from_secs(1)
        }
        .is_disconnect());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ConfigError::MissingEndpoint.error_kind(), "missing_endpoint");
        assert_eq!(ConfigError::MissingSessionId.error_kind(), "missing_session_id");
        assert_eq!(TransportError::Closed.error_kind(), "closed");
        assert_eq!(
            TransportError::Serialization("bad".into()).error_kind(),
            "serialization"
        );
    }

    #[test]
    fn serde_error_converts_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let te: TransportError = err.into();
        assert!(matches!(te, TransportError::Serialization(_)));
    }
}
