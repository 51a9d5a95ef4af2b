use std::time::Duration;

use crate::state::ConnectionState;

/// Error taxonomy for everything that talks to a managed server.
///
/// Transport failures are transient and drive reconnection. Authentication
/// failures are fatal for the manager. Rpc and Timeout are per-call and never
/// affect the connection. Configuration fails fast before any I/O.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("rpc fault {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("not connected (state: {state})")]
    NotConnected { state: ConnectionState },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ConnectionError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Configuration(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Authentication(_) => "authentication",
            Self::Rpc { .. } => "rpc",
            Self::Timeout(_) => "timeout",
            Self::NotConnected { .. } => "not_connected",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Notification persistence failed. Logged, never blocks live delivery.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence error: {0}")]
    Backend(String),
}

/// Shared cache read/write failed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
