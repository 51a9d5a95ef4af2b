use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use servdeck_core::{CacheError, ConnectionError, PersistenceError};

/// Errors surfaced by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("log persistence is disabled")]
    LogsDisabled,
    #[error("log query failed: {0}")]
    Logs(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Connection(e) => match e {
                ConnectionError::Configuration(_) => StatusCode::NOT_FOUND,
                ConnectionError::NotConnected { .. } | ConnectionError::Transport(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ConnectionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ConnectionError::Rpc { .. } | ConnectionError::Authentication(_) => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Self::Persistence(PersistenceError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Persistence(PersistenceError::Backend(_)) | Self::Logs(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::LogsDisabled => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(e) => e.error_kind(),
            Self::Persistence(PersistenceError::NotFound(_)) => "not_found",
            Self::Persistence(_) => "persistence",
            Self::Cache(_) => "cache",
            Self::LogsDisabled | Self::Logs(_) => "logs",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), code = self.code(), error = %self, "request failed");
        }
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servdeck_core::ConnectionState;
    use std::time::Duration;

    #[test]
    fn connection_errors_map_to_gateway_codes() {
        let cases = [
            (ConnectionError::Configuration("x".into()), StatusCode::NOT_FOUND),
            (
                ConnectionError::NotConnected {
                    state: ConnectionState::Connecting,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ConnectionError::Timeout(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (ConnectionError::rpc(-1000, "Login unknown."), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn missing_notification_is_404() {
        let err = ApiError::from(PersistenceError::NotFound("ntf_1".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }
}
