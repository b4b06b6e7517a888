use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the broker.
///
/// Per-event errors are acknowledged only to the originating connection as a
/// structured `{error, code}` event; they never tear down shared state. Only
/// `CredentialMalformed` on a handshake terminates a connection.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Malformed credential: {0}")]
    CredentialMalformed(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Connection limit exceeded: {0}")]
    ConnectionLimit(String),

    #[error("Bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable wire code for this error. Clients and the Control Plane match
    /// on these; they never change between releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialMalformed(_) => "CREDENTIAL_MALFORMED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::InvalidEvent(_) => "INVALID_EVENT",
            Self::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ConnectionLimit(_) => "CONNECTION_LIMIT",
            Self::BridgeUnavailable(_) => "BRIDGE_UNAVAILABLE",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to send across the transport boundary. Internal detail
    /// (backend identifiers, config paths) stays in the server-side logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Config(_) if is_production() => "Configuration error".to_string(),
            Self::Internal(_) if is_production() => "Internal server error".to_string(),
            Self::BackendUnavailable(_) if is_production() => {
                "Service temporarily degraded".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            BrokerError::CredentialMalformed(_) => StatusCode::UNAUTHORIZED,
            BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
            BrokerError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::InvalidEvent(_) | BrokerError::UnknownChannel(_) => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::ConnectionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::BridgeUnavailable(_) | BrokerError::BackendUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            BrokerError::Config(_) | BrokerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %self.code(),
            status = %status.as_u16(),
            message = %self,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
