// Relay error taxonomy and the JSON error envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::provider::DirectoryError;

/// Classification recorded on request logs and error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkError,
    AuthError,
    RateLimit,
    ClientError,
    ServerError,
    ModelNotFound,
    AllProvidersFailed,
    InsufficientBalance,
    ProviderError,
    PrimaryGatewayFailed,
    StreamError,
    ClientCancelled,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ClientError => "client_error",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::AllProvidersFailed => "all_providers_failed",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::PrimaryGatewayFailed => "primary_gateway_failed",
            ErrorKind::StreamError => "stream_error",
            ErrorKind::ClientCancelled => "client_cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }

    /// Classify an upstream HTTP status (>= 400).
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::AuthError,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::ServerError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single upstream attempt. Every variant consumes one retry.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("failed to read response: {0}")]
    Read(#[source] reqwest::Error),

    #[error("upstream error: {status} - {body}")]
    Upstream { status: u16, body: String },

    #[error("failed to build upstream request: {0}")]
    Build(String),
}

impl AttemptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Network(_) | AttemptError::Read(_) => ErrorKind::NetworkError,
            AttemptError::Build(_) => ErrorKind::ClientError,
            AttemptError::Upstream { status, .. } => ErrorKind::from_status(*status),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Request-level failure returned to the caller.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Insufficient balance to process request: {0}")]
    InsufficientBalance(String),

    #[error("No provider supports model: {0}")]
    ModelNotFound(String),

    #[error("All {attempts} providers failed [{}]: {last}", .last.kind())]
    AllProvidersFailed { attempts: usize, last: AttemptError },

    #[error("Primary gateway failed: {0}")]
    PrimaryGateway(AttemptError),

    #[error("Failed to load provider configuration: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            RelayError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            RelayError::AllProvidersFailed { .. } => ErrorKind::AllProvidersFailed,
            RelayError::PrimaryGateway(_) => ErrorKind::PrimaryGatewayFailed,
            RelayError::Directory(_) => ErrorKind::ProviderError,
            RelayError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InsufficientBalance(_) => StatusCode::PAYMENT_REQUIRED,
            RelayError::ModelNotFound(_) | RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::AllProvidersFailed { .. } | RelayError::PrimaryGateway(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.kind().as_str(),
                "message": self.to_string(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::AuthError);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::AuthError);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::ClientError);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let err = RelayError::AllProvidersFailed {
            attempts: 3,
            last: AttemptError::Upstream {
                status: 500,
                body: "boom".to_string(),
            },
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "all_providers_failed");
        assert_eq!(
            body["error"]["message"],
            "All 3 providers failed [server_error]: upstream error: 500 - boom"
        );
    }

    #[test]
    fn test_exhaustion_names_last_classification() {
        let err = RelayError::AllProvidersFailed {
            attempts: 2,
            last: AttemptError::Upstream {
                status: 429,
                body: "slow down".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "All 2 providers failed [rate_limit]: upstream error: 429 - slow down"
        );
    }

    #[test]
    fn test_model_not_found_is_bad_request() {
        let err = RelayError::ModelNotFound("gpt-9".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    }
}
