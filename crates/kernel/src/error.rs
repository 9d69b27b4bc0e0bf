//! Proxy error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a source could not be acquired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Upstream answered 404/410 or the local file does not exist.
    #[error("source not found: {0}")]
    NotFound(String),

    /// The reference was refused (path traversal, local sources disabled, too large).
    #[error("source rejected: {0}")]
    Rejected(String),

    /// The remote fetch did not finish in time.
    #[error("source fetch timed out: {0}")]
    Timeout(String),

    /// Any other upstream or local read failure.
    #[error("source fetch failed: {0}")]
    Upstream(String),
}

/// Errors surfaced by request resolution.
///
/// `Clone` so a producer can publish one outcome to every waiter on the same
/// fingerprint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    SourceUnavailable(#[from] SourceError),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("cache store failure: {0}")]
    Store(String),

    #[error("production abandoned before completion")]
    Cancelled,
}

impl ProxyError {
    /// Wrap a store-layer error, keeping its context chain.
    pub fn store(err: &anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }

    /// Wrap a transformer error, keeping its context chain.
    pub fn transform(err: &anyhow::Error) -> Self {
        Self::Transform(format!("{err:#}"))
    }

    /// Failures a waiter may retry as a fresh producer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Store(_))
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SourceUnavailable(SourceError::NotFound(_) | SourceError::Rejected(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::SourceUnavailable(SourceError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::SourceUnavailable(SourceError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            Self::Transform(_) | Self::Store(_) | Self::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Client-caused errors echo their message; server-side ones stay vague.
        let body = if status.is_server_error() {
            match &self {
                Self::SourceUnavailable(_) => {
                    tracing::warn!(error = %self, "upstream source failure");
                    self.to_string()
                }
                _ => {
                    tracing::error!(error = %self, "request resolution failed");
                    "internal server error".to_string()
                }
            }
        } else {
            self.to_string()
        };

        (status, body).into_response()
    }
}

/// Result type alias using ProxyError.
pub type ProxyResult<T> = Result<T, ProxyError>;
