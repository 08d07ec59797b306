//! Error types for the relay.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Relay error type.
///
/// Upstream completion failures are absent: they are rendered
/// into assistant text by the completion client and never reach a handler.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No active session for the request.
    #[error("authentication required")]
    AuthRequired,
    /// Session exists but lacks the required role.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Unknown user or out-of-range conversation index.
    #[error("{0}")]
    NotFound(String),
    /// Malformed or empty request payload.
    #[error("{0}")]
    InvalidRequest(String),
    /// Resource already exists.
    #[error("{0}")]
    Conflict(String),
    /// Both model-listing paths failed.
    #[error("Error fetching models: {0}")]
    ListingFailed(String),
    /// Password hashing failed or a stored credential is unreadable.
    #[error("credential error: {0}")]
    Credential(String),
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// HTTP client construction error.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status this error maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ListingFailed(_)
            | Self::Credential(_)
            | Self::Config(_)
            | Self::Sqlite(_)
            | Self::TokioSqlite(_)
            | Self::Serialization(_)
            | Self::Url(_)
            | Self::HttpClient(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a server-side fault rather than a caller mistake.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Credential(_)
                | Self::Config(_)
                | Self::Sqlite(_)
                | Self::TokioSqlite(_)
                | Self::Serialization(_)
                | Self::Url(_)
                | Self::HttpClient(_)
                | Self::Io(_)
        )
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if self.is_internal() {
            tracing::error!("internal error: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Convenience result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
