//! Error types for track-dl
//!
//! This module provides the error handling for the library:
//! - The top-level [`Error`] returned by facade and store operations
//! - [`ProviderError`] raised by download providers, classified for retry
//! - [`StageError`], the structured failure persisted on a record and published
//!   with its `Final::Failed` progress value
//! - HTTP status code mapping and structured JSON error bodies for the API

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::types::{StageKind, Status, TrackId};

/// Result type alias for track-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for track-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "temp_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Error raised by a download provider outside of a stage
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A stage failed
    #[error(transparent)]
    Stage(#[from] StageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Download record not found
    #[error("download not found: {0}")]
    NotFound(String),

    /// No provider registered under the requested extension id
    #[error("no provider registered for extension {0}")]
    ProviderNotFound(String),

    /// The track already has a live task
    #[error("track {0} is already queued")]
    AlreadyQueued(TrackId),

    /// Cannot perform operation in current state
    #[error("cannot {operation} track {track_id} in state {current_state}")]
    InvalidState {
        /// The track that is in an invalid state for the operation
        track_id: TrackId,
        /// The operation that was attempted (e.g., "pause", "retry")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Errors raised by a download provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider offered no stream for the track
    #[error("no streams found")]
    NoStreams,

    /// Stream selection produced no source indexes
    #[error("no sources to download")]
    NoSources,

    /// I/O failure while reading or writing track files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Temporary failure (network, rate limit, upstream hiccup)
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider does not support the requested operation
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Other provider failure
    #[error("{0}")]
    Other(String),
}

/// Classification of a stage failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Provider returned no streams
    NoStreams,
    /// Stream selection produced no sources
    NoSources,
    /// Provider call failed
    Provider,
    /// Local file-system failure
    Io,
    /// Merge found a selected source without a partial file
    MissingParts,
    /// The record could not be written
    Persistence,
    /// Stage task panicked
    Panicked,
    /// Progress stream ended without a final value
    Interrupted,
}

impl StageErrorKind {
    /// Lowercase name used in messages and error codes
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::NoStreams => "no_streams",
            StageErrorKind::NoSources => "no_sources",
            StageErrorKind::Provider => "provider",
            StageErrorKind::Io => "io",
            StageErrorKind::MissingParts => "missing_parts",
            StageErrorKind::Persistence => "persistence",
            StageErrorKind::Panicked => "panicked",
            StageErrorKind::Interrupted => "interrupted",
        }
    }
}

/// Structured stage failure, persisted as a record's `last_error`
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize, ToSchema)]
#[error("{stage} failed for track {track_id}: {message}")]
pub struct StageError {
    /// Failure classification
    pub kind: StageErrorKind,
    /// Stage that failed
    pub stage: StageKind,
    /// Track the stage belonged to
    pub track_id: TrackId,
    /// Human-readable message
    pub message: String,
    /// Underlying cause, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Record status at the time of failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_status: Option<Status>,
}

impl StageError {
    /// Create a stage error without cause or status
    pub fn new(
        kind: StageErrorKind,
        stage: StageKind,
        track_id: TrackId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            stage,
            track_id,
            message: message.into(),
            cause: None,
            record_status: None,
        }
    }

    /// Attach an underlying cause
    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Attach the record status observed when the failure happened
    pub fn with_status(mut self, status: Status) -> Self {
        self.record_status = Some(status);
        self
    }

    /// Wrap a provider error raised while running `stage`
    pub fn from_provider(error: ProviderError, stage: StageKind, track_id: TrackId) -> Self {
        let kind = match &error {
            ProviderError::NoStreams => StageErrorKind::NoStreams,
            ProviderError::NoSources => StageErrorKind::NoSources,
            ProviderError::Io(_) => StageErrorKind::Io,
            _ => StageErrorKind::Provider,
        };
        let message = error.to_string();
        Self::new(kind, stage, track_id, message)
    }

    /// Wrap a store failure raised while persisting `stage`
    pub fn persistence(stage: StageKind, track_id: TrackId, error: &Error) -> Self {
        Self::new(
            StageErrorKind::Persistence,
            stage,
            track_id,
            "failed to persist stage progress",
        )
        .with_cause(error)
    }

    /// Whether a fresh attempt of the failed stage could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            StageErrorKind::NoStreams | StageErrorKind::NoSources | StageErrorKind::MissingParts
        )
    }
}

/// API error response format
///
/// This structure is returned by API endpoints when an error occurs.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "not_found",
///     "message": "download not found: abc",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "already_queued")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Config { .. } => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,
            Error::Database(DatabaseError::NotFound(_)) => 404,

            // 409 Conflict
            Error::AlreadyQueued(_) => 409,
            Error::InvalidState { .. } => 409,

            // 422 Unprocessable Entity - request names an unknown provider
            Error::ProviderNotFound(_) => 422,

            // 502 Bad Gateway - provider failures
            Error::Provider(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,

            // 500 Internal Server Error
            Error::Database(_)
            | Error::Sqlx(_)
            | Error::Stage(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(DatabaseError::NotFound(_)) => "not_found",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Provider(_) => "provider_error",
            Error::Stage(_) => "stage_failed",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::NotFound(_) => "not_found",
            Error::ProviderNotFound(_) => "provider_not_found",
            Error::AlreadyQueued(_) => "already_queued",
            Error::InvalidState { .. } => "invalid_state",
            Error::ShuttingDown => "shutting_down",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::AlreadyQueued(track_id) => Some(serde_json::json!({
                "track_id": track_id,
            })),
            Error::InvalidState {
                track_id,
                operation,
                current_state,
            } => Some(serde_json::json!({
                "track_id": track_id,
                "operation": operation,
                "current_state": current_state,
            })),
            Error::ProviderNotFound(extension_id) => Some(serde_json::json!({
                "extension_id": extension_id,
            })),
            Error::Stage(stage_error) => serde_json::to_value(stage_error).ok(),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
