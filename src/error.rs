//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`EngineError`]: everything that can go wrong inside the audio session engine
//!   (session bookkeeping, wire framing, recognition back-ends, storage, synthesis).
//!   These never reach an HTTP client directly; the WebSocket actor turns them into
//!   outbound `session_error` / `recognition_error` / `storage_error` messages.
//! - [`AppError`]: errors returned by the HTTP handlers, rendered as a JSON body by
//!   actix-web through the `ResponseError` trait.
//!
//! ## JSON error body
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failures produced by the session engine and its providers.
///
/// `Clone` so that one failure can be logged, counted and forwarded to the
/// client without re-deriving the message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Append or end for a session id that is not open on this connection.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// `audio_start` for an id that is already open.
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),

    /// The connection already holds the maximum number of open sessions.
    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimitReached(usize),

    /// Appending would grow the session buffer past its configured bound.
    #[error("session '{session_id}' would exceed the {limit} byte buffer limit")]
    BufferLimitExceeded { session_id: String, limit: usize },

    /// A wire frame could not be decoded (truncated input, bad lengths, unknown type).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The frame header announced a protocol version this codec does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Network level failure talking to a back-end (connect, send, unexpected close).
    #[error("transport error: {0}")]
    Transport(String),

    /// The back-end answered with an explicit error.
    #[error("backend error {code}: {message}")]
    Backend { code: i64, message: String },

    /// Language auto-detection was not confident enough to transcribe.
    #[error("language detection confidence too low: {0}")]
    LowConfidence(String),

    /// The recognition deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The owning connection went away before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Machine readable code sent to clients in `session_error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionAlreadyExists(_) => "session_already_exists",
            EngineError::SessionLimitReached(_) => "session_limit_reached",
            EngineError::BufferLimitExceeded { .. } => "buffer_limit_exceeded",
            EngineError::MalformedFrame(_) => "malformed_frame",
            EngineError::UnsupportedVersion(_) => "unsupported_version",
            EngineError::Transport(_) => "transport_error",
            EngineError::Backend { .. } => "backend_error",
            EngineError::LowConfidence(_) => "low_confidence",
            EngineError::Timeout(_) => "timeout",
            EngineError::Cancelled => "cancelled",
            EngineError::Storage(_) => "storage_error",
            EngineError::Synthesis(_) => "synthesis_error",
            EngineError::Config(_) => "config_error",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Transport(format!("request timed out: {}", err))
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned from HTTP handlers.
///
/// ## Status mapping
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
#[derive(Debug)]
pub enum AppError {
    /// Server-side failures
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration could not be loaded or providers could not be built from it
    ConfigError(String),

    /// A requested change failed validation
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Validation failures from `AppConfig::validate` arrive as anyhow errors, so they
/// surface to the caller as 400s rather than 500s.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Config(msg) => AppError::ValidationError(msg),
            EngineError::SessionNotFound(id) => AppError::NotFound(format!("session '{}'", id)),
            other => AppError::Internal(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
