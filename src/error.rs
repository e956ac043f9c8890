//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **DispatchError**: the failure taxonomy of the transcription pipeline
//!   (fetch, decode, backend, correlation, cache). Every component of the
//!   dispatch subsystem returns it.
//! - **AppError**: what an HTTP handler returns. It knows how to turn itself
//!   into a JSON response with a sensible status code.
//!
//! ## Propagation:
//! Inside a batch, a `DispatchError` is caught per job and replaced by the
//! sentinel result. In the single-shot API it travels straight to the caller
//! as an `AppError`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of the transcription dispatch subsystem.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Fetching the audio resource failed or returned a non-success status
    #[error("network error: {0}")]
    Network(String),

    /// The container or codec rejected the bytes
    #[error("decode error: {0}")]
    Decode(String),

    /// The backend never announced readiness, or its context went away
    #[error("backend not ready: {0}")]
    BackendUnavailable(String),

    /// A single-request backend already has an outstanding call
    #[error("already processing another request, please wait")]
    BackendBusy,

    /// No matching response arrived before the deadline
    #[error("transcription timeout ({0}s)")]
    Timeout(u64),

    /// The remote service answered with a shape we do not understand
    #[error("unrecognized response shape: {0}")]
    Parse(String),

    /// A cooperative stop was observed before the job started
    #[error("cancelled before dispatch")]
    Cancelled,

    /// The backend itself reported a failure
    #[error("backend error: {0}")]
    Backend(String),

    /// The durable cache could not be read or written
    #[error("cache storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Short machine-readable code, used in logs and JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Network(_) => "network_error",
            DispatchError::Decode(_) => "decode_error",
            DispatchError::BackendUnavailable(_) => "backend_unavailable",
            DispatchError::BackendBusy => "backend_busy",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Parse(_) => "parse_error",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Backend(_) => "backend_error",
            DispatchError::Storage(_) => "storage_error",
        }
    }
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Data validation failed (400)
/// - **Dispatch**: A transcription failed; the status depends on why
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Dispatch(DispatchError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Dispatch(err) => write!(f, "Transcription failed: {}", err),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::Dispatch(err) => {
                let status = match err {
                    DispatchError::Network(_) | DispatchError::Backend(_) | DispatchError::Parse(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    DispatchError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    DispatchError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    DispatchError::BackendBusy | DispatchError::Cancelled => StatusCode::CONFLICT,
                    DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                    DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
        }
    }
}

/// Every error leaves as JSON:
///
/// ```json
/// { "error": { "type": "backend_busy", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        AppError::Dispatch(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Malformed JSON is almost always the client's fault, hence 400.
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
