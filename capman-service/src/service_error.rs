//! # Service Error Types
//!
//! HTTP-facing error handling for the capman service. Engine failures
//! arrive as [`StructuredError`] values and map to status codes through
//! the code's own table; the response body always carries the full
//! structured record so clients can branch on `error_code` instead of
//! scraping messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use capman_plugin_sdk::error::{ErrorCode, StructuredError};
use serde_json::json;
use thiserror::Error;

/// Errors any handler in the service can produce.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A structured engine failure; carries its own status mapping.
    #[error("{0}")]
    Engine(#[from] StructuredError),

    /// Gateway-level authentication failures.
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Malformed or invalid request bodies.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Resolution failures surfaced directly by handlers.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// JSON serialization and deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// The structured record the response body carries.
    fn structured(&self) -> StructuredError {
        match self {
            ServiceError::Engine(error) => error.clone(),
            ServiceError::Auth { message } => {
                StructuredError::report(ErrorCode::AuthenticationFailed, "service", message).build()
            }
            ServiceError::InvalidRequest { message } => {
                StructuredError::report(ErrorCode::InvalidInput, "service", message).build()
            }
            ServiceError::NotFound { message } => {
                StructuredError::report(ErrorCode::PluginNotFound, "service", message).build()
            }
            ServiceError::Serialization(error) => {
                StructuredError::report(ErrorCode::JsonParseError, "service", error.to_string())
                    .build()
            }
            ServiceError::Internal { message } => {
                StructuredError::report(ErrorCode::InternalError, "service", message).build()
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let structured = self.structured();
        let status = StatusCode::from_u16(structured.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "error": structured }));
        (status, body).into_response()
    }
}
