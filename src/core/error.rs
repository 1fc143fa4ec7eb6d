//! Error types and handling for the relay.
//!
//! [`AppError`] is the single error type handlers return. It renders as an
//! OpenAI-style `{"error": {...}}` body by default and can be mirrored into the
//! native error shape of any client protocol with [`AppError::protocol_body`].

use crate::core::error_types::{
    error_type_for_status, google_status_for, ERROR_CODE_RESOURCE_EXHAUSTED, ERROR_TYPE_API,
    ERROR_TYPE_INVALID_REQUEST,
};
use crate::transformer::Protocol;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Every credential able to serve the model is quota-exceeded.
    #[error("All the models of '{model}' are quota exceeded")]
    NoCandidate { model: String },

    /// No credential in the pool serves the model at all.
    #[error("unknown provider for model {0}")]
    UnknownModel(String),

    /// Non-retryable backend failure, passed through with the backend's status and body.
    #[error("Upstream error {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    /// The translation entry for this protocol pair cannot stream.
    #[error("Streaming not supported")]
    StreamingUnsupported,

    /// Client disconnected before request completed
    #[error("Client closed request")]
    ClientDisconnect,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status code this error is surfaced with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    e.status()
                        .and_then(|s| StatusCode::from_u16(s.as_u16()).ok())
                        .unwrap_or(StatusCode::BAD_GATEWAY)
                }
            }
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) | AppError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            AppError::NoCandidate { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream { status, .. } => *status,
            AppError::StreamingUnsupported => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Whether the failover loop treats this error as a per-credential quota hit.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, AppError::Upstream { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS)
    }

    /// Human readable message. Upstream bodies are unwrapped when they carry an
    /// `error.message` field.
    pub fn message(&self) -> String {
        match self {
            AppError::Upstream { body, .. } => upstream_message(body),
            AppError::BadRequest(msg) | AppError::Internal(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::UnknownModel(_) | AppError::BadRequest(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::StreamingUnsupported | AppError::Internal(_) => ERROR_TYPE_API,
            other => error_type_for_status(other.status_code().as_u16()),
        }
    }

    fn code(&self) -> Value {
        match self {
            AppError::NoCandidate { .. } => json!(ERROR_CODE_RESOURCE_EXHAUSTED),
            other => json!(other.status_code().as_u16()),
        }
    }

    /// Render this error in the native error shape of `protocol`.
    pub fn protocol_body(&self, protocol: Protocol) -> Value {
        let status = self.status_code().as_u16();
        match protocol {
            Protocol::Claude => json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.message(),
                }
            }),
            Protocol::Gemini | Protocol::GeminiCli => json!({
                "error": {
                    "code": status,
                    "message": self.message(),
                    "status": google_status_for(status),
                }
            }),
            Protocol::OpenAI | Protocol::OpenAIResponses | Protocol::Codex => json!({
                "error": {
                    "message": self.message(),
                    "type": self.error_type(),
                    "code": self.code(),
                }
            }),
        }
    }

    /// Build a full HTTP response in the caller's protocol.
    ///
    /// Upstream errors keep the backend body verbatim.
    pub fn into_protocol_response(self, protocol: Protocol) -> Response {
        if let AppError::ClientDisconnect = self {
            tracing::info!("Client disconnected before request completed");
        }
        let status = self.status_code();
        match self {
            AppError::Upstream { body, .. } => (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            other => (status, Json(other.protocol_body(protocol))).into_response(),
        }
    }
}

fn upstream_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_protocol_response(Protocol::OpenAI)
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
