//! Backend client capability surface.
//!
//! One [`BackendClient`] per credential. Raw sends take a body already in the
//! client's own protocol; `send_message` and `send_message_stream` accept
//! unified conversation content and encode it with the client's codec first.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use super::model_registry::ModelInfo;
use crate::core::{AppError, StreamCancelHandle};
use crate::transformer::{transformer_for, Protocol, UnifiedMessage, UnifiedRequest, UnifiedTool};

/// Capacity of the chunk and error channels of one backend stream.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Failure reported by a backend, with the status the caller should see.
#[derive(Debug, Clone, Error)]
#[error("backend returned {status}: {body}")]
pub struct BackendError {
    pub status: StatusCode,
    pub body: String,
}

impl BackendError {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The backend could not be reached or its response could not be read.
    pub fn transport(message: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            serde_json::json!({"error": {"message": message.to_string(), "type": "upstream_error"}})
                .to_string(),
        )
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        AppError::Upstream {
            status: err.status,
            body: err.body,
        }
    }
}

impl From<AppError> for BackendError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Upstream { status, body } => Self::new(status, body),
            other => Self::new(other.status_code(), other.to_string()),
        }
    }
}

/// Chunk and error channels of one streaming backend call.
///
/// Each chunk is the data payload of one backend SSE event. Both channels close
/// when the backend reader finishes.
pub struct BackendStream {
    pub chunks: mpsc::Receiver<Bytes>,
    pub errors: mpsc::Receiver<BackendError>,
}

/// Producer half of a [`BackendStream`].
#[derive(Clone)]
pub struct BackendStreamSender {
    pub chunks: mpsc::Sender<Bytes>,
    pub errors: mpsc::Sender<BackendError>,
}

impl BackendStream {
    pub fn channel() -> (BackendStreamSender, BackendStream) {
        let (chunk_tx, chunk_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (
            BackendStreamSender {
                chunks: chunk_tx,
                errors: error_tx,
            },
            BackendStream {
                chunks: chunk_rx,
                errors: error_rx,
            },
        )
    }

    /// A stream that fails immediately with `err`.
    pub fn failed(err: BackendError) -> Self {
        let (tx, stream) = Self::channel();
        // Fresh channel with spare capacity
        let _ = tx.errors.try_send(err);
        stream
    }
}

/// Who a credential is, for log lines only.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub email: Option<String>,
    pub project_id: Option<String>,
    pub has_api_key: bool,
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(email) = &self.email {
            parts.push(format!("email={}", email));
        }
        if let Some(project) = &self.project_id {
            parts.push(format!("project={}", project));
        }
        if self.has_api_key {
            parts.push("api_key".to_string());
        }
        f.write_str(&parts.join(" "))
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Stable credential id.
    fn id(&self) -> &str;

    /// Wire protocol the credential speaks.
    fn protocol(&self) -> Protocol;

    fn identity(&self) -> ClientIdentity;

    fn models(&self) -> Vec<ModelInfo>;

    fn can_provide_model(&self, model: &str) -> bool {
        self.models().iter().any(|m| m.id == model)
    }

    /// Send a body already in this client's protocol and return the response body.
    async fn send_raw_message(&self, model: &str, body: Value) -> Result<Bytes, BackendError>;

    /// Start a streaming call. Errors, including setup failures, arrive on the error channel.
    async fn send_raw_message_stream(
        &self,
        model: &str,
        body: Value,
        cancel: StreamCancelHandle,
    ) -> BackendStream;

    async fn send_message(
        &self,
        model: &str,
        messages: Vec<UnifiedMessage>,
        tools: Vec<UnifiedTool>,
    ) -> Result<Bytes, BackendError> {
        let body = encode_for(self.protocol(), model, messages, tools, false)?;
        self.send_raw_message(model, body).await
    }

    async fn send_message_stream(
        &self,
        model: &str,
        messages: Vec<UnifiedMessage>,
        tools: Vec<UnifiedTool>,
        cancel: StreamCancelHandle,
    ) -> BackendStream {
        match encode_for(self.protocol(), model, messages, tools, true) {
            Ok(body) => self.send_raw_message_stream(model, body, cancel).await,
            Err(err) => BackendStream::failed(err),
        }
    }
}

fn encode_for(
    protocol: Protocol,
    model: &str,
    messages: Vec<UnifiedMessage>,
    tools: Vec<UnifiedTool>,
    stream: bool,
) -> Result<Value, BackendError> {
    let mut request = UnifiedRequest::new(model, messages).with_stream(stream);
    request.tools = tools;
    Ok(transformer_for(protocol).transform_request_in(&request)?)
}
