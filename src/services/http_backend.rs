//! HTTP backend clients for each provider protocol.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

use super::backend::{BackendClient, BackendError, BackendStream, BackendStreamSender, ClientIdentity};
use super::model_registry::ModelInfo;
use crate::core::config::CredentialConfig;
use crate::core::StreamCancelHandle;
use crate::transformer::stream::SseParser;
use crate::transformer::{in_band_error, Protocol};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Longest backend error body kept for the caller.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

pub fn default_base_url(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::OpenAI | Protocol::OpenAIResponses => "https://api.openai.com/v1",
        Protocol::Claude => "https://api.anthropic.com",
        Protocol::Gemini => "https://generativelanguage.googleapis.com",
        Protocol::GeminiCli => "https://cloudcode-pa.googleapis.com",
        Protocol::Codex => "https://chatgpt.com/backend-api/codex",
    }
}

/// Models assumed for a credential whose configuration lists none.
pub fn default_models(protocol: Protocol) -> &'static [&'static str] {
    match protocol {
        Protocol::OpenAI | Protocol::OpenAIResponses => &["gpt-4o", "gpt-4o-mini", "gpt-4.1"],
        Protocol::Claude => &["claude-sonnet-4-20250514", "claude-opus-4-20250514"],
        Protocol::Gemini | Protocol::GeminiCli => {
            &["gemini-2.5-pro", "gemini-2.5-flash", "gemini-2.5-flash-lite"]
        }
        Protocol::Codex => &["gpt-5", "gpt-5-codex"],
    }
}

fn owner(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::OpenAI | Protocol::OpenAIResponses | Protocol::Codex => "openai",
        Protocol::Claude => "anthropic",
        Protocol::Gemini | Protocol::GeminiCli => "google",
    }
}

#[derive(Debug, Clone, Copy)]
enum Auth<'a> {
    Bearer(&'a str),
    XApiKey(&'a str),
    GoogApiKey(&'a str),
}

/// One credential reached over HTTP.
#[derive(Clone)]
pub struct HttpBackendClient {
    id: String,
    protocol: Protocol,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
    project_id: Option<String>,
    email: Option<String>,
    models: Vec<ModelInfo>,
    request_timeout: Duration,
}

impl HttpBackendClient {
    pub fn from_config(config: &CredentialConfig, http: reqwest::Client, request_timeout: Duration) -> Self {
        let owned_by = owner(config.provider);
        let models = if config.models.is_empty() {
            default_models(config.provider)
                .iter()
                .map(|id| ModelInfo::new(*id, owned_by))
                .collect()
        } else {
            config
                .models
                .iter()
                .map(|m| ModelInfo::from_config(m, owned_by))
                .collect()
        };
        Self {
            id: config.id.clone(),
            protocol: config.provider,
            http,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(config.provider).to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            project_id: config.project_id.clone(),
            email: config.email.clone(),
            models,
            request_timeout,
        }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        match self.protocol {
            Protocol::OpenAI => format!("{}/chat/completions", self.base_url),
            Protocol::OpenAIResponses | Protocol::Codex => format!("{}/responses", self.base_url),
            Protocol::Claude => format!("{}/v1/messages", self.base_url),
            Protocol::Gemini if stream => format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            ),
            Protocol::Gemini => format!("{}/v1beta/models/{}:generateContent", self.base_url, model),
            Protocol::GeminiCli if stream => {
                format!("{}/v1internal:streamGenerateContent?alt=sse", self.base_url)
            }
            Protocol::GeminiCli => format!("{}/v1internal:generateContent", self.base_url),
        }
    }

    fn auth(&self) -> Option<Auth<'_>> {
        let secret = self.api_key.as_deref().or(self.access_token.as_deref());
        match self.protocol {
            Protocol::Claude => self.api_key.as_deref().map(Auth::XApiKey).or(secret.map(Auth::Bearer)),
            Protocol::Gemini => self.api_key.as_deref().map(Auth::GoogApiKey).or(secret.map(Auth::Bearer)),
            Protocol::GeminiCli => self
                .access_token
                .as_deref()
                .or(self.api_key.as_deref())
                .map(Auth::Bearer),
            _ => secret.map(Auth::Bearer),
        }
    }

    /// Final per-provider adjustments to an outgoing body.
    fn prepare_body(&self, model: &str, mut body: Value, stream: bool) -> Value {
        match self.protocol {
            Protocol::GeminiCli => {
                body["model"] = json!(model);
                if let Some(project) = &self.project_id {
                    body["project"] = json!(project);
                }
            }
            // Codex only streams; the non-streaming path collects the stream.
            Protocol::Codex => body["stream"] = json!(true),
            Protocol::OpenAI | Protocol::OpenAIResponses | Protocol::Claude => {
                body["stream"] = json!(stream);
            }
            Protocol::Gemini => {}
        }
        body
    }

    fn build_request(&self, model: &str, body: &Value, stream: bool) -> reqwest::RequestBuilder {
        let mut request = self.http.post(self.endpoint(model, stream)).json(body);
        request = match self.auth() {
            Some(Auth::Bearer(token)) => request.header("Authorization", format!("Bearer {}", token)),
            Some(Auth::XApiKey(key)) => request.header("x-api-key", key),
            Some(Auth::GoogApiKey(key)) => request.header("x-goog-api-key", key),
            None => request,
        };
        if self.protocol == Protocol::Claude {
            request = request.header("anthropic-version", ANTHROPIC_VERSION);
        }
        if stream || self.protocol == Protocol::Codex {
            request = request.header("Accept", "text/event-stream");
        }
        request
    }

    async fn error_from_response(response: reqwest::Response) -> BackendError {
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_BYTES {
            let mut cut = MAX_ERROR_BODY_BYTES;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        BackendError::new(status, body)
    }

    /// Read a Codex event stream to completion and return the final response object.
    async fn collect_codex_response(&self, response: reqwest::Response) -> Result<Bytes, BackendError> {
        let mut parser = SseParser::new();
        let mut bytes = response.bytes_stream();
        let mut events = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(BackendError::transport)?;
            events.extend(parser.parse(&chunk));
        }
        events.extend(parser.finish());

        for event in events {
            let Some(data) = event.data else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&data) else {
                continue;
            };
            if let Some(err) = in_band_error(Protocol::Codex, &value) {
                return Err(err.into());
            }
            let kind = value.get("type").and_then(|t| t.as_str());
            if matches!(kind, Some("response.completed" | "response.incomplete")) {
                let response = value.get("response").cloned().unwrap_or(Value::Null);
                return Ok(Bytes::from(response.to_string()));
            }
        }
        Err(BackendError::transport("stream closed before response.completed"))
    }
}

/// Forward backend SSE payloads into `tx` until the body ends, the receiver goes
/// away or `cancel` fires.
async fn pump_events(
    client_id: String,
    request: reqwest::RequestBuilder,
    tx: BackendStreamSender,
    cancel: StreamCancelHandle,
) {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        response = request.send() => response,
    };
    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            let err = HttpBackendClient::error_from_response(response).await;
            tracing::debug!(client = %client_id, status = %err.status, "Backend rejected stream");
            let _ = tx.errors.send(err).await;
            return;
        }
        Err(e) => {
            let _ = tx.errors.send(BackendError::transport(e)).await;
            return;
        }
    };

    let mut parser = SseParser::new();
    let mut bytes = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(client = %client_id, "Backend stream cancelled");
                return;
            }
            next = bytes.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for event in parser.parse(&chunk) {
                    let Some(data) = event.data else { continue };
                    if tx.chunks.send(Bytes::from(data)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx.errors.send(BackendError::transport(e)).await;
                return;
            }
            None => break,
        }
    }
    if let Some(data) = parser.finish().and_then(|event| event.data) {
        let _ = tx.chunks.send(Bytes::from(data)).await;
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            email: self.email.clone(),
            project_id: self.project_id.clone(),
            has_api_key: self.api_key.is_some(),
        }
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    async fn send_raw_message(&self, model: &str, body: Value) -> Result<Bytes, BackendError> {
        let body = self.prepare_body(model, body, false);
        let response = self
            .build_request(model, &body, false)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(BackendError::transport)?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        if self.protocol == Protocol::Codex {
            return self.collect_codex_response(response).await;
        }
        response.bytes().await.map_err(BackendError::transport)
    }

    async fn send_raw_message_stream(
        &self,
        model: &str,
        body: Value,
        cancel: StreamCancelHandle,
    ) -> BackendStream {
        let body = self.prepare_body(model, body, true);
        let request = self.build_request(model, &body, true);
        let (tx, stream) = BackendStream::channel();
        tokio::spawn(pump_events(self.id.clone(), request, tx, cancel));
        stream
    }
}
