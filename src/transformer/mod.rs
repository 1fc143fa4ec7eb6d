//! Protocol translation.
//!
//! Each wire protocol has a codec implementing [`Transformer`] with four hooks:
//!
//! 1. `transform_request_out`: client request → Unified Internal Format (UIF)
//! 2. `transform_request_in`: UIF → backend request
//! 3. `transform_response_in`: backend response → UIF
//! 4. `transform_response_out`: UIF → client response
//!
//! ```text
//! Client Request
//!     ↓
//! [transform_request_out]  ← Normalize to UIF
//!     ↓
//! pair_tool_calls / ToolNameMap
//!     ↓
//! [transform_request_in]   ← Adapt to backend
//!     ↓
//! Backend
//!     ↓
//! [transform_response_in]  ← Parse backend response
//!     ↓
//! StreamState (streaming only)
//!     ↓
//! [transform_response_out] ← Format for client
//! ```
//!
//! A [`Translation`] is the entry for one `(client, backend)` pair and the
//! [`TranslatorRegistry`] holds one entry per pair.

pub mod anthropic;
pub mod gemini;
pub mod gemini_cli;
pub mod openai;
pub mod pairing;
pub mod responses;
pub mod schema;
pub mod stream;
pub mod tool_names;
pub mod unified;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;

pub use pairing::pair_tool_calls;
pub use stream::{SseFrame, SseParser, StreamDelta, StreamState};
pub use tool_names::ToolNameMap;
pub use unified::*;

pub use crate::core::error::Result;
use crate::core::AppError;

use stream::{DecoderState, EncoderState, Framing};

// ============================================================================
// Transformer Trait
// ============================================================================

/// Codec between one wire protocol and the Unified Internal Format.
pub trait Transformer: Send + Sync {
    /// Get the protocol this transformer handles.
    fn protocol(&self) -> Protocol;

    /// Client request → UIF.
    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest>;

    /// UIF → backend request.
    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value>;

    /// Backend response → UIF.
    fn transform_response_in(&self, raw: Value, original_model: &str) -> Result<UnifiedResponse>;

    /// UIF → client response.
    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value>;

    /// Decode one backend stream payload (the data of one SSE event).
    ///
    /// Returns a vector because one backend chunk may carry several deltas.
    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>>;

    /// Encode one block event as client frames.
    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>>;

    /// Longest tool name the backend accepts, if it enforces one.
    fn tool_name_limit(&self) -> Option<usize> {
        None
    }
}

/// Codec for `protocol`.
pub fn transformer_for(protocol: Protocol) -> Arc<dyn Transformer> {
    match protocol {
        Protocol::OpenAI => Arc::new(openai::OpenAITransformer::new()),
        Protocol::OpenAIResponses => Arc::new(responses::ResponsesTransformer::new()),
        Protocol::Codex => Arc::new(responses::ResponsesTransformer::codex()),
        Protocol::Claude => Arc::new(anthropic::AnthropicTransformer::new()),
        Protocol::Gemini => Arc::new(gemini::GeminiTransformer::new()),
        Protocol::GeminiCli => Arc::new(gemini_cli::GeminiCliTransformer::new()),
    }
}

// ============================================================================
// In-band Errors
// ============================================================================

/// Detect an error object delivered inside a successful HTTP response or stream.
///
/// Rate-limit errors map to 429 so the failover loop treats them like a
/// backend 429. The backend payload is kept verbatim as the error body.
pub fn in_band_error(protocol: Protocol, value: &Value) -> Option<AppError> {
    let value = match protocol {
        Protocol::GeminiCli => value.get("response").unwrap_or(value),
        _ => value,
    };
    let kind = value.get("type").and_then(|t| t.as_str());
    let error = match value.get("error") {
        Some(error) if error.is_object() => error,
        _ if kind == Some("error") => value,
        _ if kind == Some("response.failed") => value.pointer("/response/error")?,
        _ => return None,
    };

    let status = error
        .get("code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .or_else(|| {
            ["type", "code", "status"]
                .iter()
                .filter_map(|field| error.get(*field).and_then(|v| v.as_str()))
                .find_map(status_for_error_kind)
        })
        .unwrap_or(500);

    Some(AppError::Upstream {
        status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body: value.to_string(),
    })
}

fn status_for_error_kind(kind: &str) -> Option<u16> {
    match kind {
        "rate_limit_error" | "rate_limit_exceeded" | "RESOURCE_EXHAUSTED"
        | "insufficient_quota" => Some(429),
        "overloaded_error" => Some(529),
        "authentication_error" | "UNAUTHENTICATED" => Some(401),
        "invalid_request_error" | "INVALID_ARGUMENT" => Some(400),
        _ => None,
    }
}

// ============================================================================
// Translation Entries
// ============================================================================

/// What a response transform knows about the request it answers.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    /// Model the caller asked for
    pub model: String,
    /// Request body as the caller sent it
    pub original_request: Value,
    /// Request body as sent to the backend
    pub translated_request: Value,
}

impl ResponseContext {
    pub fn new(model: impl Into<String>, original_request: Value, translated_request: Value) -> Self {
        Self {
            model: model.into(),
            original_request,
            translated_request,
        }
    }
}

/// Conversion entry for one `(client, backend)` protocol pair.
pub trait Translation: Send + Sync {
    /// Rewrite a client request body for the backend.
    fn request(&self, model: &str, body: Value, stream: bool) -> Result<Value>;

    /// Convert one backend stream payload into client frames.
    fn response_stream(
        &self,
        ctx: &ResponseContext,
        chunk: &[u8],
        state: &mut StreamState,
    ) -> Result<Vec<SseFrame>>;

    /// Convert a complete backend response body.
    fn response_non_stream(&self, ctx: &ResponseContext, body: &[u8]) -> Result<Value>;

    /// Frames closing a stream that ended without a completion signal.
    fn finish_stream(&self, ctx: &ResponseContext, state: &mut StreamState) -> Result<Vec<SseFrame>>;

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Whether requests and responses pass through unchanged.
    fn is_identity(&self) -> bool {
        false
    }
}

/// Same protocol on both sides: bodies and events are forwarded as they are.
#[derive(Debug, Clone, Copy)]
pub struct Passthrough {
    protocol: Protocol,
}

impl Passthrough {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }
}

impl Translation for Passthrough {
    fn request(&self, _model: &str, body: Value, _stream: bool) -> Result<Value> {
        Ok(body)
    }

    fn response_stream(
        &self,
        _ctx: &ResponseContext,
        chunk: &[u8],
        _state: &mut StreamState,
    ) -> Result<Vec<SseFrame>> {
        let text = String::from_utf8_lossy(chunk);
        // The bridge writes its own terminal sentinel
        if text.trim() == "[DONE]" {
            return Ok(vec![]);
        }
        let value: Option<Value> = serde_json::from_str(&text).ok();
        if let Some(err) = value.as_ref().and_then(|v| in_band_error(self.protocol, v)) {
            return Err(err);
        }
        let event = match stream::framing_for(self.protocol) {
            Framing::EventNamed => value
                .as_ref()
                .and_then(|v| v.get("type"))
                .and_then(|t| t.as_str())
                .map(String::from),
            _ => None,
        };
        Ok(vec![SseFrame {
            event,
            data: text.into_owned(),
        }])
    }

    fn response_non_stream(&self, _ctx: &ResponseContext, body: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(body)?;
        match in_band_error(self.protocol, &value) {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    fn finish_stream(&self, _ctx: &ResponseContext, _state: &mut StreamState) -> Result<Vec<SseFrame>> {
        Ok(vec![])
    }

    fn is_identity(&self) -> bool {
        true
    }
}

/// Conversion through the Unified Internal Format.
pub struct ViaUnified {
    client: Arc<dyn Transformer>,
    backend: Arc<dyn Transformer>,
}

impl ViaUnified {
    pub fn new(client: Arc<dyn Transformer>, backend: Arc<dyn Transformer>) -> Self {
        Self { client, backend }
    }

    /// Short → original tool names for this request, when the backend shortens them.
    fn tool_names(&self, ctx: &ResponseContext) -> Result<Option<ToolNameMap>> {
        let Some(limit) = self.backend.tool_name_limit() else {
            return Ok(None);
        };
        let original = self.client.transform_request_out(ctx.original_request.clone())?;
        let map = ToolNameMap::for_request(&original, limit);
        Ok((!map.is_empty()).then_some(map))
    }
}

impl Translation for ViaUnified {
    fn request(&self, model: &str, body: Value, stream: bool) -> Result<Value> {
        let mut unified = self.client.transform_request_out(body)?;
        if !model.is_empty() {
            unified.model = model.to_string();
        }
        unified.parameters.stream = stream;
        unified.messages = pair_tool_calls(std::mem::take(&mut unified.messages));

        if let Some(limit) = self.backend.tool_name_limit() {
            let map = ToolNameMap::for_request(&unified, limit);
            if !map.is_empty() {
                tracing::debug!(count = map.restore_map().len(), "Shortening tool names");
                map.apply(&mut unified);
            }
        }

        self.backend.transform_request_in(&unified)
    }

    fn response_stream(
        &self,
        ctx: &ResponseContext,
        chunk: &[u8],
        state: &mut StreamState,
    ) -> Result<Vec<SseFrame>> {
        if !state.has_tool_names() {
            let restore = self
                .tool_names(ctx)?
                .map(|map| map.restore_map())
                .unwrap_or_default();
            state.set_tool_names(restore);
        }

        let deltas = self
            .backend
            .transform_stream_chunk_in(chunk, &mut state.decoder)?;
        let mut frames = Vec::new();
        for delta in deltas {
            for unified in state.apply(delta) {
                frames.extend(
                    self.client
                        .transform_stream_chunk_out(&unified, &mut state.encoder)?,
                );
            }
        }
        Ok(frames)
    }

    fn response_non_stream(&self, ctx: &ResponseContext, body: &[u8]) -> Result<Value> {
        let raw: Value = serde_json::from_slice(body)?;
        let mut unified = self.backend.transform_response_in(raw, &ctx.model)?;

        if let Some(map) = self.tool_names(ctx)? {
            for content in &mut unified.content {
                if let UnifiedContent::ToolUse { name, .. } = content {
                    *name = map.restore(name).to_string();
                }
            }
        }

        self.client.transform_response_out(&unified)
    }

    fn finish_stream(&self, _ctx: &ResponseContext, state: &mut StreamState) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        for unified in state.finish() {
            frames.extend(
                self.client
                    .transform_stream_chunk_out(&unified, &mut state.encoder)?,
            );
        }
        Ok(frames)
    }
}

/// Direct Gemini ↔ Gemini CLI conversion: only the envelope changes.
#[derive(Debug, Clone, Copy)]
pub struct GeminiCliEnvelope {
    client: Protocol,
}

impl GeminiCliEnvelope {
    /// Gemini caller, Gemini CLI backend.
    pub fn wrapping() -> Self {
        Self {
            client: Protocol::Gemini,
        }
    }

    /// Gemini CLI caller, Gemini backend.
    pub fn unwrapping() -> Self {
        Self {
            client: Protocol::GeminiCli,
        }
    }

    fn convert_response(&self, value: Value) -> Result<Value> {
        let inner = gemini_cli::unwrap_response(value);
        if let Some(err) = in_band_error(Protocol::Gemini, &inner) {
            return Err(err);
        }
        Ok(match self.client {
            Protocol::GeminiCli => gemini_cli::wrap_response(inner),
            _ => inner,
        })
    }
}

impl Translation for GeminiCliEnvelope {
    fn request(&self, model: &str, body: Value, _stream: bool) -> Result<Value> {
        match self.client {
            Protocol::GeminiCli => Ok(gemini_cli::unwrap_request(body)?.1),
            _ => Ok(gemini_cli::wrap_request(model, body)),
        }
    }

    fn response_stream(
        &self,
        _ctx: &ResponseContext,
        chunk: &[u8],
        _state: &mut StreamState,
    ) -> Result<Vec<SseFrame>> {
        let value: Value = serde_json::from_slice(chunk)?;
        let converted = self.convert_response(value)?;
        Ok(vec![SseFrame::data(converted.to_string())])
    }

    fn response_non_stream(&self, _ctx: &ResponseContext, body: &[u8]) -> Result<Value> {
        self.convert_response(serde_json::from_slice(body)?)
    }

    fn finish_stream(&self, _ctx: &ResponseContext, _state: &mut StreamState) -> Result<Vec<SseFrame>> {
        Ok(vec![])
    }
}

// ============================================================================
// Translator Registry
// ============================================================================

/// Translation entries keyed by `(client, backend)` protocol.
///
/// A pair without an entry is passed through unchanged.
#[derive(Default)]
pub struct TranslatorRegistry {
    entries: HashMap<(Protocol, Protocol), Arc<dyn Translation>>,
}

impl TranslatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an entry for every pair of supported protocols.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for client in Protocol::ALL {
            for backend in Protocol::ALL {
                let entry: Arc<dyn Translation> = match (client, backend) {
                    (c, b) if c == b => Arc::new(Passthrough::new(c)),
                    (Protocol::Gemini, Protocol::GeminiCli) => Arc::new(GeminiCliEnvelope::wrapping()),
                    (Protocol::GeminiCli, Protocol::Gemini) => {
                        Arc::new(GeminiCliEnvelope::unwrapping())
                    }
                    (c, b) => Arc::new(ViaUnified::new(transformer_for(c), transformer_for(b))),
                };
                registry.register(client, backend, entry);
            }
        }
        tracing::debug!(pairs = registry.len(), "Translator registry initialized");
        registry
    }

    /// Register the entry for a pair, returning the one it replaces.
    pub fn register(
        &mut self,
        from: Protocol,
        to: Protocol,
        translation: Arc<dyn Translation>,
    ) -> Option<Arc<dyn Translation>> {
        let previous = self.entries.insert((from, to), translation);
        if previous.is_some() {
            tracing::warn!(%from, %to, "Replacing existing translation entry");
        }
        previous
    }

    pub fn get(&self, from: Protocol, to: Protocol) -> Option<&Arc<dyn Translation>> {
        self.entries.get(&(from, to))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether bodies for this pair are rewritten at all.
    pub fn need_convert(&self, from: Protocol, to: Protocol) -> bool {
        self.get(from, to).is_some_and(|t| !t.is_identity())
    }

    pub fn supports_streaming(&self, from: Protocol, to: Protocol) -> bool {
        self.get(from, to).map_or(true, |t| t.supports_streaming())
    }

    pub fn request(
        &self,
        from: Protocol,
        to: Protocol,
        model: &str,
        body: Value,
        stream: bool,
    ) -> Result<Value> {
        match self.get(from, to) {
            Some(translation) => translation.request(model, body, stream),
            None => Ok(body),
        }
    }

    pub fn response_stream(
        &self,
        from: Protocol,
        to: Protocol,
        ctx: &ResponseContext,
        chunk: &[u8],
        state: &mut StreamState,
    ) -> Result<Vec<SseFrame>> {
        match self.get(from, to) {
            Some(translation) => translation.response_stream(ctx, chunk, state),
            None => Passthrough::new(from).response_stream(ctx, chunk, state),
        }
    }

    pub fn response_non_stream(
        &self,
        from: Protocol,
        to: Protocol,
        ctx: &ResponseContext,
        body: &[u8],
    ) -> Result<Value> {
        match self.get(from, to) {
            Some(translation) => translation.response_non_stream(ctx, body),
            None => Passthrough::new(from).response_non_stream(ctx, body),
        }
    }

    pub fn finish_stream(
        &self,
        from: Protocol,
        to: Protocol,
        ctx: &ResponseContext,
        state: &mut StreamState,
    ) -> Result<Vec<SseFrame>> {
        match self.get(from, to) {
            Some(translation) => translation.finish_stream(ctx, state),
            None => Ok(vec![]),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
