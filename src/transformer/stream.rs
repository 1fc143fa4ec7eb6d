//! Streaming utilities for protocol conversion.
//!
//! - [`SseParser`] splits raw backend bytes into SSE events.
//! - [`SseFrame`] and [`framing_for`] render frames in each client protocol's framing.
//! - [`StreamState`] is the per-stream block state machine: backend decoders feed it
//!   [`StreamDelta`]s and it emits block-structured [`UnifiedStreamChunk`]s with
//!   strictly increasing indices.

use super::responses::ResponsesStreamState;
use super::{
    BlockDelta, Protocol, StopReason, UnifiedContent, UnifiedResponse, UnifiedStreamChunk,
    UnifiedUsage,
};
use serde_json::{json, Value};
use std::collections::HashMap;

// ============================================================================
// SSE Parser
// ============================================================================

/// SSE event parsed from stream.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

/// Incremental SSE parser. Bytes may split events and UTF-8 sequences anywhere.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every event completed by them.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = vec![];
        while let Some((pos, sep_len)) = find_event_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + sep_len).collect();
            let block = String::from_utf8_lossy(&block[..pos]);
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let block = String::from_utf8_lossy(&self.buffer).to_string();
        self.buffer.clear();
        parse_event_block(&block)
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => match &mut event.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => event.data = Some(value.to_string()),
            },
            _ => {}
        }
    }
    (event.data.is_some() || event.event.is_some()).then_some(event)
}

// ============================================================================
// Frames & Framing
// ============================================================================

/// One output frame before framing is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        SseFrame {
            event: None,
            data: data.into(),
        }
    }

    pub fn event(event: impl Into<String>, data: impl Into<String>) -> Self {
        SseFrame {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// Render with the given framing.
    pub fn render(&self, framing: Framing) -> String {
        match (framing, &self.event) {
            (Framing::EventNamed, Some(event)) => format_sse_event(Some(event), &self.data),
            _ => format_sse_data(&self.data),
        }
    }
}

/// Event-stream framing of a client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `event: <name>\ndata: <json>\n\n`
    EventNamed,
    /// `data: <json>\n\n`, terminated by `data: [DONE]\n\n`
    DataWithDone,
    /// `data: <json>\n\n` with no terminal sentinel
    DataOnly,
}

pub fn framing_for(protocol: Protocol) -> Framing {
    match protocol {
        Protocol::Claude | Protocol::OpenAIResponses | Protocol::Codex => Framing::EventNamed,
        Protocol::OpenAI => Framing::DataWithDone,
        Protocol::Gemini | Protocol::GeminiCli => Framing::DataOnly,
    }
}

/// Format an SSE event for transmission.
pub fn format_sse_event(event: Option<&str>, data: &str) -> String {
    let mut output = String::new();
    if let Some(event_name) = event {
        output.push_str("event: ");
        output.push_str(event_name);
        output.push('\n');
    }
    for line in data.lines() {
        output.push_str("data: ");
        output.push_str(line);
        output.push('\n');
    }
    output.push('\n');
    output
}

/// Format a simple data-only SSE event.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format the SSE done marker.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Terminal sentinel written after a normal end of stream, if the protocol has one.
pub fn done_frame(protocol: Protocol) -> Option<String> {
    (framing_for(protocol) == Framing::DataWithDone).then(format_sse_done)
}

/// Keep-alive frame for an idle stream.
pub fn keep_alive_frame(protocol: Protocol) -> String {
    match protocol {
        Protocol::Claude => format_sse_event(Some("ping"), r#"{"type":"ping"}"#),
        _ => ": keep-alive\n\n".to_string(),
    }
}

/// Error frame carrying `body` (already in the protocol's native error shape).
pub fn error_frame(protocol: Protocol, body: &Value) -> String {
    match framing_for(protocol) {
        Framing::EventNamed => format_sse_event(Some("error"), &body.to_string()),
        _ => format_sse_data(&body.to_string()),
    }
}

// ============================================================================
// Backend Deltas
// ============================================================================

/// Normalized content emitted by a backend stream decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// Message metadata known before any content
    MessageStart {
        id: Option<String>,
        model: Option<String>,
        usage: Option<UnifiedUsage>,
    },
    Text(String),
    Thinking(String),
    /// Signature for the open thinking block. Outside one, it opens a
    /// signature-only thinking block.
    ThinkingSignature(String),
    /// Opens a tool call whose arguments follow as fragments
    ToolCallStart { key: String, id: String, name: String },
    ToolCallArgs { key: String, fragment: String },
    /// A tool call delivered whole
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Stop reason reported ahead of completion
    StopReason(StopReason),
    Usage(UnifiedUsage),
    /// Backend signalled completion
    Finish {
        reason: Option<StopReason>,
        usage: Option<UnifiedUsage>,
    },
}

/// Scratch space for backend stream decoders, reset on every attempt.
#[derive(Debug, Default)]
pub struct DecoderState {
    /// Message metadata already reported for this attempt
    pub started: bool,
    /// Tool-call key by backend-side index (OpenAI `tool_calls[].index`, Claude block index)
    pub tool_keys: HashMap<u64, String>,
    /// Item kind by Responses `output_index`
    pub item_kinds: HashMap<u64, String>,
}

/// Scratch space for client stream encoders, kept for the life of the client stream.
#[derive(Debug, Default)]
pub struct EncoderState {
    pub id: String,
    pub model: String,
    pub created: i64,
    /// OpenAI tool-call index of the open tool block
    pub tool_index: Option<usize>,
    pub tool_count: usize,
    pub role_sent: bool,
    pub responses: ResponsesStreamState,
}

// ============================================================================
// Block State Machine
// ============================================================================

/// The currently open content block.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BlockState {
    #[default]
    Idle,
    Text { index: usize },
    Thinking { index: usize, signature: Option<String> },
    ToolCall {
        index: usize,
        key: String,
        id: String,
        name: String,
        /// Argument fragments concatenated verbatim
        arguments: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// Per-stream conversion state.
///
/// Owned by the single task bridging one client-visible stream. The decoder
/// half is reset on each backend attempt; the block machine and encoder state
/// survive failover so the caller sees one coherent message.
#[derive(Debug, Default)]
pub struct StreamState {
    pub decoder: DecoderState,
    pub encoder: EncoderState,
    block: BlockState,
    next_index: usize,
    message_started: bool,
    saw_tool_call: bool,
    finished: bool,
    usage: UnifiedUsage,
    stop_reason: Option<StopReason>,
    message_id: Option<String>,
    model: String,
    /// Shortened tool name -> original, for this request
    tool_names: Option<HashMap<String, String>>,
}

impl StreamState {
    pub fn new(model: impl Into<String>) -> Self {
        StreamState {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Start a new backend attempt for the same client stream.
    pub fn begin_attempt(&mut self) {
        self.decoder = DecoderState::default();
    }

    pub fn block(&self) -> &BlockState {
        &self.block
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn message_started(&self) -> bool {
        self.message_started
    }

    pub fn usage(&self) -> &UnifiedUsage {
        &self.usage
    }

    pub fn has_tool_names(&self) -> bool {
        self.tool_names.is_some()
    }

    pub fn set_tool_names(&mut self, restore: HashMap<String, String>) {
        self.tool_names = Some(restore);
    }

    fn restore_name(&self, name: String) -> String {
        self.tool_names
            .as_ref()
            .and_then(|map| map.get(&name).cloned())
            .unwrap_or(name)
    }

    /// Apply one backend delta and return the block events it produces.
    pub fn apply(&mut self, delta: StreamDelta) -> Vec<UnifiedStreamChunk> {
        if self.finished {
            tracing::debug!(?delta, "Ignoring delta after stream completion");
            return vec![];
        }

        let mut out = Vec::new();
        match delta {
            StreamDelta::MessageStart { id, model, usage } => {
                if self.message_id.is_none() {
                    self.message_id = id;
                }
                if let Some(model) = model.filter(|m| !m.is_empty()) {
                    if !self.message_started {
                        self.model = model;
                    }
                }
                if let Some(usage) = usage {
                    self.usage.merge(&usage);
                }
                self.ensure_message_start(&mut out);
            }
            StreamDelta::Text(text) => {
                if text.is_empty() {
                    return out;
                }
                self.ensure_message_start(&mut out);
                let index = self.enter(BlockKind::Text, &mut out);
                out.push(UnifiedStreamChunk::content_block_delta(
                    index,
                    BlockDelta::Text(text),
                ));
            }
            StreamDelta::Thinking(text) => {
                if text.is_empty() {
                    return out;
                }
                self.ensure_message_start(&mut out);
                let index = self.enter(BlockKind::Thinking, &mut out);
                out.push(UnifiedStreamChunk::content_block_delta(
                    index,
                    BlockDelta::Thinking(text),
                ));
            }
            StreamDelta::ThinkingSignature(sig) => {
                if !matches!(self.block, BlockState::Thinking { .. }) {
                    self.ensure_message_start(&mut out);
                    self.enter(BlockKind::Thinking, &mut out);
                }
                if let BlockState::Thinking { signature, .. } = &mut self.block {
                    *signature = Some(sig);
                }
            }
            StreamDelta::ToolCallStart { key, id, name } => {
                self.ensure_message_start(&mut out);
                self.open_tool_call(key, id, name, &mut out);
            }
            StreamDelta::ToolCallArgs { key, fragment } => match &mut self.block {
                BlockState::ToolCall {
                    key: open_key,
                    arguments,
                    ..
                } if *open_key == key => arguments.push_str(&fragment),
                _ => tracing::debug!(%key, "Dropping arguments for a tool call that is not open"),
            },
            StreamDelta::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.ensure_message_start(&mut out);
                let key = format!("whole-{}", self.next_index);
                self.open_tool_call(key, id, name, &mut out);
                if let BlockState::ToolCall { arguments: acc, .. } = &mut self.block {
                    acc.push_str(&arguments);
                }
            }
            StreamDelta::StopReason(reason) => self.stop_reason = Some(reason),
            StreamDelta::Usage(usage) => self.usage.merge(&usage),
            StreamDelta::Finish { reason, usage } => {
                if let Some(reason) = reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = usage {
                    self.usage.merge(&usage);
                }
                out.extend(self.finish());
            }
        }
        out
    }

    /// Close the stream: close any open block, then emit the message delta and stop.
    ///
    /// Idempotent; a stream that already finished yields nothing.
    pub fn finish(&mut self) -> Vec<UnifiedStreamChunk> {
        if self.finished {
            return vec![];
        }
        let mut out = Vec::new();
        self.ensure_message_start(&mut out);
        self.close_block(&mut out);

        let reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            self.stop_reason.unwrap_or_default()
        };
        out.push(UnifiedStreamChunk::message_delta(reason, self.usage.clone()));
        out.push(UnifiedStreamChunk::message_stop());
        self.finished = true;
        out
    }

    fn ensure_message_start(&mut self, out: &mut Vec<UnifiedStreamChunk>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
        self.message_id = Some(id.clone());
        out.push(UnifiedStreamChunk::message_start(UnifiedResponse {
            id,
            model: self.model.clone(),
            content: vec![],
            stop_reason: None,
            usage: self.usage.clone(),
        }));
    }

    /// Make a text or thinking block current, returning its index.
    fn enter(&mut self, kind: BlockKind, out: &mut Vec<UnifiedStreamChunk>) -> usize {
        match (&self.block, kind) {
            (BlockState::Text { index }, BlockKind::Text) => return *index,
            (BlockState::Thinking { index, .. }, BlockKind::Thinking) => return *index,
            _ => {}
        }
        self.close_block(out);
        let index = self.allocate_index();
        let (block, opening) = match kind {
            BlockKind::Text => (BlockState::Text { index }, UnifiedContent::text("")),
            BlockKind::Thinking => (
                BlockState::Thinking {
                    index,
                    signature: None,
                },
                UnifiedContent::thinking("", None),
            ),
        };
        self.block = block;
        out.push(UnifiedStreamChunk::content_block_start(index, opening));
        index
    }

    fn open_tool_call(
        &mut self,
        key: String,
        id: String,
        name: String,
        out: &mut Vec<UnifiedStreamChunk>,
    ) {
        self.close_block(out);
        let index = self.allocate_index();
        let id = if id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            id
        };
        let name = self.restore_name(name);
        self.saw_tool_call = true;
        out.push(UnifiedStreamChunk::content_block_start(
            index,
            UnifiedContent::tool_use(&id, &name, json!({})),
        ));
        self.block = BlockState::ToolCall {
            index,
            key,
            id,
            name,
            arguments: String::new(),
        };
    }

    fn close_block(&mut self, out: &mut Vec<UnifiedStreamChunk>) {
        match std::mem::take(&mut self.block) {
            BlockState::Idle => {}
            BlockState::Text { index } => {
                out.push(UnifiedStreamChunk::content_block_stop(index, None));
            }
            BlockState::Thinking { index, signature } => {
                out.push(UnifiedStreamChunk::content_block_delta(
                    index,
                    BlockDelta::Signature(signature.unwrap_or_default()),
                ));
                out.push(UnifiedStreamChunk::content_block_stop(index, None));
            }
            BlockState::ToolCall {
                index,
                id,
                name,
                arguments,
                ..
            } => {
                let arguments = if arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    arguments
                };
                let input = serde_json::from_str::<Value>(&arguments).unwrap_or_else(|e| {
                    tracing::warn!(tool = %name, error = %e, "Tool arguments are not valid JSON");
                    json!({})
                });
                out.push(UnifiedStreamChunk::content_block_delta(
                    index,
                    BlockDelta::InputJson(arguments),
                ));
                out.push(UnifiedStreamChunk::content_block_stop(
                    index,
                    Some(UnifiedContent::tool_use(id, name, input)),
                ));
            }
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

// ============================================================================
// Tests
// ============================================================================
