//! OpenAI Responses API transformer, also used for the Codex backend.
//!
//! Codex speaks the Responses format with a few fixed rules: the system prompt
//! travels in `instructions`, requests always stream and are never stored,
//! sampling parameters are omitted, and tool names are capped at 64 characters.

use super::openai::parse_arguments;
use super::stream::{DecoderState, EncoderState, SseFrame, StreamDelta};
use super::tool_names::TOOL_NAME_LIMIT;
use super::{
    image_from_url, in_band_error, tool_result_text, BlockDelta, ChunkType, Protocol,
    ReasoningConfig, Result, Role, StopReason, ToolChoice, Transformer, UnifiedContent,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedStreamChunk, UnifiedTool,
    UnifiedUsage,
};
use crate::core::AppError;
use serde_json::{json, Value};

// ============================================================================
// Streaming State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Message,
    Reasoning,
    FunctionCall,
}

/// Output item currently being streamed to a Responses client.
#[derive(Debug)]
struct OpenItem {
    kind: ItemKind,
    id: String,
    output_index: usize,
    text: String,
    call_id: String,
    name: String,
    signature: Option<String>,
}

/// Encoder state for Responses event streams.
#[derive(Debug, Default)]
pub struct ResponsesStreamState {
    sequence: u64,
    output: Vec<Value>,
    current: Option<OpenItem>,
    stop_reason: Option<StopReason>,
    usage: UnifiedUsage,
}

impl ResponsesStreamState {
    fn event(&mut self, kind: &str, mut payload: Value) -> SseFrame {
        payload["type"] = json!(kind);
        payload["sequence_number"] = json!(self.sequence);
        self.sequence += 1;
        SseFrame::event(kind, payload.to_string())
    }
}

// ============================================================================
// Responses Transformer
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ResponsesTransformer {
    protocol: Protocol,
}

impl ResponsesTransformer {
    /// The public Responses API.
    pub fn new() -> Self {
        Self {
            protocol: Protocol::OpenAIResponses,
        }
    }

    /// The Codex backend.
    pub fn codex() -> Self {
        Self {
            protocol: Protocol::Codex,
        }
    }

    fn is_codex(&self) -> bool {
        self.protocol == Protocol::Codex
    }

    fn content_parts_to_unified(content: &Value) -> Vec<UnifiedContent> {
        match content {
            Value::String(text) => vec![UnifiedContent::text(text.clone())],
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| match part.get("type").and_then(|t| t.as_str())? {
                    "input_text" | "output_text" | "text" => {
                        Some(UnifiedContent::text(part.get("text")?.as_str()?))
                    }
                    "input_image" => {
                        let url = part
                            .get("image_url")
                            .and_then(|u| u.as_str().or_else(|| u.get("url")?.as_str()))?;
                        Some(image_from_url(url))
                    }
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    fn reasoning_item_to_unified(item: &Value) -> UnifiedContent {
        let text = item
            .get("summary")
            .and_then(|s| s.as_array())
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let signature = item
            .get("encrypted_content")
            .and_then(|e| e.as_str())
            .map(String::from);
        UnifiedContent::thinking(text, signature)
    }

    fn function_call_to_unified(item: &Value) -> UnifiedContent {
        let str_field = |field: &str| item.get(field).and_then(|v| v.as_str()).unwrap_or_default();
        let call_id = match str_field("call_id") {
            "" => str_field("id"),
            id => id,
        };
        UnifiedContent::tool_use(
            call_id,
            str_field("name"),
            parse_arguments(str_field("arguments")),
        )
    }

    /// Turn request `input` items into messages, folding consecutive items of one role together.
    fn input_to_messages(input: &Value, request: &mut UnifiedRequest) {
        let items = match input {
            Value::String(text) => {
                request.messages.push(UnifiedMessage::user(text.clone()));
                return;
            }
            Value::Array(items) => items,
            _ => return,
        };

        for item in items {
            let item_type = item.get("type").and_then(|t| t.as_str());
            let role = item.get("role").and_then(|r| r.as_str());
            let (role, content) = match (item_type, role) {
                (Some("function_call"), _) => {
                    (Role::Assistant, vec![Self::function_call_to_unified(item)])
                }
                (Some("function_call_output"), _) => {
                    let call_id = item
                        .get("call_id")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default();
                    let output = item.get("output").cloned().unwrap_or(Value::Null);
                    (
                        Role::Tool,
                        vec![UnifiedContent::tool_result(call_id, output, false)],
                    )
                }
                (Some("reasoning"), _) => {
                    (Role::Assistant, vec![Self::reasoning_item_to_unified(item)])
                }
                (Some("message") | None, Some("system" | "developer")) => {
                    let text = Self::content_parts_to_unified(
                        item.get("content").unwrap_or(&Value::Null),
                    )
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                    request.push_system(&text);
                    continue;
                }
                (Some("message") | None, Some(role)) => {
                    let role = if role == "assistant" {
                        Role::Assistant
                    } else {
                        Role::User
                    };
                    (
                        role,
                        Self::content_parts_to_unified(item.get("content").unwrap_or(&Value::Null)),
                    )
                }
                _ => continue,
            };

            match request.messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(content),
                _ => request
                    .messages
                    .push(UnifiedMessage::with_content(role, content)),
            }
        }
    }

    fn messages_to_input(messages: &[UnifiedMessage]) -> Vec<Value> {
        let mut input = Vec::new();
        for msg in messages {
            let mut text_parts = Vec::new();
            let flush = |input: &mut Vec<Value>, parts: &mut Vec<Value>, role: Role| {
                if parts.is_empty() {
                    return;
                }
                let role = if role == Role::Assistant { "assistant" } else { "user" };
                input.push(json!({
                    "type": "message",
                    "role": role,
                    "content": std::mem::take(parts),
                }));
            };
            for content in &msg.content {
                match content {
                    UnifiedContent::Text { text } => {
                        let part_type = if msg.role == Role::Assistant {
                            "output_text"
                        } else {
                            "input_text"
                        };
                        text_parts.push(json!({"type": part_type, "text": text}));
                    }
                    UnifiedContent::Image { .. } => {
                        if let Some(url) = content.image_as_url() {
                            text_parts.push(json!({"type": "input_image", "image_url": url}));
                        }
                    }
                    UnifiedContent::ToolUse { id, name, input: args } => {
                        flush(&mut input, &mut text_parts, msg.role);
                        input.push(json!({
                            "type": "function_call",
                            "call_id": id,
                            "name": name,
                            "arguments": args.to_string(),
                        }));
                    }
                    UnifiedContent::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        flush(&mut input, &mut text_parts, msg.role);
                        input.push(json!({
                            "type": "function_call_output",
                            "call_id": tool_use_id,
                            "output": tool_result_text(content),
                        }));
                    }
                    // Reasoning can only be replayed with the encrypted payload it came with.
                    UnifiedContent::Thinking {
                        text,
                        signature: Some(encrypted),
                    } => {
                        flush(&mut input, &mut text_parts, msg.role);
                        let summary: Vec<Value> = if text.is_empty() {
                            vec![]
                        } else {
                            vec![json!({"type": "summary_text", "text": text})]
                        };
                        input.push(json!({
                            "type": "reasoning",
                            "summary": summary,
                            "encrypted_content": encrypted,
                        }));
                    }
                    UnifiedContent::Thinking { .. } => {}
                }
            }
            flush(&mut input, &mut text_parts, msg.role);
        }
        input
    }

    fn tool_choice_to_unified(choice: &Value) -> Option<ToolChoice> {
        match choice {
            Value::String(s) => match s.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "required" => Some(ToolChoice::Any),
                _ => None,
            },
            _ => choice
                .get("name")
                .and_then(|n| n.as_str())
                .map(|n| ToolChoice::Tool(n.to_string())),
        }
    }

    fn tool_choice_from_unified(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({"type": "function", "name": name}),
        }
    }

    fn parse_usage(usage: &Value) -> UnifiedUsage {
        UnifiedUsage {
            input_tokens: usage
                .get("input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: usage
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_read_tokens: usage
                .pointer("/input_tokens_details/cached_tokens")
                .and_then(|v| v.as_u64()),
            reasoning_tokens: usage
                .pointer("/output_tokens_details/reasoning_tokens")
                .and_then(|v| v.as_u64()),
        }
    }

    fn usage_to_json(usage: &UnifiedUsage) -> Value {
        json!({
            "input_tokens": usage.input_tokens,
            "input_tokens_details": {"cached_tokens": usage.cache_read_tokens.unwrap_or(0)},
            "output_tokens": usage.output_tokens,
            "output_tokens_details": {"reasoning_tokens": usage.reasoning_tokens.unwrap_or(0)},
            "total_tokens": usage.total_tokens(),
        })
    }

    /// Stop reason carried by a response object's status.
    fn status_to_stop_reason(response: &Value) -> Option<StopReason> {
        match response.get("status").and_then(|s| s.as_str())? {
            "incomplete" => Some(
                match response
                    .pointer("/incomplete_details/reason")
                    .and_then(|r| r.as_str())
                {
                    Some("content_filter") => StopReason::ContentFilter,
                    _ => StopReason::MaxTokens,
                },
            ),
            _ => Some(StopReason::EndTurn),
        }
    }

    fn apply_status(response: &mut Value, stop_reason: Option<StopReason>) {
        match stop_reason {
            Some(StopReason::MaxTokens) => {
                response["status"] = json!("incomplete");
                response["incomplete_details"] = json!({"reason": "max_output_tokens"});
            }
            Some(StopReason::ContentFilter) => {
                response["status"] = json!("incomplete");
                response["incomplete_details"] = json!({"reason": "content_filter"});
            }
            _ => response["status"] = json!("completed"),
        }
    }

    fn response_object(state: &EncoderState, status: &str) -> Value {
        json!({
            "id": state.id,
            "object": "response",
            "created_at": state.created,
            "status": status,
            "model": state.model,
            "output": state.responses.output,
            "usage": Value::Null,
        })
    }

    fn item_id(prefix: &str) -> String {
        format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
    }

    fn open_item(chunk: &UnifiedStreamChunk, state: &mut EncoderState) -> Vec<SseFrame> {
        let Some(content) = &chunk.content_block else {
            return vec![];
        };
        let output_index = state.responses.output.len();
        let (item, open) = match content {
            UnifiedContent::ToolUse { id, name, .. } => {
                let item_id = Self::item_id("fc");
                (
                    json!({
                        "id": item_id,
                        "type": "function_call",
                        "status": "in_progress",
                        "call_id": id,
                        "name": name,
                        "arguments": "",
                    }),
                    OpenItem {
                        kind: ItemKind::FunctionCall,
                        id: item_id,
                        output_index,
                        text: String::new(),
                        call_id: id.clone(),
                        name: name.clone(),
                        signature: None,
                    },
                )
            }
            UnifiedContent::Thinking { .. } => {
                let item_id = Self::item_id("rs");
                (
                    json!({"id": item_id, "type": "reasoning", "summary": []}),
                    OpenItem {
                        kind: ItemKind::Reasoning,
                        id: item_id,
                        output_index,
                        text: String::new(),
                        call_id: String::new(),
                        name: String::new(),
                        signature: None,
                    },
                )
            }
            _ => {
                let item_id = Self::item_id("msg");
                (
                    json!({
                        "id": item_id,
                        "type": "message",
                        "status": "in_progress",
                        "role": "assistant",
                        "content": [],
                    }),
                    OpenItem {
                        kind: ItemKind::Message,
                        id: item_id,
                        output_index,
                        text: String::new(),
                        call_id: String::new(),
                        name: String::new(),
                        signature: None,
                    },
                )
            }
        };

        let sub = &mut state.responses;
        let mut frames = vec![sub.event(
            "response.output_item.added",
            json!({"output_index": output_index, "item": item}),
        )];
        match open.kind {
            ItemKind::Message => frames.push(sub.event(
                "response.content_part.added",
                json!({
                    "item_id": open.id,
                    "output_index": output_index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": "", "annotations": []},
                }),
            )),
            ItemKind::Reasoning => frames.push(sub.event(
                "response.reasoning_summary_part.added",
                json!({
                    "item_id": open.id,
                    "output_index": output_index,
                    "summary_index": 0,
                    "part": {"type": "summary_text", "text": ""},
                }),
            )),
            ItemKind::FunctionCall => {}
        }
        sub.current = Some(open);
        frames
    }

    fn close_item(state: &mut EncoderState) -> Vec<SseFrame> {
        let sub = &mut state.responses;
        let Some(open) = sub.current.take() else {
            return vec![];
        };
        let mut frames = Vec::new();
        let item = match open.kind {
            ItemKind::Message => {
                let part = json!({"type": "output_text", "text": open.text, "annotations": []});
                frames.push(sub.event(
                    "response.output_text.done",
                    json!({
                        "item_id": open.id,
                        "output_index": open.output_index,
                        "content_index": 0,
                        "text": open.text,
                    }),
                ));
                frames.push(sub.event(
                    "response.content_part.done",
                    json!({
                        "item_id": open.id,
                        "output_index": open.output_index,
                        "content_index": 0,
                        "part": part,
                    }),
                ));
                json!({
                    "id": open.id,
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": [part],
                })
            }
            ItemKind::Reasoning => {
                let part = json!({"type": "summary_text", "text": open.text});
                frames.push(sub.event(
                    "response.reasoning_summary_text.done",
                    json!({
                        "item_id": open.id,
                        "output_index": open.output_index,
                        "summary_index": 0,
                        "text": open.text,
                    }),
                ));
                frames.push(sub.event(
                    "response.reasoning_summary_part.done",
                    json!({
                        "item_id": open.id,
                        "output_index": open.output_index,
                        "summary_index": 0,
                        "part": part,
                    }),
                ));
                let mut item = json!({"id": open.id, "type": "reasoning", "summary": [part]});
                if let Some(signature) = open.signature.filter(|s| !s.is_empty()) {
                    item["encrypted_content"] = json!(signature);
                }
                item
            }
            ItemKind::FunctionCall => {
                frames.push(sub.event(
                    "response.function_call_arguments.done",
                    json!({
                        "item_id": open.id,
                        "output_index": open.output_index,
                        "arguments": open.text,
                    }),
                ));
                json!({
                    "id": open.id,
                    "type": "function_call",
                    "status": "completed",
                    "call_id": open.call_id,
                    "name": open.name,
                    "arguments": open.text,
                })
            }
        };
        frames.push(sub.event(
            "response.output_item.done",
            json!({"output_index": open.output_index, "item": item}),
        ));
        sub.output.push(item);
        frames
    }
}

impl Default for ResponsesTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for ResponsesTransformer {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn tool_name_limit(&self) -> Option<usize> {
        self.is_codex().then_some(TOOL_NAME_LIMIT)
    }

    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest> {
        let model = raw
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let mut unified = UnifiedRequest::new(model, vec![]);

        if let Some(instructions) = raw.get("instructions").and_then(|i| i.as_str()) {
            unified.push_system(instructions);
        }
        let input = raw
            .get("input")
            .ok_or_else(|| AppError::BadRequest("Missing 'input' field".into()))?;
        Self::input_to_messages(input, &mut unified);

        let params = &mut unified.parameters;
        params.max_tokens = raw.get("max_output_tokens").and_then(|v| v.as_u64());
        params.temperature = raw.get("temperature").and_then(|v| v.as_f64());
        params.top_p = raw.get("top_p").and_then(|v| v.as_f64());
        params.stream = raw.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        params.reasoning = raw
            .pointer("/reasoning/effort")
            .and_then(|e| e.as_str())
            .map(|effort| ReasoningConfig {
                effort: Some(effort.to_string()),
                budget_tokens: None,
            });

        unified.tools = raw
            .get("tools")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
            .filter(|tool| tool.get("type").and_then(|t| t.as_str()) == Some("function"))
            .filter_map(|tool| {
                Some(UnifiedTool {
                    name: tool.get("name")?.as_str()?.to_string(),
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    input_schema: tool
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    strict: tool.get("strict").and_then(|s| s.as_bool()),
                })
            })
            .collect();
        unified.tool_choice = raw
            .get("tool_choice")
            .and_then(Self::tool_choice_to_unified);

        Ok(unified)
    }

    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value> {
        let params = &unified.parameters;
        let mut body = json!({
            "model": unified.model,
            "input": Self::messages_to_input(&unified.messages),
            "stream": params.stream || self.is_codex(),
        });

        let system = unified.system.clone().filter(|s| !s.is_empty());
        if self.is_codex() {
            body["instructions"] = json!(system.unwrap_or_default());
            body["store"] = json!(false);
            body["include"] = json!(["reasoning.encrypted_content"]);
        } else {
            if let Some(system) = system {
                body["instructions"] = json!(system);
            }
            if let Some(max_tokens) = params.max_tokens {
                body["max_output_tokens"] = json!(max_tokens);
            }
            if let Some(temperature) = params.temperature {
                body["temperature"] = json!(temperature);
            }
            if let Some(top_p) = params.top_p {
                body["top_p"] = json!(top_p);
            }
        }

        if let Some(effort) = params.reasoning.as_ref().and_then(|r| r.effort_level()) {
            body["reasoning"] = json!({"effort": effort, "summary": "auto"});
        }
        if !unified.tools.is_empty() {
            body["tools"] = Value::Array(
                unified
                    .tools
                    .iter()
                    .map(|tool| {
                        let mut value = json!({
                            "type": "function",
                            "name": tool.name,
                            "parameters": tool.input_schema,
                            "strict": tool.strict.unwrap_or(false),
                        });
                        if let Some(description) = &tool.description {
                            value["description"] = json!(description);
                        }
                        value
                    })
                    .collect(),
            );
        }
        if let Some(choice) = &unified.tool_choice {
            body["tool_choice"] = Self::tool_choice_from_unified(choice);
        }
        Ok(body)
    }

    fn transform_response_in(&self, raw: Value, original_model: &str) -> Result<UnifiedResponse> {
        if let Some(err) = in_band_error(self.protocol, &raw) {
            return Err(err);
        }
        let mut content = Vec::new();
        for item in raw
            .get("output")
            .and_then(|o| o.as_array())
            .into_iter()
            .flatten()
        {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("message") => content.extend(Self::content_parts_to_unified(
                    item.get("content").unwrap_or(&Value::Null),
                )),
                Some("function_call") => content.push(Self::function_call_to_unified(item)),
                Some("reasoning") => content.push(Self::reasoning_item_to_unified(item)),
                _ => {}
            }
        }

        Ok(UnifiedResponse {
            id: raw
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            model: raw
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(original_model)
                .to_string(),
            content,
            stop_reason: Self::status_to_stop_reason(&raw),
            usage: raw.get("usage").map(Self::parse_usage).unwrap_or_default(),
        })
    }

    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value> {
        let mut output = Vec::new();
        let mut text_parts = Vec::new();
        let flush = |output: &mut Vec<Value>, parts: &mut Vec<Value>| {
            if !parts.is_empty() {
                output.push(json!({
                    "id": Self::item_id("msg"),
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": std::mem::take(parts),
                }));
            }
        };
        for content in &unified.content {
            match content {
                UnifiedContent::Text { text } => text_parts.push(
                    json!({"type": "output_text", "text": text, "annotations": []}),
                ),
                UnifiedContent::Thinking { text, signature } => {
                    flush(&mut output, &mut text_parts);
                    let mut item = json!({
                        "id": Self::item_id("rs"),
                        "type": "reasoning",
                        "summary": [{"type": "summary_text", "text": text}],
                    });
                    if let Some(signature) = signature {
                        item["encrypted_content"] = json!(signature);
                    }
                    output.push(item);
                }
                UnifiedContent::ToolUse { id, name, input } => {
                    flush(&mut output, &mut text_parts);
                    output.push(json!({
                        "id": Self::item_id("fc"),
                        "type": "function_call",
                        "status": "completed",
                        "call_id": id,
                        "name": name,
                        "arguments": input.to_string(),
                    }));
                }
                _ => {}
            }
        }
        flush(&mut output, &mut text_parts);

        let id = if unified.id.starts_with("resp_") {
            unified.id.clone()
        } else {
            Self::item_id("resp")
        };
        let mut response = json!({
            "id": id,
            "object": "response",
            "created_at": chrono::Utc::now().timestamp(),
            "model": unified.model,
            "output": output,
            "usage": Self::usage_to_json(&unified.usage),
        });
        Self::apply_status(&mut response, unified.stop_reason);
        Ok(response)
    }

    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        let event: Value = serde_json::from_slice(chunk)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
        if let Some(err) = in_band_error(self.protocol, &event) {
            return Err(err);
        }

        let output_index = event
            .get("output_index")
            .and_then(|i| i.as_u64())
            .unwrap_or(0);
        let str_at = |pointer: &str| {
            event
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let deltas = match event.get("type").and_then(|t| t.as_str()).unwrap_or_default() {
            "response.created" | "response.in_progress" if !state.started => {
                state.started = true;
                vec![StreamDelta::MessageStart {
                    id: event
                        .pointer("/response/id")
                        .and_then(|i| i.as_str())
                        .map(String::from),
                    model: event
                        .pointer("/response/model")
                        .and_then(|m| m.as_str())
                        .map(String::from),
                    usage: None,
                }]
            }
            "response.output_item.added" => {
                let item_type = str_at("/item/type");
                state.item_kinds.insert(output_index, item_type.clone());
                if item_type == "function_call" {
                    let key = format!("{}:{}", output_index, str_at("/item/id"));
                    state.tool_keys.insert(output_index, key.clone());
                    vec![StreamDelta::ToolCallStart {
                        key,
                        id: str_at("/item/call_id"),
                        name: str_at("/item/name"),
                    }]
                } else {
                    vec![]
                }
            }
            "response.output_text.delta" => vec![StreamDelta::Text(str_at("/delta"))],
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                vec![StreamDelta::Thinking(str_at("/delta"))]
            }
            "response.function_call_arguments.delta" => {
                state
                    .item_kinds
                    .insert(output_index, "function_call_streamed".to_string());
                match state.tool_keys.get(&output_index) {
                    Some(key) => vec![StreamDelta::ToolCallArgs {
                        key: key.clone(),
                        fragment: str_at("/delta"),
                    }],
                    None => vec![],
                }
            }
            "response.output_item.done" => match str_at("/item/type").as_str() {
                "reasoning" => event
                    .pointer("/item/encrypted_content")
                    .and_then(|e| e.as_str())
                    .map(|sig| vec![StreamDelta::ThinkingSignature(sig.to_string())])
                    .unwrap_or_default(),
                // Arguments delivered only with the finished item
                "function_call"
                    if state.item_kinds.get(&output_index).map(String::as_str)
                        == Some("function_call") =>
                {
                    match state.tool_keys.get(&output_index) {
                        Some(key) => vec![StreamDelta::ToolCallArgs {
                            key: key.clone(),
                            fragment: str_at("/item/arguments"),
                        }],
                        None => vec![],
                    }
                }
                _ => vec![],
            },
            "response.completed" | "response.incomplete" => {
                let response = event.get("response").cloned().unwrap_or(json!({}));
                vec![StreamDelta::Finish {
                    reason: Self::status_to_stop_reason(&response),
                    usage: response.get("usage").map(Self::parse_usage),
                }]
            }
            _ => vec![],
        };
        Ok(deltas)
    }

    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>> {
        let frames = match chunk.chunk_type {
            ChunkType::MessageStart => {
                let message = chunk.message.clone().unwrap_or_default();
                state.id = if message.id.starts_with("resp_") {
                    message.id
                } else {
                    Self::item_id("resp")
                };
                state.model = message.model;
                state.created = chrono::Utc::now().timestamp();
                let response = Self::response_object(state, "in_progress");
                vec![
                    state
                        .responses
                        .event("response.created", json!({"response": response})),
                    state
                        .responses
                        .event("response.in_progress", json!({"response": response})),
                ]
            }
            ChunkType::ContentBlockStart => Self::open_item(chunk, state),
            ChunkType::ContentBlockDelta => {
                let sub = &mut state.responses;
                let Some(open) = sub.current.as_mut() else {
                    return Ok(vec![]);
                };
                let (kind, payload) = match &chunk.delta {
                    Some(BlockDelta::Text(text)) => {
                        open.text.push_str(text);
                        (
                            "response.output_text.delta",
                            json!({"content_index": 0, "delta": text}),
                        )
                    }
                    Some(BlockDelta::Thinking(text)) => {
                        open.text.push_str(text);
                        (
                            "response.reasoning_summary_text.delta",
                            json!({"summary_index": 0, "delta": text}),
                        )
                    }
                    Some(BlockDelta::InputJson(arguments)) => {
                        open.text.push_str(arguments);
                        (
                            "response.function_call_arguments.delta",
                            json!({"delta": arguments}),
                        )
                    }
                    Some(BlockDelta::Signature(signature)) => {
                        open.signature = Some(signature.clone());
                        return Ok(vec![]);
                    }
                    None => return Ok(vec![]),
                };
                let mut payload = payload;
                payload["item_id"] = json!(open.id);
                payload["output_index"] = json!(open.output_index);
                vec![sub.event(kind, payload)]
            }
            ChunkType::ContentBlockStop => Self::close_item(state),
            ChunkType::MessageDelta => {
                state.responses.stop_reason = chunk.stop_reason;
                if let Some(usage) = &chunk.usage {
                    state.responses.usage = usage.clone();
                }
                vec![]
            }
            ChunkType::MessageStop => {
                let mut frames = Self::close_item(state);
                let mut response = Self::response_object(state, "completed");
                Self::apply_status(&mut response, state.responses.stop_reason);
                response["usage"] = Self::usage_to_json(&state.responses.usage);
                let kind = if response["status"] == "incomplete" {
                    "response.incomplete"
                } else {
                    "response.completed"
                };
                frames.push(state.responses.event(kind, json!({"response": response})));
                frames
            }
        };
        Ok(frames)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_transform_request_out_simple() {
        let unified = ResponsesTransformer::new()
            .transform_request_out(json!({"model": "gpt-5", "input": "Hello", "instructions": "Be brief"}))
            .unwrap();
        assert_eq!(unified.messages, vec![UnifiedMessage::user("Hello")]);
        assert_eq!(unified.system.as_deref(), Some("Be brief"));
    }

    #[test]
    fn test_function_call_items_fold_into_turns() {
        let unified = ResponsesTransformer::new()
            .transform_request_out(json!({
                "model": "gpt-5",
                "input": [
                    {"role": "developer", "content": "rules"},
                    {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "go"}]},
                    {"type": "function_call", "call_id": "c1", "name": "a", "arguments": "{}"},
                    {"type": "function_call", "call_id": "c2", "name": "b", "arguments": "{\"x\":1}"},
                    {"type": "function_call_output", "call_id": "c1", "output": "A"},
                    {"type": "function_call_output", "call_id": "c2", "output": "B"}
                ],
                "tools": [{"type": "function", "name": "a", "parameters": {"type": "object"}, "strict": true},
                          {"type": "web_search"}]
            }))
            .unwrap();
        assert_eq!(unified.system.as_deref(), Some("rules"));
        assert_eq!(unified.messages.len(), 3);
        assert_eq!(unified.messages[1].tool_uses().count(), 2);
        assert_eq!(unified.messages[2].role, Role::Tool);
        assert_eq!(unified.messages[2].content.len(), 2);
        assert_eq!(unified.tools.len(), 1);
        assert_eq!(unified.tools[0].strict, Some(true));
    }

    #[test]
    fn test_codex_request_rules() {
        let mut unified = UnifiedRequest::new("gpt-5-codex", vec![UnifiedMessage::user("hi")])
            .with_system("You are Codex.");
        unified.parameters.temperature = Some(0.2);
        unified.parameters.max_tokens = Some(100);
        unified.tools = vec![UnifiedTool::function("shell", None, json!({"type": "object"}))];

        let body = ResponsesTransformer::codex().transform_request_in(&unified).unwrap();
        assert_eq!(body["instructions"], json!("You are Codex."));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["store"], json!(false));
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_output_tokens").is_none());
        assert_eq!(body["tools"][0]["strict"], json!(false));
        assert_eq!(body["input"][0]["content"][0], json!({"type": "input_text", "text": "hi"}));
        assert_eq!(ResponsesTransformer::codex().tool_name_limit(), Some(64));
        assert_eq!(ResponsesTransformer::new().tool_name_limit(), None);
    }

    #[test]
    fn test_transform_response_in() {
        let raw = json!({
            "id": "resp_1",
            "model": "gpt-5",
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"},
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "think"}], "encrypted_content": "enc"},
                {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "Hi"}]},
                {"type": "function_call", "call_id": "c1", "name": "f", "arguments": "{\"a\":1}"}
            ],
            "usage": {"input_tokens": 5, "output_tokens": 9}
        });
        let unified = ResponsesTransformer::new()
            .transform_response_in(raw, "gpt-5")
            .unwrap();
        assert_eq!(unified.content[0], UnifiedContent::thinking("think", Some("enc".into())));
        assert_eq!(unified.text_content(), "Hi");
        assert_eq!(unified.content[2], UnifiedContent::tool_use("c1", "f", json!({"a": 1})));
        assert_eq!(unified.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(unified.usage, UnifiedUsage::new(5, 9));
    }

    #[test]
    fn test_stream_in_function_call_and_completion() {
        let transformer = ResponsesTransformer::codex();
        let mut state = DecoderState::default();
        let mut all = Vec::new();
        for chunk in [
            r#"{"type":"response.created","response":{"id":"resp_1","model":"gpt-5-codex"}}"#,
            r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"c1","name":"shell"}}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"{\"cmd\":"}"#,
            r#"{"type":"response.function_call_arguments.delta","output_index":0,"delta":"\"ls\"}"}"#,
            r#"{"type":"response.output_item.done","output_index":0,"item":{"type":"function_call","arguments":"{\"cmd\":\"ls\"}"}}"#,
            r#"{"type":"response.completed","response":{"status":"completed","usage":{"input_tokens":2,"output_tokens":3}}}"#,
        ] {
            all.extend(
                transformer
                    .transform_stream_chunk_in(chunk.as_bytes(), &mut state)
                    .unwrap(),
            );
        }
        assert_eq!(all.len(), 5);
        assert!(matches!(&all[1], StreamDelta::ToolCallStart { name, .. } if name == "shell"));
        assert_eq!(
            all[4],
            StreamDelta::Finish {
                reason: Some(StopReason::EndTurn),
                usage: Some(UnifiedUsage::new(2, 3))
            }
        );
    }

    #[test]
    fn test_stream_in_failed_rate_limit() {
        let err = ResponsesTransformer::codex()
            .transform_stream_chunk_in(
                br#"{"type":"response.failed","response":{"status":"failed","error":{"code":"rate_limit_exceeded","message":"slow down"}}}"#,
                &mut DecoderState::default(),
            )
            .unwrap_err();
        assert!(err.is_quota_exceeded());
    }

    #[test]
    fn test_stream_out_text_item_lifecycle() {
        let transformer = ResponsesTransformer::new();
        let mut state = EncoderState::default();
        let chunks = vec![
            UnifiedStreamChunk::message_start(UnifiedResponse {
                model: "gpt-5".into(),
                ..Default::default()
            }),
            UnifiedStreamChunk::content_block_start(0, UnifiedContent::text("")),
            UnifiedStreamChunk::content_block_delta(0, BlockDelta::Text("Hel".into())),
            UnifiedStreamChunk::content_block_delta(0, BlockDelta::Text("lo".into())),
            UnifiedStreamChunk::content_block_stop(0, None),
            UnifiedStreamChunk::message_delta(StopReason::EndTurn, UnifiedUsage::new(1, 2)),
            UnifiedStreamChunk::message_stop(),
        ];
        let mut frames = Vec::new();
        for chunk in &chunks {
            frames.extend(transformer.transform_stream_chunk_out(chunk, &mut state).unwrap());
        }
        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            events,
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        let completed: Value = serde_json::from_str(&frames.last().unwrap().data).unwrap();
        assert_eq!(completed["sequence_number"], json!(9));
        assert_eq!(
            completed["response"]["output"][0]["content"][0]["text"],
            json!("Hello")
        );
        assert_eq!(completed["response"]["usage"]["total_tokens"], json!(3));
    }
}
