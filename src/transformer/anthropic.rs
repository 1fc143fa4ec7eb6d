//! Anthropic protocol transformer.
//!
//! Handles conversion between Anthropic Messages API format and
//! the Unified Internal Format.

use super::stream::{DecoderState, EncoderState, SseFrame, StreamDelta};
use super::{
    in_band_error, tool_result_text, BlockDelta, ChunkType, Protocol, ReasoningConfig, Result,
    Role, StopReason, ToolChoice, Transformer, UnifiedContent, UnifiedMessage, UnifiedRequest,
    UnifiedResponse, UnifiedStreamChunk, UnifiedTool, UnifiedUsage,
};
use crate::core::AppError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// `max_tokens` is mandatory on the Messages API.
const DEFAULT_MAX_TOKENS: u64 = 8192;

/// Smallest thinking budget the Messages API accepts.
const MIN_THINKING_BUDGET: i64 = 1024;

// ============================================================================
// Anthropic Request Types
// ============================================================================

/// Anthropic message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

/// Anthropic content can be string or array of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

/// Anthropic content block types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Blocks the relay does not translate (redacted thinking, documents, ...)
    #[serde(other)]
    Unsupported,
}

/// Anthropic image source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Anthropic system prompt (can be string or array).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<Value>),
}

/// Anthropic thinking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicThinking {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(default)]
    pub budget_tokens: Option<i64>,
}

/// Anthropic messages request.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<AnthropicSystem>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<u64>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub thinking: Option<AnthropicThinking>,
}

// ============================================================================
// Anthropic Transformer
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicTransformer;

impl AnthropicTransformer {
    pub fn new() -> Self {
        Self
    }

    fn content_block_to_unified(block: AnthropicContentBlock) -> Option<UnifiedContent> {
        match block {
            AnthropicContentBlock::Text { text } => Some(UnifiedContent::text(text)),
            AnthropicContentBlock::Image { source } => match source.source_type.as_str() {
                "url" => source.url.map(UnifiedContent::image_url),
                _ => Some(UnifiedContent::image_base64(
                    source.media_type.unwrap_or_default(),
                    source.data.unwrap_or_default(),
                )),
            },
            AnthropicContentBlock::ToolUse { id, name, input } => {
                Some(UnifiedContent::tool_use(id, name, input))
            }
            AnthropicContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(UnifiedContent::tool_result(
                tool_use_id,
                content,
                is_error.unwrap_or(false),
            )),
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => Some(UnifiedContent::thinking(thinking, signature)),
            AnthropicContentBlock::Unsupported => None,
        }
    }

    fn unified_to_content_block(content: &UnifiedContent) -> Option<Value> {
        match content {
            UnifiedContent::Text { text } if !text.is_empty() => {
                Some(json!({"type": "text", "text": text}))
            }
            UnifiedContent::Text { .. } => None,
            UnifiedContent::Image {
                source_type,
                media_type,
                data,
            } => Some(if source_type == "url" {
                json!({"type": "image", "source": {"type": "url", "url": data}})
            } else {
                json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": media_type, "data": data},
                })
            }),
            UnifiedContent::ToolUse { id, name, input } => {
                let input = match input {
                    Value::Object(_) => input.clone(),
                    _ => json!({}),
                };
                Some(json!({"type": "tool_use", "id": id, "name": name, "input": input}))
            }
            UnifiedContent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let content = match content {
                    Value::String(_) | Value::Array(_) => content.clone(),
                    other => Value::String(tool_result_text(other)),
                };
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                Some(block)
            }
            // Unsigned reasoning from other providers cannot be replayed to Claude.
            UnifiedContent::Thinking {
                text,
                signature: Some(signature),
            } if !text.is_empty() => Some(json!({
                "type": "thinking",
                "thinking": text,
                "signature": signature,
            })),
            UnifiedContent::Thinking { .. } => None,
        }
    }

    fn extract_system(system: AnthropicSystem) -> String {
        match system {
            AnthropicSystem::Text(text) => text,
            AnthropicSystem::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn tool_choice_to_unified(choice: &Value) -> Option<ToolChoice> {
        match choice.get("type").and_then(|t| t.as_str())? {
            "auto" => Some(ToolChoice::Auto),
            "any" => Some(ToolChoice::Any),
            "none" => Some(ToolChoice::None),
            "tool" => choice
                .get("name")
                .and_then(|n| n.as_str())
                .map(|n| ToolChoice::Tool(n.to_string())),
            _ => None,
        }
    }

    fn tool_choice_from_unified(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Any => json!({"type": "any"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
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
                .get("cache_read_input_tokens")
                .and_then(|v| v.as_u64()),
            reasoning_tokens: None,
        }
    }

    fn usage_to_json(usage: &UnifiedUsage) -> Value {
        let mut value = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });
        if let Some(cached) = usage.cache_read_tokens {
            value["cache_read_input_tokens"] = json!(cached);
        }
        value
    }

    fn opening_block(content: &UnifiedContent) -> Value {
        match content {
            UnifiedContent::Thinking { .. } => json!({"type": "thinking", "thinking": ""}),
            UnifiedContent::ToolUse { id, name, .. } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": {}})
            }
            _ => json!({"type": "text", "text": ""}),
        }
    }
}

/// Append a message, merging into the previous one when the role repeats.
fn push_merged(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

impl Transformer for AnthropicTransformer {
    fn protocol(&self) -> Protocol {
        Protocol::Claude
    }

    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest> {
        let req: AnthropicRequest =
            serde_json::from_value(raw).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let messages = req
            .messages
            .into_iter()
            .map(|msg| {
                let role = match msg.role.as_str() {
                    "assistant" => Role::Assistant,
                    _ => Role::User,
                };
                let content = match msg.content {
                    AnthropicContent::Text(text) => vec![UnifiedContent::text(text)],
                    AnthropicContent::Blocks(blocks) => blocks
                        .into_iter()
                        .filter_map(Self::content_block_to_unified)
                        .collect(),
                };
                UnifiedMessage::with_content(role, content)
            })
            .collect();

        let mut unified = UnifiedRequest::new(req.model, messages);
        if let Some(system) = req.system {
            unified.push_system(&Self::extract_system(system));
        }

        let params = &mut unified.parameters;
        params.max_tokens = req.max_tokens;
        params.temperature = req.temperature;
        params.top_p = req.top_p;
        params.top_k = req.top_k;
        params.stop_sequences = req.stop_sequences;
        params.stream = req.stream;
        params.reasoning = req
            .thinking
            .filter(|t| t.thinking_type == "enabled")
            .map(|t| ReasoningConfig {
                effort: None,
                budget_tokens: t.budget_tokens,
            });

        unified.tools = req
            .tools
            .unwrap_or_default()
            .iter()
            .filter_map(|tool| {
                Some(UnifiedTool {
                    name: tool.get("name")?.as_str()?.to_string(),
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    input_schema: tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    strict: None,
                })
            })
            .collect();
        unified.tool_choice = req
            .tool_choice
            .as_ref()
            .and_then(Self::tool_choice_to_unified);

        Ok(unified)
    }

    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value> {
        let mut messages = Vec::new();
        for msg in &unified.messages {
            let role = match msg.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let blocks = msg
                .content
                .iter()
                .filter_map(Self::unified_to_content_block)
                .collect();
            push_merged(&mut messages, role, blocks);
        }

        let params = &unified.parameters;
        let mut body = json!({
            "model": unified.model,
            "messages": messages,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": params.stream,
        });
        if let Some(system) = unified.system.as_ref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = params.top_k {
            body["top_k"] = json!(top_k);
        }
        if let Some(stop) = &params.stop_sequences {
            body["stop_sequences"] = json!(stop);
        }
        if let Some(budget) = params
            .reasoning
            .as_ref()
            .and_then(|r| r.budget())
            .filter(|b| *b > 0)
        {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": budget.max(MIN_THINKING_BUDGET),
            });
        }
        if !unified.tools.is_empty() {
            body["tools"] = Value::Array(
                unified
                    .tools
                    .iter()
                    .map(|tool| {
                        let mut value = json!({"name": tool.name, "input_schema": tool.input_schema});
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
        if let Some(err) = in_band_error(Protocol::Claude, &raw) {
            return Err(err);
        }
        let blocks: Vec<AnthropicContentBlock> = raw
            .get("content")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

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
            content: blocks
                .into_iter()
                .filter_map(Self::content_block_to_unified)
                .collect(),
            stop_reason: raw
                .get("stop_reason")
                .and_then(|r| r.as_str())
                .map(StopReason::from_claude),
            usage: raw.get("usage").map(Self::parse_usage).unwrap_or_default(),
        })
    }

    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value> {
        let content: Vec<Value> = unified
            .content
            .iter()
            .filter_map(|c| match c {
                UnifiedContent::Thinking { text, signature } if !text.is_empty() => Some(json!({
                    "type": "thinking",
                    "thinking": text,
                    "signature": signature.clone().unwrap_or_default(),
                })),
                other => Self::unified_to_content_block(other),
            })
            .collect();
        let stop_reason = if unified.has_tool_use() {
            StopReason::ToolUse
        } else {
            unified.stop_reason.unwrap_or_default()
        };
        let id = if unified.id.starts_with("msg_") {
            unified.id.clone()
        } else {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        };
        Ok(json!({
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": unified.model,
            "content": content,
            "stop_reason": stop_reason.as_claude(),
            "stop_sequence": null,
            "usage": Self::usage_to_json(&unified.usage),
        }))
    }

    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        let event: Value = serde_json::from_slice(chunk)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
        if let Some(err) = in_band_error(Protocol::Claude, &event) {
            return Err(err);
        }

        let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let deltas = match event.get("type").and_then(|t| t.as_str()).unwrap_or_default() {
            "message_start" => {
                let message = event.get("message").cloned().unwrap_or(json!({}));
                state.started = true;
                vec![StreamDelta::MessageStart {
                    id: message.get("id").and_then(|i| i.as_str()).map(String::from),
                    model: message.get("model").and_then(|m| m.as_str()).map(String::from),
                    usage: message.get("usage").map(Self::parse_usage),
                }]
            }
            "content_block_start" => {
                let block = event.get("content_block").cloned().unwrap_or(json!({}));
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => {
                        let id = block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let key = format!("{}:{}", index, id);
                        state.tool_keys.insert(index, key.clone());
                        vec![StreamDelta::ToolCallStart {
                            key,
                            id,
                            name: block
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        }]
                    }
                    Some("text") => block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .filter(|t| !t.is_empty())
                        .map(|t| vec![StreamDelta::Text(t.to_string())])
                        .unwrap_or_default(),
                    _ => vec![],
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta").cloned().unwrap_or(json!({}));
                let text = |field: &str| {
                    delta
                        .get(field)
                        .and_then(|t| t.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => vec![StreamDelta::Text(text("text"))],
                    Some("thinking_delta") => vec![StreamDelta::Thinking(text("thinking"))],
                    Some("signature_delta") => {
                        vec![StreamDelta::ThinkingSignature(text("signature"))]
                    }
                    Some("input_json_delta") => match state.tool_keys.get(&index) {
                        Some(key) => vec![StreamDelta::ToolCallArgs {
                            key: key.clone(),
                            fragment: text("partial_json"),
                        }],
                        None => vec![],
                    },
                    _ => vec![],
                }
            }
            "message_delta" => {
                let mut deltas = vec![];
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(|r| r.as_str())
                {
                    deltas.push(StreamDelta::StopReason(StopReason::from_claude(reason)));
                }
                if let Some(usage) = event.get("usage") {
                    deltas.push(StreamDelta::Usage(Self::parse_usage(usage)));
                }
                deltas
            }
            "message_stop" => vec![StreamDelta::Finish {
                reason: None,
                usage: None,
            }],
            // content_block_stop, ping: block boundaries are tracked by the state machine
            _ => vec![],
        };
        Ok(deltas)
    }

    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        _state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>> {
        let event = match chunk.chunk_type {
            ChunkType::MessageStart => {
                let message = chunk.message.clone().unwrap_or_default();
                let id = if message.id.starts_with("msg_") {
                    message.id
                } else {
                    format!("msg_{}", uuid::Uuid::new_v4().simple())
                };
                json!({
                    "type": "message_start",
                    "message": {
                        "id": id,
                        "type": "message",
                        "role": "assistant",
                        "model": message.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": Self::usage_to_json(&message.usage),
                    }
                })
            }
            ChunkType::ContentBlockStart => {
                let Some(content) = &chunk.content_block else {
                    return Ok(vec![]);
                };
                json!({
                    "type": "content_block_start",
                    "index": chunk.index,
                    "content_block": Self::opening_block(content),
                })
            }
            ChunkType::ContentBlockDelta => {
                let delta = match &chunk.delta {
                    Some(BlockDelta::Text(text)) => json!({"type": "text_delta", "text": text}),
                    Some(BlockDelta::Thinking(text)) => {
                        json!({"type": "thinking_delta", "thinking": text})
                    }
                    Some(BlockDelta::Signature(signature)) => {
                        json!({"type": "signature_delta", "signature": signature})
                    }
                    Some(BlockDelta::InputJson(partial)) => {
                        json!({"type": "input_json_delta", "partial_json": partial})
                    }
                    None => return Ok(vec![]),
                };
                json!({
                    "type": "content_block_delta",
                    "index": chunk.index,
                    "delta": delta,
                })
            }
            ChunkType::ContentBlockStop => {
                json!({"type": "content_block_stop", "index": chunk.index})
            }
            ChunkType::MessageDelta => {
                let usage = chunk.usage.clone().unwrap_or_default();
                json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": chunk.stop_reason.unwrap_or_default().as_claude(),
                        "stop_sequence": null,
                    },
                    "usage": Self::usage_to_json(&usage),
                })
            }
            ChunkType::MessageStop => json!({"type": "message_stop"}),
        };

        let name = event["type"].as_str().unwrap_or("message").to_string();
        Ok(vec![SseFrame::event(name, event.to_string())])
    }
}

// ============================================================================
// Tests
// ============================================================================
