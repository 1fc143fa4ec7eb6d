//! OpenAI protocol transformer.
//!
//! Handles conversion between OpenAI Chat Completions API format and
//! the Unified Internal Format.

use super::stream::{DecoderState, EncoderState, SseFrame, StreamDelta};
use super::{
    image_from_url, in_band_error, tool_result_text, BlockDelta, ChunkType, Protocol,
    ReasoningConfig, Result, Role, StopReason, ToolChoice, Transformer, UnifiedContent,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, UnifiedStreamChunk, UnifiedTool,
    UnifiedUsage,
};
use crate::core::AppError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// OpenAI Request Types
// ============================================================================

/// OpenAI message format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAIContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// OpenAI content can be string or array of content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    Text(String),
    Parts(Vec<Value>),
}

/// OpenAI tool call structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: OpenAIFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// OpenAI Chat Completions request body.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_completion_tokens: Option<u64>,
    #[serde(default)]
    pub stop: Option<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

// ============================================================================
// OpenAI Transformer
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAITransformer;

impl OpenAITransformer {
    pub fn new() -> Self {
        Self
    }

    fn message_to_unified(msg: OpenAIMessage, request: &mut UnifiedRequest) -> Result<()> {
        let role = match msg.role.as_str() {
            "system" | "developer" => {
                let text = msg.content.map(content_text).unwrap_or_default();
                request.push_system(&text);
                return Ok(());
            }
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" | "function" => Role::Tool,
            other => {
                return Err(AppError::BadRequest(format!(
                    "Unsupported message role: {}",
                    other
                )))
            }
        };

        let mut content = Vec::new();
        if role == Role::Tool {
            let tool_call_id = msg.tool_call_id.unwrap_or_default();
            let value = match msg.content {
                Some(OpenAIContent::Text(text)) => Value::String(text),
                Some(OpenAIContent::Parts(parts)) => Value::Array(parts),
                None => Value::String(String::new()),
            };
            content.push(UnifiedContent::tool_result(tool_call_id, value, false));
            request
                .messages
                .push(UnifiedMessage::with_content(role, content));
            return Ok(());
        }

        if let Some(reasoning) = msg.reasoning_content.filter(|r| !r.is_empty()) {
            content.push(UnifiedContent::thinking(reasoning, None));
        }
        match msg.content {
            Some(OpenAIContent::Text(text)) if !text.is_empty() => {
                content.push(UnifiedContent::text(text))
            }
            Some(OpenAIContent::Parts(parts)) => {
                content.extend(parts.iter().filter_map(part_to_unified))
            }
            _ => {}
        }
        for call in msg.tool_calls.unwrap_or_default() {
            content.push(UnifiedContent::tool_use(
                call.id,
                call.function.name,
                parse_arguments(&call.function.arguments),
            ));
        }
        request
            .messages
            .push(UnifiedMessage::with_content(role, content));
        Ok(())
    }

    fn unified_to_messages(msg: &UnifiedMessage, out: &mut Vec<Value>) {
        match msg.role {
            Role::Tool => {
                for content in &msg.content {
                    if let UnifiedContent::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = content
                    {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": tool_result_text(content),
                        }));
                    }
                }
            }
            Role::Assistant => {
                let text = msg.text_content();
                let content = if text.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };
                let mut message = json!({"role": "assistant", "content": content});
                let calls: Vec<Value> = msg
                    .tool_uses()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })
                    })
                    .collect();
                if !calls.is_empty() {
                    message["tool_calls"] = Value::Array(calls);
                }
                out.push(message);
            }
            Role::User | Role::System => {
                let only_text = msg
                    .content
                    .iter()
                    .all(|c| matches!(c, UnifiedContent::Text { .. }));
                let content = if only_text {
                    Value::String(msg.text_content())
                } else {
                    Value::Array(msg.content.iter().filter_map(unified_to_part).collect())
                };
                let role = if msg.role == Role::System { "system" } else { "user" };
                out.push(json!({"role": role, "content": content}));
            }
        }
    }

    fn tool_to_unified(tool: &Value) -> Option<UnifiedTool> {
        let function = tool.get("function")?;
        let name = function.get("name")?.as_str()?;
        Some(UnifiedTool {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(|d| d.as_str())
                .map(String::from),
            input_schema: function
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            strict: function.get("strict").and_then(|s| s.as_bool()),
        })
    }

    fn tool_choice_to_unified(choice: &Value) -> Option<ToolChoice> {
        match choice {
            Value::String(s) => match s.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "required" => Some(ToolChoice::Any),
                _ => None,
            },
            Value::Object(_) => choice
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .map(|n| ToolChoice::Tool(n.to_string())),
            _ => None,
        }
    }

    fn tool_choice_from_unified(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
        }
    }

    fn parse_usage(usage: &Value) -> UnifiedUsage {
        UnifiedUsage {
            input_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            cache_read_tokens: usage
                .pointer("/prompt_tokens_details/cached_tokens")
                .and_then(|v| v.as_u64()),
            reasoning_tokens: usage
                .pointer("/completion_tokens_details/reasoning_tokens")
                .and_then(|v| v.as_u64()),
        }
    }

    fn usage_to_json(usage: &UnifiedUsage) -> Value {
        let mut value = json!({
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.total_tokens(),
        });
        if let Some(cached) = usage.cache_read_tokens {
            value["prompt_tokens_details"] = json!({"cached_tokens": cached});
        }
        if let Some(reasoning) = usage.reasoning_tokens {
            value["completion_tokens_details"] = json!({"reasoning_tokens": reasoning});
        }
        value
    }

    fn stream_chunk(state: &EncoderState, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": state.id,
            "object": "chat.completion.chunk",
            "created": state.created,
            "model": state.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

/// Concatenated text of string or part-array content.
fn content_text(content: OpenAIContent) -> String {
    match content {
        OpenAIContent::Text(text) => text,
        OpenAIContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn part_to_unified(part: &Value) -> Option<UnifiedContent> {
    match part.get("type").and_then(|t| t.as_str())? {
        "text" => Some(UnifiedContent::text(part.get("text")?.as_str()?)),
        "image_url" => {
            let url = part
                .pointer("/image_url/url")
                .or_else(|| part.get("image_url"))?
                .as_str()?;
            Some(image_from_url(url))
        }
        _ => None,
    }
}

fn unified_to_part(content: &UnifiedContent) -> Option<Value> {
    match content {
        UnifiedContent::Text { text } => Some(json!({"type": "text", "text": text})),
        UnifiedContent::Image { .. } => Some(json!({
            "type": "image_url",
            "image_url": {"url": content.image_as_url()?},
        })),
        _ => None,
    }
}

/// Tool-call arguments arrive as a JSON string; keep unparseable text as a string.
pub(crate) fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

impl Transformer for OpenAITransformer {
    fn protocol(&self) -> Protocol {
        Protocol::OpenAI
    }

    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest> {
        let req: OpenAIRequest =
            serde_json::from_value(raw).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let mut unified = UnifiedRequest::new(req.model, vec![]);
        for msg in req.messages {
            Self::message_to_unified(msg, &mut unified)?;
        }

        let params = &mut unified.parameters;
        params.temperature = req.temperature;
        params.top_p = req.top_p;
        params.max_tokens = req.max_completion_tokens.or(req.max_tokens);
        params.stream = req.stream.unwrap_or(false);
        params.stop_sequences = match req.stop {
            Some(Value::String(s)) => Some(vec![s]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect(),
            ),
            _ => None,
        };
        params.reasoning = req.reasoning_effort.map(|effort| ReasoningConfig {
            effort: Some(effort),
            budget_tokens: None,
        });

        unified.tools = req
            .tools
            .unwrap_or_default()
            .iter()
            .filter_map(Self::tool_to_unified)
            .collect();
        unified.tool_choice = req
            .tool_choice
            .as_ref()
            .and_then(Self::tool_choice_to_unified);

        Ok(unified)
    }

    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value> {
        let mut messages = Vec::new();
        if let Some(system) = unified.system.as_ref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in &unified.messages {
            Self::unified_to_messages(msg, &mut messages);
        }

        let params = &unified.parameters;
        let mut body = json!({
            "model": unified.model,
            "messages": messages,
            "stream": params.stream,
        });
        if params.stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(stop) = &params.stop_sequences {
            body["stop"] = json!(stop);
        }
        if let Some(effort) = params.reasoning.as_ref().and_then(|r| r.effort_level()) {
            body["reasoning_effort"] = json!(effort);
        }
        if !unified.tools.is_empty() {
            body["tools"] = Value::Array(
                unified
                    .tools
                    .iter()
                    .map(|tool| {
                        let mut function = json!({
                            "name": tool.name,
                            "parameters": tool.input_schema,
                        });
                        if let Some(description) = &tool.description {
                            function["description"] = json!(description);
                        }
                        if let Some(strict) = tool.strict {
                            function["strict"] = json!(strict);
                        }
                        json!({"type": "function", "function": function})
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
        if let Some(err) = in_band_error(Protocol::OpenAI, &raw) {
            return Err(err);
        }
        let choice = raw
            .pointer("/choices/0")
            .ok_or_else(|| AppError::BadRequest("No choices in response".to_string()))?;
        let message = choice.get("message").cloned().unwrap_or(json!({}));

        let mut content = Vec::new();
        if let Some(reasoning) = message
            .get("reasoning_content")
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
        {
            content.push(UnifiedContent::thinking(reasoning, None));
        }
        if let Some(text) = message
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|t| !t.is_empty())
        {
            content.push(UnifiedContent::text(text));
        }
        for call in message
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
        {
            let name = call
                .pointer("/function/name")
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            let arguments = call
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
                .unwrap_or_default();
            content.push(UnifiedContent::tool_use(
                call.get("id").and_then(|i| i.as_str()).unwrap_or_default(),
                name,
                parse_arguments(arguments),
            ));
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
            stop_reason: choice
                .get("finish_reason")
                .and_then(|r| r.as_str())
                .map(StopReason::from_openai),
            usage: raw.get("usage").map(Self::parse_usage).unwrap_or_default(),
        })
    }

    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value> {
        let text = unified.text_content();
        let content = if text.is_empty() && unified.has_tool_use() {
            Value::Null
        } else {
            Value::String(text)
        };
        let mut message = json!({"role": "assistant", "content": content});
        let reasoning: String = unified
            .content
            .iter()
            .filter_map(|c| match c {
                UnifiedContent::Thinking { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if !reasoning.is_empty() {
            message["reasoning_content"] = json!(reasoning);
        }
        let calls: Vec<Value> = unified
            .content
            .iter()
            .filter_map(|c| match c {
                UnifiedContent::ToolUse { id, name, input } => Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                })),
                _ => None,
            })
            .collect();
        if !calls.is_empty() {
            message["tool_calls"] = Value::Array(calls);
        }

        let stop_reason = if unified.has_tool_use() {
            StopReason::ToolUse
        } else {
            unified.stop_reason.unwrap_or_default()
        };
        Ok(json!({
            "id": unified.id,
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": unified.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": stop_reason.as_openai(),
            }],
            "usage": Self::usage_to_json(&unified.usage),
        }))
    }

    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| AppError::BadRequest(format!("Invalid UTF-8: {}", e)))?
            .trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        if text == "[DONE]" {
            return Ok(vec![StreamDelta::Finish {
                reason: None,
                usage: None,
            }]);
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
        if let Some(err) = in_band_error(Protocol::OpenAI, &value) {
            return Err(err);
        }

        let mut deltas = Vec::new();
        if !state.started {
            state.started = true;
            deltas.push(StreamDelta::MessageStart {
                id: value.get("id").and_then(|i| i.as_str()).map(String::from),
                model: value.get("model").and_then(|m| m.as_str()).map(String::from),
                usage: None,
            });
        }

        if let Some(choice) = value.pointer("/choices/0") {
            let delta = choice.get("delta").cloned().unwrap_or(json!({}));
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
                deltas.push(StreamDelta::Thinking(reasoning.to_string()));
            }
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                deltas.push(StreamDelta::Text(text.to_string()));
            }
            for call in delta
                .get("tool_calls")
                .and_then(|t| t.as_array())
                .into_iter()
                .flatten()
            {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let id = call.get("id").and_then(|i| i.as_str());
                let name = call.pointer("/function/name").and_then(|n| n.as_str());
                if id.is_some() || !state.tool_keys.contains_key(&index) {
                    let key = format!("{}:{}", index, id.unwrap_or_default());
                    state.tool_keys.insert(index, key.clone());
                    deltas.push(StreamDelta::ToolCallStart {
                        key,
                        id: id.unwrap_or_default().to_string(),
                        name: name.unwrap_or_default().to_string(),
                    });
                }
                if let Some(fragment) = call
                    .pointer("/function/arguments")
                    .and_then(|a| a.as_str())
                    .filter(|a| !a.is_empty())
                {
                    if let Some(key) = state.tool_keys.get(&index) {
                        deltas.push(StreamDelta::ToolCallArgs {
                            key: key.clone(),
                            fragment: fragment.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                deltas.push(StreamDelta::StopReason(StopReason::from_openai(reason)));
            }
        }

        if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
            deltas.push(StreamDelta::Usage(Self::parse_usage(usage)));
        }
        Ok(deltas)
    }

    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>> {
        let value = match chunk.chunk_type {
            ChunkType::MessageStart => {
                if state.role_sent {
                    return Ok(vec![]);
                }
                state.role_sent = true;
                let message = chunk.message.as_ref();
                state.id = message
                    .map(|m| m.id.clone())
                    .filter(|id| id.starts_with("chatcmpl"))
                    .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()));
                state.model = message.map(|m| m.model.clone()).unwrap_or_default();
                state.created = chrono::Utc::now().timestamp();
                Self::stream_chunk(state, json!({"role": "assistant", "content": ""}), None)
            }
            ChunkType::ContentBlockStart => match &chunk.content_block {
                Some(UnifiedContent::ToolUse { id, name, .. }) => {
                    let index = state.tool_count;
                    state.tool_count += 1;
                    state.tool_index = Some(index);
                    Self::stream_chunk(
                        state,
                        json!({"tool_calls": [{
                            "index": index,
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": ""},
                        }]}),
                        None,
                    )
                }
                _ => return Ok(vec![]),
            },
            ChunkType::ContentBlockDelta => match &chunk.delta {
                Some(BlockDelta::Text(text)) => {
                    Self::stream_chunk(state, json!({"content": text}), None)
                }
                Some(BlockDelta::Thinking(text)) => {
                    Self::stream_chunk(state, json!({"reasoning_content": text}), None)
                }
                Some(BlockDelta::InputJson(arguments)) => Self::stream_chunk(
                    state,
                    json!({"tool_calls": [{
                        "index": state.tool_index.unwrap_or(0),
                        "function": {"arguments": arguments},
                    }]}),
                    None,
                ),
                Some(BlockDelta::Signature(_)) | None => return Ok(vec![]),
            },
            ChunkType::MessageDelta => {
                let reason = chunk.stop_reason.unwrap_or_default();
                let mut value = Self::stream_chunk(state, json!({}), Some(reason.as_openai()));
                if let Some(usage) = &chunk.usage {
                    value["usage"] = Self::usage_to_json(usage);
                }
                value
            }
            ChunkType::ContentBlockStop | ChunkType::MessageStop => return Ok(vec![]),
        };
        Ok(vec![SseFrame::data(value.to_string())])
    }
}

// ============================================================================
// Tests
// ============================================================================
