//! Gemini protocol transformer.
//!
//! Handles conversion between the Google Gemini `generateContent` format
//! and the Unified Internal Format. The Gemini CLI envelope reuses these
//! conversions through [`GeminiTransformer::decode_stream_value`] and
//! [`GeminiTransformer::encode_stream_value`].

use super::schema::clean_schema_for_gemini;
use super::stream::{DecoderState, EncoderState, SseFrame, StreamDelta};
use super::{
    in_band_error, tool_result_text, BlockDelta, ChunkType, Protocol, ReasoningConfig, Result,
    Role, StopReason, ToolChoice, Transformer, UnifiedContent, UnifiedMessage, UnifiedRequest,
    UnifiedResponse, UnifiedStreamChunk, UnifiedTool, UnifiedUsage,
};
use crate::core::AppError;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};

// ============================================================================
// Gemini Transformer
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiTransformer;

/// Tracks calls awaiting a `functionResponse` while decoding a conversation.
#[derive(Default)]
struct CallTracker {
    pending: HashMap<String, VecDeque<String>>,
    counter: usize,
}

impl CallTracker {
    fn call_id(&mut self, name: &str, explicit: Option<&str>) -> String {
        let id = match explicit {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.counter += 1;
                format!("call_{}_{}", name, self.counter)
            }
        };
        self.pending
            .entry(name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    /// Match a response to the oldest pending call with the same name.
    fn result_id(&mut self, name: &str, explicit: Option<&str>) -> String {
        if let Some(id) = explicit.filter(|id| !id.is_empty()) {
            if let Some(queue) = self.pending.get_mut(name) {
                queue.retain(|pending| pending != id);
            }
            return id.to_string();
        }
        self.pending
            .get_mut(name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| format!("orphan_{}", name))
    }
}

impl GeminiTransformer {
    pub fn new() -> Self {
        Self
    }

    // -- Helpers: Part <-> UnifiedContent --

    /// Convert a Gemini part to one or more UnifiedContent blocks.
    /// A part carrying `thoughtSignature` yields an extra signature-only Thinking block.
    fn part_to_unified(part: &Value, calls: &mut CallTracker) -> Vec<UnifiedContent> {
        let mut result = Vec::new();
        let signature = part
            .get("thoughtSignature")
            .and_then(|s| s.as_str())
            .map(String::from);

        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                result.push(UnifiedContent::thinking(text, signature));
                return result;
            }
            result.push(UnifiedContent::text(text));
        } else if let Some(fc) = part.get("functionCall") {
            let name = fc.get("name").and_then(|n| n.as_str()).unwrap_or_default();
            let id = calls.call_id(name, fc.get("id").and_then(|i| i.as_str()));
            let args = fc.get("args").cloned().unwrap_or(json!({}));
            result.push(UnifiedContent::tool_use(id, name, args));
        } else if let Some(fr) = part.get("functionResponse") {
            let name = fr.get("name").and_then(|n| n.as_str()).unwrap_or_default();
            let id = calls.result_id(name, fr.get("id").and_then(|i| i.as_str()));
            let response = fr.get("response").cloned().unwrap_or(Value::Null);
            result.push(UnifiedContent::tool_result(id, response, false));
            return result;
        } else if let Some(inline) = part.get("inlineData") {
            let mime = inline
                .get("mimeType")
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            let data = inline.get("data").and_then(|d| d.as_str()).unwrap_or_default();
            result.push(UnifiedContent::image_base64(mime, data));
        } else if let Some(uri) = part.pointer("/fileData/fileUri").and_then(|u| u.as_str()) {
            result.push(UnifiedContent::image_url(uri));
        } else {
            return result;
        }

        if let Some(sig) = signature {
            result.push(UnifiedContent::thinking("", Some(sig)));
        }
        result
    }

    /// Convert a sequence of UnifiedContent to Gemini parts,
    /// re-attaching signature-only Thinking blocks to the preceding part.
    fn unified_contents_to_parts(
        contents: &[UnifiedContent],
        call_names: &HashMap<&str, &str>,
    ) -> Vec<Value> {
        let mut parts: Vec<Value> = Vec::new();
        for content in contents {
            match content {
                UnifiedContent::Thinking {
                    text,
                    signature: Some(sig),
                } if text.is_empty() => {
                    if let Some(last) = parts.last_mut() {
                        last["thoughtSignature"] = json!(sig);
                    }
                }
                UnifiedContent::Thinking { text, signature } => {
                    let mut part = json!({"thought": true, "text": text});
                    if let Some(sig) = signature {
                        part["thoughtSignature"] = json!(sig);
                    }
                    parts.push(part);
                }
                UnifiedContent::Text { text } => parts.push(json!({"text": text})),
                UnifiedContent::ToolUse { name, input, .. } => {
                    parts.push(json!({"functionCall": {"name": name, "args": input}}))
                }
                UnifiedContent::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    let name = call_names
                        .get(tool_use_id.as_str())
                        .copied()
                        .unwrap_or(tool_use_id.as_str());
                    let response = match content {
                        Value::Object(_) => content.clone(),
                        other => json!({"result": tool_result_text(other)}),
                    };
                    parts.push(json!({"functionResponse": {"name": name, "response": response}}));
                }
                UnifiedContent::Image {
                    source_type,
                    media_type,
                    data,
                } => parts.push(if source_type == "url" {
                    json!({"fileData": {"fileUri": data, "mimeType": media_type}})
                } else {
                    json!({"inlineData": {"mimeType": media_type, "data": data}})
                }),
            }
        }
        parts
    }

    fn parse_usage(usage_meta: &Value) -> UnifiedUsage {
        let count = |field: &str| usage_meta.get(field).and_then(|v| v.as_u64());
        let thoughts = count("thoughtsTokenCount");
        UnifiedUsage {
            input_tokens: count("promptTokenCount").unwrap_or(0),
            output_tokens: count("candidatesTokenCount").unwrap_or(0) + thoughts.unwrap_or(0),
            cache_read_tokens: count("cachedContentTokenCount"),
            reasoning_tokens: thoughts,
        }
    }

    fn usage_to_json(usage: &UnifiedUsage) -> Value {
        let mut value = json!({
            "promptTokenCount": usage.input_tokens,
            "candidatesTokenCount": usage.output_tokens.saturating_sub(usage.reasoning_tokens.unwrap_or(0)),
            "totalTokenCount": usage.total_tokens(),
        });
        if let Some(thoughts) = usage.reasoning_tokens {
            value["thoughtsTokenCount"] = json!(thoughts);
        }
        if let Some(cached) = usage.cache_read_tokens {
            value["cachedContentTokenCount"] = json!(cached);
        }
        value
    }

    fn tool_choice_to_unified(config: &Value) -> Option<ToolChoice> {
        let fcc = config.get("functionCallingConfig")?;
        match fcc.get("mode").and_then(|m| m.as_str())? {
            "AUTO" => Some(ToolChoice::Auto),
            "NONE" => Some(ToolChoice::None),
            "ANY" => {
                let names = fcc
                    .get("allowedFunctionNames")
                    .and_then(|n| n.as_array())
                    .filter(|n| n.len() == 1);
                match names.and_then(|n| n[0].as_str()) {
                    Some(name) => Some(ToolChoice::Tool(name.to_string())),
                    None => Some(ToolChoice::Any),
                }
            }
            _ => None,
        }
    }

    fn tool_choice_from_unified(choice: &ToolChoice) -> Value {
        let config = match choice {
            ToolChoice::Auto => json!({"mode": "AUTO"}),
            ToolChoice::Any => json!({"mode": "ANY"}),
            ToolChoice::None => json!({"mode": "NONE"}),
            ToolChoice::Tool(name) => json!({"mode": "ANY", "allowedFunctionNames": [name]}),
        };
        json!({"functionCallingConfig": config})
    }

    fn reasoning_from_config(thinking: &Value) -> Option<ReasoningConfig> {
        if let Some(level) = thinking.get("thinkingLevel").and_then(|l| l.as_str()) {
            return Some(ReasoningConfig {
                effort: Some(level.to_lowercase()),
                budget_tokens: None,
            });
        }
        let budget = thinking.get("thinkingBudget").and_then(|b| b.as_i64())?;
        Some(if budget < 0 {
            // -1 asks the model to size its own budget
            ReasoningConfig {
                effort: Some("medium".to_string()),
                budget_tokens: None,
            }
        } else {
            ReasoningConfig {
                effort: None,
                budget_tokens: Some(budget),
            }
        })
    }

    /// Decode one Gemini response chunk (already unwrapped from any envelope).
    pub(crate) fn decode_stream_value(
        value: &Value,
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        if let Some(err) = in_band_error(Protocol::Gemini, value) {
            return Err(err);
        }

        let mut deltas = Vec::new();
        if !state.started {
            state.started = true;
            deltas.push(StreamDelta::MessageStart {
                id: value
                    .get("responseId")
                    .and_then(|i| i.as_str())
                    .map(String::from),
                model: value
                    .get("modelVersion")
                    .and_then(|m| m.as_str())
                    .map(String::from),
                usage: None,
            });
        }

        let candidate = value.pointer("/candidates/0");
        for part in candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
        {
            let signature = part.get("thoughtSignature").and_then(|s| s.as_str());
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                    deltas.push(StreamDelta::Thinking(text.to_string()));
                } else {
                    deltas.push(StreamDelta::Text(text.to_string()));
                }
            } else if let Some(fc) = part.get("functionCall") {
                deltas.push(StreamDelta::ToolCall {
                    id: fc
                        .get("id")
                        .and_then(|i| i.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: fc.get("args").cloned().unwrap_or(json!({})).to_string(),
                });
            }
            if let Some(sig) = signature {
                deltas.push(StreamDelta::ThinkingSignature(sig.to_string()));
            }
        }

        let reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(|r| r.as_str())
            .map(StopReason::from_gemini);
        let usage = value.get("usageMetadata").map(Self::parse_usage);
        match (reason, usage) {
            (Some(reason), Some(usage)) => deltas.push(StreamDelta::Finish {
                reason: Some(reason),
                usage: Some(usage),
            }),
            (Some(reason), None) => deltas.push(StreamDelta::StopReason(reason)),
            (None, Some(usage)) => deltas.push(StreamDelta::Usage(usage)),
            (None, None) => {}
        }
        Ok(deltas)
    }

    /// Encode one block event as a Gemini response chunk, if it produces one.
    pub(crate) fn encode_stream_value(
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Option<Value> {
        let (parts, finish, usage) = match chunk.chunk_type {
            ChunkType::MessageStart => {
                let message = chunk.message.as_ref();
                state.id = message.map(|m| m.id.clone()).unwrap_or_default();
                state.model = message.map(|m| m.model.clone()).unwrap_or_default();
                return None;
            }
            ChunkType::ContentBlockDelta => match &chunk.delta {
                Some(BlockDelta::Text(text)) => (vec![json!({"text": text})], None, None),
                Some(BlockDelta::Thinking(text)) => {
                    (vec![json!({"text": text, "thought": true})], None, None)
                }
                Some(BlockDelta::Signature(sig)) if !sig.is_empty() => (
                    vec![json!({"text": "", "thought": true, "thoughtSignature": sig})],
                    None,
                    None,
                ),
                _ => return None,
            },
            ChunkType::ContentBlockStop => match &chunk.content_block {
                Some(UnifiedContent::ToolUse { name, input, .. }) => (
                    vec![json!({"functionCall": {"name": name, "args": input}})],
                    None,
                    None,
                ),
                _ => return None,
            },
            ChunkType::MessageDelta => (
                vec![json!({"text": ""})],
                Some(chunk.stop_reason.unwrap_or_default().as_gemini()),
                chunk.usage.as_ref().map(Self::usage_to_json),
            ),
            ChunkType::ContentBlockStart | ChunkType::MessageStop => return None,
        };

        let mut candidate = json!({
            "content": {"role": "model", "parts": parts},
            "index": 0,
        });
        if let Some(finish) = finish {
            candidate["finishReason"] = json!(finish);
        }
        let mut value = json!({
            "candidates": [candidate],
            "modelVersion": state.model,
            "responseId": state.id,
        });
        if let Some(usage) = usage {
            value["usageMetadata"] = usage;
        }
        Some(value)
    }
}

/// Append a content, merging into the previous one when the role repeats.
fn push_merged(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut() {
        if last["role"] == role {
            if let Some(existing) = last["parts"].as_array_mut() {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({"role": role, "parts": parts}));
}

impl Transformer for GeminiTransformer {
    fn protocol(&self) -> Protocol {
        Protocol::Gemini
    }

    fn transform_request_out(&self, raw: Value) -> Result<UnifiedRequest> {
        let contents = raw
            .get("contents")
            .and_then(|c| c.as_array())
            .ok_or_else(|| AppError::BadRequest("Missing 'contents' field".into()))?;

        let mut calls = CallTracker::default();
        let messages = contents
            .iter()
            .map(|content| {
                let role = match content.get("role").and_then(|r| r.as_str()) {
                    Some("model") => Role::Assistant,
                    _ => Role::User,
                };
                let blocks = content
                    .get("parts")
                    .and_then(|p| p.as_array())
                    .into_iter()
                    .flatten()
                    .flat_map(|part| Self::part_to_unified(part, &mut calls))
                    .collect();
                UnifiedMessage::with_content(role, blocks)
            })
            .collect();

        let model = raw
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .trim_start_matches("models/")
            .to_string();
        let mut unified = UnifiedRequest::new(model, messages);

        if let Some(parts) = raw
            .pointer("/systemInstruction/parts")
            .and_then(|p| p.as_array())
        {
            let text = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            unified.push_system(&text);
        }

        let config = raw.get("generationConfig").cloned().unwrap_or(json!({}));
        let params = &mut unified.parameters;
        params.temperature = config.get("temperature").and_then(|v| v.as_f64());
        params.top_p = config.get("topP").and_then(|v| v.as_f64());
        params.top_k = config.get("topK").and_then(|v| v.as_u64());
        params.max_tokens = config.get("maxOutputTokens").and_then(|v| v.as_u64());
        params.stop_sequences = config
            .get("stopSequences")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str().map(String::from))
                    .collect()
            });
        params.reasoning = config
            .get("thinkingConfig")
            .and_then(Self::reasoning_from_config);

        unified.tools = raw
            .get("tools")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
            .filter_map(|group| group.get("functionDeclarations").and_then(|d| d.as_array()))
            .flatten()
            .filter_map(|decl| {
                Some(UnifiedTool {
                    name: decl.get("name")?.as_str()?.to_string(),
                    description: decl
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(String::from),
                    input_schema: decl
                        .get("parameters")
                        .or_else(|| decl.get("parametersJsonSchema"))
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    strict: None,
                })
            })
            .collect();
        unified.tool_choice = raw
            .get("toolConfig")
            .and_then(Self::tool_choice_to_unified);

        Ok(unified)
    }

    fn transform_request_in(&self, unified: &UnifiedRequest) -> Result<Value> {
        let call_names: HashMap<&str, &str> = unified
            .messages
            .iter()
            .flat_map(|m| m.tool_uses().map(|(id, name, _)| (id, name)))
            .collect();

        let mut contents = Vec::new();
        for msg in &unified.messages {
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let parts = Self::unified_contents_to_parts(&msg.content, &call_names);
            push_merged(&mut contents, role, parts);
        }

        let mut body = json!({"contents": contents});
        if let Some(system) = unified.system.as_ref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let params = &unified.parameters;
        let mut config = serde_json::Map::new();
        if let Some(temperature) = params.temperature {
            config.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = params.top_p {
            config.insert("topP".into(), json!(top_p));
        }
        if let Some(top_k) = params.top_k {
            config.insert("topK".into(), json!(top_k));
        }
        if let Some(max_tokens) = params.max_tokens {
            config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(stop) = &params.stop_sequences {
            config.insert("stopSequences".into(), json!(stop));
        }
        if let Some(budget) = params.reasoning.as_ref().and_then(|r| r.budget()) {
            config.insert(
                "thinkingConfig".into(),
                json!({"thinkingBudget": budget, "includeThoughts": budget > 0}),
            );
        }
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }

        if !unified.tools.is_empty() {
            let declarations: Vec<Value> = unified
                .tools
                .iter()
                .map(|tool| {
                    let mut decl = json!({
                        "name": tool.name,
                        "parameters": clean_schema_for_gemini(&tool.input_schema),
                    });
                    if let Some(description) = &tool.description {
                        decl["description"] = json!(description);
                    }
                    decl
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        if let Some(choice) = &unified.tool_choice {
            body["toolConfig"] = Self::tool_choice_from_unified(choice);
        }
        Ok(body)
    }

    fn transform_response_in(&self, raw: Value, original_model: &str) -> Result<UnifiedResponse> {
        if let Some(err) = in_band_error(Protocol::Gemini, &raw) {
            return Err(err);
        }
        let candidate = raw.pointer("/candidates/0").cloned().unwrap_or(json!({}));
        let mut calls = CallTracker::default();
        let content: Vec<UnifiedContent> = candidate
            .pointer("/content/parts")
            .and_then(|p| p.as_array())
            .into_iter()
            .flatten()
            .flat_map(|part| Self::part_to_unified(part, &mut calls))
            .collect();

        Ok(UnifiedResponse {
            id: raw
                .get("responseId")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            model: raw
                .get("modelVersion")
                .and_then(|m| m.as_str())
                .unwrap_or(original_model)
                .to_string(),
            content,
            stop_reason: candidate
                .get("finishReason")
                .and_then(|r| r.as_str())
                .map(StopReason::from_gemini),
            usage: raw
                .get("usageMetadata")
                .map(Self::parse_usage)
                .unwrap_or_default(),
        })
    }

    fn transform_response_out(&self, unified: &UnifiedResponse) -> Result<Value> {
        let parts = Self::unified_contents_to_parts(&unified.content, &HashMap::new());
        Ok(json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": unified.stop_reason.unwrap_or_default().as_gemini(),
                "index": 0,
            }],
            "usageMetadata": Self::usage_to_json(&unified.usage),
            "modelVersion": unified.model,
            "responseId": unified.id,
        }))
    }

    fn transform_stream_chunk_in(
        &self,
        chunk: &[u8],
        state: &mut DecoderState,
    ) -> Result<Vec<StreamDelta>> {
        let value: Value = serde_json::from_slice(chunk)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON: {}", e)))?;
        Self::decode_stream_value(&value, state)
    }

    fn transform_stream_chunk_out(
        &self,
        chunk: &UnifiedStreamChunk,
        state: &mut EncoderState,
    ) -> Result<Vec<SseFrame>> {
        Ok(Self::encode_stream_value(chunk, state)
            .map(|value| vec![SseFrame::data(value.to_string())])
            .unwrap_or_default())
    }
}

// ============================================================================
// Tests
// ============================================================================
