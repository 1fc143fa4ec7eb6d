//! Unified Internal Format (UIF) for protocol-neutral message representation.
//!
//! Every cross-protocol translation decodes into these types and encodes back
//! out of them, so each protocol only has to know its own wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Protocol Types
// ============================================================================

/// Wire protocols the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "openai-responses")]
    OpenAIResponses,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "codex")]
    Codex,
}

impl Protocol {
    /// Every protocol, in registration order.
    pub const ALL: [Protocol; 6] = [
        Protocol::OpenAI,
        Protocol::OpenAIResponses,
        Protocol::Claude,
        Protocol::Gemini,
        Protocol::GeminiCli,
        Protocol::Codex,
    ];

    /// Stable identifier used as a map key and in configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::OpenAI => "openai",
            Protocol::OpenAIResponses => "openai-responses",
            Protocol::Claude => "claude",
            Protocol::Gemini => "gemini",
            Protocol::GeminiCli => "gemini-cli",
            Protocol::Codex => "codex",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "chat" => Ok(Protocol::OpenAI),
            "openai-responses" | "responses" => Ok(Protocol::OpenAIResponses),
            "claude" | "anthropic" => Ok(Protocol::Claude),
            "gemini" => Ok(Protocol::Gemini),
            "gemini-cli" => Ok(Protocol::GeminiCli),
            "codex" => Ok(Protocol::Codex),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Unified message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    /// Carrier for tool results
    Tool,
}

/// Unified content block types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedContent {
    Text { text: String },

    /// Image content (base64 or URL)
    Image {
        source_type: String, // "base64" | "url"
        media_type: String,
        data: String,
    },

    /// Tool invocation from the assistant
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    /// Reasoning content. `signature` carries Claude signatures and Gemini thought signatures.
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl UnifiedContent {
    pub fn text(text: impl Into<String>) -> Self {
        UnifiedContent::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        UnifiedContent::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value, is_error: bool) -> Self {
        UnifiedContent::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
        }
    }

    pub fn image_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        UnifiedContent::Image {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        UnifiedContent::Image {
            source_type: "url".to_string(),
            media_type: String::new(),
            data: url.into(),
        }
    }

    pub fn thinking(text: impl Into<String>, signature: Option<String>) -> Self {
        UnifiedContent::Thinking {
            text: text.into(),
            signature,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            UnifiedContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Render an image as a `data:` URL or plain URL.
    pub fn image_as_url(&self) -> Option<String> {
        match self {
            UnifiedContent::Image {
                source_type,
                media_type,
                data,
            } if source_type == "base64" => Some(format!("data:{};base64,{}", media_type, data)),
            UnifiedContent::Image { data, .. } => Some(data.clone()),
            _ => None,
        }
    }
}

/// Parse a `data:<mime>;base64,<payload>` URL, falling back to a URL image.
pub fn image_from_url(url: &str) -> UnifiedContent {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return UnifiedContent::image_base64(mime, data);
        }
    }
    UnifiedContent::image_url(url)
}

/// Flatten a tool result payload to plain text.
///
/// Strings pass through, arrays of `{type: text}` blocks are joined, anything
/// else is serialized as JSON.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Unified message structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub role: Role,
    pub content: Vec<UnifiedContent>,
}

impl UnifiedMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        UnifiedMessage {
            role,
            content: vec![UnifiedContent::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_content(role: Role, content: Vec<UnifiedContent>) -> Self {
        UnifiedMessage { role, content }
    }

    /// Concatenated text of all text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|c| match c {
            UnifiedContent::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

// ============================================================================
// Tool Types
// ============================================================================

/// Unified tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl UnifiedTool {
    pub fn function(name: impl Into<String>, description: Option<String>, input_schema: Value) -> Self {
        UnifiedTool {
            name: name.into(),
            description,
            input_schema,
            strict: None,
        }
    }
}

/// How the model may use the declared tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    /// Must call some tool (`required` / `any` / `ANY`)
    Any,
    None,
    /// Must call this named tool
    Tool(String),
}

// ============================================================================
// Parameters Types
// ============================================================================

/// Reasoning controls, either as an effort level or a token budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<i64>,
}

impl ReasoningConfig {
    /// Token budget, derived from the effort level when only that is set.
    pub fn budget(&self) -> Option<i64> {
        self.budget_tokens.or_else(|| {
            self.effort.as_deref().map(|effort| match effort {
                "none" | "minimal" => 0,
                "low" => 1024,
                "high" => 24576,
                _ => 8192,
            })
        })
    }

    /// Effort level, derived from the budget when only that is set.
    pub fn effort_level(&self) -> Option<String> {
        if let Some(effort) = &self.effort {
            return Some(effort.clone());
        }
        self.budget_tokens.map(|budget| {
            match budget {
                b if b <= 0 => "minimal",
                b if b <= 1024 => "low",
                b if b <= 8192 => "medium",
                _ => "high",
            }
            .to_string()
        })
    }
}

/// Unified model parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default)]
    pub stream: bool,
}

// ============================================================================
// Request Types
// ============================================================================

/// Unified request structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<UnifiedMessage>,
    /// System prompt, kept apart from messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default)]
    pub parameters: UnifiedParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<UnifiedTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

impl UnifiedRequest {
    pub fn new(model: impl Into<String>, messages: Vec<UnifiedMessage>) -> Self {
        UnifiedRequest {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.parameters.stream = stream;
        self
    }

    /// Append system text, joining with a newline when some already exists.
    pub fn push_system(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match &mut self.system {
            Some(existing) if !existing.is_empty() => {
                existing.push('\n');
                existing.push_str(text);
            }
            _ => self.system = Some(text.to_string()),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Stop reason enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    ContentFilter,
}

impl StopReason {
    /// Claude `stop_reason` vocabulary.
    pub const fn as_claude(self) -> &'static str {
        match self {
            StopReason::EndTurn | StopReason::ContentFilter => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::ToolUse => "tool_use",
        }
    }

    pub fn from_claude(reason: &str) -> Self {
        match reason {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            "tool_use" => StopReason::ToolUse,
            "refusal" => StopReason::ContentFilter,
            _ => StopReason::EndTurn,
        }
    }

    /// OpenAI `finish_reason` vocabulary.
    pub const fn as_openai(self) -> &'static str {
        match self {
            StopReason::EndTurn | StopReason::StopSequence => "stop",
            StopReason::MaxTokens => "length",
            StopReason::ToolUse => "tool_calls",
            StopReason::ContentFilter => "content_filter",
        }
    }

    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "length" => StopReason::MaxTokens,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            "content_filter" => StopReason::ContentFilter,
            _ => StopReason::EndTurn,
        }
    }

    /// Gemini `finishReason` vocabulary.
    pub const fn as_gemini(self) -> &'static str {
        match self {
            StopReason::EndTurn | StopReason::StopSequence | StopReason::ToolUse => "STOP",
            StopReason::MaxTokens => "MAX_TOKENS",
            StopReason::ContentFilter => "SAFETY",
        }
    }

    pub fn from_gemini(reason: &str) -> Self {
        match reason {
            "MAX_TOKENS" => StopReason::MaxTokens,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                StopReason::ContentFilter
            }
            _ => StopReason::EndTurn,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_claude())
    }
}

/// Unified usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

impl UnifiedUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        UnifiedUsage {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold in a later report. Backends report cumulative counters, so non-zero
    /// values replace what was seen before.
    pub fn merge(&mut self, later: &UnifiedUsage) {
        if later.input_tokens > 0 {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens > 0 {
            self.output_tokens = later.output_tokens;
        }
        if later.cache_read_tokens.is_some() {
            self.cache_read_tokens = later.cache_read_tokens;
        }
        if later.reasoning_tokens.is_some() {
            self.reasoning_tokens = later.reasoning_tokens;
        }
    }
}

/// Unified response structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<UnifiedContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub usage: UnifiedUsage,
}

impl UnifiedResponse {
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, UnifiedContent::ToolUse { .. }))
    }
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Unified streaming chunk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    MessageDelta,
    MessageStop,
}

/// Incremental payload carried by a `ContentBlockDelta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BlockDelta {
    Text(String),
    Thinking(String),
    /// Terminating delta of a thinking block
    Signature(String),
    /// Complete tool-call arguments, emitted once before the block closes
    InputJson(String),
}

/// One block-structured stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedStreamChunk {
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<BlockDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UnifiedUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Message metadata for `MessageStart`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<UnifiedResponse>,
    /// Opening block for `ContentBlockStart`; the completed block for a tool-call `ContentBlockStop`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_block: Option<UnifiedContent>,
}

impl UnifiedStreamChunk {
    fn bare(chunk_type: ChunkType, index: usize) -> Self {
        UnifiedStreamChunk {
            chunk_type,
            index,
            delta: None,
            usage: None,
            stop_reason: None,
            message: None,
            content_block: None,
        }
    }

    pub fn message_start(message: UnifiedResponse) -> Self {
        UnifiedStreamChunk {
            usage: Some(message.usage.clone()),
            message: Some(message),
            ..Self::bare(ChunkType::MessageStart, 0)
        }
    }

    pub fn content_block_start(index: usize, content_block: UnifiedContent) -> Self {
        UnifiedStreamChunk {
            content_block: Some(content_block),
            ..Self::bare(ChunkType::ContentBlockStart, index)
        }
    }

    pub fn content_block_delta(index: usize, delta: BlockDelta) -> Self {
        UnifiedStreamChunk {
            delta: Some(delta),
            ..Self::bare(ChunkType::ContentBlockDelta, index)
        }
    }

    pub fn content_block_stop(index: usize, completed: Option<UnifiedContent>) -> Self {
        UnifiedStreamChunk {
            content_block: completed,
            ..Self::bare(ChunkType::ContentBlockStop, index)
        }
    }

    pub fn message_delta(stop_reason: StopReason, usage: UnifiedUsage) -> Self {
        UnifiedStreamChunk {
            usage: Some(usage),
            stop_reason: Some(stop_reason),
            ..Self::bare(ChunkType::MessageDelta, 0)
        }
    }

    pub fn message_stop() -> Self {
        Self::bare(ChunkType::MessageStop, 0)
    }
}

// ============================================================================
// Tests
// ============================================================================
