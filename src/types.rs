//! Protocol types: messages, content blocks, requests, responses and stream events
//!
//! Everything in this module mirrors the JSON schema spoken by the Messages
//! endpoint. Serialization follows two rules the server depends on:
//!
//! - fields that are logically absent (no system prompt, no tools, unset
//!   temperature, thinking disabled, non-streaming) are **omitted**, never sent
//!   as `null` or an empty placeholder
//! - deserialization ignores unknown fields and defaults missing optional ones,
//!   so newer server revisions do not break older clients

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;
use std::ops::AddAssign;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Accepts an integer count, `null`, or a missing field (all non-integers become 0)
fn count_or_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Message role in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One typed unit of message content
///
/// Every consumer matches exhaustively, so adding a kind is a compile-time
/// audit of all the sites that fold, render or serialize blocks. Kinds this
/// crate does not model (`redacted_thinking`, `server_tool_use`, ...) are
/// kept as [`ContentBlock::Other`] and serialize back byte-for-byte, since
/// the server expects some of them replayed in later requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Thinking(ThinkingBlock),
    Other(Value),
}

/// Wire form of the modelled block kinds
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedBlockRef<'a> {
    Text(&'a TextBlock),
    ToolUse(&'a ToolUseBlock),
    ToolResult(&'a ToolResultBlock),
    Thinking(&'a ThinkingBlock),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    Thinking(ThinkingBlock),
}

const MODELLED_KINDS: [&str; 4] = ["text", "tool_use", "tool_result", "thinking"];

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tagged = match self {
            ContentBlock::Text(block) => TaggedBlockRef::Text(block),
            ContentBlock::ToolUse(block) => TaggedBlockRef::ToolUse(block),
            ContentBlock::ToolResult(block) => TaggedBlockRef::ToolResult(block),
            ContentBlock::Thinking(block) => TaggedBlockRef::Thinking(block),
            ContentBlock::Other(raw) => return raw.serialize(serializer),
        };
        tagged.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let kind = raw.get("type").and_then(Value::as_str);
        match kind {
            Some(kind) if MODELLED_KINDS.contains(&kind) => {
                let block = TaggedBlock::deserialize(raw).map_err(<D::Error as de::Error>::custom)?;
                Ok(match block {
                    TaggedBlock::Text(b) => ContentBlock::Text(b),
                    TaggedBlock::ToolUse(b) => ContentBlock::ToolUse(b),
                    TaggedBlock::ToolResult(b) => ContentBlock::ToolResult(b),
                    TaggedBlock::Thinking(b) => ContentBlock::Thinking(b),
                })
            }
            Some(_) => Ok(ContentBlock::Other(raw)),
            None => Err(<D::Error as de::Error>::missing_field("type")),
        }
    }
}

impl ContentBlock {
    /// Shorthand for a text block
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    /// The text of a `Text` block, `None` for every other kind
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(block) => Some(&block.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TextBlock {
    #[serde(default)]
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    /// Result text. On the wire this may be a plain string or an array of
    /// text blocks; both collapse to a single string here.
    #[serde(default, deserialize_with = "content_as_text")]
    pub content: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(tool_use_id, content)
        }
    }
}

fn content_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<Value>),
        Null(()),
    }

    Ok(match Content::deserialize(deserializer)? {
        Content::Text(text) => text,
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Content::Null(()) => String::new(),
    })
}

/// Extended-thinking trace emitted by the model
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThinkingBlock {
    #[serde(default)]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Text blocks joined by newlines
    pub fn text(&self) -> String {
        join_text(&self.content)
    }
}

fn join_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Token accounting for one call, or a running total across calls
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "count_or_zero")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "count_or_zero")]
    pub output_tokens: u64,
    #[serde(
        default,
        rename = "cache_read_input_tokens",
        deserialize_with = "count_or_zero"
    )]
    pub cache_read_tokens: u64,
    #[serde(
        default,
        rename = "cache_creation_input_tokens",
        deserialize_with = "count_or_zero"
    )]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// Input plus output tokens
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Applies a `message_delta` usage update. The server reports running
    /// counts there, so every non-zero field replaces the current value.
    pub fn merge_delta(&mut self, delta: &TokenUsage) {
        if delta.input_tokens > 0 {
            self.input_tokens = delta.input_tokens;
        }
        if delta.output_tokens > 0 {
            self.output_tokens = delta.output_tokens;
        }
        if delta.cache_read_tokens > 0 {
            self.cache_read_tokens = delta.cache_read_tokens;
        }
        if delta.cache_creation_tokens > 0 {
            self.cache_creation_tokens = delta.cache_creation_tokens;
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
            StopReason::StopSequence => "stop_sequence",
        }
    }
}

impl From<&str> for StopReason {
    fn from(value: &str) -> Self {
        match value {
            "max_tokens" => StopReason::MaxTokens,
            "tool_use" => StopReason::ToolUse,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        }
    }
}

impl From<String> for StopReason {
    fn from(value: String) -> Self {
        StopReason::from(value.as_str())
    }
}

impl From<StopReason> for String {
    fn from(value: StopReason) -> Self {
        value.as_str().to_string()
    }
}

/// A complete model response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, deserialize_with = "known_blocks")]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Skips content blocks that fail to parse; unmodelled kinds are kept raw
pub(crate) fn known_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|block| serde_json::from_value(block).ok())
        .collect())
}

impl ModelResponse {
    /// Parse a non-streamed response body
    pub fn from_json(body: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn from_value(value: Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Text blocks joined by newlines
    pub fn text(&self) -> String {
        join_text(&self.content)
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUseBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse(tool) => Some(tool),
            _ => None,
        })
    }
}

/// Tool schema advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Extended-thinking switch. Disabled thinking is expressed by omitting the field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingConfig {
    Enabled { budget_tokens: u32 },
}

/// Request body for the Messages endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

impl MessageRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            tools: Vec::new(),
            max_tokens,
            temperature: None,
            stream: false,
            thinking: None,
        }
    }

    /// Sets the system prompt; an empty prompt leaves the field absent
    pub fn system(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system = (!prompt.is_empty()).then_some(prompt);
        self
    }

    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn thinking_budget(mut self, budget: Option<u32>) -> Self {
        self.thinking = budget.map(|budget_tokens| ThinkingConfig::Enabled { budget_tokens });
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Body of a `message_delta` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageDeltaBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Payload of an `error` stream event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamError {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// Incremental change to one content block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Other,
}

/// One frame of a streamed response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: ModelResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Parse the payload of one `data:` line
    pub fn parse(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
