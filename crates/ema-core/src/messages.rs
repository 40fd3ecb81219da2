use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// A single content block. Only text ships today; the tag leaves room
/// for richer blocks without a wire break.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { mime_type: String, data: String },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Content::Text { .. } => "text",
            Content::Image { .. } => "image",
        }
    }
}

/// Joins the text blocks of a content list, skipping non-text blocks.
pub fn joined_text(contents: &[Content]) -> String {
    contents
        .iter()
        .filter_map(Content::as_text)
        .collect::<Vec<_>>()
        .join("")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "model")]
    Model(ModelMessage),
    #[serde(rename = "tool")]
    Tool(ToolMessage),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserMessage {
    pub contents: Vec<Content>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelMessage {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolMessage {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ToolCallId>,
    pub result: ToolResult,
}

/// A tool invocation requested by the model. `id` links the call to its
/// result; providers that don't assign one leave it absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ToolCallId>,
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// Outcome of one tool execution.
/// Invariant: success implies `content` is set and `error` is not;
/// failure implies `error` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }

    /// The textual payload, whichever side carries it.
    pub fn text(&self) -> &str {
        self.content
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("")
    }
}

/// One complete generation from the LLM backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: ModelMessage,
    pub finish_reason: String,
    pub total_tokens: u64,
}

/// Who wrote a buffer entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    User,
    Actor,
}

impl BufferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::User => "user",
            BufferKind::Actor => "actor",
        }
    }
}

/// An attributed, timestamped record in the actor's short-term buffer.
/// The last few of these are rendered into the system prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferMessage {
    pub kind: BufferKind,
    pub id: String,
    pub name: String,
    pub contents: Vec<Content>,
    pub time: DateTime<Utc>,
}

impl BufferMessage {
    /// Single-line rendering used by the system-prompt buffer window.
    pub fn render_line(&self) -> String {
        format!(
            "- [{}][role:{}][id:{}][name:{}] {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.kind.as_str(),
            self.id,
            self.name,
            joined_text(&self.contents),
        )
    }
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            contents: vec![Content::text(text)],
        })
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Message::Model(ModelMessage {
            contents: vec![Content::text(text)],
            tool_calls: Vec::new(),
        })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User(_))
    }
}

impl ModelMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::text(text)],
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            contents: vec![Content::text(text)],
            tool_calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_content(&self) -> String {
        joined_text(&self.contents)
    }
}
