use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;
use crate::messages::{LlmResponse, ToolResult};
use crate::tools::Reply;

/// Lifecycle events emitted while an actor runs.
///
/// The serialized `kind` tags are the wire contract relayed to external
/// subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ActorEvent {
    StepStarted {
        step: u32,
        max_steps: u32,
    },

    LlmResponseReceived {
        response: LlmResponse,
    },

    ToolCallStarted {
        id: Option<ToolCallId>,
        name: String,
        args: serde_json::Map<String, Value>,
    },

    ToolCallFinished {
        ok: bool,
        id: Option<ToolCallId>,
        name: String,
        result: ToolResult,
    },

    /// The distinguished user-visible reply.
    EmaReplyReceived {
        reply: Reply,
    },

    SummarizeMessagesStarted {
        local_estimated_tokens: u64,
        api_reported_tokens: u64,
        token_limit: u64,
    },

    SummarizeMessagesFinished {
        ok: bool,
        old_tokens: Option<u64>,
        new_tokens: Option<u64>,
        user_message_count: Option<usize>,
        summary_count: Option<usize>,
    },

    CreateSummaryFinished {
        ok: bool,
        round_num: usize,
        summary_text: Option<String>,
        error: Option<String>,
    },

    RunFinished {
        ok: bool,
        msg: String,
        error: Option<String>,
    },

    TokenEstimationFallbacked {
        error: String,
    },
}

/// Compile-time enumeration of event kinds, used for per-kind
/// subscription and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    StepStarted,
    LlmResponseReceived,
    ToolCallStarted,
    ToolCallFinished,
    EmaReplyReceived,
    SummarizeMessagesStarted,
    SummarizeMessagesFinished,
    CreateSummaryFinished,
    RunFinished,
    TokenEstimationFallbacked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStarted => "stepStarted",
            Self::LlmResponseReceived => "llmResponseReceived",
            Self::ToolCallStarted => "toolCallStarted",
            Self::ToolCallFinished => "toolCallFinished",
            Self::EmaReplyReceived => "emaReplyReceived",
            Self::SummarizeMessagesStarted => "summarizeMessagesStarted",
            Self::SummarizeMessagesFinished => "summarizeMessagesFinished",
            Self::CreateSummaryFinished => "createSummaryFinished",
            Self::RunFinished => "runFinished",
            Self::TokenEstimationFallbacked => "tokenEstimationFallbacked",
        }
    }
}

impl ActorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StepStarted { .. } => EventKind::StepStarted,
            Self::LlmResponseReceived { .. } => EventKind::LlmResponseReceived,
            Self::ToolCallStarted { .. } => EventKind::ToolCallStarted,
            Self::ToolCallFinished { .. } => EventKind::ToolCallFinished,
            Self::EmaReplyReceived { .. } => EventKind::EmaReplyReceived,
            Self::SummarizeMessagesStarted { .. } => EventKind::SummarizeMessagesStarted,
            Self::SummarizeMessagesFinished { .. } => EventKind::SummarizeMessagesFinished,
            Self::CreateSummaryFinished { .. } => EventKind::CreateSummaryFinished,
            Self::RunFinished { .. } => EventKind::RunFinished,
            Self::TokenEstimationFallbacked { .. } => EventKind::TokenEstimationFallbacked,
        }
    }
}

/// Boundary wrapper relayed to external subscribers: the event kind plus
/// its payload fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub kind: String,
    pub content: Value,
}

impl From<&ActorEvent> for EventEnvelope {
    fn from(event: &ActorEvent) -> Self {
        let mut content = serde_json::to_value(event).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut content {
            map.remove("kind");
        }
        Self {
            kind: event.kind().as_str().to_string(),
            content,
        }
    }
}
