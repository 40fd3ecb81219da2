use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::messages::ToolResult;

/// Canonical name of the distinguished reply tool. Its successful
/// invocation is intercepted by the agent and surfaced to the user.
pub const REPLY_TOOL_NAME: &str = "ema_reply";

/// Tool description sent to the LLM as part of the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema; `properties` declares the named arguments in order.
    pub parameters: Value,
}

/// Trait implemented by each tool.
///
/// `execute` never raises: a failing tool reports through
/// `ToolResult { success: false, error }`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> Value;

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Structured payload of the reply tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub think: String,
    pub expression: String,
    pub action: String,
    pub response: String,
}

/// The distinguished reply tool. Validates the payload and echoes it as
/// JSON; the agent parses that JSON, emits the reply event, and clears
/// the content before the result enters the context.
pub struct EmaReplyTool;

#[async_trait]
impl Tool for EmaReplyTool {
    fn name(&self) -> &str {
        REPLY_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Deliver the user-visible reply. Call this exactly once per answer \
         with your inner reasoning, outward expression, physical action, and \
         the spoken response."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "think": {
                    "type": "string",
                    "description": "Inner reasoning, never shown to the user"
                },
                "expression": {
                    "type": "string",
                    "description": "Facial expression or emotional tone"
                },
                "action": {
                    "type": "string",
                    "description": "Physical action to perform"
                },
                "response": {
                    "type": "string",
                    "description": "The spoken reply shown to the user"
                }
            },
            "required": ["think", "expression", "action", "response"]
        })
    }

    async fn execute(&self, args: serde_json::Map<String, Value>) -> ToolResult {
        let reply: Reply = match serde_json::from_value(Value::Object(args)) {
            Ok(reply) => reply,
            Err(e) => return ToolResult::err(format!("invalid reply payload: {e}")),
        };
        match serde_json::to_string(&reply) {
            Ok(json) => ToolResult::ok(json),
            Err(e) => ToolResult::err(format!("failed to serialize reply: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_args() -> serde_json::Map<String, Value> {
        serde_json::from_value(json!({
            "think": "t",
            "expression": "e",
            "action": "a",
            "response": "hi"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn reply_tool_echoes_payload_as_json() {
        let result = EmaReplyTool.execute(reply_args()).await;
        assert!(result.success);
        let reply: Reply = serde_json::from_str(result.content.as_deref().unwrap()).unwrap();
        assert_eq!(reply.response, "hi");
        assert_eq!(reply.think, "t");
    }

    #[tokio::test]
    async fn reply_tool_rejects_missing_fields() {
        let args: serde_json::Map<String, Value> =
            serde_json::from_value(json!({"response": "hi"})).unwrap();
        let result = EmaReplyTool.execute(args).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid reply payload"));
    }

    #[test]
    fn reply_json_roundtrip_is_idempotent() {
        let reply = Reply {
            think: "t".into(),
            expression: "e".into(),
            action: "a".into(),
            response: "r".into(),
        };
        let json1 = serde_json::to_string(&reply).unwrap();
        let parsed: Reply = serde_json::from_str(&json1).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json1, json2);
        assert_eq!(reply, parsed);
    }

    #[test]
    fn definition_carries_ordered_properties() {
        let def = EmaReplyTool.to_definition();
        assert_eq!(def.name, REPLY_TOOL_NAME);
        let props = def.parameters["properties"].as_object().unwrap();
        assert_eq!(props.len(), 4);
        assert!(props.contains_key("think"));
        assert!(props.contains_key("response"));
    }
}
