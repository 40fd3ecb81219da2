use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ema_core::client::{ClientError, LlmClient};
use ema_core::messages::{LlmResponse, Message};
use ema_core::tools::ToolDefinition;

/// Stand-in client used when no provider is configured. Every call
/// fails with an authentication error so the runtime can start and
/// report the problem through the event stream instead of crashing.
pub struct NoAuthClient;

#[async_trait]
impl LlmClient for NoAuthClient {
    fn name(&self) -> &str {
        "no-auth"
    }

    async fn generate(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _system_prompt: &str,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse, ClientError> {
        Err(ClientError::AuthenticationFailed(
            "no LLM provider configured".into(),
        ))
    }
}
