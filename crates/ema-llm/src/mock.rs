use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ema_core::client::{ClientError, LlmClient};
use ema_core::messages::{LlmResponse, Message, ModelMessage, ToolCall};
use ema_core::tools::ToolDefinition;

/// Pre-programmed replies for deterministic testing without API calls.
#[derive(Clone)]
pub enum MockReply {
    /// Return the response immediately.
    Reply(LlmResponse),
    /// Fail with the given error.
    Error(ClientError),
    /// Wait a duration, then yield the inner reply. Cancellation during
    /// the wait fails with `Cancelled`.
    Delay(Duration, Box<MockReply>),
    /// Park until the cancellation token fires, then fail with
    /// `Cancelled`. Powers the preemption scenarios.
    Hang,
}

impl MockReply {
    /// Convenience: a plain text response with no tool calls.
    pub fn text(text: &str) -> Self {
        Self::Reply(LlmResponse {
            message: ModelMessage::text(text),
            finish_reason: "end_turn".into(),
            total_tokens: 0,
        })
    }

    /// Convenience: a response carrying the given tool calls.
    pub fn tool_calls(text: &str, calls: Vec<ToolCall>) -> Self {
        Self::Reply(LlmResponse {
            message: ModelMessage::with_tool_calls(text, calls),
            finish_reason: "tool_use".into(),
            total_tokens: 0,
        })
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock client that returns pre-programmed replies in sequence and
/// records the message list it was handed on each call.
pub struct MockClient {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockClient {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Snapshot of the message lists passed to each `generate` call.
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ClientError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(messages.to_vec());

        let mut reply = self
            .replies
            .get(idx)
            .cloned()
            .ok_or_else(|| ClientError::InvalidRequest(format!("no scripted reply for call {idx}")))?;

        loop {
            match reply {
                MockReply::Reply(response) => return Ok(response),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    }
                    reply = *inner;
                }
                MockReply::Hang => {
                    cancel.cancelled().await;
                    return Err(ClientError::Cancelled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_replies() {
        let mock = MockClient::new(vec![MockReply::text("first"), MockReply::text("second")]);
        let cancel = CancellationToken::new();

        let r1 = mock.generate(&[], &[], "", &cancel).await.unwrap();
        assert_eq!(r1.message.text_content(), "first");
        let r2 = mock.generate(&[], &[], "", &cancel).await.unwrap();
        assert_eq!(r2.message.text_content(), "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_replies_error() {
        let mock = MockClient::new(vec![MockReply::text("only one")]);
        let cancel = CancellationToken::new();

        let _ = mock.generate(&[], &[], "", &cancel).await;
        let err = mock.generate(&[], &[], "", &cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn error_reply() {
        let mock = MockClient::new(vec![MockReply::Error(ClientError::Overloaded)]);
        let cancel = CancellationToken::new();
        let err = mock.generate(&[], &[], "", &cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Overloaded));
    }

    #[tokio::test]
    async fn delayed_reply_waits() {
        let mock = MockClient::new(vec![MockReply::delayed(
            Duration::from_millis(30),
            MockReply::text("after delay"),
        )]);
        let cancel = CancellationToken::new();

        let start = std::time::Instant::now();
        let response = mock.generate(&[], &[], "", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(response.message.text_content(), "after delay");
    }

    #[tokio::test]
    async fn hang_fails_on_cancellation() {
        let mock = std::sync::Arc::new(MockClient::new(vec![MockReply::Hang]));
        let cancel = CancellationToken::new();

        let task = {
            let mock = std::sync::Arc::clone(&mock);
            let cancel = cancel.clone();
            tokio::spawn(async move { mock.generate(&[], &[], "", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test]
    async fn records_seen_messages() {
        let mock = MockClient::new(vec![MockReply::text("ok")]);
        let cancel = CancellationToken::new();
        let messages = vec![Message::user_text("hello")];

        mock.generate(&messages, &[], "", &cancel).await.unwrap();

        let seen = mock.seen_messages();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 1);
        assert!(seen[0][0].is_user());
    }
}
