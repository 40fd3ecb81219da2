use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ema_core::client::{ClientError, LlmClient};
use ema_core::messages::{LlmResponse, Message};
use ema_core::tools::ToolDefinition;

/// Configuration for the retry wrapper.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps an `LlmClient` with retry logic.
///
/// - Retries retryable errors with exponential backoff + jitter
/// - Respects `retry_after` hints from rate limit responses
/// - Fatal errors and cancellation are never retried
/// - Exhaustion surfaces as `ClientError::RetryExhausted`
pub struct RetryClient<C: LlmClient> {
    inner: C,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<C: LlmClient> RetryClient<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: C) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Delay before the next attempt. A server hint wins outright;
    /// otherwise the base delay doubles per attempt up to the cap, and
    /// the result is spread across a symmetric jitter window so
    /// concurrent retriers don't stampede in lockstep.
    fn backoff_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(hint) = suggested {
            return hint;
        }

        let base_ms = self.config.base_delay.as_millis() as u64;
        let doubled = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = doubled
            .min(self.config.max_delay.as_millis() as u64)
            .max(MIN_RETRY_DELAY.as_millis() as u64);

        let window = (capped as f64 * self.config.jitter_factor) as u64;
        if window == 0 {
            return Duration::from_millis(capped);
        }
        let offset = jitter_entropy() % (2 * window + 1);
        let jittered = (capped - window + offset).max(MIN_RETRY_DELAY.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Entropy for the jitter window: the random bits of a v7 UUID. Plenty
/// for de-synchronizing retriers, and no extra dependency.
fn jitter_entropy() -> u64 {
    uuid::Uuid::now_v7().as_u128() as u64
}

#[async_trait]
impl<C: LlmClient> LlmClient for RetryClient<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ClientError> {
        let mut last_error: Option<ClientError> = None;

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            match self
                .inner
                .generate(messages, tools, system_prompt, cancel)
                .await
            {
                Ok(response) => return Ok(response),
                Err(ClientError::Cancelled) => return Err(ClientError::Cancelled),
                Err(e) => {
                    if e.is_fatal() || !e.is_retryable() {
                        return Err(e);
                    }
                    if attempt == self.config.max_retries {
                        return Err(ClientError::RetryExhausted {
                            attempts: attempt + 1,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = self.backoff_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after client error"
                    );
                    last_error = Some(e);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    }
                }
            }
        }

        Err(ClientError::RetryExhausted {
            attempts: self.config.max_retries + 1,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into()),
        })
    }
}
