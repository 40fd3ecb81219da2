use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ema_core::client::LlmClient;
use ema_core::events::ActorEvent;
use ema_core::ids::ToolCallId;
use ema_core::messages::{Content, LlmResponse, Message, ToolResult, UserMessage};
use ema_core::tools::{Tool, ToolDefinition};

use crate::bus::EventBus;
use crate::estimator::{self, TokenEstimate};

/// Prefix of every synthesized round summary.
pub const SUMMARY_PREFIX: &str = "[Model Execution Summary]";

/// Meta-prompt for the summarization LLM call.
const SUMMARIZER_SYSTEM_PROMPT: &str = "Summarize this agent execution process. \
Focus on the tasks performed and the tools called with their outcomes. \
Keep it concise, at most 1000 words. Exclude user content from the summary.";

/// Character budget for tool-result previews in the fallback rendering.
const PREVIEW_CHARS: usize = 80;

/// Token-budgeted conversation store.
///
/// Mutated only from within the agent loop. Holds the ordered message
/// list, the available tools, and the last API-reported token count;
/// `summarize_if_needed` keeps the context under the token limit by
/// collapsing each round into one synthesized user message.
pub struct ContextManager {
    messages: Vec<Message>,
    tools: Vec<Arc<dyn Tool>>,
    tool_index: HashMap<String, Arc<dyn Tool>>,
    token_limit: u64,
    api_total_tokens: u64,
    skip_next_token_check: bool,
}

impl ContextManager {
    pub fn new(messages: Vec<Message>, tools: Vec<Arc<dyn Tool>>, token_limit: u64) -> Self {
        let tool_index = tools
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        Self {
            messages,
            tools,
            tool_index,
            token_limit,
            api_total_tokens: 0,
            skip_next_token_check: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tool_index.get(name).map(Arc::clone)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn add_user(&mut self, contents: Vec<Content>) {
        self.messages.push(Message::User(UserMessage { contents }));
    }

    pub fn add_model(&mut self, response: &LlmResponse) {
        self.messages.push(Message::Model(response.message.clone()));
    }

    pub fn add_tool(&mut self, result: ToolResult, name: String, id: Option<ToolCallId>) {
        self.messages
            .push(Message::Tool(ema_core::messages::ToolMessage {
                name,
                id,
                result,
            }));
    }

    /// Overwrite the API-reported total, but only when the provider
    /// actually reported one.
    pub fn update_api_tokens(&mut self, response: &LlmResponse) {
        if response.total_tokens > 0 {
            self.api_total_tokens = response.total_tokens;
        }
    }

    pub fn api_total_tokens(&self) -> u64 {
        self.api_total_tokens
    }

    /// Local estimate of the current context's token footprint.
    /// Deterministic and side-effect free.
    pub fn estimate_tokens(&self) -> TokenEstimate {
        estimator::estimate_messages(&self.messages)
    }

    #[cfg(test)]
    pub(crate) fn skip_next_token_check(&self) -> bool {
        self.skip_next_token_check
    }

    /// Collapse completed rounds into summaries when the context has
    /// outgrown the token limit.
    ///
    /// The skip flag defers exactly one check after a summarization so
    /// the synthesized summary cannot itself trigger a second pass
    /// before the API reports fresh totals.
    pub async fn summarize_if_needed(
        &mut self,
        llm: &dyn LlmClient,
        events: &EventBus,
        cancel: &CancellationToken,
    ) {
        if self.skip_next_token_check {
            self.skip_next_token_check = false;
            return;
        }

        let estimate = self.estimate_tokens();
        if let Some(error) = &estimate.fallback_error {
            events.emit(ActorEvent::TokenEstimationFallbacked {
                error: error.clone(),
            });
        }
        let local = estimate.tokens;

        if local <= self.token_limit && self.api_total_tokens <= self.token_limit {
            return;
        }

        events.emit(ActorEvent::SummarizeMessagesStarted {
            local_estimated_tokens: local,
            api_reported_tokens: self.api_total_tokens,
            token_limit: self.token_limit,
        });

        let user_indices: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();

        if user_indices.is_empty() {
            debug!("summarization skipped: no user messages to anchor rounds");
            events.emit(ActorEvent::SummarizeMessagesFinished {
                ok: false,
                old_tokens: Some(local),
                new_tokens: None,
                user_message_count: Some(0),
                summary_count: None,
            });
            return;
        }

        let mut new_messages = Vec::new();
        if user_indices[0] != 0 {
            new_messages.push(self.messages[0].clone());
        }

        let mut summary_count = 0usize;
        for (pos, &user_idx) in user_indices.iter().enumerate() {
            new_messages.push(self.messages[user_idx].clone());

            let end = user_indices
                .get(pos + 1)
                .copied()
                .unwrap_or(self.messages.len());
            let round = &self.messages[user_idx + 1..end];
            if round.is_empty() {
                continue;
            }

            summary_count += 1;
            let summary = self
                .create_round_summary(summary_count, round, llm, events, cancel)
                .await;
            new_messages.push(Message::User(UserMessage {
                contents: vec![Content::text(format!("{SUMMARY_PREFIX}\n\n{summary}"))],
            }));
        }

        self.messages = new_messages;
        self.skip_next_token_check = true;

        let new_tokens = self.estimate_tokens().tokens;
        events.emit(ActorEvent::SummarizeMessagesFinished {
            ok: true,
            old_tokens: Some(local),
            new_tokens: Some(new_tokens),
            user_message_count: Some(user_indices.len()),
            summary_count: Some(summary_count),
        });
    }

    /// One round summary: a dedicated LLM call seeded with the
    /// summarizer meta-prompt, falling back to a deterministic textual
    /// rendering when the call fails.
    async fn create_round_summary(
        &self,
        round_num: usize,
        round: &[Message],
        llm: &dyn LlmClient,
        events: &EventBus,
        cancel: &CancellationToken,
    ) -> String {
        match llm
            .generate(round, &[], SUMMARIZER_SYSTEM_PROMPT, cancel)
            .await
        {
            Ok(response) => {
                let text = response.message.text_content();
                events.emit(ActorEvent::CreateSummaryFinished {
                    ok: true,
                    round_num,
                    summary_text: Some(text.clone()),
                    error: None,
                });
                text
            }
            Err(e) => {
                warn!(round = round_num, error = %e, "summary call failed, using fallback rendering");
                events.emit(ActorEvent::CreateSummaryFinished {
                    ok: false,
                    round_num,
                    summary_text: None,
                    error: Some(e.to_string()),
                });
                fallback_round_summary(round_num, round)
            }
        }
    }
}

/// Deterministic rendering of one round, used when the summary call
/// fails.
fn fallback_round_summary(round_num: usize, round: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in round {
        match message {
            Message::Model(model) => {
                lines.push(format!("Assistant: {}", model.text_content()));
                if !model.tool_calls.is_empty() {
                    let names: Vec<&str> =
                        model.tool_calls.iter().map(|c| c.name.as_str()).collect();
                    lines.push(format!("  → Called tools: {}", names.join(", ")));
                }
            }
            Message::Tool(tool) => {
                lines.push(format!("  ← Tool returned: {}…", preview(tool.result.text())));
            }
            Message::User(_) => {}
        }
    }
    format!("Round {round_num} execution process:\n\n{}", lines.join("\n"))
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
