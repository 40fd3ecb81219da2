use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use ema_core::messages::{Content, Message};

/// Fixed per-message overhead approximating role/metadata cost.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Fallback ratio when the tokenizer is unavailable.
const FALLBACK_CHARS_PER_TOKEN: f64 = 2.5;

/// Result of a token estimate. `fallback_error` is set when the
/// character-ratio fallback was used instead of the BPE vocabulary.
#[derive(Clone, Debug)]
pub struct TokenEstimate {
    pub tokens: u64,
    pub fallback_error: Option<String>,
}

fn encoder() -> Result<&'static CoreBPE, String> {
    static ENCODER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();
    ENCODER
        .get_or_init(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(Clone::clone)
}

/// The textual material of one message: text blocks, the stringified
/// tool-call list, and the stringified tool result.
fn message_texts(message: &Message) -> Vec<String> {
    let mut texts = Vec::new();
    match message {
        Message::User(user) => {
            for content in &user.contents {
                if let Content::Text { text } = content {
                    texts.push(text.clone());
                }
            }
        }
        Message::Model(model) => {
            for content in &model.contents {
                if let Content::Text { text } = content {
                    texts.push(text.clone());
                }
            }
            if !model.tool_calls.is_empty() {
                if let Ok(json) = serde_json::to_string(&model.tool_calls) {
                    texts.push(json);
                }
            }
        }
        Message::Tool(tool) => {
            if let Ok(json) = serde_json::to_string(&tool.result) {
                texts.push(json);
            }
        }
    }
    texts
}

/// Estimate the token footprint of a message list.
///
/// Deterministic for fixed input and side-effect free. Uses the cl100k
/// byte-pair ranks plus a fixed 4-token overhead per message; if the
/// vocabulary cannot be loaded, falls back to `⌊chars / 2.5⌋`.
pub fn estimate_messages(messages: &[Message]) -> TokenEstimate {
    let texts: Vec<String> = messages.iter().flat_map(|m| message_texts(m)).collect();

    match encoder() {
        Ok(bpe) => {
            let mut tokens = MESSAGE_OVERHEAD_TOKENS * messages.len() as u64;
            for text in &texts {
                tokens += bpe.encode_ordinary(text).len() as u64;
            }
            TokenEstimate {
                tokens,
                fallback_error: None,
            }
        }
        Err(error) => {
            let chars: usize = texts.iter().map(|t| t.chars().count()).sum();
            TokenEstimate {
                tokens: (chars as f64 / FALLBACK_CHARS_PER_TOKEN).floor() as u64,
                fallback_error: Some(error),
            }
        }
    }
}
