use std::sync::Arc;

use ema_core::errors::ConfigurationError;
use ema_core::ids::{ActorId, UserId};
use ema_core::tools::Tool;

/// Placeholder in the system-prompt template replaced by the rendered
/// buffer window.
pub const MEMORY_BUFFER_PLACEHOLDER: &str = "{MEMORY_BUFFER}";

/// How many buffer items are rendered into the system prompt.
pub const MEMORY_BUFFER_WINDOW: usize = 10;

/// Static configuration for one actor.
#[derive(Clone)]
pub struct ActorConfig {
    pub user_id: UserId,
    pub actor_id: ActorId,
    /// Display name used for user-authored buffer lines.
    pub user_name: String,
    /// Display name used for actor-authored buffer lines.
    pub actor_name: String,
    /// System-prompt template; `{MEMORY_BUFFER}` occurrences are
    /// replaced per run.
    pub system_prompt: String,
    pub max_steps: u32,
    pub token_limit: u64,
    pub base_tools: Vec<Arc<dyn Tool>>,
}

impl ActorConfig {
    pub fn new(user_id: UserId, actor_id: ActorId, system_prompt: impl Into<String>) -> Self {
        Self {
            user_id,
            actor_id,
            user_name: "User".into(),
            actor_name: "EMA".into(),
            system_prompt: system_prompt.into(),
            max_steps: 20,
            token_limit: 100_000,
            base_tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.base_tools = tools;
        self
    }

    pub fn with_limits(mut self, max_steps: u32, token_limit: u64) -> Self {
        self.max_steps = max_steps;
        self.token_limit = token_limit;
        self
    }

    /// Required fields must be present before a worker is constructed.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.system_prompt.trim().is_empty() {
            return Err(ConfigurationError("system prompt is empty".into()));
        }
        if self.token_limit == 0 {
            return Err(ConfigurationError("token limit must be positive".into()));
        }
        if self.actor_name.is_empty() || self.user_name.is_empty() {
            return Err(ConfigurationError("display names must be set".into()));
        }
        Ok(())
    }
}
