//! The EMA engine: per-actor work loop, agent run loop, and the
//! token-budgeted conversation context.
//!
//! Ownership is one-directional: an [`worker::ActorWorker`] owns one
//! [`agent::Agent`]; each run owns a [`context::ContextManager`]; both
//! hold a non-owning handle to the LLM client.

pub mod agent;
pub mod buffer;
pub mod bus;
pub mod config;
pub mod context;
pub mod estimator;
pub mod worker;

pub use agent::{Agent, AgentConfig, AgentState};
pub use buffer::{BufferChain, InMemoryBufferStore};
pub use bus::{EventBus, Subscription};
pub use config::ActorConfig;
pub use context::ContextManager;
pub use worker::{ActorStatus, ActorWorker};
