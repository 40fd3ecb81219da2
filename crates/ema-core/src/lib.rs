//! Core types for the EMA actor runtime.
//!
//! Everything here is shared vocabulary: the message and content model,
//! the tool and LLM client contracts, the typed lifecycle events, and
//! the narrow store interfaces the engine consumes.

pub mod client;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod stores;
pub mod tools;
