//! SQLite persistence for the EMA runtime.
//!
//! Implements the narrow store interfaces from `ema-core::stores` over
//! a single shared connection: actor definitions, the ordered
//! short-term buffer, and searchable long-term memory.

pub mod actors;
pub mod database;
pub mod long_term;
pub mod schema;
pub mod short_term;

pub use actors::ActorDb;
pub use database::Database;
pub use long_term::LongTermMemoryDb;
pub use short_term::ShortTermMemoryDb;

use ema_core::stores::StoreError;

pub(crate) fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
