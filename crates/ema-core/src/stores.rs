use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, UserId};
use crate::messages::BufferMessage;

/// Error surface shared by every store the runtime consumes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A persisted actor definition, keyed by (user, actor).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorRecord {
    pub user_id: UserId,
    pub actor_id: ActorId,
    pub name: String,
    pub system_prompt: String,
    pub max_steps: u32,
    pub token_limit: u64,
    pub created_at: DateTime<Utc>,
}

/// A long-term memory entry owned by one actor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub actor_id: ActorId,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// CRUD over persisted actor definitions.
#[async_trait]
pub trait ActorStore: Send + Sync {
    async fn upsert(&self, record: &ActorRecord) -> Result<(), StoreError>;
    async fn get(&self, user: &UserId, actor: &ActorId) -> Result<Option<ActorRecord>, StoreError>;
    async fn list(&self) -> Result<Vec<ActorRecord>, StoreError>;
    async fn delete(&self, user: &UserId, actor: &ActorId) -> Result<(), StoreError>;
}

/// Ordered append of short-term buffer messages.
///
/// Appends for one actor must persist in the order they are issued; the
/// caller serializes writes, the store only has to keep them stable.
#[async_trait]
pub trait BufferStore: Send + Sync {
    async fn append(&self, actor: &ActorId, message: &BufferMessage) -> Result<(), StoreError>;

    /// The last `limit` messages in chronological order.
    async fn recent(&self, actor: &ActorId, limit: usize) -> Result<Vec<BufferMessage>, StoreError>;
}

/// Durable long-term memory, CRUD side.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn add(&self, entry: &MemoryEntry) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError>;
    async fn list(&self, actor: &ActorId) -> Result<Vec<MemoryEntry>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Search side of long-term memory.
#[async_trait]
pub trait MemorySearcher: Send + Sync {
    async fn search(
        &self,
        actor: &ActorId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::Database("locked".into());
        assert_eq!(err.to_string(), "database error: locked");

        let err = StoreError::NotFound("actor_x".into());
        assert!(err.to_string().contains("actor_x"));
    }

    #[test]
    fn actor_record_serde_roundtrip() {
        let record = ActorRecord {
            user_id: UserId::new("user_1"),
            actor_id: ActorId::new("actor_1"),
            name: "EMA".into(),
            system_prompt: "Recent:\n{MEMORY_BUFFER}".into(),
            max_steps: 20,
            token_limit: 100_000,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ActorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "EMA");
        assert_eq!(parsed.max_steps, 20);
    }
}
