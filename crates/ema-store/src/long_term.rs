use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ema_core::ids::ActorId;
use ema_core::stores::{MemoryEntry, MemorySearcher, MemoryStore, StoreError};

use crate::database::Database;
use crate::db_err;

/// Long-term memory entries with keyword search.
pub struct LongTermMemoryDb {
    db: Database,
}

impl LongTermMemoryDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Convenience constructor for a fresh entry.
    pub fn entry(actor: &ActorId, title: &str, content: &str) -> MemoryEntry {
        MemoryEntry {
            id: uuid::Uuid::now_v7().to_string(),
            actor_id: actor.clone(),
            title: title.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let created_at: String = row.get(4)?;
    Ok(MemoryEntry {
        id: row.get(0)?,
        actor_id: ActorId::new(row.get::<_, String>(1)?),
        title: row.get(2)?,
        content: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

#[async_trait]
impl MemoryStore for LongTermMemoryDb {
    async fn add(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memory_entries (id, actor_id, title, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    entry.id,
                    entry.actor_id.as_str(),
                    entry.title,
                    entry.content,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, actor_id, title, content, created_at
                     FROM memory_entries WHERE id = ?1",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query_map([id], row_to_entry).map_err(db_err)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(db_err)?)),
                None => Ok(None),
            }
        })
    }

    async fn list(&self, actor: &ActorId) -> Result<Vec<MemoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, actor_id, title, content, created_at
                     FROM memory_entries WHERE actor_id = ?1
                     ORDER BY created_at ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([actor.as_str()], row_to_entry)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn
                .execute("DELETE FROM memory_entries WHERE id = ?1", [id])
                .map_err(db_err)?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("memory entry {id}")));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl MemorySearcher for LongTermMemoryDb {
    async fn search(
        &self,
        actor: &ActorId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let pattern = format!("%{query}%");
            let mut stmt = conn
                .prepare(
                    "SELECT id, actor_id, title, content, created_at
                     FROM memory_entries
                     WHERE actor_id = ?1 AND (title LIKE ?2 OR content LIKE ?2)
                     ORDER BY created_at DESC
                     LIMIT ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![actor.as_str(), pattern, limit as i64],
                    row_to_entry,
                )
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_get() {
        let db = LongTermMemoryDb::new(Database::in_memory().unwrap());
        let actor = ActorId::new("a1");
        let entry = LongTermMemoryDb::entry(&actor, "Preference", "Likes short answers");
        db.add(&entry).await.unwrap();

        let fetched = db.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Preference");
        assert_eq!(fetched.content, "Likes short answers");
    }

    #[tokio::test]
    async fn list_is_per_actor() {
        let db = LongTermMemoryDb::new(Database::in_memory().unwrap());
        let a = ActorId::new("a1");
        let b = ActorId::new("b1");

        db.add(&LongTermMemoryDb::entry(&a, "A", "x")).await.unwrap();
        db.add(&LongTermMemoryDb::entry(&a, "B", "y")).await.unwrap();
        db.add(&LongTermMemoryDb::entry(&b, "C", "z")).await.unwrap();

        assert_eq!(db.list(&a).await.unwrap().len(), 2);
        assert_eq!(db.list(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keyword_search_matches_title_and_content() {
        let db = LongTermMemoryDb::new(Database::in_memory().unwrap());
        let actor = ActorId::new("a1");

        db.add(&LongTermMemoryDb::entry(&actor, "Birthday", "March 3rd"))
            .await
            .unwrap();
        db.add(&LongTermMemoryDb::entry(&actor, "Food", "Loves ramen on birthdays"))
            .await
            .unwrap();
        db.add(&LongTermMemoryDb::entry(&actor, "Hobby", "Photography"))
            .await
            .unwrap();

        let results = db.search(&actor, "irthday", 10).await.unwrap();
        assert_eq!(results.len(), 2);

        let results = db.search(&actor, "Photo", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Hobby");

        let results = db.search(&actor, "nonexistent", 10).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_fails() {
        let db = LongTermMemoryDb::new(Database::in_memory().unwrap());
        let err = db.delete("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let db = LongTermMemoryDb::new(Database::in_memory().unwrap());
        let actor = ActorId::new("a1");
        let entry = LongTermMemoryDb::entry(&actor, "T", "C");
        db.add(&entry).await.unwrap();
        db.delete(&entry.id).await.unwrap();
        assert!(db.get(&entry.id).await.unwrap().is_none());
    }
}
