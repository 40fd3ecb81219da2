use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ema_core::ids::ActorId;
use ema_core::messages::{BufferKind, BufferMessage, Content};
use ema_core::stores::{BufferStore, StoreError};

use crate::database::Database;
use crate::db_err;

/// Durable short-term buffer. Appends get a monotonic per-table
/// sequence, so insertion order is exactly read-back order.
pub struct ShortTermMemoryDb {
    db: Database,
}

impl ShortTermMemoryDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn count(&self, actor: &ActorId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM buffer_messages WHERE actor_id = ?1",
                [actor.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }
}

fn kind_from_str(s: &str) -> BufferKind {
    match s {
        "actor" => BufferKind::Actor,
        _ => BufferKind::User,
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<BufferMessage> {
    let kind: String = row.get(0)?;
    let contents_json: String = row.get(3)?;
    let time: String = row.get(4)?;
    Ok(BufferMessage {
        kind: kind_from_str(&kind),
        id: row.get(1)?,
        name: row.get(2)?,
        contents: serde_json::from_str::<Vec<Content>>(&contents_json).unwrap_or_default(),
        time: DateTime::parse_from_rfc3339(&time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

#[async_trait]
impl BufferStore for ShortTermMemoryDb {
    async fn append(&self, actor: &ActorId, message: &BufferMessage) -> Result<(), StoreError> {
        let contents = serde_json::to_string(&message.contents)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO buffer_messages (actor_id, kind, author_id, author_name, contents, time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    actor.as_str(),
                    message.kind.as_str(),
                    message.id,
                    message.name,
                    contents,
                    message.time.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    async fn recent(&self, actor: &ActorId, limit: usize) -> Result<Vec<BufferMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT kind, author_id, author_name, contents, time
                     FROM (
                         SELECT * FROM buffer_messages
                         WHERE actor_id = ?1
                         ORDER BY seq DESC LIMIT ?2
                     ) ORDER BY seq ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![actor.as_str(), limit as i64],
                    row_to_message,
                )
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }
}
