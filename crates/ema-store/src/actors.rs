use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ema_core::ids::{ActorId, UserId};
use ema_core::stores::{ActorRecord, ActorStore, StoreError};

use crate::database::Database;
use crate::db_err;

/// Actor definitions keyed by (user, actor).
pub struct ActorDb {
    db: Database,
}

impl ActorDb {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActorRecord> {
    let created_at: String = row.get(6)?;
    Ok(ActorRecord {
        user_id: UserId::new(row.get::<_, String>(0)?),
        actor_id: ActorId::new(row.get::<_, String>(1)?),
        name: row.get(2)?,
        system_prompt: row.get(3)?,
        max_steps: row.get(4)?,
        token_limit: row.get::<_, i64>(5)? as u64,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

const SELECT_COLUMNS: &str =
    "user_id, actor_id, name, system_prompt, max_steps, token_limit, created_at";

#[async_trait]
impl ActorStore for ActorDb {
    async fn upsert(&self, record: &ActorRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO actors (user_id, actor_id, name, system_prompt, max_steps, token_limit, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (user_id, actor_id) DO UPDATE SET
                     name = excluded.name,
                     system_prompt = excluded.system_prompt,
                     max_steps = excluded.max_steps,
                     token_limit = excluded.token_limit",
                rusqlite::params![
                    record.user_id.as_str(),
                    record.actor_id.as_str(),
                    record.name,
                    record.system_prompt,
                    record.max_steps,
                    record.token_limit as i64,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    async fn get(&self, user: &UserId, actor: &ActorId) -> Result<Option<ActorRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM actors WHERE user_id = ?1 AND actor_id = ?2"
                ))
                .map_err(db_err)?;
            let mut rows = stmt
                .query_map(
                    rusqlite::params![user.as_str(), actor.as_str()],
                    row_to_record,
                )
                .map_err(db_err)?;
            match rows.next() {
                Some(row) => Ok(Some(row.map_err(db_err)?)),
                None => Ok(None),
            }
        })
    }

    async fn list(&self) -> Result<Vec<ActorRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM actors ORDER BY created_at ASC"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    async fn delete(&self, user: &UserId, actor: &ActorId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn
                .execute(
                    "DELETE FROM actors WHERE user_id = ?1 AND actor_id = ?2",
                    rusqlite::params![user.as_str(), actor.as_str()],
                )
                .map_err(db_err)?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!(
                    "actor {}/{}",
                    user.as_str(),
                    actor.as_str()
                )));
            }
            Ok(())
        })
    }
}
