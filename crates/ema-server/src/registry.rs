use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ema_core::client::LlmClient;
use ema_core::errors::ConfigurationError;
use ema_core::ids::{ActorId, UserId};
use ema_core::stores::{ActorStore, BufferStore};
use ema_core::tools::{EmaReplyTool, Tool};
use ema_engine::{ActorConfig, ActorWorker, EventBus};

use crate::relay::{spawn_relay, OutboundEvent};

/// Fallback template when an actor has no persisted definition.
const DEFAULT_SYSTEM_PROMPT: &str = "You are EMA, a conversational companion. \
Reply to the user by calling the ema_reply tool.\n\nRecent history:\n{MEMORY_BUFFER}";

/// Owns one `ActorWorker` per (user, actor) and funnels every worker's
/// events into a single outbound broadcast channel.
pub struct WorkerRegistry {
    llm: Arc<dyn LlmClient>,
    actor_db: Arc<dyn ActorStore>,
    buffer_store: Arc<dyn BufferStore>,
    out_tx: broadcast::Sender<OutboundEvent>,
    workers: DashMap<(String, String), Arc<ActorWorker>>,
}

impl WorkerRegistry {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        actor_db: Arc<dyn ActorStore>,
        buffer_store: Arc<dyn BufferStore>,
        event_capacity: usize,
    ) -> Self {
        let (out_tx, _) = broadcast::channel(event_capacity);
        Self {
            llm,
            actor_db,
            buffer_store,
            out_tx,
            workers: DashMap::new(),
        }
    }

    /// Subscribe to the attributed event stream across all actors.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.out_tx.subscribe()
    }

    /// Fetch the worker for (user, actor), creating it on first input.
    /// The persisted actor definition supplies the prompt and limits;
    /// unknown actors get the default template.
    pub async fn get_or_create(
        &self,
        user: &UserId,
        actor: &ActorId,
    ) -> Result<Arc<ActorWorker>, ConfigurationError> {
        let key = (user.as_str().to_string(), actor.as_str().to_string());
        if let Some(worker) = self.workers.get(&key) {
            return Ok(Arc::clone(&worker));
        }

        let record = match self.actor_db.get(user, actor).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "actor lookup failed, using defaults");
                None
            }
        };

        let mut config = match record {
            Some(record) => ActorConfig::new(user.clone(), actor.clone(), record.system_prompt)
                .with_limits(record.max_steps, record.token_limit),
            None => ActorConfig::new(user.clone(), actor.clone(), DEFAULT_SYSTEM_PROMPT),
        };
        config.base_tools = vec![Arc::new(EmaReplyTool) as Arc<dyn Tool>];

        match self.workers.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let events = EventBus::default();
                spawn_relay(
                    user.as_str().to_string(),
                    actor.as_str().to_string(),
                    events.envelopes(),
                    self.out_tx.clone(),
                );

                let worker = Arc::new(ActorWorker::new(
                    config,
                    Arc::clone(&self.llm),
                    Arc::clone(&self.buffer_store),
                    events,
                )?);
                info!(user_id = %user, actor_id = %actor, "worker created");
                entry.insert(Arc::clone(&worker));
                Ok(worker)
            }
        }
    }

    /// Abort every in-flight run. Returns how many workers were told.
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.workers.iter() {
            entry.value().abort();
            count += 1;
        }
        count
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ema_core::messages::Content;
    use ema_core::stores::ActorRecord;
    use ema_engine::InMemoryBufferStore;
    use ema_llm::{MockClient, MockReply};
    use ema_store::{ActorDb, Database};
    use std::time::Duration;

    fn registry_with(replies: Vec<MockReply>) -> (WorkerRegistry, Arc<ActorDb>) {
        let actor_db = Arc::new(ActorDb::new(Database::in_memory().unwrap()));
        let registry = WorkerRegistry::new(
            Arc::new(MockClient::new(replies)),
            Arc::clone(&actor_db) as Arc<dyn ActorStore>,
            Arc::new(InMemoryBufferStore::new()),
            256,
        );
        (registry, actor_db)
    }

    #[tokio::test]
    async fn creates_worker_once_per_actor() {
        let (registry, _) = registry_with(vec![]);
        let user = UserId::new("u1");
        let actor = ActorId::new("a1");

        let w1 = registry.get_or_create(&user, &actor).await.unwrap();
        let w2 = registry.get_or_create(&user, &actor).await.unwrap();
        assert!(Arc::ptr_eq(&w1, &w2));
        assert_eq!(registry.worker_count(), 1);
    }

    #[tokio::test]
    async fn distinct_actors_get_distinct_workers() {
        let (registry, _) = registry_with(vec![]);
        let user = UserId::new("u1");

        registry
            .get_or_create(&user, &ActorId::new("a1"))
            .await
            .unwrap();
        registry
            .get_or_create(&user, &ActorId::new("a2"))
            .await
            .unwrap();
        assert_eq!(registry.worker_count(), 2);
    }

    #[tokio::test]
    async fn uses_persisted_actor_definition() {
        let (registry, actor_db) = registry_with(vec![MockReply::text("ok")]);
        let user = UserId::new("u1");
        let actor = ActorId::new("a1");

        actor_db
            .upsert(&ActorRecord {
                user_id: user.clone(),
                actor_id: actor.clone(),
                name: "EMA".into(),
                system_prompt: "custom prompt {MEMORY_BUFFER}".into(),
                max_steps: 3,
                token_limit: 50_000,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let worker = registry.get_or_create(&user, &actor).await.unwrap();
        worker.work(vec![Content::text("hi")]).await.unwrap();
        // The worker was built from the record without error.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn events_flow_to_outbound_channel_with_attribution() {
        let (registry, _) = registry_with(vec![MockReply::text("done")]);
        let user = UserId::new("u1");
        let actor = ActorId::new("a1");

        let mut rx = registry.subscribe();
        let worker = registry.get_or_create(&user, &actor).await.unwrap();
        worker.work(vec![Content::text("hello")]).await.unwrap();

        let mut kinds = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            assert_eq!(event.user_id, "u1");
            assert_eq!(event.actor_id, "a1");
            let kind = event.envelope.kind.clone();
            kinds.push(kind.clone());
            if kind == "runFinished" {
                break;
            }
        }
        assert_eq!(kinds, vec!["stepStarted", "llmResponseReceived", "runFinished"]);
    }

    #[tokio::test]
    async fn abort_all_reaches_every_worker() {
        let (registry, _) = registry_with(vec![]);
        let user = UserId::new("u1");
        registry
            .get_or_create(&user, &ActorId::new("a1"))
            .await
            .unwrap();
        registry
            .get_or_create(&user, &ActorId::new("a2"))
            .await
            .unwrap();
        assert_eq!(registry.abort_all(), 2);
    }
}
