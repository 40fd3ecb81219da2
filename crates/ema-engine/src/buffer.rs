use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use ema_core::ids::ActorId;
use ema_core::messages::BufferMessage;
use ema_core::stores::{BufferStore, StoreError};

enum Job {
    Write(BufferMessage),
    Flush(oneshot::Sender<()>),
}

/// Serialized buffer-write chain for one actor.
///
/// A single consumer task drains the queue, so write N+1 starts only
/// after write N's future settles. A failed write is logged and the
/// chain stays usable for subsequent writes. This guarantees that the
/// observed order of `push` calls equals the order of persistence.
pub struct BufferChain {
    tx: mpsc::UnboundedSender<Job>,
}

impl BufferChain {
    pub fn new(actor: ActorId, store: Arc<dyn BufferStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Write(message) => {
                        if let Err(e) = store.append(&actor, &message).await {
                            error!(
                                actor_id = %actor,
                                error = %e,
                                "buffer write failed"
                            );
                        }
                    }
                    Job::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Enqueue a write. Returns immediately; the chained task persists
    /// in order.
    pub fn push(&self, message: BufferMessage) {
        let _ = self.tx.send(Job::Write(message));
    }

    /// Wait until every write enqueued before this call has settled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// In-memory buffer store backing unit tests and ephemeral actors.
#[derive(Default)]
pub struct InMemoryBufferStore {
    entries: Mutex<Vec<(ActorId, BufferMessage)>>,
}

impl InMemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl BufferStore for InMemoryBufferStore {
    async fn append(&self, actor: &ActorId, message: &BufferMessage) -> Result<(), StoreError> {
        self.entries.lock().push((actor.clone(), message.clone()));
        Ok(())
    }

    async fn recent(&self, actor: &ActorId, limit: usize) -> Result<Vec<BufferMessage>, StoreError> {
        let entries = self.entries.lock();
        let matching: Vec<BufferMessage> = entries
            .iter()
            .filter(|(a, _)| a == actor)
            .map(|(_, m)| m.clone())
            .collect();
        let start = matching.len().saturating_sub(limit);
        Ok(matching[start..].to_vec())
    }
}
