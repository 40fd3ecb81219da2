use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use ema_core::events::EventEnvelope;

/// An event envelope with actor attribution, as sent to SSE clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundEvent {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "actorId")]
    pub actor_id: String,
    #[serde(flatten)]
    pub envelope: EventEnvelope,
}

/// Forward one worker's envelope stream into the shared outbound
/// channel. Lagged receivers log and continue; a closed channel ends
/// the task.
pub fn spawn_relay(
    user_id: String,
    actor_id: String,
    mut rx: broadcast::Receiver<EventEnvelope>,
    out: broadcast::Sender<OutboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let _ = out.send(OutboundEvent {
                        user_id: user_id.clone(),
                        actor_id: actor_id.clone(),
                        envelope,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, actor_id = %actor_id, "event relay lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_event_wire_shape() {
        let event = OutboundEvent {
            user_id: "user_1".into(),
            actor_id: "actor_1".into(),
            envelope: EventEnvelope {
                kind: "runFinished".into(),
                content: json!({"ok": true, "msg": "end_turn"}),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["userId"], "user_1");
        assert_eq!(json["actorId"], "actor_1");
        assert_eq!(json["kind"], "runFinished");
        assert_eq!(json["content"]["ok"], true);
    }

    #[tokio::test]
    async fn relay_forwards_with_attribution() {
        let (env_tx, env_rx) = broadcast::channel::<EventEnvelope>(16);
        let (out_tx, mut out_rx) = broadcast::channel::<OutboundEvent>(16);

        let handle = spawn_relay("u1".into(), "a1".into(), env_rx, out_tx);

        env_tx
            .send(EventEnvelope {
                kind: "stepStarted".into(),
                content: json!({"step": 1, "maxSteps": 5}),
            })
            .unwrap();

        let forwarded = out_rx.recv().await.unwrap();
        assert_eq!(forwarded.user_id, "u1");
        assert_eq!(forwarded.actor_id, "a1");
        assert_eq!(forwarded.envelope.kind, "stepStarted");

        drop(env_tx);
        handle.await.unwrap();
    }
}
