use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use ema_core::ids::{ActorId, UserId};
use ema_core::messages::Content;

use crate::registry::WorkerRegistry;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9820 }
    }
}

/// Shared state passed to the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
}

#[derive(Deserialize)]
struct InputRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "actorId")]
    actor_id: String,
    inputs: Vec<Content>,
}

#[derive(Serialize)]
struct InputAck {
    ok: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/input", post(input_handler))
        .route("/events", get(events_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Accept a batch of user inputs. The response is acknowledgement
/// only — the reply arrives on the event stream.
async fn input_handler(
    State(state): State<AppState>,
    Json(request): Json<InputRequest>,
) -> Result<Json<InputAck>, (StatusCode, Json<ErrorBody>)> {
    let user = UserId::new(request.user_id);
    let actor = ActorId::new(request.actor_id);

    let worker = state
        .registry
        .get_or_create(&user, &actor)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
        })?;

    worker.work(request.inputs).await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
    })?;

    Ok(Json(InputAck { ok: true }))
}

/// One-way SSE stream of attributed event envelopes.
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(outbound) => {
            let kind = outbound.envelope.kind.clone();
            Event::default()
                .event(kind)
                .json_data(&outbound)
                .ok()
                .map(Ok)
        }
        Err(e) => {
            warn!(error = %e, "sse subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Handle to a running server.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and finish in-flight requests.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the server task to exit.
    pub async fn drain(self) {
        let _ = self.task.await;
    }
}

/// Bind and start serving. Returns once the listener is ready.
pub async fn start(config: ServerConfig, state: AppState) -> std::io::Result<ServerHandle> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    let port = listener.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server exited with error");
        }
    });

    info!(port, "server listening");
    Ok(ServerHandle {
        port,
        shutdown,
        task,
    })
}
