use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use ema_core::client::LlmClient;
use ema_core::stores::{ActorStore, BufferStore};
use ema_llm::{NoAuthClient, RetryClient};
use ema_server::{AppState, ServerConfig, WorkerRegistry};
use ema_store::{ActorDb, Database, ShortTermMemoryDb};
use ema_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "ema", about = "EMA conversational actor runtime")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9820)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the SQLite database file. Defaults to ~/.ema/ema.db.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let telemetry = TelemetryConfig::with_level(ema_telemetry::parse_level(&args.log_level));
    ema_telemetry::init_telemetry(&telemetry);

    tracing::info!(port = args.port, log_level = %args.log_level, "starting EMA runtime");

    let db_path = match args.db_path {
        Some(path) => path,
        None => {
            let dir = home_dir().join(".ema");
            std::fs::create_dir_all(&dir).expect("failed to create data directory");
            dir.join("ema.db")
        }
    };
    let db = Database::open(&db_path).expect("failed to open database");

    let actor_db: Arc<dyn ActorStore> = Arc::new(ActorDb::new(db.clone()));
    let buffer_store: Arc<dyn BufferStore> = Arc::new(ShortTermMemoryDb::new(db));

    // No real provider adapter ships here; deployments wire one in
    // behind the LlmClient contract. Until then every run fails fast
    // with an auth error surfaced on the event stream.
    tracing::warn!("no LLM provider configured, runs will fail with an auth error");
    let llm: Arc<dyn LlmClient> = Arc::new(RetryClient::with_defaults(NoAuthClient));

    let registry = Arc::new(WorkerRegistry::new(llm, actor_db, buffer_store, 1024));

    let handle = ema_server::start(
        ServerConfig { port: args.port },
        AppState {
            registry: Arc::clone(&registry),
        },
    )
    .await
    .expect("failed to start server");

    tracing::info!(port = handle.port, "EMA runtime ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    let aborted = registry.abort_all();
    if aborted > 0 {
        tracing::info!(aborted, "aborted active workers");
    }

    handle.shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(10), handle.drain())
        .await
        .is_err()
    {
        tracing::warn!("server drain timed out after 10s");
    }

    tracing::info!("shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
