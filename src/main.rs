use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;

use flownote_core::bus::MessageBus;
use flownote_core::channel::{self, GatewayState};
use flownote_core::clients::{HttpStructuringClient, HttpTranscriptionClient};
use flownote_core::config::SessionEngineConfig;
use flownote_core::jobs::{JobDispatcher, LoggingPostingBackend};
use flownote_core::notes::sqlite_store::{SqliteNoteStore, SqliteNoteStoreConfig};
use flownote_core::registry::{SessionRegistry, SessionRegistryDeps};
use flownote_core::supervisor::SupervisorTree;
use flownote_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = SessionEngineConfig::from_env();

    let db_path = std::env::var("FLOWNOTE_DB_PATH").unwrap_or_else(|_| "flownote.db".to_string());
    let note_store = Arc::new(
        SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::file(db_path.into()))
            .context("failed to bootstrap note store")?,
    );

    let transcription_endpoint = std::env::var("FLOWNOTE_TRANSCRIPTION_ENDPOINT")
        .unwrap_or_else(|_| "https://transcription.internal/v1/transcribe".to_string());
    let structuring_endpoint = std::env::var("FLOWNOTE_STRUCTURING_ENDPOINT")
        .unwrap_or_else(|_| "https://structuring.internal/v1/structure".to_string());

    let transcription_client = Arc::new(HttpTranscriptionClient::new(transcription_endpoint, config.clone()));
    let structuring_client = Arc::new(HttpStructuringClient::new(structuring_endpoint, config.clone()));

    let (job_dispatcher, mut job_status_rx) = JobDispatcher::new(Arc::new(LoggingPostingBackend), config.clone());
    tokio::spawn(async move { while job_status_rx.recv().await.is_some() {} });

    let bus = Arc::new(MessageBus::new(config.subscriber_queue_capacity));

    let registry = Arc::new(SessionRegistry::new(SessionRegistryDeps {
        config,
        transcription_client,
        structuring_client,
        note_store: note_store.clone(),
        checkpoint_store: note_store.clone(),
        job_dispatcher: Arc::new(job_dispatcher),
        bus,
    }));

    let supervisor = SupervisorTree::new(Arc::clone(&registry), note_store);

    let app = channel::router(GatewayState {
        registry: supervisor.registry(),
    });

    let addr = std::env::var("FLOWNOTE_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8089".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(addr = %addr, "flownote session orchestration engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
