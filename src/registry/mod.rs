//! `SessionRegistry`: the process-wide map from session id to its running
//! `SessionHandle`, grounded on the real-time transcription manager pattern
//! (an `Arc<RwLock<HashMap<...>>>` guarding session lifecycle).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::clients::{StructuringClient, TranscriptionClient};
use crate::config::SessionEngineConfig;
use crate::jobs::JobDispatcher;
use crate::notes::NoteStore;
use crate::session::{SessionActorDeps, SessionCheckpointStore, SessionHandle, SessionId};
use crate::bus::MessageBus;
use crate::session::types::SequencedEvent;

pub struct SessionRegistryDeps {
    pub config: SessionEngineConfig,
    pub transcription_client: Arc<dyn TranscriptionClient>,
    pub structuring_client: Arc<dyn StructuringClient>,
    pub note_store: Arc<dyn NoteStore>,
    pub checkpoint_store: Arc<dyn SessionCheckpointStore>,
    pub job_dispatcher: Arc<JobDispatcher>,
    pub bus: Arc<MessageBus<Arc<SequencedEvent>>>,
}

/// Owns every live `SessionHandle` for the process. A gateway connection
/// looks up or creates a handle here by session id; dropping the registry's
/// last reference to a handle aborts its actor task.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SessionHandle>>>>,
    deps: SessionRegistryDeps,
}

impl SessionRegistry {
    pub fn new(deps: SessionRegistryDeps) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            deps,
        }
    }

    /// Returns the existing handle for `session_id`, or spawns a fresh
    /// `SessionActor` and registers its handle if none exists yet.
    pub async fn get_or_create(
        &self,
        session_id: SessionId,
        user_id: String,
        device_id: Option<String>,
    ) -> Arc<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(&session_id) {
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&session_id) {
            return Arc::clone(handle);
        }

        let actor_deps = SessionActorDeps {
            config: self.deps.config.clone(),
            transcription_client: Arc::clone(&self.deps.transcription_client),
            structuring_client: Arc::clone(&self.deps.structuring_client),
            note_store: Arc::clone(&self.deps.note_store),
            checkpoint_store: Arc::clone(&self.deps.checkpoint_store),
            job_dispatcher: Arc::clone(&self.deps.job_dispatcher),
            bus: Arc::clone(&self.deps.bus),
        };

        let handle = Arc::new(SessionHandle::spawn(
            session_id.clone(),
            user_id,
            device_id,
            actor_deps,
        ));
        info!(target: "telemetry::session", session_id = %session_id, "session registered");
        sessions.insert(session_id, Arc::clone(&handle));
        handle
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Drops the registry's reference to a session, aborting its actor once
    /// every other `Arc<SessionHandle>` (e.g. an in-flight gateway request)
    /// is also released.
    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn active_session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn bus(&self) -> Arc<MessageBus<Arc<SequencedEvent>>> {
        Arc::clone(&self.deps.bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::structuring::{StructuringRequest, StructuringResult};
    use crate::clients::transcription::{TranscriptionRequest, TranscriptionResult};
    use crate::clients::ExternalCallError;
    use crate::jobs::{Job, PostingBackend, PostingError};
    use crate::notes::sqlite_store::{SqliteNoteStore, SqliteNoteStoreConfig};
    use async_trait::async_trait;

    struct NoopTranscriptionClient;

    #[async_trait]
    impl TranscriptionClient for NoopTranscriptionClient {
        async fn transcribe(
            &self,
            _request: TranscriptionRequest,
        ) -> Result<TranscriptionResult, ExternalCallError> {
            Ok(TranscriptionResult {
                text: String::new(),
                confidence: 0.0,
            })
        }
    }

    struct NoopStructuringClient;

    #[async_trait]
    impl StructuringClient for NoopStructuringClient {
        async fn structure(
            &self,
            _request: StructuringRequest,
        ) -> Result<StructuringResult, ExternalCallError> {
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

    fn test_registry() -> SessionRegistry {
        let config = SessionEngineConfig::default();
        let store = Arc::new(SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap"));
        let (dispatcher, mut status_rx) = JobDispatcher::new(Arc::new(NoopPostingBackend), config.clone());
        tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

        SessionRegistry::new(SessionRegistryDeps {
            config,
            transcription_client: Arc::new(NoopTranscriptionClient),
            structuring_client: Arc::new(NoopStructuringClient),
            note_store: store.clone(),
            checkpoint_store: store,
            job_dispatcher: Arc::new(dispatcher),
            bus: Arc::new(MessageBus::new(64)),
        })
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_handle_for_repeat_calls() {
        let registry = test_registry();
        let first = registry
            .get_or_create("sess-1".to_string(), "user-1".to_string(), None)
            .await;
        let second = registry
            .get_or_create("sess-1".to_string(), "user-1".to_string(), None)
            .await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_drops_the_session_from_the_registry() {
        let registry = test_registry();
        registry
            .get_or_create("sess-1".to_string(), "user-1".to_string(), None)
            .await;
        registry.remove("sess-1").await;

        assert!(registry.get("sess-1").await.is_none());
    }
}
