//! `SessionHandle`: the public entry point gateway code calls into. Owns
//! the two mpsc channels that feed a `SessionActor`, the shared mailbox
//! length counter for two-level backpressure, and aborts the actor task on
//! drop — grounded on the engine's `RealtimeSessionHandle`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::actor::{SessionActor, SessionActorDeps};
use super::types::{SequencedEvent, SessionCommand, SessionId};
use crate::telemetry::events::record_backpressure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    AcceptedUnderPressure,
    Rejected,
}

pub struct SessionHandle {
    session_id: SessionId,
    priority_tx: mpsc::Sender<SessionCommand>,
    bulk_tx: mpsc::Sender<SessionCommand>,
    mailbox_len: Arc<AtomicUsize>,
    mailbox_soft: usize,
    mailbox_hard: usize,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn(
        session_id: SessionId,
        user_id: String,
        device_id: Option<String>,
        deps: SessionActorDeps,
    ) -> Self {
        let mailbox_soft = deps.config.mailbox_soft;
        let mailbox_hard = deps.config.mailbox_hard;
        let (priority_tx, priority_rx) = mpsc::channel(mailbox_hard.max(1));
        let (bulk_tx, bulk_rx) = mpsc::channel(mailbox_hard.max(1));
        let mailbox_len = Arc::new(AtomicUsize::new(0));

        let actor = SessionActor::new(
            session_id.clone(),
            user_id,
            device_id,
            deps,
            priority_rx,
            priority_tx.clone(),
            bulk_rx,
            Arc::clone(&mailbox_len),
        );
        let task = tokio::spawn(actor.run());

        Self {
            session_id,
            priority_tx,
            bulk_tx,
            mailbox_len,
            mailbox_soft,
            mailbox_hard,
            task,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Routes a command to the priority or bulk channel per
    /// [`SessionCommand::is_priority`]. Priority traffic always bypasses
    /// the bulk-channel backpressure gate so `Cancel` can preempt a
    /// saturated mailbox.
    pub async fn send(&self, command: SessionCommand) -> SendOutcome {
        if command.is_priority() {
            let _ = self.priority_tx.send(command).await;
            return SendOutcome::Accepted;
        }

        let depth = self.mailbox_len.load(Ordering::SeqCst);
        if depth >= self.mailbox_hard {
            record_backpressure(&self.session_id, depth, self.mailbox_hard, true);
            return SendOutcome::Rejected;
        }

        self.mailbox_len.fetch_add(1, Ordering::SeqCst);
        if self.bulk_tx.send(command).await.is_err() {
            self.mailbox_len.fetch_sub(1, Ordering::SeqCst);
            return SendOutcome::Rejected;
        }

        if depth + 1 >= self.mailbox_soft {
            record_backpressure(&self.session_id, depth + 1, self.mailbox_soft, false);
            SendOutcome::AcceptedUnderPressure
        } else {
            SendOutcome::Accepted
        }
    }

    pub async fn send_audio_chunk(&self, correlation_id: String, bytes: Vec<u8>) -> SendOutcome {
        self.send(SessionCommand::AudioChunk { correlation_id, bytes }).await
    }

    pub async fn stop_listening(&self, correlation_id: String) -> SendOutcome {
        self.send(SessionCommand::StopListening { correlation_id }).await
    }

    /// A client-supplied transcript, bypassing server-side transcription.
    pub async fn transcript_ready(
        &self,
        correlation_id: String,
        text: String,
        source: String,
        confidence: f32,
        audio_duration_s: Option<f64>,
    ) -> SendOutcome {
        self.send(SessionCommand::TranscriptReady {
            correlation_id,
            text,
            source,
            confidence,
            audio_duration_s,
        })
        .await
    }

    /// Sets the video anchor timestamp, returning the value that was in
    /// effect beforehand. Goes through the same bulk-channel ordering as
    /// `AudioChunk`/`FrameEmbedding` traffic, so the reply reflects the
    /// state as of this command's place in that stream.
    pub async fn set_timestamp(&self, seconds: f64) -> Option<f64> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(SessionCommand::SetTimestamp { seconds, reply }).await;
        reply_rx.await.ok().flatten()
    }

    /// Requests replay of everything after `last_seen_sequence`, or
    /// `catchup_unavailable` if it predates the retained window.
    pub async fn subscriber_catchup(&self, last_seen_sequence: u64) -> SendOutcome {
        self.send(SessionCommand::SubscriberCatchup { last_seen_sequence }).await
    }

    pub async fn confirm_note(&self, note_id: String) -> SendOutcome {
        self.send(SessionCommand::ConfirmNote { note_id }).await
    }

    pub async fn reject_note(&self, note_id: String) -> SendOutcome {
        self.send(SessionCommand::RejectNote { note_id }).await
    }

    pub async fn cancel(&self, correlation_id: Option<String>) {
        let _ = self.priority_tx.send(SessionCommand::Cancel { correlation_id }).await;
    }

    pub async fn update_video_context(&self, video_id: String, video_timestamp_seconds: f64) {
        let _ = self
            .priority_tx
            .send(SessionCommand::UpdateVideoContext {
                video_id,
                video_timestamp_seconds,
            })
            .await;
    }

    pub async fn frame_embedding(
        &self,
        correlation_id: String,
        device: String,
        video_timestamp_seconds: f64,
        embedding: Vec<f32>,
    ) -> SendOutcome {
        self.send(SessionCommand::FrameEmbedding {
            correlation_id,
            device,
            video_timestamp_seconds,
            embedding,
        })
        .await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub type OutboundEventBus = Arc<crate::bus::MessageBus<Arc<SequencedEvent>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::clients::structuring::{StructuringRequest, StructuringResult};
    use crate::clients::transcription::{TranscriptionRequest, TranscriptionResult};
    use crate::clients::{ExternalCallError, StructuringClient, TranscriptionClient};
    use crate::config::SessionEngineConfig;
    use crate::jobs::{Job, JobDispatcher, PostingBackend, PostingError};
    use crate::notes::sqlite_store::{SqliteNoteStore, SqliteNoteStoreConfig};
    use async_trait::async_trait;

    struct EchoTranscriptionClient;

    #[async_trait]
    impl TranscriptionClient for EchoTranscriptionClient {
        async fn transcribe(
            &self,
            _request: TranscriptionRequest,
        ) -> Result<TranscriptionResult, ExternalCallError> {
            Ok(TranscriptionResult {
                text: "buy milk tomorrow".to_string(),
                confidence: 0.95,
            })
        }
    }

    struct EchoStructuringClient;

    #[async_trait]
    impl StructuringClient for EchoStructuringClient {
        async fn structure(
            &self,
            request: StructuringRequest,
        ) -> Result<StructuringResult, ExternalCallError> {
            Ok(StructuringResult {
                title: "Reminder".to_string(),
                body: request.raw_transcript,
                confidence: 0.95,
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

    fn test_deps() -> (SessionActorDeps, Arc<SqliteNoteStore>) {
        let config = SessionEngineConfig::default();
        let store = Arc::new(SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap"));
        let (dispatcher, mut status_rx) = JobDispatcher::new(Arc::new(NoopPostingBackend), config.clone());
        tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

        let deps = SessionActorDeps {
            config,
            transcription_client: Arc::new(EchoTranscriptionClient),
            structuring_client: Arc::new(EchoStructuringClient),
            note_store: store.clone(),
            checkpoint_store: store.clone(),
            job_dispatcher: Arc::new(dispatcher),
            bus: Arc::new(MessageBus::new(64)),
        };
        (deps, store)
    }

    #[tokio::test]
    async fn audio_then_stop_produces_a_note_creation_event() {
        let (deps, _store) = test_deps();
        let bus = Arc::clone(&deps.bus);
        let topic = crate::bus::Topic::session("sess-1");
        let mut subscription = bus.subscribe(&topic, "test").await;

        let handle = SessionHandle::spawn("sess-1".to_string(), "user-1".to_string(), None, deps);

        handle
            .send_audio_chunk("c1".to_string(), vec![1, 2, 3])
            .await;
        handle.stop_listening("c1".to_string()).await;

        let mut saw_note_created = false;
        for _ in 0..20 {
            if let Some(sequenced) = tokio::time::timeout(std::time::Duration::from_millis(500), subscription.recv())
                .await
                .ok()
                .flatten()
            {
                if matches!(sequenced.event, super::super::types::OutboundEvent::NoteCreated { .. }) {
                    saw_note_created = true;
                    break;
                }
            } else {
                break;
            }
        }

        assert!(saw_note_created, "expected a note_created event on the session topic");
    }

    #[tokio::test]
    async fn bulk_send_is_rejected_once_hard_limit_reached() {
        let mut config = SessionEngineConfig::default();
        config.mailbox_soft = 1;
        config.mailbox_hard = 2;
        let store = Arc::new(SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap"));
        let (dispatcher, mut status_rx) = JobDispatcher::new(Arc::new(NoopPostingBackend), config.clone());
        tokio::spawn(async move { while status_rx.recv().await.is_some() {} });
        let deps = SessionActorDeps {
            config,
            transcription_client: Arc::new(EchoTranscriptionClient),
            structuring_client: Arc::new(EchoStructuringClient),
            note_store: store.clone(),
            checkpoint_store: store.clone(),
            job_dispatcher: Arc::new(dispatcher),
            bus: Arc::new(MessageBus::new(64)),
        };

        let handle = SessionHandle::spawn("sess-2".to_string(), "user-1".to_string(), None, deps);
        handle.mailbox_len.fetch_add(2, Ordering::SeqCst);

        let outcome = handle
            .send(SessionCommand::AudioChunk {
                correlation_id: "c1".to_string(),
                bytes: vec![0],
            })
            .await;

        assert_eq!(outcome, SendOutcome::Rejected);
    }
}
