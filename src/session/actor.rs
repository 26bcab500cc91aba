//! The `SessionActor` mailbox loop: a single-threaded, cooperative task
//! per session that processes one message to completion before the next,
//! driving the pipeline audio -> transcription -> structuring ->
//! confirm/auto-post -> job dispatch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;

use crate::bus::{MessageBus, Topic};
use crate::clients::{StructuringClient, TranscriptionClient};
use crate::clients::structuring::StructuringRequest;
use crate::clients::transcription::TranscriptionRequest;
use crate::config::SessionEngineConfig;
use crate::jobs::{Job, JobDispatcher, JobStatus as DispatchJobStatus};
use crate::notes::{self, EnrichmentSource, Note, NoteStatus, NoteStore, VisualContext};
use crate::telemetry::events::{
    record_catchup_unavailable, record_note_archived, record_note_created, record_note_updated,
    record_session_state_changed, record_video_context_changed,
};

use super::checkpoint::{SessionCheckpoint, SessionCheckpointStore};
use super::outbox::Outbox;
use super::types::{OutboundEvent, SequencedEvent, SessionCommand, SessionId, SessionStatus, VideoContext};

pub struct SessionActorDeps {
    pub config: SessionEngineConfig,
    pub transcription_client: Arc<dyn TranscriptionClient>,
    pub structuring_client: Arc<dyn StructuringClient>,
    pub note_store: Arc<dyn NoteStore>,
    pub checkpoint_store: Arc<dyn SessionCheckpointStore>,
    pub job_dispatcher: Arc<JobDispatcher>,
    pub bus: Arc<MessageBus<Arc<SequencedEvent>>>,
}

/// A frame embedding stored against the session while it waits to enrich
/// the next structuring request, per the "local embedding" enrichment
/// path (no cloud vision call involved).
#[derive(Clone)]
struct PendingVisualContext {
    embedding: Vec<f32>,
    video_timestamp_seconds: f64,
    #[allow(dead_code)]
    device: String,
}

pub(super) struct SessionActor {
    session_id: SessionId,
    user_id: String,
    device_id: Option<String>,
    status: SessionStatus,
    video_context: VideoContext,
    pending_visual_context: Option<PendingVisualContext>,
    audio_buffer: Vec<u8>,
    listening_started_at_ms: Option<i64>,
    inflight: HashSet<String>,
    current_note_id: Option<String>,
    outbox: Outbox,
    topic: Topic,
    deps: SessionActorDeps,
    priority_rx: mpsc::Receiver<SessionCommand>,
    priority_tx: mpsc::Sender<SessionCommand>,
    bulk_rx: mpsc::Receiver<SessionCommand>,
    mailbox_len: Arc<AtomicUsize>,
}

impl SessionActor {
    pub(super) fn new(
        session_id: SessionId,
        user_id: String,
        device_id: Option<String>,
        deps: SessionActorDeps,
        priority_rx: mpsc::Receiver<SessionCommand>,
        priority_tx: mpsc::Sender<SessionCommand>,
        bulk_rx: mpsc::Receiver<SessionCommand>,
        mailbox_len: Arc<AtomicUsize>,
    ) -> Self {
        let retain = deps.config.outbox_retain;
        Self {
            topic: Topic::session(&session_id),
            session_id,
            user_id,
            device_id,
            status: SessionStatus::Idle,
            video_context: VideoContext::default(),
            pending_visual_context: None,
            audio_buffer: Vec::new(),
            listening_started_at_ms: None,
            inflight: HashSet::new(),
            current_note_id: None,
            outbox: Outbox::new(retain),
            deps,
            priority_rx,
            priority_tx,
            bulk_rx,
            mailbox_len,
        }
    }

    pub(super) async fn run(mut self) {
        let mut checkpoint_ticker = interval(self.deps.config.checkpoint_interval);
        checkpoint_ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                biased;

                maybe_priority = self.priority_rx.recv() => {
                    match maybe_priority {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }

                maybe_bulk = self.bulk_rx.recv() => {
                    match maybe_bulk {
                        Some(command) => {
                            self.mailbox_len.fetch_sub(1, Ordering::SeqCst);
                            self.handle(command).await;
                        }
                        None => break,
                    }
                }

                _ = checkpoint_ticker.tick() => {
                    self.checkpoint().await;
                }
            }
        }

        self.checkpoint().await;
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::AudioChunk { correlation_id, bytes } => {
                self.on_audio_chunk(correlation_id, bytes).await;
            }
            SessionCommand::TranscriptReady {
                correlation_id,
                text,
                source,
                confidence,
                audio_duration_s,
            } => {
                self.on_transcript_ready(correlation_id, text, source, confidence, audio_duration_s)
                    .await;
            }
            SessionCommand::SetTimestamp { seconds, reply } => {
                self.on_set_timestamp(seconds, reply).await;
            }
            SessionCommand::StopListening { correlation_id } => {
                self.on_stop_listening(correlation_id).await;
            }
            SessionCommand::ConfirmNote { note_id } => {
                self.on_confirm(note_id).await;
            }
            SessionCommand::RejectNote { note_id } => {
                self.on_reject(note_id).await;
            }
            SessionCommand::Cancel { correlation_id } => {
                self.on_cancel(correlation_id).await;
            }
            SessionCommand::UpdateVideoContext { video_id, video_timestamp_seconds } => {
                self.on_video_context(video_id, video_timestamp_seconds).await;
            }
            SessionCommand::FrameEmbedding {
                device,
                video_timestamp_seconds,
                embedding,
                ..
            } => {
                self.on_frame_embedding(device, video_timestamp_seconds, embedding).await;
            }
            SessionCommand::SubscriberCatchup { last_seen_sequence } => {
                self.on_subscriber_catchup(last_seen_sequence).await;
            }
            SessionCommand::JobStatus { note_id, status, payload } => {
                self.on_job_status(note_id, status, payload).await;
            }
            SessionCommand::TranscriptionCompleted { correlation_id, result } => {
                self.on_transcription_completed(correlation_id, result).await;
            }
            SessionCommand::StructuringCompleted {
                correlation_id,
                result,
                enrichment_source,
            } => {
                self.on_structuring_completed(correlation_id, result, enrichment_source).await;
            }
        }
    }

    async fn on_audio_chunk(&mut self, _correlation_id: String, bytes: Vec<u8>) {
        if self.status == SessionStatus::Idle {
            self.transition(SessionStatus::Listening);
            self.listening_started_at_ms = Some(now_ms());
        }
        if self.status != SessionStatus::Listening {
            return;
        }

        self.audio_buffer.extend_from_slice(&bytes);

        let over_bytes = self.audio_buffer.len() >= self.deps.config.audio_bytes_limit;
        let over_duration = self
            .listening_started_at_ms
            .map(|started| now_ms() - started >= self.deps.config.audio_duration_limit.as_millis() as i64)
            .unwrap_or(false);

        if over_bytes || over_duration {
            self.on_stop_listening(Uuid::new_v4().to_string()).await;
        }
    }

    /// A client-supplied transcript skips server-side transcription
    /// entirely — the common case where the browser already ran local or
    /// cloud speech-to-text. Goes straight from `listening` to
    /// `structuring`.
    async fn on_transcript_ready(
        &mut self,
        correlation_id: String,
        text: String,
        source: String,
        confidence: f32,
        _audio_duration_s: Option<f64>,
    ) {
        if self.status != SessionStatus::Listening {
            return;
        }

        self.audio_buffer.clear();
        self.listening_started_at_ms = None;
        self.transition(SessionStatus::Structuring);
        self.inflight.insert(correlation_id.clone());

        tracing::debug!(
            target: "session_actor",
            session_id = %self.session_id,
            source = %source,
            confidence,
            "transcript supplied by client, skipping server-side transcription"
        );

        self.spawn_structuring(correlation_id, text);
    }

    async fn on_set_timestamp(&mut self, seconds: f64, reply: tokio::sync::oneshot::Sender<Option<f64>>) {
        let previous = self.video_context.video_timestamp_seconds;
        self.video_context.video_timestamp_seconds = Some(seconds);
        let _ = reply.send(previous);
    }

    async fn on_stop_listening(&mut self, correlation_id: String) {
        if self.status != SessionStatus::Listening {
            return;
        }

        self.transition(SessionStatus::Transcribing);
        self.listening_started_at_ms = None;
        self.inflight.insert(correlation_id.clone());

        let audio = std::mem::take(&mut self.audio_buffer);
        let client = Arc::clone(&self.deps.transcription_client);
        let session_id = self.session_id.clone();
        let reply_tx = self.priority_tx.clone();
        let corr = correlation_id.clone();

        tokio::spawn(async move {
            let outcome = client
                .transcribe(TranscriptionRequest {
                    session_id,
                    correlation_id: corr.clone(),
                    audio,
                    locale: None,
                })
                .await
                .map(|result| (result.text, result.confidence))
                .map_err(|err| err.to_string());

            let _ = reply_tx
                .send(SessionCommand::TranscriptionCompleted {
                    correlation_id: corr,
                    result: outcome,
                })
                .await;
        });
    }

    async fn on_transcription_completed(
        &mut self,
        correlation_id: String,
        result: Result<(String, f32), String>,
    ) {
        if !self.inflight.remove(&correlation_id) {
            return; // cancelled or superseded; discard the late result
        }
        if self.status != SessionStatus::Transcribing {
            return;
        }

        let (raw_transcript, _confidence) = match result {
            Ok(value) => value,
            Err(message) => {
                self.publish(OutboundEvent::Error {
                    kind: "transcription_failed".to_string(),
                    message,
                    transient: true,
                })
                .await;
                self.transition(SessionStatus::Error);
                self.transition(SessionStatus::Idle);
                return;
            }
        };

        self.transition(SessionStatus::Structuring);
        self.spawn_structuring(correlation_id, raw_transcript);
    }

    /// Common tail of both the transcribed and client-supplied-transcript
    /// paths: dispatch the structuring call, merging in any pending local
    /// embedding as visual context.
    fn spawn_structuring(&mut self, correlation_id: String, raw_transcript: String) {
        self.inflight.insert(correlation_id.clone());

        let client = Arc::clone(&self.deps.structuring_client);
        let session_id = self.session_id.clone();
        let mut visual_context: VisualContext = self.video_context.clone().into();
        let enrichment_source = if let Some(pending) = &self.pending_visual_context {
            visual_context.embedding = Some(pending.embedding.clone());
            visual_context.video_timestamp_seconds = Some(pending.video_timestamp_seconds);
            EnrichmentSource::LocalEmbedding
        } else {
            EnrichmentSource::None
        };
        let reply_tx = self.priority_tx.clone();
        let corr = correlation_id.clone();

        tokio::spawn(async move {
            let outcome = client
                .structure(StructuringRequest {
                    session_id,
                    correlation_id: corr.clone(),
                    raw_transcript: raw_transcript.clone(),
                    visual_context,
                })
                .await
                .map(|result| (result.title, result.body, raw_transcript, result.confidence))
                .map_err(|err| err.to_string());

            let _ = reply_tx
                .send(SessionCommand::StructuringCompleted {
                    correlation_id: corr,
                    result: outcome,
                    enrichment_source,
                })
                .await;
        });
    }

    async fn on_structuring_completed(
        &mut self,
        correlation_id: String,
        result: Result<(String, String, String, f32), String>,
        enrichment_source: EnrichmentSource,
    ) {
        if !self.inflight.remove(&correlation_id) {
            return;
        }
        if self.status != SessionStatus::Structuring {
            return;
        }

        let (title, body, raw_transcript, confidence) = match result {
            Ok(value) => value,
            Err(message) => {
                self.publish(OutboundEvent::Error {
                    kind: "structuring_failed".to_string(),
                    message,
                    transient: true,
                })
                .await;
                self.transition(SessionStatus::Error);
                self.transition(SessionStatus::Idle);
                return;
            }
        };

        if confidence < self.deps.config.confidence_hard_floor {
            self.publish(OutboundEvent::Error {
                kind: "low_confidence".to_string(),
                message: "structured note discarded below confidence floor".to_string(),
                transient: false,
            })
            .await;
            self.transition(SessionStatus::Cancelling);
            self.transition(SessionStatus::Idle);
            self.pending_visual_context = None;
            return;
        }

        let note_id = Uuid::new_v4().to_string();
        let now_ms = now_ms();
        let mut visual_context: VisualContext = self.video_context.clone().into();
        if let Some(pending) = self.pending_visual_context.take() {
            visual_context.embedding = Some(pending.embedding);
            visual_context.video_timestamp_seconds = Some(pending.video_timestamp_seconds);
        }

        let mut note = notes::new_draft(
            note_id.clone(),
            self.session_id.clone(),
            self.user_id.clone(),
            title,
            body,
            raw_transcript,
            confidence,
            visual_context,
            enrichment_source,
            now_ms,
        );

        if confidence >= self.deps.config.confidence_auto_post_threshold {
            note.status = NoteStatus::QueuedForPosting;
            if let Err(err) = self.deps.note_store.upsert(&note).await {
                self.emit_backend_error(&err.to_string()).await;
                return;
            }
            record_note_created(&self.session_id, &note_id, Some(confidence));
            self.publish(OutboundEvent::NoteCreated { note: note.clone() }).await;
            self.transition(SessionStatus::ExecutingTool);
            self.current_note_id = Some(note_id);
            self.dispatch_posting_job(&note);
        } else {
            if let Err(err) = self.deps.note_store.upsert(&note).await {
                self.emit_backend_error(&err.to_string()).await;
                return;
            }
            record_note_created(&self.session_id, &note_id, Some(confidence));
            self.current_note_id = Some(note_id);
            self.publish(OutboundEvent::NoteCreated { note }).await;
            self.transition(SessionStatus::Confirming);
        }
    }

    async fn on_confirm(&mut self, note_id: String) {
        if self.status != SessionStatus::Confirming || self.current_note_id.as_deref() != Some(note_id.as_str()) {
            return;
        }

        let mut note = match self.deps.note_store.get(&note_id).await {
            Ok(Some(note)) => note,
            _ => return,
        };
        note.status = NoteStatus::QueuedForPosting;
        note.updated_at_ms = now_ms();

        if let Err(err) = self.deps.note_store.upsert(&note).await {
            self.emit_backend_error(&err.to_string()).await;
            return;
        }

        record_note_updated(&self.session_id, &note_id, Some(note.confidence));
        self.transition(SessionStatus::ExecutingTool);
        self.publish(OutboundEvent::NoteUpdated { note: note.clone() }).await;
        self.dispatch_posting_job(&note);
    }

    async fn on_reject(&mut self, note_id: String) {
        if self.status != SessionStatus::Confirming || self.current_note_id.as_deref() != Some(note_id.as_str()) {
            return;
        }

        if let Err(err) = self.deps.note_store.archive(&note_id).await {
            self.emit_backend_error(&err.to_string()).await;
            return;
        }

        self.current_note_id = None;
        self.publish(OutboundEvent::NoteArchived { note_id: note_id.clone() }).await;
        record_note_archived(&self.session_id, &note_id);
        self.transition(SessionStatus::Idle);
    }

    async fn on_cancel(&mut self, correlation_id: Option<String>) {
        match correlation_id {
            Some(id) => {
                self.inflight.remove(&id);
            }
            None => self.inflight.clear(),
        }

        self.audio_buffer.clear();
        self.listening_started_at_ms = None;
        self.current_note_id = None;
        self.pending_visual_context = None;

        if self.status != SessionStatus::Idle {
            self.transition(SessionStatus::Cancelling);
            self.transition(SessionStatus::Idle);
        }
    }

    async fn on_video_context(&mut self, video_id: String, video_timestamp_seconds: f64) {
        self.video_context = VideoContext {
            video_id: Some(video_id.clone()),
            video_timestamp_seconds: Some(video_timestamp_seconds),
        };
        record_video_context_changed(&self.session_id, &video_id, video_timestamp_seconds, true);
        self.publish(OutboundEvent::VideoContextChanged {
            video_id,
            video_timestamp_seconds,
        })
        .await;
    }

    /// Stores the frame embedding for the next structuring call. No state
    /// transition: a frame can arrive at any point in the session and just
    /// waits to enrich whatever note comes next, overwriting whatever was
    /// pending before it.
    async fn on_frame_embedding(&mut self, device: String, video_timestamp_seconds: f64, embedding: Vec<f32>) {
        self.pending_visual_context = Some(PendingVisualContext {
            embedding,
            video_timestamp_seconds,
            device,
        });
    }

    /// Replays everything strictly after `last_seen_sequence` from the
    /// outbox, preserving original sequence numbers rather than
    /// re-publishing through `push` (which would reassign them). Answers
    /// with `catchup_unavailable` if the requested sequence predates
    /// retention.
    async fn on_subscriber_catchup(&mut self, last_seen_sequence: u64) {
        match self.outbox.replay_from(last_seen_sequence) {
            Some(events) => {
                for sequenced in events {
                    self.deps.bus.publish(&self.topic, Arc::new(sequenced)).await;
                }
            }
            None => {
                let earliest = self.outbox.earliest_sequence().unwrap_or(0);
                record_catchup_unavailable(&self.session_id, last_seen_sequence, earliest);
                self.publish(OutboundEvent::CatchupUnavailable {
                    requested_sequence: last_seen_sequence,
                    earliest_available_sequence: earliest,
                })
                .await;
            }
        }
    }

    /// Feeds a `JobDispatcher` completion back into the note's status
    /// graph: `queued_for_posting -> posting -> posted | failed`. The
    /// `executing_tool -> idle` transition only happens here, on a
    /// terminal job status, rather than immediately after dispatch.
    async fn on_job_status(&mut self, note_id: String, status: String, payload: serde_json::Value) {
        let mut note = match self.deps.note_store.get(&note_id).await {
            Ok(Some(note)) => note,
            _ => return,
        };

        note.status = match status.as_str() {
            "queued" => NoteStatus::QueuedForPosting,
            "running" => NoteStatus::Posting,
            "succeeded" => NoteStatus::Posted,
            "failed" | "dead_letter" => NoteStatus::Failed,
            _ => note.status,
        };
        note.updated_at_ms = now_ms();

        if let Err(err) = self.deps.note_store.upsert(&note).await {
            self.emit_backend_error(&err.to_string()).await;
            return;
        }

        let job_id = payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.publish(OutboundEvent::JobStatus {
            note_id: note_id.clone(),
            job_id,
            status: status.clone(),
        })
        .await;

        let terminal = matches!(note.status, NoteStatus::Posted | NoteStatus::Failed);
        if terminal && self.status == SessionStatus::ExecutingTool {
            self.current_note_id = None;
            self.transition(SessionStatus::Idle);
        }
    }

    fn dispatch_posting_job(&self, note: &Note) {
        let job_kind = "post_note".to_string();
        let idempotency_key = JobDispatcher::idempotency_key(&job_kind, &note.note_id);
        let job = Job {
            job_id: Uuid::new_v4().to_string(),
            job_kind,
            note_id: note.note_id.clone(),
            idempotency_key,
            payload: serde_json::json!({ "title": note.title }),
        };

        let (reply_tx, mut reply_rx) = mpsc::channel(16);
        let forward_tx = self.priority_tx.clone();
        tokio::spawn(async move {
            while let Some((job, status, _attempt)) = reply_rx.recv().await {
                let terminal = matches!(
                    status,
                    DispatchJobStatus::Succeeded | DispatchJobStatus::Failed | DispatchJobStatus::DeadLetter
                );
                let _ = forward_tx
                    .send(SessionCommand::JobStatus {
                        note_id: job.note_id.clone(),
                        status: status.as_str().to_string(),
                        payload: serde_json::json!({ "job_id": job.job_id }),
                    })
                    .await;
                if terminal {
                    break;
                }
            }
        });

        self.deps.job_dispatcher.dispatch(job, Some(reply_tx));
    }

    async fn emit_backend_error(&mut self, message: &str) {
        self.publish(OutboundEvent::Error {
            kind: "note_store_failure".to_string(),
            message: message.to_string(),
            transient: true,
        })
        .await;
        self.transition(SessionStatus::Error);
        self.transition(SessionStatus::Idle);
    }

    fn transition(&mut self, next: SessionStatus) {
        if !self.status.can_transition_to(next) && self.status != next {
            // Invalid edge: force the documented error recovery path
            // rather than silently accepting an unguarded transition.
            if next != SessionStatus::Error {
                self.status = SessionStatus::Error;
                return;
            }
        }

        let from = self.status;
        self.status = next;
        record_session_state_changed(&self.session_id, from.as_str(), next.as_str());
        let event = OutboundEvent::StateChanged { from, to: next };
        let sequenced = self.outbox.push(event);
        let topic = self.topic.clone();
        let bus = Arc::clone(&self.deps.bus);
        tokio::spawn(async move {
            bus.publish(&topic, Arc::new(sequenced)).await;
        });
    }

    async fn publish(&mut self, event: OutboundEvent) {
        let sequenced = self.outbox.push(event);
        self.deps.bus.publish(&self.topic, Arc::new(sequenced)).await;
    }

    async fn checkpoint(&self) {
        let checkpoint = SessionCheckpoint {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            video_id: self.video_context.video_id.clone(),
            video_timestamp_seconds: self.video_context.video_timestamp_seconds,
            status: self.status,
            sequence: self.outbox.latest_sequence().unwrap_or(0),
            last_transition_at_ms: now_ms(),
        };

        let _ = self.deps.checkpoint_store.persist(&checkpoint).await;
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}
