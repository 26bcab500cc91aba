use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::notes::{EnrichmentSource, Note, VisualContext};

pub type SessionId = String;

/// The SessionActor's finite state machine. Transitions are guarded by
/// [`SessionStatus::can_transition_to`]; anything not listed there forces
/// `error -> idle` instead of silently accepting the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Listening,
    Transcribing,
    Structuring,
    Confirming,
    ExecutingTool,
    Cancelling,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Listening => "listening",
            SessionStatus::Transcribing => "transcribing",
            SessionStatus::Structuring => "structuring",
            SessionStatus::Confirming => "confirming",
            SessionStatus::ExecutingTool => "executing_tool",
            SessionStatus::Cancelling => "cancelling",
            SessionStatus::Error => "error",
        }
    }

    /// The fixed, guarded transition graph from the data model. Any edge
    /// not listed here is invalid and forces `error -> idle` instead.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Idle, Listening)
                | (Listening, Transcribing)
                | (Listening, Structuring)
                | (Listening, Cancelling)
                | (Transcribing, Structuring)
                | (Transcribing, Cancelling)
                | (Transcribing, Error)
                | (Structuring, Confirming)
                | (Structuring, ExecutingTool)
                | (Structuring, Cancelling)
                | (Structuring, Error)
                | (Confirming, ExecutingTool)
                | (Confirming, Idle)
                | (Confirming, Cancelling)
                | (ExecutingTool, Idle)
                | (ExecutingTool, Error)
                | (Cancelling, Idle)
                | (Error, Idle)
        )
    }
}

/// Inbound messages accepted by a `SessionActor`'s mailbox.
///
/// `Cancel`, `UpdateVideoContext`, and the engine-internal completion/status
/// variants are the priority class from the concurrency model: they are
/// processed ahead of bulk `AudioChunk`/`FrameEmbedding` traffic via a
/// biased `select!` over two channels. `SetTimestamp` carries its own reply
/// channel rather than being `Clone`, so the enum as a whole is not `Clone`.
#[derive(Debug)]
pub enum SessionCommand {
    AudioChunk {
        correlation_id: String,
        bytes: Vec<u8>,
    },
    /// Authoritative transcript supplied by the client, bypassing
    /// server-side transcription entirely (the core's stated common case:
    /// the browser already ran local or cloud STT).
    TranscriptReady {
        correlation_id: String,
        text: String,
        source: String,
        confidence: f32,
        audio_duration_s: Option<f64>,
    },
    FrameEmbedding {
        correlation_id: String,
        device: String,
        video_timestamp_seconds: f64,
        embedding: Vec<f32>,
    },
    /// Synchronous update of the video anchor timestamp. Replies with the
    /// value that was in effect before the update, satisfying the
    /// read-after-write law regardless of interleaved `AudioChunk` traffic
    /// (the mailbox's strict FIFO ordering is what makes this safe).
    SetTimestamp {
        seconds: f64,
        reply: oneshot::Sender<Option<f64>>,
    },
    StopListening {
        correlation_id: String,
    },
    ConfirmNote {
        note_id: String,
    },
    RejectNote {
        note_id: String,
    },
    Cancel {
        correlation_id: Option<String>,
    },
    UpdateVideoContext {
        video_id: String,
        video_timestamp_seconds: f64,
    },
    /// A reconnecting subscriber's last seen sequence; replayed from the
    /// outbox or answered with `catchup_unavailable` if it predates
    /// retention.
    SubscriberCatchup {
        last_seen_sequence: u64,
    },
    /// Engine-internal: a status transition reported by the `JobDispatcher`
    /// for a job this session dispatched. Never sent by a gateway client.
    JobStatus {
        note_id: String,
        status: String,
        payload: serde_json::Value,
    },
    /// Engine-internal: the result of a spawned transcription call, fed
    /// back into the mailbox instead of awaited inline so a `Cancel` can
    /// still preempt the pipeline between mailbox turns. Never sent by a
    /// gateway client.
    TranscriptionCompleted {
        correlation_id: String,
        result: Result<(String, f32), String>,
    },
    /// Engine-internal counterpart for the structuring call. Carries the
    /// raw transcript through alongside the structured (title, body,
    /// confidence) so the actor can persist both on the resulting note, plus
    /// which enrichment source (if any) fed the visual context it was
    /// dispatched with.
    StructuringCompleted {
        correlation_id: String,
        result: Result<(String, String, String, f32), String>,
        enrichment_source: EnrichmentSource,
    },
}

impl SessionCommand {
    /// Bulk messages are the ones subject to two-level mailbox
    /// backpressure and the priority carve-out; `Cancel`, `UpdateVideoContext`,
    /// and the engine-internal completion/status feedback always go through
    /// the priority channel.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            SessionCommand::Cancel { .. }
                | SessionCommand::UpdateVideoContext { .. }
                | SessionCommand::TranscriptionCompleted { .. }
                | SessionCommand::StructuringCompleted { .. }
                | SessionCommand::JobStatus { .. }
        )
    }
}

/// Outbound events the gateway relays to the connected client, delivered
/// through the session's `MessageBus` topic and replayed from the outbox
/// on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    StateChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    NoteCreated {
        note: Note,
    },
    NoteUpdated {
        note: Note,
    },
    NoteArchived {
        note_id: String,
    },
    JobStatus {
        note_id: String,
        job_id: String,
        status: String,
    },
    VideoContextChanged {
        video_id: String,
        video_timestamp_seconds: f64,
    },
    Backpressure {
        mailbox_len: usize,
        threshold: usize,
    },
    Error {
        kind: String,
        message: String,
        transient: bool,
    },
    SessionRecovered {
        replayed_events: usize,
    },
    CatchupUnavailable {
        requested_sequence: u64,
        earliest_available_sequence: u64,
    },
}

/// A sequenced outbound event as stored in the outbox ring buffer and sent
/// over the wire, matching the `{sequence, ...}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: OutboundEvent,
}

#[derive(Debug, Clone, Default)]
pub struct VideoContext {
    pub video_id: Option<String>,
    pub video_timestamp_seconds: Option<f64>,
}

impl From<VideoContext> for VisualContext {
    fn from(value: VideoContext) -> Self {
        VisualContext {
            video_id: value.video_id,
            video_timestamp_seconds: value.video_timestamp_seconds,
            embedding: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_is_rejected() {
        assert!(!SessionStatus::Idle.can_transition_to(SessionStatus::Structuring));
        assert!(SessionStatus::Idle.can_transition_to(SessionStatus::Listening));
    }

    #[test]
    fn transcript_ready_skips_transcribing() {
        assert!(SessionStatus::Listening.can_transition_to(SessionStatus::Structuring));
    }

    #[test]
    fn error_only_recovers_to_idle() {
        assert!(SessionStatus::Error.can_transition_to(SessionStatus::Idle));
        assert!(!SessionStatus::Error.can_transition_to(SessionStatus::Listening));
    }

    #[test]
    fn priority_commands_are_identified() {
        assert!(SessionCommand::Cancel { correlation_id: None }.is_priority());
        assert!(!SessionCommand::StopListening {
            correlation_id: "c1".into()
        }
        .is_priority());
        assert!(SessionCommand::JobStatus {
            note_id: "n1".into(),
            status: "succeeded".into(),
            payload: serde_json::json!({}),
        }
        .is_priority());
    }
}
