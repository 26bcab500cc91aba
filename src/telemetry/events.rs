//! Structured telemetry events for the session engine, following the
//! teacher's pattern: a stable `target`, a named `event`, flattened scalar
//! fields for filtering, and a JSON `payload` field carrying the full
//! struct for anything that needs the detail.

use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) const SESSION_TARGET: &str = "telemetry::session";
pub(crate) const EVENT_STATE_CHANGED: &str = "session_state_changed";
pub(crate) const EVENT_NOTE_CREATED: &str = "session_note_created";
pub(crate) const EVENT_NOTE_UPDATED: &str = "session_note_updated";
pub(crate) const EVENT_NOTE_ARCHIVED: &str = "session_note_archived";
pub(crate) const EVENT_VIDEO_CONTEXT_CHANGED: &str = "session_video_context_changed";
pub(crate) const EVENT_SESSION_RECOVERED: &str = "session_recovered";
pub(crate) const EVENT_CATCHUP_UNAVAILABLE: &str = "session_catchup_unavailable";
pub(crate) const EVENT_CHECKPOINT_PERSISTED: &str = "session_checkpoint_persisted";
pub(crate) const EVENT_CHECKPOINT_FAILED: &str = "session_checkpoint_failed";

pub(crate) const BUS_TARGET: &str = "telemetry::message_bus";
pub(crate) const EVENT_BACKPRESSURE: &str = "bus_backpressure";
pub(crate) const EVENT_LAGGED: &str = "bus_subscriber_lagged";

pub(crate) const CLIENT_TARGET: &str = "telemetry::external_client";
pub(crate) const EVENT_RETRY_ATTEMPT: &str = "client_retry_attempt";
pub(crate) const EVENT_BREAKER_STATE: &str = "client_circuit_breaker_state";

pub(crate) const JOB_TARGET: &str = "telemetry::job_dispatcher";
pub(crate) const EVENT_JOB_STATUS: &str = "job_status_changed";
pub(crate) const EVENT_JOB_DEAD_LETTER: &str = "job_dead_lettered";

#[derive(Debug, Serialize)]
pub struct SessionStateChangedEvent<'a> {
    pub session_id: &'a str,
    pub from: &'a str,
    pub to: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SessionNoteEvent<'a> {
    pub session_id: &'a str,
    pub note_id: &'a str,
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct SessionVideoContextChangedEvent<'a> {
    pub session_id: &'a str,
    pub video_id: &'a str,
    pub video_timestamp_seconds: f64,
    pub reset: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionRecoveredEvent<'a> {
    pub session_id: &'a str,
    pub replayed_events: usize,
    pub from_sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionCatchupUnavailableEvent<'a> {
    pub session_id: &'a str,
    pub requested_sequence: u64,
    pub earliest_available_sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionCheckpointEvent<'a> {
    pub session_id: &'a str,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct BusBackpressureEvent<'a> {
    pub session_id: &'a str,
    pub mailbox_len: usize,
    pub threshold: usize,
    pub rejected: bool,
}

#[derive(Debug, Serialize)]
pub struct BusLaggedEvent<'a> {
    pub topic: &'a str,
    pub subscriber_id: &'a str,
    pub skipped: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientRetryAttemptEvent<'a> {
    pub client: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientBreakerStateEvent<'a> {
    pub client: &'a str,
    pub state: &'a str,
}

#[derive(Debug, Serialize)]
pub struct JobStatusEvent<'a> {
    pub job_id: &'a str,
    pub job_kind: &'a str,
    pub note_id: &'a str,
    pub status: &'a str,
    pub attempt: u32,
}

#[derive(Debug, Serialize)]
pub struct JobDeadLetterEvent<'a> {
    pub job_id: &'a str,
    pub job_kind: &'a str,
    pub note_id: &'a str,
    pub attempts: u32,
    pub error: &'a str,
}

pub fn record_session_state_changed(session_id: &str, from: &str, to: &str) {
    let event = SessionStateChangedEvent {
        session_id,
        from,
        to,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: SESSION_TARGET,
            event = EVENT_STATE_CHANGED,
            session_id,
            from,
            to,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = EVENT_STATE_CHANGED,
            %err,
            "failed to encode session state transition"
        ),
    }
}

pub fn record_note_created(session_id: &str, note_id: &str, confidence: Option<f32>) {
    record_note_lifecycle(EVENT_NOTE_CREATED, session_id, note_id, confidence);
}

pub fn record_note_updated(session_id: &str, note_id: &str, confidence: Option<f32>) {
    record_note_lifecycle(EVENT_NOTE_UPDATED, session_id, note_id, confidence);
}

pub fn record_note_archived(session_id: &str, note_id: &str) {
    record_note_lifecycle(EVENT_NOTE_ARCHIVED, session_id, note_id, None);
}

fn record_note_lifecycle(
    event_name: &'static str,
    session_id: &str,
    note_id: &str,
    confidence: Option<f32>,
) {
    let event = SessionNoteEvent {
        session_id,
        note_id,
        confidence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: SESSION_TARGET,
            event = event_name,
            session_id,
            note_id,
            confidence,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = event_name,
            %err,
            "failed to encode note lifecycle event"
        ),
    }
}

pub fn record_video_context_changed(
    session_id: &str,
    video_id: &str,
    video_timestamp_seconds: f64,
    reset: bool,
) {
    let event = SessionVideoContextChangedEvent {
        session_id,
        video_id,
        video_timestamp_seconds,
        reset,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: SESSION_TARGET,
            event = EVENT_VIDEO_CONTEXT_CHANGED,
            session_id,
            video_id,
            video_timestamp_seconds,
            reset,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = EVENT_VIDEO_CONTEXT_CHANGED,
            %err,
            "failed to encode video context change"
        ),
    }
}

pub fn record_session_recovered(session_id: &str, replayed_events: usize, from_sequence: u64) {
    let event = SessionRecoveredEvent {
        session_id,
        replayed_events,
        from_sequence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: SESSION_TARGET,
            event = EVENT_SESSION_RECOVERED,
            session_id,
            replayed_events,
            from_sequence,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = EVENT_SESSION_RECOVERED,
            %err,
            "failed to encode session recovery event"
        ),
    }
}

pub fn record_catchup_unavailable(
    session_id: &str,
    requested_sequence: u64,
    earliest_available_sequence: u64,
) {
    let event = SessionCatchupUnavailableEvent {
        session_id,
        requested_sequence,
        earliest_available_sequence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: SESSION_TARGET,
            event = EVENT_CATCHUP_UNAVAILABLE,
            session_id,
            requested_sequence,
            earliest_available_sequence,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = EVENT_CATCHUP_UNAVAILABLE,
            %err,
            "failed to encode catchup unavailable event"
        ),
    }
}

pub fn record_checkpoint_persisted(session_id: &str, sequence: u64) {
    let event = SessionCheckpointEvent {
        session_id,
        sequence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: SESSION_TARGET,
            event = EVENT_CHECKPOINT_PERSISTED,
            session_id,
            sequence,
            payload = %payload
        ),
        Err(err) => warn!(
            target: SESSION_TARGET,
            event = EVENT_CHECKPOINT_PERSISTED,
            %err,
            "failed to encode checkpoint event"
        ),
    }
}

pub fn record_checkpoint_failed(session_id: &str, error: &str) {
    warn!(
        target: SESSION_TARGET,
        event = EVENT_CHECKPOINT_FAILED,
        session_id,
        error,
        "session checkpoint persistence failed"
    );
}

pub fn record_backpressure(session_id: &str, mailbox_len: usize, threshold: usize, rejected: bool) {
    let event = BusBackpressureEvent {
        session_id,
        mailbox_len,
        threshold,
        rejected,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: BUS_TARGET,
            event = EVENT_BACKPRESSURE,
            session_id,
            mailbox_len,
            threshold,
            rejected,
            payload = %payload
        ),
        Err(err) => warn!(
            target: BUS_TARGET,
            event = EVENT_BACKPRESSURE,
            %err,
            "failed to encode backpressure event"
        ),
    }
}

pub fn record_subscriber_lagged(topic: &str, subscriber_id: &str, skipped: u64) {
    let event = BusLaggedEvent {
        topic,
        subscriber_id,
        skipped,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: BUS_TARGET,
            event = EVENT_LAGGED,
            topic,
            subscriber_id,
            skipped,
            payload = %payload
        ),
        Err(err) => warn!(
            target: BUS_TARGET,
            event = EVENT_LAGGED,
            %err,
            "failed to encode subscriber lagged event"
        ),
    }
}

pub fn record_retry_attempt(client: &str, attempt: u32, max_attempts: u32, backoff: Duration) {
    let backoff_ms = duration_to_ms(backoff);
    let event = ClientRetryAttemptEvent {
        client,
        attempt,
        max_attempts,
        backoff_ms,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: CLIENT_TARGET,
            event = EVENT_RETRY_ATTEMPT,
            client,
            attempt,
            max_attempts,
            backoff_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: CLIENT_TARGET,
            event = EVENT_RETRY_ATTEMPT,
            %err,
            "failed to encode retry attempt event"
        ),
    }
}

pub fn record_breaker_state(client: &str, state: &str) {
    let event = ClientBreakerStateEvent { client, state };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: CLIENT_TARGET,
            event = EVENT_BREAKER_STATE,
            client,
            state,
            payload = %payload
        ),
        Err(err) => warn!(
            target: CLIENT_TARGET,
            event = EVENT_BREAKER_STATE,
            %err,
            "failed to encode circuit breaker state event"
        ),
    }
}

pub fn record_job_status(job_id: &str, job_kind: &str, note_id: &str, status: &str, attempt: u32) {
    let event = JobStatusEvent {
        job_id,
        job_kind,
        note_id,
        status,
        attempt,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: JOB_TARGET,
            event = EVENT_JOB_STATUS,
            job_id,
            job_kind,
            note_id,
            status,
            attempt,
            payload = %payload
        ),
        Err(err) => warn!(
            target: JOB_TARGET,
            event = EVENT_JOB_STATUS,
            %err,
            "failed to encode job status event"
        ),
    }
}

pub fn record_job_dead_letter(job_id: &str, job_kind: &str, note_id: &str, attempts: u32, error: &str) {
    let event = JobDeadLetterEvent {
        job_id,
        job_kind,
        note_id,
        attempts,
        error,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: JOB_TARGET,
            event = EVENT_JOB_DEAD_LETTER,
            job_id,
            job_kind,
            note_id,
            attempts,
            error,
            payload = %payload
        ),
        Err(err) => warn!(
            target: JOB_TARGET,
            event = EVENT_JOB_DEAD_LETTER,
            %err,
            "failed to encode job dead letter event"
        ),
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_clamps_to_u64() {
        let duration = Duration::new(u64::MAX, 0);
        assert_eq!(duration_to_ms(duration), u64::MAX);
    }
}
