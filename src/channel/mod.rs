//! The WebSocket gateway: `GET /ws/:session_id` upgrades to a JSON-framed
//! duplex channel carrying the `{v, type, correlation_id?, payload,
//! sequence?}` envelope, grounded on the voice audio WebSocket handler's
//! split-socket ingest/egress task pair.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::bus::Topic;
use crate::registry::SessionRegistry;
use crate::session::{OutboundEvent, SendOutcome, SequencedEvent};

const PROTOCOL_VERSION: u32 = 2;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/:session_id", get(upgrade_session))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[allow(dead_code)]
    v: Option<u32>,
    #[serde(rename = "type")]
    kind: String,
    correlation_id: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OutboundFrame {
    v: u32,
    #[serde(rename = "type")]
    kind: &'static str,
    sequence: Option<u64>,
    payload: serde_json::Value,
}

async fn upgrade_session(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_session_socket(socket, session_id, state).instrument(info_span!("channel"))
    })
}

/// For this milestone the connecting principal's user id travels as the
/// session id's owner; a real deployment attaches it from an upstream auth
/// layer (see the Non-goals on authentication).
async fn handle_session_socket(socket: WebSocket, session_id: String, state: GatewayState) {
    let handle = state
        .registry
        .get_or_create(session_id.clone(), session_id.clone(), None)
        .await;

    let topic = Topic::session(&session_id);
    let mut subscription = state.registry.bus().subscribe(&topic, session_id.clone()).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut egress = tokio::spawn(async move {
        while let Some(sequenced) = subscription.recv().await {
            let frame = outbound_frame(&sequenced);
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let ingest_handle = Arc::clone(&handle);
    let mut ingest = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Err(err) = dispatch_inbound(&ingest_handle, &text).await {
                        warn!(error = %err, "failed to dispatch inbound frame");
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut ingest => { egress.abort(); }
        _ = &mut egress => { ingest.abort(); }
    }

    info!(session_id = %session_id, "gateway connection closed");
}

async fn dispatch_inbound(handle: &crate::session::SessionHandle, text: &str) -> anyhow::Result<()> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    let correlation_id = frame.correlation_id.unwrap_or_default();

    let outcome = match frame.kind.as_str() {
        "audio_chunk" => {
            let encoded = frame
                .payload
                .get("bytes")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("audio_chunk frame missing bytes"))?;
            let bytes = BASE64.decode(encoded)?;
            handle.send_audio_chunk(correlation_id, bytes).await
        }
        "audio_stream_end" => handle.stop_listening(correlation_id).await,
        "transcript_final" => {
            let text = frame
                .payload
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("transcript_final frame missing text"))?
                .to_string();
            let source = frame
                .payload
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("local")
                .to_string();
            let confidence = frame
                .payload
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0) as f32;
            let audio_duration_s = frame.payload.get("audio_duration_s").and_then(|v| v.as_f64());
            handle
                .transcript_ready(correlation_id, text, source, confidence, audio_duration_s)
                .await
        }
        "frame_embedding" => {
            let device = frame
                .payload
                .get("device")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let video_timestamp_seconds = frame
                .payload
                .get("timestamp_seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let embedding = frame
                .payload
                .get("vector")
                .and_then(|v| v.as_array())
                .map(|values| values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .unwrap_or_default();
            handle
                .frame_embedding(correlation_id, device, video_timestamp_seconds, embedding)
                .await
        }
        "set_timestamp" => {
            let seconds = frame
                .payload
                .get("seconds")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow::anyhow!("set_timestamp frame missing seconds"))?;
            handle.set_timestamp(seconds).await;
            SendOutcome::Accepted
        }
        "catchup" => {
            let last_seen_sequence = frame
                .payload
                .get("last_seen_sequence")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            handle.subscriber_catchup(last_seen_sequence).await
        }
        "cancel" => {
            let scope = frame.payload.get("scope").and_then(|v| v.as_str()).map(str::to_string);
            handle.cancel(scope).await;
            SendOutcome::Accepted
        }
        "update_video_context" => {
            let video_id = frame
                .payload
                .get("video_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let video_timestamp_seconds = frame
                .payload
                .get("video_timestamp_seconds")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            handle.update_video_context(video_id, video_timestamp_seconds).await;
            SendOutcome::Accepted
        }
        "confirm_note" => {
            let note_id = frame
                .payload
                .get("note_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("confirm_note frame missing note_id"))?
                .to_string();
            handle.confirm_note(note_id).await
        }
        "reject_note" => {
            let note_id = frame
                .payload
                .get("note_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("reject_note frame missing note_id"))?
                .to_string();
            handle.reject_note(note_id).await
        }
        other => {
            warn!(kind = other, "unrecognized inbound frame kind");
            SendOutcome::Accepted
        }
    };

    if outcome == SendOutcome::Rejected {
        warn!(session_id = %handle.session_id(), "inbound frame rejected by mailbox backpressure");
    }

    Ok(())
}

fn outbound_frame(sequenced: &SequencedEvent) -> OutboundFrame {
    let (kind, payload): (&'static str, serde_json::Value) = match &sequenced.event {
        OutboundEvent::StateChanged { from, to } => (
            "state_changed",
            serde_json::json!({ "from": from.as_str(), "to": to.as_str() }),
        ),
        OutboundEvent::NoteCreated { note } => ("note_created", serde_json::json!({ "note": note })),
        OutboundEvent::NoteUpdated { note } => ("note_updated", serde_json::json!({ "note": note })),
        OutboundEvent::NoteArchived { note_id } => {
            ("note_archived", serde_json::json!({ "note_id": note_id }))
        }
        OutboundEvent::JobStatus { note_id, job_id, status } => (
            "job_status",
            serde_json::json!({ "note_id": note_id, "job_id": job_id, "status": status }),
        ),
        OutboundEvent::VideoContextChanged {
            video_id,
            video_timestamp_seconds,
        } => (
            "video_context_changed",
            serde_json::json!({ "video_id": video_id, "video_timestamp_seconds": video_timestamp_seconds }),
        ),
        OutboundEvent::Backpressure { mailbox_len, threshold } => (
            "backpressure",
            serde_json::json!({ "mailbox_len": mailbox_len, "threshold": threshold }),
        ),
        OutboundEvent::Error {
            kind,
            message,
            transient,
        } => (
            "error",
            serde_json::json!({ "kind": kind, "message": message, "transient": transient }),
        ),
        OutboundEvent::SessionRecovered { replayed_events } => (
            "session_recovered",
            serde_json::json!({ "replayed_events": replayed_events }),
        ),
        OutboundEvent::CatchupUnavailable {
            requested_sequence,
            earliest_available_sequence,
        } => (
            "catchup_unavailable",
            serde_json::json!({
                "requested_sequence": requested_sequence,
                "earliest_available_sequence": earliest_available_sequence,
            }),
        ),
    };

    OutboundFrame {
        v: PROTOCOL_VERSION,
        kind,
        sequence: Some(sequenced.sequence),
        payload,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    active_sessions: usize,
}

async fn healthz(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        active_sessions: state.registry.len().await,
    })
}
