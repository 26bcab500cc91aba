//! Periodic session checkpointing: a small snapshot persisted every few
//! minutes and on graceful shutdown. The audio buffer and visual context
//! are deliberately excluded — only what is needed to resume bookkeeping
//! after a restart.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use crate::notes::SqliteNoteStore;
use crate::telemetry::events::{record_checkpoint_failed, record_checkpoint_persisted};

use super::types::{SessionId, SessionStatus};

#[derive(Debug, Clone)]
pub struct SessionCheckpoint {
    pub session_id: SessionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub video_id: Option<String>,
    pub video_timestamp_seconds: Option<f64>,
    pub status: SessionStatus,
    pub sequence: u64,
    pub last_transition_at_ms: i64,
}

#[async_trait]
pub trait SessionCheckpointStore: Send + Sync {
    async fn persist(&self, checkpoint: &SessionCheckpoint) -> anyhow::Result<()>;
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionCheckpoint>>;
}

#[async_trait]
impl SessionCheckpointStore for SqliteNoteStore {
    async fn persist(&self, checkpoint: &SessionCheckpoint) -> anyhow::Result<()> {
        let conn = self.connection()?;
        let now_ms = checkpoint.last_transition_at_ms;
        let result = conn.execute(
            "INSERT INTO sessions (
                session_id, user_id, device_id, video_id, video_timestamp_seconds,
                status, sequence, last_transition_at_ms, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8)
            ON CONFLICT(session_id) DO UPDATE SET
                video_id=excluded.video_id,
                video_timestamp_seconds=excluded.video_timestamp_seconds,
                status=excluded.status,
                sequence=excluded.sequence,
                last_transition_at_ms=excluded.last_transition_at_ms,
                updated_at_ms=excluded.updated_at_ms
            ",
            params![
                checkpoint.session_id,
                checkpoint.user_id,
                checkpoint.device_id,
                checkpoint.video_id,
                checkpoint.video_timestamp_seconds,
                checkpoint.status.as_str(),
                checkpoint.sequence as i64,
                now_ms,
            ],
        );

        match result {
            Ok(_) => {
                record_checkpoint_persisted(&checkpoint.session_id, checkpoint.sequence);
                Ok(())
            }
            Err(err) => {
                record_checkpoint_failed(&checkpoint.session_id, &err.to_string());
                Err(err.into())
            }
        }
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Option<SessionCheckpoint>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, device_id, video_id, video_timestamp_seconds,
                status, sequence, last_transition_at_ms
            FROM sessions WHERE session_id = ?1",
        )?;

        let checkpoint = stmt
            .query_row(params![session_id], |row| {
                let status: String = row.get("status")?;
                Ok(SessionCheckpoint {
                    session_id: row.get("session_id")?,
                    user_id: row.get("user_id")?,
                    device_id: row.get("device_id")?,
                    video_id: row.get("video_id")?,
                    video_timestamp_seconds: row.get("video_timestamp_seconds")?,
                    status: status_from_db(&status),
                    sequence: row.get::<_, i64>("sequence")? as u64,
                    last_transition_at_ms: row.get("last_transition_at_ms")?,
                })
            })
            .optional()?;

        Ok(checkpoint)
    }
}

fn status_from_db(value: &str) -> SessionStatus {
    match value {
        "listening" => SessionStatus::Listening,
        "transcribing" => SessionStatus::Transcribing,
        "structuring" => SessionStatus::Structuring,
        "confirming" => SessionStatus::Confirming,
        "executing_tool" => SessionStatus::ExecutingTool,
        "cancelling" => SessionStatus::Cancelling,
        "error" => SessionStatus::Error,
        _ => SessionStatus::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::sqlite_store::SqliteNoteStoreConfig;

    #[tokio::test]
    async fn persisted_checkpoint_round_trips() {
        let store = SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap");
        let checkpoint = SessionCheckpoint {
            session_id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            device_id: Some("device-1".to_string()),
            video_id: None,
            video_timestamp_seconds: None,
            status: SessionStatus::Listening,
            sequence: 3,
            last_transition_at_ms: 1_000,
        };

        store.persist(&checkpoint).await.expect("persist");
        let loaded = store.load("sess-1").await.expect("load").expect("present");
        assert_eq!(loaded.status, SessionStatus::Listening);
        assert_eq!(loaded.sequence, 3);
    }
}
