//! The `Note` entity and the `NoteStore` persistence boundary.

pub mod sqlite_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite_store::SqliteNoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Draft,
    QueuedForPosting,
    Posting,
    Posted,
    Failed,
    Archived,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Draft => "draft",
            NoteStatus::QueuedForPosting => "queued_for_posting",
            NoteStatus::Posting => "posting",
            NoteStatus::Posted => "posted",
            NoteStatus::Failed => "failed",
            NoteStatus::Archived => "archived",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "queued_for_posting" => NoteStatus::QueuedForPosting,
            "posting" => NoteStatus::Posting,
            "posted" => NoteStatus::Posted,
            "failed" => NoteStatus::Failed,
            "archived" => NoteStatus::Archived,
            _ => NoteStatus::Draft,
        }
    }
}

/// What fed the visual context attached to a note at structuring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentSource {
    None,
    LocalEmbedding,
    CloudVision,
}

impl EnrichmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentSource::None => "none",
            EnrichmentSource::LocalEmbedding => "local_embedding",
            EnrichmentSource::CloudVision => "cloud_vision",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "local_embedding" => EnrichmentSource::LocalEmbedding,
            "cloud_vision" => EnrichmentSource::CloudVision,
            _ => EnrichmentSource::None,
        }
    }
}

/// A post-action recorded against a note (e.g. "created a calendar event",
/// "posted to the team channel"). Mirrors the structure of a history post
/// action but scoped to this engine's own note lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostAction {
    pub kind: String,
    pub target: String,
    pub occurred_at_ms: i64,
}

/// Visual context captured alongside a note at structuring time (the frame
/// embedding / video timestamp the structured note was derived from).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VisualContext {
    pub video_id: Option<String>,
    pub video_timestamp_seconds: Option<f64>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub note_id: String,
    pub session_id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub raw_transcript: String,
    pub confidence: f32,
    pub status: NoteStatus,
    pub visual_context: VisualContext,
    pub enrichment_source: EnrichmentSource,
    pub post_actions: Vec<PostAction>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NoteQuery {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub keyword: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct NotePage {
    pub notes: Vec<Note>,
    pub total: i64,
    pub next_offset: Option<usize>,
}

#[derive(Debug, Error)]
pub enum NoteStoreError {
    #[error("note {0} not found")]
    NotFound(String),
    #[error("note store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl NoteStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NoteStoreError::Backend(_))
    }
}

/// Persistence boundary for `Note` entities. `SessionActor`s never talk to
/// SQLite directly; they go through this trait so the storage backend can
/// be swapped in tests.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn upsert(&self, note: &Note) -> Result<(), NoteStoreError>;
    async fn get(&self, note_id: &str) -> Result<Option<Note>, NoteStoreError>;
    async fn search(&self, query: &NoteQuery) -> Result<NotePage, NoteStoreError>;
    async fn append_post_action(
        &self,
        note_id: &str,
        action: PostAction,
    ) -> Result<Vec<PostAction>, NoteStoreError>;
    async fn archive(&self, note_id: &str) -> Result<(), NoteStoreError>;
}

/// Builds a fresh draft note from a structuring result, following the
/// confidence filtering rule: below the hard floor the caller should
/// discard instead of constructing a note at all.
pub fn new_draft(
    note_id: String,
    session_id: String,
    user_id: String,
    title: String,
    body: String,
    raw_transcript: String,
    confidence: f32,
    visual_context: VisualContext,
    enrichment_source: EnrichmentSource,
    now_ms: i64,
) -> Note {
    Note {
        note_id,
        session_id,
        user_id,
        title,
        body,
        raw_transcript,
        confidence,
        status: NoteStatus::Draft,
        visual_context,
        enrichment_source,
        post_actions: Vec::new(),
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
    }
}
