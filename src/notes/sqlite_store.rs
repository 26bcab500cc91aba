//! `NoteStore` implementation backed by SQLCipher, following the same
//! connection-pool/pragma/FTS5 shape as the engine's session checkpoint
//! store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::{
    EnrichmentSource, Note, NoteQuery, NotePage, NoteStatus, NoteStore, NoteStoreError, PostAction,
    VisualContext,
};

/// Resolves the SQLCipher key material, mirroring the engine-wide
/// `FLOWNOTE_SQLCIPHER_KEY` environment convention.
pub trait KeyResolver: Send + Sync {
    fn resolve_key(&self) -> Result<Option<String>>;
}

#[derive(Default)]
pub struct EnvKeyResolver;

impl KeyResolver for EnvKeyResolver {
    fn resolve_key(&self) -> Result<Option<String>> {
        Ok(std::env::var("FLOWNOTE_SQLCIPHER_KEY").ok())
    }
}

#[derive(Debug, Clone)]
pub enum SqlitePath {
    File(PathBuf),
    Memory,
}

impl SqlitePath {
    fn to_manager(&self) -> SqliteConnectionManager {
        match self {
            SqlitePath::File(path) => {
                SqliteConnectionManager::file(path).with_flags(Self::open_flags())
            }
            SqlitePath::Memory => {
                SqliteConnectionManager::memory().with_flags(Self::open_flags())
            }
        }
    }

    fn open_flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    }

    fn as_path(&self) -> Option<&Path> {
        match self {
            SqlitePath::File(path) => Some(path.as_path()),
            SqlitePath::Memory => None,
        }
    }
}

#[derive(Clone)]
pub struct SqliteNoteStoreConfig {
    pub path: SqlitePath,
    pub pool_size: u32,
    pub busy_timeout: Duration,
    pub key_resolver: Arc<dyn KeyResolver>,
}

impl SqliteNoteStoreConfig {
    pub fn memory() -> Self {
        Self {
            path: SqlitePath::Memory,
            pool_size: 4,
            busy_timeout: Duration::from_millis(250),
            key_resolver: Arc::new(EnvKeyResolver::default()),
        }
    }

    pub fn file(path: PathBuf) -> Self {
        Self {
            path: SqlitePath::File(path),
            pool_size: 8,
            busy_timeout: Duration::from_millis(250),
            key_resolver: Arc::new(EnvKeyResolver::default()),
        }
    }
}

#[derive(Clone)]
pub struct SqliteNoteStore {
    pool: Pool<SqliteConnectionManager>,
    db_path: Option<PathBuf>,
}

impl SqliteNoteStore {
    pub fn bootstrap(config: SqliteNoteStoreConfig) -> Result<Self> {
        let key_material = config.key_resolver.resolve_key()?;
        let key_for_init = key_material.clone();
        let busy_timeout = config.busy_timeout;
        let manager = config.path.to_manager().with_init(move |conn| {
            Self::configure_connection(conn, busy_timeout, key_for_init.as_deref())
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .context("failed to create SQLCipher connection pool")?;

        {
            let mut conn = pool
                .get()
                .context("failed to acquire SQLCipher bootstrap connection")?;
            Self::run_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            db_path: config.path.as_path().map(Path::to_path_buf),
        })
    }

    fn configure_connection(
        conn: &mut Connection,
        busy_timeout: Duration,
        key: Option<&str>,
    ) -> rusqlite::Result<()> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        if let Some(value) = key {
            conn.pragma_update(None, "key", value)?;
        }
        Ok(())
    }

    fn run_migrations(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                note_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                raw_transcript TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL,
                visual_context TEXT NOT NULL DEFAULT '{}',
                enrichment_source TEXT NOT NULL DEFAULT 'none',
                post_actions TEXT NOT NULL DEFAULT '[]',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS notes_index USING fts5(
                note_id UNINDEXED,
                title,
                body,
                content='notes',
                content_rowid='rowid',
                tokenize='unicode61 remove_diacritics 2'
            );

            CREATE TRIGGER IF NOT EXISTS notes_ai AFTER INSERT ON notes BEGIN
                INSERT INTO notes_index(rowid, note_id, title, body)
                VALUES (new.rowid, new.note_id, new.title, new.body);
            END;

            CREATE TRIGGER IF NOT EXISTS notes_ad AFTER DELETE ON notes BEGIN
                INSERT INTO notes_index(notes_index, rowid, note_id, title, body)
                VALUES('delete', old.rowid, old.note_id, old.title, old.body);
            END;

            CREATE TRIGGER IF NOT EXISTS notes_au AFTER UPDATE ON notes BEGIN
                INSERT INTO notes_index(notes_index, rowid, note_id, title, body)
                VALUES('delete', old.rowid, old.note_id, old.title, old.body);
                INSERT INTO notes_index(rowid, note_id, title, body)
                VALUES (new.rowid, new.note_id, new.title, new.body);
            END;

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT,
                video_id TEXT,
                video_timestamp_seconds REAL,
                status TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                last_transition_at_ms INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                job_kind TEXT NOT NULL,
                note_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .context("failed to run note store migrations")?;

        conn.prepare("SELECT count(*) FROM notes_index")
            .context("FTS5 notes_index missing after migration")?
            .query_row([], |row| row.get::<_, i64>(0))
            .context("failed to read notes_index after migration")?;

        Ok(())
    }

    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|err| anyhow!("failed to obtain note store connection: {err}"))
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn read_note(row: &Row) -> rusqlite::Result<Note> {
        let status: String = row.get("status")?;
        let visual_context: VisualContext = row
            .get::<_, Option<String>>("visual_context")?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        let post_actions: Vec<PostAction> = row
            .get::<_, Option<String>>("post_actions")?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        let enrichment_source: String = row
            .get::<_, Option<String>>("enrichment_source")?
            .unwrap_or_default();

        Ok(Note {
            note_id: row.get("note_id")?,
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            title: row.get("title")?,
            body: row.get("body")?,
            raw_transcript: row.get("raw_transcript")?,
            confidence: row.get::<_, f64>("confidence")? as f32,
            status: NoteStatus::from_db(&status),
            visual_context,
            enrichment_source: EnrichmentSource::from_db(&enrichment_source),
            post_actions,
            created_at_ms: row.get("created_at_ms")?,
            updated_at_ms: row.get("updated_at_ms")?,
        })
    }
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn upsert(&self, note: &Note) -> Result<(), NoteStoreError> {
        let conn = self.connection().map_err(NoteStoreError::Backend)?;
        let visual_context = serde_json::to_string(&note.visual_context)
            .context("failed to serialize visual context")
            .map_err(NoteStoreError::Backend)?;
        let post_actions = serde_json::to_string(&note.post_actions)
            .context("failed to serialize post actions")
            .map_err(NoteStoreError::Backend)?;

        conn.execute(
            "INSERT INTO notes (
                note_id, session_id, user_id, title, body, raw_transcript,
                confidence, status, visual_context, enrichment_source, post_actions,
                created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(note_id) DO UPDATE SET
                title=excluded.title,
                body=excluded.body,
                raw_transcript=excluded.raw_transcript,
                confidence=excluded.confidence,
                status=excluded.status,
                visual_context=excluded.visual_context,
                enrichment_source=excluded.enrichment_source,
                updated_at_ms=excluded.updated_at_ms
            ",
            params![
                note.note_id,
                note.session_id,
                note.user_id,
                note.title,
                note.body,
                note.raw_transcript,
                note.confidence as f64,
                note.status.as_str(),
                visual_context,
                note.enrichment_source.as_str(),
                post_actions,
                note.created_at_ms,
                note.updated_at_ms,
            ],
        )
        .context("failed to upsert note")
        .map_err(NoteStoreError::Backend)?;

        Ok(())
    }

    async fn get(&self, note_id: &str) -> Result<Option<Note>, NoteStoreError> {
        let conn = self.connection().map_err(NoteStoreError::Backend)?;
        let mut stmt = conn
            .prepare(
                "SELECT note_id, session_id, user_id, title, body, raw_transcript,
                    confidence, status, visual_context, enrichment_source, post_actions,
                    created_at_ms, updated_at_ms
                FROM notes WHERE note_id = ?1",
            )
            .context("failed to prepare note lookup")
            .map_err(NoteStoreError::Backend)?;

        stmt.query_row(params![note_id], Self::read_note)
            .optional()
            .context("failed to read note")
            .map_err(NoteStoreError::Backend)
    }

    async fn search(&self, query: &NoteQuery) -> Result<NotePage, NoteStoreError> {
        let conn = self.connection().map_err(NoteStoreError::Backend)?;
        let mut filters = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(session_id) = query.session_id.as_deref().filter(|s| !s.is_empty()) {
            filters.push("session_id = ?".to_string());
            values.push(SqlValue::Text(session_id.to_string()));
        }
        if let Some(user_id) = query.user_id.as_deref().filter(|s| !s.is_empty()) {
            filters.push("user_id = ?".to_string());
            values.push(SqlValue::Text(user_id.to_string()));
        }
        if let Some(keyword) = query.keyword.as_deref().filter(|s| !s.trim().is_empty()) {
            filters.push(
                "rowid IN (SELECT rowid FROM notes_index WHERE notes_index MATCH ?)".to_string(),
            );
            values.push(SqlValue::Text(format!("{}*", keyword.trim())));
        }

        let mut base_query = "SELECT note_id, session_id, user_id, title, body, raw_transcript, \
            confidence, status, visual_context, enrichment_source, post_actions, created_at_ms, updated_at_ms \
            FROM notes"
            .to_string();
        if !filters.is_empty() {
            base_query.push_str(" WHERE ");
            base_query.push_str(&filters.join(" AND "));
        }
        base_query.push_str(" ORDER BY updated_at_ms DESC LIMIT ? OFFSET ?");

        let mut page_values = values.clone();
        page_values.push(SqlValue::Integer(query.limit as i64));
        page_values.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn
            .prepare(&base_query)
            .context("failed to prepare note search")
            .map_err(NoteStoreError::Backend)?;
        let mut rows = stmt
            .query(rusqlite::params_from_iter(page_values.iter()))
            .context("failed to execute note search")
            .map_err(NoteStoreError::Backend)?;

        let mut notes = Vec::new();
        while let Some(row) = rows
            .next()
            .context("failed to step note search cursor")
            .map_err(NoteStoreError::Backend)?
        {
            notes.push(Self::read_note(row).context("failed to decode note row").map_err(NoteStoreError::Backend)?);
        }

        let mut count_sql = "SELECT COUNT(*) FROM notes".to_string();
        if !filters.is_empty() {
            count_sql.push_str(" WHERE ");
            count_sql.push_str(&filters.join(" AND "));
        }
        let total: i64 = conn
            .prepare(&count_sql)
            .context("failed to prepare note count")
            .map_err(NoteStoreError::Backend)?
            .query_row(rusqlite::params_from_iter(values.iter()), |row| row.get(0))
            .context("failed to read note count")
            .map_err(NoteStoreError::Backend)?;

        let next_offset = if (query.offset + notes.len()) < total as usize {
            Some(query.offset + notes.len())
        } else {
            None
        };

        Ok(NotePage {
            notes,
            total,
            next_offset,
        })
    }

    async fn append_post_action(
        &self,
        note_id: &str,
        action: PostAction,
    ) -> Result<Vec<PostAction>, NoteStoreError> {
        let mut conn = self.connection().map_err(NoteStoreError::Backend)?;
        let tx = conn
            .transaction()
            .context("failed to open post action transaction")
            .map_err(NoteStoreError::Backend)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT post_actions FROM notes WHERE note_id = ?1",
                params![note_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load post actions")
            .map_err(NoteStoreError::Backend)?;

        let existing = existing.ok_or_else(|| NoteStoreError::NotFound(note_id.to_string()))?;
        let mut actions: Vec<PostAction> =
            serde_json::from_str(&existing).unwrap_or_default();
        actions.push(action);
        let encoded = serde_json::to_string(&actions)
            .context("failed to encode post actions")
            .map_err(NoteStoreError::Backend)?;

        tx.execute(
            "UPDATE notes SET post_actions = ?2 WHERE note_id = ?1",
            params![note_id, encoded],
        )
        .context("failed to persist post action")
        .map_err(NoteStoreError::Backend)?;

        tx.commit()
            .context("failed to commit post action transaction")
            .map_err(NoteStoreError::Backend)?;

        Ok(actions)
    }

    async fn archive(&self, note_id: &str) -> Result<(), NoteStoreError> {
        let conn = self.connection().map_err(NoteStoreError::Backend)?;
        let affected = conn
            .execute(
                "UPDATE notes SET status = ?2 WHERE note_id = ?1",
                params![note_id, NoteStatus::Archived.as_str()],
            )
            .context("failed to archive note")
            .map_err(NoteStoreError::Backend)?;

        if affected == 0 {
            return Err(NoteStoreError::NotFound(note_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteNoteStore {
        SqliteNoteStore::bootstrap(SqliteNoteStoreConfig::memory()).expect("bootstrap note store")
    }

    fn sample_note(note_id: &str) -> Note {
        Note {
            note_id: note_id.to_string(),
            session_id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            title: "Kickoff notes".to_string(),
            body: "Discussed rollout plan.".to_string(),
            raw_transcript: "discussed rollout plan".to_string(),
            confidence: 0.82,
            status: NoteStatus::Draft,
            visual_context: VisualContext::default(),
            enrichment_source: EnrichmentSource::None,
            post_actions: Vec::new(),
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = store();
        let note = sample_note("note-1");
        store.upsert(&note).await.expect("upsert");

        let fetched = store.get("note-1").await.expect("get").expect("present");
        assert_eq!(fetched.title, note.title);
        assert_eq!(fetched.status, NoteStatus::Draft);
    }

    #[tokio::test]
    async fn search_matches_fts_keyword() {
        let store = store();
        store.upsert(&sample_note("note-1")).await.expect("upsert");

        let page = store
            .search(&NoteQuery {
                keyword: Some("rollout".to_string()),
                limit: 10,
                ..Default::default()
            })
            .await
            .expect("search");

        assert_eq!(page.notes.len(), 1);
        assert_eq!(page.notes[0].note_id, "note-1");
    }

    #[tokio::test]
    async fn archive_missing_note_errors() {
        let store = store();
        let result = store.archive("does-not-exist").await;
        assert!(matches!(result, Err(NoteStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn append_post_action_accumulates() {
        let store = store();
        store.upsert(&sample_note("note-1")).await.expect("upsert");

        let actions = store
            .append_post_action(
                "note-1",
                PostAction {
                    kind: "calendar_event".to_string(),
                    target: "calendar".to_string(),
                    occurred_at_ms: 2_000,
                },
            )
            .await
            .expect("append");

        assert_eq!(actions.len(), 1);
    }
}
