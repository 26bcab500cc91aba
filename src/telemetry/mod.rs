//! Observability bootstrap: a global `tracing` subscriber that writes
//! human-readable output to stderr and rolling JSON lines to disk.

pub mod events;

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

const LOG_DIR: &str = "logs/telemetry";
const LOG_DIR_ENV: &str = "FLOWNOTE_TELEMETRY_DIR";
const TELEMETRY_PREFIX: &str = "session-engine.json";
const RETENTION_DAYS: u64 = 7;

static TELEMETRY_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match build_file_writer() {
            Ok((writer, guard)) => {
                let _ = TELEMETRY_GUARD.set(guard);
                let file_layer = fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(writer);
                let subscriber = Registry::default()
                    .with(env_filter.clone())
                    .with(fmt::layer().with_target(false))
                    .with(file_layer);

                tracing::subscriber::set_global_default(subscriber)
                    .expect("failed to set global subscriber");
            }
            Err(err) => {
                eprintln!("failed to initialize telemetry file logging: {err}");
                let subscriber = Registry::default()
                    .with(env_filter)
                    .with(fmt::layer().with_target(false));

                tracing::subscriber::set_global_default(subscriber)
                    .expect("failed to set global subscriber");
            }
        }
    });
}

fn build_file_writer() -> io::Result<(NonBlocking, WorkerGuard)> {
    let log_dir = telemetry_dir();
    fs::create_dir_all(&log_dir)?;

    if let Err(err) = prune_old_logs(&log_dir, RETENTION_DAYS) {
        eprintln!("failed to prune telemetry logs: {err}");
    }

    let appender = tracing_appender::rolling::daily(log_dir, TELEMETRY_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

fn telemetry_dir() -> PathBuf {
    env::var(LOG_DIR_ENV)
        .ok()
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(LOG_DIR))
}

/// Blocks briefly to flush the non-blocking file appender. Intended for
/// tests and graceful shutdown, not the hot path.
pub fn flush_tracing() {
    if TELEMETRY_GUARD.get().is_some() {
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn prune_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    let retention = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60));
    let threshold = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let file_name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };

        if !file_name.starts_with(TELEMETRY_PREFIX) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };

        if !metadata.is_file() {
            continue;
        }

        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(_) => continue,
        };

        if modified < threshold {
            let _ = fs::remove_file(entry.path());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::events::{record_session_state_changed, EVENT_STATE_CHANGED, SESSION_TARGET};
    use super::*;
    use serde_json::Value;

    #[test]
    fn telemetry_logs_are_json_enveloped() {
        let temp_dir = tempfile::tempdir().expect("temp telemetry dir");
        env::set_var(LOG_DIR_ENV, temp_dir.path());

        init_tracing();

        record_session_state_changed("sess-1", "idle", "listening");

        flush_tracing();

        let mut attempts = 0;
        let log_path = loop {
            let mut log_files: Vec<_> = fs::read_dir(temp_dir.path())
                .expect("telemetry directory listing")
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .collect();

            if let Some(path) = log_files.pop() {
                break path;
            }

            attempts += 1;
            assert!(attempts < 10, "expected telemetry log file to be created");
            std::thread::sleep(Duration::from_millis(50));
        };

        let contents = fs::read_to_string(&log_path).expect("log contents readable");

        let mut saw_transition = false;
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            let record: Value = serde_json::from_str(line).expect("valid telemetry json line");
            let target = record
                .get("target")
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            if target != SESSION_TARGET {
                continue;
            }

            let fields = record
                .get("fields")
                .and_then(|value| value.as_object())
                .expect("fields object present");
            let event = fields
                .get("event")
                .and_then(|value| value.as_str())
                .unwrap_or_default();

            if event == EVENT_STATE_CHANGED {
                assert_eq!(
                    fields.get("session_id").and_then(|v| v.as_str()),
                    Some("sess-1")
                );
                assert_eq!(fields.get("from").and_then(|v| v.as_str()), Some("idle"));
                assert_eq!(
                    fields.get("to").and_then(|v| v.as_str()),
                    Some("listening")
                );
                saw_transition = true;
            }
        }

        assert!(saw_transition, "missing state transition telemetry record");
    }
}
