//! Engine-wide tunables, mirroring the enumerated configuration in the
//! product specification. Every field has the documented default and can be
//! overridden from the environment (see [`SessionEngineConfig::from_env`]).

use std::time::Duration;

/// Central configuration for the session orchestration engine.
///
/// Constructed once at startup and shared (by value — it is cheaply
/// `Clone`) across the registry, every `SessionActor`, and both external
/// clients.
#[derive(Debug, Clone)]
pub struct SessionEngineConfig {
    pub confidence_hard_floor: f32,
    pub confidence_auto_post_threshold: f32,
    pub confirm_grace: Duration,
    pub audio_bytes_limit: usize,
    pub audio_duration_limit: Duration,
    pub mailbox_soft: usize,
    pub mailbox_hard: usize,
    pub subscriber_queue_capacity: usize,
    pub outbox_retain: usize,
    pub transcription_timeout: Duration,
    pub transcription_overall_budget: Duration,
    pub structuring_timeout: Duration,
    pub structuring_overall_budget: Duration,
    pub breaker_fail_threshold: u32,
    pub breaker_fail_window: Duration,
    pub breaker_half_open_after: Duration,
    pub retry_base: Duration,
    pub retry_factor: f64,
    pub retry_jitter_pct: f64,
    pub retry_cap: Duration,
    pub retry_max_attempts: u32,
    pub checkpoint_interval: Duration,
    pub job_idempotency_window: Duration,
    pub job_max_attempts: u32,
}

impl Default for SessionEngineConfig {
    fn default() -> Self {
        Self {
            confidence_hard_floor: 0.25,
            confidence_auto_post_threshold: 0.70,
            confirm_grace: Duration::from_millis(3_000),
            audio_bytes_limit: 5 * 1024 * 1024,
            audio_duration_limit: Duration::from_secs(60),
            mailbox_soft: 50,
            mailbox_hard: 200,
            subscriber_queue_capacity: 256,
            outbox_retain: 100,
            transcription_timeout: Duration::from_secs(30),
            transcription_overall_budget: Duration::from_secs(60),
            structuring_timeout: Duration::from_secs(15),
            structuring_overall_budget: Duration::from_secs(30),
            breaker_fail_threshold: 5,
            breaker_fail_window: Duration::from_secs(30),
            breaker_half_open_after: Duration::from_secs(10),
            retry_base: Duration::from_millis(200),
            retry_factor: 2.0,
            retry_jitter_pct: 25.0,
            retry_cap: Duration::from_secs(10),
            retry_max_attempts: 4,
            checkpoint_interval: Duration::from_secs(5 * 60),
            job_idempotency_window: Duration::from_secs(60),
            job_max_attempts: 3,
        }
    }
}

impl SessionEngineConfig {
    /// Applies overrides from `FLOWNOTE_*` environment variables on top of
    /// the documented defaults. Unset or unparsable variables are ignored —
    /// a malformed override should not be able to take the engine down.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_f32("FLOWNOTE_CONFIDENCE_HARD_FLOOR") {
            config.confidence_hard_floor = value;
        }
        if let Some(value) = env_f32("FLOWNOTE_CONFIDENCE_AUTO_POST_THRESHOLD") {
            config.confidence_auto_post_threshold = value;
        }
        if let Some(value) = env_duration_ms("FLOWNOTE_CONFIRM_GRACE_MS") {
            config.confirm_grace = value;
        }
        if let Some(value) = env_usize("FLOWNOTE_AUDIO_BYTES_LIMIT") {
            config.audio_bytes_limit = value;
        }
        if let Some(value) = env_duration_secs("FLOWNOTE_AUDIO_DURATION_LIMIT_S") {
            config.audio_duration_limit = value;
        }
        if let Some(value) = env_usize("FLOWNOTE_MAILBOX_SOFT") {
            config.mailbox_soft = value;
        }
        if let Some(value) = env_usize("FLOWNOTE_MAILBOX_HARD") {
            config.mailbox_hard = value;
        }
        if let Some(value) = env_usize("FLOWNOTE_SUBSCRIBER_QUEUE_CAPACITY") {
            config.subscriber_queue_capacity = value;
        }
        if let Some(value) = env_usize("FLOWNOTE_OUTBOX_RETAIN") {
            config.outbox_retain = value;
        }

        config
    }
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    std::env::var(key).ok()?.parse().ok().map(Duration::from_millis)
}

fn env_duration_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok()?.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_specification() {
        let config = SessionEngineConfig::default();
        assert_eq!(config.confidence_hard_floor, 0.25);
        assert_eq!(config.confidence_auto_post_threshold, 0.70);
        assert_eq!(config.confirm_grace, Duration::from_millis(3_000));
        assert_eq!(config.mailbox_soft, 50);
        assert_eq!(config.mailbox_hard, 200);
        assert_eq!(config.outbox_retain, 100);
        assert_eq!(config.retry_max_attempts, 4);
    }

    #[test]
    fn env_override_is_picked_up() {
        std::env::set_var("FLOWNOTE_MAILBOX_SOFT", "12");
        let config = SessionEngineConfig::from_env();
        assert_eq!(config.mailbox_soft, 12);
        std::env::remove_var("FLOWNOTE_MAILBOX_SOFT");
    }
}
