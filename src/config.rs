//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::QueueSettings;

/// What the watchdog does with a message that exhausted its redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadLetterPolicy {
    /// Log and report only; an operator decides what happens next.
    #[default]
    Surface,
    /// Publish a fresh message for the session, at most `max_resubmissions` times.
    Resubmit { max_resubmissions: u32 },
}

impl FromStr for DeadLetterPolicy {
    type Err = String;

    /// Accepts `surface`, `resubmit` (one resubmission) or `resubmit:<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "surface" => Ok(Self::Surface),
            None if s == "resubmit" => Ok(Self::Resubmit {
                max_resubmissions: 1,
            }),
            Some(("resubmit", n)) => n
                .parse()
                .map(|max_resubmissions| Self::Resubmit { max_resubmissions })
                .map_err(|e| format!("invalid resubmission count '{n}': {e}")),
            _ => Err(format!("expected 'surface' or 'resubmit[:<n>]', got '{s}'")),
        }
    }
}

/// Orchestrator configuration shared by the dispatcher, worker and watchdog.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the libSQL database holding sessions, events and the queue.
    pub db_path: PathBuf,
    /// Port for the dispatcher HTTP/WebSocket server.
    pub http_port: u16,
    /// How long a received message stays invisible (also the claim lease).
    pub visibility_timeout: Duration,
    /// Receives allowed before a message is dead-lettered.
    pub max_receive_count: u32,
    /// Transient step failures retried in place before the session fails.
    pub max_step_retries: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Upper bound on stepping-function invocations per claim.
    pub max_steps: u32,
    /// Sleep between queue polls when the queue is empty.
    pub poll_interval: Duration,
    /// Delivery loops per worker process.
    pub worker_concurrency: usize,
    /// Sessions older than this are forced to failed by the watchdog.
    pub max_session_age: Duration,
    /// Watchdog sweep interval.
    pub watchdog_interval: Duration,
    pub dead_letter_policy: DeadLetterPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/orchestrator.db"),
            http_port: 8080,
            visibility_timeout: Duration::from_secs(120),
            max_receive_count: 5,
            max_step_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            max_steps: 50,
            poll_interval: Duration::from_secs(1),
            worker_concurrency: 4,
            max_session_age: Duration::from_secs(900), // 15 minutes
            watchdog_interval: Duration::from_secs(60),
            dead_letter_policy: DeadLetterPolicy::Surface,
        }
    }
}

impl OrchestratorConfig {
    /// Build from `ORCH_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: std::env::var("ORCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env_parse("ORCH_HTTP_PORT", defaults.http_port)?,
            visibility_timeout: Duration::from_secs(env_parse(
                "ORCH_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )?),
            max_receive_count: env_parse("ORCH_MAX_RECEIVE_COUNT", defaults.max_receive_count)?,
            max_step_retries: env_parse("ORCH_MAX_STEP_RETRIES", defaults.max_step_retries)?,
            retry_base_delay: Duration::from_millis(env_parse(
                "ORCH_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            max_steps: env_parse("ORCH_MAX_STEPS", defaults.max_steps)?,
            poll_interval: Duration::from_millis(env_parse(
                "ORCH_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            worker_concurrency: env_parse(
                "ORCH_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            max_session_age: Duration::from_secs(env_parse(
                "ORCH_MAX_SESSION_AGE_SECS",
                defaults.max_session_age.as_secs(),
            )?),
            watchdog_interval: Duration::from_secs(env_parse(
                "ORCH_WATCHDOG_INTERVAL_SECS",
                defaults.watchdog_interval.as_secs(),
            )?),
            dead_letter_policy: env_parse("ORCH_DEAD_LETTER_POLICY", defaults.dead_letter_policy)?,
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_VISIBILITY_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_MAX_RECEIVE_COUNT".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_MAX_STEPS".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_POLL_INTERVAL_MS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_WATCHDOG_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_WORKER_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(self)
    }

    /// Heartbeat cadence: a third of the visibility window, so two renewals
    /// can be missed before the message reappears.
    pub fn renew_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(10))
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
