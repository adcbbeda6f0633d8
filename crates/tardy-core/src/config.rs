//! Worker configuration.
//!
//! A worker copies its [`WorkerConfig`] when it is built and never looks at
//! shared state again, so changing the process-wide default only affects
//! workers built afterwards.
use std::{
    sync::{
        LazyLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::retry::Backoff;

static GLOBAL_DEFAULT: LazyLock<RwLock<WorkerConfig>> =
    LazyLock::new(|| RwLock::new(WorkerConfig::default()));

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Tunables of a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs requested from the backend per poll.
    pub read_ahead: usize,
    /// Attempt ceiling for jobs that do not carry their own.
    pub max_attempts: u32,
    /// Stop the first time a poll comes back empty.
    pub exit_on_complete: bool,
    /// Pause between empty polls.
    #[serde(rename = "sleep_delay_ms", with = "duration_millis")]
    pub sleep_delay: Duration,
    /// Consecutive `reserve` failures that end the run.
    pub max_backend_failures: usize,
    /// Extra attempts for a transient store error while finalizing a job.
    pub transient_retry_limit: usize,
    /// Claimed jobs run at the same time.
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Lock owner name. Defaults to `host:<hostname> pid:<pid> worker:<n>`,
    /// unique per worker in the process.
    pub name: Option<String>,
    /// Level of the per-job lifecycle log lines.
    #[serde(with = "level_str")]
    pub log_level: tracing::Level,
    pub backoff: Backoff,
}

impl WorkerConfig {
    pub const DEFAULT_READ_AHEAD: usize = 5;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;
    pub const DEFAULT_SLEEP_DELAY: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_BACKEND_FAILURES: usize = 10;
    pub const DEFAULT_TRANSIENT_RETRY_LIMIT: usize = 3;

    /// Snapshot of the process-wide default.
    pub fn global() -> WorkerConfig {
        GLOBAL_DEFAULT.read().clone()
    }

    /// Replace the process-wide default used by [`WorkerBuilder::new`].
    ///
    /// [`WorkerBuilder::new`]: crate::WorkerBuilder::new
    pub fn set_global(config: WorkerConfig) {
        *GLOBAL_DEFAULT.write() = config;
    }

    /// Restore the built-in process-wide default.
    pub fn reset_global() {
        Self::set_global(WorkerConfig::default());
    }

    pub(crate) fn worker_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => default_worker_name(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_ahead: Self::DEFAULT_READ_AHEAD,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            exit_on_complete: false,
            sleep_delay: Self::DEFAULT_SLEEP_DELAY,
            max_backend_failures: Self::DEFAULT_MAX_BACKEND_FAILURES,
            transient_retry_limit: Self::DEFAULT_TRANSIENT_RETRY_LIMIT,
            concurrency: 1,
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
            name: None,
            log_level: tracing::Level::INFO,
            backoff: Backoff::default(),
        }
    }
}

fn default_worker_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_owned());
    let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("host:{host} pid:{} worker:{seq}", std::process::id())
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod level_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(level: &tracing::Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.read_ahead, 5);
        assert_eq!(config.max_attempts, 25);
        assert!(!config.exit_on_complete);
        assert_eq!(config.sleep_delay, Duration::from_secs(5));
        assert_eq!(config.max_backend_failures, 10);
        assert_eq!(config.transient_retry_limit, 3);
        assert_eq!(config.log_level, tracing::Level::INFO);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{
                "read_ahead": 15,
                "exit_on_complete": true,
                "sleep_delay_ms": 250,
                "queues": ["mail"],
                "log_level": "debug",
                "backoff": { "kind": "constant", "secs": 30 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.read_ahead, 15);
        assert!(config.exit_on_complete);
        assert_eq!(config.sleep_delay, Duration::from_millis(250));
        assert_eq!(config.queues, vec!["mail".to_owned()]);
        assert_eq!(config.log_level, tracing::Level::DEBUG);
        assert_eq!(config.backoff, Backoff::Constant { secs: 30 });
        assert_eq!(config.max_attempts, 25);
    }

    #[test]
    fn rejects_unknown_log_level() {
        let result = serde_json::from_str::<WorkerConfig>(r#"{ "log_level": "loud" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn explicit_name_wins() {
        let config = WorkerConfig {
            name: Some("reports-1".to_owned()),
            ..WorkerConfig::default()
        };
        assert_eq!(config.worker_name(), "reports-1");

        let generated = WorkerConfig::default().worker_name();
        assert!(generated.starts_with("host:"));
        assert!(generated.contains(&format!("pid:{}", std::process::id())));
        assert!(generated.contains(" worker:"));
    }

    #[test]
    fn generated_names_are_unique() {
        let first = WorkerConfig::default().worker_name();
        let second = WorkerConfig::default().worker_name();
        assert_ne!(first, second);
    }
}
