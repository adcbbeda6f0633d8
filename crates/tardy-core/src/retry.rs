//! Retry decisions for failed jobs and failed store writes.
//!
//! Two separate questions, two separate answers:
//! - a job's handler failed: reschedule it or give up for good;
//! - the store failed while finalizing a job: try the write again or raise.
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    config::WorkerConfig,
    error::{BackendError, BackendErrorKind},
    job::JobInfo,
};

// Keeps `run_at` representable however large the attempt count gets.
pub(crate) const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Delay before a failed job becomes runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `attempts ^ exponent + offset_secs` seconds.
    Polynomial { exponent: u32, offset_secs: u64 },
    /// Same delay after every failure.
    Constant { secs: u64 },
    /// Runnable again right away.
    Immediate,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Polynomial {
            exponent: 4,
            offset_secs: 5,
        }
    }
}

impl Backoff {
    /// Delay after the `attempts`-th failure.
    pub fn delay(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Polynomial {
                exponent,
                offset_secs,
            } => {
                let secs = u64::from(attempts)
                    .saturating_pow(exponent)
                    .saturating_add(offset_secs);
                Duration::from_secs(secs)
            }
            Backoff::Constant { secs } => Duration::from_secs(secs),
            Backoff::Immediate => Duration::ZERO,
        }
    }
}

/// What to do with a job whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailureDecision {
    /// Store the new attempt count and run again at `run_at`.
    Reschedule { attempts: u32, run_at: SystemTime },
    /// Out of attempts; mark the job failed for good.
    Fail { attempts: u32 },
}

/// What to do with a store error raised while finalizing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorDecision {
    Retry,
    Raise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    transient_retry_limit: usize,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, transient_retry_limit: usize, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            transient_retry_limit,
            backoff,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.transient_retry_limit,
            config.backoff,
        )
    }

    /// Attempt ceiling for `job`, falling back to the policy default.
    pub fn max_attempts_for(&self, job: &JobInfo) -> u32 {
        job.max_attempts_or(self.max_attempts)
    }

    /// Decide the fate of `job` (state before this failure was counted).
    pub fn on_job_failure(&self, job: &JobInfo, now: SystemTime) -> JobFailureDecision {
        let attempts = job.attempts.saturating_add(1);
        if attempts >= self.max_attempts_for(job) {
            JobFailureDecision::Fail { attempts }
        } else {
            JobFailureDecision::Reschedule {
                attempts,
                run_at: now
                    .checked_add(self.backoff.delay(attempts).min(MAX_DELAY))
                    .unwrap_or(now),
            }
        }
    }

    /// `retries` is how many times the write has already been repeated.
    pub fn on_store_error(&self, retries: usize, error: &BackendError) -> StoreErrorDecision {
        match error.kind() {
            BackendErrorKind::Transient if retries < self.transient_retry_limit => {
                StoreErrorDecision::Retry
            }
            _ => StoreErrorDecision::Raise,
        }
    }
}
