//! Retry and backoff policy for failed dispatches.
//!
//! ## Classification
//!
//! | Signal                                               | Kind          |
//! |------------------------------------------------------|---------------|
//! | exit 75, or output mentions a rate or usage limit    | `RateLimited` |
//! | exit 64, 78, 126 or 127                              | `Fatal`       |
//! | any other non-zero exit, a signal, or unusable output | `Retryable`   |
//!
//! Rate limits park the pipeline without consuming an attempt. Retryable
//! failures get `base * 2^(attempt - 1)` seconds of backoff, capped, until
//! `max_retries` attempts are spent. The decision is a function of the
//! persisted retry history alone; the caller honours the delay.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

static RATE_LIMIT_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rate[- ]limit(ed)?|429 too many requests|usage limit reached)\b").unwrap()
});

/// `EX_TEMPFAIL`, used by agent wrappers to report throttling.
pub const EXIT_RATE_LIMITED: i32 = 75;

const FATAL_EXIT_CODES: &[(i32, &str)] = &[
    (64, "usage error"),
    (78, "configuration error"),
    (126, "command not executable"),
    (127, "command not found"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_backoff_secs: 30,
            max_backoff_secs: 600,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    #[must_use]
    pub fn with_base_backoff_secs(mut self, secs: u64) -> Self {
        self.base_backoff_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_backoff_secs(mut self, secs: u64) -> Self {
        self.max_backoff_secs = secs;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

/// One retry granted to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub step: String,
    /// 1-based, strictly increasing per step.
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub backoff_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    RateLimited,
    Fatal,
}

/// Classify a failed dispatch. `exit_code` is `None` when the job was killed
/// by a signal; `Some(0)` means the job exited cleanly but its output was
/// unusable.
pub fn classify(exit_code: Option<i32>, output: &str) -> FailureKind {
    if exit_code == Some(EXIT_RATE_LIMITED) || RATE_LIMIT_TEXT.is_match(output) {
        return FailureKind::RateLimited;
    }
    if let Some(code) = exit_code
        && FATAL_EXIT_CODES.iter().any(|(c, _)| *c == code)
    {
        return FailureKind::Fatal;
    }
    FailureKind::Retryable
}

/// Human-readable description of an exit status.
pub fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        None => "terminated by signal".to_string(),
        Some(0) => "exited 0 with unusable output".to_string(),
        Some(code) => match FATAL_EXIT_CODES.iter().find(|(c, _)| *c == code) {
            Some((_, name)) => format!("exit code {} ({})", code, name),
            None => format!("exit code {}", code),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Append `record` and redispatch after `backoff`.
    Retry { record: RetryRecord, backoff: Duration },
    /// Retryable, but the attempt budget is spent (or retries are off).
    Exhausted { attempts: u32 },
    /// Park the pipeline; no attempt consumed.
    RateLimited,
    Fatal { reason: String },
}

/// Number of retries already granted to `step`.
pub fn attempts_for(history: &[RetryRecord], step: &str) -> u32 {
    history
        .iter()
        .filter(|r| r.step == step)
        .map(|r| r.attempt)
        .max()
        .unwrap_or(0)
}

/// Decide what to do about a failed dispatch of `step`.
pub fn decide(
    config: &RetryConfig,
    history: &[RetryRecord],
    step: &str,
    kind: FailureKind,
    exit_code: Option<i32>,
) -> RetryDecision {
    match kind {
        FailureKind::RateLimited => RetryDecision::RateLimited,
        FailureKind::Fatal => RetryDecision::Fatal {
            reason: format!("step '{}' failed fatally: {}", step, describe_exit(exit_code)),
        },
        FailureKind::Retryable => {
            let attempts = attempts_for(history, step);
            if !config.enabled || attempts >= config.max_retries {
                return RetryDecision::Exhausted { attempts };
            }
            let attempt = attempts + 1;
            let backoff = config.backoff_for(attempt);
            RetryDecision::Retry {
                record: RetryRecord {
                    step: step.to_string(),
                    attempt,
                    exit_code,
                    backoff_secs: backoff.as_secs(),
                    timestamp: Utc::now(),
                },
                backoff,
            }
        }
    }
}

/// Check that attempt numbers per step run 1, 2, 3, ... in record order.
pub fn check_history(history: &[RetryRecord]) -> Result<(), String> {
    let mut last: HashMap<&str, u32> = HashMap::new();
    for record in history {
        let expected = last.get(record.step.as_str()).copied().unwrap_or(0) + 1;
        if record.attempt != expected {
            return Err(format!(
                "retry record for step '{}' has attempt {} (expected {})",
                record.step, record.attempt, expected
            ));
        }
        last.insert(&record.step, record.attempt);
    }
    Ok(())
}
