//! Retry bookkeeping and circuit breaking.
//!
//! Attempts are tracked per *original* job id: a retried job carries a
//! chain of `-retry<N>` suffixes, and stripping every one of them yields
//! the key under which the whole chain is counted. The controller owns
//! only this transient bookkeeping plus the cancellation tokens of pending
//! retry timers; scheduling the actual resubmission is the worker's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::kernel::activity::Severity;
use crate::kernel::classifier::{classify, Classification, JobError};

/// Hard ceiling on total executions of one job chain. Not configurable.
pub const ABSOLUTE_MAX_ATTEMPTS: u32 = 5;

/// Attempts at which the approaching-limit warning starts firing.
const APPROACHING_LIMIT: u32 = 3;

lazy_static! {
    static ref RETRY_SUFFIX: Regex = Regex::new(r"-retry\d+").unwrap();
}

/// Strip every `-retry<N>` suffix, recovering the original job id.
pub fn original_id(job_id: &str) -> String {
    RETRY_SUFFIX.replace_all(job_id, "").into_owned()
}

/// Configured retry behaviour (the absolute cap is a constant on top).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct RetryRecord {
    attempts: u32,
    last_attempt: DateTime<Utc>,
    max_attempts: u32,
    base_delay: Duration,
}

/// An alert the worker should surface alongside a decision.
#[derive(Debug, Clone)]
pub struct RetryAlert {
    pub severity: Severity,
    pub reason: String,
    pub attempt: u32,
    /// True when the chain is over a cap and must stop.
    pub exhausted: bool,
}

/// Verdict for one handler failure.
#[derive(Debug)]
pub enum RetryDecision {
    /// Persist the failure as final; no retry.
    Terminal {
        classification: Classification,
        alert: Option<RetryAlert>,
    },
    /// Resubmit as `retry_id` after `delay`.
    Retry {
        classification: Classification,
        retry_id: String,
        attempt: u32,
        delay: Duration,
        alert: Option<RetryAlert>,
    },
}

/// Counters surfaced on `/api/status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetryMetrics {
    pub tracked_jobs: usize,
    pub total_attempts: u64,
    pub pending_retries: usize,
}

/// Per-original-id attempt tracking with an absolute circuit breaker.
pub struct RetryController {
    policy: RetryPolicy,
    records: Mutex<HashMap<String, RetryRecord>>,
    timers: Mutex<HashMap<String, HashMap<u64, CancellationToken>>>,
    next_timer_id: AtomicU64,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer_id: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide what happens after a handler failure.
    pub fn evaluate(&self, job_id: &str, error: &JobError) -> RetryDecision {
        let key = original_id(job_id);
        let classification = classify(error);

        if !classification.retryable {
            self.forget(&key);
            return RetryDecision::Terminal {
                classification,
                alert: None,
            };
        }

        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        let record = records.entry(key.clone()).or_insert_with(|| RetryRecord {
            attempts: 0,
            last_attempt: Utc::now(),
            max_attempts: self.policy.max_attempts,
            base_delay: classification.base_delay,
        });
        record.attempts += 1;
        record.last_attempt = Utc::now();
        let attempts = record.attempts;
        let base_delay = record.base_delay;
        let max_attempts = record.max_attempts;
        drop(records);

        if attempts >= ABSOLUTE_MAX_ATTEMPTS {
            self.forget(&key);
            return RetryDecision::Terminal {
                classification,
                alert: Some(RetryAlert {
                    severity: Severity::Error,
                    reason: format!("circuit breaker: {attempts} attempts, absolute cap reached"),
                    attempt: attempts,
                    exhausted: true,
                }),
            };
        }

        if attempts >= max_attempts {
            self.forget(&key);
            return RetryDecision::Terminal {
                classification,
                alert: Some(RetryAlert {
                    severity: Severity::Warning,
                    reason: format!("retry limit: {attempts} of {max_attempts} attempts used"),
                    attempt: attempts,
                    exhausted: true,
                }),
            };
        }

        let alert = (attempts >= APPROACHING_LIMIT).then(|| RetryAlert {
            severity: Severity::Warning,
            reason: format!("job approaching retry limit ({attempts} attempts)"),
            attempt: attempts,
            exhausted: false,
        });

        // base * 2^(attempts-1)
        let delay = base_delay.saturating_mul(1u32 << (attempts - 1).min(31));

        RetryDecision::Retry {
            classification,
            retry_id: format!("{key}-retry{attempts}"),
            attempt: attempts,
            delay,
            alert,
        }
    }

    /// Destroy the record for a chain (success, terminal failure, cancel).
    pub fn resolve(&self, job_id: &str) {
        self.forget(&original_id(job_id));
    }

    /// Track a pending retry timer so cancellation can reach it. Returns a
    /// handle to pass back to [`RetryController::timer_done`].
    pub fn register_timer(&self, job_id: &str, token: CancellationToken) -> u64 {
        let key = original_id(job_id);
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut timers) = self.timers.lock() {
            timers.entry(key).or_default().insert(timer_id, token);
        }
        timer_id
    }

    /// A timer fired or was dropped; forget its token.
    pub fn timer_done(&self, job_id: &str, timer_id: u64) {
        let key = original_id(job_id);
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(tokens) = timers.get_mut(&key) {
                tokens.remove(&timer_id);
                if tokens.is_empty() {
                    timers.remove(&key);
                }
            }
        }
    }

    /// Cancel every pending retry timer for a job chain.
    pub fn cancel_pending(&self, job_id: &str) {
        let key = original_id(job_id);
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(tokens) = timers.remove(&key) {
                for token in tokens.values() {
                    token.cancel();
                }
            }
        }
    }

    /// Cancel all pending timers (server shutdown).
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for tokens in timers.values() {
                for token in tokens.values() {
                    token.cancel();
                }
            }
            timers.clear();
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        let (tracked_jobs, total_attempts) = match self.records.lock() {
            Ok(records) => (
                records.len(),
                records.values().map(|r| r.attempts as u64).sum(),
            ),
            Err(_) => (0, 0),
        };
        let pending_retries = match self.timers.lock() {
            Ok(timers) => timers.values().map(HashMap::len).sum(),
            Err(_) => 0,
        };
        RetryMetrics {
            tracked_jobs,
            total_attempts,
            pending_retries,
        }
    }

    fn forget(&self, key: &str) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_attempts: u32, base_ms: u64) -> RetryController {
        RetryController::new(RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
        })
    }

    fn timeout_error() -> JobError {
        JobError::with_code("request timed out", "ETIMEDOUT")
    }

    #[test]
    fn suffix_stripping_recovers_the_original_id() {
        assert_eq!(original_id("j2"), "j2");
        assert_eq!(original_id("j2-retry1"), "j2");
        assert_eq!(original_id("j2-retry1-retry2"), "j2");
        assert_eq!(original_id("scan-retry3-retry4-retry5"), "scan");
        // Only the literal suffix is stripped.
        assert_eq!(original_id("retry-worker"), "retry-worker");
    }

    #[test]
    fn attempts_aggregate_across_the_chain() {
        let controller = controller(10, 5);

        let first = controller.evaluate("j2", &timeout_error());
        let RetryDecision::Retry {
            retry_id, attempt, delay, ..
        } = first
        else {
            panic!("expected retry");
        };
        assert_eq!(retry_id, "j2-retry1");
        assert_eq!(attempt, 1);
        assert_eq!(delay, Duration::from_millis(5));

        // Failure of the retry job counts under the same key.
        let second = controller.evaluate("j2-retry1", &timeout_error());
        let RetryDecision::Retry {
            retry_id, attempt, delay, ..
        } = second
        else {
            panic!("expected retry");
        };
        assert_eq!(retry_id, "j2-retry2");
        assert_eq!(attempt, 2);
        assert_eq!(delay, Duration::from_millis(10));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let controller = controller(10, 100);
        let mut id = "job".to_string();
        for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800)] {
            match controller.evaluate(&id, &timeout_error()) {
                RetryDecision::Retry { attempt: a, delay, retry_id, .. } => {
                    assert_eq!(a, attempt);
                    assert_eq!(delay, Duration::from_millis(expected_ms));
                    id = retry_id;
                }
                other => panic!("expected retry at attempt {attempt}, got {other:?}"),
            }
        }
    }

    #[test]
    fn non_retryable_short_circuits_without_a_record() {
        let controller = controller(5, 5);
        let decision = controller.evaluate("j1", &JobError::with_code("gone", "ENOENT"));
        assert!(matches!(decision, RetryDecision::Terminal { alert: None, .. }));
        assert_eq!(controller.metrics().tracked_jobs, 0);
    }

    #[test]
    fn configured_cap_stops_the_chain_with_a_warning() {
        let controller = controller(2, 5);
        assert!(matches!(
            controller.evaluate("j1", &timeout_error()),
            RetryDecision::Retry { .. }
        ));
        match controller.evaluate("j1-retry1", &timeout_error()) {
            RetryDecision::Terminal { alert: Some(alert), .. } => {
                assert_eq!(alert.severity, Severity::Warning);
                assert!(alert.exhausted);
                assert_eq!(alert.attempt, 2);
            }
            other => panic!("expected terminal, got {other:?}"),
        }
        assert_eq!(controller.metrics().tracked_jobs, 0);
    }

    #[test]
    fn absolute_cap_holds_regardless_of_configured_cap() {
        let controller = controller(10, 5);
        let mut id = "j1".to_string();
        let mut executions = 1u32;
        loop {
            match controller.evaluate(&id, &timeout_error()) {
                RetryDecision::Retry { retry_id, .. } => {
                    id = retry_id;
                    executions += 1;
                    assert!(executions <= ABSOLUTE_MAX_ATTEMPTS, "ran past the breaker");
                }
                RetryDecision::Terminal { alert: Some(alert), .. } => {
                    assert_eq!(alert.severity, Severity::Error);
                    assert!(alert.exhausted);
                    break;
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
        assert_eq!(executions, ABSOLUTE_MAX_ATTEMPTS);
    }

    #[test]
    fn approaching_limit_warns_without_aborting() {
        let controller = controller(10, 5);
        controller.evaluate("j1", &timeout_error());
        controller.evaluate("j1-retry1", &timeout_error());
        match controller.evaluate("j1-retry2", &timeout_error()) {
            RetryDecision::Retry { alert: Some(alert), .. } => {
                assert_eq!(alert.severity, Severity::Warning);
                assert!(!alert.exhausted);
                assert_eq!(alert.attempt, 3);
            }
            other => panic!("expected retry with alert, got {other:?}"),
        }
    }

    #[test]
    fn resolve_destroys_the_record() {
        let controller = controller(10, 5);
        controller.evaluate("j1", &timeout_error());
        assert_eq!(controller.metrics().tracked_jobs, 1);

        controller.resolve("j1-retry1");
        assert_eq!(controller.metrics().tracked_jobs, 0);

        // A later failure starts counting from scratch.
        match controller.evaluate("j1", &timeout_error()) {
            RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn cancel_pending_fires_registered_tokens() {
        let controller = controller(10, 5);
        let token = CancellationToken::new();
        controller.register_timer("j1-retry1", token.clone());
        assert_eq!(controller.metrics().pending_retries, 1);

        controller.cancel_pending("j1");
        assert!(token.is_cancelled());
        assert_eq!(controller.metrics().pending_retries, 0);
    }

    #[test]
    fn shutdown_cancels_every_timer() {
        let controller = controller(10, 5);
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        controller.register_timer("j1", a.clone());
        controller.register_timer("j2", b.clone());

        controller.shutdown();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
