//! Retry helpers: transient-failure tracking and conflict retries.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::BackoffPolicy;

/// Errors that can signal an optimistic-concurrency conflict.
pub trait Conflicting {
    /// Returns true if the write lost a race and should be retried after
    /// re-reading.
    fn is_conflict(&self) -> bool;
}

/// Bounds for [`retry_on_conflict`].
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_CONFLICT_ATTEMPTS,
            backoff: BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(500),
                jitter: 0.5,
            },
        }
    }
}

/// Run a read-modify-write operation, retrying while it reports a conflict.
///
/// `op` must re-read the object on every invocation; the helper only decides
/// whether and when to call it again. Non-conflict errors and the conflict of
/// the final attempt are returned to the caller unchanged.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &ConflictRetry, mut op: F) -> Result<T, E>
where
    E: Conflicting,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Write conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Number of failures recorded in the current window.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures
            .get(resource_key)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}
