//! Reconciliation loop primitives.
//!
//! Helpers shared by every loop that converges actual state toward declared
//! state over a versioned object store:
//!
//! - [`BackoffPolicy`]: exponential backoff with jitter.
//! - [`RetryTracker`]: bounded retries of transient failures per resource.
//! - [`retry_on_conflict`]: read-modify-write under optimistic concurrency.
//! - [`wait_for`]: wait until a predicate over observed state holds.
//!
//! # Invariants
//!
//! - Every reconciliation pass is re-derived from observed state, so running
//!   the same pass twice without an external change issues no action.
//! - Conflicts are retried by re-reading, never by forcing a write.

mod backoff;
mod retry;
mod wait;

use std::time::Duration;

use thiserror::Error;

pub use backoff::BackoffPolicy;
pub use retry::{retry_on_conflict, ConflictRetry, Conflicting, RetryTracker};
pub use wait::{wait_for, WaitOptions};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A bounded wait expired before its condition held.
    #[error("timeout after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },
}

impl ReconcileError {
    /// Returns true if this error is an expired wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

/// Default retry limit per resource for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default number of attempts for a conflicting read-modify-write.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 8;
