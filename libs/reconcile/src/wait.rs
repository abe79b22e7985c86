//! Bounded waits for eventual state.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::ReconcileError;

/// Bounds for a wait.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Give up after this long.
    pub timeout: Duration,

    /// Re-check at least this often, even without a change notification.
    pub poll_interval: Duration,
}

impl WaitOptions {
    /// Wait up to `timeout`, re-checking every 50ms.
    pub fn within(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Override the poll interval.
    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::within(Duration::from_secs(30))
    }
}

/// Wait until `condition` yields a value.
///
/// The condition is evaluated immediately, then again whenever `changes` reports
/// a new revision or the poll interval elapses, whichever comes first. If the
/// notifier is closed the wait degrades to plain polling. Exceeding the
/// timeout is reported as [`ReconcileError::Timeout`] naming `what`.
pub async fn wait_for<T, F, Fut>(
    what: &str,
    opts: &WaitOptions,
    mut changes: Option<watch::Receiver<u64>>,
    mut condition: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let deadline = start + opts.timeout;

    loop {
        if let Some(value) = condition().await {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::Timeout {
                what: what.to_string(),
                elapsed: now.duration_since(start),
            });
        }

        let wake_at = deadline.min(now + opts.poll_interval);
        let mut closed = false;
        match changes.as_mut() {
            Some(rx) => {
                tokio::select! {
                    res = rx.changed() => closed = res.is_err(),
                    _ = tokio::time::sleep_until(wake_at) => {}
                }
            }
            None => tokio::time::sleep_until(wake_at).await,
        }
        if closed {
            changes = None;
        }
    }
}
