//! Background worker that drives a control loop.
//!
//! A pass runs on every interval tick and whenever the object store reports
//! a write, so loops react to each other's output without waiting for the
//! next tick. Passes are idempotent; a pass triggered by a loop's own write
//! finds nothing left to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::cluster::Cluster;
use crate::config::LoopConfig;
use crate::handler::InstanceHandler;
use crate::migration::MigrationCoordinator;
use crate::reconciler::RunPolicyController;
use crate::runtime::InstanceRuntime;

/// Counters reported by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Objects examined.
    pub objects: usize,
    /// Objects for which a corrective action was taken.
    pub actions: usize,
    /// Objects whose step failed; retried on the next pass.
    pub errors: usize,
}

/// A control loop body.
#[async_trait]
pub trait Reconcile: Send {
    /// Loop name used in logs.
    fn name(&self) -> &'static str;

    /// Examine every object once. Per-object failures are logged and
    /// counted, never propagated.
    async fn reconcile_all(&mut self) -> PassStats;
}

/// Runs a [`Reconcile`] until shutdown is signaled.
pub struct Worker<R> {
    reconciler: R,
    interval: Duration,
    changes: watch::Receiver<u64>,
}

impl<R: Reconcile> Worker<R> {
    pub fn new(reconciler: R, interval: Duration, changes: watch::Receiver<u64>) -> Self {
        Self {
            reconciler,
            interval,
            changes,
        }
    }

    #[instrument(skip_all, fields(worker = self.reconciler.name()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = self.changes.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Store notifier closed, polling only");
                        watching = false;
                        continue;
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Worker shutting down");
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                info!("Worker shutting down");
                break;
            }

            let stats = self.reconciler.reconcile_all().await;
            if stats.actions > 0 || stats.errors > 0 {
                debug!(
                    objects = stats.objects,
                    actions = stats.actions,
                    errors = stats.errors,
                    "Pass complete"
                );
            }
        }
    }
}

/// Spawn the reconciler, the instance handler and the migration
/// coordinator. Each stops when `shutdown` turns true.
pub fn spawn_control_loops(
    cluster: Arc<Cluster>,
    runtime: Arc<dyn InstanceRuntime>,
    config: &LoopConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let reconciler = RunPolicyController::new(cluster.clone(), config.reconciler.clone());
    let handler = InstanceHandler::new(cluster.clone(), runtime.clone(), config.handler.clone());
    let coordinator = MigrationCoordinator::new(cluster.clone(), runtime, config.coordinator.clone());

    vec![
        tokio::spawn(Worker::new(reconciler, config.interval, cluster.changes()).run(shutdown.clone())),
        tokio::spawn(Worker::new(handler, config.interval, cluster.changes()).run(shutdown.clone())),
        tokio::spawn(Worker::new(coordinator, config.interval, cluster.changes()).run(shutdown)),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reconcile for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile_all(&mut self) -> PassStats {
            self.0.fetch_add(1, Ordering::SeqCst);
            PassStats::default()
        }
    }

    #[tokio::test]
    async fn test_store_change_triggers_pass() {
        let passes = Arc::new(AtomicUsize::new(0));
        let (changes_tx, changes_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker::new(
            Counting(passes.clone()),
            Duration::from_secs(3600),
            changes_rx,
        );
        let handle = tokio::spawn(worker.run(shutdown_rx));

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_first = passes.load(Ordering::SeqCst);
        assert!(after_first >= 1);

        changes_tx.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(passes.load(Ordering::SeqCst) > after_first);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
