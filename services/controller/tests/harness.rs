//! Test harness for controller integration tests.
//!
//! Runs the three control loops against an in-memory cluster and the
//! simulated runtime, with short intervals so scenarios settle quickly.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vmctl_controller::actions::Actions;
use vmctl_controller::cluster::Cluster;
use vmctl_controller::config::LoopConfig;
use vmctl_controller::migration::CoordinatorConfig;
use vmctl_controller::reconciler::ReconcilerConfig;
use vmctl_controller::runtime::SimulatedRuntime;
use vmctl_controller::worker::spawn_control_loops;
use vmctl_model::{Instance, InstanceTemplate, ObjectKey, Phase, RunMode, RunPolicy};
use vmctl_reconcile::{wait_for, BackoffPolicy, WaitOptions};

pub const NAMESPACE: &str = "default";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("vmctl_controller=debug")
        .with_test_writer()
        .try_init();
}

pub fn fast_loops() -> LoopConfig {
    loops_every(Duration::from_millis(20))
}

/// Loops ticking every `interval`, with a short crash-loop backoff.
pub fn loops_every(interval: Duration) -> LoopConfig {
    LoopConfig {
        interval,
        reconciler: ReconcilerConfig {
            crash_loop_backoff: BackoffPolicy::fixed_exponential(
                Duration::from_millis(10),
                Duration::from_millis(200),
            ),
            ..ReconcilerConfig::default()
        },
        coordinator: CoordinatorConfig {
            progress_poll_interval: interval,
            ..CoordinatorConfig::default()
        },
        ..LoopConfig::default()
    }
}

pub fn settle_within() -> WaitOptions {
    WaitOptions::within(Duration::from_secs(10)).poll_every(Duration::from_millis(20))
}

pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub runtime: Arc<SimulatedRuntime>,
    pub actions: Actions,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestCluster {
    pub fn spawn() -> Self {
        Self::spawn_with(fast_loops())
    }

    pub fn spawn_with(loops: LoopConfig) -> Self {
        init_tracing();
        let cluster = Arc::new(Cluster::new(["node-a", "node-b"]));
        let runtime = Arc::new(SimulatedRuntime::new());
        let actions = Actions::new(cluster.clone(), runtime.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_control_loops(cluster.clone(), runtime.clone(), &loops, shutdown_rx);
        Self {
            cluster,
            runtime,
            actions,
            shutdown_tx,
            handles,
        }
    }

    pub async fn create_policy(&self, name: &str, mode: RunMode) -> ObjectKey {
        self.create_policy_with(name, mode, InstanceTemplate::default())
            .await
    }

    pub async fn create_policy_with(
        &self,
        name: &str,
        mode: RunMode,
        template: InstanceTemplate,
    ) -> ObjectKey {
        let policy = RunPolicy::new(NAMESPACE, name, mode).with_template(template);
        self.actions.create_policy(policy).await.unwrap();
        ObjectKey::new(NAMESPACE, name)
    }

    pub async fn wait_running(&self, key: &ObjectKey) -> Instance {
        self.actions
            .wait_for_phase(key, Phase::Running, &settle_within())
            .await
            .unwrap()
    }

    /// Wait until `condition` yields a value, failing the test on timeout.
    pub async fn wait_until<T, F, Fut>(&self, what: &str, condition: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        wait_for(what, &settle_within(), Some(self.cluster.changes()), condition)
            .await
            .unwrap()
    }

    /// Wait for a running instance under `key` whose uid differs from `old`.
    pub async fn wait_replaced(&self, key: &ObjectKey, old: &Instance) -> Instance {
        let old_uid = old.meta.uid;
        self.wait_until("replacement instance to run", || async move {
            self.cluster
                .instances
                .find(key)
                .await
                .filter(|i| i.meta.uid != old_uid && i.is_running())
        })
        .await
    }

    pub async fn policy(&self, key: &ObjectKey) -> RunPolicy {
        self.actions.get_policy(key).await.unwrap()
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
