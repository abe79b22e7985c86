//! Instance handler.
//!
//! Drives every Instance through its phases from runtime observations:
//! - Pending: take the finalizer, begin scheduling
//! - Scheduling: pick a host
//! - Scheduled: start the process, retrying transient failures
//! - Running / Unknown: observe the process and fold guest state in
//! - terminating: stop the process, then release the finalizer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use vmctl_model::{
    ApiError, Instance, InstanceStatus, Phase, Resource, TerminationReason, INSTANCE_FINALIZER,
};
use vmctl_reconcile::{ConflictRetry, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use crate::cluster::Cluster;
use crate::error::ControllerError;
use crate::runtime::{InstanceRuntime, ProcessState, RuntimeError};
use crate::tracker::{self, TransitionError};
use crate::worker::{PassStats, Reconcile};

/// Instance handler configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Transient start failures tolerated before the instance fails.
    pub start_retries: u32,

    /// Window over which start failures are counted.
    pub retry_window: Duration,

    pub conflict_retry: ConflictRetry,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            start_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Converges each Instance's phase with its runtime process.
pub struct InstanceHandler {
    cluster: Arc<Cluster>,
    runtime: Arc<dyn InstanceRuntime>,
    config: HandlerConfig,
    start_failures: RetryTracker,
}

impl InstanceHandler {
    pub fn new(cluster: Arc<Cluster>, runtime: Arc<dyn InstanceRuntime>, config: HandlerConfig) -> Self {
        let start_failures = RetryTracker::new(config.start_retries, config.retry_window);
        Self {
            cluster,
            runtime,
            config,
            start_failures,
        }
    }

    /// Run one step for one instance. Returns whether anything was written.
    pub async fn reconcile_instance(&mut self, instance: &Instance) -> Result<bool, ControllerError> {
        if instance.meta.is_terminating() {
            return self.finalize(instance).await;
        }

        match instance.phase() {
            Phase::Pending => self.admit(instance).await,
            Phase::Scheduling => self.place(instance).await,
            Phase::Scheduled => self.start(instance).await,
            Phase::Running | Phase::Unknown => self.observe(instance).await,
            Phase::Succeeded | Phase::Failed => Ok(false),
        }
    }

    /// Persist a tracker step against the current version of `instance`.
    /// Fails if the instance was replaced under the same name.
    async fn write_status<F>(&self, instance: &Instance, step: F) -> Result<bool, ControllerError>
    where
        F: Fn(&mut InstanceStatus) -> Result<bool, TransitionError> + Sync,
    {
        let uid = instance.meta.uid;
        let written = self
            .cluster
            .instances
            .patch_status(&instance.key(), &self.config.conflict_retry, |current| {
                if current.meta.uid != uid {
                    return Err(ApiError::conflict("instance was replaced").into());
                }
                Ok(step(&mut current.status).map_err(ApiError::from)?)
            })
            .await?;
        Ok(written.meta.resource_version != instance.meta.resource_version)
    }

    async fn terminate(
        &self,
        instance: &Instance,
        reason: TerminationReason,
        message: String,
    ) -> Result<bool, ControllerError> {
        info!(
            instance = %instance.key(),
            instance_uid = %instance.meta.uid,
            reason = ?reason,
            message = %message,
            "Instance terminated"
        );
        let now = Utc::now();
        self.write_status(instance, |status| {
            tracker::terminate(status, reason, message.clone(), now)
        })
        .await
    }

    async fn admit(&self, instance: &Instance) -> Result<bool, ControllerError> {
        self.cluster
            .instances
            .add_finalizer(&instance.key(), INSTANCE_FINALIZER)
            .await?;
        let now = Utc::now();
        self.write_status(instance, |status| tracker::begin_scheduling(status, now))
            .await
    }

    /// Least loaded available host, ties broken by name.
    async fn pick_node(&self) -> Option<String> {
        let mut load: HashMap<String, usize> = HashMap::new();
        for other in self.cluster.instances.list(None).await {
            if other.phase().is_terminal() {
                continue;
            }
            if let Some(node) = other.status.node_name {
                *load.entry(node).or_default() += 1;
            }
        }

        let mut best: Option<(usize, &String)> = None;
        for node in self.cluster.nodes() {
            if !self.runtime.is_node_available(node).await {
                continue;
            }
            let count = load.get(node).copied().unwrap_or(0);
            if best.is_none_or(|(c, _)| count < c) {
                best = Some((count, node));
            }
        }
        best.map(|(_, node)| node.clone())
    }

    async fn place(&self, instance: &Instance) -> Result<bool, ControllerError> {
        let Some(node) = self.pick_node().await else {
            warn!(instance = %instance.key(), "No available node, instance stays unscheduled");
            return Ok(false);
        };
        debug!(instance = %instance.key(), node = %node, "Scheduled instance");
        let now = Utc::now();
        self.write_status(instance, |status| tracker::schedule(status, &node, now))
            .await
    }

    async fn start(&mut self, instance: &Instance) -> Result<bool, ControllerError> {
        let uid = instance.meta.uid;
        let retry_key = uid.to_string();
        let Some(node) = instance.status.node_name.clone() else {
            return self
                .terminate(instance, TerminationReason::StartFailure, "scheduled without a node".to_string())
                .await;
        };

        match self.runtime.start(uid, &node, &instance.spec.template).await {
            Ok(()) => {
                self.start_failures.clear(&retry_key);
                let agent_connected = match self.runtime.observe(uid).await {
                    Ok(observation) => observation.agent_connected,
                    Err(_) => false,
                };
                info!(instance = %instance.key(), instance_uid = %uid, node = %node, "Instance running");
                let now = Utc::now();
                let template = &instance.spec.template;
                self.write_status(instance, |status| {
                    tracker::mark_running(status, template, agent_connected, now)
                })
                .await
            }
            Err(RuntimeError::Transient(msg)) => {
                let exhausted = self.start_failures.record_failure(&retry_key);
                let failures = self.start_failures.failures(&retry_key);
                if exhausted {
                    self.start_failures.clear(&retry_key);
                    return self
                        .terminate(
                            instance,
                            TerminationReason::StartFailure,
                            format!("start failed {failures} times: {msg}"),
                        )
                        .await;
                }
                warn!(
                    instance = %instance.key(),
                    attempt = failures,
                    error = %msg,
                    "Instance start failed, will retry"
                );
                Ok(false)
            }
            Err(e) => {
                self.terminate(instance, TerminationReason::StartFailure, e.to_string())
                    .await
            }
        }
    }

    async fn observe(&self, instance: &Instance) -> Result<bool, ControllerError> {
        let uid = instance.meta.uid;
        let now = Utc::now();

        let mut observation = match self.runtime.observe(uid).await {
            Ok(observation) => observation,
            Err(RuntimeError::NotFound(_)) => {
                return self
                    .terminate(
                        instance,
                        TerminationReason::ProcessLost,
                        "instance process disappeared".to_string(),
                    )
                    .await;
            }
            Err(RuntimeError::Transient(msg)) => {
                warn!(instance = %instance.key(), error = %msg, "Instance state unknown");
                return self
                    .write_status(instance, |status| tracker::mark_unknown(status, now))
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        match observation.state {
            ProcessState::Running => {}
            ProcessState::GuestShutdown => {
                return self
                    .terminate(instance, TerminationReason::GuestShutdown, "guest shut down".to_string())
                    .await;
            }
            ProcessState::GuestCrashed => {
                return self
                    .terminate(instance, TerminationReason::GuestCrash, "guest crashed".to_string())
                    .await;
            }
            ProcessState::NodeLost => {
                let message = format!("host {} not responding", observation.node);
                return self
                    .terminate(instance, TerminationReason::NodeLost, message)
                    .await;
            }
        }

        if tracker::freeze_expired(&instance.status, now) {
            match self.runtime.unfreeze(uid).await {
                Ok(()) => {
                    info!(instance = %instance.key(), "Unfreeze timeout reached, filesystems thawed");
                    observation.frozen = false;
                }
                Err(e) => warn!(instance = %instance.key(), error = %e, "Automatic unfreeze failed"),
            }
        }

        // The migration coordinator owns node placement while a transfer runs.
        let migrating = instance.status.active_migration().is_some();
        self.write_status(instance, |status| {
            let mut changed = false;
            if status.phase == Phase::Unknown {
                changed |= tracker::recover(status, now)?;
            }
            changed |= tracker::apply_observation(status, &observation)?;
            if !migrating && status.node_name.as_deref() != Some(observation.node.as_str()) {
                status.node_name = Some(observation.node.clone());
                changed = true;
            }
            Ok(changed)
        })
        .await
    }

    async fn finalize(&mut self, instance: &Instance) -> Result<bool, ControllerError> {
        if !instance.meta.has_finalizer(INSTANCE_FINALIZER) {
            return Ok(false);
        }
        let uid = instance.meta.uid;
        let grace = Duration::from_secs(
            instance
                .meta
                .deletion_grace_period_secs
                .unwrap_or(instance.spec.template.termination_grace_period_secs),
        );

        if instance.status.active_migration().is_some() {
            if let Err(e) = self.runtime.abort_migration(uid).await {
                debug!(instance = %instance.key(), error = %e, "No transfer to abort");
            }
        }
        self.runtime.stop(uid, grace).await?;

        if !instance.phase().is_terminal() {
            self.terminate(instance, TerminationReason::Deleted, "instance deleted".to_string())
                .await?;
        }
        self.start_failures.clear(&uid.to_string());
        self.cluster
            .instances
            .remove_finalizer(&instance.key(), INSTANCE_FINALIZER)
            .await?;
        info!(
            instance = %instance.key(),
            instance_uid = %uid,
            grace_secs = grace.as_secs(),
            "Instance stopped and released"
        );
        Ok(true)
    }
}

#[async_trait]
impl Reconcile for InstanceHandler {
    fn name(&self) -> &'static str {
        "instance-handler"
    }

    async fn reconcile_all(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        for instance in self.cluster.instances.list(None).await {
            stats.objects += 1;
            match self.reconcile_instance(&instance).await {
                Ok(true) => stats.actions += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(instance = %instance.key(), error = %e, "Instance step failed");
                }
            }
        }
        self.start_failures.prune();
        stats
    }
}
