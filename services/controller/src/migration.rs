//! Migration coordinator.
//!
//! Drives each MigrationRequest through its phases and projects the attempt
//! onto the target Instance as a [`MigrationState`]:
//! - Pending: pick a target host, attach a fresh MigrationState
//! - Scheduling: prepare the target, start the transfer
//! - Running: poll progress, switch over on convergence, abort on timeout
//!
//! A MigrationState whose request has been deleted is cancelled: the
//! transfer is aborted and the instance stays on its source host.
//!
//! The coordinator is the only writer of `migration_state`, and the only
//! writer of `node_name` while a transfer is in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use vmctl_id::MigrationUid;
use vmctl_model::{
    validation, AbortStatus, ApiError, Instance, InstanceStatus, MigrationPhase, MigrationProgress,
    MigrationRequest, MigrationState, ObjectKey, Phase, Resource, GIB,
};
use vmctl_reconcile::{
    ConflictRetry, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RECONCILE_INTERVAL,
    DEFAULT_RETRY_WINDOW,
};

use crate::cluster::Cluster;
use crate::error::ControllerError;
use crate::runtime::{InstanceRuntime, RuntimeError, TransferProgress};
use crate::worker::{PassStats, Reconcile};

/// Default allowed time without transfer progress.
pub const DEFAULT_PROGRESS_TIMEOUT: Duration = Duration::from_secs(150);

/// Default allowed total duration per GiB of guest memory.
pub const DEFAULT_COMPLETION_TIMEOUT_PER_GIB: Duration = Duration::from_secs(800);

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub progress_timeout: Duration,
    pub completion_timeout_per_gib: Duration,
    /// Minimum spacing between progress polls of one transfer. Passes in
    /// between leave a running request untouched.
    pub progress_poll_interval: Duration,
    /// Transient runtime failures tolerated per request before it fails.
    pub transient_retries: u32,
    pub conflict_retry: ConflictRetry,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            progress_timeout: DEFAULT_PROGRESS_TIMEOUT,
            completion_timeout_per_gib: DEFAULT_COMPLETION_TIMEOUT_PER_GIB,
            progress_poll_interval: DEFAULT_RECONCILE_INTERVAL,
            transient_retries: DEFAULT_MAX_RETRIES,
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Effective timeouts for one migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub progress_timeout: Duration,
    pub completion_timeout: Duration,
}

impl CoordinatorConfig {
    /// Timeouts for `request` against a guest of `memory_bytes`. Request
    /// overrides win over the coordinator defaults.
    pub fn limits(&self, request: &MigrationRequest, memory_bytes: u64) -> Limits {
        let config = request.spec.config.unwrap_or_default();
        let progress_timeout = config
            .progress_timeout_secs
            .map_or(self.progress_timeout, Duration::from_secs);
        let per_gib = config
            .completion_timeout_per_gib_secs
            .map_or(self.completion_timeout_per_gib, Duration::from_secs);
        let gib = memory_bytes.div_ceil(GIB).max(1);
        let completion_timeout = per_gib.saturating_mul(u32::try_from(gib).unwrap_or(u32::MAX));

        Limits {
            progress_timeout,
            completion_timeout,
        }
    }
}

/// Outcome of one progress evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Source and target converged; switch over.
    Complete,
    /// Abort the transfer for the given reason.
    Abort(String),
}

fn elapsed_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Fold `observed` into the state's progress counters and decide whether
/// the transfer continues, completes or has timed out.
///
/// Progress is any increase of processed bytes or decrease of remaining
/// bytes since the previous observation.
pub fn evaluate_progress(
    state: &mut MigrationState,
    observed: &TransferProgress,
    limits: &Limits,
    now: DateTime<Utc>,
) -> Verdict {
    let started = state.start_timestamp.unwrap_or(now);
    let progress = &mut state.progress;

    let advanced = observed.data_processed_bytes > progress.data_processed_bytes
        || observed.data_remaining_bytes < progress.data_remaining_bytes;
    if advanced {
        progress.last_progress_timestamp = Some(now);
    } else if progress.last_progress_timestamp.is_none() {
        progress.last_progress_timestamp = Some(started);
    }
    progress.data_processed_bytes = observed.data_processed_bytes;
    progress.data_remaining_bytes = observed.data_remaining_bytes;
    progress.bytes_per_second = observed.bytes_per_second;

    let stalled_for = elapsed_between(progress.last_progress_timestamp.unwrap_or(started), now);
    progress.elapsed_without_progress_secs = stalled_for.as_secs();

    if observed.completed {
        return Verdict::Complete;
    }
    if stalled_for > limits.progress_timeout {
        return Verdict::Abort(format!(
            "no transfer progress for {}s (limit {}s)",
            stalled_for.as_secs(),
            limits.progress_timeout.as_secs()
        ));
    }
    let elapsed = elapsed_between(started, now);
    if elapsed > limits.completion_timeout {
        return Verdict::Abort(format!(
            "transfer not completed after {}s (limit {}s)",
            elapsed.as_secs(),
            limits.completion_timeout.as_secs()
        ));
    }
    Verdict::Continue
}

/// End timestamp strictly after the start.
fn end_timestamp(state: &MigrationState, now: DateTime<Utc>) -> DateTime<Utc> {
    match state.start_timestamp {
        Some(start) if now <= start => start + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

/// Mark an attempt failed. Setting `completed` freezes the outcome.
fn mark_failed(state: &mut MigrationState, reason: &str, now: DateTime<Utc>) {
    state.completed = true;
    state.failed = true;
    state.failure_reason = Some(reason.to_string());
    state.end_timestamp = Some(end_timestamp(state, now));
}

/// First available host other than `source`, by name.
async fn pick_target(
    nodes: &[String],
    source: &str,
    runtime: &dyn InstanceRuntime,
) -> Option<String> {
    for node in nodes {
        if node != source && runtime.is_node_available(node).await {
            return Some(node.clone());
        }
    }
    None
}

/// Drives MigrationRequests and the MigrationStates they own.
pub struct MigrationCoordinator {
    cluster: Arc<Cluster>,
    runtime: Arc<dyn InstanceRuntime>,
    config: CoordinatorConfig,
    transient_failures: RetryTracker,
    last_polls: HashMap<MigrationUid, Instant>,
}

impl MigrationCoordinator {
    pub fn new(
        cluster: Arc<Cluster>,
        runtime: Arc<dyn InstanceRuntime>,
        config: CoordinatorConfig,
    ) -> Self {
        let transient_failures = RetryTracker::new(config.transient_retries, DEFAULT_RETRY_WINDOW);
        Self {
            cluster,
            runtime,
            config,
            transient_failures,
            last_polls: HashMap::new(),
        }
    }

    /// Run one step for one request. Returns whether anything was written.
    #[instrument(skip(self, request), fields(migration = %request.key()))]
    pub async fn reconcile_request(
        &mut self,
        request: &MigrationRequest,
    ) -> Result<bool, ControllerError> {
        if request.is_terminal() {
            return Ok(false);
        }

        let instance_key = ObjectKey::new(
            request.meta.namespace.clone(),
            request.spec.instance_name.clone(),
        );
        let Some(instance) = self.cluster.instances.find(&instance_key).await else {
            return self
                .fail_request(request, &format!("instance {instance_key} not found"), None)
                .await;
        };

        let attempt = instance
            .status
            .migration_state
            .as_ref()
            .filter(|m| m.migration_uid == request.meta.uid)
            .cloned();

        // The attempt already has an outcome; the request write was lost.
        if let Some(state) = attempt.as_ref().filter(|m| m.completed) {
            return if state.failed {
                let reason = state
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "migration failed".to_string());
                self.fail_request(request, &reason, Some(state)).await
            } else {
                self.succeed_request(request, state).await
            };
        }

        if instance.meta.is_terminating() || instance.phase() != Phase::Running {
            let reason = format!("instance {instance_key} is not running");
            return match attempt {
                Some(_) => self.fail_attempt(request, &instance, &reason).await,
                None => self.fail_request(request, &reason, None).await,
            };
        }

        match (request.phase(), attempt) {
            (MigrationPhase::Pending, _) => self.admit(request, &instance).await,
            (MigrationPhase::Scheduling, Some(state)) => {
                self.begin_transfer(request, &instance, state).await
            }
            (MigrationPhase::Running, Some(state)) => {
                self.monitor(request, &instance, state).await
            }
            (_, None) => {
                self.fail_request(request, "migration state detached from instance", None)
                    .await
            }
            (MigrationPhase::Succeeded | MigrationPhase::Failed, Some(_)) => Ok(false),
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn admit(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
    ) -> Result<bool, ControllerError> {
        if let Err(e) = validation::check_migratable(instance) {
            return self.fail_request(request, &e.to_string(), None).await;
        }
        let Some(source) = instance.status.node_name.clone() else {
            return self
                .fail_request(request, "instance has no host", None)
                .await;
        };

        let already_attached = instance
            .status
            .active_migration()
            .is_some_and(|m| m.migration_uid == request.meta.uid);
        let target = match instance.status.active_migration() {
            Some(state) if already_attached => state.target_node.clone(),
            Some(other) => {
                let reason = format!(
                    "instance already has an active migration {}",
                    other.migration_uid
                );
                return self.fail_request(request, &reason, None).await;
            }
            None => {
                match pick_target(self.cluster.nodes(), &source, self.runtime.as_ref()).await {
                    Some(target) => target,
                    None => {
                        debug!(source = %source, "No eligible target host, request stays pending");
                        return Ok(false);
                    }
                }
            }
        };

        if !already_attached {
            let uid = instance.meta.uid;
            let migration_uid = request.meta.uid;
            self.cluster
                .instances
                .patch_status(&instance.key(), &self.config.conflict_retry, |current| {
                    if current.meta.uid != uid {
                        return Err(ApiError::conflict("instance was replaced").into());
                    }
                    match current.status.active_migration() {
                        Some(m) if m.migration_uid == migration_uid => return Ok(false),
                        Some(m) => {
                            return Err(ApiError::conflict(format!(
                                "instance already has an active migration {}",
                                m.migration_uid
                            ))
                            .into())
                        }
                        None => {}
                    }
                    current.status.migration_state = Some(MigrationState::new(
                        migration_uid,
                        source.clone(),
                        target.clone(),
                    ));
                    Ok(true)
                })
                .await?;
            info!(
                instance = %instance.key(),
                source = %source,
                target = %target,
                "Migration scheduled"
            );
        }

        let now = Utc::now();
        self.write_request(request, |current| {
            current.status.transition(MigrationPhase::Scheduling, now);
            current.status.target_node = Some(target.clone());
        })
        .await
    }

    async fn begin_transfer(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        state: MigrationState,
    ) -> Result<bool, ControllerError> {
        let uid = instance.meta.uid;

        let address = match self.runtime.prepare_target(uid, &state.target_node).await {
            Ok(address) => address,
            Err(e) => return self.runtime_failure(request, instance, "prepare target", e).await,
        };
        if let Err(e) = self.runtime.start_migration(uid).await {
            return self.runtime_failure(request, instance, "start transfer", e).await;
        }
        self.transient_failures.clear(&request.meta.uid.to_string());

        let now = Utc::now();
        self.write_state(instance, request.meta.uid, |status| {
            let Some(state) = status.migration_state.as_mut() else {
                return false;
            };
            state.target_node_address = Some(address.clone());
            state.start_timestamp = Some(now);
            state.progress.last_progress_timestamp = Some(now);
            true
        })
        .await?;
        info!(instance = %instance.key(), target = %state.target_node, address = %address, "Transfer started");

        self.write_request(request, |current| {
            current.status.transition(MigrationPhase::Running, now);
        })
        .await
    }

    async fn monitor(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        mut state: MigrationState,
    ) -> Result<bool, ControllerError> {
        if !self.poll_due(request.meta.uid) {
            return Ok(false);
        }
        let uid = instance.meta.uid;
        let observed = match self.runtime.migration_progress(uid).await {
            Ok(observed) => observed,
            Err(e) => return self.runtime_failure(request, instance, "poll progress", e).await,
        };

        let now = Utc::now();
        let limits = self.config.limits(request, instance.spec.template.memory_bytes);
        match evaluate_progress(&mut state, &observed, &limits, now) {
            Verdict::Continue => {
                let progress = state.progress.clone();
                let before = instance.meta.resource_version;
                let written = self
                    .write_state(instance, request.meta.uid, |status| {
                        match status.migration_state.as_mut() {
                            Some(current) if current.progress != progress => {
                                current.progress = progress.clone();
                                true
                            }
                            _ => false,
                        }
                    })
                    .await?;
                Ok(written.meta.resource_version != before)
            }
            Verdict::Complete => self.complete(request, instance, state).await,
            Verdict::Abort(reason) => {
                if let Err(e) = self.runtime.abort_migration(uid).await {
                    warn!(instance = %instance.key(), error = %e, "Abort after timeout failed");
                }
                self.fail_attempt_with(request, instance, &reason, state.progress)
                    .await
            }
        }
    }

    /// Whether the transfer of `migration_uid` may be polled now. Records the
    /// poll when it is.
    fn poll_due(&mut self, migration_uid: MigrationUid) -> bool {
        let now = Instant::now();
        // Interval ticks can land slightly before a full period has passed
        // since the previous poll.
        let spacing = self.config.progress_poll_interval * 9 / 10;
        if self
            .last_polls
            .get(&migration_uid)
            .is_some_and(|at| now.duration_since(*at) < spacing)
        {
            return false;
        }
        self.last_polls.insert(migration_uid, now);
        true
    }

    async fn complete(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        state: MigrationState,
    ) -> Result<bool, ControllerError> {
        if let Err(e) = self.runtime.finish_migration(instance.meta.uid).await {
            return self.runtime_failure(request, instance, "switch over", e).await;
        }
        self.transient_failures.clear(&request.meta.uid.to_string());

        let now = Utc::now();
        let target = state.target_node.clone();
        let progress = state.progress.clone();
        let written = self
            .write_state(instance, request.meta.uid, |status| {
                let Some(current) = status.migration_state.as_mut() else {
                    return false;
                };
                if current.completed {
                    return false;
                }
                current.progress = progress.clone();
                current.completed = true;
                current.failed = false;
                current.end_timestamp = Some(end_timestamp(current, now));
                status.node_name = Some(target.clone());
                true
            })
            .await?;

        match written.status.migration_state.as_ref() {
            Some(snapshot) if snapshot.failed => {
                let reason = snapshot
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "migration failed".to_string());
                self.fail_request(request, &reason, Some(snapshot)).await
            }
            Some(snapshot) => self.succeed_request(request, snapshot).await,
            None => Ok(true),
        }
    }

    /// Route a runtime error: transient errors are retried until the
    /// tracker gives up, anything else fails the attempt.
    async fn runtime_failure(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        step: &str,
        error: RuntimeError,
    ) -> Result<bool, ControllerError> {
        let key = request.meta.uid.to_string();
        if let RuntimeError::Transient(message) = &error {
            let exhausted = self.transient_failures.record_failure(&key);
            let failures = self.transient_failures.failures(&key);
            if !exhausted {
                warn!(
                    migration = %request.key(),
                    step,
                    attempt = failures,
                    error = %message,
                    "Transient migration failure, will retry"
                );
                return Ok(false);
            }
            self.transient_failures.clear(&key);
        }

        if let Err(e) = self.runtime.abort_migration(instance.meta.uid).await {
            debug!(instance = %instance.key(), error = %e, "No transfer to abort");
        }
        self.fail_attempt(request, instance, &format!("{step} failed: {error}"))
            .await
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Abort the in-flight attempt on `instance`; its request is gone.
    async fn cancel(&mut self, instance: &Instance) -> Result<bool, ControllerError> {
        let Some(state) = instance.status.active_migration().cloned() else {
            return Ok(false);
        };
        let migration_uid = state.migration_uid;

        if !state.abort_requested || state.abort_status != AbortStatus::Aborting {
            self.write_state(instance, migration_uid, |status| {
                let Some(current) = status.migration_state.as_mut() else {
                    return false;
                };
                current.abort_requested = true;
                current.abort_status = AbortStatus::Aborting;
                true
            })
            .await?;
            info!(instance = %instance.key(), migration_uid = %migration_uid, "Cancelling migration");
        }

        let key = migration_uid.to_string();
        let abort_status = match self.runtime.abort_migration(instance.meta.uid).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => AbortStatus::AbortSucceeded,
            Err(RuntimeError::Transient(message)) => {
                if !self.transient_failures.record_failure(&key) {
                    warn!(instance = %instance.key(), error = %message, "Abort failed, will retry");
                    return Ok(false);
                }
                AbortStatus::AbortFailed
            }
            Err(e) => {
                warn!(instance = %instance.key(), error = %e, "Abort rejected");
                AbortStatus::AbortFailed
            }
        };
        self.transient_failures.clear(&key);

        let now = Utc::now();
        self.write_state(instance, migration_uid, |status| {
            let Some(current) = status.migration_state.as_mut() else {
                return false;
            };
            if current.completed {
                return false;
            }
            current.abort_requested = true;
            current.abort_status = abort_status;
            mark_failed(current, "migration cancelled", now);
            true
        })
        .await?;
        info!(
            instance = %instance.key(),
            migration_uid = %migration_uid,
            abort_status = ?abort_status,
            "Migration cancelled"
        );
        Ok(true)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Update the request's status. No-op once it is terminal.
    async fn write_request<F>(
        &self,
        request: &MigrationRequest,
        mutate: F,
    ) -> Result<bool, ControllerError>
    where
        F: Fn(&mut MigrationRequest) + Sync,
    {
        let uid = request.meta.uid;
        let written = self
            .cluster
            .migrations
            .patch_status(&request.key(), &self.config.conflict_retry, |current| {
                if current.meta.uid != uid {
                    return Err(ApiError::conflict("migration request was replaced").into());
                }
                if current.is_terminal() {
                    return Ok(false);
                }
                let before = current.status.clone();
                mutate(current);
                Ok(current.status != before)
            })
            .await?;
        Ok(written.meta.resource_version != request.meta.resource_version)
    }

    async fn succeed_request(
        &mut self,
        request: &MigrationRequest,
        snapshot: &MigrationState,
    ) -> Result<bool, ControllerError> {
        info!(
            migration = %request.key(),
            source = %snapshot.source_node,
            target = %snapshot.target_node,
            "Migration succeeded"
        );
        self.transient_failures.clear(&request.meta.uid.to_string());
        let now = Utc::now();
        self.write_request(request, |current| {
            current.status.transition(MigrationPhase::Succeeded, now);
            current.status.target_node = Some(snapshot.target_node.clone());
            current.status.migration_state = Some(snapshot.clone());
        })
        .await
    }

    async fn fail_request(
        &mut self,
        request: &MigrationRequest,
        reason: &str,
        snapshot: Option<&MigrationState>,
    ) -> Result<bool, ControllerError> {
        warn!(migration = %request.key(), reason = %reason, "Migration failed");
        self.transient_failures.clear(&request.meta.uid.to_string());
        let now = Utc::now();
        self.write_request(request, |current| {
            current.status.transition(MigrationPhase::Failed, now);
            current.status.failure_reason = Some(reason.to_string());
            current.status.migration_state = snapshot.cloned();
        })
        .await
    }

    /// Fail the attempt on the instance (if still in flight), then the
    /// request.
    async fn fail_attempt(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        reason: &str,
    ) -> Result<bool, ControllerError> {
        let progress = instance
            .status
            .migration_state
            .as_ref()
            .map(|m| m.progress.clone())
            .unwrap_or_default();
        self.fail_attempt_with(request, instance, reason, progress)
            .await
    }

    async fn fail_attempt_with(
        &mut self,
        request: &MigrationRequest,
        instance: &Instance,
        reason: &str,
        progress: MigrationProgress,
    ) -> Result<bool, ControllerError> {
        let now = Utc::now();
        let written = self
            .write_state(instance, request.meta.uid, |status| {
                match status.migration_state.as_mut() {
                    Some(state) if state.in_flight() => {
                        state.progress = progress.clone();
                        mark_failed(state, reason, now);
                        true
                    }
                    _ => false,
                }
            })
            .await?;
        let snapshot = written
            .status
            .migration_state
            .filter(|m| m.migration_uid == request.meta.uid);
        self.fail_request(request, reason, snapshot.as_ref()).await
    }

    /// Update the MigrationState of `migration_uid` on `instance`. Fails if
    /// the instance was replaced or now carries another attempt.
    async fn write_state<F>(
        &self,
        instance: &Instance,
        migration_uid: MigrationUid,
        mutate: F,
    ) -> Result<Instance, ControllerError>
    where
        F: Fn(&mut InstanceStatus) -> bool + Sync,
    {
        let uid = instance.meta.uid;
        let written = self
            .cluster
            .instances
            .patch_status(&instance.key(), &self.config.conflict_retry, |current| {
                if current.meta.uid != uid {
                    return Err(ApiError::conflict("instance was replaced").into());
                }
                let owned = current
                    .status
                    .migration_state
                    .as_ref()
                    .is_some_and(|m| m.migration_uid == migration_uid);
                if !owned {
                    return Err(ApiError::conflict(format!(
                        "instance no longer carries migration {migration_uid}"
                    ))
                    .into());
                }
                Ok(mutate(&mut current.status))
            })
            .await?;
        Ok(written)
    }
}

#[async_trait]
impl Reconcile for MigrationCoordinator {
    fn name(&self) -> &'static str {
        "migration-coordinator"
    }

    async fn reconcile_all(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        let mut active = HashSet::new();

        for request in self.cluster.migrations.list(None).await {
            if request.is_terminal() {
                continue;
            }
            active.insert(request.meta.uid);
            stats.objects += 1;
            match self.reconcile_request(&request).await {
                Ok(true) => stats.actions += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(migration = %request.key(), error = %e, "Migration step failed");
                }
            }
        }

        for instance in self.cluster.instances.list(None).await {
            let Some(state) = instance.status.active_migration() else {
                continue;
            };
            let requested = self
                .cluster
                .migrations
                .find_by_uid(&instance.meta.namespace, state.migration_uid)
                .await
                .is_some();
            if requested {
                continue;
            }
            stats.objects += 1;
            match self.cancel(&instance).await {
                Ok(true) => stats.actions += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!(instance = %instance.key(), error = %e, "Migration cancellation failed");
                }
            }
        }

        self.last_polls.retain(|uid, _| active.contains(uid));
        self.transient_failures.prune();
        stats
    }
}
