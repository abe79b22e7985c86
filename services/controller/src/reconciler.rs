//! Desired-state reconciler.
//!
//! Maps each RunPolicy onto the create or delete of its single Instance.
//! [`decide`] is the pure policy; [`RunPolicyController`] applies its
//! result against the store and keeps the derived status fields current.
//!
//! The reconciler never writes an Instance's status. An Instance with an
//! in-flight migration is an ordinary existing instance as far as run-policy
//! convergence is concerned.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use vmctl_id::InstanceUid;
use vmctl_model::{
    ApiError, Instance, Phase, PrintableStatus, Resource, RunMode, RunPolicy, RunPolicyStatus,
    StartFailure, StateChangeRequest,
};
use vmctl_reconcile::{BackoffPolicy, ConflictRetry};

use crate::cluster::Cluster;
use crate::error::ControllerError;
use crate::store::{DeleteOptions, StoreError};
use crate::worker::{PassStats, Reconcile};

/// Why an instance is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCause {
    /// An explicit stop (or the stop half of a restart).
    StopRequested,
    /// A start request found a terminal instance in the way.
    StartOverTerminal,
    /// The policy is Halted.
    Halted,
    /// A terminal instance is removed so it can be recreated.
    Recreate,
}

/// The single next step for one RunPolicy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Create,
    Delete {
        uid: InstanceUid,
        grace_period_secs: Option<u64>,
        cause: DeleteCause,
    },
    /// Delete an instance lost to the infrastructure and queue a start so a
    /// fresh one replaces it.
    Replace { uid: InstanceUid },
    /// Drop requests that have been observed applied.
    ClearRequests { start: bool, stop: bool },
}

fn backing_off(status: &RunPolicyStatus, now: DateTime<Utc>) -> bool {
    status
        .start_failure
        .as_ref()
        .is_some_and(|f| now < f.retry_after)
}

/// Compute the next action for `policy` given its current instance.
///
/// Rules, by priority:
/// 1. A pending stop deletes the targeted instance and is cleared once it
///    is gone.
/// 2. A pending start creates an instance when none exists (removing a
///    terminal one first) and is cleared once a live instance exists.
/// 3. Otherwise the run mode decides.
pub fn decide(policy: &RunPolicy, instance: Option<&Instance>, now: DateTime<Utc>) -> Action {
    let status = &policy.status;

    if let Some(StateChangeRequest::Stop {
        uid,
        grace_period_secs,
    }) = status.pending_stop()
    {
        return match instance {
            Some(i) if uid.is_none_or(|u| u == i.meta.uid) => {
                if i.meta.is_terminating() {
                    Action::None
                } else {
                    Action::Delete {
                        uid: i.meta.uid,
                        grace_period_secs: *grace_period_secs,
                        cause: DeleteCause::StopRequested,
                    }
                }
            }
            _ => Action::ClearRequests {
                start: false,
                stop: true,
            },
        };
    }

    if status.pending_start() {
        return match instance {
            None => Action::Create,
            Some(i) if i.meta.is_terminating() => Action::None,
            Some(i) if i.phase().is_terminal() => Action::Delete {
                uid: i.meta.uid,
                grace_period_secs: None,
                cause: DeleteCause::StartOverTerminal,
            },
            Some(_) => Action::ClearRequests {
                start: true,
                stop: false,
            },
        };
    }

    if instance.is_some_and(|i| i.meta.is_terminating()) {
        return Action::None;
    }

    let recreate = |i: &Instance| Action::Delete {
        uid: i.meta.uid,
        grace_period_secs: None,
        cause: DeleteCause::Recreate,
    };

    match policy.run_mode() {
        RunMode::Halted => match instance {
            Some(i) => Action::Delete {
                uid: i.meta.uid,
                grace_period_secs: None,
                cause: DeleteCause::Halted,
            },
            None => Action::None,
        },
        RunMode::Always => match instance {
            None if backing_off(status, now) => Action::None,
            None => Action::Create,
            Some(i) if i.phase().is_terminal() => recreate(i),
            Some(_) => Action::None,
        },
        RunMode::RerunOnFailure => match instance {
            None if backing_off(status, now) => Action::None,
            None if status.last_observed_phase == Some(Phase::Succeeded) => Action::None,
            None => Action::Create,
            Some(i) if i.phase() == Phase::Failed => recreate(i),
            Some(_) => Action::None,
        },
        RunMode::Manual => match instance {
            // Vanished without a terminal phase ever being observed: the
            // guest did not choose to stop.
            None => match (status.observed_instance_uid, status.last_observed_phase) {
                (Some(_), Some(phase)) if !phase.is_terminal() => Action::Create,
                _ => Action::None,
            },
            Some(i)
                if i.phase() == Phase::Failed
                    && i
                        .status
                        .termination_reason
                        .is_some_and(|r| r.is_infrastructure_loss()) =>
            {
                Action::Replace { uid: i.meta.uid }
            }
            Some(_) => Action::None,
        },
    }
}

/// Bookkeeping an action implies for the policy status. Written before the
/// action is executed.
pub fn record_action(
    status: &mut RunPolicyStatus,
    action: &Action,
    instance: Option<&Instance>,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) {
    match action {
        Action::ClearRequests { start, stop } => {
            if *start {
                status.clear_start();
            }
            if *stop {
                status.clear_stop();
            }
        }
        Action::Replace { .. } => {
            status.enqueue(StateChangeRequest::Start);
            status.observed_instance_uid = None;
            status.last_observed_phase = None;
        }
        Action::Delete { cause, .. } => {
            status.observed_instance_uid = None;
            status.last_observed_phase = None;

            let failed = instance.is_some_and(|i| i.phase() == Phase::Failed);
            if *cause == DeleteCause::Recreate && failed {
                let failures = status
                    .start_failure
                    .as_ref()
                    .map_or(0, |f| f.consecutive_failures)
                    + 1;
                let delay = backoff.delay(failures - 1);
                let delay =
                    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                status.start_failure = Some(StartFailure {
                    consecutive_failures: failures,
                    last_failure_timestamp: now,
                    retry_after: now + delay,
                });
            }
        }
        Action::None | Action::Create => {}
    }
}

/// Human-facing summary of a machine.
pub fn printable_status(
    status: &RunPolicyStatus,
    instance: Option<&Instance>,
    now: DateTime<Utc>,
) -> PrintableStatus {
    let backing_off = backing_off(status, now);
    match instance {
        None if status.pending_start() => PrintableStatus::Starting,
        None if backing_off => PrintableStatus::CrashLoopBackOff,
        None => PrintableStatus::Stopped,
        Some(i) if i.meta.is_terminating() || status.pending_stop().is_some() => {
            PrintableStatus::Stopping
        }
        Some(i) => match i.phase() {
            Phase::Pending | Phase::Scheduling | Phase::Scheduled => PrintableStatus::Starting,
            Phase::Running | Phase::Unknown => {
                if i.status.active_migration().is_some() {
                    PrintableStatus::Migrating
                } else if i.is_paused() {
                    PrintableStatus::Paused
                } else {
                    PrintableStatus::Running
                }
            }
            Phase::Succeeded => PrintableStatus::Succeeded,
            Phase::Failed if backing_off => PrintableStatus::CrashLoopBackOff,
            Phase::Failed => PrintableStatus::Failed,
        },
    }
}

/// Refresh the fields derived from the current instance.
pub fn refresh_status(
    status: &mut RunPolicyStatus,
    instance: Option<&Instance>,
    now: DateTime<Utc>,
) {
    status.created = instance.is_some();
    status.ready = instance.is_some_and(Instance::is_ready);

    match instance {
        Some(i) if i.meta.is_terminating() => {
            status.observed_instance_uid = None;
            // A clean shutdown is remembered past deletion until the next start.
            status.last_observed_phase =
                (i.phase() == Phase::Succeeded).then_some(Phase::Succeeded);
        }
        Some(i) => {
            status.observed_instance_uid = Some(i.meta.uid);
            status.last_observed_phase = Some(i.phase());
            if i.is_running() && i.is_ready() {
                status.start_failure = None;
            }
        }
        None => {}
    }

    status.printable_status = printable_status(status, instance, now);
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before recreating an instance that failed again.
    pub crash_loop_backoff: BackoffPolicy,

    pub conflict_retry: ConflictRetry,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            crash_loop_backoff: BackoffPolicy {
                base: std::time::Duration::from_secs(1),
                max: std::time::Duration::from_secs(5 * 60),
                jitter: 0.1,
            },
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Applies [`decide`] to every RunPolicy.
pub struct RunPolicyController {
    cluster: Arc<Cluster>,
    config: ReconcilerConfig,
}

impl RunPolicyController {
    pub fn new(cluster: Arc<Cluster>, config: ReconcilerConfig) -> Self {
        Self { cluster, config }
    }

    /// The instance sharing the policy's name, if this policy owns it.
    async fn owned_instance(&self, policy: &RunPolicy) -> Option<Instance> {
        self.cluster
            .instances
            .find(&policy.key())
            .await
            .filter(|i| i.spec.owner == Some(policy.meta.uid))
    }

    async fn write_status<F>(&self, policy: &RunPolicy, mutate: F) -> Result<(), ControllerError>
    where
        F: Fn(&mut RunPolicyStatus) + Sync,
    {
        let uid = policy.meta.uid;
        self.cluster
            .policies
            .patch_status(&policy.key(), &self.config.conflict_retry, |current| {
                if current.meta.uid != uid {
                    return Err(ApiError::conflict("run policy was replaced").into());
                }
                let before = current.status.clone();
                mutate(&mut current.status);
                Ok(current.status != before)
            })
            .await?;
        Ok(())
    }

    async fn execute(&self, policy: &RunPolicy, action: &Action) -> Result<(), ControllerError> {
        let key = policy.key();
        match *action {
            Action::Create => match self
                .cluster
                .instances
                .create(Instance::for_policy(policy))
                .await
            {
                Ok(instance) => {
                    info!(
                        machine = %key,
                        instance_uid = %instance.meta.uid,
                        mode = %policy.run_mode(),
                        "Created instance"
                    );
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!(machine = %key, "Instance already exists");
                }
                Err(e) => return Err(e.into()),
            },
            Action::Delete {
                uid,
                grace_period_secs,
                ..
            } => self.delete_instance(policy, uid, grace_period_secs, action).await?,
            Action::Replace { uid } => self.delete_instance(policy, uid, None, action).await?,
            Action::None | Action::ClearRequests { .. } => {}
        }
        Ok(())
    }

    async fn delete_instance(
        &self,
        policy: &RunPolicy,
        uid: InstanceUid,
        grace_period_secs: Option<u64>,
        action: &Action,
    ) -> Result<(), ControllerError> {
        let key = policy.key();
        let options = DeleteOptions {
            uid: Some(uid),
            grace_period_secs,
        };
        match self.cluster.instances.delete(&key, options).await {
            Ok(_) => {
                info!(machine = %key, instance_uid = %uid, action = ?action, "Deleting instance");
                Ok(())
            }
            Err(StoreError::NotFound { .. } | StoreError::UidMismatch { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One reconciliation step for one policy.
    #[instrument(skip(self, policy), fields(machine = %policy.key()))]
    pub async fn reconcile_policy(&self, policy: &RunPolicy) -> Result<Action, ControllerError> {
        let now = Utc::now();
        let instance = self.owned_instance(policy).await;
        let action = decide(policy, instance.as_ref(), now);

        if !matches!(action, Action::None | Action::Create) {
            let backoff = &self.config.crash_loop_backoff;
            let before = instance.as_ref();
            self.write_status(policy, |status| {
                record_action(status, &action, before, backoff, now)
            })
            .await?;
        }

        self.execute(policy, &action).await?;

        let after = self.owned_instance(policy).await;
        self.write_status(policy, |status| refresh_status(status, after.as_ref(), now))
            .await?;

        Ok(action)
    }

    /// Delete instances whose owning policy no longer exists.
    async fn collect_orphans(&self) -> usize {
        let mut collected = 0;
        for instance in self.cluster.instances.list(None).await {
            let Some(owner) = instance.spec.owner else {
                continue;
            };
            if instance.meta.is_terminating() {
                continue;
            }
            let owner_exists = self
                .cluster
                .policies
                .find_by_uid(&instance.meta.namespace, owner)
                .await
                .is_some();
            if owner_exists {
                continue;
            }

            let options = DeleteOptions {
                uid: Some(instance.meta.uid),
                grace_period_secs: None,
            };
            match self.cluster.instances.delete(&instance.key(), options).await {
                Ok(_) => {
                    info!(instance = %instance.key(), "Deleting orphaned instance");
                    collected += 1;
                }
                Err(e) => warn!(instance = %instance.key(), error = %e, "Failed to delete orphan"),
            }
        }
        collected
    }
}

#[async_trait]
impl Reconcile for RunPolicyController {
    fn name(&self) -> &'static str {
        "run-policy-controller"
    }

    async fn reconcile_all(&mut self) -> PassStats {
        let mut stats = PassStats::default();
        for policy in self.cluster.policies.list(None).await {
            stats.objects += 1;
            match self.reconcile_policy(&policy).await {
                Ok(Action::None) => {}
                Ok(_) => stats.actions += 1,
                Err(e) => {
                    stats.errors += 1;
                    warn!(machine = %policy.key(), error = %e, "Run policy reconciliation failed");
                }
            }
        }
        stats.actions += self.collect_orphans().await;
        stats
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use vmctl_model::{InstanceTemplate, TerminationReason};

    use super::*;

    fn policy(mode: RunMode) -> RunPolicy {
        RunPolicy::new("default", "vm1", mode)
    }

    fn instance_in(policy: &RunPolicy, phase: Phase) -> Instance {
        let mut instance = Instance::for_policy(policy);
        instance.status.phase = phase;
        instance
    }

    fn failed_with(policy: &RunPolicy, reason: TerminationReason) -> Instance {
        let mut instance = instance_in(policy, Phase::Failed);
        instance.status.termination_reason = Some(reason);
        instance
    }

    fn stop_request(uid: Option<InstanceUid>) -> StateChangeRequest {
        StateChangeRequest::Stop {
            uid,
            grace_period_secs: None,
        }
    }

    #[rstest]
    #[case(RunMode::Halted, None, false)]
    #[case(RunMode::Always, None, true)]
    #[case(RunMode::RerunOnFailure, None, true)]
    #[case(RunMode::Manual, None, false)]
    #[case(RunMode::Always, Some(Phase::Running), true)]
    #[case(RunMode::Manual, Some(Phase::Running), true)]
    #[case(RunMode::Manual, Some(Phase::Succeeded), false)]
    #[case(RunMode::RerunOnFailure, Some(Phase::Succeeded), false)]
    fn test_absent_instance(
        #[case] mode: RunMode,
        #[case] last_observed: Option<Phase>,
        #[case] creates: bool,
    ) {
        let mut policy = policy(mode);
        if let Some(phase) = last_observed {
            policy.status.observed_instance_uid = Some(InstanceUid::new());
            policy.status.last_observed_phase = Some(phase);
        }
        let action = decide(&policy, None, Utc::now());
        assert_eq!(action == Action::Create, creates, "{action:?}");
    }

    #[rstest]
    #[case(RunMode::Always, Phase::Succeeded, true)]
    #[case(RunMode::Always, Phase::Failed, true)]
    #[case(RunMode::Always, Phase::Running, false)]
    #[case(RunMode::RerunOnFailure, Phase::Failed, true)]
    #[case(RunMode::RerunOnFailure, Phase::Succeeded, false)]
    #[case(RunMode::Manual, Phase::Succeeded, false)]
    fn test_terminal_instance(#[case] mode: RunMode, #[case] phase: Phase, #[case] deletes: bool) {
        let policy = policy(mode);
        let instance = instance_in(&policy, phase);
        let action = decide(&policy, Some(&instance), Utc::now());
        assert_eq!(matches!(action, Action::Delete { .. }), deletes, "{action:?}");
    }

    #[test]
    fn test_deleted_succeeded_instance_stays_down() {
        let mut policy = policy(RunMode::RerunOnFailure);
        let mut instance = instance_in(&policy, Phase::Succeeded);
        refresh_status(&mut policy.status, Some(&instance), Utc::now());

        instance.meta.deletion_timestamp = Some(Utc::now());
        refresh_status(&mut policy.status, Some(&instance), Utc::now());
        assert_eq!(policy.status.observed_instance_uid, None);
        assert_eq!(decide(&policy, None, Utc::now()), Action::None);

        policy.status.enqueue(StateChangeRequest::Start);
        assert_eq!(decide(&policy, None, Utc::now()), Action::Create);
    }

    #[test]
    fn test_deleted_running_instance_is_rerun() {
        let mut policy = policy(RunMode::RerunOnFailure);
        let mut instance = instance_in(&policy, Phase::Running);
        instance.meta.deletion_timestamp = Some(Utc::now());
        refresh_status(&mut policy.status, Some(&instance), Utc::now());
        assert_eq!(decide(&policy, None, Utc::now()), Action::Create);
    }

    #[test]
    fn test_halted_deletes_existing_instance() {
        let policy = policy(RunMode::Halted);
        let instance = instance_in(&policy, Phase::Running);
        assert!(matches!(
            decide(&policy, Some(&instance), Utc::now()),
            Action::Delete {
                cause: DeleteCause::Halted,
                ..
            }
        ));
    }

    #[rstest]
    #[case(TerminationReason::ProcessLost, true)]
    #[case(TerminationReason::NodeLost, true)]
    #[case(TerminationReason::GuestCrash, false)]
    #[case(TerminationReason::StartFailure, false)]
    fn test_manual_replaces_only_infrastructure_loss(
        #[case] reason: TerminationReason,
        #[case] replaces: bool,
    ) {
        let policy = policy(RunMode::Manual);
        let instance = failed_with(&policy, reason);
        let action = decide(&policy, Some(&instance), Utc::now());
        assert_eq!(matches!(action, Action::Replace { .. }), replaces, "{action:?}");
    }

    #[test]
    fn test_stop_takes_priority_over_start() {
        let mut policy = policy(RunMode::Manual);
        let instance = instance_in(&policy, Phase::Running);
        policy.status.enqueue(stop_request(Some(instance.meta.uid)));
        policy.status.enqueue(StateChangeRequest::Start);

        let action = decide(&policy, Some(&instance), Utc::now());
        assert_eq!(
            action,
            Action::Delete {
                uid: instance.meta.uid,
                grace_period_secs: None,
                cause: DeleteCause::StopRequested
            }
        );
    }

    #[test]
    fn test_stop_waits_for_termination_then_clears() {
        let mut policy = policy(RunMode::Manual);
        let mut instance = instance_in(&policy, Phase::Running);
        policy.status.enqueue(stop_request(Some(instance.meta.uid)));

        instance.meta.deletion_timestamp = Some(Utc::now());
        assert_eq!(decide(&policy, Some(&instance), Utc::now()), Action::None);

        assert_eq!(
            decide(&policy, None, Utc::now()),
            Action::ClearRequests {
                start: false,
                stop: true
            }
        );
    }

    #[test]
    fn test_stop_for_replaced_instance_is_cleared() {
        let mut policy = policy(RunMode::Manual);
        policy.status.enqueue(stop_request(Some(InstanceUid::new())));
        let fresh = instance_in(&policy, Phase::Running);

        assert_eq!(
            decide(&policy, Some(&fresh), Utc::now()),
            Action::ClearRequests {
                start: false,
                stop: true
            }
        );
    }

    #[test]
    fn test_start_removes_terminal_instance_then_creates() {
        let mut policy = policy(RunMode::RerunOnFailure);
        policy.status.enqueue(StateChangeRequest::Start);
        let done = instance_in(&policy, Phase::Succeeded);

        assert!(matches!(
            decide(&policy, Some(&done), Utc::now()),
            Action::Delete {
                cause: DeleteCause::StartOverTerminal,
                ..
            }
        ));
        assert_eq!(decide(&policy, None, Utc::now()), Action::Create);

        let fresh = instance_in(&policy, Phase::Pending);
        assert_eq!(
            decide(&policy, Some(&fresh), Utc::now()),
            Action::ClearRequests {
                start: true,
                stop: false
            }
        );
    }

    #[test]
    fn test_decide_is_stable_without_changes() {
        let policy = policy(RunMode::Always);
        let instance = instance_in(&policy, Phase::Running);
        let now = Utc::now();
        for _ in 0..3 {
            assert_eq!(decide(&policy, Some(&instance), now), Action::None);
        }
    }

    #[test]
    fn test_crash_loop_backoff_delays_recreation() {
        let mut policy = policy(RunMode::Always);
        let failed = instance_in(&policy, Phase::Failed);
        let now = Utc::now();
        let backoff = BackoffPolicy::fixed_exponential(
            std::time::Duration::from_secs(10),
            std::time::Duration::from_secs(60),
        );

        let action = decide(&policy, Some(&failed), now);
        record_action(&mut policy.status, &action, Some(&failed), &backoff, now);
        let record = policy.status.start_failure.clone().unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.retry_after, now + chrono::Duration::seconds(10));

        assert_eq!(decide(&policy, None, now), Action::None);
        assert_eq!(
            printable_status(&policy.status, None, now),
            PrintableStatus::CrashLoopBackOff
        );
        assert_eq!(
            decide(&policy, None, now + chrono::Duration::seconds(11)),
            Action::Create
        );

        let failed_again = instance_in(&policy, Phase::Failed);
        let action = decide(&policy, Some(&failed_again), now);
        record_action(&mut policy.status, &action, Some(&failed_again), &backoff, now);
        let record = policy.status.start_failure.clone().unwrap();
        assert_eq!(record.consecutive_failures, 2);
        assert_eq!(record.retry_after, now + chrono::Duration::seconds(20));
    }

    #[test]
    fn test_explicit_start_ignores_backoff() {
        let mut policy = policy(RunMode::Always);
        let now = Utc::now();
        policy.status.start_failure = Some(StartFailure {
            consecutive_failures: 3,
            last_failure_timestamp: now,
            retry_after: now + chrono::Duration::minutes(5),
        });
        assert_eq!(decide(&policy, None, now), Action::None);

        policy.status.enqueue(StateChangeRequest::Start);
        assert_eq!(decide(&policy, None, now), Action::Create);
    }

    #[test]
    fn test_refresh_status_tracks_instance() {
        let policy = policy(RunMode::Always);
        let mut status = policy.status.clone();
        let now = Utc::now();

        refresh_status(&mut status, None, now);
        assert!(!status.created);
        assert_eq!(status.printable_status, PrintableStatus::Stopped);

        let mut instance = Instance::for_policy(&policy);
        instance.status.phase = Phase::Running;
        instance.status.set_condition(
            vmctl_model::ConditionType::Ready,
            vmctl_model::ConditionStatus::True,
            None,
        );
        refresh_status(&mut status, Some(&instance), now);
        assert!(status.created);
        assert!(status.ready);
        assert_eq!(status.printable_status, PrintableStatus::Running);
        assert_eq!(status.observed_instance_uid, Some(instance.meta.uid));
        assert_eq!(status.last_observed_phase, Some(Phase::Running));

        instance.meta.deletion_timestamp = Some(now);
        refresh_status(&mut status, Some(&instance), now);
        assert_eq!(status.printable_status, PrintableStatus::Stopping);
        assert!(status.observed_instance_uid.is_none());
    }

    #[tokio::test]
    async fn test_controller_creates_and_collects_orphans() {
        let cluster = Arc::new(Cluster::new(["node-a"]));
        let mut controller = RunPolicyController::new(cluster.clone(), ReconcilerConfig::default());
        let policy = cluster
            .policies
            .create(
                RunPolicy::new("default", "vm1", RunMode::Always)
                    .with_template(InstanceTemplate::default()),
            )
            .await
            .unwrap();

        let stats = controller.reconcile_all().await;
        assert_eq!(stats.actions, 1);
        let instance = cluster.instances.get(&policy.key()).await.unwrap();
        assert_eq!(instance.spec.owner, Some(policy.meta.uid));

        let refreshed = cluster.policies.get(&policy.key()).await.unwrap();
        assert!(refreshed.status.created);
        assert_eq!(refreshed.status.printable_status, PrintableStatus::Starting);

        cluster
            .policies
            .delete(&policy.key(), DeleteOptions::default())
            .await
            .unwrap();
        controller.reconcile_all().await;
        assert!(cluster.instances.find(&policy.key()).await.is_none());
    }
}
