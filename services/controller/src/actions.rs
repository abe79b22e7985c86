//! Object verbs and sub-resource actions.
//!
//! Every action is accepted or rejected synchronously; its effect happens
//! asynchronously in the control loops. Callers poll status (or use the
//! `wait_for_*` helpers) to observe completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use vmctl_model::validation::{check_migratable, validate_migration_request, validate_run_policy};
use vmctl_model::{
    ApiError, ErrorKind, FsFreezeStatus, Instance, InstanceStatus, MigrationConfig,
    MigrationPhase, MigrationRequest, ObjectKey, Phase, Resource, RunMode, RunPolicy,
    RunPolicySpec, StateChangeRequest,
};
use vmctl_reconcile::{wait_for, ConflictRetry, ReconcileError, WaitOptions};

use crate::cluster::Cluster;
use crate::runtime::InstanceRuntime;
use crate::store::{DeleteOptions, Deletion};
use crate::tracker;

fn timed_out(err: ReconcileError) -> ApiError {
    ApiError::new(ErrorKind::Timeout, err.to_string())
}

/// Apply an RFC 7386 JSON merge patch to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in entries {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Options for a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartOptions {
    pub grace_period_secs: Option<u64>,
    /// Stop immediately, ignoring any grace period.
    pub force: bool,
}

/// Entry point for collaborators: object verbs plus sub-resource actions.
#[derive(Clone)]
pub struct Actions {
    cluster: Arc<Cluster>,
    runtime: Arc<dyn InstanceRuntime>,
    retry: ConflictRetry,
}

impl Actions {
    pub fn new(cluster: Arc<Cluster>, runtime: Arc<dyn InstanceRuntime>) -> Self {
        Self {
            cluster,
            runtime,
            retry: ConflictRetry::default(),
        }
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    // =========================================================================
    // RunPolicy verbs
    // =========================================================================

    pub async fn create_policy(&self, policy: RunPolicy) -> Result<RunPolicy, ApiError> {
        validate_run_policy(&policy)?;
        let created = self.cluster.policies.create(policy).await?;
        info!(
            machine = %created.key(),
            uid = %created.meta.uid,
            mode = %created.run_mode(),
            "Run policy created"
        );
        Ok(created)
    }

    pub async fn get_policy(&self, key: &ObjectKey) -> Result<RunPolicy, ApiError> {
        Ok(self.cluster.policies.get(key).await?)
    }

    pub async fn list_policies(&self, namespace: &str) -> Vec<RunPolicy> {
        self.cluster.policies.list(Some(namespace)).await
    }

    /// Replace the spec. `policy.meta.resource_version` must match the
    /// stored version.
    pub async fn update_policy(&self, policy: RunPolicy) -> Result<RunPolicy, ApiError> {
        validate_run_policy(&policy)?;
        Ok(self.cluster.policies.update(policy).await?)
    }

    /// Merge-patch the spec, retried on conflict.
    pub async fn patch_policy(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<RunPolicy, ApiError> {
        let patched = self
            .cluster
            .policies
            .patch(key, &self.retry, |policy| {
                let mut spec = serde_json::to_value(&policy.spec)
                    .map_err(|e| ApiError::internal(e.to_string()))?;
                merge_patch(&mut spec, patch);
                let spec: RunPolicySpec = serde_json::from_value(spec)
                    .map_err(|e| ApiError::invalid(format!("invalid patch: {e}")))?;
                if spec == policy.spec {
                    return Ok(false);
                }
                policy.spec = spec;
                validate_run_policy(policy)?;
                Ok(true)
            })
            .await?;
        Ok(patched)
    }

    /// Delete a policy. Its instance is collected by the reconciler.
    pub async fn delete_policy(&self, key: &ObjectKey) -> Result<(), ApiError> {
        self.cluster
            .policies
            .delete(key, DeleteOptions::default())
            .await?;
        info!(machine = %key, "Run policy deleted");
        Ok(())
    }

    // =========================================================================
    // Machine actions
    // =========================================================================

    /// Request a start. A Halted machine switches to Always.
    pub async fn start(&self, key: &ObjectKey) -> Result<RunPolicy, ApiError> {
        if let Some(instance) = self.cluster.instances.find(key).await {
            if !instance.phase().is_terminal() && !instance.meta.is_terminating() {
                return Err(ApiError::already_running());
            }
        }

        self.cluster
            .policies
            .patch(key, &self.retry, |policy| {
                if policy.run_mode() != RunMode::Halted {
                    return Ok(false);
                }
                policy.spec.running = None;
                policy.spec.run_mode = Some(RunMode::Always);
                Ok(true)
            })
            .await?;
        let policy = self
            .cluster
            .policies
            .patch_status(key, &self.retry, |policy| {
                policy.status.enqueue(StateChangeRequest::Start);
                Ok(true)
            })
            .await?;
        info!(machine = %key, mode = %policy.run_mode(), "Start requested");
        Ok(policy)
    }

    /// Request a stop. Always and RerunOnFailure machines switch to Halted.
    pub async fn stop(
        &self,
        key: &ObjectKey,
        grace_period_secs: Option<u64>,
    ) -> Result<RunPolicy, ApiError> {
        let instance = self.stoppable_instance(key).await?;

        self.cluster
            .policies
            .patch(key, &self.retry, |policy| {
                if !matches!(policy.run_mode(), RunMode::Always | RunMode::RerunOnFailure) {
                    return Ok(false);
                }
                policy.spec.running = None;
                policy.spec.run_mode = Some(RunMode::Halted);
                Ok(true)
            })
            .await?;
        let uid = instance.meta.uid;
        let policy = self
            .cluster
            .policies
            .patch_status(key, &self.retry, |policy| {
                policy.status.clear_start();
                policy.status.enqueue(StateChangeRequest::Stop {
                    uid: Some(uid),
                    grace_period_secs,
                });
                Ok(true)
            })
            .await?;
        info!(machine = %key, instance_uid = %uid, "Stop requested");
        Ok(policy)
    }

    /// Request a stop of the current instance followed by a fresh start.
    pub async fn restart(
        &self,
        key: &ObjectKey,
        options: RestartOptions,
    ) -> Result<RunPolicy, ApiError> {
        let instance = self.stoppable_instance(key).await?;
        let grace_period_secs = if options.force {
            Some(0)
        } else {
            options.grace_period_secs
        };

        let uid = instance.meta.uid;
        let policy = self
            .cluster
            .policies
            .patch_status(key, &self.retry, |policy| {
                policy.status.enqueue(StateChangeRequest::Stop {
                    uid: Some(uid),
                    grace_period_secs,
                });
                policy.status.enqueue(StateChangeRequest::Start);
                Ok(true)
            })
            .await?;
        info!(
            machine = %key,
            instance_uid = %uid,
            force = options.force,
            "Restart requested"
        );
        Ok(policy)
    }

    async fn stoppable_instance(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        self.cluster.policies.get(key).await?;
        match self.cluster.instances.find(key).await {
            Some(instance) if !instance.meta.is_terminating() => Ok(instance),
            _ => Err(ApiError::not_running()),
        }
    }

    // =========================================================================
    // Instance verbs and actions
    // =========================================================================

    pub async fn get_instance(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        Ok(self.cluster.instances.get(key).await?)
    }

    pub async fn list_instances(&self, namespace: &str) -> Vec<Instance> {
        self.cluster.instances.list(Some(namespace)).await
    }

    /// Delete an instance directly. The process is stopped before the
    /// object disappears.
    pub async fn delete_instance(
        &self,
        key: &ObjectKey,
        grace_period_secs: Option<u64>,
    ) -> Result<(), ApiError> {
        let options = DeleteOptions {
            uid: None,
            grace_period_secs,
        };
        match self.cluster.instances.delete(key, options).await? {
            Deletion::Removed(_) => info!(instance = %key, "Instance removed"),
            Deletion::Pending(_) => info!(instance = %key, "Instance terminating"),
        }
        Ok(())
    }

    pub async fn pause(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        let instance = self.get_instance(key).await?;
        tracker::check_pause(&instance)?;
        self.runtime.pause(instance.meta.uid).await?;
        info!(instance = %key, "Instance paused");
        self.write_instance_status(&instance, |status| {
            tracker::set_paused(status, true).map_err(ApiError::from)
        })
        .await
    }

    pub async fn unpause(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        let instance = self.get_instance(key).await?;
        tracker::check_unpause(&instance)?;
        self.runtime.unpause(instance.meta.uid).await?;
        info!(instance = %key, "Instance unpaused");
        self.write_instance_status(&instance, |status| {
            tracker::set_paused(status, false).map_err(ApiError::from)
        })
        .await
    }

    /// Quiesce guest filesystems. With a timeout they are thawed
    /// automatically if no unfreeze arrives in time. Freezing again
    /// refreshes the deadline.
    pub async fn freeze(
        &self,
        key: &ObjectKey,
        unfreeze_timeout: Option<Duration>,
    ) -> Result<Instance, ApiError> {
        let instance = self.get_instance(key).await?;
        tracker::check_freeze(&instance)?;
        self.runtime.freeze(instance.meta.uid).await?;

        let deadline = match unfreeze_timeout {
            Some(timeout) => Some(
                Utc::now()
                    + chrono::Duration::from_std(timeout)
                        .map_err(|e| ApiError::invalid(format!("unfreeze timeout: {e}")))?,
            ),
            None => None,
        };
        info!(instance = %key, deadline = ?deadline, "Filesystems frozen");
        self.write_instance_status(&instance, |status| {
            let mut changed = tracker::set_frozen(status, true).map_err(ApiError::from)?;
            if status.unfreeze_deadline != deadline {
                status.unfreeze_deadline = deadline;
                changed = true;
            }
            Ok(changed)
        })
        .await
    }

    pub async fn unfreeze(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        let instance = self.get_instance(key).await?;
        tracker::check_freeze(&instance)?;
        self.runtime.unfreeze(instance.meta.uid).await?;
        info!(instance = %key, "Filesystems thawed");
        self.write_instance_status(&instance, |status| {
            tracker::set_frozen(status, false).map_err(ApiError::from)
        })
        .await
    }

    /// Reboot the guest in place. The instance keeps its identity; the
    /// guest reboot counter increments.
    pub async fn soft_reboot(&self, key: &ObjectKey) -> Result<Instance, ApiError> {
        let instance = self.get_instance(key).await?;
        tracker::check_soft_reboot(&instance)?;
        self.runtime.soft_reboot(instance.meta.uid).await?;
        let count = self.runtime.guest_reboot_count(instance.meta.uid).await?;
        info!(instance = %key, reboots = count, "Guest rebooted");
        self.write_instance_status(&instance, |status| {
            if status.guest_reboot_count == count {
                return Ok(false);
            }
            status.guest_reboot_count = count;
            status.fs_freeze_status = FsFreezeStatus::Thawed;
            status.unfreeze_deadline = None;
            Ok(true)
        })
        .await
    }

    async fn write_instance_status<F>(
        &self,
        instance: &Instance,
        step: F,
    ) -> Result<Instance, ApiError>
    where
        F: Fn(&mut InstanceStatus) -> Result<bool, ApiError> + Sync,
    {
        let uid = instance.meta.uid;
        let written = self
            .cluster
            .instances
            .patch_status(&instance.key(), &self.retry, |current| {
                if current.meta.uid != uid {
                    return Err(ApiError::conflict("instance was replaced").into());
                }
                Ok(step(&mut current.status)?)
            })
            .await?;
        Ok(written)
    }

    // =========================================================================
    // Migrations
    // =========================================================================

    /// Relocate the named instance, creating a MigrationRequest for it.
    pub async fn migrate(
        &self,
        key: &ObjectKey,
        config: Option<MigrationConfig>,
    ) -> Result<MigrationRequest, ApiError> {
        let mut request = MigrationRequest::new(
            key.namespace.clone(),
            migration_name(&key.name),
            key.name.clone(),
        );
        request.spec.config = config;
        self.create_migration(request).await
    }

    /// Admit and store a MigrationRequest.
    pub async fn create_migration(
        &self,
        request: MigrationRequest,
    ) -> Result<MigrationRequest, ApiError> {
        validate_migration_request(&request)?;

        let instance_key = ObjectKey::new(
            request.meta.namespace.clone(),
            request.spec.instance_name.clone(),
        );
        let instance = self
            .cluster
            .instances
            .find(&instance_key)
            .await
            .ok_or_else(|| ApiError::not_found(Instance::KIND, &instance_key))?;
        tracker::check_running(&instance)?;
        check_migratable(&instance)?;

        if let Some(active) = instance.status.active_migration() {
            return Err(ApiError::conflict(format!(
                "instance {instance_key} already has an active migration {}",
                active.migration_uid
            )));
        }
        let competing = self
            .cluster
            .migrations
            .list(Some(&request.meta.namespace))
            .await
            .into_iter()
            .find(|m| m.spec.instance_name == request.spec.instance_name && !m.is_terminal());
        if let Some(other) = competing {
            return Err(ApiError::conflict(format!(
                "migration {} for instance {instance_key} is still {}",
                other.meta.name,
                other.phase()
            )));
        }

        let created = self.cluster.migrations.create(request).await?;
        info!(
            migration = %created.key(),
            instance = %instance_key,
            "Migration requested"
        );
        Ok(created)
    }

    pub async fn get_migration(&self, key: &ObjectKey) -> Result<MigrationRequest, ApiError> {
        Ok(self.cluster.migrations.get(key).await?)
    }

    pub async fn list_migrations(&self, namespace: &str) -> Vec<MigrationRequest> {
        self.cluster.migrations.list(Some(namespace)).await
    }

    /// Delete a MigrationRequest. An in-flight transfer is cancelled.
    pub async fn delete_migration(&self, key: &ObjectKey) -> Result<(), ApiError> {
        let deletion = self
            .cluster
            .migrations
            .delete(key, DeleteOptions::default())
            .await?;
        if let Deletion::Removed(request) = deletion {
            if !request.is_terminal() {
                info!(migration = %key, phase = %request.phase(), "Migration cancelled");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait until the instance reaches `phase`.
    pub async fn wait_for_phase(
        &self,
        key: &ObjectKey,
        phase: Phase,
        opts: &WaitOptions,
    ) -> Result<Instance, ApiError> {
        let instances = &self.cluster.instances;
        wait_for(
            &format!("instance {key} to reach {phase}"),
            opts,
            Some(self.cluster.changes()),
            || async move { instances.find(key).await.filter(|i| i.phase() == phase) },
        )
        .await
        .map_err(timed_out)
    }

    /// Wait until the MigrationRequest is Succeeded or Failed.
    pub async fn wait_for_migration_terminal(
        &self,
        key: &ObjectKey,
        opts: &WaitOptions,
    ) -> Result<MigrationRequest, ApiError> {
        let migrations = &self.cluster.migrations;
        wait_for(
            &format!("migration {key} to finish"),
            opts,
            Some(self.cluster.changes()),
            || async move {
                migrations.find(key).await.filter(|m| {
                    matches!(m.phase(), MigrationPhase::Succeeded | MigrationPhase::Failed)
                })
            },
        )
        .await
        .map_err(timed_out)
    }

    /// Wait until the instance object is gone.
    pub async fn wait_for_deletion(
        &self,
        key: &ObjectKey,
        opts: &WaitOptions,
    ) -> Result<(), ApiError> {
        let instances = &self.cluster.instances;
        wait_for(
            &format!("instance {key} to be deleted"),
            opts,
            Some(self.cluster.changes()),
            || async move { instances.find(key).await.is_none().then_some(()) },
        )
        .await
        .map_err(timed_out)
    }
}

/// Name for a MigrationRequest created through the `migrate` action.
fn migration_name(instance_name: &str) -> String {
    let suffix = format!("-migration-{:x}", Utc::now().timestamp_millis());
    let keep = vmctl_model::validation::MAX_NAME_LEN.saturating_sub(suffix.len());
    let prefix = instance_name
        .get(..keep.min(instance_name.len()))
        .unwrap_or(instance_name)
        .trim_end_matches('-');
    format!("{prefix}{suffix}")
}
