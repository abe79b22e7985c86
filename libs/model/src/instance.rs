//! Instance: one concrete execution of a machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmctl_id::{InstanceUid, MachineUid, MigrationUid};

use crate::meta::{ObjectMeta, PhaseTransition, Resource};
use crate::policy::{InstanceTemplate, RunPolicy};

/// Coarse lifecycle stage of an Instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    /// Status temporarily cannot be determined (host not reporting).
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduling => "Scheduling",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Paused,
    AgentConnected,
    Synchronized,
    IsMigratable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Why an Instance reached a terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Clean guest-initiated shutdown.
    GuestShutdown,
    /// Fatal guest-level fault.
    GuestCrash,
    /// Backing process killed or vanished.
    ProcessLost,
    /// Host stopped responding.
    NodeLost,
    /// Start retries exhausted.
    StartFailure,
    /// Stopped because deletion was requested.
    Deleted,
}

impl TerminationReason {
    /// A started instance was lost to the infrastructure rather than the
    /// guest.
    pub fn is_infrastructure_loss(&self) -> bool {
        matches!(self, Self::ProcessLost | Self::NodeLost)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsFreezeStatus {
    #[default]
    Thawed,
    Frozen,
}

/// Outcome of a requested abort of an in-flight migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AbortStatus {
    #[default]
    None,
    /// Abort requested, transfer not yet torn down.
    Aborting,
    AbortSucceeded,
    AbortFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrationMode {
    #[default]
    PreCopy,
}

/// Transfer progress counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub data_processed_bytes: u64,
    pub data_remaining_bytes: u64,
    pub bytes_per_second: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_timestamp: Option<DateTime<Utc>>,
    pub elapsed_without_progress_secs: u64,
}

/// Projection of one migration attempt onto its Instance.
///
/// Written only by the migration coordinator. Once `completed` is set the
/// outcome fields are frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    pub migration_uid: MigrationUid,
    pub source_node: String,
    pub target_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,
    pub completed: bool,
    pub failed: bool,
    pub abort_requested: bool,
    pub abort_status: AbortStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub mode: MigrationMode,
    #[serde(default)]
    pub progress: MigrationProgress,
}

impl MigrationState {
    /// Fresh state for a new attempt.
    pub fn new(migration_uid: MigrationUid, source_node: String, target_node: String) -> Self {
        Self {
            migration_uid,
            source_node,
            target_node,
            target_node_address: None,
            start_timestamp: None,
            end_timestamp: None,
            completed: false,
            failed: false,
            abort_requested: false,
            abort_status: AbortStatus::None,
            failure_reason: None,
            mode: MigrationMode::PreCopy,
            progress: MigrationProgress::default(),
        }
    }

    /// Transfer still has to be driven to an outcome.
    pub fn in_flight(&self) -> bool {
        !self.completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub template: InstanceTemplate,

    /// RunPolicy that owns this instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<MachineUid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub phase: Phase,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default)]
    pub runtime_user_id: u32,

    #[serde(default)]
    pub fs_freeze_status: FsFreezeStatus,

    /// Automatic unfreeze deadline of the current freeze.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfreeze_deadline: Option<DateTime<Utc>>,

    /// Guest-side reboot counter as last reported by the runtime.
    #[serde(default)]
    pub guest_reboot_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub phase_transition_timestamps: Vec<PhaseTransition<Phase>>,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            conditions: Vec::new(),
            migration_state: None,
            node_name: None,
            runtime_user_id: 0,
            fs_freeze_status: FsFreezeStatus::Thawed,
            unfreeze_deadline: None,
            guest_reboot_count: 0,
            termination_reason: None,
            reason: None,
            phase_transition_timestamps: vec![PhaseTransition {
                phase: Phase::Pending,
                timestamp: Utc::now(),
            }],
        }
    }
}

impl InstanceStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Set a condition, touching `last_transition_time` only when the status
    /// changes.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: Option<&str>,
    ) {
        let now = Utc::now();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.map(str::to_string);
            }
            None => self.conditions.push(Condition {
                condition_type,
                status,
                reason: reason.map(str::to_string),
                message: None,
                last_transition_time: now,
            }),
        }
    }

    pub fn remove_condition(&mut self, condition_type: ConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }

    /// Migration attempt currently being driven, if any.
    pub fn active_migration(&self) -> Option<&MigrationState> {
        self.migration_state.as_ref().filter(|m| m.in_flight())
    }
}

/// One execution of a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub meta: ObjectMeta<InstanceUid>,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl Instance {
    /// A standalone instance not owned by any RunPolicy.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        template: InstanceTemplate,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: InstanceSpec {
                template,
                owner: None,
            },
            status: InstanceStatus::default(),
        }
    }

    /// The instance a RunPolicy wants; shares its namespace and name.
    pub fn for_policy(policy: &RunPolicy) -> Self {
        let mut instance = Self::new(
            policy.meta.namespace.clone(),
            policy.meta.name.clone(),
            policy.spec.template.clone(),
        );
        instance.spec.owner = Some(policy.meta.uid);
        instance
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == Phase::Running
    }

    pub fn is_paused(&self) -> bool {
        self.status.is_true(ConditionType::Paused)
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_true(ConditionType::Ready)
    }
}

impl Resource for Instance {
    const KIND: &'static str = "Instance";
    type Uid = InstanceUid;
    type Spec = InstanceSpec;
    type Status = InstanceStatus;

    fn meta(&self) -> &ObjectMeta<InstanceUid> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta<InstanceUid> {
        &mut self.meta
    }

    fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut InstanceSpec {
        &mut self.spec
    }

    fn status(&self) -> &InstanceStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut InstanceStatus {
        &mut self.status
    }
}
