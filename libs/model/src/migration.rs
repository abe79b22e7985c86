//! MigrationRequest: an explicit request to relocate a running Instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmctl_id::MigrationUid;

use crate::instance::MigrationState;
use crate::meta::{ObjectMeta, PhaseTransition, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationPhase {
    Pending,
    Scheduling,
    Running,
    Succeeded,
    Failed,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduling => "Scheduling",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request overrides of the coordinator's timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Allowed total duration per GiB of guest memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timeout_per_gib_secs: Option<u64>,

    /// Allowed duration without measurable transfer progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequestSpec {
    /// Name of the Instance to relocate, in the request's namespace.
    pub instance_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MigrationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequestStatus {
    pub phase: MigrationPhase,

    #[serde(default)]
    pub phase_transition_timestamps: Vec<PhaseTransition<MigrationPhase>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Copy of the Instance's migration state, recorded once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,
}

impl Default for MigrationRequestStatus {
    fn default() -> Self {
        Self {
            phase: MigrationPhase::Pending,
            phase_transition_timestamps: vec![PhaseTransition {
                phase: MigrationPhase::Pending,
                timestamp: Utc::now(),
            }],
            target_node: None,
            failure_reason: None,
            migration_state: None,
        }
    }
}

impl MigrationRequestStatus {
    /// Move to `phase`, recording the transition. No-op if already there.
    pub fn transition(&mut self, phase: MigrationPhase, at: DateTime<Utc>) {
        if self.phase == phase {
            return;
        }
        self.phase = phase;
        self.phase_transition_timestamps.push(PhaseTransition {
            phase,
            timestamp: at,
        });
    }
}

/// Request to relocate the named Instance to another host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub meta: ObjectMeta<MigrationUid>,
    pub spec: MigrationRequestSpec,
    #[serde(default)]
    pub status: MigrationRequestStatus,
}

impl MigrationRequest {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: MigrationRequestSpec {
                instance_name: instance_name.into(),
                config: None,
            },
            status: MigrationRequestStatus::default(),
        }
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.spec.config = Some(config);
        self
    }

    pub fn phase(&self) -> MigrationPhase {
        self.status.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }
}

impl Resource for MigrationRequest {
    const KIND: &'static str = "MigrationRequest";
    type Uid = MigrationUid;
    type Spec = MigrationRequestSpec;
    type Status = MigrationRequestStatus;

    fn meta(&self) -> &ObjectMeta<MigrationUid> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta<MigrationUid> {
        &mut self.meta
    }

    fn spec(&self) -> &MigrationRequestSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut MigrationRequestSpec {
        &mut self.spec
    }

    fn status(&self) -> &MigrationRequestStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut MigrationRequestStatus {
        &mut self.status
    }
}
