//! RunPolicy: declared intent for one logical machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmctl_id::{InstanceUid, MachineUid};

use crate::instance::Phase;
use crate::meta::{ObjectMeta, Resource};

/// How the reconciler keeps a machine's instance alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// No instance should exist.
    Halted,
    /// Exactly one instance should exist; recreated whenever it goes away.
    Always,
    /// Existence follows explicit start/stop only. Infrastructure loss of a
    /// started instance is still repaired.
    Manual,
    /// Recreated after an error-induced stop, left alone after a clean
    /// guest-initiated shutdown.
    RerunOnFailure,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "Halted",
            Self::Always => "Always",
            Self::Manual => "Manual",
            Self::RerunOnFailure => "RerunOnFailure",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage access mode of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Shared storage reachable from every host; survives relocation.
    ReadWriteMany,
    /// Node-local storage; pins the instance to its host.
    ReadWriteOnce,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub access_mode: AccessMode,
}

impl Disk {
    pub fn shared(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_mode: AccessMode::ReadWriteMany,
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_mode: AccessMode::ReadWriteOnce,
        }
    }
}

/// Everything needed to instantiate a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    /// Guest memory in bytes. Scales the migration completion timeout.
    pub memory_bytes: u64,

    #[serde(default)]
    pub disks: Vec<Disk>,

    /// Whether the guest image ships the cooperating in-guest agent.
    #[serde(default)]
    pub guest_agent: bool,

    /// Whether the firmware ACPI shutdown signal is enabled.
    #[serde(default = "default_true")]
    pub acpi: bool,

    /// Grace period for a regular stop.
    #[serde(default = "default_grace_period")]
    pub termination_grace_period_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_grace_period() -> u64 {
    30
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            disks: vec![Disk::shared("rootdisk")],
            guest_agent: false,
            acpi: true,
            termination_grace_period_secs: default_grace_period(),
        }
    }
}

impl InstanceTemplate {
    /// First disk that cannot follow the instance to another host.
    pub fn non_migratable_disk(&self) -> Option<&Disk> {
        self.disks
            .iter()
            .find(|d| d.access_mode == AccessMode::ReadWriteOnce)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicySpec {
    /// Legacy boolean form; mutually exclusive with `run_mode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<RunMode>,

    pub template: InstanceTemplate,
}

impl RunPolicySpec {
    /// Effective mode: `run_mode`, else `running=true` means Always, else
    /// Halted. Callers validate mutual exclusivity first.
    pub fn effective_run_mode(&self) -> RunMode {
        match (self.run_mode, self.running) {
            (Some(mode), _) => mode,
            (None, Some(true)) => RunMode::Always,
            _ => RunMode::Halted,
        }
    }
}

/// Explicit requests queued on a RunPolicy by the start/stop/restart actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum StateChangeRequest {
    Start,
    Stop {
        /// Instance to stop. `None` stops whatever instance exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<InstanceUid>,

        /// Overrides the template grace period.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grace_period_secs: Option<u64>,
    },
}

impl StateChangeRequest {
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }
}

/// Human-facing summary of where a machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintableStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Migrating,
    Stopping,
    Succeeded,
    Failed,
    CrashLoopBackOff,
}

/// Crash-loop bookkeeping for repeated failure-induced recreations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFailure {
    pub consecutive_failures: u32,
    pub last_failure_timestamp: DateTime<Utc>,
    pub retry_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicyStatus {
    /// An instance object exists.
    #[serde(default)]
    pub created: bool,

    /// An instance exists and its Ready condition is true.
    #[serde(default)]
    pub ready: bool,

    pub printable_status: PrintableStatus,

    /// Pending explicit requests, oldest first. At most one of each kind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_change_requests: Vec<StateChangeRequest>,

    /// Instance the reconciler last saw for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_instance_uid: Option<InstanceUid>,

    /// Phase of `observed_instance_uid` when last seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_failure: Option<StartFailure>,
}

impl Default for RunPolicyStatus {
    fn default() -> Self {
        Self {
            created: false,
            ready: false,
            printable_status: PrintableStatus::Stopped,
            state_change_requests: Vec::new(),
            observed_instance_uid: None,
            last_observed_phase: None,
            start_failure: None,
        }
    }
}

impl RunPolicyStatus {
    /// Queue a request, replacing a pending request of the same kind.
    pub fn enqueue(&mut self, request: StateChangeRequest) {
        self.state_change_requests
            .retain(|r| std::mem::discriminant(r) != std::mem::discriminant(&request));
        self.state_change_requests.push(request);
    }

    pub fn pending_start(&self) -> bool {
        self.state_change_requests.iter().any(StateChangeRequest::is_start)
    }

    pub fn pending_stop(&self) -> Option<&StateChangeRequest> {
        self.state_change_requests.iter().find(|r| r.is_stop())
    }

    pub fn clear_start(&mut self) {
        self.state_change_requests.retain(|r| !r.is_start());
    }

    pub fn clear_stop(&mut self) {
        self.state_change_requests.retain(|r| !r.is_stop());
    }
}

/// Declared intent for one logical machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    pub meta: ObjectMeta<MachineUid>,
    pub spec: RunPolicySpec,
    #[serde(default)]
    pub status: RunPolicyStatus,
}

impl RunPolicy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, mode: RunMode) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: RunPolicySpec {
                running: None,
                run_mode: Some(mode),
                template: InstanceTemplate::default(),
            },
            status: RunPolicyStatus::default(),
        }
    }

    pub fn with_template(mut self, template: InstanceTemplate) -> Self {
        self.spec.template = template;
        self
    }

    pub fn run_mode(&self) -> RunMode {
        self.spec.effective_run_mode()
    }
}

impl Resource for RunPolicy {
    const KIND: &'static str = "RunPolicy";
    type Uid = MachineUid;
    type Spec = RunPolicySpec;
    type Status = RunPolicyStatus;

    fn meta(&self) -> &ObjectMeta<MachineUid> {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta<MachineUid> {
        &mut self.meta
    }

    fn spec(&self) -> &RunPolicySpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut RunPolicySpec {
        &mut self.spec
    }

    fn status(&self) -> &RunPolicyStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut RunPolicyStatus {
        &mut self.status
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(None, None, RunMode::Halted)]
    #[case(Some(true), None, RunMode::Always)]
    #[case(Some(false), None, RunMode::Halted)]
    #[case(None, Some(RunMode::Manual), RunMode::Manual)]
    #[case(None, Some(RunMode::RerunOnFailure), RunMode::RerunOnFailure)]
    fn test_effective_run_mode(
        #[case] running: Option<bool>,
        #[case] run_mode: Option<RunMode>,
        #[case] expected: RunMode,
    ) {
        let spec = RunPolicySpec {
            running,
            run_mode,
            template: InstanceTemplate::default(),
        };
        assert_eq!(spec.effective_run_mode(), expected);
    }

    #[test]
    fn test_enqueue_keeps_one_of_each_kind() {
        let mut status = RunPolicyStatus::default();
        status.enqueue(StateChangeRequest::Start);
        status.enqueue(StateChangeRequest::Start);
        status.enqueue(StateChangeRequest::Stop {
            uid: None,
            grace_period_secs: None,
        });
        status.enqueue(StateChangeRequest::Stop {
            uid: None,
            grace_period_secs: Some(0),
        });

        assert_eq!(status.state_change_requests.len(), 2);
        assert!(status.pending_start());
        assert_eq!(
            status.pending_stop(),
            Some(&StateChangeRequest::Stop {
                uid: None,
                grace_period_secs: Some(0)
            })
        );

        status.clear_stop();
        assert!(status.pending_stop().is_none());
        assert!(status.pending_start());
    }

    #[test]
    fn test_non_migratable_disk() {
        let mut template = InstanceTemplate::default();
        assert!(template.non_migratable_disk().is_none());
        template.disks.push(Disk::local("scratch"));
        assert_eq!(template.non_migratable_disk().map(|d| d.name.as_str()), Some("scratch"));
    }
}
