//! Instance runtime interface and simulated implementation.
//!
//! The runtime abstracts everything that touches a real hypervisor:
//! - Starting and stopping instance processes on a host
//! - Pause, filesystem freeze and soft reboot of a running guest
//! - Live transfer of a running guest to another host
//!
//! A simulated implementation with fault injection is provided for
//! development and tests.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use vmctl_id::InstanceUid;
use vmctl_model::InstanceTemplate;

/// Runtime failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Worth retrying with backoff (host busy, communication timeout).
    #[error("transient runtime failure: {0}")]
    Transient(String),

    #[error("instance {0} has no process")]
    NotFound(InstanceUid),

    /// The runtime refused the command in the instance's current state.
    #[error("runtime rejected command: {0}")]
    Rejected(String),

    #[error("guest agent not connected")]
    AgentNotConnected,

    /// Soft reboot with neither a connected agent nor ACPI.
    #[error("neither guest agent nor ACPI available")]
    NoRebootChannel,

    #[error("guest is paused")]
    Paused,
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Process-level state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// The guest shut itself down cleanly.
    GuestShutdown,
    /// The guest hit a fatal fault.
    GuestCrashed,
    /// The host stopped responding.
    NodeLost,
}

/// Snapshot of one instance as seen by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: ProcessState,
    pub node: String,
    pub agent_connected: bool,
    pub paused: bool,
    pub frozen: bool,
    pub guest_reboot_count: u32,
}

/// Counters of an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub data_processed_bytes: u64,
    pub data_remaining_bytes: u64,
    pub bytes_per_second: u64,
    /// Source and target are in sync; the switch-over can happen.
    pub completed: bool,
}

/// Instance runtime interface.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Whether a host can accept new processes.
    async fn is_node_available(&self, node: &str) -> bool;

    /// Start the process for an instance on `node`.
    async fn start(
        &self,
        uid: InstanceUid,
        node: &str,
        template: &InstanceTemplate,
    ) -> Result<(), RuntimeError>;

    /// Stop the process, giving the guest `grace` to shut down. Stopping an
    /// absent process succeeds.
    async fn stop(&self, uid: InstanceUid, grace: Duration) -> Result<(), RuntimeError>;

    async fn observe(&self, uid: InstanceUid) -> Result<Observation, RuntimeError>;

    async fn pause(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    async fn unpause(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    /// Quiesce the guest filesystems through the guest agent.
    async fn freeze(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    async fn unfreeze(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    /// Reboot the guest through the agent, or ACPI when there is no agent.
    async fn soft_reboot(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    async fn guest_reboot_count(&self, uid: InstanceUid) -> Result<u32, RuntimeError>;

    /// Prepare a receiving process on `target`. Returns its address.
    async fn prepare_target(&self, uid: InstanceUid, target: &str) -> Result<String, RuntimeError>;

    async fn start_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    async fn migration_progress(&self, uid: InstanceUid) -> Result<TransferProgress, RuntimeError>;

    /// Tear down the transfer. The source keeps running. Succeeds when there
    /// is no transfer.
    async fn abort_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError>;

    /// Switch the instance over to the target host.
    async fn finish_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError>;
}

/// How simulated transfers behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationBehavior {
    /// A quarter of guest memory is copied per poll.
    #[default]
    Converge,
    /// No bytes move.
    Stall,
    /// Bytes move but the guest dirties memory as fast as it is copied.
    Hold,
}

const HOLD_CHUNK: u64 = 1024 * 1024;

#[derive(Debug)]
struct SimTransfer {
    target: String,
    started: bool,
    processed: u64,
    remaining: u64,
}

#[derive(Debug)]
struct SimVm {
    node: String,
    state: ProcessState,
    memory_bytes: u64,
    guest_agent: bool,
    acpi: bool,
    agent_connected: bool,
    paused: bool,
    frozen: bool,
    reboot_count: u32,
    transfer: Option<SimTransfer>,
}

#[derive(Debug, Default)]
struct SimState {
    vms: HashMap<InstanceUid, SimVm>,
    lost_nodes: HashSet<String>,
    failing_starts: u32,
    migration_behavior: MigrationBehavior,
    starts: u64,
}

impl SimState {
    fn vm(&self, uid: InstanceUid) -> Result<&SimVm, RuntimeError> {
        self.vms.get(&uid).ok_or(RuntimeError::NotFound(uid))
    }

    fn vm_mut(&mut self, uid: InstanceUid) -> Result<&mut SimVm, RuntimeError> {
        self.vms.get_mut(&uid).ok_or(RuntimeError::NotFound(uid))
    }

    /// A vm that can take guest commands: running, on a reachable host.
    fn live_vm_mut(&mut self, uid: InstanceUid) -> Result<&mut SimVm, RuntimeError> {
        let lost = self
            .vms
            .get(&uid)
            .is_some_and(|vm| self.lost_nodes.contains(&vm.node));
        if lost {
            return Err(RuntimeError::Transient("host not responding".to_string()));
        }
        let vm = self.vm_mut(uid)?;
        if vm.state != ProcessState::Running {
            return Err(RuntimeError::Rejected("guest is not running".to_string()));
        }
        Ok(vm)
    }
}

/// In-memory runtime with fault injection.
#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    state: Mutex<SimState>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the backing process; the runtime forgets the instance.
    pub async fn kill_process(&self, uid: InstanceUid) -> bool {
        info!(instance_uid = %uid, "[SIM] Killing process");
        self.state.lock().await.vms.remove(&uid).is_some()
    }

    /// The guest powers itself off cleanly.
    pub async fn guest_shutdown(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(uid)?;
        vm.state = ProcessState::GuestShutdown;
        vm.agent_connected = false;
        Ok(())
    }

    /// The guest hits a fatal fault.
    pub async fn guest_crash(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(uid)?;
        vm.state = ProcessState::GuestCrashed;
        vm.agent_connected = false;
        Ok(())
    }

    /// The host stops responding; its processes report `NodeLost`.
    pub async fn lose_node(&self, node: &str) {
        info!(node, "[SIM] Node lost");
        self.state.lock().await.lost_nodes.insert(node.to_string());
    }

    pub async fn restore_node(&self, node: &str) {
        self.state.lock().await.lost_nodes.remove(node);
    }

    pub async fn set_agent_connected(&self, uid: InstanceUid, connected: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(uid)?;
        vm.agent_connected = connected && vm.guest_agent;
        Ok(())
    }

    /// Fail the next `count` starts with a transient error.
    pub async fn fail_next_starts(&self, count: u32) {
        self.state.lock().await.failing_starts = count;
    }

    pub async fn set_migration_behavior(&self, behavior: MigrationBehavior) {
        self.state.lock().await.migration_behavior = behavior;
    }

    /// Host currently running the instance's process.
    pub async fn node_of(&self, uid: InstanceUid) -> Option<String> {
        self.state.lock().await.vms.get(&uid).map(|vm| vm.node.clone())
    }

    pub async fn has_process(&self, uid: InstanceUid) -> bool {
        self.state.lock().await.vms.contains_key(&uid)
    }

    pub async fn has_transfer(&self, uid: InstanceUid) -> bool {
        self.state
            .lock()
            .await
            .vms
            .get(&uid)
            .is_some_and(|vm| vm.transfer.is_some())
    }

    /// Total successful starts since creation.
    pub async fn start_count(&self) -> u64 {
        self.state.lock().await.starts
    }
}

#[async_trait]
impl InstanceRuntime for SimulatedRuntime {
    async fn is_node_available(&self, node: &str) -> bool {
        !self.state.lock().await.lost_nodes.contains(node)
    }

    async fn start(
        &self,
        uid: InstanceUid,
        node: &str,
        template: &InstanceTemplate,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        if state.lost_nodes.contains(node) {
            return Err(RuntimeError::Transient(format!("host {node} not responding")));
        }
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(RuntimeError::Transient(
                "failed to create instance process".to_string(),
            ));
        }
        if state.vms.contains_key(&uid) {
            return Ok(());
        }

        info!(
            instance_uid = %uid,
            node,
            memory_mb = template.memory_bytes / (1024 * 1024),
            "[SIM] Starting instance"
        );
        state.vms.insert(
            uid,
            SimVm {
                node: node.to_string(),
                state: ProcessState::Running,
                memory_bytes: template.memory_bytes,
                guest_agent: template.guest_agent,
                acpi: template.acpi,
                agent_connected: template.guest_agent,
                paused: false,
                frozen: false,
                reboot_count: 0,
                transfer: None,
            },
        );
        state.starts += 1;
        Ok(())
    }

    /// Simulated guests stop at once, so `grace` is only logged and a forced
    /// stop behaves like any other.
    async fn stop(&self, uid: InstanceUid, grace: Duration) -> Result<(), RuntimeError> {
        if self.state.lock().await.vms.remove(&uid).is_some() {
            info!(instance_uid = %uid, grace_secs = grace.as_secs(), "[SIM] Stopped instance");
        }
        Ok(())
    }

    async fn observe(&self, uid: InstanceUid) -> Result<Observation, RuntimeError> {
        let state = self.state.lock().await;
        let vm = state.vm(uid)?;
        let process_state = if state.lost_nodes.contains(&vm.node) {
            ProcessState::NodeLost
        } else {
            vm.state
        };
        Ok(Observation {
            state: process_state,
            node: vm.node.clone(),
            agent_connected: vm.agent_connected,
            paused: vm.paused,
            frozen: vm.frozen,
            guest_reboot_count: vm.reboot_count,
        })
    }

    async fn pause(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.live_vm_mut(uid)?.paused = true;
        debug!(instance_uid = %uid, "[SIM] Paused");
        Ok(())
    }

    async fn unpause(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        state.live_vm_mut(uid)?.paused = false;
        debug!(instance_uid = %uid, "[SIM] Unpaused");
        Ok(())
    }

    async fn freeze(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.live_vm_mut(uid)?;
        if !vm.agent_connected {
            return Err(RuntimeError::AgentNotConnected);
        }
        vm.frozen = true;
        Ok(())
    }

    async fn unfreeze(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.live_vm_mut(uid)?;
        if !vm.agent_connected {
            return Err(RuntimeError::AgentNotConnected);
        }
        vm.frozen = false;
        Ok(())
    }

    async fn soft_reboot(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.live_vm_mut(uid)?;
        if vm.paused {
            return Err(RuntimeError::Paused);
        }
        if !vm.agent_connected && !vm.acpi {
            return Err(RuntimeError::NoRebootChannel);
        }
        vm.reboot_count += 1;
        vm.frozen = false;
        info!(instance_uid = %uid, reboots = vm.reboot_count, "[SIM] Guest rebooted");
        Ok(())
    }

    async fn guest_reboot_count(&self, uid: InstanceUid) -> Result<u32, RuntimeError> {
        Ok(self.state.lock().await.vm(uid)?.reboot_count)
    }

    async fn prepare_target(&self, uid: InstanceUid, target: &str) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().await;
        if state.lost_nodes.contains(target) {
            return Err(RuntimeError::Transient(format!("host {target} not responding")));
        }
        let vm = state.live_vm_mut(uid)?;
        if vm.node == target {
            return Err(RuntimeError::Rejected(format!("instance already on {target}")));
        }
        vm.transfer = Some(SimTransfer {
            target: target.to_string(),
            started: false,
            processed: 0,
            remaining: vm.memory_bytes,
        });
        Ok(format!("{target}.migration.local:49152"))
    }

    async fn start_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.live_vm_mut(uid)?;
        let transfer = vm
            .transfer
            .as_mut()
            .ok_or_else(|| RuntimeError::Rejected("no target prepared".to_string()))?;
        transfer.started = true;
        info!(instance_uid = %uid, target = %transfer.target, "[SIM] Transfer started");
        Ok(())
    }

    async fn migration_progress(&self, uid: InstanceUid) -> Result<TransferProgress, RuntimeError> {
        let mut state = self.state.lock().await;
        let behavior = state.migration_behavior;
        let vm = state.vm_mut(uid)?;
        let chunk = (vm.memory_bytes / 4).max(1);
        let transfer = vm
            .transfer
            .as_mut()
            .filter(|t| t.started)
            .ok_or_else(|| RuntimeError::Rejected("no transfer in progress".to_string()))?;

        let moved = match behavior {
            MigrationBehavior::Converge => {
                let moved = chunk.min(transfer.remaining);
                transfer.remaining -= moved;
                moved
            }
            MigrationBehavior::Stall => 0,
            MigrationBehavior::Hold => HOLD_CHUNK,
        };
        transfer.processed += moved;

        Ok(TransferProgress {
            data_processed_bytes: transfer.processed,
            data_remaining_bytes: transfer.remaining,
            bytes_per_second: moved,
            completed: transfer.remaining == 0,
        })
    }

    async fn abort_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(uid)?;
        if vm.transfer.take().is_some() {
            info!(instance_uid = %uid, "[SIM] Transfer aborted");
        }
        Ok(())
    }

    async fn finish_migration(&self, uid: InstanceUid) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;
        let vm = state.live_vm_mut(uid)?;
        match vm.transfer.take() {
            Some(transfer) if transfer.started && transfer.remaining == 0 => {
                info!(instance_uid = %uid, from = %vm.node, to = %transfer.target, "[SIM] Switched over");
                vm.node = transfer.target;
                Ok(())
            }
            other => {
                vm.transfer = other;
                Err(RuntimeError::Rejected("transfer not converged".to_string()))
            }
        }
    }
}
