//! Instance phase tracker.
//!
//! Owns the phase and condition set of one instance. Everything here is a
//! pure function over [`InstanceStatus`]; callers persist the result.
//!
//! ```text
//! Pending -> Scheduling -> Scheduled -> Running -> Succeeded
//!                                  \       |  \
//!                                   \   Unknown -> Failed
//!                                    `------------^
//! ```
//!
//! Any non-terminal phase may fail. Paused, frozen and agent state are side
//! states that only exist while Running.

use chrono::{DateTime, Utc};
use thiserror::Error;
use vmctl_model::{
    ApiError, ConditionStatus, ConditionType, FsFreezeStatus, Instance, InstanceStatus,
    InstanceTemplate, Phase, PhaseTransition, TerminationReason,
};

use crate::runtime::Observation;

/// Reason attached to the IsMigratable condition when it is false.
pub const DISKS_NOT_LIVE_MIGRATABLE: &str = "DisksNotLiveMigratable";

/// Rejected phase changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal phase transition {from} -> {to}")]
    Illegal { from: Phase, to: Phase },

    #[error("side state requires phase Running, instance is {phase}")]
    NotRunning { phase: Phase },
}

/// Whether the state machine allows `from -> to`.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Pending, Scheduling) | (Scheduling, Scheduled) | (Scheduled, Running) => true,
        (Running, Unknown) | (Unknown, Running) => true,
        (Running | Unknown, Succeeded) => true,
        (_, Failed) => true,
        _ => false,
    }
}

/// Move to `to`, appending a transition record. Returns whether the phase
/// changed.
pub fn transition(
    status: &mut InstanceStatus,
    to: Phase,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    if status.phase == to {
        return Ok(false);
    }
    if !can_transition(status.phase, to) {
        return Err(TransitionError::Illegal {
            from: status.phase,
            to,
        });
    }
    status.phase = to;
    status.phase_transition_timestamps.push(PhaseTransition {
        phase: to,
        timestamp: now,
    });
    Ok(true)
}

pub fn begin_scheduling(status: &mut InstanceStatus, now: DateTime<Utc>) -> Result<bool, TransitionError> {
    transition(status, Phase::Scheduling, now)
}

/// Bind to a host.
pub fn schedule(
    status: &mut InstanceStatus,
    node: &str,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    let changed = transition(status, Phase::Scheduled, now)?;
    status.node_name = Some(node.to_string());
    Ok(changed)
}

/// The runtime reports the process up.
pub fn mark_running(
    status: &mut InstanceStatus,
    template: &InstanceTemplate,
    agent_connected: bool,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    let changed = transition(status, Phase::Running, now)?;
    status.set_condition(ConditionType::Ready, ConditionStatus::True, None);
    status.set_condition(ConditionType::Synchronized, ConditionStatus::True, None);
    status.set_condition(
        ConditionType::AgentConnected,
        agent_connected.into(),
        None,
    );
    match template.non_migratable_disk() {
        Some(_) => status.set_condition(
            ConditionType::IsMigratable,
            ConditionStatus::False,
            Some(DISKS_NOT_LIVE_MIGRATABLE),
        ),
        None => status.set_condition(ConditionType::IsMigratable, ConditionStatus::True, None),
    }
    Ok(changed)
}

/// Host stopped reporting; the process may still be alive.
pub fn mark_unknown(status: &mut InstanceStatus, now: DateTime<Utc>) -> Result<bool, TransitionError> {
    let changed = transition(status, Phase::Unknown, now)?;
    status.set_condition(ConditionType::Ready, ConditionStatus::Unknown, Some("NodeUnreachable"));
    status.set_condition(ConditionType::Synchronized, ConditionStatus::False, None);
    Ok(changed)
}

/// Host reachable again after Unknown.
pub fn recover(status: &mut InstanceStatus, now: DateTime<Utc>) -> Result<bool, TransitionError> {
    let changed = transition(status, Phase::Running, now)?;
    if !status.is_true(ConditionType::Paused) {
        status.set_condition(ConditionType::Ready, ConditionStatus::True, None);
    }
    status.set_condition(ConditionType::Synchronized, ConditionStatus::True, None);
    Ok(changed)
}

/// Enter a terminal phase. Clean guest shutdown and deletion of a running
/// instance end in Succeeded; every other reason ends in Failed, whatever
/// the side states were.
pub fn terminate(
    status: &mut InstanceStatus,
    reason: TerminationReason,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<bool, TransitionError> {
    let target = match reason {
        TerminationReason::GuestShutdown => Phase::Succeeded,
        TerminationReason::Deleted if matches!(status.phase, Phase::Running | Phase::Unknown) => {
            Phase::Succeeded
        }
        _ => Phase::Failed,
    };
    let changed = transition(status, target, now)?;

    status.termination_reason = Some(reason);
    status.reason = Some(message.into());
    status.set_condition(ConditionType::Ready, ConditionStatus::False, Some("Terminated"));
    status.set_condition(ConditionType::AgentConnected, ConditionStatus::False, None);
    status.remove_condition(ConditionType::Paused);
    status.fs_freeze_status = FsFreezeStatus::Thawed;
    status.unfreeze_deadline = None;
    Ok(changed)
}

fn require_running(status: &InstanceStatus) -> Result<(), TransitionError> {
    if status.phase != Phase::Running {
        return Err(TransitionError::NotRunning {
            phase: status.phase,
        });
    }
    Ok(())
}

/// Toggle Paused. Pausing clears Ready; unpausing restores it. Repeating
/// the current state changes nothing.
pub fn set_paused(status: &mut InstanceStatus, paused: bool) -> Result<bool, TransitionError> {
    require_running(status)?;
    if status.is_true(ConditionType::Paused) == paused {
        return Ok(false);
    }
    if paused {
        status.set_condition(ConditionType::Paused, ConditionStatus::True, Some("PausedByUser"));
        status.set_condition(ConditionType::Ready, ConditionStatus::False, Some("Paused"));
    } else {
        status.remove_condition(ConditionType::Paused);
        status.set_condition(ConditionType::Ready, ConditionStatus::True, None);
    }
    Ok(true)
}

/// Record the guest filesystem freeze state. Thawing drops any deadline.
pub fn set_frozen(status: &mut InstanceStatus, frozen: bool) -> Result<bool, TransitionError> {
    require_running(status)?;
    let next = if frozen {
        FsFreezeStatus::Frozen
    } else {
        FsFreezeStatus::Thawed
    };
    if status.fs_freeze_status == next {
        return Ok(false);
    }
    status.fs_freeze_status = next;
    if !frozen {
        status.unfreeze_deadline = None;
    }
    Ok(true)
}

/// Whether the automatic unfreeze deadline has passed.
pub fn freeze_expired(status: &InstanceStatus, now: DateTime<Utc>) -> bool {
    status.fs_freeze_status == FsFreezeStatus::Frozen
        && status.unfreeze_deadline.is_some_and(|deadline| now >= deadline)
}

/// Fold a runtime observation of a running guest into the side states.
/// Returns whether anything changed.
pub fn apply_observation(
    status: &mut InstanceStatus,
    observation: &Observation,
) -> Result<bool, TransitionError> {
    require_running(status)?;
    let before = status.clone();

    status.set_condition(
        ConditionType::AgentConnected,
        observation.agent_connected.into(),
        None,
    );
    set_paused(status, observation.paused)?;
    set_frozen(status, observation.frozen)?;
    status.guest_reboot_count = observation.guest_reboot_count;

    Ok(*status != before)
}

// =============================================================================
// Action preconditions
// =============================================================================

/// The instance exists, is Running and is not being deleted.
pub fn check_running(instance: &Instance) -> Result<(), ApiError> {
    if instance.phase() != Phase::Running || instance.meta.is_terminating() {
        return Err(ApiError::not_running());
    }
    Ok(())
}

pub fn check_pause(instance: &Instance) -> Result<(), ApiError> {
    check_running(instance)?;
    if instance.is_paused() {
        return Err(ApiError::already_paused());
    }
    Ok(())
}

pub fn check_unpause(instance: &Instance) -> Result<(), ApiError> {
    check_running(instance)?;
    if !instance.is_paused() {
        return Err(ApiError::not_paused());
    }
    Ok(())
}

/// Freeze and unfreeze both go through the guest agent.
pub fn check_freeze(instance: &Instance) -> Result<(), ApiError> {
    check_running(instance)?;
    if !instance.status.is_true(ConditionType::AgentConnected) {
        return Err(ApiError::agent_not_connected());
    }
    Ok(())
}

pub fn check_soft_reboot(instance: &Instance) -> Result<(), ApiError> {
    check_running(instance)?;
    if instance.is_paused() {
        return Err(ApiError::paused());
    }
    let agent = instance.status.is_true(ConditionType::AgentConnected);
    if !agent && !instance.spec.template.acpi {
        return Err(ApiError::neither_agent_nor_acpi());
    }
    Ok(())
}
