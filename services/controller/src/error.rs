//! Errors raised inside the control loops.

use thiserror::Error;
use vmctl_model::{ApiError, ErrorKind};

use crate::runtime::RuntimeError;
use crate::store::StoreError;
use crate::tracker::TransitionError;

/// Failure of one reconciliation step for one object.
///
/// Loops log these and move on to the next object; nothing here aborts a
/// pass.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        ApiError::conflict(err.to_string())
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Transient(msg) => ApiError::new(ErrorKind::Unavailable, msg),
            RuntimeError::NotFound(_) => ApiError::not_running(),
            RuntimeError::Rejected(msg) => ApiError::conflict(msg),
            RuntimeError::AgentNotConnected => ApiError::agent_not_connected(),
            RuntimeError::NoRebootChannel => ApiError::neither_agent_nor_acpi(),
            RuntimeError::Paused => ApiError::paused(),
        }
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::Store(e) => e.into(),
            ControllerError::Runtime(e) => e.into(),
            ControllerError::Transition(e) => e.into(),
        }
    }
}
