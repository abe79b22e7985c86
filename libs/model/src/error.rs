//! Boundary error classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds surfaced to callers.
///
/// Callers branch on the kind; the accompanying message is for humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Start requested while a non-terminal instance exists.
    AlreadyRunning,
    /// Action requires a running instance and there is none.
    NotRunning,
    /// Action requires a connected guest agent.
    AgentNotConnected,
    /// Soft reboot needs either a connected agent or ACPI.
    NeitherAgentNorACPI,
    /// Action is not allowed while the instance is paused.
    VMIPaused,
    /// Pause requested on an already paused instance.
    AlreadyPaused,
    /// Unpause requested on an instance that is not paused.
    NotPaused,
    /// Migration rejected: the instance has storage that cannot move.
    DisksNotLiveMigratable,
    NotFound,
    AlreadyExists,
    /// Stale resource version or competing in-flight operation.
    Conflict,
    /// Malformed request or desired-state combination.
    Invalid,
    /// A caller-side bounded wait expired.
    Timeout,
    /// Transient infrastructure failure that outlived its retries.
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "AlreadyRunning",
            Self::NotRunning => "NotRunning",
            Self::AgentNotConnected => "AgentNotConnected",
            Self::NeitherAgentNorACPI => "NeitherAgentNorACPI",
            Self::VMIPaused => "VMIPaused",
            Self::AlreadyPaused => "AlreadyPaused",
            Self::NotPaused => "NotPaused",
            Self::DisksNotLiveMigratable => "DisksNotLiveMigratable",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Conflict => "Conflict",
            Self::Invalid => "Invalid",
            Self::Timeout => "Timeout",
            Self::Unavailable => "Unavailable",
            Self::Internal => "Internal",
        }
    }

    /// Conflict-class errors reflect caller intent and are never retried
    /// automatically.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::AlreadyRunning | Self::NotRunning | Self::AlreadyExists
        )
    }

    /// Errors rejected before any state machine is entered.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Invalid
                | Self::DisksNotLiveMigratable
                | Self::AgentNotConnected
                | Self::NeitherAgentNorACPI
                | Self::VMIPaused
                | Self::AlreadyPaused
                | Self::NotPaused
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected action: machine-readable kind plus human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn already_running() -> Self {
        Self::new(ErrorKind::AlreadyRunning, "VM is already running")
    }

    pub fn not_running() -> Self {
        Self::new(ErrorKind::NotRunning, "VM is not running")
    }

    pub fn agent_not_connected() -> Self {
        Self::new(
            ErrorKind::AgentNotConnected,
            "VMI does not have the guest agent connected",
        )
    }

    pub fn neither_agent_nor_acpi() -> Self {
        Self::new(
            ErrorKind::NeitherAgentNorACPI,
            "VMI neither has the guest agent connected nor the ACPI feature enabled",
        )
    }

    pub fn paused() -> Self {
        Self::new(ErrorKind::VMIPaused, "VMI is paused")
    }

    pub fn already_paused() -> Self {
        Self::new(ErrorKind::AlreadyPaused, "VMI is already paused")
    }

    pub fn not_paused() -> Self {
        Self::new(ErrorKind::NotPaused, "VMI is not paused")
    }

    pub fn disks_not_live_migratable(detail: impl AsRef<str>) -> Self {
        Self::new(
            ErrorKind::DisksNotLiveMigratable,
            format!(
                "cannot migrate VMI: {}; live migration requires all disks on shared (ReadWriteMany) storage",
                detail.as_ref()
            ),
        )
    }

    pub fn not_found(kind: &str, key: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{kind} {key} not found"))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}
