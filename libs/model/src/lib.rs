//! # vmctl-model
//!
//! The shared data model of the vmctl control system.
//!
//! Three object kinds live in the versioned store:
//!
//! - [`RunPolicy`]: declared intent for whether and how a machine's instance
//!   should exist. The source of truth for "should an instance exist".
//! - [`Instance`]: one concrete execution of a machine. Derived and
//!   ephemeral; its uid changes every time it is recreated.
//! - [`MigrationRequest`]: a request to relocate a running Instance to
//!   another host. Drives exactly one [`MigrationState`] on that Instance.
//!
//! The phase and condition vocabulary defined here is stable: collaborators
//! match on these values.
//!
//! Boundary errors are a closed [`ErrorKind`] enumeration with the human
//! reason carried separately in [`ApiError::message`].

mod error;
mod instance;
mod meta;
mod migration;
mod policy;
pub mod validation;

pub use error::{ApiError, ErrorKind};
pub use instance::*;
pub use meta::{ObjectKey, ObjectMeta, PhaseTransition, Resource};
pub use migration::*;
pub use policy::*;

pub use vmctl_id::{InstanceUid, MachineUid, MigrationUid, ResourceVersion};

/// Finalizer placed on every Instance by the node-side handler. The Instance
/// object disappears only after the handler has stopped its process.
pub const INSTANCE_FINALIZER: &str = "vmctl.dev/instance-protection";

/// Bytes in one GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;
