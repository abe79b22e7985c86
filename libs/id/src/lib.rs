//! # vmctl-id
//!
//! Object identities for the vmctl control system.
//!
//! Every stored object has a `uid` that is assigned by the store when the
//! object is created and never reused. Names are user-chosen and may be
//! reused; uids are not. An Instance that is deleted and recreated under the
//! same name gets a fresh uid, which is how a replacement is detected.
//!
//! ## Format
//!
//! `{prefix}_{ulid}`, for example:
//! - `vm_01HV4Z2WQXKJNM8GPQY6VBKC3D` (run policy)
//! - `vmi_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (instance)
//! - `mig_01HV4Z4NYPLTRS0JTUA8XDME5F` (migration request / attempt)
//!
//! ULIDs are time-ordered, so uids of the same kind sort by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
