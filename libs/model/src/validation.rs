//! Admission checks applied before an object enters the store.
//!
//! These are static preconditions: a rejected object never reaches a state
//! machine.

use std::collections::HashSet;

use crate::error::ApiError;
use crate::instance::Instance;
use crate::migration::MigrationRequest;
use crate::policy::RunPolicy;

/// Upper bound on object names (DNS label length).
pub const MAX_NAME_LEN: usize = 63;

/// Names are lowercase DNS labels: `[a-z0-9-]`, not starting or ending with
/// `-`.
pub fn validate_name(field: &str, name: &str) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::invalid(format!("{field} cannot be empty")));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ApiError::invalid(format!(
            "{field} cannot exceed {MAX_NAME_LEN} characters"
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ApiError::invalid(format!(
            "{field} must contain only lowercase letters, digits and '-'"
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(ApiError::invalid(format!(
            "{field} cannot start or end with '-'"
        )));
    }

    Ok(())
}

pub fn validate_run_policy(policy: &RunPolicy) -> Result<(), ApiError> {
    validate_name("namespace", &policy.meta.namespace)?;
    validate_name("name", &policy.meta.name)?;

    if policy.spec.running.is_some() && policy.spec.run_mode.is_some() {
        return Err(ApiError::invalid(
            "running and run_mode are mutually exclusive",
        ));
    }

    let template = &policy.spec.template;
    if template.memory_bytes == 0 {
        return Err(ApiError::invalid("template.memory_bytes must be positive"));
    }

    let mut seen = HashSet::new();
    for disk in &template.disks {
        validate_name("disk name", &disk.name)?;
        if !seen.insert(disk.name.as_str()) {
            return Err(ApiError::invalid(format!(
                "duplicate disk name {}",
                disk.name
            )));
        }
    }

    Ok(())
}

pub fn validate_migration_request(request: &MigrationRequest) -> Result<(), ApiError> {
    validate_name("namespace", &request.meta.namespace)?;
    validate_name("name", &request.meta.name)?;
    validate_name("instance_name", &request.spec.instance_name)?;

    if let Some(config) = &request.spec.config {
        if config.progress_timeout_secs == Some(0) {
            return Err(ApiError::invalid("progress_timeout_secs must be positive"));
        }
        if config.completion_timeout_per_gib_secs == Some(0) {
            return Err(ApiError::invalid(
                "completion_timeout_per_gib_secs must be positive",
            ));
        }
    }

    Ok(())
}

/// Whether `instance` can be relocated at all.
///
/// Fails with `DisksNotLiveMigratable` when any disk is node-local.
pub fn check_migratable(instance: &Instance) -> Result<(), ApiError> {
    match instance.spec.template.non_migratable_disk() {
        Some(disk) => Err(ApiError::disks_not_live_migratable(format!(
            "disk {} is ReadWriteOnce",
            disk.name
        ))),
        None => Ok(()),
    }
}
