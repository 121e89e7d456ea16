//! Input checks shared by the manager and the locker

use crate::checkpoint::ItemState;
use crate::error::ValidationError;

/// Trim and require a non-blank `(module, version)`
pub(crate) fn validate_key(module: &str, version: &str) -> Result<(String, String), ValidationError> {
    let module = module.trim();
    if module.is_empty() {
        return Err(ValidationError::ModuleRequired);
    }
    let version = version.trim();
    if version.is_empty() {
        return Err(ValidationError::VersionRequired);
    }
    Ok((module.to_string(), version.to_string()))
}

/// Require the identifying fields of an item
pub(crate) fn validate_item(item: &ItemState) -> Result<(), ValidationError> {
    if item.repo.trim().is_empty() {
        return Err(ValidationError::RepoRequired);
    }
    if item.branch.trim().is_empty() {
        return Err(ValidationError::BranchRequired);
    }
    Ok(())
}
