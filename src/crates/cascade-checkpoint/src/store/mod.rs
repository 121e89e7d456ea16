//! Checkpoint persistence backends
//!
//! [`CheckpointStore`] is the seam between the [`crate::CheckpointManager`]
//! and wherever records live. Three implementations ship with the crate:
//!
//! - [`FileStore`] - JSON files under a state root, written atomically
//! - [`InMemoryStore`] - process-local, for tests and dry runs
//! - [`NoopStore`] - remembers nothing; the manager's default
//!
//! Every backend applies the same accumulation rule on
//! [`CheckpointStore::save_item_state`]: `attempts` becomes the prior value
//! plus one (1 on first save) and new command logs are appended to the prior
//! ones. Backends do no locking; a read-modify-write sequence is only safe
//! while the caller holds the key's lock.

mod filesystem;
mod memory;

pub use filesystem::FileStore;
pub use memory::{InMemoryStore, NoopStore};

use crate::checkpoint::{ItemState, Summary};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One stored version of a module, as seen by retention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: String,
    /// Start time from the summary, when one is readable
    pub started_at: Option<DateTime<Utc>>,
    /// Last modification of the version directory
    pub modified_at: Option<DateTime<Utc>>,
    /// Whether a lock marker is present
    pub locked: bool,
}

impl VersionEntry {
    /// Timestamp used to order versions, newest first
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.modified_at)
    }
}

/// Storage backend for checkpoint records
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the summary; `NotFound` if none was saved, `Corrupt` if undecodable
    async fn load_summary(&self, module: &str, version: &str) -> Result<Summary>;

    /// Replace the summary for `(summary.module, summary.version)`
    async fn save_summary(&self, summary: &Summary) -> Result<()>;

    /// Merge `item` into the stored record for its repo and return the result
    async fn save_item_state(&self, module: &str, version: &str, item: &ItemState)
        -> Result<ItemState>;

    /// All item records for the key; empty when none exist
    async fn load_item_states(&self, module: &str, version: &str) -> Result<Vec<ItemState>>;

    /// Versions stored for a module
    async fn list_versions(&self, module: &str) -> Result<Vec<VersionEntry>>;

    /// Delete the summary and item records for the key.
    ///
    /// A lock marker is left in place, so this is safe to call while holding
    /// the key's lock.
    async fn remove_version(&self, module: &str, version: &str) -> Result<()>;

    /// Drop whatever is left of the key once its records are gone, if
    /// nothing else lives there. Never fails on a non-empty version.
    async fn remove_empty_version(&self, _module: &str, _version: &str) -> Result<()> {
        Ok(())
    }
}

/// Apply the attempts/log accumulation rule
pub(crate) fn merge_item(prior: Option<ItemState>, incoming: &ItemState) -> ItemState {
    let mut merged = incoming.clone();
    match prior {
        Some(prior) => {
            merged.attempts = prior.attempts.saturating_add(1);
            let mut logs = prior.command_logs;
            logs.extend(incoming.command_logs.iter().cloned());
            merged.command_logs = logs;
        }
        None => merged.attempts = 1,
    }
    merged
}

/// Deterministic order for item listings
pub(crate) fn sort_items(items: &mut [ItemState]) {
    items.sort_by(|a, b| {
        a.last_updated
            .cmp(&b.last_updated)
            .then_with(|| a.repo.cmp(&b.repo))
    });
}
