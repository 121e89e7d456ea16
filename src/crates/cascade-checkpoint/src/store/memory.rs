//! Process-local stores
//!
//! [`InMemoryStore`] keeps records in a shared map and applies the same
//! accumulation rule as [`super::FileStore`], which makes it a drop-in for
//! tests and dry runs. Records are lost when the last clone is dropped.
//!
//! [`NoopStore`] keeps nothing. Saves succeed, loads find nothing.

use super::{merge_item, sort_items, CheckpointStore, VersionEntry};
use crate::checkpoint::{ItemState, Summary};
use crate::error::{CheckpointError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
struct VersionRecords {
    summary: Option<Summary>,
    /// Keyed by repo
    items: BTreeMap<String, ItemState>,
}

type VersionStorage = Arc<RwLock<HashMap<(String, String), VersionRecords>>>;

fn storage_key(module: &str, version: &str) -> (String, String) {
    (module.to_string(), version.to_string())
}

/// In-memory checkpoint store; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    storage: VersionStorage,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(module, version)` keys with any record
    pub async fn version_count(&self) -> usize {
        self.storage.read().await.len()
    }

    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load_summary(&self, module: &str, version: &str) -> Result<Summary> {
        let storage = self.storage.read().await;
        storage
            .get(&storage_key(module, version))
            .and_then(|records| records.summary.clone())
            .ok_or_else(|| CheckpointError::not_found(module, version))
    }

    async fn save_summary(&self, summary: &Summary) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage
            .entry(storage_key(&summary.module, &summary.version))
            .or_default()
            .summary = Some(summary.clone());
        Ok(())
    }

    async fn save_item_state(
        &self,
        module: &str,
        version: &str,
        item: &ItemState,
    ) -> Result<ItemState> {
        let mut storage = self.storage.write().await;
        let records = storage.entry(storage_key(module, version)).or_default();
        let merged = merge_item(records.items.remove(&item.repo), item);
        records.items.insert(merged.repo.clone(), merged.clone());
        Ok(merged)
    }

    async fn load_item_states(&self, module: &str, version: &str) -> Result<Vec<ItemState>> {
        let storage = self.storage.read().await;
        let mut items: Vec<ItemState> = storage
            .get(&storage_key(module, version))
            .map(|records| records.items.values().cloned().collect())
            .unwrap_or_default();
        sort_items(&mut items);
        Ok(items)
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<VersionEntry>> {
        let storage = self.storage.read().await;
        let mut versions: Vec<VersionEntry> = storage
            .iter()
            .filter(|((m, _), _)| m == module)
            .map(|((_, version), records)| VersionEntry {
                version: version.clone(),
                started_at: records.summary.as_ref().map(|s| s.start_time),
                modified_at: None,
                locked: false,
            })
            .collect();
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    async fn remove_version(&self, module: &str, version: &str) -> Result<()> {
        self.storage.write().await.remove(&storage_key(module, version));
        Ok(())
    }
}

/// Store that persists nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl CheckpointStore for NoopStore {
    async fn load_summary(&self, module: &str, version: &str) -> Result<Summary> {
        Err(CheckpointError::not_found(module, version))
    }

    async fn save_summary(&self, _summary: &Summary) -> Result<()> {
        Ok(())
    }

    async fn save_item_state(
        &self,
        _module: &str,
        _version: &str,
        item: &ItemState,
    ) -> Result<ItemState> {
        Ok(merge_item(None, item))
    }

    async fn load_item_states(&self, _module: &str, _version: &str) -> Result<Vec<ItemState>> {
        Ok(Vec::new())
    }

    async fn list_versions(&self, _module: &str) -> Result<Vec<VersionEntry>> {
        Ok(Vec::new())
    }

    async fn remove_version(&self, _module: &str, _version: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CommandLog, ItemStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_and_load_summary() {
        let store = InMemoryStore::new();
        let summary = Summary::new("lib", "v1", Utc::now()).with_retry_count(2);
        store.save_summary(&summary).await.unwrap();

        assert_eq!(store.load_summary("lib", "v1").await.unwrap(), summary);
        assert!(store.load_summary("lib", "v2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = InMemoryStore::new();
        let other = store.clone();
        let item = ItemState::new("r", "b", ItemStatus::Failed)
            .with_command_log(CommandLog::new("make", "boom"));

        store.save_item_state("lib", "v1", &item).await.unwrap();
        let merged = other.save_item_state("lib", "v1", &item).await.unwrap();
        assert_eq!(merged.attempts, 2);
        assert_eq!(merged.command_logs.len(), 2);
        assert_eq!(store.version_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let store = InMemoryStore::new();
        store.save_summary(&Summary::new("lib", "v2", Utc::now())).await.unwrap();
        store
            .save_item_state("lib", "v1", &ItemState::new("r", "b", ItemStatus::Completed))
            .await
            .unwrap();
        store.save_summary(&Summary::new("other", "v1", Utc::now())).await.unwrap();

        let versions = store.list_versions("lib").await.unwrap();
        let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(names, vec!["v1", "v2"]);
        assert!(versions[0].started_at.is_none());
        assert!(versions[1].started_at.is_some());

        store.remove_version("lib", "v1").await.unwrap();
        assert!(store.load_item_states("lib", "v1").await.unwrap().is_empty());

        store.clear().await;
        assert_eq!(store.version_count().await, 0);
    }

    #[tokio::test]
    async fn test_noop_store_remembers_nothing() {
        let store = NoopStore;
        let item = ItemState::new("r", "b", ItemStatus::Completed);
        assert_eq!(store.save_item_state("lib", "v1", &item).await.unwrap().attempts, 1);
        assert_eq!(store.save_item_state("lib", "v1", &item).await.unwrap().attempts, 1);
        assert!(store.load_item_states("lib", "v1").await.unwrap().is_empty());
        store.save_summary(&Summary::new("lib", "v1", Utc::now())).await.unwrap();
        assert!(store.load_summary("lib", "v1").await.unwrap_err().is_not_found());
    }
}
