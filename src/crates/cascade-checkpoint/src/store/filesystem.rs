//! Filesystem checkpoint store
//!
//! Records are pretty-printed JSON. Every write goes to a hidden temporary
//! sibling, is fsynced, then renamed over the target, so a reader sees either
//! the previous complete file or the new complete file. A file that does not
//! decode is reported as `Corrupt` and left exactly as found.
//!
//! Files are created `0600` and directories `0700` on Unix; checkpoints can
//! carry PR URLs and command output.

use super::{merge_item, sort_items, CheckpointStore, VersionEntry};
use crate::checkpoint::{ItemState, Summary};
use crate::config::CheckpointSettings;
use crate::error::{CheckpointError, Result};
use crate::paths;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Store rooted at a state directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &CheckpointSettings) -> Self {
        Self::new(settings.state_root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::io(format!("reading {}", path.display()), e));
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        write_atomic(path, &body).await
    }
}

/// Write `body` to `path` through a temporary sibling and a rename
pub(crate) async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CheckpointError::Config(format!("no parent directory for {}", path.display())))?;
    create_private_dir(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CheckpointError::Config(format!("invalid file name {}", path.display())))?;
    let tmp = parent.join(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    if let Err(e) = write_synced(&tmp, body).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(CheckpointError::io(
            format!("renaming {} to {}", tmp.display(), path.display()),
            e,
        ));
    }
    Ok(())
}

async fn write_synced(path: &Path, body: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| CheckpointError::io(format!("creating {}", path.display()), e))?;
    file.write_all(body)
        .await
        .map_err(|e| CheckpointError::io(format!("writing {}", path.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| CheckpointError::io(format!("syncing {}", path.display()), e))?;
    Ok(())
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| CheckpointError::io(format!("creating directory {}", dir.display()), e))
}

fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && name.ends_with(".json")
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn load_summary(&self, module: &str, version: &str) -> Result<Summary> {
        let path = paths::summary_path(&self.root, module, version)?;
        Self::read_json(&path)
            .await?
            .ok_or_else(|| CheckpointError::not_found(module, version))
    }

    async fn save_summary(&self, summary: &Summary) -> Result<()> {
        let path = paths::summary_path(&self.root, &summary.module, &summary.version)?;
        Self::write_json(&path, summary).await?;
        debug!(path = %path.display(), items = summary.items.len(), "Summary written");
        Ok(())
    }

    async fn save_item_state(
        &self,
        module: &str,
        version: &str,
        item: &ItemState,
    ) -> Result<ItemState> {
        let path = paths::item_path(&self.root, module, version, &item.repo)?;
        let prior: Option<ItemState> = Self::read_json(&path).await?;
        let merged = merge_item(prior, item);
        Self::write_json(&path, &merged).await?;
        debug!(path = %path.display(), repo = %merged.repo, attempts = merged.attempts, "Item state written");
        Ok(merged)
    }

    async fn load_item_states(&self, module: &str, version: &str) -> Result<Vec<ItemState>> {
        let dir = paths::items_dir(&self.root, module, version)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::io(format!("listing {}", dir.display()), e));
            }
        };

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::io(format!("listing {}", dir.display()), e))?
        {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            if let Some(item) = Self::read_json::<ItemState>(&path).await? {
                items.push(item);
            }
        }

        sort_items(&mut items);
        Ok(items)
    }

    async fn list_versions(&self, module: &str) -> Result<Vec<VersionEntry>> {
        let module_dir = paths::push_segments(&self.root, module)?;
        let mut entries = match fs::read_dir(&module_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::io(
                    format!("listing {}", module_dir.display()),
                    e,
                ));
            }
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::io(format!("listing {}", module_dir.display()), e))?
        {
            let dir = entry.path();
            let Some(version) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() || paths::key_dir(&self.root, module, &version).is_err() {
                continue;
            }

            let summary_file = dir.join(paths::SUMMARY_FILE);
            let locked = fs::try_exists(dir.join(paths::LOCK_FILE)).await.unwrap_or(false);
            let has_items = fs::try_exists(dir.join(paths::ITEMS_DIR)).await.unwrap_or(false);
            let has_summary = fs::try_exists(&summary_file).await.unwrap_or(false);
            if !(locked || has_items || has_summary) {
                // Intermediate directory of a longer module path.
                continue;
            }

            let started_at = match Self::read_json::<Summary>(&summary_file).await {
                Ok(summary) => summary.map(|s| s.start_time),
                Err(e) => {
                    warn!(module = %module, version = %version, error = %e, "Unreadable summary while listing versions");
                    None
                }
            };
            let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);

            versions.push(VersionEntry {
                version,
                started_at,
                modified_at,
                locked,
            });
        }

        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(versions)
    }

    async fn remove_version(&self, module: &str, version: &str) -> Result<()> {
        let dir = paths::key_dir(&self.root, module, version)?;

        let items = dir.join(paths::ITEMS_DIR);
        match fs::remove_dir_all(&items).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CheckpointError::io(format!("removing {}", items.display()), e)),
        }

        // Summary plus any temporary siblings left by an interrupted write
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CheckpointError::io(format!("listing {}", dir.display()), e)),
        };
        let summary_tmp = format!(".{}.tmp.", paths::SUMMARY_FILE);
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CheckpointError::io(format!("listing {}", dir.display()), e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name != paths::SUMMARY_FILE && !name.starts_with(&summary_tmp) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(format!("removing {}", path.display()), e)),
            }
        }

        debug!(path = %dir.display(), "Version records removed");
        self.remove_empty_version(module, version).await
    }

    async fn remove_empty_version(&self, module: &str, version: &str) -> Result<()> {
        let dir = paths::key_dir(&self.root, module, version)?;
        // Only succeeds on an empty directory: a lock marker or a nested
        // module keeps it alive.
        match fs::remove_dir(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "Version directory removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!(path = %dir.display(), error = %e, "Version directory kept"),
        }
        Ok(())
    }
}
