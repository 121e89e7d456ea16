//! The checkpoint manager
//!
//! [`CheckpointManager`] is the entry point callers use. It validates and
//! normalizes input, stamps missing timestamps from its [`Clock`], reports
//! through its [`Logger`], and delegates persistence to a [`CheckpointStore`].
//!
//! Apart from [`CheckpointManager::prune`], the manager never locks. Callers
//! that save item state take the key's lock first, through the [`Locker`]
//! handed out by [`CheckpointManager::locker`]:
//!
//! ```rust,ignore
//! let manager = CheckpointManager::from_settings(&CheckpointSettings::from_env()?);
//! let guard = manager.locker().acquire("github.com/acme/lib", "v1.4.0").await?;
//! let saved = manager
//!     .save_item_state("github.com/acme/lib", "v1.4.0", &item)
//!     .await?;
//! guard.release()?;
//! ```

use crate::checkpoint::{ItemState, Summary};
use crate::clock::{Clock, SystemClock};
use crate::config::CheckpointSettings;
use crate::error::{CheckpointError, Result, ValidationError};
use crate::lock::{FileLocker, Locker, NoopLocker};
use crate::logger::{Logger, NoopLogger, TracingLogger};
use crate::store::{CheckpointStore, FileStore, NoopStore, VersionEntry};
use crate::validation::{validate_item, validate_key};
use std::cmp::Ordering;
use std::sync::Arc;

/// Validating front for a checkpoint store
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    locker: Arc<dyn Locker>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

impl Default for CheckpointManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CheckpointManager {
    pub fn builder() -> CheckpointManagerBuilder {
        CheckpointManagerBuilder::default()
    }

    /// Filesystem store and locker under `settings.state_root`, system clock,
    /// logging through `tracing`
    pub fn from_settings(settings: &CheckpointSettings) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::builder()
            .store(Arc::new(FileStore::from_settings(settings)))
            .locker(Arc::new(
                FileLocker::from_settings(settings).with_clock(Arc::clone(&clock)),
            ))
            .clock(clock)
            .logger(Arc::new(TracingLogger))
            .build()
    }

    /// The locker callers use to serialize work on a key
    pub fn locker(&self) -> Arc<dyn Locker> {
        Arc::clone(&self.locker)
    }

    pub fn store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.store)
    }

    /// Load the run summary for a key
    pub async fn load_summary(&self, module: &str, version: &str) -> Result<Summary> {
        let (module, version) = validate_key(module, version)?;
        self.logger.debug(
            "Loading summary",
            &[("module", &module), ("version", &version)],
        );

        let result = self.store.load_summary(&module, &version).await;
        if let Err(e) = &result {
            self.report_failure("Failed to load summary", &module, &version, e);
        }
        result
    }

    /// Persist a run summary, replacing any previous one for its key
    pub async fn save_summary(&self, summary: &Summary) -> Result<()> {
        let (module, version) = validate_key(&summary.module, &summary.version)?;
        let mut normalized = summary.clone();
        normalized.module = module;
        normalized.version = version;

        let items = normalized.items.len();
        self.logger.debug(
            "Saving summary",
            &[
                ("module", &normalized.module),
                ("version", &normalized.version),
                ("items", &items),
            ],
        );

        match self.store.save_summary(&normalized).await {
            Ok(()) => {
                self.logger.info(
                    "Summary saved",
                    &[
                        ("module", &normalized.module),
                        ("version", &normalized.version),
                        ("retry_count", &normalized.retry_count),
                    ],
                );
                Ok(())
            }
            Err(e) => {
                self.report_failure("Failed to save summary", &normalized.module, &normalized.version, &e);
                Err(e)
            }
        }
    }

    /// Record one repository's outcome and return the accumulated record.
    ///
    /// `last_updated` is stamped from the clock when the caller left it
    /// unset. The caller must hold the key's lock.
    pub async fn save_item_state(
        &self,
        module: &str,
        version: &str,
        item: &ItemState,
    ) -> Result<ItemState> {
        let (module, version) = validate_key(module, version)?;
        validate_item(item)?;

        let mut normalized = item.clone();
        if normalized.last_updated.is_none() {
            normalized.last_updated = Some(self.clock.now());
        }

        self.logger.debug(
            "Saving item state",
            &[
                ("module", &module),
                ("version", &version),
                ("repo", &normalized.repo),
                ("status", &normalized.status),
            ],
        );

        match self.store.save_item_state(&module, &version, &normalized).await {
            Ok(saved) => {
                self.logger.info(
                    "Item state saved",
                    &[
                        ("module", &module),
                        ("version", &version),
                        ("repo", &saved.repo),
                        ("status", &saved.status),
                        ("attempts", &saved.attempts),
                    ],
                );
                Ok(saved)
            }
            Err(e) => {
                self.report_failure("Failed to save item state", &module, &version, &e);
                Err(e)
            }
        }
    }

    /// All item records for a key, oldest update first
    pub async fn load_item_states(&self, module: &str, version: &str) -> Result<Vec<ItemState>> {
        let (module, version) = validate_key(module, version)?;
        self.logger.debug(
            "Loading item states",
            &[("module", &module), ("version", &version)],
        );

        match self.store.load_item_states(&module, &version).await {
            Ok(items) => {
                let count = items.len();
                self.logger.debug(
                    "Item states loaded",
                    &[("module", &module), ("version", &version), ("count", &count)],
                );
                Ok(items)
            }
            Err(e) => {
                self.report_failure("Failed to load item states", &module, &version, &e);
                Err(e)
            }
        }
    }

    /// Keep the `keep` most recent versions of `module` and remove the rest.
    ///
    /// Versions are ordered by summary start time, falling back to directory
    /// modification time. Each removal happens under the version's lock; a
    /// version that is locked, whether at listing time or when its turn
    /// comes, is skipped. Returns the removed version names.
    pub async fn prune(&self, module: &str, keep: usize) -> Result<Vec<String>> {
        if keep == 0 {
            return Err(ValidationError::InvalidKeepCount.into());
        }
        let module = module.trim();
        if module.is_empty() {
            return Err(ValidationError::ModuleRequired.into());
        }

        let mut versions = self.store.list_versions(module).await?;
        versions.sort_by(newest_first);

        let mut removed = Vec::new();
        for entry in versions.into_iter().skip(keep) {
            if entry.locked {
                self.logger.info(
                    "Skipping locked version",
                    &[("module", &module), ("version", &entry.version)],
                );
                continue;
            }

            let guard = match self.locker.try_acquire(module, &entry.version) {
                Ok(guard) => guard,
                Err(e) if e.is_retryable() => {
                    self.logger.info(
                        "Skipping locked version",
                        &[("module", &module), ("version", &entry.version)],
                    );
                    continue;
                }
                Err(e) => {
                    self.report_failure("Failed to lock version", module, &entry.version, &e);
                    return Err(e);
                }
            };

            // The marker stays until the guard is released
            if let Err(e) = self.store.remove_version(module, &entry.version).await {
                self.report_failure("Failed to remove version", module, &entry.version, &e);
                return Err(e);
            }
            guard.release()?;
            self.store.remove_empty_version(module, &entry.version).await?;

            self.logger.info(
                "Pruned version",
                &[("module", &module), ("version", &entry.version)],
            );
            removed.push(entry.version);
        }
        Ok(removed)
    }

    fn report_failure(&self, msg: &str, module: &str, version: &str, err: &CheckpointError) {
        if err.is_not_found() {
            self.logger.debug(msg, &[("module", &module), ("version", &version), ("error", err)]);
        } else {
            self.logger.error(msg, &[("module", &module), ("version", &version), ("error", err)]);
        }
    }
}

/// Newest first; undated versions last, ties broken by name descending
fn newest_first(a: &VersionEntry, b: &VersionEntry) -> Ordering {
    match (a.recency(), b.recency()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| b.version.cmp(&a.version))
}

/// Builder for [`CheckpointManager`]; unset collaborators get safe defaults
#[derive(Default)]
pub struct CheckpointManagerBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    locker: Option<Arc<dyn Locker>>,
    clock: Option<Arc<dyn Clock>>,
    logger: Option<Arc<dyn Logger>>,
}

impl CheckpointManagerBuilder {
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> CheckpointManager {
        CheckpointManager {
            store: self.store.unwrap_or_else(|| Arc::new(NoopStore)),
            locker: self.locker.unwrap_or_else(|| Arc::new(NoopLocker)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            logger: self.logger.unwrap_or_else(|| Arc::new(NoopLogger)),
        }
    }
}
