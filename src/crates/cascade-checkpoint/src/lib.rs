//! # cascade-checkpoint
//!
//! Durable checkpoints and advisory locking for cascading dependency
//! upgrades.
//!
//! A cascade run upgrades one module to a new version across many dependent
//! repositories. Each `(module, version)` pair gets:
//!
//! - a **summary** ([`Summary`]) describing the run as a whole
//! - one **item record** ([`ItemState`]) per repository, accumulating
//!   `attempts` and `command_logs` across saves
//! - an **advisory lock** ([`LockGuard`]) so only one process works on the
//!   pair at a time
//!
//! A run that crashes can reload its summary and item states, skip
//! repositories already completed, and retry the rest.
//!
//! ## Layout
//!
//! ```text
//! <state_root>/<module>/<version>/summary.json
//! <state_root>/<module>/<version>/items/<sha256(repo)>.json
//! <state_root>/<module>/<version>/.cascade.lock
//! ```
//!
//! The state root comes from [`CheckpointSettings`]: `CASCADE_STATE_DIR`, then
//! `$XDG_STATE_HOME/cascade`, then the user cache directory, then the system
//! temp directory.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cascade_checkpoint::{CheckpointManager, CheckpointSettings, ItemState, ItemStatus};
//!
//! # async fn run() -> cascade_checkpoint::Result<()> {
//! let manager = CheckpointManager::from_settings(&CheckpointSettings::from_env()?);
//!
//! let guard = manager.locker().acquire("github.com/acme/lib", "v1.4.0").await?;
//! let item = ItemState::new("github.com/acme/app", "cascade/lib-v1.4.0", ItemStatus::Completed)
//!     .with_pr_url("https://github.com/acme/app/pull/12");
//! let saved = manager
//!     .save_item_state("github.com/acme/lib", "v1.4.0", &item)
//!     .await?;
//! assert!(saved.attempts >= 1);
//! guard.release()?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod logger;
pub mod manager;
pub mod paths;
pub mod store;
mod validation;

// Re-export main types
pub use checkpoint::{CommandLog, ItemState, ItemStatus, StatusCounts, Summary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CheckpointSettings, StateRootSources};
pub use error::{CheckpointError, Result, ValidationError};
pub use lock::{BackoffPolicy, FileLocker, LockGuard, LockKey, LockRegistry, Locker, NoopLocker};
pub use logger::{Logger, NoopLogger, TracingLogger};
pub use manager::{CheckpointManager, CheckpointManagerBuilder};
pub use store::{CheckpointStore, FileStore, InMemoryStore, NoopStore, VersionEntry};
