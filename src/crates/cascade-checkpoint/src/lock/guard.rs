//! Lock guards and their release path

use super::registry::{LockKey, LockRegistry};
use crate::error::{CheckpointError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State behind a guard that actually holds a marker file
#[derive(Debug)]
pub(crate) struct HeldLock {
    key: LockKey,
    path: PathBuf,
    holder_id: u64,
    registry: Arc<LockRegistry>,
    /// `Some` while held; taken exactly once on release
    file: Mutex<Option<File>>,
    /// Watcher scope, present when bound to a cancellation token
    scope: Option<CancellationToken>,
}

impl HeldLock {
    pub(crate) fn new(
        key: LockKey,
        path: PathBuf,
        holder_id: u64,
        registry: Arc<LockRegistry>,
        file: File,
        scope: Option<CancellationToken>,
    ) -> Self {
        Self {
            key,
            path,
            holder_id,
            registry,
            file: Mutex::new(Some(file)),
            scope,
        }
    }

    fn is_held(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Release the lock; returns `false` if it was already released
    pub(crate) fn release(&self) -> Result<bool> {
        let Some(file) = self.file.lock().take() else {
            return Ok(false);
        };

        if let Some(scope) = &self.scope {
            scope.cancel();
        }
        drop(file);

        let removed = match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(key = %self.key, path = %self.path.display(), "Lock marker already gone");
                Ok(())
            }
            Err(e) => Err(CheckpointError::io(
                format!("removing lock marker {}", self.path.display()),
                e,
            )),
        };
        self.registry.release(&self.key, self.holder_id);

        debug!(key = %self.key, "Lock released");
        removed.map(|_| true)
    }

    /// Spawn the task that releases this lock when `scope` is cancelled.
    ///
    /// The task ends as soon as the lock is released by any path, since
    /// release cancels `scope` itself.
    pub(crate) fn spawn_watcher(self: &Arc<Self>) {
        let Some(scope) = self.scope.clone() else {
            return;
        };
        let held = Arc::clone(self);
        tokio::spawn(async move {
            scope.cancelled().await;
            match held.release() {
                Ok(true) => info!(key = %held.key, "Released lock after cancellation"),
                Ok(false) => {}
                Err(e) => warn!(key = %held.key, error = %e, "Failed to release lock after cancellation"),
            }
        });
    }
}

/// Proof of holding the lock for one `(module, version)`.
///
/// Released by [`LockGuard::release`] or on drop, whichever comes first. A
/// guard obtained with a cancellation token is also released when that token
/// fires; after that, work under the guard is no longer protected, which
/// [`LockGuard::is_held`] reports.
#[derive(Debug)]
pub struct LockGuard {
    key: LockKey,
    held: Option<Arc<HeldLock>>,
}

impl LockGuard {
    pub(crate) fn held(key: LockKey, held: Arc<HeldLock>) -> Self {
        Self {
            key,
            held: Some(held),
        }
    }

    /// Guard that protects nothing, handed out by [`super::NoopLocker`]
    pub(crate) fn detached(key: LockKey) -> Self {
        Self { key, held: None }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Marker file path, if this guard holds one
    pub fn marker_path(&self) -> Option<&Path> {
        self.held.as_ref().map(|held| held.path.as_path())
    }

    /// Whether the lock is still held
    pub fn is_held(&self) -> bool {
        self.held.as_ref().map_or(false, |held| held.is_held())
    }

    /// Start the cancellation watcher, if this guard is bound to a token
    pub(crate) fn watch(&self) {
        if let Some(held) = &self.held {
            held.spawn_watcher();
        }
    }

    /// Release the lock. Calling it again is a no-op.
    pub fn release(&self) -> Result<()> {
        match &self.held {
            Some(held) => held.release().map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(key = %self.key, error = %e, "Failed to release lock on drop");
        }
    }
}
