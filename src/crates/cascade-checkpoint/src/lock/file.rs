//! Marker-file locker
//!
//! Mutual exclusion has two layers. Inside a process the [`LockRegistry`]
//! reservation is taken first. Across processes the marker file
//! `<root>/<module>/<version>/.cascade.lock` is created with `create_new`, so
//! of two racing processes exactly one succeeds.

use super::backoff::BackoffPolicy;
use super::guard::{HeldLock, LockGuard};
use super::registry::{LockKey, LockRegistry};
use super::Locker;
use crate::clock::{Clock, SystemClock};
use crate::config::CheckpointSettings;
use crate::error::{CheckpointError, Result};
use crate::paths;
use crate::validation::validate_key;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Advisory locker backed by marker files under the state root
pub struct FileLocker {
    root: PathBuf,
    registry: Arc<LockRegistry>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl FileLocker {
    /// Locker with its own registry, default backoff and the system clock
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: Arc::new(LockRegistry::new()),
            backoff: BackoffPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_settings(settings: &CheckpointSettings) -> Self {
        Self::new(settings.state_root.clone()).with_backoff(settings.backoff)
    }

    /// Share a registry with other lockers in this process
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Raw diagnostic contents of the marker for a key, if one exists
    pub fn read_marker(&self, module: &str, version: &str) -> Result<Option<String>> {
        let (module, version) = validate_key(module, version)?;
        let path = paths::lock_path(&self.root, &module, &version)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::io(
                format!("reading lock marker {}", path.display()),
                e,
            )),
        }
    }

    fn claim(
        &self,
        module: &str,
        version: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Claim> {
        let content = format!(
            "pid:{}\ntime:{}\nmodule:{}\nversion:{}\n",
            std::process::id(),
            self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true),
            module,
            version
        );
        Ok(Claim {
            key: LockKey::new(module, version),
            path: paths::lock_path(&self.root, module, version)?,
            content,
            registry: Arc::clone(&self.registry),
            scope: cancel.map(CancellationToken::child_token),
        })
    }

    /// One attempt on the calling thread
    fn attempt(&self, module: &str, version: &str) -> Result<LockGuard> {
        let guard = self.claim(module, version, None)?.run()?;
        debug!(key = %guard.key(), "Lock acquired");
        Ok(guard)
    }

    /// One attempt with the marker I/O on the blocking pool.
    ///
    /// If this future is dropped mid-attempt, the claimed guard is dropped
    /// where it lands and releases itself.
    async fn attempt_async(
        &self,
        module: &str,
        version: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<LockGuard> {
        let claim = self.claim(module, version, cancel)?;
        let key = claim.key.clone();
        let guard = tokio::task::spawn_blocking(move || claim.run())
            .await
            .map_err(|e| CheckpointError::io(format!("claiming lock {}", key), e.into()))??;
        guard.watch();
        debug!(key = %key, "Lock acquired");
        Ok(guard)
    }

    /// Retry on contention until acquired, cancelled, or a hard failure
    async fn acquire_loop(
        &self,
        cancel: Option<&CancellationToken>,
        module: &str,
        version: &str,
    ) -> Result<LockGuard> {
        let (module, version) = validate_key(module, version)?;
        let mut attempt: u32 = 0;

        loop {
            if cancel.map_or(false, CancellationToken::is_cancelled) {
                return Err(CheckpointError::cancelled(&module, &version));
            }

            match self.attempt_async(&module, &version, cancel).await {
                Ok(guard) => {
                    if attempt > 0 {
                        info!(module = %module, version = %version, attempts = attempt + 1, "Lock acquired after contention");
                    }
                    return Ok(guard);
                }
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(module = %module, version = %version, attempt, delay_ms = delay.as_millis() as u64, "Lock busy, backing off");

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(CheckpointError::cancelled(&module, &version));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[async_trait]
impl Locker for FileLocker {
    async fn acquire(&self, module: &str, version: &str) -> Result<LockGuard> {
        self.acquire_loop(None, module, version).await
    }

    fn try_acquire(&self, module: &str, version: &str) -> Result<LockGuard> {
        let (module, version) = validate_key(module, version)?;
        self.attempt(&module, &version)
    }

    async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
        module: &str,
        version: &str,
    ) -> Result<LockGuard> {
        self.acquire_loop(Some(cancel), module, version).await
    }
}

/// An owned acquisition attempt that can run on any thread
struct Claim {
    key: LockKey,
    path: PathBuf,
    content: String,
    registry: Arc<LockRegistry>,
    scope: Option<CancellationToken>,
}

impl Claim {
    /// Reserve the key, then create the marker. The returned guard has no
    /// watcher yet.
    fn run(self) -> Result<LockGuard> {
        let holder_id = self
            .registry
            .reserve(&self.key)
            .ok_or_else(|| CheckpointError::locked(&self.key.module, &self.key.version))?;

        let file = match self.create_marker() {
            Ok(file) => file,
            Err(e) => {
                self.registry.release(&self.key, holder_id);
                return Err(e);
            }
        };

        let held = Arc::new(HeldLock::new(
            self.key.clone(),
            self.path,
            holder_id,
            self.registry,
            file,
            self.scope,
        ));
        Ok(LockGuard::held(self.key, held))
    }

    fn create_marker(&self) -> Result<File> {
        let path = &self.path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CheckpointError::io(format!("creating lock directory {}", parent.display()), e)
            })?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = match options.open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CheckpointError::locked(&self.key.module, &self.key.version));
            }
            Err(e) => {
                return Err(CheckpointError::io(
                    format!("creating lock marker {}", path.display()),
                    e,
                ));
            }
        };

        if let Err(e) = file
            .write_all(self.content.as_bytes())
            .and_then(|_| file.sync_all())
        {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(CheckpointError::io(
                format!("writing lock marker {}", path.display()),
                e,
            ));
        }

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ValidationError;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn test_marker_content() {
        let dir = TempDir::new().unwrap();
        let at = DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let locker = FileLocker::new(dir.path()).with_clock(Arc::new(ManualClock::new(at)));

        let guard = locker.try_acquire("github.com/acme/lib", "v1.2.0").unwrap();
        let content = locker.read_marker("github.com/acme/lib", "v1.2.0").unwrap().unwrap();
        assert_eq!(
            content,
            format!(
                "pid:{}\ntime:2024-06-01T08:00:00Z\nmodule:github.com/acme/lib\nversion:v1.2.0\n",
                std::process::id()
            )
        );
        assert_eq!(
            guard.marker_path().unwrap(),
            dir.path().join("github.com/acme/lib/v1.2.0/.cascade.lock")
        );

        guard.release().unwrap();
        assert!(locker.read_marker("github.com/acme/lib", "v1.2.0").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_marker_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path());
        let guard = locker.try_acquire("lib", "v1").unwrap();
        let mode = fs::metadata(guard.marker_path().unwrap()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_existing_marker_means_locked() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("lib/v1/.cascade.lock");
        fs::create_dir_all(marker.parent().unwrap()).unwrap();
        fs::write(&marker, "pid:1\n").unwrap();

        let locker = FileLocker::new(dir.path());
        let err = locker.try_acquire("lib", "v1").unwrap_err();
        assert!(matches!(err, CheckpointError::Locked { .. }));
        // A failed attempt leaves no registry entry and does not touch the marker.
        assert!(locker.registry().is_empty());
        assert_eq!(fs::read_to_string(&marker).unwrap(), "pid:1\n");
    }

    #[test]
    fn test_blank_key_rejected_before_filesystem() {
        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path().join("never"));
        let err = locker.try_acquire("  ", "v1").unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Validation(ValidationError::ModuleRequired)
        ));
        assert!(!dir.path().join("never").exists());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path());
        let guard = locker.try_acquire("lib", "v1").unwrap();
        assert!(guard.is_held());

        guard.release().unwrap();
        guard.release().unwrap();
        assert!(!guard.is_held());
        assert!(locker.registry().is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path());
        {
            let _guard = locker.try_acquire("lib", "v1").unwrap();
            assert!(locker.try_acquire("lib", "v1").is_err());
        }
        let again = locker.try_acquire("lib", "v1").unwrap();
        assert!(again.is_held());
    }

    #[test]
    fn test_io_failure_is_not_locked() {
        let dir = TempDir::new().unwrap();
        // A regular file where the module directory should go.
        fs::write(dir.path().join("lib"), "").unwrap();

        let locker = FileLocker::new(dir.path());
        let err = locker.try_acquire("lib", "v1").unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
        assert!(!err.is_retryable());
        assert!(locker.registry().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(FileLocker::new(dir.path()).with_backoff(fast_backoff()));
        let first = locker.try_acquire("lib", "v1").unwrap();

        let waiter = {
            let locker = Arc::clone(&locker);
            tokio::spawn(async move { locker.acquire("lib", "v1").await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        first.release().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn test_acquire_surfaces_hard_failures() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("lib"), "").unwrap();
        let locker = FileLocker::new(dir.path()).with_backoff(fast_backoff());

        let result = tokio::time::timeout(Duration::from_secs(1), locker.acquire("lib", "v1"))
            .await
            .unwrap();
        assert!(matches!(result, Err(CheckpointError::Io { .. })));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_fails_fast() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("state");
        let locker = FileLocker::new(&root);
        let token = CancellationToken::new();
        token.cancel();

        let err = locker.acquire_with_cancel(&token, "lib", "v1").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Cancelled { .. }));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(FileLocker::new(dir.path()).with_backoff(fast_backoff()));
        let _held = locker.try_acquire("lib", "v1").unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let locker = Arc::clone(&locker);
            let token = token.clone();
            tokio::spawn(async move { locker.acquire_with_cancel(&token, "lib", "v1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CheckpointError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_cancel_after_acquire_releases() {
        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path());
        let token = CancellationToken::new();

        let guard = locker.acquire_with_cancel(&token, "lib", "v1").await.unwrap();
        assert!(guard.is_held());

        token.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while guard.is_held() {
            assert!(tokio::time::Instant::now() < deadline, "watcher did not release");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let fresh = locker.try_acquire("lib", "v1").unwrap();
        assert!(fresh.is_held());
        // The stale guard must not disturb the new holder.
        guard.release().unwrap();
        assert!(fresh.is_held());
        assert!(locker.read_marker("lib", "v1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abandoned_acquire_cleans_up() {
        use futures::FutureExt;

        let dir = TempDir::new().unwrap();
        let locker = FileLocker::new(dir.path()).with_backoff(fast_backoff());
        let marker = dir.path().join("lib/v1/.cascade.lock");

        // Poll once and drop, possibly while the marker is being written.
        drop(locker.acquire("lib", "v1").now_or_never());

        let guard = tokio::time::timeout(Duration::from_secs(2), locker.acquire("lib", "v1"))
            .await
            .unwrap()
            .unwrap();
        assert!(guard.is_held());
        guard.release().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !locker.registry().is_empty() || marker.exists() {
            assert!(tokio::time::Instant::now() < deadline, "abandoned attempt left a lock");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_async_acquire_writes_marker() {
        let dir = TempDir::new().unwrap();
        let at = DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let locker = FileLocker::new(dir.path()).with_clock(Arc::new(ManualClock::new(at)));

        let guard = locker.acquire("lib", "v2").await.unwrap();
        let content = locker.read_marker("lib", "v2").unwrap().unwrap();
        assert!(content.contains("time:2024-06-01T08:00:00Z\n"), "{}", content);
        assert!(locker.registry().is_held(&LockKey::new("lib", "v2")));
        assert!(matches!(
            locker.try_acquire("lib", "v2"),
            Err(CheckpointError::Locked { .. })
        ));
        drop(guard);
        assert!(locker.read_marker("lib", "v2").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_is_followed() {
        let dir = TempDir::new().unwrap();
        let locker = Arc::new(FileLocker::new(dir.path()));
        let held = locker.try_acquire("lib", "v1").unwrap();

        let started = tokio::time::Instant::now();
        let waiter = {
            let locker = Arc::clone(&locker);
            tokio::spawn(async move { locker.acquire("lib", "v1").await })
        };

        // Default schedule: attempts at 0, 100, 250, 450ms.
        tokio::time::sleep(Duration::from_millis(300)).await;
        held.release().unwrap();

        let guard = waiter.await.unwrap().unwrap();
        assert!(guard.is_held());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(450), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }
}
