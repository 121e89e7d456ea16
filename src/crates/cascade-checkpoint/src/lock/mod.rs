//! Advisory locking per `(module, version)`
//!
//! A [`Locker`] hands out at most one live [`LockGuard`] per key. Three
//! acquisition modes are offered:
//!
//! - [`Locker::try_acquire`] - one attempt, fails with `Locked` on contention
//! - [`Locker::acquire`] - retries on `Locked` with [`BackoffPolicy`] delays
//! - [`Locker::acquire_with_cancel`] - like `acquire`, but the wait and the
//!   held lock are both bound to a [`CancellationToken`]
//!
//! Per key the lifecycle is `Unlocked -> Acquiring -> Held -> Released`, and a
//! released key is simply unlocked again. Only `Locked` is ever retried;
//! filesystem errors end the acquisition immediately.
//!
//! The lock is advisory: it protects the checkpoint tree only from
//! participants that also take it.

mod backoff;
mod file;
mod guard;
mod registry;

pub use backoff::BackoffPolicy;
pub use file::FileLocker;
pub use guard::LockGuard;
pub use registry::{LockKey, LockRegistry};

use crate::error::Result;
use crate::validation::validate_key;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Grants exclusive access to one `(module, version)` at a time
#[async_trait]
pub trait Locker: Send + Sync {
    /// Wait until the lock is acquired or a non-contention failure occurs
    async fn acquire(&self, module: &str, version: &str) -> Result<LockGuard>;

    /// Single attempt, never waits
    fn try_acquire(&self, module: &str, version: &str) -> Result<LockGuard>;

    /// Wait like [`Locker::acquire`], giving up with `Cancelled` when `cancel`
    /// fires. A lock obtained this way is released automatically once
    /// `cancel` fires while it is held.
    async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
        module: &str,
        version: &str,
    ) -> Result<LockGuard>;
}

/// Locker that grants everything and holds nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLocker;

#[async_trait]
impl Locker for NoopLocker {
    async fn acquire(&self, module: &str, version: &str) -> Result<LockGuard> {
        self.try_acquire(module, version)
    }

    fn try_acquire(&self, module: &str, version: &str) -> Result<LockGuard> {
        let (module, version) = validate_key(module, version)?;
        Ok(LockGuard::detached(LockKey::new(module, version)))
    }

    async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
        module: &str,
        version: &str,
    ) -> Result<LockGuard> {
        if cancel.is_cancelled() {
            return Err(crate::error::CheckpointError::cancelled(module.trim(), version.trim()));
        }
        self.try_acquire(module, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_locker_grants_repeatedly() {
        let locker = NoopLocker;
        let a = locker.try_acquire("lib", "v1").unwrap();
        let b = locker.acquire("lib", "v1").await.unwrap();
        assert!(!a.is_held());
        assert!(!b.is_held());
        assert!(a.marker_path().is_none());
        a.release().unwrap();
    }

    #[tokio::test]
    async fn test_noop_locker_honours_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(NoopLocker.acquire_with_cancel(&token, "lib", "v1").await.is_err());
    }
}
