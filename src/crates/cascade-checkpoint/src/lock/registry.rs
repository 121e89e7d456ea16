//! In-process lock registry
//!
//! Records which `(module, version)` keys are held by guards in this process.
//! A reservation is taken before any filesystem work so two tasks racing for
//! the same key never both reach the marker-file step.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub module: String,
    pub version: String,
}

impl LockKey {
    pub fn new(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.module, self.version)
    }
}

/// Owned registry of held keys, shared by every locker built on it
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<LockKey, u64>>,
    next_id: AtomicU64,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key`, returning a holder id, or `None` if already held
    pub fn reserve(&self, key: &LockKey) -> Option<u64> {
        let mut held = self.held.lock();
        if held.contains_key(key) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        held.insert(key.clone(), id);
        Some(id)
    }

    /// Drop the reservation for `key` if it still belongs to `id`
    pub fn release(&self, key: &LockKey, id: u64) -> bool {
        let mut held = self.held.lock();
        match held.get(key) {
            Some(current) if *current == id => {
                held.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
