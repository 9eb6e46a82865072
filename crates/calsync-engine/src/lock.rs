//! Per-subscription sync mutex.
//!
//! At most one sync runs per subscription at a time. Concurrent attempts
//! do not queue: a held lock makes the second caller skip the cycle
//! entirely. The guard releases on drop, so a panicking sync still frees
//! the key.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Builds the lock key for one subscription.
pub fn sync_lock_key(subscription_id: &str) -> String {
    format!("calendar-sync:{subscription_id}")
}

/// A held lock. Dropping it releases the key.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Wraps a release action to run when the guard drops.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Non-blocking mutual exclusion over string keys.
///
/// Deployments with several engine instances back this with a shared store
/// (e.g. Redis `SET NX`); [`MemoryLockManager`] covers a single process.
pub trait LockManager: Send + Sync {
    /// Acquires `key` if free, returning `None` when it is already held.
    fn try_acquire(&self, key: &str) -> Option<LockGuard>;
}

/// Process-local lock manager over a shared key set.
#[derive(Default, Clone)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for MemoryLockManager {
    fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        {
            let mut held = self.held.lock().ok()?;
            if !held.insert(key.to_string()) {
                return None;
            }
        }
        let held = Arc::clone(&self.held);
        let key = key.to_string();
        Some(LockGuard::new(move || {
            if let Ok(mut held) = held.lock() {
                held.remove(&key);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_drop() {
        let locks = MemoryLockManager::new();
        let key = sync_lock_key("sub-1");

        let guard = locks.try_acquire(&key);
        assert!(guard.is_some());
        assert!(locks.try_acquire(&key).is_none());

        drop(guard);
        assert!(locks.try_acquire(&key).is_some());
    }

    #[test]
    fn keys_are_independent() {
        let locks = MemoryLockManager::new();
        let _a = locks.try_acquire(&sync_lock_key("sub-a")).unwrap();
        assert!(locks.try_acquire(&sync_lock_key("sub-b")).is_some());
    }
}
