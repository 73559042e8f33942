//! Keyed exclusive sections and cooperative cancellation.

use crate::error::{MdmError, Result};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exclusive sections keyed by value.
///
/// Multi-key acquisition always proceeds in ascending key order, so two
/// callers locking overlapping key sets cannot deadlock.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    held: Mutex<FxHashSet<K>>,
    released: Condvar,
}

impl<K: Eq + Hash + Ord + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(FxHashSet::default()),
            released: Condvar::new(),
        }
    }

    /// Block until the section for `key` is free, then hold it
    pub fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let mut held = self.held.lock();
        while held.contains(key) {
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        KeyedGuard {
            owner: self,
            keys: vec![key.clone()],
        }
    }

    /// Hold every section in `keys`, acquired in ascending order
    pub fn lock_all(&self, keys: impl IntoIterator<Item = K>) -> KeyedGuard<'_, K> {
        let mut guard = KeyedGuard {
            owner: self,
            keys: Vec::new(),
        };
        for key in sorted_unique(keys) {
            let mut single = self.lock(&key);
            guard.keys.append(&mut single.keys);
        }
        guard
    }

    /// Like [`lock_all`](Self::lock_all) but gives up after `timeout`.
    ///
    /// On failure nothing stays held and the busy key is returned.
    pub fn try_lock_all_for(
        &self,
        keys: impl IntoIterator<Item = K>,
        timeout: Duration,
    ) -> std::result::Result<KeyedGuard<'_, K>, K> {
        let deadline = Instant::now() + timeout;
        let mut guard = KeyedGuard {
            owner: self,
            keys: Vec::new(),
        };
        for key in sorted_unique(keys) {
            let mut held = self.held.lock();
            while held.contains(&key) {
                if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&key)
                {
                    return Err(key);
                }
            }
            held.insert(key.clone());
            guard.keys.push(key);
        }
        Ok(guard)
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.held.lock().contains(key)
    }
}

impl<K: Eq + Hash + Ord + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_unique<K: Ord>(keys: impl IntoIterator<Item = K>) -> Vec<K> {
    let mut keys: Vec<K> = keys.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Sections held by one caller; released on drop
#[derive(Debug)]
pub struct KeyedGuard<'a, K: Eq + Hash + Ord + Clone> {
    owner: &'a KeyedLocks<K>,
    keys: Vec<K>,
}

impl<K: Eq + Hash + Ord + Clone> KeyedGuard<'_, K> {
    pub fn keys(&self) -> &[K] {
        &self.keys
    }
}

impl<K: Eq + Hash + Ord + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut held = self.owner.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.owner.released.notify_all();
    }
}

/// Shared cancellation flag checked cooperatively by background work
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Cancellation plus deadline for a single unit of work
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancelToken,
    started: Instant,
    timeout: Duration,
}

impl TaskContext {
    pub fn new(cancel: CancelToken, timeout: Duration) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            timeout,
        }
    }

    /// Context that never times out and is never cancelled
    pub fn unbounded() -> Self {
        Self::new(CancelToken::new(), Duration::MAX)
    }

    /// Fail if the task was cancelled or ran past its deadline
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MdmError::Cancelled);
        }
        if self.started.elapsed() > self.timeout {
            return Err(MdmError::TimedOut(self.timeout));
        }
        Ok(())
    }
}
