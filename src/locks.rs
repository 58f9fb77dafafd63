//! Lock table - native-visible locks behind opaque integer handles
//!
//! Locks are binary semaphores (flag + condvar), so any thread may release
//! a held lock. Handles come from a counter that starts at 1 and never
//! repeats; a freed handle stays invalid.

use crate::errors::{BridgeError, Result};
use crate::logging::{debug, trace, warn};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Opaque non-zero lock identifier handed to native code
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockHandle(usize);

impl LockHandle {
    pub const fn from_raw(raw: usize) -> Self {
        LockHandle(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct HostLock {
    locked: Mutex<bool>,
    cvar: Condvar,
}

impl HostLock {
    fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cvar.wait(&mut locked);
        }
        *locked = true;
    }

    fn release(&self) -> bool {
        let mut locked = self.locked.lock();
        if !*locked {
            return false;
        }
        *locked = false;
        self.cvar.notify_one();
        true
    }
}

pub struct LockTable {
    locks: DashMap<LockHandle, Arc<HostLock>>,
    next: AtomicUsize,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            next: AtomicUsize::new(1),
        }
    }

    /// Create an unlocked lock
    pub fn allocate(&self) -> LockHandle {
        let handle = LockHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.locks.insert(handle, Arc::new(HostLock::new()));
        debug!(event = "lock_allocate", lock = %handle, "lock allocated");
        handle
    }

    fn get(&self, handle: LockHandle) -> Result<Arc<HostLock>> {
        // Clone out so blocking never holds a map shard
        self.locks
            .get(&handle)
            .map(|lock| lock.value().clone())
            .ok_or(BridgeError::UnknownLock(handle))
    }

    /// Take the lock; with `blocking` false, report whether it was free
    pub fn acquire(&self, handle: LockHandle, blocking: bool) -> Result<bool> {
        let lock = self.get(handle)?;
        let acquired = if blocking {
            lock.acquire();
            true
        } else {
            lock.try_acquire()
        };
        trace!(event = "lock_acquire", lock = %handle, blocking, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Release a held lock; releasing a free lock changes nothing
    pub fn release(&self, handle: LockHandle) -> Result<()> {
        let lock = self.get(handle)?;
        if !lock.release() {
            warn!(event = "lock_release", lock = %handle, "release of an unlocked lock ignored");
        } else {
            trace!(event = "lock_release", lock = %handle, "lock released");
        }
        Ok(())
    }

    /// Destroy a lock; its handle is never valid again
    pub fn free(&self, handle: LockHandle) -> Result<()> {
        self.locks
            .remove(&handle)
            .ok_or(BridgeError::UnknownLock(handle))?;
        debug!(event = "lock_free", lock = %handle, "lock freed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_nonzero_and_unique() {
        let table = LockTable::new();
        let a = table.allocate();
        let b = table.allocate();
        assert_ne!(a.as_raw(), 0);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn nonblocking_acquire_reports_state() {
        let table = LockTable::new();
        let lock = table.allocate();

        assert!(table.acquire(lock, false).expect("acquire"));
        assert!(!table.acquire(lock, false).expect("second acquire"));

        table.release(lock).expect("release");
        assert!(table.acquire(lock, false).expect("reacquire"));
        table.release(lock).expect("release");
    }

    #[test]
    fn release_of_free_lock_is_harmless() {
        let table = LockTable::new();
        let lock = table.allocate();
        table.release(lock).expect("release");
        assert!(table.acquire(lock, false).expect("acquire"));
    }

    #[test]
    fn freed_handles_stay_invalid() {
        let table = LockTable::new();
        let lock = table.allocate();
        table.free(lock).expect("free");

        assert_eq!(table.acquire(lock, false), Err(BridgeError::UnknownLock(lock)));
        assert_eq!(table.release(lock), Err(BridgeError::UnknownLock(lock)));
        assert_eq!(table.free(lock), Err(BridgeError::UnknownLock(lock)));

        let next = table.allocate();
        assert_ne!(next, lock);
        assert!(!table.is_empty());
    }
}
