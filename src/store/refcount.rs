//! Reference counting - native-compatible counts kept in the record header
//!
//! The count lives in native memory so native code can read it, but every
//! bridge-side read or write happens under the store lock. The 1 -> 0
//! transition is claimed under the lock; finalization then runs unlocked.

use super::ObjectStore;
use crate::allocator::Handle;
use crate::errors::{BridgeError, Result};
use crate::logging::{debug, error, trace};

impl ObjectStore {
    /// Add one reference
    pub fn inc_ref(&self, handle: Handle) -> Result<()> {
        let state = self.state.lock();
        if !state.by_handle.contains_key(&handle) {
            return Err(BridgeError::NotFound(handle));
        }
        unsafe { handle.set_refcnt(handle.refcnt() + 1) };
        Ok(())
    }

    /// Drop one reference, finalizing the record when it was the last one
    pub fn dec_ref(&self, handle: Handle) -> Result<()> {
        let (epoch, ob_type) = {
            let mut state = self.state.lock();
            let binding = state
                .by_handle
                .get(&handle)
                .ok_or(BridgeError::NotFound(handle))?;
            let count = unsafe { handle.refcnt() };
            if count <= 0 {
                error!(event = "refcount_violation", handle = %handle, count, "decref below zero");
                return Err(BridgeError::RefCountViolation(handle));
            }
            unsafe { handle.set_refcnt(count - 1) };
            if count > 1 {
                return Ok(());
            }

            // Claimed: nobody can reach this record through the object now
            let epoch = binding.epoch;
            let identity = binding.obj.identity();
            state.unmap_identity(identity, handle);
            (epoch, unsafe { handle.type_ptr() })
        };

        self.finalize(handle, epoch, ob_type);
        Ok(())
    }

    /// Current count of a live record
    pub fn ref_count(&self, handle: Handle) -> Result<isize> {
        let state = self.state.lock();
        if !state.by_handle.contains_key(&handle) {
            return Err(BridgeError::NotFound(handle));
        }
        Ok(unsafe { handle.refcnt() })
    }

    /// Destroy slot, else free slot, else direct release
    #[cold]
    #[inline(never)]
    fn finalize(&self, handle: Handle, epoch: u64, ob_type: *mut crate::types::TypeDescriptor) {
        let slots = unsafe { ob_type.as_ref() }.map(|td| (td.tp_dealloc, td.tp_free));
        match slots {
            Some((Some(dealloc), _)) => {
                debug!(event = "finalize", handle = %handle, via = "tp_dealloc", "finalizing record");
                unsafe { dealloc(handle) };
            }
            Some((None, Some(free))) => {
                debug!(event = "finalize", handle = %handle, via = "tp_free", "finalizing record");
                unsafe { free(handle.as_void()) };
            }
            _ => {
                debug!(event = "finalize", handle = %handle, via = "allocator", "finalizing record");
                let binding = self.take_if_current(handle, epoch);
                if binding.is_some() {
                    self.release_memory(handle);
                }
                drop(binding);
                return;
            }
        }

        // Slots may have released the record already; drop what is left
        let leftover = self.take_if_current(handle, epoch);
        if leftover.is_some() {
            trace!(event = "finalize", handle = %handle, "binding dropped after slot finalizer");
        }
        drop(leftover);
    }

    fn take_if_current(&self, handle: Handle, epoch: u64) -> Option<super::Binding> {
        let mut state = self.state.lock();
        match state.by_handle.get(&handle) {
            Some(binding) if binding.epoch == epoch => state.unbind(handle),
            _ => None,
        }
    }
}
