//! Temp scopes - native buffers and references that live for one native call

use crate::allocator::{AllocatorPort, Handle};
use crate::logging::{trace, warn};
use crate::store::ObjectStore;
use core::ptr::NonNull;

/// Pending releases for one call
///
/// Releasing frees every remembered buffer once and drops one reference per
/// remembered handle, then forgets them; a second release does nothing.
#[derive(Debug, Default)]
pub struct TempScope {
    buffers: Vec<NonNull<u8>>,
    objects: Vec<Handle>,
}

// Safety: a scope only carries addresses; it is released on the thread that
// filled it
unsafe impl Send for TempScope {}
unsafe impl Sync for TempScope {}

impl TempScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_buffer(&mut self, ptr: NonNull<u8>) {
        self.buffers.push(ptr);
    }

    /// Takes no reference; the one the caller holds is dropped on release
    pub fn remember_object(&mut self, handle: Handle) {
        self.objects.push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.objects.is_empty()
    }

    pub fn release(&mut self, store: &ObjectStore, allocator: &dyn AllocatorPort) {
        if self.is_empty() {
            return;
        }
        let buffers = std::mem::take(&mut self.buffers);
        let objects = std::mem::take(&mut self.objects);
        trace!(
            event = "free_temps",
            buffers = buffers.len(),
            objects = objects.len(),
            "releasing temp scope"
        );

        for ptr in buffers {
            allocator.free(ptr);
        }
        for handle in objects {
            if let Err(err) = store.dec_ref(handle) {
                warn!(event = "free_temps", handle = %handle, error = %err, "temp reference release failed");
            }
        }
    }
}
