//! Allocator doubles for tests and embedders that need to observe memory
//! traffic

use super::{AllocatorPort, HeapAllocator};
use core::ptr::NonNull;
use parking_lot::Mutex;

/// Heap allocator that records every allocation `(address, size)` and every
/// freed address
#[derive(Default)]
pub struct RecordingAllocator {
    heap: HeapAllocator,
    allocs: Mutex<Vec<(usize, usize)>>,
    frees: Mutex<Vec<usize>>,
}

impl RecordingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocs(&self) -> Vec<(usize, usize)> {
        self.allocs.lock().clone()
    }

    pub fn frees(&self) -> Vec<usize> {
        self.frees.lock().clone()
    }

    /// Size of the recorded allocation at `addr`
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.allocs
            .lock()
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, size)| *size)
    }

    pub fn was_freed(&self, addr: usize) -> bool {
        self.frees.lock().contains(&addr)
    }
}

impl AllocatorPort for RecordingAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.heap.alloc(size)?;
        self.allocs.lock().push((ptr.as_ptr() as usize, size));
        Some(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) {
        self.frees.lock().push(ptr.as_ptr() as usize);
        self.heap.free(ptr);
    }
}

/// Allocator whose `free` only records the address
///
/// Lets tests hand the bridge fabricated pointers to release.
#[derive(Default)]
pub struct InertAllocator {
    heap: HeapAllocator,
    frees: Mutex<Vec<usize>>,
}

impl InertAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frees(&self) -> Vec<usize> {
        self.frees.lock().clone()
    }
}

impl AllocatorPort for InertAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.alloc(size)
    }

    fn free(&self, ptr: NonNull<u8>) {
        self.frees.lock().push(ptr.as_ptr() as usize);
    }
}
