//! Native memory - the allocation port every shadow record goes through
//!
//! Design: the bridge never calls the system allocator directly. Everything
//! native code may later free with its own `free` goes through an
//! `AllocatorPort`, so tests can swap in a recording or inert allocator and
//! embedders can route memory to their own heap.

mod header;
pub mod testing;


pub use header::{Handle, ObjectHeader};

use crate::errors::{BridgeError, Result};
use crate::logging::trace;
use core::ptr::NonNull;

/// Pluggable native allocator
pub trait AllocatorPort: Send + Sync {
    /// Allocate `size` bytes suitably aligned for an `ObjectHeader`
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block previously returned by `alloc`
    fn free(&self, ptr: NonNull<u8>);
}

/// Default port backed by the C heap, so native code and the bridge agree on
/// who may free a block
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl AllocatorPort for HeapAllocator {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // malloc(0) may legally return null
        let ptr = unsafe { libc::malloc(size.max(1)) } as *mut u8;
        NonNull::new(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) }
    }
}

/// Allocate and zero a block through `port`
pub fn alloc_zeroed(port: &dyn AllocatorPort, size: usize) -> Result<NonNull<u8>> {
    let ptr = port.alloc(size).ok_or(BridgeError::Allocation { size })?;
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
    trace!(event = "allocation", size_bytes = size, address = ?ptr.as_ptr(), "native block allocated");
    Ok(ptr)
}

/// Allocate a fresh shadow record: zeroed, one reference, given type
pub fn alloc_record(
    port: &dyn AllocatorPort,
    size: usize,
    ob_type: *mut crate::types::descriptor::TypeDescriptor,
) -> Result<Handle> {
    let size = size.max(ObjectHeader::SIZE);
    let ptr = alloc_zeroed(port, size)?;
    let handle = Handle::from_raw(ptr.as_ptr());
    unsafe {
        handle.as_ptr().write(ObjectHeader::new(ob_type));
    }
    Ok(handle)
}
