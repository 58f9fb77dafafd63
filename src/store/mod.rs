//! Object store - bidirectional map between host objects and shadow records
//!
//! Design: one mutex guards both map directions and every refcount
//! read/write. Keys are object identity (the `Arc` address), never value
//! equality, so two equal strings get two records. Finalization of a record
//! whose count reached zero runs outside the lock (see `refcount.rs`), which
//! lets native destructors re-enter the store.

mod refcount;


use crate::allocator::{alloc_record, AllocatorPort, Handle, ObjectHeader};
use crate::errors::{BridgeError, Result};
use crate::host::{HostObject, Obj};
use crate::logging::trace;
use crate::types::descriptor::TypeDescriptor;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Chooses the native type (and so the record size) for a host object
pub trait TypeResolver: Send + Sync {
    /// Type pointer for the shadow record and the record's size in bytes
    fn resolve(&self, obj: &Obj) -> (*mut TypeDescriptor, usize);
}

/// Resolver for a store with no type table: untyped, header-sized records
#[derive(Debug, Default, Clone, Copy)]
pub struct Untyped;

impl TypeResolver for Untyped {
    fn resolve(&self, _obj: &Obj) -> (*mut TypeDescriptor, usize) {
        (std::ptr::null_mut(), ObjectHeader::SIZE)
    }
}

/// One live association; `epoch` tells a rebinding at a reused address apart
struct Binding {
    obj: Obj,
    epoch: u64,
}

#[derive(Default)]
struct StoreState {
    by_handle: HashMap<Handle, Binding>,
    by_identity: HashMap<usize, Handle>,
    epoch: u64,
}

impl StoreState {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            by_handle: HashMap::with_capacity(capacity),
            by_identity: HashMap::with_capacity(capacity),
            epoch: 0,
        }
    }

    /// Returns the binding this one displaced, to be dropped outside the lock
    fn bind(&mut self, handle: Handle, obj: Obj) -> Option<Binding> {
        self.epoch += 1;
        let identity = obj.identity();
        self.by_identity.insert(identity, handle);
        let previous = self.by_handle.insert(
            handle,
            Binding {
                obj,
                epoch: self.epoch,
            },
        );
        if let Some(old) = &previous {
            if old.obj.identity() != identity {
                self.unmap_identity(old.obj.identity(), handle);
            }
        }
        previous
    }

    fn unbind(&mut self, handle: Handle) -> Option<Binding> {
        let binding = self.by_handle.remove(&handle)?;
        self.unmap_identity(binding.obj.identity(), handle);
        Some(binding)
    }

    fn unmap_identity(&mut self, identity: usize, handle: Handle) {
        if self.by_identity.get(&identity) == Some(&handle) {
            self.by_identity.remove(&identity);
        }
    }
}

/// Handle <-> object store
pub struct ObjectStore {
    allocator: Arc<dyn AllocatorPort>,
    resolver: Arc<dyn TypeResolver>,
    state: Mutex<StoreState>,
}

impl ObjectStore {
    /// Store producing untyped records
    pub fn new(allocator: Arc<dyn AllocatorPort>) -> Self {
        Self::with_resolver(allocator, Arc::new(Untyped), 0)
    }

    pub fn with_resolver(
        allocator: Arc<dyn AllocatorPort>,
        resolver: Arc<dyn TypeResolver>,
        capacity: usize,
    ) -> Self {
        Self {
            allocator,
            resolver,
            state: Mutex::new(StoreState::with_capacity(capacity)),
        }
    }

    pub fn allocator(&self) -> &Arc<dyn AllocatorPort> {
        &self.allocator
    }

    /// Handle for `obj`, creating its shadow record on first use
    ///
    /// A live record gains one reference; a new record starts at one.
    pub fn store(&self, obj: &Obj) -> Result<Handle> {
        if let HostObject::Marker(_) = &**obj {
            return Err(BridgeError::TypeViolation(obj.type_name()));
        }

        let (ob_type, size) = self.resolver.resolve(obj);

        let mut state = self.state.lock();
        if let Some(&handle) = state.by_identity.get(&obj.identity()) {
            unsafe { handle.set_refcnt(handle.refcnt() + 1) };
            trace!(event = "store", handle = %handle, reused = true, "object already shadowed");
            return Ok(handle);
        }

        let handle = alloc_record(&*self.allocator, size, ob_type)?;
        state.bind(handle, obj.clone());
        drop(state);

        trace!(
            event = "store",
            handle = %handle,
            size_bytes = size,
            kind = %obj.type_name(),
            "shadow record created"
        );
        Ok(handle)
    }

    /// Associate caller-owned memory with `obj`
    ///
    /// No allocation, no refcount change. The object becomes reverse
    /// mappable, so a later `store` of it returns `handle`.
    pub fn store_unmanaged(&self, handle: Handle, obj: Obj) -> Result<()> {
        self.associate(handle, obj, "unmanaged")
    }

    /// Associate a record native code allocated for a new instance
    pub fn store_bridge(&self, handle: Handle, obj: Obj) -> Result<()> {
        self.associate(handle, obj, "bridge")
    }

    fn associate(&self, handle: Handle, obj: Obj, origin: &'static str) -> Result<()> {
        if handle.is_null() {
            return Err(BridgeError::NotFound(handle));
        }
        let displaced = self.state.lock().bind(handle, obj);
        trace!(event = "store", handle = %handle, origin, "record associated");
        drop(displaced);
        Ok(())
    }

    /// Object bound to `handle`
    pub fn retrieve(&self, handle: Handle) -> Result<Obj> {
        self.state
            .lock()
            .by_handle
            .get(&handle)
            .map(|b| b.obj.clone())
            .ok_or(BridgeError::NotFound(handle))
    }

    /// Handle currently shadowing `obj`, without touching its count
    pub fn lookup(&self, obj: &Obj) -> Option<Handle> {
        self.state.lock().by_identity.get(&obj.identity()).copied()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.state.lock().by_handle.contains_key(&handle)
    }

    /// Number of live bindings
    pub fn live_count(&self) -> usize {
        self.state.lock().by_handle.len()
    }

    /// Unbind `handle` and hand its memory back to the allocator
    pub fn free(&self, handle: Handle) -> Result<()> {
        let binding = self
            .state
            .lock()
            .unbind(handle)
            .ok_or(BridgeError::NotFound(handle))?;
        self.release_memory(handle);
        drop(binding);
        Ok(())
    }

    fn release_memory(&self, handle: Handle) {
        if let Some(ptr) = NonNull::new(handle.as_bytes()) {
            trace!(event = "deallocation", handle = %handle, "shadow record released");
            self.allocator.free(ptr);
        }
    }
}
