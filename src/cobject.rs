//! Opaque native pointers - records that carry a `void*` plus an optional
//! destructor through the host untouched

use crate::allocator::{alloc_record, Handle, ObjectHeader};
use crate::bridge::Bridge;
use crate::errors::{BridgeError, HostError, Result};
use crate::host::{HostObject, Obj};
use crate::logging::trace;
use std::ffi::c_void;

pub type CObjectDestructor = unsafe extern "C" fn(*mut c_void);

/// Native layout of an opaque pointer record
#[repr(C)]
pub struct CObjectRecord {
    pub ob_base: ObjectHeader,
    pub data: *mut c_void,
    pub destructor: Option<CObjectDestructor>,
}

/// Host view of an opaque pointer record; the record owns the data
#[derive(Debug)]
pub struct OpaquePointer {
    handle: Handle,
}

impl OpaquePointer {
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

/// Wrap `data` in a new record with one reference, owned by the caller
pub fn from_void_ptr(
    bridge: &Bridge,
    data: *mut c_void,
    destructor: Option<CObjectDestructor>,
) -> Result<Handle> {
    let ty = bridge.types().cobject_type();
    let handle = alloc_record(
        &**bridge.allocator(),
        std::mem::size_of::<CObjectRecord>(),
        ty.as_type(),
    )?;
    unsafe {
        let record = handle.as_ptr() as *mut CObjectRecord;
        (*record).data = data;
        (*record).destructor = destructor;
    }
    let view = Obj::new(HostObject::Opaque(OpaquePointer { handle }));
    bridge.object_store().store_bridge(handle, view)?;
    trace!(event = "cobject_new", handle = %handle, data = ?data, "opaque pointer wrapped");
    Ok(handle)
}

/// Pointer carried by a live opaque record
pub fn as_void_ptr(bridge: &Bridge, handle: Handle) -> Result<*mut c_void> {
    let obj = bridge.retrieve(handle)?;
    match &*obj {
        HostObject::Opaque(_) => Ok(unsafe { (*(handle.as_ptr() as *mut CObjectRecord)).data }),
        _ => Err(BridgeError::Host(HostError::type_error(format!(
            "expected PyCObject, got {}",
            obj.type_name()
        )))),
    }
}

/// Finalizer of opaque records: run the destructor on the data, then the
/// type's free slot
///
/// # Safety
/// `handle` must point at a `CObjectRecord`.
pub unsafe extern "C" fn cobject_dealloc(handle: Handle) {
    if handle.is_null() {
        return;
    }
    let record = handle.as_ptr() as *mut CObjectRecord;
    if let Some(destructor) = (*record).destructor {
        destructor((*record).data);
    }
    if let Some(free) = handle.type_ptr().as_ref().and_then(|td| td.tp_free) {
        free(handle.as_void());
    }
}
