//! C API - entry points native extension code links against
//!
//! Design: every entry point finds its bridge through the thread's current
//! context, runs the Rust operation and maps failure to the sentinel the
//! native caller expects (null handle, `-1`, or `0`), parking the detail as
//! the bridge's pending error. A reference-count violation is fatal unless
//! the configuration turns the abort off.

#[cfg(test)]
mod tests;

use crate::allocator::Handle;
use crate::bridge::Bridge;
use crate::cobject::{self, CObjectDestructor};
use crate::errors::{BridgeError, HostError, HostErrorKind, Result};
use crate::host::HostObject;
use crate::locks::LockHandle;
use crate::logging::{error, trace};
use crate::module;
use crate::types::{self, descriptor};
use std::ffi::{c_char, c_int, c_long, c_void};

/// Run `f` against the current bridge, or return `sentinel` on failure
fn with_bridge<R>(function: &'static str, sentinel: R, f: impl FnOnce(&Bridge) -> Result<R>) -> R {
    let outcome = Bridge::with_current(|bridge| match f(bridge) {
        Ok(value) => Some(value),
        Err(err) => {
            fail(bridge, function, err);
            None
        }
    });
    match outcome {
        Some(Some(value)) => value,
        Some(None) => sentinel,
        None => {
            error!(event = "ffi_error", function, "no bridge entered on this thread and no default installed");
            sentinel
        }
    }
}

fn fail(bridge: &Bridge, function: &'static str, err: BridgeError) {
    if let BridgeError::RefCountViolation(handle) = err {
        error!(event = "refcount_violation", function, handle = %handle, "native code released a reference it did not own");
        if bridge.config().ffi.abort_on_refcount_violation {
            std::process::abort();
        }
    }
    trace!(event = "ffi_error", function, error = %err, "entry point failed");
    bridge.set_last_error(err.into_host());
}

unsafe fn text(function: &'static str, ptr: *const c_char) -> Result<String> {
    descriptor::c_text(ptr).ok_or_else(|| {
        HostError::system_error(format!("{}: NULL string argument", function)).into()
    })
}

// ===== Reference counts =====

/// Add a reference; a type descriptor seen for the first time is bridged
#[no_mangle]
pub extern "C" fn sb_incref(handle: Handle) {
    if handle.is_null() {
        return;
    }
    with_bridge("sb_incref", (), |bridge| {
        bridge.resolve(handle)?;
        bridge.inc_ref(handle)
    });
}

#[no_mangle]
pub extern "C" fn sb_decref(handle: Handle) {
    if handle.is_null() {
        return;
    }
    with_bridge("sb_decref", (), |bridge| bridge.dec_ref(handle));
}

/// Current count, or -1 for an unknown handle
#[no_mangle]
pub extern "C" fn sb_refcount(handle: Handle) -> isize {
    with_bridge("sb_refcount", -1, |bridge| bridge.ref_count(handle))
}

// ===== Type bridge =====

/// # Safety
/// `ptr` must be null or a record allocated through the current bridge.
#[no_mangle]
pub unsafe extern "C" fn sb_object_free(ptr: *mut c_void) {
    types::object_free(ptr);
}

/// # Safety
/// `handle` must point at a readable record header.
#[no_mangle]
pub unsafe extern "C" fn sb_base_object_dealloc(handle: Handle) {
    types::base_object_dealloc(handle);
}

/// # Safety
/// `ty` must be null or point at a live type descriptor.
#[no_mangle]
pub unsafe extern "C" fn sb_type_generic_alloc(ty: Handle, nitems: isize) -> Handle {
    with_bridge("sb_type_generic_alloc", Handle::NULL, |bridge| {
        bridge.generic_alloc(ty, nitems)
    })
}

/// # Safety
/// `ty` must be null or point at a live type descriptor.
#[no_mangle]
pub unsafe extern "C" fn sb_type_generic_new(
    ty: Handle,
    _args: Handle,
    _kwargs: Handle,
) -> Handle {
    with_bridge("sb_type_generic_new", Handle::NULL, |bridge| {
        bridge.generic_new(ty)
    })
}

// ===== Module bridge =====

/// Create and register a module from a sentinel-terminated method table
///
/// # Safety
/// `name` must be a NUL-terminated string; `methods` null or a valid method
/// table; `doc` null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn sb_init_module4(
    name: *const c_char,
    methods: *const descriptor::MethodDef,
    doc: *const c_char,
    self_handle: Handle,
    api_version: c_int,
) -> Handle {
    with_bridge("sb_init_module4", Handle::NULL, |bridge| {
        let name = text("sb_init_module4", name)?;
        let table = descriptor::method_table(methods);
        let doc = descriptor::c_text(doc);
        module::init_module(bridge, &name, &table, doc.as_deref(), self_handle, api_version)
    })
}

/// Bind `name` in `module`, taking over the caller's reference to `value`
///
/// # Safety
/// `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sb_module_add_object(
    module: Handle,
    name: *const c_char,
    value: Handle,
) -> c_int {
    with_bridge("sb_module_add_object", -1, |bridge| {
        let name = text("sb_module_add_object", name)?;
        module::add_object(bridge, module, &name, value).map(|()| 0)
    })
}

/// # Safety
/// `name` must be a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sb_module_add_int_constant(
    module: Handle,
    name: *const c_char,
    value: c_long,
) -> c_int {
    with_bridge("sb_module_add_int_constant", -1, |bridge| {
        let name = text("sb_module_add_int_constant", name)?;
        module::add_int_constant(bridge, module, &name, value as i64).map(|()| 0)
    })
}

/// # Safety
/// `name` and `value` must be NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn sb_module_add_string_constant(
    module: Handle,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    with_bridge("sb_module_add_string_constant", -1, |bridge| {
        let name = text("sb_module_add_string_constant", name)?;
        let value = text("sb_module_add_string_constant", value)?;
        module::add_string_constant(bridge, module, &name, &value).map(|()| 0)
    })
}

// ===== Locks =====

/// New unlocked lock, or handle 0 without a bridge
#[no_mangle]
pub extern "C" fn sb_thread_allocate_lock() -> LockHandle {
    with_bridge("sb_thread_allocate_lock", LockHandle::from_raw(0), |bridge| {
        Ok(bridge.locks().allocate())
    })
}

/// 1 when the lock was taken, 0 otherwise
#[no_mangle]
pub extern "C" fn sb_thread_acquire_lock(lock: LockHandle, waitflag: c_int) -> c_int {
    with_bridge("sb_thread_acquire_lock", 0, |bridge| {
        bridge
            .locks()
            .acquire(lock, waitflag != 0)
            .map(|acquired| acquired as c_int)
    })
}

#[no_mangle]
pub extern "C" fn sb_thread_release_lock(lock: LockHandle) {
    with_bridge("sb_thread_release_lock", (), |bridge| bridge.locks().release(lock));
}

#[no_mangle]
pub extern "C" fn sb_thread_free_lock(lock: LockHandle) {
    with_bridge("sb_thread_free_lock", (), |bridge| bridge.locks().free(lock));
}

// ===== Pending error =====

/// Set the pending error; `kind` is a `HostErrorKind` code
///
/// # Safety
/// `message` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sb_err_set_string(kind: c_int, message: *const c_char) {
    let message = descriptor::c_text(message).unwrap_or_default();
    with_bridge("sb_err_set_string", (), |bridge| {
        bridge.set_last_error(HostError::new(HostErrorKind::from_code(kind), message));
        Ok(())
    });
}

/// Kind code of the pending error, or 0 when none is set
#[no_mangle]
pub extern "C" fn sb_err_occurred() -> c_int {
    Bridge::with_current(|bridge| bridge.pending_error_kind().map_or(0, HostErrorKind::code))
        .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn sb_err_clear() {
    Bridge::with_current(|bridge| bridge.clear_error());
}

// ===== Opaque pointers =====

#[no_mangle]
pub extern "C" fn sb_cobject_from_void_ptr(
    data: *mut c_void,
    destructor: Option<CObjectDestructor>,
) -> Handle {
    with_bridge("sb_cobject_from_void_ptr", Handle::NULL, |bridge| {
        cobject::from_void_ptr(bridge, data, destructor)
    })
}

#[no_mangle]
pub extern "C" fn sb_cobject_as_void_ptr(handle: Handle) -> *mut c_void {
    with_bridge("sb_cobject_as_void_ptr", std::ptr::null_mut(), |bridge| {
        cobject::as_void_ptr(bridge, handle)
    })
}

// ===== Temp memory =====

/// NUL-terminated copy of a string object, freed with the current temp scope
#[no_mangle]
pub extern "C" fn sb_string_as_temp(handle: Handle) -> *const c_char {
    with_bridge("sb_string_as_temp", std::ptr::null(), |bridge| {
        let obj = bridge.retrieve(handle)?;
        let HostObject::Str(value) = &*obj else {
            return Err(HostError::type_error(format!(
                "expected str, got {}",
                obj.type_name()
            ))
            .into());
        };
        let bytes = value.as_bytes();
        let buffer = bridge.alloc_temp(bytes.len() + 1)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_ptr(), bytes.len());
            buffer.as_ptr().add(bytes.len()).write(0);
        }
        Ok(buffer.as_ptr() as *const c_char)
    })
}
