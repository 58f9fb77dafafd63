use super::*;
use crate::allocator::testing::RecordingAllocator;
use crate::config::BridgeConfig;
use crate::host::Obj;
use crate::types::descriptor::{MethodDef, TypeDescriptor, METH_NOARGS};
use std::ffi::CStr;
use std::sync::Arc;

fn cstr(bytes: &'static [u8]) -> &'static CStr {
    CStr::from_bytes_with_nul(bytes).expect("nul-terminated")
}

unsafe extern "C" fn answer(_slf: Handle, _args: Handle) -> Handle {
    Bridge::with_current(|bridge| bridge.store(&Obj::int(42)).unwrap_or(Handle::NULL))
        .unwrap_or(Handle::NULL)
}

#[test]
fn entry_points_without_a_bridge_return_sentinels() {
    assert_eq!(sb_refcount(Handle::NULL), -1);
    assert_eq!(sb_thread_allocate_lock().as_raw(), 0);
    assert_eq!(sb_err_occurred(), 0);
    assert!(sb_string_as_temp(Handle::NULL).is_null());
}

#[test]
fn reference_counts_round_trip() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let handle = bridge.store(&Obj::bare()).expect("store");

    sb_incref(handle);
    assert_eq!(sb_refcount(handle), 2);
    sb_decref(handle);
    sb_decref(handle);

    assert!(!bridge.object_store().contains(handle));
    assert_eq!(sb_refcount(handle), -1);
    assert_eq!(sb_err_occurred(), HostErrorKind::KeyError.code());
    sb_err_clear();
    assert_eq!(sb_err_occurred(), 0);
}

#[test]
fn refcount_violation_is_reported_when_abort_is_off() {
    let mut config = BridgeConfig::default();
    config.ffi.abort_on_refcount_violation = false;
    let bridge = Bridge::with_config(config);
    let _cx = bridge.enter();

    let handle = bridge.store(&Obj::bare()).expect("store");
    unsafe { handle.set_refcnt(0) };
    sb_decref(handle);

    let err = bridge.take_last_error().expect("pending error");
    assert_eq!(err.kind, HostErrorKind::SystemError);
    assert!(bridge.object_store().contains(handle));

    unsafe { handle.set_refcnt(1) };
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn locks_through_the_c_api() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let lock = sb_thread_allocate_lock();
    assert_ne!(lock.as_raw(), 0);

    assert_eq!(sb_thread_acquire_lock(lock, 1), 1);
    assert_eq!(sb_thread_acquire_lock(lock, 0), 0);
    sb_thread_release_lock(lock);
    assert_eq!(sb_thread_acquire_lock(lock, 0), 1);
    sb_thread_release_lock(lock);

    sb_thread_free_lock(lock);
    assert_eq!(sb_thread_acquire_lock(lock, 0), 0);
    assert!(bridge.has_pending_error());
}

#[test]
fn err_set_string_parks_a_typed_error() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();

    unsafe { sb_err_set_string(HostErrorKind::ValueError.code(), cstr(b"bad value\0").as_ptr()) };
    assert_eq!(sb_err_occurred(), HostErrorKind::ValueError.code());

    let err = bridge.take_last_error().expect("pending");
    assert_eq!(err.message, "bad value");
    assert_eq!(sb_err_occurred(), 0);
}

#[test]
fn module_entry_points() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let methods = [
        MethodDef::new(cstr(b"answer\0"), answer, METH_NOARGS),
        MethodDef::SENTINEL,
    ];

    let module = unsafe {
        sb_init_module4(
            cstr(b"ffimod\0").as_ptr(),
            methods.as_ptr(),
            cstr(b"module docs\0").as_ptr(),
            Handle::NULL,
            1013,
        )
    };
    assert!(!module.is_null());

    let status = unsafe {
        sb_module_add_string_constant(module, cstr(b"VERSION\0").as_ptr(), cstr(b"1.2\0").as_ptr())
    };
    assert_eq!(status, 0);
    let status = unsafe { sb_module_add_int_constant(module, cstr(b"LIMIT\0").as_ptr(), 9) };
    assert_eq!(status, 0);

    let obj = bridge.modules().get("ffimod").expect("registered");
    assert_eq!(bridge.getattr(&obj, "VERSION").expect("VERSION"), Obj::str("1.2"));
    assert_eq!(bridge.getattr(&obj, "LIMIT").expect("LIMIT"), Obj::int(9));
    assert_eq!(bridge.getattr(&obj, "__doc__").expect("doc"), Obj::str("module docs"));

    let function = bridge.getattr(&obj, "answer").expect("answer");
    assert_eq!(bridge.call(&function, &[], &[]).expect("call"), Obj::int(42));

    bridge.dec_ref(module).expect("decref module");
}

#[test]
fn add_constant_to_non_module_fails_with_sentinel() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let not_module = bridge.store(&Obj::int(1)).expect("store");

    let status = unsafe { sb_module_add_int_constant(not_module, cstr(b"X\0").as_ptr(), 1) };
    assert_eq!(status, -1);
    assert_eq!(sb_err_occurred(), HostErrorKind::TypeError.code());

    bridge.clear_error();
    bridge.dec_ref(not_module).expect("decref");
}

#[test]
fn string_as_temp_lives_until_scope_release() {
    let recording = Arc::new(RecordingAllocator::new());
    let bridge = Bridge::with_allocator(recording.clone());
    let _cx = bridge.enter();
    let handle = bridge.store(&Obj::str("hello")).expect("store");

    let text = sb_string_as_temp(handle);
    assert!(!text.is_null());
    assert_eq!(unsafe { CStr::from_ptr(text) }.to_str().expect("utf8"), "hello");
    assert_eq!(recording.size_of(text as usize), Some(6));

    bridge.free_temps();
    assert!(recording.was_freed(text as usize));
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn cobject_round_trip_through_the_c_api() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let data = 0x5150 as *mut c_void;

    let handle = sb_cobject_from_void_ptr(data, None);
    assert!(!handle.is_null());
    assert_eq!(sb_cobject_as_void_ptr(handle), data);

    sb_decref(handle);
    assert!(sb_cobject_as_void_ptr(handle).is_null());
    bridge.clear_error();
}

#[test]
fn oversized_generic_alloc_is_a_memory_error() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let mut td = TypeDescriptor::named(cstr(b"ffi.Huge\0"));
    td.tp_basicsize = 32;
    td.tp_itemsize = 8;

    let handle = unsafe { sb_type_generic_alloc(td.handle(), isize::MAX / 2) };
    assert!(handle.is_null());
    assert_eq!(sb_err_occurred(), HostErrorKind::MemoryError.code());
    sb_err_clear();
}
