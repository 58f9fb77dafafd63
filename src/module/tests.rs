use super::*;
use crate::allocator::testing::RecordingAllocator;
use crate::errors::{HostError, HostErrorKind};
use crate::ffi::sb_incref;
use crate::types::descriptor::{TypeDescriptor, METH_NOARGS, METH_O, METH_VARARGS};
use crate::types::object_free;
use parking_lot::{const_mutex, Mutex};
use std::ffi::CStr;
use std::sync::Arc;

static SCRATCH: Mutex<Vec<usize>> = const_mutex(Vec::new());

fn cstr(bytes: &'static [u8]) -> &'static CStr {
    CStr::from_bytes_with_nul(bytes).expect("nul-terminated")
}

fn store_result(obj: Obj) -> Handle {
    Bridge::with_current(|bridge| bridge.store(&obj).unwrap_or(Handle::NULL)).unwrap_or(Handle::NULL)
}

unsafe extern "C" fn ping(_slf: Handle, args: Handle) -> Handle {
    store_result(Obj::str(if args.is_null() { "pong" } else { "unexpected args" }))
}

unsafe extern "C" fn count(_slf: Handle, args: Handle) -> Handle {
    let n = Bridge::with_current(|bridge| {
        bridge
            .retrieve(args)
            .ok()
            .and_then(|t| t.sequence_items())
            .map_or(-1, |items| items.len() as i64)
    })
    .unwrap_or(-1);
    store_result(Obj::int(n))
}

unsafe extern "C" fn echo(_slf: Handle, arg: Handle) -> Handle {
    Bridge::with_current(|bridge| match bridge.inc_ref(arg) {
        Ok(()) => arg,
        Err(_) => Handle::NULL,
    })
    .unwrap_or(Handle::NULL)
}

unsafe extern "C" fn keywords(_slf: Handle, args: Handle, kwargs: Handle) -> Handle {
    let described = Bridge::with_current(|bridge| {
        let positional = bridge.retrieve(args).ok().and_then(|t| t.sequence_items()).map_or(0, |i| i.len());
        let named = if kwargs.is_null() {
            "none".to_string()
        } else {
            bridge
                .retrieve(kwargs)
                .ok()
                .and_then(|d| d.dict_items())
                .map(|items| items.into_iter().map(|(k, _)| k).collect::<Vec<_>>().join(","))
                .unwrap_or_default()
        };
        format!("{}:{}", positional, named)
    })
    .unwrap_or_default();
    store_result(Obj::str(described))
}

unsafe extern "C" fn boom(_slf: Handle, _args: Handle) -> Handle {
    Bridge::with_current(|bridge| bridge.set_last_error(HostError::value_error("boom")));
    Handle::NULL
}

/// Takes three scratch buffers, then fails
unsafe extern "C" fn scratch_then_fail(_slf: Handle, _args: Handle) -> Handle {
    Bridge::with_current(|bridge| {
        for _ in 0..3 {
            if let Ok(buffer) = bridge.alloc_temp(24) {
                SCRATCH.lock().push(buffer.as_ptr() as usize);
            }
        }
        bridge.set_last_error(HostError::value_error("scratch failed"));
    });
    Handle::NULL
}

fn method_table() -> Vec<MethodDef> {
    vec![
        MethodDef::new(cstr(b"ping\0"), ping, METH_NOARGS).doc(cstr(b"Reply pong.\0")),
        MethodDef::new(cstr(b"count\0"), count, METH_VARARGS),
        MethodDef::new(cstr(b"echo\0"), echo, METH_O),
        MethodDef::with_keywords(cstr(b"keywords\0"), keywords),
        MethodDef::new(cstr(b"boom\0"), boom, METH_NOARGS),
        MethodDef::SENTINEL,
        MethodDef::new(cstr(b"hidden\0"), ping, METH_NOARGS),
    ]
}

fn init(bridge: &Bridge, name: &str) -> (Handle, Obj) {
    let handle = init_module(bridge, name, &method_table(), Some("Test module."), Handle::NULL, 1013)
        .expect("init module");
    let module = bridge.retrieve(handle).expect("module");
    (handle, module)
}

fn call(bridge: &Bridge, module: &Obj, name: &str, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
    let function = bridge.getattr(module, name)?;
    bridge.call(&function, args, kwargs)
}

#[test]
fn init_module_binds_each_calling_convention() {
    let bridge = Bridge::new();
    let (handle, module) = init(&bridge, "conv");

    assert_eq!(call(&bridge, &module, "ping", &[], &[]).expect("ping"), Obj::str("pong"));
    assert_eq!(
        call(&bridge, &module, "count", &[Obj::int(1), Obj::int(2), Obj::int(3)], &[]).expect("count"),
        Obj::int(3)
    );

    let payload = Obj::list(vec![Obj::int(1)]);
    let echoed = call(&bridge, &module, "echo", &[payload.clone()], &[]).expect("echo");
    assert!(echoed.is(&payload));

    let kwargs = [("alpha".to_string(), Obj::int(1)), ("beta".to_string(), Obj::int(2))];
    assert_eq!(
        call(&bridge, &module, "keywords", &[Obj::int(0)], &kwargs).expect("keywords"),
        Obj::str("1:alpha,beta")
    );
    assert_eq!(
        call(&bridge, &module, "keywords", &[], &[]).expect("no keywords"),
        Obj::str("0:none")
    );

    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn method_table_stops_at_the_sentinel() {
    let bridge = Bridge::new();
    let (handle, module) = init(&bridge, "sentinel");
    assert!(bridge.getattr(&module, "boom").is_ok());
    assert!(bridge.getattr(&module, "hidden").is_err());

    let ping = bridge.getattr(&module, "ping").expect("ping");
    let HostObject::Function(function) = &*ping else {
        panic!("expected a function");
    };
    assert_eq!(function.doc(), Some("Reply pong."));
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn calling_convention_mismatch_is_a_type_error() {
    let bridge = Bridge::new();
    let (handle, module) = init(&bridge, "strict");

    let err = call(&bridge, &module, "ping", &[Obj::int(1)], &[]).expect_err("noargs");
    assert!(matches!(err, BridgeError::Host(ref e) if e.is(HostErrorKind::TypeError)));
    let err = call(&bridge, &module, "echo", &[], &[]).expect_err("one arg");
    assert!(matches!(err, BridgeError::Host(ref e) if e.is(HostErrorKind::TypeError)));
    let kwargs = [("x".to_string(), Obj::int(1))];
    let err = call(&bridge, &module, "count", &[], &kwargs).expect_err("no keywords");
    assert!(matches!(err, BridgeError::Host(ref e) if e.is(HostErrorKind::TypeError)));

    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn native_failure_is_raised_once_then_cleared() {
    let bridge = Bridge::new();
    let (handle, module) = init(&bridge, "failing");
    let live_before = bridge.object_store().live_count();

    for _ in 0..2 {
        let err = call(&bridge, &module, "boom", &[], &[]).expect_err("boom");
        assert_eq!(err, BridgeError::Host(HostError::value_error("boom")));
        assert!(!bridge.has_pending_error());
    }
    assert_eq!(bridge.object_store().live_count(), live_before);
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn temp_buffers_of_a_failed_call_are_freed_once() {
    let recording = Arc::new(RecordingAllocator::new());
    let bridge = Bridge::with_allocator(recording.clone());
    let methods = [
        MethodDef::new(cstr(b"scratch\0"), scratch_then_fail, METH_NOARGS),
        MethodDef::SENTINEL,
    ];
    let handle = init_module(&bridge, "scratchpad", &methods, None, Handle::NULL, 1013).expect("init");
    let module = bridge.retrieve(handle).expect("module");

    let err = call(&bridge, &module, "scratch", &[], &[]).expect_err("fails");
    assert_eq!(err, BridgeError::Host(HostError::value_error("scratch failed")));

    let buffers = SCRATCH.lock().clone();
    assert_eq!(buffers.len(), 3);
    let frees = recording.frees();
    for addr in buffers {
        assert_eq!(recording.size_of(addr), Some(24));
        assert_eq!(frees.iter().filter(|&&a| a == addr).count(), 1);
    }
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn argument_handles_are_released_after_the_call() {
    let bridge = Bridge::new();
    let (handle, module) = init(&bridge, "released");
    let live_before = bridge.object_store().live_count();
    let arg = Obj::str("temporary");

    call(&bridge, &module, "count", &[arg.clone()], &[]).expect("count");
    assert_eq!(bridge.object_store().lookup(&arg), None);
    assert_eq!(bridge.object_store().live_count(), live_before);
    bridge.dec_ref(handle).expect("decref");
}

#[test]
fn module_metadata_and_import_file() {
    let bridge = Bridge::new();
    bridge.modules().push_import_file(Some("/ext/lib/native.so".to_string()));
    let (handle, module) = init(&bridge, "native");
    assert_eq!(bridge.modules().pop_import_file(), Some("/ext/lib/native.so".to_string()));

    assert_eq!(bridge.getattr(&module, "__name__").expect("name"), Obj::str("native"));
    assert_eq!(bridge.getattr(&module, "__doc__").expect("doc"), Obj::str("Test module."));
    assert_eq!(bridge.getattr(&module, "__file__").expect("file"), Obj::str("/ext/lib/native.so"));
    assert_eq!(
        bridge.getattr(&module, "__path__").expect("path"),
        Obj::list(vec![Obj::str("/ext/lib")])
    );
    assert_eq!(unsafe { handle.type_ptr() }, bridge.types().module_type().as_type());

    let (_, builtin) = init(&bridge, "builtin_like");
    assert!(bridge.getattr(&builtin, "__file__").expect("file").is_none());
}

#[test]
fn dotted_names_create_and_link_parent_packages() {
    let bridge = Bridge::new();
    let leaf = module_new(&bridge, "outer.inner.leaf").expect("module");

    let outer = get_module(&bridge, "outer").expect("outer");
    let inner = get_module(&bridge, "outer.inner").expect("inner");
    assert!(bridge.getattr(&outer, "inner").expect("link").is(&inner));
    assert!(bridge.getattr(&inner, "leaf").expect("link").is(&leaf));
    assert_eq!(bridge.getattr(&inner, "__path__").expect("package"), Obj::list(Vec::new()));
    assert_eq!(
        bridge.modules().names(),
        vec!["outer", "outer.inner", "outer.inner.leaf"]
    );

    // Existing parents are reused
    let sibling = module_new(&bridge, "outer.sibling").expect("module");
    assert!(get_module(&bridge, "outer").expect("outer").is(&outer));
    assert!(bridge.getattr(&outer, "sibling").expect("link").is(&sibling));
}

#[test]
fn invalid_module_names_are_rejected() {
    let bridge = Bridge::new();
    for name in ["", "a..b", ".a", "a."] {
        assert_eq!(
            module_new(&bridge, name).map(|_| ()),
            Err(BridgeError::InvalidName(name.to_string()))
        );
    }
    assert!(bridge.modules().names().is_empty());
}

#[test]
fn add_object_takes_over_the_reference() {
    let bridge = Bridge::new();
    let (module, module_obj) = init(&bridge, "owner");
    let value = Obj::str("payload");
    let handle = bridge.store(&value).expect("store");

    add_object(&bridge, module, "payload", handle).expect("add");
    assert!(!bridge.object_store().contains(handle));
    assert!(bridge.getattr(&module_obj, "payload").expect("bound").is(&value));

    add_int_constant(&bridge, module, "ANSWER", 42).expect("int");
    add_string_constant(&bridge, module, "NAME", "owner").expect("str");
    assert_eq!(bridge.getattr(&module_obj, "ANSWER").expect("int"), Obj::int(42));
    assert_eq!(bridge.getattr(&module_obj, "NAME").expect("str"), Obj::str("owner"));
}

#[test]
fn add_object_needs_a_live_module() {
    let bridge = Bridge::new();
    let value = bridge.store(&Obj::int(1)).expect("store");
    let unknown = bridge.store(&Obj::bare()).expect("store");
    bridge.dec_ref(unknown).expect("decref");

    assert_eq!(add_object(&bridge, unknown, "x", value), Err(BridgeError::NotFound(unknown)));
    assert_eq!(add_object(&bridge, value, "x", value), Err(BridgeError::NotAModule(value)));
    assert_eq!(bridge.ref_count(value).expect("untouched"), 1);
    bridge.dec_ref(value).expect("decref");
}

#[test]
fn native_type_added_under_a_short_name() {
    let bridge = Bridge::new();
    let _cx = bridge.enter();
    let (module, module_obj) = init(&bridge, "m");

    let td = Box::leak(Box::new(TypeDescriptor::named(cstr(b"pkg.Widget\0"))));
    td.ob_base.ob_type = bridge.types().type_type().as_type();
    td.tp_free = Some(object_free);
    let ty = td.handle();

    sb_incref(ty);
    add_object(&bridge, module, "Widget", ty).expect("add type");
    assert_eq!(bridge.ref_count(ty).expect("count"), 2);

    let widget = bridge.getattr(&module_obj, "Widget").expect("m.Widget");
    assert_eq!(bridge.getattr(&widget, "__module__").expect("module"), Obj::str("pkg"));
    assert_eq!(bridge.getattr(&widget, "__name__").expect("name"), Obj::str("Widget"));

    let instance = bridge.call(&widget, &[], &[]).expect("instantiate");
    let HostObject::NativeInstance(inst) = &*instance else {
        panic!("expected a native instance");
    };
    assert_eq!(unsafe { inst.handle().type_ptr() }, ty.as_type());
    bridge.release(&instance).expect("release");
}

#[test]
fn get_dict_is_the_live_namespace() {
    let bridge = Bridge::new();
    let (module, module_obj) = init(&bridge, "spaced");

    let dict_handle = get_dict(&bridge, module).expect("dict");
    let dict = bridge.retrieve(dict_handle).expect("dict object");
    dict.dict_set("added", Obj::int(7));
    assert_eq!(bridge.getattr(&module_obj, "added").expect("visible"), Obj::int(7));

    bridge.dec_ref(dict_handle).expect("decref");
    assert!(bridge.getattr(&module_obj, "added").is_ok());
}
