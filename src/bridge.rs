//! Bridge facade - one instance ties the store, type bridge, module
//! registry, lock table and temp scopes together
//!
//! Design: `Bridge` is a cheap `Arc` handle. Native entry points carry no
//! context argument, so every bridge operation that may run native code
//! first enters the bridge on the current thread; adapters and `sb_*`
//! functions find it again with `Bridge::with_current`. Threads native code
//! spawns never entered anything, so they fall back to the bridge installed
//! as the process default.

use crate::allocator::{alloc_zeroed, AllocatorPort, Handle, HeapAllocator, ObjectHeader};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, HostError, HostErrorKind, Result};
use crate::host::{HostFunction, HostObject, Kwargs, Obj};
use crate::locks::LockTable;
use crate::logging::{debug, warn};
use crate::module::ModuleRegistry;
use crate::store::ObjectStore;
use crate::temps::TempScope;
use crate::types::{self, TypeBridge};
use core::ptr::NonNull;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

thread_local! {
    static CURRENT: RefCell<Vec<Bridge>> = const { RefCell::new(Vec::new()) };
}

/// Process default; does not keep the bridge alive
static DEFAULT: Lazy<Mutex<Weak<BridgeInner>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct BridgeInner {
    config: BridgeConfig,
    allocator: Arc<dyn AllocatorPort>,
    types: Arc<TypeBridge>,
    store: ObjectStore,
    modules: ModuleRegistry,
    locks: LockTable,
    temps: DashMap<ThreadId, Vec<TempScope>>,
    pending: Mutex<Option<HostError>>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

/// Marks a bridge as current on this thread until dropped
#[must_use]
pub struct BridgeContext {
    _not_send: PhantomData<*const ()>,
}

impl Drop for BridgeContext {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Releases the innermost temp scope of a thread on every exit path
struct ScopeGuard<'a> {
    bridge: &'a Bridge,
    thread: ThreadId,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let inner = &self.bridge.inner;
        let scope = inner.temps.get_mut(&self.thread).and_then(|mut scopes| scopes.pop());
        inner.temps.remove_if(&self.thread, |_, scopes| scopes.is_empty());
        if let Some(mut scope) = scope {
            scope.release(&inner.store, &*inner.allocator);
        }
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::build(BridgeConfig::default(), Arc::new(HeapAllocator))
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self::build(config, Arc::new(HeapAllocator))
    }

    pub fn with_allocator(allocator: Arc<dyn AllocatorPort>) -> Self {
        Self::build(BridgeConfig::default(), allocator)
    }

    pub fn build(config: BridgeConfig, allocator: Arc<dyn AllocatorPort>) -> Self {
        let types = Arc::new(TypeBridge::new());
        let store = ObjectStore::with_resolver(
            allocator.clone(),
            types.clone(),
            config.store.initial_capacity,
        );
        debug!(
            event = "bridge_init",
            initial_capacity = config.store.initial_capacity,
            "bridge created"
        );
        Self {
            inner: Arc::new(BridgeInner {
                config,
                allocator,
                types,
                store,
                modules: ModuleRegistry::new(),
                locks: LockTable::new(),
                temps: DashMap::new(),
                pending: Mutex::new(None),
            }),
        }
    }

    // ===== Thread context =====

    /// Make this bridge current on the calling thread
    pub fn enter(&self) -> BridgeContext {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        BridgeContext {
            _not_send: PhantomData,
        }
    }

    /// Use this bridge on threads that never entered one
    ///
    /// Replaces any earlier default. The default is dropped with the last
    /// handle to its bridge.
    pub fn install_default(&self) {
        *DEFAULT.lock() = Arc::downgrade(&self.inner);
        debug!(event = "bridge_default", "bridge installed as process default");
    }

    /// Innermost bridge entered on this thread, else the process default
    pub fn current() -> Option<Bridge> {
        CURRENT
            .with(|stack| stack.borrow().last().cloned())
            .or_else(|| DEFAULT.lock().upgrade().map(|inner| Bridge { inner }))
    }

    pub fn with_current<R>(f: impl FnOnce(&Bridge) -> R) -> Option<R> {
        Self::current().map(|bridge| f(&bridge))
    }

    // ===== Components =====

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &Arc<dyn AllocatorPort> {
        &self.inner.allocator
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.inner.store
    }

    pub fn types(&self) -> &TypeBridge {
        &self.inner.types
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.inner.modules
    }

    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    // ===== Object store =====

    /// Handle for `obj`; see `ObjectStore::store`
    pub fn store(&self, obj: &Obj) -> Result<Handle> {
        self.inner.store.store(obj)
    }

    pub fn store_unmanaged(&self, handle: Handle, obj: Obj) -> Result<()> {
        self.inner.store.store_unmanaged(handle, obj)
    }

    pub fn retrieve(&self, handle: Handle) -> Result<Obj> {
        self.inner.store.retrieve(handle)
    }

    pub fn inc_ref(&self, handle: Handle) -> Result<()> {
        self.inner.store.inc_ref(handle)
    }

    /// Drop a reference; finalizers run with this bridge current
    pub fn dec_ref(&self, handle: Handle) -> Result<()> {
        let _cx = self.enter();
        self.inner.store.dec_ref(handle)
    }

    pub fn ref_count(&self, handle: Handle) -> Result<isize> {
        self.inner.store.ref_count(handle)
    }

    pub fn free(&self, handle: Handle) -> Result<()> {
        self.inner.store.free(handle)
    }

    /// Release a record the bridge allocated, whether or not it is bound
    pub(crate) fn free_record(&self, handle: Handle) {
        match self.inner.store.free(handle) {
            Ok(()) => {}
            Err(BridgeError::NotFound(_)) => {
                if let Some(ptr) = NonNull::new(handle.as_bytes()) {
                    self.inner.allocator.free(ptr);
                }
            }
            Err(err) => warn!(event = "free_failed", handle = %handle, error = %err, "record release failed"),
        }
    }

    /// Host object for `handle`, bridging a native-born record on first sight
    pub fn resolve(&self, handle: Handle) -> Result<Obj> {
        match self.inner.store.retrieve(handle) {
            Err(BridgeError::NotFound(_)) => types::adopt(self, handle),
            other => other,
        }
    }

    /// Give back the reference a host object holds on native memory
    ///
    /// Only native instances hold one; call once per instance.
    pub fn release(&self, obj: &Obj) -> Result<()> {
        match &**obj {
            HostObject::NativeInstance(inst) => self.dec_ref(inst.handle()),
            _ => Ok(()),
        }
    }

    // ===== Temp scopes =====

    fn with_scope<R>(&self, f: impl FnOnce(&mut TempScope) -> R) -> R {
        let mut scopes = self.inner.temps.entry(thread::current().id()).or_default();
        if scopes.is_empty() {
            scopes.push(TempScope::new());
        }
        let top = scopes.len() - 1;
        f(&mut scopes[top])
    }

    /// Free `ptr` through the allocator when the current scope is released
    pub fn remember_temp_ptr(&self, ptr: NonNull<u8>) {
        self.with_scope(|scope| scope.remember_buffer(ptr));
    }

    /// Drop one reference to `handle` when the current scope is released
    ///
    /// Takes no reference of its own.
    pub fn remember_temp_object(&self, handle: Handle) {
        self.with_scope(|scope| scope.remember_object(handle));
    }

    /// Release everything remembered in this thread's innermost scope
    pub fn free_temps(&self) {
        let _cx = self.enter();
        let mut scope = self.with_scope(std::mem::take);
        scope.release(&self.inner.store, &*self.inner.allocator);
    }

    /// Zeroed buffer that lives until the current scope is released
    pub fn alloc_temp(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = alloc_zeroed(&*self.inner.allocator, size)?;
        self.remember_temp_ptr(ptr);
        Ok(ptr)
    }

    /// Store `obj` for the duration of the current scope
    pub(crate) fn store_temp(&self, obj: &Obj) -> Result<Handle> {
        let handle = self.inner.store.store(obj)?;
        self.remember_temp_object(handle);
        Ok(handle)
    }

    /// Run `f` inside a fresh temp scope with this bridge current
    pub(crate) fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        let _cx = self.enter();
        let thread = thread::current().id();
        self.inner.temps.entry(thread).or_default().push(TempScope::new());
        let _guard = ScopeGuard { bridge: self, thread };
        f()
    }

    // ===== Pending error =====

    pub fn set_last_error(&self, err: HostError) {
        *self.inner.pending.lock() = Some(err);
    }

    /// Take and clear the pending error
    pub fn take_last_error(&self) -> Option<HostError> {
        self.inner.pending.lock().take()
    }

    pub fn has_pending_error(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    pub fn pending_error_kind(&self) -> Option<HostErrorKind> {
        self.inner.pending.lock().as_ref().map(|err| err.kind)
    }

    pub fn clear_error(&self) {
        self.inner.pending.lock().take();
    }

    /// Error to raise after native code signalled failure
    pub(crate) fn raise_pending(&self, what: &str) -> BridgeError {
        match self.take_last_error() {
            Some(err) => {
                debug!(event = "raise_pending", kind = %err.kind, what, "pending error raised into host");
                err.into()
            }
            None => HostError::system_error(format!("{} without setting an error", what)).into(),
        }
    }

    /// Park a host-side failure for the native caller
    pub(crate) fn record_failure(&self, label: &str, err: BridgeError) {
        let err = err.into_host();
        warn!(event = "host_failure", slot = label, kind = %err.kind, message = %err.message, "host call failed under native caller");
        self.set_last_error(err);
    }

    /// Turn a returned new reference into a host object and release it
    pub(crate) fn claim_result(&self, handle: Handle, what: &str) -> Result<Obj> {
        if handle.is_null() {
            return Err(self.raise_pending(&format!("{} returned NULL", what)));
        }
        let obj = self.resolve(handle)?;
        self.dec_ref(handle)?;
        Ok(obj)
    }

    // ===== Host operations =====

    pub fn call(&self, callee: &Obj, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
        let _cx = self.enter();
        match &**callee {
            HostObject::Function(f) => f.invoke(self, args, kwargs),
            HostObject::Class(class) => {
                let instance = Obj::instance_of(callee);
                if let Some(init) = class.lookup("__init__") {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(instance.clone());
                    full.extend_from_slice(args);
                    init.invoke(self, &full, kwargs)?;
                }
                Ok(instance)
            }
            HostObject::NativeType(ty) => types::instantiate(self, ty, args, kwargs),
            HostObject::Instance(_) | HostObject::NativeInstance(_) => {
                self.call_method(callee, "__call__", args, kwargs)
            }
            _ => Err(HostError::type_error(format!("'{}' object is not callable", callee.type_name())).into()),
        }
    }

    pub fn getattr(&self, target: &Obj, name: &str) -> Result<Obj> {
        let missing = || -> BridgeError {
            HostError::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                target.type_name(),
                name
            ))
            .into()
        };
        match &**target {
            HostObject::Module(module) => module.get(name).ok_or_else(|| {
                HostError::attribute_error(format!(
                    "module '{}' has no attribute '{}'",
                    module.name(),
                    name
                ))
                .into()
            }),
            HostObject::Instance(inst) => {
                if let Some(value) = inst.get_attr(name) {
                    return Ok(value);
                }
                let method = inst
                    .class_def()
                    .and_then(|class| class.lookup(name))
                    .ok_or_else(missing)?;
                Ok(bind_method(target, method.clone()))
            }
            HostObject::Class(class) => match name {
                "__name__" => Ok(Obj::str(class.name())),
                "__module__" => Ok(Obj::str(class.module())),
                _ => class
                    .lookup(name)
                    .map(|f| Obj::function(f.clone()))
                    .ok_or_else(missing),
            },
            HostObject::Function(f) => match name {
                "__name__" => Ok(Obj::str(f.name())),
                "__doc__" => Ok(f.doc().map(Obj::str).unwrap_or_else(Obj::none)),
                _ => Err(missing()),
            },
            HostObject::NativeType(ty) => types::type_attr(ty, name),
            HostObject::NativeInstance(inst) => types::instance_attr(inst, name).ok_or_else(missing),
            _ => Err(missing()),
        }
    }

    pub fn setattr(&self, target: &Obj, name: &str, value: Obj) -> Result<()> {
        match &**target {
            HostObject::Module(module) => {
                module.set(name, value);
                Ok(())
            }
            HostObject::Instance(inst) => {
                inst.set_attr(name, value);
                Ok(())
            }
            _ => Err(HostError::attribute_error(format!(
                "'{}' object attribute '{}' is read-only",
                target.type_name(),
                name
            ))
            .into()),
        }
    }

    pub fn call_method(&self, target: &Obj, name: &str, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
        let method = self.getattr(target, name)?;
        self.call(&method, args, kwargs)
    }

    // ===== Type bridge =====

    pub fn generic_alloc(&self, ty: Handle, nitems: isize) -> Result<Handle> {
        types::generic_alloc(&*self.inner.allocator, ty, nitems)
    }

    pub fn generic_new(&self, ty: Handle) -> Result<Handle> {
        let _cx = self.enter();
        types::generic_new(self, ty)
    }

    /// Point a well-known native data symbol at bridge-filled memory
    ///
    /// # Safety
    /// `address` must point at writable memory large enough for the symbol:
    /// an `ObjectHeader` for `_Py_NoneStruct`, a `TypeDescriptor` for
    /// `PyType_Type` and `PyBaseObject_Type`.
    pub unsafe fn register_data(&self, symbol: &str, address: Handle) -> Result<()> {
        if address.is_null() {
            return Err(BridgeError::NotFound(address));
        }
        match symbol {
            "_Py_NoneStruct" => {
                address.as_ptr().write(ObjectHeader::new(std::ptr::null_mut()));
                self.inner.store.store_unmanaged(address, Obj::none())?;
                debug!(event = "register_data", symbol, address = %address, "none record filled");
                Ok(())
            }
            "PyType_Type" => {
                self.inner.types.fill_type_type(address);
                Ok(())
            }
            "PyBaseObject_Type" => {
                self.inner.types.fill_base_object(address);
                Ok(())
            }
            other => Err(BridgeError::InvalidName(other.to_string())),
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Host method bound to its receiver
fn bind_method(receiver: &Obj, method: HostFunction) -> Obj {
    let receiver = receiver.clone();
    let name = method.name().to_string();
    Obj::function(HostFunction::new(name, move |bridge: &Bridge, args: &[Obj], kwargs: &Kwargs| {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver.clone());
        full.extend_from_slice(args);
        method.invoke(bridge, &full, kwargs)
    }))
}
