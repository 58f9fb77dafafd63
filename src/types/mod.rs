//! Type bridge - native type descriptors <-> host types
//!
//! Design: two directions.
//! - Native -> host: a descriptor handed over by an extension becomes a
//!   `NativeType`; instantiating it walks `tp_new` / `tp_init` and host
//!   operations on its instances read slot pointers out of the descriptor.
//! - Host -> native: every host class stored into native memory gets a
//!   bridge-owned descriptor whose slots point at generic adapters that call
//!   back into the class's methods.
//!
//! The bridge also owns the built-in descriptors (base object, type-of-types,
//! module, opaque pointer) that shadow records of plain host values carry.

pub mod descriptor;


pub use descriptor::TypeDescriptor;

use crate::allocator::{alloc_record, AllocatorPort, Handle, ObjectHeader};
use crate::bridge::Bridge;
use crate::dispatch::{self, adapters, BoundMethod, NativeFn, SlotId};
use crate::errors::{BridgeError, HostError, Result};
use crate::host::{HostObject, Kwargs, Obj};
use crate::logging::{debug, error, trace};
use crate::store::TypeResolver;
use core::ptr::NonNull;
use dashmap::DashMap;
use descriptor::{MappingMethods, NumberMethods, SequenceMethods};
use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Split `pkg.mod.Name` into (`pkg.mod`, `Name`); no dot means no module
pub fn split_qualified_name(qualified: &str) -> (&str, &str) {
    match qualified.rsplit_once('.') {
        Some((module, name)) => (module, name),
        None => ("", qualified),
    }
}

/// Host view of a native type descriptor
///
/// Holds one reference on the descriptor for as long as it lives.
#[derive(Debug)]
pub struct NativeType {
    handle: Handle,
    module: String,
    name: String,
    doc: Option<String>,
}

impl NativeType {
    /// # Safety
    /// `handle` must point at a valid `TypeDescriptor` that outlives this
    /// value.
    pub(crate) unsafe fn from_descriptor(handle: Handle) -> Self {
        let td = &*handle.as_type();
        let qualified = td.name();
        let (module, name) = split_qualified_name(&qualified);
        Self {
            handle,
            module: module.to_string(),
            name: name.to_string(),
            doc: td.doc(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        // Safety: guaranteed by `from_descriptor`'s contract
        unsafe { &*self.handle.as_type() }
    }

    pub fn slot(&self, slot: SlotId) -> Option<NativeFn> {
        slot.read(self.descriptor())
    }

    /// First populated slot answering to the host method `dunder`
    pub fn find_slot(&self, dunder: &str) -> Option<(SlotId, NativeFn)> {
        SlotId::ALL
            .iter()
            .filter(|slot| slot.dunder() == dunder)
            .find_map(|slot| self.slot(*slot).map(|f| (*slot, f)))
    }

    /// Entry of `tp_methods` named `name`
    pub fn method(&self, name: &str) -> Option<BoundMethod> {
        self.descriptor()
            .methods()
            .iter()
            .filter_map(|def| unsafe { BoundMethod::from_def(def) })
            .find(|m| m.name() == name)
    }
}

/// Host object standing for a native-born instance
///
/// Owns one reference on `handle`, returned with `Bridge::release`.
#[derive(Debug)]
pub struct NativeInstance {
    ty: Arc<NativeType>,
    handle: Handle,
}

impl NativeInstance {
    pub fn native_type(&self) -> &Arc<NativeType> {
        &self.ty
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

/// Descriptor memory owned by the bridge, with all three slot groups
pub(crate) struct OwnedDescriptor {
    td: NonNull<TypeDescriptor>,
    number: NonNull<NumberMethods>,
    sequence: NonNull<SequenceMethods>,
    mapping: NonNull<MappingMethods>,
    _name: CString,
}

// Safety: the descriptor is only mutated while being built, before any
// handle to it escapes
unsafe impl Send for OwnedDescriptor {}
unsafe impl Sync for OwnedDescriptor {}

impl OwnedDescriptor {
    fn new(name: &str, basic_size: usize, ob_type: *mut TypeDescriptor) -> Self {
        let name = CString::new(name.replace('\0', "")).unwrap_or_default();
        let number = NonNull::from(Box::leak(Box::<NumberMethods>::default()));
        let sequence = NonNull::from(Box::leak(Box::<SequenceMethods>::default()));
        let mapping = NonNull::from(Box::leak(Box::<MappingMethods>::default()));
        let td = Box::new(TypeDescriptor {
            ob_base: ObjectHeader::new(ob_type),
            tp_name: name.as_ptr(),
            tp_basicsize: basic_size as isize,
            tp_as_number: number.as_ptr(),
            tp_as_sequence: sequence.as_ptr(),
            tp_as_mapping: mapping.as_ptr(),
            ..TypeDescriptor::empty()
        });
        Self {
            td: NonNull::from(Box::leak(td)),
            number,
            sequence,
            mapping,
            _name: name,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut TypeDescriptor {
        self.td.as_ptr()
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::from_type(self.td.as_ptr())
    }

    /// Only valid while no handle to the descriptor has been handed out
    pub(crate) fn descriptor_mut(&mut self) -> &mut TypeDescriptor {
        unsafe { self.td.as_mut() }
    }

    pub(crate) fn number_mut(&mut self) -> &mut NumberMethods {
        unsafe { self.number.as_mut() }
    }

    pub(crate) fn sequence_mut(&mut self) -> &mut SequenceMethods {
        unsafe { self.sequence.as_mut() }
    }

    pub(crate) fn mapping_mut(&mut self) -> &mut MappingMethods {
        unsafe { self.mapping.as_mut() }
    }
}

impl Drop for OwnedDescriptor {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.td.as_ptr()));
            drop(Box::from_raw(self.number.as_ptr()));
            drop(Box::from_raw(self.sequence.as_ptr()));
            drop(Box::from_raw(self.mapping.as_ptr()));
        }
    }
}

/// Registry of bridge-owned descriptors
pub struct TypeBridge {
    type_type: OwnedDescriptor,
    object_type: OwnedDescriptor,
    module_type: OwnedDescriptor,
    cobject_type: OwnedDescriptor,
    /// Base object descriptor in effect; a loader may repoint it at native
    /// memory with `register_data`
    base_object: AtomicPtr<TypeDescriptor>,
    /// Native block registered as the type-of-types, if any
    native_type_type: AtomicPtr<TypeDescriptor>,
    class_types: DashMap<usize, (Obj, OwnedDescriptor)>,
}

impl TypeBridge {
    pub fn new() -> Self {
        let mut type_type = OwnedDescriptor::new(
            "type",
            std::mem::size_of::<TypeDescriptor>(),
            std::ptr::null_mut(),
        );
        let meta = type_type.as_ptr();
        type_type.descriptor_mut().ob_base.ob_type = meta;

        let mut object_type = OwnedDescriptor::new("object", ObjectHeader::SIZE, meta);
        install_object_finalizers(object_type.descriptor_mut());

        let mut module_type = OwnedDescriptor::new("module", ObjectHeader::SIZE, meta);
        install_object_finalizers(module_type.descriptor_mut());

        let mut cobject_type = OwnedDescriptor::new(
            "PyCObject",
            std::mem::size_of::<crate::cobject::CObjectRecord>(),
            meta,
        );
        {
            let td = cobject_type.descriptor_mut();
            td.tp_dealloc = Some(crate::cobject::cobject_dealloc);
            td.tp_free = Some(object_free);
        }

        let base_object = AtomicPtr::new(object_type.as_ptr());
        Self {
            type_type,
            object_type,
            module_type,
            cobject_type,
            base_object,
            native_type_type: AtomicPtr::new(std::ptr::null_mut()),
            class_types: DashMap::new(),
        }
    }

    /// Descriptor of every type descriptor
    pub fn type_type(&self) -> Handle {
        self.type_type.handle()
    }

    pub fn object_type(&self) -> Handle {
        Handle::from_type(self.base_object.load(Ordering::Acquire))
    }

    pub fn module_type(&self) -> Handle {
        self.module_type.handle()
    }

    pub fn cobject_type(&self) -> Handle {
        self.cobject_type.handle()
    }

    /// Whether `handle` is a record whose type is the type-of-types
    ///
    /// # Safety
    /// `handle` must point at a readable record header.
    pub unsafe fn is_type_object(&self, handle: Handle) -> bool {
        if handle.is_null() {
            return false;
        }
        let ty = handle.type_ptr();
        let native = self.native_type_type.load(Ordering::Acquire);
        ty == self.type_type.as_ptr() || (!native.is_null() && ty == native)
    }

    /// Fill native memory standing for the type-of-types; descriptors typed
    /// by it count as type objects from now on
    ///
    /// # Safety
    /// `target` must point at writable memory for a `TypeDescriptor`.
    pub(crate) unsafe fn fill_type_type(&self, target: Handle) {
        let source = &*self.type_type.as_ptr();
        let td = target.as_type();
        td.write(TypeDescriptor {
            ob_base: ObjectHeader::new(self.type_type.as_ptr()),
            tp_name: source.tp_name,
            tp_basicsize: source.tp_basicsize,
            ..TypeDescriptor::empty()
        });
        self.native_type_type.store(td, Ordering::Release);
        debug!(event = "register_data", symbol = "PyType_Type", address = %target, "type type filled");
    }

    /// Copy the base object descriptor into native memory and use that copy
    /// from now on
    ///
    /// # Safety
    /// `target` must point at writable memory for a `TypeDescriptor`.
    pub(crate) unsafe fn fill_base_object(&self, target: Handle) {
        let source = &*self.object_type.as_ptr();
        let td = target.as_type();
        td.write(TypeDescriptor {
            ob_base: ObjectHeader::new(self.type_type.as_ptr()),
            tp_name: source.tp_name,
            tp_basicsize: source.tp_basicsize,
            tp_dealloc: source.tp_dealloc,
            tp_free: source.tp_free,
            ..TypeDescriptor::empty()
        });
        self.base_object.store(td, Ordering::Release);
        debug!(event = "register_data", symbol = "PyBaseObject_Type", address = %target, "base object type filled");
    }

    /// Descriptor shadowing instances of host class `class`, built on first use
    pub fn class_descriptor(&self, class: &Obj) -> *mut TypeDescriptor {
        if let Some(entry) = self.class_types.get(&class.identity()) {
            return entry.1.as_ptr();
        }
        let entry = self
            .class_types
            .entry(class.identity())
            .or_insert_with(|| (class.clone(), self.synthesize(class)));
        entry.1.as_ptr()
    }

    fn synthesize(&self, class: &Obj) -> OwnedDescriptor {
        let HostObject::Class(def) = &**class else {
            return OwnedDescriptor::new(&class.type_name(), ObjectHeader::SIZE, self.type_type.as_ptr());
        };

        let mut owned =
            OwnedDescriptor::new(&def.qualified_name(), ObjectHeader::SIZE, self.type_type.as_ptr());
        install_object_finalizers(owned.descriptor_mut());

        let mut installed = Vec::new();
        for slot in SlotId::ALL {
            if def.has_method(slot.dunder()) {
                slot.install_adapter(&mut owned);
                installed.push(slot.dunder());
            }
        }
        if dispatch::COMPARE_OPS
            .iter()
            .any(|(dunder, _)| def.has_method(dunder))
        {
            owned.descriptor_mut().tp_richcompare = Some(adapters::richcompare);
            installed.push("__richcmp__");
        }

        debug!(
            event = "synthesize_type",
            class = %def.qualified_name(),
            slots = ?installed,
            "native descriptor synthesized for host class"
        );
        owned
    }
}

impl Default for TypeBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for TypeBridge {
    fn resolve(&self, obj: &Obj) -> (*mut TypeDescriptor, usize) {
        let td = match &**obj {
            HostObject::Class(_) | HostObject::NativeType(_) => self.type_type.as_ptr(),
            HostObject::Module(_) => self.module_type.as_ptr(),
            HostObject::Opaque(_) => self.cobject_type.as_ptr(),
            HostObject::Instance(inst) => self.class_descriptor(inst.class()),
            HostObject::NativeInstance(inst) => inst.native_type().handle().as_type(),
            _ => self.base_object.load(Ordering::Acquire),
        };
        let size = unsafe { (*td).tp_basicsize }.max(ObjectHeader::SIZE as isize) as usize;
        (td, size)
    }
}

fn install_object_finalizers(td: &mut TypeDescriptor) {
    td.tp_dealloc = Some(base_object_dealloc);
    td.tp_free = Some(object_free);
}

/// Allocate an instance record of `ty` with `nitems` variable items
pub fn generic_alloc(allocator: &dyn AllocatorPort, ty: Handle, nitems: isize) -> Result<Handle> {
    if ty.is_null() {
        return Err(BridgeError::NotFound(ty));
    }
    let td = unsafe { &*ty.as_type() };
    if nitems < 0 || (td.tp_itemsize == 0 && nitems != 0) {
        return Err(BridgeError::InvalidItemCount {
            type_name: td.name(),
            items: nitems,
        });
    }
    let size = instance_size(td, nitems).ok_or_else(|| BridgeError::SizeOverflow {
        type_name: td.name(),
        items: nitems,
    })?;
    let handle = alloc_record(allocator, size, ty.as_type())?;
    trace!(event = "generic_alloc", ty = %td.name(), size_bytes = size, handle = %handle, "instance allocated");
    Ok(handle)
}

/// `tp_basicsize + nitems * tp_itemsize`, or `None` for negative sizes and
/// overflow
fn instance_size(td: &TypeDescriptor, nitems: isize) -> Option<usize> {
    let basic = usize::try_from(td.tp_basicsize).ok()?;
    let item = usize::try_from(td.tp_itemsize).ok()?;
    item.checked_mul(usize::try_from(nitems).ok()?)?.checked_add(basic)
}

/// Default construction: `tp_alloc(ty, 0)`, or plain allocation without one
pub fn generic_new(bridge: &Bridge, ty: Handle) -> Result<Handle> {
    if ty.is_null() {
        return Err(BridgeError::NotFound(ty));
    }
    let td = unsafe { &*ty.as_type() };
    match td.tp_alloc {
        Some(alloc) => {
            let handle = unsafe { alloc(ty, 0) };
            if handle.is_null() {
                Err(bridge.raise_pending("tp_alloc returned NULL"))
            } else {
                Ok(handle)
            }
        }
        None => generic_alloc(&**bridge.allocator(), ty, 0),
    }
}

/// Finalizer of the base object type: hand the record to its type's free slot
///
/// # Safety
/// `handle` must point at a readable record header.
pub unsafe extern "C" fn base_object_dealloc(handle: Handle) {
    if handle.is_null() {
        return;
    }
    let Some(td) = handle.type_ptr().as_ref() else {
        return;
    };
    if let Some(free) = td.tp_free {
        free(handle.as_void());
    }
}

/// Release a record the bridge allocated, bound or not
///
/// # Safety
/// `ptr` must be null or a record allocated through the current bridge.
pub unsafe extern "C" fn object_free(ptr: *mut c_void) {
    let handle = Handle::from_raw(ptr as *mut u8);
    if handle.is_null() {
        return;
    }
    let released = Bridge::with_current(|bridge| bridge.free_record(handle));
    if released.is_none() {
        error!(event = "ffi_error", function = "object_free", handle = %handle, "no bridge entered on this thread and no default installed");
    }
}

/// Build a host instance of native type `ty`
///
/// Runs `tp_new` (or `generic_new`), binds the record, then runs `tp_init`.
/// The argument handles live until construction finishes and are released
/// exactly once.
pub(crate) fn instantiate(
    bridge: &Bridge,
    ty: &Arc<NativeType>,
    args: &[Obj],
    kwargs: &Kwargs,
) -> Result<Obj> {
    bridge.scoped(|| {
        let args_handle = bridge.store_temp(&Obj::tuple(args.to_vec()))?;
        let kwargs_handle = if kwargs.is_empty() {
            Handle::NULL
        } else {
            bridge.store_temp(&Obj::dict(kwargs.iter().cloned()))?
        };

        let td = ty.descriptor();
        let handle = match td.tp_new {
            Some(new) => {
                let handle = unsafe { new(ty.handle(), args_handle, kwargs_handle) };
                if handle.is_null() {
                    return Err(bridge.raise_pending("tp_new returned NULL"));
                }
                handle
            }
            None => generic_new(bridge, ty.handle())?,
        };

        // The creation reference becomes the host object's reference
        let instance = Obj::new(HostObject::NativeInstance(NativeInstance {
            ty: ty.clone(),
            handle,
        }));
        bridge.object_store().store_bridge(handle, instance.clone())?;

        if let Some(init) = td.tp_init {
            if unsafe { init(handle, args_handle, kwargs_handle) } < 0 {
                let err = bridge.raise_pending("tp_init failed");
                bridge.dec_ref(handle)?;
                return Err(err);
            }
        }

        debug!(event = "instantiate", ty = %ty.qualified_name(), handle = %handle, "native instance created");
        Ok(instance)
    })
}

/// Host object for a native-born record the store has not seen yet
///
/// Type descriptors become `NativeType`s; records typed by a bridged native
/// type become `NativeInstance`s. Either way the new host object takes one
/// reference of its own.
pub(crate) fn adopt(bridge: &Bridge, handle: Handle) -> Result<Obj> {
    if handle.is_null() {
        return Err(BridgeError::NotFound(handle));
    }
    let types = bridge.types();
    let obj = if unsafe { types.is_type_object(handle) } {
        let native = unsafe { NativeType::from_descriptor(handle) };
        debug!(event = "bridge_type", ty = %native.qualified_name(), handle = %handle, "native type bridged");
        Obj::new(HostObject::NativeType(Arc::new(native)))
    } else {
        let ty_handle = Handle::from_type(unsafe { handle.type_ptr() });
        let ty = match bridge.object_store().retrieve(ty_handle) {
            Ok(ty_obj) => match &*ty_obj {
                HostObject::NativeType(ty) => ty.clone(),
                _ => return Err(BridgeError::NotFound(handle)),
            },
            Err(_) => return Err(BridgeError::NotFound(handle)),
        };
        Obj::new(HostObject::NativeInstance(NativeInstance { ty, handle }))
    };

    bridge.object_store().store_bridge(handle, obj.clone())?;
    bridge.object_store().inc_ref(handle)?;
    Ok(obj)
}

/// Host-visible attribute of a native instance: protocol slots, comparison
/// and `tp_methods` entries, bound to the instance
pub(crate) fn instance_attr(inst: &NativeInstance, name: &str) -> Option<Obj> {
    let ty = inst.native_type();
    let slf = inst.handle();

    if let Some((slot, func)) = ty.find_slot(name) {
        let label = format!("{}.{}", ty.name(), name);
        return Some(Obj::function(crate::host::HostFunction::new(
            label,
            move |bridge: &Bridge, args: &[Obj], kwargs: &Kwargs| {
                trace!(event = "slot_dispatch", slot = ?slot, direction = "host_to_native");
                func.invoke(bridge, slf, args, kwargs)
            },
        )));
    }

    if let Some(op) = dispatch::compare_op(name) {
        if let Some(cmp) = ty.descriptor().tp_richcompare {
            return Some(Obj::function(crate::host::HostFunction::new(
                name,
                move |bridge: &Bridge, args: &[Obj], _: &Kwargs| {
                    dispatch::invoke_richcompare(bridge, cmp, slf, args, op)
                },
            )));
        }
    }

    let method = ty.method(name)?;
    let label = method.name().to_string();
    Some(Obj::function(crate::host::HostFunction::new(
        label,
        move |bridge: &Bridge, args: &[Obj], kwargs: &Kwargs| method.call(bridge, slf, args, kwargs),
    )))
}

/// Attribute of a native type object itself
pub(crate) fn type_attr(ty: &NativeType, name: &str) -> Result<Obj> {
    match name {
        "__name__" => Ok(Obj::str(ty.name())),
        "__module__" => Ok(Obj::str(ty.module())),
        "__doc__" => Ok(ty.doc().map(Obj::str).unwrap_or_else(Obj::none)),
        _ => Err(HostError::attribute_error(format!(
            "type object '{}' has no attribute '{}'",
            ty.name(),
            name
        ))
        .into()),
    }
}
