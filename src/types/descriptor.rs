//! Type descriptor layout - the fixed-order slot record native code reads
//!
//! Field order is part of the binary contract with native extensions; a
//! descriptor is itself a record, so it starts with an `ObjectHeader`.

use crate::allocator::{Handle, ObjectHeader};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;

pub type Destructor = unsafe extern "C" fn(Handle);
pub type FreeFunc = unsafe extern "C" fn(*mut c_void);
pub type AllocFunc = unsafe extern "C" fn(Handle, isize) -> Handle;
pub type NewFunc = unsafe extern "C" fn(Handle, Handle, Handle) -> Handle;
pub type InitProc = unsafe extern "C" fn(Handle, Handle, Handle) -> c_int;
pub type UnaryFunc = unsafe extern "C" fn(Handle) -> Handle;
pub type BinaryFunc = unsafe extern "C" fn(Handle, Handle) -> Handle;
pub type TernaryFunc = unsafe extern "C" fn(Handle, Handle, Handle) -> Handle;
pub type Inquiry = unsafe extern "C" fn(Handle) -> c_int;
pub type LenFunc = unsafe extern "C" fn(Handle) -> isize;
pub type HashFunc = unsafe extern "C" fn(Handle) -> isize;
pub type SsizeArgFunc = unsafe extern "C" fn(Handle, isize) -> Handle;
pub type SsizeObjArgProc = unsafe extern "C" fn(Handle, isize, Handle) -> c_int;
pub type ObjObjProc = unsafe extern "C" fn(Handle, Handle) -> c_int;
pub type ObjObjArgProc = unsafe extern "C" fn(Handle, Handle, Handle) -> c_int;
pub type RichCmpFunc = unsafe extern "C" fn(Handle, Handle, c_int) -> Handle;
pub type CFunction = unsafe extern "C" fn(Handle, Handle) -> Handle;
pub type CFunctionWithKeywords = unsafe extern "C" fn(Handle, Handle, Handle) -> Handle;

pub const METH_VARARGS: c_int = 0x0001;
pub const METH_KEYWORDS: c_int = 0x0002;
pub const METH_NOARGS: c_int = 0x0004;
pub const METH_O: c_int = 0x0008;

/// Comparison opcodes passed to `tp_richcompare`
pub const CMP_LT: c_int = 0;
pub const CMP_LE: c_int = 1;
pub const CMP_EQ: c_int = 2;
pub const CMP_NE: c_int = 3;
pub const CMP_GT: c_int = 4;
pub const CMP_GE: c_int = 5;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NumberMethods {
    pub nb_add: Option<BinaryFunc>,
    pub nb_subtract: Option<BinaryFunc>,
    pub nb_multiply: Option<BinaryFunc>,
    pub nb_remainder: Option<BinaryFunc>,
    pub nb_divmod: Option<BinaryFunc>,
    pub nb_power: Option<TernaryFunc>,
    pub nb_negative: Option<UnaryFunc>,
    pub nb_positive: Option<UnaryFunc>,
    pub nb_absolute: Option<UnaryFunc>,
    pub nb_bool: Option<Inquiry>,
    pub nb_invert: Option<UnaryFunc>,
    pub nb_lshift: Option<BinaryFunc>,
    pub nb_rshift: Option<BinaryFunc>,
    pub nb_and: Option<BinaryFunc>,
    pub nb_xor: Option<BinaryFunc>,
    pub nb_or: Option<BinaryFunc>,
    pub nb_int: Option<UnaryFunc>,
    pub nb_float: Option<UnaryFunc>,
    pub nb_inplace_add: Option<BinaryFunc>,
    pub nb_inplace_subtract: Option<BinaryFunc>,
    pub nb_inplace_multiply: Option<BinaryFunc>,
    pub nb_floor_divide: Option<BinaryFunc>,
    pub nb_true_divide: Option<BinaryFunc>,
    pub nb_index: Option<UnaryFunc>,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceMethods {
    pub sq_length: Option<LenFunc>,
    pub sq_concat: Option<BinaryFunc>,
    pub sq_item: Option<SsizeArgFunc>,
    pub sq_ass_item: Option<SsizeObjArgProc>,
    pub sq_contains: Option<ObjObjProc>,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingMethods {
    pub mp_length: Option<LenFunc>,
    pub mp_subscript: Option<BinaryFunc>,
    pub mp_ass_subscript: Option<ObjObjArgProc>,
}

/// Entry of a null-terminated method table
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MethodDef {
    pub ml_name: *const c_char,
    pub ml_meth: Option<CFunction>,
    pub ml_flags: c_int,
    pub ml_doc: *const c_char,
}

// Safety: entries point at static strings and code
unsafe impl Send for MethodDef {}
unsafe impl Sync for MethodDef {}

impl MethodDef {
    pub const SENTINEL: MethodDef = MethodDef {
        ml_name: ptr::null(),
        ml_meth: None,
        ml_flags: 0,
        ml_doc: ptr::null(),
    };

    pub fn new(name: &'static CStr, meth: CFunction, flags: c_int) -> Self {
        Self {
            ml_name: name.as_ptr(),
            ml_meth: Some(meth),
            ml_flags: flags,
            ml_doc: ptr::null(),
        }
    }

    /// Entry for a `METH_VARARGS | METH_KEYWORDS` function
    pub fn with_keywords(name: &'static CStr, meth: CFunctionWithKeywords) -> Self {
        // Safety: native tables store the three-argument form in the same
        // slot and tell the conventions apart by flags
        let meth = unsafe { std::mem::transmute::<CFunctionWithKeywords, CFunction>(meth) };
        Self::new(name, meth, METH_VARARGS | METH_KEYWORDS)
    }

    pub fn doc(mut self, doc: &'static CStr) -> Self {
        self.ml_doc = doc.as_ptr();
        self
    }

    pub fn is_sentinel(&self) -> bool {
        self.ml_name.is_null()
    }
}

/// Walk a native method table up to its sentinel
///
/// # Safety
/// `table` must be null or point at a sentinel-terminated array.
pub unsafe fn method_table(table: *const MethodDef) -> Vec<MethodDef> {
    let mut entries = Vec::new();
    if table.is_null() {
        return entries;
    }
    let mut cursor = table;
    while !(*cursor).is_sentinel() {
        entries.push(*cursor);
        cursor = cursor.add(1);
    }
    entries
}

/// Read an optional C string
///
/// # Safety
/// `text` must be null or a valid NUL-terminated string.
pub unsafe fn c_text(text: *const c_char) -> Option<String> {
    if text.is_null() {
        None
    } else {
        Some(CStr::from_ptr(text).to_string_lossy().into_owned())
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct TypeDescriptor {
    pub ob_base: ObjectHeader,
    pub tp_name: *const c_char,
    pub tp_basicsize: isize,
    pub tp_itemsize: isize,
    pub tp_dealloc: Option<Destructor>,
    pub tp_free: Option<FreeFunc>,
    pub tp_alloc: Option<AllocFunc>,
    pub tp_new: Option<NewFunc>,
    pub tp_init: Option<InitProc>,
    pub tp_repr: Option<UnaryFunc>,
    pub tp_str: Option<UnaryFunc>,
    pub tp_hash: Option<HashFunc>,
    pub tp_call: Option<TernaryFunc>,
    pub tp_richcompare: Option<RichCmpFunc>,
    pub tp_iter: Option<UnaryFunc>,
    pub tp_iternext: Option<UnaryFunc>,
    pub tp_as_number: *mut NumberMethods,
    pub tp_as_sequence: *mut SequenceMethods,
    pub tp_as_mapping: *mut MappingMethods,
    pub tp_methods: *const MethodDef,
    pub tp_doc: *const c_char,
}

impl TypeDescriptor {
    /// Descriptor with no slots, sized for a bare header
    pub const fn empty() -> Self {
        Self {
            ob_base: ObjectHeader::new(ptr::null_mut()),
            tp_name: ptr::null(),
            tp_basicsize: ObjectHeader::SIZE as isize,
            tp_itemsize: 0,
            tp_dealloc: None,
            tp_free: None,
            tp_alloc: None,
            tp_new: None,
            tp_init: None,
            tp_repr: None,
            tp_str: None,
            tp_hash: None,
            tp_call: None,
            tp_richcompare: None,
            tp_iter: None,
            tp_iternext: None,
            tp_as_number: ptr::null_mut(),
            tp_as_sequence: ptr::null_mut(),
            tp_as_mapping: ptr::null_mut(),
            tp_methods: ptr::null(),
            tp_doc: ptr::null(),
        }
    }

    pub fn named(name: &'static CStr) -> Self {
        Self {
            tp_name: name.as_ptr(),
            ..Self::empty()
        }
    }

    pub fn name(&self) -> String {
        unsafe { c_text(self.tp_name) }.unwrap_or_default()
    }

    pub fn doc(&self) -> Option<String> {
        unsafe { c_text(self.tp_doc) }
    }

    pub fn number(&self) -> Option<&NumberMethods> {
        unsafe { self.tp_as_number.as_ref() }
    }

    pub fn sequence(&self) -> Option<&SequenceMethods> {
        unsafe { self.tp_as_sequence.as_ref() }
    }

    pub fn mapping(&self) -> Option<&MappingMethods> {
        unsafe { self.tp_as_mapping.as_ref() }
    }

    /// Methods listed in `tp_methods`
    pub fn methods(&self) -> Vec<MethodDef> {
        unsafe { method_table(self.tp_methods) }
    }

    /// Handle of this descriptor as a record
    pub fn handle(&mut self) -> Handle {
        Handle::from_type(self as *mut TypeDescriptor)
    }
}

impl Default for TypeDescriptor {
    fn default() -> Self {
        Self::empty()
    }
}
