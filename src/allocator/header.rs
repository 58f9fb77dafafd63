//! Shadow record layout - the header every native-visible record starts with
//!
//! Native code reads these fields directly, so the layout is part of the
//! binary contract: `ob_refcnt` at offset 0, `ob_type` right after it.

use crate::types::descriptor::TypeDescriptor;
use std::ffi::c_void;
use std::fmt;

/// Header at offset 0 of every shadow record
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    pub ob_refcnt: isize,
    pub ob_type: *mut TypeDescriptor,
}

impl ObjectHeader {
    pub const SIZE: usize = std::mem::size_of::<ObjectHeader>();

    /// Header for a freshly created record: one reference, given type
    pub const fn new(ob_type: *mut TypeDescriptor) -> Self {
        Self {
            ob_refcnt: 1,
            ob_type,
        }
    }
}

/// Address of a shadow record as seen by native code
///
/// Compared and hashed by address only. A handle does not keep anything
/// alive; the store decides whether it still names a live record.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(*mut ObjectHeader);

// Safety: a Handle is an address. Every dereference happens either under the
// store lock or inside native code that owns a reference to the record.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub const NULL: Handle = Handle(std::ptr::null_mut());

    #[inline]
    pub const fn from_ptr(ptr: *mut ObjectHeader) -> Self {
        Handle(ptr)
    }

    #[inline]
    pub fn from_raw(ptr: *mut u8) -> Self {
        Handle(ptr as *mut ObjectHeader)
    }

    /// Type descriptors are records too; their header comes first
    #[inline]
    pub fn from_type(td: *mut TypeDescriptor) -> Self {
        Handle(td as *mut ObjectHeader)
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut ObjectHeader {
        self.0
    }

    #[inline]
    pub fn as_bytes(self) -> *mut u8 {
        self.0 as *mut u8
    }

    #[inline]
    pub fn as_void(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    #[inline]
    pub fn as_type(self) -> *mut TypeDescriptor {
        self.0 as *mut TypeDescriptor
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// # Safety
    /// The handle must point at a readable record header.
    #[inline]
    pub unsafe fn refcnt(self) -> isize {
        (*self.0).ob_refcnt
    }

    /// # Safety
    /// The handle must point at a writable record header.
    #[inline]
    pub unsafe fn set_refcnt(self, count: isize) {
        (*self.0).ob_refcnt = count;
    }

    /// # Safety
    /// The handle must point at a readable record header.
    #[inline]
    pub unsafe fn type_ptr(self) -> *mut TypeDescriptor {
        (*self.0).ob_type
    }

    /// # Safety
    /// The handle must point at a writable record header.
    #[inline]
    pub unsafe fn set_type(self, ob_type: *mut TypeDescriptor) {
        (*self.0).ob_type = ob_type;
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NULL
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.addr())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}
