//! Slot dispatch - one declarative table of protocol slots drives both
//! directions of the bridge
//!
//! Each table row names a descriptor slot, the calling-convention shape of
//! its function pointer and the host method it corresponds to. From that the
//! macro derives:
//! - `SlotId::read`, which pulls a populated slot out of a native descriptor
//!   as a typed `NativeFn` the host can invoke;
//! - `SlotId::install_adapter`, which points a synthesized descriptor's slot
//!   at the generic `extern "C"` adapter for that shape (see `adapters`).

pub mod adapters;


use crate::allocator::Handle;
use crate::bridge::Bridge;
use crate::errors::{BridgeError, HostError, Result};
use crate::host::{Kwargs, Obj};
use crate::types::descriptor::{
    c_text, BinaryFunc, CFunction, CFunctionWithKeywords, HashFunc, InitProc, Inquiry, LenFunc,
    MethodDef, ObjObjArgProc, ObjObjProc, RichCmpFunc, SsizeArgFunc, SsizeObjArgProc,
    TernaryFunc, TypeDescriptor, UnaryFunc, CMP_EQ, CMP_GE, CMP_GT, CMP_LE, CMP_LT, CMP_NE,
    METH_KEYWORDS, METH_NOARGS, METH_O, METH_VARARGS,
};
use crate::types::OwnedDescriptor;
use std::ffi::c_int;

/// Calling-convention shape of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    Binary,
    Ternary,
    Call,
    Init,
    Inquiry,
    Len,
    Hash,
    IterNext,
    SsizeArg,
    SsizeObjArg,
    ObjObj,
    ObjObjArg,
}

/// Populated native slot, tagged with its shape
#[derive(Debug, Clone, Copy)]
pub enum NativeFn {
    Unary(UnaryFunc),
    Binary(BinaryFunc),
    Ternary(TernaryFunc),
    Call(TernaryFunc),
    Init(InitProc),
    Inquiry(Inquiry),
    Len(LenFunc),
    Hash(HashFunc),
    IterNext(UnaryFunc),
    SsizeArg(SsizeArgFunc),
    SsizeObjArg(SsizeObjArgProc),
    ObjObj(ObjObjProc),
    ObjObjArg(ObjObjArgProc),
}

macro_rules! slot_group {
    ($td:expr, tp) => {
        Some($td)
    };
    ($td:expr, number) => {
        $td.number()
    };
    ($td:expr, sequence) => {
        $td.sequence()
    };
    ($td:expr, mapping) => {
        $td.mapping()
    };
}

macro_rules! slot_group_mut {
    ($owned:expr, tp) => {
        $owned.descriptor_mut()
    };
    ($owned:expr, number) => {
        $owned.number_mut()
    };
    ($owned:expr, sequence) => {
        $owned.sequence_mut()
    };
    ($owned:expr, mapping) => {
        $owned.mapping_mut()
    };
}

macro_rules! adapter_for {
    (Unary, $slot:expr) => { $crate::dispatch::adapters::unary::<{ $slot as usize }> };
    (Binary, $slot:expr) => { $crate::dispatch::adapters::binary::<{ $slot as usize }> };
    (Ternary, $slot:expr) => { $crate::dispatch::adapters::ternary::<{ $slot as usize }> };
    (Call, $slot:expr) => { $crate::dispatch::adapters::call::<{ $slot as usize }> };
    (Init, $slot:expr) => { $crate::dispatch::adapters::init::<{ $slot as usize }> };
    (Inquiry, $slot:expr) => { $crate::dispatch::adapters::inquiry::<{ $slot as usize }> };
    (Len, $slot:expr) => { $crate::dispatch::adapters::len::<{ $slot as usize }> };
    (Hash, $slot:expr) => { $crate::dispatch::adapters::hash::<{ $slot as usize }> };
    (IterNext, $slot:expr) => { $crate::dispatch::adapters::iternext::<{ $slot as usize }> };
    (SsizeArg, $slot:expr) => { $crate::dispatch::adapters::ssize_arg::<{ $slot as usize }> };
    (SsizeObjArg, $slot:expr) => { $crate::dispatch::adapters::ssize_obj_arg::<{ $slot as usize }> };
    (ObjObj, $slot:expr) => { $crate::dispatch::adapters::obj_obj::<{ $slot as usize }> };
    (ObjObjArg, $slot:expr) => { $crate::dispatch::adapters::obj_obj_arg::<{ $slot as usize }> };
}

macro_rules! protocol_slots {
    ($($id:ident => $group:ident . $field:ident : $shape:ident = $dunder:literal;)*) => {
        /// Protocol slot of a type descriptor
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SlotId {
            $($id,)*
        }

        impl SlotId {
            /// Every slot, in table order (index = discriminant)
            pub const ALL: &'static [SlotId] = &[$(SlotId::$id,)*];

            /// Host method the slot corresponds to
            pub fn dunder(self) -> &'static str {
                match self {
                    $(SlotId::$id => $dunder,)*
                }
            }

            pub fn shape(self) -> CallShape {
                match self {
                    $(SlotId::$id => CallShape::$shape,)*
                }
            }

            /// Populated slot pointer in `td`, if any
            pub fn read(self, td: &TypeDescriptor) -> Option<NativeFn> {
                match self {
                    $(SlotId::$id => slot_group!(td, $group)
                        .and_then(|group| group.$field)
                        .map(NativeFn::$shape),)*
                }
            }

            /// Point this slot of a bridge-owned descriptor at its adapter
            pub(crate) fn install_adapter(self, owned: &mut OwnedDescriptor) {
                match self {
                    $(SlotId::$id => {
                        slot_group_mut!(owned, $group).$field = Some(adapter_for!($shape, SlotId::$id));
                    })*
                }
            }
        }
    };
}

protocol_slots! {
    TpInit => tp.tp_init: Init = "__init__";
    TpRepr => tp.tp_repr: Unary = "__repr__";
    TpStr => tp.tp_str: Unary = "__str__";
    TpHash => tp.tp_hash: Hash = "__hash__";
    TpCall => tp.tp_call: Call = "__call__";
    TpIter => tp.tp_iter: Unary = "__iter__";
    TpIterNext => tp.tp_iternext: IterNext = "__next__";

    NbAdd => number.nb_add: Binary = "__add__";
    NbSubtract => number.nb_subtract: Binary = "__sub__";
    NbMultiply => number.nb_multiply: Binary = "__mul__";
    NbRemainder => number.nb_remainder: Binary = "__mod__";
    NbDivmod => number.nb_divmod: Binary = "__divmod__";
    NbPower => number.nb_power: Ternary = "__pow__";
    NbNegative => number.nb_negative: Unary = "__neg__";
    NbPositive => number.nb_positive: Unary = "__pos__";
    NbAbsolute => number.nb_absolute: Unary = "__abs__";
    NbBool => number.nb_bool: Inquiry = "__bool__";
    NbInvert => number.nb_invert: Unary = "__invert__";
    NbLshift => number.nb_lshift: Binary = "__lshift__";
    NbRshift => number.nb_rshift: Binary = "__rshift__";
    NbAnd => number.nb_and: Binary = "__and__";
    NbXor => number.nb_xor: Binary = "__xor__";
    NbOr => number.nb_or: Binary = "__or__";
    NbInt => number.nb_int: Unary = "__int__";
    NbFloat => number.nb_float: Unary = "__float__";
    NbInplaceAdd => number.nb_inplace_add: Binary = "__iadd__";
    NbInplaceSubtract => number.nb_inplace_subtract: Binary = "__isub__";
    NbInplaceMultiply => number.nb_inplace_multiply: Binary = "__imul__";
    NbFloorDivide => number.nb_floor_divide: Binary = "__floordiv__";
    NbTrueDivide => number.nb_true_divide: Binary = "__truediv__";
    NbIndex => number.nb_index: Unary = "__index__";

    MpLength => mapping.mp_length: Len = "__len__";
    MpSubscript => mapping.mp_subscript: Binary = "__getitem__";
    MpAssSubscript => mapping.mp_ass_subscript: ObjObjArg = "__setitem__";

    SqLength => sequence.sq_length: Len = "__len__";
    SqConcat => sequence.sq_concat: Binary = "__add__";
    SqItem => sequence.sq_item: SsizeArg = "__getitem__";
    SqAssItem => sequence.sq_ass_item: SsizeObjArg = "__setitem__";
    SqContains => sequence.sq_contains: ObjObj = "__contains__";
}

impl SlotId {
    pub fn from_index(index: usize) -> Option<SlotId> {
        Self::ALL.get(index).copied()
    }
}

/// Rich comparison dunders and their opcodes
pub const COMPARE_OPS: [(&str, c_int); 6] = [
    ("__lt__", CMP_LT),
    ("__le__", CMP_LE),
    ("__eq__", CMP_EQ),
    ("__ne__", CMP_NE),
    ("__gt__", CMP_GT),
    ("__ge__", CMP_GE),
];

pub fn compare_op(dunder: &str) -> Option<c_int> {
    COMPARE_OPS
        .iter()
        .find(|(name, _)| *name == dunder)
        .map(|(_, op)| *op)
}

pub fn compare_dunder(op: c_int) -> Option<&'static str> {
    COMPARE_OPS
        .iter()
        .find(|(_, code)| *code == op)
        .map(|(name, _)| *name)
}

fn arity<'a>(args: &'a [Obj], min: usize, max: usize, what: &str) -> Result<&'a [Obj]> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(HostError::type_error(format!(
            "{} expected {} arguments, got {}",
            what,
            expected,
            args.len()
        ))
        .into());
    }
    Ok(args)
}

fn index_arg(arg: &Obj) -> Result<isize> {
    arg.as_int()
        .map(|i| i as isize)
        .ok_or_else(|| HostError::type_error(format!("indices must be integers, not {}", arg.type_name())).into())
}

fn status(bridge: &Bridge, rc: c_int, what: &str) -> Result<Obj> {
    if rc < 0 {
        Err(bridge.raise_pending(&format!("{} failed", what)))
    } else {
        Ok(Obj::none())
    }
}

/// Positional tuple and keyword dict handles for a native call; the dict
/// handle is null when there are no keywords
fn call_handles(bridge: &Bridge, args: &[Obj], kwargs: &Kwargs) -> Result<(Handle, Handle)> {
    let args_handle = bridge.store_temp(&Obj::tuple(args.to_vec()))?;
    let kwargs_handle = if kwargs.is_empty() {
        Handle::NULL
    } else {
        bridge.store_temp(&Obj::dict(kwargs.iter().cloned()))?
    };
    Ok((args_handle, kwargs_handle))
}

impl NativeFn {
    pub fn shape(&self) -> CallShape {
        match self {
            NativeFn::Unary(_) => CallShape::Unary,
            NativeFn::Binary(_) => CallShape::Binary,
            NativeFn::Ternary(_) => CallShape::Ternary,
            NativeFn::Call(_) => CallShape::Call,
            NativeFn::Init(_) => CallShape::Init,
            NativeFn::Inquiry(_) => CallShape::Inquiry,
            NativeFn::Len(_) => CallShape::Len,
            NativeFn::Hash(_) => CallShape::Hash,
            NativeFn::IterNext(_) => CallShape::IterNext,
            NativeFn::SsizeArg(_) => CallShape::SsizeArg,
            NativeFn::SsizeObjArg(_) => CallShape::SsizeObjArg,
            NativeFn::ObjObj(_) => CallShape::ObjObj,
            NativeFn::ObjObjArg(_) => CallShape::ObjObjArg,
        }
    }

    /// Call the slot on `slf` from the host side
    ///
    /// Arguments are stored for the duration of the call only; a returned
    /// new reference is retrieved then released; a failure sentinel becomes
    /// the pending host error.
    pub fn invoke(self, bridge: &Bridge, slf: Handle, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
        let what = format!("{:?} slot", self.shape());
        bridge.scoped(|| match self {
            NativeFn::Unary(f) => {
                arity(args, 0, 0, &what)?;
                bridge.claim_result(unsafe { f(slf) }, &what)
            }
            NativeFn::IterNext(f) => {
                arity(args, 0, 0, &what)?;
                let result = unsafe { f(slf) };
                if result.is_null() && !bridge.has_pending_error() {
                    return Err(HostError::stop_iteration().into());
                }
                bridge.claim_result(result, &what)
            }
            NativeFn::Binary(f) => {
                let args = arity(args, 1, 1, &what)?;
                let other = bridge.store_temp(&args[0])?;
                bridge.claim_result(unsafe { f(slf, other) }, &what)
            }
            NativeFn::Ternary(f) => {
                let args = arity(args, 1, 2, &what)?;
                let second = bridge.store_temp(&args[0])?;
                let third = bridge.store_temp(&args.get(1).cloned().unwrap_or_else(Obj::none))?;
                bridge.claim_result(unsafe { f(slf, second, third) }, &what)
            }
            NativeFn::Call(f) => {
                let (a, k) = call_handles(bridge, args, kwargs)?;
                bridge.claim_result(unsafe { f(slf, a, k) }, &what)
            }
            NativeFn::Init(f) => {
                let (a, k) = call_handles(bridge, args, kwargs)?;
                status(bridge, unsafe { f(slf, a, k) }, &what)
            }
            NativeFn::Inquiry(f) => {
                arity(args, 0, 0, &what)?;
                let rc = unsafe { f(slf) };
                if rc < 0 {
                    Err(bridge.raise_pending(&what))
                } else {
                    Ok(Obj::bool(rc != 0))
                }
            }
            NativeFn::Len(f) | NativeFn::Hash(f) => {
                arity(args, 0, 0, &what)?;
                let value = unsafe { f(slf) };
                if value == -1 {
                    Err(bridge.raise_pending(&what))
                } else {
                    Ok(Obj::int(value as i64))
                }
            }
            NativeFn::SsizeArg(f) => {
                let args = arity(args, 1, 1, &what)?;
                let index = index_arg(&args[0])?;
                bridge.claim_result(unsafe { f(slf, index) }, &what)
            }
            NativeFn::SsizeObjArg(f) => {
                let args = arity(args, 2, 2, &what)?;
                let index = index_arg(&args[0])?;
                let value = bridge.store_temp(&args[1])?;
                status(bridge, unsafe { f(slf, index, value) }, &what)
            }
            NativeFn::ObjObj(f) => {
                let args = arity(args, 1, 1, &what)?;
                let other = bridge.store_temp(&args[0])?;
                let rc = unsafe { f(slf, other) };
                if rc < 0 {
                    Err(bridge.raise_pending(&what))
                } else {
                    Ok(Obj::bool(rc != 0))
                }
            }
            NativeFn::ObjObjArg(f) => {
                let args = arity(args, 2, 2, &what)?;
                let key = bridge.store_temp(&args[0])?;
                let value = bridge.store_temp(&args[1])?;
                status(bridge, unsafe { f(slf, key, value) }, &what)
            }
        })
    }
}

/// Host-side call of a native `tp_richcompare` with a fixed opcode
pub(crate) fn invoke_richcompare(
    bridge: &Bridge,
    f: RichCmpFunc,
    slf: Handle,
    args: &[Obj],
    op: c_int,
) -> Result<Obj> {
    bridge.scoped(|| {
        let args = arity(args, 1, 1, "richcompare")?;
        let other = bridge.store_temp(&args[0])?;
        bridge.claim_result(unsafe { f(slf, other, op) }, "tp_richcompare")
    })
}

/// Native function from a method table, with its calling convention
#[derive(Debug, Clone)]
pub struct BoundMethod {
    name: String,
    doc: Option<String>,
    meth: CFunction,
    flags: c_int,
}

impl BoundMethod {
    /// # Safety
    /// `def` must carry valid C strings (or nulls) and a function matching
    /// its flags.
    pub unsafe fn from_def(def: &MethodDef) -> Option<Self> {
        Some(Self {
            name: c_text(def.ml_name)?,
            doc: c_text(def.ml_doc),
            meth: def.ml_meth?,
            flags: def.ml_flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn flags(&self) -> c_int {
        self.flags
    }

    /// Call with `slf` as the native self argument, in a fresh temp scope
    pub fn call(&self, bridge: &Bridge, slf: Handle, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
        bridge.scoped(|| {
            let result = if self.flags & METH_NOARGS != 0 {
                if !args.is_empty() || !kwargs.is_empty() {
                    return Err(self.type_error(format!("takes no arguments ({} given)", args.len())));
                }
                unsafe { (self.meth)(slf, Handle::NULL) }
            } else if self.flags & METH_O != 0 {
                if args.len() != 1 || !kwargs.is_empty() {
                    return Err(self.type_error(format!(
                        "takes exactly one argument ({} given)",
                        args.len()
                    )));
                }
                let arg = bridge.store_temp(&args[0])?;
                unsafe { (self.meth)(slf, arg) }
            } else if self.flags & METH_KEYWORDS != 0 {
                let (a, k) = call_handles(bridge, args, kwargs)?;
                // Safety: METH_KEYWORDS entries hold the three-argument form
                let meth = unsafe { std::mem::transmute::<CFunction, CFunctionWithKeywords>(self.meth) };
                unsafe { meth(slf, a, k) }
            } else if self.flags & METH_VARARGS != 0 {
                if !kwargs.is_empty() {
                    return Err(self.type_error("takes no keyword arguments".to_string()));
                }
                let (a, _) = call_handles(bridge, args, &[])?;
                unsafe { (self.meth)(slf, a) }
            } else {
                return Err(self.type_error(format!("has unsupported flags {:#x}", self.flags)));
            };
            bridge.claim_result(result, &self.name)
        })
    }

    fn type_error(&self, detail: String) -> BridgeError {
        HostError::type_error(format!("{}() {}", self.name, detail)).into()
    }
}
