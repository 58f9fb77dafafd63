//! Native -> host adapters - generic `extern "C"` entry points installed in
//! synthesized descriptors
//!
//! One function per calling-convention shape, instantiated per slot through
//! a const parameter holding the slot's index. Each adapter finds the bridge
//! entered on the calling thread, resolves its arguments through the store,
//! calls the host method, stores the result and, when the host fails,
//! records the pending error and returns the slot's sentinel.

use super::{compare_dunder, SlotId};
use crate::allocator::Handle;
use crate::bridge::Bridge;
use crate::errors::{BridgeError, HostError, HostErrorKind, Result};
use crate::host::Obj;
use crate::logging::{error, trace};
use std::ffi::c_int;

/// Table row an adapter was instantiated for; an index past the table
/// fails when the adapter is monomorphized
struct Slot<const INDEX: usize>;

impl<const INDEX: usize> Slot<INDEX> {
    const ID: SlotId = SlotId::ALL[INDEX];
}

pub(super) fn slot_of<const INDEX: usize>() -> SlotId {
    Slot::<INDEX>::ID
}

/// Run `body` against the current bridge, mapping failure to `sentinel`
fn run<R: Copy>(label: &str, sentinel: R, body: impl FnOnce(&Bridge) -> Result<R>) -> R {
    let outcome = Bridge::with_current(|bridge| match body(bridge) {
        Ok(value) => value,
        Err(err) => {
            bridge.record_failure(label, err);
            sentinel
        }
    });
    match outcome {
        Some(value) => value,
        None => {
            error!(event = "ffi_error", slot = label, "slot called with no bridge entered or installed");
            sentinel
        }
    }
}

fn call_dunder(bridge: &Bridge, slf: Handle, dunder: &str, args: Vec<Obj>, kwargs: Vec<(String, Obj)>) -> Result<Obj> {
    let target = bridge.retrieve(slf)?;
    trace!(event = "slot_dispatch", method = dunder, direction = "native_to_host");
    bridge.call_method(&target, dunder, &args, &kwargs)
}

fn optional(bridge: &Bridge, handle: Handle) -> Result<Obj> {
    if handle.is_null() {
        Ok(Obj::none())
    } else {
        bridge.retrieve(handle)
    }
}

fn unpack_call(bridge: &Bridge, args: Handle, kwargs: Handle) -> Result<(Vec<Obj>, Vec<(String, Obj)>)> {
    let positional = if args.is_null() {
        Vec::new()
    } else {
        let tuple = bridge.retrieve(args)?;
        tuple
            .sequence_items()
            .ok_or_else(|| HostError::type_error(format!("argument list must be a tuple, not {}", tuple.type_name())))?
    };
    let keywords = if kwargs.is_null() {
        Vec::new()
    } else {
        let dict = bridge.retrieve(kwargs)?;
        dict.dict_items()
            .ok_or_else(|| HostError::type_error(format!("keywords must be a dict, not {}", dict.type_name())))?
    };
    Ok((positional, keywords))
}

fn int_result(value: &Obj, what: &str) -> Result<isize> {
    value
        .as_int()
        .map(|v| v as isize)
        .ok_or_else(|| HostError::type_error(format!("{} should return an integer, not {}", what, value.type_name())).into())
}

pub unsafe extern "C" fn unary<const SLOT: usize>(slf: Handle) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        let result = call_dunder(bridge, slf, slot.dunder(), Vec::new(), Vec::new())?;
        bridge.store(&result)
    })
}

pub unsafe extern "C" fn binary<const SLOT: usize>(slf: Handle, other: Handle) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        let other = bridge.retrieve(other)?;
        let result = call_dunder(bridge, slf, slot.dunder(), vec![other], Vec::new())?;
        bridge.store(&result)
    })
}

pub unsafe extern "C" fn ternary<const SLOT: usize>(slf: Handle, second: Handle, third: Handle) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        let mut args = vec![bridge.retrieve(second)?];
        let third = optional(bridge, third)?;
        if !third.is_none() {
            args.push(third);
        }
        let result = call_dunder(bridge, slf, slot.dunder(), args, Vec::new())?;
        bridge.store(&result)
    })
}

pub unsafe extern "C" fn call<const SLOT: usize>(slf: Handle, args: Handle, kwargs: Handle) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        let (args, kwargs) = unpack_call(bridge, args, kwargs)?;
        let result = call_dunder(bridge, slf, slot.dunder(), args, kwargs)?;
        bridge.store(&result)
    })
}

pub unsafe extern "C" fn init<const SLOT: usize>(slf: Handle, args: Handle, kwargs: Handle) -> c_int {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let (args, kwargs) = unpack_call(bridge, args, kwargs)?;
        call_dunder(bridge, slf, slot.dunder(), args, kwargs)?;
        Ok(0)
    })
}

pub unsafe extern "C" fn inquiry<const SLOT: usize>(slf: Handle) -> c_int {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let result = call_dunder(bridge, slf, slot.dunder(), Vec::new(), Vec::new())?;
        Ok(result.is_truthy() as c_int)
    })
}

pub unsafe extern "C" fn len<const SLOT: usize>(slf: Handle) -> isize {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let result = call_dunder(bridge, slf, slot.dunder(), Vec::new(), Vec::new())?;
        let length = int_result(&result, slot.dunder())?;
        if length < 0 {
            return Err(HostError::value_error("__len__() should return >= 0").into());
        }
        Ok(length)
    })
}

pub unsafe extern "C" fn hash<const SLOT: usize>(slf: Handle) -> isize {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let result = call_dunder(bridge, slf, slot.dunder(), Vec::new(), Vec::new())?;
        // -1 is the failure sentinel
        match int_result(&result, slot.dunder())? {
            -1 => Ok(-2),
            value => Ok(value),
        }
    })
}

/// Exhaustion is signalled by null with no pending error
pub unsafe extern "C" fn iternext<const SLOT: usize>(slf: Handle) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        match call_dunder(bridge, slf, slot.dunder(), Vec::new(), Vec::new()) {
            Ok(result) => bridge.store(&result),
            Err(BridgeError::Host(err)) if err.is(HostErrorKind::StopIteration) => Ok(Handle::NULL),
            Err(err) => Err(err),
        }
    })
}

pub unsafe extern "C" fn ssize_arg<const SLOT: usize>(slf: Handle, index: isize) -> Handle {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), Handle::NULL, |bridge| {
        let result = call_dunder(bridge, slf, slot.dunder(), vec![Obj::int(index as i64)], Vec::new())?;
        bridge.store(&result)
    })
}

/// A null value means deletion
pub unsafe extern "C" fn ssize_obj_arg<const SLOT: usize>(slf: Handle, index: isize, value: Handle) -> c_int {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let key = Obj::int(index as i64);
        if value.is_null() {
            call_dunder(bridge, slf, "__delitem__", vec![key], Vec::new())?;
        } else {
            let value = bridge.retrieve(value)?;
            call_dunder(bridge, slf, slot.dunder(), vec![key, value], Vec::new())?;
        }
        Ok(0)
    })
}

pub unsafe extern "C" fn obj_obj<const SLOT: usize>(slf: Handle, other: Handle) -> c_int {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let other = bridge.retrieve(other)?;
        let result = call_dunder(bridge, slf, slot.dunder(), vec![other], Vec::new())?;
        Ok(result.is_truthy() as c_int)
    })
}

/// A null value means deletion
pub unsafe extern "C" fn obj_obj_arg<const SLOT: usize>(slf: Handle, key: Handle, value: Handle) -> c_int {
    let slot = slot_of::<SLOT>();
    run(slot.dunder(), -1, |bridge| {
        let key = bridge.retrieve(key)?;
        if value.is_null() {
            call_dunder(bridge, slf, "__delitem__", vec![key], Vec::new())?;
        } else {
            let value = bridge.retrieve(value)?;
            call_dunder(bridge, slf, slot.dunder(), vec![key, value], Vec::new())?;
        }
        Ok(0)
    })
}

pub unsafe extern "C" fn richcompare(slf: Handle, other: Handle, op: c_int) -> Handle {
    run("tp_richcompare", Handle::NULL, |bridge| {
        let dunder = compare_dunder(op)
            .ok_or_else(|| HostError::system_error(format!("invalid comparison opcode {}", op)))?;
        let other = bridge.retrieve(other)?;
        let result = call_dunder(bridge, slf, dunder, vec![other], Vec::new())?;
        bridge.store(&result)
    })
}
