//! Error types for every bridge operation
//!
//! Rust callers get `Result<T, BridgeError>`; native callers only ever see the
//! failure sentinel of the slot or entry point they called, with the detail
//! parked as the bridge's pending `HostError`.

use crate::allocator::Handle;
use crate::locks::LockHandle;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no live object for handle {0:?}")]
    NotFound(Handle),

    #[error("reference count of {0:?} would drop below zero")]
    RefCountViolation(Handle),

    #[error("cannot store {0} through the managed path")]
    TypeViolation(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("failed to allocate {size} bytes")]
    Allocation { size: usize },

    #[error("type {type_name} has fixed-size instances, cannot allocate {items} items")]
    InvalidItemCount { type_name: String, items: isize },

    #[error("instance size of type {type_name} overflows with {items} items")]
    SizeOverflow { type_name: String, items: isize },

    #[error("handle {0:?} does not refer to a module")]
    NotAModule(Handle),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("unknown lock handle {0}")]
    UnknownLock(LockHandle),
}

impl BridgeError {
    /// Collapse into the error the host caller observes
    pub fn into_host(self) -> HostError {
        match self {
            BridgeError::Host(err) => err,
            BridgeError::NotFound(_) | BridgeError::UnknownLock(_) => {
                HostError::new(HostErrorKind::KeyError, self.to_string())
            }
            BridgeError::TypeViolation(_) | BridgeError::NotAModule(_) => {
                HostError::new(HostErrorKind::TypeError, self.to_string())
            }
            BridgeError::InvalidItemCount { .. } | BridgeError::InvalidName(_) => {
                HostError::new(HostErrorKind::ValueError, self.to_string())
            }
            BridgeError::Allocation { .. } | BridgeError::SizeOverflow { .. } => {
                HostError::new(HostErrorKind::MemoryError, self.to_string())
            }
            BridgeError::RefCountViolation(_) => {
                HostError::new(HostErrorKind::SystemError, self.to_string())
            }
        }
    }
}

/// Exception category raised into the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HostErrorKind {
    TypeError = 1,
    ValueError = 2,
    KeyError = 3,
    IndexError = 4,
    AttributeError = 5,
    StopIteration = 6,
    RuntimeError = 7,
    MemoryError = 8,
    SystemError = 9,
}

impl HostErrorKind {
    /// Decode a kind passed across the native boundary
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => HostErrorKind::TypeError,
            2 => HostErrorKind::ValueError,
            3 => HostErrorKind::KeyError,
            4 => HostErrorKind::IndexError,
            5 => HostErrorKind::AttributeError,
            6 => HostErrorKind::StopIteration,
            7 => HostErrorKind::RuntimeError,
            8 => HostErrorKind::MemoryError,
            _ => HostErrorKind::SystemError,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            HostErrorKind::TypeError => "TypeError",
            HostErrorKind::ValueError => "ValueError",
            HostErrorKind::KeyError => "KeyError",
            HostErrorKind::IndexError => "IndexError",
            HostErrorKind::AttributeError => "AttributeError",
            HostErrorKind::StopIteration => "StopIteration",
            HostErrorKind::RuntimeError => "RuntimeError",
            HostErrorKind::MemoryError => "MemoryError",
            HostErrorKind::SystemError => "SystemError",
        }
    }
}

impl fmt::Display for HostErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host exception: a kind plus a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: HostErrorKind,
    pub message: String,
}

impl HostError {
    pub fn new(kind: HostErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::ValueError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::AttributeError, message)
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorKind::SystemError, message)
    }

    pub fn stop_iteration() -> Self {
        Self::new(HostErrorKind::StopIteration, "")
    }

    pub fn is(&self, kind: HostErrorKind) -> bool {
        self.kind == kind
    }
}
