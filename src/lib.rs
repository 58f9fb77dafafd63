//! Shadowbridge - object/type bridge between a refcounted C extension API
//! and a garbage-collected host runtime
//!
//! Native extension modules see every host object through a stable,
//! refcounted shadow record. The bridge keeps the two worlds in agreement:
//! allocation and tracking of shadow records, reference counts, slot dispatch
//! in both directions, call-scoped scratch memory, module initialization and
//! native-visible locks.

pub mod allocator;
pub mod bridge;
pub mod cobject;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod ffi;
pub mod host;
pub mod locks;
pub mod logging;
pub mod module;
pub mod store;
pub mod temps;
pub mod types;

pub use allocator::{AllocatorPort, Handle, HeapAllocator, ObjectHeader};
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use errors::{BridgeError, HostError, HostErrorKind, Result};
pub use host::{HostObject, Obj};
pub use locks::{LockHandle, LockTable};
pub use store::ObjectStore;
pub use temps::TempScope;
pub use types::descriptor::TypeDescriptor;

/// Initialize process-wide facilities (logging from the environment)
pub fn init() {
    logging::init();
    logging::info!(event = "runtime_init", "shadowbridge initialized");
}
