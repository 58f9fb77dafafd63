//! Module bridge - host modules built from native method tables
//!
//! Design: a module is a host object around a live globals dict. Native
//! functions from the method table become host callables that run each call
//! in its own temp scope with the calling convention their flags declare.
//! Modules are registered by full dotted name for the life of the bridge;
//! missing parent packages are created and linked on the way.

#[cfg(test)]
mod tests;

use crate::allocator::Handle;
use crate::bridge::Bridge;
use crate::dispatch::BoundMethod;
use crate::errors::{BridgeError, Result};
use crate::host::{HostFunction, HostObject, Kwargs, Obj};
use crate::logging::{debug, info};
use crate::types::descriptor::MethodDef;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;

/// Host module: a name and its globals
pub struct ModuleRecord {
    name: String,
    globals: Obj,
}

impl ModuleRecord {
    pub fn new(name: &str) -> Self {
        let globals = Obj::dict([("__name__", Obj::str(name)), ("__doc__", Obj::none())]);
        Self {
            name: name.to_string(),
            globals,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<Obj> {
        self.globals.dict_get(key)
    }

    pub fn set(&self, key: &str, value: Obj) {
        self.globals.dict_set(key, value);
    }

    /// The live globals dict
    pub fn globals(&self) -> &Obj {
        &self.globals
    }

    pub fn keys(&self) -> Vec<String> {
        self.globals
            .dict_items()
            .map(|items| items.into_iter().map(|(k, _)| k).collect())
            .unwrap_or_default()
    }
}

/// Process-lifetime table of modules by dotted name, plus the stack of
/// files currently being imported
#[derive(Default)]
pub struct ModuleRegistry {
    modules: DashMap<String, Obj>,
    import_files: Mutex<Vec<Option<String>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Obj> {
        self.modules.get(name).map(|m| m.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    fn register(&self, name: &str, module: Obj) {
        self.modules.insert(name.to_string(), module);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Note the file an extension module is being loaded from
    pub fn push_import_file(&self, path: Option<String>) {
        self.import_files.lock().push(path);
    }

    pub fn pop_import_file(&self) -> Option<String> {
        self.import_files.lock().pop().flatten()
    }

    pub fn current_import_file(&self) -> Option<String> {
        self.import_files.lock().last().cloned().flatten()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(BridgeError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn module_of(obj: &Obj) -> Option<&ModuleRecord> {
    match &**obj {
        HostObject::Module(module) => Some(module),
        _ => None,
    }
}

/// Create `a` and `a.b` for `a.b.c` when missing and link each child into
/// its parent
fn link_parents(bridge: &Bridge, name: &str, module: &Obj) {
    let registry = bridge.modules();
    let mut child_name = name;
    let mut child = module.clone();
    while let Some((parent_name, short)) = child_name.rsplit_once('.') {
        let parent = registry.get(parent_name).unwrap_or_else(|| {
            let parent = Obj::new(HostObject::Module(ModuleRecord::new(parent_name)));
            mark_package(&parent);
            registry.register(parent_name, parent.clone());
            debug!(event = "module_init", module = parent_name, "parent package created");
            parent
        });
        if let Some(record) = module_of(&parent) {
            record.set(short, child.clone());
        }
        child_name = parent_name;
        child = parent;
    }
}

fn mark_package(package: &Obj) {
    if let Some(record) = module_of(package) {
        record.set("__path__", Obj::list(Vec::new()));
    }
}

/// Fresh, empty module registered under `name`
pub fn module_new(bridge: &Bridge, name: &str) -> Result<Obj> {
    validate_name(name)?;
    let module = Obj::new(HostObject::Module(ModuleRecord::new(name)));
    bridge.modules().register(name, module.clone());
    link_parents(bridge, name, &module);
    Ok(module)
}

/// Registered module `name`
pub fn get_module(bridge: &Bridge, name: &str) -> Option<Obj> {
    bridge.modules().get(name)
}

/// Build, register and store the module for a native method table
///
/// Every entry is bound with the calling convention its flags declare and
/// receives `self_handle` as its native self argument. Returns a new
/// reference to the module's record.
pub fn init_module(
    bridge: &Bridge,
    name: &str,
    methods: &[MethodDef],
    doc: Option<&str>,
    self_handle: Handle,
    api_version: i32,
) -> Result<Handle> {
    let module = module_new(bridge, name)?;
    let record = module_of(&module).ok_or_else(|| BridgeError::InvalidName(name.to_string()))?;

    record.set("__doc__", doc.map(Obj::str).unwrap_or_else(Obj::none));
    match bridge.modules().current_import_file() {
        Some(file) => {
            let dir = Path::new(&file)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            record.set("__file__", Obj::str(file));
            record.set("__path__", Obj::list(vec![Obj::str(dir)]));
        }
        None => record.set("__file__", Obj::none()),
    }

    let mut bound = 0usize;
    for def in methods.iter().take_while(|d| !d.is_sentinel()) {
        let Some(method) = (unsafe { BoundMethod::from_def(def) }) else {
            continue;
        };
        let mut function = HostFunction::new(
            method.name().to_string(),
            move |bridge: &Bridge, args: &[Obj], kwargs: &Kwargs| {
                method.call(bridge, self_handle, args, kwargs)
            },
        );
        let doc = unsafe { crate::types::descriptor::c_text(def.ml_doc) };
        if let Some(doc) = doc {
            function = function.with_doc(doc);
        }
        let fname = function.name().to_string();
        record.set(&fname, Obj::function(function));
        bound += 1;
    }

    let handle = bridge.store(&module)?;
    info!(
        event = "module_init",
        module = name,
        functions = bound,
        api_version,
        handle = %handle,
        "extension module initialized"
    );
    Ok(handle)
}

fn module_at(bridge: &Bridge, module: Handle) -> Result<Obj> {
    let obj = bridge.retrieve(module)?;
    if module_of(&obj).is_none() {
        return Err(BridgeError::NotAModule(module));
    }
    Ok(obj)
}

/// Bind `name` to the object behind `value` and take over the caller's
/// reference to it
///
/// A type descriptor the bridge has not seen yet is bridged on the way.
pub fn add_object(bridge: &Bridge, module: Handle, name: &str, value: Handle) -> Result<()> {
    let module = module_at(bridge, module)?;
    let value_obj = bridge.resolve(value)?;
    if let Some(record) = module_of(&module) {
        record.set(name, value_obj);
    }
    bridge.dec_ref(value)?;
    debug!(event = "module_add_object", name, value = %value, "module attribute bound");
    Ok(())
}

pub fn add_int_constant(bridge: &Bridge, module: Handle, name: &str, value: i64) -> Result<()> {
    let module = module_at(bridge, module)?;
    if let Some(record) = module_of(&module) {
        record.set(name, Obj::int(value));
    }
    Ok(())
}

pub fn add_string_constant(bridge: &Bridge, module: Handle, name: &str, value: &str) -> Result<()> {
    let module = module_at(bridge, module)?;
    if let Some(record) = module_of(&module) {
        record.set(name, Obj::str(value));
    }
    Ok(())
}

/// New reference to the module's live globals dict
pub fn get_dict(bridge: &Bridge, module: Handle) -> Result<Handle> {
    let module = module_at(bridge, module)?;
    match module_of(&module) {
        Some(record) => bridge.store(record.globals()),
        None => Err(BridgeError::NotAModule(Handle::NULL)),
    }
}
