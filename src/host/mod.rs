//! Host object model - the garbage-collected side of the bridge
//!
//! Host objects are `Arc`-owned values: they have an identity (the `Arc`
//! address) but no stable native address and no refcount native code could
//! manipulate. Identity, never value equality, decides which shadow record
//! an object gets.

use crate::bridge::Bridge;
use crate::cobject::OpaquePointer;
use crate::errors::Result;
use crate::module::ModuleRecord;
use crate::types::{NativeInstance, NativeType};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

#[cfg(test)]
mod tests;

/// Keyword arguments in call order
pub type Kwargs = [(String, Obj)];

/// Signature of host-implemented callables
pub type HostCallable = dyn Fn(&Bridge, &[Obj], &Kwargs) -> Result<Obj> + Send + Sync;

static NONE: Lazy<Obj> = Lazy::new(|| Obj::new(HostObject::None));

/// Host-implemented callable
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    doc: Option<String>,
    call: Arc<HostCallable>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, call: F) -> Self
    where
        F: Fn(&Bridge, &[Obj], &Kwargs) -> Result<Obj> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            doc: None,
            call: Arc::new(call),
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn invoke(&self, bridge: &Bridge, args: &[Obj], kwargs: &Kwargs) -> Result<Obj> {
        (self.call)(bridge, args, kwargs)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// Host-defined class: a name plus a method table
///
/// Methods receive the instance as their first positional argument.
#[derive(Debug, Clone)]
pub struct HostClass {
    name: String,
    module: String,
    methods: BTreeMap<String, HostFunction>,
}

impl HostClass {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Builder-style method registration
    pub fn method<F>(mut self, name: &str, call: F) -> Self
    where
        F: Fn(&Bridge, &[Obj], &Kwargs) -> Result<Obj> + Send + Sync + 'static,
    {
        self.methods
            .insert(name.to_string(), HostFunction::new(name, call));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&HostFunction> {
        self.methods.get(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }
}

/// Instance of a `HostClass`
pub struct HostInstance {
    class: Obj,
    attrs: RwLock<BTreeMap<String, Obj>>,
}

impl HostInstance {
    pub fn class(&self) -> &Obj {
        &self.class
    }

    pub fn class_def(&self) -> Option<&HostClass> {
        match &*self.class {
            HostObject::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<Obj> {
        self.attrs.read().get(name).cloned()
    }

    pub fn set_attr(&self, name: &str, value: Obj) {
        self.attrs.write().insert(name.to_string(), value);
    }
}

/// Reserved sentinel that must never cross into native memory via `store`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnmanagedDataMarker;

/// Every kind of value the host can hand to the bridge
pub enum HostObject {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Obj>),
    List(RwLock<Vec<Obj>>),
    Dict(RwLock<BTreeMap<String, Obj>>),
    /// Plain featureless object
    Bare,
    Function(HostFunction),
    Class(HostClass),
    Instance(HostInstance),
    Module(ModuleRecord),
    NativeType(Arc<NativeType>),
    NativeInstance(NativeInstance),
    Opaque(OpaquePointer),
    Marker(UnmanagedDataMarker),
}

/// Shared reference to a host object
#[derive(Clone)]
pub struct Obj(Arc<HostObject>);

impl Obj {
    pub fn new(value: HostObject) -> Self {
        Obj(Arc::new(value))
    }

    /// The one `None` object
    pub fn none() -> Self {
        NONE.clone()
    }

    pub fn bool(value: bool) -> Self {
        Obj::new(HostObject::Bool(value))
    }

    pub fn int(value: i64) -> Self {
        Obj::new(HostObject::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Obj::new(HostObject::Float(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Obj::new(HostObject::Str(value.into()))
    }

    pub fn tuple(items: Vec<Obj>) -> Self {
        Obj::new(HostObject::Tuple(items))
    }

    pub fn list(items: Vec<Obj>) -> Self {
        Obj::new(HostObject::List(RwLock::new(items)))
    }

    pub fn dict<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Obj)>,
        K: Into<String>,
    {
        let map = entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Obj::new(HostObject::Dict(RwLock::new(map)))
    }

    pub fn bare() -> Self {
        Obj::new(HostObject::Bare)
    }

    pub fn function(function: HostFunction) -> Self {
        Obj::new(HostObject::Function(function))
    }

    pub fn class(class: HostClass) -> Self {
        Obj::new(HostObject::Class(class))
    }

    /// Fresh instance of `class` with no attributes; runs no initializer
    pub fn instance_of(class: &Obj) -> Self {
        Obj::new(HostObject::Instance(HostInstance {
            class: class.clone(),
            attrs: RwLock::new(BTreeMap::new()),
        }))
    }

    pub fn marker() -> Self {
        Obj::new(HostObject::Marker(UnmanagedDataMarker))
    }

    /// Identity of the underlying object
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn is(&self, other: &Obj) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_none(&self) -> bool {
        matches!(&*self.0, HostObject::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match &*self.0 {
            HostObject::Int(v) => Some(*v),
            HostObject::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &*self.0 {
            HostObject::Float(v) => Some(*v),
            HostObject::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.0 {
            HostObject::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match &*self.0 {
            HostObject::None => false,
            HostObject::Bool(v) => *v,
            HostObject::Int(v) => *v != 0,
            HostObject::Float(v) => *v != 0.0,
            HostObject::Str(s) => !s.is_empty(),
            HostObject::Tuple(items) => !items.is_empty(),
            HostObject::List(items) => !items.read().is_empty(),
            HostObject::Dict(map) => !map.read().is_empty(),
            _ => true,
        }
    }

    /// Items of a tuple or list
    pub fn sequence_items(&self) -> Option<Vec<Obj>> {
        match &*self.0 {
            HostObject::Tuple(items) => Some(items.clone()),
            HostObject::List(items) => Some(items.read().clone()),
            _ => None,
        }
    }

    pub fn dict_items(&self) -> Option<Vec<(String, Obj)>> {
        match &*self.0 {
            HostObject::Dict(map) => Some(
                map.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn dict_get(&self, key: &str) -> Option<Obj> {
        match &*self.0 {
            HostObject::Dict(map) => map.read().get(key).cloned(),
            _ => None,
        }
    }

    /// Insert into a dict; false when `self` is not a dict
    pub fn dict_set(&self, key: &str, value: Obj) -> bool {
        match &*self.0 {
            HostObject::Dict(map) => {
                map.write().insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    pub fn type_name(&self) -> String {
        match &*self.0 {
            HostObject::None => "NoneType".into(),
            HostObject::Bool(_) => "bool".into(),
            HostObject::Int(_) => "int".into(),
            HostObject::Float(_) => "float".into(),
            HostObject::Str(_) => "str".into(),
            HostObject::Tuple(_) => "tuple".into(),
            HostObject::List(_) => "list".into(),
            HostObject::Dict(_) => "dict".into(),
            HostObject::Bare => "object".into(),
            HostObject::Function(_) => "builtin_function_or_method".into(),
            HostObject::Class(_) | HostObject::NativeType(_) => "type".into(),
            HostObject::Instance(inst) => inst
                .class_def()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "object".into()),
            HostObject::Module(_) => "module".into(),
            HostObject::NativeInstance(inst) => inst.native_type().name().to_string(),
            HostObject::Opaque(_) => "PyCObject".into(),
            HostObject::Marker(_) => "UnmanagedDataMarker".into(),
        }
    }

    pub fn repr(&self) -> String {
        match &*self.0 {
            HostObject::None => "None".into(),
            HostObject::Bool(true) => "True".into(),
            HostObject::Bool(false) => "False".into(),
            HostObject::Int(v) => v.to_string(),
            HostObject::Float(v) => format!("{:?}", v),
            HostObject::Str(s) => format!("'{}'", s),
            HostObject::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Obj::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            HostObject::List(items) => {
                let inner: Vec<String> = items.read().iter().map(Obj::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            HostObject::Dict(map) => {
                let inner: Vec<String> = map
                    .read()
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            HostObject::Bare => format!("<object at {:#x}>", self.identity()),
            HostObject::Function(f) => format!("<built-in function {}>", f.name()),
            HostObject::Class(c) => format!("<class '{}'>", c.qualified_name()),
            HostObject::Instance(_) => format!("<{} object at {:#x}>", self.type_name(), self.identity()),
            HostObject::Module(m) => format!("<module '{}'>", m.name()),
            HostObject::NativeType(t) => format!("<class '{}'>", t.qualified_name()),
            HostObject::NativeInstance(inst) => format!(
                "<{} object at {}>",
                inst.native_type().qualified_name(),
                inst.handle()
            ),
            HostObject::Opaque(p) => format!("<PyCObject at {}>", p.handle()),
            HostObject::Marker(_) => "<UnmanagedDataMarker>".into(),
        }
    }
}

impl Deref for Obj {
    type Target = HostObject;

    fn deref(&self) -> &HostObject {
        &self.0
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Obj) -> bool {
        if self.is(other) {
            return true;
        }
        match (&*self.0, &*other.0) {
            (HostObject::None, HostObject::None) => true,
            (HostObject::Bool(a), HostObject::Bool(b)) => a == b,
            (HostObject::Int(a), HostObject::Int(b)) => a == b,
            (HostObject::Float(a), HostObject::Float(b)) => a == b,
            (HostObject::Str(a), HostObject::Str(b)) => a == b,
            (HostObject::Tuple(a), HostObject::Tuple(b)) => a == b,
            (HostObject::List(a), HostObject::List(b)) => *a.read() == *b.read(),
            (HostObject::Dict(a), HostObject::Dict(b)) => *a.read() == *b.read(),
            _ => false,
        }
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<i64> for Obj {
    fn from(value: i64) -> Self {
        Obj::int(value)
    }
}

impl From<bool> for Obj {
    fn from(value: bool) -> Self {
        Obj::bool(value)
    }
}

impl From<f64> for Obj {
    fn from(value: f64) -> Self {
        Obj::float(value)
    }
}

impl From<&str> for Obj {
    fn from(value: &str) -> Self {
        Obj::str(value)
    }
}

impl From<String> for Obj {
    fn from(value: String) -> Self {
        Obj::str(value)
    }
}
