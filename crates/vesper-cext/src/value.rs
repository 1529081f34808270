//! Runtime value model shared between managed code and the native bridge.
//!
//! Values fall into two ownership domains:
//! - Managed values (`None` through `Class`) are owned by the host runtime
//!   and reference counted through `Arc`.
//! - `Native` values are owned by extension code; the bridge co-owns them
//!   for as long as any managed reference is alive.
//!
//! Equality follows the host language: primitives compare structurally,
//! objects, classes and native instances compare by identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::bridge::registry::{PendingFree, PendingQueue};
use crate::bridge::wrapper::Wrapper;
use crate::class::ClassObject;
use crate::marshal::outgoing::NativeTarget;

pub type ObjectRef = Arc<ManagedObject>;
pub type ClassRef = Arc<ClassObject>;
pub type NativeRef = Arc<NativeInstance>;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    /// Managed instance with attributes and an optional payload.
    Object(ObjectRef),
    /// Managed class.
    Class(ClassRef),
    /// Instance owned by extension code, adopted into the managed domain.
    Native(NativeRef),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items.into())
    }

    /// Name of the value's type as surfaced in diagnostics.
    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Object(obj) => obj.class().name(),
            Value::Class(_) => "type",
            Value::Native(_) => "native",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Object(_) | Value::Class(_) | Value::Native(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassRef> {
        match self {
            Value::Class(cls) => Some(cls),
            _ => None,
        }
    }

    /// True when both sides are the same managed object, class or native
    /// instance. Always false for primitive values.
    pub fn is_identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            _ => self.is_identical(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Object(obj) => write!(f, "<{} object>", obj.class().name()),
            Value::Class(cls) => write!(f, "<class '{}'>", cls.name()),
            Value::Native(inst) => write!(f, "<native object at {:#x}>", inst.pointer()),
        }
    }
}

/// Host-implemented function body.
#[derive(Clone)]
pub struct ManagedFn {
    name: Arc<str>,
    body: Arc<dyn Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync>,
}

impl ManagedFn {
    pub fn new(
        name: impl Into<Arc<str>>,
        body: impl Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    ) -> ManagedFn {
        ManagedFn {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, RuntimeError> {
        (self.body)(args)
    }
}

impl fmt::Debug for ManagedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// Auxiliary state carried by a managed object beyond its attributes.
#[derive(Debug)]
pub enum Payload {
    /// Plain attribute-bearing instance.
    Empty,
    /// Mutable sequence storage.
    List(Vec<Value>),
    /// Callable implemented by the host runtime.
    Function(ManagedFn),
    /// Callable backed by extension code.
    NativeFn(NativeTarget),
    /// Module namespace; the exports live in the object's attributes.
    Module { name: String },
    /// Snapshot iterator over materialized items.
    Iter { items: Vec<Value>, pos: usize },
}

/// A managed instance: class reference, attribute map, payload, and the
/// handle wrapper once the instance has crossed into native code.
///
/// The wrapper cell is write-once. The object owns its wrapper strongly;
/// the wrapper refers back to the object weakly, so dropping the last
/// managed reference tears both down.
#[derive(Debug)]
pub struct ManagedObject {
    class: ClassRef,
    attrs: Mutex<HashMap<String, Value>>,
    payload: Mutex<Payload>,
    native: OnceLock<Wrapper>,
}

impl ManagedObject {
    pub fn new(class: ClassRef) -> ObjectRef {
        Arc::new(ManagedObject {
            class,
            attrs: Mutex::new(HashMap::new()),
            payload: Mutex::new(Payload::Empty),
            native: OnceLock::new(),
        })
    }

    pub fn with_payload(class: ClassRef, payload: Payload) -> ObjectRef {
        let obj = ManagedObject::new(class);
        obj.with_payload_mut(|slot| *slot = payload);
        obj
    }

    pub fn class(&self) -> &ClassRef {
        &self.class
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.lock().ok()?.get(name).cloned()
    }

    pub fn set_attr(&self, name: impl Into<String>, value: Value) {
        if let Ok(mut attrs) = self.attrs.lock() {
            attrs.insert(name.into(), value);
        }
    }

    pub fn remove_attr(&self, name: &str) -> Option<Value> {
        self.attrs.lock().ok()?.remove(name)
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.attrs
            .lock()
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs `f` against the payload under the payload lock.
    pub fn with_payload_mut<R>(&self, f: impl FnOnce(&mut Payload) -> R) -> R {
        let mut payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut payload)
    }

    /// The handle wrapper, if this object has crossed into native code.
    pub fn native_wrapper(&self) -> Option<&Wrapper> {
        self.native.get()
    }

    /// Associates the handle wrapper created on first transition. Returns
    /// the winning wrapper when two transitions race.
    pub fn bind_native_wrapper(&self, wrapper: Wrapper) -> &Wrapper {
        self.native.get_or_init(|| wrapper)
    }
}

/// An extension-owned instance adopted into the managed domain.
///
/// Adoption adds the managed baseline to the instance's reference count.
/// Dropping the last managed reference does not touch the count directly;
/// it enqueues a release that the registry drain applies under its lock.
#[derive(Debug)]
pub struct NativeInstance {
    pointer: usize,
    queue: Arc<PendingQueue>,
}

impl NativeInstance {
    pub(crate) fn new(pointer: usize, queue: Arc<PendingQueue>) -> NativeRef {
        Arc::new(NativeInstance { pointer, queue })
    }

    /// Address of the instance in the native domain.
    pub fn pointer(&self) -> usize {
        self.pointer
    }
}

impl Drop for NativeInstance {
    fn drop(&mut self) {
        self.queue.push(PendingFree::Foreign {
            pointer: self.pointer,
        });
    }
}

/// Errors surfaced to managed code.
///
/// `Raised` carries an exception that extension code reported through the
/// pending-error slot. `Fatal` marks a broken bridge invariant; callers are
/// not expected to recover from it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Type error: {msg}")]
    TypeError { msg: String },

    #[error("Value error: {msg}")]
    ValueError { msg: String },

    #[error("Attribute error: {msg}")]
    AttributeError { msg: String },

    #[error("Index error: {msg}")]
    IndexError { msg: String },

    #[error("{kind}: {msg}")]
    Raised { kind: String, msg: String },

    #[error("iteration finished")]
    StopIteration,

    #[error("Fatal bridge error: {msg}")]
    Fatal { msg: String },
}

impl RuntimeError {
    pub fn type_error(msg: impl Into<String>) -> RuntimeError {
        RuntimeError::TypeError { msg: msg.into() }
    }

    pub fn value_error(msg: impl Into<String>) -> RuntimeError {
        RuntimeError::ValueError { msg: msg.into() }
    }

    pub fn attribute_error(msg: impl Into<String>) -> RuntimeError {
        RuntimeError::AttributeError { msg: msg.into() }
    }

    pub fn index_error(msg: impl Into<String>) -> RuntimeError {
        RuntimeError::IndexError { msg: msg.into() }
    }

    pub fn raised(kind: impl Into<String>, msg: impl Into<String>) -> RuntimeError {
        RuntimeError::Raised {
            kind: kind.into(),
            msg: msg.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> RuntimeError {
        RuntimeError::Fatal { msg: msg.into() }
    }

    /// True for errors managed code is not expected to catch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassObject;

    fn test_class(name: &str) -> ClassRef {
        ClassObject::new(name, Vec::new(), Vec::new()).unwrap()
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::None.type_name(), "NoneType");
        assert_eq!(Value::Int(3).type_name(), "int");
        assert_eq!(Value::str("x").type_name(), "str");
        let cls = test_class("Point");
        assert_eq!(Value::Object(ManagedObject::new(cls)).type_name(), "Point");
    }

    #[test]
    fn test_primitive_equality_is_structural() {
        assert_eq!(Value::Int(7), Value::Int(7));
        assert_eq!(Value::str("ab"), Value::str("ab"));
        assert_ne!(Value::Int(7), Value::Float(7.0));
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::None]),
            Value::tuple(vec![Value::Int(1), Value::None])
        );
    }

    #[test]
    fn test_object_equality_is_identity() {
        let cls = test_class("Point");
        let a = ManagedObject::new(cls.clone());
        let b = ManagedObject::new(cls);
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::tuple(vec![Value::None]).is_truthy());
    }

    #[test]
    fn test_attrs_round_trip() {
        let obj = ManagedObject::new(test_class("Bag"));
        assert_eq!(obj.get_attr("x"), None);
        obj.set_attr("x", Value::Int(5));
        assert_eq!(obj.get_attr("x"), Some(Value::Int(5)));
        assert_eq!(obj.remove_attr("x"), Some(Value::Int(5)));
        assert_eq!(obj.get_attr("x"), None);
    }

    #[test]
    fn test_managed_fn_call() {
        let double = ManagedFn::new("double", |args| {
            let n = args[0].as_int().unwrap_or(0);
            Ok(Value::Int(n * 2))
        });
        assert_eq!(double.call(&[Value::Int(21)]), Ok(Value::Int(42)));
        assert_eq!(format!("{double:?}"), "<function double>");
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(
            Value::tuple(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "(1, 2)"
        );
    }
}
