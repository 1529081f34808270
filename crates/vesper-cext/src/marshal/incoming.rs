//! Incoming calls: native code invoking managed behavior.
//!
//! Two surfaces live here:
//!
//! - slot trampolines, the static `extern "C"` functions written into
//!   synthesized type structs. Each one recovers the installed bridge,
//!   lifts its raw arguments, resolves the method on the receiver's class
//!   line, and lowers the result through the slot's return convention;
//! - the exported `vx_*` entry points extension code links against for
//!   reference counting, error reporting and primitive conversions.
//!
//! Both run on whatever thread native code calls from and start with no
//! context but their raw arguments, so the bridge is recovered from a
//! process-wide slot holding a weak reference to the installed context.
//! Errors never unwind across the C boundary: recoverable ones land in the
//! pending-exception slot and surface through each convention's error
//! value, broken bridge invariants abort.

use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::{Arc, RwLock, Weak};

use crate::abi;
use crate::bridge::{Bridge, BridgeShared};
use crate::value::{RuntimeError, Value};

/// Raw object handle as native code sees it.
pub(crate) type RawObj = *mut std::os::raw::c_void;

// Weak, so an installed context does not outlive its bridge; trampolines
// fired after shutdown fail closed instead of resurrecting state.
static ACTIVE: RwLock<Option<Weak<BridgeShared>>> = RwLock::new(None);

pub(crate) fn install(shared: &Arc<BridgeShared>) {
    let mut active = ACTIVE.write().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = active.as_ref().and_then(Weak::upgrade) {
        if !Arc::ptr_eq(&existing, shared) {
            log::warn!("replacing the installed bridge context");
        }
    }
    *active = Some(Arc::downgrade(shared));
}

/// Clears the context slot if it still points at `shared`.
pub(crate) fn uninstall(shared: &Arc<BridgeShared>) {
    let mut active = ACTIVE.write().unwrap_or_else(|e| e.into_inner());
    if active
        .as_ref()
        .is_some_and(|weak| ptr::eq(weak.as_ptr(), Arc::as_ptr(shared)))
    {
        *active = None;
    }
}

pub(crate) fn active_bridge() -> Option<Bridge> {
    let active = ACTIVE.read().unwrap_or_else(|e| e.into_inner());
    active
        .as_ref()
        .and_then(Weak::upgrade)
        .map(Bridge::from_shared)
}

/// Routes an error to the pending slot. Fatal errors cannot be reported
/// through a C return value and must not unwind across the boundary.
fn report(bridge: &Bridge, err: RuntimeError) {
    if err.is_fatal() {
        log::error!("fatal bridge error in native callback: {err}");
        std::process::abort();
    }
    bridge.set_pending(err);
}

fn lower_or_null(bridge: &Bridge, value: &Value) -> RawObj {
    match bridge.lower_owned(value) {
        Ok(pointer) => pointer as RawObj,
        Err(err) => {
            report(bridge, err);
            ptr::null_mut()
        }
    }
}

fn ret_newref(bridge: &Bridge, result: Result<Value, RuntimeError>) -> RawObj {
    match result {
        Ok(value) => lower_or_null(bridge, &value),
        Err(err) => {
            report(bridge, err);
            ptr::null_mut()
        }
    }
}

fn ret_status(bridge: &Bridge, result: Result<Value, RuntimeError>) -> c_int {
    match result {
        Ok(_) => 0,
        Err(err) => {
            report(bridge, err);
            -1
        }
    }
}

fn ret_inquiry(bridge: &Bridge, result: Result<Value, RuntimeError>) -> c_int {
    match result {
        Ok(value) => c_int::from(value.is_truthy()),
        Err(err) => {
            report(bridge, err);
            -1
        }
    }
}

/// Resolves `name` on the class of `argv[0]` and calls it.
fn call_dunder(bridge: &Bridge, name: &str, argv: &[Value]) -> Result<Value, RuntimeError> {
    let cls = bridge.class_of(&argv[0]);
    let method = cls.resolve(name).ok_or_else(|| {
        RuntimeError::type_error(format!("'{}' object has no method '{name}'", cls.name()))
    })?;
    bridge.call_value(&method, argv)
}

/// Lifts the receiver and extra handle words, then dispatches `name`.
fn dispatch(
    bridge: &Bridge,
    name: &str,
    recv: RawObj,
    rest: &[RawObj],
) -> Result<Value, RuntimeError> {
    let mut argv = Vec::with_capacity(rest.len() + 1);
    argv.push(bridge.lift_borrowed(recv as usize)?);
    for &word in rest {
        argv.push(bridge.lift_borrowed(word as usize)?);
    }
    call_dunder(bridge, name, &argv)
}

fn lift_or_none(bridge: &Bridge, word: RawObj) -> Result<Value, RuntimeError> {
    if word.is_null() {
        Ok(Value::None)
    } else {
        bridge.lift_borrowed(word as usize)
    }
}

/// Unpacks a `(args, kwargs)` pair as passed to the tuple-carrying slots.
fn unpack_call_args(
    bridge: &Bridge,
    args: RawObj,
    kwargs: RawObj,
) -> Result<Vec<Value>, RuntimeError> {
    if !kwargs.is_null() {
        return Err(RuntimeError::type_error(
            "keyword arguments are not supported here",
        ));
    }
    if args.is_null() {
        return Ok(Vec::new());
    }
    match bridge.lift_borrowed(args as usize)? {
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::None => Ok(Vec::new()),
        other => Err(RuntimeError::type_error(format!(
            "argument list must be a tuple, not {}",
            other.type_name()
        ))),
    }
}

macro_rules! unary_slots {
    ($($fname:ident => $dunder:literal),+ $(,)?) => {
        $(
            pub(crate) extern "C" fn $fname(recv: RawObj) -> RawObj {
                let Some(bridge) = active_bridge() else {
                    return ptr::null_mut();
                };
                ret_newref(&bridge, dispatch(&bridge, $dunder, recv, &[]))
            }
        )+
    };
}

macro_rules! binary_slots {
    ($($fname:ident => $dunder:literal),+ $(,)?) => {
        $(
            pub(crate) extern "C" fn $fname(recv: RawObj, other: RawObj) -> RawObj {
                let Some(bridge) = active_bridge() else {
                    return ptr::null_mut();
                };
                ret_newref(&bridge, dispatch(&bridge, $dunder, recv, &[other]))
            }
        )+
    };
}

unary_slots! {
    slot_repr => "__repr__",
    slot_str => "__str__",
    slot_iter => "__iter__",
    nb_negative => "__neg__",
    nb_positive => "__pos__",
    nb_absolute => "__abs__",
    nb_invert => "__invert__",
    nb_int => "__int__",
    nb_float => "__float__",
    nb_index => "__index__",
}

binary_slots! {
    nb_add => "__add__",
    nb_subtract => "__sub__",
    nb_multiply => "__mul__",
    nb_remainder => "__mod__",
    nb_floor_divide => "__floordiv__",
    nb_true_divide => "__truediv__",
    nb_lshift => "__lshift__",
    nb_rshift => "__rshift__",
    nb_and => "__and__",
    nb_xor => "__xor__",
    nb_or => "__or__",
    mp_subscript => "__getitem__",
}

pub(crate) extern "C" fn nb_power(base: RawObj, exp: RawObj, modulo: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = if modulo.is_null() {
        dispatch(&bridge, "__pow__", base, &[exp])
    } else {
        dispatch(&bridge, "__pow__", base, &[exp, modulo])
    };
    ret_newref(&bridge, result)
}

pub(crate) extern "C" fn nb_bool(recv: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    ret_inquiry(&bridge, dispatch(&bridge, "__bool__", recv, &[]))
}

pub(crate) extern "C" fn slot_len(recv: RawObj) -> isize {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    match dispatch(&bridge, "__len__", recv, &[]) {
        Ok(value) => match value.as_int() {
            Some(n) if n >= 0 => n as isize,
            Some(n) => {
                report(
                    &bridge,
                    RuntimeError::value_error(format!("__len__() should return >= 0, got {n}")),
                );
                -1
            }
            None => {
                report(
                    &bridge,
                    RuntimeError::type_error("__len__() must return an int"),
                );
                -1
            }
        },
        Err(err) => {
            report(&bridge, err);
            -1
        }
    }
}

pub(crate) extern "C" fn slot_hash(recv: RawObj) -> i64 {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    match dispatch(&bridge, "__hash__", recv, &[]) {
        Ok(value) => match value.as_int() {
            // -1 is the error return; a real hash of -1 moves off it.
            Some(-1) => -2,
            Some(n) => n,
            None => {
                report(
                    &bridge,
                    RuntimeError::type_error("__hash__() must return an int"),
                );
                -1
            }
        },
        Err(err) => {
            report(&bridge, err);
            -1
        }
    }
}

pub(crate) extern "C" fn slot_call(recv: RawObj, args: RawObj, kwargs: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = call_with_packed(&bridge, "__call__", recv, args, kwargs);
    ret_newref(&bridge, result)
}

pub(crate) extern "C" fn slot_init(recv: RawObj, args: RawObj, kwargs: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = call_with_packed(&bridge, "__init__", recv, args, kwargs);
    ret_status(&bridge, result)
}

fn call_with_packed(
    bridge: &Bridge,
    name: &str,
    recv: RawObj,
    args: RawObj,
    kwargs: RawObj,
) -> Result<Value, RuntimeError> {
    let mut argv = vec![bridge.lift_borrowed(recv as usize)?];
    argv.extend(unpack_call_args(bridge, args, kwargs)?);
    call_dunder(bridge, name, &argv)
}

pub(crate) extern "C" fn slot_new(cls: RawObj, args: RawObj, kwargs: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = new_from_native(&bridge, cls, args, kwargs);
    ret_newref(&bridge, result)
}

fn new_from_native(
    bridge: &Bridge,
    cls: RawObj,
    args: RawObj,
    kwargs: RawObj,
) -> Result<Value, RuntimeError> {
    let cls_value = bridge.lift_borrowed(cls as usize)?;
    // __new__ is resolved on the class being constructed, not its type.
    let class = cls_value
        .as_class()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("__new__ requires a class"))?;
    let method = class.resolve("__new__").ok_or_else(|| {
        RuntimeError::type_error(format!("class '{}' has no __new__", class.name()))
    })?;
    let mut argv = vec![cls_value];
    argv.extend(unpack_call_args(bridge, args, kwargs)?);
    bridge.call_value(&method, &argv)
}

/// `tp_call` of the metatype: calling a class constructs an instance.
pub(crate) extern "C" fn type_call(cls: RawObj, args: RawObj, kwargs: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = instantiate_from_native(&bridge, cls, args, kwargs);
    ret_newref(&bridge, result)
}

fn instantiate_from_native(
    bridge: &Bridge,
    cls: RawObj,
    args: RawObj,
    kwargs: RawObj,
) -> Result<Value, RuntimeError> {
    let cls_value = bridge.lift_borrowed(cls as usize)?;
    let class = cls_value
        .as_class()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("only classes are callable through the type slot"))?;
    let argv = unpack_call_args(bridge, args, kwargs)?;
    bridge.instantiate(&class, &argv)
}

pub(crate) extern "C" fn slot_descr_get(recv: RawObj, obj: RawObj, objtype: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = descr_get_from_native(&bridge, recv, obj, objtype);
    ret_newref(&bridge, result)
}

fn descr_get_from_native(
    bridge: &Bridge,
    recv: RawObj,
    obj: RawObj,
    objtype: RawObj,
) -> Result<Value, RuntimeError> {
    let argv = [
        bridge.lift_borrowed(recv as usize)?,
        lift_or_none(bridge, obj)?,
        lift_or_none(bridge, objtype)?,
    ];
    call_dunder(bridge, "__get__", &argv)
}

pub(crate) extern "C" fn slot_descr_set(recv: RawObj, obj: RawObj, value: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = if value.is_null() {
        dispatch(&bridge, "__delete__", recv, &[obj])
    } else {
        dispatch(&bridge, "__set__", recv, &[obj, value])
    };
    ret_status(&bridge, result)
}

pub(crate) extern "C" fn sq_item(recv: RawObj, index: isize) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = bridge
        .lift_borrowed(recv as usize)
        .and_then(|recv| call_dunder(&bridge, "__getitem__", &[recv, Value::Int(index as i64)]));
    ret_newref(&bridge, result)
}

pub(crate) extern "C" fn sq_ass_item(recv: RawObj, index: isize, value: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = bridge.lift_borrowed(recv as usize).and_then(|recv| {
        let idx = Value::Int(index as i64);
        if value.is_null() {
            call_dunder(&bridge, "__delitem__", &[recv, idx])
        } else {
            let item = bridge.lift_borrowed(value as usize)?;
            call_dunder(&bridge, "__setitem__", &[recv, idx, item])
        }
    });
    ret_status(&bridge, result)
}

pub(crate) extern "C" fn mp_ass_subscript(recv: RawObj, key: RawObj, value: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = if value.is_null() {
        dispatch(&bridge, "__delitem__", recv, &[key])
    } else {
        dispatch(&bridge, "__setitem__", recv, &[key, value])
    };
    ret_status(&bridge, result)
}

pub(crate) extern "C" fn sq_contains(recv: RawObj, item: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    ret_inquiry(&bridge, dispatch(&bridge, "__contains__", recv, &[item]))
}

/// Comparison opcode to its method name and surface syntax.
fn compare_dunder(op: c_int) -> Option<(&'static str, &'static str)> {
    match op {
        x if x == abi::cmpop::LT => Some(("__lt__", "<")),
        x if x == abi::cmpop::LE => Some(("__le__", "<=")),
        x if x == abi::cmpop::EQ => Some(("__eq__", "==")),
        x if x == abi::cmpop::NE => Some(("__ne__", "!=")),
        x if x == abi::cmpop::GT => Some(("__gt__", ">")),
        x if x == abi::cmpop::GE => Some(("__ge__", ">=")),
        _ => None,
    }
}

pub(crate) extern "C" fn slot_richcompare(left: RawObj, right: RawObj, op: c_int) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = richcompare_from_native(&bridge, left, right, op);
    ret_newref(&bridge, result)
}

fn richcompare_from_native(
    bridge: &Bridge,
    left: RawObj,
    right: RawObj,
    op: c_int,
) -> Result<Value, RuntimeError> {
    let Some((name, symbol)) = compare_dunder(op) else {
        return Err(RuntimeError::value_error(format!(
            "unknown comparison opcode {op}"
        )));
    };
    let left = bridge.lift_borrowed(left as usize)?;
    let right = bridge.lift_borrowed(right as usize)?;
    let cls = bridge.class_of(&left);
    match cls.resolve(name) {
        Some(method) => bridge.call_value(&method, &[left, right]),
        // Default object semantics: equality is identity, ordering is
        // undefined.
        None if op == abi::cmpop::EQ => Ok(Value::Bool(left == right)),
        None if op == abi::cmpop::NE => Ok(Value::Bool(left != right)),
        None => Err(RuntimeError::type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

pub(crate) extern "C" fn slot_iternext(recv: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    match dispatch(&bridge, "__next__", recv, &[]) {
        Ok(value) => lower_or_null(&bridge, &value),
        // Exhaustion is a null result with no pending error.
        Err(RuntimeError::StopIteration) => ptr::null_mut(),
        Err(err) => {
            report(&bridge, err);
            ptr::null_mut()
        }
    }
}

pub(crate) extern "C" fn slot_getattro(recv: RawObj, name: RawObj) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    let result = getattr_from_native(&bridge, recv, name);
    ret_newref(&bridge, result)
}

fn getattr_from_native(bridge: &Bridge, recv: RawObj, name: RawObj) -> Result<Value, RuntimeError> {
    let recv = bridge.lift_borrowed(recv as usize)?;
    let name_value = bridge.lift_borrowed(name as usize)?;
    let name = name_value
        .as_str()
        .ok_or_else(|| RuntimeError::type_error("attribute name must be a string"))?;
    bridge.get_attr_value(&recv, name)
}

pub(crate) extern "C" fn slot_setattro(recv: RawObj, name: RawObj, value: RawObj) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = setattr_from_native(&bridge, recv, name, value);
    ret_status(&bridge, result.map(|_| Value::None))
}

fn setattr_from_native(
    bridge: &Bridge,
    recv: RawObj,
    name: RawObj,
    value: RawObj,
) -> Result<(), RuntimeError> {
    let recv = bridge.lift_borrowed(recv as usize)?;
    let name_value = bridge.lift_borrowed(name as usize)?;
    let name = name_value
        .as_str()
        .ok_or_else(|| RuntimeError::type_error("attribute name must be a string"))?;
    let value = if value.is_null() {
        None
    } else {
        Some(bridge.lift_borrowed(value as usize)?)
    };
    bridge.set_attr_value(&recv, name, value)
}

/// `tp_dealloc` of synthesized types.
///
/// With the managed baseline on every live handle, a count of zero means
/// native code released references it did not own. The stub is turned over
/// to the registry rather than freed in place, keeping teardown on the
/// drain path.
pub(crate) extern "C" fn stub_dealloc(recv: RawObj) {
    log::error!(
        "handle {:#x} reference count reached zero in native code",
        recv as usize
    );
    if let Some(bridge) = active_bridge() {
        bridge.release_stub(recv as usize);
    }
}

// ---------------------------------------------------------------------
// Exported entry points.
// ---------------------------------------------------------------------

/// Adds one native reference to `obj`.
#[no_mangle]
pub extern "C" fn vx_inc_ref(obj: RawObj) {
    if obj.is_null() {
        return;
    }
    if let Some(bridge) = active_bridge() {
        bridge.native_incref(obj as usize);
    }
}

/// Removes one native reference from `obj`, destructing an adopted
/// instance whose count reaches zero.
#[no_mangle]
pub extern "C" fn vx_dec_ref(obj: RawObj) {
    if obj.is_null() {
        return;
    }
    if let Some(bridge) = active_bridge() {
        bridge.native_decref(obj as usize);
    }
}

/// Stores a pending exception from its kind and message.
#[no_mangle]
pub extern "C" fn vx_err_set(kind: *const c_char, msg: *const c_char) {
    let Some(bridge) = active_bridge() else {
        return;
    };
    let kind = unsafe { abi::read_cstr(kind as usize) }.unwrap_or_else(|| "Exception".to_string());
    let msg = unsafe { abi::read_cstr(msg as usize) }.unwrap_or_default();
    bridge.set_pending(RuntimeError::raised(kind, msg));
}

/// True when an exception is pending.
#[no_mangle]
pub extern "C" fn vx_err_occurred() -> c_int {
    match active_bridge() {
        Some(bridge) => c_int::from(bridge.has_pending()),
        None => 0,
    }
}

/// Discards any pending exception.
#[no_mangle]
pub extern "C" fn vx_err_clear() {
    if let Some(bridge) = active_bridge() {
        bridge.take_pending();
    }
}

/// New reference to the none singleton.
#[no_mangle]
pub extern "C" fn vx_none() -> RawObj {
    match active_bridge() {
        Some(bridge) => lower_or_null(&bridge, &Value::None),
        None => ptr::null_mut(),
    }
}

/// New reference to a boolean singleton.
#[no_mangle]
pub extern "C" fn vx_bool(truth: c_int) -> RawObj {
    match active_bridge() {
        Some(bridge) => lower_or_null(&bridge, &Value::Bool(truth != 0)),
        None => ptr::null_mut(),
    }
}

/// New reference to an integer value.
#[no_mangle]
pub extern "C" fn vx_int_from(value: i64) -> RawObj {
    match active_bridge() {
        Some(bridge) => lower_or_null(&bridge, &Value::Int(value)),
        None => ptr::null_mut(),
    }
}

/// Integer value of `obj`; -1 with a pending exception on failure.
#[no_mangle]
pub extern "C" fn vx_int_value(obj: RawObj) -> i64 {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    match bridge.lift_borrowed(obj as usize) {
        Ok(value) => match value.as_int() {
            Some(n) => n,
            None => {
                report(
                    &bridge,
                    RuntimeError::type_error(format!(
                        "an int is required, not {}",
                        value.type_name()
                    )),
                );
                -1
            }
        },
        Err(err) => {
            report(&bridge, err);
            -1
        }
    }
}

/// New reference to a float value.
#[no_mangle]
pub extern "C" fn vx_float_from(value: f64) -> RawObj {
    match active_bridge() {
        Some(bridge) => lower_or_null(&bridge, &Value::Float(value)),
        None => ptr::null_mut(),
    }
}

/// Float value of `obj`; -1.0 with a pending exception on failure.
#[no_mangle]
pub extern "C" fn vx_float_value(obj: RawObj) -> f64 {
    let Some(bridge) = active_bridge() else {
        return -1.0;
    };
    match bridge.lift_borrowed(obj as usize) {
        Ok(Value::Float(x)) => x,
        Ok(Value::Int(n)) => n as f64,
        Ok(Value::Bool(b)) => f64::from(u8::from(b)),
        Ok(other) => {
            report(
                &bridge,
                RuntimeError::type_error(format!("a float is required, not {}", other.type_name())),
            );
            -1.0
        }
        Err(err) => {
            report(&bridge, err);
            -1.0
        }
    }
}

/// New reference to a string value read from UTF-8 bytes.
#[no_mangle]
pub extern "C" fn vx_str_from_utf8(text: *const c_char) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    match unsafe { abi::read_cstr(text as usize) } {
        Some(text) => lower_or_null(&bridge, &Value::str(text)),
        None => {
            report(&bridge, RuntimeError::value_error("null string pointer"));
            ptr::null_mut()
        }
    }
}

/// UTF-8 bytes of a string object, NUL terminated.
///
/// The pointer stays valid as long as the string's handle is live.
#[no_mangle]
pub extern "C" fn vx_str_utf8(obj: RawObj) -> *const c_char {
    let Some(bridge) = active_bridge() else {
        return ptr::null();
    };
    match bridge.lift_borrowed(obj as usize) {
        Ok(value) => match value.as_str() {
            Some(text) => bridge.intern_utf8(obj as usize, text),
            None => {
                report(
                    &bridge,
                    RuntimeError::type_error(format!(
                        "a str is required, not {}",
                        value.type_name()
                    )),
                );
                ptr::null()
            }
        },
        Err(err) => {
            report(&bridge, err);
            ptr::null()
        }
    }
}

/// Number of items in a tuple; -1 with a pending exception on failure.
#[no_mangle]
pub extern "C" fn vx_tuple_size(obj: RawObj) -> isize {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    match bridge.lift_borrowed(obj as usize) {
        Ok(Value::Tuple(items)) => items.len() as isize,
        Ok(other) => {
            report(
                &bridge,
                RuntimeError::type_error(format!("a tuple is required, not {}", other.type_name())),
            );
            -1
        }
        Err(err) => {
            report(&bridge, err);
            -1
        }
    }
}

/// New reference to one tuple item.
#[no_mangle]
pub extern "C" fn vx_tuple_get(obj: RawObj, index: isize) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    match bridge.lift_borrowed(obj as usize) {
        Ok(Value::Tuple(items)) => match usize::try_from(index).ok().and_then(|i| items.get(i)) {
            Some(item) => lower_or_null(&bridge, item),
            None => {
                report(
                    &bridge,
                    RuntimeError::index_error("tuple index out of range"),
                );
                ptr::null_mut()
            }
        },
        Ok(other) => {
            report(
                &bridge,
                RuntimeError::type_error(format!("a tuple is required, not {}", other.type_name())),
            );
            ptr::null_mut()
        }
        Err(err) => {
            report(&bridge, err);
            ptr::null_mut()
        }
    }
}

/// New reference to a tuple built from an array of handles.
#[no_mangle]
pub extern "C" fn vx_tuple_from_array(items: *const RawObj, count: isize) -> RawObj {
    let Some(bridge) = active_bridge() else {
        return ptr::null_mut();
    };
    if count < 0 || (count > 0 && items.is_null()) {
        report(&bridge, RuntimeError::value_error("invalid tuple source"));
        return ptr::null_mut();
    }
    let words = unsafe { std::slice::from_raw_parts(items, count as usize) };
    let mut lifted = Vec::with_capacity(words.len());
    for &word in words {
        match bridge.lift_borrowed(word as usize) {
            Ok(value) => lifted.push(value),
            Err(err) => {
                report(&bridge, err);
                return ptr::null_mut();
            }
        }
    }
    lower_or_null(&bridge, &Value::tuple(lifted))
}

/// Stores `value` as an attribute of `module`, consuming the caller's
/// reference even on failure.
#[no_mangle]
pub extern "C" fn vx_module_add_object(
    module: RawObj,
    name: *const c_char,
    value: RawObj,
) -> c_int {
    let Some(bridge) = active_bridge() else {
        return -1;
    };
    let result = (|| {
        let name = unsafe { abi::read_cstr(name as usize) }
            .ok_or_else(|| RuntimeError::value_error("null attribute name"))?;
        let module = bridge.lift_borrowed(module as usize)?;
        let value = bridge.lift_borrowed(value as usize)?;
        bridge.set_attr_value(&module, &name, Some(value))
    })();
    if !value.is_null() {
        bridge.native_decref(value as usize);
    }
    ret_status(&bridge, result.map(|_| Value::None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassObject;
    use crate::value::{ManagedFn, ManagedObject, Payload};
    use serial_test::serial;
    use vesper_config::BridgeConfig;

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::default()).unwrap()
    }

    fn managed_fn(
        bridge: &Bridge,
        name: &str,
        body: impl Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    ) -> Value {
        Value::Object(ManagedObject::with_payload(
            bridge.builtins().function.clone(),
            Payload::Function(ManagedFn::new(name, body)),
        ))
    }

    fn read_slot_fn(type_ptr: usize, group: usize, offset: usize) -> usize {
        let base = unsafe { abi::read_word(type_ptr, group) };
        assert_ne!(base, 0);
        unsafe { abi::read_word(base, offset) }
    }

    #[test]
    #[serial]
    fn test_materialized_slot_runs_the_managed_dunder() {
        let bridge = bridge();
        let cls = ClassObject::new("Adder", Vec::new(), Vec::new()).unwrap();
        cls.set_attr(
            "__add__",
            managed_fn(&bridge, "__add__", |argv| {
                let other = argv[1]
                    .as_int()
                    .ok_or_else(|| RuntimeError::type_error("int expected"))?;
                Ok(Value::Int(other + 40))
            }),
        );
        cls.set_attr(
            "__len__",
            managed_fn(&bridge, "__len__", |_| Ok(Value::Int(3))),
        );
        let type_ptr = crate::mirror::materialize(&bridge, &cls).unwrap();

        let add_word = read_slot_fn(type_ptr, abi::typeobj::TP_AS_NUMBER, abi::number::NB_ADD);
        assert_eq!(add_word, nb_add as usize);

        let recv = bridge
            .lower_owned(&Value::Object(ManagedObject::new(cls.clone())))
            .unwrap();
        let two = bridge.lower_owned(&Value::Int(2)).unwrap();
        let add: extern "C" fn(RawObj, RawObj) -> RawObj =
            unsafe { std::mem::transmute(add_word) };
        let raw = add(recv as RawObj, two as RawObj);
        assert!(!raw.is_null());
        assert_eq!(
            bridge.from_native(raw as usize, true).unwrap(),
            Value::Int(42)
        );

        // Length goes out through the signed-size convention, not a handle.
        let len_word = read_slot_fn(type_ptr, abi::typeobj::TP_AS_MAPPING, abi::mapping::MP_LENGTH);
        let len: extern "C" fn(RawObj) -> isize = unsafe { std::mem::transmute(len_word) };
        assert_eq!(len(recv as RawObj), 3);

        assert!(bridge.take_pending().is_none());
        bridge.native_decref(recv);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_raising_dunder_lands_in_the_pending_slot() {
        let bridge = bridge();
        let cls = ClassObject::new("Brittle", Vec::new(), Vec::new()).unwrap();
        cls.set_attr(
            "__add__",
            managed_fn(&bridge, "__add__", |_| {
                Err(RuntimeError::raised("ValueError", "sizes differ"))
            }),
        );
        let type_ptr = crate::mirror::materialize(&bridge, &cls).unwrap();
        let add_word = read_slot_fn(type_ptr, abi::typeobj::TP_AS_NUMBER, abi::number::NB_ADD);
        let add: extern "C" fn(RawObj, RawObj) -> RawObj =
            unsafe { std::mem::transmute(add_word) };

        let recv = bridge
            .lower_owned(&Value::Object(ManagedObject::new(cls.clone())))
            .unwrap();
        let other = bridge.lower_owned(&Value::Int(1)).unwrap();
        let raw = add(recv as RawObj, other as RawObj);
        assert!(raw.is_null());
        match bridge.take_pending() {
            Some(RuntimeError::Raised { kind, msg }) => {
                assert_eq!(kind, "ValueError");
                assert_eq!(msg, "sizes differ");
            }
            other => panic!("unexpected pending state: {other:?}"),
        }

        bridge.native_decref(recv);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_trampolines_fail_closed_without_a_context() {
        {
            let mut active = ACTIVE.write().unwrap_or_else(|e| e.into_inner());
            *active = None;
        }
        assert!(nb_add(ptr::null_mut(), ptr::null_mut()).is_null());
        assert!(slot_repr(ptr::null_mut()).is_null());
        assert_eq!(slot_hash(ptr::null_mut()), -1);
        assert_eq!(slot_init(ptr::null_mut(), ptr::null_mut(), ptr::null_mut()), -1);
        assert_eq!(slot_len(ptr::null_mut()), -1);
        assert_eq!(vx_err_occurred(), 0);
        assert!(vx_none().is_null());
        assert_eq!(vx_int_value(ptr::null_mut()), -1);
    }

    #[test]
    fn test_compare_opcode_mapping() {
        assert_eq!(compare_dunder(abi::cmpop::LT), Some(("__lt__", "<")));
        assert_eq!(compare_dunder(abi::cmpop::EQ), Some(("__eq__", "==")));
        assert_eq!(compare_dunder(abi::cmpop::GE), Some(("__ge__", ">=")));
        assert_eq!(compare_dunder(17), None);
    }
}
