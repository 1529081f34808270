//! Outgoing calls: managed code invoking native function pointers.
//!
//! A call runs in four steps:
//!
//! 1. prepare: lower every argument to a machine word, promoting handles
//!    and recording their reference counts;
//! 2. invoke: cast the target pointer to the exact C signature the shape
//!    prescribes and call it;
//! 3. check: apply the shape's result convention, surfacing the pending
//!    exception on the error paths;
//! 4. release: compare argument reference counts against the recorded
//!    values and reconcile the handle table where native code kept or
//!    dropped references.
//!
//! Function pointers are cast directly per shape. The shape catalog is
//! closed, so the cast table below covers every convention the bridge can
//! ever be asked to call.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};

use crate::abi;
use crate::bridge::Bridge;
use crate::bridge::wrapper::Wrapper;
use crate::marshal::shape::{ArgKind, CallShape, RetKind};
use crate::marshal::MarshalError;
use crate::value::{RuntimeError, Value};

/// A native function the bridge can call: entry pointer plus its calling
/// convention. Getter and setter targets also carry the closure word from
/// their definition table.
#[derive(Debug, Clone)]
pub struct NativeTarget {
    name: String,
    shape: CallShape,
    fn_ptr: *const (),
    closure: usize,
}

// Safety: the function pointer is only ever read and called through the
// shape's fixed signature; the bridge serializes all call staging behind
// its lock.
unsafe impl Send for NativeTarget {}
unsafe impl Sync for NativeTarget {}

impl NativeTarget {
    pub fn new(name: impl Into<String>, shape: CallShape, fn_ptr: *const ()) -> NativeTarget {
        NativeTarget {
            name: name.into(),
            shape,
            fn_ptr,
            closure: 0,
        }
    }

    pub fn with_closure(mut self, closure: usize) -> NativeTarget {
        self.closure = closure;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }
}

/// Per-call staging state.
///
/// Keeps every lowered handle, argument buffer and C string alive until
/// the release step, and remembers the reference count each handle had
/// before the native code ran.
pub(crate) struct MarshalScope<'b> {
    bridge: &'b Bridge,
    keep: Vec<Wrapper>,
    cstrings: Vec<CString>,
    buffers: Vec<Vec<usize>>,
    recorded: Vec<(usize, u64)>,
}

impl<'b> MarshalScope<'b> {
    pub(crate) fn new(bridge: &'b Bridge) -> MarshalScope<'b> {
        MarshalScope {
            bridge,
            keep: Vec::new(),
            cstrings: Vec::new(),
            buffers: Vec::new(),
            recorded: Vec::new(),
        }
    }

    /// Lowers a value to a borrowed handle word.
    pub(crate) fn lower_object(&mut self, value: &Value) -> Result<usize, RuntimeError> {
        let wrapper = self.bridge.wrap_promoted(value)?;
        let pointer = wrapper
            .pointer()
            .ok_or_else(|| RuntimeError::fatal("handle not promoted during lowering"))?;
        self.recorded.push((pointer, wrapper.refcnt()));
        self.keep.push(wrapper);
        Ok(pointer)
    }

    fn lower_cstr(&mut self, value: &Value) -> Result<usize, RuntimeError> {
        let text = value.as_str().ok_or_else(|| MarshalError::TypeMismatch {
            expected: "str",
            got: value.type_name().to_string(),
        })?;
        let owned =
            CString::new(text).map_err(|_| MarshalError::NulInString(text.to_string()))?;
        let ptr = owned.as_ptr() as usize;
        self.cstrings.push(owned);
        Ok(ptr)
    }

    fn lower_size(&self, value: &Value) -> Result<usize, RuntimeError> {
        let n = value.as_int().ok_or_else(|| MarshalError::TypeMismatch {
            expected: "int",
            got: value.type_name().to_string(),
        })?;
        Ok(n as usize)
    }

    /// Builds a C array of borrowed handles for the fastcall conventions.
    fn lower_buffer(&mut self, values: &[Value]) -> Result<(usize, usize), RuntimeError> {
        let mut words = Vec::with_capacity(values.len());
        for value in values {
            words.push(self.lower_object(value)?);
        }
        let len = words.len();
        let ptr = if len == 0 { 0 } else { words.as_ptr() as usize };
        self.buffers.push(words);
        Ok((ptr, len))
    }

    /// Reconciles handle pins after the call. Native code may have
    /// retained or released references through direct count writes; any
    /// handle whose count moved gets resynchronized.
    pub(crate) fn release(self) {
        for (pointer, before) in &self.recorded {
            let after = unsafe { abi::load_refcnt(*pointer) };
            if after != *before {
                self.bridge.sync_handle(*pointer);
            }
        }
    }
}

/// Shapes whose trailing object slot encodes "no keywords" as null.
fn null_tail_slot(shape: CallShape) -> bool {
    matches!(
        shape,
        CallShape::Keywords | CallShape::Call | CallShape::New | CallShape::InitProc
    )
}

/// Lowers `argv` into the raw words for `target`'s shape.
fn lower_args(
    scope: &mut MarshalScope<'_>,
    target: &NativeTarget,
    argv: &[Value],
) -> Result<Vec<usize>, RuntimeError> {
    let shape = target.shape();
    let need = |n: usize| -> Result<(), RuntimeError> {
        if argv.len() == n {
            Ok(())
        } else {
            Err(MarshalError::ArityMismatch {
                expected: n,
                got: argv.len(),
            }
            .into())
        }
    };
    let need_at_least = |n: usize| -> Result<(), RuntimeError> {
        if argv.len() >= n {
            Ok(())
        } else {
            Err(MarshalError::ArityMismatch {
                expected: n,
                got: argv.len(),
            }
            .into())
        }
    };

    if let Some(op) = shape.fixed_compare_op() {
        need(2)?;
        return Ok(vec![
            scope.lower_object(&argv[0])?,
            scope.lower_object(&argv[1])?,
            op as usize,
        ]);
    }

    match shape {
        CallShape::NoArgs => {
            need(1)?;
            Ok(vec![scope.lower_object(&argv[0])?, 0])
        }
        CallShape::FastCall => {
            need_at_least(1)?;
            let recv = scope.lower_object(&argv[0])?;
            let (buf, len) = scope.lower_buffer(&argv[1..])?;
            Ok(vec![recv, buf, len])
        }
        CallShape::FastCallWithKeywords => {
            need_at_least(2)?;
            let recv = scope.lower_object(&argv[0])?;
            let (buf, len) = scope.lower_buffer(&argv[1..argv.len() - 1])?;
            let kw = match &argv[argv.len() - 1] {
                Value::None => 0,
                other => scope.lower_object(other)?,
            };
            Ok(vec![recv, buf, len, kw])
        }
        CallShape::Method => {
            // The defining class rides in the closure word, recorded when
            // the method table was read.
            need_at_least(2)?;
            let recv = scope.lower_object(&argv[0])?;
            let (buf, len) = scope.lower_buffer(&argv[1..argv.len() - 1])?;
            let kw = match &argv[argv.len() - 1] {
                Value::None => 0,
                other => scope.lower_object(other)?,
            };
            Ok(vec![recv, target.closure, buf, len, kw])
        }
        CallShape::Getter => {
            need(1)?;
            Ok(vec![scope.lower_object(&argv[0])?, target.closure])
        }
        CallShape::Setter => {
            need(2)?;
            Ok(vec![
                scope.lower_object(&argv[0])?,
                scope.lower_object(&argv[1])?,
                target.closure,
            ])
        }
        CallShape::DelItem => {
            need(2)?;
            Ok(vec![
                scope.lower_object(&argv[0])?,
                scope.lower_size(&argv[1])?,
                0,
            ])
        }
        CallShape::MpDelItem => {
            need(2)?;
            Ok(vec![
                scope.lower_object(&argv[0])?,
                scope.lower_object(&argv[1])?,
                0,
            ])
        }
        _ => {
            let kinds = shape.arg_kinds();
            need(kinds.len())?;
            let mut words = Vec::with_capacity(kinds.len());
            for (index, kind) in kinds.iter().enumerate() {
                let value = &argv[index];
                let word = match kind {
                    ArgKind::Object => {
                        let is_tail = index == kinds.len() - 1;
                        if is_tail && null_tail_slot(shape) && matches!(value, Value::None) {
                            0
                        } else {
                            scope.lower_object(value)?
                        }
                    }
                    ArgKind::Size | ArgKind::Int => scope.lower_size(value)?,
                    ArgKind::CharPtr => scope.lower_cstr(value)?,
                    ArgKind::Pointer => {
                        return Err(RuntimeError::fatal(format!(
                            "shape {shape:?} has no generic lowering for pointer slots"
                        )))
                    }
                };
                words.push(word);
            }
            Ok(words)
        }
    }
}

/// Raw machine signatures behind the shape catalog. Several shapes share
/// one signature; the converter tables, not the casts, tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawSig {
    PtrToPtr,
    PtrPtrToPtr,
    PtrPtrPtrToPtr,
    PtrSizeToPtr,
    PtrPtrSizeToPtr,
    PtrPtrSizePtrToPtr,
    PtrPtrPtrSizePtrToPtr,
    PtrCharToPtr,
    PtrCharPtrToInt,
    PtrPtrIntToPtr,
    PtrSizePtrToInt,
    PtrPtrPtrToInt,
    PtrPtrToInt,
    PtrToInt,
    PtrToLong,
}

fn raw_sig(shape: CallShape) -> RawSig {
    use CallShape::*;
    match shape {
        UnaryFunc | IterNext | TpStr | TpRepr | HashFunc | LenFunc | Inquiry => {
            match shape.ret_kind() {
                RetKind::Hash | RetKind::Len => RawSig::PtrToLong,
                RetKind::Inquiry => RawSig::PtrToInt,
                _ => RawSig::PtrToPtr,
            }
        }
        Direct | Varargs | NoArgs | ObjectArg | BinaryFunc | BinaryFuncL | BinaryFuncR
        | Getter => RawSig::PtrPtrToPtr,
        Keywords | TernaryFunc | TernaryFuncR | Call | New | DescrGet => RawSig::PtrPtrPtrToPtr,
        Alloc | GetItem => RawSig::PtrSizeToPtr,
        FastCall => RawSig::PtrPtrSizeToPtr,
        FastCallWithKeywords => RawSig::PtrPtrSizePtrToPtr,
        Method => RawSig::PtrPtrPtrSizePtrToPtr,
        GetAttr => RawSig::PtrCharToPtr,
        SetAttr => RawSig::PtrCharPtrToInt,
        RichCompare | CompareLt | CompareLe | CompareEq | CompareNe | CompareGt | CompareGe => {
            RawSig::PtrPtrIntToPtr
        }
        SetItem | DelItem => RawSig::PtrSizePtrToInt,
        Setter | InitProc | SetAttrO | DescrSet | ObjObjArgProc | MpDelItem => {
            RawSig::PtrPtrPtrToInt
        }
        ObjObjProc => RawSig::PtrPtrToInt,
    }
}

/// Raw result of a native call, before the convention check.
#[derive(Debug, Clone, Copy)]
enum RawRet {
    Ptr(usize),
    Int(c_int),
    Long(i64),
}

type P = *mut c_void;

/// Calls `fn_ptr` through the exact C signature of `shape`.
///
/// # Safety
///
/// `fn_ptr` must be a live function of the shape's signature and `words`
/// must hold one lowered word per argument slot.
unsafe fn invoke_raw(fn_ptr: *const (), shape: CallShape, words: &[usize]) -> RawRet {
    match raw_sig(shape) {
        RawSig::PtrToPtr => {
            let f: extern "C" fn(P) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P) as usize)
        }
        RawSig::PtrPtrToPtr => {
            let f: extern "C" fn(P, P) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as P) as usize)
        }
        RawSig::PtrPtrPtrToPtr => {
            let f: extern "C" fn(P, P, P) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as P, words[2] as P) as usize)
        }
        RawSig::PtrSizeToPtr => {
            let f: extern "C" fn(P, isize) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as isize) as usize)
        }
        RawSig::PtrPtrSizeToPtr => {
            let f: extern "C" fn(P, P, isize) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as P, words[2] as isize) as usize)
        }
        RawSig::PtrPtrSizePtrToPtr => {
            let f: extern "C" fn(P, P, isize, P) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as P, words[2] as isize, words[3] as P) as usize)
        }
        RawSig::PtrPtrPtrSizePtrToPtr => {
            let f: extern "C" fn(P, P, P, isize, P) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(
                words[0] as P,
                words[1] as P,
                words[2] as P,
                words[3] as isize,
                words[4] as P,
            ) as usize)
        }
        RawSig::PtrCharToPtr => {
            let f: extern "C" fn(P, *const c_char) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as *const c_char) as usize)
        }
        RawSig::PtrCharPtrToInt => {
            let f: extern "C" fn(P, *const c_char, P) -> c_int = std::mem::transmute(fn_ptr);
            RawRet::Int(f(words[0] as P, words[1] as *const c_char, words[2] as P))
        }
        RawSig::PtrPtrIntToPtr => {
            let f: extern "C" fn(P, P, c_int) -> P = std::mem::transmute(fn_ptr);
            RawRet::Ptr(f(words[0] as P, words[1] as P, words[2] as c_int) as usize)
        }
        RawSig::PtrSizePtrToInt => {
            let f: extern "C" fn(P, isize, P) -> c_int = std::mem::transmute(fn_ptr);
            RawRet::Int(f(words[0] as P, words[1] as isize, words[2] as P))
        }
        RawSig::PtrPtrPtrToInt => {
            let f: extern "C" fn(P, P, P) -> c_int = std::mem::transmute(fn_ptr);
            RawRet::Int(f(words[0] as P, words[1] as P, words[2] as P))
        }
        RawSig::PtrPtrToInt => {
            let f: extern "C" fn(P, P) -> c_int = std::mem::transmute(fn_ptr);
            RawRet::Int(f(words[0] as P, words[1] as P))
        }
        RawSig::PtrToInt => {
            let f: extern "C" fn(P) -> c_int = std::mem::transmute(fn_ptr);
            RawRet::Int(f(words[0] as P))
        }
        RawSig::PtrToLong => {
            let f: extern "C" fn(P) -> i64 = std::mem::transmute(fn_ptr);
            RawRet::Long(f(words[0] as P))
        }
    }
}

/// Applies the shape's result convention.
fn check_result(
    bridge: &Bridge,
    target: &NativeTarget,
    raw: RawRet,
) -> Result<Value, RuntimeError> {
    let lifted = match (target.shape().ret_kind(), raw) {
        (RetKind::NewRef, RawRet::Ptr(0)) => {
            return Err(bridge.take_pending_or_generic(target.name()))
        }
        (RetKind::NewRef, RawRet::Ptr(ptr)) => bridge.from_native(ptr, true)?,
        (RetKind::IterNext, RawRet::Ptr(0)) => {
            return match bridge.take_pending() {
                Some(err) => Err(err),
                None => Err(RuntimeError::StopIteration),
            }
        }
        (RetKind::IterNext, RawRet::Ptr(ptr)) => bridge.from_native(ptr, true)?,
        (RetKind::Status, RawRet::Int(status)) if status < 0 => {
            return Err(bridge.take_pending_or_generic(target.name()))
        }
        (RetKind::Status, RawRet::Int(_)) => Value::None,
        (RetKind::Inquiry, RawRet::Int(flag)) if flag < 0 => {
            return Err(bridge.take_pending_or_generic(target.name()))
        }
        (RetKind::Inquiry, RawRet::Int(flag)) => Value::Bool(flag != 0),
        // A hash of -1 is only an error when an exception is pending.
        (RetKind::Hash, RawRet::Long(-1)) => match bridge.take_pending() {
            Some(err) => return Err(err),
            None => Value::Int(-1),
        },
        (RetKind::Hash, RawRet::Long(hash)) => Value::Int(hash),
        (RetKind::Len, RawRet::Long(len)) if len < 0 => {
            return Err(bridge.take_pending_or_generic(target.name()))
        }
        (RetKind::Len, RawRet::Long(len)) => Value::Int(len),
        (kind, raw) => {
            return Err(RuntimeError::fatal(format!(
                "native call '{}' produced {raw:?} for result convention {kind:?}",
                target.name()
            )))
        }
    };
    // A successful result with an exception still pending means the
    // native code lost track of an error; surface it instead of the value.
    if let Some(err) = bridge.take_pending() {
        log::warn!(
            "'{}' returned a result with an exception set: {err}",
            target.name()
        );
        return Err(RuntimeError::raised(
            "SystemError",
            format!("'{}' returned a result with an exception set", target.name()),
        ));
    }
    Ok(lifted)
}

/// Calls a native target with managed arguments.
pub(crate) fn call(
    bridge: &Bridge,
    target: &NativeTarget,
    argv: &[Value],
) -> Result<Value, RuntimeError> {
    let mut scope = MarshalScope::new(bridge);
    let words = lower_args(&mut scope, target, argv)?;
    let raw = unsafe { invoke_raw(target.fn_ptr, target.shape(), &words) };
    let result = check_result(bridge, target, raw);
    scope.release();
    result
}

/// Calls a native target the way managed code calls any function: a
/// receiver followed by flat positional arguments. The tuple-carrying and
/// keyword-carrying conventions get their extra slots filled in here.
pub(crate) fn call_adapted(
    bridge: &Bridge,
    target: &NativeTarget,
    argv: &[Value],
) -> Result<Value, RuntimeError> {
    match target.shape() {
        CallShape::Varargs | CallShape::Direct => {
            if argv.is_empty() {
                return Err(MarshalError::ArityMismatch {
                    expected: 1,
                    got: 0,
                }
                .into());
            }
            let packed = Value::tuple(argv[1..].to_vec());
            call(bridge, target, &[argv[0].clone(), packed])
        }
        CallShape::Keywords => {
            if argv.is_empty() {
                return Err(MarshalError::ArityMismatch {
                    expected: 1,
                    got: 0,
                }
                .into());
            }
            let packed = Value::tuple(argv[1..].to_vec());
            call(bridge, target, &[argv[0].clone(), packed, Value::None])
        }
        CallShape::FastCallWithKeywords | CallShape::Method => {
            let mut adapted = argv.to_vec();
            adapted.push(Value::None);
            call(bridge, target, &adapted)
        }
        _ => call(bridge, target, argv),
    }
}

/// Calls a module init entry point: no arguments, returns an owned word.
///
/// # Safety
///
/// `fn_ptr` must be a live `extern "C" fn() -> *mut c_void`.
pub(crate) unsafe fn call_init_fn(fn_ptr: *const ()) -> usize {
    let f: extern "C" fn() -> P = std::mem::transmute(fn_ptr);
    f() as usize
}

/// Calls a module create hook: `(spec, def) -> module`.
///
/// # Safety
///
/// `fn_ptr` must be a live `extern "C" fn(P, P) -> P`.
pub(crate) unsafe fn call_create_hook(fn_ptr: *const (), spec: usize, def: usize) -> usize {
    let f: extern "C" fn(P, P) -> P = std::mem::transmute(fn_ptr);
    f(spec as P, def as P) as usize
}

/// Calls a module exec hook: `(module) -> status`.
///
/// # Safety
///
/// `fn_ptr` must be a live `extern "C" fn(P) -> c_int`.
pub(crate) unsafe fn call_exec_hook(fn_ptr: *const (), module: usize) -> i32 {
    let f: extern "C" fn(P) -> c_int = std::mem::transmute(fn_ptr);
    f(module as P)
}

/// Runs a destructor slot on an instance whose count reached zero.
///
/// # Safety
///
/// `fn_ptr` must be a live `extern "C" fn(P)` and `pointer` a live object.
pub(crate) unsafe fn call_dealloc(fn_ptr: *const (), pointer: usize) {
    let f: extern "C" fn(P) = std::mem::transmute(fn_ptr);
    f(pointer as P);
}
