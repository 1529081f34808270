//! Extension module initialization.
//!
//! A loaded library exports one `PyInit_<name>` entry point. Its result is
//! either a module handle the extension already built (single-phase) or a
//! module definition struct describing how to build one (multi-phase):
//! name, per-module state size, an optional create hook, exec hooks run in
//! declaration order, and a method table whose entries become callable
//! attributes of the module object.

use std::sync::Arc;

use crate::abi::{self, methoddef, moduledef, moduleslot};
use crate::bridge::Bridge;
use crate::loader::LoadedLibrary;
use crate::marshal::outgoing::{self, NativeTarget};
use crate::marshal::shape::CallShape;
use crate::value::{ManagedObject, Payload, RuntimeError, Value};

const INIT_PREFIX: &str = "PyInit_";

fn import_error(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::raised("ImportError", msg)
}

/// Initializes the extension module `name` from `library` and registers it
/// in the context's module table.
pub fn load_module(
    bridge: &Bridge,
    library: &Arc<LoadedLibrary>,
    name: &str,
) -> Result<Value, RuntimeError> {
    if let Some(existing) = bridge.module(name) {
        return Ok(existing);
    }
    let symbol = format!("{INIT_PREFIX}{name}");
    let init = unsafe { library.require_symbol(&symbol) }
        .map_err(|err| import_error(err.to_string()))?;

    let result = unsafe { outgoing::call_init_fn(init) };
    if result == 0 {
        return Err(bridge.take_pending_or_generic(&symbol));
    }
    if bridge.has_pending() {
        let pending = bridge.take_pending_or_generic(&symbol);
        return Err(RuntimeError::raised(
            "SystemError",
            format!("{symbol} returned a result with an exception set: {pending}"),
        ));
    }

    let module = adopt_init_result(bridge, &symbol, name, result)?;
    log::debug!("loaded extension module '{name}' from {}", library.path().display());
    Ok(module)
}

/// Interprets a nonzero init-function result.
///
/// A handle coming back means the extension built the module itself
/// through the exported API; anything else is a definition struct. The
/// init convention transfers one reference with a returned handle, and
/// the module table holds its own, so the transferred one is folded here.
fn adopt_init_result(
    bridge: &Bridge,
    symbol: &str,
    name: &str,
    result: usize,
) -> Result<Value, RuntimeError> {
    match bridge.lift_borrowed(result) {
        Ok(value @ Value::Object(_)) if is_module(&value) => {
            bridge.register_module(name, value.clone());
            bridge.native_decref(result);
            Ok(value)
        }
        Ok(Value::Native(_)) | Err(_) => init_multiphase(bridge, result),
        Ok(other) => {
            bridge.native_decref(result);
            Err(import_error(format!(
                "{symbol} returned {}, expected a module or module definition",
                other.type_name()
            )))
        }
    }
}

fn is_module(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.with_payload_mut(|p| matches!(p, Payload::Module { .. })))
}

/// Builds a module from a definition struct.
fn init_multiphase(bridge: &Bridge, def: usize) -> Result<Value, RuntimeError> {
    let name = unsafe { abi::read_cstr(abi::read_word(def, moduledef::M_NAME)) }
        .ok_or_else(|| import_error("module definition has no name"))?;
    let state_size = unsafe { abi::read_i64(def, moduledef::M_SIZE) };
    if state_size < 0 {
        return Err(import_error(format!(
            "module '{name}' declares negative state size {state_size}"
        )));
    }

    let slots = unsafe { read_slots(abi::read_word(def, moduledef::M_SLOTS)) };
    let mut create: Option<usize> = None;
    let mut execs = Vec::new();
    for (id, value) in slots {
        match id {
            moduleslot::CREATE => {
                if create.replace(value).is_some() {
                    return Err(import_error(format!(
                        "module '{name}' declares more than one create slot"
                    )));
                }
            }
            moduleslot::EXEC => execs.push(value),
            other => {
                return Err(import_error(format!(
                    "module '{name}' uses unknown slot id {other}"
                )))
            }
        }
    }

    let module = match create {
        Some(hook) => {
            // The create hook receives the import request (the module
            // name here) and the definition it came from.
            let spec = bridge.lower_owned(&Value::str(name.clone()))?;
            let raw = unsafe { outgoing::call_create_hook(hook as *const (), spec, def) };
            if raw == 0 {
                return Err(bridge.take_pending_or_generic(&name));
            }
            let created = bridge.from_native(raw, true)?;
            if !is_module(&created) {
                return Err(import_error(format!(
                    "create slot of module '{name}' did not return a module"
                )));
            }
            created
        }
        None => Value::Object(ManagedObject::with_payload(
            bridge.builtins().module.clone(),
            Payload::Module { name: name.clone() },
        )),
    };

    if state_size > 0 {
        // Kept alive for the context's life; the extension reaches it
        // through the pointer recorded at creation.
        bridge.retain_module_state(state_size as usize);
    }

    bind_methods(bridge, &module, unsafe {
        abi::read_word(def, moduledef::M_METHODS)
    })?;

    let module_ptr = bridge.lower_owned(&module)?;
    for hook in execs {
        let status = unsafe { outgoing::call_exec_hook(hook as *const (), module_ptr) };
        if status != 0 {
            return Err(bridge.take_pending_or_generic(&name));
        }
        if bridge.has_pending() {
            let pending = bridge.take_pending_or_generic(&name);
            return Err(RuntimeError::raised(
                "SystemError",
                format!("exec slot of '{name}' succeeded with an exception set: {pending}"),
            ));
        }
    }

    bridge.register_module(name, module.clone());
    Ok(module)
}

/// Reads an id-terminated slot table. Returns an empty list for a null
/// table pointer.
unsafe fn read_slots(table: usize) -> Vec<(i32, usize)> {
    let mut slots = Vec::new();
    if table == 0 {
        return slots;
    }
    let mut entry = table;
    loop {
        let id = abi::read_i32(entry, moduleslot::ID);
        if id == 0 {
            return slots;
        }
        slots.push((id, abi::read_word(entry, moduleslot::VALUE)));
        entry += moduleslot::SIZE;
    }
}

/// Binds each method table entry as a callable module attribute.
fn bind_methods(bridge: &Bridge, module: &Value, table: usize) -> Result<(), RuntimeError> {
    if table == 0 {
        return Ok(());
    }
    let mut entry = table;
    loop {
        let (name, fn_ptr, flags) = unsafe {
            let name = abi::read_cstr(abi::read_word(entry, methoddef::ML_NAME));
            let fn_ptr = abi::read_word(entry, methoddef::ML_METH);
            let flags = abi::read_i32(entry, methoddef::ML_FLAGS);
            (name, fn_ptr, flags)
        };
        let Some(name) = name else {
            return Ok(());
        };
        let shape = CallShape::from_method_flags(flags)?;
        let target = NativeTarget::new(name.clone(), shape, fn_ptr as *const ());
        let function = Value::Object(ManagedObject::with_payload(
            bridge.builtins().function.clone(),
            Payload::NativeFn(target),
        ));
        bridge.set_attr_value(module, &name, Some(function))?;
        entry += methoddef::SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::methflags;
    use serial_test::serial;
    use std::ffi::CString;
    use std::os::raw::{c_int, c_void};
    use vesper_config::BridgeConfig;

    type P = *mut c_void;

    // A definition struct and its string table, laid out by hand the way
    // an extension's static data would be.
    struct DefBlock {
        bytes: Vec<u8>,
        _names: Vec<CString>,
    }

    impl DefBlock {
        fn ptr(&self) -> usize {
            self.bytes.as_ptr() as usize
        }
    }

    fn write_word(bytes: &mut [u8], offset: usize, value: usize) {
        bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// One exec slot plus a one-method table.
    fn sample_def(
        name: &str,
        state_size: i64,
        exec: usize,
        method: Option<(&str, usize, i32)>,
    ) -> DefBlock {
        let mut names = Vec::new();
        let name_c = CString::new(name).unwrap();

        // slots: exec (optional) + terminator
        let slot_count = usize::from(exec != 0) + 1;
        let methods_len = 2 * methoddef::SIZE;
        let slots_off = moduledef::SIZE;
        let methods_off = slots_off + slot_count * moduleslot::SIZE;
        let mut bytes = vec![0u8; methods_off + methods_len];

        write_word(&mut bytes, moduledef::M_NAME, name_c.as_ptr() as usize);
        bytes[moduledef::M_SIZE..moduledef::M_SIZE + 8]
            .copy_from_slice(&state_size.to_ne_bytes());

        if exec != 0 {
            write_i32(&mut bytes, slots_off + moduleslot::ID, moduleslot::EXEC);
            write_word(&mut bytes, slots_off + moduleslot::VALUE, exec);
        }
        let base = bytes.as_ptr() as usize;
        write_word(&mut bytes, moduledef::M_SLOTS, base + slots_off);

        if let Some((method_name, fn_ptr, flags)) = method {
            let method_c = CString::new(method_name).unwrap();
            write_word(&mut bytes, methods_off + methoddef::ML_NAME, method_c.as_ptr() as usize);
            write_word(&mut bytes, methods_off + methoddef::ML_METH, fn_ptr);
            write_i32(&mut bytes, methods_off + methoddef::ML_FLAGS, flags);
            names.push(method_c);
            write_word(&mut bytes, moduledef::M_METHODS, base + methods_off);
        }

        names.push(name_c);
        // The pointers written above reference the final storage.
        assert_eq!(bytes.as_ptr() as usize, base);
        DefBlock {
            bytes,
            _names: names,
        }
    }

    extern "C" fn exec_ok(_module: P) -> c_int {
        0
    }

    extern "C" fn exec_fails(_module: P) -> c_int {
        -1
    }

    extern "C" fn double_it(_recv: P, arg: P) -> P {
        let n = crate::marshal::incoming::vx_int_value(arg);
        crate::marshal::incoming::vx_int_from(n * 2)
    }

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::default()).unwrap()
    }

    #[test]
    #[serial]
    fn test_multiphase_builds_and_registers_module() {
        let bridge = bridge();
        let def = sample_def(
            "spam",
            0,
            exec_ok as usize,
            Some(("double", double_it as usize, methflags::ONE_ARG)),
        );
        let module = init_multiphase(&bridge, def.ptr()).unwrap();
        assert!(bridge.module("spam").is_some());

        let double = bridge.get_attr_value(&module, "double").unwrap();
        let result = bridge
            .call_value(&double, &[module.clone(), Value::Int(21)])
            .unwrap();
        assert_eq!(result, Value::Int(42));
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_failing_exec_slot_aborts_init() {
        let bridge = bridge();
        let def = sample_def("broken", 0, exec_fails as usize, None);
        let err = init_multiphase(&bridge, def.ptr()).unwrap_err();
        assert!(matches!(err, RuntimeError::Raised { .. }));
        assert!(bridge.module("broken").is_none());
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_single_phase_result_reference_is_folded() {
        let bridge = bridge();
        let module = Value::Object(ManagedObject::with_payload(
            bridge.builtins().module.clone(),
            Payload::Module {
                name: "flat".to_string(),
            },
        ));
        // Stand in for the init function: a handle owning one reference,
        // exactly what a single-phase `PyInit_` returns.
        let result = bridge.lower_owned(&module).unwrap();
        assert_eq!(
            unsafe { abi::load_refcnt(result) },
            abi::MANAGED_REFCNT + 1
        );

        let adopted = adopt_init_result(&bridge, "PyInit_flat", "flat", result).unwrap();
        assert!(adopted.is_identical(&module));
        assert!(bridge.module("flat").is_some_and(|m| m.is_identical(&module)));
        // The table keeps its own reference; the transferred one is gone.
        assert_eq!(unsafe { abi::load_refcnt(result) }, abi::MANAGED_REFCNT);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_negative_state_size_is_rejected() {
        let bridge = bridge();
        let def = sample_def("negsize", -1, 0, None);
        let err = init_multiphase(&bridge, def.ptr()).unwrap_err();
        assert!(err.to_string().contains("negative state size"));
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_unknown_slot_id_is_rejected() {
        let bridge = bridge();
        let mut def = sample_def("oddslot", 0, exec_ok as usize, None);
        // Rewrite the exec slot id to something undefined.
        let slots = unsafe { abi::read_word(def.ptr(), moduledef::M_SLOTS) };
        let offset = slots - def.ptr();
        write_i32(&mut def.bytes, offset + moduleslot::ID, 7);
        let err = init_multiphase(&bridge, def.ptr()).unwrap_err();
        assert!(err.to_string().contains("unknown slot id 7"));
        bridge.shutdown();
    }
}
