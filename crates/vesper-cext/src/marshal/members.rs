//! Typed field access on extension-owned instances.
//!
//! Extension types describe plain struct fields in a member table and
//! computed attributes in a getter/setter table. Both tables live in the
//! type struct and are walked here; the loads and stores themselves go
//! through the width the member's type code prescribes.
//!
//! Unsigned member stores keep the historical lenient behavior: negative
//! values are stored as their two's complement bit pattern and oversized
//! values are truncated, without raising. Extensions in the field depend
//! on round-tripping sentinel values like -1 through unsigned fields.

use crate::abi::{self, membertype as mt};
use crate::bridge::Bridge;
use crate::value::{RuntimeError, Value};

/// One entry of a type's member table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MemberDef {
    pub name: String,
    pub kind: i32,
    pub offset: usize,
    pub readonly: bool,
}

/// One entry of a type's getter/setter table.
#[derive(Debug, Clone)]
pub(crate) struct GetSetDef {
    pub name: String,
    pub getter: usize,
    pub setter: usize,
    pub closure: usize,
}

/// Walks a NUL-name-terminated member table.
///
/// # Safety
///
/// `table` must be null or point at a member table laid out per the
/// catalog, terminated by an entry with a null name.
pub(crate) unsafe fn read_member_table(table: usize) -> Vec<MemberDef> {
    let mut defs = Vec::new();
    if table == 0 {
        return defs;
    }
    let mut entry = table;
    while let Some(name) = abi::read_cstr(abi::read_word(entry, abi::memberdef::NAME)) {
        let flags = abi::read_i32(entry, abi::memberdef::FLAGS);
        defs.push(MemberDef {
            name,
            kind: abi::read_i32(entry, abi::memberdef::TYPE),
            offset: abi::read_i64(entry, abi::memberdef::OFFSET) as usize,
            readonly: flags & mt::READONLY != 0,
        });
        entry += abi::memberdef::SIZE;
    }
    defs
}

/// Walks a NUL-name-terminated getter/setter table.
///
/// # Safety
///
/// Same requirements as [`read_member_table`], for the getset layout.
pub(crate) unsafe fn read_getset_table(table: usize) -> Vec<GetSetDef> {
    let mut defs = Vec::new();
    if table == 0 {
        return defs;
    }
    let mut entry = table;
    while let Some(name) = abi::read_cstr(abi::read_word(entry, abi::getsetdef::NAME)) {
        defs.push(GetSetDef {
            name,
            getter: abi::read_word(entry, abi::getsetdef::GET),
            setter: abi::read_word(entry, abi::getsetdef::SET),
            closure: abi::read_word(entry, abi::getsetdef::CLOSURE),
        });
        entry += abi::getsetdef::SIZE;
    }
    defs
}

/// Finds `name` in the member tables along a foreign type's base chain.
///
/// # Safety
///
/// `type_ptr` must be null or point at a live type struct.
pub(crate) unsafe fn find_member(type_ptr: usize, name: &str) -> Option<MemberDef> {
    let mut current = type_ptr;
    while current != 0 {
        let table = abi::read_word(current, abi::typeobj::TP_MEMBERS);
        if let Some(def) = read_member_table(table).into_iter().find(|d| d.name == name) {
            return Some(def);
        }
        current = abi::read_word(current, abi::typeobj::TP_BASE);
    }
    None
}

/// Finds `name` in the getter/setter tables along a foreign type's base
/// chain.
///
/// # Safety
///
/// `type_ptr` must be null or point at a live type struct.
pub(crate) unsafe fn find_getset(type_ptr: usize, name: &str) -> Option<GetSetDef> {
    let mut current = type_ptr;
    while current != 0 {
        let table = abi::read_word(current, abi::typeobj::TP_GETSET);
        if let Some(def) = read_getset_table(table).into_iter().find(|d| d.name == name) {
            return Some(def);
        }
        current = abi::read_word(current, abi::typeobj::TP_BASE);
    }
    None
}

/// Reads a member from an instance.
pub(crate) fn load(
    bridge: &Bridge,
    instance: usize,
    def: &MemberDef,
) -> Result<Value, RuntimeError> {
    match def.kind {
        mt::T_OBJECT => {
            let word = unsafe { abi::read_word(instance, def.offset) };
            if word == 0 {
                Ok(Value::None)
            } else {
                bridge.lift_borrowed(word)
            }
        }
        mt::T_OBJECT_EX => {
            let word = unsafe { abi::read_word(instance, def.offset) };
            if word == 0 {
                Err(RuntimeError::attribute_error(def.name.clone()))
            } else {
                bridge.lift_borrowed(word)
            }
        }
        _ => load_scalar(instance, def),
    }
}

fn load_scalar(instance: usize, def: &MemberDef) -> Result<Value, RuntimeError> {
    let base = instance + def.offset;
    let value = unsafe {
        match def.kind {
            mt::T_SHORT => Value::Int(i64::from(*(base as *const i16))),
            mt::T_INT => Value::Int(i64::from(*(base as *const i32))),
            mt::T_LONG | mt::T_LONGLONG => Value::Int(*(base as *const i64)),
            mt::T_PYSSIZET => Value::Int(*(base as *const isize) as i64),
            mt::T_BYTE => Value::Int(i64::from(*(base as *const i8))),
            mt::T_UBYTE => Value::Int(i64::from(*(base as *const u8))),
            mt::T_USHORT => Value::Int(i64::from(*(base as *const u16))),
            mt::T_UINT => Value::Int(i64::from(*(base as *const u32))),
            mt::T_ULONG | mt::T_ULONGLONG => {
                let raw = *(base as *const u64);
                Value::Int(i64::try_from(raw).map_err(|_| {
                    RuntimeError::value_error(format!(
                        "member '{}' value {raw} is out of range",
                        def.name
                    ))
                })?)
            }
            mt::T_FLOAT => Value::Float(f64::from(*(base as *const f32))),
            mt::T_DOUBLE => Value::Float(*(base as *const f64)),
            mt::T_BOOL => Value::Bool(*(base as *const u8) != 0),
            mt::T_CHAR => {
                let byte = *(base as *const u8);
                Value::str((byte as char).to_string())
            }
            mt::T_STRING => match abi::read_cstr(abi::read_word(instance, def.offset)) {
                Some(text) => Value::str(text),
                None => Value::None,
            },
            mt::T_STRING_INPLACE => match abi::read_cstr(base) {
                Some(text) => Value::str(text),
                None => Value::None,
            },
            mt::T_NONE => Value::None,
            other => {
                return Err(RuntimeError::type_error(format!(
                    "member '{}' has unknown type code {other}",
                    def.name
                )))
            }
        }
    };
    Ok(value)
}

/// Writes a member of an instance. `value` of `None` deletes, which only
/// object members support.
pub(crate) fn store(
    bridge: &Bridge,
    instance: usize,
    def: &MemberDef,
    value: Option<&Value>,
) -> Result<(), RuntimeError> {
    if def.readonly {
        return Err(RuntimeError::attribute_error(format!(
            "attribute '{}' is read-only",
            def.name
        )));
    }
    match def.kind {
        mt::T_OBJECT | mt::T_OBJECT_EX => store_object(bridge, instance, def, value),
        _ => match value {
            Some(value) => store_scalar(instance, def, value),
            None => Err(RuntimeError::type_error(format!(
                "cannot delete numeric attribute '{}'",
                def.name
            ))),
        },
    }
}

fn store_object(
    bridge: &Bridge,
    instance: usize,
    def: &MemberDef,
    value: Option<&Value>,
) -> Result<(), RuntimeError> {
    let old = unsafe { abi::read_word(instance, def.offset) };
    let new = match value {
        Some(value) => bridge.lower_owned(value)?,
        None => {
            if old == 0 && def.kind == mt::T_OBJECT_EX {
                return Err(RuntimeError::attribute_error(def.name.clone()));
            }
            0
        }
    };
    unsafe { abi::write_word(instance, def.offset, new) };
    if old != 0 {
        bridge.native_decref(old);
    }
    Ok(())
}

fn store_scalar(instance: usize, def: &MemberDef, value: &Value) -> Result<(), RuntimeError> {
    let base = instance + def.offset;
    match def.kind {
        mt::T_BOOL => {
            // Booleans are strict; nothing coerces into them.
            let Value::Bool(b) = value else {
                return Err(RuntimeError::type_error(format!(
                    "attribute '{}' must be a bool, not {}",
                    def.name,
                    value.type_name()
                )));
            };
            unsafe { *(base as *mut u8) = u8::from(*b) };
            return Ok(());
        }
        mt::T_CHAR => {
            let text = value.as_str().ok_or_else(|| {
                RuntimeError::type_error(format!("attribute '{}' must be a str", def.name))
            })?;
            let mut bytes = text.bytes();
            let (Some(byte), None) = (bytes.next(), bytes.next()) else {
                return Err(RuntimeError::type_error(format!(
                    "attribute '{}' must be a str of length 1",
                    def.name
                )));
            };
            unsafe { *(base as *mut u8) = byte };
            return Ok(());
        }
        mt::T_FLOAT | mt::T_DOUBLE => {
            let x = match value {
                Value::Float(x) => *x,
                Value::Int(n) => *n as f64,
                other => {
                    return Err(RuntimeError::type_error(format!(
                        "attribute '{}' must be a float, not {}",
                        def.name,
                        other.type_name()
                    )))
                }
            };
            unsafe {
                if def.kind == mt::T_FLOAT {
                    *(base as *mut f32) = x as f32;
                } else {
                    *(base as *mut f64) = x;
                }
            }
            return Ok(());
        }
        mt::T_STRING | mt::T_STRING_INPLACE | mt::T_NONE => {
            return Err(RuntimeError::type_error(format!(
                "attribute '{}' is read-only",
                def.name
            )));
        }
        _ => {}
    }

    let n = value.as_int().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "attribute '{}' must be an int, not {}",
            def.name,
            value.type_name()
        ))
    })?;
    unsafe {
        match def.kind {
            mt::T_SHORT => *(base as *mut i16) = n as i16,
            mt::T_INT => *(base as *mut i32) = n as i32,
            mt::T_LONG | mt::T_LONGLONG => *(base as *mut i64) = n,
            mt::T_PYSSIZET => *(base as *mut isize) = n as isize,
            mt::T_BYTE => *(base as *mut i8) = n as i8,
            // Unsigned members keep the lenient legacy: negative input
            // lands as its two's complement pattern, oversized input is
            // truncated, and neither raises.
            mt::T_UBYTE => *(base as *mut u8) = n as u8,
            mt::T_USHORT => *(base as *mut u16) = n as u16,
            mt::T_UINT => *(base as *mut u32) = n as u32,
            mt::T_ULONG | mt::T_ULONGLONG => *(base as *mut u64) = n as u64,
            other => {
                return Err(RuntimeError::type_error(format!(
                    "member '{}' has unknown type code {other}",
                    def.name
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[repr(C)]
    struct Sample {
        small: i16,
        count: i32,
        wide: i64,
        ratio: f64,
        flag: u8,
        letter: u8,
        unsigned_word: u32,
        unsigned_short: u16,
    }

    fn sample() -> Sample {
        Sample {
            small: -3,
            count: 41,
            wide: 1 << 40,
            ratio: 2.5,
            flag: 1,
            letter: b'k',
            unsigned_word: 7,
            unsigned_short: 7,
        }
    }

    fn def(name: &str, kind: i32, offset: usize) -> MemberDef {
        MemberDef {
            name: name.to_string(),
            kind,
            offset,
            readonly: false,
        }
    }

    fn field_offset<T>(base: &Sample, field: &T) -> usize {
        field as *const T as usize - base as *const Sample as usize
    }

    #[test]
    fn test_scalar_loads() {
        let s = sample();
        let base = &s as *const Sample as usize;
        assert_eq!(
            load_scalar(base, &def("small", mt::T_SHORT, field_offset(&s, &s.small))).unwrap(),
            Value::Int(-3)
        );
        assert_eq!(
            load_scalar(base, &def("count", mt::T_INT, field_offset(&s, &s.count))).unwrap(),
            Value::Int(41)
        );
        assert_eq!(
            load_scalar(base, &def("wide", mt::T_LONG, field_offset(&s, &s.wide))).unwrap(),
            Value::Int(1 << 40)
        );
        assert_eq!(
            load_scalar(base, &def("ratio", mt::T_DOUBLE, field_offset(&s, &s.ratio))).unwrap(),
            Value::Float(2.5)
        );
        assert_eq!(
            load_scalar(base, &def("flag", mt::T_BOOL, field_offset(&s, &s.flag))).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            load_scalar(base, &def("letter", mt::T_CHAR, field_offset(&s, &s.letter))).unwrap(),
            Value::str("k")
        );
    }

    #[test]
    fn test_scalar_store_round_trip() {
        let mut s = sample();
        let count = def("count", mt::T_INT, field_offset(&s, &s.count));
        let base = &mut s as *mut Sample as usize;
        store_scalar(base, &count, &Value::Int(-7)).unwrap();
        assert_eq!(load_scalar(base, &count).unwrap(), Value::Int(-7));
    }

    #[test]
    fn test_unsigned_store_accepts_negative_as_twos_complement() {
        let mut s = sample();
        let word = def("unsigned_word", mt::T_UINT, field_offset(&s, &s.unsigned_word));
        let base = &mut s as *mut Sample as usize;
        store_scalar(base, &word, &Value::Int(-1)).unwrap();
        assert_eq!(load_scalar(base, &word).unwrap(), Value::Int(0xFFFF_FFFF));
    }

    #[test]
    fn test_unsigned_store_truncates_oversized() {
        let mut s = sample();
        let short = def(
            "unsigned_short",
            mt::T_USHORT,
            field_offset(&s, &s.unsigned_short),
        );
        let base = &mut s as *mut Sample as usize;
        store_scalar(base, &short, &Value::Int(0x1_FFFF)).unwrap();
        assert_eq!(load_scalar(base, &short).unwrap(), Value::Int(0xFFFF));
    }

    #[test]
    fn test_bool_store_is_strict() {
        let mut s = sample();
        let flag = def("flag", mt::T_BOOL, field_offset(&s, &s.flag));
        let base = &mut s as *mut Sample as usize;
        let err = store_scalar(base, &flag, &Value::Int(1)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeError { .. }));
        store_scalar(base, &flag, &Value::Bool(false)).unwrap();
        assert_eq!(load_scalar(base, &flag).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_string_member_is_read_only() {
        let text = CString::new("static text").unwrap();
        let holder: u64 = text.as_ptr() as u64;
        let base = &holder as *const u64 as usize;
        let member = def("label", mt::T_STRING, 0);
        assert_eq!(load_scalar(base, &member).unwrap(), Value::str("static text"));
        let err = store_scalar(base, &member, &Value::str("nope")).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeError { .. }));
    }

    #[test]
    fn test_member_table_walk() {
        let name_a = CString::new("alpha").unwrap();
        let name_b = CString::new("beta").unwrap();
        // Three entries of five words each; the last has a null name.
        let mut table = [0u64; 15];
        table[0] = name_a.as_ptr() as u64;
        table[1] = mt::T_INT as u64;
        table[2] = 16;
        table[3] = 0;
        table[5] = name_b.as_ptr() as u64;
        table[6] = mt::T_DOUBLE as u64;
        table[7] = 24;
        table[8] = mt::READONLY as u64;
        let defs = unsafe { read_member_table(table.as_ptr() as usize) };
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "alpha");
        assert_eq!(defs[0].kind, mt::T_INT);
        assert_eq!(defs[0].offset, 16);
        assert!(!defs[0].readonly);
        assert_eq!(defs[1].name, "beta");
        assert!(defs[1].readonly);
    }

    #[test]
    fn test_getset_table_walk() {
        let name = CString::new("computed").unwrap();
        let mut table = [0u64; 10];
        table[0] = name.as_ptr() as u64;
        table[1] = 0x1111;
        table[2] = 0x2222;
        table[4] = 0x3333;
        let defs = unsafe { read_getset_table(table.as_ptr() as usize) };
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].getter, 0x1111);
        assert_eq!(defs[0].setter, 0x2222);
        assert_eq!(defs[0].closure, 0x3333);
    }
}
