//! ABI descriptor catalog for the C extension interface.
//!
//! Everything the bridge knows about the native side's memory layout lives
//! here: struct field offsets, flag words, member type codes, and the
//! reference count sentinels shared by both ownership domains. Offsets are
//! written for the 64-bit layout that extensions compile against; the unit
//! tests pin the derived sizes so a stray edit is caught immediately.
//!
//! Nothing in this module allocates or takes locks. The raw accessors at the
//! bottom are the only place the rest of the crate reads or writes foreign
//! struct fields, so the unsafe surface stays in one file.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};

/// Baseline reference count installed on every handle while the managed
/// domain owns it. Native increments sit on top of this value; a count
/// strictly above the baseline means native code holds live references.
pub const MANAGED_REFCNT: u64 = 0x1000_0000;

/// Reference count marking an object that is never deallocated through
/// reference counting. Cached primitives and synthesized type structs
/// carry this value.
pub const IMMORTAL_REFCNT: u64 = 0xFFFF_FFFF;

/// Smallest integer kept in the shared primitive cache.
pub const SMALL_INT_MIN: i64 = -5;

/// Largest integer kept in the shared primitive cache.
pub const SMALL_INT_MAX: i64 = 256;

/// Object header layout: `{ refcnt: u64, type: *mut }`.
pub mod obj {
    pub const OB_REFCNT: usize = 0;
    pub const OB_TYPE: usize = 8;
    pub const SIZE: usize = 16;
}

/// Variable-size object header: object header plus an item count.
pub mod varobj {
    pub const OB_SIZE: usize = 16;
    pub const SIZE: usize = 24;
}

/// Type struct layout. Field order matters: extension code indexes these
/// offsets directly, so the catalog must match the header the extension
/// was compiled against.
pub mod typeobj {
    pub const TP_NAME: usize = 24;
    pub const TP_BASICSIZE: usize = 32;
    pub const TP_ITEMSIZE: usize = 40;
    pub const TP_DEALLOC: usize = 48;
    pub const TP_VECTORCALL_OFFSET: usize = 56;
    pub const TP_GETATTR: usize = 64;
    pub const TP_SETATTR: usize = 72;
    pub const TP_AS_ASYNC: usize = 80;
    pub const TP_REPR: usize = 88;
    pub const TP_AS_NUMBER: usize = 96;
    pub const TP_AS_SEQUENCE: usize = 104;
    pub const TP_AS_MAPPING: usize = 112;
    pub const TP_HASH: usize = 120;
    pub const TP_CALL: usize = 128;
    pub const TP_STR: usize = 136;
    pub const TP_GETATTRO: usize = 144;
    pub const TP_SETATTRO: usize = 152;
    pub const TP_AS_BUFFER: usize = 160;
    pub const TP_FLAGS: usize = 168;
    pub const TP_DOC: usize = 176;
    pub const TP_TRAVERSE: usize = 184;
    pub const TP_CLEAR: usize = 192;
    pub const TP_RICHCOMPARE: usize = 200;
    pub const TP_WEAKLISTOFFSET: usize = 208;
    pub const TP_ITER: usize = 216;
    pub const TP_ITERNEXT: usize = 224;
    pub const TP_METHODS: usize = 232;
    pub const TP_MEMBERS: usize = 240;
    pub const TP_GETSET: usize = 248;
    pub const TP_BASE: usize = 256;
    pub const TP_DICT: usize = 264;
    pub const TP_DESCR_GET: usize = 272;
    pub const TP_DESCR_SET: usize = 280;
    pub const TP_DICTOFFSET: usize = 288;
    pub const TP_INIT: usize = 296;
    pub const TP_ALLOC: usize = 304;
    pub const TP_NEW: usize = 312;
    pub const TP_FREE: usize = 320;
    pub const TP_IS_GC: usize = 328;
    pub const TP_BASES: usize = 336;
    pub const TP_MRO: usize = 344;
    pub const TP_CACHE: usize = 352;
    pub const TP_SUBCLASSES: usize = 360;
    pub const TP_WEAKLIST: usize = 368;
    pub const TP_DEL: usize = 376;
    pub const TP_VERSION_TAG: usize = 384;
    pub const TP_FINALIZE: usize = 392;
    pub const TP_VECTORCALL: usize = 400;
    pub const SIZE: usize = 408;
}

/// Numeric slot group. 36 function pointer fields.
pub mod number {
    pub const NB_ADD: usize = 0;
    pub const NB_SUBTRACT: usize = 8;
    pub const NB_MULTIPLY: usize = 16;
    pub const NB_REMAINDER: usize = 24;
    pub const NB_DIVMOD: usize = 32;
    pub const NB_POWER: usize = 40;
    pub const NB_NEGATIVE: usize = 48;
    pub const NB_POSITIVE: usize = 56;
    pub const NB_ABSOLUTE: usize = 64;
    pub const NB_BOOL: usize = 72;
    pub const NB_INVERT: usize = 80;
    pub const NB_LSHIFT: usize = 88;
    pub const NB_RSHIFT: usize = 96;
    pub const NB_AND: usize = 104;
    pub const NB_XOR: usize = 112;
    pub const NB_OR: usize = 120;
    pub const NB_INT: usize = 128;
    pub const NB_RESERVED: usize = 136;
    pub const NB_FLOAT: usize = 144;
    pub const NB_INPLACE_ADD: usize = 152;
    pub const NB_INPLACE_SUBTRACT: usize = 160;
    pub const NB_INPLACE_MULTIPLY: usize = 168;
    pub const NB_INPLACE_REMAINDER: usize = 176;
    pub const NB_INPLACE_POWER: usize = 184;
    pub const NB_INPLACE_LSHIFT: usize = 192;
    pub const NB_INPLACE_RSHIFT: usize = 200;
    pub const NB_INPLACE_AND: usize = 208;
    pub const NB_INPLACE_XOR: usize = 216;
    pub const NB_INPLACE_OR: usize = 224;
    pub const NB_FLOOR_DIVIDE: usize = 232;
    pub const NB_TRUE_DIVIDE: usize = 240;
    pub const NB_INPLACE_FLOOR_DIVIDE: usize = 248;
    pub const NB_INPLACE_TRUE_DIVIDE: usize = 256;
    pub const NB_INDEX: usize = 264;
    pub const NB_MATRIX_MULTIPLY: usize = 272;
    pub const NB_INPLACE_MATRIX_MULTIPLY: usize = 280;
    pub const SIZE: usize = 288;
}

/// Sequence slot group. 10 function pointer fields, two of them retired
/// but still occupying their historical positions.
pub mod sequence {
    pub const SQ_LENGTH: usize = 0;
    pub const SQ_CONCAT: usize = 8;
    pub const SQ_REPEAT: usize = 16;
    pub const SQ_ITEM: usize = 24;
    pub const SQ_WAS_SLICE: usize = 32;
    pub const SQ_ASS_ITEM: usize = 40;
    pub const SQ_WAS_ASS_SLICE: usize = 48;
    pub const SQ_CONTAINS: usize = 56;
    pub const SQ_INPLACE_CONCAT: usize = 64;
    pub const SQ_INPLACE_REPEAT: usize = 72;
    pub const SIZE: usize = 80;
}

/// Mapping slot group.
pub mod mapping {
    pub const MP_LENGTH: usize = 0;
    pub const MP_SUBSCRIPT: usize = 8;
    pub const MP_ASS_SUBSCRIPT: usize = 16;
    pub const SIZE: usize = 24;
}

/// Method table entry: `{ name, fn, flags: c_int, doc }`.
pub mod methoddef {
    pub const ML_NAME: usize = 0;
    pub const ML_METH: usize = 8;
    pub const ML_FLAGS: usize = 16;
    pub const ML_DOC: usize = 24;
    pub const SIZE: usize = 32;
}

/// Member table entry: `{ name, type: c_int, offset: ssize, flags: c_int, doc }`.
pub mod memberdef {
    pub const NAME: usize = 0;
    pub const TYPE: usize = 8;
    pub const OFFSET: usize = 16;
    pub const FLAGS: usize = 24;
    pub const DOC: usize = 32;
    pub const SIZE: usize = 40;
}

/// Getter/setter table entry.
pub mod getsetdef {
    pub const NAME: usize = 0;
    pub const GET: usize = 8;
    pub const SET: usize = 16;
    pub const DOC: usize = 24;
    pub const CLOSURE: usize = 32;
    pub const SIZE: usize = 40;
}

/// Module definition struct. The leading 40 bytes are the definition base
/// (object header, init slot, module index, copy slot).
pub mod moduledef {
    pub const M_NAME: usize = 40;
    pub const M_DOC: usize = 48;
    pub const M_SIZE: usize = 56;
    pub const M_METHODS: usize = 64;
    pub const M_SLOTS: usize = 72;
    pub const M_TRAVERSE: usize = 80;
    pub const M_CLEAR: usize = 88;
    pub const M_FREE: usize = 96;
    pub const SIZE: usize = 104;
}

/// Module definition slot entry: `{ id: c_int, value: *mut }`.
pub mod moduleslot {
    pub const ID: usize = 0;
    pub const VALUE: usize = 8;
    pub const SIZE: usize = 16;

    /// Hook that creates the module object.
    pub const CREATE: i32 = 1;
    /// Hook executed against the created module, in table order.
    pub const EXEC: i32 = 2;
}

/// Method table flag bits.
pub mod methflags {
    pub const VARARGS: i32 = 0x0001;
    pub const KEYWORDS: i32 = 0x0002;
    pub const NOARGS: i32 = 0x0004;
    pub const ONE_ARG: i32 = 0x0008;
    pub const CLASS: i32 = 0x0010;
    pub const STATIC: i32 = 0x0020;
    pub const COEXIST: i32 = 0x0040;
    pub const FASTCALL: i32 = 0x0080;
    pub const METHOD: i32 = 0x0200;
}

/// Member type codes used in member tables.
pub mod membertype {
    pub const T_SHORT: i32 = 0;
    pub const T_INT: i32 = 1;
    pub const T_LONG: i32 = 2;
    pub const T_FLOAT: i32 = 3;
    pub const T_DOUBLE: i32 = 4;
    pub const T_STRING: i32 = 5;
    pub const T_OBJECT: i32 = 6;
    pub const T_CHAR: i32 = 7;
    pub const T_BYTE: i32 = 8;
    pub const T_UBYTE: i32 = 9;
    pub const T_USHORT: i32 = 10;
    pub const T_UINT: i32 = 11;
    pub const T_ULONG: i32 = 12;
    pub const T_STRING_INPLACE: i32 = 13;
    pub const T_BOOL: i32 = 14;
    pub const T_OBJECT_EX: i32 = 16;
    pub const T_LONGLONG: i32 = 17;
    pub const T_ULONGLONG: i32 = 18;
    pub const T_PYSSIZET: i32 = 19;
    pub const T_NONE: i32 = 20;

    /// Member flag bit: the member rejects writes.
    pub const READONLY: i32 = 1;
}

/// Type flag bits carried in `tp_flags` of synthesized type structs.
pub mod typeflags {
    pub const DEFAULT: u64 = 3 << 15;
    pub const BASETYPE: u64 = 1 << 10;
    pub const READY: u64 = 1 << 12;
    pub const IMMUTABLE: u64 = 1 << 8;
}

/// Comparison opcodes passed to rich comparison slots.
pub mod cmpop {
    pub const LT: i32 = 0;
    pub const LE: i32 = 1;
    pub const EQ: i32 = 2;
    pub const NE: i32 = 3;
    pub const GT: i32 = 4;
    pub const GE: i32 = 5;
}

/// Reads a pointer-sized field from a foreign struct.
///
/// # Safety
///
/// `base + offset` must point into a live, readable allocation laid out per
/// this catalog, and the field must be pointer aligned.
pub unsafe fn read_word(base: usize, offset: usize) -> usize {
    *((base + offset) as *const usize)
}

/// Writes a pointer-sized field of a foreign struct.
///
/// # Safety
///
/// Same layout requirements as [`read_word`], plus the field must be
/// writable and not concurrently mutated by native code.
pub unsafe fn write_word(base: usize, offset: usize, value: usize) {
    *((base + offset) as *mut usize) = value;
}

/// Reads a signed 64-bit field (sizes, ssize counters).
///
/// # Safety
///
/// Same requirements as [`read_word`].
pub unsafe fn read_i64(base: usize, offset: usize) -> i64 {
    *((base + offset) as *const i64)
}

/// Writes a signed 64-bit field.
///
/// # Safety
///
/// Same requirements as [`write_word`].
pub unsafe fn write_i64(base: usize, offset: usize, value: i64) {
    *((base + offset) as *mut i64) = value;
}

/// Reads a C `int` field.
///
/// # Safety
///
/// `base + offset` must point at a readable, 4-aligned field.
pub unsafe fn read_i32(base: usize, offset: usize) -> i32 {
    *((base + offset) as *const i32)
}

/// Loads the reference count field of an object header.
///
/// The count is shared with native code, which mutates it with plain
/// stores. The atomic view keeps the managed side's reads well defined.
///
/// # Safety
///
/// `ptr` must point at a live object header.
pub unsafe fn load_refcnt(ptr: usize) -> u64 {
    (*(ptr as *const AtomicU64)).load(Ordering::Acquire)
}

/// Stores the reference count field of an object header.
///
/// # Safety
///
/// `ptr` must point at a live object header.
pub unsafe fn store_refcnt(ptr: usize, value: u64) {
    (*(ptr as *const AtomicU64)).store(value, Ordering::Release)
}

/// Adds a signed delta to the reference count field and returns the new
/// value.
///
/// # Safety
///
/// `ptr` must point at a live object header.
pub unsafe fn adjust_refcnt(ptr: usize, delta: i64) -> u64 {
    let cell = &*(ptr as *const AtomicU64);
    if delta >= 0 {
        cell.fetch_add(delta as u64, Ordering::AcqRel) + delta as u64
    } else {
        let sub = delta.unsigned_abs();
        cell.fetch_sub(sub, Ordering::AcqRel).wrapping_sub(sub)
    }
}

/// Copies a NUL-terminated C string into an owned `String`.
///
/// Returns `None` for a null pointer. Invalid UTF-8 is replaced rather
/// than rejected; member and method names come from extension binaries
/// the runtime does not control.
///
/// # Safety
///
/// A non-null `ptr` must point at a NUL-terminated byte string.
pub unsafe fn read_cstr(ptr: usize) -> Option<String> {
    if ptr == 0 {
        return None;
    }
    let raw = CStr::from_ptr(ptr as *const c_char);
    Some(raw.to_string_lossy().into_owned())
}
