//! The calling convention catalog.
//!
//! Every native function pointer the bridge ever calls, and every slot it
//! ever fills in a synthesized type struct, is described by one entry of
//! this closed catalog. The numeric ids are part of the extension ABI:
//! they appear in dispatch tables and must never be renumbered. Id 9 was
//! retired and stays reserved.
//!
//! Each shape owns a converter table: the argument slots it expects and
//! the result convention it returns through. The raw invoke layer keys its
//! function pointer casts off these tables, so adding a shape means adding
//! a row here and nothing else.

use crate::abi::methflags;
use crate::marshal::MarshalError;

/// Argument slot kinds, in lowering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Borrowed object handle.
    Object,
    /// Raw pointer payload (argument arrays, getter/setter closures).
    Pointer,
    /// Signed size word.
    Size,
    /// C `int` (comparison opcodes, flag words).
    Int,
    /// NUL-terminated string pointer.
    CharPtr,
}

/// Result conventions and their error protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    /// Owned object handle; null reports an error.
    NewRef,
    /// Status `int`; negative reports an error.
    Status,
    /// Predicate `int`; negative reports an error, otherwise a truth value.
    Inquiry,
    /// Hash word; -1 reports an error only when an exception is pending.
    Hash,
    /// Length word; negative reports an error.
    Len,
    /// Owned object handle; null with no pending exception means the
    /// iterator is exhausted, null with one pending is an error.
    IterNext,
}

/// One calling convention. The discriminants are the wire-stable ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallShape {
    Direct = 1,
    FastCall = 2,
    FastCallWithKeywords = 3,
    Keywords = 4,
    Varargs = 5,
    NoArgs = 6,
    ObjectArg = 7,
    Method = 8,
    Alloc = 10,
    GetAttr = 11,
    SetAttr = 12,
    RichCompare = 13,
    SetItem = 14,
    UnaryFunc = 15,
    BinaryFunc = 16,
    BinaryFuncL = 17,
    BinaryFuncR = 18,
    TernaryFunc = 19,
    TernaryFuncR = 20,
    CompareLt = 21,
    CompareLe = 22,
    CompareEq = 23,
    CompareNe = 24,
    CompareGt = 25,
    CompareGe = 26,
    IterNext = 27,
    Inquiry = 28,
    DelItem = 29,
    GetItem = 30,
    Getter = 31,
    Setter = 32,
    InitProc = 33,
    HashFunc = 34,
    Call = 35,
    SetAttrO = 36,
    DescrGet = 37,
    DescrSet = 38,
    LenFunc = 39,
    ObjObjProc = 40,
    ObjObjArgProc = 41,
    New = 42,
    MpDelItem = 43,
    TpStr = 44,
    TpRepr = 45,
}

/// Every shape, in id order.
pub const ALL_SHAPES: [CallShape; 44] = [
    CallShape::Direct,
    CallShape::FastCall,
    CallShape::FastCallWithKeywords,
    CallShape::Keywords,
    CallShape::Varargs,
    CallShape::NoArgs,
    CallShape::ObjectArg,
    CallShape::Method,
    CallShape::Alloc,
    CallShape::GetAttr,
    CallShape::SetAttr,
    CallShape::RichCompare,
    CallShape::SetItem,
    CallShape::UnaryFunc,
    CallShape::BinaryFunc,
    CallShape::BinaryFuncL,
    CallShape::BinaryFuncR,
    CallShape::TernaryFunc,
    CallShape::TernaryFuncR,
    CallShape::CompareLt,
    CallShape::CompareLe,
    CallShape::CompareEq,
    CallShape::CompareNe,
    CallShape::CompareGt,
    CallShape::CompareGe,
    CallShape::IterNext,
    CallShape::Inquiry,
    CallShape::DelItem,
    CallShape::GetItem,
    CallShape::Getter,
    CallShape::Setter,
    CallShape::InitProc,
    CallShape::HashFunc,
    CallShape::Call,
    CallShape::SetAttrO,
    CallShape::DescrGet,
    CallShape::DescrSet,
    CallShape::LenFunc,
    CallShape::ObjObjProc,
    CallShape::ObjObjArgProc,
    CallShape::New,
    CallShape::MpDelItem,
    CallShape::TpStr,
    CallShape::TpRepr,
];

impl CallShape {
    /// Wire-stable id of this shape.
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<CallShape, MarshalError> {
        ALL_SHAPES
            .iter()
            .copied()
            .find(|shape| shape.id() == id)
            .ok_or(MarshalError::UnknownSignature(id))
    }

    /// Argument slots this convention passes, left to right.
    pub fn arg_kinds(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            CallShape::Direct => &[Object, Object],
            CallShape::FastCall => &[Object, Pointer, Size],
            CallShape::FastCallWithKeywords => &[Object, Pointer, Size, Object],
            CallShape::Keywords => &[Object, Object, Object],
            CallShape::Varargs => &[Object, Object],
            CallShape::NoArgs => &[Object, Object],
            CallShape::ObjectArg => &[Object, Object],
            CallShape::Method => &[Object, Object, Pointer, Size, Object],
            CallShape::Alloc => &[Object, Size],
            CallShape::GetAttr => &[Object, CharPtr],
            CallShape::SetAttr => &[Object, CharPtr, Object],
            CallShape::SetItem => &[Object, Size, Object],
            CallShape::UnaryFunc => &[Object],
            CallShape::BinaryFunc | CallShape::BinaryFuncL | CallShape::BinaryFuncR => {
                &[Object, Object]
            }
            CallShape::TernaryFunc | CallShape::TernaryFuncR => &[Object, Object, Object],
            // The fixed comparison shapes call the same three-word function
            // as RichCompare; the opcode slot is filled during lowering
            // rather than by the caller.
            CallShape::RichCompare
            | CallShape::CompareLt
            | CallShape::CompareLe
            | CallShape::CompareEq
            | CallShape::CompareNe
            | CallShape::CompareGt
            | CallShape::CompareGe => &[Object, Object, Int],
            CallShape::IterNext => &[Object],
            CallShape::Inquiry => &[Object],
            CallShape::DelItem => &[Object, Size, Object],
            CallShape::GetItem => &[Object, Size],
            CallShape::Getter => &[Object, Pointer],
            CallShape::Setter => &[Object, Object, Pointer],
            CallShape::InitProc => &[Object, Object, Object],
            CallShape::HashFunc => &[Object],
            CallShape::Call => &[Object, Object, Object],
            CallShape::SetAttrO => &[Object, Object, Object],
            CallShape::DescrGet => &[Object, Object, Object],
            CallShape::DescrSet => &[Object, Object, Object],
            CallShape::LenFunc => &[Object],
            CallShape::ObjObjProc => &[Object, Object],
            CallShape::ObjObjArgProc => &[Object, Object, Object],
            CallShape::New => &[Object, Object, Object],
            CallShape::MpDelItem => &[Object, Object, Object],
            CallShape::TpStr | CallShape::TpRepr => &[Object],
        }
    }

    /// Result convention of this shape.
    pub fn ret_kind(self) -> RetKind {
        match self {
            CallShape::SetAttr
            | CallShape::SetItem
            | CallShape::DelItem
            | CallShape::Setter
            | CallShape::InitProc
            | CallShape::SetAttrO
            | CallShape::DescrSet
            | CallShape::ObjObjArgProc
            | CallShape::MpDelItem => RetKind::Status,
            CallShape::Inquiry | CallShape::ObjObjProc => RetKind::Inquiry,
            CallShape::HashFunc => RetKind::Hash,
            CallShape::LenFunc => RetKind::Len,
            CallShape::IterNext => RetKind::IterNext,
            _ => RetKind::NewRef,
        }
    }

    /// Number of managed values the caller supplies ahead of lowering.
    ///
    /// This counts `Object` slots only; pointer, size and opcode slots are
    /// derived during lowering.
    pub fn object_arity(self) -> usize {
        self.arg_kinds()
            .iter()
            .filter(|kind| **kind == ArgKind::Object)
            .count()
    }

    /// Selects the convention encoded in a method table entry's flags.
    ///
    /// The checks run in a fixed precedence order; the first match wins.
    pub fn from_method_flags(flags: i32) -> Result<CallShape, MarshalError> {
        let has = |bit: i32| flags & bit != 0;
        if has(methflags::NOARGS) {
            Ok(CallShape::NoArgs)
        } else if has(methflags::ONE_ARG) {
            Ok(CallShape::ObjectArg)
        } else if has(methflags::VARARGS) && has(methflags::KEYWORDS) {
            Ok(CallShape::Keywords)
        } else if has(methflags::VARARGS) {
            Ok(CallShape::Varargs)
        } else if has(methflags::METHOD) {
            Ok(CallShape::Method)
        } else if has(methflags::FASTCALL) && has(methflags::KEYWORDS) {
            Ok(CallShape::FastCallWithKeywords)
        } else if has(methflags::FASTCALL) {
            Ok(CallShape::FastCall)
        } else {
            Err(MarshalError::UnsupportedFlags(flags))
        }
    }

    /// The comparison opcode baked into the fixed comparison shapes.
    pub fn fixed_compare_op(self) -> Option<i32> {
        use crate::abi::cmpop;
        match self {
            CallShape::CompareLt => Some(cmpop::LT),
            CallShape::CompareLe => Some(cmpop::LE),
            CallShape::CompareEq => Some(cmpop::EQ),
            CallShape::CompareNe => Some(cmpop::NE),
            CallShape::CompareGt => Some(cmpop::GT),
            CallShape::CompareGe => Some(cmpop::GE),
            _ => None,
        }
    }
}
