//! Call marshaling between the managed runtime and extension code.
//!
//! - [`shape`]: the closed catalog of calling conventions and their
//!   argument/result converter tables.
//! - [`outgoing`]: managed code invoking native function pointers.
//! - [`incoming`]: native code invoking managed behavior through slot
//!   trampolines and the exported entry points.
//! - [`members`]: typed field access on extension-owned instances.

pub mod incoming;
pub mod members;
pub mod outgoing;
pub mod shape;

use std::fmt;

use crate::value::RuntimeError;

/// Errors raised while lowering or lifting call data.
#[derive(Debug, Clone, PartialEq)]
pub enum MarshalError {
    /// Method table flags do not select any known calling convention.
    UnsupportedFlags(i32),
    /// A signature id outside the catalog.
    UnknownSignature(u8),
    /// A value cannot be lowered to the slot the convention requires.
    TypeMismatch { expected: &'static str, got: String },
    /// Wrong number of arguments for the convention.
    ArityMismatch { expected: usize, got: usize },
    /// Interior NUL while building a C string argument.
    NulInString(String),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::UnsupportedFlags(flags) => {
                write!(f, "unsupported method flags {flags:#x}")
            }
            MarshalError::UnknownSignature(id) => {
                write!(f, "unknown signature id {id}")
            }
            MarshalError::TypeMismatch { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            MarshalError::ArityMismatch { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            MarshalError::NulInString(s) => {
                write!(f, "string argument contains an interior NUL: {s:?}")
            }
        }
    }
}

impl std::error::Error for MarshalError {}

impl From<MarshalError> for RuntimeError {
    fn from(err: MarshalError) -> RuntimeError {
        RuntimeError::type_error(err.to_string())
    }
}
