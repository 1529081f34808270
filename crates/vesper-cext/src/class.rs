//! Managed class objects and method resolution order.
//!
//! Classes linearize their ancestry with the C3 algorithm at construction
//! time, so attribute resolution and native slot synthesis walk a fixed
//! list instead of re-deriving the order on every lookup. Each class also
//! carries the state of its synthesized native type struct; see
//! [`crate::mirror`] for how that struct is built.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::abi;
use crate::bridge::wrapper::Wrapper;
use crate::mirror::MirrorState;
use crate::value::{ClassRef, RuntimeError, Value};

/// A managed class.
///
/// `lineage` holds the C3-linearized ancestors, nearest first, without the
/// class itself. Lookup always consults the class's own attributes before
/// walking the lineage.
#[derive(Debug)]
pub struct ClassObject {
    name: String,
    bases: Vec<ClassRef>,
    lineage: Vec<ClassRef>,
    value_slots: Vec<String>,
    attrs: Mutex<HashMap<String, Value>>,
    native: OnceLock<Wrapper>,
    mirror: Mutex<MirrorState>,
}

impl ClassObject {
    /// Creates a class and linearizes its ancestry.
    ///
    /// `value_slots` names the fixed per-instance storage fields. A class
    /// with value slots gets an exact instance layout; a class without them
    /// stores attributes in a dictionary.
    pub fn new(
        name: impl Into<String>,
        bases: Vec<ClassRef>,
        value_slots: Vec<String>,
    ) -> Result<ClassRef, RuntimeError> {
        let name = name.into();
        let lineage = linearize(&name, &bases)?;
        Ok(Arc::new(ClassObject {
            name,
            bases,
            lineage,
            value_slots,
            attrs: Mutex::new(HashMap::new()),
            native: OnceLock::new(),
            mirror: Mutex::new(MirrorState::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bases(&self) -> &[ClassRef] {
        &self.bases
    }

    /// C3-linearized ancestors, nearest first, excluding the class itself.
    pub fn lineage(&self) -> &[ClassRef] {
        &self.lineage
    }

    pub fn value_slots(&self) -> &[String] {
        &self.value_slots
    }

    /// True when instances use fixed slot storage instead of a dictionary.
    pub fn has_fixed_layout(&self) -> bool {
        !self.value_slots.is_empty()
    }

    /// Instance size advertised to native code.
    ///
    /// Slot-based classes get the exact layout: header plus one word per
    /// value slot. Dictionary-based classes get header plus the dictionary
    /// pointer.
    pub fn basicsize(&self) -> i64 {
        if self.has_fixed_layout() {
            (abi::obj::SIZE + 8 * self.value_slots.len()) as i64
        } else {
            (abi::obj::SIZE + 8) as i64
        }
    }

    /// Byte offset of the dictionary pointer, zero for slot-based classes.
    pub fn dictoffset(&self) -> i64 {
        if self.has_fixed_layout() {
            0
        } else {
            abi::obj::SIZE as i64
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Writes a class attribute without touching the synthesized type
    /// struct. Callers that may have exposed this class to native code go
    /// through the bridge, which refreshes affected mirrors.
    pub fn set_attr(&self, name: impl Into<String>, value: Value) {
        self.attrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value);
    }

    pub fn remove_attr(&self, name: &str) -> Option<Value> {
        self.attrs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    /// Resolves an attribute against this class and then its lineage.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(found) = self.get_attr(name) {
            return Some(found);
        }
        self.lineage.iter().find_map(|ancestor| ancestor.get_attr(name))
    }

    /// True when `other` appears in this class's lineage.
    pub fn derives_from(&self, other: &ClassRef) -> bool {
        self.lineage.iter().any(|c| Arc::ptr_eq(c, other))
    }

    pub fn native_wrapper(&self) -> Option<&Wrapper> {
        self.native.get()
    }

    pub fn bind_native_wrapper(&self, wrapper: Wrapper) -> &Wrapper {
        self.native.get_or_init(|| wrapper)
    }

    pub(crate) fn mirror_state(&self) -> &Mutex<MirrorState> {
        &self.mirror
    }
}

/// C3 linearization of `bases`, excluding the class itself.
fn linearize(name: &str, bases: &[ClassRef]) -> Result<Vec<ClassRef>, RuntimeError> {
    if bases.is_empty() {
        return Ok(Vec::new());
    }
    let mut sequences: Vec<Vec<ClassRef>> = bases
        .iter()
        .map(|base| {
            let mut seq = vec![base.clone()];
            seq.extend(base.lineage().iter().cloned());
            seq
        })
        .collect();
    sequences.push(bases.to_vec());
    merge(name, sequences)
}

fn merge(name: &str, mut sequences: Vec<Vec<ClassRef>>) -> Result<Vec<ClassRef>, RuntimeError> {
    let mut result = Vec::new();
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }
        // A head is good when it appears in no other sequence's tail.
        let candidate = sequences
            .iter()
            .map(|seq| &seq[0])
            .find(|head| {
                sequences
                    .iter()
                    .all(|seq| !seq[1..].iter().any(|c| Arc::ptr_eq(c, head)))
            })
            .cloned();
        let Some(next) = candidate else {
            return Err(RuntimeError::type_error(format!(
                "cannot create a consistent method resolution order for class '{name}'"
            )));
        };
        for seq in &mut sequences {
            seq.retain(|c| !Arc::ptr_eq(c, &next));
        }
        result.push(next);
    }
}
