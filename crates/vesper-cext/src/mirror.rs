//! Type struct synthesis for managed classes.
//!
//! Extension code reads type information through raw struct fields: the
//! type pointer in every object header, `tp_base` chains, slot function
//! pointers. Managed classes have none of that, so the bridge synthesizes
//! a native type struct per class on its first transition and keeps it for
//! the context's whole life.
//!
//! The struct's address is the class's native identity, which means it can
//! never move. Invalidation (a class attribute changed after the class was
//! exposed) marks the struct stale; the next transition rewrites the slot
//! fields in place behind the same address.
//!
//! Synthesis is recursive: filling a struct needs the base class's struct
//! for `tp_base` and the metatype's struct for the header's type field.
//! The root pair is mutually dependent, the metatype's own header pointing
//! at itself. Each class's mirror state therefore records a mid-fill phase
//! whose address is handed back to re-entrant requests instead of
//! recursing forever.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::abi::{self, typeflags, typeobj};
use crate::bridge::{Bridge, BridgeStats};
use crate::marshal::incoming;
use crate::slots::{self, SlotGroup};
use crate::value::{ClassRef, RuntimeError, Value};

/// Per-class synthesis state, stored on the class object.
#[derive(Debug)]
pub(crate) enum MirrorState {
    /// No struct yet.
    Empty,
    /// Struct allocated, slot fill in progress on some thread. Re-entrant
    /// requests for the address are satisfied immediately.
    Building { address: usize },
    /// Struct filled and current.
    Ready { address: usize },
    /// Struct exists but a class attribute changed since the last fill.
    Stale { address: usize },
}

impl MirrorState {
    pub(crate) fn new() -> MirrorState {
        MirrorState::Empty
    }

    fn address(&self) -> Option<usize> {
        match self {
            MirrorState::Empty => None,
            MirrorState::Building { address }
            | MirrorState::Ready { address }
            | MirrorState::Stale { address } => Some(*address),
        }
    }
}

/// One synthesized struct and its group blocks, owned by the bridge until
/// shutdown. The name buffer backs the struct's `tp_name` field.
#[derive(Debug)]
pub(crate) struct MirrorAlloc {
    type_ptr: usize,
    number: usize,
    sequence: usize,
    mapping: usize,
    bytes: usize,
    _name: CString,
}

impl MirrorAlloc {
    /// Frees the struct and its group blocks.
    ///
    /// # Safety
    ///
    /// No handle table entry or native code may still refer to the struct.
    pub(crate) unsafe fn free(self, stats: &BridgeStats) {
        dealloc(self.type_ptr as *mut u8, block_layout(typeobj::SIZE));
        if self.number != 0 {
            dealloc(self.number as *mut u8, block_layout(abi::number::SIZE));
        }
        if self.sequence != 0 {
            dealloc(self.sequence as *mut u8, block_layout(abi::sequence::SIZE));
        }
        if self.mapping != 0 {
            dealloc(self.mapping as *mut u8, block_layout(abi::mapping::SIZE));
        }
        stats
            .native_bytes
            .fetch_sub(self.bytes as u64, Ordering::Relaxed);
    }
}

fn block_layout(size: usize) -> Layout {
    Layout::from_size_align(size, 8).expect("mirror block layout")
}

fn alloc_block(size: usize) -> usize {
    let layout = block_layout(size);
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr as usize
}

/// Returns the address of `class`'s type struct, synthesizing or
/// refreshing it as needed. The address is stable for the class's life.
pub(crate) fn materialize(bridge: &Bridge, class: &ClassRef) -> Result<usize, RuntimeError> {
    let address = {
        let mut state = class
            .mirror_state()
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match &*state {
            MirrorState::Ready { address } | MirrorState::Building { address } => {
                return Ok(*address)
            }
            MirrorState::Stale { address } => {
                let address = *address;
                *state = MirrorState::Building { address };
                address
            }
            MirrorState::Empty => {
                let address = allocate(bridge, class);
                *state = MirrorState::Building { address };
                // The struct is the class's native identity from here on.
                bridge.register_type_address(&Value::Class(class.clone()), address);
                address
            }
        }
    };
    // Fill without holding the state lock; base and metatype recursion
    // lands back here through other classes' locks.
    let filled = fill(bridge, class, address);
    let mut state = class
        .mirror_state()
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    match filled {
        Ok(()) => {
            // An invalidation racing the fill wins; the struct stays stale
            // and is rewritten on the next transition.
            if matches!(&*state, MirrorState::Building { .. }) {
                *state = MirrorState::Ready { address };
            }
            Ok(address)
        }
        Err(err) => {
            *state = MirrorState::Stale { address };
            Err(err)
        }
    }
}

/// Marks `class`'s struct for an in-place rebuild. No-op for classes that
/// never crossed the boundary.
pub(crate) fn invalidate(class: &ClassRef) {
    let mut state = class
        .mirror_state()
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(address) = state.address() {
        *state = MirrorState::Stale { address };
    }
}

/// Allocates the struct and its group blocks and writes the fields that
/// never change: name, group pointers, the immortal count.
fn allocate(bridge: &Bridge, class: &ClassRef) -> usize {
    let type_ptr = alloc_block(typeobj::SIZE);
    let mut bytes = typeobj::SIZE;
    let name = CString::new(class.name()).unwrap_or_else(|_| CString::new("?").expect("literal"));

    let number = if slots::wants_number(class, &bridge.builtins().object) {
        bytes += abi::number::SIZE;
        alloc_block(abi::number::SIZE)
    } else {
        0
    };
    let sequence = if slots::wants_sequence(class) {
        bytes += abi::sequence::SIZE;
        alloc_block(abi::sequence::SIZE)
    } else {
        0
    };
    let mapping = if slots::wants_mapping(class) {
        bytes += abi::mapping::SIZE;
        alloc_block(abi::mapping::SIZE)
    } else {
        0
    };

    unsafe {
        abi::store_refcnt(type_ptr, abi::IMMORTAL_REFCNT);
        abi::write_word(type_ptr, typeobj::TP_NAME, name.as_ptr() as usize);
        abi::write_word(type_ptr, typeobj::TP_AS_NUMBER, number);
        abi::write_word(type_ptr, typeobj::TP_AS_SEQUENCE, sequence);
        abi::write_word(type_ptr, typeobj::TP_AS_MAPPING, mapping);
    }

    let stats = bridge.stats();
    stats.native_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    bridge.retain_mirror(MirrorAlloc {
        type_ptr,
        number,
        sequence,
        mapping,
        bytes,
        _name: name,
    });
    type_ptr
}

/// Writes every slot and size field. Runs both on first synthesis and on
/// a stale rebuild; every field it owns is rewritten unconditionally, so a
/// rebuild needs no separate clearing pass.
fn fill(bridge: &Bridge, class: &ClassRef, type_ptr: usize) -> Result<(), RuntimeError> {
    let builtins = bridge.builtins();
    let is_metatype = Arc::ptr_eq(class, &builtins.metatype);

    // Header type field: the metatype's struct, or itself for the
    // metatype. Mid-fill recursion on the root pair resolves through the
    // building-phase address.
    let meta_ptr = if is_metatype {
        type_ptr
    } else {
        materialize(bridge, &builtins.metatype)?
    };
    let base_ptr = match class.lineage().first() {
        Some(base) => materialize(bridge, base)?,
        None => 0,
    };

    unsafe {
        abi::write_word(type_ptr, abi::obj::OB_TYPE, meta_ptr);
        abi::write_i64(type_ptr, abi::varobj::OB_SIZE, 0);
        abi::write_i64(type_ptr, typeobj::TP_BASICSIZE, class.basicsize());
        abi::write_i64(type_ptr, typeobj::TP_ITEMSIZE, 0);
        abi::write_i64(type_ptr, typeobj::TP_DICTOFFSET, class.dictoffset());
        abi::write_word(type_ptr, typeobj::TP_BASE, base_ptr);
        abi::write_word(
            type_ptr,
            typeobj::TP_FLAGS,
            (typeflags::DEFAULT | typeflags::BASETYPE | typeflags::READY) as usize,
        );
        abi::write_word(type_ptr, typeobj::TP_DEALLOC, incoming::stub_dealloc as usize);
        abi::write_word(type_ptr, typeobj::TP_GETATTRO, incoming::slot_getattro as usize);
        abi::write_word(type_ptr, typeobj::TP_SETATTRO, incoming::slot_setattro as usize);
        // Comparison is always dispatchable; the trampoline falls back to
        // identity for `==` and `!=` when no method is defined.
        abi::write_word(
            type_ptr,
            typeobj::TP_RICHCOMPARE,
            incoming::slot_richcompare as usize,
        );
    }

    let group_base = |group: SlotGroup| -> usize {
        match group {
            SlotGroup::Type => type_ptr,
            SlotGroup::Number => unsafe { abi::read_word(type_ptr, typeobj::TP_AS_NUMBER) },
            SlotGroup::Sequence => unsafe { abi::read_word(type_ptr, typeobj::TP_AS_SEQUENCE) },
            SlotGroup::Mapping => unsafe { abi::read_word(type_ptr, typeobj::TP_AS_MAPPING) },
        }
    };

    for def in slots::table() {
        if def.group == SlotGroup::Type && def.offset == typeobj::TP_RICHCOMPARE {
            continue;
        }
        let base = group_base(def.group);
        if base == 0 {
            continue;
        }
        let target = if def.dunders.iter().any(|name| class.resolve(name).is_some()) {
            def.trampoline
        } else {
            // Inherit whatever the base struct carries, slot by slot.
            match base_ptr {
                0 => 0,
                base_ptr => unsafe { slots::read_slot(base_ptr, def) },
            }
        };
        unsafe { abi::write_word(base, def.offset, target) };
    }

    if is_metatype {
        // Calling a class constructs an instance.
        unsafe { abi::write_word(type_ptr, typeobj::TP_CALL, incoming::type_call as usize) };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassObject;
    use serial_test::serial;
    use vesper_config::BridgeConfig;

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::default()).unwrap()
    }

    fn read(ptr: usize, offset: usize) -> usize {
        unsafe { abi::read_word(ptr, offset) }
    }

    #[test]
    #[serial]
    fn test_struct_address_is_stable() {
        let bridge = bridge();
        let cls = ClassObject::new("Anchor", Vec::new(), Vec::new()).unwrap();
        let first = materialize(&bridge, &cls).unwrap();
        let second = materialize(&bridge, &cls).unwrap();
        assert_eq!(first, second);
        invalidate(&cls);
        let third = materialize(&bridge, &cls).unwrap();
        assert_eq!(first, third);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_fixed_fields_and_sizes() {
        let bridge = bridge();
        let cls = ClassObject::new("Plain", Vec::new(), Vec::new()).unwrap();
        let t = materialize(&bridge, &cls).unwrap();
        assert_eq!(unsafe { abi::load_refcnt(t) }, abi::IMMORTAL_REFCNT);
        assert_eq!(
            unsafe { abi::read_cstr(read(t, typeobj::TP_NAME)) }.as_deref(),
            Some("Plain")
        );
        assert_eq!(unsafe { abi::read_i64(t, typeobj::TP_BASICSIZE) }, cls.basicsize());
        assert_eq!(unsafe { abi::read_i64(t, typeobj::TP_DICTOFFSET) }, cls.dictoffset());
        assert_eq!(read(t, typeobj::TP_DEALLOC), incoming::stub_dealloc as usize);
        assert_eq!(read(t, typeobj::TP_RICHCOMPARE), incoming::slot_richcompare as usize);
        // No numeric methods anywhere in the line: empty slots, but the
        // group itself is present.
        let number = read(t, typeobj::TP_AS_NUMBER);
        assert_ne!(number, 0);
        assert_eq!(read(number, abi::number::NB_ADD), 0);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_number_group_is_denied_only_to_the_root() {
        let bridge = bridge();
        let root = bridge.builtins().object.clone();
        let root_ptr = materialize(&bridge, &root).unwrap();
        assert_eq!(read(root_ptr, typeobj::TP_AS_NUMBER), 0);

        // A baseless user class is still below the root for group policy.
        let cls = ClassObject::new("Box", Vec::new(), Vec::new()).unwrap();
        let t = materialize(&bridge, &cls).unwrap();
        assert_ne!(read(t, typeobj::TP_AS_NUMBER), 0);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_defined_dunder_fills_its_slot() {
        let bridge = bridge();
        let cls = ClassObject::new("Addable", Vec::new(), Vec::new()).unwrap();
        cls.set_attr("__add__", Value::None);
        cls.set_attr("__len__", Value::None);
        let t = materialize(&bridge, &cls).unwrap();

        let number = read(t, typeobj::TP_AS_NUMBER);
        assert_ne!(number, 0);
        assert_eq!(read(number, abi::number::NB_ADD), incoming::nb_add as usize);
        assert_eq!(read(number, abi::number::NB_SUBTRACT), 0);

        // `__len__` fills both the mapping and sequence length slots.
        let mapping = read(t, typeobj::TP_AS_MAPPING);
        let sequence = read(t, typeobj::TP_AS_SEQUENCE);
        assert_eq!(read(mapping, abi::mapping::MP_LENGTH), incoming::slot_len as usize);
        assert_eq!(read(sequence, abi::sequence::SQ_LENGTH), incoming::slot_len as usize);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_subclass_links_tp_base_and_inherits() {
        let bridge = bridge();
        let parent = ClassObject::new("Parent", Vec::new(), Vec::new()).unwrap();
        parent.set_attr("__repr__", Value::None);
        let child =
            ClassObject::new("Child", vec![parent.clone()], Vec::new()).unwrap();
        let child_ptr = materialize(&bridge, &child).unwrap();
        let parent_ptr = materialize(&bridge, &parent).unwrap();
        assert_eq!(read(child_ptr, typeobj::TP_BASE), parent_ptr);
        // The inherited method resolves on the child line, so the child's
        // own slot carries the trampoline too.
        assert_eq!(read(child_ptr, typeobj::TP_REPR), incoming::slot_repr as usize);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_metatype_is_self_referential() {
        let bridge = bridge();
        let meta = bridge.builtins().metatype.clone();
        let t = materialize(&bridge, &meta).unwrap();
        assert_eq!(read(t, abi::obj::OB_TYPE), t);
        assert_eq!(read(t, typeobj::TP_CALL), incoming::type_call as usize);
        // Every other struct's header points at the metatype's struct.
        let cls = ClassObject::new("Leaf", Vec::new(), Vec::new()).unwrap();
        let leaf = materialize(&bridge, &cls).unwrap();
        assert_eq!(read(leaf, abi::obj::OB_TYPE), t);
        bridge.shutdown();
    }

    #[test]
    #[serial]
    fn test_invalidate_rebuilds_slots_in_place() {
        let bridge = bridge();
        let cls = ClassObject::new("Mutable", Vec::new(), Vec::new()).unwrap();
        let t = materialize(&bridge, &cls).unwrap();
        assert_eq!(read(t, typeobj::TP_STR), 0);

        cls.set_attr("__str__", Value::None);
        invalidate(&cls);
        assert_eq!(materialize(&bridge, &cls).unwrap(), t);
        assert_eq!(read(t, typeobj::TP_STR), incoming::slot_str as usize);

        cls.remove_attr("__str__");
        invalidate(&cls);
        materialize(&bridge, &cls).unwrap();
        assert_eq!(read(t, typeobj::TP_STR), 0);
        bridge.shutdown();
    }
}
