//! Slot resolution tables for synthesized type structs.
//!
//! Each row ties a type-struct slot to the method names that populate it,
//! the calling convention of the stored function, and the trampoline
//! written into the slot when a class defines one of those names. The
//! synthesizer walks this table when it builds a mirror; the outgoing side
//! walks it in reverse to call a slot stored in a foreign type.
//!
//! Rows are ordered by lookup precedence: when a name maps to slots in
//! several groups (`__getitem__`, `__len__`), the mapping form outranks
//! the sequence form.

use std::sync::OnceLock;

use crate::abi::{self, mapping, number, sequence, typeobj};
use crate::class::ClassObject;
use crate::marshal::incoming;
use crate::marshal::shape::CallShape;

/// Which struct a slot offset indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotGroup {
    /// The type struct itself.
    Type,
    /// The numeric group sub-struct.
    Number,
    /// The mapping group sub-struct.
    Mapping,
    /// The sequence group sub-struct.
    Sequence,
}

/// One slot the synthesizer knows how to fill.
#[derive(Debug)]
pub(crate) struct SlotDef {
    pub group: SlotGroup,
    pub offset: usize,
    /// Method names that populate this slot; defining any one fills it.
    pub dunders: &'static [&'static str],
    /// Convention of the function stored in the slot.
    pub shape: CallShape,
    /// Trampoline address written when a class defines the method.
    pub trampoline: usize,
}

const COMPARE_DUNDERS: &[&str] = &[
    "__lt__", "__le__", "__eq__", "__ne__", "__gt__", "__ge__",
];

/// The full table. Built at first use; slot trampoline addresses are
/// function pointers and cannot be taken in a constant.
pub(crate) fn table() -> &'static [SlotDef] {
    static TABLE: OnceLock<Vec<SlotDef>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

fn build_table() -> Vec<SlotDef> {
    use SlotGroup::*;

    fn row(
        group: SlotGroup,
        offset: usize,
        dunders: &'static [&'static str],
        shape: CallShape,
        trampoline: usize,
    ) -> SlotDef {
        SlotDef {
            group,
            offset,
            dunders,
            shape,
            trampoline,
        }
    }

    vec![
        row(
            Type,
            typeobj::TP_REPR,
            &["__repr__"],
            CallShape::TpRepr,
            incoming::slot_repr as usize,
        ),
        row(
            Type,
            typeobj::TP_STR,
            &["__str__"],
            CallShape::TpStr,
            incoming::slot_str as usize,
        ),
        row(
            Type,
            typeobj::TP_HASH,
            &["__hash__"],
            CallShape::HashFunc,
            incoming::slot_hash as usize,
        ),
        row(
            Type,
            typeobj::TP_CALL,
            &["__call__"],
            CallShape::Call,
            incoming::slot_call as usize,
        ),
        row(
            Type,
            typeobj::TP_ITER,
            &["__iter__"],
            CallShape::UnaryFunc,
            incoming::slot_iter as usize,
        ),
        row(
            Type,
            typeobj::TP_ITERNEXT,
            &["__next__"],
            CallShape::IterNext,
            incoming::slot_iternext as usize,
        ),
        row(
            Type,
            typeobj::TP_INIT,
            &["__init__"],
            CallShape::InitProc,
            incoming::slot_init as usize,
        ),
        row(
            Type,
            typeobj::TP_NEW,
            &["__new__"],
            CallShape::New,
            incoming::slot_new as usize,
        ),
        row(
            Type,
            typeobj::TP_DESCR_GET,
            &["__get__"],
            CallShape::DescrGet,
            incoming::slot_descr_get as usize,
        ),
        row(
            Type,
            typeobj::TP_DESCR_SET,
            &["__set__", "__delete__"],
            CallShape::DescrSet,
            incoming::slot_descr_set as usize,
        ),
        row(
            Type,
            typeobj::TP_RICHCOMPARE,
            COMPARE_DUNDERS,
            CallShape::RichCompare,
            incoming::slot_richcompare as usize,
        ),
        row(
            Number,
            number::NB_ADD,
            &["__add__"],
            CallShape::BinaryFunc,
            incoming::nb_add as usize,
        ),
        row(
            Number,
            number::NB_SUBTRACT,
            &["__sub__"],
            CallShape::BinaryFunc,
            incoming::nb_subtract as usize,
        ),
        row(
            Number,
            number::NB_MULTIPLY,
            &["__mul__"],
            CallShape::BinaryFunc,
            incoming::nb_multiply as usize,
        ),
        row(
            Number,
            number::NB_REMAINDER,
            &["__mod__"],
            CallShape::BinaryFunc,
            incoming::nb_remainder as usize,
        ),
        row(
            Number,
            number::NB_POWER,
            &["__pow__"],
            CallShape::TernaryFunc,
            incoming::nb_power as usize,
        ),
        row(
            Number,
            number::NB_NEGATIVE,
            &["__neg__"],
            CallShape::UnaryFunc,
            incoming::nb_negative as usize,
        ),
        row(
            Number,
            number::NB_POSITIVE,
            &["__pos__"],
            CallShape::UnaryFunc,
            incoming::nb_positive as usize,
        ),
        row(
            Number,
            number::NB_ABSOLUTE,
            &["__abs__"],
            CallShape::UnaryFunc,
            incoming::nb_absolute as usize,
        ),
        row(
            Number,
            number::NB_BOOL,
            &["__bool__"],
            CallShape::Inquiry,
            incoming::nb_bool as usize,
        ),
        row(
            Number,
            number::NB_INVERT,
            &["__invert__"],
            CallShape::UnaryFunc,
            incoming::nb_invert as usize,
        ),
        row(
            Number,
            number::NB_LSHIFT,
            &["__lshift__"],
            CallShape::BinaryFunc,
            incoming::nb_lshift as usize,
        ),
        row(
            Number,
            number::NB_RSHIFT,
            &["__rshift__"],
            CallShape::BinaryFunc,
            incoming::nb_rshift as usize,
        ),
        row(
            Number,
            number::NB_AND,
            &["__and__"],
            CallShape::BinaryFunc,
            incoming::nb_and as usize,
        ),
        row(
            Number,
            number::NB_XOR,
            &["__xor__"],
            CallShape::BinaryFunc,
            incoming::nb_xor as usize,
        ),
        row(
            Number,
            number::NB_OR,
            &["__or__"],
            CallShape::BinaryFunc,
            incoming::nb_or as usize,
        ),
        row(
            Number,
            number::NB_INT,
            &["__int__"],
            CallShape::UnaryFunc,
            incoming::nb_int as usize,
        ),
        row(
            Number,
            number::NB_FLOAT,
            &["__float__"],
            CallShape::UnaryFunc,
            incoming::nb_float as usize,
        ),
        row(
            Number,
            number::NB_FLOOR_DIVIDE,
            &["__floordiv__"],
            CallShape::BinaryFunc,
            incoming::nb_floor_divide as usize,
        ),
        row(
            Number,
            number::NB_TRUE_DIVIDE,
            &["__truediv__"],
            CallShape::BinaryFunc,
            incoming::nb_true_divide as usize,
        ),
        row(
            Number,
            number::NB_INDEX,
            &["__index__"],
            CallShape::UnaryFunc,
            incoming::nb_index as usize,
        ),
        row(
            Mapping,
            mapping::MP_LENGTH,
            &["__len__"],
            CallShape::LenFunc,
            incoming::slot_len as usize,
        ),
        row(
            Mapping,
            mapping::MP_SUBSCRIPT,
            &["__getitem__"],
            CallShape::BinaryFunc,
            incoming::mp_subscript as usize,
        ),
        row(
            Mapping,
            mapping::MP_ASS_SUBSCRIPT,
            &["__setitem__", "__delitem__"],
            CallShape::ObjObjArgProc,
            incoming::mp_ass_subscript as usize,
        ),
        row(
            Sequence,
            sequence::SQ_LENGTH,
            &["__len__"],
            CallShape::LenFunc,
            incoming::slot_len as usize,
        ),
        row(
            Sequence,
            sequence::SQ_ITEM,
            &["__getitem__"],
            CallShape::GetItem,
            incoming::sq_item as usize,
        ),
        row(
            Sequence,
            sequence::SQ_ASS_ITEM,
            &["__setitem__", "__delitem__"],
            CallShape::SetItem,
            incoming::sq_ass_item as usize,
        ),
        row(
            Sequence,
            sequence::SQ_CONTAINS,
            &["__contains__"],
            CallShape::ObjObjProc,
            incoming::sq_contains as usize,
        ),
    ]
}

/// Rows whose slot `name` populates, in precedence order.
pub(crate) fn candidates_for(name: &str) -> impl Iterator<Item = &'static SlotDef> + '_ {
    table().iter().filter(move |def| def.dunders.contains(&name))
}

/// Whether a mirror for `class` allocates the numeric group.
///
/// Every class below the root gets one; extensions read number slots off
/// arbitrary objects and expect the group pointer to be there. Only the
/// root object type itself carries a null group.
pub(crate) fn wants_number(class: &ClassObject, root: &ClassObject) -> bool {
    !std::ptr::eq(class, root)
}

/// Whether a mirror for `class` allocates the sequence group.
pub(crate) fn wants_sequence(class: &ClassObject) -> bool {
    class.resolve("__len__").is_some() || class.resolve("__getitem__").is_some()
}

/// Whether a mirror for `class` allocates the mapping group.
pub(crate) fn wants_mapping(class: &ClassObject) -> bool {
    class.resolve("__len__").is_some()
}

/// Reads the function stored in `def`'s slot of a foreign type. Zero when
/// the slot or its group is absent.
///
/// # Safety
///
/// `type_ptr` must point at a live type struct.
pub(crate) unsafe fn read_slot(type_ptr: usize, def: &SlotDef) -> usize {
    let base = match def.group {
        SlotGroup::Type => type_ptr,
        SlotGroup::Number => abi::read_word(type_ptr, typeobj::TP_AS_NUMBER),
        SlotGroup::Mapping => abi::read_word(type_ptr, typeobj::TP_AS_MAPPING),
        SlotGroup::Sequence => abi::read_word(type_ptr, typeobj::TP_AS_SEQUENCE),
    };
    if base == 0 {
        return 0;
    }
    abi::read_word(base, def.offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn class_with(methods: &[&str]) -> std::sync::Arc<ClassObject> {
        let cls = ClassObject::new("Probe", Vec::new(), Vec::new()).unwrap();
        for name in methods {
            cls.set_attr(*name, Value::None);
        }
        cls
    }

    #[test]
    fn test_table_has_no_duplicate_slots() {
        let mut seen = std::collections::HashSet::new();
        for def in table() {
            assert!(
                seen.insert((def.group, def.offset)),
                "slot {:?}+{} appears twice",
                def.group,
                def.offset
            );
            assert_ne!(def.trampoline, 0);
            assert!(!def.dunders.is_empty());
        }
    }

    #[test]
    fn test_slot_offsets_stay_inside_their_structs() {
        for def in table() {
            let limit = match def.group {
                SlotGroup::Type => typeobj::SIZE,
                SlotGroup::Number => number::SIZE,
                SlotGroup::Mapping => mapping::SIZE,
                SlotGroup::Sequence => sequence::SIZE,
            };
            assert!(def.offset + 8 <= limit, "offset {} escapes {:?}", def.offset, def.group);
        }
    }

    #[test]
    fn test_mapping_outranks_sequence_for_shared_names() {
        let groups: Vec<SlotGroup> = candidates_for("__getitem__").map(|d| d.group).collect();
        assert_eq!(groups, vec![SlotGroup::Mapping, SlotGroup::Sequence]);
        let groups: Vec<SlotGroup> = candidates_for("__len__").map(|d| d.group).collect();
        assert_eq!(groups, vec![SlotGroup::Mapping, SlotGroup::Sequence]);
    }

    #[test]
    fn test_compare_dunders_share_one_slot() {
        let defs: Vec<&SlotDef> = candidates_for("__lt__").collect();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].offset, typeobj::TP_RICHCOMPARE);
        let eq_defs: Vec<&SlotDef> = candidates_for("__eq__").collect();
        assert!(std::ptr::eq(defs[0], eq_defs[0]));
    }

    #[test]
    fn test_group_policies() {
        let root = class_with(&[]);
        assert!(!wants_number(&root, &root));
        assert!(!wants_sequence(&root));
        assert!(!wants_mapping(&root));

        // Every class but the root carries the numeric group, whether or
        // not it defines a numeric method.
        let plain = class_with(&[]);
        assert!(wants_number(&plain, &root));

        let seq = class_with(&["__getitem__"]);
        assert!(wants_sequence(&seq));
        assert!(!wants_mapping(&seq));

        let sized = class_with(&["__len__"]);
        assert!(wants_sequence(&sized));
        assert!(wants_mapping(&sized));
    }

    #[test]
    fn test_read_slot_handles_missing_groups() {
        let block = vec![0u8; typeobj::SIZE];
        let type_ptr = block.as_ptr() as usize;
        let add = candidates_for("__add__").next().unwrap();
        assert_eq!(unsafe { read_slot(type_ptr, add) }, 0);
        let repr = candidates_for("__repr__").next().unwrap();
        assert_eq!(unsafe { read_slot(type_ptr, repr) }, 0);
    }
}
