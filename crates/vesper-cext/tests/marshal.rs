// Outgoing dispatch across the call-shape catalog: lowering, result
// conventions and the adaptation layer, exercised against real
// `extern "C"` functions.

use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use serial_test::serial;
use vesper_cext::marshal::incoming::{
    vx_bool, vx_err_set, vx_inc_ref, vx_int_from, vx_int_value, vx_str_from_utf8, vx_tuple_from_array,
    vx_tuple_size,
};
use vesper_cext::{Bridge, CallShape, NativeTarget, RuntimeError, Value};
use vesper_config::BridgeConfig;

type Obj = *mut c_void;

fn bridge() -> Bridge {
    let mut config = BridgeConfig::default();
    config.monitor.enabled = false;
    Bridge::new(config).unwrap()
}

fn target(name: &str, shape: CallShape, f: *const ()) -> NativeTarget {
    NativeTarget::new(name, shape, f)
}

// ---------------------------------------------------------------------
// Native callees.
// ---------------------------------------------------------------------

extern "C" fn echo_arg(_recv: Obj, arg: Obj) -> Obj {
    vx_inc_ref(arg);
    arg
}

extern "C" fn double_arg(_recv: Obj, arg: Obj) -> Obj {
    vx_int_from(vx_int_value(arg) * 2)
}

extern "C" fn second_word_is_null(_recv: Obj, arg: Obj) -> Obj {
    vx_bool(c_int::from(arg.is_null()))
}

extern "C" fn fail_value_error(_recv: Obj, _arg: Obj) -> Obj {
    vx_err_set(c"ValueError".as_ptr(), c"boom".as_ptr());
    ptr::null_mut()
}

extern "C" fn fail_silently(_recv: Obj, _arg: Obj) -> Obj {
    ptr::null_mut()
}

extern "C" fn forgot_to_clear(_recv: Obj, _arg: Obj) -> Obj {
    vx_err_set(c"ValueError".as_ptr(), c"lingering".as_ptr());
    vx_int_from(1)
}

extern "C" fn always_true(_obj: Obj) -> c_int {
    1
}

extern "C" fn inquiry_fails(_obj: Obj) -> c_int {
    vx_err_set(c"BufferError".as_ptr(), c"no buffer".as_ptr());
    -1
}

extern "C" fn hash_minus_one(_obj: Obj) -> i64 {
    -1
}

extern "C" fn len_five(_obj: Obj) -> i64 {
    5
}

extern "C" fn iter_exhausted(_obj: Obj) -> Obj {
    ptr::null_mut()
}

extern "C" fn iter_broken(_obj: Obj) -> Obj {
    vx_err_set(c"RuntimeError".as_ptr(), c"iterator broke".as_ptr());
    ptr::null_mut()
}

extern "C" fn reflect_compare_op(_lhs: Obj, _rhs: Obj, op: c_int) -> Obj {
    vx_int_from(i64::from(op))
}

extern "C" fn reflect_closure(_recv: Obj, closure: Obj) -> Obj {
    vx_int_from(closure as i64)
}

extern "C" fn echo_name(_recv: Obj, name: *const c_char) -> Obj {
    vx_str_from_utf8(name)
}

extern "C" fn tuple_len(_recv: Obj, args: Obj) -> Obj {
    vx_int_from(vx_tuple_size(args) as i64)
}

extern "C" fn keywords_absent(_recv: Obj, args: Obj, kw: Obj) -> Obj {
    if kw.is_null() {
        vx_int_from(vx_tuple_size(args) as i64)
    } else {
        vx_int_from(-1)
    }
}

extern "C" fn sum_fastcall(_recv: Obj, args: *const Obj, count: isize) -> Obj {
    let mut total = 0;
    for index in 0..count {
        total += vx_int_value(unsafe { *args.offset(index) });
    }
    vx_int_from(total)
}

extern "C" fn pair_of(_recv: Obj, arg: Obj) -> Obj {
    let items = [arg, arg];
    vx_tuple_from_array(items.as_ptr(), 2)
}

// ---------------------------------------------------------------------
// Result conventions.
// ---------------------------------------------------------------------

#[test]
#[serial]
fn test_object_arg_echo_round_trips_the_argument() {
    let bridge = bridge();
    let echo = target("echo", CallShape::ObjectArg, echo_arg as *const ());
    let out = bridge
        .call_native(&echo, &[Value::None, Value::str("payload")])
        .unwrap();
    assert_eq!(out.as_str(), Some("payload"));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_no_args_shape_passes_a_null_second_word() {
    let bridge = bridge();
    let probe = target("probe", CallShape::NoArgs, second_word_is_null as *const ());
    let out = bridge.call_native(&probe, &[Value::None]).unwrap();
    assert_eq!(out, Value::Bool(true));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_null_result_surfaces_the_pending_exception() {
    let bridge = bridge();
    let fail = target("fail", CallShape::ObjectArg, fail_value_error as *const ());
    let err = bridge
        .call_native(&fail, &[Value::None, Value::Int(1)])
        .unwrap_err();
    assert_eq!(
        err,
        RuntimeError::raised("ValueError", "boom")
    );
    assert!(!bridge.has_pending());
    bridge.shutdown();
}

#[test]
#[serial]
fn test_null_result_without_pending_is_a_system_error() {
    let bridge = bridge();
    let fail = target("fail", CallShape::ObjectArg, fail_silently as *const ());
    let err = bridge
        .call_native(&fail, &[Value::None, Value::Int(1)])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Raised { ref kind, .. } if kind == "SystemError"
    ));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_result_with_lingering_exception_is_a_system_error() {
    let bridge = bridge();
    let sloppy = target("sloppy", CallShape::ObjectArg, forgot_to_clear as *const ());
    let err = bridge
        .call_native(&sloppy, &[Value::None, Value::Int(1)])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Raised { ref kind, .. } if kind == "SystemError"
    ));
    assert!(!bridge.has_pending());
    bridge.shutdown();
}

#[test]
#[serial]
fn test_inquiry_result_maps_to_bool() {
    let bridge = bridge();
    let probe = target("probe", CallShape::Inquiry, always_true as *const ());
    let out = bridge.call_native(&probe, &[Value::None]).unwrap();
    assert_eq!(out, Value::Bool(true));

    let broken = target("broken", CallShape::Inquiry, inquiry_fails as *const ());
    let err = bridge.call_native(&broken, &[Value::None]).unwrap_err();
    assert_eq!(err, RuntimeError::raised("BufferError", "no buffer"));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_hash_of_minus_one_without_pending_is_a_value() {
    let bridge = bridge();
    let hasher = target("hash", CallShape::HashFunc, hash_minus_one as *const ());
    let out = bridge.call_native(&hasher, &[Value::None]).unwrap();
    assert_eq!(out, Value::Int(-1));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_len_result_lifts_to_int() {
    let bridge = bridge();
    let length = target("len", CallShape::LenFunc, len_five as *const ());
    let out = bridge.call_native(&length, &[Value::None]).unwrap();
    assert_eq!(out, Value::Int(5));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_iterator_exhaustion_is_distinct_from_failure() {
    let bridge = bridge();
    let done = target("next", CallShape::IterNext, iter_exhausted as *const ());
    let err = bridge.call_native(&done, &[Value::None]).unwrap_err();
    assert_eq!(err, RuntimeError::StopIteration);

    let broken = target("next", CallShape::IterNext, iter_broken as *const ());
    let err = bridge.call_native(&broken, &[Value::None]).unwrap_err();
    assert_eq!(err, RuntimeError::raised("RuntimeError", "iterator broke"));
    bridge.shutdown();
}

// ---------------------------------------------------------------------
// Argument lowering.
// ---------------------------------------------------------------------

#[rstest]
#[case(CallShape::CompareLt, 0)]
#[case(CallShape::CompareLe, 1)]
#[case(CallShape::CompareEq, 2)]
#[case(CallShape::CompareNe, 3)]
#[case(CallShape::CompareGt, 4)]
#[case(CallShape::CompareGe, 5)]
#[serial]
fn test_fixed_compare_shapes_fill_the_opcode_slot(#[case] shape: CallShape, #[case] op: i64) {
    let bridge = bridge();
    let reflect = target("cmp", shape, reflect_compare_op as *const ());
    let out = bridge
        .call_native(&reflect, &[Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(out, Value::Int(op));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_getter_shape_carries_the_closure_word() {
    let bridge = bridge();
    let getter =
        target("get", CallShape::Getter, reflect_closure as *const ()).with_closure(0x2a);
    let out = bridge.call_native(&getter, &[Value::None]).unwrap();
    assert_eq!(out, Value::Int(0x2a));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_char_pointer_slot_lowers_a_managed_string() {
    let bridge = bridge();
    let attr = target("getattr", CallShape::GetAttr, echo_name as *const ());
    let out = bridge
        .call_native(&attr, &[Value::None, Value::str("field_name")])
        .unwrap();
    assert_eq!(out.as_str(), Some("field_name"));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_tuple_built_by_native_code_lifts_with_items() {
    let bridge = bridge();
    let pair = target("pair", CallShape::ObjectArg, pair_of as *const ());
    let out = bridge
        .call_native(&pair, &[Value::None, Value::Int(9)])
        .unwrap();
    assert_eq!(out, Value::tuple(vec![Value::Int(9), Value::Int(9)]));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_arity_mismatch_is_rejected_before_the_call() {
    let bridge = bridge();
    let echo = target("echo", CallShape::ObjectArg, echo_arg as *const ());
    assert!(bridge.call_native(&echo, &[Value::None]).is_err());
    assert!(bridge
        .call_native(&echo, &[Value::None, Value::Int(1), Value::Int(2)])
        .is_err());
    bridge.shutdown();
}

// ---------------------------------------------------------------------
// Adaptation of flat positional arguments.
// ---------------------------------------------------------------------

#[test]
#[serial]
fn test_adapted_varargs_packs_the_tail_into_a_tuple() {
    let bridge = bridge();
    let count = target("count", CallShape::Varargs, tuple_len as *const ());
    let out = bridge
        .call_native_adapted(
            &count,
            &[Value::None, Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();
    assert_eq!(out, Value::Int(3));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_adapted_keywords_convention_gets_a_null_keyword_slot() {
    let bridge = bridge();
    let probe = target("probe", CallShape::Keywords, keywords_absent as *const ());
    let out = bridge
        .call_native_adapted(&probe, &[Value::None, Value::Int(1), Value::Int(2)])
        .unwrap();
    assert_eq!(out, Value::Int(2));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_adapted_fastcall_passes_a_borrowed_argument_vector() {
    let bridge = bridge();
    let sum = target("sum", CallShape::FastCall, sum_fastcall as *const ());
    let out = bridge
        .call_native_adapted(
            &sum,
            &[Value::None, Value::Int(10), Value::Int(20), Value::Int(12)],
        )
        .unwrap();
    assert_eq!(out, Value::Int(42));
    bridge.shutdown();
}

#[test]
#[serial]
fn test_borrowed_arguments_keep_their_counts_balanced() {
    let bridge = bridge();
    let value = Value::str("balanced");
    let pointer = bridge.lower_owned(&value).unwrap();

    let dbl = target("double", CallShape::ObjectArg, double_arg as *const ());
    bridge.call_native(&dbl, &[value.clone(), Value::Int(1000)]).unwrap();
    bridge.call_native(&dbl, &[value.clone(), Value::Int(1000)]).unwrap();

    // The calls above received the receiver as a borrow; only the owned
    // reference from lower_owned remains on the count.
    assert_eq!(
        unsafe { vesper_cext::abi::load_refcnt(pointer) },
        vesper_cext::abi::MANAGED_REFCNT + 1
    );
    bridge.native_decref(pointer);
    bridge.shutdown();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    #[serial]
    fn prop_ints_survive_a_native_round_trip(n in proptest::num::i64::ANY) {
        let bridge = bridge();
        let echo = target("echo", CallShape::ObjectArg, echo_arg as *const ());
        let out = bridge.call_native(&echo, &[Value::None, Value::Int(n)]).unwrap();
        prop_assert_eq!(out.as_int(), Some(n));
        bridge.shutdown();
    }
}
