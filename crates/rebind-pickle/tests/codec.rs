//! Codec properties over generated values

use proptest::prelude::*;
use rebind_pickle::{dump_all, load_all, Global, Heap, Object, Protocol, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-zA-Z0-9 _\u{e9}\u{4e2d}]{0,40}".prop_map(Value::Str),
        proptest::collection::vec(any::<u8>(), 0..300).prop_map(Value::Bytes),
        proptest::collection::vec(any::<u8>(), 0..40).prop_map(Value::LegacyString),
        ("[a-z][a-z0-9_.]{0,12}", "[A-Z][A-Za-z0-9_]{0,12}")
            .prop_map(|(m, n)| Value::Global(Global::new(m, n))),
    ]
}

fn nested() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 32, 6, |inner| {
        proptest::collection::vec(inner, 0..6).prop_map(Value::Tuple)
    })
}

proptest! {
    #[test]
    fn inline_values_survive_protocol_3(value in nested()) {
        let heap = Heap::new();
        let bytes = dump_all(std::slice::from_ref(&value), &heap, Protocol::V3).unwrap();
        let (values, _) = load_all(&bytes).unwrap();
        prop_assert_eq!(values, vec![value]);
    }

    #[test]
    fn rewriting_is_stable(items in proptest::collection::vec((scalar(), scalar()), 0..1200)) {
        let mut heap = Heap::new();
        let dict = Value::Ref(heap.alloc(Object::Dict(items)));
        let first = dump_all(&[dict], &heap, Protocol::V3).unwrap();

        let (values, heap) = load_all(&first).unwrap();
        let second = dump_all(&values, &heap, Protocol::V3).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn protocol_4_reads_back(value in nested()) {
        let heap = Heap::new();
        let bytes = dump_all(std::slice::from_ref(&value), &heap, Protocol::V4).unwrap();
        let (values, _) = load_all(&bytes).unwrap();
        prop_assert_eq!(values, vec![value]);
    }
}

#[test]
fn sets_before_protocol_4_are_reduced() {
    let mut heap = Heap::new();
    let set = heap.alloc(Object::Set(vec![Value::Int(1), Value::Int(2)]));
    let bytes = dump_all(&[Value::Ref(set)], &heap, Protocol::V3).unwrap();
    assert_eq!(
        bytes,
        b"\x80\x03cbuiltins\nset\nq\x00]q\x01(K\x01K\x02e\x85q\x02Rq\x03.".to_vec()
    );

    let bytes = dump_all(&[Value::Ref(set)], &heap, Protocol::V4).unwrap();
    let (values, heap) = load_all(&bytes).unwrap();
    assert_eq!(
        heap.get(values[0].as_ref_id().unwrap()),
        Some(&Object::Set(vec![Value::Int(1), Value::Int(2)]))
    );
}
