use pretty_assertions::assert_eq;
use std::cmp::Ordering;
use std::mem;
use std::rc::Rc;

use crate::node::SharedNode;
use crate::store::NodeStore;
use crate::value::{deep_equals, ArrayKey, Value};
use crate::BackendConfig;

fn vector123() -> Value {
  let v = Value::new_array();
  {
    let a = v.array();
    let mut a = a.borrow_mut();
    a.push(Value::Int(1));
    a.push(Value::Int(2));
    a.push(Value::Int(3));
  }
  v
}

fn keyed_ab() -> Value {
  let v = Value::new_array();
  {
    let a = v.array();
    let mut a = a.borrow_mut();
    a.insert(ArrayKey::Str("a".into()), Value::Int(1));
    a.insert(ArrayKey::Str("b".into()), Value::Int(2));
  }
  v
}

#[test]
fn vector_shape_gets_positional_keys() {
  let mut store = NodeStore::new();
  let v = vector123();
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.arr_size(node), 3);
  assert_eq!(store.index_of_int(node, 1), 1);
  assert_eq!(store.index_of_int(node, 3), -1);
  assert_eq!(store.index_of_int(node, -1), -1);
  assert_eq!(store.index_of_str(node, "1"), -1);
  assert!(matches!(store.key_at(node, 2), Value::Int(2)));
  let third = store.to_local(store.value_at(node, 2)).unwrap();
  assert_eq!(third.int(), 3);
  assert!(!store.should_cache(node));
}

#[test]
fn keyed_array_lookup_and_enumeration() {
  let mut store = NodeStore::new();
  let v = keyed_ab();
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.arr_size(node), 2);
  assert_eq!(store.index_of_str(node, "a"), 0);
  assert_eq!(store.index_of_str(node, "b"), 1);
  assert_eq!(store.index_of_str(node, "c"), -1);
  assert_eq!(store.index_of_int(node, 0), -1);
  assert_eq!(store.key_at(node, 0).string(), "a");
  assert_eq!(store.key_at(node, 1).string(), "b");
  let back = store.materialize_all(node).unwrap();
  assert!(deep_equals(&v, &back));
}

#[test]
fn non_key_types_always_miss() {
  let mut store = NodeStore::new();
  let node = store.from_local(&keyed_ab(), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.index_of(node, &Value::Double(0.0)), -1);
  assert_eq!(store.index_of(node, &Value::Bool(true)), -1);
  assert_eq!(store.index_of(node, &Value::Null), -1);
}

#[test]
fn backends_are_observably_equivalent() {
  let v = keyed_ab();
  let mut ordered = NodeStore::new();
  let mut dual = NodeStore::new();
  let a = ordered.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  let b = dual.from_local(&v, false, false, BackendConfig::LegacyDualIndex).unwrap();
  assert_eq!(ordered.arr_size(a), dual.arr_size(b));
  for key in ["a", "b", "missing"] {
    assert_eq!(ordered.index_of_str(a, key), dual.index_of_str(b, key));
  }
  for pos in 0..ordered.arr_size(a) {
    assert_eq!(ordered.key_at(a, pos).string(), dual.key_at(b, pos).string());
  }
  let (va, vb) = (ordered.materialize_all(a).unwrap(), dual.materialize_all(b).unwrap());
  assert!(deep_equals(&va, &vb));
}

#[test]
fn retain_release_counts() {
  let mut store = NodeStore::new();
  let node = store.from_local(&Value::Int(7), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.ref_count(node), 1);
  store.retain(node);
  assert_eq!(store.ref_count(node), 2);
  store.release(node);
  assert!(store.contains(node));
  store.release(node);
  assert!(!store.contains(node));
  assert!(store.is_empty());
}

#[test]
fn release_frees_children_recursively() {
  let mut store = NodeStore::new();
  let outer = Value::new_array();
  outer.array().borrow_mut().push(vector123());
  outer.array().borrow_mut().push(keyed_ab());
  let node = store.from_local(&outer, false, false, BackendConfig::Ordered).unwrap();
  assert!(store.len() > 1);
  store.release(node);
  assert!(store.is_empty());
}

#[test]
fn released_slots_are_reused() {
  let mut store = NodeStore::new();
  let first = store.from_local(&Value::Int(1), false, false, BackendConfig::Ordered).unwrap();
  store.release(first);
  let second = store.from_local(&Value::Int(2), false, false, BackendConfig::Ordered).unwrap();
  // Same slot, new generation: the recycled index never revives the old
  // handle.
  assert_eq!(first.index, second.index);
  assert_ne!(first, second);
  assert_eq!(store.len(), 1);
  assert_eq!(store.to_local(second).unwrap().int(), 2);
}

#[test]
fn recycled_slot_is_not_mistaken_for_the_old_association() {
  let mut store = NodeStore::new();
  let node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  let local = store.to_local(node).unwrap();
  store.release(node);
  // Refill the freed slots with unrelated nodes.
  let mut fresh = Vec::new();
  for i in 0..8 {
    fresh.push(store.from_local(&Value::Int(100 + i), false, false, BackendConfig::Ordered).unwrap());
  }
  // The local copy still carries its association, but re-conversion must
  // rebuild rather than hand back whatever now occupies the slot.
  let again = store.from_local(&local, false, false, BackendConfig::Ordered).unwrap();
  assert!(!fresh.contains(&again));
  assert_ne!(node, again);
  assert!(deep_equals(&local, &store.to_local(again).unwrap()));
}

#[test]
fn nested_mutation_defeats_the_parent_pass_through() {
  let mut store = NodeStore::new();
  let outer = Value::new_array();
  outer.array().borrow_mut().push(vector123());
  let node = store.from_local(&outer, false, false, BackendConfig::Ordered).unwrap();
  let local = store.to_local(node).unwrap();
  {
    let cell = local.array();
    let inner = cell.borrow().get(&ArrayKey::Int(0)).unwrap().array();
    inner.borrow_mut().push(Value::Int(4));
  }
  // Only the nested array was touched; the parent must still notice.
  let again = store.from_local(&local, false, false, BackendConfig::Ordered).unwrap();
  assert_ne!(node, again);
  assert!(deep_equals(&local, &store.to_local(again).unwrap()));
  assert_eq!(store.arr_size(store.value_at(again, 0)), 4);
}

#[test]
#[should_panic(expected = "invalid node reference")]
fn stale_reference_panics() {
  let mut store = NodeStore::new();
  let node = store.from_local(&Value::Null, false, false, BackendConfig::Ordered).unwrap();
  store.release(node);
  store.ref_count(node);
}

#[test]
#[should_panic(expected = "out of range")]
fn position_out_of_range_panics() {
  let mut store = NodeStore::new();
  let node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  store.value_at(node, 99);
}

#[test]
fn materialized_array_passes_through_on_reconversion() {
  let mut store = NodeStore::new();
  let node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  let local = store.to_local(node).unwrap();
  let again = store.from_local(&local, false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(node, again);
  assert_eq!(store.ref_count(node), 2);
}

#[test]
fn mutation_defeats_the_pass_through() {
  let mut store = NodeStore::new();
  let node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  let local = store.to_local(node).unwrap();
  local.array().borrow_mut().push(Value::Int(4));
  let again = store.from_local(&local, false, false, BackendConfig::Ordered).unwrap();
  assert_ne!(node, again);
  assert_eq!(store.arr_size(again), 4);
}

#[test]
fn self_referential_array_takes_serialized_fallback() {
  let mut store = NodeStore::new();
  let v = Value::new_array();
  v.array().borrow_mut().push(v.clone());
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  assert!(store.should_cache(node));
  let back = store.to_local(node).unwrap();
  let cell = back.array();
  let inner = cell.borrow().get(&ArrayKey::Int(0)).unwrap().array();
  assert!(Rc::ptr_eq(&cell, &inner), "cycle was not reconstructed");
}

#[test]
fn object_without_snapshot_is_serialized() {
  let mut store = NodeStore::new();
  let v = Value::new_object("Point");
  v.object().borrow_mut().set("x", Value::Int(3));
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  assert!(store.should_cache(node));
  let back = store.to_local(node).unwrap();
  assert!(deep_equals(&v, &back));
}

#[test]
fn acyclic_object_snapshots_structurally() {
  let mut store = NodeStore::new();
  let v = Value::new_object("Point");
  {
    let o = v.object();
    let mut o = o.borrow_mut();
    o.set("x", Value::Int(3));
    o.set("y", Value::str("four"));
  }
  let node = store.from_local(&v, false, true, BackendConfig::Ordered).unwrap();
  assert!(!store.should_cache(node));
  let back = store.to_local(node).unwrap();
  assert!(deep_equals(&v, &back));
}

#[test]
fn should_cache_propagates_to_enclosing_array() {
  let mut store = NodeStore::new();
  let obj = Value::new_object("Leaf");
  let v = Value::new_array();
  v.array().borrow_mut().push(obj);
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  assert!(store.should_cache(node));
}

#[test]
fn convert_object_is_one_shot() {
  let mut store = NodeStore::new();
  let v = Value::new_object("Point");
  v.object().borrow_mut().set("x", Value::Int(3));
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  let converted = store.convert_object(node, &v, BackendConfig::Ordered);
  assert!(converted.is_some());
  assert!(!store.should_cache(converted.unwrap()));
  assert!(store.convert_object(node, &v, BackendConfig::Ordered).is_none());
}

#[test]
fn convert_object_rejects_aliasing_and_non_objects() {
  let mut store = NodeStore::new();
  let cyclic = Value::new_object("Node");
  cyclic.object().borrow_mut().set("next", cyclic.clone());
  let node = store.from_local(&cyclic, false, false, BackendConfig::Ordered).unwrap();
  assert!(store.convert_object(node, &cyclic, BackendConfig::Ordered).is_none());

  let arr_node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  assert!(store.convert_object(arr_node, &vector123(), BackendConfig::Ordered).is_none());
}

#[test]
fn already_serialized_input_is_normalized() {
  let mut store = NodeStore::new();
  let blob = Value::str("[1,2,3]");
  let node = store.from_local(&blob, false, false, BackendConfig::Ordered).unwrap();
  // Not serialized: stays a plain string.
  assert_eq!(store.string_data(node), "[1,2,3]");
  let node = store.from_local(&blob, true, false, BackendConfig::Ordered).unwrap();
  // Primed blobs land under the object fallback even for array content;
  // only the dump label records the difference.
  assert!(store.dump(node).starts_with("ref(1) object (serialized):"));
  let back = store.to_local(node).unwrap();
  assert!(back.is_array());
  assert_eq!(back.array().borrow().len(), 3);
}

#[test]
fn compare_orders_by_kind_then_payload() {
  let mut store = NodeStore::new();
  let mut mk = |v: Value| store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  let ladder = [
    mk(Value::Null),
    mk(Value::Bool(false)),
    mk(Value::Int(0)),
    mk(Value::Double(0.0)),
    mk(Value::str("")),
    mk(Value::new_array()),
  ];
  for pair in ladder.windows(2) {
    assert_eq!(store.compare(pair[0], pair[1]), Ordering::Less);
    assert_eq!(store.compare(pair[1], pair[0]), Ordering::Greater);
  }
}

#[test]
fn compare_is_consistent_for_equal_structures() {
  let mut store = NodeStore::new();
  let a = store.from_local(&keyed_ab(), false, false, BackendConfig::Ordered).unwrap();
  let b = store.from_local(&keyed_ab(), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.compare(a, b), Ordering::Equal);
  let c = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.compare(a, c), store.compare(c, a).reverse());
}

#[test]
fn static_and_owned_strings_share_the_string_rank() {
  let mut store = NodeStore::new();
  let a = store.from_local(&Value::StaticStr("same"), false, false, BackendConfig::Ordered).unwrap();
  let b = store.from_local(&Value::str("same"), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.compare(a, b), Ordering::Equal);
}

#[test]
fn string_accessors() {
  let mut store = NodeStore::new();
  let node = store.from_local(&Value::str("hello"), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.string_length(node), 5);
  assert_eq!(store.string_data(node), "hello");
}

#[test]
fn bool_node_space_usage_is_exactly_the_header() {
  let mut store = NodeStore::new();
  let node = store.from_local(&Value::Bool(true), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.space_usage(node), mem::size_of::<SharedNode>());
}

#[test]
fn string_space_usage_adds_the_payload() {
  let mut store = NodeStore::new();
  let node = store.from_local(&Value::str("hello"), false, false, BackendConfig::Ordered).unwrap();
  assert_eq!(store.space_usage(node), mem::size_of::<SharedNode>() + 5);
}

#[test]
fn stats_aggregate_over_children() {
  let mut store = NodeStore::new();
  let v = Value::new_array();
  {
    let a = v.array();
    let mut a = a.borrow_mut();
    a.push(Value::str("ab"));
    a.push(Value::str("cde"));
  }
  let node = store.from_local(&v, false, false, BackendConfig::Ordered).unwrap();
  let stats = store.get_stats(node);
  assert_eq!(stats.node_count, 3);
  assert_eq!(stats.data_size, 5);
  assert!(stats.data_total_size > stats.data_size);
}

#[test]
fn dual_index_stats_stay_shallow() {
  let mut store = NodeStore::new();
  let node = store.from_local(&keyed_ab(), false, false, BackendConfig::LegacyDualIndex).unwrap();
  let stats = store.get_stats(node);
  assert_eq!(stats.node_count, 1);
  assert_eq!(stats.data_size, 0);
}

#[test]
fn dump_is_readable_and_non_destructive() {
  let mut store = NodeStore::new();
  let node = store.from_local(&vector123(), false, false, BackendConfig::Ordered).unwrap();
  let text = store.dump(node);
  assert!(text.starts_with("ref(1) array(3):"));
  assert!(text.contains("[0] => ref(1) int: 1"));
  assert_eq!(store.arr_size(node), 3);
}
