use pretty_assertions::assert_eq;
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use crate::shm::Segment;
use crate::value::{deep_equals, ArrayKey, Value};

fn segment() -> Segment {
  Segment::with_capacity(256, 4096, 256)
}

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

#[test]
fn scalars_round_trip_through_the_segment() {
  let seg = segment();
  for v in [Value::Null, Value::Bool(true), Value::Int(-9), Value::Double(2.5)] {
    let node = seg.from_local(&v, false, false).unwrap();
    assert!(deep_equals(&v, &seg.to_local(node).unwrap()));
    assert!(!seg.should_cache(node));
  }
}

#[test]
fn strings_are_copied_into_the_segment() {
  let seg = segment();
  let node = seg.from_local(&Value::StaticStr("hello"), false, false).unwrap();
  assert_eq!(seg.string_length(node), 5);
  assert_eq!(seg.string_data(node), "hello");
  // The local copy owns its bytes; nothing points back at the segment.
  assert!(matches!(seg.to_local(node).unwrap(), Value::Str(_)));
}

#[test]
fn vector_placement_and_access() {
  let seg = segment();
  let node = seg.from_local(&vector123(), false, false).unwrap();
  assert_eq!(seg.arr_size(node), 3);
  assert_eq!(seg.index_of_int(node, 0), 0);
  assert_eq!(seg.index_of_int(node, 3), -1);
  assert_eq!(seg.index_of_str(node, "0"), -1);
  assert!(matches!(seg.key_at(node, 1), Value::Int(1)));
  assert_eq!(seg.to_local(seg.value_at(node, 2)).unwrap().int(), 3);
}

#[test]
fn map_placement_keeps_insertion_order_and_finds_keys() {
  let v = Value::new_array();
  {
    let a = v.array();
    let mut a = a.borrow_mut();
    a.insert(ArrayKey::Str("b".into()), Value::Int(1));
    a.insert(ArrayKey::Int(5), Value::Int(2));
    a.insert(ArrayKey::Str("a".into()), Value::Int(3));
  }
  let seg = segment();
  let node = seg.from_local(&v, false, false).unwrap();
  assert_eq!(seg.arr_size(node), 3);
  assert_eq!(seg.index_of_str(node, "b"), 0);
  assert_eq!(seg.index_of_int(node, 5), 1);
  assert_eq!(seg.index_of_str(node, "a"), 2);
  assert_eq!(seg.index_of_str(node, "c"), -1);
  assert_eq!(seg.index_of_int(node, 0), -1);
  assert_eq!(seg.key_at(node, 0).string(), "b");
  assert_eq!(seg.key_at(node, 1).int(), 5);
  assert_eq!(seg.key_at(node, 2).string(), "a");
  assert!(deep_equals(&v, &seg.materialize_all(node).unwrap()));
}

#[test]
fn non_key_types_always_miss() {
  let seg = segment();
  let node = seg.from_local(&vector123(), false, false).unwrap();
  assert_eq!(seg.index_of(node, &Value::Double(0.0)), -1);
  assert_eq!(seg.index_of(node, &Value::Null), -1);
}

#[test]
fn retain_release_counts() {
  let seg = segment();
  let node = seg.from_local(&Value::Int(7), false, false).unwrap();
  assert_eq!(seg.ref_count(node), 1);
  seg.retain(node);
  assert_eq!(seg.ref_count(node), 2);
  seg.release(node);
  assert!(seg.contains(node));
  seg.release(node);
  assert!(!seg.contains(node));
  assert!(seg.is_empty());
}

#[test]
fn release_frees_children_recursively() {
  let seg = segment();
  let outer = Value::new_array();
  outer.array().borrow_mut().push(vector123());
  let node = seg.from_local(&outer, false, false).unwrap();
  assert!(seg.len() > 1);
  seg.release(node);
  assert!(seg.is_empty());
}

#[test]
#[should_panic(expected = "invalid node offset")]
fn stale_offset_panics() {
  let seg = segment();
  let node = seg.from_local(&Value::Null, false, false).unwrap();
  seg.release(node);
  seg.should_cache(node);
}

#[test]
#[should_panic(expected = "out of range")]
fn position_out_of_range_panics() {
  let seg = segment();
  let node = seg.from_local(&vector123(), false, false).unwrap();
  seg.value_at(node, 99);
}

#[test]
#[should_panic(expected = "byte region exhausted")]
fn byte_capacity_is_enforced() {
  let seg = Segment::with_capacity(16, 8, 16);
  let _ = seg.from_local(&Value::str("far too long for this segment"), false, false);
}

#[test]
fn self_referential_array_takes_serialized_fallback() {
  let seg = segment();
  let v = Value::new_array();
  v.array().borrow_mut().push(v.clone());
  let node = seg.from_local(&v, false, false).unwrap();
  assert!(seg.should_cache(node));
  let back = seg.to_local(node).unwrap();
  let cell = back.array();
  let inner = cell.borrow().get(&ArrayKey::Int(0)).unwrap().array();
  assert!(Rc::ptr_eq(&cell, &inner), "cycle was not reconstructed");
}

#[test]
fn object_snapshot_round_trips() {
  let v = Value::new_object("Point");
  {
    let o = v.object();
    let mut o = o.borrow_mut();
    o.set("x", Value::Int(3));
    o.set("y", Value::str("four"));
  }
  let seg = segment();
  let node = seg.from_local(&v, false, true).unwrap();
  assert!(!seg.should_cache(node));
  assert!(deep_equals(&v, &seg.to_local(node).unwrap()));
}

#[test]
fn object_without_snapshot_is_serialized() {
  let v = Value::new_object("Point");
  v.object().borrow_mut().set("x", Value::Int(3));
  let seg = segment();
  let node = seg.from_local(&v, false, false).unwrap();
  assert!(seg.should_cache(node));
  assert!(deep_equals(&v, &seg.to_local(node).unwrap()));
}

#[test]
fn compare_orders_by_kind_then_payload() {
  let seg = segment();
  let ladder = [
    seg.from_local(&Value::Null, false, false).unwrap(),
    seg.from_local(&Value::Bool(false), false, false).unwrap(),
    seg.from_local(&Value::Int(0), false, false).unwrap(),
    seg.from_local(&Value::Double(0.0), false, false).unwrap(),
    seg.from_local(&Value::str(""), false, false).unwrap(),
    seg.from_local(&Value::new_array(), false, false).unwrap(),
  ];
  for pair in ladder.windows(2) {
    assert_eq!(seg.compare(pair[0], pair[1]), Ordering::Less);
    assert_eq!(seg.compare(pair[1], pair[0]), Ordering::Greater);
  }
  let a = seg.from_local(&vector123(), false, false).unwrap();
  let b = seg.from_local(&vector123(), false, false).unwrap();
  assert_eq!(seg.compare(a, b), Ordering::Equal);
}

#[test]
fn space_usage_and_stats_track_payloads() {
  let seg = segment();
  let null_node = seg.from_local(&Value::Null, false, false).unwrap();
  let bool_node = seg.from_local(&Value::Bool(true), false, false).unwrap();
  assert_eq!(seg.space_usage(null_node), seg.space_usage(bool_node));
  let str_node = seg.from_local(&Value::str("hello"), false, false).unwrap();
  assert_eq!(seg.space_usage(str_node), seg.space_usage(bool_node) + 5);
  let stats = seg.get_stats(str_node);
  assert_eq!(stats.node_count, 1);
  assert_eq!(stats.data_size, 5);
}

#[test]
fn dump_is_readable() {
  let seg = segment();
  let node = seg.from_local(&vector123(), false, false).unwrap();
  let text = seg.dump(node);
  assert!(text.starts_with("ref(1) array(3):"));
  assert!(text.contains("[2] => ref(1) int: 3"));
}

#[test]
fn readers_interleave_with_refcount_updates() {
  // Unlocked reads of held nodes must stay consistent while other threads
  // hammer the count of an unrelated node.
  let seg = Arc::new(segment());
  let data = seg.from_local(&vector123(), false, false).unwrap();
  let counter = seg.from_local(&Value::Int(0), false, false).unwrap();
  let mut handles = Vec::new();
  for _ in 0..4 {
    let seg = Arc::clone(&seg);
    handles.push(thread::spawn(move || {
      for _ in 0..500 {
        let back = seg.to_local(data).unwrap();
        assert_eq!(back.array().borrow().len(), 3);
      }
    }));
  }
  for _ in 0..4 {
    let seg = Arc::clone(&seg);
    handles.push(thread::spawn(move || {
      for _ in 0..500 {
        seg.retain(counter);
        seg.release(counter);
      }
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
  assert_eq!(seg.ref_count(counter), 1);
  assert_eq!(seg.arr_size(data), 3);
}

#[test]
fn refcounts_survive_contending_threads() {
  let seg = Arc::new(segment());
  let node = seg.from_local(&Value::Int(1), false, false).unwrap();
  let mut handles = Vec::new();
  for _ in 0..8 {
    let seg = Arc::clone(&seg);
    handles.push(thread::spawn(move || {
      for _ in 0..1000 {
        seg.retain(node);
        seg.release(node);
      }
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
  assert_eq!(seg.ref_count(node), 1);
}
