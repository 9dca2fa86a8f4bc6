//! The local, mutable, dynamically-typed value that shared nodes are built
//! from and materialize back into.
//!
//! Arrays and objects are handles to shared cells (`Rc<RefCell<..>>`), so a
//! value graph can alias itself: `a[0] = a` is expressible, and
//! [`has_internal_reference`] detects it before a structural conversion is
//! attempted. Strings are `Arc<str>` so a value materialized from a shared
//! node defers its copy to the node's own buffer.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::store::NodeRef;

/// A local dynamically-typed value.
///
/// `Array` and `Object` are *instances*: `clone()` returns a handle to the
/// same underlying cell, not a copy.
#[derive(Debug, Clone)]
pub enum Value {
  /// Contains no value.
  Null,
  /// Contains a bool value.
  Bool(bool),
  /// Contains an i64 value. Narrower integer widths are normalized to this
  /// kind before conversion to a shared node.
  Int(i64),
  /// Contains an f64 value.
  Double(f64),
  /// A process-lifetime string literal. Never copied when bridged.
  StaticStr(&'static str),
  /// An owned, immutable string buffer.
  Str(Arc<str>),
  /// An ordered array of `(key, value)` entries.
  Array(Rc<RefCell<Array>>),
  /// An object instance: class name plus ordered fields.
  Object(Rc<RefCell<Object>>),
}

/// A legal array key: an integer or a string. Any other dynamic type is not
/// a key and always misses on lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayKey {
  Int(i64),
  Str(Arc<str>),
}

impl ArrayKey {
  /// The key as a plain local value.
  pub fn to_value(&self) -> Value {
    match self {
      ArrayKey::Int(i) => Value::Int(*i),
      ArrayKey::Str(s) => Value::Str(s.clone()),
    }
  }
}

/// An ordered sequence of `(key, value)` entries. Enumeration order is
/// insertion order; keys are unique.
#[derive(Debug, Default)]
pub struct Array {
  entries: Vec<(ArrayKey, Value)>,
  next_index: i64,
  shared: Option<NodeRef>,
}

impl Array {
  pub fn new() -> Array {
    Array { entries: Vec::new(), next_index: 0, shared: None }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> &[(ArrayKey, Value)] {
    &self.entries
  }

  /// Appends `value` under the next free integer key.
  pub fn push(&mut self, value: Value) {
    let key = ArrayKey::Int(self.next_index);
    self.next_index += 1;
    self.shared = None;
    self.entries.push((key, value));
  }

  /// Sets `key` to `value`, replacing in place if the key already exists,
  /// appending otherwise.
  pub fn insert(&mut self, key: ArrayKey, value: Value) {
    self.shared = None;
    if let ArrayKey::Int(i) = key {
      if i >= self.next_index {
        self.next_index = i + 1;
      }
    }
    if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
      slot.1 = value;
    } else {
      self.entries.push((key, value));
    }
  }

  pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  /// True when the keys are exactly `0..len-1` in order, so positions can
  /// serve as implicit keys.
  pub fn is_vector_shape(&self) -> bool {
    self
      .entries
      .iter()
      .enumerate()
      .all(|(i, (k, _))| matches!(k, ArrayKey::Int(n) if *n == i as i64))
  }

  /// The heap-resident node this array was materialized from, if any and if
  /// it has not been mutated since. Construction uses this to retain the
  /// existing node instead of rebuilding it.
  pub fn shared_node(&self) -> Option<NodeRef> {
    self.shared
  }

  pub(crate) fn attach_shared(&mut self, node: NodeRef) {
    self.shared = Some(node);
  }
}

/// An object instance: a class name and an ordered field table.
#[derive(Debug, Default)]
pub struct Object {
  class: Arc<str>,
  fields: IndexMap<Arc<str>, Value>,
}

impl Object {
  pub fn new(class: &str) -> Object {
    Object { class: Arc::from(class), fields: IndexMap::new() }
  }

  pub fn class(&self) -> &Arc<str> {
    &self.class
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fields.is_empty()
  }

  pub fn set(&mut self, name: &str, value: Value) {
    self.fields.insert(Arc::from(name), value);
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }

  pub fn fields(&self) -> impl Iterator<Item = (&Arc<str>, &Value)> {
    self.fields.iter()
  }
}

impl Value {
  /// Returns a new empty array value.
  pub fn new_array() -> Value {
    Value::Array(Rc::new(RefCell::new(Array::new())))
  }

  /// Returns a new object value with the given class name.
  pub fn new_object(class: &str) -> Value {
    Value::Object(Rc::new(RefCell::new(Object::new(class))))
  }

  pub fn str(s: &str) -> Value {
    Value::Str(Arc::from(s))
  }

  pub fn is_array(&self) -> bool {
    matches!(self, Value::Array(_))
  }

  pub fn is_object(&self) -> bool {
    matches!(self, Value::Object(_))
  }

  /// Returns the underlying array cell, or panics if not an array.
  pub fn array(&self) -> Rc<RefCell<Array>> {
    if let Value::Array(a) = self {
      a.clone()
    } else {
      panic!("Not an array: {}", self.kind_name());
    }
  }

  /// Returns the underlying object cell, or panics if not an object.
  pub fn object(&self) -> Rc<RefCell<Object>> {
    if let Value::Object(o) = self {
      o.clone()
    } else {
      panic!("Not an object: {}", self.kind_name());
    }
  }

  /// Returns the underlying i64, or panics if not an int.
  pub fn int(&self) -> i64 {
    if let Value::Int(i) = self {
      *i
    } else {
      panic!("Not an int: {}", self.kind_name());
    }
  }

  /// Returns the underlying string slice, or panics if not a string.
  pub fn string(&self) -> &str {
    match self {
      Value::StaticStr(s) => s,
      Value::Str(s) => s,
      other => panic!("Not a string: {}", other.kind_name()),
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Int(_) => "int",
      Value::Double(_) => "double",
      Value::StaticStr(_) => "static string",
      Value::Str(_) => "string",
      Value::Array(_) => "array",
      Value::Object(_) => "object",
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Value {
    Value::Bool(b)
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Value {
    Value::Int(i)
  }
}

impl From<f64> for Value {
  fn from(f: f64) -> Value {
    Value::Double(f)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Value {
    Value::str(s)
  }
}

/// Scans `v` for internal aliasing: any array or object cell reachable
/// through more than one path (which includes cycles). When
/// `check_objects` is false, objects are treated as leaves — they take the
/// serialized fallback anyway, so only array sharing matters to the caller.
pub fn has_internal_reference(v: &Value, check_objects: bool) -> bool {
  let mut seen = HashSet::new();
  scan(v, check_objects, &mut seen)
}

fn scan(v: &Value, check_objects: bool, seen: &mut HashSet<usize>) -> bool {
  match v {
    Value::Array(a) => {
      if !seen.insert(Rc::as_ptr(a) as usize) {
        return true;
      }
      a.borrow().entries.iter().any(|(_, child)| scan(child, check_objects, seen))
    }
    Value::Object(o) => {
      if !check_objects {
        return false;
      }
      if !seen.insert(Rc::as_ptr(o) as usize) {
        return true;
      }
      o.borrow().fields.values().any(|child| scan(child, check_objects, seen))
    }
    _ => false,
  }
}

/// Structural equality over value graphs. `StaticStr` and `Str` with equal
/// content compare equal. Cycle-safe: a pair of cells already under
/// comparison is assumed equal, so two cyclic graphs of the same shape
/// compare equal instead of recursing forever.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
  let mut in_progress = HashSet::new();
  eq(a, b, &mut in_progress)
}

fn eq(a: &Value, b: &Value, in_progress: &mut HashSet<(usize, usize)>) -> bool {
  match (a, b) {
    (Value::Null, Value::Null) => true,
    (Value::Bool(x), Value::Bool(y)) => x == y,
    (Value::Int(x), Value::Int(y)) => x == y,
    (Value::Double(x), Value::Double(y)) => x == y,
    (Value::Str(_) | Value::StaticStr(_), Value::Str(_) | Value::StaticStr(_)) => {
      a.string() == b.string()
    }
    (Value::Array(x), Value::Array(y)) => {
      let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
      if !in_progress.insert(pair) {
        return true;
      }
      let (x, y) = (x.borrow(), y.borrow());
      let same = x.len() == y.len()
        && x
          .entries
          .iter()
          .zip(y.entries.iter())
          .all(|((ka, va), (kb, vb))| ka == kb && eq(va, vb, in_progress));
      in_progress.remove(&pair);
      same
    }
    (Value::Object(x), Value::Object(y)) => {
      let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
      if !in_progress.insert(pair) {
        return true;
      }
      let (x, y) = (x.borrow(), y.borrow());
      let same = x.class == y.class
        && x.len() == y.len()
        && x
          .fields
          .iter()
          .zip(y.fields.iter())
          .all(|((na, va), (nb, vb))| na == nb && eq(va, vb, in_progress));
      in_progress.remove(&pair);
      same
    }
    _ => false,
  }
}
