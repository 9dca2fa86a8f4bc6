//! The three interchangeable storages behind an array node.
//!
//! A backend is chosen once, at construction, from the shape of the source
//! array and the caller's [`BackendConfig`](crate::BackendConfig); it is
//! never migrated. All three enumerate in insertion order; they differ only
//! in how lookup by key is answered.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use indexmap::{Equivalent, IndexMap};

use crate::store::NodeRef;

/// Key-not-found (or wrong-key-type) sentinel for `index_of`.
pub const NOT_FOUND: i64 = -1;

/// Array storage. Key and value entries are nodes exclusively owned by the
/// backend; `Vector` stores no keys because the position is the key.
pub enum ArrayBackend {
  /// Keys are exactly `0..len-1` in order; only values are stored.
  Vector(Vec<NodeRef>),
  /// One insertion-ordered map with hashed lookup.
  Ordered(OrderedMap),
  /// Two parallel lookup tables over parallel key/value sequences.
  DualIndex(DualIndexMap),
}

/// The scalar form of a stored key, used for hashing and lookup. The owned
/// key node carries the same content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
  Int(i64),
  Str(Box<str>),
}

// Manual Hash so the borrowed query types below hash identically.
impl Hash for MapKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    match self {
      MapKey::Int(i) => {
        0u8.hash(state);
        i.hash(state);
      }
      MapKey::Str(s) => {
        1u8.hash(state);
        (**s).hash(state);
      }
    }
  }
}

struct IntQuery(i64);

impl Hash for IntQuery {
  fn hash<H: Hasher>(&self, state: &mut H) {
    0u8.hash(state);
    self.0.hash(state);
  }
}

impl Equivalent<MapKey> for IntQuery {
  fn equivalent(&self, key: &MapKey) -> bool {
    matches!(key, MapKey::Int(i) if *i == self.0)
  }
}

struct StrQuery<'a>(&'a str);

impl Hash for StrQuery<'_> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    1u8.hash(state);
    self.0.hash(state);
  }
}

impl Equivalent<MapKey> for StrQuery<'_> {
  fn equivalent(&self, key: &MapKey) -> bool {
    matches!(key, MapKey::Str(s) if &**s == self.0)
  }
}

pub(crate) struct MapEntry {
  pub key: NodeRef,
  pub val: NodeRef,
}

/// Insertion-ordered storage with a single hashed index.
#[derive(Default)]
pub struct OrderedMap {
  map: IndexMap<MapKey, MapEntry>,
}

impl OrderedMap {
  pub(crate) fn with_capacity(capacity: usize) -> OrderedMap {
    OrderedMap { map: IndexMap::with_capacity(capacity) }
  }

  pub(crate) fn add(&mut self, key: MapKey, key_node: NodeRef, val_node: NodeRef) {
    self.map.insert(key, MapEntry { key: key_node, val: val_node });
  }

  pub fn size(&self) -> usize {
    self.map.len()
  }

  pub(crate) fn entry_at(&self, pos: usize) -> &MapEntry {
    let (_, entry) = self.map.get_index(pos).unwrap_or_else(|| {
      panic!("position {} out of range for array of size {}", pos, self.map.len())
    });
    entry
  }

  fn index_of_int(&self, key: i64) -> i64 {
    self.map.get_index_of(&IntQuery(key)).map_or(NOT_FOUND, |i| i as i64)
  }

  fn index_of_str(&self, key: &str) -> i64 {
    self.map.get_index_of(&StrQuery(key)).map_or(NOT_FOUND, |i| i as i64)
  }

  /// Own footprint of the index structure, excluding child nodes.
  pub(crate) fn struct_size(&self) -> usize {
    std::mem::size_of::<OrderedMap>()
      + self.map.capacity() * std::mem::size_of::<(MapKey, MapEntry, usize)>()
  }
}

/// Legacy storage: string-key and integer-key hash tables mapping to
/// positions in parallel key/value sequences.
#[derive(Default)]
pub struct DualIndexMap {
  by_int: HashMap<i64, usize>,
  by_str: HashMap<Box<str>, usize>,
  keys: Vec<NodeRef>,
  vals: Vec<NodeRef>,
}

impl DualIndexMap {
  pub(crate) fn with_capacity(capacity: usize) -> DualIndexMap {
    DualIndexMap {
      by_int: HashMap::new(),
      by_str: HashMap::new(),
      keys: Vec::with_capacity(capacity),
      vals: Vec::with_capacity(capacity),
    }
  }

  pub(crate) fn add(&mut self, key: &MapKey, key_node: NodeRef, val_node: NodeRef) {
    let pos = self.keys.len();
    match key {
      MapKey::Int(i) => {
        self.by_int.insert(*i, pos);
      }
      MapKey::Str(s) => {
        self.by_str.insert(s.clone(), pos);
      }
    }
    self.keys.push(key_node);
    self.vals.push(val_node);
  }

  pub fn size(&self) -> usize {
    self.vals.len()
  }

  pub(crate) fn key_at(&self, pos: usize) -> NodeRef {
    self.check(pos);
    self.keys[pos]
  }

  pub(crate) fn val_at(&self, pos: usize) -> NodeRef {
    self.check(pos);
    self.vals[pos]
  }

  fn check(&self, pos: usize) {
    if pos >= self.vals.len() {
      panic!("position {} out of range for array of size {}", pos, self.vals.len());
    }
  }

  fn index_of_int(&self, key: i64) -> i64 {
    self.by_int.get(&key).map_or(NOT_FOUND, |i| *i as i64)
  }

  fn index_of_str(&self, key: &str) -> i64 {
    self.by_str.get(key).map_or(NOT_FOUND, |i| *i as i64)
  }
}

impl ArrayBackend {
  pub fn size(&self) -> usize {
    match self {
      ArrayBackend::Vector(vals) => vals.len(),
      ArrayBackend::Ordered(m) => m.size(),
      ArrayBackend::DualIndex(m) => m.size(),
    }
  }

  /// Position of an integer key, or [`NOT_FOUND`]. A vector treats the key
  /// as a bounds-checked position.
  pub fn index_of_int(&self, key: i64) -> i64 {
    match self {
      ArrayBackend::Vector(vals) => {
        if key < 0 || key as usize >= vals.len() {
          NOT_FOUND
        } else {
          key
        }
      }
      ArrayBackend::Ordered(m) => m.index_of_int(key),
      ArrayBackend::DualIndex(m) => m.index_of_int(key),
    }
  }

  /// Position of a string key, or [`NOT_FOUND`]. A vector has no string
  /// keys and always misses.
  pub fn index_of_str(&self, key: &str) -> i64 {
    match self {
      ArrayBackend::Vector(_) => NOT_FOUND,
      ArrayBackend::Ordered(m) => m.index_of_str(key),
      ArrayBackend::DualIndex(m) => m.index_of_str(key),
    }
  }

  /// The owned key node at `pos`, or `None` for a vector (the position is
  /// the key). `pos` must be `< size()`.
  pub(crate) fn key_node_at(&self, pos: usize) -> Option<NodeRef> {
    match self {
      ArrayBackend::Vector(vals) => {
        if pos >= vals.len() {
          panic!("position {} out of range for array of size {}", pos, vals.len());
        }
        None
      }
      ArrayBackend::Ordered(m) => Some(m.entry_at(pos).key),
      ArrayBackend::DualIndex(m) => Some(m.key_at(pos)),
    }
  }

  /// The owned value node at `pos`. `pos` must be `< size()`.
  pub(crate) fn value_node_at(&self, pos: usize) -> NodeRef {
    match self {
      ArrayBackend::Vector(vals) => *vals.get(pos).unwrap_or_else(|| {
        panic!("position {} out of range for array of size {}", pos, vals.len())
      }),
      ArrayBackend::Ordered(m) => m.entry_at(pos).val,
      ArrayBackend::DualIndex(m) => m.val_at(pos),
    }
  }

  pub(crate) fn owned_children(&self, out: &mut Vec<NodeRef>) {
    match self {
      ArrayBackend::Vector(vals) => out.extend_from_slice(vals),
      ArrayBackend::Ordered(m) => {
        for entry in m.map.values() {
          out.push(entry.key);
          out.push(entry.val);
        }
      }
      ArrayBackend::DualIndex(m) => {
        out.extend_from_slice(&m.keys);
        out.extend_from_slice(&m.vals);
      }
    }
  }
}
