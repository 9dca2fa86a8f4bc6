//! The heap-resident shared value node: construction from a local value,
//! the bridge back to a local value, positional array access, comparison,
//! diagnostics, and memory accounting.
//!
//! Nodes are immutable after construction except for the reference count
//! and the one-shot object-conversion marker. Everything here runs under
//! the owning cache's lock; see the [`store`](crate::store) contract.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use crate::backend::{ArrayBackend, DualIndexMap, MapKey, OrderedMap, NOT_FOUND};
use crate::codec::{self, CodecError};
use crate::store::{NodeRef, NodeStore};
use crate::value::{has_internal_reference, Array, ArrayKey, Object, Value};
use crate::BackendConfig;

/// One shared value node. The payload is selected by [`NodeKind`]; the two
/// mutable bits are the codec-revalidation flag computed at construction
/// and the one-shot object-conversion marker.
pub struct SharedNode {
  pub(crate) kind: NodeKind,
  pub(crate) should_cache: bool,
  pub(crate) obj_attempted: bool,
}

impl SharedNode {
  fn new(kind: NodeKind) -> SharedNode {
    SharedNode { kind, should_cache: false, obj_attempted: false }
  }
}

/// The tagged payload of a node, one case per kind. Serialized fallbacks
/// are distinct cases rather than flag bits on the structured ones.
pub enum NodeKind {
  Null,
  Bool(bool),
  Int(i64),
  Double(f64),
  /// Process-lifetime string; not owned, never copied.
  StaticStr(&'static str),
  /// Owned string buffer, shared with materialized locals copy-on-write.
  Str(Arc<str>),
  /// Structured array storage.
  Array(ArrayBackend),
  /// An array that aliased itself, stored as an opaque blob.
  SerializedArray(Arc<str>),
  /// Acyclic object captured as a structured snapshot.
  Object(ObjectSnapshot),
  /// Object stored as an opaque blob.
  SerializedObject(Arc<str>),
}

impl NodeKind {
  pub(crate) fn owned_children(&self, out: &mut Vec<NodeRef>) {
    match self {
      NodeKind::Array(backend) => backend.owned_children(out),
      NodeKind::Object(snap) => out.extend(snap.fields.iter().map(|(_, v)| *v)),
      _ => {}
    }
  }

  // Kind rank for the total order. Both string kinds share a rank, as do
  // the structured and serialized forms of arrays and objects.
  fn rank(&self) -> u8 {
    match self {
      NodeKind::Null => 0,
      NodeKind::Bool(_) => 1,
      NodeKind::Int(_) => 2,
      NodeKind::Double(_) => 3,
      NodeKind::StaticStr(_) | NodeKind::Str(_) => 4,
      NodeKind::Array(_) | NodeKind::SerializedArray(_) => 5,
      NodeKind::Object(_) | NodeKind::SerializedObject(_) => 6,
    }
  }

  fn name(&self) -> &'static str {
    match self {
      NodeKind::Null => "null",
      NodeKind::Bool(_) => "boolean",
      NodeKind::Int(_) => "int",
      NodeKind::Double(_) => "double",
      NodeKind::StaticStr(_) => "static string",
      NodeKind::Str(_) => "string",
      NodeKind::Array(_) | NodeKind::SerializedArray(_) => "array",
      NodeKind::Object(_) | NodeKind::SerializedObject(_) => "object",
    }
  }
}

/// A compact, acyclic snapshot of one object's shape: the class name and
/// the field sequence in declaration order. Accepted once, after the
/// aliasing scan passed; never re-scanned.
pub struct ObjectSnapshot {
  class: Arc<str>,
  fields: Vec<(Arc<str>, NodeRef)>,
}

/// Recursive size breakdown, separating a node's own payload bytes from
/// the subtree total. Use this instead of
/// [`space_usage`](NodeStore::space_usage) when a per-child breakdown
/// feeds an eviction heuristic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
  /// Nodes in the subtree, this one included.
  pub node_count: usize,
  /// Payload bytes owned directly (string/blob content, field names).
  pub data_size: usize,
  /// Total footprint of the subtree, headers included.
  pub data_total_size: usize,
}

impl NodeStats {
  pub fn add_child(&mut self, child: &NodeStats) {
    self.node_count += child.node_count;
    self.data_size += child.data_size;
    self.data_total_size += child.data_total_size;
  }
}

const NODE_HEADER: usize = mem::size_of::<SharedNode>();

impl NodeStore {
  /// Builds a shared node from a local value, deeply and recursively, with
  /// an initial reference count of 1.
  ///
  /// `serialized` marks a string input as an already-serialized blob; it is
  /// re-run through the codec because the class definitions needed to
  /// rebuild typed objects may not exist yet at priming time.
  /// `snapshot_objects` enables structured object snapshots; without it
  /// every object takes the serialized fallback. `config` picks the map
  /// family for non-vector arrays.
  ///
  /// If the source array is still associated with a node from an earlier
  /// materialization, and the association validates — the handle names a
  /// live slot of the same generation, and the local content still matches
  /// the node entry for entry, nested associations included — that node is
  /// retained and returned instead of rebuilding. A fast path, not a
  /// correctness requirement; `snapshot_objects` forces reconversion.
  pub fn from_local(
    &mut self,
    v: &Value,
    serialized: bool,
    snapshot_objects: bool,
    config: BackendConfig,
  ) -> Result<NodeRef, CodecError> {
    debug_assert!(!serialized || matches!(v, Value::Str(_) | Value::StaticStr(_)));
    self.create(v, serialized, false, snapshot_objects, false, config)
  }

  fn create(
    &mut self,
    v: &Value,
    serialized: bool,
    inner: bool,
    snapshot_objects: bool,
    in_snapshot: bool,
    config: BackendConfig,
  ) -> Result<NodeRef, CodecError> {
    if !snapshot_objects {
      if let Value::Array(a) = v {
        let existing = a.borrow().shared_node();
        if let Some(existing) = existing {
          if self.association_valid(a, existing) {
            self.retain(existing);
            return Ok(existing);
          }
        }
      }
    }
    let node = match v {
      Value::Null => SharedNode::new(NodeKind::Null),
      Value::Bool(b) => SharedNode::new(NodeKind::Bool(*b)),
      Value::Int(i) => SharedNode::new(NodeKind::Int(*i)),
      Value::Double(d) => SharedNode::new(NodeKind::Double(*d)),
      Value::StaticStr(s) if !serialized => SharedNode::new(NodeKind::StaticStr(*s)),
      Value::StaticStr(_) | Value::Str(_) => {
        if serialized {
          // A primed blob always lands under the object fallback, even
          // when it decodes to an array; only the dump label and the
          // comparator rank can tell the difference, and revalidating
          // readers deserialize both the same way.
          SharedNode::new(NodeKind::SerializedObject(codec::reserialize(v.string())?))
        } else if let Value::Str(s) = v {
          SharedNode::new(NodeKind::Str(s.clone()))
        } else {
          unreachable!()
        }
      }
      Value::Array(cell) => {
        // Only the toplevel conversion needs the aliasing scan; inner
        // containers were covered by it.
        if !inner && has_internal_reference(v, false) {
          tracing::debug!("array aliases itself, storing serialized fallback");
          let mut node = SharedNode::new(NodeKind::SerializedArray(codec::serialize(v)?));
          node.should_cache = true;
          node
        } else {
          let arr = cell.borrow();
          let mut should_cache = false;
          let kind = if arr.is_vector_shape() {
            let mut vals = Vec::with_capacity(arr.len());
            for (_, child) in arr.entries() {
              let val = self.create(child, false, true, snapshot_objects, in_snapshot, config)?;
              should_cache |= self.node(val).should_cache;
              vals.push(val);
            }
            NodeKind::Array(ArrayBackend::Vector(vals))
          } else if config == BackendConfig::LegacyDualIndex {
            let mut map = DualIndexMap::with_capacity(arr.len());
            for (key, child) in arr.entries() {
              let key_node = self.make_key_node(key);
              let val = self.create(child, false, true, snapshot_objects, in_snapshot, config)?;
              should_cache |= self.node(val).should_cache;
              map.add(&map_key(key), key_node, val);
            }
            NodeKind::Array(ArrayBackend::DualIndex(map))
          } else {
            let mut map = OrderedMap::with_capacity(arr.len());
            for (key, child) in arr.entries() {
              let key_node = self.make_key_node(key);
              let val = self.create(child, false, true, snapshot_objects, in_snapshot, config)?;
              should_cache |= self.node(val).should_cache;
              map.add(map_key(key), key_node, val);
            }
            NodeKind::Array(ArrayBackend::Ordered(map))
          };
          let mut node = SharedNode::new(kind);
          node.should_cache = should_cache;
          node
        }
      }
      Value::Object(cell) => {
        // A snapshot root is scanned deeply, objects included; everything
        // beneath an accepted root is covered by that scan.
        if snapshot_objects && (in_snapshot || !has_internal_reference(v, true)) {
          let obj = cell.borrow();
          let mut should_cache = false;
          let mut fields = Vec::with_capacity(obj.len());
          for (name, child) in obj.fields() {
            let val = self.create(child, false, true, true, true, config)?;
            should_cache |= self.node(val).should_cache;
            fields.push((name.clone(), val));
          }
          let mut node =
            SharedNode::new(NodeKind::Object(ObjectSnapshot { class: obj.class().clone(), fields }));
          node.should_cache = should_cache;
          node
        } else {
          tracing::debug!(class = %cell.borrow().class(), "storing object as serialized fallback");
          let mut node = SharedNode::new(NodeKind::SerializedObject(codec::serialize(v)?));
          node.should_cache = true;
          node
        }
      }
    };
    Ok(self.insert(node))
  }

  // The association check behind the construction fast path. The handle
  // must name a live slot of its own generation, and the local array must
  // still match the node entry for entry: mutating a nested materialized
  // array clears only that array's association, so the match is verified
  // all the way down before the parent's node is reused.
  fn association_valid(&self, cell: &Rc<RefCell<Array>>, node: NodeRef) -> bool {
    if !self.contains(node) {
      return false;
    }
    let backend = match &self.node(node).kind {
      NodeKind::Array(backend) => backend,
      _ => return false,
    };
    let arr = cell.borrow();
    if backend.size() != arr.len() {
      return false;
    }
    for (pos, (key, val)) in arr.entries().iter().enumerate() {
      let key_matches = match backend.key_node_at(pos) {
        None => matches!(key, ArrayKey::Int(i) if *i == pos as i64),
        Some(key_node) => self.key_of(key_node) == *key,
      };
      if !key_matches {
        return false;
      }
      if !self.value_matches(val, backend.value_node_at(pos)) {
        return false;
      }
    }
    true
  }

  fn value_matches(&self, v: &Value, node: NodeRef) -> bool {
    match (v, &self.node(node).kind) {
      (Value::Null, NodeKind::Null) => true,
      (Value::Bool(a), NodeKind::Bool(b)) => a == b,
      (Value::Int(a), NodeKind::Int(b)) => a == b,
      (Value::Double(a), NodeKind::Double(b)) => a == b,
      (Value::StaticStr(_) | Value::Str(_), NodeKind::StaticStr(_) | NodeKind::Str(_)) => {
        v.string() == self.string_data(node)
      }
      (Value::Array(cell), NodeKind::Array(_)) => {
        cell.borrow().shared_node() == Some(node) && self.association_valid(cell, node)
      }
      _ => false,
    }
  }

  fn make_key_node(&mut self, key: &ArrayKey) -> NodeRef {
    let kind = match key {
      ArrayKey::Int(i) => NodeKind::Int(*i),
      ArrayKey::Str(s) => NodeKind::Str(s.clone()),
    };
    self.insert(SharedNode::new(kind))
  }

  /// One-shot attempt to upgrade a serialized object node to a structured
  /// snapshot of `v`. Returns the snapshot node (count 1), or `None` when
  /// `v` is not an object, the attempt was already made on `node`, or the
  /// object aliases itself.
  pub fn convert_object(
    &mut self,
    node: NodeRef,
    v: &Value,
    config: BackendConfig,
  ) -> Option<NodeRef> {
    if !v.is_object() || self.node(node).obj_attempted {
      return None;
    }
    self.slot_mut(node).node.obj_attempted = true;
    if has_internal_reference(v, true) {
      tracing::debug!("object aliases itself, keeping serialized form");
      return None;
    }
    // The snapshot path allocates but never serializes, so it cannot fail.
    let converted = self.create(v, false, true, true, true, config).ok()?;
    self.slot_mut(converted).node.obj_attempted = true;
    Some(converted)
  }

  /// True when the node's content required the serialized fallback path,
  /// so a structural copy is unsafe and the cache must deserialize afresh
  /// on every read.
  pub fn should_cache(&self, node: NodeRef) -> bool {
    self.node(node).should_cache
  }

  /// Materializes a fully independent local value. Mutating the result
  /// never affects the node, except that strings share the node's buffer
  /// copy-on-write (safe: the buffer is never mutated in place).
  pub fn to_local(&self, node: NodeRef) -> Result<Value, CodecError> {
    match &self.node(node).kind {
      NodeKind::Null => Ok(Value::Null),
      NodeKind::Bool(b) => Ok(Value::Bool(*b)),
      NodeKind::Int(i) => Ok(Value::Int(*i)),
      NodeKind::Double(d) => Ok(Value::Double(*d)),
      NodeKind::StaticStr(s) => Ok(Value::StaticStr(*s)),
      NodeKind::Str(s) => Ok(Value::Str(s.clone())),
      NodeKind::Array(_) => self.materialize_all(node),
      NodeKind::SerializedArray(blob) | NodeKind::SerializedObject(blob) => {
        codec::deserialize(blob)
      }
      NodeKind::Object(snap) => {
        let mut obj = Object::new(&snap.class);
        for (name, val) in &snap.fields {
          obj.set(name, self.to_local(*val)?);
        }
        Ok(Value::Object(Rc::new(RefCell::new(obj))))
      }
    }
  }

  /// Bulk rehydration of a structured array node: walks every position
  /// once, inserting key and locally-converted value into a fresh local
  /// array. The result stays associated with `node` for the construction
  /// fast path until it is mutated.
  pub fn materialize_all(&self, node: NodeRef) -> Result<Value, CodecError> {
    let backend = self.array_backend(node);
    let mut arr = Array::new();
    for pos in 0..backend.size() {
      let key = match backend.key_node_at(pos) {
        None => ArrayKey::Int(pos as i64),
        Some(key_node) => self.key_of(key_node),
      };
      let val = self.to_local(backend.value_node_at(pos))?;
      arr.insert(key, val);
    }
    arr.attach_shared(node);
    Ok(Value::Array(Rc::new(RefCell::new(arr))))
  }

  fn array_backend(&self, node: NodeRef) -> &ArrayBackend {
    match &self.node(node).kind {
      NodeKind::Array(backend) => backend,
      other => panic!("not a structured array node: {}", other.name()),
    }
  }

  fn key_of(&self, key_node: NodeRef) -> ArrayKey {
    match &self.node(key_node).kind {
      NodeKind::Int(i) => ArrayKey::Int(*i),
      NodeKind::Str(s) => ArrayKey::Str(s.clone()),
      NodeKind::StaticStr(s) => ArrayKey::Str(Arc::from(*s)),
      other => panic!("array key node must be int or string, found {}", other.name()),
    }
  }

  /// Number of entries in a structured array node.
  pub fn arr_size(&self, node: NodeRef) -> usize {
    self.array_backend(node).size()
  }

  /// Position of `key` in a structured array node, or `-1` when absent or
  /// when the key's dynamic type is not a legal array key.
  pub fn index_of(&self, node: NodeRef, key: &Value) -> i64 {
    match key {
      Value::Int(i) => self.index_of_int(node, *i),
      Value::Str(_) | Value::StaticStr(_) => self.index_of_str(node, key.string()),
      // No other types are legitimate keys.
      _ => NOT_FOUND,
    }
  }

  pub fn index_of_int(&self, node: NodeRef, key: i64) -> i64 {
    self.array_backend(node).index_of_int(key)
  }

  pub fn index_of_str(&self, node: NodeRef, key: &str) -> i64 {
    self.array_backend(node).index_of_str(key)
  }

  /// The key at `pos` as a local value. `pos` must be `< arr_size()`.
  pub fn key_at(&self, node: NodeRef, pos: usize) -> Value {
    match self.array_backend(node).key_node_at(pos) {
      None => Value::Int(pos as i64),
      Some(key_node) => self.key_of(key_node).to_value(),
    }
  }

  /// The owned value node at `pos`. `pos` must be `< arr_size()`.
  pub fn value_at(&self, node: NodeRef, pos: usize) -> NodeRef {
    self.array_backend(node).value_node_at(pos)
  }

  /// Byte content of a string node.
  pub fn string_data(&self, node: NodeRef) -> &str {
    match &self.node(node).kind {
      NodeKind::StaticStr(s) => s,
      NodeKind::Str(s) => s,
      other => panic!("not a string node: {}", other.name()),
    }
  }

  /// Byte length of a string node.
  pub fn string_length(&self, node: NodeRef) -> usize {
    self.string_data(node).len()
  }

  /// Total order over nodes, for use as a key in deduplication tables.
  /// Strict weak: kind rank first, then payload; within the array and
  /// object ranks the structured form orders before the serialized form.
  pub fn compare(&self, a: NodeRef, b: NodeRef) -> Ordering {
    let (na, nb) = (self.node(a), self.node(b));
    match na.kind.rank().cmp(&nb.kind.rank()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    match (&na.kind, &nb.kind) {
      (NodeKind::Null, NodeKind::Null) => Ordering::Equal,
      (NodeKind::Bool(x), NodeKind::Bool(y)) => x.cmp(y),
      (NodeKind::Int(x), NodeKind::Int(y)) => x.cmp(y),
      (NodeKind::Double(x), NodeKind::Double(y)) => x.total_cmp(y),
      (NodeKind::StaticStr(_) | NodeKind::Str(_), NodeKind::StaticStr(_) | NodeKind::Str(_)) => {
        self.string_data(a).cmp(self.string_data(b))
      }
      (NodeKind::Array(x), NodeKind::Array(y)) => self.compare_arrays(x, y),
      (NodeKind::Array(_), NodeKind::SerializedArray(_)) => Ordering::Less,
      (NodeKind::SerializedArray(_), NodeKind::Array(_)) => Ordering::Greater,
      (NodeKind::SerializedArray(x), NodeKind::SerializedArray(y)) => x.cmp(y),
      (NodeKind::Object(x), NodeKind::Object(y)) => self.compare_snapshots(x, y),
      (NodeKind::Object(_), NodeKind::SerializedObject(_)) => Ordering::Less,
      (NodeKind::SerializedObject(_), NodeKind::Object(_)) => Ordering::Greater,
      (NodeKind::SerializedObject(x), NodeKind::SerializedObject(y)) => x.cmp(y),
      _ => unreachable!("kind ranks matched"),
    }
  }

  fn compare_arrays(&self, x: &ArrayBackend, y: &ArrayBackend) -> Ordering {
    match x.size().cmp(&y.size()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    for pos in 0..x.size() {
      let key_ord = self.compare_keys(x, y, pos);
      if key_ord != Ordering::Equal {
        return key_ord;
      }
      let val_ord = self.compare(x.value_node_at(pos), y.value_node_at(pos));
      if val_ord != Ordering::Equal {
        return val_ord;
      }
    }
    Ordering::Equal
  }

  fn compare_keys(&self, x: &ArrayBackend, y: &ArrayBackend, pos: usize) -> Ordering {
    let kx = self.key_scalar(x, pos);
    let ky = self.key_scalar(y, pos);
    match (kx, ky) {
      (KeyScalar::Int(a), KeyScalar::Int(b)) => a.cmp(&b),
      (KeyScalar::Int(_), KeyScalar::Str(_)) => Ordering::Less,
      (KeyScalar::Str(_), KeyScalar::Int(_)) => Ordering::Greater,
      (KeyScalar::Str(a), KeyScalar::Str(b)) => a.cmp(b),
    }
  }

  fn key_scalar<'a>(&'a self, backend: &'a ArrayBackend, pos: usize) -> KeyScalar<'a> {
    match backend.key_node_at(pos) {
      None => KeyScalar::Int(pos as i64),
      Some(key_node) => match &self.node(key_node).kind {
        NodeKind::Int(i) => KeyScalar::Int(*i),
        NodeKind::Str(s) => KeyScalar::Str(s),
        NodeKind::StaticStr(s) => KeyScalar::Str(s),
        other => panic!("array key node must be int or string, found {}", other.name()),
      },
    }
  }

  fn compare_snapshots(&self, x: &ObjectSnapshot, y: &ObjectSnapshot) -> Ordering {
    match x.class.cmp(&y.class) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    match x.fields.len().cmp(&y.fields.len()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    for ((nx, vx), (ny, vy)) in x.fields.iter().zip(y.fields.iter()) {
      match nx.cmp(ny) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
      match self.compare(*vx, *vy) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
    }
    Ordering::Equal
  }

  /// Renders a human-readable summary of the node: kind, size or length,
  /// and the current reference count. Non-destructive.
  pub fn dump(&self, node: NodeRef) -> String {
    let mut out = String::new();
    self.write_dump(node, 0, &mut out);
    out
  }

  fn write_dump(&self, node: NodeRef, indent: usize, out: &mut String) {
    use std::fmt::Write;
    let n = self.node(node);
    let _ = write!(out, "ref({}) ", self.ref_count(node));
    match &n.kind {
      NodeKind::Null => out.push_str("null\n"),
      NodeKind::Bool(b) => {
        let _ = writeln!(out, "boolean: {}", b);
      }
      NodeKind::Int(i) => {
        let _ = writeln!(out, "int: {}", i);
      }
      NodeKind::Double(d) => {
        let _ = writeln!(out, "double: {}", d);
      }
      NodeKind::StaticStr(_) | NodeKind::Str(_) => {
        let s = self.string_data(node);
        let _ = writeln!(out, "string({}): {}", s.len(), s);
      }
      NodeKind::SerializedArray(blob) => {
        let _ = writeln!(out, "array (serialized): {}", blob);
      }
      NodeKind::SerializedObject(blob) => {
        let _ = writeln!(out, "object (serialized): {}", blob);
      }
      NodeKind::Array(backend) => {
        let _ = writeln!(out, "array({}):", backend.size());
        for pos in 0..backend.size() {
          let pad = " ".repeat(indent + 2);
          let key = match self.key_at(node, pos) {
            Value::Int(i) => i.to_string(),
            key => key.string().to_string(),
          };
          let _ = write!(out, "{}[{}] => ", pad, key);
          self.write_dump(backend.value_node_at(pos), indent + 2, out);
        }
      }
      NodeKind::Object(snap) => {
        let _ = writeln!(out, "object({}) {}:", snap.fields.len(), snap.class);
        for (name, val) in &snap.fields {
          let pad = " ".repeat(indent + 2);
          let _ = write!(out, "{}{} => ", pad, name);
          self.write_dump(*val, indent + 2, out);
        }
      }
    }
  }

  /// Footprint of the node: the fixed header for non-reference-counted
  /// kinds, plus owned payload (recursively, for arrays and snapshots).
  /// The dual-index backend's contribution is an approximation.
  pub fn space_usage(&self, node: NodeRef) -> usize {
    match &self.node(node).kind {
      NodeKind::Null
      | NodeKind::Bool(_)
      | NodeKind::Int(_)
      | NodeKind::Double(_)
      | NodeKind::StaticStr(_) => NODE_HEADER,
      NodeKind::Str(s) | NodeKind::SerializedArray(s) | NodeKind::SerializedObject(s) => {
        NODE_HEADER + s.len()
      }
      NodeKind::Array(ArrayBackend::Vector(vals)) => {
        let mut size =
          NODE_HEADER + mem::size_of::<ArrayBackend>() + vals.len() * mem::size_of::<NodeRef>();
        for val in vals {
          size += self.space_usage(*val);
        }
        size
      }
      NodeKind::Array(ArrayBackend::Ordered(map)) => {
        let mut size = NODE_HEADER + map.struct_size();
        for pos in 0..map.size() {
          let entry = map.entry_at(pos);
          size += self.space_usage(entry.key);
          size += self.space_usage(entry.val);
        }
        size
      }
      // Not accurate: the dual-index tables and children are not counted.
      NodeKind::Array(ArrayBackend::DualIndex(_)) => {
        NODE_HEADER + mem::size_of::<DualIndexMap>()
      }
      NodeKind::Object(snap) => {
        let mut size = NODE_HEADER;
        for (name, val) in &snap.fields {
          size += name.len() + self.space_usage(*val);
        }
        size
      }
    }
  }

  /// Recursive size breakdown; see [`NodeStats`].
  pub fn get_stats(&self, node: NodeRef) -> NodeStats {
    let mut stats = NodeStats { node_count: 1, data_size: 0, data_total_size: 0 };
    match &self.node(node).kind {
      NodeKind::Null
      | NodeKind::Bool(_)
      | NodeKind::Int(_)
      | NodeKind::Double(_)
      | NodeKind::StaticStr(_) => {
        stats.data_size = mem::size_of::<i64>();
        stats.data_total_size = NODE_HEADER;
      }
      NodeKind::Str(s) | NodeKind::SerializedArray(s) | NodeKind::SerializedObject(s) => {
        stats.data_size = s.len();
        stats.data_total_size = NODE_HEADER + s.len();
      }
      NodeKind::Array(ArrayBackend::Vector(vals)) => {
        stats.data_total_size =
          NODE_HEADER + mem::size_of::<ArrayBackend>() + vals.len() * mem::size_of::<NodeRef>();
        for val in vals {
          stats.add_child(&self.get_stats(*val));
        }
      }
      NodeKind::Array(ArrayBackend::Ordered(map)) => {
        stats.data_total_size = NODE_HEADER + map.struct_size();
        for pos in 0..map.size() {
          let entry = map.entry_at(pos);
          stats.add_child(&self.get_stats(entry.key));
          stats.add_child(&self.get_stats(entry.val));
        }
      }
      // There is no way to account for this backend accurately; charge the
      // struct itself and nothing else.
      NodeKind::Array(ArrayBackend::DualIndex(_)) => {
        stats.data_total_size = mem::size_of::<DualIndexMap>();
      }
      NodeKind::Object(snap) => {
        stats.data_total_size = NODE_HEADER;
        for (name, val) in &snap.fields {
          stats.data_size += name.len();
          stats.data_total_size += name.len();
          stats.add_child(&self.get_stats(*val));
        }
      }
    }
    stats
  }
}

enum KeyScalar<'a> {
  Int(i64),
  Str(&'a str),
}

fn map_key(key: &ArrayKey) -> MapKey {
  match key {
    ArrayKey::Int(i) => MapKey::Int(*i),
    ArrayKey::Str(s) => MapKey::Str(Box::from(&**s)),
  }
}
