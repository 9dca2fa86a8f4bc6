//! The shared-memory placement variant.
//!
//! A [`Segment`] is a relocatable arena: a slot table for node headers, a
//! byte region for string and blob payloads, and entry/order regions for
//! container runs. Every internal reference is an offset resolved through
//! the segment at access time with a bounds check, never an absolute
//! pointer, so the contents stay valid no matter where the backing memory
//! is mapped. How a segment gets mapped into a second process is the
//! caller's concern; this module only guarantees position independence.
//!
//! All regions are fixed-capacity and never reallocate. Payload regions
//! are append-only: releasing a node recycles its slot but not its payload
//! bytes. Segments are sized for their working set and discarded wholesale.
//!
//! Placement and reference-count writes go through the spinlock embedded
//! in the segment, since in-process atomics give no cross-process
//! guarantee for compound updates. Published payloads are immutable, so
//! reads take no lock — with one contract: a reader must itself hold a
//! reference on (or be transitively reachable from a held reference to)
//! any node it dereferences, so that no concurrent release can vacate the
//! slot under it. Counts live in atomics so the unlocked reads stay
//! well-defined.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::hint::spin_loop;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering as AtomicOrdering};

use crate::backend::NOT_FOUND;
use crate::codec::{self, CodecError};
use crate::value::{has_internal_reference, Array, ArrayKey, Object, Value};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// A copyable, position-independent handle to a node in a [`Segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeOff(u32);

#[derive(Debug, Clone, Copy)]
struct ByteSpan {
  off: u32,
  len: u32,
}

#[derive(Debug, Clone, Copy)]
struct PairSpan {
  off: u32,
  len: u32,
}

#[derive(Debug, Clone, Copy)]
struct OrderSpan {
  off: u32,
  len: u32,
}

/// One container entry: the key node (absent for vector positions) and the
/// value node.
#[derive(Clone, Copy)]
struct ShmEntry {
  key: Option<NodeOff>,
  val: NodeOff,
}

const EMPTY_ENTRY: ShmEntry = ShmEntry { key: None, val: NodeOff(0) };

#[derive(Clone, Copy)]
enum ShmKind {
  Null,
  Bool(bool),
  Int(i64),
  Double(f64),
  /// Strings are always copied into the byte region; a segment cannot hold
  /// a process-local pointer, static or not.
  Str(ByteSpan),
  /// Keys are exactly `0..len-1`; entries carry values only.
  Vector(PairSpan),
  /// Entry run in insertion order plus a position table sorted by key for
  /// binary-search lookup.
  Map { entries: PairSpan, order: OrderSpan },
  SerializedArray(ByteSpan),
  /// Structured object snapshot: class name bytes and field entries whose
  /// keys are string nodes holding the field names.
  Object { class: ByteSpan, fields: PairSpan },
  SerializedObject(ByteSpan),
}

impl ShmKind {
  fn rank(&self) -> u8 {
    match self {
      ShmKind::Null => 0,
      ShmKind::Bool(_) => 1,
      ShmKind::Int(_) => 2,
      ShmKind::Double(_) => 3,
      ShmKind::Str(_) => 4,
      ShmKind::Vector(_) | ShmKind::Map { .. } | ShmKind::SerializedArray(_) => 5,
      ShmKind::Object { .. } | ShmKind::SerializedObject(_) => 6,
    }
  }

  fn name(&self) -> &'static str {
    match self {
      ShmKind::Null => "null",
      ShmKind::Bool(_) => "boolean",
      ShmKind::Int(_) => "int",
      ShmKind::Double(_) => "double",
      ShmKind::Str(_) => "string",
      ShmKind::Vector(_) | ShmKind::Map { .. } | ShmKind::SerializedArray(_) => "array",
      ShmKind::Object { .. } | ShmKind::SerializedObject(_) => "object",
    }
  }
}

#[derive(Clone, Copy)]
struct ShmNode {
  kind: ShmKind,
  should_cache: bool,
}

const SHM_HEADER: usize = mem::size_of::<ShmNode>();

/// Spinlock serializing the mutating operations on a segment. Lives inside
/// the segment so every mapping of it spins on the same flag.
struct SegmentLock {
  flag: AtomicBool,
}

impl SegmentLock {
  const fn new() -> SegmentLock {
    SegmentLock { flag: AtomicBool::new(false) }
  }

  fn lock(&self) -> SegmentGuard<'_> {
    while self.flag.swap(true, AtomicOrdering::AcqRel) {
      spin_loop();
    }
    SegmentGuard { lock: self }
  }
}

#[must_use = "if unused the lock is immediately released"]
struct SegmentGuard<'a> {
  lock: &'a SegmentLock,
}

impl Drop for SegmentGuard<'_> {
  fn drop(&mut self) {
    self.lock.flag.store(false, AtomicOrdering::Release);
  }
}

/// A fixed-capacity, append-only run of `Copy` cells. Cells below the
/// committed length are never written again, so readers may hold slices
/// into them while the writer (under the segment lock) fills later cells.
struct RegionBuf<T: Copy> {
  cells: Box<[UnsafeCell<T>]>,
  len: AtomicUsize,
  name: &'static str,
}

impl<T: Copy> RegionBuf<T> {
  fn new(name: &'static str, cap: usize, fill: T) -> RegionBuf<T> {
    let cells: Box<[UnsafeCell<T>]> = (0..cap).map(|_| UnsafeCell::new(fill)).collect();
    RegionBuf { cells, len: AtomicUsize::new(0), name }
  }

  fn committed(&self) -> usize {
    self.len.load(AtomicOrdering::Acquire)
  }

  /// Appends a run and returns its starting offset. The segment lock must
  /// be held.
  fn append(&self, run: &[T]) -> u32 {
    let len = self.len.load(AtomicOrdering::Relaxed);
    if len + run.len() > self.cells.len() {
      panic!("segment {} region exhausted ({} of {} used)", self.name, len, self.cells.len());
    }
    for (i, item) in run.iter().enumerate() {
      // SAFETY: cells at or past the committed length are unpublished;
      // only the writer holding the segment lock touches them.
      unsafe { *self.cells[len + i].get() = *item };
    }
    self.len.store(len + run.len(), AtomicOrdering::Release);
    len as u32
  }

  /// Bounds-checked view of a committed run.
  fn run(&self, off: u32, len: u32) -> &[T] {
    let start = off as usize;
    let end = start + len as usize;
    if end > self.committed() {
      panic!("segment {} span {}+{} out of bounds ({})", self.name, off, len, self.committed());
    }
    // SAFETY: committed cells are never written again, and UnsafeCell<T>
    // is layout-compatible with T.
    unsafe { std::slice::from_raw_parts(self.cells.as_ptr().add(start) as *const T, len as usize) }
  }
}

/// One node slot: the payload, rewritten only while the slot sits on the
/// free list, and its reference count.
struct ShmSlot {
  node: UnsafeCell<Option<ShmNode>>,
  count: AtomicU32,
}

/// Free-list bookkeeping, touched only under the segment lock.
struct Meta {
  free: Vec<u32>,
  used: usize,
}

/// A relocatable arena holding an immutable node graph plus the lock and
/// reference counts that manage it.
pub struct Segment {
  lock: SegmentLock,
  slots: Box<[ShmSlot]>,
  bytes: RegionBuf<u8>,
  pairs: RegionBuf<ShmEntry>,
  order: RegionBuf<u32>,
  meta: UnsafeCell<Meta>,
  live: AtomicUsize,
}

// SAFETY: all compound mutation (placement, free-list updates, slot
// payload writes, count RMW) happens under the embedded spinlock. Counts
// are atomics; region cells and slot payloads are only written while
// unpublished (past the committed length, or on the free list with no
// outstanding handles), so the unlocked reads never alias a write as long
// as callers uphold the documented contract of holding a reference to any
// node they dereference.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
  /// Creates a segment with fixed region capacities: `node_cap` slots,
  /// `byte_cap` payload bytes, and `pair_cap` container entries (the order
  /// region shares this capacity). Exceeding a capacity during placement
  /// panics; size for the workload.
  pub fn with_capacity(node_cap: usize, byte_cap: usize, pair_cap: usize) -> Segment {
    let slots: Box<[ShmSlot]> = (0..node_cap)
      .map(|_| ShmSlot { node: UnsafeCell::new(None), count: AtomicU32::new(0) })
      .collect();
    Segment {
      lock: SegmentLock::new(),
      slots,
      bytes: RegionBuf::new("byte", byte_cap, 0),
      pairs: RegionBuf::new("entry", pair_cap, EMPTY_ENTRY),
      order: RegionBuf::new("order", pair_cap, 0),
      meta: UnsafeCell::new(Meta { free: Vec::new(), used: 0 }),
      live: AtomicUsize::new(0),
    }
  }

  /// Number of live nodes.
  pub fn len(&self) -> usize {
    self.live.load(AtomicOrdering::Acquire)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// True when `node` refers to a live slot.
  pub fn contains(&self, node: NodeOff) -> bool {
    let _guard = self.lock.lock();
    match self.slots.get(node.0 as usize) {
      // SAFETY: segment lock held; no concurrent payload write.
      Some(slot) => unsafe { (*slot.node.get()).is_some() },
      None => false,
    }
  }

  fn raw_slot(&self, off: NodeOff) -> &ShmSlot {
    self
      .slots
      .get(off.0 as usize)
      .unwrap_or_else(|| panic!("invalid node offset {}", off.0))
  }

  // Read-side payload access. Callers uphold the module contract: the
  // handle keeps the slot occupied, so the payload cannot be rewritten
  // while this reference is alive.
  fn node(&self, off: NodeOff) -> &ShmNode {
    let slot = self.raw_slot(off);
    // SAFETY: see above; the payload is only rewritten while the slot sits
    // on the free list with no outstanding handles.
    match unsafe { &*slot.node.get() } {
      Some(node) => node,
      None => panic!("invalid node offset {}", off.0),
    }
  }

  // Lock must be held. Panics unless the slot is occupied.
  fn occupied_slot(&self, off: NodeOff) -> &ShmSlot {
    let slot = self.raw_slot(off);
    // SAFETY: segment lock held; no concurrent payload write.
    if unsafe { (*slot.node.get()).is_none() } {
      panic!("invalid node offset {}", off.0);
    }
    slot
  }

  /// Places a local value into the segment, deeply and recursively, with an
  /// initial reference count of 1. Semantics match
  /// [`NodeStore::from_local`](crate::store::NodeStore::from_local), except
  /// that keyed arrays always take the sorted-lookup map shape and there is
  /// no construction fast path.
  ///
  /// # Panics
  ///
  /// Panics when a region capacity is exhausted.
  pub fn from_local(
    &self,
    v: &Value,
    serialized: bool,
    snapshot_objects: bool,
  ) -> Result<NodeOff, CodecError> {
    let _guard = self.lock.lock();
    self.place(v, serialized, false, snapshot_objects, false)
  }

  /// Current reference count of `node`.
  pub fn ref_count(&self, node: NodeOff) -> u32 {
    let _guard = self.lock.lock();
    self.occupied_slot(node).count.load(AtomicOrdering::Relaxed)
  }

  /// Increments the reference count.
  pub fn retain(&self, node: NodeOff) {
    let _guard = self.lock.lock();
    self.occupied_slot(node).count.fetch_add(1, AtomicOrdering::Relaxed);
  }

  /// Decrements the reference count. Reaching zero removes the node and
  /// releases every owned child exactly once, recursively. Slot indices are
  /// recycled; payload bytes are not.
  pub fn release(&self, node: NodeOff) {
    let _guard = self.lock.lock();
    self.release_locked(node);
  }

  fn release_locked(&self, off: NodeOff) {
    let slot = self.occupied_slot(off);
    if slot.count.load(AtomicOrdering::Relaxed) > 1 {
      slot.count.fetch_sub(1, AtomicOrdering::Relaxed);
      return;
    }
    // SAFETY: lock held, and the count reached zero, so no live handle
    // remains to read this slot.
    let node = match unsafe { (*slot.node.get()).take() } {
      Some(node) => node,
      None => panic!("invalid node offset {}", off.0),
    };
    slot.count.store(0, AtomicOrdering::Relaxed);
    self.live.fetch_sub(1, AtomicOrdering::Release);
    // SAFETY: free-list bookkeeping is only touched under the lock.
    unsafe { &mut *self.meta.get() }.free.push(off.0);
    let mut children = Vec::new();
    match node.kind {
      ShmKind::Vector(span)
      | ShmKind::Map { entries: span, .. }
      | ShmKind::Object { fields: span, .. } => {
        for entry in self.entries(span) {
          if let Some(key) = entry.key {
            children.push(key);
          }
          children.push(entry.val);
        }
      }
      _ => {}
    }
    for child in children {
      self.release_locked(child);
    }
  }

  // Lock must be held.
  fn insert(&self, node: ShmNode) -> NodeOff {
    // SAFETY: free-list bookkeeping is only touched under the lock.
    let meta = unsafe { &mut *self.meta.get() };
    let index = match meta.free.pop() {
      Some(index) => index as usize,
      None => {
        if meta.used == self.slots.len() {
          panic!("segment slot table exhausted ({} slots)", self.slots.len());
        }
        meta.used += 1;
        meta.used - 1
      }
    };
    let slot = &self.slots[index];
    // SAFETY: the slot is free; no handle references it.
    debug_assert!(unsafe { (*slot.node.get()).is_none() }, "free list pointed at a live slot");
    unsafe { *slot.node.get() = Some(node) };
    slot.count.store(1, AtomicOrdering::Relaxed);
    self.live.fetch_add(1, AtomicOrdering::Release);
    NodeOff(index as u32)
  }

  // Lock must be held (placement appends to every region).
  fn place(
    &self,
    v: &Value,
    serialized: bool,
    inner_call: bool,
    snapshot_objects: bool,
    in_snapshot: bool,
  ) -> Result<NodeOff, CodecError> {
    let node = match v {
      Value::Null => ShmNode { kind: ShmKind::Null, should_cache: false },
      Value::Bool(b) => ShmNode { kind: ShmKind::Bool(*b), should_cache: false },
      Value::Int(i) => ShmNode { kind: ShmKind::Int(*i), should_cache: false },
      Value::Double(d) => ShmNode { kind: ShmKind::Double(*d), should_cache: false },
      Value::StaticStr(_) | Value::Str(_) => {
        if serialized {
          // A primed blob always lands under the object fallback, even
          // when it decodes to an array; only the dump label and the
          // comparator rank can tell the difference.
          let blob = codec::reserialize(v.string())?;
          let span = self.push_str(&blob);
          ShmNode { kind: ShmKind::SerializedObject(span), should_cache: false }
        } else {
          let span = self.push_str(v.string());
          ShmNode { kind: ShmKind::Str(span), should_cache: false }
        }
      }
      Value::Array(cell) => {
        if !inner_call && has_internal_reference(v, false) {
          tracing::debug!("array aliases itself, storing serialized fallback");
          let blob = codec::serialize(v)?;
          let span = self.push_str(&blob);
          ShmNode { kind: ShmKind::SerializedArray(span), should_cache: true }
        } else {
          let arr = cell.borrow();
          let mut should_cache = false;
          if arr.is_vector_shape() {
            let mut run = Vec::with_capacity(arr.len());
            for (_, child) in arr.entries() {
              let val = self.place(child, false, true, snapshot_objects, in_snapshot)?;
              should_cache |= self.node(val).should_cache;
              run.push(ShmEntry { key: None, val });
            }
            let span = self.push_entries(&run);
            ShmNode { kind: ShmKind::Vector(span), should_cache }
          } else {
            let mut run = Vec::with_capacity(arr.len());
            let mut scalars = Vec::with_capacity(arr.len());
            for (key, child) in arr.entries() {
              let (key_node, scalar) = match key {
                ArrayKey::Int(i) => (
                  self.insert(ShmNode { kind: ShmKind::Int(*i), should_cache: false }),
                  OwnedKey::Int(*i),
                ),
                ArrayKey::Str(s) => {
                  let span = self.push_str(s);
                  (
                    self.insert(ShmNode { kind: ShmKind::Str(span), should_cache: false }),
                    OwnedKey::Str(s.to_string()),
                  )
                }
              };
              let val = self.place(child, false, true, snapshot_objects, in_snapshot)?;
              should_cache |= self.node(val).should_cache;
              run.push(ShmEntry { key: Some(key_node), val });
              scalars.push(scalar);
            }
            let mut positions: Vec<u32> = (0..run.len() as u32).collect();
            positions.sort_by(|a, b| {
              scalars[*a as usize].scalar().cmp(&scalars[*b as usize].scalar())
            });
            let entries = self.push_entries(&run);
            let order = self.push_order(&positions);
            ShmNode { kind: ShmKind::Map { entries, order }, should_cache }
          }
        }
      }
      Value::Object(cell) => {
        if snapshot_objects && (in_snapshot || !has_internal_reference(v, true)) {
          let obj = cell.borrow();
          let class = self.push_str(obj.class());
          let mut should_cache = false;
          let mut run = Vec::with_capacity(obj.len());
          for (name, child) in obj.fields() {
            let span = self.push_str(name);
            let key = self.insert(ShmNode { kind: ShmKind::Str(span), should_cache: false });
            let val = self.place(child, false, true, true, true)?;
            should_cache |= self.node(val).should_cache;
            run.push(ShmEntry { key: Some(key), val });
          }
          let fields = self.push_entries(&run);
          ShmNode { kind: ShmKind::Object { class, fields }, should_cache }
        } else {
          tracing::debug!(class = %cell.borrow().class(), "storing object as serialized fallback");
          let blob = codec::serialize(v)?;
          let span = self.push_str(&blob);
          ShmNode { kind: ShmKind::SerializedObject(span), should_cache: true }
        }
      }
    };
    Ok(self.insert(node))
  }

  fn push_str(&self, s: &str) -> ByteSpan {
    ByteSpan { off: self.bytes.append(s.as_bytes()), len: s.len() as u32 }
  }

  fn push_entries(&self, run: &[ShmEntry]) -> PairSpan {
    PairSpan { off: self.pairs.append(run), len: run.len() as u32 }
  }

  fn push_order(&self, run: &[u32]) -> OrderSpan {
    OrderSpan { off: self.order.append(run), len: run.len() as u32 }
  }

  fn str_at(&self, span: ByteSpan) -> &str {
    let bytes = self.bytes.run(span.off, span.len);
    match std::str::from_utf8(bytes) {
      Ok(s) => s,
      Err(_) => panic!("corrupt string payload at byte span {}+{}", span.off, span.len),
    }
  }

  fn entries(&self, span: PairSpan) -> &[ShmEntry] {
    self.pairs.run(span.off, span.len)
  }

  fn order_run(&self, span: OrderSpan) -> &[u32] {
    self.order.run(span.off, span.len)
  }

  /// See [`NodeStore::should_cache`](crate::store::NodeStore::should_cache).
  pub fn should_cache(&self, node: NodeOff) -> bool {
    self.node(node).should_cache
  }

  /// Materializes a fully independent local value; string content is copied
  /// out of the segment.
  pub fn to_local(&self, node: NodeOff) -> Result<Value, CodecError> {
    match &self.node(node).kind {
      ShmKind::Null => Ok(Value::Null),
      ShmKind::Bool(b) => Ok(Value::Bool(*b)),
      ShmKind::Int(i) => Ok(Value::Int(*i)),
      ShmKind::Double(d) => Ok(Value::Double(*d)),
      ShmKind::Str(span) => Ok(Value::str(self.str_at(*span))),
      ShmKind::Vector(_) | ShmKind::Map { .. } => self.materialize_all(node),
      ShmKind::SerializedArray(span) | ShmKind::SerializedObject(span) => {
        codec::deserialize(self.str_at(*span))
      }
      ShmKind::Object { class, fields } => {
        let mut obj = Object::new(self.str_at(*class));
        for entry in self.entries(*fields) {
          let name = match entry.key.map(|k| self.key_scalar(k)) {
            Some(ShmKeyScalar::Str(s)) => s.to_string(),
            _ => panic!("object field without string name node"),
          };
          obj.set(&name, self.to_local(entry.val)?);
        }
        Ok(Value::Object(Rc::new(RefCell::new(obj))))
      }
    }
  }

  /// Bulk rehydration of a structured array node.
  pub fn materialize_all(&self, node: NodeOff) -> Result<Value, CodecError> {
    let mut arr = Array::new();
    for (pos, entry) in self.arr_entries(node).iter().enumerate() {
      let key = match entry.key {
        None => ArrayKey::Int(pos as i64),
        Some(key_node) => match self.key_scalar(key_node) {
          ShmKeyScalar::Int(i) => ArrayKey::Int(i),
          ShmKeyScalar::Str(s) => ArrayKey::Str(Arc::from(s)),
        },
      };
      arr.insert(key, self.to_local(entry.val)?);
    }
    Ok(Value::Array(Rc::new(RefCell::new(arr))))
  }

  fn arr_entries(&self, node: NodeOff) -> &[ShmEntry] {
    match &self.node(node).kind {
      ShmKind::Vector(span) | ShmKind::Map { entries: span, .. } => self.entries(*span),
      other => panic!("not a structured array node: {}", other.name()),
    }
  }

  fn entry_at(&self, node: NodeOff, pos: usize) -> ShmEntry {
    let entries = self.arr_entries(node);
    *entries.get(pos).unwrap_or_else(|| {
      panic!("position {} out of range for array of size {}", pos, entries.len())
    })
  }

  fn key_scalar(&self, key_node: NodeOff) -> ShmKeyScalar<'_> {
    match &self.node(key_node).kind {
      ShmKind::Int(i) => ShmKeyScalar::Int(*i),
      ShmKind::Str(span) => ShmKeyScalar::Str(self.str_at(*span)),
      other => panic!("array key node must be int or string, found {}", other.name()),
    }
  }

  /// Number of entries in a structured array node.
  pub fn arr_size(&self, node: NodeOff) -> usize {
    self.arr_entries(node).len()
  }

  /// Position of `key` in a structured array node, or `-1` when absent or
  /// when the key's dynamic type is not a legal array key.
  pub fn index_of(&self, node: NodeOff, key: &Value) -> i64 {
    match key {
      Value::Int(i) => self.index_of_int(node, *i),
      Value::Str(_) | Value::StaticStr(_) => self.index_of_str(node, key.string()),
      _ => NOT_FOUND,
    }
  }

  pub fn index_of_int(&self, node: NodeOff, key: i64) -> i64 {
    self.index_of_scalar(node, ShmKeyScalar::Int(key))
  }

  pub fn index_of_str(&self, node: NodeOff, key: &str) -> i64 {
    self.index_of_scalar(node, ShmKeyScalar::Str(key))
  }

  fn index_of_scalar(&self, node: NodeOff, key: ShmKeyScalar<'_>) -> i64 {
    match &self.node(node).kind {
      ShmKind::Vector(span) => match key {
        ShmKeyScalar::Int(i) if i >= 0 && (i as u64) < span.len as u64 => i,
        _ => NOT_FOUND,
      },
      ShmKind::Map { entries, order } => {
        let entries = self.entries(*entries);
        let order = self.order_run(*order);
        let found = order.binary_search_by(|pos| {
          let entry = entries[*pos as usize];
          // Map entries always carry a key node.
          match entry.key.map(|k| self.key_scalar(k)) {
            Some(scalar) => scalar.cmp(&key),
            None => panic!("map entry without key node"),
          }
        });
        match found {
          Ok(i) => order[i] as i64,
          Err(_) => NOT_FOUND,
        }
      }
      other => panic!("not a structured array node: {}", other.name()),
    }
  }

  /// The key at `pos` as a local value. `pos` must be `< arr_size()`.
  pub fn key_at(&self, node: NodeOff, pos: usize) -> Value {
    match self.entry_at(node, pos).key {
      None => Value::Int(pos as i64),
      Some(key_node) => match self.key_scalar(key_node) {
        ShmKeyScalar::Int(i) => Value::Int(i),
        ShmKeyScalar::Str(s) => Value::str(s),
      },
    }
  }

  /// The owned value node at `pos`. `pos` must be `< arr_size()`.
  pub fn value_at(&self, node: NodeOff, pos: usize) -> NodeOff {
    self.entry_at(node, pos).val
  }

  /// Byte content of a string node, borrowed from the segment.
  pub fn string_data(&self, node: NodeOff) -> &str {
    match &self.node(node).kind {
      ShmKind::Str(span) => self.str_at(*span),
      other => panic!("not a string node: {}", other.name()),
    }
  }

  /// Byte length of a string node.
  pub fn string_length(&self, node: NodeOff) -> usize {
    self.string_data(node).len()
  }

  /// Total order over nodes in this segment; same ordering as
  /// [`NodeStore::compare`](crate::store::NodeStore::compare).
  pub fn compare(&self, a: NodeOff, b: NodeOff) -> Ordering {
    let (na, nb) = (self.node(a), self.node(b));
    match na.kind.rank().cmp(&nb.kind.rank()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    match (&na.kind, &nb.kind) {
      (ShmKind::Null, ShmKind::Null) => Ordering::Equal,
      (ShmKind::Bool(x), ShmKind::Bool(y)) => x.cmp(y),
      (ShmKind::Int(x), ShmKind::Int(y)) => x.cmp(y),
      (ShmKind::Double(x), ShmKind::Double(y)) => x.total_cmp(y),
      (ShmKind::Str(x), ShmKind::Str(y)) => self.str_at(*x).cmp(self.str_at(*y)),
      (ShmKind::Vector(_) | ShmKind::Map { .. }, ShmKind::Vector(_) | ShmKind::Map { .. }) => {
        self.compare_arrays(a, b)
      }
      (ShmKind::Vector(_) | ShmKind::Map { .. }, ShmKind::SerializedArray(_)) => Ordering::Less,
      (ShmKind::SerializedArray(_), ShmKind::Vector(_) | ShmKind::Map { .. }) => Ordering::Greater,
      (ShmKind::SerializedArray(x), ShmKind::SerializedArray(y)) => {
        self.str_at(*x).cmp(self.str_at(*y))
      }
      (ShmKind::Object { .. }, ShmKind::Object { .. }) => self.compare_objects(a, b),
      (ShmKind::Object { .. }, ShmKind::SerializedObject(_)) => Ordering::Less,
      (ShmKind::SerializedObject(_), ShmKind::Object { .. }) => Ordering::Greater,
      (ShmKind::SerializedObject(x), ShmKind::SerializedObject(y)) => {
        self.str_at(*x).cmp(self.str_at(*y))
      }
      _ => unreachable!("kind ranks matched"),
    }
  }

  fn compare_arrays(&self, a: NodeOff, b: NodeOff) -> Ordering {
    let (xs, ys) = (self.arr_entries(a), self.arr_entries(b));
    match xs.len().cmp(&ys.len()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    for (pos, (x, y)) in xs.iter().zip(ys.iter()).enumerate() {
      let kx = match x.key {
        None => ShmKeyScalar::Int(pos as i64),
        Some(k) => self.key_scalar(k),
      };
      let ky = match y.key {
        None => ShmKeyScalar::Int(pos as i64),
        Some(k) => self.key_scalar(k),
      };
      match kx.cmp(&ky) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
      match self.compare(x.val, y.val) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
    }
    Ordering::Equal
  }

  fn compare_objects(&self, a: NodeOff, b: NodeOff) -> Ordering {
    let ((cx, fx), (cy, fy)) = match (&self.node(a).kind, &self.node(b).kind) {
      (ShmKind::Object { class: cx, fields: fx }, ShmKind::Object { class: cy, fields: fy }) => {
        ((*cx, *fx), (*cy, *fy))
      }
      _ => unreachable!("checked by caller"),
    };
    match self.str_at(cx).cmp(self.str_at(cy)) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    let (xs, ys) = (self.entries(fx), self.entries(fy));
    match xs.len().cmp(&ys.len()) {
      Ordering::Equal => {}
      unequal => return unequal,
    }
    for (x, y) in xs.iter().zip(ys.iter()) {
      let nx = match x.key.map(|k| self.key_scalar(k)) {
        Some(ShmKeyScalar::Str(s)) => s,
        _ => panic!("object field without string name node"),
      };
      let ny = match y.key.map(|k| self.key_scalar(k)) {
        Some(ShmKeyScalar::Str(s)) => s,
        _ => panic!("object field without string name node"),
      };
      match nx.cmp(ny) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
      match self.compare(x.val, y.val) {
        Ordering::Equal => {}
        unequal => return unequal,
      }
    }
    Ordering::Equal
  }

  /// Renders a human-readable summary of the node. Non-destructive.
  /// Holds the segment lock while it walks, since it reports reference
  /// counts.
  pub fn dump(&self, node: NodeOff) -> String {
    let _guard = self.lock.lock();
    let mut out = String::new();
    self.write_dump(node, 0, &mut out);
    out
  }

  // Lock must be held (reads counts).
  fn write_dump(&self, node: NodeOff, indent: usize, out: &mut String) {
    use std::fmt::Write;
    let count = self.occupied_slot(node).count.load(AtomicOrdering::Relaxed);
    let _ = write!(out, "ref({}) ", count);
    match &self.node(node).kind {
      ShmKind::Null => out.push_str("null\n"),
      ShmKind::Bool(b) => {
        let _ = writeln!(out, "boolean: {}", b);
      }
      ShmKind::Int(i) => {
        let _ = writeln!(out, "int: {}", i);
      }
      ShmKind::Double(d) => {
        let _ = writeln!(out, "double: {}", d);
      }
      ShmKind::Str(span) => {
        let s = self.str_at(*span);
        let _ = writeln!(out, "string({}): {}", s.len(), s);
      }
      ShmKind::SerializedArray(span) => {
        let _ = writeln!(out, "array (serialized): {}", self.str_at(*span));
      }
      ShmKind::SerializedObject(span) => {
        let _ = writeln!(out, "object (serialized): {}", self.str_at(*span));
      }
      ShmKind::Vector(_) | ShmKind::Map { .. } => {
        let entries = self.arr_entries(node);
        let _ = writeln!(out, "array({}):", entries.len());
        for (pos, entry) in entries.iter().enumerate() {
          let pad = " ".repeat(indent + 2);
          let key = match entry.key {
            None => pos.to_string(),
            Some(k) => match self.key_scalar(k) {
              ShmKeyScalar::Int(i) => i.to_string(),
              ShmKeyScalar::Str(s) => s.to_string(),
            },
          };
          let _ = write!(out, "{}[{}] => ", pad, key);
          self.write_dump(entry.val, indent + 2, out);
        }
      }
      ShmKind::Object { class, fields } => {
        let entries = self.entries(*fields);
        let _ = writeln!(out, "object({}) {}:", entries.len(), self.str_at(*class));
        for entry in entries {
          let pad = " ".repeat(indent + 2);
          let name = match entry.key.map(|k| self.key_scalar(k)) {
            Some(ShmKeyScalar::Str(s)) => s.to_string(),
            _ => panic!("object field without string name node"),
          };
          let _ = write!(out, "{}{} => ", pad, name);
          self.write_dump(entry.val, indent + 2, out);
        }
      }
    }
  }

  /// Footprint of the node inside the segment, recursively.
  pub fn space_usage(&self, node: NodeOff) -> usize {
    match &self.node(node).kind {
      ShmKind::Null | ShmKind::Bool(_) | ShmKind::Int(_) | ShmKind::Double(_) => SHM_HEADER,
      ShmKind::Str(span) | ShmKind::SerializedArray(span) | ShmKind::SerializedObject(span) => {
        SHM_HEADER + span.len as usize
      }
      ShmKind::Vector(span) => {
        let mut size = SHM_HEADER + span.len as usize * mem::size_of::<ShmEntry>();
        for entry in self.entries(*span) {
          size += self.space_usage(entry.val);
        }
        size
      }
      ShmKind::Map { entries, order } => {
        let mut size = SHM_HEADER
          + entries.len as usize * mem::size_of::<ShmEntry>()
          + order.len as usize * mem::size_of::<u32>();
        for entry in self.entries(*entries) {
          if let Some(key) = entry.key {
            size += self.space_usage(key);
          }
          size += self.space_usage(entry.val);
        }
        size
      }
      ShmKind::Object { class, fields } => {
        let mut size = SHM_HEADER
          + class.len as usize
          + fields.len as usize * mem::size_of::<ShmEntry>();
        for entry in self.entries(*fields) {
          if let Some(key) = entry.key {
            size += self.space_usage(key);
          }
          size += self.space_usage(entry.val);
        }
        size
      }
    }
  }

  /// Recursive size breakdown; see [`NodeStats`](crate::node::NodeStats).
  pub fn get_stats(&self, node: NodeOff) -> crate::node::NodeStats {
    let mut stats = crate::node::NodeStats { node_count: 1, data_size: 0, data_total_size: 0 };
    match &self.node(node).kind {
      ShmKind::Null | ShmKind::Bool(_) | ShmKind::Int(_) | ShmKind::Double(_) => {
        stats.data_size = mem::size_of::<i64>();
        stats.data_total_size = SHM_HEADER;
      }
      ShmKind::Str(span) | ShmKind::SerializedArray(span) | ShmKind::SerializedObject(span) => {
        stats.data_size = span.len as usize;
        stats.data_total_size = SHM_HEADER + span.len as usize;
      }
      ShmKind::Vector(span) => {
        stats.data_total_size = SHM_HEADER + span.len as usize * mem::size_of::<ShmEntry>();
        for entry in self.entries(*span) {
          stats.add_child(&self.get_stats(entry.val));
        }
      }
      ShmKind::Map { entries, order } => {
        stats.data_total_size = SHM_HEADER
          + entries.len as usize * mem::size_of::<ShmEntry>()
          + order.len as usize * mem::size_of::<u32>();
        for entry in self.entries(*entries) {
          if let Some(key) = entry.key {
            stats.add_child(&self.get_stats(key));
          }
          stats.add_child(&self.get_stats(entry.val));
        }
      }
      ShmKind::Object { class, fields } => {
        stats.data_size = class.len as usize;
        stats.data_total_size =
          SHM_HEADER + class.len as usize + fields.len as usize * mem::size_of::<ShmEntry>();
        for entry in self.entries(*fields) {
          if let Some(key) = entry.key {
            stats.add_child(&self.get_stats(key));
          }
          stats.add_child(&self.get_stats(entry.val));
        }
      }
    }
    stats
  }
}

enum ShmKeyScalar<'a> {
  Int(i64),
  Str(&'a str),
}

impl ShmKeyScalar<'_> {
  fn cmp(&self, other: &ShmKeyScalar<'_>) -> Ordering {
    match (self, other) {
      (ShmKeyScalar::Int(a), ShmKeyScalar::Int(b)) => a.cmp(b),
      (ShmKeyScalar::Int(_), ShmKeyScalar::Str(_)) => Ordering::Less,
      (ShmKeyScalar::Str(_), ShmKeyScalar::Int(_)) => Ordering::Greater,
      (ShmKeyScalar::Str(a), ShmKeyScalar::Str(b)) => a.cmp(b),
    }
  }
}

// An owned key scalar used while a map's order table is being built,
// before the entries are committed to the region.
enum OwnedKey {
  Int(i64),
  Str(String),
}

impl OwnedKey {
  fn scalar(&self) -> ShmKeyScalar<'_> {
    match self {
      OwnedKey::Int(i) => ShmKeyScalar::Int(*i),
      OwnedKey::Str(s) => ShmKeyScalar::Str(s),
    }
  }
}
