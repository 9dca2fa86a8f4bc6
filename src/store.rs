//! The slab that heap-resident nodes live in.
//!
//! Slots hold the node payload and its reference count side by side; freed
//! slot indices are kept on a free list and reused by later insertions.
//! Each slot carries a generation counter, bumped on every release, and a
//! handle carries the generation it was minted under, so a handle into a
//! recycled slot is detectable instead of silently naming the new tenant.
//!
//! # Synchronization contract
//!
//! A [`NodeStore`] performs no internal locking. The reference count is an
//! ordinary integer: the owning cache must serialize every `retain`,
//! `release`, and structural read on a given store under its own lock
//! (typically the one cache-wide lock it already holds around its table).
//! Wrapping the store in that lock makes the contract enforceable by the
//! borrow checker; nothing here is safe to share without it.

use crate::node::SharedNode;

/// A copyable handle to a node owned by a [`NodeStore`]. The generation
/// pins the handle to one tenancy of its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
  pub(crate) index: usize,
  pub(crate) gen: u32,
}

pub(crate) struct Slot {
  pub node: SharedNode,
  pub count: u32,
}

/// Owns every heap-resident shared node and its reference count.
#[derive(Default)]
pub struct NodeStore {
  slots: Vec<Option<Slot>>,
  gens: Vec<u32>,
  free: Vec<usize>,
  live: usize,
}

impl NodeStore {
  pub fn new() -> NodeStore {
    NodeStore::default()
  }

  pub fn with_capacity(capacity: usize) -> NodeStore {
    NodeStore {
      slots: Vec::with_capacity(capacity),
      gens: Vec::with_capacity(capacity),
      free: Vec::new(),
      live: 0,
    }
  }

  /// Number of live nodes currently stored.
  pub fn len(&self) -> usize {
    self.live
  }

  pub fn is_empty(&self) -> bool {
    self.live == 0
  }

  /// True when `node` refers to a live slot of the same generation the
  /// handle was minted under.
  pub fn contains(&self, node: NodeRef) -> bool {
    self.gens.get(node.index) == Some(&node.gen) && self.slots[node.index].is_some()
  }

  /// Stores a node with an initial reference count of 1.
  pub(crate) fn insert(&mut self, node: SharedNode) -> NodeRef {
    self.live += 1;
    let slot = Slot { node, count: 1 };
    match self.free.pop() {
      Some(index) => {
        debug_assert!(self.slots[index].is_none(), "free list pointed at a live slot");
        self.slots[index] = Some(slot);
        NodeRef { index, gen: self.gens[index] }
      }
      None => {
        self.slots.push(Some(slot));
        self.gens.push(0);
        NodeRef { index: self.slots.len() - 1, gen: 0 }
      }
    }
  }

  fn check_gen(&self, node: NodeRef) {
    if self.gens.get(node.index) != Some(&node.gen) {
      panic!("invalid node reference {}", node.index);
    }
  }

  pub(crate) fn slot(&self, node: NodeRef) -> &Slot {
    self.check_gen(node);
    self.slots[node.index]
      .as_ref()
      .unwrap_or_else(|| panic!("invalid node reference {}", node.index))
  }

  pub(crate) fn slot_mut(&mut self, node: NodeRef) -> &mut Slot {
    self.check_gen(node);
    self.slots[node.index]
      .as_mut()
      .unwrap_or_else(|| panic!("invalid node reference {}", node.index))
  }

  pub(crate) fn node(&self, node: NodeRef) -> &SharedNode {
    &self.slot(node).node
  }

  /// Current reference count of `node`.
  pub fn ref_count(&self, node: NodeRef) -> u32 {
    self.slot(node).count
  }

  /// Increments the reference count.
  pub fn retain(&mut self, node: NodeRef) {
    self.slot_mut(node).count += 1;
  }

  /// Decrements the reference count. Reaching zero removes the node and
  /// releases every owned child exactly once, recursively; the slot index
  /// becomes reusable under a new generation, so handles into the old
  /// tenancy stop validating.
  pub fn release(&mut self, node: NodeRef) {
    let slot = self.slot_mut(node);
    if slot.count > 1 {
      slot.count -= 1;
      return;
    }
    let slot = self.slots[node.index]
      .take()
      .unwrap_or_else(|| panic!("invalid node reference {}", node.index));
    self.live -= 1;
    self.gens[node.index] = self.gens[node.index].wrapping_add(1);
    self.free.push(node.index);
    let mut children = Vec::new();
    slot.node.kind.owned_children(&mut children);
    for child in children {
      self.release(child);
    }
  }
}
