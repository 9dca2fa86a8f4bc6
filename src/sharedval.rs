//! Immutable, reference-counted value nodes for a runtime-wide value cache.
//!
//! A cache that hands previously-built values to many execution contexts needs
//! a representation that is immutable once built, cheap to share, and cheap to
//! turn back into an ordinary mutable value. This crate provides that
//! representation in two placements:
//!
//! - [`NodeStore`](store::NodeStore) keeps nodes on the normal process heap
//!   for thread-to-thread sharing. It performs no internal locking; the
//!   owning cache serializes access under its own lock.
//! - [`Segment`](shm::Segment) places the same node graph inside a
//!   relocatable arena in which every internal reference is a bounds-checked
//!   offset, so the graph stays valid no matter where the backing memory is
//!   mapped. Reference-count updates are serialized by a mutex embedded in
//!   the segment, since in-process atomics give no cross-process guarantee.
//!
//! Values convert in ([`from_local`](store::NodeStore::from_local)) and out
//! ([`to_local`](store::NodeStore::to_local)) of the shared form. Arrays that
//! alias themselves, and objects without snapshot support, fall back to an
//! opaque serialized blob; [`should_cache`](store::NodeStore::should_cache)
//! tells the cache when that happened so it re-deserializes on every read
//! instead of sharing structurally.

pub mod backend;
pub mod codec;
pub mod node;
pub mod shm;
pub mod store;
pub mod value;

#[cfg(test)]
mod codec_tests;
#[cfg(test)]
mod node_tests;
#[cfg(test)]
mod shm_tests;

pub use codec::CodecError;
pub use node::NodeStats;
pub use shm::{NodeOff, Segment};
pub use store::{NodeRef, NodeStore};
pub use value::{ArrayKey, Value};

/// Selects the storage family for array nodes whose keys are not the
/// sequence `0..len-1`. Threaded through construction explicitly; there is
/// no process-wide switch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BackendConfig {
  /// A single insertion-ordered map with hashed lookup. The default.
  #[default]
  Ordered,
  /// Two parallel lookup tables (string keys and integer keys) over parallel
  /// key/value sequences. Functionally equivalent to [`Self::Ordered`] with
  /// different performance tradeoffs; kept for deployments tuned against it.
  LegacyDualIndex,
}
