//! The underlying ordered key/value store.
//!
//! The engine core treats the store as a collaborator with a fixed
//! contract: column families addressed by name, multi-version values,
//! point-in-time snapshots registered for the oldest-snapshot query, and
//! commit-time (optimistic) or write-time (pessimistic) conflict
//! detection. [`MemStore`] is the in-process implementation of that
//! contract; a native LSM engine can be slotted in behind the same
//! surface.

mod memstore;

pub use memstore::{MemStore, Snapshot};

pub(crate) use memstore::CommitRequest;

/// Name of the column family used when none is given.
pub const DEFAULT_CF: &str = "default";

/// Bounds of a range read. `start` is inclusive, `end` exclusive; either
/// may be open. `limit` caps the number of returned entries after
/// direction is applied.
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub limit: Option<usize>,
    pub reverse: bool,
}
