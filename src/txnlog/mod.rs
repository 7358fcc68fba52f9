//! Durable per-database transaction logs.
//!
//! Each named log is a directory of append-only, block-structured files
//! plus a persisted commit state. Writers buffer entries per transaction in
//! a [`LogHandle`] and flush them on commit; readers obtain a [`LogReader`]
//! that binary-searches the files by timestamp and reassembles frames
//! across block and file boundaries from memory-mapped views.

mod file;
mod handle;
mod reader;
mod store;

pub use file::Frame;
pub use handle::LogHandle;
pub use reader::LogReader;
pub use store::{LogFileInfo, LogStore};

use std::time::Duration;

use crate::param::{DEFAULT_LOG_RETENTION, DEFAULT_MAX_AGE_THRESHOLD};

/// One visible entry yielded by a [`LogReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Stamp of the owning transaction (or an explicit per-entry override).
    pub timestamp: u64,
    /// The opaque payload passed to `add_entry`.
    pub data: Vec<u8>,
    /// True on the last entry of the owning transaction.
    pub end_of_txn: bool,
}

/// The byte span a commit occupied, across one or more files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogSpan {
    pub start_seq: u64,
    pub start_offset: u64,
    pub end_seq: u64,
    pub end_offset: u64,
}

impl LogSpan {
    /// True when the commit wrote no bytes (an empty transaction).
    pub fn is_empty(&self) -> bool {
        self.start_seq == self.end_seq && self.start_offset == self.end_offset
    }
}

/// Options of [`LogHandle::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Lowest timestamp of interest; absent means from the beginning.
    pub start: Option<u64>,
    /// Highest timestamp of interest, inclusive.
    pub end: Option<u64>,
    /// Filter every frame by timestamp instead of trusting log order;
    /// required when parallel transactions may have committed out of order.
    pub exact_start: bool,
    /// Exclude frames whose timestamp equals `start`.
    pub exclusive_start: bool,
    /// Begin at the persisted commit offset instead of a timestamp search.
    pub start_from_last_flushed: bool,
    /// Read past the persisted commit offset into unflushed bytes.
    pub read_uncommitted: bool,
}

/// Per-log tuning, derived from the database open options.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Rotate before a frame would push the file past this size; 0 disables
    /// rotation entirely.
    pub max_file_size: u64,
    /// Files whose age exceeds this window may be purged.
    pub retention: Duration,
    /// Fraction of the retention window after which the tail is rotated
    /// rather than letting a purge race it.
    pub max_age_threshold: f64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_file_size: 0,
            retention: DEFAULT_LOG_RETENTION,
            max_age_threshold: DEFAULT_MAX_AGE_THRESHOLD,
        }
    }
}
