//! woofdb: an embeddable MVCC key-value engine core.
//!
//! A single [`Database`] handle fronts three tightly coupled subsystems:
//!
//! * **Transactions** ([`Transaction`]) — buffered writes over a
//!   multi-version store with optimistic (commit-time `BUSY`) or
//!   pessimistic (write-time `BUSY`) conflict detection and a monotonic
//!   commit timestamp.
//! * **Transaction logs** ([`LogHandle`], [`LogReader`]) — durable,
//!   append-only, block-structured logs with rotation, retention, crash
//!   recovery, and binary-searched range reads over memory-mapped files.
//! * **Freshness** ([`FreshnessTable`]) — a fixed shared-memory slot
//!   table coordinating every handle's local value cache against writes
//!   from any thread or process on the same path.
//!
//! ```no_run
//! use woofdb::{Database, DbOptions};
//!
//! # fn main() -> woofdb::Result<()> {
//! let db = Database::open("./data", DbOptions::default())?;
//! let log = db.use_log("audit")?;
//! db.transaction(|txn| {
//!     txn.put(b"greeting", b"hello")?;
//!     log.add_entry(b"greeting written", txn.id())?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

mod clock;
mod db;
mod error;
mod fresh;
mod key;
mod locktab;
mod param;
mod shbuf;
mod store;
mod txn;
mod txnlog;
mod util;
mod worker;

pub use clock::MonotonicClock;
pub use db::{
    set_block_cache_size, shutdown, Database, DbOptions, ListenerCallback, LogListing,
    PurgeOptions, StatsLevel, StatsSnapshot,
};
pub use error::{Error, ErrorKind, Result};
pub use fresh::FreshnessTable;
pub use key::CacheKey;
pub use locktab::ReleaseCallback;
pub use shbuf::{BufferCallback, SharedBuffer};
pub use store::{MemStore, RangeOptions, Snapshot, DEFAULT_CF};
pub use txn::Transaction;
pub use txnlog::{
    Frame, LogConfig, LogEntry, LogFileInfo, LogHandle, LogReader, LogSpan, QueryOptions,
};
