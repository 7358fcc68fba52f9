//! Tunable constants and on-disk format parameters.

use std::time::Duration;

/// Magic token at the start of every transaction log file (`WOOF`, big-endian).
pub const LOG_TOKEN: u32 = 0x574F_4F46;

/// On-disk format version of transaction log files.
pub const LOG_VERSION: u16 = 1;

/// Default size of one log block, headers included.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the log file header: token (4), version (2), block size (4).
pub const FILE_HEADER_SIZE: usize = 10;

/// Size of a block header: earliest timestamp (8), flags (2), data offset (4).
pub const BLOCK_HEADER_SIZE: usize = 14;

/// Size of a frame header: timestamp (8), length (4).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Payload bytes carried by one block of the default size.
pub const BLOCK_BODY_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Bit of the frame length word marking the last frame of a transaction.
pub const END_OF_TXN_BIT: u32 = 1 << 31;

/// Maximum payload length of a single frame (length field sans the flag bit).
pub const MAX_FRAME_LEN: usize = (END_OF_TXN_BIT - 1) as usize;

/// Number of slots in the shared freshness table.
pub const TABLE_SLOTS: usize = 1 << 16;

/// Bytes per freshness slot.
pub const SLOT_BYTES: usize = 8;

/// Total size of the shared freshness table.
pub const TABLE_BYTES: usize = TABLE_SLOTS * SLOT_BYTES;

/// How long a recent-write slot stays uncacheable past the oldest snapshot.
pub const TRANSACTION_OVERLAP_BUFFER: Duration = Duration::from_secs(10);

/// Interval between revalidator sweeps over the freshness table.
pub const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Default soft budget of the local value cache, in bytes.
pub const DEFAULT_CACHE_BUDGET: usize = 16 << 20;

/// Default number of worker threads serving async operations.
pub const DEFAULT_WORKERS: usize = 4;

/// Default retention window for transaction log files.
pub const DEFAULT_LOG_RETENTION: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Default fraction of the retention window after which the active file is
/// rotated instead of letting a purge race the tail.
pub const DEFAULT_MAX_AGE_THRESHOLD: f64 = 0.75;

/// File name of the persisted commit state inside a log directory.
pub const TXN_STATE_FILE: &str = "txn.state";

/// Extension of transaction log files.
pub const LOG_FILE_EXT: &str = "txnlog";

/// Directory under the database path holding all transaction logs.
pub const TXN_LOG_DIR: &str = "transaction_logs";

/// File under the database path backing the shared freshness table.
pub const FRESHNESS_FILE: &str = "freshness.cache";
