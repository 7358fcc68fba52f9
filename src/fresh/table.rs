//! The shared-memory slot table.
//!
//! 2^16 slots of one 64-bit word each, file-backed and memory-mapped so
//! every handle on the database path (in this process or another) sees
//! the same words. A slot is in one of three states, distinguished by the
//! sign of its signed-integer reading:
//!
//! * `0` — empty: nothing known about the key.
//! * positive — a fresh tag: the hash of the newest `(key, version)`;
//!   readers holding a matching local entry may serve it from cache.
//! * negative — a write tag: the bit pattern of `-write_time_ms` as a
//!   double; caching is forbidden until the revalidator observes that no
//!   live snapshot predates the write.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::MmapMut;
use tracing::{debug, trace};

use crate::error::Result;
use crate::param::{TABLE_BYTES, TABLE_SLOTS, TRANSACTION_OVERLAP_BUFFER};

/// Encodes a write time as a slot word (negative as a signed integer).
pub(crate) fn write_tag(now_ms: u64) -> i64 {
    (-(now_ms as f64)).to_bits() as i64
}

/// True when the word is a write tag.
pub(crate) fn is_write_tag(word: i64) -> bool {
    word < 0
}

/// Recovers the write time of a write tag.
pub(crate) fn write_tag_time(word: i64) -> u64 {
    (-f64::from_bits(word as u64)) as u64
}

/// The mapped slot table of one database path.
pub struct FreshnessTable {
    mmap: MmapMut,
}

impl std::fmt::Debug for FreshnessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessTable").finish()
    }
}

impl FreshnessTable {
    /// Opens (creating and zero-filling if needed) the table file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(TABLE_BYTES as u64)?;
        // SAFETY: the mapping is shared on purpose; every access goes
        // through the atomic view below, single words only.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.display(), "opened freshness table");
        Ok(Self { mmap })
    }

    fn slots(&self) -> &[AtomicI64] {
        // SAFETY: the mapping is page-aligned and exactly TABLE_BYTES
        // long; AtomicI64 has no invalid bit patterns.
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr() as *const AtomicI64, TABLE_SLOTS) }
    }

    /// Current word of `index`.
    pub fn load(&self, index: usize) -> i64 {
        self.slots()[index].load(Ordering::SeqCst)
    }

    /// Publishes a fresh tag, but only if the slot still holds `prev`.
    /// Loses quietly to any concurrent writer.
    pub fn try_freshen(&self, index: usize, prev: i64, tag: u64) -> bool {
        self.slots()[index]
            .compare_exchange(prev, tag as i64, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the key's slot recently written at `now_ms`.
    pub fn mark_write(&self, index: usize, now_ms: u64) {
        self.slots()[index].store(write_tag(now_ms), Ordering::SeqCst);
    }

    /// One revalidator sweep: returns write-tagged slots to the empty
    /// state once no live snapshot can predate the recorded write.
    /// `oldest_snapshot_ms == 0` means no snapshot is live at all, in
    /// which case `now_ms` is the frontier. Returns the number of slots
    /// cleared.
    pub fn sweep(&self, oldest_snapshot_ms: u64, now_ms: u64) -> usize {
        let frontier = if oldest_snapshot_ms == 0 {
            now_ms
        } else {
            oldest_snapshot_ms
        };
        let overlap = TRANSACTION_OVERLAP_BUFFER.as_millis() as u64;
        let mut cleared = 0;
        for slot in self.slots() {
            let word = slot.load(Ordering::SeqCst);
            if is_write_tag(word) && write_tag_time(word).saturating_add(overlap) <= frontier {
                if slot
                    .compare_exchange(word, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    cleared += 1;
                }
            }
        }
        if cleared > 0 {
            trace!(cleared, "revalidator cleared write tags");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (tempfile::TempDir, FreshnessTable) {
        let dir = tempfile::tempdir().unwrap();
        let table = FreshnessTable::open(&dir.path().join("freshness.cache")).unwrap();
        (dir, table)
    }

    #[test]
    fn tags_round_trip() {
        let ts = 1_700_000_000_123u64;
        let tag = write_tag(ts);
        assert!(is_write_tag(tag));
        assert_eq!(write_tag_time(tag), ts);
        assert!(!is_write_tag(0));
        assert!(!is_write_tag(i64::MAX));
    }

    #[test]
    fn fresh_tags_survive_and_write_tags_override() {
        let (_dir, table) = table();
        assert_eq!(table.load(7), 0);
        assert!(table.try_freshen(7, 0, 12345));
        assert_eq!(table.load(7), 12345);
        // Stale CAS loses.
        assert!(!table.try_freshen(7, 0, 99));

        table.mark_write(7, 1_000_000);
        assert!(is_write_tag(table.load(7)));
        // A reader must not freshen over a write tag with a stale prev.
        assert!(!table.try_freshen(7, 12345, 42));
    }

    #[test]
    fn two_mappings_of_one_file_share_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freshness.cache");
        let a = FreshnessTable::open(&path).unwrap();
        let b = FreshnessTable::open(&path).unwrap();
        a.mark_write(100, 5_000);
        assert!(is_write_tag(b.load(100)));
        b.sweep(0, 5_000 + 11_000);
        assert_eq!(a.load(100), 0);
    }

    #[test]
    fn sweep_respects_the_overlap_buffer() {
        let (_dir, table) = table();
        table.mark_write(3, 100_000);
        // A snapshot older than write + overlap keeps the tag.
        assert_eq!(table.sweep(100_000 + 5_000, 200_000), 0);
        assert!(is_write_tag(table.load(3)));
        // Once the oldest snapshot passes the buffer, the slot clears.
        assert_eq!(table.sweep(100_000 + 10_000, 200_000), 1);
        assert_eq!(table.load(3), 0);
    }
}
