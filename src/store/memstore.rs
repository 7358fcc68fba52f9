//! In-memory multi-version store.
//!
//! Values are kept as version chains ordered by commit sequence; a
//! snapshot pins a sequence and reads the newest version at or below it.
//! Live snapshots are registered with their start timestamps so the
//! database handle can answer the oldest-snapshot query that the
//! freshness revalidator depends on. Commits are validated against a
//! baseline sequence (optimistic callers) or pre-acquired key locks
//! (pessimistic callers); either way a commit is applied atomically under
//! the data lock and prunes version chains no live snapshot can observe.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::RangeOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    ts: u64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

type ColumnData = BTreeMap<Vec<u8>, Vec<Version>>;

#[derive(Debug, Default)]
struct StoreData {
    cfs: HashMap<String, ColumnData>,
}

/// The in-memory multi-version store.
#[derive(Debug)]
pub struct MemStore {
    data: RwLock<StoreData>,
    /// Live snapshots: id → start timestamp.
    snapshots: Mutex<BTreeMap<u64, u64>>,
    next_snapshot_id: AtomicU64,
    commit_seq: AtomicU64,
    /// Pessimistic row locks: (cf, key) → owning transaction.
    row_locks: Mutex<HashMap<(String, Vec<u8>), u64>>,
}

/// What a transaction asks the store to apply at commit.
#[derive(Debug)]
pub(crate) struct CommitRequest<'a> {
    /// Sequence the transaction based its reads and writes on; `None`
    /// skips validation (pessimistic callers hold row locks instead).
    pub baseline: Option<u64>,
    /// Keys whose history must not have advanced past the baseline.
    pub check: &'a [(String, Vec<u8>)],
    /// Buffered writes; `None` removes.
    pub writes: &'a HashMap<(String, Vec<u8>), Option<Vec<u8>>>,
    /// Commit timestamp stamped on every new version.
    pub ts: u64,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(StoreData::default()),
            snapshots: Mutex::new(BTreeMap::new()),
            next_snapshot_id: AtomicU64::new(1),
            commit_seq: AtomicU64::new(0),
            row_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Sequence of the most recent commit.
    pub(crate) fn current_seq(&self) -> u64 {
        self.commit_seq.load(Ordering::Acquire)
    }

    /// Registers a snapshot at the current sequence.
    pub(crate) fn snapshot(self: &Arc<Self>, ts: u64) -> Snapshot {
        let id = self.next_snapshot_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.snapshots.lock().insert(id, ts);
        Snapshot {
            store: Arc::clone(self),
            id,
            seq: self.current_seq(),
            ts,
        }
    }

    /// Start timestamp of the oldest live snapshot; 0 when none exist.
    pub(crate) fn oldest_snapshot_ts(&self) -> u64 {
        self.snapshots
            .lock()
            .values()
            .copied()
            .min()
            .unwrap_or(0)
    }

    fn release_snapshot(&self, id: u64) {
        let _ = self.snapshots.lock().remove(&id);
    }

    /// Newest committed version of a key: (sequence, timestamp, value).
    pub(crate) fn latest(
        &self,
        cf: &str,
        key: &[u8],
    ) -> Option<(u64, u64, Option<Vec<u8>>)> {
        let data = self.data.read();
        let versions = data.cfs.get(cf)?.get(key)?;
        let last = versions.last()?;
        Some((last.seq, last.ts, last.value.clone()))
    }

    /// Latest committed live value, for the cached read path.
    pub(crate) fn get_committed(&self, cf: &str, key: &[u8]) -> Option<(Vec<u8>, u64)> {
        match self.latest(cf, key) {
            Some((_, ts, Some(value))) => Some((value, ts)),
            _ => None,
        }
    }

    /// Takes (or re-takes) a pessimistic row lock. `Busy` when another
    /// transaction holds it.
    pub(crate) fn lock_row(&self, cf: &str, key: &[u8], txn: u64) -> Result<()> {
        let mut locks = self.row_locks.lock();
        match locks.get(&(cf.to_owned(), key.to_vec())) {
            Some(&owner) if owner != txn => Err(Error::busy(format!(
                "key is write-locked by transaction {owner}"
            ))),
            Some(_) => Ok(()),
            None => {
                let _ = locks.insert((cf.to_owned(), key.to_vec()), txn);
                Ok(())
            }
        }
    }

    /// Releases every row lock of `txn`.
    pub(crate) fn unlock_rows(&self, txn: u64) {
        self.row_locks.lock().retain(|_, &mut owner| owner != txn);
    }

    /// Releases every row lock; the close path.
    pub(crate) fn clear_row_locks(&self) {
        self.row_locks.lock().clear();
    }

    /// Validates and applies a commit, returning its sequence.
    pub(crate) fn commit(&self, req: CommitRequest<'_>) -> Result<u64> {
        let mut data = self.data.write();
        if let Some(baseline) = req.baseline {
            for (cf, key) in req.check.iter().chain(req.writes.keys()) {
                let advanced = data
                    .cfs
                    .get(cf)
                    .and_then(|col| col.get(key))
                    .and_then(|versions| versions.last())
                    .map(|v| v.seq > baseline)
                    .unwrap_or(false);
                if advanced {
                    return Err(Error::busy(
                        "a concurrent transaction committed to a key in this transaction's footprint",
                    ));
                }
            }
        }
        let seq = self.commit_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let no_snapshots = self.snapshots.lock().is_empty();
        for ((cf, key), value) in req.writes {
            let versions = data
                .cfs
                .entry(cf.clone())
                .or_default()
                .entry(key.clone())
                .or_default();
            versions.push(Version {
                seq,
                ts: req.ts,
                value: value.clone(),
            });
            // With no live snapshot only the newest version is observable.
            if no_snapshots && versions.len() > 1 {
                versions.drain(..versions.len() - 1);
            }
        }
        trace!(seq, writes = req.writes.len(), "applied commit");
        Ok(seq)
    }

    /// Drops every value in every column family.
    pub(crate) fn clear(&self) {
        self.data.write().cfs.clear();
    }

    /// Creates `cf` if absent.
    pub(crate) fn ensure_cf(&self, cf: &str) {
        let _ = self.data.write().cfs.entry(cf.to_owned()).or_default();
    }

    pub(crate) fn cf_names(&self) -> Vec<String> {
        self.data.read().cfs.keys().cloned().collect()
    }

    fn read_at(&self, cf: &str, key: &[u8], seq: u64) -> Option<Vec<u8>> {
        let data = self.data.read();
        let versions = data.cfs.get(cf)?.get(key)?;
        versions
            .iter()
            .rev()
            .find(|v| v.seq <= seq)
            .and_then(|v| v.value.clone())
    }

    fn range_at(&self, cf: &str, opts: &RangeOptions, seq: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let col = match data.cfs.get(cf) {
            Some(col) => col,
            None => return Vec::new(),
        };
        let lower = match &opts.start {
            Some(start) => Bound::Included(start.clone()),
            None => Bound::Unbounded,
        };
        let upper = match &opts.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        let visible = col.range((lower, upper)).filter_map(|(key, versions)| {
            versions
                .iter()
                .rev()
                .find(|v| v.seq <= seq)
                .and_then(|v| v.value.clone())
                .map(|value| (key.clone(), value))
        });
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = visible.collect();
        if opts.reverse {
            out.reverse();
        }
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        out
    }
}

/// A registered point-in-time view. Dropping it releases the registration
/// and lets the oldest-snapshot timestamp advance.
#[derive(Debug)]
pub struct Snapshot {
    store: Arc<MemStore>,
    id: u64,
    seq: u64,
    ts: u64,
}

impl Snapshot {
    /// Commit sequence this snapshot observes.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Registered start timestamp.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    pub fn get(&self, cf: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.store.read_at(cf, key, self.seq)
    }

    pub fn range(&self, cf: &str, opts: &RangeOptions) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store.range_at(cf, opts, self.seq)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.store.release_snapshot(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_CF;

    fn write(
        store: &Arc<MemStore>,
        key: &[u8],
        value: Option<&[u8]>,
        ts: u64,
    ) -> u64 {
        let mut writes = HashMap::new();
        let _ = writes.insert(
            (DEFAULT_CF.to_owned(), key.to_vec()),
            value.map(|v| v.to_vec()),
        );
        store
            .commit(CommitRequest {
                baseline: None,
                check: &[],
                writes: &writes,
                ts,
            })
            .unwrap()
    }

    #[test]
    fn snapshots_read_the_past() {
        let store = MemStore::new();
        write(&store, b"k", Some(b"v1"), 10);
        let snap = store.snapshot(100);
        write(&store, b"k", Some(b"v2"), 20);
        assert_eq!(snap.get(DEFAULT_CF, b"k"), Some(b"v1".to_vec()));
        assert_eq!(
            store.get_committed(DEFAULT_CF, b"k"),
            Some((b"v2".to_vec(), 20))
        );
    }

    #[test]
    fn tombstones_hide_values() {
        let store = MemStore::new();
        write(&store, b"k", Some(b"v"), 10);
        write(&store, b"k", None, 20);
        assert_eq!(store.get_committed(DEFAULT_CF, b"k"), None);
    }

    #[test]
    fn baseline_validation_detects_conflicts() {
        let store = MemStore::new();
        write(&store, b"k", Some(b"v1"), 10);
        let baseline = store.current_seq();
        write(&store, b"k", Some(b"v2"), 20);

        let mut writes = HashMap::new();
        let _ = writes.insert((DEFAULT_CF.to_owned(), b"k".to_vec()), Some(b"v3".to_vec()));
        let err = store
            .commit(CommitRequest {
                baseline: Some(baseline),
                check: &[],
                writes: &writes,
                ts: 30,
            })
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn read_set_validation_detects_conflicts() {
        let store = MemStore::new();
        write(&store, b"read-key", Some(b"v1"), 10);
        let baseline = store.current_seq();
        write(&store, b"read-key", Some(b"v2"), 20);

        let mut writes = HashMap::new();
        let _ = writes.insert(
            (DEFAULT_CF.to_owned(), b"other".to_vec()),
            Some(b"x".to_vec()),
        );
        let check = vec![(DEFAULT_CF.to_owned(), b"read-key".to_vec())];
        let err = store
            .commit(CommitRequest {
                baseline: Some(baseline),
                check: &check,
                writes: &writes,
                ts: 30,
            })
            .unwrap_err();
        assert!(err.is_busy());
    }

    #[test]
    fn row_locks_are_exclusive_and_reentrant() {
        let store = MemStore::new();
        store.lock_row(DEFAULT_CF, b"k", 1).unwrap();
        store.lock_row(DEFAULT_CF, b"k", 1).unwrap();
        assert!(store.lock_row(DEFAULT_CF, b"k", 2).unwrap_err().is_busy());
        store.unlock_rows(1);
        store.lock_row(DEFAULT_CF, b"k", 2).unwrap();
    }

    #[test]
    fn oldest_snapshot_tracks_registrations() {
        let store = MemStore::new();
        assert_eq!(store.oldest_snapshot_ts(), 0);
        let s1 = store.snapshot(100);
        let s2 = store.snapshot(200);
        assert_eq!(store.oldest_snapshot_ts(), 100);
        drop(s1);
        assert_eq!(store.oldest_snapshot_ts(), 200);
        drop(s2);
        assert_eq!(store.oldest_snapshot_ts(), 0);
    }

    #[test]
    fn range_respects_bounds_direction_and_limit() {
        let store = MemStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            write(&store, k, Some(k), 10);
        }
        let snap = store.snapshot(100);
        let opts = RangeOptions {
            start: Some(b"b".to_vec()),
            end: Some(b"d".to_vec()),
            ..RangeOptions::default()
        };
        let got = snap.range(DEFAULT_CF, &opts);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, b"b");

        let opts = RangeOptions {
            reverse: true,
            limit: Some(2),
            ..RangeOptions::default()
        };
        let got = snap.range(DEFAULT_CF, &opts);
        assert_eq!(got[0].0, b"d");
        assert_eq!(got.len(), 2);
    }
}
