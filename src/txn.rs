//! Transactions.
//!
//! A transaction buffers writes against the underlying store and log
//! entries against at most one transaction log, then commits both
//! atomically or discards both. Conflict detection follows the mode the
//! database was opened with: optimistic transactions validate their read
//! and write footprint against a baseline sequence at commit (`BUSY` on
//! commit), pessimistic transactions take row locks as they write (`BUSY`
//! at the write). The snapshot is acquired lazily on the first read in
//! optimistic mode and eagerly on the first write in pessimistic mode,
//! which is what moves the oldest-snapshot timestamp differently between
//! the two.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::db::DbCore;
use crate::error::{Error, ErrorKind, Result};
use crate::store::{CommitRequest, RangeOptions, Snapshot};
use crate::txnlog::LogHandle;

/// Registry of live transactions on one database handle: which log (if
/// any) each is bound to, and its current per-entry stamp override.
#[derive(Debug, Default)]
pub(crate) struct TxnRegistry {
    inner: Mutex<HashMap<u64, TxnSlot>>,
}

#[derive(Debug, Default)]
struct TxnSlot {
    bound_log: Option<String>,
    ts_override: Option<u64>,
}

impl TxnRegistry {
    pub fn register(&self, id: u64) {
        let _ = self.inner.lock().insert(id, TxnSlot::default());
    }

    pub fn deregister(&self, id: u64) {
        let _ = self.inner.lock().remove(&id);
    }

    /// Binds `id` to `log`. A transaction writes to at most one log;
    /// binding the same name again is a no-op, a different name fails.
    pub fn bind_log(&self, id: u64, log: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.get_mut(&id).ok_or_else(|| Error::unknown_txn(id))?;
        match &slot.bound_log {
            Some(bound) if bound != log => Err(Error::log_already_bound(bound)),
            Some(_) => Ok(()),
            None => {
                slot.bound_log = Some(log.to_owned());
                Ok(())
            }
        }
    }

    pub fn bound_log(&self, id: u64) -> Option<String> {
        self.inner.lock().get(&id).and_then(|s| s.bound_log.clone())
    }

    pub fn set_override(&self, id: u64, ts: u64) {
        if let Some(slot) = self.inner.lock().get_mut(&id) {
            slot.ts_override = Some(ts);
        }
    }

    pub fn ts_override(&self, id: u64) -> Option<u64> {
        self.inner.lock().get(&id).and_then(|s| s.ts_override)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A unit of work against the store and at most one transaction log.
#[derive(Debug)]
pub struct Transaction {
    core: Arc<DbCore>,
    id: u64,
    pessimistic: bool,
    state: TxnState,
    snapshot: Option<Snapshot>,
    /// Sequence the conflict check validates against (optimistic only).
    baseline: Option<u64>,
    /// Keys read under the snapshot (optimistic only).
    reads: Vec<(String, Vec<u8>)>,
    /// Buffered writes; `None` removes.
    writes: HashMap<(String, Vec<u8>), Option<Vec<u8>>>,
    /// Sampled at the first write.
    timestamp: Option<u64>,
    /// Largest explicit stamp set via `set_timestamp`.
    max_override: u64,
    log: Option<Arc<LogHandle>>,
}

impl Transaction {
    pub(crate) fn begin(core: Arc<DbCore>, id: u64, pessimistic: bool) -> Self {
        core.txns.register(id);
        trace!(id, pessimistic, "transaction started");
        Self {
            core,
            id,
            pessimistic,
            state: TxnState::Active,
            snapshot: None,
            baseline: None,
            reads: Vec::new(),
            writes: HashMap::new(),
            timestamp: None,
            max_override: 0,
            log: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    /// The transaction's timestamp, once a write has sampled it.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    fn default_cf(&self) -> &str {
        &self.core.cf
    }

    fn ensure_snapshot(&mut self) {
        if self.snapshot.is_none() {
            let snapshot = self.core.store.snapshot(self.core.clock.now());
            if self.baseline.is_none() {
                self.baseline = Some(snapshot.seq());
            }
            self.snapshot = Some(snapshot);
        }
    }

    fn check_writable(&self) -> Result<bool> {
        self.core.check_open()?;
        match self.state {
            TxnState::Active => Ok(true),
            // Writes after an abort are dropped quietly.
            TxnState::Aborted => Ok(false),
            TxnState::Committed => Err(Error::invalid_argument(
                "transaction has already committed",
            )),
        }
    }

    /// Buffers a write of `value` under `key` in the default column family.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.default_cf().to_owned();
        self.put_in(&cf, key, value)
    }

    /// Buffers a write in the named column family.
    pub fn put_in(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(cf, key, Some(value.to_vec()))
    }

    /// Buffers a removal in the default column family.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let cf = self.default_cf().to_owned();
        self.remove_in(&cf, key)
    }

    /// Buffers a removal in the named column family.
    pub fn remove_in(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        self.write(cf, key, None)
    }

    fn write(&mut self, cf: &str, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        if !self.check_writable()? {
            return Ok(());
        }
        if key.is_empty() {
            return Err(Error::key_required());
        }
        if self.pessimistic {
            // Record locks surface conflicts at the write itself; the
            // snapshot is pinned eagerly so later reads see pre-lock state.
            self.ensure_snapshot();
            self.core.store.lock_row(cf, key, self.id)?;
        } else if self.baseline.is_none() {
            self.baseline = Some(self.core.store.current_seq());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(self.core.clock.now());
        }
        let _ = self
            .writes
            .insert((cf.to_owned(), key.to_vec()), value);
        Ok(())
    }

    /// Reads `key` from the transaction's snapshot, seeing its own
    /// buffered writes first.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.default_cf().to_owned();
        self.get_in(&cf, key)
    }

    /// Reads from the named column family.
    pub fn get_in(&mut self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.check_open()?;
        if self.state != TxnState::Active {
            return Err(Error::invalid_argument("transaction is not active"));
        }
        if key.is_empty() {
            return Err(Error::key_required());
        }
        if let Some(value) = self.writes.get(&(cf.to_owned(), key.to_vec())) {
            return Ok(value.clone());
        }
        self.ensure_snapshot();
        if !self.pessimistic {
            self.reads.push((cf.to_owned(), key.to_vec()));
        }
        Ok(self
            .snapshot
            .as_ref()
            .expect("snapshot acquired above")
            .get(cf, key))
    }

    /// Range read from the snapshot, overlaid with buffered writes.
    pub fn get_range(&mut self, opts: &RangeOptions) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.default_cf().to_owned();
        self.get_range_in(&cf, opts)
    }

    pub fn get_range_in(
        &mut self,
        cf: &str,
        opts: &RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.core.check_open()?;
        if self.state != TxnState::Active {
            return Err(Error::invalid_argument("transaction is not active"));
        }
        self.ensure_snapshot();
        let unbounded = RangeOptions {
            start: opts.start.clone(),
            end: opts.end.clone(),
            limit: None,
            reverse: false,
        };
        let snapshot = self.snapshot.as_ref().expect("snapshot acquired above");
        let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> =
            snapshot.range(cf, &unbounded).into_iter().collect();
        for ((wcf, key), value) in &self.writes {
            if wcf != cf {
                continue;
            }
            let below = opts.start.as_ref().map(|s| key < s).unwrap_or(false);
            let above = opts.end.as_ref().map(|e| key >= e).unwrap_or(false);
            if below || above {
                continue;
            }
            match value {
                Some(value) => {
                    let _ = merged.insert(key.clone(), value.clone());
                }
                None => {
                    let _ = merged.remove(key);
                }
            }
        }
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = merged.into_iter().collect();
        if !self.pessimistic {
            for (key, _) in &out {
                self.reads.push((cf.to_owned(), key.clone()));
            }
        }
        if opts.reverse {
            out.reverse();
        }
        if let Some(limit) = opts.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Returns (creating or rebinding if needed) the one log handle this
    /// transaction writes to. A second, differently-named log fails with
    /// `LOG_ALREADY_BOUND_TO_TXN`.
    pub fn use_log(&mut self, name: &str) -> Result<Arc<LogHandle>> {
        self.core.check_open()?;
        if self.state != TxnState::Active {
            return Err(Error::invalid_argument("transaction is not active"));
        }
        self.core.txns.bind_log(self.id, name)?;
        let handle = self.core.log_handle(name)?;
        self.log = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Forces the stamp of entries buffered from now on; earlier entries
    /// keep the commit's final timestamp.
    pub fn set_timestamp(&mut self, ts: u64) {
        self.core.txns.set_override(self.id, ts);
        self.max_override = self.max_override.max(ts);
    }

    fn bound_handle(&self) -> Result<Option<Arc<LogHandle>>> {
        if let Some(handle) = &self.log {
            return Ok(Some(Arc::clone(handle)));
        }
        match self.core.txns.bound_log(self.id) {
            Some(name) => Ok(Some(self.core.log_handle(&name)?)),
            None => Ok(None),
        }
    }

    /// Commits buffered writes and log entries. In optimistic mode a
    /// conflicting concurrent commit surfaces here as `BUSY`; the
    /// transaction stays usable, with a fresh baseline, for a retry.
    pub fn commit(&mut self) -> Result<u64> {
        self.core.check_open()?;
        match self.state {
            TxnState::Active => {}
            TxnState::Aborted => {
                return Err(Error::invalid_argument("transaction was aborted"))
            }
            TxnState::Committed => {
                return Err(Error::invalid_argument("transaction has already committed"))
            }
        }
        let final_ts = self
            .timestamp
            .unwrap_or_else(|| self.core.clock.now());

        if !self.writes.is_empty() {
            let baseline = if self.pessimistic {
                None
            } else {
                self.baseline
            };
            let request = CommitRequest {
                baseline,
                check: &self.reads,
                writes: &self.writes,
                ts: final_ts,
            };
            if let Err(err) = self.core.store.commit(request) {
                if err.kind() == ErrorKind::Busy {
                    // Refresh the basis so the caller can re-read and
                    // retry this same transaction.
                    self.snapshot = None;
                    self.reads.clear();
                    self.baseline = Some(self.core.store.current_seq());
                    self.core.stats.conflict();
                }
                return Err(err);
            }
        }

        let mut callback_ts = final_ts.max(self.max_override);
        if let Some(handle) = self.bound_handle()? {
            let (span, max_stamp) = handle.commit_txn(self.id, final_ts)?;
            callback_ts = callback_ts.max(max_stamp);
            debug!(
                id = self.id,
                log = handle.name(),
                ?span,
                "transaction log entries flushed"
            );
        }

        // Tag every written key as recently written so no stale cache
        // entry survives, then release everything.
        for ((cf, key), _) in &self.writes {
            if cf == &self.core.cf {
                self.core.invalidate_written_key(key);
            }
        }
        if self.pessimistic {
            self.core.store.unlock_rows(self.id);
        }
        self.core.txns.deregister(self.id);
        self.snapshot = None;
        self.state = TxnState::Committed;
        self.core.stats.commit();
        trace!(id = self.id, ts = final_ts, "transaction committed");
        Ok(callback_ts)
    }

    /// Async variant of [`Transaction::commit`], run on a worker thread.
    /// Consumes the transaction: a conflict (`BUSY`) aborts it, and the
    /// caller retries with a fresh transaction.
    pub async fn commit_async(mut self) -> Result<u64> {
        let core = Arc::clone(&self.core);
        core.run_job(move || {
            let result = self.commit();
            if result.is_err() {
                let _ = self.abort();
            }
            result
        })
        .await
    }

    /// Discards buffered writes and log entries. Idempotent; works during
    /// close so teardown always succeeds.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != TxnState::Active {
            return Ok(());
        }
        self.writes.clear();
        self.reads.clear();
        self.snapshot = None;
        if let Ok(Some(handle)) = self.bound_handle() {
            handle.abort_txn(self.id);
        }
        if self.pessimistic {
            self.core.store.unlock_rows(self.id);
        }
        self.core.txns.deregister(self.id);
        self.state = TxnState::Aborted;
        trace!(id = self.id, "transaction aborted");
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            let _ = self.abort();
        }
    }
}
