//! The per-handle write surface of one log.
//!
//! Each `(database handle, log name)` pair owns one `LogHandle`. Entries
//! are buffered per transaction id and reach the store only on commit,
//! stamped and with the last entry flagged end-of-transaction; an abort
//! (or dropping the handle) discards the buffers without a trace on disk.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::store::LogStore;
use super::{Frame, LogFileInfo, LogReader, LogSpan, QueryOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::param::MAX_FRAME_LEN;
use crate::txn::TxnRegistry;

#[derive(Debug)]
struct BufferedEntry {
    /// Explicit stamp from `set_timestamp`, if one was in force.
    stamp: Option<u64>,
    payload: Vec<u8>,
}

/// The write surface of one log for one database handle.
#[derive(Debug)]
pub struct LogHandle {
    name: String,
    store: Arc<LogStore>,
    txns: Arc<TxnRegistry>,
    buffers: Mutex<HashMap<u64, Vec<BufferedEntry>>>,
}

impl LogHandle {
    pub(crate) fn new(name: String, store: Arc<LogStore>, txns: Arc<TxnRegistry>) -> Self {
        Self {
            name,
            store,
            txns,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffers `payload` for the transaction. The first entry binds the
    /// transaction to this log; a transaction already writing to a
    /// different log is refused.
    pub fn add_entry(&self, payload: &[u8], txn_id: u64) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("log entry of {} bytes exceeds the frame limit", payload.len()),
            ));
        }
        self.txns.bind_log(txn_id, &self.name)?;
        let stamp = self.txns.ts_override(txn_id);
        let mut buffers = self.buffers.lock();
        buffers.entry(txn_id).or_default().push(BufferedEntry {
            stamp,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    /// Entries currently buffered for `txn_id`.
    pub fn pending_entries(&self, txn_id: u64) -> usize {
        self.buffers.lock().get(&txn_id).map(Vec::len).unwrap_or(0)
    }

    /// Flushes the transaction's buffer: every entry without an explicit
    /// stamp takes `final_ts`, the last entry carries the end-of-txn flag.
    /// Returns the byte span and the largest stamp written.
    pub(crate) fn commit_txn(&self, txn_id: u64, final_ts: u64) -> Result<(LogSpan, u64)> {
        let entries = self.buffers.lock().remove(&txn_id).unwrap_or_default();
        if entries.is_empty() {
            return Ok((LogSpan::default(), final_ts));
        }
        let mut max_stamp = final_ts;
        let last = entries.len() - 1;
        let frames: Vec<Frame> = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let timestamp = entry.stamp.unwrap_or(final_ts);
                max_stamp = max_stamp.max(timestamp);
                Frame {
                    timestamp,
                    end_of_txn: i == last,
                    payload: entry.payload,
                }
            })
            .collect();
        let span = self.store.append_commit(&frames)?;
        trace!(log = %self.name, txn_id, frames = frames.len(), "committed log buffer");
        Ok((span, max_stamp))
    }

    /// Discards the transaction's buffer.
    pub(crate) fn abort_txn(&self, txn_id: u64) {
        let dropped = self.buffers.lock().remove(&txn_id);
        if let Some(dropped) = dropped {
            trace!(log = %self.name, txn_id, entries = dropped.len(), "dropped log buffer");
        }
    }

    /// Discards every buffer; the close path for this handle.
    pub(crate) fn clear_buffers(&self) {
        self.buffers.lock().clear();
    }

    /// A restartable reader over this log.
    pub fn query(&self, opts: QueryOptions) -> LogReader {
        LogReader::new(Arc::clone(&self.store), opts)
    }

    /// Names and sizes of this log's files.
    pub fn list_files(&self) -> Vec<LogFileInfo> {
        self.store.list_files()
    }

    pub(crate) fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    /// Flushes the store and persists the commit state.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        // Buffered-but-uncommitted transactions die with their handle.
        self.clear_buffers();
    }
}
