//! Range and sequential reads over a log's files.
//!
//! A reader is a lazy, restartable sequence of committed entries. The
//! starting file is found by binary search over each file's first-block
//! earliest timestamp, the starting block by binary search within the
//! chosen file; from there frames are reassembled by concatenating block
//! bodies (skipping block headers) across block and file boundaries.
//!
//! The iterator tolerates running past the current tail: it returns `None`
//! without losing its position, and a later call resumes with any frames
//! flushed in the meantime. Only bytes at or below the persisted commit
//! offset of the active file are visible unless `read_uncommitted` is set.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use tracing::{debug, warn};

use super::file::{block_count, parse_block, parse_frame_header, validate_file_header, BlockFlags};
use super::store::{FileMeta, LogStore};
use super::{LogEntry, QueryOptions};
use crate::error::{Error, Result};
use crate::param::{BLOCK_HEADER_SIZE, FILE_HEADER_SIZE, FRAME_HEADER_SIZE};

/// A mapped view of one log file.
struct Mapped {
    mmap: Mmap,
    /// Bytes present when the map was created; the file may have grown.
    phys: u64,
    block_size: usize,
}

impl std::fmt::Debug for Mapped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapped")
            .field("phys", &self.phys)
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Position within the log: a file sequence and an offset into that file's
/// logical body stream (block headers excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    seq: u64,
    logical: u64,
}

/// A restartable iterator over one log. See the module docs.
#[derive(Debug)]
pub struct LogReader {
    store: Arc<LogStore>,
    start: u64,
    end: u64,
    exact_start: bool,
    exclusive_start: bool,
    start_from_last_flushed: bool,
    read_uncommitted: bool,
    cursor: Option<Cursor>,
    maps: BTreeMap<u64, Mapped>,
    /// Fast path: still discarding frames below `start`.
    skipping: bool,
    /// Permanently exhausted (past `end` or a poisoned file).
    finished: bool,
}

impl LogReader {
    pub(crate) fn new(store: Arc<LogStore>, opts: QueryOptions) -> Self {
        Self {
            store,
            start: opts.start.unwrap_or(0),
            end: opts.end.unwrap_or(u64::MAX),
            exact_start: opts.exact_start,
            exclusive_start: opts.exclusive_start,
            start_from_last_flushed: opts.start_from_last_flushed,
            read_uncommitted: opts.read_uncommitted,
            cursor: None,
            maps: BTreeMap::new(),
            skipping: true,
            finished: false,
        }
    }

    /// Fetches the next visible entry, or `None` when the reader has caught
    /// up with the log tail. Unlike `Iterator::next`, `None` is not final:
    /// a later call picks up entries flushed since.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        if self.finished {
            return Ok(None);
        }
        let (files, active, committed) = self.store.reader_snapshot();
        if self.cursor.is_none() {
            self.cursor = match self.position(&files, active, committed) {
                Ok(cursor) => cursor,
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            if self.cursor.is_none() {
                // Nothing to read yet.
                return Ok(None);
            }
        }
        loop {
            let entry = match self.read_frame(&files, active, committed) {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            if self.exact_start {
                let past_start = if self.exclusive_start {
                    entry.timestamp > self.start
                } else {
                    entry.timestamp >= self.start
                };
                if past_start && entry.timestamp <= self.end {
                    return Ok(Some(entry));
                }
            } else {
                if self.skipping {
                    let before_start = if self.exclusive_start {
                        entry.timestamp <= self.start
                    } else {
                        entry.timestamp < self.start
                    };
                    if before_start {
                        continue;
                    }
                    self.skipping = false;
                }
                if entry.timestamp > self.end {
                    // Entries are assumed in order past this point.
                    self.finished = true;
                    return Ok(None);
                }
                return Ok(Some(entry));
            }
        }
    }

    /// Chooses the starting cursor. `Ok(None)` means the log has no data
    /// yet; positioning will be retried on the next call.
    fn position(
        &mut self,
        files: &[FileMeta],
        active: u64,
        committed: u64,
    ) -> Result<Option<Cursor>> {
        if files.is_empty() {
            return Ok(None);
        }
        let start = self.start;
        if self.start_from_last_flushed {
            let meta = match files.iter().find(|m| m.seq == active) {
                Some(meta) => meta,
                None => return Ok(None),
            };
            let mapped = self.ensure_map(meta, committed)?;
            let block_size = mapped.block_size;
            return Ok(Some(Cursor {
                seq: active,
                logical: logical_of_phys(committed, block_size),
            }));
        }

        // Binary search for the highest-sequence file whose first block's
        // earliest timestamp is at or below the start; everything earlier
        // cannot contain the range.
        let mut lo = 0usize;
        let mut hi = files.len();
        let mut found: Option<usize> = None;
        if start > 0 {
            while lo < hi {
                let mid = (lo + hi) / 2;
                let earliest = self.file_earliest(&files[mid], active, committed)?;
                if earliest <= start {
                    found = Some(mid);
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
        }
        let file_idx = found.unwrap_or(0);
        let meta = &files[file_idx];
        let visible = self.visible_phys(meta, active, committed);
        let mapped = self.ensure_map(meta, visible)?;
        let block_size = mapped.block_size;
        let body_len = (block_size - BLOCK_HEADER_SIZE) as u64;
        let nblocks = block_count(visible.min(mapped.phys), block_size);
        if nblocks == 0 {
            return Ok(Some(Cursor {
                seq: meta.seq,
                logical: 0,
            }));
        }

        // Binary search the blocks of the chosen file the same way.
        let data = &mapped.mmap[..];
        let len = visible.min(mapped.phys);
        let mut lo = 0u64;
        let mut hi = nblocks;
        let mut found: Option<u64> = None;
        if start > 0 {
            while lo < hi {
                let mid = (lo + hi) / 2;
                let block = parse_block(data, block_size, mid, len)?;
                if block.earliest <= start {
                    found = Some(mid);
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
        }
        let mut index = found.unwrap_or(0);
        // Parallel transactions may give neighboring blocks the same
        // earliest stamp; prefer the earliest of the run.
        while index > 0 {
            let here = parse_block(data, block_size, index, len)?.earliest;
            let prev = parse_block(data, block_size, index - 1, len)?.earliest;
            if prev == here {
                index -= 1;
            } else {
                break;
            }
        }
        // A frame continuing into the chosen block may itself carry the
        // boundary stamp; rewind to where it starts so it is decoded
        // rather than stepped over. Earlier frames are discarded by the
        // timestamp filter.
        while index > 0 {
            let block = parse_block(data, block_size, index, len)?;
            if block.flags.contains(BlockFlags::CONTINUATION) {
                index -= 1;
            } else {
                break;
            }
        }
        // Step to the first frame start at or after this block.
        let mut block_idx = index;
        let logical = loop {
            if block_idx >= nblocks {
                break block_idx * body_len;
            }
            let block = parse_block(data, block_size, block_idx, len)?;
            if !block.flags.contains(BlockFlags::CONTINUATION) {
                break block_idx * body_len;
            }
            let carry = u64::from(block.data_offset);
            if carry < body_len.min(block.body.len() as u64) {
                break block_idx * body_len + carry;
            }
            block_idx += 1;
        };
        debug!(
            log = self.store.name(),
            seq = meta.seq,
            block = block_idx,
            logical,
            "positioned log reader"
        );
        Ok(Some(Cursor {
            seq: meta.seq,
            logical,
        }))
    }

    /// Reassembles the frame at the cursor, advancing it on success.
    /// `Ok(None)` leaves the cursor in place: the frame is not (fully)
    /// flushed yet.
    fn read_frame(
        &mut self,
        files: &[FileMeta],
        active: u64,
        committed: u64,
    ) -> Result<Option<LogEntry>> {
        let mut cur = self.cursor.expect("cursor is positioned");
        let mut header = [0u8; FRAME_HEADER_SIZE];
        if !self.read_bytes(files, active, committed, &mut cur, &mut header)? {
            return Ok(None);
        }
        let (timestamp, len, end_of_txn) =
            parse_frame_header(&header).ok_or_else(|| Error::invalid_log_file("bad frame header"))?;
        if timestamp == 0 {
            // Zero padding past the last committed frame.
            return Ok(None);
        }
        let mut data = vec![0u8; len];
        if !self.read_bytes(files, active, committed, &mut cur, &mut data)? {
            return Ok(None);
        }
        self.cursor = Some(cur);
        Ok(Some(LogEntry {
            timestamp,
            data,
            end_of_txn,
        }))
    }

    /// Copies `out.len()` bytes of the logical stream at `cur`, crossing
    /// file boundaries. Returns false (cursor untouched by the caller's
    /// copy) when not enough visible bytes exist yet.
    fn read_bytes(
        &mut self,
        files: &[FileMeta],
        active: u64,
        committed: u64,
        cur: &mut Cursor,
        out: &mut [u8],
    ) -> Result<bool> {
        let mut filled = 0usize;
        let mut seq = cur.seq;
        let mut logical = cur.logical;
        while filled < out.len() {
            let meta = match files.iter().find(|m| m.seq == seq) {
                Some(meta) => meta,
                None => return Ok(false),
            };
            let visible = self.visible_phys(meta, active, committed);
            let mapped = self.ensure_map(meta, visible)?;
            let block_size = mapped.block_size;
            let body_len = (block_size - BLOCK_HEADER_SIZE) as u64;
            let len = visible.min(mapped.phys);
            let logical_len = logical_len(len, block_size);
            if logical >= logical_len {
                // Exhausted this file; continue in the next one, if any.
                match files.iter().find(|m| m.seq > seq) {
                    Some(next) if logical == logical_len => {
                        seq = next.seq;
                        logical = 0;
                        continue;
                    }
                    _ => return Ok(false),
                }
            }
            let take = ((logical_len - logical) as usize).min(out.len() - filled);
            let data = &mapped.mmap[..];
            let mut copied = 0usize;
            while copied < take {
                let pos = logical + copied as u64;
                let block = pos / body_len;
                let within = pos % body_len;
                let phys =
                    FILE_HEADER_SIZE as u64 + block * block_size as u64 + BLOCK_HEADER_SIZE as u64 + within;
                let run = ((body_len - within) as usize).min(take - copied);
                out[filled + copied..filled + copied + run]
                    .copy_from_slice(&data[phys as usize..phys as usize + run]);
                copied += run;
            }
            filled += take;
            logical += take as u64;
        }
        cur.seq = seq;
        cur.logical = logical;
        Ok(true)
    }

    fn visible_phys(&self, meta: &FileMeta, active: u64, committed: u64) -> u64 {
        if meta.seq == active && !self.read_uncommitted {
            committed
        } else {
            meta.size
        }
    }

    /// First-block earliest timestamp of a file; `u64::MAX` when the file
    /// holds no data.
    fn file_earliest(&mut self, meta: &FileMeta, active: u64, committed: u64) -> Result<u64> {
        let visible = self.visible_phys(meta, active, committed);
        if visible <= FILE_HEADER_SIZE as u64 {
            return Ok(u64::MAX);
        }
        let mapped = self.ensure_map(meta, visible)?;
        let block_size = mapped.block_size;
        let len = visible.min(mapped.phys);
        Ok(parse_block(&mapped.mmap[..], block_size, 0, len)?.earliest)
    }

    /// Maps (or remaps, after growth) the file behind `meta`.
    fn ensure_map(&mut self, meta: &FileMeta, min_len: u64) -> Result<&Mapped> {
        let needs_map = match self.maps.get(&meta.seq) {
            Some(mapped) => mapped.phys < min_len.max(meta.size),
            None => true,
        };
        if needs_map {
            let mapped = map_file(&meta.path)?;
            if mapped.phys < meta.size {
                warn!(
                    log = self.store.name(),
                    seq = meta.seq,
                    "log file shorter on disk than its recorded size"
                );
            }
            let _ = self.maps.insert(meta.seq, mapped);
            // Old sequences will not be read again once the cursor passes
            // them; drop their maps.
            let floor = self.cursor.map(|c| c.seq).unwrap_or(0);
            self.maps.retain(|&seq, _| seq + 1 >= floor);
        }
        Ok(self.maps.get(&meta.seq).expect("just inserted"))
    }
}

fn map_file(path: &Path) -> Result<Mapped> {
    let file = File::open(path)?;
    let phys = file.metadata()?.len();
    // SAFETY: the mapping is read-only; the writer only ever appends or
    // rewrites block headers in place, so any raced byte is either padding
    // or a header field we re-validate on use.
    let mmap = unsafe { Mmap::map(&file)? };
    let block_size = validate_file_header(&mmap[..], path)?;
    Ok(Mapped {
        mmap,
        phys,
        block_size,
    })
}

/// Logical body-stream length of a file `phys` bytes long.
fn logical_len(phys: u64, block_size: usize) -> u64 {
    let body_len = (block_size - BLOCK_HEADER_SIZE) as u64;
    let data = phys.saturating_sub(FILE_HEADER_SIZE as u64);
    let full = data / block_size as u64;
    let rem = data % block_size as u64;
    full * body_len + rem.saturating_sub(BLOCK_HEADER_SIZE as u64)
}

/// Logical position of a physical offset (which must not land inside a
/// block header).
fn logical_of_phys(phys: u64, block_size: usize) -> u64 {
    let body_len = (block_size - BLOCK_HEADER_SIZE) as u64;
    let data = phys.saturating_sub(FILE_HEADER_SIZE as u64);
    let full = data / block_size as u64;
    let rem = data % block_size as u64;
    full * body_len + rem.saturating_sub(BLOCK_HEADER_SIZE as u64)
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
