//! File management for one named log.
//!
//! A log lives in `{logs_dir}/{name}/` as `1.txnlog`, `2.txnlog`, … plus
//! `txn.state`, eight little-endian bytes recording the last committed
//! offset in the active file and the active sequence. Appends are
//! serialized; rotation happens when a frame would push the active file
//! past its size limit, or when the file's age approaches the retention
//! window. On open, files past retention are purged and the tail is
//! recovered: bytes beyond the persisted commit offset (or, without a
//! usable state file, beyond the last complete frame) are uncommitted
//! residue that the next append overwrites.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::file::{
    block_count, parse_block, parse_frame_header, validate_file_header, AppendProgress,
    BlockFlags, Frame, FrameStream, LogFile,
};
use super::{LogConfig, LogSpan};
use crate::error::{Error, Result};
use crate::param::{
    BLOCK_HEADER_SIZE, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, LOG_FILE_EXT, TXN_STATE_FILE,
};

/// Name and size of one on-disk log file, as reported by `list_logs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileInfo {
    pub name: String,
    pub seq: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct FileMeta {
    pub seq: u64,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug)]
struct StoreInner {
    /// Sealed files plus the tail, ordered by sequence.
    files: Vec<FileMeta>,
    /// The only file open for append.
    tail: Option<LogFile>,
    /// When the tail was first written, for age-based rotation.
    tail_born: SystemTime,
    last_committed: u64,
    active_seq: u64,
}

/// All files of one named log.
#[derive(Debug)]
pub struct LogStore {
    name: String,
    dir: PathBuf,
    config: LogConfig,
    inner: Mutex<StoreInner>,
}

impl LogStore {
    /// Opens (creating if needed) the directory of log `name`, purging
    /// expired files and recovering the tail.
    pub(crate) fn open(logs_dir: &Path, name: &str, config: LogConfig) -> Result<Self> {
        validate_log_name(name)?;
        let dir = logs_dir.join(name);
        fs::create_dir_all(&dir)?;

        let mut files = enumerate_files(&dir)?;
        let state = read_state(&dir.join(TXN_STATE_FILE));

        // Retention purge, never touching the file holding the committed
        // offset or anything newer. Without a state file the tail itself is
        // the committed frontier.
        let cutoff = SystemTime::now()
            .checked_sub(config.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let tail_seq = files.last().map(|m| m.seq).unwrap_or(0);
        let protected_from = state.map(|(_, seq)| seq.min(tail_seq)).unwrap_or(tail_seq);
        files.retain(|meta| {
            let expired = meta.modified < cutoff && meta.seq < protected_from;
            if expired {
                info!(log = name, seq = meta.seq, "purging expired log file");
                if let Err(err) = fs::remove_file(&meta.path) {
                    warn!(log = name, seq = meta.seq, %err, "failed to purge log file");
                    return true;
                }
            }
            !expired
        });

        let mut inner = StoreInner {
            files,
            tail: None,
            tail_born: SystemTime::now(),
            last_committed: 0,
            active_seq: 0,
        };

        if let Some(meta) = inner.files.last().cloned() {
            let committed = match state {
                Some((offset, seq)) if seq == meta.seq => Some(u64::from(offset)),
                _ => None,
            };
            let opened = LogFile::open(&meta.path, meta.seq, committed).and_then(|mut tail| {
                if committed.is_none() {
                    // No usable state: walk the frames to find the last
                    // complete one and resume there.
                    let valid = scan_valid_len(&fs::read(&meta.path)?)?;
                    if valid < tail.len() {
                        warn!(
                            log = name,
                            seq = meta.seq,
                            valid,
                            physical = tail.len(),
                            "partial frame at log tail; later bytes will be overwritten"
                        );
                        tail = LogFile::open(&meta.path, meta.seq, Some(valid))?;
                    }
                }
                Ok(tail)
            });
            match opened {
                Ok(tail) => {
                    inner.tail_born = fs::metadata(&meta.path)
                        .and_then(|m| m.created().or_else(|_| m.modified()))
                        .unwrap_or_else(|_| SystemTime::now());
                    inner.last_committed = tail.len();
                    inner.active_seq = tail.seq();
                    inner.tail = Some(tail);
                }
                Err(err) => {
                    // The log stays usable: this sequence is unreadable,
                    // appends continue in a fresh file, and a purge clears
                    // the damage. Readers surface the error on contact.
                    warn!(log = name, seq = meta.seq, %err, "tail file is unreadable; appends will start a new file");
                    inner.active_seq = meta.seq;
                    inner.last_committed = 0;
                }
            }
        }

        Ok(Self {
            name: name.to_owned(),
            dir,
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one committed transaction's frames, rotating as required,
    /// syncing every touched file, and persisting the commit state.
    pub(crate) fn append_commit(&self, frames: &[Frame]) -> Result<LogSpan> {
        let mut stream = FrameStream::new(frames)?;
        let mut inner = self.inner.lock();

        if stream.is_empty() {
            let seq = inner.active_seq;
            let offset = inner.last_committed;
            return Ok(LogSpan {
                start_seq: seq,
                start_offset: offset,
                end_seq: seq,
                end_offset: offset,
            });
        }

        self.ensure_tail(&mut inner)?;
        // Age-based rotation: hand a nearly-expired tail over to retention
        // instead of appending into it.
        let age_limit = self.config.retention.mul_f64(self.config.max_age_threshold);
        if self.config.max_file_size != 0
            && inner.tail_born.elapsed().unwrap_or(Duration::ZERO) > age_limit
        {
            debug!(log = %self.name, "rotating log file past its age limit");
            self.rotate(&mut inner)?;
        }

        let cap = match self.config.max_file_size {
            0 => None,
            max => Some(max),
        };

        let mut span: Option<LogSpan> = None;
        loop {
            let tail = inner.tail.as_mut().expect("tail exists during append");
            let (start, end, progress) = tail.append_from(&mut stream, cap)?;
            tail.sync()?;
            if end > start {
                let seq = tail.seq();
                let s = span.get_or_insert(LogSpan {
                    start_seq: seq,
                    start_offset: start,
                    end_seq: seq,
                    end_offset: end,
                });
                s.end_seq = seq;
                s.end_offset = end;
            }
            if stream.is_empty() && progress == AppendProgress::Complete {
                break;
            }
            self.rotate(&mut inner)?;
        }

        let tail = inner.tail.as_ref().expect("tail exists after append");
        let tail_len = tail.len();
        let tail_seq = tail.seq();
        inner.last_committed = tail_len;
        inner.active_seq = tail_seq;
        self.sync_tail_meta(&mut inner);
        write_state(
            &self.dir,
            inner.last_committed.min(u64::from(u32::MAX)) as u32,
            inner.active_seq.min(u64::from(u32::MAX)) as u32,
        )?;
        Ok(span.unwrap_or_default())
    }

    fn ensure_tail(&self, inner: &mut StoreInner) -> Result<()> {
        if inner.tail.is_some() {
            return Ok(());
        }
        let seq = inner.files.last().map(|m| m.seq + 1).unwrap_or(1);
        let path = self.dir.join(format!("{seq}.{LOG_FILE_EXT}"));
        let tail = LogFile::create(&path, seq)?;
        inner.files.push(FileMeta {
            seq,
            path,
            size: tail.len(),
            modified: SystemTime::now(),
        });
        inner.tail_born = SystemTime::now();
        inner.active_seq = seq;
        inner.last_committed = tail.len();
        inner.tail = Some(tail);
        Ok(())
    }

    fn rotate(&self, inner: &mut StoreInner) -> Result<()> {
        self.sync_tail_meta(inner);
        inner.tail = None;
        self.ensure_tail(inner)
    }

    fn sync_tail_meta(&self, inner: &mut StoreInner) {
        if let Some(tail) = &inner.tail {
            let seq = tail.seq();
            let len = tail.len();
            if let Some(meta) = inner.files.iter_mut().find(|m| m.seq == seq) {
                meta.size = len;
                meta.modified = SystemTime::now();
            }
        }
    }

    /// Syncs the tail and persists the commit state.
    pub(crate) fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(tail) = &inner.tail {
            tail.sync()?;
            write_state(
                &self.dir,
                inner.last_committed.min(u64::from(u32::MAX)) as u32,
                inner.active_seq.min(u64::from(u32::MAX)) as u32,
            )?;
        }
        Ok(())
    }

    /// A point-in-time view of the file set for readers.
    pub(crate) fn reader_snapshot(&self) -> (Vec<FileMeta>, u64, u64) {
        let inner = self.inner.lock();
        (inner.files.clone(), inner.active_seq, inner.last_committed)
    }

    /// Names and sizes of the on-disk files, in sequence order.
    pub fn list_files(&self) -> Vec<LogFileInfo> {
        let inner = self.inner.lock();
        inner
            .files
            .iter()
            .map(|meta| LogFileInfo {
                name: format!("{}.{LOG_FILE_EXT}", meta.seq),
                seq: meta.seq,
                size: meta.size,
            })
            .collect()
    }

    /// Deletes files older than `before` (defaulting to the retention
    /// cutoff). The file holding the committed offset and newer files are
    /// never purged. With `destroy`, removes the whole log directory.
    pub(crate) fn purge(&self, before: Option<SystemTime>, destroy: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if destroy {
            inner.tail = None;
            inner.files.clear();
            inner.last_committed = 0;
            inner.active_seq = 0;
            fs::remove_dir_all(&self.dir)?;
            info!(log = %self.name, "destroyed log");
            return Ok(());
        }
        let cutoff = before.unwrap_or_else(|| {
            SystemTime::now()
                .checked_sub(self.config.retention)
                .unwrap_or(SystemTime::UNIX_EPOCH)
        });
        let protected_from = inner.active_seq;
        let mut removed = 0u32;
        inner.files.retain(|meta| {
            let expired = meta.modified < cutoff && meta.seq < protected_from;
            if expired {
                if let Err(err) = fs::remove_file(&meta.path) {
                    warn!(log = %self.name, seq = meta.seq, %err, "failed to purge log file");
                    return true;
                }
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            info!(log = %self.name, removed, "purged log files");
        }
        Ok(())
    }
}

fn validate_log_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::invalid_log_name(name));
    }
    let as_path = Path::new(name);
    let mut components = as_path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::invalid_log_name(name)),
    }
}

fn enumerate_files(dir: &Path) -> Result<Vec<FileMeta>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let seq = match parse_seq(&path) {
            Some(seq) => seq,
            None => continue,
        };
        let meta = entry.metadata()?;
        files.push(FileMeta {
            seq,
            path,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(files.into_iter().sorted_by_key(|m| m.seq).collect())
}

fn parse_seq(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != LOG_FILE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_state(path: &Path) -> Option<(u32, u64)> {
    let bytes = fs::read(path).ok()?;
    if bytes.len() != 8 {
        return None;
    }
    let offset = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let seq = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    Some((offset, u64::from(seq)))
}

fn write_state(dir: &Path, offset: u32, seq: u32) -> Result<()> {
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&offset.to_le_bytes());
    bytes[4..8].copy_from_slice(&seq.to_le_bytes());
    let tmp = dir.join(format!("{TXN_STATE_FILE}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, dir.join(TXN_STATE_FILE))?;
    Ok(())
}

/// Walks the frames of a raw log file and returns the physical offset just
/// past the last complete frame. Zero padding and a frame whose declared
/// length runs past the present bytes both end the walk. Continuation
/// bytes carried in from the previous file (before the first new frame of
/// this file) belong to an already-synced commit and count as valid.
pub(crate) fn scan_valid_len(bytes: &[u8]) -> Result<u64> {
    let block_size = validate_file_header(bytes, Path::new("tail"))?;
    let body_len = block_size - BLOCK_HEADER_SIZE;
    let physical = bytes.len() as u64;

    // Logical (body-stream) position → physical offset.
    let phys_of = |logical: u64| -> u64 {
        let blocks = logical / body_len as u64;
        let within = logical % body_len as u64;
        if within == 0 {
            FILE_HEADER_SIZE as u64 + blocks * block_size as u64
        } else {
            FILE_HEADER_SIZE as u64 + blocks * block_size as u64 + BLOCK_HEADER_SIZE as u64 + within
        }
    };
    // Total logical bytes present in the file.
    let logical_len = {
        let data = physical.saturating_sub(FILE_HEADER_SIZE as u64);
        let full = data / block_size as u64;
        let rem = data % block_size as u64;
        full * body_len as u64 + rem.saturating_sub(BLOCK_HEADER_SIZE as u64)
    };
    let read_logical = |pos: u64, out: &mut [u8]| {
        for (i, slot) in out.iter_mut().enumerate() {
            let logical = pos + i as u64;
            // A position at a body boundary maps past the next block header.
            let phys = if logical % body_len as u64 == 0 {
                phys_of(logical) + BLOCK_HEADER_SIZE as u64
            } else {
                phys_of(logical)
            };
            *slot = bytes[phys as usize];
        }
    };

    // Find the first frame start: skip whole-body continuation blocks.
    let mut start = None;
    for index in 0..block_count(physical, block_size) {
        let block = parse_block(bytes, block_size, index, physical)?;
        let carry = block.data_offset as u64;
        if !block.flags.contains(BlockFlags::CONTINUATION) {
            start = Some(index * body_len as u64);
            break;
        }
        if (carry as usize) < body_len.min(block.body.len()) {
            start = Some(index * body_len as u64 + carry);
            break;
        }
    }
    let mut pos = match start {
        Some(p) => p,
        // Every present byte continues a frame from the previous file.
        None => return Ok(physical),
    };

    let mut header = [0u8; FRAME_HEADER_SIZE];
    loop {
        if pos + FRAME_HEADER_SIZE as u64 > logical_len {
            return Ok(phys_of(pos));
        }
        read_logical(pos, &mut header);
        let (ts, len, _) = parse_frame_header(&header)
            .ok_or_else(|| Error::invalid_log_file("unreadable frame header"))?;
        if ts == 0 {
            // Zero padding: the previous frame was the last.
            return Ok(phys_of(pos));
        }
        let next = pos + FRAME_HEADER_SIZE as u64 + len as u64;
        if next > logical_len {
            return Ok(phys_of(pos));
        }
        pos = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txnlog::LogConfig;

    fn config(max: u64) -> LogConfig {
        LogConfig {
            max_file_size: max,
            ..LogConfig::default()
        }
    }

    fn frame(ts: u64, payload: &[u8]) -> Frame {
        Frame {
            timestamp: ts,
            end_of_txn: true,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn rotation_at_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), "foo", config(1000)).unwrap();
        for i in 0..20u64 {
            store.append_commit(&[frame(100 + i, &[b'p'; 100])]).unwrap();
        }
        let files = store.list_files();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["1.txnlog", "2.txnlog", "3.txnlog"]);
        let sizes: Vec<u64> = files.iter().map(|f| f.size).collect();
        assert_eq!(sizes, [920, 920, 472]);
    }

    #[test]
    fn state_file_tracks_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), "bar", config(0)).unwrap();
        store.append_commit(&[frame(50, b"hello")]).unwrap();
        let state = read_state(&dir.path().join("bar").join(TXN_STATE_FILE)).unwrap();
        assert_eq!(state, (10 + 14 + 12 + 5, 1u64));
    }

    #[test]
    fn reopen_resumes_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path(), "foo", config(0)).unwrap();
            store.append_commit(&[frame(50, b"one")]).unwrap();
        }
        let store = LogStore::open(dir.path(), "foo", config(0)).unwrap();
        let span = store.append_commit(&[frame(60, b"two")]).unwrap();
        assert_eq!(span.start_seq, 1);
        assert_eq!(store.list_files().len(), 1);
    }

    #[test]
    fn partial_tail_frame_is_discarded_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir;
        let good_len: u64;
        {
            let store = LogStore::open(dir.path(), "foo", config(0)).unwrap();
            store.append_commit(&[frame(50, b"whole")]).unwrap();
            log_dir = store.dir().to_owned();
            good_len = 10 + 14 + 12 + 5;
        }
        // Simulate a crash: garbage half-frame appended, no state update.
        let file = log_dir.join("1.txnlog");
        let mut bytes = fs::read(&file).unwrap();
        bytes.extend_from_slice(&9999u64.to_be_bytes());
        bytes.extend_from_slice(&100u32.to_be_bytes());
        bytes.extend_from_slice(b"trunc");
        fs::write(&file, &bytes).unwrap();
        fs::remove_file(log_dir.join(TXN_STATE_FILE)).unwrap();

        let store = LogStore::open(dir.path(), "foo", config(0)).unwrap();
        let span = store.append_commit(&[frame(60, b"next")]).unwrap();
        assert_eq!(span.start_offset, good_len);
    }

    #[test]
    fn corrupt_tail_poisons_reads_but_not_appends() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LogStore::open(dir.path(), "hurt", config(0)).unwrap();
            store.append_commit(&[frame(50, b"lost")]).unwrap();
        }
        // Stomp the magic token.
        let file = dir.path().join("hurt").join("1.txnlog");
        let mut bytes = fs::read(&file).unwrap();
        bytes[0..4].copy_from_slice(&[0, 0, 0, 0]);
        fs::write(&file, &bytes).unwrap();

        // Opening succeeds; the next commit starts sequence 2.
        let store = LogStore::open(dir.path(), "hurt", config(0)).unwrap();
        let span = store.append_commit(&[frame(60, b"fresh")]).unwrap();
        assert_eq!(span.start_seq, 2);

        // Purging the damaged sequence restores a clean log.
        store
            .purge(Some(SystemTime::now() + Duration::from_secs(1)), false)
            .unwrap();
        assert_eq!(store.list_files().len(), 1);
        assert_eq!(store.list_files()[0].seq, 2);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["", "..", "a/b", "/abs"] {
            let err = LogStore::open(dir.path(), name, config(0)).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidLogName);
        }
    }

    #[test]
    fn destroy_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), "gone", config(0)).unwrap();
        store.append_commit(&[frame(50, b"x")]).unwrap();
        store.purge(None, true).unwrap();
        assert!(!dir.path().join("gone").exists());
    }

    #[test]
    fn scan_valid_len_finds_the_last_complete_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path(), "scan", config(0)).unwrap();
        store.append_commit(&[frame(50, b"abc")]).unwrap();
        store.append_commit(&[frame(60, b"defgh")]).unwrap();
        let bytes = fs::read(store.dir().join("1.txnlog")).unwrap();
        let valid = scan_valid_len(&bytes).unwrap();
        assert_eq!(valid, bytes.len() as u64);
    }
}
