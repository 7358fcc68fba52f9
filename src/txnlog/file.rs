//! One transaction log file.
//!
//! A log file is a 10-byte header followed by fixed-size blocks. Each block
//! carries a 14-byte header and a body of payload bytes; the bodies of all
//! blocks, concatenated in order, form the log byte stream of the file.
//! Frames (`timestamp | length | payload`) are packed back to back into
//! that stream and may straddle block and file boundaries; a block whose
//! body opens with the tail of an earlier frame carries the `CONTINUATION`
//! flag and records the carry length in `data_offset`.
//!
//! The file is written compactly: the tail block grows in place as commits
//! append into it, and bytes past the end of the file read as zero padding.
//! The block header's `earliest` field is the smallest timestamp of any
//! frame beginning or continuing in the block; a commit carrying an older
//! timestamp than the resident tail block rewrites that header in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use tracing::{debug, warn};
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::error::{Error, Result};
use crate::param::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, END_OF_TXN_BIT, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, LOG_TOKEN,
    LOG_VERSION, MAX_FRAME_LEN,
};

bitflags! {
    /// Flags of a block header.
    pub struct BlockFlags: u16 {
        /// The body begins with `data_offset` bytes continuing the previous
        /// block's (or previous file's) frame.
        const CONTINUATION = 0b1;
    }
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct FileHeader {
    token: U32<BigEndian>,
    version: U16<BigEndian>,
    block_size: U32<BigEndian>,
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone)]
#[repr(C)]
pub(crate) struct BlockHeader {
    earliest: U64<BigEndian>,
    flags: U16<BigEndian>,
    data_offset: U32<BigEndian>,
}

#[derive(FromZeroes, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub(crate) struct FrameHeader {
    timestamp: U64<BigEndian>,
    length: U32<BigEndian>,
}

const_assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
const_assert_eq!(std::mem::size_of::<BlockHeader>(), BLOCK_HEADER_SIZE);
const_assert_eq!(std::mem::size_of::<FrameHeader>(), FRAME_HEADER_SIZE);

/// One entry of a committing transaction, already stamped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: u64,
    pub end_of_txn: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total bytes of the frame on disk, header included.
    pub(crate) fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// A run of frames being packed into files, tracking mid-frame state across
/// block and file splits.
pub(crate) struct FrameStream {
    frames: Vec<EncodedFrame>,
    idx: usize,
    offset: usize,
}

struct EncodedFrame {
    timestamp: u64,
    bytes: Vec<u8>,
}

impl FrameStream {
    pub(crate) fn new(frames: &[Frame]) -> Result<Self> {
        let mut encoded = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.payload.len() > MAX_FRAME_LEN {
                return Err(Error::new(
                    crate::error::ErrorKind::InvalidValue,
                    format!("log entry of {} bytes exceeds the frame limit", frame.payload.len()),
                ));
            }
            let mut length = frame.payload.len() as u32;
            if frame.end_of_txn {
                length |= END_OF_TXN_BIT;
            }
            let header = FrameHeader {
                timestamp: U64::new(frame.timestamp),
                length: U32::new(length),
            };
            let mut bytes = Vec::with_capacity(frame.encoded_len());
            bytes.extend_from_slice(header.as_bytes());
            bytes.extend_from_slice(&frame.payload);
            encoded.push(EncodedFrame {
                timestamp: frame.timestamp,
                bytes,
            });
        }
        Ok(Self {
            frames: encoded,
            idx: 0,
            offset: 0,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.idx >= self.frames.len()
    }

    fn at_frame_start(&self) -> bool {
        self.offset == 0
    }

    fn current_timestamp(&self) -> u64 {
        self.frames[self.idx].timestamp
    }

    fn current_total(&self) -> usize {
        self.frames[self.idx].bytes.len()
    }

    fn current_remaining(&self) -> usize {
        self.frames[self.idx].bytes.len() - self.offset
    }

    /// Copies up to `max` bytes of the current frame into `out`, advancing
    /// to the next frame when this one is exhausted.
    fn take(&mut self, out: &mut Vec<u8>, max: usize) -> usize {
        let frame = &self.frames[self.idx];
        let n = max.min(frame.bytes.len() - self.offset);
        out.extend_from_slice(&frame.bytes[self.offset..self.offset + n]);
        self.offset += n;
        if self.offset == frame.bytes.len() {
            self.idx += 1;
            self.offset = 0;
        }
        n
    }
}

/// Outcome of packing a stream into one file.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AppendProgress {
    /// Every frame has been written to this file.
    Complete,
    /// The size limit was reached; the remainder continues in the next file.
    NeedsRotation,
}

/// State of the partially filled block at the end of the file.
#[derive(Debug, Clone)]
struct TailBlock {
    index: u64,
    body_used: usize,
    earliest: u64,
}

/// A writable transaction log file.
#[derive(Debug)]
pub(crate) struct LogFile {
    path: PathBuf,
    seq: u64,
    file: File,
    block_size: usize,
    len: u64,
    tail: Option<TailBlock>,
}

impl LogFile {
    /// Creates `{seq}.txnlog` with a fresh header.
    pub(crate) fn create(path: &Path, seq: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let header = FileHeader {
            token: U32::new(LOG_TOKEN),
            version: U16::new(LOG_VERSION),
            block_size: U32::new(BLOCK_SIZE as u32),
        };
        file.write_all(header.as_bytes())?;
        debug!(seq, path = %path.display(), "created log file");
        Ok(Self {
            path: path.to_owned(),
            seq,
            file,
            block_size: BLOCK_SIZE,
            len: FILE_HEADER_SIZE as u64,
            tail: None,
        })
    }

    /// Opens an existing file for append. `committed_len`, when known,
    /// bounds the valid bytes; anything beyond it is uncommitted residue
    /// from an interrupted write and will be overwritten.
    pub(crate) fn open(path: &Path, seq: u64, committed_len: Option<u64>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let physical = file.metadata()?.len();
        let mut header_bytes = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|_| {
            Error::invalid_log_file(format!("{}: truncated file header", path.display()))
        })?;
        let block_size = validate_file_header(&header_bytes, path)?;

        let mut len = match committed_len {
            Some(c) if c <= physical => c,
            _ => physical,
        };
        if len < FILE_HEADER_SIZE as u64 {
            len = FILE_HEADER_SIZE as u64;
        }
        // A cut inside a block header cannot hold any payload; fall back to
        // the block boundary.
        let rel = len - FILE_HEADER_SIZE as u64;
        let within = (rel % block_size as u64) as usize;
        if within > 0 && within < BLOCK_HEADER_SIZE {
            warn!(seq, len, "log file ends inside a block header; trimming to block start");
            len -= within as u64;
        }

        let mut log = Self {
            path: path.to_owned(),
            seq,
            file,
            block_size,
            len,
            tail: None,
        };
        log.tail = log.read_tail_state()?;
        Ok(log)
    }

    fn read_tail_state(&mut self) -> Result<Option<TailBlock>> {
        let rel = self.len - FILE_HEADER_SIZE as u64;
        if rel == 0 {
            return Ok(None);
        }
        let within = (rel % self.block_size as u64) as usize;
        let (index, body_used) = if within == 0 {
            (rel / self.block_size as u64 - 1, self.body_len())
        } else {
            (rel / self.block_size as u64, within - BLOCK_HEADER_SIZE)
        };
        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        self.file
            .seek(SeekFrom::Start(self.block_offset(index)))?;
        self.file.read_exact(&mut header_bytes)?;
        let header = BlockHeader::read_from(&header_bytes[..])
            .ok_or_else(|| Error::invalid_log_file("unreadable block header"))?;
        Ok(Some(TailBlock {
            index,
            body_used,
            earliest: header.earliest.get(),
        }))
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn body_len(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE
    }

    fn block_offset(&self, index: u64) -> u64 {
        FILE_HEADER_SIZE as u64 + index * self.block_size as u64
    }

    /// Packs frames from `stream` into this file until the stream is empty
    /// or `max_size` forces the remainder into the next file. Returns the
    /// byte span written.
    pub(crate) fn append_from(
        &mut self,
        stream: &mut FrameStream,
        max_size: Option<u64>,
    ) -> Result<(u64, u64, AppendProgress)> {
        let start = self.len;
        let body_len = self.body_len();
        let mut out: Vec<u8> = Vec::new();
        // Open block state: position of the 14-byte header within `out`
        // (None when it is the on-disk tail block), plus running fields.
        let (mut open, mut full_tail): (Option<(Option<usize>, TailBlock)>, Option<TailBlock>) =
            match self.tail.take() {
                Some(t) if t.body_used < body_len => (Some((None, t)), None),
                other => (None, other),
            };
        let mut patch_earliest: Option<(u64, u64)> = None;
        let mut progress = AppendProgress::Complete;

        while !stream.is_empty() {
            if stream.at_frame_start() {
                // Rotation check (size): a frame never starts in a file it
                // would push past the limit, unless the file is still empty.
                if let Some(max) = max_size {
                    let projected = self.len + out.len() as u64 + stream.current_total() as u64;
                    let has_data = self.len + out.len() as u64 > FILE_HEADER_SIZE as u64;
                    if projected > max && has_data {
                        progress = AppendProgress::NeedsRotation;
                        break;
                    }
                }
            }
            let has_room = matches!(&open, Some((_, b)) if b.body_used < body_len);
            if has_room {
                let (header_pos, block) = open.as_mut().unwrap();
                let ts = stream.current_timestamp();
                let n = stream.take(&mut out, body_len - block.body_used);
                block.body_used += n;
                if ts < block.earliest {
                    block.earliest = ts;
                    match header_pos {
                        Some(pos) => patch_out_earliest(&mut out, *pos, ts),
                        None => patch_earliest = Some((block.index, ts)),
                    }
                }
            } else {
                // The open block (if any) is full; retire it and decide
                // whether the next one still fits this file.
                if let Some((_, block)) = open.take() {
                    full_tail = Some(block);
                }
                if let Some(max) = max_size {
                    let written = self.len + out.len() as u64;
                    if written >= max && written > FILE_HEADER_SIZE as u64 {
                        progress = AppendProgress::NeedsRotation;
                        break;
                    }
                }
                let mid_frame = !stream.at_frame_start();
                let carry = if mid_frame {
                    stream.current_remaining().min(body_len) as u32
                } else {
                    0
                };
                let flags = if mid_frame {
                    BlockFlags::CONTINUATION
                } else {
                    BlockFlags::empty()
                };
                let index = match &full_tail {
                    Some(t) => t.index + 1,
                    None => {
                        (self.len + out.len() as u64 - FILE_HEADER_SIZE as u64)
                            / self.block_size as u64
                    }
                };
                let header = BlockHeader {
                    earliest: U64::new(stream.current_timestamp()),
                    flags: U16::new(flags.bits()),
                    data_offset: U32::new(carry),
                };
                let header_pos = out.len();
                out.extend_from_slice(header.as_bytes());
                open = Some((
                    Some(header_pos),
                    TailBlock {
                        index,
                        body_used: 0,
                        earliest: stream.current_timestamp(),
                    },
                ));
            }
        }

        // Restore tail state for the next append.
        self.tail = match open {
            Some((_, block)) => Some(block),
            None => full_tail,
        };

        if !out.is_empty() {
            self.file.seek(SeekFrom::Start(self.len))?;
            self.file.write_all(&out)?;
            self.len += out.len() as u64;
        }
        if let Some((index, earliest)) = patch_earliest {
            // A frame older than the resident tail block: rewrite its header.
            self.rewrite_block_earliest(index, earliest)?;
        }
        debug!(
            seq = self.seq,
            start,
            end = self.len,
            rotating = progress == AppendProgress::NeedsRotation,
            "appended frames"
        );
        Ok((start, self.len, progress))
    }

    fn rewrite_block_earliest(&mut self, index: u64, earliest: u64) -> Result<()> {
        let offset = self.block_offset(index);
        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut header_bytes)?;
        let mut header = BlockHeader::read_from(&header_bytes[..])
            .ok_or_else(|| Error::invalid_log_file("unreadable block header"))?;
        header.earliest = U64::new(earliest);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(header.as_bytes())?;
        Ok(())
    }

    /// Makes every appended byte durable.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn patch_out_earliest(out: &mut [u8], header_pos: usize, earliest: u64) {
    out[header_pos..header_pos + 8].copy_from_slice(&earliest.to_be_bytes());
}

/// Validates a file header, returning the block size.
pub(crate) fn validate_file_header(bytes: &[u8], path: &Path) -> Result<usize> {
    let header = FileHeader::read_from_prefix(bytes).ok_or_else(|| {
        Error::invalid_log_file(format!("{}: truncated file header", path.display()))
    })?;
    if header.token.get() != LOG_TOKEN {
        return Err(Error::invalid_log_file(format!(
            "{}: bad magic token {:#010x}",
            path.display(),
            header.token.get()
        )));
    }
    if header.version.get() != LOG_VERSION {
        return Err(Error::new(
            crate::error::ErrorKind::UnsupportedVersion,
            format!(
                "{}: log format version {} is not supported",
                path.display(),
                header.version.get()
            ),
        ));
    }
    let block_size = header.block_size.get() as usize;
    if block_size <= BLOCK_HEADER_SIZE {
        return Err(Error::invalid_log_file(format!(
            "{}: block size {} is too small",
            path.display(),
            block_size
        )));
    }
    Ok(block_size)
}

/// A decoded block of a mapped file. The body may be shorter than the block
/// size at the physical end of the file; the missing suffix reads as zeros.
#[derive(Debug)]
pub(crate) struct ParsedBlock<'a> {
    pub earliest: u64,
    pub flags: BlockFlags,
    pub data_offset: u32,
    pub body: &'a [u8],
}

/// Number of blocks a file of `len` bytes holds.
pub(crate) fn block_count(len: u64, block_size: usize) -> u64 {
    let data = len.saturating_sub(FILE_HEADER_SIZE as u64);
    (data + block_size as u64 - 1) / block_size as u64
}

/// Decodes block `index` of a mapped file, bounded by `len`.
pub(crate) fn parse_block(data: &[u8], block_size: usize, index: u64, len: u64) -> Result<ParsedBlock<'_>> {
    let offset = FILE_HEADER_SIZE as u64 + index * block_size as u64;
    if offset + BLOCK_HEADER_SIZE as u64 > len || data.len() < (offset + BLOCK_HEADER_SIZE as u64) as usize
    {
        return Err(Error::invalid_log_file(format!(
            "block {index} header extends past the end of the file"
        )));
    }
    let offset = offset as usize;
    let header = BlockHeader::read_from(&data[offset..offset + BLOCK_HEADER_SIZE])
        .ok_or_else(|| Error::invalid_log_file("unreadable block header"))?;
    let body_start = offset + BLOCK_HEADER_SIZE;
    let body_end = (offset + block_size).min(len as usize).min(data.len());
    Ok(ParsedBlock {
        earliest: header.earliest.get(),
        flags: BlockFlags::from_bits_truncate(header.flags.get()),
        data_offset: header.data_offset.get(),
        body: &data[body_start..body_end],
    })
}

/// Splits a frame length word into (payload length, end-of-txn).
pub(crate) fn split_length_word(word: u32) -> (usize, bool) {
    (
        (word & !END_OF_TXN_BIT) as usize,
        word & END_OF_TXN_BIT != 0,
    )
}

/// Reads a frame header from a raw 12-byte slice.
pub(crate) fn parse_frame_header(bytes: &[u8]) -> Option<(u64, usize, bool)> {
    let header = FrameHeader::read_from_prefix(bytes)?;
    let (len, end) = split_length_word(header.length.get());
    Some((header.timestamp.get(), len, end))
}
