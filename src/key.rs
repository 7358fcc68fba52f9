//! Cache key shapes.
//!
//! The underlying store orders opaque byte strings, but the freshness layer
//! hashes keys by their logical shape: integers and floats fold their bit
//! patterns, strings run FNV over UTF-16 code units, arrays combine their
//! elements. `CacheKey` is that shape. `encode()` produces the byte string
//! handed to the store; the encoding is deterministic and injective so a
//! cache key always names exactly one stored key.

use crate::error::{Error, Result};

/// A key as seen by the cached read/write paths.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheKey {
    /// A signed integer key.
    Int(i64),
    /// A floating point key.
    Float(f64),
    /// A text key.
    Str(String),
    /// An opaque byte-string key.
    Bytes(Vec<u8>),
    /// A composite key; elements hash recursively.
    Array(Vec<CacheKey>),
}

const TAG_INT: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_STR: u8 = 0x03;
const TAG_BYTES: u8 = 0x04;
const TAG_ARRAY: u8 = 0x05;

impl CacheKey {
    /// True for keys that carry no bytes at all; such keys are rejected at
    /// the public surface with `KEY_REQUIRED`.
    pub fn is_empty(&self) -> bool {
        match self {
            CacheKey::Str(s) => s.is_empty(),
            CacheKey::Bytes(b) => b.is_empty(),
            CacheKey::Array(a) => a.is_empty(),
            _ => false,
        }
    }

    /// Encodes the key into the byte string used by the underlying store.
    ///
    /// Integers sort in numeric order under a bytewise comparison (the sign
    /// bit is flipped); everything else sorts within its tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            CacheKey::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            CacheKey::Float(f) => {
                out.push(TAG_FLOAT);
                // Order-preserving float encoding: flip all bits of
                // negatives, the sign bit of non-negatives.
                let bits = f.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            CacheKey::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(s.as_bytes());
            }
            CacheKey::Bytes(b) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(b);
            }
            CacheKey::Array(elems) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&(elems.len() as u32).to_be_bytes());
                for elem in elems {
                    let mut enc = Vec::new();
                    elem.encode_into(&mut enc);
                    out.extend_from_slice(&(enc.len() as u32).to_be_bytes());
                    out.extend_from_slice(&enc);
                }
            }
        }
    }

    /// Recovers the key shape from its encoding. The write-invalidation
    /// path decodes stored keys so that a raw-bytes writer and a shaped
    /// reader agree on the freshness slot.
    pub(crate) fn decode(bytes: &[u8]) -> Option<CacheKey> {
        let (key, rest) = Self::decode_prefix(bytes)?;
        rest.is_empty().then_some(key)
    }

    fn decode_prefix(bytes: &[u8]) -> Option<(CacheKey, &[u8])> {
        let (&tag, rest) = bytes.split_first()?;
        match tag {
            TAG_INT => {
                let raw = u64::from_be_bytes(rest.get(..8)?.try_into().ok()?);
                Some((CacheKey::Int((raw ^ (1 << 63)) as i64), &rest[8..]))
            }
            TAG_FLOAT => {
                let ordered = u64::from_be_bytes(rest.get(..8)?.try_into().ok()?);
                let bits = if ordered >> 63 == 1 {
                    ordered & !(1 << 63)
                } else {
                    !ordered
                };
                Some((CacheKey::Float(f64::from_bits(bits)), &rest[8..]))
            }
            TAG_STR => {
                let s = std::str::from_utf8(rest).ok()?;
                Some((CacheKey::Str(s.to_owned()), &rest[rest.len()..]))
            }
            TAG_BYTES => Some((CacheKey::Bytes(rest.to_vec()), &rest[rest.len()..])),
            TAG_ARRAY => {
                let count = u32::from_be_bytes(rest.get(..4)?.try_into().ok()?) as usize;
                let mut rest = &rest[4..];
                let mut elems = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = u32::from_be_bytes(rest.get(..4)?.try_into().ok()?) as usize;
                    let body = rest.get(4..4 + len)?;
                    let (elem, leftover) = Self::decode_prefix(body)?;
                    if !leftover.is_empty() {
                        return None;
                    }
                    elems.push(elem);
                    rest = &rest[4 + len..];
                }
                Some((CacheKey::Array(elems), rest))
            }
            _ => None,
        }
    }

    /// Rejects keys the engine cannot accept.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::key_required());
        }
        if let CacheKey::Array(elems) = self {
            for elem in elems {
                elem.validate()?;
            }
        }
        Ok(())
    }
}

impl From<i64> for CacheKey {
    fn from(v: i64) -> Self {
        CacheKey::Int(v)
    }
}

impl From<u32> for CacheKey {
    fn from(v: u32) -> Self {
        CacheKey::Int(v as i64)
    }
}

impl From<f64> for CacheKey {
    fn from(v: f64) -> Self {
        CacheKey::Float(v)
    }
}

impl From<&str> for CacheKey {
    fn from(v: &str) -> Self {
        CacheKey::Str(v.to_owned())
    }
}

impl From<String> for CacheKey {
    fn from(v: String) -> Self {
        CacheKey::Str(v)
    }
}

impl From<&[u8]> for CacheKey {
    fn from(v: &[u8]) -> Self {
        CacheKey::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for CacheKey {
    fn from(v: Vec<u8>) -> Self {
        CacheKey::Bytes(v)
    }
}
