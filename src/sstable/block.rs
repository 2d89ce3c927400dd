//! Data block format and in-memory representation.
//!
//! A block is the unit of SST I/O and caching. On disk (before the
//! per-section CRC added by the file layout) a block is
//!
//! ```text
//! [entry 0][entry 1]…[entry n-1][offset 0 u16]…[offset n-1 u16][n u16]
//! ```
//!
//! with each entry laid out as
//! `[key_len u16][key][tranc_id u64][value_len u32][value]`.
//!
//! Entries are sorted `(key ASC, tranc_id DESC)`; the offsets array
//! records every entry start, which is what makes binary search inside
//! a block possible. Decoded blocks are immutable and shared through
//! the block cache as `Arc<Block>`.

use bytes::{BufMut, Bytes};

use crate::encoding::ByteReader;

use super::SstError;

/// One `(key, value, tranc_id)` triple stored in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    /// User key bytes.
    pub key: Bytes,

    /// Stored value; empty marks a tombstone.
    pub value: Bytes,

    /// Transaction that wrote this version.
    pub tranc_id: u64,
}

impl BlockEntry {
    /// True when this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// A decoded, immutable data block.
#[derive(Debug)]
pub struct Block {
    entries: Vec<BlockEntry>,
}

impl Block {
    /// Decodes a block payload, validating the offset directory.
    pub fn decode(bytes: &[u8]) -> Result<Self, SstError> {
        if bytes.len() < 2 {
            return Err(SstError::Corruption("block shorter than its count field".into()));
        }

        let count = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]) as usize;
        let directory_len = count
            .checked_mul(2)
            .and_then(|n| n.checked_add(2))
            .ok_or_else(|| SstError::Corruption("block entry count overflows".into()))?;
        if bytes.len() < directory_len {
            return Err(SstError::Corruption(format!(
                "block of {} bytes cannot hold {count} offsets",
                bytes.len()
            )));
        }

        let data_end = bytes.len() - directory_len;
        let mut offsets = Vec::with_capacity(count);
        let mut reader = ByteReader::new(&bytes[data_end..bytes.len() - 2]);
        for _ in 0..count {
            offsets.push(reader.read_u16()? as usize);
        }

        let mut entries = Vec::with_capacity(count);
        for &offset in &offsets {
            if offset >= data_end {
                return Err(SstError::Corruption(format!(
                    "entry offset {offset} outside block data of {data_end} bytes"
                )));
            }
            let mut reader = ByteReader::new(&bytes[offset..data_end]);
            let key = Bytes::copy_from_slice(reader.read_len_u16()?);
            let tranc_id = reader.read_u64()?;
            let value = Bytes::copy_from_slice(reader.read_len_u32()?);
            entries.push(BlockEntry {
                key,
                value,
                tranc_id,
            });
        }

        Ok(Self { entries })
    }

    /// All entries in `(key ASC, tranc_id DESC)` order.
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the block holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key of the first entry.
    pub fn first_key(&self) -> Option<&Bytes> {
        self.entries.first().map(|e| &e.key)
    }

    /// Key of the last entry.
    pub fn last_key(&self) -> Option<&Bytes> {
        self.entries.last().map(|e| &e.key)
    }

    /// Binary-searches for the newest version of `key` visible at
    /// `snapshot` (`u64::MAX` disables filtering).
    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<&BlockEntry> {
        let idx = self.partition_at(key, snapshot);
        let entry = self.entries.get(idx)?;
        if entry.key.as_ref() == key {
            Some(entry)
        } else {
            None
        }
    }

    /// Index of the first entry at or after `(key, snapshot)` in the
    /// `(key ASC, tranc_id DESC)` order.
    pub fn partition_at(&self, key: &[u8], snapshot: u64) -> usize {
        self.entries.partition_point(|e| {
            e.key.as_ref() < key || (e.key.as_ref() == key && e.tranc_id > snapshot)
        })
    }
}

/// Accumulates sorted entries into an encoded block payload.
pub struct BlockBuilder {
    buf: Vec<u8>,
    offsets: Vec<u16>,
    target_size: usize,
    first_key: Option<Bytes>,
}

impl BlockBuilder {
    /// Creates a builder aiming at `target_size` payload bytes. The
    /// target is capped at `u16::MAX` so entry offsets always fit the
    /// offset directory.
    pub fn new(target_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            offsets: Vec::new(),
            target_size: target_size.min(u16::MAX as usize),
            first_key: None,
        }
    }

    /// Appends an entry. Returns `false` — without consuming the entry
    /// — when the block is at its target size and must be sealed; a
    /// single entry always fits into an empty block, whatever its
    /// size.
    pub fn add(&mut self, key: &[u8], value: &[u8], tranc_id: u64) -> bool {
        let entry_len = 2 + key.len() + 8 + 4 + value.len();
        if !self.buf.is_empty() && self.buf.len() + entry_len > self.target_size {
            return false;
        }

        self.offsets.push(self.buf.len() as u16);
        self.buf.put_u16_le(key.len() as u16);
        self.buf.put_slice(key);
        self.buf.put_u64_le(tranc_id);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);

        if self.first_key.is_none() {
            self.first_key = Some(Bytes::copy_from_slice(key));
        }
        true
    }

    /// True when no entry has been added yet.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Key of the first entry added to this block.
    pub fn first_key(&self) -> Option<&Bytes> {
        self.first_key.as_ref()
    }

    /// Encoded payload size if the block were sealed now.
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + self.offsets.len() * 2 + 2
    }

    /// Seals the block into its payload encoding and resets the
    /// builder for the next block.
    pub fn build(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buf);
        for offset in &self.offsets {
            out.put_u16_le(*offset);
        }
        out.put_u16_le(self.offsets.len() as u16);

        self.offsets.clear();
        self.first_key = None;
        out
    }
}
