//! # Sorted String Table Module
//!
//! Immutable, sorted, on-disk tables produced by memtable flushes and
//! compaction.
//!
//! # On-disk layout
//!
//! ```text
//! [data_block_0][crc32] … [data_block_n][crc32]
//! [index_block][crc32]
//! [bloom_block][crc32]
//! [footer]
//! ```
//!
//! - **Data blocks** — sorted `(key, tranc_id, value)` triples, see
//!   [`block`].
//! - **Index block** — per data block: payload offset, payload length
//!   and first key, enabling binary search to the candidate block.
//! - **Bloom block** — serialized bloom filter over every point key
//!   (false-positive rate 1%).
//! - **Footer** —
//!   `[index_off u32][index_len u32][bloom_off u32][bloom_len u32]`
//!   `[first_key_len u16][first_key][last_key_len u16][last_key]`
//!   `[min_tid u64][max_tid u64][footer_len u16][magic u32]`.
//!   The trailing `footer_len` locates the footer start from the end
//!   of the file; `magic` identifies the format.
//!
//! # Concurrency model
//!
//! SSTs are immutable: reads need no locking. Files are read through
//! a shared [`memmap2::Mmap`]; decoded blocks are interned in a
//! [`moka`] LRU cache keyed by `(sst_id, block_idx)` and shared as
//! `Arc<Block>`, so a cached block is never copied per reader and a
//! block pinned by an in-flight iterator survives eviction.
//!
//! # Guarantees
//!
//! - Every section carries a CRC32; a mismatch surfaces as
//!   [`SstError::Corruption`] and fails the read that touched it.
//! - `[min_tid, max_tid]` in the footer exactly bound the transaction
//!   identifiers stored in the table.
//! - Files are written to a `.tmp` path, fsynced and renamed into
//!   place — a crash cannot leave a half-written SST behind.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod block;
pub mod builder;
pub mod iterator;

pub use block::{Block, BlockEntry};
pub use builder::SstBuilder;
pub use iterator::SstIterator;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bloomfilter::Bloom;
use bytes::Bytes;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoding::{ByteReader, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Footer magic: "LSM1".
pub const SST_MAGIC: u32 = 0x4C53_4D31;

/// Bloom filter false-positive rate.
pub(crate) const SST_BLOOM_FP_RATE: f64 = 0.01;

/// Fixed footer bytes besides the two embedded keys.
pub(crate) const FOOTER_FIXED_LEN: usize = 4 * 4 + 2 + 2 + 8 + 8 + 2 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SST operations (open, read, build).
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding error while reading table bytes.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bad magic, bad checksum or inconsistent lengths.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Block cache
// ------------------------------------------------------------------------------------------------

/// LRU cache of decoded data blocks, keyed by `(sst_id, block_idx)`.
pub type BlockCache = moka::sync::Cache<(u64, usize), Arc<Block>>;

/// Creates a block cache bounded to `capacity` blocks.
pub fn new_block_cache(capacity: u64) -> Arc<BlockCache> {
    Arc::new(moka::sync::Cache::new(capacity))
}

// ------------------------------------------------------------------------------------------------
// Index metadata
// ------------------------------------------------------------------------------------------------

/// Index entry describing one data block.
#[derive(Debug, Clone)]
pub(crate) struct BlockMeta {
    /// Payload offset in the file.
    pub(crate) offset: u32,

    /// Payload length (CRC excluded).
    pub(crate) len: u32,

    /// First key stored in the block.
    pub(crate) first_key: Bytes,
}

// ------------------------------------------------------------------------------------------------
// Section helpers
// ------------------------------------------------------------------------------------------------

/// Slices a CRC-protected section out of the mapped file and verifies
/// its checksum.
fn read_section(mmap: &[u8], offset: u32, len: u32) -> Result<&[u8], SstError> {
    let start = offset as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| SstError::Corruption("section length overflows".into()))?;
    if end + 4 > mmap.len() {
        return Err(SstError::Corruption(format!(
            "section [{start}, {end}) + crc exceeds file of {} bytes",
            mmap.len()
        )));
    }

    let payload = &mmap[start..end];
    let stored = u32::from_le_bytes([mmap[end], mmap[end + 1], mmap[end + 2], mmap[end + 3]]);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(SstError::Corruption(format!(
            "section crc mismatch at offset {start} (stored {stored:08x}, computed {computed:08x})"
        )));
    }
    Ok(payload)
}

fn decode_index(payload: &[u8]) -> Result<Vec<BlockMeta>, SstError> {
    let mut reader = ByteReader::new(payload);
    let count = reader.read_u32()? as usize;
    let mut metas = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = reader.read_u32()?;
        let len = reader.read_u32()?;
        let first_key = Bytes::copy_from_slice(reader.read_len_u16()?);
        metas.push(BlockMeta {
            offset,
            len,
            first_key,
        });
    }
    if !reader.is_empty() {
        return Err(SstError::Corruption("trailing bytes after index entries".into()));
    }
    Ok(metas)
}

// ------------------------------------------------------------------------------------------------
// SST handle
// ------------------------------------------------------------------------------------------------

/// An open, immutable sorted string table.
pub struct Sst {
    sst_id: u64,
    path: PathBuf,
    mmap: Mmap,
    metas: Vec<BlockMeta>,
    bloom: Bloom<Vec<u8>>,
    first_key: Bytes,
    last_key: Bytes,
    min_tranc_id: u64,
    max_tranc_id: u64,
    cache: Arc<BlockCache>,
}

impl Sst {
    /// Opens and validates an SST file.
    pub fn open(sst_id: u64, path: &Path, cache: Arc<BlockCache>) -> Result<Self, SstError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let len = mmap.len();

        if len < FOOTER_FIXED_LEN {
            return Err(SstError::Corruption(format!(
                "file of {len} bytes is smaller than the footer"
            )));
        }

        let magic = u32::from_le_bytes([mmap[len - 4], mmap[len - 3], mmap[len - 2], mmap[len - 1]]);
        if magic != SST_MAGIC {
            return Err(SstError::Corruption(format!(
                "bad magic {magic:08x} (expected {SST_MAGIC:08x})"
            )));
        }

        let footer_len = u16::from_le_bytes([mmap[len - 6], mmap[len - 5]]) as usize;
        if footer_len < FOOTER_FIXED_LEN || footer_len > len {
            return Err(SstError::Corruption(format!(
                "implausible footer length {footer_len}"
            )));
        }

        let mut footer = ByteReader::new(&mmap[len - footer_len..]);
        let index_off = footer.read_u32()?;
        let index_len = footer.read_u32()?;
        let bloom_off = footer.read_u32()?;
        let bloom_len = footer.read_u32()?;
        let first_key = Bytes::copy_from_slice(footer.read_len_u16()?);
        let last_key = Bytes::copy_from_slice(footer.read_len_u16()?);
        let min_tranc_id = footer.read_u64()?;
        let max_tranc_id = footer.read_u64()?;
        let stored_footer_len = footer.read_u16()? as usize;
        if stored_footer_len != footer_len {
            return Err(SstError::Corruption(
                "footer length field disagrees with itself".into(),
            ));
        }

        let metas = decode_index(read_section(&mmap, index_off, index_len)?)?;
        if metas.is_empty() {
            return Err(SstError::Corruption("sst holds no data blocks".into()));
        }
        let bloom = Bloom::from_slice(read_section(&mmap, bloom_off, bloom_len)?)
            .map_err(|e| SstError::Corruption(format!("bloom filter: {e}")))?;

        debug!(
            sst_id,
            path = %path.display(),
            blocks = metas.len(),
            min_tranc_id,
            max_tranc_id,
            "SST opened"
        );

        Ok(Self {
            sst_id,
            path: path.to_path_buf(),
            mmap,
            metas,
            bloom,
            first_key,
            last_key,
            min_tranc_id,
            max_tranc_id,
            cache,
        })
    }

    /// Loads data block `idx`, consulting the shared cache first.
    pub(crate) fn read_block(&self, idx: usize) -> Result<Arc<Block>, SstError> {
        let cache_key = (self.sst_id, idx);
        if let Some(block) = self.cache.get(&cache_key) {
            return Ok(block);
        }

        let meta = self
            .metas
            .get(idx)
            .ok_or_else(|| SstError::Internal(format!("block index {idx} out of range")))?;
        let payload = read_section(&self.mmap, meta.offset, meta.len)?;
        let block = Arc::new(Block::decode(payload)?);
        self.cache.insert(cache_key, Arc::clone(&block));
        Ok(block)
    }

    /// Returns the newest entry for `key` visible at `tranc_id`
    /// (`0` disables MVCC filtering).
    pub fn get(&self, key: &[u8], tranc_id: u64) -> Result<Option<BlockEntry>, SstError> {
        if key < self.first_key.as_ref() || key > self.last_key.as_ref() {
            return Ok(None);
        }
        if !self.bloom.check(&key.to_vec()) {
            return Ok(None);
        }

        let snapshot = if tranc_id == 0 { u64::MAX } else { tranc_id };

        // Start at the last block whose first key is strictly below
        // the target — the run of versions for one key may span this
        // and any number of following blocks, newest first, so the
        // first hit scanning forward is the newest visible version.
        let mut idx = self
            .metas
            .partition_point(|m| m.first_key.as_ref() < key)
            .saturating_sub(1);
        if self.metas[idx].first_key.as_ref() > key {
            return Ok(None);
        }

        loop {
            let block = self.read_block(idx)?;
            if let Some(entry) = block.get(key, snapshot) {
                return Ok(Some(entry.clone()));
            }
            idx += 1;
            match self.metas.get(idx) {
                Some(next) if next.first_key.as_ref() == key => continue,
                _ => return Ok(None),
            }
        }
    }

    /// Streams every entry visible at `tranc_id` (`0` disables MVCC
    /// filtering) in `(key ASC, tranc_id DESC)` order.
    pub fn iter(self: &Arc<Self>, tranc_id: u64) -> SstIterator {
        SstIterator::new(Arc::clone(self), tranc_id)
    }

    /// Streams the entries selected by a monotone three-way predicate,
    /// skipping blocks entirely left of the matching range.
    pub fn iter_monotone<F>(self: &Arc<Self>, pred: F, tranc_id: u64) -> SstIterator
    where
        F: Fn(&[u8]) -> i32 + Send + 'static,
    {
        SstIterator::with_predicate(Arc::clone(self), tranc_id, pred)
    }

    /// True when this table's key range intersects `[lo, hi]`.
    pub fn overlaps(&self, lo: &[u8], hi: &[u8]) -> bool {
        !(self.last_key.as_ref() < lo || self.first_key.as_ref() > hi)
    }

    /// Removes the backing file. Readers holding this handle keep the
    /// mapping alive until the last `Arc` drops.
    pub fn delete_file(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(sst_id = self.sst_id, path = %self.path.display(), error = %err,
                "failed to remove superseded SST file");
        }
    }

    /// Unique table id.
    pub fn sst_id(&self) -> u64 {
        self.sst_id
    }

    /// Smallest key stored.
    pub fn first_key(&self) -> &Bytes {
        &self.first_key
    }

    /// Largest key stored.
    pub fn last_key(&self) -> &Bytes {
        &self.last_key
    }

    /// Smallest transaction id stored.
    pub fn min_tranc_id(&self) -> u64 {
        self.min_tranc_id
    }

    /// Largest transaction id stored.
    pub fn max_tranc_id(&self) -> u64 {
        self.max_tranc_id
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.metas.len()
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub(crate) fn metas(&self) -> &[BlockMeta] {
        &self.metas
    }
}

impl std::fmt::Debug for Sst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("sst_id", &self.sst_id)
            .field("path", &self.path)
            .field("blocks", &self.metas.len())
            .field("min_tranc_id", &self.min_tranc_id)
            .field("max_tranc_id", &self.max_tranc_id)
            .finish_non_exhaustive()
    }
}
