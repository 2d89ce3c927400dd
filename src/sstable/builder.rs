//! SST writer — builds a complete table file from a sorted entry
//! stream.
//!
//! [`SstBuilder`] accepts `(key, value, tranc_id)` triples in
//! `(key ASC, tranc_id DESC)` order — the order produced by a skiplist
//! drain or a merge-mode heap iterator. Entries accumulate into data
//! blocks of the configured target size; sealing a block records its
//! offset, length and first key in the index.
//!
//! `build` assembles data blocks, index, bloom filter and footer into
//! one buffer, writes it to `<path>.tmp`, fsyncs, renames into place
//! and returns an open [`Sst`] handle. A crash can leave at most a
//! stale `.tmp` file behind, never a torn table.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    sync::Arc,
};

use bloomfilter::Bloom;
use bytes::{BufMut, Bytes};
use tracing::info;

use super::{
    BlockCache, BlockMeta, FOOTER_FIXED_LEN, SST_BLOOM_FP_RATE, SST_MAGIC, Sst, SstError,
    block::BlockBuilder,
};

/// Accumulates sorted entries and writes a complete SST file.
pub struct SstBuilder {
    block_builder: BlockBuilder,
    /// Sealed data sections (payload + CRC each), concatenated.
    data: Vec<u8>,
    metas: Vec<BlockMeta>,
    /// Every point key, for sizing and filling the bloom filter.
    bloom_keys: Vec<Vec<u8>>,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
    min_tranc_id: u64,
    max_tranc_id: u64,
    entry_count: usize,
}

impl SstBuilder {
    /// Creates a builder with the given data-block target size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_builder: BlockBuilder::new(block_size),
            data: Vec::new(),
            metas: Vec::new(),
            bloom_keys: Vec::new(),
            first_key: None,
            last_key: None,
            min_tranc_id: u64::MAX,
            max_tranc_id: 0,
            entry_count: 0,
        }
    }

    /// Appends one entry. Entries must arrive in
    /// `(key ASC, tranc_id DESC)` order.
    pub fn add(&mut self, key: &[u8], value: &[u8], tranc_id: u64) {
        if !self.block_builder.add(key, value, tranc_id) {
            self.seal_block();
            // An empty block always accepts one entry.
            self.block_builder.add(key, value, tranc_id);
        }

        if self.first_key.is_none() {
            self.first_key = Some(Bytes::copy_from_slice(key));
        }
        self.last_key = Some(Bytes::copy_from_slice(key));
        self.min_tranc_id = self.min_tranc_id.min(tranc_id);
        self.max_tranc_id = self.max_tranc_id.max(tranc_id);
        self.bloom_keys.push(key.to_vec());
        self.entry_count += 1;
    }

    /// Seals the in-progress block into the data buffer.
    fn seal_block(&mut self) {
        if self.block_builder.is_empty() {
            return;
        }
        let first_key = self
            .block_builder
            .first_key()
            .cloned()
            .unwrap_or_default();
        let payload = self.block_builder.build();

        self.metas.push(BlockMeta {
            offset: self.data.len() as u32,
            len: payload.len() as u32,
            first_key,
        });
        let crc = crc32fast::hash(&payload);
        self.data.extend_from_slice(&payload);
        self.data.put_u32_le(crc);
    }

    /// Number of entries added so far.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Approximate encoded size so far, in bytes.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.block_builder.estimated_size()
    }

    /// True when nothing has been added.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Writes the table to `path` and returns an open handle.
    pub fn build(
        mut self,
        sst_id: u64,
        path: &Path,
        cache: Arc<BlockCache>,
    ) -> Result<Sst, SstError> {
        self.seal_block();
        if self.metas.is_empty() {
            return Err(SstError::Internal(
                "cannot build an SST from zero entries".into(),
            ));
        }

        let mut bloom = Bloom::new_for_fp_rate(self.bloom_keys.len(), SST_BLOOM_FP_RATE)
            .map_err(|e| SstError::Internal(format!("bloom filter: {e}")))?;
        for key in &self.bloom_keys {
            bloom.set(key);
        }

        let mut out = std::mem::take(&mut self.data);

        // Index section.
        let index_off = out.len() as u32;
        let mut index = Vec::new();
        index.put_u32_le(self.metas.len() as u32);
        for meta in &self.metas {
            index.put_u32_le(meta.offset);
            index.put_u32_le(meta.len);
            index.put_u16_le(meta.first_key.len() as u16);
            index.put_slice(&meta.first_key);
        }
        let index_len = index.len() as u32;
        let index_crc = crc32fast::hash(&index);
        out.extend_from_slice(&index);
        out.put_u32_le(index_crc);

        // Bloom section.
        let bloom_off = out.len() as u32;
        let bloom_bytes = bloom.as_slice();
        let bloom_len = bloom_bytes.len() as u32;
        let bloom_crc = crc32fast::hash(bloom_bytes);
        out.extend_from_slice(bloom_bytes);
        out.put_u32_le(bloom_crc);

        // Footer.
        let first_key = self.first_key.clone().unwrap_or_default();
        let last_key = self.last_key.clone().unwrap_or_default();
        let footer_len = FOOTER_FIXED_LEN + first_key.len() + last_key.len();
        out.put_u32_le(index_off);
        out.put_u32_le(index_len);
        out.put_u32_le(bloom_off);
        out.put_u32_le(bloom_len);
        out.put_u16_le(first_key.len() as u16);
        out.put_slice(&first_key);
        out.put_u16_le(last_key.len() as u16);
        out.put_slice(&last_key);
        out.put_u64_le(self.min_tranc_id);
        out.put_u64_le(self.max_tranc_id);
        out.put_u16_le(footer_len as u16);
        out.put_u32_le(SST_MAGIC);

        // Atomic write: tmp → fsync → rename.
        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&out)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;

        info!(
            sst_id,
            path = %path.display(),
            entries = self.entry_count,
            blocks = self.metas.len(),
            bytes = out.len(),
            "SST built"
        );

        Sst::open(sst_id, path, cache)
    }
}
