//! # Manifest Module
//!
//! Durable snapshot of the engine's metadata: identifier counters,
//! the durability watermark, the WAL sequence and the SST ids of each
//! level.
//!
//! The manifest is a single file rewritten whole on every update:
//! encode, CRC, write to `manifest.tmp`, fsync, rename over
//! `manifest`, fsync the directory. The rename is atomic, so a crash
//! leaves either the previous snapshot or the new one — never a torn
//! file. A snapshot that fails its CRC or magic check is reported as
//! corruption rather than silently reinitialized.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use bytes::BufMut;
use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{ByteReader, EncodingError};

const MANIFEST_FILE: &str = "manifest";
const MANIFEST_TMP_FILE: &str = "manifest.tmp";
const MANIFEST_MAGIC: u32 = 0x4D46_5331; // "MFS1"

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding error while reading the snapshot.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bad magic or checksum mismatch.
    #[error("Corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Manifest data
// ------------------------------------------------------------------------------------------------

/// The engine state captured by one manifest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    /// Next transaction identifier to allocate.
    pub next_tranc_id: u64,

    /// Largest identifier known committed or rolled back.
    pub max_finished_tranc_id: u64,

    /// Watermark of transactions whose records are durable in SSTs;
    /// WAL recovery skips groups at or below it.
    pub flushed_tranc_id: u64,

    /// Next SST identifier to allocate.
    pub next_sst_id: u64,

    /// Active WAL segment sequence at snapshot time.
    pub wal_seq: u64,

    /// SST ids per level; index 0 is L0, newest-first within it,
    /// deeper levels sorted by first key.
    pub levels: Vec<Vec<u64>>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            next_tranc_id: 1,
            max_finished_tranc_id: 0,
            flushed_tranc_id: 0,
            next_sst_id: 1,
            wal_seq: 0,
            levels: Vec::new(),
        }
    }
}

impl ManifestData {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(MANIFEST_MAGIC);
        buf.put_u64_le(self.next_tranc_id);
        buf.put_u64_le(self.max_finished_tranc_id);
        buf.put_u64_le(self.flushed_tranc_id);
        buf.put_u64_le(self.next_sst_id);
        buf.put_u64_le(self.wal_seq);
        buf.put_u32_le(self.levels.len() as u32);
        for level in &self.levels {
            buf.put_u32_le(level.len() as u32);
            for sst_id in level {
                buf.put_u64_le(*sst_id);
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.len() < 4 {
            return Err(ManifestError::Corruption("snapshot shorter than its checksum".into()));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(ManifestError::Corruption(format!(
                "snapshot crc mismatch (stored {stored:08x}, computed {computed:08x})"
            )));
        }

        let mut reader = ByteReader::new(payload);
        let magic = reader.read_u32()?;
        if magic != MANIFEST_MAGIC {
            return Err(ManifestError::Corruption(format!(
                "bad manifest magic {magic:08x}"
            )));
        }

        let next_tranc_id = reader.read_u64()?;
        let max_finished_tranc_id = reader.read_u64()?;
        let flushed_tranc_id = reader.read_u64()?;
        let next_sst_id = reader.read_u64()?;
        let wal_seq = reader.read_u64()?;
        let level_count = reader.read_u32()? as usize;
        let mut levels = Vec::with_capacity(level_count);
        for _ in 0..level_count {
            let count = reader.read_u32()? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(reader.read_u64()?);
            }
            levels.push(ids);
        }

        Ok(Self {
            next_tranc_id,
            max_finished_tranc_id,
            flushed_tranc_id,
            next_sst_id,
            wal_seq,
            levels,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest handle
// ------------------------------------------------------------------------------------------------

/// Handle on the manifest file of one engine directory.
pub struct Manifest {
    dir: PathBuf,
}

impl Manifest {
    /// Creates a handle rooted at the engine directory.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Loads the snapshot, or `None` on a fresh directory.
    pub fn load(&self) -> Result<Option<ManifestData>, ManifestError> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let data = ManifestData::decode(&bytes)?;
        debug!(
            next_tranc_id = data.next_tranc_id,
            flushed_tranc_id = data.flushed_tranc_id,
            levels = data.levels.len(),
            "manifest loaded"
        );
        Ok(Some(data))
    }

    /// Atomically replaces the snapshot: tmp file, fsync, rename over,
    /// directory fsync.
    pub fn persist(&self, data: &ManifestData) -> Result<(), ManifestError> {
        let bytes = data.encode();
        let tmp_path = self.dir.join(MANIFEST_TMP_FILE);
        let final_path = self.dir.join(MANIFEST_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        info!(
            next_tranc_id = data.next_tranc_id,
            max_finished_tranc_id = data.max_finished_tranc_id,
            flushed_tranc_id = data.flushed_tranc_id,
            wal_seq = data.wal_seq,
            "manifest persisted"
        );
        Ok(())
    }
}
