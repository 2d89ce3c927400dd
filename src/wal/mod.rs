//! # Write-Ahead Log Module
//!
//! Append-only record log with buffered grouped writes, segment
//! rotation, crash recovery and background segment reclamation.
//!
//! ## Design Overview
//!
//! Commits hand the WAL a batch of [`Record`]s. Batches accumulate in
//! an in-memory buffer and are drained to disk — serialize, append,
//! fsync — once the buffer reaches `buffer_size` records or the caller
//! forces a flush (synchronous commits). The internal mutex is held
//! across the fsync, so the append order of drained batches is the
//! commit order of the engine.
//!
//! The log is a sequence of segment files `wal.<seq>.log` with a
//! monotonically increasing `seq` starting at 0. When the active
//! segment exceeds `file_size_limit` after a drain, the writer rotates
//! to the next sequence number. A segment's lifecycle is
//! `OPEN → SEALED` (rotation) `→ RECLAIMABLE` (every transaction it
//! holds is durable in SSTs) `→ DELETED` (cleaner).
//!
//! ## Recovery
//!
//! [`Wal::recover`] reads every segment in sequence order and groups
//! records by `tranc_id`. Only groups terminated by a COMMIT marker
//! are returned for replay; groups ending in ROLLBACK or lacking a
//! terminator (abandoned contexts, crashed commits) are discarded.
//! Groups whose `tranc_id` is at or below the durable watermark are
//! already reflected in SSTs and are skipped. A corrupt or truncated
//! record terminates parsing of its segment — fully parsed prior
//! records are kept — and recovery continues with later segments.
//!
//! ## Cleaning
//!
//! A background thread wakes on an interval and deletes sealed
//! segments whose highest `tranc_id` is at or below the durable
//! watermark (advanced by the engine only after the manifest
//! reflecting a flush has been fsynced), once enough reclaimable
//! segments have accumulated to make the pass worthwhile.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

pub mod record;

pub use record::{MAX_RECORD_PAYLOAD, OpType, Record};

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::EncodingError;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding error while reading a segment.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A record's payload exceeds what the wire format can carry.
    #[error("Record payload exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options / recovery result
// ------------------------------------------------------------------------------------------------

/// Runtime options for the WAL, taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Records buffered before an automatic drain.
    pub buffer_size: usize,

    /// Segment size that triggers rotation, in bytes.
    pub file_size_limit: u64,

    /// Cleaner wake-up interval.
    pub clean_interval: Duration,

    /// Reclaimable segments required before the cleaner deletes.
    pub clean_threshold: usize,
}

/// Result of scanning the log directory on startup.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Committed record groups, keyed by `tranc_id`, each ending with
    /// its COMMIT marker.
    pub committed: BTreeMap<u64, Vec<Record>>,

    /// Highest `tranc_id` observed anywhere in the log, including
    /// rolled-back and unterminated groups. Identifiers are never
    /// reused, so the allocator must resume above this.
    pub max_tranc_id_seen: u64,
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

struct WalInner {
    file: File,
    written: u64,
    buffer: Vec<Record>,
}

/// Buffered, segmented write-ahead log.
pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    inner: Mutex<WalInner>,
    /// Sequence number of the active segment.
    seq: Arc<AtomicU64>,
    /// Watermark of transactions durable in SSTs; segments entirely at
    /// or below it are reclaimable.
    durable_tranc_id: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens the log in `dir`, resuming the highest existing segment,
    /// and starts the background cleaner.
    ///
    /// `durable_tranc_id` is shared with the engine, which advances it
    /// after each flush once the manifest is durable.
    pub fn open(
        dir: &Path,
        options: WalOptions,
        durable_tranc_id: Arc<AtomicU64>,
    ) -> Result<Self, WalError> {
        let start_seq = list_segments(dir)?.last().map(|(seq, _)| *seq).unwrap_or(0);
        let path = segment_path(dir, start_seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        info!(path = %path.display(), seq = start_seq, written, "WAL opened");

        let seq = Arc::new(AtomicU64::new(start_seq));
        let shutdown = Arc::new(AtomicBool::new(false));

        let wal = Self {
            dir: dir.to_path_buf(),
            options: options.clone(),
            inner: Mutex::new(WalInner {
                file,
                written,
                buffer: Vec::new(),
            }),
            seq: Arc::clone(&seq),
            durable_tranc_id: Arc::clone(&durable_tranc_id),
            shutdown: Arc::clone(&shutdown),
            cleaner: Mutex::new(None),
        };
        wal.spawn_cleaner()?;
        Ok(wal)
    }

    /// Appends a batch of records to the log buffer.
    ///
    /// The buffer is drained — serialized, appended to the active
    /// segment and fsynced — when it reaches `buffer_size` records or
    /// when `force_flush` is set. The internal mutex is held across
    /// the fsync, so concurrent callers see a total append order.
    pub fn log(&self, records: &[Record], force_flush: bool) -> Result<(), WalError> {
        for record in records {
            if record.encoded_len() > u16::MAX as usize {
                return Err(WalError::RecordTooLarge(record.encoded_len()));
            }
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        inner.buffer.extend_from_slice(records);
        trace!(
            appended = records.len(),
            buffered = inner.buffer.len(),
            "WAL records buffered"
        );

        if force_flush || inner.buffer.len() >= self.options.buffer_size {
            self.drain_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Unconditionally drains the buffer and fsyncs the segment.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        self.drain_locked(&mut inner)
    }

    /// Serializes and persists the buffered records, rotating the
    /// segment afterwards when it outgrew `file_size_limit`.
    fn drain_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        if !inner.buffer.is_empty() {
            let mut bytes = Vec::new();
            for record in &inner.buffer {
                record.encode_to(&mut bytes);
            }
            inner.file.write_all(&bytes)?;
            inner.file.sync_all()?;
            inner.written += bytes.len() as u64;

            debug!(
                records = inner.buffer.len(),
                bytes = bytes.len(),
                segment = self.seq.load(Ordering::Acquire),
                "WAL buffer drained"
            );
            inner.buffer.clear();
        } else {
            inner.file.sync_all()?;
        }

        if inner.written >= self.options.file_size_limit {
            self.rotate_locked(inner)?;
        }
        Ok(())
    }

    /// Seals the active segment and opens the next one.
    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        let next_seq = self.seq.load(Ordering::Acquire) + 1;
        let path = segment_path(&self.dir, next_seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(path = %path.display(), seq = next_seq, "WAL segment rotated");

        inner.file.sync_all()?;
        inner.file = file;
        inner.written = 0;
        self.seq.store(next_seq, Ordering::Release);
        Ok(())
    }

    /// Number of records currently buffered in memory.
    pub fn buffered_records(&self) -> usize {
        self.inner.lock().map(|inner| inner.buffer.len()).unwrap_or(0)
    }

    /// Sequence number of the active segment.
    pub fn active_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Deletes every segment and restarts the log at sequence 0.
    ///
    /// Used by `Engine::clear`; any buffered records are discarded.
    pub fn reset(&self) -> Result<(), WalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        inner.buffer.clear();
        for (_, path) in list_segments(&self.dir)? {
            fs::remove_file(&path)?;
        }

        let path = segment_path(&self.dir, 0);
        inner.file = OpenOptions::new().create(true).append(true).open(&path)?;
        inner.written = 0;
        self.seq.store(0, Ordering::Release);

        info!(dir = %self.dir.display(), "WAL reset");
        Ok(())
    }

    /// Flushes outstanding records and joins the cleaner thread.
    pub fn close(&self) -> Result<(), WalError> {
        let result = self.flush();
        self.shutdown.store(true, Ordering::Release);
        if let Ok(mut guard) = self.cleaner.lock()
            && let Some(handle) = guard.take()
        {
            handle.thread().unpark();
            let _ = handle.join();
        }
        result
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Scans every segment in `dir` and reconstructs the committed
    /// record groups above the durable watermark.
    pub fn recover(dir: &Path, durable_tranc_id: u64) -> Result<WalRecovery, WalError> {
        let mut groups: BTreeMap<u64, Vec<Record>> = BTreeMap::new();
        let mut terminated: BTreeMap<u64, OpType> = BTreeMap::new();
        let mut max_seen = 0u64;

        for (seq, path) in list_segments(dir)? {
            let bytes = fs::read(&path)?;
            let (records, tail_error) = Record::decode_stream(&bytes);
            if let Some(err) = tail_error {
                warn!(
                    segment = seq,
                    parsed = records.len(),
                    error = %err,
                    "WAL segment has a corrupt tail; keeping fully parsed records"
                );
            }
            debug!(segment = seq, records = records.len(), "WAL segment scanned");

            for record in records {
                max_seen = max_seen.max(record.tranc_id);
                match record.op {
                    OpType::Commit | OpType::Rollback => {
                        terminated.insert(record.tranc_id, record.op);
                        groups.entry(record.tranc_id).or_default().push(record);
                    }
                    _ => groups.entry(record.tranc_id).or_default().push(record),
                }
            }
        }

        let committed: BTreeMap<u64, Vec<Record>> = groups
            .into_iter()
            .filter(|(tranc_id, _)| {
                *tranc_id > durable_tranc_id
                    && terminated.get(tranc_id) == Some(&OpType::Commit)
            })
            .collect();

        info!(
            committed = committed.len(),
            max_seen, durable_tranc_id, "WAL recovery complete"
        );

        Ok(WalRecovery {
            committed,
            max_tranc_id_seen: max_seen,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Cleaner
    // --------------------------------------------------------------------------------------------

    fn spawn_cleaner(&self) -> Result<(), WalError> {
        let dir = self.dir.clone();
        let seq = Arc::clone(&self.seq);
        let durable = Arc::clone(&self.durable_tranc_id);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.options.clean_interval;
        let threshold = self.options.clean_threshold;

        let handle = thread::Builder::new()
            .name("wal-cleaner".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let active = seq.load(Ordering::Acquire);
                    let watermark = durable.load(Ordering::Acquire);
                    match clean_segments(&dir, active, watermark, threshold) {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, watermark, "WAL segments reclaimed"),
                        Err(err) => warn!(error = %err, "WAL cleaner pass failed"),
                    }
                }
            })
            .map_err(|e| WalError::Internal(format!("failed to spawn wal-cleaner: {e}")))?;

        if let Ok(mut guard) = self.cleaner.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.flush() {
            error!(error = %err, "WAL flush failed on drop");
        }
        if let Ok(mut guard) = self.cleaner.lock()
            && let Some(handle) = guard.take()
        {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Segment helpers
// ------------------------------------------------------------------------------------------------

/// Path of segment `seq` inside `dir`.
fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal.{seq}.log"))
}

/// Parses a segment sequence number out of a file name.
fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal.")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

/// Lists `(seq, path)` for every segment in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && let Some(seq) = parse_segment_name(name)
        {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Deletes sealed segments whose every record is durable.
///
/// A segment qualifies when its highest `tranc_id` is at or below
/// `watermark`; deletion only happens once at least `threshold`
/// segments qualify. Segments with decode errors are left alone.
/// Returns the number of deleted segments.
pub(crate) fn clean_segments(
    dir: &Path,
    active_seq: u64,
    watermark: u64,
    threshold: usize,
) -> Result<usize, WalError> {
    let mut reclaimable = Vec::new();

    for (seq, path) in list_segments(dir)? {
        if seq >= active_seq {
            continue;
        }
        let bytes = fs::read(&path)?;
        let (records, tail_error) = Record::decode_stream(&bytes);
        if tail_error.is_some() {
            warn!(segment = seq, "skipping corrupt sealed segment during cleaning");
            continue;
        }
        let max_tid = records.iter().map(|r| r.tranc_id).max().unwrap_or(0);
        if max_tid <= watermark {
            trace!(segment = seq, max_tid, watermark, "segment reclaimable");
            reclaimable.push(path);
        }
    }

    if reclaimable.len() < threshold {
        return Ok(0);
    }
    let count = reclaimable.len();
    for path in reclaimable {
        fs::remove_file(&path)?;
    }
    Ok(count)
}
