//! # Engine Module
//!
//! The storage engine façade: identifier allocation, visibility,
//! commit orchestration, flush and compaction triggers, crash
//! recovery.
//!
//! ## Layout
//!
//! One engine owns a directory containing WAL segments
//! (`wal.<seq>.log`), SST files (`sst.<id>`) and the `manifest`
//! snapshot. All state flows through [`LsmInner`], shared by the
//! public [`Engine`] handle, every live [`TranContext`] and the
//! background flusher.
//!
//! ## Write path
//!
//! A context buffers records until commit. Commit appends the group
//! to the WAL and applies it to the memtable under one commit lock,
//! so WAL order equals apply order equals commit order. When the
//! memtable total exceeds its bound the flusher thread is signalled;
//! it pops oldest-frozen tables into L0 SSTs, persists the manifest,
//! advances the durability watermark (which licenses WAL cleaning)
//! and evaluates compaction triggers.
//!
//! ## Read path
//!
//! Visibility is a pure function of `(record tranc_id, snapshot)`.
//! Point reads consult the memtable and every level, keeping the
//! largest visible identifier; tables whose `max_tranc_id` cannot
//! beat the current best are skipped. Scans heap-merge per-table
//! runs and SST streams with the same rule.
//!
//! ## Recovery
//!
//! `open` loads the manifest, opens the SSTs it lists (removing
//! orphan files from interrupted flushes), replays committed WAL
//! groups above the durability watermark into a fresh memtable and
//! resumes the identifier counters past everything seen.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionError, LeveledPolicy, compact_task};
use crate::manifest::{Manifest, ManifestData, ManifestError};
use crate::memtable::{MemTable, MemTableError};
use crate::merge::{EntryStream, HeapIterator};
use crate::skiplist::SkipListEntry;
use crate::sstable::{BlockCache, Sst, SstBuilder, SstError, new_block_cache};
use crate::transaction::{IsolationLevel, TranContext};
use crate::wal::{OpType, Record, Wal, WalError, WalOptions};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Error from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error from the memtable.
    #[error("MemTable error: {0}")]
    MemTable(#[from] MemTableError),

    /// Error from an SST.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Error from the manifest.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error from compaction.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Caller-supplied argument is unusable (empty key, oversized
    /// payload, …).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a committed or rolled-back context.
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Serializable validation found a newer committed writer.
    #[error("write-write conflict: transaction {tranc_id} overlaps committed transaction {newer_tranc_id}")]
    Conflict {
        /// The failing transaction.
        tranc_id: u64,
        /// The committed transaction that invalidated it.
        newer_tranc_id: u64,
    },

    /// Internal invariant violation (poisoned lock, impossible state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning knobs consumed at [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Current-memtable size triggering a freeze, in bytes.
    pub per_mem_size_limit: usize,

    /// Total memtable size triggering flushes, in bytes.
    pub tol_mem_size_limit: usize,

    /// Per-level growth factor for compaction budgets.
    pub sst_level_ratio: usize,

    /// L0 table count triggering compaction.
    pub level0_count: usize,

    /// Number of levels, L0 included.
    pub max_levels: usize,

    /// SST data-block target size, in bytes.
    pub block_size: usize,

    /// Block cache capacity, in blocks.
    pub block_cache_capacity: u64,

    /// WAL records buffered before an automatic drain.
    pub wal_buffer_size: usize,

    /// WAL segment rotation threshold, in bytes.
    pub wal_file_size_limit: u64,

    /// WAL cleaner wake-up interval.
    pub wal_clean_interval: Duration,

    /// Reclaimable segments required before the WAL cleaner deletes.
    pub wal_clean_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_mem_size_limit: 4 << 20,
            tol_mem_size_limit: 16 << 20,
            sst_level_ratio: 4,
            level0_count: 4,
            max_levels: 6,
            block_size: 4 << 10,
            block_cache_capacity: 1024,
            wal_buffer_size: 64,
            wal_file_size_limit: 4 << 20,
            wal_clean_interval: Duration::from_secs(10),
            wal_clean_threshold: 4,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Bytes held by the current memtable.
    pub memtable_cur_bytes: usize,

    /// Bytes held by frozen tables awaiting flush.
    pub memtable_frozen_bytes: usize,

    /// Frozen tables awaiting flush.
    pub frozen_count: usize,

    /// SST count per level.
    pub level_counts: Vec<usize>,

    /// SST bytes per level.
    pub level_bytes: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// LsmInner — shared engine state
// ------------------------------------------------------------------------------------------------

fn sst_path(dir: &Path, sst_id: u64) -> PathBuf {
    dir.join(format!("sst.{sst_id}"))
}

/// Shared core of the engine. Public within the crate so transaction
/// contexts can drive it; external callers go through [`Engine`].
pub struct LsmInner {
    config: EngineConfig,
    dir: PathBuf,
    memtable: MemTable,
    /// One lock per level; L0 newest-first, deeper levels sorted by
    /// first key with pairwise-disjoint ranges.
    levels: Vec<RwLock<Vec<Arc<Sst>>>>,
    block_cache: Arc<BlockCache>,
    wal: Wal,
    manifest: Manifest,
    policy: LeveledPolicy,

    next_tranc_id: AtomicU64,
    max_finished_tranc_id: AtomicU64,
    /// Watermark of transactions durable in SSTs; shared with the WAL
    /// cleaner and persisted in the manifest.
    flushed_tranc_id: Arc<AtomicU64>,
    next_sst_id: AtomicU64,

    /// Identifiers of live contexts; bounds the durability watermark.
    active_trancs: Mutex<BTreeSet<u64>>,
    /// Committed identifiers whose records are not yet durable in
    /// SSTs; bounds the durability watermark.
    unflushed_commits: Mutex<BTreeSet<u64>>,
    /// Read-snapshot refcounts of live contexts; bounds compaction GC.
    active_snapshots: Mutex<BTreeMap<u64, usize>>,

    /// Serializes WAL append + memtable apply so commit order, WAL
    /// order and apply order coincide.
    commit_mtx: Mutex<()>,
    /// Serializes flush/compaction manifest updates.
    maintenance_mtx: Mutex<()>,

    flush_tx: Sender<()>,
    shutdown: AtomicBool,
}

impl LsmInner {
    // --------------------------------------------------------------------------------------------
    // Identifier allocation and bookkeeping
    // --------------------------------------------------------------------------------------------

    /// Largest identifier known committed or rolled back.
    pub(crate) fn max_finished_tranc_id(&self) -> u64 {
        self.max_finished_tranc_id.load(Ordering::Acquire)
    }

    pub(crate) fn mark_finished(&self, tranc_id: u64) {
        self.max_finished_tranc_id
            .fetch_max(tranc_id, Ordering::AcqRel);
    }

    /// Allocates a fresh `tranc_id` and registers the context. The
    /// allocation happens under the active-set lock so the durability
    /// watermark can never advance past an id that is about to go
    /// live.
    fn begin_tranc(&self) -> Result<(u64, u64), EngineError> {
        let mut active = self
            .active_trancs
            .lock()
            .map_err(|_| EngineError::Internal("active_trancs lock poisoned".into()))?;
        let tranc_id = self.next_tranc_id.fetch_add(1, Ordering::AcqRel);
        active.insert(tranc_id);
        drop(active);

        let snapshot = self.max_finished_tranc_id();
        let mut snapshots = self
            .active_snapshots
            .lock()
            .map_err(|_| EngineError::Internal("active_snapshots lock poisoned".into()))?;
        *snapshots.entry(snapshot).or_insert(0) += 1;
        Ok((tranc_id, snapshot))
    }

    /// Releases a context's registrations.
    pub(crate) fn finish_tranc(&self, tranc_id: u64, snapshot: u64) {
        if let Ok(mut active) = self.active_trancs.lock() {
            active.remove(&tranc_id);
        }
        if let Ok(mut snapshots) = self.active_snapshots.lock() {
            if let Some(count) = snapshots.get_mut(&snapshot) {
                *count -= 1;
                if *count == 0 {
                    snapshots.remove(&snapshot);
                }
            }
        }
    }

    /// Oldest identifier any live reader may still need.
    fn gc_watermark(&self) -> u64 {
        let oldest_snapshot = self
            .active_snapshots
            .lock()
            .ok()
            .and_then(|s| s.keys().next().copied())
            .unwrap_or(u64::MAX);
        oldest_snapshot.min(self.max_finished_tranc_id())
    }

    /// Recomputes the durability watermark: everything at or below it
    /// is either durable in SSTs or was never committed. Persisted in
    /// the manifest before the shared atomic advances, so the WAL
    /// cleaner only acts on fsynced state.
    fn compute_durable_watermark(&self) -> u64 {
        let mut watermark = self.max_finished_tranc_id();
        if let Ok(unflushed) = self.unflushed_commits.lock()
            && let Some(min) = unflushed.iter().next()
        {
            watermark = watermark.min(min.saturating_sub(1));
        }
        if let Ok(active) = self.active_trancs.lock()
            && let Some(min) = active.iter().next()
        {
            watermark = watermark.min(min.saturating_sub(1));
        }
        watermark.max(self.flushed_tranc_id.load(Ordering::Acquire))
    }

    // --------------------------------------------------------------------------------------------
    // Commit path
    // --------------------------------------------------------------------------------------------

    /// Appends a commit group to the WAL and applies it to the
    /// memtable, all under the commit lock.
    pub(crate) fn commit_records(
        &self,
        tranc_id: u64,
        records: &[Record],
        force_sync: bool,
    ) -> Result<(), EngineError> {
        let batch: Vec<(Bytes, Bytes)> = records
            .iter()
            .filter_map(|r| match r.op {
                OpType::Put => Some((r.key.clone(), r.value.clone())),
                OpType::Delete => Some((r.key.clone(), Bytes::new())),
                _ => None,
            })
            .collect();

        {
            let _guard = self
                .commit_mtx
                .lock()
                .map_err(|_| EngineError::Internal("commit lock poisoned".into()))?;

            self.wal.log(records, force_sync)?;

            if !batch.is_empty() {
                if let Ok(mut unflushed) = self.unflushed_commits.lock() {
                    unflushed.insert(tranc_id);
                }
                self.memtable.put_batch(&batch, tranc_id)?;
            }
            self.mark_finished(tranc_id);
        }

        if self.memtable.get_total_size() > self.config.tol_mem_size_limit {
            // A full channel already carries a wake-up.
            let _ = self.flush_tx.try_send(());
        }
        Ok(())
    }

    /// Appends a ROLLBACK marker for an explicitly aborted context.
    pub(crate) fn log_rollback(&self, tranc_id: u64) -> Result<(), EngineError> {
        self.wal.log(&[Record::rollback(tranc_id)], false)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the entry with the largest `tranc_id ≤ snapshot` for
    /// `key` (`0` disables filtering), tombstones included.
    pub(crate) fn get_visible(
        &self,
        key: &[u8],
        snapshot: u64,
    ) -> Result<Option<SkipListEntry>, EngineError> {
        let snap = if snapshot == 0 { u64::MAX } else { snapshot };

        let mut best = self.memtable.get(key, snap)?;

        for level in &self.levels {
            let tables = level
                .read()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            for sst in tables.iter() {
                if let Some(b) = &best
                    && sst.max_tranc_id() <= b.tranc_id
                {
                    // Cannot hold a newer visible version.
                    continue;
                }
                if let Some(entry) = sst.get(key, snap)?
                    && best.as_ref().is_none_or(|b| entry.tranc_id > b.tranc_id)
                {
                    best = Some(SkipListEntry {
                        key: entry.key,
                        value: entry.value,
                        tranc_id: entry.tranc_id,
                    });
                }
            }
        }
        Ok(best)
    }

    fn collect_sources<F>(&self, memtable_runs: Vec<Vec<SkipListEntry>>, mut sst_stream: F)
        -> Result<Vec<EntryStream>, EngineError>
    where
        F: FnMut(&Arc<Sst>) -> EntryStream,
    {
        let mut sources: Vec<EntryStream> = Vec::new();
        for run in memtable_runs {
            sources.push(Box::new(
                run.into_iter().map(|e| (e.key, e.value, e.tranc_id)),
            ));
        }

        // L0 newest-first, one source per table; deeper levels are
        // disjoint and sorted, one chained source per level.
        for (idx, level) in self.levels.iter().enumerate() {
            let tables = level
                .read()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            if idx == 0 {
                for sst in tables.iter() {
                    sources.push(sst_stream(sst));
                }
            } else if !tables.is_empty() {
                let streams: Vec<EntryStream> = tables.iter().map(&mut sst_stream).collect();
                sources.push(Box::new(streams.into_iter().flatten()));
            }
        }
        Ok(sources)
    }

    /// Heap-merged scan of every live pair visible at `snapshot`.
    pub(crate) fn scan_all(&self, snapshot: u64) -> Result<HeapIterator, EngineError> {
        let runs = self.memtable.scan_all()?;
        let sources = self.collect_sources(runs, |sst| Box::new(sst.iter(snapshot)))?;
        Ok(HeapIterator::new(sources, snapshot))
    }

    /// Heap-merged scan of the live pairs whose key starts with
    /// `prefix`.
    pub(crate) fn scan_prefix(
        &self,
        prefix: &[u8],
        snapshot: u64,
    ) -> Result<HeapIterator, EngineError> {
        let runs = self.memtable.scan_prefix(prefix)?;
        let prefix: Bytes = Bytes::copy_from_slice(prefix);
        let sources = self.collect_sources(runs, |sst| {
            let prefix = prefix.clone();
            Box::new(sst.iter_monotone(
                move |key| {
                    if key < prefix.as_ref() {
                        -1
                    } else if key.starts_with(&prefix) {
                        0
                    } else {
                        1
                    }
                },
                snapshot,
            ))
        })?;
        Ok(HeapIterator::new(sources, snapshot))
    }

    /// Heap-merged scan over a monotone three-way predicate.
    pub(crate) fn scan_monotone(
        &self,
        pred: Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>,
        snapshot: u64,
    ) -> Result<HeapIterator, EngineError> {
        let runs = self.memtable.scan_monotone(&|key| pred(key))?;
        let sources = self.collect_sources(runs, |sst| {
            let pred = Arc::clone(&pred);
            Box::new(sst.iter_monotone(move |key| pred(key), snapshot))
        })?;
        Ok(HeapIterator::new(sources, snapshot))
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flushes the oldest frozen table into an L0 SST. Returns `false`
    /// when there was nothing to flush.
    fn flush_one(&self) -> Result<bool, EngineError> {
        let _guard = self
            .maintenance_mtx
            .lock()
            .map_err(|_| EngineError::Internal("maintenance lock poisoned".into()))?;

        let sst_id = self.next_sst_id.fetch_add(1, Ordering::AcqRel);
        let path = sst_path(&self.dir, sst_id);
        let builder = SstBuilder::new(self.config.block_size);
        let mut flushed_tids = Vec::new();

        // Hold the L0 lock across the build and the insertion so a
        // reader can never miss the records in flight.
        let flushed = {
            let mut l0 = self.levels[0]
                .write()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            match self.memtable.flush_last(
                builder,
                &path,
                sst_id,
                &mut flushed_tids,
                Arc::clone(&self.block_cache),
            )? {
                Some(sst) => {
                    l0.insert(0, sst);
                    true
                }
                None => false,
            }
        };
        if !flushed {
            return Ok(false);
        }

        if let Ok(mut unflushed) = self.unflushed_commits.lock() {
            for tid in &flushed_tids {
                unflushed.remove(tid);
            }
        }

        // Persist the manifest before advancing the shared watermark:
        // the WAL cleaner must only trust fsynced state.
        let watermark = self.compute_durable_watermark();
        self.persist_manifest(watermark)?;
        self.flushed_tranc_id.fetch_max(watermark, Ordering::AcqRel);

        debug!(sst_id, watermark, "flush complete");
        self.maybe_compact()?;
        Ok(true)
    }

    /// Freezes the current table and flushes until the memtable is
    /// empty.
    fn flush_all(&self) -> Result<(), EngineError> {
        self.memtable.frozen_cur_table()?;
        while self.flush_one()? {}
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Runs compactions until every level fits its budget.
    fn maybe_compact(&self) -> Result<(), EngineError> {
        loop {
            let task = {
                let snapshot = self.snapshot_levels()?;
                self.policy.pick_task(&snapshot)
            };
            let Some(task) = task else { return Ok(()) };

            // Writer locks on the two affected levels, ascending.
            let mut source_level = self.levels[task.source_level]
                .write()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            let mut target_level = self.levels[task.target_level]
                .write()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;

            let deepest = task.target_level == self.policy.bottom_level();
            let watermark = self.gc_watermark();
            let outputs = compact_task(
                &task,
                &mut || self.next_sst_id.fetch_add(1, Ordering::AcqRel),
                &self.dir,
                self.config.block_size,
                self.config.per_mem_size_limit,
                Arc::clone(&self.block_cache),
                deepest,
                watermark,
            )?;

            let source_id = task.source.sst_id();
            let replaced: Vec<u64> = task.overlapping.iter().map(|s| s.sst_id()).collect();
            source_level.retain(|sst| sst.sst_id() != source_id);
            target_level.retain(|sst| !replaced.contains(&sst.sst_id()));
            for sst in &outputs {
                target_level.push(Arc::clone(sst));
            }
            target_level.sort_by(|a, b| a.first_key().cmp(b.first_key()));
            drop(target_level);
            drop(source_level);

            self.persist_manifest(self.flushed_tranc_id.load(Ordering::Acquire))?;

            // Superseded files go away once every reader drops them.
            task.source.delete_file();
            for sst in &task.overlapping {
                sst.delete_file();
            }
            info!(
                source_level = task.source_level,
                target_level = task.target_level,
                outputs = outputs.len(),
                "compaction applied"
            );
        }
    }

    // --------------------------------------------------------------------------------------------
    // Manifest
    // --------------------------------------------------------------------------------------------

    fn snapshot_levels(&self) -> Result<Vec<Vec<Arc<Sst>>>, EngineError> {
        let mut snapshot = Vec::with_capacity(self.levels.len());
        for level in &self.levels {
            let tables = level
                .read()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            snapshot.push(tables.clone());
        }
        Ok(snapshot)
    }

    fn persist_manifest(&self, flushed_tranc_id: u64) -> Result<(), EngineError> {
        let levels: Vec<Vec<u64>> = self
            .snapshot_levels()?
            .iter()
            .map(|tables| tables.iter().map(|sst| sst.sst_id()).collect())
            .collect();

        self.manifest.persist(&ManifestData {
            next_tranc_id: self.next_tranc_id.load(Ordering::Acquire),
            max_finished_tranc_id: self.max_finished_tranc_id(),
            flushed_tranc_id,
            next_sst_id: self.next_sst_id.load(Ordering::Acquire),
            wal_seq: self.wal.active_seq(),
            levels,
        })?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Engine — public handle
// ------------------------------------------------------------------------------------------------

/// The public storage engine handle.
///
/// Owns the background flusher; dropping the handle closes the engine.
pub struct Engine {
    inner: Arc<LsmInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `dir` and recovers its
    /// durable state.
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // 1. Manifest.
        let manifest = Manifest::new(&dir);
        let data = manifest.load()?.unwrap_or_default();

        // 2. SSTs listed by the manifest; orphans from interrupted
        //    flushes are removed. A manifest with more levels than the
        //    configuration keeps its depth — tables are never dropped
        //    because a knob shrank.
        let level_count = config.max_levels.max(data.levels.len());
        let block_cache = new_block_cache(config.block_cache_capacity);
        let mut levels: Vec<RwLock<Vec<Arc<Sst>>>> = Vec::with_capacity(level_count);
        let mut max_sst_tid = 0u64;
        let mut known_ids = BTreeSet::new();
        for level_idx in 0..level_count {
            let ids = data.levels.get(level_idx).cloned().unwrap_or_default();
            let mut tables = Vec::with_capacity(ids.len());
            for id in ids {
                let sst = Arc::new(Sst::open(id, &sst_path(&dir, id), Arc::clone(&block_cache))?);
                max_sst_tid = max_sst_tid.max(sst.max_tranc_id());
                known_ids.insert(id);
                tables.push(sst);
            }
            levels.push(RwLock::new(tables));
        }
        remove_orphan_ssts(&dir, &known_ids)?;

        // 3. WAL replay above the durability watermark.
        let recovery = Wal::recover(&dir, data.flushed_tranc_id)?;
        let memtable = MemTable::new(config.per_mem_size_limit);
        let mut unflushed = BTreeSet::new();
        let mut max_replayed = 0u64;
        for (tranc_id, records) in &recovery.committed {
            let batch: Vec<(Bytes, Bytes)> = records
                .iter()
                .filter_map(|r| match r.op {
                    OpType::Put => Some((r.key.clone(), r.value.clone())),
                    OpType::Delete => Some((r.key.clone(), Bytes::new())),
                    _ => None,
                })
                .collect();
            if !batch.is_empty() {
                memtable.put_batch(&batch, *tranc_id)?;
                unflushed.insert(*tranc_id);
            }
            max_replayed = max_replayed.max(*tranc_id);
        }
        if !recovery.committed.is_empty() {
            info!(
                replayed = recovery.committed.len(),
                max_replayed, "committed WAL groups replayed into memtable"
            );
        }

        // 4. Counters resume past everything ever observed.
        let next_tranc_id = data
            .next_tranc_id
            .max(recovery.max_tranc_id_seen + 1)
            .max(max_sst_tid + 1);
        let max_finished = data
            .max_finished_tranc_id
            .max(max_replayed)
            .max(max_sst_tid)
            .max(data.flushed_tranc_id);
        let flushed_tranc_id = Arc::new(AtomicU64::new(data.flushed_tranc_id));

        // 5. WAL resumes on its highest segment; the cleaner watches
        //    the durability watermark.
        let wal = Wal::open(
            &dir,
            WalOptions {
                buffer_size: config.wal_buffer_size,
                file_size_limit: config.wal_file_size_limit,
                clean_interval: config.wal_clean_interval,
                clean_threshold: config.wal_clean_threshold,
            },
            Arc::clone(&flushed_tranc_id),
        )?;

        let (flush_tx, flush_rx) = bounded::<()>(1);
        let policy = LeveledPolicy::new(config.level0_count, config.sst_level_ratio, level_count);

        let inner = Arc::new(LsmInner {
            policy,
            memtable,
            levels,
            block_cache,
            wal,
            manifest,
            next_tranc_id: AtomicU64::new(next_tranc_id),
            max_finished_tranc_id: AtomicU64::new(max_finished),
            flushed_tranc_id,
            next_sst_id: AtomicU64::new(data.next_sst_id),
            active_trancs: Mutex::new(BTreeSet::new()),
            unflushed_commits: Mutex::new(unflushed),
            active_snapshots: Mutex::new(BTreeMap::new()),
            commit_mtx: Mutex::new(()),
            maintenance_mtx: Mutex::new(()),
            flush_tx,
            shutdown: AtomicBool::new(false),
            config,
            dir: dir.clone(),
        });

        let flusher = spawn_flusher(Arc::clone(&inner), flush_rx)
            .map_err(|e| EngineError::Internal(format!("failed to spawn lsm-flusher: {e}")))?;

        info!(
            dir = %dir.display(),
            next_tranc_id,
            max_finished,
            "engine opened"
        );
        Ok(Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
            closed: AtomicBool::new(false),
        })
    }

    /// Starts a transaction at the given isolation level.
    pub fn begin_tran(&self, isolation: IsolationLevel) -> Result<TranContext, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Internal("engine is closed".into()));
        }
        let (tranc_id, snapshot) = self.inner.begin_tranc()?;
        Ok(TranContext::new(
            Arc::clone(&self.inner),
            tranc_id,
            isolation,
            snapshot,
        ))
    }

    /// Freezes the current table and flushes every memtable to L0.
    pub fn flush_all(&self) -> Result<(), EngineError> {
        self.inner.flush_all()
    }

    /// Discards every record and resets the engine to an empty state.
    pub fn clear(&self) -> Result<(), EngineError> {
        let _commit = self
            .inner
            .commit_mtx
            .lock()
            .map_err(|_| EngineError::Internal("commit lock poisoned".into()))?;
        let _maintenance = self
            .inner
            .maintenance_mtx
            .lock()
            .map_err(|_| EngineError::Internal("maintenance lock poisoned".into()))?;

        self.inner.memtable.clear()?;
        for level in &self.inner.levels {
            let mut tables = level
                .write()
                .map_err(|_| EngineError::Internal("level lock poisoned".into()))?;
            for sst in tables.drain(..) {
                sst.delete_file();
            }
        }
        self.inner.wal.reset()?;

        if let Ok(mut unflushed) = self.inner.unflushed_commits.lock() {
            unflushed.clear();
        }
        self.inner.manifest.persist(&ManifestData {
            next_tranc_id: self.inner.next_tranc_id.load(Ordering::Acquire),
            max_finished_tranc_id: self.inner.max_finished_tranc_id(),
            flushed_tranc_id: self.inner.max_finished_tranc_id(),
            next_sst_id: self.inner.next_sst_id.load(Ordering::Acquire),
            wal_seq: 0,
            levels: vec![Vec::new(); self.inner.levels.len()],
        })?;
        self.inner
            .flushed_tranc_id
            .store(self.inner.max_finished_tranc_id(), Ordering::Release);

        info!("engine cleared");
        Ok(())
    }

    /// Returns current size statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let snapshot = self.inner.snapshot_levels()?;
        Ok(EngineStats {
            memtable_cur_bytes: self.inner.memtable.get_cur_size(),
            memtable_frozen_bytes: self.inner.memtable.get_frozen_size(),
            frozen_count: self.inner.memtable.frozen_count(),
            level_counts: snapshot.iter().map(|l| l.len()).collect(),
            level_bytes: snapshot
                .iter()
                .map(|l| l.iter().map(|sst| sst.file_size()).sum())
                .collect(),
        })
    }

    /// Per-level table snapshot for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn inner_levels_for_test(&self) -> Vec<Vec<Arc<Sst>>> {
        self.inner
            .snapshot_levels()
            .expect("level locks poisoned in test")
    }

    /// Flushes everything, persists the manifest and stops background
    /// work. Safe to call more than once.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Stop the flusher before the final foreground flush.
        self.inner.shutdown.store(true, Ordering::Release);
        let _ = self.inner.flush_tx.try_send(());
        if let Ok(mut guard) = self.flusher.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }

        self.inner.flush_all()?;
        self.inner
            .persist_manifest(self.inner.flushed_tranc_id.load(Ordering::Acquire))?;
        self.inner.wal.close()?;
        info!(dir = %self.inner.dir.display(), "engine closed");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(error = %err, "engine close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background flusher
// ------------------------------------------------------------------------------------------------

fn spawn_flusher(inner: Arc<LsmInner>, rx: Receiver<()>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("lsm-flusher".into())
        .spawn(move || {
            while rx.recv().is_ok() {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                while inner.memtable.get_total_size() > inner.config.tol_mem_size_limit {
                    match inner.flush_one() {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(err) => {
                            // The frozen table stays in place; the next
                            // signal retries.
                            error!(error = %err, "background flush failed");
                            break;
                        }
                    }
                }
            }
        })
}

// ------------------------------------------------------------------------------------------------
// Directory hygiene
// ------------------------------------------------------------------------------------------------

/// Removes `sst.<id>` files the manifest does not reference — debris
/// of a flush or compaction interrupted before its manifest update.
fn remove_orphan_ssts(dir: &Path, known_ids: &BTreeSet<u64>) -> Result<(), EngineError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id) = name.strip_prefix("sst.").and_then(|s| s.parse::<u64>().ok())
            && !known_ids.contains(&id)
        {
            warn!(sst_id = id, path = %path.display(), "removing orphan SST file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
