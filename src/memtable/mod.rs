//! # MemTable Module
//!
//! The in-memory half of the LSM tree: one mutable current
//! [`SkipList`] plus an ordered deque of frozen skiplists awaiting
//! flush.
//!
//! ## Design Invariants
//!
//! - A frozen table is immutable from the moment it enters the deque.
//! - The newest record for any key lives in the current table or the
//!   front of the deque (front = newest).
//! - The oldest frozen table (back of the deque) is the sole flush
//!   target.
//!
//! ## Locking
//!
//! Two reader-writer locks guard the structure: `cur_mtx` over the
//! current table and `frozen_mtx` over the deque. The lock order is
//! **current before frozen, never reversed**:
//!
//! - Writers take `cur_mtx` exclusively up front (no shared-to-
//!   exclusive upgrades); when the write pushes the current table past
//!   its size threshold they additionally take `frozen_mtx`
//!   exclusively and freeze.
//! - Readers take `cur_mtx` shared, and only after releasing it take
//!   `frozen_mtx` shared. A freeze interleaved between the two lookups
//!   can only move records from current to frozen — the direction is
//!   monotone — so a record present at the start of the read cannot be
//!   missed.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeSet, VecDeque},
    path::Path,
    sync::{Arc, RwLock},
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::skiplist::{SkipList, SkipListEntry};
use crate::sstable::{BlockCache, Sst, SstBuilder, SstError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// SST construction failed during a flush.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

struct FrozenTables {
    /// Front = newest frozen table, back = next flush target.
    tables: VecDeque<Arc<SkipList>>,

    /// Sum of the frozen tables' byte footprints.
    bytes: usize,
}

/// Mutable write buffer plus frozen read-only history.
pub struct MemTable {
    /// `cur_mtx` — guards the current table.
    current: RwLock<Arc<SkipList>>,

    /// `frozen_mtx` — guards the frozen deque.
    frozen: RwLock<FrozenTables>,

    /// Current-table size that triggers an automatic freeze.
    freeze_threshold: usize,
}

impl MemTable {
    /// Creates an empty memtable freezing at `freeze_threshold` bytes.
    pub fn new(freeze_threshold: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(SkipList::new())),
            frozen: RwLock::new(FrozenTables {
                tables: VecDeque::new(),
                bytes: 0,
            }),
            freeze_threshold,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts one record, freezing the current table when it outgrows
    /// the threshold.
    pub fn put(&self, key: &[u8], value: &[u8], tranc_id: u64) -> Result<(), MemTableError> {
        trace!(tranc_id, "memtable put");
        let mut current = self.write_current()?;
        current.put(key, value, tranc_id);
        self.maybe_freeze(&mut current)
    }

    /// Inserts a batch of records under one lock acquisition.
    pub fn put_batch(
        &self,
        records: &[(Bytes, Bytes)],
        tranc_id: u64,
    ) -> Result<(), MemTableError> {
        trace!(tranc_id, count = records.len(), "memtable put_batch");
        let mut current = self.write_current()?;
        for (key, value) in records {
            current.put(key, value, tranc_id);
        }
        self.maybe_freeze(&mut current)
    }

    /// Writes an empty-value tombstone for `key`.
    pub fn remove(&self, key: &[u8], tranc_id: u64) -> Result<(), MemTableError> {
        trace!(tranc_id, "memtable remove");
        let mut current = self.write_current()?;
        current.put(key, b"", tranc_id);
        self.maybe_freeze(&mut current)
    }

    /// Writes tombstones for a batch of keys.
    pub fn remove_batch(&self, keys: &[Bytes], tranc_id: u64) -> Result<(), MemTableError> {
        trace!(tranc_id, count = keys.len(), "memtable remove_batch");
        let mut current = self.write_current()?;
        for key in keys {
            current.put(key, b"", tranc_id);
        }
        self.maybe_freeze(&mut current)
    }

    /// Freezes the current table if it crossed the threshold. Takes
    /// `frozen_mtx` exclusively while still holding `cur_mtx` — the
    /// required lock order.
    fn maybe_freeze(
        &self,
        current: &mut std::sync::RwLockWriteGuard<'_, Arc<SkipList>>,
    ) -> Result<(), MemTableError> {
        if current.get_size() > self.freeze_threshold {
            let mut frozen = self.write_frozen()?;
            Self::freeze_locked(current, &mut frozen);
            debug!(
                frozen_tables = frozen.tables.len(),
                frozen_bytes = frozen.bytes,
                "current table exceeded threshold and was frozen"
            );
        }
        Ok(())
    }

    /// Moves the current table to the front of the deque and installs
    /// a fresh one. Both locks must be held exclusively.
    fn freeze_locked(
        current: &mut std::sync::RwLockWriteGuard<'_, Arc<SkipList>>,
        frozen: &mut FrozenTables,
    ) {
        let old = std::mem::replace(&mut **current, Arc::new(SkipList::new()));
        frozen.bytes += old.get_size();
        frozen.tables.push_front(old);
    }

    /// Explicitly freezes the current table, even below the threshold.
    pub fn frozen_cur_table(&self) -> Result<(), MemTableError> {
        let mut current = self.write_current()?;
        if current.is_empty() {
            return Ok(());
        }
        let mut frozen = self.write_frozen()?;
        Self::freeze_locked(&mut current, &mut frozen);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Returns the newest entry for `key` visible at `tranc_id`
    /// (0 disables MVCC filtering).
    ///
    /// Commit order and identifier order can diverge — a transaction
    /// that began early may commit (and land in the current table)
    /// after a later-numbered transaction was already frozen — so the
    /// candidate from the current table is compared against every
    /// frozen table and the largest visible `tranc_id` wins.
    ///
    /// Tombstones are returned like live entries so the caller can
    /// stop the layered search.
    pub fn get(&self, key: &[u8], tranc_id: u64) -> Result<Option<SkipListEntry>, MemTableError> {
        let mut best: Option<SkipListEntry> = {
            let current = self.read_current()?;
            current.get(key, tranc_id)
        }; // release cur_mtx before taking frozen_mtx

        let frozen = self.read_frozen()?;
        for table in &frozen.tables {
            if let Some(entry) = table.get(key, tranc_id)
                && best.as_ref().is_none_or(|b| entry.tranc_id > b.tranc_id)
            {
                best = Some(entry);
            }
        }
        Ok(best)
    }

    /// Point-looks-up a batch of keys with the two-phase locking of
    /// [`MemTable::get`]: one pass over the current table, then one
    /// pass over the frozen tables comparing candidates by
    /// `tranc_id`.
    pub fn get_batch(
        &self,
        keys: &[Bytes],
        tranc_id: u64,
    ) -> Result<Vec<(Bytes, Option<SkipListEntry>)>, MemTableError> {
        let mut results: Vec<(Bytes, Option<SkipListEntry>)> = {
            let current = self.read_current()?;
            keys.iter()
                .map(|key| (key.clone(), current.get(key, tranc_id)))
                .collect()
        };

        let frozen = self.read_frozen()?;
        for (key, slot) in results.iter_mut() {
            for table in &frozen.tables {
                if let Some(entry) = table.get(key, tranc_id)
                    && slot.as_ref().is_none_or(|b| entry.tranc_id > b.tranc_id)
                {
                    *slot = Some(entry);
                }
            }
        }
        Ok(results)
    }

    // --------------------------------------------------------------------------------------------
    // Scans
    // --------------------------------------------------------------------------------------------

    /// Materializes one entry run per table, newest table first
    /// (current, then frozen front-to-back), for heap merging.
    pub fn scan_all(&self) -> Result<Vec<Vec<SkipListEntry>>, MemTableError> {
        let current = self.read_current()?;
        let frozen = self.read_frozen()?;

        let mut runs = Vec::with_capacity(1 + frozen.tables.len());
        runs.push(current.scan_all());
        for table in &frozen.tables {
            runs.push(table.scan_all());
        }
        Ok(runs)
    }

    /// Per-table runs of the entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<SkipListEntry>>, MemTableError> {
        let current = self.read_current()?;
        let frozen = self.read_frozen()?;

        let mut runs = Vec::with_capacity(1 + frozen.tables.len());
        runs.push(current.scan_prefix(prefix));
        for table in &frozen.tables {
            runs.push(table.scan_prefix(prefix));
        }
        Ok(runs)
    }

    /// Per-table runs of the entries selected by a monotone three-way
    /// predicate.
    pub fn scan_monotone(
        &self,
        pred: &(dyn Fn(&[u8]) -> i32 + Sync),
    ) -> Result<Vec<Vec<SkipListEntry>>, MemTableError> {
        let current = self.read_current()?;
        let frozen = self.read_frozen()?;

        let mut runs = Vec::with_capacity(1 + frozen.tables.len());
        runs.push(current.scan_monotone(pred).unwrap_or_default());
        for table in &frozen.tables {
            runs.push(table.scan_monotone(pred).unwrap_or_default());
        }
        Ok(runs)
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flushes the oldest frozen table into an SST.
    ///
    /// When the deque is empty the current table is frozen first; when
    /// that too is empty, returns `None`. Every distinct `tranc_id`
    /// that appears in the flushed table is appended to
    /// `flushed_tids`, letting the engine advance its durability
    /// watermark.
    ///
    /// `frozen_mtx` is held exclusively for the whole build, so a
    /// reader can never observe the gap between "popped from the
    /// deque" and "registered as an SST".
    pub fn flush_last(
        &self,
        mut builder: SstBuilder,
        path: &Path,
        sst_id: u64,
        flushed_tids: &mut Vec<u64>,
        cache: Arc<BlockCache>,
    ) -> Result<Option<Arc<Sst>>, MemTableError> {
        // Lock order: current before frozen.
        let mut current = self.write_current()?;
        let mut frozen = self.write_frozen()?;

        if frozen.tables.is_empty() {
            if current.is_empty() {
                debug!("flush_last: nothing to flush");
                return Ok(None);
            }
            Self::freeze_locked(&mut current, &mut frozen);
        }
        drop(current); // writers may proceed against the new current

        let table = frozen
            .tables
            .back()
            .cloned()
            .ok_or_else(|| MemTableError::Internal("frozen deque emptied unexpectedly".into()))?;

        let mut seen_tids = BTreeSet::new();
        for (key, value, tranc_id) in table.flush() {
            seen_tids.insert(tranc_id);
            builder.add(&key, &value, tranc_id);
        }
        let sst = builder.build(sst_id, path, cache)?;

        frozen.tables.pop_back();
        frozen.bytes = frozen.bytes.saturating_sub(table.get_size());
        flushed_tids.extend(seen_tids);

        info!(
            sst_id,
            path = %path.display(),
            entries = table.len(),
            remaining_frozen = frozen.tables.len(),
            "oldest frozen table flushed to SST"
        );
        Ok(Some(Arc::new(sst)))
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance / size queries
    // --------------------------------------------------------------------------------------------

    /// Drops every table, current and frozen.
    pub fn clear(&self) -> Result<(), MemTableError> {
        let mut current = self.write_current()?;
        let mut frozen = self.write_frozen()?;
        *current = Arc::new(SkipList::new());
        frozen.tables.clear();
        frozen.bytes = 0;
        info!("memtable cleared");
        Ok(())
    }

    /// Bytes held by the current table.
    pub fn get_cur_size(&self) -> usize {
        self.read_current().map(|c| c.get_size()).unwrap_or(0)
    }

    /// Bytes held by the frozen tables.
    pub fn get_frozen_size(&self) -> usize {
        self.read_frozen().map(|f| f.bytes).unwrap_or(0)
    }

    /// Total bytes held in memory.
    pub fn get_total_size(&self) -> usize {
        self.get_cur_size() + self.get_frozen_size()
    }

    /// Number of frozen tables awaiting flush.
    pub fn frozen_count(&self) -> usize {
        self.read_frozen().map(|f| f.tables.len()).unwrap_or(0)
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn read_current(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, Arc<SkipList>>, MemTableError> {
        self.current
            .read()
            .map_err(|_| MemTableError::Internal("cur_mtx poisoned".into()))
    }

    fn write_current(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, Arc<SkipList>>, MemTableError> {
        self.current
            .write()
            .map_err(|_| MemTableError::Internal("cur_mtx poisoned".into()))
    }

    fn read_frozen(&self) -> Result<std::sync::RwLockReadGuard<'_, FrozenTables>, MemTableError> {
        self.frozen
            .read()
            .map_err(|_| MemTableError::Internal("frozen_mtx poisoned".into()))
    }

    fn write_frozen(&self) -> Result<std::sync::RwLockWriteGuard<'_, FrozenTables>, MemTableError> {
        self.frozen
            .write()
            .map_err(|_| MemTableError::Internal("frozen_mtx poisoned".into()))
    }
}
