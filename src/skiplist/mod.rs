//! # SkipList Module
//!
//! Ordered in-memory multi-version index.
//!
//! ## Design Invariants
//!
//! - Entries are ordered by `(key ASC, tranc_id DESC)`: among entries
//!   for the same key the newest transaction sorts first.
//! - Multiple entries with the same key but different `tranc_id`
//!   coexist; a duplicate `(key, tranc_id)` pair is impossible by
//!   construction — a transaction overwriting its own write replaces
//!   the entry in place.
//! - A tombstone is an entry whose value is empty.
//! - The byte footprint is tracked incrementally and is an upper-bound
//!   approximation of resident memory.
//!
//! ## Concurrency
//!
//! The underlying [`SkipMap`] is lock-free; the memtable layer adds
//! the reader-writer discipline (a single writer at a time per table,
//! any number of readers). Scans materialize their matching run so the
//! result set is stable regardless of concurrent inserts.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

/// Sentinel `tranc_id` that disables MVCC filtering on reads.
pub const NO_SNAPSHOT: u64 = 0;

/// Fixed per-node bookkeeping charged to the byte footprint on top of
/// key and value lengths.
const NODE_OVERHEAD: usize = 16;

// ------------------------------------------------------------------------------------------------
// Key and entry types
// ------------------------------------------------------------------------------------------------

/// Composite key of a skiplist node: user key plus the transaction
/// that wrote it.
///
/// Ordering is `key ASC, tranc_id DESC`, so a range scan starting at
/// `(k, snapshot)` lands on the newest version of `k` visible at
/// `snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedKey {
    /// User key bytes.
    pub key: Bytes,

    /// Transaction that wrote this version.
    pub tranc_id: u64,
}

impl VersionedKey {
    /// Creates a composite key.
    pub fn new(key: Bytes, tranc_id: u64) -> Self {
        Self { key, tranc_id }
    }
}

impl Ord for VersionedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            // Descending on tranc_id: the newest version sorts first.
            Ordering::Equal => other.tranc_id.cmp(&self.tranc_id),
            ord => ord,
        }
    }
}

impl PartialOrd for VersionedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One versioned entry read out of a skiplist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipListEntry {
    /// User key bytes.
    pub key: Bytes,

    /// Stored value; empty marks a tombstone.
    pub value: Bytes,

    /// Transaction that wrote this version.
    pub tranc_id: u64,
}

impl SkipListEntry {
    /// True when this entry marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// SkipList
// ------------------------------------------------------------------------------------------------

/// Ordered multi-version map backing a memtable.
pub struct SkipList {
    map: SkipMap<VersionedKey, Bytes>,
    size_bytes: AtomicUsize,
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipList {
    /// Creates an empty skiplist.
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
        }
    }

    /// Inserts a version of `key` written by `tranc_id`.
    ///
    /// An empty `value` is a tombstone. Re-inserting the same
    /// `(key, tranc_id)` pair replaces the previous value in place —
    /// a transaction overwriting its own earlier write.
    pub fn put(&self, key: &[u8], value: &[u8], tranc_id: u64) {
        let vkey = VersionedKey::new(Bytes::copy_from_slice(key), tranc_id);

        if let Some(prev) = self.map.get(&vkey) {
            // Same-transaction overwrite: only the value delta counts.
            self.size_bytes
                .fetch_sub(prev.value().len(), AtomicOrdering::Relaxed);
        } else {
            self.size_bytes
                .fetch_add(key.len() + NODE_OVERHEAD, AtomicOrdering::Relaxed);
        }
        self.size_bytes
            .fetch_add(value.len(), AtomicOrdering::Relaxed);

        self.map.insert(vkey, Bytes::copy_from_slice(value));
    }

    /// Returns the newest entry for `key` whose writer is visible at
    /// `tranc_id` (`tid' ≤ tranc_id`). Passing [`NO_SNAPSHOT`] returns
    /// the newest entry regardless of writer.
    ///
    /// A tombstone is returned like any other entry; distinguishing
    /// "deleted" from "absent" is the caller's concern.
    pub fn get(&self, key: &[u8], tranc_id: u64) -> Option<SkipListEntry> {
        let snapshot = if tranc_id == NO_SNAPSHOT {
            u64::MAX
        } else {
            tranc_id
        };
        let lower = VersionedKey::new(Bytes::copy_from_slice(key), snapshot);

        let entry = self.map.range(lower..).next()?;
        if entry.key().key.as_ref() != key {
            return None;
        }
        Some(SkipListEntry {
            key: entry.key().key.clone(),
            value: entry.value().clone(),
            tranc_id: entry.key().tranc_id,
        })
    }

    /// Materializes every entry in `(key ASC, tranc_id DESC)` order.
    pub fn scan_all(&self) -> Vec<SkipListEntry> {
        self.map
            .iter()
            .map(|e| SkipListEntry {
                key: e.key().key.clone(),
                value: e.value().clone(),
                tranc_id: e.key().tranc_id,
            })
            .collect()
    }

    /// Materializes the run of entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Vec<SkipListEntry> {
        let lower = VersionedKey::new(Bytes::copy_from_slice(prefix), u64::MAX);
        let mut out = Vec::new();
        for e in self.map.range(lower..) {
            if !e.key().key.starts_with(prefix) {
                break;
            }
            out.push(SkipListEntry {
                key: e.key().key.clone(),
                value: e.value().clone(),
                tranc_id: e.key().tranc_id,
            });
        }
        out
    }

    /// Materializes the run of entries selected by a monotone
    /// three-way predicate: `pred(key)` returns a negative value left
    /// of the range, `0` inside it, and a positive value right of it.
    ///
    /// Returns `None` when no key satisfies the predicate. The scan
    /// stops at the first key right of the range, so the cost is the
    /// skipped prefix plus the matching run.
    pub fn scan_monotone<F>(&self, pred: F) -> Option<Vec<SkipListEntry>>
    where
        F: Fn(&[u8]) -> i32,
    {
        let mut out = Vec::new();
        for e in self.map.iter() {
            match pred(e.key().key.as_ref()) {
                n if n < 0 => continue,
                0 => out.push(SkipListEntry {
                    key: e.key().key.clone(),
                    value: e.value().clone(),
                    tranc_id: e.key().tranc_id,
                }),
                _ => break,
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Drains every entry in sorted order for SST construction.
    ///
    /// The skiplist itself is not mutated — frozen tables are dropped
    /// wholesale once their SST is durable.
    pub fn flush(&self) -> Vec<(Bytes, Bytes, u64)> {
        self.map
            .iter()
            .map(|e| (e.key().key.clone(), e.value().clone(), e.key().tranc_id))
            .collect()
    }

    /// Approximate resident bytes of this table.
    pub fn get_size(&self) -> usize {
        self.size_bytes.load(AtomicOrdering::Relaxed)
    }

    /// Number of versioned entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
