//! Heap-based k-way merge over versioned entry streams.
//!
//! Every read that touches more than one table — memtable scans,
//! engine range reads, compaction — funnels through [`HeapIterator`].
//! Sources are numbered by recency: the current memtable is source 0,
//! frozen tables follow in freeze order, then L0 SSTs newest-first,
//! then the deeper levels. Each source must yield entries in
//! `(key ASC, tranc_id DESC)` order.
//!
//! The comparator is `(key ASC, tranc_id DESC, source ASC)`: among
//! versions of one key the newest transaction pops first, and the
//! source index breaks exact `(key, tranc_id)` ties in favour of the
//! fresher source — such duplicates occur when WAL replay re-applies a
//! record that already reached an SST.
//!
//! Two consumption modes exist:
//!
//! - **Read mode** ([`HeapIterator::new`]): entries newer than the
//!   snapshot are skipped on insertion, superseded versions of a key
//!   are dropped on pop, and tombstones are swallowed. Yields strictly
//!   ascending unique live keys.
//! - **Merge mode** ([`HeapIterator::new_for_merge`]): every distinct
//!   `(key, tranc_id)` version and every tombstone passes through, in
//!   global sorted order. Compaction consumes this to rewrite SSTs
//!   without losing history.


use std::cmp::Ordering;
use std::collections::BinaryHeap;

use bytes::Bytes;

/// Boxed source stream: `(key, value, tranc_id)` in
/// `(key ASC, tranc_id DESC)` order.
pub type EntryStream = Box<dyn Iterator<Item = (Bytes, Bytes, u64)> + Send>;

/// One merged entry, tagged with the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchItem {
    /// User key bytes.
    pub key: Bytes,

    /// Stored value; empty marks a tombstone.
    pub value: Bytes,

    /// Transaction that wrote this version.
    pub tranc_id: u64,

    /// Index of the source stream (0 = newest).
    pub source: usize,
}

impl SearchItem {
    /// True when this item marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

impl Ord for SearchItem {
    /// `(key ASC, tranc_id DESC, source ASC)`.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.tranc_id.cmp(&self.tranc_id))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for SearchItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Heap wrapper inverting the order — `BinaryHeap` is a max-heap and
/// we pop the smallest item first.
struct HeapEntry(SearchItem);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0).reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge iterator over versioned entry streams.
pub struct HeapIterator {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<HeapEntry>,
    /// Snapshot bound; 0 disables MVCC filtering.
    snapshot: u64,
    /// Read mode when false: dedupe keys, hide tombstones.
    merge_mode: bool,
}

impl HeapIterator {
    /// Creates a read-mode iterator: MVCC-filtered at `snapshot`
    /// (0 = no filtering), one live entry per key, no tombstones.
    pub fn new(sources: Vec<EntryStream>, snapshot: u64) -> Self {
        Self::build(sources, snapshot, false)
    }

    /// Creates a merge-mode iterator: all versions and tombstones, in
    /// global `(key ASC, tranc_id DESC)` order. Exact `(key, tranc_id)`
    /// duplicates across sources are collapsed to the fresher source.
    pub fn new_for_merge(sources: Vec<EntryStream>) -> Self {
        Self::build(sources, 0, true)
    }

    fn build(mut sources: Vec<EntryStream>, snapshot: u64, merge_mode: bool) -> Self {
        let mut heap = BinaryHeap::new();
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(item) = Self::pull(source, idx, snapshot) {
                heap.push(HeapEntry(item));
            }
        }
        Self {
            sources,
            heap,
            snapshot,
            merge_mode,
        }
    }

    /// Pulls the next snapshot-visible item from one source.
    fn pull(source: &mut EntryStream, idx: usize, snapshot: u64) -> Option<SearchItem> {
        for (key, value, tranc_id) in source.by_ref() {
            if snapshot != 0 && tranc_id > snapshot {
                continue;
            }
            return Some(SearchItem {
                key,
                value,
                tranc_id,
                source: idx,
            });
        }
        None
    }

    fn refill(&mut self, idx: usize) {
        if let Some(item) = Self::pull(&mut self.sources[idx], idx, self.snapshot) {
            self.heap.push(HeapEntry(item));
        }
    }

    /// Pops and refills, discarding heap items matched by `superseded`.
    fn discard_while<F>(&mut self, superseded: F)
    where
        F: Fn(&SearchItem) -> bool,
    {
        while let Some(top) = self.heap.peek() {
            if !superseded(&top.0) {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must pop");
            self.refill(entry.0.source);
        }
    }
}

impl Iterator for HeapIterator {
    type Item = SearchItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.heap.pop()?.0;
            self.refill(item.source);

            if self.merge_mode {
                // Collapse exact duplicates only; older versions of the
                // key survive.
                let (key, tid) = (item.key.clone(), item.tranc_id);
                self.discard_while(|other| other.key == key && other.tranc_id == tid);
                return Some(item);
            }

            // Read mode: everything else under this key is superseded.
            let key = item.key.clone();
            self.discard_while(|other| other.key == key);

            if item.is_tombstone() {
                continue;
            }
            return Some(item);
        }
    }
}
