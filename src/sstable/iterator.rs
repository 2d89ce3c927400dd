//! Streaming reader over an SST's entries.
//!
//! Yields `(key, value, tranc_id)` triples in `(key ASC, tranc_id
//! DESC)` order, loading one block at a time through the shared block
//! cache. The item type matches the merge layer's source streams, so
//! an `SstIterator` plugs straight into a heap merge.
//!
//! Corruption encountered mid-scan is logged and terminates the
//! stream; point reads surface the same condition as an error through
//! [`Sst::get`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::error;

use super::{Block, Sst};

/// Monotone three-way range predicate, boxed for storage.
type RangePredicate = Box<dyn Fn(&[u8]) -> i32 + Send>;

/// Iterator over the entries of one SST.
pub struct SstIterator {
    sst: Arc<Sst>,
    /// MVCC bound; entries above it are skipped.
    snapshot: u64,
    block_idx: usize,
    entry_idx: usize,
    block: Option<Arc<Block>>,
    pred: Option<RangePredicate>,
    done: bool,
}

impl SstIterator {
    /// Full scan. `tranc_id == 0` disables MVCC filtering.
    pub fn new(sst: Arc<Sst>, tranc_id: u64) -> Self {
        Self {
            sst,
            snapshot: if tranc_id == 0 { u64::MAX } else { tranc_id },
            block_idx: 0,
            entry_idx: 0,
            block: None,
            pred: None,
            done: false,
        }
    }

    /// Range scan over a monotone predicate: starts at the first block
    /// that can contain an in-range key and stops at the first key
    /// right of the range.
    pub fn with_predicate<F>(sst: Arc<Sst>, tranc_id: u64, pred: F) -> Self
    where
        F: Fn(&[u8]) -> i32 + Send + 'static,
    {
        // Blocks whose successor's first key is still left of the
        // range cannot hold an in-range entry.
        let start_block = sst
            .metas()
            .partition_point(|m| pred(m.first_key.as_ref()) < 0)
            .saturating_sub(1);

        Self {
            sst,
            snapshot: if tranc_id == 0 { u64::MAX } else { tranc_id },
            block_idx: start_block,
            entry_idx: 0,
            block: None,
            pred: Some(Box::new(pred)),
            done: false,
        }
    }

    fn current_block(&mut self) -> Option<Arc<Block>> {
        if self.block.is_none() {
            if self.block_idx >= self.sst.block_count() {
                return None;
            }
            match self.sst.read_block(self.block_idx) {
                Ok(block) => self.block = Some(block),
                Err(err) => {
                    error!(
                        sst_id = self.sst.sst_id(),
                        block = self.block_idx,
                        error = %err,
                        "SST scan aborted by unreadable block"
                    );
                    return None;
                }
            }
        }
        self.block.clone()
    }
}

impl Iterator for SstIterator {
    type Item = (Bytes, Bytes, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let Some(block) = self.current_block() else {
                self.done = true;
                break;
            };

            let Some(entry) = block.entries().get(self.entry_idx) else {
                // Block exhausted; move on.
                self.block = None;
                self.block_idx += 1;
                self.entry_idx = 0;
                continue;
            };
            self.entry_idx += 1;

            if let Some(pred) = &self.pred {
                match pred(entry.key.as_ref()) {
                    n if n < 0 => continue,
                    0 => {}
                    _ => {
                        self.done = true;
                        break;
                    }
                }
            }
            if entry.tranc_id > self.snapshot {
                continue;
            }
            return Some((entry.key.clone(), entry.value.clone(), entry.tranc_id));
        }
        None
    }
}
