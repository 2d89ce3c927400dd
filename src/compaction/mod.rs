//! # Compaction Module
//!
//! Level-based SST maintenance.
//!
//! ## Policy
//!
//! [`LeveledPolicy`] decides *when* and *what*: a level is over
//! budget when L0 reaches `level0_count` tables, or when a deeper
//! level `k` exceeds `level0_count × ratio^k` tables. Selection takes
//! one SST from the source level — the oldest in L0, the lowest key
//! range elsewhere — plus every key-range-overlapping SST of the next
//! level.
//!
//! ## Execution
//!
//! [`compact_task`] merges the selected tables through a merge-mode
//! [`HeapIterator`] (every version, tombstones included) and rewrites
//! them into the target level as one or more SSTs, splitting only at
//! key boundaries so target-level ranges stay pairwise disjoint.
//!
//! ## Garbage collection
//!
//! History is preserved verbatim except when compacting into the
//! deepest level. There, for each key, versions at or below the GC
//! watermark — the oldest live snapshot capped by
//! `max_finished_tranc_id` — collapse to their newest survivor, and
//! that survivor is itself dropped when it is a tombstone: no deeper
//! level exists that could still shadow it. A record above the
//! watermark is never touched.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::merge::{EntryStream, HeapIterator};
use crate::sstable::{BlockCache, Sst, SstBuilder, SstError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SST read or write failure.
    #[error("SST error: {0}")]
    Sst(#[from] SstError),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Policy
// ------------------------------------------------------------------------------------------------

/// One selected compaction: rewrite `source` plus `overlapping` into
/// `target_level`.
#[derive(Debug)]
pub struct CompactionTask {
    /// Level the source table comes from.
    pub source_level: usize,

    /// Level receiving the rewritten tables (`source_level + 1`).
    pub target_level: usize,

    /// The table being pushed down.
    pub source: Arc<Sst>,

    /// Target-level tables whose key ranges intersect the source.
    pub overlapping: Vec<Arc<Sst>>,
}

/// Count-based leveled compaction triggers.
#[derive(Debug, Clone)]
pub struct LeveledPolicy {
    level0_count: usize,
    ratio: usize,
    max_levels: usize,
}

impl LeveledPolicy {
    /// Creates a policy from the engine configuration.
    pub fn new(level0_count: usize, ratio: usize, max_levels: usize) -> Self {
        Self {
            level0_count: level0_count.max(1),
            ratio: ratio.max(2),
            max_levels: max_levels.max(2),
        }
    }

    /// Table budget of `level` before compaction triggers.
    pub fn level_capacity(&self, level: usize) -> usize {
        self.level0_count * self.ratio.pow(level as u32)
    }

    /// Deepest level index.
    pub fn bottom_level(&self) -> usize {
        self.max_levels - 1
    }

    /// Picks the first over-budget level, shallowest first, and builds
    /// its task. Returns `None` when every level fits its budget.
    ///
    /// L0 triggers when it reaches its capacity; deeper levels only
    /// when they exceed theirs.
    pub fn pick_task(&self, levels: &[Vec<Arc<Sst>>]) -> Option<CompactionTask> {
        for (level, tables) in levels.iter().enumerate() {
            if level >= self.bottom_level() {
                break;
            }
            let capacity = self.level_capacity(level).max(1);
            let over_budget = if level == 0 {
                tables.len() >= capacity
            } else {
                tables.len() > capacity
            };
            if !over_budget || tables.is_empty() {
                continue;
            }

            // L0 is ordered newest-first: push the oldest down. Deeper
            // levels are ordered by key: rewrite from the low end.
            let source = match level {
                0 => tables.last()?.clone(),
                _ => tables.first()?.clone(),
            };

            let overlapping: Vec<_> = levels
                .get(level + 1)
                .map(|next| {
                    next.iter()
                        .filter(|sst| {
                            sst.overlaps(source.first_key().as_ref(), source.last_key().as_ref())
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            debug!(
                level,
                source_sst = source.sst_id(),
                overlapping = overlapping.len(),
                "compaction task selected"
            );
            return Some(CompactionTask {
                source_level: level,
                target_level: level + 1,
                source,
                overlapping,
            });
        }
        None
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Merges a task's tables and writes the replacement SSTs.
///
/// `next_sst_id` allocates file ids; `deepest` enables tombstone and
/// version garbage collection below `watermark`. Returns the new
/// target-level tables in ascending key order.
#[allow(clippy::too_many_arguments)]
pub fn compact_task(
    task: &CompactionTask,
    next_sst_id: &mut dyn FnMut() -> u64,
    sst_dir: &Path,
    block_size: usize,
    sst_target_size: usize,
    cache: Arc<BlockCache>,
    deepest: bool,
    watermark: u64,
) -> Result<Vec<Arc<Sst>>, CompactionError> {
    // The source table is newer than anything in the target level, so
    // it gets the smaller source index for exact-duplicate ties.
    let mut streams: Vec<EntryStream> = Vec::with_capacity(1 + task.overlapping.len());
    streams.push(Box::new(task.source.iter(0)));
    for sst in &task.overlapping {
        streams.push(Box::new(sst.iter(0)));
    }
    let merged = HeapIterator::new_for_merge(streams);

    let mut outputs: Vec<Arc<Sst>> = Vec::new();
    let mut builder = SstBuilder::new(block_size);
    let mut last_key: Option<bytes::Bytes> = None;
    let mut kept_below_watermark = false;

    for item in merged {
        let key_changed = last_key.as_ref() != Some(&item.key);
        if key_changed {
            // Split only between keys, never inside a version run, so
            // target-level ranges stay disjoint.
            if !builder.is_empty() && builder.estimated_size() >= sst_target_size {
                let sealed = std::mem::replace(&mut builder, SstBuilder::new(block_size));
                outputs.push(finish_output(sealed, next_sst_id, sst_dir, &cache)?);
            }
            last_key = Some(item.key.clone());
            kept_below_watermark = false;
        }

        if deepest && item.tranc_id <= watermark {
            if kept_below_watermark {
                // An older version already shadowed by a kept survivor.
                continue;
            }
            kept_below_watermark = true;
            if item.is_tombstone() {
                // Nothing deeper can resurrect the key; the tombstone
                // is spent.
                continue;
            }
        }

        builder.add(&item.key, &item.value, item.tranc_id);
    }

    if !builder.is_empty() {
        outputs.push(finish_output(builder, next_sst_id, sst_dir, &cache)?);
    }

    info!(
        source_level = task.source_level,
        target_level = task.target_level,
        inputs = 1 + task.overlapping.len(),
        outputs = outputs.len(),
        deepest,
        watermark,
        "compaction rewrote tables"
    );
    Ok(outputs)
}

fn finish_output(
    builder: SstBuilder,
    next_sst_id: &mut dyn FnMut() -> u64,
    sst_dir: &Path,
    cache: &Arc<BlockCache>,
) -> Result<Arc<Sst>, CompactionError> {
    let sst_id = next_sst_id();
    let path = sst_dir.join(format!("sst.{sst_id}"));
    let sst = builder.build(sst_id, &path, Arc::clone(cache))?;
    Ok(Arc::new(sst))
}
