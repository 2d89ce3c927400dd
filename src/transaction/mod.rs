//! # Transaction Module
//!
//! MVCC transaction contexts over the storage engine.
//!
//! ## Lifecycle
//!
//! [`crate::engine::Engine::begin_tran`] allocates a monotone,
//! never-reused `tranc_id` and hands out a [`TranContext`]. Mutations
//! buffer into the context — a CREATE marker followed by PUT/DELETE
//! records — and reach the WAL only at [`TranContext::commit`], which
//! appends the pending list plus a COMMIT marker (fsynced when
//! `force_sync` is set) and then applies the batch to the memtable.
//! The WAL append and the memtable apply happen under the engine's
//! commit lock, so commit order, WAL order and apply order coincide.
//!
//! [`TranContext::rollback`] appends a ROLLBACK marker and discards
//! the pending list. Dropping an active context abandons it: nothing
//! is logged, and recovery discards the group for lack of a COMMIT.
//! Both paths, and a successful commit, move the context into a
//! terminal state; any further operation is a
//! [`EngineError::TransactionState`] error.
//!
//! ## Visibility
//!
//! Reads see the context's own pending writes first, then the engine
//! at a visibility identifier chosen by isolation level:
//!
//! - `ReadUncommitted` — no filtering (everything applied is seen).
//! - `ReadCommitted` — re-resolved at every call from the engine's
//!   `max_finished_tranc_id`.
//! - `RepeatableRead` / `Serializable` — pinned at begin.
//!
//! `Serializable` additionally validates at commit that no written
//! key gained a committed version newer than the pinned snapshot;
//! a violation fails the commit with [`EngineError::Conflict`] and
//! rolls the context back.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::engine::{EngineError, LsmInner};
use crate::wal::{MAX_RECORD_PAYLOAD, Record};

// ------------------------------------------------------------------------------------------------
// Isolation levels / state
// ------------------------------------------------------------------------------------------------

/// Isolation level of a transaction context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// No snapshot filtering on reads.
    ReadUncommitted,
    /// Reads re-resolve against the latest committed state per call.
    ReadCommitted,
    /// Reads pin the committed state observed at begin.
    RepeatableRead,
    /// `RepeatableRead` plus write-write conflict detection at commit.
    Serializable,
}

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranState {
    Active,
    Committed,
    RolledBack,
}

// ------------------------------------------------------------------------------------------------
// TranContext
// ------------------------------------------------------------------------------------------------

/// A single transaction over the engine.
///
/// Not `Sync`: one context belongs to one caller. Concurrency comes
/// from many contexts, not from sharing one.
pub struct TranContext {
    tranc_id: u64,
    isolation: IsolationLevel,
    inner: Arc<LsmInner>,
    /// Records in insertion order; starts with the CREATE marker.
    pending: Vec<Record>,
    /// Own-writes overlay: empty value marks a pending delete.
    local: BTreeMap<Bytes, Bytes>,
    /// Committed state observed at begin; the read bound for
    /// `RepeatableRead` and `Serializable`.
    read_snapshot: u64,
    state: TranState,
}

impl TranContext {
    pub(crate) fn new(
        inner: Arc<LsmInner>,
        tranc_id: u64,
        isolation: IsolationLevel,
        read_snapshot: u64,
    ) -> Self {
        trace!(tranc_id, ?isolation, read_snapshot, "transaction started");
        Self {
            tranc_id,
            isolation,
            inner,
            pending: vec![Record::create(tranc_id)],
            local: BTreeMap::new(),
            read_snapshot,
            state: TranState::Active,
        }
    }

    /// This transaction's identifier.
    pub fn tranc_id(&self) -> u64 {
        self.tranc_id
    }

    /// This transaction's isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        match self.state {
            TranState::Active => Ok(()),
            TranState::Committed => Err(EngineError::TransactionState(format!(
                "transaction {} already committed",
                self.tranc_id
            ))),
            TranState::RolledBack => Err(EngineError::TransactionState(format!(
                "transaction {} already rolled back",
                self.tranc_id
            ))),
        }
    }

    /// Identifier bounding what this context may read right now, or
    /// `None` when the snapshot predates every commit — identifier 0
    /// is the "no filtering" sentinel further down and must never
    /// reach the read path as a bound.
    fn engine_visibility(&self) -> Option<u64> {
        let tid = match self.isolation {
            IsolationLevel::ReadUncommitted => u64::MAX,
            IsolationLevel::ReadCommitted => self.inner.max_finished_tranc_id(),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => self.read_snapshot,
        };
        if tid == 0 { None } else { Some(tid) }
    }

    fn validate_payload(key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::InvalidArgument("empty key".into()));
        }
        if key.len() + value.len() > MAX_RECORD_PAYLOAD {
            return Err(EngineError::InvalidArgument(format!(
                "record payload of {} bytes exceeds the {MAX_RECORD_PAYLOAD}-byte limit",
                key.len() + value.len()
            )));
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------------------------------

    /// Buffers a write of `key → value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.ensure_active()?;
        Self::validate_payload(key, value)?;
        if value.is_empty() {
            return Err(EngineError::InvalidArgument(
                "empty value (use remove to delete a key)".into(),
            ));
        }

        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        self.pending
            .push(Record::put(self.tranc_id, key.clone(), value.clone()));
        self.local.insert(key, value);
        Ok(())
    }

    /// Buffers writes for a batch of pairs.
    pub fn put_batch(&mut self, pairs: &[(Bytes, Bytes)]) -> Result<(), EngineError> {
        for (key, value) in pairs {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Buffers a deletion of `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.ensure_active()?;
        Self::validate_payload(key, b"")?;

        let key = Bytes::copy_from_slice(key);
        self.pending.push(Record::delete(self.tranc_id, key.clone()));
        self.local.insert(key, Bytes::new());
        Ok(())
    }

    /// Buffers deletions for a batch of keys.
    pub fn remove_batch(&mut self, keys: &[Bytes]) -> Result<(), EngineError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Reads `key`, seeing this context's own pending writes first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, EngineError> {
        self.ensure_active()?;

        if let Some(value) = self.local.get(key) {
            return Ok(if value.is_empty() {
                None
            } else {
                Some(value.clone())
            });
        }

        let Some(tid) = self.engine_visibility() else {
            return Ok(None);
        };
        match self.inner.get_visible(key, tid)? {
            Some(entry) if !entry.is_tombstone() => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    /// Reads a batch of keys at one visibility identifier.
    pub fn get_batch(&self, keys: &[Bytes]) -> Result<Vec<(Bytes, Option<Bytes>)>, EngineError> {
        self.ensure_active()?;
        let visibility = self.engine_visibility();

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let value = if let Some(local) = self.local.get(key) {
                if local.is_empty() {
                    None
                } else {
                    Some(local.clone())
                }
            } else if let Some(tid) = visibility {
                match self.inner.get_visible(key, tid)? {
                    Some(entry) if !entry.is_tombstone() => Some(entry.value),
                    _ => None,
                }
            } else {
                None
            };
            results.push((key.clone(), value));
        }
        Ok(results)
    }

    /// Materializes every live pair visible to this context,
    /// overlaying pending writes.
    pub fn iter_all(&self) -> Result<Vec<(Bytes, Bytes)>, EngineError> {
        self.ensure_active()?;
        let mut engine_pairs = Vec::new();
        if let Some(tid) = self.engine_visibility() {
            engine_pairs = self
                .inner
                .scan_all(tid)?
                .map(|item| (item.key, item.value))
                .collect();
        }

        let local: Vec<(Bytes, Bytes)> = self
            .local
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(overlay(local, engine_pairs.into_iter()))
    }

    /// Materializes the live pairs whose key starts with `prefix`,
    /// overlaying pending writes.
    pub fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>, EngineError> {
        self.ensure_active()?;
        let mut engine_pairs = Vec::new();
        if let Some(tid) = self.engine_visibility() {
            engine_pairs = self
                .inner
                .scan_prefix(prefix, tid)?
                .map(|item| (item.key, item.value))
                .collect();
        }

        let local: Vec<(Bytes, Bytes)> = self
            .local
            .range(Bytes::copy_from_slice(prefix)..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(overlay(local, engine_pairs.into_iter()))
    }

    /// Materializes the live pairs selected by a monotone three-way
    /// predicate, overlaying pending writes.
    pub fn iter_monotone(
        &self,
        pred: Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>,
    ) -> Result<Vec<(Bytes, Bytes)>, EngineError> {
        self.ensure_active()?;
        let mut engine_pairs = Vec::new();
        if let Some(tid) = self.engine_visibility() {
            engine_pairs = self
                .inner
                .scan_monotone(Arc::clone(&pred), tid)?
                .map(|item| (item.key, item.value))
                .collect();
        }

        let local: Vec<(Bytes, Bytes)> = self
            .local
            .iter()
            .filter(|(k, _)| pred(k.as_ref()) == 0)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(overlay(local, engine_pairs.into_iter()))
    }

    // --------------------------------------------------------------------------------------------
    // Commit / rollback
    // --------------------------------------------------------------------------------------------

    /// Commits: appends the pending records plus a COMMIT marker to
    /// the WAL (fsynced when `force_sync`), then applies them to the
    /// memtable.
    ///
    /// A WAL failure rolls the context back; the partial tail left in
    /// the log has no COMMIT marker and is discarded by recovery.
    pub fn commit(&mut self, force_sync: bool) -> Result<(), EngineError> {
        self.ensure_active()?;

        if self.isolation == IsolationLevel::Serializable {
            self.check_conflicts()?;
        }

        let mut records = std::mem::take(&mut self.pending);
        records.push(Record::commit(self.tranc_id));

        match self.inner.commit_records(self.tranc_id, &records, force_sync) {
            Ok(()) => {
                self.state = TranState::Committed;
                self.inner.finish_tranc(self.tranc_id, self.read_snapshot);
                debug!(tranc_id = self.tranc_id, records = records.len(), "transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(tranc_id = self.tranc_id, error = %err, "commit failed; rolling back");
                self.state = TranState::RolledBack;
                self.inner.mark_finished(self.tranc_id);
                self.inner.finish_tranc(self.tranc_id, self.read_snapshot);
                Err(err)
            }
        }
    }

    /// Serializable write-write validation: every written key must be
    /// free of committed versions newer than the pinned snapshot.
    fn check_conflicts(&mut self) -> Result<(), EngineError> {
        for key in self.local.keys() {
            if let Some(entry) = self.inner.get_visible(key, u64::MAX)?
                && entry.tranc_id > self.read_snapshot
                && entry.tranc_id != self.tranc_id
            {
                warn!(
                    tranc_id = self.tranc_id,
                    conflicting_tranc_id = entry.tranc_id,
                    "serializable conflict"
                );
                self.state = TranState::RolledBack;
                self.inner.mark_finished(self.tranc_id);
                self.inner.finish_tranc(self.tranc_id, self.read_snapshot);
                return Err(EngineError::Conflict {
                    tranc_id: self.tranc_id,
                    newer_tranc_id: entry.tranc_id,
                });
            }
        }
        Ok(())
    }

    /// Rolls back: appends a ROLLBACK marker and discards the pending
    /// records.
    pub fn rollback(&mut self) -> Result<(), EngineError> {
        self.ensure_active()?;

        self.pending.clear();
        self.local.clear();
        self.state = TranState::RolledBack;

        let result = self.inner.log_rollback(self.tranc_id);
        self.inner.mark_finished(self.tranc_id);
        self.inner.finish_tranc(self.tranc_id, self.read_snapshot);
        debug!(tranc_id = self.tranc_id, "transaction rolled back");
        result
    }
}

impl Drop for TranContext {
    fn drop(&mut self) {
        if self.state == TranState::Active {
            // Abandoned: nothing reaches the WAL, recovery discards
            // the group, and the registrations are released so the
            // durability watermark and the GC snapshot can advance.
            trace!(tranc_id = self.tranc_id, "active transaction abandoned");
            self.inner.finish_tranc(self.tranc_id, self.read_snapshot);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Own-writes overlay
// ------------------------------------------------------------------------------------------------

/// Merges a sorted own-writes run over a sorted engine scan. The
/// local side wins on equal keys; its empty values suppress the key.
fn overlay(
    local: Vec<(Bytes, Bytes)>,
    engine: impl Iterator<Item = (Bytes, Bytes)>,
) -> Vec<(Bytes, Bytes)> {
    let mut out = Vec::new();
    let mut local_iter = local.into_iter().peekable();

    for (key, value) in engine {
        while let Some((lk, _)) = local_iter.peek() {
            if *lk < key {
                let (lk, lv) = local_iter.next().expect("peeked entry must exist");
                if !lv.is_empty() {
                    out.push((lk, lv));
                }
            } else {
                break;
            }
        }

        match local_iter.peek() {
            Some((lk, _)) if *lk == key => {
                let (lk, lv) = local_iter.next().expect("peeked entry must exist");
                if !lv.is_empty() {
                    out.push((lk, lv));
                }
            }
            _ => out.push((key, value)),
        }
    }

    for (lk, lv) in local_iter {
        if !lv.is_empty() {
            out.push((lk, lv));
        }
    }
    out
}
