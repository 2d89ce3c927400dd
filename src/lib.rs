//! # MeridianDB
//!
//! An embeddable, transactional key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** with multi-version
//! concurrency control and crash recovery via a write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Engine                              │
//! │                                                            │
//! │  TranContext ──commit──► WAL ──apply──► MemTable           │
//! │  (pending records)    (segments)   ┌───────────────────┐   │
//! │                                    │ current skiplist  │   │
//! │                                    │ frozen skiplists  │   │
//! │                                    └────────┬──────────┘   │
//! │                                       flush │              │
//! │                                             ▼              │
//! │   L0 ─── L1 ─── … ─── Lmax   (SSTs + block cache)          │
//! │        compaction                                          │
//! │                                                            │
//! │   manifest  (atomic snapshot of counters and levels)       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Engine façade — open, recover, flush, compact, statistics |
//! | [`transaction`] | Transaction contexts, isolation levels, commit/rollback |
//! | [`memtable`] | Mutable skiplist plus frozen deque with two-lock discipline |
//! | [`skiplist`] | Ordered multi-version index, `(key ASC, tranc_id DESC)` |
//! | [`merge`] | Heap-based k-way merge with MVCC filtering |
//! | [`sstable`] | Immutable sorted tables, bloom filters, block cache |
//! | [`wal`] | Segmented write-ahead log, recovery, background cleaning |
//! | [`manifest`] | Atomic rename-over metadata snapshot |
//! | [`compaction`] | Leveled compaction policy and execution |
//! | [`encoding`] | Bounds-checked little-endian decoding primitives |
//!
//! ## Key guarantees
//!
//! - **Durability** — a commit with `force_sync` survives any crash;
//!   an unsynced commit is applied atomically or not at all.
//! - **Snapshot reads** — a reader at snapshot `S` sees exactly the
//!   committed records with `tranc_id ≤ S`; the largest visible
//!   identifier wins per key and an empty value marks a deletion.
//! - **Ordered commits** — WAL append order, memtable apply order and
//!   commit order coincide.
//! - **Disjoint levels** — SST key ranges in every level below L0 are
//!   pairwise disjoint; compaction preserves every version a live
//!   reader could still need.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meridiandb::engine::{Engine, EngineConfig};
//! use meridiandb::transaction::IsolationLevel;
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default())?;
//!
//! let mut tran = engine.begin_tran(IsolationLevel::RepeatableRead)?;
//! tran.put(b"hello", b"world")?;
//! tran.commit(true)?;
//!
//! let tran = engine.begin_tran(IsolationLevel::ReadCommitted)?;
//! assert_eq!(tran.get(b"hello")?.as_deref(), Some(b"world".as_ref()));
//!
//! engine.close()?;
//! # Ok::<(), meridiandb::engine::EngineError>(())
//! ```

pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod skiplist;
pub mod sstable;
pub mod transaction;
pub mod wal;
