//! # ZpaperDB
//!
//! An embeddable, persistent key-value storage engine with **two
//! complementary write paths** sharing one persistence toolbox: an
//! update-in-place **B+Tree** with a buffered page cache, and a
//! **log-structured merge tree** whose memtable flushes into leveled,
//! immutable sorted-string tables.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐   ┌─────────────────────────────────┐
//! │        B+Tree Engine       │   │           LSM Engine            │
//! │  ┌────────┐  ┌──────────┐  │   │  ┌──────────┐   ┌───────────┐   │
//! │  │ B+Tree │──│  Buffer  │  │   │  │ Memtable │   │ SSTables  │   │
//! │  │ + ATT  │  │   Pool   │  │   │  │  + WAL   │   │ (leveled) │   │
//! │  └────┬───┘  └────┬─────┘  │   │  └────┬─────┘   └─────┬─────┘   │
//! │       │  page     │ flush  │   │       │  flush        │ merge   │
//! │       ▼  codec    ▼        │   │       ▼               ▼         │
//! │  ┌──────────────────────┐  │   │  ┌───────────────────────────┐  │
//! │  │  one file, 4 KiB     │  │   │  │ level<L>/ssTable<n> files │  │
//! │  │  pages               │  │   │  │ + bloom meta blocks       │  │
//! │  └──────────────────────┘  │   │  └───────────────────────────┘  │
//! └────────────────────────────┘   └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`btree`] | Ordered index over byte keys: split/merge, leaf chain, paged persistence, buffer pool |
//! | [`bloom`] | Probabilistic membership filter with a fixed six-function hash family |
//! | [`memtable`] | In-memory sorted write buffer — skip list or red-black tree |
//! | [`wal`] | CRC-protected, append-only operation log for crash recovery |
//! | [`sstable`] | Immutable block-structured tables: data blocks, bloom meta blocks, index, footer |
//! | [`compaction`] | Minor (flush) and major (leveled merge) background workers |
//! | [`lsm`] | The put/get/delete façade orchestrating all of the above |
//! | [`encoding`] | Deterministic little-endian wire format shared by every on-disk structure |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zpaperdb::lsm::{LsmConfig, LsmTree};
//!
//! let engine = LsmTree::open("/tmp/my_db", LsmConfig::default()).unwrap();
//!
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete(b"hello").unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! engine.close().unwrap();
//! ```
//!
//! The B+Tree engine is independent and file-backed:
//!
//! ```rust,no_run
//! use zpaperdb::btree::BTree;
//!
//! let tree = BTree::open(4, "/tmp/tree.db").unwrap();
//! tree.insert(42, "answer").unwrap();
//! assert_eq!(tree.search(42).unwrap().value, "answer");
//! tree.fsync_all().unwrap();
//! ```
//!
//! ## Durability
//!
//! - Every LSM mutation hits the WAL (with fsync) before the memtable.
//! - SSTables are written to a temporary path and renamed into place.
//! - Every on-disk block carries a CRC32; SSTables end with the magic
//!   `0xDB4775248B80FB57`.

pub mod bloom;
pub mod btree;
pub mod compaction;
pub mod encoding;
pub mod lsm;
pub mod memtable;
pub mod sstable;
pub mod wal;
