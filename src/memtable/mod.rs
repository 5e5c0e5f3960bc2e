//! # Memtable Module
//!
//! The in-memory sorted write buffer of the LSM engine. Two
//! implementations sit behind the common [`MemTable`] trait:
//!
//! - [`RbTreeTable`] — an arena-based red-black tree with the standard
//!   recoloring and rotation rules.
//! - [`SkipListTable`] — a skip list with maximum height 12 and
//!   branching factor 4.
//!
//! ## Design Invariants
//!
//! - Entries are kept in ascending key order; [`MemTable::export`]
//!   yields one entry per key.
//! - Deletes are tombstones, not physical removal: a deleted key stays
//!   in the table with its tombstone bit set so the flush path can
//!   persist the deletion.
//! - Every insert updates a running data-size counter; once the counter
//!   crosses [`TABLE_MAX_SIZE`] the table reports itself full and the
//!   engine rotates it.
//!
//! Callers provide exclusive access for writes and shared access for
//! reads (the engine wraps the table in its own `RwLock`).

pub mod rbtree;
pub mod skiplist;


pub use rbtree::RbTreeTable;
pub use skiplist::SkipListTable;

/// Memtable size threshold before a flush is required (4 MiB).
pub const TABLE_MAX_SIZE: usize = 4 * 1024 * 1024;

/// A single memtable entry. `tombstone` marks a logical deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key bytes.
    pub key: Vec<u8>,

    /// The value bytes; empty for tombstones.
    pub value: Vec<u8>,

    /// Whether this entry represents a deletion.
    pub tombstone: bool,
}

impl Entry {
    /// Approximate in-memory footprint used by the size counter:
    /// key and value bytes plus the fixed per-record overhead the
    /// SSTable layout charges (`keyLen + valueLen + 8`).
    pub fn charged_size(&self) -> usize {
        self.key.len() + self.value.len() + 8
    }
}

/// Outcome of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemFindResult {
    /// The key holds a live value.
    Value(Vec<u8>),

    /// The key was deleted by a tombstone.
    Tombstone,

    /// The table has no entry for the key.
    NotFound,
}

/// Common interface over the two memtable variants.
///
/// One level of dynamic dispatch per operation — the call sites in the
/// engine go through `Box<dyn MemTable>` selected by [`MemTableKind`].
/// The engine shares tables across threads behind its own lock, hence
/// the `Send + Sync` bound.
pub trait MemTable: Send + Sync {
    /// Inserts or replaces an entry.
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>, tombstone: bool);

    /// Writes a tombstone for `key`. Returns whether the key held a
    /// live value beforehand.
    fn delete(&mut self, key: &[u8]) -> bool;

    /// Point lookup.
    fn find(&self, key: &[u8]) -> MemFindResult;

    /// All entries in ascending key order, tombstones included.
    fn export(&self) -> Vec<Entry>;

    /// Number of distinct keys (tombstones included).
    fn len(&self) -> usize;

    /// Whether the table holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Running data-size counter.
    fn data_size(&self) -> usize;

    /// Whether the size counter has crossed [`TABLE_MAX_SIZE`].
    fn is_full(&self) -> bool;
}

/// Selects the memtable implementation at engine open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemTableKind {
    /// Skip list (max height 12, branching factor 4).
    #[default]
    SkipList,

    /// Red-black tree.
    RedBlack,
}

/// Constructs an empty memtable of the configured kind.
pub fn new_memtable(kind: MemTableKind) -> Box<dyn MemTable> {
    match kind {
        MemTableKind::SkipList => Box::new(SkipListTable::new()),
        MemTableKind::RedBlack => Box::new(RbTreeTable::new()),
    }
}
