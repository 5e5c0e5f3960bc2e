//! # LSM Engine Façade
//!
//! The public put/get/delete surface of the log-structured merge tree.
//!
//! ## Design Overview
//!
//! Data lives in two layers, queried newest-first:
//!
//! 1. **Active memtable** — a sorted in-memory table (skip list or
//!    red-black tree) backed by the write-ahead log.
//! 2. **Leveled SSTables** — immutable sorted files under
//!    `level<L>/ssTable<n>`; level 0 receives memtable flushes, deeper
//!    levels receive compaction merges.
//!
//! Every mutation is appended to the WAL before it touches the
//! memtable. A write that finds the memtable past the configured
//! write-buffer size rotates and flushes it inline before proceeding,
//! so the table never grows more than one entry past the threshold;
//! the minor-compaction worker is also signalled as a best-effort
//! background path.
//!
//! ## Read path
//!
//! `get` consults the engine bloom filter first — a negative answer
//! short-circuits to not-found. Otherwise the memtable is searched,
//! then each level's tables newest-to-oldest; the sparse index inside
//! every table bounds the byte segment that is decoded and
//! binary-searched. The first hit wins; a tombstone hit reports the
//! key as absent.
//!
//! ## Guarantees
//!
//! - **Durability:** WAL append happens-before the memtable mutation;
//!   replay on open reconstructs unflushed writes.
//! - **Rotation ordering:** a rotation happens-before any write lands
//!   in the successor table.
//! - **Visibility:** a table joins its level list only after its bytes
//!   are written and fsynced.

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Sender, unbounded};
use thiserror::Error;
use tracing::{info, warn};

use crate::bloom::{BloomError, BloomFilter};
use crate::compaction::{self, Compactor};
use crate::memtable::{
    Entry, MemFindResult, MemTable, MemTableKind, TABLE_MAX_SIZE, new_memtable,
};
use crate::sstable::{SSTableError, SsTable, TableBuilder};
use crate::wal::{LogPrefix, LogRecord, Wal, WalError};

/// Number of levels tracked by the engine.
pub const MAX_LEVELS: usize = 20;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum LsmError {
    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// SSTable failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Bloom-filter construction failure.
    #[error("bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid argument (empty key, bad configuration).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration record carried by the engine.
///
/// The tunable constants of the system travel here instead of as
/// globals; every instance gets its own copy at open.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Memtable implementation to use.
    pub memtable_kind: MemTableKind,

    /// File count at which a level is merged into the next one.
    pub max_file_of_one_level: usize,

    /// False-positive probability for per-block bloom filters.
    pub filter_fpp: f64,

    /// Expected insertions sizing the engine-level bloom filter.
    pub expected_insertions: i64,

    /// Memtable size threshold triggering rotation.
    pub write_buffer_size: usize,

    /// Minimum spacing between minor-compaction iterations.
    pub minor_compact_interval: Duration,

    /// Polling period of the major-compaction worker.
    pub major_compact_interval: Duration,

    /// Whether the background workers are spawned at open. Disabled by
    /// callers that drive `flush`/`major_compact` explicitly.
    pub background_compaction: bool,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            memtable_kind: MemTableKind::SkipList,
            max_file_of_one_level: 10,
            filter_fpp: 0.05,
            expected_insertions: 10_000,
            write_buffer_size: TABLE_MAX_SIZE,
            minor_compact_interval: Duration::from_secs(10),
            major_compact_interval: Duration::from_secs(60),
            background_compaction: true,
        }
    }
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsmStats {
    /// Number of keys in the active memtable.
    pub memtable_len: usize,

    /// Approximate memtable size in bytes.
    pub memtable_size: usize,

    /// SSTable count per level.
    pub level_counts: Vec<usize>,
}

/// One on-disk table registered in a level.
struct TableHandle {
    id: u64,
    path: PathBuf,
    table: SsTable,
}

struct LsmInner {
    active: Box<dyn MemTable>,
    wal: Wal,
    levels: Vec<Vec<TableHandle>>,
    bloom: BloomFilter,
    next_table_id: u64,
    dir: PathBuf,
    config: LsmConfig,
}

/// The LSM engine handle. Cloning shares the same engine.
pub struct LsmTree {
    inner: Arc<RwLock<LsmInner>>,
    flush_tx: Sender<()>,
    compactor: Arc<Mutex<Option<Compactor>>>,
}

impl Clone for LsmTree {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            flush_tx: self.flush_tx.clone(),
            compactor: Arc::clone(&self.compactor),
        }
    }
}

impl LsmTree {
    /// Opens (or creates) an engine rooted at `dir`.
    ///
    /// Replays the WAL into a fresh memtable, loads every
    /// `level<L>/ssTable<n>` file from disk, rebuilds the engine bloom
    /// filter, and (unless disabled) spawns the compaction workers.
    pub fn open(dir: impl AsRef<Path>, config: LsmConfig) -> Result<Self, LsmError> {
        if !(config.filter_fpp > 0.0 && config.filter_fpp < 1.0) {
            return Err(LsmError::InvalidArgument(format!(
                "filter_fpp must be in (0, 1), got {}",
                config.filter_fpp
            )));
        }

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        // 1. WAL replay reconstructs the memtable lost in a crash.
        let wal = Wal::open(dir.join(crate::wal::WAL_FILE_NAME))?;
        let mut active = new_memtable(config.memtable_kind);
        let mut replayed = 0usize;
        for record in wal.replay() {
            match record {
                Ok(LogRecord {
                    prefix: LogPrefix::Insert,
                    key,
                    value,
                    ..
                }) => {
                    active.insert(key, value, false);
                    replayed += 1;
                }
                Ok(LogRecord {
                    prefix: LogPrefix::Delete,
                    key,
                    ..
                }) => {
                    active.insert(key, Vec::new(), true);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(error = %e, replayed, "WAL replay stopped at corrupt record");
                    break;
                }
            }
        }

        // 2. Discover on-disk tables.
        let (levels, next_table_id) = Self::discover_tables(&dir)?;

        // 3. Rebuild the engine bloom filter over every live key.
        let bloom = BloomFilter::new(config.filter_fpp, config.expected_insertions)?;
        for entry in active.export() {
            bloom.add(&entry.key);
        }
        for level in &levels {
            for handle in level {
                for entry in handle.table.iter_entries()? {
                    bloom.add(&entry.key);
                }
            }
        }

        info!(
            dir = %dir.display(),
            replayed,
            tables = levels.iter().map(Vec::len).sum::<usize>(),
            "LSM engine opened"
        );

        let (flush_tx, flush_rx) = unbounded();
        let engine = Self {
            inner: Arc::new(RwLock::new(LsmInner {
                active,
                wal,
                levels,
                bloom,
                next_table_id,
                dir,
                config: config.clone(),
            })),
            flush_tx,
            compactor: Arc::new(Mutex::new(None)),
        };

        if config.background_compaction {
            let compactor = Compactor::spawn(
                engine.clone(),
                flush_rx,
                config.minor_compact_interval,
                config.major_compact_interval,
            );
            *engine
                .compactor
                .lock()
                .map_err(|_| LsmError::Internal("mutex poisoned".into()))? = Some(compactor);
        }

        Ok(engine)
    }

    fn discover_tables(dir: &Path) -> Result<(Vec<Vec<TableHandle>>, u64), LsmError> {
        let mut levels: Vec<Vec<TableHandle>> = (0..MAX_LEVELS).map(|_| Vec::new()).collect();
        let mut max_id = 0u64;

        for (level, slot) in levels.iter_mut().enumerate() {
            let level_dir = dir.join(format!("level{level}"));
            if !level_dir.is_dir() {
                continue;
            }
            for dir_entry in fs::read_dir(&level_dir)? {
                let path = dir_entry?.path();
                let Some(id) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix("ssTable"))
                    .and_then(|n| n.parse::<u64>().ok())
                else {
                    continue;
                };
                let table = SsTable::open(&path)?;
                max_id = max_id.max(id);
                slot.push(TableHandle { id, path, table });
            }
            // Oldest first within a level; reads walk in reverse.
            slot.sort_by_key(|h| h.id);
        }

        Ok((levels, max_id + 1))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LsmInner>, LsmError> {
        self.inner
            .read()
            .map_err(|_| LsmError::Internal("RwLock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LsmInner>, LsmError> {
        self.inner
            .write()
            .map_err(|_| LsmError::Internal("RwLock poisoned".into()))
    }

    /// Inserts a key-value pair.
    ///
    /// A full memtable is rotated and flushed inline before the write
    /// proceeds, so the table never grows more than one entry past the
    /// write-buffer size. The WAL record is then appended (and fsynced)
    /// before the memtable is touched.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), LsmError> {
        if key.is_empty() {
            return Err(LsmError::InvalidArgument("key is empty".into()));
        }

        let mut inner = self.write()?;
        if Self::buffer_full(&inner) {
            Self::flush_inner(&mut inner)?;
        }

        inner.wal.append(&LogRecord {
            prefix: LogPrefix::Insert,
            timestamp: current_timestamp(),
            key: key.clone(),
            value: value.clone(),
        })?;
        inner.bloom.add(&key);
        inner.active.insert(key, value, false);

        if Self::buffer_full(&inner) {
            // Best-effort wake-up for the background worker; the next
            // write rotates inline regardless. The channel is unbounded,
            // so a pending signal simply coalesces with this one.
            let _ = self.flush_tx.send(());
        }
        Ok(())
    }

    /// Looks up a key. Returns `Ok(None)` for missing or deleted keys.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, LsmError> {
        let inner = self.read()?;
        match Self::lookup(&inner, key)? {
            Some(entry) if entry.tombstone => Ok(None),
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    /// Deletes a key by writing a tombstone through the normal write
    /// path; compaction elides it once it reaches the lowest level.
    /// Like [`LsmTree::put`], a full memtable is rotated and flushed
    /// inline before the tombstone is written.
    ///
    /// Returns whether the key was visible before the delete.
    pub fn delete(&self, key: &[u8]) -> Result<bool, LsmError> {
        if key.is_empty() {
            return Err(LsmError::InvalidArgument("key is empty".into()));
        }

        let mut inner = self.write()?;
        if Self::buffer_full(&inner) {
            Self::flush_inner(&mut inner)?;
        }

        let was_visible = matches!(
            Self::lookup(&inner, key)?,
            Some(Entry {
                tombstone: false,
                ..
            })
        );

        inner.wal.append(&LogRecord {
            prefix: LogPrefix::Delete,
            timestamp: current_timestamp(),
            key: key.to_vec(),
            value: Vec::new(),
        })?;
        inner.active.delete(key);

        if Self::buffer_full(&inner) {
            let _ = self.flush_tx.send(());
        }
        Ok(was_visible)
    }

    /// Whether the active memtable has crossed the configured
    /// write-buffer size.
    fn buffer_full(inner: &LsmInner) -> bool {
        inner.active.is_full() || inner.active.data_size() > inner.config.write_buffer_size
    }

    /// Newest-first resolution across the memtable and every level.
    fn lookup(inner: &LsmInner, key: &[u8]) -> Result<Option<Entry>, LsmError> {
        // Engine bloom filter: a negative is definitive.
        if !inner.bloom.query(key) {
            return Ok(None);
        }

        match inner.active.find(key) {
            MemFindResult::Value(value) => {
                return Ok(Some(Entry {
                    key: key.to_vec(),
                    value,
                    tombstone: false,
                }));
            }
            MemFindResult::Tombstone => {
                return Ok(Some(Entry {
                    key: key.to_vec(),
                    value: Vec::new(),
                    tombstone: true,
                }));
            }
            MemFindResult::NotFound => {}
        }

        for level in &inner.levels {
            for handle in level.iter().rev() {
                if let Some(entry) = handle.table.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Rotates the active memtable and flushes the rotated contents
    /// into a new level-0 SSTable. Returns `Ok(false)` when there is
    /// nothing to flush.
    ///
    /// Runs under the engine lock: the rotation happens-before any new
    /// write lands in the successor table, and the table joins the
    /// level-0 list only after its bytes are synced.
    pub fn flush(&self) -> Result<bool, LsmError> {
        let mut inner = self.write()?;
        Self::flush_inner(&mut inner)
    }

    /// Guard-level flush body, shared by [`LsmTree::flush`] and the
    /// inline rotate-and-retry path in `put`/`delete`.
    fn flush_inner(inner: &mut LsmInner) -> Result<bool, LsmError> {
        if inner.active.is_empty() {
            return Ok(false);
        }

        let export = inner.active.export();
        let id = inner.next_table_id;
        inner.next_table_id += 1;

        let level_dir = inner.dir.join("level0");
        fs::create_dir_all(&level_dir)?;
        let path = level_dir.join(format!("ssTable{id}"));

        let summary = TableBuilder::new(&path, inner.config.filter_fpp)
            .build(export.into_iter())?;
        let table = SsTable::open(&path)?;

        inner.levels[0].push(TableHandle { id, path, table });
        inner.active = new_memtable(inner.config.memtable_kind);

        // Everything the WAL protected is now table-durable. The active
        // table is empty (rotation happened under this same lock), so
        // the log can restart from zero.
        inner.wal.truncate()?;

        info!(
            id,
            entries = summary.entry_count,
            blocks = summary.block_count,
            level0_files = inner.levels[0].len(),
            "memtable flushed to level 0"
        );
        Ok(true)
    }

    /// Runs one round of major compaction: the first level at its file
    /// maximum is merged into the next level. Returns whether a merge
    /// happened.
    pub fn major_compact(&self) -> Result<bool, LsmError> {
        let mut inner = self.write()?;
        let threshold = inner.config.max_file_of_one_level;

        let Some(level) = (0..MAX_LEVELS - 1).find(|&l| inner.levels[l].len() >= threshold)
        else {
            return Ok(false);
        };
        Self::merge_level(&mut inner, level)?;
        Ok(true)
    }

    /// Merges every table of `level` and `level + 1` into one table at
    /// `level + 1`. Newest versions win; tombstones are dropped when no
    /// deeper level holds data.
    fn merge_level(inner: &mut LsmInner, level: usize) -> Result<(), LsmError> {
        // Inputs newest-first: upper level is newer than lower, and
        // within a level later ids are newer.
        let mut inputs = Vec::new();
        for handle in inner.levels[level].iter().rev() {
            inputs.push(handle.table.iter_entries()?);
        }
        for handle in inner.levels[level + 1].iter().rev() {
            inputs.push(handle.table.iter_entries()?);
        }

        let bottom = inner.levels[level + 2..].iter().all(Vec::is_empty);
        let merged = compaction::merge_entries(inputs, bottom);

        let old_paths: Vec<PathBuf> = inner.levels[level]
            .iter()
            .chain(inner.levels[level + 1].iter())
            .map(|h| h.path.clone())
            .collect();

        let mut replacement = Vec::new();
        if merged.is_empty() {
            info!(level, "major compaction eliminated every entry");
        } else {
            let id = inner.next_table_id;
            inner.next_table_id += 1;

            let level_dir = inner.dir.join(format!("level{}", level + 1));
            fs::create_dir_all(&level_dir)?;
            let path = level_dir.join(format!("ssTable{id}"));

            let summary = TableBuilder::new(&path, inner.config.filter_fpp)
                .build(merged.into_iter())?;
            let table = SsTable::open(&path)?;
            info!(
                from_level = level,
                to_level = level + 1,
                id,
                entries = summary.entry_count,
                dropped_tombstones = bottom,
                "major compaction merged a level"
            );
            replacement.push(TableHandle { id, path, table });
        }

        inner.levels[level].clear();
        inner.levels[level + 1] = replacement;

        for path in old_paths {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove merged table");
            }
        }
        Ok(())
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<LsmStats, LsmError> {
        let inner = self.read()?;
        Ok(LsmStats {
            memtable_len: inner.active.len(),
            memtable_size: inner.active.data_size(),
            level_counts: inner.levels.iter().map(Vec::len).collect(),
        })
    }

    /// Gracefully shuts down: stops both compaction workers (between
    /// merges, never mid-merge) and flushes the remaining memtable.
    pub fn close(&self) -> Result<(), LsmError> {
        let compactor = {
            let mut slot = self
                .compactor
                .lock()
                .map_err(|_| LsmError::Internal("mutex poisoned".into()))?;
            slot.take()
        };
        if let Some(mut compactor) = compactor {
            compactor.stop();
        }

        self.flush()?;
        info!("LSM engine closed");
        Ok(())
    }
}

/// Wall-clock timestamp in nanoseconds since the UNIX epoch.
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_nanos() as u64
}
