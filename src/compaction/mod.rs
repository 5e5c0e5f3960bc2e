//! # Compaction Module
//!
//! Two scheduled activities drive data down the level hierarchy:
//!
//! - **Minor compaction** — wakes on the memtable-full signal, rotates
//!   the active memtable under the engine lock, and flushes the rotated
//!   contents into a fresh level-0 SSTable. Iterations are spaced at
//!   least ten seconds apart to bound burst rate. The signal is a
//!   best-effort hint: the write path rotates a full memtable inline,
//!   so this worker never bounds memtable growth by itself.
//! - **Major compaction** — wakes once a minute, scans level occupancy,
//!   and merges any level that reached the configured per-level maximum
//!   into the next level: a k-way merge by key where the newest version
//!   of a duplicated key wins, shadowed versions are dropped, and
//!   tombstones are elided when the output level is the lowest
//!   populated one.
//!
//! Both workers are cooperatively cancellable: the shutdown flag is
//! checked before every sleep, and cancellation is honored between
//! merges, never in the middle of one.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{error, info};

use crate::memtable::Entry;

/// Heap-based k-way merge over sorted entry streams.
///
/// Sources are ordered newest-first: when two sources hold the same
/// key, the entry from the lower source index is the authoritative
/// version. The iterator yields every version in `(key ASC, source
/// ASC)` order; deduplication happens in [`merge_entries`].
pub struct MergeIterator {
    sources: Vec<std::vec::IntoIter<Entry>>,
    heap: BinaryHeap<MergeHeapEntry>,
}

struct MergeHeapEntry {
    entry: Entry,
    source_idx: usize,
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for the max-heap: smallest key / newest source first.
        match self.entry.key.cmp(&other.entry.key) {
            Ordering::Equal => self.source_idx.cmp(&other.source_idx),
            ord => ord,
        }
        .reverse()
    }
}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key == other.entry.key && self.source_idx == other.source_idx
    }
}

impl Eq for MergeHeapEntry {}

impl MergeIterator {
    /// Creates a merge over the given sorted sources, newest first.
    pub fn new(inputs: Vec<Vec<Entry>>) -> Self {
        let mut sources: Vec<_> = inputs.into_iter().map(Vec::into_iter).collect();
        let mut heap = BinaryHeap::new();
        for (source_idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(MergeHeapEntry { entry, source_idx });
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MergeIterator {
    type Item = (Entry, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        let idx = top.source_idx;
        if let Some(entry) = self.sources[idx].next() {
            self.heap.push(MergeHeapEntry {
                entry,
                source_idx: idx,
            });
        }
        Some((top.entry, idx))
    }
}

/// Merges sorted entry streams into one deduplicated stream.
///
/// `inputs` are ordered newest-first. For every key only the newest
/// version survives. With `drop_tombstones` set (merging into the
/// lowest populated level), surviving tombstones are elided entirely —
/// there is no older data left that they could shadow.
pub fn merge_entries(inputs: Vec<Vec<Entry>>, drop_tombstones: bool) -> Vec<Entry> {
    let mut out: Vec<Entry> = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;

    for (entry, _) in MergeIterator::new(inputs) {
        if last_key.as_deref() == Some(entry.key.as_slice()) {
            continue; // shadowed older version
        }
        last_key = Some(entry.key.clone());
        if entry.tombstone && drop_tombstones {
            continue;
        }
        out.push(entry);
    }
    out
}

/// Handle over the two background compaction workers.
///
/// Dropping the handle does **not** stop the workers; call
/// [`Compactor::stop`] (the engine does this on close).
pub struct Compactor {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Compactor {
    /// Spawns the minor and major workers against the given engine.
    ///
    /// `flush_rx` carries the memtable-full signal; the intervals come
    /// from the engine configuration (10 s minor, 60 s major by
    /// default).
    pub fn spawn(
        engine: crate::lsm::LsmTree,
        flush_rx: Receiver<()>,
        minor_interval: Duration,
        major_interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));

        let minor_shutdown = Arc::clone(&shutdown);
        let minor_engine = engine.clone();
        let minor = std::thread::spawn(move || {
            minor_worker(minor_engine, flush_rx, minor_interval, minor_shutdown);
        });

        let major_shutdown = Arc::clone(&shutdown);
        let major = std::thread::spawn(move || {
            major_worker(engine, major_interval, major_shutdown);
        });

        Self {
            shutdown,
            handles: vec![minor, major],
        }
    }

    /// Signals shutdown and joins both workers. Cancellation takes
    /// effect between merges, never mid-merge.
    pub fn stop(&mut self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("compaction worker panicked");
            }
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(AtomicOrdering::SeqCst)
    }
}

fn minor_worker(
    engine: crate::lsm::LsmTree,
    flush_rx: Receiver<()>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    info!("minor compaction worker started");
    loop {
        if shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }
        match flush_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {
                match engine.flush() {
                    Ok(true) => info!("minor compaction flushed a memtable"),
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "minor compaction failed"),
                }
                // Bound the burst rate between iterations.
                interruptible_sleep(interval, &shutdown);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("minor compaction worker stopped");
}

fn major_worker(engine: crate::lsm::LsmTree, interval: Duration, shutdown: Arc<AtomicBool>) {
    info!("major compaction worker started");
    loop {
        interruptible_sleep(interval, &shutdown);
        if shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }
        match engine.major_compact() {
            Ok(true) => info!("major compaction merged a level"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "major compaction failed"),
        }
    }
    info!("major compaction worker stopped");
}

/// Sleeps for `total`, waking early when shutdown is requested.
fn interruptible_sleep(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(AtomicOrdering::SeqCst) {
            return;
        }
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
}
