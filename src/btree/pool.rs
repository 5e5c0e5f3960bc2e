//! Buffer pool — fixed-capacity cache of decoded B+Tree pages.
//!
//! One hundred control pages are pre-allocated at init and never
//! reallocated; in the steady state the pool performs no per-operation
//! heap allocation for its own bookkeeping. Control pages live in an
//! arena and the three intrusive lists (free, LRU, flush) store arena
//! indices instead of pointers, which keeps the ownership graph acyclic.
//!
//! A control page is in exactly one of three states: on the free list,
//! on the LRU list, or on both the LRU and flush lists (dirty).
//!
//! # Page lifecycle
//!
//! - Free → Clean-Resident on load or attach.
//! - Clean-Resident → Dirty-Resident on first mutation (flush-list head).
//! - Dirty-Resident → Clean-Resident on write-back (leaves flush list).
//! - Clean-Resident → Free on eviction; a dirty page is flushed first.
//!
//! Any access relocates the control page to the LRU head; eviction takes
//! the LRU tail.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, trace};

use super::node::{AddressTable, BTreeNode, NodeArena, NodeId, NodeType};
use super::page::{self, PAGE_SIZE, PageError};

/// Maximum resident control pages.
pub const MAX_PAGE_IN_BUFFER: usize = 100;

/// Capacity of the buffered reader used on the miss path (1 MiB).
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Errors returned by buffer-pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No control page is available on the free list.
    #[error("free list empty")]
    FreeListEmpty,

    /// The LRU list is at capacity; the caller must evict first.
    #[error("LRU list full")]
    LruFull,

    /// Page encode/decode failure.
    #[error("page error: {0}")]
    Page(#[from] PageError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Kind of page held by a control page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// An index page.
    Index,
    /// A data (leaf) page.
    Data,
}

/// Which intrusive list a link operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Free = 0,
    Lru = 1,
    Flush = 2,
}

/// Sibling links of one control page within one list.
#[derive(Debug, Default, Clone, Copy)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

/// Metadata wrapper around one cached node.
#[derive(Debug)]
pub struct ControlPage {
    /// Backing file of the cached page.
    pub filename: String,

    /// Index or data page.
    pub page_type: PageKind,

    /// The cached node, if any.
    pub cached: Option<NodeId>,

    /// Disk offset of the cached page.
    pub offset: u64,

    /// Per-list sibling links: free, LRU, flush.
    links: [Link; 3],
}

impl ControlPage {
    fn blank() -> Self {
        Self {
            filename: String::new(),
            page_type: PageKind::Data,
            cached: None,
            offset: 0,
            links: [Link::default(); 3],
        }
    }
}

/// Head/tail/count of one intrusive list.
#[derive(Debug, Default)]
struct ListEnds {
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

/// The buffer pool proper.
#[derive(Debug)]
pub struct BufferPool {
    pages: Vec<ControlPage>,
    free: ListEnds,
    lru: ListEnds,
    flush: ListEnds,

    /// Nodes with unwritten mutations.
    dirty: HashSet<NodeId>,

    /// `(filename, offset)` fingerprint of each resident page.
    hash_page: HashMap<(String, u64), usize>,
}

impl BufferPool {
    /// Creates a pool with [`MAX_PAGE_IN_BUFFER`] pre-allocated control
    /// pages, all on the free list.
    pub fn new() -> Self {
        let mut pool = Self {
            pages: (0..MAX_PAGE_IN_BUFFER)
                .map(|_| ControlPage::blank())
                .collect(),
            free: ListEnds::default(),
            lru: ListEnds::default(),
            flush: ListEnds::default(),
            dirty: HashSet::new(),
            hash_page: HashMap::new(),
        };
        for pid in 0..MAX_PAGE_IN_BUFFER {
            pool.push_head(ListKind::Free, pid);
        }
        pool
    }

    // --------------------------------------------------------------------------------------------
    // Intrusive-list primitives
    // --------------------------------------------------------------------------------------------

    fn ends_mut(&mut self, kind: ListKind) -> &mut ListEnds {
        match kind {
            ListKind::Free => &mut self.free,
            ListKind::Lru => &mut self.lru,
            ListKind::Flush => &mut self.flush,
        }
    }

    fn ends(&self, kind: ListKind) -> &ListEnds {
        match kind {
            ListKind::Free => &self.free,
            ListKind::Lru => &self.lru,
            ListKind::Flush => &self.flush,
        }
    }

    fn push_head(&mut self, kind: ListKind, pid: usize) {
        let k = kind as usize;
        let old_head = self.ends(kind).head;
        self.pages[pid].links[k] = Link {
            prev: None,
            next: old_head,
            linked: true,
        };
        if let Some(head) = old_head {
            self.pages[head].links[k].prev = Some(pid);
        }
        let ends = self.ends_mut(kind);
        ends.head = Some(pid);
        if ends.tail.is_none() {
            ends.tail = Some(pid);
        }
        ends.count += 1;
    }

    fn detach(&mut self, kind: ListKind, pid: usize) {
        let k = kind as usize;
        let link = self.pages[pid].links[k];
        if !link.linked {
            return;
        }
        match link.prev {
            Some(prev) => self.pages[prev].links[k].next = link.next,
            None => self.ends_mut(kind).head = link.next,
        }
        match link.next {
            Some(next) => self.pages[next].links[k].prev = link.prev,
            None => self.ends_mut(kind).tail = link.prev,
        }
        self.pages[pid].links[k] = Link::default();
        self.ends_mut(kind).count -= 1;
    }

    fn pop_tail(&mut self, kind: ListKind) -> Option<usize> {
        let tail = self.ends(kind).tail?;
        self.detach(kind, tail);
        Some(tail)
    }

    // --------------------------------------------------------------------------------------------
    // Observers
    // --------------------------------------------------------------------------------------------

    /// Number of resident (LRU) pages.
    pub fn resident_count(&self) -> usize {
        self.lru.count
    }

    /// Number of control pages on the free list.
    pub fn free_count(&self) -> usize {
        self.free.count
    }

    /// Number of pages awaiting write-back.
    pub fn flush_count(&self) -> usize {
        self.flush.count
    }

    /// Whether `node` carries unwritten mutations.
    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.dirty.contains(&node)
    }

    /// Resident control page for `(filename, offset)`, if any.
    pub fn lookup(&self, filename: &str, offset: u64) -> Option<usize> {
        self.hash_page
            .get(&(filename.to_string(), offset))
            .copied()
    }

    // --------------------------------------------------------------------------------------------
    // State transitions
    // --------------------------------------------------------------------------------------------

    /// Attaches a fresh or loaded node as a Clean-Resident page.
    ///
    /// Detaches a control page from the free list, fills its fields, and
    /// pushes it at the LRU head.
    ///
    /// # Errors
    ///
    /// [`PoolError::FreeListEmpty`] when no free control page remains and
    /// [`PoolError::LruFull`] when the LRU is at capacity — in both cases
    /// the caller must evict first.
    pub fn attach(
        &mut self,
        filename: &str,
        offset: u64,
        kind: PageKind,
        node: NodeId,
    ) -> Result<usize, PoolError> {
        if self.lru.count >= MAX_PAGE_IN_BUFFER {
            return Err(PoolError::LruFull);
        }
        let pid = self.pop_tail(ListKind::Free).ok_or(PoolError::FreeListEmpty)?;

        let page = &mut self.pages[pid];
        page.filename = filename.to_string();
        page.page_type = kind;
        page.cached = Some(node);
        page.offset = offset;

        self.push_head(ListKind::Lru, pid);
        self.hash_page.insert((filename.to_string(), offset), pid);
        trace!(offset, pid, "page attached");
        Ok(pid)
    }

    /// Relocates a resident page to the LRU head.
    pub fn touch(&mut self, pid: usize) {
        self.detach(ListKind::Lru, pid);
        self.push_head(ListKind::Lru, pid);
    }

    /// Marks `node` dirty. If the node is resident, its control page
    /// joins the flush list at the head on the first mutation.
    pub fn note_dirty(&mut self, node: NodeId, filename: &str, offset: Option<u64>) {
        self.dirty.insert(node);
        if let Some(offset) = offset
            && let Some(pid) = self.lookup(filename, offset)
            && !self.pages[pid].links[ListKind::Flush as usize].linked
        {
            self.push_head(ListKind::Flush, pid);
        }
    }

    /// Clears the dirty mark for `node` without touching the lists.
    ///
    /// Used by whole-tree persistence, which writes every mapped node
    /// directly rather than draining the flush list.
    pub fn clear_dirty(&mut self, node: NodeId) {
        self.dirty.remove(&node);
    }

    /// Drops the control page caching `(filename, offset)` without any
    /// write-back, returning it to the free list. Used when the cached
    /// node itself is being destroyed (e.g. absorbed by a merge).
    pub fn discard(&mut self, filename: &str, offset: u64, node: NodeId) {
        self.dirty.remove(&node);
        if let Some(pid) = self.lookup(filename, offset) {
            self.detach(ListKind::Flush, pid);
            self.detach(ListKind::Lru, pid);
            self.hash_page.remove(&(filename.to_string(), offset));
            self.pages[pid].cached = None;
            self.push_head(ListKind::Free, pid);
        }
    }

    /// Evicts the LRU tail, returning its control page to the free list.
    ///
    /// A dirty victim is written back first, so eviction never loses
    /// mutations.
    pub fn evict(
        &mut self,
        path: &Path,
        arena: &mut NodeArena,
        att: &AddressTable,
    ) -> Result<(), PoolError> {
        let Some(pid) = self.pop_tail(ListKind::Lru) else {
            return Ok(());
        };

        if let Some(node_id) = self.pages[pid].cached
            && self.dirty.contains(&node_id)
        {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            Self::write_node(&mut file, arena, att, node_id, self.pages[pid].offset)?;
            file.sync_all()?;
            self.dirty.remove(&node_id);
            self.detach(ListKind::Flush, pid);
        }

        let key = (
            self.pages[pid].filename.clone(),
            self.pages[pid].offset,
        );
        self.hash_page.remove(&key);
        self.pages[pid].cached = None;
        self.push_head(ListKind::Free, pid);
        debug!(offset = key.1, "page evicted");
        Ok(())
    }

    /// Miss-path read: loads the page at `offset`, decodes it, binds the
    /// node through the address table, and attaches a control page at the
    /// LRU head. A resident page is simply touched.
    pub fn fetch(
        &mut self,
        path: &Path,
        offset: u64,
        arena: &mut NodeArena,
        att: &mut AddressTable,
    ) -> Result<NodeId, PoolError> {
        let filename = path.to_string_lossy().into_owned();
        if let Some(pid) = self.lookup(&filename, offset) {
            self.touch(pid);
            let cached = self.pages[pid]
                .cached
                .ok_or_else(|| PoolError::Internal("resident page without node".into()))?;
            return Ok(cached);
        }

        if self.free.count == 0 {
            self.evict(path, arena, att)?;
        }

        // A dirty in-memory node is newer than its on-disk page; serve
        // it as-is instead of clobbering it with stale bytes.
        if let Some(existing) = att.node_at(offset)
            && self.dirty.contains(&existing)
        {
            let kind = match arena.get(existing).node_type {
                NodeType::Index => PageKind::Index,
                NodeType::Leaf => PageKind::Data,
            };
            self.attach(&filename, offset, kind, existing)?;
            return Ok(existing);
        }

        let file = OpenOptions::new().read(true).open(path)?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
        reader.seek(SeekFrom::Start(offset))?;
        let mut data = [0u8; PAGE_SIZE];
        reader.read_exact(&mut data)?;

        let disk = page::decode_page(&data)?;
        let node_id = rebind_disk_node(&disk, arena, att);
        let kind = match disk.node_type {
            NodeType::Index => PageKind::Index,
            NodeType::Leaf => PageKind::Data,
        };
        self.attach(&filename, offset, kind, node_id)?;
        Ok(node_id)
    }

    /// Writes back up to `num` pages, walking the flush list from the
    /// tail (oldest dirty first). Each flushed node has its `has_loaded`
    /// flag cleared and leaves both the flush list and the dirty set.
    pub fn flush(
        &mut self,
        path: &Path,
        num: usize,
        arena: &mut NodeArena,
        att: &AddressTable,
    ) -> Result<usize, PoolError> {
        if num == 0 || self.flush.count == 0 {
            return Ok(0);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut flushed = 0;
        while flushed < num {
            let Some(pid) = self.pop_tail(ListKind::Flush) else {
                break;
            };
            let node_id = self.pages[pid]
                .cached
                .ok_or_else(|| PoolError::Internal("flush-listed page without node".into()))?;
            Self::write_node(&mut file, arena, att, node_id, self.pages[pid].offset)?;
            arena.get_mut(node_id).has_loaded = false;
            self.dirty.remove(&node_id);
            flushed += 1;
        }
        file.sync_all()?;
        debug!(flushed, "flush batch written");
        Ok(flushed)
    }

    fn write_node(
        file: &mut std::fs::File,
        arena: &NodeArena,
        att: &AddressTable,
        node_id: NodeId,
        offset: u64,
    ) -> Result<(), PoolError> {
        let encoded = page::encode_node(arena.get(node_id), att)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&encoded)?;
        Ok(())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconstitutes a decoded page into the arena, resolving sibling and
/// child offsets through the address table.
///
/// Offsets not yet mapped get placeholder nodes with `has_loaded` unset;
/// a later fetch of the same offset fills them in place, so pointer
/// identity is stable across reloads.
pub(crate) fn rebind_disk_node(
    disk: &page::DiskNode,
    arena: &mut NodeArena,
    att: &mut AddressTable,
) -> NodeId {
    let node_id = match att.node_at(disk.current_offset) {
        Some(id) => id,
        None => {
            let id = arena.alloc(BTreeNode::new_leaf());
            att.assign(id, disk.current_offset);
            id
        }
    };

    let prev = resolve_or_placeholder(disk.prev_offset, arena, att);
    let next = resolve_or_placeholder(disk.next_offset, arena, att);
    let children: Vec<NodeId> = disk
        .children_offsets
        .iter()
        .filter_map(|&off| resolve_or_placeholder(off, arena, att))
        .collect();

    let node = arena.get_mut(node_id);
    node.node_type = disk.node_type;
    node.keys = disk.keys.clone();
    node.values = disk.values.clone();
    node.children = children;
    node.prev = prev;
    node.next = next;
    node.offset = Some(disk.current_offset);
    node.has_loaded = true;
    node_id
}

/// Maps a stored offset to a node id, allocating an unloaded placeholder
/// for offsets seen for the first time. Offset `0` means absent.
fn resolve_or_placeholder(
    offset: u64,
    arena: &mut NodeArena,
    att: &mut AddressTable,
) -> Option<NodeId> {
    if offset == 0 {
        return None;
    }
    match att.node_at(offset) {
        Some(id) => Some(id),
        None => {
            let mut placeholder = BTreeNode::new_leaf();
            placeholder.has_loaded = false;
            placeholder.offset = Some(offset);
            let id = arena.alloc(placeholder);
            att.assign(id, offset);
            Some(id)
        }
    }
}
