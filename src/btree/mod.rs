//! # B+Tree Engine
//!
//! An ordered index over single-byte keys with leaf-level value storage,
//! persisted to one file in fixed 4 KiB pages and cached through a
//! buffer pool.
//!
//! ## Design Invariants
//!
//! - Every non-root node keeps its key count within the `[min, max]`
//!   bounds of its kind (leaf 115..=230, index 225..=450).
//! - Leaves store keys and values; index nodes store separator keys and
//!   child ids only, with exactly `n + 1` children for `n` keys.
//! - The child at site `i` holds keys `≥ keys[i-1]` and strictly less
//!   than `keys[i]`; equal keys descend right.
//! - The leaf chain starting at `start_leaf` visits all keys in
//!   ascending order.
//! - Every disk-resident node has exactly one offset in the address
//!   table; offsets are stable once assigned.
//!
//! ## Split policy
//!
//! A node splits when it reaches `max − 1` keys. The left side retains
//! the minimum key count; the right receives the remainder. For leaves
//! the promoted separator is a copy of the right node's first key; for
//! index nodes the middle key moves up (it lives in neither half), which
//! is what keeps the `n + 1`-children invariant.
//!
//! ## Delete policy
//!
//! An underfull node first borrows from a sibling holding more than
//! `min + 1` keys; otherwise it merges into its left sibling and the
//! disappeared node's disk offset is prepended to the free-space list.
//!
//! ## Concurrency
//!
//! The tree is a single writer / concurrent readers structure behind one
//! `RwLock`: `search` takes the read lock; mutations, paged reads (which
//! touch the LRU), and persistence take the write lock.

pub mod node;
pub mod page;
pub mod pool;

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, info, trace};

use node::{AddressTable, BTreeNode, NodeArena, NodeId, NodeType};
use page::{
    DATA_NODE_MAX_KEY_NUM, DATA_NODE_MIN_KEY_NUM, INDEX_NODE_MAX_KEY_NUM, INDEX_NODE_MIN_KEY_NUM,
    PAGE_SIZE, PageError,
};
use pool::{BufferPool, PoolError};

/// Errors returned by B+Tree operations.
#[derive(Debug, Error)]
pub enum BTreeError {
    /// The key is absent.
    #[error("key not found")]
    NotFound,

    /// Buffer-pool failure.
    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Page codec failure.
    #[error("page error: {0}")]
    Page(#[from] PageError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result of a successful point lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult {
    /// Disk offset of the leaf holding the key, if it has been assigned.
    pub offset: Option<u64>,

    /// The stored value.
    pub value: String,
}

/// Catalog of disk blocks returned by node merges.
///
/// Freed addresses form a LIFO: a merge prepends the disappeared node's
/// offset as the new head, and allocation consumes the head before the
/// file is extended.
#[derive(Debug, Default)]
pub struct FreeSpace {
    free_block_num: u32,
    free_addresses: Vec<u64>,
}

impl FreeSpace {
    fn push_head(&mut self, offset: u64) {
        self.free_addresses.push(offset);
        self.free_block_num += 1;
    }

    fn take_head(&mut self) -> Option<u64> {
        let head = self.free_addresses.pop()?;
        self.free_block_num -= 1;
        Some(head)
    }

    /// Number of reusable disk blocks.
    pub fn free_block_num(&self) -> u32 {
        self.free_block_num
    }
}

struct BTreeInner {
    root: Option<NodeId>,
    start_leaf: Option<NodeId>,
    arena: NodeArena,
    att: AddressTable,
    free_space: FreeSpace,
    pool: BufferPool,
    path: PathBuf,
    order: u8,
    node_num: u64,
    height: u8,
    /// Next page offset when the free list is empty. Offset 0 is never
    /// allocated so that 0 can encode an absent pointer.
    next_offset: u64,
}

/// The B+Tree engine handle.
pub struct BTree {
    inner: RwLock<BTreeInner>,
}

impl BTree {
    /// Creates the backing file and initializes the address table, the
    /// free-space catalog, and the buffer pool.
    pub fn open(order: u8, path: impl AsRef<Path>) -> Result<Self, BTreeError> {
        let path = path.as_ref().to_path_buf();
        File::create(&path)?;

        info!(path = %path.display(), order, "B+Tree created");

        Ok(Self {
            inner: RwLock::new(BTreeInner {
                root: None,
                start_leaf: None,
                arena: NodeArena::new(),
                att: AddressTable::new(),
                free_space: FreeSpace::default(),
                pool: BufferPool::new(),
                path,
                order,
                node_num: 0,
                height: 0,
                next_offset: PAGE_SIZE as u64,
            }),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeInner>, BTreeError> {
        self.inner
            .read()
            .map_err(|_| BTreeError::Internal("RwLock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeInner>, BTreeError> {
        self.inner
            .write()
            .map_err(|_| BTreeError::Internal("RwLock poisoned".into()))
    }

    /// Inserts a key-value pair. An existing key has its value replaced.
    pub fn insert(&self, key: u8, value: impl Into<String>) -> Result<(), BTreeError> {
        let value = value.into();
        trace!(key, "insert");
        let mut inner = self.write()?;
        inner.insert(key, value)
    }

    /// Removes a key.
    ///
    /// # Errors
    ///
    /// [`BTreeError::NotFound`] when the key is absent.
    pub fn delete(&self, key: u8) -> Result<(), BTreeError> {
        trace!(key, "delete");
        let mut inner = self.write()?;
        inner.delete(key)
    }

    /// Looks up a key through the in-memory tree.
    ///
    /// # Errors
    ///
    /// [`BTreeError::NotFound`] when the key is absent.
    pub fn search(&self, key: u8) -> Result<FindResult, BTreeError> {
        let inner = self.read()?;
        inner.search(key)
    }

    /// Looks up a key by descending through paged reads rather than
    /// in-memory pointers. Requires a prior [`BTree::fsync_all`].
    pub fn search_from_disk(&self, key: u8) -> Result<FindResult, BTreeError> {
        let mut inner = self.write()?;
        inner.search_from_disk(key)
    }

    /// Assigns offsets to every leaf in chain order, then to every
    /// remaining node, and persists all mapped nodes.
    pub fn fsync_all(&self) -> Result<(), BTreeError> {
        let mut inner = self.write()?;
        inner.fsync_all()
    }

    /// Writes back up to `num` dirty pages from the flush list.
    pub fn flush_pages(&self, num: usize) -> Result<usize, BTreeError> {
        let mut inner = self.write()?;
        let inner = &mut *inner;
        Ok(inner
            .pool
            .flush(&inner.path, num, &mut inner.arena, &inner.att)?)
    }

    /// Returns all key-value pairs by walking the leaf chain.
    pub fn scan(&self) -> Result<Vec<(u8, String)>, BTreeError> {
        let inner = self.read()?;
        let mut out = Vec::new();
        let mut cursor = inner.start_leaf;
        while let Some(id) = cursor {
            let leaf = inner.arena.get(id);
            for (i, &key) in leaf.keys.iter().enumerate() {
                out.push((key, leaf.values[i].clone()));
            }
            cursor = leaf.next;
        }
        Ok(out)
    }

    /// Number of live nodes in the tree.
    pub fn node_num(&self) -> Result<u64, BTreeError> {
        Ok(self.read()?.node_num)
    }

    /// Height of the tree (0 for an empty tree, 1 for a lone leaf root).
    pub fn height(&self) -> Result<u8, BTreeError> {
        Ok(self.read()?.height)
    }

    /// Branching order the tree was created with.
    pub fn order(&self) -> Result<u8, BTreeError> {
        Ok(self.read()?.order)
    }

    /// Walks the whole structure checking its invariants: child
    /// counts, key ordering, capacity bounds, and chain/in-order
    /// agreement. Intended for tests and debugging.
    pub fn validate(&self) -> Result<(), BTreeError> {
        let inner = self.read()?;
        inner.validate()
    }
}

impl BTreeInner {
    fn filename(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn mark_dirty(&mut self, id: NodeId) {
        let filename = self.filename();
        let offset = self.att.offset_of(id);
        self.pool.note_dirty(id, &filename, offset);
    }

    /// Site of the child to descend into: the number of keys `≤ key`,
    /// so equal keys go right.
    fn child_site(node: &BTreeNode, key: u8) -> usize {
        node.keys.partition_point(|&k| k <= key)
    }

    fn min_keys(node: &BTreeNode) -> usize {
        match node.node_type {
            NodeType::Leaf => DATA_NODE_MIN_KEY_NUM,
            NodeType::Index => INDEX_NODE_MIN_KEY_NUM,
        }
    }

    fn max_keys(node: &BTreeNode) -> usize {
        match node.node_type {
            NodeType::Leaf => DATA_NODE_MAX_KEY_NUM,
            NodeType::Index => INDEX_NODE_MAX_KEY_NUM,
        }
    }

    fn alloc_offset(&mut self) -> u64 {
        if let Some(head) = self.free_space.take_head() {
            return head;
        }
        let offset = self.next_offset;
        self.next_offset += PAGE_SIZE as u64;
        offset
    }

    // --------------------------------------------------------------------------------------------
    // Insert
    // --------------------------------------------------------------------------------------------

    fn insert(&mut self, key: u8, value: String) -> Result<(), BTreeError> {
        let Some(root) = self.root else {
            let mut leaf = BTreeNode::new_leaf();
            leaf.keys.push(key);
            leaf.values.push(value);
            let id = self.arena.alloc(leaf);
            self.root = Some(id);
            self.start_leaf = Some(id);
            self.node_num = 1;
            self.height = 1;
            self.mark_dirty(id);
            return Ok(());
        };

        if let Some((separator, right)) = self.insert_rec(root, key, value)? {
            let mut new_root = BTreeNode::new_index();
            new_root.keys.push(separator);
            new_root.children.push(root);
            new_root.children.push(right);
            let id = self.arena.alloc(new_root);
            self.root = Some(id);
            self.node_num += 1;
            self.height += 1;
            self.mark_dirty(id);
            debug!(separator, "new index root synthesized");
        }
        Ok(())
    }

    /// Recursive insert; returns `Some((separator, right))` when the
    /// visited node split and the caller must absorb the promotion.
    fn insert_rec(
        &mut self,
        id: NodeId,
        key: u8,
        value: String,
    ) -> Result<Option<(u8, NodeId)>, BTreeError> {
        if self.arena.get(id).is_leaf() {
            return Ok(self.insert_into_leaf(id, key, value));
        }

        let site = Self::child_site(self.arena.get(id), key);
        let child = self.arena.get(id).children[site];
        let Some((separator, right)) = self.insert_rec(child, key, value)? else {
            return Ok(None);
        };

        // Absorb the promoted separator, splitting this node first when
        // it is already at the split threshold.
        if self.arena.get(id).key_num() >= INDEX_NODE_MAX_KEY_NUM - 1 {
            let (up, right_index) = self.split_index(id);
            let target = if separator >= up { right_index } else { id };
            Self::insert_separator(self.arena.get_mut(target), separator, right);
            self.mark_dirty(target);
            return Ok(Some((up, right_index)));
        }

        Self::insert_separator(self.arena.get_mut(id), separator, right);
        self.mark_dirty(id);
        Ok(None)
    }

    fn insert_separator(node: &mut BTreeNode, separator: u8, right: NodeId) {
        let pos = node.keys.partition_point(|&k| k < separator);
        node.keys.insert(pos, separator);
        node.children.insert(pos + 1, right);
    }

    fn insert_into_leaf(&mut self, id: NodeId, key: u8, value: String) -> Option<(u8, NodeId)> {
        // Replacement never grows the node, so handle it before any
        // split decision.
        {
            let leaf = self.arena.get_mut(id);
            if let Ok(pos) = leaf.keys.binary_search(&key) {
                leaf.values[pos] = value;
                self.mark_dirty(id);
                return None;
            }
        }

        if self.arena.get(id).key_num() >= DATA_NODE_MAX_KEY_NUM - 1 {
            let (separator, right) = self.split_leaf(id);
            let target = if key >= separator { right } else { id };
            Self::place_in_leaf(self.arena.get_mut(target), key, value);
            self.mark_dirty(target);
            return Some((separator, right));
        }

        Self::place_in_leaf(self.arena.get_mut(id), key, value);
        self.mark_dirty(id);
        None
    }

    fn place_in_leaf(leaf: &mut BTreeNode, key: u8, value: String) {
        let pos = leaf.keys.partition_point(|&k| k < key);
        leaf.keys.insert(pos, key);
        leaf.values.insert(pos, value);
    }

    /// Splits a full leaf: the left keeps the minimum key count, the
    /// right takes the rest, and the chain is stitched around the new
    /// node. The separator is a copy of the right node's first key.
    fn split_leaf(&mut self, id: NodeId) -> (u8, NodeId) {
        let (right_keys, right_values, old_next) = {
            let left = self.arena.get_mut(id);
            let keys = left.keys.split_off(DATA_NODE_MIN_KEY_NUM);
            let values = left.values.split_off(DATA_NODE_MIN_KEY_NUM);
            (keys, values, left.next)
        };
        let separator = right_keys[0];

        let mut right = BTreeNode::new_leaf();
        right.keys = right_keys;
        right.values = right_values;
        right.prev = Some(id);
        right.next = old_next;
        let right_id = self.arena.alloc(right);

        self.arena.get_mut(id).next = Some(right_id);
        if let Some(next) = old_next {
            self.arena.get_mut(next).prev = Some(right_id);
        }

        self.node_num += 1;
        self.mark_dirty(id);
        self.mark_dirty(right_id);
        debug!(separator, "leaf split");
        (separator, right_id)
    }

    /// Splits a full index node; the middle key moves up and lives in
    /// neither half, preserving the `n + 1`-children invariant.
    fn split_index(&mut self, id: NodeId) -> (u8, NodeId) {
        let (separator, right_keys, right_children) = {
            let left = self.arena.get_mut(id);
            let mut tail = left.keys.split_off(INDEX_NODE_MIN_KEY_NUM);
            let separator = tail.remove(0);
            let children = left.children.split_off(INDEX_NODE_MIN_KEY_NUM + 1);
            (separator, tail, children)
        };

        let mut right = BTreeNode::new_index();
        right.keys = right_keys;
        right.children = right_children;
        let right_id = self.arena.alloc(right);

        self.node_num += 1;
        self.mark_dirty(id);
        self.mark_dirty(right_id);
        debug!(separator, "index split");
        (separator, right_id)
    }

    // --------------------------------------------------------------------------------------------
    // Search
    // --------------------------------------------------------------------------------------------

    fn find_leaf(&self, key: u8) -> Option<NodeId> {
        let mut id = self.root?;
        loop {
            let node = self.arena.get(id);
            if node.is_leaf() {
                return Some(id);
            }
            id = node.children[Self::child_site(node, key)];
        }
    }

    fn search(&self, key: u8) -> Result<FindResult, BTreeError> {
        let leaf_id = self.find_leaf(key).ok_or(BTreeError::NotFound)?;
        let leaf = self.arena.get(leaf_id);
        let pos = leaf.keys.binary_search(&key).map_err(|_| BTreeError::NotFound)?;
        Ok(FindResult {
            offset: self.att.offset_of(leaf_id),
            value: leaf.values[pos].clone(),
        })
    }

    fn search_from_disk(&mut self, key: u8) -> Result<FindResult, BTreeError> {
        let root = self.root.ok_or(BTreeError::NotFound)?;
        let root_offset = self
            .att
            .offset_of(root)
            .ok_or_else(|| BTreeError::Internal("tree has not been persisted".into()))?;

        let path = self.path.clone();
        let mut id = self
            .pool
            .fetch(&path, root_offset, &mut self.arena, &mut self.att)?;
        loop {
            let node = self.arena.get(id);
            if node.is_leaf() {
                let pos = node
                    .keys
                    .binary_search(&key)
                    .map_err(|_| BTreeError::NotFound)?;
                return Ok(FindResult {
                    offset: node.offset,
                    value: node.values[pos].clone(),
                });
            }
            let child = node.children[Self::child_site(node, key)];
            let child_offset = self
                .att
                .offset_of(child)
                .ok_or_else(|| BTreeError::Internal("child without disk offset".into()))?;
            id = self
                .pool
                .fetch(&path, child_offset, &mut self.arena, &mut self.att)?;
        }
    }

    /// Locates the parent of `target` by descending from `current`,
    /// propagating the recursive result outward.
    fn find_parent(&self, target: NodeId, current: NodeId) -> Option<(NodeId, usize)> {
        let node = self.arena.get(current);
        for (site, &child) in node.children.iter().enumerate() {
            if child == target {
                return Some((current, site));
            }
            if !self.arena.get(child).is_leaf()
                && let Some(found) = self.find_parent(target, child)
            {
                return Some(found);
            }
        }
        None
    }

    // --------------------------------------------------------------------------------------------
    // Delete
    // --------------------------------------------------------------------------------------------

    fn delete(&mut self, key: u8) -> Result<(), BTreeError> {
        let root = self.root.ok_or(BTreeError::NotFound)?;
        let leaf_id = self.find_leaf(key).ok_or(BTreeError::NotFound)?;
        let pos = {
            let leaf = self.arena.get(leaf_id);
            leaf.keys.binary_search(&key).map_err(|_| BTreeError::NotFound)?
        };

        {
            let leaf = self.arena.get_mut(leaf_id);
            leaf.keys.remove(pos);
            leaf.values.remove(pos);
        }
        self.mark_dirty(leaf_id);

        // Empty leaf root means an empty tree.
        if leaf_id == root {
            if self.arena.get(root).keys.is_empty() {
                self.release_node(root);
                self.root = None;
                self.start_leaf = None;
                self.height = 0;
            }
            return Ok(());
        }

        let mut current = leaf_id;
        while current != root
            && self.arena.get(current).key_num() < Self::min_keys(self.arena.get(current))
        {
            let Some((parent, site)) = self.find_parent(current, root) else {
                break;
            };
            self.rebalance(parent, site);
            current = parent;
        }

        // A root index node drained to zero keys hands the tree to its
        // only child.
        let root = self.root.ok_or_else(|| BTreeError::Internal("root vanished".into()))?;
        let root_node = self.arena.get(root);
        if !root_node.is_leaf() && root_node.keys.is_empty() {
            let only_child = root_node.children[0];
            self.release_node(root);
            self.root = Some(only_child);
            self.height = self.height.saturating_sub(1);
            debug!("root collapsed into its only child");
        }

        Ok(())
    }

    /// Restores the `[min, max]` bound of the underfull child at
    /// `parent.children[site]`.
    fn rebalance(&mut self, parent: NodeId, site: usize) {
        let child = self.arena.get(parent).children[site];
        let min = Self::min_keys(self.arena.get(child));
        let child_count = self.arena.get(parent).children.len();

        // Leaves lend only above min + 1, so a merged leaf lands exactly
        // at capacity. Index merges also absorb the parent separator, so
        // index siblings lend whenever they are above the minimum.
        let lend_floor = if self.arena.get(child).is_leaf() {
            min + 1
        } else {
            min
        };

        let left_big = site > 0 && {
            let left = self.arena.get(parent).children[site - 1];
            self.arena.get(left).key_num() > lend_floor
        };
        let right_big = site + 1 < child_count && {
            let right = self.arena.get(parent).children[site + 1];
            self.arena.get(right).key_num() > lend_floor
        };

        if left_big {
            self.borrow_from_left(parent, site);
        } else if right_big {
            self.borrow_from_right(parent, site);
        } else if site > 0 {
            self.combine(parent, site);
        } else {
            // No left sibling: absorb the right sibling instead.
            self.combine(parent, site + 1);
        }
    }

    /// Moves the left sibling's last entry into the underfull child.
    fn borrow_from_left(&mut self, parent: NodeId, site: usize) {
        let left = self.arena.get(parent).children[site - 1];
        let child = self.arena.get(parent).children[site];

        if self.arena.get(child).is_leaf() {
            let (key, value) = {
                let left_node = self.arena.get_mut(left);
                let key = left_node.keys.pop().expect("borrow from empty sibling");
                let value = left_node.values.pop().expect("borrow from empty sibling");
                (key, value)
            };
            {
                let child_node = self.arena.get_mut(child);
                child_node.keys.insert(0, key);
                child_node.values.insert(0, value);
            }
            self.arena.get_mut(parent).keys[site - 1] = key;
        } else {
            let separator = self.arena.get(parent).keys[site - 1];
            let (sibling_key, sibling_child) = {
                let left_node = self.arena.get_mut(left);
                let key = left_node.keys.pop().expect("borrow from empty sibling");
                let grand = left_node
                    .children
                    .pop()
                    .expect("index sibling without children");
                (key, grand)
            };
            {
                let child_node = self.arena.get_mut(child);
                child_node.keys.insert(0, separator);
                child_node.children.insert(0, sibling_child);
            }
            self.arena.get_mut(parent).keys[site - 1] = sibling_key;
        }

        self.mark_dirty(left);
        self.mark_dirty(child);
        self.mark_dirty(parent);
        debug!(site, "borrowed from left sibling");
    }

    /// Moves the right sibling's first entry into the underfull child.
    fn borrow_from_right(&mut self, parent: NodeId, site: usize) {
        let child = self.arena.get(parent).children[site];
        let right = self.arena.get(parent).children[site + 1];

        if self.arena.get(child).is_leaf() {
            let (key, value) = {
                let right_node = self.arena.get_mut(right);
                let key = right_node.keys.remove(0);
                let value = right_node.values.remove(0);
                (key, value)
            };
            {
                let child_node = self.arena.get_mut(child);
                child_node.keys.push(key);
                child_node.values.push(value);
            }
            let new_separator = self.arena.get(right).keys[0];
            self.arena.get_mut(parent).keys[site] = new_separator;
        } else {
            let separator = self.arena.get(parent).keys[site];
            let (sibling_key, sibling_child) = {
                let right_node = self.arena.get_mut(right);
                let key = right_node.keys.remove(0);
                let grand = right_node.children.remove(0);
                (key, grand)
            };
            {
                let child_node = self.arena.get_mut(child);
                child_node.keys.push(separator);
                child_node.children.push(sibling_child);
            }
            self.arena.get_mut(parent).keys[site] = sibling_key;
        }

        self.mark_dirty(child);
        self.mark_dirty(right);
        self.mark_dirty(parent);
        debug!(site, "borrowed from right sibling");
    }

    /// Merges `parent.children[site]` into its left sibling. The
    /// disappeared node's disk offset becomes the new free-list head.
    fn combine(&mut self, parent: NodeId, site: usize) {
        let left = self.arena.get(parent).children[site - 1];
        let disappearing = self.arena.get(parent).children[site];

        if self.arena.get(disappearing).is_leaf() {
            let (keys, values, next) = {
                let node = self.arena.get_mut(disappearing);
                (
                    std::mem::take(&mut node.keys),
                    std::mem::take(&mut node.values),
                    node.next,
                )
            };
            {
                let left_node = self.arena.get_mut(left);
                left_node.keys.extend(keys);
                left_node.values.extend(values);
                left_node.next = next;
            }
            if let Some(next) = next {
                self.arena.get_mut(next).prev = Some(left);
            }
        } else {
            let separator = self.arena.get(parent).keys[site - 1];
            let (keys, children) = {
                let node = self.arena.get_mut(disappearing);
                (
                    std::mem::take(&mut node.keys),
                    std::mem::take(&mut node.children),
                )
            };
            let left_node = self.arena.get_mut(left);
            left_node.keys.push(separator);
            left_node.keys.extend(keys);
            left_node.children.extend(children);
        }

        {
            let parent_node = self.arena.get_mut(parent);
            parent_node.keys.remove(site - 1);
            parent_node.children.remove(site);
        }

        self.release_node(disappearing);
        self.mark_dirty(left);
        self.mark_dirty(parent);
        debug!(site, "merged node into left sibling");
    }

    /// Returns a node's disk block to the free list and drops it from
    /// the arena, the address table, and the pool.
    fn release_node(&mut self, id: NodeId) {
        if let Some(offset) = self.att.offset_of(id) {
            self.free_space.push_head(offset);
            let filename = self.filename();
            self.pool.discard(&filename, offset, id);
        }
        self.pool.clear_dirty(id);
        self.att.release(id);
        self.arena.remove(id);
        self.node_num = self.node_num.saturating_sub(1);
    }

    // --------------------------------------------------------------------------------------------
    // Persistence
    // --------------------------------------------------------------------------------------------

    /// Assigns offsets to every leaf in chain order. Offsets are stable:
    /// a leaf that already has one keeps it; new leaves consume the
    /// free-space head before the file is extended.
    fn init_leaf_offsets(&mut self) {
        let mut cursor = self.start_leaf;
        while let Some(id) = cursor {
            if self.att.offset_of(id).is_none() {
                let offset = self.alloc_offset();
                self.arena.get_mut(id).offset = Some(offset);
                self.att.assign(id, offset);
            }
            cursor = self.arena.get(id).next;
        }
    }

    fn fsync_all(&mut self) -> Result<(), BTreeError> {
        self.init_leaf_offsets();

        // Index nodes (and the root) are mapped after the leaves.
        let unmapped: Vec<NodeId> = self
            .arena
            .iter()
            .filter(|(id, _)| self.att.offset_of(*id).is_none())
            .map(|(id, _)| id)
            .collect();
        for id in unmapped {
            let offset = self.alloc_offset();
            self.arena.get_mut(id).offset = Some(offset);
            self.att.assign(id, offset);
        }

        let bindings: Vec<(NodeId, u64)> = self.att.iter().collect();
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        for (id, offset) in &bindings {
            let encoded = page::encode_node(self.arena.get(*id), &self.att)?;
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(&encoded)?;
        }
        file.sync_all()?;

        for (id, _) in bindings {
            self.arena.get_mut(id).has_loaded = false;
            self.pool.clear_dirty(id);
        }

        info!(nodes = self.att.len(), path = %self.path.display(), "tree persisted");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Structure validation
    // --------------------------------------------------------------------------------------------

    fn validate(&self) -> Result<(), BTreeError> {
        let Some(root) = self.root else {
            return Ok(());
        };

        let mut in_order = Vec::new();
        self.validate_node(root, &mut in_order)?;

        let mut chained = Vec::new();
        let mut cursor = self.start_leaf;
        while let Some(id) = cursor {
            let leaf = self.arena.get(id);
            chained.extend_from_slice(&leaf.keys);
            cursor = leaf.next;
        }

        if chained != in_order {
            return Err(BTreeError::Internal(
                "leaf chain disagrees with in-order traversal".into(),
            ));
        }
        if chained.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BTreeError::Internal(
                "leaf chain not strictly ascending".into(),
            ));
        }
        Ok(())
    }

    fn validate_node(&self, id: NodeId, in_order: &mut Vec<u8>) -> Result<(), BTreeError> {
        let node = self.arena.get(id);
        if node.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BTreeError::Internal("keys not strictly ascending".into()));
        }
        match node.node_type {
            NodeType::Leaf => {
                if node.values.len() != node.keys.len() {
                    return Err(BTreeError::Internal("leaf key/value arity mismatch".into()));
                }
                if node.keys.len() > Self::max_keys(node) {
                    return Err(BTreeError::Internal("leaf over capacity".into()));
                }
                in_order.extend_from_slice(&node.keys);
            }
            NodeType::Index => {
                if node.keys.len() > Self::max_keys(node) {
                    return Err(BTreeError::Internal("index node over capacity".into()));
                }
                if node.children.len() != node.keys.len() + 1 {
                    return Err(BTreeError::Internal(format!(
                        "index node with {} keys has {} children",
                        node.keys.len(),
                        node.children.len()
                    )));
                }
                for &child in &node.children {
                    self.validate_node(child, in_order)?;
                }
            }
        }
        Ok(())
    }
}
