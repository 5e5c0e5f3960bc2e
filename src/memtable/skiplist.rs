//! Skip-list memtable.
//!
//! A multi-level ordered list: every node carries between 1 and
//! [`SKIP_LIST_MAX_HEIGHT`] forward pointers, and a level is raised with
//! probability `1 / SKIP_LIST_BRANCHING`, giving O(log n) expected
//! search cost. Nodes live in an arena; forward pointers are indices.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::trace;

use super::{Entry, MemFindResult, MemTable, TABLE_MAX_SIZE};

/// Maximum tower height of a node.
pub const SKIP_LIST_MAX_HEIGHT: usize = 12;

/// Branching factor: each level is kept with probability `1/4`.
pub const SKIP_LIST_BRANCHING: u32 = 4;

#[derive(Debug)]
struct SkipNode {
    /// `None` for the head sentinel.
    entry: Option<Entry>,

    /// Forward pointers, one per level.
    next: Vec<Option<usize>>,
}

/// Skip-list variant of the memtable.
#[derive(Debug)]
pub struct SkipListTable {
    nodes: Vec<SkipNode>,
    max_height: usize,
    len: usize,
    data_size: usize,
    full: bool,
    rng: StdRng,
}

const HEAD: usize = 0;

impl SkipListTable {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            nodes: vec![SkipNode {
                entry: None,
                next: vec![None; SKIP_LIST_MAX_HEIGHT],
            }],
            max_height: 1,
            len: 0,
            data_size: 0,
            full: false,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Samples a tower height: start at one level and keep raising with
    /// probability `1/SKIP_LIST_BRANCHING` until a failure or the cap.
    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < SKIP_LIST_MAX_HEIGHT && self.rng.random_ratio(1, SKIP_LIST_BRANCHING) {
            height += 1;
        }
        height
    }

    fn key_of(&self, node: usize) -> &[u8] {
        self.nodes[node]
            .entry
            .as_ref()
            .map(|e| e.key.as_slice())
            .unwrap_or(&[])
    }

    /// Collects the rightmost node strictly before `key` on every level.
    fn find_predecessors(&self, key: &[u8]) -> [usize; SKIP_LIST_MAX_HEIGHT] {
        let mut update = [HEAD; SKIP_LIST_MAX_HEIGHT];
        let mut cursor = HEAD;
        for level in (0..self.max_height).rev() {
            while let Some(next) = self.nodes[cursor].next[level] {
                if self.key_of(next) < key {
                    cursor = next;
                } else {
                    break;
                }
            }
            update[level] = cursor;
        }
        update
    }

    fn find_node(&self, key: &[u8]) -> Option<usize> {
        let update = self.find_predecessors(key);
        let candidate = self.nodes[update[0]].next[0]?;
        (self.key_of(candidate) == key).then_some(candidate)
    }
}

impl Default for SkipListTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable for SkipListTable {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>, tombstone: bool) {
        if let Some(n) = self.find_node(&key) {
            let entry = self.nodes[n]
                .entry
                .as_mut()
                .expect("non-head node without entry");
            self.data_size -= entry.value.len();
            self.data_size += value.len();
            entry.value = value;
            entry.tombstone = tombstone;
        } else {
            let entry_size = key.len() + value.len() + 8;
            let update = self.find_predecessors(&key);
            let height = self.random_height();
            if height > self.max_height {
                self.max_height = height;
            }

            let new = self.nodes.len();
            self.nodes.push(SkipNode {
                entry: Some(Entry {
                    key,
                    value,
                    tombstone,
                }),
                next: vec![None; height],
            });

            for level in 0..height {
                // Levels raised above the old max splice off the head.
                let pred = update[level];
                let succ = self.nodes[pred].next[level];
                self.nodes[new].next[level] = succ;
                self.nodes[pred].next[level] = Some(new);
            }

            self.len += 1;
            self.data_size += entry_size;
        }

        if self.data_size > TABLE_MAX_SIZE {
            self.full = true;
            trace!(data_size = self.data_size, "skip-list memtable full");
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let was_visible = matches!(self.find(key), MemFindResult::Value(_));
        self.insert(key.to_vec(), Vec::new(), true);
        was_visible
    }

    fn find(&self, key: &[u8]) -> MemFindResult {
        match self.find_node(key) {
            Some(n) => {
                let entry = self.nodes[n]
                    .entry
                    .as_ref()
                    .expect("non-head node without entry");
                if entry.tombstone {
                    MemFindResult::Tombstone
                } else {
                    MemFindResult::Value(entry.value.clone())
                }
            }
            None => MemFindResult::NotFound,
        }
    }

    fn export(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.nodes[HEAD].next[0];
        while let Some(n) = cursor {
            if let Some(entry) = &self.nodes[n].entry {
                out.push(entry.clone());
            }
            cursor = self.nodes[n].next[0];
        }
        out
    }

    fn len(&self) -> usize {
        self.len
    }

    fn data_size(&self) -> usize {
        self.data_size
    }

    fn is_full(&self) -> bool {
        self.full
    }
}
