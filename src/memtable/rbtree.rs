//! Red-black tree memtable.
//!
//! Nodes live in a slot arena and all links (parent, left, right) are
//! indices, which sidesteps the aliasing problems of pointer-linked
//! red-black trees. Rebalancing follows the classic insert fixup:
//!
//! - the root is black;
//! - a red node has black children;
//! - every root-to-leaf path crosses the same number of black nodes.
//!
//! The uncle-color cases drive recoloring versus rotation.

use tracing::trace;

use super::{Entry, MemFindResult, MemTable, TABLE_MAX_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug)]
struct RbNode {
    key: Vec<u8>,
    value: Vec<u8>,
    tombstone: bool,
    color: Color,
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

/// Red-black tree variant of the memtable.
#[derive(Debug, Default)]
pub struct RbTreeTable {
    nodes: Vec<RbNode>,
    root: Option<usize>,
    data_size: usize,
    full: bool,
}

impl RbTreeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn color(&self, node: Option<usize>) -> Color {
        // Nil leaves are black.
        node.map_or(Color::Black, |n| self.nodes[n].color)
    }

    fn find_node(&self, key: &[u8]) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(n) = cursor {
            cursor = match key.cmp(self.nodes[n].key.as_slice()) {
                std::cmp::Ordering::Equal => return Some(n),
                std::cmp::Ordering::Less => self.nodes[n].left,
                std::cmp::Ordering::Greater => self.nodes[n].right,
            };
        }
        None
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.nodes[x].right.expect("rotate_left without right child");
        let y_left = self.nodes[y].left;

        self.nodes[x].right = y_left;
        if let Some(child) = y_left {
            self.nodes[child].parent = Some(x);
        }

        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.nodes[p].left == Some(x) {
                    self.nodes[p].left = Some(y);
                } else {
                    self.nodes[p].right = Some(y);
                }
            }
        }

        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.nodes[x].left.expect("rotate_right without left child");
        let y_right = self.nodes[y].right;

        self.nodes[x].left = y_right;
        if let Some(child) = y_right {
            self.nodes[child].parent = Some(x);
        }

        let x_parent = self.nodes[x].parent;
        self.nodes[y].parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.nodes[p].left == Some(x) {
                    self.nodes[p].left = Some(y);
                } else {
                    self.nodes[p].right = Some(y);
                }
            }
        }

        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);
    }

    fn fix_insert(&mut self, mut z: usize) {
        while let Some(parent) = self.nodes[z].parent {
            if self.nodes[parent].color != Color::Red {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let grand = self.nodes[parent].parent.expect("red parent without grandparent");

            if self.nodes[grand].left == Some(parent) {
                let uncle = self.nodes[grand].right;
                if self.color(uncle) == Color::Red {
                    // Red uncle: recolor and continue from the grandparent.
                    self.nodes[parent].color = Color::Black;
                    if let Some(u) = uncle {
                        self.nodes[u].color = Color::Black;
                    }
                    self.nodes[grand].color = Color::Red;
                    z = grand;
                } else {
                    if self.nodes[parent].right == Some(z) {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.nodes[z].parent.expect("fixup lost parent");
                    let grand = self.nodes[parent].parent.expect("fixup lost grandparent");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[grand].color = Color::Red;
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.nodes[grand].left;
                if self.color(uncle) == Color::Red {
                    self.nodes[parent].color = Color::Black;
                    if let Some(u) = uncle {
                        self.nodes[u].color = Color::Black;
                    }
                    self.nodes[grand].color = Color::Red;
                    z = grand;
                } else {
                    if self.nodes[parent].left == Some(z) {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.nodes[z].parent.expect("fixup lost parent");
                    let grand = self.nodes[parent].parent.expect("fixup lost grandparent");
                    self.nodes[parent].color = Color::Black;
                    self.nodes[grand].color = Color::Red;
                    self.rotate_left(grand);
                }
            }
        }

        if let Some(root) = self.root {
            self.nodes[root].color = Color::Black;
        }
    }

    fn in_order(&self, node: Option<usize>, out: &mut Vec<Entry>) {
        let Some(n) = node else { return };
        self.in_order(self.nodes[n].left, out);
        out.push(Entry {
            key: self.nodes[n].key.clone(),
            value: self.nodes[n].value.clone(),
            tombstone: self.nodes[n].tombstone,
        });
        self.in_order(self.nodes[n].right, out);
    }

    /// Black-height consistency check used by tests: returns the black
    /// height when the red-black invariants hold.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<usize, String> {
        if self.color(self.root) == Color::Red {
            return Err("root is red".into());
        }
        self.check_node(self.root)
    }

    #[cfg(test)]
    fn check_node(&self, node: Option<usize>) -> Result<usize, String> {
        let Some(n) = node else { return Ok(1) };
        let me = &self.nodes[n];
        if me.color == Color::Red
            && (self.color(me.left) == Color::Red || self.color(me.right) == Color::Red)
        {
            return Err("red node with red child".into());
        }
        let left = self.check_node(me.left)?;
        let right = self.check_node(me.right)?;
        if left != right {
            return Err(format!("black height mismatch: {left} vs {right}"));
        }
        Ok(left + usize::from(me.color == Color::Black))
    }
}

impl MemTable for RbTreeTable {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>, tombstone: bool) {
        if let Some(n) = self.find_node(&key) {
            // Replace in place, keeping the size counter consistent.
            let node = &mut self.nodes[n];
            self.data_size -= node.value.len();
            self.data_size += value.len();
            node.value = value;
            node.tombstone = tombstone;
        } else {
            let entry_size = key.len() + value.len() + 8;
            let new = self.nodes.len();
            let mut parent = None;
            let mut cursor = self.root;
            while let Some(c) = cursor {
                parent = Some(c);
                cursor = if key.as_slice() < self.nodes[c].key.as_slice() {
                    self.nodes[c].left
                } else {
                    self.nodes[c].right
                };
            }

            self.nodes.push(RbNode {
                key,
                value,
                tombstone,
                color: Color::Red,
                parent,
                left: None,
                right: None,
            });

            match parent {
                None => self.root = Some(new),
                Some(p) => {
                    if self.nodes[new].key < self.nodes[p].key {
                        self.nodes[p].left = Some(new);
                    } else {
                        self.nodes[p].right = Some(new);
                    }
                }
            }
            self.fix_insert(new);
            self.data_size += entry_size;
        }

        if self.data_size > TABLE_MAX_SIZE {
            self.full = true;
            trace!(data_size = self.data_size, "red-black memtable full");
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        let was_visible = matches!(self.find(key), MemFindResult::Value(_));
        self.insert(key.to_vec(), Vec::new(), true);
        was_visible
    }

    fn find(&self, key: &[u8]) -> MemFindResult {
        match self.find_node(key) {
            Some(n) if self.nodes[n].tombstone => MemFindResult::Tombstone,
            Some(n) => MemFindResult::Value(self.nodes[n].value.clone()),
            None => MemFindResult::NotFound,
        }
    }

    fn export(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.in_order(self.root, &mut out);
        out
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn data_size(&self) -> usize {
        self.data_size
    }

    fn is_full(&self) -> bool {
        self.full
    }
}
