//! Page codec — fixed 4 KiB on-disk representation of a B+Tree node.
//!
//! The encoded form replaces pointer fields with disk offsets drawn from
//! the [`AddressTable`](super::node::AddressTable). Offset `0` encodes an
//! absent pointer; real pages start at offset [`PAGE_SIZE`] so the two
//! can never collide.
//!
//! # Layout (little-endian)
//!
//! ```text
//! [node_type u8][key_num u16][current u64][prev u64][next u64]
//! [keys: key_num bytes]
//! leaf : [values: key_num × (u16 len, bytes)]
//! index: [children: (key_num + 1) × u64]
//! [zero padding to 4096]
//! ```
//!
//! Encoding is deterministic, so `encode(decode(page))` reproduces the
//! page byte-for-byte.

use thiserror::Error;

use super::node::{AddressTable, BTreeNode, NodeType};
use crate::encoding::{Decode, Encode, EncodingError};

/// Size of one on-disk page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Maximum keys in a leaf (data) node.
pub const DATA_NODE_MAX_KEY_NUM: usize = 230;

/// Minimum keys in a non-root leaf node.
pub const DATA_NODE_MIN_KEY_NUM: usize = 115;

/// Maximum keys in an index node.
pub const INDEX_NODE_MAX_KEY_NUM: usize = 450;

/// Minimum keys in a non-root index node.
pub const INDEX_NODE_MIN_KEY_NUM: usize = 225;

const TYPE_INDEX: u8 = 0;
const TYPE_LEAF: u8 = 1;

/// Errors returned by the page codec.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page bytes do not parse as a node.
    #[error("malformed page: {0}")]
    Malformed(String),

    /// The node payload does not fit in one page.
    #[error("page overflow: encoded node needs {needed} bytes, page is {PAGE_SIZE}")]
    Oversize {
        /// Bytes the encoded node would occupy.
        needed: usize,
    },

    /// Underlying encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// On-disk form of a node, with pointers replaced by offsets.
///
/// Reconstitution back to an in-memory node happens through the address
/// table, which re-binds offsets to node ids.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskNode {
    /// Node kind.
    pub node_type: NodeType,

    /// Valid keys, ascending.
    pub keys: Vec<u8>,

    /// Values parallel to `keys` (leaves only).
    pub values: Vec<String>,

    /// This node's own page offset.
    pub current_offset: u64,

    /// Offset of the previous leaf, `0` if absent.
    pub prev_offset: u64,

    /// Offset of the next leaf, `0` if absent.
    pub next_offset: u64,

    /// Child page offsets (index nodes only), `keys.len() + 1` entries.
    pub children_offsets: Vec<u64>,
}

/// Encodes a node into exactly one page.
///
/// Pointer fields are translated through `att`; an unmapped sibling or
/// child encodes as `0`.
///
/// # Errors
///
/// [`PageError::Oversize`] when the keys/values/children payload cannot
/// fit in [`PAGE_SIZE`] bytes.
pub fn encode_node(node: &BTreeNode, att: &AddressTable) -> Result<[u8; PAGE_SIZE], PageError> {
    let current = node.offset.unwrap_or(0);
    let prev = node
        .prev
        .and_then(|id| att.offset_of(id))
        .unwrap_or(0);
    let next = node
        .next
        .and_then(|id| att.offset_of(id))
        .unwrap_or(0);

    let mut buf: Vec<u8> = Vec::with_capacity(PAGE_SIZE);
    match node.node_type {
        NodeType::Index => TYPE_INDEX.encode_to(&mut buf)?,
        NodeType::Leaf => TYPE_LEAF.encode_to(&mut buf)?,
    }
    (node.keys.len() as u16).encode_to(&mut buf)?;
    current.encode_to(&mut buf)?;
    prev.encode_to(&mut buf)?;
    next.encode_to(&mut buf)?;
    buf.extend_from_slice(&node.keys);

    match node.node_type {
        NodeType::Leaf => {
            for value in &node.values {
                let len = u16::try_from(value.len()).map_err(|_| PageError::Oversize {
                    needed: PAGE_SIZE + value.len(),
                })?;
                len.encode_to(&mut buf)?;
                buf.extend_from_slice(value.as_bytes());
            }
        }
        NodeType::Index => {
            // An index node persists exactly key_num + 1 child slots.
            for &child in &node.children {
                att.offset_of(child).unwrap_or(0).encode_to(&mut buf)?;
            }
        }
    }

    if buf.len() > PAGE_SIZE {
        return Err(PageError::Oversize { needed: buf.len() });
    }

    let mut page = [0u8; PAGE_SIZE];
    page[..buf.len()].copy_from_slice(&buf);
    Ok(page)
}

/// Decodes one page into its disk-node form.
///
/// # Errors
///
/// [`PageError::Malformed`] on an unknown node type, an impossible key
/// count, or a truncated payload.
pub fn decode_page(page: &[u8]) -> Result<DiskNode, PageError> {
    if page.len() != PAGE_SIZE {
        return Err(PageError::Malformed(format!(
            "page must be {PAGE_SIZE} bytes, got {}",
            page.len()
        )));
    }

    let mut off = 0;
    let (type_byte, n) = u8::decode_from(&page[off..])?;
    off += n;
    let node_type = match type_byte {
        TYPE_INDEX => NodeType::Index,
        TYPE_LEAF => NodeType::Leaf,
        other => {
            return Err(PageError::Malformed(format!(
                "unknown node type byte 0x{other:02X}"
            )));
        }
    };

    let (key_num, n) = u16::decode_from(&page[off..])?;
    off += n;
    let key_num = key_num as usize;
    let max = match node_type {
        NodeType::Leaf => DATA_NODE_MAX_KEY_NUM,
        NodeType::Index => INDEX_NODE_MAX_KEY_NUM,
    };
    if key_num > max {
        return Err(PageError::Malformed(format!(
            "key count {key_num} exceeds node capacity {max}"
        )));
    }

    let (current_offset, n) = u64::decode_from(&page[off..])?;
    off += n;
    let (prev_offset, n) = u64::decode_from(&page[off..])?;
    off += n;
    let (next_offset, n) = u64::decode_from(&page[off..])?;
    off += n;

    if off + key_num > PAGE_SIZE {
        return Err(PageError::Malformed("truncated key array".into()));
    }
    let keys = page[off..off + key_num].to_vec();
    off += key_num;

    let mut values = Vec::new();
    let mut children_offsets = Vec::new();
    match node_type {
        NodeType::Leaf => {
            for _ in 0..key_num {
                let (len, n) = u16::decode_from(&page[off..])?;
                off += n;
                let len = len as usize;
                if off + len > PAGE_SIZE {
                    return Err(PageError::Malformed("truncated value".into()));
                }
                let value = std::str::from_utf8(&page[off..off + len])
                    .map_err(|e| PageError::Malformed(format!("value not UTF-8: {e}")))?
                    .to_string();
                off += len;
                values.push(value);
            }
        }
        NodeType::Index => {
            for _ in 0..key_num + 1 {
                let (child, n) = u64::decode_from(&page[off..])?;
                off += n;
                children_offsets.push(child);
            }
        }
    }

    Ok(DiskNode {
        node_type,
        keys,
        values,
        current_offset,
        prev_offset,
        next_offset,
        children_offsets,
    })
}

/// Re-encodes a [`DiskNode`] into page bytes.
///
/// Used by the byte-for-byte round-trip property and by the write-back
/// path when a decoded page is persisted unchanged.
pub fn encode_disk_node(node: &DiskNode) -> Result<[u8; PAGE_SIZE], PageError> {
    let mut buf: Vec<u8> = Vec::with_capacity(PAGE_SIZE);
    match node.node_type {
        NodeType::Index => TYPE_INDEX.encode_to(&mut buf)?,
        NodeType::Leaf => TYPE_LEAF.encode_to(&mut buf)?,
    }
    (node.keys.len() as u16).encode_to(&mut buf)?;
    node.current_offset.encode_to(&mut buf)?;
    node.prev_offset.encode_to(&mut buf)?;
    node.next_offset.encode_to(&mut buf)?;
    buf.extend_from_slice(&node.keys);
    match node.node_type {
        NodeType::Leaf => {
            for value in &node.values {
                let len = u16::try_from(value.len()).map_err(|_| PageError::Oversize {
                    needed: PAGE_SIZE + value.len(),
                })?;
                len.encode_to(&mut buf)?;
                buf.extend_from_slice(value.as_bytes());
            }
        }
        NodeType::Index => {
            for &child in &node.children_offsets {
                child.encode_to(&mut buf)?;
            }
        }
    }

    if buf.len() > PAGE_SIZE {
        return Err(PageError::Oversize { needed: buf.len() });
    }

    let mut page = [0u8; PAGE_SIZE];
    page[..buf.len()].copy_from_slice(&buf);
    Ok(page)
}
