//! Sorted String Table (SSTable) Module
//!
//! Immutable, block-structured on-disk tables produced by memtable
//! flushes and compaction merges. Reads are served through a memory map;
//! once written, a table is never modified.
//!
//! # On-disk layout (all integers little-endian)
//!
//! ```text
//! [DATA BLOCK 0]      4096 bytes
//! [DATA BLOCK 1]      4096 bytes
//! ...
//! [META BLOCK 0]      4096 bytes  (bloom filters for a run of data blocks)
//! ...
//! [META-INDEX BLOCK]  ("BloomFilter.zpaperdb", BlockHandle) per meta block
//! [INDEX BLOCK]       (first_key, BlockHandle) per data block
//! [FOOTER]            48 bytes: both handles, zero padding, magic
//! ```
//!
//! **Data block** — a run of `(key_len, value_len, key, value)` records;
//! every sixteenth record begins a restart point whose offset lands in a
//! trailing array. The block tail is `[restart offsets u32×R]`
//! `[restart count u32][block type u8][crc32 u32]`, with the CRC taken
//! over everything before it. The tombstone bit of a record rides in the
//! high bit of `value_len`, which keeps the record framing and the
//! 8-byte per-record size charge intact.
//!
//! **Meta block** — serialized bloom filters
//! `(key_num, bit_map, bit_map_len, hash_num)` covering one data block
//! each, a per-filter offset array, the total filter size, the filter
//! base (log2 of the addressing granularity; 12 means one filter per
//! 4 KiB of data), a block-type byte, and a CRC32.
//!
//! **Footer** — meta-index handle, index handle, zero padding, and the
//! eight-byte magic `0xDB4775248B80FB57`.
//!
//! # Guarantees
//!
//! - **Immutability:** tables are written once via a `.tmp` rename.
//! - **Integrity:** every block carries a CRC32; the footer carries the
//!   magic. Mismatches surface as [`SSTableError::Corrupted`].
//! - **Fast negative lookups:** per-block bloom filters answer "not
//!   present" without touching the data region.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::{BuildSummary, TableBuilder};

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::bloom::SerializedFilter;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::memtable::Entry;

/// Fixed size of data and meta blocks.
pub const DATA_BLOCK_SIZE: usize = 4096;

/// Trailing magic identifying an SSTable file.
pub const MAGIC: u64 = 0xDB47_7524_8B80_FB57;

/// A restart point begins every sixteenth record in a data block.
pub const RESTART_INTERVAL: usize = 16;

/// log2 of the data addressing granularity covered by one filter.
pub const FILTER_BASE: u8 = 12;

/// Fixed footer size: two handles, zero padding, eight-byte magic.
pub const FOOTER_SIZE: usize = 48;

/// Meta-index key naming the bloom-filter meta blocks.
pub const META_INDEX_KEY: &str = "BloomFilter.zpaperdb";

/// Block type byte: no compression.
pub const BLOCK_TYPE_NONE: u8 = 0;

/// Block type byte: snappy compression.
pub const BLOCK_TYPE_SNAPPY: u8 = 1;

/// Data-block trailer: restart count (4) + block type (1) + crc (4).
pub(crate) const BLOCK_TRAILER_SIZE: usize = 9;

/// Meta-block trailer: filter size (4) + filter count (4) +
/// filter base (1) + block type (1) + crc (4).
pub(crate) const META_TRAILER_SIZE: usize = 14;

pub(crate) const TOMBSTONE_BIT: u32 = 1 << 31;

/// Errors returned by SSTable operations.
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Magic or checksum mismatch.
    #[error("corrupted SSTable: {0}")]
    Corrupted(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// `(offset, size)` reference to a block inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Byte offset of the block.
    pub offset: u32,

    /// Byte size of the block.
    pub size: u32,
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

/// One index-block entry: the first key of a data block and its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// First key stored in the referenced data block.
    pub first_key: Vec<u8>,

    /// Location of the data block.
    pub handle: BlockHandle,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

/// One meta-index entry: the filter-family name and a meta-block handle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaIndexEntry {
    /// Block family name; always [`META_INDEX_KEY`] for bloom blocks.
    pub name: String,

    /// Location of the meta block.
    pub handle: BlockHandle,
}

impl Encode for MetaIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { name, handle }, off))
    }
}

/// Parses the record region of one data block.
pub(crate) fn decode_block_entries(block: &[u8]) -> Result<Vec<Entry>, SSTableError> {
    if block.len() != DATA_BLOCK_SIZE {
        return Err(SSTableError::Corrupted(format!(
            "data block must be {DATA_BLOCK_SIZE} bytes, got {}",
            block.len()
        )));
    }

    let trailer_start = DATA_BLOCK_SIZE - BLOCK_TRAILER_SIZE;
    let restart_count = u32::from_le_bytes(
        block[trailer_start..trailer_start + 4]
            .try_into()
            .expect("4 bytes"),
    ) as usize;
    let restart_start = trailer_start
        .checked_sub(4 * restart_count)
        .ok_or_else(|| SSTableError::Corrupted("restart array exceeds block".into()))?;

    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor + 8 <= restart_start {
        let key_len = u32::from_le_bytes(block[cursor..cursor + 4].try_into().unwrap()) as usize;
        let raw_value_len =
            u32::from_le_bytes(block[cursor + 4..cursor + 8].try_into().unwrap());
        if key_len == 0 && raw_value_len == 0 {
            break; // zero padding
        }
        let tombstone = raw_value_len & TOMBSTONE_BIT != 0;
        let value_len = (raw_value_len & !TOMBSTONE_BIT) as usize;
        cursor += 8;

        if cursor + key_len + value_len > restart_start {
            return Err(SSTableError::Corrupted("record crosses restart array".into()));
        }
        let key = block[cursor..cursor + key_len].to_vec();
        cursor += key_len;
        let value = block[cursor..cursor + value_len].to_vec();
        cursor += value_len;

        entries.push(Entry {
            key,
            value,
            tombstone,
        });
    }
    Ok(entries)
}

fn verify_block_crc(block: &[u8]) -> Result<(), SSTableError> {
    if block.len() < 4 {
        return Err(SSTableError::Corrupted("block shorter than checksum".into()));
    }
    let stored = u32::from_le_bytes(
        block[block.len() - 4..]
            .try_into()
            .map_err(|_| SSTableError::Corrupted("short block".into()))?,
    );
    let mut hasher = Crc32::new();
    hasher.update(&block[..block.len() - 4]);
    if hasher.finalize() != stored {
        return Err(SSTableError::Corrupted("block checksum mismatch".into()));
    }
    Ok(())
}

/// A memory-mapped, immutable sorted string table.
pub struct SsTable {
    /// Memory map over the whole file.
    mmap: Mmap,

    /// Path the table was opened from.
    path: PathBuf,

    /// Index entries, one per data block, in key order.
    index: Vec<IndexEntry>,

    /// Per-data-block bloom filters, parallel to `index`.
    filters: Vec<SerializedFilter>,

    /// End of the data region (start of the first meta block).
    data_end: u32,
}

impl SsTable {
    /// Opens a table, verifying the footer magic and every metadata
    /// block checksum.
    ///
    /// # Safety of the mmap
    ///
    /// The file is immutable once renamed into place and the map is
    /// read-only, so the `unsafe` map cannot observe concurrent writes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(SSTableError::Corrupted("file shorter than footer".into()));
        }

        // Footer: [metaindex handle][index handle][padding][magic].
        let footer = &mmap[mmap.len() - FOOTER_SIZE..];
        let magic = u64::from_le_bytes(footer[FOOTER_SIZE - 8..].try_into().expect("8 bytes"));
        if magic != MAGIC {
            return Err(SSTableError::Corrupted(format!(
                "bad magic 0x{magic:016x}"
            )));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(footer)?;
        let (index_handle, _) = BlockHandle::decode_from(&footer[n..])?;

        // Index block.
        let index_bytes = Self::slice_block(&mmap, index_handle)?;
        verify_block_crc(index_bytes)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes[..index_bytes.len() - 4])?;

        // Meta-index block, then every referenced meta block.
        let metaindex_bytes = Self::slice_block(&mmap, metaindex_handle)?;
        verify_block_crc(metaindex_bytes)?;
        let (meta_entries, _) =
            encoding::decode_vec::<MetaIndexEntry>(&metaindex_bytes[..metaindex_bytes.len() - 4])?;

        let mut filters = Vec::with_capacity(index.len());
        for meta in &meta_entries {
            if meta.name != META_INDEX_KEY {
                return Err(SSTableError::Corrupted(format!(
                    "unknown meta block family {:?}",
                    meta.name
                )));
            }
            let block = Self::slice_block(&mmap, meta.handle)?;
            filters.extend(parse_meta_block(block)?);
        }

        let data_end = index
            .last()
            .map(|e| e.handle.offset + e.handle.size)
            .unwrap_or(0);

        trace!(
            path = %path.display(),
            blocks = index.len(),
            filters = filters.len(),
            "SSTable opened"
        );

        Ok(Self {
            mmap,
            path,
            index,
            filters,
            data_end,
        })
    }

    fn slice_block(mmap: &Mmap, handle: BlockHandle) -> Result<&[u8], SSTableError> {
        let start = handle.offset as usize;
        let end = start + handle.size as usize;
        if end > mmap.len() {
            return Err(SSTableError::Corrupted("block handle out of range".into()));
        }
        Ok(&mmap[start..end])
    }

    /// Path the table was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Index entries (first key and handle per data block).
    pub fn index_entries(&self) -> &[IndexEntry] {
        &self.index
    }

    /// End offset of the data region.
    pub fn data_end(&self) -> u32 {
        self.data_end
    }

    /// The sparse index: one `(anchor key, byte offset)` pair per
    /// 4 KiB data block, in key order.
    pub fn sparse_index(&self) -> impl Iterator<Item = (&[u8], u32)> {
        self.index
            .iter()
            .map(|e| (e.first_key.as_slice(), e.handle.offset))
    }

    /// Bounds the byte segment `[start, end)` that may contain `key`,
    /// by binary search over the sparse index. `None` when the key
    /// sorts before the first anchor.
    pub fn search_segment(&self, key: &[u8]) -> Option<(u32, u32)> {
        if self.index.is_empty() {
            return None;
        }
        let block = match self
            .index
            .binary_search_by(|e| e.first_key.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let start = self.index[block].handle.offset;
        let end = self
            .index
            .get(block + 1)
            .map(|e| e.handle.offset)
            .unwrap_or(self.data_end);
        Some((start, end))
    }

    /// Whether the per-block bloom filter admits `key` for the block at
    /// `block_idx`. A table without filters admits everything.
    pub fn filter_may_contain(&self, block_idx: usize, key: &[u8]) -> bool {
        match self.filters.get(block_idx) {
            Some(filter) => filter.query(key),
            None => true,
        }
    }

    /// Point lookup.
    ///
    /// Consults the per-block bloom filter first, then decodes the
    /// candidate block and binary-searches its records. A tombstone is
    /// reported as such so higher layers can stop the newest-to-oldest
    /// walk.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, SSTableError> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let block_idx = match self
            .index
            .binary_search_by(|e| e.first_key.as_slice().cmp(key))
        {
            Ok(i) => i,
            Err(0) => return Ok(None),
            Err(i) => i - 1,
        };

        if !self.filter_may_contain(block_idx, key) {
            return Ok(None);
        }

        let entries = self.block_entries(block_idx)?;
        match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(i) => Ok(Some(entries[i].clone())),
            Err(_) => Ok(None),
        }
    }

    /// Decodes and checksum-verifies the data block at `block_idx`.
    pub fn block_entries(&self, block_idx: usize) -> Result<Vec<Entry>, SSTableError> {
        let handle = self.index[block_idx].handle;
        let block = Self::slice_block(&self.mmap, handle)?;
        verify_block_crc(block)?;
        decode_block_entries(block)
    }

    /// Iterates every entry in key order, newest flush semantics
    /// preserved (tombstones included). Used by compaction merges.
    pub fn iter_entries(&self) -> Result<Vec<Entry>, SSTableError> {
        let mut out = Vec::new();
        for block_idx in 0..self.index.len() {
            out.extend(self.block_entries(block_idx)?);
        }
        Ok(out)
    }
}

/// Parses one 4 KiB meta block into its serialized filters.
pub(crate) fn parse_meta_block(block: &[u8]) -> Result<Vec<SerializedFilter>, SSTableError> {
    if block.len() != DATA_BLOCK_SIZE {
        return Err(SSTableError::Corrupted(format!(
            "meta block must be {DATA_BLOCK_SIZE} bytes, got {}",
            block.len()
        )));
    }
    verify_block_crc(block)?;

    // Trailer: [filter_size u32][filter_count u32][filter_base u8]
    //          [block_type u8][crc u32]
    let trailer_start = DATA_BLOCK_SIZE - META_TRAILER_SIZE;
    let filter_count = u32::from_le_bytes(
        block[trailer_start + 4..trailer_start + 8]
            .try_into()
            .expect("4 bytes"),
    ) as usize;
    let filter_base = block[trailer_start + 8];
    if filter_base != FILTER_BASE {
        return Err(SSTableError::Corrupted(format!(
            "unexpected filter base {filter_base}"
        )));
    }

    let offsets_start = trailer_start
        .checked_sub(4 * filter_count)
        .ok_or_else(|| SSTableError::Corrupted("filter offset array exceeds block".into()))?;
    let mut filters = Vec::with_capacity(filter_count);
    for i in 0..filter_count {
        let pos = offsets_start + 4 * i;
        let offset =
            u32::from_le_bytes(block[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        if offset >= offsets_start {
            return Err(SSTableError::Corrupted("filter offset out of range".into()));
        }
        let (filter, _) = SerializedFilter::decode_from(&block[offset..offsets_start])?;
        filters.push(filter);
    }
    Ok(filters)
}
