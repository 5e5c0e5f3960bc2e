//! SSTable builder — writes a complete table from a sorted entry stream.
//!
//! The builder consumes the memtable export (or a compaction merge) and
//! produces the block-structured layout described in the
//! [module documentation](super): data blocks, bloom-filter meta blocks,
//! meta-index, index, and footer.
//!
//! # Input requirements
//!
//! - Entries must arrive in strictly ascending key order; the builder
//!   rejects out-of-order input.
//! - The stream must not be empty.
//!
//! # Atomicity
//!
//! Everything is written to `path.tmp`, flushed, synced, and renamed
//! onto the final path, so a crash cannot leave a half-written table.

use std::fs::{OpenOptions, rename};
use std::io::{BufWriter, Write};
use std::path::Path;

use crc32fast::Hasher as Crc32;
use tracing::{debug, info};

use crate::bloom::{self, BloomFilter, SerializedFilter};
use crate::encoding::{self, Encode};
use crate::memtable::Entry;

use super::{
    BLOCK_TRAILER_SIZE, BLOCK_TYPE_NONE, BlockHandle, DATA_BLOCK_SIZE, FILTER_BASE, FOOTER_SIZE,
    IndexEntry, MAGIC, META_INDEX_KEY, META_TRAILER_SIZE, MetaIndexEntry, RESTART_INTERVAL,
    SSTableError, TOMBSTONE_BIT,
};

/// Summary of a finished build, returned for logging and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    /// Number of entries written.
    pub entry_count: usize,

    /// Number of data blocks.
    pub block_count: usize,

    /// Total file size in bytes.
    pub file_size: u64,
}

/// One in-progress data block.
struct BlockBuffer {
    records: Vec<u8>,
    restarts: Vec<u32>,
    keys: Vec<Vec<u8>>,
    first_key: Option<Vec<u8>>,
}

impl BlockBuffer {
    fn new() -> Self {
        Self {
            records: Vec::with_capacity(DATA_BLOCK_SIZE),
            restarts: Vec::new(),
            keys: Vec::new(),
            first_key: None,
        }
    }

    fn count(&self) -> usize {
        self.keys.len()
    }

    /// Size the block would occupy with one more record of `rec_size`
    /// bytes, per the running formula
    /// `9 + Σ(key_len + value_len + 8) + 4·(count/16 rounded up)`.
    fn prospective_size(&self, rec_size: usize) -> usize {
        let new_count = self.count() + 1;
        let restart_count = new_count.div_ceil(RESTART_INTERVAL);
        BLOCK_TRAILER_SIZE + self.records.len() + rec_size + 4 * restart_count
    }

    fn push(&mut self, entry: &Entry) {
        if self.count() % RESTART_INTERVAL == 0 {
            self.restarts.push(self.records.len() as u32);
        }
        if self.first_key.is_none() {
            self.first_key = Some(entry.key.clone());
        }

        let mut value_len = entry.value.len() as u32;
        if entry.tombstone {
            value_len |= TOMBSTONE_BIT;
        }
        self.records
            .extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
        self.records.extend_from_slice(&value_len.to_le_bytes());
        self.records.extend_from_slice(&entry.key);
        self.records.extend_from_slice(&entry.value);
        self.keys.push(entry.key.clone());
    }

    /// Lays the block out as exactly [`DATA_BLOCK_SIZE`] bytes:
    /// records, zero padding, restart array, trailer.
    fn finish(&self) -> [u8; DATA_BLOCK_SIZE] {
        let mut block = [0u8; DATA_BLOCK_SIZE];
        block[..self.records.len()].copy_from_slice(&self.records);

        let trailer_start = DATA_BLOCK_SIZE - BLOCK_TRAILER_SIZE;
        let restarts_start = trailer_start - 4 * self.restarts.len();
        for (i, &offset) in self.restarts.iter().enumerate() {
            block[restarts_start + 4 * i..restarts_start + 4 * i + 4]
                .copy_from_slice(&offset.to_le_bytes());
        }
        block[trailer_start..trailer_start + 4]
            .copy_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        block[trailer_start + 4] = BLOCK_TYPE_NONE;

        let mut hasher = Crc32::new();
        hasher.update(&block[..DATA_BLOCK_SIZE - 4]);
        block[DATA_BLOCK_SIZE - 4..].copy_from_slice(&hasher.finalize().to_le_bytes());
        block
    }
}

/// Builds one 4 KiB meta block from a run of serialized filters.
fn finish_meta_block(filters: &[SerializedFilter]) -> Result<[u8; DATA_BLOCK_SIZE], SSTableError> {
    let mut block = [0u8; DATA_BLOCK_SIZE];
    let mut offsets = Vec::with_capacity(filters.len());
    let mut cursor = 0usize;

    for filter in filters {
        offsets.push(cursor as u32);
        let bytes = encoding::encode_to_vec(filter)?;
        block
            .get_mut(cursor..cursor + bytes.len())
            .ok_or_else(|| SSTableError::Internal("meta block overflow".into()))?
            .copy_from_slice(&bytes);
        cursor += bytes.len();
    }

    let trailer_start = DATA_BLOCK_SIZE - META_TRAILER_SIZE;
    let offsets_start = trailer_start - 4 * offsets.len();
    if cursor > offsets_start {
        return Err(SSTableError::Internal("meta block overflow".into()));
    }
    for (i, &offset) in offsets.iter().enumerate() {
        block[offsets_start + 4 * i..offsets_start + 4 * i + 4]
            .copy_from_slice(&offset.to_le_bytes());
    }
    block[trailer_start..trailer_start + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
    block[trailer_start + 4..trailer_start + 8]
        .copy_from_slice(&(offsets.len() as u32).to_le_bytes());
    block[trailer_start + 8] = FILTER_BASE;
    block[trailer_start + 9] = BLOCK_TYPE_NONE;

    let mut hasher = Crc32::new();
    hasher.update(&block[..DATA_BLOCK_SIZE - 4]);
    block[DATA_BLOCK_SIZE - 4..].copy_from_slice(&hasher.finalize().to_le_bytes());
    Ok(block)
}

/// Serializes a payload block (`meta-index` or `index`) with a trailing
/// CRC32 and returns its bytes.
fn finish_payload_block<T: Encode>(items: &[T]) -> Result<Vec<u8>, SSTableError> {
    let mut bytes = Vec::new();
    encoding::encode_vec(items, &mut bytes)?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    bytes.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(bytes)
}

/// Builds one immutable SSTable file on disk.
pub struct TableBuilder<P: AsRef<Path>> {
    path: P,
    fpp: f64,
}

impl<P: AsRef<Path>> TableBuilder<P> {
    /// Creates a builder targeting `path`, with the given per-block
    /// bloom-filter false-positive probability.
    pub fn new(path: P, fpp: f64) -> Self {
        Self { path, fpp }
    }

    /// Consumes a sorted entry stream and writes the complete table.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Internal`] on an empty or unsorted stream, or
    ///   a record too large for one block.
    /// - I/O and encoding failures from the write path.
    pub fn build(self, entries: impl Iterator<Item = Entry>) -> Result<BuildSummary, SSTableError> {
        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        let mut offset: u32 = 0;
        let mut index_entries: Vec<IndexEntry> = Vec::new();
        let mut filters: Vec<SerializedFilter> = Vec::new();
        let mut block = BlockBuffer::new();
        let mut last_key: Option<Vec<u8>> = None;
        let mut entry_count = 0usize;

        // 1. Data blocks.
        for entry in entries {
            if let Some(ref last) = last_key
                && entry.key.as_slice() <= last.as_slice()
            {
                return Err(SSTableError::Internal(
                    "entries must be strictly ascending by key".into(),
                ));
            }
            last_key = Some(entry.key.clone());
            entry_count += 1;

            let rec_size = entry.key.len() + entry.value.len() + 8;
            if BLOCK_TRAILER_SIZE + rec_size + 4 > DATA_BLOCK_SIZE {
                return Err(SSTableError::Internal(
                    "record too large for one data block".into(),
                ));
            }
            if block.count() > 0 && block.prospective_size(rec_size) > DATA_BLOCK_SIZE {
                Self::flush_data_block(
                    &mut writer,
                    &mut block,
                    &mut offset,
                    &mut index_entries,
                    &mut filters,
                    self.fpp,
                )?;
            }
            block.push(&entry);
        }
        if block.count() > 0 {
            Self::flush_data_block(
                &mut writer,
                &mut block,
                &mut offset,
                &mut index_entries,
                &mut filters,
                self.fpp,
            )?;
        }
        if entry_count == 0 {
            return Err(SSTableError::Internal(
                "cannot build an SSTable from an empty stream".into(),
            ));
        }

        // 2. Meta blocks: pack filters until the next would overflow.
        let mut meta_entries: Vec<MetaIndexEntry> = Vec::new();
        let mut run: Vec<SerializedFilter> = Vec::new();
        let mut run_size = 0usize;
        for filter in filters {
            let encoded = bloom::serialized_len(&filter);
            let prospective = run_size + encoded + 4 * (run.len() + 1) + META_TRAILER_SIZE;
            if !run.is_empty() && prospective > DATA_BLOCK_SIZE {
                Self::flush_meta_block(&mut writer, &run, &mut offset, &mut meta_entries)?;
                run.clear();
                run_size = 0;
            }
            run_size += encoded;
            run.push(filter);
        }
        if !run.is_empty() {
            Self::flush_meta_block(&mut writer, &run, &mut offset, &mut meta_entries)?;
        }

        // 3. Meta-index block.
        let metaindex_bytes = finish_payload_block(&meta_entries)?;
        let metaindex_handle = BlockHandle {
            offset,
            size: metaindex_bytes.len() as u32,
        };
        writer.write_all(&metaindex_bytes)?;
        offset += metaindex_bytes.len() as u32;

        // 4. Index block.
        let index_bytes = finish_payload_block(&index_entries)?;
        let index_handle = BlockHandle {
            offset,
            size: index_bytes.len() as u32,
        };
        writer.write_all(&index_bytes)?;
        offset += index_bytes.len() as u32;

        // 5. Footer: handles, zero padding, magic.
        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        metaindex_handle.encode_to(&mut footer)?;
        index_handle.encode_to(&mut footer)?;
        footer.resize(FOOTER_SIZE - 8, 0);
        footer.extend_from_slice(&MAGIC.to_le_bytes());
        writer.write_all(&footer)?;
        offset += FOOTER_SIZE as u32;

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| SSTableError::Internal(format!("buffered writer teardown: {e}")))?;
        file.sync_all()?;
        rename(&tmp_path, final_path)?;

        let summary = BuildSummary {
            entry_count,
            block_count: index_entries.len(),
            file_size: u64::from(offset),
        };
        info!(
            path = %final_path.display(),
            entries = summary.entry_count,
            blocks = summary.block_count,
            size = summary.file_size,
            "SSTable built"
        );
        Ok(summary)
    }

    fn flush_data_block(
        writer: &mut impl Write,
        block: &mut BlockBuffer,
        offset: &mut u32,
        index_entries: &mut Vec<IndexEntry>,
        filters: &mut Vec<SerializedFilter>,
        fpp: f64,
    ) -> Result<(), SSTableError> {
        let bytes = block.finish();
        writer.write_all(&bytes)?;

        let first_key = block
            .first_key
            .take()
            .ok_or_else(|| SSTableError::Internal("flushing an empty data block".into()))?;
        index_entries.push(IndexEntry {
            first_key,
            handle: BlockHandle {
                offset: *offset,
                size: DATA_BLOCK_SIZE as u32,
            },
        });

        let filter = BloomFilter::new(fpp, block.keys.len() as i64)
            .map_err(|e| SSTableError::Internal(e.to_string()))?;
        for key in &block.keys {
            filter.add(key);
        }
        filters.push(filter.to_serialized());

        debug!(
            offset = *offset,
            records = block.keys.len(),
            "data block flushed"
        );
        *offset += DATA_BLOCK_SIZE as u32;
        *block = BlockBuffer::new();
        Ok(())
    }

    fn flush_meta_block(
        writer: &mut impl Write,
        filters: &[SerializedFilter],
        offset: &mut u32,
        meta_entries: &mut Vec<MetaIndexEntry>,
    ) -> Result<(), SSTableError> {
        let bytes = finish_meta_block(filters)?;
        writer.write_all(&bytes)?;
        meta_entries.push(MetaIndexEntry {
            name: META_INDEX_KEY.to_string(),
            handle: BlockHandle {
                offset: *offset,
                size: DATA_BLOCK_SIZE as u32,
            },
        });
        debug!(
            offset = *offset,
            filters = filters.len(),
            "meta block flushed"
        );
        *offset += DATA_BLOCK_SIZE as u32;
        Ok(())
    }
}
