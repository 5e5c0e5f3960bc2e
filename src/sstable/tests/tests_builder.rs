#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;

    use crate::memtable::Entry;
    use crate::sstable::{
        DATA_BLOCK_SIZE, FOOTER_SIZE, MAGIC, SSTableError, SsTable, TableBuilder,
    };
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn entry(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Entry {
        Entry {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            tombstone: false,
        }
    }

    fn binary_entries(count: u32) -> Vec<Entry> {
        (0..count)
            .map(|i| entry(i.to_be_bytes(), i.to_be_bytes()))
            .collect()
    }

    #[test]
    fn test_file_ends_with_magic() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        TableBuilder::new(&path, 0.05)
            .build(binary_entries(100).into_iter())
            .unwrap();

        let mut bytes = Vec::new();
        fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let magic = u64::from_le_bytes(bytes[bytes.len() - 8..].try_into().unwrap());
        assert_eq!(magic, MAGIC);
        assert_eq!(format!("{magic:x}"), "db4775248b80fb57");
    }

    #[test]
    fn test_ten_thousand_pairs_layout() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        let summary = TableBuilder::new(&path, 0.05)
            .build(binary_entries(10_000).into_iter())
            .unwrap();

        assert_eq!(summary.entry_count, 10_000);
        // Each record charges 4+4+8 = 16 bytes, so a 4 KiB block holds
        // at most 255 records; 10 000 pairs need at least 40 blocks.
        let min_blocks = 10_000usize.div_ceil((DATA_BLOCK_SIZE - 9) / 16);
        assert!(
            summary.block_count >= min_blocks,
            "{} blocks < minimum {min_blocks}",
            summary.block_count
        );

        let table = SsTable::open(&path).unwrap();
        assert_eq!(table.block_count(), summary.block_count);
        assert_eq!(
            summary.file_size,
            fs::metadata(&path).unwrap().len(),
            "summary size must match the file"
        );
    }

    #[test]
    fn test_block_partitioning_bound() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        TableBuilder::new(&path, 0.05)
            .build(binary_entries(4_000).into_iter())
            .unwrap();

        let table = SsTable::open(&path).unwrap();
        // Every block's record payload obeys the running-size formula:
        // pair_size · count + trailer + restarts ≤ 4096.
        let pair_size = 4 + 4 + 8;
        for block_idx in 0..table.block_count() {
            let count = table.block_entries(block_idx).unwrap().len();
            let restarts = count.div_ceil(16);
            assert!(
                pair_size * count + 9 + 4 * restarts <= DATA_BLOCK_SIZE,
                "block {block_idx} with {count} records overflows"
            );
            assert!(count > 0, "no block may be empty");
        }
    }

    #[test]
    fn test_data_blocks_are_page_sized_and_aligned() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        TableBuilder::new(&path, 0.05)
            .build(binary_entries(2_000).into_iter())
            .unwrap();

        let table = SsTable::open(&path).unwrap();
        for (i, entry) in table.index_entries().iter().enumerate() {
            assert_eq!(entry.handle.offset as usize, i * DATA_BLOCK_SIZE);
            assert_eq!(entry.handle.size as usize, DATA_BLOCK_SIZE);
        }
    }

    #[test]
    fn test_unsorted_input_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        let entries = vec![entry(b"b", b"1"), entry(b"a", b"2")];
        assert!(matches!(
            TableBuilder::new(&path, 0.05).build(entries.into_iter()),
            Err(SSTableError::Internal(_))
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        let entries = vec![entry(b"a", b"1"), entry(b"a", b"2")];
        assert!(matches!(
            TableBuilder::new(&path, 0.05).build(entries.into_iter()),
            Err(SSTableError::Internal(_))
        ));
    }

    #[test]
    fn test_empty_stream_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        assert!(matches!(
            TableBuilder::new(&path, 0.05).build(std::iter::empty()),
            Err(SSTableError::Internal(_))
        ));
        assert!(!path.exists(), "no table may appear on failure");
    }

    #[test]
    fn test_footer_handles_point_at_valid_blocks() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ssTable1");
        TableBuilder::new(&path, 0.05)
            .build(binary_entries(1_000).into_iter())
            .unwrap();

        // Opening validates footer magic, index checksum, meta-index
        // checksum, and every meta block checksum.
        let table = SsTable::open(&path).unwrap();
        assert!(table.block_count() > 0);
        let file_len = fs::metadata(&path).unwrap().len();
        assert!(file_len > FOOTER_SIZE as u64);
    }
}
