#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use crate::memtable::Entry;
    use crate::sstable::{DATA_BLOCK_SIZE, SSTableError, SsTable, TableBuilder};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn build_file(tmp: &TempDir, count: u32) -> std::path::PathBuf {
        let path = tmp.path().join("ssTable1");
        let entries = (0..count).map(|i| Entry {
            key: i.to_be_bytes().to_vec(),
            value: b"value".to_vec(),
            tombstone: false,
        });
        TableBuilder::new(&path, 0.05).build(entries).unwrap();
        path
    }

    fn flip_byte(path: &std::path::Path, offset: u64) {
        use std::io::Read;
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[!byte[0]]).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_bad_magic_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = build_file(&tmp, 500);
        let len = std::fs::metadata(&path).unwrap().len();

        flip_byte(&path, len - 1);
        assert!(matches!(
            SsTable::open(&path),
            Err(SSTableError::Corrupted(_))
        ));
    }

    #[test]
    fn test_corrupt_data_block_detected_on_read() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = build_file(&tmp, 500);

        // Damage a record byte in the first data block; the table still
        // opens (metadata is intact) but the block read fails its CRC.
        flip_byte(&path, 100);
        let table = SsTable::open(&path).unwrap();
        assert!(matches!(
            table.block_entries(0),
            Err(SSTableError::Corrupted(_))
        ));
    }

    #[test]
    fn test_corrupt_meta_block_rejected_on_open() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = build_file(&tmp, 500);

        // 500 × 12-byte records fit in two data blocks; the meta block
        // follows them.
        let table = SsTable::open(&path).unwrap();
        let meta_offset = table.data_end() as u64;
        drop(table);

        flip_byte(&path, meta_offset + 10);
        assert!(matches!(
            SsTable::open(&path),
            Err(SSTableError::Corrupted(_))
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = build_file(&tmp, 500);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(20).unwrap();
        drop(file);

        assert!(SsTable::open(&path).is_err());
    }

    #[test]
    fn test_file_of_zeros_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("zeros");
        std::fs::write(&path, vec![0u8; 2 * DATA_BLOCK_SIZE]).unwrap();
        assert!(matches!(
            SsTable::open(&path),
            Err(SSTableError::Corrupted(_))
        ));
    }
}
