#[cfg(test)]
mod tests {
    use crate::lsm::{LsmConfig, LsmTree};
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn test_config() -> LsmConfig {
        LsmConfig {
            background_compaction: false,
            ..LsmConfig::default()
        }
    }

    #[test]
    fn test_unflushed_writes_survive_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            for i in 0..200u32 {
                engine
                    .put(i.to_be_bytes().to_vec(), format!("v{i}").into_bytes())
                    .unwrap();
            }
            // Dropped without close(): simulates a crash with a live WAL.
        }

        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        for i in (0..200u32).step_by(17) {
            assert_eq!(
                engine.get(&i.to_be_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes())
            );
        }
        assert_eq!(engine.stats().unwrap().memtable_len, 200);
    }

    #[test]
    fn test_deletes_survive_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            engine.put(b"kept".to_vec(), b"v".to_vec()).unwrap();
            engine.put(b"gone".to_vec(), b"v".to_vec()).unwrap();
            engine.delete(b"gone").unwrap();
        }

        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        assert_eq!(engine.get(b"kept").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.get(b"gone").unwrap(), None);
    }

    #[test]
    fn test_sstables_survive_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            for i in 0..500u32 {
                engine
                    .put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())
                    .unwrap();
            }
            engine.flush().unwrap();
            engine.close().unwrap();
        }

        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.level_counts[0], 1);
        assert_eq!(stats.memtable_len, 0, "WAL was truncated at flush");

        for i in (0..500u32).step_by(23) {
            assert_eq!(
                engine.get(&i.to_be_bytes()).unwrap(),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }

    #[test]
    fn test_mixed_layers_after_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            engine.put(b"flushed".to_vec(), b"disk".to_vec()).unwrap();
            engine.flush().unwrap();
            engine.put(b"pending".to_vec(), b"wal".to_vec()).unwrap();
            // No close: "pending" lives only in the WAL.
        }

        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        assert_eq!(engine.get(b"flushed").unwrap(), Some(b"disk".to_vec()));
        assert_eq!(engine.get(b"pending").unwrap(), Some(b"wal".to_vec()));
    }

    #[test]
    fn test_corrupt_wal_tail_keeps_earlier_records() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            engine.put(b"first".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"second".to_vec(), b"2".to_vec()).unwrap();
        }

        // Tear the last few bytes off the WAL.
        let wal_path = tmp.path().join("WAL");
        let size = std::fs::metadata(&wal_path).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap();
        file.set_len(size - 3).unwrap();
        drop(file);

        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        assert_eq!(engine.get(b"first").unwrap(), Some(b"1".to_vec()));
        // The torn record is gone; everything before it survived.
        assert_eq!(engine.get(b"second").unwrap(), None);
    }

    #[test]
    fn test_close_flushes_memtable() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        {
            let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
            engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
            engine.close().unwrap();
        }

        // After close, the data is in a table and the WAL is empty.
        assert_eq!(std::fs::metadata(tmp.path().join("WAL")).unwrap().len(), 0);
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.stats().unwrap().level_counts[0], 1);
    }
}
