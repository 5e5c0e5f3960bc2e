#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::lsm::{LsmConfig, LsmError, LsmTree};
    use crate::memtable::MemTableKind;
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
    fn test_put_get_delete_round_trip() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        engine.put(b"k1".to_vec(), b"v1".to_vec()).unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        assert!(engine.delete(b"k1").unwrap());
        assert_eq!(engine.get(b"k1").unwrap(), None);

        engine.close().unwrap();
    }

    #[test]
    fn test_get_missing_key() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        engine.put(b"present".to_vec(), b"v".to_vec()).unwrap();

        assert_eq!(engine.get(b"absent").unwrap(), None);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        engine.put(b"k".to_vec(), b"one".to_vec()).unwrap();
        engine.put(b"k".to_vec(), b"two".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_delete_missing_key_reports_false() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        assert!(!engine.delete(b"ghost").unwrap());
        assert_eq!(engine.get(b"ghost").unwrap(), None);
    }

    #[test]
    fn test_empty_key_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        assert!(matches!(
            engine.put(Vec::new(), b"v".to_vec()),
            Err(LsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.delete(b""),
            Err(LsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_both_memtable_kinds() {
        init_tracing();

        for kind in [MemTableKind::SkipList, MemTableKind::RedBlack] {
            let tmp = TempDir::new().unwrap();
            let config = LsmConfig {
                memtable_kind: kind,
                ..test_config()
            };
            let engine = LsmTree::open(tmp.path(), config).unwrap();

            for i in 0..500u32 {
                engine
                    .put(i.to_be_bytes().to_vec(), format!("v{i}").into_bytes())
                    .unwrap();
            }
            for i in (0..500u32).step_by(7) {
                assert_eq!(
                    engine.get(&i.to_be_bytes()).unwrap(),
                    Some(format!("v{i}").into_bytes()),
                    "kind {kind:?}, key {i}"
                );
            }
        }
    }

    #[test]
    fn test_get_after_flush_reads_from_sstable() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        for i in 0..1_000u32 {
            engine
                .put(i.to_be_bytes().to_vec(), i.to_le_bytes().to_vec())
                .unwrap();
        }
        assert!(engine.flush().unwrap());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.memtable_len, 0);
        assert_eq!(stats.level_counts[0], 1);

        for i in (0..1_000u32).step_by(13) {
            assert_eq!(
                engine.get(&i.to_be_bytes()).unwrap(),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }

    #[test]
    fn test_memtable_shadows_sstable() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        engine.put(b"k".to_vec(), b"old".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.put(b"k".to_vec(), b"new".to_vec()).unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_tombstone_shadows_flushed_value() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.flush().unwrap();
        assert!(engine.delete(b"k").unwrap());

        // The tombstone sits in the memtable; the value sits in a
        // level-0 table. The tombstone must win.
        assert_eq!(engine.get(b"k").unwrap(), None);

        // Even after the tombstone itself is flushed.
        engine.flush().unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_newer_sstable_shadows_older() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();

        engine.put(b"k".to_vec(), b"gen1".to_vec()).unwrap();
        engine.flush().unwrap();
        engine.put(b"k".to_vec(), b"gen2".to_vec()).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.stats().unwrap().level_counts[0], 2);
        assert_eq!(engine.get(b"k").unwrap(), Some(b"gen2".to_vec()));
    }

    #[test]
    fn test_flush_of_empty_memtable_is_noop() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let engine = LsmTree::open(tmp.path(), test_config()).unwrap();
        assert!(!engine.flush().unwrap());
        assert_eq!(engine.stats().unwrap().level_counts[0], 0);
    }

    #[test]
    fn test_put_rotates_full_memtable_inline() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        // Background workers are on but effectively asleep, so only the
        // inline rotate-and-retry path can keep the memtable bounded.
        let config = LsmConfig {
            background_compaction: true,
            write_buffer_size: 1024,
            minor_compact_interval: Duration::from_secs(60),
            major_compact_interval: Duration::from_secs(60),
            ..LsmConfig::default()
        };
        let engine = LsmTree::open(tmp.path(), config).unwrap();

        // Sustained writes far past the buffer size. Each entry charges
        // 4 + 64 + 8 bytes, so the table may exceed the threshold by at
        // most one entry before the next put rotates it.
        for i in 0..500u32 {
            engine
                .put(i.to_be_bytes().to_vec(), vec![0xCD; 64])
                .unwrap();
            let size = engine.stats().unwrap().memtable_size;
            assert!(size <= 1024 + 76, "memtable grew to {size} bytes");
        }

        let stats = engine.stats().unwrap();
        assert!(stats.level_counts[0] >= 2, "puts never flushed to level 0");

        for i in (0..500u32).step_by(37) {
            assert_eq!(engine.get(&i.to_be_bytes()).unwrap(), Some(vec![0xCD; 64]));
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_delete_rotates_full_memtable_inline() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let config = LsmConfig {
            write_buffer_size: 512,
            ..test_config()
        };
        let engine = LsmTree::open(tmp.path(), config).unwrap();

        for i in 0..40u32 {
            engine.put(i.to_be_bytes().to_vec(), vec![0xEE; 32]).unwrap();
        }
        // Tombstones also go through the bounded write path.
        for i in 0..40u32 {
            engine.delete(&i.to_be_bytes()).unwrap();
            let size = engine.stats().unwrap().memtable_size;
            assert!(size <= 512 + 44, "memtable grew to {size} bytes");
        }
        for i in (0..40u32).step_by(7) {
            assert_eq!(engine.get(&i.to_be_bytes()).unwrap(), None);
        }
    }

    #[test]
    fn test_invalid_fpp_rejected() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let config = LsmConfig {
            filter_fpp: 1.5,
            ..test_config()
        };
        assert!(matches!(
            LsmTree::open(tmp.path(), config),
            Err(LsmError::InvalidArgument(_))
        ));
    }
}
