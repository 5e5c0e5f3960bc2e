#[cfg(test)]
mod tests {
    use crate::btree::BTree;
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    fn open_tree(tmp: &TempDir) -> BTree {
        let path = tmp.path().join("btree.db");
        BTree::open(4, &path).unwrap()
    }

    #[test]
    fn test_insert_and_search_single() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        tree.insert(42, "answer").unwrap();
        let result = tree.search(42).unwrap();
        assert_eq!(result.value, "answer");
    }

    #[test]
    fn test_search_missing_key() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);
        tree.insert(1, "one").unwrap();

        assert!(matches!(
            tree.search(2),
            Err(crate::btree::BTreeError::NotFound)
        ));
    }

    #[test]
    fn test_insert_overwrites_existing_key() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        tree.insert(7, "first").unwrap();
        tree.insert(7, "second").unwrap();

        assert_eq!(tree.search(7).unwrap().value, "second");
        assert_eq!(tree.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_full_keyspace_chain_in_order() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        // 500 inserts over the single-byte keyspace; later duplicates
        // overwrite earlier ones, so 256 distinct keys remain.
        for i in 0..500usize {
            tree.insert((i % 256) as u8, String::new()).unwrap();
        }

        let pairs = tree.scan().unwrap();
        let keys: Vec<u8> = pairs.iter().map(|(k, _)| *k).collect();
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(keys, expected);

        tree.validate().unwrap();
    }

    #[test]
    fn test_leaf_split_respects_capacity() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        for key in 0..=255u8 {
            tree.insert(key, format!("v{key}")).unwrap();
        }

        // 256 keys exceed one leaf, so the root must have split at
        // least once and every leaf stays within capacity.
        assert!(tree.node_num().unwrap() >= 3);
        assert!(tree.height().unwrap() >= 2);

        let pairs = tree.scan().unwrap();
        assert_eq!(pairs.len(), 256);
        for (key, value) in pairs {
            assert_eq!(value, format!("v{key}"));
        }
        // Leaf capacity bounds are checked inside validate().
        tree.validate().unwrap();
    }

    #[test]
    fn test_descending_inserts_keep_order() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        for key in (0..=255u8).rev() {
            tree.insert(key, key.to_string()).unwrap();
        }

        let keys: Vec<u8> = tree.scan().unwrap().into_iter().map(|(k, _)| k).collect();
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(keys, expected);
        tree.validate().unwrap();
    }

    #[test]
    fn test_interleaved_inserts() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let tree = open_tree(&tmp);

        // Evens then odds, exercising mid-leaf insertion after a split.
        for key in (0..=254u8).step_by(2) {
            tree.insert(key, "even").unwrap();
        }
        for key in (1..=255u8).step_by(2) {
            tree.insert(key, "odd").unwrap();
        }

        let pairs = tree.scan().unwrap();
        assert_eq!(pairs.len(), 256);
        for (key, value) in pairs {
            let expected = if key % 2 == 0 { "even" } else { "odd" };
            assert_eq!(value, expected, "key {key}");
        }
        tree.validate().unwrap();
    }
}
