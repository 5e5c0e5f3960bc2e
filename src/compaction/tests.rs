use super::*;

fn entry(key: &[u8], value: &[u8]) -> Entry {
    Entry {
        key: key.to_vec(),
        value: value.to_vec(),
        tombstone: false,
    }
}

fn tombstone(key: &[u8]) -> Entry {
    Entry {
        key: key.to_vec(),
        value: Vec::new(),
        tombstone: true,
    }
}

#[test]
fn test_merge_interleaves_sorted_sources() {
    let a = vec![entry(b"a", b"1"), entry(b"c", b"3"), entry(b"e", b"5")];
    let b = vec![entry(b"b", b"2"), entry(b"d", b"4"), entry(b"f", b"6")];

    let merged = merge_entries(vec![a, b], false);
    let keys: Vec<&[u8]> = merged.iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e", b"f"]);
}

#[test]
fn test_newest_version_wins() {
    // Source 0 is newest.
    let newer = vec![entry(b"k", b"new")];
    let older = vec![entry(b"k", b"old")];

    let merged = merge_entries(vec![newer, older], false);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].value, b"new");
}

#[test]
fn test_tombstone_shadows_older_value() {
    let newer = vec![tombstone(b"k")];
    let older = vec![entry(b"k", b"ghost")];

    // Not at the bottom: the tombstone must survive to keep shadowing.
    let merged = merge_entries(vec![newer.clone(), older.clone()], false);
    assert_eq!(merged.len(), 1);
    assert!(merged[0].tombstone);

    // At the bottom: both the tombstone and the shadowed value vanish.
    let merged = merge_entries(vec![newer, older], true);
    assert!(merged.is_empty());
}

#[test]
fn test_older_tombstone_does_not_hide_newer_value() {
    let newer = vec![entry(b"k", b"revived")];
    let older = vec![tombstone(b"k")];

    let merged = merge_entries(vec![newer, older], true);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].value, b"revived");
}

#[test]
fn test_merge_of_many_sources() {
    // Five generations of the same keyspace, newest first.
    let sources: Vec<Vec<Entry>> = (0..5u8)
        .map(|generation| {
            (0..100u8)
                .map(|k| entry(&[k], &[generation]))
                .collect()
        })
        .collect();

    let merged = merge_entries(sources, false);
    assert_eq!(merged.len(), 100);
    for (i, e) in merged.iter().enumerate() {
        assert_eq!(e.key, vec![i as u8]);
        assert_eq!(e.value, vec![0u8], "generation 0 is newest");
    }
}

#[test]
fn test_merge_empty_inputs() {
    assert!(merge_entries(Vec::new(), false).is_empty());
    assert!(merge_entries(vec![Vec::new(), Vec::new()], true).is_empty());
}

#[test]
fn test_merge_iterator_yields_all_versions_in_order() {
    let a = vec![entry(b"a", b"0"), entry(b"b", b"0")];
    let b = vec![entry(b"a", b"1"), entry(b"c", b"1")];

    let items: Vec<(Entry, usize)> = MergeIterator::new(vec![a, b]).collect();
    assert_eq!(items.len(), 4);
    // Same key: newest source (index 0) pops first.
    assert_eq!(items[0].0.key, b"a");
    assert_eq!(items[0].1, 0);
    assert_eq!(items[1].0.key, b"a");
    assert_eq!(items[1].1, 1);
    assert_eq!(items[2].0.key, b"b");
    assert_eq!(items[3].0.key, b"c");
}
