use super::*;
use std::sync::Arc;

#[test]
fn test_added_key_always_queries_true() {
    let filter = BloomFilter::new(0.01, 200).unwrap();
    for i in 0..100u32 {
        filter.add(&i.to_le_bytes());
    }
    // No false negatives, ever.
    for i in 0..100u32 {
        assert!(filter.query(&i.to_le_bytes()), "false negative for {i}");
    }
    assert_eq!(filter.element_num(), 100);
}

#[test]
fn test_even_keys_scenario() {
    // Insert 0..100; the first 25 queries (keys 0, 4, 8, ..., 96) are
    // all members and must all return true.
    let filter = BloomFilter::new(0.01, 200).unwrap();
    for i in 0..100u32 {
        filter.add(&i.to_le_bytes());
    }
    let mut hits = 0;
    for step in 0..=50u32 {
        let key = step * 4;
        if filter.query(&key.to_le_bytes()) {
            hits += 1;
        }
        if step < 25 {
            assert_eq!(hits as u32, step + 1, "member key {key} missed");
        }
    }
}

#[test]
fn test_measured_fpp_within_tolerance() {
    let fpp = 0.01;
    let filter = BloomFilter::new(fpp, 10_000).unwrap();
    for i in 0..10_000u64 {
        filter.add(&i.to_le_bytes());
    }
    // Query 10k keys that were never inserted.
    let mut false_positives = 0u32;
    for i in 1_000_000..1_010_000u64 {
        if filter.query(&i.to_le_bytes()) {
            false_positives += 1;
        }
    }
    let measured = f64::from(false_positives) / 10_000.0;
    // Generous tolerance; the hash family is fixed, not ideal.
    assert!(
        measured < fpp * 5.0,
        "measured fpp {measured} far above configured {fpp}"
    );
}

#[test]
fn test_sizing_formulas() {
    let (m, k) = optimal_params(0.05, 10_000).unwrap();
    // m = ceil(-10000 * ln(0.05) / ln(2)^2) = 62353
    assert_eq!(m, 62353);
    // k = floor((m/n) * ln 2) = floor(4.32) = 4
    assert_eq!(k, 4);

    // k is clamped to the family size even when m/n is huge.
    let (_, k) = optimal_params(0.000001, 10).unwrap();
    assert_eq!(k, MAX_HASH_FUNCS);
}

#[test]
fn test_invalid_arguments_rejected() {
    assert!(matches!(
        BloomFilter::new(0.0, 100),
        Err(BloomError::InvalidArgument(_))
    ));
    assert!(matches!(
        BloomFilter::new(1.0, 100),
        Err(BloomError::InvalidArgument(_))
    ));
    assert!(matches!(
        BloomFilter::new(0.05, 0),
        Err(BloomError::InvalidArgument(_))
    ));
    assert!(matches!(
        BloomFilter::new(0.05, -3),
        Err(BloomError::InvalidArgument(_))
    ));
}

#[test]
fn test_serialized_filter_round_trip() {
    let filter = BloomFilter::new(0.01, 64).unwrap();
    for i in 0..64u8 {
        filter.add(&[i]);
    }
    let serialized = filter.to_serialized();
    let bytes = crate::encoding::encode_to_vec(&serialized).unwrap();
    let (back, consumed) = SerializedFilter::decode_from(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(back, serialized);

    // The serialized form answers membership identically.
    for i in 0..64u8 {
        assert!(back.query(&[i]));
    }
}

#[test]
fn test_concurrent_add_no_false_negatives() {
    let filter = Arc::new(BloomFilter::new(0.01, 4_000).unwrap());
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let filter = Arc::clone(&filter);
        handles.push(std::thread::spawn(move || {
            for i in 0..1_000u64 {
                filter.add(&(t * 1_000 + i).to_le_bytes());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for i in 0..4_000u64 {
        assert!(filter.query(&i.to_le_bytes()));
    }
    assert_eq!(filter.element_num(), 4_000);
}
