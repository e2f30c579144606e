mod common;

use common::test_utils::TestFile;
use shm_bloom_rs::{BloomFilterOps, BloomFilterStats, SharedMemoryBloomFilter};

const CAPACITY: u64 = 10_000;
const QUERIES: u64 = 10_000;

// Fill to capacity with 0..CAPACITY, then probe keys that were never added.
fn false_positives(filter: &SharedMemoryBloomFilter) -> u64 {
    for i in 0..CAPACITY {
        assert!(!filter.add(&i).unwrap(), "No reset before capacity");
    }
    assert_eq!(filter.len().unwrap(), CAPACITY);

    (CAPACITY..CAPACITY + QUERIES)
        .filter(|i| filter.contains(i).unwrap())
        .count() as u64
}

fn assert_rate_near(error_rate: f64) {
    let filter = SharedMemoryBloomFilter::private(CAPACITY, error_rate).unwrap();
    let rate = false_positives(&filter) as f64 / QUERIES as f64;
    assert!(
        rate > error_rate * 0.5 && rate < error_rate * 1.5,
        "p={error_rate}: observed rate {rate}"
    );
}

#[test]
fn test_fpr_0_2() {
    assert_rate_near(0.2);
}

#[test]
fn test_fpr_0_1() {
    assert_rate_near(0.1);
}

#[test]
fn test_fpr_0_01() {
    assert_rate_near(0.01);
}

#[test]
fn test_fpr_0_001() {
    let file = TestFile::new("fpr_0_001");
    let filter = SharedMemoryBloomFilter::create(file.path(), CAPACITY, 0.001)
        .unwrap();
    let count = false_positives(&filter);
    assert!(count <= 30, "Too many false positives: {count}");
}

#[test]
fn test_fpr_0_0000001() {
    let filter = SharedMemoryBloomFilter::private(CAPACITY, 1e-7).unwrap();
    let count = false_positives(&filter);
    assert!(count <= 1, "Too many false positives: {count}");
}

#[test]
fn test_estimated_rate_tracks_fill() {
    let filter = SharedMemoryBloomFilter::private(CAPACITY, 0.01).unwrap();
    assert_eq!(filter.estimated_false_positive_rate().unwrap(), 0.0);

    for i in 0..CAPACITY {
        filter.add(&i).unwrap();
    }
    let estimated = filter.estimated_false_positive_rate().unwrap();
    let design = filter.design_false_positive_rate();
    assert!(
        (estimated - design).abs() < design * 0.2,
        "estimated {estimated}, design {design}"
    );
    let fill = filter.fill_ratio().unwrap();
    assert!(fill > 0.45 && fill < 0.55, "fill ratio {fill}");
}
