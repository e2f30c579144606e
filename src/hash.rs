use fnv::FnvHasher;
use murmur3::murmur3_x64_128;
use std::hash::Hasher;
use std::io::Cursor;

/// A type alias for the hash function used by the shared Bloom filter.
///
/// This function takes the canonical bytes of a key and computes the bit
/// positions that represent it in the shared bit array.
///
/// **Parameters:**
///
/// - `item: &[u8]`
///   - The canonical byte representation of the key.
/// - `num_hashes: u32`
///   - The number of positions to compute for the item.
/// - `bit_length: u64`
///   - The number of bits in the array. Every returned position is
///     strictly below this value.
///
/// **Returns:**
///
/// - `Vec<u64>`
///   - The positions, in probe order.
///
/// **Cross-process contract:**
///
/// Positions must depend on nothing but the three arguments. Every process
/// that maps the same region has to use the same function, and the function
/// must never draw on a per-process random seed (so `std`'s `RandomState`
/// is out), otherwise two processes set and probe different bits for the
/// same key and sharing silently breaks.
pub type HashFunction = fn(&[u8], u32, u64) -> Vec<u64>;

pub(crate) fn hash_murmur64(key: &[u8]) -> u64 {
    let mut cursor = Cursor::new(key);
    // Lower half of the 128-bit digest; seed is fixed at 0.
    murmur3_x64_128(&mut cursor, 0).expect("Failed to compute Murmur3 hash")
        as u64
}

pub(crate) fn hash_fnv64(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Kirsch-Mitzenmacher double hashing: position `i` is
/// `(h1 + i * h2) mod bit_length`, with `h1` from Murmur3 and `h2` from
/// FNV-1a. Both hashes are unseeded and stable across runs and processes.
pub fn default_hash_function(
    item: &[u8],
    num_hashes: u32,
    bit_length: u64,
) -> Vec<u64> {
    double_hash(hash_murmur64(item), hash_fnv64(item), num_hashes, bit_length)
}

// Exact in u128: i < 2^32, so h1 + i * h2 < 2^97.
fn double_hash(h1: u64, h2: u64, num_hashes: u32, bit_length: u64) -> Vec<u64> {
    let (h1, h2, m) = (h1 as u128, h2 as u128, bit_length as u128);
    (0..num_hashes as u128)
        .map(|i| ((h1 + i * h2) % m) as u64)
        .collect()
}

/// `m = ceil(-n * ln(p) / (ln 2)^2)`. Returns `f64` so callers can detect
/// results that do not fit the on-disk integer.
pub fn optimal_bit_vector_size(n: u64, fpr: f64) -> f64 {
    let ln2 = std::f64::consts::LN_2;
    ((-(n as f64) * fpr.ln()) / (ln2 * ln2)).ceil()
}

/// `k = max(1, round(m / n * ln 2))`.
pub fn optimal_num_hashes(n: u64, m: u64) -> u32 {
    let k = ((m as f64 / n as f64) * std::f64::consts::LN_2).round();
    (k as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_are_deterministic() {
        let first = default_hash_function(b"some data", 7, 9_586);
        let second = default_hash_function(b"some data", 7, 9_586);
        assert_eq!(first, second);
        assert_eq!(first.len(), 7);
    }

    #[test]
    fn test_positions_are_in_range() {
        for i in 0..1_000u32 {
            let key = i.to_be_bytes();
            for pos in default_hash_function(&key, 10, 719) {
                assert!(pos < 719);
            }
        }
    }

    #[test]
    fn test_positions_follow_double_hashing() {
        let item = b"double";
        let m = 1_000_003u64;
        let positions = default_hash_function(item, 4, m);
        assert_eq!(
            positions,
            double_hash(hash_murmur64(item), hash_fnv64(item), 4, m)
        );
    }

    #[test]
    fn test_double_hashing_does_not_wrap() {
        // (2^64 - 1) * i mod 10 for i = 0, 1, 2; wrapping at 2^64 would
        // give 5, 4, 3.
        assert_eq!(double_hash(u64::MAX, u64::MAX, 3, 10), vec![5, 0, 5]);
        // 2^64 mod 7 = 2, so (2^64 - 1) + 2 = 2^64 + 1 lands on 3.
        assert_eq!(double_hash(u64::MAX, 2, 2, 7), vec![1, 3]);
        assert_eq!(double_hash(3, 5, 4, 1 << 20), vec![3, 8, 13, 18]);
    }

    #[test]
    fn test_base_hashes_are_stable_values() {
        // FNV-1a 64 of the empty input is its offset basis.
        assert_eq!(hash_fnv64(b""), 0xcbf2_9ce4_8422_2325);
        // Murmur3 x64_128 with seed 0 maps the empty input to 0.
        assert_eq!(hash_murmur64(b""), 0);
    }

    #[test]
    fn test_different_keys_spread() {
        let a = default_hash_function(b"alpha", 5, 1 << 20);
        let b = default_hash_function(b"bravo", 5, 1 << 20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_optimal_sizes() {
        // n = 50, p = 0.001
        assert_eq!(optimal_bit_vector_size(50, 0.001), 719.0);
        assert_eq!(optimal_num_hashes(50, 719), 10);
        // n = 10_000, p = 0.2
        assert_eq!(optimal_bit_vector_size(10_000, 0.2), 33_499.0);
        assert_eq!(optimal_num_hashes(10_000, 33_499), 2);
    }

    #[test]
    fn test_num_hashes_is_at_least_one() {
        assert_eq!(optimal_num_hashes(1_000, 1), 1);
        assert_eq!(optimal_num_hashes(1, 1), 1);
    }
}
