use crate::error::Result;
use crate::key::BloomKey;

/// Core operations for the shared bloom filter
pub trait BloomFilterOps {
    /// Add a key. Returns `true` when the filter was full and this call
    /// cleared it before inserting the key.
    fn add<K: BloomKey + ?Sized>(&self, key: &K) -> Result<bool>;

    /// Check whether a key may have been added since the last reset
    fn contains<K: BloomKey + ?Sized>(&self, key: &K) -> Result<bool>;

    /// Clear every bit and zero the count
    fn clear(&self) -> Result<()>;
}

/// Bulk operations for the shared bloom filter
pub trait BulkBloomFilterOps {
    /// Reset flags, one per key, in input order
    fn add_bulk<K: BloomKey>(&self, keys: &[K]) -> Result<Vec<bool>>;
    fn contains_bulk<K: BloomKey>(&self, keys: &[K]) -> Result<Vec<bool>>;
}

/// Statistics for the shared bloom filter
pub trait BloomFilterStats {
    fn capacity(&self) -> u64;
    fn bit_length(&self) -> u64;
    fn hash_count(&self) -> u32;

    /// Adds since the last reset, duplicates included
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of set bits
    fn population(&self) -> Result<u64>;

    fn fill_ratio(&self) -> Result<f64> {
        Ok(self.population()? as f64 / self.bit_length() as f64)
    }

    /// Probability that a key never added probes only set bits, given the
    /// bits set right now.
    fn estimated_false_positive_rate(&self) -> Result<f64> {
        Ok(self.fill_ratio()?.powi(self.hash_count() as i32))
    }
}
