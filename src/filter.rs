use crate::config::{FilterConfig, FilterConfigBuilder};
use crate::error::{Result, ShmBloomError};
use crate::key::BloomKey;
use crate::region::{Locator, RegionOrigin, SharedRegion, WriteGuard};
use crate::traits::{BloomFilterOps, BloomFilterStats, BulkBloomFilterOps};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Bloom filter whose header and bits live in a memory-mapped region that
/// every handle on the same backing file shares.
///
/// Once `capacity` adds have happened since the last reset, the next `add`
/// clears the whole filter before inserting its key, so the realized false
/// positive rate never climbs past the configured one.
///
/// Reads may run concurrently with a single writer. Concurrent writers must
/// be serialized, either by the caller or with
/// [`FilterConfig::serialize_writers`]; otherwise two adds racing at the
/// capacity boundary can skip or duplicate a reset.
pub struct SharedMemoryBloomFilter {
    region: SharedRegion,
    config: FilterConfig,
}

/// Serializable snapshot of a filter's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub path: Option<PathBuf>,
    pub origin: RegionOrigin,
    pub capacity: u64,
    pub bit_length: u64,
    pub hash_count: u32,
    pub count: u64,
    pub population: u64,
    pub fill_ratio: f64,
    pub estimated_false_positive_rate: f64,
    pub design_false_positive_rate: f64,
    pub size_bytes: u64,
}

impl SharedMemoryBloomFilter {
    pub fn open(
        locator: impl Into<Locator>,
        config: FilterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let region = SharedRegion::open(locator, &config)?;
        Ok(Self { region, config })
    }

    /// Create or attach with default options.
    pub fn create(
        locator: impl Into<Locator>,
        capacity: u64,
        error_rate: f64,
    ) -> Result<Self> {
        let config = FilterConfigBuilder::default()
            .capacity(capacity)
            .error_rate(error_rate)
            .build()
            .map_err(|e| ShmBloomError::InvalidConfig(e.to_string()))?;
        Self::open(locator, config)
    }

    /// A filter in anonymous memory that no other process can see.
    pub fn private(capacity: u64, error_rate: f64) -> Result<Self> {
        Self::create(Locator::Anonymous, capacity, error_rate)
    }

    /// Read-only view of the mapped region. Writes go through the filter:
    ///
    /// ```compile_fail
    /// use shm_bloom_rs::SharedMemoryBloomFilter;
    ///
    /// let filter = SharedMemoryBloomFilter::private(10, 0.01).unwrap();
    /// filter.region().set_count(u64::MAX).unwrap();
    /// ```
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// False positive rate at full capacity implied by the stored
    /// parameters. For attached handles this may differ from the rate in
    /// the config.
    pub fn design_false_positive_rate(&self) -> f64 {
        let k = self.region.hash_count() as f64;
        let n = self.region.capacity() as f64;
        let m = self.region.bit_length() as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn flush(&self) -> Result<()> {
        self.region.flush()
    }

    /// Unmap the region. Later operations fail with
    /// [`ShmBloomError::Released`]; the backing file stays on disk.
    pub fn close(&mut self) {
        self.region.release();
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_released()
    }

    pub fn info(&self) -> Result<FilterInfo> {
        let header = self.region.header()?;
        Ok(FilterInfo {
            path: self.region.path().map(|p| p.to_path_buf()),
            origin: self.region.origin(),
            capacity: header.capacity,
            bit_length: header.bit_length,
            hash_count: header.hash_count,
            count: header.count,
            population: self.population()?,
            fill_ratio: self.fill_ratio()?,
            estimated_false_positive_rate: self
                .estimated_false_positive_rate()?,
            design_false_positive_rate: self.design_false_positive_rate(),
            size_bytes: self.region.size(),
        })
    }

    /// Canonicalize and hash before anything is mutated, so a bad key or a
    /// misbehaving hash function leaves the region untouched.
    fn positions<K: BloomKey + ?Sized>(&self, key: &K) -> Result<Vec<u64>> {
        let bytes = key.canonical_bytes()?;
        let bit_length = self.region.bit_length();
        let positions = (self.config.hash_function)(
            &bytes,
            self.region.hash_count(),
            bit_length,
        );
        if let Some(&bad) = positions.iter().find(|&&p| p >= bit_length) {
            return Err(ShmBloomError::InvalidConfig(format!(
                "hash function returned position {bad} for a {bit_length}-bit array"
            )));
        }
        Ok(positions)
    }

    fn writer_lock(&self) -> Result<Option<WriteGuard<'_>>> {
        if self.config.serialize_writers {
            self.region.lock_writers().map(Some)
        } else {
            Ok(None)
        }
    }

    fn insert_positions(&self, positions: &[u64]) -> Result<bool> {
        let mut reset = false;
        let count = self.region.count()?;
        if count >= self.region.capacity() {
            self.region.clear_bits()?;
            self.region.set_count(0)?;
            debug!(
                capacity = self.region.capacity(),
                count, "Capacity reached, filter reset"
            );
            reset = true;
        }

        for &position in positions {
            self.region.set_bit(position)?;
        }

        let count = self.region.count()?;
        self.region.set_count(count.saturating_add(1))?;
        Ok(reset)
    }

    fn probe(&self, positions: &[u64]) -> Result<bool> {
        for &position in positions {
            if !self.region.get_bit(position)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl BloomFilterOps for SharedMemoryBloomFilter {
    fn add<K: BloomKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let positions = self.positions(key)?;
        let _lock = self.writer_lock()?;
        self.insert_positions(&positions)
    }

    fn contains<K: BloomKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let positions = self.positions(key)?;
        self.probe(&positions)
    }

    fn clear(&self) -> Result<()> {
        let _lock = self.writer_lock()?;
        self.region.clear_bits()?;
        self.region.set_count(0)?;
        debug!("Filter cleared");
        Ok(())
    }
}

impl BulkBloomFilterOps for SharedMemoryBloomFilter {
    fn add_bulk<K: BloomKey>(&self, keys: &[K]) -> Result<Vec<bool>> {
        // Hash everything first; one bad key rejects the whole batch.
        let positions = keys
            .iter()
            .map(|key| self.positions(key))
            .collect::<Result<Vec<_>>>()?;

        let _lock = self.writer_lock()?;
        positions
            .iter()
            .map(|p| self.insert_positions(p))
            .collect()
    }

    fn contains_bulk<K: BloomKey>(&self, keys: &[K]) -> Result<Vec<bool>> {
        keys.iter().map(|key| self.contains(key)).collect()
    }
}

impl BloomFilterStats for SharedMemoryBloomFilter {
    fn capacity(&self) -> u64 {
        self.region.capacity()
    }

    fn bit_length(&self) -> u64 {
        self.region.bit_length()
    }

    fn hash_count(&self) -> u32 {
        self.region.hash_count()
    }

    fn len(&self) -> Result<u64> {
        self.region.count()
    }

    fn population(&self) -> Result<u64> {
        self.region.population()
    }
}

impl std::fmt::Debug for SharedMemoryBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SharedMemoryBloomFilter {{ path: {:?}, capacity: {}, bit_length: {}, hash_count: {}, origin: {:?}, closed: {} }}",
            self.region.path(),
            self.region.capacity(),
            self.region.bit_length(),
            self.region.hash_count(),
            self.region.origin(),
            self.region.is_released()
        )
    }
}
