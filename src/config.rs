use crate::error::{Result, ShmBloomError};
use crate::hash::{
    HashFunction, default_hash_function, optimal_bit_vector_size,
    optimal_num_hashes,
};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

pub const ENV_CAPACITY: &str = "SHMBLOOM_CAPACITY";
pub const ENV_ERROR_RATE: &str = "SHMBLOOM_ERROR_RATE";

/// Configuration for opening a shared filter.
///
/// `capacity` and `error_rate` only shape a region when it gets created.
/// Attaching to an initialized region keeps whatever that region was created
/// with.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct FilterConfig {
    /// Number of adds before the filter resets itself
    #[builder(default = "1_000_000")]
    pub capacity: u64,

    /// Target false positive rate at full capacity (0.0 to 1.0, exclusive)
    #[builder(default = "0.01")]
    pub error_rate: f64,

    /// Hash function; must match across every process sharing a region
    #[builder(default = "default_hash_function")]
    pub hash_function: HashFunction,

    /// Hint the kernel that bit-array access is random (unix only)
    #[builder(default = "true")]
    pub advise_random: bool,

    /// Hold an exclusive lock on the backing file for the whole add sequence
    #[builder(default = "false")]
    pub serialize_writers: bool,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        BloomParams::compute(self.capacity, self.error_rate).map(|_| ())
    }

    pub fn params(&self) -> Result<BloomParams> {
        BloomParams::compute(self.capacity, self.error_rate)
    }

    /// Builder defaults overridden by `SHMBLOOM_CAPACITY` /
    /// `SHMBLOOM_ERROR_RATE`.
    pub fn from_env() -> Result<Self> {
        let mut config = FilterConfigBuilder::default()
            .build()
            .map_err(|e| ShmBloomError::InvalidConfig(e.to_string()))?;
        if let Some(capacity) = env_var(ENV_CAPACITY)? {
            config.capacity = capacity;
        }
        if let Some(error_rate) = env_var(ENV_ERROR_RATE)? {
            config.error_rate = error_rate;
        }
        Ok(config)
    }
}

fn env_var<T>(var_name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(value) => value.trim().parse().map(Some).map_err(|e: T::Err| {
            ShmBloomError::EnvParseError {
                var_name: var_name.to_string(),
                value,
                error: e.to_string(),
            }
        }),
        Err(_) => Ok(None),
    }
}

/// Bit-array length and hash count derived from capacity and error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomParams {
    pub bit_length: u64,
    pub hash_count: u32,
}

impl BloomParams {
    pub fn compute(capacity: u64, error_rate: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(ShmBloomError::InvalidConfig(
                "Capacity must be > 0".into(),
            ));
        }
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(ShmBloomError::InvalidConfig(format!(
                "Error rate must be between 0 and 1, got {error_rate}"
            )));
        }

        let bits = optimal_bit_vector_size(capacity, error_rate);
        // Both the byte count and the header offset must fit in usize/u64.
        if !bits.is_finite() || bits >= (u64::MAX / 2) as f64 {
            return Err(ShmBloomError::InvalidConfig(format!(
                "Capacity {capacity} at error rate {error_rate} needs {bits} bits, \
                 which is not addressable"
            )));
        }
        let bit_length = bits as u64;
        let hash_count = optimal_num_hashes(capacity, bit_length);

        Ok(Self {
            bit_length,
            hash_count,
        })
    }

    /// Bytes needed for the packed bit array.
    pub fn byte_length(&self) -> u64 {
        self.bit_length.div_ceil(8)
    }
}
