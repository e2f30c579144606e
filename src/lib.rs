//! Shared-memory Bloom filter.
//!
//! The filter's header and bit array live in a memory-mapped file, so every
//! process (or thread) that opens the same file works on one logical filter:
//! an `add` through one handle is visible to `contains` through any other as
//! soon as it returns, with no flush and no message passing.
//!
//! HowTo:
//!    * Sizing: capacity `n` and error rate `p` give the bit length
//!      `m = ceil(-n ln p / (ln 2)^2)` and hash count `k = max(1, round(m/n ln 2))`.
//!    * Hashing: a key is canonicalized to bytes, then `k` positions are derived
//!      with double hashing, `(h1 + i * h2) mod m`, from unseeded Murmur3 and
//!      FNV-1a, so every process computes the same positions.
//!    * Region: the first opener of a missing or undersized file sizes it to
//!      `28 + ceil(m/8)` bytes and writes the header; later openers attach to
//!      what is there, whatever capacity they asked for.
//!
//! Insertion:
//!     * If `count` has reached `capacity`, every bit is cleared and `count` goes
//!       back to 0 first; `add` then returns `true`.
//!     * The key's `k` bits are set and `count` is incremented.
//! Query:
//!     * A key is reported present when all of its `k` bits are set.
//!
//! Obvious problems:
//!     * A reset forgets everything added before it.
//!     * The add sequence is check-then-act on shared memory. Readers are fine
//!       next to one writer; several writers need external serialization or
//!       `FilterConfig::serialize_writers`.
//!     * `count` counts calls, not distinct keys.

pub mod common;
mod config;
mod error;
mod filter;
mod hash;
mod key;
mod region;
mod traits;

pub use config::{
    BloomParams, ENV_CAPACITY, ENV_ERROR_RATE, FilterConfig, FilterConfigBuilder,
    FilterConfigBuilderError,
};
pub use error::{Result, ShmBloomError};
pub use filter::{FilterInfo, SharedMemoryBloomFilter};
pub use hash::{
    HashFunction, default_hash_function, optimal_bit_vector_size,
    optimal_num_hashes,
};
pub use key::{BloomKey, INT_KEY_WIDTH, Key};
pub use region::{
    HEADER_SIZE, Locator, RegionHeader, RegionOrigin, SharedRegion,
};
pub use traits::{BloomFilterOps, BloomFilterStats, BulkBloomFilterOps};
