//! Key canonicalization.
//!
//! A key has no identity beyond its canonical bytes: two keys whose
//! `canonical_bytes` are equal are the same key to every process sharing a
//! region. Custom key kinds plug in by implementing [`BloomKey`]; hashing and
//! bit-array code only ever see bytes.

use crate::error::{Result, ShmBloomError};
use std::borrow::Cow;

/// Width of the canonical integer encoding.
pub const INT_KEY_WIDTH: usize = 16;

/// Capability of turning a value into the byte sequence that gets hashed.
pub trait BloomKey {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>>;
}

/// Supported primitive key kinds, for callers that only know the kind of a
/// key at runtime (the CLI, bindings).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Int(i128),
    Text(String),
    Bytes(Vec<u8>),
}

/// Every integer kind is widened to `i128` and written big-endian, so `5u8`
/// and `5i64` hash identically.
fn int_bytes(value: i128) -> Cow<'static, [u8]> {
    Cow::Owned(value.to_be_bytes().to_vec())
}

impl BloomKey for Key {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            Key::Int(v) => Ok(int_bytes(*v)),
            Key::Text(s) => Ok(Cow::Borrowed(s.as_bytes())),
            Key::Bytes(b) => Ok(Cow::Borrowed(b.as_slice())),
        }
    }
}

impl BloomKey for str {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_bytes()))
    }
}

impl BloomKey for String {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_bytes()))
    }
}

impl BloomKey for [u8] {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self))
    }
}

impl BloomKey for Vec<u8> {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_slice()))
    }
}

impl<const N: usize> BloomKey for [u8; N] {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(self.as_slice()))
    }
}

impl<T: BloomKey + ?Sized> BloomKey for &T {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        (**self).canonical_bytes()
    }
}

macro_rules! impl_int_key {
    ($($t:ty),*) => {
        $(
            impl BloomKey for $t {
                fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
                    Ok(int_bytes(i128::from(*self)))
                }
            }
        )*
    };
}

impl_int_key!(i8, i16, i32, i64, i128, u8, u16, u32, u64);

impl BloomKey for isize {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(int_bytes(*self as i128))
    }
}

impl BloomKey for usize {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        Ok(int_bytes(*self as i128))
    }
}

impl BloomKey for u128 {
    fn canonical_bytes(&self) -> Result<Cow<'_, [u8]>> {
        let value = i128::try_from(*self).map_err(|_| {
            ShmBloomError::InvalidKey(format!(
                "integer {} does not fit the {}-byte signed encoding",
                self, INT_KEY_WIDTH
            ))
        })?;
        Ok(int_bytes(value))
    }
}

impl From<i128> for Key {
    fn from(value: i128) -> Self {
        Key::Int(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value.into())
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Key::Bytes(value)
    }
}
