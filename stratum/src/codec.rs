//! Key and value codecs.
//!
//! A [`Codec`] turns a typed value into bytes and back; the round trip must
//! be exact. Keys additionally carry a total order through [`KeyOrder`],
//! which must be consistent with equality or lookups may miss keys that
//! compare equal but order differently.

use std::cmp::Ordering;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encodes and decodes values of a single type.
pub trait Codec<T>: Send + Sync {
    /// Serializes a value to bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserializes a value from bytes.
    fn decode(&self, data: &[u8]) -> Result<T>;

    /// Returns the serialized size of a value without serializing it.
    fn encoded_size(&self, value: &T) -> usize;
}

/// A total order over keys.
pub trait KeyOrder<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Natural ordering for keys that implement [`Ord`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord> KeyOrder<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Total ordering for `f64` keys via the IEEE 754 total order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleOrder;

impl KeyOrder<f64> for DoubleOrder {
    fn compare(&self, a: &f64, b: &f64) -> Ordering {
        a.total_cmp(b)
    }
}

/// Adapts a comparison closure into a [`KeyOrder`].
pub struct OrderFn<F>(pub F);

impl<K, F> KeyOrder<K> for OrderFn<F>
where
    F: Fn(&K, &K) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

/// Big-endian codec for `i32`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntCodec;

impl Codec<i32> for IntCodec {
    fn encode(&self, value: &i32) -> Result<Vec<u8>> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<i32> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| Error::Codec(format!("invalid data length for i32: {}", data.len())))?;
        Ok(i32::from_be_bytes(bytes))
    }

    fn encoded_size(&self, _value: &i32) -> usize {
        4
    }
}

/// Big-endian codec for `i64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongCodec;

impl Codec<i64> for LongCodec {
    fn encode(&self, value: &i64) -> Result<Vec<u8>> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<i64> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| Error::Codec(format!("invalid data length for i64: {}", data.len())))?;
        Ok(i64::from_be_bytes(bytes))
    }

    fn encoded_size(&self, _value: &i64) -> usize {
        8
    }
}

/// Big-endian bit-pattern codec for `f64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleCodec;

impl Codec<f64> for DoubleCodec {
    fn encode(&self, value: &f64) -> Result<Vec<u8>> {
        Ok(value.to_bits().to_be_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<f64> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| Error::Codec(format!("invalid data length for f64: {}", data.len())))?;
        Ok(f64::from_bits(u64::from_be_bytes(bytes)))
    }

    fn encoded_size(&self, _value: &f64) -> usize {
        8
    }
}

/// Length-prefixed UTF-8 codec for `String`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        let utf8 = value.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + utf8.len());
        buf.put_u32(utf8.len() as u32);
        buf.put_slice(utf8);
        Ok(buf.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<String> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(Error::Codec(format!(
                "invalid data length for string: {}",
                data.len()
            )));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(Error::Codec("invalid string data length".to_string()));
        }
        String::from_utf8(buf.to_vec()).map_err(|e| Error::Codec(e.to_string()))
    }

    fn encoded_size(&self, value: &String) -> usize {
        4 + value.len()
    }
}

/// Self-describing binary codec for any serde-serializable type.
pub struct SerdeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeCodec<T> {
    pub fn new() -> Self {
        SerdeCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T> {
        bincode::deserialize(data).map_err(|e| Error::Codec(e.to_string()))
    }

    fn encoded_size(&self, value: &T) -> usize {
        bincode::serialized_size(value).map(|n| n as usize).unwrap_or(0)
    }
}
