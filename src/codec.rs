//! Key/Value Codecs
//!
//! Binary serializers for keys and values stored in bucket pages, and the
//! hash function that places keys in the directory.
//!
//! ## Encodings
//! ```text
//! i64      : 8 bytes little-endian
//! i32      : 4 bytes little-endian
//! String   : u32 byte length (LE) + UTF-8 bytes
//! Vec<u8>  : u32 byte length (LE) + bytes
//! ```

use std::borrow::Cow;
use std::marker::PhantomData;

use bytes::{Buf, BufMut};

use crate::error::{PageHashError, Result};

// =============================================================================
// Serializer Contract
// =============================================================================

/// Fixed or length-prefixed binary encoding of `T`.
///
/// `deserialize` and `size_in_buffer` receive a slice that starts at the
/// encoded value and may extend past it.
pub trait BinarySerializer<T>: Send + Sync {
    /// Identifier persisted in the index metadata page
    fn id(&self) -> u8;

    /// Encoded size of `value` in bytes
    fn object_size(&self, value: &T) -> usize;

    /// Encoded size of the value at the start of `buf`
    fn size_in_buffer(&self, buf: &[u8]) -> Result<usize>;

    /// Encode `value` into the first `object_size(value)` bytes of `buf`
    fn serialize(&self, value: &T, buf: &mut [u8]) -> Result<()>;

    fn deserialize(&self, buf: &[u8]) -> Result<T>;

    /// Normalize a key once before it is hashed, compared or stored
    fn preprocess<'a>(&self, value: &'a T) -> Cow<'a, T>
    where
        T: Clone,
    {
        Cow::Borrowed(value)
    }

    fn to_vec(&self, value: &T) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.object_size(value)];
        self.serialize(value, &mut buf)?;
        Ok(buf)
    }
}

fn ensure_len(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(PageHashError::Serialization(format!(
            "{what} needs {needed} bytes, buffer has {}",
            buf.len()
        )));
    }
    Ok(())
}

// =============================================================================
// Built-in Serializers
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct LongSerializer;

impl LongSerializer {
    pub const ID: u8 = 10;
}

impl BinarySerializer<i64> for LongSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, _value: &i64) -> usize {
        8
    }

    fn size_in_buffer(&self, _buf: &[u8]) -> Result<usize> {
        Ok(8)
    }

    fn serialize(&self, value: &i64, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, 8, "i64")?;
        (&mut buf[..]).put_i64_le(*value);
        Ok(())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<i64> {
        ensure_len(buf, 8, "i64")?;
        Ok((&buf[..]).get_i64_le())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IntegerSerializer;

impl IntegerSerializer {
    pub const ID: u8 = 8;
}

impl BinarySerializer<i32> for IntegerSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, _value: &i32) -> usize {
        4
    }

    fn size_in_buffer(&self, _buf: &[u8]) -> Result<usize> {
        Ok(4)
    }

    fn serialize(&self, value: &i32, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, 4, "i32")?;
        (&mut buf[..]).put_i32_le(*value);
        Ok(())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<i32> {
        ensure_len(buf, 4, "i32")?;
        Ok((&buf[..]).get_i32_le())
    }
}

/// Length-prefixed UTF-8 strings
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl StringSerializer {
    pub const ID: u8 = 13;
}

impl BinarySerializer<String> for StringSerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, value: &String) -> usize {
        4 + value.len()
    }

    fn size_in_buffer(&self, buf: &[u8]) -> Result<usize> {
        ensure_len(buf, 4, "string length")?;
        Ok(4 + (&buf[..]).get_u32_le() as usize)
    }

    fn serialize(&self, value: &String, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, 4 + value.len(), "string")?;
        let mut out = &mut buf[..];
        out.put_u32_le(value.len() as u32);
        out.put_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<String> {
        let size = self.size_in_buffer(buf)?;
        ensure_len(buf, size, "string")?;
        String::from_utf8(buf[4..size].to_vec())
            .map_err(|e| PageHashError::Serialization(format!("invalid UTF-8 key: {e}")))
    }
}

/// Length-prefixed raw bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteArraySerializer;

impl ByteArraySerializer {
    pub const ID: u8 = 17;
}

impl BinarySerializer<Vec<u8>> for ByteArraySerializer {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn object_size(&self, value: &Vec<u8>) -> usize {
        4 + value.len()
    }

    fn size_in_buffer(&self, buf: &[u8]) -> Result<usize> {
        ensure_len(buf, 4, "byte array length")?;
        Ok(4 + (&buf[..]).get_u32_le() as usize)
    }

    fn serialize(&self, value: &Vec<u8>, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, 4 + value.len(), "byte array")?;
        let mut out = &mut buf[..];
        out.put_u32_le(value.len() as u32);
        out.put_slice(value);
        Ok(())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let size = self.size_in_buffer(buf)?;
        ensure_len(buf, size, "byte array")?;
        Ok(buf[4..size].to_vec())
    }
}

// =============================================================================
// Hash Functions
// =============================================================================

/// 64-bit hash code of a key. The leading bits pick the directory slot.
pub trait HashFunction<K>: Send + Sync {
    fn hash_code(&self, key: &K) -> u64;
}

/// XXH3 over the serialized key bytes
pub struct Xxh3HashFunction<K, S> {
    serializer: S,
    _key: PhantomData<fn(&K)>,
}

impl<K, S: BinarySerializer<K>> Xxh3HashFunction<K, S> {
    pub fn new(serializer: S) -> Self {
        Self {
            serializer,
            _key: PhantomData,
        }
    }
}

impl<K, S: BinarySerializer<K>> HashFunction<K> for Xxh3HashFunction<K, S> {
    fn hash_code(&self, key: &K) -> u64 {
        let mut buf = vec![0u8; self.serializer.object_size(key)];
        // object_size sized the buffer, so serialization cannot run short
        match self.serializer.serialize(key, &mut buf) {
            Ok(()) => xxhash_rust::xxh3::xxh3_64(&buf),
            Err(_) => 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
