//! Manual big-endian serialization.
//!
//! Module configs, tuples and records cross process boundaries and land on
//! disk, so their encoding is explicit: implementors write themselves into a
//! capacity-aware stream and declare their encoded length up front. The
//! length declaration is load-bearing: flush messages and record buffers are
//! sized from `exposed_len` before a single byte is written.

use crate::error::{ComoError, ComoResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Augmented `io::Write` that is aware of the amount of remaining free
/// capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedWrite for io::Cursor<Vec<u8>> {
    #[inline]
    fn free_capacity(&self) -> usize {
        usize::max_value()
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for values shipped between processes or stored in a bytestream.
/// `deserialize(serialize(v)) == v` and `serialize(v).len() == exposed_len(v)`
/// must hold for every value.
pub trait Serializable: Sized {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()>;
    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self>;
    /// Exact encoded length of `self`.
    fn exposed_len(&self) -> usize;
}

/// Serializes into a freshly sized buffer.
pub fn to_bytes<T: Serializable>(value: &T) -> ComoResult<Vec<u8>> {
    let mut buf = vec![0u8; value.exposed_len()];
    let mut cursor = io::Cursor::new(&mut buf[..]);
    value.serialize(&mut cursor)?;
    if cursor.position() as usize != buf.len() {
        return Err(ComoError::Malformed("exposed_len mismatch"));
    }
    Ok(buf)
}

/// Deserializes a value from a byte slice, requiring full consumption.
pub fn from_bytes<T: Serializable>(bytes: &[u8]) -> ComoResult<T> {
    let mut cursor = io::Cursor::new(bytes);
    let value = T::deserialize(&mut cursor)?;
    if cursor.remaining_data() != 0 {
        return Err(ComoError::Malformed("trailing bytes"));
    }
    Ok(value)
}

/// Length-prefixed string encoding shared by module descriptors.
pub fn write_str<W: SizedWrite>(stream: &mut W, val: &str) -> ComoResult<()> {
    if stream.free_capacity() < 4 + val.len() {
        return Err(ComoError::Again);
    }
    stream.write_u32::<BigEndian>(val.len() as u32)?;
    stream.write_all(val.as_bytes())?;
    Ok(())
}

pub fn read_str<R: SizedRead>(stream: &mut R) -> ComoResult<String> {
    if stream.remaining_data() < 4 {
        return Err(ComoError::Malformed("truncated string length"));
    }
    let len = stream.read_u32::<BigEndian>()? as usize;
    if stream.remaining_data() < len {
        return Err(ComoError::Malformed("truncated string"));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ComoError::Malformed("string not utf-8"))
}

#[inline]
pub fn str_len(val: &str) -> usize {
    4 + val.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Sample {
        id: u64,
        name: String,
    }

    impl Serializable for Sample {
        fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
            stream.write_u64::<BigEndian>(self.id)?;
            write_str(stream, &self.name)
        }

        fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
            Ok(Sample {
                id: stream.read_u64::<BigEndian>()?,
                name: read_str(stream)?,
            })
        }

        fn exposed_len(&self) -> usize {
            8 + str_len(&self.name)
        }
    }

    #[test]
    fn test_roundtrip_and_length_law() {
        let value = Sample {
            id: 0xdead_beef,
            name: "topports".to_string(),
        };

        let bytes = to_bytes(&value).unwrap();
        assert_eq!(bytes.len(), value.exposed_len());

        let back: Sample = from_bytes(&bytes).unwrap();
        assert_eq!(back.id, value.id);
        assert_eq!(back.name, value.name);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let value = Sample {
            id: 1,
            name: "t".to_string(),
        };
        let mut bytes = to_bytes(&value).unwrap();
        bytes.push(0);

        let result = from_bytes::<Sample>(&bytes);
        assert_eq!(result.unwrap_err(), ComoError::Malformed("trailing bytes"));
    }

    #[test]
    fn test_truncated_string() {
        let value = Sample {
            id: 1,
            name: "traffic".to_string(),
        };
        let bytes = to_bytes(&value).unwrap();

        let result = from_bytes::<Sample>(&bytes[..bytes.len() - 2]);
        assert!(result.is_err());
    }
}
