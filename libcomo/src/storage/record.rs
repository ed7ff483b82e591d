//! Durable record framing.
//!
//! Records are back-to-back inside a chunk: `{ u32 size, u64 ts, payload }`,
//! big-endian, where `size` includes the 12-byte prefix. `load` is all a
//! reader needs to walk a stream record by record.

use crate::error::{ComoError, ComoResult};
use crate::serial::{to_bytes, Serializable};
use crate::time::Timestamp;
use byteorder::{BigEndian, ByteOrder};

/// Bytes of the `{size, ts}` prefix.
pub const RECORD_HEADER: usize = 12;

/// Serializes a record with its size-and-timestamp prefix.
pub fn store<T: Serializable>(ts: Timestamp, payload: &T) -> ComoResult<Vec<u8>> {
    let body = to_bytes(payload)?;
    let size = RECORD_HEADER + body.len();

    let mut rec = vec![0u8; size];
    BigEndian::write_u32(&mut rec[0..4], size as u32);
    BigEndian::write_u64(&mut rec[4..12], ts);
    rec[RECORD_HEADER..].copy_from_slice(&body);
    Ok(rec)
}

/// Reads the prefix of the record starting at `bytes[0]`, yielding the full
/// record size (prefix included) and its timestamp. Returns `Again` when
/// fewer than `RECORD_HEADER` bytes are available.
pub fn load(bytes: &[u8]) -> ComoResult<(u32, Timestamp)> {
    if bytes.len() < RECORD_HEADER {
        return Err(ComoError::Again);
    }

    let size = BigEndian::read_u32(&bytes[0..4]);
    if (size as usize) < RECORD_HEADER {
        return Err(ComoError::Malformed("record size below prefix"));
    }

    let ts = BigEndian::read_u64(&bytes[4..12]);
    Ok((size, ts))
}

/// Module payload of a complete record.
pub fn payload(bytes: &[u8]) -> ComoResult<&[u8]> {
    let (size, _) = load(bytes)?;
    if bytes.len() < size as usize {
        return Err(ComoError::Malformed("truncated record"));
    }
    Ok(&bytes[RECORD_HEADER..size as usize])
}
