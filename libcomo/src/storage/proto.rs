//! Storage protocol messages exchanged between clients and the STORAGE
//! process, carried as IPC payloads.

use crate::error::{ComoError, ComoResult};
use crate::serial::{read_str, str_len, write_str, Serializable, SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Open modes use deliberately odd wire codes so a stray value never parses
/// as a valid mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenMode {
    Writer,
    Reader,
    ReaderNonBlock,
}

impl OpenMode {
    pub fn code(self) -> u16 {
        match self {
            OpenMode::Writer => 0x0437,
            OpenMode::Reader => 0xff12,
            OpenMode::ReaderNonBlock => 0xdfde,
        }
    }

    pub fn from_code(code: u16) -> ComoResult<OpenMode> {
        match code {
            0x0437 => Ok(OpenMode::Writer),
            0xff12 => Ok(OpenMode::Reader),
            0xdfde => Ok(OpenMode::ReaderNonBlock),
            _ => Err(ComoError::Malformed("invalid open mode")),
        }
    }

    pub fn is_reader(self) -> bool {
        !matches!(self, OpenMode::Writer)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SeekDir {
    Next,
    Prev,
}

impl SeekDir {
    pub fn code(self) -> u8 {
        match self {
            SeekDir::Next => 1,
            SeekDir::Prev => 2,
        }
    }

    pub fn from_code(code: u8) -> ComoResult<SeekDir> {
        match code {
            1 => Ok(SeekDir::Next),
            2 => Ok(SeekDir::Prev),
            _ => Err(ComoError::Malformed("invalid seek direction")),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenMsg {
    pub name: String,
    pub mode: OpenMode,
    pub size_limit: u64,
}

impl Serializable for OpenMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u16::<BigEndian>(self.mode.code())?;
        stream.write_u64::<BigEndian>(self.size_limit)?;
        write_str(stream, &self.name)
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let mode = OpenMode::from_code(stream.read_u16::<BigEndian>()?)?;
        let size_limit = stream.read_u64::<BigEndian>()?;
        let name = read_str(stream)?;
        Ok(OpenMsg {
            name,
            mode,
            size_limit,
        })
    }

    fn exposed_len(&self) -> usize {
        2 + 8 + str_len(&self.name)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OpenReply {
    pub fd: u32,
    pub ofs: u64,
}

impl Serializable for OpenReply {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.fd)?;
        stream.write_u64::<BigEndian>(self.ofs)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(OpenReply {
            fd: stream.read_u32::<BigEndian>()?,
            ofs: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        12
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MapMsg {
    pub fd: u32,
    pub ofs: u64,
    pub sz: u32,
}

impl Serializable for MapMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.fd)?;
        stream.write_u64::<BigEndian>(self.ofs)?;
        stream.write_u32::<BigEndian>(self.sz)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(MapMsg {
            fd: stream.read_u32::<BigEndian>()?,
            ofs: stream.read_u64::<BigEndian>()?,
            sz: stream.read_u32::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        16
    }
}

/// Reply to a map request. A zero `len` means end-of-stream for the
/// requested offset (non-blocking readers and drained streams).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MapReply {
    pub chunk_start: u64,
    pub len: u32,
}

impl Serializable for MapReply {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u64::<BigEndian>(self.chunk_start)?;
        stream.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(MapReply {
            chunk_start: stream.read_u64::<BigEndian>()?,
            len: stream.read_u32::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        12
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SeekMsg {
    pub fd: u32,
    pub dir: SeekDir,
}

impl Serializable for SeekMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.fd)?;
        stream.write_u8(self.dir.code())?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(SeekMsg {
            fd: stream.read_u32::<BigEndian>()?,
            dir: SeekDir::from_code(stream.read_u8()?)?,
        })
    }

    fn exposed_len(&self) -> usize {
        5
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SeekReply {
    pub ofs: u64,
}

impl Serializable for SeekReply {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u64::<BigEndian>(self.ofs)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(SeekReply {
            ofs: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        8
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CommitMsg {
    pub fd: u32,
    pub ofs: u64,
}

impl Serializable for CommitMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.fd)?;
        stream.write_u64::<BigEndian>(self.ofs)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(CommitMsg {
            fd: stream.read_u32::<BigEndian>()?,
            ofs: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        12
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CloseMsg {
    pub fd: u32,
    /// Writers pass the final offset; the tail chunk is truncated there.
    pub ofs: u64,
}

impl Serializable for CloseMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.fd)?;
        stream.write_u64::<BigEndian>(self.ofs)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(CloseMsg {
            fd: stream.read_u32::<BigEndian>()?,
            ofs: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        12
    }
}

/// Error codes sent on the CS_ERROR reply.
pub mod err_code {
    pub const UNKNOWN_STREAM: u8 = 1;
    pub const WRITER_BUSY: u8 = 2;
    pub const BAD_FD: u8 = 3;
    pub const BAD_OFFSET: u8 = 4;
    pub const NOT_WRITER: u8 = 5;
    pub const TIMEOUT: u8 = 6;
    pub const NO_CHUNK: u8 = 7;
    pub const IO: u8 = 8;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorReply {
    pub code: u8,
}

impl Serializable for ErrorReply {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u8(self.code)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(ErrorReply {
            code: stream.read_u8()?,
        })
    }

    fn exposed_len(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{from_bytes, to_bytes};

    #[test]
    fn test_open_roundtrip() {
        let msg = OpenMsg {
            name: "traffic".to_string(),
            mode: OpenMode::Reader,
            size_limit: 256 << 20,
        };
        let back: OpenMsg = from_bytes(&to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_bad_mode_rejected() {
        let mut bytes = to_bytes(&OpenMsg {
            name: "x".to_string(),
            mode: OpenMode::Writer,
            size_limit: 0,
        })
        .unwrap();
        bytes[0] = 0;
        bytes[1] = 1;
        assert!(from_bytes::<OpenMsg>(&bytes).is_err());
    }

    #[test]
    fn test_map_roundtrip() {
        let msg = MapMsg {
            fd: 3,
            ofs: 1 << 33,
            sz: 4096,
        };
        let back: MapMsg = from_bytes(&to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }
}
