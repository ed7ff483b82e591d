//! Message frame codec.
//!
//! Wire layout, all integers big-endian:
//! `{ type: u16, class: u8, parent_class: u8, id: u16, code: [4]u8,
//!    name: [12]u8, len: u32, data: [len]u8 }`.
//!
//! The first message on every connection is a type-0 `Connect` whose fixed
//! payload length doubles as the byte-order probe: a peer that encoded the
//! length in the opposite order produces a value that cannot be the real
//! length, and the decoder latches byte-swapping for that peer.

use crate::error::{ComoError, ComoResult};
use crate::ipc::peer::{PeerId, CODE_LEN, NAME_LEN};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Message types understood by the fixed process set.
pub mod msg {
    /// Connection handshake; always type 0 so it parses in any byte order.
    pub const CONNECT: u16 = 0;
    /// Child process finished startup.
    pub const SYNC: u16 = 1;
    /// Orderly shutdown request.
    pub const EXIT: u16 = 2;
    /// Supervisor asks capture to pause between batches.
    pub const FREEZE: u16 = 3;
    /// Supervisor releases a frozen capture.
    pub const RESUME: u16 = 4;
    /// Acknowledgement for FREEZE and other round-trips.
    pub const ACK: u16 = 5;

    /// Serialized module definition + config shipped to a process.
    pub const MODULE_ADD: u16 = 16;
    /// Module removal by name.
    pub const MODULE_DEL: u16 = 17;
    /// Start processing for a previously added module.
    pub const MODULE_START: u16 = 18;
    /// Enabled/disabled status broadcast from the resource scheduler.
    pub const MODULE_STATUS: u16 = 19;
    /// Periodic per-module resource usage report to the supervisor.
    pub const STATS: u16 = 20;

    /// Flushed window as serialized tuples (copy path).
    pub const SER_TUPLES: u16 = 32;
    /// Flushed window as a shared-memory handle (negotiated fast path).
    pub const SHM_TUPLES: u16 = 33;
    /// Export acknowledges a SHM_TUPLES batch; capture may reuse the block.
    pub const TUPLES_PROCESSED: u16 = 34;
    /// Capture saw all sniffers drain; export flushes residual tables.
    pub const SNIFFERS_DONE: u16 = 35;

    /// Storage protocol: client requests and server replies.
    pub const CS_OPEN: u16 = 48;
    pub const CS_OPEN_REPLY: u16 = 49;
    pub const CS_MAP: u16 = 50;
    pub const CS_MAP_REPLY: u16 = 51;
    pub const CS_SEEK: u16 = 52;
    pub const CS_SEEK_REPLY: u16 = 53;
    pub const CS_COMMIT: u16 = 54;
    pub const CS_CLOSE: u16 = 55;
    pub const CS_ERROR: u16 = 56;
}

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 2 + CODE_LEN + NAME_LEN + 4;

/// Payload size of a CONNECT message: code + name.
pub const CONNECT_SIZE: usize = CODE_LEN + NAME_LEN;

/// Refuse frames larger than this; no legitimate message comes close.
pub const MAX_FRAME_DATA: usize = 1 << 30;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub mtype: u16,
    pub sender: PeerId,
    pub len: u32,
}

impl FrameHeader {
    /// Encodes the header into `out`, which must hold `HEADER_SIZE` bytes.
    pub fn write(&self, out: &mut [u8]) -> ComoResult<()> {
        let mut stream = Cursor::new(out);
        stream.write_u16::<BigEndian>(self.mtype)?;
        stream.write_u8(self.sender.class)?;
        stream.write_u8(self.sender.parent_class)?;
        stream.write_u16::<BigEndian>(self.sender.id)?;
        stream.write_all(&self.sender.code)?;
        stream.write_all(&self.sender.name)?;
        stream.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }

    /// Decodes a header from `buf`. `swap` indicates the sending peer uses
    /// the opposite byte order, as latched at CONNECT time.
    pub fn read(buf: &[u8], swap: bool) -> ComoResult<FrameHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(ComoError::Again);
        }

        let mut stream = Cursor::new(buf);
        let mtype = swap16(stream.read_u16::<BigEndian>()?, swap);
        let class = stream.read_u8()?;
        let parent_class = stream.read_u8()?;
        let id = swap16(stream.read_u16::<BigEndian>()?, swap);

        let mut code = [0u8; CODE_LEN];
        stream.read_exact(&mut code)?;
        let mut name = [0u8; NAME_LEN];
        stream.read_exact(&mut name)?;

        let len = swap32(stream.read_u32::<BigEndian>()?, swap);

        if len as usize > MAX_FRAME_DATA {
            return Err(ComoError::Malformed("oversized frame"));
        }

        Ok(FrameHeader {
            mtype,
            sender: PeerId {
                class,
                parent_class,
                id,
                code,
                name,
            },
            len,
        })
    }
}

/// Message type field of a raw header, read big-endian. Type 0 (CONNECT)
/// reads the same in either byte order.
#[inline]
pub fn raw_type(buf: &[u8]) -> u16 {
    ((buf[0] as u16) << 8) | buf[1] as u16
}

/// Length field of a raw header, read big-endian without validation.
#[inline]
pub fn raw_len(buf: &[u8]) -> u32 {
    let ofs = HEADER_SIZE - 4;
    ((buf[ofs] as u32) << 24)
        | ((buf[ofs + 1] as u32) << 16)
        | ((buf[ofs + 2] as u32) << 8)
        | buf[ofs + 3] as u32
}

/// Builds a complete CONNECT frame announcing `me`.
pub fn connect_frame(me: &PeerId) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE + CONNECT_SIZE];
    let header = FrameHeader {
        mtype: msg::CONNECT,
        sender: *me,
        len: CONNECT_SIZE as u32,
    };
    header.write(&mut frame[..HEADER_SIZE]).expect("connect header");
    frame[HEADER_SIZE..HEADER_SIZE + CODE_LEN].copy_from_slice(&me.code);
    frame[HEADER_SIZE + CODE_LEN..].copy_from_slice(&me.name);
    frame
}

/// Inspects the length field of a CONNECT header to detect a byte-swapped
/// peer. Returns the swap flag, or an error when the length matches neither
/// byte order.
pub fn probe_connect_order(raw_len: u32) -> ComoResult<bool> {
    if raw_len as usize == CONNECT_SIZE {
        return Ok(false);
    }
    if raw_len.swap_bytes() as usize == CONNECT_SIZE {
        return Ok(true);
    }
    Err(ComoError::Malformed("invalid connect message"))
}

#[inline]
fn swap16(val: u16, swap: bool) -> u16 {
    if swap {
        val.swap_bytes()
    } else {
        val
    }
}

#[inline]
fn swap32(val: u32, swap: bool) -> u32 {
    if swap {
        val.swap_bytes()
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::peer::class;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            mtype: msg::MODULE_ADD,
            sender: PeerId::supervisor(),
            len: 123,
        };

        let mut buf = [0u8; HEADER_SIZE];
        header.write(&mut buf).unwrap();

        let back = FrameHeader::read(&buf, false).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_short_header_is_again() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert_eq!(FrameHeader::read(&buf, false).unwrap_err(), ComoError::Again);
    }

    #[test]
    fn test_swapped_header() {
        let header = FrameHeader {
            mtype: msg::SER_TUPLES,
            sender: PeerId::capture(),
            len: 0x0000_0200,
        };

        let mut buf = [0u8; HEADER_SIZE];
        header.write(&mut buf).unwrap();

        // Simulate a little-endian sender by swapping the integer fields.
        buf[0..2].reverse();
        buf[4..6].reverse();
        buf[HEADER_SIZE - 4..].reverse();

        let back = FrameHeader::read(&buf, true).unwrap();
        assert_eq!(back.mtype, msg::SER_TUPLES);
        assert_eq!(back.len, 0x0000_0200);
        assert_eq!(back.sender.class, class::CAPTURE);
    }

    #[test]
    fn test_connect_probe() {
        assert_eq!(probe_connect_order(CONNECT_SIZE as u32).unwrap(), false);
        assert_eq!(
            probe_connect_order((CONNECT_SIZE as u32).swap_bytes()).unwrap(),
            true
        );
        assert!(probe_connect_order(7).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = FrameHeader {
            mtype: msg::SER_TUPLES,
            sender: PeerId::capture(),
            len: (MAX_FRAME_DATA as u32) + 1,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.write(&mut buf).unwrap();

        assert_eq!(
            FrameHeader::read(&buf, false).unwrap_err(),
            ComoError::Malformed("oversized frame")
        );
    }

    #[test]
    fn test_connect_frame_layout() {
        let me = PeerId::export();
        let frame = connect_frame(&me);

        assert_eq!(frame.len(), HEADER_SIZE + CONNECT_SIZE);

        let header = FrameHeader::read(&frame, false).unwrap();
        assert_eq!(header.mtype, msg::CONNECT);
        assert_eq!(header.len as usize, CONNECT_SIZE);
        assert_eq!(&frame[HEADER_SIZE..HEADER_SIZE + CODE_LEN], &me.code);
    }
}
