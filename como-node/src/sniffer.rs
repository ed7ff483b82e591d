//! Sniffer interface and the bundled trace sniffer.
//!
//! Real drivers (libpcap, BPF, hardware rings) are collaborators behind
//! this trait. The trace sniffer replays a packet log from disk and is what
//! inline mode and the end-to-end tests feed on.

use byteorder::{BigEndian, ReadBytesExt};
use libcomo::error::{ComoError, ComoResult};
use libcomo::packet::{synth_packet, Packet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub trait Sniffer {
    fn start(&mut self) -> ComoResult<()>;

    /// Fills `out` with up to `max` packets. Returning 0 means the source
    /// drained; live sources block in their driver instead.
    fn next(&mut self, out: &mut Vec<Packet>, max: usize) -> ComoResult<usize>;

    fn stop(&mut self);
}

/// Builds the sniffer described by `-s kind,device[,args]`.
pub fn make_sniffer(spec: &str) -> ComoResult<Box<dyn Sniffer>> {
    let mut parts = spec.splitn(3, ',');
    let kind = parts.next().unwrap_or("");
    let device = parts.next().unwrap_or("");

    match kind {
        "trace" => Ok(Box::new(TraceSniffer::open(device)?)),
        _ => Err(ComoError::Malformed("unknown sniffer")),
    }
}

/// Trace record on disk, big-endian, 25 bytes:
/// `{ ts: u64, len: u32, proto: u8, src: u32, dst: u32, sport: u16,
///    dport: u16 }`, enough to rebuild the headers the modules care about.
const TRACE_RECORD: usize = 25;

pub struct TraceSniffer {
    reader: Option<BufReader<File>>,
    path: String,
}

impl TraceSniffer {
    pub fn open(path: &str) -> ComoResult<TraceSniffer> {
        if !Path::new(path).exists() {
            return Err(ComoError::Io(std::io::ErrorKind::NotFound));
        }
        Ok(TraceSniffer {
            reader: None,
            path: path.to_string(),
        })
    }
}

impl Sniffer for TraceSniffer {
    fn start(&mut self) -> ComoResult<()> {
        let file = File::open(&self.path)?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn next(&mut self, out: &mut Vec<Packet>, max: usize) -> ComoResult<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(ComoError::Malformed("sniffer not started"))?;

        let mut count = 0;
        let mut buf = [0u8; TRACE_RECORD];

        while count < max {
            match reader.read_exact(&mut buf) {
                Ok(()) => {}
                Err(ref err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }

            let mut cursor = &buf[..];
            let ts = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            let proto = cursor.read_u8()?;
            let src = cursor.read_u32::<BigEndian>()?;
            let dst = cursor.read_u32::<BigEndian>()?;
            let sport = cursor.read_u16::<BigEndian>()?;
            let dport = cursor.read_u16::<BigEndian>()?;

            out.push(synth_packet(ts, len, proto, src, dst, sport, dport));
            count += 1;
        }

        Ok(count)
    }

    fn stop(&mut self) {
        self.reader = None;
    }
}

/// Writes a trace file for tests and demos.
pub mod trace_writer {
    use byteorder::{BigEndian, WriteBytesExt};
    use libcomo::error::ComoResult;
    use libcomo::packet::Packet;
    use std::io::Write;

    pub fn write_packet<W: Write>(out: &mut W, pkt: &Packet) -> ComoResult<()> {
        out.write_u64::<BigEndian>(pkt.ts)?;
        out.write_u32::<BigEndian>(pkt.len)?;
        out.write_u8(pkt.l4_proto())?;
        out.write_u32::<BigEndian>(pkt.ip_src().unwrap_or(0))?;
        out.write_u32::<BigEndian>(pkt.ip_dst().unwrap_or(0))?;
        out.write_u16::<BigEndian>(pkt.src_port().unwrap_or(0))?;
        out.write_u16::<BigEndian>(pkt.dst_port().unwrap_or(0))?;
        Ok(())
    }
}
