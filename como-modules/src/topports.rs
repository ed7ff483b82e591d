//! Top destination ports by byte count.
//!
//! Capture aggregates per (protocol, destination port); export keeps
//! accumulating across windows and every `meas-ivl` seconds stores the top
//! `topn` entries in descending byte order, discarding the rest.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use libcomo::error::ComoResult;
use libcomo::module::{
    ActionFlags, ArgMap, ModuleDef, PrintPhase, StatModule, UpdateStatus,
};
use libcomo::packet::{synth_packet, Packet};
use libcomo::serial::{Serializable, SizedRead, SizedWrite};
use libcomo::time::{ts_secs, Timestamp};
use std::io;

pub struct TopPorts;

#[derive(Debug, Clone, PartialEq)]
pub struct TopPortsConfig {
    pub topn: u32,
    /// Export gate in seconds of stream time.
    pub meas_ivl: u32,
}

impl Serializable for TopPortsConfig {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u32::<BigEndian>(self.topn)?;
        stream.write_u32::<BigEndian>(self.meas_ivl)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(TopPortsConfig {
            topn: stream.read_u32::<BigEndian>()?,
            meas_ivl: stream.read_u32::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        8
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortFlow {
    pub ts: Timestamp,
    pub proto: u8,
    pub port: u16,
    pub pkts: u32,
    pub bytes: u64,
}

impl Serializable for PortFlow {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u64::<BigEndian>(self.ts)?;
        stream.write_u8(self.proto)?;
        stream.write_u16::<BigEndian>(self.port)?;
        stream.write_u32::<BigEndian>(self.pkts)?;
        stream.write_u64::<BigEndian>(self.bytes)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(PortFlow {
            ts: stream.read_u64::<BigEndian>()?,
            proto: stream.read_u8()?,
            port: stream.read_u16::<BigEndian>()?,
            pkts: stream.read_u32::<BigEndian>()?,
            bytes: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        23
    }
}

/// Export state: when the table was last swept out.
#[derive(Default)]
pub struct ExportGate {
    pub last_export: u64,
}

impl StatModule for TopPorts {
    type Config = TopPortsConfig;
    type Tuple = PortFlow;
    type ETuple = PortFlow;
    type Record = PortFlow;
    type IvlState = ();
    type ExState = ExportGate;
    type PrintState = ();

    const KIND: &'static str = "topports";
    const FORMATS: &'static [&'static str] = &["plain", "html"];

    fn init(def: &ModuleDef) -> Option<TopPortsConfig> {
        let topn = def
            .args
            .get("topn")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        let meas_ivl = def
            .args
            .get("meas-ivl")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        if topn == 0 || meas_ivl == 0 {
            return None;
        }
        Some(TopPortsConfig { topn, meas_ivl })
    }

    fn check(_cfg: &TopPortsConfig, pkt: &Packet) -> bool {
        pkt.dst_port().is_some()
    }

    fn hash(_cfg: &TopPortsConfig, pkt: &Packet) -> u32 {
        let port = pkt.dst_port().unwrap_or(0) as u32;
        (port << 8) | pkt.l4_proto() as u32
    }

    fn matches(_cfg: &TopPortsConfig, pkt: &Packet, tuple: &PortFlow) -> bool {
        pkt.dst_port() == Some(tuple.port) && pkt.l4_proto() == tuple.proto
    }

    fn update(
        _cfg: &TopPortsConfig,
        _st: &mut (),
        pkt: &Packet,
        tuple: &mut PortFlow,
        is_new: bool,
    ) -> UpdateStatus {
        if is_new {
            tuple.ts = pkt.ts;
            tuple.proto = pkt.l4_proto();
            tuple.port = pkt.dst_port().unwrap_or(0);
        }
        tuple.pkts += 1;
        tuple.bytes += pkt.len as u64;
        UpdateStatus::Ok
    }

    fn ematch(_cfg: &TopPortsConfig, etuple: &PortFlow, tuple: &PortFlow) -> bool {
        etuple.port == tuple.port && etuple.proto == tuple.proto
    }

    fn export(
        _cfg: &TopPortsConfig,
        _st: &mut ExportGate,
        etuple: &mut PortFlow,
        tuple: &PortFlow,
        is_new: bool,
    ) {
        if is_new {
            etuple.ts = tuple.ts;
            etuple.proto = tuple.proto;
            etuple.port = tuple.port;
        }
        etuple.pkts += tuple.pkts;
        etuple.bytes += tuple.bytes;
    }

    fn compare(_cfg: &TopPortsConfig, a: &PortFlow, b: &PortFlow) -> std::cmp::Ordering {
        b.bytes.cmp(&a.bytes)
    }

    fn action(
        cfg: &TopPortsConfig,
        st: &mut ExportGate,
        etuple: Option<&PortFlow>,
        ivl_start: Timestamp,
        rank: usize,
    ) -> ActionFlags {
        if etuple.is_none() {
            let now = ts_secs(ivl_start);
            let ivl = now - now % cfg.meas_ivl as u64;
            if ivl - st.last_export < cfg.meas_ivl as u64 {
                return ActionFlags::STOP;
            }
            st.last_export = ivl;
            return ActionFlags::GO;
        }

        if rank < cfg.topn as usize {
            ActionFlags::STORE | ActionFlags::DISCARD
        } else {
            ActionFlags::DISCARD
        }
    }

    fn store(_cfg: &TopPortsConfig, etuple: &PortFlow) -> (Timestamp, PortFlow) {
        (etuple.ts, etuple.clone())
    }

    fn print<W: io::Write>(
        _cfg: &TopPortsConfig,
        _st: &mut (),
        phase: PrintPhase<PortFlow>,
        format: &str,
        _args: &ArgMap,
        out: &mut W,
    ) -> ComoResult<()> {
        match (format, phase) {
            ("html", PrintPhase::Begin) => {
                write!(
                    out,
                    "<table><tr><th>ts</th><th>proto</th><th>port</th><th>pkts</th><th>bytes</th></tr>\n"
                )?;
            }
            ("html", PrintPhase::Record(rec)) => {
                write!(
                    out,
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    ts_secs(rec.ts),
                    rec.proto,
                    rec.port,
                    rec.pkts,
                    rec.bytes
                )?;
            }
            ("html", PrintPhase::End) => {
                write!(out, "</table>\n")?;
            }
            (_, PrintPhase::Record(rec)) => {
                write!(
                    out,
                    "{} {} {} {} {}\n",
                    ts_secs(rec.ts),
                    rec.proto,
                    rec.port,
                    rec.pkts,
                    rec.bytes
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn replay(_cfg: &TopPortsConfig, rec: &PortFlow, out: &mut Vec<Packet>) {
        if rec.pkts == 0 {
            return;
        }
        let avg_len = (rec.bytes / rec.pkts as u64).max(1) as u32;
        for _ in 0..rec.pkts {
            out.push(synth_packet(rec.ts, avg_len, rec.proto, 0, 0, 0, rec.port));
        }
    }
}
