//! Per-window traffic counter: packets and bytes seen in each window,
//! regardless of flow. Records replay as a train of average-length
//! synthetic packets, which is enough to drive any volume-based module.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use libcomo::error::ComoResult;
use libcomo::module::{
    ActionFlags, ArgMap, ModuleDef, PrintPhase, StatModule, UpdateStatus,
};
use libcomo::packet::{synth_packet, Packet};
use libcomo::serial::{Serializable, SizedRead, SizedWrite};
use libcomo::time::{ts_floor, ts_secs, Timestamp};
use std::io;

pub struct Traffic;

#[derive(Debug, Clone, PartialEq)]
pub struct TrafficConfig {
    /// Window length, copied from the definition so `update` can stamp
    /// tuples with their window start.
    pub flush_ivl: Timestamp,
}

impl Serializable for TrafficConfig {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u64::<BigEndian>(self.flush_ivl)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(TrafficConfig {
            flush_ivl: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        8
    }
}

/// One aggregation cell; the whole window is a single equivalence class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficCell {
    pub ts: Timestamp,
    pub pkts: u64,
    pub bytes: u64,
}

impl Serializable for TrafficCell {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u64::<BigEndian>(self.ts)?;
        stream.write_u64::<BigEndian>(self.pkts)?;
        stream.write_u64::<BigEndian>(self.bytes)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(TrafficCell {
            ts: stream.read_u64::<BigEndian>()?,
            pkts: stream.read_u64::<BigEndian>()?,
            bytes: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        24
    }
}

impl StatModule for Traffic {
    type Config = TrafficConfig;
    type Tuple = TrafficCell;
    type ETuple = TrafficCell;
    type Record = TrafficCell;
    type IvlState = ();
    type ExState = ();
    type PrintState = ();

    const KIND: &'static str = "traffic";
    const FORMATS: &'static [&'static str] = &["plain", "html"];

    fn init(def: &ModuleDef) -> Option<TrafficConfig> {
        Some(TrafficConfig {
            flush_ivl: def.flush_ivl,
        })
    }

    fn hash(_cfg: &TrafficConfig, _pkt: &Packet) -> u32 {
        0
    }

    fn matches(_cfg: &TrafficConfig, _pkt: &Packet, _tuple: &TrafficCell) -> bool {
        true
    }

    fn update(
        cfg: &TrafficConfig,
        _st: &mut (),
        pkt: &Packet,
        tuple: &mut TrafficCell,
        is_new: bool,
    ) -> UpdateStatus {
        if is_new {
            tuple.ts = ts_floor(pkt.ts, cfg.flush_ivl);
        }
        tuple.pkts += 1;
        tuple.bytes += pkt.len as u64;
        UpdateStatus::Ok
    }

    fn ematch(_cfg: &TrafficConfig, etuple: &TrafficCell, tuple: &TrafficCell) -> bool {
        etuple.ts == tuple.ts
    }

    fn export(
        _cfg: &TrafficConfig,
        _st: &mut (),
        etuple: &mut TrafficCell,
        tuple: &TrafficCell,
        is_new: bool,
    ) {
        if is_new {
            etuple.ts = tuple.ts;
        }
        etuple.pkts += tuple.pkts;
        etuple.bytes += tuple.bytes;
    }

    fn action(
        _cfg: &TrafficConfig,
        _st: &mut (),
        etuple: Option<&TrafficCell>,
        _ivl_start: Timestamp,
        _rank: usize,
    ) -> ActionFlags {
        match etuple {
            None => ActionFlags::GO,
            Some(_) => ActionFlags::STORE | ActionFlags::DISCARD,
        }
    }

    fn store(_cfg: &TrafficConfig, etuple: &TrafficCell) -> (Timestamp, TrafficCell) {
        (etuple.ts, etuple.clone())
    }

    fn print<W: io::Write>(
        _cfg: &TrafficConfig,
        _st: &mut (),
        phase: PrintPhase<TrafficCell>,
        format: &str,
        _args: &ArgMap,
        out: &mut W,
    ) -> ComoResult<()> {
        match (format, phase) {
            ("html", PrintPhase::Begin) => {
                write!(out, "<table><tr><th>ts</th><th>pkts</th><th>bytes</th></tr>\n")?;
            }
            ("html", PrintPhase::Record(rec)) => {
                write!(
                    out,
                    "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    ts_secs(rec.ts),
                    rec.pkts,
                    rec.bytes
                )?;
            }
            ("html", PrintPhase::End) => {
                write!(out, "</table>\n")?;
            }
            (_, PrintPhase::Record(rec)) => {
                write!(out, "{} {} {}\n", ts_secs(rec.ts), rec.pkts, rec.bytes)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn replay(_cfg: &TrafficConfig, rec: &TrafficCell, out: &mut Vec<Packet>) {
        if rec.pkts == 0 {
            return;
        }
        // One synthetic packet per counted packet, each carrying the
        // average length; the byte total survives up to rounding.
        let avg_len = (rec.bytes / rec.pkts).max(1) as u32;
        for _ in 0..rec.pkts {
            out.push(synth_packet(rec.ts, avg_len, 17, 0, 0, 0, 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcomo::serial::{from_bytes, to_bytes};
    use libcomo::time::ts_from_secs;

    #[test]
    fn test_cell_roundtrip() {
        let cell = TrafficCell {
            ts: ts_from_secs(100),
            pkts: 42,
            bytes: 68_000,
        };
        let back: TrafficCell = from_bytes(&to_bytes(&cell).unwrap()).unwrap();
        assert_eq!(back, cell);
    }

    #[test]
    fn test_replay_preserves_volume() {
        let cfg = TrafficConfig {
            flush_ivl: ts_from_secs(1),
        };
        let rec = TrafficCell {
            ts: ts_from_secs(9),
            pkts: 10,
            bytes: 1500,
        };

        let mut pkts = Vec::new();
        Traffic::replay(&cfg, &rec, &mut pkts);

        assert_eq!(pkts.len(), 10);
        let total: u64 = pkts.iter().map(|p| p.len as u64).sum();
        assert_eq!(total, 1500);
        assert!(pkts.iter().all(|p| p.ts == rec.ts));
    }

    #[test]
    fn test_update_stamps_window() {
        let cfg = TrafficConfig {
            flush_ivl: ts_from_secs(1),
        };
        let pkt = synth_packet(ts_from_secs(5) + 1234, 60, 17, 1, 2, 3, 4);

        let mut tuple = TrafficCell::default();
        Traffic::update(&cfg, &mut (), &pkt, &mut tuple, true);

        assert_eq!(tuple.ts, ts_from_secs(5));
        assert_eq!(tuple.pkts, 1);
        assert_eq!(tuple.bytes, 60);
    }
}
