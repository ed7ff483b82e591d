//! Capture-side pipeline engine.
//!
//! One `CaptureEngine` per module: it classifies packets through the module
//! filter, aggregates them into a flow table keyed on the module's
//! fingerprint, and flushes the table when a packet crosses the window
//! boundary. Tuple memory is charged against the module's capture sub-arena
//! so a stalled export shows up as pool pressure, not as silent growth.

use crate::error::{ComoError, ComoResult};
use crate::filter::Filter;
use crate::mem::{Block, MapKind, Memmap, Pool};
use crate::module::abi::{CaptureRunner, StatModule, UpdateStatus};
use crate::module::ModuleDef;
use crate::packet::Packet;
use crate::serial::{read_str, str_len, write_str, Serializable, SizedRead, SizedWrite};
use crate::time::{ts_floor, Timestamp};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Buckets in a module flow table.
const TABLE_BUCKETS: usize = 2048;

/// One window's worth of tuples on its way to EXPORT.
pub struct FlushBatch {
    pub mdl: String,
    pub ivl_start: Timestamp,
    pub ntuples: u32,
    pub payload: FlushPayload,
}

pub enum FlushPayload {
    /// Cross-process copy of the serialized tuples.
    Serialized(Vec<u8>),
    /// Handle into the shared region holding the serialized tuples; the
    /// block stays allocated until EXPORT acknowledges it.
    Shm { block: Block, len: u32 },
}

/// `SER_TUPLES` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SerTuplesMsg {
    pub mdl: String,
    pub ivl_start: Timestamp,
    pub ntuples: u32,
    pub data: Vec<u8>,
}

impl Serializable for SerTuplesMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        write_str(stream, &self.mdl)?;
        stream.write_u64::<BigEndian>(self.ivl_start)?;
        stream.write_u32::<BigEndian>(self.ntuples)?;
        stream.write_u32::<BigEndian>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let mdl = read_str(stream)?;
        let ivl_start = stream.read_u64::<BigEndian>()?;
        let ntuples = stream.read_u32::<BigEndian>()?;
        let len = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < len {
            return Err(ComoError::Malformed("truncated tuple data"));
        }
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data)?;
        Ok(SerTuplesMsg {
            mdl,
            ivl_start,
            ntuples,
            data,
        })
    }

    fn exposed_len(&self) -> usize {
        str_len(&self.mdl) + 8 + 4 + 4 + self.data.len()
    }
}

/// `SHM_TUPLES` payload: the tuples live in the shared region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShmTuplesMsg {
    pub ivl_start: Timestamp,
    pub ntuples: u32,
    pub block_ofs: u64,
    pub block_class: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShmTuplesNamed {
    pub mdl: String,
    pub msg: ShmTuplesMsg,
}

impl Serializable for ShmTuplesNamed {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        write_str(stream, &self.mdl)?;
        stream.write_u64::<BigEndian>(self.msg.ivl_start)?;
        stream.write_u32::<BigEndian>(self.msg.ntuples)?;
        stream.write_u64::<BigEndian>(self.msg.block_ofs)?;
        stream.write_u32::<BigEndian>(self.msg.block_class)?;
        stream.write_u32::<BigEndian>(self.msg.len)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let mdl = read_str(stream)?;
        Ok(ShmTuplesNamed {
            mdl,
            msg: ShmTuplesMsg {
                ivl_start: stream.read_u64::<BigEndian>()?,
                ntuples: stream.read_u32::<BigEndian>()?,
                block_ofs: stream.read_u64::<BigEndian>()?,
                block_class: stream.read_u32::<BigEndian>()?,
                len: stream.read_u32::<BigEndian>()?,
            },
        })
    }

    fn exposed_len(&self) -> usize {
        str_len(&self.mdl) + 8 + 4 + 8 + 4 + 4
    }
}

/// `TUPLES_PROCESSED` payload: EXPORT is done with a shared block.
#[derive(Debug, Clone, PartialEq)]
pub struct TuplesProcessedMsg {
    pub mdl: String,
    pub block_ofs: u64,
}

impl Serializable for TuplesProcessedMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        write_str(stream, &self.mdl)?;
        stream.write_u64::<BigEndian>(self.block_ofs)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(TuplesProcessedMsg {
            mdl: read_str(stream)?,
            block_ofs: stream.read_u64::<BigEndian>()?,
        })
    }

    fn exposed_len(&self) -> usize {
        str_len(&self.mdl) + 8
    }
}

struct Slot<T> {
    fp: u32,
    next: Option<u32>,
    tuple: T,
}

/// Bounded open hash table from fingerprint to tuple. Collisions chain
/// through slot indices; all slot memory belongs to the current window and
/// is dropped wholesale at flush.
pub struct FlowTable<T> {
    buckets: Vec<Option<u32>>,
    slots: Vec<Slot<T>>,
}

impl<T> FlowTable<T> {
    pub fn new(nbuckets: usize) -> FlowTable<T> {
        FlowTable {
            buckets: vec![None; nbuckets],
            slots: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Walks the chain for `fp`, returning the slot whose tuple matches.
    pub fn find<F: Fn(&T) -> bool>(&self, fp: u32, matches: F) -> Option<u32> {
        let bucket = (fp as usize) % self.buckets.len();
        let mut cursor = self.buckets[bucket];

        while let Some(idx) = cursor {
            let slot = &self.slots[idx as usize];
            if slot.fp == fp && matches(&slot.tuple) {
                return Some(idx);
            }
            cursor = slot.next;
        }
        None
    }

    /// Inserts a tuple at the head of its chain.
    pub fn insert(&mut self, fp: u32, tuple: T) -> u32 {
        let bucket = (fp as usize) % self.buckets.len();
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            fp,
            next: self.buckets[bucket],
            tuple,
        });
        self.buckets[bucket] = Some(idx);
        idx
    }

    #[inline]
    pub fn tuple_mut(&mut self, idx: u32) -> &mut T {
        &mut self.slots[idx as usize].tuple
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|slot| &slot.tuple)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        for bucket in &mut self.buckets {
            *bucket = None;
        }
    }
}

/// Per-module capture runtime.
pub struct CaptureEngine<M: StatModule> {
    def: ModuleDef,
    cfg: M::Config,
    filter: Filter,
    table: FlowTable<M::Tuple>,
    window: Option<(Timestamp, Timestamp)>,
    scratch: M::IvlState,
    /// Capture sub-arena; released at every flush.
    map: Memmap,
    /// Use the shared-memory flush path, as negotiated at attach.
    shm: bool,
    /// Shared blocks shipped to EXPORT and not yet acknowledged.
    outstanding: Vec<Block>,
}

impl<M: StatModule> CaptureEngine<M> {
    pub fn new(def: ModuleDef, cfg: M::Config, shm: bool) -> ComoResult<CaptureEngine<M>> {
        let filter = Filter::parse(&def.filter)?;
        Ok(CaptureEngine {
            def,
            cfg,
            filter,
            table: FlowTable::new(TABLE_BUCKETS),
            window: None,
            scratch: Default::default(),
            map: Memmap::new(MapKind::Capture),
            shm,
            outstanding: Vec::new(),
        })
    }

    fn flush_window(&mut self, pool: &mut Pool) -> ComoResult<Option<FlushBatch>> {
        let (start, _) = match self.window.take() {
            Some(window) => window,
            None => return Ok(None),
        };

        if self.table.is_empty() {
            self.map.release(pool)?;
            return Ok(None);
        }

        let ntuples = self.table.len() as u32;
        let total: usize = self.table.iter().map(|t| t.exposed_len()).sum();

        let mut data = vec![0u8; total];
        {
            let mut cursor = Cursor::new(&mut data[..]);
            for tuple in self.table.iter() {
                tuple.serialize(&mut cursor)?;
            }
        }

        // The shared path parks the serialized window in a pool block that
        // survives the arena release; it is freed on the EXPORT ack. When
        // the pool cannot take another block the copy path is the pressure
        // valve.
        let payload = if self.shm {
            match pool.alloc(total) {
                Ok(block) => {
                    pool.payload_mut(block)?[..total].copy_from_slice(&data);
                    self.outstanding.push(block);
                    FlushPayload::Shm {
                        block,
                        len: total as u32,
                    }
                }
                Err(ComoError::Overload) => FlushPayload::Serialized(data),
                Err(err) => return Err(err),
            }
        } else {
            FlushPayload::Serialized(data)
        };

        self.table.clear();
        self.map.release(pool)?;

        Ok(Some(FlushBatch {
            mdl: self.def.name.clone(),
            ivl_start: start,
            ntuples,
            payload,
        }))
    }
}

impl<M: StatModule> CaptureRunner for CaptureEngine<M> {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn def(&self) -> &ModuleDef {
        &self.def
    }

    fn process(&mut self, pkt: &Packet, pool: &mut Pool) -> ComoResult<Option<FlushBatch>> {
        if !self.filter.matches(pkt) || !M::check(&self.cfg, pkt) {
            return Ok(None);
        }

        // The window advances only when a packet at or past the boundary
        // arrives; the previous window flushes first.
        let mut batch = None;
        if let Some((_, end)) = self.window {
            if pkt.ts >= end {
                batch = self.flush_window(pool)?;
            }
        }

        if self.window.is_none() {
            let start = ts_floor(pkt.ts, self.def.flush_ivl);
            self.window = Some((start, start + self.def.flush_ivl));
            self.scratch = M::flush(&self.cfg, start);
        }

        let fp = M::hash(&self.cfg, pkt);
        let found = {
            let cfg = &self.cfg;
            self.table.find(fp, |tuple| M::matches(cfg, pkt, tuple))
        };

        let status = match found {
            Some(idx) => M::update(
                &self.cfg,
                &mut self.scratch,
                pkt,
                self.table.tuple_mut(idx),
                false,
            ),
            None => {
                // Charge the arena before the tuple exists; failure to
                // charge is the overload signal the scheduler watches.
                self.map.alloc(pool, std::mem::size_of::<M::Tuple>())?;
                let idx = self.table.insert(fp, M::Tuple::default());
                M::update(
                    &self.cfg,
                    &mut self.scratch,
                    pkt,
                    self.table.tuple_mut(idx),
                    true,
                )
            }
        };

        if status == UpdateStatus::Full && batch.is_none() {
            batch = self.flush_window(pool)?;
        }

        Ok(batch)
    }

    fn flush_now(&mut self, pool: &mut Pool) -> ComoResult<Option<FlushBatch>> {
        self.flush_window(pool)
    }

    fn ack_shm(&mut self, block_ofs: u64, pool: &mut Pool) -> ComoResult<()> {
        let pos = self
            .outstanding
            .iter()
            .position(|b| b.ofs == block_ofs)
            .ok_or(ComoError::Malformed("ack for unknown block"))?;

        let block = self.outstanding.swap_remove(pos);
        pool.free(block)
    }

    fn mem_usage(&self) -> u64 {
        let pending: u64 = self.outstanding.iter().map(|b| b.size()).sum();
        self.map.usage() + pending
    }

    fn destroy(&mut self, pool: &mut Pool) -> ComoResult<()> {
        self.window = None;
        self.table.clear();
        self.map.release(pool)?;
        for block in self.outstanding.drain(..) {
            pool.free(block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logging;
    use crate::mem::Region;
    use crate::module::abi::{ActionFlags, PrintPhase};
    use crate::module::ArgMap;
    use crate::packet::synth_packet;
    use crate::serial::from_bytes;
    use crate::time::{ts_from_parts, ts_from_secs};
    use std::io;

    /// Minimal per-destination-port packet counter used by the pipeline
    /// tests.
    pub struct PortCount;

    #[derive(Clone, Debug, PartialEq)]
    pub struct PortCountConfig;

    #[derive(Default, Debug, Clone, PartialEq)]
    pub struct PortTuple {
        pub port: u16,
        pub pkts: u32,
        pub bytes: u64,
    }

    impl Serializable for PortCountConfig {
        fn serialize<W: SizedWrite>(&self, _stream: &mut W) -> ComoResult<()> {
            Ok(())
        }
        fn deserialize<R: SizedRead>(_stream: &mut R) -> ComoResult<Self> {
            Ok(PortCountConfig)
        }
        fn exposed_len(&self) -> usize {
            0
        }
    }

    impl Serializable for PortTuple {
        fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
            stream.write_u16::<BigEndian>(self.port)?;
            stream.write_u32::<BigEndian>(self.pkts)?;
            stream.write_u64::<BigEndian>(self.bytes)?;
            Ok(())
        }
        fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
            Ok(PortTuple {
                port: stream.read_u16::<BigEndian>()?,
                pkts: stream.read_u32::<BigEndian>()?,
                bytes: stream.read_u64::<BigEndian>()?,
            })
        }
        fn exposed_len(&self) -> usize {
            14
        }
    }

    impl StatModule for PortCount {
        type Config = PortCountConfig;
        type Tuple = PortTuple;
        type ETuple = PortTuple;
        type Record = PortTuple;
        type IvlState = ();
        type ExState = ();
        type PrintState = ();

        const KIND: &'static str = "portcount";

        fn init(_def: &ModuleDef) -> Option<PortCountConfig> {
            Some(PortCountConfig)
        }

        fn hash(_cfg: &PortCountConfig, pkt: &Packet) -> u32 {
            pkt.dst_port().unwrap_or(0) as u32
        }

        fn matches(_cfg: &PortCountConfig, pkt: &Packet, tuple: &PortTuple) -> bool {
            pkt.dst_port().unwrap_or(0) == tuple.port
        }

        fn update(
            _cfg: &PortCountConfig,
            _st: &mut (),
            pkt: &Packet,
            tuple: &mut PortTuple,
            is_new: bool,
        ) -> UpdateStatus {
            if is_new {
                tuple.port = pkt.dst_port().unwrap_or(0);
            }
            tuple.pkts += 1;
            tuple.bytes += pkt.len as u64;
            UpdateStatus::Ok
        }

        fn export(
            _cfg: &PortCountConfig,
            _st: &mut (),
            etuple: &mut PortTuple,
            tuple: &PortTuple,
            is_new: bool,
        ) {
            if is_new {
                etuple.port = tuple.port;
            }
            etuple.pkts += tuple.pkts;
            etuple.bytes += tuple.bytes;
        }

        fn ematch(_cfg: &PortCountConfig, etuple: &PortTuple, tuple: &PortTuple) -> bool {
            etuple.port == tuple.port
        }

        fn compare(_cfg: &PortCountConfig, a: &PortTuple, b: &PortTuple) -> std::cmp::Ordering {
            b.bytes.cmp(&a.bytes)
        }

        fn action(
            _cfg: &PortCountConfig,
            _st: &mut (),
            _etuple: Option<&PortTuple>,
            _ivl: Timestamp,
            _rank: usize,
        ) -> ActionFlags {
            ActionFlags::STORE | ActionFlags::DISCARD | ActionFlags::GO
        }

        fn store(_cfg: &PortCountConfig, etuple: &PortTuple) -> (Timestamp, PortTuple) {
            (0, etuple.clone())
        }

        fn print<W: io::Write>(
            _cfg: &PortCountConfig,
            _st: &mut (),
            phase: PrintPhase<PortTuple>,
            _format: &str,
            _args: &ArgMap,
            out: &mut W,
        ) -> ComoResult<()> {
            if let PrintPhase::Record(rec) = phase {
                writeln!(out, "{} {} {}", rec.port, rec.pkts, rec.bytes)?;
            }
            Ok(())
        }
    }

    pub fn make_pool() -> Pool {
        Pool::new(Region::anonymous(1 << 20).unwrap(), &logging::discard()).unwrap()
    }

    fn engine(shm: bool) -> CaptureEngine<PortCount> {
        let mut def = ModuleDef::new("ports", "portcount");
        def.flush_ivl = ts_from_secs(1);
        CaptureEngine::new(def, PortCountConfig, shm).unwrap()
    }

    fn pkt_at(secs: u64, nanos: u32, port: u16) -> Packet {
        synth_packet(ts_from_parts(secs, nanos), 100, 17, 1, 2, 9999, port)
    }

    #[test]
    fn test_window_rollover_single_flush() {
        let mut pool = make_pool();
        let mut engine = engine(false);

        // ts 0.1 .. 0.9: all inside the first window.
        for decisecond in 1..=9u32 {
            let pkt = pkt_at(0, decisecond * 100_000_000, 53);
            assert!(engine.process(&pkt, &mut pool).unwrap().is_none());
        }

        // ts 1.0 crosses the boundary: exactly one flush covering [0, 1).
        let batch = engine
            .process(&pkt_at(1, 0, 53), &mut pool)
            .unwrap()
            .expect("flush at boundary");
        assert_eq!(batch.ivl_start, 0);
        assert_eq!(batch.ntuples, 1);

        let data = match batch.payload {
            FlushPayload::Serialized(data) => data,
            _ => panic!("expected copy path"),
        };
        let tuple: PortTuple = from_bytes(&data).unwrap();
        assert_eq!(tuple.pkts, 9);
        assert_eq!(tuple.bytes, 900);

        // ts 1.1 stays in the second window: no further flush.
        assert!(engine
            .process(&pkt_at(1, 100_000_000, 53), &mut pool)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tuples_equal_equivalence_classes() {
        let mut pool = make_pool();
        let mut engine = engine(false);

        // Three ports, interleaved arrivals: three equivalence classes.
        for port in [80u16, 53, 80, 443, 53, 80].iter() {
            engine
                .process(&pkt_at(0, 500_000_000, *port), &mut pool)
                .unwrap();
        }

        let batch = engine.flush_now(&mut pool).unwrap().unwrap();
        assert_eq!(batch.ntuples, 3);
    }

    #[test]
    fn test_arena_released_at_flush() {
        let mut pool = make_pool();
        let mut engine = engine(false);
        let baseline = pool.usage();

        for port in 0..32u16 {
            engine.process(&pkt_at(0, 1000, 1000 + port), &mut pool).unwrap();
        }
        assert!(pool.usage() > baseline);
        assert!(engine.mem_usage() > 0);

        engine.flush_now(&mut pool).unwrap().unwrap();
        assert_eq!(pool.usage(), baseline);
        assert_eq!(engine.mem_usage(), 0);
    }

    #[test]
    fn test_shm_path_block_freed_on_ack() {
        let mut pool = make_pool();
        let mut engine = engine(true);
        let baseline = pool.usage();

        engine.process(&pkt_at(0, 1000, 80), &mut pool).unwrap();
        let batch = engine.flush_now(&mut pool).unwrap().unwrap();

        let block = match batch.payload {
            FlushPayload::Shm { block, len } => {
                // The serialized window is readable straight from the pool.
                let bytes = pool.payload(block).unwrap()[..len as usize].to_vec();
                let tuple: PortTuple = from_bytes(&bytes).unwrap();
                assert_eq!(tuple.port, 80);
                block
            }
            _ => panic!("expected shm path"),
        };

        // Block stays charged until the ack arrives.
        assert!(pool.usage() > baseline);
        engine.ack_shm(block.ofs, &mut pool).unwrap();
        assert_eq!(pool.usage(), baseline);

        assert_eq!(
            engine.ack_shm(block.ofs, &mut pool).unwrap_err(),
            ComoError::Malformed("ack for unknown block")
        );
    }

    #[test]
    fn test_filter_gates_packets() {
        let mut pool = make_pool();
        let mut def = ModuleDef::new("ports", "portcount");
        def.flush_ivl = ts_from_secs(1);
        def.filter = "dst port 80".to_string();
        let mut engine = CaptureEngine::<PortCount>::new(def, PortCountConfig, false).unwrap();

        engine.process(&pkt_at(0, 1000, 80), &mut pool).unwrap();
        engine.process(&pkt_at(0, 2000, 53), &mut pool).unwrap();

        let batch = engine.flush_now(&mut pool).unwrap().unwrap();
        assert_eq!(batch.ntuples, 1);
    }

    #[test]
    fn test_empty_window_not_flushed() {
        let mut pool = make_pool();
        let mut engine = engine(false);
        assert!(engine.flush_now(&mut pool).unwrap().is_none());
    }

    #[test]
    fn test_ser_msgs_roundtrip() {
        let msg = SerTuplesMsg {
            mdl: "ports".to_string(),
            ivl_start: ts_from_secs(7),
            ntuples: 3,
            data: vec![1, 2, 3],
        };
        let back: SerTuplesMsg = from_bytes(&crate::serial::to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);

        let named = ShmTuplesNamed {
            mdl: "ports".to_string(),
            msg: ShmTuplesMsg {
                ivl_start: ts_from_secs(7),
                ntuples: 3,
                block_ofs: 4096,
                block_class: 12,
                len: 42,
            },
        };
        let back: ShmTuplesNamed = from_bytes(&crate::serial::to_bytes(&named).unwrap()).unwrap();
        assert_eq!(back, named);
    }
}
