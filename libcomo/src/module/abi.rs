//! The module ABI.
//!
//! A statistics module implements `StatModule` over concrete config, tuple,
//! e-tuple and record types; the framework talks to it through the erased
//! per-role runner traits. Erasure happens once, in `handle_of`, where the
//! monomorphized engines are boxed behind the role traits.

use crate::capture::CaptureEngine;
use crate::error::ComoResult;
use crate::export::ExportEngine;
use crate::module::{ArgMap, ModuleDef};
use crate::packet::Packet;
use crate::serial::{from_bytes, to_bytes, Serializable};
use crate::time::Timestamp;
use std::cmp::Ordering;
use std::io;
use std::ops::BitOr;

/// Result of `update`: `Full` forces a flush of the current window.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpdateStatus {
    Ok,
    Full,
}

/// Flags returned by `action`, OR-combinable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ActionFlags(u8);

impl ActionFlags {
    /// Serialize this e-tuple as a record.
    pub const STORE: ActionFlags = ActionFlags(1);
    /// Drop the e-tuple from the table after this sweep.
    pub const DISCARD: ActionFlags = ActionFlags(2);
    /// End the sweep here.
    pub const STOP: ActionFlags = ActionFlags(4);
    /// Proceed with the per-tuple sweep (table-level call only).
    pub const GO: ActionFlags = ActionFlags(8);

    #[inline]
    pub fn contains(self, other: ActionFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ActionFlags {
    type Output = ActionFlags;

    #[inline]
    fn bitor(self, rhs: ActionFlags) -> ActionFlags {
        ActionFlags(self.0 | rhs.0)
    }
}

/// One call of the stateful `print` sequence.
pub enum PrintPhase<'a, R> {
    /// Before the first record.
    Begin,
    Record(&'a R),
    /// After the last record.
    End,
}

/// The closed operation set a statistics module may implement. Defaults
/// cover the common cases so simple counters stay small.
pub trait StatModule: 'static {
    type Config: Serializable;
    type Tuple: Serializable + Default;
    type ETuple: Serializable + Default;
    type Record: Serializable;
    /// Per-window scratch created by `flush`.
    type IvlState: Default;
    /// Export-side state surviving across windows.
    type ExState: Default;
    /// State threaded through one query's `print` sequence.
    type PrintState: Default;

    /// Registry name of the implementation.
    const KIND: &'static str;
    /// Output formats accepted by `print`; the first one is the default.
    const FORMATS: &'static [&'static str] = &["plain"];

    /// Called once per module load on the supervisor. `None` skips the
    /// module.
    fn init(def: &ModuleDef) -> Option<Self::Config>;

    // --- capture role ---

    /// Fast per-packet predicate, after the classification filter.
    fn check(_cfg: &Self::Config, _pkt: &Packet) -> bool {
        true
    }

    /// Must satisfy `matches(p, t(q)) => hash(p) == hash(q)`.
    fn hash(cfg: &Self::Config, pkt: &Packet) -> u32;

    /// Equivalence of a packet with an existing tuple within one window.
    fn matches(cfg: &Self::Config, pkt: &Packet, tuple: &Self::Tuple) -> bool;

    /// Folds a packet into its tuple. `is_new` is set on the first packet
    /// of an equivalence class.
    fn update(
        cfg: &Self::Config,
        state: &mut Self::IvlState,
        pkt: &Packet,
        tuple: &mut Self::Tuple,
        is_new: bool,
    ) -> UpdateStatus;

    /// Fresh per-window scratch, called at the first packet of each window.
    fn flush(_cfg: &Self::Config, _ivl_start: Timestamp) -> Self::IvlState {
        Default::default()
    }

    // --- export role ---

    /// Pairs a capture tuple with an e-tuple during export aggregation.
    fn ematch(_cfg: &Self::Config, _etuple: &Self::ETuple, _tuple: &Self::Tuple) -> bool {
        true
    }

    /// Secondary aggregation of one tuple into its e-tuple.
    fn export(
        cfg: &Self::Config,
        state: &mut Self::ExState,
        etuple: &mut Self::ETuple,
        tuple: &Self::Tuple,
        is_new: bool,
    );

    /// Sweep order of the e-table (e.g. descending bytes for a top-N).
    fn compare(_cfg: &Self::Config, _a: &Self::ETuple, _b: &Self::ETuple) -> Ordering {
        Ordering::Equal
    }

    /// Sweep decision. Called once with `etuple == None` for the whole
    /// table, then per e-tuple in `compare` order with its rank.
    fn action(
        cfg: &Self::Config,
        state: &mut Self::ExState,
        etuple: Option<&Self::ETuple>,
        ivl_start: Timestamp,
        rank: usize,
    ) -> ActionFlags;

    /// Produces the durable record for an e-tuple elected STORE.
    fn store(cfg: &Self::Config, etuple: &Self::ETuple) -> (Timestamp, Self::Record);

    // --- query role ---

    /// Formats one phase of a query reply. Stateful across calls with the
    /// same `state` handle.
    fn print<W: io::Write>(
        cfg: &Self::Config,
        state: &mut Self::PrintState,
        phase: PrintPhase<Self::Record>,
        format: &str,
        args: &ArgMap,
        out: &mut W,
    ) -> ComoResult<()>;

    /// Reconstructs synthetic packets from a record, for feeding another
    /// module's pipeline.
    fn replay(_cfg: &Self::Config, _rec: &Self::Record, _out: &mut Vec<Packet>) {}
}

/// Erased capture-role runner; implemented by `CaptureEngine<M>`.
pub trait CaptureRunner {
    fn name(&self) -> &str;
    fn def(&self) -> &ModuleDef;

    /// Offers one packet. Returns a flush batch when the packet rolled the
    /// window (or filled the table).
    fn process(
        &mut self,
        pkt: &Packet,
        pool: &mut crate::mem::Pool,
    ) -> ComoResult<Option<crate::capture::FlushBatch>>;

    /// Flushes the in-progress window unconditionally.
    fn flush_now(
        &mut self,
        pool: &mut crate::mem::Pool,
    ) -> ComoResult<Option<crate::capture::FlushBatch>>;

    /// Export acknowledged a shared-memory batch; the block can be reused.
    fn ack_shm(&mut self, block_ofs: u64, pool: &mut crate::mem::Pool) -> ComoResult<()>;

    /// Shared-pool bytes pinned by this module in the capture process.
    fn mem_usage(&self) -> u64;

    /// Releases everything the module holds in the capture process.
    fn destroy(&mut self, pool: &mut crate::mem::Pool) -> ComoResult<()>;
}

/// Erased export-role runner; implemented by `ExportEngine<M>`.
pub trait ExportRunner {
    fn name(&self) -> &str;
    fn def(&self) -> &ModuleDef;

    /// Consumes one flushed window of serialized tuples and runs the sweep.
    fn process_tuples(
        &mut self,
        ntuples: u32,
        data: &[u8],
        ivl_start: Timestamp,
        sink: &mut dyn crate::export::RecordSink,
    ) -> ComoResult<()>;

    /// Final sweep when capture reports the sniffers drained.
    fn flush_residual(&mut self, sink: &mut dyn crate::export::RecordSink) -> ComoResult<()>;

    /// Export-side memory used by this module, bytes.
    fn mem_usage(&self) -> u64;
}

/// Erased query-role runner.
pub trait QueryRunner {
    fn name(&self) -> &str;
    fn formats(&self) -> &'static [&'static str];

    fn print_begin(&mut self, format: &str, args: &ArgMap, out: &mut Vec<u8>) -> ComoResult<()>;
    /// `payload` is the module part of a record, prefix stripped.
    fn print_record(
        &mut self,
        payload: &[u8],
        format: &str,
        args: &ArgMap,
        out: &mut Vec<u8>,
    ) -> ComoResult<()>;
    fn print_end(&mut self, format: &str, args: &ArgMap, out: &mut Vec<u8>) -> ComoResult<()>;

    /// Synthesizes packets from a record payload.
    fn replay(&mut self, payload: &[u8], out: &mut Vec<Packet>) -> ComoResult<()>;
}

struct QueryEngine<M: StatModule> {
    def: ModuleDef,
    cfg: M::Config,
    state: M::PrintState,
}

impl<M: StatModule> QueryRunner for QueryEngine<M> {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn formats(&self) -> &'static [&'static str] {
        M::FORMATS
    }

    fn print_begin(&mut self, format: &str, args: &ArgMap, out: &mut Vec<u8>) -> ComoResult<()> {
        M::print(&self.cfg, &mut self.state, PrintPhase::Begin, format, args, out)
    }

    fn print_record(
        &mut self,
        payload: &[u8],
        format: &str,
        args: &ArgMap,
        out: &mut Vec<u8>,
    ) -> ComoResult<()> {
        let rec: M::Record = from_bytes(payload)?;
        M::print(
            &self.cfg,
            &mut self.state,
            PrintPhase::Record(&rec),
            format,
            args,
            out,
        )
    }

    fn print_end(&mut self, format: &str, args: &ArgMap, out: &mut Vec<u8>) -> ComoResult<()> {
        M::print(&self.cfg, &mut self.state, PrintPhase::End, format, args, out)
    }

    fn replay(&mut self, payload: &[u8], out: &mut Vec<Packet>) -> ComoResult<()> {
        let rec: M::Record = from_bytes(payload)?;
        M::replay(&self.cfg, &rec, out);
        Ok(())
    }
}

/// Role factories for one module implementation. The registry maps kind
/// names to handles; processes build their role runner from the shipped
/// definition and config bytes.
#[derive(Clone, Copy)]
pub struct ModuleHandle {
    pub kind: &'static str,
    pub init: fn(&ModuleDef) -> Option<Vec<u8>>,
    pub capture: fn(ModuleDef, &[u8], bool) -> ComoResult<Box<dyn CaptureRunner>>,
    pub export: fn(ModuleDef, &[u8]) -> ComoResult<Box<dyn ExportRunner>>,
    pub query: fn(ModuleDef, &[u8]) -> ComoResult<Box<dyn QueryRunner>>,
}

/// Builds the erased role factories for a module implementation.
pub fn handle_of<M: StatModule>() -> ModuleHandle {
    ModuleHandle {
        kind: M::KIND,
        init: |def| {
            let cfg = M::init(def)?;
            to_bytes(&cfg).ok()
        },
        capture: |def, cfg, shm| {
            let cfg: M::Config = from_bytes(cfg)?;
            Ok(Box::new(CaptureEngine::<M>::new(def, cfg, shm)?))
        },
        export: |def, cfg| {
            let cfg: M::Config = from_bytes(cfg)?;
            Ok(Box::new(ExportEngine::<M>::new(def, cfg)))
        },
        query: |def, cfg| {
            let cfg: M::Config = from_bytes(cfg)?;
            Ok(Box::new(QueryEngine::<M> {
                def,
                cfg,
                state: Default::default(),
            }))
        },
    }
}
