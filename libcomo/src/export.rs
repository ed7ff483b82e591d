//! Export-side pipeline engine.
//!
//! Each flushed capture window runs through secondary aggregation into the
//! module's e-table, then a sweep: one table-level `action` call decides
//! whether to walk the table at all, and per-e-tuple calls in `compare`
//! order elect STORE, DISCARD or STOP. Stored records go to a `RecordSink`,
//! which in production is the module's bytestream writer.

use crate::error::ComoResult;
use crate::module::abi::{ActionFlags, ExportRunner, StatModule};
use crate::module::ModuleDef;
use crate::serial::Serializable;
use crate::storage::client::{StorageConn, StorageFile};
use crate::storage::record;
use crate::time::Timestamp;
use std::io::Cursor;

/// Destination of stored records. The export process commits through the
/// storage client; tests collect in memory.
pub trait RecordSink {
    /// Appends one complete record (prefix included) and returns its
    /// absolute offset in the stream.
    fn store(&mut self, ts: Timestamp, rec: &[u8]) -> ComoResult<u64>;
}

/// Sink writing through the storage client, committing at each record
/// boundary so readers never observe a torn record.
pub struct StorageSink<'a> {
    pub conn: &'a mut StorageConn,
    pub file: &'a mut StorageFile,
}

impl<'a> RecordSink for StorageSink<'a> {
    fn store(&mut self, _ts: Timestamp, rec: &[u8]) -> ComoResult<u64> {
        let ofs = self.file.get_offset();
        let view = self.file.map_mut(self.conn, ofs, rec.len())?;
        view.copy_from_slice(rec);
        self.file.commit(self.conn, ofs + rec.len() as u64)?;
        Ok(ofs)
    }
}

/// In-memory sink for tests and the inline mode.
#[derive(Default)]
pub struct MemSink {
    pub records: Vec<(Timestamp, Vec<u8>)>,
    next_ofs: u64,
}

impl RecordSink for MemSink {
    fn store(&mut self, ts: Timestamp, rec: &[u8]) -> ComoResult<u64> {
        let ofs = self.next_ofs;
        self.next_ofs += rec.len() as u64;
        self.records.push((ts, rec.to_vec()));
        Ok(ofs)
    }
}

/// Per-module export runtime. The e-table survives across windows until the
/// sweep discards its entries, which is how modules accumulate over several
/// windows before exporting.
pub struct ExportEngine<M: StatModule> {
    def: ModuleDef,
    cfg: M::Config,
    state: M::ExState,
    table: Vec<M::ETuple>,
}

impl<M: StatModule> ExportEngine<M> {
    pub fn new(def: ModuleDef, cfg: M::Config) -> ExportEngine<M> {
        ExportEngine {
            def,
            cfg,
            state: Default::default(),
            table: Vec::new(),
        }
    }

    fn aggregate(&mut self, tuples: Vec<M::Tuple>) {
        for tuple in tuples {
            let cfg = &self.cfg;
            let found = self
                .table
                .iter_mut()
                .find(|etuple| M::ematch(cfg, etuple, &tuple));

            match found {
                Some(etuple) => M::export(&self.cfg, &mut self.state, etuple, &tuple, false),
                None => {
                    let mut etuple = M::ETuple::default();
                    M::export(&self.cfg, &mut self.state, &mut etuple, &tuple, true);
                    self.table.push(etuple);
                }
            }
        }
    }

    /// The sweep: `Collecting -> Sorted -> Stored/Discarded -> Released`.
    fn sweep(&mut self, ivl_start: Timestamp, sink: &mut dyn RecordSink) -> ComoResult<()> {
        let table_flags = M::action(&self.cfg, &mut self.state, None, ivl_start, 0);
        if table_flags.contains(ActionFlags::STOP) || !table_flags.contains(ActionFlags::GO) {
            // Keep collecting into the table.
            return Ok(());
        }

        let cfg = &self.cfg;
        self.table.sort_by(|a, b| M::compare(cfg, a, b));

        let mut keep = vec![true; self.table.len()];
        for (rank, etuple) in self.table.iter().enumerate() {
            let flags = M::action(cfg, &mut self.state, Some(etuple), ivl_start, rank);

            if flags.contains(ActionFlags::STORE) {
                let (ts, rec) = M::store(cfg, etuple);
                let bytes = record::store(ts, &rec)?;
                sink.store(ts, &bytes)?;
            }
            if flags.contains(ActionFlags::DISCARD) {
                keep[rank] = false;
            }
            if flags.contains(ActionFlags::STOP) {
                break;
            }
        }

        let mut rank = 0;
        self.table.retain(|_| {
            let retained = keep[rank];
            rank += 1;
            retained
        });

        // Released: a fully swept table gives its arena back.
        if self.table.is_empty() {
            self.table = Vec::new();
        }

        Ok(())
    }
}

impl<M: StatModule> ExportRunner for ExportEngine<M> {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn def(&self) -> &ModuleDef {
        &self.def
    }

    fn process_tuples(
        &mut self,
        ntuples: u32,
        data: &[u8],
        ivl_start: Timestamp,
        sink: &mut dyn RecordSink,
    ) -> ComoResult<()> {
        let mut cursor = Cursor::new(data);
        let mut tuples = Vec::with_capacity(ntuples as usize);
        for _ in 0..ntuples {
            tuples.push(M::Tuple::deserialize(&mut cursor)?);
        }

        self.aggregate(tuples);
        self.sweep(ivl_start, sink)
    }

    fn flush_residual(&mut self, sink: &mut dyn RecordSink) -> ComoResult<()> {
        if self.table.is_empty() {
            return Ok(());
        }
        // The drain sweep runs with the maximum timestamp so time-gated
        // modules export whatever they are still holding.
        self.sweep(crate::time::TS_MAX, sink)
    }

    fn mem_usage(&self) -> u64 {
        (self.table.capacity() * std::mem::size_of::<M::ETuple>()) as u64
    }
}
