//! Inline mode: one module, one process.
//!
//! `-i module` wires a sniffer straight through the module's capture and
//! export stages with an in-memory record sink, prints the results to
//! stdout, and exits when the source drains. No child processes, no
//! storage; handy for trying a module against a trace.

use crate::config::NodeConfig;
use crate::sniffer::Sniffer;
use libcomo::capture::FlushPayload;
use libcomo::error::{ComoError, ComoResult};
use libcomo::export::MemSink;
use libcomo::logging::{self, Logger};
use libcomo::mem::{Pool, Region};
use libcomo::module::ArgMap;
use libcomo::packet::Packet;
use libcomo::storage::record;
use std::io::Write;

const BATCH_MAX: usize = 512;

pub fn run(
    config: &NodeConfig,
    module_name: &str,
    mut sniffers: Vec<Box<dyn Sniffer>>,
    log: &Logger,
) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "inline"));

    let conf = config
        .module(module_name)
        .cloned()
        .unwrap_or_else(|| crate::config::ModuleConf {
            name: module_name.to_string(),
            kind: None,
            node: 0,
            description: String::new(),
            filter: "all".to_string(),
            output: None,
            streamsize: None,
            flush_ivl: 1,
            priority: 1,
            args: Default::default(),
        });
    let def = conf.to_def(config);

    let handle = como_modules::lookup(&def.kind)
        .ok_or(ComoError::Malformed("unknown module kind"))?;
    let cfg = (handle.init)(&def).ok_or(ComoError::Malformed("module init failed"))?;

    let mut capture = (handle.capture)(def.clone(), &cfg, false)?;
    let mut export = (handle.export)(def.clone(), &cfg)?;
    let mut query = (handle.query)(def.clone(), &cfg)?;

    let mut pool = Pool::new(Region::anonymous(config.pool_size().min(1 << 24))?, &log)?;
    let mut sink = MemSink::default();

    for sniffer in &mut sniffers {
        sniffer.start()?;
    }

    logging::info!(log, "inline pipeline running"; "module" => &def.name);

    let mut batch: Vec<Packet> = Vec::with_capacity(BATCH_MAX);
    loop {
        batch.clear();
        let mut got = 0;
        for sniffer in &mut sniffers {
            let remaining = BATCH_MAX - batch.len();
            got += sniffer.next(&mut batch, remaining)?;
        }
        if got == 0 {
            break;
        }

        for pkt in &batch {
            if let Some(flush) = capture.process(pkt, &mut pool)? {
                feed(&mut *export, flush, &mut sink)?;
            }
        }
    }

    if let Some(flush) = capture.flush_now(&mut pool)? {
        feed(&mut *export, flush, &mut sink)?;
    }
    export.flush_residual(&mut sink)?;

    for sniffer in &mut sniffers {
        sniffer.stop();
    }

    // Render through the module's default format, as a query would.
    let args = ArgMap::new();
    let format = query.formats()[0];
    let mut out = Vec::new();
    query.print_begin(format, &args, &mut out)?;
    for (_, rec) in &sink.records {
        query.print_record(record::payload(rec)?, format, &args, &mut out)?;
    }
    query.print_end(format, &args, &mut out)?;

    std::io::stdout().write_all(&out)?;
    logging::info!(log, "inline pipeline done"; "records" => sink.records.len());
    Ok(())
}

fn feed(
    export: &mut dyn libcomo::module::ExportRunner,
    flush: libcomo::capture::FlushBatch,
    sink: &mut MemSink,
) -> ComoResult<()> {
    match flush.payload {
        FlushPayload::Serialized(data) => {
            export.process_tuples(flush.ntuples, &data, flush.ivl_start, sink)
        }
        FlushPayload::Shm { .. } => Err(ComoError::Malformed("shm batch in inline pipeline")),
    }
}
