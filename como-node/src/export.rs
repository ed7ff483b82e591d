//! EXPORT process.
//!
//! Receives flushed windows from CAPTURE, runs each module's secondary
//! aggregation and action sweep, and commits elected records to the
//! module's bytestream. Shared-memory batches are read straight out of the
//! region and acknowledged so capture can reuse the block.

use crate::config::NodeConfig;
use libcomo::capture::{SerTuplesMsg, ShmTuplesNamed, TuplesProcessedMsg};
use libcomo::error::{ComoError, ComoResult, ErrorUtils, Outcome};
use libcomo::export::StorageSink;
use libcomo::ipc::{msg, Endpoint, Envelope, Mailbox, PeerId};
use libcomo::logging::{self, Logger};
use libcomo::mem::{Block, Pool, Region};
use libcomo::module::{Module, ModuleAddMsg, ModuleStatus, Role, StatusMsg, UsageReport};
use libcomo::serial::{from_bytes, to_bytes};
use libcomo::storage::{OpenMode, StorageConn, StorageFile};
use hashbrown::HashMap;
use std::time::{Duration, Instant};

const STATS_IVL: Duration = Duration::from_millis(250);

pub struct ExportCtx {
    modules: Vec<Module>,
    files: HashMap<String, StorageFile>,
    conn: StorageConn,
    /// Shared region mapped read-write for the shm tuple path.
    region: Region,
    config: NodeConfig,
    exiting: bool,
    log: Logger,
}

fn handle_module_add(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let add: ModuleAddMsg = from_bytes(payload)?;

    let handle = match como_modules::lookup(&add.def.kind) {
        Some(handle) => handle,
        None => {
            logging::warn!(ctx.log, "unknown module kind"; "kind" => &add.def.kind);
            return Ok(Outcome::Ok);
        }
    };

    let runner = match (handle.export)(add.def.clone(), &add.config) {
        Ok(runner) => runner,
        Err(err) => {
            logging::warn!(ctx.log, "module attach failed";
                           "module" => &add.def.name, "error" => ?err);
            return Ok(Outcome::Ok);
        }
    };

    // One writer per output bytestream, opened at the tail.
    let file = match ctx.conn.open(
        &ctx.config.db_path,
        &add.def.output,
        OpenMode::Writer,
        add.def.stream_size,
    ) {
        Ok(file) => file,
        Err(err) => {
            logging::warn!(ctx.log, "output stream open failed";
                           "module" => &add.def.name, "error" => ?err);
            return Ok(Outcome::Ok);
        }
    };

    logging::info!(ctx.log, "module attached";
                   "module" => &add.def.name, "output" => &add.def.output);
    ctx.files.insert(add.def.name.clone(), file);
    ctx.modules.push(Module::new(add.def, Role::Export(runner)));
    Ok(Outcome::Ok)
}

fn handle_module_del(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let name = String::from_utf8_lossy(payload).to_string();

    if let Some(pos) = ctx.modules.iter().position(|m| m.def.name == name) {
        let mut module = ctx.modules.remove(pos);

        // Residual table entries become records before the module dies.
        if let Some(mut file) = ctx.files.remove(&name) {
            if let Ok(runner) = module.export_mut() {
                let mut sink = StorageSink {
                    conn: &mut ctx.conn,
                    file: &mut file,
                };
                if runner.flush_residual(&mut sink).has_failed() {
                    logging::warn!(ctx.log, "residual flush failed"; "module" => &name);
                }
            }
            let tail = file.get_offset();
            file.close(&mut ctx.conn, tail)?;
        }
        logging::info!(ctx.log, "module removed"; "module" => &name);
    }
    Ok(Outcome::Ok)
}

fn handle_module_status(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let status: StatusMsg = from_bytes(payload)?;
    if let Some(module) = ctx.modules.iter_mut().find(|m| m.def.name == status.name) {
        module.status = if status.active {
            ModuleStatus::Active
        } else {
            ModuleStatus::Disabled
        };
    }
    Ok(Outcome::Ok)
}

fn handle_ser_tuples(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let batch: SerTuplesMsg = from_bytes(payload)?;
    if let Err(err) = process_window(ctx, &batch.mdl, batch.ntuples, &batch.data, batch.ivl_start) {
        if err.is_fatal() {
            return Err(err);
        }
        // A storage hiccup loses this window's records, not the peer.
        logging::warn!(ctx.log, "window processing failed";
                       "module" => &batch.mdl, "error" => ?err);
    }
    Ok(Outcome::Ok)
}

fn handle_shm_tuples(
    ctx: &mut ExportCtx,
    mail: &mut Mailbox,
    env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let named: ShmTuplesNamed = from_bytes(payload)?;
    let block = Block {
        ofs: named.msg.block_ofs,
        class: named.msg.block_class,
    };

    // Trust nothing across the region without the magic check.
    Pool::verify(&ctx.region, block)?;
    let data = ctx
        .region
        .bytes(block.ofs, named.msg.len as usize)?
        .to_vec();

    if let Err(err) = process_window(ctx, &named.mdl, named.msg.ntuples, &data, named.msg.ivl_start) {
        if err.is_fatal() {
            return Err(err);
        }
        logging::warn!(ctx.log, "window processing failed";
                       "module" => &named.mdl, "error" => ?err);
    }

    // The ack is what lets capture reuse the block, even after a failed
    // window.
    let ack = TuplesProcessedMsg {
        mdl: named.mdl,
        block_ofs: block.ofs,
    };
    mail.send(env.slot, msg::TUPLES_PROCESSED, to_bytes(&ack)?);
    Ok(Outcome::Ok)
}

fn handle_sniffers_done(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    logging::info!(ctx.log, "capture is done, flushing residual tables");

    let ExportCtx {
        ref mut modules,
        ref mut files,
        ref mut conn,
        ..
    } = *ctx;

    for module in modules.iter_mut() {
        let name = module.def.name.clone();
        if let (Ok(runner), Some(file)) = (module.export_mut(), files.get_mut(&name)) {
            let mut sink = StorageSink {
                conn: &mut *conn,
                file,
            };
            runner.flush_residual(&mut sink)?;
        }
    }
    Ok(Outcome::Ok)
}

fn handle_exit(
    ctx: &mut ExportCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.exiting = true;
    Ok(Outcome::Ok)
}

fn process_window(
    ctx: &mut ExportCtx,
    name: &str,
    ntuples: u32,
    data: &[u8],
    ivl_start: u64,
) -> ComoResult<()> {
    let ExportCtx {
        ref mut modules,
        ref mut files,
        ref mut conn,
        ref log,
        ..
    } = *ctx;

    let module = match modules.iter_mut().find(|m| m.def.name == name) {
        Some(module) => module,
        None => {
            logging::warn!(log, "tuples for unknown module"; "module" => name);
            return Ok(());
        }
    };
    if module.status != ModuleStatus::Active {
        return Ok(());
    }

    let file = files
        .get_mut(name)
        .ok_or(ComoError::Malformed("module without output stream"))?;
    let mut sink = StorageSink { conn, file };

    module
        .export_mut()?
        .process_tuples(ntuples, data, ivl_start, &mut sink)
}

pub fn run(config: &NodeConfig, log: &Logger) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "export"));

    let mut endpoint: Endpoint<ExportCtx> = Endpoint::new(PeerId::export(), &log)?;
    endpoint.register(msg::MODULE_ADD, handle_module_add);
    endpoint.register(msg::MODULE_DEL, handle_module_del);
    endpoint.register(msg::MODULE_STATUS, handle_module_status);
    endpoint.register(msg::SER_TUPLES, handle_ser_tuples);
    endpoint.register(msg::SHM_TUPLES, handle_shm_tuples);
    endpoint.register(msg::SNIFFERS_DONE, handle_sniffers_done);
    endpoint.register(msg::EXIT, handle_exit);

    endpoint.listen(&config.export_addr())?;
    let sup_slot = endpoint.connect(&config.supervisor_addr(), PeerId::supervisor())?;

    let conn = StorageConn::connect(&config.storage_addr(), PeerId::export(), &log)?;
    let region = Region::open(config.shmem_path())?;

    let mut ctx = ExportCtx {
        modules: Vec::new(),
        files: HashMap::new(),
        conn,
        region,
        config: config.clone(),
        exiting: false,
        log: log.clone(),
    };

    endpoint.send(sup_slot, msg::SYNC, &[])?;
    logging::info!(log, "export ready");

    let mut last_stats = Instant::now();
    loop {
        endpoint.poll_once(&mut ctx, Some(Duration::from_millis(10)))?;

        if ctx.exiting {
            break;
        }

        if last_stats.elapsed() >= STATS_IVL {
            let report = usage_report(&ctx);
            if endpoint.send(sup_slot, msg::STATS, &to_bytes(&report)?).has_failed() {
                logging::warn!(log, "supervisor unreachable, exiting");
                break;
            }
            last_stats = Instant::now();
        }
    }

    // Close writers so readers see clean ends of stream.
    let ExportCtx {
        ref mut files,
        ref mut conn,
        ..
    } = ctx;
    for (_, file) in files.drain() {
        let tail = file.get_offset();
        drop(file.close(&mut *conn, tail));
    }

    Ok(())
}

fn usage_report(ctx: &ExportCtx) -> UsageReport {
    let entries = ctx
        .modules
        .iter()
        .filter_map(|m| match &m.role {
            Role::Export(runner) => Some((m.def.name.clone(), runner.mem_usage())),
            _ => None,
        })
        .collect();

    UsageReport {
        class: libcomo::ipc::class::EXPORT,
        pool_usage: 0,
        entries,
    }
}
