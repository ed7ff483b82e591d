//! CAPTURE process.
//!
//! Pulls batches from the sniffers and runs every active module's filter,
//! hash, match, update sequence; window flushes ship to EXPORT either as
//! serialized copies or as shared-memory handles. All module updates for
//! packet `p` complete before `p+1` starts, and the loop pauses between
//! batches whenever the supervisor holds it frozen.

use crate::config::NodeConfig;
use crate::sniffer::Sniffer;
use libcomo::capture::{FlushBatch, FlushPayload, SerTuplesMsg, ShmTuplesMsg, ShmTuplesNamed, TuplesProcessedMsg};
use libcomo::error::{ComoError, ComoResult, ErrorUtils, Outcome};
use libcomo::ipc::{msg, Endpoint, Envelope, Mailbox, PeerId, PeerSlot};
use libcomo::logging::{self, Logger};
use libcomo::mem::{Pool, Region};
use libcomo::module::{Module, ModuleAddMsg, ModuleStatus, Role, StatusMsg, UsageReport};
use libcomo::packet::{Batch, Packet};
use libcomo::serial::{from_bytes, to_bytes};
use std::time::{Duration, Instant};

const BATCH_MAX: usize = 512;
const STATS_IVL: Duration = Duration::from_millis(250);

pub struct CaptureCtx {
    modules: Vec<Module>,
    pool: Pool,
    export_slot: PeerSlot,
    frozen: bool,
    started: bool,
    exiting: bool,
    log: Logger,
}

fn handle_module_add(
    ctx: &mut CaptureCtx,
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

    let runner = match (handle.capture)(add.def.clone(), &add.config, add.shm) {
        Ok(runner) => runner,
        Err(err) => {
            // A broken module definition skips the module, nothing else.
            logging::warn!(ctx.log, "module attach failed";
                           "module" => &add.def.name, "error" => ?err);
            return Ok(Outcome::Ok);
        }
    };
    logging::info!(ctx.log, "module attached"; "module" => &add.def.name, "shm" => add.shm);
    ctx.modules.push(Module::new(add.def, Role::Capture(runner)));
    Ok(Outcome::Ok)
}

fn handle_module_del(
    ctx: &mut CaptureCtx,
    mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let name = String::from_utf8_lossy(payload).to_string();

    if let Some(pos) = ctx.modules.iter().position(|m| m.def.name == name) {
        let mut module = ctx.modules.remove(pos);
        // Ship whatever the dying module still aggregates; records beat
        // silent loss.
        if let Ok(runner) = module.capture_mut() {
            if let Ok(Some(batch)) = runner.flush_now(&mut ctx.pool) {
                send_batch(mail, ctx.export_slot, batch);
            }
            runner.destroy(&mut ctx.pool)?;
        }
        logging::info!(ctx.log, "module removed"; "module" => &name);
    }
    Ok(Outcome::Ok)
}

fn handle_module_start(
    ctx: &mut CaptureCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.started = true;
    Ok(Outcome::Ok)
}

fn handle_module_status(
    ctx: &mut CaptureCtx,
    mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let status: StatusMsg = from_bytes(payload)?;
    let export_slot = ctx.export_slot;

    let (pool, module) = {
        let CaptureCtx {
            ref mut pool,
            ref mut modules,
            ..
        } = *ctx;
        (pool, modules.iter_mut().find(|m| m.def.name == status.name))
    };

    if let Some(module) = module {
        if status.active {
            module.status = ModuleStatus::Active;
        } else {
            module.status = ModuleStatus::Disabled;
            // Flush and drop the window so the pool recovers now.
            if let Ok(runner) = module.capture_mut() {
                if let Ok(Some(batch)) = runner.flush_now(pool) {
                    send_batch(mail, export_slot, batch);
                }
            }
        }
    }
    Ok(Outcome::Ok)
}

fn handle_freeze(
    ctx: &mut CaptureCtx,
    mail: &mut Mailbox,
    env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.frozen = true;
    mail.send(env.slot, msg::ACK, Vec::new());
    Ok(Outcome::Ok)
}

fn handle_resume(
    ctx: &mut CaptureCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.frozen = false;
    Ok(Outcome::Ok)
}

fn handle_tuples_processed(
    ctx: &mut CaptureCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let ack: TuplesProcessedMsg = from_bytes(payload)?;

    let CaptureCtx {
        ref mut pool,
        ref mut modules,
        ..
    } = *ctx;

    if let Some(module) = modules.iter_mut().find(|m| m.def.name == ack.mdl) {
        module.capture_mut()?.ack_shm(ack.block_ofs, pool)?;
    }
    Ok(Outcome::Ok)
}

fn handle_exit(
    ctx: &mut CaptureCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    ctx.exiting = true;
    Ok(Outcome::Ok)
}

fn send_batch(mail: &mut Mailbox, export_slot: PeerSlot, batch: FlushBatch) {
    let (mtype, bytes) = encode_batch(batch);
    mail.send(export_slot, mtype, bytes);
}

fn encode_batch(batch: FlushBatch) -> (u16, Vec<u8>) {
    match batch.payload {
        FlushPayload::Serialized(data) => {
            let msg_body = SerTuplesMsg {
                mdl: batch.mdl,
                ivl_start: batch.ivl_start,
                ntuples: batch.ntuples,
                data,
            };
            (msg::SER_TUPLES, to_bytes(&msg_body).expect("encode tuples"))
        }
        FlushPayload::Shm { block, len } => {
            let msg_body = ShmTuplesNamed {
                mdl: batch.mdl,
                msg: ShmTuplesMsg {
                    ivl_start: batch.ivl_start,
                    ntuples: batch.ntuples,
                    block_ofs: block.ofs,
                    block_class: block.class,
                    len,
                },
            };
            (msg::SHM_TUPLES, to_bytes(&msg_body).expect("encode tuples"))
        }
    }
}

pub fn run(
    config: &NodeConfig,
    mut sniffers: Vec<Box<dyn Sniffer>>,
    exit_when_done: bool,
    log: &Logger,
) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "capture"));

    let mut endpoint: Endpoint<CaptureCtx> = Endpoint::new(PeerId::capture(), &log)?;
    endpoint.register(msg::MODULE_ADD, handle_module_add);
    endpoint.register(msg::MODULE_DEL, handle_module_del);
    endpoint.register(msg::MODULE_START, handle_module_start);
    endpoint.register(msg::MODULE_STATUS, handle_module_status);
    endpoint.register(msg::FREEZE, handle_freeze);
    endpoint.register(msg::RESUME, handle_resume);
    endpoint.register(msg::TUPLES_PROCESSED, handle_tuples_processed);
    endpoint.register(msg::EXIT, handle_exit);

    let sup_slot = endpoint.connect(&config.supervisor_addr(), PeerId::supervisor())?;
    let export_slot = endpoint.connect(&config.export_addr(), PeerId::export())?;

    // The shared region was created by the supervisor; capture owns the
    // allocator over it.
    let region = Region::open(config.shmem_path())?;
    let pool = Pool::new(region, &log)?;

    let mut ctx = CaptureCtx {
        modules: Vec::new(),
        pool,
        export_slot,
        frozen: false,
        started: false,
        exiting: false,
        log: log.clone(),
    };

    for sniffer in &mut sniffers {
        sniffer.start()?;
    }

    endpoint.send(sup_slot, msg::SYNC, &[])?;
    logging::info!(log, "capture ready"; "sniffers" => sniffers.len());

    let mut batch_buf: Vec<Packet> = Vec::with_capacity(BATCH_MAX);
    let mut drained = false;
    let mut done_sent = false;
    let mut last_stats = Instant::now();

    loop {
        endpoint.poll_once(&mut ctx, Some(Duration::from_millis(1)))?;

        if ctx.exiting {
            break;
        }
        if ctx.frozen || !ctx.started {
            continue;
        }

        if last_stats.elapsed() >= STATS_IVL {
            let report = usage_report(&ctx);
            if endpoint.send(sup_slot, msg::STATS, &to_bytes(&report)?).has_failed() {
                logging::warn!(log, "supervisor unreachable, exiting");
                break;
            }
            last_stats = Instant::now();
        }

        if drained {
            if !done_sent {
                flush_all(&mut ctx, &mut endpoint)?;
                endpoint.send(export_slot, msg::SNIFFERS_DONE, &[])?;
                done_sent = true;
                logging::info!(log, "all sniffers drained");
                if exit_when_done {
                    break;
                }
            }
            continue;
        }

        // One batch per iteration, all modules per packet.
        batch_buf.clear();
        let mut got = 0;
        for sniffer in &mut sniffers {
            let remaining = BATCH_MAX - batch_buf.len();
            got += sniffer.next(&mut batch_buf, remaining)?;
            if batch_buf.len() >= BATCH_MAX {
                break;
            }
        }
        if got == 0 {
            drained = true;
            continue;
        }

        // All modules see the batch atomically, in batch order.
        let batch = Batch::single(&batch_buf);
        for pkt in batch.iter() {
            process_packet(&mut ctx, &mut endpoint, pkt)?;
        }
    }

    for sniffer in &mut sniffers {
        sniffer.stop();
    }
    Ok(())
}

fn process_packet(
    ctx: &mut CaptureCtx,
    endpoint: &mut Endpoint<CaptureCtx>,
    pkt: &Packet,
) -> ComoResult<()> {
    let export_slot = ctx.export_slot;
    let mut outgoing = Vec::new();

    {
        let CaptureCtx {
            ref mut modules,
            ref mut pool,
            ref log,
            ..
        } = *ctx;

        for module in modules.iter_mut() {
            if module.status != ModuleStatus::Active {
                continue;
            }
            let name = module.def.name.clone();
            let runner = module.capture_mut()?;

            match runner.process(pkt, pool) {
                Ok(Some(batch)) => outgoing.push(encode_batch(batch)),
                Ok(None) => {}
                Err(ComoError::Overload) => {
                    // Packet dropped for this module; the scheduler sees
                    // the pressure through the stats reports.
                    logging::debug!(log, "allocation failed, packet dropped";
                                    "module" => name);
                }
                Err(err) => return Err(err),
            }
        }
    }

    for (mtype, bytes) in outgoing {
        endpoint.send(export_slot, mtype, &bytes)?;
    }
    Ok(())
}

fn flush_all(ctx: &mut CaptureCtx, endpoint: &mut Endpoint<CaptureCtx>) -> ComoResult<()> {
    let export_slot = ctx.export_slot;
    let mut outgoing = Vec::new();

    {
        let CaptureCtx {
            ref mut modules,
            ref mut pool,
            ..
        } = *ctx;
        for module in modules.iter_mut() {
            if let Ok(runner) = module.capture_mut() {
                if let Some(batch) = runner.flush_now(pool)? {
                    outgoing.push(encode_batch(batch));
                }
            }
        }
    }

    for (mtype, bytes) in outgoing {
        endpoint.send(export_slot, mtype, &bytes)?;
    }
    Ok(())
}

fn usage_report(ctx: &CaptureCtx) -> UsageReport {
    let entries = ctx
        .modules
        .iter()
        .filter_map(|m| match &m.role {
            Role::Capture(runner) => Some((m.def.name.clone(), runner.mem_usage())),
            _ => None,
        })
        .collect();

    UsageReport {
        class: libcomo::ipc::class::CAPTURE,
        pool_usage: ctx.pool.usage(),
        entries,
    }
}
