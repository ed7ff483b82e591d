//! SUPERVISOR process.
//!
//! Creates the shared region, spawns the process set, waits for their
//! `Sync`, activates the configured modules, then sits in the control
//! loop: resource-scheduler ticks, usage reports, and SIGHUP config
//! reloads with the freeze/ack discipline around structural changes.

use crate::config::{diff_modules, NodeConfig};
use crate::resmgmt::{Decision, ModuleUsage, ResourceMgmt, TICK_MS};
use crate::Cli;
use libcomo::error::{ComoError, ComoResult, Outcome};
use libcomo::ipc::{class, msg, Endpoint, Envelope, Mailbox, PeerId, PeerSlot};
use libcomo::logging::{self, Logger};
use libcomo::mem::Region;
use libcomo::module::{
    Module, ModuleAddMsg, ModuleStatus, Role, StatusMsg, UsageReport,
};
use libcomo::serial::{from_bytes, to_bytes};
use hashbrown::{HashMap, HashSet};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_sig: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

pub struct SupCtx {
    synced: HashSet<u8>,
    usage: HashMap<u8, UsageReport>,
    log: Logger,
}

fn handle_sync(
    ctx: &mut SupCtx,
    _mail: &mut Mailbox,
    env: &Envelope,
    _payload: &[u8],
) -> ComoResult<Outcome> {
    logging::info!(ctx.log, "child synced"; "peer" => env.sender.to_string());
    ctx.synced.insert(env.sender.class);
    Ok(Outcome::Ok)
}

fn handle_stats(
    ctx: &mut SupCtx,
    _mail: &mut Mailbox,
    _env: &Envelope,
    payload: &[u8],
) -> ComoResult<Outcome> {
    let report: UsageReport = from_bytes(payload)?;
    ctx.usage.insert(report.class, report);
    Ok(Outcome::Ok)
}

pub fn run(config: NodeConfig, cli: &Cli, log: &Logger) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "supervisor"));

    std::fs::create_dir_all(&config.db_path)?;

    // The shared region file must exist before capture and export map it;
    // the mapping itself is dropped here, the supervisor never allocates.
    Region::create(config.shmem_path(), config.pool_size())?;
    logging::info!(log, "shared region created";
                   "path" => %config.shmem_path().display(),
                   "size" => config.pool_size());

    let mut endpoint: Endpoint<SupCtx> = Endpoint::new(PeerId::supervisor(), &log)?;
    endpoint.register(msg::SYNC, handle_sync);
    endpoint.register(msg::STATS, handle_stats);
    endpoint.listen(&config.supervisor_addr())?;

    unsafe {
        libc::signal(libc::SIGHUP, on_sighup as libc::sighandler_t);
    }

    // Leaves first: storage, then the processes that connect to it.
    let mut children = vec![
        spawn_child("storage", cli)?,
        spawn_child("export", cli)?,
        spawn_child("query", cli)?,
        spawn_child("capture", cli)?,
    ];

    let mut ctx = SupCtx {
        synced: HashSet::new(),
        usage: HashMap::new(),
        log: log.clone(),
    };

    // Wait for the whole process set to report ready.
    let deadline = Instant::now() + Duration::from_secs(30);
    let wanted = [class::STORAGE, class::EXPORT, class::QUERY, class::CAPTURE];
    while !wanted.iter().all(|c| ctx.synced.contains(c)) {
        if Instant::now() >= deadline {
            return Err(ComoError::Fatal("child processes failed to start"));
        }
        endpoint.poll_once(&mut ctx, Some(Duration::from_millis(20)))?;
    }
    logging::info!(log, "all processes ready");

    let mut modules: Vec<Module> = Vec::new();
    let mut active_config = config.clone();

    // Activate every configured module, then start the pipeline.
    for conf in active_config.modules.clone() {
        let def = conf.to_def(&active_config);
        match activate(&def, &mut endpoint, &log)? {
            Some(module) => modules.push(module),
            None => {}
        }
    }
    broadcast(&mut endpoint, msg::MODULE_START, &[]);

    let mut mgmt = ResourceMgmt::standard(active_config.pool_size(), &log);
    let mut rng = rand::thread_rng();
    let mut last_tick = Instant::now();

    loop {
        endpoint.poll_once(&mut ctx, Some(Duration::from_millis(TICK_MS / 2)))?;

        // A capture that drained its sniffers under -e closes its peer
        // socket; that is the shutdown signal for the node.
        if endpoint.peer_of_class(class::CAPTURE).is_none() {
            logging::info!(log, "capture gone, shutting down");
            break;
        }

        if RELOAD.swap(false, Ordering::SeqCst) {
            match reload(cli, &active_config, &mut modules, &mut endpoint, &log) {
                Ok(shadow) => active_config = shadow,
                Err(err) => {
                    logging::warn!(log, "config reload failed"; "error" => ?err)
                }
            }
        }

        if last_tick.elapsed() >= Duration::from_millis(TICK_MS) {
            last_tick = Instant::now();
            let usages = collect_usage(&modules, &ctx, mgmt.resource_count());
            match mgmt.schedule(&usages, &mut rng) {
                Decision::Disable(names) => {
                    for name in names {
                        set_module_status(&mut modules, &mut endpoint, &name, false)?;
                    }
                }
                Decision::Enable(name) => {
                    set_module_status(&mut modules, &mut endpoint, &name, true)?;
                }
                Decision::None => {}
            }
        }
    }

    broadcast(&mut endpoint, msg::EXIT, &[]);
    for child in &mut children {
        drop(child.wait());
    }
    Ok(())
}

/// Loads the module's callbacks, runs `init`, and ships the definition to
/// every process. A failed activation skips the module and does not roll
/// back peers.
fn activate(
    def: &libcomo::module::ModuleDef,
    endpoint: &mut Endpoint<SupCtx>,
    log: &Logger,
) -> ComoResult<Option<Module>> {
    let handle = match como_modules::lookup(&def.kind) {
        Some(handle) => handle,
        None => {
            logging::warn!(log, "module implementation not found";
                           "module" => &def.name, "kind" => &def.kind);
            return Ok(None);
        }
    };

    let config = match (handle.init)(def) {
        Some(config) => config,
        None => {
            logging::warn!(log, "module init rejected configuration";
                           "module" => &def.name);
            return Ok(None);
        }
    };

    let add = ModuleAddMsg {
        def: def.clone(),
        config: config.clone(),
        shm: true,
    };
    let bytes = to_bytes(&add)?;
    for peer_class in [class::CAPTURE, class::EXPORT, class::QUERY].iter() {
        if let Some(slot) = endpoint.peer_of_class(*peer_class) {
            if let Err(err) = endpoint.send(slot, msg::MODULE_ADD, &bytes) {
                logging::warn!(log, "module add failed";
                               "module" => &def.name, "error" => ?err);
            }
        }
    }

    logging::info!(log, "module activated"; "module" => &def.name);
    Ok(Some(Module::new(
        def.clone(),
        Role::Supervisor { config },
    )))
}

fn broadcast(endpoint: &mut Endpoint<SupCtx>, mtype: u16, payload: &[u8]) {
    for peer_class in [class::CAPTURE, class::EXPORT, class::QUERY, class::STORAGE].iter() {
        if let Some(slot) = endpoint.peer_of_class(*peer_class) {
            drop(endpoint.send(slot, mtype, payload));
        }
    }
}

fn set_module_status(
    modules: &mut [Module],
    endpoint: &mut Endpoint<SupCtx>,
    name: &str,
    active: bool,
) -> ComoResult<()> {
    if let Some(module) = modules.iter_mut().find(|m| m.def.name == name) {
        module.status = if active {
            ModuleStatus::Active
        } else {
            ModuleStatus::Disabled
        };
    }

    let status = to_bytes(&StatusMsg {
        name: name.to_string(),
        active,
    })?;
    for peer_class in [class::CAPTURE, class::EXPORT].iter() {
        if let Some(slot) = endpoint.peer_of_class(*peer_class) {
            endpoint.send(slot, msg::MODULE_STATUS, &status)?;
        }
    }
    Ok(())
}

/// SIGHUP reload: parse the new config into a shadow, diff by identity,
/// freeze capture around removals, then activate additions.
fn reload(
    cli: &Cli,
    active: &NodeConfig,
    modules: &mut Vec<Module>,
    endpoint: &mut Endpoint<SupCtx>,
    log: &Logger,
) -> ComoResult<NodeConfig> {
    let shadow = cli.load_config()?;
    let diff = diff_modules(active, &shadow);
    logging::info!(log, "config reload";
                   "removed" => diff.removed.len(), "added" => diff.added.len());

    if !diff.removed.is_empty() {
        let capture = endpoint
            .peer_of_class(class::CAPTURE)
            .ok_or(ComoError::PeerGone)?;

        // Capture must not touch shared structures while modules go away.
        endpoint.request(capture, msg::FREEZE, &[], msg::ACK, Duration::from_secs(5))?;

        for name in &diff.removed {
            for peer_class in [class::CAPTURE, class::EXPORT, class::QUERY].iter() {
                if let Some(slot) = endpoint.peer_of_class(*peer_class) {
                    endpoint.send(slot, msg::MODULE_DEL, name.as_bytes())?;
                }
            }
            modules.retain(|m| m.def.name != *name);
            logging::info!(log, "module removed"; "module" => name.as_str());
        }

        send_resume(endpoint, capture)?;
    }

    for name in &diff.added {
        let conf = match shadow.module(name) {
            Some(conf) => conf,
            None => continue,
        };
        let def = conf.to_def(&shadow);
        if let Some(module) = activate(&def, endpoint, log)? {
            modules.push(module);
        }
    }
    if !diff.added.is_empty() {
        broadcast(endpoint, msg::MODULE_START, &[]);
    }

    Ok(shadow)
}

fn send_resume(endpoint: &mut Endpoint<SupCtx>, capture: PeerSlot) -> ComoResult<()> {
    endpoint.send(capture, msg::RESUME, &[])
}

fn collect_usage(modules: &[Module], ctx: &SupCtx, nres: usize) -> Vec<ModuleUsage> {
    let find = |class: u8, name: &str| -> f64 {
        ctx.usage
            .get(&class)
            .and_then(|report| {
                report
                    .entries
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, usage)| *usage as f64)
            })
            .unwrap_or(0.0)
    };

    modules
        .iter()
        .map(|module| {
            let mut usage = vec![0.0; nres];
            usage[0] = find(class::CAPTURE, &module.def.name);
            if nres > 1 {
                usage[1] = find(class::EXPORT, &module.def.name);
            }
            ModuleUsage {
                name: module.def.name.clone(),
                priority: module.def.priority,
                active: module.status == ModuleStatus::Active,
                usage,
            }
        })
        .collect()
}

fn spawn_child(role: &str, cli: &Cli) -> ComoResult<Child> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--role").arg(role);

    if let Some(path) = &cli.config_path {
        cmd.arg("-c").arg(path);
    }
    if let Some(text) = &cli.config_text {
        cmd.arg("-C").arg(text);
    }
    if role == "capture" {
        for spec in &cli.sniffers {
            cmd.arg("-s").arg(spec);
        }
        if cli.exit_when_done {
            cmd.arg("-e");
        }
    }
    if cli.silent {
        cmd.arg("-S");
    }
    if let Some(level) = &cli.verbosity {
        cmd.arg("-v").arg(level);
    }

    cmd.spawn().map_err(ComoError::from)
}
