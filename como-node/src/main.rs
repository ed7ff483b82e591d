//! The `como` binary.
//!
//! Without `--role` this is the supervisor, which re-executes itself with
//! `--role capture|export|storage|query` for the child processes. `-i`
//! bypasses the process set entirely and runs one module inline.

mod capture;
mod config;
mod export;
mod inline;
mod query;
mod resmgmt;
mod sniffer;
mod storage;
mod supervisor;

use clap::{App, Arg};
use config::NodeConfig;
use libcomo::error::{ComoError, ComoResult};
use libcomo::logging;

/// Parsed command line, forwarded to child processes verbatim.
pub struct Cli {
    pub config_path: Option<String>,
    pub config_text: Option<String>,
    pub sniffers: Vec<String>,
    pub inline_module: Option<String>,
    pub exit_when_done: bool,
    pub silent: bool,
    pub verbosity: Option<String>,
    pub role: Option<String>,
}

impl Cli {
    pub fn load_config(&self) -> ComoResult<NodeConfig> {
        if let Some(path) = &self.config_path {
            return NodeConfig::load(path);
        }
        if let Some(text) = &self.config_text {
            return NodeConfig::parse(text);
        }
        Ok(NodeConfig::default())
    }
}

fn main() {
    let matches = App::new("como")
        .version("2.0")
        .about("Passive network monitoring node")
        .arg(
            Arg::with_name("config")
                .short("c")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config-text")
                .short("C")
                .value_name("TEXT")
                .help("Inline configuration text")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("sniffer")
                .short("s")
                .value_name("KIND,DEV[,ARGS]")
                .help("Packet source, repeatable")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name("inline")
                .short("i")
                .value_name("MODULE")
                .help("Inline mode: run one module and exit when the source drains")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("exit-when-done")
                .short("e")
                .help("Exit once all sniffers drain"),
        )
        .arg(Arg::with_name("silent").short("S").help("Suppress all logging"))
        .arg(
            Arg::with_name("verbosity")
                .short("v")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warning, error)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("role")
                .long("role")
                .value_name("ROLE")
                .help("Internal: child process role")
                .hidden(true)
                .takes_value(true),
        )
        .get_matches();

    let cli = Cli {
        config_path: matches.value_of("config").map(String::from),
        config_text: matches.value_of("config-text").map(String::from),
        sniffers: matches
            .values_of("sniffer")
            .map(|vals| vals.map(String::from).collect())
            .unwrap_or_default(),
        inline_module: matches.value_of("inline").map(String::from),
        exit_when_done: matches.is_present("exit-when-done"),
        silent: matches.is_present("silent"),
        verbosity: matches.value_of("verbosity").map(String::from),
        role: matches.value_of("role").map(String::from),
    };

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("como: invalid configuration: {:?}", err);
            std::process::exit(1);
        }
    };

    let level = cli
        .verbosity
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    let log = logging::init(&level, cli.silent);

    let result = dispatch(&cli, config, &log);

    if let Err(err) = result {
        logging::crit!(log, "process failed"; "error" => ?err);
        std::process::exit(match err {
            ComoError::Fatal(_) => 70,
            _ => 1,
        });
    }
}

fn dispatch(cli: &Cli, config: NodeConfig, log: &logging::Logger) -> ComoResult<()> {
    match cli.role.as_deref() {
        Some("capture") => {
            let sniffers = make_sniffers(cli)?;
            capture::run(&config, sniffers, cli.exit_when_done, log)
        }
        Some("export") => export::run(&config, log),
        Some("storage") => storage::run(&config, log),
        Some("query") => query::run(&config, log),
        Some(_) => Err(ComoError::Malformed("unknown role")),
        None => match &cli.inline_module {
            Some(module) => {
                let sniffers = make_sniffers(cli)?;
                inline::run(&config, module, sniffers, log)
            }
            None => supervisor::run(config, cli, log),
        },
    }
}

fn make_sniffers(cli: &Cli) -> ComoResult<Vec<Box<dyn sniffer::Sniffer>>> {
    cli.sniffers
        .iter()
        .map(|spec| sniffer::make_sniffer(spec))
        .collect()
}
