//! Thin wrapper around `slog`/`sloggers` so every subsystem logs through the
//! same plumbing. Components receive a child logger via `log.new(o!(...))`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process-wide root logger. `level` is one of the `sloggers`
/// severities (`trace`, `debug`, `info`, `warning`, `error`, `critical`);
/// `silent` routes everything to the discard drain.
pub fn init(level: &str, silent: bool) -> Logger {
    if silent {
        return Logger::root(Discard, o!());
    }

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger for tests and for components constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
