//! STORAGE process: a shell around the bytestream service loop.

use crate::config::NodeConfig;
use libcomo::error::ComoResult;
use libcomo::logging::{self, Logger};
use libcomo::storage::server::DEFAULT_WATCHDOG;
use libcomo::storage::StorageService;
use std::time::Duration;

pub fn run(config: &NodeConfig, log: &Logger) -> ComoResult<()> {
    let log = log.new(logging::o!("process" => "storage"));

    std::fs::create_dir_all(&config.db_path)?;

    let mut service = StorageService::new(
        &config.db_path,
        &config.storage_addr(),
        DEFAULT_WATCHDOG,
        &log,
    )?;
    service.sync_with(&config.supervisor_addr())?;

    logging::info!(log, "storage ready"; "db" => %config.db_path.display());

    while !service.exiting() {
        service.run_once(Some(Duration::from_millis(10)))?;
    }

    Ok(())
}
