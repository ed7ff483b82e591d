//! Node configuration.
//!
//! TOML loaded through `serdeconv`; `-C` supplies the same text inline.
//! Module entries become `ModuleDef`s; reload diffs the shadow config
//! against the active set by `(name, node)` identity.

use libcomo::error::{ComoError, ComoResult};
use libcomo::module::{ArgMap, ModuleDef};
use libcomo::time::ts_from_secs;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_QUERY_PORT: u16 = 44444;
pub const DEFAULT_IPC_PORT: u16 = 44450;

/// Per-module chunk cap bounds (`filesize`), bytes.
pub const MIN_FILESIZE: u64 = 128 << 20;
pub const MAX_FILESIZE: u64 = 1 << 30;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub name: String,
    pub location: String,
    pub db_path: PathBuf,
    /// Shared-memory pool size, MB; rounded up to a power of two.
    pub mem_size: u64,
    /// Default per-module stream size cap, bytes.
    pub filesize: u64,
    pub query_port: u16,
    /// Base port of the IPC sockets; storage and export listen above it.
    pub ipc_port: u16,
    pub log_level: String,
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleConf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleConf {
    pub name: String,
    /// Implementation; defaults to the instance name.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub node: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub output: Option<String>,
    /// Output stream size limit, bytes; clamped to `filesize` bounds.
    #[serde(default)]
    pub streamsize: Option<u64>,
    /// Window length, seconds.
    #[serde(default = "default_flush_ivl")]
    pub flush_ivl: u64,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn default_filter() -> String {
    "all".to_string()
}

fn default_flush_ivl() -> u64 {
    1
}

fn default_priority() -> u32 {
    1
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            name: "como-node".to_string(),
            location: "unknown".to_string(),
            db_path: PathBuf::from("como-db"),
            mem_size: 64,
            filesize: 256 << 20,
            query_port: DEFAULT_QUERY_PORT,
            ipc_port: DEFAULT_IPC_PORT,
            log_level: "info".to_string(),
            modules: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ComoResult<NodeConfig> {
        let config: NodeConfig = serdeconv::from_toml_file(path.as_ref())
            .map_err(|_| ComoError::Malformed("config file"))?;
        config.validate()
    }

    pub fn parse(text: &str) -> ComoResult<NodeConfig> {
        let config: NodeConfig =
            serdeconv::from_toml_str(text).map_err(|_| ComoError::Malformed("config text"))?;
        config.validate()
    }

    fn validate(mut self) -> ComoResult<NodeConfig> {
        if self.mem_size == 0 {
            return Err(ComoError::Malformed("mem-size must be positive"));
        }
        self.filesize = self.filesize.clamp(MIN_FILESIZE, MAX_FILESIZE);

        let mut seen = std::collections::HashSet::new();
        for module in &self.modules {
            if !seen.insert((module.name.clone(), module.node)) {
                return Err(ComoError::Malformed("duplicate module name"));
            }
        }
        Ok(self)
    }

    /// Shared pool size in bytes, rounded up to a power of two.
    pub fn pool_size(&self) -> u64 {
        (self.mem_size << 20).next_power_of_two()
    }

    /// Addresses of the fixed process sockets.
    pub fn supervisor_addr(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port)
    }

    pub fn storage_addr(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port + 1)
    }

    pub fn export_addr(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port + 2)
    }

    pub fn shmem_path(&self) -> PathBuf {
        self.db_path.join("shmem")
    }

    /// Identity used by the reload diff.
    pub fn module_ids(&self) -> Vec<(String, u16)> {
        self.modules
            .iter()
            .map(|m| (m.name.clone(), m.node))
            .collect()
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConf> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl ModuleConf {
    /// Expands a config entry into the definition shipped to processes.
    pub fn to_def(&self, node: &NodeConfig) -> ModuleDef {
        let streamsize = self
            .streamsize
            .unwrap_or(node.filesize)
            .clamp(MIN_FILESIZE.min(node.filesize), node.filesize);

        let mut args = ArgMap::new();
        for (key, val) in &self.args {
            args.insert(key.clone(), val.clone());
        }

        ModuleDef {
            name: self.name.clone(),
            kind: self.kind.clone().unwrap_or_else(|| self.name.clone()),
            output: self.output.clone().unwrap_or_else(|| self.name.clone()),
            description: self.description.clone(),
            filter: self.filter.clone(),
            stream_size: streamsize,
            flush_ivl: ts_from_secs(self.flush_ivl.max(1)),
            priority: self.priority,
            args,
        }
    }
}

/// Difference between the active config and a freshly parsed shadow.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Diffs module sets by `(name, node)` identity. A changed entry under the
/// same identity counts as removed plus added.
pub fn diff_modules(active: &NodeConfig, shadow: &NodeConfig) -> ConfigDiff {
    let mut diff = ConfigDiff::default();

    for module in &active.modules {
        match shadow
            .modules
            .iter()
            .find(|m| m.name == module.name && m.node == module.node)
        {
            Some(new) if new == module => {}
            Some(_) => {
                diff.removed.push(module.name.clone());
                diff.added.push(module.name.clone());
            }
            None => diff.removed.push(module.name.clone()),
        }
    }

    for module in &shadow.modules {
        if !active
            .modules
            .iter()
            .any(|m| m.name == module.name && m.node == module.node)
        {
            diff.added.push(module.name.clone());
        }
    }

    diff
}
