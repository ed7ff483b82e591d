//! Module definitions and per-process module runtime.
//!
//! A module definition is static configuration; the runtime pairs it with
//! the role state valid for the hosting process. Crossing roles is a
//! `RoleMismatch`, caught by pattern matches rather than pointer casts.

pub mod abi;

use crate::error::{ComoError, ComoResult};
use crate::serial::{read_str, str_len, write_str, Serializable, SizedRead, SizedWrite};
use crate::time::Timestamp;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;

pub use abi::{
    handle_of, ActionFlags, CaptureRunner, ExportRunner, ModuleHandle, PrintPhase, QueryRunner,
    StatModule, UpdateStatus,
};

pub type ArgMap = HashMap<String, String>;

/// Static module configuration, shipped serialized in `MODULE_ADD`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDef {
    /// Instance name; also the default output stream name.
    pub name: String,
    /// Implementation looked up in the module registry.
    pub kind: String,
    /// Output bytestream name.
    pub output: String,
    pub description: String,
    /// Capture classification expression.
    pub filter: String,
    /// Size limit of the output bytestream, bytes.
    pub stream_size: u64,
    /// Tumbling window length.
    pub flush_ivl: Timestamp,
    /// Weight in resource-scheduler elections.
    pub priority: u32,
    /// Free-form arguments passed to `init`.
    pub args: ArgMap,
}

impl ModuleDef {
    pub fn new(name: &str, kind: &str) -> ModuleDef {
        ModuleDef {
            name: name.to_string(),
            kind: kind.to_string(),
            output: name.to_string(),
            description: String::new(),
            filter: "all".to_string(),
            stream_size: 256 << 20,
            flush_ivl: crate::time::ts_from_secs(1),
            priority: 1,
            args: ArgMap::new(),
        }
    }
}

impl Serializable for ModuleDef {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        write_str(stream, &self.name)?;
        write_str(stream, &self.kind)?;
        write_str(stream, &self.output)?;
        write_str(stream, &self.description)?;
        write_str(stream, &self.filter)?;
        stream.write_u64::<BigEndian>(self.stream_size)?;
        stream.write_u64::<BigEndian>(self.flush_ivl)?;
        stream.write_u32::<BigEndian>(self.priority)?;

        stream.write_u32::<BigEndian>(self.args.len() as u32)?;
        // Deterministic order keeps the encoding canonical.
        let mut keys: Vec<&String> = self.args.keys().collect();
        keys.sort();
        for key in keys {
            write_str(stream, key)?;
            write_str(stream, &self.args[key])?;
        }
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let name = read_str(stream)?;
        let kind = read_str(stream)?;
        let output = read_str(stream)?;
        let description = read_str(stream)?;
        let filter = read_str(stream)?;
        let stream_size = stream.read_u64::<BigEndian>()?;
        let flush_ivl = stream.read_u64::<BigEndian>()?;
        let priority = stream.read_u32::<BigEndian>()?;

        let count = stream.read_u32::<BigEndian>()? as usize;
        let mut args = ArgMap::new();
        for _ in 0..count {
            let key = read_str(stream)?;
            let val = read_str(stream)?;
            args.insert(key, val);
        }

        Ok(ModuleDef {
            name,
            kind,
            output,
            description,
            filter,
            stream_size,
            flush_ivl,
            priority,
            args,
        })
    }

    fn exposed_len(&self) -> usize {
        let mut len = str_len(&self.name)
            + str_len(&self.kind)
            + str_len(&self.output)
            + str_len(&self.description)
            + str_len(&self.filter)
            + 8
            + 8
            + 4
            + 4;
        for (key, val) in &self.args {
            len += str_len(key) + str_len(val);
        }
        len
    }
}

/// Payload of `MODULE_ADD`: the definition, the config produced by `init`
/// on the supervisor, and whether the shared-memory flush path was
/// negotiated for this module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleAddMsg {
    pub def: ModuleDef,
    pub config: Vec<u8>,
    pub shm: bool,
}

impl Serializable for ModuleAddMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        self.def.serialize(stream)?;
        stream.write_u8(self.shm as u8)?;
        stream.write_u32::<BigEndian>(self.config.len() as u32)?;
        stream.write_all(&self.config)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let def = ModuleDef::deserialize(stream)?;
        let shm = stream.read_u8()? != 0;
        let len = stream.read_u32::<BigEndian>()? as usize;
        if stream.remaining_data() < len {
            return Err(ComoError::Malformed("truncated module config"));
        }
        let mut config = vec![0u8; len];
        stream.read_exact(&mut config)?;
        Ok(ModuleAddMsg { def, config, shm })
    }

    fn exposed_len(&self) -> usize {
        self.def.exposed_len() + 1 + 4 + self.config.len()
    }
}

/// Scheduler status broadcast for one module.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ModuleStatus {
    Active,
    Disabled,
}

/// `MODULE_STATUS` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMsg {
    pub name: String,
    pub active: bool,
}

impl Serializable for StatusMsg {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        write_str(stream, &self.name)?;
        stream.write_u8(self.active as u8)?;
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        Ok(StatusMsg {
            name: read_str(stream)?,
            active: stream.read_u8()? != 0,
        })
    }

    fn exposed_len(&self) -> usize {
        str_len(&self.name) + 1
    }
}

/// `STATS` payload: per-module resource usage seen by one process.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    /// Reporting process class.
    pub class: u8,
    /// Shared-pool usage of the whole process, bytes.
    pub pool_usage: u64,
    /// Per-module usage, bytes.
    pub entries: Vec<(String, u64)>,
}

impl Serializable for UsageReport {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> ComoResult<()> {
        stream.write_u8(self.class)?;
        stream.write_u64::<BigEndian>(self.pool_usage)?;
        stream.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for (name, usage) in &self.entries {
            write_str(stream, name)?;
            stream.write_u64::<BigEndian>(*usage)?;
        }
        Ok(())
    }

    fn deserialize<R: SizedRead>(stream: &mut R) -> ComoResult<Self> {
        let class = stream.read_u8()?;
        let pool_usage = stream.read_u64::<BigEndian>()?;
        let count = stream.read_u32::<BigEndian>()? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name = read_str(stream)?;
            let usage = stream.read_u64::<BigEndian>()?;
            entries.push((name, usage));
        }
        Ok(UsageReport {
            class,
            pool_usage,
            entries,
        })
    }

    fn exposed_len(&self) -> usize {
        let mut len = 1 + 8 + 4;
        for (name, _) in &self.entries {
            len += str_len(name) + 8;
        }
        len
    }
}

/// Role state of a module inside one process. Each variant carries only
/// what that process is allowed to touch.
pub enum Role {
    /// The supervisor holds the config it produced with `init`.
    Supervisor { config: Vec<u8> },
    Capture(Box<dyn CaptureRunner>),
    Export(Box<dyn ExportRunner>),
    Query(Box<dyn QueryRunner>),
}

/// A module as one process sees it.
pub struct Module {
    pub def: ModuleDef,
    pub role: Role,
    pub status: ModuleStatus,
}

impl Module {
    pub fn new(def: ModuleDef, role: Role) -> Module {
        Module {
            def,
            role,
            status: ModuleStatus::Active,
        }
    }

    pub fn capture_mut(&mut self) -> ComoResult<&mut dyn CaptureRunner> {
        match &mut self.role {
            Role::Capture(runner) => Ok(runner.as_mut()),
            _ => Err(ComoError::RoleMismatch),
        }
    }

    pub fn export_mut(&mut self) -> ComoResult<&mut dyn ExportRunner> {
        match &mut self.role {
            Role::Export(runner) => Ok(runner.as_mut()),
            _ => Err(ComoError::RoleMismatch),
        }
    }

    pub fn query_mut(&mut self) -> ComoResult<&mut dyn QueryRunner> {
        match &mut self.role {
            Role::Query(runner) => Ok(runner.as_mut()),
            _ => Err(ComoError::RoleMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{from_bytes, to_bytes};

    #[test]
    fn test_def_roundtrip() {
        let mut def = ModuleDef::new("web-traffic", "traffic");
        def.filter = "tcp and port 80".to_string();
        def.args.insert("topn".to_string(), "10".to_string());
        def.args.insert("meas-ivl".to_string(), "5".to_string());

        let back: ModuleDef = from_bytes(&to_bytes(&def).unwrap()).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_add_msg_roundtrip() {
        let msg = ModuleAddMsg {
            def: ModuleDef::new("traffic", "traffic"),
            config: vec![1, 2, 3, 4],
            shm: true,
        };

        let back: ModuleAddMsg = from_bytes(&to_bytes(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_role_mismatch() {
        let mut module = Module::new(
            ModuleDef::new("t", "traffic"),
            Role::Supervisor { config: Vec::new() },
        );

        assert_eq!(module.capture_mut().err(), Some(ComoError::RoleMismatch));
        assert_eq!(module.export_mut().err(), Some(ComoError::RoleMismatch));
    }
}
