//! Built-in statistics modules.
//!
//! Module implementations are external collaborators of the core: the node
//! resolves a definition's `kind` here and gets back the erased role
//! factories.

pub mod traffic;
pub mod topports;

use libcomo::module::{handle_of, ModuleHandle, StatModule};

/// Resolves an implementation name to its role factories.
pub fn lookup(kind: &str) -> Option<ModuleHandle> {
    match kind {
        traffic::Traffic::KIND => Some(handle_of::<traffic::Traffic>()),
        topports::TopPorts::KIND => Some(handle_of::<topports::TopPorts>()),
        _ => None,
    }
}

/// Kinds known to this build, for the status service.
pub fn known_kinds() -> &'static [&'static str] {
    &["traffic", "topports"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert!(lookup("traffic").is_some());
        assert!(lookup("topports").is_some());
        assert!(lookup("frobnicator").is_none());
    }
}
