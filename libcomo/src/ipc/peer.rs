//! Peer identity carried in every message header.

use std::fmt;

pub const CODE_LEN: usize = 4;
pub const NAME_LEN: usize = 12;

/// Process classes. The parent class distinguishes children spawned per
/// connection (query workers) from the fixed process set.
pub mod class {
    pub const NONE: u8 = 0;
    pub const SUPERVISOR: u8 = 1;
    pub const CAPTURE: u8 = 2;
    pub const EXPORT: u8 = 3;
    pub const STORAGE: u8 = 4;
    pub const QUERY: u8 = 5;
}

/// Identity of a peer process: class, parent class, instance id and two
/// fixed-width tags (a short code and a human-readable name).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerId {
    pub class: u8,
    pub parent_class: u8,
    pub id: u16,
    pub code: [u8; CODE_LEN],
    pub name: [u8; NAME_LEN],
}

impl PeerId {
    pub fn new(class: u8, code: &str, name: &str) -> PeerId {
        PeerId {
            class,
            parent_class: class::NONE,
            id: 0,
            code: fixed(code.as_bytes()),
            name: fixed(name.as_bytes()),
        }
    }

    /// Identity of a child instance of this peer kind (e.g. one query
    /// worker), numbered by the spawning process.
    pub fn child(&self, parent_class: u8, id: u16) -> PeerId {
        let mut peer = *self;
        peer.parent_class = parent_class;
        peer.id = id;
        peer
    }

    pub fn supervisor() -> PeerId {
        PeerId::new(class::SUPERVISOR, "su", "supervisor")
    }

    pub fn capture() -> PeerId {
        PeerId::new(class::CAPTURE, "ca", "capture")
    }

    pub fn export() -> PeerId {
        PeerId::new(class::EXPORT, "ex", "export")
    }

    pub fn storage() -> PeerId {
        PeerId::new(class::STORAGE, "st", "storage")
    }

    pub fn query() -> PeerId {
        PeerId::new(class::QUERY, "qu", "query")
    }

    pub fn name_str(&self) -> &str {
        str_of(&self.name)
    }

    pub fn code_str(&self) -> &str {
        str_of(&self.code)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.id == 0 {
            write!(f, "{}", self.name_str())
        } else {
            write!(f, "{}-{}", self.name_str(), self.id)
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let take = bytes.len().min(N);
    out[..take].copy_from_slice(&bytes[..take]);
    out
}

fn str_of(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_tags() {
        let peer = PeerId::new(class::CAPTURE, "ca", "capture");
        assert_eq!(peer.code_str(), "ca");
        assert_eq!(peer.name_str(), "capture");
        assert_eq!(peer.to_string(), "capture");
    }

    #[test]
    fn test_overlong_name_truncates() {
        let peer = PeerId::new(class::QUERY, "quer", "query-worker-very-long");
        assert_eq!(peer.code_str(), "quer");
        assert_eq!(peer.name_str(), "query-worker");
    }

    #[test]
    fn test_child_identity() {
        let worker = PeerId::query().child(class::SUPERVISOR, 3);
        assert_eq!(worker.class, class::QUERY);
        assert_eq!(worker.parent_class, class::SUPERVISOR);
        assert_eq!(worker.to_string(), "query-3");
    }
}
