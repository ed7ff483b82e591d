//! Capture classification filters.
//!
//! A filter is a conjunction of simple terms (`"tcp and port 80"`). It runs
//! on every packet for every module before the module's own `check`, so the
//! evaluation is a flat scan over pre-parsed terms.

use crate::error::{ComoError, ComoResult};
use crate::packet::{L3Type, L4Type, Packet};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Term {
    All,
    Ip,
    Tcp,
    Udp,
    Icmp,
    Proto(u8),
    Port(u16),
    SrcPort(u16),
    DstPort(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    terms: Vec<Term>,
}

impl Filter {
    /// Parses a conjunction of terms separated by `and`. The empty string
    /// and `"all"` accept every packet.
    pub fn parse(expr: &str) -> ComoResult<Filter> {
        let mut terms = Vec::new();

        for clause in expr.split(" and ") {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }

            let words: Vec<&str> = clause.split_whitespace().collect();
            let term = match words.as_slice() {
                ["all"] => Term::All,
                ["ip"] => Term::Ip,
                ["tcp"] => Term::Tcp,
                ["udp"] => Term::Udp,
                ["icmp"] => Term::Icmp,
                ["proto", num] => Term::Proto(parse_num(num)? as u8),
                ["port", num] => Term::Port(parse_num(num)?),
                ["src", "port", num] => Term::SrcPort(parse_num(num)?),
                ["dst", "port", num] => Term::DstPort(parse_num(num)?),
                _ => return Err(ComoError::Malformed("unknown filter term")),
            };
            terms.push(term);
        }

        Ok(Filter { terms })
    }

    pub fn matches(&self, pkt: &Packet) -> bool {
        self.terms.iter().all(|term| match *term {
            Term::All => true,
            Term::Ip => pkt.l3_type == L3Type::Ipv4,
            Term::Tcp => pkt.l4_type == L4Type::Tcp,
            Term::Udp => pkt.l4_type == L4Type::Udp,
            Term::Icmp => pkt.l4_type == L4Type::Icmp,
            Term::Proto(proto) => pkt.l4_proto() == proto,
            Term::Port(port) => {
                pkt.src_port() == Some(port) || pkt.dst_port() == Some(port)
            }
            Term::SrcPort(port) => pkt.src_port() == Some(port),
            Term::DstPort(port) => pkt.dst_port() == Some(port),
        })
    }
}

fn parse_num(word: &str) -> ComoResult<u16> {
    word.parse()
        .map_err(|_| ComoError::Malformed("bad number in filter"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::synth_packet;

    #[test]
    fn test_empty_and_all() {
        let pkt = synth_packet(1, 100, 17, 1, 2, 53, 1024);
        assert!(Filter::parse("").unwrap().matches(&pkt));
        assert!(Filter::parse("all").unwrap().matches(&pkt));
    }

    #[test]
    fn test_conjunction() {
        let filter = Filter::parse("tcp and port 80").unwrap();

        let http = synth_packet(1, 100, 6, 1, 2, 49152, 80);
        let dns = synth_packet(1, 100, 17, 1, 2, 49152, 53);
        let tcp_other = synth_packet(1, 100, 6, 1, 2, 49152, 443);

        assert!(filter.matches(&http));
        assert!(!filter.matches(&dns));
        assert!(!filter.matches(&tcp_other));
    }

    #[test]
    fn test_directional_ports() {
        let pkt = synth_packet(1, 100, 6, 1, 2, 1000, 2000);

        assert!(Filter::parse("src port 1000").unwrap().matches(&pkt));
        assert!(!Filter::parse("src port 2000").unwrap().matches(&pkt));
        assert!(Filter::parse("dst port 2000").unwrap().matches(&pkt));
    }

    #[test]
    fn test_bad_term_rejected() {
        assert!(Filter::parse("frobnicate").is_err());
        assert!(Filter::parse("port abc").is_err());
    }
}
