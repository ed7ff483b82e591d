//! Packet and batch model.
//!
//! A sniffer owns the packets; capture borrows them for the duration of one
//! batch and modules see immutable views. Layer offsets are populated by the
//! sniffer so modules never re-parse headers they do not care about.

use crate::time::Timestamp;

/// Link layer type tags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum L2Type {
    None,
    Ethernet,
}

/// Network layer type tags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum L3Type {
    None,
    Ipv4,
    Other(u16),
}

/// Transport layer type tags.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum L4Type {
    None,
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

/// One captured packet. Immutable during a batch.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp, monotonically non-decreasing within a batch.
    pub ts: Timestamp,
    /// Bytes actually captured in `data`.
    pub caplen: u32,
    /// Original length on the wire.
    pub len: u32,
    pub l2_type: L2Type,
    pub l3_type: L3Type,
    pub l4_type: L4Type,
    /// Byte offsets of each layer within `data`.
    pub l2_ofs: u16,
    pub l3_ofs: u16,
    pub l4_ofs: u16,
    pub data: Vec<u8>,
}

impl Packet {
    /// Slice starting at the network layer header.
    #[inline]
    pub fn l3(&self) -> &[u8] {
        &self.data[self.l3_ofs as usize..]
    }

    /// Slice starting at the transport layer header.
    #[inline]
    pub fn l4(&self) -> &[u8] {
        &self.data[self.l4_ofs as usize..]
    }

    /// IPv4 source address, if this is an IPv4 packet.
    #[inline]
    pub fn ip_src(&self) -> Option<u32> {
        if self.l3_type != L3Type::Ipv4 {
            return None;
        }
        read_u32(self.l3(), 12)
    }

    /// IPv4 destination address, if this is an IPv4 packet.
    #[inline]
    pub fn ip_dst(&self) -> Option<u32> {
        if self.l3_type != L3Type::Ipv4 {
            return None;
        }
        read_u32(self.l3(), 16)
    }

    /// TCP/UDP source port.
    #[inline]
    pub fn src_port(&self) -> Option<u16> {
        match self.l4_type {
            L4Type::Tcp | L4Type::Udp => read_u16(self.l4(), 0),
            _ => None,
        }
    }

    /// TCP/UDP destination port.
    #[inline]
    pub fn dst_port(&self) -> Option<u16> {
        match self.l4_type {
            L4Type::Tcp | L4Type::Udp => read_u16(self.l4(), 2),
            _ => None,
        }
    }

    /// IP protocol number as carried in the type tag.
    #[inline]
    pub fn l4_proto(&self) -> u8 {
        match self.l4_type {
            L4Type::None => 0,
            L4Type::Tcp => 6,
            L4Type::Udp => 17,
            L4Type::Icmp => 1,
            L4Type::Other(p) => p,
        }
    }
}

#[inline]
fn read_u16(buf: &[u8], ofs: usize) -> Option<u16> {
    if buf.len() < ofs + 2 {
        return None;
    }
    Some(((buf[ofs] as u16) << 8) | buf[ofs + 1] as u16)
}

#[inline]
fn read_u32(buf: &[u8], ofs: usize) -> Option<u32> {
    if buf.len() < ofs + 4 {
        return None;
    }
    Some(
        ((buf[ofs] as u32) << 24)
            | ((buf[ofs + 1] as u32) << 16)
            | ((buf[ofs + 2] as u32) << 8)
            | buf[ofs + 3] as u32,
    )
}

/// One sniffer yield: an ordered run of packets presented to all modules
/// atomically. The two segments cover the ring-buffer wrap in drivers that
/// hand out their ring directly; either may be empty.
pub struct Batch<'a> {
    seg0: &'a [Packet],
    seg1: &'a [Packet],
}

impl<'a> Batch<'a> {
    #[inline]
    pub fn new(seg0: &'a [Packet], seg1: &'a [Packet]) -> Batch<'a> {
        Batch { seg0, seg1 }
    }

    #[inline]
    pub fn single(seg: &'a [Packet]) -> Batch<'a> {
        Batch { seg0: seg, seg1: &[] }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seg0.len() + self.seg1.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the packets in batch order across the wrap.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &'a Packet> {
        self.seg0.iter().chain(self.seg1.iter())
    }
}

/// Builds a minimal synthetic IPv4/UDP-or-TCP packet. Used by module replay
/// implementations and by the test sniffers; real drivers populate packets
/// from the wire instead.
pub fn synth_packet(
    ts: Timestamp,
    len: u32,
    proto: u8,
    src: u32,
    dst: u32,
    sport: u16,
    dport: u16,
) -> Packet {
    let mut data = vec![0u8; 34 + 4];

    // Ethernet type field
    data[12] = 0x08;
    data[13] = 0x00;

    // IPv4 header
    data[14] = 0x45;
    let total = (len.saturating_sub(14)).max(24) as u16;
    data[16] = (total >> 8) as u8;
    data[17] = total as u8;
    data[23] = proto;
    data[26..30].copy_from_slice(&src.to_be_bytes());
    data[30..34].copy_from_slice(&dst.to_be_bytes());

    // Transport ports
    data[34..36].copy_from_slice(&sport.to_be_bytes());
    data[36..38].copy_from_slice(&dport.to_be_bytes());

    let l4_type = match proto {
        6 => L4Type::Tcp,
        17 => L4Type::Udp,
        1 => L4Type::Icmp,
        p => L4Type::Other(p),
    };

    Packet {
        ts,
        caplen: data.len() as u32,
        len,
        l2_type: L2Type::Ethernet,
        l3_type: L3Type::Ipv4,
        l4_type,
        l2_ofs: 0,
        l3_ofs: 14,
        l4_ofs: 34,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ts_from_secs;

    #[test]
    fn test_synth_packet_fields() {
        let pkt = synth_packet(ts_from_secs(5), 128, 6, 0x0a000001, 0x0a000002, 1234, 80);

        assert_eq!(pkt.ts, ts_from_secs(5));
        assert_eq!(pkt.len, 128);
        assert_eq!(pkt.l4_type, L4Type::Tcp);
        assert_eq!(pkt.ip_src(), Some(0x0a000001));
        assert_eq!(pkt.ip_dst(), Some(0x0a000002));
        assert_eq!(pkt.src_port(), Some(1234));
        assert_eq!(pkt.dst_port(), Some(80));
        assert_eq!(pkt.l4_proto(), 6);
    }

    #[test]
    fn test_batch_iterates_across_wrap() {
        let a = synth_packet(1, 60, 17, 1, 2, 10, 20);
        let b = synth_packet(2, 60, 17, 1, 2, 10, 20);
        let c = synth_packet(3, 60, 17, 1, 2, 10, 20);

        let head = vec![a, b];
        let tail = vec![c];
        let batch = Batch::new(&head, &tail);

        let order: Vec<u64> = batch.iter().map(|p| p.ts).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(batch.len(), 3);
    }
}
