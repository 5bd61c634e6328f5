//! Packet buffers and the metadata the tracker writes back into them.
//!
//! A [`Packet`] wraps an immutable frame and remembers where its network
//! header starts. Link-layer parsing happens once on construction; network
//! and transport parsing is done by tuple extraction, which only needs the
//! L3 slice.

pub mod builder;

use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;

pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_IPV6: u16 = 0x86DD;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_QINQ: u16 = 0x88A8;

/// Upper bound on stacked VLAN tags walked before giving up.
const MAX_VLAN_DEPTH: usize = 2;

/// Network layer family a batch is tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L3Type {
    Ipv4,
    Ipv6,
}

impl L3Type {
    pub fn ethertype(self) -> u16 {
        match self {
            L3Type::Ipv4 => ETH_TYPE_IPV4,
            L3Type::Ipv6 => ETH_TYPE_IPV6,
        }
    }

    pub fn from_ethertype(value: u16) -> Option<Self> {
        match value {
            ETH_TYPE_IPV4 => Some(L3Type::Ipv4),
            ETH_TYPE_IPV6 => Some(L3Type::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for L3Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L3Type::Ipv4 => write!(f, "ipv4"),
            L3Type::Ipv6 => write!(f, "ipv6"),
        }
    }
}

impl std::str::FromStr for L3Type {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipv4" | "ip" | "v4" => Ok(L3Type::Ipv4),
            "ipv6" | "v6" => Ok(L3Type::Ipv6),
            _ => Err(format!("Invalid L3 type: {}", s)),
        }
    }
}

bitflags! {
    /// Connection state bits stamped on every tracked packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CtState: u8 {
        const NEW = 1 << 0;
        const ESTABLISHED = 1 << 1;
        const RELATED = 1 << 2;
        const REPLY_DIR = 1 << 3;
        const INVALID = 1 << 4;
        const TRACKED = 1 << 5;
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CtState, &str); 6] = [
            (CtState::NEW, "new"),
            (CtState::ESTABLISHED, "est"),
            (CtState::RELATED, "rel"),
            (CtState::REPLY_DIR, "rpl"),
            (CtState::INVALID, "inv"),
            (CtState::TRACKED, "trk"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

bitflags! {
    /// TCP header control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

/// Per-packet connection tracking results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMetadata {
    pub ct_state: CtState,
    pub ct_zone: u16,
    pub ct_mark: u32,
    pub ct_labels: u128,
}

/// A frame plus its parsed link-layer view and tracking metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    dl_type: u16,
    l3_ofs: Option<usize>,
    pub md: PacketMetadata,
}

impl Packet {
    /// Wrap an Ethernet frame, skipping up to two VLAN tags.
    ///
    /// Truncated frames are kept; they simply have no network header and
    /// end up untrackable.
    pub fn from_ethernet(data: Bytes) -> Self {
        let (dl_type, l3_ofs) = parse_link_layer(&data);
        Self {
            data,
            dl_type,
            l3_ofs,
            md: PacketMetadata::default(),
        }
    }

    /// Wrap a bare network-layer packet (no link header).
    pub fn from_l3(data: Bytes, l3: L3Type) -> Self {
        Self {
            data,
            dl_type: l3.ethertype(),
            l3_ofs: Some(0),
            md: PacketMetadata::default(),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// EtherType of the network header, or 0 when none was found.
    #[inline]
    pub fn dl_type(&self) -> u16 {
        self.dl_type
    }

    /// Network header and everything after it.
    #[inline]
    pub fn l3(&self) -> Option<&[u8]> {
        self.l3_ofs.and_then(|ofs| self.data.get(ofs..))
    }

    /// Clear tracking results so the packet can be run through another zone.
    pub fn reset_metadata(&mut self) {
        self.md = PacketMetadata::default();
    }
}

fn parse_link_layer(frame: &[u8]) -> (u16, Option<usize>) {
    if frame.len() < ETH_HEADER_LEN {
        return (0, None);
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = ETH_HEADER_LEN;

    let mut depth = 0;
    while ethertype == ETH_TYPE_VLAN || ethertype == ETH_TYPE_QINQ {
        if depth == MAX_VLAN_DEPTH || frame.len() < offset + 4 {
            return (0, None);
        }
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
        depth += 1;
    }

    (ethertype, Some(offset))
}

/// RFC 1071 ones' complement sum, folded and inverted.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
