//! Connection tuples, keys and the salted symmetric hash.
//!
//! A [`Tuple`] identifies one direction of a conversation. Its mirror swaps
//! the endpoints (and, for ICMP queries, the request/reply type), so the
//! mirror of a connection's original tuple matches the packets flowing back.
//! Hashing canonicalizes a tuple against its mirror first: both directions
//! land in the same bucket without a second lookup.

use crate::error::{Error, Result};
use crate::packet::{internet_checksum, L3Type, Packet, TcpFlags};
use siphasher::sip::SipHasher13;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Conntrack zone identifier.
pub type Zone = u16;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

/// Transport identity of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum L4Fields {
    /// Port pair; both zero for protocols without ports.
    Ports { src: u16, dst: u16 },
    /// ICMP query identity.
    Icmp { id: u16, ty: u8, code: u8 },
}

/// One direction of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub l4: L4Fields,
}

impl Tuple {
    pub fn new(src: IpAddr, dst: IpAddr, proto: u8, l4: L4Fields) -> Self {
        Self {
            src,
            dst,
            proto,
            l4,
        }
    }

    /// Tuple of the opposite direction. Applying it twice is the identity.
    pub fn mirror(&self) -> Tuple {
        let l4 = match self.l4 {
            L4Fields::Ports { src, dst } => L4Fields::Ports { src: dst, dst: src },
            L4Fields::Icmp { id, ty, code } => L4Fields::Icmp {
                id,
                ty: reverse_icmp_type(self.proto, ty),
                code,
            },
        };
        Tuple {
            src: self.dst,
            dst: self.src,
            proto: self.proto,
            l4,
        }
    }

    pub fn l3_type(&self) -> L3Type {
        match self.src {
            IpAddr::V4(_) => L3Type::Ipv4,
            IpAddr::V6(_) => L3Type::Ipv6,
        }
    }

    /// Direction-independent representative: the smaller of self and mirror.
    fn canonical(&self) -> Tuple {
        let mirrored = self.mirror();
        if mirrored < *self {
            mirrored
        } else {
            *self
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src={},dst={}", self.src, self.dst)?;
        match self.l4 {
            L4Fields::Icmp { id, ty, code } => write!(f, ",id={},type={},code={}", id, ty, code),
            L4Fields::Ports { src, dst } if has_ports(self.proto) => {
                write!(f, ",sport={},dport={}", src, dst)
            }
            L4Fields::Ports { .. } => Ok(()),
        }
    }
}

fn has_ports(proto: u8) -> bool {
    matches!(proto, IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP | 33 | 136)
}

/// Reply counterpart of an ICMP query type; other types map to themselves.
pub fn reverse_icmp_type(proto: u8, ty: u8) -> u8 {
    if proto == IPPROTO_ICMPV6 {
        return match ty {
            128 => 129,
            129 => 128,
            other => other,
        };
    }
    match ty {
        8 => 0,
        0 => 8,
        13 => 14,
        14 => 13,
        15 => 16,
        16 => 15,
        17 => 18,
        18 => 17,
        other => other,
    }
}

/// Lookup key: a tuple scoped to a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub tuple: Tuple,
    pub zone: Zone,
}

impl ConnKey {
    pub fn new(tuple: Tuple, zone: Zone) -> Self {
        Self { tuple, zone }
    }

    pub fn mirror(&self) -> ConnKey {
        ConnKey {
            tuple: self.tuple.mirror(),
            zone: self.zone,
        }
    }
}

/// Salt for the table hash.
#[derive(Clone, Copy)]
pub struct HashBasis {
    k0: u64,
    k1: u64,
}

impl HashBasis {
    /// Draw a fresh salt from the operating system.
    pub fn random() -> Result<Self> {
        let mut seed = [0u8; 16];
        getrandom::getrandom(&mut seed).map_err(|e| Error::Random(e.to_string()))?;
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&seed[..8]);
        k1.copy_from_slice(&seed[8..]);
        Ok(Self {
            k0: u64::from_le_bytes(k0),
            k1: u64::from_le_bytes(k1),
        })
    }

    /// Deterministic salt, for reproducible bucket placement.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            k0: seed,
            k1: seed.rotate_left(32) ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Symmetric hash: a key and its mirror hash identically.
    pub fn hash(&self, key: &ConnKey) -> u32 {
        let mut hasher = SipHasher13::new_with_keys(self.k0, self.k1);
        key.tuple.canonical().hash(&mut hasher);
        key.zone.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

impl fmt::Debug for HashBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HashBasis(..)")
    }
}

/// Fields of the packet the protocol state machines look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketView {
    pub tcp_flags: TcpFlags,
    pub icmp_type: u8,
    /// Bytes counted against the connection (network header onwards).
    pub l3_len: u32,
}

/// Result of tuple extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extracted {
    pub key: ConnKey,
    pub view: PacketView,
    /// ICMP error: `key` is the quoted packet's reply tuple and may only
    /// match an existing connection.
    pub related: bool,
}

/// Build the connection key for `pkt` when tracked as `l3` traffic in `zone`.
pub fn extract(pkt: &Packet, l3: L3Type, zone: Zone, verify_checksums: bool) -> Result<Extracted> {
    if pkt.dl_type() != l3.ethertype() {
        return Err(Error::Malformed("network type mismatch"));
    }
    let bytes = pkt.l3().ok_or(Error::Malformed("missing network header"))?;
    let net = match l3 {
        L3Type::Ipv4 => parse_ipv4(bytes, true, verify_checksums)?,
        L3Type::Ipv6 => parse_ipv6(bytes, true)?,
    };

    let mut view = PacketView {
        l3_len: net.total_len as u32,
        ..PacketView::default()
    };

    let l4 = match net.proto {
        IPPROTO_TCP => {
            let (ports, flags) = parse_tcp(net.payload)?;
            view.tcp_flags = flags;
            ports
        }
        IPPROTO_UDP => parse_udp(net.payload)?,
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            let icmp = parse_icmp(net.proto, net.payload)?;
            view.icmp_type = icmp.ty;
            match icmp.kind {
                IcmpKind::Query(fields) => fields,
                IcmpKind::Error(inner) => {
                    let quoted = parse_quoted(l3, inner)?;
                    return Ok(Extracted {
                        key: ConnKey::new(quoted.mirror(), zone),
                        view,
                        related: true,
                    });
                }
            }
        }
        _ => L4Fields::Ports { src: 0, dst: 0 },
    };

    Ok(Extracted {
        key: ConnKey::new(Tuple::new(net.src, net.dst, net.proto, l4), zone),
        view,
        related: false,
    })
}

struct NetHeader<'a> {
    src: IpAddr,
    dst: IpAddr,
    proto: u8,
    total_len: usize,
    payload: &'a [u8],
}

/// `strict` enforces length consistency; quoted headers inside ICMP errors
/// are routinely truncated and are parsed without it.
fn parse_ipv4(bytes: &[u8], strict: bool, verify_checksum: bool) -> Result<NetHeader<'_>> {
    if bytes.len() < 20 {
        return Err(Error::Malformed("truncated ipv4 header"));
    }
    if bytes[0] >> 4 != 4 {
        return Err(Error::Malformed("bad ipv4 version"));
    }
    let ihl = usize::from(bytes[0] & 0x0F) * 4;
    if ihl < 20 || ihl > bytes.len() {
        return Err(Error::Malformed("bad ipv4 header length"));
    }
    let total_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    let end = if strict {
        if total_len < ihl || total_len > bytes.len() {
            return Err(Error::Malformed("bad ipv4 total length"));
        }
        total_len
    } else {
        total_len.clamp(ihl, bytes.len())
    };
    if verify_checksum && internet_checksum(&bytes[..ihl]) != 0 {
        return Err(Error::Malformed("bad ipv4 checksum"));
    }
    let frag = u16::from_be_bytes([bytes[6], bytes[7]]);
    if frag & 0x3FFF != 0 {
        return Err(Error::Malformed("ipv4 fragment"));
    }

    let src = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
    let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);
    Ok(NetHeader {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        proto: bytes[9],
        total_len,
        payload: &bytes[ihl..end],
    })
}

fn parse_ipv6(bytes: &[u8], strict: bool) -> Result<NetHeader<'_>> {
    const MAX_EXT_HEADERS: usize = 8;

    if bytes.len() < 40 {
        return Err(Error::Malformed("truncated ipv6 header"));
    }
    if bytes[0] >> 4 != 6 {
        return Err(Error::Malformed("bad ipv6 version"));
    }
    let payload_len = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
    let end = if strict {
        if 40 + payload_len > bytes.len() {
            return Err(Error::Malformed("bad ipv6 payload length"));
        }
        40 + payload_len
    } else {
        (40 + payload_len).min(bytes.len())
    };

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&bytes[8..24]);
    dst.copy_from_slice(&bytes[24..40]);

    let mut next = bytes[6];
    let mut offset = 40;
    for _ in 0..MAX_EXT_HEADERS {
        let ext_len = match next {
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                if offset + 2 > end {
                    return Err(Error::Malformed("truncated ipv6 extension header"));
                }
                (usize::from(bytes[offset + 1]) + 1) * 8
            }
            // authentication header
            51 => {
                if offset + 2 > end {
                    return Err(Error::Malformed("truncated ipv6 extension header"));
                }
                (usize::from(bytes[offset + 1]) + 2) * 4
            }
            44 => return Err(Error::Malformed("ipv6 fragment")),
            _ => break,
        };
        if offset + ext_len > end {
            return Err(Error::Malformed("truncated ipv6 extension header"));
        }
        next = bytes[offset];
        offset += ext_len;
    }

    Ok(NetHeader {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        proto: next,
        total_len: 40 + payload_len,
        payload: &bytes[offset..end],
    })
}

fn parse_tcp(bytes: &[u8]) -> Result<(L4Fields, TcpFlags)> {
    if bytes.len() < 20 {
        return Err(Error::Malformed("truncated tcp header"));
    }
    let data_offset = usize::from(bytes[12] >> 4) * 4;
    if data_offset < 20 || data_offset > bytes.len() {
        return Err(Error::Malformed("bad tcp data offset"));
    }
    Ok((ports(bytes), TcpFlags::from_bits_retain(bytes[13])))
}

fn parse_udp(bytes: &[u8]) -> Result<L4Fields> {
    if bytes.len() < 8 {
        return Err(Error::Malformed("truncated udp header"));
    }
    Ok(ports(bytes))
}

fn ports(bytes: &[u8]) -> L4Fields {
    L4Fields::Ports {
        src: u16::from_be_bytes([bytes[0], bytes[1]]),
        dst: u16::from_be_bytes([bytes[2], bytes[3]]),
    }
}

enum IcmpKind<'a> {
    Query(L4Fields),
    /// Error message quoting the offending packet.
    Error(&'a [u8]),
}

struct IcmpMessage<'a> {
    ty: u8,
    kind: IcmpKind<'a>,
}

fn parse_icmp(proto: u8, bytes: &[u8]) -> Result<IcmpMessage<'_>> {
    if bytes.len() < 8 {
        return Err(Error::Malformed("truncated icmp header"));
    }
    let ty = bytes[0];
    let code = bytes[1];
    let id = u16::from_be_bytes([bytes[4], bytes[5]]);

    let is_query = match proto {
        IPPROTO_ICMPV6 => matches!(ty, 128 | 129),
        _ => matches!(ty, 0 | 8 | 13 | 14 | 15 | 16 | 17 | 18),
    };
    let is_error = match proto {
        IPPROTO_ICMPV6 => matches!(ty, 1..=4),
        _ => matches!(ty, 3 | 4 | 5 | 11 | 12),
    };

    let kind = if is_query {
        IcmpKind::Query(L4Fields::Icmp { id, ty, code })
    } else if is_error {
        IcmpKind::Error(&bytes[8..])
    } else {
        return Err(Error::Malformed("untracked icmp type"));
    };
    Ok(IcmpMessage { ty, kind })
}

/// Tuple of the packet quoted inside an ICMP error.
fn parse_quoted(l3: L3Type, bytes: &[u8]) -> Result<Tuple> {
    let net = match l3 {
        L3Type::Ipv4 => parse_ipv4(bytes, false, false)?,
        L3Type::Ipv6 => parse_ipv6(bytes, false)?,
    };
    if net.payload.len() < 8 {
        return Err(Error::Malformed("truncated quoted transport header"));
    }
    let l4 = match net.proto {
        IPPROTO_TCP | IPPROTO_UDP => ports(net.payload),
        IPPROTO_ICMP | IPPROTO_ICMPV6 => match parse_icmp(net.proto, net.payload)?.kind {
            IcmpKind::Query(fields) => fields,
            IcmpKind::Error(_) => return Err(Error::Malformed("nested icmp error")),
        },
        _ => L4Fields::Ports { src: 0, dst: 0 },
    };
    Ok(Tuple::new(net.src, net.dst, net.proto, l4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::builder::FrameBuilder;
    use proptest::prelude::*;

    const A: [u8; 4] = [192, 168, 1, 10];
    const B: [u8; 4] = [10, 1, 2, 3];

    fn extract_v4(frame: bytes::Bytes) -> Result<Extracted> {
        extract(&Packet::from_ethernet(frame), L3Type::Ipv4, 0, true)
    }

    // ===== Mirroring =====

    #[test]
    fn test_mirror_swaps_ports() {
        let t = Tuple::new(
            IpAddr::from(A),
            IpAddr::from(B),
            IPPROTO_UDP,
            L4Fields::Ports { src: 1000, dst: 53 },
        );
        let m = t.mirror();
        assert_eq!(m.src, IpAddr::from(B));
        assert_eq!(m.l4, L4Fields::Ports { src: 53, dst: 1000 });
        assert_eq!(m.mirror(), t);
    }

    #[test]
    fn test_mirror_reverses_icmp_query_type() {
        let t = Tuple::new(
            IpAddr::from(A),
            IpAddr::from(B),
            IPPROTO_ICMP,
            L4Fields::Icmp { id: 7, ty: 8, code: 0 },
        );
        assert_eq!(t.mirror().l4, L4Fields::Icmp { id: 7, ty: 0, code: 0 });
        assert_eq!(reverse_icmp_type(IPPROTO_ICMPV6, 128), 129);
        assert_eq!(reverse_icmp_type(IPPROTO_ICMP, 3), 3);
    }

    #[test]
    fn test_mirror_and_hash_properties() {
        let basis = HashBasis::from_seed(42);
        proptest!(|(a in any::<u32>(), b in any::<u32>(), sp in any::<u16>(), dp in any::<u16>(),
                    proto in prop::sample::select(vec![IPPROTO_TCP, IPPROTO_UDP, 47u8]),
                    zone in any::<u16>())| {
            let t = Tuple::new(
                IpAddr::V4(Ipv4Addr::from(a)),
                IpAddr::V4(Ipv4Addr::from(b)),
                proto,
                L4Fields::Ports { src: sp, dst: dp },
            );
            let key = ConnKey::new(t, zone);
            prop_assert_eq!(t.mirror().mirror(), t);
            prop_assert_eq!(basis.hash(&key), basis.hash(&key.mirror()));
        });
    }

    #[test]
    fn test_zone_changes_hash() {
        let basis = HashBasis::from_seed(7);
        let t = Tuple::new(
            IpAddr::from(A),
            IpAddr::from(B),
            IPPROTO_UDP,
            L4Fields::Ports { src: 1, dst: 2 },
        );
        let hashes: std::collections::HashSet<u32> =
            (0..16).map(|z| basis.hash(&ConnKey::new(t, z))).collect();
        assert!(hashes.len() > 1);
    }

    // ===== Extraction =====

    #[test]
    fn test_extract_udp() {
        let ex = extract_v4(FrameBuilder::udp4(A, B, 1000, 53).payload(12).build()).unwrap();
        assert!(!ex.related);
        assert_eq!(ex.key.tuple.proto, IPPROTO_UDP);
        assert_eq!(ex.key.tuple.l4, L4Fields::Ports { src: 1000, dst: 53 });
        assert_eq!(ex.view.l3_len, 20 + 8 + 12);
    }

    #[test]
    fn test_extract_tcp_flags() {
        let ex = extract_v4(FrameBuilder::tcp4(A, B, 40000, 80, TcpFlags::SYN).build()).unwrap();
        assert_eq!(ex.view.tcp_flags, TcpFlags::SYN);
    }

    #[test]
    fn test_extract_other_protocol_has_zero_ports() {
        let ex = extract_v4(FrameBuilder::proto4(A, B, 47).payload(4).build()).unwrap();
        assert_eq!(ex.key.tuple.proto, 47);
        assert_eq!(ex.key.tuple.l4, L4Fields::Ports { src: 0, dst: 0 });
    }

    #[test]
    fn test_extract_rejects_wrong_family() {
        let err = extract(
            &Packet::from_ethernet(FrameBuilder::udp4(A, B, 1, 2).build()),
            L3Type::Ipv6,
            0,
            true,
        )
        .unwrap_err();
        assert_eq!(err, Error::Malformed("network type mismatch"));
    }

    #[test]
    fn test_extract_rejects_bad_checksum_only_when_verifying() {
        let frame = FrameBuilder::udp4(A, B, 1, 2).bad_checksum().build();
        assert_eq!(
            extract_v4(frame.clone()).unwrap_err(),
            Error::Malformed("bad ipv4 checksum")
        );
        assert!(extract(&Packet::from_ethernet(frame), L3Type::Ipv4, 0, false).is_ok());
    }

    #[test]
    fn test_extract_rejects_fragments() {
        let v4 = FrameBuilder::udp4(A, B, 1, 2).fragment().build();
        assert_eq!(extract_v4(v4).unwrap_err(), Error::Malformed("ipv4 fragment"));

        let v6 = FrameBuilder::udp6([1; 16], [2; 16], 1, 2).fragment().build();
        assert_eq!(
            extract(&Packet::from_ethernet(v6), L3Type::Ipv6, 0, true).unwrap_err(),
            Error::Malformed("ipv6 fragment")
        );
    }

    #[test]
    fn test_extract_truncated_transport() {
        let mut frame = FrameBuilder::tcp4(A, B, 1, 2, TcpFlags::SYN).build().to_vec();
        // keep ethernet + ip + 10 bytes of tcp, and fix up the ip total length
        frame.truncate(14 + 20 + 10);
        frame[16..18].copy_from_slice(&30u16.to_be_bytes());
        frame[24..26].copy_from_slice(&[0, 0]);
        let csum = internet_checksum(&frame[14..34]);
        frame[24..26].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(
            extract_v4(bytes::Bytes::from(frame)).unwrap_err(),
            Error::Malformed("truncated tcp header")
        );
    }

    #[test]
    fn test_extract_ipv6_udp() {
        let pkt = Packet::from_ethernet(FrameBuilder::udp6([1; 16], [2; 16], 5000, 443).build());
        let ex = extract(&pkt, L3Type::Ipv6, 3, true).unwrap();
        assert_eq!(ex.key.zone, 3);
        assert_eq!(ex.key.tuple.l3_type(), L3Type::Ipv6);
        assert_eq!(ex.key.tuple.l4, L4Fields::Ports { src: 5000, dst: 443 });
    }

    #[test]
    fn test_extract_icmp_echo() {
        let ex = extract_v4(FrameBuilder::icmp4_echo(A, B, 99, false).build()).unwrap();
        assert_eq!(ex.key.tuple.l4, L4Fields::Icmp { id: 99, ty: 8, code: 0 });
        let reply = extract_v4(FrameBuilder::icmp4_echo(B, A, 99, true).build()).unwrap();
        assert_eq!(reply.key.tuple, ex.key.tuple.mirror());
    }

    #[test]
    fn test_extract_icmp_error_is_related() {
        let inner = FrameBuilder::udp4(A, B, 1000, 53).build_l3();
        let frame = FrameBuilder::icmp4_error([172, 16, 0, 1], A, 3, 3, inner).build();
        let ex = extract_v4(frame).unwrap();
        assert!(ex.related);
        // quoted packet went A -> B; the error travels back, so the key is B -> A
        assert_eq!(ex.key.tuple.src, IpAddr::from(B));
        assert_eq!(ex.key.tuple.dst, IpAddr::from(A));
        assert_eq!(ex.key.tuple.l4, L4Fields::Ports { src: 53, dst: 1000 });
    }

    #[test]
    fn test_tuple_display() {
        let t = Tuple::new(
            IpAddr::from(A),
            IpAddr::from(B),
            IPPROTO_TCP,
            L4Fields::Ports { src: 1, dst: 2 },
        );
        assert_eq!(t.to_string(), "src=192.168.1.10,dst=10.1.2.3,sport=1,dport=2");
        let other = Tuple::new(IpAddr::from(A), IpAddr::from(B), 47, L4Fields::Ports { src: 0, dst: 0 });
        assert_eq!(other.to_string(), "src=192.168.1.10,dst=10.1.2.3");
    }
}
