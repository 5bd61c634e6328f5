//! Synthetic frame construction for tests, benchmarks and traffic replay.
//!
//! Produces well-formed Ethernet/IP frames with correct IPv4 header
//! checksums. Transport checksums are left zero except for ICMPv4.

use super::{internet_checksum, TcpFlags, ETH_TYPE_IPV4, ETH_TYPE_IPV6, ETH_TYPE_VLAN};
use bytes::{BufMut, Bytes, BytesMut};

const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

#[derive(Debug, Clone)]
enum Net {
    V4 { src: [u8; 4], dst: [u8; 4] },
    V6 { src: [u8; 16], dst: [u8; 16] },
}

#[derive(Debug, Clone)]
enum Transport {
    Udp { sport: u16, dport: u16 },
    Tcp { sport: u16, dport: u16, flags: TcpFlags },
    Icmp { ty: u8, code: u8, id: u16 },
    IcmpError { ty: u8, code: u8, inner: Bytes },
    Raw { proto: u8 },
}

/// Builder for a single frame.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    net: Net,
    transport: Transport,
    payload_len: usize,
    vlan: Option<u16>,
    fragment: bool,
    bad_checksum: bool,
}

impl FrameBuilder {
    fn new(net: Net, transport: Transport) -> Self {
        Self {
            net,
            transport,
            payload_len: 0,
            vlan: None,
            fragment: false,
            bad_checksum: false,
        }
    }

    pub fn udp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Self {
        Self::new(Net::V4 { src, dst }, Transport::Udp { sport, dport })
    }

    pub fn tcp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: TcpFlags) -> Self {
        Self::new(
            Net::V4 { src, dst },
            Transport::Tcp {
                sport,
                dport,
                flags,
            },
        )
    }

    /// ICMPv4 echo request (or reply when `reply` is set).
    pub fn icmp4_echo(src: [u8; 4], dst: [u8; 4], id: u16, reply: bool) -> Self {
        let ty = if reply { 0 } else { 8 };
        Self::new(Net::V4 { src, dst }, Transport::Icmp { ty, code: 0, id })
    }

    /// ICMPv4 error quoting `inner`, a bare IPv4 packet.
    pub fn icmp4_error(src: [u8; 4], dst: [u8; 4], ty: u8, code: u8, inner: Bytes) -> Self {
        Self::new(
            Net::V4 { src, dst },
            Transport::IcmpError { ty, code, inner },
        )
    }

    /// IPv4 packet with an arbitrary protocol number and no transport header.
    pub fn proto4(src: [u8; 4], dst: [u8; 4], proto: u8) -> Self {
        Self::new(Net::V4 { src, dst }, Transport::Raw { proto })
    }

    pub fn udp6(src: [u8; 16], dst: [u8; 16], sport: u16, dport: u16) -> Self {
        Self::new(Net::V6 { src, dst }, Transport::Udp { sport, dport })
    }

    pub fn tcp6(src: [u8; 16], dst: [u8; 16], sport: u16, dport: u16, flags: TcpFlags) -> Self {
        Self::new(
            Net::V6 { src, dst },
            Transport::Tcp {
                sport,
                dport,
                flags,
            },
        )
    }

    /// ICMPv6 echo request (128) or reply (129).
    pub fn icmp6_echo(src: [u8; 16], dst: [u8; 16], id: u16, reply: bool) -> Self {
        let ty = if reply { 129 } else { 128 };
        Self::new(Net::V6 { src, dst }, Transport::Icmp { ty, code: 0, id })
    }

    pub fn payload(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    pub fn vlan(mut self, vlan_id: u16) -> Self {
        self.vlan = Some(vlan_id & 0x0FFF);
        self
    }

    /// Mark the packet as a non-initial fragment.
    pub fn fragment(mut self) -> Self {
        self.fragment = true;
        self
    }

    /// Corrupt the IPv4 header checksum.
    pub fn bad_checksum(mut self) -> Self {
        self.bad_checksum = true;
        self
    }

    /// Ethernet frame.
    pub fn build(&self) -> Bytes {
        let l3 = self.build_l3();
        let mut frame = BytesMut::with_capacity(l3.len() + 18);
        frame.put_slice(&DST_MAC);
        frame.put_slice(&SRC_MAC);
        if let Some(vid) = self.vlan {
            frame.put_u16(ETH_TYPE_VLAN);
            frame.put_u16(vid);
        }
        frame.put_u16(match self.net {
            Net::V4 { .. } => ETH_TYPE_IPV4,
            Net::V6 { .. } => ETH_TYPE_IPV6,
        });
        frame.put_slice(&l3);
        frame.freeze()
    }

    /// Network-layer packet without a link header.
    pub fn build_l3(&self) -> Bytes {
        let is_v6 = matches!(self.net, Net::V6 { .. });
        let (proto, l4) = self.build_l4(is_v6);

        let mut out = BytesMut::with_capacity(l4.len() + 48);
        match self.net {
            Net::V4 { src, dst } => {
                let total = (20 + l4.len()) as u16;
                let frag: u16 = if self.fragment { 0x2000 | 0x0010 } else { 0x4000 };
                let mut header = [0u8; 20];
                header[0] = 0x45;
                header[2..4].copy_from_slice(&total.to_be_bytes());
                header[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
                header[6..8].copy_from_slice(&frag.to_be_bytes());
                header[8] = 64;
                header[9] = proto;
                header[12..16].copy_from_slice(&src);
                header[16..20].copy_from_slice(&dst);
                let mut csum = internet_checksum(&header);
                if self.bad_checksum {
                    csum ^= 0x0101;
                }
                header[10..12].copy_from_slice(&csum.to_be_bytes());
                out.put_slice(&header);
            }
            Net::V6 { src, dst } => {
                let frag_len = if self.fragment { 8 } else { 0 };
                out.put_u32(0x6000_0000);
                out.put_u16((l4.len() + frag_len) as u16);
                out.put_u8(if self.fragment { 44 } else { proto });
                out.put_u8(64);
                out.put_slice(&src);
                out.put_slice(&dst);
                if self.fragment {
                    out.put_u8(proto);
                    out.put_u8(0);
                    out.put_u16(0x0008);
                    out.put_u32(0xCAFE);
                }
            }
        }
        out.put_slice(&l4);
        out.freeze()
    }

    fn build_l4(&self, is_v6: bool) -> (u8, BytesMut) {
        let payload = vec![0xABu8; self.payload_len];
        let icmp_proto = if is_v6 { 58 } else { 1 };
        let mut l4 = BytesMut::with_capacity(self.payload_len + 20);

        let proto = match &self.transport {
            Transport::Udp { sport, dport } => {
                l4.put_u16(*sport);
                l4.put_u16(*dport);
                l4.put_u16((8 + payload.len()) as u16);
                l4.put_u16(0);
                17
            }
            Transport::Tcp {
                sport,
                dport,
                flags,
            } => {
                l4.put_u16(*sport);
                l4.put_u16(*dport);
                l4.put_u32(0x0102_0304);
                l4.put_u32(0);
                l4.put_u8(5 << 4);
                l4.put_u8(flags.bits());
                l4.put_u16(65535);
                l4.put_u16(0);
                l4.put_u16(0);
                6
            }
            Transport::Icmp { ty, code, id } => {
                l4.put_u8(*ty);
                l4.put_u8(*code);
                l4.put_u16(0);
                l4.put_u16(*id);
                l4.put_u16(1);
                icmp_proto
            }
            Transport::IcmpError { ty, code, inner } => {
                l4.put_u8(*ty);
                l4.put_u8(*code);
                l4.put_u16(0);
                l4.put_u32(0);
                l4.put_slice(inner);
                icmp_proto
            }
            Transport::Raw { proto } => *proto,
        };
        l4.put_slice(&payload);

        if !is_v6 && proto == 1 {
            let csum = internet_checksum(&l4);
            l4[2..4].copy_from_slice(&csum.to_be_bytes());
        }

        (proto, l4)
    }
}
