//! Per-protocol connection state machines.
//!
//! The set of protocols is closed: a connection's variant is chosen once,
//! from the IP protocol number of its first packet, and stored on the
//! connection as a [`ProtoState`]. Later packets dispatch on that tag.

mod icmp;
mod other;
mod tcp;

pub use icmp::IcmpState;
pub use other::OtherState;
pub use tcp::{TcpPeerState, TcpState};

use crate::timeout::TimeoutClass;
use crate::tuple::{PacketView, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP};
use std::fmt;

/// Outcome of feeding a packet to an existing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Packet conforms; expiration is refreshed.
    Valid,
    /// Packet contradicts the tracked state; nothing was changed.
    Invalid,
    /// Connection must be retired and the packet treated as unmatched.
    New,
}

/// Protocol variant, resolved from an IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Icmp,
    /// UDP and every protocol without a dedicated machine.
    Other,
}

impl L4Proto {
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            IPPROTO_TCP => L4Proto::Tcp,
            IPPROTO_ICMP | IPPROTO_ICMPV6 => L4Proto::Icmp,
            _ => L4Proto::Other,
        }
    }

    /// May this packet create a connection?
    pub fn valid_new(self, view: &PacketView, tcp_strict: bool) -> bool {
        match self {
            L4Proto::Tcp => tcp::valid_new(view.tcp_flags, tcp_strict),
            L4Proto::Icmp | L4Proto::Other => true,
        }
    }

    /// Initial state and timeout class for a connection opened by `view`.
    pub fn new_conn(self, view: &PacketView) -> (ProtoState, TimeoutClass) {
        match self {
            L4Proto::Tcp => (
                ProtoState::Tcp(TcpState::new(view.tcp_flags)),
                TimeoutClass::TcpFirstPacket,
            ),
            L4Proto::Icmp => (ProtoState::Icmp(IcmpState::First), TimeoutClass::IcmpFirst),
            L4Proto::Other => (
                ProtoState::Other(OtherState::First),
                TimeoutClass::OtherFirst,
            ),
        }
    }
}

/// Protocol sub-state carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoState {
    Tcp(TcpState),
    Icmp(IcmpState),
    Other(OtherState),
}

impl ProtoState {
    /// Advance the state machine. `reply` is true for packets matching the
    /// connection's reply tuple.
    pub fn update(&mut self, view: &PacketView, reply: bool) -> UpdateResult {
        match self {
            ProtoState::Tcp(state) => state.update(view.tcp_flags, reply),
            ProtoState::Icmp(state) => state.update(reply),
            ProtoState::Other(state) => state.update(reply),
        }
    }

    /// Class matching the current sub-state.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            ProtoState::Tcp(state) => state.timeout_class(),
            ProtoState::Icmp(state) => state.timeout_class(),
            ProtoState::Other(state) => state.timeout_class(),
        }
    }

    pub fn l4_proto(&self) -> L4Proto {
        match self {
            ProtoState::Tcp(_) => L4Proto::Tcp,
            ProtoState::Icmp(_) => L4Proto::Icmp,
            ProtoState::Other(_) => L4Proto::Other,
        }
    }
}

impl fmt::Display for ProtoState {
    /// Compact rendering; TCP shows the coalesced state of both peers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoState::Tcp(state) => write!(f, "state={}", state.coalesced().name()),
            ProtoState::Icmp(state) => write!(f, "state={}", state.name()),
            ProtoState::Other(state) => write!(f, "state={}", state.name()),
        }
    }
}
