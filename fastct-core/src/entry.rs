//! Control-plane view of a connection and its text form.
//!
//! The rendering follows the familiar `conntrack` dump layout:
//!
//! ```text
//! udp,orig=(src=10.0.0.1,dst=10.0.0.2,sport=1000,dport=53),reply=(src=10.0.0.2,dst=10.0.0.1,sport=53,dport=1000),zone=3,timeout=25,protoinfo=(state=MULTIPLE)
//! ```

use crate::conn::{Conn, Counters, Direction};
use crate::proto::ProtoState;
use crate::tuple::{Tuple, Zone};
use chrono::{TimeZone, Utc};
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// Snapshot of one connection, detached from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtEntry {
    pub orig: Tuple,
    pub reply: Tuple,
    pub zone: Zone,
    pub id: u32,
    pub counters_orig: Counters,
    pub counters_reply: Counters,
    /// Wall-clock creation time in Unix milliseconds; zero if unknown.
    pub start_ms: u64,
    /// Whole seconds left before expiration.
    pub timeout_secs: u64,
    pub mark: u32,
    pub labels: u128,
    pub protoinfo: ProtoState,
    pub helper: Option<Arc<str>>,
}

impl CtEntry {
    pub fn from_conn(conn: &Conn, now: u64) -> Self {
        Self {
            orig: conn.key.tuple,
            reply: conn.reply,
            zone: conn.zone(),
            id: conn.id,
            counters_orig: conn.counters(Direction::Original),
            counters_reply: conn.counters(Direction::Reply),
            start_ms: conn.created_wall_ms,
            timeout_secs: conn.expiration.saturating_sub(now) / 1000,
            mark: conn.mark,
            labels: conn.labels,
            protoinfo: conn.proto,
            helper: conn.helper.clone(),
        }
    }

    /// Render as a single line.
    pub fn format(&self, opts: FormatOptions) -> String {
        let mut out = String::with_capacity(192);
        // Writing into a String cannot fail.
        let _ = self.write_to(&mut out, opts);
        out
    }

    fn write_to(&self, out: &mut String, opts: FormatOptions) -> fmt::Result {
        match proto_name(self.orig.proto) {
            Some(name) => out.push_str(name),
            None => write!(out, "{}", self.orig.proto)?,
        }

        write!(out, ",orig=({}", self.orig)?;
        write_counters(out, &self.counters_orig, opts)?;
        write!(out, "),reply=({}", self.reply)?;
        write_counters(out, &self.counters_reply, opts)?;
        out.push(')');

        if self.start_ms != 0 {
            if let Some(start) = Utc.timestamp_millis_opt(self.start_ms as i64).single() {
                write!(out, ",start={}", start.format("%Y-%m-%dT%H:%M:%S%.3f"))?;
            }
        }
        if opts.verbose {
            write!(out, ",id={}", self.id)?;
        }
        if self.zone != 0 {
            write!(out, ",zone={}", self.zone)?;
        }
        if self.timeout_secs != 0 {
            write!(out, ",timeout={}", self.timeout_secs)?;
        }
        if self.mark != 0 {
            write!(out, ",mark={}", self.mark)?;
        }
        if self.labels != 0 {
            write!(out, ",labels=0x{:x}", self.labels)?;
        }

        out.push_str(",protoinfo=(");
        match (&self.protoinfo, opts.verbose) {
            (ProtoState::Tcp(tcp), true) => write!(
                out,
                "state_orig={},state_reply={}",
                tcp.orig.name(),
                tcp.reply.name()
            )?,
            (state, _) => write!(out, "{}", state)?,
        }
        out.push(')');

        if let Some(helper) = &self.helper {
            write!(out, ",helper={}", helper)?;
        }
        Ok(())
    }
}

impl fmt::Display for CtEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(FormatOptions::default()))
    }
}

/// Knobs for [`CtEntry::format`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    /// Add the connection id and per-peer TCP states.
    pub verbose: bool,
    /// Add packet and byte counters.
    pub print_stats: bool,
}

fn write_counters(out: &mut String, counters: &Counters, opts: FormatOptions) -> fmt::Result {
    if opts.print_stats && counters.packets != 0 {
        write!(out, ",packets={},bytes={}", counters.packets, counters.bytes)?;
    }
    Ok(())
}

/// Conventional name of an IP protocol number.
pub fn proto_name(proto: u8) -> Option<&'static str> {
    Some(match proto {
        1 => "icmp",
        2 => "igmp",
        6 => "tcp",
        17 => "udp",
        33 => "dccp",
        58 => "icmpv6",
        132 => "sctp",
        136 => "udplite",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{OtherState, TcpPeerState, TcpState};
    use crate::tuple::{L4Fields, IPPROTO_TCP, IPPROTO_UDP};
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(proto: u8) -> Tuple {
        Tuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            proto,
            L4Fields::Ports {
                src: 1000,
                dst: 53,
            },
        )
    }

    fn entry(proto: u8, protoinfo: ProtoState) -> CtEntry {
        let orig = tuple(proto);
        CtEntry {
            orig,
            reply: orig.mirror(),
            zone: 0,
            id: 77,
            counters_orig: Counters::default(),
            counters_reply: Counters::default(),
            start_ms: 0,
            timeout_secs: 0,
            mark: 0,
            labels: 0,
            protoinfo,
            helper: None,
        }
    }

    #[test]
    fn test_minimal_udp_line() {
        let e = entry(IPPROTO_UDP, ProtoState::Other(OtherState::First));
        assert_eq!(
            e.to_string(),
            "udp,orig=(src=10.0.0.1,dst=10.0.0.2,sport=1000,dport=53),\
             reply=(src=10.0.0.2,dst=10.0.0.1,sport=53,dport=1000),\
             protoinfo=(state=FIRST)"
        );
    }

    #[test]
    fn test_optional_fields_in_order() {
        let mut e = entry(IPPROTO_UDP, ProtoState::Other(OtherState::Bidir));
        e.zone = 3;
        e.timeout_secs = 25;
        e.mark = 5;
        e.labels = 0xff;
        e.helper = Some(Arc::from("ftp"));
        e.start_ms = 1_000;
        let line = e.format(FormatOptions {
            verbose: true,
            print_stats: false,
        });
        assert!(line.ends_with(
            "start=1970-01-01T00:00:01.000,id=77,zone=3,timeout=25,mark=5,labels=0xff,\
             protoinfo=(state=BIDIR),helper=ftp"
        ));
    }

    #[test]
    fn test_stats_only_when_requested_and_nonzero() {
        let mut e = entry(IPPROTO_UDP, ProtoState::Other(OtherState::Multiple));
        e.counters_orig = Counters {
            packets: 2,
            bytes: 120,
        };
        let with = e.format(FormatOptions {
            verbose: false,
            print_stats: true,
        });
        assert!(with.contains("dport=53,packets=2,bytes=120)"));
        assert!(!with.contains("dport=1000,packets"));
        assert!(!e.format(FormatOptions::default()).contains("packets="));
    }

    #[test]
    fn test_tcp_protoinfo_verbose_and_compact() {
        let state = TcpState {
            orig: TcpPeerState::FinWait2,
            reply: TcpPeerState::Closing,
        };
        let e = entry(IPPROTO_TCP, ProtoState::Tcp(state));
        assert!(e
            .format(FormatOptions::default())
            .ends_with("protoinfo=(state=TIME_WAIT)"));
        assert!(e
            .format(FormatOptions {
                verbose: true,
                print_stats: false
            })
            .ends_with("protoinfo=(state_orig=FIN_WAIT_2,state_reply=CLOSING)"));
    }

    #[test]
    fn test_unknown_protocol_prints_number() {
        let mut e = entry(47, ProtoState::Other(OtherState::First));
        e.orig.l4 = L4Fields::Ports { src: 0, dst: 0 };
        e.reply = e.orig.mirror();
        assert!(e
            .to_string()
            .starts_with("47,orig=(src=10.0.0.1,dst=10.0.0.2),reply="));
        assert_eq!(proto_name(58), Some("icmpv6"));
    }
}
