//! Timeout classes and the configurable policy that prices them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest accepted timeout, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = u32::MAX as u64;

/// Expiration list a connection sits on. Each protocol sub-state maps to
/// exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutClass {
    TcpFirstPacket,
    TcpOpening,
    TcpEstablished,
    TcpClosing,
    TcpFinWait,
    TcpClosed,
    OtherFirst,
    OtherMultiple,
    OtherBidir,
    IcmpFirst,
    IcmpReply,
}

impl TimeoutClass {
    pub const COUNT: usize = 11;

    pub const ALL: [TimeoutClass; Self::COUNT] = [
        TimeoutClass::TcpFirstPacket,
        TimeoutClass::TcpOpening,
        TimeoutClass::TcpEstablished,
        TimeoutClass::TcpClosing,
        TimeoutClass::TcpFinWait,
        TimeoutClass::TcpClosed,
        TimeoutClass::OtherFirst,
        TimeoutClass::OtherMultiple,
        TimeoutClass::OtherBidir,
        TimeoutClass::IcmpFirst,
        TimeoutClass::IcmpReply,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TimeoutClass::TcpFirstPacket => "tcp_first_packet",
            TimeoutClass::TcpOpening => "tcp_opening",
            TimeoutClass::TcpEstablished => "tcp_established",
            TimeoutClass::TcpClosing => "tcp_closing",
            TimeoutClass::TcpFinWait => "tcp_fin_wait",
            TimeoutClass::TcpClosed => "tcp_closed",
            TimeoutClass::OtherFirst => "other_first",
            TimeoutClass::OtherMultiple => "other_multiple",
            TimeoutClass::OtherBidir => "other_bidir",
            TimeoutClass::IcmpFirst => "icmp_first",
            TimeoutClass::IcmpReply => "icmp_reply",
        }
    }
}

impl fmt::Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timeout for each class, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub tcp_first_packet: u64,
    pub tcp_opening: u64,
    pub tcp_established: u64,
    pub tcp_closing: u64,
    pub tcp_fin_wait: u64,
    pub tcp_closed: u64,
    pub other_first: u64,
    pub other_multiple: u64,
    pub other_bidir: u64,
    pub icmp_first: u64,
    pub icmp_reply: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            tcp_first_packet: 30,
            tcp_opening: 30,
            tcp_established: 24 * 60 * 60,
            tcp_closing: 15 * 60,
            tcp_fin_wait: 45,
            tcp_closed: 30,
            other_first: 60,
            other_multiple: 60,
            other_bidir: 30,
            icmp_first: 60,
            icmp_reply: 30,
        }
    }
}

impl TimeoutPolicy {
    pub fn secs(&self, class: TimeoutClass) -> u64 {
        match class {
            TimeoutClass::TcpFirstPacket => self.tcp_first_packet,
            TimeoutClass::TcpOpening => self.tcp_opening,
            TimeoutClass::TcpEstablished => self.tcp_established,
            TimeoutClass::TcpClosing => self.tcp_closing,
            TimeoutClass::TcpFinWait => self.tcp_fin_wait,
            TimeoutClass::TcpClosed => self.tcp_closed,
            TimeoutClass::OtherFirst => self.other_first,
            TimeoutClass::OtherMultiple => self.other_multiple,
            TimeoutClass::OtherBidir => self.other_bidir,
            TimeoutClass::IcmpFirst => self.icmp_first,
            TimeoutClass::IcmpReply => self.icmp_reply,
        }
    }

    #[inline]
    pub fn millis(&self, class: TimeoutClass) -> u64 {
        self.secs(class).saturating_mul(1000)
    }

    /// Smallest configured timeout: the longest a bucket may go unswept.
    pub fn min_millis(&self) -> u64 {
        TimeoutClass::ALL
            .iter()
            .map(|c| self.millis(*c))
            .min()
            .unwrap_or(30_000)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for class in TimeoutClass::ALL {
            match self.secs(class) {
                0 => errors.push(format!("timeout {} must be at least 1 second", class)),
                secs if secs > MAX_TIMEOUT_SECS => errors.push(format!(
                    "timeout {} must be at most {} seconds (got {})",
                    class, MAX_TIMEOUT_SECS, secs
                )),
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.millis(TimeoutClass::OtherFirst), 60_000);
        assert_eq!(policy.millis(TimeoutClass::OtherBidir), 30_000);
        assert_eq!(policy.millis(TimeoutClass::TcpEstablished), 86_400_000);
        assert_eq!(policy.min_millis(), 30_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_class_indices_are_dense() {
        for (i, class) in TimeoutClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let policy = TimeoutPolicy {
            icmp_reply: 0,
            ..TimeoutPolicy::default()
        };
        let errors = policy.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("icmp_reply"));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let policy = TimeoutPolicy {
            other_first: u64::MAX,
            ..TimeoutPolicy::default()
        };
        let errors = policy.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("other_first"));

        let policy = TimeoutPolicy {
            other_first: MAX_TIMEOUT_SECS,
            ..TimeoutPolicy::default()
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_min_tracks_smallest_class() {
        let policy = TimeoutPolicy {
            tcp_fin_wait: 5,
            ..TimeoutPolicy::default()
        };
        assert_eq!(policy.min_millis(), 5_000);
    }
}
