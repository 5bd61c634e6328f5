//! TCP tracking driven by control flags.
//!
//! Each direction keeps its own peer state. Sequence numbers are not
//! windowed; validation is limited to flag legality and handshake order.

use super::UpdateResult;
use crate::packet::TcpFlags;
use crate::timeout::TimeoutClass;

/// State of one TCP endpoint as observed from the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpPeerState {
    Closed,
    Listen,
    SynSent,
    SynRecv,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
}

impl TcpPeerState {
    pub fn name(self) -> &'static str {
        match self {
            TcpPeerState::Closed => "CLOSED",
            TcpPeerState::Listen => "LISTEN",
            TcpPeerState::SynSent => "SYN_SENT",
            TcpPeerState::SynRecv => "SYN_RECV",
            TcpPeerState::Established => "ESTABLISHED",
            TcpPeerState::CloseWait => "CLOSE_WAIT",
            TcpPeerState::FinWait1 => "FIN_WAIT_1",
            TcpPeerState::Closing => "CLOSING",
            TcpPeerState::LastAck => "LAST_ACK",
            TcpPeerState::FinWait2 => "FIN_WAIT_2",
            TcpPeerState::TimeWait => "TIME_WAIT",
        }
    }
}

/// Both peers of a tracked TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpState {
    /// Endpoint that sent the first packet.
    pub orig: TcpPeerState,
    pub reply: TcpPeerState,
}

/// Flag combinations no conforming stack emits.
fn invalid_flags(flags: TcpFlags) -> bool {
    if flags.contains(TcpFlags::SYN) {
        if flags.intersects(TcpFlags::RST | TcpFlags::FIN) {
            return true;
        }
    } else if !flags.intersects(TcpFlags::ACK | TcpFlags::RST) {
        return true;
    }

    !flags.contains(TcpFlags::ACK) && flags.intersects(TcpFlags::FIN | TcpFlags::PSH | TcpFlags::URG)
}

pub(super) fn valid_new(flags: TcpFlags, strict: bool) -> bool {
    if invalid_flags(flags) || flags.contains(TcpFlags::RST) {
        return false;
    }
    let syn = flags.contains(TcpFlags::SYN);
    let ack = flags.contains(TcpFlags::ACK);
    // SYN+ACK never opens a connection: we would be tracking it half-open.
    if syn && ack {
        return false;
    }
    !strict || syn
}

impl TcpState {
    /// State after the first packet. A SYN starts a handshake; anything
    /// else is a mid-stream pickup and both sides count as established.
    pub fn new(flags: TcpFlags) -> Self {
        if flags.contains(TcpFlags::SYN) {
            Self {
                orig: TcpPeerState::SynSent,
                reply: TcpPeerState::Closed,
            }
        } else {
            Self {
                orig: TcpPeerState::Established,
                reply: TcpPeerState::Established,
            }
        }
    }

    pub fn update(&mut self, flags: TcpFlags, reply: bool) -> UpdateResult {
        use TcpPeerState::*;

        if invalid_flags(flags) {
            return UpdateResult::Invalid;
        }

        let (src, dst) = if reply {
            (&mut self.reply, &mut self.orig)
        } else {
            (&mut self.orig, &mut self.reply)
        };

        // Fresh SYN on a fully closed connection reopens it.
        if flags & (TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN
            && *src >= FinWait2
            && *dst >= FinWait2
        {
            *src = Closed;
            *dst = Closed;
            return UpdateResult::New;
        }

        // Responder has not answered the SYN: only SYN(+ACK) or RST may come back.
        if reply && *src == Closed && *dst == SynSent && !flags.intersects(TcpFlags::SYN | TcpFlags::RST)
        {
            return UpdateResult::Invalid;
        }

        if flags.contains(TcpFlags::SYN) && *src < SynSent {
            *src = SynSent;
        }
        if flags.contains(TcpFlags::FIN) && *src < Closing {
            *src = Closing;
        }
        if flags.contains(TcpFlags::ACK) {
            if *dst == SynSent {
                *dst = Established;
            } else if *dst == Closing {
                *dst = FinWait2;
            }
        }
        if flags.contains(TcpFlags::RST) {
            *src = TimeWait;
            *dst = TimeWait;
        }

        UpdateResult::Valid
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        use TcpPeerState::*;

        let (a, b) = (self.orig, self.reply);
        if a >= FinWait2 && b >= FinWait2 {
            TimeoutClass::TcpClosed
        } else if a >= Closing && b >= Closing {
            TimeoutClass::TcpFinWait
        } else if a < Established || b < Established {
            TimeoutClass::TcpOpening
        } else if a >= Closing || b >= Closing {
            TimeoutClass::TcpClosing
        } else {
            TimeoutClass::TcpEstablished
        }
    }

    /// Single state for compact display: the further-along peer, with
    /// FIN_WAIT_2 shown as TIME_WAIT and SYN_RECV as ESTABLISHED.
    pub fn coalesced(&self) -> TcpPeerState {
        match self.orig.max(self.reply) {
            TcpPeerState::FinWait2 => TcpPeerState::TimeWait,
            TcpPeerState::SynRecv => TcpPeerState::Established,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYN: TcpFlags = TcpFlags::SYN;
    const ACK: TcpFlags = TcpFlags::ACK;
    const FIN: TcpFlags = TcpFlags::FIN;
    const RST: TcpFlags = TcpFlags::RST;

    fn handshake() -> TcpState {
        let mut state = TcpState::new(SYN);
        assert_eq!(state.update(SYN | ACK, true), UpdateResult::Valid);
        assert_eq!(state.update(ACK, false), UpdateResult::Valid);
        state
    }

    // ===== Admission =====

    #[test]
    fn test_valid_new_strict_requires_syn() {
        assert!(valid_new(SYN, true));
        assert!(!valid_new(ACK, true));
        assert!(valid_new(ACK, false));
    }

    #[test]
    fn test_syn_ack_never_opens() {
        assert!(!valid_new(SYN | ACK, false));
        assert!(!valid_new(SYN | ACK, true));
    }

    #[test]
    fn test_rst_and_illegal_flags_never_open() {
        assert!(!valid_new(RST | ACK, false));
        assert!(!valid_new(SYN | FIN, false));
        assert!(!valid_new(TcpFlags::empty(), false));
        assert!(!valid_new(FIN, false));
    }

    // ===== Transitions =====

    #[test]
    fn test_three_way_handshake() {
        let state = handshake();
        assert_eq!(state.orig, TcpPeerState::Established);
        assert_eq!(state.reply, TcpPeerState::Established);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpEstablished);
    }

    #[test]
    fn test_opening_class_during_handshake() {
        let mut state = TcpState::new(SYN);
        state.update(SYN | ACK, true);
        assert_eq!(state.orig, TcpPeerState::Established);
        assert_eq!(state.reply, TcpPeerState::SynSent);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpOpening);
    }

    #[test]
    fn test_reply_data_before_syn_ack_is_invalid() {
        let mut state = TcpState::new(SYN);
        let before = state;
        assert_eq!(state.update(ACK, true), UpdateResult::Invalid);
        assert_eq!(state, before);
    }

    #[test]
    fn test_illegal_flags_invalid_on_update() {
        let mut state = handshake();
        assert_eq!(state.update(SYN | RST, false), UpdateResult::Invalid);
        assert_eq!(state.update(FIN, false), UpdateResult::Invalid);
    }

    #[test]
    fn test_orderly_close() {
        let mut state = handshake();
        state.update(FIN | ACK, false);
        assert_eq!(state.orig, TcpPeerState::Closing);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpClosing);

        state.update(FIN | ACK, true);
        assert_eq!(state.orig, TcpPeerState::FinWait2);
        assert_eq!(state.reply, TcpPeerState::Closing);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpFinWait);

        state.update(ACK, false);
        assert_eq!(state.reply, TcpPeerState::FinWait2);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpClosed);
    }

    #[test]
    fn test_rst_closes_both() {
        let mut state = handshake();
        state.update(RST | ACK, true);
        assert_eq!(state.orig, TcpPeerState::TimeWait);
        assert_eq!(state.reply, TcpPeerState::TimeWait);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpClosed);
    }

    #[test]
    fn test_syn_after_close_requests_new() {
        let mut state = handshake();
        state.update(RST | ACK, false);
        assert_eq!(state.update(SYN, false), UpdateResult::New);
    }

    #[test]
    fn test_mid_stream_pickup() {
        let state = TcpState::new(ACK);
        assert_eq!(state.orig, TcpPeerState::Established);
        assert_eq!(state.timeout_class(), TimeoutClass::TcpEstablished);
    }

    // ===== Display =====

    #[test]
    fn test_coalesced_state() {
        let state = TcpState {
            orig: TcpPeerState::FinWait2,
            reply: TcpPeerState::Closing,
        };
        assert_eq!(state.coalesced(), TcpPeerState::TimeWait);

        let state = TcpState {
            orig: TcpPeerState::SynRecv,
            reply: TcpPeerState::SynSent,
        };
        assert_eq!(state.coalesced(), TcpPeerState::Established);
    }
}
