use super::UpdateResult;
use crate::timeout::TimeoutClass;

/// ICMP query/response tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpState {
    First,
    Reply,
}

impl IcmpState {
    pub fn update(&mut self, reply: bool) -> UpdateResult {
        if reply {
            *self = IcmpState::Reply;
        }
        UpdateResult::Valid
    }

    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            IcmpState::First => TimeoutClass::IcmpFirst,
            IcmpState::Reply => TimeoutClass::IcmpReply,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IcmpState::First => "FIRST",
            IcmpState::Reply => "REPLY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_is_sticky() {
        let mut state = IcmpState::First;
        state.update(false);
        assert_eq!(state, IcmpState::First);
        state.update(true);
        assert_eq!(state, IcmpState::Reply);
        state.update(false);
        assert_eq!(state, IcmpState::Reply);
        assert_eq!(state.timeout_class(), TimeoutClass::IcmpReply);
    }
}
