use super::UpdateResult;
use crate::timeout::TimeoutClass;

/// State machine for UDP and protocols without a dedicated tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OtherState {
    /// One packet seen.
    First,
    /// More packets, all in the original direction.
    Multiple,
    /// Traffic seen in both directions. Terminal.
    Bidir,
}

impl OtherState {
    pub fn update(&mut self, reply: bool) -> UpdateResult {
        if reply && *self != OtherState::Bidir {
            *self = OtherState::Bidir;
        } else if *self == OtherState::First {
            *self = OtherState::Multiple;
        }
        UpdateResult::Valid
    }

    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            OtherState::First => TimeoutClass::OtherFirst,
            OtherState::Multiple => TimeoutClass::OtherMultiple,
            OtherState::Bidir => TimeoutClass::OtherBidir,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OtherState::First => "FIRST",
            OtherState::Multiple => "MULTIPLE",
            OtherState::Bidir => "BIDIR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_then_reply() {
        let mut state = OtherState::First;
        assert_eq!(state.update(false), UpdateResult::Valid);
        assert_eq!(state, OtherState::Multiple);
        assert_eq!(state.update(false), UpdateResult::Valid);
        assert_eq!(state, OtherState::Multiple);
        assert_eq!(state.update(true), UpdateResult::Valid);
        assert_eq!(state, OtherState::Bidir);
    }

    #[test]
    fn test_first_reply_goes_straight_to_bidir() {
        let mut state = OtherState::First;
        state.update(true);
        assert_eq!(state, OtherState::Bidir);
    }

    #[test]
    fn test_bidir_never_regresses() {
        let mut state = OtherState::Bidir;
        for reply in [true, false, true, true, false] {
            assert_eq!(state.update(reply), UpdateResult::Valid);
            assert_eq!(state, OtherState::Bidir);
        }
    }

    #[test]
    fn test_classes() {
        assert_eq!(OtherState::First.timeout_class(), TimeoutClass::OtherFirst);
        assert_eq!(
            OtherState::Multiple.timeout_class(),
            TimeoutClass::OtherMultiple
        );
        assert_eq!(OtherState::Bidir.timeout_class(), TimeoutClass::OtherBidir);
    }
}
