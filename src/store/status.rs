use std::fmt;

/// Lifecycle of a status element. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusState {
    Pending,
    Updating,
    Done,
    Cancelled,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Updating => "updating",
            StatusState::Done => "done",
            StatusState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" | "start" => Some(StatusState::Pending),
            "updating" | "working" => Some(StatusState::Updating),
            "done" => Some(StatusState::Done),
            "cancelled" => Some(StatusState::Cancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            StatusState::Pending => 0,
            StatusState::Updating => 1,
            StatusState::Done | StatusState::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(&self, next: StatusState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        assert!(StatusState::Pending.can_advance_to(StatusState::Updating));
        assert!(StatusState::Pending.can_advance_to(StatusState::Done));
        assert!(StatusState::Updating.can_advance_to(StatusState::Cancelled));
        assert!(!StatusState::Updating.can_advance_to(StatusState::Pending));
        assert!(!StatusState::Done.can_advance_to(StatusState::Cancelled));
        assert!(!StatusState::Cancelled.can_advance_to(StatusState::Done));
    }
}
