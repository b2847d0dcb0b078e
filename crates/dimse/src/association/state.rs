//! Association state machine.
//!
//! ```text
//! Idle --RQ sent--> RequestSent --AC--> Established --RQ sent--> ReleaseRequested --RP--> Released
//!                        |                   |
//!                        +--RJ--> Rejected   +--peer RQ / RP sent--> Released
//!
//! any non-terminal state --abort / peer abort / timer--> Aborted
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationState {
    /// Connection open, nothing exchanged yet.
    Idle,
    /// A-ASSOCIATE-RQ sent (requestor) or received (acceptor), awaiting the
    /// other half of the handshake.
    RequestSent,
    /// The only state in which DIMSE messages may flow.
    Established,
    /// A-RELEASE-RQ sent; no further DIMSE traffic may be sent.
    ReleaseRequested,
    Released,
    Aborted,
    Rejected,
}

impl AssociationState {
    #[must_use]
    pub const fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    /// Released, Aborted and Rejected accept no further PDUs.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Aborted | Self::Rejected)
    }

    #[must_use]
    pub const fn can_send_dimse(&self) -> bool {
        self.is_established()
    }

    /// State after the association request went out (or came in).
    #[must_use]
    pub const fn after_request(&self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::RequestSent),
            _ => None,
        }
    }

    #[must_use]
    pub const fn after_accept(&self) -> Option<Self> {
        match self {
            Self::RequestSent => Some(Self::Established),
            _ => None,
        }
    }

    #[must_use]
    pub const fn after_reject(&self) -> Option<Self> {
        match self {
            Self::RequestSent => Some(Self::Rejected),
            _ => None,
        }
    }

    #[must_use]
    pub const fn after_release_request(&self) -> Option<Self> {
        match self {
            Self::Established => Some(Self::ReleaseRequested),
            _ => None,
        }
    }

    /// Release completes from ReleaseRequested (RP received) or from
    /// Established (peer asked and we answered).
    #[must_use]
    pub const fn after_release(&self) -> Option<Self> {
        match self {
            Self::Established | Self::ReleaseRequested => Some(Self::Released),
            _ => None,
        }
    }

    #[must_use]
    pub const fn after_abort(&self) -> Option<Self> {
        if self.is_terminal() {
            None
        } else {
            Some(Self::Aborted)
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::RequestSent => "RequestSent",
            Self::Established => "Established",
            Self::ReleaseRequested => "ReleaseRequested",
            Self::Released => "Released",
            Self::Aborted => "Aborted",
            Self::Rejected => "Rejected",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AssociationState::*;

    #[test]
    fn test_happy_path() {
        let s = Idle.after_request().unwrap();
        assert_eq!(s, RequestSent);
        let s = s.after_accept().unwrap();
        assert!(s.can_send_dimse());
        let s = s.after_release_request().unwrap();
        assert!(!s.can_send_dimse());
        assert_eq!(s.after_release(), Some(Released));
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(Idle.after_accept(), None);
        assert_eq!(Established.after_reject(), None);
        assert_eq!(Released.after_release_request(), None);
        assert_eq!(Aborted.after_abort(), None);
        assert_eq!(Rejected.after_request(), None);
    }

    #[test]
    fn test_abort_from_every_live_state() {
        for state in [Idle, RequestSent, Established, ReleaseRequested] {
            assert_eq!(state.after_abort(), Some(Aborted));
        }
    }
}
