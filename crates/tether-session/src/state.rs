//! Session state machine.
//!
//! Every legal `(state, input)` pair is listed in [`transition`]. Anything
//! not listed is a no-op: late events, duplicate closes and notifications
//! racing a forced clear all land there.

use serde::Serialize;

use crate::session::SessionState;

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Input {
    /// Application bind.
    Listen,
    /// Application connect; transport has a half-open connection.
    Connect,
    /// Transport delivered a connection on a listener.
    Accept,
    /// Transport finished an active open.
    Connected,
    /// Transport finished a passive open.
    Accepted,
    /// Peer closed the connection.
    PeerClose,
    /// Application closed the session.
    AppClose,
    /// All rx data reached the application after a peer close.
    Drained,
    /// Transport reset the connection.
    Reset,
    /// Operator clear.
    ForceClear,
    /// The transport did not finish closing in time.
    CloseTimeout,
    /// Transport freed the connection.
    Cleanup,
    /// Session moved to another worker.
    Migrated,
    /// Session arrived from another worker with its fifos attached.
    Adopt,
}

/// Side effect the worker performs after moving to the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Allocate and attach fifos, post a new-session event.
    AttachFifos,
    /// Post a disconnect event, wait for rx to drain.
    NotifyDisconnect,
    /// Ask the transport for a graceful close and arm the close timer.
    CloseTransport,
    /// Post a reset event and arm the close timer.
    NotifyReset,
    /// Post a connect-failed notification.
    NotifyConnectFailed,
    /// Unlisten, then tear down.
    Unlisten,
    /// Reset the transport connection, notify a reset, tear down.
    ForceClear,
    /// Tell the transport to drop the connection, then tear down.
    ForceCleanup,
    /// Release fifos and lookups. The transport is already gone.
    Teardown,
    /// Release lookups only. Fifos and connection moved elsewhere.
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Go { next: SessionState, action: Action },
    Ignore,
}

const fn go(next: SessionState, action: Action) -> Step {
    Step::Go { next, action }
}

pub fn transition(state: SessionState, input: Input) -> Step {
    use Action as A;
    use Input as I;
    use SessionState as S;

    match (state, input) {
        (S::TransportDeleted, _) => Step::Ignore,

        (S::Created, I::Listen) => go(S::Listening, A::None),
        (S::Created, I::Connect) => go(S::Connecting, A::None),
        (S::Created, I::Accept) => go(S::Accepting, A::None),

        (S::Connecting, I::Connected) => go(S::Ready, A::AttachFifos),
        (S::Accepting, I::Accepted) => go(S::Ready, A::AttachFifos),

        (S::Ready, I::PeerClose) => go(S::TransportClosing, A::NotifyDisconnect),
        (S::Ready, I::AppClose) => go(S::AppClosing, A::CloseTransport),
        (S::TransportClosing, I::Drained | I::AppClose) => go(S::Closed, A::CloseTransport),
        (S::AppClosing, I::PeerClose) => go(S::Closed, A::None),

        (S::Connecting, I::Reset) => go(S::Closed, A::NotifyConnectFailed),
        (S::Accepting, I::Reset) => go(S::TransportDeleted, A::Teardown),
        (S::Ready | S::TransportClosing | S::AppClosing, I::Reset) => {
            go(S::Closed, A::NotifyReset)
        }

        (S::AppClosing | S::Closed, I::CloseTimeout) => go(S::TransportDeleted, A::ForceCleanup),

        (S::Listening, I::AppClose | I::ForceClear) => go(S::TransportDeleted, A::Unlisten),
        (S::Connecting, I::AppClose) => go(S::TransportDeleted, A::ForceCleanup),
        (S::Created, I::AppClose | I::ForceClear) => go(S::TransportDeleted, A::Teardown),
        (_, I::ForceClear) => go(S::TransportDeleted, A::ForceClear),

        (S::Ready, I::Migrated) => go(S::TransportDeleted, A::Detach),
        (S::Created, I::Adopt) => go(S::Ready, A::None),

        (_, I::Cleanup) => go(S::TransportDeleted, A::Teardown),

        _ => Step::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState as S;

    const INPUTS: [Input; 14] = [
        Input::Listen,
        Input::Connect,
        Input::Accept,
        Input::Connected,
        Input::Accepted,
        Input::PeerClose,
        Input::AppClose,
        Input::Drained,
        Input::Reset,
        Input::ForceClear,
        Input::CloseTimeout,
        Input::Cleanup,
        Input::Migrated,
        Input::Adopt,
    ];

    fn next(state: SessionState, input: Input) -> Option<(SessionState, Action)> {
        match transition(state, input) {
            Step::Go { next, action } => Some((next, action)),
            Step::Ignore => None,
        }
    }

    #[test]
    fn deleted_is_terminal() {
        for input in INPUTS {
            assert_eq!(transition(S::TransportDeleted, input), Step::Ignore);
        }
    }

    #[test]
    fn only_open_transitions_attach_fifos() {
        for state in S::ALL {
            for input in INPUTS {
                if let Some((_, Action::AttachFifos)) = next(state, input) {
                    assert!(matches!(
                        (state, input),
                        (S::Connecting, Input::Connected) | (S::Accepting, Input::Accepted)
                    ));
                }
            }
        }
    }

    #[test]
    fn listener_never_reaches_ready() {
        for input in INPUTS {
            if let Some((to, _)) = next(S::Listening, input) {
                assert_eq!(to, S::TransportDeleted);
            }
        }
    }

    #[test]
    fn every_state_can_be_cleaned_up() {
        for state in S::ALL.into_iter().filter(|s| *s != S::TransportDeleted) {
            assert_eq!(next(state, Input::Cleanup).map(|(s, _)| s), Some(S::TransportDeleted));
            assert_eq!(next(state, Input::ForceClear).map(|(s, _)| s), Some(S::TransportDeleted));
        }
    }

    #[test]
    fn close_is_idempotent_once_closing() {
        assert_eq!(transition(S::AppClosing, Input::AppClose), Step::Ignore);
        assert_eq!(transition(S::Closed, Input::AppClose), Step::Ignore);
        assert_eq!(transition(S::TransportClosing, Input::PeerClose), Step::Ignore);
        assert_eq!(transition(S::Closed, Input::Reset), Step::Ignore);
    }

    #[test]
    fn graceful_paths() {
        assert_eq!(next(S::Ready, Input::PeerClose), Some((S::TransportClosing, Action::NotifyDisconnect)));
        assert_eq!(next(S::TransportClosing, Input::Drained), Some((S::Closed, Action::CloseTransport)));
        assert_eq!(next(S::Ready, Input::AppClose), Some((S::AppClosing, Action::CloseTransport)));
        assert_eq!(next(S::AppClosing, Input::CloseTimeout), Some((S::TransportDeleted, Action::ForceCleanup)));
        assert_eq!(next(S::Connecting, Input::Reset), Some((S::Closed, Action::NotifyConnectFailed)));
    }
}
