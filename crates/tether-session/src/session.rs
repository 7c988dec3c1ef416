//! The session record and its small value types.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::Serialize;

use tether_core::{
    ConnectionRef, FifoConsumer, FifoProducer, SessionHandle, SessionTuple, SessionType,
    ThreadIndex,
};

/// Lifecycle states, in the order a session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Listening,
    Connecting,
    Accepting,
    Ready,
    TransportClosing,
    AppClosing,
    Closed,
    TransportDeleted,
}

impl SessionState {
    pub const ALL: [SessionState; 9] = [
        SessionState::Created,
        SessionState::Listening,
        SessionState::Connecting,
        SessionState::Accepting,
        SessionState::Ready,
        SessionState::TransportClosing,
        SessionState::AppClosing,
        SessionState::Closed,
        SessionState::TransportDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Listening => "LISTENING",
            SessionState::Connecting => "CONNECTING",
            SessionState::Accepting => "ACCEPTING",
            SessionState::Ready => "READY",
            SessionState::TransportClosing => "TRANSPORT_CLOSING",
            SessionState::AppClosing => "APP_CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::TransportDeleted => "TRANSPORT_DELETED",
        }
    }

    /// Past the point where the application may exchange data.
    pub fn is_closing(self) -> bool {
        self >= SessionState::TransportClosing
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown session state `{0}`")]
pub struct UnknownState(pub String);

impl FromStr for SessionState {
    type Err = UnknownState;

    /// Accepts `READY`, `ready`, `transport-closing`, `transport_closing`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.replace('-', "_");
        SessionState::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(&norm))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

// ── Flags ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionFlag {
    /// Connecting; only the local endpoint exists.
    HalfOpen,
    Listener,
    /// The application closed before the transport did.
    AppClosed,
    Migrating,
    /// The application has been told about the disconnect.
    DisconnectNotified,
    /// Ended by a reset rather than a graceful close.
    Reset,
}

impl SessionFlag {
    const ALL: [SessionFlag; 6] = [
        SessionFlag::HalfOpen,
        SessionFlag::Listener,
        SessionFlag::AppClosed,
        SessionFlag::Migrating,
        SessionFlag::DisconnectNotified,
        SessionFlag::Reset,
    ];

    fn bit(self) -> u8 {
        1 << self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionFlag::HalfOpen => "half-open",
            SessionFlag::Listener => "listener",
            SessionFlag::AppClosed => "app-closed",
            SessionFlag::Migrating => "migrating",
            SessionFlag::DisconnectNotified => "disconnect-notified",
            SessionFlag::Reset => "reset",
        }
    }
}

/// Set of [`SessionFlag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags(u8);

impl SessionFlags {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, flag: SessionFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: SessionFlag) {
        self.0 |= flag.bit();
    }

    pub fn remove(&mut self, flag: SessionFlag) {
        self.0 &= !flag.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = SessionFlag> {
        SessionFlag::ALL.into_iter().filter(move |f| self.contains(*f))
    }
}

impl From<SessionFlag> for SessionFlags {
    fn from(flag: SessionFlag) -> Self {
        Self(flag.bit())
    }
}

impl fmt::Display for SessionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(SessionFlag::as_str).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for SessionFlags {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(self.iter())
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One session. Lives in its owning worker's pool and is only touched on
/// that worker's thread.
#[derive(Debug)]
pub struct Session {
    pub thread_index: ThreadIndex,
    pub session_index: u32,
    pub state: SessionState,
    pub session_type: SessionType,
    pub flags: SessionFlags,
    /// Index into the transport's connection pool on this thread.
    pub connection_index: u32,
    /// Endpoints as bound. Listeners carry an unspecified remote.
    pub tuple: SessionTuple,
    /// Parent listener, for accepted sessions.
    pub listener: Option<SessionHandle>,
    pub app_wrk_index: u32,
    /// Transport side of the rx fifo.
    pub rx_fifo: Option<FifoProducer>,
    /// Transport side of the tx fifo.
    pub tx_fifo: Option<FifoConsumer>,
    /// Application tag, echoed back in notifications.
    pub opaque: u64,
    pub close_deadline: Option<Instant>,
    pub created_at: Instant,
}

impl Session {
    pub fn new(
        thread_index: ThreadIndex,
        session_index: u32,
        tuple: SessionTuple,
        app_wrk_index: u32,
    ) -> Self {
        Self {
            thread_index,
            session_index,
            state: SessionState::Created,
            session_type: SessionType::for_endpoint(tuple.proto, &tuple.lcl),
            flags: SessionFlags::empty(),
            connection_index: u32::MAX,
            tuple,
            listener: None,
            app_wrk_index,
            rx_fifo: None,
            tx_fifo: None,
            opaque: 0,
            close_deadline: None,
            created_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.thread_index, self.session_index)
    }

    pub fn connection(&self) -> ConnectionRef {
        ConnectionRef {
            proto: self.tuple.proto,
            thread_index: self.thread_index,
            connection_index: self.connection_index,
        }
    }

    pub fn has_fifos(&self) -> bool {
        self.rx_fifo.is_some() || self.tx_fifo.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_through_the_lifecycle() {
        assert!(SessionState::Created < SessionState::Ready);
        assert!(SessionState::Ready < SessionState::TransportDeleted);
        assert!(SessionState::AppClosing.is_closing());
        assert!(!SessionState::Ready.is_closing());
    }

    #[test]
    fn state_parse_accepts_operator_spellings() {
        assert_eq!("READY".parse::<SessionState>().unwrap(), SessionState::Ready);
        assert_eq!(
            "transport-closing".parse::<SessionState>().unwrap(),
            SessionState::TransportClosing
        );
        assert_eq!(
            "transport_deleted".parse::<SessionState>().unwrap(),
            SessionState::TransportDeleted
        );
        assert!("opened".parse::<SessionState>().is_err());
    }

    #[test]
    fn flag_set_membership_and_display() {
        let mut flags = SessionFlags::from(SessionFlag::HalfOpen);
        flags.insert(SessionFlag::Reset);
        assert!(flags.contains(SessionFlag::HalfOpen));
        assert!(!flags.contains(SessionFlag::Listener));
        assert_eq!(flags.to_string(), "half-open,reset");
        flags.remove(SessionFlag::HalfOpen);
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![SessionFlag::Reset]);
    }
}
