//! Identifiers shared by every layer: protocols, endpoints, tuples, handles.
//!
//! Handles are plain integers. They are the only thing that ever crosses a
//! thread boundary; the records they name live in per-worker pools.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Index of a worker thread. Thread 0 is the main thread.
pub type ThreadIndex = u16;

/// Routing-domain discriminator carried in every lookup key.
pub type FibIndex = u32;

// ── Transport protocol ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    Tcp,
    Udp,
    Tls,
    Quic,
    /// In-process connections between a local connect and a local listener.
    Loopback,
}

impl TransportProto {
    pub const ALL: [TransportProto; 5] = [
        TransportProto::Tcp,
        TransportProto::Udp,
        TransportProto::Tls,
        TransportProto::Quic,
        TransportProto::Loopback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Udp => "udp",
            TransportProto::Tls => "tls",
            TransportProto::Quic => "quic",
            TransportProto::Loopback => "loopback",
        }
    }

    /// Connectionless transports never hold a half-open entry.
    pub fn is_connectionless(self) -> bool {
        matches!(self, TransportProto::Udp)
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown transport protocol `{0}`")]
pub struct UnknownProto(pub String);

impl FromStr for TransportProto {
    type Err = UnknownProto;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportProto::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownProto(s.to_string()))
    }
}

/// Protocol × address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionType {
    pub proto: TransportProto,
    pub is_ip4: bool,
}

impl SessionType {
    pub fn new(proto: TransportProto, is_ip4: bool) -> Self {
        Self { proto, is_ip4 }
    }

    pub fn for_endpoint(proto: TransportProto, ep: &Endpoint) -> Self {
        Self::new(proto, ep.ip.is_ipv4())
    }
}

// ── Endpoints and tuples ─────────────────────────────────────────────────────

/// An ip:port pair. Port 0 means "any" wherever an endpoint is a match pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn unspecified() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// Pattern match used by the introspection filter.
    pub fn matches(&self, other: &Endpoint) -> bool {
        self.ip == other.ip && (self.port == 0 || self.port == other.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip(), sa.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint `{0}`, expected IP or IP:PORT")]
pub struct BadEndpoint(pub String);

impl FromStr for Endpoint {
    type Err = BadEndpoint;

    /// Accepts `1.2.3.4`, `1.2.3.4:80`, `::1`, `[::1]:80`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(sa.into());
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(Endpoint::new(ip, 0));
        }
        Err(BadEndpoint(s.to_string()))
    }
}

/// Full connection key used by established lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionTuple {
    pub proto: TransportProto,
    pub fib_index: FibIndex,
    pub lcl: Endpoint,
    pub rmt: Endpoint,
}

impl SessionTuple {
    pub fn local_key(&self) -> LocalKey {
        LocalKey {
            proto: self.proto,
            fib_index: self.fib_index,
            lcl: self.lcl,
        }
    }

    /// The same connection as seen from the other end.
    pub fn reversed(&self) -> Self {
        Self {
            proto: self.proto,
            fib_index: self.fib_index,
            lcl: self.rmt,
            rmt: self.lcl,
        }
    }
}

impl fmt::Display for SessionTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.proto, self.lcl, self.rmt)
    }
}

/// Local-only key used by listener and half-open lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalKey {
    pub proto: TransportProto,
    pub fib_index: FibIndex,
    pub lcl: Endpoint,
}

// ── Handles ──────────────────────────────────────────────────────────────────

/// `(thread_index, session_index)`, the cross-thread name of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle {
    pub thread_index: ThreadIndex,
    pub session_index: u32,
}

impl SessionHandle {
    pub fn new(thread_index: ThreadIndex, session_index: u32) -> Self {
        Self {
            thread_index,
            session_index,
        }
    }

    /// Packed form, thread in the upper 32 bits.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.thread_index) << 32) | u64::from(self.session_index)
    }

    pub fn from_u64(v: u64) -> Self {
        Self::new((v >> 32) as ThreadIndex, v as u32)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.thread_index, self.session_index)
    }
}

/// `(proto, thread, connection_index)` names a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub proto: TransportProto,
    pub thread_index: ThreadIndex,
    pub connection_index: u32,
}
