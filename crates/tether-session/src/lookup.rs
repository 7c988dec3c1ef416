//! Connection lookup tables.
//!
//! Readable from any thread without blocking the owner; written only by the
//! worker that owns the session behind an entry. Values name a transport
//! connection, and the session is found through the connection's back-index.

use dashmap::DashMap;

use tether_core::{ConnectionRef, LocalKey, SessionHandle, SessionTuple, TransportProto};

use crate::transport::TransportRegistry;

#[derive(Debug, Default)]
pub struct LookupTable {
    established: DashMap<SessionTuple, ConnectionRef>,
    half_open: DashMap<LocalKey, ConnectionRef>,
    listeners: DashMap<LocalKey, ConnectionRef>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_established(&self, tuple: SessionTuple, conn: ConnectionRef) {
        self.established.insert(tuple, conn);
    }

    pub(crate) fn add_half_open(&self, key: LocalKey, conn: ConnectionRef) {
        self.half_open.insert(key, conn);
    }

    pub(crate) fn add_listener(&self, key: LocalKey, conn: ConnectionRef) {
        self.listeners.insert(key, conn);
    }

    /// Each removal only drops the entry if it still names `conn`, so a
    /// late teardown never removes a newer binding for the same key.
    pub(crate) fn del_established(&self, tuple: &SessionTuple, conn: ConnectionRef) {
        self.established.remove_if(tuple, |_, v| *v == conn);
    }

    pub(crate) fn del_half_open(&self, key: &LocalKey, conn: ConnectionRef) {
        self.half_open.remove_if(key, |_, v| *v == conn);
    }

    pub(crate) fn del_listener(&self, key: &LocalKey, conn: ConnectionRef) {
        self.listeners.remove_if(key, |_, v| *v == conn);
    }

    pub fn find_established(&self, tuple: &SessionTuple) -> Option<ConnectionRef> {
        self.established.get(tuple).map(|r| *r)
    }

    pub fn find_half_open(&self, key: &LocalKey) -> Option<ConnectionRef> {
        self.half_open.get(key).map(|r| *r)
    }

    pub fn has_listener(&self, key: &LocalKey) -> bool {
        self.listeners.contains_key(key)
    }

    /// Exact local match first, then a wildcard-address listener on the
    /// same port.
    pub fn find_listener(&self, key: &LocalKey) -> Option<ConnectionRef> {
        if let Some(conn) = self.listeners.get(key) {
            return Some(*conn);
        }
        let mut wildcard = *key;
        wildcard.lcl.ip = if key.lcl.ip.is_ipv4() {
            std::net::Ipv4Addr::UNSPECIFIED.into()
        } else {
            std::net::Ipv6Addr::UNSPECIFIED.into()
        };
        self.listeners.get(&wildcard).map(|r| *r)
    }

    /// Established first, then listener/half-open on the local side.
    pub fn find_session(
        &self,
        tuple: &SessionTuple,
        transports: &TransportRegistry,
    ) -> Option<SessionHandle> {
        let transport = transports.get(tuple.proto)?;
        if let Some(conn) = self.find_established(tuple) {
            return transport
                .get_connection(conn.connection_index, conn.thread_index)
                .map(|c| c.session);
        }
        let key = tuple.local_key();
        if let Some(conn) = self.find_half_open(&key) {
            return transport.get_half_open(conn.connection_index).map(|c| c.session);
        }
        self.find_listener(&key)
            .and_then(|conn| transport.get_listener(conn.connection_index))
            .map(|c| c.session)
    }

    pub fn listeners_of(&self, proto: TransportProto) -> Vec<(LocalKey, ConnectionRef)> {
        self.listeners
            .iter()
            .filter(|e| e.key().proto == proto)
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.established.len(), self.half_open.len(), self.listeners.len())
    }
}
