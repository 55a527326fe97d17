//! Connection records and the key types the engine's tables are indexed by.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use roost_reactor::Fd;

use crate::stream::StreamCodec;

/// Directed logical channel: `"from-domain/to-domain"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub from: String,
    pub to: String,
}

impl RouteKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// A resolved endpoint. Keys the connection-reuse and bad-host tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl HostPort {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.port)
    }
}

/// Per-route authentication state on a connection. Absence means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteState {
    InProgress,
    Valid,
}

/// An outbound connection, possibly multiplexing several routes.
pub(crate) struct OutConn {
    pub fd: Fd,
    pub hp: HostPort,
    /// Pinned destination domain when connection reuse is disabled.
    pub dkey: Option<String>,
    pub codec: Box<dyn StreamCodec>,
    pub routes: HashSet<RouteKey>,
    pub states: HashMap<RouteKey, RouteState>,
    pub states_time: HashMap<RouteKey, Instant>,
    pub online: bool,
    /// Outstanding `<db:verify>` requests.
    pub verify: u32,
    pub packet_count: u64,
    pub init_time: Instant,
    pub last_packet: Instant,
    pub last_activity: Instant,
    pub last_verify: Instant,
}

impl OutConn {
    pub fn new(
        fd: Fd,
        hp: HostPort,
        dkey: Option<String>,
        codec: Box<dyn StreamCodec>,
        now: Instant,
    ) -> Self {
        Self {
            fd,
            hp,
            dkey,
            codec,
            routes: HashSet::new(),
            states: HashMap::new(),
            states_time: HashMap::new(),
            online: false,
            verify: 0,
            packet_count: 0,
            init_time: now,
            last_packet: now,
            last_activity: now,
            last_verify: now,
        }
    }
}

/// An incoming connection, registered by the inbound subsystem. The engine
/// only drives the verify-answer path over it.
pub(crate) struct InConn {
    pub fd: Fd,
    pub peer: SocketAddr,
    pub codec: Box<dyn StreamCodec>,
    pub states: HashMap<RouteKey, RouteState>,
}
