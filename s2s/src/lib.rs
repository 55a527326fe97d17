//! Outbound S2S federation core.
//!
//! A single-threaded engine that owns the connection pool, the DNS cache
//! and the per-route packet queues, driven entirely by reactor callbacks.
//! The stream codec, the inbound dialback logic and the router link plug
//! in at the trait seams in [`stream`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
mod conn;
mod dns;
mod out;
mod resolver;
pub mod stanza;
pub mod stream;
#[doc(hidden)]
pub mod testing;

pub use config::Config;
pub use conn::{HostPort, RouteKey};
pub use minidom::Element;
pub use out::RouteFailed;
pub use resolver::ResolveError;
pub use stanza::{Packet, StanzaError};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::IntoRawFd;
use std::time::{Duration, Instant};

use rand::SeedableRng as _;
use rand::rngs::StdRng;
use roost_logging::err_with_src;
use roost_reactor::{Control, Fd, Handler, Reactor, TimeoutId, Token};

use conn::{InConn, OutConn, RouteState};
use dns::{BadHost, DnsCacheEntry, Resolution};
use out::OutQueue;
use resolver::{QueryId, Resolver};
use stream::{CodecFactory, RouterSink, StreamEvent, StreamError, is_fatal_stream_error};

pub type ConnId = u64;

const READ_BUF: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Reactor(#[from] roost_reactor::Error),
}

/// Events on incoming connections, drained by the inbound S2S handler.
#[derive(Debug)]
pub enum InEvent {
    Accepted { id: ConnId, peer: SocketAddr },
    Opened { id: ConnId, stream: String },
    Packet { id: ConnId, stanza: Element },
    Closed { id: ConnId },
}

/// The S2S engine. One per process; owns every table.
pub struct S2s {
    pub(crate) cfg: Config,
    pub(crate) rng: StdRng,
    pub(crate) codecs: Box<dyn CodecFactory>,
    pub(crate) router: Box<dyn RouterSink>,
    pub(crate) resolver: Resolver,

    pub(crate) conns: HashMap<ConnId, OutConn>,
    pub(crate) next_conn: ConnId,
    pub(crate) ins: HashMap<ConnId, InConn>,
    pub(crate) next_in: ConnId,

    /// Incoming stream id → incoming connection.
    pub(crate) in_streams: HashMap<String, ConnId>,
    /// Resolved endpoint → pooled outbound connection (reuse only).
    pub(crate) out_host: HashMap<HostPort, ConnId>,
    /// Destination domain → outbound connection.
    pub(crate) out_dest: HashMap<String, ConnId>,
    /// Per-route packet queues.
    pub(crate) outq: HashMap<RouteKey, OutQueue>,

    pub(crate) dnscache: HashMap<String, DnsCacheEntry>,
    pub(crate) dns_bad: HashMap<HostPort, BadHost>,
    pub(crate) resolutions: HashMap<String, Resolution>,
    pub(crate) lookups: HashMap<QueryId, String>,

    pub(crate) resolver_timer: Option<TimeoutId>,
    pub(crate) housekeeping_timer: Option<TimeoutId>,

    pub(crate) in_events: VecDeque<InEvent>,
    pub(crate) packet_count: u64,
}

impl S2s {
    pub fn new(
        cfg: Config,
        codecs: Box<dyn CodecFactory>,
        router: Box<dyn RouterSink>,
        seed: [u8; 32],
    ) -> Self {
        let upstreams = if cfg.upstream_resolvers.is_empty() {
            resolver::system_upstreams()
        } else {
            cfg.upstream_resolvers.clone()
        };

        Self {
            cfg,
            rng: StdRng::from_seed(seed),
            codecs,
            router,
            resolver: Resolver::new(upstreams),
            conns: HashMap::new(),
            next_conn: 1,
            ins: HashMap::new(),
            next_in: 1,
            in_streams: HashMap::new(),
            out_host: HashMap::new(),
            out_dest: HashMap::new(),
            outq: HashMap::new(),
            dnscache: HashMap::new(),
            dns_bad: HashMap::new(),
            resolutions: HashMap::new(),
            lookups: HashMap::new(),
            resolver_timer: None,
            housekeeping_timer: None,
            in_events: VecDeque::new(),
            packet_count: 0,
        }
    }

    /// Bind the resolver socket into the reactor and start housekeeping.
    /// Call once before the first `run` pass.
    pub fn attach(&mut self, m: &mut Reactor) -> Result<(), SetupError> {
        let want_v6 = self
            .resolver
            .upstreams()
            .first()
            .is_some_and(|addr| addr.is_ipv6());
        self.resolver.retain_family(want_v6);

        let bind: SocketAddr = if want_v6 {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        let fd = m.setup_fd(socket.into_raw_fd(), token::pack(token::RESOLVER, 0))?;
        m.read(fd);
        self.resolver.attach(fd);
        tracing::debug!(%fd, upstreams = ?self.resolver.upstreams(), "resolver attached");

        if self.cfg.check_interval > 0 {
            self.housekeeping_timer = Some(m.add_timeout(
                token::pack(token::HOUSEKEEPING, 0),
                Duration::from_secs(self.cfg.check_interval),
            ));
        }
        Ok(())
    }

    /// Start accepting incoming S2S streams on the configured port.
    pub fn listen(&mut self, m: &mut Reactor, bind_ip: IpAddr) -> Result<Fd, roost_reactor::Error> {
        m.listen(self.cfg.listen_port, bind_ip, token::pack(token::LISTENER, 0))
    }

    /// Abort the next `run` pass; call before tearing the process down.
    pub fn schedule_stop(&mut self, m: &mut Reactor) {
        m.add_immediate(token::pack(token::SHUTDOWN, 0));
    }

    /// Next pending event for the inbound S2S handler.
    pub fn poll_inbound_event(&mut self) -> Option<InEvent> {
        self.in_events.pop_front()
    }

    /// The inbound handler tells us which stream id belongs to which
    /// incoming connection; `<db:verify>` answers are matched through
    /// this table.
    pub fn register_in_stream(&mut self, stream_id: impl Into<String>, in_id: ConnId) {
        self.in_streams.insert(stream_id.into(), in_id);
    }

    /// Whether a directed route on an incoming connection has been
    /// validated by dialback. The inbound handler consults this before
    /// accepting stanzas on the route.
    pub fn incoming_route_valid(&self, in_id: ConnId, from: &str, to: &str) -> bool {
        self.ins.get(&in_id).is_some_and(|in_conn| {
            in_conn.states.get(&RouteKey::new(from, to)) == Some(&RouteState::Valid)
        })
    }

    /// Packets seen on outgoing streams since startup.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    fn resolver_readable(&mut self, m: &mut Reactor) {
        let mut completed = Vec::new();
        self.resolver.handle_readable(&mut completed);
        for (qid, result) in completed {
            self.on_dns_answer(m, qid, result);
        }
        self.reconcile_resolver_timer(m);
    }

    /// Keep exactly one timed callback armed for the resolver's next
    /// retransmit deadline.
    pub(crate) fn reconcile_resolver_timer(&mut self, m: &mut Reactor) {
        if let Some(id) = self.resolver_timer.take() {
            m.cancel_timeout(id);
        }
        if let Some(deadline) = self.resolver.poll_timeout() {
            let delay = deadline.saturating_duration_since(Instant::now());
            self.resolver_timer =
                Some(m.add_timeout(token::pack(token::RESOLVER_TIMER, 0), delay));
        }
    }

    fn housekeeping(&mut self, m: &mut Reactor) {
        let now = Instant::now();

        if self.cfg.check_queue > 0 && self.cfg.retry_limit > 0 {
            let limit = Duration::from_secs(self.cfg.retry_limit);
            let aged: Vec<RouteKey> = self
                .outq
                .iter()
                .filter(|(_, q)| now.duration_since(q.since) > limit)
                .map(|(rkey, _)| rkey.clone())
                .collect();
            for rkey in aged {
                tracing::info!(route = %rkey, "queue exceeded the retry limit, bouncing");
                self.bounce_route_queue(&rkey, StanzaError::ServiceUnavailable);
            }
        }

        if self.cfg.check_idle > 0 {
            let limit = Duration::from_secs(self.cfg.check_idle);
            let idle: Vec<Fd> = self
                .conns
                .values()
                .filter(|conn| now.duration_since(conn.last_packet) > limit)
                .map(|conn| conn.fd)
                .collect();
            for fd in idle {
                tracing::info!(%fd, "idle connection, closing");
                m.close(self, fd);
            }
        }

        // Verify requests and dialback handshakes that never got an
        // answer.
        if self.cfg.check_queue > 0 {
            let limit = Duration::from_secs(self.cfg.check_queue);
            let stalled: Vec<Fd> = self
                .conns
                .values()
                .filter(|conn| {
                    let verify_stalled =
                        conn.verify > 0 && now.duration_since(conn.last_verify) > limit;
                    let dialback_stalled = conn.states.iter().any(|(rkey, state)| {
                        *state == RouteState::InProgress
                            && conn
                                .states_time
                                .get(rkey)
                                .is_some_and(|at| now.duration_since(*at) > limit)
                    });
                    verify_stalled || dialback_stalled
                })
                .map(|conn| conn.fd)
                .collect();
            for fd in stalled {
                tracing::info!(%fd, "dialback handshake stalled, closing");
                m.close(self, fd);
            }
        }

        if self.cfg.check_keepalive > 0 {
            let limit = Duration::from_secs(self.cfg.check_keepalive);
            let probes: Vec<(ConnId, Fd)> = self
                .conns
                .iter()
                .filter(|(_, conn)| conn.online && now.duration_since(conn.last_activity) > limit)
                .map(|(conn_id, conn)| (*conn_id, conn.fd))
                .collect();
            for (conn_id, fd) in probes {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.codec.write_raw(b" ");
                }
                m.write(self, fd);
            }
        }

        self.dnscache.retain(|domain, entry| {
            let keep = entry.pending || !entry.is_expired(now);
            if !keep {
                tracing::debug!(domain = %domain, age = ?entry.init_time.elapsed(), "dropping expired dns cache entry");
            }
            keep
        });

        if self.cfg.check_interval > 0 {
            self.housekeeping_timer = Some(m.add_timeout(
                token::pack(token::HOUSEKEEPING, 0),
                Duration::from_secs(self.cfg.check_interval),
            ));
        }
    }

    fn conn_read(&mut self, m: &mut Reactor, fd: Fd, conn_id: ConnId) -> bool {
        let now = Instant::now();
        let mut buf = [0u8; READ_BUF];
        match roost_reactor::recv(fd, &mut buf) {
            Ok(0) => {
                tracing::debug!(%fd, "peer closed the connection");
                m.close(self, fd);
                false
            }
            Ok(n) => {
                let fed = {
                    let Some(conn) = self.conns.get_mut(&conn_id) else {
                        return false;
                    };
                    conn.last_activity = now;
                    conn.codec.feed(&buf[..n])
                };
                if let Err(error) = fed {
                    self.handle_stream_error(m, fd, conn_id, error);
                    return false;
                }
                self.drain_conn_events(m, conn_id);
                self.arm_conn_write(m, conn_id);
                self.conns.contains_key(&conn_id)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::info!(%fd, "read error: {}", err_with_src(&e));
                self.mark_bad_if_offline(conn_id);
                m.close(self, fd);
                false
            }
        }
    }

    fn conn_write(&mut self, m: &mut Reactor, fd: Fd, conn_id: ConnId) -> bool {
        enum Outcome {
            Flushed { more: bool, closing: bool },
            Block,
            Gone,
            Fail(io::Error),
        }

        let now = Instant::now();
        let outcome = match self.conns.get_mut(&conn_id) {
            None => Outcome::Gone,
            Some(conn) => {
                conn.last_activity = now;
                let sent = match conn.codec.pending_write() {
                    None => None,
                    Some(chunk) => Some(roost_reactor::send(fd, chunk)),
                };
                match sent {
                    None => Outcome::Flushed {
                        more: false,
                        closing: conn.codec.is_closing(),
                    },
                    Some(Ok(n)) => {
                        conn.codec.consume_write(n);
                        Outcome::Flushed {
                            more: conn.codec.pending_write().is_some(),
                            closing: conn.codec.is_closing(),
                        }
                    }
                    Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Block,
                    Some(Err(e)) => Outcome::Fail(e),
                }
            }
        };

        match outcome {
            Outcome::Gone => false,
            Outcome::Block => true,
            Outcome::Flushed { more, closing } => {
                if !more && closing {
                    m.close(self, fd);
                    return false;
                }
                more
            }
            Outcome::Fail(e) => {
                tracing::info!(%fd, "write error: {}", err_with_src(&e));
                self.mark_bad_if_offline(conn_id);
                m.close(self, fd);
                false
            }
        }
    }

    fn arm_conn_write(&mut self, m: &mut Reactor, conn_id: ConnId) {
        let fd = match self.conns.get_mut(&conn_id) {
            Some(conn) => {
                if conn.codec.pending_write().is_some() || conn.codec.is_closing() {
                    Some(conn.fd)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(fd) = fd {
            m.write(self, fd);
        }
    }

    fn drain_conn_events(&mut self, m: &mut Reactor, conn_id: ConnId) {
        loop {
            let event = match self.conns.get_mut(&conn_id) {
                Some(conn) => conn.codec.poll_event(),
                None => return,
            };
            match event {
                None => return,
                Some(StreamEvent::Opened { id, version }) => {
                    self.handle_stream_open(m, conn_id, id, version);
                }
                Some(StreamEvent::Packet(el)) => self.handle_conn_packet(m, conn_id, &el),
                Some(StreamEvent::Closed) => {
                    let Some(fd) = self.conns.get(&conn_id).map(|conn| conn.fd) else {
                        return;
                    };
                    m.close(self, fd);
                    return;
                }
            }
        }
    }

    fn handle_stream_open(
        &mut self,
        m: &mut Reactor,
        conn_id: ConnId,
        id: String,
        version: Option<String>,
    ) {
        let bring_online = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            tracing::debug!(fd = %conn.fd, host = %conn.hp, stream = %id, ?version, "stream open");

            if conn.online {
                false
            } else if version.is_none() || !self.cfg.tls_available {
                // Pre-XMPP peer or no local TLS: no features are coming,
                // dialback starts right away.
                conn.online = true;
                true
            } else {
                false
            }
        };
        if bring_online {
            self.send_dialbacks(m, conn_id);
        }
    }

    fn handle_conn_packet(&mut self, m: &mut Reactor, conn_id: ConnId, el: &Element) {
        self.packet_count += 1;
        let is_features = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            conn.packet_count += 1;
            conn.codec.remote_version().is_some()
                && el.ns() == stanza::NS_STREAMS
                && el.name() == "features"
        };
        if is_features {
            self.handle_stream_features(m, conn_id, el);
            return;
        }

        if el.ns() != stanza::NS_DIALBACK {
            tracing::debug!("non-dialback packet on an outgoing stream, dropping");
            return;
        }
        match el.name() {
            "result" => self.out_result(m, conn_id, el),
            "verify" => self.out_verify(m, conn_id, el),
            _ => tracing::debug!("unknown dialback packet, dropping"),
        }
    }

    fn handle_stream_features(&mut self, m: &mut Reactor, conn_id: ConnId, el: &Element) {
        let bring_online = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            let wants_tls = self.cfg.tls_available
                && !conn.codec.is_secure()
                && el.get_child("starttls", stanza::NS_TLS).is_some();

            if wants_tls && conn.codec.starttls() {
                tracing::debug!(fd = %conn.fd, "negotiating TLS");
                false
            } else {
                if wants_tls {
                    tracing::error!(fd = %conn.fd, host = %conn.hp, "unable to establish encrypted session with peer");
                }
                conn.online = true;
                true
            }
        };
        self.arm_conn_write(m, conn_id);
        if bring_online {
            self.send_dialbacks(m, conn_id);
        }
    }

    fn handle_stream_error(
        &mut self,
        m: &mut Reactor,
        fd: Fd,
        conn_id: ConnId,
        error: StreamError,
    ) {
        let state = self.conns.get(&conn_id).map(|conn| (conn.hp, conn.online));
        let Some((hp, online)) = state else {
            m.close(self, fd);
            return;
        };
        tracing::info!(%fd, host = %hp, "stream error: {error}");

        // Never reached the stream, or the peer refuses to service us:
        // suppress this endpoint for a while.
        if !online || is_fatal_stream_error(&error) {
            self.mark_bad(hp);
        }
        m.close(self, fd);
    }

    pub(crate) fn mark_bad(&mut self, hp: HostPort) {
        if self.cfg.dns_bad_timeout == 0 {
            return;
        }
        tracing::debug!(host = %hp, "marking host bad");
        self.dns_bad.insert(
            hp,
            BadHost {
                expiry: Instant::now() + Duration::from_secs(self.cfg.dns_bad_timeout),
            },
        );
    }

    fn mark_bad_if_offline(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.conns.get(&conn_id)
            && !conn.online
        {
            let hp = conn.hp;
            self.mark_bad(hp);
        }
    }

    fn in_read(&mut self, m: &mut Reactor, fd: Fd, in_id: ConnId) -> bool {
        let mut buf = [0u8; READ_BUF];
        match roost_reactor::recv(fd, &mut buf) {
            Ok(0) => {
                m.close(self, fd);
                false
            }
            Ok(n) => {
                let fed = {
                    let Some(in_conn) = self.ins.get_mut(&in_id) else {
                        return false;
                    };
                    in_conn.codec.feed(&buf[..n])
                };
                if let Err(error) = fed {
                    tracing::info!(%fd, "incoming stream error: {error}");
                    m.close(self, fd);
                    return false;
                }
                self.drain_in_events(m, in_id);
                self.arm_in_write(m, in_id);
                self.ins.contains_key(&in_id)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                tracing::info!(%fd, "incoming read error: {}", err_with_src(&e));
                m.close(self, fd);
                false
            }
        }
    }

    fn in_write(&mut self, m: &mut Reactor, fd: Fd, in_id: ConnId) -> bool {
        enum Outcome {
            Flushed { more: bool, closing: bool },
            Block,
            Gone,
            Fail(io::Error),
        }

        let outcome = match self.ins.get_mut(&in_id) {
            None => Outcome::Gone,
            Some(in_conn) => {
                let sent = match in_conn.codec.pending_write() {
                    None => None,
                    Some(chunk) => Some(roost_reactor::send(fd, chunk)),
                };
                match sent {
                    None => Outcome::Flushed {
                        more: false,
                        closing: in_conn.codec.is_closing(),
                    },
                    Some(Ok(n)) => {
                        in_conn.codec.consume_write(n);
                        Outcome::Flushed {
                            more: in_conn.codec.pending_write().is_some(),
                            closing: in_conn.codec.is_closing(),
                        }
                    }
                    Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Block,
                    Some(Err(e)) => Outcome::Fail(e),
                }
            }
        };

        match outcome {
            Outcome::Gone => false,
            Outcome::Block => true,
            Outcome::Flushed { more, closing } => {
                if !more && closing {
                    m.close(self, fd);
                    return false;
                }
                more
            }
            Outcome::Fail(e) => {
                tracing::info!(%fd, "incoming write error: {}", err_with_src(&e));
                m.close(self, fd);
                false
            }
        }
    }

    fn arm_in_write(&mut self, m: &mut Reactor, in_id: ConnId) {
        let fd = match self.ins.get_mut(&in_id) {
            Some(in_conn) => {
                if in_conn.codec.pending_write().is_some() || in_conn.codec.is_closing() {
                    Some(in_conn.fd)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(fd) = fd {
            m.write(self, fd);
        }
    }

    fn drain_in_events(&mut self, m: &mut Reactor, in_id: ConnId) {
        loop {
            let event = match self.ins.get_mut(&in_id) {
                Some(in_conn) => in_conn.codec.poll_event(),
                None => return,
            };
            match event {
                None => return,
                Some(StreamEvent::Opened { id, .. }) => {
                    self.in_streams.insert(id.clone(), in_id);
                    self.in_events.push_back(InEvent::Opened { id: in_id, stream: id });
                }
                Some(StreamEvent::Packet(el)) => {
                    self.in_events.push_back(InEvent::Packet {
                        id: in_id,
                        stanza: el,
                    });
                }
                Some(StreamEvent::Closed) => {
                    let Some(fd) = self.ins.get(&in_id).map(|in_conn| in_conn.fd) else {
                        return;
                    };
                    m.close(self, fd);
                    return;
                }
            }
        }
    }

    fn handle_in_close(&mut self, in_id: ConnId) {
        if self.ins.remove(&in_id).is_some() {
            self.in_streams.retain(|_, id| *id != in_id);
            self.in_events.push_back(InEvent::Closed { id: in_id });
        }
    }
}

impl Handler for S2s {
    fn on_read(&mut self, m: &mut Reactor, fd: Fd, tok: Token) -> bool {
        match token::kind(tok) {
            token::OUT => self.conn_read(m, fd, token::id(tok)),
            token::IN => self.in_read(m, fd, token::id(tok)),
            token::RESOLVER => {
                self.resolver_readable(m);
                true
            }
            _ => false,
        }
    }

    fn on_write(&mut self, m: &mut Reactor, fd: Fd, tok: Token) -> bool {
        match token::kind(tok) {
            token::OUT => self.conn_write(m, fd, token::id(tok)),
            token::IN => self.in_write(m, fd, token::id(tok)),
            _ => false,
        }
    }

    fn on_accept(&mut self, m: &mut Reactor, fd: Fd, _tok: Token, peer: SocketAddr) -> bool {
        let in_id = self.next_in;
        self.next_in += 1;

        let codec = self.codecs.inbound();
        self.ins.insert(
            in_id,
            InConn {
                fd,
                peer,
                codec,
                states: HashMap::new(),
            },
        );
        m.set_token(fd, token::incoming(in_id));
        m.read(fd);
        self.in_events.push_back(InEvent::Accepted { id: in_id, peer });
        tracing::info!(%fd, %peer, "incoming connection");
        true
    }

    fn on_close(&mut self, m: &mut Reactor, fd: Fd, tok: Token) {
        match token::kind(tok) {
            token::OUT => self.handle_out_close(m, token::id(tok)),
            token::IN => self.handle_in_close(token::id(tok)),
            token::LISTENER => tracing::info!(%fd, "listener closed"),
            token::RESOLVER => tracing::warn!(%fd, "resolver socket closed"),
            _ => {}
        }
    }

    fn on_timeout(&mut self, m: &mut Reactor, tok: Token) {
        match token::kind(tok) {
            token::HOUSEKEEPING => self.housekeeping(m),
            token::RESOLVER_TIMER => {
                self.resolver_timer = None;
                let mut completed = Vec::new();
                self.resolver.handle_timeout(Instant::now(), &mut completed);
                for (qid, result) in completed {
                    self.on_dns_answer(m, qid, result);
                }
                self.reconcile_resolver_timer(m);
            }
            _ => {}
        }
    }

    fn on_immediate(&mut self, _m: &mut Reactor, tok: Token) -> Control {
        if token::kind(tok) == token::SHUTDOWN {
            Control::Stop
        } else {
            Control::Continue
        }
    }
}

pub(crate) mod token {
    use roost_reactor::Token;

    const KIND_SHIFT: u32 = 56;
    const ID_MASK: u64 = (1 << KIND_SHIFT) - 1;

    pub const LISTENER: u8 = 1;
    pub const OUT: u8 = 2;
    pub const IN: u8 = 3;
    pub const RESOLVER: u8 = 4;
    pub const HOUSEKEEPING: u8 = 5;
    pub const RESOLVER_TIMER: u8 = 6;
    pub const SHUTDOWN: u8 = 7;

    pub fn pack(kind: u8, id: u64) -> Token {
        Token(((kind as u64) << KIND_SHIFT) | (id & ID_MASK))
    }

    pub fn out(id: u64) -> Token {
        pack(OUT, id)
    }

    pub fn incoming(id: u64) -> Token {
        pack(IN, id)
    }

    pub fn kind(tok: Token) -> u8 {
        (tok.0 >> KIND_SHIFT) as u8
    }

    pub fn id(tok: Token) -> u64 {
        tok.0 & ID_MASK
    }
}
