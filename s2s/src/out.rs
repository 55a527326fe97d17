//! Outbound dispatch: the packet path from the router link to the wire.
//!
//! `out_packet` consults the route state on the carrying connection and
//! either writes, queues, or starts dialback. `out_route` finds or builds
//! that connection, leaning on the DNS cache and the weighted selector.
//! Failures funnel through the queue-bounce machinery back into the
//! router.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use minidom::Element;
use roost_reactor::{Fd, Reactor};

use crate::conn::{HostPort, OutConn, RouteKey, RouteState};
use crate::dns::{BadHost, DnsCacheEntry, DnsResult, dns_select};
use crate::stanza::{self, Packet, StanzaError};
use crate::stream::StreamOpen;
use crate::{ConnId, S2s, token};

/// No connection could be produced for the route; the caller's queue has
/// been (or must be) bounced.
#[derive(Debug, thiserror::Error)]
#[error("no usable route to the remote domain")]
pub struct RouteFailed;

/// Per-route FIFO of packets awaiting an authenticated connection.
pub(crate) struct OutQueue {
    pub packets: VecDeque<Packet>,
    /// When the queue came into existence; the retry limit is measured
    /// from here.
    pub since: Instant,
}

impl S2s {
    /// Send a packet towards its destination domain. Packets that cannot
    /// be written yet are queued on their route; a hard routing failure
    /// bounces the whole route queue.
    pub fn out_packet(&mut self, m: &mut Reactor, pkt: Packet) -> Result<(), RouteFailed> {
        let rkey = RouteKey::new(pkt.from.clone(), pkt.to.clone());

        let conn_id = match self.out_route(m, &rkey, true) {
            Ok(Some(conn_id)) => conn_id,
            Ok(None) => {
                self.queue_packet(pkt);
                return Ok(());
            }
            Err(e) => {
                self.queue_packet(pkt);
                self.bounce_route_queue(&rkey, StanzaError::ServiceUnavailable);
                return Err(e);
            }
        };

        enum Step {
            Write(Fd),
            Queue,
            QueueAndDialback,
            Gone,
        }
        let step = match self.conns.get(&conn_id) {
            None => Step::Gone,
            Some(conn) if !conn.online => Step::Queue,
            Some(conn) => match conn.states.get(&rkey) {
                Some(RouteState::Valid) => Step::Write(conn.fd),
                _ if pkt.db => Step::Write(conn.fd),
                Some(RouteState::InProgress) => Step::Queue,
                None => Step::QueueAndDialback,
            },
        };

        match step {
            Step::Gone | Step::Queue => self.queue_packet(pkt),
            Step::QueueAndDialback => {
                self.queue_packet(pkt);
                // New route on an established connection: piggy-back a
                // dialback exchange on it.
                self.out_dialback(m, conn_id, &rkey);
            }
            Step::Write(fd) => {
                let now = Instant::now();
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    tracing::debug!(%fd, route = %rkey, "writing packet");
                    let element = if pkt.db {
                        if pkt.stanza.name() == "verify" {
                            conn.verify += 1;
                            conn.last_verify = now;
                        }
                        pkt.stanza
                    } else {
                        // The stream speaks jabber:server; client-scoped
                        // stanzas are re-scoped before the write (XMPP
                        // §11.2.2).
                        stanza::rescope_to_server(&pkt.stanza)
                    };
                    conn.codec.write(element);
                    conn.last_packet = now;
                }
                m.write(self, fd);
            }
        }
        Ok(())
    }

    /// Find or create the connection carrying `rkey`.
    ///
    /// `Ok(None)` means resolution is in flight and the caller must queue.
    /// `Err` means nothing is usable: the caller bounces.
    pub(crate) fn out_route(
        &mut self,
        m: &mut Reactor,
        rkey: &RouteKey,
        allow_bad: bool,
    ) -> Result<Option<ConnId>, RouteFailed> {
        let dkey = rkey.to.clone();
        let now = Instant::now();

        let (conn_id, reuse) = if let Some(conn_id) = self.out_dest.get(&dkey).copied() {
            tracing::debug!(domain = %dkey, conn = conn_id, "connection found");
            (conn_id, false)
        } else {
            enum CacheStep {
                Pending,
                Kick,
                NoHost,
                Select(HostPort),
            }
            let step = {
                let entry = self
                    .dnscache
                    .entry(dkey.clone())
                    .or_insert_with(|| DnsCacheEntry::new(dkey.clone(), now));
                if entry.pending {
                    CacheStep::Pending
                } else if entry.is_expired(now) {
                    entry.pending = true;
                    entry.init_time = now;
                    CacheStep::Kick
                } else {
                    match dns_select(
                        entry,
                        now,
                        allow_bad,
                        self.cfg.out_reuse,
                        &self.out_host,
                        &self.dns_bad,
                        self.cfg.dns_bad_timeout > 0,
                        &mut self.rng,
                    ) {
                        None => CacheStep::NoHost,
                        Some(hp) => {
                            // Selection may have force-expired the entry.
                            if entry.is_expired(now) {
                                entry.pending = true;
                                entry.init_time = now;
                                CacheStep::Kick
                            } else {
                                CacheStep::Select(hp)
                            }
                        }
                    }
                }
            };

            match step {
                CacheStep::Pending => {
                    tracing::debug!(domain = %dkey, "resolution pending");
                    return Ok(None);
                }
                CacheStep::Kick => {
                    tracing::debug!(domain = %dkey, "requesting resolution");
                    self.dns_resolve_domain(m, &dkey);
                    return Ok(None);
                }
                CacheStep::NoHost => return Err(RouteFailed),
                CacheStep::Select(hp) => {
                    let pooled = self
                        .cfg
                        .out_reuse
                        .then(|| self.out_host.get(&hp).copied())
                        .flatten();
                    if let Some(conn_id) = pooled {
                        tracing::info!(conn = conn_id, host = %hp, domain = %dkey, "reusing connection");
                        self.out_dest.insert(dkey.clone(), conn_id);
                        (conn_id, true)
                    } else {
                        return self.open_connection(m, rkey, &dkey, hp, now);
                    }
                }
            }
        };

        // Connection in progress, or re-using: record the route on it.
        if let Some(conn) = self.conns.get_mut(&conn_id)
            && (!conn.online || reuse)
        {
            conn.routes.insert(rkey.clone());
        }
        Ok(Some(conn_id))
    }

    fn open_connection(
        &mut self,
        m: &mut Reactor,
        rkey: &RouteKey,
        dkey: &str,
        hp: HostPort,
        now: Instant,
    ) -> Result<Option<ConnId>, RouteFailed> {
        let conn_id = self.next_conn;
        self.next_conn += 1;

        tracing::debug!(host = %hp, "initiating connection");
        let fd = match m.connect(hp.addr(), self.cfg.origin_ip, token::out(conn_id)) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::info!(host = %hp, domain = dkey, "connect failed: {e}");
                if self.cfg.dns_bad_timeout > 0 {
                    self.dns_bad.insert(
                        hp,
                        BadHost {
                            expiry: now + Duration::from_secs(self.cfg.dns_bad_timeout),
                        },
                    );
                }
                // Try again, skipping the host that just failed.
                return self.out_route(m, rkey, false);
            }
        };
        tracing::info!(%fd, host = %hp, domain = dkey, "outgoing connection");

        let open = if self.cfg.tls_available {
            StreamOpen {
                to: Some(dkey.to_owned()),
                from: Some(rkey.from.clone()),
                version: Some("1.0"),
            }
        } else {
            StreamOpen::default()
        };
        let codec = self.codecs.outbound(open);
        let mut conn = OutConn::new(
            fd,
            hp,
            (!self.cfg.out_reuse).then(|| dkey.to_owned()),
            codec,
            now,
        );
        conn.routes.insert(rkey.clone());
        self.conns.insert(conn_id, conn);
        if self.cfg.out_reuse {
            self.out_host.insert(hp, conn_id);
        }
        self.out_dest.insert(dkey.to_owned(), conn_id);

        // The codec holds the stream header; both intents replay once the
        // connect completes.
        m.read(fd);
        m.write(self, fd);
        Ok(Some(conn_id))
    }

    /// Start the dialback handshake for one route on a connection.
    pub(crate) fn out_dialback(&mut self, m: &mut Reactor, conn_id: ConnId, rkey: &RouteKey) {
        let now = Instant::now();
        let fd = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            let Some(stream_id) = conn.codec.stream_id() else {
                tracing::warn!(route = %rkey, "no stream id yet, cannot start dialback");
                return;
            };
            let key = stanza::db_key(&self.cfg.local_secret, &rkey.to, &stream_id);
            tracing::info!(fd = %conn.fd, host = %conn.hp, route = %rkey, "sending dialback auth request");
            conn.codec
                .write(stanza::db_result(&rkey.from, &rkey.to, &key));
            conn.states.insert(rkey.clone(), RouteState::InProgress);
            conn.states_time.insert(rkey.clone(), now);
            conn.fd
        };
        m.write(self, fd);
    }

    /// The stream came up: clear the endpoint's bad-host entry and start
    /// dialback for every route multiplexed on the connection.
    pub(crate) fn send_dialbacks(&mut self, m: &mut Reactor, conn_id: ConnId) {
        let (hp, routes) = {
            let Some(conn) = self.conns.get(&conn_id) else {
                return;
            };
            (conn.hp, conn.routes.iter().cloned().collect::<Vec<_>>())
        };
        if self.cfg.dns_bad_timeout > 0 && self.dns_bad.remove(&hp).is_some() {
            tracing::debug!(host = %hp, "removed bad host entry");
        }
        for rkey in routes {
            self.out_dialback(m, conn_id, &rkey);
        }
    }

    /// A finished resolution lands in the cache and the domain's queues
    /// are flushed (or bounced, when nothing resolved).
    pub(crate) fn out_resolve(
        &mut self,
        m: &mut Reactor,
        domain: &str,
        results: HashMap<HostPort, DnsResult>,
        expiry: Instant,
    ) {
        if results.is_empty() {
            if let Some(entry) = self.dnscache.get_mut(domain) {
                entry.results = None;
                entry.expiry = Some(expiry);
                entry.pending = false;
            }
            tracing::info!(domain, "dns lookup failed");
            self.bounce_domain_queues(domain, StanzaError::RemoteServerNotFound);
            return;
        }

        tracing::info!(domain, results = results.len(), "dns lookup complete");
        let Some(entry) = self.dnscache.get_mut(domain) else {
            tracing::debug!(domain, "resolution was never requested, dropping");
            return;
        };
        entry.results = Some(results);
        entry.expiry = Some(expiry);
        entry.pending = false;

        self.flush_domain_queues(m, domain);

        if !self.cfg.dns_cache_enabled
            && self.dnscache.get(domain).is_some_and(|entry| !entry.pending)
        {
            self.dnscache.remove(domain);
        }
    }

    /// `<db:result type=…>` answering one of our auth requests.
    pub(crate) fn out_result(&mut self, m: &mut Reactor, conn_id: ConnId, el: &Element) {
        let Some(from) = el.attr("from") else {
            tracing::debug!("missing from on db result packet");
            return;
        };
        let Some(to) = el.attr("to") else {
            tracing::debug!("missing to on db result packet");
            return;
        };
        let rkey = RouteKey::new(to, from);

        if el.attr("type") == Some("valid") {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                conn.states.insert(rkey.clone(), RouteState::Valid);
                tracing::info!(fd = %conn.fd, host = %conn.hp, route = %rkey, "outgoing route is now valid");
            }
            self.flush_route_queue(m, &rkey);
            return;
        }

        let fd = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            tracing::info!(fd = %conn.fd, host = %conn.hp, route = %rkey, "outgoing route is now invalid, closing connection");
            conn.codec
                .stream_error("invalid-id", "dialback negotiation failed");
            conn.codec.close();
            conn.fd
        };
        self.bounce_route_queue(&rkey, StanzaError::ServiceUnavailable);
        m.write(self, fd);
    }

    /// `<db:verify type=…>`: the remote answered a verify we relayed for
    /// an incoming stream.
    pub(crate) fn out_verify(&mut self, m: &mut Reactor, conn_id: ConnId, el: &Element) {
        let (Some(from), Some(to), Some(stream)) = (el.attr("from"), el.attr("to"), el.attr("id"))
        else {
            tracing::debug!("missing attributes on db verify packet");
            return;
        };
        let Some(in_id) = self.in_streams.get(stream).copied() else {
            tracing::debug!(stream, "verify for unknown incoming stream, dropping");
            return;
        };
        let rkey = RouteKey::new(to, from);
        let valid = el.attr("type") == Some("valid");

        let fd = {
            let Some(in_conn) = self.ins.get_mut(&in_id) else {
                return;
            };
            if valid {
                in_conn.states.insert(rkey.clone(), RouteState::Valid);
                tracing::info!(fd = %in_conn.fd, peer = %in_conn.peer, route = %rkey, "incoming route is now valid");
            } else {
                tracing::info!(fd = %in_conn.fd, peer = %in_conn.peer, route = %rkey, "incoming route is now invalid");
            }
            in_conn.codec.write(stanza::db_result_type(to, from, valid));
            if !valid {
                in_conn
                    .codec
                    .stream_error("invalid-id", "dialback negotiation failed");
                in_conn.codec.close();
            }
            in_conn.fd
        };
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.verify = conn.verify.saturating_sub(1);
        }
        m.write(self, fd);
    }

    /// An outbound connection went away: drop it from the tables, then
    /// retry or bounce every route it carried.
    pub(crate) fn handle_out_close(&mut self, m: &mut Reactor, conn_id: ConnId) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        tracing::info!(
            fd = %conn.fd,
            host = %conn.hp,
            packets = conn.packet_count,
            outstanding_verifies = conn.verify,
            age = ?conn.init_time.elapsed(),
            "disconnect"
        );

        if self.cfg.out_reuse && self.out_host.get(&conn.hp) == Some(&conn_id) {
            self.out_host.remove(&conn.hp);
        }
        if let Some(dkey) = &conn.dkey
            && self.out_dest.get(dkey) == Some(&conn_id)
        {
            self.out_dest.remove(dkey);
        }
        for rkey in &conn.routes {
            if self.out_dest.get(&rkey.to) == Some(&conn_id) {
                self.out_dest.remove(&rkey.to);
            }
        }

        let now = Instant::now();
        let retry_limit = Duration::from_secs(self.cfg.retry_limit);
        for rkey in &conn.routes {
            let queue = self
                .outq
                .get(rkey)
                .map(|q| (q.packets.len(), now.duration_since(q.since)));
            let retryable = match queue {
                Some((len, age)) if len > 0 => self.cfg.retry_limit == 0 || age <= retry_limit,
                _ => false,
            };
            if retryable {
                tracing::debug!(route = %rkey, "retrying connection");
                match self.out_route(m, rkey, false) {
                    Ok(Some(_)) => self.flush_route_queue(m, rkey),
                    Ok(None) => {}
                    Err(RouteFailed) => {
                        self.bounce_route_queue(rkey, StanzaError::ServiceUnavailable);
                    }
                }
            } else {
                self.bounce_route_queue(rkey, StanzaError::ServiceUnavailable);
            }
        }
    }

    pub(crate) fn queue_packet(&mut self, pkt: Packet) {
        let rkey = RouteKey::new(pkt.from.clone(), pkt.to.clone());
        tracing::debug!(route = %rkey, "queueing packet");
        self.outq
            .entry(rkey)
            .or_insert_with(|| OutQueue {
                packets: VecDeque::new(),
                since: Instant::now(),
            })
            .packets
            .push_back(pkt);
    }

    /// Run every queued packet for the route through `out_packet` again.
    /// Stops early if the queue is bounced out from under the loop.
    pub(crate) fn flush_route_queue(&mut self, m: &mut Reactor, rkey: &RouteKey) {
        let Some(npkt) = self.outq.get(rkey).map(|q| q.packets.len()) else {
            return;
        };
        tracing::debug!(route = %rkey, npkt, "flushing queue");

        for _ in 0..npkt {
            let Some(pkt) = self
                .outq
                .get_mut(rkey)
                .and_then(|q| q.packets.pop_front())
            else {
                return;
            };
            if self.out_packet(m, pkt).is_err() {
                return;
            }
        }

        if self.outq.get(rkey).is_some_and(|q| q.packets.is_empty()) {
            tracing::debug!(route = %rkey, "deleting drained queue");
            self.outq.remove(rkey);
        }
    }

    pub(crate) fn flush_domain_queues(&mut self, m: &mut Reactor, domain: &str) {
        let routes: Vec<RouteKey> = self
            .outq
            .keys()
            .filter(|rkey| rkey.to == domain)
            .cloned()
            .collect();
        for rkey in routes {
            self.flush_route_queue(m, &rkey);
        }
    }

    /// Bounce the route's queue back into the router. Returns how many
    /// error stanzas were produced.
    pub(crate) fn bounce_route_queue(&mut self, rkey: &RouteKey, err: StanzaError) -> usize {
        let Some(queue) = self.outq.remove(rkey) else {
            return 0;
        };
        let mut bounced = 0;
        for pkt in queue.packets {
            if stanza::is_bounceable(&pkt.stanza) {
                self.router.deliver(stanza::bounce_error(&pkt.stanza, err));
                bounced += 1;
            }
        }
        tracing::debug!(route = %rkey, bounced, "bounced and deleted queue");
        bounced
    }

    pub(crate) fn bounce_domain_queues(&mut self, domain: &str, err: StanzaError) -> usize {
        let routes: Vec<RouteKey> = self
            .outq
            .keys()
            .filter(|rkey| rkey.to == domain)
            .cloned()
            .collect();
        routes
            .iter()
            .map(|rkey| self.bounce_route_queue(rkey, err))
            .sum()
    }
}
