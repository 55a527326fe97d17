//! UDP stub resolver.
//!
//! One non-blocking UDP socket, owned by the reactor and registered as a
//! normal descriptor. The core is sans-IO: callers submit queries, hand in
//! readiness, and drive retransmission through `poll_timeout` /
//! `handle_timeout`. Completed lookups come back as `(QueryId, result)`
//! pairs; NXDOMAIN and friends are responses, not errors. Only transport
//! failure surfaces as [`ResolveError`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dns_wire::{DomainName, Query, RecordType, Response};
use rand::Rng as _;
use rand::rngs::StdRng;
use roost_reactor::Fd;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u8 = 3;
const MAX_DATAGRAM: usize = 4096;

/// Handle of an in-flight lookup, for matching answers and cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueryId(u16);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    #[error("query timed out")]
    TimedOut,
    #[error("resolver socket not attached")]
    NotAttached,
    #[error("no upstream resolvers")]
    NoUpstreams,
}

struct PendingQuery {
    query: Query,
    upstream: usize,
    attempts: u8,
    deadline: Instant,
}

pub(crate) struct Resolver {
    fd: Option<Fd>,
    upstreams: Vec<SocketAddr>,
    pending: HashMap<u16, PendingQuery>,
}

impl Resolver {
    pub fn new(upstreams: Vec<SocketAddr>) -> Self {
        Self {
            fd: None,
            upstreams,
            pending: HashMap::new(),
        }
    }

    pub fn attach(&mut self, fd: Fd) {
        self.fd = Some(fd);
    }

    pub fn upstreams(&self) -> &[SocketAddr] {
        &self.upstreams
    }

    /// Drop upstreams whose family the socket cannot reach.
    pub fn retain_family(&mut self, want_v6: bool) {
        self.upstreams.retain(|addr| {
            let keep = addr.is_ipv6() == want_v6;
            if !keep {
                tracing::warn!(%addr, "skipping upstream resolver of mismatched address family");
            }
            keep
        });
    }

    pub fn lookup(
        &mut self,
        name: DomainName,
        rtype: RecordType,
        now: Instant,
        rng: &mut StdRng,
    ) -> Result<QueryId, ResolveError> {
        let fd = self.fd.ok_or(ResolveError::NotAttached)?;
        if self.upstreams.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }

        let mut query = Query::new(name, rtype);
        while self.pending.contains_key(&query.id()) {
            query = query.with_id(rng.gen_range(0..=u16::MAX));
        }
        let id = query.id();
        let upstream = self.upstreams[0];

        tracing::debug!(qid = id, %upstream, "sending {rtype} query");
        if let Err(e) = roost_reactor::send_to(fd, query.as_bytes(), upstream) {
            // The retransmit timer picks this query up again.
            tracing::debug!(qid = id, %upstream, "send failed: {e}");
        }

        self.pending.insert(
            id,
            PendingQuery {
                query,
                upstream: 0,
                attempts: 1,
                deadline: now + QUERY_TIMEOUT,
            },
        );
        Ok(QueryId(id))
    }

    pub fn cancel(&mut self, id: QueryId) {
        self.pending.remove(&id.0);
    }

    /// Drain every datagram currently queued on the socket.
    pub fn handle_readable(
        &mut self,
        completed: &mut Vec<(QueryId, Result<Response, ResolveError>)>,
    ) {
        let Some(fd) = self.fd else {
            return;
        };
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = match roost_reactor::recv_from(fd, &mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("resolver socket read error: {e}");
                    break;
                }
            };
            if !self.upstreams.contains(&from) {
                tracing::debug!(%from, "datagram from unknown resolver, dropping");
                continue;
            }
            let response = match Response::parse(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(%from, "unparseable DNS answer: {e}");
                    continue;
                }
            };
            let id = response.id();
            let Some(pending) = self.pending.get(&id) else {
                tracing::debug!(qid = id, "answer for unknown query, dropping");
                continue;
            };
            if pending.query.domain() != response.domain()
                || pending.query.qtype() != response.qtype()
            {
                tracing::debug!(qid = id, "answer question mismatch, dropping");
                continue;
            }

            self.pending.remove(&id);
            completed.push((QueryId(id), Ok(response)));
        }
    }

    /// Earliest retransmit/expiry deadline across pending queries.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Retransmit overdue queries, rotating upstreams; expire the ones out
    /// of attempts.
    pub fn handle_timeout(
        &mut self,
        now: Instant,
        completed: &mut Vec<(QueryId, Result<Response, ResolveError>)>,
    ) {
        let Some(fd) = self.fd else {
            return;
        };
        let overdue: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            let Some(pending) = self.pending.get_mut(&id) else {
                continue;
            };
            if pending.attempts >= MAX_ATTEMPTS {
                self.pending.remove(&id);
                tracing::debug!(qid = id, "query ran out of attempts");
                completed.push((QueryId(id), Err(ResolveError::TimedOut)));
                continue;
            }

            pending.attempts += 1;
            pending.upstream = (pending.upstream + 1) % self.upstreams.len();
            pending.deadline = now + QUERY_TIMEOUT;
            let upstream = self.upstreams[pending.upstream];
            tracing::debug!(qid = id, %upstream, attempt = pending.attempts, "retransmitting");
            if let Err(e) = roost_reactor::send_to(fd, pending.query.as_bytes(), upstream) {
                tracing::debug!(qid = id, %upstream, "retransmit failed: {e}");
            }
        }
    }
}

/// Upstreams from `/etc/resolv.conf`, falling back to localhost.
pub(crate) fn system_upstreams() -> Vec<SocketAddr> {
    let fallback = vec![SocketAddr::from(([127, 0, 0, 1], 53))];
    let Ok(content) = std::fs::read("/etc/resolv.conf") else {
        return fallback;
    };
    let Ok(parsed) = resolv_conf::Config::parse(&content) else {
        return fallback;
    };

    let upstreams: Vec<SocketAddr> = parsed
        .nameservers
        .iter()
        .map(|ns| {
            let ip = match ns {
                resolv_conf::ScopedIp::V4(ip) => IpAddr::V4(*ip),
                resolv_conf::ScopedIp::V6(ip, _) => IpAddr::V6(*ip),
            };
            SocketAddr::new(ip, 53)
        })
        .collect();

    if upstreams.is_empty() {
        fallback
    } else {
        upstreams
    }
}
