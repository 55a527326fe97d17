//! Domain resolution: the per-domain cache, the SRV → AAAA/A chain and the
//! weighted host selection.
//!
//! A resolution walks every configured SRV prefix first, merging all
//! answers, then expands each discovered target (or the synthesized
//! fallback host) to addresses one at a time. The finished result set gets
//! its TTLs clamped and lands in the cache via `out_resolve`.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dns_wire::{DomainName, RecordType, Response, ResponseCode, SrvRecord};
use rand::Rng as _;
use rand::rngs::StdRng;
use roost_reactor::Reactor;

use crate::conn::HostPort;
use crate::resolver::{QueryId, ResolveError};
use crate::{ConnId, S2s};

/// Hard cap on hosts and addresses kept per resolution; extra entries are
/// dropped.
pub(crate) const DNS_MAX_RESULTS: usize = 50;

const FALLBACK_PORT: u16 = 5269;
const MAX_WEIGHT: u32 = 65535 << 8;

/// Cached resolution for one domain. `results: None` with an unexpired
/// `expiry` is a negative entry.
pub(crate) struct DnsCacheEntry {
    pub name: String,
    pub pending: bool,
    pub expiry: Option<Instant>,
    pub init_time: Instant,
    pub results: Option<HashMap<HostPort, DnsResult>>,
}

impl DnsCacheEntry {
    pub fn new(name: impl Into<String>, now: Instant) -> Self {
        Self {
            name: name.into(),
            pending: false,
            expiry: None,
            init_time: now,
            results: None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expiry {
            Some(expiry) => now > expiry,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DnsResult {
    pub prio: u16,
    /// Pre-shifted weight, see [`shift_weight`].
    pub weight: u32,
    pub expiry: Instant,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BadHost {
    pub expiry: Instant,
}

/// RFC 2782: "records with weight 0 should have a very small chance of
/// being selected". Raw 0 maps to 16, raw 1..65535 to 256..16776960, which
/// keeps running sums for up to 50 hosts comfortably inside 32 bits.
fn shift_weight(raw: u16) -> u32 {
    if raw == 0 { 1 << 4 } else { (raw as u32) << 8 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Srv,
    Aaaa,
    A,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SrvTarget {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRes {
    prio: u16,
    weight: u32,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CurrentHost {
    host: String,
    port: u16,
    prio: u16,
    weight: u32,
    /// Minimum-TTL carry from the SRV record; zero means uncapped.
    ttl_cap: Duration,
}

/// One in-flight resolution.
pub(crate) struct Resolution {
    /// Unicode domain, the cache key.
    domain: String,
    /// IDNA-encoded name actually queried.
    name: String,
    srv_i: usize,
    pub(crate) phase: Phase,
    hosts: HashMap<SrvTarget, PendingRes>,
    results: HashMap<HostPort, PendingRes>,
    cur: Option<CurrentHost>,
    pub(crate) query: Option<QueryId>,
}

enum Advance {
    QueryAgain,
    Finalize,
}

fn merge_weighted<K: Eq + Hash + std::fmt::Debug>(
    map: &mut HashMap<K, PendingRes>,
    key: K,
    prio: u16,
    weight: u32,
    ttl: Duration,
) {
    if let Some(existing) = map.get_mut(&key) {
        if prio < existing.prio {
            existing.prio = prio;
        }
        if prio == existing.prio {
            existing.weight = (existing.weight + weight).min(MAX_WEIGHT);
        }
        if ttl > existing.ttl {
            existing.ttl = ttl;
        }
        tracing::debug!(?key, prio = existing.prio, weight = existing.weight, "entry updated");
    } else if map.len() < DNS_MAX_RESULTS {
        map.insert(key, PendingRes { prio, weight, ttl });
    } else {
        tracing::debug!(?key, "result limit reached, entry ignored");
    }
}

impl S2s {
    /// Kick off the asynchronous chain for `domain`. The caller has already
    /// marked the cache entry pending.
    pub(crate) fn dns_resolve_domain(&mut self, m: &mut Reactor, domain: &str) {
        let name = match idna::domain_to_ascii(domain) {
            Ok(name) => name,
            Err(e) => {
                tracing::error!(domain, "idna encode failed: {e}");
                domain.to_owned()
            }
        };
        tracing::debug!(domain, name = %name, "resolution started");

        self.resolutions.insert(
            domain.to_owned(),
            Resolution {
                domain: domain.to_owned(),
                name,
                srv_i: 0,
                phase: Phase::Srv,
                hosts: HashMap::new(),
                results: HashMap::new(),
                cur: None,
                query: None,
            },
        );
        self.dns_continue_srv(m, domain.to_owned());
    }

    /// An answer (or transport failure) from the resolver.
    pub(crate) fn on_dns_answer(
        &mut self,
        m: &mut Reactor,
        qid: QueryId,
        result: Result<Response, ResolveError>,
    ) {
        let Some(domain) = self.lookups.remove(&qid) else {
            tracing::debug!("answer for unknown lookup, dropping");
            return;
        };
        let phase = {
            let Some(res) = self.resolutions.get_mut(&domain) else {
                return;
            };
            if res.query != Some(qid) {
                return;
            }
            res.query = None;
            res.phase
        };

        match phase {
            Phase::Srv => {
                self.dns_process_srv(&domain, result);
                if let Some(res) = self.resolutions.get_mut(&domain) {
                    res.srv_i += 1;
                }
                self.dns_continue_srv(m, domain);
            }
            Phase::Aaaa => {
                self.dns_process_addresses(&domain, result);
                if let Some(res) = self.resolutions.get_mut(&domain) {
                    res.phase = Phase::A;
                }
                self.dns_query_host(m, domain);
            }
            Phase::A => {
                self.dns_process_addresses(&domain, result);
                match self.dns_advance_host(&domain) {
                    Some(Advance::QueryAgain) => self.dns_query_host(m, domain),
                    Some(Advance::Finalize) => self.dns_finalize(m, &domain),
                    None => {}
                }
            }
        }
    }

    /// Issue the next SRV lookup, or move on to host expansion once every
    /// configured prefix has answered.
    fn dns_continue_srv(&mut self, m: &mut Reactor, domain: String) {
        loop {
            let next = {
                let Some(res) = self.resolutions.get(&domain) else {
                    return;
                };
                self.cfg
                    .lookup_srv
                    .get(res.srv_i)
                    .map(|prefix| format!("{prefix}.{}", res.name))
            };
            match next {
                Some(qname) => {
                    if self.dns_submit(m, &domain, &qname, RecordType::SRV) {
                        return;
                    }
                    // Submission failed; treat like an empty answer.
                    if let Some(res) = self.resolutions.get_mut(&domain) {
                        res.srv_i += 1;
                    }
                }
                None => {
                    self.dns_begin_hosts(m, domain);
                    return;
                }
            }
        }
    }

    fn dns_process_srv(&mut self, domain: &str, result: Result<Response, ResolveError>) {
        let prefix = self
            .resolutions
            .get(domain)
            .and_then(|res| self.cfg.lookup_srv.get(res.srv_i).cloned())
            .unwrap_or_default();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::info!(domain, prefix = %prefix, "SRV lookup failed: {e}");
                return;
            }
        };
        match response.response_code() {
            ResponseCode::NOERROR => {}
            ResponseCode::NXDOMAIN => {
                tracing::info!(domain, prefix = %prefix, "SRV lookup: NXDOMAIN");
                return;
            }
            code => {
                tracing::info!(domain, prefix = %prefix, "SRV lookup refused: {code}");
                return;
            }
        }

        let Some(res) = self.resolutions.get_mut(domain) else {
            return;
        };
        let mut records = 0;
        for srv in response.srv_records() {
            if srv.target.is_empty() {
                tracing::warn!(domain, prefix = %prefix, "SRV record with empty target, skipping");
                continue;
            }
            tracing::debug!(
                domain,
                target = %srv.target,
                port = srv.port,
                priority = srv.priority,
                weight = srv.weight,
                "SRV record"
            );
            add_srv_host(&mut res.hosts, &srv);
            records += 1;
        }
        if records == 0 {
            tracing::info!(domain, prefix = %prefix, "empty SRV response");
        }
    }

    /// SRV exhausted: drain the discovered hosts, or synthesize the
    /// fallback `domain:5269` entry when there are none.
    fn dns_begin_hosts(&mut self, m: &mut Reactor, domain: String) {
        {
            let Some(res) = self.resolutions.get_mut(&domain) else {
                return;
            };
            if res.hosts.is_empty() {
                tracing::debug!(domain = %domain, "no SRV hosts, falling back to the domain itself");
                res.cur = Some(CurrentHost {
                    host: res.name.clone(),
                    port: FALLBACK_PORT,
                    prio: 0,
                    weight: 0,
                    ttl_cap: Duration::ZERO,
                });
            } else {
                pop_host(res);
            }
            res.phase = if self.cfg.resolve_aaaa {
                Phase::Aaaa
            } else {
                Phase::A
            };
        }
        self.dns_query_host(m, domain);
    }

    /// Issue the lookup for the current host/phase, walking forward past
    /// submission failures.
    fn dns_query_host(&mut self, m: &mut Reactor, domain: String) {
        loop {
            let request = {
                let Some(res) = self.resolutions.get(&domain) else {
                    return;
                };
                res.cur.as_ref().map(|cur| {
                    let rtype = match res.phase {
                        Phase::Aaaa => RecordType::AAAA,
                        _ => RecordType::A,
                    };
                    (cur.host.clone(), rtype)
                })
            };
            let Some((qname, rtype)) = request else {
                self.dns_finalize(m, &domain);
                return;
            };
            if self.dns_submit(m, &domain, &qname, rtype) {
                return;
            }
            match self.dns_advance_host(&domain) {
                Some(Advance::QueryAgain) => continue,
                Some(Advance::Finalize) => {
                    self.dns_finalize(m, &domain);
                    return;
                }
                None => return,
            }
        }
    }

    fn dns_process_addresses(&mut self, domain: &str, result: Result<Response, ResolveError>) {
        let Some(res) = self.resolutions.get_mut(domain) else {
            return;
        };
        let Some(cur) = res.cur.clone() else {
            tracing::error!(domain, "address answer without a current host");
            return;
        };
        let rtype = match res.phase {
            Phase::Aaaa => "AAAA",
            _ => "A",
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::info!(domain, host = %cur.host, "{rtype} lookup failed: {e}");
                return;
            }
        };
        match response.response_code() {
            ResponseCode::NOERROR => {}
            ResponseCode::NXDOMAIN => {
                tracing::info!(domain, host = %cur.host, "{rtype} lookup: NXDOMAIN");
                return;
            }
            code => {
                tracing::info!(domain, host = %cur.host, "{rtype} lookup refused: {code}");
                return;
            }
        }

        for (ip, mut ttl) in response.addresses() {
            if cur.ttl_cap > Duration::ZERO && ttl > cur.ttl_cap {
                ttl = cur.ttl_cap;
            }
            let hp = HostPort { ip, port: cur.port };
            tracing::debug!(domain, %hp, ?ttl, "address record");
            merge_weighted(&mut res.results, hp, cur.prio, cur.weight, ttl);
        }
    }

    /// After an A answer (or a failed submit): AAAA→A stays on the same
    /// host, otherwise move to the next one. `None` means the resolution
    /// vanished.
    fn dns_advance_host(&mut self, domain: &str) -> Option<Advance> {
        let res = self.resolutions.get_mut(domain)?;
        if res.phase == Phase::Aaaa {
            res.phase = Phase::A;
            return Some(Advance::QueryAgain);
        }
        if pop_host(res) {
            res.phase = if self.cfg.resolve_aaaa {
                Phase::Aaaa
            } else {
                Phase::A
            };
            Some(Advance::QueryAgain)
        } else {
            Some(Advance::Finalize)
        }
    }

    /// Clamp TTLs, absolutize expiries and hand the finished set to the
    /// dispatch engine. The aggregate expiry is the minimum result TTL, so
    /// the collection never outlives any of its members.
    fn dns_finalize(&mut self, m: &mut Reactor, domain: &str) {
        let Some(res) = self.resolutions.remove(domain) else {
            return;
        };
        if let Some(qid) = res.query {
            self.resolver.cancel(qid);
            self.lookups.remove(&qid);
        }

        let now = Instant::now();
        let min_ttl = Duration::from_secs(self.cfg.dns_min_ttl);
        let max_ttl = Duration::from_secs(self.cfg.dns_max_ttl);
        let clamp = |ttl: Duration| ttl.clamp(min_ttl, max_ttl);

        let aggregate = res
            .results
            .values()
            .map(|r| r.ttl)
            .min()
            .unwrap_or(Duration::ZERO);
        let expiry = now + clamp(aggregate);

        let results: HashMap<HostPort, DnsResult> = res
            .results
            .into_iter()
            .map(|(hp, pending)| {
                (
                    hp,
                    DnsResult {
                        prio: pending.prio,
                        weight: pending.weight,
                        expiry: now + clamp(pending.ttl),
                    },
                )
            })
            .collect();

        // Decode back so the result is delivered under the name the
        // dispatch engine asked for.
        let (unicode, decode) = idna::domain_to_unicode(&res.name);
        let key = if decode.is_ok() && !unicode.is_empty() {
            unicode
        } else {
            tracing::error!(name = %res.name, "idna decode failed");
            res.domain.clone()
        };

        tracing::debug!(
            domain = %key,
            results = results.len(),
            "resolution complete"
        );
        self.out_resolve(m, &key, results, expiry);
    }

    /// Submit one lookup; `false` means submission failed and the chain
    /// should advance on its own.
    fn dns_submit(&mut self, m: &mut Reactor, domain: &str, qname: &str, rtype: RecordType) -> bool {
        let name = match DomainName::vec_from_str(qname) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(qname, "not a resolvable name: {e}");
                return false;
            }
        };
        match self
            .resolver
            .lookup(name, rtype, Instant::now(), &mut self.rng)
        {
            Ok(qid) => {
                if let Some(res) = self.resolutions.get_mut(domain) {
                    res.query = Some(qid);
                }
                self.lookups.insert(qid, domain.to_owned());
                self.reconcile_resolver_timer(m);
                true
            }
            Err(e) => {
                tracing::info!(qname, "lookup submission failed: {e}");
                false
            }
        }
    }
}

fn add_srv_host(hosts: &mut HashMap<SrvTarget, PendingRes>, srv: &SrvRecord) {
    merge_weighted(
        hosts,
        SrvTarget {
            host: srv.target.clone(),
            port: srv.port,
        },
        srv.priority,
        shift_weight(srv.weight),
        srv.ttl,
    );
}

/// Take an arbitrary host off the pending list into `cur`.
fn pop_host(res: &mut Resolution) -> bool {
    let Some(target) = res.hosts.keys().next().cloned() else {
        res.cur = None;
        return false;
    };
    let Some(pending) = res.hosts.remove(&target) else {
        res.cur = None;
        return false;
    };
    res.cur = Some(CurrentHost {
        host: target.host,
        port: target.port,
        prio: pending.prio,
        weight: pending.weight,
        ttl_cap: pending.ttl,
    });
    true
}

/// RFC 2782 weighted selection over a cache entry.
///
/// Unexpired results are partitioned into reusable, IPv6, IPv4 and bad
/// hosts; within each of the first three only minimum-priority entries
/// survive, and the pick is weighted-random. Bad hosts are a last resort,
/// taken uniformly and only when `allow_bad`. If expired good hosts
/// were seen, the entry is force-expired so the next call re-resolves.
pub(crate) fn dns_select(
    entry: &mut DnsCacheEntry,
    now: Instant,
    allow_bad: bool,
    out_reuse: bool,
    out_host: &HashMap<HostPort, ConnId>,
    dns_bad: &HashMap<HostPort, BadHost>,
    bad_cache_enabled: bool,
    rng: &mut StdRng,
) -> Option<HostPort> {
    struct WeightedList {
        entries: Vec<(HostPort, u32)>,
        prio: u16,
        total: u32,
    }

    impl WeightedList {
        fn new() -> Self {
            Self {
                entries: Vec::new(),
                prio: 0,
                total: 0,
            }
        }

        fn push(&mut self, hp: HostPort, res: &DnsResult) {
            if self.entries.is_empty() || res.prio < self.prio {
                self.prio = res.prio;
                self.entries.clear();
                self.total = 0;
            }
            if res.prio <= self.prio {
                self.total += res.weight;
                self.entries.push((hp, self.total));
            }
        }

        fn pick(&self, rng: &mut StdRng) -> Option<HostPort> {
            if self.entries.is_empty() {
                return None;
            }
            let r = rng.gen_range(0..=self.total);
            self.entries
                .iter()
                .find(|(_, running)| *running >= r)
                .map(|(hp, _)| *hp)
        }
    }

    let results = entry.results.as_ref()?;
    tracing::debug!(domain = %entry.name, "selecting DNS result");

    let mut reusable = WeightedList::new();
    let mut v6 = WeightedList::new();
    let mut v4 = WeightedList::new();
    let mut bad = Vec::new();
    let mut expired_good = 0;

    for (hp, res) in results {
        let bad_entry = bad_cache_enabled.then(|| dns_bad.get(hp)).flatten();
        if now > res.expiry {
            if bad_entry.is_none() {
                expired_good += 1;
            }
            tracing::debug!(host = %hp, "result expired");
        } else if bad_entry.is_some_and(|b| now <= b.expiry) {
            tracing::debug!(host = %hp, "result marked bad");
            bad.push(*hp);
        } else if out_reuse && out_host.contains_key(hp) {
            reusable.push(*hp, res);
        } else if hp.ip.is_ipv6() {
            v6.push(*hp, res);
        } else {
            v4.push(*hp, res);
        }
    }

    if !reusable.entries.is_empty() {
        return reusable.pick(rng);
    }
    if !v6.entries.is_empty() && (v4.entries.is_empty() || v6.prio <= v4.prio) {
        return v6.pick(rng);
    }
    if !v4.entries.is_empty() {
        return v4.pick(rng);
    }
    if !bad.is_empty() {
        let pick = bad[rng.gen_range(0..bad.len())];
        tracing::debug!(host = %pick, allow_bad, "only bad hosts left");

        // Expired good siblings: re-resolve on the next call instead of
        // hammering known-bad hosts.
        if expired_good > 0 {
            entry.expiry = None;
        }
        return allow_bad.then_some(pick);
    }
    None
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;

    fn hp(ip: &str, port: u16) -> HostPort {
        HostPort {
            ip: ip.parse().unwrap(),
            port,
        }
    }

    fn entry_with(results: Vec<(HostPort, DnsResult)>, now: Instant) -> DnsCacheEntry {
        let mut entry = DnsCacheEntry::new("b.example", now);
        entry.expiry = Some(now + Duration::from_secs(60));
        entry.results = Some(results.into_iter().collect());
        entry
    }

    fn res(prio: u16, raw_weight: u16, expiry: Instant) -> DnsResult {
        DnsResult {
            prio,
            weight: shift_weight(raw_weight),
            expiry,
        }
    }

    #[test]
    fn weight_shift_keeps_zero_selectable() {
        assert_eq!(shift_weight(0), 16);
        assert_eq!(shift_weight(1), 256);
        assert_eq!(shift_weight(65535), 65535 << 8);
    }

    #[test]
    fn merge_adds_weights_at_equal_priority_and_prefers_lower() {
        let mut map = HashMap::new();
        let key = hp("192.0.2.1", 5269);
        merge_weighted(&mut map, key, 10, 256, Duration::from_secs(30));
        merge_weighted(&mut map, key, 10, 256, Duration::from_secs(60));
        assert_eq!(map[&key].weight, 512);
        assert_eq!(map[&key].ttl, Duration::from_secs(60));

        merge_weighted(&mut map, key, 5, 16, Duration::from_secs(10));
        assert_eq!(map[&key].prio, 5);
        assert_eq!(map[&key].weight, 512 + 16);
        assert_eq!(map[&key].ttl, Duration::from_secs(60));
    }

    #[test]
    fn merge_caps_the_result_count() {
        let mut map = HashMap::new();
        for i in 0..DNS_MAX_RESULTS + 7 {
            let key = hp(&format!("192.0.2.{}", i % 250), 5000 + i as u16);
            merge_weighted(&mut map, key, 0, 16, Duration::from_secs(60));
        }
        assert_eq!(map.len(), DNS_MAX_RESULTS);
    }

    #[test]
    fn selection_prefers_minimum_priority() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let primary = hp("192.0.2.1", 5269);
        let backup = hp("192.0.2.2", 5269);
        let mut entry = entry_with(
            vec![(primary, res(10, 1, later)), (backup, res(20, 1, later))],
            now,
        );

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let picked = dns_select(
                &mut entry,
                now,
                true,
                false,
                &HashMap::new(),
                &HashMap::new(),
                true,
                &mut rng,
            );
            assert_eq!(picked, Some(primary));
        }
    }

    #[test]
    fn selection_ratio_tracks_srv_weights() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let light = hp("192.0.2.1", 5269);
        let heavy = hp("192.0.2.2", 5269);
        let mut entry = entry_with(
            vec![(light, res(10, 1, later)), (heavy, res(10, 3, later))],
            now,
        );

        let mut rng = StdRng::seed_from_u64(42);
        let trials = 4000;
        let mut heavy_hits = 0;
        for _ in 0..trials {
            if dns_select(
                &mut entry,
                now,
                true,
                false,
                &HashMap::new(),
                &HashMap::new(),
                true,
                &mut rng,
            ) == Some(heavy)
            {
                heavy_hits += 1;
            }
        }

        // Expected ratio 3:1, i.e. 75%. Allow a generous band.
        let share = heavy_hits as f64 / trials as f64;
        assert!((0.70..0.80).contains(&share), "heavy share was {share}");
    }

    #[test]
    fn reusable_hosts_win_over_everything() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let pooled = hp("192.0.2.1", 5269);
        let fresh = hp("2001:db8::1", 5269);
        let mut entry = entry_with(
            vec![(pooled, res(20, 1, later)), (fresh, res(0, 1, later))],
            now,
        );

        let mut out_host = HashMap::new();
        out_host.insert(pooled, 1);

        let mut rng = StdRng::seed_from_u64(3);
        let picked = dns_select(
            &mut entry,
            now,
            true,
            true,
            &out_host,
            &HashMap::new(),
            true,
            &mut rng,
        );
        assert_eq!(picked, Some(pooled));
    }

    #[test]
    fn v6_wins_priority_ties() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let six = hp("2001:db8::1", 5269);
        let four = hp("192.0.2.1", 5269);
        let mut entry = entry_with(
            vec![(six, res(10, 1, later)), (four, res(10, 1, later))],
            now,
        );

        let mut rng = StdRng::seed_from_u64(4);
        let picked = dns_select(
            &mut entry,
            now,
            true,
            false,
            &HashMap::new(),
            &HashMap::new(),
            true,
            &mut rng,
        );
        assert_eq!(picked, Some(six));
    }

    #[test]
    fn bad_hosts_are_suppressed_unless_allowed() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let bad = hp("192.0.2.1", 5269);
        let good = hp("192.0.2.2", 5269);
        let mut dns_bad = HashMap::new();
        dns_bad.insert(bad, BadHost { expiry: later });

        let mut entry = entry_with(
            vec![(bad, res(0, 1, later)), (good, res(10, 1, later))],
            now,
        );
        let mut rng = StdRng::seed_from_u64(5);
        let picked = dns_select(
            &mut entry,
            now,
            false,
            false,
            &HashMap::new(),
            &dns_bad,
            true,
            &mut rng,
        );
        assert_eq!(picked, Some(good), "good host wins while bad is cached");

        // Only bad hosts left: suppressed without allow_bad, picked with.
        let mut entry = entry_with(vec![(bad, res(0, 1, later))], now);
        let denied = dns_select(
            &mut entry,
            now,
            false,
            false,
            &HashMap::new(),
            &dns_bad,
            true,
            &mut rng,
        );
        assert_eq!(denied, None);

        let mut entry = entry_with(vec![(bad, res(0, 1, later))], now);
        let allowed = dns_select(
            &mut entry,
            now,
            true,
            false,
            &HashMap::new(),
            &dns_bad,
            true,
            &mut rng,
        );
        assert_eq!(allowed, Some(bad));
    }

    #[test]
    fn bad_pick_with_expired_good_siblings_forces_reresolution() {
        let now = Instant::now();
        let later = now + Duration::from_secs(300);
        let expired_at = now - Duration::from_secs(1);
        let bad = hp("192.0.2.1", 5269);
        let stale = hp("192.0.2.2", 5269);
        let mut dns_bad = HashMap::new();
        dns_bad.insert(bad, BadHost { expiry: later });

        let mut entry = entry_with(
            vec![(bad, res(0, 1, later)), (stale, res(0, 1, expired_at))],
            now,
        );
        let mut rng = StdRng::seed_from_u64(6);
        let picked = dns_select(
            &mut entry,
            now,
            true,
            false,
            &HashMap::new(),
            &dns_bad,
            true,
            &mut rng,
        );
        assert_eq!(picked, Some(bad));
        assert!(entry.is_expired(now), "entry must re-resolve next call");
    }

    #[test]
    fn negative_entries_select_nothing() {
        let now = Instant::now();
        let mut entry = DnsCacheEntry::new("b.example", now);
        entry.expiry = Some(now + Duration::from_secs(300));

        let mut rng = StdRng::seed_from_u64(7);
        let picked = dns_select(
            &mut entry,
            now,
            true,
            false,
            &HashMap::new(),
            &HashMap::new(),
            true,
            &mut rng,
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn idna_round_trip() {
        let ascii = idna::domain_to_ascii("münchen.example").unwrap();
        assert_eq!(ascii, "xn--mnchen-3ya.example");
        let (unicode, result) = idna::domain_to_unicode(&ascii);
        assert!(result.is_ok());
        assert_eq!(unicode, "münchen.example");
    }
}
