//! Engine configuration.
//!
//! All durations are whole seconds; a value of 0 disables the feature it
//! belongs to. Defaults follow common S2S deployments.

use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Secret mixed into every dialback key. Shared by all processes that
    /// answer verify requests for this server.
    pub local_secret: String,

    /// Source address for outbound connections.
    pub origin_ip: Option<IpAddr>,

    /// Port for incoming S2S streams.
    pub listen_port: u16,

    /// Seconds a route's queue may age before a dropped connection bounces
    /// it instead of reconnecting. 0 retries forever.
    pub retry_limit: u64,

    /// Clamp for DNS TTLs, in seconds.
    pub dns_min_ttl: u64,
    pub dns_max_ttl: u64,

    /// Seconds a failed host is suppressed from selection. 0 disables the
    /// bad-host cache.
    pub dns_bad_timeout: u64,

    /// Keep resolved addresses across packets. When disabled, every cache
    /// entry is dropped as soon as its queued packets have been flushed.
    pub dns_cache_enabled: bool,

    /// Share one outbound connection between destination domains that
    /// resolve to the same address.
    pub out_reuse: bool,

    /// Ask for AAAA records in addition to A.
    pub resolve_aaaa: bool,

    /// SRV prefixes tried in order, e.g. `_xmpp-server._tcp`.
    pub lookup_srv: Vec<String>,

    /// Upstream recursive resolvers. Empty means use `/etc/resolv.conf`.
    pub upstream_resolvers: Vec<SocketAddr>,

    /// Seconds between housekeeping sweeps. 0 disables housekeeping
    /// entirely.
    pub check_interval: u64,

    /// Enables the queue-age sweep when non-zero.
    pub check_queue: u64,

    /// Seconds of silence after which a connection is closed. 0 disables.
    pub check_idle: u64,

    /// Seconds of idle after which a whitespace keepalive is written.
    /// 0 disables.
    pub check_keepalive: u64,

    /// Whether a TLS-capable stream layer is plugged in. Controls the
    /// stream version we announce and the STARTTLS decision.
    pub tls_available: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_secret: String::new(),
            origin_ip: None,
            listen_port: 5269,
            retry_limit: 300,
            dns_min_ttl: 300,
            dns_max_ttl: 86400,
            dns_bad_timeout: 300,
            dns_cache_enabled: true,
            out_reuse: false,
            resolve_aaaa: false,
            lookup_srv: vec!["_xmpp-server._tcp".to_owned(), "_jabber._tcp".to_owned()],
            upstream_resolvers: Vec::new(),
            check_interval: 60,
            check_queue: 60,
            check_idle: 86400,
            check_keepalive: 0,
            tls_available: false,
        }
    }
}
