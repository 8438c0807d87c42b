//! # Endpoint & Backend Configuration
//!
//! Plain, already-validated in-memory configuration objects. Loading these
//! from a file format, an environment, or a control-plane API is explicitly
//! someone else's job (spec §1, non-goal (b)); this crate only ever accepts
//! fully constructed values and validates their internal consistency in
//! `Orchestrator::init`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire protocol spoken on the client (listen) side of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ListenProtocol {
    /// Raw TCP passthrough.
    Tcp,
    /// TCP with a TLS server handshake terminated at the forwarder.
    TlsTcp,
    /// One-way UDP datagram forwarding.
    Udp,
    /// HTTP/1.1 request/response rewriting.
    Http,
}

/// Wire protocol spoken on the backend (upstream) side of a TCP/TLS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendProtocol {
    /// Plain TCP to the backend.
    Plain,
    /// TLS client handshake to the backend, SNI set to the backend host.
    Tls,
}

/// Load-balancing policy identifier, selected per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingAlgorithm {
    /// Next index modulo the healthy count, in stable list order.
    RoundRobin,
    /// Uniform random choice among healthy backends.
    Random,
    /// Minimum `activeConnections`, ties broken by earliest-in-list.
    LeastConnections,
    /// Smooth weighted round-robin (nginx-style).
    WeightedRoundRobin,
    /// `hash(key) mod healthy`, consistent-hash ring if any backend has a weight.
    Hash,
    /// Prefer backends whose zone matches the client's zone; falls back to
    /// least-connections over all healthy backends.
    ZoneAffinity,
}

/// Parsed server certificate material for a `tlsTcp` endpoint. The forwarder
/// never reads certificate files itself (spec §1, non-goal (c)); the
/// embedding binary parses PEM/DER bytes and hands over the finished
/// `rustls::ServerConfig`.
#[derive(Clone)]
pub struct ServerCertificate {
    /// A pre-built, ready-to-use server TLS configuration.
    pub tls_config: std::sync::Arc<rustls::ServerConfig>,
}

impl std::fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificate").finish_non_exhaustive()
    }
}

/// Optional zone-affinity tuning for an endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneAffinityParams {
    /// Zone to assume for clients that cannot be resolved to any zone at all.
    #[serde(default = "default_unknown_zone")]
    pub unknown_zone: String,
}

fn default_unknown_zone() -> String {
    "unknown".to_string()
}

/// A single forwarding target behind an endpoint.
pub struct TargetBackend {
    /// Upstream host (name or literal IP).
    pub host: String,
    /// Upstream port.
    pub port: u16,
    /// Relative weight used by `WeightedRoundRobin` and the `Hash` ring.
    pub weight: Option<u32>,
    /// Zone label consulted by `ZoneAffinity`.
    pub zone: Option<String>,
    /// HTTP-only: replacement path prefix to prepend after stripping.
    pub http_path: Option<String>,
    /// HTTP-only: whether the endpoint's `pathPrefix` should be stripped
    /// before `http_path` is prepended.
    pub strip_path: bool,
    /// Whether the backend side of a TCP/TLS endpoint speaks TLS.
    pub backend_protocol: BackendProtocol,
    /// Per-request timeout (HTTP) / per-connect timeout (TCP/TLS).
    pub timeout: Duration,
    /// Header overrides applied after hop-by-hop stripping (HTTP only).
    pub request_headers: std::collections::HashMap<String, String>,

    pub(crate) active_connections: AtomicI64,
    pub(crate) total_connections: AtomicU64,
    pub(crate) http_2xx: AtomicU64,
    pub(crate) http_3xx: AtomicU64,
    pub(crate) http_4xx: AtomicU64,
    pub(crate) http_5xx: AtomicU64,
    pub(crate) last_activity_unix_ms: AtomicU64,
    pub(crate) avg_response_time_ms: AtomicU64,
    pub(crate) response_sample_count: AtomicU64,
    pub(crate) is_healthy: AtomicBool,
}

impl std::fmt::Debug for TargetBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetBackend")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("weight", &self.weight)
            .field("zone", &self.zone)
            .field("backend_protocol", &self.backend_protocol)
            .field("is_healthy", &self.is_healthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl TargetBackend {
    /// Builds a backend from its static configuration fields. Counters start
    /// at zero and `is_healthy` starts `true` — the first selection attempt
    /// will trigger a recovery check only if it turns out to be wrong.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: None,
            zone: None,
            http_path: None,
            strip_path: false,
            backend_protocol: BackendProtocol::Plain,
            timeout: Duration::from_secs(30),
            request_headers: std::collections::HashMap::new(),
            active_connections: AtomicI64::new(0),
            total_connections: AtomicU64::new(0),
            http_2xx: AtomicU64::new(0),
            http_3xx: AtomicU64::new(0),
            http_4xx: AtomicU64::new(0),
            http_5xx: AtomicU64::new(0),
            last_activity_unix_ms: AtomicU64::new(0),
            avg_response_time_ms: AtomicU64::new(0),
            response_sample_count: AtomicU64::new(0),
            is_healthy: AtomicBool::new(true),
        }
    }

    /// `"ip:port"`-shaped key, as used by `MetricsStore`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Current in-flight connection count.
    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Whether the last health probe (or the initial optimistic default) succeeded.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }

    /// Flips the health flag; called only by `HealthChecker`.
    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Records admission: `active += 1`, `total += 1`, touches `last_activity`.
    pub fn record_admit(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Records release: `active -= 1`. Must be called exactly once per `record_admit`.
    pub fn record_release(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_activity_unix_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Buckets a completed HTTP response by status class.
    pub fn record_http_status(&self, status: u16) {
        match status {
            200..=299 => self.http_2xx.fetch_add(1, Ordering::Relaxed),
            300..=399 => self.http_3xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.http_4xx.fetch_add(1, Ordering::Relaxed),
            _ => self.http_5xx.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Folds a new response-time sample into the running average with
    /// `(old*n + new)/(n+1)`, via a CAS retry loop so concurrent updates
    /// never lose a sample.
    pub fn record_response_time(&self, elapsed: Duration) {
        let new_ms = elapsed.as_millis() as u64;
        loop {
            let n = self.response_sample_count.load(Ordering::Relaxed);
            let old_avg = self.avg_response_time_ms.load(Ordering::Relaxed);
            let new_avg = (old_avg.saturating_mul(n) + new_ms) / (n + 1);

            if self
                .avg_response_time_ms
                .compare_exchange(old_avg, new_avg, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.response_sample_count.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// A fully resolved, immutable-after-init endpoint: a bound
/// `(listenIp, listenPort, protocol)` plus its backend pool.
pub struct EndpointConfig {
    /// Local address to bind.
    pub listen_ip: IpAddr,
    /// Local port to bind.
    pub listen_port: u16,
    /// Which listener implementation handles this endpoint.
    pub protocol: ListenProtocol,
    /// Bound on concurrent connections/in-flight packet handlers.
    pub max_connections: usize,
    /// HTTP-only: prefix stripped from incoming request paths.
    pub path_prefix: Option<String>,
    /// TLS-only: server certificate material.
    pub server_certificate: Option<ServerCertificate>,
    /// TLS-only: whether clients must present a certificate.
    pub client_certificate_required: bool,
    /// The backend pool this endpoint load-balances over. Each backend is
    /// independently reference-counted so `MetricsStore` can hold the same
    /// instance the endpoint selects against, without copying counters.
    pub targets: Vec<std::sync::Arc<TargetBackend>>,
    /// Selection policy for this endpoint.
    pub algorithm: LoadBalancingAlgorithm,
    /// Tuning for `LoadBalancingAlgorithm::ZoneAffinity`.
    pub zone_affinity: Option<ZoneAffinityParams>,
    /// Enables sticky-session mapping (UDP: per client endpoint; HTTP: per remote addr).
    pub sticky_sessions: bool,
}

impl EndpointConfig {
    /// `"ip:port"` key uniquely identifying this endpoint's listen address.
    pub fn listen_key(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }

    /// Structural validation applied by `Orchestrator::init`: non-empty
    /// backend pool, in-range port, TLS endpoints carry certificate material.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.targets.is_empty() {
            return Err(crate::error::ForwarderError::Config(format!(
                "endpoint {} has no target backends",
                self.listen_key()
            )));
        }
        if self.listen_port == 0 {
            return Err(crate::error::ForwarderError::Config(format!(
                "endpoint has invalid listen port 0 ({})",
                self.listen_key()
            )));
        }
        if matches!(self.protocol, ListenProtocol::TlsTcp) && self.server_certificate.is_none() {
            return Err(crate::error::ForwarderError::Config(format!(
                "endpoint {} is tlsTcp but has no server certificate",
                self.listen_key()
            )));
        }
        for t in &self.targets {
            if t.port == 0 {
                return Err(crate::error::ForwarderError::Config(format!(
                    "backend {} has invalid port 0",
                    t.host
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("listen_ip", &self.listen_ip)
            .field("listen_port", &self.listen_port)
            .field("protocol", &self.protocol)
            .field("max_connections", &self.max_connections)
            .field("algorithm", &self.algorithm)
            .field("targets", &self.targets.len())
            .finish()
    }
}
