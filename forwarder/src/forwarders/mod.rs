//! # Listener Implementations
//!
//! One module per [`crate::config::ListenProtocol`] variant. Each exposes a
//! single `run` entry point shaped like the teacher's `upstream::run` /
//! `downstream::run`: it owns its accept loop, reacts to a shared
//! [`tokio_util::sync::CancellationToken`], and returns once every
//! in-flight connection it spawned has drained.

pub mod http;
pub mod tcp;
pub mod udp;

/// Shared dependencies every listener needs to hand to each connection it accepts.
pub struct ForwarderContext {
    /// The endpoint this listener serves.
    pub endpoint: std::sync::Arc<crate::config::EndpointConfig>,
    /// Backend selection for this endpoint.
    pub balancer: std::sync::Arc<crate::balancer::LoadBalancer>,
    /// Admission control for this endpoint's listen key.
    pub limiter: std::sync::Arc<crate::limiter::AdmissionLimiter>,
    /// Shared TCP connection pool across every TCP/TLS endpoint.
    pub pool: std::sync::Arc<crate::pool::ConnectionPool>,
    /// Shared metrics registry, used for O(1) backend-by-key lookup on a sticky rebind.
    pub metrics: std::sync::Arc<crate::metrics::MetricsStore>,
    /// Sticky-session map, present only when `endpoint.sticky_sessions` is set.
    pub sticky: Option<std::sync::Arc<crate::sticky::StickyMap>>,
    /// Zone resolver used by `ZoneAffinity` selection.
    pub geo: std::sync::Arc<dyn crate::geo::IpGeoLookup>,
    /// Process-wide shutdown signal.
    pub shutdown: tokio_util::sync::CancellationToken,
    /// Per-connection handler tasks spawned for this endpoint, so
    /// `Orchestrator::stop` can join (and, past its deadline, abort) them
    /// instead of only the accept loop itself.
    pub connections: std::sync::Arc<tokio::sync::Mutex<tokio::task::JoinSet<()>>>,
}
