//! # Orchestrator
//!
//! The crate's single public entry point (spec §4.1): `init` validates and
//! wires up every endpoint, `start` spawns their listeners, `stop` drains
//! them within a deadline, and `metrics` snapshots the whole fleet. Modeled
//! on the teacher's `server_yahoo::main` wiring — a `CancellationToken`
//! stands in for its `broadcast::channel` shutdown signal since listeners
//! here are spawned and joined dynamically per endpoint rather than fixed
//! up front.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balancer::LoadBalancer;
use crate::config::EndpointConfig;
use crate::error::{ForwarderError, Result};
use crate::forwarders::{self, ForwarderContext};
use crate::geo::{IpGeoLookup, UnknownZoneLookup};
use crate::limiter::{AdmissionLimiter, LimiterRegistry};
use crate::metrics::{EndpointStatus, MetricsSnapshot, MetricsStore};
use crate::pool::ConnectionPool;
use crate::sticky::StickyMap;

/// Default bound on the admission limiter's FIFO wait queue (spec §2).
pub const DEFAULT_QUEUE_LIMIT: usize = 100;

/// Polling interval used while waiting for in-flight connections to drain during `stop`.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct RunningEndpoint {
    endpoint: Arc<EndpointConfig>,
    handle: JoinHandle<Result<()>>,
    connections: Arc<tokio::sync::Mutex<tokio::task::JoinSet<()>>>,
}

/// Owns the full lifecycle of every configured endpoint.
pub struct Orchestrator {
    endpoints: Vec<Arc<EndpointConfig>>,
    metrics: Arc<MetricsStore>,
    limiters: Arc<LimiterRegistry>,
    pool: Arc<ConnectionPool>,
    geo: Arc<dyn IpGeoLookup>,
    shutdown: std::sync::Mutex<CancellationToken>,
    running: std::sync::Mutex<Vec<RunningEndpoint>>,
    started: AtomicBool,
}

impl Orchestrator {
    /// Validates every endpoint and wires up the shared stores each
    /// listener will need. Fails closed on the first invalid endpoint
    /// rather than partially registering a broken fleet.
    pub fn init(endpoints: Vec<EndpointConfig>, geo: Option<Arc<dyn IpGeoLookup>>) -> Result<Self> {
        for endpoint in &endpoints {
            endpoint.validate()?;
        }

        let mut seen_keys = std::collections::HashSet::new();
        for endpoint in &endpoints {
            if !seen_keys.insert(endpoint.listen_key()) {
                return Err(ForwarderError::Config(format!(
                    "duplicate listener for {}",
                    endpoint.listen_key()
                )));
            }
        }

        let metrics = Arc::new(MetricsStore::new());
        let limiters = Arc::new(LimiterRegistry::new());
        for endpoint in &endpoints {
            limiters.insert(
                endpoint.listen_key(),
                Arc::new(AdmissionLimiter::new(endpoint.max_connections, DEFAULT_QUEUE_LIMIT)),
            );
            for target in &endpoint.targets {
                metrics.register(Arc::clone(target));
            }
        }

        let endpoints: Vec<Arc<EndpointConfig>> = endpoints.into_iter().map(Arc::new).collect();

        Ok(Self {
            endpoints,
            metrics,
            limiters,
            pool: Arc::new(ConnectionPool::new()),
            geo: geo.unwrap_or_else(|| Arc::new(UnknownZoneLookup)),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            running: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns every endpoint's listener. Returns `AlreadyRunning`-shaped
    /// config errors (via `ForwarderError::Config`) if called twice without
    /// an intervening `stop`.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ForwarderError::Config("orchestrator is already running".to_string()));
        }

        // A token cancelled by a previous `stop()` never un-cancels; start a
        // fresh one each time so a restarted listener's accept loop doesn't
        // see shutdown as already having fired.
        let shutdown = CancellationToken::new();
        *self.shutdown.lock().expect("Orchestrator lock poisoned") = shutdown.clone();

        let mut running = self.running.lock().expect("Orchestrator lock poisoned");
        for endpoint in &self.endpoints {
            let limiter = self
                .limiters
                .get(&endpoint.listen_key())
                .expect("limiter registered during init");
            let balancer = Arc::new(LoadBalancer::new(endpoint));
            let sticky = endpoint
                .sticky_sessions
                .then(|| Arc::new(StickyMap::new(crate::sticky::DEFAULT_TTL, crate::sticky::DEFAULT_CAPACITY)));

            let connections = Arc::new(tokio::sync::Mutex::new(tokio::task::JoinSet::new()));

            let ctx = Arc::new(ForwarderContext {
                endpoint: Arc::clone(endpoint),
                balancer,
                limiter,
                pool: Arc::clone(&self.pool),
                metrics: Arc::clone(&self.metrics),
                sticky,
                geo: Arc::clone(&self.geo),
                shutdown: shutdown.clone(),
                connections: Arc::clone(&connections),
            });

            let protocol = ctx.endpoint.protocol;
            let handle = tokio::spawn(async move {
                use crate::config::ListenProtocol;
                match protocol {
                    ListenProtocol::Tcp | ListenProtocol::TlsTcp => forwarders::tcp::run(ctx).await,
                    ListenProtocol::Udp => forwarders::udp::run(ctx).await,
                    ListenProtocol::Http => forwarders::http::run(ctx).await,
                }
            });

            running.push(RunningEndpoint {
                endpoint: Arc::clone(endpoint),
                handle,
                connections,
            });
        }

        log::info!("orchestrator started {} endpoint(s)", self.endpoints.len());
        Ok(())
    }

    /// Signals every listener to stop accepting new connections and waits
    /// for in-flight work to drain, polling every 500ms, up to `timeout`.
    /// Logs a warning (rather than erroring) if connections are still
    /// active once the deadline passes — the caller decides whether that's
    /// fatal.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.shutdown
            .lock()
            .expect("Orchestrator lock poisoned")
            .cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let residual = self.metrics_snapshot_locked().active_connections;
            if residual == 0 || tokio::time::Instant::now() >= deadline {
                if residual != 0 {
                    log::warn!("stop timed out with {residual} connection(s) still active");
                }
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let handles: Vec<_> = {
            let mut running = self.running.lock().expect("Orchestrator lock poisoned");
            running.drain(..).collect()
        };
        for running in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining.max(Duration::from_millis(1)), running.handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::warn!("endpoint {} stopped with error: {e}", running.endpoint.listen_key()),
                Ok(Err(e)) => log::warn!("endpoint {} task panicked: {e}", running.endpoint.listen_key()),
                Err(_) => log::warn!("endpoint {} accept loop did not join before timeout", running.endpoint.listen_key()),
            }

            // The accept loop exiting doesn't mean its spawned connection
            // handlers have too: each one is cancellation-aware on its I/O
            // copy, so it should drain almost immediately, but anything still
            // running past the deadline (a stuck TLS handshake, a hanging
            // dial) is force-aborted rather than left running forever.
            let mut connections = running.connections.lock().await;
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let drained = tokio::time::timeout(remaining, async {
                while connections.join_next().await.is_some() {}
            })
            .await
            .is_ok();

            if !drained {
                let residual = connections.len();
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                log::warn!(
                    "endpoint {} force-closed {residual} connection(s) still active at the stop deadline",
                    running.endpoint.listen_key()
                );
            }
        }

        self.started.store(false, Ordering::SeqCst);
        log::info!("orchestrator stopped");
        Ok(())
    }

    /// Point-in-time snapshot across every endpoint and backend.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_snapshot_locked()
    }

    fn metrics_snapshot_locked(&self) -> MetricsSnapshot {
        let active_total = self.metrics.total_active();
        let connection_metrics = self.metrics.snapshot();

        let running = self.running.lock().expect("Orchestrator lock poisoned");
        let endpoint_status = self
            .endpoints
            .iter()
            .map(|endpoint| EndpointStatus {
                listen_port: endpoint.listen_port,
                protocol: format!("{:?}", endpoint.protocol),
                is_active: running.iter().any(|r| r.endpoint.listen_key() == endpoint.listen_key()),
            })
            .collect();

        MetricsSnapshot {
            active_connections: active_total,
            connection_metrics,
            endpoint_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenProtocol, LoadBalancingAlgorithm, TargetBackend};
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_endpoint(port: u16) -> EndpointConfig {
        EndpointConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            listen_port: port,
            protocol: ListenProtocol::Tcp,
            max_connections: 10,
            path_prefix: None,
            server_certificate: None,
            client_certificate_required: false,
            targets: vec![Arc::new(TargetBackend::new("127.0.0.1", 1))],
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            zone_affinity: None,
            sticky_sessions: false,
        }
    }

    #[test]
    fn init_rejects_duplicate_listen_keys() {
        let endpoints = vec![sample_endpoint(9100), sample_endpoint(9100)];
        let result = Orchestrator::init(endpoints, None);
        assert!(matches!(result, Err(ForwarderError::Config(_))));
    }

    #[tokio::test]
    async fn start_twice_without_stop_returns_already_running() {
        let orchestrator = Orchestrator::init(vec![sample_endpoint(19201)], None).unwrap();
        orchestrator.start().await.unwrap();
        let second = orchestrator.start().await;
        assert!(matches!(second, Err(ForwarderError::Config(_))));
        orchestrator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop_succeeds() {
        let orchestrator = Orchestrator::init(vec![sample_endpoint(19202)], None).unwrap();
        orchestrator.start().await.unwrap();
        orchestrator.stop(Duration::from_secs(1)).await.unwrap();
        assert!(orchestrator.start().await.is_ok());
        orchestrator.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn metrics_reports_zero_active_connections_before_traffic() {
        let orchestrator = Orchestrator::init(vec![sample_endpoint(19203)], None).unwrap();
        let snapshot = orchestrator.metrics();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.connection_metrics.len(), 1);
    }
}
