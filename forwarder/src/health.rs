//! # Health Checking
//!
//! On-demand backend health probing (spec §4.9). The forwarder never runs
//! a background health-check timer by default — `LoadBalancer::pick`
//! triggers a check only once it has already failed to find a healthy
//! backend, matching spec §4.9's "on-demand, triggered by selection
//! failure" design rather than a fixed polling interval every endpoint
//! would pay for regardless of traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::TargetBackend;

/// Default bound on a single health probe's connect attempt.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stateless TCP-connect health prober.
pub struct HealthChecker {
    timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HealthChecker {
    /// Creates a checker bounding each probe to `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probes one backend by attempting a bare TCP connect, updating its
    /// `is_healthy` flag with the result. Never returns an error: a failed
    /// probe is a normal, expected outcome, not an exceptional one.
    pub async fn check_one(&self, backend: &TargetBackend) {
        let addr = format!("{}:{}", backend.host, backend.port);
        let healthy = match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => true,
            _ => false,
        };
        backend.set_healthy(healthy);
    }

    /// Probes every backend in `targets` concurrently and waits for all
    /// probes to finish. Called by `LoadBalancer::pick` when it runs out
    /// of healthy candidates.
    pub async fn check_all(&self, targets: &[Arc<TargetBackend>]) {
        let mut pending = futures_util::stream::FuturesUnordered::new();
        for backend in targets {
            pending.push(self.check_one(backend));
        }
        use futures_util::StreamExt;
        while pending.next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_backend_is_marked_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let backend = TargetBackend::new(addr.ip().to_string(), addr.port());
        backend.set_healthy(false);
        let checker = HealthChecker::new(Duration::from_secs(1));
        checker.check_one(&backend).await;
        assert!(backend.is_healthy());
    }

    #[tokio::test]
    async fn unreachable_backend_is_marked_unhealthy() {
        // Port 0 on connect always fails to resolve to a listening peer;
        // pick a closed local port instead by binding then dropping it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = TargetBackend::new(addr.ip().to_string(), addr.port());
        let checker = HealthChecker::new(Duration::from_millis(500));
        checker.check_one(&backend).await;
        assert!(!backend.is_healthy());
    }

    #[tokio::test]
    async fn check_all_probes_every_target_concurrently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });
        let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bad_addr = dead_listener.local_addr().unwrap();
        drop(dead_listener);

        let targets = vec![
            Arc::new(TargetBackend::new(good_addr.ip().to_string(), good_addr.port())),
            Arc::new(TargetBackend::new(bad_addr.ip().to_string(), bad_addr.port())),
        ];
        let checker = HealthChecker::new(Duration::from_millis(500));
        checker.check_all(&targets).await;

        assert!(targets[0].is_healthy());
        assert!(!targets[1].is_healthy());
    }
}
