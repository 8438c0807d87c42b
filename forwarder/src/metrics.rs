//! # Metrics Store
//!
//! A concurrent map keyed by `"ip:port"`, tracking per-backend connection
//! counters and HTTP status-class counters (spec §3, `ConnectionMetrics`).
//! The map itself is guarded by a short-held `std::sync::Mutex`, the same
//! discipline `core::registry::Registry` and `core::dispatcher::Dispatcher`
//! use in the teacher crate: the lock is only ever held across a handful of
//! map operations, never across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::TargetBackend;

/// A point-in-time snapshot of one backend's counters, as returned by
/// `Metrics()` (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetricsSnapshot {
    /// `"ip:port"` of the backend this snapshot describes.
    pub target: String,
    /// Connections currently in flight.
    pub active: i64,
    /// Connections admitted over the lifetime of the backend.
    pub total: u64,
    /// HTTP 2xx responses relayed.
    pub http_2xx: u64,
    /// HTTP 3xx responses relayed.
    pub http_3xx: u64,
    /// HTTP 4xx responses relayed.
    pub http_4xx: u64,
    /// HTTP 5xx responses relayed.
    pub http_5xx: u64,
    /// Unix epoch milliseconds of the last admit/release/response event.
    pub last_activity_unix_ms: u64,
    /// Exponentially-tracked average response time, HTTP only.
    pub avg_response_time_ms: u64,
}

/// Listener-level status, as returned by `Metrics()`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    /// Bound listen port.
    pub listen_port: u16,
    /// Protocol served on that port.
    pub protocol: String,
    /// Whether the accept loop is currently running.
    pub is_active: bool,
}

/// The full snapshot returned by `Orchestrator::metrics()`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Sum of `active` across every tracked backend.
    pub active_connections: i64,
    /// Per-backend counters.
    pub connection_metrics: Vec<ConnectionMetricsSnapshot>,
    /// Per-listener status.
    pub endpoint_status: Vec<EndpointStatus>,
}

/// Concurrent registry of per-backend metrics, keyed by `"ip:port"`.
///
/// `TargetBackend` already owns its own atomics; `MetricsStore` exists so
/// that `Orchestrator::metrics()` can enumerate every backend across every
/// endpoint without needing a handle to each `EndpointConfig` individually,
/// and so that a backend that is looked up by key (e.g. from the HTTP
/// forwarder's hop-by-hop rewrite path) can be found in O(1).
#[derive(Default)]
pub struct MetricsStore {
    backends: Mutex<HashMap<String, Arc<TargetBackend>>>,
}

impl MetricsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a backend under its `"ip:port"` key. Called once per
    /// backend during `Orchestrator::init`.
    pub fn register(&self, backend: Arc<TargetBackend>) {
        let key = backend.key();
        let mut guard = self.backends.lock().expect("MetricsStore lock poisoned");
        guard.insert(key, backend);
    }

    /// Looks up a previously registered backend by key.
    pub fn get(&self, key: &str) -> Option<Arc<TargetBackend>> {
        let guard = self.backends.lock().expect("MetricsStore lock poisoned");
        guard.get(key).cloned()
    }

    /// Total active connections across every tracked backend.
    pub fn total_active(&self) -> i64 {
        let guard = self.backends.lock().expect("MetricsStore lock poisoned");
        guard
            .values()
            .map(|b| b.active_connections.load(Ordering::Relaxed))
            .sum()
    }

    /// Snapshots every tracked backend's counters.
    pub fn snapshot(&self) -> Vec<ConnectionMetricsSnapshot> {
        let guard = self.backends.lock().expect("MetricsStore lock poisoned");
        guard
            .values()
            .map(|b| ConnectionMetricsSnapshot {
                target: b.key(),
                active: b.active_connections.load(Ordering::Relaxed),
                total: b.total_connections.load(Ordering::Relaxed),
                http_2xx: b.http_2xx.load(Ordering::Relaxed),
                http_3xx: b.http_3xx.load(Ordering::Relaxed),
                http_4xx: b.http_4xx.load(Ordering::Relaxed),
                http_5xx: b.http_5xx.load(Ordering::Relaxed),
                last_activity_unix_ms: b.last_activity_unix_ms.load(Ordering::Relaxed),
                avg_response_time_ms: b.avg_response_time_ms.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_never_goes_negative_across_admit_release_pairs() {
        let store = MetricsStore::new();
        let backend = Arc::new(TargetBackend::new("127.0.0.1", 9001));
        store.register(Arc::clone(&backend));

        backend.record_admit();
        backend.record_admit();
        assert_eq!(store.total_active(), 2);

        backend.record_release();
        backend.record_release();
        assert_eq!(store.total_active(), 0);
        assert!(store.total_active() >= 0);
    }

    #[test]
    fn snapshot_reflects_http_status_buckets() {
        let store = MetricsStore::new();
        let backend = Arc::new(TargetBackend::new("127.0.0.1", 9002));
        store.register(Arc::clone(&backend));

        backend.record_http_status(200);
        backend.record_http_status(404);
        backend.record_http_status(503);

        let snap = store.snapshot();
        let entry = snap.iter().find(|s| s.target == "127.0.0.1:9002").unwrap();
        assert_eq!(entry.http_2xx, 1);
        assert_eq!(entry.http_4xx, 1);
        assert_eq!(entry.http_5xx, 1);
    }

    #[test]
    fn response_time_average_converges_under_cas_retry() {
        let backend = TargetBackend::new("127.0.0.1", 9003);
        backend.record_response_time(std::time::Duration::from_millis(100));
        backend.record_response_time(std::time::Duration::from_millis(200));
        // (100 + 200) / 2 = 150
        assert_eq!(backend.avg_response_time_ms.load(Ordering::Relaxed), 150);
    }
}
