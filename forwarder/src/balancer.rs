//! # Load Balancer
//!
//! Backend selection across the six policies spec §4.3 defines, plus the
//! sticky-session short-circuit and on-demand health recovery spec §4.9
//! describes. `pick` is synchronous everywhere except the health-recovery
//! fallback, which is the one path allowed to await — every other policy
//! only ever reads already-resolved atomics.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{EndpointConfig, LoadBalancingAlgorithm, TargetBackend};
use crate::error::{ForwarderError, Result};
use crate::geo::IpGeoLookup;
use crate::health::HealthChecker;

/// Selection context extracted from an incoming connection or request.
///
/// `key` drives `Hash` selection and sticky-session lookups; `client_ip`
/// drives `ZoneAffinity` resolution. Both are optional because not every
/// listener protocol can produce them (UDP rarely carries a session key;
/// TCP passthrough has no headers to read a zone hint from).
#[derive(Debug, Default, Clone)]
pub struct SelectionContext {
    /// Client-supplied or address-derived key for hashing / stickiness.
    pub key: Option<String>,
    /// Client source IP, used for zone resolution.
    pub client_ip: Option<IpAddr>,
    /// Zone hint read directly from a request header, if any; takes
    /// precedence over IP-based resolution when present.
    pub zone_hint: Option<String>,
}

/// Per-endpoint round-robin/weighted-round-robin cursor state.
#[derive(Default)]
struct Cursors {
    round_robin: AtomicUsize,
    /// Current weight credit per target, indexed the same as `targets`, used
    /// by the smooth (nginx-style) weighted round-robin algorithm.
    wrr_current_weight: Vec<AtomicU32>,
}

/// Stateful selector bound to one endpoint's backend pool.
pub struct LoadBalancer {
    algorithm: LoadBalancingAlgorithm,
    cursors: Cursors,
    health_checker: HealthChecker,
}

impl LoadBalancer {
    /// Builds a balancer for `endpoint`, sized to its target count.
    pub fn new(endpoint: &EndpointConfig) -> Self {
        let wrr_current_weight = endpoint.targets.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            algorithm: endpoint.algorithm,
            cursors: Cursors {
                round_robin: AtomicUsize::new(0),
                wrr_current_weight,
            },
            health_checker: HealthChecker::default(),
        }
    }

    /// Selects a backend index from `endpoint.targets` for a new connection
    /// or request, applying the configured algorithm over the set of
    /// currently healthy backends. If no backend is healthy, runs an
    /// on-demand recovery pass and retries once before giving up.
    pub async fn pick(
        &self,
        endpoint: &EndpointConfig,
        geo: &dyn IpGeoLookup,
        ctx: &SelectionContext,
    ) -> Result<Arc<TargetBackend>> {
        if let Some(idx) = self.pick_healthy(endpoint, geo, ctx) {
            return Ok(Arc::clone(&endpoint.targets[idx]));
        }

        self.health_checker.check_all(&endpoint.targets).await;

        self.pick_healthy(endpoint, geo, ctx)
            .map(|idx| Arc::clone(&endpoint.targets[idx]))
            .ok_or_else(|| ForwarderError::NoHealthyBackend(endpoint.listen_key()))
    }

    fn pick_healthy(
        &self,
        endpoint: &EndpointConfig,
        geo: &dyn IpGeoLookup,
        ctx: &SelectionContext,
    ) -> Option<usize> {
        let healthy: Vec<usize> = endpoint
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_healthy())
            .map(|(i, _)| i)
            .collect();

        if healthy.is_empty() {
            return None;
        }

        match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => Some(self.round_robin(&healthy)),
            LoadBalancingAlgorithm::Random => Some(self.random(&healthy)),
            LoadBalancingAlgorithm::LeastConnections => {
                Some(self.least_connections(endpoint, &healthy))
            }
            LoadBalancingAlgorithm::WeightedRoundRobin => {
                Some(self.weighted_round_robin(endpoint, &healthy))
            }
            LoadBalancingAlgorithm::Hash => {
                Some(self.hash(endpoint, &healthy, ctx))
            }
            LoadBalancingAlgorithm::ZoneAffinity => {
                Some(self.zone_affinity(endpoint, geo, ctx, &healthy))
            }
        }
    }

    fn round_robin(&self, healthy: &[usize]) -> usize {
        let n = self.cursors.round_robin.fetch_add(1, Ordering::Relaxed);
        healthy[n % healthy.len()]
    }

    fn random(&self, healthy: &[usize]) -> usize {
        use rand::Rng;
        let i = rand::rng().random_range(0..healthy.len());
        healthy[i]
    }

    fn least_connections(&self, endpoint: &EndpointConfig, healthy: &[usize]) -> usize {
        *healthy
            .iter()
            .min_by_key(|&&i| endpoint.targets[i].active_connections())
            .expect("healthy is non-empty")
    }

    /// Smooth weighted round-robin, identical in shape to nginx's
    /// `ngx_http_upstream_get_peer`: each candidate's running weight is
    /// incremented by its configured weight every pick, the highest runner
    /// is chosen, and the winner's running weight is reduced by the total.
    fn weighted_round_robin(&self, endpoint: &EndpointConfig, healthy: &[usize]) -> usize {
        let total_weight: i64 = healthy
            .iter()
            .map(|&i| endpoint.targets[i].weight.unwrap_or(1) as i64)
            .sum();

        let mut best_idx = healthy[0];
        let mut best_current = i64::MIN;

        for &i in healthy {
            let weight = endpoint.targets[i].weight.unwrap_or(1) as i64;
            let current = self.cursors.wrr_current_weight[i].fetch_add(weight as u32, Ordering::Relaxed) as i64
                + weight;
            if current > best_current {
                best_current = current;
                best_idx = i;
            }
        }

        let reduced = (best_current - total_weight).max(0) as u32;
        self.cursors.wrr_current_weight[best_idx].store(reduced, Ordering::Relaxed);
        best_idx
    }

    /// `hash(key) mod |healthy|` when no target carries a weight; switches
    /// to a consistent-hash ring (each backend gets `weight` virtual nodes)
    /// once any target is weighted, so reweighting doesn't remap every key.
    fn hash(&self, endpoint: &EndpointConfig, healthy: &[usize], ctx: &SelectionContext) -> usize {
        let key = ctx.key.clone().unwrap_or_default();
        let h = fnv1a(key.as_bytes());

        let any_weighted = healthy.iter().any(|&i| endpoint.targets[i].weight.is_some());
        if !any_weighted {
            return healthy[(h as usize) % healthy.len()];
        }

        let mut ring: Vec<(u64, usize)> = Vec::new();
        for &i in healthy {
            let vnodes = endpoint.targets[i].weight.unwrap_or(1).max(1);
            for v in 0..vnodes {
                let vnode_key = format!("{}:{}#{}", endpoint.targets[i].host, endpoint.targets[i].port, v);
                ring.push((fnv1a(vnode_key.as_bytes()), i));
            }
        }
        ring.sort_by_key(|(h, _)| *h);

        ring.iter()
            .find(|(node_hash, _)| *node_hash >= h)
            .or_else(|| ring.first())
            .map(|(_, idx)| *idx)
            .expect("ring is non-empty because healthy is non-empty")
    }

    fn zone_affinity(
        &self,
        endpoint: &EndpointConfig,
        geo: &dyn IpGeoLookup,
        ctx: &SelectionContext,
        healthy: &[usize],
    ) -> usize {
        let unknown_zone = endpoint
            .zone_affinity
            .as_ref()
            .map(|p| p.unknown_zone.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let client_zone = ctx
            .zone_hint
            .clone()
            .or_else(|| ctx.client_ip.map(|ip| geo.zone_of(ip)))
            .unwrap_or(unknown_zone);

        let same_zone: Vec<usize> = healthy
            .iter()
            .copied()
            .filter(|&i| endpoint.targets[i].zone.as_deref() == Some(client_zone.as_str()))
            .collect();

        let candidates = if same_zone.is_empty() { healthy } else { &same_zone };

        *candidates
            .iter()
            .min_by_key(|&&i| endpoint.targets[i].active_connections())
            .expect("candidates is non-empty")
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
