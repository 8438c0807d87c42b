//! # Sticky Session Map
//!
//! Pins a client key (source endpoint for UDP, a session identifier for
//! HTTP) to the backend it was first routed to (spec §4.4). Bounded by
//! both a capacity-based LRU eviction and a TTL sweep — whichever fires
//! first reclaims an entry — so a sticky map under either high cardinality
//! or long idle churn cannot grow without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default idle TTL after which a sticky binding is considered stale.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default maximum number of live sticky bindings per endpoint.
pub const DEFAULT_CAPACITY: usize = 10_000;

struct Binding {
    backend_key: String,
    last_used: Instant,
}

/// A bounded, TTL-expiring client-key → backend-key map.
///
/// One `StickyMap` is owned per endpoint that has `stickySessions` enabled;
/// it never stores `Arc<TargetBackend>` directly, only the backend's
/// `"host:port"` key, so the map stays agnostic to which `LoadBalancer`
/// algorithm produced the original pick.
pub struct StickyMap {
    bindings: Mutex<HashMap<String, Binding>>,
    ttl: Duration,
    capacity: usize,
}

impl StickyMap {
    /// Creates an empty map with the given TTL and capacity.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Looks up the backend bound to `client_key`, if any binding exists
    /// and has not expired. Refreshes `last_used` on a hit.
    pub fn get(&self, client_key: &str) -> Option<String> {
        let mut guard = self.bindings.lock().expect("StickyMap lock poisoned");
        let binding = guard.get_mut(client_key)?;
        if binding.last_used.elapsed() > self.ttl {
            guard.remove(client_key);
            return None;
        }
        binding.last_used = Instant::now();
        guard.get(client_key).map(|b| b.backend_key.clone())
    }

    /// Records a new (or refreshed) binding. Evicts the least-recently-used
    /// entry first if this insertion would exceed `capacity`, then sweeps
    /// any already-expired entries opportunistically.
    pub fn put(&self, client_key: &str, backend_key: &str) {
        let mut guard = self.bindings.lock().expect("StickyMap lock poisoned");

        self.sweep_expired(&mut guard);

        if !guard.contains_key(client_key) && guard.len() >= self.capacity {
            if let Some(lru_key) = guard
                .iter()
                .min_by_key(|(_, b)| b.last_used)
                .map(|(k, _)| k.clone())
            {
                guard.remove(&lru_key);
            }
        }

        guard.insert(
            client_key.to_string(),
            Binding {
                backend_key: backend_key.to_string(),
                last_used: Instant::now(),
            },
        );
    }

    fn sweep_expired(&self, guard: &mut HashMap<String, Binding>) {
        let ttl = self.ttl;
        guard.retain(|_, b| b.last_used.elapsed() <= ttl);
    }

    /// Number of live bindings currently held.
    pub fn len(&self) -> usize {
        self.bindings.lock().expect("StickyMap lock poisoned").len()
    }

    /// Whether the map currently holds no bindings.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_the_same_backend() {
        let map = StickyMap::new(Duration::from_secs(60), 10);
        map.put("10.0.0.5:51000", "backend-a:9000");
        assert_eq!(map.get("10.0.0.5:51000"), Some("backend-a:9000".to_string()));
    }

    #[test]
    fn expired_binding_is_not_returned() {
        let map = StickyMap::new(Duration::from_millis(1), 10);
        map.put("10.0.0.5:51000", "backend-a:9000");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(map.get("10.0.0.5:51000"), None);
    }

    #[test]
    fn capacity_overflow_evicts_least_recently_used() {
        let map = StickyMap::new(Duration::from_secs(60), 2);
        map.put("client-a", "backend-1");
        map.put("client-b", "backend-2");
        // touch client-a so it's the most-recently-used of the two
        map.get("client-a");
        map.put("client-c", "backend-3");

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("client-b"), None);
        assert!(map.get("client-a").is_some());
        assert!(map.get("client-c").is_some());
    }
}
