//! # IP-to-Zone Lookup
//!
//! Spec §1 treats the IP-geo database as an external collaborator: "the
//! forwarder queries it." The trait below is that seam. `CidrZoneLookup` is
//! the supplemental, in-crate implementation spec §6 describes: "typically
//! load CIDR→zone rules at startup, optionally from a text file with lines
//! `CIDR whitespace ZONE`," wrapped in a small TTL+size-bounded cache so a
//! hot client IP is not re-matched against every rule on every request.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Thread-safe mapping from a client IP to a zone label.
///
/// Deliberately synchronous: the hot path (`LoadBalancer::pick`) must not
/// gain an await point just to resolve a zone, and both a CIDR table lookup
/// and a cache read are cheap enough to never need to suspend.
pub trait IpGeoLookup: Send + Sync {
    /// Resolves `ip` to a zone label. Missing or unparseable inputs, and any
    /// internal lookup failure, return `"unknown"` rather than erroring —
    /// zone resolution must never fail the request it's serving.
    fn zone_of(&self, ip: IpAddr) -> String;
}

struct CidrRule {
    network: IpAddr,
    prefix_len: u8,
    zone: String,
}

fn matches(rule: &CidrRule, ip: IpAddr) -> bool {
    match (rule.network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if rule.prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - rule.prefix_len.min(32))
            };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if rule.prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - rule.prefix_len.min(128))
            };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

struct CacheEntry {
    zone: String,
    inserted_at: Instant,
}

/// A static CIDR→zone rule table with a bounded, TTL-expiring lookup cache.
pub struct CidrZoneLookup {
    rules: Vec<CidrRule>,
    default_zone: String,
    cache: Mutex<std::collections::HashMap<IpAddr, CacheEntry>>,
    cache_ttl: Duration,
    cache_capacity: usize,
}

impl CidrZoneLookup {
    /// Builds a lookup table from `(cidr, zone)` pairs, e.g. parsed from a
    /// `CIDR whitespace ZONE` rules file by the embedding binary.
    pub fn new(rules: &[(&str, &str)], cache_ttl: Duration, cache_capacity: usize) -> Self {
        let parsed = rules
            .iter()
            .filter_map(|(cidr, zone)| parse_cidr(cidr).map(|(network, prefix_len)| CidrRule {
                network,
                prefix_len,
                zone: zone.to_string(),
            }))
            .collect();

        Self {
            rules: parsed,
            default_zone: "unknown".to_string(),
            cache: Mutex::new(std::collections::HashMap::new()),
            cache_ttl,
            cache_capacity,
        }
    }
}

fn parse_cidr(cidr: &str) -> Option<(IpAddr, u8)> {
    let mut parts = cidr.splitn(2, '/');
    let addr = parts.next()?.parse::<IpAddr>().ok()?;
    let prefix_len = match parts.next() {
        Some(p) => p.parse::<u8>().ok()?,
        None => match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        },
    };
    Some((addr, prefix_len))
}

impl IpGeoLookup for CidrZoneLookup {
    fn zone_of(&self, ip: IpAddr) -> String {
        {
            let mut cache = self.cache.lock().expect("geo cache lock poisoned");
            if let Some(entry) = cache.get(&ip) {
                if entry.inserted_at.elapsed() < self.cache_ttl {
                    return entry.zone.clone();
                }
                cache.remove(&ip);
            }
        }

        let zone = self
            .rules
            .iter()
            .find(|r| matches(r, ip))
            .map(|r| r.zone.clone())
            .unwrap_or_else(|| self.default_zone.clone());

        let mut cache = self.cache.lock().expect("geo cache lock poisoned");
        if cache.len() >= self.cache_capacity {
            // Cheap, bounded eviction: drop an arbitrary entry rather than
            // tracking LRU order for a cache this small and this hot.
            if let Some(key) = cache.keys().next().copied() {
                cache.remove(&key);
            }
        }
        cache.insert(
            ip,
            CacheEntry {
                zone: zone.clone(),
                inserted_at: Instant::now(),
            },
        );
        zone
    }
}

/// A lookup that always reports `"unknown"`. Used when no geo rules are configured.
pub struct UnknownZoneLookup;

impl IpGeoLookup for UnknownZoneLookup {
    fn zone_of(&self, _ip: IpAddr) -> String {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_cidr_match_returns_configured_zone() {
        let lookup = CidrZoneLookup::new(
            &[("10.0.0.0/8", "na-east"), ("172.16.0.0/12", "ap-east")],
            Duration::from_secs(60),
            100,
        );
        assert_eq!(lookup.zone_of("10.1.2.3".parse().unwrap()), "na-east");
        assert_eq!(lookup.zone_of("172.16.5.5".parse().unwrap()), "ap-east");
    }

    #[test]
    fn unmatched_ip_falls_back_to_unknown() {
        let lookup = CidrZoneLookup::new(&[("10.0.0.0/8", "na-east")], Duration::from_secs(60), 100);
        assert_eq!(lookup.zone_of("8.8.8.8".parse().unwrap()), "unknown");
    }

    #[test]
    fn cache_is_bounded_by_capacity() {
        let lookup = CidrZoneLookup::new(&[("0.0.0.0/0", "global")], Duration::from_secs(60), 2);
        for i in 1..=5u8 {
            lookup.zone_of(IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 0, i)));
        }
        assert!(lookup.cache.lock().unwrap().len() <= 2);
    }
}
