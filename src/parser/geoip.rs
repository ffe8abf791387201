//! Geo-IP resolution (§4.2.2): an LRU-ish cache in front of an injected
//! lookup, so the parser itself stays pure and testable without a real
//! MaxMind database.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;

use crate::events::Location;

/// Abstracts the actual geo-IP database so tests can supply a fake.
pub trait GeoIpLookup: Send + Sync {
    /// Returns `None` if the address is not found in the database.
    fn lookup(&self, ip: IpAddr) -> Option<Location>;
}

/// Wraps a MaxMind-format City database file.
pub struct MaxMindLookup {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindLookup {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)?;
        Ok(Self { reader })
    }
}

impl GeoIpLookup for MaxMindLookup {
    fn lookup(&self, ip: IpAddr) -> Option<Location> {
        let city: maxminddb::geoip2::City = self.reader.lookup(ip).ok()?;
        let country = city
            .country
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let (lat, lon) = city
            .location
            .as_ref()
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((None, None));
        Some(Location { country, lat, lon })
    }
}

/// Bounded `ip -> Location` cache with arbitrary (oldest-insertion) eviction
/// on overflow, matching the corpus's plain-dict-with-size-check behavior.
pub struct GeoIpCache {
    entries: HashMap<String, Location>,
    insertion_order: VecDeque<String>,
    capacity: usize,
}

impl GeoIpCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
        }
    }

    /// Resolves `ip`, consulting the cache first and falling back to
    /// `lookup` on a miss. A "not found" result from `lookup` is cached as
    /// the `Unknown` sentinel so repeated misses don't re-query.
    pub fn resolve(&mut self, ip: &str, lookup: &dyn GeoIpLookup) -> Location {
        if let Some(cached) = self.entries.get(ip) {
            return cached.clone();
        }

        let location = ip
            .parse::<IpAddr>()
            .ok()
            .and_then(|addr| lookup.lookup(addr))
            .unwrap_or_else(Location::unknown);

        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.insertion_order.push_back(ip.to_string());
        self.entries.insert(ip.to_string(), location.clone());
        location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLookup(Option<Location>);
    impl GeoIpLookup for FixedLookup {
        fn lookup(&self, _ip: IpAddr) -> Option<Location> {
            self.0.clone()
        }
    }

    #[test]
    fn cache_hit_avoids_second_lookup() {
        struct CountingLookup(std::sync::atomic::AtomicU32);
        impl GeoIpLookup for CountingLookup {
            fn lookup(&self, _ip: IpAddr) -> Option<Location> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Some(Location {
                    country: "Testland".into(),
                    lat: Some(1.0),
                    lon: Some(2.0),
                })
            }
        }

        let lookup = CountingLookup(std::sync::atomic::AtomicU32::new(0));
        let mut cache = GeoIpCache::new(10);
        cache.resolve("1.2.3.4", &lookup);
        cache.resolve("1.2.3.4", &lookup);
        assert_eq!(lookup.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn miss_caches_unknown_sentinel() {
        let lookup = FixedLookup(None);
        let mut cache = GeoIpCache::new(10);
        let loc = cache.resolve("9.9.9.9", &lookup);
        assert_eq!(loc.country, "Unknown");
        assert!(loc.lat.is_none());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let lookup = FixedLookup(Some(Location {
            country: "X".into(),
            lat: None,
            lon: None,
        }));
        let mut cache = GeoIpCache::new(2);
        cache.resolve("1.1.1.1", &lookup);
        cache.resolve("2.2.2.2", &lookup);
        cache.resolve("3.3.3.3", &lookup);
        assert_eq!(cache.entries.len(), 2);
        assert!(!cache.entries.contains_key("1.1.1.1"));
    }
}
