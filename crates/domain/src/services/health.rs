use std::time::{Duration, Instant};

use moka::sync::Cache;

use crate::model::Endpoint;

/// Latest liveness measurement for one endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHealthRecord {
    pub url: String,
    pub last_tested_at: Instant,
    pub latency_ms: u64,
    pub ok: bool,
}

/// TTL-bounded record of which endpoints answer and how fast. Records older
/// than the TTL are never returned, even if the cache has not evicted them
/// yet.
#[derive(Debug, Clone)]
pub struct EndpointHealthCache {
    ttl: Duration,
    records: Cache<String, EndpointHealthRecord>,
}

impl EndpointHealthCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_CAPACITY: u64 = 1_024;

    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(Self::DEFAULT_CAPACITY)
                .build(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a fresh measurement, replacing any previous one for the URL.
    pub fn record_health(&self, url: &str, latency_ms: u64, ok: bool) {
        self.records.insert(
            url.to_string(),
            EndpointHealthRecord {
                url: url.to_string(),
                last_tested_at: Instant::now(),
                latency_ms,
                ok,
            },
        );
    }

    /// Drops whatever is known about the URL.
    pub fn forget(&self, url: &str) {
        self.records.invalidate(url);
    }

    /// The record for `url` if it is still within the TTL.
    pub fn fresh_record(&self, url: &str) -> Option<EndpointHealthRecord> {
        self.records
            .get(url)
            .filter(|record| record.last_tested_at.elapsed() < self.ttl)
    }

    pub fn is_known_bad(&self, url: &str) -> bool {
        self.fresh_record(url).is_some_and(|record| !record.ok)
    }

    /// Candidates with a fresh `ok` record, fastest first.
    pub fn rank_healthy(&self, candidates: &[Endpoint]) -> Vec<Endpoint> {
        let mut ranked: Vec<(u64, Endpoint)> = candidates
            .iter()
            .filter_map(|endpoint| {
                self.fresh_record(&endpoint.url)
                    .filter(|record| record.ok)
                    .map(|record| (record.latency_ms, endpoint.clone()))
            })
            .collect();
        ranked.sort_by_key(|(latency, endpoint)| (*latency, endpoint.priority));
        ranked.into_iter().map(|(_, endpoint)| endpoint).collect()
    }
}

impl Default for EndpointHealthCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Network, Transport};

    fn endpoint(url: &str, priority: u16) -> Endpoint {
        Endpoint::new(Network::Polygon, Transport::Http, url, priority)
    }

    #[test]
    fn failed_measurement_replaces_healthy_one() {
        let cache = EndpointHealthCache::default();
        cache.record_health("https://a", 50, true);
        assert_eq!(cache.rank_healthy(&[endpoint("https://a", 0)]).len(), 1);

        cache.record_health("https://a", 0, false);
        assert!(cache.rank_healthy(&[endpoint("https://a", 0)]).is_empty());
        assert!(cache.is_known_bad("https://a"));
    }

    #[test]
    fn expired_records_are_never_trusted() {
        let cache = EndpointHealthCache::new(Duration::from_millis(30));
        cache.record_health("https://a", 10, true);
        assert!(cache.fresh_record("https://a").is_some());

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.fresh_record("https://a").is_none());
        assert!(cache.rank_healthy(&[endpoint("https://a", 0)]).is_empty());
        assert!(!cache.is_known_bad("https://a"));
    }

    #[test]
    fn equal_latency_falls_back_to_priority() {
        let cache = EndpointHealthCache::default();
        cache.record_health("https://b", 20, true);
        cache.record_health("https://a", 20, true);
        let ranked = cache.rank_healthy(&[endpoint("https://b", 1), endpoint("https://a", 0)]);
        assert_eq!(ranked[0].url, "https://a");
    }

    #[test]
    fn unknown_endpoints_are_not_ranked() {
        let cache = EndpointHealthCache::default();
        assert!(cache.rank_healthy(&[endpoint("https://x", 0)]).is_empty());
        cache.record_health("https://x", 5, true);
        cache.forget("https://x");
        assert!(cache.fresh_record("https://x").is_none());
    }
}
