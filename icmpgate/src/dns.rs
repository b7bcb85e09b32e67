use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use tokio::time::{Duration, Instant};

/// Cached reverse-DNS entry with expiration.
struct CacheEntry {
    hostname: Option<String>,
    expires_at: Instant,
}

/// Reverse-DNS resolver for offender addresses, with a TTL cache.
///
/// A source that is getting dropped tends to show up thousands of times in
/// a row, so failed lookups (no PTR record, timeout) are cached as `None`
/// like successes -- otherwise every drop would re-query the resolver.
pub struct ReverseDns {
    cache: DashMap<Ipv4Addr, CacheEntry>,
    ttl: Duration,
    timeout: Duration,
}

impl ReverseDns {
    /// * `ttl` -- how long a lookup result (success or failure) is kept.
    /// * `timeout` -- max wall-clock time for a single PTR query.
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            timeout,
        }
    }

    /// Resolve a source address to a hostname, consulting the cache first.
    pub async fn resolve(&self, addr: Ipv4Addr) -> Option<String> {
        if let Some(entry) = self.cache.get(&addr) {
            if Instant::now() < entry.expires_at {
                return entry.hostname.clone();
            }
        }

        // The lookup itself is blocking, so it runs on the blocking pool
        // under a timeout to keep the poller from stalling.
        let ip = IpAddr::V4(addr);
        let result = tokio::time::timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
                .await
                .unwrap_or(None)
        })
        .await
        .unwrap_or(None);

        // Some resolvers echo the address back instead of failing; treat
        // that as no hostname.
        let hostname = result.filter(|h| h != &addr.to_string());

        self.cache.insert(
            addr,
            CacheEntry {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeat_lookup_hits_cache() {
        let dns = ReverseDns::new(Duration::from_secs(300), Duration::from_secs(2));

        let first = dns.resolve(Ipv4Addr::LOCALHOST).await;
        // Whether the loopback resolves or not, the second call must agree
        // with the first (it is served from the cache).
        let second = dns.resolve(Ipv4Addr::LOCALHOST).await;
        assert_eq!(first, second);
        assert_eq!(dns.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_cached() {
        let dns = ReverseDns::new(Duration::from_secs(300), Duration::from_secs(2));

        // RFC 5737 TEST-NET: no PTR record on any real resolver.
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        let result = dns.resolve(addr).await;
        assert_eq!(result, None);
        assert!(dns.cache.contains_key(&addr));
    }
}
