use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Settings;

pub type SharedSegmentAdCache = Arc<Mutex<SegmentAdCache>>;

/// Global TTL cache of segment URLs known to be ads.
///
/// Entries record the first time a URL was observed and are dropped once
/// older than the TTL. Pruning is lazy: it piggybacks on `record`/`contains`
/// calls and runs at most once per prune interval, never on a timer. Callers
/// pass `now` explicitly, which keeps the expiry behavior testable without a
/// mocked clock.
pub struct SegmentAdCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    prune_interval: Duration,
    last_prune: Instant,
}

impl SegmentAdCache {
    pub fn new(ttl: Duration, prune_interval: Duration, now: Instant) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            prune_interval,
            last_prune: now,
        }
    }

    pub fn from_settings(settings: &Settings, now: Instant) -> Self {
        Self::new(settings.ad_cache_ttl, settings.ad_cache_prune_interval, now)
    }

    pub fn shared(settings: &Settings) -> SharedSegmentAdCache {
        Arc::new(Mutex::new(Self::from_settings(settings, Instant::now())))
    }

    /// Marks a URL as a known ad segment. The first-observed timestamp of an
    /// already-known URL is preserved.
    pub fn record(&mut self, url: &str, now: Instant) {
        self.maybe_prune(now);
        self.entries.entry(url.to_string()).or_insert(now);
    }

    pub fn contains(&mut self, url: &str, now: Instant) -> bool {
        self.maybe_prune(now);
        self.entries.contains_key(url)
    }

    /// Runs the lazy prune pass if the throttle window has elapsed.
    pub fn prune(&mut self, now: Instant) {
        self.maybe_prune(now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_prune(&mut self, now: Instant) {
        if now.duration_since(self.last_prune) < self.prune_interval {
            return;
        }
        self.last_prune = now;
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, first_seen| now.duration_since(*first_seen) <= ttl);
        if self.entries.len() < before {
            debug!(
                removed = before - self.entries.len(),
                remaining = self.entries.len(),
                "pruned expired ad segment entries"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SegmentAdCache {
        SegmentAdCache::new(
            Duration::from_secs(120),
            Duration::from_secs(60),
            Instant::now(),
        )
    }

    #[test]
    fn test_entry_expires_after_ttl_with_lazy_prune() {
        let t0 = Instant::now();
        let mut cache = SegmentAdCache::new(
            Duration::from_secs(120),
            Duration::from_secs(60),
            t0,
        );
        cache.record("https://edge.example.com/ad.ts", t0);

        // Intervening call after the prune interval resets the throttle
        // window without touching the still-fresh entry.
        assert!(cache.contains("https://edge.example.com/ad.ts", t0 + Duration::from_secs(61)));

        assert!(cache.contains("https://edge.example.com/ad.ts", t0 + Duration::from_secs(119)));
        assert!(!cache.contains("https://edge.example.com/ad.ts", t0 + Duration::from_secs(121)));
    }

    #[test]
    fn test_prune_is_throttled() {
        let t0 = Instant::now();
        let mut cache = SegmentAdCache::new(
            Duration::from_secs(120),
            Duration::from_secs(60),
            t0,
        );
        cache.record("a", t0);

        // A pass at t+70 keeps the still-fresh entry and resets the window.
        assert!(cache.contains("a", t0 + Duration::from_secs(70)));

        // Entry is now past its TTL, but the throttle window has not elapsed
        // since the last pass, so the stale entry is still reported.
        assert!(cache.contains("a", t0 + Duration::from_secs(125)));

        // Next call outside the window drops it.
        assert!(!cache.contains("a", t0 + Duration::from_secs(130)));
    }

    #[test]
    fn test_first_observed_timestamp_preserved() {
        let t0 = Instant::now();
        let mut cache = cache();
        cache.record("a", t0);
        cache.record("a", t0 + Duration::from_secs(100));
        // Re-recording does not refresh the entry; it still expires relative
        // to the first observation.
        assert!(!cache.contains("a", t0 + Duration::from_secs(161)));
    }

    #[test]
    fn test_len() {
        let t0 = Instant::now();
        let mut cache = cache();
        assert!(cache.is_empty());
        cache.record("a", t0);
        cache.record("b", t0);
        assert_eq!(cache.len(), 2);
    }
}
