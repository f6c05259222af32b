//! Expiring cache of handler results, keyed by input URL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::ResolvedUrls;

/// How long a resolved link is reused before the handler is asked again.
pub const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub(super) struct ResolveCache {
    ttl: Duration,
    entries: HashMap<String, (Instant, ResolvedUrls)>,
}

impl Default for ResolveCache {
    fn default() -> Self {
        Self::with_ttl(RESOLVE_CACHE_TTL)
    }
}

impl ResolveCache {
    pub(super) fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub(super) fn get(&self, input: &str) -> Option<ResolvedUrls> {
        self.entries
            .get(input)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, resolved)| resolved.clone())
    }

    pub(super) fn insert(&mut self, input: &str, resolved: ResolvedUrls) {
        let ttl = self.ttl;
        self.entries.retain(|_, (at, _)| at.elapsed() < ttl);
        self.entries
            .insert(input.to_string(), (Instant::now(), resolved));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire() {
        let mut cache = ResolveCache::with_ttl(Duration::ZERO);
        cache.insert("mod://a", ResolvedUrls::direct("https://a"));
        assert!(cache.get("mod://a").is_none());

        let mut cache = ResolveCache::default();
        cache.insert("mod://a", ResolvedUrls::direct("https://a"));
        assert_eq!(cache.get("mod://a").unwrap().urls, vec!["https://a"]);
        assert!(cache.get("mod://b").is_none());
    }
}
