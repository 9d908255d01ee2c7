//! Time-bounded cache of tradable symbols.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Symbol set with the instant it was fetched.
#[derive(Debug, Clone)]
pub struct SymbolCache {
    ttl: Duration,
    symbols: Option<HashSet<String>>,
    fetched_at: Option<Instant>,
}

impl SymbolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            symbols: None,
            fetched_at: None,
        }
    }

    /// Whether a refetch is due.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.fetched_at {
            Some(at) => now.duration_since(at) >= self.ttl,
            None => true,
        }
    }

    /// Replace the set. Symbols are stored uppercased.
    pub fn store(&mut self, symbols: HashSet<String>, now: Instant) {
        self.symbols = Some(symbols.into_iter().map(|s| s.to_ascii_uppercase()).collect());
        self.fetched_at = Some(now);
    }

    /// Record a failed refresh: keep whatever set is held and retry after the TTL.
    pub fn mark_failed(&mut self, now: Instant) {
        self.fetched_at = Some(now);
    }

    /// `None` means no listing has ever been fetched.
    pub fn symbols(&self) -> Option<&HashSet<String>> {
        self.symbols.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_follows_ttl() {
        let start = Instant::now();
        let mut cache = SymbolCache::new(Duration::from_secs(60));
        assert!(cache.is_stale(start));
        assert!(cache.symbols().is_none());

        cache.store(HashSet::from(["xbtusd".to_string()]), start);
        assert!(!cache.is_stale(start + Duration::from_secs(59)));
        assert!(cache.is_stale(start + Duration::from_secs(60)));
        assert!(cache.symbols().unwrap().contains("XBTUSD"));
    }

    #[test]
    fn test_failed_refresh_keeps_previous_set() {
        let start = Instant::now();
        let mut cache = SymbolCache::new(Duration::from_secs(60));
        cache.store(HashSet::from(["SOLUSD".to_string()]), start);

        let later = start + Duration::from_secs(120);
        cache.mark_failed(later);
        assert!(!cache.is_stale(later));
        assert!(cache.symbols().unwrap().contains("SOLUSD"));
    }
}
