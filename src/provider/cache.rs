// Provider Cache - per-platform provider lists with a TTL

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Platform, Provider};

#[derive(Clone, Debug)]
struct CacheEntry {
    providers: Vec<Arc<Provider>>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Read-mostly cache in front of the provider directory.
///
/// Entries are replaced wholesale, so a reader sees either the old list or
/// the new one.
#[derive(Debug, Default)]
pub struct ProviderCache {
    entries: RwLock<HashMap<Platform, CacheEntry>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, platform: Platform) -> Option<Vec<Arc<Provider>>> {
        self.get_at(platform, Instant::now())
    }

    fn get_at(&self, platform: Platform, now: Instant) -> Option<Vec<Arc<Provider>>> {
        let entries = self.entries.read();
        entries
            .get(&platform)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.providers.clone())
    }

    pub fn set(&self, platform: Platform, providers: Vec<Arc<Provider>>, ttl: Duration) {
        let entry = CacheEntry {
            providers,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(platform, entry);
    }

    pub fn invalidate(&self, platform: Platform) {
        if self.entries.write().remove(&platform).is_some() {
            tracing::debug!("[ProviderCache] Invalidated platform: {}", platform);
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(names: &[&str]) -> Vec<Arc<Provider>> {
        names
            .iter()
            .map(|name| {
                Arc::new(
                    serde_json::from_value(serde_json::json!({ "name": name }))
                        .unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_get_returns_fresh_entries_only() {
        let cache = ProviderCache::new();
        assert!(cache.get(Platform::Claude).is_none());

        cache.set(Platform::Claude, providers(&["a", "b"]), Duration::from_secs(60));
        let hit = cache.get(Platform::Claude).unwrap();
        assert_eq!(hit.len(), 2);
        assert!(cache.get(Platform::Codex).is_none());

        let later = Instant::now() + Duration::from_secs(61);
        assert!(cache.get_at(Platform::Claude, later).is_none());
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = ProviderCache::new();
        cache.set(Platform::Gemini, providers(&["a"]), Duration::ZERO);
        assert!(cache.get(Platform::Gemini).is_none());
    }

    #[test]
    fn test_set_replaces_and_invalidate_drops() {
        let cache = ProviderCache::new();
        cache.set(Platform::Codex, providers(&["a"]), Duration::from_secs(60));
        cache.set(Platform::Codex, providers(&["b", "c"]), Duration::from_secs(60));
        let names: Vec<_> = cache
            .get(Platform::Codex)
            .unwrap()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["b", "c"]);

        cache.invalidate(Platform::Codex);
        assert!(cache.get(Platform::Codex).is_none());
    }
}
