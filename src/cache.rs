//! Memoised availability scans, one entry per (venue, service, date).
//!
//! Entries are never patched: any mutation touching a key deletes it and the
//! next read recomputes from the store. Entries also age out after a fixed
//! TTL so a lost invalidation heals on its own.
//!
//! Every invalidation bumps a per-key generation. A reader takes the
//! generation before scanning the store and its `put` only lands if no
//! invalidation happened in between.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::engine::ServiceAvailability;
use crate::model::{CacheKey, Ms};

#[derive(Debug)]
pub struct CacheError(pub String);

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache error: {}", self.0)
    }
}

impl std::error::Error for CacheError {}

#[async_trait]
pub trait AvailabilityCache: Send + Sync {
    async fn get(&self, key: &CacheKey, now: Ms) -> Result<Option<ServiceAvailability>, CacheError>;
    /// Current generation of `key`. Read it before loading what gets `put`.
    async fn generation(&self, key: &CacheKey) -> Result<u64, CacheError>;
    /// Store the value if `key` is still at `generation`. Returns whether it was stored.
    async fn put(
        &self,
        key: CacheKey,
        value: ServiceAvailability,
        generation: u64,
        now: Ms,
    ) -> Result<bool, CacheError>;
    /// Drop the entry and bump the generation. Absent keys are not an error.
    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError>;
}

struct Entry {
    stored_at: Ms,
    value: ServiceAvailability,
}

/// Process-local backing. A shared KV store would implement the same trait.
pub struct InMemoryCache {
    entries: DashMap<CacheKey, Entry>,
    generations: DashMap<CacheKey, u64>,
    ttl_ms: Ms,
}

impl InMemoryCache {
    pub fn new(ttl_ms: Ms) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AvailabilityCache for InMemoryCache {
    async fn get(&self, key: &CacheKey, now: Ms) -> Result<Option<ServiceAvailability>, CacheError> {
        let hit = match self.entries.get(key) {
            Some(entry) if now - entry.stored_at < self.ttl_ms => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            // Stale; only remove if nobody refreshed it meanwhile.
            self.entries
                .remove_if(key, |_, e| now - e.stored_at >= self.ttl_ms);
        }
        Ok(hit)
    }

    async fn generation(&self, key: &CacheKey) -> Result<u64, CacheError> {
        Ok(self.generations.get(key).map_or(0, |g| *g))
    }

    // Both paths hold the generation entry while touching `entries`, so a
    // put cannot slip in between a bump and its remove.
    async fn put(
        &self,
        key: CacheKey,
        value: ServiceAvailability,
        generation: u64,
        now: Ms,
    ) -> Result<bool, CacheError> {
        let current = self.generations.entry(key).or_insert(0);
        if *current != generation {
            return Ok(false);
        }
        self.entries.insert(key, Entry { stored_at: now, value });
        Ok(true)
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut current = self.generations.entry(*key).or_insert(0);
        *current += 1;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_date;

    fn key(day: &str) -> CacheKey {
        CacheKey {
            venue_id: 1,
            service_id: 1,
            date: parse_date(day).unwrap(),
        }
    }

    fn value(k: &CacheKey) -> ServiceAvailability {
        ServiceAvailability {
            venue_id: k.venue_id,
            service_id: k.service_id,
            date: k.date,
            computed_at: 0,
            slots: Vec::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let cache = InMemoryCache::new(1000);
        let k = key("2024-06-01");
        assert!(cache.put(k, value(&k), 0, 0).await.unwrap());
        assert!(cache.get(&k, 10).await.unwrap().is_some());
        assert!(cache.get(&key("2024-06-02"), 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_deletes_only_that_key() {
        let cache = InMemoryCache::new(1000);
        let a = key("2024-06-01");
        let b = key("2024-06-02");
        cache.put(a, value(&a), 0, 0).await.unwrap();
        cache.put(b, value(&b), 0, 0).await.unwrap();
        cache.invalidate(&a).await.unwrap();
        assert!(cache.get(&a, 1).await.unwrap().is_none());
        assert!(cache.get(&b, 1).await.unwrap().is_some());
        // Absent key is fine.
        cache.invalidate(&a).await.unwrap();
    }

    #[tokio::test]
    async fn entries_age_out() {
        let cache = InMemoryCache::new(1000);
        let k = key("2024-06-01");
        assert!(cache.put(k, value(&k), 0, 0).await.unwrap());
        assert!(cache.get(&k, 999).await.unwrap().is_some());
        assert!(cache.get(&k, 1000).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn put_after_invalidation_is_refused() {
        let cache = InMemoryCache::new(1000);
        let k = key("2024-06-01");
        let seen = cache.generation(&k).await.unwrap();
        // A mutation lands while the reader is still scanning.
        cache.invalidate(&k).await.unwrap();
        assert!(!cache.put(k, value(&k), seen, 5).await.unwrap());
        assert!(cache.get(&k, 6).await.unwrap().is_none());

        let fresh = cache.generation(&k).await.unwrap();
        assert_eq!(fresh, seen + 1);
        assert!(cache.put(k, value(&k), fresh, 7).await.unwrap());
        assert!(cache.get(&k, 8).await.unwrap().is_some());

        // Other keys keep their own generation.
        let other = key("2024-06-02");
        assert_eq!(cache.generation(&other).await.unwrap(), 0);
    }
}
