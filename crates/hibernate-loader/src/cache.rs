//! Plan caching for generated load queries.
//!
//! Walking the mapping graph is repeated for every load of the same shape,
//! so plans are cached keyed by a hash of the shape (root, restriction and
//! enabled fetch profiles).

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use crate::plan::LoadPlan;

#[derive(Debug, Clone)]
struct CachedPlan {
    plan: Arc<LoadPlan>,
    last_used: Instant,
    hit_count: u64,
}

/// LRU-style cache for load plans.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
#[derive(Debug)]
pub struct PlanCache {
    cache: HashMap<u64, CachedPlan>,
    max_size: usize,
}

impl PlanCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
        }
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<LoadPlan>> {
        let entry = self.cache.get_mut(&key)?;
        entry.last_used = Instant::now();
        entry.hit_count += 1;
        Some(Arc::clone(&entry.plan))
    }

    pub fn insert(&mut self, key: u64, plan: Arc<LoadPlan>) {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            key,
            CachedPlan {
                plan,
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
    }

    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Hits served by the plans currently cached.
    pub fn total_hits(&self) -> u64 {
        self.cache.values().map(|entry| entry.hit_count).sum()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Compute a cache key from any hashable value.
pub fn plan_key(value: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
