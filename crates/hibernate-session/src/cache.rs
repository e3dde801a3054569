//! Second-level entity cache.
//!
//! A [`CacheRegion`] stores the disassembled state of cacheable entities
//! across sessions of one factory. Entries hold the same values as an entity
//! entry's loaded state: basic values and foreign-key identifiers, never
//! instances. Assembly back into an instance goes through the normal
//! initialization path, so to-one references resolve to managed instances or
//! proxies of the reading session.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use hibernate_core::{EntityKey, Result, Value};
use serde::{Deserialize, Serialize};

/// Disassembled state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub entity_name: String,
    pub state: Vec<Value>,
    pub version: Option<Value>,
}

impl CacheEntry {
    pub fn new(entity_name: impl Into<String>, state: Vec<Value>, version: Option<Value>) -> Self {
        Self {
            entity_name: entity_name.into(),
            state,
            version,
        }
    }

    /// Whether this entry may replace `existing`.
    fn supersedes(&self, existing: &CacheEntry) -> bool {
        match (
            self.version.as_ref().and_then(Value::as_i64),
            existing.version.as_ref().and_then(Value::as_i64),
        ) {
            (Some(new), Some(old)) => new > old,
            _ => true,
        }
    }
}

/// A cache region shared by all sessions of a factory.
///
/// Errors returned by a region are treated as cache misses by the session.
pub trait CacheRegion: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn get(&self, key: &EntityKey) -> Result<Option<CacheEntry>>;

    /// Store `entry`; returns `false` when a newer version is already cached.
    fn put(&self, key: &EntityKey, entry: CacheEntry) -> Result<bool>;

    fn evict(&self, key: &EntityKey) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// Process-local region backed by a map.
#[derive(Default)]
pub struct InMemoryCacheRegion {
    name: String,
    entries: RwLock<HashMap<EntityKey, CacheEntry>>,
}

impl InMemoryCacheRegion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InMemoryCacheRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCacheRegion")
            .field("name", &self.name)
            .field("entries", &self.len())
            .finish()
    }
}

impl CacheRegion for InMemoryCacheRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &EntityKey) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &EntityKey, entry: CacheEntry) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(key) {
            if !entry.supersedes(existing) {
                return Ok(false);
            }
        }
        entries.insert(key.clone(), entry);
        Ok(true)
    }

    fn evict(&self, key: &EntityKey) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EntityKey {
        EntityKey::new("Hero", &Value::BigInt(1))
    }

    fn entry(version: i64, name: &str) -> CacheEntry {
        CacheEntry::new("Hero", vec![Value::from(name)], Some(Value::BigInt(version)))
    }

    #[test]
    fn test_put_refuses_older_versions() {
        let region = InMemoryCacheRegion::new("Hero");
        assert!(region.put(&key(), entry(1, "a")).unwrap());
        assert!(!region.put(&key(), entry(0, "old")).unwrap());
        assert!(!region.put(&key(), entry(1, "same")).unwrap());
        assert!(region.put(&key(), entry(2, "b")).unwrap());
        assert_eq!(region.get(&key()).unwrap().unwrap().state, vec![Value::from("b")]);
    }

    #[test]
    fn test_unversioned_entries_overwrite() {
        let region = InMemoryCacheRegion::new("Hero");
        let unversioned = |name: &str| CacheEntry::new("Hero", vec![Value::from(name)], None);
        region.put(&key(), unversioned("a")).unwrap();
        assert!(region.put(&key(), unversioned("b")).unwrap());
        region.evict(&key()).unwrap();
        assert!(region.get(&key()).unwrap().is_none());
        assert!(region.is_empty());
    }

    #[test]
    fn test_entry_json_shape() {
        let json = serde_json::to_value(entry(3, "x")).unwrap();
        assert_eq!(json["entityName"], "Hero");
        assert!(json.get("version").is_some());
    }
}
