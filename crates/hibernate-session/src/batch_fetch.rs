//! Batch and subselect fetch bookkeeping.
//!
//! The [`BatchFetchQueue`] remembers keys of uninitialized proxies and
//! collections whose mapping allows batch loading. When one of them is
//! initialized, its queued siblings ride along in the same `in (...)` query.
//! Subselect fetching works per query instead of per key: every owner
//! returned by a query shares one [`SubselectFetch`], and the first
//! collection initialized loads the collections of all of them.

use std::collections::HashMap;
use std::sync::Arc;

use hibernate_core::{CollectionKey, EntityKey, Value};

/// The query that produced a set of owners, replayable as a subselect.
#[derive(Debug, Clone, PartialEq)]
pub struct SubselectFetch {
    sql: String,
    params: Vec<Value>,
    id_aliases: Vec<String>,
    result_keys: Vec<EntityKey>,
}

impl SubselectFetch {
    #[must_use]
    pub fn new(sql: String, params: Vec<Value>, id_aliases: Vec<String>, result_keys: Vec<EntityKey>) -> Self {
        Self {
            sql,
            params,
            id_aliases,
            result_keys,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters of the original query.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Result-set aliases of the owners' identifier columns.
    pub fn id_aliases(&self) -> &[String] {
        &self.id_aliases
    }

    pub fn result_keys(&self) -> &[EntityKey] {
        &self.result_keys
    }
}

/// Pending batch-loadable keys, per entity name and per collection role.
#[derive(Debug, Default)]
pub struct BatchFetchQueue {
    entity_keys: HashMap<String, Vec<EntityKey>>,
    collection_keys: HashMap<String, Vec<CollectionKey>>,
    subselects: HashMap<EntityKey, Arc<SubselectFetch>>,
}

impl BatchFetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_loadable_entity_key(&mut self, key: EntityKey) {
        let queue = self.entity_keys.entry(key.entity_name().to_string()).or_default();
        if !queue.contains(&key) {
            queue.push(key);
        }
    }

    pub fn remove_batch_loadable_entity_key(&mut self, key: &EntityKey) {
        if let Some(queue) = self.entity_keys.get_mut(key.entity_name()) {
            queue.retain(|k| k != key);
        }
    }

    /// `key` plus up to `batch_size - 1` other queued keys of the same entity.
    pub fn entity_batch(&self, key: &EntityKey, batch_size: usize) -> Vec<EntityKey> {
        let mut batch = vec![key.clone()];
        if let Some(queue) = self.entity_keys.get(key.entity_name()) {
            batch.extend(
                queue
                    .iter()
                    .filter(|k| *k != key)
                    .take(batch_size.saturating_sub(1))
                    .cloned(),
            );
        }
        batch
    }

    pub fn add_batch_loadable_collection(&mut self, key: CollectionKey) {
        let queue = self.collection_keys.entry(key.role().to_string()).or_default();
        if !queue.contains(&key) {
            queue.push(key);
        }
    }

    pub fn remove_batch_loadable_collection(&mut self, key: &CollectionKey) {
        if let Some(queue) = self.collection_keys.get_mut(key.role()) {
            queue.retain(|k| k != key);
        }
    }

    /// `key` plus up to `batch_size - 1` other queued collections of the role.
    pub fn collection_batch(&self, key: &CollectionKey, batch_size: usize) -> Vec<CollectionKey> {
        let mut batch = vec![key.clone()];
        if let Some(queue) = self.collection_keys.get(key.role()) {
            batch.extend(
                queue
                    .iter()
                    .filter(|k| *k != key)
                    .take(batch_size.saturating_sub(1))
                    .cloned(),
            );
        }
        batch
    }

    pub fn add_subselect(&mut self, owner: EntityKey, fetch: Arc<SubselectFetch>) {
        self.subselects.insert(owner, fetch);
    }

    pub fn subselect(&self, owner: &EntityKey) -> Option<Arc<SubselectFetch>> {
        self.subselects.get(owner).cloned()
    }

    pub fn remove_subselect(&mut self, owner: &EntityKey) {
        self.subselects.remove(owner);
    }

    /// Forget every subselect; flushing may have changed what the queries return.
    pub fn clear_subselects(&mut self) {
        self.subselects.clear();
    }

    pub fn clear(&mut self) {
        self.entity_keys.clear();
        self.collection_keys.clear();
        self.subselects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("Hero", &Value::BigInt(id))
    }

    #[test]
    fn test_entity_batch_puts_requested_key_first() {
        let mut queue = BatchFetchQueue::new();
        for id in 1..=5 {
            queue.add_batch_loadable_entity_key(key(id));
        }
        queue.add_batch_loadable_entity_key(key(2));
        queue.add_batch_loadable_entity_key(EntityKey::new("Team", &Value::BigInt(1)));

        let batch = queue.entity_batch(&key(3), 3);
        assert_eq!(batch, vec![key(3), key(1), key(2)]);

        queue.remove_batch_loadable_entity_key(&key(1));
        let batch = queue.entity_batch(&key(3), 10);
        assert_eq!(batch, vec![key(3), key(2), key(4), key(5)]);
    }

    #[test]
    fn test_collection_batch() {
        let mut queue = BatchFetchQueue::new();
        let c = |id: i64| CollectionKey::new("Team.heroes", &Value::BigInt(id));
        queue.add_batch_loadable_collection(c(1));
        queue.add_batch_loadable_collection(c(2));
        assert_eq!(queue.collection_batch(&c(2), 1), vec![c(2)]);
        assert_eq!(queue.collection_batch(&c(2), 5), vec![c(2), c(1)]);
    }

    #[test]
    fn test_subselects_shared_by_owners() {
        let mut queue = BatchFetchQueue::new();
        let fetch = Arc::new(SubselectFetch::new(
            "select t0_.id as id_0_ from team t0_ where 1=1".into(),
            Vec::new(),
            vec!["id_0_".into()],
            vec![key(1), key(2)],
        ));
        queue.add_subselect(key(1), Arc::clone(&fetch));
        queue.add_subselect(key(2), fetch);
        assert!(Arc::ptr_eq(
            &queue.subselect(&key(1)).unwrap(),
            &queue.subselect(&key(2)).unwrap()
        ));
        queue.clear_subselects();
        assert!(queue.subselect(&key(1)).is_none());
    }
}
