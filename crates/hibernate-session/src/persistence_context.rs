//! The persistence context: identity map and bookkeeping of one unit of work.
//!
//! The context guarantees that one [`EntityKey`] maps to at most one managed
//! instance and one [`CollectionKey`] to at most one collection wrapper. It
//! never loads anything itself; the session consults it first and registers
//! whatever a load produces.
//!
//! # Design
//!
//! Entities are stored as [`EntityRef`]s keyed by entity key. Their
//! [`EntityEntry`] records are keyed by instance identity, so
//! `get_entry(&instance)` is a pointer lookup, and a second instance carrying
//! the same key is rejected as an assertion failure. Proxies live in their own
//! map under the same key and are detached from the session when the context
//! is cleared.

use std::collections::{HashMap, HashSet};

use hibernate_core::{
    CollectionKey, EntityKey, EntityPersister, EntityUniqueKey, Error, Result, UsageErrorKind, Value,
};
use uuid::Uuid;

use crate::batch_fetch::BatchFetchQueue;
use crate::collection::{CollectionEntry, PersistentCollection};
use crate::entry::{EntityEntry, Status};
use crate::instance::{EntityHandle, EntityRef};
use crate::proxy::{EntityProxy, SessionLink};

/// Identity map and per-instance bookkeeping of a session.
#[derive(Debug)]
pub struct PersistenceContext {
    session: SessionLink,
    factory_id: Uuid,
    tenant_id: Option<String>,
    entities_by_key: HashMap<EntityKey, EntityRef>,
    entries: HashMap<usize, EntityEntry>,
    entities_by_unique_key: HashMap<EntityUniqueKey, EntityRef>,
    proxies_by_key: HashMap<EntityKey, EntityProxy>,
    collections_by_key: HashMap<CollectionKey, PersistentCollection>,
    collection_entries: HashMap<usize, (PersistentCollection, CollectionEntry)>,
    non_lazy_collections: Vec<PersistentCollection>,
    null_properties: HashSet<(EntityKey, String)>,
    nullifiable_entity_keys: HashSet<EntityKey>,
    inserted_keys: HashSet<EntityKey>,
    default_read_only: bool,
    cascade_level: usize,
    flushing: bool,
    load_counter: usize,
    batch_fetch_queue: BatchFetchQueue,
}

impl PersistenceContext {
    /// An empty context whose proxies bind to `session`.
    #[must_use]
    pub fn new(session: SessionLink, factory_id: Uuid) -> Self {
        Self {
            session,
            factory_id,
            tenant_id: None,
            entities_by_key: HashMap::new(),
            entries: HashMap::new(),
            entities_by_unique_key: HashMap::new(),
            proxies_by_key: HashMap::new(),
            collections_by_key: HashMap::new(),
            collection_entries: HashMap::new(),
            non_lazy_collections: Vec::new(),
            null_properties: HashSet::new(),
            nullifiable_entity_keys: HashSet::new(),
            inserted_keys: HashSet::new(),
            default_read_only: false,
            cascade_level: 0,
            flushing: false,
            load_counter: 0,
            batch_fetch_queue: BatchFetchQueue::new(),
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn session_link(&self) -> &SessionLink {
        &self.session
    }

    /// Entity key scoped to this context's tenant.
    pub fn entity_key(&self, entity_name: &str, identifier: &Value) -> EntityKey {
        EntityKey::new(entity_name, identifier).with_tenant(self.tenant_id.clone())
    }

    pub fn unique_key(&self, entity_name: &str, property: &str, value: &Value) -> EntityUniqueKey {
        EntityUniqueKey::new(entity_name, property, value, self.tenant_id.clone())
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Register a managed instance under `key`.
    ///
    /// Re-adding the same instance replaces its entry; a different instance
    /// under a bound key is an identity collision.
    pub fn add_entity(&mut self, key: EntityKey, entity: EntityRef, entry: EntityEntry) -> Result<()> {
        if let Some(existing) = self.entities_by_key.get(&key) {
            if !existing.ptr_eq(&entity) {
                return Err(Error::assertion(format!(
                    "a different instance is already associated with {}",
                    key
                )));
            }
        } else if let Some(other) = self.entries.get(&entity.identity()) {
            return Err(Error::assertion(format!(
                "instance is already managed as {}, cannot add it as {}",
                other.key(),
                key
            )));
        }
        tracing::trace!(entity = %key.entity_name(), id = ?key.identifier(), status = %entry.status(), "Add entity");
        self.nullifiable_entity_keys.remove(&key);
        self.entries.insert(entity.identity(), entry);
        self.entities_by_key.insert(key, entity);
        Ok(())
    }

    /// O(1) lookup; never loads.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entities_by_key.get(key).cloned()
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entities_by_key.contains_key(key)
    }

    pub fn contains_entity(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(&entity.identity())
    }

    pub fn is_entry_for(&self, entity: &EntityRef) -> bool {
        self.contains_entity(entity)
    }

    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(&entity.identity())
    }

    pub fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity.identity())
    }

    pub fn get_entry_by_key(&self, key: &EntityKey) -> Option<&EntityEntry> {
        let entity = self.entities_by_key.get(key)?;
        self.entries.get(&entity.identity())
    }

    pub fn set_entry_status(&mut self, entity: &EntityRef, status: Status) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&entity.identity())
            .ok_or_else(|| Error::assertion(format!("no entry for {:?}", entity)))?;
        entry.set_status(status)
    }

    /// Unregister the instance bound to `key` with its unique keys and the
    /// collections it owns.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let entity = self.entities_by_key.remove(key)?;
        self.entries.remove(&entity.identity());
        self.entities_by_unique_key.retain(|_, e| !e.ptr_eq(&entity));
        self.null_properties.retain(|(k, _)| k != key);
        self.batch_fetch_queue.remove_subselect(key);

        let owned: Vec<usize> = self
            .collection_entries
            .iter()
            .filter(|(_, (_, entry))| entry.owner() == key)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            if let Some((collection, entry)) = self.collection_entries.remove(&id) {
                let collection_key = CollectionKey::new(entry.role(), key.identifier());
                if self
                    .collections_by_key
                    .get(&collection_key)
                    .is_some_and(|c| c.ptr_eq(&collection))
                {
                    self.collections_by_key.remove(&collection_key);
                }
                self.batch_fetch_queue
                    .remove_batch_loadable_collection(&collection_key);
            }
        }
        tracing::trace!(entity = %key.entity_name(), id = ?key.identifier(), "Remove entity");
        Some(entity)
    }

    /// Managed instances with their keys, for iteration that mutates the context.
    pub fn managed_entities(&self) -> Vec<(EntityKey, EntityRef)> {
        self.entities_by_key
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities_by_key.len()
    }

    // ========================================================================
    // Unique keys
    // ========================================================================

    pub fn add_entity_by_unique_key(&mut self, key: EntityUniqueKey, entity: EntityRef) {
        self.entities_by_unique_key.insert(key, entity);
    }

    pub fn get_entity_by_unique_key(&self, key: &EntityUniqueKey) -> Option<EntityRef> {
        self.entities_by_unique_key.get(key).cloned()
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityProxy) {
        self.proxies_by_key.insert(key, proxy);
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<EntityProxy> {
        self.proxies_by_key.get(key).cloned()
    }

    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<EntityProxy> {
        self.proxies_by_key.remove(key)
    }

    pub fn contains_proxy(&self, proxy: &EntityProxy) -> bool {
        self.proxies_by_key.values().any(|p| p.ptr_eq(proxy))
    }

    /// The proxy registered for `key`, creating one bound to this session.
    pub fn proxy_for(&mut self, persister: &EntityPersister, key: &EntityKey) -> EntityProxy {
        if let Some(proxy) = self.proxies_by_key.get(key) {
            return proxy.clone();
        }
        let proxy = EntityProxy::new(self.factory_id, persister, key.identifier().clone());
        proxy.set_session(self.session.clone());
        proxy.set_read_only(self.default_read_only);
        self.proxies_by_key.insert(key.clone(), proxy.clone());
        proxy
    }

    /// Bind `proxy` to this session under its key.
    ///
    /// Fails if a different proxy is already registered for the key.
    pub fn reassociate_proxy(&mut self, proxy: &EntityProxy) -> Result<EntityKey> {
        let key = self.entity_key(&proxy.entity_name(), &proxy.identifier());
        if let Some(existing) = self.proxies_by_key.get(&key) {
            if !existing.ptr_eq(proxy) {
                return Err(Error::usage(
                    UsageErrorKind::NonUniqueObject,
                    format!("another proxy is already associated with {}", key),
                ));
            }
        }
        proxy.set_session(self.session.clone());
        self.proxies_by_key.insert(key.clone(), proxy.clone());
        Ok(key)
    }

    /// Reassociate `handle` if it is a proxy that still needs initializing.
    pub fn reassociate_if_uninitialized_proxy(&mut self, handle: &EntityHandle) -> Result<bool> {
        match handle {
            EntityHandle::Proxy(proxy) if !proxy.is_initialized() => {
                self.reassociate_proxy(proxy)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The concrete instance behind a handle, if available without loading.
    pub fn unproxy(&self, handle: &EntityHandle) -> Option<EntityRef> {
        match handle {
            EntityHandle::Entity(entity) => Some(entity.clone()),
            EntityHandle::Proxy(proxy) => proxy.target().or_else(|| {
                let key = self.entity_key(&proxy.entity_name(), &proxy.identifier());
                self.get_entity(&key)
            }),
        }
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Bind `collection` under `key`; a different wrapper under a bound key is
    /// an identity collision.
    pub fn add_collection(&mut self, key: CollectionKey, collection: PersistentCollection) -> Result<()> {
        if let Some(existing) = self.collections_by_key.get(&key) {
            if !existing.ptr_eq(&collection) {
                return Err(Error::assertion(format!(
                    "a different collection is already associated with {}",
                    key
                )));
            }
        }
        self.collections_by_key.insert(key, collection);
        Ok(())
    }

    pub fn get_collection(&self, key: &CollectionKey) -> Option<PersistentCollection> {
        self.collections_by_key.get(key).cloned()
    }

    /// Register a wrapper whose rows have not been read.
    pub fn add_uninitialized_collection(&mut self, collection: &PersistentCollection, owner: EntityKey) -> Result<()> {
        let role = collection.role();
        let key = CollectionKey::new(role.clone(), owner.identifier());
        self.add_collection(key, collection.clone())?;
        self.collection_entries.insert(
            collection.identity(),
            (collection.clone(), CollectionEntry::uninitialized(role, owner)),
        );
        Ok(())
    }

    /// Mark a registered wrapper initialized with the given elements' snapshot.
    pub fn add_initialized_collection(&mut self, collection: &PersistentCollection) -> Result<()> {
        let Some((_, entry)) = self.collection_entries.get_mut(&collection.identity()) else {
            return Err(Error::assertion(format!(
                "collection {} was not registered before initialization",
                collection.role()
            )));
        };
        let snapshot = crate::collection::snapshot_of(&collection.raw_elements());
        entry.post_initialize(snapshot);
        Ok(())
    }

    /// Register a wrapper created in memory for a persisted owner.
    pub fn add_new_collection(&mut self, collection: &PersistentCollection, owner: EntityKey) -> Result<()> {
        let role = collection.role();
        let key = CollectionKey::new(role.clone(), owner.identifier());
        self.add_collection(key, collection.clone())?;
        self.collection_entries.insert(
            collection.identity(),
            (collection.clone(), CollectionEntry::new_collection(role, owner)),
        );
        Ok(())
    }

    pub fn get_collection_entry(&self, collection: &PersistentCollection) -> Option<&CollectionEntry> {
        self.collection_entries
            .get(&collection.identity())
            .map(|(_, entry)| entry)
    }

    pub fn get_collection_entry_mut(&mut self, collection: &PersistentCollection) -> Option<&mut CollectionEntry> {
        self.collection_entries
            .get_mut(&collection.identity())
            .map(|(_, entry)| entry)
    }

    pub fn remove_collection(&mut self, collection: &PersistentCollection) {
        if let Some((_, entry)) = self.collection_entries.remove(&collection.identity()) {
            let key = CollectionKey::new(entry.role(), entry.owner().identifier());
            if self
                .collections_by_key
                .get(&key)
                .is_some_and(|c| c.ptr_eq(collection))
            {
                self.collections_by_key.remove(&key);
            }
        }
    }

    /// Release the key of a wrapper that was replaced on its owner, keeping
    /// its entry until the flush has removed its rows.
    pub(crate) fn dereference_collection(&mut self, collection: &PersistentCollection) {
        let Some((_, entry)) = self.collection_entries.get(&collection.identity()) else {
            return;
        };
        let key = CollectionKey::new(entry.role(), entry.owner().identifier());
        if self
            .collections_by_key
            .get(&key)
            .is_some_and(|c| c.ptr_eq(collection))
        {
            self.collections_by_key.remove(&key);
        }
    }

    /// Registered wrappers with their entries.
    pub fn collections(&self) -> Vec<(PersistentCollection, CollectionEntry)> {
        self.collection_entries.values().cloned().collect()
    }

    pub fn add_non_lazy_collection(&mut self, collection: PersistentCollection) {
        self.non_lazy_collections.push(collection);
    }

    pub fn take_non_lazy_collections(&mut self) -> Vec<PersistentCollection> {
        std::mem::take(&mut self.non_lazy_collections)
    }

    // ========================================================================
    // Absent associations and inserted keys
    // ========================================================================

    /// Record that `owner.property` has no associated row.
    pub fn add_null_property(&mut self, owner: EntityKey, property: &str) {
        self.null_properties.insert((owner, property.to_string()));
    }

    pub fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool {
        self.null_properties
            .contains(&(owner.clone(), property.to_string()))
    }

    /// Record a key a load proved absent from the database.
    pub fn add_nullifiable_key(&mut self, key: EntityKey) {
        self.nullifiable_entity_keys.insert(key);
    }

    pub fn is_nullifiable(&self, key: &EntityKey) -> bool {
        self.nullifiable_entity_keys.contains(key)
    }

    pub fn register_inserted_key(&mut self, key: EntityKey) {
        self.inserted_keys.insert(key);
    }

    pub fn was_inserted_during_transaction(&self, key: &EntityKey) -> bool {
        self.inserted_keys.contains(key)
    }

    /// Keys inserted since the last commit.
    pub fn inserted_keys(&self) -> Vec<EntityKey> {
        self.inserted_keys.iter().cloned().collect()
    }

    pub fn clear_inserted_keys(&mut self) {
        self.inserted_keys.clear();
    }

    // ========================================================================
    // Read-only state
    // ========================================================================

    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Change the read-only state of a managed entity or proxy.
    pub fn set_read_only(&mut self, handle: &EntityHandle, read_only: bool) -> Result<()> {
        if let EntityHandle::Proxy(proxy) = handle {
            proxy.set_read_only(read_only);
            if !proxy.is_initialized() {
                return Ok(());
            }
        }
        let entity = self.unproxy(handle).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::TransientObject,
                "cannot set read-only state of an unmanaged instance",
            )
        })?;
        let entry = self.get_entry_mut(&entity).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::TransientObject,
                "cannot set read-only state of an unmanaged instance",
            )
        })?;
        entry.set_read_only(read_only)?;
        let key = entry.key().clone();
        if let Some(proxy) = self.proxies_by_key.get(&key) {
            proxy.set_read_only(read_only);
        }
        Ok(())
    }

    pub fn is_read_only(&self, handle: &EntityHandle) -> Result<bool> {
        if let EntityHandle::Proxy(proxy) = handle {
            if !proxy.is_initialized() {
                return Ok(proxy.is_read_only());
            }
        }
        self.unproxy(handle)
            .and_then(|entity| self.get_entry(&entity).map(EntityEntry::is_read_only))
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::TransientObject,
                    "instance is not associated with this session",
                )
            })
    }

    /// Does any entry need dirty checking?
    pub fn has_non_read_only_entities(&self) -> bool {
        self.entries.values().any(|e| e.status() != Status::ReadOnly)
    }

    // ========================================================================
    // Flags
    // ========================================================================

    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    pub fn cascade_level(&self) -> usize {
        self.cascade_level
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    pub fn before_load(&mut self) {
        self.load_counter += 1;
    }

    pub fn after_load(&mut self) {
        self.load_counter = self.load_counter.saturating_sub(1);
    }

    /// No load is in progress.
    pub fn is_load_finished(&self) -> bool {
        self.load_counter == 0
    }

    pub fn batch_fetch_queue(&self) -> &BatchFetchQueue {
        &self.batch_fetch_queue
    }

    pub fn batch_fetch_queue_mut(&mut self) -> &mut BatchFetchQueue {
        &mut self.batch_fetch_queue
    }

    /// Forget everything and detach every proxy from the session.
    pub fn clear(&mut self) {
        for proxy in self.proxies_by_key.values() {
            proxy.unset_session();
        }
        self.reset();
        tracing::debug!("Persistence context cleared");
    }

    /// Forget everything when the session closes.
    ///
    /// Proxies keep their session link, so touching one afterwards reports
    /// a closed session rather than a missing one.
    pub fn close(&mut self) {
        self.reset();
        tracing::debug!("Persistence context closed");
    }

    fn reset(&mut self) {
        self.entities_by_key.clear();
        self.entries.clear();
        self.entities_by_unique_key.clear();
        self.proxies_by_key.clear();
        self.collections_by_key.clear();
        self.collection_entries.clear();
        self.non_lazy_collections.clear();
        self.null_properties.clear();
        self.nullifiable_entity_keys.clear();
        self.inserted_keys.clear();
        self.batch_fetch_queue.clear();
        self.cascade_level = 0;
        self.flushing = false;
        self.load_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LockMode;
    use crate::instance::EntityInstance;
    use crate::proxy::SessionLiveness;
    use hibernate_core::{CollectionKind, CollectionMapping, LazyInitializationErrorKind};
    use std::sync::Arc;

    fn persister() -> Arc<EntityPersister> {
        Arc::new(
            EntityPersister::builder("Team", "team")
                .identifier("id", "id")
                .basic("name", "name")
                .collection("heroes", CollectionMapping::one_to_many("Hero", &["team_id"]))
                .build()
                .unwrap(),
        )
    }

    fn context() -> (PersistenceContext, Arc<SessionLiveness>, Uuid) {
        let liveness = SessionLiveness::new();
        let session = Uuid::new_v4();
        let pc = PersistenceContext::new(SessionLink::new(session, &liveness), Uuid::new_v4());
        (pc, liveness, session)
    }

    fn managed(pc: &mut PersistenceContext, persister: &Arc<EntityPersister>, id: i64) -> (EntityKey, EntityRef) {
        let key = pc.entity_key("Team", &Value::BigInt(id));
        let entity = EntityRef::new(EntityInstance::new(persister).with_identifier(id));
        let entry = EntityEntry::new(
            Status::Managed,
            vec![Value::Null, Value::Null],
            key.clone(),
            Arc::clone(persister),
            None,
            LockMode::None,
            true,
        );
        pc.add_entity(key.clone(), entity.clone(), entry).unwrap();
        (key, entity)
    }

    #[test]
    fn test_identity_collision_is_assertion() {
        let persister = persister();
        let (mut pc, _liveness, _) = context();
        let (key, entity) = managed(&mut pc, &persister, 1);

        let entry = pc.get_entry(&entity).unwrap().clone();
        pc.add_entity(key.clone(), entity.clone(), entry.clone()).unwrap();

        let impostor = EntityRef::new(EntityInstance::new(&persister).with_identifier(1_i64));
        let err = pc.add_entity(key.clone(), impostor, entry).unwrap_err();
        assert!(err.is_fatal_to_session());
        assert!(pc.get_entity(&key).unwrap().ptr_eq(&entity));
        assert_eq!(pc.entity_count(), 1);
    }

    #[test]
    fn test_remove_entity_unregisters_owned_collections() {
        let persister = persister();
        let (mut pc, _liveness, _) = context();
        let (key, entity) = managed(&mut pc, &persister, 1);
        let heroes = PersistentCollection::uninitialized("Team.heroes", CollectionKind::Bag, key.clone());
        pc.add_uninitialized_collection(&heroes, key.clone()).unwrap();
        pc.add_entity_by_unique_key(pc.unique_key("Team", "name", &Value::from("x")), entity.clone());

        let collection_key = CollectionKey::new("Team.heroes", &Value::BigInt(1));
        assert!(pc.get_collection(&collection_key).is_some());
        assert!(pc.remove_entity(&key).unwrap().ptr_eq(&entity));
        assert!(pc.get_collection(&collection_key).is_none());
        assert!(pc.get_collection_entry(&heroes).is_none());
        assert!(pc.get_entry(&entity).is_none());
        assert!(pc
            .get_entity_by_unique_key(&pc.unique_key("Team", "name", &Value::from("x")))
            .is_none());
    }

    #[test]
    fn test_proxy_for_reuses_proxy() {
        let persister = persister();
        let (mut pc, _liveness, session) = context();
        let key = pc.entity_key("Team", &Value::BigInt(5));
        let a = pc.proxy_for(&persister, &key);
        let b = pc.proxy_for(&persister, &key);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.session_id(), Some(session));
        assert!(pc.contains_proxy(&a));
    }

    #[test]
    fn test_clear_detaches_proxies() {
        let persister = persister();
        let (mut pc, _liveness, session) = context();
        let key = pc.entity_key("Team", &Value::BigInt(5));
        let proxy = pc.proxy_for(&persister, &key);
        managed(&mut pc, &persister, 1);
        pc.before_load();
        pc.clear();
        assert_eq!(pc.entity_count(), 0);
        assert!(pc.is_load_finished());
        let err = proxy.check_session(session).unwrap_err();
        assert!(matches!(
            err,
            Error::LazyInitialization(ref e) if e.kind == LazyInitializationErrorKind::NoSession
        ));
    }

    #[test]
    fn test_read_only_round_trip() {
        let persister = persister();
        let (mut pc, _liveness, _) = context();
        let (_, entity) = managed(&mut pc, &persister, 1);
        let handle = EntityHandle::from(entity.clone());
        assert!(!pc.is_read_only(&handle).unwrap());
        assert!(pc.has_non_read_only_entities());
        pc.set_read_only(&handle, true).unwrap();
        assert!(pc.is_read_only(&handle).unwrap());
        assert!(!pc.has_non_read_only_entities());

        let stranger = EntityHandle::from(EntityRef::new(EntityInstance::new(&persister)));
        assert!(pc.set_read_only(&stranger, true).is_err());
    }

    #[test]
    fn test_null_properties_and_nullifiable_keys() {
        let (mut pc, _liveness, _) = context();
        let owner = pc.entity_key("Ed", &Value::BigInt(1));
        assert!(!pc.is_property_null(&owner, "ing"));
        pc.add_null_property(owner.clone(), "ing");
        assert!(pc.is_property_null(&owner, "ing"));

        pc.add_nullifiable_key(owner.clone());
        assert!(pc.is_nullifiable(&owner));
    }

    #[test]
    fn test_reassociate_rejects_second_proxy() {
        let persister = persister();
        let (mut pc, _liveness, _) = context();
        let key = pc.entity_key("Team", &Value::BigInt(5));
        pc.proxy_for(&persister, &key);
        let stray = EntityProxy::new(Uuid::new_v4(), &persister, Value::BigInt(5));
        let err = pc.reassociate_proxy(&stray).unwrap_err();
        assert!(matches!(err, Error::Usage(ref e) if e.kind == UsageErrorKind::NonUniqueObject));
    }
}
