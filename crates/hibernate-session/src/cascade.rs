//! Persistence operations and the cascades that carry them across associations.
//!
//! Save-type operations cascade to to-one targets before the entity itself
//! and to collection elements after it; delete runs the other way round, so
//! children are scheduled before their parent. Lock, refresh and evict
//! handle the entity first and then every cascaded association. Each
//! top-level call carries its own visited set, so cyclic graphs are walked
//! once per instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hibernate_core::{
    CascadeAction, CascadePoint, Cascadable, Connection, EntityKey, EntityPersister, Error,
    IdGenerator, Result, StaleStateError, UsageErrorKind, Value,
};

use crate::action_queue::ScheduledDelete;
use crate::collection::{CollectionElement, PersistentCollection};
use crate::entry::{EntityEntry, LockMode, Status};
use crate::instance::{EntityHandle, EntityInstance, EntityRef, PropertyValue};
use crate::load::identifier_params;
use crate::session::{ReplicationMode, Session};
use crate::stats::log_sql;

/// The operation a cascade propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Persist,
    PersistOnFlush,
    Delete,
    Lock(LockMode),
    Refresh,
    Replicate(ReplicationMode),
    Evict,
}

impl Operation {
    fn action(self) -> CascadeAction {
        match self {
            Operation::Persist => CascadeAction::Persist,
            Operation::PersistOnFlush => CascadeAction::PersistOnFlush,
            Operation::Delete => CascadeAction::Delete,
            Operation::Lock(_) => CascadeAction::Lock,
            Operation::Refresh => CascadeAction::Refresh,
            Operation::Replicate(_) => CascadeAction::Replicate,
            Operation::Evict => CascadeAction::Evict,
        }
    }
}

/// Instances already handled by the current operation.
pub(crate) type Visited = HashSet<usize>;

fn transient(entity: &EntityRef, operation: &str) -> Error {
    Error::usage(
        UsageErrorKind::TransientObject,
        format!("cannot {} a transient instance of {}", operation, entity.entity_name()),
    )
}

fn non_unique(key: &EntityKey) -> Error {
    Error::usage(
        UsageErrorKind::NonUniqueObject,
        format!("a different object with the same identifier is already associated with the session: {}", key),
    )
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Public Operations
    // ========================================================================

    /// Make a transient instance persistent.
    ///
    /// The identifier is generated (or checked, for assigned identifiers) now;
    /// the insert is written at the next flush. Persisting a managed instance
    /// only cascades, and persisting one scheduled for deletion cancels the
    /// deletion.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        visited.insert(entity.identity());
        self.persist_entity(entity, Operation::Persist, &mut visited)
    }

    /// Schedule deletion of an entity and of everything that cascades delete.
    ///
    /// A detached instance is resolved to this session's instance first;
    /// transient instances are ignored.
    #[tracing::instrument(level = "debug", skip(self, handle))]
    pub fn delete(&mut self, handle: impl Into<EntityHandle>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        self.cascade_to_handle(&handle.into(), Operation::Delete, &mut visited)
    }

    /// Reattach an instance with `mode`, verifying its version where the
    /// mode requires it.
    pub fn lock(&mut self, handle: impl Into<EntityHandle>, mode: LockMode) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        self.cascade_to_handle(&handle.into(), Operation::Lock(mode), &mut visited)
    }

    /// Re-read an instance's state from the database onto the same instance.
    pub fn refresh(&mut self, handle: impl Into<EntityHandle>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        self.cascade_to_handle(&handle.into(), Operation::Refresh, &mut visited)
    }

    /// Copy an instance into the database with its identifier and version.
    pub fn replicate(&mut self, entity: &EntityRef, mode: ReplicationMode) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        visited.insert(entity.identity());
        self.replicate_entity(entity, mode, &mut visited)
    }

    /// Remove an instance (or proxy) from the session without touching the
    /// database. Pending inserts and deletes for it are dropped.
    pub fn evict(&mut self, handle: impl Into<EntityHandle>) -> Result<()> {
        self.ensure_open()?;
        let mut visited = Visited::new();
        self.cascade_to_handle(&handle.into(), Operation::Evict, &mut visited)
    }

    /// Copy the state of `entity` onto the instance this session manages for
    /// the same row, loading it if needed, and return that instance.
    ///
    /// A transient instance is copied into a new instance that is persisted.
    /// A version that differs from the managed instance's is a stale-state
    /// error. Associations with merge cascading are merged recursively.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.ensure_open()?;
        let mut copies = HashMap::new();
        self.merge_entity(entity, &mut copies)
    }

    // ========================================================================
    // Cascade Traversal
    // ========================================================================

    /// Apply `op` to the entity behind `handle` unless it was already visited.
    pub(crate) fn cascade_to_handle(
        &mut self,
        handle: &EntityHandle,
        op: Operation,
        visited: &mut Visited,
    ) -> Result<()> {
        let entity = match handle {
            EntityHandle::Entity(entity) => entity.clone(),
            EntityHandle::Proxy(proxy) => match proxy.target() {
                Some(target) => target,
                None => match op {
                    Operation::Delete => self.initialize_proxy(proxy)?,
                    Operation::Evict => {
                        let key = self.pc.entity_key(&proxy.entity_name(), &proxy.identifier());
                        if let Some(removed) = self.pc.remove_proxy(&key) {
                            removed.unset_session();
                        }
                        return Ok(());
                    }
                    Operation::Lock(_) => {
                        self.pc.reassociate_if_uninitialized_proxy(handle)?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                },
            },
        };
        let first_visit = visited.insert(entity.identity());
        if !first_visit && self.pc.cascade_level() > 0 {
            return Ok(());
        }
        match op {
            Operation::Persist | Operation::PersistOnFlush => self.persist_entity(&entity, op, visited),
            Operation::Delete => self.delete_entity(&entity, false, visited),
            Operation::Lock(mode) => self.lock_entity(&entity, mode, visited),
            Operation::Refresh => self.refresh_entity(&entity, visited),
            Operation::Replicate(mode) => self.replicate_entity(&entity, mode, visited),
            Operation::Evict => self.evict_entity(&entity, visited),
        }
    }

    /// Associated instances that `action` reaches from `entity`, optionally
    /// restricted to one cascade point.
    ///
    /// Uninitialized collections are skipped unless the action initializes
    /// them; uninitialized proxies are returned as they are.
    fn cascade_targets(
        &mut self,
        entity: &EntityRef,
        action: CascadeAction,
        point: Option<CascadePoint>,
    ) -> Result<Vec<EntityHandle>> {
        let persister = entity.persister();
        let mut targets = Vec::new();
        for association in persister.cascaded_associations(action) {
            if point.is_some_and(|p| p != association.point) {
                continue;
            }
            let value = entity.read().property(association.index).cloned();
            match value {
                Some(PropertyValue::ToOne(Some(handle))) => targets.push(handle),
                Some(PropertyValue::Collection(Some(collection))) => {
                    if !collection.is_initialized() {
                        if !action.initializes_collections() || self.pc.get_collection_entry(&collection).is_none() {
                            continue;
                        }
                        self.initialize_collection(&collection)?;
                    }
                    targets.extend(collection.raw_elements().into_iter().filter_map(|element| match element {
                        CollectionElement::Entity(handle) => Some(handle),
                        CollectionElement::Basic(_) => None,
                    }));
                }
                _ => {}
            }
        }
        Ok(targets)
    }

    fn cascade(
        &mut self,
        entity: &EntityRef,
        op: Operation,
        point: Option<CascadePoint>,
        visited: &mut Visited,
    ) -> Result<()> {
        let targets = self.cascade_targets(entity, op.action(), point)?;
        self.cascade_to(&targets, op, visited)
    }

    fn cascade_to(&mut self, targets: &[EntityHandle], op: Operation, visited: &mut Visited) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let level = self.pc.increment_cascade_level();
        tracing::trace!(action = op.action().as_str(), targets = targets.len(), level, "Cascading");
        let mut result = Ok(());
        for target in targets {
            result = self.cascade_to_handle(target, op, visited);
            if result.is_err() {
                break;
            }
        }
        self.pc.decrement_cascade_level();
        result
    }

    // ========================================================================
    // Persist
    // ========================================================================

    pub(crate) fn persist_entity(&mut self, entity: &EntityRef, op: Operation, visited: &mut Visited) -> Result<()> {
        if let Some(entry) = self.pc.get_entry(entity) {
            let key = entry.key().clone();
            match entry.status() {
                Status::Deleted if op == Operation::Persist => {
                    self.pc.set_entry_status(entity, Status::Managed)?;
                    self.actions.remove(&key);
                    tracing::debug!(entity = %key, "Deletion cancelled by persist");
                }
                Status::Deleted | Status::Gone | Status::Loading => return Ok(()),
                _ => {}
            }
            self.cascade(entity, op, Some(CascadePoint::BeforeInsertAfterDelete), visited)?;
            return self.cascade(entity, op, Some(CascadePoint::AfterInsertBeforeDelete), visited);
        }

        let persister = entity.persister();
        self.cascade(entity, op, Some(CascadePoint::BeforeInsertAfterDelete), visited)?;

        self.ensure_connected()?;
        let current = entity.identifier();
        let id = self.factory.generators().generate(
            &mut self.connection,
            &persister,
            self.config.tenant_id.as_deref(),
            current.as_ref(),
            self.factory.settings().show_sql,
        )?;
        let key = self.pc.entity_key(persister.entity_name(), &id);
        if self.pc.contains_key(&key) {
            return Err(non_unique(&key));
        }
        entity.write().set_identifier(Some(id));
        for listener in self.listeners.clone() {
            listener.pre_persist(entity)?;
        }
        let version = persister.is_versioned().then(|| {
            entity
                .read()
                .version()
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::BigInt(0))
        });
        entity.write().set_version(version.clone());
        self.pc.add_entity(
            key.clone(),
            entity.clone(),
            EntityEntry::saving(key.clone(), Arc::clone(&persister), version),
        )?;
        self.actions.add_insert(key.clone(), entity.clone());
        self.wrap_collections(entity, &key)?;
        tracing::debug!(entity = %key, "Scheduled insert");

        self.cascade(entity, op, Some(CascadePoint::AfterInsertBeforeDelete), visited)
    }

    /// Register the collections of a newly persistent owner, replacing
    /// missing ones with empty wrappers.
    pub(crate) fn wrap_collections(&mut self, entity: &EntityRef, key: &EntityKey) -> Result<Vec<PersistentCollection>> {
        let persister = entity.persister();
        let mut wrapped = Vec::new();
        for index in persister.collection_indices() {
            let property = persister.property(index);
            let Some(mapping) = property.as_collection() else {
                continue;
            };
            let current = match entity.read().property(index) {
                Some(PropertyValue::Collection(collection)) => collection.clone(),
                _ => None,
            };
            let collection = match current {
                Some(collection) => {
                    if self.pc.get_collection_entry(&collection).is_some() {
                        return Err(Error::usage(
                            UsageErrorKind::NonUniqueObject,
                            format!("found shared references to a collection: {}", mapping.role),
                        ));
                    }
                    collection.set_owner(&mapping.role, key.clone());
                    collection
                }
                None => {
                    let collection = PersistentCollection::new(mapping.role.clone(), mapping.kind);
                    collection.set_owner(&mapping.role, key.clone());
                    entity
                        .write()
                        .set_property(index, PropertyValue::Collection(Some(collection.clone())))?;
                    collection
                }
            };
            self.pc.add_new_collection(&collection, key.clone())?;
            wrapped.push(collection);
        }
        Ok(wrapped)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Schedule `entity` for deletion; `orphan` routes the statement to the
    /// orphan-removal queue.
    pub(crate) fn delete_entity(&mut self, entity: &EntityRef, orphan: bool, visited: &mut Visited) -> Result<()> {
        let entity = match self.managed_instance_for(entity)? {
            Some(managed) => managed,
            None => return Ok(()),
        };
        visited.insert(entity.identity());
        let Some(entry) = self.pc.get_entry(&entity) else {
            return Ok(());
        };
        match entry.status() {
            Status::Deleted | Status::Gone => return Ok(()),
            Status::Loading => {
                return Err(Error::assertion(format!("cannot delete {} while it is loading", entry.key())));
            }
            _ => {}
        }
        let key = entry.key().clone();
        let version = entry.version().cloned();
        let saving = entry.status() == Status::Saving;
        let exists_in_database = entry.exists_in_database() && !saving;

        self.cascade(&entity, Operation::Delete, Some(CascadePoint::AfterInsertBeforeDelete), visited)?;

        for listener in self.listeners.clone() {
            listener.pre_remove(&entity)?;
        }
        if saving {
            self.actions.remove_insert(&key);
        }
        self.pc.set_entry_status(&entity, Status::Deleted)?;
        let delete = ScheduledDelete {
            key: key.clone(),
            entity: entity.clone(),
            version,
            exists_in_database,
        };
        if orphan {
            self.actions.add_orphan_removal(delete);
        } else {
            self.actions.add_delete(delete);
        }
        tracing::debug!(entity = %key, orphan, "Scheduled delete");

        self.cascade(&entity, Operation::Delete, Some(CascadePoint::BeforeInsertAfterDelete), visited)
    }

    /// This session's instance for `entity`: itself when managed, otherwise
    /// the instance managed (or loaded) under its identifier. `None` for a
    /// transient instance or a row that no longer exists.
    fn managed_instance_for(&mut self, entity: &EntityRef) -> Result<Option<EntityRef>> {
        if self.pc.contains_entity(entity) {
            return Ok(Some(entity.clone()));
        }
        let Some(id) = entity.identifier() else {
            return Ok(None);
        };
        let name = entity.entity_name();
        let key = self.pc.entity_key(&name, &id);
        if let Some(managed) = self.pc.get_entity(&key) {
            return Ok(Some(managed));
        }
        self.get(&name, id)
    }

    // ========================================================================
    // Lock
    // ========================================================================

    fn lock_entity(&mut self, entity: &EntityRef, mode: LockMode, visited: &mut Visited) -> Result<()> {
        let persister = entity.persister();
        if !self.pc.contains_entity(entity) {
            self.reattach(entity, &persister)?;
        }
        let entry = self
            .pc
            .get_entry(entity)
            .ok_or_else(|| Error::assertion("reattached instance has no entry"))?;
        if entry.status().is_deleted_or_gone() {
            return Err(Error::usage(
                UsageErrorKind::DeletedEntity,
                format!("cannot lock deleted instance {}", entry.key()),
            ));
        }
        let key = entry.key().clone();
        let expected = entry.version().cloned();
        let exists = entry.exists_in_database();

        let verifies = matches!(mode, LockMode::Read | LockMode::PessimisticWrite | LockMode::Write);
        if verifies && exists && persister.is_versioned() {
            let current = self.select_version(&persister, key.identifier())?;
            let matches = match (&current, &expected) {
                (Some(current), Some(expected)) => current.same_identity(expected),
                _ => false,
            };
            if !matches {
                tracing::warn!(entity = %key, expected = ?expected, found = ?current, "Version check failed");
                return Err(Error::StaleState(StaleStateError {
                    entity_name: key.entity_name().to_string(),
                    identifier: key.identifier().clone(),
                    version: expected,
                }));
            }
        }
        if let Some(entry) = self.pc.get_entry_mut(entity) {
            if mode == LockMode::OptimisticForceIncrement && persister.is_versioned() {
                entry.force_version_increment();
            }
            entry.upgrade_lock(mode);
        }
        tracing::debug!(entity = %key, mode = mode.as_str(), "Locked");
        self.cascade(entity, Operation::Lock(mode), None, visited)
    }

    /// Associate a detached instance with this session, taking its current
    /// state as the snapshot.
    fn reattach(&mut self, entity: &EntityRef, persister: &Arc<EntityPersister>) -> Result<EntityKey> {
        let id = entity.identifier().ok_or_else(|| transient(entity, "reattach"))?;
        let key = self.pc.entity_key(persister.entity_name(), &id);
        if self.pc.contains_key(&key) {
            return Err(non_unique(&key));
        }
        let state = self.current_state(entity)?;
        let version = entity.read().version().cloned();
        let status = if !persister.is_mutable() || self.pc.is_default_read_only() {
            Status::ReadOnly
        } else {
            Status::Managed
        };
        self.pc.add_entity(
            key.clone(),
            entity.clone(),
            EntityEntry::new(status, state, key.clone(), Arc::clone(persister), version, LockMode::None, true),
        )?;
        self.reattach_collections(entity, &key)?;
        tracing::debug!(entity = %key, "Reattached");
        Ok(key)
    }

    fn reattach_collections(&mut self, entity: &EntityRef, key: &EntityKey) -> Result<()> {
        let collections: Vec<PersistentCollection> = entity
            .read()
            .properties()
            .iter()
            .filter_map(|value| match value {
                PropertyValue::Collection(Some(collection)) => Some(collection.clone()),
                _ => None,
            })
            .collect();
        for collection in collections {
            if self.pc.get_collection_entry(&collection).is_some() {
                continue;
            }
            self.pc.add_uninitialized_collection(&collection, key.clone())?;
            if collection.is_initialized() {
                self.pc.add_initialized_collection(&collection)?;
            }
        }
        Ok(())
    }

    /// Version of the row with `identifier`, `Null` when unversioned, or
    /// `None` when there is no such row.
    fn select_version(&mut self, persister: &EntityPersister, identifier: &Value) -> Result<Option<Value>> {
        self.ensure_connected()?;
        let selected = persister
            .version()
            .map_or_else(|| persister.identifier_columns().join(", "), |v| v.column.clone());
        let condition = persister
            .identifier_columns()
            .iter()
            .map(|c| format!("{}=?", c))
            .collect::<Vec<_>>()
            .join(" and ");
        let sql = format!("select {} from {} where {}", selected, persister.table(), condition);
        let params = identifier_params(identifier);
        log_sql(self.factory.settings().show_sql, &sql, &params);
        self.stats.queries_executed += 1;
        let rows = self.connection.query_all(&sql, &params)?;
        Ok(rows.first().map(|row| {
            if persister.is_versioned() {
                row.get(0).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }))
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    fn refresh_entity(&mut self, entity: &EntityRef, visited: &mut Visited) -> Result<()> {
        let persister = entity.persister();
        let id = entity.identifier().ok_or_else(|| transient(entity, "refresh"))?;
        let key = self.pc.entity_key(persister.entity_name(), &id);
        let attached = match self.pc.get_entry(entity) {
            Some(entry) if entry.status().is_deleted_or_gone() => {
                return Err(Error::usage(
                    UsageErrorKind::DeletedEntity,
                    format!("cannot refresh deleted instance {}", key),
                ));
            }
            Some(_) => false,
            None => {
                if self.pc.contains_key(&key) {
                    return Err(non_unique(&key));
                }
                self.pc.add_entity(
                    key.clone(),
                    entity.clone(),
                    EntityEntry::loading(key.clone(), Arc::clone(&persister)),
                )?;
                true
            }
        };

        // Targets are captured first: the reload replaces the associations.
        let targets = self.cascade_targets(entity, CascadeAction::Refresh, None)?;

        let owned: Vec<PersistentCollection> = self
            .pc
            .collections()
            .into_iter()
            .filter(|(_, entry)| entry.owner() == &key)
            .map(|(collection, _)| collection)
            .collect();
        for collection in &owned {
            self.pc.remove_collection(collection);
        }
        self.cache_evict(&key);

        if let Err(e) = self.reload_into(entity, &key) {
            let still_loading = self
                .pc
                .get_entry(entity)
                .is_some_and(|entry| entry.status() == Status::Loading);
            if attached || still_loading {
                self.pc.remove_entity(&key);
            }
            return Err(e);
        }
        tracing::debug!(entity = %key, "Refreshed");
        self.cascade_to(&targets, Operation::Refresh, visited)
    }

    // ========================================================================
    // Replicate
    // ========================================================================

    fn replicate_entity(&mut self, entity: &EntityRef, mode: ReplicationMode, visited: &mut Visited) -> Result<()> {
        let persister = entity.persister();
        if self.pc.contains_entity(entity) {
            return self.cascade(entity, Operation::Replicate(mode), None, visited);
        }
        let id = entity.identifier().ok_or_else(|| {
            Error::usage(
                UsageErrorKind::IdentifierRequired,
                format!("cannot replicate an instance of {} without an identifier", persister.entity_name()),
            )
        })?;
        let key = self.pc.entity_key(persister.entity_name(), &id);
        if self.pc.contains_key(&key) {
            return Err(non_unique(&key));
        }
        let op = Operation::Replicate(mode);

        let Some(database_version) = self.select_version(&persister, &id)? else {
            self.cascade(entity, op, Some(CascadePoint::BeforeInsertAfterDelete), visited)?;
            let version = persister.is_versioned().then(|| {
                entity
                    .read()
                    .version()
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or(Value::BigInt(0))
            });
            entity.write().set_version(version.clone());
            self.pc.add_entity(
                key.clone(),
                entity.clone(),
                EntityEntry::saving(key.clone(), Arc::clone(&persister), version),
            )?;
            self.actions.add_insert(key.clone(), entity.clone());
            self.wrap_collections(entity, &key)?;
            tracing::debug!(entity = %key, "Replicating as insert");
            return self.cascade(entity, op, Some(CascadePoint::AfterInsertBeforeDelete), visited);
        };

        match mode {
            ReplicationMode::Exception => return Err(non_unique(&key)),
            ReplicationMode::Ignore => {
                tracing::debug!(entity = %key, "Replicate ignored existing row");
                return Ok(());
            }
            ReplicationMode::LatestVersion => {
                let replicated = entity.read().version().and_then(Value::as_i64);
                let newer = match (replicated, database_version.as_i64()) {
                    (Some(replicated), Some(existing)) => replicated > existing,
                    _ => true,
                };
                if !newer {
                    tracing::debug!(entity = %key, "Replicate kept newer database version");
                    return Ok(());
                }
            }
            ReplicationMode::Overwrite => {}
        }

        self.cascade(entity, op, Some(CascadePoint::BeforeInsertAfterDelete), visited)?;
        let version = (!database_version.is_null()).then_some(database_version);
        // An empty snapshot makes every column dirty at the next flush.
        self.pc.add_entity(
            key.clone(),
            entity.clone(),
            EntityEntry::new(
                Status::Managed,
                Vec::new(),
                key.clone(),
                Arc::clone(&persister),
                version,
                LockMode::None,
                true,
            ),
        )?;
        for collection in self.wrap_collections(entity, &key)? {
            if let Some(entry) = self.pc.get_collection_entry_mut(&collection) {
                entry.doremove = true;
                entry.dorecreate = true;
            }
        }
        tracing::debug!(entity = %key, "Replicating as overwrite");
        self.cascade(entity, op, Some(CascadePoint::AfterInsertBeforeDelete), visited)
    }

    // ========================================================================
    // Evict
    // ========================================================================

    fn evict_entity(&mut self, entity: &EntityRef, visited: &mut Visited) -> Result<()> {
        let Some(key) = self.pc.get_entry(entity).map(|entry| entry.key().clone()) else {
            return Ok(());
        };
        let targets = self.cascade_targets(entity, CascadeAction::Evict, None)?;
        self.pc.remove_entity(&key);
        if let Some(proxy) = self.pc.remove_proxy(&key) {
            proxy.unset_session();
        }
        self.actions.remove(&key);
        self.pc.batch_fetch_queue_mut().remove_batch_loadable_entity_key(&key);
        tracing::debug!(entity = %key, "Evicted");
        self.cascade_to(&targets, Operation::Evict, visited)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    fn merge_entity(&mut self, source: &EntityRef, copies: &mut HashMap<usize, EntityRef>) -> Result<EntityRef> {
        if let Some(copy) = copies.get(&source.identity()) {
            return Ok(copy.clone());
        }
        if let Some(entry) = self.pc.get_entry(source) {
            if entry.status().is_deleted_or_gone() {
                return Err(Error::usage(
                    UsageErrorKind::DeletedEntity,
                    format!("cannot merge deleted instance {}", entry.key()),
                ));
            }
            copies.insert(source.identity(), source.clone());
            self.copy_state(source, source, copies)?;
            return Ok(source.clone());
        }

        let persister = source.persister();
        let existing = match source.identifier() {
            Some(id) => {
                let key = self.pc.entity_key(persister.entity_name(), &id);
                match self.pc.get_entity(&key) {
                    Some(managed) if !self.is_removed(&managed) => Some(managed),
                    Some(_) => {
                        return Err(Error::usage(
                            UsageErrorKind::DeletedEntity,
                            format!("cannot merge onto deleted instance {}", key),
                        ));
                    }
                    None => self.get(persister.entity_name(), id)?,
                }
            }
            None => None,
        };

        match existing {
            Some(target) => {
                if persister.is_versioned() {
                    let source_version = source.read().version().cloned();
                    let target_version = target.read().version().cloned();
                    if let (Some(a), Some(b)) = (&source_version, &target_version) {
                        if !a.same_identity(b) {
                            return Err(Error::StaleState(StaleStateError {
                                entity_name: persister.entity_name().to_string(),
                                identifier: target.identifier().unwrap_or(Value::Null),
                                version: source_version,
                            }));
                        }
                    }
                }
                copies.insert(source.identity(), target.clone());
                self.copy_state(source, &target, copies)?;
                tracing::debug!(entity = %persister.entity_name(), id = ?target.identifier(), "Merged onto managed instance");
                Ok(target)
            }
            None => {
                let mut copy = EntityInstance::new(&persister);
                if persister.generator() == IdGenerator::Assigned {
                    copy.set_identifier(source.identifier());
                }
                let copy = EntityRef::new(copy);
                copies.insert(source.identity(), copy.clone());
                self.copy_state(source, &copy, copies)?;
                let mut visited = Visited::new();
                visited.insert(copy.identity());
                self.persist_entity(&copy, Operation::Persist, &mut visited)?;
                tracing::debug!(entity = %persister.entity_name(), id = ?copy.identifier(), "Merged transient instance as new");
                Ok(copy)
            }
        }
    }

    /// Copy every property of `source` onto `target`, merging or resolving
    /// associated instances into this session.
    fn copy_state(&mut self, source: &EntityRef, target: &EntityRef, copies: &mut HashMap<usize, EntityRef>) -> Result<()> {
        let persister = source.persister();
        let same = source.ptr_eq(target);
        let state = source.read().properties().to_vec();
        for (index, value) in state.into_iter().enumerate() {
            let property = persister.property(index);
            let cascades = property.cascade_style().does_cascade(CascadeAction::Merge);
            let merged = match value {
                PropertyValue::Basic(value) => {
                    if same {
                        continue;
                    }
                    PropertyValue::Basic(value)
                }
                PropertyValue::ToOne(None) => PropertyValue::ToOne(None),
                PropertyValue::ToOne(Some(handle)) => {
                    PropertyValue::ToOne(Some(self.merge_handle(&handle, cascades, copies)?))
                }
                PropertyValue::Collection(None) => {
                    if same {
                        continue;
                    }
                    PropertyValue::Collection(None)
                }
                PropertyValue::Collection(Some(collection)) => {
                    if !collection.is_initialized() {
                        continue;
                    }
                    let mut elements = Vec::new();
                    for element in collection.raw_elements() {
                        elements.push(match element {
                            CollectionElement::Entity(handle) => {
                                CollectionElement::Entity(self.merge_handle(&handle, cascades, copies)?)
                            }
                            basic @ CollectionElement::Basic(_) => basic,
                        });
                    }
                    let existing = match target.read().property(index) {
                        Some(PropertyValue::Collection(Some(existing))) => Some(existing.clone()),
                        _ => None,
                    };
                    match existing {
                        Some(existing) => {
                            if !existing.is_initialized() && self.pc.get_collection_entry(&existing).is_some() {
                                self.initialize_collection(&existing)?;
                            }
                            let current = existing.raw_elements();
                            let unchanged = current.len() == elements.len()
                                && current.iter().zip(&elements).all(|(a, b)| same_element(a, b));
                            if !unchanged {
                                existing.set_elements(elements)?;
                            }
                            continue;
                        }
                        None => PropertyValue::Collection(Some(PersistentCollection::with_elements(
                            collection.role(),
                            collection.kind(),
                            elements,
                        ))),
                    }
                }
            };
            target.write().set_property(index, merged)?;
        }
        if !same {
            let version = source.read().version().cloned();
            if self.pc.contains_entity(target) {
                // The managed version stays authoritative.
            } else {
                target.write().set_version(version);
            }
        }
        Ok(())
    }

    fn merge_handle(
        &mut self,
        handle: &EntityHandle,
        cascades: bool,
        copies: &mut HashMap<usize, EntityRef>,
    ) -> Result<EntityHandle> {
        let Some(entity) = handle.target() else {
            // An uninitialized proxy: use this session's reference to the row.
            let proxy = handle.as_proxy().ok_or_else(|| Error::assertion("handle without target"))?;
            return self.load(&proxy.entity_name(), proxy.identifier());
        };
        if cascades {
            return Ok(EntityHandle::Entity(self.merge_entity(&entity, copies)?));
        }
        if let Some(copy) = copies.get(&entity.identity()) {
            return Ok(EntityHandle::Entity(copy.clone()));
        }
        if self.pc.contains_entity(&entity) {
            return Ok(handle.clone());
        }
        match entity.identifier() {
            Some(id) => self.load(&entity.entity_name(), id),
            None => Ok(handle.clone()),
        }
    }
}

/// Same instance for entities (by pointer), equal value for basics.
fn same_element(a: &CollectionElement, b: &CollectionElement) -> bool {
    match (a, b) {
        (CollectionElement::Entity(a), CollectionElement::Entity(b)) => match (a.target(), b.target()) {
            (Some(a), Some(b)) => a.ptr_eq(&b),
            _ => a.same_entity(b),
        },
        _ => a.same_as(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SessionFactory;
    use crate::mock::MockConnection;
    use hibernate_core::{CascadeStyle, CollectionMapping, Metamodel, Settings, ToOneMapping};

    fn factory() -> Arc<SessionFactory> {
        let metamodel = Metamodel::builder()
            .entity(
                EntityPersister::builder("Team", "team")
                    .identifier("id", "id")
                    .basic("name", "name")
                    .collection(
                        "heroes",
                        CollectionMapping::one_to_many("Hero", &["team_id"])
                            .inverse(true)
                            .cascade(CascadeStyle::ALL),
                    )
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityPersister::builder("Hero", "hero")
                    .identifier("id", "id")
                    .version("version", "version")
                    .basic("name", "name")
                    .to_one(
                        "team",
                        ToOneMapping::many_to_one("Team", &["team_id"]).cascade(CascadeStyle::ALL),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        SessionFactory::builder(metamodel)
            .settings(Settings::default())
            .build()
            .unwrap()
    }

    /// A team with two heroes pointing back at it.
    fn graph<C: Connection>(session: &Session<C>) -> (EntityRef, Vec<EntityRef>) {
        let team = session.instantiate("Team").unwrap();
        team.write().set_identifier(Some(Value::BigInt(1)));
        team.write().set("name", "Preventers").unwrap();
        let mut heroes = Vec::new();
        for (id, name) in [(10_i64, "Deadpond"), (11, "Rusty-Man")] {
            let hero = session.instantiate("Hero").unwrap();
            hero.write().set_identifier(Some(Value::BigInt(id)));
            hero.write().set("name", name).unwrap();
            hero.write().set_to_one("team", Some(team.clone().into())).unwrap();
            heroes.push(hero);
        }
        let collection = session.new_collection("Team.heroes").unwrap();
        for hero in &heroes {
            collection.push(hero.clone()).unwrap();
        }
        team.write().set_collection("heroes", Some(collection)).unwrap();
        (team, heroes)
    }

    fn insert_order<C: Connection>(session: &Session<C>) -> Vec<String> {
        session
            .action_queue()
            .insertions()
            .iter()
            .map(|(key, _)| key.to_string())
            .collect()
    }

    #[test]
    fn test_persist_cascades_through_cycle_once() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();

        assert_eq!(
            insert_order(&session),
            vec![
                "EntityKey[Team#BigInt(1)]",
                "EntityKey[Hero#BigInt(10)]",
                "EntityKey[Hero#BigInt(11)]",
            ]
        );
        assert_eq!(heroes[0].read().version(), Some(&Value::BigInt(0)));
        let entry = session.persistence_context().get_entry(&team).unwrap();
        assert_eq!(entry.status(), Status::Saving);
        assert!(!entry.exists_in_database());
        assert_eq!(session.persistence_context().cascade_level(), 0);
    }

    #[test]
    fn test_persist_from_the_child_inserts_the_parent_first() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (_, heroes) = graph(&session);
        session.persist(&heroes[1]).unwrap();
        assert_eq!(
            insert_order(&session),
            vec![
                "EntityKey[Team#BigInt(1)]",
                "EntityKey[Hero#BigInt(10)]",
                "EntityKey[Hero#BigInt(11)]",
            ]
        );
    }

    #[test]
    fn test_assigned_identifier_is_required() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let team = session.instantiate("Team").unwrap();
        let err = session.persist(&team).unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::IdentifierRequired));
        assert_eq!(session.persistence_context().entity_count(), 0);
    }

    #[test]
    fn test_second_instance_with_same_identifier_is_rejected() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, _) = graph(&session);
        session.persist(&team).unwrap();
        let twin = session.instantiate("Team").unwrap();
        twin.write().set_identifier(Some(Value::BigInt(1)));
        let err = session.persist(&twin).unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::NonUniqueObject));
    }

    #[test]
    fn test_delete_before_flush_cancels_inserts() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();
        session.delete(team.clone()).unwrap();

        assert_eq!(session.action_queue().insert_count(), 0);
        let (_, _, deletions) = session.action_queue().scheduled();
        let order: Vec<String> = deletions.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "EntityKey[Hero#BigInt(10)]",
                "EntityKey[Hero#BigInt(11)]",
                "EntityKey[Team#BigInt(1)]",
            ]
        );
        assert!(deletions.iter().all(|d| !d.exists_in_database));
        assert_eq!(
            session.persistence_context().get_entry(&heroes[0]).unwrap().status(),
            Status::Deleted
        );
    }

    #[test]
    fn test_persist_cancels_scheduled_delete() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();
        session.flush().unwrap();
        session.delete(team.clone()).unwrap();
        assert_eq!(session.action_queue().delete_count(), 3);

        session.persist(&team).unwrap();
        let entry = session.persistence_context().get_entry(&team).unwrap();
        assert_eq!(entry.status(), Status::Managed);
        // The persist cascade reaches the deleted children as well.
        assert_eq!(session.action_queue().delete_count(), 0);
        assert_eq!(
            session.persistence_context().get_entry(&heroes[1]).unwrap().status(),
            Status::Managed
        );
    }

    #[test]
    fn test_evict_cascades_and_drops_actions() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();
        session.evict(team.clone()).unwrap();

        assert!(!session.contains(&EntityHandle::Entity(team)));
        assert!(!session.contains(&EntityHandle::Entity(heroes[0].clone())));
        assert!(session.action_queue().is_empty());
        assert_eq!(session.persistence_context().collections().len(), 0);
    }

    #[test]
    fn test_lock_read_detects_concurrent_version() {
        let conn = MockConnection::new();
        conn.on_query("select version from hero", &["version"], vec![vec![Value::BigInt(5)]]);
        let mut session = factory().open_session(conn).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        let err = session.lock(heroes[0].clone(), LockMode::Read).unwrap_err();
        assert!(err.is_stale_state());
    }

    #[test]
    fn test_lock_force_increment_marks_entry() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, heroes) = graph(&session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        session
            .lock(heroes[0].clone(), LockMode::OptimisticForceIncrement)
            .unwrap();
        let entry = session.persistence_context().get_entry(&heroes[0]).unwrap();
        assert!(entry.requires_version_increment());
        assert_eq!(entry.lock_mode(), LockMode::OptimisticForceIncrement);
    }

    #[test]
    fn test_merge_transient_persists_a_copy() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let (team, _) = graph(&session);
        let merged = session.merge(&team).unwrap();

        assert!(!merged.ptr_eq(&team));
        assert!(!session.contains(&EntityHandle::Entity(team)));
        assert!(session.contains(&EntityHandle::Entity(merged.clone())));
        let heroes = merged.read().collection("heroes").unwrap().cloned().unwrap();
        assert_eq!(heroes.len().unwrap(), 2);
        // Hero copies point back at the merged team, not the detached one.
        let first = heroes.entities().unwrap()[0].target().unwrap();
        let back = first.read().to_one("team").unwrap().cloned().unwrap();
        assert!(back.target().unwrap().ptr_eq(&merged));
        assert_eq!(session.action_queue().insert_count(), 3);
    }

    #[test]
    fn test_replicate_exception_on_existing_row() {
        let conn = MockConnection::new();
        conn.on_query("select id from team", &["id"], vec![vec![Value::BigInt(1)]]);
        let mut session = factory().open_session(conn).unwrap();
        let team = session.instantiate("Team").unwrap();
        team.write().set_identifier(Some(Value::BigInt(1)));

        let err = session.replicate(&team, ReplicationMode::Exception).unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::NonUniqueObject));
        session.replicate(&team, ReplicationMode::Ignore).unwrap();
        assert_eq!(session.persistence_context().entity_count(), 0);
        session.replicate(&team, ReplicationMode::Overwrite).unwrap();
        assert!(session.contains(&EntityHandle::Entity(team)));
    }
}
