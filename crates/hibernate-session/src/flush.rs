//! Flushing the persistence context to the database.
//!
//! A flush first finishes the object graph (persist-on-flush cascades, newly
//! assigned collection wrappers, orphan removal), then turns the action queue
//! and the dirty state of every managed instance and collection into a
//! [`FlushPlan`], runs it, and finally installs the flushed state as the new
//! snapshots. Statements run in the plan's fixed order: orphan removals,
//! inserts, updates, collection removals, collection updates, collection
//! recreations, deletes.
//!
//! When a statement fails, nothing after it runs and no snapshot changes;
//! the transaction should be rolled back.

use std::collections::HashSet;
use std::sync::Arc;

use hibernate_core::{
    CollectionKind, CollectionMapping, Connection, ElementMapping, EntityKey, EntityPersister,
    Error, Metamodel, PropertyKind, Result, UsageErrorKind, Value,
};

use crate::action_queue::{
    CollectionOp, FlushOrderer, FlushPlan, FlushResult, PendingOp, ScheduledDelete,
};
use crate::cascade::{Operation, Visited};
use crate::collection::{
    CollectionElement, CollectionEntry, PersistentCollection, SnapshotElement, snapshot_of,
};
use crate::entry::{EntityEntry, Status};
use crate::events::SessionEvent;
use crate::instance::{EntityHandle, EntityRef, PropertyValue};
use crate::load::identifier_params;
use crate::session::Session;

/// An entity row written by the flush, with the state to install afterwards.
struct FlushedEntity {
    key: EntityKey,
    entity: EntityRef,
    state: Vec<Value>,
    version: Option<Value>,
}

/// What the flush did with one registered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectionOutcome {
    Unchanged,
    Updated,
    /// The wrapper lost its owner or was replaced on it.
    Dereferenced,
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change to the database.
    ///
    /// Entities keep their identity across the flush; only snapshots,
    /// versions and statuses change.
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_connected()?;
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        self.pc.set_flushing(true);
        let result = self.flush_everything();
        self.pc.set_flushing(false);
        result?;
        self.stats.flushes += 1;
        self.event_callbacks.fire(SessionEvent::AfterFlush)?;
        Ok(())
    }

    fn flush_everything(&mut self) -> Result<()> {
        self.cascade_on_flush()?;
        self.register_replaced_collections()?;
        self.remove_orphans()?;

        let show_sql = self.factory.settings().show_sql;
        let (insertions, orphan_removals, deletions) = self.actions.scheduled();
        let mut plan = FlushPlan::new();
        let mut inserted = Vec::with_capacity(insertions.len());

        for (key, entity) in &insertions {
            let (op, flushed) = self.insert_op(key, entity)?;
            plan.inserts.push(op);
            inserted.push(flushed);
        }
        if self.factory.settings().order_inserts {
            plan.inserts = FlushOrderer::new().order_inserts(std::mem::take(&mut plan.inserts));
        }

        let mut collections = self.pc.collections();
        collections.sort_by_key(|(_, entry)| (entry.role().to_string(), entry.owner().to_string()));
        let mut outcomes = Vec::with_capacity(collections.len());
        let mut changed_owners = HashSet::new();
        for (collection, entry) in &collections {
            let outcome = self.plan_collection(collection, entry, &mut plan)?;
            if outcome == CollectionOutcome::Updated && !entry.is_new() {
                changed_owners.insert(entry.owner().clone());
            }
            outcomes.push(outcome);
        }

        let mut managed = self.pc.managed_entities();
        managed.sort_by_key(|(key, _)| key.to_string());
        let mut updated = Vec::new();
        for (key, entity) in &managed {
            let Some(entry) = self.pc.get_entry(entity) else {
                continue;
            };
            if entry.status() != Status::Managed {
                continue;
            }
            if let Some((op, flushed)) = self.update_op(key, entity, entry, changed_owners.contains(key))? {
                plan.updates.push(op);
                updated.push(flushed);
            }
        }

        for delete in orphan_removals.iter().filter(|d| d.exists_in_database) {
            plan.orphan_removals.push(delete_op(delete));
        }
        for delete in deletions.iter().filter(|d| d.exists_in_database) {
            plan.deletes.push(delete_op(delete));
        }

        let result = if plan.is_empty() {
            FlushResult::default()
        } else {
            plan.execute(&mut self.connection, show_sql)?
        };
        self.stats.entity_inserts += result.inserted as u64;
        self.stats.entity_updates += result.updated as u64;
        self.stats.entity_deletes += result.deleted as u64;
        self.stats.collection_statements += result.collection_rows as u64;

        self.post_flush(inserted, updated, orphan_removals.into_iter().chain(deletions), collections, outcomes)
    }

    /// Install the flushed state once every statement has succeeded.
    fn post_flush(
        &mut self,
        inserted: Vec<FlushedEntity>,
        updated: Vec<FlushedEntity>,
        deleted: impl Iterator<Item = ScheduledDelete>,
        collections: Vec<(PersistentCollection, CollectionEntry)>,
        outcomes: Vec<CollectionOutcome>,
    ) -> Result<()> {
        for flushed in &inserted {
            if let Some(entry) = self.pc.get_entry_mut(&flushed.entity) {
                entry.post_flush(flushed.state.clone(), flushed.version.clone())?;
            }
            self.pc.register_inserted_key(flushed.key.clone());
        }
        for flushed in &updated {
            if let Some(entry) = self.pc.get_entry_mut(&flushed.entity) {
                entry.post_flush(flushed.state.clone(), flushed.version.clone())?;
            }
            flushed.entity.write().set_version(flushed.version.clone());
            // Cached state is only rebuilt from a committed read.
            self.cache_evict(&flushed.key);
        }

        for delete in deleted {
            self.pc.set_entry_status(&delete.entity, Status::Gone)?;
            self.pc.remove_entity(&delete.key);
            if let Some(proxy) = self.pc.remove_proxy(&delete.key) {
                proxy.unset_session();
            }
            self.pc.batch_fetch_queue_mut().remove_batch_loadable_entity_key(&delete.key);
            self.cache_evict(&delete.key);
        }

        for ((collection, _), outcome) in collections.iter().zip(outcomes) {
            if outcome == CollectionOutcome::Dereferenced {
                self.pc.remove_collection(collection);
                continue;
            }
            if !collection.is_initialized() {
                continue;
            }
            let snapshot = snapshot_of(&collection.raw_elements());
            if let Some(entry) = self.pc.get_collection_entry_mut(collection) {
                entry.post_flush(Some(snapshot));
            }
            collection.clear_dirty();
        }

        for flushed in inserted.iter().chain(&updated) {
            for listener in self.listeners.clone() {
                if let Err(e) = listener.post_flush_entity(&flushed.entity) {
                    self.stats.callback_failures += 1;
                    tracing::warn!(entity = %flushed.key, error = %e, "Post-flush listener failed");
                }
            }
        }

        self.pc.batch_fetch_queue_mut().clear_subselects();
        self.actions.clear();
        tracing::debug!(
            inserted = inserted.len(),
            updated = updated.len(),
            managed = self.pc.entity_count(),
            "Flushed persistence context"
        );
        Ok(())
    }

    // ========================================================================
    // Completing the Graph
    // ========================================================================

    /// Persist transient instances reachable through persist cascades.
    fn cascade_on_flush(&mut self) -> Result<()> {
        let mut roots = self.pc.managed_entities();
        roots.sort_by_key(|(key, _)| key.to_string());
        let mut visited = Visited::new();
        for (_, entity) in roots {
            let cascades = self
                .pc
                .get_entry(&entity)
                .is_some_and(|entry| matches!(entry.status(), Status::Managed | Status::Saving));
            if cascades {
                visited.insert(entity.identity());
                self.persist_entity(&entity, Operation::PersistOnFlush, &mut visited)?;
            }
        }
        Ok(())
    }

    /// Register wrappers assigned to managed owners since the last flush.
    /// The wrappers they replaced stay registered until the flush removes
    /// their rows.
    fn register_replaced_collections(&mut self) -> Result<()> {
        for (key, entity) in self.pc.managed_entities() {
            let managed = self
                .pc
                .get_entry(&entity)
                .is_some_and(|entry| entry.status() == Status::Managed);
            if !managed {
                continue;
            }
            let persister = entity.persister();
            for index in persister.collection_indices() {
                let current = match entity.read().property(index) {
                    Some(PropertyValue::Collection(Some(collection))) => collection.clone(),
                    _ => continue,
                };
                if self.pc.get_collection_entry(&current).is_some() {
                    continue;
                }
                let Some(mapping) = persister.property(index).as_collection() else {
                    continue;
                };
                current.set_owner(&mapping.role, key.clone());
                self.replace_collection(&current, &key)?;
            }
        }
        Ok(())
    }

    /// Register `collection` as the new wrapper of its role on `owner`. The
    /// previous wrapper keeps its entry until the flush completes.
    fn replace_collection(&mut self, collection: &PersistentCollection, owner: &EntityKey) -> Result<()> {
        let role = collection.role();
        let previous = self
            .pc
            .collections()
            .into_iter()
            .find(|(_, entry)| entry.role() == role && entry.owner() == owner);
        if let Some((previous, _)) = previous {
            self.pc.dereference_collection(&previous);
        }
        self.pc.add_new_collection(collection, owner.clone())?;
        tracing::debug!(role = %role, owner = %owner, "Registered replaced collection");
        Ok(())
    }

    /// Schedule deletion of entities removed from orphan-removing
    /// associations.
    fn remove_orphans(&mut self) -> Result<()> {
        let tenant = self.config.tenant_id.clone();
        let mut orphans: Vec<EntityKey> = Vec::new();

        for (collection, entry) in self.pc.collections() {
            let (_, index, mapping) = self.factory.metamodel().collection(entry.role())?;
            if !(mapping.orphan_removal || mapping.cascade.delete_orphan) {
                continue;
            }
            let Some(owner) = self.pc.get_entity(entry.owner()) else {
                continue;
            };
            if self.is_removed(&owner) {
                continue;
            }
            let referenced = matches!(
                owner.read().property(index),
                Some(PropertyValue::Collection(Some(c))) if c.ptr_eq(&collection)
            );
            let current = if referenced {
                if !collection.is_initialized() {
                    continue;
                }
                snapshot_of(&collection.raw_elements())
            } else {
                Vec::new()
            };
            orphans.extend(
                entry
                    .orphans(&current)
                    .iter()
                    .filter_map(|orphan| orphan.entity_key(tenant.as_deref())),
            );
        }

        for (_, entity) in self.pc.managed_entities() {
            let Some(entry) = self.pc.get_entry(&entity) else {
                continue;
            };
            if entry.status() != Status::Managed || entry.loaded_state().is_empty() {
                continue;
            }
            let persister = Arc::clone(entry.persister());
            let loaded = entry.loaded_state().to_vec();
            for (index, property) in persister.properties().iter().enumerate() {
                let Some(mapping) = property.as_to_one() else {
                    continue;
                };
                if !property.orphan_removal() || mapping.is_inverse() {
                    continue;
                }
                let Some(previous) = loaded.get(index).filter(|v| !v.is_null()) else {
                    continue;
                };
                let current = match entity.read().property(index) {
                    Some(PropertyValue::ToOne(Some(handle))) => handle.identifier(),
                    _ => None,
                };
                if current.is_some_and(|id| id.same_identity(previous)) {
                    continue;
                }
                orphans.push(self.pc.entity_key(&mapping.target, previous));
            }
        }

        for key in orphans {
            let Some(orphan) = self.pc.get_entity(&key) else {
                continue;
            };
            if self.is_removed(&orphan) {
                continue;
            }
            tracing::debug!(entity = %key, "Deleting orphan");
            let mut visited = Visited::new();
            self.delete_entity(&orphan, true, &mut visited)?;
        }
        Ok(())
    }

    // ========================================================================
    // Entity Statements
    // ========================================================================

    fn insert_op(&self, key: &EntityKey, entity: &EntityRef) -> Result<(PendingOp, FlushedEntity)> {
        let persister = entity.persister();
        let state = self.current_state(entity)?;
        let version = entity.read().version().cloned();

        let mut columns = persister.identifier_columns().to_vec();
        let mut values = identifier_params(key.identifier());
        let mut depends_on = Vec::new();
        for (index, property) in persister.properties().iter().enumerate() {
            if !property.insertable || !writes_columns(&property.kind) {
                continue;
            }
            push_property(&mut columns, &mut values, property.columns(), &state[index]);
            if let (PropertyKind::ToOne(mapping), false) = (&property.kind, state[index].is_null()) {
                depends_on.push(self.pc.entity_key(&mapping.target, &state[index]));
            }
        }
        if let (Some(mapping), Some(version)) = (persister.version(), &version) {
            columns.push(mapping.column.clone());
            values.push(version.clone());
        }

        let op = PendingOp::Insert {
            key: key.clone(),
            table: persister.table().to_string(),
            columns,
            values,
            depends_on,
        };
        let flushed = FlushedEntity {
            key: key.clone(),
            entity: entity.clone(),
            state,
            version,
        };
        Ok((op, flushed))
    }

    /// The update for a managed instance, if anything about it changed.
    fn update_op(
        &self,
        key: &EntityKey,
        entity: &EntityRef,
        entry: &EntityEntry,
        collections_changed: bool,
    ) -> Result<Option<(PendingOp, FlushedEntity)>> {
        let persister = Arc::clone(entry.persister());
        if !persister.is_mutable() {
            return Ok(None);
        }
        let mut state = self.current_state(entity)?;
        let mut dirty = dirty_properties(&persister, entry.loaded_state(), &state);
        let forced = entry.requires_version_increment();
        let bump = persister.is_versioned() && (collections_changed || forced);
        if dirty.is_empty() && !bump {
            return Ok(None);
        }

        if !dirty.is_empty() {
            for listener in &self.listeners {
                listener.pre_update(entity)?;
            }
            state = self.current_state(entity)?;
            dirty = dirty_properties(&persister, entry.loaded_state(), &state);
        }

        let version = match (persister.version(), entry.version()) {
            (Some(_), Some(current)) => Some(current.next_version()?),
            (Some(_), None) => Some(Value::BigInt(1)),
            (None, _) => None,
        };

        let mut set_columns = Vec::new();
        let mut set_values = Vec::new();
        for (index, property) in persister.properties().iter().enumerate() {
            if !property.updatable || !writes_columns(&property.kind) {
                continue;
            }
            if persister.is_dynamic_update() && !dirty.contains(&index) {
                continue;
            }
            push_property(&mut set_columns, &mut set_values, property.columns(), &state[index]);
        }
        if let (Some(mapping), Some(version)) = (persister.version(), &version) {
            set_columns.push(mapping.column.clone());
            set_values.push(version.clone());
        }
        if set_columns.is_empty() {
            return Ok(None);
        }

        tracing::trace!(entity = %key, dirty = ?dirty, forced, collections_changed, "Scheduling update");
        let op = PendingOp::Update {
            key: key.clone(),
            table: persister.table().to_string(),
            set_columns,
            set_values,
            pk_columns: persister.identifier_columns().to_vec(),
            pk_values: identifier_params(key.identifier()),
            version_column: persister.version().map(|v| v.column.clone()),
            expected_version: persister.version().and(entry.version().cloned()),
        };
        let flushed = FlushedEntity {
            key: key.clone(),
            entity: entity.clone(),
            state,
            version,
        };
        Ok(Some((op, flushed)))
    }

    // ========================================================================
    // Collection Statements
    // ========================================================================

    fn plan_collection(
        &self,
        collection: &PersistentCollection,
        entry: &CollectionEntry,
        plan: &mut FlushPlan,
    ) -> Result<CollectionOutcome> {
        let metamodel = self.factory.metamodel();
        let (_, index, mapping) = metamodel.collection(entry.role())?;
        let owner_key = entry.owner();
        let owner_live = self
            .pc
            .get_entry_by_key(owner_key)
            .is_some_and(|owner| !owner.status().is_deleted_or_gone());
        let referenced = self.pc.get_entity(owner_key).is_some_and(|owner| {
            matches!(
                owner.read().property(index),
                Some(PropertyValue::Collection(Some(c))) if c.ptr_eq(collection)
            )
        });
        let writer = CollectionWriter::new(mapping, metamodel)?;
        let key_values = identifier_params(owner_key.identifier());

        if !owner_live || !referenced {
            if !mapping.inverse && !entry.is_new() {
                plan.collection_removals.push(writer.remove_all(&key_values));
            }
            return Ok(CollectionOutcome::Dereferenced);
        }
        if !collection.is_initialized() {
            return Ok(CollectionOutcome::Unchanged);
        }

        let current = collection.raw_elements();
        let current_snapshot = snapshot_of(&current);
        let snapshot = entry.snapshot().unwrap_or(&[]);
        let recreate = entry.is_new() || entry.dorecreate;
        if !recreate && !elements_changed(snapshot, &current_snapshot, mapping.kind) {
            return Ok(CollectionOutcome::Unchanged);
        }
        if mapping.inverse {
            return Ok(CollectionOutcome::Updated);
        }

        if recreate {
            if entry.doremove || !entry.is_new() {
                plan.collection_removals.push(writer.remove_all(&key_values));
            }
            for (position, element) in current.iter().enumerate() {
                if let Some(element) = self.element_values(element)? {
                    plan.collection_recreations.push(writer.link(&key_values, position, element));
                }
            }
            tracing::trace!(role = %entry.role(), owner = %owner_key, "Recreating collection");
            return Ok(CollectionOutcome::Updated);
        }

        let removed = snapshot
            .iter()
            .filter(|old| !current_snapshot.iter().any(|new| new.same_as(old)));
        if writer.one_to_many() {
            for old in removed {
                plan.collection_updates.push(writer.unlink(&key_values, snapshot_values(old)));
            }
            for (position, element) in current.iter().enumerate() {
                let added = element
                    .snapshot()
                    .is_none_or(|new| !snapshot.iter().any(|old| old.same_as(&new)));
                if !added && !mapping.kind.is_indexed() {
                    continue;
                }
                if let Some(element) = self.element_values(element)? {
                    plan.collection_updates.push(writer.link(&key_values, position, element));
                }
            }
        } else if mapping.kind == CollectionKind::Set {
            for old in removed {
                plan.collection_updates.push(writer.unlink(&key_values, snapshot_values(old)));
            }
            for element in &current {
                let added = element
                    .snapshot()
                    .is_none_or(|new| !snapshot.iter().any(|old| old.same_as(&new)));
                if !added {
                    continue;
                }
                if let Some(element) = self.element_values(element)? {
                    plan.collection_updates.push(writer.link(&key_values, 0, element));
                }
            }
        } else {
            // Bags and indexed collections have no stable row identity.
            plan.collection_updates.push(writer.remove_all(&key_values));
            for (position, element) in current.iter().enumerate() {
                if let Some(element) = self.element_values(element)? {
                    plan.collection_updates.push(writer.link(&key_values, position, element));
                }
            }
        }
        tracing::trace!(role = %entry.role(), owner = %owner_key, "Updating collection rows");
        Ok(CollectionOutcome::Updated)
    }

    /// Column values of an element, or `None` when its entity is being deleted.
    fn element_values(&self, element: &CollectionElement) -> Result<Option<Vec<Value>>> {
        match element {
            CollectionElement::Basic(value) => Ok(Some(vec![value.clone()])),
            CollectionElement::Entity(handle) => {
                let id = self.foreign_key(handle, "collection element")?;
                Ok((!id.is_null()).then(|| identifier_params(&id)))
            }
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Values of `entity` in loaded-state layout: basic values, foreign key
    /// identifiers for owning to-ones, and nulls for everything else.
    ///
    /// A reference to an entity without an identifier that this session
    /// does not manage is an error; references to deleted entities are null.
    pub(crate) fn current_state(&self, entity: &EntityRef) -> Result<Vec<Value>> {
        let persister = entity.persister();
        let instance = entity.read();
        let mut state = Vec::with_capacity(persister.properties().len());
        for (index, property) in persister.properties().iter().enumerate() {
            let value = match (&property.kind, instance.property(index)) {
                (PropertyKind::Basic { .. }, Some(PropertyValue::Basic(value))) => value.clone(),
                (PropertyKind::ToOne(mapping), Some(PropertyValue::ToOne(Some(handle)))) if !mapping.is_inverse() => {
                    self.foreign_key(handle, &property.name)?
                }
                _ => Value::Null,
            };
            state.push(value);
        }
        Ok(state)
    }

    /// Identifier a reference writes, `Null` when the target is being deleted.
    fn foreign_key(&self, handle: &EntityHandle, property: &str) -> Result<Value> {
        let id = match handle {
            EntityHandle::Proxy(proxy) => proxy.identifier(),
            EntityHandle::Entity(target) => match self.pc.get_entry(target) {
                Some(entry) if entry.status().is_deleted_or_gone() => return Ok(Value::Null),
                Some(entry) => entry.key().identifier().clone(),
                None => target.identifier().ok_or_else(|| {
                    Error::usage(
                        UsageErrorKind::TransientObject,
                        format!(
                            "object references an unsaved transient instance of {} through {}; persist it before flushing",
                            target.entity_name(),
                            property
                        ),
                    )
                })?,
            },
        };
        let key = self.pc.entity_key(&handle.entity_name(), &id);
        let deleted = self
            .pc
            .get_entry_by_key(&key)
            .is_some_and(|entry| entry.status().is_deleted_or_gone());
        if deleted || self.pc.is_nullifiable(&key) {
            return Ok(Value::Null);
        }
        Ok(id)
    }

    /// Whether a flush now would write anything.
    pub fn is_dirty(&self) -> Result<bool> {
        self.ensure_open()?;
        if !self.actions.is_empty() {
            return Ok(true);
        }
        for (_, entity) in self.pc.managed_entities() {
            let Some(entry) = self.pc.get_entry(&entity) else {
                continue;
            };
            if entry.status() != Status::Managed || !entry.persister().is_mutable() {
                continue;
            }
            if entry.requires_version_increment() {
                return Ok(true);
            }
            let state = self.current_state(&entity)?;
            if !dirty_properties(entry.persister(), entry.loaded_state(), &state).is_empty() {
                return Ok(true);
            }
            let persister = entity.persister();
            for index in persister.collection_indices() {
                if let Some(PropertyValue::Collection(Some(c))) = entity.read().property(index) {
                    if self.pc.get_collection_entry(c).is_none() {
                        return Ok(true);
                    }
                }
            }
        }
        for (collection, entry) in self.pc.collections() {
            if !collection.is_initialized() || (entry.is_new() && collection.raw_elements().is_empty()) {
                continue;
            }
            let kind = collection.kind();
            let current = snapshot_of(&collection.raw_elements());
            if entry.is_new() || elements_changed(entry.snapshot().unwrap_or(&[]), &current, kind) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Properties whose columns live on the entity's own table.
fn writes_columns(kind: &PropertyKind) -> bool {
    match kind {
        PropertyKind::Basic { .. } => true,
        PropertyKind::ToOne(mapping) => !mapping.is_inverse() && !mapping.columns.is_empty(),
        PropertyKind::Collection(_) => false,
    }
}

fn push_property(columns: &mut Vec<String>, values: &mut Vec<Value>, property_columns: &[String], value: &Value) {
    columns.extend(property_columns.iter().cloned());
    if value.is_null() {
        values.extend(std::iter::repeat_n(Value::Null, property_columns.len()));
    } else if property_columns.len() > 1 {
        values.extend(identifier_params(value));
    } else {
        values.push(value.clone());
    }
}

/// Indices of writable properties whose current value differs from the
/// snapshot. A snapshot of the wrong length marks them all.
fn dirty_properties(persister: &EntityPersister, loaded: &[Value], current: &[Value]) -> Vec<usize> {
    persister
        .properties()
        .iter()
        .enumerate()
        .filter(|(_, property)| writes_columns(&property.kind))
        .filter(|(index, _)| {
            loaded.len() != current.len() || !loaded[*index].same_identity(&current[*index])
        })
        .map(|(index, _)| index)
        .collect()
}

fn elements_changed(snapshot: &[SnapshotElement], current: &[SnapshotElement], kind: CollectionKind) -> bool {
    if snapshot.len() != current.len() {
        return true;
    }
    match kind {
        CollectionKind::Set => !current.iter().all(|new| snapshot.iter().any(|old| old.same_as(new))),
        _ => !snapshot.iter().zip(current).all(|(old, new)| old.same_as(new)),
    }
}

fn snapshot_values(element: &SnapshotElement) -> Vec<Value> {
    match element {
        SnapshotElement::Entity { identifier, .. } => identifier_params(identifier),
        SnapshotElement::Basic(value) => vec![value.clone()],
    }
}

fn delete_op(delete: &ScheduledDelete) -> PendingOp {
    let persister = delete.entity.persister();
    PendingOp::Delete {
        key: delete.key.clone(),
        table: persister.table().to_string(),
        pk_columns: persister.identifier_columns().to_vec(),
        pk_values: identifier_params(delete.key.identifier()),
        version_column: persister.version().map(|v| v.column.clone()),
        expected_version: persister.version().and(delete.version.clone()),
    }
}

/// Row statements for one collection mapping.
struct CollectionWriter<'a> {
    mapping: &'a CollectionMapping,
    /// Identifier columns of the element table, for one-to-many.
    child_columns: Option<&'a [String]>,
    element_columns: Vec<String>,
}

impl<'a> CollectionWriter<'a> {
    fn new(mapping: &'a CollectionMapping, metamodel: &'a Metamodel) -> Result<Self> {
        let (child_columns, element_columns) = match &mapping.element {
            ElementMapping::OneToMany { target } => {
                let target = metamodel.persister(target)?;
                (Some(target.identifier_columns()), Vec::new())
            }
            ElementMapping::ManyToMany { columns, .. } => (None, columns.clone()),
            ElementMapping::Basic { column } => (None, vec![column.clone()]),
        };
        Ok(Self {
            mapping,
            child_columns,
            element_columns,
        })
    }

    fn one_to_many(&self) -> bool {
        self.child_columns.is_some()
    }

    fn index_column(&self) -> Option<&String> {
        self.mapping
            .index_column
            .as_ref()
            .filter(|_| self.mapping.kind.is_indexed())
    }

    /// Remove every row (or detach every child) of one owner.
    fn remove_all(&self, key_values: &[Value]) -> CollectionOp {
        let table = self.mapping.table.clone();
        let key_columns = self.mapping.key_columns.clone();
        let key_values = key_values.to_vec();
        if self.one_to_many() {
            CollectionOp::DetachAll {
                table,
                key_columns,
                key_values,
            }
        } else {
            CollectionOp::RemoveRows {
                table,
                key_columns,
                key_values,
            }
        }
    }

    /// Write one element at `position`.
    fn link(&self, key_values: &[Value], position: usize, element: Vec<Value>) -> CollectionOp {
        let mut columns = self.mapping.key_columns.clone();
        let mut values = key_values.to_vec();
        if let Some(index) = self.index_column() {
            columns.push(index.clone());
            values.push(Value::BigInt(position as i64));
        }
        match self.child_columns {
            Some(child_columns) => CollectionOp::Attach {
                table: self.mapping.table.clone(),
                set_columns: columns,
                set_values: values,
                child_columns: child_columns.to_vec(),
                child_id: element,
            },
            None => {
                columns.extend(self.element_columns.iter().cloned());
                values.extend(element);
                CollectionOp::InsertRow {
                    table: self.mapping.table.clone(),
                    columns,
                    values,
                }
            }
        }
    }

    /// Remove one element.
    fn unlink(&self, key_values: &[Value], element: Vec<Value>) -> CollectionOp {
        match self.child_columns {
            Some(child_columns) => CollectionOp::Detach {
                table: self.mapping.table.clone(),
                key_columns: self.mapping.key_columns.clone(),
                key_values: key_values.to_vec(),
                child_columns: child_columns.to_vec(),
                child_id: element,
            },
            None => {
                let mut columns = self.mapping.key_columns.clone();
                columns.extend(self.element_columns.iter().cloned());
                let mut values = key_values.to_vec();
                values.extend(element);
                CollectionOp::DeleteRow {
                    table: self.mapping.table.clone(),
                    columns,
                    values,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SessionFactory;
    use crate::mock::MockConnection;
    use hibernate_core::{CascadeStyle, Settings, ToOneMapping};

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
                            .cascade(CascadeStyle::ALL)
                            .orphan_removal(true),
                    )
                    .collection(
                        "tags",
                        CollectionMapping::elements("team_tag", &["team_id"], "tag").kind(CollectionKind::Set),
                    )
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityPersister::builder("Hero", "hero")
                    .identifier("id", "id")
                    .version("version", "version")
                    .basic("name", "name")
                    .to_one("team", ToOneMapping::many_to_one("Team", &["team_id"]))
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

    fn team_with_hero<C: Connection>(session: &mut Session<C>) -> (EntityRef, EntityRef) {
        let team = session.instantiate("Team").unwrap();
        team.write().set_identifier(Some(Value::BigInt(1)));
        team.write().set("name", "Preventers").unwrap();
        let hero = session.instantiate("Hero").unwrap();
        hero.write().set_identifier(Some(Value::BigInt(10)));
        hero.write().set("name", "Deadpond").unwrap();
        hero.write().set_to_one("team", Some(team.clone().into())).unwrap();
        let heroes = session.new_collection("Team.heroes").unwrap();
        heroes.push(hero.clone()).unwrap();
        team.write().set_collection("heroes", Some(heroes)).unwrap();
        (team, hero)
    }

    #[test]
    fn test_flush_writes_inserts_with_foreign_keys() {
        let conn = MockConnection::new();
        let mut session = factory().open_session(conn.clone()).unwrap();
        let (team, hero) = team_with_hero(&mut session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        let statements = conn.statements();
        assert_eq!(statements[0], "insert into team (id, name) values (?, ?)");
        assert_eq!(
            statements[1],
            "insert into hero (id, name, team_id, version) values (?, ?, ?, ?)"
        );
        assert_eq!(
            conn.params(1),
            vec![
                Value::BigInt(10),
                Value::Text("Deadpond".into()),
                Value::BigInt(1),
                Value::BigInt(0),
            ]
        );
        let entry = session.persistence_context().get_entry(&hero).unwrap();
        assert_eq!(entry.status(), Status::Managed);
        assert!(entry.exists_in_database());
        assert!(session.action_queue().is_empty());
        assert!(!session.is_dirty().unwrap());
        assert_eq!(session.statistics().entity_inserts, 2);
    }

    #[test]
    fn test_dirty_entity_is_updated_with_version_check() {
        let conn = MockConnection::new();
        let mut session = factory().open_session(conn.clone()).unwrap();
        let (team, hero) = team_with_hero(&mut session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        hero.write().set("name", "Deadpond II").unwrap();
        assert!(session.is_dirty().unwrap());
        session.flush().unwrap();

        assert_eq!(
            conn.statements().last().unwrap(),
            "update hero set name=?, team_id=?, version=? where id=? and version=?"
        );
        assert_eq!(hero.read().version(), Some(&Value::BigInt(1)));
        assert_eq!(
            session.persistence_context().get_entry(&hero).unwrap().version(),
            Some(&Value::BigInt(1))
        );
        // A second flush finds nothing to write.
        let count = conn.statements().len();
        session.flush().unwrap();
        assert_eq!(conn.statements().len(), count);
    }

    #[test]
    fn test_zero_row_update_is_stale_state() {
        let conn = MockConnection::new();
        conn.on_execute("update hero", 0);
        let mut session = factory().open_session(conn).unwrap();
        let (team, hero) = team_with_hero(&mut session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        hero.write().set("name", "Changed elsewhere").unwrap();
        let err = session.flush().unwrap_err();
        assert!(err.is_stale_state());
        // The snapshot was not replaced.
        assert_eq!(
            session.persistence_context().get_entry(&hero).unwrap().version(),
            Some(&Value::BigInt(0))
        );
    }

    #[test]
    fn test_removed_child_is_deleted_as_orphan() {
        let conn = MockConnection::new();
        let mut session = factory().open_session(conn.clone()).unwrap();
        let (team, hero) = team_with_hero(&mut session);
        session.persist(&team).unwrap();
        session.flush().unwrap();

        let heroes = team.read().collection("heroes").unwrap().cloned().unwrap();
        heroes.clear().unwrap();
        session.flush().unwrap();

        assert_eq!(conn.count_matching("delete from hero where id=? and version=?"), 1);
        // The unversioned owner has no row change to write.
        assert_eq!(conn.count_matching("update team"), 0);
        assert!(!session.contains(&EntityHandle::Entity(hero)));
    }

    #[test]
    fn test_set_of_values_writes_only_the_difference() {
        let conn = MockConnection::new();
        let mut session = factory().open_session(conn.clone()).unwrap();
        let (team, _) = team_with_hero(&mut session);
        let tags = session.new_collection("Team.tags").unwrap();
        tags.push(Value::Text("blue".into())).unwrap();
        tags.push(Value::Text("red".into())).unwrap();
        team.write().set_collection("tags", Some(tags.clone())).unwrap();
        session.persist(&team).unwrap();
        session.flush().unwrap();
        assert_eq!(conn.count_matching("insert into team_tag"), 2);

        tags.remove(&CollectionElement::Basic(Value::Text("red".into()))).unwrap();
        tags.push(Value::Text("green".into())).unwrap();
        session.flush().unwrap();

        assert_eq!(conn.count_matching("delete from team_tag where team_id=? and tag=?"), 1);
        assert_eq!(conn.count_matching("insert into team_tag"), 3);
    }

    #[test]
    fn test_transient_reference_fails_flush() {
        let mut session = factory().open_session(MockConnection::new()).unwrap();
        let hero = session.instantiate("Hero").unwrap();
        hero.write().set_identifier(Some(Value::BigInt(10)));
        let team = session.instantiate("Team").unwrap();
        hero.write().set_to_one("team", Some(team.into())).unwrap();
        session.persist(&hero).unwrap();

        let err = session.flush().unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::TransientObject));
    }

    #[test]
    fn test_deleted_reference_is_nulled() {
        let conn = MockConnection::new();
        let mut session = factory().open_session(conn.clone()).unwrap();
        let team = session.instantiate("Team").unwrap();
        team.write().set_identifier(Some(Value::BigInt(1)));
        let hero = session.instantiate("Hero").unwrap();
        hero.write().set_identifier(Some(Value::BigInt(10)));
        hero.write().set_to_one("team", Some(team.clone().into())).unwrap();
        session.persist(&team).unwrap();
        session.persist(&hero).unwrap();
        session.flush().unwrap();

        session.delete(team).unwrap();
        session.flush().unwrap();
        let statements = conn.statements();
        let update = statements
            .iter()
            .position(|s| s.starts_with("update hero set"))
            .unwrap();
        let delete = statements
            .iter()
            .position(|s| s.starts_with("delete from team"))
            .unwrap();
        assert!(update < delete);
        assert_eq!(
            session.persistence_context().get_entry(&hero).unwrap().loaded_state()[1],
            Value::Null
        );
    }
}
