//! Phase two of a load, and the session operations that run loads.

use std::collections::HashSet;
use std::sync::Arc;

use hibernate_core::{
    CollectionKey, CollectionMapping, Connection, EntityKey, EntityPersister, Error, FetchMode,
    LazyInitializationError, LazyInitializationErrorKind, ObjectNotFoundError, PropertyKind,
    PropertyMapping, Result, ToOneMapping, Value,
};
use hibernate_loader::{
    CollectionRestriction, Criteria, EntityRestriction, JoinWalker, LoadPlan, plan_key,
};

use super::context::{HydratedEntityRegistration, HydratedValue, LoadContext, PendingElement};
use super::reader::RowReader;
use super::{LoadOptions, LogicalRow, RowShape, identifier_params};
use crate::batch_fetch::SubselectFetch;
use crate::cache::CacheEntry;
use crate::collection::{CollectionElement, PersistentCollection};
use crate::entry::{EntityEntry, Status};
use crate::instance::{EntityHandle, EntityInstance, EntityRef, PropertyValue};
use crate::proxy::EntityProxy;
use crate::session::Session;
use crate::stats::log_sql;

/// What a finished load produced.
#[derive(Debug, Default)]
pub(crate) struct LoadOutcome {
    pub rows: Vec<LogicalRow>,
    /// Distinct root entity keys in result order.
    pub root_keys: Vec<EntityKey>,
}

pub(crate) fn not_found(key: &EntityKey) -> Error {
    Error::ObjectNotFound(ObjectNotFoundError {
        entity_name: key.entity_name().to_string(),
        identifier: key.identifier().clone(),
    })
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Loading by Identifier
    // ========================================================================

    /// The entity of `entity_name` with identifier `id`, or `None` when no
    /// such row exists.
    ///
    /// Looks in the persistence context, then the second-level cache, then
    /// the database. Deleted instances are reported as absent.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let id = id.into().normalized();
        let persister = Arc::clone(self.factory.metamodel().persister(entity_name)?);
        let key = self.pc.entity_key(entity_name, &id);
        if let Some(existing) = self.pc.get_entity(&key) {
            return Ok((!self.is_removed(&existing)).then_some(existing));
        }
        if self.pc.is_nullifiable(&key) {
            return Ok(None);
        }
        let proxy = self.pc.get_proxy(&key);
        if let Some(target) = proxy.as_ref().and_then(EntityProxy::target) {
            return Ok(Some(target));
        }
        let found = self.fetch_entity(&persister, &key)?;
        match (&found, proxy) {
            (Some(entity), Some(proxy)) => proxy.set_target(entity.clone()),
            (None, _) => self.pc.add_nullifiable_key(key),
            (Some(_), None) => {}
        }
        Ok(found)
    }

    /// A reference to the entity with identifier `id`.
    ///
    /// Lazy entities not yet in the session come back as an uninitialized
    /// proxy without touching the database; the first access through it
    /// fails with an object-not-found error if the row does not exist.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn load(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityHandle> {
        self.ensure_open()?;
        let id = id.into().normalized();
        let persister = Arc::clone(self.factory.metamodel().persister(entity_name)?);
        let key = self.pc.entity_key(entity_name, &id);
        if let Some(existing) = self.pc.get_entity(&key) {
            if self.is_removed(&existing) {
                return Err(not_found(&key));
            }
            return Ok(EntityHandle::Entity(existing));
        }
        if self.pc.is_nullifiable(&key) {
            return Err(not_found(&key));
        }
        if let Some(proxy) = self.pc.get_proxy(&key) {
            return Ok(EntityHandle::Proxy(proxy));
        }
        if persister.is_lazy() {
            return Ok(EntityHandle::Proxy(self.proxy_for(&persister, &key)));
        }
        self.get(entity_name, id)?
            .map(EntityHandle::Entity)
            .ok_or_else(|| not_found(&key))
    }

    /// The entity whose `property` equals `value`.
    pub fn get_by_unique_key(
        &mut self,
        entity_name: &str,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let value = value.into().normalized();
        self.factory
            .metamodel()
            .persister(entity_name)?
            .require_property(property)?;
        let key = self.pc.unique_key(entity_name, property, &value);
        if let Some(existing) = self.pc.get_entity_by_unique_key(&key) {
            if !self.is_removed(&existing) {
                return Ok(Some(existing));
            }
        }
        self.fetch_by_unique_key(entity_name, property, &value)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Root entities matching `criteria`, distinct by identity, in result order.
    pub fn list(&mut self, criteria: &Criteria) -> Result<Vec<EntityRef>> {
        let rows = self.list_with_shape(criteria, RowShape::Entity)?;
        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter_map(LogicalRow::into_entity)
            .filter(|entity| seen.insert(entity.identity()))
            .collect())
    }

    /// Every result row of `criteria`, assembled as `shape`.
    ///
    /// Rows are not de-duplicated: a joined collection repeats its owner.
    #[tracing::instrument(level = "debug", skip(self, criteria), fields(entity = criteria.entity_name()))]
    pub fn list_with_shape(&mut self, criteria: &Criteria, shape: RowShape) -> Result<Vec<LogicalRow>> {
        self.ensure_open()?;
        self.auto_flush()?;
        let plan = JoinWalker::new(self.factory.metamodel(), self.factory.settings(), &self.influencers)
            .criteria_plan(criteria)?;
        let options = LoadOptions::default()
            .read_only(criteria.is_read_only())
            .shape(shape);
        let outcome = self.execute_load(&plan, &[], options)?;
        self.register_subselect(&plan, outcome.root_keys)?;
        Ok(outcome.rows)
    }

    fn auto_flush(&mut self) -> Result<()> {
        if self.config.auto_flush && self.connection.in_transaction() && self.is_dirty()? {
            tracing::debug!(session = %self.id, "Auto-flushing before query");
            self.flush()?;
        }
        Ok(())
    }

    /// Remember the root query of a load so that subselect-fetched
    /// collections of its results can be initialized together.
    fn register_subselect(&mut self, plan: &LoadPlan, root_keys: Vec<EntityKey>) -> Result<()> {
        let Some(root) = plan.root_entity() else {
            return Ok(());
        };
        if root_keys.is_empty() {
            return Ok(());
        }
        let wants_subselect = self
            .factory
            .metamodel()
            .persister(&root.entity_name)?
            .properties()
            .iter()
            .filter_map(PropertyMapping::as_collection)
            .any(|mapping| mapping.fetch == FetchMode::Subselect);
        if !wants_subselect {
            return Ok(());
        }
        let fetch = Arc::new(SubselectFetch::new(
            plan.sql().to_string(),
            plan.bind(&[]),
            root.identifier_aliases.clone(),
            root_keys.clone(),
        ));
        for key in root_keys {
            self.pc
                .batch_fetch_queue_mut()
                .add_subselect(key, Arc::clone(&fetch));
        }
        Ok(())
    }

    // ========================================================================
    // Lazy Loading
    // ========================================================================

    /// Resolve `proxy` to its target, loading it (and queued siblings) if needed.
    pub fn initialize_proxy(&mut self, proxy: &EntityProxy) -> Result<EntityRef> {
        if let Some(target) = proxy.target() {
            return Ok(target);
        }
        proxy.check_session(self.id)?;
        let persister = Arc::clone(self.factory.metamodel().persister(&proxy.entity_name())?);
        let key = self.pc.entity_key(persister.entity_name(), &proxy.identifier());
        if let Some(existing) = self.pc.get_entity(&key) {
            if self.is_removed(&existing) {
                return Err(not_found(&key));
            }
            proxy.set_target(existing.clone());
            self.stats.proxies_initialized += 1;
            return Ok(existing);
        }
        if self.pc.is_nullifiable(&key) {
            return Err(not_found(&key));
        }
        if !proxy.begin_initialize()? {
            return proxy
                .target()
                .ok_or_else(|| Error::assertion(format!("initialized proxy {} has no target", key)));
        }
        match self.fetch_entity(&persister, &key) {
            Ok(Some(entity)) => {
                proxy.set_target(entity.clone());
                self.stats.proxies_initialized += 1;
                tracing::debug!(entity = %key, "Proxy initialized");
                Ok(entity)
            }
            Ok(None) => {
                proxy.abort_initialize();
                self.pc.add_nullifiable_key(key.clone());
                Err(not_found(&key))
            }
            Err(e) => {
                proxy.abort_initialize();
                Err(e)
            }
        }
    }

    /// Read the elements of a lazy collection owned by this session.
    ///
    /// Sibling collections are initialized in the same query when the
    /// collection is batch- or subselect-fetched.
    pub fn initialize_collection(&mut self, collection: &PersistentCollection) -> Result<()> {
        self.ensure_open()?;
        if collection.is_initialized() {
            return Ok(());
        }
        let role = collection.role();
        let Some(entry) = self.pc.get_collection_entry(collection) else {
            let owner = collection.owner_key();
            return Err(Error::LazyInitialization(LazyInitializationError {
                kind: LazyInitializationErrorKind::NoSession,
                entity_name: owner
                    .as_ref()
                    .map_or_else(String::new, |k| k.entity_name().to_string()),
                identifier: owner.map(|k| k.identifier().clone()),
                role: Some(role),
            }));
        };
        let owner = entry.owner().clone();
        let mapping = self.factory.metamodel().collection(&role)?.2.clone();
        let key = CollectionKey::new(role.clone(), owner.identifier());

        if mapping.fetch == FetchMode::Subselect {
            if let Some(subselect) = self.pc.batch_fetch_queue().subselect(&owner) {
                let mut keys = vec![key.clone()];
                keys.extend(
                    subselect
                        .result_keys()
                        .iter()
                        .map(|owner| CollectionKey::new(role.clone(), owner.identifier()))
                        .filter(|k| k != &key && self.is_uninitialized(k)),
                );
                let restriction = CollectionRestriction::Subselect {
                    sql: subselect.sql().to_string(),
                    id_aliases: subselect.id_aliases().to_vec(),
                };
                let plan = self.collection_plan(&role, &restriction, false)?;
                tracing::debug!(collection = %key, owners = keys.len(), "Subselect fetching collections");
                self.execute_load(
                    &plan,
                    subselect.params(),
                    LoadOptions::default().collection_keys(keys),
                )?;
                for owner in subselect.result_keys() {
                    self.pc.batch_fetch_queue_mut().remove_subselect(owner);
                }
                return Ok(());
            }
        }

        let batch_size = self.collection_batch_size(&mapping);
        let keys: Vec<CollectionKey> = if batch_size > 1 {
            self.pc
                .batch_fetch_queue()
                .collection_batch(&key, batch_size)
                .into_iter()
                .filter(|k| k == &key || self.is_uninitialized(k))
                .collect()
        } else {
            vec![key.clone()]
        };
        let plan = self.collection_plan(&role, &CollectionRestriction::Keys(keys.len()), true)?;
        let params: Vec<Value> = keys
            .iter()
            .flat_map(|k| identifier_params(k.owner_identifier()))
            .collect();
        tracing::debug!(collection = %key, batch = keys.len(), "Initializing collection");
        self.execute_load(&plan, &params, LoadOptions::default().collection_keys(keys))?;
        Ok(())
    }

    fn is_uninitialized(&self, key: &CollectionKey) -> bool {
        self.pc
            .get_collection(key)
            .is_some_and(|c| !c.is_initialized() && !c.is_loading())
    }

    /// Run the deferred initialization of eager collections once the
    /// outermost load has finished.
    fn initialize_non_lazy_collections(&mut self) -> Result<()> {
        loop {
            let pending = self.pc.take_non_lazy_collections();
            if pending.is_empty() {
                return Ok(());
            }
            for collection in pending {
                if !collection.is_initialized() && self.pc.get_collection_entry(&collection).is_some() {
                    self.initialize_collection(&collection)?;
                }
            }
        }
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Load one entity by key, batching queued siblings of the same entity.
    pub(crate) fn fetch_entity(
        &mut self,
        persister: &Arc<EntityPersister>,
        key: &EntityKey,
    ) -> Result<Option<EntityRef>> {
        if let Some(entity) = self.assemble_from_cache(persister, key)? {
            return Ok(Some(entity));
        }
        let batch_size = self.entity_batch_size(persister);
        let keys = if batch_size > 1 {
            self.pc.batch_fetch_queue().entity_batch(key, batch_size)
        } else {
            vec![key.clone()]
        };
        let restriction = match keys.len() {
            1 => EntityRestriction::Identifier,
            n => EntityRestriction::Identifiers(n),
        };
        let plan = self.entity_plan(persister.entity_name(), &restriction)?;
        let params: Vec<Value> = keys
            .iter()
            .flat_map(|k| identifier_params(k.identifier()))
            .collect();
        self.execute_load(&plan, &params, LoadOptions::default())?;
        for loaded in &keys {
            self.pc
                .batch_fetch_queue_mut()
                .remove_batch_loadable_entity_key(loaded);
        }
        Ok(self
            .pc
            .get_entity(key)
            .filter(|entity| !self.is_removed(entity)))
    }

    /// Load an entity by a unique property and remember it under that key.
    pub(crate) fn fetch_by_unique_key(
        &mut self,
        entity_name: &str,
        property: &str,
        value: &Value,
    ) -> Result<Option<EntityRef>> {
        let plan = self.entity_plan(entity_name, &EntityRestriction::UniqueKey(property.to_string()))?;
        let outcome = self.execute_load(&plan, &identifier_params(value), LoadOptions::default())?;
        let found = outcome.rows.into_iter().find_map(LogicalRow::into_entity);
        if let Some(entity) = &found {
            let key = self.pc.unique_key(entity_name, property, value);
            self.pc.add_entity_by_unique_key(key, entity.clone());
        }
        Ok(found)
    }

    /// Re-read the row of a managed (or reattached) instance into it.
    pub(crate) fn reload_into(&mut self, entity: &EntityRef, key: &EntityKey) -> Result<()> {
        let plan = self.entity_plan(key.entity_name(), &EntityRestriction::Identifier)?;
        let outcome = self.execute_load(
            &plan,
            &identifier_params(key.identifier()),
            LoadOptions::default().refresh(entity.clone()),
        )?;
        let reloaded = outcome
            .rows
            .into_iter()
            .filter_map(LogicalRow::into_entity)
            .any(|e| e.ptr_eq(entity));
        if reloaded { Ok(()) } else { Err(not_found(key)) }
    }

    fn entity_plan(&self, entity_name: &str, restriction: &EntityRestriction) -> Result<Arc<LoadPlan>> {
        let key = self
            .influencers
            .cache_key()
            .map(|influencers| plan_key(&("entity", entity_name, restriction, influencers)));
        self.factory.plan(key, || {
            JoinWalker::new(self.factory.metamodel(), self.factory.settings(), &self.influencers)
                .entity_plan(entity_name, restriction)
        })
    }

    fn collection_plan(
        &self,
        role: &str,
        restriction: &CollectionRestriction,
        cacheable: bool,
    ) -> Result<Arc<LoadPlan>> {
        let key = self
            .influencers
            .cache_key()
            .filter(|_| cacheable)
            .map(|influencers| plan_key(&("collection", role, restriction, influencers)));
        self.factory.plan(key, || {
            JoinWalker::new(self.factory.metamodel(), self.factory.settings(), &self.influencers)
                .collection_plan(role, restriction)
        })
    }

    pub(crate) fn entity_batch_size(&self, persister: &EntityPersister) -> usize {
        persister
            .batch_size()
            .unwrap_or(self.factory.settings().default_batch_fetch_size)
            .max(1)
    }

    fn collection_batch_size(&self, mapping: &CollectionMapping) -> usize {
        mapping
            .batch_size
            .unwrap_or(self.factory.settings().default_batch_fetch_size)
            .max(1)
    }

    /// The session's proxy for `key`, queued for batch fetching.
    fn proxy_for(&mut self, persister: &EntityPersister, key: &EntityKey) -> EntityProxy {
        let proxy = self.pc.proxy_for(persister, key);
        if self.entity_batch_size(persister) > 1 {
            self.pc
                .batch_fetch_queue_mut()
                .add_batch_loadable_entity_key(key.clone());
        }
        proxy
    }

    pub(crate) fn is_removed(&self, entity: &EntityRef) -> bool {
        self.pc
            .get_entry(entity)
            .is_some_and(|entry| entry.status().is_deleted_or_gone())
    }

    // ========================================================================
    // Second-Level Cache
    // ========================================================================

    /// Assemble an instance from its cached state, resolving associations
    /// the same way a database load does.
    fn assemble_from_cache(
        &mut self,
        persister: &Arc<EntityPersister>,
        key: &EntityKey,
    ) -> Result<Option<EntityRef>> {
        let Some(region) = self.factory.cache_region(persister.entity_name()).cloned() else {
            return Ok(None);
        };
        let cached = match region.get(key) {
            Ok(Some(entry)) if entry.state.len() == persister.properties().len() => entry,
            Ok(_) => {
                self.stats.cache_misses += 1;
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(entity = %key, region = region.name(), error = %e, "Cache read failed");
                self.stats.cache_misses += 1;
                return Ok(None);
            }
        };
        self.stats.cache_hits += 1;
        tracing::debug!(entity = %key, "Assembling from second-level cache");

        let hydrated_state = persister
            .properties()
            .iter()
            .zip(cached.state)
            .map(|(property, value)| match &property.kind {
                PropertyKind::Basic { .. } => HydratedValue::Basic(value),
                PropertyKind::ToOne(mapping) if mapping.is_inverse() => HydratedValue::InverseOneToOne,
                PropertyKind::ToOne(_) => HydratedValue::ForeignKey((!value.is_null()).then_some(value)),
                PropertyKind::Collection(_) => HydratedValue::Collection,
            })
            .collect();
        let instance = EntityRef::new(EntityInstance::new(persister).with_identifier(key.identifier().clone()));
        self.pc.add_entity(
            key.clone(),
            instance.clone(),
            EntityEntry::loading(key.clone(), Arc::clone(persister)),
        )?;
        let mut ctx = LoadContext::new(LoadOptions::default());
        ctx.register(HydratedEntityRegistration {
            reference: None,
            key: key.clone(),
            instance: instance.clone(),
            hydrated_state,
            version: cached.version,
            refresh: false,
        });
        self.drive_load(&mut ctx, None)?;
        Ok(Some(instance))
    }

    pub(crate) fn cache_put(&mut self, key: &EntityKey, entry: CacheEntry) {
        let Some(region) = self.factory.cache_region(key.entity_name()) else {
            return;
        };
        match region.put(key, entry) {
            Ok(true) => self.stats.cache_puts += 1,
            Ok(false) => tracing::trace!(entity = %key, "Newer version already cached"),
            Err(e) => tracing::warn!(entity = %key, error = %e, "Cache put failed"),
        }
    }

    pub(crate) fn cache_evict(&mut self, key: &EntityKey) {
        if let Some(region) = self.factory.cache_region(key.entity_name()) {
            if let Err(e) = region.evict(key) {
                tracing::warn!(entity = %key, error = %e, "Cache eviction failed");
            }
        }
    }

    // ========================================================================
    // Load Execution
    // ========================================================================

    /// Run `plan` with the caller's restriction `params` and both load phases.
    pub(crate) fn execute_load(
        &mut self,
        plan: &LoadPlan,
        params: &[Value],
        options: LoadOptions,
    ) -> Result<LoadOutcome> {
        self.ensure_open()?;
        self.ensure_connected()?;
        self.influencers.validate()?;
        let bound = plan.bind(params);
        let mut ctx = LoadContext::new(options);
        for key in ctx.options.collection_keys.clone() {
            if let Some(existing) = self.pc.get_collection(&key) {
                if !existing.is_initialized() && !existing.is_loading() {
                    ctx.add_loading(key, existing, false);
                }
            }
        }
        self.drive_load(&mut ctx, Some((plan, bound.as_slice())))?;
        Ok(LoadOutcome {
            rows: std::mem::take(&mut ctx.results),
            root_keys: std::mem::take(&mut ctx.root_keys),
        })
    }

    /// Read (when a plan is given) and finalize, unwinding on failure.
    fn drive_load(&mut self, ctx: &mut LoadContext, read: Option<(&LoadPlan, &[Value])>) -> Result<()> {
        self.pc.before_load();
        let mut result = match read {
            Some((plan, params)) => self.read_rows(plan, params, ctx),
            None => Ok(()),
        };
        if result.is_ok() {
            result = self.finalize_load(ctx);
        }
        if let Err(e) = result {
            self.abort_load(ctx);
            self.pc.after_load();
            return Err(e);
        }
        self.pc.after_load();
        if self.pc.is_load_finished() {
            self.initialize_non_lazy_collections()?;
        }
        Ok(())
    }

    fn read_rows(&mut self, plan: &LoadPlan, params: &[Value], ctx: &mut LoadContext) -> Result<()> {
        let reader = RowReader::new(plan, self.factory.metamodel())?;
        log_sql(self.factory.settings().show_sql, plan.sql(), params);
        self.stats.queries_executed += 1;
        let mut count = 0usize;
        let rows = self.connection.query(plan.sql(), params)?;
        for row in rows {
            reader.read_row(&mut self.pc, ctx, &row?)?;
            count += 1;
        }
        tracing::debug!(
            rows = count,
            entities = ctx.registrations.len(),
            collections = ctx.loading.len(),
            "Result set read"
        );
        Ok(())
    }

    /// Initialize every registered entity exactly once, then publish the
    /// loading collections and run post-load callbacks.
    fn finalize_load(&mut self, ctx: &mut LoadContext) -> Result<()> {
        let order = ctx.finish_order();
        let arrays = order
            .iter()
            .take_while(|&&i| ctx.loading[i].collection.kind().is_array())
            .count();
        for &index in &order[..arrays] {
            self.finish_collection(ctx, index)?;
        }
        for index in 0..ctx.registrations.len() {
            self.initialize_entity(ctx, index)?;
        }
        for &index in &order[arrays..] {
            self.finish_collection(ctx, index)?;
        }
        for (key, entry) in std::mem::take(&mut ctx.cache_puts) {
            self.cache_put(&key, entry);
        }
        self.run_post_load(ctx);
        Ok(())
    }

    fn initialize_entity(&mut self, ctx: &mut LoadContext, index: usize) -> Result<()> {
        let HydratedEntityRegistration {
            reference,
            key,
            instance,
            hydrated_state,
            version,
            refresh,
        } = ctx.registrations[index].clone();
        let persister = instance.persister();
        let loaded_state: Vec<Value> = hydrated_state.iter().map(HydratedValue::loaded_value).collect();

        for listener in self.listeners.clone() {
            if let Err(e) = listener.pre_load(key.entity_name(), key.identifier(), &loaded_state) {
                tracing::warn!(entity = %key, error = %e, "Pre-load listener failed");
                ctx.callback_failures += 1;
            }
        }

        let mut values = Vec::with_capacity(hydrated_state.len());
        for (i, hydrated) in hydrated_state.into_iter().enumerate() {
            let property = persister.property(i);
            let value = match (&property.kind, hydrated) {
                (PropertyKind::Basic { .. }, HydratedValue::Basic(value)) => PropertyValue::Basic(value),
                (PropertyKind::ToOne(mapping), HydratedValue::Joined { target, .. }) => {
                    if target.is_none() && mapping.is_inverse() {
                        self.pc.add_null_property(key.clone(), &property.name);
                    }
                    PropertyValue::ToOne(target.map(EntityHandle::Entity))
                }
                (PropertyKind::ToOne(mapping), HydratedValue::ForeignKey(foreign_key)) => {
                    PropertyValue::ToOne(self.resolve_to_one(mapping, foreign_key.as_ref())?)
                }
                (PropertyKind::ToOne(mapping), HydratedValue::InverseOneToOne) => {
                    PropertyValue::ToOne(self.resolve_inverse_one_to_one(&key, &property.name, mapping)?)
                }
                (PropertyKind::Collection(mapping), HydratedValue::Collection) => {
                    PropertyValue::Collection(Some(self.resolve_collection(ctx, &key, mapping)?))
                }
                _ => {
                    return Err(Error::mapping(
                        Some(persister.entity_name()),
                        Some(&property.name),
                        "hydrated state does not match the property kind",
                    ));
                }
            };
            values.push(value);
        }

        {
            let mut target = instance.write();
            for (i, value) in values.into_iter().enumerate() {
                target.set_property(i, value)?;
            }
            target.set_version(version.clone());
        }

        let read_only = if refresh {
            self.pc.get_entry(&instance).is_some_and(EntityEntry::is_read_only)
        } else {
            !persister.is_mutable()
                || ctx
                    .options
                    .read_only
                    .unwrap_or_else(|| self.pc.is_default_read_only())
        };
        self.pc
            .get_entry_mut(&instance)
            .ok_or_else(|| Error::assertion(format!("no entry for loading instance {}", key)))?
            .post_load(loaded_state.clone(), version.clone(), read_only)?;
        self.pc.batch_fetch_queue_mut().remove_batch_loadable_entity_key(&key);
        self.stats.entities_loaded += 1;
        if reference.is_some() && self.factory.cache_region(key.entity_name()).is_some() {
            ctx.cache_puts
                .push((key.clone(), CacheEntry::new(key.entity_name(), loaded_state, version)));
        }
        tracing::trace!(entity = %key, read_only, "Initialized entity");
        Ok(())
    }

    /// Owning to-one known by foreign key: the managed instance, a proxy, or
    /// an immediate nested load for eager targets.
    fn resolve_to_one(&mut self, mapping: &ToOneMapping, foreign_key: Option<&Value>) -> Result<Option<EntityHandle>> {
        let Some(id) = foreign_key else {
            return Ok(None);
        };
        let target = Arc::clone(self.factory.metamodel().persister(&mapping.target)?);
        let key = self.pc.entity_key(&mapping.target, id);
        if let Some(existing) = self.pc.get_entity(&key) {
            return Ok((!self.is_removed(&existing)).then_some(EntityHandle::Entity(existing)));
        }
        if self.pc.is_nullifiable(&key) {
            return Ok(None);
        }
        if let Some(proxy) = self.pc.get_proxy(&key) {
            return Ok(Some(EntityHandle::Proxy(proxy)));
        }
        if !mapping.is_eager() && target.is_lazy() {
            return Ok(Some(EntityHandle::Proxy(self.proxy_for(&target, &key))));
        }
        match self.fetch_entity(&target, &key)? {
            Some(entity) => Ok(Some(EntityHandle::Entity(entity))),
            None => {
                self.pc.add_nullifiable_key(key);
                Ok(None)
            }
        }
    }

    /// Inverse one-to-one: the target whose `mapped_by` property points back
    /// at `owner`, or `None` once proven absent.
    fn resolve_inverse_one_to_one(
        &mut self,
        owner: &EntityKey,
        property: &str,
        mapping: &ToOneMapping,
    ) -> Result<Option<EntityHandle>> {
        let mapped_by = mapping.mapped_by.as_deref().ok_or_else(|| {
            Error::mapping(Some(owner.entity_name()), Some(property), "inverse one-to-one without mapped-by")
        })?;
        let unique = self.pc.unique_key(&mapping.target, mapped_by, owner.identifier());
        if let Some(existing) = self.pc.get_entity_by_unique_key(&unique) {
            return Ok(Some(EntityHandle::Entity(existing)));
        }
        if self.pc.is_property_null(owner, property) {
            return Ok(None);
        }
        match self.fetch_by_unique_key(&mapping.target, mapped_by, owner.identifier())? {
            Some(entity) => Ok(Some(EntityHandle::Entity(entity))),
            None => {
                self.pc.add_null_property(owner.clone(), property);
                Ok(None)
            }
        }
    }

    fn resolve_collection(
        &mut self,
        ctx: &LoadContext,
        owner: &EntityKey,
        mapping: &CollectionMapping,
    ) -> Result<PersistentCollection> {
        let key = CollectionKey::new(mapping.role.clone(), owner.identifier());
        if let Some(loading) = ctx.loading_collection(&key) {
            return Ok(loading);
        }
        if let Some(existing) = self.pc.get_collection(&key) {
            return Ok(existing);
        }
        let collection = PersistentCollection::uninitialized(&mapping.role, mapping.kind, owner.clone());
        self.pc.add_uninitialized_collection(&collection, owner.clone())?;
        if mapping.is_eager() {
            self.pc.add_non_lazy_collection(collection.clone());
        } else if self.collection_batch_size(mapping) > 1 {
            self.pc.batch_fetch_queue_mut().add_batch_loadable_collection(key);
        }
        Ok(collection)
    }

    fn resolve_element(&mut self, key: &EntityKey) -> Result<Option<EntityHandle>> {
        if let Some(existing) = self.pc.get_entity(key) {
            return Ok((!self.is_removed(&existing)).then_some(EntityHandle::Entity(existing)));
        }
        if self.pc.is_nullifiable(key) {
            return Ok(None);
        }
        if let Some(proxy) = self.pc.get_proxy(key) {
            return Ok(Some(EntityHandle::Proxy(proxy)));
        }
        let persister = Arc::clone(self.factory.metamodel().persister(key.entity_name())?);
        Ok(Some(EntityHandle::Proxy(self.proxy_for(&persister, key))))
    }

    fn finish_collection(&mut self, ctx: &mut LoadContext, index: usize) -> Result<()> {
        let elements = std::mem::take(&mut ctx.loading[index].elements);
        let collection = ctx.loading[index].collection.clone();
        let key = ctx.loading[index].key.clone();
        for (position, pending) in elements {
            let element = match pending {
                PendingElement::Ready(element) => element,
                PendingElement::Key(element_key) => match self.resolve_element(&element_key)? {
                    Some(handle) => CollectionElement::Entity(handle),
                    None => continue,
                },
            };
            collection.read_element(position, element);
        }
        collection.end_read();
        self.pc.add_initialized_collection(&collection)?;
        self.pc.batch_fetch_queue_mut().remove_batch_loadable_collection(&key);
        ctx.loading[index].finished = true;
        self.stats.collections_loaded += 1;
        tracing::trace!(collection = %key, "Initialized collection");
        Ok(())
    }

    /// Post-load listeners and after-load actions; failures are counted, not
    /// propagated.
    fn run_post_load(&mut self, ctx: &mut LoadContext) {
        let mut failures = ctx.callback_failures;
        if !self.listeners.is_empty() || !self.after_load_actions.is_empty() {
            for registration in &ctx.registrations {
                let persister = registration.instance.persister();
                for listener in &self.listeners {
                    if let Err(e) = listener.post_load(&registration.instance) {
                        tracing::warn!(entity = %registration.key, error = %e, "Post-load listener failed");
                        failures += 1;
                    }
                }
                for action in &self.after_load_actions {
                    if let Err(e) = action.after_load(&registration.instance, &persister) {
                        tracing::warn!(entity = %registration.key, error = %e, "After-load action failed");
                        failures += 1;
                    }
                }
            }
        }
        ctx.callback_failures = 0;
        self.stats.callback_failures += failures;
    }

    /// Undo what an unfinished load registered: instances still `LOADING`
    /// and collections it created leave the context, and no collection stays
    /// half-read.
    fn abort_load(&mut self, ctx: &mut LoadContext) {
        let mut removed = 0usize;
        for registration in &ctx.registrations {
            let loading = self
                .pc
                .get_entry(&registration.instance)
                .is_some_and(|e| e.status() == Status::Loading);
            if loading {
                self.pc.remove_entity(&registration.key);
                removed += 1;
            }
        }
        for loading in ctx.loading.iter().filter(|l| !l.finished) {
            loading.collection.abort_read();
            if loading.created {
                self.pc.remove_collection(&loading.collection);
            }
        }
        ctx.cache_puts.clear();
        tracing::warn!(
            entities = removed,
            collections = ctx.loading.iter().filter(|l| !l.finished).count(),
            "Load aborted"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::collection::PersistentCollection;
    use crate::factory::SessionFactory;
    use crate::mock::MockConnection;
    use hibernate_core::{
        CollectionKind, CollectionMapping, EntityKey, EntityPersister, Error, Metamodel, Settings,
        ToOneMapping, Value,
    };
    use hibernate_loader::{Criteria, JoinWalker, LoadQueryInfluencers, LoadPlan};
    use std::sync::Arc;

    fn factory(settings: Settings) -> Arc<SessionFactory> {
        let metamodel = Metamodel::builder()
            .entity(
                EntityPersister::builder("Team", "team")
                    .identifier("id", "id")
                    .basic("name", "name")
                    .collection(
                        "heroes",
                        CollectionMapping::one_to_many("Hero", &["team_id"]).inverse(true),
                    )
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityPersister::builder("Hero", "hero")
                    .identifier("id", "id")
                    .basic("name", "name")
                    .to_one("team", ToOneMapping::many_to_one("Team", &["team_id"]))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        SessionFactory::builder(metamodel).settings(settings).build().unwrap()
    }

    /// Result columns of a criteria plan: identifier, then properties.
    fn hero_columns(factory: &SessionFactory) -> (LoadPlan, Vec<String>) {
        let influencers = LoadQueryInfluencers::new();
        let criteria = Criteria::new("Hero");
        let plan = JoinWalker::new(factory.metamodel(), factory.settings(), &influencers)
            .criteria_plan(&criteria)
            .unwrap();
        let root = &plan.entity_references()[0];
        let mut columns = root.identifier_aliases.clone();
        columns.extend(root.property_aliases[0].iter().cloned());
        columns.extend(root.property_aliases[1].iter().cloned());
        (plan, columns)
    }

    #[test]
    fn test_list_returns_distinct_managed_instances() {
        let factory = factory(Settings::default());
        let (_, columns) = hero_columns(&factory);
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let conn = MockConnection::new();
        conn.on_query(
            "from hero",
            &columns,
            vec![
                vec![Value::BigInt(1), Value::Text("Deadpond".into()), Value::BigInt(7)],
                vec![Value::BigInt(1), Value::Text("Deadpond".into()), Value::BigInt(7)],
                vec![Value::BigInt(2), Value::Text("Rusty-Man".into()), Value::Null],
            ],
        );
        let mut session = factory.open_session(conn).unwrap();
        let heroes = session.list(&Criteria::new("Hero")).unwrap();
        assert_eq!(heroes.len(), 2);

        let again = session.get("Hero", 1_i64).unwrap().unwrap();
        assert!(again.ptr_eq(&heroes[0]));
        // The lazy team is a proxy that has not been fetched.
        let team = heroes[0].read().to_one("team").unwrap().cloned().unwrap();
        assert!(team.is_proxy());
        assert!(heroes[1].read().to_one("team").unwrap().is_none());
        assert_eq!(session.statistics().entities_loaded, 2);
    }

    #[test]
    fn test_cursor_failure_unwinds_loading_instances() {
        let factory = factory(Settings::default());
        let (_, columns) = hero_columns(&factory);
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let conn = MockConnection::new();
        conn.on_query(
            "from hero",
            &columns,
            vec![
                vec![Value::BigInt(1), Value::Text("Deadpond".into()), Value::Null],
                vec![Value::BigInt(2), Value::Text("Rusty-Man".into()), Value::Null],
            ],
        );
        conn.fail_after("from hero", 1);
        let mut session = factory.open_session(conn).unwrap();
        let err = session.list(&Criteria::new("Hero")).unwrap_err();
        assert!(matches!(err, Error::DataAccess(_)));
        assert_eq!(session.persistence_context().entity_count(), 0);
        assert_eq!(session.statistics().entities_loaded, 0);
    }

    #[test]
    fn test_missing_row_is_remembered() {
        let factory = factory(Settings::default());
        let conn = MockConnection::new();
        let mut session = factory.open_session(conn.clone()).unwrap();
        assert!(session.get("Hero", 5_i64).unwrap().is_none());
        assert!(session.get("Hero", 5_i64).unwrap().is_none());
        assert_eq!(conn.count_matching("from hero"), 1);

        let proxy = session.load("Team", 9_i64).unwrap();
        let err = session.initialize_proxy(proxy.as_proxy().unwrap()).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(ref e) if e.entity_name == "Team"));
    }

    #[test]
    fn test_unregistered_collection_cannot_initialize() {
        let factory = factory(Settings::default());
        let mut session = factory.open_session(MockConnection::new()).unwrap();
        let collection = PersistentCollection::uninitialized(
            "Team.heroes",
            CollectionKind::Bag,
            EntityKey::new("Team", &Value::BigInt(1)),
        );
        let err = session.initialize_collection(&collection).unwrap_err();
        assert!(err.is_lazy_initialization());
    }
}
