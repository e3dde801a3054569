//! Session factories and the process-wide factory registry.
//!
//! A [`SessionFactory`] owns everything sessions share: the metamodel, the
//! settings, the load-plan cache, second-level cache regions and identifier
//! generator state. Factories register themselves in the
//! [`SessionFactoryRegistry`] so that a deserialized proxy can find the
//! metadata of the factory that created it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use hibernate_core::{Connection, Error, Metamodel, Result, Settings, UsageErrorKind};
use hibernate_loader::{LoadPlan, PlanCache};
use uuid::Uuid;

use crate::cache::{CacheRegion, InMemoryCacheRegion};
use crate::id::IdentifierGenerators;
use crate::session::{Session, SessionConfig};

const DEFAULT_PLAN_CACHE_SIZE: usize = 256;

/// Shared, immutable-after-build state of a group of sessions.
pub struct SessionFactory {
    id: Uuid,
    name: Option<String>,
    metamodel: Arc<Metamodel>,
    settings: Settings,
    plan_cache: Mutex<PlanCache>,
    cache_regions: HashMap<String, Arc<dyn CacheRegion>>,
    generators: IdentifierGenerators,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cache_regions", &self.cache_regions.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(metamodel)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Second-level cache region of `entity_name`, when caching is enabled
    /// and the entity is cacheable.
    pub fn cache_region(&self, entity_name: &str) -> Option<&Arc<dyn CacheRegion>> {
        if !self.settings.use_second_level_cache {
            return None;
        }
        self.cache_regions.get(entity_name)
    }

    pub fn generators(&self) -> &IdentifierGenerators {
        &self.generators
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the factory: no new sessions, and serialized proxies can no
    /// longer be resolved against it.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            SessionFactoryRegistry::global().deregister(self.id, self.name.as_deref());
            tracing::info!(factory = %self.id, "Session factory closed");
        }
    }

    /// Cached plan under `key`, or a new one from `build`.
    ///
    /// A `None` key bypasses the cache.
    pub(crate) fn plan(&self, key: Option<u64>, build: impl FnOnce() -> Result<LoadPlan>) -> Result<Arc<LoadPlan>> {
        let Some(key) = key else {
            return build().map(Arc::new);
        };
        if let Some(plan) = self.lock_plans().get(key) {
            tracing::trace!(key, "Plan cache hit");
            return Ok(plan);
        }
        let plan = Arc::new(build()?);
        self.lock_plans().insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn cached_plan_count(&self) -> usize {
        self.lock_plans().len()
    }

    pub fn plan_cache_hits(&self) -> u64 {
        self.lock_plans().total_hits()
    }

    fn lock_plans(&self) -> std::sync::MutexGuard<'_, PlanCache> {
        self.plan_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session over `connection` with the default configuration.
    pub fn open_session<C: Connection>(self: &Arc<Self>, connection: C) -> Result<Session<C>> {
        self.open_session_with(connection, SessionConfig::default())
    }

    pub fn open_session_with<C: Connection>(self: &Arc<Self>, connection: C, config: SessionConfig) -> Result<Session<C>> {
        if self.is_closed() {
            return Err(Error::usage(
                UsageErrorKind::FactoryClosed,
                "cannot open a session on a closed factory",
            ));
        }
        Ok(Session::new(Arc::clone(self), connection, config))
    }
}

impl Drop for SessionFactory {
    fn drop(&mut self) {
        SessionFactoryRegistry::global().deregister(self.id, self.name.as_deref());
    }
}

/// Builder for [`SessionFactory`].
#[derive(Debug)]
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    settings: Settings,
    name: Option<String>,
    plan_cache_size: usize,
    regions: HashMap<String, Arc<dyn CacheRegion>>,
}

impl SessionFactoryBuilder {
    pub fn new(metamodel: Metamodel) -> Self {
        Self {
            metamodel,
            settings: Settings::default(),
            name: None,
            plan_cache_size: DEFAULT_PLAN_CACHE_SIZE,
            regions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Register the factory under a name as well as its id.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn plan_cache_size(mut self, size: usize) -> Self {
        self.plan_cache_size = size;
        self
    }

    /// Use `region` for `entity_name` instead of an in-memory region.
    #[must_use]
    pub fn cache_region(mut self, entity_name: &str, region: Arc<dyn CacheRegion>) -> Self {
        self.regions.insert(entity_name.to_string(), region);
        self
    }

    pub fn build(mut self) -> Result<Arc<SessionFactory>> {
        for persister in self.metamodel.persisters() {
            if persister.is_cacheable() && !self.regions.contains_key(persister.entity_name()) {
                self.regions.insert(
                    persister.entity_name().to_string(),
                    Arc::new(InMemoryCacheRegion::new(persister.entity_name())),
                );
            }
        }
        for entity in self.regions.keys() {
            self.metamodel.persister(entity)?;
        }
        let factory = Arc::new(SessionFactory {
            id: Uuid::new_v4(),
            name: self.name,
            metamodel: Arc::new(self.metamodel),
            settings: self.settings,
            plan_cache: Mutex::new(PlanCache::new(self.plan_cache_size)),
            cache_regions: self.regions,
            generators: IdentifierGenerators::new(),
            closed: AtomicBool::new(false),
        });
        SessionFactoryRegistry::global().register(&factory);
        tracing::info!(
            factory = %factory.id,
            name = ?factory.name,
            entities = factory.metamodel.persisters().count(),
            "Session factory built"
        );
        Ok(factory)
    }
}

/// Process-wide lookup of live factories by id and by name.
#[derive(Debug, Default)]
pub struct SessionFactoryRegistry {
    by_id: RwLock<HashMap<Uuid, Weak<SessionFactory>>>,
    by_name: RwLock<HashMap<String, Weak<SessionFactory>>>,
}

static REGISTRY: OnceLock<SessionFactoryRegistry> = OnceLock::new();

impl SessionFactoryRegistry {
    pub fn global() -> &'static SessionFactoryRegistry {
        REGISTRY.get_or_init(SessionFactoryRegistry::default)
    }

    fn register(&self, factory: &Arc<SessionFactory>) {
        self.by_id
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(factory.id, Arc::downgrade(factory));
        if let Some(name) = &factory.name {
            self.by_name
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.clone(), Arc::downgrade(factory));
        }
    }

    fn deregister(&self, id: Uuid, name: Option<&str>) {
        self.by_id.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
        if let Some(name) = name {
            let mut by_name = self.by_name.write().unwrap_or_else(|e| e.into_inner());
            let replaced = by_name
                .get(name)
                .and_then(Weak::upgrade)
                .is_some_and(|f| f.id != id);
            if !replaced {
                by_name.remove(name);
            }
        }
    }

    /// The live, open factory with `id`.
    pub fn get(&self, id: &Uuid) -> Option<Arc<SessionFactory>> {
        self.by_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|f| !f.is_closed())
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<SessionFactory>> {
        self.by_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .and_then(Weak::upgrade)
            .filter(|f| !f.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use hibernate_core::EntityPersister;

    fn metamodel() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityPersister::builder("Hero", "hero")
                    .identifier("id", "id")
                    .basic("name", "name")
                    .cacheable(true)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry_lookup_and_close() {
        let factory = SessionFactory::builder(metamodel()).name("registry-test").build().unwrap();
        let id = factory.id();
        let registry = SessionFactoryRegistry::global();
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &factory));
        assert!(registry.get_by_name("registry-test").is_some());

        factory.close();
        assert!(registry.get(&id).is_none());
        assert!(registry.get_by_name("registry-test").is_none());
        let err = factory.open_session(MockConnection::new()).unwrap_err();
        assert!(matches!(err, Error::Usage(ref u) if u.kind == UsageErrorKind::FactoryClosed));
    }

    #[test]
    fn test_dropped_factory_is_unreachable() {
        let factory = SessionFactory::builder(metamodel()).build().unwrap();
        let id = factory.id();
        drop(factory);
        assert!(SessionFactoryRegistry::global().get(&id).is_none());
    }

    #[test]
    fn test_cache_regions_follow_settings() {
        let factory = SessionFactory::builder(metamodel())
            .settings(Settings::default().use_second_level_cache(true))
            .build()
            .unwrap();
        assert!(factory.cache_region("Hero").is_some());

        let disabled = SessionFactory::builder(metamodel()).build().unwrap();
        assert!(disabled.cache_region("Hero").is_none());
    }

    #[test]
    fn test_plan_cache_reuses_plans() {
        let factory = SessionFactory::builder(metamodel()).build().unwrap();
        let metamodel = Arc::clone(factory.metamodel());
        let settings = factory.settings().clone();
        let build = || {
            let influencers = hibernate_loader::LoadQueryInfluencers::new();
            hibernate_loader::JoinWalker::new(&metamodel, &settings, &influencers)
                .entity_plan("Hero", &hibernate_loader::EntityRestriction::Identifier)
        };
        let a = factory.plan(Some(7), build).unwrap();
        let b = factory.plan(Some(7), || unreachable!()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.cached_plan_count(), 1);
        assert_eq!(factory.plan_cache_hits(), 1);
    }
}
