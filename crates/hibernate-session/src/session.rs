//! The session: one unit of work over one connection.
//!
//! Loading lives in [`crate::load`], persistence operations in
//! [`crate::cascade`] and flushing in [`crate::flush`]; this module holds the
//! session itself, its lifecycle, transactions and influencers.

use std::sync::Arc;

use hibernate_core::{
    Connection, DataAccessError, DataAccessErrorKind, Error, IsolationLevel, Result,
    UsageErrorKind,
};
use hibernate_loader::{EnabledFilter, LoadQueryInfluencers};
use serde::Serialize;
use uuid::Uuid;

use crate::action_queue::ActionQueue;
use crate::collection::PersistentCollection;
use crate::events::{
    AfterLoadAction, EntityListener, SessionEvent, SessionEventCallbacks, SharedAfterLoadAction,
    SharedListener,
};
use crate::factory::SessionFactory;
use crate::instance::{EntityHandle, EntityInstance, EntityRef};
use crate::persistence_context::PersistenceContext;
use crate::proxy::{EntityProxy, ProxyResolver, SessionLink, SessionLiveness};
use crate::stats::SessionStatistics;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush before commit and before queries run inside a transaction.
    pub auto_flush: bool,
    /// Overrides the factory's default read-only setting.
    pub default_read_only: Option<bool>,
    /// Tenant every key of this session is scoped to.
    pub tenant_id: Option<String>,
    /// Isolation level used by `begin`.
    pub isolation: IsolationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: true,
            default_read_only: None,
            tenant_id: None,
            isolation: IsolationLevel::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = Some(value);
        self
    }

    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// What `replicate` does when the row already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Fail with a non-unique object error.
    #[default]
    Exception,
    /// Leave the existing row alone.
    Ignore,
    /// Overwrite the existing row.
    Overwrite,
    /// Overwrite only when the replicated version is newer.
    LatestVersion,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns a connection, a persistence context (the identity map plus
/// entity and collection entries), the queue of scheduled actions and the
/// enabled filters and fetch profiles. Every entity it returns is the one
/// instance that represents its row within this session.
///
/// A session is single-threaded: operations take `&mut self`.
pub struct Session<C: Connection> {
    pub(crate) id: Uuid,
    pub(crate) factory: Arc<SessionFactory>,
    pub(crate) connection: C,
    pub(crate) config: SessionConfig,
    pub(crate) liveness: Arc<SessionLiveness>,
    pub(crate) pc: PersistenceContext,
    pub(crate) actions: ActionQueue,
    pub(crate) influencers: LoadQueryInfluencers,
    pub(crate) listeners: Vec<SharedListener>,
    pub(crate) after_load_actions: Vec<SharedAfterLoadAction>,
    pub(crate) event_callbacks: SessionEventCallbacks,
    pub(crate) stats: SessionStatistics,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("factory", &self.factory.id())
            .field("open", &self.is_open())
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(factory: Arc<SessionFactory>, connection: C, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        let liveness = SessionLiveness::new();
        let mut pc = PersistenceContext::new(SessionLink::new(id, &liveness), factory.id())
            .with_tenant(config.tenant_id.clone());
        pc.set_default_read_only(
            config
                .default_read_only
                .unwrap_or(factory.settings().default_read_only),
        );
        tracing::debug!(session = %id, factory = %factory.id(), tenant = ?config.tenant_id, "Session opened");
        Self {
            id,
            factory,
            connection,
            config,
            liveness,
            pc,
            actions: ActionQueue::new(),
            influencers: LoadQueryInfluencers::new(),
            listeners: Vec::new(),
            after_load_actions: Vec::new(),
            event_callbacks: SessionEventCallbacks::default(),
            stats: SessionStatistics::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Direct access to the connection, for statements the session does not track.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.config.tenant_id.as_deref()
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.stats
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.pc
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.actions
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    pub fn add_listener(&mut self, listener: impl EntityListener + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn add_after_load_action(&mut self, action: impl AfterLoadAction + 'static) {
        self.after_load_actions.push(Arc::new(action));
    }

    /// Register a callback to run before each flush.
    ///
    /// Returning an error aborts the flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.register(SessionEvent::BeforeFlush, f);
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.register(SessionEvent::AfterFlush, f);
    }

    /// Register a callback to run before commit, after the flush.
    ///
    /// Returning an error aborts the commit.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.register(SessionEvent::BeforeCommit, f);
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.register(SessionEvent::AfterCommit, f);
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.register(SessionEvent::AfterRollback, f);
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    pub fn in_transaction(&self) -> bool {
        self.connection.in_transaction()
    }

    /// Begin a transaction at the configured isolation level.
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_connected()?;
        if self.connection.in_transaction() {
            return Err(Error::usage(
                UsageErrorKind::TransactionActive,
                "a transaction is already active",
            ));
        }
        self.connection.begin_with(self.config.isolation)?;
        tracing::debug!(session = %self.id, isolation = self.config.isolation.as_sql(), "Transaction begun");
        Ok(())
    }

    /// Flush, then commit the transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.require_transaction()?;
        if self.config.auto_flush {
            self.flush()?;
        }
        self.event_callbacks.fire(SessionEvent::BeforeCommit)?;
        self.connection.commit()?;
        self.pc.clear_inserted_keys();
        tracing::debug!(session = %self.id, "Transaction committed");
        self.event_callbacks.fire(SessionEvent::AfterCommit)?;
        Ok(())
    }

    /// Roll the transaction back.
    ///
    /// Scheduled actions are dropped and instances inserted during the
    /// transaction leave the persistence context. Other managed instances keep
    /// whatever in-memory state they have; clear or close the session to
    /// discard it.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.require_transaction()?;
        self.connection.rollback()?;
        self.actions.clear();
        for key in self.pc.inserted_keys() {
            self.pc.remove_entity(&key);
            if let Some(region) = self.factory.cache_region(key.entity_name()) {
                if let Err(e) = region.evict(&key) {
                    tracing::warn!(entity = %key, error = %e, "Cache eviction failed");
                }
            }
        }
        self.pc.clear_inserted_keys();
        tracing::debug!(session = %self.id, "Transaction rolled back");
        self.event_callbacks.fire(SessionEvent::AfterRollback)?;
        Ok(())
    }

    fn require_transaction(&self) -> Result<()> {
        if self.connection.in_transaction() {
            Ok(())
        } else {
            Err(Error::usage(UsageErrorKind::NoTransaction, "no transaction is active"))
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.liveness.is_connected() && self.connection.is_open()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.liveness.is_open() {
            Ok(())
        } else {
            Err(Error::usage(UsageErrorKind::SessionClosed, "session is closed"))
        }
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        Err(Error::DataAccess(DataAccessError {
            kind: DataAccessErrorKind::Closed,
            sql: None,
            message: "session is disconnected".into(),
            source: None,
        }))
    }

    /// Detach every instance, proxy and collection and drop scheduled actions.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pc.clear();
        self.actions.clear();
        Ok(())
    }

    /// Close the session, rolling back an open transaction.
    ///
    /// Proxies and collections handed out by this session fail with a
    /// closed-session error from now on.
    pub fn close(&mut self) -> Result<()> {
        if !self.liveness.is_open() {
            return Ok(());
        }
        let result = if self.connection.in_transaction() {
            tracing::warn!(session = %self.id, "Closing session with an active transaction; rolling back");
            self.connection.rollback()
        } else {
            Ok(())
        };
        self.liveness.close();
        self.pc.close();
        self.actions.clear();
        tracing::debug!(session = %self.id, stats = ?self.stats, "Session closed");
        result
    }

    /// Keep the session but stop using the connection until `reconnect`.
    pub fn disconnect(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.liveness.disconnect();
        Ok(())
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.liveness.reconnect();
        Ok(())
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// A new transient instance of `entity_name`.
    pub fn instantiate(&self, entity_name: &str) -> Result<EntityRef> {
        let persister = self.factory.metamodel().persister(entity_name)?;
        Ok(EntityRef::new(EntityInstance::new(persister)))
    }

    /// An empty, transient wrapper for the collection `role`.
    pub fn new_collection(&self, role: &str) -> Result<PersistentCollection> {
        let (_, _, mapping) = self.factory.metamodel().collection(role)?;
        Ok(PersistentCollection::new(role, mapping.kind))
    }

    /// Is the entity (or proxy) managed by this session and not deleted?
    pub fn contains(&self, handle: &EntityHandle) -> bool {
        match handle {
            EntityHandle::Entity(entity) => self
                .pc
                .get_entry(entity)
                .is_some_and(|e| !e.status().is_deleted_or_gone()),
            EntityHandle::Proxy(proxy) => {
                self.pc.contains_proxy(proxy)
                    || proxy
                        .target()
                        .is_some_and(|t| self.contains(&EntityHandle::Entity(t)))
            }
        }
    }

    /// Bind a proxy from another (closed or cleared) session to this one.
    pub fn reassociate_proxy(&mut self, proxy: &EntityProxy) -> Result<()> {
        self.ensure_open()?;
        if proxy.factory_id() != self.factory.id() {
            return Err(Error::usage(
                UsageErrorKind::NonUniqueObject,
                "proxy belongs to a different session factory",
            ));
        }
        self.pc.reassociate_proxy(proxy)?;
        Ok(())
    }

    pub fn is_default_read_only(&self) -> bool {
        self.pc.is_default_read_only()
    }

    /// Read-only default for entities and proxies loaded from now on.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.pc.set_default_read_only(read_only);
    }

    /// Mark a managed entity or proxy read-only, or modifiable again.
    ///
    /// Making an entity modifiable resets its snapshot to the current state,
    /// so changes made while it was read-only are not flushed.
    pub fn set_read_only(&mut self, handle: &EntityHandle, read_only: bool) -> Result<()> {
        self.ensure_open()?;
        let was_read_only = self.pc.is_read_only(handle)?;
        self.pc.set_read_only(handle, read_only)?;
        if was_read_only && !read_only {
            if let Some(entity) = self.pc.unproxy(handle) {
                let state = self.current_state(&entity)?;
                let version = entity.read().version().cloned();
                if let Some(entry) = self.pc.get_entry_mut(&entity) {
                    entry.set_loaded_state(state, version);
                }
            }
        }
        Ok(())
    }

    pub fn is_read_only(&self, handle: &EntityHandle) -> Result<bool> {
        self.pc.is_read_only(handle)
    }

    // ========================================================================
    // Filters and Fetch Profiles
    // ========================================================================

    /// Enable a named filter; bind its parameters on the returned value.
    pub fn enable_filter(&mut self, name: &str) -> Result<&mut EnabledFilter> {
        self.ensure_open()?;
        self.influencers.enable_filter(self.factory.metamodel(), name)
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.influencers.disable_filter(name);
    }

    pub fn enable_fetch_profile(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.influencers.enable_fetch_profile(self.factory.metamodel(), name)
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.influencers.disable_fetch_profile(name);
    }

    pub fn influencers(&self) -> &LoadQueryInfluencers {
        &self.influencers
    }

    // ========================================================================
    // Debug Diagnostics
    // ========================================================================

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            managed: self.pc.entity_count(),
            collections: self.pc.collections().len(),
            pending_inserts: self.actions.insert_count(),
            pending_deletes: self.actions.delete_count(),
            in_transaction: self.connection.in_transaction(),
        }
    }
}

impl<C: Connection> ProxyResolver for Session<C> {
    fn resolve_proxy(&mut self, proxy: &EntityProxy) -> Result<EntityRef> {
        self.initialize_proxy(proxy)
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        if self.liveness.is_open() {
            if let Err(e) = self.close() {
                tracing::warn!(session = %self.id, error = %e, "Error closing dropped session");
            }
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Instances in the identity map.
    pub managed: usize,
    /// Registered collection wrappers.
    pub collections: usize,
    /// Inserts waiting for the next flush.
    pub pending_inserts: usize,
    /// Deletes (including orphan removals) waiting for the next flush.
    pub pending_deletes: usize,
    pub in_transaction: bool,
}
