//! Lazy entity proxies.
//!
//! An [`EntityProxy`] stands in for an entity that has not been loaded. It
//! knows the entity name and identifier, and resolves to the real instance on
//! first use through the session that created it. The proxy only holds a
//! non-owning [`SessionLink`] (session id plus a weak reference to the
//! session's liveness flags), so a proxy that outlives its session fails fast
//! with a lazy-initialization error instead of keeping the session alive.
//!
//! Proxies serialize through [`SerializableProxy`]; the deserialized proxy is
//! session-less until [`Session::reassociate_proxy`](crate::Session::reassociate_proxy)
//! binds it again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use hibernate_core::{
    EntityPersister, Error, LazyInitializationErrorKind, Result, UsageErrorKind, Value,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::factory::SessionFactoryRegistry;
use crate::instance::{EntityHandle, EntityRef};

/// Open/connected flags shared between a session and its proxies.
#[derive(Debug)]
pub struct SessionLiveness {
    open: AtomicBool,
    connected: AtomicBool,
}

impl SessionLiveness {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn reconnect(&self) {
        if self.is_open() {
            self.connected.store(true, Ordering::Release);
        }
    }
}

impl Default for SessionLiveness {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            connected: AtomicBool::new(true),
        }
    }
}

/// Non-owning link from a proxy to the session that may initialize it.
#[derive(Debug, Clone)]
pub struct SessionLink {
    session_id: Uuid,
    liveness: Weak<SessionLiveness>,
}

impl SessionLink {
    #[must_use]
    pub fn new(session_id: Uuid, liveness: &Arc<SessionLiveness>) -> Self {
        Self {
            session_id,
            liveness: Arc::downgrade(liveness),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Is the linked session still open and connected?
    fn check(&self, entity_name: &str, identifier: &Value) -> Result<()> {
        let kind = match self.liveness.upgrade() {
            None => Some(LazyInitializationErrorKind::SessionClosed),
            Some(liveness) if !liveness.is_open() => Some(LazyInitializationErrorKind::SessionClosed),
            Some(liveness) if !liveness.is_connected() => {
                Some(LazyInitializationErrorKind::ConnectionClosed)
            }
            Some(_) => None,
        };
        match kind {
            Some(kind) => Err(Error::lazy(kind, entity_name, Some(identifier.clone()))),
            None => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.liveness.upgrade().is_some_and(|l| l.is_open())
    }
}

/// Initialization progress of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Unconstructed,
    Initializing,
    Initialized,
}

#[derive(Debug)]
struct LazyInitializer {
    entity_name: String,
    class_name: String,
    interfaces: Vec<String>,
    identifier: Value,
    factory_id: Uuid,
    target: Option<EntityRef>,
    session: Option<SessionLink>,
    read_only: bool,
    state: ProxyState,
}

/// A lazily initialized reference to one entity.
///
/// Clones share the same initializer, so resolving one clone resolves all.
#[derive(Clone)]
pub struct EntityProxy(Arc<RwLock<LazyInitializer>>);

impl EntityProxy {
    /// A session-less proxy owned by factory `factory_id`.
    #[must_use]
    pub fn new(factory_id: Uuid, persister: &EntityPersister, identifier: Value) -> Self {
        Self(Arc::new(RwLock::new(LazyInitializer {
            entity_name: persister.entity_name().to_string(),
            class_name: persister.class_name().to_string(),
            interfaces: persister.proxy_interfaces().to_vec(),
            identifier: identifier.normalized(),
            factory_id,
            target: None,
            session: None,
            read_only: false,
            state: ProxyState::Unconstructed,
        })))
    }

    fn read(&self) -> RwLockReadGuard<'_, LazyInitializer> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LazyInitializer> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity_name(&self) -> String {
        self.read().entity_name.clone()
    }

    pub fn identifier(&self) -> Value {
        self.read().identifier.clone()
    }

    pub fn class_name(&self) -> String {
        self.read().class_name.clone()
    }

    pub fn factory_id(&self) -> Uuid {
        self.read().factory_id
    }

    pub fn state(&self) -> ProxyState {
        self.read().state
    }

    pub fn is_initialized(&self) -> bool {
        self.read().state == ProxyState::Initialized
    }

    pub fn target(&self) -> Option<EntityRef> {
        self.read().target.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.read().read_only
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.write().read_only = read_only;
    }

    /// Id of the session this proxy is bound to, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.read().session.as_ref().map(SessionLink::session_id)
    }

    /// Is the proxy bound to a session that is still open?
    pub fn is_attached(&self) -> bool {
        self.read().session.as_ref().is_some_and(SessionLink::is_alive)
    }

    pub(crate) fn set_session(&self, link: SessionLink) {
        self.write().session = Some(link);
    }

    pub(crate) fn unset_session(&self) {
        self.write().session = None;
    }

    /// Verify that session `session_id` may initialize this proxy.
    pub(crate) fn check_session(&self, session_id: Uuid) -> Result<()> {
        let init = self.read();
        let Some(link) = &init.session else {
            return Err(Error::lazy(
                LazyInitializationErrorKind::NoSession,
                init.entity_name.clone(),
                Some(init.identifier.clone()),
            ));
        };
        link.check(&init.entity_name, &init.identifier)?;
        if link.session_id != session_id {
            return Err(Error::lazy(
                LazyInitializationErrorKind::ForeignSession,
                init.entity_name.clone(),
                Some(init.identifier.clone()),
            ));
        }
        Ok(())
    }

    /// Enter INITIALIZING; `false` when already initialized.
    pub(crate) fn begin_initialize(&self) -> Result<bool> {
        let mut init = self.write();
        match init.state {
            ProxyState::Initialized => Ok(false),
            ProxyState::Initializing => Err(Error::assertion(format!(
                "proxy {}#{:?} is already initializing",
                init.entity_name, init.identifier
            ))),
            ProxyState::Unconstructed => {
                init.state = ProxyState::Initializing;
                Ok(true)
            }
        }
    }

    pub(crate) fn abort_initialize(&self) {
        let mut init = self.write();
        if init.state == ProxyState::Initializing {
            init.state = ProxyState::Unconstructed;
        }
    }

    pub(crate) fn set_target(&self, target: EntityRef) {
        let mut init = self.write();
        init.target = Some(target);
        init.state = ProxyState::Initialized;
    }

    pub fn ptr_eq(&self, other: &EntityProxy) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The serialized form of this proxy.
    pub fn write_replace(&self) -> SerializableProxy {
        let init = self.read();
        SerializableProxy {
            entity_name: init.entity_name.clone(),
            identifier: init.identifier.clone(),
            class_name: init.class_name.clone(),
            interfaces: init.interfaces.clone(),
            read_only: init.read_only,
            factory_id: init.factory_id,
        }
    }
}

impl fmt::Debug for EntityProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(init) => write!(
                f,
                "EntityProxy({}#{:?}, {:?})",
                init.entity_name, init.identifier, init.state
            ),
            Err(_) => f.write_str("EntityProxy(<locked>)"),
        }
    }
}

/// Portable form of an [`EntityProxy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializableProxy {
    pub entity_name: String,
    pub identifier: Value,
    pub class_name: String,
    pub interfaces: Vec<String>,
    pub read_only: bool,
    pub factory_id: Uuid,
}

impl SerializableProxy {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild a session-less proxy.
    ///
    /// The owning factory must still be registered and must map the entity.
    pub fn read_resolve(self) -> Result<EntityProxy> {
        let factory = SessionFactoryRegistry::global()
            .get(&self.factory_id)
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::FactoryClosed,
                    format!("session factory {} is not registered", self.factory_id),
                )
            })?;
        let persister = factory.metamodel().persister(&self.entity_name)?;
        let proxy = EntityProxy::new(self.factory_id, persister, self.identifier);
        proxy.set_read_only(self.read_only);
        Ok(proxy)
    }
}

/// Something able to initialize proxies, usually a session.
pub trait ProxyResolver {
    fn resolve_proxy(&mut self, proxy: &EntityProxy) -> Result<EntityRef>;
}

/// Capability shared by every lazily resolvable entity reference.
pub trait LazyReference {
    fn identifier(&self) -> Option<Value>;

    fn is_resolved(&self) -> bool;

    /// The instance, initializing it through `resolver` if needed.
    fn resolve(&self, resolver: &mut dyn ProxyResolver) -> Result<EntityRef>;
}

impl LazyReference for EntityProxy {
    fn identifier(&self) -> Option<Value> {
        Some(EntityProxy::identifier(self))
    }

    fn is_resolved(&self) -> bool {
        self.is_initialized()
    }

    fn resolve(&self, resolver: &mut dyn ProxyResolver) -> Result<EntityRef> {
        match self.target() {
            Some(target) => Ok(target),
            None => resolver.resolve_proxy(self),
        }
    }
}

impl LazyReference for EntityHandle {
    fn identifier(&self) -> Option<Value> {
        EntityHandle::identifier(self)
    }

    fn is_resolved(&self) -> bool {
        match self {
            EntityHandle::Entity(_) => true,
            EntityHandle::Proxy(proxy) => proxy.is_initialized(),
        }
    }

    fn resolve(&self, resolver: &mut dyn ProxyResolver) -> Result<EntityRef> {
        match self {
            EntityHandle::Entity(entity) => Ok(entity.clone()),
            EntityHandle::Proxy(proxy) => proxy.resolve(resolver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::EntityInstance;

    fn editor() -> Arc<EntityPersister> {
        Arc::new(
            EntityPersister::builder("Editor", "editor")
                .identifier("id", "id")
                .basic("name", "name")
                .class_name("org.example.Editor")
                .proxy_interfaces(&["org.example.Named"])
                .build()
                .unwrap(),
        )
    }

    struct CountingResolver {
        target: EntityRef,
        calls: usize,
    }

    impl ProxyResolver for CountingResolver {
        fn resolve_proxy(&mut self, proxy: &EntityProxy) -> Result<EntityRef> {
            self.calls += 1;
            proxy.set_target(self.target.clone());
            Ok(self.target.clone())
        }
    }

    #[test]
    fn test_session_checks() {
        let persister = editor();
        let proxy = EntityProxy::new(Uuid::new_v4(), &persister, Value::BigInt(7));
        let session = Uuid::new_v4();

        let err = proxy.check_session(session).unwrap_err();
        assert!(matches!(
            err,
            Error::LazyInitialization(ref e) if e.kind == LazyInitializationErrorKind::NoSession
        ));

        let liveness = SessionLiveness::new();
        proxy.set_session(SessionLink::new(session, &liveness));
        assert!(proxy.check_session(session).is_ok());
        assert!(proxy.is_attached());

        let foreign = proxy.check_session(Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            foreign,
            Error::LazyInitialization(ref e) if e.kind == LazyInitializationErrorKind::ForeignSession
        ));

        liveness.disconnect();
        let disconnected = proxy.check_session(session).unwrap_err();
        assert!(matches!(
            disconnected,
            Error::LazyInitialization(ref e) if e.kind == LazyInitializationErrorKind::ConnectionClosed
        ));

        drop(liveness);
        let closed = proxy.check_session(session).unwrap_err();
        assert!(matches!(
            closed,
            Error::LazyInitialization(ref e) if e.kind == LazyInitializationErrorKind::SessionClosed
        ));
        assert!(!proxy.is_attached());
    }

    #[test]
    fn test_state_machine() {
        let proxy = EntityProxy::new(Uuid::new_v4(), &editor(), Value::Int(1));
        assert_eq!(proxy.state(), ProxyState::Unconstructed);
        assert_eq!(proxy.identifier(), Value::BigInt(1));
        assert!(proxy.begin_initialize().unwrap());
        assert!(proxy.begin_initialize().is_err());
        proxy.abort_initialize();
        assert_eq!(proxy.state(), ProxyState::Unconstructed);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let persister = editor();
        let target = EntityRef::new(EntityInstance::new(&persister).with_identifier(3_i64));
        let proxy = EntityProxy::new(Uuid::new_v4(), &persister, Value::BigInt(3));
        let mut resolver = CountingResolver { target, calls: 0 };

        let first = proxy.resolve(&mut resolver).unwrap();
        let second = proxy.clone().resolve(&mut resolver).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(resolver.calls, 1);
        assert!(LazyReference::is_resolved(&proxy));
    }

    #[test]
    fn test_serialized_form() {
        let proxy = EntityProxy::new(Uuid::new_v4(), &editor(), Value::BigInt(9));
        proxy.set_read_only(true);
        let json = proxy.write_replace().to_json().unwrap();
        assert!(json.contains("\"entityName\":\"Editor\""));
        assert!(json.contains("\"className\":\"org.example.Editor\""));
        let back = SerializableProxy::from_json(&json).unwrap();
        assert_eq!(back, proxy.write_replace());
        assert!(back.read_only);
    }

    #[test]
    fn test_read_resolve_requires_registered_factory() {
        let proxy = EntityProxy::new(Uuid::new_v4(), &editor(), Value::BigInt(9));
        let err = proxy.write_replace().read_resolve().unwrap_err();
        assert!(matches!(err, Error::Usage(ref e) if e.kind == UsageErrorKind::FactoryClosed));
    }
}
