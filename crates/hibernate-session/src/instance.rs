//! Entity instances and the handles that point at them.
//!
//! An [`EntityInstance`] is a property bag shaped by its persister. Sessions
//! share instances as [`EntityRef`]s: cloning a ref shares the instance, and
//! two refs denote the same managed object exactly when [`EntityRef::ptr_eq`]
//! holds. Associations hold [`EntityHandle`]s, which are either a concrete
//! instance or a lazy [`EntityProxy`].
//!
//! # Example
//!
//! ```ignore
//! let hero = EntityRef::new(EntityInstance::new(persister).with_identifier(1_i64));
//! hero.write().set("name", "Spider-Man")?;
//! hero.write().set_to_one("team", Some(team.clone().into()))?;
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hibernate_core::{EntityPersister, Error, PropertyKind, Result, Value};

use crate::collection::PersistentCollection;
use crate::proxy::EntityProxy;

/// The value held by one mapped property.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Basic(Value),
    ToOne(Option<EntityHandle>),
    Collection(Option<PersistentCollection>),
}

impl PropertyValue {
    /// The empty value for a property of the given kind.
    pub fn empty(kind: &PropertyKind) -> Self {
        match kind {
            PropertyKind::Basic { .. } => PropertyValue::Basic(Value::Null),
            PropertyKind::ToOne(_) => PropertyValue::ToOne(None),
            PropertyKind::Collection(_) => PropertyValue::Collection(None),
        }
    }

    fn matches(&self, kind: &PropertyKind) -> bool {
        matches!(
            (self, kind),
            (PropertyValue::Basic(_), PropertyKind::Basic { .. })
                | (PropertyValue::ToOne(_), PropertyKind::ToOne(_))
                | (PropertyValue::Collection(_), PropertyKind::Collection(_))
        )
    }
}

/// In-memory state of one entity.
#[derive(Clone)]
pub struct EntityInstance {
    persister: Arc<EntityPersister>,
    identifier: Option<Value>,
    version: Option<Value>,
    properties: Vec<PropertyValue>,
}

impl EntityInstance {
    /// A transient instance with every property empty.
    #[must_use]
    pub fn new(persister: &Arc<EntityPersister>) -> Self {
        Self {
            persister: Arc::clone(persister),
            identifier: None,
            version: None,
            properties: persister
                .properties()
                .iter()
                .map(|p| PropertyValue::empty(&p.kind))
                .collect(),
        }
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<Value>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn entity_name(&self) -> &str {
        self.persister.entity_name()
    }

    pub fn persister(&self) -> &Arc<EntityPersister> {
        &self.persister
    }

    pub fn identifier(&self) -> Option<&Value> {
        self.identifier.as_ref()
    }

    pub fn set_identifier(&mut self, identifier: Option<Value>) {
        self.identifier = identifier;
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn set_version(&mut self, version: Option<Value>) {
        self.version = version;
    }

    pub fn properties(&self) -> &[PropertyValue] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> Option<&PropertyValue> {
        self.properties.get(index)
    }

    /// Replace property `index`, rejecting a value of the wrong kind.
    pub fn set_property(&mut self, index: usize, value: PropertyValue) -> Result<()> {
        let Some(mapping) = self.persister.properties().get(index) else {
            return Err(Error::mapping(
                Some(self.entity_name()),
                None,
                format!("no property at index {}", index),
            ));
        };
        if !value.matches(&mapping.kind) {
            return Err(Error::mapping(
                Some(self.entity_name()),
                Some(&mapping.name),
                "value does not match the property kind",
            ));
        }
        self.properties[index] = value;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&PropertyValue> {
        let index = self.persister.require_property(name)?;
        Ok(&self.properties[index])
    }

    /// Value of a basic property.
    pub fn value(&self, name: &str) -> Result<&Value> {
        match self.get(name)? {
            PropertyValue::Basic(value) => Ok(value),
            _ => Err(self.kind_error(name, "basic")),
        }
    }

    /// Set a basic property.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.persister.require_property(name)?;
        self.set_property(index, PropertyValue::Basic(value.into()))
    }

    pub fn to_one(&self, name: &str) -> Result<Option<&EntityHandle>> {
        match self.get(name)? {
            PropertyValue::ToOne(handle) => Ok(handle.as_ref()),
            _ => Err(self.kind_error(name, "to-one")),
        }
    }

    pub fn set_to_one(&mut self, name: &str, handle: Option<EntityHandle>) -> Result<()> {
        let index = self.persister.require_property(name)?;
        self.set_property(index, PropertyValue::ToOne(handle))
    }

    pub fn collection(&self, name: &str) -> Result<Option<&PersistentCollection>> {
        match self.get(name)? {
            PropertyValue::Collection(collection) => Ok(collection.as_ref()),
            _ => Err(self.kind_error(name, "collection")),
        }
    }

    pub fn set_collection(&mut self, name: &str, collection: Option<PersistentCollection>) -> Result<()> {
        let index = self.persister.require_property(name)?;
        self.set_property(index, PropertyValue::Collection(collection))
    }

    fn kind_error(&self, name: &str, expected: &str) -> Error {
        Error::mapping(
            Some(self.entity_name()),
            Some(name),
            format!("property is not a {} property", expected),
        )
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInstance")
            .field("entity_name", &self.entity_name())
            .field("identifier", &self.identifier)
            .field("version", &self.version)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Shared, interior-mutable reference to an [`EntityInstance`].
///
/// Identity is pointer identity: the persistence context guarantees one
/// `EntityRef` per entity key.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<EntityInstance>>);

impl EntityRef {
    #[must_use]
    pub fn new(instance: EntityInstance) -> Self {
        Self(Arc::new(RwLock::new(instance)))
    }

    /// Read access; a poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, EntityInstance> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access; a poisoned lock is recovered.
    pub fn write(&self) -> RwLockWriteGuard<'_, EntityInstance> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity token, stable while any clone is alive.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub fn entity_name(&self) -> String {
        self.read().entity_name().to_string()
    }

    pub fn identifier(&self) -> Option<Value> {
        self.read().identifier().cloned()
    }

    pub fn persister(&self) -> Arc<EntityPersister> {
        Arc::clone(self.read().persister())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print properties: object graphs are cyclic.
        match self.0.try_read() {
            Ok(instance) => write!(
                f,
                "EntityRef({}#{:?})",
                instance.entity_name(),
                instance.identifier()
            ),
            Err(_) => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// A reference to an entity that may not be loaded yet.
#[derive(Debug, Clone)]
pub enum EntityHandle {
    Entity(EntityRef),
    Proxy(EntityProxy),
}

impl EntityHandle {
    pub fn entity_name(&self) -> String {
        match self {
            EntityHandle::Entity(entity) => entity.entity_name(),
            EntityHandle::Proxy(proxy) => proxy.entity_name(),
        }
    }

    pub fn identifier(&self) -> Option<Value> {
        match self {
            EntityHandle::Entity(entity) => entity.identifier(),
            EntityHandle::Proxy(proxy) => Some(proxy.identifier()),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, EntityHandle::Proxy(_))
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            EntityHandle::Entity(entity) => Some(entity),
            EntityHandle::Proxy(_) => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&EntityProxy> {
        match self {
            EntityHandle::Proxy(proxy) => Some(proxy),
            EntityHandle::Entity(_) => None,
        }
    }

    /// The instance, when it is available without a load.
    pub fn target(&self) -> Option<EntityRef> {
        match self {
            EntityHandle::Entity(entity) => Some(entity.clone()),
            EntityHandle::Proxy(proxy) => proxy.target(),
        }
    }

    /// Do both handles denote the same entity?
    ///
    /// Instances compare by pointer; otherwise entity name and identifier decide.
    pub fn same_entity(&self, other: &EntityHandle) -> bool {
        if let (Some(a), Some(b)) = (self.target(), other.target()) {
            if a.ptr_eq(&b) {
                return true;
            }
        }
        match (self, other) {
            (EntityHandle::Proxy(a), EntityHandle::Proxy(b)) if a.ptr_eq(b) => true,
            _ => match (self.identifier(), other.identifier()) {
                (Some(a), Some(b)) => {
                    self.entity_name() == other.entity_name() && a.same_identity(&b)
                }
                _ => false,
            },
        }
    }
}

impl From<EntityRef> for EntityHandle {
    fn from(entity: EntityRef) -> Self {
        EntityHandle::Entity(entity)
    }
}

impl From<EntityProxy> for EntityHandle {
    fn from(proxy: EntityProxy) -> Self {
        EntityHandle::Proxy(proxy)
    }
}
