//! Persistent collections and their bookkeeping entries.
//!
//! A [`PersistentCollection`] is the wrapper stored in a collection-valued
//! property. It knows its role and owner, tracks whether its elements have
//! been read from the database, and marks itself dirty on mutation. The
//! persistence context keeps one [`CollectionEntry`] per wrapper with the
//! element snapshot taken at load or flush time; flush diffs the two to find
//! added rows, removed rows and orphans.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hibernate_core::{
    CollectionKind, EntityKey, Error, LazyInitializationError, LazyInitializationErrorKind,
    Result, Value,
};

use crate::instance::{EntityHandle, EntityRef};

/// One element of a collection.
#[derive(Debug, Clone)]
pub enum CollectionElement {
    Entity(EntityHandle),
    Basic(Value),
}

impl CollectionElement {
    pub fn as_entity(&self) -> Option<&EntityHandle> {
        match self {
            CollectionElement::Entity(handle) => Some(handle),
            CollectionElement::Basic(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            CollectionElement::Basic(value) => Some(value),
            CollectionElement::Entity(_) => None,
        }
    }

    /// Same entity, or equal basic value.
    pub fn same_as(&self, other: &CollectionElement) -> bool {
        match (self, other) {
            (CollectionElement::Entity(a), CollectionElement::Entity(b)) => a.same_entity(b),
            (CollectionElement::Basic(a), CollectionElement::Basic(b)) => a.same_identity(b),
            _ => false,
        }
    }

    /// Snapshot form; `None` for an entity without an identifier yet.
    pub fn snapshot(&self) -> Option<SnapshotElement> {
        match self {
            CollectionElement::Entity(handle) => {
                handle.identifier().map(|identifier| SnapshotElement::Entity {
                    entity_name: handle.entity_name(),
                    identifier: identifier.normalized(),
                })
            }
            CollectionElement::Basic(value) => Some(SnapshotElement::Basic(value.clone())),
        }
    }
}

impl From<Value> for CollectionElement {
    fn from(value: Value) -> Self {
        CollectionElement::Basic(value)
    }
}

impl From<EntityRef> for CollectionElement {
    fn from(entity: EntityRef) -> Self {
        CollectionElement::Entity(EntityHandle::Entity(entity))
    }
}

impl From<EntityHandle> for CollectionElement {
    fn from(handle: EntityHandle) -> Self {
        CollectionElement::Entity(handle)
    }
}

/// Element identity as recorded in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotElement {
    Entity { entity_name: String, identifier: Value },
    Basic(Value),
}

impl SnapshotElement {
    pub fn same_as(&self, other: &SnapshotElement) -> bool {
        match (self, other) {
            (
                SnapshotElement::Entity {
                    entity_name: a_name,
                    identifier: a_id,
                },
                SnapshotElement::Entity {
                    entity_name: b_name,
                    identifier: b_id,
                },
            ) => a_name == b_name && a_id.same_identity(b_id),
            (SnapshotElement::Basic(a), SnapshotElement::Basic(b)) => a.same_identity(b),
            _ => false,
        }
    }

    /// Entity key of an entity element.
    pub fn entity_key(&self, tenant_id: Option<&str>) -> Option<EntityKey> {
        match self {
            SnapshotElement::Entity {
                entity_name,
                identifier,
            } => Some(
                EntityKey::new(entity_name.clone(), identifier)
                    .with_tenant(tenant_id.map(str::to_string)),
            ),
            SnapshotElement::Basic(_) => None,
        }
    }
}

/// Snapshot of a list of elements.
pub fn snapshot_of(elements: &[CollectionElement]) -> Vec<SnapshotElement> {
    elements.iter().filter_map(CollectionElement::snapshot).collect()
}

#[derive(Debug)]
struct CollectionState {
    role: String,
    kind: CollectionKind,
    owner: Option<EntityKey>,
    elements: Vec<CollectionElement>,
    loading: Vec<(Option<i64>, CollectionElement)>,
    initialized: bool,
    reading: bool,
    dirty: bool,
}

/// A collection-valued property's wrapper.
///
/// Clones share state. Read accessors fail with a lazy-initialization error
/// until the collection has been initialized.
#[derive(Clone)]
pub struct PersistentCollection(Arc<RwLock<CollectionState>>);

impl PersistentCollection {
    /// An empty, initialized collection owned by nothing yet.
    #[must_use]
    pub fn new(role: impl Into<String>, kind: CollectionKind) -> Self {
        Self::with_elements(role, kind, Vec::new())
    }

    #[must_use]
    pub fn with_elements(
        role: impl Into<String>,
        kind: CollectionKind,
        elements: Vec<CollectionElement>,
    ) -> Self {
        Self::from_state(CollectionState {
            role: role.into(),
            kind,
            owner: None,
            elements,
            loading: Vec::new(),
            initialized: true,
            reading: false,
            dirty: false,
        })
    }

    pub(crate) fn uninitialized(role: impl Into<String>, kind: CollectionKind, owner: EntityKey) -> Self {
        Self::from_state(CollectionState {
            role: role.into(),
            kind,
            owner: Some(owner),
            elements: Vec::new(),
            loading: Vec::new(),
            initialized: false,
            reading: false,
            dirty: false,
        })
    }

    fn from_state(state: CollectionState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn role(&self) -> String {
        self.read().role.clone()
    }

    pub fn kind(&self) -> CollectionKind {
        self.read().kind
    }

    pub fn owner_key(&self) -> Option<EntityKey> {
        self.read().owner.clone()
    }

    pub(crate) fn set_owner(&self, role: &str, owner: EntityKey) {
        let mut state = self.write();
        role.clone_into(&mut state.role);
        state.owner = Some(owner);
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Elements are currently being read by a load.
    pub fn is_loading(&self) -> bool {
        self.read().reading
    }

    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    pub(crate) fn clear_dirty(&self) {
        self.write().dirty = false;
    }

    pub fn ptr_eq(&self, other: &PersistentCollection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    fn require_initialized(state: &CollectionState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }
        Err(Error::LazyInitialization(LazyInitializationError {
            kind: LazyInitializationErrorKind::UninitializedCollection,
            entity_name: state
                .owner
                .as_ref()
                .map(|k| k.entity_name().to_string())
                .unwrap_or_default(),
            identifier: state.owner.as_ref().map(|k| k.identifier().clone()),
            role: Some(state.role.clone()),
        }))
    }

    pub fn elements(&self) -> Result<Vec<CollectionElement>> {
        let state = self.read();
        Self::require_initialized(&state)?;
        Ok(state.elements.clone())
    }

    /// Entity elements.
    pub fn entities(&self) -> Result<Vec<EntityHandle>> {
        Ok(self
            .elements()?
            .into_iter()
            .filter_map(|e| match e {
                CollectionElement::Entity(handle) => Some(handle),
                CollectionElement::Basic(_) => None,
            })
            .collect())
    }

    /// Basic-value elements.
    pub fn values(&self) -> Result<Vec<Value>> {
        Ok(self
            .elements()?
            .into_iter()
            .filter_map(|e| match e {
                CollectionElement::Basic(value) => Some(value),
                CollectionElement::Entity(_) => None,
            })
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        let state = self.read();
        Self::require_initialized(&state)?;
        Ok(state.elements.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, element: &CollectionElement) -> Result<bool> {
        let state = self.read();
        Self::require_initialized(&state)?;
        Ok(state.elements.iter().any(|e| e.same_as(element)))
    }

    /// Append an element. Sets ignore duplicates and return `false`.
    pub fn push(&self, element: impl Into<CollectionElement>) -> Result<bool> {
        let element = element.into();
        let mut state = self.write();
        Self::require_initialized(&state)?;
        if state.kind == CollectionKind::Set && state.elements.iter().any(|e| e.same_as(&element)) {
            return Ok(false);
        }
        state.elements.push(element);
        state.dirty = true;
        Ok(true)
    }

    /// Remove the first matching element.
    pub fn remove(&self, element: &CollectionElement) -> Result<bool> {
        let mut state = self.write();
        Self::require_initialized(&state)?;
        let Some(position) = state.elements.iter().position(|e| e.same_as(element)) else {
            return Ok(false);
        };
        state.elements.remove(position);
        state.dirty = true;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.write();
        Self::require_initialized(&state)?;
        if !state.elements.is_empty() {
            state.elements.clear();
            state.dirty = true;
        }
        Ok(())
    }

    /// Replace every element.
    pub fn set_elements(&self, elements: Vec<CollectionElement>) -> Result<()> {
        let mut state = self.write();
        Self::require_initialized(&state)?;
        state.elements = elements;
        state.dirty = true;
        Ok(())
    }

    /// Elements regardless of initialization, for flush.
    pub(crate) fn raw_elements(&self) -> Vec<CollectionElement> {
        self.read().elements.clone()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    pub(crate) fn begin_read(&self) {
        let mut state = self.write();
        state.reading = true;
        state.loading.clear();
    }

    /// Buffer one element read from a row.
    ///
    /// A row fan-out repeats elements; entity elements and set values are
    /// buffered once, indexed kinds once per index.
    pub(crate) fn read_element(&self, index: Option<i64>, element: CollectionElement) {
        let mut state = self.write();
        if !state.reading {
            return;
        }
        let duplicate = if state.kind.is_indexed() {
            index.is_some() && state.loading.iter().any(|(i, _)| *i == index)
        } else {
            match &element {
                CollectionElement::Entity(_) => state.loading.iter().any(|(_, e)| e.same_as(&element)),
                CollectionElement::Basic(_) => {
                    state.kind == CollectionKind::Set
                        && state.loading.iter().any(|(_, e)| e.same_as(&element))
                }
            }
        };
        if !duplicate {
            state.loading.push((index, element));
        }
    }

    /// Publish the buffered elements and mark the collection initialized.
    pub(crate) fn end_read(&self) {
        let mut state = self.write();
        if !state.reading {
            return;
        }
        let mut loaded = std::mem::take(&mut state.loading);
        if state.kind.is_indexed() {
            loaded.sort_by_key(|(index, _)| index.unwrap_or(i64::MAX));
        }
        state.elements = loaded.into_iter().map(|(_, e)| e).collect();
        state.initialized = true;
        state.reading = false;
        state.dirty = false;
    }

    /// Drop the buffered elements; the collection stays uninitialized.
    pub(crate) fn abort_read(&self) {
        let mut state = self.write();
        state.loading.clear();
        state.reading = false;
    }
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(state) => f
                .debug_struct("PersistentCollection")
                .field("role", &state.role)
                .field("owner", &state.owner)
                .field("initialized", &state.initialized)
                .field("len", &state.elements.len())
                .field("dirty", &state.dirty)
                .finish(),
            Err(_) => f.write_str("PersistentCollection(<locked>)"),
        }
    }
}

/// Persistence-context bookkeeping for one collection wrapper.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    role: String,
    owner: EntityKey,
    /// Owner identifier the database rows are keyed by; `None` until first flushed.
    loaded_key: Option<Value>,
    snapshot: Option<Vec<SnapshotElement>>,
    initialized: bool,
    pub(crate) dorecreate: bool,
    pub(crate) doremove: bool,
    pub(crate) doupdate: bool,
}

impl CollectionEntry {
    /// Entry for a wrapper whose rows exist but have not been read.
    pub fn uninitialized(role: impl Into<String>, owner: EntityKey) -> Self {
        let loaded_key = Some(owner.identifier().clone());
        Self {
            role: role.into(),
            owner,
            loaded_key,
            snapshot: None,
            initialized: false,
            dorecreate: false,
            doremove: false,
            doupdate: false,
        }
    }

    /// Entry for a wrapper created in memory and not yet written.
    pub fn new_collection(role: impl Into<String>, owner: EntityKey) -> Self {
        Self {
            role: role.into(),
            owner,
            loaded_key: None,
            snapshot: Some(Vec::new()),
            initialized: true,
            dorecreate: false,
            doremove: false,
            doupdate: false,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn owner(&self) -> &EntityKey {
        &self.owner
    }

    pub fn loaded_key(&self) -> Option<&Value> {
        self.loaded_key.as_ref()
    }

    pub fn snapshot(&self) -> Option<&[SnapshotElement]> {
        self.snapshot.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Never written to the database.
    pub fn is_new(&self) -> bool {
        self.loaded_key.is_none()
    }

    /// Record the snapshot taken when the elements were read.
    pub(crate) fn post_initialize(&mut self, snapshot: Vec<SnapshotElement>) {
        self.snapshot = Some(snapshot);
        self.initialized = true;
    }

    pub(crate) fn post_flush(&mut self, snapshot: Option<Vec<SnapshotElement>>) {
        if let Some(snapshot) = snapshot {
            self.snapshot = Some(snapshot);
        }
        self.loaded_key = Some(self.owner.identifier().clone());
        self.dorecreate = false;
        self.doremove = false;
        self.doupdate = false;
    }

    /// Snapshot entities missing from `current`.
    pub fn orphans(&self, current: &[SnapshotElement]) -> Vec<SnapshotElement> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        snapshot
            .iter()
            .filter(|old| matches!(old, SnapshotElement::Entity { .. }))
            .filter(|old| !current.iter().any(|new| new.same_as(old)))
            .cloned()
            .collect()
    }
}
