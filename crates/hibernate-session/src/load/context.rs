//! Per-load processing state.

use std::collections::{HashMap, HashSet};

use hibernate_core::{CollectionKey, EntityKey, Value};

use super::{LoadOptions, LogicalRow};
use crate::cache::CacheEntry;
use crate::collection::{CollectionElement, PersistentCollection};
use crate::instance::EntityRef;

/// Column state of one property as read from a row, before resolution.
#[derive(Debug, Clone)]
pub enum HydratedValue {
    Basic(Value),
    /// Owning to-one, not joined: the foreign key identifier.
    ForeignKey(Option<Value>),
    /// To-one resolved by a joined reference of the same row.
    Joined {
        foreign_key: Option<Value>,
        target: Option<EntityRef>,
    },
    /// Inverse one-to-one, not joined: resolved by unique key.
    InverseOneToOne,
    Collection,
}

impl HydratedValue {
    /// The value kept in the entry's loaded state.
    pub fn loaded_value(&self) -> Value {
        match self {
            HydratedValue::Basic(value) => value.clone(),
            HydratedValue::ForeignKey(Some(id))
            | HydratedValue::Joined {
                foreign_key: Some(id),
                ..
            } => id.clone(),
            _ => Value::Null,
        }
    }
}

/// An entity created by the current load, awaiting initialization.
#[derive(Debug, Clone)]
pub struct HydratedEntityRegistration {
    /// Entity reference of the plan that produced it; `None` for cache assembly.
    pub reference: Option<usize>,
    pub key: EntityKey,
    pub instance: EntityRef,
    pub hydrated_state: Vec<HydratedValue>,
    pub version: Option<Value>,
    /// The instance was already managed and is being refreshed.
    pub refresh: bool,
}

/// Element buffered for a loading collection.
#[derive(Debug, Clone)]
pub(crate) enum PendingElement {
    Ready(CollectionElement),
    /// Entity element known only by key; resolved during finalize.
    Key(EntityKey),
}

#[derive(Debug)]
pub(crate) struct LoadingCollection {
    pub key: CollectionKey,
    pub collection: PersistentCollection,
    /// Created and registered by this load.
    pub created: bool,
    pub elements: Vec<(Option<i64>, PendingElement)>,
    /// Published to the persistence context.
    pub finished: bool,
}

/// State of one in-progress load.
#[derive(Debug, Default)]
pub(crate) struct LoadContext {
    pub options: LoadOptions,
    pub registrations: Vec<HydratedEntityRegistration>,
    by_key: HashMap<EntityKey, usize>,
    pub loading: Vec<LoadingCollection>,
    loading_by_key: HashMap<CollectionKey, usize>,
    ignored: HashSet<CollectionKey>,
    pub results: Vec<LogicalRow>,
    /// Distinct keys of root entities, in result order.
    pub root_keys: Vec<EntityKey>,
    seen_roots: HashSet<EntityKey>,
    pub cache_puts: Vec<(EntityKey, CacheEntry)>,
    pub callback_failures: u64,
}

impl LoadContext {
    pub fn new(options: LoadOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn registration(&self, key: &EntityKey) -> Option<&HydratedEntityRegistration> {
        self.by_key.get(key).map(|&i| &self.registrations[i])
    }

    pub fn register(&mut self, registration: HydratedEntityRegistration) -> usize {
        let index = self.registrations.len();
        self.by_key.insert(registration.key.clone(), index);
        self.registrations.push(registration);
        index
    }

    /// The instance being refreshed, when `key` addresses it.
    pub fn refresh_target(&self, key: &EntityKey, managed: Option<&EntityRef>) -> Option<EntityRef> {
        let target = self.options.refresh.as_ref()?;
        managed
            .filter(|m| m.ptr_eq(target))
            .map(|_| target.clone())
            .filter(|_| !self.by_key.contains_key(key))
    }

    pub fn loading_collection(&self, key: &CollectionKey) -> Option<PersistentCollection> {
        self.loading_by_key
            .get(key)
            .map(|&i| self.loading[i].collection.clone())
    }

    pub fn is_tracked(&self, key: &CollectionKey) -> bool {
        self.loading_by_key.contains_key(key) || self.ignored.contains(key)
    }

    pub fn is_ignored(&self, key: &CollectionKey) -> bool {
        self.ignored.contains(key)
    }

    pub fn ignore(&mut self, key: CollectionKey) {
        self.ignored.insert(key);
    }

    pub fn add_loading(&mut self, key: CollectionKey, collection: PersistentCollection, created: bool) {
        collection.begin_read();
        self.loading_by_key.insert(key.clone(), self.loading.len());
        self.loading.push(LoadingCollection {
            key,
            collection,
            created,
            elements: Vec::new(),
            finished: false,
        });
    }

    pub fn add_root(&mut self, key: &EntityKey) {
        if self.seen_roots.insert(key.clone()) {
            self.root_keys.push(key.clone());
        }
    }

    pub fn push_element(&mut self, key: &CollectionKey, index: Option<i64>, element: PendingElement) {
        if let Some(&i) = self.loading_by_key.get(key) {
            self.loading[i].elements.push((index, element));
        }
    }

    /// Indices of loading collections, arrays first.
    pub fn finish_order(&self) -> Vec<usize> {
        let (arrays, others): (Vec<usize>, Vec<usize>) =
            (0..self.loading.len()).partition(|&i| self.loading[i].collection.kind().is_array());
        arrays.into_iter().chain(others).collect()
    }
}
