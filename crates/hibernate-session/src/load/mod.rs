//! Two-phase loading of result sets into object graphs.
//!
//! A load runs a [`LoadPlan`](hibernate_loader::LoadPlan) and processes its
//! rows in two phases:
//!
//! 1. **Read** ([`reader`]): for every row, resolve the key of each entity
//!    reference, reuse instances that are already known, register new ones as
//!    `LOADING`, hydrate their column state without touching properties, and
//!    buffer collection elements. Nothing in this phase loads anything else.
//! 2. **Finalize** ([`two_phase`]): once the cursor is exhausted, initialize
//!    each new entity exactly once (resolving to-one references, possibly
//!    through nested loads), publish the buffered collections, then run
//!    post-load listeners and after-load actions.
//!
//! A driver error during phase 1 unwinds everything the load registered.

mod context;
mod reader;
mod two_phase;

pub use context::{HydratedEntityRegistration, HydratedValue};

use hibernate_core::{CollectionKey, Value};

use crate::instance::EntityRef;

/// How each result row is turned into a logical row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RowShape {
    /// The root entity reference.
    #[default]
    Entity,
    /// Every entity reference of the plan, in plan order.
    Tuple,
    /// Raw values of the given result-set aliases.
    Scalar(Vec<String>),
}

/// One assembled result row.
#[derive(Debug, Clone)]
pub enum LogicalRow {
    Entity(Option<EntityRef>),
    Tuple(Vec<Option<EntityRef>>),
    Scalar(Vec<Value>),
}

impl LogicalRow {
    pub fn into_entity(self) -> Option<EntityRef> {
        match self {
            LogicalRow::Entity(entity) => entity,
            LogicalRow::Tuple(mut entities) if !entities.is_empty() => entities.swap_remove(0),
            LogicalRow::Tuple(_) | LogicalRow::Scalar(_) => None,
        }
    }
}

/// Per-load options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Overrides the session default for entities this load creates.
    pub read_only: Option<bool>,
    pub shape: RowShape,
    /// Re-read state into this managed instance instead of reusing it.
    pub refresh: Option<EntityRef>,
    /// Collections the load initializes even when no row mentions them.
    pub collection_keys: Vec<CollectionKey>,
}

impl LoadOptions {
    #[must_use]
    pub fn read_only(mut self, read_only: Option<bool>) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn shape(mut self, shape: RowShape) -> Self {
        self.shape = shape;
        self
    }

    #[must_use]
    pub fn refresh(mut self, target: EntityRef) -> Self {
        self.refresh = Some(target);
        self
    }

    #[must_use]
    pub fn collection_keys(mut self, keys: Vec<CollectionKey>) -> Self {
        self.collection_keys = keys;
        self
    }
}

/// Column parameters of an identifier, with composite and key-many-to-one
/// components flattened in column order.
pub(crate) fn identifier_params(identifier: &Value) -> Vec<Value> {
    match identifier {
        Value::Array(components) => components.iter().flat_map(identifier_params).collect(),
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_params_flatten_nested_components() {
        let id = Value::Array(vec![
            Value::BigInt(1),
            Value::Array(vec![Value::Text("a".into()), Value::BigInt(2)]),
        ]);
        assert_eq!(
            identifier_params(&id),
            vec![Value::BigInt(1), Value::Text("a".into()), Value::BigInt(2)]
        );
        assert_eq!(identifier_params(&Value::BigInt(7)), vec![Value::BigInt(7)]);
    }
}
