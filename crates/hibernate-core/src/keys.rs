//! Identity keys for managed entities and collections.
//!
//! An [`EntityKey`] is the only token used to look up a managed instance in a
//! persistence context. Keys are immutable; equality and hashing cover every
//! field, with identifier values compared by identity (see
//! [`Value::same_identity`]).

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Entity type plus identifier value (plus tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityKey {
    entity_name: String,
    identifier: Value,
    tenant_id: Option<String>,
}

impl EntityKey {
    /// Create a key for an entity identifier.
    #[must_use]
    pub fn new(entity_name: impl Into<String>, identifier: &Value) -> Self {
        Self {
            entity_name: entity_name.into(),
            identifier: identifier.normalized(),
            tenant_id: None,
        }
    }

    /// Scope the key to a tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn identifier(&self) -> &Value {
        &self.identifier
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.tenant_id == other.tenant_id
            && self.identifier.same_identity(&other.identifier)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.tenant_id.hash(state);
        self.identifier.hash_identity(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey[{}#{:?}]", self.entity_name, self.identifier)
    }
}

/// Collection role plus owner identifier.
#[derive(Debug, Clone)]
pub struct CollectionKey {
    role: String,
    owner_identifier: Value,
}

impl CollectionKey {
    #[must_use]
    pub fn new(role: impl Into<String>, owner_identifier: &Value) -> Self {
        Self {
            role: role.into(),
            owner_identifier: owner_identifier.normalized(),
        }
    }

    /// Role name, `Entity.property`.
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn owner_identifier(&self) -> &Value {
        &self.owner_identifier
    }
}

impl PartialEq for CollectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role && self.owner_identifier.same_identity(&other.owner_identifier)
    }
}

impl Eq for CollectionKey {}

impl Hash for CollectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.owner_identifier.hash_identity(state);
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionKey[{}#{:?}]", self.role, self.owner_identifier)
    }
}

/// Lookup token for an entity addressed by a unique, non-primary property.
#[derive(Debug, Clone)]
pub struct EntityUniqueKey {
    entity_name: String,
    property: String,
    value: Value,
    tenant_id: Option<String>,
}

impl EntityUniqueKey {
    #[must_use]
    pub fn new(
        entity_name: impl Into<String>,
        property: impl Into<String>,
        value: &Value,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            property: property.into(),
            value: value.normalized(),
            tenant_id,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for EntityUniqueKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.property == other.property
            && self.tenant_id == other.tenant_id
            && self.value.same_identity(&other.value)
    }
}

impl Eq for EntityUniqueKey {}

impl Hash for EntityUniqueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.property.hash(state);
        self.tenant_id.hash(state);
        self.value.hash_identity(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_entity_key_equality_covers_all_fields() {
        let a = EntityKey::new("Item", &Value::Int(1));
        let b = EntityKey::new("Item", &Value::BigInt(1));
        let c = EntityKey::new("Order", &Value::BigInt(1));
        let d = EntityKey::new("Item", &Value::BigInt(1)).with_tenant(Some("t1".into()));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, d);

        let mut map = HashMap::new();
        map.insert(a, "first");
        assert_eq!(map.get(&b), Some(&"first"));
        assert!(map.get(&d).is_none());
    }

    #[test]
    fn test_collection_key_identity() {
        let a = CollectionKey::new("Order.lines", &Value::Int(9));
        let b = CollectionKey::new("Order.lines", &Value::BigInt(9));
        let c = CollectionKey::new("Order.notes", &Value::BigInt(9));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.role(), "Order.lines");
    }

    #[test]
    fn test_unique_key_identity() {
        let a = EntityUniqueKey::new("Ing", "reference", &Value::Int(1), None);
        let b = EntityUniqueKey::new("Ing", "reference", &Value::BigInt(1), None);
        assert_eq!(a, b);
        assert_eq!(a.property(), "reference");
    }
}
