//! Load plans: the SQL of one load query plus the reference descriptors the
//! row reader needs to turn each result row back into entities and
//! collection elements.

use hibernate_core::{CollectionKind, Value};

use crate::association::OuterJoinableAssociation;

/// Resolution of an entity key from a result row.
pub trait KeyResolvable {
    fn identifier_aliases(&self) -> &[String];

    /// References fetched through this reference's composite identifier.
    /// Their keys are resolved before this one.
    fn identifier_fetches(&self) -> &[usize];
}

/// Reading an entity's column state from a result row.
pub trait Hydratable {
    fn entity_name(&self) -> &str;

    /// Result-set aliases of property `property`; empty for collections and
    /// inverse one-to-ones.
    fn property_aliases(&self, property: usize) -> &[String];

    fn version_alias(&self) -> Option<&str>;
}

/// How an entity reference is reached from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitySource {
    Root,
    /// To-one property `property` of entity reference `owner`.
    ToOne { owner: usize, property: usize },
    /// Key-many-to-one component `component` of entity reference `owner`.
    IdentifierComponent { owner: usize, component: usize },
    /// Elements of collection reference `collection`.
    CollectionElement { collection: usize },
}

/// An entity produced by each row of a load query.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReferenceDef {
    pub entity_name: String,
    pub alias: String,
    pub suffix: String,
    pub source: EntitySource,
    /// Edge that joined this reference; `None` for the root and for
    /// elements of a root collection.
    pub association: Option<usize>,
    pub identifier_aliases: Vec<String>,
    pub property_aliases: Vec<Vec<String>>,
    pub version_alias: Option<String>,
    pub identifier_fetches: Vec<usize>,
    /// Outer-joined: a row may carry no instance for this reference.
    pub nullable: bool,
}

impl KeyResolvable for EntityReferenceDef {
    fn identifier_aliases(&self) -> &[String] {
        &self.identifier_aliases
    }

    fn identifier_fetches(&self) -> &[usize] {
        &self.identifier_fetches
    }
}

impl Hydratable for EntityReferenceDef {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn property_aliases(&self, property: usize) -> &[String] {
        self.property_aliases
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn version_alias(&self) -> Option<&str> {
        self.version_alias.as_deref()
    }
}

/// Element columns of a collection reference.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionElementDef {
    /// Entity elements: the identifier is always readable from the row; the
    /// element's own columns only when `reference` is set.
    Entity {
        entity_name: String,
        reference: Option<usize>,
        id_aliases: Vec<String>,
    },
    Basic { alias: String },
}

/// A collection whose elements are produced by the rows of a load query.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReferenceDef {
    pub role: String,
    pub kind: CollectionKind,
    pub alias: String,
    pub suffix: String,
    /// Entity reference holding the owner; `None` when the collection is the
    /// root of the plan.
    pub owner: Option<usize>,
    pub association: Option<usize>,
    pub key_aliases: Vec<String>,
    pub index_alias: Option<String>,
    pub element: CollectionElementDef,
}

/// What a plan's rows primarily load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRoot {
    /// Entity reference 0.
    Entity,
    /// Collection reference 0, for owners identified by its key columns.
    Collection,
}

/// A generated load query and the descriptors needed to read its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub(crate) root: PlanRoot,
    pub(crate) root_alias: String,
    pub(crate) entity_references: Vec<EntityReferenceDef>,
    pub(crate) collection_references: Vec<CollectionReferenceDef>,
    pub(crate) associations: Vec<OuterJoinableAssociation>,
    pub(crate) sql: String,
    pub(crate) leading_params: Vec<Value>,
    pub(crate) trailing_params: Vec<Value>,
}

impl LoadPlan {
    pub fn root(&self) -> PlanRoot {
        self.root
    }

    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn entity_references(&self) -> &[EntityReferenceDef] {
        &self.entity_references
    }

    pub fn entity_reference(&self, index: usize) -> Option<&EntityReferenceDef> {
        self.entity_references.get(index)
    }

    pub fn collection_references(&self) -> &[CollectionReferenceDef] {
        &self.collection_references
    }

    pub fn associations(&self) -> &[OuterJoinableAssociation] {
        &self.associations
    }

    /// The root entity reference of an entity plan.
    pub fn root_entity(&self) -> Option<&EntityReferenceDef> {
        match self.root {
            PlanRoot::Entity => self.entity_references.first(),
            PlanRoot::Collection => None,
        }
    }

    /// Full parameter list: join-condition parameters, then the caller's
    /// restriction parameters, then root filter parameters.
    pub fn bind(&self, params: &[Value]) -> Vec<Value> {
        let mut bound =
            Vec::with_capacity(self.leading_params.len() + params.len() + self.trailing_params.len());
        bound.extend(self.leading_params.iter().cloned());
        bound.extend(params.iter().cloned());
        bound.extend(self.trailing_params.iter().cloned());
        bound
    }

    /// Number of joined collection references.
    pub fn joined_collection_count(&self) -> usize {
        self.associations.iter().filter(|a| a.is_collection()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_orders_params() {
        let plan = LoadPlan {
            root: PlanRoot::Entity,
            root_alias: "a0_".into(),
            entity_references: Vec::new(),
            collection_references: Vec::new(),
            associations: Vec::new(),
            sql: String::new(),
            leading_params: vec![Value::BigInt(1)],
            trailing_params: vec![Value::BigInt(3)],
        };
        assert_eq!(
            plan.bind(&[Value::BigInt(2)]),
            vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)]
        );
        assert!(plan.root_entity().is_none());
    }

    #[test]
    fn test_property_aliases_out_of_range() {
        let def = EntityReferenceDef {
            entity_name: "A".into(),
            alias: "a0_".into(),
            suffix: "0_".into(),
            source: EntitySource::Root,
            association: None,
            identifier_aliases: vec!["id_0_".into()],
            property_aliases: vec![vec!["x_0_".into()]],
            version_alias: None,
            identifier_fetches: Vec::new(),
            nullable: false,
        };
        assert_eq!(def.property_aliases(0), &["x_0_".to_string()]);
        assert!(def.property_aliases(5).is_empty());
        assert_eq!(Hydratable::entity_name(&def), "A");
    }
}
