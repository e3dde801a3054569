//! Entity persisters: read-only mapping metadata for one entity type.
//!
//! A persister describes the table, identifier, version and properties of an
//! entity. It is produced once by [`PersisterBuilder`], validated against the
//! rest of the model by [`crate::Metamodel`], and then shared as
//! `Arc<EntityPersister>` by every session of a factory.
//!
//! # Example
//!
//! ```ignore
//! let ed = EntityPersister::builder("Ed", "ed")
//!     .identifier("id", "id")
//!     .basic("data", "data")
//!     .to_one("ing", ToOneMapping::one_to_one_mapped_by("Ing", "reference"))
//!     .build()?;
//! ```

use std::collections::HashSet;

use crate::association::{CollectionMapping, ToOneMapping};
use crate::cascade_style::{CascadeAction, CascadeStyle};
use crate::error::{Error, Result};

/// How identifiers are produced for new instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdGenerator {
    /// The application sets the identifier before persisting.
    #[default]
    Assigned,
    /// `max(id) + 1`, seeded once per factory.
    Increment,
    /// Random v4 UUID rendered as text.
    Uuid,
}

/// One component of a composite identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum IdComponent {
    Basic {
        name: String,
        column: String,
    },
    /// A component that is itself a reference to another entity's identifier.
    KeyManyToOne {
        name: String,
        target: String,
        columns: Vec<String>,
        join_fetch: bool,
    },
}

impl IdComponent {
    pub fn name(&self) -> &str {
        match self {
            IdComponent::Basic { name, .. } | IdComponent::KeyManyToOne { name, .. } => name,
        }
    }

    pub fn columns(&self) -> Vec<String> {
        match self {
            IdComponent::Basic { column, .. } => vec![column.clone()],
            IdComponent::KeyManyToOne { columns, .. } => columns.clone(),
        }
    }
}

/// Identifier mapping: simple (one column) or composite.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierMapping {
    pub name: String,
    pub columns: Vec<String>,
    /// Empty for a simple identifier.
    pub components: Vec<IdComponent>,
}

impl IdentifierMapping {
    pub fn is_composite(&self) -> bool {
        !self.components.is_empty()
    }
}

/// Optimistic-lock version column.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMapping {
    pub name: String,
    pub column: String,
}

/// What a property holds.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Basic { column: String },
    ToOne(ToOneMapping),
    Collection(CollectionMapping),
}

/// A mapped, non-identifier property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMapping {
    pub name: String,
    pub kind: PropertyKind,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
}

impl PropertyMapping {
    /// Columns this property owns on the entity's table.
    pub fn columns(&self) -> &[String] {
        match &self.kind {
            PropertyKind::Basic { column } => std::slice::from_ref(column),
            PropertyKind::ToOne(mapping) => &mapping.columns,
            PropertyKind::Collection(_) => &[],
        }
    }

    pub fn as_to_one(&self) -> Option<&ToOneMapping> {
        match &self.kind {
            PropertyKind::ToOne(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionMapping> {
        match &self.kind {
            PropertyKind::Collection(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection(_))
    }

    /// Cascade style of an association property; `NONE` for basics.
    pub fn cascade_style(&self) -> CascadeStyle {
        match &self.kind {
            PropertyKind::Basic { .. } => CascadeStyle::NONE,
            PropertyKind::ToOne(mapping) => mapping.cascade,
            PropertyKind::Collection(mapping) => mapping.cascade,
        }
    }

    pub fn orphan_removal(&self) -> bool {
        match &self.kind {
            PropertyKind::Basic { .. } => false,
            PropertyKind::ToOne(mapping) => mapping.orphan_removal || mapping.cascade.delete_orphan,
            PropertyKind::Collection(mapping) => {
                mapping.orphan_removal || mapping.cascade.delete_orphan
            }
        }
    }
}

/// When, relative to the entity's own row operation, an association cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// To-one targets: before insert, after delete.
    BeforeInsertAfterDelete,
    /// Collections: after insert, before delete.
    AfterInsertBeforeDelete,
}

/// An association eligible for a cascade action.
#[derive(Debug, Clone, Copy)]
pub struct CascadedAssociation<'a> {
    pub index: usize,
    pub property: &'a PropertyMapping,
    pub point: CascadePoint,
}

/// Capability of exposing cascadable associations.
pub trait Cascadable {
    /// Associations whose style enables `action`, or that remove orphans.
    fn cascaded_associations(&self, action: CascadeAction) -> Vec<CascadedAssociation<'_>>;
}

/// Mapping metadata for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPersister {
    entity_name: String,
    class_name: String,
    proxy_interfaces: Vec<String>,
    table: String,
    identifier: IdentifierMapping,
    generator: IdGenerator,
    properties: Vec<PropertyMapping>,
    version: Option<VersionMapping>,
    lazy: bool,
    mutable: bool,
    dynamic_update: bool,
    batch_size: Option<usize>,
    cacheable: bool,
    filters: Vec<crate::association::FilterMapping>,
}

impl EntityPersister {
    /// Start building a persister for `entity_name` stored in `table`.
    #[must_use]
    pub fn builder(entity_name: impl Into<String>, table: impl Into<String>) -> PersisterBuilder {
        PersisterBuilder::new(entity_name.into(), table.into())
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Class information recorded in serialized proxies.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn proxy_interfaces(&self) -> &[String] {
        &self.proxy_interfaces
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identifier(&self) -> &IdentifierMapping {
        &self.identifier
    }

    pub fn identifier_columns(&self) -> &[String] {
        &self.identifier.columns
    }

    pub fn generator(&self) -> IdGenerator {
        self.generator
    }

    pub fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> &PropertyMapping {
        &self.properties[index]
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Look up a property index, failing with a mapping error.
    pub fn require_property(&self, name: &str) -> Result<usize> {
        self.property_index(name).ok_or_else(|| {
            Error::mapping(Some(&self.entity_name), Some(name), "unknown property")
        })
    }

    pub fn version(&self) -> Option<&VersionMapping> {
        self.version.as_ref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Whether uninitialized references to this entity may be proxied.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_dynamic_update(&self) -> bool {
        self.dynamic_update
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn filters(&self) -> &[crate::association::FilterMapping] {
        &self.filters
    }

    /// Role name for a collection property.
    pub fn role(&self, property: &str) -> String {
        format!("{}.{}", self.entity_name, property)
    }

    /// Indices of collection properties.
    pub fn collection_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_collection())
            .map(|(i, _)| i)
    }

    pub(crate) fn properties_mut(&mut self) -> &mut [PropertyMapping] {
        &mut self.properties
    }
}

impl Cascadable for EntityPersister {
    fn cascaded_associations(&self, action: CascadeAction) -> Vec<CascadedAssociation<'_>> {
        self.properties
            .iter()
            .enumerate()
            .filter_map(|(index, property)| {
                let point = match &property.kind {
                    PropertyKind::Basic { .. } => return None,
                    PropertyKind::ToOne(_) => CascadePoint::BeforeInsertAfterDelete,
                    PropertyKind::Collection(_) => CascadePoint::AfterInsertBeforeDelete,
                };
                let style = property.cascade_style();
                let enabled = style.does_cascade(action)
                    || (action == CascadeAction::Delete && property.orphan_removal());
                enabled.then_some(CascadedAssociation {
                    index,
                    property,
                    point,
                })
            })
            .collect()
    }
}

/// Builder for [`EntityPersister`].
#[derive(Debug)]
pub struct PersisterBuilder {
    persister: EntityPersister,
}

impl PersisterBuilder {
    fn new(entity_name: String, table: String) -> Self {
        Self {
            persister: EntityPersister {
                class_name: entity_name.clone(),
                entity_name,
                proxy_interfaces: Vec::new(),
                table,
                identifier: IdentifierMapping {
                    name: String::new(),
                    columns: Vec::new(),
                    components: Vec::new(),
                },
                generator: IdGenerator::Assigned,
                properties: Vec::new(),
                version: None,
                lazy: true,
                mutable: true,
                dynamic_update: false,
                batch_size: None,
                cacheable: false,
                filters: Vec::new(),
            },
        }
    }

    /// Simple single-column identifier.
    #[must_use]
    pub fn identifier(mut self, name: &str, column: &str) -> Self {
        self.persister.identifier = IdentifierMapping {
            name: name.to_string(),
            columns: vec![column.to_string()],
            components: Vec::new(),
        };
        self
    }

    /// Composite identifier built from components.
    #[must_use]
    pub fn composite_identifier(mut self, name: &str, components: Vec<IdComponent>) -> Self {
        let columns = components.iter().flat_map(IdComponent::columns).collect();
        self.persister.identifier = IdentifierMapping {
            name: name.to_string(),
            columns,
            components,
        };
        self
    }

    #[must_use]
    pub fn generator(mut self, generator: IdGenerator) -> Self {
        self.persister.generator = generator;
        self
    }

    #[must_use]
    pub fn basic(self, name: &str, column: &str) -> Self {
        self.property(PropertyMapping {
            name: name.to_string(),
            kind: PropertyKind::Basic {
                column: column.to_string(),
            },
            nullable: true,
            insertable: true,
            updatable: true,
        })
    }

    #[must_use]
    pub fn to_one(self, name: &str, mapping: ToOneMapping) -> Self {
        let nullable = mapping.optional;
        let writable = !mapping.is_inverse();
        self.property(PropertyMapping {
            name: name.to_string(),
            kind: PropertyKind::ToOne(mapping),
            nullable,
            insertable: writable,
            updatable: writable,
        })
    }

    #[must_use]
    pub fn collection(self, name: &str, mapping: CollectionMapping) -> Self {
        self.property(PropertyMapping {
            name: name.to_string(),
            kind: PropertyKind::Collection(mapping),
            nullable: true,
            insertable: false,
            updatable: false,
        })
    }

    #[must_use]
    pub fn property(mut self, property: PropertyMapping) -> Self {
        self.persister.properties.push(property);
        self
    }

    #[must_use]
    pub fn version(mut self, name: &str, column: &str) -> Self {
        self.persister.version = Some(VersionMapping {
            name: name.to_string(),
            column: column.to_string(),
        });
        self
    }

    #[must_use]
    pub fn class_name(mut self, class_name: &str) -> Self {
        self.persister.class_name = class_name.to_string();
        self
    }

    #[must_use]
    pub fn proxy_interfaces(mut self, interfaces: &[&str]) -> Self {
        self.persister.proxy_interfaces = interfaces.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.persister.lazy = lazy;
        self
    }

    #[must_use]
    pub fn mutable(mut self, mutable: bool) -> Self {
        self.persister.mutable = mutable;
        self
    }

    #[must_use]
    pub fn dynamic_update(mut self, dynamic_update: bool) -> Self {
        self.persister.dynamic_update = dynamic_update;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.persister.batch_size = Some(size);
        self
    }

    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.persister.cacheable = cacheable;
        self
    }

    #[must_use]
    pub fn filter(mut self, name: &str, condition: Option<&str>) -> Self {
        self.persister
            .filters
            .push(crate::association::FilterMapping::new(name, condition));
        self
    }

    /// Validate the persister in isolation and assign collection roles.
    pub fn build(mut self) -> Result<EntityPersister> {
        let entity = self.persister.entity_name.clone();
        if self.persister.identifier.columns.is_empty() {
            return Err(Error::mapping(
                Some(&entity),
                None,
                "entity has no identifier columns",
            ));
        }

        let mut names = HashSet::new();
        for property in &self.persister.properties {
            if !names.insert(property.name.as_str()) || property.name == self.persister.identifier.name
            {
                return Err(Error::mapping(
                    Some(&entity),
                    Some(&property.name),
                    "duplicate property name",
                ));
            }
            if let PropertyKind::ToOne(mapping) = &property.kind {
                if mapping.columns.is_empty() && mapping.mapped_by.is_none() {
                    return Err(Error::mapping(
                        Some(&entity),
                        Some(&property.name),
                        "to-one association needs key columns or mapped_by",
                    ));
                }
            }
        }

        for property in self.persister.properties_mut() {
            if let PropertyKind::Collection(mapping) = &mut property.kind {
                mapping.role = format!("{}.{}", entity, property.name);
                if mapping.key_columns.is_empty() {
                    return Err(Error::mapping(
                        Some(&entity),
                        Some(&property.name),
                        "collection has no key columns",
                    ));
                }
            }
        }

        Ok(self.persister)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::FetchMode;

    fn order_persister() -> EntityPersister {
        EntityPersister::builder("Order", "orders")
            .identifier("id", "id")
            .basic("number", "number")
            .to_one(
                "customer",
                ToOneMapping::many_to_one("Customer", &["customer_id"])
                    .cascade(CascadeStyle::parse("persist").unwrap()),
            )
            .collection(
                "lines",
                CollectionMapping::one_to_many("Line", &["order_id"])
                    .cascade(CascadeStyle::ALL_DELETE_ORPHAN)
                    .fetch(FetchMode::Join),
            )
            .version("version", "version")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_assigns_roles() {
        let persister = order_persister();
        let lines = persister.property(2).as_collection().unwrap();
        assert_eq!(lines.role, "Order.lines");
        assert_eq!(persister.role("lines"), "Order.lines");
        assert_eq!(persister.require_property("number").unwrap(), 0);
        assert!(persister.require_property("missing").is_err());
        assert!(persister.is_versioned());
        assert_eq!(persister.collection_indices().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_cascade_points() {
        let persister = order_persister();
        let persist = persister.cascaded_associations(CascadeAction::Persist);
        assert_eq!(persist.len(), 2);
        assert_eq!(persist[0].point, CascadePoint::BeforeInsertAfterDelete);
        assert_eq!(persist[1].point, CascadePoint::AfterInsertBeforeDelete);

        let delete = persister.cascaded_associations(CascadeAction::Delete);
        assert_eq!(delete.len(), 1);
        assert_eq!(delete[0].property.name, "lines");
    }

    #[test]
    fn test_builder_rejects_bad_mappings() {
        let no_id = EntityPersister::builder("X", "x").basic("a", "a").build();
        assert!(matches!(no_id, Err(Error::Mapping(_))));

        let dup = EntityPersister::builder("X", "x")
            .identifier("id", "id")
            .basic("a", "a")
            .basic("a", "b")
            .build();
        assert!(matches!(dup, Err(Error::Mapping(_))));

        let dangling = EntityPersister::builder("X", "x")
            .identifier("id", "id")
            .to_one("y", ToOneMapping::many_to_one("Y", &[]))
            .build();
        assert!(matches!(dangling, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_composite_identifier_columns() {
        let persister = EntityPersister::builder("LineItem", "line_item")
            .composite_identifier(
                "id",
                vec![
                    IdComponent::KeyManyToOne {
                        name: "order".into(),
                        target: "Order".into(),
                        columns: vec!["order_id".into()],
                        join_fetch: true,
                    },
                    IdComponent::Basic {
                        name: "position".into(),
                        column: "position".into(),
                    },
                ],
            )
            .build()
            .unwrap();
        assert!(persister.identifier().is_composite());
        assert_eq!(persister.identifier_columns(), &["order_id", "position"]);
    }
}
