//! The outer-join walker.
//!
//! Starting from a root entity or collection, the walker visits every
//! association reachable through the mappings and decides, edge by edge,
//! whether to join it into the load query. The decision for an edge is:
//!
//! 1. a per-query override for the edge's path, else
//! 2. an enabled fetch profile naming the association, else
//! 3. the mapping's fetch mode;
//!
//! and an enabled edge is still skipped when it is too deep, when it would be
//! a second joined collection, or when its foreign key was already joined
//! (which is what stops bidirectional associations from cycling).
//!
//! The result is a [`LoadPlan`]: the SQL plus entity and collection reference
//! descriptors in the order the row reader consumes them.

use std::collections::HashSet;

use hibernate_core::{
    CollectionMapping, ElementMapping, EntityPersister, Error, FetchMode, IdComponent, Metamodel,
    PropertyKind, Result, Settings, ToOneKind, Value,
};

use crate::alias::{collection_suffix, column_alias, column_aliases, entity_suffix, generate_alias};
use crate::association::{AssociationKind, OuterJoinableAssociation, merge_outer_joins};
use crate::criteria::Criteria;
use crate::influencers::{LoadQueryInfluencers, NoOverrides, TraversalOverrides};
use crate::join::JoinType;
use crate::plan::{
    CollectionElementDef, CollectionReferenceDef, EntityReferenceDef, EntitySource, LoadPlan,
    PlanRoot,
};

/// Restriction applied to the root entity of an entity plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRestriction {
    /// One parameter per identifier column.
    Identifier,
    /// A batch of `n` identifiers.
    Identifiers(usize),
    /// Equality on a basic or owning to-one property.
    UniqueKey(String),
}

/// Restriction applied to the root collection of a collection plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionRestriction {
    /// A batch of `n` owner keys.
    Keys(usize),
    /// Every owner returned by an earlier query: `sql` selects the owners and
    /// exposes their identifiers under `id_aliases`.
    Subselect { sql: String, id_aliases: Vec<String> },
}

/// Foreign key already joined in the current tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssociationKey {
    table: String,
    columns: Vec<String>,
}

impl AssociationKey {
    fn new(table: &str, columns: &[String]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.to_vec(),
        }
    }
}

/// Builds [`LoadPlan`]s for one metamodel, settings and influencer set.
pub struct JoinWalker<'a> {
    metamodel: &'a Metamodel,
    settings: &'a Settings,
    influencers: &'a LoadQueryInfluencers,
    overrides: &'a dyn TraversalOverrides,
    associations: Vec<OuterJoinableAssociation>,
    visited: HashSet<AssociationKey>,
    entity_references: Vec<EntityReferenceDef>,
    collection_references: Vec<CollectionReferenceDef>,
}

impl<'a> JoinWalker<'a> {
    pub fn new(
        metamodel: &'a Metamodel,
        settings: &'a Settings,
        influencers: &'a LoadQueryInfluencers,
    ) -> Self {
        Self {
            metamodel,
            settings,
            influencers,
            overrides: &NoOverrides,
            associations: Vec::new(),
            visited: HashSet::new(),
            entity_references: Vec::new(),
            collection_references: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: &'a dyn TraversalOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Plan for loading `entity_name` by identifier, identifier batch or unique key.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn entity_plan(mut self, entity_name: &str, restriction: &EntityRestriction) -> Result<LoadPlan> {
        self.influencers.validate()?;
        let persister = self.metamodel.persister(entity_name)?.clone();
        let alias = generate_alias(persister.entity_name(), 0);
        self.walk_root_entity(&persister, &alias)?;

        let mut condition = match restriction {
            EntityRestriction::Identifier => {
                key_condition(&alias, persister.identifier_columns(), 1)
            }
            EntityRestriction::Identifiers(n) => {
                key_condition(&alias, persister.identifier_columns(), *n)
            }
            EntityRestriction::UniqueKey(property) => {
                let index = persister.require_property(property)?;
                let columns = persister.property(index).columns();
                if columns.is_empty() {
                    return Err(Error::mapping(
                        Some(persister.entity_name()),
                        Some(property),
                        "unique key property has no columns",
                    ));
                }
                key_condition(&alias, columns, 1)
            }
        };
        let filters = self.influencers.filter_condition(persister.filters(), &alias)?;
        let trailing = filters.params;
        if !filters.sql.is_empty() {
            condition = format!("{} and {}", condition, filters.sql);
        }
        self.finish(
            PlanRoot::Entity,
            persister.table(),
            &alias,
            &condition,
            Vec::new(),
            trailing,
            None,
        )
    }

    /// Plan for a criteria query; the criteria's fetch overrides steer the walk.
    #[tracing::instrument(level = "trace", skip(self, criteria), fields(entity = criteria.entity_name()))]
    pub fn criteria_plan(mut self, criteria: &'a Criteria) -> Result<LoadPlan> {
        self.influencers.validate()?;
        self.overrides = criteria;
        let persister = self.metamodel.persister(criteria.entity_name())?.clone();
        let alias = generate_alias(persister.entity_name(), 0);
        self.walk_root_entity(&persister, &alias)?;

        let restriction = criteria.render_where(&persister, &alias)?;
        let filters = self.influencers.filter_condition(persister.filters(), &alias)?;
        let combined = restriction.and(filters);
        let condition = if combined.is_empty() {
            "1=1".to_string()
        } else {
            combined.sql
        };
        let order_by = criteria.render_order_by(&persister, &alias)?;
        self.finish(
            PlanRoot::Entity,
            persister.table(),
            &alias,
            &condition,
            combined.params,
            Vec::new(),
            order_by,
        )
    }

    /// Plan for initializing collections of `role` by owner key batch or subselect.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn collection_plan(mut self, role: &str, restriction: &CollectionRestriction) -> Result<LoadPlan> {
        self.influencers.validate()?;
        let (owner, _, mapping) = self.metamodel.collection(role)?;
        let owner = owner.clone();
        let mapping = mapping.clone();
        let alias = generate_alias(&mapping.role, 0);

        self.visited
            .insert(AssociationKey::new(&mapping.table, &mapping.key_columns));
        let collection = self.push_collection_reference(&mapping, &alias, None, None)?;
        self.walk_collection_tree(collection, &mapping, &alias, "", 0)?;
        self.init_owners();

        let mut condition = match restriction {
            CollectionRestriction::Keys(n) => key_condition(&alias, &mapping.key_columns, *n),
            CollectionRestriction::Subselect { sql, id_aliases } => {
                if id_aliases.len() != mapping.key_columns.len() {
                    return Err(Error::mapping(
                        Some(owner.entity_name()),
                        Some(role),
                        "subselect identifier arity does not match the collection key",
                    ));
                }
                let lhs = qualified(&alias, &mapping.key_columns);
                let lhs = if lhs.len() == 1 {
                    lhs.join("")
                } else {
                    format!("({})", lhs.join(", "))
                };
                format!(
                    "{} in (select {} from ({}) subselect_)",
                    lhs,
                    id_aliases.join(", "),
                    sql
                )
            }
        };

        let mut filters = self.influencers.filter_condition(&mapping.filters, &alias)?;
        if mapping.element.is_many_to_many() {
            if let Some(element) = self.associations.first().filter(|a| {
                matches!(a.kind(), AssociationKind::ManyToManyElement { role: r } if *r == mapping.role)
            }) {
                let element_alias = element.rhs_alias().to_string();
                filters = filters.and(
                    self.influencers
                        .filter_condition(&mapping.many_to_many_filters, &element_alias)?,
                );
            }
        }
        if !filters.sql.is_empty() {
            condition = format!("{} and {}", condition, filters.sql);
        }

        let order_by = mapping.render_order_by(&alias);
        self.finish(
            PlanRoot::Collection,
            &mapping.table,
            &alias,
            &condition,
            Vec::new(),
            filters.params,
            order_by,
        )
    }

    fn walk_root_entity(&mut self, persister: &EntityPersister, alias: &str) -> Result<()> {
        let root = self.push_entity_reference(persister, alias, EntitySource::Root, None, false);
        self.walk_entity_tree(root, persister, alias, "", 0)?;
        self.init_owners();
        Ok(())
    }

    fn walk_entity_tree(
        &mut self,
        reference: usize,
        persister: &EntityPersister,
        alias: &str,
        path: &str,
        depth: i64,
    ) -> Result<()> {
        for (index, component) in persister.identifier().components.iter().enumerate() {
            let IdComponent::KeyManyToOne {
                name,
                target,
                columns,
                join_fetch,
            } = component
            else {
                continue;
            };
            let sub_path = append_path(path, name);
            let target_persister = self.metamodel.persister(target)?.clone();
            let join_type = self.join_type(
                &sub_path,
                Some((persister.entity_name(), name)),
                *join_fetch,
                false,
                depth,
                false,
                AssociationKey::new(persister.table(), columns),
            );
            if join_type.is_joined() {
                let fetched = self.add_entity_association(
                    AssociationKind::IdentifierComponent {
                        entity_name: persister.entity_name().to_string(),
                        component: index,
                    },
                    &target_persister,
                    alias,
                    columns.clone(),
                    target_persister.identifier_columns().to_vec(),
                    join_type,
                    &sub_path,
                    depth,
                    EntitySource::IdentifierComponent {
                        owner: reference,
                        component: index,
                    },
                )?;
                self.entity_references[reference]
                    .identifier_fetches
                    .push(fetched);
            }
        }

        for (index, property) in persister.properties().iter().enumerate() {
            let sub_path = append_path(path, &property.name);
            match &property.kind {
                PropertyKind::Basic { .. } => {}
                PropertyKind::ToOne(mapping) => {
                    let target = self.metamodel.persister(&mapping.target)?.clone();
                    let (lhs_columns, rhs_columns, key) = match &mapping.mapped_by {
                        Some(mapped_by) => {
                            let inverse = target.require_property(mapped_by)?;
                            let rhs = target.property(inverse).columns().to_vec();
                            let key = AssociationKey::new(target.table(), &rhs);
                            (persister.identifier_columns().to_vec(), rhs, key)
                        }
                        None => (
                            mapping.columns.clone(),
                            target.identifier_columns().to_vec(),
                            AssociationKey::new(persister.table(), &mapping.columns),
                        ),
                    };
                    let join_type = self.join_type(
                        &sub_path,
                        Some((persister.entity_name(), &property.name)),
                        mapping.fetch == FetchMode::Join,
                        mapping.optional || mapping.is_inverse(),
                        depth,
                        false,
                        key,
                    );
                    if join_type.is_joined() {
                        self.add_entity_association(
                            AssociationKind::ToOne {
                                entity_name: persister.entity_name().to_string(),
                                property: index,
                                one_to_one: mapping.kind == ToOneKind::OneToOne,
                                inverse: mapping.is_inverse(),
                            },
                            &target,
                            alias,
                            lhs_columns,
                            rhs_columns,
                            join_type,
                            &sub_path,
                            depth,
                            EntitySource::ToOne {
                                owner: reference,
                                property: index,
                            },
                        )?;
                    }
                }
                PropertyKind::Collection(mapping) => {
                    let join_type = self.join_type(
                        &sub_path,
                        Some((persister.entity_name(), &property.name)),
                        mapping.fetch == FetchMode::Join,
                        true,
                        depth,
                        true,
                        AssociationKey::new(&mapping.table, &mapping.key_columns),
                    );
                    if join_type.is_joined() {
                        self.add_collection_association(
                            mapping,
                            persister,
                            reference,
                            alias,
                            join_type,
                            &sub_path,
                            depth,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn walk_collection_tree(
        &mut self,
        collection: usize,
        mapping: &CollectionMapping,
        alias: &str,
        path: &str,
        depth: i64,
    ) -> Result<()> {
        match &mapping.element {
            ElementMapping::OneToMany { target } => {
                let target = self.metamodel.persister(target)?.clone();
                let association = self.collection_references[collection].association;
                let element = self.push_entity_reference(
                    &target,
                    alias,
                    EntitySource::CollectionElement { collection },
                    association,
                    true,
                );
                if let CollectionElementDef::Entity {
                    reference,
                    id_aliases,
                    ..
                } = &mut self.collection_references[collection].element
                {
                    *reference = Some(element);
                    id_aliases.clone_from(&self.entity_references[element].identifier_aliases);
                }
                self.walk_entity_tree(element, &target, alias, path, depth)
            }
            ElementMapping::ManyToMany { target, columns } => {
                let target = self.metamodel.persister(target)?.clone();
                // A root many-to-many collection may inner-join its elements.
                let use_inner_join = depth == 0;
                let join_type = self.join_type(
                    path,
                    None,
                    true,
                    !use_inner_join,
                    depth - 1,
                    false,
                    AssociationKey::new(&mapping.table, columns),
                );
                if !join_type.is_joined() {
                    return Ok(());
                }
                let rhs_alias = generate_alias(target.entity_name(), self.associations.len() + 1);
                let on = self
                    .influencers
                    .filter_condition(target.filters(), &rhs_alias)?;
                let element_filter = self
                    .influencers
                    .filter_condition(&mapping.many_to_many_filters, &rhs_alias)?;
                let edge = OuterJoinableAssociation::new(
                    path,
                    AssociationKind::ManyToManyElement {
                        role: mapping.role.clone(),
                    },
                    target.entity_name(),
                    target.table(),
                    join_type,
                    alias,
                    columns.clone(),
                    rhs_alias.as_str(),
                    target.identifier_columns().to_vec(),
                    on,
                    depth - 1,
                )?
                .with_many_to_many_filter(element_filter);
                let edge_index = self.associations.len();
                self.associations.push(edge);

                let element = self.push_entity_reference(
                    &target,
                    &rhs_alias,
                    EntitySource::CollectionElement { collection },
                    Some(edge_index),
                    join_type == JoinType::LeftOuter,
                );
                if let CollectionElementDef::Entity { reference, .. } =
                    &mut self.collection_references[collection].element
                {
                    *reference = Some(element);
                }
                self.walk_entity_tree(element, &target, &rhs_alias, path, depth)
            }
            ElementMapping::Basic { .. } => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_entity_association(
        &mut self,
        kind: AssociationKind,
        target: &EntityPersister,
        lhs_alias: &str,
        lhs_columns: Vec<String>,
        rhs_columns: Vec<String>,
        join_type: JoinType,
        path: &str,
        depth: i64,
        source: EntitySource,
    ) -> Result<usize> {
        let rhs_alias = generate_alias(target.entity_name(), self.associations.len() + 1);
        let on = self
            .influencers
            .filter_condition(target.filters(), &rhs_alias)?;
        let edge = OuterJoinableAssociation::new(
            path,
            kind,
            target.entity_name(),
            target.table(),
            join_type,
            lhs_alias,
            lhs_columns,
            rhs_alias.as_str(),
            rhs_columns,
            on,
            depth,
        )?;
        let edge_index = self.associations.len();
        self.associations.push(edge);

        let reference = self.push_entity_reference(
            target,
            &rhs_alias,
            source,
            Some(edge_index),
            join_type == JoinType::LeftOuter,
        );
        self.walk_entity_tree(reference, target, &rhs_alias, path, depth + 1)?;
        Ok(reference)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_collection_association(
        &mut self,
        mapping: &CollectionMapping,
        owner: &EntityPersister,
        owner_reference: usize,
        lhs_alias: &str,
        join_type: JoinType,
        path: &str,
        depth: i64,
    ) -> Result<()> {
        let rhs_alias = generate_alias(&mapping.role, self.associations.len() + 1);
        let on = self
            .influencers
            .filter_condition(&mapping.filters, &rhs_alias)?;
        let edge = OuterJoinableAssociation::new(
            path,
            AssociationKind::Collection {
                role: mapping.role.clone(),
                many_to_many: mapping.element.is_many_to_many(),
            },
            mapping.role.as_str(),
            mapping.table.as_str(),
            join_type,
            lhs_alias,
            owner.identifier_columns().to_vec(),
            rhs_alias.as_str(),
            mapping.key_columns.clone(),
            on,
            depth,
        )?;
        let edge_index = self.associations.len();
        self.associations.push(edge);

        let collection = self.push_collection_reference(
            mapping,
            &rhs_alias,
            Some(owner_reference),
            Some(edge_index),
        )?;
        self.walk_collection_tree(collection, mapping, &rhs_alias, path, depth + 1)
    }

    /// Decide how (and whether) to join one edge.
    #[allow(clippy::too_many_arguments)]
    fn join_type(
        &mut self,
        path: &str,
        association: Option<(&str, &str)>,
        join_in_mapping: bool,
        nullable: bool,
        depth: i64,
        is_collection: bool,
        key: AssociationKey,
    ) -> JoinType {
        let forced = self.overrides.join_type_override(path);
        let enabled = match forced {
            Some(join_type) => join_type.is_joined(),
            None => {
                association.is_some_and(|(entity, property)| {
                    self.influencers
                        .profile_joins(self.metamodel, entity, property)
                }) || join_in_mapping
            }
        };
        if !enabled || self.is_too_deep(depth) {
            return JoinType::None;
        }
        if is_collection && self.has_joined_collection() {
            return JoinType::None;
        }
        if !self.visited.insert(key) {
            tracing::trace!(path = path, "Skipping already-joined foreign key");
            return JoinType::None;
        }
        match forced {
            Some(JoinType::Inner) => JoinType::Inner,
            _ => JoinType::for_association(nullable, depth),
        }
    }

    fn is_too_deep(&self, depth: i64) -> bool {
        self.settings
            .max_fetch_depth
            .is_some_and(|max| i64::try_from(max).is_ok_and(|max| depth >= max))
    }

    fn has_joined_collection(&self) -> bool {
        self.associations.iter().any(OuterJoinableAssociation::is_collection)
    }

    fn push_entity_reference(
        &mut self,
        persister: &EntityPersister,
        alias: &str,
        source: EntitySource,
        association: Option<usize>,
        nullable: bool,
    ) -> usize {
        let index = self.entity_references.len();
        let suffix = entity_suffix(index);
        let property_aliases = persister
            .properties()
            .iter()
            .map(|p| column_aliases(p.columns(), &suffix))
            .collect();
        self.entity_references.push(EntityReferenceDef {
            entity_name: persister.entity_name().to_string(),
            alias: alias.to_string(),
            identifier_aliases: column_aliases(persister.identifier_columns(), &suffix),
            property_aliases,
            version_alias: persister.version().map(|v| column_alias(&v.column, &suffix)),
            suffix,
            source,
            association,
            identifier_fetches: Vec::new(),
            nullable,
        });
        index
    }

    fn push_collection_reference(
        &mut self,
        mapping: &CollectionMapping,
        alias: &str,
        owner: Option<usize>,
        association: Option<usize>,
    ) -> Result<usize> {
        let index = self.collection_references.len();
        let suffix = collection_suffix(index);
        let element = match &mapping.element {
            ElementMapping::OneToMany { target } => CollectionElementDef::Entity {
                entity_name: target.clone(),
                reference: None,
                id_aliases: Vec::new(),
            },
            ElementMapping::ManyToMany { target, columns } => CollectionElementDef::Entity {
                entity_name: target.clone(),
                reference: None,
                id_aliases: column_aliases(columns, &suffix),
            },
            ElementMapping::Basic { column } => CollectionElementDef::Basic {
                alias: column_alias(column, &suffix),
            },
        };
        if mapping.kind.is_indexed() && mapping.index_column.is_none() {
            return Err(Error::mapping(
                None,
                Some(&mapping.role),
                "indexed collection has no index column",
            ));
        }
        self.collection_references.push(CollectionReferenceDef {
            role: mapping.role.clone(),
            kind: mapping.kind,
            alias: alias.to_string(),
            key_aliases: column_aliases(&mapping.key_columns, &suffix),
            index_alias: mapping
                .index_column
                .as_ref()
                .map(|c| column_alias(c, &suffix)),
            suffix,
            owner,
            association,
            element,
        });
        Ok(index)
    }

    /// Resolve edge owners: one-to-one and collection edges point at the
    /// entity reference whose alias is their left-hand alias.
    fn init_owners(&mut self) {
        for index in 0..self.associations.len() {
            let association = &self.associations[index];
            let owner = if association.is_one_to_one() || association.is_collection() {
                self.entity_references
                    .iter()
                    .position(|r| r.alias == association.lhs_alias())
            } else {
                None
            };
            self.associations[index].set_owner(owner);
        }
    }

    /// Render the select list, joins and ordering into the final plan.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        self,
        root: PlanRoot,
        table: &str,
        alias: &str,
        condition: &str,
        restriction_params: Vec<Value>,
        trailing_params: Vec<Value>,
        root_order_by: Option<String>,
    ) -> Result<LoadPlan> {
        let mut select = Vec::new();
        for reference in &self.entity_references {
            let persister = self.metamodel.persister(&reference.entity_name)?;
            push_columns(
                &mut select,
                &reference.alias,
                persister.identifier_columns(),
                &reference.identifier_aliases,
            );
            for (property, aliases) in persister.properties().iter().zip(&reference.property_aliases) {
                push_columns(&mut select, &reference.alias, property.columns(), aliases);
            }
            if let (Some(version), Some(version_alias)) = (persister.version(), &reference.version_alias) {
                select.push(format!("{}.{} as {}", reference.alias, version.column, version_alias));
            }
        }
        for collection in &self.collection_references {
            let (_, _, mapping) = self.metamodel.collection(&collection.role)?;
            push_columns(&mut select, &collection.alias, &mapping.key_columns, &collection.key_aliases);
            if let (Some(column), Some(index_alias)) = (&mapping.index_column, &collection.index_alias) {
                select.push(format!("{}.{} as {}", collection.alias, column, index_alias));
            }
            match (&mapping.element, &collection.element) {
                (ElementMapping::ManyToMany { columns, .. }, CollectionElementDef::Entity { id_aliases, .. }) => {
                    push_columns(&mut select, &collection.alias, columns, id_aliases);
                }
                (ElementMapping::Basic { column }, CollectionElementDef::Basic { alias: element_alias }) => {
                    select.push(format!("{}.{} as {}", collection.alias, column, element_alias));
                }
                _ => {}
            }
        }

        let joins = merge_outer_joins(&self.associations);
        let (join_sql, mut leading_params) = joins.into_parts();
        leading_params.extend(restriction_params);

        let mut sql = format!(
            "select {} from {} {}{} where {}",
            select.join(", "),
            table,
            alias,
            join_sql,
            condition
        );
        let order_by = merge_orderings(self.association_orderings()?, root_order_by);
        if let Some(order_by) = order_by {
            sql.push_str(" order by ");
            sql.push_str(&order_by);
        }

        tracing::debug!(
            target: "hibernate::sql",
            sql = %sql,
            associations = self.associations.len(),
            "Generated load plan"
        );

        Ok(LoadPlan {
            root,
            root_alias: alias.to_string(),
            entity_references: self.entity_references,
            collection_references: self.collection_references,
            associations: self.associations,
            sql,
            leading_params,
            trailing_params,
        })
    }

    /// Orderings of outer-joined collections, in join order.
    fn association_orderings(&self) -> Result<Option<String>> {
        let mut parts = Vec::new();
        for association in &self.associations {
            if association.join_type() != JoinType::LeftOuter {
                continue;
            }
            if let AssociationKind::Collection { role, .. } = association.kind() {
                let (_, _, mapping) = self.metamodel.collection(role)?;
                if mapping.order_by.is_some() {
                    if let Some(order) = mapping.render_order_by(association.rhs_alias()) {
                        parts.push(order);
                    }
                }
            }
        }
        Ok((!parts.is_empty()).then(|| parts.join(", ")))
    }
}

fn merge_orderings(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{}, {}", a, b)),
        (a, b) => a.or(b),
    }
}

fn push_columns(select: &mut Vec<String>, alias: &str, columns: &[String], aliases: &[String]) {
    for (column, column_alias) in columns.iter().zip(aliases) {
        select.push(format!("{}.{} as {}", alias, column, column_alias));
    }
}

fn qualified(alias: &str, columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("{}.{}", alias, c)).collect()
}

fn append_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

/// `a.id=?`, `a.id in (?, ?)` or a disjunction of composite key matches.
fn key_condition(alias: &str, columns: &[String], batch_size: usize) -> String {
    let batch_size = batch_size.max(1);
    let qualified = qualified(alias, columns);
    if qualified.len() == 1 {
        if batch_size == 1 {
            format!("{}=?", qualified[0])
        } else {
            format!("{} in ({})", qualified[0], vec!["?"; batch_size].join(", "))
        }
    } else {
        let one = qualified
            .iter()
            .map(|c| format!("{}=?", c))
            .collect::<Vec<_>>()
            .join(" and ");
        if batch_size == 1 {
            one
        } else {
            let each = vec![format!("({})", one); batch_size];
            format!("({})", each.join(" or "))
        }
    }
}
