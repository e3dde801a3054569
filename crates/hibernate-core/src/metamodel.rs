//! The validated set of persisters, filter definitions and fetch profiles.
//!
//! A [`Metamodel`] is read-only configuration shared by every session of a
//! factory. Building one cross-checks every association against its target,
//! so mapping defects surface before any SQL is generated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::association::{CollectionMapping, ElementMapping};
use crate::error::{Error, Result, UsageErrorKind};
use crate::persister::{EntityPersister, IdComponent, PropertyKind};

/// A named filter with its parameters and default condition template.
///
/// Templates reference the filtered table as `{alias}` and parameters as
/// `:name`, e.g. `{alias}.active = :active`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDefinition {
    pub name: String,
    pub parameters: Vec<String>,
    pub default_condition: Option<String>,
}

impl FilterDefinition {
    #[must_use]
    pub fn new(name: &str, parameters: &[&str], default_condition: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parameters: parameters.iter().map(|p| (*p).to_string()).collect(),
            default_condition: default_condition.map(str::to_string),
        }
    }
}

/// A named set of associations to join-fetch when the profile is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchProfile {
    pub name: String,
    fetches: HashSet<(String, String)>,
}

impl FetchProfile {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fetches: HashSet::new(),
        }
    }

    /// Join-fetch `entity.association` while the profile is enabled.
    #[must_use]
    pub fn join(mut self, entity: &str, association: &str) -> Self {
        self.fetches
            .insert((entity.to_string(), association.to_string()));
        self
    }

    pub fn joins(&self, entity: &str, association: &str) -> bool {
        self.fetches
            .contains(&(entity.to_string(), association.to_string()))
    }

    fn entries(&self) -> impl Iterator<Item = &(String, String)> {
        self.fetches.iter()
    }
}

/// Validated mapping model.
#[derive(Debug, Default)]
pub struct Metamodel {
    persisters: BTreeMap<String, Arc<EntityPersister>>,
    filters: HashMap<String, FilterDefinition>,
    fetch_profiles: HashMap<String, FetchProfile>,
    /// `(entity, property)` pairs referenced by some inverse one-to-one.
    unique_key_targets: HashSet<(String, String)>,
}

impl Metamodel {
    #[must_use]
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Look up a persister, failing with a usage error for unknown names.
    pub fn persister(&self, entity_name: &str) -> Result<&Arc<EntityPersister>> {
        self.persisters.get(entity_name).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::UnknownEntity,
                format!("unknown entity: {}", entity_name),
            )
        })
    }

    pub fn persisters(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.persisters.values()
    }

    /// Resolve a collection role to its owner persister, property index and mapping.
    pub fn collection(&self, role: &str) -> Result<(&Arc<EntityPersister>, usize, &CollectionMapping)> {
        let (entity, property) = role.rsplit_once('.').ok_or_else(|| {
            Error::usage(UsageErrorKind::UnknownEntity, format!("malformed role: {}", role))
        })?;
        let persister = self.persister(entity)?;
        let index = persister.require_property(property)?;
        let mapping = persister.property(index).as_collection().ok_or_else(|| {
            Error::mapping(Some(entity), Some(property), "property is not a collection")
        })?;
        Ok((persister, index, mapping))
    }

    pub fn filter_definition(&self, name: &str) -> Option<&FilterDefinition> {
        self.filters.get(name)
    }

    pub fn fetch_profile(&self, name: &str) -> Option<&FetchProfile> {
        self.fetch_profiles.get(name)
    }

    /// Is `entity.property` the key side of some inverse one-to-one?
    pub fn is_unique_key_target(&self, entity: &str, property: &str) -> bool {
        self.unique_key_targets
            .contains(&(entity.to_string(), property.to_string()))
    }

    /// Entity names referenced by foreign keys on `entity`'s own table.
    pub fn foreign_key_targets(&self, entity: &str) -> Vec<String> {
        let Some(persister) = self.persisters.get(entity) else {
            return Vec::new();
        };
        let mut targets: Vec<String> = persister
            .properties()
            .iter()
            .filter_map(|p| p.as_to_one())
            .filter(|m| !m.is_inverse())
            .map(|m| m.target.clone())
            .collect();
        for component in &persister.identifier().components {
            if let IdComponent::KeyManyToOne { target, .. } = component {
                targets.push(target.clone());
            }
        }
        for owner in self.persisters.values() {
            for property in owner.properties() {
                if let Some(ElementMapping::OneToMany { target }) =
                    property.as_collection().map(|c| &c.element)
                {
                    if target == entity && !property.as_collection().is_some_and(|c| c.inverse) {
                        targets.push(owner.entity_name().to_string());
                    }
                }
            }
        }
        targets.sort();
        targets.dedup();
        targets
    }
}

/// Collects persisters and definitions, then validates them together.
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    persisters: Vec<EntityPersister>,
    filters: Vec<FilterDefinition>,
    fetch_profiles: Vec<FetchProfile>,
}

impl MetamodelBuilder {
    #[must_use]
    pub fn entity(mut self, persister: EntityPersister) -> Self {
        self.persisters.push(persister);
        self
    }

    #[must_use]
    pub fn filter(mut self, definition: FilterDefinition) -> Self {
        self.filters.push(definition);
        self
    }

    #[must_use]
    pub fn fetch_profile(mut self, profile: FetchProfile) -> Self {
        self.fetch_profiles.push(profile);
        self
    }

    /// Cross-validate every association and freeze the model.
    pub fn build(self) -> Result<Metamodel> {
        let filters: HashMap<String, FilterDefinition> = self
            .filters
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        let mut by_name: BTreeMap<String, EntityPersister> = BTreeMap::new();
        for persister in self.persisters {
            let name = persister.entity_name().to_string();
            if by_name.insert(name.clone(), persister).is_some() {
                return Err(Error::mapping(Some(&name), None, "entity mapped twice"));
            }
        }

        let id_arity: HashMap<String, (usize, String)> = by_name
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    (p.identifier_columns().len(), p.table().to_string()),
                )
            })
            .collect();

        let mut unique_key_targets = HashSet::new();

        for (name, persister) in &by_name {
            for filter in persister.filters() {
                check_filter(&filters, name, None, &filter.name)?;
            }
            for component in &persister.identifier().components {
                if let IdComponent::KeyManyToOne {
                    name: component_name,
                    target,
                    columns,
                    ..
                } = component
                {
                    check_target(&id_arity, name, component_name, target, columns.len())?;
                }
            }
            for property in persister.properties() {
                match &property.kind {
                    PropertyKind::Basic { .. } => {}
                    PropertyKind::ToOne(mapping) => {
                        let target = by_name.get(&mapping.target).ok_or_else(|| {
                            Error::mapping(
                                Some(name),
                                Some(&property.name),
                                format!("unknown target entity {}", mapping.target),
                            )
                        })?;
                        if let Some(mapped_by) = &mapping.mapped_by {
                            let inverse = target
                                .property_index(mapped_by)
                                .and_then(|i| target.property(i).as_to_one())
                                .ok_or_else(|| {
                                    Error::mapping(
                                        Some(name),
                                        Some(&property.name),
                                        format!(
                                            "mapped_by refers to missing to-one {}.{}",
                                            mapping.target, mapped_by
                                        ),
                                    )
                                })?;
                            if inverse.target != *name || inverse.is_inverse() {
                                return Err(Error::mapping(
                                    Some(name),
                                    Some(&property.name),
                                    "mapped_by must name the owning side pointing back",
                                ));
                            }
                            unique_key_targets.insert((mapping.target.clone(), mapped_by.clone()));
                        } else {
                            check_target(
                                &id_arity,
                                name,
                                &property.name,
                                &mapping.target,
                                mapping.columns.len(),
                            )?;
                        }
                    }
                    PropertyKind::Collection(mapping) => {
                        let owner_arity = persister.identifier_columns().len();
                        if mapping.key_columns.len() != owner_arity {
                            return Err(Error::mapping(
                                Some(name),
                                Some(&property.name),
                                format!(
                                    "collection key has {} columns but owner identifier has {}",
                                    mapping.key_columns.len(),
                                    owner_arity
                                ),
                            ));
                        }
                        match &mapping.element {
                            ElementMapping::OneToMany { target } => {
                                if !id_arity.contains_key(target) {
                                    return Err(Error::mapping(
                                        Some(name),
                                        Some(&property.name),
                                        format!("unknown element entity {}", target),
                                    ));
                                }
                            }
                            ElementMapping::ManyToMany { target, columns } => {
                                check_target(&id_arity, name, &property.name, target, columns.len())?;
                            }
                            ElementMapping::Basic { .. } => {}
                        }
                        for filter in mapping.filters.iter().chain(&mapping.many_to_many_filters) {
                            check_filter(&filters, name, Some(&property.name), &filter.name)?;
                        }
                    }
                }
            }
        }

        // One-to-many collections live in the element's table.
        for persister in by_name.values_mut() {
            for property in persister.properties_mut() {
                if let PropertyKind::Collection(mapping) = &mut property.kind {
                    if let ElementMapping::OneToMany { target } = &mapping.element {
                        if let Some((_, table)) = id_arity.get(target) {
                            mapping.table.clone_from(table);
                        }
                    }
                }
            }
        }

        let fetch_profiles: HashMap<String, FetchProfile> = self
            .fetch_profiles
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for profile in fetch_profiles.values() {
            for (entity, association) in profile.entries() {
                let persister = by_name.get(entity).ok_or_else(|| {
                    Error::mapping(
                        Some(entity),
                        None,
                        format!("fetch profile {} names an unknown entity", profile.name),
                    )
                })?;
                let index = persister.require_property(association)?;
                if matches!(persister.property(index).kind, PropertyKind::Basic { .. }) {
                    return Err(Error::mapping(
                        Some(entity),
                        Some(association),
                        format!("fetch profile {} names a non-association", profile.name),
                    ));
                }
            }
        }

        tracing::debug!(
            entities = by_name.len(),
            filters = filters.len(),
            fetch_profiles = fetch_profiles.len(),
            "Metamodel built"
        );

        Ok(Metamodel {
            persisters: by_name
                .into_iter()
                .map(|(name, p)| (name, Arc::new(p)))
                .collect(),
            filters,
            fetch_profiles,
            unique_key_targets,
        })
    }
}

fn check_target(
    id_arity: &HashMap<String, (usize, String)>,
    entity: &str,
    property: &str,
    target: &str,
    columns: usize,
) -> Result<()> {
    let (arity, _) = id_arity.get(target).ok_or_else(|| {
        Error::mapping(
            Some(entity),
            Some(property),
            format!("unknown target entity {}", target),
        )
    })?;
    if *arity != columns {
        return Err(Error::mapping(
            Some(entity),
            Some(property),
            format!(
                "foreign key has {} columns but {} identifier has {}",
                columns, target, arity
            ),
        ));
    }
    Ok(())
}

fn check_filter(
    filters: &HashMap<String, FilterDefinition>,
    entity: &str,
    property: Option<&str>,
    filter: &str,
) -> Result<()> {
    if filters.contains_key(filter) {
        Ok(())
    } else {
        Err(Error::mapping(
            Some(entity),
            property,
            format!("undefined filter {}", filter),
        ))
    }
}
