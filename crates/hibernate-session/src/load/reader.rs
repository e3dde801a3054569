//! Phase one of a load: turning result rows into registrations.

use std::collections::HashMap;
use std::sync::Arc;

use hibernate_core::{
    CollectionKey, EntityKey, EntityPersister, Error, IdComponent, Metamodel, PropertyKind,
    Result, Row, Value,
};
use hibernate_loader::{
    CollectionElementDef, EntitySource, Hydratable, KeyResolvable, LoadPlan, PlanRoot,
};

use super::context::{HydratedEntityRegistration, HydratedValue, LoadContext, PendingElement};
use super::{LogicalRow, RowShape};
use crate::collection::{CollectionElement, PersistentCollection};
use crate::entry::EntityEntry;
use crate::instance::{EntityInstance, EntityRef};
use crate::persistence_context::PersistenceContext;

/// Read a key from `aliases`: `None` when every column is null.
pub(crate) fn read_key(row: &Row, aliases: &[String]) -> Result<Option<Value>> {
    let values = row.columns(aliases)?;
    if values.iter().all(Value::is_null) {
        return Ok(None);
    }
    Ok(Some(match values.len() {
        1 => values[0].normalized(),
        _ => Value::Array(values.iter().map(Value::normalized).collect()),
    }))
}

/// Read an entity identifier, grouping composite identifier columns per
/// component.
pub(crate) fn read_identifier(persister: &EntityPersister, row: &Row, aliases: &[String]) -> Result<Option<Value>> {
    let mapping = persister.identifier();
    if !mapping.is_composite() {
        return read_key(row, aliases);
    }
    let values = row.columns(aliases)?;
    if values.iter().all(Value::is_null) {
        return Ok(None);
    }
    let mut components = Vec::with_capacity(mapping.components.len());
    let mut offset = 0;
    for component in &mapping.components {
        let width = match component {
            IdComponent::Basic { .. } => 1,
            IdComponent::KeyManyToOne { columns, .. } => columns.len(),
        };
        let slice = values.get(offset..offset + width).ok_or_else(|| {
            Error::mapping(
                Some(persister.entity_name()),
                Some(component.name()),
                "identifier aliases do not cover every component column",
            )
        })?;
        components.push(match slice {
            [single] => single.normalized(),
            many => Value::Array(many.iter().map(Value::normalized).collect()),
        });
        offset += width;
    }
    Ok(Some(Value::Array(components)))
}

/// Per-plan lookup tables, built once per load.
pub(crate) struct RowReader<'a> {
    plan: &'a LoadPlan,
    persisters: Vec<Arc<EntityPersister>>,
    /// `(owner reference, property)` to the reference joined for it.
    joined_to_ones: HashMap<(usize, usize), usize>,
    /// Per reference: indices of properties other entities look up by unique key.
    unique_key_properties: Vec<Vec<usize>>,
    /// Per collection reference: the owning entity name.
    collection_owners: Vec<String>,
}

impl<'a> RowReader<'a> {
    pub fn new(plan: &'a LoadPlan, metamodel: &Metamodel) -> Result<Self> {
        let mut persisters = Vec::with_capacity(plan.entity_references().len());
        let mut joined_to_ones = HashMap::new();
        let mut unique_key_properties = Vec::with_capacity(plan.entity_references().len());
        for (index, reference) in plan.entity_references().iter().enumerate() {
            let persister = Arc::clone(metamodel.persister(&reference.entity_name)?);
            unique_key_properties.push(
                persister
                    .properties()
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| !p.is_collection())
                    .filter(|(_, p)| metamodel.is_unique_key_target(persister.entity_name(), &p.name))
                    .map(|(i, _)| i)
                    .collect(),
            );
            persisters.push(persister);
            if let EntitySource::ToOne { owner, property } = reference.source {
                joined_to_ones.insert((owner, property), index);
            }
        }
        let collection_owners = plan
            .collection_references()
            .iter()
            .map(|c| metamodel.collection(&c.role).map(|(owner, _, _)| owner.entity_name().to_string()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            plan,
            persisters,
            joined_to_ones,
            unique_key_properties,
            collection_owners,
        })
    }

    /// Process one row: resolve keys, register and hydrate new instances,
    /// buffer collection elements and assemble the logical row.
    pub fn read_row(&self, pc: &mut PersistenceContext, ctx: &mut LoadContext, row: &Row) -> Result<()> {
        let count = self.plan.entity_references().len();
        let mut keys: Vec<Option<Option<EntityKey>>> = vec![None; count];
        let mut instances: Vec<Option<EntityRef>> = vec![None; count];
        let mut fresh: Vec<(usize, usize)> = Vec::new();

        for reference in 0..count {
            self.resolve_reference(reference, pc, ctx, row, &mut keys, &mut instances, &mut fresh)?;
        }
        for (reference, registration) in fresh {
            self.hydrate(reference, registration, pc, ctx, row, &instances)?;
        }
        self.read_collections(pc, ctx, row, &keys, &instances)?;

        if self.plan.root() == PlanRoot::Entity {
            if let (Some(Some(key)), Some(_)) = (&keys[0], &instances[0]) {
                ctx.add_root(key);
            }
            let logical = match &ctx.options.shape {
                RowShape::Entity => LogicalRow::Entity(instances.first().cloned().flatten()),
                RowShape::Tuple => LogicalRow::Tuple(instances),
                RowShape::Scalar(aliases) => LogicalRow::Scalar(row.columns(aliases)?),
            };
            ctx.results.push(logical);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_reference(
        &self,
        reference: usize,
        pc: &mut PersistenceContext,
        ctx: &mut LoadContext,
        row: &Row,
        keys: &mut [Option<Option<EntityKey>>],
        instances: &mut [Option<EntityRef>],
        fresh: &mut Vec<(usize, usize)>,
    ) -> Result<()> {
        if keys[reference].is_some() {
            return Ok(());
        }
        let def = &self.plan.entity_references()[reference];
        for &fetch in def.identifier_fetches() {
            self.resolve_reference(fetch, pc, ctx, row, keys, instances, fresh)?;
        }
        let persister = &self.persisters[reference];
        let Some(id) = read_identifier(persister, row, def.identifier_aliases())? else {
            keys[reference] = Some(None);
            return Ok(());
        };
        let key = pc.entity_key(persister.entity_name(), &id);
        keys[reference] = Some(Some(key.clone()));

        if let Some(existing) = ctx.registration(&key) {
            instances[reference] = Some(existing.instance.clone());
            return Ok(());
        }
        let managed = pc.get_entity(&key);
        if let Some(target) = ctx.refresh_target(&key, managed.as_ref()) {
            let index = ctx.register(HydratedEntityRegistration {
                reference: Some(reference),
                key,
                instance: target.clone(),
                hydrated_state: Vec::new(),
                version: None,
                refresh: true,
            });
            fresh.push((reference, index));
            instances[reference] = Some(target);
            return Ok(());
        }
        if let Some(existing) = managed {
            let gone = pc
                .get_entry(&existing)
                .is_some_and(|entry| entry.status().is_deleted_or_gone());
            instances[reference] = (!gone).then_some(existing);
            return Ok(());
        }

        let instance = EntityRef::new(EntityInstance::new(persister).with_identifier(id));
        pc.add_entity(
            key.clone(),
            instance.clone(),
            EntityEntry::loading(key.clone(), Arc::clone(persister)),
        )?;
        tracing::trace!(entity = %key, "Registered loading instance");
        let index = ctx.register(HydratedEntityRegistration {
            reference: Some(reference),
            key,
            instance: instance.clone(),
            hydrated_state: Vec::new(),
            version: None,
            refresh: false,
        });
        fresh.push((reference, index));
        instances[reference] = Some(instance);
        Ok(())
    }

    fn hydrate(
        &self,
        reference: usize,
        registration: usize,
        pc: &mut PersistenceContext,
        ctx: &mut LoadContext,
        row: &Row,
        instances: &[Option<EntityRef>],
    ) -> Result<()> {
        let def = &self.plan.entity_references()[reference];
        let persister = &self.persisters[reference];
        let mut state = Vec::with_capacity(persister.properties().len());
        for (index, property) in persister.properties().iter().enumerate() {
            let joined = self
                .joined_to_ones
                .get(&(reference, index))
                .map(|&child| instances[child].clone());
            let value = match &property.kind {
                PropertyKind::Basic { .. } => {
                    let aliases = def.property_aliases(index);
                    let alias = aliases.first().ok_or_else(|| {
                        Error::mapping(Some(persister.entity_name()), Some(&property.name), "no column alias")
                    })?;
                    HydratedValue::Basic(row.column(alias)?.clone())
                }
                PropertyKind::ToOne(mapping) if mapping.is_inverse() => match joined {
                    Some(target) => HydratedValue::Joined {
                        foreign_key: None,
                        target,
                    },
                    None => HydratedValue::InverseOneToOne,
                },
                PropertyKind::ToOne(_) => {
                    let foreign_key = read_key(row, def.property_aliases(index))?;
                    match joined {
                        Some(target) => HydratedValue::Joined { foreign_key, target },
                        None => HydratedValue::ForeignKey(foreign_key),
                    }
                }
                PropertyKind::Collection(_) => HydratedValue::Collection,
            };
            state.push(value);
        }
        let version = match def.version_alias() {
            Some(alias) => Some(row.column(alias)?.clone()),
            None => None,
        };

        let instance = ctx.registrations[registration].instance.clone();
        for &property in &self.unique_key_properties[reference] {
            let value = state[property].loaded_value();
            if !value.is_null() {
                let key = pc.unique_key(persister.entity_name(), &persister.property(property).name, &value);
                pc.add_entity_by_unique_key(key, instance.clone());
            }
        }
        let target = &mut ctx.registrations[registration];
        target.hydrated_state = state;
        target.version = version;
        Ok(())
    }

    fn read_collections(
        &self,
        pc: &mut PersistenceContext,
        ctx: &mut LoadContext,
        row: &Row,
        keys: &[Option<Option<EntityKey>>],
        instances: &[Option<EntityRef>],
    ) -> Result<()> {
        for (index, def) in self.plan.collection_references().iter().enumerate() {
            let owner_id = match def.owner {
                Some(owner) => match (&keys[owner], &instances[owner]) {
                    (Some(Some(key)), Some(_)) => key.identifier().clone(),
                    _ => continue,
                },
                None => match read_key(row, &def.key_aliases)? {
                    Some(id) => id,
                    None => continue,
                },
            };
            let key = CollectionKey::new(&def.role, &owner_id);
            if ctx.is_ignored(&key) {
                continue;
            }
            if !ctx.is_tracked(&key) {
                match pc.get_collection(&key) {
                    Some(existing) if existing.is_initialized() || existing.is_loading() => {
                        ctx.ignore(key);
                        continue;
                    }
                    Some(existing) => ctx.add_loading(key.clone(), existing, false),
                    None => {
                        let owner = pc.entity_key(&self.collection_owners[index], &owner_id);
                        let collection = PersistentCollection::uninitialized(&def.role, def.kind, owner.clone());
                        pc.add_uninitialized_collection(&collection, owner)?;
                        ctx.add_loading(key.clone(), collection, true);
                    }
                }
            }

            // An outer-joined collection with no element leaves its key null.
            if read_key(row, &def.key_aliases)?.is_none() {
                continue;
            }
            let position = match &def.index_alias {
                Some(alias) => row.column(alias)?.as_i64(),
                None => None,
            };
            let element = match &def.element {
                CollectionElementDef::Entity {
                    reference: Some(reference),
                    ..
                } => match &instances[*reference] {
                    Some(entity) => PendingElement::Ready(CollectionElement::from(entity.clone())),
                    None => continue,
                },
                CollectionElementDef::Entity {
                    entity_name,
                    reference: None,
                    id_aliases,
                } => match read_key(row, id_aliases)? {
                    Some(id) => PendingElement::Key(pc.entity_key(entity_name, &id)),
                    None => continue,
                },
                CollectionElementDef::Basic { alias } => {
                    PendingElement::Ready(CollectionElement::Basic(row.column(alias)?.clone()))
                }
            };
            ctx.push_element(&key, position, element);
        }
        Ok(())
    }
}
