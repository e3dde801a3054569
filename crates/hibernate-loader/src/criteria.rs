//! Criteria queries: restrictions, ordering and per-path fetch overrides
//! against a single root entity.

use std::collections::BTreeMap;

use hibernate_core::{EntityPersister, Error, FetchMode, PropertyKind, Result, Value};

use crate::influencers::TraversalOverrides;
use crate::join::{JoinType, SqlFragment};

/// A restriction on a root property. Property names may also be the
/// identifier's name.
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Like(String, String),
    IsNull(String),
    IsNotNull(String),
    In(String, Vec<Value>),
    /// Raw SQL; `{alias}` is replaced by the root alias.
    Sql(String, Vec<Value>),
}

/// A sort order on a root property.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub property: String,
    pub ascending: bool,
}

/// A query for root entities matching every restriction.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    entity_name: String,
    restrictions: Vec<Restriction>,
    orders: Vec<Order>,
    fetch_modes: BTreeMap<String, JoinType>,
    read_only: Option<bool>,
}

impl Criteria {
    #[must_use]
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            restrictions: Vec::new(),
            orders: Vec::new(),
            fetch_modes: BTreeMap::new(),
            read_only: None,
        }
    }

    #[must_use]
    pub fn add(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    #[must_use]
    pub fn order_asc(mut self, property: &str) -> Self {
        self.orders.push(Order {
            property: property.to_string(),
            ascending: true,
        });
        self
    }

    #[must_use]
    pub fn order_desc(mut self, property: &str) -> Self {
        self.orders.push(Order {
            property: property.to_string(),
            ascending: false,
        });
        self
    }

    /// Override the fetch strategy of the association at `path`.
    #[must_use]
    pub fn fetch(mut self, path: &str, mode: FetchMode) -> Self {
        let join_type = match mode {
            FetchMode::Join => JoinType::LeftOuter,
            FetchMode::Select | FetchMode::Subselect => JoinType::None,
        };
        self.fetch_modes.insert(path.to_string(), join_type);
        self
    }

    /// Load results read-only (or not) regardless of the session default.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    pub fn is_read_only(&self) -> Option<bool> {
        self.read_only
    }

    /// Render the conjunction of all restrictions against `alias`.
    pub fn render_where(&self, persister: &EntityPersister, alias: &str) -> Result<SqlFragment> {
        let mut fragment = SqlFragment::default();
        for restriction in &self.restrictions {
            fragment = fragment.and(render_restriction(restriction, persister, alias)?);
        }
        Ok(fragment)
    }

    /// Render the `order by` list, if any.
    pub fn render_order_by(&self, persister: &EntityPersister, alias: &str) -> Result<Option<String>> {
        let mut parts = Vec::new();
        for order in &self.orders {
            let direction = if order.ascending { "asc" } else { "desc" };
            for column in property_columns(persister, &order.property)? {
                parts.push(format!("{}.{} {}", alias, column, direction));
            }
        }
        Ok((!parts.is_empty()).then(|| parts.join(", ")))
    }
}

impl TraversalOverrides for Criteria {
    fn join_type_override(&self, path: &str) -> Option<JoinType> {
        self.fetch_modes.get(path).copied()
    }

    fn has_overrides(&self) -> bool {
        !self.fetch_modes.is_empty()
    }
}

fn property_columns(persister: &EntityPersister, property: &str) -> Result<Vec<String>> {
    if property == persister.identifier().name {
        return Ok(persister.identifier_columns().to_vec());
    }
    let index = persister.require_property(property)?;
    let mapping = persister.property(index);
    match &mapping.kind {
        PropertyKind::Basic { column } => Ok(vec![column.clone()]),
        PropertyKind::ToOne(to_one) if !to_one.is_inverse() => Ok(to_one.columns.clone()),
        _ => Err(Error::mapping(
            Some(persister.entity_name()),
            Some(property),
            "criteria can only restrict columns on the root table",
        )),
    }
}

fn compare(
    persister: &EntityPersister,
    alias: &str,
    property: &str,
    op: &str,
    value: &Value,
) -> Result<SqlFragment> {
    let columns = property_columns(persister, property)?;
    let components = value.components();
    if components.len() != columns.len() {
        return Err(Error::mapping(
            Some(persister.entity_name()),
            Some(property),
            format!(
                "restriction value has {} components but property has {} columns",
                components.len(),
                columns.len()
            ),
        ));
    }
    let sql: Vec<String> = columns
        .iter()
        .map(|c| format!("{}.{} {} ?", alias, c, op))
        .collect();
    let sql = if sql.len() == 1 {
        sql.join("")
    } else {
        format!("({})", sql.join(" and "))
    };
    Ok(SqlFragment::new(sql, components.to_vec()))
}

fn render_restriction(
    restriction: &Restriction,
    persister: &EntityPersister,
    alias: &str,
) -> Result<SqlFragment> {
    match restriction {
        Restriction::Eq(p, v) => compare(persister, alias, p, "=", v),
        Restriction::Ne(p, v) => compare(persister, alias, p, "<>", v),
        Restriction::Gt(p, v) => compare(persister, alias, p, ">", v),
        Restriction::Ge(p, v) => compare(persister, alias, p, ">=", v),
        Restriction::Lt(p, v) => compare(persister, alias, p, "<", v),
        Restriction::Le(p, v) => compare(persister, alias, p, "<=", v),
        Restriction::Like(p, pattern) => {
            compare(persister, alias, p, "like", &Value::Text(pattern.clone()))
        }
        Restriction::IsNull(p) | Restriction::IsNotNull(p) => {
            let test = if matches!(restriction, Restriction::IsNull(_)) {
                "is null"
            } else {
                "is not null"
            };
            let sql: Vec<String> = property_columns(persister, p)?
                .iter()
                .map(|c| format!("{}.{} {}", alias, c, test))
                .collect();
            Ok(SqlFragment::raw(sql.join(" and ")))
        }
        Restriction::In(p, values) => {
            let columns = property_columns(persister, p)?;
            if values.is_empty() {
                return Ok(SqlFragment::raw("1=0"));
            }
            if columns.len() != 1 {
                return Err(Error::mapping(
                    Some(persister.entity_name()),
                    Some(p),
                    "in-restrictions need a single-column property",
                ));
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            Ok(SqlFragment::new(
                format!("{}.{} in ({})", alias, columns[0], placeholders),
                values.clone(),
            ))
        }
        Restriction::Sql(sql, params) => Ok(SqlFragment::new(
            format!("({})", sql.replace("{alias}", alias)),
            params.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernate_core::{CollectionMapping, ToOneMapping};

    fn hero() -> EntityPersister {
        EntityPersister::builder("Hero", "hero")
            .identifier("id", "id")
            .basic("name", "name")
            .basic("age", "age")
            .to_one("team", ToOneMapping::many_to_one("Team", &["team_id"]))
            .collection("powers", CollectionMapping::elements("power", &["hero_id"], "name"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_render_where() {
        let criteria = Criteria::new("Hero")
            .add(Restriction::Eq("name".into(), Value::Text("Tony".into())))
            .add(Restriction::Gt("age".into(), Value::BigInt(30)))
            .add(Restriction::Eq("team".into(), Value::BigInt(7)))
            .add(Restriction::IsNotNull("name".into()))
            .add(Restriction::In("id".into(), vec![Value::BigInt(1), Value::BigInt(2)]));
        let fragment = criteria.render_where(&hero(), "hero0_").unwrap();
        assert_eq!(
            fragment.sql,
            "hero0_.name = ? and hero0_.age > ? and hero0_.team_id = ? \
             and hero0_.name is not null and hero0_.id in (?, ?)"
        );
        assert_eq!(fragment.params.len(), 5);
        assert_eq!(fragment.params[2], Value::BigInt(7));
    }

    #[test]
    fn test_order_and_overrides() {
        let criteria = Criteria::new("Hero")
            .order_desc("age")
            .order_asc("name")
            .fetch("team", FetchMode::Join)
            .fetch("powers", FetchMode::Select);
        assert_eq!(
            criteria.render_order_by(&hero(), "h").unwrap().as_deref(),
            Some("h.age desc, h.name asc")
        );
        assert_eq!(criteria.join_type_override("team"), Some(JoinType::LeftOuter));
        assert_eq!(criteria.join_type_override("powers"), Some(JoinType::None));
        assert_eq!(criteria.join_type_override("other"), None);
        assert!(criteria.has_overrides());
    }

    #[test]
    fn test_collection_restriction_rejected() {
        let criteria = Criteria::new("Hero").add(Restriction::IsNull("powers".into()));
        assert!(matches!(
            criteria.render_where(&hero(), "h"),
            Err(Error::Mapping(_))
        ));
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let criteria = Criteria::new("Hero").add(Restriction::In("id".into(), Vec::new()));
        assert_eq!(criteria.render_where(&hero(), "h").unwrap().sql, "1=0");
    }
}
