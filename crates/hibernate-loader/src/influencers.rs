//! Session-level influences on load query generation.
//!
//! [`LoadQueryInfluencers`] carries the filters and fetch profiles enabled on
//! a session. [`TraversalOverrides`] lets an individual query force or
//! suppress joins for specific association paths; it takes priority over
//! fetch profiles, which take priority over the mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use hibernate_core::{Error, FilterMapping, Metamodel, Result, UsageErrorKind};

use crate::filter::EnabledFilter;
use crate::join::{JoinType, SqlFragment};

/// Per-query join decisions keyed by association path (`customer.address`).
pub trait TraversalOverrides {
    /// `Some(JoinType::None)` suppresses the join; any other value forces it.
    fn join_type_override(&self, path: &str) -> Option<JoinType> {
        let _ = path;
        None
    }

    /// Whether the override set affects SQL shape at all.
    fn has_overrides(&self) -> bool {
        false
    }
}

/// Mapping and profile defaults only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl TraversalOverrides for NoOverrides {}

/// Filters and fetch profiles enabled on a session.
#[derive(Debug, Clone, Default)]
pub struct LoadQueryInfluencers {
    filters: BTreeMap<String, EnabledFilter>,
    fetch_profiles: BTreeSet<String>,
}

impl LoadQueryInfluencers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable a filter defined in the metamodel; parameters are bound on the result.
    pub fn enable_filter(&mut self, metamodel: &Metamodel, name: &str) -> Result<&mut EnabledFilter> {
        let definition = metamodel.filter_definition(name).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::UnknownFilter,
                format!("no filter named {}", name),
            )
        })?;
        Ok(self
            .filters
            .entry(name.to_string())
            .or_insert_with(|| EnabledFilter::new(definition.clone())))
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.filters.remove(name);
    }

    pub fn enabled_filter(&self, name: &str) -> Option<&EnabledFilter> {
        self.filters.get(name)
    }

    pub fn enabled_filter_mut(&mut self, name: &str) -> Option<&mut EnabledFilter> {
        self.filters.get_mut(name)
    }

    pub fn has_enabled_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    pub fn enabled_filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn enable_fetch_profile(&mut self, metamodel: &Metamodel, name: &str) -> Result<()> {
        if metamodel.fetch_profile(name).is_none() {
            return Err(Error::usage(
                UsageErrorKind::UnknownFetchProfile,
                format!("no fetch profile named {}", name),
            ));
        }
        self.fetch_profiles.insert(name.to_string());
        Ok(())
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.fetch_profiles.remove(name);
    }

    pub fn is_fetch_profile_enabled(&self, name: &str) -> bool {
        self.fetch_profiles.contains(name)
    }

    /// Does any enabled fetch profile join-fetch `entity.property`?
    pub fn profile_joins(&self, metamodel: &Metamodel, entity: &str, property: &str) -> bool {
        self.fetch_profiles.iter().any(|name| {
            metamodel
                .fetch_profile(name)
                .is_some_and(|profile| profile.joins(entity, property))
        })
    }

    /// Every enabled filter must have all of its parameters bound.
    pub fn validate(&self) -> Result<()> {
        self.filters.values().try_for_each(EnabledFilter::validate)
    }

    /// Render the conjunction of the enabled filters among `mappings`.
    pub fn filter_condition(&self, mappings: &[FilterMapping], alias: &str) -> Result<SqlFragment> {
        let mut condition = SqlFragment::default();
        for mapping in mappings {
            if let Some(filter) = self.filters.get(&mapping.name) {
                condition = condition.and(filter.render(mapping.condition.as_deref(), alias)?);
            }
        }
        Ok(condition)
    }

    /// Key under which plans built with these influencers may be cached.
    ///
    /// Filter parameter values are baked into a plan, so nothing built while a
    /// filter is enabled is cacheable.
    pub fn cache_key(&self) -> Option<u64> {
        if self.has_enabled_filters() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        self.fetch_profiles.hash(&mut hasher);
        Some(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernate_core::{EntityPersister, FetchProfile, FilterDefinition, ToOneMapping, Value};

    fn model() -> Metamodel {
        let team = EntityPersister::builder("Team", "team")
            .identifier("id", "id")
            .filter("active", None)
            .build()
            .unwrap();
        let hero = EntityPersister::builder("Hero", "hero")
            .identifier("id", "id")
            .to_one("team", ToOneMapping::many_to_one("Team", &["team_id"]))
            .build()
            .unwrap();
        Metamodel::builder()
            .entity(team)
            .entity(hero)
            .filter(FilterDefinition::new(
                "active",
                &["flag"],
                Some("{alias}.active = :flag"),
            ))
            .fetch_profile(FetchProfile::new("with-team").join("Hero", "team"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_filter_and_profile() {
        let model = model();
        let mut influencers = LoadQueryInfluencers::new();
        assert!(influencers.enable_filter(&model, "nope").is_err());
        let err = influencers.enable_fetch_profile(&model, "nope").unwrap_err();
        assert!(matches!(
            err,
            Error::Usage(ref u) if u.kind == UsageErrorKind::UnknownFetchProfile
        ));
    }

    #[test]
    fn test_filter_condition_and_validation() {
        let model = model();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_filter(&model, "active").unwrap();
        assert!(influencers.validate().is_err());
        assert!(influencers.cache_key().is_none());

        influencers
            .enabled_filter_mut("active")
            .unwrap()
            .set_parameter("flag", true)
            .unwrap();
        influencers.validate().unwrap();

        let team = model.persister("Team").unwrap();
        let condition = influencers.filter_condition(team.filters(), "team1_").unwrap();
        assert_eq!(condition.sql, "(team1_.active = ?)");
        assert_eq!(condition.params, vec![Value::Bool(true)]);

        influencers.disable_filter("active");
        assert!(influencers.filter_condition(team.filters(), "team1_").unwrap().is_empty());
    }

    #[test]
    fn test_fetch_profile_joins() {
        let model = model();
        let mut influencers = LoadQueryInfluencers::new();
        assert!(!influencers.profile_joins(&model, "Hero", "team"));
        let plain = influencers.cache_key();
        influencers.enable_fetch_profile(&model, "with-team").unwrap();
        assert!(influencers.profile_joins(&model, "Hero", "team"));
        assert_ne!(influencers.cache_key(), plain);
        influencers.disable_fetch_profile("with-team");
        assert!(!influencers.is_fetch_profile_enabled("with-team"));
    }
}
