//! Filter condition rendering.
//!
//! A filter template references the filtered table as `{alias}` and its
//! parameters as `:name`. Rendering substitutes the alias, replaces every
//! parameter with a `?` placeholder and collects the bound values in the
//! order they appear in the SQL.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use hibernate_core::{Error, FilterDefinition, Result, UsageErrorKind, Value};
use regex::{Captures, Regex};

use crate::join::SqlFragment;

fn parameter_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(^|[^:\w]):([A-Za-z_][A-Za-z0-9_]*)"))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid filter parameter pattern: {e}")))
}

/// A filter enabled on a session, with its bound parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnabledFilter {
    definition: FilterDefinition,
    parameters: BTreeMap<String, Value>,
}

impl EnabledFilter {
    pub fn new(definition: FilterDefinition) -> Self {
        Self {
            definition,
            parameters: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &FilterDefinition {
        &self.definition
    }

    /// Bind a parameter declared by the filter definition.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        if !self.definition.parameters.iter().any(|p| p == name) {
            return Err(Error::usage(
                UsageErrorKind::MissingFilterParameter,
                format!("filter {} declares no parameter {}", self.name(), name),
            ));
        }
        self.parameters.insert(name.to_string(), value.into());
        Ok(self)
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Every declared parameter must be bound before the filter is applied.
    pub fn validate(&self) -> Result<()> {
        for name in &self.definition.parameters {
            if !self.parameters.contains_key(name) {
                return Err(Error::usage(
                    UsageErrorKind::MissingFilterParameter,
                    format!("filter {} parameter {} was not set", self.name(), name),
                ));
            }
        }
        Ok(())
    }

    /// Render `template` (or the definition's default) against `alias`.
    pub fn render(&self, template: Option<&str>, alias: &str) -> Result<SqlFragment> {
        let template = template
            .or(self.definition.default_condition.as_deref())
            .ok_or_else(|| {
                Error::mapping(
                    None,
                    None,
                    format!("filter {} has no condition", self.name()),
                )
            })?;
        render_condition(template, alias, self.name(), &self.parameters)
    }
}

/// Substitute `{alias}` and bind `:name` parameters.
pub fn render_condition(
    template: &str,
    alias: &str,
    filter_name: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<SqlFragment> {
    let with_alias = template.replace("{alias}", alias);
    let mut params = Vec::new();
    let mut missing: Option<String> = None;

    let sql = parameter_pattern()?.replace_all(&with_alias, |caps: &Captures<'_>| {
        let name = &caps[2];
        if let Some(value) = parameters.get(name) {
            params.push(value.clone());
        } else if missing.is_none() {
            missing = Some(name.to_string());
        }
        format!("{}?", &caps[1])
    });

    if let Some(name) = missing {
        return Err(Error::usage(
            UsageErrorKind::MissingFilterParameter,
            format!("filter {} parameter {} was not set", filter_name, name),
        ));
    }
    Ok(SqlFragment::new(format!("({})", sql), params))
}
