//! Association mapping metadata.
//!
//! To-one associations ([`ToOneMapping`]) and collections
//! ([`CollectionMapping`]) carry everything the join walker needs to decide
//! whether to outer-join, proxy or batch-load a target, plus the cascade and
//! orphan-removal flags consumed at flush time.

use crate::cascade_style::CascadeStyle;

/// Default fetch strategy of an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Outer-join the association in the owner's query. Implies eager.
    Join,
    /// Load through a separate select (eager or lazy per the `lazy` flag).
    #[default]
    Select,
    /// Collections only: load every sibling collection of the originating
    /// query with one subselect when the first one is initialized.
    Subselect,
}

/// Flavor of a to-one association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToOneKind {
    #[default]
    ManyToOne,
    OneToOne,
}

/// A many-to-one or one-to-one association.
#[derive(Debug, Clone, PartialEq)]
pub struct ToOneMapping {
    /// Target entity name.
    pub target: String,
    pub kind: ToOneKind,
    /// Foreign key columns on the owner's table. Empty for an inverse one-to-one.
    pub columns: Vec<String>,
    /// For an inverse one-to-one: the target's to-one property holding the key.
    pub mapped_by: Option<String>,
    pub fetch: FetchMode,
    pub lazy: bool,
    pub optional: bool,
    pub cascade: CascadeStyle,
    pub orphan_removal: bool,
}

impl ToOneMapping {
    /// A many-to-one through the given foreign key columns.
    #[must_use]
    pub fn many_to_one(target: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            target: target.into(),
            kind: ToOneKind::ManyToOne,
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            mapped_by: None,
            fetch: FetchMode::Select,
            lazy: true,
            optional: true,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
        }
    }

    /// An owning one-to-one through the given foreign key columns.
    #[must_use]
    pub fn one_to_one(target: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            kind: ToOneKind::OneToOne,
            ..Self::many_to_one(target, columns)
        }
    }

    /// The inverse side of a one-to-one whose key lives on the target.
    #[must_use]
    pub fn one_to_one_mapped_by(target: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: ToOneKind::OneToOne,
            columns: Vec::new(),
            mapped_by: Some(property.into()),
            fetch: FetchMode::Select,
            lazy: false,
            optional: true,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
        }
    }

    #[must_use]
    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeStyle) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, orphan_removal: bool) -> Self {
        self.orphan_removal = orphan_removal;
        self
    }

    /// Inverse one-to-one: no key column on the owner's side.
    pub fn is_inverse(&self) -> bool {
        self.mapped_by.is_some()
    }

    /// Join fetching disables laziness.
    pub fn is_eager(&self) -> bool {
        self.fetch == FetchMode::Join || !self.lazy || self.is_inverse()
    }
}

/// Collection semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionKind {
    #[default]
    Bag,
    Set,
    List,
    Array,
}

impl CollectionKind {
    /// Arrays must be fully materialized before entities are initialized.
    pub const fn is_array(self) -> bool {
        matches!(self, CollectionKind::Array)
    }

    /// Kinds that keep an explicit index column.
    pub const fn is_indexed(self) -> bool {
        matches!(self, CollectionKind::List | CollectionKind::Array)
    }
}

/// What a collection holds.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementMapping {
    /// Entities whose table carries the key columns.
    OneToMany { target: String },
    /// Entities reached through a link table; `columns` reference the target id.
    ManyToMany { target: String, columns: Vec<String> },
    /// Plain values stored in a collection table.
    Basic { column: String },
}

impl ElementMapping {
    /// Target entity name for entity-valued collections.
    pub fn target(&self) -> Option<&str> {
        match self {
            ElementMapping::OneToMany { target } | ElementMapping::ManyToMany { target, .. } => {
                Some(target)
            }
            ElementMapping::Basic { .. } => None,
        }
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self, ElementMapping::ManyToMany { .. })
    }

    pub fn is_one_to_many(&self) -> bool {
        matches!(self, ElementMapping::OneToMany { .. })
    }
}

/// A filter applied to an entity, a collection, or a many-to-many element join.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMapping {
    pub name: String,
    /// Condition template overriding the filter definition's default.
    pub condition: Option<String>,
}

impl FilterMapping {
    #[must_use]
    pub fn new(name: impl Into<String>, condition: Option<&str>) -> Self {
        Self {
            name: name.into(),
            condition: condition.map(str::to_string),
        }
    }
}

/// A collection-valued property.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMapping {
    /// `Owner.property`; filled in by the persister builder.
    pub role: String,
    pub kind: CollectionKind,
    /// Table holding the key columns: the link table for many-to-many, the
    /// element table for one-to-many (resolved by the metamodel when empty).
    pub table: String,
    /// Columns in `table` referencing the owner's identifier.
    pub key_columns: Vec<String>,
    pub index_column: Option<String>,
    pub element: ElementMapping,
    pub fetch: FetchMode,
    pub lazy: bool,
    pub cascade: CascadeStyle,
    pub orphan_removal: bool,
    /// The other side maintains the association; nothing is written from here.
    pub inverse: bool,
    /// Comma-separated `column [asc|desc]` list.
    pub order_by: Option<String>,
    pub filters: Vec<FilterMapping>,
    pub many_to_many_filters: Vec<FilterMapping>,
    pub batch_size: Option<usize>,
}

impl CollectionMapping {
    fn with_element(element: ElementMapping, table: &str, key_columns: &[&str]) -> Self {
        Self {
            role: String::new(),
            kind: CollectionKind::Bag,
            table: table.to_string(),
            key_columns: key_columns.iter().map(|c| (*c).to_string()).collect(),
            index_column: None,
            element,
            fetch: FetchMode::Select,
            lazy: true,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
            inverse: false,
            order_by: None,
            filters: Vec::new(),
            many_to_many_filters: Vec::new(),
            batch_size: None,
        }
    }

    /// A one-to-many whose element table carries `key_columns`.
    #[must_use]
    pub fn one_to_many(target: impl Into<String>, key_columns: &[&str]) -> Self {
        Self::with_element(
            ElementMapping::OneToMany {
                target: target.into(),
            },
            "",
            key_columns,
        )
    }

    /// A many-to-many through `link_table`.
    #[must_use]
    pub fn many_to_many(
        target: impl Into<String>,
        link_table: &str,
        key_columns: &[&str],
        element_columns: &[&str],
    ) -> Self {
        Self::with_element(
            ElementMapping::ManyToMany {
                target: target.into(),
                columns: element_columns.iter().map(|c| (*c).to_string()).collect(),
            },
            link_table,
            key_columns,
        )
    }

    /// A collection of basic values stored in `table`.
    #[must_use]
    pub fn elements(table: &str, key_columns: &[&str], element_column: &str) -> Self {
        Self::with_element(
            ElementMapping::Basic {
                column: element_column.to_string(),
            },
            table,
            key_columns,
        )
    }

    #[must_use]
    pub fn kind(mut self, kind: CollectionKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn index_column(mut self, column: &str) -> Self {
        self.index_column = Some(column.to_string());
        self
    }

    #[must_use]
    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeStyle) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, orphan_removal: bool) -> Self {
        self.orphan_removal = orphan_removal;
        self
    }

    #[must_use]
    pub fn inverse(mut self, inverse: bool) -> Self {
        self.inverse = inverse;
        self
    }

    #[must_use]
    pub fn order_by(mut self, order_by: &str) -> Self {
        self.order_by = Some(order_by.to_string());
        self
    }

    #[must_use]
    pub fn filter(mut self, name: &str, condition: Option<&str>) -> Self {
        self.filters.push(FilterMapping::new(name, condition));
        self
    }

    #[must_use]
    pub fn many_to_many_filter(mut self, name: &str, condition: Option<&str>) -> Self {
        self.many_to_many_filters
            .push(FilterMapping::new(name, condition));
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Join fetching disables laziness.
    pub fn is_eager(&self) -> bool {
        self.fetch == FetchMode::Join || !self.lazy
    }

    /// Render the `order by` list with every column qualified by `alias`.
    pub fn render_order_by(&self, alias: &str) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(order_by) = &self.order_by {
            for item in order_by.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                parts.push(format!("{}.{}", alias, item));
            }
        }
        if parts.is_empty() {
            if let Some(index) = &self.index_column {
                parts.push(format!("{}.{}", alias, index));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_one_eagerness() {
        let lazy = ToOneMapping::many_to_one("Team", &["team_id"]);
        assert!(!lazy.is_eager());
        assert!(lazy.fetch(FetchMode::Join).is_eager());

        let inverse = ToOneMapping::one_to_one_mapped_by("Ing", "reference");
        assert!(inverse.is_inverse());
        assert!(inverse.is_eager());
        assert!(inverse.columns.is_empty());
    }

    #[test]
    fn test_collection_order_by_rendering() {
        let coll = CollectionMapping::one_to_many("Line", &["order_id"])
            .order_by("position asc, id");
        assert_eq!(
            coll.render_order_by("line1_").as_deref(),
            Some("line1_.position asc, line1_.id")
        );

        let list = CollectionMapping::elements("tags", &["owner_id"], "tag")
            .kind(CollectionKind::List)
            .index_column("idx");
        assert_eq!(list.render_order_by("t2_").as_deref(), Some("t2_.idx"));
        assert!(list.kind.is_indexed());

        let bag = CollectionMapping::many_to_many("Tag", "item_tag", &["item_id"], &["tag_id"]);
        assert!(bag.render_order_by("x").is_none());
        assert!(bag.element.is_many_to_many());
    }
}
