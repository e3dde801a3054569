//! Edges of the join tree.

use hibernate_core::{Error, Result};

use crate::join::{JoinFragment, JoinType, SqlFragment};

/// What an edge of the join tree fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// A many-to-one or one-to-one property of the left-hand entity.
    ToOne {
        entity_name: String,
        property: usize,
        one_to_one: bool,
        inverse: bool,
    },
    /// A key-many-to-one component of the left-hand entity's identifier.
    IdentifierComponent { entity_name: String, component: usize },
    /// A collection property of the left-hand entity.
    Collection { role: String, many_to_many: bool },
    /// The element side of a many-to-many collection, joined from its link table.
    ManyToManyElement { role: String },
}

/// One outer-joined association: the right-hand table joined to an alias
/// already present in the query.
#[derive(Debug, Clone, PartialEq)]
pub struct OuterJoinableAssociation {
    path: String,
    kind: AssociationKind,
    joinable: String,
    table: String,
    join_type: JoinType,
    lhs_alias: String,
    lhs_columns: Vec<String>,
    rhs_alias: String,
    rhs_columns: Vec<String>,
    on: SqlFragment,
    many_to_many_filter: SqlFragment,
    depth: i64,
    owner: Option<usize>,
}

impl OuterJoinableAssociation {
    /// Create an edge, rejecting join column lists that cannot be paired.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<String>,
        kind: AssociationKind,
        joinable: impl Into<String>,
        table: impl Into<String>,
        join_type: JoinType,
        lhs_alias: impl Into<String>,
        lhs_columns: Vec<String>,
        rhs_alias: impl Into<String>,
        rhs_columns: Vec<String>,
        on: SqlFragment,
        depth: i64,
    ) -> Result<Self> {
        let path = path.into();
        if lhs_columns.is_empty() || lhs_columns.len() != rhs_columns.len() {
            return Err(Error::mapping(
                None,
                Some(&path),
                format!(
                    "cannot join {} columns to {} columns",
                    lhs_columns.len(),
                    rhs_columns.len()
                ),
            ));
        }
        Ok(Self {
            path,
            kind,
            joinable: joinable.into(),
            table: table.into(),
            join_type,
            lhs_alias: lhs_alias.into(),
            lhs_columns,
            rhs_alias: rhs_alias.into(),
            rhs_columns,
            on,
            many_to_many_filter: SqlFragment::default(),
            depth,
            owner: None,
        })
    }

    /// Filter conjoined to the join condition when this element edge directly
    /// follows its collection edge.
    #[must_use]
    pub fn with_many_to_many_filter(mut self, filter: SqlFragment) -> Self {
        self.many_to_many_filter = filter;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &AssociationKind {
        &self.kind
    }

    /// Entity name or collection role of the joined side.
    pub fn joinable(&self) -> &str {
        &self.joinable
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn lhs_alias(&self) -> &str {
        &self.lhs_alias
    }

    pub fn lhs_columns(&self) -> &[String] {
        &self.lhs_columns
    }

    pub fn rhs_alias(&self) -> &str {
        &self.rhs_alias
    }

    pub fn rhs_columns(&self) -> &[String] {
        &self.rhs_columns
    }

    pub fn on(&self) -> &SqlFragment {
        &self.on
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// Entity reference owning this edge; only one-to-one and collection
    /// edges have one.
    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Option<usize>) {
        self.owner = owner;
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AssociationKind::Collection { .. })
    }

    pub fn is_one_to_one(&self) -> bool {
        matches!(
            self.kind,
            AssociationKind::ToOne {
                one_to_one: true,
                ..
            }
        )
    }

    /// Is `other` the element join of this many-to-many collection edge?
    pub fn is_many_to_many_with(&self, other: &OuterJoinableAssociation) -> bool {
        match (&self.kind, &other.kind) {
            (
                AssociationKind::Collection {
                    role,
                    many_to_many: true,
                },
                AssociationKind::ManyToManyElement { role: element_role },
            ) => role == element_role && other.lhs_alias == self.rhs_alias,
            _ => false,
        }
    }

    pub fn add_joins(&self, fragment: &mut JoinFragment) {
        fragment.add_join(
            self.join_type,
            &self.table,
            &self.rhs_alias,
            &self.lhs_alias,
            &self.lhs_columns,
            &self.rhs_columns,
            &self.on,
        );
    }

    /// Join the element table with the collection's many-to-many filter
    /// conjoined to the join condition.
    pub fn add_many_to_many_join(&self, fragment: &mut JoinFragment) {
        let condition = self.on.clone().and(self.many_to_many_filter.clone());
        fragment.add_join(
            self.join_type,
            &self.table,
            &self.rhs_alias,
            &self.lhs_alias,
            &self.lhs_columns,
            &self.rhs_columns,
            &condition,
        );
    }
}

/// Render the join clauses of `associations` in order, merging each
/// many-to-many element edge with its collection edge.
pub fn merge_outer_joins(associations: &[OuterJoinableAssociation]) -> JoinFragment {
    let mut fragment = JoinFragment::new();
    let mut last: Option<&OuterJoinableAssociation> = None;
    for association in associations {
        if last.is_some_and(|l| l.is_many_to_many_with(association)) {
            association.add_many_to_many_join(&mut fragment);
        } else {
            association.add_joins(&mut fragment);
        }
        last = Some(association);
    }
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernate_core::Value;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn tags_edge() -> OuterJoinableAssociation {
        OuterJoinableAssociation::new(
            "tags",
            AssociationKind::Collection {
                role: "Item.tags".into(),
                many_to_many: true,
            },
            "Item.tags",
            "item_tag",
            JoinType::LeftOuter,
            "item0_",
            cols(&["id"]),
            "tags1_",
            cols(&["item_id"]),
            SqlFragment::default(),
            0,
        )
        .unwrap()
    }

    fn tag_edge(lhs: &str) -> OuterJoinableAssociation {
        OuterJoinableAssociation::new(
            "tags",
            AssociationKind::ManyToManyElement {
                role: "Item.tags".into(),
            },
            "Tag",
            "tag",
            JoinType::LeftOuter,
            lhs,
            cols(&["tag_id"]),
            "tag2_",
            cols(&["id"]),
            SqlFragment::default(),
            0,
        )
        .unwrap()
        .with_many_to_many_filter(SqlFragment::new("(tag2_.active = ?)", vec![Value::Bool(true)]))
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let err = OuterJoinableAssociation::new(
            "customer",
            AssociationKind::ToOne {
                entity_name: "Order".into(),
                property: 0,
                one_to_one: false,
                inverse: false,
            },
            "Customer",
            "customer",
            JoinType::LeftOuter,
            "order0_",
            cols(&["a", "b"]),
            "customer1_",
            cols(&["id"]),
            SqlFragment::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Mapping(ref m) if m.property.as_deref() == Some("customer")));
    }

    #[test]
    fn test_many_to_many_merge_conjoins_filter() {
        let edges = vec![tags_edge(), tag_edge("tags1_")];
        assert!(edges[0].is_many_to_many_with(&edges[1]));
        let fragment = merge_outer_joins(&edges);
        assert_eq!(
            fragment.to_sql(),
            " left outer join item_tag tags1_ on item0_.id=tags1_.item_id \
             left outer join tag tag2_ on tags1_.tag_id=tag2_.id and (tag2_.active = ?)"
        );
        assert_eq!(fragment.params(), &[Value::Bool(true)]);
    }

    #[test]
    fn test_unrelated_element_edge_is_not_merged() {
        let edges = vec![tags_edge(), tag_edge("other9_")];
        assert!(!edges[0].is_many_to_many_with(&edges[1]));
        let fragment = merge_outer_joins(&edges);
        assert!(fragment.params().is_empty());
        assert!(!fragment.to_sql().contains("active"));
    }
}
