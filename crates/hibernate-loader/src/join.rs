//! JOIN clause types.

use hibernate_core::Value;

/// How an association is joined into a load query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    /// Not joined; loaded by a later select or proxied.
    #[default]
    None,
    Inner,
    LeftOuter,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::None => "",
            JoinType::Inner => "inner join",
            JoinType::LeftOuter => "left outer join",
        }
    }

    pub const fn is_joined(&self) -> bool {
        !matches!(self, JoinType::None)
    }

    /// Inner joins are only safe for non-nullable associations of the root.
    ///
    /// `depth` may be negative for the element edge of a many-to-many
    /// collection that is itself the root of the load.
    pub const fn for_association(nullable: bool, depth: i64) -> JoinType {
        if !nullable && depth <= 0 {
            JoinType::Inner
        } else {
            JoinType::LeftOuter
        }
    }
}

/// SQL text with its positional parameters, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Conjoin two fragments, keeping parameter order.
    #[must_use]
    pub fn and(mut self, other: SqlFragment) -> Self {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        self.sql = format!("{} and {}", self.sql, other.sql);
        self.params.extend(other.params);
        self
    }
}

/// Accumulates rendered join clauses and their parameters.
#[derive(Debug, Clone, Default)]
pub struct JoinFragment {
    sql: String,
    params: Vec<Value>,
}

impl JoinFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `<join> table alias on lhs.c1=alias.d1 and ... and <condition>`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_join(
        &mut self,
        join_type: JoinType,
        table: &str,
        alias: &str,
        lhs_alias: &str,
        lhs_columns: &[String],
        rhs_columns: &[String],
        condition: &SqlFragment,
    ) {
        if !join_type.is_joined() {
            return;
        }
        self.sql.push(' ');
        self.sql.push_str(join_type.as_str());
        self.sql.push(' ');
        self.sql.push_str(table);
        self.sql.push(' ');
        self.sql.push_str(alias);
        self.sql.push_str(" on ");
        let on: Vec<String> = lhs_columns
            .iter()
            .zip(rhs_columns)
            .map(|(l, r)| format!("{}.{}={}.{}", lhs_alias, l, alias, r))
            .collect();
        self.sql.push_str(&on.join(" and "));
        if !condition.is_empty() {
            self.sql.push_str(" and ");
            self.sql.push_str(&condition.sql);
            self.params.extend(condition.params.iter().cloned());
        }
    }

    pub fn to_sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_join_type_for_association() {
        assert_eq!(JoinType::for_association(false, 0), JoinType::Inner);
        assert_eq!(JoinType::for_association(false, -1), JoinType::Inner);
        assert_eq!(JoinType::for_association(false, 1), JoinType::LeftOuter);
        assert_eq!(JoinType::for_association(true, 0), JoinType::LeftOuter);
        assert_eq!(JoinType::LeftOuter.as_str(), "left outer join");
    }

    #[test]
    fn test_join_fragment_renders_condition_and_params() {
        let mut fragment = JoinFragment::new();
        fragment.add_join(
            JoinType::LeftOuter,
            "item_tag",
            "tags1_",
            "item0_",
            &cols(&["id"]),
            &cols(&["item_id"]),
            &SqlFragment::default(),
        );
        fragment.add_join(
            JoinType::LeftOuter,
            "tag",
            "tag2_",
            "tags1_",
            &cols(&["tag_id"]),
            &cols(&["id"]),
            &SqlFragment::new("tag2_.active = ?", vec![Value::Bool(true)]),
        );
        fragment.add_join(
            JoinType::None,
            "nothing",
            "n3_",
            "tag2_",
            &cols(&["x"]),
            &cols(&["y"]),
            &SqlFragment::default(),
        );
        assert_eq!(
            fragment.to_sql(),
            " left outer join item_tag tags1_ on item0_.id=tags1_.item_id \
             left outer join tag tag2_ on tags1_.tag_id=tag2_.id and tag2_.active = ?"
        );
        assert_eq!(fragment.params(), &[Value::Bool(true)]);
    }

    #[test]
    fn test_fragment_and_keeps_order() {
        let a = SqlFragment::new("a = ?", vec![Value::BigInt(1)]);
        let b = SqlFragment::new("b = ?", vec![Value::BigInt(2)]);
        let both = a.and(SqlFragment::default()).and(b);
        assert_eq!(both.sql, "a = ? and b = ?");
        assert_eq!(both.params, vec![Value::BigInt(1), Value::BigInt(2)]);
    }
}
