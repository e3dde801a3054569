//! Table and column alias generation.
//!
//! Table aliases have the form `name3_`: the unqualified entity name or
//! collection role, lowercased and truncated, followed by a uniquing number.
//! The root of a query gets `0`; each joined association gets the number of
//! associations already in the tree plus one.

const ALIAS_TRUNCATE_LENGTH: usize = 10;

/// Generate a table alias for an entity name or collection role.
pub fn generate_alias(description: &str, unique: usize) -> String {
    format!("{}{}_", alias_root(description), unique)
}

fn alias_root(description: &str) -> String {
    let unqualified = description.rsplit('.').next().unwrap_or(description);
    let truncated: String = unqualified
        .chars()
        .take(ALIAS_TRUNCATE_LENGTH)
        .collect::<String>()
        .to_lowercase()
        .replace(['/', '$'], "_");

    let mut root = match truncated.char_indices().find(|(_, c)| c.is_alphabetic()) {
        Some((start, _)) => truncated[start..].to_string(),
        None => truncated,
    };
    if root.is_empty() || root.ends_with(|c: char| c.is_ascii_digit()) {
        root.push('x');
    }
    root
}

/// Column-alias suffix for the `n`th entity reference of a plan.
pub fn entity_suffix(n: usize) -> String {
    format!("{}_", n)
}

/// Column-alias suffix for the `n`th collection reference of a plan.
pub fn collection_suffix(n: usize) -> String {
    format!("{}c_", n)
}

/// Result-set alias of `column` under `suffix`.
pub fn column_alias(column: &str, suffix: &str) -> String {
    format!("{}_{}", column, suffix)
}

pub fn column_aliases(columns: &[String], suffix: &str) -> Vec<String> {
    columns.iter().map(|c| column_alias(c, suffix)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_alias() {
        assert_eq!(generate_alias("Order", 0), "order0_");
        assert_eq!(generate_alias("Order.lines", 2), "lines2_");
        assert_eq!(generate_alias("com.acme.CustomerAccount", 1), "customerac1_");
        assert_eq!(generate_alias("Item2", 3), "item2x3_");
        assert_eq!(generate_alias("_tags", 1), "tags1_");
    }

    #[test]
    fn test_column_aliases() {
        assert_eq!(column_alias("id", &entity_suffix(0)), "id_0_");
        assert_eq!(column_alias("order_id", &collection_suffix(1)), "order_id_1c_");
        assert_eq!(
            column_aliases(&["a".to_string(), "b".to_string()], "2_"),
            vec!["a_2_".to_string(), "b_2_".to_string()]
        );
    }
}
