//! Database row representation.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Result;
use crate::error::{DataAccessError, DataAccessErrorKind, Error};
use crate::value::Value;

/// Column metadata shared across all rows in a result set.
///
/// Wrapped in `Arc` so every row from the same statement shares one copy.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_ascii_lowercase(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name (case-insensitive).
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(&name.to_ascii_lowercase()).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by column alias, failing if the result set lacks the column.
    pub fn column(&self, alias: &str) -> Result<&Value> {
        self.get_by_name(alias).ok_or_else(|| {
            Error::DataAccess(DataAccessError {
                kind: DataAccessErrorKind::TypeMismatch,
                sql: None,
                message: format!("result set has no column '{}'", alias),
                source: None,
            })
        })
    }

    /// Read several aliased columns in order.
    pub fn columns(&self, aliases: &[String]) -> Result<Vec<Value>> {
        aliases
            .iter()
            .map(|alias| self.column(alias).cloned())
            .collect()
    }

    /// Iterate over all values.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_basic_access() {
        let row = Row::new(
            vec!["id_0_".to_string(), "name_0_".to_string()],
            vec![Value::Int(1), Value::Text("Alice".to_string())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int(1)));
        assert_eq!(row.get_by_name("NAME_0_"), Some(&Value::Text("Alice".into())));
        assert_eq!(row.get_by_name("missing"), None);
    }

    #[test]
    fn test_row_column_errors() {
        let row = Row::new(vec!["id_0_".to_string()], vec![Value::Null]);
        assert!(row.column("id_0_").is_ok());
        assert!(row.column("data_0_").is_err());
        let values = row.columns(&["id_0_".to_string()]).unwrap();
        assert_eq!(values, vec![Value::Null]);
    }
}
