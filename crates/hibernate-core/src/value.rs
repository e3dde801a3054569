//! Dynamic SQL values.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{DataAccessError, DataAccessErrorKind, Error};

/// A dynamically-typed SQL value.
///
/// Values flow in both directions: they are bound as statement parameters and
/// read back from result rows. Entity identifiers, versions and basic property
/// state are all carried as `Value`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values (also used for composite identifiers)
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Components of a composite value, or the value itself as a single component.
    pub fn components(&self) -> &[Value] {
        match self {
            Value::Array(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Normalize a value for use as an identifier.
    ///
    /// Drivers may read a small `INTEGER` back as `Int` while an assigned
    /// identifier was a `BigInt`; both must address the same row.
    #[must_use]
    pub fn normalized(&self) -> Value {
        match self {
            Value::Int(v) => Value::BigInt(i64::from(*v)),
            Value::Bool(v) => Value::BigInt(i64::from(*v)),
            Value::Array(items) => Value::Array(items.iter().map(Value::normalized).collect()),
            other => other.clone(),
        }
    }

    /// Identity comparison: numeric widths are ignored and floats compare by bits.
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self.normalized(), other.normalized()) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_identity(y))
            }
            (a, b) => a == b,
        }
    }

    /// Feed the identity of this value into a hasher.
    ///
    /// Consistent with [`Value::same_identity`].
    pub fn hash_identity(&self, hasher: &mut impl Hasher) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                i64::from(*b).hash(hasher);
            }
            Value::Int(i) => {
                1u8.hash(hasher);
                i64::from(*i).hash(hasher);
            }
            Value::BigInt(i) => {
                1u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                2u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Text(s) => {
                3u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                4u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Json(j) => {
                5u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::Array(items) => {
                6u8.hash(hasher);
                items.len().hash(hasher);
                for item in items {
                    item.hash_identity(hasher);
                }
            }
        }
    }

    /// Increment a numeric version value.
    pub fn next_version(&self) -> crate::Result<Value> {
        match self {
            Value::Null => Ok(Value::BigInt(1)),
            Value::Int(v) => Ok(Value::BigInt(i64::from(*v) + 1)),
            Value::BigInt(v) => Ok(Value::BigInt(v + 1)),
            other => Err(Error::DataAccess(DataAccessError {
                kind: DataAccessErrorKind::TypeMismatch,
                sql: None,
                message: format!("cannot increment version of type {}", other.type_name()),
                source: None,
            })),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}
