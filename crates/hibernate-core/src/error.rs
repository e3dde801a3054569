//! Error types for persistence-context, loading and flush operations.
//!
//! Every failure the engine can report falls into one of the categories below.
//! The categories differ in what a caller may do next:
//!
//! - [`Error::Mapping`] is a static configuration defect; fix the mapping.
//! - [`Error::Assertion`] means the unit of work is corrupted; discard the session.
//! - [`Error::DataAccess`] is a driver failure; the operation as a whole failed.
//! - [`Error::LazyInitialization`] concerns one proxy or collection only.
//! - [`Error::StaleState`] is an optimistic-lock conflict; refresh or evict and retry.

use std::fmt;

use crate::value::Value;

/// The primary error type for all engine operations.
#[derive(Debug)]
pub enum Error {
    /// Static mapping defect detected while building metadata or plans
    Mapping(MappingError),
    /// Identity or state invariant violated inside the persistence context
    Assertion(AssertionFailure),
    /// SQL or connection failure reported by the driver
    DataAccess(DataAccessError),
    /// A proxy or collection could not be resolved
    LazyInitialization(LazyInitializationError),
    /// Optimistic-lock failure: the row changed or vanished since it was read
    StaleState(StaleStateError),
    /// A row expected to exist was not found
    ObjectNotFound(ObjectNotFoundError),
    /// The API was used incorrectly
    Usage(UsageError),
    /// Settings could not be read
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub message: String,
    pub entity_name: Option<String>,
    pub property: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssertionFailure {
    pub message: String,
}

#[derive(Debug)]
pub struct DataAccessError {
    pub kind: DataAccessErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccessErrorKind {
    /// Failed to open or lost the connection
    Connection,
    /// Statement could not be prepared or executed
    Statement,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Database busy or locked (retry may succeed)
    Busy,
    /// Statement interrupted mid-execution
    Interrupted,
    /// Connection already closed
    Closed,
    /// A column value had an unexpected type
    TypeMismatch,
}

#[derive(Debug, Clone)]
pub struct LazyInitializationError {
    pub kind: LazyInitializationErrorKind,
    pub entity_name: String,
    pub identifier: Option<Value>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyInitializationErrorKind {
    /// The proxy was never bound to a session, or was detached by `clear`
    NoSession,
    /// The owning session has been closed
    SessionClosed,
    /// The owning session is open but its connection has ended
    ConnectionClosed,
    /// Resolution was attempted through a session that does not own the proxy
    ForeignSession,
    /// Elements of an uninitialized collection were read
    UninitializedCollection,
}

#[derive(Debug, Clone)]
pub struct StaleStateError {
    pub entity_name: String,
    pub identifier: Value,
    pub version: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ObjectNotFoundError {
    pub entity_name: String,
    pub identifier: Value,
}

#[derive(Debug, Clone)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// A persistent object references an unsaved transient instance
    TransientObject,
    /// Operation on an entity already scheduled for deletion
    DeletedEntity,
    /// A different instance with the same identifier is already managed
    NonUniqueObject,
    /// The session has been closed
    SessionClosed,
    /// The operation requires an active transaction
    NoTransaction,
    /// A transaction is already active
    TransactionActive,
    /// Filter name not defined in the metamodel
    UnknownFilter,
    /// An enabled filter is missing a parameter value
    MissingFilterParameter,
    /// Fetch profile name not defined in the metamodel
    UnknownFetchProfile,
    /// An assigned identifier was required but not set
    IdentifierRequired,
    /// The session factory has been closed
    FactoryClosed,
    /// Unknown entity name or property
    UnknownEntity,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a mapping error for an entity (and optionally one of its properties).
    pub fn mapping(
        entity_name: Option<&str>,
        property: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            message: message.into(),
            entity_name: entity_name.map(str::to_string),
            property: property.map(str::to_string),
        })
    }

    /// Build an internal assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(AssertionFailure {
            message: message.into(),
        })
    }

    /// Build a usage error.
    pub fn usage(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind,
            message: message.into(),
        })
    }

    /// Build a lazy-initialization error for an entity proxy.
    pub fn lazy(
        kind: LazyInitializationErrorKind,
        entity_name: impl Into<String>,
        identifier: Option<Value>,
    ) -> Self {
        Error::LazyInitialization(LazyInitializationError {
            kind,
            entity_name: entity_name.into(),
            identifier,
            role: None,
        })
    }

    /// Is this a retryable error (busy database)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DataAccess(e) => matches!(e.kind, DataAccessErrorKind::Busy),
            _ => false,
        }
    }

    /// Is this an optimistic-lock failure?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Does this error mean the owning session must be discarded?
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }

    /// Is this a lazy-initialization failure?
    pub fn is_lazy_initialization(&self) -> bool {
        matches!(self, Error::LazyInitialization(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::DataAccess(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Assertion(e) => write!(f, "Assertion failure: {}", e.message),
            Error::DataAccess(e) => write!(f, "Data access error: {}", e),
            Error::LazyInitialization(e) => write!(f, "Lazy initialization error: {}", e),
            Error::StaleState(e) => write!(f, "Stale state: {}", e),
            Error::ObjectNotFound(e) => write!(
                f,
                "No row with the given identifier exists: [{}#{:?}]",
                e.entity_name, e.identifier
            ),
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::DataAccess(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity_name, &self.property) {
            (Some(entity), Some(property)) => {
                write!(f, "{} [{}.{}]", self.message, entity, property)
            }
            (Some(entity), None) => write!(f, "{} [{}]", self.message, entity),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for DataAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} [{}]", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for LazyInitializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.kind {
            LazyInitializationErrorKind::NoSession => "could not initialize proxy - no Session",
            LazyInitializationErrorKind::SessionClosed => {
                "could not initialize proxy - the owning Session was closed"
            }
            LazyInitializationErrorKind::ConnectionClosed => {
                "could not initialize proxy - the owning Session is disconnected"
            }
            LazyInitializationErrorKind::ForeignSession => {
                "could not initialize proxy - it belongs to another Session"
            }
            LazyInitializationErrorKind::UninitializedCollection => {
                "failed to lazily initialize a collection"
            }
        };
        match (&self.role, &self.identifier) {
            (Some(role), _) => write!(f, "{} [{}]", reason, role),
            (None, Some(id)) => write!(f, "{} [{}#{:?}]", reason, self.entity_name, id),
            (None, None) => write!(f, "{} [{}]", reason, self.entity_name),
        }
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Row was updated or deleted by another transaction: [{}#{:?}]",
            self.entity_name, self.identifier
        )
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<DataAccessError> for Error {
    fn from(err: DataAccessError) -> Self {
        Error::DataAccess(err)
    }
}

impl From<LazyInitializationError> for Error {
    fn from(err: LazyInitializationError) -> Self {
        Error::LazyInitialization(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_helpers() {
        let stale = Error::StaleState(StaleStateError {
            entity_name: "Item".to_string(),
            identifier: Value::BigInt(1),
            version: Some(Value::BigInt(3)),
        });
        assert!(stale.is_stale_state());
        assert!(!stale.is_retryable());
        assert!(!stale.is_fatal_to_session());

        let collision = Error::assertion("duplicate instance");
        assert!(collision.is_fatal_to_session());

        let busy = Error::DataAccess(DataAccessError {
            kind: DataAccessErrorKind::Busy,
            sql: Some("select 1".to_string()),
            message: "database is locked".to_string(),
            source: None,
        });
        assert!(busy.is_retryable());
        assert_eq!(busy.sql(), Some("select 1"));
    }

    #[test]
    fn test_lazy_display_names_entity() {
        let err = Error::lazy(
            LazyInitializationErrorKind::NoSession,
            "Editor",
            Some(Value::BigInt(7)),
        );
        assert!(err.is_lazy_initialization());
        let text = err.to_string();
        assert!(text.contains("no Session"));
        assert!(text.contains("Editor"));
    }

    #[test]
    fn test_mapping_display_includes_path() {
        let err = Error::mapping(Some("Order"), Some("lines"), "column arity mismatch");
        assert_eq!(
            err.to_string(),
            "Mapping error: column arity mismatch [Order.lines]"
        );
    }
}
