//! Core types for the persistence-context and outer-join loading engine.
//!
//! This crate provides the foundations every other crate builds on:
//!
//! - [`Value`] and [`Row`] for dynamically typed SQL data
//! - [`Connection`], the synchronous driver contract
//! - [`EntityKey`] / [`CollectionKey`], the identity tokens of a persistence context
//! - [`EntityPersister`] and association mappings, the read-only mapping metadata
//! - [`Metamodel`], the validated set of persisters, filters and fetch profiles
//! - [`Settings`] and the [`Error`] taxonomy

pub mod association;
pub mod cascade_style;
pub mod connection;
pub mod error;
pub mod keys;
pub mod metamodel;
pub mod persister;
pub mod row;
pub mod settings;
pub mod value;

pub use association::{
    CollectionKind, CollectionMapping, ElementMapping, FetchMode, FilterMapping, ToOneKind,
    ToOneMapping,
};
pub use cascade_style::{CascadeAction, CascadeStyle};
pub use connection::{Connection, IsolationLevel, Rows};
pub use error::{
    AssertionFailure, ConfigError, DataAccessError, DataAccessErrorKind, Error,
    LazyInitializationError, LazyInitializationErrorKind, MappingError, ObjectNotFoundError,
    Result, StaleStateError, UsageError, UsageErrorKind,
};
pub use keys::{CollectionKey, EntityKey, EntityUniqueKey};
pub use metamodel::{FetchProfile, FilterDefinition, Metamodel, MetamodelBuilder};
pub use persister::{
    Cascadable, CascadePoint, CascadedAssociation, EntityPersister, IdComponent, IdGenerator,
    IdentifierMapping, PersisterBuilder, PropertyKind, PropertyMapping, VersionMapping,
};
pub use row::{ColumnInfo, Row};
pub use settings::Settings;
pub use value::Value;
