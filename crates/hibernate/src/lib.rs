//! Hibernate Rust - a persistence-context and outer-join loading engine.
//!
//! The engine maps entities onto relational tables through a runtime
//! [`Metamodel`] and keeps, per [`Session`], exactly one in-memory instance
//! per row:
//!
//! - Identity-preserving, two-phase loading of outer-joined object graphs
//! - Lazy [`EntityProxy`] references and lazily initialized collections
//! - Batch and subselect fetching of sibling references
//! - Cascaded persist/delete/merge and a dependency-ordered flush
//! - Optimistic locking through version columns
//! - A pluggable second-level cache
//!
//! # Quick Start
//!
//! ```ignore
//! use hibernate::prelude::*;
//!
//! let metamodel = Metamodel::builder()
//!     .entity(
//!         EntityPersister::builder("Hero", "hero")
//!             .identifier("id", "id")
//!             .version("version", "version")
//!             .basic("name", "name")
//!             .build()?,
//!     )
//!     .build()?;
//! let factory = SessionFactory::builder(metamodel).build()?;
//!
//! let mut session = factory.open_session(SqliteConnection::open_memory()?)?;
//! session.begin()?;
//! let hero = session.instantiate("Hero")?;
//! hero.write().set_identifier(Some(Value::BigInt(1)));
//! hero.write().set("name", "Deadpond")?;
//! session.persist(&hero)?;
//! session.commit()?;
//! ```
//!
//! # Crates
//!
//! - `hibernate-core`: values, errors, the metamodel and the connection trait
//! - `hibernate-loader`: the join walker and load plans
//! - `hibernate-session`: sessions, the persistence context and flushing
//! - `hibernate-sqlite`: a SQLite connection (feature `sqlite`, on by default)

pub use hibernate_core::{
    CascadeStyle, CollectionKey, CollectionKind, CollectionMapping, Connection, DataAccessError,
    DataAccessErrorKind, ElementMapping, EntityKey, EntityPersister, EntityUniqueKey, Error,
    FetchMode, FetchProfile, FilterDefinition, IdComponent, IdGenerator, IsolationLevel,
    LazyInitializationError, LazyInitializationErrorKind, MappingError, Metamodel,
    MetamodelBuilder, ObjectNotFoundError, PersisterBuilder, Result, Row, Rows, Settings,
    StaleStateError, ToOneKind, ToOneMapping, UsageError, UsageErrorKind, Value,
};
pub use hibernate_loader::{Criteria, EnabledFilter, JoinType, LoadPlan, Order, Restriction};
pub use hibernate_session::{
    AfterLoadAction, CacheEntry, CacheRegion, CollectionElement, EntityEntry, EntityHandle,
    EntityInstance, EntityListener, EntityProxy, EntityRef, InMemoryCacheRegion, LazyReference,
    LockMode, LogicalRow, PersistenceContext, PersistentCollection, PropertyValue, ProxyState,
    ReplicationMode, RowShape, SerializableProxy, Session, SessionConfig, SessionEvent,
    SessionFactory, SessionFactoryBuilder, SessionFactoryRegistry, SessionStatistics, Status,
};

#[cfg(feature = "sqlite")]
pub use hibernate_sqlite::{OpenFlags, SqliteConfig, SqliteConnection};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use hibernate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CascadeStyle, CollectionKind, CollectionMapping, Connection, Criteria, EntityHandle,
        EntityPersister, EntityProxy, EntityRef, Error, FetchMode, FilterDefinition,
        IdGenerator, LockMode, Metamodel, PersistentCollection, ReplicationMode, Restriction,
        Result, Session, SessionConfig, SessionFactory, Settings, ToOneMapping, Value,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::{SqliteConfig, SqliteConnection};
}
