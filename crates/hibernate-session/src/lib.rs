//! Sessions, the persistence context and the unit of work.
//!
//! `hibernate-session` is the **runtime layer** of the engine. A
//! [`SessionFactory`] holds the immutable metamodel, the second-level cache
//! regions and the identifier generators; every [`Session`] opened from it
//! owns one connection and one [`PersistenceContext`].
//!
//! # Role In The Architecture
//!
//! - **Identity**: within a session there is at most one instance per
//!   entity key, and every load returns that instance.
//! - **Two-phase loading**: rows are read into `LOADING` instances first and
//!   initialized only after the cursor is exhausted.
//! - **Lazy references**: [`EntityProxy`] and uninitialized
//!   [`PersistentCollection`] wrappers load on first access while their
//!   session is open.
//! - **Unit of work**: persist, delete, merge and the other operations
//!   cascade across associations and are written by [`Session::flush`].
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel).build()?;
//! let mut session = factory.open_session(connection)?;
//!
//! session.begin()?;
//! let hero = session.get("Hero", 1_i64)?.expect("hero exists");
//! hero.write().set("name", "Rusty-Man")?;
//! session.commit()?; // flushes the update
//! ```

pub mod action_queue;
pub mod batch_fetch;
pub mod cache;
mod cascade;
pub mod collection;
pub mod entry;
pub mod events;
pub mod factory;
mod flush;
pub mod id;
pub mod instance;
mod load;
pub mod persistence_context;
pub mod proxy;
pub mod session;
pub mod stats;

#[cfg(test)]
mod mock;

pub use action_queue::{
    ActionQueue, CollectionOp, FlushOrderer, FlushPlan, FlushResult, PendingOp, ScheduledDelete,
};
pub use batch_fetch::{BatchFetchQueue, SubselectFetch};
pub use cache::{CacheEntry, CacheRegion, InMemoryCacheRegion};
pub use collection::{CollectionElement, CollectionEntry, PersistentCollection, SnapshotElement};
pub use entry::{EntityEntry, LockMode, Status};
pub use events::{AfterLoadAction, EntityListener, SessionEvent};
pub use factory::{SessionFactory, SessionFactoryBuilder, SessionFactoryRegistry};
pub use id::IdentifierGenerators;
pub use instance::{EntityHandle, EntityInstance, EntityRef, PropertyValue};
pub use load::{HydratedEntityRegistration, HydratedValue, LoadOptions, LogicalRow, RowShape};
pub use persistence_context::PersistenceContext;
pub use proxy::{EntityProxy, LazyReference, ProxyState, SerializableProxy};
pub use session::{ReplicationMode, Session, SessionConfig, SessionDebugInfo};
pub use stats::SessionStatistics;
