//! Outer-join walking and load plan generation.
//!
//! Given a [`Metamodel`](hibernate_core::Metamodel), the [`JoinWalker`]
//! decides which associations of a root entity or collection are fetched in
//! the same query, assigns table and column aliases, and renders the SQL.
//! The resulting [`LoadPlan`] carries the descriptors the row reader uses to
//! rebuild entities and collection elements from each row.
//!
//! - [`walker`] - association traversal and SQL rendering
//! - [`association`] / [`join`] - join tree edges and join clause rendering
//! - [`influencers`] / [`filter`] - session filters, fetch profiles and per-query overrides
//! - [`criteria`] - restriction and ordering queries on a root entity
//! - [`plan`] - the plan and its reference descriptors
//! - [`cache`] - LRU cache of generated plans

pub mod alias;
pub mod association;
pub mod cache;
pub mod criteria;
pub mod filter;
pub mod influencers;
pub mod join;
pub mod plan;
pub mod walker;

pub use association::{AssociationKind, OuterJoinableAssociation, merge_outer_joins};
pub use cache::{PlanCache, plan_key};
pub use criteria::{Criteria, Order, Restriction};
pub use filter::EnabledFilter;
pub use influencers::{LoadQueryInfluencers, NoOverrides, TraversalOverrides};
pub use join::{JoinFragment, JoinType, SqlFragment};
pub use plan::{
    CollectionElementDef, CollectionReferenceDef, EntityReferenceDef, EntitySource, Hydratable,
    KeyResolvable, LoadPlan, PlanRoot,
};
pub use walker::{CollectionRestriction, EntityRestriction, JoinWalker};
