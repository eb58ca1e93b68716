#![forbid(unsafe_code)]
//! Nested-set page hierarchy with publication-aware reads.
//!
//! [`PageTree`] keeps a left/right interval for every canonical page so that
//! ancestor, descendant and sibling queries are plain range comparisons.
//! Structural edits run as whole-tree-locking transactions against any store
//! implementing [`NodeStore`]; reads go through a [`PublicationContext`] that
//! decides whether unpublished pages are visible.

pub mod config;
pub mod error;
pub mod ids;
pub mod invariants;
pub mod node;
pub mod publication;
pub mod query;
pub mod traits;
pub mod tree;

pub use config::TreeConfig;
pub use error::{Error, Result};
pub use ids::NodeId;
pub use invariants::check_canonical;
pub use node::{Bounds, NewNode, Node, NodeAttrs, Placement, Publication};
pub use publication::{
    truncate_to_minute, LiveFilter, PublicationContext, ScopeGuard, ScopeMode,
};
pub use query::{NodeFilter, Relation};
pub use traits::{Clock, FixedClock, MemoryStore, NodeStore, SystemClock, TreeTransaction};
pub use tree::{Direction, MoveOutcome, PageTree, RebuildReport, SiblingMove};
