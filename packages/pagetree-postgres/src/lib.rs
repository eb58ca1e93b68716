#![forbid(unsafe_code)]
//! PostgreSQL backend for the page tree.
//!
//! Several trees can share one `pagetree_nodes` table; each store is scoped to
//! a `tree_id`. Structural writers take a self-conflicting table lock that
//! plain readers pass through.

mod schema;
mod store;

pub use schema::{ensure_schema, reset_tree_for_tests};
pub use store::PostgresStore;
