#![forbid(unsafe_code)]
//! SQLite backend for the page tree.
//!
//! Rows live in `pagetree_nodes`; structural writers serialize on the
//! single-row `pagetree_lock` table. File databases run in WAL mode so
//! lock-free reads see the last committed tree while a writer holds the lock.

mod schema;
mod store;

pub use schema::{ensure_schema, LOCK_TABLE, NODES_TABLE};
pub use store::SqliteStore;
