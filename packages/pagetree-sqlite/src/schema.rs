use pagetree_core::Result;
use rusqlite::Connection;

use crate::store::storage_err;

pub const NODES_TABLE: &str = "pagetree_nodes";
pub const LOCK_TABLE: &str = "pagetree_lock";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pagetree_nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id INTEGER,
  owner_id INTEGER,
  is_draft INTEGER NOT NULL DEFAULT 0,
  left_bound INTEGER NOT NULL,
  right_bound INTEGER NOT NULL,
  group_key TEXT,
  is_online INTEGER NOT NULL DEFAULT 1,
  publication_start INTEGER,
  publication_end INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_bounds
  ON pagetree_nodes(is_draft, left_bound, right_bound);
CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_parent ON pagetree_nodes(parent_id);
CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_owner ON pagetree_nodes(owner_id);

CREATE TABLE IF NOT EXISTS pagetree_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  token INTEGER NOT NULL
);
INSERT OR IGNORE INTO pagetree_lock (id, token) VALUES (1, 0);
"#;

/// Creates the node and lock tables if they do not exist yet.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL).map_err(storage_err)
}
