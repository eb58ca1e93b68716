use postgres::Client;
use pagetree_core::Result;

use crate::store::storage_debug;

const SCHEMA_LOCK_KEY: i64 = 0x7061_6765_7472_6565; // "pagetree"

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pagetree_nodes (
  id BIGSERIAL PRIMARY KEY,
  tree_id TEXT NOT NULL,
  parent_id BIGINT,
  owner_id BIGINT,
  is_draft BOOLEAN NOT NULL DEFAULT FALSE,
  left_bound BIGINT NOT NULL,
  right_bound BIGINT NOT NULL,
  group_key TEXT,
  is_online BOOLEAN NOT NULL DEFAULT TRUE,
  publication_start TIMESTAMPTZ,
  publication_end TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_tree_bounds
  ON pagetree_nodes (tree_id, is_draft, left_bound, right_bound);

CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_tree_parent
  ON pagetree_nodes (tree_id, parent_id);

CREATE INDEX IF NOT EXISTS idx_pagetree_nodes_tree_owner
  ON pagetree_nodes (tree_id, owner_id);
"#;

pub fn ensure_schema(client: &mut Client) -> Result<()> {
    // Concurrent `CREATE ... IF NOT EXISTS` can still collide in the catalog.
    client
        .query_one("SELECT pg_advisory_lock($1)", &[&SCHEMA_LOCK_KEY])
        .map_err(storage_debug)?;

    let res = client.batch_execute(SCHEMA_SQL).map_err(storage_debug);

    // Also released when the connection closes.
    let _ = client.query_one("SELECT pg_advisory_unlock($1)", &[&SCHEMA_LOCK_KEY]);

    res
}

pub fn reset_tree_for_tests(client: &mut Client, tree_id: &str) -> Result<()> {
    client
        .execute("DELETE FROM pagetree_nodes WHERE tree_id = $1", &[&tree_id])
        .map_err(storage_debug)?;
    Ok(())
}
