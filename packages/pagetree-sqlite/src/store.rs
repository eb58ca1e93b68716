use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pagetree_core::{
    Bounds, Error, NewNode, Node, NodeFilter, NodeId, NodeStore, Placement, Publication, Relation,
    Result, TreeTransaction,
};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::schema::ensure_schema;

/// How long opening a write transaction waits for another connection's
/// write lock before reporting `ConcurrencyTimeout`.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const NODE_COLUMNS: &str = "n.id, n.parent_id, n.owner_id, n.is_draft, n.left_bound, n.right_bound, \
     n.group_key, n.is_online, n.publication_start, n.publication_end";

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn lock_err(e: rusqlite::Error, timeout: Duration) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            Error::ConcurrencyTimeout(timeout)
        }
        _ => storage_err(e),
    }
}

/// SQLite-backed `NodeStore`. One connection per store; open one store per
/// thread to share a database file.
///
/// Every transaction begins `IMMEDIATE`: the database write lock is taken
/// before the first read, and waiting for it is bounded by the store's busy
/// timeout.
pub struct SqliteStore {
    conn: Connection,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    /// Opens (or creates) a database file and switches it to WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(storage_err)?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(storage_err)?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened sqlite page tree");
        Self::from_connection(conn)
    }

    /// Wraps an existing connection, creating the schema if needed.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT).map_err(storage_err)?;
        Ok(Self {
            conn,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Bounds how long a transaction waits for the write lock.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.conn.busy_timeout(timeout).map_err(storage_err)?;
        self.busy_timeout = timeout;
        Ok(self)
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl NodeStore for SqliteStore {
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TreeTransaction) -> Result<T>,
    {
        let busy_timeout = self.busy_timeout;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| lock_err(e, busy_timeout))?;
        let mut handle = SqliteTransaction { tx };
        // dropping the handle on error rolls back
        let out = f(&mut handle)?;
        handle.tx.commit().map_err(storage_err)?;
        Ok(out)
    }

    fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        select_nodes(&self.conn, filter)
    }
}

struct SqliteTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl SqliteTransaction<'_> {
    /// Error for an update that matched no canonical row.
    fn missing_or_draft(&self, id: NodeId) -> Result<Error> {
        let is_draft: Option<bool> = self
            .tx
            .query_row(
                "SELECT is_draft FROM pagetree_nodes WHERE id = ?1",
                [to_sql_id(id)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(match is_draft {
            Some(true) => Error::InvalidOperation(format!("draft {id} has no structural parent")),
            _ => Error::NotFound(id),
        })
    }

    fn execute_on(&self, sql: &str, id: NodeId, value: impl rusqlite::ToSql) -> Result<usize> {
        self.tx
            .execute(sql, params![value, to_sql_id(id)?])
            .map_err(storage_err)
    }
}

impl TreeTransaction for SqliteTransaction<'_> {
    // BEGIN IMMEDIATE already holds the database write lock.
    fn lock_tree(&mut self, timeout: Duration) -> Result<()> {
        self.tx
            .execute("UPDATE pagetree_lock SET token = token + 1 WHERE id = 1", [])
            .map(|_| ())
            .map_err(|e| lock_err(e, timeout))
    }

    fn query(&mut self, filter: &NodeFilter) -> Result<Vec<Node>> {
        select_nodes(&self.tx, filter)
    }

    fn create(&mut self, node: NewNode) -> Result<NodeId> {
        let (parent, owner, is_draft, bounds) = match node.placement {
            Placement::Canonical { parent, bounds } => (parent, None, false, bounds),
            Placement::Draft { owner, snapshot } => (None, Some(owner), true, snapshot),
        };
        let publication = &node.attrs.publication;
        self.tx
            .execute(
                "INSERT INTO pagetree_nodes (parent_id, owner_id, is_draft, left_bound, right_bound,
                    group_key, is_online, publication_start, publication_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    parent.map(to_sql_id).transpose()?,
                    owner.map(to_sql_id).transpose()?,
                    is_draft,
                    bounds.left,
                    bounds.right,
                    node.attrs.group_key,
                    publication.is_online,
                    publication.publication_start.map(|t| t.timestamp_millis()),
                    publication.publication_end.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(storage_err)?;
        from_sql_id(self.tx.last_insert_rowid())
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> Result<()> {
        let changed = self.execute_on(
            "UPDATE pagetree_nodes SET parent_id = ?1 WHERE id = ?2 AND is_draft = 0",
            id,
            parent.map(to_sql_id).transpose()?,
        )?;
        if changed == 0 {
            return Err(self.missing_or_draft(id)?);
        }
        Ok(())
    }

    fn set_bounds(&mut self, id: NodeId, bounds: Bounds) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE pagetree_nodes SET left_bound = ?1, right_bound = ?2 WHERE id = ?3",
                params![bounds.left, bounds.right, to_sql_id(id)?],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    fn set_publication(&mut self, id: NodeId, publication: &Publication) -> Result<()> {
        let changed = self
            .tx
            .execute(
                "UPDATE pagetree_nodes
                 SET is_online = ?1, publication_start = ?2, publication_end = ?3
                 WHERE id = ?4",
                params![
                    publication.is_online,
                    publication.publication_start.map(|t| t.timestamp_millis()),
                    publication.publication_end.map(|t| t.timestamp_millis()),
                    to_sql_id(id)?,
                ],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    fn set_group_key(&mut self, id: NodeId, group_key: Option<&str>) -> Result<()> {
        let changed = self.execute_on(
            "UPDATE pagetree_nodes SET group_key = ?1 WHERE id = ?2",
            id,
            group_key,
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    fn shift_from(&mut self, threshold: i64, delta: i64) -> Result<()> {
        self.tx
            .execute(
                "UPDATE pagetree_nodes SET left_bound = left_bound + ?2
                 WHERE is_draft = 0 AND left_bound >= ?1",
                params![threshold, delta],
            )
            .map_err(storage_err)?;
        self.tx
            .execute(
                "UPDATE pagetree_nodes SET right_bound = right_bound + ?2
                 WHERE is_draft = 0 AND right_bound >= ?1",
                params![threshold, delta],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn negate_branch(&mut self, branch: Bounds) -> Result<()> {
        self.tx
            .execute(
                "UPDATE pagetree_nodes SET left_bound = -left_bound, right_bound = -right_bound
                 WHERE is_draft = 0 AND left_bound >= ?1 AND right_bound <= ?2",
                params![branch.left, branch.right],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn restore_negated(&mut self, offset: i64) -> Result<()> {
        self.tx
            .execute(
                "UPDATE pagetree_nodes
                 SET left_bound = -left_bound + ?1, right_bound = -right_bound + ?1
                 WHERE is_draft = 0 AND left_bound < 0",
                [offset],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn remove(&mut self, id: NodeId) -> Result<()> {
        let changed = self
            .tx
            .execute("DELETE FROM pagetree_nodes WHERE id = ?1", [to_sql_id(id)?])
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }
}

/// Accumulates numbered parameters while a query is assembled.
#[derive(Default)]
struct Params(Vec<i64>);

impl Params {
    fn bind(&mut self, value: i64) -> String {
        self.0.push(value);
        format!("?{}", self.0.len())
    }
}

/// Publication predicate on the row aliased `alias`.
fn publishable_sql(alias: &str, at: &str) -> String {
    format!(
        "({alias}.is_online = 1 \
         AND ({alias}.publication_start IS NULL OR {alias}.publication_start <= {at}) \
         AND ({alias}.publication_end IS NULL OR {alias}.publication_end > {at}))"
    )
}

fn filter_sql(filter: &NodeFilter) -> Result<(String, Params)> {
    let mut params = Params::default();
    let relation = match filter.relation {
        Relation::Everything => "1 = 1".to_string(),
        Relation::Canonical => "n.is_draft = 0".to_string(),
        Relation::Id(id) => format!("n.id = {}", params.bind(to_sql_id(id)?)),
        Relation::Root => "n.is_draft = 0 AND n.parent_id IS NULL".to_string(),
        Relation::ChildrenOf(parent) => {
            format!("n.is_draft = 0 AND n.parent_id = {}", params.bind(to_sql_id(parent)?))
        }
        Relation::DescendantsOf(outer) => format!(
            "n.is_draft = 0 AND n.left_bound > {} AND n.right_bound < {}",
            params.bind(outer.left),
            params.bind(outer.right)
        ),
        Relation::AncestorsOf(inner) => format!(
            "n.is_draft = 0 AND n.left_bound < {} AND n.right_bound > {}",
            params.bind(inner.left),
            params.bind(inner.right)
        ),
        Relation::DraftsOf(owner) => {
            format!("n.is_draft = 1 AND n.owner_id = {}", params.bind(to_sql_id(owner)?))
        }
    };

    let mut sql = format!(
        "SELECT {NODE_COLUMNS} FROM pagetree_nodes n
         LEFT JOIN pagetree_nodes o ON n.is_draft = 1 AND o.id = n.owner_id AND o.is_draft = 0
         WHERE {relation}"
    );
    if let Some(at) = filter.live_at {
        let at = params.bind(at.timestamp_millis());
        // a draft is judged at its owner's position
        sql.push_str(&format!(
            " AND {node_ok}
              AND NOT EXISTS (
                SELECT 1 FROM pagetree_nodes a
                WHERE a.is_draft = 0
                  AND a.left_bound < COALESCE(o.left_bound, n.left_bound)
                  AND a.right_bound > COALESCE(o.right_bound, n.right_bound)
                  AND (a.group_key IS NULL OR a.group_key = n.group_key)
                  AND NOT {ancestor_ok}
              )",
            node_ok = publishable_sql("n", &at),
            ancestor_ok = publishable_sql("a", &at),
        ));
    }
    sql.push_str(" ORDER BY n.left_bound ASC, n.id ASC");
    Ok((sql, params))
}

fn select_nodes(conn: &Connection, filter: &NodeFilter) -> Result<Vec<Node>> {
    let (sql, params) = filter_sql(filter)?;
    let mut stmt = conn.prepare_cached(&sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params_from_iter(params.0), NodeRow::from_row)
        .map_err(storage_err)?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row.map_err(storage_err)?.into_node()?);
    }
    Ok(nodes)
}

struct NodeRow {
    id: i64,
    parent_id: Option<i64>,
    owner_id: Option<i64>,
    is_draft: bool,
    left: i64,
    right: i64,
    group_key: Option<String>,
    is_online: bool,
    publication_start: Option<i64>,
    publication_end: Option<i64>,
}

impl NodeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            owner_id: row.get(2)?,
            is_draft: row.get(3)?,
            left: row.get(4)?,
            right: row.get(5)?,
            group_key: row.get(6)?,
            is_online: row.get(7)?,
            publication_start: row.get(8)?,
            publication_end: row.get(9)?,
        })
    }

    fn into_node(self) -> Result<Node> {
        let id = from_sql_id(self.id)?;
        let bounds = Bounds::new(self.left, self.right);
        let placement = if self.is_draft {
            let owner = self.owner_id.ok_or_else(|| {
                Error::Storage(format!("draft {id} has no owner_id"))
            })?;
            Placement::Draft {
                owner: from_sql_id(owner)?,
                snapshot: bounds,
            }
        } else {
            Placement::Canonical {
                parent: self.parent_id.map(from_sql_id).transpose()?,
                bounds,
            }
        };
        Ok(Node {
            id,
            placement,
            group_key: self.group_key,
            publication: Publication {
                is_online: self.is_online,
                publication_start: self.publication_start.map(from_epoch_millis).transpose()?,
                publication_end: self.publication_end.map(from_epoch_millis).transpose()?,
            },
        })
    }
}

fn to_sql_id(id: NodeId) -> Result<i64> {
    i64::try_from(id.0).map_err(|_| Error::Storage(format!("node id {id} out of range")))
}

fn from_sql_id(raw: i64) -> Result<NodeId> {
    u64::try_from(raw)
        .map(NodeId)
        .map_err(|_| Error::Storage(format!("negative node id {raw}")))
}

fn from_epoch_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Storage(format!("timestamp {millis}ms out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    #[test]
    fn publication_roundtrips_at_millisecond_precision() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap() + TimeDelta::milliseconds(250);
        let id = store
            .transaction(|tx| {
                tx.create(NewNode {
                    placement: Placement::Canonical {
                        parent: None,
                        bounds: Bounds::leaf(1),
                    },
                    attrs: pagetree_core::NodeAttrs::default()
                        .with_group("fr")
                        .with_publication(Publication::window(Some(start), None)),
                })
            })
            .unwrap();

        let node = store.get(id).unwrap().unwrap();
        assert_eq!(node.publication.publication_start, Some(start));
        assert_eq!(node.group_key.as_deref(), Some("fr"));
        assert!(node.is_root());
    }

    #[test]
    fn live_filter_sql_binds_time_once() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let filter = NodeFilter::new(Relation::DescendantsOf(Bounds::new(1, 10))).live_at(Some(at));
        let (sql, params) = filter_sql(&filter).unwrap();
        assert_eq!(params.0, vec![1, 10, at.timestamp_millis()]);
        assert!(sql.contains("NOT EXISTS"));
        assert!(sql.contains("?3"));
        assert!(!sql.contains("?4"));
    }

    #[test]
    fn set_parent_on_a_draft_is_rejected() {
        let mut store = SqliteStore::new_in_memory().unwrap();
        let err = store
            .transaction(|tx| {
                let root = tx.create(NewNode {
                    placement: Placement::Canonical {
                        parent: None,
                        bounds: Bounds::leaf(1),
                    },
                    attrs: Default::default(),
                })?;
                let draft = tx.create(NewNode {
                    placement: Placement::Draft {
                        owner: root,
                        snapshot: Bounds::leaf(1),
                    },
                    attrs: Default::default(),
                })?;
                tx.set_parent(draft, Some(root))
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(store.query(&NodeFilter::new(Relation::Everything)).unwrap().is_empty());
    }
}
