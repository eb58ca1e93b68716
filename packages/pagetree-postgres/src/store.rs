use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::types::ToSql;
use postgres::{Client, Row};

use pagetree_core::{
    Bounds, Error, NewNode, Node, NodeFilter, NodeId, NodeStore, Placement, Publication, Relation,
    Result, TreeTransaction,
};

pub(crate) fn storage_debug<E: std::fmt::Debug>(e: E) -> Error {
    Error::Storage(format!("{e:?}"))
}

fn to_sql_id(id: NodeId) -> Result<i64> {
    i64::try_from(id.0).map_err(|_| Error::Storage(format!("node id {id} out of range")))
}

fn from_sql_id(raw: i64) -> Result<NodeId> {
    u64::try_from(raw)
        .map(NodeId)
        .map_err(|_| Error::Storage(format!("negative node id {raw}")))
}

const NODE_COLUMNS: &str = "n.id, n.parent_id, n.owner_id, n.is_draft, n.left_bound, n.right_bound, \
     n.group_key, n.is_online, n.publication_start, n.publication_end";

/// `NodeStore` over one tree (`tree_id`) of the shared `pagetree_nodes` table.
pub struct PostgresStore {
    client: Rc<RefCell<Client>>,
    tree_id: String,
}

impl PostgresStore {
    /// Expects the schema to exist; see [`crate::ensure_schema`].
    pub fn new(client: Rc<RefCell<Client>>, tree_id: impl Into<String>) -> Self {
        Self {
            client,
            tree_id: tree_id.into(),
        }
    }

    pub fn tree_id(&self) -> &str {
        &self.tree_id
    }
}

impl NodeStore for PostgresStore {
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TreeTransaction) -> Result<T>,
    {
        {
            let mut c = self.client.borrow_mut();
            c.batch_execute("BEGIN").map_err(|e| Error::Storage(e.to_string()))?;
        }

        let mut tx = PgTransaction {
            client: &self.client,
            tree_id: &self.tree_id,
        };
        let res = f(&mut tx);

        match res {
            Ok(v) => {
                let mut c = self.client.borrow_mut();
                c.batch_execute("COMMIT").map_err(|e| Error::Storage(e.to_string()))?;
                Ok(v)
            }
            Err(e) => {
                let mut c = self.client.borrow_mut();
                let _ = c.batch_execute("ROLLBACK");
                tracing::debug!(tree_id = %self.tree_id, error = %e, "rolled back page tree transaction");
                Err(e)
            }
        }
    }

    fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        select_nodes(&self.client, &self.tree_id, filter)
    }
}

struct PgTransaction<'a> {
    client: &'a Rc<RefCell<Client>>,
    tree_id: &'a str,
}

impl PgTransaction<'_> {
    fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.client
            .borrow_mut()
            .execute(sql, params)
            .map_err(storage_debug)
    }

    fn expect_row(&self, changed: u64, id: NodeId) -> Result<()> {
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }
}

impl TreeTransaction for PgTransaction<'_> {
    fn lock_tree(&mut self, timeout: Duration) -> Result<()> {
        let mut c = self.client.borrow_mut();
        c.batch_execute(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            timeout.as_millis().max(1)
        ))
        .map_err(storage_debug)?;
        match c.batch_execute("LOCK TABLE pagetree_nodes IN SHARE ROW EXCLUSIVE MODE") {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                Err(Error::ConcurrencyTimeout(timeout))
            }
            Err(e) => Err(storage_debug(e)),
        }
    }

    fn query(&mut self, filter: &NodeFilter) -> Result<Vec<Node>> {
        select_nodes(self.client, self.tree_id, filter)
    }

    fn create(&mut self, node: NewNode) -> Result<NodeId> {
        let (parent, owner, is_draft, bounds) = match node.placement {
            Placement::Canonical { parent, bounds } => (parent, None, false, bounds),
            Placement::Draft { owner, snapshot } => (None, Some(owner), true, snapshot),
        };
        let parent = parent.map(to_sql_id).transpose()?;
        let owner = owner.map(to_sql_id).transpose()?;
        let publication = &node.attrs.publication;
        let row = self
            .client
            .borrow_mut()
            .query_one(
                "INSERT INTO pagetree_nodes (tree_id, parent_id, owner_id, is_draft, left_bound,
                    right_bound, group_key, is_online, publication_start, publication_end)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 RETURNING id",
                &[
                    &self.tree_id,
                    &parent,
                    &owner,
                    &is_draft,
                    &bounds.left,
                    &bounds.right,
                    &node.attrs.group_key,
                    &publication.is_online,
                    &publication.publication_start,
                    &publication.publication_end,
                ],
            )
            .map_err(storage_debug)?;
        let id: i64 = row.try_get(0).map_err(storage_debug)?;
        from_sql_id(id)
    }

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> Result<()> {
        let parent = parent.map(to_sql_id).transpose()?;
        let sql_id = to_sql_id(id)?;
        let changed = self.execute(
            "UPDATE pagetree_nodes SET parent_id = $3
             WHERE tree_id = $1 AND id = $2 AND NOT is_draft",
            &[&self.tree_id, &sql_id, &parent],
        )?;
        if changed == 0 {
            let draft = self
                .client
                .borrow_mut()
                .query_opt(
                    "SELECT is_draft FROM pagetree_nodes WHERE tree_id = $1 AND id = $2",
                    &[&self.tree_id, &sql_id],
                )
                .map_err(storage_debug)?;
            return match draft.map(|row| row.try_get::<_, bool>(0)).transpose() {
                Ok(Some(true)) => Err(Error::InvalidOperation(format!(
                    "draft {id} has no structural parent"
                ))),
                Ok(_) => Err(Error::NotFound(id)),
                Err(e) => Err(storage_debug(e)),
            };
        }
        Ok(())
    }

    fn set_bounds(&mut self, id: NodeId, bounds: Bounds) -> Result<()> {
        let changed = self.execute(
            "UPDATE pagetree_nodes SET left_bound = $3, right_bound = $4
             WHERE tree_id = $1 AND id = $2",
            &[&self.tree_id, &to_sql_id(id)?, &bounds.left, &bounds.right],
        )?;
        self.expect_row(changed, id)
    }

    fn set_publication(&mut self, id: NodeId, publication: &Publication) -> Result<()> {
        let changed = self.execute(
            "UPDATE pagetree_nodes
             SET is_online = $3, publication_start = $4, publication_end = $5
             WHERE tree_id = $1 AND id = $2",
            &[
                &self.tree_id,
                &to_sql_id(id)?,
                &publication.is_online,
                &publication.publication_start,
                &publication.publication_end,
            ],
        )?;
        self.expect_row(changed, id)
    }

    fn set_group_key(&mut self, id: NodeId, group_key: Option<&str>) -> Result<()> {
        let changed = self.execute(
            "UPDATE pagetree_nodes SET group_key = $3 WHERE tree_id = $1 AND id = $2",
            &[&self.tree_id, &to_sql_id(id)?, &group_key],
        )?;
        self.expect_row(changed, id)
    }

    fn shift_from(&mut self, threshold: i64, delta: i64) -> Result<()> {
        self.execute(
            "UPDATE pagetree_nodes SET left_bound = left_bound + $3
             WHERE tree_id = $1 AND NOT is_draft AND left_bound >= $2",
            &[&self.tree_id, &threshold, &delta],
        )?;
        self.execute(
            "UPDATE pagetree_nodes SET right_bound = right_bound + $3
             WHERE tree_id = $1 AND NOT is_draft AND right_bound >= $2",
            &[&self.tree_id, &threshold, &delta],
        )?;
        Ok(())
    }

    fn negate_branch(&mut self, branch: Bounds) -> Result<()> {
        self.execute(
            "UPDATE pagetree_nodes SET left_bound = -left_bound, right_bound = -right_bound
             WHERE tree_id = $1 AND NOT is_draft AND left_bound >= $2 AND right_bound <= $3",
            &[&self.tree_id, &branch.left, &branch.right],
        )?;
        Ok(())
    }

    fn restore_negated(&mut self, offset: i64) -> Result<()> {
        self.execute(
            "UPDATE pagetree_nodes
             SET left_bound = -left_bound + $2, right_bound = -right_bound + $2
             WHERE tree_id = $1 AND NOT is_draft AND left_bound < 0",
            &[&self.tree_id, &offset],
        )?;
        Ok(())
    }

    fn remove(&mut self, id: NodeId) -> Result<()> {
        let changed = self.execute(
            "DELETE FROM pagetree_nodes WHERE tree_id = $1 AND id = $2",
            &[&self.tree_id, &to_sql_id(id)?],
        )?;
        self.expect_row(changed, id)
    }
}

/// Owned query parameters, numbered in push order.
#[derive(Default)]
struct Params(Vec<Box<dyn ToSql + Sync>>);

impl Params {
    fn bind<T: ToSql + Sync + 'static>(&mut self, value: T) -> String {
        self.0.push(Box::new(value));
        format!("${}", self.0.len())
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.0.iter().map(|p| p.as_ref()).collect()
    }
}

fn publishable_sql(alias: &str, at: &str) -> String {
    format!(
        "({alias}.is_online \
         AND ({alias}.publication_start IS NULL OR {alias}.publication_start <= {at}) \
         AND ({alias}.publication_end IS NULL OR {alias}.publication_end > {at}))"
    )
}

fn filter_sql(tree_id: &str, filter: &NodeFilter) -> Result<(String, Params)> {
    let mut params = Params::default();
    let tree = params.bind(tree_id.to_owned());
    let relation = match filter.relation {
        Relation::Everything => "TRUE".to_string(),
        Relation::Canonical => "NOT n.is_draft".to_string(),
        Relation::Id(id) => format!("n.id = {}", params.bind(to_sql_id(id)?)),
        Relation::Root => "NOT n.is_draft AND n.parent_id IS NULL".to_string(),
        Relation::ChildrenOf(parent) => format!(
            "NOT n.is_draft AND n.parent_id = {}",
            params.bind(to_sql_id(parent)?)
        ),
        Relation::DescendantsOf(outer) => format!(
            "NOT n.is_draft AND n.left_bound > {} AND n.right_bound < {}",
            params.bind(outer.left),
            params.bind(outer.right)
        ),
        Relation::AncestorsOf(inner) => format!(
            "NOT n.is_draft AND n.left_bound < {} AND n.right_bound > {}",
            params.bind(inner.left),
            params.bind(inner.right)
        ),
        Relation::DraftsOf(owner) => format!(
            "n.is_draft AND n.owner_id = {}",
            params.bind(to_sql_id(owner)?)
        ),
    };

    let mut sql = format!(
        "SELECT {NODE_COLUMNS} FROM pagetree_nodes n
         LEFT JOIN pagetree_nodes o
           ON n.is_draft AND o.tree_id = n.tree_id AND o.id = n.owner_id AND NOT o.is_draft
         WHERE n.tree_id = {tree} AND {relation}"
    );
    if let Some(at) = filter.live_at {
        let at = params.bind(at);
        // a draft is judged at its owner's position
        sql.push_str(&format!(
            " AND {node_ok}
              AND NOT EXISTS (
                SELECT 1 FROM pagetree_nodes a
                WHERE a.tree_id = n.tree_id
                  AND NOT a.is_draft
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

fn select_nodes(
    client: &Rc<RefCell<Client>>,
    tree_id: &str,
    filter: &NodeFilter,
) -> Result<Vec<Node>> {
    let (sql, params) = filter_sql(tree_id, filter)?;
    let rows = client
        .borrow_mut()
        .query(sql.as_str(), &params.refs())
        .map_err(storage_debug)?;
    rows.iter().map(row_to_node).collect()
}

fn row_to_node(row: &Row) -> Result<Node> {
    let id = from_sql_id(row.try_get("id").map_err(storage_debug)?)?;
    let is_draft: bool = row.try_get("is_draft").map_err(storage_debug)?;
    let bounds = Bounds::new(
        row.try_get("left_bound").map_err(storage_debug)?,
        row.try_get("right_bound").map_err(storage_debug)?,
    );
    let placement = if is_draft {
        let owner: Option<i64> = row.try_get("owner_id").map_err(storage_debug)?;
        let owner = owner.ok_or_else(|| Error::Storage(format!("draft {id} has no owner_id")))?;
        Placement::Draft {
            owner: from_sql_id(owner)?,
            snapshot: bounds,
        }
    } else {
        let parent: Option<i64> = row.try_get("parent_id").map_err(storage_debug)?;
        Placement::Canonical {
            parent: parent.map(from_sql_id).transpose()?,
            bounds,
        }
    };
    let publication_start: Option<DateTime<Utc>> =
        row.try_get("publication_start").map_err(storage_debug)?;
    let publication_end: Option<DateTime<Utc>> =
        row.try_get("publication_end").map_err(storage_debug)?;
    Ok(Node {
        id,
        placement,
        group_key: row.try_get("group_key").map_err(storage_debug)?,
        publication: Publication {
            is_online: row.try_get("is_online").map_err(storage_debug)?,
            publication_start,
            publication_end,
        },
    })
}
