use std::cell::Cell;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::node::{Bounds, NewNode, Node, Placement, Publication};
use crate::query::{NodeFilter, Relation};

/// Source of "now" for publication checks; injectable for tests.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Clone, Debug)]
pub struct FixedClock {
    now: Cell<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn advance(&self, by: chrono::TimeDelta) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Ordered record store holding page nodes.
pub trait NodeStore {
    /// Runs `f` in a transaction. The store commits when `f` returns `Ok` and
    /// rolls every write back when it returns `Err`.
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TreeTransaction) -> Result<T>;

    /// Lock-free read against the last committed state.
    fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    fn get(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self
            .query(&NodeFilter::new(Relation::Id(id)))?
            .into_iter()
            .next())
    }
}

/// Operations available inside a store transaction.
///
/// Every range update (`shift_from`, `negate_branch`, `restore_negated`)
/// touches canonical rows only; draft rows keep their snapshot bounds.
pub trait TreeTransaction {
    /// Takes the exclusive whole-tree lock, held until the transaction ends.
    /// Fails with [`Error::ConcurrencyTimeout`] if it cannot be acquired in
    /// `timeout`.
    fn lock_tree(&mut self, timeout: Duration) -> Result<()>;

    fn query(&mut self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Inserts a row and returns the id the store assigned.
    fn create(&mut self, node: NewNode) -> Result<NodeId>;

    fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) -> Result<()>;

    /// Overwrites stored bounds: the live interval of a canonical row or the
    /// snapshot of a draft.
    fn set_bounds(&mut self, id: NodeId, bounds: Bounds) -> Result<()>;

    fn set_publication(&mut self, id: NodeId, publication: &Publication) -> Result<()>;

    fn set_group_key(&mut self, id: NodeId, group_key: Option<&str>) -> Result<()>;

    /// `left += delta` where `left >= threshold`, and independently
    /// `right += delta` where `right >= threshold`.
    fn shift_from(&mut self, threshold: i64, delta: i64) -> Result<()>;

    /// Negates both bounds of every canonical row inside `branch` (inclusive)
    /// so range shifts skip them.
    fn negate_branch(&mut self, branch: Bounds) -> Result<()>;

    /// Flips negated rows back and adds `offset` to both bounds.
    fn restore_negated(&mut self, offset: i64) -> Result<()>;

    fn remove(&mut self, id: NodeId) -> Result<()>;

    fn get(&mut self, id: NodeId) -> Result<Option<Node>> {
        Ok(self
            .query(&NodeFilter::new(Relation::Id(id)))?
            .into_iter()
            .next())
    }

    fn require(&mut self, id: NodeId) -> Result<Node> {
        self.get(id)?.ok_or(Error::NotFound(id))
    }

    /// Every row, canonical and draft, ordered by stored left bound.
    fn nodes(&mut self) -> Result<Vec<Node>> {
        self.query(&NodeFilter::new(Relation::Everything))
    }

    fn root(&mut self) -> Result<Option<Node>> {
        Ok(self.query(&NodeFilter::new(Relation::Root))?.into_iter().next())
    }

    /// Canonical children ordered by left bound.
    fn children(&mut self, parent: NodeId) -> Result<Vec<Node>> {
        self.query(&NodeFilter::new(Relation::ChildrenOf(parent)))
    }
}

/// In-memory store for tests and embedding. Exclusive `&mut` access is the
/// tree lock; a transaction works on a copy of the table that replaces the
/// committed table only on success.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    table: BTreeMap<NodeId, Node>,
    last_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl NodeStore for MemoryStore {
    fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TreeTransaction) -> Result<T>,
    {
        let mut tx = MemoryTransaction {
            table: self.table.clone(),
            last_id: self.last_id,
        };
        let out = f(&mut tx)?;
        self.table = tx.table;
        self.last_id = tx.last_id;
        Ok(out)
    }

    fn query(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(filter.apply(self.table.values()))
    }
}

struct MemoryTransaction {
    table: BTreeMap<NodeId, Node>,
    last_id: u64,
}

impl MemoryTransaction {
    fn row(&mut self, id: NodeId) -> Result<&mut Node> {
        self.table.get_mut(&id).ok_or(Error::NotFound(id))
    }

    fn canonical_bounds_mut(&mut self) -> impl Iterator<Item = &mut Bounds> {
        self.table
            .values_mut()
            .filter_map(|node| match &mut node.placement {
                Placement::Canonical { bounds, .. } => Some(bounds),
                Placement::Draft { .. } => None,
            })
    }
}

impl TreeTransaction for MemoryTransaction {
    fn lock_tree(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn query(&mut self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(filter.apply(self.table.values()))
    }

    fn create(&mut self, node: NewNode) -> Result<NodeId> {
        self.last_id += 1;
        let id = NodeId(self.last_id);
        self.table.insert(id, node.into_node(id));
        Ok(id)
    }

    fn set_parent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<()> {
        match &mut self.row(id)?.placement {
            Placement::Canonical { parent, .. } => {
                *parent = new_parent;
                Ok(())
            }
            Placement::Draft { .. } => Err(Error::InvalidOperation(format!(
                "draft {id} has no structural parent"
            ))),
        }
    }

    fn set_bounds(&mut self, id: NodeId, new_bounds: Bounds) -> Result<()> {
        match &mut self.row(id)?.placement {
            Placement::Canonical { bounds, .. } => *bounds = new_bounds,
            Placement::Draft { snapshot, .. } => *snapshot = new_bounds,
        }
        Ok(())
    }

    fn set_publication(&mut self, id: NodeId, publication: &Publication) -> Result<()> {
        self.row(id)?.publication = publication.clone();
        Ok(())
    }

    fn set_group_key(&mut self, id: NodeId, group_key: Option<&str>) -> Result<()> {
        self.row(id)?.group_key = group_key.map(str::to_owned);
        Ok(())
    }

    fn shift_from(&mut self, threshold: i64, delta: i64) -> Result<()> {
        for bounds in self.canonical_bounds_mut() {
            if bounds.left >= threshold {
                bounds.left += delta;
            }
            if bounds.right >= threshold {
                bounds.right += delta;
            }
        }
        Ok(())
    }

    fn negate_branch(&mut self, branch: Bounds) -> Result<()> {
        for bounds in self.canonical_bounds_mut() {
            if branch.contains(bounds) {
                *bounds = Bounds::new(-bounds.left, -bounds.right);
            }
        }
        Ok(())
    }

    fn restore_negated(&mut self, offset: i64) -> Result<()> {
        for bounds in self.canonical_bounds_mut() {
            if bounds.left < 0 {
                *bounds = Bounds::new(-bounds.left + offset, -bounds.right + offset);
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: NodeId) -> Result<()> {
        self.table.remove(&id).map(|_| ()).ok_or(Error::NotFound(id))
    }
}
