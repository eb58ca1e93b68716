use chrono::{DateTime, Utc};

use crate::ids::NodeId;
use crate::node::{Bounds, Node};
use crate::publication::LiveFilter;

/// Which rows a read selects, before publication filtering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Relation {
    /// Every row, drafts included.
    Everything,
    /// Every canonical row.
    Canonical,
    /// A single row by id, draft or canonical.
    Id(NodeId),
    /// The canonical node without a parent.
    Root,
    /// Canonical nodes whose parent is the given node.
    ChildrenOf(NodeId),
    /// Canonical nodes strictly inside the interval.
    DescendantsOf(Bounds),
    /// Canonical nodes strictly containing the interval.
    AncestorsOf(Bounds),
    /// Drafts shadowing the given canonical node.
    DraftsOf(NodeId),
}

/// A read request as seen by a store: the relation plus the instant used by
/// the publication predicates (`None` selects regardless of publication).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeFilter {
    pub relation: Relation,
    pub live_at: Option<DateTime<Utc>>,
}

impl NodeFilter {
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            live_at: None,
        }
    }

    pub fn live_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.live_at = at;
        self
    }

    /// Whether a row belongs to the relation, ignoring publication.
    pub fn selects(&self, node: &Node) -> bool {
        match self.relation {
            Relation::Everything => true,
            Relation::Canonical => !node.is_draft(),
            Relation::Id(id) => node.id == id,
            Relation::Root => node.is_root(),
            Relation::ChildrenOf(parent) => node.parent() == Some(parent),
            Relation::DescendantsOf(outer) => node
                .bounds()
                .is_some_and(|bounds| outer.strictly_contains(&bounds)),
            Relation::AncestorsOf(inner) => node
                .bounds()
                .is_some_and(|bounds| bounds.strictly_contains(&inner)),
            Relation::DraftsOf(owner) => node.owner() == Some(owner),
        }
    }

    /// Evaluates the filter over a full in-memory table. Results are ordered
    /// by stored left bound, then id, matching the SQL backends.
    pub fn apply<'a, I>(&self, table: I) -> Vec<Node>
    where
        I: IntoIterator<Item = &'a Node>,
        I::IntoIter: Clone,
    {
        let rows = table.into_iter();
        let mut selected: Vec<Node> = rows.clone().filter(|n| self.selects(n)).cloned().collect();
        if let Some(at) = self.live_at {
            let live = LiveFilter::new(rows, at);
            selected.retain(|n| live.is_live(n));
        }
        selected.sort_by_key(|n| (n.stored_bounds().left, n.id));
        selected
    }
}
