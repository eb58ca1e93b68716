use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Nested-set interval of a node. `left < right`, and a branch occupies
/// every integer in `left..=right`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bounds {
    pub left: i64,
    pub right: i64,
}

impl Bounds {
    pub const fn new(left: i64, right: i64) -> Self {
        Self { left, right }
    }

    /// Bounds of a freshly inserted leaf whose left edge is `left`.
    pub const fn leaf(left: i64) -> Self {
        Self {
            left,
            right: left + 1,
        }
    }

    /// Number of bound values the branch occupies (`2 * node_count`).
    pub const fn width(&self) -> i64 {
        self.right - self.left + 1
    }

    pub const fn is_leaf(&self) -> bool {
        self.right - self.left == 1
    }

    /// Strict containment: `other` is a descendant of the node owning `self`.
    pub const fn strictly_contains(&self, other: &Bounds) -> bool {
        self.left < other.left && self.right > other.right
    }

    /// Containment including the node itself.
    pub const fn contains(&self, other: &Bounds) -> bool {
        self.left <= other.left && self.right >= other.right
    }
}

/// Visibility fields shared by canonical and draft nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Publication {
    pub is_online: bool,
    pub publication_start: Option<DateTime<Utc>>,
    pub publication_end: Option<DateTime<Utc>>,
}

impl Default for Publication {
    fn default() -> Self {
        Self::online()
    }
}

impl Publication {
    /// Online with an open publication window.
    pub fn online() -> Self {
        Self {
            is_online: true,
            publication_start: None,
            publication_end: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            ..Self::online()
        }
    }

    pub fn window(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            is_online: true,
            publication_start: start,
            publication_end: end,
        }
    }

    /// Base visibility predicate: online, started (or no start) and not yet
    /// expired (or no end).
    pub fn is_publishable(&self, now: DateTime<Utc>) -> bool {
        self.is_online
            && self.publication_start.map_or(true, |start| start <= now)
            && self.publication_end.map_or(true, |end| end > now)
    }
}

/// Where a node sits relative to the nested set.
///
/// Only `Canonical` nodes are numbered. A `Draft` shadows its owner (for
/// example a localized copy) and carries a snapshot of the owner's bounds
/// taken when it was stamped; the snapshot is display data only.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Placement {
    Canonical {
        parent: Option<NodeId>,
        bounds: Bounds,
    },
    Draft {
        owner: NodeId,
        snapshot: Bounds,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    pub id: NodeId,
    pub placement: Placement,
    pub group_key: Option<String>,
    pub publication: Publication,
}

impl Node {
    pub fn is_draft(&self) -> bool {
        matches!(self.placement, Placement::Draft { .. })
    }

    pub fn is_root(&self) -> bool {
        matches!(self.placement, Placement::Canonical { parent: None, .. })
    }

    /// Structural parent; `None` for the root and for drafts.
    pub fn parent(&self) -> Option<NodeId> {
        match self.placement {
            Placement::Canonical { parent, .. } => parent,
            Placement::Draft { .. } => None,
        }
    }

    /// Trusted tree bounds. Drafts have none.
    pub fn bounds(&self) -> Option<Bounds> {
        match self.placement {
            Placement::Canonical { bounds, .. } => Some(bounds),
            Placement::Draft { .. } => None,
        }
    }

    pub fn owner(&self) -> Option<NodeId> {
        match self.placement {
            Placement::Draft { owner, .. } => Some(owner),
            Placement::Canonical { .. } => None,
        }
    }

    /// Stored bounds regardless of variant: the live interval for canonical
    /// nodes, the snapshot for drafts.
    pub fn stored_bounds(&self) -> Bounds {
        match self.placement {
            Placement::Canonical { bounds, .. } => bounds,
            Placement::Draft { snapshot, .. } => snapshot,
        }
    }
}

/// Content fields supplied by callers when creating a node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeAttrs {
    pub group_key: Option<String>,
    pub publication: Publication,
}

impl NodeAttrs {
    pub fn with_group(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn with_publication(mut self, publication: Publication) -> Self {
        self.publication = publication;
        self
    }
}

/// A row about to be inserted; the store assigns the id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewNode {
    pub placement: Placement,
    pub attrs: NodeAttrs,
}

impl NewNode {
    pub fn into_node(self, id: NodeId) -> Node {
        Node {
            id,
            placement: self.placement,
            group_key: self.attrs.group_key,
            publication: self.attrs.publication,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn bounds_width_and_containment() {
        let root = Bounds::new(1, 6);
        let child = Bounds::new(2, 5);
        let leaf = Bounds::leaf(3);

        assert_eq!(root.width(), 6);
        assert!(leaf.is_leaf());
        assert!(root.strictly_contains(&child));
        assert!(child.strictly_contains(&leaf));
        assert!(!child.strictly_contains(&child));
        assert!(child.contains(&child));
    }

    #[test]
    fn publication_window_edges() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(Publication::online().is_publishable(now));
        assert!(!Publication::offline().is_publishable(now));

        // start is inclusive, end is exclusive
        assert!(Publication::window(Some(now), None).is_publishable(now));
        assert!(!Publication::window(None, Some(now)).is_publishable(now));
        assert!(!Publication::window(Some(now + Duration::minutes(1)), None).is_publishable(now));
        assert!(Publication::window(None, Some(now + Duration::seconds(1))).is_publishable(now));
    }
}
