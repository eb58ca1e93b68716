use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::TreeConfig;
use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::invariants::check_canonical;
use crate::node::{Bounds, NewNode, Node, NodeAttrs, Placement, Publication};
use crate::publication::{blocker_applies, truncate_to_minute, PublicationContext, ScopeMode};
use crate::query::{NodeFilter, Relation};
use crate::traits::{Clock, NodeStore, TreeTransaction};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MoveOutcome {
    Moved,
    /// The node already had the requested parent; nothing was written.
    Unchanged,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SiblingMove {
    Swapped { with: NodeId },
    NoAdjacentSibling,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RebuildReport {
    pub canonical: usize,
    pub renumbered: usize,
    pub drafts_refreshed: usize,
}

/// Where a relocated branch lands, resolved after the branch is excised.
#[derive(Clone, Copy, Debug)]
enum Target {
    LastChildOf(NodeId),
    Before(NodeId),
    After(NodeId),
}

/// Page hierarchy facade that wires a store, a clock and configuration
/// together. Owns the nested-set bounds of every canonical node.
pub struct PageTree<S, C>
where
    S: NodeStore,
    C: Clock,
{
    store: S,
    clock: C,
    config: TreeConfig,
}

impl<S, C> PageTree<S, C>
where
    S: NodeStore,
    C: Clock,
{
    pub fn new(store: S, clock: C, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    pub fn with_defaults(store: S, clock: C) -> Self {
        Self {
            store,
            clock,
            config: TreeConfig::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// A fresh publication context starting in the configured default mode.
    pub fn context(&self) -> PublicationContext {
        PublicationContext::new(self.config.default_scope)
    }

    /// Appends a node as the last child of `parent`. Without a parent the node
    /// becomes the root of an empty tree, or a child of the existing root.
    pub fn insert(&mut self, parent: Option<NodeId>, attrs: NodeAttrs) -> Result<NodeId> {
        let id = self.structural(|tx| {
            let Some(root) = tx.root()? else {
                if let Some(parent) = parent {
                    return Err(Error::NotFound(parent));
                }
                return tx.create(NewNode {
                    placement: Placement::Canonical {
                        parent: None,
                        bounds: Bounds::leaf(1),
                    },
                    attrs,
                });
            };
            let parent = match parent {
                Some(id) if id != root.id => tx.require(id)?,
                _ => root,
            };
            let parent_bounds = canonical_bounds(&parent)?;
            let left = parent_bounds.right;
            tx.shift_from(left, 2)?;
            tx.create(NewNode {
                placement: Placement::Canonical {
                    parent: Some(parent.id),
                    bounds: Bounds::leaf(left),
                },
                attrs,
            })
        })?;
        tracing::debug!(node = %id, parent = ?parent, "inserted page node");
        Ok(id)
    }

    /// Stamps a draft that shadows `owner` with the owner's current bounds.
    /// Takes no tree lock and renumbers nothing.
    pub fn insert_draft(&mut self, owner: NodeId, attrs: NodeAttrs) -> Result<NodeId> {
        let id = self.store.transaction(|tx| {
            let owner_node = tx.require(owner)?;
            let Some(snapshot) = owner_node.bounds() else {
                return Err(Error::InvalidOperation(format!(
                    "draft owner {owner} is itself a draft"
                )));
            };
            tx.create(NewNode {
                placement: Placement::Draft { owner, snapshot },
                attrs,
            })
        })?;
        tracing::debug!(node = %id, owner = %owner, "stamped draft node");
        Ok(id)
    }

    /// Re-parents `node` as the last child of `new_parent`, carrying its
    /// whole branch along.
    pub fn move_node(&mut self, node: NodeId, new_parent: NodeId) -> Result<MoveOutcome> {
        let outcome = self.structural(|tx| {
            let current = tx.require(node)?;
            let (parent, bounds) = canonical_placement(&current)?;
            if parent == Some(new_parent) {
                return Ok(MoveOutcome::Unchanged);
            }
            let target = tx.require(new_parent)?;
            if bounds.contains(&canonical_bounds(&target)?) {
                return Err(Error::CycleDetected {
                    node,
                    target: new_parent,
                });
            }
            relocate(tx, bounds, Target::LastChildOf(new_parent))?;
            tx.set_parent(node, Some(new_parent))?;
            Ok(MoveOutcome::Moved)
        })?;
        tracing::debug!(node = %node, new_parent = %new_parent, ?outcome, "moved page node");
        Ok(outcome)
    }

    /// Swaps `node` with its adjacent sibling in `direction`.
    pub fn move_sibling(&mut self, node: NodeId, direction: Direction) -> Result<SiblingMove> {
        let outcome = self.structural(|tx| {
            let current = tx.require(node)?;
            let (parent, bounds) = canonical_placement(&current)?;
            let Some(parent) = parent else {
                return Ok(SiblingMove::NoAdjacentSibling);
            };
            let siblings = tx.children(parent)?;
            let position = siblings.iter().position(|s| s.id == node).ok_or_else(|| {
                Error::InvariantViolation(format!("node {node} missing from children of {parent}"))
            })?;
            let neighbour = match direction {
                Direction::Up => position.checked_sub(1).and_then(|i| siblings.get(i)),
                Direction::Down => siblings.get(position + 1),
            };
            let Some(neighbour) = neighbour else {
                return Ok(SiblingMove::NoAdjacentSibling);
            };
            let target = match direction {
                Direction::Up => Target::Before(neighbour.id),
                Direction::Down => Target::After(neighbour.id),
            };
            relocate(tx, bounds, target)?;
            Ok(SiblingMove::Swapped { with: neighbour.id })
        })?;
        tracing::debug!(node = %node, ?direction, ?outcome, "reordered page node");
        Ok(outcome)
    }

    /// Removes a node and closes the gap it leaves. A canonical node must not
    /// have descendants; its drafts go with it. Removing a draft renumbers
    /// nothing.
    pub fn delete(&mut self, node: NodeId) -> Result<()> {
        self.structural(|tx| {
            let current = tx.require(node)?;
            let Some(bounds) = current.bounds() else {
                return tx.remove(node);
            };
            if !bounds.is_leaf() {
                return Err(Error::InvalidOperation(format!(
                    "node {node} still has descendants; delete them first"
                )));
            }
            for draft in tx.query(&NodeFilter::new(Relation::DraftsOf(node)))? {
                tx.remove(draft.id)?;
            }
            tx.remove(node)?;
            tx.shift_from(bounds.left, -bounds.width())
        })?;
        tracing::debug!(node = %node, "deleted page node");
        Ok(())
    }

    /// Cascading delete: removes `node`, every canonical descendant and all
    /// their drafts, then closes the gap once. Returns the removed ids.
    pub fn delete_branch(&mut self, node: NodeId) -> Result<Vec<NodeId>> {
        let removed = self.structural(|tx| {
            let current = tx.require(node)?;
            let Some(bounds) = current.bounds() else {
                tx.remove(node)?;
                return Ok(vec![node]);
            };
            let mut branch = vec![current];
            branch.extend(tx.query(&NodeFilter::new(Relation::DescendantsOf(bounds)))?);

            let mut removed = Vec::new();
            for page in &branch {
                for draft in tx.query(&NodeFilter::new(Relation::DraftsOf(page.id)))? {
                    tx.remove(draft.id)?;
                    removed.push(draft.id);
                }
                tx.remove(page.id)?;
                removed.push(page.id);
            }
            tx.shift_from(bounds.left, -bounds.width())?;
            Ok(removed)
        })?;
        tracing::debug!(node = %node, removed = removed.len(), "deleted page branch");
        Ok(removed)
    }

    /// Field edit; never touches bounds and takes no tree lock.
    pub fn update_publication(&mut self, node: NodeId, publication: Publication) -> Result<()> {
        self.store.transaction(|tx| {
            tx.require(node)?;
            tx.set_publication(node, &publication)
        })
    }

    pub fn set_group_key(&mut self, node: NodeId, group_key: Option<&str>) -> Result<()> {
        self.store.transaction(|tx| {
            tx.require(node)?;
            tx.set_group_key(node, group_key)
        })
    }

    /// Recomputes every canonical bound from parent links alone (siblings
    /// keep their current relative order) and refreshes draft snapshots.
    pub fn rebuild(&mut self) -> Result<RebuildReport> {
        let report = self.structural(|tx| {
            let table = tx.nodes()?;
            let (drafts, canonical): (Vec<&Node>, Vec<&Node>) =
                table.iter().partition(|n| n.is_draft());
            let roots: Vec<&Node> = canonical.iter().copied().filter(|n| n.is_root()).collect();
            let mut report = RebuildReport {
                canonical: canonical.len(),
                ..RebuildReport::default()
            };
            if canonical.is_empty() {
                return Ok(report);
            }
            let [root] = roots.as_slice() else {
                return Err(Error::InvariantViolation(format!(
                    "cannot rebuild a tree with {} roots",
                    roots.len()
                )));
            };

            // `table` is ordered by left bound, so each child list keeps the
            // current sibling order.
            let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
            for node in &canonical {
                if let Some(parent) = node.parent() {
                    children.entry(parent).or_default().push(node.id);
                }
            }

            let mut fresh: HashMap<NodeId, Bounds> = HashMap::with_capacity(canonical.len());
            let mut lefts: HashMap<NodeId, i64> = HashMap::with_capacity(canonical.len());
            let mut next = 1;
            let mut stack = vec![(root.id, false)];
            while let Some((id, closing)) = stack.pop() {
                if closing {
                    fresh.insert(id, Bounds::new(lefts[&id], next));
                    next += 1;
                    continue;
                }
                lefts.insert(id, next);
                next += 1;
                stack.push((id, true));
                if let Some(kids) = children.get(&id) {
                    stack.extend(kids.iter().rev().map(|kid| (*kid, false)));
                }
            }
            if fresh.len() != canonical.len() {
                let unreachable: Vec<String> = canonical
                    .iter()
                    .filter(|n| !fresh.contains_key(&n.id))
                    .map(|n| n.id.to_string())
                    .collect();
                return Err(Error::InvariantViolation(format!(
                    "nodes unreachable from the root: {}",
                    unreachable.join(", ")
                )));
            }

            for node in &canonical {
                let bounds = fresh[&node.id];
                if node.bounds() != Some(bounds) {
                    tx.set_bounds(node.id, bounds)?;
                    report.renumbered += 1;
                }
            }
            for draft in &drafts {
                let Some(owner) = draft.owner() else {
                    continue;
                };
                match fresh.get(&owner) {
                    Some(bounds) if *bounds != draft.stored_bounds() => {
                        tx.set_bounds(draft.id, *bounds)?;
                        report.drafts_refreshed += 1;
                    }
                    Some(_) => {}
                    None => tracing::warn!(draft = %draft.id, owner = %owner, "draft owner missing"),
                }
            }
            Ok(report)
        })?;
        tracing::info!(
            canonical = report.canonical,
            renumbered = report.renumbered,
            drafts_refreshed = report.drafts_refreshed,
            "rebuilt page tree"
        );
        Ok(report)
    }

    /// Audits the committed canonical tree.
    pub fn check(&self) -> Result<()> {
        check_canonical(&self.store.query(&NodeFilter::new(Relation::Canonical))?)
    }

    pub fn get(&self, ctx: &PublicationContext, id: NodeId) -> Result<Option<Node>> {
        Ok(self.read(ctx, Relation::Id(id))?.into_iter().next())
    }

    pub fn homepage(&self, ctx: &PublicationContext) -> Result<Option<Node>> {
        Ok(self.read(ctx, Relation::Root)?.into_iter().next())
    }

    /// Navigation: canonical children in sibling order.
    pub fn children(&self, ctx: &PublicationContext, id: NodeId) -> Result<Vec<Node>> {
        self.resolve(id)?;
        self.read(ctx, Relation::ChildrenOf(id))
    }

    pub fn descendants(&self, ctx: &PublicationContext, id: NodeId) -> Result<Vec<Node>> {
        let bounds = self.tree_position(id)?;
        self.read(ctx, Relation::DescendantsOf(bounds))
    }

    /// Breadcrumb: strict ancestors, root first. For a draft, the ancestors
    /// of its owner.
    pub fn ancestors(&self, ctx: &PublicationContext, id: NodeId) -> Result<Vec<Node>> {
        let bounds = self.tree_position(id)?;
        self.read(ctx, Relation::AncestorsOf(bounds))
    }

    pub fn drafts(&self, ctx: &PublicationContext, owner: NodeId) -> Result<Vec<Node>> {
        self.resolve(owner)?;
        self.read(ctx, Relation::DraftsOf(owner))
    }

    pub fn nodes(&self, ctx: &PublicationContext) -> Result<Vec<Node>> {
        self.read(ctx, Relation::Everything)
    }

    /// Reference visibility check that walks the parent chain one row at a
    /// time. Under [`ScopeMode::All`] every existing node is visible.
    pub fn is_visible(
        &self,
        ctx: &PublicationContext,
        id: NodeId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let node = self.store.get(id)?.ok_or(Error::NotFound(id))?;
        if ctx.mode() == ScopeMode::All {
            return Ok(true);
        }
        if !node.publication.is_publishable(at) {
            return Ok(false);
        }
        let group = node.group_key.as_deref();
        let mut next = match node.placement {
            Placement::Canonical { parent, .. } => parent,
            Placement::Draft { owner, .. } => self.store.get(owner)?.and_then(|o| o.parent()),
        };
        let mut seen = HashSet::new();
        while let Some(ancestor_id) = next {
            if !seen.insert(ancestor_id) {
                return Err(Error::InvariantViolation(format!(
                    "parent cycle through node {ancestor_id}"
                )));
            }
            let ancestor = self.store.get(ancestor_id)?.ok_or_else(|| {
                Error::InvariantViolation(format!("missing ancestor {ancestor_id} of node {id}"))
            })?;
            if blocker_applies(ancestor.group_key.as_deref(), group)
                && !ancestor.publication.is_publishable(at)
            {
                return Ok(false);
            }
            next = ancestor.parent();
        }
        Ok(true)
    }

    /// [`Self::is_visible`] at the clock's current minute.
    pub fn is_visible_now(&self, ctx: &PublicationContext, id: NodeId) -> Result<bool> {
        self.is_visible(ctx, id, truncate_to_minute(self.clock.now()))
    }

    fn read(&self, ctx: &PublicationContext, relation: Relation) -> Result<Vec<Node>> {
        let filter = NodeFilter::new(relation).live_at(ctx.live_at(self.clock.now()));
        self.store.query(&filter)
    }

    /// Unfiltered lookup; a missing id is `NotFound` regardless of scope.
    fn resolve(&self, id: NodeId) -> Result<Node> {
        self.store.get(id)?.ok_or(Error::NotFound(id))
    }

    fn tree_position(&self, id: NodeId) -> Result<Bounds> {
        let node = self.resolve(id)?;
        match node.placement {
            Placement::Canonical { bounds, .. } => Ok(bounds),
            Placement::Draft { owner, .. } => {
                let owner = self.store.get(owner)?.ok_or(Error::NotFound(owner))?;
                canonical_bounds(&owner)
            }
        }
    }

    /// Runs `f` under the tree lock and, when configured, audits the
    /// canonical set before the transaction commits.
    fn structural<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TreeTransaction) -> Result<T>,
    {
        let timeout = self.config.lock_timeout;
        let verify = self.config.verify_after_write;
        self.store.transaction(|tx| {
            if let Err(err) = tx.lock_tree(timeout) {
                if err.is_retryable() {
                    tracing::warn!(?timeout, "page tree lock not acquired");
                }
                return Err(err);
            }
            let out = f(tx)?;
            if verify {
                check_canonical(&tx.query(&NodeFilter::new(Relation::Canonical))?)?;
            }
            Ok(out)
        })
    }
}

fn canonical_placement(node: &Node) -> Result<(Option<NodeId>, Bounds)> {
    match node.placement {
        Placement::Canonical { parent, bounds } => Ok((parent, bounds)),
        Placement::Draft { .. } => Err(Error::InvalidOperation(format!(
            "draft {} is not part of the tree",
            node.id
        ))),
    }
}

fn canonical_bounds(node: &Node) -> Result<Bounds> {
    canonical_placement(node).map(|(_, bounds)| bounds)
}

/// Excise the branch at `bounds`, then reinsert it at `target`:
///
/// 1. negate the branch so range shifts skip it;
/// 2. close its gap (everything at or past its left edge moves down by its
///    width);
/// 3. read the target's shifted bounds and open a gap of the same width;
/// 4. flip the branch back, offset by the distance it travelled.
///
/// Returns the branch's new bounds.
fn relocate(tx: &mut dyn TreeTransaction, bounds: Bounds, target: Target) -> Result<Bounds> {
    let width = bounds.width();
    tx.negate_branch(bounds)?;
    tx.shift_from(bounds.left, -width)?;

    let gap = match target {
        Target::LastChildOf(id) => canonical_bounds(&tx.require(id)?)?.right,
        Target::Before(id) => canonical_bounds(&tx.require(id)?)?.left,
        Target::After(id) => canonical_bounds(&tx.require(id)?)?.right + 1,
    };
    tx.shift_from(gap, width)?;
    tx.restore_negated(gap - bounds.left)?;
    Ok(Bounds::new(gap, gap + width - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{FixedClock, MemoryStore};
    use chrono::TimeZone;

    fn tree() -> PageTree<MemoryStore, FixedClock> {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        PageTree::with_defaults(MemoryStore::new(), clock)
    }

    fn bounds_of(tree: &PageTree<MemoryStore, FixedClock>, id: NodeId) -> Bounds {
        tree.store().get(id).unwrap().unwrap().stored_bounds()
    }

    #[test]
    fn second_parentless_insert_lands_under_root() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let page = tree.insert(None, NodeAttrs::default()).unwrap();

        assert_eq!(bounds_of(&tree, root), Bounds::new(1, 4));
        assert_eq!(bounds_of(&tree, page), Bounds::new(2, 3));
        let stored = tree.store().get(page).unwrap().unwrap();
        assert_eq!(stored.parent(), Some(root));
    }

    #[test]
    fn explicit_parent_on_empty_tree_is_not_found() {
        let mut tree = tree();
        let err = tree.insert(Some(NodeId(42)), NodeAttrs::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(NodeId(42))));
        assert!(tree.store().is_empty());
    }

    #[test]
    fn moving_beneath_own_descendant_is_rejected() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let a = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let b = tree.insert(Some(a), NodeAttrs::default()).unwrap();

        let err = tree.move_node(a, b).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
        let err = tree.move_node(a, a).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
        assert_eq!(bounds_of(&tree, b), Bounds::new(3, 4));
    }

    #[test]
    fn move_carries_the_whole_branch() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let a = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let b = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let b1 = tree.insert(Some(b), NodeAttrs::default()).unwrap();
        let b2 = tree.insert(Some(b), NodeAttrs::default()).unwrap();

        assert_eq!(tree.move_node(b, a).unwrap(), MoveOutcome::Moved);

        assert_eq!(bounds_of(&tree, root), Bounds::new(1, 10));
        assert_eq!(bounds_of(&tree, a), Bounds::new(2, 9));
        assert_eq!(bounds_of(&tree, b), Bounds::new(3, 8));
        assert_eq!(bounds_of(&tree, b1), Bounds::new(4, 5));
        assert_eq!(bounds_of(&tree, b2), Bounds::new(6, 7));
        tree.check().unwrap();
    }

    #[test]
    fn delete_refuses_nodes_with_children() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        tree.insert(Some(root), NodeAttrs::default()).unwrap();

        let err = tree.delete(root).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(bounds_of(&tree, root), Bounds::new(1, 4));
    }

    #[test]
    fn drafts_are_never_renumbered() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let a = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let draft = tree
            .insert_draft(a, NodeAttrs::default().with_group("fr"))
            .unwrap();
        assert_eq!(bounds_of(&tree, draft), Bounds::new(2, 3));

        let b = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        tree.move_node(a, b).unwrap();

        assert_eq!(bounds_of(&tree, a), Bounds::new(3, 4));
        assert_eq!(bounds_of(&tree, draft), Bounds::new(2, 3));
        assert!(matches!(
            tree.move_node(draft, root),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn rebuild_refreshes_draft_snapshots() {
        let mut tree = tree();
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let a = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let b = tree.insert(Some(root), NodeAttrs::default()).unwrap();
        let draft = tree.insert_draft(a, NodeAttrs::default()).unwrap();
        tree.move_node(a, b).unwrap();

        let report = tree.rebuild().unwrap();
        assert_eq!(report.canonical, 3);
        assert_eq!(report.renumbered, 0);
        assert_eq!(report.drafts_refreshed, 1);
        assert_eq!(bounds_of(&tree, draft), Bounds::new(3, 4));
    }
}
