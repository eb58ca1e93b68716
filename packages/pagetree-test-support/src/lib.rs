//! Backend conformance scenarios. Each scenario takes a fresh, empty store
//! and panics on the first mismatch; [`run_all`] drives every scenario.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use pagetree_core::{
    Bounds, Direction, Error, FixedClock, MoveOutcome, NodeAttrs, NodeFilter, NodeId, NodeStore,
    PageTree, Publication, Relation, ScopeMode, SiblingMove,
};

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn new_tree<S: NodeStore>(store: S) -> PageTree<S, FixedClock> {
    PageTree::with_defaults(store, FixedClock::new(epoch()))
}

pub fn bounds<S: NodeStore>(tree: &PageTree<S, FixedClock>, id: NodeId) -> (i64, i64) {
    let node = tree
        .store()
        .get(id)
        .unwrap()
        .unwrap_or_else(|| panic!("node {id} missing"));
    let b = node.stored_bounds();
    (b.left, b.right)
}

/// Canonical `(id, bounds)` pairs ordered by left bound.
pub fn canonical_snapshot<S: NodeStore>(store: &S) -> Vec<(NodeId, Bounds)> {
    store
        .query(&NodeFilter::new(Relation::Canonical))
        .unwrap()
        .into_iter()
        .filter_map(|n| n.bounds().map(|b| (n.id, b)))
        .collect()
}

fn ids(nodes: &[pagetree_core::Node]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.id).collect()
}

fn page<S: NodeStore>(tree: &mut PageTree<S, FixedClock>, parent: Option<NodeId>) -> NodeId {
    tree.insert(parent, NodeAttrs::default()).unwrap()
}

pub fn run_all<S, F>(mut make: F)
where
    S: NodeStore,
    F: FnMut() -> S,
{
    end_to_end_nested_set(make());
    insert_then_delete_restores_bounds(make());
    move_to_current_parent_is_noop(make());
    sibling_up_then_down_restores(make());
    sibling_edges_report_no_adjacent(make());
    delete_branch_cascades(make());
    failed_transaction_rolls_back(make());
    ancestor_visibility(make());
    filtered_reads_match_oracle(make());
    reads_use_minute_resolution(make());
    sub_second_window_edges_survive_storage(make());
    drafts_follow_owner_visibility(make());
    rebuild_repairs_scrambled_bounds(make());
}

pub fn end_to_end_nested_set<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    assert_eq!(bounds(&tree, root), (1, 2));

    let a = page(&mut tree, Some(root));
    assert_eq!(bounds(&tree, root), (1, 4));
    assert_eq!(bounds(&tree, a), (2, 3));

    let b = page(&mut tree, Some(root));
    assert_eq!(bounds(&tree, root), (1, 6));
    assert_eq!(bounds(&tree, a), (2, 3));
    assert_eq!(bounds(&tree, b), (4, 5));

    assert_eq!(tree.move_node(a, b).unwrap(), MoveOutcome::Moved);
    assert_eq!(bounds(&tree, root), (1, 6));
    assert_eq!(bounds(&tree, b), (2, 5));
    assert_eq!(bounds(&tree, a), (3, 4));

    tree.delete(a).unwrap();
    assert_eq!(bounds(&tree, root), (1, 4));
    assert_eq!(bounds(&tree, b), (2, 3));
    assert!(tree.store().get(a).unwrap().is_none());
    tree.check().unwrap();
}

pub fn insert_then_delete_restores_bounds<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let a = page(&mut tree, Some(root));
    let b = page(&mut tree, Some(root));
    page(&mut tree, Some(a));
    page(&mut tree, Some(b));
    let before = canonical_snapshot(tree.store());

    let temp = page(&mut tree, Some(a));
    assert_ne!(canonical_snapshot(tree.store()), before);
    tree.delete(temp).unwrap();
    assert_eq!(canonical_snapshot(tree.store()), before);
}

pub fn move_to_current_parent_is_noop<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let a = page(&mut tree, Some(root));
    page(&mut tree, Some(root));
    page(&mut tree, Some(a));
    let before = canonical_snapshot(tree.store());

    assert_eq!(tree.move_node(a, root).unwrap(), MoveOutcome::Unchanged);
    assert_eq!(canonical_snapshot(tree.store()), before);
}

pub fn sibling_up_then_down_restores<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let first = page(&mut tree, Some(root));
    let middle = page(&mut tree, Some(root));
    let last = page(&mut tree, Some(root));
    page(&mut tree, Some(middle));
    page(&mut tree, Some(first));
    let before = canonical_snapshot(tree.store());

    assert_eq!(
        tree.move_sibling(middle, Direction::Up).unwrap(),
        SiblingMove::Swapped { with: first }
    );
    let ctx = tree.context();
    assert_eq!(ids(&tree.children(&ctx, root).unwrap()), vec![middle, first, last]);
    tree.check().unwrap();

    assert_eq!(
        tree.move_sibling(middle, Direction::Down).unwrap(),
        SiblingMove::Swapped { with: first }
    );
    assert_eq!(canonical_snapshot(tree.store()), before);
}

pub fn sibling_edges_report_no_adjacent<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let only = page(&mut tree, Some(root));
    let before = canonical_snapshot(tree.store());

    assert_eq!(
        tree.move_sibling(only, Direction::Up).unwrap(),
        SiblingMove::NoAdjacentSibling
    );
    assert_eq!(
        tree.move_sibling(only, Direction::Down).unwrap(),
        SiblingMove::NoAdjacentSibling
    );
    assert_eq!(
        tree.move_sibling(root, Direction::Down).unwrap(),
        SiblingMove::NoAdjacentSibling
    );
    assert_eq!(canonical_snapshot(tree.store()), before);
}

pub fn delete_branch_cascades<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let section = page(&mut tree, Some(root));
    let child = page(&mut tree, Some(section));
    let grandchild = page(&mut tree, Some(child));
    let sibling = page(&mut tree, Some(root));
    let draft = tree
        .insert_draft(child, NodeAttrs::default().with_group("fr"))
        .unwrap();

    let mut removed = tree.delete_branch(section).unwrap();
    removed.sort();
    let mut expected = vec![section, child, grandchild, draft];
    expected.sort();
    assert_eq!(removed, expected);

    assert_eq!(bounds(&tree, root), (1, 4));
    assert_eq!(bounds(&tree, sibling), (2, 3));
    assert!(tree.store().get(draft).unwrap().is_none());
    tree.check().unwrap();
}

pub fn failed_transaction_rolls_back<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let a = page(&mut tree, Some(root));
    let b = page(&mut tree, Some(a));
    let before = canonical_snapshot(tree.store());

    assert!(matches!(
        tree.move_node(a, b),
        Err(Error::CycleDetected { .. })
    ));
    assert!(matches!(tree.delete(a), Err(Error::InvalidOperation(_))));
    assert!(matches!(
        tree.move_node(NodeId(u32::MAX as u64), root),
        Err(Error::NotFound(_))
    ));

    let mut store = tree.into_store();
    let res: pagetree_core::Result<()> = store.transaction(|tx| {
        tx.shift_from(1, 7)?;
        tx.remove(b)?;
        Err(Error::InvalidOperation("abort".into()))
    });
    assert!(res.is_err());
    assert_eq!(canonical_snapshot(&store), before);
}

pub fn ancestor_visibility<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let c = tree
        .insert(
            Some(root),
            NodeAttrs::default().with_publication(Publication::offline()),
        )
        .unwrap();
    let d = page(&mut tree, Some(c));
    let e = page(&mut tree, Some(root));
    let at = epoch();

    let mut ctx = tree.context();
    assert!(tree.is_visible(&ctx, d, at).unwrap());
    {
        let mut published = ctx.scope(ScopeMode::PublishedOnly);
        assert!(tree.is_visible(&published, root, at).unwrap());
        assert!(!tree.is_visible(&published, c, at).unwrap());
        assert!(!tree.is_visible(&published, d, at).unwrap());
        assert_eq!(ids(&tree.children(&published, root).unwrap()), vec![e]);
        assert_eq!(ids(&tree.descendants(&published, root).unwrap()), vec![e]);
        assert!(tree.get(&published, d).unwrap().is_none());
        {
            let everything = published.select_published(false);
            assert!(tree.is_visible(&everything, d, at).unwrap());
            assert_eq!(tree.descendants(&everything, root).unwrap().len(), 3);
        }
        assert!(!tree.is_visible(&published, d, at).unwrap());
    }
    assert_eq!(ctx.mode(), ScopeMode::All);
    assert_eq!(ids(&tree.ancestors(&ctx, d).unwrap()), vec![root, c]);

    tree.update_publication(c, Publication::online()).unwrap();
    let published = ctx.scope(ScopeMode::PublishedOnly);
    assert!(tree.is_visible(&published, d, at).unwrap());
    assert_eq!(bounds(&tree, d), (3, 4));
}

/// Set-based reads and the parent-walk oracle agree on a mixed tree.
pub fn filtered_reads_match_oracle<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let at = epoch();
    let later = at + TimeDelta::hours(1);
    let earlier = at - TimeDelta::hours(1);
    let publications = [
        Publication::online(),
        Publication::offline(),
        Publication::window(Some(later), None),
        Publication::window(None, Some(earlier)),
        Publication::window(Some(earlier), Some(later)),
    ];
    let groups = [None, Some("en"), Some("fr")];

    let root = page(&mut tree, None);
    let mut pages = vec![root];
    for i in 0..18usize {
        let parent = pages[(i * 7) % pages.len()];
        let mut attrs = NodeAttrs::default().with_publication(publications[i % 5].clone());
        if let Some(group) = groups[i % 3] {
            attrs = attrs.with_group(group);
        }
        pages.push(tree.insert(Some(parent), attrs).unwrap());
    }
    for (i, owner) in pages.iter().enumerate().step_by(4) {
        let attrs = NodeAttrs::default()
            .with_group(if i % 8 == 0 { "en" } else { "fr" })
            .with_publication(publications[(i + 1) % 5].clone());
        tree.insert_draft(*owner, attrs).unwrap();
    }
    tree.check().unwrap();

    let mut ctx = tree.context();
    for published in [false, true] {
        let scoped = ctx.select_published(published);
        let listed = ids(&tree.nodes(&scoped).unwrap());
        let mut expected = Vec::new();
        for node in tree.store().query(&NodeFilter::new(Relation::Everything)).unwrap() {
            if tree.is_visible(&scoped, node.id, at).unwrap() {
                expected.push(node.id);
            }
        }
        assert_eq!(listed, expected, "published_only = {published}");
        if published {
            assert!(!listed.contains(&pages[2]));
        } else {
            assert_eq!(listed.len(), tree.store().query(&NodeFilter::new(Relation::Everything)).unwrap().len());
        }
    }
}

pub fn reads_use_minute_resolution<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let start = epoch() + TimeDelta::seconds(30);
    let scheduled = tree
        .insert(
            Some(root),
            NodeAttrs::default().with_publication(Publication::window(Some(start), None)),
        )
        .unwrap();

    tree.clock().set(epoch() + TimeDelta::seconds(45));
    let mut ctx = tree.context();
    let published = ctx.scope(ScopeMode::PublishedOnly);

    // the raw instant is past the start, the request minute is not
    assert!(tree
        .is_visible(&published, scheduled, epoch() + TimeDelta::seconds(45))
        .unwrap());
    assert!(!tree.is_visible_now(&published, scheduled).unwrap());
    assert!(tree.children(&published, root).unwrap().is_empty());

    tree.clock().advance(TimeDelta::seconds(15));
    assert_eq!(ids(&tree.children(&published, root).unwrap()), vec![scheduled]);
}

pub fn sub_second_window_edges_survive_storage<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let half = TimeDelta::milliseconds(500);
    let ending = tree
        .insert(
            Some(root),
            NodeAttrs::default().with_publication(Publication::window(None, Some(epoch() + half))),
        )
        .unwrap();
    let starting = tree
        .insert(
            Some(root),
            NodeAttrs::default().with_publication(Publication::window(Some(epoch() + half), None)),
        )
        .unwrap();

    let stored = tree.store().get(ending).unwrap().unwrap();
    assert_eq!(stored.publication.publication_end, Some(epoch() + half));

    let mut ctx = tree.context();
    let published = ctx.scope(ScopeMode::PublishedOnly);
    // at 12:00 the end is still ahead and the start not yet reached
    assert_eq!(ids(&tree.children(&published, root).unwrap()), vec![ending]);
    assert!(tree.is_visible_now(&published, ending).unwrap());
    assert!(!tree.is_visible_now(&published, starting).unwrap());
}

pub fn drafts_follow_owner_visibility<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let at = epoch();
    let root = page(&mut tree, None);
    let hidden = tree
        .insert(
            Some(root),
            NodeAttrs::default()
                .with_group("fr")
                .with_publication(Publication::offline()),
        )
        .unwrap();
    let page_under_hidden = page(&mut tree, Some(hidden));
    let open = page(&mut tree, Some(root));

    let french = tree
        .insert_draft(page_under_hidden, NodeAttrs::default().with_group("fr"))
        .unwrap();
    let english = tree
        .insert_draft(page_under_hidden, NodeAttrs::default().with_group("en"))
        .unwrap();

    let mut ctx = tree.context();
    {
        let published = ctx.scope(ScopeMode::PublishedOnly);
        assert!(!tree.is_visible(&published, french, at).unwrap());
        assert!(tree.is_visible(&published, english, at).unwrap());
        assert_eq!(
            ids(&tree.drafts(&published, page_under_hidden).unwrap()),
            vec![english]
        );
    }

    // a moved owner takes its drafts' visibility with it, stale snapshots
    // notwithstanding
    tree.move_node(page_under_hidden, open).unwrap();
    let published = ctx.scope(ScopeMode::PublishedOnly);
    assert!(tree.is_visible(&published, french, at).unwrap());
    let mut drafts = ids(&tree.drafts(&published, page_under_hidden).unwrap());
    drafts.sort();
    let mut expected = vec![french, english];
    expected.sort();
    assert_eq!(drafts, expected);
    assert_eq!(ids(&tree.ancestors(&published, french).unwrap()), vec![root, open]);
}

pub fn rebuild_repairs_scrambled_bounds<S: NodeStore>(store: S) {
    let mut tree = new_tree(store);
    let root = page(&mut tree, None);
    let a = page(&mut tree, Some(root));
    let b = page(&mut tree, Some(root));
    let a1 = page(&mut tree, Some(a));
    let draft = tree.insert_draft(a1, NodeAttrs::default()).unwrap();
    let good = canonical_snapshot(tree.store());

    tree.store_mut()
        .transaction(|tx| {
            tx.set_bounds(root, Bounds::new(10, 90))?;
            tx.set_bounds(a, Bounds::new(20, 40))?;
            tx.set_bounds(a1, Bounds::new(25, 26))?;
            tx.set_bounds(b, Bounds::new(50, 51))?;
            tx.set_bounds(draft, Bounds::new(0, 1))
        })
        .unwrap();
    assert!(matches!(tree.check(), Err(Error::InvariantViolation(_))));
    // structural edits refuse to commit on top of a corrupt tree
    assert!(matches!(
        tree.insert(Some(b), NodeAttrs::default()),
        Err(Error::InvariantViolation(_))
    ));

    let report = tree.rebuild().unwrap();
    assert_eq!(report.canonical, 4);
    assert_eq!(report.renumbered, 4);
    assert_eq!(report.drafts_refreshed, 1);
    assert_eq!(canonical_snapshot(tree.store()), good);
    assert_eq!(bounds(&tree, draft), bounds(&tree, a1));
    tree.check().unwrap();
}
