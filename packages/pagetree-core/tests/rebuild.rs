use chrono::{TimeZone, Utc};
use pagetree_core::{
    Bounds, Error, FixedClock, MemoryStore, NewNode, NodeAttrs, NodeId, NodeStore, PageTree,
    Placement, RebuildReport,
};

fn tree_over(store: MemoryStore) -> PageTree<MemoryStore, FixedClock> {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    PageTree::with_defaults(store, clock)
}

fn canonical(parent: Option<NodeId>, left: i64, right: i64) -> NewNode {
    NewNode {
        placement: Placement::Canonical {
            parent,
            bounds: Bounds::new(left, right),
        },
        attrs: NodeAttrs::default(),
    }
}

#[test]
fn empty_tree_rebuilds_to_nothing() {
    let mut tree = tree_over(MemoryStore::new());
    assert_eq!(tree.rebuild().unwrap(), RebuildReport::default());
}

#[test]
fn healthy_tree_is_left_alone() {
    let mut tree = tree_over(MemoryStore::new());
    let root = tree.insert(None, NodeAttrs::default()).unwrap();
    let a = tree.insert(Some(root), NodeAttrs::default()).unwrap();
    tree.insert(Some(a), NodeAttrs::default()).unwrap();

    let report = tree.rebuild().unwrap();
    assert_eq!(report.canonical, 3);
    assert_eq!(report.renumbered, 0);
}

#[test]
fn bounds_are_recomputed_from_parent_links() {
    let mut store = MemoryStore::new();
    // parent links only, with overlapping garbage bounds
    let (root, a, b, b1) = store
        .transaction(|tx| {
            let root = tx.create(canonical(None, 1, 2))?;
            let a = tx.create(canonical(Some(root), 5, 9))?;
            let b = tx.create(canonical(Some(root), 7, 8))?;
            let b1 = tx.create(canonical(Some(b), 7, 8))?;
            Ok((root, a, b, b1))
        })
        .unwrap();
    let mut tree = tree_over(store);
    assert!(tree.check().is_err());

    let report = tree.rebuild().unwrap();
    assert_eq!(report.canonical, 4);
    tree.check().unwrap();

    let bounds = |id| tree.store().get(id).unwrap().unwrap().stored_bounds();
    assert_eq!(bounds(root), Bounds::new(1, 8));
    assert_eq!(bounds(a), Bounds::new(2, 3));
    assert_eq!(bounds(b), Bounds::new(4, 7));
    assert_eq!(bounds(b1), Bounds::new(5, 6));
}

#[test]
fn two_roots_cannot_be_rebuilt() {
    let mut store = MemoryStore::new();
    store
        .transaction(|tx| {
            tx.create(canonical(None, 1, 2))?;
            tx.create(canonical(None, 3, 4))
        })
        .unwrap();
    let mut tree = tree_over(store);
    assert!(matches!(tree.rebuild(), Err(Error::InvariantViolation(_))));
}

#[test]
fn parent_cycles_are_reported_as_unreachable() {
    let mut store = MemoryStore::new();
    store
        .transaction(|tx| {
            tx.create(canonical(None, 1, 2))?;
            let x = tx.create(canonical(None, 3, 6))?;
            let y = tx.create(canonical(Some(x), 4, 5))?;
            tx.set_parent(x, Some(y))
        })
        .unwrap();
    let mut tree = tree_over(store);
    let before = tree.store().clone();

    let err = tree.rebuild().unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(ref msg) if msg.contains("unreachable")));
    assert_eq!(tree.store().len(), before.len());
}
