use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use pagetree_core::{
    Direction, Error, FixedClock, MemoryStore, NodeAttrs, NodeFilter, NodeId, NodeStore, PageTree,
    Publication, Relation, ScopeMode,
};

#[derive(Clone, Debug)]
enum Op {
    Insert { parent: usize },
    Draft { owner: usize, group: Option<&'static str> },
    Move { node: usize, parent: usize },
    Sibling { node: usize, up: bool },
    Delete { node: usize },
    DeleteBranch { node: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<usize>().prop_map(|parent| Op::Insert { parent }),
        1 => (any::<usize>(), prop::option::of(prop::sample::select(vec!["en", "fr"])))
            .prop_map(|(owner, group)| Op::Draft { owner, group }),
        3 => (any::<usize>(), any::<usize>()).prop_map(|(node, parent)| Op::Move { node, parent }),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(node, up)| Op::Sibling { node, up }),
        1 => any::<usize>().prop_map(|node| Op::Delete { node }),
        1 => any::<usize>().prop_map(|node| Op::DeleteBranch { node }),
    ]
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn publication() -> impl Strategy<Value = Publication> {
    (any::<bool>(), prop::option::of(-3i64..3), prop::option::of(-3i64..3)).prop_map(
        |(is_online, start, end)| Publication {
            is_online,
            publication_start: start.map(|h| noon() + TimeDelta::hours(h)),
            publication_end: end.map(|h| noon() + TimeDelta::hours(h)),
        },
    )
}

fn canonical_ids(store: &MemoryStore) -> Vec<NodeId> {
    store
        .query(&NodeFilter::new(Relation::Canonical))
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect()
}

fn all_ids(store: &MemoryStore) -> Vec<NodeId> {
    store
        .query(&NodeFilter::new(Relation::Everything))
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect()
}

proptest! {
    #[test]
    fn structural_edits_keep_the_nested_set_valid(ops in prop::collection::vec(op(), 1..40)) {
        let mut tree = PageTree::with_defaults(MemoryStore::new(), FixedClock::new(noon()));
        tree.insert(None, NodeAttrs::default()).unwrap();

        for op in ops {
            let canonical = canonical_ids(tree.store());
            if canonical.is_empty() {
                break;
            }
            let pick = |i: usize| canonical[i % canonical.len()];
            let before = tree.store().clone();
            let res = match op {
                Op::Insert { parent } => tree.insert(Some(pick(parent)), NodeAttrs::default()).map(|_| ()),
                Op::Draft { owner, group } => {
                    let attrs = match group {
                        Some(group) => NodeAttrs::default().with_group(group),
                        None => NodeAttrs::default(),
                    };
                    tree.insert_draft(pick(owner), attrs).map(|_| ())
                }
                Op::Move { node, parent } => tree.move_node(pick(node), pick(parent)).map(|_| ()),
                Op::Sibling { node, up } => {
                    let direction = if up { Direction::Up } else { Direction::Down };
                    tree.move_sibling(pick(node), direction).map(|_| ())
                }
                Op::Delete { node } => tree.delete(pick(node)),
                Op::DeleteBranch { node } => tree.delete_branch(pick(node)).map(|_| ()),
            };
            match res {
                Ok(()) => {}
                Err(Error::CycleDetected { .. }) | Err(Error::InvalidOperation(_)) => {
                    prop_assert_eq!(all_ids(tree.store()), all_ids(&before));
                    prop_assert_eq!(
                        tree.store().query(&NodeFilter::new(Relation::Everything)).unwrap(),
                        before.query(&NodeFilter::new(Relation::Everything)).unwrap()
                    );
                }
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
            tree.check().unwrap();
        }
    }

    #[test]
    fn insert_then_delete_is_identity(parents in prop::collection::vec(any::<usize>(), 1..12), at in any::<usize>()) {
        let mut tree = PageTree::with_defaults(MemoryStore::new(), FixedClock::new(noon()));
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let mut pages = vec![root];
        for parent in parents {
            let parent = pages[parent % pages.len()];
            pages.push(tree.insert(Some(parent), NodeAttrs::default()).unwrap());
        }
        let before = tree.store().query(&NodeFilter::new(Relation::Everything)).unwrap();

        let temp = tree.insert(Some(pages[at % pages.len()]), NodeAttrs::default()).unwrap();
        tree.delete(temp).unwrap();

        prop_assert_eq!(tree.store().query(&NodeFilter::new(Relation::Everything)).unwrap(), before);
    }

    #[test]
    fn live_filter_agrees_with_parent_walk(
        shape in prop::collection::vec((any::<usize>(), publication(), prop::option::of(prop::sample::select(vec!["en", "fr"]))), 1..20),
        drafts in prop::collection::vec((any::<usize>(), publication(), prop::option::of(prop::sample::select(vec!["en", "fr"]))), 0..6),
        minutes in 0i64..240,
    ) {
        let clock = FixedClock::new(noon() - TimeDelta::hours(2));
        let mut tree = PageTree::with_defaults(MemoryStore::new(), clock);
        let root = tree.insert(None, NodeAttrs::default()).unwrap();
        let mut pages = vec![root];
        for (parent, publication, group) in shape {
            let mut attrs = NodeAttrs::default().with_publication(publication);
            if let Some(group) = group {
                attrs = attrs.with_group(group);
            }
            let parent = pages[parent % pages.len()];
            pages.push(tree.insert(Some(parent), attrs).unwrap());
        }
        for (owner, publication, group) in drafts {
            let mut attrs = NodeAttrs::default().with_publication(publication);
            if let Some(group) = group {
                attrs = attrs.with_group(group);
            }
            tree.insert_draft(pages[owner % pages.len()], attrs).unwrap();
        }
        tree.clock().advance(TimeDelta::minutes(minutes));

        let mut ctx = tree.context();
        let published = ctx.scope(ScopeMode::PublishedOnly);
        let listed: Vec<NodeId> = tree.nodes(&published).unwrap().into_iter().map(|n| n.id).collect();
        let expected: Vec<NodeId> = all_ids(tree.store())
            .into_iter()
            .filter(|id| tree.is_visible_now(&published, *id).unwrap())
            .collect();
        prop_assert_eq!(listed, expected);
    }
}
