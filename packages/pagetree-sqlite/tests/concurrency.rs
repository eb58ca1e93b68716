use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use pagetree_core::{
    Error, FixedClock, NodeAttrs, NodeFilter, NodeId, NodeStore, PageTree, Publication, Relation,
    SystemClock, TreeConfig,
};
use pagetree_sqlite::SqliteStore;
use rusqlite::Connection;

#[test]
fn concurrent_writers_keep_the_tree_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pages.db");

    let mut seed = PageTree::with_defaults(SqliteStore::open(&path).unwrap(), SystemClock);
    let root = seed.insert(None, NodeAttrs::default()).unwrap();
    let sections: Vec<NodeId> = (0..4)
        .map(|_| seed.insert(Some(root), NodeAttrs::default()).unwrap())
        .collect();
    drop(seed);

    let writers: Vec<_> = sections
        .iter()
        .copied()
        .enumerate()
        .map(|(i, section)| {
            let path = path.clone();
            thread::spawn(move || {
                let config = TreeConfig::default().with_lock_timeout(Duration::from_secs(20));
                let store = SqliteStore::open(&path)
                    .unwrap()
                    .with_busy_timeout(Duration::from_secs(20))
                    .unwrap();
                let mut tree = PageTree::new(store, SystemClock, config).unwrap();
                let mut mine = Vec::new();
                for step in 0..15 {
                    let page = tree.insert(Some(section), NodeAttrs::default()).unwrap();
                    mine.push(page);
                    if step % 5 == 4 {
                        // shuffle one page into a neighbouring section
                        tree.move_node(mine.remove(0), root).unwrap();
                    }
                    if step % 7 == 6 && i % 2 == 0 {
                        tree.delete(mine.pop().unwrap()).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let tree = PageTree::with_defaults(SqliteStore::open(&path).unwrap(), SystemClock);
    tree.check().unwrap();
    let total = tree
        .store()
        .query(&NodeFilter::new(Relation::Canonical))
        .unwrap()
        .len();
    // root + sections + 60 inserts - 2 deletes from each even writer
    assert_eq!(total, 1 + 4 + 60 - 4);
}

#[test]
fn held_write_lock_times_out_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");

    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    let config = TreeConfig::default().with_lock_timeout(Duration::from_millis(50));
    let store = SqliteStore::open(&path)
        .unwrap()
        .with_busy_timeout(Duration::from_millis(50))
        .unwrap();
    let mut tree = PageTree::new(store, clock, config).unwrap();
    let root = tree.insert(None, NodeAttrs::default()).unwrap();

    let other = Connection::open(&path).unwrap();
    other.execute_batch("BEGIN IMMEDIATE").unwrap();

    let err = tree.insert(Some(root), NodeAttrs::default()).unwrap_err();
    assert!(matches!(err, Error::ConcurrencyTimeout(_)));
    assert!(err.is_retryable());

    // lock-free reads still see the committed tree
    assert_eq!(tree.store().get(root).unwrap().unwrap().id, root);

    other.execute_batch("ROLLBACK").unwrap();
    let page = tree.insert(Some(root), NodeAttrs::default()).unwrap();
    assert!(tree.store().get(page).unwrap().is_some());
    tree.check().unwrap();
}

#[test]
fn field_edits_run_alongside_structural_writers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edits.db");

    let mut seed = PageTree::with_defaults(SqliteStore::open(&path).unwrap(), SystemClock);
    let root = seed.insert(None, NodeAttrs::default()).unwrap();
    let section = seed.insert(Some(root), NodeAttrs::default()).unwrap();
    drop(seed);

    let open = |path: &std::path::Path| {
        let store = SqliteStore::open(path)
            .unwrap()
            .with_busy_timeout(Duration::from_secs(20))
            .unwrap();
        PageTree::with_defaults(store, SystemClock)
    };

    let inserter = {
        let path = path.clone();
        thread::spawn(move || {
            let mut tree = open(&path);
            for _ in 0..30 {
                tree.insert(Some(section), NodeAttrs::default()).unwrap();
            }
        })
    };
    let editor = {
        let path = path.clone();
        thread::spawn(move || {
            let mut tree = open(&path);
            for step in 0..30 {
                let publication = if step % 2 == 0 {
                    Publication::offline()
                } else {
                    Publication::default()
                };
                tree.update_publication(section, publication).unwrap();
                tree.set_group_key(section, Some("en")).unwrap();
                tree.insert_draft(section, NodeAttrs::default()).unwrap();
            }
        })
    };
    inserter.join().unwrap();
    editor.join().unwrap();

    let tree = open(&path);
    tree.check().unwrap();
    let section = tree.store().get(section).unwrap().unwrap();
    assert_eq!(section.group_key.as_deref(), Some("en"));
    assert!(section.publication.is_online);
    let drafts = tree
        .store()
        .query(&NodeFilter::new(Relation::DraftsOf(section.id)))
        .unwrap();
    assert_eq!(drafts.len(), 30);
}

#[test]
fn writer_blocked_by_an_open_edit_gets_a_retryable_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interleaved.db");

    let mut editing = SqliteStore::open(&path).unwrap();
    let blocked = SqliteStore::open(&path)
        .unwrap()
        .with_busy_timeout(Duration::from_millis(50))
        .unwrap();
    let mut tree = PageTree::with_defaults(blocked, SystemClock);
    let root = tree.insert(None, NodeAttrs::default()).unwrap();

    editing
        .transaction(|tx| {
            tx.require(root)?;
            let err = tree.insert(Some(root), NodeAttrs::default()).unwrap_err();
            assert!(matches!(err, Error::ConcurrencyTimeout(_)));
            assert!(err.is_retryable());
            tx.set_publication(root, &Publication::offline())
        })
        .unwrap();

    let page = tree.insert(Some(root), NodeAttrs::default()).unwrap();
    assert!(!tree.store().get(root).unwrap().unwrap().publication.is_online);
    assert!(tree.store().get(page).unwrap().is_some());
    tree.check().unwrap();
}
