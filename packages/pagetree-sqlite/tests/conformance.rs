use pagetree_sqlite::SqliteStore;

#[test]
fn in_memory_store_conforms() {
    pagetree_test_support::run_all(|| SqliteStore::new_in_memory().unwrap());
}

#[test]
fn file_store_conforms() {
    let dir = tempfile::tempdir().unwrap();
    let mut n = 0;
    pagetree_test_support::run_all(|| {
        n += 1;
        SqliteStore::open(dir.path().join(format!("tree-{n}.db"))).unwrap()
    });
}
