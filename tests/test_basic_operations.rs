use tempfile::TempDir;
use voron::{Error, StorageEnvironment, StorageEnvironmentOptions, TreeFlags};

// Common test setup
fn setup_test_env() -> (TempDir, StorageEnvironment) {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new().unwrap();
    let env = StorageEnvironment::open(StorageEnvironmentOptions::for_path(temp_dir.path())).unwrap();
    (temp_dir, env)
}

#[test]
fn test_tree_open_close() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();

    // Creating a tree twice hands out the same tree
    txn.create_tree("testdb").unwrap();
    txn.create_tree("testdb").unwrap();
    assert_eq!(txn.tree_names().unwrap(), vec!["testdb".to_string()]);
    txn.commit().unwrap();

    let txn = env.read_transaction().unwrap();
    assert!(txn.read_tree("testdb").unwrap().is_some());
    assert!(txn.read_tree("missing").unwrap().is_none());
}

#[test]
fn test_basic_put_get() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn.create_tree("data").unwrap();

    // Test putting and getting data
    let key = b"test_key";
    let value = b"test_value";

    tree.add(&mut txn, key, value).unwrap();
    let result = tree.read(&txn, key).unwrap();

    assert_eq!(result.unwrap(), value);
}

#[test]
fn test_delete_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn.create_tree("data").unwrap();

    // Insert and then delete data
    let key = b"delete_key";
    let value = b"delete_value";

    tree.add(&mut txn, key, value).unwrap();
    assert!(tree.read(&txn, key).unwrap().is_some());

    assert!(tree.delete(&mut txn, key).unwrap());
    assert!(tree.read(&txn, key).unwrap().is_none());
}

#[test]
fn test_tree_stats() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn.create_tree("data").unwrap();

    // Get initial stats
    let stats = tree.stats(&txn).unwrap();
    assert_eq!(stats.entries, 0);

    // Add some entries and check stats
    for i in 0..5 {
        let key = format!("key_{}", i);
        let value = format!("value_{}", i);
        tree.add(&mut txn, key.as_bytes(), value.as_bytes()).unwrap();
    }

    let stats = tree.stats(&txn).unwrap();
    assert_eq!(stats.entries, 5);
    assert_eq!(stats.leaf_pages, 1);
}

#[test]
fn test_error_handling() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn.create_tree("data").unwrap();

    // Test key not found
    let result = tree.read(&txn, b"nonexistent_key").unwrap();
    assert!(result.is_none());
    txn.commit().unwrap();

    // Writes through a read transaction are refused
    let mut read_txn = env.read_transaction().unwrap();
    let result = tree.add(&mut read_txn, b"key", b"value");
    assert!(matches!(result, Err(Error::TransactionReadOnly)));
    assert!(matches!(
        read_txn.create_tree("other"),
        Err(Error::TransactionReadOnly)
    ));

    // Fixed-size and variable trees do not mix
    let mut txn = env.write_transaction().unwrap();
    assert!(matches!(
        txn.fixed_tree("data", 8),
        Err(Error::InvalidOperation(_))
    ));
}

#[test]
fn test_transaction_isolation() {
    let (_dir, env) = setup_test_env();

    {
        let mut txn = env.write_transaction().unwrap();
        txn.create_tree("data").unwrap();
        txn.commit().unwrap();
    }

    // Write transaction
    let mut write_txn = env.write_transaction().unwrap();
    let mut tree = write_txn.create_tree("data").unwrap();
    tree.add(&mut write_txn, b"key", b"value").unwrap();

    // Read transaction shouldn't see uncommitted changes
    let read_txn = env.read_transaction().unwrap();
    let result = tree.read(&read_txn, b"key").unwrap();
    assert!(result.is_none());

    // After commit, changes should be visible to new readers only
    write_txn.commit().unwrap();
    assert!(tree.read(&read_txn, b"key").unwrap().is_none());
    let read_txn = env.read_transaction().unwrap();
    let result = tree.read(&read_txn, b"key").unwrap();
    assert_eq!(result.unwrap(), b"value");
}

#[test]
fn test_rollback_discards_changes() {
    let (_dir, env) = setup_test_env();
    {
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("data").unwrap();
        tree.add(&mut txn, b"kept", b"1").unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("data").unwrap();
        tree.add(&mut txn, b"dropped", b"2").unwrap();
        txn.create_tree("scratch").unwrap();
        txn.rollback();
    }

    let txn = env.read_transaction().unwrap();
    let tree = txn.read_tree("data").unwrap().unwrap();
    assert!(tree.read(&txn, b"kept").unwrap().is_some());
    assert!(tree.read(&txn, b"dropped").unwrap().is_none());
    assert!(txn.read_tree("scratch").unwrap().is_none());
}

#[test]
fn test_cursor_iteration() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn
        .create_tree_with_flags("compressed", TreeFlags::LEAFS_COMPRESSED)
        .unwrap();
    for i in (0..300).rev() {
        let key = format!("user/{:04}", i);
        tree.add(&mut txn, key.as_bytes(), &[b'v'; 100]).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.read_transaction().unwrap();
    let tree = txn.read_tree("compressed").unwrap().unwrap();
    let keys: Vec<String> = tree
        .seek(&txn, b"user/0150")
        .unwrap()
        .map(|entry| String::from_utf8(entry.unwrap().0).unwrap())
        .collect();
    assert_eq!(keys.len(), 150);
    assert_eq!(keys[0], "user/0150");
    assert_eq!(keys[149], "user/0299");
}

#[test]
fn test_delete_tree_frees_pages() {
    let (_dir, env) = setup_test_env();
    {
        let mut txn = env.write_transaction().unwrap();
        let mut tree = txn.create_tree("big").unwrap();
        for i in 0..1000u32 {
            tree.add(&mut txn, &i.to_be_bytes(), &[1u8; 64]).unwrap();
        }
        txn.commit().unwrap();
    }
    let free_before = env.stats().free_pages;
    {
        let mut txn = env.write_transaction().unwrap();
        txn.delete_tree("big").unwrap();
        assert!(matches!(
            txn.delete_tree("big"),
            Err(Error::TreeNotFound(_))
        ));
        txn.commit().unwrap();
    }
    assert!(env.stats().free_pages > free_before + 10);
    let txn = env.read_transaction().unwrap();
    assert!(txn.tree_names().unwrap().is_empty());
}
