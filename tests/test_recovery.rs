use std::fs;

use tempfile::TempDir;
use voron::{OptionChange, StorageEnvironment, StorageEnvironmentOptions, TransactionsMode};

fn options(dir: &TempDir) -> StorageEnvironmentOptions {
    let _ = env_logger::builder().is_test(true).try_init();
    StorageEnvironmentOptions::for_path(dir.path())
}

fn journals(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".journal"))
        .collect();
    names.sort();
    names
}

fn write_entries(env: &StorageEnvironment, tree: &str, range: std::ops::Range<u32>) {
    let mut txn = env.write_transaction().unwrap();
    let mut tree = txn.create_tree(tree).unwrap();
    for i in range {
        let key = format!("key/{:06}", i);
        tree.add(&mut txn, key.as_bytes(), &i.to_le_bytes()).unwrap();
    }
    txn.commit().unwrap();
}

fn count_entries(env: &StorageEnvironment, tree: &str) -> u64 {
    let txn = env.read_transaction().unwrap();
    match txn.read_tree(tree).unwrap() {
        Some(tree) => tree.stats(&txn).unwrap().entries,
        None => 0,
    }
}

#[test]
fn data_survives_a_clean_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = StorageEnvironment::open(options(&dir)).unwrap();
        write_entries(&env, "users", 0..500);
        write_entries(&env, "users", 500..1000);
    }
    // A clean close flushes everything and leaves no journals behind
    assert!(journals(&dir).is_empty());

    let env = StorageEnvironment::open(options(&dir)).unwrap();
    assert_eq!(count_entries(&env, "users"), 1000);
    assert_eq!(env.stats().last_transaction_id, 2);

    let txn = env.read_transaction().unwrap();
    let tree = txn.read_tree("users").unwrap().unwrap();
    assert_eq!(
        tree.read(&txn, b"key/000777").unwrap().unwrap(),
        777u32.to_le_bytes().to_vec()
    );
}

#[test]
fn unflushed_commits_are_replayed_from_the_journal() {
    let dir = TempDir::new().unwrap();
    {
        let env = StorageEnvironment::open(options(&dir)).unwrap();
        write_entries(&env, "orders", 0..200);
        write_entries(&env, "orders", 200..300);
        assert_eq!(env.stats().last_flushed_transaction_id, 0);
        assert_eq!(journals(&dir).len(), 1);
        // Simulate a crash: nothing reaches the data file
        std::mem::forget(env);
    }

    let env = StorageEnvironment::open(options(&dir)).unwrap();
    assert_eq!(count_entries(&env, "orders"), 300);
    let stats = env.stats();
    assert_eq!(stats.last_transaction_id, 2);
    assert_eq!(stats.last_flushed_transaction_id, 2);
    assert!(journals(&dir).is_empty());

    // New commits continue after the replayed ones
    write_entries(&env, "orders", 300..310);
    assert_eq!(env.stats().last_transaction_id, 3);
    assert_eq!(count_entries(&env, "orders"), 310);
}

#[test]
fn torn_journal_tail_is_ignored() {
    let dir = TempDir::new().unwrap();
    {
        let env = StorageEnvironment::open(options(&dir)).unwrap();
        write_entries(&env, "t", 0..10);
        write_entries(&env, "t", 10..20);
        std::mem::forget(env);
    }
    let journal = dir.path().join(&journals(&dir)[0]);
    let bytes = fs::read(&journal).unwrap();
    // Keep the first record and half of the second one
    let first_record_end = {
        let stored = u64::from_le_bytes(bytes[88..96].try_into().unwrap()) as usize;
        let page = 4096;
        (128 + stored + page - 1) / page * page
    };
    fs::write(&journal, &bytes[..first_record_end + 200]).unwrap();

    let env = StorageEnvironment::open(options(&dir)).unwrap();
    assert_eq!(count_entries(&env, "t"), 10);
    assert_eq!(env.stats().last_transaction_id, 1);
}

#[test]
fn danger_mode_skips_the_journal() {
    let dir = TempDir::new().unwrap();
    let env = StorageEnvironment::open(
        options(&dir).with_transactions_mode(TransactionsMode::Danger),
    )
    .unwrap();
    write_entries(&env, "fast", 0..50);
    assert!(journals(&dir).is_empty());

    env.change_option(OptionChange::TransactionsMode(TransactionsMode::Safe))
        .unwrap();
    write_entries(&env, "fast", 50..60);
    assert_eq!(journals(&dir).len(), 1);
    drop(env);

    let env = StorageEnvironment::open(options(&dir)).unwrap();
    assert_eq!(count_entries(&env, "fast"), 60);
}

#[test]
fn free_space_is_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    let freed = {
        let env = StorageEnvironment::open(options(&dir)).unwrap();
        write_entries(&env, "keep", 0..100);
        write_entries(&env, "drop", 0..2000);
        let mut txn = env.write_transaction().unwrap();
        txn.delete_tree("drop").unwrap();
        txn.commit().unwrap();
        env.stats().free_pages
    };
    assert!(freed > 0);

    let env = StorageEnvironment::open(options(&dir)).unwrap();
    assert_eq!(env.stats().free_pages, freed);
    assert_eq!(count_entries(&env, "keep"), 100);
    assert_eq!(count_entries(&env, "drop"), 0);
}
