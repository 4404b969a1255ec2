use bptree::{BPlusTree, StorageKind, TreeConfig};

mod common;

fn file_config(dir: &std::path::Path) -> TreeConfig {
    TreeConfig::new(4, 8, 512, 4 * 1024 * 1024)
        .with_storage(StorageKind::File(dir.join("tree.db")))
        .with_wal(dir.join("tree.wal"))
}

// S6: drop a never-flushed tree and rebuild it purely from the log.
#[test]
fn test_replay_rebuilds_an_unflushed_tree() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    {
        let tree = common::new_tree(&config);
        for key in 1..=64u64 {
            tree.insert(key, key).unwrap();
        }
        // no flush: everything the next incarnation sees comes from the wal
    }

    let tree = BPlusTree::open(&config).unwrap();
    for key in 1..=64u64 {
        assert_eq!(tree.search(key).unwrap(), key, "key {} lost", key);
    }
    tree.check_integrity();
}

// A flush truncates the log; replay only covers what came after.
#[test]
fn test_reopen_combines_header_and_log() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    {
        let tree = common::new_tree(&config);
        for key in 1..=20u64 {
            tree.insert(key, key * 5).unwrap();
        }
        tree.flush().unwrap();

        for key in 21..=30u64 {
            tree.insert(key, key * 5).unwrap();
        }
        tree.remove(1).unwrap();
        // again no flush: the tail lives only in the wal
    }

    let tree = BPlusTree::open(&config).unwrap();
    assert!(tree.search(1).is_err());
    for key in 2..=30u64 {
        assert_eq!(tree.search(key).unwrap(), key * 5);
    }
    tree.check_integrity();
}

// Replay tolerates records whose effect is already present.
#[test]
fn test_replay_is_tolerant_of_local_errors() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    {
        let tree = common::new_tree(&config);
        tree.insert(1, 10).unwrap();
        tree.remove(1).unwrap();
        tree.insert(1, 11).unwrap();
        tree.insert(2, 20).unwrap();
        let _ = tree.remove(99); // logged even though it fails
    }

    let tree = BPlusTree::open(&config).unwrap();
    assert_eq!(tree.search(1).unwrap(), 11);
    assert_eq!(tree.search(2).unwrap(), 20);

    // reopening twice replays an already-replayed log just as quietly
    drop(tree);
    let tree = BPlusTree::open(&config).unwrap();
    assert_eq!(tree.search(1).unwrap(), 11);
    assert_eq!(tree.search(2).unwrap(), 20);
}
