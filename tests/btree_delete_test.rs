use bptree::{ErrorKind, PolicyKind};

mod common;

#[test]
fn test_insert_remove_search() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 256));

    tree.insert(42, 420).unwrap();
    tree.remove(42).unwrap();
    assert_eq!(tree.search(42).unwrap_err().kind(), ErrorKind::KeyDoesNotExist);

    // the key is insertable again after the remove
    tree.insert(42, 421).unwrap();
    assert_eq!(tree.search(42).unwrap(), 421);
}

#[test]
fn test_remove_missing_key() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 256));

    tree.insert(1, 1).unwrap();
    let err = tree.remove(2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyDoesNotExist);
    assert_eq!(tree.search(1).unwrap(), 1);
}

// S2: a small degree-3 tree under CLOCK, mixed inserts and removes.
#[test]
fn test_small_mixed_workload_stays_ordered() {
    common::setup();
    let config = common::volatile_config(3, 4).with_policy(PolicyKind::Clock);
    let tree = common::new_tree(&config);

    for key in [50u64, 20, 80, 10, 30, 70, 90, 5, 15, 25].iter() {
        tree.insert(*key, *key).unwrap();
    }
    for key in [20u64, 50, 80].iter() {
        tree.remove(*key).unwrap();
    }

    assert_eq!(tree.keys().unwrap(), vec![5, 10, 15, 25, 30, 70, 90]);
    tree.check_integrity();
}

#[test]
fn test_remove_everything_leaves_an_empty_root() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 256));

    for key in 1..=100u64 {
        tree.insert(key, key).unwrap();
    }
    for key in 1..=100u64 {
        tree.remove(key).unwrap();
    }

    assert_eq!(tree.keys().unwrap(), Vec::<u64>::new());
    assert_eq!(tree.search(50).unwrap_err().kind(), ErrorKind::KeyDoesNotExist);

    // the tree is usable again from the empty root
    tree.insert(3, 30).unwrap();
    assert_eq!(tree.search(3).unwrap(), 30);
    tree.check_integrity();
}

// S4: shrink a thousand-key tree back to a single entry with an unbounded
// cache.
#[test]
fn test_shrink_to_a_single_entry() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(8, u64::MAX));

    for key in 1..=1000u64 {
        tree.insert(key, key).unwrap();
    }
    for key in 1..=999u64 {
        tree.remove(key).unwrap();
    }

    assert_eq!(tree.keys().unwrap(), vec![1000]);
    assert_eq!(tree.search(1000).unwrap(), 1000);
    tree.check_integrity();
}

#[test]
fn test_minimum_degree_merges_at_every_level() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(3, 512));

    for key in 1..=120u64 {
        tree.insert(key, key).unwrap();
    }
    // delete from both ends to exercise left and right merges
    for i in 0..60u64 {
        tree.remove(1 + i).unwrap();
        tree.check_integrity();
        tree.remove(120 - i).unwrap();
        tree.check_integrity();
    }
    assert_eq!(tree.keys().unwrap(), Vec::<u64>::new());
}
