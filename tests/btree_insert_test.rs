use bptree::ErrorKind;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

mod common;

#[test]
fn test_insert_then_search() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 1024));

    for key in 1..=200u64 {
        tree.insert(key, key * 10).unwrap();
    }
    for key in 1..=200u64 {
        assert_eq!(tree.search(key).unwrap(), key * 10);
    }
    assert_eq!(tree.search(0).unwrap_err().kind(), ErrorKind::KeyDoesNotExist);
    assert_eq!(
        tree.search(201).unwrap_err().kind(),
        ErrorKind::KeyDoesNotExist
    );
    tree.check_integrity();
}

#[test]
fn test_duplicate_insert_is_rejected_and_harmless() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 1024));

    tree.insert(7, 70).unwrap();
    let err = tree.insert(7, 700).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyAlreadyExists);
    // the first value wins
    assert_eq!(tree.search(7).unwrap(), 70);
}

#[test]
fn test_empty_tree_lookups() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 16));

    assert_eq!(tree.search(1).unwrap_err().kind(), ErrorKind::KeyDoesNotExist);
    assert_eq!(tree.remove(1).unwrap_err().kind(), ErrorKind::KeyDoesNotExist);
    assert_eq!(tree.keys().unwrap(), Vec::<u64>::new());
}

#[test]
fn test_any_permutation_sorts() {
    common::setup();

    let mut rng = StdRng::seed_from_u64(0xb17e5);
    for round in 0..4 {
        let tree = common::new_tree(&common::volatile_config(3, 256));
        let mut keys: Vec<u64> = (0..300).collect();
        keys.shuffle(&mut rng);

        for key in &keys {
            tree.insert(*key, *key).unwrap();
        }

        let sorted: Vec<u64> = (0..300).collect();
        assert_eq!(tree.keys().unwrap(), sorted, "round {}", round);
        tree.check_integrity();
    }
}

#[test]
fn test_minimum_degree_splits_at_every_level() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(3, 512));

    for key in 1..=150u64 {
        tree.insert(key, key).unwrap();
        tree.check_integrity();
    }
    assert_eq!(tree.keys().unwrap().len(), 150);
}

#[test]
fn test_sequential_growth() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 4096));

    for key in 1..=2000u64 {
        tree.insert(key, key + 1).unwrap();
    }
    let keys = tree.keys().unwrap();
    assert_eq!(keys.len(), 2000);
    assert_eq!(keys.first(), Some(&1));
    assert_eq!(keys.last(), Some(&2000));
    tree.check_integrity();
}
