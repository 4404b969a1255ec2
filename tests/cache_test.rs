use bptree::{PolicyKind, StorageKind, TreeConfig};

mod common;

// S1: sequential inserts under a small LRU cache must spill dirty pages,
// and a flush makes everything durable and clean.
#[test]
fn test_lru_spills_dirty_pages() {
    common::setup();
    let config = common::volatile_config(4, 16).with_policy(PolicyKind::Lru);
    let tree = common::new_tree(&config);

    for key in 1..=100u64 {
        tree.insert(key, key).unwrap();
    }

    // eviction is asynchronous; give the worker a moment
    assert!(
        common::wait_until(|| tree.cache_stats().dirty_evictions >= 1),
        "no dirty eviction happened under cache pressure: {:?}",
        tree.cache_stats()
    );

    tree.flush().unwrap();
    for key in 1..=100u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
    assert!(tree.cache_stats().dirty_evictions >= 1);
}

#[test]
fn test_flush_makes_everything_clean_and_is_idempotent() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let config = TreeConfig::new(4, 32, 512, 4 * 1024 * 1024)
        .with_storage(StorageKind::File(dir.path().join("tree.db")));
    let tree = common::new_tree(&config);

    for key in 1..=300u64 {
        tree.insert(key, key).unwrap();
    }
    tree.flush().unwrap();
    assert_eq!(tree.dirty_nodes(), 0);

    // a second flush has nothing to write: the stored image is unchanged
    let before = std::fs::read(dir.path().join("tree.db")).unwrap();
    tree.flush().unwrap();
    let after = std::fs::read(dir.path().join("tree.db")).unwrap();
    assert_eq!(before, after);

    for key in 1..=300u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
}

// Boundary: a one-object cache still serves everything, it just thrashes.
#[test]
fn test_capacity_of_one_still_works() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(3, 1));

    for key in 1..=50u64 {
        tree.insert(key, key * 2).unwrap();
    }
    for key in 1..=50u64 {
        assert_eq!(tree.search(key).unwrap(), key * 2);
    }
    tree.check_integrity();

    // the resident set converges back to the bound once the workers catch up
    assert!(
        common::wait_until(|| tree.resident_nodes() <= 1),
        "cache failed to drain to capacity, resident: {}",
        tree.resident_nodes()
    );
}

// S3: a tiny 2Q cache over a large key space; re-scanning the same keys
// must hit much better than the cold scan.
#[test]
fn test_two_q_rescan_improves_hit_rate() {
    common::setup();
    let config = common::volatile_config(4, 2).with_policy(PolicyKind::TwoQ);
    let tree = common::new_tree(&config);

    for key in 1..=10_000u64 {
        tree.insert(key, key).unwrap();
    }

    for key in 1..=10_000u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
    let cold = tree.cache_stats();
    assert!(cold.misses > 0, "a two-object cache cannot avoid misses");
    assert!(cold.evictions > 0);

    for key in 1..=10_000u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
    let warm = tree.cache_stats();

    // consecutive keys share their path, so the warm scan is hit-dominated
    let warm_hits = warm.hits - cold.hits;
    let warm_misses = warm.misses - cold.misses;
    assert!(
        warm_hits > warm_misses,
        "re-scan did not hit: {} hits vs {} misses",
        warm_hits,
        warm_misses
    );
}

#[test]
fn test_clock_policy_serves_a_working_set() {
    common::setup();
    let config = common::volatile_config(4, 8).with_policy(PolicyKind::Clock);
    let tree = common::new_tree(&config);

    for key in 1..=400u64 {
        tree.insert(key, key).unwrap();
    }
    for key in 1..=400u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
    tree.check_integrity();
    assert!(common::wait_until(|| tree.cache_stats().evictions > 0));
}

#[test]
fn test_pmem_backend_round_trip() {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let config = TreeConfig::new(4, 8, 512, 4 * 1024 * 1024)
        .with_storage(StorageKind::Pmem(dir.path().join("tree.pmem")));
    let tree = common::new_tree(&config);

    for key in 1..=200u64 {
        tree.insert(key, key + 7).unwrap();
    }
    tree.flush().unwrap();
    for key in 1..=200u64 {
        assert_eq!(tree.search(key).unwrap(), key + 7);
    }
}

#[test]
fn test_stats_observe_misses_after_flush_and_drain() {
    common::setup();
    let tree = common::new_tree(&common::volatile_config(4, 4));

    for key in 1..=200u64 {
        tree.insert(key, key).unwrap();
    }
    tree.flush().unwrap();
    common::wait_until(|| tree.resident_nodes() <= 4);

    let before = tree.cache_stats();
    for key in 1..=200u64 {
        assert_eq!(tree.search(key).unwrap(), key);
    }
    let after = tree.cache_stats();
    assert!(after.misses > before.misses, "a drained cache must miss");
}
