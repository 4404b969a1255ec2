use std::{sync::Once, time::Duration};

use bptree::{init_log, BPlusTree, TreeConfig};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(init_log);
}

/// A volatile-backed config with room for every test workload.
pub fn volatile_config(degree: u16, cache_capacity: u64) -> TreeConfig {
    TreeConfig::new(degree, cache_capacity, 512, 64 * 1024 * 1024)
}

pub fn new_tree(config: &TreeConfig) -> BPlusTree {
    let tree = BPlusTree::new(config).unwrap();
    tree.init().unwrap();
    tree
}

/// Spin (with a generous timeout) until a condition driven by the
/// background workers becomes true.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
