use std::{
    path::PathBuf,
    sync::{RwLock, RwLockWriteGuard},
};

use itertools::Itertools;
use log::{debug, info};

use super::node::{ChildSlot, NodeBody};
use crate::{
    cache::{
        manager::{AccessSet, ReadLatch, WriteLatch},
        uid::ObjectUid,
        CacheManager, CacheStats, PolicyKind,
    },
    error::{ErrorKind, StoreError},
    storage::{open_backend, StorageKind},
    types::{Key, StoreResult, Value},
    utils::HandyRwLock,
    wal::{FileWal, WalOp, WalRecord},
};

use super::node::DataNode;

/// Construction parameters. No environment, no config files.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Fan-out: nodes split above `2d - 1` keys and merge below
    /// `ceil(d / 2) - 1`.
    pub degree: u16,
    /// Soft bound on resident cache objects.
    pub cache_capacity: u64,
    /// Serialization block width.
    pub block_size: u16,
    /// Total backing-store budget in bytes.
    pub backing_bytes: u64,
    pub policy: PolicyKind,
    pub storage: StorageKind,
    pub wal_path: Option<PathBuf>,
}

impl TreeConfig {
    pub fn new(degree: u16, cache_capacity: u64, block_size: u16, backing_bytes: u64) -> TreeConfig {
        TreeConfig {
            degree,
            cache_capacity,
            block_size,
            backing_bytes,
            policy: PolicyKind::Lru,
            storage: StorageKind::Volatile,
            wal_path: None,
        }
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> TreeConfig {
        self.policy = policy;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> TreeConfig {
        self.storage = storage;
        self
    }

    pub fn with_wal<P: Into<PathBuf>>(mut self, path: P) -> TreeConfig {
        self.wal_path = Some(path.into());
        self
    }

    fn validate(&self) -> StoreResult {
        if self.degree < 2 {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                "degree must be at least 2",
            ));
        }
        let max_keys = 2 * self.degree as usize - 1;
        // kind byte + count + payload, for the wider of the two layouts
        let data_image = 3 + max_keys * 16;
        let index_image = 3 + max_keys * 8 + (max_keys + 1) * 8;
        let needed = data_image.max(index_image);
        if needed > self.block_size as usize {
            return Err(StoreError::new(
                ErrorKind::Serialization,
                &format!(
                    "a full degree-{} node needs {} bytes but the block is {}",
                    self.degree, needed, self.block_size
                ),
            ));
        }
        Ok(())
    }
}

/// The externally visible index: a degree, a root slot, the cache the
/// nodes live in, and the write-ahead log.
pub struct BPlusTree {
    degree: u16,
    pub(crate) cache: CacheManager,
    wal: Option<FileWal>,
    /// The root reference, shaped exactly like an index node's child slot.
    /// Grows and shrinks of the tree take this lock exclusively.
    pub(crate) root: RwLock<ChildSlot>,
    /// Mutations hold this shared; a full flush holds it exclusively so
    /// the log is never truncated under an op that has appended its
    /// record but not yet applied it.
    op_gate: RwLock<()>,
}

impl BPlusTree {
    pub fn new(config: &TreeConfig) -> Result<BPlusTree, StoreError> {
        config.validate()?;
        let storage = open_backend(&config.storage, config.block_size, config.backing_bytes)?;
        let cache = CacheManager::new(
            config.cache_capacity,
            config.block_size,
            config.policy,
            storage,
        )?;
        let wal = match &config.wal_path {
            Some(path) => Some(FileWal::open(path)?),
            None => None,
        };
        info!(
            "tree created: degree {}, cache capacity {}, policy {:?}",
            config.degree, config.cache_capacity, config.policy
        );
        Ok(BPlusTree {
            degree: config.degree,
            cache,
            wal,
            root: RwLock::new(ChildSlot::unresolved(ObjectUid::NIL)),
            op_gate: RwLock::new(()),
        })
    }

    /// Construct the empty root data node. A no-op if the tree already has
    /// a root.
    pub fn init(&self) -> StoreResult {
        let mut root = self.root.wl();
        if !root.uid.is_nil() || root.ptr.is_some() {
            return Ok(());
        }
        let (uid, obj) = self.cache.allocate(NodeBody::Data(DataNode::new()));
        root.uid = uid;
        root.ptr = Some(obj);
        Ok(())
    }

    /// Reopen a previously flushed tree from its backing store, then
    /// replay the log. A fresh store just gets an empty root.
    pub fn open(config: &TreeConfig) -> Result<BPlusTree, StoreError> {
        let tree = BPlusTree::new(config)?;

        let header = tree.cache.read_root_header()?;
        match header {
            Some(root_uid) if !root_uid.is_nil() => {
                let mut root = tree.root.wl();
                root.uid = root_uid;
                root.ptr = None;
                drop(root);
                info!("tree reopened with root {:?}", root_uid);
            }
            _ => tree.init()?,
        }

        tree.replay_wal()?;
        Ok(tree)
    }

    fn replay_wal(&self) -> StoreResult {
        let records = match &self.wal {
            Some(wal) => wal.replay()?,
            None => return Ok(()),
        };
        let count = records.len();
        for record in records {
            match self.replay(&record) {
                Ok(()) => {}
                // replay observes the same local outcomes the live ops did
                Err(e)
                    if e.kind() == ErrorKind::KeyAlreadyExists
                        || e.kind() == ErrorKind::KeyDoesNotExist => {}
                Err(e) => return Err(e),
            }
        }
        if count > 0 {
            info!("replayed {} wal records", count);
        }
        Ok(())
    }

    /// Apply one logged op without re-logging it.
    pub fn replay(&self, record: &WalRecord) -> StoreResult {
        match record.op {
            WalOp::Insert => {
                let value = record
                    .value
                    .ok_or_else(|| StoreError::internal("insert record without a value"))?;
                self.insert_unlogged(record.key, value)
            }
            WalOp::Remove => self.remove_unlogged(record.key),
        }
    }

    pub fn insert(&self, key: Key, value: Value) -> StoreResult {
        let _gate = self.op_gate.rl();
        if let Some(wal) = &self.wal {
            wal.append(&WalRecord::insert(key, value))?;
        }
        self.insert_unlogged(key, value)
    }

    pub fn remove(&self, key: Key) -> StoreResult {
        let _gate = self.op_gate.rl();
        if let Some(wal) = &self.wal {
            wal.append(&WalRecord::remove(key))?;
        }
        self.remove_unlogged(key)
    }

    /// Point lookup. Read latches only, released hand-over-hand on the way
    /// down.
    pub fn search(&self, key: Key) -> Result<Value, StoreError> {
        let mut access = AccessSet::new(&self.cache);

        let root_guard = self.root.rl();
        if root_guard.uid.is_nil() && root_guard.ptr.is_none() {
            return Err(StoreError::new(
                ErrorKind::KeyDoesNotExist,
                "tree is empty",
            ));
        }
        let mut cur = self.cache.pin_child_for_read(&root_guard, &mut access)?;
        drop(root_guard);

        loop {
            let next = match cur.body() {
                NodeBody::Index(node) => {
                    let slot = node.child(node.child_index(key));
                    self.cache.pin_child_for_read(slot, &mut access)?
                }
                NodeBody::Data(node) => {
                    return node.search(key).ok_or_else(|| {
                        StoreError::new(
                            ErrorKind::KeyDoesNotExist,
                            &format!("key {} is not present", key),
                        )
                    });
                }
            };
            // hand over hand: the parent latch drops here
            cur = next;
        }
    }

    /// Force every dirty node to storage, record the root in the backend
    /// header, and let the log go.
    pub fn flush(&self) -> StoreResult {
        let _gate = self.op_gate.wl();
        let _serialize = self.cache.flush_guard();
        let mut access = AccessSet::new(&self.cache);

        let mut root_guard = self.root.wl();
        if root_guard.uid.is_nil() && root_guard.ptr.is_none() {
            return Ok(());
        }

        let (mut latch, _) = self.cache.pin_child_for_write(&mut root_guard, &mut access)?;
        self.flush_subtree(&mut latch, &mut access)?;

        // the root's own rename lands in the root slot
        if let Some(new_uid) = latch.obj.uid_updated() {
            latch.obj.set_uid(new_uid);
            latch.obj.clear_uid_updated();
            self.cache.rekey(root_guard.uid, new_uid, &latch.obj);
            root_guard.uid = new_uid;
        }
        drop(latch);

        self.cache.flush_residual()?;
        self.cache.write_root_header(root_guard.uid)?;
        debug!("flush complete, root at {:?}", root_guard.uid);
        drop(root_guard);

        if let Some(wal) = &self.wal {
            wal.truncate()?;
        }
        Ok(())
    }

    /// Post-order write-back: children first so a parent always serializes
    /// their final UIDs.
    fn flush_subtree(&self, latch: &mut WriteLatch, access: &mut AccessSet) -> StoreResult {
        let child_count = match latch.guard.as_ref() {
            Some(NodeBody::Index(node)) => node.child_count(),
            _ => 0,
        };

        for idx in 0..child_count {
            let resident = {
                match latch.guard.as_ref() {
                    Some(NodeBody::Index(node)) => match &node.child(idx).ptr {
                        Some(ptr) => ptr.has_core(),
                        None => false,
                    },
                    _ => false,
                }
            };
            if !resident {
                // nothing to write below: an evicted child is clean by
                // construction, and its pending rename is absorbed when
                // this node serializes
                continue;
            }

            let (mut child, parent_dirtied) = {
                let node = latch
                    .guard
                    .as_mut()
                    .and_then(|body| body.as_index_mut())
                    .ok_or_else(|| StoreError::internal("index node vanished during flush"))?;
                self.cache.pin_child_for_write(node.child_mut(idx), access)?
            };
            if parent_dirtied {
                latch.obj.set_dirty(true);
            }
            self.flush_subtree(&mut child, access)?;
        }

        self.cache.flush_object(&latch.obj, &mut latch.guard)?;
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Resident cache objects right now (the soft capacity bound applies
    /// to this number).
    pub fn resident_nodes(&self) -> u64 {
        self.cache.resident()
    }

    /// Resident wrappers still carrying unwritten changes; zero right
    /// after a flush.
    pub fn dirty_nodes(&self) -> u64 {
        self.cache.dirty_nodes()
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub(crate) fn max_keys(&self) -> usize {
        2 * self.degree as usize - 1
    }

    pub(crate) fn min_keys(&self) -> usize {
        (self.degree as usize + 1) / 2 - 1
    }

    /// In-order key traversal (test and debugging surface; the index has
    /// no range-scan operation).
    pub fn keys(&self) -> Result<Vec<Key>, StoreError> {
        let mut access = AccessSet::new(&self.cache);
        let root_guard = self.root.rl();
        if root_guard.uid.is_nil() && root_guard.ptr.is_none() {
            return Ok(Vec::new());
        }
        let root = self.cache.pin_child_for_read(&root_guard, &mut access)?;
        drop(root_guard);

        let mut out = Vec::new();
        self.collect_keys(&root, &mut access, &mut out)?;
        Ok(out)
    }

    fn collect_keys(
        &self,
        latch: &ReadLatch,
        access: &mut AccessSet,
        out: &mut Vec<Key>,
    ) -> StoreResult {
        match latch.body() {
            NodeBody::Data(node) => {
                out.extend(node.keys());
            }
            NodeBody::Index(node) => {
                for slot in node.children() {
                    let child = self.cache.pin_child_for_read(slot, access)?;
                    self.collect_keys(&child, access, out)?;
                }
            }
        }
        Ok(())
    }

    /// Walk the whole tree and assert the structural invariants. Panics on
    /// a violation; meant for tests and debugging.
    pub fn check_integrity(&self) {
        let mut access = AccessSet::new(&self.cache);
        let root_guard = self.root.rl();
        if root_guard.uid.is_nil() && root_guard.ptr.is_none() {
            return;
        }
        let root = self
            .cache
            .pin_child_for_read(&root_guard, &mut access)
            .expect("root must be loadable");
        drop(root_guard);

        self.check_node(&root, &mut access, None, None, true);
    }

    fn check_node(
        &self,
        latch: &ReadLatch,
        access: &mut AccessSet,
        lower: Option<Key>,
        upper: Option<Key>,
        is_root: bool,
    ) {
        let in_bounds = |key: Key| {
            lower.map_or(true, |l| l <= key) && upper.map_or(true, |u| key < u)
        };

        match latch.body() {
            NodeBody::Data(node) => {
                if !is_root {
                    assert!(
                        node.len() >= self.min_keys() && node.len() <= self.max_keys(),
                        "data node occupancy {} outside [{}, {}]",
                        node.len(),
                        self.min_keys(),
                        self.max_keys()
                    );
                }
                assert!(
                    node.keys().tuple_windows().all(|(a, b)| a < b),
                    "data node keys out of order"
                );
                for key in node.keys() {
                    assert!(in_bounds(key), "key {} escapes its pivot bounds", key);
                }
            }
            NodeBody::Index(node) => {
                assert_eq!(
                    node.child_count(),
                    node.pivot_count() + 1,
                    "index node child count mismatch"
                );
                if is_root {
                    assert!(node.pivot_count() >= 1, "root index node with no pivots");
                } else {
                    assert!(
                        node.pivot_count() >= self.min_keys()
                            && node.pivot_count() <= self.max_keys(),
                        "index node occupancy {} outside [{}, {}]",
                        node.pivot_count(),
                        self.min_keys(),
                        self.max_keys()
                    );
                }
                assert!(
                    node.pivots().iter().tuple_windows().all(|(a, b)| a < b),
                    "pivots out of order"
                );
                for pivot in node.pivots() {
                    assert!(in_bounds(*pivot), "pivot {} escapes its bounds", pivot);
                }

                for idx in 0..node.child_count() {
                    let child_lower = if idx == 0 {
                        lower
                    } else {
                        Some(node.pivot(idx - 1))
                    };
                    let child_upper = if idx == node.pivot_count() {
                        upper
                    } else {
                        Some(node.pivot(idx))
                    };
                    let child = self
                        .cache
                        .pin_child_for_read(node.child(idx), access)
                        .expect("child must be loadable");
                    self.check_node(&child, access, child_lower, child_upper, false);
                }
            }
        }
    }

    /// The descent prologue shared by insert and remove: latch the root
    /// slot and pin the root node for writing.
    pub(crate) fn latch_root_for_write<'t>(
        &'t self,
        access: &mut AccessSet,
    ) -> Result<(RwLockWriteGuard<'t, ChildSlot>, WriteLatch), StoreError> {
        let mut root_guard = self.root.wl();
        if root_guard.uid.is_nil() && root_guard.ptr.is_none() {
            return Err(StoreError::internal("tree is not initialized"));
        }
        let (latch, _) = self.cache.pin_child_for_write(&mut root_guard, access)?;
        Ok((root_guard, latch))
    }
}
