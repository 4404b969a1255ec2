use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info};
use parking_lot::{lock_api::ArcRwLockWriteGuard, Condvar, Mutex};

use super::{
    object::{CacheObject, CoreReadGuard, CoreWriteGuard},
    policy::{build_policy, PolicyKind, ReplacementPolicy},
    reorder::{ReorderRing, RingRegistry},
    stats::{self, CacheStats, SharedStats, StatEvent},
    uid::ObjectUid,
};
use crate::{
    btree::node::{ChildSlot, NodeBody},
    error::{ErrorKind, StoreError},
    storage::{StorageBackend, WriteHint},
    types::StoreResult,
};

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static LOCAL_RINGS: RefCell<HashMap<usize, Arc<ReorderRing>>> = RefCell::new(HashMap::new());
}

struct CacheInner {
    map: HashMap<ObjectUid, Arc<CacheObject>>,
    policy: Box<dyn ReplacementPolicy>,
}

/// State shared between the mutator-facing API and the two background
/// workers.
pub struct CacheShared {
    id: usize,
    capacity: u64,
    block_size: usize,
    used: AtomicU64,
    storage: Box<dyn StorageBackend>,
    /// The list lock: guards the uid map and the policy structure. Taken
    /// per list mutation, never per access.
    inner: Mutex<CacheInner>,
    /// Serializes the two write-back paths (eviction passes and full
    /// flushes) against each other.
    flush_lock: Mutex<()>,
    rings: RingRegistry,
    shared_stats: Arc<SharedStats>,
    stop: AtomicBool,
    wake_lock: Mutex<bool>,
    wake: Condvar,
}

/// A pinned, write-latched node. Holding one keeps the wrapper resident
/// and its body exclusively ours.
pub(crate) struct WriteLatch {
    pub obj: Arc<CacheObject>,
    pub guard: CoreWriteGuard,
}

impl WriteLatch {
    pub(crate) fn body(&self) -> &NodeBody {
        self.guard.as_ref().expect("latched wrapper lost its core")
    }

    pub(crate) fn body_mut(&mut self) -> &mut NodeBody {
        self.guard.as_mut().expect("latched wrapper lost its core")
    }
}

pub(crate) struct ReadLatch {
    pub obj: Arc<CacheObject>,
    pub guard: CoreReadGuard,
}

impl ReadLatch {
    pub(crate) fn body(&self) -> &NodeBody {
        self.guard.as_ref().expect("latched wrapper lost its core")
    }
}

/// Every wrapper an operation pinned, in arrival order. On drop the set is
/// pushed into the calling thread's reorder ring and the pins are
/// released, on every control-flow exit including errors.
pub(crate) struct AccessSet<'a> {
    cache: &'a CacheShared,
    objs: Vec<Arc<CacheObject>>,
}

impl<'a> AccessSet<'a> {
    pub(crate) fn new(cache: &'a CacheShared) -> AccessSet<'a> {
        AccessSet {
            cache,
            objs: Vec::with_capacity(8),
        }
    }

    pub(crate) fn track(&mut self, obj: &Arc<CacheObject>) {
        obj.pin();
        self.objs.push(obj.clone());
    }
}

impl<'a> Drop for AccessSet<'a> {
    fn drop(&mut self) {
        if !self.objs.is_empty() {
            self.cache.submit_accessed(&self.objs);
        }
        for obj in &self.objs {
            obj.unpin();
        }
    }
}

impl CacheShared {
    fn record(&self, event: StatEvent) {
        stats::record(self.id, &self.shared_stats, event);
    }

    fn note_pressure(&self) {
        if self.used.load(Ordering::Acquire) > self.capacity {
            let mut pending = self.wake_lock.lock();
            *pending = true;
            self.wake.notify_one();
        }
    }

    /// Resident node bodies right now.
    pub fn resident(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        stats::flush_current_thread(self.id);
        self.shared_stats.snapshot()
    }

    /// Resident wrappers whose contents differ from their stored block.
    pub fn dirty_nodes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.map.values().filter(|obj| obj.is_dirty()).count() as u64
    }

    fn local_ring(&self) -> Option<Arc<ReorderRing>> {
        LOCAL_RINGS
            .try_with(|rings| {
                rings
                    .borrow_mut()
                    .entry(self.id)
                    .or_insert_with(|| self.rings.register())
                    .clone()
            })
            .ok()
    }

    fn submit_accessed(&self, objs: &[Arc<CacheObject>]) {
        if let Some(ring) = self.local_ring() {
            for obj in objs {
                ring.push(obj.clone());
            }
        }
    }

    /// Construct a wrapper for a brand-new node and link it at the hottest
    /// position.
    pub(crate) fn allocate(&self, body: NodeBody) -> (ObjectUid, Arc<CacheObject>) {
        let uid = ObjectUid::for_new(body.kind());
        let obj = CacheObject::new_allocated(uid, body);
        {
            let mut inner = self.inner.lock();
            inner.map.insert(uid, obj.clone());
            inner.policy.admit_hot(&obj);
        }
        self.used.fetch_add(1, Ordering::AcqRel);
        self.note_pressure();
        debug!("allocated {:?}", uid);
        (uid, obj)
    }

    /// Find a resident wrapper by UID, or fetch and admit its block. The
    /// flag is true when the backend was hit.
    fn lookup_or_admit(&self, uid: ObjectUid) -> Result<(Arc<CacheObject>, bool), StoreError> {
        {
            let inner = self.inner.lock();
            if let Some(obj) = inner.map.get(&uid) {
                self.record(StatEvent::Hit);
                return Ok((obj.clone(), false));
            }
        }

        self.record(StatEvent::Miss);
        let bytes = self.storage.get(uid)?;
        let kind = uid
            .kind()
            .ok_or_else(|| StoreError::internal(&format!("uid without a kind: {:?}", uid)))?;
        let body = NodeBody::decode_block(&bytes, kind)?;
        let obj = CacheObject::from_storage(uid, body);

        {
            let mut inner = self.inner.lock();
            // two readers can race to load the same block; the first one in
            // wins and the duplicate wrapper is dropped
            if let Some(existing) = inner.map.get(&uid) {
                return Ok((existing.clone(), true));
            }
            inner.map.insert(uid, obj.clone());
            inner.policy.admit(&obj);
        }
        self.used.fetch_add(1, Ordering::AcqRel);
        self.note_pressure();
        Ok((obj, true))
    }

    /// Reload an evicted wrapper's body from storage under its write lock
    /// and re-admit it to the policy.
    fn materialize(&self, obj: &Arc<CacheObject>, guard: &mut CoreWriteGuard) -> StoreResult {
        let uid = obj.uid();
        let bytes = self.storage.get(uid)?;
        let kind = uid
            .kind()
            .ok_or_else(|| StoreError::internal(&format!("uid without a kind: {:?}", uid)))?;
        **guard = Some(NodeBody::decode_block(&bytes, kind)?);

        {
            let mut inner = self.inner.lock();
            inner.map.insert(uid, obj.clone());
            if !obj.tag.linked() {
                inner.policy.admit(obj);
            }
        }
        self.used.fetch_add(1, Ordering::AcqRel);
        self.note_pressure();
        debug!("re-materialized {:?}", uid);
        Ok(())
    }

    /// Resolve a child slot for writing: pin, write-latch, and make the
    /// body resident. Returns the latch and whether the slot's UID was
    /// rewritten in place (in which case the owner of the slot is now
    /// dirty).
    pub(crate) fn pin_child_for_write(
        &self,
        slot: &mut ChildSlot,
        access: &mut AccessSet,
    ) -> Result<(WriteLatch, bool), StoreError> {
        let mut parent_dirtied = false;

        let (obj, counted) = match &slot.ptr {
            Some(ptr) => (ptr.clone(), false),
            None => {
                let (obj, _was_miss) = self.lookup_or_admit(slot.uid)?;
                slot.ptr = Some(obj.clone());
                (obj, true)
            }
        };
        access.track(&obj);

        let mut guard = obj.write_core();
        if guard.is_none() {
            // evicted wrapper: absorb the rename its last flush minted, then
            // pull the block back in
            if let Some(new_uid) = obj.uid_updated() {
                slot.uid = new_uid;
                obj.set_uid(new_uid);
                obj.clear_uid_updated();
                parent_dirtied = true;
            }
            if !counted {
                self.record(StatEvent::Miss);
            }
            self.materialize(&obj, &mut guard)?;
        } else if !counted {
            self.record(StatEvent::Hit);
        }

        Ok((WriteLatch { obj, guard }, parent_dirtied))
    }

    /// Resolve a child slot for reading. The slot is not mutated (readers
    /// hold the owning node's latch shared); a pending rename is followed
    /// but left in place for the next write traversal to absorb.
    pub(crate) fn pin_child_for_read(
        &self,
        slot: &ChildSlot,
        access: &mut AccessSet,
    ) -> Result<ReadLatch, StoreError> {
        let (obj, counted) = match &slot.ptr {
            Some(ptr) => (ptr.clone(), false),
            None => {
                let (obj, _was_miss) = self.lookup_or_admit(slot.uid)?;
                (obj, true)
            }
        };
        access.track(&obj);

        let guard = obj.read_core();
        let guard = if guard.is_some() {
            if !counted {
                self.record(StatEvent::Hit);
            }
            guard
        } else {
            drop(guard);
            let mut wguard = obj.write_core();
            if wguard.is_none() {
                if let Some(new_uid) = obj.uid_updated() {
                    obj.set_uid(new_uid);
                }
                if !counted {
                    self.record(StatEvent::Miss);
                }
                self.materialize(&obj, &mut wguard)?;
            } else if !counted {
                // someone else re-materialized between our two lock attempts
                self.record(StatEvent::Hit);
            }
            ArcRwLockWriteGuard::downgrade(wguard)
        };

        Ok(ReadLatch { obj, guard })
    }

    /// Write a latched node back if its contents or any child UID are
    /// stale. Returns whether storage was written.
    pub(crate) fn flush_object(
        &self,
        obj: &Arc<CacheObject>,
        guard: &mut CoreWriteGuard,
    ) -> Result<bool, StoreError> {
        let stale_children = match guard.as_ref() {
            Some(NodeBody::Index(node)) => node.has_renamed_children(),
            Some(NodeBody::Data(_)) => false,
            None => return Ok(false),
        };
        if !obj.is_dirty() && !stale_children {
            return Ok(false);
        }

        let body = guard.as_mut().expect("checked above");
        let bytes = body.encode_block(self.block_size)?;
        let hint = if obj.uid().persisted() {
            WriteHint::Overwrite(obj.uid())
        } else {
            WriteHint::Fresh
        };
        let new_uid = self.storage.put(obj.kind(), &bytes, hint)?;
        if new_uid != obj.uid() {
            debug!("flush renamed {:?} -> {:?}", obj.uid(), new_uid);
            obj.set_uid_updated(new_uid);
        }

        self.absorb_child_renames(body);
        obj.set_dirty(false);
        Ok(true)
    }

    /// After a successful write of a parent block, the child renames it
    /// emitted become the children's official identities.
    fn absorb_child_renames(&self, body: &mut NodeBody) {
        let node = match body {
            NodeBody::Index(node) => node,
            NodeBody::Data(_) => return,
        };

        let mut renames = Vec::new();
        for idx in 0..node.child_count() {
            let slot = node.child_mut(idx);
            let ptr = match &slot.ptr {
                Some(ptr) => ptr.clone(),
                None => continue,
            };
            if let Some(new_uid) = ptr.uid_updated() {
                let old_uid = ptr.uid();
                slot.uid = new_uid;
                ptr.set_uid(new_uid);
                ptr.clear_uid_updated();
                renames.push((old_uid, new_uid, ptr));
            }
        }

        if !renames.is_empty() {
            let mut inner = self.inner.lock();
            for (old_uid, new_uid, ptr) in renames {
                if inner.map.remove(&old_uid).is_some() {
                    inner.map.insert(new_uid, ptr);
                }
            }
        }
    }

    /// Drop a merged-away or collapsed node for good: its block is freed
    /// and the wrapper is unlinked everywhere. The wrapper itself lives on
    /// until the last parent pointer is gone. Returns the body that was
    /// taken out (merges absorb it).
    pub(crate) fn discard(
        &self,
        obj: &Arc<CacheObject>,
        guard: &mut CoreWriteGuard,
    ) -> Option<NodeBody> {
        obj.set_mark_delete();
        {
            let mut inner = self.inner.lock();
            inner.map.remove(&obj.uid());
            inner.policy.unlink(obj);
        }

        if let Some(uid) = obj.uid_updated() {
            if uid.persisted() {
                if let Err(e) = self.storage.remove(uid) {
                    error!("failed to free block {:?}: {}", uid, e);
                }
            }
            obj.clear_uid_updated();
        }
        let uid = obj.uid();
        if uid.persisted() {
            if let Err(e) = self.storage.remove(uid) {
                error!("failed to free block {:?}: {}", uid, e);
            }
        }

        obj.set_dirty(false);
        let body = guard.take();
        if body.is_some() {
            self.used.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("discarded {:?}", uid);
        body
    }

    /// One eviction sweep: claim up to `used - capacity` unpinned victims
    /// under the list lock, then write and drop them outside it. Returns
    /// how many wrappers were evicted.
    fn evict_pass(&self) -> usize {
        let _flush = self.flush_lock.lock();

        let used = self.used.load(Ordering::Acquire);
        if used <= self.capacity {
            return 0;
        }
        let over = (used - self.capacity) as usize;

        let mut victims: Vec<(Arc<CacheObject>, CoreWriteGuard)> = Vec::with_capacity(over);
        {
            let mut inner = self.inner.lock();
            let CacheInner { map, policy } = &mut *inner;
            for _ in 0..over {
                let mut claimed: Option<CoreWriteGuard> = None;
                let victim = policy.select_victim(&mut |obj| {
                    if obj.pins() != 0 {
                        return false;
                    }
                    let guard = match obj.try_write_core() {
                        Some(guard) => guard,
                        None => return false,
                    };
                    if obj.pins() != 0 {
                        return false;
                    }
                    match guard.as_ref() {
                        // a block referencing an in-cache child could never
                        // be resolved again; keep the parent until the
                        // children have been persisted
                        Some(NodeBody::Index(node)) => {
                            if node.has_unpersisted_children() {
                                return false;
                            }
                        }
                        Some(NodeBody::Data(_)) => {}
                        None => return false,
                    }
                    claimed = Some(guard);
                    true
                });
                match victim {
                    Some(obj) => {
                        map.remove(&obj.uid());
                        victims.push((obj, claimed.take().expect("claimed victim")));
                    }
                    None => break,
                }
            }
        }

        let mut evicted = 0;
        for (obj, mut guard) in victims {
            match self.flush_object(&obj, &mut guard) {
                Ok(wrote) => {
                    *guard = None;
                    self.used.fetch_sub(1, Ordering::AcqRel);
                    self.record(StatEvent::Eviction { dirty: wrote });
                    evicted += 1;
                    debug!("evicted {:?} (dirty: {})", obj.uid(), wrote);
                }
                Err(e) => {
                    // leave the wrapper dirty and resident; it will be
                    // scheduled again on a later pass
                    error!("eviction write failed for {:?}, retrying later: {}", obj.uid(), e);
                    let mut inner = self.inner.lock();
                    inner.map.insert(obj.uid(), obj.clone());
                    if !obj.tag.linked() {
                        inner.policy.admit(&obj);
                    }
                }
            }
        }

        stats::flush_current_thread(self.id);
        evicted
    }

    /// Write back every stale resident node that the caller's tree walk
    /// did not reach through parent pointers. Runs to a fixpoint so that
    /// children always hit storage before a parent that still references
    /// them by an in-cache UID.
    pub(crate) fn flush_residual(&self) -> StoreResult {
        loop {
            let objs: Vec<Arc<CacheObject>> = {
                let inner = self.inner.lock();
                inner.map.values().cloned().collect()
            };

            let mut progressed = false;
            let mut remaining = false;
            for obj in objs {
                let mut guard = obj.write_core();
                let (needs, blocked) = match guard.as_ref() {
                    None => (false, false),
                    Some(body) => {
                        let stale = match body {
                            NodeBody::Index(node) => node.has_renamed_children(),
                            NodeBody::Data(_) => false,
                        };
                        let blocked = match body {
                            NodeBody::Index(node) => node.has_unpersisted_children(),
                            NodeBody::Data(_) => false,
                        };
                        (obj.is_dirty() || stale, blocked)
                    }
                };
                if !needs {
                    continue;
                }
                if blocked {
                    remaining = true;
                    continue;
                }
                self.flush_object(&obj, &mut guard)?;
                progressed = true;
            }

            if !remaining {
                return Ok(());
            }
            if !progressed {
                return Err(StoreError::internal(
                    "flush cannot make progress: unpersistable dependency cycle",
                ));
            }
        }
    }

    /// Move a wrapper's map entry to a new key after a rename was
    /// absorbed.
    pub(crate) fn rekey(&self, old: ObjectUid, new: ObjectUid, obj: &Arc<CacheObject>) {
        let mut inner = self.inner.lock();
        if inner.map.remove(&old).is_some() {
            inner.map.insert(new, obj.clone());
        }
    }

    pub(crate) fn read_root_header(&self) -> Result<Option<ObjectUid>, StoreError> {
        Ok(self.storage.read_header()?.map(|header| header.root_uid))
    }

    pub(crate) fn write_root_header(&self, root_uid: ObjectUid) -> StoreResult {
        self.storage.write_header(root_uid)
    }

    /// Serialize a caller's full-flush against the eviction worker.
    pub(crate) fn flush_guard(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.flush_lock.lock()
    }
}

/// The cache manager: shared state plus the two dedicated workers (the
/// eviction worker and the access-reorder worker). Dropping it stops and
/// joins both.
pub struct CacheManager {
    shared: Arc<CacheShared>,
    evict_worker: Option<thread::JoinHandle<()>>,
    reorder_worker: Option<thread::JoinHandle<()>>,
}

impl CacheManager {
    pub fn new(
        capacity: u64,
        block_size: u16,
        policy: PolicyKind,
        storage: Box<dyn StorageBackend>,
    ) -> Result<CacheManager, StoreError> {
        let shared = Arc::new(CacheShared {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            capacity: capacity.max(1),
            block_size: block_size as usize,
            used: AtomicU64::new(0),
            storage,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                policy: build_policy(policy, capacity),
            }),
            flush_lock: Mutex::new(()),
            rings: RingRegistry::new(),
            shared_stats: Arc::new(SharedStats::new()),
            stop: AtomicBool::new(false),
            wake_lock: Mutex::new(false),
            wake: Condvar::new(),
        });

        let evict_shared = shared.clone();
        let evict_worker = thread::Builder::new()
            .name("cache-evict".to_string())
            .spawn(move || evict_worker_loop(evict_shared))
            .map_err(|e| {
                StoreError::new(
                    ErrorKind::Internal,
                    &format!("failed to spawn the eviction worker: {}", e),
                )
            })?;

        let reorder_shared = shared.clone();
        let reorder_worker = match thread::Builder::new()
            .name("cache-reorder".to_string())
            .spawn(move || reorder_worker_loop(reorder_shared))
        {
            Ok(worker) => worker,
            Err(e) => {
                // stop the eviction worker that already came up before
                // reporting the failure
                shared.stop.store(true, Ordering::Release);
                {
                    let mut pending = shared.wake_lock.lock();
                    *pending = true;
                    shared.wake.notify_all();
                }
                let _ = evict_worker.join();
                return Err(StoreError::new(
                    ErrorKind::Internal,
                    &format!("failed to spawn the reorder worker: {}", e),
                ));
            }
        };

        Ok(CacheManager {
            shared,
            evict_worker: Some(evict_worker),
            reorder_worker: Some(reorder_worker),
        })
    }
}

impl std::ops::Deref for CacheManager {
    type Target = CacheShared;

    fn deref(&self) -> &CacheShared {
        &self.shared
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let mut pending = self.shared.wake_lock.lock();
            *pending = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.evict_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.reorder_worker.take() {
            let _ = worker.join();
        }
    }
}

fn evict_worker_loop(shared: Arc<CacheShared>) {
    info!("eviction worker started");
    loop {
        {
            let mut pending = shared.wake_lock.lock();
            if !*pending {
                let _ = shared
                    .wake
                    .wait_for(&mut pending, Duration::from_millis(5));
            }
            *pending = false;
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        while shared.used.load(Ordering::Acquire) > shared.capacity {
            if shared.evict_pass() == 0 {
                // everything over budget is pinned or latched; the overflow
                // is transient and the next wake retries
                break;
            }
        }
    }
    info!("eviction worker stopped");
}

fn reorder_worker_loop(shared: Arc<CacheShared>) {
    info!("reorder worker started");
    let mut rings = Vec::new();
    let mut batch = Vec::new();
    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        shared.rings.snapshot(&mut rings);
        batch.clear();
        for ring in &rings {
            ring.drain_into(&mut batch);
        }

        if batch.is_empty() {
            thread::sleep(Duration::from_micros(200));
            continue;
        }

        let mut inner = shared.inner.lock();
        for obj in &batch {
            inner.policy.touch(obj);
        }
    }
    info!("reorder worker stopped");
}
