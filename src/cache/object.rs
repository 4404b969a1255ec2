use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{lock_api, RawRwLock, RwLock};

use super::uid::{NodeKind, ObjectUid};
use crate::btree::node::NodeBody;

/// Owned guards over a wrapper's core. Owned (rather than borrowed) guards
/// are what make the descent's latch chain expressible: the chain stores
/// `(Arc<CacheObject>, guard)` pairs without self-referential lifetimes.
pub type CoreWriteGuard = lock_api::ArcRwLockWriteGuard<RawRwLock, Option<NodeBody>>;
pub type CoreReadGuard = lock_api::ArcRwLockReadGuard<RawRwLock, Option<NodeBody>>;

pub(crate) const NIL_SLOT: usize = usize::MAX;

/// Replacement-policy bookkeeping carried on every wrapper: the slot in the
/// policy's arena, which queue the wrapper sits in (2Q), and the reference
/// bit (CLOCK). All atomic so the policies can read them under the list
/// lock without touching the wrapper's rwlock.
pub(crate) struct PolicyTag {
    pub slot: AtomicUsize,
    pub queue: AtomicU8,
    pub referenced: AtomicBool,
}

impl PolicyTag {
    fn new() -> PolicyTag {
        PolicyTag {
            slot: AtomicUsize::new(NIL_SLOT),
            queue: AtomicU8::new(0),
            referenced: AtomicBool::new(false),
        }
    }

    pub fn linked(&self) -> bool {
        self.slot.load(Ordering::Relaxed) != NIL_SLOT
    }
}

/// The unit of caching: owns the node body (when resident), the dirty and
/// delete flags, the pin count, and the pair of identifiers the flush
/// protocol trades in.
///
/// `uid` is the wrapper's current identity; `uid_updated` is the rename the
/// last flush minted, waiting for the parent to absorb it. Both live in
/// atomics so a parent serializing its own block can read a child's rename
/// without taking the child's lock (the eviction worker holds at most one
/// wrapper lock at a time).
pub struct CacheObject {
    kind: NodeKind,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    mark_delete: AtomicBool,
    uid: AtomicU64,
    uid_updated: AtomicU64,
    pub(crate) tag: PolicyTag,
    core: Arc<RwLock<Option<NodeBody>>>,
}

impl CacheObject {
    /// Wrapper for a freshly allocated node; born dirty.
    pub fn new_allocated(uid: ObjectUid, body: NodeBody) -> Arc<CacheObject> {
        Arc::new(CacheObject {
            kind: body.kind(),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(true),
            mark_delete: AtomicBool::new(false),
            uid: AtomicU64::new(uid.raw()),
            uid_updated: AtomicU64::new(ObjectUid::NIL.raw()),
            tag: PolicyTag::new(),
            core: Arc::new(RwLock::new(Some(body))),
        })
    }

    /// Wrapper for a node decoded from its stored block; born clean.
    pub fn from_storage(uid: ObjectUid, body: NodeBody) -> Arc<CacheObject> {
        Arc::new(CacheObject {
            kind: body.kind(),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            mark_delete: AtomicBool::new(false),
            uid: AtomicU64::new(uid.raw()),
            uid_updated: AtomicU64::new(ObjectUid::NIL.raw()),
            tag: PolicyTag::new(),
            core: Arc::new(RwLock::new(Some(body))),
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn uid(&self) -> ObjectUid {
        ObjectUid::from_raw(self.uid.load(Ordering::Acquire))
    }

    pub fn set_uid(&self, uid: ObjectUid) {
        self.uid.store(uid.raw(), Ordering::Release);
    }

    pub fn uid_updated(&self) -> Option<ObjectUid> {
        let raw = self.uid_updated.load(Ordering::Acquire);
        let uid = ObjectUid::from_raw(raw);
        if uid.is_nil() {
            None
        } else {
            Some(uid)
        }
    }

    pub fn set_uid_updated(&self, uid: ObjectUid) {
        self.uid_updated.store(uid.raw(), Ordering::Release);
    }

    pub fn clear_uid_updated(&self) {
        self.uid_updated
            .store(ObjectUid::NIL.raw(), Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn set_mark_delete(&self) {
        self.mark_delete.store(true, Ordering::Release);
    }

    pub fn is_marked_delete(&self) -> bool {
        self.mark_delete.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::Acquire);
    }

    pub fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "unpin without a matching pin");
    }

    pub fn pins(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Is the body resident right now? A cheap probe for walks that must
    /// not fault evicted subtrees back in.
    pub fn has_core(&self) -> bool {
        self.core.read().is_some()
    }

    pub fn read_core(self: &Arc<Self>) -> CoreReadGuard {
        RwLock::read_arc(&self.core)
    }

    pub fn write_core(self: &Arc<Self>) -> CoreWriteGuard {
        RwLock::write_arc(&self.core)
    }

    pub fn try_write_core(self: &Arc<Self>) -> Option<CoreWriteGuard> {
        RwLock::try_write_arc(&self.core)
    }
}
