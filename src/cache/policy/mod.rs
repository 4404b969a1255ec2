//! Page-replacement policies. A policy orders resident wrappers and picks
//! eviction victims; it runs entirely under the cache's list lock and
//! communicates with wrappers only through their atomic policy tags.

mod clock;
mod lru;
mod two_q;

pub use clock::ClockPolicy;
pub use lru::LruPolicy;
pub use two_q::TwoQPolicy;

use std::sync::{atomic::Ordering, Arc};

use super::object::{CacheObject, NIL_SLOT};

/// Which replacement policy a cache is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    Clock,
    TwoQ,
}

pub(crate) trait ReplacementPolicy: Send {
    /// Link a wrapper admitted on a miss (or re-admitted after a reload).
    fn admit(&mut self, obj: &Arc<CacheObject>);

    /// Link a freshly allocated wrapper at the hottest position.
    fn admit_hot(&mut self, obj: &Arc<CacheObject>);

    /// Replay one recorded access.
    fn touch(&mut self, obj: &Arc<CacheObject>);

    /// Drop a wrapper from the structure (eviction or discard).
    fn unlink(&mut self, obj: &Arc<CacheObject>);

    /// Pick the next victim. `claim` is the caller's gate (pin check plus a
    /// try-lock); entries it rejects are skipped per the policy's own
    /// rules. A claimed victim is unlinked before it is returned.
    fn select_victim(
        &mut self,
        claim: &mut dyn FnMut(&Arc<CacheObject>) -> bool,
    ) -> Option<Arc<CacheObject>>;
}

pub(crate) fn build_policy(kind: PolicyKind, capacity: u64) -> Box<dyn ReplacementPolicy> {
    match kind {
        PolicyKind::Lru => Box::new(LruPolicy::new()),
        PolicyKind::Clock => Box::new(ClockPolicy::new()),
        PolicyKind::TwoQ => Box::new(TwoQPolicy::new(capacity)),
    }
}

struct ArenaNode {
    obj: Option<Arc<CacheObject>>,
    prev: usize,
    next: usize,
}

/// Doubly-linked recency list over arena slots. The source keeps raw
/// prev/next pointers inside each cache object; slot indices into an arena
/// give the same O(1) relink without the pointer graph.
pub(crate) struct LinkedArena {
    nodes: Vec<ArenaNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl LinkedArena {
    pub(crate) fn new() -> LinkedArena {
        LinkedArena {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL_SLOT,
            tail: NIL_SLOT,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn alloc(&mut self, obj: Arc<CacheObject>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = ArenaNode {
                    obj: Some(obj),
                    prev: NIL_SLOT,
                    next: NIL_SLOT,
                };
                slot
            }
            None => {
                self.nodes.push(ArenaNode {
                    obj: Some(obj),
                    prev: NIL_SLOT,
                    next: NIL_SLOT,
                });
                self.nodes.len() - 1
            }
        }
    }

    /// Link at the head (hottest). Returns the slot.
    pub(crate) fn push_front(&mut self, obj: Arc<CacheObject>) -> usize {
        let slot = self.alloc(obj);
        self.nodes[slot].next = self.head;
        if self.head != NIL_SLOT {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL_SLOT {
            self.tail = slot;
        }
        self.len += 1;
        slot
    }

    pub(crate) fn unlink(&mut self, slot: usize) -> Option<Arc<CacheObject>> {
        let (prev, next) = {
            let node = &self.nodes[slot];
            if node.obj.is_none() {
                return None;
            }
            (node.prev, node.next)
        };

        if prev != NIL_SLOT {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL_SLOT {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }

        let node = &mut self.nodes[slot];
        node.prev = NIL_SLOT;
        node.next = NIL_SLOT;
        let obj = node.obj.take();
        self.free.push(slot);
        self.len -= 1;
        obj
    }

    pub(crate) fn move_to_front(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        if let Some(obj) = self.unlink(slot) {
            // unlink freed the slot; relink at the head under a new slot
            let new_slot = self.push_front(obj);
            let obj = self.nodes[new_slot].obj.as_ref().expect("just linked");
            obj.tag.slot.store(new_slot, Ordering::Relaxed);
        }
    }

    pub(crate) fn tail_slot(&self) -> usize {
        self.tail
    }

    pub(crate) fn prev_of(&self, slot: usize) -> usize {
        self.nodes[slot].prev
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Arc<CacheObject>> {
        self.nodes.get(slot).and_then(|n| n.obj.as_ref())
    }

    /// Does the slot still belong to this wrapper? Guards against a slot
    /// being reused between an access being recorded and replayed.
    pub(crate) fn holds(&self, slot: usize, obj: &Arc<CacheObject>) -> bool {
        if slot == NIL_SLOT {
            return false;
        }
        match self.get(slot) {
            Some(linked) => Arc::ptr_eq(linked, obj),
            None => false,
        }
    }

    /// Tail-to-head scan claiming the first entry the gate accepts.
    pub(crate) fn claim_from_tail(
        &mut self,
        claim: &mut dyn FnMut(&Arc<CacheObject>) -> bool,
    ) -> Option<Arc<CacheObject>> {
        let mut cursor = self.tail;
        while cursor != NIL_SLOT {
            let prev = self.prev_of(cursor);
            let obj = match self.get(cursor) {
                Some(obj) => obj.clone(),
                None => {
                    cursor = prev;
                    continue;
                }
            };
            if claim(&obj) {
                self.unlink(cursor);
                obj.tag.slot.store(NIL_SLOT, Ordering::Relaxed);
                return Some(obj);
            }
            cursor = prev;
        }
        None
    }
}
