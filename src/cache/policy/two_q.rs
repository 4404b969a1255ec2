use std::{
    collections::{HashSet, VecDeque},
    sync::{atomic::Ordering, Arc},
};

use super::{LinkedArena, ReplacementPolicy};
use crate::cache::{
    object::{CacheObject, NIL_SLOT},
    uid::ObjectUid,
};

const QUEUE_NONE: u8 = 0;
const QUEUE_PROBATION: u8 = 1;
const QUEUE_HOT: u8 = 2;

/// A2Q: a probationary FIFO (A1in) in front of a hot recency list (Am),
/// plus a ghost queue (A1out) of recently evicted probationary UIDs.
///
/// A first-time miss admits to A1in; a touch there promotes to Am; a miss
/// whose UID is still remembered by the ghost queue admits straight to Am.
/// Victims come from A1in's tail while it holds more than its reserve,
/// otherwise from Am's tail. Splits follow the common 25/50/25 default:
/// A1in reserve is a quarter of the capacity, the ghost queue remembers
/// half a capacity's worth of UIDs.
pub struct TwoQPolicy {
    a1in: LinkedArena,
    am: LinkedArena,
    ghosts: VecDeque<ObjectUid>,
    ghost_set: HashSet<ObjectUid>,
    a1in_reserve: usize,
    ghost_cap: usize,
}

impl TwoQPolicy {
    pub fn new(capacity: u64) -> TwoQPolicy {
        TwoQPolicy {
            a1in: LinkedArena::new(),
            am: LinkedArena::new(),
            ghosts: VecDeque::new(),
            ghost_set: HashSet::new(),
            a1in_reserve: (capacity as usize / 4).max(1),
            ghost_cap: (capacity as usize / 2).max(2),
        }
    }

    fn remember_ghost(&mut self, uid: ObjectUid) {
        if !uid.persisted() {
            // an unpersisted page cannot come back under the same identity
            return;
        }
        if self.ghost_set.insert(uid) {
            self.ghosts.push_back(uid);
        }
        while self.ghosts.len() > self.ghost_cap {
            if let Some(old) = self.ghosts.pop_front() {
                self.ghost_set.remove(&old);
            }
        }
    }

    fn link(&mut self, obj: &Arc<CacheObject>, queue: u8) {
        let list = if queue == QUEUE_HOT {
            &mut self.am
        } else {
            &mut self.a1in
        };
        let slot = list.push_front(obj.clone());
        obj.tag.slot.store(slot, Ordering::Relaxed);
        obj.tag.queue.store(queue, Ordering::Relaxed);
    }
}

impl ReplacementPolicy for TwoQPolicy {
    fn admit(&mut self, obj: &Arc<CacheObject>) {
        debug_assert!(!obj.tag.linked());
        let uid = obj.uid();
        if self.ghost_set.remove(&uid) {
            // seen not long ago: skip probation
            self.link(obj, QUEUE_HOT);
        } else {
            self.link(obj, QUEUE_PROBATION);
        }
    }

    fn admit_hot(&mut self, obj: &Arc<CacheObject>) {
        self.link(obj, QUEUE_HOT);
    }

    fn touch(&mut self, obj: &Arc<CacheObject>) {
        let slot = obj.tag.slot.load(Ordering::Relaxed);
        match obj.tag.queue.load(Ordering::Relaxed) {
            QUEUE_PROBATION => {
                if self.a1in.holds(slot, obj) {
                    self.a1in.unlink(slot);
                    self.link(obj, QUEUE_HOT);
                }
            }
            QUEUE_HOT => {
                if self.am.holds(slot, obj) {
                    self.am.move_to_front(slot);
                }
            }
            _ => {}
        }
    }

    fn unlink(&mut self, obj: &Arc<CacheObject>) {
        let slot = obj.tag.slot.load(Ordering::Relaxed);
        match obj.tag.queue.load(Ordering::Relaxed) {
            QUEUE_PROBATION => {
                if self.a1in.holds(slot, obj) {
                    self.a1in.unlink(slot);
                }
            }
            QUEUE_HOT => {
                if self.am.holds(slot, obj) {
                    self.am.unlink(slot);
                }
            }
            _ => return,
        }
        obj.tag.slot.store(NIL_SLOT, Ordering::Relaxed);
        obj.tag.queue.store(QUEUE_NONE, Ordering::Relaxed);
    }

    fn select_victim(
        &mut self,
        claim: &mut dyn FnMut(&Arc<CacheObject>) -> bool,
    ) -> Option<Arc<CacheObject>> {
        let probation_first = self.a1in.len() > self.a1in_reserve || self.am.len() == 0;

        for pass in 0..2 {
            let from_probation = (pass == 0) == probation_first;
            let list = if from_probation {
                &mut self.a1in
            } else {
                &mut self.am
            };
            if let Some(obj) = list.claim_from_tail(&mut *claim) {
                obj.tag.queue.store(QUEUE_NONE, Ordering::Relaxed);
                if from_probation {
                    self.remember_ghost(obj.uid());
                }
                return Some(obj);
            }
        }
        None
    }
}
