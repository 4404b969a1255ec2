use std::sync::{atomic::Ordering, Arc};

use super::{LinkedArena, ReplacementPolicy};
use crate::cache::object::{CacheObject, NIL_SLOT};

/// Plain recency list: admissions and touches go to the head, victims are
/// taken from the tail.
pub struct LruPolicy {
    list: LinkedArena,
}

impl LruPolicy {
    pub fn new() -> LruPolicy {
        LruPolicy {
            list: LinkedArena::new(),
        }
    }
}

impl ReplacementPolicy for LruPolicy {
    fn admit(&mut self, obj: &Arc<CacheObject>) {
        debug_assert!(!obj.tag.linked());
        let slot = self.list.push_front(obj.clone());
        obj.tag.slot.store(slot, Ordering::Relaxed);
    }

    fn admit_hot(&mut self, obj: &Arc<CacheObject>) {
        self.admit(obj);
    }

    fn touch(&mut self, obj: &Arc<CacheObject>) {
        let slot = obj.tag.slot.load(Ordering::Relaxed);
        if self.list.holds(slot, obj) {
            self.list.move_to_front(slot);
        }
    }

    fn unlink(&mut self, obj: &Arc<CacheObject>) {
        let slot = obj.tag.slot.load(Ordering::Relaxed);
        if self.list.holds(slot, obj) {
            self.list.unlink(slot);
            obj.tag.slot.store(NIL_SLOT, Ordering::Relaxed);
        }
    }

    fn select_victim(
        &mut self,
        claim: &mut dyn FnMut(&Arc<CacheObject>) -> bool,
    ) -> Option<Arc<CacheObject>> {
        self.list.claim_from_tail(claim)
    }
}
