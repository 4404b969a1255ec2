//! Per-thread access-metadata buffers.
//!
//! The hot path must not take the cache's list lock on every access.
//! Instead each thread owns a lock-free single-producer circular buffer; on
//! operation return the accessed wrappers are pushed here, and a dedicated
//! worker drains every buffer with one atomic head-swap per batch and
//! replays the accesses into the policy under the list lock.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;

use super::object::CacheObject;

/// Must be a power of two.
pub(crate) const RING_CAPACITY: usize = 256;
const MASK: usize = RING_CAPACITY - 1;

pub(crate) struct ReorderRing {
    head: AtomicUsize,
    tail: AtomicUsize,
    slots: Vec<UnsafeCell<Option<Arc<CacheObject>>>>,
}

// One producer (the owning thread) and one consumer (the reorder worker);
// a slot is only touched by the producer before the tail covers it and by
// the consumer after.
unsafe impl Send for ReorderRing {}
unsafe impl Sync for ReorderRing {}

impl ReorderRing {
    fn new() -> ReorderRing {
        let mut slots = Vec::with_capacity(RING_CAPACITY);
        for _ in 0..RING_CAPACITY {
            slots.push(UnsafeCell::new(None));
        }
        ReorderRing {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots,
        }
    }

    /// Producer side. Spins with progressive backoff while the buffer is
    /// full; an access notification is never dropped.
    pub(crate) fn push(&self, obj: Arc<CacheObject>) {
        let backoff = Backoff::new();
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & MASK;
        while next == self.head.load(Ordering::Acquire) {
            backoff.snooze();
        }
        unsafe {
            *self.slots[tail].get() = Some(obj);
        }
        self.tail.store(next, Ordering::Release);
    }

    /// Consumer side: take everything that is visible in one snapshot. The
    /// single `head := tail` store marks the whole batch consumed.
    pub(crate) fn drain_into(&self, out: &mut Vec<Arc<CacheObject>>) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return 0;
        }

        let mut cursor = head;
        let mut count = 0;
        while cursor != tail {
            let slot = unsafe { (*self.slots[cursor].get()).take() };
            if let Some(obj) = slot {
                out.push(obj);
                count += 1;
            }
            cursor = (cursor + 1) & MASK;
        }

        self.head.store(tail, Ordering::Release);
        count
    }
}

/// All rings registered with one cache. Threads register lazily on their
/// first access; a ring outlives its thread and is simply drained empty
/// from then on.
pub(crate) struct RingRegistry {
    rings: Mutex<Vec<Arc<ReorderRing>>>,
}

impl RingRegistry {
    pub(crate) fn new() -> RingRegistry {
        RingRegistry {
            rings: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self) -> Arc<ReorderRing> {
        let ring = Arc::new(ReorderRing::new());
        self.rings.lock().push(ring.clone());
        ring
    }

    pub(crate) fn snapshot(&self, out: &mut Vec<Arc<ReorderRing>>) {
        out.clear();
        out.extend(self.rings.lock().iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        btree::node::{DataNode, NodeBody},
        cache::uid::{NodeKind, ObjectUid},
    };

    fn dummy() -> Arc<CacheObject> {
        CacheObject::new_allocated(
            ObjectUid::for_new(NodeKind::Data),
            NodeBody::Data(DataNode::new()),
        )
    }

    #[test]
    fn test_push_then_drain() {
        let ring = ReorderRing::new();
        let objs: Vec<_> = (0..10).map(|_| dummy()).collect();
        for obj in &objs {
            ring.push(obj.clone());
        }

        let mut out = Vec::new();
        assert_eq!(ring.drain_into(&mut out), 10);
        assert_eq!(out.len(), 10);
        for (a, b) in objs.iter().zip(out.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(ring.drain_into(&mut out), 0);
    }

    #[test]
    fn test_wraparound() {
        let ring = ReorderRing::new();
        let mut out = Vec::new();
        // cross the ring boundary a few times
        for round in 0..5 {
            for _ in 0..100 {
                ring.push(dummy());
            }
            out.clear();
            assert_eq!(ring.drain_into(&mut out), 100, "round {}", round);
        }
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(ReorderRing::new());
        let producer_ring = ring.clone();
        let producer = std::thread::spawn(move || {
            for _ in 0..10_000 {
                producer_ring.push(dummy());
            }
        });

        let mut seen = 0;
        let mut out = Vec::new();
        while seen < 10_000 {
            out.clear();
            seen += ring.drain_into(&mut out);
        }
        producer.join().unwrap();
        assert_eq!(seen, 10_000);
    }
}
