//! Cache counters. The hot path writes thread-local counters only; they are
//! folded into the owning cache's shared totals (and the process-global
//! view) every few events, when the owning thread exits, and whenever a
//! caller asks for a snapshot.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use once_cell::sync::Lazy;

/// Point-in-time counter snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dirty_evictions: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum StatEvent {
    Hit,
    Miss,
    Eviction { dirty: bool },
}

pub(crate) struct SharedStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    dirty_evictions: AtomicU64,
}

impl SharedStats {
    pub(crate) fn new() -> SharedStats {
        SharedStats {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            dirty_evictions: AtomicU64::new(0),
        }
    }

    fn add(&self, delta: &CacheStats) {
        self.hits.fetch_add(delta.hits, Ordering::Relaxed);
        self.misses.fetch_add(delta.misses, Ordering::Relaxed);
        self.evictions.fetch_add(delta.evictions, Ordering::Relaxed);
        self.dirty_evictions
            .fetch_add(delta.dirty_evictions, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            dirty_evictions: self.dirty_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate over every cache that ever ran in this process.
static GLOBAL: Lazy<SharedStats> = Lazy::new(SharedStats::new);

pub fn process_stats() -> CacheStats {
    GLOBAL.snapshot()
}

const FLUSH_EVERY: u64 = 64;

struct LocalCounters {
    pending: CacheStats,
    events: u64,
    shared: Arc<SharedStats>,
}

impl LocalCounters {
    fn flush(&mut self) {
        if self.pending == CacheStats::default() {
            return;
        }
        self.shared.add(&self.pending);
        GLOBAL.add(&self.pending);
        self.pending = CacheStats::default();
        self.events = 0;
    }
}

impl Drop for LocalCounters {
    fn drop(&mut self) {
        self.flush();
    }
}

thread_local! {
    static LOCAL: RefCell<HashMap<usize, LocalCounters>> = RefCell::new(HashMap::new());
}

pub(crate) fn record(cache_id: usize, shared: &Arc<SharedStats>, event: StatEvent) {
    let _ = LOCAL.try_with(|local| {
        let mut local = local.borrow_mut();
        let counters = local.entry(cache_id).or_insert_with(|| LocalCounters {
            pending: CacheStats::default(),
            events: 0,
            shared: shared.clone(),
        });
        match event {
            StatEvent::Hit => counters.pending.hits += 1,
            StatEvent::Miss => counters.pending.misses += 1,
            StatEvent::Eviction { dirty } => {
                counters.pending.evictions += 1;
                if dirty {
                    counters.pending.dirty_evictions += 1;
                }
            }
        }
        counters.events += 1;
        if counters.events >= FLUSH_EVERY {
            counters.flush();
        }
    });
}

/// Fold the calling thread's pending counters for `cache_id` into the
/// shared totals so a snapshot taken right after is current.
pub(crate) fn flush_current_thread(cache_id: usize) {
    let _ = LOCAL.try_with(|local| {
        if let Some(counters) = local.borrow_mut().get_mut(&cache_id) {
            counters.flush();
        }
    });
}
