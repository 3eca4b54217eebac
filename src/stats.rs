//! Collection statistics. Plain atomic counters: cheap enough to maintain
//! unconditionally, precise enough for threshold tuning.

use std::sync::atomic::AtomicU64;

use atomic::Ordering;

#[derive(Debug)]
pub struct GcStats {
    pub objects_allocated: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub collections: AtomicU64,
    pub objects_finalized: AtomicU64,
    pub bytes_reclaimed: AtomicU64,
    pub last_pause_ns: AtomicU64,
    pub total_pause_ns: AtomicU64,
}

impl GcStats {
    pub const fn new() -> Self {
        Self {
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            objects_finalized: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
            last_pause_ns: AtomicU64::new(0),
            total_pause_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn on_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_collection(&self, finalized: usize, reclaimed: usize, pause_ns: u64) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.objects_finalized
            .fetch_add(finalized as u64, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        self.last_pause_ns.store(pause_ns, Ordering::Relaxed);
        self.total_pause_ns.fetch_add(pause_ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            objects_finalized: self.objects_finalized.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            last_pause_ns: self.last_pause_ns.load(Ordering::Relaxed),
            total_pause_ns: self.total_pause_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub objects_allocated: u64,
    pub bytes_allocated: u64,
    pub collections: u64,
    pub objects_finalized: u64,
    pub bytes_reclaimed: u64,
    pub last_pause_ns: u64,
    pub total_pause_ns: u64,
}
