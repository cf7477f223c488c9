use core::sync::atomic::{AtomicU64, Ordering};

use crate::architecture::cycles;
use crate::policy::CoreList;
use crate::runtime::{Runtime, MAX_THREADS_PER_CORE};

/// Performance counters for one core. Each core updates only its own block,
/// so the hot-path increments never contend; the estimator aggregates on
/// demand with `collect`.
#[repr(align(64))]
pub struct CoreStats {
    /// Cycles spent inside the dispatch scan.
    pub idle_cycles: AtomicU64,

    /// Cycles the core has been active, idle time included.
    pub total_cycles: AtomicU64,

    /// Sum over dispatch passes of (threads scheduled in the pass × cycles
    /// the pass took); the numerator of the load factor.
    pub weighted_loaded_cycles: AtomicU64,

    pub num_threads_created: AtomicU64,
    pub num_threads_finished: AtomicU64,

    /// Creations that lost at least one CAS on the occupancy word.
    pub num_contended_creations: AtomicU64,
}

impl CoreStats {
    pub const fn new() -> Self {
        Self {
            idle_cycles: AtomicU64::new(0),
            total_cycles: AtomicU64::new(0),
            weighted_loaded_cycles: AtomicU64::new(0),
            num_threads_created: AtomicU64::new(0),
            num_threads_finished: AtomicU64::new(0),
            num_contended_creations: AtomicU64::new(0),
        }
    }
}

/// Aggregated statistics over a set of cores at one instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Cycle counter at collection time.
    pub collection_time: u64,
    pub idle_cycles: u64,
    pub total_cycles: u64,
    pub weighted_loaded_cycles: u64,

    /// Occupied and total thread slots across the sampled cores, for the
    /// estimator's scale-down occupancy guard.
    pub occupied_slots: u64,
    pub total_slots: u64,
}

impl StatsSnapshot {
    pub fn slot_occupancy(&self) -> f64 {
        if self.total_slots == 0 {
            return 0.0;
        }
        self.occupied_slots as f64 / self.total_slots as f64
    }
}

/// Sums the statistics of every core in `core_list`.
pub(crate) fn collect(rt: &Runtime, core_list: &CoreList) -> StatsSnapshot {
    let mut snapshot = StatsSnapshot {
        collection_time: cycles::rdtsc(),
        ..StatsSnapshot::default()
    };
    for core_id in core_list.iter() {
        let stats = &rt.stats[core_id];
        snapshot.idle_cycles += stats.idle_cycles.load(Ordering::Relaxed);
        snapshot.total_cycles += stats.total_cycles.load(Ordering::Relaxed);
        snapshot.weighted_loaded_cycles += stats.weighted_loaded_cycles.load(Ordering::Relaxed);
        snapshot.occupied_slots +=
            u64::from(rt.occupied_and_count[core_id].load(Ordering::Relaxed).num_occupied());
        snapshot.total_slots += MAX_THREADS_PER_CORE as u64;
    }
    snapshot
}
