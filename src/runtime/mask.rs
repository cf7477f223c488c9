use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::MAX_THREADS_PER_CORE;

/// All 56 slot bits set.
pub const OCCUPIED_MASK: u64 = (1 << MAX_THREADS_PER_CORE) - 1;

/// Tracks the live threads on a single core in one word: a 56-bit occupancy
/// bitmap plus its popcount. Keeping the count alongside the bits lets both
/// be updated by a single compare-and-swap, so `num_occupied ==
/// popcount(occupied)` holds in every observable value.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MaskAndCount {
    /// Bit `i` set means the context with `id_in_core == i` hosts a live
    /// thread; clear means the slot is available for a new thread.
    #[bits(56)]
    pub occupied: u64,
    /// The number of set bits in `occupied`.
    #[bits(8)]
    pub num_occupied: u8,
}

impl MaskAndCount {
    /// Returns whether slot `index` currently hosts a live thread.
    pub fn is_occupied(self, index: usize) -> bool {
        self.occupied() & (1 << index) != 0
    }
}

/// A `MaskAndCount` shared between cores. Creators on any core set bits; the
/// owning core's trampoline clears them; every transition is one CAS.
#[derive(Debug, Default)]
pub struct AtomicMaskAndCount(AtomicU64);

impl AtomicMaskAndCount {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self, order: Ordering) -> MaskAndCount {
        MaskAndCount::from_bits(self.0.load(order))
    }

    pub fn store(&self, value: MaskAndCount, order: Ordering) {
        self.0.store(value.into_bits(), order);
    }

    /// Single-word CAS; returns whether the exchange took effect.
    pub fn compare_exchange(&self, current: MaskAndCount, new: MaskAndCount) -> bool {
        self.0
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_tracks_popcount_through_transitions() {
        let shared = AtomicMaskAndCount::new();
        for index in [0usize, 3, 55] {
            let old = shared.load(Ordering::SeqCst);
            let new = old
                .with_occupied(old.occupied() | (1 << index))
                .with_num_occupied(old.num_occupied() + 1);
            assert!(shared.compare_exchange(old, new));
            let observed = shared.load(Ordering::SeqCst);
            assert_eq!(
                u32::from(observed.num_occupied()),
                observed.occupied().count_ones()
            );
        }
    }

    #[test]
    fn stale_snapshot_fails_exchange() {
        let shared = AtomicMaskAndCount::new();
        let stale = shared.load(Ordering::SeqCst);
        let update = stale.with_occupied(1).with_num_occupied(1);
        assert!(shared.compare_exchange(stale, update));
        // Retrying with the pre-update snapshot must fail.
        assert!(!shared.compare_exchange(stale, update));
    }

    #[test]
    fn occupied_field_is_bounded_to_56_bits() {
        let all = MaskAndCount::new().with_occupied(OCCUPIED_MASK);
        assert_eq!(all.occupied(), OCCUPIED_MASK);
        assert_eq!(all.into_bits() >> 56, 0);
    }
}
