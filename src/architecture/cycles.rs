//! Cycle-counter timekeeping.
//!
//! All runtime deadlines are expressed as values of the processor's timestamp
//! counter. The counter-to-wall-clock ratio is calibrated once, on first use,
//! against the monotonic clock.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// How long the one-time calibration observes the counter.
const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

/// Reads the processor timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    // SAFETY: `rdtsc` is always available on x86-64 and has no preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Returns the calibrated counter frequency in cycles per second.
pub fn cycles_per_second() -> f64 {
    static CYCLES_PER_SECOND: OnceLock<f64> = OnceLock::new();
    *CYCLES_PER_SECOND.get_or_init(|| {
        let start_time = Instant::now();
        let start_cycles = rdtsc();
        std::thread::sleep(CALIBRATION_WINDOW);
        let elapsed = start_time.elapsed();
        let elapsed_cycles = rdtsc().wrapping_sub(start_cycles);
        elapsed_cycles as f64 / elapsed.as_secs_f64()
    })
}

/// Converts a nanosecond interval into cycles.
#[inline]
pub fn from_nanoseconds(ns: u64) -> u64 {
    (ns as f64 * cycles_per_second() / 1e9) as u64
}

/// Converts a cycle interval into seconds.
#[inline]
pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / cycles_per_second()
}
