//! Stand-in for the core arbiter client. The real arbiter is an external
//! collaborator that grants exclusive cores over a socket; without it, this
//! shim grants "cores" by counting semaphore, so the runtime behaves the
//! same way: kernel threads block until a core is granted, and revocations
//! surface as `must_release_core` turning true.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::sync::SpinLock;

/// A semaphore for parking kernel threads. Deliberately built on the OS
/// primitives rather than the runtime's own: the waiters are kernel threads
/// that do not yet own a core.
struct ShimSemaphore {
    count: Mutex<u64>,
    available: Condvar,
}

impl ShimSemaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn notify(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }

    fn reset(&self) {
        *self.count.lock().unwrap() = 0;
    }
}

pub(crate) struct ArbiterClientShim {
    /// Kernel threads block here instead of on a socket receive.
    inactive_cores: ShimSemaphore,

    /// How many cores the application currently wants.
    current_requested_cores: AtomicU64,

    /// How many cores the application currently holds.
    current_cores: AtomicU64,

    /// Orders comparisons of the two counters. Non-yielding: it is taken
    /// from inside dispatch, where re-entering the dispatcher could wipe out
    /// a wakeup published by a concurrent creation.
    shim_lock: SpinLock<()>,
}

impl ArbiterClientShim {
    pub fn new() -> Self {
        Self {
            inactive_cores: ShimSemaphore::new(),
            current_requested_cores: AtomicU64::new(0),
            current_cores: AtomicU64::new(0),
            shim_lock: SpinLock::strict("ArbiterClientShim", ()),
        }
    }

    /// Parks the calling kernel thread until a core is granted.
    pub fn block_until_core_available(&self) {
        self.inactive_cores.wait();
    }

    /// Whether the caller's core has been revoked. Consumes one revocation
    /// when it returns true.
    pub fn must_release_core(&self) -> bool {
        // Double-checked: the cheap comparison first, the lock only when a
        // release looks necessary.
        if self.current_requested_cores.load(Ordering::SeqCst)
            >= self.current_cores.load(Ordering::SeqCst)
        {
            return false;
        }
        let _guard = self.shim_lock.lock();
        if self.current_requested_cores.load(Ordering::SeqCst)
            < self.current_cores.load(Ordering::SeqCst)
        {
            self.current_cores.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Adjusts the requested core count, granting cores immediately when it
    /// rises above the held count.
    pub fn set_requested_cores(&self, requested: u64) {
        self.current_requested_cores.store(requested, Ordering::SeqCst);
        let _guard = self.shim_lock.lock();
        let held = self.current_cores.load(Ordering::SeqCst);
        if requested > held {
            for _ in 0..(requested - held) {
                self.inactive_cores.notify();
            }
            self.current_cores.store(requested, Ordering::SeqCst);
        }
    }

    /// Wakes up to `count` parked kernel threads without granting cores, so
    /// they can observe a shutdown.
    pub fn release_all_waiters(&self, count: u64) {
        for _ in 0..count {
            self.inactive_cores.notify();
        }
    }

    /// Since there is no server, unregistration is a no-op.
    pub fn unregister(&self) {}

    /// Returns the shim to its initial state for re-initialization.
    pub fn reset(&self) {
        self.current_requested_cores.store(0, Ordering::SeqCst);
        self.current_cores.store(0, Ordering::SeqCst);
        self.inactive_cores.reset();
    }
}
