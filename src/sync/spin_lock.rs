use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::architecture::cycles;
use crate::logger::error_stream;
use crate::runtime::context::ThreadContext;
use crate::runtime::dispatcher;

/// A resource that can be held by only one thread at a time. Contenders keep
/// actively attempting to acquire it rather than parking.
///
/// The yielding variant (the default) gives up the core between attempts and
/// is the right choice for user code. The strict variant spins without
/// re-entering the dispatcher and exists for runtime-internal locks that may
/// be taken from inside scheduling code, where a nested dispatch could wipe
/// out a wakeup published by a concurrent creation.
pub struct SpinLock<T> {
    /// false means free, true means locked.
    locked: AtomicBool,

    /// Identifies the lock in the deadlock warning.
    name: &'static str,

    /// Whether contenders yield the core between acquisition attempts.
    should_yield: bool,

    /// The context that most recently acquired the lock, for diagnosis.
    owner: AtomicPtr<ThreadContext>,

    data: UnsafeCell<T>,
}

// SAFETY: The lock provides the mutual exclusion required to hand out
// references to `data`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
// SAFETY: Sending the lock sends its data.
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unnamed, yielding lock around `data`.
    pub fn new(data: T) -> Self {
        Self::named("unnamed", data)
    }

    /// Creates a yielding lock whose name appears in deadlock warnings.
    pub fn named(name: &'static str, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            should_yield: true,
            owner: AtomicPtr::new(core::ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }

    /// Creates a non-yielding lock for use inside the runtime.
    pub fn strict(name: &'static str, data: T) -> Self {
        Self {
            should_yield: false,
            ..Self::named(name, data)
        }
    }

    /// Repeatedly attempts to acquire the lock until success. Warns on the
    /// error stream once per second of continuous contention.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut start_of_contention = 0;
        while self.locked.swap(true, Ordering::Acquire) {
            if start_of_contention == 0 {
                start_of_contention = cycles::rdtsc();
            } else {
                let now = cycles::rdtsc();
                if cycles::to_seconds(now - start_of_contention) > 1.0 {
                    error_stream!("{} SpinLock locked for one second; deadlock?", self.name);
                    start_of_contention = now;
                }
            }
            if self.should_yield {
                dispatcher::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
        self.note_owner();
        SpinLockGuard { lock: self }
    }

    /// Makes a single acquisition attempt.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }
        self.note_owner();
        Some(SpinLockGuard { lock: self })
    }

    fn note_owner(&self) {
        let owner = dispatcher::current_context()
            .map_or(core::ptr::null_mut(), |context| {
                context as *const ThreadContext as *mut ThreadContext
            });
        self.owner.store(owner, Ordering::Relaxed);
    }
}

impl<T> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Releases the lock on drop.
pub struct SpinLockGuard<'locked, T> {
    lock: &'locked SpinLock<T>,
}

impl<'locked, T> SpinLockGuard<'locked, T> {
    /// The lock this guard holds; used by the condition variable to
    /// reacquire after parking.
    pub(crate) fn lock_ref(&self) -> &'locked SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means holding the lock, so we have
        // exclusive access to the interior.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As for `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
