use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::Ordering;
use std::collections::VecDeque;

use crate::runtime::context::{ThreadContext, ThreadId};
use crate::runtime::dispatcher;
use crate::sync::SpinLock;

struct SleepLockState {
    /// The context holding the lock; null means free.
    owner: *const ThreadContext,

    /// Contenders in arrival order. `unlock` hands ownership to the front,
    /// so acquisition order is strictly FIFO.
    blocked_threads: VecDeque<ThreadId>,
}

// SAFETY: The owner pointer is only dereferenced through the runtime's
// 'static contexts; the state itself is guarded by the strict spin lock.
unsafe impl Send for SleepLockState {}

/// A mutex that parks contenders instead of spinning. Must only be acquired
/// from Arachne threads. Acquisition order is FIFO.
pub struct SleepLock<T> {
    state: SpinLock<SleepLockState>,
    data: UnsafeCell<T>,
}

// SAFETY: The FIFO ownership protocol provides mutual exclusion over `data`.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: SpinLock::strict("sleeplock", SleepLockState {
                owner: ptr::null(),
                blocked_threads: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, parking if it is held.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let me = dispatcher::current_context().expect("SleepLock requires an Arachne thread");
        {
            let mut state = self.state.lock();
            if state.owner.is_null() {
                state.owner = me;
                return SleepLockGuard { lock: self };
            }
            state.blocked_threads.push_back(me.current_id());
        }
        // Ownership is transferred by unlock before we are signaled; re-park
        // on any wakeup that arrives without it.
        loop {
            dispatcher::dispatch();
            let state = self.state.lock();
            if ptr::eq(state.owner, me) {
                return SleepLockGuard { lock: self };
            }
        }
    }

    /// Makes a single acquisition attempt.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let me = dispatcher::current_context().expect("SleepLock requires an Arachne thread");
        let mut state = self.state.lock();
        if state.owner.is_null() {
            state.owner = me;
            return Some(SleepLockGuard { lock: self });
        }
        None
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        match state.blocked_threads.pop_front() {
            None => state.owner = ptr::null(),
            Some(next) => {
                state.owner = next.context;
                next.context.wakeup().store(0, Ordering::Release);
            }
        }
    }
}

/// Releases the lock on drop, handing it to the longest-waiting contender.
pub struct SleepLockGuard<'locked, T> {
    lock: &'locked SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means owning the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As for `deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
