use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use crate::architecture::cycles;
use crate::runtime::context::ThreadId;
use crate::runtime::dispatcher;
use crate::sync::{SpinLock, SpinLockGuard};

/// Enables one or more threads to park until a condition might be true.
///
/// Waiters are woken in FIFO order. Spurious wakeups are permitted, so
/// callers must loop on their predicate around `wait`.
pub struct ConditionVariable {
    /// Parked waiters, processed front-first by `notify_one`. The strict
    /// lock only protects the queue itself; callers still hold their own
    /// mutex across the wait protocol.
    blocked_threads: SpinLock<VecDeque<ThreadId>>,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self {
            blocked_threads: SpinLock::strict("conditionvariable", VecDeque::new()),
        }
    }

    /// Awakens the longest-waiting thread, if any. The caller should hold
    /// the mutex associated with this condition variable.
    pub fn notify_one(&self) {
        let awakened = self.blocked_threads.lock().pop_front();
        if let Some(id) = awakened {
            id.context.wakeup().store(0, Ordering::Release);
        }
    }

    /// Awakens every thread waiting at the moment of the call.
    pub fn notify_all(&self) {
        let mut queue = self.blocked_threads.lock();
        while let Some(id) = queue.pop_front() {
            id.context.wakeup().store(0, Ordering::Release);
        }
    }

    /// Releases `guard`, parks until notified, then reacquires the lock.
    pub fn wait<'locked, T>(&self, guard: SpinLockGuard<'locked, T>) -> SpinLockGuard<'locked, T> {
        let lock = guard.lock_ref();
        self.blocked_threads
            .lock()
            .push_back(dispatcher::this_thread_id());
        drop(guard);
        dispatcher::dispatch();
        lock.lock()
    }

    /// Like [`wait`](Self::wait), but also becomes runnable once `ns`
    /// nanoseconds have elapsed. Timed-out waiters return without a
    /// notification, so callers must re-check their predicate.
    pub fn wait_for<'locked, T>(
        &self,
        guard: SpinLockGuard<'locked, T>,
        ns: u64,
    ) -> SpinLockGuard<'locked, T> {
        let lock = guard.lock_ref();
        let me = dispatcher::this_thread_id();
        me.context
            .wakeup()
            .store(cycles::rdtsc() + cycles::from_nanoseconds(ns), Ordering::Release);
        self.blocked_threads.lock().push_back(me);
        drop(guard);
        dispatcher::dispatch();
        lock.lock()
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}
