use crate::sync::{ConditionVariable, SpinLock};

/// A counting semaphore built on the dispatcher's condition variable. Safe
/// to use in runtime code; starts with a count of zero.
pub struct Semaphore {
    count_protector: SpinLock<u64>,
    count_waiter: ConditionVariable,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count_protector: SpinLock::named("semaphore", 0),
            count_waiter: ConditionVariable::new(),
        }
    }

    /// Sets the count back to zero.
    pub fn reset(&self) {
        *self.count_protector.lock() = 0;
    }

    /// Makes one unit of the resource available, waking a waiter if any.
    pub fn notify(&self) {
        let mut count = self.count_protector.lock();
        *count += 1;
        self.count_waiter.notify_one();
    }

    /// Parks until a unit is available, then consumes it.
    pub fn wait(&self) {
        let mut count = self.count_protector.lock();
        while *count == 0 {
            count = self.count_waiter.wait(count);
        }
        *count -= 1;
    }

    /// Consumes a unit if one is available without parking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count_protector.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
