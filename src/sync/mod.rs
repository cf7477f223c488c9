//! Synchronization primitives built on the dispatcher. Everything that parks
//! a thread here routes through [`crate::runtime::dispatcher::dispatch`].

mod condition;
mod semaphore;
mod sleep_lock;
mod spin_lock;

pub use condition::ConditionVariable;
pub use semaphore::Semaphore;
pub use sleep_lock::{SleepLock, SleepLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
