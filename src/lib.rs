//! Arachne is an M:N user-level thread runtime: many lightweight cooperative
//! threads multiplexed over a small set of kernel threads, one pinned per
//! core. Thread creation is lock-free and touches a single cache line on the
//! target core; scheduling is strictly cooperative, so threads only switch at
//! explicit suspension points (`yield_now`, `sleep`, `block`, and the
//! primitives in [`sync`]).
//!
//! Most of the API must be called from within Arachne threads. The
//! exceptions, usable from any thread, are [`init`], [`shut_down`],
//! [`wait_for_termination`], and the `create_thread*` family.
//!
//! ```no_run
//! let mut args: Vec<String> = std::env::args().collect();
//! arachne::init(Some(&mut args)).unwrap();
//! let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
//! let flag = done.clone();
//! arachne::create_thread(move || {
//!     flag.store(true, std::sync::atomic::Ordering::Release);
//! })
//! .expect("out of thread slots");
//! while !done.load(std::sync::atomic::Ordering::Acquire) {}
//! arachne::shut_down();
//! arachne::wait_for_termination();
//! ```
//!
//! `init` recognizes and strips these flags from the argument list it is
//! given, passing everything else through: `--minNumCores N`,
//! `--maxNumCores N`, `--stackSize BYTES`, `--disableLoadEstimation`, and
//! `--enableArbiter 0|1`.

mod arbiter;
pub mod architecture;
pub mod logger;
mod options;
pub mod policy;
pub mod runtime;
pub mod sync;

pub use logger::set_error_stream;
pub use policy::{CoreList, CorePolicy, DefaultCorePolicy, DEFAULT_CLASS, EXCLUSIVE_CLASS};
pub use runtime::context::ThreadId;
pub use runtime::creation::{create_thread, create_thread_on_core, create_thread_with_class};
pub use runtime::dispatcher::{block, join, signal, sleep, this_thread_id, yield_now};
pub use runtime::lifecycle::{core_policy, init, shut_down, wait_for_termination, Error};
pub use sync::{ConditionVariable, Semaphore, SleepLock, SpinLock};
