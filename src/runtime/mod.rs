//! The scheduler core: per-slot contexts, per-core occupancy masks, the
//! cooperative dispatcher, thread creation, and runtime lifecycle.

pub mod context;
pub mod creation;
pub mod dispatcher;
pub mod lifecycle;
pub mod mask;
pub mod stats;

use core::cell::Cell;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::arbiter::ArbiterClientShim;
use crate::policy::DefaultCorePolicy;
use crate::runtime::context::ThreadContext;
use crate::runtime::mask::AtomicMaskAndCount;
use crate::runtime::stats::CoreStats;

/// Largest number of threads that can simultaneously occupy one core; the
/// occupancy bitmap must fit beside its popcount in a single word.
pub const MAX_THREADS_PER_CORE: usize = 56;

pub const CACHE_LINE_SIZE: usize = 64;

/// Placed at the lowest address of every stack to detect overflow.
pub const STACK_CANARY: u64 = 0xDEAD_BAAD;

/// Wakeup deadline of a live thread that is parked until signaled.
pub const BLOCKED: u64 = u64::MAX;

/// Wakeup deadline of a slot that hosts no live thread.
pub const UNOCCUPIED: u64 = u64::MAX - 1;

/// How long to sleep between checks while waiting for threads to finish
/// during a drain, in nanoseconds.
pub const COMPLETION_WAIT_NANOS: u64 = 100_000;

/// Pads a value out to its own cache line to prevent false sharing between
/// adjacent cores' state.
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Why a dispatcher handed its kernel thread back its original stack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ExitReason {
    Shutdown,
    Release,
}

/// Per-kernel-thread scheduling state. A single thread-local load reaches
/// everything the dispatcher touches on the hot path.
pub(crate) struct Core {
    /// Index into the per-core arrays; `None` off Arachne kernel threads.
    pub id: Cell<Option<usize>>,

    /// The context whose stack this kernel thread is currently executing on.
    pub loaded_context: Cell<Option<&'static ThreadContext>>,

    /// This core's slot array.
    pub local_contexts: Cell<Option<&'static [AtomicPtr<ThreadContext>]>>,

    /// This core's occupancy word.
    pub local_occupied: Cell<Option<&'static AtomicMaskAndCount>>,

    /// This core's statistics block.
    pub local_stats: Cell<Option<&'static CoreStats>>,

    /// Where the next dispatch scan starts; advancing it past each scheduled
    /// slot makes the scan round-robin.
    pub next_candidate_index: Cell<usize>,

    /// Set while this kernel thread is inside the dispatch scan; a second
    /// entry is a runtime bug and aborts.
    pub in_dispatch: Cell<bool>,

    /// Saved stack pointer of the kernel-provided stack, so the dispatcher
    /// can hand the kernel thread back on shutdown or core release.
    pub kernel_stack_sp: Cell<*mut u8>,

    pub exit_reason: Cell<ExitReason>,

    /// Set once the arbiter has revoked this core; the dispatcher stops
    /// accepting work and exits once the core is vacated.
    pub draining: Cell<bool>,
    pub drain_deadline: Cell<u64>,
    pub drain_warned: Cell<bool>,

    /// Cycle accounting feeding the load estimator.
    pub dispatch_start: Cell<u64>,
    pub last_stats_update: Cell<u64>,
    pub pass_start: Cell<u64>,
    pub threads_ran_this_pass: Cell<u64>,
}

impl Core {
    const fn new() -> Self {
        Self {
            id: Cell::new(None),
            loaded_context: Cell::new(None),
            local_contexts: Cell::new(None),
            local_occupied: Cell::new(None),
            local_stats: Cell::new(None),
            next_candidate_index: Cell::new(0),
            in_dispatch: Cell::new(false),
            kernel_stack_sp: Cell::new(core::ptr::null_mut()),
            exit_reason: Cell::new(ExitReason::Shutdown),
            draining: Cell::new(false),
            drain_deadline: Cell::new(0),
            drain_warned: Cell::new(false),
            dispatch_start: Cell::new(0),
            last_stats_update: Cell::new(0),
            pass_start: Cell::new(0),
            threads_ran_this_pass: Cell::new(0),
        }
    }
}

thread_local! {
    pub(crate) static CORE: Core = const { Core::new() };
}

/// Runtime configuration fixed at the first successful `init`.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub min_num_cores: u32,
    pub max_num_cores: u32,
    pub stack_size: usize,
    pub estimate_load: bool,
}

pub(crate) struct GrantState {
    /// Core ids not currently claimed by a kernel thread, kept sorted so
    /// grants take the lowest id first.
    pub free_core_ids: Vec<usize>,
    pub handles: Vec<JoinHandle<()>>,
    pub kernel_threads_running: bool,
}

/// Everything allocated at initialization, alive until process exit.
/// Contexts and stacks are never freed, which is what lets `ThreadId` hold
/// `&'static` context references.
pub(crate) struct Runtime {
    pub config: Config,

    /// `contexts[core][slot]` — one pointer per slot. The indirection exists
    /// so a drain can migrate an unstarted thread between cores by swapping
    /// slot pointers, keeping its `ThreadId` valid.
    pub contexts: Vec<Vec<AtomicPtr<ThreadContext>>>,

    /// One occupancy word per core.
    pub occupied_and_count: Vec<CacheAligned<AtomicMaskAndCount>>,

    /// One statistics block per core.
    pub stats: Vec<CoreStats>,

    pub policy: DefaultCorePolicy,
    pub arbiter: ArbiterClientShim,

    pub num_active_cores: AtomicU32,
    pub shutdown: AtomicBool,

    /// Per-core flag asking that core's dispatcher to drain and return the
    /// core to the arbiter.
    pub release_requested: Vec<AtomicBool>,

    pub num_core_increments: AtomicU64,
    pub num_core_decrements: AtomicU64,

    grant: Mutex<GrantState>,
    active_changed: Condvar,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The global runtime; panics before the first successful `init`.
pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get().expect("Arachne has not been initialized")
}

pub(crate) fn runtime_or_init(config: Config) -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new(config))
}

pub(crate) fn is_initialized() -> bool {
    RUNTIME.get().is_some()
}

impl Runtime {
    fn new(config: Config) -> Self {
        let cores = config.max_num_cores as usize;
        let mut contexts = Vec::with_capacity(cores);
        for core_id in 0..cores {
            let mut slots = Vec::with_capacity(MAX_THREADS_PER_CORE);
            for slot in 0..MAX_THREADS_PER_CORE {
                let context = Box::new(ThreadContext::new(
                    core_id as u8,
                    slot as u8,
                    config.stack_size,
                ));
                slots.push(AtomicPtr::new(Box::into_raw(context)));
            }
            contexts.push(slots);
        }
        Self {
            contexts,
            occupied_and_count: (0..cores).map(|_| CacheAligned(AtomicMaskAndCount::new())).collect(),
            stats: (0..cores).map(|_| CoreStats::new()).collect(),
            policy: DefaultCorePolicy::new(cores, config.estimate_load),
            arbiter: ArbiterClientShim::new(),
            num_active_cores: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            release_requested: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            num_core_increments: AtomicU64::new(0),
            num_core_decrements: AtomicU64::new(0),
            grant: Mutex::new(GrantState {
                free_core_ids: (0..cores).collect(),
                handles: Vec::new(),
                kernel_threads_running: false,
            }),
            active_changed: Condvar::new(),
            config,
        }
    }

    /// The context currently installed in the given slot.
    pub fn context(&self, core_id: usize, slot: usize) -> &'static ThreadContext {
        // SAFETY: Slot pointers always reference contexts allocated in
        // `Runtime::new`, which are never freed.
        unsafe { &*self.contexts[core_id][slot].load(Ordering::Acquire) }
    }

    pub fn grant(&self) -> &Mutex<GrantState> {
        &self.grant
    }

    /// Claims the lowest free core id for a newly granted core.
    pub fn claim_core_id(&self) -> usize {
        let mut grant = self.grant.lock().unwrap();
        let position = grant
            .free_core_ids
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| **id)
            .map(|(position, _)| position)
            .expect("more cores granted than exist");
        grant.free_core_ids.swap_remove(position)
    }

    pub fn release_core_id(&self, core_id: usize) {
        self.grant.lock().unwrap().free_core_ids.push(core_id);
    }

    pub fn note_active_cores_changed(&self) {
        // Taking the mutex orders the notification after any in-progress
        // count check in wait_for_active_cores.
        let _grant = self.grant.lock().unwrap();
        self.active_changed.notify_all();
    }

    /// Blocks the caller until at least `count` cores are active.
    pub fn wait_for_active_cores(&self, count: u32) {
        let mut grant = self.grant.lock().unwrap();
        while self.num_active_cores.load(Ordering::SeqCst) < count {
            grant = self.active_changed.wait(grant).unwrap();
        }
        drop(grant);
    }

    /// Re-lays the trampoline frame of every unoccupied slot on a core, so a
    /// future grant of the core starts from a clean dispatcher.
    pub fn relay_core_stacks(&self, core_id: usize) {
        let mask = self.occupied_and_count[core_id].load(Ordering::Acquire);
        for slot in 0..MAX_THREADS_PER_CORE {
            if !mask.is_occupied(slot) {
                self.context(core_id, slot).initialize_stack();
            }
        }
    }
}
