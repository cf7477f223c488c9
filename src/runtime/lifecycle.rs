//! Runtime lifecycle: initialization, kernel-thread bootstrap, shutdown, and
//! the core grant/release protocol, including drain-time thread migration.

use core::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;

use crate::architecture::context::swap_context;
use crate::architecture::{cpu, cycles};
use crate::options::{self, Options};
use crate::policy::CorePolicy;
use crate::runtime::mask::OCCUPIED_MASK;
use crate::runtime::{
    creation, dispatcher, is_initialized, runtime, runtime_or_init, Config, Core, ExitReason,
    Runtime, COMPLETION_WAIT_NANOS, CORE, MAX_THREADS_PER_CORE,
};

/// How long a drain waits for resident threads before it starts warning, in
/// nanoseconds.
const DRAIN_GRACE_NANOS: u64 = 100_000_000;

/// Errors surfaced by boundary functions. Everything else in the runtime
/// either returns a sentinel or aborts.
#[derive(Debug, Error)]
pub enum Error {
    /// The core arbiter could not be reached; retrying later is reasonable.
    #[error("core arbiter unavailable: connection refused")]
    ArbiterUnavailable,

    /// A recognized flag carried a value the runtime cannot use.
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Initializes the runtime and starts its kernel threads. Recognized flags
/// are parsed out of `argv` (see the crate documentation); unknown arguments
/// pass through to the application. Idempotent after the first success;
/// later calls keep the first call's sizing.
///
/// Returns once at least the configured minimum number of cores is running.
pub fn init(argv: Option<&mut Vec<String>>) -> Result<(), Error> {
    let options = match argv {
        Some(argv) => options::parse_and_strip(argv)?,
        None => Options::default(),
    };
    if options.enable_arbiter {
        // The socket-based arbiter client is an external collaborator; with
        // no arbiter process to connect to, the connection is refused.
        return Err(Error::ArbiterUnavailable);
    }
    let config = Config {
        min_num_cores: options.min_num_cores,
        max_num_cores: options.max_num_cores,
        // Stacks hold the swap register band, so keep them word-tidy.
        stack_size: options.stack_size.next_multiple_of(16).max(16 * 1024),
        estimate_load: !options.disable_load_estimation,
    };
    let rt = runtime_or_init(config);
    // Calibrate the cycle counter now rather than on first use inside a
    // dispatcher.
    cycles::cycles_per_second();

    {
        let mut grant = rt.grant().lock().unwrap();
        if grant.kernel_threads_running {
            return Ok(());
        }
        rt.shutdown.store(false, Ordering::SeqCst);
        rt.arbiter.reset();
        for index in 0..rt.config.max_num_cores {
            let handle = std::thread::Builder::new()
                .name(format!("arachne-{index}"))
                .spawn(kernel_thread_main)
                .expect("failed to spawn a kernel thread");
            grant.handles.push(handle);
        }
        grant.kernel_threads_running = true;
    }

    rt.arbiter
        .set_requested_cores(u64::from(rt.config.min_num_cores));
    rt.wait_for_active_cores(rt.config.min_num_cores);
    log::info!(
        "initialized with {} cores (max {})",
        rt.config.min_num_cores,
        rt.config.max_num_cores
    );
    Ok(())
}

/// Asks every kernel thread to exit once its dispatcher reaches an idle
/// moment. Threads still parked on cores are abandoned; they resume if the
/// runtime is initialized again.
pub fn shut_down() {
    let rt = runtime();
    rt.shutdown.store(true, Ordering::SeqCst);
    rt.arbiter
        .release_all_waiters(u64::from(rt.config.max_num_cores));
}

/// Blocks the caller until every kernel thread has exited. Must be called
/// from outside the runtime's own threads.
pub fn wait_for_termination() {
    let rt = runtime();
    let handles: Vec<_> = rt.grant().lock().unwrap().handles.drain(..).collect();
    for handle in handles {
        let _ = handle.join();
    }
    rt.grant().lock().unwrap().kernel_threads_running = false;
    log::info!(
        "all kernel threads exited ({} core increments, {} decrements over this run)",
        rt.num_core_increments.load(Ordering::Relaxed),
        rt.num_core_decrements.load(Ordering::Relaxed)
    );
}

/// Main function of every kernel thread: wait for a core grant, run the
/// dispatcher on it until the core is revoked or the runtime shuts down,
/// then hand the core back and wait again.
fn kernel_thread_main() {
    let rt = runtime();
    loop {
        rt.arbiter.block_until_core_available();
        if rt.shutdown.load(Ordering::SeqCst) {
            rt.arbiter.unregister();
            return;
        }
        let core_id = rt.claim_core_id();
        cpu::pin_to_core(core_id);
        // Register with the policy before installing the scheduling state:
        // the policy may create threads, and those creators must see this
        // thread as an ordinary external one.
        rt.policy.core_available(core_id);
        install_core_state(rt, core_id);
        rt.num_active_cores.fetch_add(1, Ordering::SeqCst);
        rt.note_active_cores_changed();
        log::debug!("core {core_id} entering its dispatcher");

        // Switch off the kernel-provided stack; the dispatcher and every
        // user thread run only on stacks the runtime owns. Control returns
        // here once the dispatcher decides to give the core up.
        CORE.with(|core| {
            let first = core.loaded_context.get().expect("core state installed");
            // SAFETY: `first` is an unoccupied slot whose stack was laid (or
            // re-laid) while idle, and `kernel_stack_sp` is ours to publish.
            unsafe { swap_context(&core.kernel_stack_sp, first.sp()) };
        });

        let (reason, was_draining) = CORE.with(|core| {
            let reason = core.exit_reason.get();
            let was_draining = core.draining.get();
            core.id.set(None);
            core.loaded_context.set(None);
            core.local_contexts.set(None);
            core.local_occupied.set(None);
            core.local_stats.set(None);
            core.draining.set(false);
            (reason, was_draining)
        });
        rt.num_active_cores.fetch_sub(1, Ordering::SeqCst);
        rt.note_active_cores_changed();
        rt.relay_core_stacks(core_id);
        rt.release_core_id(core_id);
        match reason {
            ExitReason::Shutdown => {
                // A draining core already left the policy's lists.
                if !was_draining {
                    rt.policy.core_unavailable(core_id);
                }
                log::debug!("core {core_id} exiting for shutdown");
                rt.arbiter.unregister();
                return;
            }
            ExitReason::Release => {
                rt.num_core_decrements.fetch_add(1, Ordering::Relaxed);
                log::debug!("core {core_id} returned to the arbiter");
            }
        }
    }
}

fn install_core_state(rt: &'static Runtime, core_id: usize) {
    CORE.with(|core| {
        core.id.set(Some(core_id));
        core.local_contexts.set(Some(rt.contexts[core_id].as_slice()));
        core.local_occupied.set(Some(&rt.occupied_and_count[core_id].0));
        core.local_stats.set(Some(&rt.stats[core_id]));
        core.next_candidate_index.set(0);
        core.in_dispatch.set(false);
        core.draining.set(false);
        core.drain_warned.set(false);
        core.loaded_context.set(Some(rt.context(core_id, 0)));
        let now = cycles::rdtsc();
        core.dispatch_start.set(now);
        core.last_stats_update.set(now);
        core.pass_start.set(now);
        core.threads_ran_this_pass.set(0);
    });
}

/// Requests that the total active core count become `desired`, within the
/// configured bounds. Decreases pick a victim core, whose dispatcher drains
/// and returns it.
pub(crate) fn set_core_count(rt: &'static Runtime, desired: u32) {
    let desired = desired.clamp(rt.config.min_num_cores, rt.config.max_num_cores);
    let current = rt.num_active_cores.load(Ordering::SeqCst);
    if desired == current {
        return;
    }
    if desired > current {
        log::info!("requesting a core-count increase from {current} to {desired}");
        rt.num_core_increments.fetch_add(1, Ordering::Relaxed);
        rt.arbiter.set_requested_cores(u64::from(desired));
    } else {
        log::info!("requesting a core-count decrease from {current} to {desired}");
        rt.arbiter.set_requested_cores(u64::from(desired));
        let own_core = CORE.with(|core| core.id.get());
        if let Some(victim) = rt.policy.least_loaded_shared_core(rt, own_core) {
            rt.release_requested[victim].store(true, Ordering::Release);
        }
    }
}

/// Starts draining the calling dispatcher's core: stop accepting new
/// creations, migrate the threads that have not started, and let the rest
/// finish. Invoked from the dispatcher at an idle wrap.
pub(crate) fn begin_drain(core: &Core, core_id: usize) {
    let rt = runtime();
    log::info!("draining core {core_id} for return to the arbiter");
    rt.policy.core_unavailable(core_id);
    core.draining.set(true);
    core.drain_warned.set(false);
    core.drain_deadline
        .set(cycles::rdtsc() + cycles::from_nanoseconds(DRAIN_GRACE_NANOS));
    migrate_unstarted_threads(rt, core_id);
}

/// Moves every thread on `source_core` that has not yet begun running onto
/// another eligible core. Threads already running own stack frames here and
/// must finish in place.
pub(crate) fn migrate_unstarted_threads(rt: &'static Runtime, source_core: usize) {
    let targets = rt.policy.get_migration_targets();
    if targets.is_empty() {
        return;
    }
    for index in 0..MAX_THREADS_PER_CORE {
        if !rt.occupied_and_count[source_core]
            .load(Ordering::SeqCst)
            .is_occupied(index)
        {
            continue;
        }
        let context = rt.context(source_core, index);
        if context.started.load(Ordering::Acquire) {
            continue;
        }
        // Threads of non-default classes have placement constraints the
        // drain cannot honor; let them finish where they are.
        if context.thread_class.load(Ordering::Relaxed) != crate::policy::DEFAULT_CLASS {
            continue;
        }
        let destination = creation::choose_core(rt, &targets);
        if !migrate_context(rt, source_core, index, destination) {
            log::warn!(
                "no room to migrate a thread off core {source_core}; it will run in place"
            );
        }
    }
}

/// Migrates the unstarted thread in `source_core`/`source_index` to a free
/// slot on `destination_core` by swapping the two slots' context pointers,
/// so the thread's `ThreadId` remains valid. Returns false when the
/// destination has no room.
fn migrate_context(
    rt: &'static Runtime,
    source_core: usize,
    source_index: usize,
    destination_core: usize,
) -> bool {
    if destination_core == source_core {
        return false;
    }
    // Reserve a destination slot with the creation protocol. Its resident
    // (unoccupied) context keeps the UNOCCUPIED deadline, so the destination
    // dispatcher skips the slot until the pointer swap below.
    let destination_occupied = &rt.occupied_and_count[destination_core];
    let destination_index = loop {
        let slot_map = destination_occupied.load(Ordering::SeqCst);
        if slot_map.num_occupied() as usize >= MAX_THREADS_PER_CORE {
            return false;
        }
        let free = !slot_map.occupied() & OCCUPIED_MASK;
        if free == 0 {
            return false;
        }
        let index = free.trailing_zeros() as usize;
        let reserved = slot_map
            .with_occupied(slot_map.occupied() | (1 << index))
            .with_num_occupied(slot_map.num_occupied() + 1);
        if destination_occupied.compare_exchange(slot_map, reserved) {
            break index;
        }
    };

    let migrating = rt.context(source_core, source_index);
    let displaced = rt.context(destination_core, destination_index);
    displaced.core_id.store(source_core as u8, Ordering::Relaxed);
    displaced
        .id_in_core
        .store(source_index as u8, Ordering::Relaxed);
    migrating
        .core_id
        .store(destination_core as u8, Ordering::Relaxed);
    migrating
        .id_in_core
        .store(destination_index as u8, Ordering::Relaxed);

    let migrating_ptr = migrating as *const _ as *mut _;
    let displaced_ptr = displaced as *const _ as *mut _;
    rt.contexts[source_core][source_index].store(displaced_ptr, Ordering::Release);
    // Publication point: the migrated thread's wakeup deadline is already 0,
    // so the destination dispatcher may pick it up from here on.
    rt.contexts[destination_core][destination_index].store(migrating_ptr, Ordering::Release);

    // Vacate the source slot.
    let source_occupied = &rt.occupied_and_count[source_core];
    loop {
        let old = source_occupied.load(Ordering::SeqCst);
        let new = old
            .with_occupied(old.occupied() & !(1 << source_index))
            .with_num_occupied(old.num_occupied() - 1);
        if source_occupied.compare_exchange(old, new) {
            break;
        }
    }
    log::debug!(
        "migrated a thread from core {source_core} slot {source_index} to core \
         {destination_core} slot {destination_index}"
    );
    true
}

/// Empties `core_id` of resident threads so it can be dedicated to an
/// exclusive thread: a helper thread on the core migrates what it can and
/// waits out the rest. The core must already be out of the shared pool.
pub(crate) fn evacuate_core(rt: &'static Runtime, core_id: usize) {
    let migration_thread =
        creation::create_on_core_with_class(rt, core_id, crate::policy::DEFAULT_CLASS, move || {
            migrate_unstarted_threads(rt, core_id);
            // Only this helper left means the core is clean.
            while rt.occupied_and_count[core_id]
                .load(Ordering::SeqCst)
                .num_occupied()
                > 1
            {
                dispatcher::sleep(COMPLETION_WAIT_NANOS);
            }
        });
    match migration_thread {
        Some(id) if dispatcher::current_context().is_some() => dispatcher::join(id),
        Some(_) => {
            // Waiting from a non-Arachne thread; poll for completion.
            while rt.occupied_and_count[core_id]
                .load(Ordering::SeqCst)
                .num_occupied()
                > 0
            {
                std::thread::sleep(Duration::from_micros(10));
            }
        }
        None => log::error!("failed to create a migration thread on core {core_id}"),
    }
}

/// Whether `init` has completed at least once in this process.
pub fn initialized() -> bool {
    is_initialized()
}

/// The runtime's core policy, for tuning load estimation at run time.
///
/// # Panics
///
/// Panics before the first successful `init`.
pub fn core_policy() -> &'static crate::policy::DefaultCorePolicy {
    &runtime().policy
}
