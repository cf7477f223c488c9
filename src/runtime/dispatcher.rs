//! The per-core cooperative dispatcher. Every operation that parks a thread
//! — yield, sleep, block, primitive waits — re-enters [`dispatch`], which
//! scans the core's occupancy mask round-robin for the next runnable slot
//! and swaps stacks into it.

use core::ptr;
use core::sync::atomic::Ordering;
use std::panic::{self, AssertUnwindSafe};

use crate::architecture::context::swap_context;
use crate::architecture::cycles;
use crate::logger::error_stream;
use crate::runtime::context::{ThreadContext, ThreadId};
use crate::runtime::mask::AtomicMaskAndCount;
use crate::runtime::{
    lifecycle, runtime, Core, ExitReason, BLOCKED, CORE, MAX_THREADS_PER_CORE, UNOCCUPIED,
};

/// The context hosting the calling thread, or `None` off Arachne cores.
pub(crate) fn current_context() -> Option<&'static ThreadContext> {
    CORE.with(|core| core.loaded_context.get())
}

/// Returns an identifier for the currently executing thread, identical to
/// the one returned by the create call that made it.
///
/// # Panics
///
/// Panics when called from a thread not managed by Arachne.
pub fn this_thread_id() -> ThreadId {
    current_context()
        .expect("this_thread_id() requires an Arachne thread")
        .current_id()
}

/// Gives other threads on the same core a chance to run; returns once every
/// other runnable thread has had one.
pub fn yield_now() {
    match current_context() {
        Some(context) => {
            // Still runnable; merely stepping aside.
            context.wakeup().store(0, Ordering::Release);
            dispatch();
        }
        // Off-core callers (spin lock contention on an ordinary thread) get
        // the kernel's yield instead.
        None => std::thread::yield_now(),
    }
}

/// Parks the calling thread for at least `ns` nanoseconds.
pub fn sleep(ns: u64) {
    let context = current_context().expect("sleep() requires an Arachne thread");
    context.wakeup().store(
        cycles::rdtsc() + cycles::from_nanoseconds(ns),
        Ordering::Release,
    );
    dispatch();
}

/// Parks the calling thread until it is signaled. All direct and indirect
/// callers must tolerate spurious wakeups.
///
/// The park takes effect through the `BLOCKED` deadline the dispatcher
/// installed when it last scheduled this thread, so a signal delivered just
/// before blocking still wakes the thread.
pub fn block() {
    dispatch();
}

/// Makes the target thread runnable. Safe to call on a thread that has
/// already finished: the write lands in a recycled slot and at worst makes
/// the next dispatch scan visit it once.
pub fn signal(id: ThreadId) {
    id.context.wakeup().store(0, Ordering::Release);
}

/// Parks the caller until the thread identified by `id` finishes. Returns
/// immediately if it already has.
///
/// # Panics
///
/// Panics when called from a thread not managed by Arachne.
pub fn join(id: ThreadId) {
    let mut guard = id.context.join_lock.lock();
    while id.context.generation.load(Ordering::Acquire) == id.generation {
        guard = id.context.join_cv.wait(guard);
    }
    drop(guard);
}

fn nested_dispatch_abort() -> ! {
    let backtrace = std::backtrace::Backtrace::force_capture();
    log::error!("nested dispatch detected; this is a bug in a primitive\n{backtrace}");
    error_stream!("nested dispatch detected; aborting");
    std::process::abort();
}

/// Finds the next runnable slot and switches to it.
///
/// Single-threaded with respect to its own core. The scan starts at the
/// round-robin cursor; scheduling a slot advances the cursor past it, so
/// every runnable slot is visited in bounded time no matter how often any
/// one of them yields. Wrapping re-reads the mask because creations from
/// other cores can set new bits between iterations. When nothing is
/// runnable the scan spins; the runtime targets cores it owns.
pub(crate) fn dispatch() {
    CORE.with(dispatch_on)
}

fn dispatch_on(core: &Core) {
    let occupied = core
        .local_occupied
        .get()
        .expect("dispatch() requires an Arachne core");
    let contexts = core.local_contexts.get().expect("core not initialized");
    if core.in_dispatch.replace(true) {
        nested_dispatch_abort();
    }

    let entry = cycles::rdtsc();
    core.dispatch_start.set(entry);
    note_total_cycles(core, entry);

    let mut current_index = core.next_candidate_index.get();
    let mut mask = occupied.load(Ordering::Acquire).occupied() >> current_index;
    let mut now = entry;
    loop {
        if mask == 0 {
            // End of a pass over the mask.
            now = cycles::rdtsc();
            note_pass_complete(core, now);
            if let Some(reason) = wrap_action(core, occupied) {
                // Hand the kernel thread back its original stack. The only
                // way this frame resumes is a dispatcher scheduling this
                // slot after a shutdown-abandoned thread survived into a
                // restart, in which case the thread simply continues from
                // its original dispatch call.
                core.exit_reason.set(reason);
                let loaded = core.loaded_context.get().expect("core not initialized");
                core.in_dispatch.set(false);
                // SAFETY: `kernel_stack_sp` was published by the bootstrap
                // swap in `kernel_thread_main`, whose frame is parked
                // waiting for us.
                unsafe { swap_context(loaded.sp(), &core.kernel_stack_sp) };
                let resumed = CORE.with(|core| core.loaded_context.get());
                resumed
                    .expect("core not initialized")
                    .wakeup()
                    .store(BLOCKED, Ordering::Relaxed);
                return;
            }
            current_index = 0;
            mask = occupied.load(Ordering::Acquire).occupied();
            core::hint::spin_loop();
            continue;
        }
        if mask & 1 == 0 {
            current_index += 1;
            mask >>= 1;
            continue;
        }
        // SAFETY: Slot pointers always reference live contexts.
        let context = unsafe { &*contexts[current_index].load(Ordering::Acquire) };
        if context.wakeup().load(Ordering::Acquire) <= now {
            core.next_candidate_index
                .set((current_index + 1) % MAX_THREADS_PER_CORE);
            core.threads_ran_this_pass
                .set(core.threads_ran_this_pass.get() + 1);
            let loaded = core.loaded_context.get().expect("core not initialized");
            if ptr::eq(loaded, context) {
                // The running thread is the best candidate; consume its own
                // wake-now intent and let it continue.
                context.wakeup().store(BLOCKED, Ordering::Relaxed);
                finish_dispatch(core);
                return;
            }
            core.loaded_context.set(Some(context));
            finish_dispatch(core);
            // SAFETY: `context.sp` holds either a pointer published by a
            // previous swap out of that slot or a freshly laid trampoline
            // frame; `loaded.sp` is ours to publish through.
            unsafe { swap_context(loaded.sp(), context.sp()) };
            // Another dispatch on this core has resumed us.
            let resumed = CORE.with(|core| core.loaded_context.get());
            resumed
                .expect("core not initialized")
                .wakeup()
                .store(BLOCKED, Ordering::Relaxed);
            return;
        }
        current_index += 1;
        mask >>= 1;
    }
}

/// Accounts the cycles spent inside this dispatch call and clears the
/// in-dispatch flag before control leaves the scan.
fn finish_dispatch(core: &Core) {
    let now = cycles::rdtsc();
    if let Some(stats) = core.local_stats.get() {
        stats
            .idle_cycles
            .fetch_add(now - core.dispatch_start.get(), Ordering::Relaxed);
    }
    note_total_cycles(core, now);
    core.in_dispatch.set(false);
}

fn note_total_cycles(core: &Core, now: u64) {
    if let Some(stats) = core.local_stats.get() {
        stats
            .total_cycles
            .fetch_add(now.saturating_sub(core.last_stats_update.get()), Ordering::Relaxed);
    }
    core.last_stats_update.set(now);
}

/// Weighted-load accounting: each full pass contributes the pass duration
/// multiplied by the number of threads it scheduled.
fn note_pass_complete(core: &Core, now: u64) {
    note_total_cycles(core, now);
    if let Some(stats) = core.local_stats.get() {
        let weighted = core.threads_ran_this_pass.get() * (now - core.pass_start.get());
        stats
            .weighted_loaded_cycles
            .fetch_add(weighted, Ordering::Relaxed);
    }
    core.pass_start.set(now);
    core.threads_ran_this_pass.set(0);
}

/// Runs once per completed scan pass: reacts to shutdown, arbiter
/// revocations, and drain progress. Returns the reason to exit the
/// dispatcher, if any. All three checks are rare; the common case is a few
/// relaxed loads.
fn wrap_action(core: &Core, occupied: &AtomicMaskAndCount) -> Option<ExitReason> {
    let rt = runtime();
    if rt.shutdown.load(Ordering::Acquire) {
        return Some(ExitReason::Shutdown);
    }
    let core_id = core.id.get().expect("core not initialized");
    if core.draining.get() {
        if occupied.load(Ordering::Acquire).num_occupied() == 0 {
            return Some(ExitReason::Release);
        }
        if !core.drain_warned.get() && cycles::rdtsc() > core.drain_deadline.get() {
            core.drain_warned.set(true);
            log::warn!(
                "core {core_id} still draining after grace period; waiting for threads to finish"
            );
        }
    } else if rt.release_requested[core_id].swap(false, Ordering::AcqRel)
        && rt.arbiter.must_release_core()
    {
        lifecycle::begin_drain(core, core_id);
    }
    None
}

/// Top-level loop of every thread slot, entered the first time a slot's
/// stack is swapped onto and never left. Parks until a creation assigns
/// work, runs it, then retires the slot for reuse.
pub(crate) extern "C" fn scheduler_main_loop() -> ! {
    loop {
        // Will not return until this slot has been given a thread to run.
        block();

        let context = current_context().expect("trampoline outside a core");
        context.started.store(true, Ordering::Relaxed);
        // SAFETY: The dispatcher only schedules an occupied slot, and an
        // occupied slot had an invocation stored before publication.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            context.invocation.run();
        }));
        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            log::error!("thread exited by panic: {message}");
        }

        // The thread has finished. Tombstone the slot before anything else
        // so the dispatcher cannot schedule it again, and cancel any wakeup
        // the thread scheduled for itself before exiting.
        context.wakeup().store(UNOCCUPIED, Ordering::Release);
        context.started.store(false, Ordering::Relaxed);

        if !context.stack_canary_intact() {
            error_stream!(
                "stack overflow detected on core {} slot {}; aborting",
                context.core_id.load(Ordering::Relaxed),
                context.id_in_core.load(Ordering::Relaxed)
            );
            std::process::abort();
        }

        {
            // Joiners re-check the generation after waking, so it must
            // advance before they are notified.
            let guard = context.join_lock.lock();
            context.generation.fetch_add(1, Ordering::Release);
            context.join_cv.notify_all();
            drop(guard);
        }

        CORE.with(|core| {
            if let Some(stats) = core.local_stats.get() {
                stats.num_threads_finished.fetch_add(1, Ordering::Relaxed);
            }
        });

        // Clear the occupied flag, retrying until success. This never races
        // with a creation targeting this slot, because creations only target
        // clear bits.
        let occupied = CORE.with(|core| core.local_occupied.get()).expect("trampoline outside a core");
        let index = context.id_in_core.load(Ordering::Relaxed) as usize;
        loop {
            let old = occupied.load(Ordering::Acquire);
            let mut new = old.with_occupied(old.occupied() & !(1 << index));
            if old.is_occupied(index) {
                new = new.with_num_occupied(old.num_occupied() - 1);
            }
            if occupied.compare_exchange(old, new) {
                break;
            }
        }
    }
}
