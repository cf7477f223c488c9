//! Lock-free thread creation: reserve a slot with one CAS on the target
//! core's occupancy word, move the callable into the slot's inline buffer,
//! then publish it to the target dispatcher with a release store of the
//! wakeup deadline.

use core::sync::atomic::Ordering;

use rand::Rng;

use crate::policy::{CoreList, CorePolicy, DEFAULT_CLASS};
use crate::runtime::context::ThreadId;
use crate::runtime::mask::OCCUPIED_MASK;
use crate::runtime::{runtime, Runtime, MAX_THREADS_PER_CORE};

/// Spawns a thread on the given core, bypassing load balancing. Useful for
/// tests and for threads that share a lot of state with an existing thread.
/// Returns `None` when the core is at capacity; that is a normal outcome,
/// not an error.
pub fn create_thread_on_core<F>(core_id: usize, f: F) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    create_on_core_with_class(runtime(), core_id, DEFAULT_CLASS, f)
}

/// Spawns a thread on a core chosen by the core policy for `thread_class`.
pub fn create_thread_with_class<F>(thread_class: u32, f: F) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    let rt = runtime();
    let core_list = rt.policy.get_cores(thread_class);
    if core_list.is_empty() {
        return None;
    }
    let core_id = choose_core(rt, &core_list);
    create_on_core_with_class(rt, core_id, thread_class, f)
}

/// Spawns a thread of the default class on a lightly loaded core.
pub fn create_thread<F>(f: F) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    create_thread_with_class(DEFAULT_CLASS, f)
}

pub(crate) fn create_on_core_with_class<F>(
    rt: &'static Runtime,
    core_id: usize,
    thread_class: u32,
    f: F,
) -> Option<ThreadId>
where
    F: FnOnce() + Send + 'static,
{
    if core_id >= rt.contexts.len() {
        log::error!("create_thread on nonexistent core {core_id}");
        return None;
    }
    let occupied = &rt.occupied_and_count[core_id];
    let mut failures = 0u64;
    let index = loop {
        // Each iteration makes one attempt to reserve a slot; repeats are
        // needed only under contention for the core's occupancy word.
        let slot_map = occupied.load(Ordering::Acquire);
        if slot_map.num_occupied() as usize >= MAX_THREADS_PER_CORE {
            log::debug!(
                "create_thread failure, core_id = {core_id}, num_occupied = {}",
                slot_map.num_occupied()
            );
            return None;
        }
        let free = !slot_map.occupied() & OCCUPIED_MASK;
        if free == 0 {
            log::warn!(
                "create_thread failed after passing the occupancy check, core_id = {core_id}, \
                 num_occupied = {}",
                slot_map.num_occupied()
            );
            return None;
        }
        let index = free.trailing_zeros() as usize;
        let reserved = slot_map
            .with_occupied(slot_map.occupied() | (1 << index))
            .with_num_occupied(slot_map.num_occupied() + 1);
        if occupied.compare_exchange(slot_map, reserved) {
            break index;
        }
        failures += 1;
    };

    let context = rt.context(core_id, index);
    // The reservation above made the buffer exclusively ours.
    // SAFETY: See above; the slot stays unpublished until the wakeup store.
    unsafe { context.invocation.store(f) };
    context.thread_class.store(thread_class, Ordering::Relaxed);

    // Read the generation before publishing the wakeup, so a thread that
    // finishes immediately cannot advance it under us first.
    let generation = context.generation.load(Ordering::Acquire);
    context.wakeup().store(0, Ordering::Release);

    let stats = &rt.stats[core_id];
    stats.num_threads_created.fetch_add(1, Ordering::Relaxed);
    if failures > 0 {
        stats.num_contended_creations.fetch_add(1, Ordering::Relaxed);
    }
    Some(ThreadId::new(context, generation))
}

/// Picks a reasonably unloaded core from `core_list`: sample two distinct
/// random entries and take the one hosting fewer threads. Balances load
/// without a global counter and tolerates stale occupancy reads.
pub(crate) fn choose_core(rt: &Runtime, core_list: &CoreList) -> usize {
    let index1 = random_index(core_list.len());
    let mut index2 = random_index(core_list.len());
    while index2 == index1 && core_list.len() > 1 {
        index2 = random_index(core_list.len());
    }
    let choice1 = core_list.get(index1);
    let choice2 = core_list.get(index2);
    let load1 = rt.occupied_and_count[choice1].load(Ordering::Relaxed).num_occupied();
    let load2 = rt.occupied_and_count[choice2].load(Ordering::Relaxed).num_occupied();
    if load1 < load2 {
        choice1
    } else {
        choice2
    }
}

fn random_index(len: usize) -> usize {
    #[cfg(test)]
    if let Some(value) = mock_random::pop() {
        return (value as usize) % len;
    }
    rand::thread_rng().gen_range(0..len)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mask::MaskAndCount;
    use crate::runtime::Config;

    fn bare_runtime() -> Runtime {
        // Arrays only; no kernel threads are started.
        Runtime::new(Config {
            min_num_cores: 1,
            max_num_cores: 2,
            stack_size: 16 * 1024,
            estimate_load: false,
        })
    }

    fn both_cores() -> CoreList {
        let mut list = CoreList::new();
        list.add(0);
        list.add(1);
        list
    }

    #[test]
    fn equal_loads_take_the_second_choice() {
        let rt = bare_runtime();
        // First draw picks index 0; the second draw repeats it and is
        // redrawn, landing on index 1. With equal loads the comparison is
        // not strictly less, so the second choice wins.
        mock_random::push(&[0, 0, 1]);
        assert_eq!(choose_core(&rt, &both_cores()), 1);
    }

    #[test]
    fn lighter_core_wins() {
        let rt = bare_runtime();
        rt.occupied_and_count[1].store(
            MaskAndCount::new().with_occupied(0b111).with_num_occupied(3),
            core::sync::atomic::Ordering::SeqCst,
        );
        mock_random::push(&[0, 1]);
        assert_eq!(choose_core(&rt, &both_cores()), 0);
    }

    #[test]
    fn single_entry_lists_need_one_draw() {
        let rt = bare_runtime();
        mock_random::push(&[0, 0]);
        assert_eq!(choose_core(&rt, &CoreList::single(1)), 1);
    }
}
