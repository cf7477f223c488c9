use core::sync::atomic::{AtomicBool, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::policy::{CoreList, CoreLoadEstimator, CorePolicy};
use crate::runtime::mask::MaskAndCount;
use crate::runtime::{creation, dispatcher, lifecycle, runtime, Runtime, MAX_THREADS_PER_CORE};
use crate::sync::SpinLock;

/// How often the adjustment thread samples load, in nanoseconds.
const MEASUREMENT_PERIOD_NS: u64 = 50_000_000;

/// The thread classes the default policy understands.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
enum ThreadClass {
    Default = 0,
    Exclusive = 1,
}

struct Lists {
    /// Cores open to ordinary thread placement, oldest first. The oldest is
    /// taken when an exclusive core is needed, so it is relinquished last.
    shared: CoreList,

    /// Cores dedicated to one thread each.
    exclusive: CoreList,
}

/// The default two-class core policy: a pool of shared cores for ordinary
/// threads, plus cores claimed for exclusive use one thread at a time, with
/// a load-estimation thread growing and shrinking the shared pool.
pub struct DefaultCorePolicy {
    lists: SpinLock<Lists>,
    load_estimator: CoreLoadEstimator,
    core_adjustment_should_run: AtomicBool,
    core_adjustment_thread_started: AtomicBool,
}

impl DefaultCorePolicy {
    pub(crate) fn new(max_num_cores: usize, estimate_load: bool) -> Self {
        Self {
            // The lock is taken inside scheduling code, so it must never
            // yield into the dispatcher.
            lists: SpinLock::strict("DefaultCorePolicy", Lists {
                shared: CoreList::new(),
                exclusive: CoreList::new(),
            }),
            load_estimator: CoreLoadEstimator::new(max_num_cores),
            core_adjustment_should_run: AtomicBool::new(estimate_load),
            core_adjustment_thread_started: AtomicBool::new(false),
        }
    }

    /// Stops future load estimations; ones already begun complete.
    pub fn disable_load_estimation(&self) {
        self.core_adjustment_should_run.store(false, Ordering::Relaxed);
    }

    /// Resumes load estimation.
    pub fn enable_load_estimation(&self) {
        self.core_adjustment_should_run.store(true, Ordering::Relaxed);
    }

    /// Sets the load-factor ramp-up threshold and selects that strategy.
    pub fn set_load_factor_threshold(&self, threshold: f64) {
        self.load_estimator.set_load_factor_threshold(threshold);
    }

    /// Sets the utilization ceiling and selects the utilization strategy.
    pub fn set_max_utilization(&self, max_utilization: f64) {
        self.load_estimator.set_max_utilization(max_utilization);
    }

    /// The shared core currently hosting the fewest threads. `exclude` skips
    /// the caller's own core: it hosts the caller, which cannot be migrated
    /// or waited out, so draining it would never finish.
    pub(crate) fn least_loaded_shared_core(
        &self,
        rt: &Runtime,
        exclude: Option<usize>,
    ) -> Option<usize> {
        let lists = self.lists.lock();
        lists
            .shared
            .iter()
            .filter(|core_id| Some(*core_id) != exclude)
            .min_by_key(|core_id| {
                rt.occupied_and_count[*core_id]
                    .load(Ordering::Relaxed)
                    .num_occupied()
            })
    }

    /// Finds or makes a core for exclusive use by one thread. Existing
    /// threads are migrated or waited out before the core is repurposed.
    fn get_exclusive_core(&'static self) -> Option<usize> {
        let rt = runtime();
        // Prefer an exclusive core whose thread has exited: it still holds
        // the MAX − 1 pin, so handing it straight out is safe. The handout
        // can race with the adjustment thread reclaiming the core for the
        // shared pool; the race is benign because it can only make the
        // placement CAS fail, failing the exclusive creation.
        {
            let lists = self.lists.lock();
            for core_id in lists.exclusive.iter() {
                let mask = rt.occupied_and_count[core_id].load(Ordering::SeqCst);
                if mask.occupied() == 0
                    && mask.num_occupied() as usize == MAX_THREADS_PER_CORE - 1
                {
                    return Some(core_id);
                }
            }
        }
        // Repurpose the oldest shared core, so it is relinquished last. Never
        // the caller's own core: the caller parks while the core is emptied,
        // so its own core could never finish evacuating.
        let own_core = crate::runtime::CORE.with(|core| core.id.get());
        let core_id = {
            let mut lists = self.lists.lock();
            let position = (0..lists.shared.len())
                .find(|position| Some(lists.shared.get(*position)) != own_core)?;
            let core_id = lists.shared.get(position);
            lists.shared.remove(position);
            lists.exclusive.add(core_id);
            core_id
        };
        lifecycle::evacuate_core(rt, core_id);
        // Pinning num_occupied at MAX − 1 leaves room for exactly one
        // placement on this core.
        rt.occupied_and_count[core_id].store(
            MaskAndCount::new().with_num_occupied((MAX_THREADS_PER_CORE - 1) as u8),
            Ordering::SeqCst,
        );
        self.load_estimator.clear_history();
        Some(core_id)
    }

    /// Returns an idle exclusive core to the shared pool, if one exists.
    fn reclaim_idle_exclusive_core(&self, rt: &Runtime) -> bool {
        let mut lists = self.lists.lock();
        for position in 0..lists.exclusive.len() {
            let core_id = lists.exclusive.get(position);
            let mask = rt.occupied_and_count[core_id].load(Ordering::SeqCst);
            if mask.occupied() == 0 && mask.num_occupied() as usize == MAX_THREADS_PER_CORE - 1 {
                // Claim with a CAS so a racing exclusive handout loses.
                let claimed = mask.with_num_occupied(MAX_THREADS_PER_CORE as u8);
                if rt.occupied_and_count[core_id].compare_exchange(mask, claimed) {
                    lists.exclusive.remove(position);
                    rt.occupied_and_count[core_id].store(MaskAndCount::new(), Ordering::SeqCst);
                    lists.shared.add(core_id);
                    self.load_estimator.clear_history();
                    log::info!("returned exclusive core {core_id} to the shared pool");
                    return true;
                }
            }
        }
        false
    }

    /// Main loop of the adjustment thread: periodically estimate load over
    /// the shared cores and actuate a one-core change.
    fn adjust_cores(&'static self) {
        let rt = runtime();
        loop {
            dispatcher::sleep(MEASUREMENT_PERIOD_NS);
            if rt.shutdown.load(Ordering::Acquire) {
                self.core_adjustment_thread_started.store(false, Ordering::SeqCst);
                return;
            }
            if !self.core_adjustment_should_run.load(Ordering::Relaxed) {
                self.load_estimator.clear_history();
                continue;
            }
            let shared = self.lists.lock().shared.clone();
            if shared.is_empty() {
                continue;
            }
            match self.load_estimator.estimate(rt, &shared) {
                0 => {}
                -1 => {
                    if shared.len() > 1 {
                        let active = rt.num_active_cores.load(Ordering::SeqCst);
                        lifecycle::set_core_count(rt, active.saturating_sub(1));
                    }
                }
                _ => {
                    // Before asking the arbiter for another core, see if an
                    // idle exclusive core can rejoin the shared pool.
                    if self.reclaim_idle_exclusive_core(rt) {
                        continue;
                    }
                    let active = rt.num_active_cores.load(Ordering::SeqCst);
                    lifecycle::set_core_count(rt, active + 1);
                }
            }
        }
    }
}

impl CorePolicy for DefaultCorePolicy {
    fn core_available(&'static self, core_id: usize) {
        {
            let mut lists = self.lists.lock();
            lists.shared.add(core_id);
        }
        self.load_estimator.clear_history();
        if self.core_adjustment_should_run.load(Ordering::Relaxed)
            && !self.core_adjustment_thread_started.swap(true, Ordering::SeqCst)
        {
            if creation::create_thread(move || self.adjust_cores()).is_none() {
                log::error!("failed to create the core adjustment thread");
                std::process::abort();
            }
        }
    }

    fn core_unavailable(&'static self, core_id: usize) {
        let mut lists = self.lists.lock();
        if let Some(position) = lists.shared.find(core_id) {
            lists.shared.remove(position);
            drop(lists);
            self.load_estimator.clear_history();
            return;
        }
        if let Some(position) = lists.exclusive.find(core_id) {
            lists.exclusive.remove(position);
            drop(lists);
            self.load_estimator.clear_history();
            return;
        }
        log::error!("tried to remove core {core_id}, unknown to the core policy");
        std::process::abort();
    }

    fn get_cores(&'static self, thread_class: u32) -> CoreList {
        match ThreadClass::from_u32(thread_class) {
            Some(ThreadClass::Default) => self.lists.lock().shared.clone(),
            Some(ThreadClass::Exclusive) => match self.get_exclusive_core() {
                Some(core_id) => CoreList::single(core_id),
                None => CoreList::new(),
            },
            None => CoreList::new(),
        }
    }

    fn get_migration_targets(&'static self) -> CoreList {
        self.lists.lock().shared.clone()
    }
}
