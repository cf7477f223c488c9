use crate::policy::CoreList;
use crate::runtime::stats::{self, StatsSnapshot};
use crate::runtime::Runtime;
use crate::sync::SpinLock;

/// How load is mapped onto a core-count recommendation. Two strategies exist
/// to allow comparison across workloads; each is selected by calling the
/// corresponding threshold setter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EstimationStrategy {
    /// Scale on the load factor — the average number of runnable threads a
    /// dispatch pass sees — and scale down on utilization with hysteresis.
    LoadFactor,
    /// Scale purely on utilization.
    Utilization,
}

struct EstimatorState {
    strategy: EstimationStrategy,

    /// Ramp up when the load factor exceeds this.
    load_factor_threshold: f64,

    /// Ramp up when utilization exceeds this fraction of the active cores
    /// (utilization strategy only).
    max_utilization: f64,

    /// `utilization_thresholds[i]` is the utilized-core measurement taken
    /// when the core count ramped up from `i` to `i + 1`; ramping back down
    /// from `i` requires utilization to drop below entry `i - 1` minus the
    /// hysteresis.
    utilization_thresholds: Vec<f64>,

    /// How far below a ramp-up threshold load must fall before we ramp down.
    idle_core_fraction_hysteresis: f64,

    /// Utilizations below this are considered effectively zero.
    zero_core_utilization_threshold: f64,

    /// Do not ramp down while this fraction of slots is occupied: parked
    /// threads would have nowhere to migrate.
    slot_occupancy_threshold: f64,

    previous: Option<StatsSnapshot>,
}

/// Recommends core-count changes from periodic samples of the per-core
/// cycle counters.
pub(crate) struct CoreLoadEstimator {
    state: SpinLock<EstimatorState>,
}

impl CoreLoadEstimator {
    pub fn new(max_num_cores: usize) -> Self {
        Self {
            state: SpinLock::strict("CoreLoadEstimator", EstimatorState {
                strategy: EstimationStrategy::LoadFactor,
                load_factor_threshold: 1.5,
                max_utilization: 0.8,
                utilization_thresholds: vec![0.0; max_num_cores + 1],
                idle_core_fraction_hysteresis: 0.09,
                zero_core_utilization_threshold: 0.01,
                slot_occupancy_threshold: 0.5,
                previous: None,
            }),
        }
    }

    /// Returns −1, 0, or 1 to suggest shrinking, keeping, or growing the
    /// core count. The first call after a topology change only records a
    /// baseline sample.
    pub fn estimate(&self, rt: &Runtime, core_list: &CoreList) -> i32 {
        let mut state = self.state.lock();
        let current = stats::collect(rt, core_list);
        let Some(previous) = state.previous.replace(current) else {
            return 0;
        };

        let idle_cycles = current.idle_cycles.saturating_sub(previous.idle_cycles);
        let total_cycles = current.total_cycles.saturating_sub(previous.total_cycles);
        let measurement_cycles = current
            .collection_time
            .saturating_sub(previous.collection_time);
        let weighted_loaded_cycles = current
            .weighted_loaded_cycles
            .saturating_sub(previous.weighted_loaded_cycles);
        if measurement_cycles == 0 {
            return 0;
        }

        let total_utilized_cores =
            total_cycles.saturating_sub(idle_cycles) as f64 / measurement_cycles as f64;
        let average_load_factor = if total_cycles == 0 {
            0.0
        } else {
            weighted_loaded_cycles as f64 / total_cycles as f64
        };

        Self::decide(
            &mut state,
            core_list.len(),
            total_utilized_cores,
            average_load_factor,
            current.slot_occupancy(),
        )
    }

    /// The pure decision step, split from sampling so the strategy matrix is
    /// testable without live cores.
    fn decide(
        state: &mut EstimatorState,
        cur_active_cores: usize,
        total_utilized_cores: f64,
        average_load_factor: f64,
        slot_occupancy: f64,
    ) -> i32 {
        if cur_active_cores == 0 {
            return 0;
        }
        match state.strategy {
            EstimationStrategy::LoadFactor => {
                log::debug!(
                    "cur_active_cores = {cur_active_cores}, total_utilized_cores = \
                     {total_utilized_cores:.3}, average_load_factor = {average_load_factor:.3}"
                );
                if cur_active_cores < state.utilization_thresholds.len()
                    && average_load_factor > state.load_factor_threshold
                {
                    // Record the utilization we ramped up at; we only ramp
                    // back down once utilization falls below it.
                    state.utilization_thresholds[cur_active_cores] = total_utilized_cores;
                    log::info!(
                        "recommending a core-count increase: load factor {average_load_factor:.3} \
                         over threshold {:.3}",
                        state.load_factor_threshold
                    );
                    return 1;
                }
                let local_threshold = (state.utilization_thresholds[cur_active_cores - 1]
                    - state.idle_core_fraction_hysteresis)
                    .max(state.zero_core_utilization_threshold);
                if total_utilized_cores < local_threshold
                    && slot_occupancy < state.slot_occupancy_threshold
                {
                    log::info!(
                        "recommending a core-count decrease: utilized {total_utilized_cores:.3} \
                         under threshold {local_threshold:.3}"
                    );
                    return -1;
                }
                0
            }
            EstimationStrategy::Utilization => {
                if total_utilized_cores > state.max_utilization * cur_active_cores as f64 {
                    log::info!(
                        "recommending a core-count increase: utilized {total_utilized_cores:.3} \
                         over {:.3} × {cur_active_cores}",
                        state.max_utilization
                    );
                    return 1;
                }
                if total_utilized_cores
                    < state.max_utilization * (cur_active_cores as f64 - 1.0)
                        - state.idle_core_fraction_hysteresis
                {
                    log::info!(
                        "recommending a core-count decrease: utilized {total_utilized_cores:.3}"
                    );
                    return -1;
                }
                0
            }
        }
    }

    /// Forgets prior samples, as if running for the first time. Called on
    /// topology changes so deltas never span them.
    pub fn clear_history(&self) {
        self.state.lock().previous = None;
    }

    /// Sets the load-factor threshold and selects the load-factor strategy.
    pub fn set_load_factor_threshold(&self, threshold: f64) {
        let mut state = self.state.lock();
        state.load_factor_threshold = threshold;
        state.strategy = EstimationStrategy::LoadFactor;
    }

    /// Sets the utilization ceiling and selects the utilization strategy.
    pub fn set_max_utilization(&self, max_utilization: f64) {
        let mut state = self.state.lock();
        state.max_utilization = max_utilization;
        state.strategy = EstimationStrategy::Utilization;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state(max_cores: usize) -> CoreLoadEstimator {
        CoreLoadEstimator::new(max_cores)
    }

    fn decide(estimator: &CoreLoadEstimator, active: usize, utilized: f64, load_factor: f64, occupancy: f64) -> i32 {
        let mut state = estimator.state.lock();
        CoreLoadEstimator::decide(&mut state, active, utilized, load_factor, occupancy)
    }

    #[test]
    fn load_factor_over_threshold_recommends_growth() {
        let estimator = fresh_state(4);
        assert_eq!(decide(&estimator, 2, 1.8, 2.0, 0.1), 1);
    }

    #[test]
    fn idle_cores_recommend_shrink() {
        let estimator = fresh_state(4);
        // Ramp up at utilization 1.6 so the ramp-down threshold is recorded.
        assert_eq!(decide(&estimator, 2, 1.6, 2.0, 0.1), 1);
        // Well below the recorded threshold minus hysteresis, low occupancy.
        assert_eq!(decide(&estimator, 3, 0.9, 0.5, 0.1), -1);
    }

    #[test]
    fn parked_threads_block_shrink() {
        let estimator = fresh_state(4);
        assert_eq!(decide(&estimator, 2, 1.6, 2.0, 0.1), 1);
        // Same idle load, but most slots hold parked threads.
        assert_eq!(decide(&estimator, 3, 0.9, 0.5, 0.8), 0);
    }

    #[test]
    fn steady_load_recommends_no_change() {
        let estimator = fresh_state(4);
        assert_eq!(decide(&estimator, 2, 1.9, 1.0, 0.1), 0);
    }

    #[test]
    fn utilization_strategy_thresholds() {
        let estimator = fresh_state(4);
        estimator.set_max_utilization(0.8);
        assert_eq!(decide(&estimator, 2, 1.7, 0.0, 0.1), 1);
        assert_eq!(decide(&estimator, 2, 0.5, 0.0, 0.1), -1);
        assert_eq!(decide(&estimator, 2, 1.0, 0.0, 0.1), 0);
    }
}
