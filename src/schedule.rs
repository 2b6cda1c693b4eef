use crate::config;
use crate::Error;
use crate::Result;
use std::time::Duration;
use std::time::Instant;

// Annealing schedule.
//
// Let N be the number of extra passes through data beyond a single
// greedy append-only pass. The final ratio of ADD to REMOVE actions is
//
//   "total dataset size" = ADD = (1 + N) (ADD - REMOVE)
//
// whence REMOVE / ADD = N / (1 + N), realised by a deterministic
// interleaver with rates add = 1 + N, remove = N.
#[derive(Debug, Clone, PartialEq)]
pub struct Annealing {
    add_rate: f64,
    remove_rate: f64,
    state: f64,
}

impl Annealing {
    pub fn new(extra_passes: f64) -> Result<Self> {
        if !(0.0..=crate::MAX_EXTRA_PASSES).contains(&extra_passes) {
            return Err(Error::Config(format!(
                "extra_passes out of range: {}",
                extra_passes
            )));
        }
        let add_rate = 1.0 + extra_passes;
        Ok(Self {
            add_rate,
            remove_rate: extra_passes,
            state: add_rate,
        })
    }

    /// retune the rates at a batch boundary, keeping the phase
    pub fn set_extra_passes(&mut self, extra_passes: f64) {
        self.add_rate = 1.0 + extra_passes;
        self.remove_rate = extra_passes;
    }

    pub fn next_action_is_add(&mut self) -> bool {
        if self.state >= 0.0 {
            self.state -= self.remove_rate;
            true
        } else {
            self.state += self.add_rate;
            false
        }
    }

    pub fn state(&self) -> f64 {
        self.state
    }

    pub fn set_state(&mut self, state: f64) {
        self.state = state;
    }
}

/// batch bookkeeping: stale rows were assigned before the last boundary,
/// fresh rows arrived since. the boundary fires exactly when the whole
/// stale interval has been recycled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batching {
    stale: u64,
    fresh: u64,
}

impl Batching {
    pub fn new(initial_assigned: u64) -> Self {
        Self {
            stale: initial_assigned,
            fresh: 0,
        }
    }

    pub fn add(&mut self) {
        self.fresh += 1;
    }

    pub fn remove(&mut self) {
        debug_assert!(self.stale > 0, "removed below the batch floor");
        self.stale -= 1;
    }

    pub fn can_remove(&self) -> bool {
        self.stale > 0
    }

    /// true exactly at a batch boundary, rolling fresh into stale
    pub fn test(&mut self) -> bool {
        if self.stale == 0 && self.fresh > 0 {
            self.stale = self.fresh;
            self.fresh = 0;
            true
        } else {
            false
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.stale, self.fresh)
    }

    pub fn set_counts(&mut self, stale: u64, fresh: u64) {
        self.stale = stale;
        self.fresh = fresh;
    }
}

/// early iterations sweep small data proportionally more often; the
/// boost decays to one as the assigned row count passes small_data_size
#[derive(Debug, Clone, PartialEq)]
pub struct Accelerating {
    extra_passes: f64,
    small_data_size: f64,
}

impl Accelerating {
    pub fn new(extra_passes: f64, small_data_size: f64) -> Self {
        Self {
            extra_passes,
            small_data_size,
        }
    }

    pub fn extra_passes(&self, row_count: usize) -> f64 {
        let boost = (self.small_data_size / row_count.max(1) as f64).sqrt().max(1.0);
        (self.extra_passes * boost).min(crate::MAX_EXTRA_PASSES)
    }
}

/// latch that permanently hands the kind loop off to the category loop
/// after enough consecutive sweeps without a feature move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disabling {
    max_reject_iters: u32,
    reject_count: u32,
    disabled: bool,
}

impl Disabling {
    pub fn new(max_reject_iters: u32) -> Self {
        Self {
            max_reject_iters,
            reject_count: 0,
            disabled: false,
        }
    }

    pub fn run(&mut self, changed: bool) {
        if changed {
            self.reject_count = 0;
        } else {
            self.reject_count += 1;
            if self.reject_count >= self.max_reject_iters {
                self.disabled = true;
            }
        }
    }

    /// true while kind inference is still worth running
    pub fn test(&self) -> bool {
        !self.disabled
    }

    pub fn state(&self) -> (u32, bool) {
        (self.reject_count, self.disabled)
    }

    pub fn set_state(&mut self, reject_count: u32, disabled: bool) {
        self.reject_count = reject_count;
        self.disabled = disabled;
    }
}

/// fires once when the configured wall-clock period has elapsed, asking
/// the driver to dump a checkpoint and return unfinished
#[derive(Debug, Clone)]
pub struct Checkpointing {
    period: Option<Duration>,
    started: Instant,
}

impl Checkpointing {
    pub fn new(period_sec: f64) -> Self {
        Self {
            period: (period_sec > 0.0).then(|| Duration::from_secs_f64(period_sec)),
            started: Instant::now(),
        }
    }

    pub fn test(&self) -> bool {
        match self.period {
            Some(period) => self.started.elapsed() >= period,
            None => false,
        }
    }
}

/// the serialisable part of the combined schedule for checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScheduleState {
    pub annealing_state: f64,
    pub stale: u64,
    pub fresh: u64,
    pub reject_count: u32,
    pub disabled: bool,
}

/// everything the multi-pass driver consults between row actions
#[derive(Debug, Clone)]
pub struct Schedule {
    pub annealing: Annealing,
    pub batching: Batching,
    pub accelerating: Accelerating,
    pub disabling: Disabling,
    pub checkpointing: Checkpointing,
}

impl Schedule {
    pub fn new(config: &config::Schedule, initial_assigned: usize) -> Result<Self> {
        Ok(Self {
            annealing: Annealing::new(config.extra_passes)?,
            batching: Batching::new(initial_assigned as u64),
            accelerating: Accelerating::new(config.extra_passes, config.small_data_size),
            disabling: Disabling::new(config.max_reject_iters),
            checkpointing: Checkpointing::new(config.checkpoint_period_sec),
        })
    }

    pub fn state(&self) -> ScheduleState {
        let (stale, fresh) = self.batching.counts();
        let (reject_count, disabled) = self.disabling.state();
        ScheduleState {
            annealing_state: self.annealing.state(),
            stale,
            fresh,
            reject_count,
            disabled,
        }
    }

    pub fn restore(&mut self, state: &ScheduleState) {
        self.annealing.set_state(state.annealing_state);
        self.batching.set_counts(state.stale, state.fresh);
        self.disabling.set_state(state.reject_count, state.disabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_run_ratio_converges() {
        for extra_passes in [0.5, 1.0, 3.0] {
            let mut annealing = Annealing::new(extra_passes).unwrap();
            let mut adds = 0u64;
            let mut removes = 0u64;
            let steps = 100_000;
            for _ in 0..steps {
                if annealing.next_action_is_add() {
                    adds += 1;
                } else {
                    removes += 1;
                }
            }
            let observed = removes as f64 / adds as f64;
            let expected = extra_passes / (1.0 + extra_passes);
            assert!(
                (observed - expected).abs() < 10.0 / steps as f64,
                "extra_passes {}: {} vs {}",
                extra_passes,
                observed,
                expected
            );
        }
    }

    #[test]
    fn zero_extra_passes_is_a_single_greedy_pass() {
        let mut annealing = Annealing::new(0.0).unwrap();
        assert!((0..1000).all(|_| annealing.next_action_is_add()));
    }

    #[test]
    fn negative_extra_passes_is_a_config_error() {
        assert!(matches!(Annealing::new(-0.1), Err(Error::Config(_))));
    }

    #[test]
    fn batching_fires_when_stale_is_recycled() {
        let mut batching = Batching::new(0);
        batching.add();
        assert!(batching.test(), "fresh data with nothing stale is a batch");
        assert_eq!(batching.counts(), (1, 0));
        batching.add();
        assert!(!batching.test());
        batching.remove();
        batching.add();
        assert!(batching.test());
        assert_eq!(batching.counts(), (2, 0));
    }

    #[test]
    fn acceleration_is_nonincreasing_and_settles() {
        let accelerating = Accelerating::new(2.0, 1024.0);
        let mut last = f64::INFINITY;
        for rows in [1, 16, 256, 1024, 4096] {
            let passes = accelerating.extra_passes(rows);
            assert!(passes <= last);
            last = passes;
        }
        assert!((accelerating.extra_passes(1024) - 2.0).abs() < 1e-9);
        assert!((accelerating.extra_passes(1 << 20) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn disabling_latches_after_consecutive_rejects() {
        let mut disabling = Disabling::new(2);
        disabling.run(false);
        assert!(disabling.test());
        disabling.run(true);
        disabling.run(false);
        disabling.run(false);
        assert!(!disabling.test());
        disabling.run(true);
        assert!(!disabling.test(), "the latch is permanent");
    }

    #[test]
    fn schedule_state_round_trips() {
        let config = config::Schedule::default();
        let mut schedule = Schedule::new(&config, 5).unwrap();
        schedule.annealing.next_action_is_add();
        schedule.batching.add();
        schedule.disabling.run(false);
        let state = schedule.state();
        let mut restored = Schedule::new(&config, 0).unwrap();
        restored.restore(&state);
        assert_eq!(restored.state(), state);
    }
}
