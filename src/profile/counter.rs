//! Execution counter driving tier-up decisions
//!
//! The hot path is a single `i32` add and sign test: `counter` starts
//! negative and reaching zero means "a checkpoint was reached". Only then
//! does the slow path ([`ExecutionCounter::check_if_threshold_crossed_and_set`])
//! look at the banked total, apply the current memory pressure and either
//! declare the threshold crossed or arm the next checkpoint.
//!
//! `total_count` banks everything handed out so far, so the true number of
//! counted executions is always `total_count + counter`.

/// Snapshot of the conditions that scale tiering thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPressure {
    /// Thresholds are multiplied by this (>= 1) as code memory fills up
    pub multiplier: f64,
    /// Largest distance between two checkpoints
    pub maximum_execution_counts_between_checkpoints: i32,
    /// When set, checkpoints are shortened to this fraction of the maximum
    pub jitter: Option<f64>,
}

impl MemoryPressure {
    pub fn new(multiplier: f64, maximum_execution_counts_between_checkpoints: i32) -> Self {
        Self {
            multiplier: multiplier.max(1.0),
            maximum_execution_counts_between_checkpoints,
            jitter: None,
        }
    }

    /// No pressure and the default checkpoint distance
    pub fn none() -> Self {
        Self::new(1.0, 1000)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter.clamp(f64::MIN_POSITIVE, 1.0));
        self
    }

    fn apply(&self, value: i32) -> f64 {
        value as f64 * self.multiplier
    }

    fn max_between_checkpoints(&self) -> i32 {
        let max = self.maximum_execution_counts_between_checkpoints.max(1);
        match self.jitter {
            Some(jitter) => ((max as f64 * jitter) as i32).max(1),
            None => max,
        }
    }
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::none()
    }
}

/// Banked + pending execution counter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionCounter {
    total_count: f64,
    counter: i32,
    active_threshold: i32,
}

impl ExecutionCounter {
    pub fn new() -> Self {
        Self {
            total_count: 0.0,
            counter: 0,
            active_threshold: 0,
        }
    }

    /// Executions counted since the last reset
    pub fn count(&self) -> f64 {
        self.total_count + self.counter as f64
    }

    /// Pending (negative until the next checkpoint) part
    pub fn counter(&self) -> i32 {
        self.counter
    }

    pub fn total_count(&self) -> f64 {
        self.total_count
    }

    /// Unadjusted threshold currently being counted towards
    pub fn active_threshold(&self) -> i32 {
        self.active_threshold
    }

    pub fn is_deferred_indefinitely(&self) -> bool {
        self.active_threshold == i32::MAX
    }

    /// Hot path: count `amount` executions; true when a checkpoint is reached
    #[inline]
    pub fn add(&mut self, amount: i32) -> bool {
        self.counter = self.counter.saturating_add(amount);
        self.counter >= 0
    }

    /// Hot path with an increment of one
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.add(1)
    }

    /// Forget everything counted so far
    pub fn reset(&mut self) {
        self.total_count = 0.0;
        self.counter = 0;
        self.active_threshold = 0;
    }

    /// Start counting from zero towards `threshold`
    pub fn set_new_threshold(&mut self, threshold: i32, pressure: &MemoryPressure) {
        self.reset();
        self.active_threshold = threshold;
        self.set_threshold(pressure);
    }

    /// Never reach the threshold
    pub fn defer_indefinitely(&mut self) {
        self.total_count = 0.0;
        self.active_threshold = i32::MAX;
        self.counter = i32::MIN;
    }

    /// Whether the count is close enough to the pressure-adjusted threshold
    ///
    /// Declares victory half a checkpoint early so the answer does not
    /// oscillate while memory pressure moves the target.
    pub fn has_crossed_threshold(&self, pressure: &MemoryPressure) -> bool {
        let modified = pressure.apply(self.active_threshold);
        let slack = self
            .active_threshold
            .min(pressure.maximum_execution_counts_between_checkpoints) as f64
            / 2.0;
        self.count() >= modified - slack
    }

    /// Slow path, run when [`add`](Self::add) reports a checkpoint
    ///
    /// Returns true when the threshold has been crossed. Otherwise the next
    /// checkpoint is armed.
    pub fn check_if_threshold_crossed_and_set(&mut self, pressure: &MemoryPressure) -> bool {
        if self.has_crossed_threshold(pressure) {
            return true;
        }
        self.set_threshold(pressure)
    }

    /// Arm the next checkpoint; true if the threshold is already reached
    fn set_threshold(&mut self, pressure: &MemoryPressure) -> bool {
        if self.active_threshold == i32::MAX {
            self.defer_indefinitely();
            return false;
        }

        let true_total = self.count();
        let remaining = pressure.apply(self.active_threshold) - true_total;
        if remaining <= 0.0 {
            self.counter = 0;
            self.total_count = true_total;
            return true;
        }

        let clipped = remaining.min(pressure.max_between_checkpoints() as f64);
        self.counter = -(clipped as i32);
        self.total_count = true_total + clipped.trunc();
        false
    }
}

impl Default for ExecutionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn run_until_crossed(counter: &mut ExecutionCounter, pressure: &MemoryPressure, limit: u64) -> Option<u64> {
        for n in 1..=limit {
            if counter.tick() && counter.check_if_threshold_crossed_and_set(pressure) {
                return Some(n);
            }
        }
        None
    }

    #[test]
    fn test_crosses_at_threshold_without_pressure() {
        let pressure = MemoryPressure::new(1.0, 1000);
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(1000, &pressure);
        assert_eq!(counter.counter(), -1000);
        assert_eq!(run_until_crossed(&mut counter, &pressure, 5000), Some(1000));
    }

    #[test]
    fn test_pressure_doubles_the_wait() {
        let pressure = MemoryPressure::new(2.0, 1000);
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(1000, &pressure);
        for _ in 0..999 {
            assert!(!counter.tick());
        }
        assert!(counter.tick());
        assert!(!counter.check_if_threshold_crossed_and_set(&pressure));
        assert_eq!(run_until_crossed(&mut counter, &pressure, 5000), Some(1000));
        assert!(counter.count() >= 2000.0 - 500.0);
    }

    #[test]
    fn test_small_threshold_is_not_clipped() {
        let pressure = MemoryPressure::none();
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(10, &pressure);
        assert_eq!(counter.counter(), -10);
        assert_eq!(run_until_crossed(&mut counter, &pressure, 100), Some(10));
    }

    #[test]
    fn test_zero_threshold_crosses_immediately() {
        let pressure = MemoryPressure::none();
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(0, &pressure);
        assert_eq!(counter.counter(), 0);
        assert!(counter.check_if_threshold_crossed_and_set(&pressure));
    }

    #[test]
    fn test_defer_indefinitely() {
        let pressure = MemoryPressure::none();
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(5, &pressure);
        counter.defer_indefinitely();
        assert!(counter.is_deferred_indefinitely());
        assert!(!counter.add(1_000_000));
        assert!(!counter.check_if_threshold_crossed_and_set(&pressure));
        assert!(counter.is_deferred_indefinitely());
        assert_eq!(counter.counter(), i32::MIN);
    }

    #[test]
    fn test_large_increments() {
        let pressure = MemoryPressure::none();
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(100, &pressure);
        let mut calls = 0;
        loop {
            calls += 1;
            if counter.add(15) && counter.check_if_threshold_crossed_and_set(&pressure) {
                break;
            }
        }
        assert_eq!(calls, 7);
    }

    #[test]
    fn test_jitter_shortens_checkpoints() {
        let pressure = MemoryPressure::new(1.0, 1000).with_jitter(0.25);
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(5000, &pressure);
        assert_eq!(counter.counter(), -250);
        assert!(run_until_crossed(&mut counter, &pressure, 10_000).is_some());
    }

    #[test]
    fn test_convergence_with_bounded_overshoot() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let threshold = rng.gen_range(1..20_000);
            let multiplier = rng.gen_range(1.0..8.0);
            let max = rng.gen_range(1..2000);
            let pressure = MemoryPressure::new(multiplier, max);
            let mut counter = ExecutionCounter::new();
            counter.set_new_threshold(threshold, &pressure);

            let target = threshold as f64 * multiplier;
            let limit = (target + max as f64 + 1.0) as u64;
            let crossed = run_until_crossed(&mut counter, &pressure, limit);
            let n = crossed.unwrap_or_else(|| {
                panic!("threshold {} x{} max {} never crossed", threshold, multiplier, max)
            });
            let slack = threshold.min(max) as f64 / 2.0;
            assert!(n as f64 >= target - slack - 1.0, "crossed too early: {} < {}", n, target);
            assert!(n as f64 <= target + max as f64);
        }
    }
}
