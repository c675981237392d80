//! Runtime counters and code size prediction

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Summary of what the runtime has done so far
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub functions: usize,
    pub interpreter_functions: usize,
    pub baseline_functions: usize,
    pub optimized_functions: usize,
    pub baseline_compiles: u64,
    pub optimizing_compiles: u64,
    pub compile_failures: u64,
    pub stale_compilations: u64,
    pub jettisons: u64,
    pub reoptimizations: u64,
    pub osr_exits: u64,
    pub calls_linked: u64,
    pub ic_transitions: u64,
    /// Inline-cache sites per state
    pub ic_states: BTreeMap<String, usize>,
    pub executable_bytes: usize,
    pub live_regions: usize,
    pub patches: u64,
    pub failed_allocations: u64,
    pub structures_killed: u64,
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "functions: {} (interpreter {}, baseline {}, optimized {})",
            self.functions, self.interpreter_functions, self.baseline_functions, self.optimized_functions
        )?;
        writeln!(
            f,
            "compiles: baseline {}, optimizing {}, failed {}, stale {}",
            self.baseline_compiles, self.optimizing_compiles, self.compile_failures, self.stale_compilations
        )?;
        writeln!(
            f,
            "osr exits: {}, reoptimizations: {}, jettisons: {}",
            self.osr_exits, self.reoptimizations, self.jettisons
        )?;
        writeln!(f, "calls linked: {}, ic transitions: {}", self.calls_linked, self.ic_transitions)?;
        let states: Vec<String> = self
            .ic_states
            .iter()
            .map(|(state, count)| format!("{}={}", state, count))
            .collect();
        writeln!(f, "ic states: {}", states.join(" "))?;
        write!(
            f,
            "executable memory: {} bytes in {} regions, {} patches, {} failed allocations; structures killed: {}",
            self.executable_bytes, self.live_regions, self.patches, self.failed_allocations, self.structures_killed
        )
    }
}

/// Running estimate of baseline machine code bytes per bytecode instruction
///
/// Uses Welford's online mean and variance. The prediction is one standard
/// deviation above the mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeSizePredictor {
    samples: u64,
    mean: f64,
    m2: f64,
}

impl CodeSizePredictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: usize, instructions: usize) {
        if instructions == 0 {
            return;
        }
        let ratio = bytes as f64 / instructions as f64;
        self.samples += 1;
        let delta = ratio - self.mean;
        self.mean += delta / self.samples as f64;
        self.m2 += delta * (ratio - self.mean);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn standard_deviation(&self) -> f64 {
        if self.samples < 2 {
            0.0
        } else {
            (self.m2 / (self.samples - 1) as f64).sqrt()
        }
    }

    /// Predicted bytes for a function of `instructions` instructions
    pub fn predict(&self, instructions: usize) -> usize {
        ((self.mean + self.standard_deviation()) * instructions as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_starts_empty() {
        let predictor = CodeSizePredictor::new();
        assert_eq!(predictor.predict(100), 0);
        assert_eq!(predictor.standard_deviation(), 0.0);
    }

    #[test]
    fn test_predictor_mean_and_spread() {
        let mut predictor = CodeSizePredictor::new();
        predictor.record(100, 10);
        predictor.record(300, 10);
        predictor.record(50, 0);
        assert_eq!(predictor.samples(), 2);
        assert!((predictor.mean() - 20.0).abs() < 1e-9);
        // sample stddev of {10, 30}
        assert!((predictor.standard_deviation() - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(predictor.predict(10), ((20.0 + 200f64.sqrt()) * 10.0).ceil() as usize);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = RuntimeStats { functions: 2, baseline_functions: 1, ..Default::default() };
        stats.ic_states.insert("SelfSingle".into(), 3);
        let text = stats.to_string();
        assert!(text.contains("functions: 2"));
        assert!(text.contains("SelfSingle=3"));
    }
}
