//! JIT configuration
//!
//! Every tunable of the tiering and caching heuristics lives in [`JitOptions`].
//! Options can be built in code, loaded from a JSON file, or pointed at through
//! the `QUICKSILVER_JIT_OPTIONS` environment variable. Missing keys fall back to
//! the defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Environment variable naming a JSON options file
pub const OPTIONS_ENV_VAR: &str = "QUICKSILVER_JIT_OPTIONS";

/// Where executable regions come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableBackend {
    /// Heap-backed regions with tracked protection state (portable, used by tests)
    #[default]
    Simulated,
    /// Real pages from mmap with mprotect transitions
    Native,
}

/// JIT runtime options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitOptions {
    /// Executions before the interpreter tiers up to baseline
    pub threshold_for_jit_after_warm_up: i32,
    /// Threshold used when baseline compilation should happen soon
    pub threshold_for_jit_soon: i32,
    /// Baseline executions before considering the optimizing tier
    pub threshold_for_optimize_after_warm_up: i32,
    /// Longer warm-up used after the optimizing tier was abandoned once
    pub threshold_for_optimize_after_long_warm_up: i32,
    /// Short warm-up used when we already know we want to optimize
    pub threshold_for_optimize_soon: i32,
    /// Counter increment charged per function entry
    pub execution_counter_increment_for_entry: i32,
    /// Counter increment charged per loop back edge
    pub execution_counter_increment_for_loop: i32,
    /// Counter increment charged per function return
    pub execution_counter_increment_for_return: i32,
    /// Largest number of counts between two slow-path checkpoints
    pub maximum_execution_counts_between_checkpoints: i32,
    /// Jitter checkpoints so many functions do not tier up in lockstep
    pub randomize_execution_counts_between_checkpoints: bool,
    /// Give up waiting for profiles after this many delays
    pub maximum_optimization_delay: u8,
    /// Always wait at least this many delays
    pub minimum_optimization_delay: u8,
    /// Fraction of value profiles that must have seen a value
    pub desired_profile_liveness_rate: f64,
    /// Fraction of value-profile buckets that must be filled
    pub desired_profile_fullness_rate: f64,
    /// OSR exits before an optimizing code block is thrown away
    pub osr_exit_count_for_reoptimization: u32,
    /// OSR exits from loops before reoptimizing
    pub osr_exit_count_for_reoptimization_from_loop: u32,
    /// Cap on reoptimization attempts per function
    pub reoptimization_retry_counter_max: u32,
    /// Exits at one site before it counts as a frequent exit site
    pub frequent_exit_site_threshold: u32,
    /// Maximum distinct cases per inline cache site
    pub polymorphic_list_cache_size: usize,
    /// Slow-path samples a site must see before its first cache
    pub ic_warm_up_samples: u32,
    /// Watchpoint-driven resets before a site gives up and goes generic
    pub max_stub_resets: u32,
    /// Bytes of executable memory available to the process
    pub executable_memory_budget: usize,
    /// Clamp for the memory pressure multiplier
    pub maximum_memory_pressure_multiplier: f64,
    /// Failed compilations of one tier before the function stops trying
    pub max_compile_failures: u32,
    /// Compile the optimizing tier on a background worker
    pub concurrent_jit: bool,
    /// Source of executable memory
    pub executable_backend: ExecutableBackend,
    /// Shrink branches to their minimal encodings during finalize
    pub branch_compaction: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            threshold_for_jit_after_warm_up: 100,
            threshold_for_jit_soon: 100,
            threshold_for_optimize_after_warm_up: 1000,
            threshold_for_optimize_after_long_warm_up: 5000,
            threshold_for_optimize_soon: 1000,
            execution_counter_increment_for_entry: 1,
            execution_counter_increment_for_loop: 1,
            execution_counter_increment_for_return: 15,
            maximum_execution_counts_between_checkpoints: 1000,
            randomize_execution_counts_between_checkpoints: false,
            maximum_optimization_delay: 5,
            minimum_optimization_delay: 1,
            desired_profile_liveness_rate: 0.75,
            desired_profile_fullness_rate: 0.35,
            osr_exit_count_for_reoptimization: 100,
            osr_exit_count_for_reoptimization_from_loop: 5,
            reoptimization_retry_counter_max: 3,
            frequent_exit_site_threshold: 10,
            polymorphic_list_cache_size: 8,
            ic_warm_up_samples: 1,
            max_stub_resets: 8,
            executable_memory_budget: 32 * 1024 * 1024, // 32 MB
            maximum_memory_pressure_multiplier: 64.0,
            max_compile_failures: 3,
            concurrent_jit: false,
            executable_backend: ExecutableBackend::Simulated,
            branch_compaction: true,
        }
    }
}

impl JitOptions {
    /// Parse options from a JSON document; absent keys keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: JitOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Replace these options with the file named by `QUICKSILVER_JIT_OPTIONS`, if set
    pub fn with_env_overrides(self) -> Result<Self> {
        match std::env::var_os(OPTIONS_ENV_VAR) {
            Some(path) => Self::from_file(path),
            None => Ok(self),
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject option combinations the heuristics cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.polymorphic_list_cache_size < 2 {
            return Err(Error::config("polymorphic_list_cache_size must be at least 2"));
        }
        if self.maximum_execution_counts_between_checkpoints <= 0 {
            return Err(Error::config(
                "maximum_execution_counts_between_checkpoints must be positive",
            ));
        }
        if self.executable_memory_budget == 0 {
            return Err(Error::config("executable_memory_budget must be non-zero"));
        }
        for (name, rate) in [
            ("desired_profile_liveness_rate", self.desired_profile_liveness_rate),
            ("desired_profile_fullness_rate", self.desired_profile_fullness_rate),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(Error::config(format!("{} must be in (0, 1]", name)));
            }
        }
        if self.maximum_memory_pressure_multiplier < 1.0 {
            return Err(Error::config("maximum_memory_pressure_multiplier must be >= 1"));
        }
        if self.minimum_optimization_delay > self.maximum_optimization_delay {
            return Err(Error::config(
                "minimum_optimization_delay exceeds maximum_optimization_delay",
            ));
        }
        Ok(())
    }
}
