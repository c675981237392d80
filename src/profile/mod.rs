//! Profiling feedback used by the tiering policy
//!
//! - [`counter`]: execution counters that decide when to tier up
//! - [`exit`]: OSR exit sites recorded against baseline code
//! - [`value`]: per-instruction value type profiles

pub mod counter;
pub mod exit;
pub mod value;

pub use counter::{ExecutionCounter, MemoryPressure};
pub use exit::{ExitKind, ExitProfile, FrequentExitSite, QueryableExitProfile};
pub use value::{ObservedType, ProfileSummary, ValueProfile, VALUE_PROFILE_BUCKETS};
