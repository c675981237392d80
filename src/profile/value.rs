//! Value profiles
//!
//! Each profiled instruction writes the type of the value it produced into
//! a small ring of buckets. Before optimizing, buckets are folded into the
//! profile's prediction; the fraction of profiles with anything in them
//! (liveness) and the number of samples they hold (fullness) decide whether
//! the optimizer has seen enough to be worth running.

use std::fmt;

/// Number of sample buckets per value profile
pub const VALUE_PROFILE_BUCKETS: usize = 4;

/// Type feedback collected while running lower tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservedType {
    Undefined,
    Int32,
    /// Integer outside the int32 range
    Int52,
    Object,
    Mixed,
}

impl ObservedType {
    /// Merge two observed types (becomes Mixed if different)
    pub fn merge(self, other: ObservedType) -> ObservedType {
        match (self, other) {
            (a, b) if a == b => a,
            (ObservedType::Int32, ObservedType::Int52) | (ObservedType::Int52, ObservedType::Int32) => {
                ObservedType::Int52
            }
            _ => ObservedType::Mixed,
        }
    }

    /// Type of an integer value
    pub fn of_int(value: i64) -> ObservedType {
        if i32::try_from(value).is_ok() {
            ObservedType::Int32
        } else {
            ObservedType::Int52
        }
    }

    pub fn is_int32(&self) -> bool {
        matches!(self, ObservedType::Int32)
    }
}

impl fmt::Display for ObservedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObservedType::Undefined => "undefined",
            ObservedType::Int32 => "int32",
            ObservedType::Int52 => "int52",
            ObservedType::Object => "object",
            ObservedType::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

/// Value profile for a single bytecode instruction
#[derive(Debug, Clone, Default)]
pub struct ValueProfile {
    bytecode_offset: u32,
    buckets: [Option<ObservedType>; VALUE_PROFILE_BUCKETS],
    next_bucket: usize,
    prediction: Option<ObservedType>,
    samples_in_prediction: u32,
}

impl ValueProfile {
    pub fn new(bytecode_offset: u32) -> Self {
        Self {
            bytecode_offset,
            ..Self::default()
        }
    }

    pub fn bytecode_offset(&self) -> u32 {
        self.bytecode_offset
    }

    /// Record a type observation
    pub fn record(&mut self, ty: ObservedType) {
        self.buckets[self.next_bucket] = Some(ty);
        self.next_bucket = (self.next_bucket + 1) % VALUE_PROFILE_BUCKETS;
    }

    /// Samples sitting in buckets, not yet folded into the prediction
    pub fn number_of_samples(&self) -> u32 {
        self.buckets.iter().filter(|b| b.is_some()).count() as u32
    }

    pub fn total_number_of_samples(&self) -> u32 {
        self.samples_in_prediction.saturating_add(self.number_of_samples())
    }

    pub fn prediction(&self) -> Option<ObservedType> {
        self.prediction
    }

    /// Whether anything was ever observed here
    pub fn is_live(&self) -> bool {
        self.number_of_samples() > 0 || self.prediction.is_some()
    }

    /// Fold the buckets into the prediction and empty them
    pub fn compute_updated_prediction(&mut self) -> Option<ObservedType> {
        for bucket in self.buckets.iter_mut() {
            if let Some(ty) = bucket.take() {
                self.prediction = Some(match self.prediction {
                    Some(current) => current.merge(ty),
                    None => ty,
                });
                self.samples_in_prediction = self.samples_in_prediction.saturating_add(1);
            }
        }
        self.next_bucket = 0;
        self.prediction
    }
}

/// Liveness and fullness over a set of value profiles
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProfileSummary {
    pub profiles: usize,
    pub live_profiles: usize,
    /// Samples, capped at [`VALUE_PROFILE_BUCKETS`] per profile
    pub samples: usize,
}

impl ProfileSummary {
    /// Update predictions on every profile and summarize them
    pub fn update_all<'a>(profiles: impl IntoIterator<Item = &'a mut ValueProfile>) -> Self {
        let mut summary = ProfileSummary::default();
        for profile in profiles {
            summary.profiles += 1;
            summary.samples += (profile.total_number_of_samples() as usize).min(VALUE_PROFILE_BUCKETS);
            if profile.is_live() {
                summary.live_profiles += 1;
            }
            profile.compute_updated_prediction();
        }
        summary
    }

    /// Fraction of profiles that saw at least one value (1.0 with no profiles)
    pub fn liveness(&self) -> f64 {
        if self.profiles == 0 {
            return 1.0;
        }
        self.live_profiles as f64 / self.profiles as f64
    }

    /// Fraction of bucket capacity that was used (1.0 with no profiles)
    pub fn fullness(&self) -> f64 {
        if self.profiles == 0 {
            return 1.0;
        }
        self.samples as f64 / VALUE_PROFILE_BUCKETS as f64 / self.profiles as f64
    }
}
