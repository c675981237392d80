//! OSR exit profiling
//!
//! Optimized code speculates; when a speculation fails it exits back to the
//! baseline tier. Exits are tallied per (bytecode offset, kind). Sites that
//! exit often are recorded in the baseline block's [`ExitProfile`] so the
//! next optimizing compile does not make the same bet.

use rustc_hash::FxHashSet;
use std::fmt;

/// Why optimized code bailed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExitKind {
    /// Not attributable to a speculation
    Uncountable,
    /// A value had an unexpected type
    BadType,
    /// A structure check in an inlined property access failed
    BadCache,
    /// Integer arithmetic overflowed its speculated width
    Overflow,
    /// A watched invariant was invalidated while the code was running
    UncountableWatchpoint,
}

impl ExitKind {
    /// Whether exits of this kind count towards reoptimization
    pub fn is_countable(&self) -> bool {
        !matches!(self, ExitKind::Uncountable | ExitKind::UncountableWatchpoint)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitKind::Uncountable => "Uncountable",
            ExitKind::BadType => "BadType",
            ExitKind::BadCache => "BadCache",
            ExitKind::Overflow => "Overflow",
            ExitKind::UncountableWatchpoint => "UncountableWatchpoint",
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bytecode site that exited frequently for one reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrequentExitSite {
    pub bytecode_offset: u32,
    pub kind: ExitKind,
}

impl FrequentExitSite {
    pub fn new(bytecode_offset: u32, kind: ExitKind) -> Self {
        Self { bytecode_offset, kind }
    }
}

impl fmt::Display for FrequentExitSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bc#{}:{}", self.bytecode_offset, self.kind)
    }
}

/// Frequent exit sites of one baseline code block
///
/// Appended to by the mutator when optimized code is reoptimized; never
/// shrinks.
#[derive(Debug, Clone, Default)]
pub struct ExitProfile {
    sites: Vec<FrequentExitSite>,
}

impl ExitProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `site`; false if it was already known
    pub fn add(&mut self, site: FrequentExitSite) -> bool {
        if self.sites.contains(&site) {
            return false;
        }
        self.sites.push(site);
        true
    }

    pub fn has_exit_site(&self, site: FrequentExitSite) -> bool {
        self.sites.contains(&site)
    }

    pub fn exit_sites_for(&self, bytecode_offset: u32) -> Vec<FrequentExitSite> {
        self.sites
            .iter()
            .copied()
            .filter(|site| site.bytecode_offset == bytecode_offset)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrequentExitSite> {
        self.sites.iter()
    }
}

/// Immutable snapshot of an [`ExitProfile`] taken when a compile starts
///
/// Compilers may run off the mutator thread, so they query this copy rather
/// than the live profile.
#[derive(Debug, Clone, Default)]
pub struct QueryableExitProfile {
    sites: FxHashSet<FrequentExitSite>,
}

impl QueryableExitProfile {
    pub fn new(profile: &ExitProfile) -> Self {
        Self {
            sites: profile.iter().copied().collect(),
        }
    }

    pub fn has_exit_site(&self, site: FrequentExitSite) -> bool {
        self.sites.contains(&site)
    }

    pub fn has_exit_site_at(&self, bytecode_offset: u32, kind: ExitKind) -> bool {
        self.has_exit_site(FrequentExitSite::new(bytecode_offset, kind))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
