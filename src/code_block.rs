//! Compiled-code records
//!
//! A [`CodeBlock`] is one tier of one function. The profiled block starts in
//! the interpreter and is upgraded in place to baseline code; optimizing
//! blocks are separate records whose `alternative` is the baseline block they
//! fall back to on OSR exit or jettison.
//!
//! Each block owns its inline-cache sites, value profiles, execution counter,
//! exit bookkeeping and the machine code installed for it. All mutation
//! happens on the mutator thread, so state lives in `Cell`/`RefCell`.

use crate::bytecode::{Bytecode, FunctionId, HandlerInfo};
use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::executable::{repatch_jump, CodePatcher, ExecutableRegion};
use crate::ic::{CallSiteId, StructureStubInfo};
use crate::profile::{
    ExecutionCounter, ExitKind, ExitProfile, FrequentExitSite, MemoryPressure, ProfileSummary,
    QueryableExitProfile, ValueProfile,
};
use crate::structure::Structure;
use crate::watchpoint::Watchpoint;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// Size scaling of optimization thresholds: d + a * sqrt(n + b) + c * n
const SCALING_A: f64 = 0.061504;
const SCALING_B: f64 = 1.02406;
const SCALING_C: f64 = 0.0;
const SCALING_D: f64 = 0.825914;

static NEXT_CODE_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a code block, unique for the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockId(pub u64);

impl CodeBlockId {
    fn next() -> Self {
        CodeBlockId(NEXT_CODE_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CodeBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Execution tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JitType {
    Interpreter,
    Baseline,
    Optimizing,
}

impl JitType {
    pub fn is_optimizing(self) -> bool {
        self == JitType::Optimizing
    }

    /// Whether machine code backs this tier
    pub fn has_machine_code(self) -> bool {
        self != JitType::Interpreter
    }

    pub fn name(self) -> &'static str {
        match self {
            JitType::Interpreter => "Interpreter",
            JitType::Baseline => "Baseline",
            JitType::Optimizing => "Optimizing",
        }
    }
}

impl fmt::Display for JitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ==================== Machine code ====================

/// A property access the optimizing tier compiled as a direct load
#[derive(Debug, Clone)]
pub struct SpeculatedAccess {
    pub structure: Rc<Structure>,
    pub offset: u32,
}

/// Patchable jump that starts out falling through and is redirected to an
/// OSR exit when a watched structure is invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationPoint {
    pub site: usize,
    pub continuation: usize,
    pub exit: usize,
}

/// Addresses of one outgoing call in machine code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteCode {
    /// Region of the caller's code
    pub region: u64,
    /// Patchable jump to the callee entry
    pub site: usize,
    /// Generic call path the site points to while unlinked
    pub slow_path: usize,
}

/// Installed machine code of a code block
#[derive(Debug)]
pub struct JitCode {
    pub region: Arc<ExecutableRegion>,
    pub entry: usize,
    pub unlinked_size: usize,
    /// Keyed by bytecode offset of the call instruction
    pub call_sites: FxHashMap<u32, CallSiteCode>,
    /// Machine address of each bytecode jump table
    pub jump_tables: Vec<usize>,
    /// OSR exit ramps keyed by bytecode offset and kind
    pub osr_exits: FxHashMap<(u32, ExitKind), usize>,
    pub speculated_gets: FxHashMap<u32, SpeculatedAccess>,
    /// Adds compiled with an int32 overflow check
    pub speculated_adds: FxHashSet<u32>,
    pub invalidation_points: FxHashMap<u32, InvalidationPoint>,
}

impl JitCode {
    pub fn new(region: Arc<ExecutableRegion>, entry: usize, unlinked_size: usize) -> Self {
        Self {
            region,
            entry,
            unlinked_size,
            call_sites: FxHashMap::default(),
            jump_tables: Vec::new(),
            osr_exits: FxHashMap::default(),
            speculated_gets: FxHashMap::default(),
            speculated_adds: FxHashSet::default(),
            invalidation_points: FxHashMap::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }
}

/// A direct call from another code block into this one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLinkInfo {
    pub caller: CodeBlockId,
    pub bytecode_offset: u32,
    pub code: CallSiteCode,
}

/// Exits taken from one site of an optimizing block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsrExitSite {
    pub bytecode_offset: u32,
    pub kind: ExitKind,
    pub count: u32,
}

/// Why a code block was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JettisonReason {
    /// Too many OSR exits
    Reoptimization,
    /// A watched structure was invalidated
    Watchpoint,
    /// Replaced by a newer compilation
    Replaced,
}

impl fmt::Display for JettisonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JettisonReason::Reoptimization => "reoptimization",
            JettisonReason::Watchpoint => "watchpoint",
            JettisonReason::Replaced => "replaced",
        })
    }
}

// ==================== CodeBlock ====================

/// One tier of one function
pub struct CodeBlock {
    id: CodeBlockId,
    function: FunctionId,
    jit_type: Cell<JitType>,
    bytecode: Arc<Bytecode>,
    generation: u64,
    execute_counter: Cell<ExecutionCounter>,
    optimization_delay_counter: Cell<u8>,
    reoptimization_retry_counter: Cell<u32>,
    osr_exit_counter: Cell<u32>,
    compile_failures: Cell<u32>,
    stubs: Vec<Rc<RefCell<StructureStubInfo>>>,
    value_profiles: RefCell<Vec<ValueProfile>>,
    exit_profile: RefCell<ExitProfile>,
    osr_exit_sites: RefCell<Vec<OsrExitSite>>,
    jit_code: RefCell<Option<JitCode>>,
    incoming_calls: RefCell<Vec<CallLinkInfo>>,
    /// Blocks this block's machine code has been linked to
    outgoing_calls: RefCell<Vec<Weak<CodeBlock>>>,
    alternative: RefCell<Option<Rc<CodeBlock>>>,
    jettisoned: Cell<bool>,
    invalidated: Cell<bool>,
}

impl CodeBlock {
    /// Create a block for `bytecode` with fresh sites and profiles
    pub fn new(function: FunctionId, jit_type: JitType, bytecode: Arc<Bytecode>, generation: u64) -> Rc<Self> {
        let stubs = bytecode
            .call_sites()
            .iter()
            .map(|site| {
                Rc::new(RefCell::new(StructureStubInfo::new(
                    site.id,
                    site.kind,
                    site.bytecode_offset,
                    site.property.clone(),
                )))
            })
            .collect();
        let value_profiles = bytecode
            .value_profile_offsets()
            .iter()
            .map(|&offset| ValueProfile::new(offset))
            .collect();
        let block = Rc::new(Self {
            id: CodeBlockId::next(),
            function,
            jit_type: Cell::new(jit_type),
            bytecode,
            generation,
            execute_counter: Cell::new(ExecutionCounter::new()),
            optimization_delay_counter: Cell::new(0),
            reoptimization_retry_counter: Cell::new(0),
            osr_exit_counter: Cell::new(0),
            compile_failures: Cell::new(0),
            stubs,
            value_profiles: RefCell::new(value_profiles),
            exit_profile: RefCell::new(ExitProfile::new()),
            osr_exit_sites: RefCell::new(Vec::new()),
            jit_code: RefCell::new(None),
            incoming_calls: RefCell::new(Vec::new()),
            outgoing_calls: RefCell::new(Vec::new()),
            alternative: RefCell::new(None),
            jettisoned: Cell::new(false),
            invalidated: Cell::new(false),
        });
        tracing::trace!(code_block = %block.id, function = %function, tier = %jit_type, "code block created");
        block
    }

    pub fn id(&self) -> CodeBlockId {
        self.id
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn jit_type(&self) -> JitType {
        self.jit_type.get()
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    /// Function generation this block was created in
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_jettisoned(&self) -> bool {
        self.jettisoned.get()
    }

    /// Whether a watched assumption of this block was broken
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.get()
    }

    pub fn invalidate(&self) {
        if !self.invalidated.replace(true) {
            tracing::debug!(code_block = %self.id, "code block invalidated");
        }
    }

    // ==================== Inline caches and profiles ====================

    pub fn stub_infos(&self) -> &[Rc<RefCell<StructureStubInfo>>] {
        &self.stubs
    }

    pub fn stub_info(&self, site: CallSiteId) -> Result<&Rc<RefCell<StructureStubInfo>>> {
        self.stubs.get(site.0 as usize).ok_or(Error::UnknownCallSite(site.0))
    }

    /// Value profile of the instruction at `bytecode_offset`
    pub fn with_value_profile<R>(&self, bytecode_offset: u32, f: impl FnOnce(&mut ValueProfile) -> R) -> Option<R> {
        let mut profiles = self.value_profiles.borrow_mut();
        let index = profiles
            .binary_search_by_key(&bytecode_offset, |p| p.bytecode_offset())
            .ok()?;
        Some(f(&mut profiles[index]))
    }

    pub fn value_profiles(&self) -> Ref<'_, Vec<ValueProfile>> {
        self.value_profiles.borrow()
    }

    /// Fold all value profile buckets into predictions
    pub fn update_all_predictions(&self) -> ProfileSummary {
        ProfileSummary::update_all(self.value_profiles.borrow_mut().iter_mut())
    }

    // ==================== Tier-up counter ====================

    pub fn execute_counter(&self) -> ExecutionCounter {
        self.execute_counter.get()
    }

    fn update_counter(&self, f: impl FnOnce(&mut ExecutionCounter) -> bool) -> bool {
        let mut counter = self.execute_counter.get();
        let result = f(&mut counter);
        self.execute_counter.set(counter);
        result
    }

    /// Hot path: true when a checkpoint is reached
    pub fn add_execution_count(&self, amount: i32) -> bool {
        self.update_counter(|c| c.add(amount))
    }

    /// Slow path run at a checkpoint
    pub fn check_if_threshold_reached(&self, pressure: &MemoryPressure) -> bool {
        self.update_counter(|c| c.check_if_threshold_crossed_and_set(pressure))
    }

    /// Arm the interpreter's counter for baseline compilation
    pub fn jit_after_warm_up(&self, options: &JitOptions, pressure: &MemoryPressure) {
        self.update_counter(|c| {
            c.set_new_threshold(options.threshold_for_jit_after_warm_up, pressure);
            false
        });
    }

    pub fn jit_soon(&self, options: &JitOptions, pressure: &MemoryPressure) {
        self.update_counter(|c| {
            c.set_new_threshold(options.threshold_for_jit_soon, pressure);
            false
        });
    }

    /// Larger functions wait longer before being optimized
    pub fn optimization_threshold_scaling_factor(&self) -> f64 {
        let n = self.bytecode.instruction_count() as f64;
        SCALING_D + SCALING_A * (n + SCALING_B).sqrt() + SCALING_C * n
    }

    fn adjusted_counter_value(&self, desired_threshold: i32) -> i32 {
        let retries = self.reoptimization_retry_counter.get().min(30) as i32;
        let multiplier = 2f64.powi(retries) * self.optimization_threshold_scaling_factor();
        let result = desired_threshold as f64 * multiplier;
        if result >= i32::MAX as f64 {
            i32::MAX
        } else if result < 1.0 {
            1
        } else {
            result as i32
        }
    }

    pub fn counter_value_for_optimize_after_warm_up(&self, options: &JitOptions) -> i32 {
        self.adjusted_counter_value(options.threshold_for_optimize_after_warm_up)
    }

    pub fn counter_value_for_optimize_after_long_warm_up(&self, options: &JitOptions) -> i32 {
        self.adjusted_counter_value(options.threshold_for_optimize_after_long_warm_up)
    }

    pub fn counter_value_for_optimize_soon(&self, options: &JitOptions) -> i32 {
        self.adjusted_counter_value(options.threshold_for_optimize_soon)
    }

    fn set_optimization_threshold(&self, threshold: i32, pressure: &MemoryPressure) {
        self.update_counter(|c| {
            c.set_new_threshold(threshold, pressure);
            false
        });
    }

    pub fn optimize_after_warm_up(&self, options: &JitOptions, pressure: &MemoryPressure) {
        let threshold = self.counter_value_for_optimize_after_warm_up(options);
        self.set_optimization_threshold(threshold, pressure);
    }

    pub fn optimize_after_long_warm_up(&self, options: &JitOptions, pressure: &MemoryPressure) {
        let threshold = self.counter_value_for_optimize_after_long_warm_up(options);
        self.set_optimization_threshold(threshold, pressure);
    }

    pub fn optimize_soon(&self, options: &JitOptions, pressure: &MemoryPressure) {
        let threshold = self.counter_value_for_optimize_soon(options);
        self.set_optimization_threshold(threshold, pressure);
    }

    /// Trip the counter on the next checkpoint
    pub fn optimize_next_invocation(&self, pressure: &MemoryPressure) {
        self.set_optimization_threshold(0, pressure);
    }

    pub fn dont_optimize_anytime_soon(&self) {
        self.update_counter(|c| {
            c.defer_indefinitely();
            false
        });
        tracing::info!(code_block = %self.id, function = %self.function, "tier-up deferred indefinitely");
    }

    pub fn optimization_delay_counter(&self) -> u8 {
        self.optimization_delay_counter.get()
    }

    /// Whether profiles are mature enough to optimize
    ///
    /// Gives up waiting after `maximum_optimization_delay` delays. Otherwise
    /// requires live and full enough value profiles and at least
    /// `minimum_optimization_delay` delays; on refusal the block is re-armed
    /// with the warm-up threshold.
    pub fn should_optimize_now(&self, options: &JitOptions, pressure: &MemoryPressure) -> bool {
        let delay = self.optimization_delay_counter.get();
        if delay >= options.maximum_optimization_delay {
            return true;
        }
        let summary = self.update_all_predictions();
        if summary.liveness() >= options.desired_profile_liveness_rate
            && summary.fullness() >= options.desired_profile_fullness_rate
            && delay as u32 + 1 >= options.minimum_optimization_delay as u32
        {
            return true;
        }
        self.optimization_delay_counter.set(delay.saturating_add(1));
        self.optimize_after_warm_up(options, pressure);
        tracing::debug!(
            code_block = %self.id,
            delay = delay + 1,
            liveness = summary.liveness(),
            fullness = summary.fullness(),
            "optimization delayed for profiling"
        );
        false
    }

    pub fn compile_failures(&self) -> u32 {
        self.compile_failures.get()
    }

    /// Count a failed compilation of the next tier; true when the function
    /// should stop trying
    pub fn note_compile_failure(&self, options: &JitOptions) -> bool {
        let failures = self.compile_failures.get() + 1;
        self.compile_failures.set(failures);
        failures >= options.max_compile_failures
    }

    // ==================== OSR exits and reoptimization ====================

    pub fn osr_exit_counter(&self) -> u32 {
        self.osr_exit_counter.get()
    }

    pub fn reoptimization_retry_counter(&self) -> u32 {
        self.reoptimization_retry_counter.get()
    }

    /// Record an exit from this (optimizing) block; returns the site's count
    pub fn record_osr_exit(&self, bytecode_offset: u32, kind: ExitKind) -> u32 {
        if kind.is_countable() {
            self.osr_exit_counter.set(self.osr_exit_counter.get().saturating_add(1));
        }
        let mut sites = self.osr_exit_sites.borrow_mut();
        let count = match sites
            .iter_mut()
            .find(|s| s.bytecode_offset == bytecode_offset && s.kind == kind)
        {
            Some(site) => {
                site.count = site.count.saturating_add(1);
                site.count
            }
            None => {
                sites.push(OsrExitSite { bytecode_offset, kind, count: 1 });
                1
            }
        };
        tracing::trace!(code_block = %self.id, bytecode_offset, %kind, count, "osr exit");
        count
    }

    pub fn osr_exit_sites(&self) -> Vec<OsrExitSite> {
        self.osr_exit_sites.borrow().clone()
    }

    fn exit_count_threshold(&self, base: u32) -> u32 {
        let retries = if self.jit_type().is_optimizing() {
            self.alternative_baseline()
                .map(|b| b.reoptimization_retry_counter())
                .unwrap_or(0)
        } else {
            self.reoptimization_retry_counter()
        };
        base.checked_shl(retries).unwrap_or(u32::MAX).max(base)
    }

    pub fn exit_count_threshold_for_reoptimization(&self, options: &JitOptions) -> u32 {
        self.exit_count_threshold(options.osr_exit_count_for_reoptimization)
    }

    pub fn exit_count_threshold_for_reoptimization_from_loop(&self, options: &JitOptions) -> u32 {
        self.exit_count_threshold(options.osr_exit_count_for_reoptimization_from_loop)
    }

    pub fn should_reoptimize_now(&self, options: &JitOptions) -> bool {
        self.osr_exit_counter.get() >= self.exit_count_threshold_for_reoptimization(options)
    }

    pub fn should_reoptimize_from_loop_now(&self, options: &JitOptions) -> bool {
        self.osr_exit_counter.get() >= self.exit_count_threshold_for_reoptimization_from_loop(options)
    }

    /// Bump the retry counter (capped); true when the cap was already reached
    pub fn count_reoptimization(&self, options: &JitOptions) -> bool {
        let current = self.reoptimization_retry_counter.get();
        if current >= options.reoptimization_retry_counter_max {
            return true;
        }
        self.reoptimization_retry_counter.set(current + 1);
        false
    }

    /// Copy sites that exited often into the baseline block's exit profile
    ///
    /// Returns the number of sites newly recorded there.
    pub fn tally_frequent_exit_sites(&self, options: &JitOptions) -> usize {
        let Some(baseline) = self.alternative_baseline() else {
            return 0;
        };
        let mut profile = baseline.exit_profile.borrow_mut();
        let mut added = 0;
        for site in self.osr_exit_sites.borrow().iter() {
            if site.count >= options.frequent_exit_site_threshold
                && profile.add(FrequentExitSite::new(site.bytecode_offset, site.kind))
            {
                tracing::debug!(
                    code_block = %baseline.id,
                    bytecode_offset = site.bytecode_offset,
                    kind = %site.kind,
                    count = site.count,
                    "frequent exit site"
                );
                added += 1;
            }
        }
        added
    }

    pub fn exit_profile(&self) -> Ref<'_, ExitProfile> {
        self.exit_profile.borrow()
    }

    pub fn add_frequent_exit_site(&self, site: FrequentExitSite) -> bool {
        self.exit_profile.borrow_mut().add(site)
    }

    pub fn queryable_exit_profile(&self) -> QueryableExitProfile {
        QueryableExitProfile::new(&self.exit_profile.borrow())
    }

    // ==================== Alternative chain ====================

    pub fn alternative(&self) -> Option<Rc<CodeBlock>> {
        self.alternative.borrow().clone()
    }

    /// Link `alternative` as the tier this block falls back to
    ///
    /// Refuses links that would make the chain cyclic or not end at a
    /// baseline block.
    pub fn set_alternative(&self, alternative: Rc<CodeBlock>) -> Result<()> {
        let mut seen = FxHashSet::default();
        seen.insert(self.id);
        let mut current = Some(alternative.clone());
        let mut last_tier = None;
        while let Some(block) = current {
            if !seen.insert(block.id) {
                return Err(Error::CyclicAlternative(block.id.0));
            }
            last_tier = Some(block.jit_type());
            current = block.alternative();
        }
        if last_tier.map(|t| t.is_optimizing()).unwrap_or(true) {
            return Err(Error::internal(format!(
                "alternative chain of {} does not end at a baseline block",
                self.id
            )));
        }
        *self.alternative.borrow_mut() = Some(alternative);
        Ok(())
    }

    /// Baseline block at the bottom of this block's alternative chain
    fn alternative_baseline(&self) -> Option<Rc<CodeBlock>> {
        let mut current = self.alternative()?;
        while let Some(next) = current.alternative() {
            current = next;
        }
        (!current.jit_type().is_optimizing()).then_some(current)
    }

    /// Bottom of the alternative chain (self for non-optimizing blocks)
    pub fn baseline_version(self: &Rc<Self>) -> Option<Rc<CodeBlock>> {
        let mut current = self.clone();
        while let Some(next) = current.alternative() {
            current = next;
        }
        if current.jit_type().is_optimizing() {
            None
        } else {
            Some(current)
        }
    }

    // ==================== Machine code and calls ====================

    pub fn jit_code(&self) -> Ref<'_, Option<JitCode>> {
        self.jit_code.borrow()
    }

    pub fn has_jit_code(&self) -> bool {
        self.jit_code.borrow().is_some()
    }

    /// Entry address of the installed machine code
    pub fn entry(&self) -> Option<usize> {
        self.jit_code.borrow().as_ref().map(|c| c.entry)
    }

    /// Install machine code; the profiled block moves up to `jit_type`
    pub fn install_code(&self, code: JitCode, jit_type: JitType) {
        tracing::info!(
            code_block = %self.id,
            function = %self.function,
            from = %self.jit_type.get(),
            to = %jit_type,
            size = code.size(),
            unlinked_size = code.unlinked_size,
            "code installed"
        );
        self.jit_type.set(jit_type);
        *self.jit_code.borrow_mut() = Some(code);
    }

    pub fn call_site_code(&self, bytecode_offset: u32) -> Option<CallSiteCode> {
        self.jit_code
            .borrow()
            .as_ref()
            .and_then(|c| c.call_sites.get(&bytecode_offset).copied())
    }

    pub fn jump_table_address(&self, table: u32) -> Option<usize> {
        self.jit_code
            .borrow()
            .as_ref()
            .and_then(|c| c.jump_tables.get(table as usize).copied())
    }

    pub fn speculated_get(&self, bytecode_offset: u32) -> Option<SpeculatedAccess> {
        self.jit_code
            .borrow()
            .as_ref()
            .and_then(|c| c.speculated_gets.get(&bytecode_offset).cloned())
    }

    pub fn is_speculated_add(&self, bytecode_offset: u32) -> bool {
        self.jit_code
            .borrow()
            .as_ref()
            .map(|c| c.speculated_adds.contains(&bytecode_offset))
            .unwrap_or(false)
    }

    pub fn invalidation_point(&self, bytecode_offset: u32) -> Option<InvalidationPoint> {
        self.jit_code
            .borrow()
            .as_ref()
            .and_then(|c| c.invalidation_points.get(&bytecode_offset).copied())
    }

    /// Point `caller`'s call site at this block's entry
    ///
    /// The link is recorded on both ends: here so the site can be unlinked
    /// when this block is replaced, and on the caller so jettisoning the
    /// caller withdraws it.
    pub fn link_incoming_call(
        self: &Rc<Self>,
        caller: &CodeBlock,
        bytecode_offset: u32,
        code: CallSiteCode,
        patcher: &dyn CodePatcher,
    ) -> Result<()> {
        if caller.is_jettisoned() {
            return Err(Error::internal(format!("{} is jettisoned and cannot link calls", caller.id)));
        }
        let entry = self
            .entry()
            .ok_or_else(|| Error::internal(format!("{} has no machine code to call", self.id)))?;
        repatch_jump(patcher, code.region, code.site, entry)?;
        let link = CallLinkInfo { caller: caller.id, bytecode_offset, code };
        {
            let mut incoming = self.incoming_calls.borrow_mut();
            incoming.retain(|l| l.code.site != code.site || l.code.region != code.region);
            incoming.push(link);
        }
        let mut outgoing = caller.outgoing_calls.borrow_mut();
        outgoing.retain(|callee| callee.strong_count() > 0);
        if !outgoing.iter().any(|callee| std::ptr::eq(callee.as_ptr(), Rc::as_ptr(self))) {
            outgoing.push(Rc::downgrade(self));
        }
        tracing::trace!(callee = %self.id, caller = %caller.id, "call linked");
        Ok(())
    }

    pub fn incoming_calls(&self) -> usize {
        self.incoming_calls.borrow().len()
    }

    /// Blocks whose code currently calls straight into this one
    pub fn incoming_callers(&self) -> Vec<CodeBlockId> {
        self.incoming_calls.borrow().iter().map(|l| l.caller).collect()
    }

    /// Number of distinct live callees this block is linked to
    pub fn outgoing_calls(&self) -> usize {
        self.outgoing_calls
            .borrow()
            .iter()
            .filter(|callee| callee.strong_count() > 0)
            .count()
    }

    /// Drop every link whose call site lives in `caller`'s code
    fn forget_incoming_calls_from(&self, caller: CodeBlockId) -> usize {
        let mut incoming = self.incoming_calls.borrow_mut();
        let before = incoming.len();
        incoming.retain(|l| l.caller != caller);
        before - incoming.len()
    }

    /// Send every linked caller back through its generic call path
    ///
    /// Callers whose code is already freed are skipped.
    pub fn unlink_incoming_calls(&self, patcher: &dyn CodePatcher) -> usize {
        let links = std::mem::take(&mut *self.incoming_calls.borrow_mut());
        let mut unlinked = 0;
        for link in links {
            match repatch_jump(patcher, link.code.region, link.code.site, link.code.slow_path) {
                Ok(()) => unlinked += 1,
                Err(err) => tracing::trace!(caller = %link.caller, error = %err, "stale call link dropped"),
            }
        }
        unlinked
    }

    /// Discard this block's code
    ///
    /// Callers are unlinked first. Links this block made into other blocks
    /// are withdrawn and its inline-cache sites let go of their hot paths,
    /// so nothing keeps an address inside the freed code.
    pub fn jettison(&self, reason: JettisonReason, patcher: &dyn CodePatcher) {
        if self.jettisoned.replace(true) {
            return;
        }
        let unlinked = self.unlink_incoming_calls(patcher);
        let callees = std::mem::take(&mut *self.outgoing_calls.borrow_mut());
        let withdrawn: usize = callees
            .iter()
            .filter_map(Weak::upgrade)
            .map(|callee| callee.forget_incoming_calls_from(self.id))
            .sum();
        for stub in &self.stubs {
            match stub.try_borrow_mut() {
                Ok(mut info) => info.detach_hot_path(),
                Err(_) => tracing::warn!(code_block = %self.id, "stub busy during jettison"),
            }
        }
        let size = self.jit_code.borrow_mut().take().map(|c| c.size()).unwrap_or(0);
        tracing::info!(
            code_block = %self.id,
            function = %self.function,
            tier = %self.jit_type.get(),
            %reason,
            unlinked,
            withdrawn,
            size,
            "code block jettisoned"
        );
    }

    // ==================== Bytecode side tables ====================

    pub fn handler_for_bytecode_offset(&self, bytecode_offset: u32) -> Option<HandlerInfo> {
        self.bytecode.handler_for(bytecode_offset).copied()
    }

    pub fn line_for_bytecode_offset(&self, bytecode_offset: u32) -> Option<u32> {
        self.bytecode.expression_info(bytecode_offset).map(|(line, _)| line)
    }
}

impl fmt::Display for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} [{}] words={}",
            self.bytecode.name(),
            self.function,
            self.id,
            self.jit_type.get(),
            self.bytecode.length()
        )?;
        if let Some(code) = self.jit_code.borrow().as_ref() {
            write!(f, " code={:#x}+{}", code.entry, code.size())?;
        }
        if let Some(alt) = self.alternative() {
            write!(f, " alternative={}", alt.id)?;
        }
        if self.jettisoned.get() {
            f.write_str(" (jettisoned)")?;
        }
        writeln!(f)?;

        let profiles = self.value_profiles.borrow();
        for (offset, insn) in self.bytecode.instructions() {
            write!(f, "  [{:4}] {}", offset, insn)?;
            if let Some(line) = self.line_for_bytecode_offset(offset) {
                write!(f, "  ; line {}", line)?;
            }
            if let Ok(i) = profiles.binary_search_by_key(&offset, |p| p.bytecode_offset()) {
                if let Some(prediction) = profiles[i].prediction() {
                    write!(f, "  ; predicted {}", prediction)?;
                }
            }
            if let Some(stub) = self.stubs.iter().find(|s| {
                s.try_borrow().map(|s| s.bytecode_offset() == offset).unwrap_or(false)
            }) {
                if let Ok(stub) = stub.try_borrow() {
                    write!(f, "  ; {} {}", stub.site(), stub.state().kind())?;
                }
            }
            writeln!(f)?;
        }
        for site in self.osr_exit_sites.borrow().iter() {
            writeln!(f, "  exit bc#{} {} x{}", site.bytecode_offset, site.kind, site.count)?;
        }
        for site in self.exit_profile.borrow().iter() {
            writeln!(f, "  frequent exit {}", site)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("id", &self.id)
            .field("function", &self.function)
            .field("jit_type", &self.jit_type.get())
            .field("generation", &self.generation)
            .field("jettisoned", &self.jettisoned.get())
            .finish()
    }
}

// ==================== Jettisoning watchpoint ====================

/// Invalidates an optimizing block when a structure it speculated on changes
pub struct CodeBlockJettisoningWatchpoint {
    code_block: Weak<CodeBlock>,
}

impl CodeBlockJettisoningWatchpoint {
    pub fn new(code_block: &Rc<CodeBlock>) -> Self {
        Self { code_block: Rc::downgrade(code_block) }
    }
}

impl Watchpoint for CodeBlockJettisoningWatchpoint {
    fn fire(&self) {
        if let Some(block) = self.code_block.upgrade() {
            block.invalidate();
        }
    }

    fn is_live(&self) -> bool {
        self.code_block
            .upgrade()
            .map(|b| !b.is_jettisoned())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::profile::ObservedType;
    use crate::structure::StructureTable;
    use crate::watchpoint::WatchpointSet;

    fn bytecode() -> Arc<Bytecode> {
        let mut b = BytecodeBuilder::new("f", 1);
        let o = b.param(0);
        let r = b.new_register();
        b.set_position(3, 1);
        b.get_by_id(r, o, "x");
        b.add(r, r, r);
        b.ret(r);
        Arc::new(b.finish().unwrap())
    }

    fn baseline() -> Rc<CodeBlock> {
        CodeBlock::new(FunctionId(0), JitType::Baseline, bytecode(), 0)
    }

    fn optimizing(baseline: &Rc<CodeBlock>) -> Rc<CodeBlock> {
        let block = CodeBlock::new(FunctionId(0), JitType::Optimizing, baseline.bytecode().clone(), 1);
        block.set_alternative(baseline.clone()).unwrap();
        block
    }

    #[test]
    fn test_sites_and_profiles_created_from_bytecode() {
        let block = baseline();
        assert_eq!(block.stub_infos().len(), 1);
        assert!(block.stub_info(CallSiteId(0)).is_ok());
        assert!(matches!(block.stub_info(CallSiteId(4)), Err(Error::UnknownCallSite(4))));
        assert_eq!(block.value_profiles().len(), 2);
        assert!(block.with_value_profile(1, |p| p.record(ObservedType::Int32)).is_some());
        assert!(block.with_value_profile(2, |_| ()).is_none());
        assert_eq!(block.line_for_bytecode_offset(5), Some(3));
    }

    #[test]
    fn test_scaling_factor_grows_with_size() {
        let block = baseline();
        let n = block.bytecode().instruction_count() as f64;
        let expected = 0.825914 + 0.061504 * (n + 1.02406).sqrt();
        assert!((block.optimization_threshold_scaling_factor() - expected).abs() < 1e-9);
        let options = JitOptions::default();
        assert_eq!(
            block.counter_value_for_optimize_after_warm_up(&options),
            (1000.0 * expected) as i32
        );
    }

    #[test]
    fn test_retries_double_thresholds() {
        let block = baseline();
        let options = JitOptions::default();
        let before = block.counter_value_for_optimize_after_warm_up(&options);
        assert!(!block.count_reoptimization(&options));
        let after = block.counter_value_for_optimize_after_warm_up(&options);
        assert!((after - 2 * before).abs() <= 1);
        for _ in 0..options.reoptimization_retry_counter_max - 1 {
            assert!(!block.count_reoptimization(&options));
        }
        assert!(block.count_reoptimization(&options));
        assert_eq!(block.reoptimization_retry_counter(), options.reoptimization_retry_counter_max);
    }

    #[test]
    fn test_optimize_next_invocation_trips_immediately() {
        let block = baseline();
        let pressure = MemoryPressure::none();
        block.optimize_next_invocation(&pressure);
        assert!(block.add_execution_count(1));
        assert!(block.check_if_threshold_reached(&pressure));
        block.dont_optimize_anytime_soon();
        assert!(block.execute_counter().is_deferred_indefinitely());
    }

    #[test]
    fn test_should_optimize_now_waits_for_profiles() {
        let block = baseline();
        let options = JitOptions::default();
        let pressure = MemoryPressure::none();
        assert!(!block.should_optimize_now(&options, &pressure));
        assert_eq!(block.optimization_delay_counter(), 1);

        block.with_value_profile(1, |p| p.record(ObservedType::Int32));
        block.with_value_profile(5, |p| p.record(ObservedType::Int32));
        block.with_value_profile(5, |p| p.record(ObservedType::Int32));
        assert!(block.should_optimize_now(&options, &pressure));
    }

    #[test]
    fn test_should_optimize_after_max_delay() {
        let block = baseline();
        let options = JitOptions::default();
        let pressure = MemoryPressure::none();
        for _ in 0..options.maximum_optimization_delay {
            assert!(!block.should_optimize_now(&options, &pressure));
        }
        assert!(block.should_optimize_now(&options, &pressure));
    }

    #[test]
    fn test_osr_exits_and_tally() {
        let options = JitOptions { frequent_exit_site_threshold: 2, ..JitOptions::default() };
        let base = baseline();
        let opt = optimizing(&base);
        opt.record_osr_exit(1, ExitKind::BadCache);
        opt.record_osr_exit(1, ExitKind::BadCache);
        opt.record_osr_exit(5, ExitKind::Overflow);
        opt.record_osr_exit(5, ExitKind::Uncountable);
        assert_eq!(opt.osr_exit_counter(), 3);
        assert_eq!(opt.tally_frequent_exit_sites(&options), 1);
        assert_eq!(opt.tally_frequent_exit_sites(&options), 0);
        assert!(base
            .queryable_exit_profile()
            .has_exit_site_at(1, ExitKind::BadCache));
        assert!(!base.queryable_exit_profile().has_exit_site_at(5, ExitKind::Overflow));
    }

    #[test]
    fn test_reoptimization_threshold_scales_with_retries() {
        let options = JitOptions::default();
        let base = baseline();
        let opt = optimizing(&base);
        assert_eq!(opt.exit_count_threshold_for_reoptimization(&options), 100);
        base.count_reoptimization(&options);
        base.count_reoptimization(&options);
        assert_eq!(opt.exit_count_threshold_for_reoptimization(&options), 400);
        for _ in 0..400 {
            opt.record_osr_exit(1, ExitKind::BadType);
        }
        assert!(opt.should_reoptimize_now(&options));
    }

    #[test]
    fn test_alternative_chain_must_be_acyclic() {
        let base = baseline();
        let opt = optimizing(&base);
        assert!(Rc::ptr_eq(&opt.baseline_version().unwrap(), &base));
        assert!(matches!(base.set_alternative(opt.clone()), Err(Error::CyclicAlternative(_))));
        let other = CodeBlock::new(FunctionId(0), JitType::Optimizing, base.bytecode().clone(), 2);
        assert!(other.set_alternative(opt.clone()).is_ok());
        let orphan = CodeBlock::new(FunctionId(0), JitType::Optimizing, base.bytecode().clone(), 3);
        let lonely = CodeBlock::new(FunctionId(0), JitType::Optimizing, base.bytecode().clone(), 3);
        assert!(lonely.set_alternative(orphan).is_err());
    }

    #[test]
    fn test_jettison_watchpoint_invalidates_and_dies() {
        let base = baseline();
        let opt = optimizing(&base);
        let mut table = StructureTable::new();
        let structure = table.create_with_properties(None, &["x"]);
        structure.add_watchpoint(Rc::new(CodeBlockJettisoningWatchpoint::new(&opt)));
        structure.invalidate();
        assert!(opt.is_invalidated());

        let w = CodeBlockJettisoningWatchpoint::new(&opt);
        assert!(w.is_live());
        let pool = crate::executable::ExecutablePool::with_budget(
            1024,
            crate::config::ExecutableBackend::Simulated,
            64.0,
        );
        opt.jettison(JettisonReason::Watchpoint, &pool);
        assert!(opt.is_jettisoned());
        assert!(!w.is_live());

        let mut set = WatchpointSet::new();
        set.add(Rc::new(w));
        assert_eq!(set.notify_write(), 0);
    }

    #[test]
    fn test_display_dump() {
        let block = baseline();
        block.with_value_profile(1, |p| p.record(ObservedType::Int32));
        block.update_all_predictions();
        let dump = block.to_string();
        assert!(dump.contains("[Baseline]"));
        assert!(dump.contains("get_by_id r1, r0, ic#0"));
        assert!(dump.contains("predicted int32"));
        assert!(dump.contains("ic#0 Unset"));
    }
}
