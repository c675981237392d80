//! The JIT runtime
//!
//! [`JitRuntime`] owns every registered function and drives it through the
//! tiers: the interpreter counts executions until the baseline compiler is
//! worth running, baseline code counts until profiles justify the speculative
//! compiler, and speculative code exits back to baseline when an assumption
//! fails. Executing a tier is simulated: each tier runs the bytecode with its
//! own semantics (baseline consults the inline caches wired into its machine
//! code, optimized code checks its speculations) while the machine code itself
//! is real, linked and patched bytes.
//!
//! All installation and patching happens on the thread that owns the runtime.
//! With `concurrent_jit` the optimizing compiler runs on a worker thread and
//! its results are installed at the next call boundary.

mod interpreter;
mod stats;

pub use stats::{CodeSizePredictor, RuntimeStats};

use crate::bytecode::{Bytecode, FunctionId, Instruction, Slot};
use crate::code_block::{
    CodeBlock, CodeBlockJettisoningWatchpoint, JettisonReason, JitType, SpeculatedAccess,
};
use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::executable::{CodeOwner, CodePatcher, ExecutablePool};
use crate::ic::{attach_hot_path, AccessKind, CallSiteId, HotPath, StubContext, StubState};
use crate::profile::{ExitKind, MemoryPressure};
use crate::structure::{JsObject, Structure, StructureId, StructureTable, Value};
use crate::tiering::{
    link_artifact, BaselineJit, CompilationPlan, CompiledArtifact, Compiler, FunctionExecutable, SpeculatedShape,
    SpeculativeJit, Worklist,
};
use crate::watchpoint::JumpReplacementWatchpoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Nested calls allowed before a call fails
pub const MAX_CALL_DEPTH: usize = 200;

/// How a call finished
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Normal(Slot),
    /// An exception no handler caught
    Throw(Slot),
}

impl Completion {
    pub fn value(&self) -> &Slot {
        match self {
            Completion::Normal(v) | Completion::Throw(v) => v,
        }
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Completion::Throw(_))
    }
}

/// Structures an in-flight optimizing compile speculated on, by bytecode offset
struct PendingSpeculation {
    generation: u64,
    structures: FxHashMap<u32, Rc<Structure>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    baseline_compiles: u64,
    optimizing_compiles: u64,
    compile_failures: u64,
    stale_compilations: u64,
    jettisons: u64,
    reoptimizations: u64,
    osr_exits: u64,
    calls_linked: u64,
    ic_transitions: u64,
}

/// Adaptive JIT runtime
pub struct JitRuntime {
    options: JitOptions,
    pool: ExecutablePool,
    patcher: Arc<dyn CodePatcher>,
    structures: StructureTable,
    root: Rc<Structure>,
    functions: Vec<Rc<FunctionExecutable>>,
    baseline: BaselineJit,
    optimizer: Arc<dyn Compiler>,
    worklist: Option<Worklist>,
    pending: FxHashMap<FunctionId, PendingSpeculation>,
    counters: Counters,
    code_size: CodeSizePredictor,
    rng: StdRng,
    depth: usize,
}

impl JitRuntime {
    /// Create a runtime with its own executable memory pool
    pub fn new(options: JitOptions) -> Result<Self> {
        options.validate()?;
        let pool = ExecutablePool::new(&options);
        Self::with_pool(options, pool)
    }

    /// Create a runtime that allocates code from `pool`
    pub fn with_pool(options: JitOptions, pool: ExecutablePool) -> Result<Self> {
        options.validate()?;
        let optimizer: Arc<dyn Compiler> = Arc::new(SpeculativeJit::new());
        let worklist = if options.concurrent_jit {
            Some(Worklist::new(optimizer.clone())?)
        } else {
            None
        };
        let mut structures = StructureTable::new();
        let root = structures.create_root(None);
        let patcher: Arc<dyn CodePatcher> = Arc::new(pool.clone());
        tracing::debug!(
            budget = pool.budget(),
            concurrent = options.concurrent_jit,
            backend = ?options.executable_backend,
            "jit runtime created"
        );
        Ok(Self {
            options,
            pool,
            patcher,
            structures,
            root,
            functions: Vec::new(),
            baseline: BaselineJit::new(),
            optimizer,
            worklist,
            pending: FxHashMap::default(),
            counters: Counters::default(),
            code_size: CodeSizePredictor::new(),
            rng: StdRng::from_entropy(),
            depth: 0,
        })
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn pool(&self) -> &ExecutablePool {
        &self.pool
    }

    pub fn patcher(&self) -> &dyn CodePatcher {
        self.patcher.as_ref()
    }

    /// Make checkpoint jitter reproducible
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    // ==================== Functions ====================

    /// Register a function; it starts in the interpreter
    pub fn register(&mut self, bytecode: Bytecode) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        let exec = Rc::new(FunctionExecutable::new(id, Arc::new(bytecode)));
        let pressure = self.memory_pressure(0);
        exec.profiled_block().jit_after_warm_up(&self.options, &pressure);
        tracing::debug!(function = %id, name = %exec.bytecode().name(), "function registered");
        self.functions.push(exec);
        id
    }

    pub fn function(&self, id: FunctionId) -> Result<Rc<FunctionExecutable>> {
        self.functions
            .get(id.0 as usize)
            .cloned()
            .ok_or(Error::UnknownFunction(id.0))
    }

    pub fn functions(&self) -> &[Rc<FunctionExecutable>] {
        &self.functions
    }

    /// Call a function and run it to completion
    ///
    /// Finished background compilations are installed first.
    pub fn call(&mut self, id: FunctionId, args: &[Slot]) -> Result<Completion> {
        self.install_completed()?;
        self.invoke(id, args.to_vec())
    }

    fn invoke(&mut self, id: FunctionId, args: Vec<Slot>) -> Result<Completion> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::internal("maximum call depth exceeded"));
        }
        let exec = self.function(id)?;
        let mut block = exec.active();
        if block.is_invalidated() && block.jit_type().is_optimizing() {
            self.jettison_invalidated(&exec, &block);
            block = exec.active();
        }
        self.depth += 1;
        let result = self.execute(&exec, block, args);
        self.depth -= 1;
        result
    }

    // ==================== Objects ====================

    /// New object with `properties` added in order
    ///
    /// Objects built from the same property sequence share structures.
    pub fn create_object(&mut self, properties: &[(&str, Value)]) -> Rc<JsObject> {
        let object = JsObject::new(self.root.clone());
        for (name, value) in properties {
            object.put(&mut self.structures, name, *value);
        }
        object
    }

    pub fn root_structure(&self) -> &Rc<Structure> {
        &self.root
    }

    pub fn structures(&self) -> &StructureTable {
        &self.structures
    }

    pub fn structures_mut(&mut self) -> &mut StructureTable {
        &mut self.structures
    }

    /// Kill every structure `is_reachable` rejects; the root always survives
    ///
    /// Returns the number of watchpoints fired.
    pub fn collect_garbage(&mut self, mut is_reachable: impl FnMut(&Structure) -> bool) -> usize {
        let root = self.root.id();
        let fired = self
            .structures
            .collect(|s| s.id() == root || is_reachable(s));
        tracing::debug!(fired, killed = self.structures.killed(), "structures collected");
        fired
    }

    // ==================== Tiering policy ====================

    fn memory_pressure(&mut self, instructions: usize) -> MemoryPressure {
        let added = self.code_size.predict(instructions);
        let multiplier = self.pool.memory_pressure_multiplier(added);
        let pressure = MemoryPressure::new(multiplier, self.options.maximum_execution_counts_between_checkpoints);
        if self.options.randomize_execution_counts_between_checkpoints {
            pressure.with_jitter(self.rng.gen_range(0.5..=1.0))
        } else {
            pressure
        }
    }

    fn stub_context(&self, block: &CodeBlock) -> StubContext<'_> {
        StubContext {
            pool: &self.pool,
            patcher: self.patcher.clone(),
            options: &self.options,
            code_block: block.id().0,
        }
    }

    /// Charge `amount` executions to a profiled block, tiering up on a checkpoint
    pub(crate) fn count_execution(
        &mut self,
        exec: &Rc<FunctionExecutable>,
        block: &Rc<CodeBlock>,
        amount: i32,
    ) -> Result<()> {
        if block.jit_type().is_optimizing() || !block.add_execution_count(amount) {
            return Ok(());
        }
        let pressure = self.memory_pressure(exec.bytecode().instruction_count());
        if !block.check_if_threshold_reached(&pressure) {
            return Ok(());
        }
        match block.jit_type() {
            JitType::Interpreter => self.compile_baseline(exec),
            JitType::Baseline => self.consider_optimizing(exec),
            JitType::Optimizing => Ok(()),
        }
    }

    fn compile_failed(&mut self, block: &CodeBlock, error: &Error, pressure: &MemoryPressure) {
        self.counters.compile_failures += 1;
        tracing::warn!(code_block = %block.id(), function = %block.function(), %error, "compilation failed");
        if block.note_compile_failure(&self.options) {
            block.dont_optimize_anytime_soon();
        } else if block.jit_type() == JitType::Interpreter {
            block.jit_after_warm_up(&self.options, pressure);
        } else {
            block.optimize_after_warm_up(&self.options, pressure);
        }
    }

    fn attach_hot_paths(&self, block: &CodeBlock, hot_paths: Vec<(CallSiteId, HotPath)>) -> Result<()> {
        let cx = self.stub_context(block);
        for (site, hot) in hot_paths {
            attach_hot_path(block.stub_info(site)?, hot, &cx)?;
        }
        Ok(())
    }

    /// Upgrade the profiled block from interpreter to baseline in place
    fn compile_baseline(&mut self, exec: &Rc<FunctionExecutable>) -> Result<()> {
        let block = exec.profiled_block().clone();
        let instructions = exec.bytecode().instruction_count();
        let pressure = self.memory_pressure(instructions);
        let plan = CompilationPlan::baseline(exec.id(), exec.bytecode().clone(), exec.generation(), &self.options);
        let linked = self.baseline.compile(&plan).and_then(|artifact| {
            link_artifact(
                artifact,
                &self.pool,
                CodeOwner::CodeBlock(block.id().0),
                self.options.branch_compaction,
            )
        });
        let linked = match linked {
            Ok(Some(linked)) => linked,
            Ok(None) => {
                tracing::debug!(function = %exec.id(), "baseline compile skipped, executable memory exhausted");
                block.jit_after_warm_up(&self.options, &pressure);
                return Ok(());
            }
            Err(error) => {
                self.compile_failed(&block, &error, &pressure);
                return Ok(());
            }
        };

        self.code_size.record(linked.code.size(), instructions);
        block.install_code(linked.code, JitType::Baseline);
        self.attach_hot_paths(&block, linked.hot_paths)?;
        block.optimize_after_warm_up(&self.options, &pressure);
        self.counters.baseline_compiles += 1;
        Ok(())
    }

    fn consider_optimizing(&mut self, exec: &Rc<FunctionExecutable>) -> Result<()> {
        let block = exec.profiled_block().clone();
        let pressure = self.memory_pressure(exec.bytecode().instruction_count());
        if exec.is_compiling() || exec.optimized_block().is_some() {
            block.optimize_after_warm_up(&self.options, &pressure);
            return Ok(());
        }
        if !block.should_optimize_now(&self.options, &pressure) {
            return Ok(());
        }

        let plan = self.plan_optimization(exec, &block);
        match &self.worklist {
            Some(worklist) => {
                exec.set_compiling(true);
                worklist.enqueue(plan)?;
                block.optimize_after_warm_up(&self.options, &pressure);
                Ok(())
            }
            None => {
                let generation = plan.generation;
                let result = self.optimizer.compile(&plan);
                self.finish_optimization(exec, generation, result).map(|_| ())
            }
        }
    }

    /// Snapshot profiles and monomorphic get sites into a plan
    fn plan_optimization(&mut self, exec: &Rc<FunctionExecutable>, block: &CodeBlock) -> CompilationPlan {
        block.update_all_predictions();
        let mut plan = CompilationPlan::optimizing(
            exec.id(),
            exec.bytecode().clone(),
            exec.generation(),
            block.queryable_exit_profile(),
            &self.options,
        );
        for profile in block.value_profiles().iter() {
            if let Some(prediction) = profile.prediction() {
                plan = plan.with_prediction(profile.bytecode_offset(), prediction);
            }
        }

        let mut structures = FxHashMap::default();
        for info in block.stub_infos() {
            let info = info.borrow();
            if info.access_kind() != AccessKind::GetById {
                continue;
            }
            if let StubState::SelfSingle(access) = info.state() {
                if access.structure.is_cacheable() {
                    let shape = SpeculatedShape { structure: access.structure.id(), offset: access.offset };
                    plan = plan.with_speculation(info.bytecode_offset(), shape);
                    structures.insert(info.bytecode_offset(), access.structure.clone());
                }
            }
        }
        self.pending.insert(
            exec.id(),
            PendingSpeculation { generation: plan.generation, structures },
        );
        tracing::debug!(
            function = %exec.id(),
            generation = plan.generation,
            predictions = plan.predictions.len(),
            speculations = plan.speculations.len(),
            "optimization planned"
        );
        plan
    }

    /// Install a finished optimizing compile if it is still valid
    ///
    /// Returns whether the code was installed.
    fn finish_optimization(
        &mut self,
        exec: &Rc<FunctionExecutable>,
        generation: u64,
        result: Result<CompiledArtifact>,
    ) -> Result<bool> {
        exec.set_compiling(false);
        let baseline = exec.profiled_block().clone();
        let pressure = self.memory_pressure(exec.bytecode().instruction_count());
        let pending = self.pending.remove(&exec.id());

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(error) => {
                self.compile_failed(&baseline, &error, &pressure);
                return Ok(false);
            }
        };
        let current = exec.generation();
        if generation != current || pending.as_ref().map(|p| p.generation) != Some(generation) {
            self.counters.stale_compilations += 1;
            tracing::debug!(function = %exec.id(), generation, current, "stale compilation dropped");
            baseline.optimize_after_warm_up(&self.options, &pressure);
            return Ok(false);
        }

        let structures = pending.map(|p| p.structures).unwrap_or_default();
        let mut speculated = FxHashMap::default();
        for (offset, shape) in &artifact.speculated_gets {
            match structures.get(offset) {
                Some(structure) if structure.id() == shape.structure && structure.is_cacheable() => {
                    speculated.insert(
                        *offset,
                        SpeculatedAccess { structure: structure.clone(), offset: shape.offset },
                    );
                }
                _ => {
                    self.counters.stale_compilations += 1;
                    tracing::debug!(
                        function = %exec.id(),
                        bytecode_offset = offset,
                        "speculated structure invalidated during compilation"
                    );
                    baseline.optimize_after_warm_up(&self.options, &pressure);
                    return Ok(false);
                }
            }
        }

        let block = CodeBlock::new(exec.id(), JitType::Optimizing, exec.bytecode().clone(), generation);
        block.set_alternative(baseline.clone())?;
        let linked = match link_artifact(
            artifact,
            &self.pool,
            CodeOwner::CodeBlock(block.id().0),
            self.options.branch_compaction,
        ) {
            Ok(Some(linked)) => linked,
            Ok(None) => {
                tracing::debug!(function = %exec.id(), "optimized code dropped, executable memory exhausted");
                baseline.optimize_after_warm_up(&self.options, &pressure);
                return Ok(false);
            }
            Err(error) => {
                self.compile_failed(&baseline, &error, &pressure);
                return Ok(false);
            }
        };

        let mut code = linked.code;
        code.speculated_gets = speculated;
        let region = code.region.clone();
        let points: Vec<_> = code.invalidation_points.values().copied().collect();
        let mut watched: BTreeMap<StructureId, Rc<Structure>> = BTreeMap::new();
        for access in code.speculated_gets.values() {
            watched.insert(access.structure.id(), access.structure.clone());
        }
        block.install_code(code, JitType::Optimizing);
        self.attach_hot_paths(&block, linked.hot_paths)?;

        for structure in watched.values() {
            structure.add_watchpoint(Rc::new(CodeBlockJettisoningWatchpoint::new(&block)));
            for point in &points {
                let watchpoint = JumpReplacementWatchpoint::new(self.patcher.clone(), &region, point.site, point.exit);
                structure.add_watchpoint(Rc::new(watchpoint));
            }
        }

        exec.install_optimized(block, self.patcher.as_ref())?;
        baseline.optimize_after_warm_up(&self.options, &pressure);
        self.counters.optimizing_compiles += 1;
        Ok(true)
    }

    /// Install background compilations that finished since the last call
    fn install_completed(&mut self) -> Result<()> {
        let completed = match &self.worklist {
            Some(worklist) => worklist.drain_completed()?,
            None => return Ok(()),
        };
        for done in completed {
            let exec = self.function(done.function)?;
            self.finish_optimization(&exec, done.generation, done.result)?;
        }
        Ok(())
    }

    /// Block until background compilations finish, then install them
    pub fn wait_for_compilations(&mut self) -> Result<()> {
        if let Some(worklist) = &self.worklist {
            worklist.wait_until_idle()?;
        }
        self.install_completed()
    }

    // ==================== Deoptimization ====================

    fn jettison_invalidated(&mut self, exec: &Rc<FunctionExecutable>, block: &Rc<CodeBlock>) {
        let is_active = exec
            .optimized_block()
            .map(|active| Rc::ptr_eq(&active, block))
            .unwrap_or(false);
        if !is_active {
            return;
        }
        exec.jettison_optimized(JettisonReason::Watchpoint, self.patcher.as_ref());
        self.counters.jettisons += 1;
        let pressure = self.memory_pressure(exec.bytecode().instruction_count());
        exec.profiled_block().optimize_after_warm_up(&self.options, &pressure);
    }

    /// Leave optimized code at `bytecode_offset`; execution resumes in baseline
    pub(crate) fn osr_exit(
        &mut self,
        exec: &Rc<FunctionExecutable>,
        block: &Rc<CodeBlock>,
        bytecode_offset: u32,
        kind: ExitKind,
    ) -> Rc<CodeBlock> {
        self.counters.osr_exits += 1;
        let count = block.record_osr_exit(bytecode_offset, kind);
        tracing::debug!(
            code_block = %block.id(),
            function = %exec.id(),
            bytecode_offset,
            %kind,
            count,
            "osr exit"
        );

        if block.is_invalidated() {
            self.jettison_invalidated(exec, block);
        } else {
            let from_loop = matches!(
                exec.bytecode().instruction_at(bytecode_offset),
                Some(Instruction::LoopHint)
            );
            let reoptimize = if from_loop {
                block.should_reoptimize_from_loop_now(&self.options)
            } else {
                block.should_reoptimize_now(&self.options)
            };
            if reoptimize {
                self.reoptimize(exec, block);
            }
        }
        exec.profiled_block().clone()
    }

    fn reoptimize(&mut self, exec: &Rc<FunctionExecutable>, block: &Rc<CodeBlock>) {
        let tallied = block.tally_frequent_exit_sites(&self.options);
        let is_active = exec
            .optimized_block()
            .map(|active| Rc::ptr_eq(&active, block))
            .unwrap_or(false);
        if is_active {
            exec.jettison_optimized(JettisonReason::Reoptimization, self.patcher.as_ref());
            self.counters.jettisons += 1;
        }
        self.counters.reoptimizations += 1;

        let baseline = exec.profiled_block().clone();
        let pressure = self.memory_pressure(exec.bytecode().instruction_count());
        if baseline.count_reoptimization(&self.options) {
            baseline.dont_optimize_anytime_soon();
        } else {
            baseline.optimize_after_warm_up(&self.options, &pressure);
        }
        tracing::info!(
            function = %exec.id(),
            tallied,
            retries = baseline.reoptimization_retry_counter(),
            "reoptimizing"
        );
    }

    // ==================== Stats ====================

    pub(crate) fn note_ic_transition(&mut self) {
        self.counters.ic_transitions += 1;
    }

    pub(crate) fn note_call_linked(&mut self) {
        self.counters.calls_linked += 1;
    }

    pub fn stats(&self) -> RuntimeStats {
        let mut stats = RuntimeStats {
            functions: self.functions.len(),
            baseline_compiles: self.counters.baseline_compiles,
            optimizing_compiles: self.counters.optimizing_compiles,
            compile_failures: self.counters.compile_failures,
            stale_compilations: self.counters.stale_compilations,
            jettisons: self.counters.jettisons,
            reoptimizations: self.counters.reoptimizations,
            osr_exits: self.counters.osr_exits,
            calls_linked: self.counters.calls_linked,
            ic_transitions: self.counters.ic_transitions,
            executable_bytes: self.pool.bytes_allocated(),
            live_regions: self.pool.live_regions(),
            structures_killed: self.structures.killed(),
            ..Default::default()
        };
        let pool = self.pool.stats();
        stats.patches = pool.patches;
        stats.failed_allocations = pool.failed_allocations;

        for exec in &self.functions {
            match exec.tier() {
                JitType::Interpreter => stats.interpreter_functions += 1,
                JitType::Baseline => stats.baseline_functions += 1,
                JitType::Optimizing => stats.optimized_functions += 1,
            }
            let blocks = std::iter::once(exec.profiled_block().clone()).chain(exec.optimized_block());
            for block in blocks {
                for info in block.stub_infos() {
                    *stats
                        .ic_states
                        .entry(info.borrow().state().kind().to_string())
                        .or_insert(0) += 1;
                }
            }
        }
        stats
    }
}

impl fmt::Debug for JitRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitRuntime")
            .field("functions", &self.functions.len())
            .field("pool", &self.pool)
            .field("structures", &self.structures)
            .field("concurrent", &self.worklist.is_some())
            .finish()
    }
}
