//! Reference compilers producing code buffers from bytecode
//!
//! Both compilers translate one bytecode instruction at a time into the
//! portable instruction set. Registers live in a frame addressed through
//! `R7`; every access site gets a patchable hot path with its slow and
//! generic paths out of line, and every call a patchable jump that starts on
//! the virtual-call path.
//!
//! [`SpeculativeJit`] additionally inlines structure checks for sites that
//! were monomorphic in baseline code and int32 overflow checks for adds that
//! only ever produced int32, each guarded by an OSR exit. Sites listed in the
//! plan's exit profile are compiled the baseline way instead.
//!
//! Compilers only see a [`CompilationPlan`], which is `Send`, so the
//! optimizing tier can run on a background worker. Linking and installation
//! happen on the mutator.

use crate::assembler::{CodeBuffer, Condition, Instruction as Asm, Label, Operation, Reg};
use crate::bytecode::{Bytecode, FunctionId, Instruction, Register};
use crate::code_block::JitType;
use crate::config::JitOptions;
use crate::error::{Error, Result};
use crate::ic::{AccessKind, CallSiteId};
use crate::profile::{ExitKind, ObservedType, QueryableExitProfile};
use crate::structure::StructureId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

const FRAME: Reg = Reg::R7;
const JUMP_TABLES: Reg = Reg::R6;
const COUNTER_SLOT: u32 = 0;

fn frame_offset(register: Register) -> u32 {
    register as u32 * 8
}

// ==================== Plans and artifacts ====================

/// A get site the optimizing tier may compile as a direct load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculatedShape {
    pub structure: StructureId,
    pub offset: u32,
}

/// Counter increments baked into lower-tier code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterIncrements {
    pub entry: i32,
    pub loop_back_edge: i32,
    pub ret: i32,
}

impl CounterIncrements {
    pub fn from_options(options: &JitOptions) -> Self {
        Self {
            entry: options.execution_counter_increment_for_entry,
            loop_back_edge: options.execution_counter_increment_for_loop,
            ret: options.execution_counter_increment_for_return,
        }
    }
}

/// Everything a compiler needs, snapshotted on the mutator
#[derive(Debug, Clone)]
pub struct CompilationPlan {
    pub function: FunctionId,
    pub jit_type: JitType,
    pub bytecode: Arc<Bytecode>,
    /// Function generation the plan was taken in
    pub generation: u64,
    pub exit_profile: QueryableExitProfile,
    /// Value predictions keyed by bytecode offset
    pub predictions: FxHashMap<u32, ObservedType>,
    /// Monomorphic get sites keyed by bytecode offset
    pub speculations: FxHashMap<u32, SpeculatedShape>,
    pub increments: CounterIncrements,
}

impl CompilationPlan {
    pub fn baseline(function: FunctionId, bytecode: Arc<Bytecode>, generation: u64, options: &JitOptions) -> Self {
        Self {
            function,
            jit_type: JitType::Baseline,
            bytecode,
            generation,
            exit_profile: QueryableExitProfile::default(),
            predictions: FxHashMap::default(),
            speculations: FxHashMap::default(),
            increments: CounterIncrements::from_options(options),
        }
    }

    pub fn optimizing(
        function: FunctionId,
        bytecode: Arc<Bytecode>,
        generation: u64,
        exit_profile: QueryableExitProfile,
        options: &JitOptions,
    ) -> Self {
        Self {
            jit_type: JitType::Optimizing,
            exit_profile,
            ..Self::baseline(function, bytecode, generation, options)
        }
    }

    pub fn with_prediction(mut self, bytecode_offset: u32, prediction: ObservedType) -> Self {
        self.predictions.insert(bytecode_offset, prediction);
        self
    }

    pub fn with_speculation(mut self, bytecode_offset: u32, shape: SpeculatedShape) -> Self {
        self.speculations.insert(bytecode_offset, shape);
        self
    }
}

/// Labels of one inline-cache site's hot path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcSiteLabels {
    pub site: CallSiteId,
    pub bytecode_offset: u32,
    pub jump_site: Label,
    pub slow_path: Label,
    pub generic_path: Label,
    pub done: Label,
}

/// Labels of one outgoing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLabels {
    pub bytecode_offset: u32,
    pub site: Label,
    pub slow_path: Label,
}

/// An OSR exit ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsrExitLabels {
    pub bytecode_offset: u32,
    pub kind: ExitKind,
    pub ramp: Label,
}

/// A patchable jump that falls through until a watchpoint redirects it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationLabels {
    pub bytecode_offset: u32,
    pub site: Label,
    pub continuation: Label,
    pub exit: Label,
}

/// Unlinked output of a compiler
#[derive(Debug)]
pub struct CompiledArtifact {
    pub function: FunctionId,
    pub jit_type: JitType,
    pub generation: u64,
    pub buffer: CodeBuffer,
    pub entry: Label,
    pub ic_sites: Vec<IcSiteLabels>,
    pub calls: Vec<CallLabels>,
    /// One per bytecode switch table, in table order
    pub jump_tables: Vec<Label>,
    pub osr_exits: Vec<OsrExitLabels>,
    pub speculated_gets: Vec<(u32, SpeculatedShape)>,
    pub speculated_adds: Vec<u32>,
    pub invalidation_points: Vec<InvalidationLabels>,
}

/// Producer of machine code for one tier
pub trait Compiler: Send + Sync {
    fn jit_type(&self) -> JitType;

    fn compile(&self, plan: &CompilationPlan) -> Result<CompiledArtifact>;
}

// ==================== Emitter ====================

enum SlowCase {
    CounterCheck { entry: Label, resume: Label },
    Access { kind: AccessKind, slow: Label, generic: Label, done: Label },
    Call { slow: Label, resume: Label },
    Exit { ramp: Label, bytecode_offset: u32, kind: ExitKind },
}

struct Emitter<'a> {
    plan: &'a CompilationPlan,
    speculative: bool,
    buf: CodeBuffer,
    labels: FxHashMap<u32, Label>,
    slow_cases: Vec<SlowCase>,
    exits: FxHashMap<(u32, ExitKind), Label>,
    ic_sites: Vec<IcSiteLabels>,
    calls: Vec<CallLabels>,
    osr_exits: Vec<OsrExitLabels>,
    speculated_gets: Vec<(u32, SpeculatedShape)>,
    speculated_adds: Vec<u32>,
    invalidation_points: Vec<InvalidationLabels>,
}

impl<'a> Emitter<'a> {
    fn new(plan: &'a CompilationPlan, speculative: bool) -> Self {
        let mut buf = CodeBuffer::new();
        let labels = plan
            .bytecode
            .instructions()
            .map(|(offset, _)| (offset, buf.new_label()))
            .collect();
        Self {
            plan,
            speculative,
            buf,
            labels,
            slow_cases: Vec::new(),
            exits: FxHashMap::default(),
            ic_sites: Vec::new(),
            calls: Vec::new(),
            osr_exits: Vec::new(),
            speculated_gets: Vec::new(),
            speculated_adds: Vec::new(),
            invalidation_points: Vec::new(),
        }
    }

    fn label_for(&self, bytecode_offset: u32) -> Result<Label> {
        self.labels
            .get(&bytecode_offset)
            .copied()
            .ok_or_else(|| Error::internal(format!("no instruction at bc#{}", bytecode_offset)))
    }

    fn load(&mut self, dst: Reg, register: Register) {
        self.buf.emit(Asm::LoadField { dst, base: FRAME, offset: frame_offset(register) });
    }

    fn store(&mut self, src: Reg, register: Register) {
        self.buf.emit(Asm::StoreField { src, base: FRAME, offset: frame_offset(register) });
    }

    fn count(&mut self, amount: i32) -> Result<()> {
        if self.speculative {
            return Ok(());
        }
        self.buf.emit(Asm::AddToCounter { slot: COUNTER_SLOT, amount });
        let entry = self.buf.new_label();
        self.buf.branch(Condition::AboveOrEqual, entry)?;
        let resume = self.buf.here();
        self.slow_cases.push(SlowCase::CounterCheck { entry, resume });
        Ok(())
    }

    fn exit_ramp(&mut self, bytecode_offset: u32, kind: ExitKind) -> Label {
        if let Some(&ramp) = self.exits.get(&(bytecode_offset, kind)) {
            return ramp;
        }
        let ramp = self.buf.new_label();
        self.exits.insert((bytecode_offset, kind), ramp);
        self.osr_exits.push(OsrExitLabels { bytecode_offset, kind, ramp });
        self.slow_cases.push(SlowCase::Exit { ramp, bytecode_offset, kind });
        ramp
    }

    fn invalidation_point(&mut self, bytecode_offset: u32) -> Result<()> {
        if !self.speculative || self.plan.speculations.is_empty() {
            return Ok(());
        }
        let continuation = self.buf.new_label();
        let site = self.buf.patchable_branch(Condition::Always, continuation)?;
        self.buf.bind(continuation);
        let exit = self.exit_ramp(bytecode_offset, ExitKind::UncountableWatchpoint);
        self.invalidation_points.push(InvalidationLabels { bytecode_offset, site, continuation, exit });
        Ok(())
    }

    /// Patchable access with the value in `R0` (and `R1` for puts)
    fn access_hot_path(&mut self, site: CallSiteId, bytecode_offset: u32, kind: AccessKind) -> Result<()> {
        let slow = self.buf.new_label();
        let generic = self.buf.new_label();
        let jump_site = self.buf.patchable_branch(Condition::Always, slow)?;
        let done = self.buf.here();
        self.ic_sites.push(IcSiteLabels {
            site,
            bytecode_offset,
            jump_site,
            slow_path: slow,
            generic_path: generic,
            done,
        });
        self.slow_cases.push(SlowCase::Access { kind, slow, generic, done });
        Ok(())
    }

    fn speculated_get(&mut self, bytecode_offset: u32, shape: SpeculatedShape) -> Result<()> {
        let exit = self.exit_ramp(bytecode_offset, ExitKind::BadCache);
        self.buf.emit(Asm::LoadStructure { dst: Reg::R2, base: Reg::R0 });
        self.buf.load_constant(Reg::R3, shape.structure.0 as u64);
        self.buf.emit(Asm::Compare { lhs: Reg::R2, rhs: Reg::R3 });
        self.buf.branch(Condition::NotEqual, exit)?;
        self.buf.emit(Asm::LoadField { dst: Reg::R0, base: Reg::R0, offset: shape.offset });
        self.speculated_gets.push((bytecode_offset, shape));
        Ok(())
    }

    fn should_speculate_get(&self, bytecode_offset: u32) -> Option<SpeculatedShape> {
        if !self.speculative
            || self
                .plan
                .exit_profile
                .has_exit_site_at(bytecode_offset, ExitKind::BadCache)
        {
            return None;
        }
        self.plan.speculations.get(&bytecode_offset).copied()
    }

    fn should_speculate_add(&self, bytecode_offset: u32) -> bool {
        self.speculative
            && !self
                .plan
                .exit_profile
                .has_exit_site_at(bytecode_offset, ExitKind::Overflow)
            && !self
                .plan
                .exit_profile
                .has_exit_site_at(bytecode_offset, ExitKind::BadType)
            && self
                .plan
                .predictions
                .get(&bytecode_offset)
                .map(|p| p.is_int32())
                .unwrap_or(false)
    }

    fn instruction(&mut self, offset: u32, insn: &Instruction) -> Result<()> {
        let here = self.label_for(offset)?;
        self.buf.bind(here);
        match insn {
            Instruction::Enter => {
                self.count(self.plan.increments.entry)?;
                self.invalidation_point(offset)?;
            }
            Instruction::LoadInt { dst, value } => {
                match i32::try_from(*value) {
                    Ok(imm) => self.buf.emit(Asm::LoadImm32 { dst: Reg::R0, imm }),
                    Err(_) => self.buf.load_constant(Reg::R0, *value as u64),
                }
                self.store(Reg::R0, *dst);
            }
            Instruction::Move { dst, src } => {
                self.load(Reg::R0, *src);
                self.store(Reg::R0, *dst);
            }
            Instruction::Add { dst, lhs, rhs } => {
                self.load(Reg::R0, *lhs);
                self.load(Reg::R1, *rhs);
                let speculate = self.should_speculate_add(offset);
                if speculate {
                    // Boxed (non-int) values carry a structure word
                    let bad_type = self.exit_ramp(offset, ExitKind::BadType);
                    for operand in [Reg::R0, Reg::R1] {
                        self.buf.emit(Asm::LoadStructure { dst: Reg::R2, base: operand });
                        self.buf.emit(Asm::CompareImm32 { lhs: Reg::R2, imm: 0 });
                        self.buf.branch(Condition::NotEqual, bad_type)?;
                    }
                }
                self.buf.emit(Asm::Add { dst: Reg::R0, lhs: Reg::R0, rhs: Reg::R1 });
                if speculate {
                    let exit = self.exit_ramp(offset, ExitKind::Overflow);
                    self.buf.branch(Condition::Overflow, exit)?;
                    self.speculated_adds.push(offset);
                }
                self.store(Reg::R0, *dst);
            }
            Instruction::GetById { dst, base, site } => {
                self.load(Reg::R0, *base);
                match self.should_speculate_get(offset) {
                    Some(shape) => self.speculated_get(offset, shape)?,
                    None => self.access_hot_path(*site, offset, AccessKind::GetById)?,
                }
                self.store(Reg::R0, *dst);
            }
            Instruction::PutById { base, site, value } => {
                self.load(Reg::R0, *base);
                self.load(Reg::R1, *value);
                self.access_hot_path(*site, offset, AccessKind::PutById)?;
            }
            Instruction::Jump { target } => {
                let target = self.label_for(*target)?;
                self.buf.jump(target)?;
            }
            Instruction::JumpIfLess { lhs, rhs, target } => {
                self.load(Reg::R0, *lhs);
                self.load(Reg::R1, *rhs);
                self.buf.emit(Asm::Compare { lhs: Reg::R0, rhs: Reg::R1 });
                let target = self.label_for(*target)?;
                self.buf.branch(Condition::Below, target)?;
            }
            Instruction::LoopHint => {
                self.count(self.plan.increments.loop_back_edge)?;
                self.invalidation_point(offset)?;
            }
            Instruction::Switch { table, scrutinee, default } => {
                let entries = self
                    .plan
                    .bytecode
                    .jump_table(*table)
                    .map(|t| (t.min, t.branch_offsets.len()))
                    .ok_or_else(|| Error::internal(format!("missing jump table {}", table)))?;
                self.load(Reg::R0, *scrutinee);
                self.buf.emit(Asm::LoadImm32 { dst: Reg::R1, imm: entries.0 });
                self.buf.emit(Asm::Compare { lhs: Reg::R0, rhs: Reg::R1 });
                let default = self.label_for(*default)?;
                self.buf.branch(Condition::Below, default)?;
                self.buf.emit(Asm::CompareImm32 {
                    lhs: Reg::R0,
                    imm: entries.0.saturating_add(entries.1 as i32),
                });
                self.buf.branch(Condition::AboveOrEqual, default)?;
                // Indirect jump through the table entry
                self.buf.emit(Asm::LoadField { dst: Reg::R1, base: JUMP_TABLES, offset: *table });
            }
            Instruction::Call { dst, args, .. } => {
                for (index, arg) in args.iter().enumerate() {
                    self.load(Reg::R0, *arg);
                    self.buf.emit(Asm::StoreField {
                        src: Reg::R0,
                        base: Reg::R5,
                        offset: index as u32 * 8,
                    });
                }
                let slow = self.buf.new_label();
                let site = self.buf.patchable_branch(Condition::Always, slow)?;
                let resume = self.buf.here();
                self.calls.push(CallLabels { bytecode_offset: offset, site, slow_path: slow });
                self.slow_cases.push(SlowCase::Call { slow, resume });
                self.store(Reg::R0, *dst);
            }
            Instruction::Throw { value } => {
                self.load(Reg::R0, *value);
                self.buf.emit(Asm::CallOperation { operation: Operation::Throw });
            }
            Instruction::Return { value } => {
                self.count(self.plan.increments.ret)?;
                self.load(Reg::R0, *value);
                self.buf.emit(Asm::Return);
            }
        }
        Ok(())
    }

    fn slow_paths(&mut self) -> Result<()> {
        for case in std::mem::take(&mut self.slow_cases) {
            match case {
                SlowCase::CounterCheck { entry, resume } => {
                    self.buf.bind(entry);
                    self.buf.emit(Asm::CallOperation { operation: Operation::OptimizeCheck });
                    self.buf.jump(resume)?;
                }
                SlowCase::Access { kind, slow, generic, done } => {
                    let (miss, fallback) = match kind {
                        AccessKind::GetById => (Operation::GetByIdMiss, Operation::GetByIdGeneric),
                        AccessKind::PutById => (Operation::PutByIdMiss, Operation::PutByIdGeneric),
                    };
                    self.buf.bind(slow);
                    self.buf.emit(Asm::CallOperation { operation: miss });
                    self.buf.jump(done)?;
                    self.buf.bind(generic);
                    self.buf.emit(Asm::CallOperation { operation: fallback });
                    self.buf.jump(done)?;
                }
                SlowCase::Call { slow, resume } => {
                    self.buf.bind(slow);
                    self.buf.emit(Asm::CallOperation { operation: Operation::VirtualCall });
                    self.buf.jump(resume)?;
                }
                SlowCase::Exit { ramp, bytecode_offset, kind } => {
                    self.buf.bind(ramp);
                    self.buf.emit(Asm::LoadImm32 { dst: Reg::R0, imm: bytecode_offset as i32 });
                    self.buf.emit(Asm::LoadImm32 { dst: Reg::R1, imm: kind as i32 });
                    self.buf.emit(Asm::CallOperation { operation: Operation::OsrExit });
                    self.buf.emit(Asm::Return);
                }
            }
        }
        Ok(())
    }

    fn jump_tables(&mut self) -> Result<Vec<Label>> {
        let plan = self.plan;
        let mut starts = Vec::new();
        for (offset, insn) in plan.bytecode.instructions() {
            let Instruction::Switch { table, default, .. } = insn else {
                continue;
            };
            let Some(jump_table) = plan.bytecode.jump_table(*table) else {
                continue;
            };
            if *table as usize != starts.len() {
                return Err(Error::internal(format!(
                    "switch at bc#{} uses table {} out of order",
                    offset, table
                )));
            }
            let mut targets = Vec::with_capacity(jump_table.branch_offsets.len());
            for target in &jump_table.branch_offsets {
                targets.push(self.label_for(target.unwrap_or(*default))?);
            }
            let (_, start) = self.buf.emit_jump_table(targets);
            starts.push(start);
        }
        Ok(starts)
    }

    fn finish(mut self) -> Result<CompiledArtifact> {
        let entry = self.label_for(0)?;
        let bytecode = self.plan.bytecode.clone();
        for (offset, insn) in bytecode.instructions() {
            self.instruction(offset, insn)?;
        }
        self.slow_paths()?;
        self.buf.flush_constant_pool(false)?;
        let jump_tables = self.jump_tables()?;

        Ok(CompiledArtifact {
            function: self.plan.function,
            jit_type: self.plan.jit_type,
            generation: self.plan.generation,
            buffer: self.buf,
            entry,
            ic_sites: self.ic_sites,
            calls: self.calls,
            jump_tables,
            osr_exits: self.osr_exits,
            speculated_gets: self.speculated_gets,
            speculated_adds: self.speculated_adds,
            invalidation_points: self.invalidation_points,
        })
    }
}

// ==================== Compilers ====================

/// Template compiler for the baseline tier
#[derive(Debug, Clone, Copy)]
pub struct BaselineJit;

impl BaselineJit {
    pub fn new() -> Self {
        BaselineJit
    }
}

impl Default for BaselineJit {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for BaselineJit {
    fn jit_type(&self) -> JitType {
        JitType::Baseline
    }

    fn compile(&self, plan: &CompilationPlan) -> Result<CompiledArtifact> {
        let artifact = Emitter::new(plan, false).finish()?;
        tracing::trace!(
            function = %plan.function,
            bytes = artifact.buffer.offset(),
            ic_sites = artifact.ic_sites.len(),
            "baseline code generated"
        );
        Ok(artifact)
    }
}

/// Profile-driven compiler for the optimizing tier
#[derive(Debug, Clone, Copy)]
pub struct SpeculativeJit;

impl SpeculativeJit {
    pub fn new() -> Self {
        SpeculativeJit
    }
}

impl Default for SpeculativeJit {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for SpeculativeJit {
    fn jit_type(&self) -> JitType {
        JitType::Optimizing
    }

    fn compile(&self, plan: &CompilationPlan) -> Result<CompiledArtifact> {
        if plan.jit_type != JitType::Optimizing {
            return Err(Error::internal(format!(
                "speculative compiler given a {} plan",
                plan.jit_type
            )));
        }
        let artifact = Emitter::new(plan, true).finish()?;
        tracing::debug!(
            function = %plan.function,
            generation = plan.generation,
            bytes = artifact.buffer.offset(),
            speculated_gets = artifact.speculated_gets.len(),
            speculated_adds = artifact.speculated_adds.len(),
            osr_exits = artifact.osr_exits.len(),
            "optimized code generated"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;

    fn sample() -> Arc<Bytecode> {
        let mut b = BytecodeBuilder::new("sample", 2);
        let o = b.param(0);
        let n = b.param(1);
        let x = b.new_register();
        let i = b.new_register();
        b.load_int(i, 0);
        let head = b.new_label();
        let done = b.new_label();
        b.bind(head);
        b.loop_hint();
        b.get_by_id(x, o, "x");
        b.add(i, i, x);
        b.jump_if_less(i, n, head);
        b.jump(done);
        b.bind(done);
        b.ret(i);
        Arc::new(b.finish().unwrap())
    }

    fn offset_of(bytecode: &Bytecode, name: &str) -> u32 {
        bytecode
            .instructions()
            .find(|(_, insn)| insn.name() == name)
            .map(|(offset, _)| offset)
            .unwrap()
    }

    #[test]
    fn test_baseline_has_hot_paths_and_counters() {
        let bytecode = sample();
        let plan = CompilationPlan::baseline(FunctionId(0), bytecode, 0, &JitOptions::default());
        let artifact = BaselineJit::new().compile(&plan).unwrap();
        assert_eq!(artifact.jit_type, JitType::Baseline);
        assert_eq!(artifact.ic_sites.len(), 1);
        assert!(artifact.osr_exits.is_empty());
        assert!(artifact.speculated_gets.is_empty());
        assert!(artifact.buffer.branches().len() >= 6);
    }

    #[test]
    fn test_speculative_uses_profiles() {
        let bytecode = sample();
        let get = offset_of(&bytecode, "get_by_id");
        let add = offset_of(&bytecode, "add");
        let plan = CompilationPlan::optimizing(
            FunctionId(0),
            bytecode,
            1,
            QueryableExitProfile::default(),
            &JitOptions::default(),
        )
        .with_speculation(get, SpeculatedShape { structure: StructureId(7), offset: 0 })
        .with_prediction(add, ObservedType::Int32);
        let artifact = SpeculativeJit::new().compile(&plan).unwrap();
        assert_eq!(artifact.speculated_gets.len(), 1);
        assert_eq!(artifact.speculated_adds, vec![add]);
        assert!(artifact.ic_sites.is_empty());
        // Entry and loop head
        assert_eq!(artifact.invalidation_points.len(), 2);
        let kinds: Vec<ExitKind> = artifact.osr_exits.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ExitKind::BadCache));
        assert!(kinds.contains(&ExitKind::Overflow));
        assert!(kinds.contains(&ExitKind::BadType));
    }

    #[test]
    fn test_exit_profile_disables_speculation() {
        use crate::profile::{ExitProfile, FrequentExitSite};

        let bytecode = sample();
        let get = offset_of(&bytecode, "get_by_id");
        let add = offset_of(&bytecode, "add");
        let mut profile = ExitProfile::new();
        profile.add(FrequentExitSite::new(get, ExitKind::BadCache));
        profile.add(FrequentExitSite::new(add, ExitKind::Overflow));
        let plan = CompilationPlan::optimizing(
            FunctionId(0),
            bytecode,
            2,
            QueryableExitProfile::new(&profile),
            &JitOptions::default(),
        )
        .with_speculation(get, SpeculatedShape { structure: StructureId(7), offset: 0 })
        .with_prediction(add, ObservedType::Int32);
        let artifact = SpeculativeJit::new().compile(&plan).unwrap();
        assert!(artifact.speculated_gets.is_empty());
        assert!(artifact.speculated_adds.is_empty());
        assert_eq!(artifact.ic_sites.len(), 1);
    }

    #[test]
    fn test_speculative_rejects_baseline_plan() {
        let plan = CompilationPlan::baseline(FunctionId(0), sample(), 0, &JitOptions::default());
        assert!(SpeculativeJit::new().compile(&plan).is_err());
    }

    #[test]
    fn test_switch_emits_jump_table() {
        let mut b = BytecodeBuilder::new("switch", 1);
        let v = b.param(0);
        let one = b.new_label();
        let other = b.new_label();
        b.switch(v, 1, vec![Some(one), None], other);
        b.bind(one);
        b.ret(v);
        b.bind(other);
        b.ret(v);
        let bytecode = Arc::new(b.finish().unwrap());
        let plan = CompilationPlan::baseline(FunctionId(3), bytecode, 0, &JitOptions::default());
        let artifact = BaselineJit::new().compile(&plan).unwrap();
        assert_eq!(artifact.jump_tables.len(), 1);
        assert_eq!(artifact.buffer.jump_tables()[0].targets.len(), 2);
    }
}
