//! Tiers of one function
//!
//! A [`FunctionExecutable`] owns the profiled code block (interpreter, then
//! baseline after an in-place upgrade) and at most one optimized block whose
//! alternative is the profiled block. Every install or jettison of optimized
//! code bumps the function's generation; compilations planned against an
//! older generation are not installed.
//!
//! - [`compiler`]: compilation plans, the [`Compiler`] trait and the two
//!   reference compilers
//! - [`worklist`]: background compilation for the optimizing tier

pub mod compiler;
pub mod worklist;

pub use compiler::{
    BaselineJit, CompilationPlan, CompiledArtifact, Compiler, CounterIncrements, SpeculatedShape, SpeculativeJit,
};
pub use worklist::{CompletedCompilation, Worklist};

use crate::assembler::{JitCompilationEffort, Linker};
use crate::bytecode::{Bytecode, FunctionId};
use crate::code_block::{CallSiteCode, CodeBlock, InvalidationPoint, JitCode, JitType, JettisonReason};
use crate::error::{Error, Result};
use crate::executable::{CodeOwner, CodePatcher, ExecutablePool};
use crate::ic::{CallSiteId, HotPath};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

// ==================== Linking ====================

/// A compiled artifact after linking, ready to be installed
#[derive(Debug)]
pub struct LinkedArtifact {
    pub code: JitCode,
    pub hot_paths: Vec<(CallSiteId, HotPath)>,
    /// Structures still to be resolved on the mutator
    pub speculated_gets: Vec<(u32, SpeculatedShape)>,
}

/// Finalize `artifact` and resolve every label it exported
///
/// Returns `Ok(None)` when executable memory is exhausted.
pub fn link_artifact(
    artifact: CompiledArtifact,
    pool: &ExecutablePool,
    owner: CodeOwner,
    compaction: bool,
) -> Result<Option<LinkedArtifact>> {
    let CompiledArtifact {
        buffer,
        entry,
        ic_sites,
        calls,
        jump_tables,
        osr_exits,
        speculated_gets,
        speculated_adds,
        invalidation_points,
        ..
    } = artifact;

    let Some(linked) = Linker::new(pool)
        .with_compaction(compaction)
        .finalize(buffer, owner, JitCompilationEffort::CanFail)?
    else {
        return Ok(None);
    };

    let mut code = JitCode::new(linked.region().clone(), linked.address_of(entry)?, linked.unlinked_size());
    for call in &calls {
        code.call_sites.insert(
            call.bytecode_offset,
            CallSiteCode {
                region: linked.region().id(),
                site: linked.address_of(call.site)?,
                slow_path: linked.address_of(call.slow_path)?,
            },
        );
    }
    code.jump_tables = jump_tables
        .iter()
        .map(|&label| linked.address_of(label))
        .collect::<Result<_>>()?;
    for exit in &osr_exits {
        code.osr_exits
            .insert((exit.bytecode_offset, exit.kind), linked.address_of(exit.ramp)?);
    }
    code.speculated_adds = speculated_adds.into_iter().collect();
    for point in &invalidation_points {
        code.invalidation_points.insert(
            point.bytecode_offset,
            InvalidationPoint {
                site: linked.address_of(point.site)?,
                continuation: linked.address_of(point.continuation)?,
                exit: linked.address_of(point.exit)?,
            },
        );
    }

    let mut hot_paths = Vec::with_capacity(ic_sites.len());
    for site in &ic_sites {
        hot_paths.push((
            site.site,
            HotPath {
                region: linked.region().id(),
                jump_site: linked.address_of(site.jump_site)?,
                slow_path: linked.address_of(site.slow_path)?,
                generic_path: linked.address_of(site.generic_path)?,
                done: linked.address_of(site.done)?,
            },
        ));
    }

    Ok(Some(LinkedArtifact { code, hot_paths, speculated_gets }))
}

// ==================== FunctionExecutable ====================

/// All tiers of one function
pub struct FunctionExecutable {
    id: FunctionId,
    bytecode: Arc<Bytecode>,
    profiled: Rc<CodeBlock>,
    optimized: RefCell<Option<Rc<CodeBlock>>>,
    generation: Cell<u64>,
    compiling: Cell<bool>,
}

impl FunctionExecutable {
    pub fn new(id: FunctionId, bytecode: Arc<Bytecode>) -> Self {
        let profiled = CodeBlock::new(id, JitType::Interpreter, bytecode.clone(), 0);
        Self {
            id,
            bytecode,
            profiled,
            optimized: RefCell::new(None),
            generation: Cell::new(0),
            compiling: Cell::new(false),
        }
    }

    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    /// The interpreter/baseline block; never jettisoned
    pub fn profiled_block(&self) -> &Rc<CodeBlock> {
        &self.profiled
    }

    pub fn optimized_block(&self) -> Option<Rc<CodeBlock>> {
        self.optimized.borrow().clone()
    }

    /// Block new calls enter
    pub fn active(&self) -> Rc<CodeBlock> {
        self.optimized_block().unwrap_or_else(|| self.profiled.clone())
    }

    pub fn tier(&self) -> JitType {
        self.active().jit_type()
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Whether an optimizing compile is queued or running
    pub fn is_compiling(&self) -> bool {
        self.compiling.get()
    }

    pub fn set_compiling(&self, compiling: bool) {
        self.compiling.set(compiling);
    }

    fn bump_generation(&self) -> u64 {
        let next = self.generation.get() + 1;
        self.generation.set(next);
        next
    }

    /// Make `block` the active tier
    ///
    /// `block` must be optimized code whose alternative chain ends at this
    /// function's profiled block. A previously installed optimized block is
    /// jettisoned and calls linked to the profiled block are unlinked so
    /// they re-link to the new code.
    pub fn install_optimized(&self, block: Rc<CodeBlock>, patcher: &dyn CodePatcher) -> Result<()> {
        if !block.jit_type().is_optimizing() || !block.has_jit_code() {
            return Err(Error::internal(format!("{} is not installable optimized code", block.id())));
        }
        let falls_back_here = block
            .baseline_version()
            .map(|b| Rc::ptr_eq(&b, &self.profiled))
            .unwrap_or(false);
        if !falls_back_here {
            return Err(Error::internal(format!(
                "{} does not fall back to {} of {}",
                block.id(),
                self.profiled.id(),
                self.id
            )));
        }

        let previous = self.optimized.borrow_mut().take();
        if let Some(previous) = previous {
            previous.jettison(JettisonReason::Replaced, patcher);
        }
        let unlinked = self.profiled.unlink_incoming_calls(patcher);
        let generation = self.bump_generation();
        tracing::info!(
            function = %self.id,
            code_block = %block.id(),
            generation,
            unlinked,
            "optimized code installed"
        );
        *self.optimized.borrow_mut() = Some(block);
        Ok(())
    }

    /// Throw away the optimized tier; calls fall back to the profiled block
    pub fn jettison_optimized(&self, reason: JettisonReason, patcher: &dyn CodePatcher) -> Option<Rc<CodeBlock>> {
        let block = self.optimized.borrow_mut().take()?;
        block.jettison(reason, patcher);
        self.bump_generation();
        Some(block)
    }
}

impl fmt::Debug for FunctionExecutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionExecutable")
            .field("id", &self.id)
            .field("name", &self.bytecode.name())
            .field("tier", &self.tier())
            .field("generation", &self.generation.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BytecodeBuilder;
    use crate::config::{ExecutableBackend, JitOptions};
    use crate::executable::jump_destination;
    use crate::profile::QueryableExitProfile;

    fn pool() -> ExecutablePool {
        ExecutablePool::with_budget(1 << 20, ExecutableBackend::Simulated, 64.0)
    }

    fn function() -> FunctionExecutable {
        let mut b = BytecodeBuilder::new("f", 1);
        let o = b.param(0);
        let r = b.new_register();
        b.get_by_id(r, o, "x");
        b.call(r, FunctionId(1), vec![r]);
        b.ret(r);
        FunctionExecutable::new(FunctionId(0), Arc::new(b.finish().unwrap()))
    }

    fn optimized_for(exec: &FunctionExecutable, pool: &ExecutablePool) -> Rc<CodeBlock> {
        let plan = CompilationPlan::optimizing(
            exec.id(),
            exec.bytecode().clone(),
            exec.generation(),
            QueryableExitProfile::default(),
            &JitOptions::default(),
        );
        let artifact = SpeculativeJit::new().compile(&plan).unwrap();
        let block = CodeBlock::new(exec.id(), JitType::Optimizing, exec.bytecode().clone(), exec.generation());
        block.set_alternative(exec.profiled_block().clone()).unwrap();
        let linked = link_artifact(artifact, pool, CodeOwner::CodeBlock(block.id().0), true)
            .unwrap()
            .unwrap();
        block.install_code(linked.code, JitType::Optimizing);
        for (site, hot) in linked.hot_paths {
            block.stub_info(site).unwrap().borrow_mut().set_hot_path(hot);
        }
        block
    }

    #[test]
    fn test_link_resolves_sites() {
        let pool = pool();
        let exec = function();
        let plan = CompilationPlan::baseline(exec.id(), exec.bytecode().clone(), 0, &JitOptions::default());
        let artifact = BaselineJit::new().compile(&plan).unwrap();
        let linked = link_artifact(artifact, &pool, CodeOwner::CodeBlock(1), true)
            .unwrap()
            .unwrap();
        assert_eq!(linked.hot_paths.len(), 1);
        let (_, hot) = linked.hot_paths[0];
        assert_eq!(jump_destination(&pool, hot.jump_site).unwrap(), hot.slow_path);
        assert!(linked.code.region.contains(hot.done, 1));

        let call = linked.code.call_sites.values().next().copied().unwrap();
        assert_eq!(jump_destination(&pool, call.site).unwrap(), call.slow_path);
        assert!(linked.code.size() <= linked.code.unlinked_size);
    }

    #[test]
    fn test_link_without_memory_is_soft() {
        let tiny = ExecutablePool::with_budget(16, ExecutableBackend::Simulated, 64.0);
        let exec = function();
        let plan = CompilationPlan::baseline(exec.id(), exec.bytecode().clone(), 0, &JitOptions::default());
        let artifact = BaselineJit::new().compile(&plan).unwrap();
        assert!(link_artifact(artifact, &tiny, CodeOwner::CodeBlock(1), true).unwrap().is_none());
    }

    #[test]
    fn test_install_and_jettison_bump_generation() {
        let pool = pool();
        let exec = function();
        assert_eq!(exec.tier(), JitType::Interpreter);

        let first = optimized_for(&exec, &pool);
        exec.install_optimized(first.clone(), &pool).unwrap();
        assert_eq!(exec.generation(), 1);
        assert!(Rc::ptr_eq(&exec.active(), &first));

        let second = optimized_for(&exec, &pool);
        exec.install_optimized(second.clone(), &pool).unwrap();
        assert!(first.is_jettisoned());
        assert_eq!(exec.generation(), 2);

        let dropped = exec.jettison_optimized(JettisonReason::Reoptimization, &pool).unwrap();
        assert!(Rc::ptr_eq(&dropped, &second));
        assert!(second.is_jettisoned());
        assert!(!second.has_jit_code());
        assert!(Rc::ptr_eq(&exec.active(), exec.profiled_block()));
        assert_eq!(exec.generation(), 3);
        assert!(exec.jettison_optimized(JettisonReason::Reoptimization, &pool).is_none());
    }

    #[test]
    fn test_jettisoned_caller_withdraws_its_call_links() {
        let pool = pool();
        let caller_exec = function();
        let callee_exec = function();
        let caller = optimized_for(&caller_exec, &pool);
        let callee = optimized_for(&callee_exec, &pool);

        let (offset, code) = {
            let jit_code = caller.jit_code();
            let (offset, code) = jit_code.as_ref().unwrap().call_sites.iter().next().unwrap();
            (*offset, *code)
        };
        callee.link_incoming_call(&caller, offset, code, &pool).unwrap();
        callee.link_incoming_call(&caller, offset, code, &pool).unwrap();
        assert_eq!(jump_destination(&pool, code.site).unwrap(), callee.entry().unwrap());
        assert_eq!(callee.incoming_callers(), vec![caller.id()]);
        assert_eq!(caller.outgoing_calls(), 1);

        caller.jettison(JettisonReason::Replaced, &pool);
        assert!(!caller.has_jit_code());
        assert_eq!(callee.incoming_calls(), 0);
        assert_eq!(caller.outgoing_calls(), 0);
        assert!(caller.stub_infos().iter().all(|s| s.borrow().hot_path().is_none()));

        // Nothing is left to patch when the callee goes away
        let patches = pool.stats().patches;
        assert_eq!(callee.unlink_incoming_calls(&pool), 0);
        assert_eq!(pool.stats().patches, patches);

        // A jettisoned block cannot link again
        assert!(callee.link_incoming_call(&caller, offset, code, &pool).is_err());
    }

    #[test]
    fn test_install_requires_chain_to_profiled_block() {
        let pool = pool();
        let exec = function();
        let other = function();
        let foreign = optimized_for(&other, &pool);
        assert!(exec.install_optimized(foreign, &pool).is_err());
        assert!(exec.install_optimized(exec.profiled_block().clone(), &pool).is_err());
        assert_eq!(exec.generation(), 0);
    }
}
