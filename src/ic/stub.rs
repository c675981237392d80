//! Stub compilation and repatching for inline-cache sites

use super::{AccessKind, AccessObservation, GetCase, HotPath, PutCase, StructureStubInfo, StubState, StubTransition};
use crate::assembler::{CodeBuffer, Condition, Instruction, JitCompilationEffort, Label, Linker, Reg};
use crate::config::JitOptions;
use crate::error::Result;
use crate::executable::{CodeOwner, CodePatcher, ExecutablePool, ExecutableRegion};
use crate::structure::{Structure, StructureChain};
use crate::watchpoint::Watchpoint;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

// Register conventions inside stubs
const RECEIVER: Reg = Reg::R0;
const VALUE: Reg = Reg::R1;
const SCRATCH_STRUCTURE: Reg = Reg::R2;
const SCRATCH_EXPECTED: Reg = Reg::R3;
const WALK: Reg = Reg::R4;

/// Finalized stub code for one site
#[derive(Debug, Clone)]
pub struct CompiledStub {
    region: Arc<ExecutableRegion>,
}

impl CompiledStub {
    pub fn entry(&self) -> usize {
        self.region.base()
    }

    pub fn region(&self) -> &Arc<ExecutableRegion> {
        &self.region
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }
}

fn emit_structure_check(buf: &mut CodeBuffer, object: Reg, expected: &Structure, miss: Label) -> Result<()> {
    buf.emit(Instruction::LoadStructure { dst: SCRATCH_STRUCTURE, base: object });
    buf.load_constant(SCRATCH_EXPECTED, expected.id().0 as u64);
    buf.emit(Instruction::Compare { lhs: SCRATCH_STRUCTURE, rhs: SCRATCH_EXPECTED });
    buf.branch(Condition::NotEqual, miss)
}

/// Walk the prototype chain into `WALK`, checking each structure
fn emit_chain_check(buf: &mut CodeBuffer, chain: &StructureChain, miss: Label) -> Result<()> {
    buf.emit(Instruction::Move { dst: WALK, src: RECEIVER });
    for structure in chain.iter() {
        buf.emit(Instruction::LoadPrototype { dst: WALK, base: WALK });
        emit_structure_check(buf, WALK, structure, miss)?;
    }
    Ok(())
}

/// Generate the stub for `state`
///
/// Each case checks the receiver structure (and chain, for prototype and
/// transition cases), performs the access and jumps back to `done`. A failed
/// check falls through to the next case; the last failure goes to the slow
/// path. Returns `Ok(None)` for states without cases or when executable
/// memory is exhausted.
pub fn compile_stub(
    state: &StubState,
    hot: &HotPath,
    pool: &ExecutablePool,
    owner: CodeOwner,
) -> Result<Option<CompiledStub>> {
    if state.case_count() == 0 {
        return Ok(None);
    }
    let mut buf = CodeBuffer::new();

    for case in state.get_cases() {
        let next = buf.new_label();
        emit_structure_check(&mut buf, RECEIVER, case.structure(), next)?;
        match &case {
            GetCase::Own(a) => {
                buf.emit(Instruction::LoadField { dst: RECEIVER, base: RECEIVER, offset: a.offset })
            }
            GetCase::Proto(p) => {
                emit_chain_check(&mut buf, &p.chain, next)?;
                buf.emit(Instruction::LoadField { dst: RECEIVER, base: WALK, offset: p.offset });
            }
        }
        buf.jump_to_address(Condition::Always, hot.done as u64);
        buf.bind(next);
    }

    for case in state.put_cases() {
        let next = buf.new_label();
        emit_structure_check(&mut buf, RECEIVER, case.structure(), next)?;
        match &case {
            PutCase::Replace(r) => {
                buf.emit(Instruction::StoreField { src: VALUE, base: RECEIVER, offset: r.offset })
            }
            PutCase::Transition(t) => {
                emit_chain_check(&mut buf, &t.chain, next)?;
                buf.emit(Instruction::StoreField { src: VALUE, base: RECEIVER, offset: t.offset });
                buf.load_constant(SCRATCH_EXPECTED, t.new.id().0 as u64);
                buf.emit(Instruction::StoreStructure { base: RECEIVER, src: SCRATCH_EXPECTED });
            }
        }
        buf.jump_to_address(Condition::Always, hot.done as u64);
        buf.bind(next);
    }

    buf.jump_to_address(Condition::Always, hot.slow_path as u64);
    buf.flush_constant_pool(false)?;

    let linked = Linker::new(pool).finalize(buf, owner, JitCompilationEffort::CanFail)?;
    Ok(linked.map(|code| CompiledStub { region: code.into_region() }))
}

// ==================== Repatching driver ====================

/// Everything a site needs to rebuild its stub
pub struct StubContext<'a> {
    pub pool: &'a ExecutablePool,
    pub patcher: Arc<dyn CodePatcher>,
    pub options: &'a JitOptions,
    pub code_block: u64,
}

/// Feed a slow-path observation to `info`, rebuilding and installing its stub
///
/// Returns the transition taken, or `None` if the site did not change. When
/// executable memory is exhausted the site keeps its current state.
pub fn process_observation(
    info: &Rc<RefCell<StructureStubInfo>>,
    observation: &AccessObservation,
    cx: &StubContext<'_>,
) -> Result<Option<StubTransition>> {
    let (transition, watched, epoch) = {
        let mut stub_info = info.borrow_mut();
        let Some(next) = stub_info.plan(observation, cx.options) else {
            return Ok(None);
        };

        let compiled = match stub_info.hot_path() {
            Some(hot) if next.case_count() > 0 => {
                let owner = CodeOwner::Stub { code_block: cx.code_block, site: stub_info.site().0 };
                match compile_stub(&next, &hot, cx.pool, owner)? {
                    Some(stub) => Some(stub),
                    None => {
                        tracing::debug!(site = %stub_info.site(), "stub not compiled, no executable memory");
                        return Ok(None);
                    }
                }
            }
            _ => None,
        };

        let watched = next.referenced_structures();
        let patcher = stub_info.hot_path().map(|_| cx.patcher.as_ref());
        let transition = stub_info.install(next, compiled, patcher)?;
        (transition, watched, stub_info.epoch())
    };

    // The borrow is released: a watchpoint on an already-dead structure fires
    // during `add` and resets this very stub.
    for structure in watched {
        let watchpoint = StubClearingWatchpoint::new(
            Rc::downgrade(info),
            &structure,
            epoch,
            cx.patcher.clone(),
            cx.options.max_stub_resets,
        );
        structure.add_watchpoint(Rc::new(watchpoint));
    }
    Ok(Some(transition))
}

/// Give `info` the hot path of newly linked code
///
/// Sites warmed up before their code existed get a stub for the state they
/// already reached. If no stub can be allocated the hot path stays on the
/// slow path.
pub fn attach_hot_path(info: &Rc<RefCell<StructureStubInfo>>, hot: HotPath, cx: &StubContext<'_>) -> Result<()> {
    let mut stub_info = info.borrow_mut();
    let compiled = if stub_info.state().case_count() > 0 {
        let owner = CodeOwner::Stub { code_block: cx.code_block, site: stub_info.site().0 };
        compile_stub(stub_info.state(), &hot, cx.pool, owner)?
    } else {
        None
    };
    stub_info.relink(hot, compiled, cx.patcher.as_ref())
}

/// Kind check used by callers before feeding observations
pub fn observation_matches(kind: AccessKind, observation: &AccessObservation) -> bool {
    match observation {
        AccessObservation::Uncacheable => true,
        AccessObservation::Own(_) | AccessObservation::Proto(_) => kind == AccessKind::GetById,
        AccessObservation::PutReplace(_) | AccessObservation::PutTransition(_) => kind == AccessKind::PutById,
    }
}

// ==================== StubClearingWatchpoint ====================

/// Resets a site when a structure its stub relies on is invalidated
///
/// Holds the site weakly and remembers the site's epoch at creation. A site
/// that has since moved on (or was freed with its code block) makes the
/// watchpoint stale and it is dropped without firing.
pub struct StubClearingWatchpoint {
    stub: Weak<RefCell<StructureStubInfo>>,
    structure: Weak<Structure>,
    epoch: u64,
    patcher: Arc<dyn CodePatcher>,
    max_resets: u32,
}

impl StubClearingWatchpoint {
    pub fn new(
        stub: Weak<RefCell<StructureStubInfo>>,
        structure: &Rc<Structure>,
        epoch: u64,
        patcher: Arc<dyn CodePatcher>,
        max_resets: u32,
    ) -> Self {
        Self {
            stub,
            structure: Rc::downgrade(structure),
            epoch,
            patcher,
            max_resets,
        }
    }
}

impl Watchpoint for StubClearingWatchpoint {
    fn fire(&self) {
        let Some(stub) = self.stub.upgrade() else {
            return;
        };
        let Ok(mut info) = stub.try_borrow_mut() else {
            tracing::warn!("stub busy while its structure was invalidated");
            return;
        };
        if info.epoch() != self.epoch {
            return;
        }
        let by_gc = self.structure.upgrade().map(|s| !s.is_live()).unwrap_or(true);
        let patcher = info.hot_path().map(|_| self.patcher.as_ref());
        if let Err(err) = info.reset(self.max_resets, by_gc, patcher) {
            tracing::warn!(error = %err, site = %info.site(), "stub reset failed");
        }
    }

    fn is_live(&self) -> bool {
        match self.stub.upgrade() {
            Some(stub) => stub.try_borrow().map(|i| i.epoch() == self.epoch).unwrap_or(true),
            None => false,
        }
    }
}

impl fmt::Debug for StubClearingWatchpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubClearingWatchpoint")
            .field("epoch", &self.epoch)
            .field("live", &self.is_live())
            .finish()
    }
}
