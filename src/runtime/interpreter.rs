//! Tier-aware bytecode execution
//!
//! One loop runs every tier. What differs is what an instruction consults:
//! profiled tiers charge the execution counter, fill value profiles and feed
//! inline caches; optimized code trusts its speculations and leaves through
//! an OSR exit when one of them does not hold.

use super::{Completion, JitRuntime};
use crate::bytecode::{FunctionId, Instruction, Register, Slot};
use crate::code_block::CodeBlock;
use crate::error::{Error, Result};
use crate::executable::jump_destination;
use crate::ic::{process_observation, AccessObservation, CallSiteId, StructureStubInfo};
use crate::profile::ExitKind;
use crate::structure::{JsObject, Value};
use crate::tiering::FunctionExecutable;
use std::cell::RefCell;
use std::rc::Rc;

/// What the loop does after one instruction
enum Step {
    Next,
    Jump(u32),
    Return(Slot),
    Throw(Slot),
    Exit(ExitKind),
}

struct Frame {
    registers: Vec<Slot>,
}

impl Frame {
    fn new(size: usize, args: Vec<Slot>) -> Self {
        let mut registers = vec![Slot::Undefined; size];
        for (slot, arg) in registers.iter_mut().zip(args) {
            *slot = arg;
        }
        Self { registers }
    }

    fn get(&self, register: Register) -> Slot {
        self.registers
            .get(register as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn set(&mut self, register: Register, value: Slot) {
        if let Some(slot) = self.registers.get_mut(register as usize) {
            *slot = value;
        }
    }

    fn int(&self, register: Register) -> Option<i64> {
        self.get(register).as_int()
    }
}

impl JitRuntime {
    pub(super) fn execute(
        &mut self,
        exec: &Rc<FunctionExecutable>,
        mut block: Rc<CodeBlock>,
        args: Vec<Slot>,
    ) -> Result<Completion> {
        let bytecode = exec.bytecode().clone();
        let size = bytecode.num_registers().max(bytecode.num_parameters()) as usize;
        let mut frame = Frame::new(size, args);
        let mut pc = 0;
        loop {
            // Code jettisoned under a running activation continues in baseline
            if block.is_jettisoned() {
                block = exec.profiled_block().clone();
            }
            let insn = bytecode
                .instruction_at(pc)
                .ok_or_else(|| Error::internal(format!("{} ran past its end at bc#{}", exec.id(), pc)))?;
            match self.step(exec, &block, pc, insn, &mut frame)? {
                Step::Next => pc = bytecode.next_offset(pc),
                Step::Jump(target) => pc = target,
                Step::Return(value) => return Ok(Completion::Normal(value)),
                Step::Throw(value) => match block.handler_for_bytecode_offset(pc) {
                    Some(handler) => {
                        frame.set(handler.exception_register, value);
                        pc = handler.target;
                    }
                    None => return Ok(Completion::Throw(value)),
                },
                // Re-run the same instruction in baseline
                Step::Exit(kind) => block = self.osr_exit(exec, &block, pc, kind),
            }
        }
    }

    fn step(
        &mut self,
        exec: &Rc<FunctionExecutable>,
        block: &Rc<CodeBlock>,
        pc: u32,
        insn: &Instruction,
        frame: &mut Frame,
    ) -> Result<Step> {
        let optimized = block.jit_type().is_optimizing();
        let step = match insn {
            Instruction::Enter | Instruction::LoopHint => {
                if let Some(kind) = self.invalidation_exit(block, pc)? {
                    return Ok(Step::Exit(kind));
                }
                let amount = if matches!(insn, Instruction::Enter) {
                    self.options.execution_counter_increment_for_entry
                } else {
                    self.options.execution_counter_increment_for_loop
                };
                self.count_execution(exec, block, amount)?;
                Step::Next
            }
            Instruction::LoadInt { dst, value } => {
                frame.set(*dst, Slot::Int(*value));
                Step::Next
            }
            Instruction::Move { dst, src } => {
                frame.set(*dst, frame.get(*src));
                Step::Next
            }
            Instruction::Add { dst, lhs, rhs } => {
                let (lhs, rhs) = (frame.int(*lhs), frame.int(*rhs));
                let result = if optimized && block.is_speculated_add(pc) {
                    let (Some(a), Some(b)) = (lhs.and_then(as_int32), rhs.and_then(as_int32)) else {
                        return Ok(Step::Exit(ExitKind::BadType));
                    };
                    match a.checked_add(b) {
                        Some(sum) => Slot::Int(sum as i64),
                        None => return Ok(Step::Exit(ExitKind::Overflow)),
                    }
                } else {
                    // Non-integer operands and results past i64 throw
                    match (lhs, rhs) {
                        (Some(a), Some(b)) => match a.checked_add(b) {
                            Some(sum) => Slot::Int(sum),
                            None => return Ok(Step::Throw(Slot::Undefined)),
                        },
                        _ => return Ok(Step::Throw(Slot::Undefined)),
                    }
                };
                self.profile_value(block, pc, &result);
                frame.set(*dst, result);
                Step::Next
            }
            Instruction::GetById { dst, base, site } => {
                let Some(object) = frame.get(*base).as_object().cloned() else {
                    return Ok(Step::Throw(Slot::Undefined));
                };
                let speculated = if optimized { block.speculated_get(pc) } else { None };
                let value = match speculated {
                    Some(access) => {
                        if !Rc::ptr_eq(&object.structure(), &access.structure) {
                            return Ok(Step::Exit(ExitKind::BadCache));
                        }
                        object.slot(access.offset).map(Slot::Int).unwrap_or_default()
                    }
                    None => self.get_by_id(block, *site, &object)?,
                };
                self.profile_value(block, pc, &value);
                frame.set(*dst, value);
                Step::Next
            }
            Instruction::PutById { base, site, value } => {
                let Some(object) = frame.get(*base).as_object().cloned() else {
                    return Ok(Step::Throw(Slot::Undefined));
                };
                let Some(value) = frame.int(*value) else {
                    return Ok(Step::Throw(Slot::Undefined));
                };
                self.put_by_id(block, *site, &object, value)?;
                Step::Next
            }
            Instruction::Jump { target } => Step::Jump(*target),
            Instruction::JumpIfLess { lhs, rhs, target } => match (frame.int(*lhs), frame.int(*rhs)) {
                (Some(a), Some(b)) if a < b => Step::Jump(*target),
                (Some(_), Some(_)) => Step::Next,
                _ => Step::Throw(Slot::Undefined),
            },
            Instruction::Switch { table, scrutinee, default } => {
                let jump_table = exec
                    .bytecode()
                    .jump_table(*table)
                    .ok_or_else(|| Error::internal(format!("missing jump table {}", table)))?;
                match frame.int(*scrutinee) {
                    Some(value) => Step::Jump(jump_table.offset_for_value(value, *default)),
                    None => Step::Jump(*default),
                }
            }
            Instruction::Call { dst, callee, args } => {
                let args = args.iter().map(|r| frame.get(*r)).collect();
                let completion = self.invoke(*callee, args)?;
                self.link_call(block, pc, *callee)?;
                match completion {
                    Completion::Normal(value) => {
                        self.profile_value(block, pc, &value);
                        frame.set(*dst, value);
                        Step::Next
                    }
                    Completion::Throw(value) => Step::Throw(value),
                }
            }
            Instruction::Throw { value } => Step::Throw(frame.get(*value)),
            Instruction::Return { value } => {
                self.count_execution(exec, block, self.options.execution_counter_increment_for_return)?;
                Step::Return(frame.get(*value))
            }
        };
        Ok(step)
    }

    /// Exit kind if a watchpoint has redirected this invalidation point
    fn invalidation_exit(&self, block: &CodeBlock, pc: u32) -> Result<Option<ExitKind>> {
        if !block.jit_type().is_optimizing() {
            return Ok(None);
        }
        let Some(point) = block.invalidation_point(pc) else {
            return Ok(None);
        };
        let destination = jump_destination(self.patcher.as_ref(), point.site)?;
        Ok((destination != point.continuation).then_some(ExitKind::UncountableWatchpoint))
    }

    fn profile_value(&self, block: &CodeBlock, pc: u32, value: &Slot) {
        if !block.jit_type().is_optimizing() {
            block.with_value_profile(pc, |profile| profile.record(value.observed_type()));
        }
    }

    fn get_by_id(&mut self, block: &CodeBlock, site: CallSiteId, object: &Rc<JsObject>) -> Result<Slot> {
        let info = block.stub_info(site)?.clone();
        let cached = info.borrow_mut().try_get(object);
        if let Some(value) = cached {
            return Ok(Slot::Int(value));
        }
        let property = info.borrow().property().clone();
        let value = object.get(&property);
        let observation = AccessObservation::for_get(object, &property);
        self.observe(block, &info, &observation)?;
        Ok(value.map(Slot::Int).unwrap_or_default())
    }

    fn put_by_id(&mut self, block: &CodeBlock, site: CallSiteId, object: &Rc<JsObject>, value: Value) -> Result<()> {
        let info = block.stub_info(site)?.clone();
        let hit = info.borrow_mut().try_put(object, value);
        if hit {
            return Ok(());
        }
        let property = info.borrow().property().clone();
        let outcome = object.put(&mut self.structures, &property, value);
        let observation = AccessObservation::for_put(&outcome);
        self.observe(block, &info, &observation)
    }

    fn observe(
        &mut self,
        block: &CodeBlock,
        info: &Rc<RefCell<StructureStubInfo>>,
        observation: &AccessObservation,
    ) -> Result<()> {
        let transition = process_observation(info, observation, &self.stub_context(block))?;
        if transition.is_some() {
            self.note_ic_transition();
        }
        Ok(())
    }

    /// Point the caller's machine code straight at the callee's entry
    fn link_call(&mut self, block: &CodeBlock, pc: u32, callee: FunctionId) -> Result<()> {
        let Some(code) = block.call_site_code(pc) else {
            return Ok(());
        };
        let target = self.function(callee)?.active();
        let Some(entry) = target.entry() else {
            return Ok(());
        };
        if jump_destination(self.patcher.as_ref(), code.site)? == entry {
            return Ok(());
        }
        target.link_incoming_call(block, pc, code, self.patcher.as_ref())?;
        self.note_call_linked();
        Ok(())
    }
}

fn as_int32(value: i64) -> Option<i32> {
    i32::try_from(value).ok()
}
