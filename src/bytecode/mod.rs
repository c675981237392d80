//! Bytecode consumed by the JIT tiers
//!
//! A function body is an ordered list of register-based instructions. Each
//! instruction has a stable offset (measured in operand words, like the
//! original engine's instruction stream) used as the key for everything the
//! tiers attach to it: inline-cache sites, value profiles, OSR exits, line
//! information and exception handlers.
//!
//! Bytecode is immutable once built and shared between tiers and the
//! background compiler through `Arc`.

use crate::error::{Error, Result};
use crate::ic::{AccessKind, CallSiteId};
use crate::profile::ObservedType;
use crate::structure::JsObject;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Virtual register index; parameters come first
pub type Register = u16;

/// Index of a function known to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

// ==================== Values ====================

/// Contents of a virtual register
#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Undefined,
    Int(i64),
    Object(Rc<JsObject>),
}

impl Slot {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Slot::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<JsObject>> {
        match self {
            Slot::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn observed_type(&self) -> ObservedType {
        match self {
            Slot::Undefined => ObservedType::Undefined,
            Slot::Int(v) => ObservedType::of_int(*v),
            Slot::Object(_) => ObservedType::Object,
        }
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Slot::Undefined, Slot::Undefined) => true,
            (Slot::Int(a), Slot::Int(b)) => a == b,
            (Slot::Object(a), Slot::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Slot {
    fn from(value: i64) -> Self {
        Slot::Int(value)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Undefined => f.write_str("undefined"),
            Slot::Int(v) => write!(f, "{}", v),
            Slot::Object(o) => write!(f, "[object {}]", o.structure().id()),
        }
    }
}

// ==================== Instructions ====================

/// Bytecode instructions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Function prologue
    Enter,
    LoadInt { dst: Register, value: i64 },
    Move { dst: Register, src: Register },
    /// Integer add; anything else produces undefined
    Add { dst: Register, lhs: Register, rhs: Register },
    GetById { dst: Register, base: Register, site: CallSiteId },
    PutById { base: Register, site: CallSiteId, value: Register },
    Jump { target: u32 },
    JumpIfLess { lhs: Register, rhs: Register, target: u32 },
    /// Loop back-edge marker; charges the loop counter increment
    LoopHint,
    /// Dense integer switch through a [`SimpleJumpTable`]
    Switch { table: u32, scrutinee: Register, default: u32 },
    Call { dst: Register, callee: FunctionId, args: Vec<Register> },
    Throw { value: Register },
    Return { value: Register },
}

impl Instruction {
    /// Length in operand words, opcode included
    pub fn length(&self) -> u32 {
        match self {
            Instruction::Enter | Instruction::LoopHint => 1,
            Instruction::Jump { .. } | Instruction::Throw { .. } | Instruction::Return { .. } => 2,
            Instruction::LoadInt { .. } | Instruction::Move { .. } => 3,
            Instruction::Add { .. }
            | Instruction::GetById { .. }
            | Instruction::PutById { .. }
            | Instruction::JumpIfLess { .. }
            | Instruction::Switch { .. } => 4,
            Instruction::Call { args, .. } => 3 + args.len() as u32,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Enter => "enter",
            Instruction::LoadInt { .. } => "load_int",
            Instruction::Move { .. } => "mov",
            Instruction::Add { .. } => "add",
            Instruction::GetById { .. } => "get_by_id",
            Instruction::PutById { .. } => "put_by_id",
            Instruction::Jump { .. } => "jmp",
            Instruction::JumpIfLess { .. } => "jless",
            Instruction::LoopHint => "loop_hint",
            Instruction::Switch { .. } => "switch_imm",
            Instruction::Call { .. } => "call",
            Instruction::Throw { .. } => "throw",
            Instruction::Return { .. } => "ret",
        }
    }

    /// Whether the result of this instruction is value-profiled
    pub fn is_profiled(&self) -> bool {
        matches!(
            self,
            Instruction::Add { .. } | Instruction::GetById { .. } | Instruction::Call { .. }
        )
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::Switch { .. }
                | Instruction::Throw { .. }
                | Instruction::Return { .. }
        )
    }

    fn map_targets(&mut self, mut resolve: impl FnMut(u32) -> Result<u32>) -> Result<()> {
        match self {
            Instruction::Jump { target } | Instruction::JumpIfLess { target, .. } => {
                *target = resolve(*target)?;
            }
            Instruction::Switch { default, .. } => *default = resolve(*default)?,
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Enter | Instruction::LoopHint => f.write_str(self.name()),
            Instruction::LoadInt { dst, value } => write!(f, "load_int r{}, {}", dst, value),
            Instruction::Move { dst, src } => write!(f, "mov r{}, r{}", dst, src),
            Instruction::Add { dst, lhs, rhs } => write!(f, "add r{}, r{}, r{}", dst, lhs, rhs),
            Instruction::GetById { dst, base, site } => write!(f, "get_by_id r{}, r{}, {}", dst, base, site),
            Instruction::PutById { base, site, value } => {
                write!(f, "put_by_id r{}, {}, r{}", base, site, value)
            }
            Instruction::Jump { target } => write!(f, "jmp {}", target),
            Instruction::JumpIfLess { lhs, rhs, target } => {
                write!(f, "jless r{}, r{}, {}", lhs, rhs, target)
            }
            Instruction::Switch { table, scrutinee, default } => {
                write!(f, "switch_imm table{}, r{}, default {}", table, scrutinee, default)
            }
            Instruction::Call { dst, callee, args } => {
                write!(f, "call r{}, {}", dst, callee)?;
                for arg in args {
                    write!(f, ", r{}", arg)?;
                }
                Ok(())
            }
            Instruction::Throw { value } => write!(f, "throw r{}", value),
            Instruction::Return { value } => write!(f, "ret r{}", value),
        }
    }
}

// ==================== Side tables ====================

/// A property-access site that gets an inline cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteInfo {
    pub id: CallSiteId,
    pub kind: AccessKind,
    pub bytecode_offset: u32,
    pub property: Arc<str>,
}

/// Source position of the instructions starting at `bytecode_offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub bytecode_offset: u32,
    pub line: u32,
    pub column: u32,
}

/// Exception handler covering `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    /// Receives the thrown value
    pub exception_register: Register,
}

/// Dense table for integer switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleJumpTable {
    pub min: i32,
    /// Target offset for `min + i`, `None` for the default
    pub branch_offsets: Vec<Option<u32>>,
}

impl SimpleJumpTable {
    /// Bytecode offset to continue at for `value`
    pub fn offset_for_value(&self, value: i64, default: u32) -> u32 {
        let index = value - self.min as i64;
        if index < 0 {
            return default;
        }
        self.branch_offsets
            .get(index as usize)
            .copied()
            .flatten()
            .unwrap_or(default)
    }
}

// ==================== Bytecode ====================

/// Immutable bytecode of one function
#[derive(Debug, Clone)]
pub struct Bytecode {
    name: Arc<str>,
    num_parameters: u16,
    num_registers: u16,
    instructions: Vec<Instruction>,
    offsets: Vec<u32>,
    length: u32,
    call_sites: Vec<CallSiteInfo>,
    value_profile_offsets: Vec<u32>,
    lines: Vec<LineInfo>,
    handlers: Vec<HandlerInfo>,
    jump_tables: Vec<SimpleJumpTable>,
}

impl Bytecode {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn num_parameters(&self) -> u16 {
        self.num_parameters
    }

    /// Parameters plus locals
    pub fn num_registers(&self) -> u16 {
        self.num_registers
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Total length in words; one past the last valid offset
    pub fn length(&self) -> u32 {
        self.length
    }

    /// `(offset, instruction)` pairs in program order
    pub fn instructions(&self) -> impl Iterator<Item = (u32, &Instruction)> {
        self.offsets.iter().copied().zip(self.instructions.iter())
    }

    fn index_of(&self, offset: u32) -> Option<usize> {
        self.offsets.binary_search(&offset).ok()
    }

    pub fn instruction_at(&self, offset: u32) -> Option<&Instruction> {
        self.index_of(offset).map(|i| &self.instructions[i])
    }

    /// Offset of the instruction following the one at `offset`
    pub fn next_offset(&self, offset: u32) -> u32 {
        match self.instruction_at(offset) {
            Some(insn) => offset + insn.length(),
            None => self.length,
        }
    }

    pub fn call_sites(&self) -> &[CallSiteInfo] {
        &self.call_sites
    }

    pub fn call_site(&self, id: CallSiteId) -> Option<&CallSiteInfo> {
        self.call_sites.get(id.0 as usize)
    }

    /// Offsets of profiled instructions, ascending
    pub fn value_profile_offsets(&self) -> &[u32] {
        &self.value_profile_offsets
    }

    /// Line and column of the instruction at `offset`
    pub fn expression_info(&self, offset: u32) -> Option<(u32, u32)> {
        let index = self.lines.partition_point(|l| l.bytecode_offset <= offset);
        index.checked_sub(1).map(|i| (self.lines[i].line, self.lines[i].column))
    }

    /// Innermost handler covering `offset`
    pub fn handler_for(&self, offset: u32) -> Option<&HandlerInfo> {
        self.handlers
            .iter()
            .filter(|h| h.start <= offset && offset < h.end)
            .min_by_key(|h| h.end - h.start)
    }

    pub fn handlers(&self) -> &[HandlerInfo] {
        &self.handlers
    }

    pub fn jump_tables(&self) -> &[SimpleJumpTable] {
        &self.jump_tables
    }

    pub fn jump_table(&self, index: u32) -> Option<&SimpleJumpTable> {
        self.jump_tables.get(index as usize)
    }
}

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({} params, {} registers, {} words)",
            self.name, self.num_parameters, self.num_registers, self.length
        )?;
        for (offset, insn) in self.instructions() {
            writeln!(f, "  [{:4}] {}", offset, insn)?;
        }
        Ok(())
    }
}

// ==================== Builder ====================

/// Forward-referenceable position in bytecode under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeLabel(u32);

/// Builds [`Bytecode`] one instruction at a time
#[derive(Debug)]
pub struct BytecodeBuilder {
    name: Arc<str>,
    num_parameters: u16,
    num_registers: u16,
    instructions: Vec<Instruction>,
    offsets: Vec<u32>,
    next_offset: u32,
    call_sites: Vec<CallSiteInfo>,
    labels: Vec<Option<u32>>,
    lines: Vec<LineInfo>,
    handlers: Vec<(BytecodeLabel, BytecodeLabel, BytecodeLabel, Register)>,
    jump_tables: Vec<(i32, Vec<Option<BytecodeLabel>>)>,
}

impl BytecodeBuilder {
    /// Start a function with `num_parameters` parameters; emits `enter`
    pub fn new(name: &str, num_parameters: u16) -> Self {
        let mut builder = Self {
            name: Arc::from(name),
            num_parameters,
            num_registers: num_parameters,
            instructions: Vec::new(),
            offsets: Vec::new(),
            next_offset: 0,
            call_sites: Vec::new(),
            labels: Vec::new(),
            lines: Vec::new(),
            handlers: Vec::new(),
            jump_tables: Vec::new(),
        };
        builder.emit(Instruction::Enter);
        builder
    }

    pub fn param(&self, index: u16) -> Register {
        debug_assert!(index < self.num_parameters);
        index
    }

    pub fn new_register(&mut self) -> Register {
        let reg = self.num_registers;
        self.num_registers += 1;
        reg
    }

    pub fn current_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn new_label(&mut self) -> BytecodeLabel {
        self.labels.push(None);
        BytecodeLabel(self.labels.len() as u32 - 1)
    }

    pub fn bind(&mut self, label: BytecodeLabel) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.next_offset);
    }

    /// Attribute the following instructions to `line:column`
    pub fn set_position(&mut self, line: u32, column: u32) {
        let entry = LineInfo { bytecode_offset: self.next_offset, line, column };
        match self.lines.last_mut() {
            Some(last) if last.bytecode_offset == self.next_offset => *last = entry,
            _ => self.lines.push(entry),
        }
    }

    fn emit(&mut self, instruction: Instruction) -> u32 {
        let offset = self.next_offset;
        self.next_offset += instruction.length();
        self.offsets.push(offset);
        self.instructions.push(instruction);
        offset
    }

    fn add_call_site(&mut self, kind: AccessKind, property: &str) -> CallSiteId {
        let id = CallSiteId(self.call_sites.len() as u32);
        self.call_sites.push(CallSiteInfo {
            id,
            kind,
            bytecode_offset: self.next_offset,
            property: Arc::from(property),
        });
        id
    }

    pub fn load_int(&mut self, dst: Register, value: i64) -> u32 {
        self.emit(Instruction::LoadInt { dst, value })
    }

    pub fn mov(&mut self, dst: Register, src: Register) -> u32 {
        self.emit(Instruction::Move { dst, src })
    }

    pub fn add(&mut self, dst: Register, lhs: Register, rhs: Register) -> u32 {
        self.emit(Instruction::Add { dst, lhs, rhs })
    }

    pub fn get_by_id(&mut self, dst: Register, base: Register, property: &str) -> CallSiteId {
        let site = self.add_call_site(AccessKind::GetById, property);
        self.emit(Instruction::GetById { dst, base, site });
        site
    }

    pub fn put_by_id(&mut self, base: Register, property: &str, value: Register) -> CallSiteId {
        let site = self.add_call_site(AccessKind::PutById, property);
        self.emit(Instruction::PutById { base, site, value });
        site
    }

    pub fn jump(&mut self, target: BytecodeLabel) -> u32 {
        self.emit(Instruction::Jump { target: target.0 })
    }

    pub fn jump_if_less(&mut self, lhs: Register, rhs: Register, target: BytecodeLabel) -> u32 {
        self.emit(Instruction::JumpIfLess { lhs, rhs, target: target.0 })
    }

    pub fn loop_hint(&mut self) -> u32 {
        self.emit(Instruction::LoopHint)
    }

    /// Switch on `scrutinee`; `cases[i]` handles `min + i`
    pub fn switch(
        &mut self,
        scrutinee: Register,
        min: i32,
        cases: Vec<Option<BytecodeLabel>>,
        default: BytecodeLabel,
    ) -> u32 {
        let table = self.jump_tables.len() as u32;
        self.jump_tables.push((min, cases));
        self.emit(Instruction::Switch { table, scrutinee, default: default.0 })
    }

    pub fn call(&mut self, dst: Register, callee: FunctionId, args: Vec<Register>) -> u32 {
        self.emit(Instruction::Call { dst, callee, args })
    }

    pub fn throw(&mut self, value: Register) -> u32 {
        self.emit(Instruction::Throw { value })
    }

    pub fn ret(&mut self, value: Register) -> u32 {
        self.emit(Instruction::Return { value })
    }

    /// Catch exceptions thrown in `[start, end)` at `target`
    pub fn add_handler(
        &mut self,
        start: BytecodeLabel,
        end: BytecodeLabel,
        target: BytecodeLabel,
        exception_register: Register,
    ) {
        self.handlers.push((start, end, target, exception_register));
    }

    fn resolve(labels: &[Option<u32>], label: u32) -> Result<u32> {
        labels
            .get(label as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidLabel(label))
    }

    /// Resolve labels and freeze the bytecode
    pub fn finish(self) -> Result<Bytecode> {
        let labels = self.labels;
        let mut instructions = self.instructions;
        for insn in instructions.iter_mut() {
            insn.map_targets(|label| Self::resolve(&labels, label))?;
        }

        let mut jump_tables = Vec::with_capacity(self.jump_tables.len());
        for (min, cases) in self.jump_tables {
            let branch_offsets = cases
                .into_iter()
                .map(|case| case.map(|l| Self::resolve(&labels, l.0)).transpose())
                .collect::<Result<Vec<_>>>()?;
            jump_tables.push(SimpleJumpTable { min, branch_offsets });
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for (start, end, target, exception_register) in self.handlers {
            handlers.push(HandlerInfo {
                start: Self::resolve(&labels, start.0)?,
                end: Self::resolve(&labels, end.0)?,
                target: Self::resolve(&labels, target.0)?,
                exception_register,
            });
        }

        let value_profile_offsets = self
            .offsets
            .iter()
            .zip(instructions.iter())
            .filter(|(_, insn)| insn.is_profiled())
            .map(|(offset, _)| *offset)
            .collect();

        Ok(Bytecode {
            name: self.name,
            num_parameters: self.num_parameters,
            num_registers: self.num_registers,
            instructions,
            offsets: self.offsets,
            length: self.next_offset,
            call_sites: self.call_sites,
            value_profile_offsets,
            lines: self.lines,
            handlers,
            jump_tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_loop() -> Bytecode {
        let mut b = BytecodeBuilder::new("count", 1);
        let n = b.param(0);
        let i = b.new_register();
        let one = b.new_register();
        b.set_position(1, 1);
        b.load_int(i, 0);
        b.load_int(one, 1);
        let top = b.new_label();
        let done = b.new_label();
        b.bind(top);
        b.set_position(2, 5);
        b.loop_hint();
        b.add(i, i, one);
        b.jump_if_less(i, n, top);
        b.jump(done);
        b.bind(done);
        b.ret(i);
        b.finish().unwrap()
    }

    #[test]
    fn test_offsets_are_word_based() {
        let code = counting_loop();
        let offsets: Vec<u32> = code.instructions().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![0, 1, 4, 7, 8, 12, 16, 18]);
        assert_eq!(code.length(), 20);
        assert_eq!(code.next_offset(8), 12);
        assert!(code.instruction_at(5).is_none());
    }

    #[test]
    fn test_labels_resolved() {
        let code = counting_loop();
        assert_eq!(
            code.instruction_at(12),
            Some(&Instruction::JumpIfLess { lhs: 1, rhs: 0, target: 7 })
        );
        assert_eq!(code.instruction_at(16), Some(&Instruction::Jump { target: 18 }));
    }

    #[test]
    fn test_expression_info() {
        let code = counting_loop();
        assert_eq!(code.expression_info(0), None);
        assert_eq!(code.expression_info(4), Some((1, 1)));
        assert_eq!(code.expression_info(12), Some((2, 5)));
    }

    #[test]
    fn test_call_sites_and_profiles() {
        let mut b = BytecodeBuilder::new("access", 1);
        let o = b.param(0);
        let r = b.new_register();
        let site0 = b.get_by_id(r, o, "x");
        let site1 = b.put_by_id(o, "y", r);
        b.ret(r);
        let code = b.finish().unwrap();
        assert_eq!(site0, CallSiteId(0));
        assert_eq!(site1, CallSiteId(1));
        assert_eq!(code.call_site(site1).unwrap().kind, AccessKind::PutById);
        assert_eq!(&*code.call_site(site0).unwrap().property, "x");
        assert_eq!(code.value_profile_offsets(), &[1]);
    }

    #[test]
    fn test_handlers_pick_innermost() {
        let mut b = BytecodeBuilder::new("try", 0);
        let e = b.new_register();
        let (outer_start, inner_start, inner_end, outer_end) =
            (b.new_label(), b.new_label(), b.new_label(), b.new_label());
        let (outer_catch, inner_catch) = (b.new_label(), b.new_label());
        b.bind(outer_start);
        b.load_int(e, 1);
        b.bind(inner_start);
        b.throw(e);
        b.bind(inner_end);
        b.bind(outer_end);
        b.bind(inner_catch);
        b.ret(e);
        b.bind(outer_catch);
        b.ret(e);
        b.add_handler(outer_start, outer_end, outer_catch, e);
        b.add_handler(inner_start, inner_end, inner_catch, e);
        let code = b.finish().unwrap();
        assert_eq!(code.handler_for(4).unwrap().target, 6);
        assert_eq!(code.handler_for(1).unwrap().target, 8);
        assert!(code.handler_for(6).is_none());
    }

    #[test]
    fn test_switch_table() {
        let mut b = BytecodeBuilder::new("switch", 1);
        let x = b.param(0);
        let (a, c, d) = (b.new_label(), b.new_label(), b.new_label());
        b.switch(x, 10, vec![Some(a), None, Some(c)], d);
        b.bind(a);
        b.ret(x);
        b.bind(c);
        b.ret(x);
        b.bind(d);
        b.ret(x);
        let code = b.finish().unwrap();
        let table = code.jump_table(0).unwrap();
        assert_eq!(table.offset_for_value(10, 99), 5);
        assert_eq!(table.offset_for_value(11, 99), 99);
        assert_eq!(table.offset_for_value(12, 99), 7);
        assert_eq!(table.offset_for_value(9, 99), 99);
        assert_eq!(table.offset_for_value(1 << 40, 99), 99);
    }

    #[test]
    fn test_unbound_label_rejected() {
        let mut b = BytecodeBuilder::new("bad", 0);
        let l = b.new_label();
        b.jump(l);
        assert!(matches!(b.finish(), Err(Error::InvalidLabel(_))));
    }
}
