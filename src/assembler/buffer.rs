//! Growable code buffer with labels, branch records and a constant pool

use super::isa::{
    encode_absolute_branch, Condition, Instruction, Reg, ABSOLUTE_BRANCH_SIZE,
    MAX_RELATIVE_BRANCH_SIZE,
};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;

/// A position in the code, bound at most once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// How a recorded branch is linked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Relative branch; may be narrowed during compaction
    Relative,
    /// Absolute branch that keeps its full width so it can be repatched
    Patchable,
}

/// A branch waiting for its target to be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRecord {
    /// Offset of the first byte of the reserved slot
    pub from: usize,
    pub target: Label,
    pub cond: Condition,
    pub kind: BranchKind,
}

impl BranchRecord {
    /// Bytes reserved for this branch before linking
    pub fn reserved(&self) -> usize {
        match self.kind {
            BranchKind::Relative => MAX_RELATIVE_BRANCH_SIZE,
            BranchKind::Patchable => ABSOLUTE_BRANCH_SIZE,
        }
    }
}

/// A `LoadConstant` whose displacement is fixed up at link time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantLoad {
    /// Offset of the load instruction
    pub at: usize,
    /// Pool entry it reads
    pub entry: Label,
}

/// Machine code under construction
///
/// Code is appended linearly. Branches reserve their widest relative encoding
/// (or the absolute form when patchable) and are resolved by the linker.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    branches: Vec<BranchRecord>,
    constant_loads: Vec<ConstantLoad>,
    pending_constants: Vec<(u64, Label)>,
    constant_index: FxHashMap<u64, Label>,
    jump_tables: Vec<JumpTable>,
}

/// Table of absolute code addresses, filled in at link time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// Bound at the first entry
    pub start: Label,
    pub targets: Vec<Label>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current size in bytes
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn branches(&self) -> &[BranchRecord] {
        &self.branches
    }

    pub fn constant_loads(&self) -> &[ConstantLoad] {
        &self.constant_loads
    }

    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    /// Constants emitted since the last pool flush
    pub fn pending_constants(&self) -> usize {
        self.pending_constants.len()
    }

    // ==================== Labels ====================

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset
    pub fn bind(&mut self, label: Label) {
        let offset = self.offset();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            debug_assert!(slot.is_none(), "label {} bound twice", label.0);
            *slot = Some(offset);
        }
    }

    /// A fresh label bound at the current offset
    pub fn here(&mut self) -> Label {
        let label = self.new_label();
        self.bind(label);
        label
    }

    /// Offset a label was bound to
    pub fn label_offset(&self, label: Label) -> Result<usize> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidLabel(label.0))
    }

    pub(crate) fn label_offsets(&self) -> &[Option<usize>] {
        &self.labels
    }

    // ==================== Emission ====================

    pub fn emit(&mut self, instruction: Instruction) {
        instruction.encode(&mut self.bytes);
    }

    /// Append raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Register a branch occupying the slot at `from` and going to `target`
    ///
    /// The slot must already be reserved and branches must be recorded in
    /// increasing `from` order.
    pub fn record_branch(&mut self, from: usize, target: Label, cond: Condition, kind: BranchKind) -> Result<()> {
        let record = BranchRecord { from, target, cond, kind };
        if from + record.reserved() > self.offset() {
            return Err(Error::internal(format!(
                "branch slot at {:#x} extends past the end of the buffer",
                from
            )));
        }
        self.branches.push(record);
        Ok(())
    }

    /// Conditional relative branch to `target`
    pub fn branch(&mut self, cond: Condition, target: Label) -> Result<()> {
        let from = self.reserve(MAX_RELATIVE_BRANCH_SIZE);
        self.record_branch(from, target, cond, BranchKind::Relative)
    }

    pub fn jump(&mut self, target: Label) -> Result<()> {
        self.branch(Condition::Always, target)
    }

    /// Absolute branch to `target` that can later be retargeted
    ///
    /// Returns a label bound at the branch so its final address can be found
    /// after linking.
    pub fn patchable_branch(&mut self, cond: Condition, target: Label) -> Result<Label> {
        let site = self.here();
        let from = self.reserve(ABSOLUTE_BRANCH_SIZE);
        self.record_branch(from, target, cond, BranchKind::Patchable)?;
        Ok(site)
    }

    /// Absolute branch to an address outside this buffer
    ///
    /// Returns a label bound at the branch.
    pub fn jump_to_address(&mut self, cond: Condition, address: u64) -> Label {
        let site = self.here();
        let mut slot = [0u8; ABSOLUTE_BRANCH_SIZE];
        encode_absolute_branch(cond, address, &mut slot);
        self.bytes.extend_from_slice(&slot);
        site
    }

    fn reserve(&mut self, len: usize) -> usize {
        let from = self.offset();
        self.bytes.resize(from + len, 0xFF);
        from
    }

    // ==================== Constant pool ====================

    /// Add `value` to the constant pool and return the label of its entry
    ///
    /// Equal values share one entry until the pool is flushed.
    pub fn emit_constant(&mut self, value: u64) -> Label {
        if let Some(&label) = self.constant_index.get(&value) {
            return label;
        }
        let label = self.new_label();
        self.pending_constants.push((value, label));
        self.constant_index.insert(value, label);
        label
    }

    /// Load a pool constant into `dst`
    pub fn load_constant(&mut self, dst: Reg, value: u64) {
        let entry = self.emit_constant(value);
        let at = self.offset();
        self.emit(Instruction::LoadConstant { dst, disp: 0 });
        self.constant_loads.push(ConstantLoad { at, entry });
    }

    /// Write out all pending constants
    ///
    /// When `jump_over` is set a branch around the pool is emitted first so
    /// execution falling through does not run into data.
    pub fn flush_constant_pool(&mut self, jump_over: bool) -> Result<()> {
        if self.pending_constants.is_empty() {
            return Ok(());
        }
        let after = if jump_over {
            let after = self.new_label();
            self.jump(after)?;
            Some(after)
        } else {
            None
        };
        // Pad to 8 bytes; compaction may shift the pool afterwards
        while self.offset() % 8 != 0 {
            self.emit(Instruction::Trap);
        }
        for (value, label) in std::mem::take(&mut self.pending_constants) {
            self.bind(label);
            self.bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.constant_index.clear();
        if let Some(after) = after {
            self.bind(after);
        }
        Ok(())
    }

    // ==================== Jump tables ====================

    /// Emit a table of absolute addresses, one per label
    ///
    /// Entries are filled in by the linker. Returns the table index and a
    /// label at its first entry.
    pub fn emit_jump_table(&mut self, targets: Vec<Label>) -> (usize, Label) {
        while self.offset() % 8 != 0 {
            self.emit(Instruction::Trap);
        }
        let start = self.here();
        self.bytes.resize(self.offset() + targets.len() * 8, 0);
        self.jump_tables.push(JumpTable { start, targets });
        (self.jump_tables.len() - 1, start)
    }

    pub(crate) fn into_parts(self) -> BufferParts {
        BufferParts {
            bytes: self.bytes,
            labels: self.labels,
            branches: self.branches,
            constant_loads: self.constant_loads,
            jump_tables: self.jump_tables,
        }
    }
}

/// Everything the linker consumes
pub(crate) struct BufferParts {
    pub bytes: Vec<u8>,
    pub labels: Vec<Option<usize>>,
    pub branches: Vec<BranchRecord>,
    pub constant_loads: Vec<ConstantLoad>,
    pub jump_tables: Vec<JumpTable>,
}
