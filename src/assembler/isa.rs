//! Portable instruction encoding
//!
//! A small variable-width instruction set used by the reference backend. Only
//! branches carry interesting structure: a conditional branch has three
//! relative encodings of increasing reach plus one absolute form that is used
//! for anything that must be repatched later.
//!
//! ```text
//! short   [0xA0|cc] [disp8]                  2 bytes, disp relative to branch start
//! near    [0xB0|cc] [disp24 le]              4 bytes
//! far     [0xC0|cc] [disp32 le]              5 bytes
//! abs     [0xD0|cc] [addr64 le]              9 bytes, never compacted
//! ```

/// Register operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

/// Branch condition, taken from the flags set by the last compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Always = 0,
    Equal = 1,
    NotEqual = 2,
    Below = 3,
    AboveOrEqual = 4,
    Overflow = 5,
}

impl Condition {
    fn from_bits(bits: u8) -> Option<Condition> {
        Some(match bits {
            0 => Condition::Always,
            1 => Condition::Equal,
            2 => Condition::NotEqual,
            3 => Condition::Below,
            4 => Condition::AboveOrEqual,
            5 => Condition::Overflow,
            _ => return None,
        })
    }

    /// The condition that holds exactly when this one does not
    pub fn invert(self) -> Condition {
        match self {
            Condition::Always => Condition::Always,
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::Overflow => Condition::Overflow,
        }
    }
}

/// Encoded width of a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BranchWidth {
    Short,
    Near,
    Far,
    Absolute,
}

const SHORT_OP: u8 = 0xA0;
const NEAR_OP: u8 = 0xB0;
const FAR_OP: u8 = 0xC0;
const ABS_OP: u8 = 0xD0;

/// Bytes reserved for a compactable branch before linking
pub const MAX_RELATIVE_BRANCH_SIZE: usize = 5;

/// Bytes of an absolute (patchable) branch
pub const ABSOLUTE_BRANCH_SIZE: usize = 9;

impl BranchWidth {
    /// Encoded size in bytes
    pub const fn size(self) -> usize {
        match self {
            BranchWidth::Short => 2,
            BranchWidth::Near => 4,
            BranchWidth::Far => 5,
            BranchWidth::Absolute => ABSOLUTE_BRANCH_SIZE,
        }
    }

    fn opcode(self) -> u8 {
        match self {
            BranchWidth::Short => SHORT_OP,
            BranchWidth::Near => NEAR_OP,
            BranchWidth::Far => FAR_OP,
            BranchWidth::Absolute => ABS_OP,
        }
    }

    /// Whether a start-relative displacement fits this encoding
    pub fn fits(self, distance: i64) -> bool {
        match self {
            BranchWidth::Short => (i8::MIN as i64..=i8::MAX as i64).contains(&distance),
            BranchWidth::Near => (-(1i64 << 23)..(1i64 << 23)).contains(&distance),
            BranchWidth::Far => (i32::MIN as i64..=i32::MAX as i64).contains(&distance),
            BranchWidth::Absolute => true,
        }
    }
}

/// Smallest relative encoding able to reach `distance` bytes from the branch start
pub fn minimal_width_for(distance: i64) -> Option<BranchWidth> {
    [BranchWidth::Short, BranchWidth::Near, BranchWidth::Far]
        .into_iter()
        .find(|w| w.fits(distance))
}

/// Write a relative branch of the given width into `out`
///
/// `out` must be exactly `width.size()` bytes.
pub fn encode_relative_branch(width: BranchWidth, cond: Condition, distance: i64, out: &mut [u8]) {
    debug_assert_eq!(out.len(), width.size());
    debug_assert!(width != BranchWidth::Absolute && width.fits(distance));
    out[0] = width.opcode() | cond as u8;
    let bytes = (distance as i32).to_le_bytes();
    match width {
        BranchWidth::Short => out[1] = bytes[0],
        BranchWidth::Near => out[1..4].copy_from_slice(&bytes[..3]),
        BranchWidth::Far => out[1..5].copy_from_slice(&bytes),
        BranchWidth::Absolute => unreachable!("absolute branches are encoded separately"),
    }
}

/// Write an absolute branch into `out` (9 bytes)
pub fn encode_absolute_branch(cond: Condition, target: u64, out: &mut [u8]) {
    debug_assert_eq!(out.len(), ABSOLUTE_BRANCH_SIZE);
    out[0] = ABS_OP | cond as u8;
    out[1..9].copy_from_slice(&target.to_le_bytes());
}

/// Where a decoded branch goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Displacement from the start of the branch
    Relative(i64),
    /// Absolute address
    Absolute(u64),
}

/// A branch read back out of machine code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedBranch {
    pub cond: Condition,
    pub width: BranchWidth,
    pub target: BranchTarget,
}

impl DecodedBranch {
    /// Resolve the target against the branch's own address
    pub fn resolve(&self, branch_address: u64) -> u64 {
        match self.target {
            BranchTarget::Relative(d) => (branch_address as i64 + d) as u64,
            BranchTarget::Absolute(a) => a,
        }
    }
}

/// Decode the branch starting at `bytes[0]`, if there is one
pub fn decode_branch(bytes: &[u8]) -> Option<DecodedBranch> {
    let op = *bytes.first()?;
    let cond = Condition::from_bits(op & 0x0F)?;
    let (width, target) = match op & 0xF0 {
        SHORT_OP => {
            let b = *bytes.get(1)?;
            (BranchWidth::Short, BranchTarget::Relative(b as i8 as i64))
        }
        NEAR_OP => {
            let b = bytes.get(1..4)?;
            // Sign-extend the 24-bit field
            let raw = i32::from_le_bytes([b[0], b[1], b[2], 0]) << 8 >> 8;
            (BranchWidth::Near, BranchTarget::Relative(raw as i64))
        }
        FAR_OP => {
            let b = bytes.get(1..5)?;
            let raw = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (BranchWidth::Far, BranchTarget::Relative(raw as i64))
        }
        ABS_OP => {
            let b: [u8; 8] = bytes.get(1..9)?.try_into().ok()?;
            (BranchWidth::Absolute, BranchTarget::Absolute(u64::from_le_bytes(b)))
        }
        _ => return None,
    };
    Some(DecodedBranch { cond, width, target })
}

/// Runtime operations reachable through `CallOperation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Operation {
    GetByIdGeneric = 1,
    PutByIdGeneric = 2,
    GetByIdMiss = 3,
    PutByIdMiss = 4,
    OptimizeCheck = 5,
    OsrExit = 6,
    VirtualCall = 7,
    Throw = 8,
}

/// Non-branch instructions of the portable backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Move { dst: Reg, src: Reg },
    LoadImm32 { dst: Reg, imm: i32 },
    /// Load a 64-bit pool constant; `disp` is relative to the instruction start
    LoadConstant { dst: Reg, disp: i32 },
    LoadField { dst: Reg, base: Reg, offset: u32 },
    StoreField { src: Reg, base: Reg, offset: u32 },
    LoadStructure { dst: Reg, base: Reg },
    StoreStructure { base: Reg, src: Reg },
    LoadPrototype { dst: Reg, base: Reg },
    Compare { lhs: Reg, rhs: Reg },
    CompareImm32 { lhs: Reg, imm: i32 },
    Add { dst: Reg, lhs: Reg, rhs: Reg },
    /// Bump an execution counter slot; sets flags from the new value
    AddToCounter { slot: u32, amount: i32 },
    CallOperation { operation: Operation },
    Return,
    Trap,
}

impl Instruction {
    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        match self {
            Instruction::Nop | Instruction::Return | Instruction::Trap => 1,
            Instruction::Move { .. }
            | Instruction::LoadStructure { .. }
            | Instruction::StoreStructure { .. }
            | Instruction::LoadPrototype { .. }
            | Instruction::Compare { .. } => 3,
            Instruction::CallOperation { .. } => 3,
            Instruction::LoadImm32 { .. }
            | Instruction::LoadConstant { .. }
            | Instruction::CompareImm32 { .. } => 6,
            Instruction::Add { .. } => 4,
            Instruction::LoadField { .. } | Instruction::StoreField { .. } => 7,
            Instruction::AddToCounter { .. } => 9,
        }
    }

    /// Offset of the displacement field within a `LoadConstant`
    pub const CONSTANT_DISP_OFFSET: usize = 2;

    /// Append the encoding to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Instruction::Nop => out.push(0x00),
            Instruction::Move { dst, src } => out.extend_from_slice(&[0x01, dst as u8, src as u8]),
            Instruction::LoadImm32 { dst, imm } => {
                out.extend_from_slice(&[0x02, dst as u8]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Instruction::LoadConstant { dst, disp } => {
                out.extend_from_slice(&[0x03, dst as u8]);
                out.extend_from_slice(&disp.to_le_bytes());
            }
            Instruction::LoadField { dst, base, offset } => {
                out.extend_from_slice(&[0x10, dst as u8, base as u8]);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Instruction::StoreField { src, base, offset } => {
                out.extend_from_slice(&[0x11, src as u8, base as u8]);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Instruction::LoadStructure { dst, base } => {
                out.extend_from_slice(&[0x12, dst as u8, base as u8])
            }
            Instruction::StoreStructure { base, src } => {
                out.extend_from_slice(&[0x13, base as u8, src as u8])
            }
            Instruction::LoadPrototype { dst, base } => {
                out.extend_from_slice(&[0x14, dst as u8, base as u8])
            }
            Instruction::Compare { lhs, rhs } => out.extend_from_slice(&[0x20, lhs as u8, rhs as u8]),
            Instruction::CompareImm32 { lhs, imm } => {
                out.extend_from_slice(&[0x21, lhs as u8]);
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Instruction::Add { dst, lhs, rhs } => {
                out.extend_from_slice(&[0x30, dst as u8, lhs as u8, rhs as u8])
            }
            Instruction::AddToCounter { slot, amount } => {
                out.push(0x32);
                out.extend_from_slice(&slot.to_le_bytes());
                out.extend_from_slice(&amount.to_le_bytes());
            }
            Instruction::CallOperation { operation } => {
                out.push(0x40);
                out.extend_from_slice(&(operation as u16).to_le_bytes());
            }
            Instruction::Return => out.push(0x50),
            Instruction::Trap => out.push(0xFF),
        }
    }
}
