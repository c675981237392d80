//! Code generation backend
//!
//! - [`isa`]: portable instruction and branch encodings
//! - [`buffer`]: the [`CodeBuffer`] compilers emit into
//! - [`link`]: the [`Linker`] that compacts branches and publishes code

pub mod buffer;
pub mod isa;
pub mod link;

pub use buffer::{BranchKind, BranchRecord, CodeBuffer, JumpTable, Label};
pub use isa::{minimal_width_for, BranchWidth, Condition, Instruction, Operation, Reg};
pub use link::{JitCompilationEffort, LinkedCode, Linker};
