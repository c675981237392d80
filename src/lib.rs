//! Quicksilver JIT: the adaptive tiering core of the Quicksilver runtime
//!
//! This crate owns everything between "a function has bytecode" and "that
//! function runs as specialized machine code, and falls back safely when the
//! speculation behind that code stops holding". It does not parse JavaScript
//! or manage the heap; it consumes bytecode and structure (shape) identities
//! from the outside and produces executable code.
//!
//! # Quick Start
//!
//! ```no_run
//! use quicksilver_jit::bytecode::{BytecodeBuilder, Slot};
//! use quicksilver_jit::{JitOptions, JitRuntime};
//!
//! fn main() -> quicksilver_jit::Result<()> {
//!     let mut runtime = JitRuntime::new(JitOptions::default())?;
//!
//!     let mut b = BytecodeBuilder::new("get_x", 1);
//!     let object = b.param(0);
//!     let x = b.new_register();
//!     b.get_by_id(x, object, "x");
//!     b.ret(x);
//!     let get_x = runtime.register(b.finish()?);
//!
//!     let point = runtime.create_object(&[("x", 3), ("y", 4)]);
//!     for _ in 0..10_000 {
//!         runtime.call(get_x, &[Slot::Object(point.clone())])?;
//!     }
//!     println!("{}", runtime.stats());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Code flows: [`bytecode`] → [`tiering::compiler`] → [`assembler`] → [`executable`] → [`code_block`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Code generation** | [`assembler`], [`executable`] |
//! | **Speculation** | [`structure`], [`watchpoint`], [`ic`] |
//! | **Feedback** | [`profile`], [`code_block`] |
//! | **Tiering** | [`tiering`], [`runtime`] |
//! | **Support** | [`bytecode`], [`config`], [`error`](Error) |
// Clippy configuration for the JIT core.
//
// These suppressions exist because:
// - type_complexity: side tables map offsets to Rc<RefCell<..>> records
// - new_without_default: some builders take required arguments
// - too_many_arguments: stub compilation threads the linker context through
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod assembler;
pub mod bytecode;
pub mod code_block;
pub mod config;
pub mod executable;
pub mod ic;
pub mod profile;
pub mod runtime;
pub mod structure;
pub mod tiering;
pub mod watchpoint;

mod error;

pub use code_block::{CodeBlock, JitType};
pub use config::JitOptions;
pub use error::{Error, Result};
pub use runtime::{Completion, JitRuntime, RuntimeStats};

/// Quicksilver JIT version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
