//! Error types for the Quicksilver JIT runtime
//!
//! Most failures inside the JIT are *soft*: running out of executable memory,
//! overflowing an inline cache or taking an OSR exit are handled where they are
//! detected and never show up here. The variants below cover logic errors that
//! a defensive check caught, bad configuration, and I/O around option files.

use std::fmt;
use thiserror::Error;

/// Which bookkeeping invariant of branch compaction was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionFault {
    /// Branch records were not in increasing source-offset order
    UnorderedBranches,
    /// The cumulative shift would have become negative
    NegativeShift,
    /// A branch was narrowed below what its final distance needs
    WidthTooSmall,
}

impl fmt::Display for CompactionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionFault::UnorderedBranches => write!(f, "branches out of order"),
            CompactionFault::NegativeShift => write!(f, "negative cumulative shift"),
            CompactionFault::WidthTooSmall => write!(f, "branch encoding too narrow"),
        }
    }
}

/// Main error type for the JIT runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Internal invariant violation
    #[error("InternalError: {0}")]
    InternalError(String),

    /// A branch or constant referenced a label that was never bound
    #[error("InvalidLabel: label {0} was never bound")]
    InvalidLabel(u32),

    /// A branch distance does not fit any encoding
    #[error("BranchOutOfRange: branch at {from:#x} cannot reach {to:#x}")]
    BranchOutOfRange { from: usize, to: usize },

    /// Branch compaction bookkeeping went wrong
    #[error("CompactionError: {fault} at offset {offset:#x}")]
    CompactionInvariant { fault: CompactionFault, offset: usize },

    /// Executable memory could not be allocated for a must-succeed request
    #[error("ExecutableMemoryExhausted: requested {requested} bytes, {available} available")]
    ExecutableMemoryExhausted { requested: usize, available: usize },

    /// Patch target outside of any live executable region
    #[error("PatchOutOfBounds: {address:#x}+{len} is not inside a live region")]
    PatchOutOfBounds { address: usize, len: usize },

    /// Patch aimed at code that was freed and its address reused
    #[error("StalePatch: {address:#x} now belongs to region {found}, not region {expected}")]
    StalePatch { address: usize, expected: u64, found: u64 },

    /// Changing page protection failed
    #[error("MemoryProtection: {0}")]
    MemoryProtection(String),

    /// Linking the alternative chain would create a cycle
    #[error("CyclicAlternative: code block {0} is already on the chain")]
    CyclicAlternative(u64),

    /// Unknown function id
    #[error("UnknownFunction: {0}")]
    UnknownFunction(u32),

    /// Unknown inline-cache call site
    #[error("UnknownCallSite: {0}")]
    UnknownCallSite(u32),

    /// Invalid option value
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JsonError: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a compaction invariant error
    pub fn compaction(fault: CompactionFault, offset: usize) -> Self {
        Error::CompactionInvariant { fault, offset }
    }

    /// Whether this error is a logic error (a bug) rather than an environmental failure
    pub fn is_logic_error(&self) -> bool {
        matches!(
            self,
            Error::InternalError(_)
                | Error::InvalidLabel(_)
                | Error::CompactionInvariant { .. }
                | Error::CyclicAlternative(_)
        )
    }
}

/// Result type for JIT operations
pub type Result<T> = std::result::Result<T, Error>;
