//! Core domain types and structured errors.

pub mod errors;

pub use errors::{AssembleError, IntrospectError, ProbeError, ScanError};

/// A program counter: an address into the target's executable text.
pub type Pc = u64;
