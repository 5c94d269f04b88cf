//! Structured error types for goscope.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Introspection errors indicate an incompatible or corrupt target binary;
//! assembly errors indicate a probe/decoder mismatch. Both are fatal to
//! their subsystem.

use thiserror::Error;

/// Failures while decoding an instruction stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("unsupported opcode {byte:#04x} at offset {offset:#x}")]
    UnsupportedOpcode { byte: u8, offset: usize },

    #[error("unsupported two-byte opcode 0f {byte:#04x} at offset {offset:#x}")]
    UnsupportedExtendedOpcode { byte: u8, offset: usize },

    #[error("instruction truncated at offset {offset:#x}")]
    Truncated { offset: usize },
}

/// Failures while opening or interpreting the target binary.
#[derive(Error, Debug)]
pub enum IntrospectError {
    #[error("section {0} not found in target binary")]
    MissingSection(&'static str),

    #[error("symbol {0} not found in target binary")]
    MissingSymbol(String),

    #[error("function {0} has no symbol table entry")]
    MissingFunction(String),

    #[error("function {symbol} bytes [{offset:#x}..+{len:#x}] fall outside the text section")]
    FunctionOutOfText { symbol: String, offset: u64, len: u64 },

    #[error("unsupported line table magic {magic:#010x} (toolchain outside the 1.20-1.22 range)")]
    UnsupportedLineTable { magic: u32 },

    #[error("malformed line table: {0}")]
    BadLineTable(&'static str),

    #[error("stack-growth prologue not found in function {symbol}")]
    PrologueNotFound { symbol: String },

    #[error("decode instructions of {symbol}: {source}")]
    Scan { symbol: String, source: ScanError },

    #[error(transparent)]
    Object(#[from] object::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures inside the event assembler's decode task. Any of these closes
/// the outgoing event channel abruptly.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("record of {len} bytes too short for event type {event_type}")]
    Truncated { event_type: u64, len: usize },

    #[error("unrecognized event type {0}")]
    UnknownEventType(u64),

    #[error("PC {pc:#x} does not resolve to a function")]
    UnresolvedPc { pc: u64 },

    #[error("schedule trigger resolved to {func}, want runtime.schedule")]
    UnexpectedScheduleTrigger { func: String },

    #[error("callstack depth {0} outside the captured range")]
    BadCallstackDepth(i64),

    #[error("no terminating NUL in wait reason for worker {worker_id}")]
    UnterminatedWaitReason { worker_id: i64 },

    #[error("queue entry index {index} beyond declared tail {tail} for proc {proc_id}")]
    EntryIndexBeyondTail { index: u64, tail: u64, proc_id: i64 },

    #[error("no pending execute for grouping worker {0}")]
    MissingExecuteBuffer(i64),

    #[error("no pending ready for worker {0}")]
    MissingReadyBuffer(i64),

    #[error("ready queue snapshot for worker {worker_id} carries grouping worker {grouping_worker_id}")]
    ReadyWithGroupingWorker { worker_id: i64, grouping_worker_id: i64 },
}

/// Failures while attaching probes or staging kernel-side tables.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe program {0} not found in loaded object")]
    ProgramNotFound(String),

    #[error("probe program {program} is not a uprobe")]
    NotAUprobe { program: String },

    #[error("load probe program {program}: {source}")]
    Load { program: String, source: aya::programs::ProgramError },

    #[error("attach {program} at {symbol}+{offset:#x}: {source}")]
    Attach { program: String, symbol: String, offset: u64, source: aya::programs::ProgramError },

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Introspect(#[from] IntrospectError),
}
