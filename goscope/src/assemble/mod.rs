//! Event assembly: from raw ring-buffer records to canonical probe
//! events.

pub mod assembler;
pub mod events;
pub mod records;
pub mod source;

#[cfg(test)]
mod scenario_tests;

pub use assembler::{EventAssembler, RunningAssembler};
pub use events::{
    InterpretedPc, Notification, ProbeEvent, RunqSnapshot, ScheduleReason, StructureState,
    TaskRef,
};
pub use source::{ReadError, RecordSource, RingBufSource, SourceHandle};

/// A successful PC resolution, as the assembler consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPc {
    pub file: String,
    pub line: i32,
    pub func: String,
}

/// The assembler's only view of the introspector: anything that can turn
/// a PC into a source position works, which is what lets the scenario
/// tests run against a canned table.
pub trait ResolvePc: Send + Sync {
    fn resolve(&self, pc: u64) -> Option<ResolvedPc>;
}
