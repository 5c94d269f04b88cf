//! Canonical probe events.
//!
//! These are the in-memory structured values delivered on the assembler's
//! output channel. Whatever wire encoding a caller wants happens above
//! this layer; the `Serialize` derives exist for the JSON output mode.

use serde::Serialize;

/// A PC resolved through the line table. All fields are absent when
/// resolution failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterpretedPc {
    pub file: Option<String>,
    pub line: Option<i32>,
    pub func: Option<String>,
}

/// A task together with the source position it will resume at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRef {
    pub task_id: i64,
    pub pc: InterpretedPc,
}

/// One assembled local run queue: owning worker (when known), processor,
/// queued tasks in order, and the next-slot task if the slot is occupied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunqSnapshot {
    pub proc_id: i64,
    pub worker_id: Option<i64>,
    pub entries: Vec<TaskRef>,
    pub next: Option<TaskRef>,
}

/// Why a worker entered the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScheduleReason {
    Goexit,
    Gopark,
    Mstart,
    Other,
}

/// Point-in-time notifications about scheduler activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Notification {
    NewTask { creator_task_id: i64, worker_id: i64, start_pc: InterpretedPc },
    Delay { task_id: i64, worker_id: i64, pc: InterpretedPc },
    Schedule { worker_id: i64, proc_id: Option<i64>, reason: ScheduleReason },
    Park { worker_id: i64, parked: TaskRef, wait_reason: String },
}

/// Snapshots of scheduler data structures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StructureState {
    RunqStatus(RunqSnapshot),
    Execute { worker_id: i64, found: TaskRef, proc_id: i64, runqs: Vec<RunqSnapshot> },
    Ready { worker_id: i64, task_id: i64, runq: RunqSnapshot },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProbeEvent {
    Notification(Notification),
    StructureState(StructureState),
}
