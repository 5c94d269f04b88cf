#![no_std]

// Record layouts shared between the kernel probe programs and userspace.
//
// Every record begins with a `u64` event-type discriminant and is written
// into the ring buffer as host-byte-order fixed-width integers with natural
// alignment. The userspace decoder and the probe programs must agree on
// these layouts byte for byte.

/// Event-type discriminants carried in the leading field of every record.
///
/// Values 3-4 and 6 are reserved for run-queue steal and semaphore-table
/// snapshots, which the probe side does not emit yet.
pub const EVENT_NEW_TASK: u64 = 0;
pub const EVENT_DELAY: u64 = 1;
pub const EVENT_RUNQ_STATUS: u64 = 2;
pub const EVENT_GLOBAL_RUNQ_STATUS: u64 = 5;
pub const EVENT_SCHEDULE: u64 = 7;
pub const EVENT_EXECUTE: u64 = 8;
pub const EVENT_PARK: u64 = 9;
pub const EVENT_READY: u64 = 10;
pub const EVENT_READY_RUNQ_STATUS: u64 = 11;

/// Number of frames captured for a schedule-trigger callstack.
pub const MAX_CALLSTACK_DEPTH: usize = 8;

/// Fixed width of the NUL-padded wait-reason field in park records.
pub const WAIT_REASON_LEN: usize = 40;

/// One slot of a run queue. `pc == 0` marks a dummy entry, used by the
/// probe side to encode an empty next-slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawQueueEntry {
    pub pc: u64,
    pub task_id: u64,
}

/// Task creation observed at the runtime's spawn entry point.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NewTaskRecord {
    pub event_type: u64,
    pub pc: u64,
    pub creator_task_id: u64,
    pub worker_id: i64,
}

/// Per-source-line delay probe fired inside an instrumented package.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DelayRecord {
    pub event_type: u64,
    pub pc: u64,
    pub task_id: u64,
    pub worker_id: i64,
}

/// One streamed slot of a per-worker local run-queue snapshot. The
/// snapshot is complete when `entry_index == tail`; the terminal record's
/// entry carries the next-slot task (dummy when the slot is empty).
///
/// `grouping_worker_id` is the id of the worker whose execute decision
/// triggered a multi-queue sweep, and negative when the snapshot stands
/// alone.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RunqStatusRecord {
    pub event_type: u64,
    pub proc_id: i64,
    pub head: u64,
    pub tail: u64,
    pub entry_index: u64,
    pub entry: RawQueueEntry,
    pub worker_id: i64,
    pub grouping_worker_id: i64,
}

/// Streamed slot of the shared global run queue; complete when
/// `entry_index == size`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GlobalRunqStatusRecord {
    pub event_type: u64,
    pub size: i64,
    pub entry_index: u64,
    pub entry: RawQueueEntry,
}

/// Scheduler-entry callstack. `proc_id == -1` when the worker holds no
/// processor at the time of the decision.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ScheduleRecord {
    pub event_type: u64,
    pub worker_id: i64,
    pub callstack: [u64; MAX_CALLSTACK_DEPTH],
    pub depth: i64,
    pub proc_id: i64,
}

/// A task parking itself; the wait reason is NUL-terminated inside the
/// fixed field.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ParkRecord {
    pub event_type: u64,
    pub worker_id: i64,
    pub parked: RawQueueEntry,
    pub wait_reason: [u8; WAIT_REASON_LEN],
}

/// A parked task made runnable again. Followed by `READY_RUNQ_STATUS`
/// records for the queue that received it.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ReadyRecord {
    pub event_type: u64,
    pub worker_id: i64,
    pub task_id: u64,
}

/// An execute decision: the task the scheduler picked, the call site that
/// made the pick, and how many processors the subsequent run-queue sweep
/// will cover.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ExecuteRecord {
    pub event_type: u64,
    pub worker_id: i64,
    pub found: RawQueueEntry,
    pub caller_pc: u64,
    pub proc_id: i64,
    pub num_processors: u64,
}

/// Per-function descriptor staged into the kernel-side lookup table so the
/// probe programs can unwind and identify tasks.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub entry_pc: u64,
    pub pcsp: u32,
    pub flag: u8,
    pub _pad: [u8; 3],
}

impl FunctionDescriptor {
    #[must_use]
    pub fn new(entry_pc: u64, pcsp: u32, flag: u8) -> Self {
        Self { entry_pc, pcsp, flag, _pad: [0; 3] }
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// Required for eBPF <-> userspace communication; all fields are plain
// integers so the byte-level reinterpretation is sound.
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for RawQueueEntry {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for FunctionDescriptor {}
