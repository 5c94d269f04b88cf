//! The event assembler: raw ring-buffer records in, canonical probe
//! events out.
//!
//! Two cooperating threads form the pipeline:
//!
//! ```text
//! ring buffer -> [intake] -> records channel -> [decode] -> events channel
//! ```
//!
//! Intake only reads and forwards; every piece of assembly state lives on
//! the decode thread, so no locking is needed anywhere. Queue snapshots
//! stream in as one record per entry and are accumulated per runq key
//! until the terminal record arrives; execute and ready events buffer per
//! worker until their component snapshots complete.
//!
//! Emission order is completion order, not the order of the records that
//! opened each assembly. Records from different workers interleave
//! freely; within one worker the producing probes are synchronous, which
//! is what makes the worker id a sound grouping key.
//!
//! A decode error is fatal: the thread logs it and exits, closing the
//! output channel. Consumers observe end-of-stream and must treat the run
//! as incomplete.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use goscope_common::{
    DelayRecord, ExecuteRecord, GlobalRunqStatusRecord, NewTaskRecord, ParkRecord,
    RawQueueEntry, ReadyRecord, RunqStatusRecord, ScheduleRecord, EVENT_DELAY, EVENT_EXECUTE,
    EVENT_GLOBAL_RUNQ_STATUS, EVENT_NEW_TASK, EVENT_PARK, EVENT_READY,
    EVENT_READY_RUNQ_STATUS, EVENT_RUNQ_STATUS, EVENT_SCHEDULE,
};
use log::{debug, error, info, warn};

use crate::byteorder::{self, ByteOrder};
use crate::domain::AssembleError;

use super::events::{
    InterpretedPc, Notification, ProbeEvent, RunqSnapshot, ScheduleReason, StructureState,
    TaskRef,
};
use super::records::{ParseRecord, RecordCursor};
use super::source::{ReadError, RecordSource};
use super::{ResolvePc, ResolvedPc};

/// The function every kept execute decision must be called from, and the
/// required trigger of every schedule callstack.
const SCHEDULE_FUNC: &str = "runtime.schedule";

/// Identity of one in-flight queue snapshot. Status and ready-status
/// streams may target the same (worker, proc) pair concurrently, so the
/// event type is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RunqKey {
    event_type: u64,
    grouping_worker_id: i64,
    proc_id: i64,
}

impl RunqKey {
    fn of(record: &RunqStatusRecord) -> Self {
        Self {
            event_type: record.event_type,
            grouping_worker_id: record.grouping_worker_id,
            proc_id: record.proc_id,
        }
    }
}

struct PendingExecute {
    record: ExecuteRecord,
    runqs: Vec<RunqSnapshot>,
}

impl PendingExecute {
    fn is_complete(&self) -> bool {
        self.runqs.len() == self.record.num_processors as usize
    }
}

struct PendingReady {
    worker_id: i64,
    task_id: i64,
}

pub struct EventAssembler<S> {
    resolver: Arc<dyn ResolvePc>,
    source: S,
}

/// The running pipeline. Events arrive on `events` until both threads
/// finish; `join` reaps them after the source reports closed.
pub struct RunningAssembler {
    pub events: Receiver<ProbeEvent>,
    intake: JoinHandle<()>,
    decode: JoinHandle<()>,
}

impl RunningAssembler {
    pub fn join(self) {
        self.intake.join().ok();
        self.decode.join().ok();
    }
}

impl<S: RecordSource + 'static> EventAssembler<S> {
    pub fn new(resolver: Arc<dyn ResolvePc>, source: S) -> Self {
        Self { resolver, source }
    }

    pub fn start(self) -> RunningAssembler {
        let (record_tx, record_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let mut source = self.source;
        let intake = thread::spawn(move || loop {
            match source.read() {
                Ok(record) => {
                    if record_tx.send(record).is_err() {
                        break;
                    }
                }
                Err(ReadError::Timeout) => {}
                Err(ReadError::Closed) => {
                    debug!("record source closed");
                    break;
                }
                Err(err) => {
                    error!("⚠️  read record source: {err}");
                    break;
                }
            }
        });

        let mut decoder = Decoder::new(self.resolver, event_tx);
        let decode = thread::spawn(move || {
            for record in record_rx {
                if let Err(err) = decoder.handle(&record) {
                    error!("⚠️  decode raw record: {err}");
                    break;
                }
            }
        });

        RunningAssembler { events: event_rx, intake, decode }
    }
}

/// All assembly state; touched by the decode thread only.
struct Decoder {
    resolver: Arc<dyn ResolvePc>,
    order: ByteOrder,
    local_runqs: HashMap<RunqKey, Vec<RawQueueEntry>>,
    pending_executes: HashMap<i64, PendingExecute>,
    pending_readies: HashMap<i64, PendingReady>,
    global_runq: Vec<RawQueueEntry>,
    events: Sender<ProbeEvent>,
}

impl Decoder {
    fn new(resolver: Arc<dyn ResolvePc>, events: Sender<ProbeEvent>) -> Self {
        Self {
            resolver,
            order: byteorder::host(),
            local_runqs: HashMap::new(),
            pending_executes: HashMap::new(),
            pending_readies: HashMap::new(),
            global_runq: Vec::new(),
            events,
        }
    }

    fn handle(&mut self, record: &[u8]) -> Result<(), AssembleError> {
        let mut cursor = RecordCursor::new(record, self.order)?;
        let event_type = cursor.event_type();
        let event = match event_type {
            EVENT_NEW_TASK => self.on_new_task(NewTaskRecord::parse(&mut cursor)?)?,
            EVENT_DELAY => self.on_delay(DelayRecord::parse(&mut cursor)?)?,
            EVENT_SCHEDULE => self.on_schedule(ScheduleRecord::parse(&mut cursor)?)?,
            EVENT_RUNQ_STATUS | EVENT_READY_RUNQ_STATUS => {
                self.on_runq_status(RunqStatusRecord::parse(&mut cursor)?)?
            }
            EVENT_GLOBAL_RUNQ_STATUS => {
                self.on_global_runq_status(GlobalRunqStatusRecord::parse(&mut cursor)?)
            }
            EVENT_PARK => self.on_park(ParkRecord::parse(&mut cursor)?)?,
            EVENT_READY => self.on_ready(ReadyRecord::parse(&mut cursor)?),
            EVENT_EXECUTE => self.on_execute(ExecuteRecord::parse(&mut cursor)?)?,
            other => return Err(AssembleError::UnknownEventType(other)),
        };
        if let Some(event) = event {
            debug!("probe event assembled from record type {event_type}: {event:?}");
            // A vanished consumer is not the decoder's problem; keep
            // draining so close semantics stay uniform.
            self.events.send(event).ok();
        }
        Ok(())
    }

    // Per-type handlers.

    fn on_new_task(&self, record: NewTaskRecord) -> Result<Option<ProbeEvent>, AssembleError> {
        let start_pc = self.interpret_pc(record.pc);
        if start_pc.func.is_none() {
            return Err(AssembleError::UnresolvedPc { pc: record.pc });
        }
        Ok(Some(ProbeEvent::Notification(Notification::NewTask {
            creator_task_id: record.creator_task_id as i64,
            worker_id: record.worker_id,
            start_pc,
        })))
    }

    fn on_delay(&self, record: DelayRecord) -> Result<Option<ProbeEvent>, AssembleError> {
        let pc = self.interpret_pc(record.pc);
        if pc.func.is_none() {
            return Err(AssembleError::UnresolvedPc { pc: record.pc });
        }
        Ok(Some(ProbeEvent::Notification(Notification::Delay {
            task_id: record.task_id as i64,
            worker_id: record.worker_id,
            pc,
        })))
    }

    fn on_schedule(&self, record: ScheduleRecord) -> Result<Option<ProbeEvent>, AssembleError> {
        let depth = usize::try_from(record.depth)
            .ok()
            .filter(|d| (1..=record.callstack.len()).contains(d))
            .ok_or(AssembleError::BadCallstackDepth(record.depth))?;
        let callstack: Vec<InterpretedPc> =
            record.callstack[..depth].iter().map(|&pc| self.interpret_pc(pc)).collect();

        // The probe fires on scheduler entry; anything else at the top of
        // the stack means the decoder and the probes disagree about the
        // binary.
        match callstack[0].func.as_deref() {
            Some(SCHEDULE_FUNC) => {}
            Some(other) => {
                return Err(AssembleError::UnexpectedScheduleTrigger { func: other.to_string() })
            }
            None => return Err(AssembleError::UnresolvedPc { pc: record.callstack[0] }),
        }
        debug!(
            "schedule entered on worker {}, callstack: {callstack:?}",
            record.worker_id
        );

        Ok(Some(ProbeEvent::Notification(Notification::Schedule {
            worker_id: record.worker_id,
            proc_id: (record.proc_id >= 0).then_some(record.proc_id),
            reason: find_schedule_reason(&callstack),
        })))
    }

    fn on_runq_status(
        &mut self,
        record: RunqStatusRecord,
    ) -> Result<Option<ProbeEvent>, AssembleError> {
        if record.entry_index > record.tail {
            return Err(AssembleError::EntryIndexBeyondTail {
                index: record.entry_index,
                tail: record.tail,
                proc_id: record.proc_id,
            });
        }
        if record.entry_index != record.tail {
            self.local_runqs.entry(RunqKey::of(&record)).or_default().push(record.entry);
            return Ok(None);
        }

        let snapshot = self.finish_snapshot(&record);

        // Concurrent standalone readers may observe a queue after a
        // sweep already collected it; the freshest snapshot for any
        // processor wins in every pending sweep.
        for pending in self.pending_executes.values_mut() {
            if let Some(slot) =
                pending.runqs.iter_mut().find(|runq| runq.proc_id == snapshot.proc_id)
            {
                *slot = snapshot.clone();
            }
        }

        if record.grouping_worker_id < 0 {
            if record.event_type == EVENT_READY_RUNQ_STATUS {
                return self.complete_ready(record.worker_id, snapshot).map(Some);
            }
            return Ok(Some(ProbeEvent::StructureState(StructureState::RunqStatus(snapshot))));
        }
        if record.event_type == EVENT_READY_RUNQ_STATUS {
            return Err(AssembleError::ReadyWithGroupingWorker {
                worker_id: record.worker_id,
                grouping_worker_id: record.grouping_worker_id,
            });
        }
        self.complete_execute_component(record.grouping_worker_id, snapshot)
    }

    fn on_global_runq_status(&mut self, record: GlobalRunqStatusRecord) -> Option<ProbeEvent> {
        if record.entry_index == record.size as u64 {
            let taken = std::mem::take(&mut self.global_runq);
            let entries = self.interpret_entries(taken);
            debug!("global run queue: {entries:?}");
        } else {
            self.global_runq.push(record.entry);
        }
        None
    }

    fn on_park(&self, record: ParkRecord) -> Result<Option<ProbeEvent>, AssembleError> {
        let nul = record
            .wait_reason
            .iter()
            .position(|&b| b == 0)
            .ok_or(AssembleError::UnterminatedWaitReason { worker_id: record.worker_id })?;
        let wait_reason = String::from_utf8_lossy(&record.wait_reason[..nul]).into_owned();
        Ok(Some(ProbeEvent::Notification(Notification::Park {
            worker_id: record.worker_id,
            parked: TaskRef {
                task_id: record.parked.task_id as i64,
                pc: self.interpret_pc(record.parked.pc),
            },
            wait_reason,
        })))
    }

    fn on_ready(&mut self, record: ReadyRecord) -> Option<ProbeEvent> {
        self.pending_readies.insert(
            record.worker_id,
            PendingReady { worker_id: record.worker_id, task_id: record.task_id as i64 },
        );
        None
    }

    fn on_execute(&mut self, record: ExecuteRecord) -> Result<Option<ProbeEvent>, AssembleError> {
        let caller = self.interpret_pc(record.caller_pc);
        match caller.func.as_deref() {
            None => return Err(AssembleError::UnresolvedPc { pc: record.caller_pc }),
            Some(SCHEDULE_FUNC) => {}
            Some(other) => {
                info!("execute event from non-target callsite ({other}), skipping");
                return Ok(None);
            }
        }
        self.pending_executes
            .insert(record.worker_id, PendingExecute { record, runqs: Vec::new() });
        Ok(None)
    }

    // Snapshot completion and routing.

    /// Terminal record seen: drain the accumulated entries and build the
    /// canonical snapshot. The terminal record's own entry is the
    /// next-slot task, dummy when that slot is empty.
    fn finish_snapshot(&mut self, record: &RunqStatusRecord) -> RunqSnapshot {
        let raw = self.local_runqs.remove(&RunqKey::of(record)).unwrap_or_default();
        RunqSnapshot {
            proc_id: record.proc_id,
            worker_id: (record.worker_id >= 0).then_some(record.worker_id),
            entries: self.interpret_entries(raw),
            next: self.interpret_entry(record.entry),
        }
    }

    fn complete_ready(
        &mut self,
        worker_id: i64,
        snapshot: RunqSnapshot,
    ) -> Result<ProbeEvent, AssembleError> {
        let pending = self
            .pending_readies
            .remove(&worker_id)
            .ok_or(AssembleError::MissingReadyBuffer(worker_id))?;
        Ok(ProbeEvent::StructureState(StructureState::Ready {
            worker_id: pending.worker_id,
            task_id: pending.task_id,
            runq: snapshot,
        }))
    }

    fn complete_execute_component(
        &mut self,
        grouping_worker_id: i64,
        snapshot: RunqSnapshot,
    ) -> Result<Option<ProbeEvent>, AssembleError> {
        let pending = self
            .pending_executes
            .get_mut(&grouping_worker_id)
            .ok_or(AssembleError::MissingExecuteBuffer(grouping_worker_id))?;
        // The late-update pass may already have refreshed this processor's
        // slot; replacing instead of appending keeps the component count
        // equal to the number of distinct processors.
        if let Some(slot) = pending.runqs.iter_mut().find(|runq| runq.proc_id == snapshot.proc_id)
        {
            *slot = snapshot;
        } else {
            pending.runqs.push(snapshot);
        }
        if !pending.is_complete() {
            return Ok(None);
        }
        let Some(pending) = self.pending_executes.remove(&grouping_worker_id) else {
            return Err(AssembleError::MissingExecuteBuffer(grouping_worker_id));
        };
        let record = pending.record;
        Ok(Some(ProbeEvent::StructureState(StructureState::Execute {
            worker_id: record.worker_id,
            found: TaskRef {
                task_id: record.found.task_id as i64,
                pc: self.interpret_pc(record.found.pc),
            },
            proc_id: record.proc_id,
            runqs: pending.runqs,
        })))
    }

    // PC interpretation.

    fn interpret_pc(&self, pc: u64) -> InterpretedPc {
        match self.resolver.resolve(pc) {
            Some(ResolvedPc { file, line, func }) => {
                InterpretedPc { file: Some(file), line: Some(line), func: Some(func) }
            }
            None => {
                warn!("cannot interpret PC {pc:#x}");
                InterpretedPc::default()
            }
        }
    }

    fn interpret_entry(&self, entry: RawQueueEntry) -> Option<TaskRef> {
        if entry.pc == 0 {
            // Dummy entry: the probe's encoding of "no task here".
            return None;
        }
        Some(TaskRef { task_id: entry.task_id as i64, pc: self.interpret_pc(entry.pc) })
    }

    fn interpret_entries(&self, entries: Vec<RawQueueEntry>) -> Vec<TaskRef> {
        entries.into_iter().filter_map(|entry| self.interpret_entry(entry)).collect()
    }
}

/// Walk a schedule callstack from the frame above the trigger and map the
/// first known runtime entry point to its reason.
fn find_schedule_reason(callstack: &[InterpretedPc]) -> ScheduleReason {
    for frame in &callstack[1..] {
        let Some(func) = frame.func.as_deref() else {
            break;
        };
        match func {
            "runtime.goexit" => return ScheduleReason::Goexit,
            "runtime.gopark" => return ScheduleReason::Gopark,
            "runtime.mstart" => return ScheduleReason::Mstart,
            _ => {}
        }
    }
    ScheduleReason::Other
}
