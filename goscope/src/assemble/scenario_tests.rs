//! End-to-end assembler scenarios: ordered raw-record sequences in,
//! canonical probe events out, through the real two-thread pipeline.

use std::sync::Arc;

use goscope_common::{
    EVENT_DELAY, EVENT_EXECUTE, EVENT_GLOBAL_RUNQ_STATUS, EVENT_NEW_TASK, EVENT_PARK,
    EVENT_READY, EVENT_READY_RUNQ_STATUS, EVENT_RUNQ_STATUS, EVENT_SCHEDULE, WAIT_REASON_LEN,
};

use super::events::{
    InterpretedPc, Notification, ProbeEvent, RunqSnapshot, ScheduleReason, StructureState,
    TaskRef,
};
use super::source::testing::CannedSource;
use super::{EventAssembler, ResolvePc, ResolvedPc};

/// Small-integer PCs mapped to fixed source positions; PC 5 is the
/// scheduler entry, 6-8 the runtime functions the reason search knows.
struct CannedResolver;

const CANNED: &[(u64, &str, i32, &str)] = &[
    (1, "file1", 1, "func1"),
    (2, "file2", 2, "func2"),
    (3, "file3", 3, "func3"),
    (4, "file4", 4, "func4"),
    (5, "proc.go", 5, "runtime.schedule"),
    (6, "proc.go", 6, "runtime.gopark"),
    (7, "proc.go", 7, "runtime.main"),
    (8, "proc.go", 8, "runtime.mstart"),
    (9, "main.go", 9, "main.main"),
];

impl ResolvePc for CannedResolver {
    fn resolve(&self, pc: u64) -> Option<ResolvedPc> {
        CANNED.iter().find(|&&(p, ..)| p == pc).map(|&(_, file, line, func)| ResolvedPc {
            file: file.to_string(),
            line,
            func: func.to_string(),
        })
    }
}

fn pc(n: u64) -> InterpretedPc {
    let &(_, file, line, func) =
        CANNED.iter().find(|&&(p, ..)| p == n).expect("canned PC");
    InterpretedPc {
        file: Some(file.to_string()),
        line: Some(line),
        func: Some(func.to_string()),
    }
}

fn task(id: i64, at: u64) -> TaskRef {
    TaskRef { task_id: id, pc: pc(at) }
}

/// Run the full pipeline over canned records and collect every emitted
/// event until the output channel closes.
fn run(records: Vec<Vec<u8>>) -> Vec<ProbeEvent> {
    let (source, _handle) = CannedSource::new(records);
    let running = EventAssembler::new(Arc::new(CannedResolver), source).start();
    let events: Vec<ProbeEvent> = running.events.iter().collect();
    running.join();
    events
}

// Record encoders, host byte order to match the decoder.

fn put(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_i(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

#[allow(clippy::too_many_arguments)]
fn runq_status(
    event_type: u64,
    proc_id: i64,
    head: u64,
    tail: u64,
    index: u64,
    entry: (u64, u64),
    worker_id: i64,
    grouping_worker_id: i64,
) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, event_type);
    put_i(&mut buf, proc_id);
    put(&mut buf, head);
    put(&mut buf, tail);
    put(&mut buf, index);
    put(&mut buf, entry.0);
    put(&mut buf, entry.1);
    put_i(&mut buf, worker_id);
    put_i(&mut buf, grouping_worker_id);
    buf
}

fn execute(
    worker_id: i64,
    found: (u64, u64),
    caller_pc: u64,
    proc_id: i64,
    num_processors: u64,
) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_EXECUTE);
    put_i(&mut buf, worker_id);
    put(&mut buf, found.0);
    put(&mut buf, found.1);
    put(&mut buf, caller_pc);
    put_i(&mut buf, proc_id);
    put(&mut buf, num_processors);
    buf
}

fn ready(worker_id: i64, task_id: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_READY);
    put_i(&mut buf, worker_id);
    put(&mut buf, task_id);
    buf
}

fn new_task(task_pc: u64, creator_task_id: u64, worker_id: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_NEW_TASK);
    put(&mut buf, task_pc);
    put(&mut buf, creator_task_id);
    put_i(&mut buf, worker_id);
    buf
}

fn delay(delay_pc: u64, task_id: u64, worker_id: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_DELAY);
    put(&mut buf, delay_pc);
    put(&mut buf, task_id);
    put_i(&mut buf, worker_id);
    buf
}

fn schedule(worker_id: i64, callstack: &[u64], proc_id: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_SCHEDULE);
    put_i(&mut buf, worker_id);
    for i in 0..8 {
        put(&mut buf, callstack.get(i).copied().unwrap_or(0));
    }
    put_i(&mut buf, callstack.len() as i64);
    put_i(&mut buf, proc_id);
    buf
}

fn park(worker_id: i64, parked: (u64, u64), wait_reason: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_PARK);
    put_i(&mut buf, worker_id);
    put(&mut buf, parked.0);
    put(&mut buf, parked.1);
    assert_eq!(wait_reason.len(), WAIT_REASON_LEN);
    buf.extend_from_slice(wait_reason);
    buf
}

fn global_runq_status(size: i64, index: u64, entry: (u64, u64)) -> Vec<u8> {
    let mut buf = Vec::new();
    put(&mut buf, EVENT_GLOBAL_RUNQ_STATUS);
    put_i(&mut buf, size);
    put(&mut buf, index);
    put(&mut buf, entry.0);
    put(&mut buf, entry.1);
    buf
}

fn wait_reason(text: &str) -> [u8; WAIT_REASON_LEN] {
    let mut buf = [0u8; WAIT_REASON_LEN];
    buf[..text.len()].copy_from_slice(text.as_bytes());
    buf
}

const DUMMY: (u64, u64) = (0, 0);

fn runq(proc_id: i64, worker_id: i64, entries: Vec<TaskRef>, next: Option<TaskRef>) -> RunqSnapshot {
    RunqSnapshot { proc_id, worker_id: Some(worker_id), entries, next }
}

// Scenarios.

#[test]
fn concurrent_runq_snapshots_from_different_workers() {
    let events = run(vec![
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 1, (1, 2), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 1, 2, 4, 2, (3, 4), 1, -1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 2, (2, 3), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 1, 2, 4, 3, (4, 5), 1, -1),
        runq_status(EVENT_RUNQ_STATUS, 1, 2, 4, 4, DUMMY, 1, -1),
    ]);
    assert_eq!(
        events,
        vec![
            ProbeEvent::StructureState(StructureState::RunqStatus(runq(
                0,
                0,
                vec![task(2, 1)],
                Some(task(3, 2)),
            ))),
            ProbeEvent::StructureState(StructureState::RunqStatus(runq(
                1,
                1,
                vec![task(4, 3), task(5, 4)],
                None,
            ))),
        ]
    );
}

#[test]
fn ready_pairs_with_the_following_queue_snapshot() {
    let events = run(vec![
        ready(0, 4),
        runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 2, 1, (1, 3), 0, -1),
        runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 2, 2, (2, 4), 0, -1),
    ]);
    assert_eq!(
        events,
        vec![ProbeEvent::StructureState(StructureState::Ready {
            worker_id: 0,
            task_id: 4,
            runq: runq(0, 0, vec![task(3, 1)], Some(task(4, 2))),
        })]
    );
}

#[test]
fn interleaved_execute_assemblies_group_by_worker() {
    let events = run(vec![
        execute(1, (1, 2), 5, 1, 2),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 1, (3, 3), 0, 1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 2, DUMMY, 0, 1),
        execute(0, (3, 3), 5, 0, 2),
        runq_status(EVENT_RUNQ_STATUS, 0, 2, 2, 2, DUMMY, 0, 0),
        runq_status(EVENT_RUNQ_STATUS, 1, 1, 1, 1, DUMMY, 1, 1),
        runq_status(EVENT_RUNQ_STATUS, 1, 1, 1, 1, DUMMY, 1, 0),
    ]);
    assert_eq!(
        events,
        vec![
            ProbeEvent::StructureState(StructureState::Execute {
                worker_id: 1,
                found: task(2, 1),
                proc_id: 1,
                runqs: vec![
                    // Worker 0's own sweep re-observed P0 (empty by then)
                    // before this assembly completed, so the late update
                    // superseded the one queued task seen earlier.
                    runq(0, 0, vec![], None),
                    runq(1, 1, vec![], None),
                ],
            }),
            ProbeEvent::StructureState(StructureState::Execute {
                worker_id: 0,
                found: task(3, 3),
                proc_id: 0,
                runqs: vec![
                    runq(0, 0, vec![], None),
                    runq(1, 1, vec![], None),
                ],
            }),
        ]
    );
}

#[test]
fn standalone_snapshot_late_updates_a_pending_execute() {
    let events = run(vec![
        execute(1, (1, 2), 5, 1, 2),
        // First sweep sees P0 with one queued task.
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 1, (3, 3), 0, 1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 2, DUMMY, 0, 1),
        // A standalone reader then observes P0 with two.
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 1, (3, 3), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 2, (4, 4), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 3, DUMMY, 0, -1),
        // The sweep finishes with P1.
        runq_status(EVENT_RUNQ_STATUS, 1, 1, 1, 1, DUMMY, 1, 1),
    ]);
    assert_eq!(
        events,
        vec![
            ProbeEvent::StructureState(StructureState::RunqStatus(runq(
                0,
                0,
                vec![task(3, 3), task(4, 4)],
                None,
            ))),
            ProbeEvent::StructureState(StructureState::Execute {
                worker_id: 1,
                found: task(2, 1),
                proc_id: 1,
                runqs: vec![
                    // The fresher standalone observation replaced the
                    // sweep's stale one.
                    runq(0, 0, vec![task(3, 3), task(4, 4)], None),
                    runq(1, 1, vec![], None),
                ],
            }),
        ]
    );
}

#[test]
fn ready_snapshot_late_updates_a_pending_execute() {
    let events = run(vec![
        execute(1, (1, 2), 5, 1, 2),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 1, (3, 3), 0, 1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 2, DUMMY, 0, 1),
        ready(0, 4),
        runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 2, 1, (3, 3), 0, -1),
        runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 2, 2, (4, 4), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 1, 1, 1, 1, DUMMY, 1, 1),
    ]);
    let post_ready = runq(0, 0, vec![task(3, 3)], Some(task(4, 4)));
    assert_eq!(
        events,
        vec![
            ProbeEvent::StructureState(StructureState::Ready {
                worker_id: 0,
                task_id: 4,
                runq: post_ready.clone(),
            }),
            ProbeEvent::StructureState(StructureState::Execute {
                worker_id: 1,
                found: task(2, 1),
                proc_id: 1,
                runqs: vec![post_ready, runq(1, 1, vec![], None)],
            }),
        ]
    );
}

#[test]
fn execute_from_non_target_callsite_is_dropped() {
    // Caller PC 9 resolves to main.main, not the scheduler; the following
    // standalone snapshot shows the stream keeps flowing and no execute
    // buffer was left behind.
    let events = run(vec![
        execute(1, (1, 2), 9, 1, 2),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 1, 1, DUMMY, 0, -1),
    ]);
    assert_eq!(
        events,
        vec![ProbeEvent::StructureState(StructureState::RunqStatus(runq(0, 0, vec![], None)))]
    );
}

#[test]
fn schedule_reason_comes_from_the_first_known_runtime_frame() {
    let cases = [
        (vec![5, 6, 7], ScheduleReason::Gopark),
        (vec![5, 8], ScheduleReason::Mstart),
        (vec![5, 9, 7], ScheduleReason::Other),
        (vec![5], ScheduleReason::Other),
    ];
    for (callstack, reason) in cases {
        let events = run(vec![schedule(0, &callstack, -1)]);
        assert_eq!(
            events,
            vec![ProbeEvent::Notification(Notification::Schedule {
                worker_id: 0,
                proc_id: None,
                reason,
            })],
            "callstack {callstack:?}"
        );
    }
}

#[test]
fn schedule_carries_the_processor_when_one_is_held() {
    let events = run(vec![schedule(1, &[5, 6], 2)]);
    assert_eq!(
        events,
        vec![ProbeEvent::Notification(Notification::Schedule {
            worker_id: 1,
            proc_id: Some(2),
            reason: ScheduleReason::Gopark,
        })]
    );
}

#[test]
fn schedule_with_foreign_trigger_is_fatal() {
    // Trigger frame resolves to main.main: decoder stops, channel closes.
    assert_eq!(run(vec![schedule(0, &[9, 6], -1)]), vec![]);
}

#[test]
fn notifications_interpret_their_pcs() {
    let events = run(vec![
        new_task(1, 2, 0),
        delay(2, 3, 1),
        park(0, (1, 2), &wait_reason("chan receive")),
    ]);
    assert_eq!(
        events,
        vec![
            ProbeEvent::Notification(Notification::NewTask {
                creator_task_id: 2,
                worker_id: 0,
                start_pc: pc(1),
            }),
            ProbeEvent::Notification(Notification::Delay { task_id: 3, worker_id: 1, pc: pc(2) }),
            ProbeEvent::Notification(Notification::Park {
                worker_id: 0,
                parked: task(2, 1),
                wait_reason: "chan receive".to_string(),
            }),
        ]
    );
}

#[test]
fn park_without_nul_terminator_is_fatal() {
    assert_eq!(run(vec![park(0, (1, 2), &[b'x'; WAIT_REASON_LEN])]), vec![]);
}

#[test]
fn unknown_event_type_is_fatal() {
    let mut record = Vec::new();
    put(&mut record, 99);
    assert_eq!(run(vec![record, ready(0, 1)]), vec![]);
}

#[test]
fn entry_index_beyond_tail_is_fatal() {
    assert_eq!(
        run(vec![runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 5, (1, 2), 0, -1)]),
        vec![]
    );
}

#[test]
fn queue_snapshot_without_owning_worker_has_no_worker_id() {
    let events = run(vec![runq_status(EVENT_RUNQ_STATUS, 0, 1, 1, 1, DUMMY, -1, -1)]);
    assert_eq!(
        events,
        vec![ProbeEvent::StructureState(StructureState::RunqStatus(RunqSnapshot {
            proc_id: 0,
            worker_id: None,
            entries: vec![],
            next: None,
        }))]
    );
}

#[test]
fn ready_snapshot_with_grouping_worker_is_fatal() {
    let events = run(vec![
        ready(0, 4),
        runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 1, 1, DUMMY, 0, 1),
    ]);
    assert_eq!(events, vec![]);
}

#[test]
fn ready_completion_without_pending_ready_is_fatal() {
    let events = run(vec![runq_status(EVENT_READY_RUNQ_STATUS, 0, 1, 1, 1, DUMMY, 0, -1)]);
    assert_eq!(events, vec![]);
}

#[test]
fn grouped_snapshot_without_pending_execute_is_fatal() {
    let events = run(vec![runq_status(EVENT_RUNQ_STATUS, 0, 1, 1, 1, DUMMY, 0, 1)]);
    assert_eq!(events, vec![]);
}

#[test]
fn global_queue_assembles_silently() {
    let events = run(vec![
        global_runq_status(2, 0, (1, 2)),
        global_runq_status(2, 1, (2, 3)),
        global_runq_status(2, 2, DUMMY),
    ]);
    assert_eq!(events, vec![]);
}

#[test]
fn close_discards_partial_assemblies() {
    // An execute sweep and a ready that never complete: the source closes
    // and nothing is emitted for either.
    let events = run(vec![
        execute(1, (1, 2), 5, 1, 2),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 2, 1, (3, 3), 0, 1),
        ready(0, 4),
    ]);
    assert_eq!(events, vec![]);
}

#[test]
fn emitted_snapshots_never_contain_dummy_entries() {
    // A well-formed stream carries the dummy only in the terminal
    // next-slot position; streamed entries before the tail are real.
    let events = run(vec![
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 1, (1, 2), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 2, (2, 3), 0, -1),
        runq_status(EVENT_RUNQ_STATUS, 0, 1, 3, 3, DUMMY, 0, -1),
    ]);
    let ProbeEvent::StructureState(StructureState::RunqStatus(snapshot)) = &events[0] else {
        panic!("expected a run queue status event");
    };
    assert!(snapshot.entries.iter().all(|entry| entry.pc.func.is_some()));
    assert_eq!(snapshot.next, None);
}
