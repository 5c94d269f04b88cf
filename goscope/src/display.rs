//! Event display formatting for headless runs.

use crate::assemble::{
    InterpretedPc, Notification, ProbeEvent, RunqSnapshot, StructureState, TaskRef,
};

/// Render one probe event as a single human-readable line.
#[must_use]
pub fn render(event: &ProbeEvent) -> String {
    match event {
        ProbeEvent::Notification(Notification::NewTask {
            creator_task_id,
            worker_id,
            start_pc,
        }) => {
            format!(
                "🟢 new task by task {creator_task_id} on worker {worker_id}, starts at {}",
                render_pc(start_pc)
            )
        }
        ProbeEvent::Notification(Notification::Delay { task_id, worker_id, pc }) => {
            format!("⏳ delay hit: task {task_id} on worker {worker_id} at {}", render_pc(pc))
        }
        ProbeEvent::Notification(Notification::Schedule { worker_id, proc_id, reason }) => {
            match proc_id {
                Some(proc_id) => {
                    format!("🔄 schedule on worker {worker_id} (proc {proc_id}): {reason:?}")
                }
                None => format!("🔄 schedule on worker {worker_id}: {reason:?}"),
            }
        }
        ProbeEvent::Notification(Notification::Park { worker_id, parked, wait_reason }) => {
            format!(
                "🟣 park on worker {worker_id}: {} waiting for {wait_reason}",
                render_task(parked)
            )
        }
        ProbeEvent::StructureState(StructureState::RunqStatus(snapshot)) => {
            format!("📊 runq {}", render_runq(snapshot))
        }
        ProbeEvent::StructureState(StructureState::Execute {
            worker_id,
            found,
            proc_id,
            runqs,
        }) => {
            let queues: Vec<String> = runqs.iter().map(render_runq).collect();
            format!(
                "🎯 execute on worker {worker_id} (proc {proc_id}): picked {}; queues: [{}]",
                render_task(found),
                queues.join("; ")
            )
        }
        ProbeEvent::StructureState(StructureState::Ready { worker_id, task_id, runq }) => {
            format!(
                "🟡 ready on worker {worker_id}: task {task_id} -> runq {}",
                render_runq(runq)
            )
        }
    }
}

/// Serialize one probe event as a JSON line.
pub fn render_json(event: &ProbeEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

fn render_pc(pc: &InterpretedPc) -> String {
    match (&pc.func, &pc.file, pc.line) {
        (Some(func), Some(file), Some(line)) => format!("{func} ({file}:{line})"),
        (Some(func), ..) => func.clone(),
        _ => "<unresolved>".to_string(),
    }
}

fn render_task(task: &TaskRef) -> String {
    format!("task {} @ {}", task.task_id, render_pc(&task.pc))
}

fn render_runq(snapshot: &RunqSnapshot) -> String {
    let entries: Vec<String> = snapshot.entries.iter().map(render_task).collect();
    let next = snapshot.next.as_ref().map_or_else(|| "-".to_string(), render_task);
    match snapshot.worker_id {
        Some(worker_id) => format!(
            "p{} (worker {worker_id}): [{}], next {next}",
            snapshot.proc_id,
            entries.join(", ")
        ),
        None => format!("p{}: [{}], next {next}", snapshot.proc_id, entries.join(", ")),
    }
}
