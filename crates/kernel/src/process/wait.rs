// Waiting on kernel objects
//
// A task may wait on any mix of process and task handles with a timeout.
// It parks in WAITOBJECT and resumes when any handle signals. Exit codes
// of already-dead objects are retained in a termination-state cache so a
// wait issued after death still observes the code.

use super::{process, task, ProcessId, TaskId};
use crate::klib::{KernelError, Result};
use crate::time;
use spin::Mutex;

/// Handle kinds accepted by `wait_any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitHandle {
    Process(ProcessId),
    Task(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKey {
    Process(u32),
    Task(u32),
}

/// Retained exit codes of dead objects, oldest evicted first.
static TERMINATION_CACHE: Mutex<heapless::Vec<(WaitKey, u32), 128>> =
    Mutex::new(heapless::Vec::new());

fn cache_insert(key: WaitKey, exit_code: u32) {
    let mut cache = TERMINATION_CACHE.lock();
    if let Some(entry) = cache.iter_mut().find(|(k, _)| *k == key) {
        entry.1 = exit_code;
        return;
    }
    if cache.is_full() {
        cache.remove(0);
    }
    let _ = cache.push((key, exit_code));
}

fn cache_lookup(key: WaitKey) -> Option<u32> {
    TERMINATION_CACHE
        .lock()
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, code)| *code)
}

/// Record a task's exit code at death.
pub fn record_task_termination(id: TaskId, exit_code: u32) {
    cache_insert(WaitKey::Task(id.0), exit_code);
}

/// Record a process's exit code at death.
pub fn record_process_termination(id: ProcessId, exit_code: u32) {
    cache_insert(WaitKey::Process(id.0), exit_code);
}

/// Check one handle; `Some(exit_code)` once it has signalled.
fn poll_handle(handle: WaitHandle) -> Option<u32> {
    match handle {
        WaitHandle::Process(id) => match process::get_process(id) {
            Some(process) => {
                if process.status() == super::ProcessStatus::Dead {
                    Some(process.exit_code())
                } else {
                    None
                }
            }
            None => cache_lookup(WaitKey::Process(id.0)).or(Some(0)),
        },
        WaitHandle::Task(id) => match task::get_task(id) {
            Some(task) => {
                if task.state() == super::TaskState::Dead {
                    Some(task.return_value())
                } else {
                    None
                }
            }
            None => cache_lookup(WaitKey::Task(id.0)).or(Some(0)),
        },
    }
}

/// Wait until any handle signals, or until the timeout elapses.
/// Returns the index of the signalling handle and its exit code.
pub fn wait_any(handles: &[WaitHandle], timeout_ms: u64) -> Result<(usize, u32)> {
    if handles.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let deadline = time::deadline_after(timeout_ms);

    loop {
        for (index, handle) in handles.iter().enumerate() {
            if let Some(exit_code) = poll_handle(*handle) {
                return Ok((index, exit_code));
            }
        }

        if deadline != time::INFINITY && time::system_time() >= deadline {
            return Err(KernelError::TimedOut);
        }

        super::scheduler::block_current_on_object(deadline);

        // Without a scheduler behind us (boot, host) a park returns
        // immediately; bail out rather than spin.
        if !crate::kernel_ready() && deadline == time::INFINITY {
            return Err(KernelError::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{task::TaskKind, task::TaskPriority, TaskState};

    #[test]
    fn dead_object_yields_cached_exit_code() {
        let _guard = crate::test_utils::serialize();
        task::reset_tasks_for_tests();

        record_task_termination(TaskId(42), 7);
        let (index, code) = wait_any(&[WaitHandle::Task(TaskId(42))], 0).unwrap();
        assert_eq!(index, 0);
        assert_eq!(code, 7);
    }

    #[test]
    fn dead_task_in_table_yields_return_value() {
        let _guard = crate::test_utils::serialize();
        task::reset_tasks_for_tests();

        let task = task::insert_bare_task_for_tests(
            TaskId(5),
            ProcessId(1),
            TaskKind::KernelOther,
            TaskPriority::Normal,
            TaskState::Dead,
        );
        task.set_return_value(99);

        let (index, code) =
            wait_any(&[WaitHandle::Task(TaskId(9999)), WaitHandle::Task(TaskId(5))], 0)
                .unwrap();
        // The unknown handle also counts as signalled (no record of it
        // alive), and it comes first.
        assert_eq!(index, 0);
        assert_eq!(code, 0);

        let (index, code) = wait_any(&[WaitHandle::Task(TaskId(5))], 0).unwrap();
        assert_eq!(index, 0);
        assert_eq!(code, 99);
    }

    #[test]
    fn live_task_times_out() {
        let _guard = crate::test_utils::serialize();
        task::reset_tasks_for_tests();

        task::insert_bare_task_for_tests(
            TaskId(6),
            ProcessId(1),
            TaskKind::KernelOther,
            TaskPriority::Normal,
            TaskState::Running,
        );

        let result = wait_any(&[WaitHandle::Task(TaskId(6))], 0);
        assert_eq!(result, Err(KernelError::TimedOut));
    }
}
