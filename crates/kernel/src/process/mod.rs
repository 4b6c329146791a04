//! Processes, tasks, scheduling and message passing.

pub mod task;
pub mod scheduler;
pub mod message;
pub mod wait;
#[allow(clippy::module_inception)]
pub mod process;

pub use self::message::{Message, MessageQueue, EWM_DRAW, ETM_QUIT};
pub use self::process::{
    create_process, kill_process, Privilege, Process, ProcessCreateInfo, ProcessFlags,
    ProcessStatus,
};
pub use self::task::{
    create_task, kill_task, Task, TaskCreateFlags, TaskCreateInfo, TaskKind, TaskPriority,
    TaskState,
};

use core::sync::atomic::{AtomicU32, Ordering};

/// Process identity. Zero is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

/// Task identity. Zero names the pre-scheduler boot context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u32);

/// Task currently executing. Before the scheduler starts this is the
/// boot context, id zero.
static CURRENT_TASK: AtomicU32 = AtomicU32::new(0);

pub fn current_task_id() -> TaskId {
    TaskId(CURRENT_TASK.load(Ordering::Acquire))
}

pub(crate) fn set_current_task(id: TaskId) {
    CURRENT_TASK.store(id.0, Ordering::Release);
}

/// Current task object, if the scheduler already owns one.
pub fn current_task() -> Option<alloc::sync::Arc<Task>> {
    task::get_task(current_task_id())
}

/// Current process object, resolved through the current task.
pub fn current_process() -> Option<alloc::sync::Arc<Process>> {
    current_task().and_then(|task| process::get_process(task.process))
}

#[cfg(test)]
pub fn set_current_for_tests(id: TaskId) {
    set_current_task(id);
}
