// Scheduler
//
// Single CPU, preemptive, priority-based round-robin. The timer IRQ tail
// and every voluntary yield run the same decision: wake due sleepers,
// pick the highest-priority RUNNING task (equal priorities rotate), and
// context-switch if the pick differs from the current task. A non-zero
// freeze depth turns the decision into a no-op so multi-structure
// mutations can be made atomic with respect to scheduling.

use super::task::{self, Task, TaskState, STACK_SAFETY_MARGIN};
use super::TaskId;
use crate::time;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

static FREEZE_DEPTH: AtomicU32 = AtomicU32::new(0);
/// Rotation cursor for equal-priority round-robin.
static LAST_PICKED: AtomicU32 = AtomicU32::new(0);

/// Deepen the freeze; ticks and yields do nothing while frozen.
pub fn freeze_scheduler() {
    FREEZE_DEPTH.fetch_add(1, Ordering::AcqRel);
}

pub fn unfreeze_scheduler() {
    let previous = FREEZE_DEPTH.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "unfreeze without matching freeze");
}

pub fn is_frozen() -> bool {
    FREEZE_DEPTH.load(Ordering::Acquire) > 0
}

/// Wake pass + selection policy. Pure over the task table; does not
/// switch.
pub fn select_next(now: u64) -> Option<TaskId> {
    let mut best: Option<(Arc<Task>, u8)> = None;
    let last_picked = LAST_PICKED.load(Ordering::Relaxed);

    // Candidate ranking for the rotation: ids strictly above the cursor
    // come first, then wraparound.
    let rank = |id: u32| -> (u8, u32) {
        if id > last_picked {
            (0, id)
        } else {
            (1, id)
        }
    };

    task::for_each_task(|candidate| {
        candidate.wake_if_due(now);
        if candidate.state() != TaskState::Running {
            return;
        }
        let priority = candidate.priority() as u8;
        match &best {
            None => best = Some((candidate.clone(), priority)),
            Some((current_best, best_priority)) => {
                if priority > *best_priority
                    || (priority == *best_priority
                        && rank(candidate.id.0) < rank(current_best.id.0))
                {
                    best = Some((candidate.clone(), priority));
                }
            }
        }
    });

    best.map(|(task, _)| task.id)
}

/// One scheduling decision; switches context when the pick changes.
pub fn schedule() {
    if is_frozen() {
        return;
    }

    let now = time::system_time();
    let next = match select_next(now) {
        Some(next) => next,
        None => return,
    };

    let current = super::current_task_id();
    if next == current {
        return;
    }

    LAST_PICKED.store(next.0, Ordering::Relaxed);
    switch_to(current, next);
}

fn switch_to(current: TaskId, next: TaskId) {
    let next_task = match task::get_task(next) {
        Some(task) => task,
        None => return,
    };

    super::set_current_task(next);
    crate::arch::set_kernel_stack(next_task.system_stack.top() - STACK_SAFETY_MARGIN);

    // A dead or never-scheduled predecessor parks its state in a scratch
    // context that nothing ever resumes.
    static SCRATCH: task::ContextCell =
        task::ContextCell::scratch();

    let previous_context = match task::get_task(current) {
        Some(previous) => previous.context.get(),
        None => SCRATCH.get(),
    };

    unsafe {
        crate::arch::switch_to_task(previous_context, next_task.context.get());
    }
}

/// Voluntary yield into the scheduling decision.
pub fn yield_now() {
    schedule();
}

/// Re-run the decision after a priority or queue change.
pub fn update() {
    schedule();
}

/// Timer IRQ tail: advance the clock, then decide.
pub fn tick() {
    time::tick();
    schedule();
}

/// Make a (suspended or fresh) task runnable.
pub fn add_task_to_queue(task: &Arc<Task>) {
    task.set_state(TaskState::Running, time::INFINITY);
}

/// Promote a parked task to RUNNING (message arrival, mutex hand-off,
/// object signal).
pub fn wake_task(id: TaskId) {
    if let Some(task) = task::get_task(id) {
        if task.state() != TaskState::Dead {
            task.set_state(TaskState::Running, time::INFINITY);
        }
    }
}

/// Park the current task in `state` until `wake_up_time` (or an explicit
/// wake) and hand the CPU away. The blocking caller never polls; the
/// wake pass restores it to RUNNING.
pub fn block_current(state: TaskState, wake_up_time: u64) {
    if let Some(task) = super::current_task() {
        task.set_state(state, wake_up_time);
    }
    schedule();
}

/// Park in WAITOBJECT until `deadline`.
pub fn block_current_on_object(deadline: u64) {
    block_current(TaskState::WaitObject, deadline);
}

/// Sleep the current task for `milliseconds`, returning once the tick
/// restores it to RUNNING.
pub fn sleep(milliseconds: u64) {
    let wake = time::system_time().saturating_add(milliseconds);
    block_current(TaskState::Sleeping, wake);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{task::TaskKind, task::TaskPriority, ProcessId, TaskId};

    fn seed(id: u32, priority: TaskPriority, state: TaskState) {
        task::insert_bare_task_for_tests(
            TaskId(id),
            ProcessId(1),
            TaskKind::KernelOther,
            priority,
            state,
        );
    }

    fn reset() {
        task::reset_tasks_for_tests();
        LAST_PICKED.store(0, Ordering::Relaxed);
        FREEZE_DEPTH.store(0, Ordering::Relaxed);
    }

    #[test]
    fn highest_priority_wins() {
        let _guard = crate::test_utils::serialize();
        reset();
        seed(1, TaskPriority::Normal, TaskState::Running);
        seed(2, TaskPriority::High, TaskState::Running);
        seed(3, TaskPriority::Lowest, TaskState::Running);

        assert_eq!(select_next(0), Some(TaskId(2)));
    }

    #[test]
    fn equal_priorities_rotate() {
        let _guard = crate::test_utils::serialize();
        reset();
        seed(1, TaskPriority::Normal, TaskState::Running);
        seed(2, TaskPriority::Normal, TaskState::Running);
        seed(3, TaskPriority::Normal, TaskState::Running);

        // Cursor at 0: lowest id above it first, then each successor.
        assert_eq!(select_next(0), Some(TaskId(1)));
        LAST_PICKED.store(1, Ordering::Relaxed);
        assert_eq!(select_next(0), Some(TaskId(2)));
        LAST_PICKED.store(2, Ordering::Relaxed);
        assert_eq!(select_next(0), Some(TaskId(3)));
        LAST_PICKED.store(3, Ordering::Relaxed);
        // Wraps back to the start.
        assert_eq!(select_next(0), Some(TaskId(1)));
    }

    #[test]
    fn sleepers_wake_at_their_deadline() {
        let _guard = crate::test_utils::serialize();
        reset();
        let sleeper = seed_and_get(1, TaskPriority::High);
        sleeper.set_state(TaskState::Sleeping, 500);
        seed(2, TaskPriority::Lowest, TaskState::Running);

        // Before the deadline the low-priority task runs.
        assert_eq!(select_next(499), Some(TaskId(2)));
        assert_eq!(sleeper.state(), TaskState::Sleeping);

        // At the deadline the sleeper returns and outranks it.
        assert_eq!(select_next(500), Some(TaskId(1)));
        assert_eq!(sleeper.state(), TaskState::Running);
    }

    #[test]
    fn blocked_and_dead_tasks_are_never_picked() {
        let _guard = crate::test_utils::serialize();
        reset();
        seed(1, TaskPriority::Critical, TaskState::WaitMessage);
        seed(2, TaskPriority::Critical, TaskState::Dead);
        seed(3, TaskPriority::Lowest, TaskState::Running);

        assert_eq!(select_next(0), Some(TaskId(3)));
    }

    #[test]
    fn freeze_makes_scheduling_a_noop() {
        let _guard = crate::test_utils::serialize();
        reset();
        seed(1, TaskPriority::Normal, TaskState::Running);

        freeze_scheduler();
        assert!(is_frozen());
        // Depth counts.
        freeze_scheduler();
        unfreeze_scheduler();
        assert!(is_frozen());
        unfreeze_scheduler();
        assert!(!is_frozen());
    }

    fn seed_and_get(id: u32, priority: TaskPriority) -> alloc::sync::Arc<Task> {
        task::insert_bare_task_for_tests(
            TaskId(id),
            ProcessId(1),
            TaskKind::KernelOther,
            priority,
            TaskState::Running,
        )
    }
}
