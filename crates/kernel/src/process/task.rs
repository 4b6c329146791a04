// Task model
//
// A task is one thread of execution inside a process: two stacks (user +
// supervisor), a saved context, a priority, a bounded message queue and a
// scheduling state. Exactly one task in the system is the kernel main
// task and it cannot be killed.

use super::{message::MessageQueue, scheduler, ProcessId, TaskId};
use crate::arch::TaskContext;
use crate::klib::{KernelError, Result};
use crate::time;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::{Mutex, RwLock};

/// Stacks smaller than this are rounded up.
pub const TASK_MINIMUM_STACK_SIZE: u32 = 0x4000;
/// Supervisor stack handed to every task.
pub const TASK_SYSTEM_STACK_SIZE: u32 = 0x4000;
/// Gap left between the TSS ESP0 and the true stack top.
pub const STACK_SAFETY_MARGIN: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Sleeping,
    WaitMessage,
    WaitObject,
    Suspended,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// The one task that may never die.
    KernelMain,
    KernelOther,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskPriority {
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => TaskPriority::Lowest,
            1 => TaskPriority::Low,
            2 => TaskPriority::Normal,
            3 => TaskPriority::High,
            _ => TaskPriority::Critical,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskCreateFlags: u32 {
        /// Start parked in SUSPENDED instead of RUNNING.
        const SUSPENDED = 1 << 0;
        /// This task's supervisor stack primes the TSS ESP0.
        const MAIN = 1 << 1;
    }
}

/// A linear stack range.
#[derive(Debug, Clone, Copy)]
pub struct StackRange {
    pub base: u32,
    pub size: u32,
}

impl StackRange {
    pub fn top(&self) -> u32 {
        self.base + self.size
    }
}

struct SchedState {
    state: TaskState,
    /// Absolute wake time for SLEEPING and timed WAITOBJECT parks;
    /// `time::INFINITY` when only an event can resume the task.
    wake_up_time: u64,
}

/// Saved context cell. Only the scheduler touches it, with the scheduler
/// frozen or interrupts off.
pub struct ContextCell(UnsafeCell<TaskContext>);

unsafe impl Send for ContextCell {}
unsafe impl Sync for ContextCell {}

impl ContextCell {
    pub fn get(&self) -> *mut TaskContext {
        self.0.get()
    }

    /// Throwaway context for switches away from a task that no longer
    /// exists.
    pub const fn scratch() -> Self {
        ContextCell(UnsafeCell::new(TaskContext::new()))
    }
}

pub struct Task {
    pub id: TaskId,
    pub process: ProcessId,
    pub name: String,
    pub kind: TaskKind,
    priority: AtomicU8,
    sched: Mutex<SchedState>,
    /// Entry point: a kernel function or a user linear address.
    pub entry_point: u32,
    pub parameter: u32,
    pub user_stack: StackRange,
    pub system_stack: StackRange,
    pub context: ContextCell,
    pub messages: MessageQueue,
    return_value: AtomicU32,
}

impl Task {
    pub fn state(&self) -> TaskState {
        self.sched.lock().state
    }

    pub fn wake_up_time(&self) -> u64 {
        self.sched.lock().wake_up_time
    }

    pub(super) fn set_state(&self, state: TaskState, wake_up_time: u64) {
        let mut sched = self.sched.lock();
        if sched.state == TaskState::Dead {
            return;
        }
        sched.state = state;
        sched.wake_up_time = wake_up_time;
    }

    pub(super) fn mark_dead(&self) {
        let mut sched = self.sched.lock();
        sched.state = TaskState::Dead;
        sched.wake_up_time = time::INFINITY;
    }

    pub fn priority(&self) -> TaskPriority {
        TaskPriority::from_raw(self.priority.load(Ordering::Relaxed))
    }

    pub(super) fn set_priority_raw(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn return_value(&self) -> u32 {
        self.return_value.load(Ordering::Relaxed)
    }

    pub fn set_return_value(&self, value: u32) {
        self.return_value.store(value, Ordering::Relaxed);
    }

    /// Wake the sleeper if its deadline has passed. Returns true when the
    /// task was promoted to RUNNING.
    pub(super) fn wake_if_due(&self, now: u64) -> bool {
        let mut sched = self.sched.lock();
        let due = matches!(
            sched.state,
            TaskState::Sleeping | TaskState::WaitObject | TaskState::WaitMessage
        ) && sched.wake_up_time != time::INFINITY
            && now >= sched.wake_up_time;
        if due {
            sched.state = TaskState::Running;
            sched.wake_up_time = time::INFINITY;
        }
        due
    }
}

/// Global task table.
static TASKS: RwLock<BTreeMap<u32, Arc<Task>>> = RwLock::new(BTreeMap::new());
static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

pub fn get_task(id: TaskId) -> Option<Arc<Task>> {
    TASKS.read().get(&id.0).cloned()
}

pub fn task_count() -> usize {
    TASKS.read().len()
}

pub fn tasks_of_process(process: ProcessId) -> alloc::vec::Vec<Arc<Task>> {
    TASKS
        .read()
        .values()
        .filter(|task| task.process == process)
        .cloned()
        .collect()
}

pub(super) fn for_each_task(mut f: impl FnMut(&Arc<Task>)) {
    for task in TASKS.read().values() {
        f(task);
    }
}

/// Parameters for `create_task`.
pub struct TaskCreateInfo {
    pub name: String,
    pub entry_point: u32,
    pub parameter: u32,
    pub stack_size: u32,
    pub priority: TaskPriority,
    pub flags: TaskCreateFlags,
    pub kind: TaskKind,
}

/// Create a task inside `process`, allocating its two stacks from the
/// process and kernel heaps and seeding its saved context.
pub fn create_task(
    process: &Arc<super::Process>,
    mut info: TaskCreateInfo,
) -> Result<Arc<Task>> {
    if info.entry_point == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if info.stack_size < TASK_MINIMUM_STACK_SIZE {
        info.stack_size = TASK_MINIMUM_STACK_SIZE;
    }

    let _kernel_lock = crate::sync::lock_kernel();
    let _process_lock = process.mutex.lock();

    let user_stack = process.alloc_stack(info.stack_size)?;
    let system_stack = match super::process::kernel_process() {
        Some(kernel_process) => kernel_process
            .alloc_stack(TASK_SYSTEM_STACK_SIZE)
            .map_err(|error| {
                let _ = process.free_stack(user_stack);
                error
            })?,
        None => {
            let _ = process.free_stack(user_stack);
            return Err(KernelError::InvalidState);
        }
    };

    let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));

    let initial_state = if info.flags.contains(TaskCreateFlags::SUSPENDED) {
        TaskState::Suspended
    } else {
        TaskState::Running
    };

    let mut context = TaskContext::new();
    context.cr3 = process.page_directory();
    seed_context(&mut context, system_stack);

    let task = Arc::new(Task {
        id,
        process: process.id,
        name: info.name,
        kind: info.kind,
        priority: AtomicU8::new(info.priority as u8),
        sched: Mutex::new(SchedState {
            state: initial_state,
            wake_up_time: time::INFINITY,
        }),
        entry_point: info.entry_point,
        parameter: info.parameter,
        user_stack,
        system_stack,
        context: ContextCell(UnsafeCell::new(context)),
        messages: MessageQueue::new(),
        return_value: AtomicU32::new(0),
    });

    TASKS.write().insert(id.0, task.clone());

    if info.flags.contains(TaskCreateFlags::MAIN) {
        crate::arch::set_kernel_stack(system_stack.top() - STACK_SAFETY_MARGIN);
    }

    crate::debug!(
        "task: created '{}' ({:?}) in process {:?}",
        task.name,
        task.id,
        task.process
    );

    Ok(task)
}

/// Lay out the bootstrap frame so the first switch into the task lands
/// in the entry trampoline.
#[cfg(target_arch = "x86")]
fn seed_context(context: &mut TaskContext, system_stack: StackRange) {
    let top = system_stack.top() - STACK_SAFETY_MARGIN;
    // Frame popped by the switch: eflags, edi, esi, ebx, ebp, then the
    // return target.
    let frame = [0u32, 0, 0, 0, 0, task_entry_trampoline as usize as u32];
    let frame_base = top - (frame.len() * 4) as u32;
    unsafe {
        core::ptr::copy_nonoverlapping(
            frame.as_ptr(),
            frame_base as *mut u32,
            frame.len(),
        );
    }
    context.esp = frame_base;
}

#[cfg(not(target_arch = "x86"))]
fn seed_context(_context: &mut TaskContext, _system_stack: StackRange) {}

/// First instruction of every task: run the entry function, then retire
/// the task with its return value.
#[cfg(target_arch = "x86")]
extern "C" fn task_entry_trampoline() -> ! {
    crate::arch::enable_interrupts();

    let task = super::current_task().expect("trampoline without a current task");
    let value = match task.kind {
        TaskKind::User => crate::arch::enter_user_mode(task.entry_point, task.user_stack.top()),
        _ => {
            let entry: extern "C" fn(u32) -> u32 =
                unsafe { core::mem::transmute(task.entry_point as usize) };
            entry(task.parameter)
        }
    };

    task.set_return_value(value);
    exit_current_task(value);
}

/// Retire the calling task: record the exit value, mark it dead and
/// yield away for the last time.
pub fn exit_current_task(value: u32) -> ! {
    if let Some(task) = super::current_task() {
        task.set_return_value(value);
        super::wait::record_task_termination(task.id, value);
        let _ = kill_task(&task);
    }
    loop {
        scheduler::yield_now();
        crate::arch::halt();
    }
}

/// Kill a task. The kernel main task is refused. The dead task's mutexes
/// are force-released, its messages dropped and its stacks returned.
pub fn kill_task(task: &Arc<Task>) -> Result<()> {
    if task.kind == TaskKind::KernelMain {
        return Err(KernelError::PermissionDenied);
    }

    let _kernel_lock = crate::sync::lock_kernel();
    scheduler::freeze_scheduler();

    task.mark_dead();
    crate::sync::release_task_mutexes(task.id);
    task.messages.clear();
    TASKS.write().remove(&task.id.0);

    if let Some(process) = super::process::get_process(task.process) {
        let _ = process.free_stack(task.user_stack);
        if let Some(kernel_process) = super::process::kernel_process() {
            let _ = kernel_process.free_stack(task.system_stack);
        }

        // Last task gone: the process body can be reclaimed.
        if task_count_of(task.process) == 0 && process.status() == super::ProcessStatus::Dead {
            super::process::delete_process_commit(&process);
        }
    }

    scheduler::unfreeze_scheduler();

    crate::debug!("task: killed '{}' ({:?})", task.name, task.id);
    Ok(())
}

fn task_count_of(process: ProcessId) -> usize {
    TASKS
        .read()
        .values()
        .filter(|task| task.process == process)
        .count()
}

/// Change a task's priority and re-run the selection policy.
pub fn set_priority(task: &Arc<Task>, priority: TaskPriority) -> TaskPriority {
    let _kernel_lock = crate::sync::lock_kernel();
    let old = task.priority();
    task.set_priority_raw(priority);
    scheduler::update();
    old
}

#[cfg(test)]
pub(crate) fn reset_tasks_for_tests() {
    TASKS.write().clear();
    NEXT_TASK_ID.store(1, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn insert_bare_task_for_tests(
    id: TaskId,
    process: ProcessId,
    kind: TaskKind,
    priority: TaskPriority,
    state: TaskState,
) -> Arc<Task> {
    let task = Arc::new(Task {
        id,
        process,
        name: String::from("test"),
        kind,
        priority: AtomicU8::new(priority as u8),
        sched: Mutex::new(SchedState {
            state,
            wake_up_time: time::INFINITY,
        }),
        entry_point: 0x1000,
        parameter: 0,
        user_stack: StackRange { base: 0, size: 0 },
        system_stack: StackRange { base: 0, size: 0 },
        context: ContextCell(UnsafeCell::new(TaskContext::new())),
        messages: MessageQueue::new(),
        return_value: AtomicU32::new(0),
    });
    TASKS.write().insert(id.0, task.clone());
    if NEXT_TASK_ID.load(Ordering::Relaxed) <= id.0 {
        NEXT_TASK_ID.store(id.0 + 1, Ordering::Relaxed);
    }
    task
}
