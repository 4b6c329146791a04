// Process lifecycle
//
// A process owns an address space, a heap, a message queue and a group
// of tasks. The kernel process is immortal and owns the kernel address
// space; user processes own a page directory whose kernel half aliases
// the kernel's. Killing a process retires its tasks first; the body is
// reclaimed once the last task is gone.

use super::message::MessageQueue;
use super::task::{self, StackRange, TaskCreateFlags, TaskCreateInfo, TaskKind, TaskPriority};
use super::{wait, ProcessId, Task, TaskId};
use crate::exec;
use crate::fs;
use crate::klib::{KernelError, Result};
use crate::mm::heap::Heap;
use crate::mm::region::{AddressSpace, RegionFlags};
use crate::mm::{paging, page_align_up, PhysAddr, VMA_USER};
use crate::sync::KMutex;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

/// Heap floor for user processes.
pub const PROCESS_MINIMUM_HEAP_SIZE: u32 = 0x1_0000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        /// Killing this process also kills every descendant.
        const TERMINATE_CHILD_PROCESSES_ON_DEATH = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive,
    Dead,
}

/// The kernel process borrows the kernel address space; user processes
/// own theirs.
enum SpaceRef {
    Kernel,
    Owned(Mutex<AddressSpace>),
}

pub struct Process {
    pub id: ProcessId,
    /// Creating process; cleared when the parent dies without the
    /// cascade flag.
    owner: Mutex<Option<ProcessId>>,
    pub privilege: Privilege,
    pub flags: ProcessFlags,
    status: Mutex<ProcessStatus>,
    space: SpaceRef,
    heap: Mutex<Option<Heap>>,
    pub command_line: String,
    work_folder: Mutex<String>,
    pub messages: MessageQueue,
    /// Per-process mutex serializing structural changes (task creation,
    /// teardown).
    pub mutex: Arc<KMutex>,
    exit_code: AtomicU32,
    /// Desktop collaborator handle; zero when none.
    pub desktop: AtomicU32,
}

impl Process {
    pub fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> Option<ProcessId> {
        *self.owner.lock()
    }

    pub fn clear_owner(&self) {
        *self.owner.lock() = None;
    }

    pub fn work_folder(&self) -> String {
        self.work_folder.lock().clone()
    }

    pub fn set_work_folder(&self, folder: &str) {
        *self.work_folder.lock() = String::from(folder);
    }

    /// Physical address of this process's page directory.
    pub fn page_directory(&self) -> PhysAddr {
        match &self.space {
            SpaceRef::Kernel => paging::kernel_directory(),
            SpaceRef::Owned(space) => space.lock().page_directory,
        }
    }

    /// Run `f` over this process's address space.
    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> Result<R> {
        match &self.space {
            SpaceRef::Kernel => crate::mm::region::with_kernel_space(f),
            SpaceRef::Owned(space) => Ok(f(&mut space.lock())),
        }
    }

    /// Install the heap once its backing region is committed.
    pub fn install_heap(&self, heap: Heap) {
        *self.heap.lock() = Some(heap);
    }

    /// Allocate from the process heap. The kernel process draws from
    /// the shared kernel heap.
    pub fn heap_alloc(&self, size: usize) -> Result<*mut u8> {
        if self.privilege == Privilege::Kernel {
            return crate::mm::heap::kernel_heap_alloc(size);
        }
        let mut heap = self.heap.lock();
        heap.as_mut().ok_or(KernelError::InvalidState)?.alloc(size)
    }

    /// Return memory to the process heap.
    pub fn heap_free(&self, pointer: *mut u8) -> Result<()> {
        if self.privilege == Privilege::Kernel {
            return crate::mm::heap::kernel_heap_free(pointer);
        }
        let mut heap = self.heap.lock();
        heap.as_mut().ok_or(KernelError::InvalidState)?.free(pointer)
    }

    /// Carve a stack out of the process heap.
    pub fn alloc_stack(&self, size: u32) -> Result<StackRange> {
        let pointer = self.heap_alloc(size as usize)?;
        Ok(StackRange {
            base: pointer as usize as u32,
            size,
        })
    }

    pub fn free_stack(&self, stack: StackRange) -> Result<()> {
        if stack.base == 0 {
            return Ok(());
        }
        self.heap_free(stack.base as usize as *mut u8)
    }

    pub fn task_count(&self) -> usize {
        task::tasks_of_process(self.id).len()
    }

    fn mark_dead(&self, exit_code: u32) {
        *self.status.lock() = ProcessStatus::Dead;
        self.exit_code.store(exit_code, Ordering::Relaxed);
        wait::record_process_termination(self.id, exit_code);
    }
}

static PROCESSES: RwLock<BTreeMap<u32, Arc<Process>>> = RwLock::new(BTreeMap::new());
static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

pub fn get_process(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.read().get(&id.0).cloned()
}

/// The kernel process, installed at boot.
pub fn kernel_process() -> Option<Arc<Process>> {
    if !crate::kernel_ready() {
        return PROCESSES.read().values().next().cloned();
    }
    get_process(crate::kernel().kernel_process)
}

pub fn process_count() -> usize {
    PROCESSES.read().len()
}

/// Build and register the kernel process at boot. It draws from the
/// shared kernel heap committed by the memory bring-up.
pub fn init_kernel_process(command_line: &str) -> Arc<Process> {
    let id = ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed));
    let process = Arc::new(Process {
        id,
        owner: Mutex::new(None),
        privilege: Privilege::Kernel,
        flags: ProcessFlags::empty(),
        status: Mutex::new(ProcessStatus::Alive),
        space: SpaceRef::Kernel,
        heap: Mutex::new(None),
        command_line: String::from(command_line),
        work_folder: Mutex::new(String::from("/")),
        messages: MessageQueue::new(),
        mutex: KMutex::new("process-kernel"),
        exit_code: AtomicU32::new(0),
        desktop: AtomicU32::new(0),
    });
    PROCESSES.write().insert(id.0, process.clone());
    process
}

/// Parameters for `create_process`.
pub struct ProcessCreateInfo {
    pub command_line: String,
    pub flags: ProcessFlags,
    /// Inherited from the parent when absent.
    pub work_folder: Option<String>,
    pub priority: TaskPriority,
}

/// Executable path: first blank-separated token of the command line.
fn executable_path(command_line: &str) -> &str {
    command_line.split_whitespace().next().unwrap_or("")
}

/// Create a user process from an executable. Returns the process and its
/// initial (suspended) task; `add_task_to_queue` makes it runnable.
pub fn create_process(info: ProcessCreateInfo) -> Result<(Arc<Process>, Arc<Task>)> {
    let path = executable_path(&info.command_line);
    if path.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    // Pass 1: read the executable's layout demands.
    let mut file = fs::open_file(path, fs::OpenFlags::READ)?;
    let image = exec::get_executable_info(&mut file)?;
    fs::close_file(file)?;

    let heap_size = page_align_up(image.heap_requested.max(PROCESS_MINIMUM_HEAP_SIZE));
    let stack_size = image
        .stack_requested
        .max(task::TASK_MINIMUM_STACK_SIZE);

    let code_size = page_align_up(image.code_size);
    let data_size = page_align_up(image.data_size);

    let code_base = VMA_USER;
    let data_base = code_base + code_size;
    let heap_base = data_base + data_size;
    let total_size = code_size + data_size + heap_size;

    // Build the address space and make it current for the load.
    let directory = paging::alloc_user_page_directory()?;
    let previous_directory = paging::active_directory();
    paging::load_page_directory(directory);

    let mut space = AddressSpace::new(directory);
    let region_result = space.alloc_region(
        VMA_USER,
        0,
        total_size,
        RegionFlags::COMMIT | RegionFlags::READWRITE | RegionFlags::AT_OR_OVER | RegionFlags::USER,
        "ProcessSpace",
    );
    if let Err(error) = region_result {
        paging::load_page_directory(previous_directory);
        let _ = paging::free_user_page_directory(directory);
        return Err(error);
    }

    // Pass 2: place code and data, apply relocations.
    let load_result = (|| -> Result<()> {
        let mut file = fs::open_file(path, fs::OpenFlags::READ)?;
        let code =
            unsafe { core::slice::from_raw_parts_mut(code_base as usize as *mut u8, code_size as usize) };
        let data =
            unsafe { core::slice::from_raw_parts_mut(data_base as usize as *mut u8, data_size as usize) };
        let placement = exec::LoadPlacement {
            code_base,
            data_base,
        };
        exec::load_executable(&mut file, &image, placement, code, data)?;
        fs::close_file(file)?;
        Ok(())
    })();

    if let Err(error) = load_result {
        let _ = space.release_all();
        paging::load_page_directory(previous_directory);
        let _ = paging::free_user_page_directory(directory);
        return Err(error);
    }

    // Process heap lives right after the data section.
    let heap = unsafe {
        Heap::init(
            heap_base as usize as *mut u8,
            heap_size as usize,
            heap_size as usize,
        )?
    };

    let parent = super::current_process();
    let work_folder = match info.work_folder {
        Some(folder) => folder,
        None => parent
            .as_ref()
            .map(|p| p.work_folder())
            .unwrap_or_else(|| String::from("/")),
    };

    let id = ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed));
    let process = Arc::new(Process {
        id,
        owner: Mutex::new(parent.as_ref().map(|p| p.id)),
        privilege: Privilege::User,
        flags: info.flags,
        status: Mutex::new(ProcessStatus::Alive),
        space: SpaceRef::Owned(Mutex::new(space)),
        heap: Mutex::new(Some(heap)),
        command_line: info.command_line.clone(),
        work_folder: Mutex::new(work_folder),
        messages: MessageQueue::new(),
        mutex: KMutex::new("process-user"),
        exit_code: AtomicU32::new(0),
        desktop: AtomicU32::new(0),
    });

    {
        let _process_lock = crate::sync::lock_process();
        PROCESSES.write().insert(id.0, process.clone());
    }

    // Initial task starts suspended at the rebased entry point.
    let entry_point = code_base + (image.entry_point - image.code_base);
    let task = create_initial_task(&process, entry_point, stack_size, info.priority);

    paging::load_page_directory(previous_directory);

    let task = match task {
        Ok(task) => task,
        Err(error) => {
            kill_process(&process, 0)?;
            return Err(error);
        }
    };

    crate::info!(
        "process: created {:?} '{}' ({} bytes image)",
        id,
        process.command_line,
        total_size
    );

    Ok((process, task))
}

fn create_initial_task(
    process: &Arc<Process>,
    entry_point: u32,
    stack_size: u32,
    priority: TaskPriority,
) -> Result<Arc<Task>> {
    task::create_task(
        process,
        TaskCreateInfo {
            name: String::from(executable_path(&process.command_line)),
            entry_point,
            parameter: 0,
            stack_size,
            priority,
            flags: TaskCreateFlags::SUSPENDED,
            kind: TaskKind::User,
        },
    )
}

/// Transitive children of `root` (direct and indirect).
fn descendants_of(root: ProcessId) -> Vec<Arc<Process>> {
    let table = PROCESSES.read();
    let mut result: Vec<Arc<Process>> = Vec::new();
    let mut frontier: Vec<ProcessId> = alloc::vec![root];

    while let Some(parent) = frontier.pop() {
        for process in table.values() {
            if process.owner() == Some(parent)
                && !result.iter().any(|p| p.id == process.id)
            {
                frontier.push(process.id);
                result.push(process.clone());
            }
        }
    }
    result
}

/// Kill a process. With `TERMINATE_CHILD_PROCESSES_ON_DEATH` every
/// descendant dies under the same process-mutex hold; without it the
/// children are orphaned and keep running. The kernel process is
/// refused.
pub fn kill_process(process: &Arc<Process>, exit_code: u32) -> Result<()> {
    if process.privilege == Privilege::Kernel {
        return Err(KernelError::PermissionDenied);
    }

    let mut victims: Vec<Arc<Process>> = alloc::vec![process.clone()];

    {
        let _process_lock = crate::sync::lock_process();

        if process
            .flags
            .contains(ProcessFlags::TERMINATE_CHILD_PROCESSES_ON_DEATH)
        {
            victims.extend(descendants_of(process.id));
        } else {
            for child in descendants_of(process.id) {
                if child.owner() == Some(process.id) {
                    child.clear_owner();
                }
            }
        }

        for victim in &victims {
            victim.mark_dead(exit_code);
        }
    }

    for victim in &victims {
        for victim_task in task::tasks_of_process(victim.id) {
            wait::record_task_termination(victim_task.id, exit_code);
            let _ = task::kill_task(&victim_task);
        }
        // A process created with no surviving task still needs its
        // commit pass.
        if victim.task_count() == 0 {
            delete_process_commit(victim);
        }
    }

    crate::info!("process: killed {:?} (exit {})", process.id, exit_code);
    Ok(())
}

/// Reclaim a dead process once no task of it remains: release its
/// address space and page directory, drop its messages and remove it
/// from the table. The kernel process is never committed for deletion.
pub fn delete_process_commit(process: &Arc<Process>) {
    if process.privilege == Privilege::Kernel {
        return;
    }
    if process.task_count() != 0 {
        return;
    }

    if let SpaceRef::Owned(space) = &process.space {
        let directory = {
            let mut space = space.lock();
            let _ = space.release_all();
            space.page_directory
        };
        if paging::active_directory() == directory {
            paging::load_page_directory(paging::kernel_directory());
        }
        let _ = paging::free_user_page_directory(directory);
    }

    process.messages.clear();
    *process.heap.lock() = None;

    let mut table = PROCESSES.write();
    table.remove(&process.id.0);

    crate::debug!("process: reclaimed {:?}", process.id);
}

#[cfg(test)]
pub(crate) fn reset_processes_for_tests() {
    PROCESSES.write().clear();
    NEXT_PROCESS_ID.store(1, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn insert_bare_process_for_tests(
    id: ProcessId,
    owner: Option<ProcessId>,
    flags: ProcessFlags,
) -> Arc<Process> {
    let process = Arc::new(Process {
        id,
        owner: Mutex::new(owner),
        privilege: Privilege::User,
        flags,
        status: Mutex::new(ProcessStatus::Alive),
        space: SpaceRef::Kernel,
        heap: Mutex::new(None),
        command_line: String::from("test"),
        work_folder: Mutex::new(String::from("/")),
        messages: MessageQueue::new(),
        mutex: KMutex::new("process-test"),
        exit_code: AtomicU32::new(0),
        desktop: AtomicU32::new(0),
    });
    PROCESSES.write().insert(id.0, process.clone());
    if NEXT_PROCESS_ID.load(Ordering::Relaxed) <= id.0 {
        NEXT_PROCESS_ID.store(id.0 + 1, Ordering::Relaxed);
    }
    process
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TaskState;

    fn reset() {
        task::reset_tasks_for_tests();
        reset_processes_for_tests();
    }

    #[test]
    fn kill_without_cascade_orphans_children() {
        let _guard = crate::test_utils::serialize();
        reset();

        let parent =
            insert_bare_process_for_tests(ProcessId(10), None, ProcessFlags::empty());
        let child = insert_bare_process_for_tests(
            ProcessId(11),
            Some(ProcessId(10)),
            ProcessFlags::empty(),
        );
        let parent_task = task::insert_bare_task_for_tests(
            TaskId(100),
            ProcessId(10),
            TaskKind::User,
            TaskPriority::Normal,
            TaskState::Running,
        );
        let child_task = task::insert_bare_task_for_tests(
            TaskId(101),
            ProcessId(11),
            TaskKind::User,
            TaskPriority::Normal,
            TaskState::Running,
        );

        kill_process(&parent, 3).unwrap();

        // The child survives, orphaned; the parent's task is gone.
        assert_eq!(child.status(), ProcessStatus::Alive);
        assert_eq!(child.owner(), None);
        assert_eq!(child_task.state(), TaskState::Running);
        assert_eq!(parent_task.state(), TaskState::Dead);
        assert!(get_process(ProcessId(10)).is_none());
        assert_eq!(parent.exit_code(), 3);
    }

    #[test]
    fn kill_with_cascade_takes_descendants() {
        let _guard = crate::test_utils::serialize();
        reset();

        let parent = insert_bare_process_for_tests(
            ProcessId(20),
            None,
            ProcessFlags::TERMINATE_CHILD_PROCESSES_ON_DEATH,
        );
        let child = insert_bare_process_for_tests(
            ProcessId(21),
            Some(ProcessId(20)),
            ProcessFlags::empty(),
        );
        let grandchild = insert_bare_process_for_tests(
            ProcessId(22),
            Some(ProcessId(21)),
            ProcessFlags::empty(),
        );
        let grandchild_task = task::insert_bare_task_for_tests(
            TaskId(201),
            ProcessId(22),
            TaskKind::User,
            TaskPriority::Normal,
            TaskState::Running,
        );

        kill_process(&parent, 1).unwrap();

        assert!(get_process(ProcessId(20)).is_none());
        assert!(get_process(ProcessId(21)).is_none());
        assert!(get_process(ProcessId(22)).is_none());
        assert_eq!(grandchild_task.state(), TaskState::Dead);
        assert_eq!(child.status(), ProcessStatus::Dead);
        assert_eq!(grandchild.status(), ProcessStatus::Dead);
    }

    #[test]
    fn kernel_process_is_immortal() {
        let _guard = crate::test_utils::serialize();
        reset();

        let kernel = init_kernel_process("exos");
        assert_eq!(
            kill_process(&kernel, 0),
            Err(KernelError::PermissionDenied)
        );
        assert_eq!(kernel.status(), ProcessStatus::Alive);
    }
}
