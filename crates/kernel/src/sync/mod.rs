//! Kernel synchronization objects
//!
//! A small fixed set of global mutexes is created at startup and
//! identified by well-known handles; every write to the corresponding
//! global table must hold the matching mutex. All kernel mutexes are
//! recursive and task-owned.

pub mod mutex;

pub use self::mutex::{KMutex, KMutexGuard};

use alloc::sync::Arc;
use lazy_static::lazy_static;

lazy_static! {
    /// Guards the global kernel object tables.
    pub static ref KERNEL_MUTEX: Arc<KMutex> = KMutex::new("kernel");
    /// Guards physical memory and page-table mutation.
    pub static ref MEMORY_MUTEX: Arc<KMutex> = KMutex::new("memory");
    /// Guards the global process list.
    pub static ref PROCESS_MUTEX: Arc<KMutex> = KMutex::new("process");
    /// Guards the global task list.
    pub static ref TASK_MUTEX: Arc<KMutex> = KMutex::new("task");
    /// Guards the mount table.
    pub static ref FILESYSTEM_MUTEX: Arc<KMutex> = KMutex::new("filesystem");
    /// Guards desktop/window collaborator state.
    pub static ref DESKTOP_MUTEX: Arc<KMutex> = KMutex::new("desktop");
    /// Guards the console sink.
    pub static ref CONSOLE_MUTEX: Arc<KMutex> = KMutex::new("console");
}

pub fn lock_kernel() -> KMutexGuard<'static> {
    KERNEL_MUTEX.lock()
}

pub fn lock_memory() -> KMutexGuard<'static> {
    MEMORY_MUTEX.lock()
}

pub fn lock_process() -> KMutexGuard<'static> {
    PROCESS_MUTEX.lock()
}

pub fn lock_task() -> KMutexGuard<'static> {
    TASK_MUTEX.lock()
}

pub fn lock_filesystem() -> KMutexGuard<'static> {
    FILESYSTEM_MUTEX.lock()
}

pub fn lock_desktop() -> KMutexGuard<'static> {
    DESKTOP_MUTEX.lock()
}

pub fn lock_console() -> KMutexGuard<'static> {
    CONSOLE_MUTEX.lock()
}

/// Force-release every mutex held by a dying task and drop it from all
/// waiter queues. Called by task teardown.
pub fn release_task_mutexes(task: crate::process::TaskId) {
    mutex::force_release_task(task);
}
