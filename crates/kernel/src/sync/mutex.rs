// Recursive task-owned kernel mutex
//
// Ownership is strict: only the owning task may unlock, each lock
// increments the depth and each unlock decrements it; ownership transfers
// FIFO to the head waiter on final unlock. No priority inheritance.

use crate::klib::{KernelError, Result};
use crate::process::TaskId;
use crate::time;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

struct MutexState {
    owner: Option<TaskId>,
    /// Lock depth; zero iff `owner` is also being transferred or unset.
    depth: u32,
    /// Tasks parked on this mutex, FIFO.
    waiters: VecDeque<TaskId>,
}

/// Recursive kernel mutex. Created through `KMutex::new` so that task
/// teardown can find and force-release it.
pub struct KMutex {
    name: &'static str,
    state: Mutex<MutexState>,
}

/// Registry of every live kernel mutex, used by `force_release_task`
/// when a task dies while owning or waiting on mutexes.
static REGISTRY: RwLock<Vec<Weak<KMutex>>> = RwLock::new(Vec::new());

enum Acquire {
    /// Caller now owns the mutex (or went one level deeper).
    Acquired,
    /// Caller was appended to the waiter queue.
    Queued,
}

impl KMutex {
    /// Create and register a mutex.
    pub fn new(name: &'static str) -> Arc<Self> {
        let mutex = Arc::new(Self {
            name,
            state: Mutex::new(MutexState {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            }),
        });

        let mut registry = REGISTRY.write();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&mutex));

        mutex
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// One acquisition attempt. Appends the caller to the waiter queue
    /// when the mutex is held by another task.
    fn try_acquire(&self, current: TaskId) -> Acquire {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(current);
                state.depth = 1;
                Acquire::Acquired
            }
            Some(owner) if owner == current => {
                // Recursive re-lock, or arrival of a FIFO transfer
                // (which parks ownership at depth zero).
                state.depth += 1;
                Acquire::Acquired
            }
            Some(_) => {
                if !state.waiters.contains(&current) {
                    state.waiters.push_back(current);
                }
                Acquire::Queued
            }
        }
    }

    fn remove_waiter(&self, task: TaskId) {
        self.state.lock().waiters.retain(|&t| t != task);
    }

    /// Acquire with an infinite timeout. Returns a guard that unlocks on
    /// drop.
    pub fn lock(&self) -> KMutexGuard<'_> {
        // INFINITY never reports failure.
        match self.lock_timeout(time::INFINITY) {
            Ok(guard) => guard,
            Err(_) => unreachable!("infinite mutex wait reported timeout"),
        }
    }

    /// Acquire with a finite timeout in milliseconds; `time::INFINITY`
    /// never gives up.
    pub fn lock_timeout(&self, timeout_ms: u64) -> Result<KMutexGuard<'_>> {
        let current = crate::process::current_task_id();
        let deadline = time::deadline_after(timeout_ms);

        loop {
            if let Acquire::Acquired = self.try_acquire(current) {
                return Ok(KMutexGuard { mutex: self });
            }

            if deadline != time::INFINITY && time::system_time() >= deadline {
                self.remove_waiter(current);
                return Err(KernelError::TimedOut);
            }

            crate::process::scheduler::block_current_on_object(deadline);
        }
    }

    /// Release one level. Only the owner may unlock; at depth zero the
    /// head waiter (if any) receives ownership and is made runnable.
    pub fn unlock(&self) -> Result<()> {
        let current = crate::process::current_task_id();
        let mut state = self.state.lock();

        match state.owner {
            Some(owner) if owner == current => {}
            _ => {
                crate::error!("mutex '{}': unlock by non-owner task {:?}", self.name, current);
                return Err(KernelError::InvalidState);
            }
        }

        state.depth -= 1;
        if state.depth == 0 {
            match state.waiters.pop_front() {
                Some(next) => {
                    // Transfer: the waiter completes the acquisition in
                    // its own try_acquire when it resumes.
                    state.owner = Some(next);
                    drop(state);
                    crate::process::scheduler::wake_task(next);
                }
                None => {
                    state.owner = None;
                }
            }
        }

        Ok(())
    }

    /// Owner and depth snapshot (diagnostics and tests).
    pub fn holder(&self) -> (Option<TaskId>, u32) {
        let state = self.state.lock();
        (state.owner, state.depth)
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn force_release(&self, task: TaskId) {
        let mut state = self.state.lock();
        state.waiters.retain(|&t| t != task);
        if state.owner == Some(task) {
            state.depth = 0;
            match state.waiters.pop_front() {
                Some(next) => {
                    state.owner = Some(next);
                    drop(state);
                    crate::process::scheduler::wake_task(next);
                }
                None => {
                    state.owner = None;
                }
            }
        }
    }
}

/// Scope guard returned by `lock`/`lock_timeout`.
pub struct KMutexGuard<'a> {
    mutex: &'a KMutex,
}

impl Drop for KMutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}

/// Walk the mutex registry on behalf of a dying task: drop it from every
/// waiter queue and force-release anything it still owns.
pub fn force_release_task(task: TaskId) {
    let registry = REGISTRY.read();
    for weak in registry.iter() {
        if let Some(mutex) = weak.upgrade() {
            mutex.force_release(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{self, TaskId};

    #[test]
    fn recursive_lock_tracks_depth() {
        let _guard = crate::test_utils::serialize();
        process::set_current_for_tests(TaskId(1));

        let mutex = KMutex::new("test-recursive");
        let g1 = mutex.lock();
        let g2 = mutex.lock();
        assert_eq!(mutex.holder(), (Some(TaskId(1)), 2));
        drop(g2);
        assert_eq!(mutex.holder(), (Some(TaskId(1)), 1));
        drop(g1);
        assert_eq!(mutex.holder(), (None, 0));
    }

    #[test]
    fn ownership_transfers_fifo() {
        let _guard = crate::test_utils::serialize();
        let mutex = KMutex::new("test-transfer");

        process::set_current_for_tests(TaskId(1));
        assert!(matches!(mutex.try_acquire(TaskId(1)), Acquire::Acquired));

        // Two contenders queue in order.
        assert!(matches!(mutex.try_acquire(TaskId(2)), Acquire::Queued));
        assert!(matches!(mutex.try_acquire(TaskId(3)), Acquire::Queued));
        assert_eq!(mutex.waiter_count(), 2);

        // Owner releases: head waiter receives ownership at depth 0 and
        // completes the acquisition on resume.
        mutex.unlock().unwrap();
        assert_eq!(mutex.holder(), (Some(TaskId(2)), 0));
        assert!(matches!(mutex.try_acquire(TaskId(2)), Acquire::Acquired));
        assert_eq!(mutex.holder(), (Some(TaskId(2)), 1));

        process::set_current_for_tests(TaskId(2));
        mutex.unlock().unwrap();
        assert_eq!(mutex.holder(), (Some(TaskId(3)), 0));
    }

    #[test]
    fn unlock_by_non_owner_is_an_error() {
        let _guard = crate::test_utils::serialize();
        let mutex = KMutex::new("test-owner");

        process::set_current_for_tests(TaskId(1));
        let g = mutex.lock();

        process::set_current_for_tests(TaskId(2));
        assert_eq!(mutex.unlock(), Err(crate::klib::KernelError::InvalidState));

        process::set_current_for_tests(TaskId(1));
        drop(g);
    }

    #[test]
    fn finite_timeout_expires() {
        let _guard = crate::test_utils::serialize();
        let mutex = KMutex::new("test-timeout");

        process::set_current_for_tests(TaskId(1));
        let _held = mutex.lock();

        process::set_current_for_tests(TaskId(2));
        // A zero timeout expires at the first deadline check.
        let result = mutex.lock_timeout(0);
        assert!(matches!(result, Err(crate::klib::KernelError::TimedOut)));
        assert_eq!(mutex.waiter_count(), 0);

        process::set_current_for_tests(TaskId(1));
    }

    #[test]
    fn dead_task_force_release() {
        let _guard = crate::test_utils::serialize();
        let mutex = KMutex::new("test-force");

        assert!(matches!(mutex.try_acquire(TaskId(7)), Acquire::Acquired));
        assert!(matches!(mutex.try_acquire(TaskId(8)), Acquire::Queued));

        force_release_task(TaskId(7));
        // Ownership moved to the queued task.
        assert_eq!(mutex.holder(), (Some(TaskId(8)), 0));

        force_release_task(TaskId(8));
        assert_eq!(mutex.holder(), (None, 0));
    }
}
