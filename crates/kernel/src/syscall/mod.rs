//! System-call and driver-call gates
//!
//! Ring 3 raises the `EXOS_USER_CALL` trap with the call number in EAX
//! and the argument in EBX; the result comes back in EAX. The dispatch
//! table is a static array keyed by call number; unknown numbers return
//! a defined error. The `EXOS_DRIVER_CALL` trap carries a driver id and
//! a pointer to a `(function, parameter)` block and is converted to the
//! typed driver interface at this boundary only.

use crate::arch::TrapFrame;
use crate::mm::paging;
use crate::time;

pub const SYSCALL_GET_SYSTEM_TIME: u32 = 0x01;
pub const SYSCALL_SLEEP: u32 = 0x02;
pub const SYSCALL_LOCK_SEMAPHORE: u32 = 0x03;
pub const SYSCALL_UNLOCK_SEMAPHORE: u32 = 0x04;
pub const SYSCALL_EXIT_TASK: u32 = 0x05;
pub const SYSCALL_POST_MESSAGE: u32 = 0x06;

/// Result placed in EAX for an unknown call number.
pub const SYSCALL_ERROR_INVALID: u32 = u32::MAX;

type SyscallFn = fn(argument: u32, frame: &mut TrapFrame) -> u32;

const SYSCALL_TABLE_LEN: usize = 0x10;

/// Dispatch table, indexed by call number.
static SYSCALL_TABLE: [Option<SyscallFn>; SYSCALL_TABLE_LEN] = build_table();

const fn build_table() -> [Option<SyscallFn>; SYSCALL_TABLE_LEN] {
    let mut table: [Option<SyscallFn>; SYSCALL_TABLE_LEN] = [None; SYSCALL_TABLE_LEN];
    table[SYSCALL_GET_SYSTEM_TIME as usize] = Some(syscall_get_system_time as SyscallFn);
    table[SYSCALL_SLEEP as usize] = Some(syscall_sleep as SyscallFn);
    table[SYSCALL_LOCK_SEMAPHORE as usize] = Some(syscall_lock_semaphore as SyscallFn);
    table[SYSCALL_UNLOCK_SEMAPHORE as usize] = Some(syscall_unlock_semaphore as SyscallFn);
    table[SYSCALL_EXIT_TASK as usize] = Some(syscall_exit_task as SyscallFn);
    table[SYSCALL_POST_MESSAGE as usize] = Some(syscall_post_message as SyscallFn);
    table
}

fn syscall_get_system_time(_argument: u32, _frame: &mut TrapFrame) -> u32 {
    time::system_time() as u32
}

fn syscall_sleep(argument: u32, _frame: &mut TrapFrame) -> u32 {
    crate::process::scheduler::sleep(argument as u64);
    0
}

/// Argument: packed handle of a well-known mutex (index into the global
/// set). User code only reaches the global set through this gate.
fn syscall_lock_semaphore(argument: u32, _frame: &mut TrapFrame) -> u32 {
    match well_known_mutex(argument) {
        Some(mutex) => {
            let guard = mutex.lock();
            // Ownership is tracked per task; the guard's unlock happens
            // through the matching syscall.
            core::mem::forget(guard);
            0
        }
        None => SYSCALL_ERROR_INVALID,
    }
}

fn syscall_unlock_semaphore(argument: u32, _frame: &mut TrapFrame) -> u32 {
    match well_known_mutex(argument) {
        Some(mutex) => match mutex.unlock() {
            Ok(()) => 0,
            Err(_) => SYSCALL_ERROR_INVALID,
        },
        None => SYSCALL_ERROR_INVALID,
    }
}

fn well_known_mutex(index: u32) -> Option<&'static crate::sync::KMutex> {
    let mutex: &alloc::sync::Arc<crate::sync::KMutex> = match index {
        0 => &crate::sync::KERNEL_MUTEX,
        1 => &crate::sync::MEMORY_MUTEX,
        2 => &crate::sync::PROCESS_MUTEX,
        3 => &crate::sync::TASK_MUTEX,
        4 => &crate::sync::FILESYSTEM_MUTEX,
        5 => &crate::sync::DESKTOP_MUTEX,
        6 => &crate::sync::CONSOLE_MUTEX,
        _ => return None,
    };
    Some(mutex.as_ref())
}

fn syscall_exit_task(argument: u32, _frame: &mut TrapFrame) -> u32 {
    crate::process::task::exit_current_task(argument)
}

/// Argument: pointer to `[target, id, param1, param2]` in the caller's
/// address space.
fn syscall_post_message(argument: u32, _frame: &mut TrapFrame) -> u32 {
    if !paging::is_valid_memory(argument) {
        return SYSCALL_ERROR_INVALID;
    }
    let words = unsafe { core::slice::from_raw_parts(argument as usize as *const u32, 4) };
    match crate::process::message::post_message(words[0], words[1], words[2], words[3]) {
        Ok(()) => 0,
        Err(_) => SYSCALL_ERROR_INVALID,
    }
}

/// `EXOS_USER_CALL` entry: number in EAX, argument in EBX, result back
/// in EAX.
pub fn handle_user_call(frame: &mut TrapFrame) {
    let number = frame.eax;
    let argument = frame.ebx;

    let result = match SYSCALL_TABLE.get(number as usize).copied().flatten() {
        Some(handler) => handler(argument, frame),
        None => {
            crate::warn!("syscall: invalid call number {:#x}", number);
            SYSCALL_ERROR_INVALID
        }
    };

    frame.eax = result;
}

/// `EXOS_DRIVER_CALL` entry: driver id in EAX, pointer to a
/// `(function, parameter)` block in EBX, result back in EAX.
pub fn handle_driver_call(frame: &mut TrapFrame) {
    let driver_id = frame.eax;
    let block = frame.ebx;

    if !paging::is_valid_memory(block) {
        frame.eax = crate::drivers::DF_RETURN_BAD_PARAMETER;
        return;
    }

    let words = unsafe { core::slice::from_raw_parts(block as usize as *const u32, 2) };
    frame.eax = crate::drivers::dispatch_driver_command(driver_id, words[0], words[1]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_call_number_returns_error() {
        let _guard = crate::test_utils::serialize();
        let mut frame = TrapFrame::zeroed();
        frame.eax = 0x0F; // inside the table, unpopulated
        frame.ebx = 0;
        handle_user_call(&mut frame);
        assert_eq!(frame.eax, SYSCALL_ERROR_INVALID);

        let mut frame = TrapFrame::zeroed();
        frame.eax = 0x1234; // outside the table
        handle_user_call(&mut frame);
        assert_eq!(frame.eax, SYSCALL_ERROR_INVALID);
    }

    #[test]
    fn get_system_time_reports_the_clock() {
        let _guard = crate::test_utils::serialize();
        crate::time::set_system_time(4321);
        let mut frame = TrapFrame::zeroed();
        frame.eax = SYSCALL_GET_SYSTEM_TIME;
        handle_user_call(&mut frame);
        assert_eq!(frame.eax, 4321);
    }
}
