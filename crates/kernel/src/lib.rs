//! EXOS kernel core
//!
//! A 32-bit protected-mode kernel for PC-class hardware: physical and
//! virtual memory management, a preemptive priority scheduler, recursive
//! kernel mutexes and message queues, fault/IRQ/syscall dispatch, an EXT2
//! driver, the EPK package format with its read-only PackageFS, and the
//! EXOS executable loader.
//!
//! The crate builds for the i386 target and, with the architecture layer
//! stubbed, for the host so that the policy layers are testable with
//! `cargo test`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    all(target_arch = "x86", not(test)),
    feature(alloc_error_handler)
)]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, logging, panic)
#[allow(special_module_name)]
pub mod klib;
// Architecture layer (i386 descriptors, port I/O, context switch)
pub mod arch;
// Boot hand-off (Multiboot) and kernel bring-up
pub mod boot;
// Memory management (frames, paging, regions, heaps)
pub mod mm;
// Kernel synchronization objects
pub mod sync;
// Processes, tasks, scheduler, messages
pub mod process;
// Fault/IRQ dispatch policy
pub mod interrupts;
// System call and driver call gates
pub mod syscall;
// Driver ABI and block devices
pub mod drivers;
// Filesystem registry, file handles, EXT2
pub mod fs;
// EPK packages and PackageFS
pub mod epk;
// Executable loader (EXOS format, ELF slot)
pub mod exec;
// System time (timer tick)
pub mod time;

// Test utilities (host builds only)
#[cfg(test)]
pub mod test_utils;

use spin::Once;

/// Global kernel state, built once during boot.
///
/// Subsystem tables live behind interior mutability inside their modules;
/// this value carries the identity of the boot-created objects that the
/// rest of the kernel threads through explicitly.
pub struct Kernel {
    /// Identifier of the kernel process (immortal).
    pub kernel_process: process::ProcessId,
    /// Identifier of the kernel main task (unkillable).
    pub kernel_main_task: process::TaskId,
}

static KERNEL: Once<Kernel> = Once::new();

/// Install the global kernel state. Called exactly once from boot.
pub(crate) fn install_kernel(kernel: Kernel) -> &'static Kernel {
    KERNEL.call_once(|| kernel)
}

/// Access the global kernel state.
///
/// Panics if called before boot has installed it; every call site runs
/// strictly after `boot::initialize`.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel state accessed before boot")
}

/// True once boot has completed enough for subsystems to use the
/// global kernel state.
pub fn kernel_ready() -> bool {
    KERNEL.get().is_some()
}
