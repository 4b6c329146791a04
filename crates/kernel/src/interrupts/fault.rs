// CPU exception policy
//
// Vector classes: benign vectors (debug, NMI, breakpoint, unknown) log
// and continue; everything else is fatal for the current task and ends
// in `die()`. Page faults log the faulting address and frame before
// dying; there is no on-demand paging in this release.

use crate::arch::TrapFrame;
use crate::process::{scheduler, task};

const VECTOR_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "NMI",
    "breakpoint",
    "overflow",
    "bound range",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor overrun",
    "invalid TSS",
    "segment not present",
    "stack segment fault",
    "general protection",
    "page fault",
    "reserved",
    "x87 FPU error",
    "alignment check",
    "machine check",
    "SIMD exception",
    "virtualization",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
];

/// Vectors that only log.
fn is_benign(vector: u32) -> bool {
    matches!(vector, 1 | 2 | 3)
}

pub fn handle_exception(frame: &mut TrapFrame) {
    let name = VECTOR_NAMES
        .get(frame.vector as usize)
        .copied()
        .unwrap_or("unknown");

    if is_benign(frame.vector) {
        crate::info!(
            "fault: {} at {:#x} (continuing)",
            name,
            frame.eip
        );
        return;
    }

    if frame.vector == 14 {
        let linear = crate::arch::read_cr2();
        crate::error!(
            "page fault at linear {:#x}, error {:#x}, eip {:#x}",
            linear,
            frame.error_code,
            frame.eip
        );
    }

    log_frame(name, frame);
    die();
}

fn log_frame(name: &str, frame: &TrapFrame) {
    let task_name = crate::process::current_task()
        .map(|task| task.name.clone())
        .unwrap_or_else(|| alloc::string::String::from("<boot>"));

    crate::error!(
        "fault: {} in task '{}' (error {:#x})",
        name,
        task_name,
        frame.error_code
    );
    crate::error!(
        "  eip={:#010x} cs={:#06x} eflags={:#010x}",
        frame.eip,
        frame.cs,
        frame.eflags
    );
    crate::error!(
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx
    );
    crate::error!(
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.esp_at_trap
    );
}

/// Terminal action of the fault dispatcher: serialize through the
/// kernel, memory and console mutexes, freeze the scheduler, kill the
/// current task, unfreeze, re-enable interrupts and halt until the tick
/// takes the CPU elsewhere.
pub fn die() -> ! {
    let _kernel = crate::sync::lock_kernel();
    let _memory = crate::sync::lock_memory();
    let _console = crate::sync::lock_console();

    scheduler::freeze_scheduler();
    if let Some(current) = crate::process::current_task() {
        if current.kind != task::TaskKind::KernelMain {
            let _ = task::kill_task(&current);
        }
    }
    scheduler::unfreeze_scheduler();

    crate::arch::enable_interrupts();
    loop {
        crate::arch::halt();
    }
}
