// Host-side stand-ins for the architecture surface.
//
// These keep the memory, scheduling and dispatch policy layers compiling
// and testable off target. They deliberately do nothing: no host test
// exercises a path that needs real interrupt masking or a real CR3.

use super::TaskContext;

pub fn disable_interrupts() {}

pub fn enable_interrupts() {}

pub fn interrupts_enabled() -> bool {
    false
}

pub fn halt() {}

pub fn load_cr3(_physical: u32) {}

pub fn read_cr2() -> u32 {
    0
}

pub fn in_port_byte(_port: u16) -> u8 {
    0
}

pub fn out_port_byte(_port: u16, _value: u8) {}

pub fn load_idt() {}

pub fn load_gdt() {}

pub fn set_kernel_stack(_esp0: u32) {}

pub fn save_fpu(_context: &mut TaskContext) {}

pub fn restore_fpu(_context: &TaskContext) {}

/// Host stand-in for the context switch: records nothing and returns,
/// leaving the caller running. Scheduler tests drive selection directly.
pub unsafe fn switch_to_task(_prev: *mut TaskContext, _next: *const TaskContext) {}

pub mod serial {
    pub fn init() {}
    pub fn write_str(_text: &str) {}
}

pub mod pic {
    pub fn remap_and_mask() {}
    pub fn end_of_interrupt(_irq: u8) {}
    pub fn unmask(_irq: u8) {}
}

pub mod pit {
    pub fn program_interval_timer() {}
}
