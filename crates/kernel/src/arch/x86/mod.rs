//! i386 implementation of the architecture surface.

pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod serial;
pub mod context;
mod stubs;

pub use self::cpu::{
    disable_interrupts, enable_interrupts, halt, in_port_byte, interrupts_enabled, load_cr3,
    out_port_byte, read_cr2,
};
pub use self::context::{enter_user_mode, restore_fpu, save_fpu, switch_to_task};
pub use self::gdt::{load_gdt, set_kernel_stack};
pub use self::idt::load_idt;
