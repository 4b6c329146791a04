// Interrupt Descriptor Table
//
// 48 interrupt gates cover the CPU exceptions and the remapped PIC lines.
// Two additional trap gates carry the system-call and driver-call
// vectors; trap gates leave interrupts enabled on entry, interrupt gates
// do not. The user-call gate has DPL 3 so ring 3 may raise it; the
// driver-call gate stays DPL 0.

use super::gdt::SELECTOR_KERNEL_CODE;
use super::stubs;
use core::arch::asm;
use lazy_static::lazy_static;
use spin::Mutex;

/// Vector of the system-call trap gate.
pub const EXOS_USER_CALL: u8 = 0x70;
/// Vector of the driver-call trap gate.
pub const EXOS_DRIVER_CALL: u8 = 0x71;
/// Exception + IRQ gates wired at boot.
pub const GATE_COUNT: usize = 48;

const GATE_TYPE_INTERRUPT_32: u8 = 0x8E; // present, DPL 0, 386 interrupt gate
const GATE_TYPE_TRAP_32: u8 = 0x8F; // present, DPL 0, 386 trap gate
const GATE_DPL_USER: u8 = 0x60;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    type_attr: u8,
    offset_high: u16,
}

impl GateDescriptor {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(entry: unsafe extern "C" fn(), type_attr: u8) -> Self {
        let offset = entry as usize as u32;
        Self {
            offset_low: (offset & 0xFFFF) as u16,
            selector: SELECTOR_KERNEL_CODE,
            reserved: 0,
            type_attr,
            offset_high: (offset >> 16) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

lazy_static! {
    /// Global IDT: 256 slots, of which the 48 gates plus the two call
    /// traps are populated.
    static ref IDT: Mutex<[GateDescriptor; 256]> = Mutex::new(build_idt());
}

fn build_idt() -> [GateDescriptor; 256] {
    let mut idt = [GateDescriptor::missing(); 256];

    for (vector, entry) in stubs::gate_entries().iter().enumerate() {
        idt[vector] = GateDescriptor::new(*entry, GATE_TYPE_INTERRUPT_32);
    }

    idt[EXOS_USER_CALL as usize] =
        GateDescriptor::new(stubs::user_call_entry(), GATE_TYPE_TRAP_32 | GATE_DPL_USER);
    idt[EXOS_DRIVER_CALL as usize] =
        GateDescriptor::new(stubs::driver_call_entry(), GATE_TYPE_TRAP_32);

    idt
}

/// Load the IDT register.
pub fn load_idt() {
    let idt = IDT.lock();
    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<GateDescriptor>() * idt.len() - 1) as u16,
        base: idt.as_ptr() as u32,
    };

    unsafe {
        asm!(
            "lidt [{}]",
            in(reg) &pointer as *const DescriptorTablePointer,
            options(nostack)
        );
    }
}
