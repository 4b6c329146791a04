//! Fault/IRQ/trap dispatch
//!
//! Every gate funnels into `interrupt_dispatch` with the uniform
//! `TrapFrame`. The policy table routes by vector class: benign vectors
//! log and continue, CPU faults die, the timer drives the scheduler,
//! device IRQs go to their registered driver handlers, and the two trap
//! gates reach the system-call and driver-call dispatchers.

pub mod fault;

use crate::arch::TrapFrame;
use crate::process::scheduler;
use spin::Mutex;

/// Vector of the first remapped IRQ line.
pub const IRQ_BASE: u32 = 0x20;
/// System-call trap vector.
pub const EXOS_USER_CALL: u32 = 0x70;
/// Driver-call trap vector.
pub const EXOS_DRIVER_CALL: u32 = 0x71;

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KEYBOARD: u32 = 1;
pub const IRQ_MOUSE: u32 = 4;
pub const IRQ_HARD_DISK: u32 = 14;

/// Driver-registered IRQ handlers, indexed by IRQ line (0..16).
static IRQ_HANDLERS: Mutex<[Option<fn(u32)>; 16]> = Mutex::new([None; 16]);

/// Register a driver handler for one IRQ line and unmask it.
pub fn register_irq_handler(irq: u32, handler: fn(u32)) -> crate::klib::Result<()> {
    if irq >= 16 {
        return Err(crate::klib::KernelError::InvalidArgument);
    }
    let mut handlers = IRQ_HANDLERS.lock();
    if handlers[irq as usize].is_some() {
        return Err(crate::klib::KernelError::AlreadyExists);
    }
    handlers[irq as usize] = Some(handler);
    drop(handlers);

    crate::arch::pic::unmask(irq as u8);
    Ok(())
}

pub fn unregister_irq_handler(irq: u32) {
    if irq < 16 {
        IRQ_HANDLERS.lock()[irq as usize] = None;
    }
}

fn dispatch_irq(irq: u32, frame: &mut TrapFrame) {
    match irq {
        IRQ_TIMER => {
            crate::arch::pic::end_of_interrupt(irq as u8);
            // Acknowledge first: the tick may context-switch away.
            scheduler::tick();
        }
        _ => {
            let handler = IRQ_HANDLERS.lock()[irq as usize];
            match handler {
                Some(handler) => handler(irq),
                None => crate::debug!("irq: spurious line {}", irq),
            }
            crate::arch::pic::end_of_interrupt(irq as u8);
        }
    }
    let _ = frame;
}

/// Common dispatcher called by every interrupt stub.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame: &mut TrapFrame) {
    match frame.vector {
        0..=31 => fault::handle_exception(frame),
        vector if (IRQ_BASE..IRQ_BASE + 16).contains(&vector) => {
            dispatch_irq(vector - IRQ_BASE, frame)
        }
        EXOS_USER_CALL => crate::syscall::handle_user_call(frame),
        EXOS_DRIVER_CALL => crate::syscall::handle_driver_call(frame),
        vector => {
            crate::warn!("interrupt: unknown vector {} at {:#x}", vector, frame.eip);
        }
    }
}

/// Wire the descriptor tables, remap the PIC, program the timer and
/// start taking interrupts.
pub fn initialize() {
    crate::arch::load_gdt();
    crate::arch::load_idt();
    crate::arch::pic::remap_and_mask();
    crate::arch::pit::program_interval_timer();
    crate::arch::pic::unmask(IRQ_TIMER as u8);
    crate::info!("interrupts: IDT loaded, PIC remapped to {:#x}", IRQ_BASE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_registration_is_exclusive() {
        let _guard = crate::test_utils::serialize();
        fn probe(_irq: u32) {}

        unregister_irq_handler(5);
        register_irq_handler(5, probe).unwrap();
        assert_eq!(
            register_irq_handler(5, probe),
            Err(crate::klib::KernelError::AlreadyExists)
        );
        unregister_irq_handler(5);

        assert_eq!(
            register_irq_handler(99, probe),
            Err(crate::klib::KernelError::InvalidArgument)
        );
    }

    #[test]
    fn unknown_vector_logs_and_continues() {
        let _guard = crate::test_utils::serialize();
        let mut frame = crate::arch::TrapFrame::zeroed();
        frame.vector = 0x55;
        frame.eip = 0x1234;
        // Must not panic or kill anything.
        interrupt_dispatch(&mut frame);
    }
}
