// Kernel panic handling

/// Panic handler for the bare-metal target: log the location, mask
/// interrupts and halt forever. Host/test builds use the std handler.
#[cfg(all(target_arch = "x86", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::error!("kernel panic: {}", info);

    crate::arch::disable_interrupts();
    loop {
        crate::arch::halt();
    }
}

/// Allocation failure handler for the bare-metal target.
#[cfg(all(target_arch = "x86", not(test)))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    crate::error!(
        "kernel heap exhausted: size={} align={}",
        layout.size(),
        layout.align()
    );

    crate::arch::disable_interrupts();
    loop {
        crate::arch::halt();
    }
}
