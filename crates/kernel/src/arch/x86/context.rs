// Context switch and FPU state

use super::super::TaskContext;
use core::arch::{asm, global_asm};

/// Save the caller's FPU/SSE registers into its context.
#[inline]
pub fn save_fpu(context: &mut TaskContext) {
    unsafe {
        asm!("fxsave [{}]", in(reg) context.fpu_state.as_mut_ptr(), options(nostack));
    }
}

/// Restore the callee's FPU/SSE registers from its context.
#[inline]
pub fn restore_fpu(context: &TaskContext) {
    unsafe {
        asm!("fxrstor [{}]", in(reg) context.fpu_state.as_ptr(), options(nostack));
    }
}

global_asm!(
    r#"
// task_switch_asm(prev_esp_slot: *mut u32, next_esp: u32)
//
// Pushes the callee-saved registers, parks the old stack pointer in the
// previous context, adopts the next context's stack and pops its saved
// registers. Returning then resumes the next task where it last entered
// this function (or at its bootstrap frame).
.global task_switch_asm
task_switch_asm:
    mov eax, [esp + 4]
    mov edx, [esp + 8]

    push ebp
    push ebx
    push esi
    push edi
    pushfd

    mov [eax], esp
    mov esp, edx

    popfd
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

extern "C" {
    fn task_switch_asm(prev_esp_slot: *mut u32, next_esp: u32);
}

/// Drop to ring 3 at `entry` with the given user stack. Builds the iret
/// frame by hand; never returns.
pub fn enter_user_mode(entry: u32, user_stack_top: u32) -> ! {
    use super::gdt::{SELECTOR_USER_CODE, SELECTOR_USER_DATA};

    unsafe {
        asm!(
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push eax",         // ss
            "push {stack}",     // esp
            "push 0x202",       // eflags: IF | reserved bit
            "push {code}",      // cs
            "push {entry}",     // eip
            "iretd",
            in("eax") SELECTOR_USER_DATA as u32,
            stack = in(reg) user_stack_top,
            code = in(reg) SELECTOR_USER_CODE as u32,
            entry = in(reg) entry,
            options(noreturn),
        );
    }
}

/// Switch from `prev` to `next`: FPU out, page directory and stack over,
/// FPU in. The caller has already updated the TSS ESP0 for `next`.
///
/// # Safety
/// Both contexts must describe live tasks with valid kernel stacks, and
/// `next.cr3` must be a valid page directory mapping the kernel half.
pub unsafe fn switch_to_task(prev: *mut TaskContext, next: *const TaskContext) {
    save_fpu(&mut *prev);

    if (*next).cr3 != (*prev).cr3 {
        super::cpu::load_cr3((*next).cr3);
    }

    task_switch_asm(&mut (*prev).esp, (*next).esp);

    restore_fpu(&*prev);
}
