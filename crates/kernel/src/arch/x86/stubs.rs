// Interrupt entry stubs
//
// Every vector lands in a tiny stub that normalizes the stack to the
// TrapFrame layout: vectors without a CPU error code push a dummy zero so
// the frame always carries one. The common path saves segments and the
// pusha block, switches to the kernel data segment, and calls the C-ABI
// dispatcher with a pointer to the frame.

use core::arch::global_asm;

global_asm!(
    r#"
.altmacro

.macro ISR_NOERR vec
    .global interrupt_stub_\vec
interrupt_stub_\vec:
    push 0
    push \vec
    jmp interrupt_common
.endm

.macro ISR_ERR vec
    .global interrupt_stub_\vec
interrupt_stub_\vec:
    push \vec
    jmp interrupt_common
.endm

// CPU exceptions 0..31: vectors 8, 10-14 and 17 push an error code.
ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_NOERR 9
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 15
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19
ISR_NOERR 20
ISR_NOERR 21
ISR_NOERR 22
ISR_NOERR 23
ISR_NOERR 24
ISR_NOERR 25
ISR_NOERR 26
ISR_NOERR 27
ISR_NOERR 28
ISR_NOERR 29
ISR_NOERR 30
ISR_NOERR 31

// Remapped PIC interrupts 32..47.
.set irq_vec, 32
.rept 16
    ISR_NOERR %irq_vec
    .set irq_vec, irq_vec + 1
.endr

// Trap gates for the system call and driver call.
ISR_NOERR 112
ISR_NOERR 113

interrupt_common:
    push eax
    push ecx
    push edx
    push ebx
    push esp
    push ebp
    push esi
    push edi
    push ds
    push es
    push fs
    push gs

    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call interrupt_dispatch
    add esp, 4

    pop gs
    pop fs
    pop es
    pop ds
    pop edi
    pop esi
    pop ebp
    add esp, 4
    pop ebx
    pop edx
    pop ecx
    pop eax

    add esp, 8
    iretd
"#
);

extern "C" {
    pub fn interrupt_stub_0();
    pub fn interrupt_stub_1();
    pub fn interrupt_stub_2();
    pub fn interrupt_stub_3();
    pub fn interrupt_stub_4();
    pub fn interrupt_stub_5();
    pub fn interrupt_stub_6();
    pub fn interrupt_stub_7();
    pub fn interrupt_stub_8();
    pub fn interrupt_stub_9();
    pub fn interrupt_stub_10();
    pub fn interrupt_stub_11();
    pub fn interrupt_stub_12();
    pub fn interrupt_stub_13();
    pub fn interrupt_stub_14();
    pub fn interrupt_stub_15();
    pub fn interrupt_stub_16();
    pub fn interrupt_stub_17();
    pub fn interrupt_stub_18();
    pub fn interrupt_stub_19();
    pub fn interrupt_stub_20();
    pub fn interrupt_stub_21();
    pub fn interrupt_stub_22();
    pub fn interrupt_stub_23();
    pub fn interrupt_stub_24();
    pub fn interrupt_stub_25();
    pub fn interrupt_stub_26();
    pub fn interrupt_stub_27();
    pub fn interrupt_stub_28();
    pub fn interrupt_stub_29();
    pub fn interrupt_stub_30();
    pub fn interrupt_stub_31();
    pub fn interrupt_stub_32();
    pub fn interrupt_stub_33();
    pub fn interrupt_stub_34();
    pub fn interrupt_stub_35();
    pub fn interrupt_stub_36();
    pub fn interrupt_stub_37();
    pub fn interrupt_stub_38();
    pub fn interrupt_stub_39();
    pub fn interrupt_stub_40();
    pub fn interrupt_stub_41();
    pub fn interrupt_stub_42();
    pub fn interrupt_stub_43();
    pub fn interrupt_stub_44();
    pub fn interrupt_stub_45();
    pub fn interrupt_stub_46();
    pub fn interrupt_stub_47();
    pub fn interrupt_stub_112();
    pub fn interrupt_stub_113();
}

/// Entry points for the 48 exception/IRQ gates, indexed by vector.
pub fn gate_entries() -> [unsafe extern "C" fn(); 48] {
    [
        interrupt_stub_0,
        interrupt_stub_1,
        interrupt_stub_2,
        interrupt_stub_3,
        interrupt_stub_4,
        interrupt_stub_5,
        interrupt_stub_6,
        interrupt_stub_7,
        interrupt_stub_8,
        interrupt_stub_9,
        interrupt_stub_10,
        interrupt_stub_11,
        interrupt_stub_12,
        interrupt_stub_13,
        interrupt_stub_14,
        interrupt_stub_15,
        interrupt_stub_16,
        interrupt_stub_17,
        interrupt_stub_18,
        interrupt_stub_19,
        interrupt_stub_20,
        interrupt_stub_21,
        interrupt_stub_22,
        interrupt_stub_23,
        interrupt_stub_24,
        interrupt_stub_25,
        interrupt_stub_26,
        interrupt_stub_27,
        interrupt_stub_28,
        interrupt_stub_29,
        interrupt_stub_30,
        interrupt_stub_31,
        interrupt_stub_32,
        interrupt_stub_33,
        interrupt_stub_34,
        interrupt_stub_35,
        interrupt_stub_36,
        interrupt_stub_37,
        interrupt_stub_38,
        interrupt_stub_39,
        interrupt_stub_40,
        interrupt_stub_41,
        interrupt_stub_42,
        interrupt_stub_43,
        interrupt_stub_44,
        interrupt_stub_45,
        interrupt_stub_46,
        interrupt_stub_47,
    ]
}

/// Entry for the `EXOS_USER_CALL` trap gate.
pub fn user_call_entry() -> unsafe extern "C" fn() {
    interrupt_stub_112
}

/// Entry for the `EXOS_DRIVER_CALL` trap gate.
pub fn driver_call_entry() -> unsafe extern "C" fn() {
    interrupt_stub_113
}
