// Global Descriptor Table and Task State Segment
//
// Flat 4 GiB segments: kernel code/data at ring 0, user code/data at
// ring 3, plus one TSS whose ESP0 the scheduler retargets on every
// context switch.

use core::arch::asm;
use lazy_static::lazy_static;
use spin::Mutex;

pub const SELECTOR_KERNEL_CODE: u16 = 0x08;
pub const SELECTOR_KERNEL_DATA: u16 = 0x10;
pub const SELECTOR_USER_CODE: u16 = 0x18 | 3;
pub const SELECTOR_USER_DATA: u16 = 0x20 | 3;
pub const SELECTOR_TSS: u16 = 0x28;

/// 32-bit TSS. Only SS0:ESP0 participate; hardware task switching is not
/// used.
#[repr(C, packed)]
pub struct TaskStateSegment {
    prev_link: u32,
    pub esp0: u32,
    pub ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn new() -> Self {
        Self {
            prev_link: 0,
            esp0: 0,
            ss0: SELECTOR_KERNEL_DATA as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
        }
    }
}

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::new());

/// Segment descriptor as packed for the GDT.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct SegmentDescriptor {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    limit_high_flags: u8,
    base_high: u8,
}

impl SegmentDescriptor {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            limit_high_flags: 0,
            base_high: 0,
        }
    }

    /// Flat 4 GiB segment with 4 KiB granularity.
    const fn flat(access: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            limit_high_flags: 0xCF,
            base_high: 0,
        }
    }

    fn system(base: u32, limit: u32, access: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            limit_high_flags: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

lazy_static! {
    static ref GDT: Mutex<[SegmentDescriptor; 6]> = Mutex::new([
        SegmentDescriptor::null(),
        SegmentDescriptor::flat(0x9A), // kernel code: present, ring 0, exec/read
        SegmentDescriptor::flat(0x92), // kernel data: present, ring 0, read/write
        SegmentDescriptor::flat(0xFA), // user code: present, ring 3, exec/read
        SegmentDescriptor::flat(0xF2), // user data: present, ring 3, read/write
        SegmentDescriptor::null(),     // TSS, patched in load_gdt
    ]);
}

/// Build the TSS descriptor, load the GDT, reload segments and LTR.
pub fn load_gdt() {
    let tss_base = {
        let tss = TSS.lock();
        &*tss as *const TaskStateSegment as u32
    };
    let tss_limit = core::mem::size_of::<TaskStateSegment>() as u32 - 1;

    let mut gdt = GDT.lock();
    gdt[5] = SegmentDescriptor::system(tss_base, tss_limit, 0x89); // available 32-bit TSS

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<SegmentDescriptor>() * gdt.len() - 1) as u16,
        base: gdt.as_ptr() as u32,
    };

    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            "push {code}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {tss}",
            "ltr ax",
            ptr = in(reg) &pointer as *const DescriptorTablePointer,
            data = const SELECTOR_KERNEL_DATA as u32,
            code = const SELECTOR_KERNEL_CODE as u32,
            tss = const SELECTOR_TSS as u32,
            out("eax") _,
        );
    }
}

/// Point ESP0 at the incoming task's system stack top. The scheduler
/// leaves `STACK_SAFETY_MARGIN` below the true top.
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}
