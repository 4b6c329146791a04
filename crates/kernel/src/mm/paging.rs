// Page-table engine
//
// Two-level i386 paging: 1024-entry page directory, 1024-entry tables,
// 4 KiB pages. Every directory carries the recursive self-map in its top
// slot so tables are reachable at a fixed virtual window, and shares the
// kernel half (PDEs for 3 GiB and up) with the kernel directory. Table
// frames are edited through the physical-access layer, which keeps the
// engine testable off target.

use super::{phys, physmap, Linear, PhysAddr, PAGE_SHIFT, PAGE_SIZE, VMA_KERNEL};
use crate::klib::{KernelError, Result};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

pub const ENTRIES_PER_TABLE: usize = 1024;
/// Directory slot holding the recursive self-map.
pub const SELF_MAP_INDEX: usize = 1023;
/// First directory slot of the shared kernel half.
pub const KERNEL_PDE_FIRST: usize = (VMA_KERNEL >> 22) as usize;

bitflags! {
    /// Page table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

const FRAME_MASK: u32 = !(PAGE_SIZE as u32 - 1);

/// Physical address of the kernel page directory.
static KERNEL_DIRECTORY: AtomicU32 = AtomicU32::new(0);
/// Physical address of the directory currently in CR3.
static ACTIVE_DIRECTORY: AtomicU32 = AtomicU32::new(0);

fn directory_index(linear: Linear) -> usize {
    (linear >> 22) as usize
}

fn table_index(linear: Linear) -> usize {
    ((linear >> PAGE_SHIFT) & 0x3FF) as usize
}

fn read_entry(table_frame: PhysAddr, index: usize) -> Result<u32> {
    physmap::read_u32(table_frame + (index as u32) * 4)
}

fn write_entry(table_frame: PhysAddr, index: usize, value: u32) -> Result<()> {
    physmap::write_u32(table_frame + (index as u32) * 4, value)
}

/// Allocate and zero a paging structure frame.
fn alloc_table_frame() -> Result<PhysAddr> {
    let frame = phys::alloc_page()?;
    physmap::zero_frame(frame)?;
    Ok(frame)
}

/// Build an empty page directory carrying only its self-map entry.
pub fn create_page_directory() -> Result<PhysAddr> {
    let directory = alloc_table_frame()?;
    write_entry(
        directory,
        SELF_MAP_INDEX,
        directory | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
    )?;
    Ok(directory)
}

/// Install the boot-built kernel directory.
pub fn set_kernel_directory(directory: PhysAddr) {
    KERNEL_DIRECTORY.store(directory, Ordering::Release);
    ACTIVE_DIRECTORY.store(directory, Ordering::Release);
}

pub fn kernel_directory() -> PhysAddr {
    KERNEL_DIRECTORY.load(Ordering::Acquire)
}

pub fn active_directory() -> PhysAddr {
    ACTIVE_DIRECTORY.load(Ordering::Acquire)
}

/// Allocate a page directory for a user process: empty user half, kernel
/// half aliased from the kernel directory, self-map pointing at itself.
pub fn alloc_user_page_directory() -> Result<PhysAddr> {
    let kernel = kernel_directory();
    if kernel == 0 {
        return Err(KernelError::InvalidState);
    }

    let directory = create_page_directory()?;
    for index in KERNEL_PDE_FIRST..SELF_MAP_INDEX {
        let entry = read_entry(kernel, index)?;
        if entry != 0 {
            write_entry(directory, index, entry)?;
        }
    }
    Ok(directory)
}

/// Activate a page directory. Reloading CR3 is the TLB barrier.
pub fn load_page_directory(directory: PhysAddr) {
    ACTIVE_DIRECTORY.store(directory, Ordering::Release);
    crate::arch::load_cr3(directory);
}

/// Map one page. Missing page tables are allocated on the way down.
pub fn map_page(
    directory: PhysAddr,
    linear: Linear,
    physical: PhysAddr,
    flags: PageFlags,
) -> Result<()> {
    if linear & !FRAME_MASK != 0 || physical & !FRAME_MASK != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let pde_index = directory_index(linear);
    let mut pde = read_entry(directory, pde_index)?;

    if pde & PageFlags::PRESENT.bits() == 0 {
        let table = alloc_table_frame()?;
        // Directory entries carry the union of access bits; the PTE is
        // the restrictive level.
        let mut pde_flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if flags.contains(PageFlags::USER) {
            pde_flags |= PageFlags::USER;
        }
        pde = table | pde_flags.bits();
        write_entry(directory, pde_index, pde)?;
    } else if flags.contains(PageFlags::USER) && pde & PageFlags::USER.bits() == 0 {
        write_entry(directory, pde_index, pde | PageFlags::USER.bits())?;
    }

    let table = pde & FRAME_MASK;
    write_entry(table, table_index(linear), physical | flags.bits())?;

    if active_directory() == directory {
        flush_tlb_page(linear);
    }
    Ok(())
}

/// Clear one mapping and return the frame it referenced (zero if the
/// page was absent).
pub fn unmap_page(directory: PhysAddr, linear: Linear) -> Result<PhysAddr> {
    let pde = read_entry(directory, directory_index(linear))?;
    if pde & PageFlags::PRESENT.bits() == 0 {
        return Ok(0);
    }

    let table = pde & FRAME_MASK;
    let index = table_index(linear);
    let pte = read_entry(table, index)?;
    if pte & PageFlags::PRESENT.bits() == 0 {
        return Ok(0);
    }

    write_entry(table, index, 0)?;
    if active_directory() == directory {
        flush_tlb_page(linear);
    }
    Ok(pte & FRAME_MASK)
}

/// Translate a linear address through a directory.
pub fn translate(directory: PhysAddr, linear: Linear) -> Result<Option<PhysAddr>> {
    let pde = read_entry(directory, directory_index(linear))?;
    if pde & PageFlags::PRESENT.bits() == 0 {
        return Ok(None);
    }

    let pte = read_entry(pde & FRAME_MASK, table_index(linear))?;
    if pte & PageFlags::PRESENT.bits() == 0 {
        return Ok(None);
    }

    Ok(Some((pte & FRAME_MASK) | (linear & !FRAME_MASK)))
}

/// Walk the active directory; true iff the linear page is present.
pub fn is_valid_memory(linear: Linear) -> bool {
    let directory = active_directory();
    if directory == 0 {
        return false;
    }
    matches!(
        translate(directory, linear & FRAME_MASK),
        Ok(Some(_))
    )
}

/// Tear down a user directory: free every frame still mapped in the user
/// half, the user-half page tables, then the directory itself. Kernel
/// tables are shared and stay.
pub fn free_user_page_directory(directory: PhysAddr) -> Result<()> {
    for pde_index in 0..KERNEL_PDE_FIRST {
        let pde = read_entry(directory, pde_index)?;
        if pde & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        let table = pde & FRAME_MASK;
        for pte_index in 0..ENTRIES_PER_TABLE {
            let pte = read_entry(table, pte_index)?;
            if pte & PageFlags::PRESENT.bits() != 0 {
                let _ = phys::free_page(pte & FRAME_MASK);
            }
        }
        let _ = phys::free_page(table);
    }
    let _ = phys::free_page(directory);
    Ok(())
}

#[cfg(target_arch = "x86")]
fn flush_tlb_page(linear: Linear) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) linear, options(nostack));
    }
}

#[cfg(not(target_arch = "x86"))]
fn flush_tlb_page(_linear: Linear) {}

/// Point the temporary-mapping PTE at a new frame. The PTE is edited
/// through the self-map window, so this never recurses into the
/// physical-access layer.
#[cfg(target_arch = "x86")]
pub fn retarget_temp_slot(physical: PhysAddr) -> Result<()> {
    if physical & !FRAME_MASK != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let slot = physmap::TEMP_MAP_PAGE;
    let pte_address = 0xFFC0_0000u32 + (slot >> PAGE_SHIFT) * 4;
    unsafe {
        core::ptr::write_volatile(
            pte_address as *mut u32,
            physical | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
        );
    }
    flush_tlb_page(slot);
    Ok(())
}
