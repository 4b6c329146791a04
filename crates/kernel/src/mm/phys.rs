// Physical page-frame allocator
//
// Order-0 bitmap over every frame from 0 to page_count-1, one bit per
// frame. `set_range` paints arbitrary ranges during boot to reserve the
// low megabyte, the loader window, the allocator metadata itself and
// every non-AVAILABLE entry of the boot memory map. Allocation scans for
// the lowest free frame.

use super::{PhysAddr, PAGE_SHIFT, PAGE_SIZE, RESERVED_LOW_MEMORY};
use crate::boot::multiboot::{MemoryMapEntry, MEMORY_AVAILABLE};
use crate::klib::{KernelError, Result};
use crate::sync;
use spin::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
}

/// Frame-state bitmap. A set bit means USED.
struct FrameBitmap {
    bits: &'static mut [u8],
    page_count: usize,
    /// Lowest index that may be free; purely a scan accelerator.
    search_hint: usize,
}

impl FrameBitmap {
    fn is_used(&self, index: usize) -> bool {
        (self.bits[index / 8] >> (index % 8)) & 1 != 0
    }

    fn mark(&mut self, index: usize, used: bool) {
        let mask = 1u8 << (index % 8);
        if used {
            self.bits[index / 8] |= mask;
        } else {
            self.bits[index / 8] &= !mask;
            if index < self.search_hint {
                self.search_hint = index;
            }
        }
    }

    fn set_range(&mut self, first: usize, count: usize, used: bool) {
        let end = (first + count).min(self.page_count);
        for index in first.min(self.page_count)..end {
            self.mark(index, used);
        }
    }

    fn alloc_lowest(&mut self) -> Option<usize> {
        for index in self.search_hint..self.page_count {
            if !self.is_used(index) {
                self.mark(index, true);
                self.search_hint = index + 1;
                return Some(index);
            }
        }
        None
    }

    fn stats(&self) -> FrameStats {
        let used = (0..self.page_count).filter(|&i| self.is_used(i)).count();
        FrameStats {
            total_frames: self.page_count,
            used_frames: used,
            free_frames: self.page_count - used,
        }
    }
}

static FRAMES: Mutex<Option<FrameBitmap>> = Mutex::new(None);

/// Install the allocator over `page_count` frames. The bitmap storage is
/// carved out of boot memory (or leaked from a Vec in tests); every frame
/// starts USED until `mark_used_physical_memory` paints the free ranges.
pub fn init(bits: &'static mut [u8], page_count: usize) -> Result<()> {
    if bits.len() * 8 < page_count {
        return Err(KernelError::InvalidArgument);
    }

    bits.fill(0xFF);

    let mut frames = FRAMES.lock();
    *frames = Some(FrameBitmap {
        bits,
        page_count,
        search_hint: 0,
    });

    crate::info!(
        "phys: frame allocator covers {} frames ({} MiB)",
        page_count,
        page_count * PAGE_SIZE / (1024 * 1024)
    );

    Ok(())
}

/// Bytes of bitmap storage needed for `page_count` frames.
pub const fn bitmap_bytes(page_count: usize) -> usize {
    (page_count + 7) / 8
}

pub fn is_ready() -> bool {
    FRAMES.lock().is_some()
}

/// Paint the boot reservations:
/// free every AVAILABLE frame first, then re-reserve the low megabyte,
/// the loader-owned window, the allocator metadata and every
/// non-AVAILABLE map entry.
pub fn mark_used_physical_memory(
    map: &[MemoryMapEntry],
    loader_reserved: (PhysAddr, PhysAddr),
    metadata: (PhysAddr, PhysAddr),
) {
    let _memory = sync::lock_memory();
    let mut frames = FRAMES.lock();
    let frames = match frames.as_mut() {
        Some(frames) => frames,
        None => {
            crate::error!("phys: mark_used_physical_memory before init");
            return;
        }
    };

    for entry in map {
        if entry.kind != MEMORY_AVAILABLE {
            continue;
        }
        let (first, count) = clip_range(entry.base, entry.length, frames.page_count);
        frames.set_range(first, count, false);
    }

    frames.set_range(0, (RESERVED_LOW_MEMORY >> PAGE_SHIFT) as usize, true);

    for (start, end) in [loader_reserved, metadata] {
        if end > start {
            let first = (start >> PAGE_SHIFT) as usize;
            let count = ((end - start + (PAGE_SIZE as u32 - 1)) >> PAGE_SHIFT) as usize;
            frames.set_range(first, count, true);
        }
    }

    for entry in map {
        if entry.kind == MEMORY_AVAILABLE {
            continue;
        }
        let (first, count) = clip_range(entry.base, entry.length, frames.page_count);
        frames.set_range(first, count, true);
    }

    frames.search_hint = 0;
}

fn clip_range(base: u64, length: u64, page_count: usize) -> (usize, usize) {
    let end = (base + length).min((page_count as u64) << PAGE_SHIFT);
    if base >= end {
        return (0, 0);
    }
    let first = (base >> PAGE_SHIFT) as usize;
    let count = ((end - base + (PAGE_SIZE as u64 - 1)) >> PAGE_SHIFT) as usize;
    (first, count)
}

/// Mark an arbitrary frame range used or free. Boot-time only; does not
/// participate in any merge discipline.
pub fn set_range(first_frame: usize, count: usize, used: bool) {
    let _memory = sync::lock_memory();
    if let Some(frames) = FRAMES.lock().as_mut() {
        frames.set_range(first_frame, count, used);
    }
}

/// Allocate the lowest free frame and return its physical address.
pub fn alloc_page() -> Result<PhysAddr> {
    let _memory = sync::lock_memory();
    let mut frames = FRAMES.lock();
    let frames = frames.as_mut().ok_or(KernelError::InvalidState)?;

    match frames.alloc_lowest() {
        Some(index) => Ok((index as PhysAddr) << PAGE_SHIFT),
        None => {
            crate::warn!("phys: out of physical pages");
            Err(KernelError::OutOfMemory)
        }
    }
}

/// Release one frame. Refuses unaligned addresses, frame 0, reserved low
/// frames and out-of-range indices. Freeing an already-free frame is
/// reported but not fatal.
pub fn free_page(physical: PhysAddr) -> Result<()> {
    if physical & (PAGE_SIZE as u32 - 1) != 0 {
        crate::error!("phys: free of unaligned address {:#x}", physical);
        return Err(KernelError::InvalidArgument);
    }

    let index = (physical >> PAGE_SHIFT) as usize;
    if index == 0 {
        crate::error!("phys: attempt to free frame 0");
        return Err(KernelError::InvalidArgument);
    }
    if index < (RESERVED_LOW_MEMORY >> PAGE_SHIFT) as usize {
        return Ok(());
    }

    let _memory = sync::lock_memory();
    let mut frames = FRAMES.lock();
    let frames = frames.as_mut().ok_or(KernelError::InvalidState)?;

    if index >= frames.page_count {
        crate::error!("phys: frame index {:#x} out of range", index);
        return Err(KernelError::InvalidArgument);
    }

    if !frames.is_used(index) {
        crate::debug!("phys: frame {:#x} already free", physical);
        return Ok(());
    }

    frames.mark(index, false);
    Ok(())
}

/// True when the frame's bit is set.
pub fn is_used(physical: PhysAddr) -> bool {
    let index = (physical >> PAGE_SHIFT) as usize;
    FRAMES
        .lock()
        .as_ref()
        .map(|frames| index < frames.page_count && frames.is_used(index))
        .unwrap_or(false)
}

pub fn stats() -> Option<FrameStats> {
    FRAMES.lock().as_ref().map(|frames| frames.stats())
}

/// Reset the allocator between tests.
#[cfg(test)]
pub fn reset_for_tests() {
    *FRAMES.lock() = None;
}

#[cfg(test)]
pub fn init_for_tests(page_count: usize) {
    let storage = alloc::vec![0u8; bitmap_bytes(page_count)].leak();
    init(storage, page_count).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::multiboot::MemoryMapEntry;

    fn serial_guard() -> std::sync::MutexGuard<'static, ()> {
        crate::test_utils::serialize()
    }

    // Boot layout of a 64 MiB machine: one AVAILABLE entry starting at
    // 1 MiB, a loader window and the allocator metadata behind it.
    fn boot_64mib() {
        init_for_tests(64 * 1024 * 1024 / PAGE_SIZE);
        let map = [
            MemoryMapEntry {
                base: 0x10_0000,
                length: 0x3F0_0000,
                kind: MEMORY_AVAILABLE,
            },
        ];
        mark_used_physical_memory(&map, (0x10_0000, 0x20_0000), (0x20_0000, 0x20_4000));
    }

    #[test]
    fn boot_painting_matches_reservations() {
        let _guard = serial_guard();
        boot_64mib();

        // Everything below RESERVED_LOW_MEMORY is used.
        assert!(is_used(0));
        assert!(is_used(0xF_F000));
        // Loader window and metadata are used.
        assert!(is_used(0x10_0000));
        assert!(is_used(0x1F_F000));
        assert!(is_used(0x20_0000));
        assert!(is_used(0x20_3000));
        // First frame past the metadata is free and is what alloc returns.
        assert!(!is_used(0x20_4000));
        assert_eq!(alloc_page().unwrap(), 0x20_4000);
        reset_for_tests();
    }

    #[test]
    fn free_page_refusals() {
        let _guard = serial_guard();
        boot_64mib();

        assert_eq!(free_page(0x123), Err(KernelError::InvalidArgument));
        assert_eq!(free_page(0), Err(KernelError::InvalidArgument));
        // Below the low reservation: silently kept.
        assert_eq!(free_page(0x1000), Ok(()));
        assert!(is_used(0x1000));
        // Out of range.
        assert_eq!(
            free_page(0x4000_0000),
            Err(KernelError::InvalidArgument)
        );
        reset_for_tests();
    }

    #[test]
    fn alloc_free_roundtrip() {
        let _guard = serial_guard();
        boot_64mib();

        let a = alloc_page().unwrap();
        let b = alloc_page().unwrap();
        assert_ne!(a, b);
        free_page(a).unwrap();
        // Lowest-free policy hands the freed frame back.
        assert_eq!(alloc_page().unwrap(), a);
        // Double free reports but succeeds.
        free_page(b).unwrap();
        free_page(b).unwrap();
        reset_for_tests();
    }
}
