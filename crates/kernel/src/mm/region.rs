// Region manager
//
// Named half-open linear reservations inside one address space. Regions
// never overlap; a COMMIT region has every page present and backed, a
// decommitted region has every page absent. The kernel address space is
// the region set shared by every page directory's kernel half.

use super::paging::{self, PageFlags};
use super::{phys, Linear, PhysAddr, page_align_up, PAGE_SIZE, VMA_KERNEL, VMA_USER};
use crate::klib::{KernelError, Result};
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// Placement and commit behaviour of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Install a fresh frame behind every page.
        const COMMIT = 1 << 0;
        /// Pages are writable.
        const READWRITE = 1 << 1;
        /// Place at the hint, or at the lowest free address above it.
        const AT_OR_OVER = 1 << 2;
        /// Pages are user-accessible; otherwise kernel-only.
        const USER = 1 << 3;
    }
}

/// One named reservation.
#[derive(Debug, Clone)]
pub struct Region {
    pub base: Linear,
    pub size: u32,
    pub flags: RegionFlags,
    pub name: String,
}

impl Region {
    pub fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// One address space: a page directory plus its region list, kept sorted
/// by base address.
pub struct AddressSpace {
    pub page_directory: PhysAddr,
    regions: Vec<Region>,
}

/// Window above which kernel-side dynamic regions are placed, leaving
/// room for the kernel image at the bottom of the kernel half.
const KERNEL_DYNAMIC_BASE: Linear = VMA_KERNEL + 0x0100_0000;
/// Kernel regions stop below the temporary-map page and the self-map.
const KERNEL_DYNAMIC_END: Linear = 0xFFB0_0000;

impl AddressSpace {
    pub fn new(page_directory: PhysAddr) -> Self {
        Self {
            page_directory,
            regions: Vec::new(),
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Named diagnostic lookup.
    pub fn find_region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.name == name)
    }

    pub fn region_at(&self, base: Linear) -> Option<&Region> {
        self.regions.iter().find(|region| region.base == base)
    }

    fn overlaps(&self, base: Linear, size: u32) -> bool {
        let end = base + size;
        self.regions
            .iter()
            .any(|region| base < region.end() && region.base < end)
    }

    /// Lowest free base at or above `from`, below `until`.
    fn find_free(&self, from: Linear, until: Linear, align: u32, size: u32) -> Option<Linear> {
        let align = align.max(PAGE_SIZE as u32);
        let mut candidate = align_up(from, align);

        for region in &self.regions {
            if candidate + size <= region.base || region.end() <= candidate {
                continue;
            }
            candidate = align_up(region.end(), align);
        }

        // One more pass in case the bump crossed earlier regions.
        loop {
            match self
                .regions
                .iter()
                .find(|r| candidate < r.end() && r.base < candidate + size)
            {
                Some(region) => candidate = align_up(region.end(), align),
                None => break,
            }
        }

        if candidate + size <= until && candidate >= from {
            Some(candidate)
        } else {
            None
        }
    }

    /// Reserve (and optionally commit) a region.
    pub fn alloc_region(
        &mut self,
        hint: Linear,
        align: u32,
        size: u32,
        flags: RegionFlags,
        name: &str,
    ) -> Result<Linear> {
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = page_align_up(size);

        let (window_base, window_end) = if flags.contains(RegionFlags::USER) {
            (VMA_USER, VMA_KERNEL)
        } else {
            (KERNEL_DYNAMIC_BASE, KERNEL_DYNAMIC_END)
        };

        let base = if flags.contains(RegionFlags::AT_OR_OVER) {
            let from = if hint != 0 { hint } else { window_base };
            self.find_free(from, window_end, align, size)
                .ok_or(KernelError::OutOfMemory)?
        } else if hint != 0 && !self.overlaps(hint, size) {
            hint
        } else {
            self.find_free(window_base, window_end, align, size)
                .ok_or(KernelError::OutOfMemory)?
        };

        if self.overlaps(base, size) {
            return Err(KernelError::OutOfMemory);
        }

        if flags.contains(RegionFlags::COMMIT) {
            self.commit_range(base, size, flags).map_err(|error| {
                // Roll back whatever was installed before the failure.
                let _ = self.decommit_range(base, size);
                error
            })?;
        }

        let region = Region {
            base,
            size,
            flags,
            name: String::from(name),
        };
        let position = self
            .regions
            .iter()
            .position(|r| r.base > base)
            .unwrap_or(self.regions.len());
        self.regions.insert(position, region);

        crate::debug!("region: '{}' at {:#x}..{:#x}", name, base, base + size);
        Ok(base)
    }

    fn commit_range(&self, base: Linear, size: u32, flags: RegionFlags) -> Result<()> {
        let mut page_flags = PageFlags::PRESENT;
        if flags.contains(RegionFlags::READWRITE) {
            page_flags |= PageFlags::WRITABLE;
        }
        if flags.contains(RegionFlags::USER) {
            page_flags |= PageFlags::USER;
        }

        for offset in (0..size).step_by(PAGE_SIZE) {
            let frame = phys::alloc_page()?;
            paging::map_page(self.page_directory, base + offset, frame, page_flags)?;
        }
        Ok(())
    }

    fn decommit_range(&self, base: Linear, size: u32) -> Result<()> {
        for offset in (0..size).step_by(PAGE_SIZE) {
            let frame = paging::unmap_page(self.page_directory, base + offset)?;
            if frame != 0 {
                let _ = phys::free_page(frame);
            }
        }
        Ok(())
    }

    /// Decommit every page the range covers and drop the region record.
    pub fn free_region(&mut self, base: Linear, size: u32) -> Result<()> {
        let size = page_align_up(size);
        self.decommit_range(base, size)?;
        self.regions.retain(|region| region.base != base);
        Ok(())
    }

    /// Release everything the space still holds (process teardown).
    pub fn release_all(&mut self) -> Result<()> {
        let regions: Vec<Region> = self.regions.drain(..).collect();
        for region in regions {
            self.decommit_range(region.base, region.size)?;
        }
        Ok(())
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// The kernel address space, shared by every directory's kernel half.
static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Install the kernel address space at boot.
pub fn init_kernel_space(page_directory: PhysAddr) {
    let mut space = KERNEL_SPACE.lock();
    *space = Some(AddressSpace::new(page_directory));
}

/// Run `f` over the kernel address space.
pub fn with_kernel_space<R>(f: impl FnOnce(&mut AddressSpace) -> R) -> Result<R> {
    let _memory = crate::sync::lock_memory();
    let mut space = KERNEL_SPACE.lock();
    match space.as_mut() {
        Some(space) => Ok(f(space)),
        None => Err(KernelError::InvalidState),
    }
}

/// Kernel-side region allocation (C2 surface).
pub fn alloc_region(
    hint: Linear,
    align: u32,
    size: u32,
    flags: RegionFlags,
    name: &str,
) -> Result<Linear> {
    with_kernel_space(|space| space.alloc_region(hint, align, size, flags, name))?
}

/// Kernel-side region release.
pub fn free_region(base: Linear, size: u32) -> Result<()> {
    with_kernel_space(|space| space.free_region(base, size))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::physmap;

    fn fresh_space() -> AddressSpace {
        physmap::reset_arena();
        phys::reset_for_tests();
        phys::init_for_tests(16 * 1024);
        phys::set_range(0x200, 16 * 1024 - 0x200, false);
        AddressSpace::new(paging::create_page_directory().unwrap())
    }

    #[test]
    fn regions_do_not_overlap() {
        let _guard = crate::test_utils::serialize();
        let mut space = fresh_space();

        let a = space
            .alloc_region(0, 0, 0x3000, RegionFlags::empty(), "A")
            .unwrap();
        let b = space
            .alloc_region(0, 0, 0x2000, RegionFlags::empty(), "B")
            .unwrap();
        assert!(b >= a + 0x3000 || a >= b + 0x2000);
        assert!(space.find_region("A").is_some());
        assert!(space.find_region("B").is_some());
    }

    #[test]
    fn at_or_over_places_at_or_above_hint() {
        let _guard = crate::test_utils::serialize();
        let mut space = fresh_space();

        let base = space
            .alloc_region(
                0xD000_0000,
                0,
                0x1000,
                RegionFlags::AT_OR_OVER,
                "hinted",
            )
            .unwrap();
        assert_eq!(base, 0xD000_0000);

        // The same hint again must land strictly above.
        let second = space
            .alloc_region(
                0xD000_0000,
                0,
                0x1000,
                RegionFlags::AT_OR_OVER,
                "hinted2",
            )
            .unwrap();
        assert!(second > 0xD000_0000);
    }

    #[test]
    fn commit_maps_and_free_returns_frames() {
        let _guard = crate::test_utils::serialize();
        let mut space = fresh_space();
        let before = phys::stats().unwrap().free_frames;

        let base = space
            .alloc_region(
                0,
                0,
                3 * PAGE_SIZE as u32,
                RegionFlags::COMMIT | RegionFlags::READWRITE,
                "committed",
            )
            .unwrap();

        // Every page of a COMMIT region is present.
        for page in 0..3u32 {
            assert!(paging::translate(space.page_directory, base + page * PAGE_SIZE as u32)
                .unwrap()
                .is_some());
        }

        space.free_region(base, 3 * PAGE_SIZE as u32).unwrap();
        for page in 0..3u32 {
            assert!(paging::translate(space.page_directory, base + page * PAGE_SIZE as u32)
                .unwrap()
                .is_none());
        }
        // Every data frame came back; the one page-table frame stays
        // cached in the directory.
        let after = phys::stats().unwrap().free_frames;
        assert_eq!(after, before - 1);
        assert!(space.region_at(base).is_none());
    }

    #[test]
    fn user_regions_stay_in_the_user_window() {
        let _guard = crate::test_utils::serialize();
        let mut space = fresh_space();

        let base = space
            .alloc_region(0, 0, 0x4000, RegionFlags::USER, "user")
            .unwrap();
        assert!(base >= VMA_USER && base + 0x4000 <= VMA_KERNEL);
    }
}
