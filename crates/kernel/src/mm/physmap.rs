// Access to raw physical memory
//
// The kernel does not identity-map RAM. Touching an arbitrary physical
// page goes through a single reserved virtual page that is retargeted on
// demand (the temporary-mapping slot). Host builds back the same API
// with a page arena so the paging and region engines are testable.

use super::{PhysAddr, PAGE_SIZE};
use crate::klib::{KernelError, Result};

/// Virtual address of the temporary mapping slot: the last page below
/// the recursive self-map window.
#[cfg(target_arch = "x86")]
pub const TEMP_MAP_PAGE: super::Linear = 0xFFBF_F000;

#[cfg(target_arch = "x86")]
mod backend {
    use super::super::paging;
    use super::*;

    /// Map one physical page at the temporary slot and return its linear
    /// address. The previous occupant of the slot is displaced; callers
    /// serialize on the memory mutex.
    pub fn map_temporary_physical_page1(physical: PhysAddr) -> Result<super::super::Linear> {
        paging::retarget_temp_slot(physical)?;
        Ok(TEMP_MAP_PAGE)
    }

    /// Run `f` over the frame's bytes through the temporary slot.
    pub fn with_frame<R>(physical: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let _memory = crate::sync::lock_memory();
        let linear = map_temporary_physical_page1(physical & !(PAGE_SIZE as u32 - 1))?;
        let bytes = unsafe { core::slice::from_raw_parts_mut(linear as *mut u8, PAGE_SIZE) };
        Ok(f(bytes))
    }
}

#[cfg(not(target_arch = "x86"))]
mod backend {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// Host stand-in for physical memory: one 4 KiB buffer per frame,
    /// materialized on first touch.
    static ARENA: Mutex<BTreeMap<u32, Vec<u8>>> = Mutex::new(BTreeMap::new());

    pub fn with_frame<R>(physical: PhysAddr, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if physical as usize % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut arena = ARENA.lock();
        let frame = arena
            .entry(physical)
            .or_insert_with(|| vec![0u8; PAGE_SIZE]);
        Ok(f(frame.as_mut_slice()))
    }

    /// Drop every materialized frame between tests.
    #[cfg(test)]
    pub fn reset_arena() {
        ARENA.lock().clear();
    }
}

pub use self::backend::with_frame;

#[cfg(target_arch = "x86")]
pub use self::backend::map_temporary_physical_page1;

#[cfg(all(not(target_arch = "x86"), test))]
pub use self::backend::reset_arena;

/// Read a 32-bit little-endian word from physical memory.
pub fn read_u32(physical: PhysAddr) -> Result<u32> {
    let page = physical & !(PAGE_SIZE as u32 - 1);
    let offset = (physical - page) as usize;
    if offset + 4 > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    with_frame(page, |bytes| {
        u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
    })
}

/// Write a 32-bit little-endian word into physical memory.
pub fn write_u32(physical: PhysAddr, value: u32) -> Result<()> {
    let page = physical & !(PAGE_SIZE as u32 - 1);
    let offset = (physical - page) as usize;
    if offset + 4 > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    with_frame(page, |bytes| {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    })
}

/// Copy physical memory into a caller buffer, page by page through the
/// temporary slot.
pub fn read_physical_memory(physical: PhysAddr, buffer: &mut [u8]) -> Result<()> {
    if buffer.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let mut copied = 0usize;
    while copied < buffer.len() {
        let address = physical as u64 + copied as u64;
        if address > u32::MAX as u64 {
            return Err(KernelError::InvalidArgument);
        }
        let page = (address as u32) & !(PAGE_SIZE as u32 - 1);
        let offset = (address as u32 - page) as usize;
        let chunk = (PAGE_SIZE - offset).min(buffer.len() - copied);

        with_frame(page, |bytes| {
            buffer[copied..copied + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
        })?;

        copied += chunk;
    }

    Ok(())
}

/// Zero-fill one frame.
pub fn zero_frame(physical: PhysAddr) -> Result<()> {
    with_frame(physical, |bytes| bytes.fill(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_roundtrip() {
        let _guard = crate::test_utils::serialize();
        reset_arena();
        write_u32(0x20_0000, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_u32(0x20_0000).unwrap(), 0xDEAD_BEEF);
        reset_arena();
    }

    #[test]
    fn read_spans_page_boundary() {
        let _guard = crate::test_utils::serialize();
        reset_arena();
        write_u32(0x20_0FFC, 0x1122_3344).unwrap();
        write_u32(0x20_1000, 0x5566_7788).unwrap();

        let mut buffer = [0u8; 8];
        read_physical_memory(0x20_0FFC, &mut buffer).unwrap();
        assert_eq!(&buffer[..4], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&buffer[4..], &0x5566_7788u32.to_le_bytes());
        reset_arena();
    }
}
