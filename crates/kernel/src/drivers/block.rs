// Block storage
//
// A storage unit exposes 512-byte sector I/O. Filesystems compose
// blocks out of sectors on top of this trait. The RAM disk backs the
// hermetic filesystem tests and the boot-time scratch volume.

use crate::klib::{KernelError, Result};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

/// Opaque disk reference used by filesystem drivers.
pub trait StorageUnit: Send + Sync {
    /// Total sectors on the unit.
    fn sector_count(&self) -> u64;

    fn read_sectors(&self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<()>;

    fn write_sectors(&self, lba: u64, count: u32, buffer: &[u8]) -> Result<()>;
}

/// Memory-backed storage unit.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    sector_count: u64,
}

impl RamDisk {
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; sector_count as usize * SECTOR_SIZE]),
            sector_count,
        }
    }

    /// Wrap an existing image (e.g. a prebuilt filesystem).
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        if image.len() % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let sector_count = (image.len() / SECTOR_SIZE) as u64;
        Ok(Self {
            sectors: Mutex::new(image),
            sector_count,
        })
    }

    fn check(&self, lba: u64, count: u32, buffer_len: usize) -> Result<usize> {
        let bytes = count as usize * SECTOR_SIZE;
        if count == 0 || buffer_len < bytes {
            return Err(KernelError::InvalidArgument);
        }
        if lba + count as u64 > self.sector_count {
            return Err(KernelError::InvalidArgument);
        }
        Ok(lba as usize * SECTOR_SIZE)
    }
}

impl StorageUnit for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&self, lba: u64, count: u32, buffer: &mut [u8]) -> Result<()> {
        let offset = self.check(lba, count, buffer.len())?;
        let bytes = count as usize * SECTOR_SIZE;
        let sectors = self.sectors.lock();
        buffer[..bytes].copy_from_slice(&sectors[offset..offset + bytes]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, count: u32, buffer: &[u8]) -> Result<()> {
        let offset = self.check(lba, count, buffer.len())?;
        let bytes = count as usize * SECTOR_SIZE;
        let mut sectors = self.sectors.lock();
        sectors[offset..offset + bytes].copy_from_slice(&buffer[..bytes]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_roundtrip() {
        let disk = RamDisk::new(16);
        let mut out = [0xABu8; SECTOR_SIZE * 2];
        disk.write_sectors(3, 2, &out).unwrap();

        let mut input = [0u8; SECTOR_SIZE * 2];
        disk.read_sectors(3, 2, &mut input).unwrap();
        assert_eq!(input[..], out[..]);

        // Past-the-end access is refused.
        assert!(disk.read_sectors(15, 2, &mut input).is_err());
        out[0] = 0;
        assert!(disk.write_sectors(16, 1, &out).is_err());
    }
}
