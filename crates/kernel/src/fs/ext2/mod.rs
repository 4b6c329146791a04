//! EXT2 filesystem driver
//!
//! Classic direct/indirect block layout over a 512-byte-sector storage
//! unit. The volume keeps its superblock and group descriptors in
//! memory and flushes them after every allocation mutation so the
//! on-disk free counters always agree with the bitmaps.

pub mod disk;
mod alloc_ops;
mod dir;
mod file;

#[cfg(test)]
pub mod testimg;

pub use self::file::Ext2FileHandle;

use crate::drivers::block::{StorageUnit, SECTOR_SIZE};
use crate::fs::{FileSystemDriver, OpenFlags};
use crate::klib::{KernelError, Result};
use crate::sync::KMutex;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use self::disk::*;
use spin::Mutex;

pub(super) struct VolumeState {
    pub superblock: Superblock,
    pub groups: Vec<GroupDescriptor>,
}

/// A mounted EXT2 volume.
pub struct Ext2Volume {
    pub(super) storage: Arc<dyn StorageUnit>,
    /// First sector of the partition; all sector I/O is relative to it.
    pub(super) partition_start: u64,
    pub(super) state: Mutex<VolumeState>,
    pub(super) block_size: u32,
    pub(super) sectors_per_block: u32,
    pub(super) inode_size: u32,
    mount_name: String,
    /// Serializes structural file operations on this volume.
    pub(super) files_mutex: Arc<KMutex>,
    pub(super) open_files: AtomicUsize,
    self_ref: Weak<Ext2Volume>,
}

impl Ext2Volume {
    /// Mount a partition: validate the superblock, size the volume and
    /// load the group descriptors.
    pub fn mount(
        storage: Arc<dyn StorageUnit>,
        partition_start: u64,
        mount_name: &str,
    ) -> Result<Arc<Self>> {
        let mut sector = vec![0u8; SECTOR_SIZE * 2];
        storage.read_sectors(
            partition_start + (EXT2_SUPERBLOCK_OFFSET as u64 / SECTOR_SIZE as u64),
            2,
            &mut sector,
        )?;
        let superblock: Superblock =
            read_record(&sector, 0).ok_or(KernelError::Io)?;

        if superblock.magic != EXT2_SUPER_MAGIC {
            crate::warn!("ext2: bad superblock magic {:#06x}", superblock.magic);
            return Err(KernelError::InvalidArgument);
        }

        let block_size = superblock.block_size();
        if !(EXT2_MIN_BLOCK_SIZE..=4096).contains(&block_size) {
            crate::warn!("ext2: unsupported block size {}", block_size);
            return Err(KernelError::InvalidArgument);
        }

        let inode_size = superblock.inode_record_size() as u32;

        let volume = Arc::new_cyclic(|self_ref| Self {
            storage,
            partition_start,
            state: Mutex::new(VolumeState {
                superblock,
                groups: Vec::new(),
            }),
            block_size,
            sectors_per_block: block_size / SECTOR_SIZE as u32,
            inode_size,
            mount_name: String::from(mount_name),
            files_mutex: KMutex::new("ext2-files"),
            open_files: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        });

        volume.load_group_descriptors()?;

        crate::info!(
            "ext2: mounted '{}' (block size {}, {} groups, {} free blocks)",
            mount_name,
            block_size,
            superblock.group_count(),
            superblock.free_blocks_count
        );

        Ok(volume)
    }

    pub(super) fn self_arc(&self) -> Arc<Ext2Volume> {
        self.self_ref.upgrade().expect("volume outlives its Arc")
    }

    // ---- storage plane --------------------------------------------------

    /// Read sectors relative to the partition start.
    pub(super) fn read_sectors(&self, sector: u64, count: u32, buffer: &mut [u8]) -> Result<()> {
        self.storage
            .read_sectors(self.partition_start + sector, count, buffer)
    }

    pub(super) fn write_sectors(&self, sector: u64, count: u32, buffer: &[u8]) -> Result<()> {
        self.storage
            .write_sectors(self.partition_start + sector, count, buffer)
    }

    /// Read one filesystem block.
    pub(super) fn read_block(&self, block: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.block_size as usize];
        self.read_sectors(
            block as u64 * self.sectors_per_block as u64,
            self.sectors_per_block,
            &mut buffer,
        )?;
        Ok(buffer)
    }

    pub(super) fn write_block(&self, block: u32, buffer: &[u8]) -> Result<()> {
        if buffer.len() != self.block_size as usize {
            return Err(KernelError::InvalidArgument);
        }
        self.write_sectors(
            block as u64 * self.sectors_per_block as u64,
            self.sectors_per_block,
            buffer,
        )
    }

    /// First block of the group-descriptor table.
    fn descriptor_table_block(&self) -> u32 {
        if self.block_size == 1024 {
            2
        } else {
            1
        }
    }

    fn load_group_descriptors(&self) -> Result<()> {
        let mut state = self.state.lock();
        let group_count = state.superblock.group_count() as usize;
        let per_block = self.block_size as usize / GROUP_DESCRIPTOR_SIZE;

        let mut groups = Vec::with_capacity(group_count);
        let mut block_buffer: Option<(u32, Vec<u8>)> = None;

        for index in 0..group_count {
            let block = self.descriptor_table_block() + (index / per_block) as u32;
            let offset = (index % per_block) * GROUP_DESCRIPTOR_SIZE;

            if block_buffer.as_ref().map(|(b, _)| *b) != Some(block) {
                block_buffer = Some((block, self.read_block(block)?));
            }
            let (_, buffer) = block_buffer.as_ref().unwrap();
            let descriptor: GroupDescriptor =
                read_record(buffer, offset).ok_or(KernelError::Io)?;
            groups.push(descriptor);
        }

        state.groups = groups;
        Ok(())
    }

    /// Write the in-memory superblock back to its home offset.
    pub(super) fn flush_superblock(&self, state: &VolumeState) -> Result<()> {
        let sector = EXT2_SUPERBLOCK_OFFSET as u64 / SECTOR_SIZE as u64;
        let mut buffer = vec![0u8; SECTOR_SIZE * 2];
        self.read_sectors(sector, 2, &mut buffer)?;
        if !write_record(&mut buffer, 0, &state.superblock) {
            return Err(KernelError::Io);
        }
        self.write_sectors(sector, 2, &buffer)
    }

    /// Write one group descriptor back into the descriptor table.
    pub(super) fn flush_group_descriptor(
        &self,
        state: &VolumeState,
        group_index: usize,
    ) -> Result<()> {
        let per_block = self.block_size as usize / GROUP_DESCRIPTOR_SIZE;
        let block = self.descriptor_table_block() + (group_index / per_block) as u32;
        let offset = (group_index % per_block) * GROUP_DESCRIPTOR_SIZE;

        let mut buffer = self.read_block(block)?;
        if !write_record(&mut buffer, offset, &state.groups[group_index]) {
            return Err(KernelError::Io);
        }
        self.write_block(block, &buffer)
    }

    // ---- inode plane ----------------------------------------------------

    /// Locate an inode on disk: (block, byte offset within the block).
    fn inode_location(&self, state: &VolumeState, inode_index: u32) -> Result<(u32, usize)> {
        if inode_index == 0 || inode_index > state.superblock.inodes_count {
            return Err(KernelError::InvalidArgument);
        }
        let group = ((inode_index - 1) / state.superblock.inodes_per_group) as usize;
        let slot = (inode_index - 1) % state.superblock.inodes_per_group;
        let descriptor = state.groups.get(group).ok_or(KernelError::InvalidArgument)?;

        let byte_offset = slot as u64 * self.inode_size as u64;
        let block = descriptor.inode_table + (byte_offset / self.block_size as u64) as u32;
        let offset = (byte_offset % self.block_size as u64) as usize;
        Ok((block, offset))
    }

    pub(super) fn read_inode(&self, inode_index: u32) -> Result<Inode> {
        let state = self.state.lock();
        let (block, offset) = self.inode_location(&state, inode_index)?;
        drop(state);

        let buffer = self.read_block(block)?;
        read_record(&buffer, offset).ok_or(KernelError::Io)
    }

    pub(super) fn write_inode(&self, inode_index: u32, inode: &Inode) -> Result<()> {
        let state = self.state.lock();
        let (block, offset) = self.inode_location(&state, inode_index)?;
        drop(state);

        let mut buffer = self.read_block(block)?;
        if !write_record(&mut buffer, offset, inode) {
            return Err(KernelError::Io);
        }
        self.write_block(block, &buffer)
    }

    /// Free-counter snapshot `(free blocks, free inodes)` for
    /// consistency checks.
    pub fn free_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (
            state.superblock.free_blocks_count,
            state.superblock.free_inodes_count,
        )
    }

    /// Sum of the per-group free counters; must equal the superblock's.
    pub fn group_free_sums(&self) -> (u32, u32) {
        let state = self.state.lock();
        state.groups.iter().fold((0, 0), |(blocks, inodes), g| {
            (
                blocks + g.free_blocks_count as u32,
                inodes + g.free_inodes_count as u32,
            )
        })
    }
}

impl FileSystemDriver for Ext2Volume {
    fn name(&self) -> &str {
        &self.mount_name
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<crate::fs::File> {
        let _files = self.files_mutex.lock();
        file::open_path(&self.self_arc(), path, flags)
    }

    fn create_folder(&self, path: &str) -> Result<()> {
        let _files = self.files_mutex.lock();
        dir::create_node(self, path, true).map(|_| ())
    }

    fn path_exists(&self, path: &str) -> Result<bool> {
        let _files = self.files_mutex.lock();
        Ok(dir::resolve_path(self, path).is_ok())
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        let _files = self.files_mutex.lock();
        match dir::resolve_path(self, path) {
            Ok((_, inode)) => Ok(inode.is_regular()),
            Err(_) => Ok(false),
        }
    }

    fn unmount(&self) -> Result<()> {
        if self.open_files.load(Ordering::Acquire) != 0 {
            return Err(KernelError::Busy);
        }
        let state = self.state.lock();
        self.flush_superblock(&state)?;
        Ok(())
    }
}
