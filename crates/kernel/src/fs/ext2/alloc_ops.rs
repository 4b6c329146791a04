// EXT2 allocation
//
// Block and inode bitmaps are scanned first-fit, group by group. Every
// successful mutation decrements/increments the group and superblock
// counters and flushes both, so the on-disk free counts always track
// the bitmaps. Fresh data blocks are zero-filled before they become
// visible; a failed zero-fill rolls the allocation back.

use super::disk::*;
use super::Ext2Volume;
use crate::klib::{KernelError, Result};
use alloc::vec;

impl Ext2Volume {
    /// Allocate one data block: first clear bit of the first group with
    /// room. Returns the absolute block number.
    pub(super) fn allocate_block(&self) -> Result<u32> {
        let bits_per_block = self.block_size * 8;

        let (group_index, bit_index) = {
            let mut state = self.state.lock();
            let blocks_per_group = state.superblock.blocks_per_group;

            let mut found = None;
            for group_index in 0..state.groups.len() {
                let group = &state.groups[group_index];
                if group.free_blocks_count == 0 || group.block_bitmap == 0 {
                    continue;
                }

                let mut bitmap = self.read_block(group.block_bitmap)?;
                let limit = bits_per_block.min(blocks_per_group);
                for bit_index in 0..limit {
                    let byte = (bit_index / 8) as usize;
                    let mask = 1u8 << (bit_index % 8);
                    if bitmap[byte] & mask != 0 {
                        continue;
                    }

                    bitmap[byte] |= mask;
                    self.write_block(group.block_bitmap, &bitmap)?;
                    found = Some((group_index, bit_index));
                    break;
                }
                if found.is_some() {
                    break;
                }
            }

            let (group_index, bit_index) = found.ok_or(KernelError::OutOfMemory)?;

            state.groups[group_index].free_blocks_count -= 1;
            state.superblock.free_blocks_count -= 1;
            self.flush_group_descriptor(&state, group_index)?;
            self.flush_superblock(&state)?;

            (group_index, bit_index)
        };

        let absolute = {
            let state = self.state.lock();
            state.superblock.first_data_block
                + group_index as u32 * state.superblock.blocks_per_group
                + bit_index
        };

        // New blocks become visible zero-filled; failure returns the
        // block to the bitmap.
        let zero = vec![0u8; self.block_size as usize];
        if let Err(error) = self.write_block(absolute, &zero) {
            let _ = self.free_block(absolute);
            return Err(error);
        }

        Ok(absolute)
    }

    /// Return a block to its group. Freeing an already-free block is a
    /// no-op.
    pub(super) fn free_block(&self, block: u32) -> Result<()> {
        if block == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut state = self.state.lock();
        if block < state.superblock.first_data_block {
            return Err(KernelError::InvalidArgument);
        }

        let relative = block - state.superblock.first_data_block;
        let group_index = (relative / state.superblock.blocks_per_group) as usize;
        if group_index >= state.groups.len() {
            return Err(KernelError::InvalidArgument);
        }
        let bit_index = relative % state.superblock.blocks_per_group;

        let bitmap_block = state.groups[group_index].block_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        let byte = (bit_index / 8) as usize;
        let mask = 1u8 << (bit_index % 8);

        if bitmap[byte] & mask == 0 {
            return Ok(());
        }

        bitmap[byte] &= !mask;
        self.write_block(bitmap_block, &bitmap)?;

        state.groups[group_index].free_blocks_count += 1;
        state.superblock.free_blocks_count += 1;
        self.flush_group_descriptor(&state, group_index)?;
        self.flush_superblock(&state)?;

        Ok(())
    }

    /// Allocate an inode, initialized as a fresh directory or regular
    /// file. Returns `(inode index, inode)`.
    pub(super) fn allocate_inode(&self, directory: bool) -> Result<(u32, Inode)> {
        let bits_per_block = self.block_size * 8;
        let mut state = self.state.lock();
        let inodes_per_group = state.superblock.inodes_per_group;

        let mut found = None;
        for group_index in 0..state.groups.len() {
            let group = &state.groups[group_index];
            if group.free_inodes_count == 0 || group.inode_bitmap == 0 {
                continue;
            }

            let mut bitmap = self.read_block(group.inode_bitmap)?;
            let limit = bits_per_block.min(inodes_per_group);
            for bit_index in 0..limit {
                let byte = (bit_index / 8) as usize;
                let mask = 1u8 << (bit_index % 8);
                if bitmap[byte] & mask != 0 {
                    continue;
                }

                bitmap[byte] |= mask;
                self.write_block(group.inode_bitmap, &bitmap)?;
                found = Some((group_index, bit_index));
                break;
            }
            if found.is_some() {
                break;
            }
        }

        let (group_index, bit_index) = found.ok_or(KernelError::OutOfMemory)?;

        state.groups[group_index].free_inodes_count -= 1;
        if directory {
            state.groups[group_index].used_dirs_count += 1;
        }
        state.superblock.free_inodes_count -= 1;
        self.flush_group_descriptor(&state, group_index)?;
        self.flush_superblock(&state)?;

        let inode_index = group_index as u32 * inodes_per_group + bit_index + 1;

        let mut inode = Inode::zeroed();
        inode.mode = if directory {
            EXT2_MODE_DIRECTORY | EXT2_DEFAULT_DIR_PERMISSIONS
        } else {
            EXT2_MODE_REGULAR | EXT2_DEFAULT_FILE_PERMISSIONS
        };
        inode.links_count = if directory { 2 } else { 1 };

        Ok((inode_index, inode))
    }

    /// Release an inode. Freeing an already-free inode is a no-op.
    pub(super) fn free_inode(&self, inode_index: u32, directory: bool) -> Result<()> {
        if inode_index == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut state = self.state.lock();
        let group_index = ((inode_index - 1) / state.superblock.inodes_per_group) as usize;
        if group_index >= state.groups.len() {
            return Err(KernelError::InvalidArgument);
        }
        let bit_index = (inode_index - 1) % state.superblock.inodes_per_group;

        let bitmap_block = state.groups[group_index].inode_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        let byte = (bit_index / 8) as usize;
        let mask = 1u8 << (bit_index % 8);

        if bitmap[byte] & mask == 0 {
            return Ok(());
        }

        bitmap[byte] &= !mask;
        self.write_block(bitmap_block, &bitmap)?;

        state.groups[group_index].free_inodes_count += 1;
        if directory && state.groups[group_index].used_dirs_count > 0 {
            state.groups[group_index].used_dirs_count -= 1;
        }
        state.superblock.free_inodes_count += 1;
        self.flush_group_descriptor(&state, group_index)?;
        self.flush_superblock(&state)?;

        Ok(())
    }

    /// Map a logical block index to its physical block, walking the
    /// direct slots and the single/double/triple indirect trees. In
    /// allocate mode every missing link on the way down is created
    /// (indirect blocks arrive zero-filled) and `inode.blocks` grows by
    /// one block's worth of sectors per new block.
    pub(super) fn resolve_inode_block(
        &self,
        inode: &mut Inode,
        block_index: u32,
        allocate: bool,
    ) -> Result<u32> {
        let entries_per_block = self.block_size / 4;
        let sectors_per_block = self.sectors_per_block;

        if (block_index as usize) < EXT2_DIRECT_BLOCKS {
            let mut data_block = inode.block[block_index as usize];
            if data_block == 0 && allocate {
                data_block = self.allocate_block()?;
                inode.block[block_index as usize] = data_block;
                inode.blocks += sectors_per_block;
            }
            return Ok(data_block);
        }

        let mut logical = block_index - EXT2_DIRECT_BLOCKS as u32;
        let single_span = entries_per_block;
        let double_span = single_span * entries_per_block;
        let triple_span = double_span.saturating_mul(entries_per_block);

        if logical < single_span {
            let root =
                self.ensure_indirect_root(inode, EXT2_IND_BLOCK, allocate)?;
            if root == 0 {
                return Ok(0);
            }
            return self.walk_indirect(inode, root, &[logical], allocate);
        }

        logical -= single_span;
        if logical < double_span {
            let root =
                self.ensure_indirect_root(inode, EXT2_DIND_BLOCK, allocate)?;
            if root == 0 {
                return Ok(0);
            }
            let indexes = [logical / single_span, logical % single_span];
            return self.walk_indirect(inode, root, &indexes, allocate);
        }

        logical -= double_span;
        if logical < triple_span {
            let root =
                self.ensure_indirect_root(inode, EXT2_TIND_BLOCK, allocate)?;
            if root == 0 {
                return Ok(0);
            }
            let indexes = [
                logical / double_span,
                (logical % double_span) / single_span,
                logical % single_span,
            ];
            return self.walk_indirect(inode, root, &indexes, allocate);
        }

        Err(KernelError::InvalidArgument)
    }

    /// Fetch (or in allocate mode create) the root of one indirect tree.
    fn ensure_indirect_root(
        &self,
        inode: &mut Inode,
        slot: usize,
        allocate: bool,
    ) -> Result<u32> {
        let mut root = inode.block[slot];
        if root == 0 && allocate {
            root = self.allocate_block()?;
            inode.block[slot] = root;
            inode.blocks += self.sectors_per_block;
        }
        Ok(root)
    }

    /// Descend one indirect chain; `indexes` holds the entry index at
    /// each level, outermost first.
    fn walk_indirect(
        &self,
        inode: &mut Inode,
        root: u32,
        indexes: &[u32],
        allocate: bool,
    ) -> Result<u32> {
        let mut current = root;

        for (depth, &index) in indexes.iter().enumerate() {
            let last = depth == indexes.len() - 1;
            let mut table = self.read_block(current)?;
            let offset = index as usize * 4;
            let mut entry = u32::from_le_bytes([
                table[offset],
                table[offset + 1],
                table[offset + 2],
                table[offset + 3],
            ]);

            if entry == 0 {
                if !allocate {
                    return Ok(0);
                }
                entry = self.allocate_block()?;
                inode.blocks += self.sectors_per_block;
                table[offset..offset + 4].copy_from_slice(&entry.to_le_bytes());
                self.write_block(current, &table)?;
            }

            if last {
                return Ok(entry);
            }
            current = entry;
        }

        Ok(current)
    }

    /// Release every block of an inode: direct slots, then the three
    /// indirect trees, deepest first within each tree. Size and block
    /// count reset to zero.
    pub(super) fn truncate_inode(&self, inode: &mut Inode) -> Result<()> {
        for slot in 0..EXT2_DIRECT_BLOCKS {
            if inode.block[slot] != 0 {
                self.free_block(inode.block[slot])?;
                inode.block[slot] = 0;
            }
        }

        for (slot, depth) in [
            (EXT2_IND_BLOCK, 1u32),
            (EXT2_DIND_BLOCK, 2),
            (EXT2_TIND_BLOCK, 3),
        ] {
            if inode.block[slot] != 0 {
                self.free_indirect_tree(inode.block[slot], depth)?;
                inode.block[slot] = 0;
            }
        }

        inode.size = 0;
        inode.blocks = 0;
        Ok(())
    }

    /// Recursively free an indirect tree rooted at `block`.
    fn free_indirect_tree(&self, block: u32, depth: u32) -> Result<()> {
        if block == 0 {
            return Ok(());
        }

        let table = self.read_block(block)?;
        let entries = self.block_size as usize / 4;

        for index in 0..entries {
            let offset = index * 4;
            let entry = u32::from_le_bytes([
                table[offset],
                table[offset + 1],
                table[offset + 2],
                table[offset + 3],
            ]);
            if entry == 0 {
                continue;
            }
            if depth > 1 {
                self.free_indirect_tree(entry, depth - 1)?;
            } else {
                self.free_block(entry)?;
            }
        }

        self.free_block(block)
    }
}
