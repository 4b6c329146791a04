// EXT2 directory operations
//
// Record walking respects RecordLength boundaries; names compare
// case-sensitively against the 8-bit NameLength prefix. New entries
// reuse a deleted record when it is big enough, else split the slack of
// a live record, else take a fresh directory block.

use super::disk::*;
use super::Ext2Volume;
use crate::klib::{KernelError, Result};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// Size a record needs for `name_length` name bytes.
fn entry_size_for(name_length: usize) -> usize {
    DIR_ENTRY_HEADER_SIZE + align_directory_name_length(name_length)
}

/// Look up `name` among the directory's direct blocks.
pub(super) fn find_inode_in_directory(
    volume: &Ext2Volume,
    directory: &Inode,
    name: &str,
) -> Result<u32> {
    let wanted = name.as_bytes();
    if wanted.is_empty() || wanted.len() > EXT2_NAME_MAX {
        return Err(KernelError::InvalidArgument);
    }

    for slot in 0..EXT2_DIRECT_BLOCKS {
        let block = directory.block[slot];
        if block == 0 {
            continue;
        }

        let buffer = volume.read_block(block)?;
        let mut offset = 0usize;

        while offset + DIR_ENTRY_HEADER_SIZE <= buffer.len() {
            let head: DirEntryHead = match read_record(&buffer, offset) {
                Some(head) => head,
                None => break,
            };
            if (head.record_length as usize) < DIR_ENTRY_HEADER_SIZE {
                break;
            }
            if offset + head.record_length as usize > buffer.len() {
                break;
            }

            if head.inode != 0 && head.name_length as usize == wanted.len() {
                let name_start = offset + DIR_ENTRY_HEADER_SIZE;
                let name_end = name_start + head.name_length as usize;
                if name_end <= buffer.len() && &buffer[name_start..name_end] == wanted {
                    return Ok(head.inode);
                }
            }

            offset += head.record_length as usize;
        }
    }

    Err(KernelError::NotFound)
}

/// Walk a path from the root inode. Empty components (`//`) are
/// rejected; a lone empty path resolves to the root.
pub(super) fn resolve_path(volume: &Ext2Volume, path: &str) -> Result<(u32, Inode)> {
    let mut current_index = EXT2_ROOT_INODE;
    let mut current = volume.read_inode(current_index)?;

    let trimmed = normalize_path(path)?;
    if trimmed.is_empty() {
        return Ok((current_index, current));
    }

    for component in trimmed.split('/') {
        if component.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if !current.is_directory() {
            return Err(KernelError::NotFound);
        }
        current_index = find_inode_in_directory(volume, &current, component)?;
        current = volume.read_inode(current_index)?;
    }

    Ok((current_index, current))
}

/// Strip trailing separators; `a//b` stays intact so the component walk
/// can reject the empty segment.
fn normalize_path(path: &str) -> Result<&str> {
    let mut end = path.len();
    while end > 0 && path.as_bytes()[end - 1] == b'/' {
        end -= 1;
    }
    Ok(&path[..end])
}

/// Insert `name → child_inode_index` into a directory. The directory
/// inode is written back on success.
pub(super) fn add_directory_entry(
    volume: &Ext2Volume,
    directory: &mut Inode,
    directory_index: u32,
    child_inode_index: u32,
    name: &str,
    file_type: u8,
) -> Result<()> {
    if child_inode_index == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let name_bytes = name.as_bytes();
    let mut name_length = name_bytes.len();
    if name_length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    if name_length > EXT2_NAME_MAX {
        name_length = EXT2_NAME_MAX;
    }

    let needed = entry_size_for(name_length);
    if needed > volume.block_size as usize {
        return Err(KernelError::InvalidArgument);
    }

    for slot in 0..EXT2_DIRECT_BLOCKS {
        let block = directory.block[slot];

        if block == 0 {
            // Fresh directory block: one spanning record.
            let block = volume.allocate_block()?;
            directory.block[slot] = block;
            directory.size = (slot as u32 + 1) * volume.block_size;
            directory.blocks += volume.sectors_per_block;

            let mut buffer = vec![0u8; volume.block_size as usize];
            let head = DirEntryHead {
                inode: child_inode_index,
                record_length: volume.block_size as u16,
                name_length: name_length as u8,
                file_type,
            };
            write_record(&mut buffer, 0, &head);
            buffer[DIR_ENTRY_HEADER_SIZE..DIR_ENTRY_HEADER_SIZE + name_length]
                .copy_from_slice(&name_bytes[..name_length]);

            volume.write_block(block, &buffer)?;
            return volume.write_inode(directory_index, directory);
        }

        let mut buffer = volume.read_block(block)?;
        let mut offset = 0usize;

        while offset + DIR_ENTRY_HEADER_SIZE <= buffer.len() {
            let head: DirEntryHead = match read_record(&buffer, offset) {
                Some(head) => head,
                None => break,
            };
            let record_length = head.record_length as usize;
            if record_length < DIR_ENTRY_HEADER_SIZE || offset + record_length > buffer.len() {
                break;
            }

            if head.inode == 0 && record_length >= needed {
                // Reuse a deleted record in place.
                let reused = DirEntryHead {
                    inode: child_inode_index,
                    record_length: head.record_length,
                    name_length: name_length as u8,
                    file_type,
                };
                write_record(&mut buffer, offset, &reused);
                let name_start = offset + DIR_ENTRY_HEADER_SIZE;
                buffer[name_start..offset + record_length].fill(0);
                buffer[name_start..name_start + name_length]
                    .copy_from_slice(&name_bytes[..name_length]);

                volume.write_block(block, &buffer)?;
                return volume.write_inode(directory_index, directory);
            }

            let used = entry_size_for(head.name_length as usize);
            if head.inode != 0 && used < record_length && record_length - used >= needed {
                // Split the slack after the live record.
                let shortened = DirEntryHead {
                    record_length: used as u16,
                    ..head
                };
                write_record(&mut buffer, offset, &shortened);

                let new_offset = offset + used;
                let fresh = DirEntryHead {
                    inode: child_inode_index,
                    record_length: (record_length - used) as u16,
                    name_length: name_length as u8,
                    file_type,
                };
                write_record(&mut buffer, new_offset, &fresh);
                let name_start = new_offset + DIR_ENTRY_HEADER_SIZE;
                buffer[name_start..offset + record_length].fill(0);
                buffer[name_start..name_start + name_length]
                    .copy_from_slice(&name_bytes[..name_length]);

                volume.write_block(block, &buffer)?;
                return volume.write_inode(directory_index, directory);
            }

            offset += record_length;
        }
    }

    Err(KernelError::OutOfMemory)
}

/// Create a directory under `parent`: fresh inode, one data block with
/// the `.` and `..` records, link into the parent (whose link count
/// grows by one).
pub(super) fn create_directory_internal(
    volume: &Ext2Volume,
    parent: &mut Inode,
    parent_index: u32,
    name: &str,
) -> Result<(u32, Inode)> {
    let (inode_index, mut inode) = volume.allocate_inode(true)?;

    let block = match volume.allocate_block() {
        Ok(block) => block,
        Err(error) => {
            let _ = volume.free_inode(inode_index, true);
            return Err(error);
        }
    };

    let result = (|| -> Result<()> {
        let mut buffer = vec![0u8; volume.block_size as usize];
        let dot_size = entry_size_for(1);

        let dot = DirEntryHead {
            inode: inode_index,
            record_length: dot_size as u16,
            name_length: 1,
            file_type: EXT2_FT_DIR,
        };
        write_record(&mut buffer, 0, &dot);
        buffer[DIR_ENTRY_HEADER_SIZE] = b'.';

        let dotdot = DirEntryHead {
            inode: parent_index,
            record_length: (volume.block_size as usize - dot_size) as u16,
            name_length: 2,
            file_type: EXT2_FT_DIR,
        };
        write_record(&mut buffer, dot_size, &dotdot);
        buffer[dot_size + DIR_ENTRY_HEADER_SIZE] = b'.';
        buffer[dot_size + DIR_ENTRY_HEADER_SIZE + 1] = b'.';

        volume.write_block(block, &buffer)?;

        inode.block[0] = block;
        inode.size = volume.block_size;
        inode.blocks = volume.sectors_per_block;
        inode.links_count = 2;
        volume.write_inode(inode_index, &inode)?;

        add_directory_entry(volume, parent, parent_index, inode_index, name, EXT2_FT_DIR)?;

        parent.links_count += 1;
        volume.write_inode(parent_index, parent)
    })();

    if let Err(error) = result {
        let _ = volume.free_block(block);
        let _ = volume.free_inode(inode_index, true);
        return Err(error);
    }

    Ok((inode_index, inode))
}

/// Walk (creating as needed) every intermediate directory of `path` and
/// return the parent inode plus the final component. Trailing
/// separators are normalized away; empty components are rejected.
pub(super) fn ensure_parent_directory(
    volume: &Ext2Volume,
    path: &str,
) -> Result<(u32, Inode, String)> {
    let trimmed = normalize_path(path)?;
    if trimmed.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let (parent_path, final_component) = match trimmed.rfind('/') {
        Some(position) => (&trimmed[..position], &trimmed[position + 1..]),
        None => ("", trimmed),
    };
    if final_component.is_empty() || final_component.len() > EXT2_NAME_MAX {
        return Err(KernelError::InvalidArgument);
    }

    let mut current_index = EXT2_ROOT_INODE;
    let mut current = volume.read_inode(current_index)?;

    if !parent_path.is_empty() {
        for component in parent_path.split('/') {
            if component.is_empty() || component.len() >= EXT2_NAME_MAX {
                return Err(KernelError::InvalidArgument);
            }

            match find_inode_in_directory(volume, &current, component) {
                Ok(next_index) => {
                    let next = volume.read_inode(next_index)?;
                    if !next.is_directory() {
                        return Err(KernelError::InvalidArgument);
                    }
                    current_index = next_index;
                    current = next;
                }
                Err(KernelError::NotFound) => {
                    let (next_index, next) = create_directory_internal(
                        volume,
                        &mut current,
                        current_index,
                        component,
                    )?;
                    current_index = next_index;
                    current = next;
                }
                Err(error) => return Err(error),
            }
        }
    }

    Ok((current_index, current, String::from(final_component)))
}

/// Create a file or directory node at `path`. Creating an existing node
/// of the same type succeeds idempotently; a type clash fails.
pub(super) fn create_node(volume: &Ext2Volume, path: &str, directory: bool) -> Result<u32> {
    let (parent_index, mut parent, name) = ensure_parent_directory(volume, path)?;

    if let Ok(existing_index) = find_inode_in_directory(volume, &parent, &name) {
        let existing = volume.read_inode(existing_index)?;
        if directory && existing.is_directory() {
            return Ok(existing_index);
        }
        if !directory && existing.is_regular() {
            return Ok(existing_index);
        }
        return Err(KernelError::AlreadyExists);
    }

    if directory {
        let (inode_index, _) =
            create_directory_internal(volume, &mut parent, parent_index, &name)?;
        Ok(inode_index)
    } else {
        let (inode_index, inode) = volume.allocate_inode(false)?;

        if let Err(error) = add_directory_entry(
            volume,
            &mut parent,
            parent_index,
            inode_index,
            &name,
            EXT2_FT_REG_FILE,
        ) {
            let _ = volume.free_inode(inode_index, false);
            return Err(error);
        }

        if let Err(error) = volume.write_inode(inode_index, &inode) {
            let _ = volume.free_inode(inode_index, false);
            return Err(error);
        }

        Ok(inode_index)
    }
}

/// Directory listing used by enumeration handles: `(entry name, inode)`
/// pairs from the direct blocks, skipping deleted records.
pub(super) fn list_directory(
    volume: &Ext2Volume,
    directory: &Inode,
) -> Result<Vec<(String, u32)>> {
    let mut entries = Vec::new();

    for slot in 0..EXT2_DIRECT_BLOCKS {
        let block = directory.block[slot];
        if block == 0 {
            continue;
        }

        let buffer = volume.read_block(block)?;
        let mut offset = 0usize;

        while offset + DIR_ENTRY_HEADER_SIZE <= buffer.len() {
            let head: DirEntryHead = match read_record(&buffer, offset) {
                Some(head) => head,
                None => break,
            };
            let record_length = head.record_length as usize;
            if record_length < DIR_ENTRY_HEADER_SIZE || offset + record_length > buffer.len() {
                break;
            }

            if head.inode != 0 && head.name_length > 0 {
                let name_start = offset + DIR_ENTRY_HEADER_SIZE;
                let name_end = name_start + head.name_length as usize;
                if name_end <= buffer.len() {
                    if let Ok(name) = core::str::from_utf8(&buffer[name_start..name_end]) {
                        entries.push((String::from(name), head.inode));
                    }
                }
            }

            offset += record_length;
        }
    }

    Ok(entries)
}
