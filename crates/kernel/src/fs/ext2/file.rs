// EXT2 file handles
//
// Plain opens carry the inode and a byte position; reads resolve each
// logical block (sparse blocks come back zeroed) and writes allocate on
// demand, extend the size when the final position passes it, and write
// the inode back after every successful write. Wildcard opens yield an
// enumeration handle bound to the resolved folder.

use super::dir;
use super::disk::*;
use super::Ext2Volume;
use crate::fs::glob;
use crate::fs::{FileAttributes, FileHandle, OpenFlags};
use crate::klib::{KernelError, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

struct EnumerationState {
    pattern: String,
    entries: Vec<(String, u32)>,
    cursor: usize,
}

pub struct Ext2FileHandle {
    volume: Arc<Ext2Volume>,
    inode_index: u32,
    inode: Inode,
    name: String,
    position: u64,
    flags: OpenFlags,
    enumeration: Option<EnumerationState>,
}

impl Drop for Ext2FileHandle {
    fn drop(&mut self) {
        self.volume.open_files.fetch_sub(1, Ordering::AcqRel);
    }
}

fn attributes_of(inode: &Inode) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if inode.is_directory() {
        attributes |= FileAttributes::DIRECTORY;
    }
    if inode.mode & 0x0080 == 0 {
        attributes |= FileAttributes::READ_ONLY;
    }
    attributes
}

/// Open a path on the volume: a plain file (creating/truncating per the
/// flags) or, with wildcards, an enumeration over the parent folder.
pub(super) fn open_path(
    volume: &Arc<Ext2Volume>,
    path: &str,
    flags: OpenFlags,
) -> Result<crate::fs::File> {
    if glob::has_wildcard(path) {
        return open_enumeration(volume, path);
    }

    let (inode_index, inode) = match dir::resolve_path(volume, path) {
        Ok(found) => found,
        Err(KernelError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            let inode_index = dir::create_node(volume, path, false)?;
            (inode_index, volume.read_inode(inode_index)?)
        }
        Err(error) => return Err(error),
    };

    let mut inode = inode;
    if flags.contains(OpenFlags::TRUNCATE) {
        if inode.is_directory() {
            return Err(KernelError::InvalidArgument);
        }
        volume.truncate_inode(&mut inode)?;
        volume.write_inode(inode_index, &inode)?;
    }

    let name = path.rsplit('/').next().unwrap_or(path);
    let position = if flags.contains(OpenFlags::APPEND) {
        inode.size as u64
    } else {
        0
    };

    volume.open_files.fetch_add(1, Ordering::AcqRel);
    Ok(Box::new(Ext2FileHandle {
        volume: volume.clone(),
        inode_index,
        inode,
        name: String::from(name),
        position,
        flags,
        enumeration: None,
    }))
}

fn open_enumeration(volume: &Arc<Ext2Volume>, path: &str) -> Result<crate::fs::File> {
    let (folder_path, pattern) = match path.rfind('/') {
        Some(position) => (&path[..position], &path[position + 1..]),
        None => ("", path),
    };
    if glob::has_wildcard(folder_path) {
        return Err(KernelError::InvalidArgument);
    }

    let (inode_index, inode) = dir::resolve_path(volume, folder_path)?;
    if !inode.is_directory() {
        return Err(KernelError::InvalidArgument);
    }

    let entries = dir::list_directory(volume, &inode)?;

    volume.open_files.fetch_add(1, Ordering::AcqRel);
    Ok(Box::new(Ext2FileHandle {
        volume: volume.clone(),
        inode_index,
        inode,
        name: String::new(),
        position: 0,
        flags: OpenFlags::READ,
        enumeration: Some(EnumerationState {
            pattern: String::from(pattern),
            entries,
            cursor: 0,
        }),
    }))
}

impl FileHandle for Ext2FileHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.inode.size as u64
    }

    fn attributes(&self) -> FileAttributes {
        attributes_of(&self.inode)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        if self.enumeration.is_some() {
            return Err(KernelError::InvalidState);
        }
        self.position = position;
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if self.enumeration.is_some() {
            return Err(KernelError::InvalidState);
        }
        if self.inode.is_directory() {
            return Err(KernelError::InvalidArgument);
        }

        let size = self.inode.size as u64;
        if self.position >= size {
            return Ok(0);
        }

        let block_size = self.volume.block_size as u64;
        let wanted = buffer.len().min((size - self.position) as usize);
        let mut copied = 0usize;

        while copied < wanted {
            let logical = (self.position / block_size) as u32;
            let within = (self.position % block_size) as usize;
            let chunk = (block_size as usize - within).min(wanted - copied);

            let physical = self
                .volume
                .resolve_inode_block(&mut self.inode, logical, false)?;

            if physical == 0 {
                // Sparse block.
                buffer[copied..copied + chunk].fill(0);
            } else {
                let block = self.volume.read_block(physical)?;
                buffer[copied..copied + chunk].copy_from_slice(&block[within..within + chunk]);
            }

            copied += chunk;
            self.position += chunk as u64;
        }

        Ok(copied)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        if self.enumeration.is_some() {
            return Err(KernelError::InvalidState);
        }
        if !self.flags.mutating() {
            return Err(KernelError::PermissionDenied);
        }
        if self.inode.is_directory() {
            return Err(KernelError::InvalidArgument);
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let _files = self.volume.files_mutex.lock();

        let block_size = self.volume.block_size as u64;
        let mut written = 0usize;

        while written < buffer.len() {
            let logical = (self.position / block_size) as u32;
            let within = (self.position % block_size) as usize;
            let chunk = (block_size as usize - within).min(buffer.len() - written);

            let physical = self
                .volume
                .resolve_inode_block(&mut self.inode, logical, true)?;
            if physical == 0 {
                return Err(KernelError::Io);
            }

            if chunk == block_size as usize {
                self.volume.write_block(physical, &buffer[written..written + chunk])?;
            } else {
                let mut block = self.volume.read_block(physical)?;
                block[within..within + chunk].copy_from_slice(&buffer[written..written + chunk]);
                self.volume.write_block(physical, &block)?;
            }

            written += chunk;
            self.position += chunk as u64;

            if self.position > self.inode.size as u64 {
                self.inode.size = self.position as u32;
            }
            self.volume.write_inode(self.inode_index, &self.inode)?;
        }

        Ok(written)
    }

    fn open_next(&mut self) -> Result<bool> {
        let found = {
            let enumeration = self
                .enumeration
                .as_mut()
                .ok_or(KernelError::InvalidState)?;

            let mut found = None;
            while enumeration.cursor < enumeration.entries.len() {
                let (entry_name, entry_inode) =
                    enumeration.entries[enumeration.cursor].clone();
                enumeration.cursor += 1;

                if glob::match_pattern(&entry_name, &enumeration.pattern) {
                    found = Some((entry_name, entry_inode));
                    break;
                }
            }
            found
        };

        match found {
            Some((entry_name, entry_inode)) => {
                let child = self.volume.read_inode(entry_inode)?;
                self.name = entry_name;
                self.inode = child;
                self.inode_index = entry_inode;
                self.position = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
