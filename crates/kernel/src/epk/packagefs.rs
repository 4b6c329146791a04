// PackageFS
//
// Read-only filesystem over a validated EPK package. The node tree is
// built from the TOC, synthesizing implicit folders for parents that
// are not explicitly listed; FOLDER_ALIAS nodes resolve through their
// targets up to a fixed depth. Any mutating open fails; unmount is
// refused while open files remain.

use super::format::*;
use super::parser::{validate_package_buffer, EpkError, EpkParserOptions};
use crate::fs::{glob, FileAttributes, FileHandle, OpenFlags};
use crate::klib::{KernelError, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Longest alias chain the resolver follows.
const ALIAS_RESOLUTION_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Folder,
    FolderAlias,
}

struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    name: String,
    node_type: NodeType,
    permissions: u32,
    modified_time: u64,
    /// Index into the parsed TOC; `None` for synthesized folders.
    toc_index: Option<usize>,
    /// False while the node only exists as an implicit parent.
    defined: bool,
    alias_target: Option<String>,
    file_size: u64,
    /// Inline content range inside the package bytes.
    inline: Option<(u32, u32)>,
    has_blocks: bool,
}

/// A mounted package.
pub struct PackageFs {
    mount_name: String,
    /// The package image; node content ranges point into it.
    bytes: Vec<u8>,
    nodes: Vec<Node>,
    open_files: AtomicUsize,
    self_ref: Weak<PackageFs>,
}

impl PackageFs {
    /// Validate `bytes` and build the node tree. Rejected packages
    /// never leave a partial mount behind.
    pub fn new(
        bytes: Vec<u8>,
        options: &EpkParserOptions,
        mount_name: &str,
    ) -> core::result::Result<Arc<Self>, EpkError> {
        let nodes = {
            let package = validate_package_buffer(&bytes, options)?;
            build_tree(&package)?
        };

        Ok(Arc::new_cyclic(|self_ref| Self {
            mount_name: String::from(mount_name),
            bytes,
            nodes,
            open_files: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    fn self_arc(&self) -> Arc<PackageFs> {
        self.self_ref.upgrade().expect("packagefs outlives its Arc")
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Find a direct child by name.
    fn child_of(&self, node: usize, name: &str) -> Option<usize> {
        self.nodes[node]
            .children
            .iter()
            .copied()
            .find(|&child| self.nodes[child].name == name)
    }

    /// Resolve a path to a node, following folder aliases.
    fn resolve(&self, path: &str) -> Result<usize> {
        self.resolve_from(0, path, 0)
    }

    fn resolve_from(&self, start: usize, path: &str, depth: usize) -> Result<usize> {
        if depth > ALIAS_RESOLUTION_LIMIT {
            return Err(KernelError::InvalidState);
        }

        let mut current = start;
        let trimmed = path.trim_end_matches('/');

        for component in trimmed.split('/') {
            if trimmed.is_empty() {
                break;
            }
            if component.is_empty() {
                return Err(KernelError::InvalidArgument);
            }

            current = self.follow_alias(current, depth)?;
            current = self
                .child_of(current, component)
                .ok_or(KernelError::NotFound)?;
        }

        self.follow_alias(current, depth)
    }

    /// If the node is an alias, resolve its target (recursively bounded).
    fn follow_alias(&self, node: usize, depth: usize) -> Result<usize> {
        if self.nodes[node].node_type != NodeType::FolderAlias {
            return Ok(node);
        }
        if depth >= ALIAS_RESOLUTION_LIMIT {
            return Err(KernelError::InvalidState);
        }
        let target = self.nodes[node]
            .alias_target
            .as_ref()
            .ok_or(KernelError::InvalidState)?;
        self.resolve_from(0, target, depth + 1)
    }
}

/// Build the node tree from the validated TOC.
fn build_tree(
    package: &super::parser::ValidatedPackage<'_>,
) -> core::result::Result<Vec<Node>, EpkError> {
    let reject = EpkError::Format(EpkStatus::InvalidEntryFormat);

    let mut nodes: Vec<Node> = Vec::with_capacity(package.toc_entries.len() + 1);
    nodes.push(Node {
        parent: None,
        children: Vec::new(),
        name: String::new(),
        node_type: NodeType::Folder,
        permissions: 0,
        modified_time: 0,
        toc_index: None,
        defined: true,
        alias_target: None,
        file_size: 0,
        inline: None,
        has_blocks: false,
    });

    for (toc_index, entry) in package.toc_entries.iter().enumerate() {
        let path = core::str::from_utf8(package.path_of(entry)).map_err(|_| reject)?;
        let path = path.trim_end_matches('/');
        if path.is_empty() || path.starts_with('/') {
            return Err(reject);
        }

        // Walk to the parent, synthesizing implicit folders.
        let mut current = 0usize;
        let mut components = path.split('/').peekable();
        let mut leaf_name = String::new();

        while let Some(component) = components.next() {
            if component.is_empty() {
                return Err(reject);
            }
            let is_leaf = components.peek().is_none();
            if is_leaf {
                leaf_name = String::from(component);
                break;
            }

            current = match find_child(&nodes, current, component) {
                Some(child) => {
                    if nodes[child].node_type == NodeType::File {
                        return Err(reject);
                    }
                    child
                }
                None => {
                    let child = nodes.len();
                    nodes.push(Node {
                        parent: Some(current),
                        children: Vec::new(),
                        name: String::from(component),
                        node_type: NodeType::Folder,
                        permissions: 0,
                        modified_time: 0,
                        toc_index: None,
                        defined: false,
                        alias_target: None,
                        file_size: 0,
                        inline: None,
                        has_blocks: false,
                    });
                    nodes[current].children.push(child);
                    child
                }
            };
        }

        let node_type = match entry.node_type {
            EPK_NODE_TYPE_FILE => NodeType::File,
            EPK_NODE_TYPE_FOLDER => NodeType::Folder,
            EPK_NODE_TYPE_FOLDER_ALIAS => NodeType::FolderAlias,
            _ => return Err(reject),
        };

        let alias_target = if entry.alias_target_length != 0 {
            let target =
                core::str::from_utf8(package.alias_target_of(entry)).map_err(|_| reject)?;
            Some(String::from(target))
        } else {
            None
        };

        let inline = if entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_INLINE_DATA != 0 {
            Some((entry.inline_data_offset, entry.inline_data_size))
        } else {
            None
        };

        match find_child(&nodes, current, &leaf_name) {
            Some(existing) => {
                // Only an implicit folder may be re-defined, and only
                // as a folder.
                if nodes[existing].defined || node_type != NodeType::Folder {
                    return Err(reject);
                }
                let node = &mut nodes[existing];
                node.defined = true;
                node.toc_index = Some(toc_index);
                node.permissions = entry.permissions;
                node.modified_time = entry.modified_time;
            }
            None => {
                let child = nodes.len();
                nodes.push(Node {
                    parent: Some(current),
                    children: Vec::new(),
                    name: leaf_name,
                    node_type,
                    permissions: entry.permissions,
                    modified_time: entry.modified_time,
                    toc_index: Some(toc_index),
                    defined: true,
                    alias_target,
                    file_size: entry.file_size,
                    inline,
                    has_blocks: entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_BLOCKS != 0,
                });
                nodes[current].children.push(child);
            }
        }
    }

    Ok(nodes)
}

fn find_child(nodes: &[Node], parent: usize, name: &str) -> Option<usize> {
    nodes[parent]
        .children
        .iter()
        .copied()
        .find(|&child| nodes[child].name == name)
}

struct PackageFileHandle {
    filesystem: Arc<PackageFs>,
    node: usize,
    position: u64,
    enumeration: Option<EnumerationState>,
}

struct EnumerationState {
    pattern: String,
    cursor: usize,
    /// Node the handle currently describes (`None` before the first
    /// `open_next`).
    current: Option<usize>,
}

impl Drop for PackageFileHandle {
    fn drop(&mut self) {
        self.filesystem.open_files.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PackageFileHandle {
    fn described_node(&self) -> usize {
        match &self.enumeration {
            Some(enumeration) => enumeration.current.unwrap_or(self.node),
            None => self.node,
        }
    }
}

impl FileHandle for PackageFileHandle {
    fn name(&self) -> &str {
        &self.filesystem.nodes[self.described_node()].name
    }

    fn size(&self) -> u64 {
        self.filesystem.nodes[self.described_node()].file_size
    }

    fn attributes(&self) -> FileAttributes {
        let node = &self.filesystem.nodes[self.described_node()];
        let mut attributes = FileAttributes::READ_ONLY;
        if node.node_type != NodeType::File {
            attributes |= FileAttributes::DIRECTORY;
        }
        attributes
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

        let node = &self.filesystem.nodes[self.node];
        if node.node_type != NodeType::File {
            return Err(KernelError::InvalidArgument);
        }

        if node.has_blocks {
            // The block table is validated but chunk decompression is
            // not wired in this release.
            return Err(KernelError::NotImplemented);
        }

        let (offset, size) = node.inline.ok_or(KernelError::InvalidState)?;
        let content =
            &self.filesystem.bytes[offset as usize..(offset + size) as usize];

        if self.position >= content.len() as u64 {
            return Ok(0);
        }
        let start = self.position as usize;
        let take = buffer.len().min(content.len() - start);
        buffer[..take].copy_from_slice(&content[start..start + take]);
        self.position += take as u64;
        Ok(take)
    }

    fn write(&mut self, _buffer: &[u8]) -> Result<usize> {
        Err(KernelError::PermissionDenied)
    }

    fn open_next(&mut self) -> Result<bool> {
        let filesystem = self.filesystem.clone();
        let folder = self.node;
        let enumeration = self
            .enumeration
            .as_mut()
            .ok_or(KernelError::InvalidState)?;

        let children = &filesystem.nodes[folder].children;
        while enumeration.cursor < children.len() {
            let child = children[enumeration.cursor];
            enumeration.cursor += 1;

            if glob::match_pattern(&filesystem.nodes[child].name, &enumeration.pattern) {
                enumeration.current = Some(child);
                return Ok(true);
            }
        }

        enumeration.current = None;
        Ok(false)
    }
}

impl crate::fs::FileSystemDriver for PackageFs {
    fn name(&self) -> &str {
        &self.mount_name
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<crate::fs::File> {
        // Read-only enforcement happens before any resolution.
        if flags.mutating() {
            return Err(KernelError::PermissionDenied);
        }

        if glob::has_wildcard(path) {
            let (folder_path, pattern) = match path.rfind('/') {
                Some(position) => (&path[..position], &path[position + 1..]),
                None => ("", path),
            };
            if glob::has_wildcard(folder_path) {
                return Err(KernelError::InvalidArgument);
            }

            let folder = self.resolve(folder_path)?;
            if self.nodes[folder].node_type == NodeType::File {
                return Err(KernelError::InvalidArgument);
            }

            self.open_files.fetch_add(1, Ordering::AcqRel);
            return Ok(Box::new(PackageFileHandle {
                filesystem: self.self_arc(),
                node: folder,
                position: 0,
                enumeration: Some(EnumerationState {
                    pattern: String::from(pattern),
                    cursor: 0,
                    current: None,
                }),
            }));
        }

        let node = self.resolve(path)?;
        self.open_files.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(PackageFileHandle {
            filesystem: self.self_arc(),
            node,
            position: 0,
            enumeration: None,
        }))
    }

    fn create_folder(&self, _path: &str) -> Result<()> {
        Err(KernelError::PermissionDenied)
    }

    fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).is_ok())
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        match self.resolve(path) {
            Ok(node) => Ok(self.nodes[node].node_type == NodeType::File),
            Err(_) => Ok(false),
        }
    }

    fn unmount(&self) -> Result<()> {
        if self.open_files.load(Ordering::Acquire) != 0 {
            return Err(KernelError::Busy);
        }
        Ok(())
    }
}
