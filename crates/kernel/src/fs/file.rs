// File handles

use crate::klib::Result;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Position at end-of-file before the first write.
        const APPEND = 1 << 2;
        /// Create the file when absent.
        const CREATE = 1 << 3;
        /// Drop existing content on open.
        const TRUNCATE = 1 << 4;
    }
}

impl OpenFlags {
    /// True when the open intends any mutation.
    pub fn mutating(self) -> bool {
        self.intersects(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const DIRECTORY = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SYSTEM = 1 << 2;
        const HIDDEN = 1 << 3;
    }
}

/// An opened file or directory enumeration.
///
/// Wildcard opens yield a handle in enumeration mode: `name`, `size` and
/// `attributes` describe the current entry, and `open_next` advances to
/// the following match until it reports `false`.
pub trait FileHandle: Send {
    /// Name of the file (or of the current enumeration entry).
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    fn attributes(&self) -> FileAttributes;

    fn position(&self) -> u64;

    fn seek(&mut self, position: u64) -> Result<()>;

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buffer: &[u8]) -> Result<usize>;

    /// Advance an enumeration handle to its next matching entry.
    /// `Ok(false)` once exhausted; an error on plain file handles.
    fn open_next(&mut self) -> Result<bool>;
}
