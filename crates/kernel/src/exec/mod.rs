//! Executable loading
//!
//! The loader speaks the chunked EXOS object format and keeps an ELF
//! slot that is recognized but not implemented. Format selection is by
//! the leading 4-byte signature. Loading is two-pass: an info pass that
//! reads the INIT chunk only, and a load pass that places code and data
//! and applies the relocation table.

pub mod exos;
pub mod elf;

use crate::fs::File;
use crate::klib::{KernelError, Result};

/// Layout demands and entry point recovered from an executable's
/// headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutableInfo {
    pub entry_point: u32,
    pub code_base: u32,
    pub code_size: u32,
    pub data_base: u32,
    pub data_size: u32,
    pub stack_minimum: u32,
    pub stack_requested: u32,
    pub heap_minimum: u32,
    pub heap_requested: u32,
}

/// Where the image actually lands in the new address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadPlacement {
    pub code_base: u32,
    pub data_base: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutableFormat {
    Exos,
    Elf,
}

/// Select the format by the 4-byte signature.
pub fn detect_format(signature: u32) -> Result<ExecutableFormat> {
    if signature == exos::EXOS_SIGNATURE {
        Ok(ExecutableFormat::Exos)
    } else if signature == elf::ELF_SIGNATURE {
        Ok(ExecutableFormat::Elf)
    } else {
        Err(KernelError::InvalidArgument)
    }
}

/// Read the executable's layout demands (INIT chunk or ELF headers).
pub fn get_executable_info(file: &mut File) -> Result<ExecutableInfo> {
    let signature = peek_signature(file)?;
    match detect_format(signature)? {
        ExecutableFormat::Exos => exos::get_executable_info(file),
        ExecutableFormat::Elf => elf::get_executable_info(file),
    }
}

/// Place code and data and apply relocations.
pub fn load_executable(
    file: &mut File,
    info: &ExecutableInfo,
    placement: LoadPlacement,
    code: &mut [u8],
    data: &mut [u8],
) -> Result<()> {
    let signature = peek_signature(file)?;
    match detect_format(signature)? {
        ExecutableFormat::Exos => exos::load_executable(file, info, placement, code, data),
        ExecutableFormat::Elf => elf::load_executable(file, info, placement, code, data),
    }
}

fn peek_signature(file: &mut File) -> Result<u32> {
    file.seek(0)?;
    let mut bytes = [0u8; 4];
    read_exact(file, &mut bytes)?;
    file.seek(0)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Fill the buffer completely or fail.
pub(crate) fn read_exact(file: &mut File, buffer: &mut [u8]) -> Result<()> {
    let mut done = 0usize;
    while done < buffer.len() {
        let got = file.read(&mut buffer[done..])?;
        if got == 0 {
            return Err(KernelError::Io);
        }
        done += got;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testfile {
    // In-memory file handle for loader tests.

    use crate::fs::{FileAttributes, FileHandle};
    use crate::klib::Result;
    use alloc::string::String;
    use alloc::vec::Vec;

    pub struct MemFile {
        name: String,
        bytes: Vec<u8>,
        position: u64,
    }

    impl MemFile {
        pub fn new(bytes: Vec<u8>) -> crate::fs::File {
            alloc::boxed::Box::new(Self {
                name: String::from("mem"),
                bytes,
                position: 0,
            })
        }
    }

    impl FileHandle for MemFile {
        fn name(&self) -> &str {
            &self.name
        }

        fn size(&self) -> u64 {
            self.bytes.len() as u64
        }

        fn attributes(&self) -> FileAttributes {
            FileAttributes::empty()
        }

        fn position(&self) -> u64 {
            self.position
        }

        fn seek(&mut self, position: u64) -> Result<()> {
            self.position = position;
            Ok(())
        }

        fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
            if self.position >= self.bytes.len() as u64 {
                return Ok(0);
            }
            let start = self.position as usize;
            let take = buffer.len().min(self.bytes.len() - start);
            buffer[..take].copy_from_slice(&self.bytes[start..start + take]);
            self.position += take as u64;
            Ok(take)
        }

        fn write(&mut self, _buffer: &[u8]) -> Result<usize> {
            Err(crate::klib::KernelError::PermissionDenied)
        }

        fn open_next(&mut self) -> Result<bool> {
            Err(crate::klib::KernelError::InvalidState)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection() {
        assert_eq!(
            detect_format(exos::EXOS_SIGNATURE).unwrap(),
            ExecutableFormat::Exos
        );
        assert_eq!(detect_format(elf::ELF_SIGNATURE).unwrap(), ExecutableFormat::Elf);
        assert!(detect_format(0x1234_5678).is_err());
    }

    #[test]
    fn elf_slot_reports_not_implemented() {
        let mut file = testfile::MemFile::new(alloc::vec![0x7F, b'E', b'L', b'F', 0, 0, 0, 0]);
        assert_eq!(
            get_executable_info(&mut file),
            Err(KernelError::NotImplemented)
        );
    }
}
