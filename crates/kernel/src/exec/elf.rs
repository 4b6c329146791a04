// ELF slot
//
// The format is recognized by its signature so callers get a precise
// answer, but loading is not implemented in this release.

use super::{ExecutableInfo, LoadPlacement};
use crate::fs::File;
use crate::klib::{KernelError, Result};

/// 0x7F 'E' 'L' 'F' read as a little-endian word.
pub const ELF_SIGNATURE: u32 = 0x464C_457F;

pub fn get_executable_info(_file: &mut File) -> Result<ExecutableInfo> {
    Err(KernelError::NotImplemented)
}

pub fn load_executable(
    _file: &mut File,
    _info: &ExecutableInfo,
    _placement: LoadPlacement,
    _code: &mut [u8],
    _data: &mut [u8],
) -> Result<()> {
    Err(KernelError::NotImplemented)
}
