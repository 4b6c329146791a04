// EXOS object format
//
// A fixed header followed by chunks of {4-byte tag, u32 size, payload}.
// INIT carries the execution parameters; CODE and DATA appear at most
// once; FXUP holds the relocation table and terminates parsing. Every
// other recognized tag is skipped by its declared size.

use super::{read_exact, ExecutableInfo, LoadPlacement};
use crate::fs::File;
use crate::klib::{KernelError, Result};

/// "EXOS" read as a little-endian word.
pub const EXOS_SIGNATURE: u32 = u32::from_le_bytes(*b"EXOS");

pub const EXOS_TYPE_EXECUTABLE: u32 = 0x0000_0001;
pub const EXOS_TYPE_LIBRARY: u32 = 0x0000_0002;

const CHUNK_INIT: [u8; 4] = *b"INIT";
const CHUNK_CODE: [u8; 4] = *b"CODE";
const CHUNK_DATA: [u8; 4] = *b"DATA";
const CHUNK_FIXUP: [u8; 4] = *b"FXUP";

/// Tags carried by the format that the loader skips.
const IGNORABLE_CHUNKS: [[u8; 4]; 15] = [
    *b"NOTE", *b"TIME", *b"SECU", *b"VERS", *b"MENU", *b"DLOG", *b"ICON", *b"BTMP", *b"WAVE",
    *b"DBUG", *b"USER", *b"EXPT", *b"IMPT", *b"RSRC", *b"STAK",
];

pub const EXOS_FIXUP_SOURCE_CODE: u32 = 0x0000_0001;
pub const EXOS_FIXUP_SOURCE_DATA: u32 = 0x0000_0002;
pub const EXOS_FIXUP_DEST_CODE: u32 = 0x0000_0010;
pub const EXOS_FIXUP_DEST_DATA: u32 = 0x0000_0020;

/// File header: signature, type, version, byte order, machine, and four
/// reserved words.
const HEADER_WORDS: usize = 10;
const HEADER_SIZE: usize = HEADER_WORDS * 4;

/// INIT payload: entry point, code/data bases and sizes, stack and heap
/// demands, five reserved words.
const INIT_WORDS: usize = 14;
const INIT_SIZE: usize = INIT_WORDS * 4;

fn read_u32(file: &mut File) -> Result<u32> {
    let mut bytes = [0u8; 4];
    read_exact(file, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_header(file: &mut File) -> Result<[u32; HEADER_WORDS]> {
    file.seek(0)?;
    let mut bytes = [0u8; HEADER_SIZE];
    read_exact(file, &mut bytes)?;

    let mut words = [0u32; HEADER_WORDS];
    for (index, word) in words.iter_mut().enumerate() {
        *word = u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap());
    }
    if words[0] != EXOS_SIGNATURE {
        crate::debug!("exos: bad signature {:#010x}", words[0]);
        return Err(KernelError::InvalidArgument);
    }
    Ok(words)
}

fn read_chunk_head(file: &mut File) -> Result<Option<([u8; 4], u32)>> {
    let mut tag = [0u8; 4];
    let mut done = 0usize;
    while done < 4 {
        let got = file.read(&mut tag[done..])?;
        if got == 0 {
            // Clean end of file between chunks.
            return if done == 0 {
                Ok(None)
            } else {
                Err(KernelError::Io)
            };
        }
        done += got;
    }
    let size = read_u32(file)?;
    Ok(Some((tag, size)))
}

fn skip_chunk(file: &mut File, size: u32) -> Result<()> {
    let position = file.position();
    file.seek(position + size as u64)
}

/// Info pass: find INIT and decode the execution parameters.
pub fn get_executable_info(file: &mut File) -> Result<ExecutableInfo> {
    read_header(file)?;

    while let Some((tag, size)) = read_chunk_head(file)? {
        if tag == CHUNK_INIT {
            if (size as usize) < INIT_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            let mut bytes = [0u8; INIT_SIZE];
            read_exact(file, &mut bytes)?;

            let word = |index: usize| {
                u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
            };

            return Ok(ExecutableInfo {
                entry_point: word(0),
                code_base: word(1),
                code_size: word(2),
                data_base: word(3),
                data_size: word(4),
                stack_minimum: word(5),
                stack_requested: word(6),
                heap_minimum: word(7),
                heap_requested: word(8),
            });
        }
        skip_chunk(file, size)?;
    }

    // No INIT chunk: the image cannot be executed.
    Err(KernelError::InvalidArgument)
}

/// Load pass: place CODE and DATA into their buffers and apply the
/// relocation table. FXUP terminates parsing; chunks after it are
/// ignored.
pub fn load_executable(
    file: &mut File,
    info: &ExecutableInfo,
    placement: LoadPlacement,
    code: &mut [u8],
    data: &mut [u8],
) -> Result<()> {
    read_header(file)?;

    let code_delta = placement.code_base.wrapping_sub(info.code_base);
    let data_delta = placement.data_base.wrapping_sub(info.data_base);

    let mut code_read = false;
    let mut data_read = false;

    while let Some((tag, size)) = read_chunk_head(file)? {
        if tag == CHUNK_CODE {
            if code_read {
                return Err(KernelError::InvalidArgument);
            }
            if size as usize > code.len() {
                return Err(KernelError::InvalidArgument);
            }
            read_exact(file, &mut code[..size as usize])?;
            code_read = true;
        } else if tag == CHUNK_DATA {
            if data_read {
                return Err(KernelError::InvalidArgument);
            }
            if size as usize > data.len() {
                return Err(KernelError::InvalidArgument);
            }
            read_exact(file, &mut data[..size as usize])?;
            data_read = true;
        } else if tag == CHUNK_FIXUP {
            let count = read_u32(file)?;
            for _ in 0..count {
                let section = read_u32(file)?;
                let address = read_u32(file)?;
                apply_fixup(
                    section, address, info, code_delta, data_delta, code, data,
                )?;
            }
            // The relocation table ends the parse.
            if !code_read {
                return Err(KernelError::InvalidArgument);
            }
            return Ok(());
        } else if IGNORABLE_CHUNKS.contains(&tag) || tag == CHUNK_INIT {
            skip_chunk(file, size)?;
        } else {
            crate::debug!(
                "exos: unknown chunk {:02x}{:02x}{:02x}{:02x}",
                tag[0],
                tag[1],
                tag[2],
                tag[3]
            );
            skip_chunk(file, size)?;
        }
    }

    if !code_read {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// Patch one 32-bit word: the source flag names the section holding the
/// word (addressed in original-image terms), the dest flag selects
/// which relocation delta is added to it.
fn apply_fixup(
    section: u32,
    address: u32,
    info: &ExecutableInfo,
    code_delta: u32,
    data_delta: u32,
    code: &mut [u8],
    data: &mut [u8],
) -> Result<()> {
    let (buffer, offset) = if section & EXOS_FIXUP_SOURCE_CODE != 0 {
        (&mut *code, address.wrapping_sub(info.code_base))
    } else if section & EXOS_FIXUP_SOURCE_DATA != 0 {
        (&mut *data, address.wrapping_sub(info.data_base))
    } else {
        // Unrecognized source section: ignored, as in the original.
        return Ok(());
    };

    let offset = offset as usize;
    if offset + 4 > buffer.len() {
        return Err(KernelError::InvalidArgument);
    }

    let delta = if section & EXOS_FIXUP_DEST_CODE != 0 {
        code_delta
    } else if section & EXOS_FIXUP_DEST_DATA != 0 {
        data_delta
    } else {
        return Ok(());
    };

    let current = u32::from_le_bytes(buffer[offset..offset + 4].try_into().unwrap());
    buffer[offset..offset + 4].copy_from_slice(&current.wrapping_add(delta).to_le_bytes());
    Ok(())
}
