// EPK package validation
//
// The validator never trusts a single byte it has not bounds-checked:
// every (offset, size) pair is reduced to 32 bits, section ordering is
// enforced before anything inside a section is read, and each TOC and
// block-table entry is checked against the node-type rules before the
// tree is built. Intermediate state is owned, so every rejection path
// releases everything.

use super::format::*;
use super::signature::{self, SignatureStatus};
use alloc::vec::Vec;

/// Validation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpkParserOptions {
    pub verify_package_hash: bool,
    pub verify_signature: bool,
    pub require_signature: bool,
}

/// Why a package was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpkError {
    /// Structural violation with the format's status code.
    Format(EpkStatus),
    /// Recorded package hash does not match the image.
    HashMismatch,
    /// Signature region missing or cryptographically invalid.
    Signature(SignatureStatus),
}

/// Decoded, bounds-checked TOC entry.
#[derive(Debug, Clone)]
pub struct ParsedTocEntry {
    pub node_type: u32,
    pub entry_flags: u32,
    pub permissions: u32,
    pub modified_time: u64,
    pub file_size: u64,
    pub inline_data_offset: u32,
    pub inline_data_size: u32,
    pub block_index_start: u32,
    pub block_count: u32,
    pub file_hash: [u8; EPK_HASH_SIZE],
    /// Byte range of the path inside the package.
    pub path_offset: u32,
    pub path_length: u32,
    pub alias_target_offset: u32,
    pub alias_target_length: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ParsedBlockEntry {
    pub compressed_offset: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub compression_method: u8,
    pub chunk_hash: [u8; EPK_HASH_SIZE],
}

/// A package that passed validation. Borrows the package bytes; the
/// caller keeps them alive for as long as content is served.
#[derive(Debug)]
pub struct ValidatedPackage<'a> {
    pub bytes: &'a [u8],
    pub header: EpkHeader,
    pub toc_offset: u32,
    pub toc_size: u32,
    pub toc_entries: Vec<ParsedTocEntry>,
    pub block_table_offset: u32,
    pub block_table_size: u32,
    pub block_entries: Vec<ParsedBlockEntry>,
    pub manifest_offset: u32,
    pub manifest_size: u32,
    pub signature_offset: u32,
    pub signature_size: u32,
}

impl<'a> ValidatedPackage<'a> {
    /// Path bytes of a TOC entry.
    pub fn path_of(&self, entry: &ParsedTocEntry) -> &'a [u8] {
        &self.bytes[entry.path_offset as usize..(entry.path_offset + entry.path_length) as usize]
    }

    pub fn alias_target_of(&self, entry: &ParsedTocEntry) -> &'a [u8] {
        let start = entry.alias_target_offset as usize;
        &self.bytes[start..start + entry.alias_target_length as usize]
    }

    /// Inline content of a FILE-with-INLINE entry.
    pub fn inline_data_of(&self, entry: &ParsedTocEntry) -> &'a [u8] {
        let start = entry.inline_data_offset as usize;
        &self.bytes[start..start + entry.inline_data_size as usize]
    }
}

/// Reduce a 64-bit (offset, size) pair to checked 32-bit values inside
/// the package.
fn section_bounds(offset: u64, size: u64, package_size: u32) -> Result<(u32, u32), EpkError> {
    if offset > u32::MAX as u64 || size > u32::MAX as u64 {
        return Err(EpkError::Format(EpkStatus::InvalidBounds));
    }
    let offset = offset as u32;
    let size = size as u32;
    let end = offset
        .checked_add(size)
        .ok_or(EpkError::Format(EpkStatus::InvalidBounds))?;
    if end > package_size {
        return Err(EpkError::Format(EpkStatus::InvalidBounds));
    }
    Ok((offset, size))
}

/// Validate a package image. On success the returned value carries the
/// decoded tables; on failure nothing is retained.
pub fn validate_package_buffer<'a>(
    bytes: &'a [u8],
    options: &EpkParserOptions,
) -> Result<ValidatedPackage<'a>, EpkError> {
    if bytes.len() < EPK_HEADER_SIZE || bytes.len() > u32::MAX as usize {
        return Err(EpkError::Format(EpkStatus::InvalidArgument));
    }
    let package_size = bytes.len() as u32;

    let header: EpkHeader =
        read_record(bytes, 0).ok_or(EpkError::Format(EpkStatus::InvalidArgument))?;

    if header.magic != EPK_MAGIC {
        return Err(EpkError::Format(EpkStatus::InvalidMagic));
    }
    if header.version != EPK_VERSION_1_0 {
        return Err(EpkError::Format(EpkStatus::UnsupportedVersion));
    }
    if header.flags & !EPK_HEADER_FLAG_MASK_KNOWN != 0 {
        return Err(EpkError::Format(EpkStatus::UnsupportedFlags));
    }
    if header.header_size != EPK_HEADER_SIZE as u32 {
        return Err(EpkError::Format(EpkStatus::InvalidHeaderSize));
    }
    // Copies out of the packed header; references into it are not
    // well-formed.
    let reserved = header.reserved;
    if reserved.iter().any(|&byte| byte != 0) {
        return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
    }
    let package_hash = header.package_hash;

    let (toc_offset, toc_size) = section_bounds(header.toc_offset, header.toc_size, package_size)?;
    let (block_table_offset, block_table_size) =
        section_bounds(header.block_table_offset, header.block_table_size, package_size)?;
    let (manifest_offset, manifest_size) =
        section_bounds(header.manifest_offset, header.manifest_size, package_size)?;
    let (signature_offset, signature_size) =
        section_bounds(header.signature_offset, header.signature_size, package_size)?;

    // Section ordering.
    if toc_offset < EPK_HEADER_SIZE as u32
        || block_table_offset < EPK_HEADER_SIZE as u32
        || block_table_offset >= manifest_offset
        || manifest_offset > signature_offset
        || signature_offset > package_size
    {
        return Err(EpkError::Format(EpkStatus::InvalidSectionOrder));
    }

    let has_signature_flag = header.flags & EPK_HEADER_FLAG_HAS_SIGNATURE != 0;
    if has_signature_flag != (signature_size != 0) {
        return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
    }

    let toc_entries = validate_toc(bytes, toc_offset, toc_size)?;
    let block_entries = validate_block_table(bytes, block_table_offset, block_table_size, package_size)?;

    // Cross-checks between the TOC and the block table / inline ranges.
    for entry in &toc_entries {
        if entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_BLOCKS != 0 {
            let end = entry
                .block_index_start
                .checked_add(entry.block_count)
                .ok_or(EpkError::Format(EpkStatus::InvalidBounds))?;
            if end > block_entries.len() as u32 {
                return Err(EpkError::Format(EpkStatus::InvalidBounds));
            }
        }
        if entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_INLINE_DATA != 0 {
            section_bounds(
                entry.inline_data_offset as u64,
                entry.inline_data_size as u64,
                package_size,
            )?;
        }
    }

    // Security checks, when requested.
    if options.require_signature && signature_size == 0 {
        return Err(EpkError::Signature(SignatureStatus::InvalidArgument));
    }

    if options.verify_package_hash
        && !signature::verify_package_hash(
            bytes,
            &package_hash,
            signature_offset as usize,
            signature_size as usize,
        )
    {
        return Err(EpkError::HashMismatch);
    }

    if options.verify_signature && signature_size != 0 {
        let blob =
            &bytes[signature_offset as usize..(signature_offset + signature_size) as usize];
        let status = signature::verify_detached_blob(blob, &package_hash);
        if status != SignatureStatus::Ok {
            return Err(EpkError::Signature(status));
        }
    }

    Ok(ValidatedPackage {
        bytes,
        header,
        toc_offset,
        toc_size,
        toc_entries,
        block_table_offset,
        block_table_size,
        block_entries,
        manifest_offset,
        manifest_size,
        signature_offset,
        signature_size,
    })
}

fn validate_toc(
    bytes: &[u8],
    toc_offset: u32,
    toc_size: u32,
) -> Result<Vec<ParsedTocEntry>, EpkError> {
    if toc_size < EPK_TOC_HEADER_SIZE as u32 {
        return Err(EpkError::Format(EpkStatus::InvalidTableFormat));
    }

    let toc_header: EpkTocHeader = read_record(bytes, toc_offset as usize)
        .ok_or(EpkError::Format(EpkStatus::InvalidTableFormat))?;
    if toc_header.reserved != 0 {
        return Err(EpkError::Format(EpkStatus::InvalidTableFormat));
    }

    let toc_end = toc_offset + toc_size;
    let mut cursor = toc_offset + EPK_TOC_HEADER_SIZE as u32;
    let mut entries = Vec::with_capacity(toc_header.entry_count as usize);

    for _ in 0..toc_header.entry_count {
        if cursor + EPK_TOC_ENTRY_FIXED_SIZE as u32 > toc_end {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }

        let raw: EpkTocEntry = read_record(bytes, cursor as usize)
            .ok_or(EpkError::Format(EpkStatus::InvalidEntryFormat))?;

        let entry_size = raw.entry_size;
        if entry_size < EPK_TOC_ENTRY_FIXED_SIZE as u32 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if cursor + entry_size > toc_end {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }

        // The variable tail must fill the entry exactly.
        let tail = entry_size - EPK_TOC_ENTRY_FIXED_SIZE as u32;
        let path_length = raw.path_length;
        let alias_length = raw.alias_target_length;
        if path_length
            .checked_add(alias_length)
            .map(|total| total != tail)
            .unwrap_or(true)
        {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if path_length == 0 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }

        if raw.entry_flags & !EPK_TOC_ENTRY_FLAG_MASK_KNOWN != 0 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if raw.reserved != 0 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if raw.inline_data_offset > u32::MAX as u64 {
            return Err(EpkError::Format(EpkStatus::InvalidBounds));
        }

        validate_node_type_rules(&raw)?;

        let path_offset = cursor + EPK_TOC_ENTRY_FIXED_SIZE as u32;
        entries.push(ParsedTocEntry {
            node_type: raw.node_type,
            entry_flags: raw.entry_flags,
            permissions: raw.permissions,
            modified_time: raw.modified_time,
            file_size: raw.file_size,
            inline_data_offset: raw.inline_data_offset as u32,
            inline_data_size: raw.inline_data_size,
            block_index_start: raw.block_index_start,
            block_count: raw.block_count,
            file_hash: raw.file_hash,
            path_offset,
            path_length,
            alias_target_offset: path_offset + path_length,
            alias_target_length: alias_length,
        });

        cursor += entry_size;
    }

    Ok(entries)
}

/// Node-type-specific constraint table.
fn validate_node_type_rules(entry: &EpkTocEntry) -> Result<(), EpkError> {
    let reject = EpkError::Format(EpkStatus::InvalidEntryFormat);
    let has_inline = entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_INLINE_DATA != 0;
    let has_blocks = entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_BLOCKS != 0;
    let has_alias = entry.entry_flags & EPK_TOC_ENTRY_FLAG_HAS_ALIAS_TARGET != 0;
    let file_size = entry.file_size;
    let inline_size = entry.inline_data_size;

    match entry.node_type {
        EPK_NODE_TYPE_FOLDER => {
            if has_inline || has_blocks || has_alias {
                return Err(reject);
            }
            if file_size != 0 || entry.block_count != 0 || inline_size != 0 {
                return Err(reject);
            }
            if entry.alias_target_length != 0 {
                return Err(reject);
            }
        }
        EPK_NODE_TYPE_FILE => {
            // Exactly one storage form.
            if has_inline == has_blocks {
                return Err(reject);
            }
            if has_alias || entry.alias_target_length != 0 {
                return Err(reject);
            }
            if has_inline && entry.block_count != 0 {
                return Err(reject);
            }
            if has_blocks && inline_size != 0 {
                return Err(reject);
            }
        }
        EPK_NODE_TYPE_FOLDER_ALIAS => {
            if !has_alias || has_inline || has_blocks {
                return Err(reject);
            }
            if file_size != 0 || entry.block_count != 0 || inline_size != 0 {
                return Err(reject);
            }
            if entry.alias_target_length == 0 {
                return Err(reject);
            }
        }
        _ => return Err(reject),
    }

    Ok(())
}

fn validate_block_table(
    bytes: &[u8],
    table_offset: u32,
    table_size: u32,
    package_size: u32,
) -> Result<Vec<ParsedBlockEntry>, EpkError> {
    if table_size % EPK_BLOCK_ENTRY_SIZE as u32 != 0 {
        return Err(EpkError::Format(EpkStatus::InvalidTableFormat));
    }

    let count = (table_size / EPK_BLOCK_ENTRY_SIZE as u32) as usize;
    let mut entries = Vec::with_capacity(count);

    for index in 0..count {
        let offset = table_offset as usize + index * EPK_BLOCK_ENTRY_SIZE;
        let raw: EpkBlockEntry = read_record(bytes, offset)
            .ok_or(EpkError::Format(EpkStatus::InvalidTableFormat))?;

        if raw.reserved0 != 0 || raw.reserved1 != 0 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if raw.compression_method != EPK_COMPRESSION_METHOD_NONE
            && raw.compression_method != EPK_COMPRESSION_METHOD_ZLIB
        {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        if raw.compressed_size == 0 || raw.uncompressed_size == 0 {
            return Err(EpkError::Format(EpkStatus::InvalidEntryFormat));
        }
        let end = raw
            .compressed_offset
            .checked_add(raw.compressed_size)
            .ok_or(EpkError::Format(EpkStatus::InvalidBounds))?;
        if end > package_size {
            return Err(EpkError::Format(EpkStatus::InvalidBounds));
        }

        entries.push(ParsedBlockEntry {
            compressed_offset: raw.compressed_offset,
            compressed_size: raw.compressed_size,
            uncompressed_size: raw.uncompressed_size,
            compression_method: raw.compression_method,
            chunk_hash: raw.chunk_hash,
        });
    }

    Ok(entries)
}
