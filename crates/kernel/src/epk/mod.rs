//! EPK packages
//!
//! Validated, content-addressed, read-only archives: a 128-byte header,
//! a table of contents, a chunk block table, a manifest and an optional
//! detached Ed25519 signature over the zeroed-hash package image. A
//! validated package mounts as a read-only PackageFS.

pub mod format;
pub mod parser;
pub mod signature;
pub mod packagefs;

pub use self::format::EpkStatus;
pub use self::packagefs::PackageFs;
pub use self::parser::{validate_package_buffer, EpkError, EpkParserOptions, ValidatedPackage};

#[cfg(test)]
pub mod testpkg {
    // Host-side package builder mirroring the packer's layout:
    // header | TOC | manifest | inline data | signature.

    use super::format::*;
    use super::signature::{build_signature_blob, compute_package_hash};
    use alloc::vec::Vec;

    pub enum NodeSpec {
        File {
            path: &'static str,
            content: &'static [u8],
        },
        FileWithBlocks {
            path: &'static str,
            block_index_start: u32,
            block_count: u32,
            file_size: u64,
        },
        Folder {
            path: &'static str,
        },
        Alias {
            path: &'static str,
            target: &'static str,
        },
    }

    pub struct BlockSpec {
        pub content: &'static [u8],
        pub method: u8,
    }

    fn push_record<T: Copy>(out: &mut Vec<u8>, value: &T) {
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        out.extend_from_slice(bytes);
    }

    /// Assemble a package. Inline contents and block chunks land after
    /// the manifest; the hash is computed last (and signed when
    /// `signed` is set).
    pub fn build_package(nodes: &[NodeSpec], blocks: &[BlockSpec], signed: bool) -> Vec<u8> {
        // Lay out the tail sections first to learn their offsets.
        let mut toc_body: Vec<u8> = Vec::new();
        let toc_header = EpkTocHeader {
            entry_count: nodes.len() as u32,
            reserved: 0,
        };
        push_record(&mut toc_body, &toc_header);

        // TOC entries reference inline/chunk offsets, which depend on
        // the TOC size; compute sizes in a dry pass.
        let mut toc_size = EPK_TOC_HEADER_SIZE;
        for node in nodes {
            let (path, alias): (&str, &str) = match node {
                NodeSpec::File { path, .. } => (path, ""),
                NodeSpec::FileWithBlocks { path, .. } => (path, ""),
                NodeSpec::Folder { path } => (path, ""),
                NodeSpec::Alias { path, target } => (path, target),
            };
            toc_size += EPK_TOC_ENTRY_FIXED_SIZE + path.len() + alias.len();
        }

        let toc_offset = EPK_HEADER_SIZE;
        let block_table_offset = toc_offset; // empty table co-locates with the TOC
        let block_table_size = blocks.len() * EPK_BLOCK_ENTRY_SIZE;
        let manifest: &[u8] = b"{}";
        let manifest_offset;
        let block_table_start;
        if blocks.is_empty() {
            block_table_start = block_table_offset;
            manifest_offset = toc_offset + toc_size;
        } else {
            block_table_start = toc_offset + toc_size;
            manifest_offset = block_table_start + block_table_size;
        }
        let data_offset = manifest_offset + manifest.len();

        // Chunk payloads follow the inline payloads.
        let mut inline_cursor = data_offset;
        let mut inline_ranges: Vec<(usize, usize)> = Vec::new();
        for node in nodes {
            if let NodeSpec::File { content, .. } = node {
                inline_ranges.push((inline_cursor, content.len()));
                inline_cursor += content.len();
            } else {
                inline_ranges.push((0, 0));
            }
        }
        let mut chunk_cursor = inline_cursor;
        let mut chunk_ranges: Vec<(usize, usize)> = Vec::new();
        for block in blocks {
            chunk_ranges.push((chunk_cursor, block.content.len()));
            chunk_cursor += block.content.len();
        }
        let signature_offset = chunk_cursor;

        // Emit the TOC entries.
        for (index, node) in nodes.iter().enumerate() {
            let (path, alias, node_type, flags, file_size, inline, block_start, block_count) =
                match node {
                    NodeSpec::File { path, content } => (
                        *path,
                        "",
                        EPK_NODE_TYPE_FILE,
                        EPK_TOC_ENTRY_FLAG_HAS_INLINE_DATA,
                        content.len() as u64,
                        inline_ranges[index],
                        0u32,
                        0u32,
                    ),
                    NodeSpec::FileWithBlocks {
                        path,
                        block_index_start,
                        block_count,
                        file_size,
                    } => (
                        *path,
                        "",
                        EPK_NODE_TYPE_FILE,
                        EPK_TOC_ENTRY_FLAG_HAS_BLOCKS,
                        *file_size,
                        (0, 0),
                        *block_index_start,
                        *block_count,
                    ),
                    NodeSpec::Folder { path } => {
                        (*path, "", EPK_NODE_TYPE_FOLDER, 0, 0, (0, 0), 0, 0)
                    }
                    NodeSpec::Alias { path, target } => (
                        *path,
                        *target,
                        EPK_NODE_TYPE_FOLDER_ALIAS,
                        EPK_TOC_ENTRY_FLAG_HAS_ALIAS_TARGET,
                        0,
                        (0, 0),
                        0,
                        0,
                    ),
                };

            let entry = EpkTocEntry {
                entry_size: (EPK_TOC_ENTRY_FIXED_SIZE + path.len() + alias.len()) as u32,
                node_type,
                entry_flags: flags,
                path_length: path.len() as u32,
                alias_target_length: alias.len() as u32,
                permissions: 0o644,
                modified_time: 0,
                file_size,
                inline_data_offset: inline.0 as u64,
                inline_data_size: inline.1 as u32,
                block_index_start: block_start,
                block_count,
                file_hash: [0; EPK_HASH_SIZE],
                reserved: 0,
            };
            push_record(&mut toc_body, &entry);
            toc_body.extend_from_slice(path.as_bytes());
            toc_body.extend_from_slice(alias.as_bytes());
        }
        debug_assert_eq!(toc_body.len(), toc_size);

        // The signature blob length is fixed by the test key layout.
        let signature_size = if signed { 48 + 32 + 64 } else { 0 };

        let mut flags = 0;
        if signed {
            flags |= EPK_HEADER_FLAG_HAS_SIGNATURE;
        }

        let header = EpkHeader {
            magic: EPK_MAGIC,
            version: EPK_VERSION_1_0,
            flags,
            header_size: EPK_HEADER_SIZE as u32,
            toc_offset: toc_offset as u64,
            toc_size: toc_size as u64,
            block_table_offset: if blocks.is_empty() {
                block_table_offset as u64
            } else {
                block_table_start as u64
            },
            block_table_size: block_table_size as u64,
            manifest_offset: manifest_offset as u64,
            manifest_size: manifest.len() as u64,
            signature_offset: signature_offset as u64,
            signature_size: signature_size as u64,
            package_hash: [0; EPK_HASH_SIZE],
            reserved: [0; 16],
        };

        let mut package: Vec<u8> = Vec::new();
        push_record(&mut package, &header);
        package.extend_from_slice(&toc_body);
        if !blocks.is_empty() {
            for (index, block) in blocks.iter().enumerate() {
                let entry = EpkBlockEntry {
                    compressed_offset: chunk_ranges[index].0 as u32,
                    compressed_size: chunk_ranges[index].1 as u32,
                    uncompressed_size: block.content.len() as u32,
                    compression_method: block.method,
                    reserved0: 0,
                    reserved1: 0,
                    chunk_hash: [0; EPK_HASH_SIZE],
                };
                push_record(&mut package, &entry);
            }
        }
        package.extend_from_slice(manifest);
        for node in nodes {
            if let NodeSpec::File { content, .. } = node {
                package.extend_from_slice(content);
            }
        }
        for block in blocks {
            package.extend_from_slice(block.content);
        }
        debug_assert_eq!(package.len(), signature_offset);

        // Hash over the signature-excised, hash-zeroed image.
        let hash = compute_package_hash(&package, signature_offset, signature_size);
        package[EPK_PACKAGE_HASH_OFFSET..EPK_PACKAGE_HASH_OFFSET + EPK_HASH_SIZE]
            .copy_from_slice(&hash);

        if signed {
            let blob = build_signature_blob(&hash);
            debug_assert_eq!(blob.len(), signature_size);
            package.extend_from_slice(&blob);
        }

        package
    }

    /// Recompute and install the package hash after a test mutated the
    /// image.
    pub fn rehash(package: &mut [u8]) {
        let header: EpkHeader = read_record(package, 0).unwrap();
        let hash = compute_package_hash(
            package,
            header.signature_offset as usize,
            header.signature_size as usize,
        );
        package[EPK_PACKAGE_HASH_OFFSET..EPK_PACKAGE_HASH_OFFSET + EPK_HASH_SIZE]
            .copy_from_slice(&hash);
    }

    /// "hello world" single-file package of the positive scenario.
    pub fn hello_package() -> Vec<u8> {
        build_package(
            &[NodeSpec::File {
                path: "readme.txt",
                content: b"hello world",
            }],
            &[],
            false,
        )
    }

    pub fn options_hash() -> super::EpkParserOptions {
        super::EpkParserOptions {
            verify_package_hash: true,
            verify_signature: false,
            require_signature: false,
        }
    }

    pub fn options_full() -> super::EpkParserOptions {
        super::EpkParserOptions {
            verify_package_hash: true,
            verify_signature: true,
            require_signature: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::format::*;
    use super::parser::*;
    use super::signature::SignatureStatus;
    use super::testpkg::*;
    use super::*;

    #[test]
    fn valid_inline_package_passes_with_hash_check() {
        let package = hello_package();
        let validated = validate_package_buffer(&package, &options_hash()).unwrap();

        assert_eq!(validated.toc_entries.len(), 1);
        assert_eq!(validated.block_table_size, 0);
        let entry = &validated.toc_entries[0];
        assert_eq!(validated.path_of(entry), b"readme.txt");
        assert_eq!(validated.inline_data_of(entry), b"hello world");
        assert_eq!(entry.file_size, 11);
    }

    #[test]
    fn reserved_header_byte_rejects() {
        let mut package = hello_package();
        // reserved[0] sits right after the package hash.
        package[EPK_PACKAGE_HASH_OFFSET + EPK_HASH_SIZE] = 1;
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidEntryFormat)
        );
    }

    #[test]
    fn section_disorder_rejects() {
        let mut package = hello_package();
        // Pull the signature offset below the manifest offset.
        let header: EpkHeader = read_record(&package, 0).unwrap();
        let bad = header.manifest_offset - 1;
        package[64..72].copy_from_slice(&bad.to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidSectionOrder)
        );
    }

    #[test]
    fn zero_path_length_rejects() {
        let mut package = hello_package();
        // path_length is the fourth word of the first TOC entry.
        let offset = EPK_HEADER_SIZE + EPK_TOC_HEADER_SIZE + 12;
        package[offset..offset + 4].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidEntryFormat)
        );
    }

    #[test]
    fn magic_version_flags_and_header_size_reject() {
        let mut package = hello_package();
        package[0] ^= 0xFF;
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidMagic)
        );

        let mut package = hello_package();
        package[4..8].copy_from_slice(&((2u32 << 16) | 0).to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::UnsupportedVersion)
        );

        let mut package = hello_package();
        package[8..12].copy_from_slice(&0x80u32.to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::UnsupportedFlags)
        );

        let mut package = hello_package();
        package[12..16].copy_from_slice(&132u32.to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidHeaderSize)
        );
    }

    #[test]
    fn one_byte_overrun_rejects() {
        let mut package = hello_package();
        // The last section now extends exactly one byte past the end.
        package.pop();
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidBounds)
        );
    }

    #[test]
    fn content_tampering_fails_the_hash() {
        let mut package = hello_package();
        let position = package.len() - 1; // last content byte
        package[position] ^= 0xFF;
        assert_eq!(
            validate_package_buffer(&package, &options_hash()).unwrap_err(),
            EpkError::HashMismatch
        );
        // Without the hash option the structure still validates.
        assert!(validate_package_buffer(&package, &EpkParserOptions::default()).is_ok());
    }

    #[test]
    fn signed_package_verifies_and_detects_tampering() {
        let package = build_package(
            &[NodeSpec::File {
                path: "readme.txt",
                content: b"hello world",
            }],
            &[],
            true,
        );
        assert!(validate_package_buffer(&package, &options_full()).is_ok());

        // Flip one signature byte: structure and hash still hold, the
        // signature does not.
        let mut tampered = package.clone();
        let position = tampered.len() - 1;
        tampered[position] ^= 0xFF;
        assert_eq!(
            validate_package_buffer(&tampered, &options_full()).unwrap_err(),
            EpkError::Signature(SignatureStatus::InvalidSignature)
        );
    }

    #[test]
    fn unsigned_package_fails_require_signature() {
        let package = hello_package();
        assert_eq!(
            validate_package_buffer(&package, &options_full()).unwrap_err(),
            EpkError::Signature(SignatureStatus::InvalidArgument)
        );
    }

    #[test]
    fn signature_flag_must_match_signature_size() {
        let mut package = hello_package();
        // Claim a signature without carrying one.
        package[8..12].copy_from_slice(&EPK_HEADER_FLAG_HAS_SIGNATURE.to_le_bytes());
        assert_eq!(
            validate_package_buffer(&package, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidEntryFormat)
        );
    }

    #[test]
    fn block_table_rules() {
        let package = build_package(
            &[NodeSpec::FileWithBlocks {
                path: "big.bin",
                block_index_start: 0,
                block_count: 1,
                file_size: 4,
            }],
            &[BlockSpec {
                content: b"data",
                method: EPK_COMPRESSION_METHOD_NONE,
            }],
            false,
        );
        let validated = validate_package_buffer(&package, &options_hash()).unwrap();
        assert_eq!(validated.block_entries.len(), 1);
        assert_eq!(validated.block_entries[0].uncompressed_size, 4);

        // Unknown compression method.
        let mut bad_method = build_package(
            &[NodeSpec::FileWithBlocks {
                path: "big.bin",
                block_index_start: 0,
                block_count: 1,
                file_size: 4,
            }],
            &[BlockSpec {
                content: b"data",
                method: 5,
            }],
            false,
        );
        rehash(&mut bad_method);
        assert_eq!(
            validate_package_buffer(&bad_method, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidEntryFormat)
        );

        // Block range past the table.
        let overrun = build_package(
            &[NodeSpec::FileWithBlocks {
                path: "big.bin",
                block_index_start: 0,
                block_count: 2,
                file_size: 4,
            }],
            &[BlockSpec {
                content: b"data",
                method: EPK_COMPRESSION_METHOD_NONE,
            }],
            false,
        );
        assert_eq!(
            validate_package_buffer(&overrun, &EpkParserOptions::default()).unwrap_err(),
            EpkError::Format(EpkStatus::InvalidBounds)
        );
    }

    #[test]
    fn packagefs_serves_inline_content_with_implicit_folders() {
        let _guard = crate::test_utils::serialize();
        let package = build_package(
            &[
                NodeSpec::File {
                    path: "docs/guide/readme.txt",
                    content: b"hello world",
                },
                NodeSpec::Folder { path: "docs" },
                NodeSpec::Alias {
                    path: "link",
                    target: "docs/guide",
                },
            ],
            &[],
            false,
        );

        let fs = PackageFs::new(package, &options_hash(), "pkg").unwrap();
        use crate::fs::{FileSystemDriver, OpenFlags};

        // "docs" was listed, "docs/guide" is synthesized.
        assert!(fs.path_exists("docs").unwrap());
        assert!(fs.path_exists("docs/guide").unwrap());
        assert!(fs.file_exists("docs/guide/readme.txt").unwrap());

        let mut file = fs
            .open("docs/guide/readme.txt", OpenFlags::READ)
            .unwrap();
        let mut buffer = [0u8; 32];
        let got = file.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..got], b"hello world");

        // The alias resolves into the same folder.
        assert!(fs.file_exists("link/readme.txt").unwrap());

        // Read-only enforcement.
        assert!(matches!(
            fs.open("docs/guide/readme.txt", OpenFlags::WRITE),
            Err(crate::klib::KernelError::PermissionDenied)
        ));
        assert!(matches!(
            fs.create_folder("new"),
            Err(crate::klib::KernelError::PermissionDenied)
        ));

        // Unmount refused while the file handle lives.
        assert!(matches!(
            fs.unmount(),
            Err(crate::klib::KernelError::Busy)
        ));
        drop(file);
        fs.unmount().unwrap();
    }

    #[test]
    fn packagefs_enumerates_with_wildcards() {
        let _guard = crate::test_utils::serialize();
        let package = build_package(
            &[
                NodeSpec::File {
                    path: "bin/a.prg",
                    content: b"a",
                },
                NodeSpec::File {
                    path: "bin/b.prg",
                    content: b"b",
                },
                NodeSpec::File {
                    path: "bin/notes.txt",
                    content: b"n",
                },
            ],
            &[],
            false,
        );

        let fs = PackageFs::new(package, &options_hash(), "pkg").unwrap();
        use crate::fs::{FileSystemDriver, OpenFlags};

        let mut handle = fs.open("bin/*.prg", OpenFlags::READ).unwrap();
        let mut names = alloc::vec::Vec::new();
        while handle.open_next().unwrap() {
            names.push(alloc::string::String::from(handle.name()));
        }
        names.sort();
        assert_eq!(names, alloc::vec!["a.prg", "b.prg"]);
    }

    #[test]
    fn chunked_files_validate_but_do_not_inflate_yet() {
        let _guard = crate::test_utils::serialize();
        let package = build_package(
            &[NodeSpec::FileWithBlocks {
                path: "big.bin",
                block_index_start: 0,
                block_count: 1,
                file_size: 4,
            }],
            &[BlockSpec {
                content: b"data",
                method: EPK_COMPRESSION_METHOD_ZLIB,
            }],
            false,
        );

        let fs = PackageFs::new(package, &options_hash(), "pkg").unwrap();
        use crate::fs::{FileSystemDriver, OpenFlags};

        let mut file = fs.open("big.bin", OpenFlags::READ).unwrap();
        let mut buffer = [0u8; 8];
        assert!(matches!(
            file.read(&mut buffer),
            Err(crate::klib::KernelError::NotImplemented)
        ));
    }
}
