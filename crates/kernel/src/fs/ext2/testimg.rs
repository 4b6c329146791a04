// Hermetic EXT2 fixture
//
// Formats a small single-group volume on a RAM disk: 1 KiB blocks,
// 1000 blocks, 64 inodes, root directory in place. The layout is the
// classic one for 1 KiB blocks: boot block, superblock, descriptor
// table, block bitmap, inode bitmap, inode table, then data.

use super::disk::*;
use super::Ext2Volume;
use crate::drivers::block::{RamDisk, SECTOR_SIZE};
use alloc::sync::Arc;
use alloc::vec;

const BLOCK_SIZE: usize = 1024;
const TOTAL_BLOCKS: u32 = 1000;
const TOTAL_INODES: u32 = 64;
const FIRST_DATA_BLOCK: u32 = 1;

const SUPERBLOCK_BLOCK: u32 = 1;
const DESCRIPTOR_BLOCK: u32 = 2;
const BLOCK_BITMAP_BLOCK: u32 = 3;
const INODE_BITMAP_BLOCK: u32 = 4;
const INODE_TABLE_BLOCK: u32 = 5;
const INODE_TABLE_BLOCKS: u32 = (TOTAL_INODES * 128) / BLOCK_SIZE as u32; // 8
const ROOT_DIR_BLOCK: u32 = INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS; // 13

/// Usable blocks and how many the metadata consumes.
const USABLE_BLOCKS: u32 = TOTAL_BLOCKS - FIRST_DATA_BLOCK; // 999
const METADATA_BLOCKS: u32 = ROOT_DIR_BLOCK; // blocks 1..=13
pub const FRESH_FREE_BLOCKS: u32 = USABLE_BLOCKS - METADATA_BLOCKS; // 986
pub const FRESH_FREE_INODES: u32 = TOTAL_INODES - 10; // 1..10 reserved

fn put<T: Copy>(image: &mut [u8], block: u32, offset: usize, value: &T) {
    let base = block as usize * BLOCK_SIZE + offset;
    unsafe {
        core::ptr::write_unaligned(image.as_mut_ptr().add(base) as *mut T, *value);
    }
}

/// Build the raw image bytes.
pub fn build_image() -> alloc::vec::Vec<u8> {
    let mut image = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE];

    let superblock = Superblock {
        inodes_count: TOTAL_INODES,
        blocks_count: TOTAL_BLOCKS,
        reserved_blocks_count: 0,
        free_blocks_count: FRESH_FREE_BLOCKS,
        free_inodes_count: FRESH_FREE_INODES,
        first_data_block: FIRST_DATA_BLOCK,
        log_block_size: 0,
        log_frag_size: 0,
        blocks_per_group: 8192,
        frags_per_group: 8192,
        inodes_per_group: TOTAL_INODES,
        mount_time: 0,
        write_time: 0,
        mount_count: 0,
        max_mount_count: 0xFFFF,
        magic: EXT2_SUPER_MAGIC,
        state: 1,
        errors: 1,
        minor_revision: 0,
        last_check: 0,
        check_interval: 0,
        creator_os: 0,
        revision: 1,
        default_reserved_uid: 0,
        default_reserved_gid: 0,
        first_inode: 11,
        inode_size: 128,
        block_group_number: 0,
        feature_compat: 0,
        feature_incompat: 0,
        feature_ro_compat: 0,
    };
    put(&mut image, SUPERBLOCK_BLOCK, 0, &superblock);

    let descriptor = GroupDescriptor {
        block_bitmap: BLOCK_BITMAP_BLOCK,
        inode_bitmap: INODE_BITMAP_BLOCK,
        inode_table: INODE_TABLE_BLOCK,
        free_blocks_count: FRESH_FREE_BLOCKS as u16,
        free_inodes_count: FRESH_FREE_INODES as u16,
        used_dirs_count: 1,
        padding: 0,
        reserved: [0; 3],
    };
    put(&mut image, DESCRIPTOR_BLOCK, 0, &descriptor);

    // Block bitmap: bit i covers block FIRST_DATA_BLOCK + i. Metadata
    // plus the root directory block are taken; bits past the volume end
    // are padding and stay taken.
    {
        let base = BLOCK_BITMAP_BLOCK as usize * BLOCK_SIZE;
        for bit in 0..(BLOCK_SIZE * 8) as u32 {
            let used = bit < METADATA_BLOCKS || bit >= USABLE_BLOCKS;
            if used {
                image[base + bit as usize / 8] |= 1 << (bit % 8);
            }
        }
    }

    // Inode bitmap: inodes 1..10 are reserved; padding past
    // TOTAL_INODES stays taken.
    {
        let base = INODE_BITMAP_BLOCK as usize * BLOCK_SIZE;
        for bit in 0..(BLOCK_SIZE * 8) as u32 {
            let used = bit < 10 || bit >= TOTAL_INODES;
            if used {
                image[base + bit as usize / 8] |= 1 << (bit % 8);
            }
        }
    }

    // Root inode (2): one directory block holding "." and "..".
    let mut root = Inode::zeroed();
    root.mode = EXT2_MODE_DIRECTORY | EXT2_DEFAULT_DIR_PERMISSIONS;
    root.size = BLOCK_SIZE as u32;
    root.links_count = 2;
    root.blocks = (BLOCK_SIZE / SECTOR_SIZE) as u32 * 1;
    root.block[0] = ROOT_DIR_BLOCK;
    let root_offset = (EXT2_ROOT_INODE as usize - 1) * 128;
    put(
        &mut image,
        INODE_TABLE_BLOCK + (root_offset / BLOCK_SIZE) as u32,
        root_offset % BLOCK_SIZE,
        &root,
    );

    // Root directory records.
    {
        let dot_size = DIR_ENTRY_HEADER_SIZE + align_directory_name_length(1);
        let dot = DirEntryHead {
            inode: EXT2_ROOT_INODE,
            record_length: dot_size as u16,
            name_length: 1,
            file_type: EXT2_FT_DIR,
        };
        put(&mut image, ROOT_DIR_BLOCK, 0, &dot);
        image[ROOT_DIR_BLOCK as usize * BLOCK_SIZE + DIR_ENTRY_HEADER_SIZE] = b'.';

        let dotdot = DirEntryHead {
            inode: EXT2_ROOT_INODE,
            record_length: (BLOCK_SIZE - dot_size) as u16,
            name_length: 2,
            file_type: EXT2_FT_DIR,
        };
        put(&mut image, ROOT_DIR_BLOCK, dot_size, &dotdot);
        let dd = ROOT_DIR_BLOCK as usize * BLOCK_SIZE + dot_size + DIR_ENTRY_HEADER_SIZE;
        image[dd] = b'.';
        image[dd + 1] = b'.';
    }

    image
}

/// Format a RAM disk and mount it.
pub fn mount_fresh(name: &str) -> Arc<Ext2Volume> {
    let disk = RamDisk::from_image(build_image()).unwrap();
    Ext2Volume::mount(Arc::new(disk), 0, name).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileSystemDriver, OpenFlags};
    use crate::klib::KernelError;

    fn counters_agree(volume: &Ext2Volume) {
        let (super_blocks, super_inodes) = volume.free_counts();
        let (group_blocks, group_inodes) = volume.group_free_sums();
        assert_eq!(super_blocks, group_blocks);
        assert_eq!(super_inodes, group_inodes);
    }

    #[test]
    fn mounts_with_expected_counters() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T0:");
        assert_eq!(volume.free_counts(), (FRESH_FREE_BLOCKS, FRESH_FREE_INODES));
        counters_agree(&volume);
    }

    #[test]
    fn create_write_read_roundtrip_across_blocks() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T1:");

        volume.create_folder("docs").unwrap();
        counters_agree(&volume);

        // 4100 bytes spans five 1 KiB blocks.
        let payload: alloc::vec::Vec<u8> =
            (0..4100u32).map(|n| (n % 251) as u8).collect();
        {
            let mut file = volume
                .open("docs/hello.txt", OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            assert_eq!(file.write(&payload).unwrap(), payload.len());
        }
        counters_agree(&volume);

        let mut file = volume.open("docs/hello.txt", OpenFlags::READ).unwrap();
        assert_eq!(file.size(), 4100);
        let mut read_back = vec![0u8; 4200];
        let got = file.read(&mut read_back).unwrap();
        assert_eq!(got, 4100);
        assert_eq!(&read_back[..4100], payload.as_slice());

        assert!(volume.file_exists("docs/hello.txt").unwrap());
        assert!(volume.path_exists("docs").unwrap());
        assert!(!volume.file_exists("docs/missing.txt").unwrap());
    }

    #[test]
    fn truncate_returns_blocks_and_zero_size() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T2:");

        volume.create_folder("docs").unwrap();
        let after_dirs = volume.free_counts().0;

        let payload = vec![0x5Au8; 4100];
        {
            let mut file = volume
                .open("docs/data.bin", OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            file.write(&payload).unwrap();
        }
        assert!(volume.free_counts().0 < after_dirs);

        {
            let mut file = volume
                .open(
                    "docs/data.bin",
                    OpenFlags::WRITE | OpenFlags::TRUNCATE,
                )
                .unwrap();
            assert_eq!(file.size(), 0);
            let mut probe = [0u8; 16];
            assert_eq!(file.read(&mut probe).unwrap(), 0);
        }

        // Every data block returned to the free pool.
        assert_eq!(volume.free_counts().0, after_dirs);
        counters_agree(&volume);
    }

    #[test]
    fn append_extends_from_the_end() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T3:");

        {
            let mut file = volume
                .open("log.txt", OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            file.write(b"one").unwrap();
        }
        {
            let mut file = volume
                .open("log.txt", OpenFlags::WRITE | OpenFlags::APPEND)
                .unwrap();
            assert_eq!(file.position(), 3);
            file.write(b"two").unwrap();
        }

        let mut file = volume.open("log.txt", OpenFlags::READ).unwrap();
        let mut buffer = [0u8; 16];
        let got = file.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..got], b"onetwo");
    }

    #[test]
    fn wildcard_enumeration_matches_pattern() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T4:");

        volume.create_folder("docs").unwrap();
        for name in ["docs/a.txt", "docs/b.txt", "docs/c.dat"] {
            let file = volume
                .open(name, OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            drop(file);
        }

        let mut handle = volume.open("docs/*.txt", OpenFlags::READ).unwrap();
        let mut names = alloc::vec::Vec::new();
        while handle.open_next().unwrap() {
            names.push(alloc::string::String::from(handle.name()));
        }
        names.sort();
        assert_eq!(names, alloc::vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn parent_directories_are_created_and_normalized() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T5:");

        // Intermediates appear on demand; a trailing slash is fine.
        volume.create_folder("a/b/c/").unwrap();
        assert!(volume.path_exists("a/b/c").unwrap());
        // Creating it again is idempotent.
        volume.create_folder("a/b/c").unwrap();

        // Empty components are rejected.
        assert!(matches!(
            volume.create_folder("a//d"),
            Err(KernelError::InvalidArgument)
        ));
        counters_agree(&volume);
    }

    #[test]
    fn unmount_refused_while_files_open() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T6:");

        let file = volume
            .open("keep.txt", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        assert!(matches!(volume.unmount(), Err(KernelError::Busy)));
        drop(file);
        volume.unmount().unwrap();
    }

    #[test]
    fn sparse_reads_return_zeros() {
        let _guard = crate::test_utils::serialize();
        let volume = mount_fresh("T7:");

        {
            let mut file = volume
                .open("sparse.bin", OpenFlags::WRITE | OpenFlags::CREATE)
                .unwrap();
            // Jump past two blocks before the first write.
            file.seek(3000).unwrap();
            file.write(b"tail").unwrap();
        }

        let mut file = volume.open("sparse.bin", OpenFlags::READ).unwrap();
        assert_eq!(file.size(), 3004);
        let mut buffer = vec![0xFFu8; 3004];
        assert_eq!(file.read(&mut buffer).unwrap(), 3004);
        assert!(buffer[..3000].iter().all(|&b| b == 0));
        assert_eq!(&buffer[3000..], b"tail");
    }
}
