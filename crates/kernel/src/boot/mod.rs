//! Kernel bring-up
//!
//! Order matters: the frame allocator is primed from the boot memory
//! map, the kernel page directory and address space come up next, the
//! kernel heap is committed inside a named region, the kernel process
//! and its main task are built, and only then do interrupts start and
//! drivers mount their filesystems.

pub mod multiboot;

use crate::klib::{KernelError, Result};
use crate::mm::heap::{self, Heap};
use crate::mm::paging::{self, PageFlags};
use crate::mm::region::{self, RegionFlags};
use crate::mm::{page_align_up, phys, PhysAddr, PAGE_SHIFT, PAGE_SIZE, VMA_KERNEL};
use crate::process::{self, task, TaskId};
use self::multiboot::{MemoryMap, MultibootInfo};

/// Size of the kernel heap region committed at boot.
const KERNEL_HEAP_SIZE: u32 = 0x40_0000;
/// Size of the TSS region reservation.
const TSS_REGION_SIZE: u32 = 0x1000;

/// Physical window the loader hands the kernel image in.
#[derive(Debug, Clone, Copy)]
pub struct LoaderLayout {
    pub kernel_physical_base: PhysAddr,
    pub kernel_physical_end: PhysAddr,
}

/// Entry point for the platform start code.
///
/// # Safety
/// `info` must be the loader's Multiboot record and the loader layout
/// must describe the real kernel image placement.
pub unsafe fn initialize(info: &MultibootInfo, layout: LoaderLayout) -> Result<()> {
    crate::arch::serial::init();
    crate::info!("exos: kernel core starting");

    let map = multiboot::parse_memory_map(info)?;
    let (memory_size, page_count) = multiboot::memory_metrics(&map);
    crate::info!(
        "boot: {} MiB usable RAM, {} frames",
        memory_size / (1024 * 1024),
        page_count
    );

    prime_physical_memory(&map, page_count, layout)?;
    let kernel_directory = build_kernel_directory(layout)?;
    heap::install_kernel_heap(commit_kernel_heap()?);

    let kernel_process = process::process::init_kernel_process("exos");
    region::with_kernel_space(|space| {
        space.alloc_region(
            0,
            0,
            TSS_REGION_SIZE,
            RegionFlags::COMMIT | RegionFlags::READWRITE,
            "TSS",
        )
    })??;

    let main_task = task::create_task(
        &kernel_process,
        task::TaskCreateInfo {
            name: alloc::string::String::from("kernel-main"),
            entry_point: kernel_main as usize as u32,
            parameter: 0,
            stack_size: task::TASK_MINIMUM_STACK_SIZE,
            priority: task::TaskPriority::Normal,
            flags: task::TaskCreateFlags::MAIN,
            kind: task::TaskKind::KernelMain,
        },
    )?;

    crate::install_kernel(crate::Kernel {
        kernel_process: kernel_process.id,
        kernel_main_task: main_task.id,
    });
    process::scheduler::add_task_to_queue(&main_task);
    mark_boot_context(main_task.id);

    crate::interrupts::initialize();
    crate::arch::enable_interrupts();

    crate::info!(
        "boot: kernel process {:?}, main task {:?}, directory {:#x}",
        kernel_process.id,
        main_task.id,
        kernel_directory
    );
    Ok(())
}

/// The boot context becomes the kernel main task once it exists.
fn mark_boot_context(id: TaskId) {
    process::set_current_task(id);
}

/// Prime the frame allocator: carve its bitmap out of the first free
/// window past the kernel image, then paint the reservations.
fn prime_physical_memory(
    map: &MemoryMap,
    page_count: usize,
    layout: LoaderLayout,
) -> Result<()> {
    let bitmap_bytes = phys::bitmap_bytes(page_count);
    let metadata_start = page_align_up(layout.kernel_physical_end);
    let metadata_end = page_align_up(metadata_start + bitmap_bytes as u32);

    // The bitmap lives in raw physical memory; reach it through the
    // linear window the loader left identity-mapped.
    let storage = unsafe {
        core::slice::from_raw_parts_mut(metadata_start as usize as *mut u8, bitmap_bytes)
    };
    phys::init(storage, page_count)?;

    phys::mark_used_physical_memory(
        map,
        (layout.kernel_physical_base, metadata_start),
        (metadata_start, metadata_end),
    );

    let stats = phys::stats().ok_or(KernelError::InvalidState)?;
    crate::info!(
        "boot: {} frames free after reservation painting",
        stats.free_frames
    );
    Ok(())
}

/// Build the kernel page directory: identity-map the loader window,
/// alias the kernel image into the kernel half, wire the temporary
/// mapping page and activate.
fn build_kernel_directory(layout: LoaderLayout) -> Result<PhysAddr> {
    let directory = paging::create_page_directory()?;

    // Identity window covering the image and the allocator metadata so
    // boot code keeps running after the switch.
    let identity_end = page_align_up(layout.kernel_physical_end) + (PAGE_SIZE as u32) * 64;
    let mut physical = 0u32;
    while physical < identity_end {
        paging::map_page(
            directory,
            physical,
            physical,
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )?;
        physical += PAGE_SIZE as u32;
    }

    // Kernel-half alias of the image.
    let image_pages =
        (page_align_up(layout.kernel_physical_end - layout.kernel_physical_base)) >> PAGE_SHIFT;
    for page in 0..image_pages {
        paging::map_page(
            directory,
            VMA_KERNEL + (page << PAGE_SHIFT),
            layout.kernel_physical_base + (page << PAGE_SHIFT),
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )?;
    }

    // Seed the temporary-map slot's page table so retargeting is a PTE
    // write. The host backend needs no seeding.
    #[cfg(target_arch = "x86")]
    paging::map_page(
        directory,
        crate::mm::physmap::TEMP_MAP_PAGE,
        0,
        PageFlags::WRITABLE,
    )?;

    paging::set_kernel_directory(directory);
    paging::load_page_directory(directory);
    region::init_kernel_space(directory);

    Ok(directory)
}

/// Commit the kernel heap region and build the heap over it.
fn commit_kernel_heap() -> Result<Heap> {
    let base = region::alloc_region(
        0,
        0,
        KERNEL_HEAP_SIZE,
        RegionFlags::COMMIT | RegionFlags::READWRITE,
        "KernelHeap",
    )?;

    unsafe {
        Heap::init(
            base as usize as *mut u8,
            KERNEL_HEAP_SIZE as usize,
            usize::MAX,
        )
    }
}

/// Mount the boot volume (EXT2 at the partition the loader booted
/// from) into the filesystem registry.
pub fn mount_boot_volume(
    storage: alloc::sync::Arc<dyn crate::drivers::block::StorageUnit>,
    partition_start: u64,
    mount_name: &str,
) -> Result<()> {
    let volume = crate::fs::ext2::Ext2Volume::mount(storage, partition_start, mount_name)?;
    crate::fs::mount(volume)
}

/// Mount a validated EPK package as a read-only PackageFS.
pub fn mount_package(package_bytes: alloc::vec::Vec<u8>, mount_name: &str) -> Result<()> {
    let options = crate::epk::EpkParserOptions {
        verify_package_hash: true,
        verify_signature: true,
        require_signature: false,
    };
    let filesystem = crate::epk::PackageFs::new(package_bytes, &options, mount_name)
        .map_err(|error| {
            crate::warn!("boot: package rejected: {:?}", error);
            KernelError::InvalidArgument
        })?;
    crate::fs::mount(filesystem)
}

/// Kernel main task: service loop and idle halt.
extern "C" fn kernel_main(_parameter: u32) -> u32 {
    crate::info!("exos: kernel main task running");
    loop {
        process::scheduler::yield_now();
        crate::arch::halt();
    }
}

/// The boot context becomes the kernel main task: the platform start
/// code calls this after `initialize` and never gets the CPU back.
pub fn run_kernel_main() -> ! {
    let _ = kernel_main(0);
    loop {
        crate::arch::halt();
    }
}

/// Rust-side global allocator backed by the kernel process heap.
#[cfg(all(target_arch = "x86", not(test)))]
mod allocator {
    use core::alloc::{GlobalAlloc, Layout};

    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            // Small alignments fall out of the heap's own granularity;
            // larger ones oversize and round. The heap's free accepts
            // only original pointers, so keep the rounding inside one
            // granule.
            if layout.align() <= 8 {
                return match crate::mm::heap::kernel_heap_alloc(layout.size().max(1)) {
                    Ok(pointer) => pointer,
                    Err(_) => core::ptr::null_mut(),
                };
            }

            let size = layout.size() + layout.align();
            match crate::mm::heap::kernel_heap_alloc(size) {
                Ok(pointer) => {
                    let address = pointer as usize;
                    // Skid at least 4 bytes so the back-pointer always
                    // fits below the aligned pointer.
                    let aligned =
                        (address + 4 + layout.align() - 1) & !(layout.align() - 1);
                    let skid = (aligned - address) as u32;
                    ((aligned - 4) as *mut u32).write_unaligned(skid);
                    aligned as *mut u8
                }
                Err(_) => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, pointer: *mut u8, layout: Layout) {
            if layout.align() <= 8 {
                let _ = crate::mm::heap::kernel_heap_free(pointer);
                return;
            }
            let skid = ((pointer as usize - 4) as *const u32).read_unaligned();
            let original = pointer.sub(skid as usize);
            let _ = crate::mm::heap::kernel_heap_free(original);
        }
    }

    #[global_allocator]
    static GLOBAL: KernelAllocator = KernelAllocator;
}
