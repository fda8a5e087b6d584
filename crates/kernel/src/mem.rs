// cSpell:ignore Hhdm

//! Memory bring-up: the PMM from the bootloader's map, the mapper on the live page tables, the
//! kernel heap as the global allocator, and a boot self-test of the whole stack.

use core::alloc::{GlobalAlloc, Layout};

use kmm::{
    AddressTranslator, Bugcode, HEAP_ALIGN, Mapper, MemoryContext, MemoryLayout, OrFatal, PAGE_SIZE,
    PhysicalAddress, PhysicalMemoryManager, VirtualAddress, fatal,
};
use limine::{
    memory_map::{self, Entry},
    request::{HhdmRequest, MemoryMapRequest, StackSizeRequest},
};

use crate::arch;

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

const BOOT_STACK_SIZE: u64 = 64 * 1024;

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(BOOT_STACK_SIZE);

/// Low memory stays reserved: real-mode structures and firmware leftovers live there.
const LOW_MEMORY: usize = 0x10_0000;

static CONTEXT: spin::Once<MemoryContext<'static>> = spin::Once::new();
static BOOT_STACK: spin::Once<(VirtualAddress, VirtualAddress)> = spin::Once::new();

pub fn type_name(entry_type: memory_map::EntryType) -> &'static str {
    match entry_type {
        memory_map::EntryType::USABLE => "USABLE",
        memory_map::EntryType::RESERVED => "RESERVED",
        memory_map::EntryType::ACPI_RECLAIMABLE => "ACPI_RECLAIMABLE",
        memory_map::EntryType::ACPI_NVS => "ACPI_NVS",
        memory_map::EntryType::BAD_MEMORY => "BAD_MEMORY",
        memory_map::EntryType::BOOTLOADER_RECLAIMABLE => "BOOTLOADER_RECLAIMABLE",
        memory_map::EntryType::EXECUTABLE_AND_MODULES => "EXECUTABLE_AND_MODULES",
        memory_map::EntryType::FRAMEBUFFER => "FRAMEBUFFER",
        _ => "UNKNOWN",
    }
}

/// Entry types backed by RAM, whether or not the PMM may hand them out.
fn is_ram(entry: &Entry) -> bool {
    matches!(
        entry.entry_type,
        memory_map::EntryType::USABLE
            | memory_map::EntryType::ACPI_RECLAIMABLE
            | memory_map::EntryType::BOOTLOADER_RECLAIMABLE
            | memory_map::EntryType::EXECUTABLE_AND_MODULES
    )
}

/// Records where the boot stack lives, for the panic traceback.
pub fn set_stack_bounds(stack_start: usize) {
    let top = VirtualAddress::new(stack_start);
    let bottom = VirtualAddress::new(stack_start.saturating_sub(STACK_SIZE.size() as usize));
    BOOT_STACK.call_once(|| (bottom, top));
}

/// `true` if `address` lies on the boot stack.
pub fn on_boot_stack(address: VirtualAddress) -> bool {
    BOOT_STACK
        .get()
        .is_some_and(|(bottom, top)| address >= *bottom && address < *top)
}

/// The memory context, once [`init`] has run.
pub fn try_context() -> Option<&'static MemoryContext<'static>> {
    CONTEXT.get()
}

pub fn context() -> &'static MemoryContext<'static> {
    match CONTEXT.get() {
        Some(ctx) => ctx,
        None => fatal(
            Bugcode::KernelAssertion,
            "mem",
            format_args!("memory used before initialization"),
        ),
    }
}

/// Builds the PMM, adopts the bootloader's page tables and installs the memory context.
pub fn init() -> &'static MemoryContext<'static> {
    let Some(hhdm) = HIGHER_HALF_DIRECT_MAP.get_response() else {
        fatal(Bugcode::MemoryManagement, "mem", format_args!("no higher-half direct map"));
    };
    let direct_map = hhdm.offset() as usize;
    let Some(memory_map) = MEMORY_MAP_REQUEST.get_response() else {
        fatal(Bugcode::MemoryManagement, "mem", format_args!("no memory map"));
    };
    let entries = memory_map.entries();

    for entry in entries {
        log::debug!(
            "memmap: {:#014x}+{:#012x} {}",
            entry.base,
            entry.length,
            type_name(entry.entry_type)
        );
    }

    let memory_size = entries
        .iter()
        .filter(|entry| is_ram(entry))
        .map(|entry| (entry.base + entry.length) as usize)
        .max()
        .unwrap_or(0);

    let frames = build_pmm(entries, memory_size, direct_map);

    // Limine leaves four-level paging on unless it is asked for LA57.
    let layout = MemoryLayout::x86_64().with_direct_map(direct_map);
    let root = kmm::arch::active_directory();
    let mut mapper = Mapper::adopt(AddressTranslator::hardware(direct_map), frames, &layout, root)
        .or_fatal("mem");
    mapper.set_cpu_id_source(arch::cpu_id);

    let stats = mapper.frame_stats();
    log::info!(
        "mem: {} MiB tracked, {} frames free, kernel directory at {}",
        memory_size / (1024 * 1024),
        stats.free,
        root
    );

    CONTEXT.call_once(|| MemoryContext::new(layout, mapper))
}

/// Creates the frame bitmap in the first usable region big enough for it and releases every
/// usable region except the bitmap itself and low memory.
fn build_pmm(
    entries: &[&Entry],
    memory_size: usize,
    direct_map: usize,
) -> PhysicalMemoryManager<'static> {
    let words = PhysicalMemoryManager::storage_words(memory_size);
    let bytes = (words * size_of::<u32>()).next_multiple_of(PAGE_SIZE);

    let Some(home) = entries.iter().find(|entry| {
        entry.entry_type == memory_map::EntryType::USABLE
            && entry.base as usize >= LOW_MEMORY
            && entry.length as usize >= bytes
    }) else {
        fatal(
            Bugcode::OutOfMemory,
            "mem",
            format_args!("no region can hold the {bytes}-byte frame bitmap"),
        );
    };
    let storage_base = PhysicalAddress::new(home.base as usize);

    // SAFETY: the region is usable RAM reached through the direct map, and it is reserved below
    // before anything else can allocate from it.
    let storage = unsafe {
        core::slice::from_raw_parts_mut(
            (storage_base.as_usize() + direct_map) as *mut u32,
            words,
        )
    };
    let mut frames = PhysicalMemoryManager::new(memory_size, storage).or_fatal("mem");

    for entry in entries {
        if entry.entry_type == memory_map::EntryType::USABLE {
            frames.initialize_region(
                PhysicalAddress::new(entry.base as usize),
                entry.length as usize,
            );
        }
    }
    frames.deinitialize_region(storage_base, bytes);
    frames.deinitialize_region(PhysicalAddress::NULL, LOW_MEMORY);

    log::debug!(
        "pmm: bitmap at {} ({} bytes), {} of {} frames free",
        storage_base,
        bytes,
        frames.free_blocks_count(),
        frames.max_blocks()
    );
    frames
}

/// Clones the kernel address space, checks that the clone sees the kernel, tears it down and
/// checks that every frame came back. Then does the same for the DMA and driver regions.
pub fn self_test(ctx: &MemoryContext<'_>) {
    let mapper = ctx.mapper();
    let before = mapper.frame_stats();

    let clone = mapper.clone_address_space(None).or_fatal("mem");
    let marker = VirtualAddress::from_ptr(&CONTEXT);
    let original = mapper.translate(None, marker);
    if original.is_none() || mapper.translate(Some(clone), marker) != original {
        fatal(
            Bugcode::KernelAssertion,
            "mem",
            format_args!("clone {clone:?} does not share the kernel mapping of {marker}"),
        );
    }
    mapper.destroy_address_space(clone).or_fatal("mem");

    let regions = ctx.regions();
    let buffer = regions.allocate_dma(mapper, 2 * PAGE_SIZE).or_fatal("mem");
    mapper.write_u64(None, buffer.virt, 0x5AFE).or_fatal("mem");
    if mapper.translate(None, buffer.virt) != Some(buffer.phys) {
        fatal(
            Bugcode::KernelAssertion,
            "mem",
            format_args!("DMA buffer {} is not backed by {}", buffer.virt, buffer.phys),
        );
    }
    regions.free_dma(mapper, buffer).or_fatal("mem");

    let driver = regions.allocate_driver(mapper, "selftest", PAGE_SIZE).or_fatal("mem");
    regions.free_driver(mapper, driver).or_fatal("mem");

    let after = mapper.frame_stats();
    if after.free != before.free {
        fatal(
            Bugcode::MemoryManagement,
            "mem",
            format_args!("self-test leaked {} frames", before.free.abs_diff(after.free)),
        );
    }
    log::info!("mem: self-test passed, {} frames free", after.free);
}

#[global_allocator]
static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator;

/// `alloc` on top of the kernel heap. Allocations fail until [`init`] has run.
struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(ctx) = CONTEXT.get() else {
            return core::ptr::null_mut();
        };
        match ctx.kmalloc_aligned(layout.size().max(1), layout.align()) {
            Ok(ptr) => ptr.as_mut_ptr(),
            Err(err) => {
                log::error!("heap: {} bytes (align {}): {}", layout.size(), layout.align(), err);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ctx) = CONTEXT.get() else {
            return;
        };
        if let Err(err) = ctx.kfree(VirtualAddress::from_ptr(ptr)) {
            log::warn!("heap: free of {:p}: {}", ptr, err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ctx) = CONTEXT.get() else {
            return core::ptr::null_mut();
        };
        if layout.align() > HEAP_ALIGN {
            // SAFETY: forwarded to the default implementation under the caller's contract.
            let new = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
            if !new.is_null() {
                // SAFETY: both blocks are live and at least this long.
                unsafe {
                    core::ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }
        match ctx.krealloc(VirtualAddress::from_ptr(ptr), new_size.max(1)) {
            Ok(new) => new.as_mut_ptr(),
            Err(err) => {
                log::error!("heap: realloc of {:p} to {} bytes: {}", ptr, new_size, err);
                core::ptr::null_mut()
            }
        }
    }
}
