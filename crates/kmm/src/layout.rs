//! Virtual memory layout constants.

use core::ops::Range;

use crate::{PAGE_SIZE, PagingMode};

/// Where each kernel region lives in virtual memory, per architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub mode: PagingMode,
    /// Everything at or above this address is kernel space, shared by every directory.
    pub kernel_base: usize,
    pub kernel_heap: Range<usize>,
    pub driver_region: Range<usize>,
    pub driver_chunk: usize,
    pub dma_region: Range<usize>,
    pub dma_chunk: usize,
    pub mmio_region: Range<usize>,
    pub mmio_chunk: usize,
    /// Start of a new process's heap.
    pub user_heap_base: usize,
    /// The user stack grows down from `user_stack.end` and may fault in anywhere in the range.
    pub user_stack: Range<usize>,
    pub kernel_stack_size: usize,
    /// Offset of the bootloader's higher-half map of physical memory, if there is one.
    pub direct_map: Option<usize>,
}

impl MemoryLayout {
    /// i386: 3 GiB user / 1 GiB kernel split, no direct map.
    pub const fn i386() -> Self {
        Self {
            mode: PagingMode::TwoLevel,
            kernel_base: 0xC000_0000,
            kernel_heap: 0xD000_0000..0xE000_0000,
            driver_region: 0xE000_0000..0xE100_0000,
            driver_chunk: PAGE_SIZE,
            dma_region: 0xF000_0000..0xF080_0000,
            dma_chunk: PAGE_SIZE,
            mmio_region: 0xF100_0000..0xF200_0000,
            mmio_chunk: PAGE_SIZE,
            user_heap_base: 0x3000_0000,
            user_stack: 0xB000_0000..0xB010_0000,
            kernel_stack_size: 4 * PAGE_SIZE,
            direct_map: None,
        }
    }

    /// x86_64 with four-level paging; the kernel owns the upper canonical half.
    #[cfg(target_pointer_width = "64")]
    pub const fn x86_64() -> Self {
        Self {
            mode: PagingMode::FourLevel,
            kernel_base: 0xFFFF_8000_0000_0000,
            kernel_heap: 0xFFFF_FF00_0000_0000..0xFFFF_FF80_0000_0000,
            driver_region: 0xFFFF_FF80_0000_0000..0xFFFF_FF80_1000_0000,
            driver_chunk: PAGE_SIZE,
            dma_region: 0xFFFF_FF90_0000_0000..0xFFFF_FF90_0400_0000,
            dma_chunk: PAGE_SIZE,
            mmio_region: 0xFFFF_FFA0_0000_0000..0xFFFF_FFA0_1000_0000,
            mmio_chunk: PAGE_SIZE,
            user_heap_base: 0x0000_0000_3000_0000,
            user_stack: 0x0000_7FFF_F000_0000..0x0000_7FFF_F010_0000,
            kernel_stack_size: 4 * PAGE_SIZE,
            direct_map: None,
        }
    }

    pub const fn with_direct_map(mut self, offset: usize) -> Self {
        self.direct_map = Some(offset);
        self
    }

    /// Switches the table format. On x86_64 the kernel base follows the mode's upper half, so
    /// kernel space always starts on a top-level entry boundary.
    pub const fn with_mode(mut self, mode: PagingMode) -> Self {
        self.mode = mode;
        #[cfg(target_pointer_width = "64")]
        if let Some(start) = mode.higher_half_start() {
            self.kernel_base = start as usize;
        }
        self
    }

    pub const fn is_kernel_address(&self, address: usize) -> bool {
        address >= self.kernel_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sane(layout: &MemoryLayout) {
        let regions = [
            &layout.kernel_heap,
            &layout.driver_region,
            &layout.dma_region,
            &layout.mmio_region,
        ];
        for region in regions {
            assert!(layout.is_kernel_address(region.start));
            assert_eq!(region.start % PAGE_SIZE, 0);
            assert_eq!(region.end % PAGE_SIZE, 0);
        }
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:x?} overlaps {b:x?}");
            }
        }
        assert!(!layout.is_kernel_address(layout.user_stack.end - 1));
        assert!(layout.user_heap_base < layout.user_stack.start);
        assert_eq!((layout.driver_region.end - layout.driver_region.start) % layout.driver_chunk, 0);
        assert_eq!((layout.dma_region.end - layout.dma_region.start) % layout.dma_chunk, 0);
        assert_eq!((layout.mmio_region.end - layout.mmio_region.start) % layout.mmio_chunk, 0);
    }

    #[test]
    fn presets_are_consistent() {
        assert_sane(&MemoryLayout::i386());
        #[cfg(target_pointer_width = "64")]
        {
            assert_sane(&MemoryLayout::x86_64());
            assert_sane(&MemoryLayout::x86_64().with_mode(PagingMode::FiveLevel));
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn x86_64_regions_are_canonical() {
        for layout in [
            MemoryLayout::x86_64(),
            MemoryLayout::x86_64().with_mode(PagingMode::FiveLevel),
        ] {
            for address in [layout.kernel_base, layout.kernel_heap.start, layout.mmio_region.start] {
                assert!(layout.mode.is_canonical(crate::VirtualAddress::new(address)));
            }
            let top = layout.mode.top_level();
            let base = crate::VirtualAddress::new(layout.kernel_base);
            assert_eq!(base.as_usize() as u64 % layout.mode.span(top), 0);
        }
        assert_eq!(
            MemoryLayout::x86_64().with_mode(PagingMode::FiveLevel).kernel_base,
            0xFF00_0000_0000_0000
        );
    }
}
