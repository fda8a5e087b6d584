//! The memory context: one value owning everything the memory core keeps global.

use crate::{
    AllocatorInfo, HeapStats, KernelHeap, Mapper, MemoryError, MemoryLayout, Regions,
    VirtualAddress,
};

/// Mapper, kernel heap and region pools for one machine.
///
/// The kernel builds exactly one during boot; tests build as many independent ones as they like.
/// Regions are created on first use because their bookkeeping lives on the kernel heap, which
/// itself only works once the context exists.
pub struct MemoryContext<'a> {
    layout: MemoryLayout,
    mapper: Mapper<'a>,
    heap: KernelHeap,
    regions: spin::Once<Regions>,
}

impl<'a> MemoryContext<'a> {
    pub fn new(layout: MemoryLayout, mapper: Mapper<'a>) -> Self {
        let heap = KernelHeap::new(
            VirtualAddress::new(layout.kernel_heap.start),
            VirtualAddress::new(layout.kernel_heap.end),
        );
        Self {
            layout,
            mapper,
            heap,
            regions: spin::Once::new(),
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn mapper(&self) -> &Mapper<'a> {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut Mapper<'a> {
        &mut self.mapper
    }

    pub fn heap(&self) -> &KernelHeap {
        &self.heap
    }

    /// The region pools, created on first call.
    pub fn regions(&self) -> &Regions {
        self.regions.call_once(|| Regions::new(&self.layout))
    }

    /// The region pools if they exist yet. Never allocates.
    pub fn try_regions(&self) -> Option<&Regions> {
        self.regions.get()
    }

    pub fn kmalloc(&self, size: usize) -> Result<VirtualAddress, MemoryError> {
        self.heap.kmalloc(&self.mapper, size)
    }

    pub fn kmalloc_aligned(&self, size: usize, align: usize) -> Result<VirtualAddress, MemoryError> {
        self.heap.kmalloc_aligned(&self.mapper, size, align)
    }

    pub fn krealloc(&self, ptr: VirtualAddress, size: usize) -> Result<VirtualAddress, MemoryError> {
        self.heap.krealloc(&self.mapper, ptr, size)
    }

    pub fn kfree(&self, ptr: VirtualAddress) -> Result<(), MemoryError> {
        self.heap.kfree(&self.mapper, ptr)
    }

    pub fn allocator_info(&self) -> AllocatorInfo {
        self.heap.allocator_info()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// A context over `memory_size` bytes of emulated RAM.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(
        layout: MemoryLayout,
        memory_size: usize,
    ) -> Result<MemoryContext<'static>, MemoryError> {
        let mapper = Mapper::emulated(&layout, memory_size)?;
        Ok(MemoryContext::new(layout, mapper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn contexts_are_independent() {
        let a = MemoryContext::emulated(MemoryLayout::i386(), 4 * 1024 * 1024).unwrap();
        let b = MemoryContext::emulated(MemoryLayout::i386(), 4 * 1024 * 1024).unwrap();
        let before = b.mapper().frame_stats();

        let ptr = a.kmalloc(64).unwrap();
        assert!(a.heap().contains(ptr));
        assert_eq!(b.mapper().frame_stats(), before);
        assert_eq!(b.heap_stats().allocations, 0);
        a.kfree(ptr).unwrap();
    }

    #[test]
    fn regions_are_created_on_demand() {
        let ctx = MemoryContext::emulated(MemoryLayout::i386(), 4 * 1024 * 1024).unwrap();
        assert!(ctx.try_regions().is_none());
        let buffer = ctx.regions().allocate_dma(ctx.mapper(), PAGE_SIZE).unwrap();
        assert!(ctx.try_regions().is_some());
        ctx.regions().free_dma(ctx.mapper(), buffer).unwrap();
    }
}
