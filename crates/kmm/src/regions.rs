//! Kernel virtual regions: DMA buffers, device MMIO windows and driver images.
//!
//! Each region is a [`Pool`] over a reserved slice of kernel space. The pools only hand out
//! addresses; this module does the mapping. Because every kernel top-level entry is shared, a
//! mapping made here is visible from every address space.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{
    Bugcode, Directory, Lookup, MapFlags, Mapper, MemoryError, MemoryLayout, PAGE_SIZE,
    PhysicalAddress, Pool, VirtualAddress, fatal,
};

/// A physically contiguous, uncached buffer a device can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub size: usize,
}

/// A loaded driver image, as reported by [`Regions::resolve_driver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRegion {
    pub name: String,
    pub base: VirtualAddress,
    pub size: usize,
}

impl DriverRegion {
    fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

pub struct Regions {
    dma: Pool,
    mmio: Pool,
    drivers: Pool,
    direct_map: Option<usize>,
    loaded: spin::Mutex<Vec<DriverRegion>>,
}

fn region_pool(name: &'static str, range: &core::ops::Range<usize>, chunk: usize) -> Pool {
    if chunk % PAGE_SIZE != 0 {
        fatal(
            Bugcode::PoolMisconfigured,
            "regions",
            format_args!("{name}: chunk size {chunk:#x} is not a whole number of pages"),
        );
    }
    Pool::create(name, chunk, range.end.saturating_sub(range.start), VirtualAddress::new(range.start))
}

impl Regions {
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            dma: region_pool("dma", &layout.dma_region, layout.dma_chunk),
            mmio: region_pool("mmio", &layout.mmio_region, layout.mmio_chunk),
            drivers: region_pool("drivers", &layout.driver_region, layout.driver_chunk),
            direct_map: layout.direct_map,
            loaded: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn dma_pool(&self) -> &Pool {
        &self.dma
    }

    pub fn mmio_pool(&self) -> &Pool {
        &self.mmio
    }

    pub fn driver_pool(&self) -> &Pool {
        &self.drivers
    }

    fn kernel(mapper: &Mapper<'_>) -> Option<Directory> {
        Some(mapper.kernel_directory())
    }

    fn unmap_range(mapper: &Mapper<'_>, base: VirtualAddress, pages: usize) {
        for page in 0..pages {
            let address = base + page * PAGE_SIZE;
            if let Ok(Some(handle)) = mapper.get_page(Self::kernel(mapper), address, Lookup::Existing)
            {
                mapper.unmap_page(&handle);
            }
        }
    }

    fn map_range(
        mapper: &Mapper<'_>,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        pages: usize,
        flags: MapFlags,
    ) -> Result<(), MemoryError> {
        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            if let Err(err) = mapper.map_address(Self::kernel(mapper), phys + offset, virt + offset, flags)
            {
                Self::unmap_range(mapper, virt, page);
                return Err(err);
            }
        }
        Ok(())
    }

    // -- DMA ------------------------------------------------------------------------------------

    /// Allocates a zeroed, uncached buffer of at least `size` bytes backed by contiguous frames.
    pub fn allocate_dma(&self, mapper: &Mapper<'_>, size: usize) -> Result<DmaBuffer, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let chunks = self.dma.chunks_for(size);
        let bytes = chunks * self.dma.chunk_size();
        let pages = bytes / PAGE_SIZE;

        let virt = self.dma.allocate_chunks(chunks)?;
        let phys = match mapper.allocate_frames(pages) {
            Ok(phys) => phys,
            Err(err) => {
                let _ = self.dma.free_chunks(virt, chunks);
                return Err(err);
            }
        };
        for page in 0..pages {
            mapper.translator().zero_frame(phys + page * PAGE_SIZE);
        }
        if let Err(err) = Self::map_range(mapper, phys, virt, pages, MapFlags::KERNEL | MapFlags::NO_CACHE) {
            let _ = mapper.free_frames(phys, pages);
            let _ = self.dma.free_chunks(virt, chunks);
            return Err(err);
        }

        log::debug!("regions: dma buffer {virt} -> {phys} ({bytes:#x} bytes)");
        Ok(DmaBuffer {
            virt,
            phys,
            size: bytes,
        })
    }

    /// Unmaps a buffer from [`allocate_dma`](Self::allocate_dma) and frees the frames it is
    /// actually mapped to. `buffer.phys` is only cross-checked.
    pub fn free_dma(&self, mapper: &Mapper<'_>, buffer: DmaBuffer) -> Result<(), MemoryError> {
        if !self.dma.contains(buffer.virt) || !buffer.virt.is_page_aligned() {
            return Err(MemoryError::InvalidRange);
        }
        let kernel = Self::kernel(mapper);
        let Some(mapped) = mapper.translate(kernel, buffer.virt) else {
            log::warn!("regions: dma buffer {} is not mapped", buffer.virt);
            return Err(MemoryError::NotAllocated);
        };
        if mapped != buffer.phys {
            log::warn!(
                "regions: dma buffer {} claims {} but maps {}",
                buffer.virt,
                buffer.phys,
                mapped
            );
        }

        for page in 0..buffer.size / PAGE_SIZE {
            let address = buffer.virt + page * PAGE_SIZE;
            let Some(handle) = mapper.get_page(kernel, address, Lookup::Existing)? else {
                continue;
            };
            if let Some(frame) = mapper.unmap_page(&handle) {
                mapper.free_frame(frame)?;
            }
        }
        self.dma.free_chunks(buffer.virt, self.dma.chunks_for(buffer.size))
    }

    // -- MMIO -----------------------------------------------------------------------------------

    /// Maps `size` bytes of device memory at `phys` uncached. The returned address carries the
    /// same page offset as `phys`.
    pub fn map_mmio(
        &self,
        mapper: &Mapper<'_>,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let offset = phys.page_offset();
        let chunks = self.mmio.chunks_for(offset + size);
        let pages = chunks * self.mmio.chunk_size() / PAGE_SIZE;

        let virt = self.mmio.allocate_chunks(chunks)?;
        let flags = MapFlags::KERNEL | MapFlags::NO_CACHE | MapFlags::WRITE_THROUGH;
        if let Err(err) = Self::map_range(mapper, phys.align_down(PAGE_SIZE), virt, pages, flags) {
            let _ = self.mmio.free_chunks(virt, chunks);
            return Err(err);
        }
        Ok(virt + offset)
    }

    pub fn unmap_mmio(
        &self,
        mapper: &Mapper<'_>,
        virt: VirtualAddress,
        size: usize,
    ) -> Result<(), MemoryError> {
        if !self.mmio.contains(virt) {
            return Err(MemoryError::InvalidRange);
        }
        let base = virt.align_down(PAGE_SIZE);
        let chunks = self.mmio.chunks_for(virt.page_offset() + size);
        Self::unmap_range(mapper, base, chunks * self.mmio.chunk_size() / PAGE_SIZE);
        self.mmio.free_chunks(base, chunks)
    }

    /// Makes `size` bytes of arbitrary physical memory readable, through the direct map when
    /// there is one and through the MMIO region otherwise.
    pub fn remap_phys(
        &self,
        mapper: &Mapper<'_>,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        match self.direct_map {
            Some(offset) => Ok(VirtualAddress::new(phys.as_usize() + offset)),
            None => self.map_mmio(mapper, phys, size),
        }
    }

    pub fn unmap_phys(
        &self,
        mapper: &Mapper<'_>,
        virt: VirtualAddress,
        size: usize,
    ) -> Result<(), MemoryError> {
        if self.direct_map.is_some() && !self.mmio.contains(virt) {
            return Ok(());
        }
        self.unmap_mmio(mapper, virt, size)
    }

    // -- drivers --------------------------------------------------------------------------------

    /// Reserves and backs `size` bytes for a driver image named `name`.
    pub fn allocate_driver(
        &self,
        mapper: &Mapper<'_>,
        name: &str,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let chunks = self.drivers.chunks_for(size);
        let bytes = chunks * self.drivers.chunk_size();
        let base = self.drivers.allocate_chunks(chunks)?;

        for page in 0..bytes / PAGE_SIZE {
            let backed = mapper
                .get_or_create_page(Self::kernel(mapper), base + page * PAGE_SIZE)
                .and_then(|handle| mapper.allocate_page(&handle, MapFlags::KERNEL));
            if let Err(err) = backed {
                self.release_driver_pages(mapper, base, page);
                let _ = self.drivers.free_chunks(base, chunks);
                return Err(err);
            }
        }

        log::info!("regions: driver {name} at {base} ({bytes:#x} bytes)");
        self.loaded.lock().push(DriverRegion {
            name: String::from(name),
            base,
            size: bytes,
        });
        Ok(base)
    }

    fn release_driver_pages(&self, mapper: &Mapper<'_>, base: VirtualAddress, pages: usize) {
        for page in 0..pages {
            let address = base + page * PAGE_SIZE;
            let Ok(Some(handle)) = mapper.get_page(Self::kernel(mapper), address, Lookup::Existing)
            else {
                continue;
            };
            if let Err(err) = mapper.free_page(&handle) {
                log::warn!("regions: leaking driver page {address}: {err}");
            }
        }
    }

    pub fn free_driver(&self, mapper: &Mapper<'_>, base: VirtualAddress) -> Result<(), MemoryError> {
        let region = {
            let mut loaded = self.loaded.lock();
            let index = loaded
                .iter()
                .position(|region| region.base == base)
                .ok_or(MemoryError::NotAllocated)?;
            loaded.swap_remove(index)
        };
        self.release_driver_pages(mapper, region.base, region.size / PAGE_SIZE);
        self.drivers
            .free_chunks(region.base, self.drivers.chunks_for(region.size))
    }

    /// Calls `f` with the name of the driver containing `address` and the offset into it.
    ///
    /// Used from the panic path, so it gives up rather than wait on the registry lock.
    pub fn resolve_driver<R>(
        &self,
        address: VirtualAddress,
        f: impl FnOnce(&str, usize) -> R,
    ) -> Option<R> {
        let loaded = self.loaded.try_lock()?;
        let region = loaded.iter().find(|region| region.contains(address))?;
        Some(f(&region.name, address - region.base))
    }

    pub fn drivers(&self) -> Vec<DriverRegion> {
        self.loaded.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    const MEMORY: usize = 8 * 1024 * 1024;

    fn setup() -> (Mapper<'static>, Regions) {
        let layout = MemoryLayout::i386();
        (Mapper::emulated(&layout, MEMORY).unwrap(), Regions::new(&layout))
    }

    #[test]
    fn dma_buffers_are_contiguous_and_uncached() {
        let (mapper, regions) = setup();
        let before = mapper.frame_stats();
        let buffer = regions.allocate_dma(&mapper, 3 * PAGE_SIZE - 100).unwrap();
        assert_eq!(buffer.size, 3 * PAGE_SIZE);
        assert!(regions.dma_pool().contains(buffer.virt));
        assert_eq!(mapper.frame_stats().used, before.used + 3);

        for page in 0..3 {
            let offset = page * PAGE_SIZE;
            assert_eq!(mapper.translate(None, buffer.virt + offset), Some(buffer.phys + offset));
            let handle = mapper
                .get_page(None, buffer.virt + offset, Lookup::Existing)
                .unwrap()
                .unwrap();
            let entry = mapper.entry(&handle);
            assert!(entry.is_no_cache() && !entry.is_user());
        }

        regions.free_dma(&mapper, buffer).unwrap();
        assert_eq!(mapper.frame_stats(), before);
        assert_eq!(regions.dma_pool().used(), 0);
        assert!(!mapper.is_mapped(None, buffer.virt));
    }

    #[test]
    fn dma_free_follows_the_mapping() {
        let (mapper, regions) = setup();
        let before = mapper.frame_stats();
        let buffer = regions.allocate_dma(&mapper, 2 * PAGE_SIZE).unwrap();
        let bystander = mapper.allocate_frame().unwrap();

        let stale = DmaBuffer {
            phys: bystander,
            ..buffer
        };
        regions.free_dma(&mapper, stale).unwrap();
        assert!(mapper.frames().is_allocated(bystander.frame_number()));
        assert!(!mapper.frames().is_allocated(buffer.phys.frame_number()));
        assert!(!mapper.frames().is_allocated((buffer.phys + PAGE_SIZE).frame_number()));

        assert_eq!(regions.free_dma(&mapper, buffer), Err(MemoryError::NotAllocated));
        mapper.free_frame(bystander).unwrap();
        assert_eq!(mapper.frame_stats(), before);
        assert_eq!(regions.dma_pool().used(), 0);
    }

    #[test]
    fn failed_dma_allocation_returns_its_chunk() {
        let (mapper, regions) = setup();
        let too_big = MEMORY - PAGE_SIZE;
        // The DMA window is 8 MiB, so the pool can hold it but memory cannot.
        assert_eq!(regions.allocate_dma(&mapper, too_big), Err(MemoryError::OutOfMemory));
        assert_eq!(regions.dma_pool().used(), 0);
    }

    #[test]
    fn mmio_keeps_page_offset() {
        let (mapper, regions) = setup();
        let phys = PhysicalAddress::new(0xFEE0_0020);
        let virt = regions.map_mmio(&mapper, phys, 0x10).unwrap();
        assert_eq!(virt.page_offset(), 0x20);
        assert_eq!(mapper.translate(None, virt), Some(phys));

        let handle = mapper.get_page(None, virt, Lookup::Existing).unwrap().unwrap();
        let entry = mapper.entry(&handle);
        assert!(entry.is_no_cache() && entry.is_write_through() && entry.is_foreign());

        let used = mapper.frame_stats().used;
        regions.unmap_mmio(&mapper, virt, 0x10).unwrap();
        assert!(!mapper.is_mapped(None, virt));
        assert_eq!(mapper.frame_stats().used, used);
        assert_eq!(regions.mmio_pool().used(), 0);
    }

    #[test]
    fn remap_phys_prefers_direct_map() {
        let layout = MemoryLayout::i386().with_direct_map(0xC000_0000);
        let mapper = Mapper::emulated(&layout, MEMORY).unwrap();
        let regions = Regions::new(&layout);
        let virt = regions
            .remap_phys(&mapper, PhysicalAddress::new(0x1000), PAGE_SIZE)
            .unwrap();
        assert_eq!(virt, VirtualAddress::new(0xC000_1000));
        assert_eq!(regions.mmio_pool().used(), 0);
        regions.unmap_phys(&mapper, virt, PAGE_SIZE).unwrap();

        let (mapper, regions) = setup();
        let virt = regions
            .remap_phys(&mapper, PhysicalAddress::new(0x1000), PAGE_SIZE)
            .unwrap();
        assert!(regions.mmio_pool().contains(virt));
        regions.unmap_phys(&mapper, virt, PAGE_SIZE).unwrap();
        assert_eq!(regions.mmio_pool().used(), 0);
    }

    #[test]
    fn drivers_are_registered_and_resolved() {
        let (mapper, regions) = setup();
        let before = mapper.frame_stats();
        let base = regions.allocate_driver(&mapper, "ahci", 2 * PAGE_SIZE).unwrap();
        assert!(mapper.is_mapped(None, base + PAGE_SIZE));
        assert_eq!(mapper.frame_stats().used, before.used + 2);

        let hit = regions.resolve_driver(base + 0x1234, |name, offset| (name.to_string(), offset));
        assert_eq!(hit, Some(("ahci".to_string(), 0x1234)));
        assert_eq!(regions.resolve_driver(base + 2 * PAGE_SIZE, |_, offset| offset), None);

        regions.free_driver(&mapper, base).unwrap();
        assert_eq!(mapper.frame_stats(), before);
        assert!(regions.drivers().is_empty());
        assert_eq!(regions.free_driver(&mapper, base), Err(MemoryError::NotAllocated));
    }

    #[test]
    #[should_panic(expected = "POOL_MISCONFIGURED")]
    fn unaligned_chunk_is_fatal() {
        let mut layout = MemoryLayout::i386();
        layout.dma_chunk = 100;
        Regions::new(&layout);
    }
}
