//! Physical memory manager using a frame bitmap.
//!
//! One bit per 4 KiB frame, set meaning "in use". The manager starts with every frame marked
//! used; boot code then releases the ranges the firmware memory map reports as RAM. Anything the
//! map does not mention (MMIO holes, ACPI tables, bootloader structures) therefore stays reserved.
//!
//! Allocation is first-fit from the lowest frame, so a given bitmap state always yields the same
//! frame. The manager itself is not synchronized; [`Mapper`](crate::Mapper) owns it behind a
//! `spin::Mutex`.

use crate::{Bitmap, FrameNumber, MemoryError, PAGE_SIZE, PhysicalAddress};

pub struct PhysicalMemoryManager<'a> {
    frames: Bitmap<&'a mut [u32]>,
    max_blocks: usize,
    used_blocks: usize,
}

impl<'a> PhysicalMemoryManager<'a> {
    /// Number of `u32` words of bitmap storage needed to track `memory_size` bytes.
    pub const fn storage_words(memory_size: usize) -> usize {
        Bitmap::<&mut [u32]>::words_for(memory_size / PAGE_SIZE)
    }

    /// Creates a manager for `memory_size` bytes of physical memory with every frame in use.
    ///
    /// `storage` must hold at least [`storage_words`](Self::storage_words) words.
    pub fn new(memory_size: usize, storage: &'a mut [u32]) -> Result<Self, MemoryError> {
        let max_blocks = memory_size / PAGE_SIZE;
        let mut frames =
            Bitmap::from_words(storage, max_blocks).ok_or(MemoryError::InvalidArgument)?;
        frames.fill(true);

        log::debug!(
            "pmm: tracking {} frames ({} KiB)",
            max_blocks,
            max_blocks * PAGE_SIZE / 1024
        );

        Ok(Self {
            frames,
            max_blocks,
            used_blocks: max_blocks,
        })
    }

    /// Marks the whole frames inside `[base, base + size)` as available.
    ///
    /// Partial frames at either end stay reserved.
    pub fn initialize_region(&mut self, base: PhysicalAddress, size: usize) {
        if size == 0 {
            return;
        }
        let Some(end) = base.checked_add(size) else {
            return;
        };
        let first = base.align_up(PAGE_SIZE).as_usize() / PAGE_SIZE;
        let last = (end.align_down(PAGE_SIZE).as_usize() / PAGE_SIZE).min(self.max_blocks);

        for frame in first..last {
            if self.frames.test(frame) {
                self.frames.clear(frame);
                self.used_blocks -= 1;
            }
        }
        log::trace!("pmm: region {}+{:#x} available", base, size);
    }

    /// Marks every frame touching `[base, base + size)` as reserved.
    pub fn deinitialize_region(&mut self, base: PhysicalAddress, size: usize) {
        if size == 0 {
            return;
        }
        let end = base.checked_add(size).unwrap_or(PhysicalAddress::new(usize::MAX));
        let first = base.align_down(PAGE_SIZE).as_usize() / PAGE_SIZE;
        let last = end.as_usize().div_ceil(PAGE_SIZE).min(self.max_blocks);

        for frame in first..last {
            if !self.frames.test(frame) {
                self.frames.set(frame);
                self.used_blocks += 1;
            }
        }
        log::trace!("pmm: region {}+{:#x} reserved", base, size);
    }

    /// Returns the lowest free frame without allocating it.
    pub fn find_first_frame(&self) -> Result<FrameNumber, MemoryError> {
        self.frames
            .first_clear()
            .map(FrameNumber::new)
            .ok_or(MemoryError::OutOfMemory)
    }

    /// Returns the start of the lowest run of `count` free frames without allocating it.
    pub fn find_first_frames(&self, count: usize) -> Result<FrameNumber, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        self.frames
            .first_clear_run(count)
            .map(FrameNumber::new)
            .ok_or(MemoryError::OutOfMemory)
    }

    pub fn allocate_frame(&mut self) -> Result<FrameNumber, MemoryError> {
        self.allocate_frames(1)
    }

    /// Allocates `count` physically contiguous frames.
    pub fn allocate_frames(&mut self, count: usize) -> Result<FrameNumber, MemoryError> {
        let first = self.find_first_frames(count)?;
        for frame in first.as_usize()..first.as_usize() + count {
            self.frames.set(frame);
        }
        self.used_blocks += count;
        Ok(first)
    }

    /// Releases one frame.
    ///
    /// Releasing a frame that is outside the managed range or already free is logged and ignored.
    pub fn free_frame(&mut self, frame: FrameNumber) -> Result<(), MemoryError> {
        self.free_frames(frame, 1)
    }

    pub fn free_frames(&mut self, first: FrameNumber, count: usize) -> Result<(), MemoryError> {
        let start = first.as_usize();
        let end = start.checked_add(count).ok_or(MemoryError::InvalidRange)?;
        if end > self.max_blocks {
            log::warn!("pmm: ignoring free of frames {start}..{end} beyond {}", self.max_blocks);
            return Err(MemoryError::InvalidRange);
        }
        if let Some(frame) = (start..end).find(|&frame| !self.frames.test(frame)) {
            log::warn!("pmm: ignoring free of frame {frame} which is not allocated");
            return Err(MemoryError::NotAllocated);
        }
        for frame in start..end {
            self.frames.clear(frame);
        }
        self.used_blocks -= count;
        Ok(())
    }

    /// Allocates one frame and returns its physical address.
    pub fn allocate_block(&mut self) -> Result<PhysicalAddress, MemoryError> {
        self.allocate_frame().map(FrameNumber::start)
    }

    pub fn allocate_blocks(&mut self, count: usize) -> Result<PhysicalAddress, MemoryError> {
        self.allocate_frames(count).map(FrameNumber::start)
    }

    /// Releases the frame starting at `addr`.
    ///
    /// Null and unaligned addresses are rejected with a warning and leave the bitmap unchanged.
    pub fn free_block(&mut self, addr: PhysicalAddress) -> Result<(), MemoryError> {
        self.free_blocks(addr, 1)
    }

    pub fn free_blocks(&mut self, addr: PhysicalAddress, count: usize) -> Result<(), MemoryError> {
        if addr.is_null() {
            log::warn!("pmm: ignoring free of null block");
            return Err(MemoryError::InvalidArgument);
        }
        if !addr.is_page_aligned() {
            log::warn!("pmm: ignoring free of unaligned block {addr}");
            return Err(MemoryError::BadAlignment);
        }
        self.free_frames(addr.frame_number(), count)
    }

    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        frame.as_usize() >= self.max_blocks || self.frames.test(frame.as_usize())
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    pub fn free_blocks_count(&self) -> usize {
        self.max_blocks - self.used_blocks
    }

    /// Bytes of physical memory covered by the bitmap.
    pub fn memory_size(&self) -> usize {
        self.max_blocks * PAGE_SIZE
    }

    #[cfg(test)]
    pub(crate) fn bitmap_popcount(&self) -> usize {
        self.frames.count_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bugcode, OrFatal};

    fn setup(frames: usize, storage: &mut [u32]) -> PhysicalMemoryManager<'_> {
        let mut pmm = PhysicalMemoryManager::new(frames * PAGE_SIZE, storage).unwrap();
        pmm.initialize_region(PhysicalAddress::new(0), frames * PAGE_SIZE);
        pmm
    }

    fn assert_consistent(pmm: &PhysicalMemoryManager<'_>) {
        assert_eq!(pmm.used_blocks(), pmm.bitmap_popcount());
        assert_eq!(pmm.free_blocks_count() + pmm.used_blocks(), pmm.max_blocks());
    }

    #[test]
    fn starts_fully_reserved() {
        let mut storage = [0u32; 4];
        let pmm = PhysicalMemoryManager::new(100 * PAGE_SIZE, &mut storage).unwrap();
        assert_eq!(pmm.max_blocks(), 100);
        assert_eq!(pmm.used_blocks(), 100);
        assert_eq!(pmm.find_first_frame(), Err(MemoryError::OutOfMemory));
        assert_consistent(&pmm);
    }

    #[test]
    fn rejects_short_storage() {
        let mut storage = [0u32; 1];
        assert!(PhysicalMemoryManager::new(64 * PAGE_SIZE, &mut storage).is_err());
        assert_eq!(PhysicalMemoryManager::storage_words(64 * PAGE_SIZE), 2);
    }

    #[test]
    fn eight_frame_scenario() {
        let mut storage = [0u32; 1];
        let mut pmm = setup(8, &mut storage);

        assert_eq!(pmm.allocate_frames(3), Ok(FrameNumber::new(0)));
        for frame in 0..3 {
            assert!(pmm.is_allocated(FrameNumber::new(frame)));
        }

        pmm.free_frame(FrameNumber::new(1)).unwrap();
        assert!(!pmm.is_allocated(FrameNumber::new(1)));
        assert_eq!(pmm.used_blocks(), 2);

        assert_eq!(pmm.allocate_frame(), Ok(FrameNumber::new(1)));
        assert_eq!(pmm.allocate_frames(10), Err(MemoryError::OutOfMemory));
        assert_consistent(&pmm);
    }

    #[test]
    #[should_panic(expected = "OUT_OF_MEMORY")]
    fn exhaustion_is_fatal_through_the_wrapper() {
        let mut storage = [0u32; 1];
        let mut pmm = setup(8, &mut storage);
        pmm.allocate_blocks(10).or_fatal("pmm");
    }

    #[test]
    fn consecutive_allocations_are_distinct() {
        let mut storage = [0u32; 2];
        let mut pmm = setup(64, &mut storage);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..64 {
            assert!(seen.insert(pmm.allocate_block().unwrap()));
        }
        assert_eq!(pmm.allocate_block(), Err(MemoryError::OutOfMemory));
        assert_consistent(&pmm);
    }

    #[test]
    fn counters_track_bitmap_through_mixed_operations() {
        let mut storage = [0u32; 2];
        let mut pmm = setup(50, &mut storage);
        let a = pmm.allocate_blocks(4).unwrap();
        let b = pmm.allocate_block().unwrap();
        assert_consistent(&pmm);
        pmm.free_frames(a.frame_number(), 4).unwrap();
        assert_consistent(&pmm);
        pmm.deinitialize_region(PhysicalAddress::new(0x8000), 3 * PAGE_SIZE);
        assert_consistent(&pmm);
        pmm.free_block(b).unwrap();
        pmm.initialize_region(PhysicalAddress::new(0x8000), 3 * PAGE_SIZE);
        assert_consistent(&pmm);
        assert_eq!(pmm.used_blocks(), 0);
    }

    #[test]
    fn reserve_after_release_wins() {
        let mut storage = [0u32; 2];
        let mut pmm = PhysicalMemoryManager::new(40 * PAGE_SIZE, &mut storage).unwrap();
        let base = PhysicalAddress::new(0x3800);
        let len = 5 * PAGE_SIZE;
        pmm.initialize_region(base, len);
        pmm.deinitialize_region(base, len);
        for frame in base.frame_number().as_usize()..=(base + len - 1).frame_number().as_usize() {
            assert!(pmm.is_allocated(FrameNumber::new(frame)));
        }
        assert_consistent(&pmm);
    }

    #[test]
    fn region_edges_are_conservative() {
        let mut storage = [0u32; 1];
        let mut pmm = PhysicalMemoryManager::new(16 * PAGE_SIZE, &mut storage).unwrap();
        // Only frames 2 and 3 lie wholly inside [0x1800, 0x4800).
        pmm.initialize_region(PhysicalAddress::new(0x1800), 0x3000);
        assert_eq!(pmm.free_blocks_count(), 2);
        assert_eq!(pmm.find_first_frame(), Ok(FrameNumber::new(2)));

        // Regions running past the end are clipped.
        pmm.initialize_region(PhysicalAddress::new(14 * PAGE_SIZE), 8 * PAGE_SIZE);
        assert_eq!(pmm.free_blocks_count(), 4);
        assert_consistent(&pmm);
    }

    #[test]
    fn zero_base_and_zero_size_are_tolerated() {
        let mut storage = [0u32; 1];
        let mut pmm = PhysicalMemoryManager::new(8 * PAGE_SIZE, &mut storage).unwrap();
        pmm.initialize_region(PhysicalAddress::new(0), 0);
        assert_eq!(pmm.used_blocks(), 8);
        pmm.initialize_region(PhysicalAddress::new(0), 2 * PAGE_SIZE);
        assert_eq!(pmm.used_blocks(), 6);
        pmm.deinitialize_region(PhysicalAddress::new(0), 0);
        assert_eq!(pmm.used_blocks(), 6);
    }

    #[test]
    fn bad_frees_are_ignored() {
        let mut storage = [0u32; 1];
        let mut pmm = setup(8, &mut storage);
        let block = pmm.allocate_block().unwrap();
        let other = pmm.allocate_block().unwrap();
        let used = pmm.used_blocks();

        assert_eq!(pmm.free_block(PhysicalAddress::NULL), Err(MemoryError::InvalidArgument));
        assert_eq!(pmm.free_block(other + 12), Err(MemoryError::BadAlignment));
        assert_eq!(
            pmm.free_block(PhysicalAddress::new(64 * PAGE_SIZE)),
            Err(MemoryError::InvalidRange)
        );
        assert_eq!(pmm.used_blocks(), used);

        pmm.free_frame(block.frame_number()).unwrap();
        assert_eq!(pmm.free_frame(block.frame_number()), Err(MemoryError::NotAllocated));
        assert_eq!(pmm.used_blocks(), used - 1);
        assert_consistent(&pmm);
    }

    #[test]
    fn exhaustion_maps_to_out_of_memory_bugcode() {
        assert_eq!(Bugcode::from(MemoryError::OutOfMemory), Bugcode::OutOfMemory);
    }
}
