//! The kernel heap.
//!
//! Two layers share one lock. The page hooks ([`KernelHeap::allocate_pages`] and
//! [`KernelHeap::free_pages`]) hand out runs of backed pages from the heap window, scanning forward
//! from a cursor that only moves back when pages below it are freed. On top of them sits a
//! liballoc-style first-fit allocator: each run of pages is a *major* block with an in-band header,
//! carved into *minor* blocks that each carry their own header in front of the returned pointer.
//!
//! Headers are plain `u64` words reached through the [`Mapper`], so the same code runs against
//! emulated memory in tests.

use core::ptr;

use crate::{Directory, Lookup, MapFlags, Mapper, MemoryError, PAGE_SIZE, VirtualAddress};

const MAGIC: u64 = 0xC001_C0DE_C001_C0DE;
const DEAD: u64 = 0xDEAD_DEAD_DEAD_DEAD;
const ALIGN_MAGIC: u64 = 0xA11C_A11C_A11C_A11C;

/// Native alignment of every pointer the heap returns.
pub const HEAP_ALIGN: usize = 16;
/// Smallest major block, in pages.
const MIN_MAJOR_PAGES: usize = 4;

// Major header words.
const MAJOR_PREV: usize = 0;
const MAJOR_NEXT: usize = 1;
const MAJOR_PAGES: usize = 2;
const MAJOR_SIZE: usize = 3;
const MAJOR_USAGE: usize = 4;
const MAJOR_FIRST: usize = 5;
const MAJOR_HEADER: usize = 48;

// Minor header words.
const MINOR_MAGIC: usize = 0;
const MINOR_PREV: usize = 1;
const MINOR_NEXT: usize = 2;
const MINOR_MAJOR: usize = 3;
const MINOR_SIZE: usize = 4;
const MINOR_REQUESTED: usize = 5;
const MINOR_HEADER: usize = 48;

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Pages currently backed by the page hooks.
    pub pages: usize,
    /// Sum of the sizes callers asked for, over live allocations.
    pub requested: usize,
    /// Bytes taken by live allocations including their headers.
    pub in_use: usize,
    pub allocations: usize,
    pub frees: usize,
}

/// Identification reported by the boot banner and debugger handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub capabilities: u32,
}

impl AllocatorInfo {
    pub const REALLOC: u32 = 1 << 0;
    pub const ALIGNED: u32 = 1 << 1;
    pub const STATISTICS: u32 = 1 << 2;

    pub const fn has(&self, capability: u32) -> bool {
        self.capabilities & capability == capability
    }
}

const INFO: AllocatorInfo = AllocatorInfo {
    name: "liballoc",
    version: "1.1",
    capabilities: AllocatorInfo::REALLOC | AllocatorInfo::ALIGNED | AllocatorInfo::STATISTICS,
};

struct HeapState {
    cursor: VirtualAddress,
    first_major: u64,
    stats: HeapStats,
}

pub struct KernelHeap {
    start: VirtualAddress,
    end: VirtualAddress,
    state: spin::Mutex<HeapState>,
}

/// Word access to heap memory through the kernel directory.
struct Words<'m, 'a> {
    mapper: &'m Mapper<'a>,
    directory: Directory,
    direct: bool,
}

impl<'m, 'a> Words<'m, 'a> {
    fn new(mapper: &'m Mapper<'a>) -> Self {
        Self {
            mapper,
            directory: mapper.kernel_directory(),
            direct: mapper.translator().is_hardware(),
        }
    }

    /// Whether the page holding `address` is backed, so reading it cannot fault.
    fn is_backed(&self, address: usize) -> Result<bool, MemoryError> {
        let page = self
            .mapper
            .get_page(Some(self.directory), VirtualAddress::new(address), Lookup::Existing)?;
        Ok(page.is_some_and(|page| self.mapper.entry(&page).is_present()))
    }

    fn read(&self, block: u64, word: usize) -> Result<u64, MemoryError> {
        let at = VirtualAddress::new(block as usize + word * 8);
        if self.direct {
            // SAFETY: heap headers live in kernel space, which every directory maps.
            Ok(unsafe { ptr::read_volatile(at.as_ptr::<u64>()) })
        } else {
            self.mapper.read_u64(Some(self.directory), at)
        }
    }

    fn write(&self, block: u64, word: usize, value: u64) -> Result<(), MemoryError> {
        let at = VirtualAddress::new(block as usize + word * 8);
        if self.direct {
            // SAFETY: as for `read`.
            unsafe { ptr::write_volatile(at.as_mut_ptr::<u64>(), value) };
            Ok(())
        } else {
            self.mapper.write_u64(Some(self.directory), at, value)
        }
    }
}

/// `size` rounded up to [`HEAP_ALIGN`], or `None` if that overflows.
const fn round_up(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(HEAP_ALIGN)
}

impl KernelHeap {
    /// Creates an empty heap over `[start, end)`. Nothing is mapped until the first allocation.
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            start,
            end,
            state: spin::Mutex::new(HeapState {
                cursor: start,
                first_major: 0,
                stats: HeapStats {
                    pages: 0,
                    requested: 0,
                    in_use: 0,
                    allocations: 0,
                    frees: 0,
                },
            }),
        }
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    pub fn end(&self) -> VirtualAddress {
        self.end
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.start && address < self.end
    }

    pub fn stats(&self) -> HeapStats {
        self.state.lock().stats
    }

    pub fn allocator_info(&self) -> AllocatorInfo {
        INFO
    }

    // -- page hooks -----------------------------------------------------------------------------

    /// Backs `count` adjacent pages of the heap window and returns the first.
    pub fn allocate_pages(
        &self,
        mapper: &Mapper<'_>,
        count: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        let mut state = self.state.lock();
        self.allocate_pages_locked(mapper, &mut state, count)
    }

    /// Unbacks `count` pages starting at `address`, which must have come from
    /// [`allocate_pages`](Self::allocate_pages).
    pub fn free_pages(
        &self,
        mapper: &Mapper<'_>,
        address: VirtualAddress,
        count: usize,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        self.free_pages_locked(mapper, &mut state, address, count)
    }

    fn is_backed(&self, mapper: &Mapper<'_>, address: VirtualAddress) -> Result<bool, MemoryError> {
        let page = mapper.get_page(Some(mapper.kernel_directory()), address, Lookup::Existing)?;
        Ok(page.is_some_and(|page| mapper.entry(&page).is_present()))
    }

    fn allocate_pages_locked(
        &self,
        mapper: &Mapper<'_>,
        state: &mut HeapState,
        count: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let bytes = count
            .checked_mul(PAGE_SIZE)
            .ok_or(MemoryError::OutOfMemory)?;

        while state.cursor < self.end && self.is_backed(mapper, state.cursor)? {
            state.cursor = state.cursor + PAGE_SIZE;
        }

        let mut candidate = state.cursor;
        'scan: loop {
            if candidate.as_usize() > self.end.as_usize().saturating_sub(bytes) {
                log::warn!("heap: window exhausted looking for {count} pages");
                return Err(MemoryError::OutOfMemory);
            }
            for page in 0..count {
                let address = candidate + page * PAGE_SIZE;
                if self.is_backed(mapper, address)? {
                    candidate = address + PAGE_SIZE;
                    continue 'scan;
                }
            }
            break;
        }

        let directory = Some(mapper.kernel_directory());
        for page in 0..count {
            let address = candidate + page * PAGE_SIZE;
            let backed = mapper
                .get_or_create_page(directory, address)
                .and_then(|handle| mapper.allocate_page(&handle, MapFlags::KERNEL));
            if let Err(err) = backed {
                for done in 0..page {
                    if let Ok(Some(handle)) =
                        mapper.get_page(directory, candidate + done * PAGE_SIZE, Lookup::Existing)
                    {
                        let _ = mapper.free_page(&handle);
                    }
                }
                return Err(err);
            }
        }

        if candidate == state.cursor {
            state.cursor = candidate + bytes;
        }
        state.stats.pages += count;
        log::trace!("heap: backed {count} pages at {candidate}");
        Ok(candidate)
    }

    fn free_pages_locked(
        &self,
        mapper: &Mapper<'_>,
        state: &mut HeapState,
        address: VirtualAddress,
        count: usize,
    ) -> Result<(), MemoryError> {
        if !address.is_page_aligned() {
            return Err(MemoryError::BadAlignment);
        }
        let in_window = address
            .checked_add(count * PAGE_SIZE)
            .is_some_and(|end| self.contains(address) && end <= self.end);
        if !in_window {
            log::warn!("heap: ignoring free of {count} pages at {address} outside the heap");
            return Err(MemoryError::InvalidRange);
        }

        let directory = Some(mapper.kernel_directory());
        let mut freed = 0;
        for page in 0..count {
            let Some(handle) = mapper.get_page(directory, address + page * PAGE_SIZE, Lookup::Existing)?
            else {
                continue;
            };
            if mapper.entry(&handle).is_present() {
                mapper.free_page(&handle)?;
                freed += 1;
            }
        }

        if address < state.cursor {
            state.cursor = address;
        }
        state.stats.pages = state.stats.pages.saturating_sub(freed);
        log::trace!("heap: released {freed} pages at {address}");
        Ok(())
    }

    // -- allocator ------------------------------------------------------------------------------

    /// Allocates `size` bytes aligned to [`HEAP_ALIGN`].
    pub fn kmalloc(&self, mapper: &Mapper<'_>, size: usize) -> Result<VirtualAddress, MemoryError> {
        let mut state = self.state.lock();
        self.kmalloc_locked(mapper, &mut state, size)
    }

    fn kmalloc_locked(
        &self,
        mapper: &Mapper<'_>,
        state: &mut HeapState,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let words = Words::new(mapper);
        let Some((capacity, need, major_need)) = round_up(size).and_then(|capacity| {
            let need = capacity.checked_add(MINOR_HEADER)?;
            Some((capacity, need, need.checked_add(MAJOR_HEADER)?))
        }) else {
            log::warn!("heap: request for {size} bytes is larger than the address space");
            return Err(MemoryError::OutOfMemory);
        };

        let mut major = state.first_major;
        let mut last = 0;
        while major != 0 {
            let total = words.read(major, MAJOR_SIZE)? as usize;
            let usage = words.read(major, MAJOR_USAGE)? as usize;
            if total - usage >= need {
                if let Some((at, prev, next)) = self.find_gap(&words, major, total, need)? {
                    return self.place(&words, state, major, at, prev, next, size, capacity);
                }
            }
            last = major;
            major = words.read(major, MAJOR_NEXT)?;
        }

        let pages = major_need.div_ceil(PAGE_SIZE).max(MIN_MAJOR_PAGES);
        let block = self.allocate_pages_locked(mapper, state, pages)?.as_usize() as u64;
        words.write(block, MAJOR_PREV, last)?;
        words.write(block, MAJOR_NEXT, 0)?;
        words.write(block, MAJOR_PAGES, pages as u64)?;
        words.write(block, MAJOR_SIZE, (pages * PAGE_SIZE) as u64)?;
        words.write(block, MAJOR_USAGE, MAJOR_HEADER as u64)?;
        words.write(block, MAJOR_FIRST, 0)?;
        if last == 0 {
            state.first_major = block;
        } else {
            words.write(last, MAJOR_NEXT, block)?;
        }
        log::debug!("heap: new major block at {block:#x} ({pages} pages)");

        let at = block + MAJOR_HEADER as u64;
        self.place(&words, state, block, at, 0, 0, size, capacity)
    }

    /// First gap in `major` that fits `need` bytes, as (address, previous minor, next minor).
    fn find_gap(
        &self,
        words: &Words<'_, '_>,
        major: u64,
        total: usize,
        need: usize,
    ) -> Result<Option<(u64, u64, u64)>, MemoryError> {
        let end = major + total as u64;
        let mut gap_start = major + MAJOR_HEADER as u64;
        let mut prev = 0;
        let mut minor = words.read(major, MAJOR_FIRST)?;
        loop {
            let gap_end = if minor == 0 { end } else { minor };
            if gap_end - gap_start >= need as u64 {
                return Ok(Some((gap_start, prev, minor)));
            }
            if minor == 0 {
                return Ok(None);
            }
            gap_start = minor + (MINOR_HEADER as u64) + words.read(minor, MINOR_SIZE)?;
            prev = minor;
            minor = words.read(minor, MINOR_NEXT)?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn place(
        &self,
        words: &Words<'_, '_>,
        state: &mut HeapState,
        major: u64,
        at: u64,
        prev: u64,
        next: u64,
        size: usize,
        capacity: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        words.write(at, MINOR_MAGIC, MAGIC)?;
        words.write(at, MINOR_PREV, prev)?;
        words.write(at, MINOR_NEXT, next)?;
        words.write(at, MINOR_MAJOR, major)?;
        words.write(at, MINOR_SIZE, capacity as u64)?;
        words.write(at, MINOR_REQUESTED, size as u64)?;
        if prev == 0 {
            words.write(major, MAJOR_FIRST, at)?;
        } else {
            words.write(prev, MINOR_NEXT, at)?;
        }
        if next != 0 {
            words.write(next, MINOR_PREV, at)?;
        }
        let usage = words.read(major, MAJOR_USAGE)?;
        words.write(major, MAJOR_USAGE, usage + (capacity + MINOR_HEADER) as u64)?;

        state.stats.requested += size;
        state.stats.in_use += capacity + MINOR_HEADER;
        state.stats.allocations += 1;
        Ok(VirtualAddress::new(at as usize + MINOR_HEADER))
    }

    /// Finds the live minor header in front of `ptr`.
    fn minor_of(&self, words: &Words<'_, '_>, ptr: VirtualAddress) -> Result<u64, MemoryError> {
        if !self.contains(ptr) || ptr.as_usize() < self.start.as_usize() + MAJOR_HEADER + MINOR_HEADER
        {
            log::warn!("heap: {ptr} is not a heap pointer");
            return Err(MemoryError::InvalidRange);
        }
        let minor = (ptr.as_usize() - MINOR_HEADER) as u64;
        if !words.is_backed(minor as usize)? {
            log::warn!("heap: double free of {ptr}, its block is already released");
            return Err(MemoryError::NotAllocated);
        }
        match words.read(minor, MINOR_MAGIC)? {
            MAGIC => Ok(minor),
            DEAD => {
                log::warn!("heap: double free of {ptr}");
                Err(MemoryError::NotAllocated)
            }
            other => {
                log::warn!("heap: bad magic {other:#x} in front of {ptr}");
                Err(MemoryError::InvalidArgument)
            }
        }
    }

    /// Returns the raw allocation behind a pointer from [`kmalloc_aligned`](Self::kmalloc_aligned),
    /// or `None` for ordinary pointers.
    fn unwrap_aligned(
        &self,
        words: &Words<'_, '_>,
        ptr: VirtualAddress,
    ) -> Result<Option<VirtualAddress>, MemoryError> {
        if !self.contains(ptr) || ptr.as_usize() < self.start.as_usize() + 16 {
            return Ok(None);
        }
        let header = (ptr.as_usize() - 16) as u64;
        if !words.is_backed(header as usize)? || words.read(header, 0)? != ALIGN_MAGIC {
            return Ok(None);
        }
        let raw = words.read(header, 1)?;
        Ok(Some(VirtualAddress::new(raw as usize)))
    }

    /// Frees a pointer returned by [`kmalloc`](Self::kmalloc), [`krealloc`](Self::krealloc) or
    /// [`kmalloc_aligned`](Self::kmalloc_aligned). Null is ignored.
    pub fn kfree(&self, mapper: &Mapper<'_>, ptr: VirtualAddress) -> Result<(), MemoryError> {
        if ptr.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let words = Words::new(mapper);
        let ptr = match self.unwrap_aligned(&words, ptr)? {
            Some(raw) => {
                words.write((ptr.as_usize() - 16) as u64, 0, 0)?;
                raw
            }
            None => ptr,
        };
        self.kfree_locked(mapper, &mut state, ptr)
    }

    fn kfree_locked(
        &self,
        mapper: &Mapper<'_>,
        state: &mut HeapState,
        ptr: VirtualAddress,
    ) -> Result<(), MemoryError> {
        let words = Words::new(mapper);
        let minor = self.minor_of(&words, ptr)?;
        let major = words.read(minor, MINOR_MAJOR)?;
        let prev = words.read(minor, MINOR_PREV)?;
        let next = words.read(minor, MINOR_NEXT)?;
        let capacity = words.read(minor, MINOR_SIZE)? as usize;
        let requested = words.read(minor, MINOR_REQUESTED)? as usize;

        if prev == 0 {
            words.write(major, MAJOR_FIRST, next)?;
        } else {
            words.write(prev, MINOR_NEXT, next)?;
        }
        if next != 0 {
            words.write(next, MINOR_PREV, prev)?;
        }
        words.write(minor, MINOR_MAGIC, DEAD)?;
        let usage = words.read(major, MAJOR_USAGE)? - (capacity + MINOR_HEADER) as u64;
        words.write(major, MAJOR_USAGE, usage)?;

        state.stats.requested -= requested;
        state.stats.in_use -= capacity + MINOR_HEADER;
        state.stats.frees += 1;

        if words.read(major, MAJOR_FIRST)? == 0 {
            self.release_major(mapper, &words, state, major)?;
        }
        Ok(())
    }

    fn release_major(
        &self,
        mapper: &Mapper<'_>,
        words: &Words<'_, '_>,
        state: &mut HeapState,
        major: u64,
    ) -> Result<(), MemoryError> {
        let prev = words.read(major, MAJOR_PREV)?;
        let next = words.read(major, MAJOR_NEXT)?;
        let pages = words.read(major, MAJOR_PAGES)? as usize;
        if prev == 0 {
            state.first_major = next;
        } else {
            words.write(prev, MAJOR_NEXT, next)?;
        }
        if next != 0 {
            words.write(next, MAJOR_PREV, prev)?;
        }
        log::debug!("heap: releasing major block at {major:#x} ({pages} pages)");
        self.free_pages_locked(mapper, state, VirtualAddress::new(major as usize), pages)
    }

    /// Resizes an allocation. Null behaves like [`kmalloc`](Self::kmalloc); a size of zero frees
    /// and returns null. Shrinking, or growing within the block's slack, keeps the pointer.
    pub fn krealloc(
        &self,
        mapper: &Mapper<'_>,
        ptr: VirtualAddress,
        size: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if ptr.is_null() {
            return self.kmalloc(mapper, size);
        }
        let mut state = self.state.lock();
        let words = Words::new(mapper);
        if self.unwrap_aligned(&words, ptr)?.is_some() {
            return Err(MemoryError::InvalidArgument);
        }
        if size == 0 {
            self.kfree_locked(mapper, &mut state, ptr)?;
            return Ok(VirtualAddress::NULL);
        }

        let minor = self.minor_of(&words, ptr)?;
        let capacity = words.read(minor, MINOR_SIZE)? as usize;
        let requested = words.read(minor, MINOR_REQUESTED)? as usize;
        if round_up(size).is_some_and(|rounded| rounded <= capacity) {
            words.write(minor, MINOR_REQUESTED, size as u64)?;
            state.stats.requested = state.stats.requested - requested + size;
            return Ok(ptr);
        }

        let moved = self.kmalloc_locked(mapper, &mut state, size)?;
        for offset in (0..capacity).step_by(8) {
            let value = words.read(ptr.as_usize() as u64, offset / 8)?;
            words.write(moved.as_usize() as u64, offset / 8, value)?;
        }
        self.kfree_locked(mapper, &mut state, ptr)?;
        Ok(moved)
    }

    /// Allocates `size` bytes aligned to `align`, which must be a power of two.
    pub fn kmalloc_aligned(
        &self,
        mapper: &Mapper<'_>,
        size: usize,
        align: usize,
    ) -> Result<VirtualAddress, MemoryError> {
        if !align.is_power_of_two() {
            return Err(MemoryError::BadAlignment);
        }
        if align <= HEAP_ALIGN {
            return self.kmalloc(mapper, size);
        }
        let mut state = self.state.lock();
        let padded = size.checked_add(align).ok_or(MemoryError::OutOfMemory)?;
        let raw = self.kmalloc_locked(mapper, &mut state, padded)?;
        let aligned = (raw + 16).align_up(align);
        let words = Words::new(mapper);
        let header = (aligned.as_usize() - 16) as u64;
        words.write(header, 0, ALIGN_MAGIC)?;
        words.write(header, 1, raw.as_usize() as u64)?;
        Ok(aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLayout;

    const MEMORY: usize = 8 * 1024 * 1024;

    fn setup() -> (Mapper<'static>, KernelHeap) {
        let layout = MemoryLayout::i386();
        let mapper = Mapper::emulated(&layout, MEMORY).unwrap();
        let heap = KernelHeap::new(
            VirtualAddress::new(layout.kernel_heap.start),
            VirtualAddress::new(layout.kernel_heap.start + 64 * PAGE_SIZE),
        );
        (mapper, heap)
    }

    #[test]
    fn pages_grow_forward_and_cursor_moves_back_on_free() {
        let (mapper, heap) = setup();
        let a = heap.allocate_pages(&mapper, 2).unwrap();
        let b = heap.allocate_pages(&mapper, 3).unwrap();
        assert_eq!(a, heap.start());
        assert_eq!(b, a + 2 * PAGE_SIZE);
        assert!(mapper.is_mapped(None, b + 2 * PAGE_SIZE));
        assert_eq!(heap.stats().pages, 5);

        heap.free_pages(&mapper, a, 2).unwrap();
        assert!(!mapper.is_mapped(None, a));
        // The hole fits one or two pages but not three.
        assert_eq!(heap.allocate_pages(&mapper, 3).unwrap(), a + 5 * PAGE_SIZE);
        assert_eq!(heap.allocate_pages(&mapper, 1).unwrap(), a);
        assert_eq!(heap.stats().pages, 7);
    }

    #[test]
    fn page_hooks_return_frames() {
        let (mapper, heap) = setup();
        let before = mapper.frame_stats();
        let pages = heap.allocate_pages(&mapper, 4).unwrap();
        assert_eq!(mapper.frame_stats().used, before.used + 4);
        heap.free_pages(&mapper, pages, 4).unwrap();
        assert_eq!(mapper.frame_stats(), before);
        assert_eq!(
            heap.free_pages(&mapper, VirtualAddress::new(0x1000), 1),
            Err(MemoryError::InvalidRange)
        );
    }

    #[test]
    fn heap_window_is_bounded() {
        let (mapper, heap) = setup();
        assert_eq!(heap.allocate_pages(&mapper, 65), Err(MemoryError::OutOfMemory));
        heap.allocate_pages(&mapper, 64).unwrap();
        assert_eq!(heap.allocate_pages(&mapper, 1), Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn allocations_are_distinct_aligned_and_writable() {
        let (mapper, heap) = setup();
        let mut pointers = std::vec::Vec::new();
        for size in [1, 15, 16, 100, 4000, 24] {
            let ptr = heap.kmalloc(&mapper, size).unwrap();
            assert!(ptr.is_aligned(HEAP_ALIGN));
            mapper.write_bytes(None, ptr, &std::vec![0xAB; size]).unwrap();
            pointers.push((ptr, size));
        }
        for (i, (a, a_size)) in pointers.iter().enumerate() {
            for (b, b_size) in &pointers[i + 1..] {
                assert!(*a + *a_size <= *b || *b + *b_size <= *a, "{a} overlaps {b}");
            }
        }
        let stats = heap.stats();
        assert_eq!(stats.allocations, 6);
        assert_eq!(stats.requested, 1 + 15 + 16 + 100 + 4000 + 24);
    }

    #[test]
    fn freed_space_is_reused_first_fit() {
        let (mapper, heap) = setup();
        let a = heap.kmalloc(&mapper, 64).unwrap();
        let b = heap.kmalloc(&mapper, 64).unwrap();
        let _c = heap.kmalloc(&mapper, 64).unwrap();
        heap.kfree(&mapper, b).unwrap();
        assert_eq!(heap.kmalloc(&mapper, 32).unwrap(), b);
        heap.kfree(&mapper, a).unwrap();
        assert_eq!(heap.kmalloc(&mapper, 64).unwrap(), a);
    }

    #[test]
    fn empty_major_blocks_go_back_to_the_pmm() {
        let (mapper, heap) = setup();
        let before = mapper.frame_stats();
        let a = heap.kmalloc(&mapper, 100).unwrap();
        let big = heap.kmalloc(&mapper, 5 * PAGE_SIZE).unwrap();
        assert!(heap.stats().pages >= MIN_MAJOR_PAGES + 6);
        heap.kfree(&mapper, big).unwrap();
        heap.kfree(&mapper, a).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.pages, 0);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.frees, 2);
        assert_eq!(mapper.frame_stats(), before);
    }

    #[test]
    fn bad_frees_are_reported() {
        let (mapper, heap) = setup();
        let a = heap.kmalloc(&mapper, 64).unwrap();
        let _keep = heap.kmalloc(&mapper, 64).unwrap();
        assert_eq!(heap.kfree(&mapper, a + 16), Err(MemoryError::InvalidArgument));
        heap.kfree(&mapper, a).unwrap();
        assert_eq!(heap.kfree(&mapper, a), Err(MemoryError::NotAllocated));
        assert_eq!(
            heap.kfree(&mapper, VirtualAddress::new(0x1000)),
            Err(MemoryError::InvalidRange)
        );
        assert_eq!(heap.kfree(&mapper, VirtualAddress::NULL), Ok(()));
        assert_eq!(heap.kmalloc(&mapper, 0), Err(MemoryError::InvalidArgument));
    }

    #[test]
    fn krealloc_keeps_contents() {
        let (mapper, heap) = setup();
        let ptr = heap.krealloc(&mapper, VirtualAddress::NULL, 20).unwrap();
        mapper.write_bytes(None, ptr, b"kestrel heap realloc").unwrap();

        // Within the 32-byte block: stays put.
        assert_eq!(heap.krealloc(&mapper, ptr, 30).unwrap(), ptr);
        let _blocker = heap.kmalloc(&mapper, 16).unwrap();

        let moved = heap.krealloc(&mapper, ptr, 200).unwrap();
        assert_ne!(moved, ptr);
        let mut buf = [0u8; 20];
        mapper.read_bytes(None, moved, &mut buf).unwrap();
        assert_eq!(&buf, b"kestrel heap realloc");
        assert_eq!(heap.kfree(&mapper, ptr), Err(MemoryError::NotAllocated));

        assert_eq!(heap.krealloc(&mapper, moved, 0), Ok(VirtualAddress::NULL));
        assert_eq!(heap.stats().requested, 16);
    }

    #[test]
    fn aligned_allocations() {
        let (mapper, heap) = setup();
        let _skew = heap.kmalloc(&mapper, 8).unwrap();
        let ptr = heap.kmalloc_aligned(&mapper, 100, 256).unwrap();
        assert!(ptr.is_aligned(256));
        mapper.write_bytes(None, ptr, &[0x5A; 100]).unwrap();
        assert_eq!(heap.krealloc(&mapper, ptr, 10), Err(MemoryError::InvalidArgument));
        heap.kfree(&mapper, ptr).unwrap();
        assert_eq!(heap.stats().allocations - heap.stats().frees, 1);
        assert_eq!(
            heap.kmalloc_aligned(&mapper, 8, 24),
            Err(MemoryError::BadAlignment)
        );
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let (mapper, heap) = setup();
        let before = mapper.frame_stats();
        for size in [usize::MAX, usize::MAX - 4, usize::MAX - MINOR_HEADER - 8] {
            assert_eq!(heap.kmalloc(&mapper, size), Err(MemoryError::OutOfMemory));
        }
        assert_eq!(
            heap.kmalloc_aligned(&mapper, usize::MAX - 64, 256),
            Err(MemoryError::OutOfMemory)
        );
        assert_eq!(
            heap.allocate_pages(&mapper, usize::MAX / 2),
            Err(MemoryError::OutOfMemory)
        );

        let ptr = heap.kmalloc(&mapper, 64).unwrap();
        assert_eq!(heap.krealloc(&mapper, ptr, usize::MAX - 4), Err(MemoryError::OutOfMemory));
        assert_eq!(heap.stats().allocations, 1);
        heap.kfree(&mapper, ptr).unwrap();
        assert_eq!(mapper.frame_stats(), before);
    }

    #[test]
    fn double_free_after_release_is_reported() {
        let (mapper, heap) = setup();
        let ptr = heap.kmalloc(&mapper, 64).unwrap();
        heap.kfree(&mapper, ptr).unwrap();
        assert_eq!(heap.stats().pages, 0);
        assert!(!mapper.is_mapped(None, ptr));
        assert_eq!(heap.kfree(&mapper, ptr), Err(MemoryError::NotAllocated));
    }

    #[test]
    fn allocator_identifies_itself() {
        let (_, heap) = setup();
        let info = heap.allocator_info();
        assert_eq!(info.name, "liballoc");
        assert!(info.has(AllocatorInfo::ALIGNED | AllocatorInfo::REALLOC));
    }
}
