//! Page table management.
//!
//! [`Mapper`] owns the frame allocator and walks directories of whatever [`PagingMode`] it was
//! built for. Populating a page happens in two steps: [`Mapper::get_page`] reserves the address
//! (creating any missing intermediate tables) and hands back a [`PageHandle`] for the leaf entry,
//! then [`Mapper::allocate_page`] backs that entry with a frame. Heap growth and lazy faults rely
//! on being able to do the first without the second.
//!
//! Intermediate tables are never collapsed once created.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    AddressTranslator, Bugcode, MapFlags, MemoryError, MemoryLayout, PAGE_SIZE, PageEntry,
    PagingMode, PhysicalAddress, PhysicalMemoryManager, VirtualAddress, arch, fatal,
};

/// Maximum number of CPUs with their own current-directory slot.
pub const MAX_CPUS: usize = 32;

/// Handle to a root page table, i.e. one address space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Directory(PhysicalAddress);

impl Directory {
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self(root)
    }

    pub const fn root(self) -> PhysicalAddress {
        self.0
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Directory({:#x})", self.0.as_usize())
    }
}

/// Whether [`Mapper::get_page`] may create missing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Existing,
    Create,
}

/// Location of the leaf entry for one virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle {
    directory: Directory,
    table: PhysicalAddress,
    index: usize,
    address: VirtualAddress,
}

impl PageHandle {
    pub fn directory(&self) -> Directory {
        self.directory
    }

    /// Physical address of the leaf table holding the entry.
    pub fn table(&self) -> PhysicalAddress {
        self.table
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Page-aligned virtual address the entry translates.
    pub fn address(&self) -> VirtualAddress {
        self.address
    }
}

/// Frame allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

fn current_cpu_zero() -> usize {
    0
}

pub struct Mapper<'a> {
    mode: PagingMode,
    translator: AddressTranslator,
    frames: spin::Mutex<PhysicalMemoryManager<'a>>,
    kernel_directory: Directory,
    kernel_base: VirtualAddress,
    current: [AtomicUsize; MAX_CPUS],
    cpu_id: fn() -> usize,
}

impl<'a> Mapper<'a> {
    /// Creates a mapper with a fresh, empty kernel directory.
    pub fn new(
        translator: AddressTranslator,
        frames: PhysicalMemoryManager<'a>,
        layout: &MemoryLayout,
    ) -> Result<Self, MemoryError> {
        let mut mapper = Self::bare(translator, frames, layout);
        let root = mapper.allocate_table()?;
        mapper.install_kernel_directory(root)?;
        Ok(mapper)
    }

    /// Creates a mapper around the directory the bootloader left active.
    ///
    /// `root` and every table reachable from it must already be reserved in `frames`.
    pub fn adopt(
        translator: AddressTranslator,
        frames: PhysicalMemoryManager<'a>,
        layout: &MemoryLayout,
        root: PhysicalAddress,
    ) -> Result<Self, MemoryError> {
        if !root.is_page_aligned() {
            return Err(MemoryError::BadAlignment);
        }
        let mut mapper = Self::bare(translator, frames, layout);
        mapper.install_kernel_directory(root)?;
        Ok(mapper)
    }

    fn bare(
        translator: AddressTranslator,
        frames: PhysicalMemoryManager<'a>,
        layout: &MemoryLayout,
    ) -> Self {
        Self {
            mode: layout.mode,
            translator,
            frames: spin::Mutex::new(frames),
            kernel_directory: Directory(PhysicalAddress::NULL),
            kernel_base: VirtualAddress::new(layout.kernel_base),
            current: [const { AtomicUsize::new(0) }; MAX_CPUS],
            cpu_id: current_cpu_zero,
        }
    }

    /// Makes `root` the kernel directory and the current directory of every CPU, and gives it a
    /// table behind every kernel-range top-level entry so later kernel mappings show up in every
    /// clone.
    fn install_kernel_directory(&mut self, root: PhysicalAddress) -> Result<(), MemoryError> {
        let top = self.mode.top_level();
        let first = self.mode.index(self.kernel_base, top);
        for index in first..self.mode.entries_per_table() {
            if self.read_entry(root, index).is_unused() {
                let table = self.allocate_table()?;
                self.write_entry(root, index, PageEntry::table(table, false));
            }
        }

        self.kernel_directory = Directory(root);
        for slot in &self.current {
            slot.store(root.as_usize(), Ordering::Release);
        }

        log::debug!(
            "mapper: kernel directory at {} ({:?}, kernel entries {}..{})",
            root,
            self.mode,
            first,
            self.mode.entries_per_table()
        );
        Ok(())
    }

    /// Installs the function used to find the calling CPU's index.
    pub fn set_cpu_id_source(&mut self, cpu_id: fn() -> usize) {
        self.cpu_id = cpu_id;
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub fn kernel_directory(&self) -> Directory {
        self.kernel_directory
    }

    pub fn kernel_base(&self) -> VirtualAddress {
        self.kernel_base
    }

    pub fn is_kernel_address(&self, address: VirtualAddress) -> bool {
        address >= self.kernel_base
    }

    fn cpu(&self) -> usize {
        let cpu = (self.cpu_id)();
        if cpu >= MAX_CPUS {
            fatal(
                Bugcode::KernelAssertion,
                "mapper",
                format_args!("cpu {cpu} exceeds MAX_CPUS ({MAX_CPUS})"),
            );
        }
        cpu
    }

    /// The directory active on the calling CPU.
    pub fn current_directory(&self) -> Directory {
        let root = self.current[self.cpu()].load(Ordering::Acquire);
        Directory(PhysicalAddress::new(root))
    }

    /// Whether any CPU has `directory` as its current directory.
    pub fn is_active(&self, directory: Directory) -> bool {
        let root = directory.root().as_usize();
        self.current
            .iter()
            .any(|slot| slot.load(Ordering::Acquire) == root)
    }

    fn resolve(&self, directory: Option<Directory>) -> Directory {
        directory.unwrap_or_else(|| self.current_directory())
    }

    // -- frames ---------------------------------------------------------------------------------

    /// Locks the frame allocator.
    pub fn frames(&self) -> spin::MutexGuard<'_, PhysicalMemoryManager<'a>> {
        self.frames.lock()
    }

    pub fn allocate_frame(&self) -> Result<PhysicalAddress, MemoryError> {
        self.frames.lock().allocate_block()
    }

    pub fn allocate_frames(&self, count: usize) -> Result<PhysicalAddress, MemoryError> {
        self.frames.lock().allocate_blocks(count)
    }

    pub fn free_frame(&self, frame: PhysicalAddress) -> Result<(), MemoryError> {
        self.frames.lock().free_block(frame)
    }

    pub fn free_frames(&self, first: PhysicalAddress, count: usize) -> Result<(), MemoryError> {
        self.frames.lock().free_blocks(first, count)
    }

    pub fn mark_region_available(&self, base: PhysicalAddress, size: usize) {
        self.frames.lock().initialize_region(base, size);
    }

    pub fn mark_region_reserved(&self, base: PhysicalAddress, size: usize) {
        self.frames.lock().deinitialize_region(base, size);
    }

    pub fn frame_stats(&self) -> FrameStats {
        let frames = self.frames.lock();
        FrameStats {
            total: frames.max_blocks(),
            used: frames.used_blocks(),
            free: frames.free_blocks_count(),
        }
    }

    // -- raw table access -----------------------------------------------------------------------

    pub(crate) fn read_entry(&self, table: PhysicalAddress, index: usize) -> PageEntry {
        let slot = table + index * self.mode.entry_size();
        let raw = match self.mode.entry_size() {
            4 => u64::from(self.translator.read_u32(slot)),
            _ => self.translator.read_u64(slot),
        };
        self.mode.decode(raw)
    }

    pub(crate) fn write_entry(&self, table: PhysicalAddress, index: usize, entry: PageEntry) {
        let slot = table + index * self.mode.entry_size();
        let raw = self.mode.encode(entry);
        match self.mode.entry_size() {
            4 => self.translator.write_u32(slot, raw as u32),
            _ => self.translator.write_u64(slot, raw),
        }
    }

    /// Allocates and zeroes a frame for a page table.
    pub(crate) fn allocate_table(&self) -> Result<PhysicalAddress, MemoryError> {
        let frame = self.allocate_frame()?;
        self.translator.zero_frame(frame);
        Ok(frame)
    }

    // -- walking --------------------------------------------------------------------------------

    /// Finds the leaf entry for `address`.
    ///
    /// With [`Lookup::Create`], missing intermediate tables are allocated, zeroed and linked in,
    /// and the result is always `Some`. With [`Lookup::Existing`], `None` means some table on the
    /// way is missing. `None` as the directory means the calling CPU's current directory.
    pub fn get_page(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
        lookup: Lookup,
    ) -> Result<Option<PageHandle>, MemoryError> {
        if !self.mode.is_canonical(address) {
            return Err(MemoryError::InvalidRange);
        }
        let directory = self.resolve(directory);
        let user = !self.is_kernel_address(address);
        let mut table = directory.root();

        for level in (1..self.mode.levels()).rev() {
            let index = self.mode.index(address, level);
            let entry = self.read_entry(table, index);
            if entry.is_present() {
                if entry.is_huge() {
                    log::warn!("mapper: {address} is covered by a large page at level {level}");
                    return Err(MemoryError::InvalidArgument);
                }
                table = entry.address();
            } else if lookup == Lookup::Create {
                let next = self.allocate_table()?;
                self.write_entry(table, index, PageEntry::table(next, user));
                table = next;
            } else {
                return Ok(None);
            }
        }

        Ok(Some(PageHandle {
            directory,
            table,
            index: self.mode.index(address, 0),
            address: address.align_down(PAGE_SIZE),
        }))
    }

    /// [`get_page`](Self::get_page) with [`Lookup::Create`].
    pub fn get_or_create_page(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
    ) -> Result<PageHandle, MemoryError> {
        self.get_page(directory, address, Lookup::Create)?
            .ok_or(MemoryError::InvalidRange)
    }

    pub fn entry(&self, page: &PageHandle) -> PageEntry {
        self.read_entry(page.table, page.index)
    }

    pub fn set_entry(&self, page: &PageHandle, entry: PageEntry) {
        self.write_entry(page.table, page.index, entry);
        self.invalidate(page.directory, page.address);
    }

    /// Records an externally owned frame in the entry without making it present.
    ///
    /// A later [`allocate_page`](Self::allocate_page) with [`MapFlags::NO_ALLOC`] activates it.
    pub fn set_frame(&self, page: &PageHandle, frame: PhysicalAddress) -> Result<(), MemoryError> {
        if !frame.is_page_aligned() {
            return Err(MemoryError::BadAlignment);
        }
        let mut entry = self.entry(page);
        entry.set_address(frame);
        entry.set_foreign(true);
        self.write_entry(page.table, page.index, entry);
        Ok(())
    }

    /// Backs the page with a frame and applies `flags`.
    ///
    /// A fresh frame is taken from the PMM and zeroed unless the entry already has one, or
    /// `NO_ALLOC` says the frame was set with [`set_frame`](Self::set_frame). `NO_ALLOC` on an
    /// entry without a frame is rejected. Ownership of an existing frame never changes here.
    pub fn allocate_page(&self, page: &PageHandle, flags: MapFlags) -> Result<(), MemoryError> {
        let mut entry = self.entry(page);

        if flags.contains(MapFlags::NO_ALLOC) {
            if !entry.has_frame() {
                return Err(MemoryError::InvalidArgument);
            }
        } else if !entry.has_frame() {
            let frame = self.allocate_frame()?;
            self.translator.zero_frame(frame);
            entry.set_address(frame);
            entry.set_foreign(false);
        }

        entry.set_present(!flags.contains(MapFlags::NOT_PRESENT));
        entry.set_writable(!flags.contains(MapFlags::READ_ONLY));
        entry.set_user(!flags.contains(MapFlags::KERNEL));
        entry.set_write_through(flags.contains(MapFlags::WRITE_THROUGH));
        entry.set_no_cache(flags.contains(MapFlags::NO_CACHE));
        entry.set_no_execute(
            flags.contains(MapFlags::NO_EXECUTE) && self.mode.supports_no_execute(),
        );

        self.set_entry(page, entry);
        Ok(())
    }

    /// Clears the entry and returns its frame to the PMM, unless the frame is foreign.
    pub fn free_page(&self, page: &PageHandle) -> Result<(), MemoryError> {
        let entry = self.entry(page);
        self.set_entry(page, PageEntry::empty());
        if entry.has_frame() && !entry.is_foreign() {
            self.free_frame(entry.address())?;
        }
        Ok(())
    }

    /// Clears the entry without touching its frame, returning the frame it held.
    pub fn unmap_page(&self, page: &PageHandle) -> Option<PhysicalAddress> {
        let entry = self.entry(page);
        self.set_entry(page, PageEntry::empty());
        entry.has_frame().then(|| entry.address())
    }

    /// Maps `virt` to the externally supplied frame `phys`.
    ///
    /// The frame is never returned to the PMM by this mapper.
    pub fn map_address(
        &self,
        directory: Option<Directory>,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: MapFlags,
    ) -> Result<(), MemoryError> {
        let page = self.get_or_create_page(directory, virt)?;
        self.set_frame(&page, phys.align_down(PAGE_SIZE))?;
        self.allocate_page(&page, flags | MapFlags::NO_ALLOC)
    }

    /// Translates `address` through `directory`, following large pages.
    pub fn translate(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        if !self.mode.is_canonical(address) {
            return None;
        }
        let mut table = self.resolve(directory).root();
        for level in (0..self.mode.levels()).rev() {
            let entry = self.read_entry(table, self.mode.index(address, level));
            if !entry.is_present() {
                return None;
            }
            if level == 0 || entry.is_huge() {
                let offset = address.as_usize() as u64 & (self.mode.span(level) - 1);
                return Some(entry.address() + offset as usize);
            }
            table = entry.address();
        }
        None
    }

    pub fn is_mapped(&self, directory: Option<Directory>, address: VirtualAddress) -> bool {
        self.translate(directory, address).is_some()
    }

    /// Makes `directory` the active address space on the calling CPU.
    ///
    /// Directories the page-table base register cannot hold, or that lie outside memory the PMM
    /// manages, are rejected.
    pub fn switch_directory(&self, directory: Directory) -> Result<(), MemoryError> {
        let root = directory.root();
        if !root.is_page_aligned() {
            return Err(MemoryError::BadAlignment);
        }
        if root.is_null()
            || root.as_usize() as u64 >= self.mode.directory_limit()
            || root.frame_number().as_usize() >= self.frames.lock().max_blocks()
        {
            log::warn!("mapper: refusing to switch to {directory:?}");
            return Err(MemoryError::InvalidRange);
        }

        self.current[self.cpu()].store(root.as_usize(), Ordering::Release);
        if self.translator.is_hardware() && arch::active_directory() != root {
            // SAFETY: every directory handed out by this mapper shares the kernel tables, so the
            // running code and stack stay mapped.
            unsafe { arch::load_directory(root) };
        }
        Ok(())
    }

    fn invalidate(&self, directory: Directory, address: VirtualAddress) {
        if !self.translator.is_hardware() {
            return;
        }
        // TODO: send a shootdown IPI to other CPUs that have `directory` (or, for kernel
        // addresses, any directory) loaded once APs are brought up.
        if self.is_kernel_address(address) || directory == self.current_directory() {
            arch::invalidate_page(address);
        }
    }

    // -- byte access ----------------------------------------------------------------------------

    /// Copies bytes out of `directory`'s view of memory. Fails if any page is unmapped.
    pub fn read_bytes(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), MemoryError> {
        let directory = self.resolve(directory);
        let mut done = 0;
        while done < buf.len() {
            let va = address + done;
            let len = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let phys = self
                .translate(Some(directory), va)
                .ok_or(MemoryError::InvalidRange)?;
            self.translator.read_bytes(phys, &mut buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    pub fn write_bytes(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
        buf: &[u8],
    ) -> Result<(), MemoryError> {
        let directory = self.resolve(directory);
        let mut done = 0;
        while done < buf.len() {
            let va = address + done;
            let len = (PAGE_SIZE - va.page_offset()).min(buf.len() - done);
            let phys = self
                .translate(Some(directory), va)
                .ok_or(MemoryError::InvalidRange)?;
            self.translator.write_bytes(phys, &buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    pub fn read_u64(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
    ) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_bytes(directory, address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(
        &self,
        directory: Option<Directory>,
        address: VirtualAddress,
        value: u64,
    ) -> Result<(), MemoryError> {
        self.write_bytes(directory, address, &value.to_le_bytes())
    }

    /// Builds a mapper over emulated memory with every frame but frame 0 available.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(layout: &MemoryLayout, memory_size: usize) -> Result<Mapper<'static>, MemoryError> {
        let words = PhysicalMemoryManager::storage_words(memory_size);
        let storage = alloc::boxed::Box::leak(alloc::vec![0u32; words].into_boxed_slice());
        let mut frames = PhysicalMemoryManager::new(memory_size, storage)?;
        frames.initialize_region(PhysicalAddress::NULL, memory_size);
        frames.deinitialize_region(PhysicalAddress::NULL, PAGE_SIZE);
        Mapper::new(AddressTranslator::emulated(memory_size), frames, layout)
    }
}
