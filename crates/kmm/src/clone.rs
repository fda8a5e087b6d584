//! Address-space cloning and teardown.
//!
//! Both walks are iterative over an explicit stack of tables, so depth never depends on the
//! native call stack. Which parts of the source are shared by reference is decided by a
//! [`ClonePolicy`]; everything else is copied into fresh frames.

use alloc::vec;
use alloc::vec::Vec;

use crate::{Directory, Mapper, MemoryError, PAGE_SIZE, PageEntry, PhysicalAddress, VirtualAddress};

/// Decides which ranges of an address space are shared between a directory and its clones.
pub trait ClonePolicy {
    /// Whether the `span` bytes starting at `start` are shared rather than copied.
    fn is_shared(&self, start: VirtualAddress, span: u64) -> bool;
}

impl<F: Fn(VirtualAddress, u64) -> bool> ClonePolicy for F {
    fn is_shared(&self, start: VirtualAddress, span: u64) -> bool {
        self(start, span)
    }
}

/// Shares everything at or above `kernel_base`, copies everything below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSplit {
    pub kernel_base: VirtualAddress,
}

impl ClonePolicy for KernelSplit {
    fn is_shared(&self, start: VirtualAddress, _span: u64) -> bool {
        start >= self.kernel_base
    }
}

struct PendingTable {
    source: PhysicalAddress,
    target: PhysicalAddress,
    level: usize,
    base: u64,
}

impl<'a> Mapper<'a> {
    /// Clones the kernel/user split of `source` (the current directory if `None`).
    pub fn clone_address_space(&self, source: Option<Directory>) -> Result<Directory, MemoryError> {
        let policy = KernelSplit {
            kernel_base: self.kernel_base(),
        };
        self.clone_directory(source, &policy)
    }

    /// Builds a new directory from `source`.
    ///
    /// Entries in ranges the policy shares point at the same tables and frames as the source.
    /// Every other present table gets a private copy of its structure, and every owned data
    /// frame a private copy of its contents. Foreign frames (MMIO, externally supplied) are
    /// always shared. On failure everything allocated so far is released.
    pub fn clone_directory(
        &self,
        source: Option<Directory>,
        policy: &dyn ClonePolicy,
    ) -> Result<Directory, MemoryError> {
        let source = source.unwrap_or_else(|| self.current_directory());
        let root = self.allocate_table()?;

        match self.copy_tables(source.root(), root, policy) {
            Ok(copied) => {
                log::debug!(
                    "clone: {:?} -> {:?}, {} frames copied",
                    source,
                    Directory::from_root(root),
                    copied
                );
                Ok(Directory::from_root(root))
            }
            Err(err) => {
                log::warn!("clone: failed cloning {source:?}: {err}");
                if let Err(cleanup) = self.release_tables(root, policy) {
                    log::warn!("clone: rollback incomplete: {cleanup}");
                }
                Err(err)
            }
        }
    }

    fn copy_tables(
        &self,
        source_root: PhysicalAddress,
        target_root: PhysicalAddress,
        policy: &dyn ClonePolicy,
    ) -> Result<usize, MemoryError> {
        let mode = self.mode();
        let mut copied = 0;
        let mut pending = vec![PendingTable {
            source: source_root,
            target: target_root,
            level: mode.top_level(),
            base: 0,
        }];

        while let Some(table) = pending.pop() {
            let span = mode.span(table.level);
            for index in 0..mode.entries_per_table() {
                let entry = self.read_entry(table.source, index);
                if entry.is_unused() {
                    continue;
                }
                let start = mode.canonicalize(table.base.wrapping_add(index as u64 * span));
                let va = VirtualAddress::new(start as usize);

                if !entry.has_frame() || entry.is_foreign() || policy.is_shared(va, span) {
                    self.write_entry(table.target, index, entry);
                } else if table.level == 0 || entry.is_huge() {
                    let count = (span / PAGE_SIZE as u64) as usize;
                    let frames = self.allocate_frames(count)?;
                    for i in 0..count {
                        self.translator()
                            .copy_frame(entry.address() + i * PAGE_SIZE, frames + i * PAGE_SIZE);
                    }
                    let mut copy = entry;
                    copy.set_address(frames);
                    self.write_entry(table.target, index, copy);
                    copied += count;
                } else {
                    let child = self.allocate_table()?;
                    let mut copy = entry;
                    copy.set_address(child);
                    self.write_entry(table.target, index, copy);
                    pending.push(PendingTable {
                        source: entry.address(),
                        target: child,
                        level: table.level - 1,
                        base: start,
                    });
                }
            }
        }
        Ok(copied)
    }

    /// Destroys a directory built by [`clone_address_space`](Self::clone_address_space).
    pub fn destroy_address_space(&self, directory: Directory) -> Result<(), MemoryError> {
        let policy = KernelSplit {
            kernel_base: self.kernel_base(),
        };
        self.destroy_directory(directory, &policy)
    }

    /// Frees every private table and owned frame of `directory`, then the root itself.
    ///
    /// Shared ranges and foreign frames are left alone. The kernel directory and any directory
    /// still current on some CPU cannot be destroyed.
    pub fn destroy_directory(
        &self,
        directory: Directory,
        policy: &dyn ClonePolicy,
    ) -> Result<(), MemoryError> {
        if directory == self.kernel_directory() || self.is_active(directory) {
            log::warn!("clone: refusing to destroy active directory {directory:?}");
            return Err(MemoryError::InvalidArgument);
        }
        let before = self.frame_stats().used;
        self.release_tables(directory.root(), policy)?;
        log::debug!(
            "clone: destroyed {:?}, {} frames released",
            directory,
            before - self.frame_stats().used
        );
        Ok(())
    }

    fn release_tables(
        &self,
        root: PhysicalAddress,
        policy: &dyn ClonePolicy,
    ) -> Result<(), MemoryError> {
        let mode = self.mode();
        let mut result = Ok(());
        let mut pending: Vec<(PhysicalAddress, usize, u64)> = vec![(root, mode.top_level(), 0)];

        while let Some((table, level, base)) = pending.pop() {
            let span = mode.span(level);
            for index in 0..mode.entries_per_table() {
                let entry: PageEntry = self.read_entry(table, index);
                if !entry.has_frame() || entry.is_foreign() {
                    continue;
                }
                let start = mode.canonicalize(base.wrapping_add(index as u64 * span));
                if policy.is_shared(VirtualAddress::new(start as usize), span) {
                    continue;
                }
                if level == 0 || entry.is_huge() {
                    let count = (span / PAGE_SIZE as u64) as usize;
                    if let Err(err) = self.free_frames(entry.address(), count) {
                        result = result.and(Err(err));
                    }
                } else {
                    pending.push((entry.address(), level - 1, start));
                }
            }
            if let Err(err) = self.free_frame(table) {
                result = result.and(Err(err));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lookup, MapFlags, MemoryLayout, PagingMode};

    const MEMORY: usize = 8 * 1024 * 1024;

    fn setups() -> [Mapper<'static>; 3] {
        [
            Mapper::emulated(&MemoryLayout::i386(), MEMORY).unwrap(),
            Mapper::emulated(&MemoryLayout::x86_64(), MEMORY).unwrap(),
            Mapper::emulated(&MemoryLayout::x86_64().with_mode(PagingMode::FiveLevel), MEMORY)
                .unwrap(),
        ]
    }

    fn back(mapper: &Mapper<'_>, directory: Directory, address: VirtualAddress, flags: MapFlags) {
        let page = mapper.get_or_create_page(Some(directory), address).unwrap();
        mapper.allocate_page(&page, flags).unwrap();
    }

    fn frame_of(mapper: &Mapper<'_>, directory: Directory, address: VirtualAddress) -> PhysicalAddress {
        let page = mapper.get_page(Some(directory), address, Lookup::Existing).unwrap().unwrap();
        mapper.entry(&page).address()
    }

    #[test]
    fn user_pages_are_copied_and_kernel_pages_shared() {
        for mapper in setups() {
            let kernel = mapper.kernel_directory();
            let parent = mapper.clone_address_space(Some(kernel)).unwrap();

            let user = [VirtualAddress::new(0x40_0000), VirtualAddress::new(0x1234_5000)];
            for (i, &address) in user.iter().enumerate() {
                back(&mapper, parent, address, MapFlags::empty());
                mapper.write_bytes(Some(parent), address, &[i as u8 + 1; 32]).unwrap();
            }
            let kernel_page = mapper.kernel_base() + 0x20_0000;
            back(&mapper, kernel, kernel_page, MapFlags::KERNEL);

            let child = mapper.clone_address_space(Some(parent)).unwrap();

            for (i, &address) in user.iter().enumerate() {
                assert_ne!(frame_of(&mapper, parent, address), frame_of(&mapper, child, address));
                let mut contents = [0u8; 32];
                mapper.read_bytes(Some(child), address, &mut contents).unwrap();
                assert_eq!(contents, [i as u8 + 1; 32]);
            }
            assert_eq!(
                frame_of(&mapper, parent, kernel_page),
                frame_of(&mapper, child, kernel_page)
            );

            // Writes after the clone stay private.
            mapper.write_bytes(Some(child), user[0], b"child").unwrap();
            let mut parent_view = [0u8; 5];
            mapper.read_bytes(Some(parent), user[0], &mut parent_view).unwrap();
            assert_eq!(parent_view, [1; 5]);
        }
    }

    #[test]
    fn kernel_mappings_made_after_clone_are_visible() {
        for mapper in setups() {
            let child = mapper.clone_address_space(None).unwrap();
            let address = mapper.kernel_base() + 0x40_0000;
            back(&mapper, mapper.kernel_directory(), address, MapFlags::KERNEL);
            assert_eq!(
                mapper.translate(Some(child), address),
                mapper.translate(None, address)
            );
        }
    }

    #[test]
    fn foreign_frames_are_shared() {
        let [mapper, ..] = setups();
        let parent = mapper.clone_address_space(None).unwrap();
        let address = VirtualAddress::new(0x80_0000);
        mapper
            .map_address(Some(parent), PhysicalAddress::new(0xB8000), address, MapFlags::empty())
            .unwrap();
        let child = mapper.clone_address_space(Some(parent)).unwrap();
        assert_eq!(
            mapper.translate(Some(child), address),
            Some(PhysicalAddress::new(0xB8000))
        );
    }

    #[test]
    fn destroy_returns_every_private_frame() {
        for mapper in setups() {
            let before = mapper.frame_stats();
            let space = mapper.clone_address_space(None).unwrap();
            for i in 0..5 {
                back(&mapper, space, VirtualAddress::new(0x40_0000 + i * 0x20_0000), MapFlags::empty());
            }
            let copy = mapper.clone_address_space(Some(space)).unwrap();
            mapper.destroy_address_space(copy).unwrap();
            mapper.destroy_address_space(space).unwrap();
            assert_eq!(mapper.frame_stats(), before);
        }
    }

    #[test]
    fn custom_policy_shares_everything() {
        let [_, mapper, _] = setups();
        let parent = mapper.clone_address_space(None).unwrap();
        let address = VirtualAddress::new(0x40_0000);
        back(&mapper, parent, address, MapFlags::empty());

        let share_all = |_: VirtualAddress, _: u64| true;
        let used = mapper.frame_stats().used;
        let child = mapper.clone_directory(Some(parent), &share_all).unwrap();
        assert_eq!(mapper.frame_stats().used, used + 1, "only the new root");
        assert_eq!(frame_of(&mapper, parent, address), frame_of(&mapper, child, address));
        mapper.destroy_directory(child, &share_all).unwrap();
        assert_eq!(mapper.frame_stats().used, used);
    }

    #[test]
    fn failed_clone_is_rolled_back() {
        let mapper = Mapper::emulated(&MemoryLayout::i386(), 2 * 1024 * 1024).unwrap();
        let parent = mapper.clone_address_space(None).unwrap();
        // Every page sits in its own page table, so a copy needs about twice what is left.
        let mut address = 0x40_0000;
        while mapper.frame_stats().free > 100 {
            back(&mapper, parent, VirtualAddress::new(address), MapFlags::empty());
            address += 0x40_0000;
        }
        let before = mapper.frame_stats();
        assert_eq!(mapper.clone_address_space(Some(parent)), Err(MemoryError::OutOfMemory));
        assert_eq!(mapper.frame_stats(), before);
    }

    #[test]
    fn active_directories_cannot_be_destroyed() {
        let [mapper, ..] = setups();
        assert_eq!(
            mapper.destroy_address_space(mapper.kernel_directory()),
            Err(MemoryError::InvalidArgument)
        );
        let space = mapper.clone_address_space(None).unwrap();
        mapper.switch_directory(space).unwrap();
        assert_eq!(mapper.destroy_address_space(space), Err(MemoryError::InvalidArgument));
    }

    #[test]
    fn directories_current_on_another_cpu_cannot_be_destroyed() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static CPU: AtomicUsize = AtomicUsize::new(0);

        let [mut mapper, ..] = setups();
        mapper.set_cpu_id_source(|| CPU.load(Ordering::Relaxed));
        let space = mapper.clone_address_space(None).unwrap();

        CPU.store(3, Ordering::Relaxed);
        mapper.switch_directory(space).unwrap();
        CPU.store(0, Ordering::Relaxed);
        assert_eq!(mapper.current_directory(), mapper.kernel_directory());
        assert_eq!(mapper.destroy_address_space(space), Err(MemoryError::InvalidArgument));

        CPU.store(3, Ordering::Relaxed);
        mapper.switch_directory(mapper.kernel_directory()).unwrap();
        CPU.store(0, Ordering::Relaxed);
        mapper.destroy_address_space(space).unwrap();
    }
}
