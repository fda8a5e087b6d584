//! Page table entry.

use crate::{PAGE_SIZE, PhysicalAddress};

/// A page table entry in the x86 layout, widened to 64 bits.
///
/// i386 entries are the low 32 bits of the same layout; [`PagingMode::encode`] strips what the
/// 32-bit format cannot hold.
///
/// [`PagingMode::encode`]: super::PagingMode::encode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const WRITE_THROUGH: u64 = 1 << 3;
    const NO_CACHE: u64 = 1 << 4;
    const ACCESSED: u64 = 1 << 5;
    const DIRTY: u64 = 1 << 6;
    const HUGE: u64 = 1 << 7;
    const GLOBAL: u64 = 1 << 8;
    /// Software bit 9. Reserved for copy-on-write; nothing sets it yet.
    const COPY_ON_WRITE: u64 = 1 << 9;
    /// Software bit 10. The frame was supplied by the caller and is not owned by the PMM.
    const FOREIGN: u64 = 1 << 10;
    const NO_EXECUTE: u64 = 1 << 63;

    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Builds a present, writable entry pointing at a lower-level table.
    pub const fn table(frame: PhysicalAddress, user: bool) -> Self {
        let mut raw = (frame.as_usize() as u64 & Self::ADDRESS_MASK) | Self::PRESENT | Self::WRITABLE;
        if user {
            raw |= Self::USER;
        }
        Self(raw)
    }

    /// Frame address held by the entry, whether or not it is present.
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    pub fn set_address(&mut self, frame: PhysicalAddress) {
        debug_assert!(frame.is_aligned(PAGE_SIZE), "frame must be page aligned");
        self.0 = (self.0 & !Self::ADDRESS_MASK) | (frame.as_usize() as u64 & Self::ADDRESS_MASK);
    }

    /// Whether the entry refers to a frame at all (present or reserved for later).
    pub const fn has_frame(self) -> bool {
        self.0 & Self::ADDRESS_MASK != 0
    }

    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub(crate) const fn without_no_execute(self) -> Self {
        Self(self.0 & !Self::NO_EXECUTE)
    }

    const fn get(self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    fn put(&mut self, bit: u64, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub const fn is_present(self) -> bool {
        self.get(Self::PRESENT)
    }

    pub fn set_present(&mut self, value: bool) {
        self.put(Self::PRESENT, value);
    }

    pub const fn is_writable(self) -> bool {
        self.get(Self::WRITABLE)
    }

    pub fn set_writable(&mut self, value: bool) {
        self.put(Self::WRITABLE, value);
    }

    pub const fn is_user(self) -> bool {
        self.get(Self::USER)
    }

    pub fn set_user(&mut self, value: bool) {
        self.put(Self::USER, value);
    }

    pub const fn is_write_through(self) -> bool {
        self.get(Self::WRITE_THROUGH)
    }

    pub fn set_write_through(&mut self, value: bool) {
        self.put(Self::WRITE_THROUGH, value);
    }

    pub const fn is_no_cache(self) -> bool {
        self.get(Self::NO_CACHE)
    }

    pub fn set_no_cache(&mut self, value: bool) {
        self.put(Self::NO_CACHE, value);
    }

    pub const fn is_accessed(self) -> bool {
        self.get(Self::ACCESSED)
    }

    pub const fn is_dirty(self) -> bool {
        self.get(Self::DIRTY)
    }

    /// Large page at a non-leaf level (2 MiB / 1 GiB on x86_64, 4 MiB on i386).
    pub const fn is_huge(self) -> bool {
        self.get(Self::HUGE)
    }

    pub const fn is_global(self) -> bool {
        self.get(Self::GLOBAL)
    }

    pub fn set_global(&mut self, value: bool) {
        self.put(Self::GLOBAL, value);
    }

    pub const fn is_copy_on_write(self) -> bool {
        self.get(Self::COPY_ON_WRITE)
    }

    pub const fn is_foreign(self) -> bool {
        self.get(Self::FOREIGN)
    }

    pub fn set_foreign(&mut self, value: bool) {
        self.put(Self::FOREIGN, value);
    }

    pub const fn is_no_execute(self) -> bool {
        self.get(Self::NO_EXECUTE)
    }

    pub fn set_no_execute(&mut self, value: bool) {
        self.put(Self::NO_EXECUTE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_flags_are_independent() {
        let mut entry = PageEntry::empty();
        entry.set_writable(true);
        entry.set_user(true);
        entry.set_address(PhysicalAddress::new(0x1234_5000));
        assert_eq!(entry.address(), PhysicalAddress::new(0x1234_5000));
        assert!(entry.is_writable() && entry.is_user());
        assert!(!entry.is_present());
        assert!(entry.has_frame());

        entry.set_address(PhysicalAddress::new(0x7000));
        assert_eq!(entry.address(), PhysicalAddress::new(0x7000));
        assert!(entry.is_writable());
    }

    #[test]
    fn table_entries() {
        let kernel = PageEntry::table(PhysicalAddress::new(0x9000), false);
        assert!(kernel.is_present() && kernel.is_writable() && !kernel.is_user());
        assert!(PageEntry::table(PhysicalAddress::new(0x9000), true).is_user());
    }

    #[test]
    fn software_bits() {
        let mut entry = PageEntry::from_raw(PageEntry::COPY_ON_WRITE);
        assert!(entry.is_copy_on_write());
        entry.set_foreign(true);
        assert!(entry.is_foreign());
        entry.clear();
        assert!(entry.is_unused());
    }
}
