//! Page table formats and the hardware hooks that load them.
//!
//! The table format is chosen at runtime through [`PagingMode`]: i386 uses two levels of 1024
//! 32-bit entries, x86_64 uses four (or five) levels of 512 64-bit entries. Everything above this
//! module (mapper, clone, heap) is written once against `PagingMode` and differs only in walk
//! depth and entry width.

mod entry;

#[cfg(target_arch = "x86")]
mod i386;
#[cfg(target_arch = "x86_64")]
mod x86_64;

pub use entry::PageEntry;

use crate::{PhysicalAddress, VirtualAddress};

/// Size of a page and of a physical frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

const PAGE_SHIFT: u32 = 12;

/// The page table format in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// i386 without PAE: page directory and page table, 1024 x 32-bit entries each.
    TwoLevel,
    /// x86_64 with 48-bit virtual addresses.
    FourLevel,
    /// x86_64 with LA57, 57-bit virtual addresses.
    FiveLevel,
}

impl PagingMode {
    pub const fn levels(self) -> usize {
        match self {
            Self::TwoLevel => 2,
            Self::FourLevel => 4,
            Self::FiveLevel => 5,
        }
    }

    /// Level number of the root table.
    pub const fn top_level(self) -> usize {
        self.levels() - 1
    }

    pub const fn entries_per_table(self) -> usize {
        match self {
            Self::TwoLevel => 1024,
            Self::FourLevel | Self::FiveLevel => 512,
        }
    }

    /// Width of one table entry in bytes.
    pub const fn entry_size(self) -> usize {
        match self {
            Self::TwoLevel => 4,
            Self::FourLevel | Self::FiveLevel => 8,
        }
    }

    const fn index_bits(self) -> u32 {
        match self {
            Self::TwoLevel => 10,
            Self::FourLevel | Self::FiveLevel => 9,
        }
    }

    /// Table index selected by `address` at `level` (0 is the leaf table).
    pub const fn index(self, address: VirtualAddress, level: usize) -> usize {
        let shift = PAGE_SHIFT + self.index_bits() * level as u32;
        ((address.as_usize() as u64 >> shift) as usize) & (self.entries_per_table() - 1)
    }

    /// Bytes of virtual address space covered by one entry at `level`.
    pub const fn span(self, level: usize) -> u64 {
        1u64 << (PAGE_SHIFT + self.index_bits() * level as u32)
    }

    const fn virtual_bits(self) -> u32 {
        match self {
            Self::TwoLevel => 32,
            Self::FourLevel => 48,
            Self::FiveLevel => 57,
        }
    }

    /// Sign-extends an address built from table indices into canonical form.
    pub const fn canonicalize(self, address: u64) -> u64 {
        match self {
            Self::TwoLevel => address & 0xFFFF_FFFF,
            Self::FourLevel | Self::FiveLevel => {
                let shift = 64 - self.virtual_bits();
                (((address << shift) as i64) >> shift) as u64
            }
        }
    }

    pub const fn is_canonical(self, address: VirtualAddress) -> bool {
        let raw = address.as_usize() as u64;
        self.canonicalize(raw) == raw
    }

    /// First address past the range a root table may live at.
    ///
    /// CR3 holds a 32-bit physical address on i386, so a directory above 4 GiB would be truncated.
    pub const fn directory_limit(self) -> u64 {
        match self {
            Self::TwoLevel => 1 << 32,
            Self::FourLevel | Self::FiveLevel => 1 << 52,
        }
    }

    /// First address of the upper canonical half, where the kernel lives. `None` on i386.
    pub const fn higher_half_start(self) -> Option<u64> {
        match self {
            Self::TwoLevel => None,
            Self::FourLevel => Some(0xFFFF_8000_0000_0000),
            Self::FiveLevel => Some(0xFF00_0000_0000_0000),
        }
    }

    pub const fn supports_no_execute(self) -> bool {
        !matches!(self, Self::TwoLevel)
    }

    /// Decodes a raw table entry.
    pub const fn decode(self, raw: u64) -> PageEntry {
        match self {
            Self::TwoLevel => PageEntry::from_raw(raw & 0xFFFF_FFFF),
            Self::FourLevel | Self::FiveLevel => PageEntry::from_raw(raw),
        }
    }

    /// Encodes an entry into the raw value stored in a table of this format.
    pub const fn encode(self, entry: PageEntry) -> u64 {
        match self {
            Self::TwoLevel => entry.without_no_execute().as_u64() & 0xFFFF_FFFF,
            Self::FourLevel | Self::FiveLevel => entry.as_u64(),
        }
    }
}

/// Loads `root` into the page-table base register.
///
/// # Safety
///
/// `root` must be a complete directory of the running CPU's format that maps the executing code,
/// the stack and every structure the kernel touches next.
#[allow(unused_variables)]
pub unsafe fn load_directory(root: PhysicalAddress) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        x86_64::load_directory(root)
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        i386::load_directory(root)
    }
}

/// Drops the local TLB entry for `address`.
#[allow(unused_variables)]
pub fn invalidate_page(address: VirtualAddress) {
    #[cfg(target_arch = "x86_64")]
    x86_64::invalidate_page(address);
    #[cfg(target_arch = "x86")]
    i386::invalidate_page(address);
}

/// Physical address of the directory currently loaded on this CPU.
pub fn active_directory() -> PhysicalAddress {
    #[cfg(target_arch = "x86_64")]
    return x86_64::active_directory();
    #[cfg(target_arch = "x86")]
    return i386::active_directory();
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    PhysicalAddress::NULL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_level_indices() {
        let mode = PagingMode::TwoLevel;
        let va = VirtualAddress::new(0xC040_3123);
        assert_eq!(mode.index(va, 1), 0x301);
        assert_eq!(mode.index(va, 0), 0x003);
        assert_eq!(mode.span(1), 4 * 1024 * 1024);
        assert_eq!(mode.entries_per_table() * mode.entry_size(), PAGE_SIZE);
    }

    #[test]
    fn four_level_indices() {
        let mode = PagingMode::FourLevel;
        let va = VirtualAddress::new(0xFFFF_8000_0020_1000);
        assert_eq!(mode.index(va, 3), 256);
        assert_eq!(mode.index(va, 2), 0);
        assert_eq!(mode.index(va, 1), 1);
        assert_eq!(mode.index(va, 0), 1);
        assert_eq!(mode.entries_per_table() * mode.entry_size(), PAGE_SIZE);
    }

    #[test]
    fn canonical_form() {
        let four = PagingMode::FourLevel;
        assert_eq!(four.canonicalize(256 << 39), 0xFFFF_8000_0000_0000);
        assert!(four.is_canonical(VirtualAddress::new(0x0000_7FFF_FFFF_F000)));
        assert!(!four.is_canonical(VirtualAddress::new(0x0000_8000_0000_0000)));

        let five = PagingMode::FiveLevel;
        assert!(five.is_canonical(VirtualAddress::new(0x0000_8000_0000_0000)));
        assert_eq!(five.canonicalize(256 << 48), 0xFF00_0000_0000_0000);
    }

    #[test]
    fn two_level_entries_drop_no_execute() {
        let mut entry = PageEntry::empty();
        entry.set_address(PhysicalAddress::new(0x5000));
        entry.set_present(true);
        entry.set_no_execute(true);
        let raw = PagingMode::TwoLevel.encode(entry);
        assert_eq!(raw, 0x5001);
        assert!(!PagingMode::TwoLevel.decode(raw).is_no_execute());
        assert!(PagingMode::FourLevel.decode(PagingMode::FourLevel.encode(entry)).is_no_execute());
    }
}
