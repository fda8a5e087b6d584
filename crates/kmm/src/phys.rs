//! Access to physical memory.
//!
//! The kernel reaches physical memory through the bootloader's direct map. Tests reach it through
//! an emulated buffer indexed by physical address, so page tables and copied frames are real bytes
//! either way.

use core::ptr;

use crate::{PAGE_SIZE, PhysicalAddress};

pub enum AddressTranslator {
    /// Physical memory is mapped at `direct_map_offset`.
    Hardware { direct_map_offset: usize },
    /// Physical memory is a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware { .. })
    }

    /// Returns a pointer through which `len` bytes at `phys` can be accessed.
    ///
    /// # Panics
    ///
    /// In emulation, panics if the range falls outside the buffer.
    #[cfg_attr(not(any(test, feature = "software-emulation")), allow(unused_variables))]
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress, len: usize) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize(), len) as *mut T,
        }
    }

    pub fn read_u32(&self, phys: PhysicalAddress) -> u32 {
        // SAFETY: `phys` is a table or heap word inside memory owned by the caller.
        unsafe { ptr::read_volatile(self.phys_to_ptr::<u32>(phys, 4)) }
    }

    pub fn write_u32(&self, phys: PhysicalAddress, value: u32) {
        // SAFETY: as for `read_u32`.
        unsafe { ptr::write_volatile(self.phys_to_ptr::<u32>(phys, 4), value) }
    }

    pub fn read_u64(&self, phys: PhysicalAddress) -> u64 {
        // SAFETY: as for `read_u32`.
        unsafe { ptr::read_volatile(self.phys_to_ptr::<u64>(phys, 8)) }
    }

    pub fn write_u64(&self, phys: PhysicalAddress, value: u64) {
        // SAFETY: as for `read_u32`.
        unsafe { ptr::write_volatile(self.phys_to_ptr::<u64>(phys, 8), value) }
    }

    pub fn read_bytes(&self, phys: PhysicalAddress, buf: &mut [u8]) {
        let src = self.phys_to_ptr::<u8>(phys, buf.len());
        // SAFETY: the range was bounds-checked by `phys_to_ptr` in emulation and is direct
        // mapped on hardware; `buf` is a distinct Rust allocation.
        unsafe { ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) }
    }

    pub fn write_bytes(&self, phys: PhysicalAddress, buf: &[u8]) {
        let dst = self.phys_to_ptr::<u8>(phys, buf.len());
        // SAFETY: as for `read_bytes`.
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len()) }
    }

    pub fn zero_frame(&self, frame: PhysicalAddress) {
        // SAFETY: `frame` is a whole frame the caller has just allocated.
        unsafe { ptr::write_bytes(self.phys_to_ptr::<u8>(frame, PAGE_SIZE), 0, PAGE_SIZE) }
    }

    pub fn copy_frame(&self, from: PhysicalAddress, to: PhysicalAddress) {
        debug_assert_ne!(from, to);
        let src = self.phys_to_ptr::<u8>(from, PAGE_SIZE);
        let dst = self.phys_to_ptr::<u8>(to, PAGE_SIZE);
        // SAFETY: distinct frames never overlap.
        unsafe { ptr::copy_nonoverlapping(src, dst, PAGE_SIZE) }
    }
}

/// A host buffer standing in for physical RAM.
///
/// The buffer is allocated as `u64` words so every table entry is naturally aligned.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMemory {
    base: ptr::NonNull<u64>,
    words: usize,
}

// SAFETY: the buffer is only reached through raw pointers; callers serialize access to any given
// frame the same way they would on hardware.
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Send for EmulatedMemory {}
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Sync for EmulatedMemory {}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(8);
        let buffer = alloc::vec![0u64; words].into_boxed_slice();
        let base = ptr::NonNull::from(alloc::boxed::Box::leak(buffer)).cast::<u64>();
        Self { base, words }
    }

    pub fn size(&self) -> usize {
        self.words * 8
    }

    fn translate(&self, phys: usize, len: usize) -> *mut u8 {
        assert!(
            phys.checked_add(len).is_some_and(|end| end <= self.size()),
            "physical address {phys:#x} out of bounds"
        );
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().cast::<u8>().add(phys) }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let slice = ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
        // SAFETY: produced by `Box::leak` in `new` and never freed elsewhere.
        drop(unsafe { alloc::boxed::Box::from_raw(slice) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_bytes_share_storage() {
        let memory = AddressTranslator::emulated(4 * PAGE_SIZE);
        memory.write_u64(PhysicalAddress::new(0x1008), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(PhysicalAddress::new(0x1008)), 0x5566_7788);

        let mut buf = [0u8; 2];
        memory.read_bytes(PhysicalAddress::new(0x100E), &mut buf);
        assert_eq!(buf, [0x22, 0x11]);
    }

    #[test]
    fn copy_and_zero_frames() {
        let memory = AddressTranslator::emulated(4 * PAGE_SIZE);
        memory.write_bytes(PhysicalAddress::new(0x1000), b"kestrel");
        memory.copy_frame(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x3000));
        let mut buf = [0u8; 7];
        memory.read_bytes(PhysicalAddress::new(0x3000), &mut buf);
        assert_eq!(&buf, b"kestrel");

        memory.zero_frame(PhysicalAddress::new(0x3000));
        assert_eq!(memory.read_u64(PhysicalAddress::new(0x3000)), 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_access_panics() {
        let memory = AddressTranslator::emulated(PAGE_SIZE);
        memory.read_u64(PhysicalAddress::new(PAGE_SIZE));
    }
}
