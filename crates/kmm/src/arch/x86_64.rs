//! x86_64 control-register and TLB access.

use ::x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

pub(super) unsafe fn load_directory(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: the caller guarantees `root` is a complete directory for this CPU.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

pub(super) fn invalidate_page(address: VirtualAddress) {
    tlb::flush(VirtAddr::new_truncate(address.as_usize() as u64));
}

pub(super) fn active_directory() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}
