//! i386 control-register and TLB access.

use core::arch::asm;

use crate::{PhysicalAddress, VirtualAddress};

pub(super) unsafe fn load_directory(root: PhysicalAddress) {
    // SAFETY: the caller guarantees `root` is a complete directory for this CPU.
    unsafe { asm!("mov cr3, {}", in(reg) root.as_usize(), options(nostack, preserves_flags)) };
}

pub(super) fn invalidate_page(address: VirtualAddress) {
    // SAFETY: invlpg only drops a cached translation.
    unsafe { asm!("invlpg [{}]", in(reg) address.as_usize(), options(nostack, preserves_flags)) };
}

pub(super) fn active_directory() -> PhysicalAddress {
    let value: usize;
    // SAFETY: reading CR3 has no side effects.
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    PhysicalAddress::new(value & !0xFFF)
}
