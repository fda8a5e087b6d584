use core::ptr::NonNull;

use acpi::{AcpiHandler, AcpiTables, HpetInfo, PhysicalMapping};
use kmm::{Bugcode, MemoryContext, PhysicalAddress, VirtualAddress, fatal};
use limine::request::RsdpRequest;

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

/// Maps ACPI tables through the temporary physical mapping window.
#[derive(Clone)]
struct RegionHandler(&'static MemoryContext<'static>);

impl core::fmt::Debug for RegionHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionHandler").finish()
    }
}

impl AcpiHandler for RegionHandler {
    unsafe fn map_physical_region<T>(
        &self,
        physical_address: usize,
        size: usize,
    ) -> PhysicalMapping<Self, T> {
        let ctx = self.0;
        let virt = ctx
            .regions()
            .remap_phys(ctx.mapper(), PhysicalAddress::new(physical_address), size)
            .unwrap_or_else(|err| {
                fatal(
                    Bugcode::from(err),
                    "acpi",
                    format_args!("mapping {physical_address:#x}+{size:#x}: {err}"),
                )
            });
        let Some(pointer) = NonNull::new(virt.as_mut_ptr::<T>()) else {
            fatal(
                Bugcode::MemoryManagement,
                "acpi",
                format_args!("{physical_address:#x} mapped to null"),
            );
        };
        // SAFETY: `size` bytes from `pointer` are mapped to `physical_address` until unmapped.
        unsafe { PhysicalMapping::new(physical_address, pointer, size, size, self.clone()) }
    }

    fn unmap_physical_region<T>(region: &PhysicalMapping<Self, T>) {
        let ctx = region.handler().0;
        let virt = VirtualAddress::from_ptr(region.virtual_start().as_ptr());
        if let Err(err) = ctx
            .regions()
            .unmap_phys(ctx.mapper(), virt, region.mapped_length())
        {
            log::warn!("acpi: unmapping {virt}: {err}");
        }
    }
}

pub fn init(ctx: &'static MemoryContext<'static>) {
    let Some(rsdp) = RSDP_REQUEST.get_response() else {
        log::info!("acpi: no RSDP from the bootloader");
        return;
    };

    // Older base revisions report the RSDP through the direct map.
    let mut rsdp_address = rsdp.address();
    if let Some(offset) = ctx.layout().direct_map {
        if rsdp_address >= offset {
            rsdp_address -= offset;
        }
    }

    // SAFETY: the bootloader found an RSDP at this physical address.
    let tables = match unsafe { AcpiTables::from_rsdp(RegionHandler(ctx), rsdp_address) } {
        Ok(tables) => tables,
        Err(err) => {
            log::warn!("acpi: reading tables at {rsdp_address:#x}: {err:?}");
            return;
        }
    };

    match HpetInfo::new(&tables) {
        Ok(hpet) => log::info!("acpi: HPET at {:#x}", hpet.base_address),
        Err(err) => log::debug!("acpi: no HPET ({err:?})"),
    }
}
