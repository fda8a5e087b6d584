//! The kernel image as laid out by the linker script.

use kmm::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkerSection {
    Text,
    ReadOnlyData,
    Data,
    Bss,
    /// Interrupt entry points. Sits inside `.text`, so it is checked first.
    InterruptHandlers,
}

impl LinkerSection {
    const ALL: [Self; 5] = [
        Self::InterruptHandlers,
        Self::Text,
        Self::ReadOnlyData,
        Self::Data,
        Self::Bss,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Text => ".text",
            Self::ReadOnlyData => ".rodata",
            Self::Data => ".data",
            Self::Bss => ".bss",
            Self::InterruptHandlers => ".interrupt_handlers",
        }
    }

    pub fn containing(address: VirtualAddress) -> Option<Self> {
        Self::ALL.into_iter().find(|section| section.contains(address))
    }

    pub fn contains(self, address: VirtualAddress) -> bool {
        let (start, end) = self.bounds();
        address >= start && address < end
    }

    pub fn start(self) -> VirtualAddress {
        self.bounds().0
    }

    /// Start and end of the section.
    pub fn bounds(self) -> (VirtualAddress, VirtualAddress) {
        // SAFETY: the linker script defines every symbol; only their addresses are taken.
        let (start, end) = unsafe {
            match self {
                Self::Text => (&raw const __kernel_text_start, &raw const __kernel_text_end),
                Self::ReadOnlyData => (&raw const __kernel_rodata_start, &raw const __kernel_rodata_end),
                Self::Data => (&raw const __kernel_data_start, &raw const __kernel_data_end),
                Self::Bss => (&raw const __kernel_bss_start, &raw const __kernel_bss_end),
                Self::InterruptHandlers => (
                    &raw const __kernel_interrupt_handlers_start,
                    &raw const __kernel_interrupt_handlers_end,
                ),
            }
        };
        (VirtualAddress::from_ptr(start), VirtualAddress::from_ptr(end))
    }
}

unsafe extern "C" {
    static __kernel_text_start: u8;
    static __kernel_text_end: u8;
    static __kernel_rodata_start: u8;
    static __kernel_rodata_end: u8;
    static __kernel_data_start: u8;
    static __kernel_data_end: u8;
    static __kernel_bss_start: u8;
    static __kernel_bss_end: u8;
    static __kernel_interrupt_handlers_start: u8;
    static __kernel_interrupt_handlers_end: u8;
}
