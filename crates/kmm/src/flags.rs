//! Flags accepted by [`Mapper::allocate_page`](crate::Mapper::allocate_page) and
//! [`Mapper::map_address`](crate::Mapper::map_address).

bitflags::bitflags! {
    /// How a page should be backed and what it may be used for.
    ///
    /// The default (empty) set means: user accessible, writable, cached, executable, present,
    /// with a fresh frame from the PMM.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Supervisor only.
        const KERNEL = 1 << 0;
        const READ_ONLY = 1 << 1;
        const WRITE_THROUGH = 1 << 2;
        const NO_CACHE = 1 << 3;
        /// Reserve the entry without making it present.
        const NOT_PRESENT = 1 << 4;
        /// The entry already names its frame; do not take one from the PMM.
        const NO_ALLOC = 1 << 5;
        /// Ignored by formats without an NX bit.
        const NO_EXECUTE = 1 << 6;
    }
}
