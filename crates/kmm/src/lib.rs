#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kestrel Memory Manager (KMM)
//!
//! The memory core of the Kestrel kernel:
//!
//! - A bitmap physical frame allocator.
//! - Page table mapping for i386 (two-level) and x86_64 (four- and five-level) formats, chosen at
//!   runtime, with address-space cloning and teardown.
//! - Chunk pools for the DMA, MMIO and driver regions.
//! - A liballoc-style kernel heap on top of the mapper.
//! - Per-process address spaces with a lazily backed heap and user stack.
//!
//! Everything hangs off a [`MemoryContext`]. With the `software-emulation` feature (and under
//! `cargo test`) physical memory is a host buffer, so the whole core runs in user space.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod bitmap;
mod clone;
mod context;
mod error;
mod flags;
mod heap;
mod layout;
mod numbers;
mod page_directory;
mod phys;
mod physical_memory_manager;
mod pool;
mod regions;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, FaultResolution, KernelStack};
pub use arch::{PAGE_SIZE, PageEntry, PagingMode};
pub use bitmap::Bitmap;
pub use clone::{ClonePolicy, KernelSplit};
pub use context::MemoryContext;
pub use error::{Bugcode, MemoryError, OrFatal, fatal};
pub use flags::MapFlags;
pub use heap::{AllocatorInfo, HEAP_ALIGN, HeapStats, KernelHeap};
pub use layout::MemoryLayout;
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{Directory, FrameStats, Lookup, MAX_CPUS, Mapper, PageHandle};
#[cfg(any(test, feature = "software-emulation"))]
pub use phys::EmulatedMemory;
pub use phys::AddressTranslator;
pub use physical_memory_manager::PhysicalMemoryManager;
pub use pool::Pool;
pub use regions::{DmaBuffer, DriverRegion, Regions};
