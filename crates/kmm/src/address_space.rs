//! Per-process memory.

use core::ops::Range;

use crate::{
    Directory, Lookup, MapFlags, Mapper, MemoryContext, MemoryError, PAGE_SIZE, VirtualAddress,
};

/// Pages on the kernel heap a process's threads run on in kernel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: VirtualAddress,
    pub size: usize,
}

impl KernelStack {
    /// Initial stack pointer.
    pub fn top(&self) -> VirtualAddress {
        self.base + self.size
    }
}

/// Outcome of [`AddressSpace::handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page was backed and the access can be retried.
    Resolved,
    /// The address is outside every lazily backed window, or already present.
    NotHandled,
}

/// A directory plus the user-space bookkeeping that goes with it.
#[derive(Debug)]
pub struct AddressSpace {
    directory: Directory,
    owned: bool,
    heap_base: VirtualAddress,
    brk: VirtualAddress,
    user_stack: Range<usize>,
    kernel_base: VirtualAddress,
    kernel_stack: Option<KernelStack>,
}

impl AddressSpace {
    /// The kernel's own address space. It is never torn down.
    pub fn kernel(ctx: &MemoryContext<'_>) -> Self {
        let layout = ctx.layout();
        Self {
            directory: ctx.mapper().kernel_directory(),
            owned: false,
            heap_base: VirtualAddress::new(layout.user_heap_base),
            brk: VirtualAddress::new(layout.user_heap_base),
            user_stack: layout.user_stack.clone(),
            kernel_base: ctx.mapper().kernel_base(),
            kernel_stack: None,
        }
    }

    /// Creates a new address space, copying the user half of `parent` (or starting empty), with
    /// its own kernel stack.
    pub fn create(ctx: &MemoryContext<'_>, parent: Option<&AddressSpace>) -> Result<Self, MemoryError> {
        let mapper = ctx.mapper();
        let layout = ctx.layout();
        let source = parent.map_or(mapper.kernel_directory(), |parent| parent.directory);
        let directory = mapper.clone_address_space(Some(source))?;

        let pages = layout.kernel_stack_size.div_ceil(PAGE_SIZE);
        let base = match ctx.heap().allocate_pages(mapper, pages) {
            Ok(base) => base,
            Err(err) => {
                let _ = mapper.destroy_address_space(directory);
                return Err(err);
            }
        };

        let (heap_base, brk) = match parent {
            Some(parent) => (parent.heap_base, parent.brk),
            None => {
                let base = VirtualAddress::new(layout.user_heap_base);
                (base, base)
            }
        };
        log::debug!("address space: created {directory:?}, kernel stack at {base}");
        Ok(Self {
            directory,
            owned: true,
            heap_base,
            brk,
            user_stack: layout.user_stack.clone(),
            kernel_base: mapper.kernel_base(),
            kernel_stack: Some(KernelStack {
                base,
                size: pages * PAGE_SIZE,
            }),
        })
    }

    pub fn directory(&self) -> Directory {
        self.directory
    }

    pub fn is_kernel(&self) -> bool {
        !self.owned
    }

    pub fn kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack
    }

    pub fn heap_base(&self) -> VirtualAddress {
        self.heap_base
    }

    /// Current program break.
    pub fn brk(&self) -> VirtualAddress {
        self.brk
    }

    /// Moves the program break by `increment` bytes and returns the old break.
    ///
    /// Growth only moves the break; pages are backed on first touch by
    /// [`handle_fault`](Self::handle_fault). Shrinking frees every page that lies entirely above
    /// the new break.
    pub fn sbrk(&mut self, mapper: &Mapper<'_>, increment: isize) -> Result<VirtualAddress, MemoryError> {
        let old = self.brk;
        let new = old
            .as_usize()
            .checked_add_signed(increment)
            .map(VirtualAddress::new)
            .ok_or(MemoryError::InvalidRange)?;
        if new < self.heap_base {
            return Err(MemoryError::InvalidArgument);
        }
        if new.as_usize() >= self.user_stack.start || new >= self.kernel_base {
            log::warn!("address space: break {new} would run into the stack");
            return Err(MemoryError::InvalidRange);
        }

        if new < old {
            let mut page = new.align_up(PAGE_SIZE);
            while page < old {
                if let Some(handle) = mapper.get_page(Some(self.directory), page, Lookup::Existing)? {
                    if mapper.entry(&handle).has_frame() {
                        mapper.free_page(&handle)?;
                    }
                }
                page = page + PAGE_SIZE;
            }
        }
        self.brk = new;
        Ok(old)
    }

    fn in_heap(&self, address: VirtualAddress) -> bool {
        address >= self.heap_base && address < self.brk.align_up(PAGE_SIZE)
    }

    fn in_user_stack(&self, address: VirtualAddress) -> bool {
        self.user_stack.contains(&address.as_usize())
    }

    /// Backs the page containing `address` if it lies in the heap or user stack window.
    pub fn handle_fault(
        &self,
        mapper: &Mapper<'_>,
        address: VirtualAddress,
    ) -> Result<FaultResolution, MemoryError> {
        if !self.in_heap(address) && !self.in_user_stack(address) {
            return Ok(FaultResolution::NotHandled);
        }
        let page = mapper.get_or_create_page(Some(self.directory), address)?;
        if mapper.entry(&page).is_present() {
            return Ok(FaultResolution::NotHandled);
        }
        mapper.allocate_page(&page, MapFlags::NO_EXECUTE)?;
        log::trace!("address space: faulted in {} for {:?}", page.address(), self.directory);
        Ok(FaultResolution::Resolved)
    }

    /// Releases the directory and kernel stack. Afterwards this is an alias of the kernel space.
    ///
    /// The directory must not be active on the calling CPU.
    pub fn destroy(&mut self, ctx: &MemoryContext<'_>) -> Result<(), MemoryError> {
        if !self.owned {
            return Err(MemoryError::InvalidArgument);
        }
        let mapper = ctx.mapper();
        mapper.destroy_address_space(self.directory)?;
        if let Some(stack) = self.kernel_stack.take() {
            ctx.heap()
                .free_pages(mapper, stack.base, stack.size / PAGE_SIZE)?;
        }
        self.directory = mapper.kernel_directory();
        self.owned = false;
        Ok(())
    }
}
