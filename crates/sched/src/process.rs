use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use kmm::{AddressSpace, Directory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    pub const KERNEL: Self = Self(0);

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// A process: an address space plus the threads running in it.
pub struct Process {
    pid: ProcessId,
    name: String,
    directory: Directory,
    address_space: spin::Mutex<Option<AddressSpace>>,
    threads: AtomicUsize,
}

impl Process {
    pub fn new(name: &str, address_space: AddressSpace) -> Arc<Self> {
        let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed));
        Self::with_pid(pid, name, address_space)
    }

    /// The kernel's own process, which owns the kernel directory.
    pub fn kernel(address_space: AddressSpace) -> Arc<Self> {
        Self::with_pid(ProcessId::KERNEL, "kernel", address_space)
    }

    fn with_pid(pid: ProcessId, name: &str, address_space: AddressSpace) -> Arc<Self> {
        log::debug!("process {pid} ({name}) created on {:?}", address_space.directory());
        Arc::new(Self {
            pid,
            name: String::from(name),
            directory: address_space.directory(),
            address_space: spin::Mutex::new(Some(address_space)),
            threads: AtomicUsize::new(0),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory threads of this process run on.
    pub fn directory(&self) -> Directory {
        self.directory
    }

    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    pub(crate) fn thread_started(&self) {
        self.threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the number of threads left.
    pub(crate) fn thread_exited(&self) -> usize {
        self.threads.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Runs `f` on the address space, unless it has already been taken for teardown.
    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> Option<R> {
        self.address_space.lock().as_mut().map(f)
    }

    /// Removes the address space so it can be destroyed.
    pub fn take_address_space(&self) -> Option<AddressSpace> {
        self.address_space.lock().take()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("threads", &self.thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use kmm::{MemoryContext, MemoryLayout, PAGE_SIZE};

    use super::*;

    #[test]
    fn taking_the_address_space_ends_access_to_it() {
        let ctx = MemoryContext::emulated(MemoryLayout::i386(), 8 * 1024 * 1024).unwrap();
        let process = Process::new("user", AddressSpace::create(&ctx, None).unwrap());
        assert_ne!(process.pid(), ProcessId::KERNEL);

        let base = process
            .with_address_space(|space| space.sbrk(ctx.mapper(), PAGE_SIZE as isize))
            .unwrap()
            .unwrap();
        assert_eq!(
            process.with_address_space(|space| space.brk()),
            Some(base + PAGE_SIZE)
        );

        let mut space = process.take_address_space().unwrap();
        assert_eq!(space.directory(), process.directory());
        assert!(process.with_address_space(|_| ()).is_none());
        space.destroy(&ctx).unwrap();
    }
}
