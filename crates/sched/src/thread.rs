use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::Process;

/// Scheduling class. Decides the length of a thread's quantum, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Med,
    Low,
}

impl Priority {
    /// Timer ticks a thread keeps the CPU once scheduled.
    pub const fn timeslice(self) -> u32 {
        match self {
            Self::High => 5,
            Self::Med => 4,
            Self::Low => 3,
        }
    }
}

/// Where a thread normally runs. Kernel threads are never preempted by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// In the run queue.
    Queued = 0,
    Running = 1,
    /// Off the queue until something inserts it again.
    Blocked = 2,
    Exited = 3,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Exited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    id: ThreadId,
    name: String,
    process: Arc<Process>,
    priority: Priority,
    mode: ExecutionMode,
    state: AtomicU8,
    timeslice: AtomicU32,
    ticks: AtomicU64,
    stack_pointer: AtomicUsize,
}

impl Thread {
    /// Creates a thread in `process`. It starts out [`ThreadState::Queued`] with a full quantum,
    /// but is not in any queue until inserted.
    pub fn new(
        process: &Arc<Process>,
        name: &str,
        priority: Priority,
        mode: ExecutionMode,
    ) -> Arc<Self> {
        process.thread_started();
        let id = ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed));
        log::debug!("thread {id} ({name}) created in process {}", process.pid());
        Arc::new(Self {
            id,
            name: String::from(name),
            process: process.clone(),
            priority,
            mode,
            state: AtomicU8::new(ThreadState::Queued as u8),
            timeslice: AtomicU32::new(priority.timeslice()),
            ticks: AtomicU64::new(0),
            stack_pointer: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ticks left in the current quantum.
    pub fn timeslice(&self) -> u32 {
        self.timeslice.load(Ordering::Acquire)
    }

    pub(crate) fn reset_timeslice(&self) {
        self.timeslice
            .store(self.priority.timeslice(), Ordering::Release);
    }

    /// Charges `ticks` to the thread and returns what is left of its quantum.
    pub(crate) fn consume(&self, ticks: u32) -> u32 {
        self.ticks.fetch_add(u64::from(ticks), Ordering::Relaxed);
        let left = self.timeslice().saturating_sub(ticks);
        self.timeslice.store(left, Ordering::Release);
        left
    }

    /// Ticks the thread has run for in total.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Saved kernel stack pointer while the thread is switched out.
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Acquire)
    }

    /// The slot a context switch saves the outgoing stack pointer into.
    pub fn stack_pointer_slot(&self) -> &AtomicUsize {
        &self.stack_pointer
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.process.pid())
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("timeslice", &self.timeslice())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use kmm::{AddressSpace, MemoryContext, MemoryLayout};

    use super::*;

    #[test]
    fn consume_saturates_and_counts_ticks() {
        let ctx = MemoryContext::emulated(MemoryLayout::i386(), 4 * 1024 * 1024).unwrap();
        let kernel = Process::kernel(AddressSpace::kernel(&ctx));
        let thread = Thread::new(&kernel, "t", Priority::Low, ExecutionMode::User);

        assert_eq!(thread.consume(2), 1);
        assert_eq!(thread.consume(5), 0);
        assert_eq!(thread.ticks(), 7);

        thread.reset_timeslice();
        assert_eq!(thread.timeslice(), 3);
        assert_eq!(thread.ticks(), 7);
    }

    #[test]
    fn threads_get_distinct_ids_and_count_against_their_process() {
        let ctx = MemoryContext::emulated(MemoryLayout::i386(), 4 * 1024 * 1024).unwrap();
        let kernel = Process::kernel(AddressSpace::kernel(&ctx));
        let a = Thread::new(&kernel, "a", Priority::High, ExecutionMode::Kernel);
        let b = Thread::new(&kernel, "b", Priority::High, ExecutionMode::Kernel);

        assert_ne!(a.id(), b.id());
        assert_eq!(kernel.thread_count(), 2);
        assert_eq!(a.state(), ThreadState::Queued);
        assert_eq!(a.timeslice(), 5);
    }
}
