use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use kmm::{Bugcode, Directory, MAX_CPUS, fatal};

use crate::{ExecutionMode, Process, Thread, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The queue is empty and the CPU has no idle thread.
    NoIdleThread,
    InvalidCpu,
    /// The CPU has no current thread.
    NotRunning,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoIdleThread => write!(f, "nothing to run and no idle thread"),
            Self::InvalidCpu => write!(f, "cpu index out of range"),
            Self::NotRunning => write!(f, "no thread is running"),
        }
    }
}

/// What the caller has to do to get from one thread to the next.
#[derive(Debug)]
pub struct Switch {
    pub previous: Option<Arc<Thread>>,
    pub next: Arc<Thread>,
    /// The directory to load, if `next` runs in a different address space than `previous`.
    pub directory: Option<Directory>,
    /// Set when `previous` was the last thread of its process. The caller tears the address space
    /// down once it has switched away from it.
    pub exited: Option<Arc<Process>>,
}

struct CpuSlot {
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
}

impl CpuSlot {
    const EMPTY: Self = Self {
        current: None,
        idle: None,
    };

    fn is_idle(&self, thread: &Arc<Thread>) -> bool {
        self.idle.as_ref().is_some_and(|idle| Arc::ptr_eq(idle, thread))
    }
}

/// Round-robin scheduler over one FIFO queue shared by every CPU.
///
/// All state sits behind spin locks, taken slot first, then queue. Code that can also be
/// entered from the timer interrupt must call in with interrupts disabled. [`queued`] and the
/// idle check in [`update`] read an atomic length and never wait for the queue lock.
///
/// [`queued`]: Self::queued
/// [`update`]: Self::update
pub struct Scheduler {
    queue: spin::Mutex<VecDeque<Arc<Thread>>>,
    /// Mirrors `queue.len()`, updated under the queue lock.
    len: AtomicUsize,
    cpus: [spin::Mutex<CpuSlot>; MAX_CPUS],
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queue: spin::Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            cpus: [const { spin::Mutex::new(CpuSlot::EMPTY) }; MAX_CPUS],
        }
    }

    fn slot(&self, cpu: usize) -> Result<&spin::Mutex<CpuSlot>, SchedulerError> {
        self.cpus.get(cpu).ok_or(SchedulerError::InvalidCpu)
    }

    /// Installs the thread `cpu` runs when the queue is empty.
    pub fn set_idle_thread(&self, cpu: usize, thread: Arc<Thread>) -> Result<(), SchedulerError> {
        self.slot(cpu)?.lock().idle = Some(thread);
        Ok(())
    }

    fn push(&self, queue: &mut VecDeque<Arc<Thread>>, thread: Arc<Thread>) {
        queue.push_back(thread);
        self.len.store(queue.len(), Ordering::Release);
    }

    /// Appends `thread` to the queue with a fresh quantum.
    ///
    /// A thread is queued at most once. Exited threads, threads already in the queue and threads
    /// running on some CPU are left alone; running threads go back through
    /// [`reschedule`](Self::reschedule) or [`yield_current`](Self::yield_current).
    pub fn insert_thread(&self, thread: Arc<Thread>) {
        let mut queue = self.queue.lock();
        match thread.state() {
            ThreadState::Exited => {
                log::warn!("scheduler: not queueing exited thread {}", thread.id());
                return;
            }
            ThreadState::Running => {
                log::warn!("scheduler: not queueing running thread {}", thread.id());
                return;
            }
            ThreadState::Queued if queue.iter().any(|queued| Arc::ptr_eq(queued, &thread)) => {
                log::debug!("scheduler: thread {} is already queued", thread.id());
                return;
            }
            ThreadState::Queued | ThreadState::Blocked => {}
        }
        thread.reset_timeslice();
        thread.set_state(ThreadState::Queued);
        log::trace!("scheduler: queued thread {}", thread.id());
        self.push(&mut queue, thread);
    }

    /// Takes `thread` off the queue. Returns whether it was queued.
    pub fn remove_thread(&self, thread: &Arc<Thread>) -> bool {
        let mut queue = self.queue.lock();
        let Some(index) = queue.iter().position(|queued| Arc::ptr_eq(queued, thread)) else {
            return false;
        };
        queue.remove(index);
        self.len.store(queue.len(), Ordering::Release);
        true
    }

    /// Number of queued threads. Lock-free, so safe from interrupt context.
    pub fn queued(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn current(&self, cpu: usize) -> Option<Arc<Thread>> {
        self.slot(cpu).ok()?.lock().current.clone()
    }

    fn pop(&self, slot: &CpuSlot) -> Result<Arc<Thread>, SchedulerError> {
        let mut queue = self.queue.lock();
        if let Some(thread) = queue.pop_front() {
            self.len.store(queue.len(), Ordering::Release);
            return Ok(thread);
        }
        drop(queue);
        slot.idle.clone().ok_or(SchedulerError::NoIdleThread)
    }

    /// Pops the head of the queue, falling back to the CPU's idle thread.
    pub fn get(&self, cpu: usize) -> Result<Arc<Thread>, SchedulerError> {
        let slot = self.slot(cpu)?.lock();
        self.pop(&slot)
    }

    /// Like [`get`](Self::get), but running out of threads stops the system.
    pub fn next(&self, cpu: usize) -> Arc<Thread> {
        match self.get(cpu) {
            Ok(thread) => thread,
            Err(err) => fatal(Bugcode::SchedulerError, "scheduler", format_args!("cpu {cpu}: {err}")),
        }
    }

    /// Puts the running thread back at the tail of the queue with a fresh quantum. It stays
    /// current until the caller switches away.
    pub fn reschedule(&self, cpu: usize) {
        let Ok(slot) = self.slot(cpu) else {
            return;
        };
        let slot = slot.lock();
        let Some(current) = slot.current.as_ref() else {
            return;
        };
        if slot.is_idle(current) || current.state() != ThreadState::Running {
            return;
        }
        current.reset_timeslice();
        current.set_state(ThreadState::Queued);
        self.push(&mut self.queue.lock(), current.clone());
    }

    /// Timer hook. Charges `ticks` to the running thread and returns whether the caller should
    /// switch now.
    ///
    /// Only user threads interrupted in user mode (`from_user`) are preempted; an exhausted
    /// quantum otherwise waits for the next such tick. The idle thread gives way as soon as
    /// anything is queued.
    pub fn update(&self, cpu: usize, ticks: u32, from_user: bool) -> bool {
        let (current, idle) = match self.slot(cpu) {
            Ok(slot) => {
                let slot = slot.lock();
                let idle = slot.current.as_ref().is_some_and(|current| slot.is_idle(current));
                (slot.current.clone(), idle)
            }
            Err(err) => fatal(Bugcode::SchedulerError, "scheduler", format_args!("cpu {cpu}: {err}")),
        };

        let Some(current) = current else {
            return self.queued() > 0;
        };
        let left = current.consume(ticks);
        if idle {
            return self.queued() > 0;
        }
        if left > 0 || current.mode() == ExecutionMode::Kernel || !from_user {
            return false;
        }
        log::trace!("scheduler: thread {} used up its quantum", current.id());
        self.reschedule(cpu);
        true
    }

    fn switch_to(
        &self,
        slot: &mut CpuSlot,
        previous: Option<Arc<Thread>>,
        exited: Option<Arc<Process>>,
    ) -> Result<Switch, SchedulerError> {
        let next = self.pop(slot)?;
        next.set_state(ThreadState::Running);
        slot.current = Some(next.clone());

        let directory = match &previous {
            Some(previous) if previous.process().directory() == next.process().directory() => None,
            _ => Some(next.process().directory()),
        };
        Ok(Switch {
            previous,
            next,
            directory,
            exited,
        })
    }

    /// Gives up the CPU.
    ///
    /// With `reschedule` the running thread goes back on the queue; without it, it is blocked
    /// until someone inserts it again. A thread already re-queued by [`update`](Self::update)
    /// stays queued either way.
    pub fn yield_current(&self, cpu: usize, reschedule: bool) -> Result<Switch, SchedulerError> {
        if reschedule {
            self.reschedule(cpu);
        }
        let mut slot = self.slot(cpu)?.lock();
        let previous = slot.current.take();
        if let Some(previous) = &previous {
            if slot.is_idle(previous) {
                previous.set_state(ThreadState::Queued);
            } else if previous.state() == ThreadState::Running {
                previous.set_state(ThreadState::Blocked);
            }
        }

        match self.switch_to(&mut slot, previous.clone(), None) {
            Ok(switch) => Ok(switch),
            Err(err) => {
                if let Some(previous) = &previous {
                    previous.set_state(ThreadState::Running);
                }
                slot.current = previous;
                Err(err)
            }
        }
    }

    /// Retires the running thread and picks the next one.
    pub fn exit_current(&self, cpu: usize) -> Result<Switch, SchedulerError> {
        let mut slot = self.slot(cpu)?.lock();
        let previous = slot.current.take().ok_or(SchedulerError::NotRunning)?;
        previous.set_state(ThreadState::Exited);
        self.remove_thread(&previous);

        let process = previous.process().clone();
        let exited = (process.thread_exited() == 0).then_some(process);
        log::debug!("scheduler: thread {} exited", previous.id());
        self.switch_to(&mut slot, Some(previous), exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, ThreadId};
    use kmm::{AddressSpace, MemoryContext, MemoryLayout};

    fn setup() -> (MemoryContext<'static>, Arc<Process>, Scheduler) {
        let ctx = MemoryContext::emulated(MemoryLayout::i386(), 8 * 1024 * 1024).unwrap();
        let kernel = Process::kernel(AddressSpace::kernel(&ctx));
        let scheduler = Scheduler::new();
        let idle = Thread::new(&kernel, "idle", Priority::Low, ExecutionMode::Kernel);
        scheduler.set_idle_thread(0, idle).unwrap();
        (ctx, kernel, scheduler)
    }

    fn user_thread(process: &Arc<Process>, priority: Priority) -> Arc<Thread> {
        Thread::new(process, "worker", priority, ExecutionMode::User)
    }

    fn ids(scheduler: &Scheduler, count: usize) -> Vec<ThreadId> {
        (0..count)
            .map(|_| scheduler.yield_current(0, false).unwrap().next.id())
            .collect()
    }

    #[test]
    fn quantum_follows_priority() {
        let (_ctx, kernel, scheduler) = setup();
        for priority in [Priority::High, Priority::Med, Priority::Low] {
            let thread = user_thread(&kernel, priority);
            scheduler.insert_thread(thread.clone());
            let switch = scheduler.yield_current(0, false).unwrap();
            assert!(Arc::ptr_eq(&switch.next, &thread));

            for _ in 1..priority.timeslice() {
                assert!(!scheduler.update(0, 1, true));
            }
            assert!(scheduler.update(0, 1, true));
            assert_eq!(thread.state(), ThreadState::Queued);
            assert_eq!(thread.timeslice(), priority.timeslice());
            assert_eq!(thread.ticks(), u64::from(priority.timeslice()));
            assert!(scheduler.remove_thread(&thread));
        }
    }

    #[test]
    fn kernel_mode_is_not_preempted() {
        let (_ctx, kernel, scheduler) = setup();
        let worker = Thread::new(&kernel, "kworker", Priority::High, ExecutionMode::Kernel);
        scheduler.insert_thread(worker.clone());
        scheduler.yield_current(0, false).unwrap();
        for _ in 0..20 {
            assert!(!scheduler.update(0, 1, true));
        }
        assert_eq!(worker.timeslice(), 0);

        let user = user_thread(&kernel, Priority::Low);
        scheduler.insert_thread(user.clone());
        scheduler.yield_current(0, true).unwrap();
        assert!(Arc::ptr_eq(&scheduler.current(0).unwrap(), &user));
        // Exhausted while in a system call: the switch waits for a tick taken in user mode.
        assert!(!scheduler.update(0, 3, false));
        assert!(scheduler.update(0, 1, true));
    }

    #[test]
    fn queue_is_fifo_regardless_of_priority() {
        let (_ctx, kernel, scheduler) = setup();
        let threads = [Priority::Low, Priority::High, Priority::Med].map(|p| user_thread(&kernel, p));
        for thread in &threads {
            scheduler.insert_thread(thread.clone());
        }
        let expected: Vec<_> = threads.iter().map(|t| t.id()).collect();
        assert_eq!(ids(&scheduler, 3), expected);
    }

    #[test]
    fn empty_queue_falls_back_to_idle() {
        let (_ctx, _kernel, scheduler) = setup();
        for _ in 0..3 {
            let next = scheduler.next(0);
            assert_eq!(next.name(), "idle");
        }
        let switch = scheduler.yield_current(0, true).unwrap();
        assert_eq!(switch.next.name(), "idle");
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn idle_gives_way_to_new_work() {
        let (_ctx, kernel, scheduler) = setup();
        scheduler.yield_current(0, false).unwrap();
        assert!(!scheduler.update(0, 1, false));
        scheduler.insert_thread(user_thread(&kernel, Priority::Med));
        assert!(scheduler.update(0, 1, false));
    }

    #[test]
    fn missing_idle_thread_is_an_error() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.get(0).err(), Some(SchedulerError::NoIdleThread));
        assert_eq!(scheduler.get(MAX_CPUS).err(), Some(SchedulerError::InvalidCpu));
    }

    #[test]
    #[should_panic(expected = "SCHEDULER_ERROR")]
    fn next_without_idle_thread_is_fatal() {
        Scheduler::new().next(0);
    }

    #[test]
    fn yield_without_reschedule_blocks() {
        let (_ctx, kernel, scheduler) = setup();
        let thread = user_thread(&kernel, Priority::Med);
        scheduler.insert_thread(thread.clone());
        scheduler.yield_current(0, false).unwrap();
        scheduler.yield_current(0, false).unwrap();
        assert_eq!(thread.state(), ThreadState::Blocked);
        assert_eq!(scheduler.queued(), 0);

        scheduler.insert_thread(thread.clone());
        assert_eq!(thread.state(), ThreadState::Queued);
        assert!(Arc::ptr_eq(&scheduler.yield_current(0, false).unwrap().next, &thread));
    }

    #[test]
    fn switches_report_directory_changes() {
        let (ctx, kernel, scheduler) = setup();
        let other = Process::new("init", AddressSpace::create(&ctx, None).unwrap());
        let a = user_thread(&kernel, Priority::Med);
        let b = user_thread(&kernel, Priority::Med);
        let c = user_thread(&other, Priority::Med);
        for thread in [&a, &b, &c] {
            scheduler.insert_thread(thread.clone());
        }

        let first = scheduler.yield_current(0, false).unwrap();
        assert_eq!(first.directory, Some(kernel.directory()));
        let second = scheduler.yield_current(0, false).unwrap();
        assert!(Arc::ptr_eq(&second.next, &b));
        assert_eq!(second.directory, None);
        let third = scheduler.yield_current(0, false).unwrap();
        assert_eq!(third.directory, Some(other.directory()));
    }

    #[test]
    fn a_thread_is_queued_at_most_once() {
        let (_ctx, kernel, scheduler) = setup();
        let thread = user_thread(&kernel, Priority::Med);
        scheduler.insert_thread(thread.clone());
        scheduler.insert_thread(thread.clone());
        assert_eq!(scheduler.queued(), 1);

        let switch = scheduler.yield_current(0, false).unwrap();
        assert!(Arc::ptr_eq(&switch.next, &thread));
        assert_eq!(thread.state(), ThreadState::Running);
        scheduler.insert_thread(thread.clone());
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(thread.state(), ThreadState::Running);

        // Re-queued by a preempting tick, then inserted again by someone else.
        for _ in 0..Priority::Med.timeslice() {
            scheduler.update(0, 1, true);
        }
        assert_eq!(scheduler.queued(), 1);
        scheduler.insert_thread(thread.clone());
        assert_eq!(scheduler.queued(), 1);
    }

    #[test]
    fn tick_path_does_not_wait_for_the_queue_lock() {
        let (_ctx, kernel, scheduler) = setup();
        scheduler.yield_current(0, false).unwrap();
        scheduler.insert_thread(user_thread(&kernel, Priority::Low));

        let held = scheduler.queue.lock();
        assert_eq!(scheduler.queued(), 1);
        assert!(scheduler.update(0, 1, false));
        drop(held);

        assert_eq!(scheduler.yield_current(0, false).unwrap().next.name(), "worker");
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn last_thread_exit_hands_back_the_process() {
        let (ctx, _kernel, scheduler) = setup();
        let before = ctx.mapper().frame_stats();
        let process = Process::new("init", AddressSpace::create(&ctx, None).unwrap());
        let first = user_thread(&process, Priority::High);
        let second = user_thread(&process, Priority::High);
        scheduler.insert_thread(first.clone());
        scheduler.insert_thread(second.clone());
        assert_eq!(process.thread_count(), 2);

        scheduler.yield_current(0, false).unwrap();
        let switch = scheduler.exit_current(0).unwrap();
        assert!(switch.exited.is_none());
        assert!(Arc::ptr_eq(&switch.next, &second));

        let switch = scheduler.exit_current(0).unwrap();
        assert_eq!(switch.next.name(), "idle");
        assert_eq!(first.state(), ThreadState::Exited);
        let exited = switch.exited.unwrap();
        assert_eq!(exited.pid(), process.pid());

        let mut space = exited.take_address_space().unwrap();
        space.destroy(&ctx).unwrap();
        assert_eq!(ctx.mapper().frame_stats(), before);
        assert_eq!(scheduler.exit_current(1).err(), Some(SchedulerError::NotRunning));
    }
}
