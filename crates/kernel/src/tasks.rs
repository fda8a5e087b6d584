//! Kernel threads on top of the scheduler: stacks, the switch itself, and cleanup of exited
//! threads.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use kmm::{AddressSpace, Bugcode, OrFatal, PAGE_SIZE, VirtualAddress, fatal};
use sched::{ExecutionMode, Priority, Process, Scheduler, SchedulerError, Switch, Thread, ThreadId};

use crate::{arch, mem};

const KERNEL_STACK_PAGES: usize = 4;

static SCHEDULER: Scheduler = Scheduler::new();
static KERNEL_PROCESS: spin::Once<Arc<Process>> = spin::Once::new();
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Heap stacks of spawned threads.
static STACKS: spin::Mutex<Vec<(ThreadId, VirtualAddress)>> = spin::Mutex::new(Vec::new());

/// Exited threads, plus their process if it has no threads left. Cleaned up by whichever thread
/// runs next, since nothing can free the stack it is running on.
static GRAVEYARD: spin::Mutex<Vec<(Arc<Thread>, Option<Arc<Process>>)>> =
    spin::Mutex::new(Vec::new());

fn scheduler_fatal(err: SchedulerError) -> ! {
    fatal(Bugcode::SchedulerError, "tasks", format_args!("{err}"))
}

/// Creates the kernel process and turns the boot thread into this CPU's idle thread.
pub fn init() {
    let ctx = mem::context();
    let kernel = KERNEL_PROCESS.call_once(|| Process::kernel(AddressSpace::kernel(ctx)));
    let idle = Thread::new(kernel, "idle", Priority::Low, ExecutionMode::Kernel);
    SCHEDULER
        .set_idle_thread(arch::cpu_id(), idle)
        .unwrap_or_else(|err| scheduler_fatal(err));

    // Nothing is queued yet, so this only records the boot thread as running.
    let switch = SCHEDULER
        .yield_current(arch::cpu_id(), false)
        .unwrap_or_else(|err| scheduler_fatal(err));
    log::info!("tasks: boot thread is now idle thread {}", switch.next.id());
}

pub fn kernel_process() -> &'static Arc<Process> {
    match KERNEL_PROCESS.get() {
        Some(process) => process,
        None => fatal(
            Bugcode::SchedulerError,
            "tasks",
            format_args!("tasks used before initialization"),
        ),
    }
}

/// The timer tick takes the scheduler's CPU slot lock, so thread-context callers hold
/// interrupts off while they touch scheduler state.
pub fn current_thread() -> Option<Arc<Thread>> {
    arch::without_interrupts(|| SCHEDULER.current(arch::cpu_id()))
}

pub fn current_process() -> Option<Arc<Process>> {
    current_thread().map(|thread| thread.process().clone())
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Starts a kernel thread in the kernel process.
pub fn spawn(name: &str, priority: Priority, entry: fn()) -> Arc<Thread> {
    spawn_in(kernel_process(), name, priority, entry)
}

/// Starts a kernel-mode thread in `process`. It runs on `process`'s directory.
pub fn spawn_in(process: &Arc<Process>, name: &str, priority: Priority, entry: fn()) -> Arc<Thread> {
    let ctx = mem::context();
    let base = ctx
        .heap()
        .allocate_pages(ctx.mapper(), KERNEL_STACK_PAGES)
        .or_fatal("tasks");
    let thread = Thread::new(process, name, priority, ExecutionMode::Kernel);

    // SAFETY: the pages were just allocated for this stack and are mapped in every directory.
    let stack_pointer =
        unsafe { arch::prepare_stack(base + KERNEL_STACK_PAGES * PAGE_SIZE, entry as *const () as usize) };
    thread
        .stack_pointer_slot()
        .store(stack_pointer, Ordering::Release);

    arch::without_interrupts(|| {
        STACKS.lock().push((thread.id(), base));
        SCHEDULER.insert_thread(thread.clone());
    });
    thread
}

/// First code a spawned thread runs. Entered from the stack switch with interrupts disabled.
pub(crate) extern "C" fn thread_start(entry: usize) -> ! {
    reap();
    arch::enable_interrupts();
    // SAFETY: `spawn_in` stored a `fn()` here.
    let entry: fn() = unsafe { core::mem::transmute::<usize, fn()>(entry) };
    entry();
    exit_current()
}

/// Timer hook: charges the tick and switches if the scheduler says so.
pub fn timer_tick(from_user: bool) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    let cpu = arch::cpu_id();
    if SCHEDULER.update(cpu, 1, from_user) {
        // `update` has already re-queued a preempted thread.
        let switch = SCHEDULER
            .yield_current(cpu, false)
            .unwrap_or_else(|err| scheduler_fatal(err));
        perform(switch);
    }
}

/// Gives the CPU to the next queued thread, if any, staying runnable.
pub fn yield_now() {
    arch::without_interrupts(|| {
        let switch = SCHEDULER
            .yield_current(arch::cpu_id(), true)
            .unwrap_or_else(|err| scheduler_fatal(err));
        perform(switch);
    });
}

/// Ends the calling thread.
pub fn exit_current() -> ! {
    arch::disable_interrupts();
    let switch = SCHEDULER
        .exit_current(arch::cpu_id())
        .unwrap_or_else(|err| scheduler_fatal(err));
    if let Some(previous) = &switch.previous {
        GRAVEYARD.lock().push((previous.clone(), switch.exited.clone()));
    }
    perform(switch);
    fatal(
        Bugcode::SchedulerError,
        "tasks",
        format_args!("an exited thread was resumed"),
    );
}

/// The idle loop. Runs whenever nothing else is queued.
pub fn idle() -> ! {
    loop {
        // Lock-free read; the tick handler may run at any point here.
        if SCHEDULER.queued() > 0 {
            yield_now();
        }
        arch::wait_for_interrupt();
    }
}

/// Carries out a scheduling decision. Must run with interrupts disabled.
fn perform(switch: Switch) {
    let Switch {
        previous,
        next,
        directory,
        ..
    } = switch;

    if let Some(directory) = directory {
        mem::context()
            .mapper()
            .switch_directory(directory)
            .or_fatal("tasks");
    }
    let Some(previous) = previous else {
        return;
    };
    if Arc::ptr_eq(&previous, &next) {
        return;
    }

    let save = previous.stack_pointer_slot().as_ptr();
    let target = next.stack_pointer();
    // An exited thread's frame never resumes, so nothing owned may live across the switch.
    drop(previous);
    drop(next);
    // SAFETY: `target` was saved by an earlier switch or built by `prepare_stack`, and kernel
    // stacks live on the kernel heap, which every directory maps.
    unsafe { arch::switch_stacks(save, target) };
    reap();
}

/// Frees the stacks of exited threads and tears down processes with no threads left.
fn reap() {
    let dead = core::mem::take(&mut *GRAVEYARD.lock());
    if dead.is_empty() {
        return;
    }
    let ctx = mem::context();
    for (thread, process) in dead {
        let stack = {
            let mut stacks = STACKS.lock();
            stacks
                .iter()
                .position(|(id, _)| *id == thread.id())
                .map(|index| stacks.swap_remove(index).1)
        };
        if let Some(base) = stack {
            ctx.heap()
                .free_pages(ctx.mapper(), base, KERNEL_STACK_PAGES)
                .or_fatal("tasks");
        }

        let Some(process) = process else {
            continue;
        };
        if let Some(mut space) = process.take_address_space() {
            if space.is_kernel() {
                continue;
            }
            match space.destroy(ctx) {
                Ok(()) => log::debug!("tasks: process {} torn down", process.pid()),
                Err(err) => log::warn!("tasks: tearing down process {}: {}", process.pid(), err),
            }
        }
    }
}
