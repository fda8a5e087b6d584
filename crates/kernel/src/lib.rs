#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]

extern crate alloc;

#[cfg(feature = "acpi")]
mod acpi;
mod arch;
mod console;
mod image;
mod interrupts;
mod mem;
mod panic;
mod serial;
mod symbols;
mod tasks;

use kmm::{AddressSpace, AllocatorInfo, OrFatal, PAGE_SIZE};
use limine::BaseRevision;
use sched::{Priority, Process};

pub use panic::handle_panic;

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

pub fn kernel_main(stack_start: usize) -> ! {
    mem::set_stack_bounds(stack_start);

    let console = console::Console::init();
    serial::init(console);
    if !BASE_REVISION.is_supported() {
        log::error!("bootloader does not support base revision 4");
        arch::park();
    }
    log::info!("Kestrel {} starting", env!("CARGO_PKG_VERSION"));

    arch::init();
    let ctx = mem::init();
    let info = ctx.allocator_info();
    log::info!(
        "heap: {} {} (realloc: {}, aligned: {}, statistics: {})",
        info.name,
        info.version,
        info.has(AllocatorInfo::REALLOC),
        info.has(AllocatorInfo::ALIGNED),
        info.has(AllocatorInfo::STATISTICS)
    );
    mem::self_test(ctx);
    symbols::init();

    #[cfg(feature = "acpi")]
    acpi::init(ctx);

    tasks::init();
    start_boot_threads();

    log::info!("boot complete, {} Hz tick", arch::TIMER_HZ);
    arch::enable_interrupts();
    tasks::idle()
}

fn start_boot_threads() {
    tasks::spawn("worker-high", Priority::High, worker);
    tasks::spawn("worker-low", Priority::Low, worker);

    let ctx = mem::context();
    let space = AddressSpace::create(ctx, None).or_fatal("kernel");
    let init = Process::new("init", space);
    tasks::spawn_in(&init, "init", Priority::Med, init_main);
}

fn worker() {
    let Some(thread) = tasks::current_thread() else {
        return;
    };
    for round in 0..3 {
        log::info!(
            "{} (thread {}): round {round} at tick {}",
            thread.name(),
            thread.id(),
            tasks::ticks()
        );
        tasks::yield_now();
    }
}

/// Grows its process's heap and touches it, so the pages come in through the fault handler.
fn init_main() {
    let ctx = mem::context();
    let Some(process) = tasks::current_process() else {
        return;
    };
    let pages = 2;
    let Some(grown) = process.with_address_space(|space| {
        space.sbrk(ctx.mapper(), (pages * PAGE_SIZE) as isize)
    }) else {
        return;
    };
    let base = grown.or_fatal("init");

    for page in 0..pages {
        let word = (base + page * PAGE_SIZE).as_mut_ptr::<u64>();
        // SAFETY: the break was just moved past this page; the first access faults it in.
        unsafe {
            word.write_volatile(0xC0FF_EE00 + page as u64);
        }
    }
    log::info!(
        "init (pid {}): {} heap pages at {} faulted in, {} frames free",
        process.pid(),
        pages,
        base,
        ctx.mapper().frame_stats().free
    );
}
