//! The stop screen: what the kernel prints on its way down.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use kmm::VirtualAddress;

use crate::{arch, console::Console, image::LinkerSection, mem, symbols};

const MAX_FRAMES: usize = 32;

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn handle_panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();
    if PANICKING.swap(true, Ordering::AcqRel) {
        arch::park();
    }

    let console = Console::get();
    console.write_unlocked(format_args!("\n*** STOP: {}\n", info.message()));
    if let Some(location) = info.location() {
        console.write_unlocked(format_args!("    at {location}\n"));
    }

    if let Some((vector, state)) = arch::last_interrupt() {
        console.write_unlocked(format_args!(
            "    during {} at {} (sp {}, error code {:?})\n",
            vector,
            state.instruction_pointer(),
            state.stack_pointer(),
            state.error_code()
        ));
    }

    if let Some(ctx) = mem::try_context() {
        let frames = ctx.mapper().frame_stats();
        console.write_unlocked(format_args!(
            "    frames: {} used, {} free of {}\n",
            frames.used, frames.free, frames.total
        ));
    }

    console.write_unlocked(format_args!("traceback:\n"));
    traceback(console, arch::frame_pointer());

    console.write_unlocked(format_args!("CPU parked\n"));
    arch::park();
}

/// A frame pointer we can read two words from without faulting again.
fn readable(frame: usize) -> bool {
    if frame == 0 || frame % size_of::<usize>() != 0 || arch::is_user_space(frame) {
        return false;
    }
    let address = VirtualAddress::new(frame);
    if mem::on_boot_stack(address) {
        return true;
    }
    mem::try_context().is_some_and(|ctx| {
        ctx.mapper().is_mapped(None, address)
            && ctx.mapper().is_mapped(None, address + size_of::<usize>())
    })
}

/// Walks the `rbp` chain.
fn traceback(console: &Console, mut frame: usize) {
    for _ in 0..MAX_FRAMES {
        if !readable(frame) {
            break;
        }
        // SAFETY: `readable` checked both words are mapped.
        let (next, return_address) = unsafe {
            let words = frame as *const usize;
            (words.read(), words.add(1).read())
        };
        if return_address == 0 {
            break;
        }
        describe(console, VirtualAddress::new(return_address));
        // Callers' frames sit higher on the stack.
        if next <= frame {
            break;
        }
        frame = next;
    }
}

fn describe(console: &Console, address: VirtualAddress) {
    if let Some(symbol) = symbols::resolve(address) {
        console.write_unlocked(format_args!(
            "  {} {}+{:#x}\n",
            address, symbol.name, symbol.offset
        ));
        return;
    }
    if let Some(section) = LinkerSection::containing(address) {
        console.write_unlocked(format_args!(
            "  {} kernel{}+{:#x}\n",
            address,
            section.name(),
            address - section.start()
        ));
        return;
    }

    let resolved = mem::try_context()
        .and_then(|ctx| ctx.try_regions())
        .and_then(|regions| {
            regions.resolve_driver(address, |name, offset| {
                console.write_unlocked(format_args!("  {address} {name}+{offset:#x}\n"));
            })
        });
    if resolved.is_none() {
        console.write_unlocked(format_args!("  {address} <unknown>\n"));
    }
}
