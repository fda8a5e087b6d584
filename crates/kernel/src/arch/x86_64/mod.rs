use x86_64::{
    VirtAddr,
    instructions::{self, tables::load_tss},
    registers::segmentation::{CS, Segment},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

mod interrupts;
mod pic;
mod switch;

pub use interrupts::{InterruptState, InterruptVector, end_of_interrupt, last_interrupt};
pub use pic::TIMER_HZ;
pub use switch::{prepare_stack, switch_stacks};

static TSS: spin::Once<TaskStateSegment> = spin::Once::new();
static GDT: spin::Once<(GlobalDescriptorTable, Selectors)> = spin::Once::new();

/// The architecture-specific entry point.
///
/// Captures the boot stack pointer and hands over to [`kernel_main`](crate::kernel_main).
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    let stack_start = unsafe {
        // SAFETY: the bootloader set up the stack before jumping here.
        let rsp: u64;
        core::arch::asm!("mov {}, rsp", out(reg) rsp);
        rsp as usize
    };
    crate::kernel_main(stack_start)
}

fn tss() -> &'static TaskStateSegment {
    TSS.call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[interrupts::DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            static mut STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

            let start = VirtAddr::from_ptr(&raw const STACK);
            start + STACK_SIZE as u64
        };
        tss
    })
}

fn gdt() -> (&'static GlobalDescriptorTable, &'static Selectors) {
    let (gdt, selectors) = GDT.call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(tss()));
        let selectors = Selectors {
            code_selector,
            tss_selector,
        };
        (gdt, selectors)
    });
    (gdt, selectors)
}

struct Selectors {
    code_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Loads the GDT and IDT and starts the timer. Interrupts stay disabled.
pub fn init() {
    let (gdt, selectors) = gdt();
    gdt.load();
    unsafe {
        CS::set_reg(selectors.code_selector);
        load_tss(selectors.tss_selector);
    }
    interrupts::idt().load();
    pic::init();
}

/// Index of the calling CPU. Only the bootstrap processor runs the kernel.
pub fn cpu_id() -> usize {
    0
}

pub fn enable_interrupts() {
    instructions::interrupts::enable();
}

pub fn disable_interrupts() {
    instructions::interrupts::disable();
}

pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    instructions::interrupts::without_interrupts(f)
}

/// Waits for the next interrupt with interrupts enabled.
pub fn wait_for_interrupt() {
    instructions::interrupts::enable_and_hlt();
}

pub fn halt() {
    instructions::hlt();
}

/// The caller's frame pointer.
#[inline(always)]
pub fn frame_pointer() -> usize {
    let rbp: usize;
    // SAFETY: reads a register.
    unsafe { core::arch::asm!("mov {}, rbp", out(reg) rbp) };
    rbp
}

/// Returns true for addresses in the lower canonical half.
pub fn is_user_space(addr: usize) -> bool {
    addr < 0x8000_0000_0000_0000
}
