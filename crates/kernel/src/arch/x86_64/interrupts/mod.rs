use core::sync::atomic::{AtomicUsize, Ordering};

use kmm::VirtualAddress;
use x86_64::PrivilegeLevel;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::interrupts::{InterruptContext, InterruptKind, interrupt_was_received};

mod handlers;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
static IDT: spin::Once<InterruptDescriptorTable> = spin::Once::new();

/// Interrupt nesting depth, and the last frame that was not a timer tick.
static DEPTH: AtomicUsize = AtomicUsize::new(0);
static LAST: spin::Mutex<Option<(InterruptVector, InterruptState)>> = spin::Mutex::new(None);

pub fn idt() -> &'static InterruptDescriptorTable {
    IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        handlers::register_handlers(&mut idt, DOUBLE_FAULT_IST_INDEX);
        idt
    })
}

/// The frame of the interrupt being handled, if the caller is running inside one.
pub fn last_interrupt() -> Option<(InterruptVector, InterruptState)> {
    if DEPTH.load(Ordering::Acquire) == 0 {
        return None;
    }
    *LAST.try_lock()?
}

/// Common interrupt handler called by all interrupt stubs.
fn common_interrupt(vector: u8, stack_frame: InterruptStackFrame, error_code: Option<u64>) {
    let vector = InterruptVector::new(vector);
    let state = InterruptState::new(&stack_frame, error_code);
    let kind = match vector {
        InterruptVector::PAGE_FAULT => {
            let faulting_address = x86_64::registers::control::Cr2::read()
                .ok()
                .map(|v| VirtualAddress::new(v.as_u64() as usize));
            InterruptKind::PageFault { faulting_address }
        }
        InterruptVector::TIMER => InterruptKind::Timer,
        InterruptVector::SPURIOUS | InterruptVector::SPURIOUS_MASTER | InterruptVector::SPURIOUS_SLAVE => {
            InterruptKind::Spurious
        }
        _ => InterruptKind::Standard,
    };
    // A tick may switch threads and resume elsewhere, so it is never counted as nested.
    if vector == InterruptVector::TIMER {
        interrupt_was_received(InterruptContext::new(vector, state, kind));
        return;
    }

    if let Some(mut last) = LAST.try_lock() {
        *last = Some((vector, state));
    }
    DEPTH.fetch_add(1, Ordering::AcqRel);
    interrupt_was_received(InterruptContext::new(vector, state, kind));
    DEPTH.fetch_sub(1, Ordering::AcqRel);
}

/// Tells the PIC the timer interrupt has been handled. Done before a possible task switch, which
/// may not come back to this frame for a while.
pub fn end_of_interrupt() {
    super::pic::end_of_interrupt();
}

crate::interrupt_vectors! {
    u8,
    DIVIDE_ERROR = 0,
    DEBUG = 1,
    NON_MASKABLE_INTERRUPT = 2,
    BREAKPOINT = 3,
    OVERFLOW = 4,
    BOUND_RANGE_EXCEEDED = 5,
    INVALID_OPCODE = 6,
    DEVICE_NOT_AVAILABLE = 7,
    DOUBLE_FAULT = 8,
    COPROCESSOR_SEGMENT_OVERRUN = 9,
    INVALID_TSS = 10,
    SEGMENT_NOT_PRESENT = 11,
    STACK_SEGMENT_FAULT = 12,
    GENERAL_PROTECTION_FAULT = 13,
    PAGE_FAULT = 14,
    X87_FLOATING_POINT_EXCEPTION = 16,
    ALIGNMENT_CHECK = 17,
    MACHINE_CHECK = 18,
    SIMD_FLOATING_POINT_EXCEPTION = 19,
    VIRTUALIZATION_EXCEPTION = 20,
    CP_PROTECTION_EXCEPTION = 21,
    TIMER = 32,
    SPURIOUS_MASTER = 39,
    SPURIOUS_SLAVE = 47,
    SPURIOUS = 255,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptState {
    instruction_pointer: VirtualAddress,
    stack_pointer: VirtualAddress,
    from_user: bool,
    error_code: Option<u64>,
}

impl InterruptState {
    pub fn new(stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> Self {
        Self {
            instruction_pointer: VirtualAddress::new(
                stack_frame.instruction_pointer.as_u64() as usize,
            ),
            stack_pointer: VirtualAddress::new(stack_frame.stack_pointer.as_u64() as usize),
            from_user: stack_frame.code_segment.rpl() == PrivilegeLevel::Ring3,
            error_code,
        }
    }

    pub fn instruction_pointer(&self) -> VirtualAddress {
        self.instruction_pointer
    }

    pub fn stack_pointer(&self) -> VirtualAddress {
        self.stack_pointer
    }

    /// Whether the interrupted code ran in ring 3.
    pub fn from_user(&self) -> bool {
        self.from_user
    }

    pub fn error_code(&self) -> Option<u64> {
        self.error_code
    }
}
