//! The IDT entry points. Each one forwards its vector to `common_interrupt`.

use super::common_interrupt;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

macro_rules! handler {
    ($name:ident, $vector:literal) => {
        #[unsafe(link_section = ".interrupt_handlers")]
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            common_interrupt($vector, stack_frame, None);
        }
    };
    ($name:ident, $vector:literal, error_code) => {
        #[unsafe(link_section = ".interrupt_handlers")]
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, error_code: u64) {
            common_interrupt($vector, stack_frame, Some(error_code));
        }
    };
}

handler!(divide_error_handler, 0);
handler!(debug_handler, 1);
handler!(nmi_handler, 2);
handler!(breakpoint_handler, 3);
handler!(overflow_handler, 4);
handler!(bound_range_exceeded_handler, 5);
handler!(invalid_opcode_handler, 6);
handler!(device_not_available_handler, 7);
handler!(invalid_tss_handler, 10, error_code);
handler!(segment_not_present_handler, 11, error_code);
handler!(stack_segment_fault_handler, 12, error_code);
handler!(general_protection_fault_handler, 13, error_code);
handler!(x87_floating_point_handler, 16);
handler!(alignment_check_handler, 17, error_code);
handler!(simd_floating_point_handler, 19);
handler!(virtualization_handler, 20);
handler!(control_protection_handler, 21, error_code);

// The PICs sit at 32..48 with only IRQ 0 unmasked. IRQ 7 and 15 are where they report spurious
// interrupts.
handler!(timer_handler, 32);
handler!(spurious_master_handler, 39);
handler!(spurious_slave_handler, 47);
handler!(spurious_handler, 255);

#[unsafe(link_section = ".interrupt_handlers")]
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    common_interrupt(14, stack_frame, Some(error_code.bits()));
}

#[unsafe(link_section = ".interrupt_handlers")]
extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    common_interrupt(8, stack_frame, Some(error_code));
    kmm::fatal(
        kmm::Bugcode::KernelAssertion,
        "interrupts",
        format_args!("returned from the double fault handler"),
    );
}

#[unsafe(link_section = ".interrupt_handlers")]
extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    common_interrupt(18, stack_frame, None);
    kmm::fatal(
        kmm::Bugcode::KernelAssertion,
        "interrupts",
        format_args!("returned from the machine check handler"),
    );
}

pub fn register_handlers(idt: &mut InterruptDescriptorTable, double_fault_ist_index: u16) {
    idt.divide_error.set_handler_fn(divide_error_handler);
    idt.debug.set_handler_fn(debug_handler);
    idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
    idt.breakpoint.set_handler_fn(breakpoint_handler);
    idt.overflow.set_handler_fn(overflow_handler);
    idt.bound_range_exceeded
        .set_handler_fn(bound_range_exceeded_handler);
    idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
    idt.device_not_available
        .set_handler_fn(device_not_available_handler);
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(double_fault_ist_index);
    }
    idt.invalid_tss.set_handler_fn(invalid_tss_handler);
    idt.segment_not_present
        .set_handler_fn(segment_not_present_handler);
    idt.stack_segment_fault
        .set_handler_fn(stack_segment_fault_handler);
    idt.general_protection_fault
        .set_handler_fn(general_protection_fault_handler);
    idt.page_fault.set_handler_fn(page_fault_handler);
    idt.x87_floating_point
        .set_handler_fn(x87_floating_point_handler);
    idt.alignment_check.set_handler_fn(alignment_check_handler);
    idt.machine_check.set_handler_fn(machine_check_handler);
    idt.simd_floating_point
        .set_handler_fn(simd_floating_point_handler);
    idt.virtualization.set_handler_fn(virtualization_handler);
    idt.cp_protection_exception
        .set_handler_fn(control_protection_handler);
    idt[32].set_handler_fn(timer_handler);
    idt[39].set_handler_fn(spurious_master_handler);
    idt[47].set_handler_fn(spurious_slave_handler);
    idt[255].set_handler_fn(spurious_handler);
}
