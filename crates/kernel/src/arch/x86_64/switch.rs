//! Kernel stack switching.
//!
//! A switched-out thread's stack holds its callee-saved registers followed by the address to
//! resume at; the thread's saved stack pointer points at that frame.

use kmm::VirtualAddress;

core::arch::global_asm!(
    ".global kestrel_switch_stacks",
    "kestrel_switch_stacks:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global kestrel_thread_trampoline",
    "kestrel_thread_trampoline:",
    "mov rdi, rbx",
    "call {start}",
    "ud2",
    start = sym crate::tasks::thread_start,
);

unsafe extern "C" {
    fn kestrel_switch_stacks(save: *mut usize, next: usize);
    fn kestrel_thread_trampoline();
}

/// Saves the current stack pointer to `save` and resumes the thread whose stack pointer is
/// `next`. Returns when something switches back.
///
/// # Safety
///
/// `next` must come from a previous switch or from [`prepare_stack`], and its stack must be
/// mapped in the directory that is active after the call.
pub unsafe fn switch_stacks(save: *mut usize, next: usize) {
    // SAFETY: forwarded to the caller.
    unsafe { kestrel_switch_stacks(save, next) }
}

/// Builds the initial frame for a new kernel thread on the stack ending at `top` and returns
/// the stack pointer to switch to. The thread starts in `thread_start(entry)`.
///
/// # Safety
///
/// `[top - 64, top)` must be mapped, writable and unused.
pub unsafe fn prepare_stack(top: VirtualAddress, entry: usize) -> usize {
    let top = top.align_down(16).as_mut_ptr::<usize>();
    let frame = [
        0, // r15
        0, // r14
        0, // r13
        0, // r12
        entry, // rbx
        0, // rbp, ends the traceback
        kestrel_thread_trampoline as *const () as usize,
    ];
    // SAFETY: the caller guarantees the top of the stack is ours.
    unsafe {
        let base = top.sub(frame.len());
        for (index, value) in frame.into_iter().enumerate() {
            base.add(index).write(value);
        }
        base as usize
    }
}
