#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

/// Stops the calling CPU for good.
pub fn park() -> ! {
    loop {
        disable_interrupts();
        halt();
    }
}
