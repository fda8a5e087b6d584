//! Legacy 8259 PIC and 8254 PIT: the periodic tick the scheduler runs on.

use x86_64::instructions::port::Port;

use super::interrupts::InterruptVector;

/// Timer interrupts per second.
pub const TIMER_HZ: u32 = 100;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const END_OF_INTERRUPT: u8 = 0x20;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_FREQUENCY: u32 = 1_193_182;

/// Remaps both PICs above the exception vectors, unmasks only IRQ 0 and programs the PIT.
pub fn init() {
    let mut pic1_command = Port::<u8>::new(PIC1_COMMAND);
    let mut pic1_data = Port::<u8>::new(PIC1_DATA);
    let mut pic2_command = Port::<u8>::new(PIC2_COMMAND);
    let mut pic2_data = Port::<u8>::new(PIC2_DATA);
    let mut wait = Port::<u8>::new(0x80);

    let offset = InterruptVector::TIMER.value();
    // SAFETY: the standard initialization sequence for the PC's PIC pair.
    unsafe {
        let mut write = |port: &mut Port<u8>, value: u8| {
            port.write(value);
            wait.write(0);
        };
        write(&mut pic1_command, ICW1_INIT);
        write(&mut pic2_command, ICW1_INIT);
        write(&mut pic1_data, offset);
        write(&mut pic2_data, offset + 8);
        write(&mut pic1_data, 4);
        write(&mut pic2_data, 2);
        write(&mut pic1_data, ICW4_8086);
        write(&mut pic2_data, ICW4_8086);

        pic1_data.write(!0x01);
        pic2_data.write(0xFF);
    }

    let divisor = PIT_FREQUENCY / TIMER_HZ;
    let mut command = Port::<u8>::new(PIT_COMMAND);
    let mut channel0 = Port::<u8>::new(PIT_CHANNEL0);
    // SAFETY: channel 0, lobyte/hibyte, rate generator.
    unsafe {
        command.write(0x36);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::debug!("pic: remapped to vector {offset}, timer at {TIMER_HZ} Hz");
}

/// Acknowledges an IRQ from the master PIC.
pub fn end_of_interrupt() {
    // SAFETY: writing EOI to the master PIC has no other effect.
    unsafe { Port::<u8>::new(PIC1_COMMAND).write(END_OF_INTERRUPT) };
}
