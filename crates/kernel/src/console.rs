//! The kernel logger. Everything goes to the serial port.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use spin::{Mutex, Once};

use crate::serial::SerialWriter;

pub struct Console {
    has_output: AtomicBool,
    serial: Mutex<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> &'static Self {
        let console = Self::get();
        console.install();
        console
    }

    pub fn get() -> &'static Self {
        DEFAULT.call_once(|| Console {
            has_output: AtomicBool::new(false),
            serial: Mutex::new(None),
        })
    }

    fn install(&'static self) {
        // A second install only happens if init runs twice; the first logger stays.
        if log::set_logger(self).is_err() {
            return;
        }

        #[cfg(feature = "verbose-memory-log")]
        log::set_max_level(LevelFilter::Trace);

        #[cfg(not(feature = "verbose-memory-log"))]
        log::set_max_level(LevelFilter::Debug);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        *self.serial.lock() = Some(serial);
        self.has_output.store(true, Ordering::SeqCst);
    }

    /// Writes straight to the port, stealing it if it is locked.
    ///
    /// The panic path uses this: the lock may be held by the code that panicked.
    pub fn write_unlocked(&self, args: core::fmt::Arguments<'_>) {
        if let Some(mut guard) = self.serial.try_lock() {
            if let Some(serial) = guard.as_mut() {
                let _ = serial.write_fmt(args);
            }
            return;
        }
        // SAFETY: only reached on the panic path with interrupts off and the other CPUs parked.
        unsafe { self.serial.force_unlock() };
        if let Some(serial) = self.serial.lock().as_mut() {
            let _ = serial.write_fmt(args);
        }
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            let _ = writeln!(
                serial,
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
