//! Memory errors and the fatal stop path.
//!
//! Fallible operations return [`MemoryError`]. Call sites that have no way to recover (most
//! notably physical exhaustion) escalate through [`OrFatal::or_fatal`], which ends in [`fatal`].

use core::fmt;

/// Errors reported by the memory core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No free frame, or no run of free frames, is available.
    OutOfMemory,
    /// An address that must be page or chunk aligned is not.
    BadAlignment,
    /// An address or length falls outside the managed range.
    InvalidRange,
    /// A region pool has no free chunk left.
    PoolExhausted,
    /// The combination of arguments is not meaningful.
    InvalidArgument,
    /// The frame or chunk being released is not currently allocated.
    NotAllocated,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::BadAlignment => write!(f, "address is not aligned"),
            Self::InvalidRange => write!(f, "address outside of the managed range"),
            Self::PoolExhausted => write!(f, "pool exhausted"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotAllocated => write!(f, "not allocated"),
        }
    }
}

/// Stop codes reported by the panic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Bugcode {
    OutOfMemory = 0x01,
    MemoryManagement = 0x02,
    PoolMisconfigured = 0x03,
    SchedulerError = 0x04,
    UnexpectedPageFault = 0x05,
    KernelAssertion = 0x06,
    InvalidBugcode = 0xFF,
}

impl Bugcode {
    pub const fn name(self) -> &'static str {
        match self {
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::MemoryManagement => "MEMORY_MANAGEMENT",
            Self::PoolMisconfigured => "POOL_MISCONFIGURED",
            Self::SchedulerError => "SCHEDULER_ERROR",
            Self::UnexpectedPageFault => "UNEXPECTED_PAGE_FAULT",
            Self::KernelAssertion => "KERNEL_ASSERTION",
            Self::InvalidBugcode => "INVALID_BUGCODE",
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Maps a raw stop code back to a [`Bugcode`]. Unknown codes become `INVALID_BUGCODE`.
    pub const fn from_code(code: u32) -> Self {
        match code {
            0x01 => Self::OutOfMemory,
            0x02 => Self::MemoryManagement,
            0x03 => Self::PoolMisconfigured,
            0x04 => Self::SchedulerError,
            0x05 => Self::UnexpectedPageFault,
            0x06 => Self::KernelAssertion,
            _ => Self::InvalidBugcode,
        }
    }
}

impl fmt::Display for Bugcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.code())
    }
}

impl From<MemoryError> for Bugcode {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory | MemoryError::PoolExhausted => Bugcode::OutOfMemory,
            _ => Bugcode::MemoryManagement,
        }
    }
}

/// Stops the system.
///
/// In the kernel this lands in the `#[panic_handler]`, which prints the full diagnostic and parks
/// the CPU. Under the host test harness it is an ordinary panic.
#[cold]
#[track_caller]
pub fn fatal(bugcode: Bugcode, module: &str, args: fmt::Arguments<'_>) -> ! {
    panic!("{bugcode} in {module}: {args}")
}

/// Escalates a memory error to [`fatal`].
pub trait OrFatal<T> {
    fn or_fatal(self, module: &str) -> T;
}

impl<T> OrFatal<T> for Result<T, MemoryError> {
    #[track_caller]
    fn or_fatal(self, module: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(Bugcode::from(err), module, format_args!("{err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bugcode_round_trips_known_codes() {
        for bugcode in [
            Bugcode::OutOfMemory,
            Bugcode::MemoryManagement,
            Bugcode::PoolMisconfigured,
            Bugcode::SchedulerError,
            Bugcode::UnexpectedPageFault,
            Bugcode::KernelAssertion,
        ] {
            assert_eq!(Bugcode::from_code(bugcode.code()), bugcode);
        }
        assert_eq!(Bugcode::from_code(0x42), Bugcode::InvalidBugcode);
    }

    #[test]
    fn or_fatal_passes_values_through() {
        let value: Result<u32, MemoryError> = Ok(7);
        assert_eq!(value.or_fatal("test"), 7);
    }

    #[test]
    #[should_panic(expected = "OUT_OF_MEMORY (0x01) in pmm: out of physical memory")]
    fn or_fatal_escalates_exhaustion() {
        let value: Result<u32, MemoryError> = Err(MemoryError::OutOfMemory);
        value.or_fatal("pmm");
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn or_fatal_escalates_other_errors() {
        let value: Result<(), MemoryError> = Err(MemoryError::InvalidRange);
        value.or_fatal("mapper");
    }
}
