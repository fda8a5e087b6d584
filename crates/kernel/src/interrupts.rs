use kmm::{Bugcode, FaultResolution, VirtualAddress, fatal};

use crate::{arch, mem, tasks};

#[derive(Debug)]
pub struct InterruptContext {
    vector: arch::InterruptVector,
    state: arch::InterruptState,
    kind: InterruptKind,
}

impl InterruptContext {
    pub fn new(
        vector: arch::InterruptVector,
        state: arch::InterruptState,
        kind: InterruptKind,
    ) -> Self {
        Self {
            vector,
            state,
            kind,
        }
    }

    pub fn vector(&self) -> arch::InterruptVector {
        self.vector
    }

    /// Returns the instruction pointer at the time of the interrupt.
    pub fn instruction_pointer(&self) -> VirtualAddress {
        self.state.instruction_pointer()
    }

    pub fn error_code(&self) -> Option<u64> {
        self.state.error_code()
    }

    pub fn kind(&self) -> &InterruptKind {
        &self.kind
    }
}

#[derive(Debug)]
pub enum InterruptKind {
    Standard,
    Timer,
    Spurious,
    PageFault {
        faulting_address: Option<VirtualAddress>,
    },
}

pub fn interrupt_was_received(context: InterruptContext) {
    match context.kind() {
        InterruptKind::Timer => {
            arch::end_of_interrupt();
            tasks::timer_tick(context.state.from_user());
        }
        InterruptKind::Spurious => log::trace!("spurious interrupt {}", context.vector()),
        InterruptKind::PageFault { faulting_address } => page_fault(&context, *faulting_address),
        InterruptKind::Standard => fatal(
            Bugcode::KernelAssertion,
            "interrupts",
            format_args!(
                "unhandled {} at {} (error code {:?})",
                context.vector(),
                context.instruction_pointer(),
                context.error_code()
            ),
        ),
    }
}

/// Lets the current process's address space back the page, or stops the system.
fn page_fault(context: &InterruptContext, address: Option<VirtualAddress>) {
    let Some(address) = address else {
        fatal(
            Bugcode::UnexpectedPageFault,
            "interrupts",
            format_args!("page fault at {} with no address", context.instruction_pointer()),
        );
    };

    let resolution = tasks::current_process().and_then(|process| {
        process.with_address_space(|space| space.handle_fault(mem::context().mapper(), address))
    });
    match resolution {
        Some(Ok(FaultResolution::Resolved)) => {}
        Some(Err(err)) => fatal(
            Bugcode::from(err),
            "interrupts",
            format_args!("backing {address} failed: {err}"),
        ),
        Some(Ok(FaultResolution::NotHandled)) | None => fatal(
            Bugcode::UnexpectedPageFault,
            "interrupts",
            format_args!(
                "access to {address} from {} (error code {:#x})",
                context.instruction_pointer(),
                context.error_code().unwrap_or(0)
            ),
        ),
    }
}

#[macro_export]
macro_rules! interrupt_vectors {
    (
        $storage: ty,
        $(
            $name:ident = $value:expr,
        )*
    ) => {
        /// Represents an interrupt vector.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct InterruptVector($storage);

        impl InterruptVector {
            $(
                pub const $name: Self = Self($value);
            )*

            pub const fn new(value: $storage) -> Self {
                Self(value)
            }

            pub const fn value(&self) -> $storage {
                self.0
            }

            /// Returns the name of the interrupt vector, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $(
                        $value => Some(stringify!($name)),
                    )*
                    _ => None,
                }
            }
        }

        impl core::fmt::Debug for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self.name() {
                    Some(name) => write!(f, "InterruptVector::{}({})", name, self.0),
                    None => write!(f, "InterruptVector({})", self.0),
                }
            }
        }

        impl core::fmt::Display for InterruptVector {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self.name() {
                    Some(name) => write!(f, "{}", name),
                    None => write!(f, "{}", self.0),
                }
            }
        }
    }
}
