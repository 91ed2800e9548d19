#[allow(unused_imports)] // used in doc
use super::ArchGuest;

/// The vector of the page-fault exception, used when a fault is reflected back into the guest.
pub const PAGE_FAULT_VECTOR: usize = 14;

/// The result of [`ArchGuest::run`]: why control came back to the host.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// The guest executed the hypercall instruction.
    Hypercall {
        /// The hypercall number.
        nr: usize,
        /// The arguments for the hypercall.
        args: [usize; 4],
    },
    /// A physical interrupt arrived while the guest was running.
    ///
    /// The host handles it as soon as local interrupts are re-enabled, so nothing is left for
    /// the run loop to do.
    ExternalInterrupt {
        /// The interrupt vector.
        vector: usize,
    },
    /// The guest touched memory its shadow mappings do not cover.
    PageFault {
        /// The faulting guest virtual address.
        addr: usize,
        /// The architecture-specific error code.
        error_code: usize,
    },
    /// Any other processor exception raised by the guest.
    Exception {
        /// The exception vector.
        vector: usize,
        /// The error code, for the exceptions that push one.
        error_code: Option<usize>,
    },
    /// The switch into the guest failed before any guest instruction executed.
    FailEntry {
        /// Architecture related entry failure code.
        code: usize,
    },
}
