//! Kernel error handling
//!
//! One public error enum for everything surfaced at the interface boundary.
//! Internal invariant violations do not travel through this type; they panic
//! with diagnostic context instead.

use core::fmt;

/// Errors surfaced by public scheduler and IRQ operations.
///
/// Syscall surfaces translate these to stable numeric codes outside this
/// crate; inside the kernel they are matched on directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad argument: policy, priority, affinity mask, IRQ number, or an
    /// infeasible deadline reservation. No state was changed.
    InvalidParameter { what: &'static str },

    /// Caller lacks the privilege for the operation (e.g. raising RT
    /// priority without the scheduling capability).
    PermissionDenied { what: &'static str },

    /// Allocation failed for a task, stack, or descriptor.
    OutOfMemory { requested: usize },

    /// The object is in use and the operation cannot proceed now
    /// (e.g. changing IRQ flow type while handlers are installed).
    Busy { what: &'static str },

    /// The referenced task, IRQ action, or descriptor does not exist.
    NotFound { what: &'static str },

    /// A wait expired before the event occurred.
    Timeout,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter { what } => write!(f, "invalid parameter: {}", what),
            Self::PermissionDenied { what } => write!(f, "permission denied: {}", what),
            Self::OutOfMemory { requested } => write!(f, "out of memory: {} bytes", requested),
            Self::Busy { what } => write!(f, "busy: {}", what),
            Self::NotFound { what } => write!(f, "not found: {}", what),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

impl KernelError {
    /// Transient errors may be retried by internal callers; the rest are
    /// reported to the caller unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Timeout)
    }
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Critical invariant assertion. Spelled out rather than `assert!` so the
/// panic message identifies the subsystem.
#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr, $reason:expr) => {
        if !$cond {
            panic!("[KERNEL CRITICAL] invariant violated: {}", $reason);
        }
    };
}
