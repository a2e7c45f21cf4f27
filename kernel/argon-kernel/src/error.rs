//! Error kinds the core reports to its callers.
//!
//! Invariant violations and kernel-mode faults are not represented here:
//! both are immediate panics. User-mode faults are delivered to the owning
//! process by the embedding kernel and never surface as values either.

use core::fmt;

/// A recoverable failure reported across the core's public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// An allocation (task, stack, save area, callback node) failed. The
    /// caller decides whether to retry.
    OutOfMemory,
    /// An IPI or pinned enqueue named a CPU that is not online. The caller
    /// falls back to local execution.
    OfflineTarget,
    /// A bounded remote wait expired. The operation is logged as not fully
    /// validated; the kernel continues.
    Timeout,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OfflineTarget => write!(f, "target CPU is not online"),
            Self::Timeout => write!(f, "bounded wait expired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(CoreError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(CoreError::Timeout.to_string(), "bounded wait expired");
    }
}
