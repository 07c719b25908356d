//! System-wide error types for the portability layer.

use core::fmt;

/// Failures surfaced by creation and wait operations.
///
/// Signal-style operations (`set`, `release`, `reset`, `delete`) never
/// report errors; only object creation and bounded waits do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OsError {
    /// Kernel ran out of control blocks, stacks or heap
    OutOfResources,
    /// A parameter is outside what the kernel accepts
    InvalidParameter,
    /// Only one of control block / stack storage was supplied
    PartialStaticAllocation,
    /// Every semaphore identifier slot is in use
    NoFreeSlot,
    /// Wait did not observe the expected state within its bound
    Timeout,
    /// Kernel rejected the call
    KernelFailure,
}

impl OsError {
    /// Returns `true` for errors that mean an object was not created.
    pub fn is_creation_failure(&self) -> bool {
        !matches!(self, OsError::Timeout)
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::OutOfResources => write!(f, "kernel resources exhausted"),
            OsError::InvalidParameter => write!(f, "invalid parameter"),
            OsError::PartialStaticAllocation => {
                write!(f, "static allocation needs both control block and stack")
            }
            OsError::NoFreeSlot => write!(f, "no free semaphore identifier"),
            OsError::Timeout => write!(f, "wait timed out"),
            OsError::KernelFailure => write!(f, "kernel call failed"),
        }
    }
}

/// Result alias used throughout the portability layer.
pub type Result<T> = core::result::Result<T, OsError>;
