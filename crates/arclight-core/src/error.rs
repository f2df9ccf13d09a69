//! # ARCLIGHT Error Handling
//!
//! Unified error type for the winsys stack.
//!
//! Error handling follows these principles:
//! - Errors are typed and categorized by subsystem
//! - No panics in production code paths
//! - Timeouts are not errors; they are boolean "not ready yet" results
//! - `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// ARCLIGHT Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// ARCLIGHT unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Resource is busy
    Busy,
    /// Operation not supported on this hardware or engine
    NotSupported,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of host memory
    OutOfMemory,
    /// Out of VRAM
    OutOfVram,
    /// Out of GTT space
    OutOfGtt,
    /// Kernel buffer allocation failed
    AllocationFailed,
    /// Virtual address range reservation failed
    VaRangeFailed,
    /// CPU mapping failed or buffer is not CPU accessible
    MappingFailed,
    /// Handle does not name a live kernel resource
    InvalidHandle,
    /// Sub-allocated buffers cannot be exported or imported
    NotShareable,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// A command stream wrote past its reserved capacity
    StreamOverflow,
    /// Kernel buffer list creation failed
    BufferListFailed,
    /// Kernel command submission was rejected
    SubmissionFailed,
    /// Submission was rejected because the kernel is out of memory
    SubmissionNoMemory,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Kernel driver version is not supported
    VersionMismatch,
    /// The device has been lost; the context must be recreated
    DeviceLost,
}

impl Error {
    /// Check whether the error indicates an unusable device/context
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::SubmissionFailed | Self::SubmissionNoMemory
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),

            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OutOfVram => write!(f, "out of VRAM"),
            Self::OutOfGtt => write!(f, "out of GTT"),
            Self::AllocationFailed => write!(f, "kernel buffer allocation failed"),
            Self::VaRangeFailed => write!(f, "virtual address reservation failed"),
            Self::MappingFailed => write!(f, "CPU mapping failed"),
            Self::InvalidHandle => write!(f, "invalid kernel handle"),
            Self::NotShareable => write!(f, "sub-allocated buffer cannot be shared"),

            Self::StreamOverflow => write!(f, "command stream overflowed"),
            Self::BufferListFailed => write!(f, "buffer list creation failed"),
            Self::SubmissionFailed => write!(f, "command submission rejected"),
            Self::SubmissionNoMemory => {
                write!(f, "not enough memory for command submission")
            }

            Self::VersionMismatch => write!(f, "kernel driver version not supported"),
            Self::DeviceLost => write!(f, "device lost"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DeviceLost.is_fatal());
        assert!(Error::SubmissionFailed.is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::OutOfVram.is_fatal());
    }
}
