// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for context, job and engine operations

use core::fmt;

/// RVE result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// RVE error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Unknown or stale context handle
    NotFound,
    /// Context is running and cannot be reconfigured or recommitted
    Busy,
    /// No room for another context, job or command buffer
    OutOfMemory,
    /// Handle space exhausted
    AllocationExhausted,
    /// Backend rejected register programming before hardware start
    HardwareProgramFailure,
    /// Running job exceeded its execution window
    HardwareTimeout,
    /// Synchronous wait interrupted externally
    Interrupted,
    /// Input fence could not be resolved
    DependencyUnavailable,
    /// Job purged by context cancellation
    Cancelled,
    /// Malformed configuration
    InvalidArgument,
    /// Requested mode not compiled in
    Unsupported,
}

/// Errno values handed back to control-surface clients.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EINTR: i32 = 4;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ETIME: i32 = 62;
    pub const ENOTSUP: i32 = 95;
    pub const ECANCELED: i32 = 125;
}

impl Error {
    /// Positive errno for this error
    pub fn errno(self) -> i32 {
        match self {
            Error::NotFound => errno::EINVAL,
            Error::Busy => errno::EBUSY,
            Error::OutOfMemory => errno::ENOMEM,
            Error::AllocationExhausted => errno::ENOSPC,
            Error::HardwareProgramFailure => errno::EIO,
            Error::HardwareTimeout => errno::ETIME,
            Error::Interrupted => errno::EINTR,
            Error::DependencyUnavailable => errno::ENOENT,
            Error::Cancelled => errno::ECANCELED,
            Error::InvalidArgument => errno::EINVAL,
            Error::Unsupported => errno::ENOTSUP,
        }
    }

    /// Negative errno, the form packets carry on the wire
    pub fn to_errno(self) -> isize {
        -(self.errno() as isize)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Context not found"),
            Error::Busy => write!(f, "Context is running"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::AllocationExhausted => write!(f, "Handle space exhausted"),
            Error::HardwareProgramFailure => write!(f, "Hardware programming failed"),
            Error::HardwareTimeout => write!(f, "Hardware timeout"),
            Error::Interrupted => write!(f, "Wait interrupted"),
            Error::DependencyUnavailable => write!(f, "Input dependency unavailable"),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::Unsupported => write!(f, "Not supported"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::NotFound, errno::EINVAL)]
    #[case(Error::Busy, errno::EBUSY)]
    #[case(Error::OutOfMemory, errno::ENOMEM)]
    #[case(Error::HardwareTimeout, errno::ETIME)]
    #[case(Error::Interrupted, errno::EINTR)]
    #[case(Error::DependencyUnavailable, errno::ENOENT)]
    fn test_errno_mapping(#[case] error: Error, #[case] expected: i32) {
        assert_eq!(error.errno(), expected);
        assert_eq!(error.to_errno(), -(expected as isize));
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::Busy.to_string(), "Context is running");
    }
}
