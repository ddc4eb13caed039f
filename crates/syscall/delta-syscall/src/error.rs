//! Kernel error taxonomy and ABI error codes.
//!
//! Kernel APIs return `Result<T, Error>`; the syscall boundary translates a
//! failure to `-(error.code())`. The codes are part of the ABI and must not
//! change.

/// Errors surfaced by kernel APIs and the syscall ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Null pointer, out-of-range size, bad handle value.
    InvalidArgument,
    /// A required capability right is missing.
    PermissionDenied,
    /// No such path, child, or object.
    NotFound,
    /// Namespace path already registered.
    AlreadyExists,
    /// Out of memory, frames, or handle slots.
    ResourceExhausted,
    /// The channel peer endpoint is gone.
    PeerClosed,
    /// The channel's bounded queue is at capacity.
    QueueFull,
    /// Non-blocking operation found no data.
    WouldBlock,
    /// Operation against an object in the wrong state.
    BadState,
    /// The object does not implement the requested operation.
    Unsupported,
}

impl Error {
    /// Returns the positive ABI error code for this error.
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidArgument => 1,
            Self::PermissionDenied => 2,
            Self::NotFound => 3,
            Self::AlreadyExists => 4,
            Self::ResourceExhausted => 5,
            Self::PeerClosed => 6,
            Self::QueueFull => 7,
            Self::WouldBlock => 8,
            Self::BadState => 9,
            Self::Unsupported => 10,
        }
    }

    /// Returns the signed return value for the syscall ABI.
    pub const fn to_ret(self) -> isize {
        -(self.code() as isize)
    }

    /// Reconstructs an `Error` from a positive ABI code.
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidArgument,
            2 => Self::PermissionDenied,
            3 => Self::NotFound,
            4 => Self::AlreadyExists,
            5 => Self::ResourceExhausted,
            6 => Self::PeerClosed,
            7 => Self::QueueFull,
            8 => Self::WouldBlock,
            9 => Self::BadState,
            10 => Self::Unsupported,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            Error::InvalidArgument,
            Error::PermissionDenied,
            Error::NotFound,
            Error::AlreadyExists,
            Error::ResourceExhausted,
            Error::PeerClosed,
            Error::QueueFull,
            Error::WouldBlock,
            Error::BadState,
            Error::Unsupported,
        ] {
            assert_eq!(Error::from_code(err.code()), Some(err));
            assert!(err.to_ret() < 0);
        }
    }

    #[test]
    fn unknown_code_rejected() {
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(99), None);
    }
}
