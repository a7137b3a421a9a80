//! Crate-wide error type and the canonical numeric status codes callers may want.

use derive_more::derive::{Display, Error, From};

/// A specialized `Result` where the error is this crate's [`Error`] type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for every store in this crate.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    #[display("underlying block device read failed")]
    ReadError,

    #[display("underlying block device write failed")]
    WriteError,

    #[display("key not found")]
    NotFound,

    #[display("stored record failed CRC/CMAC verification")]
    DataCorrupt,

    #[display("invalid argument")]
    InvalidArgument,

    #[display("caller-supplied buffer is too small")]
    BuffTooSmall,

    #[display("no free space remains after garbage collection")]
    MediaFull,

    #[display("operating system / lock error")]
    OsError,

    #[display("record is write-protected (write-once or immutable flag)")]
    WriteProtected,

    #[display("store has not been initialized")]
    NotReady,

    #[display("record authentication failed")]
    AuthenticationFailed,

    #[display("rollback-protection token mismatch or missing")]
    RbpAuthenticationFailed,

    #[display("device key already injected")]
    KeyAlreadyExists,

    #[display("no root-of-trust key has been injected and no TRNG is available")]
    NoKeyInjected,
}

impl Error {
    /// Maps this error to the canonical numeric status code of the external interface.
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::ReadError => -1,
            Self::WriteError => -2,
            Self::NotFound => -3,
            Self::DataCorrupt => -4,
            Self::InvalidArgument => -5,
            Self::BuffTooSmall => -6,
            Self::MediaFull => -7,
            Self::OsError => -8,
            Self::WriteProtected => -9,
            Self::NotReady => -10,
            Self::AuthenticationFailed => -11,
            Self::RbpAuthenticationFailed => -12,
            Self::KeyAlreadyExists | Self::NoKeyInjected => -5,
        }
    }
}

/// Numeric status code mirroring the canonical C-like contract (§6.2).
///
/// Provided for callers that want the status-code surface rather than matching on [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    ReadError = -1,
    WriteError = -2,
    NotFound = -3,
    DataCorrupt = -4,
    InvalidArgument = -5,
    BuffTooSmall = -6,
    MediaFull = -7,
    OsError = -8,
    WriteProtected = -9,
    NotReady = -10,
    AuthenticationFailed = -11,
    RbpAuthenticationFailed = -12,
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::ReadError => Self::ReadError,
            Error::WriteError => Self::WriteError,
            Error::NotFound => Self::NotFound,
            Error::DataCorrupt => Self::DataCorrupt,
            Error::InvalidArgument | Error::KeyAlreadyExists | Error::NoKeyInjected => {
                Self::InvalidArgument
            }
            Error::BuffTooSmall => Self::BuffTooSmall,
            Error::MediaFull => Self::MediaFull,
            Error::OsError => Self::OsError,
            Error::WriteProtected => Self::WriteProtected,
            Error::NotReady => Self::NotReady,
            Error::AuthenticationFailed => Self::AuthenticationFailed,
            Error::RbpAuthenticationFailed => Self::RbpAuthenticationFailed,
        }
    }
}
