//! Error kinds surfaced by the emulation layer.
//!
//! Every native failure is translated exactly once, where it is detected,
//! into one [`Error`]. The translation tables differ per call site because
//! Win32 reuses the same code for different POSIX meanings (a missing path
//! component is `ENOTDIR` for `opendir` but `ENOENT` for a search).

use thiserror::Error;

use crate::platform::NativeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Bad descriptor")]
    BadDescriptor,

    #[error("Too many open files")]
    TooManyOpenFiles,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Bad address")]
    BadAddress,

    #[error("Name too long: {0}")]
    NameTooLong(String),

    #[error("Operation not supported")]
    NotSupported,

    #[error("Operation would block")]
    WouldBlock,

    #[error("Interrupted system call")]
    Interrupted,

    #[error("Address already in use")]
    AddressInUse,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Socket is not connected")]
    NotConnected,

    /// Failed name lookup; `code` is the Winsock `h_errno` value.
    #[error("{host}: lookup error {code}")]
    HostLookup { host: String, code: i32 },

    #[error("{file} : {reason}")]
    Module { file: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// POSIX errno value for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotADirectory { .. } => libc::ENOTDIR,
            Error::PermissionDenied { .. } => libc::EACCES,
            Error::NotFound { .. } => libc::ENOENT,
            Error::OutOfMemory => libc::ENOMEM,
            Error::BadDescriptor => libc::EBADF,
            Error::TooManyOpenFiles => libc::EMFILE,
            Error::InvalidArgument(_) | Error::Module { .. } | Error::Config(_) => libc::EINVAL,
            Error::BadAddress => libc::EFAULT,
            Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Error::NotSupported => libc::ENOTSUP,
            Error::WouldBlock => libc::EAGAIN,
            Error::Interrupted => libc::EINTR,
            Error::AddressInUse => libc::EADDRINUSE,
            Error::ConnectionRefused => libc::ECONNREFUSED,
            Error::NotConnected => libc::ENOTCONN,
            Error::HostLookup { .. } | Error::Io(_) => libc::EIO,
        }
    }

    /// Failure of the attribute query that decides whether `opendir` has a
    /// directory in front of it.
    pub fn from_attributes(err: NativeError, path: &str) -> Self {
        let path = path.to_string();
        match err {
            NativeError::AccessDenied | NativeError::SharingViolation => {
                Error::PermissionDenied { path }
            }
            NativeError::FileNotFound => Error::NotFound { path },
            NativeError::PathNotFound | NativeError::InvalidDrive => Error::NotADirectory { path },
            other => Error::Io(format!("{path}: {other}")),
        }
    }

    /// Failure of the bulk directory search.
    pub fn from_search(err: NativeError, path: &str) -> Self {
        let path = path.to_string();
        match err {
            NativeError::NoMoreFiles | NativeError::FileNotFound | NativeError::PathNotFound => {
                Error::NotFound { path }
            }
            NativeError::NotEnoughMemory => Error::OutOfMemory,
            NativeError::TooManyOpenFiles => Error::TooManyOpenFiles,
            NativeError::AccessDenied => Error::PermissionDenied { path },
            other => Error::Io(format!("{path}: {other}")),
        }
    }

    /// Failure of the SMB share enumeration.
    pub fn from_shares(err: NativeError, server: &str) -> Self {
        let path = format!("//{server}");
        match err {
            NativeError::AccessDenied | NativeError::SharingViolation => {
                Error::PermissionDenied { path }
            }
            NativeError::FileNotFound => Error::NotFound { path },
            NativeError::PathNotFound | NativeError::InvalidDrive => Error::NotADirectory { path },
            NativeError::NotSupported => Error::NotSupported,
            NativeError::NotEnoughMemory => Error::OutOfMemory,
            other => Error::Io(format!("{path}: {other}")),
        }
    }

    /// Failure of a native socket call.
    pub fn from_socket(err: NativeError) -> Self {
        match err {
            NativeError::WouldBlock => Error::WouldBlock,
            NativeError::NotSocket | NativeError::InvalidHandle => Error::BadDescriptor,
            NativeError::TooManyOpenFiles => Error::TooManyOpenFiles,
            NativeError::NotEnoughMemory => Error::OutOfMemory,
            NativeError::AccessDenied => Error::PermissionDenied { path: String::new() },
            NativeError::NotSupported => Error::NotSupported,
            NativeError::Interrupted => Error::Interrupted,
            NativeError::InvalidArgument => Error::InvalidArgument("rejected by the socket layer"),
            NativeError::Fault => Error::BadAddress,
            NativeError::AddressInUse => Error::AddressInUse,
            NativeError::ConnectionRefused => Error::ConnectionRefused,
            NativeError::NotConnected => Error::NotConnected,
            other => Error::Io(other.to_string()),
        }
    }

    /// Failure of `getaddrinfo`/`gethostbyname` on `host`.
    pub fn from_lookup(err: NativeError, host: &str) -> Self {
        match err {
            NativeError::HostNotFound
            | NativeError::TryAgain
            | NativeError::NoRecovery
            | NativeError::NoData
            | NativeError::Other(_) => {
                Error::HostLookup { host: host.to_string(), code: err.code() as i32 }
            }
            other => Error::from_socket(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_errors() {
        assert_eq!(
            Error::from_attributes(NativeError::PathNotFound, "c:\\x\\y").errno(),
            libc::ENOTDIR
        );
        assert_eq!(
            Error::from_attributes(NativeError::FileNotFound, "c:\\x").errno(),
            libc::ENOENT
        );
        assert_eq!(
            Error::from_attributes(NativeError::SharingViolation, "c:\\x").errno(),
            libc::EACCES
        );
        assert_eq!(Error::from_attributes(NativeError::Other(1117), "c:\\x").errno(), libc::EIO);
    }

    #[test]
    fn test_search_errors() {
        assert_eq!(Error::from_search(NativeError::PathNotFound, "p").errno(), libc::ENOENT);
        assert_eq!(Error::from_search(NativeError::NotEnoughMemory, "p"), Error::OutOfMemory);
        assert_eq!(
            Error::from_search(NativeError::TooManyOpenFiles, "p"),
            Error::TooManyOpenFiles
        );
    }

    #[test]
    fn test_share_and_socket_errors() {
        assert_eq!(Error::from_shares(NativeError::NotSupported, "srv"), Error::NotSupported);
        assert_eq!(
            Error::from_shares(NativeError::AccessDenied, "srv"),
            Error::PermissionDenied { path: "//srv".into() }
        );
        assert_eq!(Error::from_socket(NativeError::WouldBlock).errno(), libc::EAGAIN);
        assert_eq!(Error::from_socket(NativeError::NotSocket), Error::BadDescriptor);
    }

    #[test]
    fn test_winsock_errno_values() {
        let errno = |code| Error::from_socket(NativeError::from_code(code)).errno();
        assert_eq!(errno(10004), libc::EINTR);
        assert_eq!(errno(10009), libc::EBADF);
        assert_eq!(errno(10013), libc::EACCES);
        assert_eq!(errno(10014), libc::EFAULT);
        assert_eq!(errno(10022), libc::EINVAL);
        assert_eq!(errno(10024), libc::EMFILE);
        assert_eq!(errno(10061), libc::ECONNREFUSED);
        assert_eq!(errno(10050), libc::EIO);
    }

    #[test]
    fn test_lookup_errors() {
        assert_eq!(
            Error::from_lookup(NativeError::HostNotFound, "nowhere"),
            Error::HostLookup { host: "nowhere".into(), code: 11001 }
        );
        assert_eq!(Error::from_lookup(NativeError::NotEnoughMemory, "x"), Error::OutOfMemory);
    }

    #[test]
    fn test_module_message() {
        let err = Error::Module { file: "foo.dll".into(), reason: "missing".into() };
        assert_eq!(err.to_string(), "foo.dll : missing");
    }
}
