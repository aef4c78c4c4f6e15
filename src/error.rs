//! Error classification
//!
//! Workers record the raw failure in the request's error slot; the block
//! translates it into a closed set of error kinds before replying. Callers
//! receive both the kind and the untranslated OS error number so they can
//! decide on remediation themselves.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Marker value carried in the OS-error field of a reply when the error was
/// raised locally (bad parameters, underflow) rather than by a syscall.
pub const LOCAL_ERROR: u32 = !0;

/// Closed classification of file system failures reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ErrorKind {
    EnvironmentError = 800,
    TemporaryNotAccessible = 801,
    NoSpaceLeftOnDevice = 802,
    PermissionDenied = 803,
    NoMoreResources = 804,
    FileDoesNotExist = 805,
    Unknown = 806,
    NoFileSystemPath = 807,
    OutOfMemory = 809,
    InvalidParameters = 811,
    ReadUnderflow = 812,
}

/// Translate an OS error number into an [`ErrorKind`].
pub fn translate_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::EACCES | libc::EROFS | libc::ENXIO => ErrorKind::PermissionDenied,
        libc::EAGAIN | libc::ETIMEDOUT | libc::ENOLCK | libc::EINTR | libc::EIO => {
            ErrorKind::TemporaryNotAccessible
        }
        libc::ENFILE | libc::EDQUOT | libc::ENOSR | libc::ENOSPC | libc::EFBIG => {
            ErrorKind::NoSpaceLeftOnDevice
        }
        libc::EINVAL
        | libc::EBADF
        | libc::ENAMETOOLONG
        | libc::EFAULT
        | libc::EISDIR
        | libc::ENOTDIR
        | libc::EEXIST
        | libc::ETXTBSY => ErrorKind::InvalidParameters,
        libc::ELOOP
        | libc::ENOLINK
        | libc::EMULTIHOP
        | libc::EOPNOTSUPP
        | libc::ESPIPE
        | libc::EPIPE => ErrorKind::EnvironmentError,
        libc::EMFILE | libc::ENOMEM => ErrorKind::NoMoreResources,
        libc::ENOENT => ErrorKind::FileDoesNotExist,
        _ => ErrorKind::Unknown,
    }
}

/// Failure recorded by a worker into the request it is executing.
///
/// `Os` carries a raw errno. The remaining variants are raised locally and
/// reach the caller with [`LOCAL_ERROR`] in the OS-error field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    Os(i32),
    ReadUnderflow,
    Parameter,
    OutOfMemory,
    /// Caller-defined error code, used by memory-map and index-build
    /// requests whose error space belongs to the requesting block.
    Code(u32),
}

impl RequestError {
    pub(crate) fn from_io(err: &std::io::Error) -> RequestError {
        RequestError::Os(err.raw_os_error().unwrap_or(0))
    }

    /// Split into the reply representation: translated kind plus the OS
    /// error word.
    pub fn classify(self) -> (ErrorKind, u32) {
        match self {
            RequestError::Os(errno) => (translate_errno(errno), errno as u32),
            RequestError::ReadUnderflow => (ErrorKind::ReadUnderflow, LOCAL_ERROR),
            RequestError::Parameter => (ErrorKind::InvalidParameters, LOCAL_ERROR),
            RequestError::OutOfMemory => (ErrorKind::OutOfMemory, LOCAL_ERROR),
            RequestError::Code(_) => (ErrorKind::Unknown, LOCAL_ERROR),
        }
    }
}

impl From<nix::errno::Errno> for RequestError {
    fn from(errno: nix::errno::Errno) -> RequestError {
        RequestError::Os(errno as i32)
    }
}
