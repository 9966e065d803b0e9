//! Error types for the SMB2 engine

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for SMB2 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SMB2 engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed wire data
    #[error("Protocol parsing error: {0}")]
    ParseError(String),

    /// Invalid or corrupt SMB2 header
    #[error("Invalid SMB2 header: {0}")]
    InvalidHeader(String),

    /// Declared structure size does not match the command constant
    #[error("Invalid structure size for {command}: expected {expected}, found {found}")]
    StructureSize {
        command: &'static str,
        expected: u16,
        found: u16,
    },

    /// Offset/length pair outside of the segment
    #[error("Invalid offset: {0}")]
    InvalidOffset(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// Status reported by the server
    #[error("Server returned {0}")]
    Status(NtStatus),

    /// Allocation or resource exhaustion
    #[error("Out of memory")]
    OutOfMemory,

    /// No socket is connected
    #[error("Not connected")]
    NotConnected,

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection was torn down while the request was outstanding
    #[error("Connection reset")]
    ConnectionReset,

    /// No reply within the configured timeout
    #[error("Operation timed out")]
    Timeout,

    /// A synchronous wait was abandoned
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Feature not supported by this engine or the peer
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Authentication mechanism failure
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Crypto collaborator failure
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// DCE/RPC level failure
    #[error("DCE/RPC error: {0}")]
    Rpc(String),
}

impl Error {
    /// Negative errno view of this error, as reported by C style callers.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Status(status) => status.to_errno(),
            Error::OutOfMemory => libc::ENOMEM,
            Error::NotConnected => libc::ENOTCONN,
            Error::ConnectionReset => libc::ECONNRESET,
            Error::Timeout => libc::ETIMEDOUT,
            Error::Cancelled => libc::ECANCELED,
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::AuthenticationFailed(_) => libc::EACCES,
            Error::InvalidState(_) => libc::EINVAL,
            Error::ParseError(_)
            | Error::InvalidHeader(_)
            | Error::StructureSize { .. }
            | Error::InvalidOffset(_)
            | Error::BufferTooSmall { .. }
            | Error::InvalidParameter(_)
            | Error::CryptoError(_)
            | Error::Rpc(_) => libc::EINVAL,
        };
        -code
    }

    /// The NT status carried by this error. Engine-side resets and
    /// timeouts map to the statuses a server would have used.
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            Error::Status(status) => Some(*status),
            Error::ConnectionReset => Some(NtStatus::CONNECTION_RESET),
            Error::Timeout => Some(NtStatus::IO_TIMEOUT),
            _ => None,
        }
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        Error::ParseError(msg.into())
    }
}

impl From<NtStatus> for Error {
    fn from(status: NtStatus) -> Self {
        Error::Status(status)
    }
}

/// NT status code as carried in the SMB2 header.
///
/// Unknown values are preserved; the named constants cover what the engine
/// itself produces or inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct NtStatus(pub u32);

macro_rules! nt_status_table {
    ($( $name:ident = $value:literal, $msg:literal, $errno:expr; )*) => {
        impl NtStatus {
            $( pub const $name: NtStatus = NtStatus($value); )*

            fn describe(self) -> Option<&'static str> {
                match self.0 {
                    $( $value => Some($msg), )*
                    _ => None,
                }
            }

            fn errno_entry(self) -> Option<i32> {
                match self.0 {
                    $( $value => Some($errno), )*
                    _ => None,
                }
            }
        }
    };
}

nt_status_table! {
    SUCCESS = 0x0000_0000, "Success", 0;
    PENDING = 0x0000_0103, "Pending", libc::EAGAIN;
    NOTIFY_CLEANUP = 0x0000_010B, "Notify cleanup", 0;
    NOTIFY_ENUM_DIR = 0x0000_010C, "Notify enum dir", 0;
    BUFFER_OVERFLOW = 0x8000_0005, "Buffer overflow", libc::EOVERFLOW;
    NO_MORE_FILES = 0x8000_0006, "No more files", libc::ENODATA;
    STOPPED_ON_SYMLINK = 0x8000_002D, "Stopped on symlink", libc::ENOLINK;
    NOT_IMPLEMENTED = 0xC000_0002, "Not implemented", libc::ENOSYS;
    INVALID_INFO_CLASS = 0xC000_0003, "Invalid info class", libc::EINVAL;
    INVALID_HANDLE = 0xC000_0008, "Invalid handle", libc::EBADF;
    INVALID_PARAMETER = 0xC000_000D, "Invalid parameter", libc::EINVAL;
    NO_SUCH_DEVICE = 0xC000_000E, "No such device", libc::ENODEV;
    NO_SUCH_FILE = 0xC000_000F, "No such file", libc::ENOENT;
    INVALID_DEVICE_REQUEST = 0xC000_0010, "Invalid device request", libc::EINVAL;
    END_OF_FILE = 0xC000_0011, "End of file", libc::ENODATA;
    MORE_PROCESSING_REQUIRED = 0xC000_0016, "More processing required", libc::EAGAIN;
    NO_MEMORY = 0xC000_0017, "No memory", libc::ENOMEM;
    ACCESS_DENIED = 0xC000_0022, "Access denied", libc::EACCES;
    BUFFER_TOO_SMALL = 0xC000_0023, "Buffer too small", libc::EMSGSIZE;
    OBJECT_NAME_INVALID = 0xC000_0033, "Object name invalid", libc::EINVAL;
    OBJECT_NAME_NOT_FOUND = 0xC000_0034, "Object name not found", libc::ENOENT;
    OBJECT_NAME_COLLISION = 0xC000_0035, "Object name collision", libc::EEXIST;
    OBJECT_PATH_INVALID = 0xC000_0039, "Object path invalid", libc::ENOTDIR;
    OBJECT_PATH_NOT_FOUND = 0xC000_003A, "Object path not found", libc::ENOENT;
    OBJECT_PATH_SYNTAX_BAD = 0xC000_003B, "Object path syntax bad", libc::EINVAL;
    SHARING_VIOLATION = 0xC000_0043, "Sharing violation", libc::EBUSY;
    FILE_LOCK_CONFLICT = 0xC000_0054, "File lock conflict", libc::EAGAIN;
    LOCK_NOT_GRANTED = 0xC000_0055, "Lock not granted", libc::EAGAIN;
    DELETE_PENDING = 0xC000_0056, "Delete pending", libc::EPERM;
    WRONG_PASSWORD = 0xC000_006A, "Wrong password", libc::EACCES;
    LOGON_FAILURE = 0xC000_006D, "Logon failure", libc::ECONNREFUSED;
    PASSWORD_EXPIRED = 0xC000_0071, "Password expired", libc::EACCES;
    ACCOUNT_DISABLED = 0xC000_0072, "Account disabled", libc::EACCES;
    NONE_MAPPED = 0xC000_0073, "None mapped", libc::ENOENT;
    DISK_FULL = 0xC000_007F, "Disk full", libc::ENOSPC;
    INSUFFICIENT_RESOURCES = 0xC000_009A, "Insufficient resources", libc::ENOMEM;
    PIPE_DISCONNECTED = 0xC000_00B0, "Pipe disconnected", libc::EPIPE;
    IO_TIMEOUT = 0xC000_00B5, "I/O timeout", libc::ETIMEDOUT;
    FILE_IS_A_DIRECTORY = 0xC000_00BA, "File is a directory", libc::EISDIR;
    NOT_SUPPORTED = 0xC000_00BB, "Not supported", libc::EOPNOTSUPP;
    INVALID_NETWORK_RESPONSE = 0xC000_00C3, "Invalid network response", libc::EIO;
    NETWORK_NAME_DELETED = 0xC000_00C9, "Network name deleted", libc::ECONNRESET;
    NETWORK_ACCESS_DENIED = 0xC000_00CA, "Network access denied", libc::EACCES;
    BAD_NETWORK_NAME = 0xC000_00CC, "Bad network name", libc::ENOENT;
    INTERNAL_ERROR = 0xC000_00E5, "Internal error", libc::EIO;
    DIRECTORY_NOT_EMPTY = 0xC000_0101, "Directory not empty", libc::ENOTEMPTY;
    NOT_A_DIRECTORY = 0xC000_0103, "Not a directory", libc::ENOTDIR;
    CANCELLED = 0xC000_0120, "Cancelled", libc::ECANCELED;
    FILE_CLOSED = 0xC000_0128, "File closed", libc::EBADF;
    USER_SESSION_DELETED = 0xC000_0203, "User session deleted", libc::ECONNRESET;
    CONNECTION_DISCONNECTED = 0xC000_020C, "Connection disconnected", libc::ECONNRESET;
    CONNECTION_RESET = 0xC000_020D, "Connection reset", libc::ECONNRESET;
    NOT_FOUND = 0xC000_0225, "Not found", libc::ENOENT;
    PATH_NOT_COVERED = 0xC000_0257, "Path not covered", libc::ENOENT;
}

impl NtStatus {
    /// Severity is success or informational
    pub fn is_success(self) -> bool {
        self.0 >> 30 < 2
    }

    /// Severity is error (0xC)
    pub fn is_error(self) -> bool {
        self.0 >> 30 == 3
    }

    /// Severity is warning (0x8)
    pub fn is_warning(self) -> bool {
        self.0 >> 30 == 2
    }

    /// Whether a reply carrying this status is treated as a failed command.
    ///
    /// Error severity fails the command except MORE_PROCESSING_REQUIRED,
    /// which drives multi-round session setup. STOPPED_ON_SYMLINK is a
    /// warning that still fails the command.
    pub fn is_failure(self) -> bool {
        (self.is_error() && self != NtStatus::MORE_PROCESSING_REQUIRED)
            || self == NtStatus::STOPPED_ON_SYMLINK
    }

    pub fn from_u32(value: u32) -> Self {
        NtStatus(value)
    }

    /// Positive errno equivalent of this status.
    pub fn to_errno(self) -> i32 {
        match self.errno_entry() {
            Some(errno) => errno,
            None if self.is_success() => 0,
            None => libc::EIO,
        }
    }
}

impl From<u32> for NtStatus {
    fn from(value: u32) -> Self {
        NtStatus(value)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some(msg) => write!(f, "{} (0x{:08X})", msg, self.0),
            None => write!(f, "Unknown status (0x{:08X})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntstatus_success() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(NtStatus::PENDING.is_success());
        assert!(!NtStatus::SUCCESS.is_error());
        assert!(!NtStatus::SUCCESS.is_warning());
    }

    #[test]
    fn test_ntstatus_error() {
        assert!(NtStatus::ACCESS_DENIED.is_error());
        assert!(NtStatus::ACCESS_DENIED.is_failure());
        assert!(!NtStatus::ACCESS_DENIED.is_warning());
    }

    #[test]
    fn test_ntstatus_warning() {
        assert!(NtStatus::NO_MORE_FILES.is_warning());
        assert!(!NtStatus::NO_MORE_FILES.is_failure());
        assert!(NtStatus::STOPPED_ON_SYMLINK.is_failure());
    }

    #[test]
    fn test_more_processing_is_not_failure() {
        assert!(NtStatus::MORE_PROCESSING_REQUIRED.is_error());
        assert!(!NtStatus::MORE_PROCESSING_REQUIRED.is_failure());
    }

    #[test]
    fn test_errno_table() {
        assert_eq!(NtStatus::OBJECT_NAME_NOT_FOUND.to_errno(), libc::ENOENT);
        assert_eq!(NtStatus::ACCESS_DENIED.to_errno(), libc::EACCES);
        assert_eq!(NtStatus::SUCCESS.to_errno(), 0);
        assert_eq!(NtStatus(0xC0FF_FFFF).to_errno(), libc::EIO);
        assert_eq!(Error::ConnectionReset.errno(), -libc::ECONNRESET);
        assert_eq!(
            Error::Status(NtStatus::DIRECTORY_NOT_EMPTY).errno(),
            -libc::ENOTEMPTY
        );
    }

    #[test]
    fn test_ntstatus_display() {
        let display = format!("{}", NtStatus::ACCESS_DENIED);
        assert!(display.contains("Access denied"));
        assert!(display.contains("0xC0000022"));
        assert!(format!("{}", NtStatus(0xC0FF_FFFF)).contains("Unknown"));
    }
}
