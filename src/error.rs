//! Error model: a closed [`StatusCode`] enumeration plus a [`Error`] value type
//! carrying an optional free-form message, mirroring `mio::sys::unix`'s own
//! `io::Error` translation layer but exposed as a stable, OS-independent enum.

use std::fmt;

/// Closed enumeration of status conditions reported by this crate.
///
/// The set mirrors `errno`-like OS conditions, synchronous argument/state
/// errors, and TLS/DTLS engine errors. New variants are only ever appended;
/// nothing is ever renumbered, since `StatusCode` values are logged and
/// compared across process boundaries in application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    Ok,

    // -- argument / state errors (synchronous) --
    InvalidArgument,
    NotConnected,
    NotOpen,
    FileNotOpen,
    DirNotOpen,
    OperationAlreadyInProgress,
    ConnectionAlreadyInProgress,
    DestinationAddressRequired,
    OperationNotSupported,
    UnknownSignal,

    // -- lifecycle / cancellation --
    OperationCanceled,
    EndOfFile,

    // -- OS / network errors (asynchronous) --
    AddressAlreadyInUse,
    AddressNotAvailable,
    ConnectionRefused,
    ConnectionResetByPeer,
    ConnectionAborted,
    NetworkUnreachable,
    HostUnreachable,
    NetworkDown,
    TimedOut,
    BrokenPipe,
    NoBufferSpaceAvailable,
    MessageTooLong,
    NotPermitted,
    PermissionDenied,
    ResourceTemporarilyUnavailable,
    TooManyOpenFiles,
    OutOfMemory,
    Interrupted,
    OperationWouldBlock,
    InvalidHandle,
    NotASocket,
    ProtocolNotSupported,
    AddressFamilyNotSupported,

    // -- filesystem errors --
    NoSuchFileOrDirectory,
    FileAlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    PathTooLong,
    DeviceOrResourceBusy,
    CrossDeviceLink,
    TooManySymbolicLinks,
    ReadOnlyFileSystem,
    NoSpaceLeftOnDevice,
    IllegalOperationOnADirectory,

    // -- TLS / DTLS errors --
    TlsCertificateFileNotExist,
    TlsCertificateInvalid,
    TlsPrivateKeyFileNotExist,
    TlsPrivateKeyInvalid,
    TlsPrivateKeyAndCertificateNotMatch,
    OpensslError,

    // -- catch-all for unmapped OS errors --
    UnknownError,
}

impl StatusCode {
    /// Translates a raw OS `errno`-style error code into a `StatusCode`.
    ///
    /// Kept as a standalone function rather than folded into the enum itself:
    /// the enum stays stable and exhaustive, and this function is the only
    /// place that knows about `libc` constants.
    #[cfg(unix)]
    pub fn from_os_error(raw: i32) -> StatusCode {
        match raw {
            libc::EINVAL => StatusCode::InvalidArgument,
            libc::ENOTCONN => StatusCode::NotConnected,
            libc::EADDRINUSE => StatusCode::AddressAlreadyInUse,
            libc::EADDRNOTAVAIL => StatusCode::AddressNotAvailable,
            libc::ECONNREFUSED => StatusCode::ConnectionRefused,
            libc::ECONNRESET => StatusCode::ConnectionResetByPeer,
            libc::ECONNABORTED => StatusCode::ConnectionAborted,
            libc::ENETUNREACH => StatusCode::NetworkUnreachable,
            libc::EHOSTUNREACH => StatusCode::HostUnreachable,
            libc::ENETDOWN => StatusCode::NetworkDown,
            libc::ETIMEDOUT => StatusCode::TimedOut,
            libc::EPIPE => StatusCode::BrokenPipe,
            libc::ENOBUFS => StatusCode::NoBufferSpaceAvailable,
            libc::EMSGSIZE => StatusCode::MessageTooLong,
            libc::EPERM => StatusCode::NotPermitted,
            libc::EACCES => StatusCode::PermissionDenied,
            libc::EAGAIN => StatusCode::ResourceTemporarilyUnavailable,
            libc::EMFILE | libc::ENFILE => StatusCode::TooManyOpenFiles,
            libc::ENOMEM => StatusCode::OutOfMemory,
            libc::EINTR => StatusCode::Interrupted,
            libc::EBADF => StatusCode::InvalidHandle,
            libc::ENOTSOCK => StatusCode::NotASocket,
            libc::EPROTONOSUPPORT => StatusCode::ProtocolNotSupported,
            libc::EAFNOSUPPORT => StatusCode::AddressFamilyNotSupported,
            libc::ENOENT => StatusCode::NoSuchFileOrDirectory,
            libc::EEXIST => StatusCode::FileAlreadyExists,
            libc::ENOTDIR => StatusCode::NotADirectory,
            libc::EISDIR => StatusCode::IsADirectory,
            libc::ENOTEMPTY => StatusCode::DirectoryNotEmpty,
            libc::ENAMETOOLONG => StatusCode::PathTooLong,
            libc::EBUSY => StatusCode::DeviceOrResourceBusy,
            libc::EXDEV => StatusCode::CrossDeviceLink,
            libc::ELOOP => StatusCode::TooManySymbolicLinks,
            libc::EROFS => StatusCode::ReadOnlyFileSystem,
            libc::ENOSPC => StatusCode::NoSpaceLeftOnDevice,
            0 => StatusCode::Ok,
            _ => StatusCode::UnknownError,
        }
    }

    /// Translates a [`std::io::ErrorKind`] into a `StatusCode` for platforms
    /// (or error paths) where the raw OS code isn't available.
    pub fn from_io_error_kind(kind: std::io::ErrorKind) -> StatusCode {
        use std::io::ErrorKind as K;
        match kind {
            K::NotFound => StatusCode::NoSuchFileOrDirectory,
            K::PermissionDenied => StatusCode::PermissionDenied,
            K::ConnectionRefused => StatusCode::ConnectionRefused,
            K::ConnectionReset => StatusCode::ConnectionResetByPeer,
            K::ConnectionAborted => StatusCode::ConnectionAborted,
            K::NotConnected => StatusCode::NotConnected,
            K::AddrInUse => StatusCode::AddressAlreadyInUse,
            K::AddrNotAvailable => StatusCode::AddressNotAvailable,
            K::BrokenPipe => StatusCode::BrokenPipe,
            K::AlreadyExists => StatusCode::FileAlreadyExists,
            K::WouldBlock => StatusCode::OperationWouldBlock,
            K::InvalidInput | K::InvalidData => StatusCode::InvalidArgument,
            K::TimedOut => StatusCode::TimedOut,
            K::WriteZero => StatusCode::NoBufferSpaceAvailable,
            K::Interrupted => StatusCode::Interrupted,
            K::UnexpectedEof => StatusCode::EndOfFile,
            K::OutOfMemory => StatusCode::OutOfMemory,
            _ => StatusCode::UnknownError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotConnected => "NOT_CONNECTED",
            StatusCode::NotOpen => "NOT_OPEN",
            StatusCode::FileNotOpen => "FILE_NOT_OPEN",
            StatusCode::DirNotOpen => "DIR_NOT_OPEN",
            StatusCode::OperationAlreadyInProgress => "OPERATION_ALREADY_IN_PROGRESS",
            StatusCode::ConnectionAlreadyInProgress => "CONNECTION_ALREADY_IN_PROGRESS",
            StatusCode::DestinationAddressRequired => "DESTINATION_ADDRESS_REQUIRED",
            StatusCode::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
            StatusCode::UnknownSignal => "UNKNOWN_SIGNAL",
            StatusCode::OperationCanceled => "OPERATION_CANCELED",
            StatusCode::EndOfFile => "END_OF_FILE",
            StatusCode::AddressAlreadyInUse => "ADDRESS_ALREADY_IN_USE",
            StatusCode::AddressNotAvailable => "ADDRESS_NOT_AVAILABLE",
            StatusCode::ConnectionRefused => "CONNECTION_REFUSED",
            StatusCode::ConnectionResetByPeer => "CONNECTION_RESET_BY_PEER",
            StatusCode::ConnectionAborted => "CONNECTION_ABORTED",
            StatusCode::NetworkUnreachable => "NETWORK_UNREACHABLE",
            StatusCode::HostUnreachable => "HOST_UNREACHABLE",
            StatusCode::NetworkDown => "NETWORK_DOWN",
            StatusCode::TimedOut => "TIMED_OUT",
            StatusCode::BrokenPipe => "BROKEN_PIPE",
            StatusCode::NoBufferSpaceAvailable => "NO_BUFFER_SPACE_AVAILABLE",
            StatusCode::MessageTooLong => "MESSAGE_TOO_LONG",
            StatusCode::NotPermitted => "NOT_PERMITTED",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceTemporarilyUnavailable => "RESOURCE_TEMPORARILY_UNAVAILABLE",
            StatusCode::TooManyOpenFiles => "TOO_MANY_OPEN_FILES",
            StatusCode::OutOfMemory => "OUT_OF_MEMORY",
            StatusCode::Interrupted => "INTERRUPTED",
            StatusCode::OperationWouldBlock => "OPERATION_WOULD_BLOCK",
            StatusCode::InvalidHandle => "INVALID_HANDLE",
            StatusCode::NotASocket => "NOT_A_SOCKET",
            StatusCode::ProtocolNotSupported => "PROTOCOL_NOT_SUPPORTED",
            StatusCode::AddressFamilyNotSupported => "ADDRESS_FAMILY_NOT_SUPPORTED",
            StatusCode::NoSuchFileOrDirectory => "NO_SUCH_FILE_OR_DIRECTORY",
            StatusCode::FileAlreadyExists => "FILE_ALREADY_EXISTS",
            StatusCode::NotADirectory => "NOT_A_DIRECTORY",
            StatusCode::IsADirectory => "IS_A_DIRECTORY",
            StatusCode::DirectoryNotEmpty => "DIRECTORY_NOT_EMPTY",
            StatusCode::PathTooLong => "PATH_TOO_LONG",
            StatusCode::DeviceOrResourceBusy => "DEVICE_OR_RESOURCE_BUSY",
            StatusCode::CrossDeviceLink => "CROSS_DEVICE_LINK",
            StatusCode::TooManySymbolicLinks => "TOO_MANY_SYMBOLIC_LINKS",
            StatusCode::ReadOnlyFileSystem => "READ_ONLY_FILE_SYSTEM",
            StatusCode::NoSpaceLeftOnDevice => "NO_SPACE_LEFT_ON_DEVICE",
            StatusCode::IllegalOperationOnADirectory => "ILLEGAL_OPERATION_ON_A_DIRECTORY",
            StatusCode::TlsCertificateFileNotExist => "TLS_CERTIFICATE_FILE_NOT_EXIST",
            StatusCode::TlsCertificateInvalid => "TLS_CERTIFICATE_INVALID",
            StatusCode::TlsPrivateKeyFileNotExist => "TLS_PRIVATE_KEY_FILE_NOT_EXIST",
            StatusCode::TlsPrivateKeyInvalid => "TLS_PRIVATE_KEY_INVALID",
            StatusCode::TlsPrivateKeyAndCertificateNotMatch => {
                "TLS_PRIVATE_KEY_AND_CERTIFICATE_NOT_MATCH"
            }
            StatusCode::OpensslError => "OPENSSL_ERROR",
            StatusCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value type carrying a [`StatusCode`] and an optional free-form message
/// for compound errors (e.g. an OpenSSL error string).
///
/// Truthy iff the code is not `Ok`; expressed here as [`Error::is_error`]
/// since Rust has no implicit bool conversion.
#[derive(Debug, Clone)]
pub struct Error {
    code: StatusCode,
    message: Option<String>,
}

impl Error {
    pub const OK: Error = Error {
        code: StatusCode::Ok,
        message: None,
    };

    pub fn new(code: StatusCode) -> Error {
        Error {
            code,
            message: None,
        }
    }

    pub fn with_message(code: StatusCode, message: impl Into<String>) -> Error {
        Error {
            code,
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.code != StatusCode::Ok
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl Default for Error {
    fn default() -> Error {
        Error::OK
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}
impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.code, m),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

impl From<StatusCode> for Error {
    fn from(code: StatusCode) -> Error {
        Error::new(code)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        #[cfg(unix)]
        {
            if let Some(raw) = e.raw_os_error() {
                return Error::with_message(StatusCode::from_os_error(raw), e.to_string());
            }
        }
        Error::with_message(StatusCode::from_io_error_kind(e.kind()), e.to_string())
    }
}

#[cfg(feature = "tls")]
impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Error {
        Error::with_message(StatusCode::OpensslError, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_is_not_an_error() {
        assert!(!Error::OK.is_error());
        assert!(Error::new(StatusCode::EndOfFile).is_error());
    }

    #[test]
    fn display_includes_message_when_present() {
        let e = Error::with_message(StatusCode::OpensslError, "bad record mac");
        assert_eq!(e.to_string(), "OPENSSL_ERROR: bad record mac");
        assert_eq!(Error::new(StatusCode::Ok).to_string(), "OK");
    }

    #[cfg(unix)]
    #[test]
    fn from_os_error_maps_common_errnos() {
        assert_eq!(
            StatusCode::from_os_error(libc::ECONNRESET),
            StatusCode::ConnectionResetByPeer
        );
        assert_eq!(
            StatusCode::from_os_error(libc::EADDRINUSE),
            StatusCode::AddressAlreadyInUse
        );
    }
}
