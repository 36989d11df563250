//! Error taxonomy for the bridge.
//!
//! Every failure surfaces as one of four shapes, collected in [`Error`]:
//!
//! - [`NativeError`]: an OS-level failure, normalized to
//!   `{code, errno, message, path?, path2?}` and usually delivered through a
//!   completion.
//! - [`ProtocolError`]: an HTTP framing failure with its `HPE_*` code.
//! - [`PermissionError`]: a capability check refused the operation.
//! - [`UsageError`]: the caller asked for something that can never succeed
//!   (bad offsets, blocking on the reactor thread, wrong handle kind).

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

pub use crate::capability::PermissionError;

pub mod errno;

pub use errno::ErrnoEntry;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A normalized native failure.
///
/// Both sources of native failure (an [`io::Error`] from tokio/std and a raw
/// errno from a direct system call) end up here with the same fields.
///
/// # Examples
///
/// ```
/// use uvwire::NativeError;
///
/// let err = NativeError::from_code("ENOENT").with_path("/etc/missing");
/// assert_eq!(err.code, "ENOENT");
/// assert_eq!(err.message, "ENOENT, no such file or directory '/etc/missing'");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct NativeError {
    /// Mnemonic such as `"ECONNREFUSED"`.
    pub code: &'static str,
    /// Platform errno value.
    pub errno: i32,
    /// `"<CODE>, <description>"` plus quoted paths when present.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path2: Option<String>,
}

impl NativeError {
    /// Builds an error from a raw errno (sign is ignored).
    pub fn from_errno(errno: i32) -> Self {
        match errno::lookup(errno) {
            Some(entry) => Self::from_entry(entry),
            None => Self {
                errno: errno.saturating_abs(),
                ..Self::from_entry(&errno::UNKNOWN)
            },
        }
    }

    /// Builds an error from a mnemonic. Unknown mnemonics become `UNKNOWN`.
    pub fn from_code(code: &str) -> Self {
        Self::from_entry(errno::by_code(code).unwrap_or(&errno::UNKNOWN))
    }

    fn from_entry(entry: &ErrnoEntry) -> Self {
        Self {
            code: entry.code,
            errno: entry.errno,
            message: format!("{}, {}", entry.code, entry.description),
            path: None,
            path2: None,
        }
    }

    /// Captures the calling thread's `errno` after a failed libc call.
    pub fn last_os_error() -> Self {
        Self::from_errno(nix::errno::Errno::last() as i32)
    }

    /// Attaches the primary path and appends it to the message.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.message = format!("{} '{}'", self.message, path);
        self.path = Some(path);
        self
    }

    /// Attaches the secondary path (rename/link destination).
    pub fn with_path2(mut self, path2: impl Into<String>) -> Self {
        let path2 = path2.into();
        self.message = format!("{} '{}'", self.message, path2);
        self.path2 = Some(path2);
        self
    }

    /// Serializes the stable `{code, errno, message, path?, path2?}` shape.
    pub fn to_json(&self) -> serde_json::Value {
        // A struct of strings and integers cannot fail to serialize.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    pub fn canceled() -> Self {
        Self::from_code("ECANCELED")
    }

    pub fn bad_descriptor() -> Self {
        Self::from_code("EBADF")
    }

    pub fn not_connected() -> Self {
        Self::from_code("ENOTCONN")
    }

    pub fn invalid() -> Self {
        Self::from_code("EINVAL")
    }

    pub fn broken_pipe() -> Self {
        Self::from_code("EPIPE")
    }
}

impl From<io::Error> for NativeError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::from_code(errno::code_for_kind(err.kind())),
        }
    }
}

impl From<nix::errno::Errno> for NativeError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::from_errno(err as i32)
    }
}

/// What a filesystem call operated on.
///
/// Descriptor calls report "not found" as `EBADF`: the descriptor, not a
/// path, is what failed to resolve.
#[derive(Debug, Clone, Copy)]
pub enum FsTarget<'a> {
    Path(&'a str),
    Paths(&'a str, &'a str),
    Fd,
}

/// Normalizes a filesystem failure, attaching paths and applying the
/// descriptor rule.
pub fn map_fs_error(err: impl Into<NativeError>, target: FsTarget<'_>) -> NativeError {
    let err = err.into();
    match target {
        FsTarget::Fd if err.is("ENOENT") => NativeError::bad_descriptor(),
        FsTarget::Fd => err,
        FsTarget::Path(path) => err.with_path(path),
        FsTarget::Paths(from, to) => err.with_path(from).with_path2(to),
    }
}

/// `HPE_*` codes reported by the message parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParseErrorCode {
    CbHeadersComplete,
    CbBody,
    CbMessageComplete,
    CbHeaders,
    InvalidEofState,
    HeaderOverflow,
    ClosedConnection,
    InvalidVersion,
    InvalidStatus,
    InvalidMethod,
    InvalidUrl,
    InvalidHeaderToken,
    InvalidContentLength,
    InvalidChunkSize,
    InvalidConstant,
    LfExpected,
    Strict,
    Paused,
    Unknown,
}

impl ParseErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CbHeadersComplete => "HPE_CB_headers_complete",
            Self::CbBody => "HPE_CB_body",
            Self::CbMessageComplete => "HPE_CB_message_complete",
            Self::CbHeaders => "HPE_CB_headers",
            Self::InvalidEofState => "HPE_INVALID_EOF_STATE",
            Self::HeaderOverflow => "HPE_HEADER_OVERFLOW",
            Self::ClosedConnection => "HPE_CLOSED_CONNECTION",
            Self::InvalidVersion => "HPE_INVALID_VERSION",
            Self::InvalidStatus => "HPE_INVALID_STATUS",
            Self::InvalidMethod => "HPE_INVALID_METHOD",
            Self::InvalidUrl => "HPE_INVALID_URL",
            Self::InvalidHeaderToken => "HPE_INVALID_HEADER_TOKEN",
            Self::InvalidContentLength => "HPE_INVALID_CONTENT_LENGTH",
            Self::InvalidChunkSize => "HPE_INVALID_CHUNK_SIZE",
            Self::InvalidConstant => "HPE_INVALID_CONSTANT",
            Self::LfExpected => "HPE_LF_EXPECTED",
            Self::Strict => "HPE_STRICT",
            Self::Paused => "HPE_PAUSED",
            Self::Unknown => "HPE_UNKNOWN",
        }
    }

    /// `HPE_PAUSED` is the only code after which parsing can continue.
    pub fn is_recoverable(self) -> bool {
        self == Self::Paused
    }
}

impl fmt::Display for ParseErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A framing failure: the `HPE_*` code plus the number of bytes of the
/// current `execute` call consumed before the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Parse Error {code}")]
pub struct ProtocolError {
    pub code: ParseErrorCode,
    pub bytes_parsed: usize,
}

impl ProtocolError {
    pub fn new(code: ParseErrorCode, bytes_parsed: usize) -> Self {
        Self { code, bytes_parsed }
    }
}

/// Caller mistakes, reported synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("Offset is out of bounds")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("off + len > buffer.length")]
    RangeOutOfBounds {
        offset: usize,
        len: usize,
        buffer_len: usize,
    },

    #[error("{op} blocks and cannot be called on the reactor thread")]
    BlockingOnReactor { op: &'static str },

    #[error("{op} needs a running reactor; call it from Reactor::run or Reactor::block_on")]
    NotOnReactor { op: &'static str },

    #[error("{op} is not supported by {kind} handles")]
    Unsupported { op: &'static str, kind: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Any error produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Native(#[from] NativeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl Error {
    /// The native error, if this is one.
    pub fn as_native(&self) -> Option<&NativeError> {
        match self {
            Self::Native(err) => Some(err),
            _ => None,
        }
    }

    /// Mnemonic for native and protocol errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Native(err) => Some(err.code),
            Self::Protocol(err) => Some(err.code.as_str()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Native(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_format() {
        let err = NativeError::from_code("ECONNREFUSED");
        assert_eq!(err.message, "ECONNREFUSED, connection refused");
        assert!(err.path.is_none());

        let err = NativeError::from_code("EXDEV").with_path("a").with_path2("b");
        assert_eq!(err.message, "EXDEV, cross-device link not permitted 'a' 'b'");
        assert_eq!(err.path2.as_deref(), Some("b"));
    }

    #[test]
    fn io_error_uses_raw_errno() {
        let err = NativeError::from(io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert_eq!(err.code, "EADDRINUSE");
        assert_eq!(err.errno, libc::EADDRINUSE);
    }

    #[test]
    fn io_error_without_errno_uses_kind() {
        let err = NativeError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.code, "EPIPE");
        let err = NativeError::from(io::Error::other("mystery"));
        assert_eq!(err.code, "UNKNOWN");
    }

    #[test]
    fn nix_errno_maps() {
        let err = NativeError::from(nix::errno::Errno::ESRCH);
        assert_eq!(err.code, "ESRCH");
    }

    #[test]
    fn unknown_errno_keeps_value() {
        let err = NativeError::from_errno(-9999);
        assert_eq!(err.code, "UNKNOWN");
        assert_eq!(err.errno, 9999);
    }

    #[test]
    fn descriptor_not_found_is_ebadf() {
        let enoent = io::Error::from_raw_os_error(libc::ENOENT);
        let err = map_fs_error(enoent, FsTarget::Fd);
        assert_eq!(err.code, "EBADF");
        assert!(err.path.is_none());

        let enoent = io::Error::from_raw_os_error(libc::ENOENT);
        let err = map_fs_error(enoent, FsTarget::Path("/x"));
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.path.as_deref(), Some("/x"));
    }

    #[test]
    fn json_shape() {
        let json = NativeError::from_code("ENOENT").with_path("/x").to_json();
        assert_eq!(json["code"], "ENOENT");
        assert_eq!(json["path"], "/x");
        assert!(json.get("path2").is_none());
    }

    #[test]
    fn protocol_display() {
        let err = ProtocolError::new(ParseErrorCode::InvalidEofState, 0);
        assert_eq!(err.to_string(), "Parse Error HPE_INVALID_EOF_STATE");
        assert!(!err.code.is_recoverable());
    }
}
