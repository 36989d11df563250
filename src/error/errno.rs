//! Static errno tables.
//!
//! Numeric errno values differ between host platforms (e.g. `EAGAIN` is 11 on
//! Linux and 35 on macOS), so the mnemonic/description mapping is a table per
//! platform selected at compile time rather than anything computed.

use std::io;

/// One row of the errno table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrnoEntry {
    /// Stable mnemonic, e.g. `"ECONNREFUSED"`.
    pub code: &'static str,
    /// Platform errno value.
    pub errno: i32,
    /// Human-readable description.
    pub description: &'static str,
}

macro_rules! errno_table {
    ($($code:ident = $errno:expr => $desc:expr;)*) => {
        &[$(ErrnoEntry { code: stringify!($code), errno: $errno, description: $desc },)*]
    };
}

/// End of stream. Not a real errno; uses libuv's out-of-range value.
pub const EOF: ErrnoEntry = ErrnoEntry {
    code: "EOF",
    errno: 4095,
    description: "end of file",
};

/// Catch-all for errnos missing from the table.
pub const UNKNOWN: ErrnoEntry = ErrnoEntry {
    code: "UNKNOWN",
    errno: 4094,
    description: "unknown error",
};

#[cfg(any(target_os = "linux", target_os = "android"))]
static TABLE: &[ErrnoEntry] = errno_table! {
    EPERM = 1 => "operation not permitted";
    ENOENT = 2 => "no such file or directory";
    ESRCH = 3 => "no such process";
    EINTR = 4 => "interrupted system call";
    EIO = 5 => "i/o error";
    E2BIG = 7 => "argument list too long";
    EBADF = 9 => "bad file descriptor";
    ECHILD = 10 => "no child processes";
    EAGAIN = 11 => "resource temporarily unavailable";
    ENOMEM = 12 => "not enough memory";
    EACCES = 13 => "permission denied";
    EFAULT = 14 => "bad address in system call argument";
    EBUSY = 16 => "resource busy or locked";
    EEXIST = 17 => "file already exists";
    EXDEV = 18 => "cross-device link not permitted";
    ENODEV = 19 => "no such device";
    ENOTDIR = 20 => "not a directory";
    EISDIR = 21 => "illegal operation on a directory";
    EINVAL = 22 => "invalid argument";
    ENFILE = 23 => "file table overflow";
    EMFILE = 24 => "too many open files";
    ENOTTY = 25 => "inappropriate ioctl for device";
    EFBIG = 27 => "file too large";
    ENOSPC = 28 => "no space left on device";
    ESPIPE = 29 => "invalid seek";
    EROFS = 30 => "read-only file system";
    EPIPE = 32 => "broken pipe";
    ENAMETOOLONG = 36 => "name too long";
    ENOSYS = 38 => "function not implemented";
    ENOTEMPTY = 39 => "directory not empty";
    ELOOP = 40 => "too many symbolic links encountered";
    ENONET = 64 => "machine is not on the network";
    EPROTO = 71 => "protocol error";
    ENOTSOCK = 88 => "socket operation on non-socket";
    EDESTADDRREQ = 89 => "destination address required";
    EMSGSIZE = 90 => "message too long";
    EPROTOTYPE = 91 => "protocol wrong type for socket";
    EPROTONOSUPPORT = 93 => "protocol not supported";
    ENOTSUP = 95 => "operation not supported on socket";
    EAFNOSUPPORT = 97 => "address family not supported";
    EADDRINUSE = 98 => "address already in use";
    EADDRNOTAVAIL = 99 => "address not available";
    ENETDOWN = 100 => "network is down";
    ENETUNREACH = 101 => "network is unreachable";
    ECONNABORTED = 103 => "software caused connection abort";
    ECONNRESET = 104 => "connection reset by peer";
    ENOBUFS = 105 => "no buffer space available";
    EISCONN = 106 => "socket is already connected";
    ENOTCONN = 107 => "socket is not connected";
    ESHUTDOWN = 108 => "cannot send after transport endpoint shutdown";
    ETIMEDOUT = 110 => "connection timed out";
    ECONNREFUSED = 111 => "connection refused";
    EHOSTUNREACH = 113 => "host is unreachable";
    EALREADY = 114 => "connection already in progress";
    ECANCELED = 125 => "operation canceled";
};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
static TABLE: &[ErrnoEntry] = errno_table! {
    EPERM = 1 => "operation not permitted";
    ENOENT = 2 => "no such file or directory";
    ESRCH = 3 => "no such process";
    EINTR = 4 => "interrupted system call";
    EIO = 5 => "i/o error";
    E2BIG = 7 => "argument list too long";
    EBADF = 9 => "bad file descriptor";
    ECHILD = 10 => "no child processes";
    ENOMEM = 12 => "not enough memory";
    EACCES = 13 => "permission denied";
    EFAULT = 14 => "bad address in system call argument";
    EBUSY = 16 => "resource busy or locked";
    EEXIST = 17 => "file already exists";
    EXDEV = 18 => "cross-device link not permitted";
    ENODEV = 19 => "no such device";
    ENOTDIR = 20 => "not a directory";
    EISDIR = 21 => "illegal operation on a directory";
    EINVAL = 22 => "invalid argument";
    ENFILE = 23 => "file table overflow";
    EMFILE = 24 => "too many open files";
    ENOTTY = 25 => "inappropriate ioctl for device";
    EFBIG = 27 => "file too large";
    ENOSPC = 28 => "no space left on device";
    ESPIPE = 29 => "invalid seek";
    EROFS = 30 => "read-only file system";
    EPIPE = 32 => "broken pipe";
    EAGAIN = 35 => "resource temporarily unavailable";
    EALREADY = 37 => "connection already in progress";
    ENOTSOCK = 38 => "socket operation on non-socket";
    EDESTADDRREQ = 39 => "destination address required";
    EMSGSIZE = 40 => "message too long";
    EPROTOTYPE = 41 => "protocol wrong type for socket";
    EPROTONOSUPPORT = 43 => "protocol not supported";
    ENOTSUP = 45 => "operation not supported on socket";
    EAFNOSUPPORT = 47 => "address family not supported";
    EADDRINUSE = 48 => "address already in use";
    EADDRNOTAVAIL = 49 => "address not available";
    ENETDOWN = 50 => "network is down";
    ENETUNREACH = 51 => "network is unreachable";
    ECONNABORTED = 53 => "software caused connection abort";
    ECONNRESET = 54 => "connection reset by peer";
    ENOBUFS = 55 => "no buffer space available";
    EISCONN = 56 => "socket is already connected";
    ENOTCONN = 57 => "socket is not connected";
    ESHUTDOWN = 58 => "cannot send after transport endpoint shutdown";
    ETIMEDOUT = 60 => "connection timed out";
    ECONNREFUSED = 61 => "connection refused";
    ELOOP = 62 => "too many symbolic links encountered";
    ENAMETOOLONG = 63 => "name too long";
    EHOSTUNREACH = 65 => "host is unreachable";
    ENOTEMPTY = 66 => "directory not empty";
    ENOSYS = 78 => "function not implemented";
    ECANCELED = 89 => "operation canceled";
    EPROTO = 100 => "protocol error";
};

/// Looks up a platform errno value. Negative values (libuv style) are
/// accepted and treated as their absolute value.
pub fn lookup(errno: i32) -> Option<&'static ErrnoEntry> {
    let errno = errno.checked_abs()?;
    if errno == EOF.errno {
        return Some(&EOF);
    }
    TABLE.iter().find(|entry| entry.errno == errno)
}

/// Looks up a mnemonic such as `"EPIPE"`.
pub fn by_code(code: &str) -> Option<&'static ErrnoEntry> {
    match code {
        "EOF" => Some(&EOF),
        "UNKNOWN" => Some(&UNKNOWN),
        _ => TABLE.iter().find(|entry| entry.code == code),
    }
}

/// Mnemonic for an errno, `"UNKNOWN"` when the table has no row for it.
pub fn errname(errno: i32) -> &'static str {
    lookup(errno).map_or(UNKNOWN.code, |entry| entry.code)
}

/// Mnemonic used when an `io::Error` carries no OS errno.
pub(crate) fn code_for_kind(kind: io::ErrorKind) -> &'static str {
    use io::ErrorKind::*;
    match kind {
        NotFound => "ENOENT",
        PermissionDenied => "EACCES",
        ConnectionRefused => "ECONNREFUSED",
        ConnectionReset => "ECONNRESET",
        ConnectionAborted => "ECONNABORTED",
        NotConnected => "ENOTCONN",
        AddrInUse => "EADDRINUSE",
        AddrNotAvailable => "EADDRNOTAVAIL",
        BrokenPipe => "EPIPE",
        AlreadyExists => "EEXIST",
        WouldBlock => "EAGAIN",
        InvalidInput | InvalidData => "EINVAL",
        TimedOut => "ETIMEDOUT",
        Interrupted => "EINTR",
        Unsupported => "ENOTSUP",
        UnexpectedEof => "EOF",
        OutOfMemory => "ENOMEM",
        _ => "UNKNOWN",
    }
}
