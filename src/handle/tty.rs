//! Terminal handles and descriptor classification.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::sys::termios::{self, SetArg, Termios};
use serde::Serialize;
use tracing::{debug, warn};

use super::stream::Stream;
use super::{AnyHandle, Completion, Handle, HandleKind, HandleState};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::StreamIo;
use crate::native::io::{BoxRead, BoxWrite};
use crate::reactor::{HandleId, ReactorContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtyMode {
    #[default]
    Normal,
    Raw,
}

/// What kind of object a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleType {
    Tty,
    File,
    Pipe,
    Tcp,
    Udp,
    Unknown,
}

/// A stream over one of the process's standard descriptors.
///
/// Closing the handle restores the terminal mode it found.
#[derive(Clone)]
pub struct TtyHandle {
    pub(crate) stream: Rc<Stream>,
    fd: RawFd,
    saved: Rc<RefCell<Option<Termios>>>,
}

impl TtyHandle {
    /// Opens descriptor 0, 1 or 2.
    ///
    /// # Errors
    ///
    /// `EINVAL` for any other descriptor.
    pub fn new(ctx: &ReactorContext, token: CapabilityToken, fd: RawFd) -> Result<Self> {
        ctx.ensure_running("tty")?;
        let (reader, writer): (Option<BoxRead>, Option<BoxWrite>) = match fd {
            0 => (Some(Box::new(tokio::io::stdin())), None),
            1 => (None, Some(Box::new(tokio::io::stdout()))),
            2 => (None, Some(Box::new(tokio::io::stderr()))),
            _ => return Err(NativeError::invalid().into()),
        };
        let stream = Stream::new(ctx, HandleKind::Terminal, token)?;
        let size = ctx.config().read_buffer_size;
        stream.adopt(Box::new(StreamIo::from_parts(reader, writer, size).with_fd(fd)));
        let handle = Self {
            stream,
            fd,
            saved: Rc::new(RefCell::new(None)),
        };
        ctx.registry().insert(AnyHandle::Tty(handle.clone()));
        Ok(handle)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Switches the terminal between cooked and raw mode. The mode in effect
    /// before the first switch is restored on close.
    pub fn set_mode(&self, mode: TtyMode) -> Result<()> {
        self.stream.core.ensure_open()?;
        let fd = stdio_fd(self.fd);
        let mut saved = self.saved.borrow_mut();
        match mode {
            TtyMode::Raw => {
                let current = termios::tcgetattr(fd).map_err(NativeError::from)?;
                let mut raw = current.clone();
                termios::cfmakeraw(&mut raw);
                termios::tcsetattr(fd, SetArg::TCSADRAIN, &raw).map_err(NativeError::from)?;
                if saved.is_none() {
                    *saved = Some(current);
                }
            }
            TtyMode::Normal => {
                if let Some(original) = saved.as_ref() {
                    termios::tcsetattr(fd, SetArg::TCSADRAIN, original)
                        .map_err(NativeError::from)?;
                }
            }
        }
        debug!(handle = %self.stream.core.id(), ?mode, "tty mode set");
        Ok(())
    }

    /// Terminal size as `(columns, rows)`.
    pub fn window_size(&self) -> Result<(u16, u16)> {
        self.stream.core.ensure_open()?;
        // SAFETY: `winsize` is plain old data, and TIOCGWINSZ fills it in.
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCGWINSZ, &mut ws) };
        if rc != 0 {
            return Err(NativeError::last_os_error().into());
        }
        Ok((ws.ws_col, ws.ws_row))
    }

    fn restore_mode(&self) {
        let Some(original) = self.saved.borrow_mut().take() else {
            return;
        };
        if let Err(err) = termios::tcsetattr(stdio_fd(self.fd), SetArg::TCSADRAIN, &original) {
            warn!(fd = self.fd, error = %err, "failed to restore terminal mode");
        }
    }
}

impl Handle for TtyHandle {
    fn id(&self) -> HandleId {
        self.stream.core.id()
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Terminal
    }

    fn state(&self) -> HandleState {
        self.stream.core.state()
    }

    fn token(&self) -> CapabilityToken {
        self.stream.core.token()
    }

    fn close_with(&self, on_close: Completion<()>) {
        if !self.stream.core.is_closing() {
            self.restore_mode();
        }
        self.stream.close(on_close);
    }

    fn ref_handle(&self) {
        self.stream.core.set_ref(true)
    }

    fn unref(&self) {
        self.stream.core.set_ref(false)
    }

    fn has_ref(&self) -> bool {
        self.stream.core.has_ref()
    }

    fn is_active(&self) -> bool {
        self.stream.core.is_active()
    }
}

impl_stream_io!(TtyHandle);

fn stdio_fd(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: only 0, 1 and 2 reach here, and the standard descriptors stay
    // open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub fn is_tty(fd: RawFd) -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(fd) == 1 }
}

/// Classifies `fd` without taking ownership of it.
pub fn guess_handle_type(fd: RawFd) -> HandleType {
    if fd < 0 {
        return HandleType::Unknown;
    }
    // SAFETY: `stat` is plain old data, and fstat writes only into `st`.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return HandleType::Unknown;
    }
    match st.st_mode & libc::S_IFMT {
        libc::S_IFREG => HandleType::File,
        libc::S_IFCHR if is_tty(fd) => HandleType::Tty,
        libc::S_IFCHR => HandleType::File,
        libc::S_IFIFO => HandleType::Pipe,
        libc::S_IFSOCK => guess_socket_type(fd),
        _ => HandleType::Unknown,
    }
}

fn guess_socket_type(fd: RawFd) -> HandleType {
    let mut sock_type: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `len` matches the size of `sock_type`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut sock_type as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return HandleType::Unknown;
    }

    // SAFETY: `addr_len` is the size of `addr`, which outlives the call.
    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut addr_len) };
    if rc != 0 {
        return HandleType::Unknown;
    }

    let family = libc::c_int::from(addr.ss_family);
    let inet = family == libc::AF_INET || family == libc::AF_INET6;
    match sock_type {
        libc::SOCK_STREAM if inet => HandleType::Tcp,
        libc::SOCK_STREAM if family == libc::AF_UNIX => HandleType::Pipe,
        libc::SOCK_DGRAM if inet => HandleType::Udp,
        _ => HandleType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::reactor::Reactor;

    #[test]
    fn classifies_descriptors() {
        let file = std::fs::File::open("/dev/null").unwrap();
        assert_eq!(guess_handle_type(file.as_raw_fd()), HandleType::File);

        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert_eq!(guess_handle_type(a.as_raw_fd()), HandleType::Pipe);

        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert_eq!(guess_handle_type(tcp.as_raw_fd()), HandleType::Tcp);

        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        assert_eq!(guess_handle_type(udp.as_raw_fd()), HandleType::Udp);

        assert_eq!(guess_handle_type(-1), HandleType::Unknown);
        assert!(!is_tty(file.as_raw_fd()));
    }

    #[test]
    fn only_standard_descriptors() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|ctx| {
                let err = TtyHandle::new(ctx, CapabilityToken::all(), 7).err().unwrap();
                assert_eq!(err.code(), Some("EINVAL"));

                let out = TtyHandle::new(ctx, CapabilityToken::all(), 1).unwrap();
                assert_eq!(out.kind(), HandleKind::Terminal);
                assert_eq!(out.state(), HandleState::Connected);
                out.close_with(Completion::discard());
            })
            .unwrap();
    }
}
