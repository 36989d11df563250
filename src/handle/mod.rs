//! Handles: the uniform face of every native resource.
//!
//! A handle exclusively owns one native resource and walks the lifecycle
//!
//! ```text
//! Created → Bound → Listening                 (servers)
//! Created → Connecting → Connected            (clients)
//!                                  → Closing → Closed
//! ```
//!
//! Every handle implements [`Handle`]; stream-like transports add
//! [`Readable`], [`Writable`] and, for servers, [`Listener`]. Completions are
//! single-fire ([`Completion`]) and are always delivered from the reactor's
//! run queue, never from inside the call that started the operation.
//!
//! Once a handle is closing or closed every operation except `close` fails
//! with `EBADF` without touching the native layer. `close` itself is
//! idempotent: the first call's completion fires exactly once, after reads
//! are stopped and every pending write has completed with `ECANCELED`.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::reactor::HandleId;

/// Implements [`Handle`] for a wrapper whose `$field` is an `Rc` to an inner
/// type with a `core: HandleCore` field and a `close` method.
macro_rules! impl_handle {
    ($ty:ty, $field:ident) => {
        impl $crate::handle::Handle for $ty {
            fn id(&self) -> $crate::reactor::HandleId {
                self.$field.core.id()
            }

            fn kind(&self) -> $crate::handle::HandleKind {
                self.$field.core.kind()
            }

            fn state(&self) -> $crate::handle::HandleState {
                self.$field.core.state()
            }

            fn token(&self) -> $crate::capability::CapabilityToken {
                self.$field.core.token()
            }

            fn close_with(&self, on_close: $crate::handle::Completion<()>) {
                self.$field.close(on_close)
            }

            fn ref_handle(&self) {
                self.$field.core.set_ref(true)
            }

            fn unref(&self) {
                self.$field.core.set_ref(false)
            }

            fn has_ref(&self) -> bool {
                self.$field.core.has_ref()
            }

            fn is_active(&self) -> bool {
                self.$field.core.is_active()
            }
        }
    };
}

/// Implements [`Readable`] and [`Writable`] by delegating to a `stream`
/// field of type `Rc<Stream>`.
macro_rules! impl_stream_io {
    ($ty:ty) => {
        impl $crate::handle::Readable for $ty {
            fn read_start(&self) -> $crate::error::Result<()> {
                self.stream.read_start()
            }

            fn read_stop(&self) -> $crate::error::Result<()> {
                self.stream.read_stop()
            }

            fn is_reading(&self) -> bool {
                self.stream.is_reading()
            }

            fn set_on_read(&self, callback: Box<dyn FnMut($crate::handle::ReadEvent)>) {
                self.stream.set_on_read(callback)
            }
        }

        impl $crate::handle::Writable for $ty {
            fn write_with(
                &self,
                payload: bytes::Bytes,
                done: $crate::handle::Completion<$crate::handle::Status>,
            ) -> $crate::error::Result<$crate::handle::WriteTicket> {
                self.stream.write_with(payload, done)
            }

            fn shutdown_with(
                &self,
                done: $crate::handle::Completion<$crate::handle::Status>,
            ) -> $crate::error::Result<()> {
                self.stream.shutdown_with(done)
            }

            fn write_queue_size(&self) -> usize {
                self.stream.write_queue_size()
            }
        }
    };
}

mod acceptor;
mod completion;
pub(crate) mod core;
pub mod pipe;
pub mod process;
pub mod signal;
pub(crate) mod stream;
pub mod tcp;
pub mod timer;
pub mod tty;
pub mod udp;
pub(crate) mod write_queue;

pub use completion::{Completion, Pending, Status, WriteRequest, WriteTicket};
pub use pipe::PipeHandle;
pub use process::{ExitStatus, ProcessHandle, ProcessOptions, StdioOption};
pub use signal::{SignalHandle, signal_name};
pub use tcp::TcpHandle;
pub use timer::TimerHandle;
pub use tty::{HandleType, TtyHandle, TtyMode, guess_handle_type, is_tty};
pub use udp::{Datagram, UdpHandle};

/// Which transport a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandleKind {
    StreamSocket,
    DatagramSocket,
    Pipe,
    Terminal,
    Timer,
    Signal,
    Process,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamSocket => "tcp",
            Self::DatagramSocket => "udp",
            Self::Pipe => "pipe",
            Self::Terminal => "tty",
            Self::Timer => "timer",
            Self::Signal => "signal",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandleState {
    Created,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// One delivery from a read loop. `Eof` and `Error` are terminal: reading
/// stops and is not restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Data(Bytes),
    Eof,
    Error(NativeError),
}

impl ReadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

/// String encodings accepted by [`Writable::write_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// One byte per UTF-16 code unit, high bits dropped.
    Ascii,
    /// UTF-16 little endian.
    Ucs2,
}

impl Encoding {
    pub fn encode(self, s: &str) -> Bytes {
        match self {
            Self::Utf8 => Bytes::copy_from_slice(s.as_bytes()),
            Self::Ascii => s.encode_utf16().map(|unit| unit as u8).collect(),
            Self::Ucs2 => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        }
    }
}

/// Operations shared by every handle.
pub trait Handle {
    fn id(&self) -> HandleId;

    fn kind(&self) -> HandleKind;

    fn state(&self) -> HandleState;

    /// The token captured at construction.
    fn token(&self) -> CapabilityToken;

    /// Starts closing. Only the first call's completion fires.
    fn close_with(&self, on_close: Completion<()>);

    /// Like [`close_with`](Self::close_with), returning a future for the
    /// completion. A repeated close resolves to `None`.
    fn close(&self) -> Pending<()> {
        let (done, pending) = Completion::channel();
        self.close_with(done);
        pending
    }

    /// Lets an active handle keep the reactor alive (the default).
    fn ref_handle(&self);

    /// Stops an active handle from keeping the reactor alive.
    fn unref(&self);

    fn has_ref(&self) -> bool;

    /// Reading, listening, running, or with requests in flight.
    fn is_active(&self) -> bool;

    fn is_closing(&self) -> bool {
        matches!(self.state(), HandleState::Closing | HandleState::Closed)
    }
}

/// Handles with a read loop.
pub trait Readable: Handle {
    /// Idempotent. A no-op on a stream that is not connected; `ENOTCONN` on a
    /// listening stream.
    fn read_start(&self) -> Result<()>;

    fn read_stop(&self) -> Result<()>;

    fn is_reading(&self) -> bool;

    fn set_on_read(&self, callback: Box<dyn FnMut(ReadEvent)>);

    fn on_read<F>(&self, callback: F)
    where
        F: FnMut(ReadEvent) + 'static,
        Self: Sized,
    {
        self.set_on_read(Box::new(callback));
    }
}

/// Handles that accept ordered writes.
pub trait Writable: Handle {
    /// Queues `payload`. `done` fires in submission order.
    ///
    /// # Errors
    ///
    /// `EBADF` once closing, `ENOTCONN` before connecting, `EPIPE` after a
    /// shutdown.
    fn write_with(&self, payload: Bytes, done: Completion<Status>) -> Result<WriteTicket>;

    fn write(&self, payload: Bytes) -> Result<WriteRequest> {
        let (done, pending) = Completion::channel();
        let ticket = self.write_with(payload, done)?;
        Ok(WriteRequest::new(ticket, pending))
    }

    /// Encodes `s` and writes it. The only copying write.
    fn write_str(&self, s: &str, encoding: Encoding) -> Result<WriteRequest> {
        self.write(encoding.encode(s))
    }

    /// Half-closes the write side once queued writes have drained.
    fn shutdown_with(&self, done: Completion<Status>) -> Result<()>;

    fn shutdown(&self) -> Result<Pending<Status>> {
        let (done, pending) = Completion::channel();
        self.shutdown_with(done)?;
        Ok(pending)
    }

    /// Bytes queued but not yet completed.
    fn write_queue_size(&self) -> usize;
}

/// Server-side stream handles.
pub trait Listener: Handle {
    /// `Bound → Listening`. A failure leaves the handle unusable.
    fn listen(&self, backlog: u32) -> Result<()>;

    /// Listens with the reactor's configured default backlog.
    fn listen_default(&self) -> Result<()>;

    fn set_on_connection(&self, callback: Box<dyn FnMut(Result<AnyHandle>)>);

    fn on_connection<F>(&self, callback: F)
    where
        F: FnMut(Result<AnyHandle>) + 'static,
        Self: Sized,
    {
        self.set_on_connection(Box::new(callback));
    }
}

/// Any handle, tagged by transport.
#[derive(Clone)]
pub enum AnyHandle {
    Tcp(TcpHandle),
    Pipe(PipeHandle),
    Tty(TtyHandle),
    Udp(UdpHandle),
    Timer(TimerHandle),
    Signal(SignalHandle),
    Process(ProcessHandle),
}

impl AnyHandle {
    pub fn as_handle(&self) -> &dyn Handle {
        match self {
            Self::Tcp(h) => h,
            Self::Pipe(h) => h,
            Self::Tty(h) => h,
            Self::Udp(h) => h,
            Self::Timer(h) => h,
            Self::Signal(h) => h,
            Self::Process(h) => h,
        }
    }

    pub fn as_readable(&self) -> Option<&dyn Readable> {
        match self {
            Self::Tcp(h) => Some(h),
            Self::Pipe(h) => Some(h),
            Self::Tty(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_writable(&self) -> Option<&dyn Writable> {
        match self {
            Self::Tcp(h) => Some(h),
            Self::Pipe(h) => Some(h),
            Self::Tty(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_listener(&self) -> Option<&dyn Listener> {
        match self {
            Self::Tcp(h) => Some(h),
            Self::Pipe(h) => Some(h),
            _ => None,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.as_handle().kind()
    }

    pub fn into_tcp(self) -> Option<TcpHandle> {
        match self {
            Self::Tcp(h) => Some(h),
            _ => None,
        }
    }

    pub fn into_pipe(self) -> Option<PipeHandle> {
        match self {
            Self::Pipe(h) => Some(h),
            _ => None,
        }
    }
}

impl fmt::Debug for AnyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.as_handle();
        f.debug_struct("AnyHandle")
            .field("id", &h.id())
            .field("kind", &h.kind())
            .field("state", &h.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(Encoding::Utf8.encode("é"), Bytes::from_static(&[0xc3, 0xa9]));
        assert_eq!(Encoding::Ascii.encode("é!"), Bytes::from_static(&[0xe9, b'!']));
        assert_eq!(Encoding::Ucs2.encode("hi"), Bytes::from_static(&[b'h', 0, b'i', 0]));
    }

    #[test]
    fn terminal_events() {
        assert!(ReadEvent::Eof.is_terminal());
        assert!(ReadEvent::Error(NativeError::from_code("ECONNRESET")).is_terminal());
        assert!(!ReadEvent::Data(Bytes::new()).is_terminal());
    }
}
