//! The seam between handles and the OS.
//!
//! Handles never touch sockets or descriptors directly. They drive a boxed
//! [`StreamNative`] or [`ListenerNative`] and receive completions as events
//! posted through an [`EventSink`]. The tokio-backed implementations live in
//! [`io`] and [`listener`]; tests substitute a scripted double.

use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::error::NativeError;
use crate::handle::{ReadEvent, Status};
use crate::reactor::ReactorContext;

pub mod io;
pub mod listener;

#[cfg(test)]
pub(crate) mod fake;

pub use io::StreamIo;
pub use listener::{TcpAcceptor, UnixAcceptor};

/// Receives events posted for it. Implemented by handle internals.
pub trait Dispatch<E> {
    fn dispatch(self: Rc<Self>, event: E);
}

/// Posts events for one target onto the reactor's run queue.
///
/// The target is held weakly; events for a target that no longer exists are
/// dropped.
pub struct EventSink<E> {
    ctx: ReactorContext,
    target: Weak<dyn Dispatch<E>>,
}

impl<E: 'static> EventSink<E> {
    pub fn new(ctx: &ReactorContext, target: Weak<dyn Dispatch<E>>) -> Self {
        Self {
            ctx: ctx.clone(),
            target,
        }
    }

    pub fn post(&self, event: E) {
        let target = self.target.clone();
        self.ctx.post(move || {
            if let Some(target) = target.upgrade() {
                target.dispatch(event);
            }
        });
    }
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            target: self.target.clone(),
        }
    }
}

/// Completions produced by stream natives and listeners.
pub enum StreamEvent {
    Read(ReadEvent),
    WriteDone { seq: u64, status: Status },
    ShutdownDone(Status),
    Connected(Result<Box<dyn StreamNative>, NativeError>),
    Incoming(Result<Box<dyn StreamNative>, NativeError>),
}

impl std::fmt::Debug for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(event) => f.debug_tuple("Read").field(event).finish(),
            Self::WriteDone { seq, status } => f
                .debug_struct("WriteDone")
                .field("seq", seq)
                .field("status", status)
                .finish(),
            Self::ShutdownDone(status) => f.debug_tuple("ShutdownDone").field(status).finish(),
            Self::Connected(res) => f.debug_tuple("Connected").field(&res.is_ok()).finish(),
            Self::Incoming(res) => f.debug_tuple("Incoming").field(&res.is_ok()).finish(),
        }
    }
}

/// A connected byte stream.
///
/// Every submitted write and shutdown produces exactly one completion event,
/// in submission order, unless the native is closed first.
pub trait StreamNative {
    /// Called once, before anything else, with the sink for completions.
    fn attach(&mut self, sink: EventSink<StreamEvent>);

    fn start_reading(&mut self) -> Result<(), NativeError>;

    fn stop_reading(&mut self);

    fn submit_write(&mut self, seq: u64, payload: Bytes) -> Result<(), NativeError>;

    fn submit_shutdown(&mut self) -> Result<(), NativeError>;

    /// Releases the resource. Pending operations produce no further events.
    fn close(&mut self);

    fn set_no_delay(&mut self, _enable: bool) -> Result<(), NativeError> {
        Err(NativeError::from_code("ENOTSUP"))
    }

    fn set_keep_alive(&mut self, _enable: bool, _delay_secs: u32) -> Result<(), NativeError> {
        Err(NativeError::from_code("ENOTSUP"))
    }

    fn local_addr(&self) -> Result<SocketAddr, NativeError> {
        Err(NativeError::from_code("ENOTSUP"))
    }

    fn peer_addr(&self) -> Result<SocketAddr, NativeError> {
        Err(NativeError::from_code("ENOTSUP"))
    }
}

/// A listening endpoint that produces [`StreamEvent::Incoming`].
pub trait ListenerNative {
    fn start(&mut self, sink: EventSink<StreamEvent>);

    fn close(&mut self);

    fn local_addr(&self) -> Result<SocketAddr, NativeError> {
        Err(NativeError::from_code("ENOTSUP"))
    }
}
