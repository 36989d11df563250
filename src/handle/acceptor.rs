//! Turns incoming connections into handles.

use std::rc::Rc;

use tracing::{debug, warn};

use super::pipe::PipeHandle;
use super::stream::Stream;
use super::tcp::TcpHandle;
use super::{AnyHandle, HandleKind};
use crate::error::{Error, NativeError};
use crate::native::StreamNative;

/// Wraps an accepted native in a handle of the listener's kind and hands it
/// to the listener's connection callback.
///
/// The child inherits the listener's token, is registered with the reactor
/// and is already reading when the callback sees it. Without a callback the
/// connection is closed on the spot.
pub(crate) fn accept(
    listener: &Rc<Stream>,
    incoming: Result<Box<dyn StreamNative>, NativeError>,
) {
    let mut native = match incoming {
        Ok(native) => native,
        Err(err) => {
            debug!(listener = %listener.core.id(), code = err.code, "accept failed");
            deliver(listener, Err(err.into()));
            return;
        }
    };

    let ctx = listener.core.ctx();
    let token = listener.core.token();
    if let Err(denied) = ctx.gate().authorize_accept(&token) {
        native.close();
        deliver(listener, Err(denied.into()));
        return;
    }

    let kind = listener.core.kind();
    let child = match Stream::new(ctx, kind, token) {
        Ok(child) => child,
        Err(denied) => {
            native.close();
            deliver(listener, Err(denied.into()));
            return;
        }
    };
    child.adopt(native);

    let handle = match kind {
        HandleKind::Pipe => AnyHandle::Pipe(PipeHandle::from_stream(child)),
        _ => AnyHandle::Tcp(TcpHandle::from_stream(child)),
    };
    ctx.registry().insert(handle.clone());
    if let Some(readable) = handle.as_readable() {
        if let Err(err) = readable.read_start() {
            warn!(handle = %handle.as_handle().id(), error = %err, "accepted stream failed to start reading");
        }
    }
    debug!(listener = %listener.core.id(), handle = %handle.as_handle().id(), "connection accepted");

    if !listener.on_connection.is_set() {
        warn!(listener = %listener.core.id(), "no connection callback; closing accepted stream");
        handle.as_handle().close_with(super::Completion::discard());
        return;
    }
    deliver(listener, Ok(handle));
}

fn deliver(listener: &Rc<Stream>, result: Result<AnyHandle, Error>) {
    let delivered = listener.on_connection.with(|callback| callback(result));
    if delivered.is_none() {
        debug!(listener = %listener.core.id(), "connection event without callback dropped");
    }
}
