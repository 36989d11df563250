//! Tokio-backed listeners.
//!
//! Each accepted connection is wrapped in a [`StreamIo`] and posted as
//! [`StreamEvent::Incoming`]; accept errors are posted the same way so the
//! handle can report them through `on_connection`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EventSink, ListenerNative, StreamEvent, StreamIo};
use crate::error::NativeError;

/// Pause after a failed accept so descriptor exhaustion does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub struct TcpAcceptor {
    listener: Option<TcpListener>,
    local: Option<SocketAddr>,
    buffer_size: usize,
    task: Option<JoinHandle<()>>,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener, buffer_size: usize) -> Self {
        Self {
            local: listener.local_addr().ok(),
            listener: Some(listener),
            buffer_size,
            task: None,
        }
    }
}

impl ListenerNative for TcpAcceptor {
    fn start(&mut self, sink: EventSink<StreamEvent>) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let size = self.buffer_size;
        self.task = Some(tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        sink.post(StreamEvent::Incoming(Ok(Box::new(StreamIo::tcp(stream, size)))));
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                        sink.post(StreamEvent::Incoming(Err(err.into())));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }));
    }

    fn close(&mut self) {
        self.listener = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, NativeError> {
        self.local.ok_or_else(NativeError::invalid)
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct UnixAcceptor {
    listener: Option<UnixListener>,
    buffer_size: usize,
    task: Option<JoinHandle<()>>,
}

impl UnixAcceptor {
    pub fn new(listener: UnixListener, buffer_size: usize) -> Self {
        Self {
            listener: Some(listener),
            buffer_size,
            task: None,
        }
    }
}

impl ListenerNative for UnixAcceptor {
    fn start(&mut self, sink: EventSink<StreamEvent>) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let size = self.buffer_size;
        self.task = Some(tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        debug!("pipe connection accepted");
                        sink.post(StreamEvent::Incoming(Ok(Box::new(StreamIo::unix(stream, size)))));
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept pipe connection");
                        sink.post(StreamEvent::Incoming(Err(err.into())));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }));
    }

    fn close(&mut self) {
        self.listener = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}
