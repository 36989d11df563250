//! Tokio-backed stream native.
//!
//! A [`StreamIo`] splits its stream into a read half, driven by a task that
//! is gated on and off by `start_reading`/`stop_reading`, and a write half,
//! driven by a task that performs queued writes strictly one after another.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::trace;

use super::{EventSink, StreamEvent, StreamNative};
use crate::error::NativeError;
use crate::handle::ReadEvent;

pub type BoxRead = Box<dyn AsyncRead + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Unpin>;

enum WriteOp {
    Write { seq: u64, payload: Bytes },
    Shutdown,
}

/// A connected stream (TCP, Unix socket, stdio or child pipe).
pub struct StreamIo {
    reader: Option<BoxRead>,
    writer: Option<BoxWrite>,
    fd: Option<RawFd>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    buffer_size: usize,
    gate: Option<watch::Sender<bool>>,
    writes: Option<mpsc::UnboundedSender<WriteOp>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamIo {
    /// Either half may be absent (e.g. a child's stdin is write-only).
    pub fn from_parts(reader: Option<BoxRead>, writer: Option<BoxWrite>, buffer_size: usize) -> Self {
        Self {
            reader,
            writer,
            fd: None,
            local: None,
            peer: None,
            buffer_size,
            gate: None,
            writes: None,
            tasks: Vec::new(),
        }
    }

    pub fn tcp(stream: TcpStream, buffer_size: usize) -> Self {
        let fd = stream.as_raw_fd();
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        let mut io = Self::from_parts(Some(Box::new(read)), Some(Box::new(write)), buffer_size);
        io.fd = Some(fd);
        io.local = local;
        io.peer = peer;
        io
    }

    pub fn unix(stream: UnixStream, buffer_size: usize) -> Self {
        let fd = stream.as_raw_fd();
        let (read, write) = stream.into_split();
        Self::from_parts(Some(Box::new(read)), Some(Box::new(write)), buffer_size).with_fd(fd)
    }

    /// Records the descriptor used for socket options.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    fn socket_fd(&self) -> Result<RawFd, NativeError> {
        self.fd.ok_or_else(|| NativeError::from_code("ENOTSUP"))
    }
}

impl StreamNative for StreamIo {
    fn attach(&mut self, sink: EventSink<StreamEvent>) {
        if let Some(reader) = self.reader.take() {
            let (gate, gate_rx) = watch::channel(false);
            self.gate = Some(gate);
            let sink = sink.clone();
            let size = self.buffer_size;
            self.tasks
                .push(tokio::task::spawn_local(read_loop(reader, gate_rx, sink, size)));
        }
        if let Some(writer) = self.writer.take() {
            let (tx, rx) = mpsc::unbounded_channel();
            self.writes = Some(tx);
            self.tasks
                .push(tokio::task::spawn_local(write_loop(writer, rx, sink)));
        }
    }

    fn start_reading(&mut self) -> Result<(), NativeError> {
        match &self.gate {
            Some(gate) => {
                gate.send_replace(true);
                Ok(())
            }
            None => Err(NativeError::from_code("ENOTSUP")),
        }
    }

    fn stop_reading(&mut self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(false);
        }
    }

    fn submit_write(&mut self, seq: u64, payload: Bytes) -> Result<(), NativeError> {
        let writes = self.writes.as_ref().ok_or_else(NativeError::bad_descriptor)?;
        writes
            .send(WriteOp::Write { seq, payload })
            .map_err(|_| NativeError::broken_pipe())
    }

    fn submit_shutdown(&mut self) -> Result<(), NativeError> {
        let writes = self.writes.as_ref().ok_or_else(NativeError::bad_descriptor)?;
        writes
            .send(WriteOp::Shutdown)
            .map_err(|_| NativeError::broken_pipe())
    }

    fn close(&mut self) {
        self.gate = None;
        self.writes = None;
        self.reader = None;
        self.writer = None;
        self.fd = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn set_no_delay(&mut self, enable: bool) -> Result<(), NativeError> {
        let fd = self.socket_fd()?;
        set_int_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
    }

    fn set_keep_alive(&mut self, enable: bool, delay_secs: u32) -> Result<(), NativeError> {
        let fd = self.socket_fd()?;
        set_int_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as libc::c_int)?;
        if enable && delay_secs > 0 {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let idle = libc::TCP_KEEPIDLE;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let idle = libc::TCP_KEEPALIVE;
            set_int_option(fd, libc::IPPROTO_TCP, idle, delay_secs as libc::c_int)?;
        }
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, NativeError> {
        self.local.ok_or_else(|| NativeError::from_code("ENOTSUP"))
    }

    fn peer_addr(&self) -> Result<SocketAddr, NativeError> {
        self.peer.ok_or_else(NativeError::not_connected)
    }
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_int_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> Result<(), NativeError> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(NativeError::last_os_error())
    }
}

async fn read_loop(
    mut reader: BoxRead,
    mut gate: watch::Receiver<bool>,
    sink: EventSink<StreamEvent>,
    size: usize,
) {
    let mut buf = BytesMut::new();
    loop {
        if !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                return;
            }
            continue;
        }
        buf.reserve(size);
        tokio::select! {
            changed = gate.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => {
                    sink.post(StreamEvent::Read(ReadEvent::Eof));
                    return;
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    sink.post(StreamEvent::Read(ReadEvent::Data(buf.split().freeze())));
                }
                Err(err) => {
                    sink.post(StreamEvent::Read(ReadEvent::Error(err.into())));
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: BoxWrite,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    sink: EventSink<StreamEvent>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Write { seq, payload } => {
                let status = match writer.write_all(&payload).await {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                };
                sink.post(StreamEvent::WriteDone {
                    seq,
                    status: status.map_err(NativeError::from),
                });
            }
            WriteOp::Shutdown => {
                let status = writer.shutdown().await.map_err(NativeError::from);
                sink.post(StreamEvent::ShutdownDone(status));
            }
        }
    }
}
