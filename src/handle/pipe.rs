//! Unix domain socket and child stdio handles.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::stream::{Endpoint, Stream};
use super::{AnyHandle, Completion, HandleKind, HandleState, Listener, Pending, Status};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::io::{BoxRead, BoxWrite};
use crate::native::{ListenerNative, StreamIo, StreamNative, UnixAcceptor};
use crate::reactor::ReactorContext;

/// A local stream: a Unix domain socket, or one end of a child process's
/// stdio.
#[derive(Clone)]
pub struct PipeHandle {
    pub(crate) stream: Rc<Stream>,
}

impl PipeHandle {
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        let handle = Self::from_stream(Stream::new(ctx, HandleKind::Pipe, token)?);
        ctx.registry().insert(AnyHandle::Pipe(handle.clone()));
        Ok(handle)
    }

    pub(crate) fn from_stream(stream: Rc<Stream>) -> Self {
        Self { stream }
    }

    /// Binds a listening socket at `path`.
    pub fn bind(&self, path: impl AsRef<Path>) -> Result<()> {
        self.stream.core.ensure_open()?;
        let path = path.as_ref();
        let listener = std::os::unix::net::UnixListener::bind(path)
            .map_err(|err| NativeError::from(err).with_path(path.display().to_string()))?;
        debug!(handle = %self.stream.core.id(), path = %path.display(), "bound");
        self.stream.bind(Endpoint::Unix(listener))
    }

    pub fn connect_with(&self, path: impl Into<PathBuf>, done: Completion<Status>) -> Result<()> {
        let path = path.into();
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream.connect(done, |endpoint| {
            if endpoint.is_some() {
                return Err(NativeError::invalid());
            }
            Ok(async move {
                let stream = UnixStream::connect(&path)
                    .await
                    .map_err(|err| NativeError::from(err).with_path(path.display().to_string()))?;
                Ok::<_, NativeError>(Box::new(StreamIo::unix(stream, size)) as Box<dyn StreamNative>)
            })
        })
    }

    pub fn connect(&self, path: impl Into<PathBuf>) -> Result<Pending<Status>> {
        let (done, pending) = Completion::channel();
        self.connect_with(path, done)?;
        Ok(pending)
    }

    /// Adopts a connected standard-library socket.
    pub fn open(&self, stream: std::os::unix::net::UnixStream) -> Result<()> {
        self.stream.core.ensure_open()?;
        self.stream.core.ctx().ensure_running("open")?;
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream.adopt(Box::new(StreamIo::unix(stream, size)));
        Ok(())
    }

    /// `EINVAL` unless this is a fresh, unconnected pipe.
    pub(crate) fn ensure_attachable(&self) -> Result<()> {
        self.stream.core.ensure_open()?;
        if self.stream.core.state() != HandleState::Created {
            return Err(NativeError::invalid().into());
        }
        Ok(())
    }

    /// Attaches the parent's ends of a child's stdio stream.
    pub(crate) fn attach_child(&self, reader: Option<BoxRead>, writer: Option<BoxWrite>) -> Result<()> {
        self.ensure_attachable()?;
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream
            .adopt(Box::new(StreamIo::from_parts(reader, writer, size)));
        Ok(())
    }
}

impl_handle!(PipeHandle, stream);
impl_stream_io!(PipeHandle);

impl Listener for PipeHandle {
    /// Unix sockets listen with the system default backlog; `backlog` is
    /// ignored.
    fn listen(&self, _backlog: u32) -> Result<()> {
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream.listen(|endpoint| {
            let Endpoint::Unix(listener) = endpoint else {
                return Err(NativeError::invalid());
            };
            listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(listener)?;
            Ok(Box::new(UnixAcceptor::new(listener, size)) as Box<dyn ListenerNative>)
        })
    }

    fn listen_default(&self) -> Result<()> {
        self.listen(self.stream.core.ctx().config().default_backlog)
    }

    fn set_on_connection(&self, callback: Box<dyn FnMut(Result<AnyHandle>)>) {
        self.stream.on_connection.set(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::handle::{Handle, ReadEvent, Readable, Writable};
    use crate::reactor::Reactor;

    fn socket_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("uvwire-{}-{name}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn echo_over_unix_socket() {
        let path = socket_path("echo");
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let seen = received.clone();
        let server_path = path.clone();
        reactor
            .run(move |ctx| {
                let server = PipeHandle::new(ctx, CapabilityToken::all()).unwrap();
                server.bind(&server_path).unwrap();
                server.on_connection(|conn| {
                    let conn = conn.unwrap().into_pipe().unwrap();
                    let writer = conn.clone();
                    conn.on_read(move |event| match event {
                        ReadEvent::Data(data) => {
                            let _ = writer.write(data);
                        }
                        _ => writer.close_with(Completion::discard()),
                    });
                });
                server.listen_default().unwrap();

                let client = PipeHandle::new(ctx, CapabilityToken::all()).unwrap();
                let reader = client.clone();
                client
                    .connect_with(
                        server_path.clone(),
                        Completion::new(move |status: Status| {
                            status.unwrap();
                            let server = server.clone();
                            let closer = reader.clone();
                            reader.on_read(move |event| {
                                if let ReadEvent::Data(data) = event {
                                    seen.borrow_mut().extend_from_slice(&data);
                                    closer.close_with(Completion::discard());
                                    server.close_with(Completion::discard());
                                }
                            });
                            reader.read_start().unwrap();
                            let _ = reader.write(Bytes::from_static(b"ping")).unwrap();
                        }),
                    )
                    .unwrap();
            })
            .unwrap();
        assert_eq!(&received.borrow()[..], b"ping");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let path = socket_path("missing");
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let code = Rc::new(RefCell::new(None));
        let seen = code.clone();
        reactor
            .run(move |ctx| {
                let client = PipeHandle::new(ctx, CapabilityToken::all()).unwrap();
                let closer = client.clone();
                client
                    .connect_with(
                        path,
                        Completion::new(move |status: Status| {
                            *seen.borrow_mut() = status.err().map(|e| e.code);
                            assert_eq!(closer.state(), HandleState::Created);
                            closer.close_with(Completion::discard());
                        }),
                    )
                    .unwrap();
            })
            .unwrap();
        assert_eq!(*code.borrow(), Some("ENOENT"));
    }
}
