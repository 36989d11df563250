//! TCP stream and listener handles.

use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::TcpSocket;
use tracing::debug;

use super::stream::{Endpoint, Stream};
use super::{AnyHandle, Completion, HandleKind, Listener, Pending, Status};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::{ListenerNative, StreamIo, StreamNative, TcpAcceptor};
use crate::reactor::ReactorContext;

/// A TCP socket: client stream, accepted stream or listener.
///
/// # Examples
///
/// ```no_run
/// use uvwire::{CapabilityToken, Listener, Reactor, ReactorConfig, TcpHandle, Writable};
///
/// let mut reactor = Reactor::new(ReactorConfig::default())?;
/// reactor.run(|ctx| {
///     let server = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
///     server.bind("127.0.0.1:8080".parse().unwrap()).unwrap();
///     server.on_connection(|conn| {
///         if let Ok(conn) = conn {
///             let _ = conn.as_writable().unwrap().write("hi\n".into());
///         }
///     });
///     server.listen_default().unwrap();
/// })?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct TcpHandle {
    pub(crate) stream: Rc<Stream>,
}

impl TcpHandle {
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        let handle = Self::from_stream(Stream::new(ctx, HandleKind::StreamSocket, token)?);
        ctx.registry().insert(AnyHandle::Tcp(handle.clone()));
        Ok(handle)
    }

    pub(crate) fn from_stream(stream: Rc<Stream>) -> Self {
        Self { stream }
    }

    /// Wraps an already connected native.
    #[cfg(test)]
    pub(crate) fn from_native(
        ctx: &ReactorContext,
        token: CapabilityToken,
        native: Box<dyn StreamNative>,
    ) -> Result<Self> {
        let handle = Self::new(ctx, token)?;
        handle.stream.adopt(native);
        Ok(handle)
    }

    /// Adopts a connected standard-library stream.
    pub fn open(&self, stream: std::net::TcpStream) -> Result<()> {
        self.stream.core.ensure_open()?;
        self.stream.core.ctx().ensure_running("open")?;
        stream.set_nonblocking(true)?;
        let stream = tokio::net::TcpStream::from_std(stream)?;
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream.adopt(Box::new(StreamIo::tcp(stream, size)));
        Ok(())
    }

    /// Adopts a bound standard-library listener; call [`Listener::listen`]
    /// next.
    pub fn open_listener(&self, listener: std::net::TcpListener) -> Result<()> {
        self.stream.bind(Endpoint::TcpListener(listener))
    }

    /// Binds to `addr` with `SO_REUSEADDR` set.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.stream.core.ensure_open()?;
        let socket = new_socket(addr)?;
        socket.bind(addr).map_err(NativeError::from)?;
        debug!(handle = %self.stream.core.id(), %addr, "bound");
        self.stream.bind(Endpoint::Tcp(socket))
    }

    /// Connects to `addr`. `done` fires once, with `ECANCELED` if the handle
    /// is closed first.
    ///
    /// # Errors
    ///
    /// `EALREADY` while a connect is in flight, `EISCONN` once connected.
    pub fn connect_with(&self, addr: SocketAddr, done: Completion<Status>) -> Result<()> {
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream.connect(done, |endpoint| {
            let socket = match endpoint {
                Some(Endpoint::Tcp(socket)) => socket,
                None => new_socket(addr)?,
                Some(_) => return Err(NativeError::invalid()),
            };
            Ok(async move {
                let stream = socket.connect(addr).await?;
                Ok::<_, NativeError>(Box::new(StreamIo::tcp(stream, size)) as Box<dyn StreamNative>)
            })
        })
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<Pending<Status>> {
        let (done, pending) = Completion::channel();
        self.connect_with(addr, done)?;
        Ok(pending)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.with_native(|native| native.peer_addr())
    }

    pub fn set_no_delay(&self, enable: bool) -> Result<()> {
        self.stream.with_native(|native| native.set_no_delay(enable))
    }

    /// Enables keep-alive probes after `delay_secs` of idleness.
    pub fn set_keep_alive(&self, enable: bool, delay_secs: u32) -> Result<()> {
        self.stream.with_native(|native| native.set_keep_alive(enable, delay_secs))
    }
}

fn new_socket(addr: SocketAddr) -> std::result::Result<TcpSocket, NativeError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    Ok(socket)
}

fn make_listener(
    endpoint: Endpoint,
    backlog: u32,
    size: usize,
) -> std::result::Result<Box<dyn ListenerNative>, NativeError> {
    let listener = match endpoint {
        Endpoint::Tcp(socket) => socket.listen(backlog)?,
        Endpoint::TcpListener(listener) => {
            listener.set_nonblocking(true)?;
            tokio::net::TcpListener::from_std(listener)?
        }
        Endpoint::Unix(_) => return Err(NativeError::invalid()),
    };
    Ok(Box::new(TcpAcceptor::new(listener, size)))
}

impl_handle!(TcpHandle, stream);
impl_stream_io!(TcpHandle);

impl Listener for TcpHandle {
    fn listen(&self, backlog: u32) -> Result<()> {
        let size = self.stream.core.ctx().config().read_buffer_size;
        self.stream
            .listen(|endpoint| make_listener(endpoint, backlog, size))
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

    use super::*;
    use crate::capability::Capability;
    use crate::config::ReactorConfig;
    use crate::error::{Error, UsageError};
    use crate::handle::{Handle, HandleState, Readable};
    use crate::native::fake::FakeListener;
    use crate::reactor::Reactor;

    fn listening(ctx: &ReactorContext, token: CapabilityToken) -> (TcpHandle, crate::native::fake::ListenerControl) {
        let server = TcpHandle::new(ctx, token).unwrap();
        server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let (fake, control) = FakeListener::new();
        server
            .stream
            .listen(move |_| Ok(Box::new(fake) as Box<dyn ListenerNative>))
            .unwrap();
        (server, control)
    }

    #[test]
    fn accepted_stream_inherits_token_and_reads() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let accepted = Rc::new(RefCell::new(Vec::new()));
        let seen = accepted.clone();
        reactor
            .run(move |ctx| {
                let token = CapabilityToken::new([Capability::Handle]);
                let (server, control) = listening(ctx, token);
                assert_eq!(server.state(), HandleState::Listening);
                let server2 = server.clone();
                server.on_connection(move |conn| {
                    let conn = conn.unwrap();
                    let h = conn.as_handle();
                    let reading = conn.as_readable().unwrap().is_reading();
                    seen.borrow_mut().push((h.state(), h.token(), reading));
                    h.close_with(Completion::discard());
                    server2.close_with(Completion::discard());
                });
                let child = control.push_connection();
                let child2 = child.clone();
                ctx.post(move || assert_eq!(child2.state.borrow().read_starts, 1));
            })
            .unwrap();
        let token = CapabilityToken::new([Capability::Handle]);
        assert_eq!(*accepted.borrow(), vec![(HandleState::Connected, token, true)]);
    }

    #[test]
    fn accept_without_handle_grant_is_denied() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let results = Rc::new(RefCell::new(Vec::new()));
        let seen = results.clone();
        let closed = Rc::new(RefCell::new(None));
        let closed_seen = closed.clone();
        reactor
            .run(move |ctx| {
                let (server, control) = listening(ctx, CapabilityToken::empty());
                let server2 = server.clone();
                server.on_connection(move |conn| {
                    seen.borrow_mut().push(matches!(conn, Err(Error::Permission(_))));
                    server2.close_with(Completion::discard());
                });
                let child = control.push_connection();
                let ctx2 = ctx.clone();
                ctx.post(move || {
                    *closed_seen.borrow_mut() = Some((child.state.borrow().closed, ctx2.handles().len()));
                });
            })
            .unwrap();
        assert_eq!(*results.borrow(), vec![true]);
        // The denied native was closed and never became a handle.
        assert_eq!(*closed.borrow(), Some((true, 1)));
    }

    #[test]
    fn accept_error_is_reported() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let codes = Rc::new(RefCell::new(Vec::new()));
        let seen = codes.clone();
        reactor
            .run(move |ctx| {
                let (server, control) = listening(ctx, CapabilityToken::all());
                let server2 = server.clone();
                server.on_connection(move |conn| {
                    seen.borrow_mut().push(conn.unwrap_err().code());
                    server2.close_with(Completion::discard());
                });
                control.push(Err(NativeError::from_code("EMFILE")));
            })
            .unwrap();
        assert_eq!(*codes.borrow(), vec![Some("EMFILE")]);
    }

    #[test]
    fn read_start_on_listener_is_enotconn() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|ctx| {
                let (server, control) = listening(ctx, CapabilityToken::all());
                assert_eq!(server.read_start().unwrap_err().code(), Some("ENOTCONN"));
                let _ = server.close();
                let closed = control.closed.clone();
                ctx.post(move || assert!(*closed.borrow()));
            })
            .unwrap();
    }

    #[test]
    fn second_connect_is_ealready() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let status = Rc::new(RefCell::new(None));
        let seen = status.clone();
        reactor
            .run(move |ctx| {
                let client = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
                // The connect task is aborted by the close before it is polled.
                let addr: SocketAddr = "192.0.2.1:9".parse().unwrap();
                client
                    .connect_with(
                        addr,
                        Completion::new(move |s: Status| {
                            *seen.borrow_mut() = Some(s.map_err(|e| e.code));
                        }),
                    )
                    .unwrap();
                assert_eq!(client.state(), HandleState::Connecting);
                let err = client.connect(addr).unwrap_err();
                assert_eq!(err.code(), Some("EALREADY"));
                let _ = client.close();
            })
            .unwrap();
        assert_eq!(*status.borrow(), Some(Err("ECANCELED")));
    }

    #[test]
    fn native_work_before_run_is_a_usage_error() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let ctx = reactor.context();

        let client = TcpHandle::new(&ctx, CapabilityToken::all()).unwrap();
        let err = client.connect("127.0.0.1:9".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::NotOnReactor { op: "connect" })));
        assert_eq!(client.state(), HandleState::Created);

        let server = TcpHandle::new(&ctx, CapabilityToken::all()).unwrap();
        server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let err = server.listen(16).unwrap_err();
        assert!(matches!(err, Error::Usage(UsageError::NotOnReactor { op: "listen" })));
        assert_eq!(server.state(), HandleState::Bound);

        // The same handles work once the loop is running.
        let listening = Rc::new(RefCell::new(None));
        let seen = listening.clone();
        reactor
            .run(move |_| {
                server.listen(16).unwrap();
                *seen.borrow_mut() = Some(server.state());
                server.close_with(Completion::discard());
                client.close_with(Completion::discard());
            })
            .unwrap();
        assert_eq!(*listening.borrow(), Some(HandleState::Listening));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_listen_poisons_handle() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|ctx| {
                let first = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
                first.bind("127.0.0.1:0".parse().unwrap()).unwrap();
                let addr = first.local_addr().unwrap();
                let second = TcpHandle::new(ctx, CapabilityToken::all()).unwrap();
                second.bind(addr).unwrap();
                first.listen(16).unwrap();

                let err = second.listen(16).unwrap_err();
                assert_eq!(err.code(), Some("EADDRINUSE"));
                assert_eq!(second.read_start().unwrap_err().code(), Some("EBADF"));
                assert_eq!(second.listen(16).unwrap_err().code(), Some("EBADF"));

                first.close_with(Completion::discard());
                second.close_with(Completion::discard());
            })
            .unwrap();
    }
}
