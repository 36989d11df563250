//! UDP handles.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::completion::{Completion, Status, WriteRequest, WriteTicket};
use super::core::{Activity, HandleCore, Slot};
use super::write_queue::WriteQueue;
use super::{AnyHandle, HandleKind, HandleState};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::{Dispatch, EventSink};
use crate::reactor::ReactorContext;

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub from: SocketAddr,
}

type MessageCallback = dyn FnMut(std::result::Result<Datagram, NativeError>);

enum UdpEvent {
    SendDone { seq: u64, status: Status },
    Message(std::result::Result<Datagram, NativeError>),
}

struct Outgoing {
    seq: u64,
    payload: Bytes,
    to: SocketAddr,
}

#[derive(Default)]
struct UdpState {
    socket: Option<Rc<UdpSocket>>,
    sends: Option<mpsc::UnboundedSender<Outgoing>>,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
    writes: WriteQueue,
}

pub(crate) struct UdpInner {
    pub(crate) core: HandleCore,
    state: RefCell<UdpState>,
    on_message: Slot<MessageCallback>,
}

/// A datagram socket.
#[derive(Clone)]
pub struct UdpHandle {
    inner: Rc<UdpInner>,
}

impl UdpHandle {
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        let core = HandleCore::new(ctx, HandleKind::DatagramSocket, token)?;
        let handle = Self {
            inner: Rc::new(UdpInner {
                core,
                state: RefCell::new(UdpState::default()),
                on_message: Slot::new(),
            }),
        };
        ctx.registry().insert(AnyHandle::Udp(handle.clone()));
        Ok(handle)
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.core.ctx().ensure_running("bind")?;
        if self.inner.state.borrow().socket.is_some() {
            return Err(NativeError::invalid().into());
        }
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        self.inner.install(UdpSocket::from_std(socket)?);
        debug!(handle = %self.inner.core.id(), %addr, "bound");
        Ok(())
    }

    /// Sends `payload` to `to`, binding to the unspecified address first if
    /// the socket is unbound. Completions fire in submission order.
    pub fn send(&self, payload: Bytes, to: SocketAddr) -> Result<WriteRequest> {
        let (done, pending) = Completion::channel();
        let ticket = self.send_with(payload, to, done)?;
        Ok(WriteRequest::new(ticket, pending))
    }

    pub fn send_with(&self, payload: Bytes, to: SocketAddr, done: Completion<Status>) -> Result<WriteTicket> {
        self.inner.core.ensure_open()?;
        if self.inner.state.borrow().socket.is_none() {
            let any = match to {
                SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            };
            self.bind(any)?;
        }
        let mut st = self.inner.state.borrow_mut();
        let len = payload.len();
        let seq = st.writes.push(len, done);
        let sent = st
            .sends
            .as_ref()
            .map(|tx| tx.send(Outgoing { seq, payload, to }).is_ok())
            .unwrap_or(false);
        if !sent {
            let refused = st.writes.remove_newest(seq);
            drop(st);
            drop(refused);
            return Err(NativeError::bad_descriptor().into());
        }
        drop(st);
        self.inner.core.add_request();
        Ok(WriteTicket { seq, len })
    }

    /// Starts delivering datagrams to the message callback.
    ///
    /// # Errors
    ///
    /// `EINVAL` if the socket is not bound.
    pub fn recv_start(&self) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.core.ctx().ensure_running("recv_start")?;
        let mut st = self.inner.state.borrow_mut();
        if st.receiver.is_some() {
            return Ok(());
        }
        let socket = st.socket.clone().ok_or_else(NativeError::invalid)?;
        let sink = self.inner.sink();
        let size = self.inner.core.ctx().config().read_buffer_size;
        st.receiver = Some(self.inner.core.ctx().spawn(recv_loop(socket, sink, size)));
        drop(st);
        self.inner.core.set_active(Activity::Reading, true);
        Ok(())
    }

    pub fn recv_stop(&self) -> Result<()> {
        self.inner.core.ensure_open()?;
        if let Some(task) = self.inner.state.borrow_mut().receiver.take() {
            task.abort();
        }
        self.inner.core.set_active(Activity::Reading, false);
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        self.inner.state.borrow().receiver.is_some()
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: FnMut(std::result::Result<Datagram, NativeError>) + 'static,
    {
        self.inner.on_message.set(Box::new(callback));
    }

    pub fn send_queue_size(&self) -> usize {
        self.inner.state.borrow().writes.size()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    pub fn set_broadcast(&self, enable: bool) -> Result<()> {
        Ok(self.socket()?.set_broadcast(enable)?)
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        Ok(self.socket()?.set_ttl(ttl)?)
    }

    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        Ok(self.socket()?.set_multicast_ttl_v4(ttl)?)
    }

    pub fn set_multicast_loopback(&self, enable: bool) -> Result<()> {
        let socket = self.socket()?;
        match socket.local_addr()? {
            SocketAddr::V4(_) => socket.set_multicast_loop_v4(enable)?,
            SocketAddr::V6(_) => socket.set_multicast_loop_v6(enable)?,
        }
        Ok(())
    }

    /// Joins `group` on `interface` (IPv4) or on the default interface.
    pub fn add_membership(&self, group: IpAddr, interface: Option<Ipv4Addr>) -> Result<()> {
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => {
                socket.join_multicast_v4(group, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?
            }
            IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
        }
        Ok(())
    }

    pub fn drop_membership(&self, group: IpAddr, interface: Option<Ipv4Addr>) -> Result<()> {
        let socket = self.socket()?;
        match group {
            IpAddr::V4(group) => {
                socket.leave_multicast_v4(group, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?
            }
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0)?,
        }
        Ok(())
    }

    /// `EBADF` until bound or once closing.
    fn socket(&self) -> Result<Rc<UdpSocket>> {
        self.inner.core.ensure_open()?;
        let socket = self.inner.state.borrow().socket.clone();
        Ok(socket.ok_or_else(NativeError::bad_descriptor)?)
    }
}

impl UdpInner {
    fn sink(self: &Rc<Self>) -> EventSink<UdpEvent> {
        let target: Weak<dyn Dispatch<UdpEvent>> = Rc::downgrade(self) as Weak<Self>;
        EventSink::new(self.core.ctx(), target)
    }

    fn install(self: &Rc<Self>, socket: UdpSocket) {
        let socket = Rc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = self.core.ctx().spawn(send_loop(socket.clone(), rx, self.sink()));
        {
            let mut st = self.state.borrow_mut();
            st.socket = Some(socket);
            st.sends = Some(tx);
            st.sender = Some(sender);
        }
        self.core.set_state(HandleState::Bound);
    }

    fn close(self: &Rc<Self>, on_close: Completion<()>) {
        if !self.core.begin_close() {
            return;
        }
        let writes = {
            let mut st = self.state.borrow_mut();
            for task in [st.sender.take(), st.receiver.take()].into_iter().flatten() {
                task.abort();
            }
            st.sends = None;
            st.socket = None;
            st.writes.drain_all()
        };
        let this = Rc::clone(self);
        self.core.ctx().post(move || {
            for write in writes {
                this.core.finish_request();
                write.completion.notify(Err(NativeError::canceled()));
            }
            this.on_message.seal();
            this.core.finish_close();
            on_close.notify(());
        });
    }
}

impl Dispatch<UdpEvent> for UdpInner {
    fn dispatch(self: Rc<Self>, event: UdpEvent) {
        if self.core.is_closing() {
            return;
        }
        match event {
            UdpEvent::SendDone { seq, status } => {
                let write = self.state.borrow_mut().writes.pop_oldest();
                if let Some(write) = write {
                    trace!(handle = %self.core.id(), seq, "send complete");
                    self.core.finish_request();
                    write.completion.notify(status);
                }
            }
            UdpEvent::Message(message) => {
                self.on_message.with(|callback| callback(message));
            }
        }
    }
}

async fn send_loop(socket: Rc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<Outgoing>, sink: EventSink<UdpEvent>) {
    while let Some(Outgoing { seq, payload, to }) = rx.recv().await {
        let status = match socket.send_to(&payload, to).await {
            Ok(_) => Ok(()),
            Err(err) => Err(NativeError::from(err)),
        };
        sink.post(UdpEvent::SendDone { seq, status });
    }
}

async fn recv_loop(socket: Rc<UdpSocket>, sink: EventSink<UdpEvent>, size: usize) {
    let mut buf = BytesMut::zeroed(size);
    loop {
        let message = match socket.recv_from(&mut buf).await {
            Ok((n, from)) => Ok(Datagram {
                data: Bytes::copy_from_slice(&buf[..n]),
                from,
            }),
            Err(err) => Err(NativeError::from(err)),
        };
        sink.post(UdpEvent::Message(message));
    }
}

impl_handle!(UdpHandle, inner);

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::handle::Handle;
    use crate::reactor::Reactor;

    #[test]
    fn datagram_round_trip() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        reactor
            .run(move |ctx| {
                let server = UdpHandle::new(ctx, CapabilityToken::all()).unwrap();
                server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
                let addr = server.local_addr().unwrap();
                let client = UdpHandle::new(ctx, CapabilityToken::all()).unwrap();

                let closer = (server.clone(), client.clone());
                let messages = seen.clone();
                server.on_message(move |message| {
                    let message = message.unwrap();
                    messages.borrow_mut().push(String::from_utf8_lossy(&message.data).into_owned());
                    closer.0.close_with(Completion::discard());
                    closer.1.close_with(Completion::discard());
                });
                server.recv_start().unwrap();

                let sends = seen.clone();
                client
                    .send_with(
                        Bytes::from_static(b"ping"),
                        addr,
                        Completion::new(move |status: Status| {
                            sends.borrow_mut().push(format!("sent {}", status.is_ok()));
                        }),
                    )
                    .unwrap();
                assert_eq!(client.state(), HandleState::Bound);
            })
            .unwrap();
        let log = log.borrow();
        assert!(log.contains(&"ping".to_string()));
        // The send either completed or was canceled by the close, never both.
        assert_eq!(log.iter().filter(|l| l.starts_with("sent")).count(), 1);
    }

    #[test]
    fn unbound_socket_rejects_options() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|ctx| {
                let udp = UdpHandle::new(ctx, CapabilityToken::all()).unwrap();
                assert_eq!(udp.recv_start().unwrap_err().code(), Some("EINVAL"));
                assert_eq!(udp.set_broadcast(true).unwrap_err().code(), Some("EBADF"));
                udp.close_with(Completion::discard());
                let err = udp
                    .send(Bytes::from_static(b"x"), "127.0.0.1:9".parse().unwrap())
                    .unwrap_err();
                assert_eq!(err.code(), Some("EBADF"));
            })
            .unwrap();
    }
}
