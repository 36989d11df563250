//! Shared core of the stream transports (TCP, pipe, tty).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::acceptor;
use super::completion::{Completion, Status, WriteTicket};
use super::core::{Activity, HandleCore, Slot};
use super::write_queue::WriteQueue;
use super::{AnyHandle, HandleKind, HandleState, ReadEvent};
use crate::capability::{CapabilityToken, PermissionError};
use crate::error::{NativeError, Result};
use crate::native::{Dispatch, EventSink, ListenerNative, StreamEvent, StreamNative};
use crate::reactor::ReactorContext;

/// A bound but not yet listening or connected endpoint.
pub(crate) enum Endpoint {
    Tcp(tokio::net::TcpSocket),
    TcpListener(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

pub(crate) type ConnectionCallback = dyn FnMut(Result<AnyHandle>);

#[derive(Default)]
struct StreamState {
    native: Option<Box<dyn StreamNative>>,
    listener: Option<Box<dyn ListenerNative>>,
    endpoint: Option<Endpoint>,
    writes: WriteQueue,
    reading: bool,
    read_done: bool,
    stash: VecDeque<ReadEvent>,
    connect: Option<Completion<Status>>,
    connector: Option<JoinHandle<()>>,
    shutdown: Option<Completion<Status>>,
    shut: bool,
}

pub(crate) struct Stream {
    pub(crate) core: HandleCore,
    state: RefCell<StreamState>,
    on_read: Slot<dyn FnMut(ReadEvent)>,
    pub(crate) on_connection: Slot<ConnectionCallback>,
}

impl Stream {
    pub fn new(
        ctx: &ReactorContext,
        kind: HandleKind,
        token: CapabilityToken,
    ) -> std::result::Result<Rc<Self>, PermissionError> {
        let core = HandleCore::new(ctx, kind, token)?;
        Ok(Rc::new(Self {
            core,
            state: RefCell::new(StreamState::default()),
            on_read: Slot::new(),
            on_connection: Slot::new(),
        }))
    }

    fn sink(self: &Rc<Self>) -> EventSink<StreamEvent> {
        let target: Weak<dyn Dispatch<StreamEvent>> = Rc::downgrade(self) as Weak<Self>;
        EventSink::new(self.core.ctx(), target)
    }

    /// Installs a connected native and moves to `Connected`.
    pub fn adopt(self: &Rc<Self>, mut native: Box<dyn StreamNative>) {
        native.attach(self.sink());
        self.state.borrow_mut().native = Some(native);
        self.core.set_state(HandleState::Connected);
    }

    /// `Created → Bound`.
    pub fn bind(&self, endpoint: Endpoint) -> Result<()> {
        self.core.ensure_open()?;
        if self.core.state() != HandleState::Created {
            return Err(NativeError::invalid().into());
        }
        self.state.borrow_mut().endpoint = Some(endpoint);
        self.core.set_state(HandleState::Bound);
        Ok(())
    }

    /// Hands the bound endpoint to `make_listener`. A failure poisons the
    /// handle.
    pub fn listen<F>(self: &Rc<Self>, make_listener: F) -> Result<()>
    where
        F: FnOnce(Endpoint) -> std::result::Result<Box<dyn ListenerNative>, NativeError>,
    {
        self.core.ensure_open()?;
        self.core.ctx().ensure_running("listen")?;
        if self.core.state() == HandleState::Listening {
            return Ok(());
        }
        let endpoint = match self.state.borrow_mut().endpoint.take() {
            Some(endpoint) if self.core.state() == HandleState::Bound => endpoint,
            _ => return Err(NativeError::invalid().into()),
        };
        let mut listener = match make_listener(endpoint) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(handle = %self.core.id(), code = err.code, "listen failed");
                self.core.poison();
                return Err(err.into());
            }
        };
        listener.start(self.sink());
        self.state.borrow_mut().listener = Some(listener);
        self.core.set_state(HandleState::Listening);
        self.core.set_active(Activity::Listening, true);
        debug!(handle = %self.core.id(), "listening");
        Ok(())
    }

    /// Starts the single in-flight connect. `make` receives the bound
    /// endpoint, if any, and returns the connecting future.
    pub fn connect<M, Fut>(self: &Rc<Self>, done: Completion<Status>, make: M) -> Result<()>
    where
        M: FnOnce(Option<Endpoint>) -> std::result::Result<Fut, NativeError>,
        Fut: Future<Output = std::result::Result<Box<dyn StreamNative>, NativeError>> + 'static,
    {
        self.core.ensure_open()?;
        self.core.ctx().ensure_running("connect")?;
        match self.core.state() {
            HandleState::Connecting => return Err(NativeError::from_code("EALREADY").into()),
            HandleState::Connected | HandleState::Listening => {
                return Err(NativeError::from_code("EISCONN").into());
            }
            _ => {}
        }
        let endpoint = self.state.borrow_mut().endpoint.take();
        let future = make(endpoint)?;
        let sink = self.sink();
        let task = self.core.ctx().spawn(async move {
            let result = future.await;
            sink.post(StreamEvent::Connected(result));
        });
        {
            let mut st = self.state.borrow_mut();
            st.connect = Some(done);
            st.connector = Some(task);
        }
        self.core.set_state(HandleState::Connecting);
        self.core.add_request();
        Ok(())
    }

    pub fn read_start(self: &Rc<Self>) -> Result<()> {
        self.core.ensure_open()?;
        match self.core.state() {
            HandleState::Connected => {}
            HandleState::Listening => return Err(NativeError::not_connected().into()),
            _ => return Ok(()),
        }
        let flush = {
            let mut st = self.state.borrow_mut();
            if st.reading || st.read_done {
                return Ok(());
            }
            let native = st.native.as_mut().ok_or_else(NativeError::not_connected)?;
            native.start_reading()?;
            st.reading = true;
            !st.stash.is_empty()
        };
        self.core.set_active(Activity::Reading, true);
        if flush {
            self.schedule_flush();
        }
        Ok(())
    }

    pub fn read_stop(&self) -> Result<()> {
        self.core.ensure_open()?;
        let mut st = self.state.borrow_mut();
        if !st.reading {
            return Ok(());
        }
        st.reading = false;
        if let Some(native) = st.native.as_mut() {
            native.stop_reading();
        }
        drop(st);
        self.core.set_active(Activity::Reading, false);
        Ok(())
    }

    pub fn is_reading(&self) -> bool {
        self.state.borrow().reading
    }

    pub fn set_on_read(self: &Rc<Self>, callback: Box<dyn FnMut(ReadEvent)>) {
        self.on_read.set(callback);
        let flush = {
            let st = self.state.borrow();
            st.reading && !st.stash.is_empty()
        };
        if flush {
            self.schedule_flush();
        }
    }

    pub fn write_with(&self, payload: Bytes, done: Completion<Status>) -> Result<WriteTicket> {
        self.core.ensure_open()?;
        let mut st = self.state.borrow_mut();
        if st.shut {
            return Err(NativeError::broken_pipe().into());
        }
        if self.core.state() != HandleState::Connected {
            return Err(NativeError::not_connected().into());
        }
        let StreamState { native, writes, .. } = &mut *st;
        let native = native.as_mut().ok_or_else(NativeError::not_connected)?;
        let len = payload.len();
        let seq = writes.push(len, done);
        if let Err(err) = native.submit_write(seq, payload) {
            let refused = writes.remove_newest(seq);
            drop(st);
            drop(refused);
            return Err(err.into());
        }
        drop(st);
        self.core.add_request();
        trace!(handle = %self.core.id(), seq, len, "write queued");
        Ok(WriteTicket { seq, len })
    }

    pub fn shutdown_with(&self, done: Completion<Status>) -> Result<()> {
        self.core.ensure_open()?;
        let mut st = self.state.borrow_mut();
        if self.core.state() != HandleState::Connected || st.shut {
            return Err(NativeError::not_connected().into());
        }
        let native = st.native.as_mut().ok_or_else(NativeError::not_connected)?;
        native.submit_shutdown()?;
        st.shut = true;
        st.shutdown = Some(done);
        drop(st);
        self.core.add_request();
        Ok(())
    }

    pub fn write_queue_size(&self) -> usize {
        self.state.borrow().writes.size()
    }

    /// Runs `op` against the connected native.
    pub fn with_native<R>(
        &self,
        op: impl FnOnce(&mut dyn StreamNative) -> std::result::Result<R, NativeError>,
    ) -> Result<R> {
        self.core.ensure_open()?;
        let mut st = self.state.borrow_mut();
        let native = st.native.as_mut().ok_or_else(NativeError::not_connected)?;
        Ok(op(native.as_mut())?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.core.ensure_open()?;
        let st = self.state.borrow();
        let addr = if let Some(native) = &st.native {
            native.local_addr()
        } else if let Some(listener) = &st.listener {
            listener.local_addr()
        } else {
            match &st.endpoint {
                Some(Endpoint::Tcp(socket)) => socket.local_addr().map_err(NativeError::from),
                Some(Endpoint::TcpListener(listener)) => {
                    listener.local_addr().map_err(NativeError::from)
                }
                _ => Err(NativeError::invalid()),
            }
        };
        Ok(addr?)
    }

    pub fn close(self: &Rc<Self>, on_close: Completion<()>) {
        if !self.core.begin_close() {
            return;
        }
        let (native, listener, writes, connect, shutdown) = {
            let mut st = self.state.borrow_mut();
            st.reading = false;
            st.stash.clear();
            st.endpoint = None;
            if let Some(task) = st.connector.take() {
                task.abort();
            }
            (
                st.native.take(),
                st.listener.take(),
                st.writes.drain_all(),
                st.connect.take(),
                st.shutdown.take(),
            )
        };
        if let Some(mut native) = native {
            native.stop_reading();
            native.close();
        }
        if let Some(mut listener) = listener {
            listener.close();
        }
        let this = Rc::clone(self);
        self.core.ctx().post(move || {
            if !writes.is_empty() {
                debug!(handle = %this.core.id(), count = writes.len(), "canceling pending writes");
            }
            for write in writes {
                this.core.finish_request();
                write.completion.notify(Err(NativeError::canceled()));
            }
            for pending in [connect, shutdown].into_iter().flatten() {
                this.core.finish_request();
                pending.notify(Err(NativeError::canceled()));
            }
            this.on_read.seal();
            this.on_connection.seal();
            this.core.finish_close();
            on_close.notify(());
        });
    }

    fn schedule_flush(self: &Rc<Self>) {
        let this = Rc::clone(self);
        self.core.ctx().post(move || this.flush_stash());
    }

    fn flush_stash(self: &Rc<Self>) {
        loop {
            let event = {
                let mut st = self.state.borrow_mut();
                if self.core.is_closing() || !st.reading || !self.on_read.is_set() {
                    return;
                }
                st.stash.pop_front()
            };
            match event {
                Some(event) => self.deliver(event),
                None => return,
            }
        }
    }

    fn on_read_event(self: &Rc<Self>, event: ReadEvent) {
        {
            let mut st = self.state.borrow_mut();
            if !st.reading || !self.on_read.is_set() || !st.stash.is_empty() {
                trace!(handle = %self.core.id(), "read event stashed");
                st.stash.push_back(event);
                return;
            }
        }
        self.deliver(event);
    }

    fn deliver(self: &Rc<Self>, event: ReadEvent) {
        if event.is_terminal() {
            {
                let mut st = self.state.borrow_mut();
                st.reading = false;
                st.read_done = true;
                if let Some(native) = st.native.as_mut() {
                    native.stop_reading();
                }
            }
            self.core.set_active(Activity::Reading, false);
            if let ReadEvent::Error(err) = &event {
                debug!(handle = %self.core.id(), code = err.code, "read failed");
            }
        }
        self.on_read.with(|callback| callback(event));
    }

    fn on_write_done(&self, seq: u64, status: Status) {
        let write = self.state.borrow_mut().writes.pop_oldest();
        let Some(write) = write else {
            trace!(handle = %self.core.id(), seq, "write ack with empty queue");
            return;
        };
        if write.seq != seq {
            trace!(handle = %self.core.id(), oldest = write.seq, acked = seq, "write acked out of order");
        }
        self.core.finish_request();
        write.completion.notify(status);
    }

    fn on_shutdown_done(&self, status: Status) {
        let done = self.state.borrow_mut().shutdown.take();
        if let Some(done) = done {
            self.core.finish_request();
            done.notify(status);
        }
    }

    fn on_connected(self: &Rc<Self>, result: std::result::Result<Box<dyn StreamNative>, NativeError>) {
        let done = {
            let mut st = self.state.borrow_mut();
            st.connector = None;
            st.connect.take()
        };
        let status = match result {
            Ok(native) => {
                self.adopt(native);
                Ok(())
            }
            Err(err) => {
                debug!(handle = %self.core.id(), code = err.code, "connect failed");
                self.core.set_state(HandleState::Created);
                Err(err)
            }
        };
        self.core.finish_request();
        if let Some(done) = done {
            done.notify(status);
        }
    }
}

impl Dispatch<StreamEvent> for Stream {
    fn dispatch(self: Rc<Self>, event: StreamEvent) {
        if self.core.is_closing() {
            if let StreamEvent::Connected(Ok(mut native)) | StreamEvent::Incoming(Ok(mut native)) =
                event
            {
                native.close();
            }
            return;
        }
        match event {
            StreamEvent::Read(event) => self.on_read_event(event),
            StreamEvent::WriteDone { seq, status } => self.on_write_done(seq, status),
            StreamEvent::ShutdownDone(status) => self.on_shutdown_done(status),
            StreamEvent::Connected(result) => self.on_connected(result),
            StreamEvent::Incoming(result) => acceptor::accept(&self, result),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::Bytes;

    use crate::capability::CapabilityToken;
    use crate::config::ReactorConfig;
    use crate::handle::{Completion, Handle, HandleState, ReadEvent, Readable, TcpHandle, Writable};
    use crate::native::fake::FakeStream;
    use crate::reactor::Reactor;
    use crate::NativeError;

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig::default()).unwrap()
    }

    #[test]
    fn completions_follow_submission_order() {
        let mut reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        reactor
            .run(move |ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                for (i, payload) in ["a", "bb", "ccc"].into_iter().enumerate() {
                    let log = seen.clone();
                    tcp.write_with(
                        Bytes::from(payload),
                        Completion::new(move |status: crate::handle::Status| {
                            log.borrow_mut().push((i, status.is_ok()));
                        }),
                    )
                    .unwrap();
                }
                assert_eq!(tcp.write_queue_size(), 6);
                assert_eq!(control.state.borrow().writes.len(), 3);
                control.ack_write(2, Ok(()));
                control.ack_write(0, Err(NativeError::from_code("ECONNRESET")));
                control.ack_write(1, Ok(()));
            })
            .unwrap();
        assert_eq!(*log.borrow(), vec![(0, true), (1, false), (2, true)]);
    }

    #[test]
    fn close_cancels_pending_writes_first() {
        let mut reactor = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = log.clone();
        reactor
            .run(move |ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                for i in 0..3 {
                    let log = seen.clone();
                    tcp.write_with(
                        Bytes::from_static(b"x"),
                        Completion::new(move |status: crate::handle::Status| {
                            let code = status.err().map(|e| e.code).unwrap_or("OK");
                            log.borrow_mut().push(format!("write {i} {code}"));
                        }),
                    )
                    .unwrap();
                }
                let log = seen.clone();
                tcp.close_with(Completion::new(move |()| log.borrow_mut().push("close".into())));
                let log = seen.clone();
                tcp.close_with(Completion::new(move |()| log.borrow_mut().push("close again".into())));
                assert_eq!(tcp.state(), HandleState::Closing);
                assert!(control.state.borrow().closed);
                // A late ack from the native is ignored.
                control.ack_write(0, Ok(()));
            })
            .unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "write 0 ECANCELED",
                "write 1 ECANCELED",
                "write 2 ECANCELED",
                "close"
            ]
        );
    }

    #[test]
    fn operations_after_close_are_ebadf() {
        let mut reactor = reactor();
        reactor
            .run(|ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                let _ = tcp.close();
                let err = tcp.write(Bytes::from_static(b"x")).unwrap_err();
                assert_eq!(err.code(), Some("EBADF"));
                assert_eq!(tcp.read_start().unwrap_err().code(), Some("EBADF"));
                assert!(control.state.borrow().writes.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn read_error_is_terminal() {
        let mut reactor = reactor();
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        let starts = Rc::new(RefCell::new(0));
        let starts_seen = starts.clone();
        reactor
            .run(move |ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                tcp.on_read(move |event| seen.borrow_mut().push(event));
                tcp.read_start().unwrap();
                control.push_read(ReadEvent::Data(Bytes::from_static(b"hi")));
                control.push_read(ReadEvent::Error(NativeError::from_code("ECONNRESET")));
                control.push_read(ReadEvent::Data(Bytes::from_static(b"late")));
                let tcp2 = tcp.clone();
                let control2 = control.clone();
                let starts = starts_seen.clone();
                ctx.post(move || {
                    assert!(!tcp2.is_reading());
                    tcp2.read_start().unwrap();
                    assert!(!tcp2.is_reading());
                    *starts.borrow_mut() = control2.state.borrow().read_starts;
                    let _ = tcp2.close();
                });
            })
            .unwrap();
        let events = events.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ReadEvent::Data(Bytes::from_static(b"hi")));
        assert!(matches!(&events[1], ReadEvent::Error(e) if e.code == "ECONNRESET"));
        assert_eq!(*starts.borrow(), 1);
    }

    #[test]
    fn data_before_callback_is_stashed() {
        let mut reactor = reactor();
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        reactor
            .run(move |ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                tcp.read_start().unwrap();
                control.push_read(ReadEvent::Data(Bytes::from_static(b"early")));
                let tcp2 = tcp.clone();
                ctx.post(move || {
                    let tcp3 = tcp2.clone();
                    tcp2.on_read(move |event| {
                        seen.borrow_mut().push(event);
                        let _ = tcp3.close();
                    });
                });
            })
            .unwrap();
        assert_eq!(*events.borrow(), vec![ReadEvent::Data(Bytes::from_static(b"early"))]);
    }

    #[test]
    fn shutdown_then_write_is_epipe() {
        let mut reactor = reactor();
        let status = Rc::new(RefCell::new(None));
        let seen = status.clone();
        reactor
            .run(move |ctx| {
                let (fake, control) = FakeStream::new();
                let tcp = TcpHandle::from_native(ctx, CapabilityToken::all(), Box::new(fake)).unwrap();
                tcp.shutdown_with(Completion::new(move |s: crate::handle::Status| {
                    *seen.borrow_mut() = Some(s.is_ok());
                }))
                .unwrap();
                let err = tcp.write(Bytes::from_static(b"x")).unwrap_err();
                assert_eq!(err.code(), Some("EPIPE"));
                assert_eq!(control.state.borrow().shutdowns, 1);
                control.ack_shutdown(Ok(()));
            })
            .unwrap();
        assert_eq!(*status.borrow(), Some(true));
    }
}
