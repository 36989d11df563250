//! Scripted natives for tests.
//!
//! A [`FakeStream`] records what the handle asked of it; its paired
//! [`FakeControl`] lets a test post completions in whatever order it likes.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use super::{EventSink, ListenerNative, StreamEvent, StreamNative};
use crate::error::NativeError;
use crate::handle::{ReadEvent, Status};

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub reading: bool,
    pub read_starts: usize,
    pub writes: Vec<(u64, Bytes)>,
    pub shutdowns: usize,
    pub closed: bool,
}

type SharedSink = Rc<RefCell<Option<EventSink<StreamEvent>>>>;

pub(crate) struct FakeStream {
    state: Rc<RefCell<FakeState>>,
    sink: SharedSink,
}

#[derive(Clone)]
pub(crate) struct FakeControl {
    pub state: Rc<RefCell<FakeState>>,
    sink: SharedSink,
}

impl FakeStream {
    pub fn new() -> (Self, FakeControl) {
        let state = Rc::new(RefCell::new(FakeState::default()));
        let sink = SharedSink::default();
        let control = FakeControl {
            state: state.clone(),
            sink: sink.clone(),
        };
        (Self { state, sink }, control)
    }
}

impl FakeControl {
    fn post(&self, event: StreamEvent) {
        let sink = self.sink.borrow();
        let sink = sink.as_ref().expect("fake stream not attached");
        sink.post(event);
    }

    pub fn ack_write(&self, seq: u64, status: Status) {
        self.post(StreamEvent::WriteDone { seq, status });
    }

    pub fn push_read(&self, event: ReadEvent) {
        self.post(StreamEvent::Read(event));
    }

    pub fn ack_shutdown(&self, status: Status) {
        self.post(StreamEvent::ShutdownDone(status));
    }
}

impl StreamNative for FakeStream {
    fn attach(&mut self, sink: EventSink<StreamEvent>) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn start_reading(&mut self) -> Result<(), NativeError> {
        let mut state = self.state.borrow_mut();
        state.reading = true;
        state.read_starts += 1;
        Ok(())
    }

    fn stop_reading(&mut self) {
        self.state.borrow_mut().reading = false;
    }

    fn submit_write(&mut self, seq: u64, payload: Bytes) -> Result<(), NativeError> {
        self.state.borrow_mut().writes.push((seq, payload));
        Ok(())
    }

    fn submit_shutdown(&mut self) -> Result<(), NativeError> {
        self.state.borrow_mut().shutdowns += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.reading = false;
    }
}

pub(crate) struct FakeListener {
    sink: SharedSink,
    closed: Rc<RefCell<bool>>,
}

#[derive(Clone)]
pub(crate) struct ListenerControl {
    sink: SharedSink,
    pub closed: Rc<RefCell<bool>>,
}

impl FakeListener {
    pub fn new() -> (Self, ListenerControl) {
        let sink = SharedSink::default();
        let closed = Rc::new(RefCell::new(false));
        let control = ListenerControl {
            sink: sink.clone(),
            closed: closed.clone(),
        };
        (Self { sink, closed }, control)
    }
}

impl ListenerControl {
    /// Delivers a connection backed by a new fake stream.
    pub fn push_connection(&self) -> FakeControl {
        let (stream, control) = FakeStream::new();
        self.push(Ok(Box::new(stream)));
        control
    }

    pub fn push(&self, incoming: Result<Box<dyn StreamNative>, NativeError>) {
        let sink = self.sink.borrow();
        let sink = sink.as_ref().expect("fake listener not started");
        sink.post(StreamEvent::Incoming(incoming));
    }
}

impl ListenerNative for FakeListener {
    fn start(&mut self, sink: EventSink<StreamEvent>) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn close(&mut self) {
        *self.closed.borrow_mut() = true;
    }
}
