//! Single-fire completion types.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::NativeError;

/// Outcome of a native request.
pub type Status = Result<(), NativeError>;

/// Where a result goes once an operation completes.
///
/// Consumed by [`notify`](Self::notify), so it can fire at most once.
pub enum Completion<T> {
    Callback(Box<dyn FnOnce(T)>),
    Channel(oneshot::Sender<T>),
    Discard,
}

impl<T: 'static> Completion<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(T) + 'static,
    {
        Self::Callback(Box::new(callback))
    }

    /// A completion paired with a future that resolves to its result.
    pub fn channel() -> (Self, Pending<T>) {
        let (tx, rx) = oneshot::channel();
        (Self::Channel(tx), Pending { rx })
    }

    pub fn discard() -> Self {
        Self::Discard
    }

    pub fn notify(self, value: T) {
        match self {
            Self::Callback(callback) => callback(value),
            Self::Channel(tx) => {
                let _ = tx.send(value);
            }
            Self::Discard => {}
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Callback(_) => "Completion::Callback",
            Self::Channel(_) => "Completion::Channel",
            Self::Discard => "Completion::Discard",
        })
    }
}

/// Resolves to the value a [`Completion::channel`] was notified with, or
/// `None` if the completion was dropped without firing.
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Pending<T> {
    /// Takes the value if it has already arrived.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl<T> Future for Pending<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Identifies a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    pub seq: u64,
    pub len: usize,
}

/// A queued write. Awaiting it yields the write's status; a write whose
/// completion was dropped reports `ECANCELED`.
pub struct WriteRequest {
    ticket: WriteTicket,
    done: Pending<Status>,
}

impl WriteRequest {
    pub(crate) fn new(ticket: WriteTicket, done: Pending<Status>) -> Self {
        Self { ticket, done }
    }

    pub fn seq(&self) -> u64 {
        self.ticket.seq
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.ticket.len
    }

    pub fn is_empty(&self) -> bool {
        self.ticket.len == 0
    }

    pub fn try_status(&mut self) -> Option<Status> {
        self.done.try_take()
    }
}

impl Future for WriteRequest {
    type Output = Status;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.done)
            .poll(cx)
            .map(|status| status.unwrap_or_else(|| Err(NativeError::canceled())))
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("seq", &self.ticket.seq)
            .field("len", &self.ticket.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_fires_once() {
        let (done, mut pending) = Completion::<u8>::channel();
        assert!(pending.try_take().is_none());
        done.notify(3);
        assert_eq!(pending.try_take(), Some(3));
    }

    #[test]
    fn dropped_write_completion_is_canceled() {
        let (done, pending) = Completion::<Status>::channel();
        drop(done);
        let req = WriteRequest::new(WriteTicket { seq: 0, len: 1 }, pending);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let status = rt.block_on(req);
        assert_eq!(status.unwrap_err().code, "ECANCELED");
    }
}
