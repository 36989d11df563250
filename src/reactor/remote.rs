//! Cross-thread access to a reactor.
//!
//! Work that must leave the reactor thread follows acquire → submit →
//! release: [`Remote::acquire`] keeps the loop alive while the work runs,
//! [`Remote::submit`] marshals the result back, and dropping (or
//! [`release`](KeepAlive::release)-ing) the guard lets the loop exit again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::{ReactorContext, ReactorError};

pub(crate) type RemoteTask = Box<dyn FnOnce(&ReactorContext) + Send>;

/// A `Send + Sync` handle onto a reactor's inbox.
#[derive(Clone)]
pub struct Remote {
    tx: UnboundedSender<RemoteTask>,
    keepalive: Arc<AtomicUsize>,
}

impl Remote {
    pub(crate) fn new(tx: UnboundedSender<RemoteTask>) -> Self {
        Self {
            tx,
            keepalive: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Prevents the reactor from going idle until the guard is released.
    pub fn acquire(&self) -> KeepAlive {
        let held = self.keepalive.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(held, "keep-alive acquired");
        KeepAlive {
            remote: Some(self.clone()),
        }
    }

    /// Runs `task` on the reactor thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Stopped`] once the reactor has been dropped.
    pub fn submit<F>(&self, task: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&ReactorContext) + Send + 'static,
    {
        self.tx
            .send(Box::new(task))
            .map_err(|_| ReactorError::Stopped)
    }

    /// Number of outstanding [`KeepAlive`] guards.
    pub fn keepalive_count(&self) -> usize {
        self.keepalive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("keepalive", &self.keepalive_count())
            .finish()
    }
}

/// Keeps a reactor running. Released explicitly or on drop.
#[must_use = "dropping a KeepAlive releases it immediately"]
pub struct KeepAlive {
    remote: Option<Remote>,
}

impl KeepAlive {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(remote) = self.remote.take() else {
            return;
        };
        if remote.keepalive.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Wake the loop so it can re-check for idleness.
            let _ = remote.tx.send(Box::new(|_| {}));
        }
        trace!("keep-alive released");
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.release_inner();
    }
}
