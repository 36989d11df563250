//! Signal watcher handles.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::debug;

use super::core::{Activity, HandleCore, Slot};
use super::{AnyHandle, Completion, HandleKind};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::{Dispatch, EventSink};
use crate::reactor::ReactorContext;

struct Delivered(i32);

#[derive(Default)]
struct SignalState {
    signum: Option<i32>,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct SignalInner {
    pub(crate) core: HandleCore,
    state: RefCell<SignalState>,
    on_signal: Slot<dyn FnMut(i32)>,
}

/// Watches one signal number at a time.
#[derive(Clone)]
pub struct SignalHandle {
    inner: Rc<SignalInner>,
}

impl SignalHandle {
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        let core = HandleCore::new(ctx, HandleKind::Signal, token)?;
        let handle = Self {
            inner: Rc::new(SignalInner {
                core,
                state: RefCell::new(SignalState::default()),
                on_signal: Slot::new(),
            }),
        };
        ctx.registry().insert(AnyHandle::Signal(handle.clone()));
        Ok(handle)
    }

    pub fn on_signal<F>(&self, callback: F)
    where
        F: FnMut(i32) + 'static,
    {
        self.inner.on_signal.set(Box::new(callback));
    }

    /// Starts watching `signum`, replacing any previous watch.
    ///
    /// # Errors
    ///
    /// A permission error without the signal capability; `EINVAL` for a
    /// signal that cannot be watched.
    pub fn start(&self, signum: i32) -> Result<()> {
        let core = &self.inner.core;
        core.ensure_open()?;
        core.ctx().gate().authorize_signal(&core.token())?;
        core.ctx().ensure_running("signal start")?;
        if self.signum() == Some(signum) {
            return Ok(());
        }
        let mut stream = signal(SignalKind::from_raw(signum)).map_err(|_| NativeError::invalid())?;
        self.inner.stop();

        let target: Weak<dyn Dispatch<Delivered>> = Rc::downgrade(&self.inner) as Weak<SignalInner>;
        let sink = EventSink::new(core.ctx(), target);
        let task = core.ctx().spawn(async move {
            while stream.recv().await.is_some() {
                sink.post(Delivered(signum));
            }
        });
        {
            let mut st = self.inner.state.borrow_mut();
            st.signum = Some(signum);
            st.task = Some(task);
        }
        core.ctx().registry().watch_signal(signum, core.id());
        core.set_active(Activity::Running, true);
        debug!(handle = %core.id(), signal = signal_name(signum).unwrap_or("?"), "watching signal");
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.stop();
        Ok(())
    }

    /// The signal being watched.
    pub fn signum(&self) -> Option<i32> {
        self.inner.state.borrow().signum
    }
}

impl SignalInner {
    fn stop(&self) {
        let (signum, task) = {
            let mut st = self.state.borrow_mut();
            (st.signum.take(), st.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(signum) = signum {
            self.core.ctx().registry().unwatch_signal(signum, self.core.id());
        }
        self.core.set_active(Activity::Running, false);
    }

    fn close(self: &Rc<Self>, on_close: Completion<()>) {
        if self.core.is_closing() {
            return;
        }
        self.stop();
        if !self.core.begin_close() {
            return;
        }
        let this = Rc::clone(self);
        self.core.ctx().post(move || {
            this.on_signal.seal();
            this.core.finish_close();
            on_close.notify(());
        });
    }
}

impl Dispatch<Delivered> for SignalInner {
    fn dispatch(self: Rc<Self>, Delivered(signum): Delivered) {
        if self.core.is_closing() || self.state.borrow().signum != Some(signum) {
            return;
        }
        self.on_signal.with(|callback| callback(signum));
    }
}

impl_handle!(SignalHandle, inner);

/// The conventional name of `signum`, e.g. `"SIGINT"`.
pub fn signal_name(signum: i32) -> Option<&'static str> {
    Signal::try_from(signum).ok().map(Signal::as_str)
}
