//! Timer handles.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use super::core::{Activity, HandleCore, Slot};
use super::{AnyHandle, Completion, HandleKind};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::{Dispatch, EventSink};
use crate::reactor::ReactorContext;

struct Fired {
    generation: u64,
}

#[derive(Default)]
struct TimerState {
    repeat: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct TimerInner {
    pub(crate) core: HandleCore,
    state: RefCell<TimerState>,
    on_timeout: Slot<dyn FnMut(&TimerHandle)>,
}

/// Fires a callback after a timeout, optionally repeating.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Rc<TimerInner>,
}

impl TimerHandle {
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        let core = HandleCore::new(ctx, HandleKind::Timer, token)?;
        let handle = Self {
            inner: Rc::new(TimerInner {
                core,
                state: RefCell::new(TimerState::default()),
                on_timeout: Slot::new(),
            }),
        };
        ctx.registry().insert(AnyHandle::Timer(handle.clone()));
        Ok(handle)
    }

    pub fn on_timeout<F>(&self, callback: F)
    where
        F: FnMut(&TimerHandle) + 'static,
    {
        self.inner.on_timeout.set(Box::new(callback));
    }

    /// Arms the timer. A zero `repeat` makes it one-shot. Restarting an armed
    /// timer replaces the previous schedule.
    pub fn start(&self, timeout: Duration, repeat: Duration) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.core.ctx().ensure_running("timer start")?;
        self.inner.state.borrow_mut().repeat = repeat;
        self.inner.arm(timeout);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.disarm();
        Ok(())
    }

    /// Restarts a repeating timer with its repeat interval.
    ///
    /// # Errors
    ///
    /// `EINVAL` if no callback is set.
    pub fn again(&self) -> Result<()> {
        self.inner.core.ensure_open()?;
        self.inner.core.ctx().ensure_running("timer again")?;
        if !self.inner.on_timeout.is_set() {
            return Err(NativeError::invalid().into());
        }
        let repeat = self.repeat();
        if !repeat.is_zero() {
            self.inner.arm(repeat);
        }
        Ok(())
    }

    /// Takes effect from the next expiry.
    pub fn set_repeat(&self, repeat: Duration) {
        self.inner.state.borrow_mut().repeat = repeat;
    }

    pub fn repeat(&self) -> Duration {
        self.inner.state.borrow().repeat
    }
}

impl TimerInner {
    fn arm(self: &Rc<Self>, after: Duration) {
        let generation = {
            let mut st = self.state.borrow_mut();
            if let Some(task) = st.task.take() {
                task.abort();
            }
            st.generation += 1;
            st.generation
        };
        let target: Weak<dyn Dispatch<Fired>> = Rc::downgrade(self) as Weak<Self>;
        let sink = EventSink::new(self.core.ctx(), target);
        let task = self.core.ctx().spawn(async move {
            tokio::time::sleep(after).await;
            sink.post(Fired { generation });
        });
        self.state.borrow_mut().task = Some(task);
        self.core.set_active(Activity::Running, true);
        trace!(handle = %self.core.id(), ?after, generation, "timer armed");
    }

    fn disarm(&self) {
        {
            let mut st = self.state.borrow_mut();
            if let Some(task) = st.task.take() {
                task.abort();
            }
            st.generation += 1;
        }
        self.core.set_active(Activity::Running, false);
    }

    fn close(self: &Rc<Self>, on_close: Completion<()>) {
        if !self.core.begin_close() {
            return;
        }
        if let Some(task) = self.state.borrow_mut().task.take() {
            task.abort();
        }
        let this = Rc::clone(self);
        self.core.ctx().post(move || {
            this.on_timeout.seal();
            this.core.finish_close();
            on_close.notify(());
        });
    }
}

impl Dispatch<Fired> for TimerInner {
    fn dispatch(self: Rc<Self>, event: Fired) {
        if self.core.is_closing() {
            return;
        }
        let repeat = {
            let st = self.state.borrow();
            if st.generation != event.generation {
                return;
            }
            st.repeat
        };
        if repeat.is_zero() {
            self.state.borrow_mut().task = None;
            self.core.set_active(Activity::Running, false);
        } else {
            self.arm(repeat);
        }
        let handle = TimerHandle {
            inner: Rc::clone(&self),
        };
        self.on_timeout.with(|callback| callback(&handle));
    }
}

impl_handle!(TimerHandle, inner);

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::handle::Handle;
    use crate::reactor::Reactor;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn one_shot_fires_once() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        reactor
            .run(move |ctx| {
                let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
                timer.on_timeout(move |t| {
                    count.set(count.get() + 1);
                    assert!(!t.is_active());
                });
                timer.start(MS, Duration::ZERO).unwrap();
                assert!(timer.is_active());
            })
            .unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn repeating_until_stopped() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        reactor
            .run(move |ctx| {
                let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
                timer.on_timeout(move |t| {
                    count.set(count.get() + 1);
                    if count.get() == 3 {
                        t.stop().unwrap();
                    }
                });
                timer.start(MS, MS).unwrap();
            })
            .unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn restart_replaces_schedule() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        reactor
            .run(move |ctx| {
                let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
                timer.on_timeout(move |_| count.set(count.get() + 1));
                timer.start(Duration::from_secs(3600), Duration::ZERO).unwrap();
                timer.start(MS, Duration::ZERO).unwrap();
            })
            .unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn unref_timer_does_not_hold_loop() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        reactor
            .run(move |ctx| {
                let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
                timer.on_timeout(move |_| flag.set(true));
                timer.start(Duration::from_secs(3600), Duration::ZERO).unwrap();
                timer.unref();
                assert!(!timer.has_ref());
            })
            .unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn start_before_run_is_refused() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let timer = TimerHandle::new(&reactor.context(), CapabilityToken::all()).unwrap();
        let err = timer.start(MS, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Usage(crate::UsageError::NotOnReactor { op: "timer start" })
        ));
        assert!(!timer.is_active());
    }

    #[test]
    fn again_requires_callback() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|ctx| {
                let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
                assert_eq!(timer.again().unwrap_err().code(), Some("EINVAL"));
                timer.close_with(Completion::discard());
                assert_eq!(timer.start(MS, MS).unwrap_err().code(), Some("EBADF"));
            })
            .unwrap();
    }
}
