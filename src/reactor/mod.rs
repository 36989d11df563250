//! The single-threaded reactor.
//!
//! A [`Reactor`] owns a tokio current-thread runtime and a
//! [`LocalSet`](tokio::task::LocalSet). Native I/O runs as local tasks on
//! that set; their completions are posted to the reactor's run queue and
//! dispatched to handles one at a time, so handle state lives in
//! `Rc`/`RefCell` and is never locked.
//!
//! The loop exits once nothing can produce further work: no queued task, no
//! referenced active handle, no pending request and no outstanding
//! [`KeepAlive`].
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use uvwire::{CapabilityToken, Handle, Reactor, ReactorConfig, TimerHandle};
//!
//! let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
//! reactor
//!     .run(|ctx| {
//!         let timer = TimerHandle::new(ctx, CapabilityToken::all()).unwrap();
//!         timer.on_timeout(|t| {
//!             t.close();
//!         });
//!         timer.start(Duration::from_millis(1), Duration::ZERO).unwrap();
//!     })
//!     .unwrap();
//! ```

use std::cell::{Cell, RefCell, RefMut};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::rc::Rc;

use thiserror::Error;
use tokio::runtime::{Builder, Handle as RuntimeHandle, Runtime};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, trace};

use crate::capability::CapabilityGate;
use crate::config::{ConfigError, ReactorConfig};
use crate::error::UsageError;
use crate::handle::AnyHandle;

mod registry;
mod remote;

pub use registry::{HandleId, HandleInfo};
pub use remote::{KeepAlive, Remote};

pub(crate) use registry::Registry;
use remote::RemoteTask;

/// Reactor construction and shutdown errors.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build the runtime: {0}")]
    Runtime(#[from] io::Error),

    #[error("the reactor has stopped")]
    Stopped,
}

type Task = Box<dyn FnOnce()>;

thread_local! {
    static ON_REACTOR: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is currently driving a reactor.
pub fn on_reactor_thread() -> bool {
    ON_REACTOR.with(Cell::get)
}

struct ReactorThread {
    previous: bool,
}

impl ReactorThread {
    fn enter() -> Self {
        Self {
            previous: ON_REACTOR.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        ON_REACTOR.with(|flag| flag.set(self.previous));
    }
}

struct Shared {
    config: ReactorConfig,
    runtime: RuntimeHandle,
    gate: CapabilityGate,
    queue: RefCell<VecDeque<Task>>,
    wake: Notify,
    alive: Cell<usize>,
    next_id: Cell<u64>,
    registry: RefCell<Registry>,
    remote: Remote,
}

/// Reactor-thread view of a running reactor.
///
/// Cheap to clone; every handle keeps one.
#[derive(Clone)]
pub struct ReactorContext {
    shared: Rc<Shared>,
}

impl ReactorContext {
    pub fn config(&self) -> &ReactorConfig {
        &self.shared.config
    }

    pub fn gate(&self) -> &CapabilityGate {
        &self.shared.gate
    }

    /// A `Send + Sync` handle for other threads.
    pub fn remote(&self) -> Remote {
        self.shared.remote.clone()
    }

    /// Queues `task` to run on the reactor after the current dispatch.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.shared.queue.borrow_mut().push_back(Box::new(task));
        self.shared.wake.notify_one();
    }

    /// Snapshot of every handle that has not finished closing.
    pub fn handles(&self) -> Vec<HandleInfo> {
        self.shared.registry.borrow().infos()
    }

    pub fn handle(&self, id: HandleId) -> Option<AnyHandle> {
        self.shared.registry.borrow().get(id)
    }

    /// Handles currently watching `signum`.
    pub fn signal_watchers(&self, signum: i32) -> Vec<HandleId> {
        self.shared.registry.borrow().signal_watchers(signum)
    }

    /// Whether anything still keeps the loop running.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.get() > 0
            || !self.shared.queue.borrow().is_empty()
            || self.shared.remote.keepalive_count() > 0
    }

    /// `NotOnReactor` unless called from inside [`Reactor::run`] or
    /// [`Reactor::block_on`]. Entry points that start native work check this
    /// before touching tokio.
    pub(crate) fn ensure_running(&self, op: &'static str) -> Result<(), UsageError> {
        if !on_reactor_thread() {
            return Err(UsageError::NotOnReactor { op });
        }
        Ok(())
    }

    /// Spawns a local task. Only valid once [`ensure_running`] passed.
    ///
    /// [`ensure_running`]: Self::ensure_running
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        debug_assert!(on_reactor_thread(), "local task spawned outside the reactor");
        tokio::task::spawn_local(future)
    }

    /// Runs `work` on the runtime's blocking pool. Usable from any thread,
    /// whether or not the loop is running.
    pub(crate) fn spawn_blocking<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.shared.runtime.spawn_blocking(work));
    }

    pub(crate) fn next_handle_id(&self) -> HandleId {
        let id = self.shared.next_id.get() + 1;
        self.shared.next_id.set(id);
        HandleId(id)
    }

    /// Adds (`true`) or removes (`false`) one unit of liveness.
    pub(crate) fn adjust_alive(&self, retain: bool) {
        let alive = self.shared.alive.get();
        let alive = if retain {
            alive + 1
        } else {
            alive.saturating_sub(1)
        };
        self.shared.alive.set(alive);
        if alive == 0 {
            self.shared.wake.notify_one();
        }
    }

    pub(crate) fn registry(&self) -> RefMut<'_, Registry> {
        self.shared.registry.borrow_mut()
    }

    /// Completes an off-thread operation registered with
    /// [`Registry::insert_op`].
    pub(crate) fn complete_op(&self, op: u64, value: Box<dyn std::any::Any + Send>) {
        let callback = self.registry().take_op(op);
        match callback {
            Some(callback) => callback(value),
            None => trace!(op, "completion for unknown operation dropped"),
        }
    }

    /// Runs the tasks queued when called; tasks they post wait for the next
    /// round. Remote tasks are drained as well.
    fn run_ready(&self, inbox: &mut UnboundedReceiver<RemoteTask>) {
        let batch = self.shared.queue.borrow().len();
        for _ in 0..batch {
            let task = self.shared.queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        while let Ok(task) = inbox.try_recv() {
            task(self);
        }
    }

    fn has_queued(&self) -> bool {
        !self.shared.queue.borrow().is_empty()
    }

    fn is_idle(&self, inbox: &mut UnboundedReceiver<RemoteTask>) -> bool {
        // Read the keep-alive count before polling the inbox: a submit made
        // before the final release is then guaranteed to be visible.
        if self.shared.remote.keepalive_count() != 0 {
            return false;
        }
        if let Ok(task) = inbox.try_recv() {
            task(self);
            return false;
        }
        !self.has_queued() && self.shared.alive.get() == 0
    }
}

/// Owner of the runtime, the local task set and the run queue.
pub struct Reactor {
    runtime: Runtime,
    local: LocalSet,
    ctx: ReactorContext,
    inbox: UnboundedReceiver<RemoteTask>,
}

impl Reactor {
    /// # Errors
    ///
    /// Fails if `config` does not validate or the runtime cannot be built.
    pub fn new(config: ReactorConfig) -> Result<Self, ReactorError> {
        config.validate()?;
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, inbox) = mpsc::unbounded_channel();
        let gate = CapabilityGate::new(config.runtime_grants);
        let shared = Shared {
            config,
            runtime: runtime.handle().clone(),
            gate,
            queue: RefCell::new(VecDeque::new()),
            wake: Notify::new(),
            alive: Cell::new(0),
            next_id: Cell::new(0),
            registry: RefCell::new(Registry::default()),
            remote: Remote::new(tx),
        };
        Ok(Self {
            runtime,
            local: LocalSet::new(),
            ctx: ReactorContext {
                shared: Rc::new(shared),
            },
            inbox,
        })
    }

    pub fn context(&self) -> ReactorContext {
        self.ctx.clone()
    }

    pub fn remote(&self) -> Remote {
        self.ctx.remote()
    }

    /// Calls `main` on the reactor thread, then runs until idle.
    pub fn run<F>(&mut self, main: F) -> Result<(), ReactorError>
    where
        F: FnOnce(&ReactorContext),
    {
        let Self {
            runtime,
            local,
            ctx,
            inbox,
        } = self;
        let _thread = ReactorThread::enter();
        let ctx = &*ctx;
        local.block_on(runtime, async move {
            main(ctx);
            loop {
                ctx.run_ready(inbox);
                if ctx.has_queued() {
                    tokio::task::yield_now().await;
                    continue;
                }
                if ctx.is_idle(inbox) {
                    break;
                }
                tokio::select! {
                    _ = ctx.shared.wake.notified() => {}
                    task = inbox.recv() => {
                        if let Some(task) = task {
                            task(ctx);
                        }
                    }
                }
            }
        });
        debug!("reactor idle");
        Ok(())
    }

    /// Runs until idle without an entry closure.
    pub fn run_until_idle(&mut self) -> Result<(), ReactorError> {
        self.run(|_| {})
    }

    /// Drives the reactor until `future` resolves, dispatching completions
    /// meanwhile. The loop need not be idle when this returns.
    pub fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        let Self {
            runtime,
            local,
            ctx,
            inbox,
        } = self;
        let _thread = ReactorThread::enter();
        let ctx = &*ctx;
        local.block_on(runtime, async move {
            tokio::pin!(future);
            loop {
                ctx.run_ready(inbox);
                if ctx.has_queued() {
                    tokio::select! {
                        biased;
                        out = &mut future => return out,
                        _ = tokio::task::yield_now() => continue,
                    }
                }
                tokio::select! {
                    biased;
                    out = &mut future => return out,
                    _ = ctx.shared.wake.notified() => {}
                    task = inbox.recv() => {
                        if let Some(task) = task {
                            task(ctx);
                        }
                    }
                }
            }
        })
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Handles and queued tasks hold the context; drop them here so the
        // shared state is freed with the reactor.
        let tasks = std::mem::take(&mut *self.ctx.shared.queue.borrow_mut());
        drop(tasks);
        let handles = self.ctx.registry().clear();
        drop(handles);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn runs_posted_tasks_in_order() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        reactor
            .run(move |ctx| {
                let inner = ctx.clone();
                let log2 = log.clone();
                log.borrow_mut().push(1);
                ctx.post(move || {
                    log2.borrow_mut().push(2);
                    let log3 = log2.clone();
                    inner.post(move || log3.borrow_mut().push(4));
                });
                let log5 = log.clone();
                ctx.post(move || log5.borrow_mut().push(3));
            })
            .unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn keepalive_holds_loop_until_submit() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        let ran_off_thread = Arc::new(AtomicBool::new(false));
        let ran = ran_off_thread.clone();
        reactor
            .run(move |ctx| {
                let remote = ctx.remote();
                let keep = remote.acquire();
                // The callback runs on the reactor thread, so it may capture
                // thread-local state through the registry.
                let op = ctx.registry().insert_op(Box::new(move |value| {
                    if let Ok(v) = value.downcast::<u32>() {
                        flag.set(*v == 7);
                    }
                }));
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    ran.store(true, Ordering::SeqCst);
                    let _ = remote.submit(move |ctx| ctx.complete_op(op, Box::new(7u32)));
                    keep.release();
                });
            })
            .unwrap();
        assert!(ran_off_thread.load(Ordering::SeqCst));
        assert!(done.get());
    }

    #[test]
    fn thread_flag_is_scoped() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        assert!(!on_reactor_thread());
        let inside = reactor.block_on(async { on_reactor_thread() });
        assert!(inside);
        assert!(!on_reactor_thread());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = ReactorConfig::default().read_buffer_size(0);
        assert!(matches!(Reactor::new(config), Err(ReactorError::Config(_))));
    }
}
