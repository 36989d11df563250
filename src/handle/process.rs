//! Child process handles.

use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::rc::{Rc, Weak};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::core::{Activity, HandleCore, Slot};
use super::pipe::PipeHandle;
use super::{AnyHandle, Completion, HandleKind};
use crate::capability::CapabilityToken;
use crate::error::{NativeError, Result};
use crate::native::io::{BoxRead, BoxWrite};
use crate::native::{Dispatch, EventSink};
use crate::reactor::ReactorContext;

/// How a child's stdio slot is wired.
#[derive(Clone, Default)]
pub enum StdioOption {
    #[default]
    Ignore,
    Inherit,
    /// Connects the slot to a fresh (`Created`) pipe handle.
    Pipe(PipeHandle),
}

/// What to run. `args` excludes the program itself.
#[derive(Clone, Default)]
pub struct ProcessOptions {
    pub file: String,
    pub args: Vec<String>,
    /// Replaces the inherited environment when set.
    pub env: Option<Vec<(String, String)>>,
    pub cwd: Option<PathBuf>,
    /// Puts the child in its own process group.
    pub detached: bool,
    pub stdio: [StdioOption; 3],
}

impl ProcessOptions {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdio(mut self, slot: usize, option: StdioOption) -> Self {
        if let Some(entry) = self.stdio.get_mut(slot) {
            *entry = option;
        }
        self
    }
}

/// How a child ended: an exit code, or the signal that killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    pub exit_status: i64,
    pub term_signal: i32,
}

struct Exited(std::result::Result<std::process::ExitStatus, NativeError>);

#[derive(Default)]
struct ProcessState {
    waiter: Option<JoinHandle<()>>,
    exit: Option<ExitStatus>,
}

pub(crate) struct ProcessInner {
    pub(crate) core: HandleCore,
    pid: Option<u32>,
    state: RefCell<ProcessState>,
    on_exit: Slot<dyn FnMut(ExitStatus)>,
}

/// A spawned child process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Rc<ProcessInner>,
}

impl ProcessHandle {
    /// Spawns a child.
    ///
    /// # Errors
    ///
    /// A permission error without the spawn capability; the OS error (for
    /// example `ENOENT`, with the file as path) if the child cannot start.
    pub fn spawn(ctx: &ReactorContext, token: CapabilityToken, options: ProcessOptions) -> Result<Self> {
        ctx.gate().authorize_spawn(&token)?;
        ctx.ensure_running("spawn")?;
        let core = HandleCore::new(ctx, HandleKind::Process, token)?;

        let mut command = Command::new(&options.file);
        command.args(&options.args);
        if let Some(env) = &options.env {
            command.env_clear().envs(env.iter().map(|(k, v)| (k, v)));
        }
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        if options.detached {
            command.process_group(0);
        }
        let [stdin, stdout, stderr] = &options.stdio;
        for option in &options.stdio {
            if let StdioOption::Pipe(pipe) = option {
                pipe.ensure_attachable()?;
            }
        }
        command.stdin(stdio(stdin)).stdout(stdio(stdout)).stderr(stdio(stderr));

        let mut child = command
            .spawn()
            .map_err(|err| NativeError::from(err).with_path(options.file.clone()))?;
        let pid = child.id();

        if let Err(err) = attach_stdio(&mut child, &options.stdio) {
            warn!(pid, error = %err, "stdio attach failed; killing child");
            let _ = child.start_kill();
            return Err(err);
        }

        let inner = Rc::new(ProcessInner {
            core,
            pid,
            state: RefCell::new(ProcessState::default()),
            on_exit: Slot::new(),
        });
        let target: Weak<dyn Dispatch<Exited>> = Rc::downgrade(&inner) as Weak<ProcessInner>;
        let sink = EventSink::new(ctx, target);
        let waiter = ctx.spawn(async move {
            let status = child.wait().await.map_err(NativeError::from);
            sink.post(Exited(status));
        });
        inner.state.borrow_mut().waiter = Some(waiter);
        inner.core.set_active(Activity::Running, true);
        info!(handle = %inner.core.id(), pid, file = %options.file, "process spawned");

        let handle = Self { inner };
        ctx.registry().insert(AnyHandle::Process(handle.clone()));
        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Set once the exit has been delivered.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.state.borrow().exit
    }

    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnMut(ExitStatus) + 'static,
    {
        self.inner.on_exit.set(Box::new(callback));
    }

    /// Sends `signum` to the child. Zero only checks that it exists.
    ///
    /// # Errors
    ///
    /// `ESRCH` once the child has exited.
    pub fn kill(&self, signum: i32) -> Result<()> {
        let core = &self.inner.core;
        core.ensure_open()?;
        core.ctx().gate().authorize_signal(&core.token())?;
        let pid = match (self.inner.pid, self.exit_status()) {
            (Some(pid), None) => pid,
            _ => return Err(NativeError::from_code("ESRCH").into()),
        };
        let sig = match signum {
            0 => None,
            n => Some(Signal::try_from(n).map_err(NativeError::from)?),
        };
        signal::kill(Pid::from_raw(pid as i32), sig).map_err(NativeError::from)?;
        Ok(())
    }
}

fn attach_stdio(child: &mut Child, slots: &[StdioOption; 3]) -> Result<()> {
    let [stdin, stdout, stderr] = slots;
    if let StdioOption::Pipe(pipe) = stdin {
        let writer = child.stdin.take().map(|w| Box::new(w) as BoxWrite);
        pipe.attach_child(None, writer)?;
    }
    if let StdioOption::Pipe(pipe) = stdout {
        let reader = child.stdout.take().map(|r| Box::new(r) as BoxRead);
        pipe.attach_child(reader, None)?;
    }
    if let StdioOption::Pipe(pipe) = stderr {
        let reader = child.stderr.take().map(|r| Box::new(r) as BoxRead);
        pipe.attach_child(reader, None)?;
    }
    Ok(())
}

fn stdio(option: &StdioOption) -> Stdio {
    match option {
        StdioOption::Ignore => Stdio::null(),
        StdioOption::Inherit => Stdio::inherit(),
        StdioOption::Pipe(_) => Stdio::piped(),
    }
}

impl ProcessInner {
    fn close(self: &Rc<Self>, on_close: Completion<()>) {
        if !self.core.begin_close() {
            return;
        }
        if let Some(waiter) = self.state.borrow_mut().waiter.take() {
            waiter.abort();
        }
        let this = Rc::clone(self);
        self.core.ctx().post(move || {
            this.on_exit.seal();
            this.core.finish_close();
            on_close.notify(());
        });
    }
}

impl Dispatch<Exited> for ProcessInner {
    fn dispatch(self: Rc<Self>, Exited(status): Exited) {
        if self.core.is_closing() {
            return;
        }
        self.state.borrow_mut().waiter = None;
        self.core.set_active(Activity::Running, false);
        let exit = match status {
            Ok(status) => ExitStatus {
                exit_status: status.code().map(i64::from).unwrap_or(0),
                term_signal: status.signal().unwrap_or(0),
            },
            Err(err) => {
                debug!(handle = %self.core.id(), code = err.code, "wait failed");
                ExitStatus {
                    exit_status: -1,
                    term_signal: 0,
                }
            }
        };
        debug!(handle = %self.core.id(), ?exit, "process exited");
        self.state.borrow_mut().exit = Some(exit);
        self.on_exit.with(|callback| callback(exit));
    }
}

impl_handle!(ProcessHandle, inner);
