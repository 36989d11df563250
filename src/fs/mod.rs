//! Filesystem bridge.
//!
//! Every call exists twice. The [`Fs`] methods run the work on tokio's
//! blocking pool and deliver the result to a [`Completion`] back on the
//! reactor thread, following acquire → submit → release: a [`KeepAlive`] is
//! held while the work runs, the result is marshaled home with
//! [`Remote::submit`], and the guard is released after the submit.
//!
//! The `*_sync` free functions block the calling thread and refuse to run
//! on a reactor thread.
//!
//! Failures on paths carry the path (and `path2` for `rename`); failures on
//! descriptors report "not found" as `EBADF`.
//!
//! [`KeepAlive`]: crate::reactor::KeepAlive
//! [`Remote::submit`]: crate::reactor::Remote::submit

use std::any::Any;
use std::fs::{self as stdfs, DirBuilder, Metadata, OpenOptions};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{trace, warn};

use crate::capability::CapabilityToken;
use crate::error::{FsTarget, NativeError, Result, UsageError, map_fs_error};
use crate::handle::Completion;
use crate::reactor::{ReactorContext, on_reactor_thread};

/// Result type delivered to filesystem completions.
pub type FsResult<T> = std::result::Result<T, NativeError>;

/// `stat(2)` fields. Times are seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn is_file(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFREG as u32
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }
}

impl From<&Metadata> for FileStat {
    fn from(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        }
    }
}

impl From<&libc::stat> for FileStat {
    fn from(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as i64,
            mtime: st.st_mtime as i64,
            ctime: st.st_ctime as i64,
        }
    }
}

/// Asynchronous filesystem access bound to one reactor.
///
/// # Examples
///
/// ```
/// use uvwire::fs::Fs;
/// use uvwire::{CapabilityToken, Completion, Reactor, ReactorConfig};
///
/// let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
/// let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();
/// let stat = reactor.block_on(async {
///     let (done, pending) = Completion::channel();
///     fs.stat("/", done);
///     pending.await
/// });
/// assert!(stat.unwrap().unwrap().is_dir());
/// ```
#[derive(Clone)]
pub struct Fs {
    ctx: ReactorContext,
    token: CapabilityToken,
}

impl Fs {
    /// # Errors
    ///
    /// A permission error unless `token` grants filesystem access.
    pub fn new(ctx: &ReactorContext, token: CapabilityToken) -> Result<Self> {
        ctx.gate().authorize_fs(&token)?;
        Ok(Self {
            ctx: ctx.clone(),
            token,
        })
    }

    pub fn token(&self) -> CapabilityToken {
        self.token
    }

    /// Opens `path` with `O_*` `flags`; new files get `mode`.
    pub fn open(&self, path: impl Into<String>, flags: i32, mode: u32, done: Completion<FsResult<RawFd>>) {
        let path = path.into();
        self.dispatch("open", move || sys::open(&path, flags, mode), done);
    }

    pub fn close(&self, fd: RawFd, done: Completion<FsResult<()>>) {
        self.dispatch("close", move || sys::close(fd), done);
    }

    /// Reads up to `len` bytes, at `position` when given, otherwise at the
    /// current offset.
    pub fn read(&self, fd: RawFd, len: usize, position: Option<u64>, done: Completion<FsResult<Bytes>>) {
        self.dispatch("read", move || sys::read(fd, len, position), done);
    }

    /// Writes `data`, at `position` when given. Delivers the byte count.
    pub fn write(&self, fd: RawFd, data: Bytes, position: Option<u64>, done: Completion<FsResult<usize>>) {
        self.dispatch("write", move || sys::write(fd, &data, position), done);
    }

    pub fn stat(&self, path: impl Into<String>, done: Completion<FsResult<FileStat>>) {
        let path = path.into();
        self.dispatch("stat", move || sys::stat(&path), done);
    }

    pub fn fstat(&self, fd: RawFd, done: Completion<FsResult<FileStat>>) {
        self.dispatch("fstat", move || sys::fstat(fd), done);
    }

    pub fn rename(&self, from: impl Into<String>, to: impl Into<String>, done: Completion<FsResult<()>>) {
        let (from, to) = (from.into(), to.into());
        self.dispatch("rename", move || sys::rename(&from, &to), done);
    }

    pub fn unlink(&self, path: impl Into<String>, done: Completion<FsResult<()>>) {
        let path = path.into();
        self.dispatch("unlink", move || sys::unlink(&path), done);
    }

    pub fn mkdir(&self, path: impl Into<String>, mode: u32, done: Completion<FsResult<()>>) {
        let path = path.into();
        self.dispatch("mkdir", move || sys::mkdir(&path, mode), done);
    }

    pub fn rmdir(&self, path: impl Into<String>, done: Completion<FsResult<()>>) {
        let path = path.into();
        self.dispatch("rmdir", move || sys::rmdir(&path), done);
    }

    /// Entry names, excluding `.` and `..`, in directory order.
    pub fn readdir(&self, path: impl Into<String>, done: Completion<FsResult<Vec<String>>>) {
        let path = path.into();
        self.dispatch("readdir", move || sys::readdir(&path), done);
    }

    pub fn chown(&self, path: impl Into<String>, uid: u32, gid: u32, done: Completion<FsResult<()>>) {
        let path = path.into();
        self.dispatch("chown", move || sys::chown(&path, uid, gid), done);
    }

    /// Changes ownership through the descriptor.
    pub fn fchown(&self, fd: RawFd, uid: u32, gid: u32, done: Completion<FsResult<()>>) {
        self.dispatch("fchown", move || sys::fchown(fd, uid, gid), done);
    }

    fn dispatch<T, F>(&self, op: &'static str, work: F, done: Completion<FsResult<T>>)
    where
        T: Send + 'static,
        F: FnOnce() -> FsResult<T> + Send + 'static,
    {
        let id = self.ctx.registry().insert_op(Box::new(move |value: Box<dyn Any + Send>| {
            match value.downcast::<FsResult<T>>() {
                Ok(result) => done.notify(*result),
                Err(_) => warn!(op, "filesystem completion of the wrong type dropped"),
            }
        }));
        let remote = self.ctx.remote();
        let keepalive = remote.acquire();
        self.ctx.spawn_blocking(move || {
            let result = work();
            trace!(op, ok = result.is_ok(), "filesystem call finished");
            if remote
                .submit(move |ctx| ctx.complete_op(id, Box::new(result)))
                .is_err()
            {
                warn!(op, "reactor stopped before a filesystem completion");
            }
            keepalive.release();
        });
    }
}

fn off_reactor(op: &'static str) -> std::result::Result<(), UsageError> {
    if on_reactor_thread() {
        return Err(UsageError::BlockingOnReactor { op });
    }
    Ok(())
}

pub fn open_sync(path: &str, flags: i32, mode: u32) -> Result<RawFd> {
    off_reactor("open_sync")?;
    Ok(sys::open(path, flags, mode)?)
}

pub fn close_sync(fd: RawFd) -> Result<()> {
    off_reactor("close_sync")?;
    Ok(sys::close(fd)?)
}

pub fn read_sync(fd: RawFd, len: usize, position: Option<u64>) -> Result<Bytes> {
    off_reactor("read_sync")?;
    Ok(sys::read(fd, len, position)?)
}

pub fn write_sync(fd: RawFd, data: &[u8], position: Option<u64>) -> Result<usize> {
    off_reactor("write_sync")?;
    Ok(sys::write(fd, data, position)?)
}

pub fn stat_sync(path: &str) -> Result<FileStat> {
    off_reactor("stat_sync")?;
    Ok(sys::stat(path)?)
}

pub fn fstat_sync(fd: RawFd) -> Result<FileStat> {
    off_reactor("fstat_sync")?;
    Ok(sys::fstat(fd)?)
}

pub fn rename_sync(from: &str, to: &str) -> Result<()> {
    off_reactor("rename_sync")?;
    Ok(sys::rename(from, to)?)
}

pub fn unlink_sync(path: &str) -> Result<()> {
    off_reactor("unlink_sync")?;
    Ok(sys::unlink(path)?)
}

pub fn mkdir_sync(path: &str, mode: u32) -> Result<()> {
    off_reactor("mkdir_sync")?;
    Ok(sys::mkdir(path, mode)?)
}

pub fn rmdir_sync(path: &str) -> Result<()> {
    off_reactor("rmdir_sync")?;
    Ok(sys::rmdir(path)?)
}

pub fn readdir_sync(path: &str) -> Result<Vec<String>> {
    off_reactor("readdir_sync")?;
    Ok(sys::readdir(path)?)
}

pub fn chown_sync(path: &str, uid: u32, gid: u32) -> Result<()> {
    off_reactor("chown_sync")?;
    Ok(sys::chown(path, uid, gid)?)
}

pub fn fchown_sync(fd: RawFd, uid: u32, gid: u32) -> Result<()> {
    off_reactor("fchown_sync")?;
    Ok(sys::fchown(fd, uid, gid)?)
}

/// The calls themselves, shared by both flavors.
mod sys {
    use super::*;

    fn check(ret: libc::c_int) -> FsResult<libc::c_int> {
        if ret == -1 {
            Err(NativeError::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn check_len(ret: libc::ssize_t) -> FsResult<usize> {
        usize::try_from(ret).map_err(|_| NativeError::last_os_error())
    }

    fn offset(position: u64) -> FsResult<libc::off_t> {
        libc::off_t::try_from(position).map_err(|_| NativeError::invalid())
    }

    pub fn open(path: &str, flags: i32, mode: u32) -> FsResult<RawFd> {
        let access = flags & libc::O_ACCMODE;
        let mut options = OpenOptions::new();
        options
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .custom_flags(
                flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL),
            );
        if flags & libc::O_CREAT != 0 {
            if flags & libc::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        options
            .open(path)
            .map(IntoRawFd::into_raw_fd)
            .map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn close(fd: RawFd) -> FsResult<()> {
        // SAFETY: the caller hands over `fd`; a stale descriptor yields EBADF.
        check(unsafe { libc::close(fd) }).map_err(|err| map_fs_error(err, FsTarget::Fd))?;
        Ok(())
    }

    pub fn read(fd: RawFd, len: usize, position: Option<u64>) -> FsResult<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        // SAFETY: `buf` holds `len` initialized bytes for the whole call.
        let ret = match position {
            Some(position) => {
                let at = offset(position)?;
                unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), len, at) }
            }
            None => unsafe { libc::read(fd, buf.as_mut_ptr().cast(), len) },
        };
        let n = check_len(ret).map_err(|err| map_fs_error(err, FsTarget::Fd))?;
        buf.truncate(n);
        Ok(buf.freeze())
    }

    pub fn write(fd: RawFd, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        // SAFETY: `data` is a live slice of `data.len()` bytes.
        let ret = match position {
            Some(position) => {
                let at = offset(position)?;
                unsafe { libc::pwrite(fd, data.as_ptr().cast(), data.len(), at) }
            }
            None => unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) },
        };
        check_len(ret).map_err(|err| map_fs_error(err, FsTarget::Fd))
    }

    pub fn stat(path: &str) -> FsResult<FileStat> {
        stdfs::metadata(path)
            .map(|meta| FileStat::from(&meta))
            .map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn fstat(fd: RawFd) -> FsResult<FileStat> {
        // SAFETY: `stat` is plain old data, and fstat writes only into `st`.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        check(unsafe { libc::fstat(fd, &mut st) }).map_err(|err| map_fs_error(err, FsTarget::Fd))?;
        Ok(FileStat::from(&st))
    }

    pub fn rename(from: &str, to: &str) -> FsResult<()> {
        stdfs::rename(from, to).map_err(|err| map_fs_error(err, FsTarget::Paths(from, to)))
    }

    pub fn unlink(path: &str) -> FsResult<()> {
        stdfs::remove_file(path).map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn mkdir(path: &str, mode: u32) -> FsResult<()> {
        DirBuilder::new()
            .mode(mode)
            .create(path)
            .map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn rmdir(path: &str) -> FsResult<()> {
        stdfs::remove_dir(path).map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn readdir(path: &str) -> FsResult<Vec<String>> {
        let fail = |err: std::io::Error| map_fs_error(err, FsTarget::Path(path));
        stdfs::read_dir(path)
            .map_err(fail)?
            .map(|entry| {
                entry
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .map_err(fail)
            })
            .collect()
    }

    pub fn chown(path: &str, uid: u32, gid: u32) -> FsResult<()> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
            .map_err(|err| map_fs_error(err, FsTarget::Path(path)))
    }

    pub fn fchown(fd: RawFd, uid: u32, gid: u32) -> FsResult<()> {
        // SAFETY: no memory is passed; a bad descriptor is reported as EBADF.
        check(unsafe { libc::fchown(fd, uid, gid) }).map_err(|err| map_fs_error(err, FsTarget::Fd))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use nix::unistd::{getgid, getuid};

    use super::*;
    use crate::capability::Capability;
    use crate::config::ReactorConfig;
    use crate::error::Error;
    use crate::reactor::Reactor;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("uvwire-fs-{}-{name}", std::process::id()));
        let _ = stdfs::remove_file(&path);
        path
    }

    fn call<T, F>(reactor: &mut Reactor, start: F) -> FsResult<T>
    where
        F: FnOnce(Completion<FsResult<T>>),
        T: 'static,
    {
        reactor.block_on(async move {
            let (done, pending) = Completion::channel();
            start(done);
            pending.await.expect("completion dropped")
        })
    }

    #[test]
    fn async_file_round_trip() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();
        let path = scratch("round-trip");
        let name = path.to_str().unwrap().to_owned();

        let fd = call(&mut reactor, |done| {
            fs.open(name.clone(), libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC, 0o644, done)
        })
        .unwrap();
        let written = call(&mut reactor, |done| fs.write(fd, Bytes::from_static(b"hello"), Some(0), done)).unwrap();
        assert_eq!(written, 5);

        let stat = call(&mut reactor, |done| fs.fstat(fd, done)).unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.is_file());

        let data = call(&mut reactor, |done| fs.read(fd, 16, Some(1), done)).unwrap();
        assert_eq!(&data[..], b"ello");

        call(&mut reactor, |done| fs.fchown(fd, getuid().as_raw(), getgid().as_raw(), done)).unwrap();
        call(&mut reactor, |done| fs.close(fd, done)).unwrap();
        call(&mut reactor, |done| fs.unlink(name.clone(), done)).unwrap();

        assert!(!path.exists());
    }

    #[test]
    fn path_errors_carry_paths() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();

        let err = call(&mut reactor, |done| fs.stat("/nonexistent/uvwire", done)).unwrap_err();
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.path.as_deref(), Some("/nonexistent/uvwire"));

        let err = call(&mut reactor, |done| fs.rename("/nonexistent/a", "/nonexistent/b", done)).unwrap_err();
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.path.as_deref(), Some("/nonexistent/a"));
        assert_eq!(err.path2.as_deref(), Some("/nonexistent/b"));
    }

    #[test]
    fn descriptor_errors_have_no_path() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();
        let err = call(&mut reactor, |done| fs.fstat(-1, done)).unwrap_err();
        assert_eq!(err.code, "EBADF");
        assert!(err.path.is_none());
    }

    #[test]
    fn directories() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();
        let dir = scratch("dir");
        let _ = stdfs::remove_dir_all(&dir);
        let name = dir.to_str().unwrap().to_owned();

        call(&mut reactor, |done| fs.mkdir(name.clone(), 0o755, done)).unwrap();
        stdfs::write(dir.join("entry"), b"x").unwrap();
        let entries = call(&mut reactor, |done| fs.readdir(name.clone(), done)).unwrap();
        assert_eq!(entries, vec!["entry".to_owned()]);

        let err = call(&mut reactor, |done| fs.rmdir(name.clone(), done)).unwrap_err();
        assert_eq!(err.code, "ENOTEMPTY");
        stdfs::remove_file(dir.join("entry")).unwrap();
        call(&mut reactor, |done| fs.rmdir(name.clone(), done)).unwrap();
    }

    #[test]
    fn sync_calls_off_the_reactor() {
        let path = scratch("sync");
        let name = path.to_str().unwrap();

        let fd = open_sync(name, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, 0o600).unwrap();
        assert_eq!(write_sync(fd, b"abc", None).unwrap(), 3);
        fchown_sync(fd, getuid().as_raw(), getgid().as_raw()).unwrap();
        assert_eq!(fstat_sync(fd).unwrap().size, 3);
        close_sync(fd).unwrap();

        let err = fstat_sync(fd).unwrap_err();
        assert_eq!(err.code(), Some("EBADF"));

        chown_sync(name, getuid().as_raw(), getgid().as_raw()).unwrap();
        let fd = open_sync(name, libc::O_RDONLY, 0).unwrap();
        assert_eq!(&read_sync(fd, 8, None).unwrap()[..], b"abc");
        close_sync(fd).unwrap();

        let moved = scratch("sync-moved");
        rename_sync(name, moved.to_str().unwrap()).unwrap();
        assert_eq!(stat_sync(moved.to_str().unwrap()).unwrap().mode & 0o777, 0o600);
        unlink_sync(moved.to_str().unwrap()).unwrap();
    }

    #[test]
    fn sync_calls_refused_on_reactor_thread() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor
            .run(|_| {
                let err = stat_sync("/").unwrap_err();
                assert!(matches!(
                    err,
                    Error::Usage(UsageError::BlockingOnReactor { op: "stat_sync" })
                ));
            })
            .unwrap();
        assert!(stat_sync("/").unwrap().is_dir());
    }

    #[test]
    fn async_call_before_run_completes_once_the_loop_runs() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fs = Fs::new(&reactor.context(), CapabilityToken::all()).unwrap();
        let result = Rc::new(RefCell::new(None));
        let seen = result.clone();
        fs.stat(
            "/",
            Completion::new(move |stat: FsResult<FileStat>| {
                *seen.borrow_mut() = Some(stat.map(|s| s.is_dir()));
            }),
        );
        assert!(result.borrow().is_none());
        reactor.run_until_idle().unwrap();
        assert_eq!(*result.borrow(), Some(Ok(true)));
    }

    #[test]
    fn requires_filesystem_capability() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let err = Fs::new(&reactor.context(), CapabilityToken::new([Capability::Handle]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Permission(_)));
    }
}
