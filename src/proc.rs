//! Child processes.  fork()/exec(), process groups, and output capture.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};
use std::{fmt, ptr};

use libc;
use signal_hook::consts::SIGCHLD;
use signal_hook::low_level::pipe as sigpipe;
use signal_hook::SigId;

use log::{debug, warn};

use super::err::{Error, Result};
use super::spec::Redirect;
use super::util;

/// Managed (child) process, leader of its own process group
#[derive(Debug)]
pub struct Proc {
    pid: libc::pid_t,
    done: bool,
    code: i32,
}

impl Proc {
    pub fn manage(pid: libc::pid_t) -> Proc {
        assert!(pid > 0);
        Proc {
            pid,
            done: false,
            code: -1, // poison
        }
    }

    pub fn id(&self) -> libc::pid_t {
        self.pid
    }

    /// Send signal to process
    pub fn signal(&self, sig: libc::c_int) -> Result<()> {
        if !self.done {
            debug!("signal PID {} with {}", self.pid, sig);
            unsafe {
                if 0 != libc::kill(self.pid, sig) {
                    return Err(Error::last_os_error(format!(
                        "Unable to signal {} with {}",
                        self.pid, sig
                    )));
                }
            }
        }
        Ok(())
    }

    /// Send signal to every member of the process group.
    /// The group may outlive its (reaped) leader.
    pub fn signal_group(&self, sig: libc::c_int) -> Result<()> {
        debug!("signal PGID {} with {}", self.pid, sig);
        unsafe {
            if 0 != libc::kill(-self.pid, sig) {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(Error::os(
                        format!("Unable to signal group {} with {}", self.pid, sig),
                        err,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Send SIGKILL to process
    pub fn kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    /// Reap without blocking.  Returns the exit code once the process has exited.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.done {
            return Ok(Some(self.code));
        }
        match trywaitpid(self.pid)? {
            TryWait::Busy => Ok(None),
            TryWait::Done(_child, sts) => {
                debug!("PID {} -> {}", self.pid, sts);
                self.done = true;
                self.code = sts;
                Ok(Some(sts))
            }
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<i32> {
        if self.done {
            return Ok(self.code);
        }
        let mut sts = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut sts, 0) };
            if ret == self.pid {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::os(format!("waitpid({})", self.pid), err));
            }
        }
        self.done = true;
        self.code = decode_status(sts);
        Ok(self.code)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // never leave an orphan, or a zombie
        if let Err(err) = self.signal_group(libc::SIGKILL).and_then(|_| self.kill()) {
            warn!("unable to kill managed PID {} : {}", self.pid, err);
        }
        if let Err(err) = self.wait() {
            warn!("unable to reap managed PID {} : {}", self.pid, err);
        }
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.done {
            write!(f, "PID {} Exit with {}", self.pid, self.code)
        } else {
            write!(f, "PID {}", self.pid)
        }
    }
}

pub enum TryWait {
    Busy,
    Done(libc::pid_t, i32),
}

/// Exit code, or minus the number of the terminating signal
fn decode_status(sts: libc::c_int) -> i32 {
    if libc::WIFEXITED(sts) {
        libc::WEXITSTATUS(sts)
    } else if libc::WIFSIGNALED(sts) {
        -libc::WTERMSIG(sts)
    } else {
        -1
    }
}

/// Wraps waitpid()
pub fn trywaitpid(pid: libc::pid_t) -> Result<TryWait> {
    let mut sts = 0;
    unsafe {
        let ret = libc::waitpid(pid, &mut sts, libc::WNOHANG);
        if ret == -1 {
            Err(Error::last_os_error(format!("waitpid({})", pid)))
        } else if ret == 0 {
            Ok(TryWait::Busy)
        } else {
            Ok(TryWait::Done(ret, decode_status(sts)))
        }
    }
}

/// Run `act` in a forked child, which then `_exit()`s with the returned code.
///
/// The child of a multi-threaded parent may only make async-signal-safe calls.
/// So `act` must not allocate, lock, or log.
pub fn fork<F>(act: F) -> Result<Proc>
where
    F: FnOnce() -> libc::c_int,
{
    let ret = unsafe { libc::fork() };
    if ret < 0 {
        Err(Error::last_os_error("fork"))
    } else if ret == 0 {
        let code = act();
        unsafe { libc::_exit(code) }
    } else {
        Ok(Proc::manage(ret))
    }
}

/// A program to execute, with its complete argument list and environment
#[derive(Clone)]
pub struct Exec {
    // tried in order, as execvp() does
    candidates: Vec<CString>,
    args: Vec<CString>,
    env: BTreeMap<String, CString>,
}

impl Exec {
    /// Exec a program by name.  Names without '/' are searched for using `PATH`
    /// from the environment given to `env()`, or `DEFAULT_PATH`.
    ///
    /// The environment starts out empty.  Nothing is inherited.
    pub fn new<T: AsRef<OsStr>>(cmd: T) -> Result<Exec> {
        Ok(Exec {
            candidates: vec![util::os2cstr(cmd)?],
            args: vec![],
            env: BTreeMap::new(),
        })
    }

    pub fn args<I>(&mut self, args: I) -> Result<&mut Self>
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        for s in args.into_iter() {
            self.args.push(util::os2cstr(s)?);
        }
        Ok(self)
    }

    pub fn env<K: AsRef<str>, V: AsRef<str>>(&mut self, name: K, value: V) -> Result<&mut Self> {
        self.env.insert(
            name.as_ref().to_string(),
            CString::new(format!("{}={}", name.as_ref(), value.as_ref()))?,
        );
        Ok(self)
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.env(k, v)?;
        }
        Ok(self)
    }

    /// Expand a bare program name to the list of `$dir/$name` to try.
    fn search(&mut self) -> Result<()> {
        let name = self.candidates[0].as_bytes();
        if name.contains(&b'/') {
            return Ok(());
        }
        let name = String::from_utf8_lossy(name).into_owned();
        let path = self
            .env
            .get("PATH")
            .and_then(|kv| kv.to_str().ok())
            .and_then(|kv| kv.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());
        let mut found = vec![];
        for dir in path.split(':') {
            // empty entry means current directory
            let dir = if dir.is_empty() { "." } else { dir };
            found.push(CString::new(format!("{}/{}", dir, name))?);
        }
        self.candidates = found;
        Ok(())
    }

    pub fn program(&self) -> String {
        self.args
            .first()
            .or_else(|| self.candidates.first())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec")
            .field("cmd", &self.candidates)
            .field("args", &self.args)
            .field("env", &self.env.values())
            .finish()
    }
}

/// Search path used when the environment has no `PATH`
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where a child setup step failed.  Sent over the status pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Group = 1,
    Stdio = 2,
    Chroot = 3,
    Chdir = 4,
    Exec = 5,
}

impl Stage {
    fn from_u8(v: u8) -> Option<Stage> {
        Some(match v {
            1 => Stage::Group,
            2 => Stage::Stdio,
            3 => Stage::Chroot,
            4 => Stage::Chdir,
            5 => Stage::Exec,
            _ => return None,
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Group => "setpgid",
            Stage::Stdio => "dup2",
            Stage::Chroot => "chroot",
            Stage::Chdir => "chdir",
            Stage::Exec => "execve",
        };
        f.write_str(name)
    }
}

/// How to start an `Exec`
pub struct Spawn<'a> {
    exec: &'a Exec,
    root: Option<CString>,
    cwd: Option<CString>,
    stdout: Redirect,
    stderr: Redirect,
}

impl<'a> Spawn<'a> {
    pub fn new(exec: &'a Exec) -> Self {
        Spawn {
            exec,
            root: None,
            cwd: None,
            stdout: Redirect::Capture,
            stderr: Redirect::Capture,
        }
    }

    /// chroot() before exec.  Working directory then defaults to "/".
    pub fn chroot<P: AsRef<Path>>(&mut self, root: P) -> Result<&mut Self> {
        self.root = Some(util::path2cstr(root)?);
        Ok(self)
    }

    pub fn cwd<P: AsRef<Path>>(&mut self, cwd: P) -> Result<&mut Self> {
        self.cwd = Some(util::path2cstr(cwd)?);
        Ok(self)
    }

    pub fn stdout(&mut self, to: Redirect) -> &mut Self {
        self.stdout = to;
        self
    }

    pub fn stderr(&mut self, to: Redirect) -> &mut Self {
        self.stderr = to;
        self
    }

    /// Start the child.  Fails if the child could not reach exec.
    pub fn spawn(&self) -> Result<Child> {
        let mut searched = self.exec.clone();
        searched.search()?;
        let exec = &searched;

        // everything the child needs is prepared before fork()
        let devnull = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(|e| Error::file("open", "/dev/null", e))?;
        // (read end kept here, write end for the child)
        let open = |to: Redirect| -> Result<(Option<File>, Option<File>)> {
            Ok(match to {
                Redirect::Capture => util::pipe().map(|(r, t)| (Some(r), Some(t)))?,
                // keeps the child's dup2() away from 0-2
                Redirect::Fd(fd) => (None, Some(util::dup_cloexec(fd)?)),
                Redirect::Discard | Redirect::ToStdout => (None, None),
            })
        };
        let (out_rx, out_tx) = open(self.stdout)?;
        let (err_rx, err_tx) = open(self.stderr)?;
        let (mut status_rx, status_tx) = util::pipe()?;

        let null_fd = devnull.as_raw_fd();
        let out_fd = out_tx.as_ref().map(|f| f.as_raw_fd()).unwrap_or(null_fd);
        let err_fd = match self.stderr {
            Redirect::ToStdout => libc::STDOUT_FILENO,
            _ => err_tx.as_ref().map(|f| f.as_raw_fd()).unwrap_or(null_fd),
        };
        let status_fd = status_tx.as_raw_fd();

        let mut argv: Vec<*const libc::c_char> = exec.args.iter().map(|s| s.as_ptr()).collect();
        let mut envp: Vec<*const libc::c_char> = exec.env.values().map(|s| s.as_ptr()).collect();
        // arrays must be null terminated
        argv.push(ptr::null());
        envp.push(ptr::null());
        let candidates: Vec<*const libc::c_char> =
            exec.candidates.iter().map(|s| s.as_ptr()).collect();
        let root = self.root.as_ref().map(|s| s.as_ptr());
        let cwd = self
            .cwd
            .as_ref()
            .map(|s| s.as_ptr())
            .or(root.map(|_| b"/\0".as_ptr() as *const libc::c_char));

        let watch = ChildWatch::new()?;

        debug!("spawn {:?} root={:?} cwd={:?}", exec, self.root, self.cwd);
        let mut proc = fork(|| {
            let (stage, errno) = unsafe {
                child_exec(ChildPlan {
                    stdin: null_fd,
                    stdout: out_fd,
                    stderr: err_fd,
                    root,
                    cwd,
                    candidates: &candidates,
                    argv: &argv,
                    envp: &envp,
                })
            };
            let mut msg = [0u8; 5];
            msg[0] = stage as u8;
            msg[1..].copy_from_slice(&errno.to_le_bytes());
            unsafe {
                libc::write(status_fd, msg.as_ptr() as *const libc::c_void, msg.len());
            }
            127
        })?;

        // also from the parent side to avoid racing the child
        unsafe {
            libc::setpgid(proc.id(), proc.id());
        }
        debug!("Forked {}", proc);

        drop(status_tx);
        drop(out_tx);
        drop(err_tx);
        drop(devnull);

        // EOF when exec() succeeds and closes the write end
        let mut msg = vec![];
        status_rx
            .read_to_end(&mut msg)
            .map_err(|e| Error::os("read child status", e))?;
        if msg.len() >= 5 {
            let stage = Stage::from_u8(msg[0]).unwrap_or(Stage::Exec);
            let errno = i32::from_le_bytes([msg[1], msg[2], msg[3], msg[4]]);
            let code = proc.wait()?;
            debug!("child failed at {} with errno {} exit {}", stage, errno, code);
            return Err(Error::os(
                format!("{} in child", stage),
                io::Error::from_raw_os_error(errno),
            )
            .into_execution(exec.program()));
        }

        Ok(Child {
            proc,
            stdout: out_rx,
            stderr: err_rx,
            watch,
        })
    }
}

struct ChildPlan<'a> {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    root: Option<*const libc::c_char>,
    cwd: Option<*const libc::c_char>,
    candidates: &'a [*const libc::c_char],
    argv: &'a [*const libc::c_char],
    envp: &'a [*const libc::c_char],
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

/// Runs in the forked child.  Only returns on failure.
unsafe fn child_exec(plan: ChildPlan) -> (Stage, i32) {
    if 0 != libc::setpgid(0, 0) {
        return (Stage::Group, errno());
    }
    // stderr last, as it may be a copy of the new stdout
    for (fd, target) in [
        (plan.stdin, libc::STDIN_FILENO),
        (plan.stdout, libc::STDOUT_FILENO),
        (plan.stderr, libc::STDERR_FILENO),
    ] {
        if fd != target && libc::dup2(fd, target) < 0 {
            return (Stage::Stdio, errno());
        }
    }
    if let Some(root) = plan.root {
        if 0 != libc::chroot(root) {
            return (Stage::Chroot, errno());
        }
    }
    if let Some(cwd) = plan.cwd {
        if 0 != libc::chdir(cwd) {
            return (Stage::Chdir, errno());
        }
    }
    let mut last = libc::ENOENT;
    for cand in plan.candidates {
        libc::execve(*cand, plan.argv.as_ptr(), plan.envp.as_ptr());
        // only returns on error
        match errno() {
            // keep looking, remembering a permission problem, as execvp() does
            libc::EACCES => last = libc::EACCES,
            libc::ENOENT | libc::ENOTDIR => (),
            other => return (Stage::Exec, other),
        }
    }
    (Stage::Exec, last)
}

/// Wakes up on SIGCHLD
struct ChildWatch {
    id: SigId,
    rx: UnixStream,
    _tx: UnixStream,
}

impl ChildWatch {
    fn new() -> Result<ChildWatch> {
        let (rx, tx) = UnixStream::pair().map_err(|e| Error::os("socketpair", e))?;
        rx.set_nonblocking(true)
            .map_err(|e| Error::os("set_nonblocking", e))?;
        let id = sigpipe::register_raw(SIGCHLD, tx.as_raw_fd())
            .map_err(|e| Error::os("Install SIGCHLD handler", e))?;
        Ok(ChildWatch { id, rx, _tx: tx })
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.rx.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for ChildWatch {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}

/// Output of a child process
#[derive(Debug)]
pub struct Collected {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Running,
    Terminating,
    Killed,
}

/// A running child with its captured streams
pub struct Child {
    proc: Proc,
    stdout: Option<File>,
    stderr: Option<File>,
    watch: ChildWatch,
}

impl Child {
    pub fn id(&self) -> libc::pid_t {
        self.proc.id()
    }

    /// Read all output and wait for exit.
    ///
    /// After `timeout` the process group gets SIGTERM, then SIGKILL once `grace` has passed.
    /// Once the leader has exited, any remaining group members are killed.
    pub fn collect(mut self, timeout: Option<Duration>, grace: Duration) -> Result<Collected> {
        let mut out = vec![];
        let mut err = vec![];
        let mut deadline = timeout.map(|t| Instant::now() + t);
        let mut escalation = Escalation::Running;
        let mut timed_out = false;
        let mut code = None;

        loop {
            if code.is_none() {
                if let Some(sts) = self.proc.try_wait()? {
                    code = Some(sts);
                    self.proc.signal_group(libc::SIGKILL)?;
                }
            }
            if code.is_some() && self.stdout.is_none() && self.stderr.is_none() {
                break;
            }

            let now = Instant::now();
            if let Some(dl) = deadline {
                if now >= dl {
                    match escalation {
                        Escalation::Running => {
                            warn!("{} timed out", self.proc);
                            timed_out = true;
                            self.proc.signal_group(libc::SIGTERM)?;
                            escalation = Escalation::Terminating;
                            deadline = Some(now + grace);
                        }
                        Escalation::Terminating => {
                            debug!("{} ignored SIGTERM", self.proc);
                            self.proc.signal_group(libc::SIGKILL)?;
                            escalation = Escalation::Killed;
                            deadline = Some(now + grace);
                        }
                        Escalation::Killed => {
                            // stop waiting for output from escaped descendants
                            self.stdout = None;
                            self.stderr = None;
                            deadline = None;
                        }
                    }
                    continue;
                }
            }

            let wait_ms = match deadline {
                None => -1,
                Some(dl) => {
                    let left = dl.saturating_duration_since(now);
                    ((left.as_micros() + 999) / 1000).min(libc::c_int::MAX as u128) as libc::c_int
                }
            };

            let mut fds = vec![libc::pollfd {
                fd: self.watch.rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            for stream in [&self.stdout, &self.stderr].into_iter().flatten() {
                fds.push(libc::pollfd {
                    fd: stream.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, wait_ms) };
            if ret < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::os("poll", e));
            }

            let ready = |fd: RawFd| {
                fds.iter()
                    .any(|p| p.fd == fd && 0 != (p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)))
            };
            if ready(self.watch.rx.as_raw_fd()) {
                self.watch.drain();
            }
            if self.stdout.as_ref().map(|f| ready(f.as_raw_fd())).unwrap_or(false) {
                drain(&mut self.stdout, &mut out)?;
            }
            if self.stderr.as_ref().map(|f| ready(f.as_raw_fd())).unwrap_or(false) {
                drain(&mut self.stderr, &mut err)?;
            }
        }

        let code = match code {
            Some(code) => code,
            None => self.proc.wait()?,
        };
        Ok(Collected {
            code,
            stdout: out,
            stderr: err,
            timed_out,
        })
    }
}

/// Read what is available, closing on EOF
fn drain(stream: &mut Option<File>, buf: &mut Vec<u8>) -> Result<()> {
    if let Some(file) = stream {
        let mut chunk = [0u8; 16 * 1024];
        match file.read(&mut chunk) {
            Ok(0) => *stream = None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(Error::os("read child output", e)),
        }
    }
    Ok(())
}
