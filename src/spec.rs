//! What to run, and what came out.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::err::{Error, CleanupError, Result};

/// Which parts of the root filesystem the command may modify.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WritablePaths {
    /// Unspecified.  The rootfs is used as-is, and the command may write
    /// anywhere the underlying filesystem permissions allow.
    #[default]
    All,
    /// Only these paths, and anything beneath them, are writable.
    /// An empty set makes the whole rootfs read-only.
    ///
    /// Relative paths are relative to the rootfs.  Absolute paths must
    /// be host paths within the rootfs.
    Only(BTreeSet<PathBuf>),
}

impl WritablePaths {
    /// Nothing writable
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    pub fn only<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::Only(paths.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraMountKind {
    /// Bind a host directory or file
    Bind,
    /// A fresh, empty, writable tmpfs
    Tmpfs,
    /// procfs
    Proc,
}

/// An additional mount placed inside the sandbox before the writable policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraMount {
    /// Host path.  Required for `Bind`, ignored otherwise.
    pub source: Option<PathBuf>,
    /// Mount point, relative to the rootfs.  Created if missing.
    pub target: PathBuf,
    pub kind: ExtraMountKind,
}

impl ExtraMount {
    pub fn bind<A: Into<PathBuf>, B: Into<PathBuf>>(source: A, target: B) -> Self {
        Self {
            source: Some(source.into()),
            target: target.into(),
            kind: ExtraMountKind::Bind,
        }
    }

    pub fn tmpfs<B: Into<PathBuf>>(target: B) -> Self {
        Self {
            source: None,
            target: target.into(),
            kind: ExtraMountKind::Tmpfs,
        }
    }

    pub fn proc<B: Into<PathBuf>>(target: B) -> Self {
        Self {
            source: None,
            target: target.into(),
            kind: ExtraMountKind::Proc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// No attempt is made to either prevent or provide networking
    #[default]
    Undefined,
    /// Run in a new, empty, network namespace
    Isolated,
}

/// Where an output stream of the command goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redirect {
    /// Collect into `ExecutionResult`
    #[default]
    Capture,
    /// /dev/null
    Discard,
    /// stderr only.  Interleave with stdout.
    ToStdout,
    /// An open descriptor of the caller, eg. a file or this process' own stdout.
    /// It is duplicated for the command, and left open.  Nothing is captured.
    Fd(RawFd),
}

/// A request to run one command in a sandbox.  Read-only input to `SandboxRunner::run()`.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub rootfs: PathBuf,
    pub command: Vec<String>,
    /// Relative to `rootfs`.  Default "/"
    pub cwd: Option<PathBuf>,
    /// The complete environment of the command.  Nothing is inherited.
    pub env: BTreeMap<String, String>,
    pub writable: WritablePaths,
    pub backend: String,
    pub extra_mounts: Vec<ExtraMount>,
    pub network: Network,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Overrides `Config::timeout`
    pub timeout: Option<Duration>,
}

impl SandboxSpec {
    pub fn new<P, I, S>(rootfs: P, command: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rootfs: rootfs.into(),
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            writable: WritablePaths::All,
            backend: crate::registry::CHROOT.to_string(),
            extra_mounts: vec![],
            network: Network::Undefined,
            stdout: Redirect::Capture,
            stderr: Redirect::Capture,
            timeout: None,
        }
    }

    pub fn backend<S: Into<String>>(mut self, name: S) -> Self {
        self.backend = name.into();
        self
    }

    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn writable(mut self, writable: WritablePaths) -> Self {
        self.writable = writable;
        self
    }

    pub fn mount(mut self, extra: ExtraMount) -> Self {
        self.extra_mounts.push(extra);
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn stdout(mut self, to: Redirect) -> Self {
        self.stdout = to;
        self
    }

    pub fn stderr(mut self, to: Redirect) -> Self {
        self.stderr = to;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Checks which need no filesystem access
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].is_empty() {
            return Err(Error::config("command must not be empty"));
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            return Err(Error::config("command can not contain nil"));
        }
        for (name, value) in &self.env {
            if name.is_empty() || name.contains('=') || name.contains('\0') || value.contains('\0')
            {
                return Err(Error::config(format!("invalid environment variable {:?}", name)));
            }
        }
        if self.stdout == Redirect::ToStdout {
            return Err(Error::config("stdout can not be redirected to itself"));
        }
        for to in [self.stdout, self.stderr] {
            if let Redirect::Fd(fd) = to {
                if fd < 0 {
                    return Err(Error::config(format!("invalid descriptor {}", fd)));
                }
            }
        }
        for extra in &self.extra_mounts {
            if extra.kind == ExtraMountKind::Bind && extra.source.is_none() {
                return Err(Error::config(format!(
                    "bind mount at {} needs a source",
                    extra.target.display()
                )));
            }
        }
        Ok(())
    }

    /// `cwd` as an absolute path inside the sandbox
    pub fn sandbox_cwd(&self) -> Result<Option<PathBuf>> {
        match &self.cwd {
            None => Ok(None),
            Some(cwd) => crate::fs::normalize_relative(cwd)
                .map(|rel| Some(Path::new("/").join(rel)))
                .ok_or_else(|| {
                    Error::config(format!("cwd {} escapes the rootfs", cwd.display()))
                }),
        }
    }
}

/// Outcome of the sandboxed command.  The exit code is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

impl ExecutionResult {
    pub(crate) fn new(exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>, timed_out: bool) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            timed_out,
        }
    }

    /// Exit status, or minus the signal number which killed the command.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn into_output(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// A completed run.  Teardown problems are reported beside the result.
#[derive(Debug)]
pub struct Outcome {
    pub result: ExecutionResult,
    /// Mounts or directories which could not be removed afterwards.
    pub cleanup: Option<CleanupError>,
}

impl Outcome {
    /// Treat a teardown failure as an error.  The error still holds the result.
    pub fn into_result(self) -> Result<ExecutionResult> {
        match self.cleanup {
            None => Ok(self.result),
            Some(cleanup) => {
                log::warn!(
                    "command exited with {} but cleanup failed",
                    self.result.exit_code
                );
                Err(Error::Cleanup {
                    result: Box::new(self.result),
                    cleanup,
                })
            }
        }
    }
}
