use std::path::{Path, PathBuf};
use std::io;

use thiserror::Error;

use super::spec::ExecutionResult;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File {op} with {} : {io}", name.display())]
    File {
        op: String,
        name: PathBuf,
        #[source]
        io: io::Error,
    },
    #[error("OS {op} : {io}")]
    OS {
        op: String,
        #[source]
        io: io::Error,
    },
    #[error("String can not contain nil")]
    BadStr,
    #[error("Error: {msg} while parsing {}", name.display())]
    ParseError { msg: String, name: PathBuf },
    #[error("Missing mount point info")]
    MissingMount,

    /// Invalid `SandboxSpec`, unknown backend or bad configuration.
    /// Raised before anything is mounted.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The selected backend can not run on this host or at this privilege level.
    #[error("Backend {name} unavailable: {reason}")]
    BackendUnavailable { name: String, reason: String },
    /// Filesystem setup failed.  Partial setup has been rolled back.
    #[error("Mount setup failed: {0}")]
    Mount(#[source] Box<Error>),
    /// The sandbox mechanism could not start the command.
    #[error("Unable to execute {command:?}: {source}")]
    Execution {
        command: String,
        #[source]
        source: Box<Error>,
    },
    /// Teardown failed after the command ran.  What the command produced is kept.
    #[error("command exited with {}, but {cleanup}", result.exit_code())]
    Cleanup {
        result: Box<ExecutionResult>,
        #[source]
        cleanup: CleanupError,
    },
    /// A primary error which was followed by a teardown failure.
    #[error("{error} (cleanup also failed: {cleanup})")]
    Unclean {
        #[source]
        error: Box<Error>,
        cleanup: CleanupError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Annotate I/O error
    pub fn file<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P, err: io::Error) -> Self {
        Error::File {
            op: desc.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_file_error<S: AsRef<str>, P: AsRef<Path>>(desc: S, path: P) -> Self {
        Self::file(desc, path, io::Error::last_os_error())
    }

    pub fn os<S: AsRef<str>>(desc: S, err: io::Error) -> Self {
        Self::OS {
            op: desc.as_ref().to_string(),
            io: err,
        }
    }

    /// Annotate Error::last_os_error()
    pub fn last_os_error<S: AsRef<str>>(desc: S) -> Self {
        Self::os(desc, io::Error::last_os_error())
    }

    pub fn parse<M: AsRef<str>, P: AsRef<Path>>(msg: M, path: P) -> Self {
        Self::ParseError {
            msg: msg.as_ref().to_string(),
            name: path.as_ref().to_path_buf(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn unavailable<N: Into<String>, R: Into<String>>(name: N, reason: R) -> Self {
        Self::BackendUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Classify as a mount failure, unless already classified.
    pub fn into_mount(self) -> Self {
        if self.is_phase_error() {
            self
        } else {
            Self::Mount(Box::new(self))
        }
    }

    /// Classify as an execution failure, unless already classified.
    pub fn into_execution<C: AsRef<str>>(self, command: C) -> Self {
        if self.is_phase_error() {
            self
        } else {
            Self::Execution {
                command: command.as_ref().to_string(),
                source: Box::new(self),
            }
        }
    }

    /// Attach a teardown failure without masking this error.
    pub fn with_cleanup(self, cleanup: Option<CleanupError>) -> Self {
        match cleanup {
            Some(cleanup) if !cleanup.is_empty() => Self::Unclean {
                error: Box::new(self),
                cleanup,
            },
            _ => self,
        }
    }

    /// What the command produced, when it ran to completion before this error.
    pub fn execution_result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Cleanup { result, .. } => Some(&**result),
            _ => None,
        }
    }

    /// The error which aborted the run, looking through any attached cleanup failure.
    pub fn primary(&self) -> &Error {
        match self {
            Self::Unclean { error, .. } => error.primary(),
            other => other,
        }
    }

    pub fn is_phase_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::BackendUnavailable { .. }
                | Self::Mount(_)
                | Self::Execution { .. }
                | Self::Cleanup { .. }
                | Self::Unclean { .. }
        )
    }

    /// Test the underlying I/O error kind, if any.
    pub fn is_io_error(&self, kind: io::ErrorKind) -> bool {
        match self {
            Self::File { io, .. } | Self::OS { io, .. } => io.kind() == kind,
            Self::Mount(inner) => inner.is_io_error(kind),
            Self::Execution { source, .. } => source.is_io_error(kind),
            _ => false,
        }
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(_inp: std::ffi::NulError) -> Self {
        Error::BadStr
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(_inp: std::num::ParseIntError) -> Self {
        Error::BadStr
    }
}

/// Every failure encountered while tearing down a sandbox.
///
/// Teardown never stops at the first failure, so all of them are kept.
#[derive(Debug, Default, Error)]
#[error("{} teardown operation(s) failed: {}", .failures.len(), join(.failures))]
pub struct CleanupError {
    failures: Vec<Error>,
}

fn join(failures: &[Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CleanupError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.failures.push(err);
    }

    pub fn extend(&mut self, other: CleanupError) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[Error] {
        &self.failures
    }

    /// `None` when nothing failed
    pub fn into_option(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}
