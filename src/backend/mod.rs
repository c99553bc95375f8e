//! Isolation strategies

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::err::{Error, Result};
use super::policy::Plan;
use super::proc::Collected;
use super::spec::{ExecutionResult, Network, SandboxSpec};

pub mod chroot;
pub mod helper;

pub use self::chroot::ChrootBackend;
pub use self::helper::HelperBackend;

/// Where the mount plan is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// By `MountManager`, in the namespace of this process, before `execute()`
    Host,
    /// By the backend itself, in a private namespace.  Only mount points are created beforehand.
    Namespace,
}

/// Everything decided before a backend is asked to run the command
#[derive(Debug)]
pub struct PreparedRoot<'a> {
    pub plan: &'a Plan,
    /// Absolute, inside the sandbox
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Err(`Error::BackendUnavailable`) if this backend can not be used here.
    fn check_available(&self) -> Result<()>;

    fn placement(&self) -> Placement;

    /// Err(`Error::BackendUnavailable`) if this backend can not carry out `plan` here.
    fn check_plan(&self, _plan: &Plan) -> Result<()> {
        Ok(())
    }

    /// Reject requests this backend can not honour.
    fn supports(&self, spec: &SandboxSpec) -> Result<()> {
        if spec.network != Network::Undefined {
            return Err(Error::config(format!(
                "backend {} does not support network {:?}",
                self.name(),
                spec.network
            )));
        }
        Ok(())
    }

    /// Run the command to completion.  Its exit status is returned, not an error.
    fn execute(&self, spec: &SandboxSpec, root: &PreparedRoot<'_>) -> Result<ExecutionResult>;
}

impl fmt::Debug for dyn Backend + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend({})", self.name())
    }
}

impl From<Collected> for ExecutionResult {
    fn from(out: Collected) -> Self {
        ExecutionResult::new(out.code, out.stdout, out.stderr, out.timed_out)
    }
}
