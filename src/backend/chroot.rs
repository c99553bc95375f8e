//! Run in-process with fork() and chroot()

use log::{debug, info};

use super::{Backend, Placement, PreparedRoot};
use crate::capability::{Cap, CAP_SYS_ADMIN, CAP_SYS_CHROOT};
use crate::err::{Error, Result};
use crate::policy::Plan;
use crate::proc::{Exec, Spawn};
use crate::registry::CHROOT;
use crate::spec::{ExecutionResult, SandboxSpec};
use crate::util;

/// Requires root, or at least CAP_SYS_CHROOT.  Mounts are made by the caller on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChrootBackend;

impl ChrootBackend {
    pub fn new() -> Self {
        ChrootBackend
    }
}

impl Backend for ChrootBackend {
    fn name(&self) -> &str {
        CHROOT
    }

    fn check_available(&self) -> Result<()> {
        let cap = Cap::current()?;
        debug!("capabilities {}", cap);
        if cap.effective(CAP_SYS_CHROOT) {
            return Ok(());
        }
        let reason = if cap.permitted(CAP_SYS_CHROOT) {
            "CAP_SYS_CHROOT permitted, but not effective"
        } else if util::geteuid() == 0 {
            "CAP_SYS_CHROOT has been dropped"
        } else {
            "CAP_SYS_CHROOT required (run as root)"
        };
        Err(Error::unavailable(CHROOT, reason))
    }

    fn placement(&self) -> Placement {
        Placement::Host
    }

    /// Mounting on the host needs CAP_SYS_ADMIN as well
    fn check_plan(&self, plan: &Plan) -> Result<()> {
        let nops = plan.operations().len();
        if nops == 0 || Cap::current()?.effective(CAP_SYS_ADMIN) {
            Ok(())
        } else {
            Err(Error::unavailable(
                CHROOT,
                format!("CAP_SYS_ADMIN required for {} mount operation(s)", nops),
            ))
        }
    }

    fn execute(&self, spec: &SandboxSpec, root: &PreparedRoot<'_>) -> Result<ExecutionResult> {
        let mut exec = Exec::new(&spec.command[0])?;
        exec.args(&spec.command)?.envs(&spec.env)?;

        let mut spawn = Spawn::new(&exec);
        spawn
            .chroot(root.plan.rootfs())?
            .stdout(spec.stdout)
            .stderr(spec.stderr);
        if let Some(cwd) = &root.cwd {
            spawn.cwd(cwd)?;
        }

        let child = spawn.spawn()?;
        info!("{} running in {}", child.id(), root.plan.rootfs().display());
        let out = child.collect(root.timeout, root.kill_grace)?;
        debug!("{} exit {}", spec.command[0], out.code);
        Ok(out.into())
    }
}
