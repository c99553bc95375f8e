//! Delegate to the external (setuid) `linux-user-chroot` helper.
//!
//! The helper makes its own mount namespace, so nothing is mounted on the host.
//! The set of writable paths is passed as the list of everything else, to be
//! made read-only.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::{Backend, Placement, PreparedRoot};
use crate::err::{Error, Result};
use crate::policy::{readonly_complement, MountMode, Plan};
use crate::proc::{Exec, Spawn};
use crate::registry::LINUX_USER_CHROOT;
use crate::spec::{ExecutionResult, Network, SandboxSpec};
use crate::tempdir::TempDir;
use crate::util;

#[derive(Debug, Clone, Default)]
pub struct HelperBackend {
    explicit: Option<PathBuf>,
    search: Vec<PathBuf>,
}

impl HelperBackend {
    /// Search for `linux-user-chroot` in these directories
    pub fn new<I, P>(search: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        HelperBackend {
            explicit: None,
            search: search.into_iter().map(Into::into).collect(),
        }
    }

    /// Use this executable instead of searching
    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.explicit = Some(program.into());
        self
    }

    /// Full path of the helper executable
    pub fn locate(&self) -> Result<PathBuf> {
        let found = match &self.explicit {
            Some(prog) => util::find_program(prog, &self.search),
            None => util::find_program(LINUX_USER_CHROOT, &self.search),
        };
        found.ok_or_else(|| {
            let name = self
                .explicit
                .as_deref()
                .unwrap_or_else(|| Path::new(LINUX_USER_CHROOT));
            Error::unavailable(
                LINUX_USER_CHROOT,
                format!("{} not found, or not executable", name.display()),
            )
        })
    }
}

/// Path inside the sandbox for a host path under `root`
fn inside(root: &Path, host: &Path) -> PathBuf {
    match host.strip_prefix(root) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => host.to_path_buf(),
    }
}

/// Full helper command line.
///
/// Tmpfs mounts are imitated by binding fresh directories created beneath `tmpfs_dir`.
pub fn command_line(
    helper: &Path,
    spec: &SandboxSpec,
    root: &PreparedRoot<'_>,
    tmpfs_dir: &Path,
) -> Result<Vec<OsString>> {
    let plan: &Plan = root.plan;
    let mut argv: Vec<OsString> = vec![helper.into()];

    if spec.network == Network::Isolated {
        argv.push("--unshare-net".into());
    }
    if let Some(cwd) = &root.cwd {
        argv.push("--chdir".into());
        argv.push(cwd.into());
    }

    if let Some(writable) = plan.writable() {
        for rel in readonly_complement(plan.rootfs(), writable).map_err(Error::into_mount)? {
            argv.push("--mount-readonly".into());
            argv.push(rel.into());
        }
    }

    for op in plan.extra() {
        let dest = inside(plan.rootfs(), &op.target);
        let source = match op.mode {
            MountMode::Proc => {
                argv.push("--mount-proc".into());
                argv.push(dest.into());
                continue;
            }
            MountMode::Tmpfs => {
                let rel = dest.strip_prefix("/").unwrap_or(&dest);
                let fake = tmpfs_dir.join(rel);
                std::fs::create_dir_all(&fake)
                    .map_err(|e| Error::file("mkdir", &fake, e).into_mount())?;
                fake
            }
            MountMode::BindReadonly | MountMode::BindWritable => op.source.clone(),
        };
        argv.push("--mount-bind".into());
        argv.push(source.into());
        argv.push(dest.into());
    }

    argv.push(plan.rootfs().into());
    argv.extend(spec.command.iter().map(OsString::from));
    Ok(argv)
}

impl Backend for HelperBackend {
    fn name(&self) -> &str {
        LINUX_USER_CHROOT
    }

    fn check_available(&self) -> Result<()> {
        self.locate().map(|prog| debug!("helper {}", prog.display()))
    }

    fn placement(&self) -> Placement {
        Placement::Namespace
    }

    fn supports(&self, _spec: &SandboxSpec) -> Result<()> {
        // both Undefined and Isolated
        Ok(())
    }

    fn execute(&self, spec: &SandboxSpec, root: &PreparedRoot<'_>) -> Result<ExecutionResult> {
        let helper = self.locate()?;
        // removed once the helper has exited
        let tmpfs = TempDir::for_user("sandbox.tmpfs")?;
        let argv = command_line(&helper, spec, root, tmpfs.path())?;
        debug!("{:?}", argv);

        let mut exec = Exec::new(&helper)?;
        exec.args(&argv)?.envs(&spec.env)?;

        let mut spawn = Spawn::new(&exec);
        spawn.stdout(spec.stdout).stderr(spec.stderr);

        let child = spawn.spawn()?;
        info!("{} running {}", child.id(), helper.display());
        let out = child.collect(root.timeout, root.kill_grace)?;
        debug!("helper exit {}", out.code);
        Ok(out.into())
    }
}
