//! Run one command in a sandbox, from validation through teardown.

use std::fmt;
use std::path::PathBuf;

use log::{debug, info, warn};

use super::backend::{Backend, Placement, PreparedRoot};
use super::config::Config;
use super::err::{CleanupError, Result};
use super::mounts::{Applied, MountManager, Mounter, SysMounter};
use super::policy::{self, Plan};
use super::registry::BackendRegistry;
use super::spec::{Outcome, SandboxSpec};

/// Progress of a single `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Mounting,
    Executing,
    Capturing,
    Unmounting,
    Done,
    Aborting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Validating => "validating",
            Phase::Mounting => "mounting",
            Phase::Executing => "executing",
            Phase::Capturing => "capturing",
            Phase::Unmounting => "unmounting",
            Phase::Done => "done",
            Phase::Aborting => "aborting",
        };
        f.write_str(name)
    }
}

struct Progress<'a> {
    command: &'a str,
    phase: Phase,
}

impl<'a> Progress<'a> {
    fn new(command: &'a str) -> Self {
        let phase = Phase::Validating;
        info!("{}: {}", command, phase);
        Progress { command, phase }
    }

    fn enter(&mut self, next: Phase) {
        debug!("{}: {} -> {}", self.command, self.phase, next);
        if next == Phase::Aborting {
            warn!("{}: {} while {}", self.command, next, self.phase);
        } else {
            info!("{}: {}", self.command, next);
        }
        self.phase = next;
    }
}

/// Everything which must be undone before `run()` returns
struct SandboxHandle<'m, M: Mounter> {
    applied: Option<Applied<'m, M>>,
}

impl<'m, M: Mounter> SandboxHandle<'m, M> {
    fn setup(placement: Placement, manager: &'m MountManager<M>, plan: &Plan) -> Result<Self> {
        let applied = match placement {
            Placement::Host => manager.apply(plan.operations())?,
            Placement::Namespace => manager.stage(plan.extra())?,
        };
        Ok(SandboxHandle {
            applied: Some(applied),
        })
    }

    fn release(&mut self, manager: &MountManager<M>) -> Option<CleanupError> {
        self.applied
            .take()
            .and_then(|mut applied| manager.revert(&mut applied).err())
    }
}

/// Validates requests, prepares the rootfs, and dispatches to a backend.
pub struct SandboxRunner<M: Mounter = SysMounter> {
    registry: BackendRegistry,
    manager: MountManager<M>,
    config: Config,
}

impl SandboxRunner<SysMounter> {
    pub fn new(config: Config) -> Self {
        Self::with_mounter(config, SysMounter)
    }

    /// Configured from the process environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Config::from_env()?))
    }
}

impl<M: Mounter> SandboxRunner<M> {
    pub fn with_mounter(config: Config, mounter: M) -> Self {
        SandboxRunner {
            registry: BackendRegistry::new(&config),
            manager: MountManager::with_mounter(mounter),
            config,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn backend_for(&self, spec: &SandboxSpec) -> Result<&dyn Backend> {
        if spec.backend.is_empty() {
            self.registry.default_backend()
        } else {
            self.registry.lookup(&spec.backend)
        }
    }

    /// Everything which can be rejected without touching the rootfs
    fn validate(&self, spec: &SandboxSpec) -> Result<(&dyn Backend, Plan, Option<PathBuf>)> {
        spec.validate()?;
        let backend = self.backend_for(spec)?;
        backend.supports(spec)?;
        let cwd = spec.sandbox_cwd()?;
        let plan = policy::plan(&spec.rootfs, &spec.writable, &spec.extra_mounts)?;
        backend.check_available()?;
        backend.check_plan(&plan)?;
        Ok((backend, plan, cwd))
    }

    /// Run a command to completion.
    ///
    /// A non-zero exit is not an error.  Mounts made for the command are always
    /// removed before returning, and any failure to do so is reported either in
    /// `Outcome::cleanup` or, when the run failed anyway, in `Error::Unclean`.
    pub fn run(&self, spec: &SandboxSpec) -> Result<Outcome> {
        let command = spec.command.first().map(String::as_str).unwrap_or_default();
        let mut progress = Progress::new(command);

        let (backend, plan, cwd) = self.validate(spec).map_err(|err| {
            progress.enter(Phase::Aborting);
            err
        })?;
        debug!("backend {} for {:?}", backend.name(), spec.command);

        progress.enter(Phase::Mounting);
        let mut handle =
            SandboxHandle::setup(backend.placement(), &self.manager, &plan).map_err(|err| {
                progress.enter(Phase::Aborting);
                err
            })?;

        progress.enter(Phase::Executing);
        let prepared = PreparedRoot {
            plan: &plan,
            cwd,
            timeout: spec.timeout.or(self.config.timeout),
            kill_grace: self.config.kill_grace,
        };
        let result = backend
            .execute(spec, &prepared)
            .map_err(|err| err.into_execution(command));
        match &result {
            Ok(_) => progress.enter(Phase::Capturing),
            Err(_) => progress.enter(Phase::Aborting),
        }

        progress.enter(Phase::Unmounting);
        let cleanup = handle.release(&self.manager);
        if let Some(cleanup) = &cleanup {
            warn!("{}", cleanup);
        }

        match result {
            Ok(result) => {
                progress.enter(Phase::Done);
                Ok(Outcome { result, cleanup })
            }
            Err(err) => Err(err.with_cleanup(cleanup)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::Error;
    use crate::registry::LINUX_USER_CHROOT;
    use crate::spec::{ExtraMount, Network, Redirect, WritablePaths};
    use crate::tempdir::TempDir;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;
    use std::time::Duration;

    /// Stand-in for linux-user-chroot
    fn fake_helper(dir: &Path, body: &str) -> PathBuf {
        let prog = dir.join("fake-helper");
        std::fs::write(&prog, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&prog, std::fs::Permissions::from_mode(0o755)).unwrap();
        prog
    }

    fn runner(helper: PathBuf) -> SandboxRunner {
        SandboxRunner::new(Config {
            helper: Some(helper),
            ..Config::default()
        })
    }

    #[test]
    fn unknown_backend() {
        let tdir = TempDir::new().unwrap();
        let spec = SandboxSpec::new(tdir.path(), ["true"]).backend("jail");
        let err = SandboxRunner::new(Config::default()).run(&spec).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{}", err);
    }

    #[test]
    fn chroot_refuses_network_isolation() {
        let tdir = TempDir::new().unwrap();
        let spec = SandboxSpec::new(tdir.path(), ["true"]).network(Network::Isolated);
        let err = SandboxRunner::new(Config::default()).run(&spec).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{}", err);
    }

    #[test]
    fn escapes() {
        let tdir = TempDir::new().unwrap();
        let run = SandboxRunner::new(Config::default());
        let spec = SandboxSpec::new(tdir.path(), ["true"]).cwd("../..");
        assert!(matches!(run.run(&spec), Err(Error::Config(_))));
        let spec = SandboxSpec::new(tdir.path(), ["true"]).writable(WritablePaths::only(["../"]));
        assert!(matches!(run.run(&spec), Err(Error::Config(_))));
    }

    #[test]
    fn helper_unavailable() {
        let tdir = TempDir::new().unwrap();
        let spec = SandboxSpec::new(tdir.path(), ["true"]).backend(LINUX_USER_CHROOT);
        let err = runner(tdir.path().join("missing")).run(&spec).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }), "{}", err);
    }

    #[test]
    fn helper_arguments() {
        let bin = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        std::fs::create_dir(rootfs.path().join("etc")).unwrap();
        let root = rootfs.path().canonicalize().unwrap();

        let helper = fake_helper(bin.path(), r#"echo "$@"; echo "FOO=$FOO" >&2; exit 3"#);
        let spec = SandboxSpec::new(rootfs.path(), ["echo", "hello"])
            .backend(LINUX_USER_CHROOT)
            .env("FOO", "bar")
            .cwd("etc")
            .writable(WritablePaths::none())
            .mount(ExtraMount::tmpfs("scratch"));

        let outcome = runner(helper).run(&spec).unwrap();
        assert!(outcome.cleanup.is_none());
        let result = outcome.result;
        assert_eq!(result.exit_code(), 3);
        assert!(!result.timed_out());
        let out = String::from_utf8_lossy(result.stdout()).into_owned();
        assert!(
            out.starts_with("--chdir /etc --mount-readonly /. --mount-bind "),
            "{}",
            out
        );
        assert!(
            out.trim_end()
                .ends_with(&format!("/scratch {} echo hello", root.display())),
            "{}",
            out
        );
        assert_eq!(result.stderr(), b"FOO=bar\n");
        // staged mount point removed again
        assert!(!root.join("scratch").exists());
    }

    #[test]
    fn helper_output_to_descriptor() {
        let bin = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let log = bin.path().join("log");
        let file = std::fs::File::create(&log).unwrap();

        let helper = fake_helper(bin.path(), "echo out; echo err >&2; exit 0");
        let spec = SandboxSpec::new(rootfs.path(), ["true"])
            .backend(LINUX_USER_CHROOT)
            .stdout(Redirect::Fd(file.as_raw_fd()))
            .stderr(Redirect::ToStdout);
        let outcome = runner(helper).run(&spec).unwrap();
        assert_eq!(outcome.result.exit_code(), 0);
        assert!(outcome.result.stdout().is_empty());
        drop(file);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "out\nerr\n");
    }

    #[test]
    fn helper_timeout() {
        let bin = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let helper = fake_helper(bin.path(), "exec sleep 30");
        let spec = SandboxSpec::new(rootfs.path(), ["true"])
            .backend(LINUX_USER_CHROOT)
            .env("PATH", "/usr/bin:/bin")
            .timeout(Duration::from_millis(200));

        let outcome = runner(helper).run(&spec).unwrap();
        assert!(outcome.result.timed_out());
        assert_eq!(outcome.result.exit_code(), -libc::SIGTERM);
    }
}
