use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod err;
pub use err::{CleanupError, Error, Result};

mod capability;

pub mod config;
pub use config::Config;

pub mod fs;
pub mod logging;
pub mod tempdir;
pub mod util;

pub mod proc;

mod spec;
pub use spec::*;

pub mod policy;
pub use policy::{MountMode, MountOperation, Plan};

pub mod mounts;
pub use mounts::{MountManager, Mounter, SysMounter};

pub mod backend;
pub use backend::{Backend, Placement};

pub mod registry;
pub use registry::{BackendKind, BackendRegistry, CHROOT, LINUX_USER_CHROOT};

mod runner;
pub use runner::*;

/// Run `command` inside `rootfs` with the given backend, and wait for it.
///
/// An empty `writable_paths` leaves the whole rootfs as it is.
/// Use `SandboxSpec` with `WritablePaths::none()` to make everything read-only.
/// Configured from the process environment.  A teardown failure is `Error::Cleanup`,
/// which still holds the result.
pub fn run_sandbox<P: AsRef<Path>>(
    rootfs: P,
    command: &[&str],
    backend: &str,
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    writable_paths: &[PathBuf],
) -> Result<ExecutionResult> {
    let mut spec = SandboxSpec::new(rootfs.as_ref(), command.iter().copied()).backend(backend);
    if let Some(cwd) = cwd {
        spec = spec.cwd(cwd);
    }
    spec.env = env.clone();
    if !writable_paths.is_empty() {
        spec = spec.writable(WritablePaths::only(writable_paths.iter().cloned()));
    }
    SandboxRunner::from_env()?.run(&spec)?.into_result()
}

/// Run `spec`, with its output sent wherever `spec.stdout` and `spec.stderr` say,
/// and return only the exit code.  Anything captured is dropped.
pub fn run_sandbox_with_redirection(spec: &SandboxSpec) -> Result<i32> {
    let result = SandboxRunner::from_env()?.run(spec)?.into_result()?;
    Ok(result.exit_code())
}
