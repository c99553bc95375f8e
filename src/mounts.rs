//! Apply and revert mount operations
//!
//! Everything done is recorded so that it can be undone in reverse order,
//! including mount points which had to be created.

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use super::err::{CleanupError, Error, Result};
use super::fs::Mounts;
use super::policy::{MountMode, MountOperation};
use super::util;

/// Flags carried over when remounting a bind mount
const PRESERVE: libc::c_ulong = libc::MS_NOSUID
    | libc::MS_NODEV
    | libc::MS_NOEXEC
    | libc::MS_NOATIME
    | libc::MS_NODIRATIME
    | libc::MS_RELATIME;

/// The mount syscalls needed by `MountManager`
pub trait Mounter {
    /// Recursive bind mount
    fn bind(&self, source: &Path, target: &Path) -> Result<()>;
    /// Change an existing bind mount to read-only, or read-write
    fn remount(&self, target: &Path, readonly: bool) -> Result<()>;
    fn tmpfs(&self, target: &Path) -> Result<()>;
    fn proc(&self, target: &Path) -> Result<()>;
    /// Lazy unmount
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mounts in the namespace of this process
#[derive(Debug, Default, Clone, Copy)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        util::mount(source, target, "", libc::MS_BIND | libc::MS_REC)
    }

    fn remount(&self, target: &Path, readonly: bool) -> Result<()> {
        // a locked flag may not be cleared.  Same-device binds are invisible to
        // find_mount_point(), so these are the flags of the host mount beneath.
        let current = Mounts::current()?;
        let mut flags = current.lookup(target)?.options & PRESERVE;
        flags |= libc::MS_REMOUNT | libc::MS_BIND;
        if readonly {
            flags |= libc::MS_RDONLY;
        }
        util::mount("none", target, "", flags)
    }

    fn tmpfs(&self, target: &Path) -> Result<()> {
        util::mount("none", target, "tmpfs", 0)
    }

    fn proc(&self, target: &Path) -> Result<()> {
        util::mount(
            "proc",
            target,
            "proc",
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
        )
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        util::umount_lazy(target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Mounted(PathBuf),
    CreatedDir(PathBuf),
    CreatedFile(PathBuf),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Mounted(p) => write!(f, "mount {}", p.display()),
            Action::CreatedDir(p) => write!(f, "directory {}", p.display()),
            Action::CreatedFile(p) => write!(f, "file {}", p.display()),
        }
    }
}

#[derive(Debug)]
struct Entry {
    action: Action,
    reverted: bool,
}

/// Applies `MountOperation`s through a `Mounter`
#[derive(Debug, Default)]
pub struct MountManager<M: Mounter = SysMounter> {
    mounter: M,
}

impl MountManager<SysMounter> {
    pub fn new() -> Self {
        Self::with_mounter(SysMounter)
    }
}

impl<M: Mounter> MountManager<M> {
    pub fn with_mounter(mounter: M) -> Self {
        MountManager { mounter }
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// Perform all operations, in order.
    ///
    /// On failure, whatever was done is reverted before returning `Error::Mount`.
    pub fn apply(&self, ops: &[MountOperation]) -> Result<Applied<'_, M>> {
        info!("applying {} mount operation(s)", ops.len());
        let mut applied = Applied::new(&self.mounter);
        for op in ops {
            if let Err(err) = applied.perform(op) {
                error!("{} failed: {}", op, err);
                let cleanup = applied.revert().err();
                return Err(err.into_mount().with_cleanup(cleanup));
            }
        }
        Ok(applied)
    }

    /// Only create missing mount points.  For backends which mount in their own namespace.
    pub fn stage(&self, ops: &[MountOperation]) -> Result<Applied<'_, M>> {
        let mut applied = Applied::new(&self.mounter);
        for op in ops {
            if let Err(err) = applied.create_target(op) {
                let cleanup = applied.revert().err();
                return Err(err.into_mount().with_cleanup(cleanup));
            }
        }
        Ok(applied)
    }

    /// Same as `Applied::revert()`
    pub fn revert(&self, applied: &mut Applied<'_, M>) -> std::result::Result<(), CleanupError> {
        applied.revert()
    }
}

/// Record of mounts made and paths created.
///
/// Reverted when dropped, if not before.
pub struct Applied<'m, M: Mounter> {
    mounter: &'m M,
    entries: Vec<Entry>,
}

impl<'m, M: Mounter> Applied<'m, M> {
    fn new(mounter: &'m M) -> Self {
        Applied {
            mounter,
            entries: vec![],
        }
    }

    fn record(&mut self, action: Action) {
        debug!("record {}", action);
        self.entries.push(Entry {
            action,
            reverted: false,
        });
    }

    /// Make sure the target of this operation exists
    fn create_target(&mut self, op: &MountOperation) -> Result<()> {
        if op.target.symlink_metadata().is_ok() {
            return Ok(());
        }
        let file = matches!(op.mode, MountMode::BindReadonly | MountMode::BindWritable)
            && op.source.is_file();
        let dir = if file {
            op.target.parent().unwrap_or(&op.target)
        } else {
            op.target.as_path()
        };

        // parents first
        let mut missing = vec![];
        for anc in dir.ancestors() {
            if anc.symlink_metadata().is_ok() {
                break;
            }
            missing.push(anc);
        }
        for path in missing.into_iter().rev() {
            util::mkdir(path)?;
            self.record(Action::CreatedDir(path.to_path_buf()));
        }
        if file {
            util::touch(&op.target)?;
            self.record(Action::CreatedFile(op.target.clone()));
        }
        Ok(())
    }

    fn perform(&mut self, op: &MountOperation) -> Result<()> {
        debug!("perform {}", op);
        self.create_target(op)?;
        match op.mode {
            MountMode::Tmpfs => {
                self.mounter.tmpfs(&op.target)?;
                self.record(Action::Mounted(op.target.clone()));
            }
            MountMode::Proc => {
                self.mounter.proc(&op.target)?;
                self.record(Action::Mounted(op.target.clone()));
            }
            MountMode::BindReadonly | MountMode::BindWritable => {
                self.mounter.bind(&op.source, &op.target)?;
                self.record(Action::Mounted(op.target.clone()));
                self.mounter
                    .remount(&op.target, op.mode == MountMode::BindReadonly)?;
            }
        }
        Ok(())
    }

    /// Number of mounts and paths which have not been reverted
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.reverted).count()
    }

    /// Undo everything, newest first.  Later calls do nothing.
    ///
    /// Does not stop at the first failure.
    pub fn revert(&mut self) -> std::result::Result<(), CleanupError> {
        let mut failures = CleanupError::new();
        let mounter = self.mounter;
        for entry in self.entries.iter_mut().rev() {
            if entry.reverted {
                continue;
            }
            // not retried
            entry.reverted = true;
            let ret = match &entry.action {
                Action::Mounted(p) => mounter.unmount(p),
                Action::CreatedDir(p) => util::rmdir(p),
                Action::CreatedFile(p) => util::unlink(p),
            };
            if let Err(err) = ret {
                warn!("Unable to revert {} : {}", entry.action, err);
                failures.push(err);
            }
        }
        match failures.into_option() {
            None => Ok(()),
            Some(failures) => Err(failures),
        }
    }
}

impl<'m, M: Mounter> Drop for Applied<'m, M> {
    fn drop(&mut self) {
        if self.pending() > 0 {
            if let Err(err) = self.revert() {
                error!("{}", err);
            }
        }
    }
}

impl<'m, M: Mounter> fmt::Debug for Applied<'m, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.action, e.reverted)))
            .finish()
    }
}
