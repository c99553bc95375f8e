//! Decide which mounts make up the view of the rootfs seen by the sandboxed command.
//!
//! With `WritablePaths::Only`, the rootfs is bound onto itself read-only, and each
//! writable path is then bound onto itself again, writable.  Extra mounts come first
//! so that they are carried along by the recursive read-only bind.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use walkdir::WalkDir;

use super::err::{Error, Result};
use super::fs::normalize_relative;
use super::spec::{ExtraMount, ExtraMountKind, WritablePaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    BindWritable,
    BindReadonly,
    Tmpfs,
    Proc,
}

/// One step of filesystem setup.  Host paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOperation {
    pub source: PathBuf,
    pub target: PathBuf,
    pub mode: MountMode,
}

impl MountOperation {
    pub fn new<A: Into<PathBuf>, B: Into<PathBuf>>(source: A, target: B, mode: MountMode) -> Self {
        MountOperation {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }
}

impl fmt::Display for MountOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            MountMode::Tmpfs => write!(f, "tmpfs on {}", self.target.display()),
            MountMode::Proc => write!(f, "proc on {}", self.target.display()),
            MountMode::BindReadonly => write!(
                f,
                "bind {} on {} (ro)",
                self.source.display(),
                self.target.display()
            ),
            MountMode::BindWritable => write!(
                f,
                "bind {} on {} (rw)",
                self.source.display(),
                self.target.display()
            ),
        }
    }
}

/// Ordered mount operations for one rootfs
#[derive(Debug, Clone)]
pub struct Plan {
    rootfs: PathBuf,
    ops: Vec<MountOperation>,
    extra: usize,
    writable: Option<Vec<PathBuf>>,
}

impl Plan {
    /// Canonical rootfs path
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// All operations, in the order they are to be applied
    pub fn operations(&self) -> &[MountOperation] {
        &self.ops
    }

    /// The leading operations which come from extra mounts
    pub fn extra(&self) -> &[MountOperation] {
        &self.ops[..self.extra]
    }

    /// Host paths left writable.  None when the whole rootfs is.
    pub fn writable(&self) -> Option<&[PathBuf]> {
        self.writable.as_deref()
    }
}

/// Resolve a rootfs path.  It must be an existing directory.
pub fn canonical_rootfs<P: AsRef<Path>>(rootfs: P) -> Result<PathBuf> {
    let root = rootfs.as_ref();
    let canon = root.canonicalize().map_err(|e| {
        Error::config(format!("rootfs {} : {}", root.display(), e))
    })?;
    if !canon.is_dir() {
        return Err(Error::config(format!(
            "rootfs {} is not a directory",
            root.display()
        )));
    }
    Ok(canon)
}

/// Map a writable path request to an existing host path inside `root`.
///
/// `root` must be canonical.
fn resolve_writable(root: &Path, req: &Path) -> Result<PathBuf> {
    let joined = if req.is_absolute() && req.starts_with(root) {
        req.to_path_buf()
    } else if req.is_absolute() {
        return Err(Error::config(format!(
            "writable path {} is outside of rootfs {}",
            req.display(),
            root.display()
        )));
    } else {
        let rel = normalize_relative(req).ok_or_else(|| {
            Error::config(format!("writable path {} escapes the rootfs", req.display()))
        })?;
        root.join(rel)
    };
    // follow symlinks, which must also stay inside
    let canon = joined.canonicalize().map_err(|e| {
        Error::config(format!("writable path {} : {}", req.display(), e))
    })?;
    if !canon.starts_with(root) {
        return Err(Error::config(format!(
            "writable path {} resolves to {} outside of rootfs",
            req.display(),
            canon.display()
        )));
    }
    Ok(canon)
}

/// Drop duplicates, and any path beneath another.
pub fn subsume(paths: BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = vec![];
    // sorted, so an ancestor is always visited before its descendants
    for path in paths {
        if kept.iter().any(|anc| path.starts_with(anc)) {
            debug!("{} subsumed", path.display());
            continue;
        }
        kept.push(path);
    }
    kept
}

/// Host path for a mount point inside `root`, which may not exist yet.
///
/// The deepest existing ancestor is resolved, following symlinks, and must stay
/// within `root`.  The missing remainder is appended to that.
fn contained_mount_point(root: &Path, rel: &Path, req: &Path) -> Result<PathBuf> {
    let joined = root.join(rel);
    let mut existing = joined.as_path();
    let mut missing = vec![];
    while existing.symlink_metadata().is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    let canon = existing.canonicalize().map_err(|e| {
        Error::config(format!("mount point {} : {}", req.display(), e))
    })?;
    if !canon.starts_with(root) {
        return Err(Error::config(format!(
            "mount point {} resolves to {} outside of rootfs",
            req.display(),
            canon.display()
        )));
    }
    let target = missing.iter().rev().fold(canon, |path, name| path.join(name));
    if target == root {
        return Err(Error::config("can not mount over the rootfs itself"));
    }
    if target != joined {
        debug!("mount point {} is {}", req.display(), target.display());
    }
    Ok(target)
}

fn extra_operation(root: &Path, extra: &ExtraMount) -> Result<MountOperation> {
    let rel = normalize_relative(&extra.target).ok_or_else(|| {
        Error::config(format!(
            "mount point {} escapes the rootfs",
            extra.target.display()
        ))
    })?;
    let target = contained_mount_point(root, &rel, &extra.target)?;
    Ok(match extra.kind {
        ExtraMountKind::Tmpfs => MountOperation::new("none", target, MountMode::Tmpfs),
        ExtraMountKind::Proc => MountOperation::new("proc", target, MountMode::Proc),
        ExtraMountKind::Bind => {
            let source = extra
                .source
                .as_ref()
                .ok_or_else(|| Error::config("bind mount needs a source"))?;
            let source = source.canonicalize().map_err(|e| {
                Error::config(format!("mount source {} : {}", source.display(), e))
            })?;
            MountOperation::new(source, target, MountMode::BindWritable)
        }
    })
}

/// Compute the mount operations needed for a rootfs.
///
/// Fails with `Error::Config` for a missing rootfs, a writable path which does not
/// exist, or any path which escapes the rootfs.
pub fn plan<P: AsRef<Path>>(
    rootfs: P,
    writable: &WritablePaths,
    extra_mounts: &[ExtraMount],
) -> Result<Plan> {
    let root = canonical_rootfs(rootfs)?;

    let mut ops = extra_mounts
        .iter()
        .map(|extra| extra_operation(&root, extra))
        .collect::<Result<Vec<_>>>()?;
    let nextra = ops.len();

    let writable = match writable {
        WritablePaths::All => None,
        WritablePaths::Only(reqs) => {
            let resolved = reqs
                .iter()
                .map(|req| resolve_writable(&root, req))
                .collect::<Result<BTreeSet<_>>>()?;
            let kept = subsume(resolved);

            if kept.iter().any(|p| p == &root) {
                debug!("whole rootfs writable");
            } else {
                ops.push(MountOperation::new(&root, &root, MountMode::BindReadonly));
                for path in &kept {
                    ops.push(MountOperation::new(path, path, MountMode::BindWritable));
                }
            }
            Some(kept)
        }
    };

    for op in &ops {
        debug!("plan: {}", op);
    }

    Ok(Plan {
        rootfs: root,
        ops,
        extra: nextra,
        writable,
    })
}

/// List entries under `rootfs` which are not writable, as paths relative to `rootfs`
/// with a leading '/'.  The rootfs itself is "/.".
///
/// Directories are not descended into unless some writable path lies beneath them,
/// so each result implies everything below it.  Symlinks are never listed.
/// `writable` are host paths within `rootfs`.
pub fn readonly_complement<P: AsRef<Path>>(rootfs: P, writable: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let root = rootfs.as_ref();
    let mut found = vec![];

    let mut walk = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walk.next() {
        let entry = entry.map_err(|e| {
            let name = e.path().unwrap_or(root).to_path_buf();
            Error::file("walk", name, e.into())
        })?;
        let path = entry.path();
        let isdir = entry.file_type().is_dir();

        if writable.iter().any(|w| w == path) {
            if isdir {
                walk.skip_current_dir();
            }
            continue;
        }
        if isdir && writable.iter().any(|w| w.starts_with(path)) {
            // some descendants must stay writable
            continue;
        }
        if !entry.path_is_symlink() {
            found.push(path.to_path_buf());
        }
        if isdir {
            walk.skip_current_dir();
        }
    }

    // byte order of the full paths
    found.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

    Ok(found
        .into_iter()
        .map(|p| match p.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("/."),
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => p,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tempdir::TempDir;
    use std::fs;

    fn rootfs() -> TempDir {
        let tdir = TempDir::new().unwrap();
        for dir in ["bin", "etc", "home/user/build", "home/other", "var/tmp"] {
            fs::create_dir_all(tdir.path().join(dir)).unwrap();
        }
        fs::write(tdir.path().join("etc/passwd"), "root").unwrap();
        fs::write(tdir.path().join("home/user/notes"), "x").unwrap();
        std::os::unix::fs::symlink("/etc", tdir.path().join("home/escape")).unwrap();
        std::os::unix::fs::symlink("bin", tdir.path().join("sbin")).unwrap();
        tdir
    }

    #[test]
    fn unspecified_means_no_mounts() {
        let tdir = rootfs();
        let plan = plan(tdir.path(), &WritablePaths::All, &[]).unwrap();
        assert!(plan.operations().is_empty());
        assert!(plan.writable().is_none());
    }

    #[test]
    fn empty_means_readonly() {
        let tdir = rootfs();
        let root = tdir.path().canonicalize().unwrap();
        let plan = plan(tdir.path(), &WritablePaths::none(), &[]).unwrap();
        assert_eq!(
            plan.operations(),
            &[MountOperation::new(&root, &root, MountMode::BindReadonly)]
        );
        assert_eq!(plan.writable(), Some(&[][..]));
    }

    #[test]
    fn subsumed_paths_dropped() {
        let tdir = rootfs();
        let root = tdir.path().canonicalize().unwrap();
        let req = WritablePaths::only(["home/user/build", "home/user", "./home/user/", "var/tmp"]);
        let plan = plan(tdir.path(), &req, &[]).unwrap();
        let user = root.join("home/user");
        let vartmp = root.join("var/tmp");
        assert_eq!(
            plan.operations(),
            &[
                MountOperation::new(&root, &root, MountMode::BindReadonly),
                MountOperation::new(&user, &user, MountMode::BindWritable),
                MountOperation::new(&vartmp, &vartmp, MountMode::BindWritable),
            ]
        );
        assert!(!plan
            .operations()
            .iter()
            .any(|op| op.target == root.join("home/user/build")));
    }

    #[test]
    fn absolute_inside_accepted() {
        let tdir = rootfs();
        let root = tdir.path().canonicalize().unwrap();
        let req = WritablePaths::only([root.join("var/tmp")]);
        let plan = plan(tdir.path(), &req, &[]).unwrap();
        assert_eq!(plan.writable(), Some(&[root.join("var/tmp")][..]));
    }

    #[test]
    fn root_subsumes_everything() {
        let tdir = rootfs();
        let req = WritablePaths::only([".", "etc"]);
        let plan = plan(tdir.path(), &req, &[]).unwrap();
        assert!(plan.operations().is_empty());
    }

    #[test]
    fn escapes_rejected() {
        let tdir = rootfs();
        for bad in ["../", "home/../../etc", "/etc", "home/escape", "missing"] {
            let err = plan(tdir.path(), &WritablePaths::only([bad]), &[]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{} -> {}", bad, err);
        }
    }

    #[test]
    fn missing_rootfs_rejected() {
        let err = plan("/nonexistent/rootfs", &WritablePaths::All, &[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{}", err);
    }

    #[test]
    fn extra_mounts_first() {
        let tdir = rootfs();
        let root = tdir.path().canonicalize().unwrap();
        let extra = [
            ExtraMount::tmpfs("/tmp"),
            ExtraMount::bind(root.join("etc"), "mnt/etc"),
            ExtraMount::proc("proc"),
        ];
        let plan = plan(tdir.path(), &WritablePaths::only(["var/tmp"]), &extra).unwrap();
        assert_eq!(plan.extra().len(), 3);
        assert_eq!(plan.operations().len(), 5);
        assert_eq!(plan.operations()[0].mode, MountMode::Tmpfs);
        assert_eq!(plan.operations()[0].target, root.join("tmp"));
        assert_eq!(plan.operations()[1].source, root.join("etc"));
        assert_eq!(plan.operations()[1].target, root.join("mnt/etc"));
        assert_eq!(
            plan.operations()[2],
            MountOperation::new("proc", root.join("proc"), MountMode::Proc)
        );
        assert_eq!(plan.operations()[3].mode, MountMode::BindReadonly);

        let err = super::plan(tdir.path(), &WritablePaths::All, &[ExtraMount::tmpfs("../x")])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{}", err);
    }

    #[test]
    fn extra_mount_symlinks_resolved() {
        let tdir = rootfs();
        let root = tdir.path().canonicalize().unwrap();
        let host = TempDir::new().unwrap();
        std::os::unix::fs::symlink(host.path(), tdir.path().join("run")).unwrap();

        for bad in ["run/scratch", "run", "home/escape/sub", "home/escape"] {
            let err = plan(tdir.path(), &WritablePaths::All, &[ExtraMount::tmpfs(bad)])
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{} -> {}", bad, err);
        }
        // nothing made on the host side
        assert_eq!(fs::read_dir(host.path()).unwrap().count(), 0);

        // a link which stays inside is followed
        let extra = [ExtraMount::tmpfs("sbin/extra/deeper")];
        let plan = plan(tdir.path(), &WritablePaths::All, &extra).unwrap();
        assert_eq!(plan.operations()[0].target, root.join("bin/extra/deeper"));

        std::os::unix::fs::symlink(".", tdir.path().join("self")).unwrap();
        let err = super::plan(tdir.path(), &WritablePaths::All, &[ExtraMount::tmpfs("self")])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{}", err);
    }

    #[test]
    fn complement_of_nothing_is_root() {
        let tdir = rootfs();
        let ro = readonly_complement(tdir.path(), &[]).unwrap();
        assert_eq!(ro, vec![PathBuf::from("/.")]);
    }

    #[test]
    fn complement() {
        let tdir = rootfs();
        let root = tdir.path().to_path_buf();
        let ro = readonly_complement(&root, &[root.join("home/user")]).unwrap();
        let expect: Vec<PathBuf> = ["/bin", "/etc", "/home/other", "/var"]
            .iter()
            .map(PathBuf::from)
            .collect();
        // symlinks /sbin and /home/escape are not listed
        assert_eq!(ro, expect);

        let ro = readonly_complement(&root, &[root.join("home/user/notes")]).unwrap();
        let expect: Vec<PathBuf> = ["/bin", "/etc", "/home/other", "/home/user/build", "/var"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(ro, expect);
    }

    #[test]
    fn complement_prefix_is_not_ancestor() {
        let tdir = rootfs();
        let root = tdir.path().to_path_buf();
        fs::create_dir_all(root.join("home/user2")).unwrap();
        let ro = readonly_complement(&root, &[root.join("home/user2")]).unwrap();
        assert!(ro.contains(&PathBuf::from("/home/user")), "{:?}", ro);
        assert!(!ro.contains(&PathBuf::from("/home/user2")), "{:?}", ro);
    }
}
