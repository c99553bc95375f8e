#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sandbox::util::{self, Cap, CAP_SYS_ADMIN, CAP_SYS_CHROOT};

/// Host directories made visible, read-only, inside a `Rootfs`
const HOST: &[&str] = &["bin", "sbin", "lib", "lib32", "lib64", "libx32", "usr"];

/// chroot() and mount() are both needed
pub fn privileged() -> bool {
    match Cap::current() {
        Ok(cap) if cap.effective(CAP_SYS_CHROOT) && cap.effective(CAP_SYS_ADMIN) => true,
        _ => {
            eprintln!("Skipping, needs CAP_SYS_CHROOT and CAP_SYS_ADMIN (run as root)");
            false
        }
    }
}

pub fn helper() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let found = util::find_program("linux-user-chroot", std::env::split_paths(&path));
    if found.is_none() {
        eprintln!("Skipping, linux-user-chroot not found");
    }
    found
}

/// Minimal root filesystem borrowing the host's programs and libraries
pub struct Rootfs {
    dir: tempfile::TempDir,
    mounts: Vec<PathBuf>,
}

impl Rootfs {
    pub fn new() -> Rootfs {
        let dir = tempfile::Builder::new()
            .prefix("rootfs")
            .tempdir()
            .unwrap();
        let mut rootfs = Rootfs {
            dir,
            mounts: vec![],
        };
        for name in HOST {
            let host = Path::new("/").join(name);
            let inner = rootfs.path().join(name);
            if let Ok(target) = std::fs::read_link(&host) {
                // merged /usr
                std::os::unix::fs::symlink(target, &inner).unwrap();
            } else if host.is_dir() {
                std::fs::create_dir(&inner).unwrap();
                util::mount(&host, &inner, "", libc::MS_BIND | libc::MS_REC).unwrap();
                rootfs.mounts.push(inner.clone());
                util::mount(
                    "none",
                    &inner,
                    "",
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY,
                )
                .unwrap();
            }
        }
        for dir in ["etc", "tmp", "work", "work/sub"] {
            std::fs::create_dir(rootfs.path().join(dir)).unwrap();
        }
        std::fs::write(rootfs.path().join("etc/hostname"), "sandbox\n").unwrap();
        rootfs
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Mount entries at or below the rootfs, as (mount ID, mount point), in mount order
    pub fn mount_ids(&self) -> Vec<(u64, PathBuf)> {
        let info = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
        info.lines()
            .filter_map(|line| {
                let mut fields = line.split_ascii_whitespace();
                let id = fields.next()?.parse().ok()?;
                // skip parent, dev and root
                let mp = fields.nth(3)?.replace("\\040", " ");
                Some((id, PathBuf::from(mp)))
            })
            .filter(|(_, mp)| mp.starts_with(self.path()))
            .collect()
    }
}

impl Drop for Rootfs {
    fn drop(&mut self) {
        for mp in self.mounts.iter().rev() {
            if let Err(err) = util::umount_lazy(mp) {
                eprintln!("{}", err);
            }
        }
    }
}

pub fn path_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
    env
}

/// Shell snippet: exit 0 and print "X exists", or exit 2 and print "Did not find X."
pub fn exists_check(path: &str) -> Vec<String> {
    vec![
        "/bin/sh".into(),
        "-c".into(),
        format!(
            "if [ -e '{0}' ]; then echo '{0} exists'; exit 0; else echo 'Did not find {0}.'; exit 2; fi",
            path
        ),
    ]
}
