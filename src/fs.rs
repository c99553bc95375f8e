//! Filesystem utilities...

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::{fmt, fs};

use std::os::unix::fs::MetadataExt;

use log::{debug, warn};

use super::err::{Error, Result};

// like vec!() for a PathBuf
#[macro_export]
macro_rules! path {
    ($root:expr, $( $piece:expr ),*) => {
        {
            let mut temp = ::std::path::PathBuf::from($root);
            $(
                temp.push($piece);
            )*
            temp
        }
    }
}

/// Lexically resolve `.` and `..` in a relative path.
///
/// Returns None if `..` would climb above the starting point.
/// Leading `/` are ignored, so "/a/b" is treated as "a/b".
pub fn normalize_relative<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = vec![];
    for comp in path.as_ref().components() {
        match comp {
            Component::RootDir | Component::CurDir => (),
            Component::Prefix(_) => return None,
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(name) => parts.push(name),
        }
    }
    Some(parts.iter().collect())
}

/// Find the (parent) directory which is a mount point for this file/directory.
///
/// Returns either the provided `path` or a parent.
/// See src/find-mount-point.c in GNU coreutils
pub fn find_mount_point<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path
        .as_ref()
        .canonicalize()
        .map_err(|e| Error::file("canonicalize", &path, e))?;
    let s = fs::metadata(&path).map_err(|e| Error::file("metadata", &path, e))?;

    let mut dir = if s.file_type().is_dir() {
        path.as_path()
    } else {
        // canonicalize'd files always have a "parent"
        path.parent().unwrap_or(&path)
    };

    loop {
        if let Some(next) = dir.parent() {
            let nexts = fs::metadata(next).map_err(|e| Error::file("metadata", next, e))?;
            // assume nexts.ftype==FileType::Dir
            if s.dev() != nexts.dev() || s.ino() == nexts.ino() {
                // parent is a different mount point
                return Ok(dir.to_path_buf());
            }
            dir = next;
        } else {
            // reached root, assumed to be a mountpoint
            return Ok(dir.to_path_buf());
        }
    }
}

/// mountinfo escapes space, tab, newline and backslash as octal.  eg. "\040"
fn unescape(raw: &str) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let val = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|oct| u8::from_str_radix(oct, 8).ok());
            if let Some(val) = val {
                out.push(val);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(std::ffi::OsString::from_vec(out))
}

/// cf. `Documentation/filesystems/proc.txt` in the Linux kernel source tree.
#[derive(Debug)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    /// `MS_*` flags from the per-mount options
    pub options: libc::c_ulong,
    pub fstype: String,
    pub source: String,
}

impl fmt::Display for MountInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mount={} fstype={} source={}",
            self.mount_point.display(),
            self.fstype,
            self.source
        )
    }
}

/// A list of file system mount points
#[derive(Debug)]
pub struct Mounts {
    points: HashMap<PathBuf, MountInfo>,
}

impl Mounts {
    /// Mount points in the namespace of the current process
    pub fn current() -> Result<Mounts> {
        Self::create("self")
    }

    fn parse_line(line: &str) -> Result<MountInfo> {
        let mut liter = line.split_ascii_whitespace().peekable();

        // cf. Documentation/filesystems/proc.rst
        // lines like:
        // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
        // (0)(1)(2)   (3)   (4)      (5)      (6)   (7) (8)   (9)          (10)
        // where (6) may be repeated zero or more times.
        let _id = liter.next().ok_or(Error::BadStr)?.parse::<u64>()?;
        let _parent = liter.next().ok_or(Error::BadStr)?.parse::<u64>()?;
        let _dev = liter.next().ok_or(Error::BadStr)?;
        let _root = liter.next().ok_or(Error::BadStr)?;
        let mount_point = unescape(liter.next().ok_or(Error::BadStr)?);
        let opts = liter.next().ok_or(Error::BadStr)?;
        while let Some(next) = liter.peek() {
            if next == &"-" {
                // end of option fields
                break;
            }
            liter.next();
        }
        let sep = liter.next().ok_or(Error::BadStr)?;
        debug_assert_eq!(sep, "-");
        let fstype = liter.next().ok_or(Error::BadStr)?.into();
        let source = liter.next().ok_or(Error::BadStr)?.into();
        let _sopts = liter.next().ok_or(Error::BadStr)?;
        if liter.peek().is_some() {
            debug!("Ignoring extra mountinfo {:?}", line);
        }

        let mut options = 0;
        for opt in opts.split(',') {
            match opt {
                // cf. 'man 8 mount' and 'man 2 mount'
                "ro" => options |= libc::MS_RDONLY,
                "rw" => (),
                "noexec" => options |= libc::MS_NOEXEC,
                "nosuid" => options |= libc::MS_NOSUID,
                "nodev" => options |= libc::MS_NODEV,
                "noatime" => options |= libc::MS_NOATIME,
                "nodiratime" => options |= libc::MS_NODIRATIME,
                "relatime" => options |= libc::MS_RELATIME,
                "strictatime" => options |= libc::MS_STRICTATIME,
                _ => warn!("For {:?} ignore unknown option {:?}", opts, opt),
            }
        }

        Ok(MountInfo {
            mount_point,
            options,
            fstype,
            source,
        })
    }

    fn create(pid: &str) -> Result<Mounts> {
        let fname: PathBuf = ["/proc", pid, "mountinfo"].iter().collect();

        let contents = fs::read_to_string(&fname).map_err(|e| Error::file("open", &fname, e))?;
        Self::parse(&contents, &fname)
    }

    fn parse(contents: &str, fname: &Path) -> Result<Mounts> {
        let mut infos = HashMap::new();

        for (lino, line) in contents.lines().enumerate() {
            let info = Self::parse_line(line).map_err(|_| {
                Error::parse(format!("Error parsing line {} : {:?}", lino, line), fname)
            })?;
            // later entries are stacked on top of earlier ones
            infos.insert(info.mount_point.clone(), info);
        }

        if infos.is_empty() {
            Err(Error::MissingMount)?;
        }

        Ok(Mounts { points: infos })
    }

    /// Lookup the mount point for the provided path, which need not be a mount point.
    pub fn lookup<P: AsRef<Path>>(&self, path: P) -> Result<&MountInfo> {
        let mp = find_mount_point(path)?;
        self.points.get(&mp).ok_or(Error::MissingMount)
    }
}
