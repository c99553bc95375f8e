use std::ffi::{CString, OsStr};
use std::fs;
use std::path::{Path, PathBuf};

use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{FromRawFd, RawFd};

use libc;

use log::debug;

pub use super::capability::*;
use super::err::{Error, Result};

pub fn path2cstr<P: AsRef<Path>>(path: P) -> Result<CString> {
    os2cstr(path.as_ref().as_os_str())
}

pub fn os2cstr<S: AsRef<OsStr>>(s: S) -> Result<CString> {
    let ret = CString::new(s.as_ref().as_bytes())?;
    Ok(ret)
}

pub fn mkdir<S: AsRef<Path>>(name: S) -> Result<PathBuf> {
    debug!("mkdir({:?})", name.as_ref().display());
    fs::create_dir(name.as_ref()).map_err(|e| Error::file("mkdir", name.as_ref(), e))?;
    Ok(name.as_ref().to_path_buf())
}

pub fn rmdir<S: AsRef<Path>>(name: S) -> Result<()> {
    debug!("rmdir({:?})", name.as_ref().display());
    fs::remove_dir(name.as_ref()).map_err(|e| Error::file("rmdir", name.as_ref(), e))
}

pub fn touch<S: AsRef<Path>>(name: S) -> Result<PathBuf> {
    debug!("touch({:?})", name.as_ref().display());
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(name.as_ref())
        .map_err(|e| Error::file("create", name.as_ref(), e))?;
    Ok(name.as_ref().to_path_buf())
}

pub fn unlink<S: AsRef<Path>>(name: S) -> Result<()> {
    debug!("unlink({:?})", name.as_ref().display());
    fs::remove_file(name.as_ref()).map_err(|e| Error::file("unlink", name.as_ref(), e))
}

pub fn geteuid() -> libc::uid_t {
    unsafe { libc::geteuid() }
}

pub fn mount<A, B, C>(src: A, target: B, fstype: C, flags: libc::c_ulong) -> Result<()>
where
    A: AsRef<Path>,
    B: AsRef<Path>,
    C: AsRef<Path>,
{
    let csrc = path2cstr(&src)?;
    let ctarget = path2cstr(&target)?;
    let cfstype = path2cstr(&fstype)?;
    debug!(
        "mount({:?},{:?},{:?},0x{:x})",
        csrc, ctarget, cfstype, flags
    );
    unsafe {
        if 0 != libc::mount(
            csrc.as_ptr(),
            ctarget.as_ptr(),
            cfstype.as_ptr(),
            flags,
            std::ptr::null(),
        ) {
            Err(Error::last_os_error(format!(
                "mount src={:?} target={:?} fs={:?} flags=0x{:x}",
                src.as_ref(),
                target.as_ref(),
                fstype.as_ref(),
                flags
            )))?;
        }
    }
    Ok(())
}

pub fn umount_lazy<P: AsRef<Path>>(path: P) -> Result<()> {
    debug!("umount({:?})", path.as_ref().display());
    let rawname = path2cstr(&path)?;
    unsafe {
        let ret = libc::umount2(rawname.as_ptr(), libc::MNT_DETACH);
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::last_file_error("umount2", path))
        }
    }
}

/// Anonymous pipe.  Both ends close-on-exec.  Returns (read, write)
pub fn pipe() -> Result<(fs::File, fs::File)> {
    let mut fds = [0; 2];
    unsafe {
        if 0 != libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) {
            return Err(Error::last_os_error("pipe2"));
        }
        Ok((fs::File::from_raw_fd(fds[0]), fs::File::from_raw_fd(fds[1])))
    }
}

/// Duplicate a descriptor, above the stdio range, with close-on-exec set.
pub fn dup_cloexec(fd: RawFd) -> Result<fs::File> {
    unsafe {
        let dup = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3);
        if dup < 0 {
            return Err(Error::last_os_error(format!("dup fd {}", fd)));
        }
        Ok(fs::File::from_raw_fd(dup))
    }
}

/// Regular file with some execute bit set
pub fn is_executable<P: AsRef<Path>>(path: P) -> bool {
    fs::metadata(path.as_ref())
        .map(|st| st.is_file() && 0 != (st.permissions().mode() & 0o111))
        .unwrap_or(false)
}

/// Search for an executable by name, like `which`.
///
/// Names containing a '/' are not searched for.
pub fn find_program<S, I, P>(name: S, search: I) -> Option<PathBuf>
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let name = Path::new(name.as_ref());
    if name.components().count() != 1 || name.is_absolute() {
        return if is_executable(name) {
            Some(name.to_path_buf())
        } else {
            None
        };
    }
    for dir in search {
        let candidate = dir.as_ref().join(name);
        if is_executable(&candidate) {
            debug!("found {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe() {
        let (mut rx, mut tx) = pipe().expect("pipe");

        tx.write_all("msg".as_bytes()).unwrap();
        drop(tx);
        let mut buf = vec![];
        rx.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, "msg".as_bytes());
    }

    #[test]
    fn test_find_sh() {
        let found = find_program("sh", ["/nonexistent", "/bin", "/usr/bin"]).expect("no sh?");
        assert!(found.ends_with("sh"), "{}", found.display());
        assert!(find_program("no-such-program-here", ["/bin", "/usr/bin"]).is_none());
    }

    #[test]
    fn test_find_explicit() {
        let sh = find_program("sh", ["/bin", "/usr/bin"]).unwrap();
        let empty: [&str; 0] = [];
        assert_eq!(find_program(&sh, empty), Some(sh.clone()));
        assert!(find_program("/nonexistent/sh", empty).is_none());
    }

    #[test]
    fn test_nil() {
        assert!(matches!(os2cstr("a\0b"), Err(Error::BadStr)));
    }
}
