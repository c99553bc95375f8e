//! Manage a temporary directory

use libc;
use std::ffi::{CString, OsString};
use std::path::{Path, PathBuf};

use std::os::unix::ffi::{OsStrExt, OsStringExt};

use log::{debug, error};

use super::err::{Error, Result};
use super::path;

/// A temporary directory which will be `rm -rf` when dropped.
#[derive(Debug)]
pub struct TempDir {
    name: PathBuf,
}

impl TempDir {
    /// Create a new temporary directory
    pub fn new() -> Result<TempDir> {
        Self::new_in(std::env::temp_dir(), "sandbox")
    }

    /// Create a new temporary directory `<parent>/<prefix>.XXXXXX`
    pub fn new_in<P: AsRef<Path>>(parent: P, prefix: &str) -> Result<TempDir> {
        let template = path!(parent.as_ref(), format!("{}.XXXXXX", prefix));
        let template = CString::new(template.as_os_str().as_bytes())?;
        let raw = template.into_raw();
        let ret = unsafe { libc::mkdtemp(raw) }; // modifies template
        let template = unsafe { CString::from_raw(raw) };
        if ret.is_null() {
            return Err(Error::last_file_error("mkdtemp", parent));
        }
        let name = PathBuf::from(OsString::from_vec(template.into_bytes()));
        debug!("Temp dir: {}", name.display());
        Ok(TempDir { name })
    }

    /// Prefer a location within a per-user tmpfs, ie. $XDG_RUNTIME_DIR
    pub fn for_user(prefix: &str) -> Result<TempDir> {
        match std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from) {
            Some(runtime) if runtime.is_dir() => Self::new_in(runtime, prefix),
            _ => Self::new_in(std::env::temp_dir(), prefix),
        }
    }

    /// Where is it?
    pub fn path(&self) -> &Path {
        &self.name
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.name) {
            error!(
                "Unable to remove temporary directory: {} : {}",
                self.name.display(),
                err
            );
        } else {
            debug!("Cleaned up: {}", self.name.display());
        }
    }
}
