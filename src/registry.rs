//! Backends by name

use std::fmt;
use std::str::FromStr;

use log::{debug, info};

use super::backend::{Backend, ChrootBackend, HelperBackend};
use super::config::Config;
use super::err::{Error, Result};

pub const CHROOT: &str = "chroot";
pub const LINUX_USER_CHROOT: &str = "linux-user-chroot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Chroot,
    LinuxUserChroot,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Chroot => CHROOT,
            BackendKind::LinuxUserChroot => LINUX_USER_CHROOT,
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    /// '_' may be used in place of '-'
    fn from_str(s: &str) -> Result<Self> {
        match s.replace('_', "-").as_str() {
            CHROOT => Ok(BackendKind::Chroot),
            LINUX_USER_CHROOT => Ok(BackendKind::LinuxUserChroot),
            _ => Err(Error::config(format!("unknown backend {:?}", s))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The fixed set of backends
#[derive(Debug)]
pub struct BackendRegistry {
    chroot: ChrootBackend,
    helper: HelperBackend,
    default_backend: Option<String>,
}

impl BackendRegistry {
    pub fn new(conf: &Config) -> Self {
        let mut helper = HelperBackend::new(conf.search_path.iter().cloned());
        if let Some(prog) = &conf.helper {
            helper = helper.with_program(prog);
        }
        BackendRegistry {
            chroot: ChrootBackend::new(),
            helper,
            default_backend: conf.default_backend.clone(),
        }
    }

    /// Backend by name, whether or not it can be used here
    pub fn lookup(&self, name: &str) -> Result<&dyn Backend> {
        Ok(match name.parse::<BackendKind>()? {
            BackendKind::Chroot => &self.chroot,
            BackendKind::LinuxUserChroot => &self.helper,
        })
    }

    /// Backend by name, if it can be used here.  Never substitutes another.
    pub fn resolve(&self, name: &str) -> Result<&dyn Backend> {
        let backend = self.lookup(name)?;
        backend.check_available()?;
        debug!("resolved backend {}", backend.name());
        Ok(backend)
    }

    /// The configured backend, or the most capable one available.
    pub fn default_backend(&self) -> Result<&dyn Backend> {
        if let Some(name) = &self.default_backend {
            return self.resolve(name);
        }
        match self.resolve(LINUX_USER_CHROOT) {
            Ok(backend) => Ok(backend),
            Err(err) => {
                info!("{}, falling back to {}", err, CHROOT);
                self.resolve(CHROOT)
            }
        }
    }
}
