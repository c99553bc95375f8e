//! Runtime configuration, from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use super::err::{Error, Result};

/// Default SIGTERM to SIGKILL delay
pub const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Backend used when none is named.  `$SANDBOX_BACKEND`
    pub default_backend: Option<String>,
    /// The `linux-user-chroot` executable.  `$SANDBOX_HELPER`
    pub helper: Option<PathBuf>,
    /// Where to look for helpers.  `$PATH`
    pub search_path: Vec<PathBuf>,
    /// Applies when a spec has none.  `$SANDBOX_TIMEOUT` in seconds
    pub timeout: Option<Duration>,
    /// `$SANDBOX_KILL_GRACE` in seconds
    pub kill_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_backend: None,
            helper: None,
            search_path: vec![],
            timeout: None,
            kill_grace: KILL_GRACE,
        }
    }
}

fn seconds(name: &str, val: &str) -> Result<Duration> {
    val.trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| Error::config(format!("{}={:?} is not a number of seconds", name, val)))
}

impl Config {
    pub fn from_env() -> Result<Config> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any source of variables.  Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut conf = Config::default();

        conf.default_backend = get("SANDBOX_BACKEND");
        conf.helper = get("SANDBOX_HELPER").map(PathBuf::from);
        if let Some(path) = get("PATH") {
            conf.search_path = std::env::split_paths(&path).collect();
        }
        if let Some(val) = get("SANDBOX_TIMEOUT") {
            conf.timeout = Some(seconds("SANDBOX_TIMEOUT", &val)?);
        }
        if let Some(val) = get("SANDBOX_KILL_GRACE") {
            conf.kill_grace = seconds("SANDBOX_KILL_GRACE", &val)?;
        }
        debug!("{:?}", conf);
        Ok(conf)
    }
}
