//! Query Linux capabilities.  cf. capget(2)

use std::fmt;
use std::io;

use libc;

use super::err::{Error, Result};

pub const CAP_SYS_CHROOT: u32 = 18;
pub const CAP_SYS_ADMIN: u32 = 21;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
const LINUX_CAPABILITY_U32S_3: usize = 2;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Capability sets of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cap {
    effective: u64,
    permitted: u64,
    inheritable: u64,
}

impl Cap {
    /// Capabilities of this process
    pub fn current() -> Result<Cap> {
        capget(0)
    }

    pub fn effective(&self, cap: u32) -> bool {
        0 != (self.effective & bit(cap))
    }

    pub fn permitted(&self, cap: u32) -> bool {
        0 != (self.permitted & bit(cap))
    }
}

fn bit(cap: u32) -> u64 {
    if cap < 64 {
        1 << cap
    } else {
        0
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "eff={:#x} perm={:#x} inh={:#x}",
            self.effective, self.permitted, self.inheritable
        )
    }
}

/// Get Linux capabilities for specific process (or 0 for self)
pub fn capget(pid: libc::pid_t) -> Result<Cap> {
    let mut head = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid,
    };
    let mut data = [CapData::default(); LINUX_CAPABILITY_U32S_3];

    // no libc wrapper
    let err = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut head as *mut CapHeader,
            data.as_mut_ptr(),
        )
    };
    if err != 0 {
        return Err(Error::os(format!("capget({})", pid), io::Error::last_os_error()));
    }

    let join = |lo: u32, hi: u32| (lo as u64) | ((hi as u64) << 32);
    Ok(Cap {
        effective: join(data[0].effective, data[1].effective),
        permitted: join(data[0].permitted, data[1].permitted),
        inheritable: join(data[0].inheritable, data[1].inheritable),
    })
}
