//! Privilege dropper.
//!
//! Runs once, before the control connection is opened. The group is
//! changed before the user: after `setuid` the process can no longer
//! change its group. Any failure aborts startup.

use tracing::{info, warn};

use crate::config::PrivilegeConfig;
use crate::error::{Result, WorkerError};

/// Numeric identity the worker switches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// Drop to the configured unprivileged identity.
///
/// Returns the new identity, or `None` when the drop is disabled.
pub fn drop_privileges(config: &PrivilegeConfig) -> Result<Option<Identity>> {
    if !config.enabled {
        warn!("privilege drop disabled; user code runs with the launching identity");
        return Ok(None);
    }

    let target = resolve(config)?;
    switch_identity(target)?;
    info!(uid = target.uid, gid = target.gid, user = %config.user, group = %config.group, "dropped privileges");
    Ok(Some(target))
}

fn fatal(message: String) -> WorkerError {
    WorkerError::StartupFatal(message)
}

/// Look up the configured user and group.
#[cfg(unix)]
pub fn resolve(config: &PrivilegeConfig) -> Result<Identity> {
    use nix::unistd::{Group, User};

    let group = Group::from_name(&config.group)
        .map_err(|e| fatal(format!("failed to look up group '{}': {}", config.group, e)))?
        .ok_or_else(|| fatal(format!("group '{}' does not exist", config.group)))?;
    let user = User::from_name(&config.user)
        .map_err(|e| fatal(format!("failed to look up user '{}': {}", config.user, e)))?
        .ok_or_else(|| fatal(format!("user '{}' does not exist", config.user)))?;

    Ok(Identity {
        uid: user.uid.as_raw(),
        gid: group.gid.as_raw(),
    })
}

#[cfg(not(unix))]
pub fn resolve(_config: &PrivilegeConfig) -> Result<Identity> {
    Err(fatal("privilege drop is only supported on unix".to_string()))
}

/// group list -> gid -> uid -> verify.
#[cfg(unix)]
fn switch_identity(target: Identity) -> Result<()> {
    use nix::unistd::{getegid, geteuid, setgid, setuid, Gid, Uid};

    let gid = Gid::from_raw(target.gid);
    let uid = Uid::from_raw(target.uid);

    #[cfg(target_os = "linux")]
    {
        if geteuid().is_root() {
            nix::unistd::setgroups(&[gid])
                .map_err(|e| fatal(format!("failed to reset supplementary groups: {}", e)))?;
        }
    }

    setgid(gid).map_err(|e| fatal(format!("setgid({}) failed: {}", gid, e)))?;
    setuid(uid).map_err(|e| fatal(format!("setuid({}) failed: {}", uid, e)))?;

    let (euid, egid) = (geteuid(), getegid());
    if euid != uid || egid != gid {
        return Err(fatal(format!(
            "identity is uid={} gid={} after drop, expected uid={} gid={}",
            euid, egid, uid, gid
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn switch_identity(_target: Identity) -> Result<()> {
    Err(fatal("privilege drop is only supported on unix".to_string()))
}
