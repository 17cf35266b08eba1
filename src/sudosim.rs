//! Simulate having been invoked as a setuid binary when actually
//! invoked via `sudo`, so the privsep drop later in startup behaves the
//! same way in a development environment that lacks a real setuid-root
//! install.

use nix::unistd::{getuid, setresgid, setresuid, Gid, Uid};

use crate::error::{Error, Result};
use crate::passwd;

pub fn sudo_user_name() -> Option<String> {
    std::env::var("SUDO_USER").ok()
}

/// True when running as real root under an active `sudo` session
/// (i.e. `SUDO_USER` is set and we are really uid 0, as opposed to
/// being genuinely setuid-root with a non-root invoker).
pub fn sudo_is_active() -> bool {
    getuid().as_raw() == 0 && sudo_user_name().is_some()
}

/// If sudo simulation is active, drop the *real* (and saved) ids down
/// to `SUDO_USER`'s while leaving the *effective* ids at root, which is
/// exactly the id layout a genuine setuid-root binary has when invoked
/// by a non-root user. Requires `allow_sudo` (from `[imp].allow-sudo`)
/// to be set, or refuses to proceed.
pub fn simulate_setuid(allow_sudo: bool) -> Result<()> {
    if !sudo_is_active() {
        return Ok(());
    }
    if !allow_sudo {
        return Err(Error::permission_denied(
            "running under sudo but [imp].allow-sudo is not enabled",
        ));
    }
    let name = sudo_user_name().expect("sudo_is_active implies SUDO_USER is set");
    let entry = passwd::by_name(&name)?;

    setresgid(entry.gid, Gid::from_raw(0), Gid::from_raw(0))?;
    setresuid(entry.uid, Uid::from_raw(0), Uid::from_raw(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_without_sudo_user() {
        std::env::remove_var("SUDO_USER");
        assert!(!sudo_is_active());
    }
}
