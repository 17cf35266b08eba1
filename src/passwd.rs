//! Thin wrapper around passwd-database lookups used by `sudosim`,
//! `cmd::run`, and `cmd::kill`.

use nix::unistd::{Gid, Uid, User};

use crate::error::{Error, Result};

pub struct PasswdEntry {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: std::path::PathBuf,
}

pub fn by_name(name: &str) -> Result<PasswdEntry> {
    let user = User::from_name(name)?
        .ok_or_else(|| Error::not_found(format!("no such user '{name}'")))?;
    Ok(PasswdEntry {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
        home: user.dir,
    })
}

pub fn by_uid(uid: Uid) -> Result<PasswdEntry> {
    let user = User::from_uid(uid)?
        .ok_or_else(|| Error::not_found(format!("no such uid '{}'", uid.as_raw())))?;
    Ok(PasswdEntry {
        name: user.name,
        uid: user.uid,
        gid: user.gid,
        home: user.dir,
    })
}
