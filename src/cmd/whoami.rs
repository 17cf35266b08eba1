//! `whoami`: report both the unprivileged child's and the privileged
//! parent's view of the caller's identity.

use nix::unistd::{getegid, geteuid, getgid, getuid};

use crate::error::Result;
use crate::kv::Kv;
use crate::privsep::Privsep;

use super::ImpState;

pub fn child(_state: &ImpState, ps: &Privsep) -> Result<i32> {
    println!(
        "child: uid={} euid={} gid={} egid={}",
        getuid(),
        geteuid(),
        getgid(),
        getegid()
    );

    ps.write_kv(&Kv::new())?;
    let reply = ps.read_kv()?;
    println!(
        "parent: uid={} euid={} gid={} egid={}",
        reply.get_int64("uid")?,
        reply.get_int64("euid")?,
        reply.get_int64("gid")?,
        reply.get_int64("egid")?,
    );
    Ok(0)
}

pub fn parent(_state: &ImpState, ps: &Privsep) -> Result<Option<i32>> {
    let _request = ps.read_kv()?;
    let mut reply = Kv::new();
    reply.put_int64("uid", getuid().as_raw() as i64)?;
    reply.put_int64("euid", geteuid().as_raw() as i64)?;
    reply.put_int64("gid", getgid().as_raw() as i64)?;
    reply.put_int64("egid", getegid().as_raw() as i64)?;
    ps.write_kv(&reply)?;
    Ok(None)
}
