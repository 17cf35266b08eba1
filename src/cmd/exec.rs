//! `exec`: unwrap a signed job credential and `execve` the configured
//! shell as the job's owning user. This replaces the IMP's own
//! (privileged) process image on success, since only the privileged
//! parent can drop to an arbitrary target uid.
//!
//! A failed `execve` due to `EPERM`/`EACCES` exits 126; anything else
//! exits 127. The two are mutually exclusive.

use std::ffi::CString;
use std::io::Read;

use nix::unistd::{self, Uid};

use crate::error::{Error, Result};
use crate::kv::Kv;
use crate::passwd;
use crate::privsep::Privsep;
use crate::sign;

use super::ImpState;

pub fn child(state: &ImpState, ps: &Privsep) -> Result<i32> {
    if state.args.is_empty() {
        eprintln!("exec: usage: exec <shell-path> [arg ...]");
        return Ok(1);
    }
    let shell_path = state.args[0].clone();
    let shell_args = &state.args[1..];

    let mut job = String::new();
    std::io::stdin().read_to_string(&mut job)?;

    let mut request = Kv::new();
    request.put_string("job", job.trim())?;
    request.put_string("shell-path", shell_path)?;
    request.put_int64("argc", shell_args.len() as i64)?;
    for (i, arg) in shell_args.iter().enumerate() {
        request.put_string(&format!("arg.{i}"), arg.clone())?;
    }
    ps.write_kv(&request)?;
    Ok(0)
}

pub fn parent(state: &ImpState, ps: &Privsep) -> Result<Option<i32>> {
    let request = ps.read_kv()?;
    // The forwarding child has nothing left to do; reap it before we
    // replace this process image with the job.
    let _ = ps.wait_for_child();
    let code = do_exec(state, &request)?;
    Ok(Some(code))
}

fn string_array(table: &toml::value::Table, key: &str) -> Vec<String> {
    table
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn do_exec(state: &ImpState, request: &Kv) -> Result<i32> {
    let job_cred = request.get_string("job")?;
    let shell_path = request.get_string("shell-path")?.to_string();
    let argc = request.get_int64("argc")? as usize;
    let mut args = vec![shell_path.clone()];
    for i in 0..argc {
        args.push(request.get_string(&format!("arg.{i}"))?.to_string());
    }

    let ctx = sign::from_config(&state.config)?;
    let (header, _payload) = ctx.unwrap(job_cred, false)?;
    let userid = header.get_int64("userid")?;
    if userid == 0 {
        return Err(Error::permission_denied("refusing to exec a job owned by uid 0"));
    }

    let exec_cfg = state
        .config
        .table("exec")
        .ok_or_else(|| Error::not_found("missing [exec] configuration"))?;
    let allowed_users = string_array(exec_cfg, "allowed-users");
    let allowed_shells = string_array(exec_cfg, "allowed-shells");

    let target = passwd::by_uid(Uid::from_raw(userid as u32))?;
    if !allowed_users.is_empty() && !allowed_users.iter().any(|u| u == &target.name) {
        return Err(Error::permission_denied(format!(
            "user '{}' is not in exec.allowed-users",
            target.name
        )));
    }
    if !allowed_shells.is_empty() && !allowed_shells.iter().any(|s| s == &shell_path) {
        return Err(Error::permission_denied(format!(
            "shell '{shell_path}' is not in exec.allowed-shells"
        )));
    }

    unistd::setresgid(target.gid, target.gid, target.gid)?;
    unistd::setresuid(target.uid, target.uid, target.uid)?;
    unistd::chdir("/")?;

    let c_shell = CString::new(shell_path.clone()).map_err(|e| Error::with_source(crate::error::ErrorKind::InvalidArgument, "shell path contains NUL", e))?;
    let c_args: Vec<CString> = args
        .iter()
        .map(|a| CString::new(a.as_str()).unwrap_or_default())
        .collect();
    let c_env: Vec<CString> = std::env::vars()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap_or_default())
        .collect();

    match unistd::execve(&c_shell, &c_args, &c_env) {
        Ok(_) => unreachable!("execve does not return on success"),
        Err(nix::Error::EPERM) | Err(nix::Error::EACCES) => Ok(126),
        Err(_) => Ok(127),
    }
}
