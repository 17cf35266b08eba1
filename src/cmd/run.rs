//! `run`: execute one of a fixed set of configured, trusted programs
//! (prolog/epilog-style hooks), forwarding a restricted set of
//! environment variables.
//!
//! Unlike `exec`, the target identity is not caller-chosen: `run`
//! executes as the service account configured for the named hook
//! (`[run.<name>].user`, defaulting to the IMP's own effective uid/gid)
//! rather than an arbitrary job owner.

use std::ffi::CString;

use nix::unistd::{self, Gid, Uid};

use crate::error::{Error, Result};
use crate::kv::Kv;
use crate::passwd;
use crate::path::path_is_secure;
use crate::privsep::Privsep;

use super::ImpState;

/// Environment variables always forwarded regardless of the
/// `allowed-environment` allow-list.
const ALWAYS_FORWARDED: &[&str] = &["FLUX_JOB_ID", "FLUX_JOB_USERID"];

pub fn child(state: &ImpState, ps: &Privsep) -> Result<i32> {
    if state.args.is_empty() {
        eprintln!("run: usage: run <name>");
        return Ok(1);
    }
    let name = state.args[0].clone();

    let allowed_env = state
        .config
        .table("run")
        .and_then(|t| t.get(&name))
        .and_then(|v| v.as_table())
        .and_then(|t| t.get("allowed-environment"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut request = Kv::new();
    request.put_string("name", name)?;
    for (key, value) in std::env::vars() {
        if allowed_env.iter().any(|k| k == &key) || ALWAYS_FORWARDED.contains(&key.as_str()) {
            request.put_string(&format!("env.{key}"), value)?;
        }
    }
    ps.write_kv(&request)?;
    Ok(0)
}

pub fn parent(state: &ImpState, ps: &Privsep) -> Result<Option<i32>> {
    let request = ps.read_kv()?;
    let _ = ps.wait_for_child();
    let code = do_run(state, &request)?;
    Ok(Some(code))
}

fn do_run(state: &ImpState, request: &Kv) -> Result<i32> {
    let name = request.get_string("name")?.to_string();
    let section = state
        .config
        .table("run")
        .and_then(|t| t.get(&name))
        .and_then(|v| v.as_table())
        .ok_or_else(|| Error::not_found(format!("no [run.{name}] configuration")))?;

    let path = section
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::not_found(format!("[run.{name}] missing 'path'")))?;
    if !std::path::Path::new(path).is_absolute() {
        return Err(Error::invalid_argument(format!("[run.{name}].path must be absolute")));
    }
    path_is_secure(std::path::Path::new(path))?;

    let allowed_users: Vec<String> = section
        .get("allowed-users")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let real_user = passwd::by_uid(unistd::getuid())?;
    if !allowed_users.is_empty() && !allowed_users.iter().any(|u| u == &real_user.name) {
        return Err(Error::permission_denied(format!(
            "user '{}' is not in run.{name}.allowed-users",
            real_user.name
        )));
    }

    let (run_uid, run_gid) = match section.get("user").and_then(|v| v.as_str()) {
        Some(user) => {
            let entry = passwd::by_name(user)?;
            (entry.uid, entry.gid)
        }
        None => (unistd::geteuid(), unistd::getegid()),
    };

    let mut envs = vec![
        format!("PATH=/usr/bin:/bin"),
        format!("HOME={}", real_user.home.display()),
        format!("USER={}", real_user.name),
        format!("FLUX_OWNER_USERID={}", real_user.uid.as_raw()),
    ];
    for (key, value) in request.iter() {
        if let Some(env_key) = key.strip_prefix("env.") {
            if let crate::kv::KvValue::String(v) = value {
                envs.push(format!("{env_key}={v}"));
            }
        }
    }

    set_identity(run_uid, run_gid)?;

    let c_path = CString::new(path).map_err(|e| Error::with_source(crate::error::ErrorKind::InvalidArgument, "path contains NUL", e))?;
    let c_args = vec![c_path.clone()];
    let c_env: Vec<CString> = envs.iter().map(|s| CString::new(s.as_str()).unwrap_or_default()).collect();

    match unistd::execve(&c_path, &c_args, &c_env) {
        Ok(_) => unreachable!("execve does not return on success"),
        Err(nix::Error::EPERM) | Err(nix::Error::EACCES) => Ok(126),
        Err(_) => Ok(127),
    }
}

fn set_identity(uid: Uid, gid: Gid) -> Result<()> {
    unistd::setresgid(gid, gid, gid)?;
    unistd::setresuid(uid, uid, uid)?;
    Ok(())
}
