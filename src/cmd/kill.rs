//! `kill`: signal a process, authorized either by real-uid ownership of
//! the target pid or ownership of its systemd cgroup.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::unistd::{getuid, Pid, Uid};

use crate::error::{Error, ErrorKind, Result};
use crate::kv::Kv;
use crate::passwd;
use crate::privsep::Privsep;

use super::ImpState;

pub fn child(state: &ImpState, ps: &Privsep) -> Result<i32> {
    if state.args.len() != 2 {
        eprintln!("kill: usage: kill <pid> <signal>");
        return Ok(1);
    }
    let pid: i64 = state.args[0]
        .parse()
        .map_err(|_| Error::invalid_argument("kill: pid must be an integer"))?;
    let signal: i64 = state.args[1]
        .parse()
        .map_err(|_| Error::invalid_argument("kill: signal must be an integer"))?;

    let mut request = Kv::new();
    request.put_int64("pid", pid)?;
    request.put_int64("signal", signal)?;
    ps.write_kv(&request)?;

    let reply = ps.read_kv()?;
    if let Ok(msg) = reply.get_string("error") {
        eprintln!("kill: {msg}");
        return Ok(1);
    }
    Ok(0)
}

pub fn parent(state: &ImpState, ps: &Privsep) -> Result<Option<i32>> {
    let request = ps.read_kv()?;
    let result = authorize_and_signal(state, &request);

    let reply = match result {
        Ok(()) => Kv::new(),
        Err(e) => {
            let mut kv = Kv::new();
            kv.put_string("error", e.message())?;
            kv
        }
    };
    ps.write_kv(&reply)?;
    Ok(None)
}

fn authorize_and_signal(state: &ImpState, request: &Kv) -> Result<()> {
    let pid = request.get_int64("pid")?;
    let signal_num = request.get_int64("signal")?;
    if pid == 0 {
        return Err(Error::permission_denied("pid 0 is never a valid kill target"));
    }

    let allowed_users: Vec<String> = state
        .config
        .table("exec")
        .and_then(|t| t.get("allowed-users"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let real_uid = getuid();
    let real_user = passwd::by_uid(real_uid)?;
    if !allowed_users.iter().any(|u| u == &real_user.name) {
        return Err(Error::permission_denied(format!(
            "user '{}' is not in exec.allowed-users",
            real_user.name
        )));
    }

    let owner_uid = proc_owner_uid(pid)?;
    let cgroup_owner_uid = systemd_cgroup_owner_uid(pid).ok();

    let authorized = real_uid == owner_uid || cgroup_owner_uid.map(|u| u == real_uid).unwrap_or(false);
    if !authorized {
        return Err(Error::permission_denied(format!(
            "user '{}' does not own pid {pid} or its cgroup",
            real_user.name
        )));
    }

    let sig = Signal::try_from(signal_num as i32)
        .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid signal number", e))?;
    signal::kill(Pid::from_raw(pid as i32), sig)?;
    Ok(())
}

fn proc_owner_uid(pid: i64) -> Result<Uid> {
    let meta = fs::metadata(format!("/proc/{pid}"))?;
    Ok(Uid::from_raw(meta.uid()))
}

/// Parse `/proc/<pid>/cgroup` for the `name=systemd` line and resolve
/// the owning uid of the corresponding directory under
/// `/sys/fs/cgroup/systemd`.
fn systemd_cgroup_owner_uid(pid: i64) -> Result<Uid> {
    let cgroup_path = pid_systemd_cgroup_path(pid)?;
    let meta = fs::metadata(&cgroup_path)?;
    Ok(Uid::from_raw(meta.uid()))
}

fn pid_systemd_cgroup_path(pid: i64) -> Result<PathBuf> {
    let text = fs::read_to_string(format!("/proc/{pid}/cgroup"))?;
    for line in text.lines() {
        let mut fields = line.splitn(3, ':');
        let _hierarchy_id = fields.next();
        let controllers = fields.next().unwrap_or("");
        let path = fields.next().unwrap_or("");
        if controllers.split(',').any(|c| c == "name=systemd") {
            let relative = path.trim_start_matches('/');
            return Ok(Path::new("/sys/fs/cgroup/systemd").join(relative));
        }
    }
    Err(Error::not_found(format!("pid {pid} has no systemd cgroup entry")))
}
