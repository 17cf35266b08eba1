//! Privilege-separation harness: fork into an unprivileged child and a
//! privileged parent connected by a pair of pipes, with an irreversible
//! privilege drop in the child and a length-prefixed [`Kv`] frame
//! protocol between them.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid, Uid};

use crate::error::{Error, ErrorKind, Result};
use crate::kv::Kv;

/// A 4 MiB cap on a single frame, to bound the privileged parent's
/// memory exposure to whatever the unprivileged child sends it.
pub const MAX_KVLEN: usize = 4 * 1024 * 1024;

/// Which side of the fork this handle belongs to.
enum Role {
    Parent { child_pid: Pid },
    Child,
}

pub struct Privsep {
    role: Role,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl Privsep {
    /// Fork the process. The parent keeps its privileges and returns a
    /// handle for dispatching privileged requests; the child
    /// irreversibly drops to the real uid/gid before returning.
    pub fn init() -> Result<Privsep> {
        let (child_to_parent_read, child_to_parent_write) = pipe()?;
        let (parent_to_child_read, parent_to_child_write) = pipe()?;

        match unsafe { unistd::fork() }? {
            ForkResult::Parent { child } => {
                drop(parent_to_child_read);
                drop(child_to_parent_write);
                wakeup_child(&parent_to_child_write)?;
                Ok(Privsep {
                    role: Role::Parent { child_pid: child },
                    read_fd: child_to_parent_read,
                    write_fd: parent_to_child_write,
                })
            }
            ForkResult::Child => {
                drop(parent_to_child_write);
                drop(child_to_parent_read);
                drop_privileges()?;
                wait_for_parent(&parent_to_child_read)?;
                Ok(Privsep {
                    role: Role::Child,
                    read_fd: parent_to_child_read,
                    write_fd: child_to_parent_write,
                })
            }
        }
    }

    pub fn is_parent(&self) -> bool {
        matches!(self.role, Role::Parent { .. })
    }

    pub fn is_child(&self) -> bool {
        !self.is_parent()
    }

    /// Send a frame: 4-byte native-endian length prefix, then the
    /// encoded [`Kv`].
    pub fn write_kv(&self, kv: &Kv) -> Result<()> {
        let bytes = kv.encode();
        if bytes.is_empty() || bytes.len() > MAX_KVLEN {
            return Err(Error::too_big("kv frame length must be positive and within the privsep max length"));
        }
        let len = bytes.len() as u32;
        write_all(self.write_fd.as_raw_fd(), &len.to_ne_bytes())?;
        write_all(self.write_fd.as_raw_fd(), &bytes)?;
        Ok(())
    }

    /// Receive a frame written by the peer's [`Privsep::write_kv`].
    pub fn read_kv(&self) -> Result<Kv> {
        let mut len_buf = [0u8; 4];
        read_exact(self.read_fd.as_raw_fd(), &mut len_buf)?;
        let len = u32::from_ne_bytes(len_buf) as usize;
        if len == 0 || len > MAX_KVLEN {
            return Err(Error::too_big("kv frame length must be positive and within the privsep max length"));
        }
        let mut buf = vec![0u8; len];
        read_exact(self.read_fd.as_raw_fd(), &mut buf)?;
        Kv::decode(&buf)
    }

    /// Parent-only: wait for the child to exit and translate its
    /// status into a process exit code.
    pub fn wait_for_child(&self) -> Result<i32> {
        let pid = match self.role {
            Role::Parent { child_pid } => child_pid,
            Role::Child => return Err(Error::invalid_argument("wait_for_child called from the child")),
        };
        match waitpid(pid, None)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
            other => Err(Error::new(ErrorKind::IoError, format!("unexpected wait status: {other:?}"))),
        }
    }
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    unistd::pipe().map_err(Error::from)
}

/// One-byte handshake: the parent writes after it has closed the fds
/// it doesn't need, so the child doesn't race ahead of that cleanup.
fn wakeup_child(fd: &OwnedFd) -> Result<()> {
    write_all(fd.as_raw_fd(), &[1u8])
}

fn wait_for_parent(fd: &OwnedFd) -> Result<()> {
    let mut byte = [0u8; 1];
    read_exact(fd.as_raw_fd(), &mut byte)
}

/// Irreversibly drop to the real uid/gid, then prove the drop cannot
/// be undone by attempting to regain root and requiring it to fail.
fn drop_privileges() -> Result<()> {
    let real_uid = unistd::getuid();
    let real_gid = unistd::getgid();

    unistd::setresgid(real_gid, real_gid, real_gid)?;
    unistd::setresuid(real_uid, real_uid, real_uid)?;

    match unistd::setreuid(Uid::from_raw(u32::MAX), Uid::from_raw(0)) {
        Err(nix::Error::EPERM) => Ok(()),
        Err(e) => Err(Error::from(e)),
        Ok(()) => Err(Error::new(
            ErrorKind::PermissionDenied,
            "privilege drop did not stick: regained root after setresuid",
        )),
    }
}

fn write_all(fd: std::os::fd::RawFd, mut buf: &[u8]) -> Result<()> {
    use std::os::fd::BorrowedFd;
    while !buf.is_empty() {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match unistd::write(borrowed, buf) {
            Ok(0) => return Err(Error::new(ErrorKind::IoError, "privsep pipe closed during write")),
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

fn read_exact(fd: std::os::fd::RawFd, mut buf: &mut [u8]) -> Result<()> {
    use std::os::fd::BorrowedFd;
    while !buf.is_empty() {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match unistd::read(borrowed, buf) {
            Ok(0) => return Err(Error::new(ErrorKind::IoError, "privsep pipe closed during read")),
            Ok(n) => {
                let tmp = buf;
                buf = &mut tmp[n..];
            }
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_child_exchange_a_frame() {
        let ps = Privsep::init().unwrap();
        if ps.is_child() {
            let mut kv = Kv::new();
            kv.put_string("hello", "child").unwrap();
            ps.write_kv(&kv).unwrap();
            std::process::exit(0);
        } else {
            let kv = ps.read_kv().unwrap();
            assert_eq!(kv.get_string("hello").unwrap(), "child");
            let code = ps.wait_for_child().unwrap();
            assert_eq!(code, 0);
        }
    }

    #[test]
    fn write_kv_rejects_an_empty_frame() {
        let ps = Privsep::init().unwrap();
        if ps.is_child() {
            let err = ps.write_kv(&Kv::new()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TooBig);
            std::process::exit(0);
        } else {
            let code = ps.wait_for_child().unwrap();
            assert_eq!(code, 0);
        }
    }
}
