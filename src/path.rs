//! Defense-in-depth path checks for files the IMP trusts (config files,
//! `run` command targets).

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::geteuid;

use crate::error::{Error, Result};

const S_IWGRP: u32 = 0o020;
const S_IWOTH: u32 = 0o002;
const S_ISVTX: u32 = 0o1000;

/// Returns `Ok(())` only if `path` is a regular file, is not a symlink,
/// and whose parent directory is owned by root or the caller and is
/// not writable by other users/groups without the sticky bit set.
pub fn path_is_secure(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Err(Error::permission_denied(format!(
            "{}: refusing to trust a symlink",
            path.display()
        )));
    }
    if !meta.file_type().is_file() {
        return Err(Error::permission_denied(format!(
            "{}: not a regular file",
            path.display()
        )));
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parent_dir_is_secure(parent)
}

fn parent_dir_is_secure(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir)?;
    let euid = geteuid().as_raw();

    if meta.uid() != 0 && meta.uid() != euid {
        return Err(Error::permission_denied(format!(
            "{}: not owned by root or the current user",
            dir.display()
        )));
    }

    let mode = meta.mode();
    if mode & S_IWGRP != 0 && mode & S_ISVTX == 0 {
        return Err(Error::permission_denied(format!(
            "{}: group-writable without sticky bit",
            dir.display()
        )));
    }
    if mode & S_IWOTH != 0 && mode & S_ISVTX == 0 {
        return Err(Error::permission_denied(format!(
            "{}: world-writable without sticky bit",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn accepts_a_plain_file_in_a_private_dir() {
        let dir = tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        let file = dir.path().join("config.toml");
        let mut f = fs::File::create(&file).unwrap();
        f.write_all(b"x = 1").unwrap();
        path_is_secure(&file).unwrap();
    }

    #[test]
    fn rejects_world_writable_dir_without_sticky_bit() {
        let dir = tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777)).unwrap();
        let file = dir.path().join("config.toml");
        fs::File::create(&file).unwrap();
        assert!(path_is_secure(&file).is_err());
    }

    #[test]
    fn accepts_world_writable_dir_with_sticky_bit() {
        let dir = tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o1777)).unwrap();
        let file = dir.path().join("config.toml");
        fs::File::create(&file).unwrap();
        path_is_secure(&file).unwrap();
    }

    #[test]
    fn rejects_symlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real");
        fs::File::create(&target).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(path_is_secure(&link).is_err());
    }
}
