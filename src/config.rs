//! Layered TOML configuration loader: configuration lives in one or
//! more TOML files matched by a glob pattern, loaded in sorted path
//! order with later files overriding earlier ones table-by-table. This
//! is a table-level layered merge, not a general config-node tree —
//! that's what every call site in this crate actually needs.

use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};
use crate::path::path_is_secure;

pub const DEFAULT_CONFIG_PATTERN: &str = "/etc/flux/imp/*.toml";
pub const CONFIG_PATTERN_ENV: &str = "FLUX_IMP_CONFIG_PATTERN";

/// The merged configuration tree.
pub struct Config {
    root: toml::value::Table,
}

impl Config {
    /// Load and merge every file matched by `pattern`, sorted by path.
    /// Each matched file is passed through [`path_is_secure`] before
    /// being trusted.
    pub fn load(pattern: &str) -> Result<Config> {
        let mut paths: Vec<PathBuf> = glob::glob(pattern)
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, "invalid config glob pattern", e))?
            .filter_map(|r| r.ok())
            .collect();
        paths.sort();

        let mut root = toml::value::Table::new();
        for path in paths {
            path_is_secure(&path)?;
            let text = std::fs::read_to_string(&path)?;
            let parsed: toml::value::Table = toml::from_str(&text)
                .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, format!("{}: invalid toml", path.display()), e))?;
            merge_tables(&mut root, parsed);
        }
        Ok(Config { root })
    }

    /// Resolve the config pattern from the environment, falling back
    /// to the compiled-in default, then load it.
    pub fn load_default() -> Result<Config> {
        let pattern = std::env::var(CONFIG_PATTERN_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATTERN.to_string());
        Self::load(&pattern)
    }

    pub fn empty() -> Config {
        Config { root: toml::value::Table::new() }
    }

    /// Build a `Config` directly from an already-parsed table, bypassing
    /// the glob loader. Used by callers (and tests) that assemble
    /// configuration in memory.
    pub fn from_table(root: toml::value::Table) -> Config {
        Config { root }
    }

    pub fn table(&self, key: &str) -> Option<&toml::value::Table> {
        self.root.get(key).and_then(|v| v.as_table())
    }

    pub fn root(&self) -> &toml::value::Table {
        &self.root
    }

    /// Deserialize the table at `key` into `T`, erroring with
    /// `ErrorKind::NotFound` if the table is absent.
    pub fn section<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let table = self
            .table(key)
            .ok_or_else(|| Error::not_found(format!("missing config section [{key}]")))?;
        toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e| Error::with_source(ErrorKind::InvalidArgument, format!("invalid [{key}] config section"), e))
    }
}

fn merge_tables(base: &mut toml::value::Table, overlay: toml::value::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), &value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(_)) => {
                if let toml::Value::Table(overlay_table) = value {
                    merge_tables(base_table, overlay_table);
                }
            }
            _ => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn merges_in_sorted_path_order() {
        let dir = tempdir().unwrap();
        let mut a = std::fs::File::create(dir.path().join("10-base.toml")).unwrap();
        write!(a, "[exec]\nallowed-users = [\"alice\"]\n").unwrap();
        let mut b = std::fs::File::create(dir.path().join("20-override.toml")).unwrap();
        write!(b, "[exec]\nallowed-shells = [\"/bin/sh\"]\n").unwrap();

        let pattern = format!("{}/*.toml", dir.path().display());
        let cfg = Config::load(&pattern).unwrap();
        let exec = cfg.table("exec").unwrap();
        assert!(exec.contains_key("allowed-users"));
        assert!(exec.contains_key("allowed-shells"));
    }

    #[test]
    fn later_file_overrides_same_key() {
        let dir = tempdir().unwrap();
        let mut a = std::fs::File::create(dir.path().join("10.toml")).unwrap();
        write!(a, "[ca]\nmax-sign-ttl = 60\n").unwrap();
        let mut b = std::fs::File::create(dir.path().join("20.toml")).unwrap();
        write!(b, "[ca]\nmax-sign-ttl = 120\n").unwrap();

        let pattern = format!("{}/*.toml", dir.path().display());
        let cfg = Config::load(&pattern).unwrap();
        assert_eq!(
            cfg.table("ca").unwrap().get("max-sign-ttl").unwrap().as_integer(),
            Some(120)
        );
    }

    #[test]
    fn missing_section_is_not_found() {
        let cfg = Config::empty();
        let result: Result<toml::value::Table> = cfg.section("nope");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
