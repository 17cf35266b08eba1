//! Static command dispatch table: a flat array of `(name, child half,
//! parent half)` looked up linearly by name, plus the shared state
//! threaded through every handler.

pub mod casign;
pub mod exec;
pub mod kill;
pub mod run;
pub mod version;
pub mod whoami;

use crate::config::Config;
use crate::error::Result;
use crate::privsep::Privsep;

/// State shared by every command handler: the subcommand's own
/// arguments (argv beyond the command name) and the loaded
/// configuration.
pub struct ImpState {
    pub args: Vec<String>,
    pub config: Config,
}

/// The unprivileged half of a command. Returns the exit code this
/// process should eventually terminate with.
pub type ChildFn = fn(&ImpState, &Privsep) -> Result<i32>;

/// The privileged half of a command. `Ok(Some(code))` means "stop now
/// and exit with this code" (used by `exec`/`run`, which replace this
/// process image via `execve` on success and only return on failure);
/// `Ok(None)` means "continue on to wait for the child's exit status".
pub type ParentFn = fn(&ImpState, &Privsep) -> Result<Option<i32>>;

pub struct Command {
    pub name: &'static str,
    pub child: ChildFn,
    pub parent: Option<ParentFn>,
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "version",
        child: version::child,
        parent: None,
    },
    Command {
        name: "whoami",
        child: whoami::child,
        parent: Some(whoami::parent),
    },
    Command {
        name: "casign",
        child: casign::child,
        parent: Some(casign::parent),
    },
    Command {
        name: "exec",
        child: exec::child,
        parent: Some(exec::parent),
    },
    Command {
        name: "kill",
        child: kill::child,
        parent: Some(kill::parent),
    },
    Command {
        name: "run",
        child: run::child,
        parent: Some(run::parent),
    },
];

pub fn find(name: &str) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_is_findable_by_name() {
        for name in ["version", "whoami", "casign", "exec", "kill", "run"] {
            assert!(find(name).is_some(), "missing command {name}");
        }
        assert!(find("no-such-command").is_none());
    }

    #[test]
    fn version_has_no_parent_half() {
        assert!(find("version").unwrap().parent.is_none());
    }
}
