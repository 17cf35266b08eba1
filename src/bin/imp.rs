//! `flux-imp`: the IMP entry point. Initialize logging first, load
//! configuration, simulate a setuid invocation under `sudo` if asked
//! to, refuse to run as real root, fork into privsep roles, dispatch
//! to the requested command's child or parent half, and propagate the
//! child's exit status as this process's own.

use clap::Parser;

use flux_security::cmd::{self, ImpState};
use flux_security::config::{Config, DEFAULT_CONFIG_PATTERN};
use flux_security::privsep::Privsep;
use flux_security::{logging, sudosim};

#[derive(Parser)]
#[command(name = "flux-imp", version, about = "Privileged helper for flux-security credentials")]
struct Cli {
    /// Override the glob pattern used to locate configuration files.
    #[arg(long, env = "FLUX_IMP_CONFIG_PATTERN")]
    config_pattern: Option<String>,

    /// The IMP command to run: version, whoami, casign, exec, kill, run.
    command: String,

    /// Arguments passed through to the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    logging::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e}");
            eprintln!("flux-imp: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let pattern = cli.config_pattern.unwrap_or_else(|| DEFAULT_CONFIG_PATTERN.to_string());
    let config = Config::load(&pattern).unwrap_or_else(|e| {
        log::warn!("failed to load configuration ({e}); continuing with an empty configuration");
        Config::empty()
    });

    let allow_sudo = config
        .table("imp")
        .and_then(|t| t.get("allow-sudo"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    sudosim::simulate_setuid(allow_sudo)?;

    if nix::unistd::getuid().as_raw() == 0 {
        anyhow::bail!("flux-imp must not be invoked directly as root");
    }

    let command = cmd::find(&cli.command).ok_or_else(|| anyhow::anyhow!("no such command '{}'", cli.command))?;
    let state = ImpState { args: cli.args, config };

    let ps = Privsep::init()?;

    if ps.is_child() {
        Ok((command.child)(&state, &ps)?)
    } else {
        let early_exit = match command.parent {
            Some(parent_fn) => parent_fn(&state, &ps)?,
            None => None,
        };
        match early_exit {
            Some(code) => Ok(code),
            None => Ok(ps.wait_for_child()?),
        }
    }
}
