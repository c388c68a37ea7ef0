//! rootgate: run a command in rootless namespaces
//!
//! The binary plays both roles of a session. Without the control
//! descriptor variable it coordinates; with it, it is the child re-executed
//! by the coordinator.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

use rootgate_bootstrap::Role;
use rootgate_core::channel::CONTROL_FD_ENV;
use rootgate_core::process::EXIT_BOOTSTRAP_FAILURE;

mod cli;
mod commands;
mod run;

use cli::Cli;

/// Exit code of a failed `rootgate port` request
const EXIT_COMPANION_FAILURE: i32 = 1;

fn main() {
    let role = match Role::from_control_fd(std::env::var(CONTROL_FD_ENV).ok().as_deref()) {
        Ok(role) => role,
        Err(e) => process::exit(report(Role::Parent, &e.into())),
    };

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            process::exit(EXIT_BOOTSTRAP_FAILURE);
        }
    };

    init_logging(cli.debug);

    // The coordinator never re-executes a subcommand
    let code = match (role, cli.command) {
        (_, Some(command)) => match commands::dispatch(command) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("[rootgate] error: {e:#}");
                EXIT_COMPANION_FAILURE
            }
        },
        (Role::Child { control_fd }, None) => run::child(&cli.run, control_fd),
        (Role::Parent, None) => run::parent(cli.run),
    };
    process::exit(code);
}

/// Logs go to stderr so the target's stdout stays untouched
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Print a fatal error with the role prefix and return the exit code
pub fn report(role: Role, err: &anyhow::Error) -> i32 {
    eprintln!("[rootgate:{}] error: {err:#}", role.label());
    err.downcast_ref::<rootgate_core::Error>()
        .map_or(EXIT_BOOTSTRAP_FAILURE, rootgate_core::Error::exit_code)
}
