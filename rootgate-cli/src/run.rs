//! Session entry points for both roles

use anyhow::{Context, Result};
use std::os::fd::RawFd;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rootgate_bootstrap::{
    ChildCommand, ChildOptions, Coordinator, Initializer, ParentOptions, Role, SessionOptions,
};
use rootgate_core::{AddressBlock, Mtu, PortSpec};
use rootgate_namespace::{CopyUpMode, IdMapPolicy};
use rootgate_network::{NetworkMode, NetworkOptions};
use rootgate_port::PortDriverKind;

use crate::cli::RunArgs;
use crate::report;

/// Turn flags into validated-type session options
pub fn session_options(args: &RunArgs) -> Result<SessionOptions> {
    let mode: NetworkMode = args.net.parse().context("Invalid --net")?;
    let mtu = Mtu::new(args.mtu).context("Invalid --mtu")?;
    let cidr = args
        .cidr
        .as_deref()
        .map(AddressBlock::parse)
        .transpose()
        .context("Invalid --cidr")?;

    let network = NetworkOptions::new(mode)
        .with_mtu(mtu)
        .with_cidr(cidr)
        .with_disable_host_loopback(args.disable_host_loopback)
        .with_slirp4netns_binary(&args.slirp4netns_binary)
        .with_vpnkit_binary(&args.vpnkit_binary);

    let port_driver: PortDriverKind = args.port_driver.parse().context("Invalid --port-driver")?;
    let publish = args
        .publish
        .iter()
        .map(|spec| {
            spec.parse::<PortSpec>()
                .with_context(|| format!("Invalid --publish {spec}"))
        })
        .collect::<Result<Vec<_>>>()?;
    let copy_up_mode: CopyUpMode = args.copy_up_mode.parse().context("Invalid --copy-up-mode")?;
    let id_map: IdMapPolicy = args.id_map.parse().context("Invalid --id-map")?;

    Ok(SessionOptions::new(args.command.clone())
        .with_network(network)
        .with_port_driver(port_driver)
        .with_publish(publish)
        .with_copy_up(args.copy_up.clone())
        .with_copy_up_mode(copy_up_mode)
        .with_id_map(id_map))
}

/// Parent role: coordinate a session and return the exit code to report
pub fn parent(args: RunArgs) -> i32 {
    match coordinate(args) {
        Ok(code) => code,
        Err(e) => report(Role::Parent, &e),
    }
}

fn coordinate(args: RunArgs) -> Result<i32> {
    let session = session_options(&args)?;
    // The child parses the very same flags
    let child = ChildCommand::current_exe(std::env::args_os().skip(1));
    let options = ParentOptions::new(session, child).with_state_dir(args.state_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let code = runtime
        .block_on(Coordinator::run(options, CancellationToken::new()))
        .context("Session failed")?;
    debug!(exit_code = code, "Session finished");
    Ok(code)
}

/// Child role: set up the namespaces and exec the target
///
/// Runs without an async runtime. Only returns on failure.
pub fn child(args: &RunArgs, control_fd: RawFd) -> i32 {
    let role = Role::Child { control_fd };
    let session = match session_options(args) {
        Ok(session) => session,
        Err(e) => return report(role, &e),
    };
    let err = Initializer::run(&ChildOptions {
        session,
        control_fd,
    });
    report(role, &anyhow::Error::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(flags: &[&str]) -> RunArgs {
        let mut argv = vec!["rootgate"];
        argv.extend_from_slice(flags);
        argv.extend_from_slice(&["--", "true"]);
        crate::cli::Cli::parse_from(argv).run
    }

    #[test]
    fn test_defaults() {
        let session = session_options(&args(&[])).unwrap();
        assert_eq!(session.network.mode, NetworkMode::Host);
        assert!(session.network.mtu.is_unset());
        assert_eq!(session.port_driver, PortDriverKind::None);
        assert_eq!(session.command, vec!["true"]);
    }

    #[test]
    fn test_full_flag_set() {
        let session = session_options(&args(&[
            "--net=slirp4netns",
            "--mtu=1500",
            "--cidr=10.0.3.0/24",
            "--disable-host-loopback",
            "--port-driver=builtin",
            "-p",
            "127.0.0.1:8080:80/tcp",
            "--publish=53:53/udp",
            "--copy-up=/etc",
            "--id-map=single",
        ]))
        .unwrap();
        assert_eq!(session.network.mode, NetworkMode::Slirp4netns);
        assert_eq!(session.network.resolved_mtu(), 1500);
        assert!(session.network.disable_host_loopback);
        assert_eq!(session.publish.len(), 2);
        assert_eq!(session.id_map, IdMapPolicy::Single);
        assert!(session.copies_up_etc());
        assert!(session.validate().is_ok());
    }

    #[test]
    fn test_rejected_values() {
        for flags in [
            &["--mtu=65522"][..],
            &["--mtu=-1"],
            &["--net=bridge"],
            &["--net=slirp4netns", "--cidr=10.0.2.100/24"],
            &["--port-driver=vpnkit"],
            &["--copy-up-mode=overlay"],
            &["--publish=nope"],
        ] {
            assert!(session_options(&args(flags)).is_err(), "{flags:?} accepted");
        }
    }
}
