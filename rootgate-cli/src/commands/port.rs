//! `rootgate port`: talk to a running session's port control socket

use anyhow::{Context, Result};
use std::fmt::Write as _;

use rootgate_core::state::API_SOCKET;
use rootgate_core::{PortId, PortSpec, PortStatus, StateDir};
use rootgate_port::ApiClient;

use crate::cli::{PortAction, PortArgs};

pub fn execute(args: PortArgs) -> Result<()> {
    let state = StateDir::attach(args.state_dir);
    if let Ok(Some(pid)) = state.child_pid() {
        tracing::debug!(child_pid = ?pid, state_dir = %state.path().display(), "Session found");
    }
    let client = ApiClient::new(state.join(API_SOCKET));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    match args.action {
        PortAction::Add { spec } => {
            let spec: PortSpec = spec.parse().context("Invalid port spec")?;
            let status = runtime
                .block_on(client.add_port(spec))
                .with_context(|| format!("Failed to add {spec}"))?;
            println!("{}", status.id);
        }
        PortAction::Remove { id } => {
            let id = PortId::from_raw(id);
            runtime
                .block_on(client.remove_port(id))
                .with_context(|| format!("Failed to remove port {id}"))?;
            println!("{id}");
        }
        PortAction::List { json } => {
            let ports = runtime
                .block_on(client.list_ports())
                .context("Failed to list ports")?;
            if json {
                println!("{}", serde_json::to_string(&ports)?);
            } else {
                print!("{}", table(&ports));
            }
        }
    }
    Ok(())
}

fn table(ports: &[PortStatus]) -> String {
    let mut out = format!("{:<4} {:<5} {:<22} {}\n", "ID", "PROTO", "HOST", "CHILD");
    for port in ports {
        let child = port
            .spec
            .child_ip
            .map_or_else(|| port.spec.child_port.to_string(), |ip| {
                format!("{ip}:{}", port.spec.child_port)
            });
        let host = port.spec.host.to_string();
        let _ = writeln!(
            out,
            "{:<4} {:<5} {host:<22} {child}",
            port.id.as_raw(),
            port.spec.proto.as_str(),
        );
    }
    out
}
