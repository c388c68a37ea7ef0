//! vdeplug_slirp backend
//!
//! The parent creates `tap0` inside the child's namespaces with `nsenter`
//! and plugs it into libslirp with
//! `vde_plug slirp:// = nsenter ... vde_plug tap://tap0`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use rootgate_core::process::{kill_with_parent, terminate};
use rootgate_core::{Error, NetworkMessage, ProcessId, Result};

use crate::configure::configure_interface;
use crate::driver::{NetworkChildDriver, NetworkParentDriver, ParentContext};

const DRIVER: &str = "vdeplug_slirp";
const DEVICE: &str = "tap0";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Parent-side vdeplug_slirp driver
#[derive(Debug)]
pub struct VdeplugParent {
    vde_plug: PathBuf,
    nsenter: PathBuf,
    mtu: u32,
    process: Option<Child>,
}

impl VdeplugParent {
    /// Create the driver; `mtu` is already resolved
    #[must_use]
    pub const fn new(vde_plug: PathBuf, nsenter: PathBuf, mtu: u32) -> Self {
        Self {
            vde_plug,
            nsenter,
            mtu,
            process: None,
        }
    }

    fn nsenter_args(pid: ProcessId) -> Vec<String> {
        vec![
            "-t".to_string(),
            pid.to_string(),
            "-n".to_string(),
            "-m".to_string(),
            "-U".to_string(),
            "--preserve-credentials".to_string(),
        ]
    }

    /// Arguments of `nsenter` creating the TAP device
    #[must_use]
    pub fn tuntap_args(pid: ProcessId) -> Vec<String> {
        let mut args = Self::nsenter_args(pid);
        args.extend(
            ["ip", "tuntap", "add", "name", DEVICE, "mode", "tap"]
                .into_iter()
                .map(String::from),
        );
        args
    }

    /// Arguments of `vde_plug` connecting libslirp to the TAP device
    #[must_use]
    pub fn plug_args(&self, pid: ProcessId) -> Vec<String> {
        let mut args = vec![
            "slirp://".to_string(),
            "=".to_string(),
            self.nsenter.display().to_string(),
        ];
        args.extend(Self::nsenter_args(pid));
        args.push(self.vde_plug.display().to_string());
        args.push(format!("tap://{DEVICE}"));
        args
    }

    fn failed(message: impl Into<String>) -> Error {
        Error::Network {
            driver: DRIVER,
            message: message.into(),
        }
    }
}

#[async_trait]
impl NetworkParentDriver for VdeplugParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    async fn start(&mut self, ctx: &ParentContext) -> Result<NetworkMessage> {
        let mut tuntap = Command::new(&self.nsenter);
        tuntap
            .args(Self::tuntap_args(ctx.child_pid))
            .stdin(Stdio::null());
        let output = tokio::select! {
            output = tuntap.output() => output?,
            () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };
        if !output.status.success() {
            return Err(Self::failed(format!(
                "creating {DEVICE} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let args = self.plug_args(ctx.child_pid);
        tracing::debug!(binary = %self.vde_plug.display(), args = ?args, "Starting vde_plug");

        let mut cmd = Command::new(&self.vde_plug);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        kill_with_parent(&mut cmd);
        let process = cmd.spawn().map_err(|e| {
            Self::failed(format!("cannot spawn {}: {e}", self.vde_plug.display()))
        })?;
        self.process = Some(process);

        Ok(NetworkMessage {
            dev: DEVICE.to_string(),
            ip: Ipv4Addr::new(10, 0, 2, 100),
            prefix: 24,
            gateway: Ipv4Addr::new(10, 0, 2, 2),
            dns: Ipv4Addr::new(10, 0, 2, 3),
            mtu: self.mtu,
            disable_host_loopback: false,
            opaque: BTreeMap::new(),
        })
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            let status = terminate(&mut process, STOP_GRACE).await?;
            tracing::debug!(status = ?status, "vde_plug stopped");
        }
        Ok(())
    }
}

/// Child-side vdeplug_slirp driver
#[derive(Debug, Clone, Copy, Default)]
pub struct VdeplugChild;

impl NetworkChildDriver for VdeplugChild {
    fn configure(&self, msg: &NetworkMessage) -> Result<()> {
        configure_interface(DRIVER, msg)
    }
}
