//! slirp4netns backend
//!
//! slirp4netns joins the child's namespaces by pid, creates `tap0` there and
//! writes one byte to `--ready-fd` once the device is up. It exits when the
//! read end of `--exit-fd` sees EOF, so stopping it is closing a pipe.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use rootgate_core::process::{kill_with_parent, pass_fd, terminate};
use rootgate_core::state::SLIRP4NETNS_SOCKET;
use rootgate_core::{AddressBlock, Error, NetworkMessage, ProcessId, Result};

use crate::configure::configure_interface;
use crate::driver::{NetworkChildDriver, NetworkParentDriver, ParentContext};

const DRIVER: &str = "slirp4netns";

/// Device slirp4netns creates inside the namespace
pub const DEVICE: &str = "tap0";

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Addresses handed to the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    /// Interface address
    pub ip: Ipv4Addr,
    /// Prefix length
    pub prefix: u8,
    /// Default gateway
    pub gateway: Ipv4Addr,
    /// Nameserver
    pub dns: Ipv4Addr,
}

impl Addressing {
    /// Addressing inside `cidr`, or the built-in `10.0.2.0/24` block
    ///
    /// The interface gets the 100th address, the gateway the 2nd and the
    /// nameserver the 3rd.
    ///
    /// # Errors
    /// Returns error if the block is too small for those offsets
    pub fn for_cidr(cidr: Option<AddressBlock>) -> Result<Self> {
        let Some(block) = cidr else {
            return Ok(Self {
                ip: Ipv4Addr::new(10, 0, 2, 100),
                prefix: 24,
                gateway: Ipv4Addr::new(10, 0, 2, 2),
                dns: Ipv4Addr::new(10, 0, 2, 3),
            });
        };
        let nth = |n| {
            block.nth(n).ok_or_else(|| {
                Error::invalid_config(format!("cidr {block} has no room for offset {n}"))
            })
        };
        Ok(Self {
            ip: nth(100)?,
            prefix: block.prefix(),
            gateway: nth(2)?,
            dns: nth(3)?,
        })
    }
}

/// Parent-side slirp4netns driver
#[derive(Debug)]
pub struct Slirp4netnsParent {
    binary: PathBuf,
    mtu: u32,
    cidr: Option<AddressBlock>,
    disable_host_loopback: bool,
    api_socket: bool,
    process: Option<Child>,
    exit_fd: Option<OwnedFd>,
}

impl Slirp4netnsParent {
    /// Create the driver; `mtu` is already resolved
    #[must_use]
    pub const fn new(
        binary: PathBuf,
        mtu: u32,
        cidr: Option<AddressBlock>,
        disable_host_loopback: bool,
        api_socket: bool,
    ) -> Self {
        Self {
            binary,
            mtu,
            cidr,
            disable_host_loopback,
            api_socket,
            process: None,
            exit_fd: None,
        }
    }

    /// Command-line arguments for one launch
    #[must_use]
    pub fn args(
        &self,
        pid: ProcessId,
        ready_fd: RawFd,
        exit_fd: RawFd,
        api_socket: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec!["--mtu".to_string(), self.mtu.to_string()];
        if self.disable_host_loopback {
            args.push("--disable-host-loopback".to_string());
        }
        if let Some(cidr) = self.cidr {
            args.push("--cidr".to_string());
            args.push(cidr.to_string());
        }
        if let Some(socket) = api_socket {
            args.push("--api-socket".to_string());
            args.push(socket.display().to_string());
        }
        args.extend([
            "--ready-fd".to_string(),
            ready_fd.to_string(),
            "--exit-fd".to_string(),
            exit_fd.to_string(),
            pid.to_string(),
            DEVICE.to_string(),
        ]);
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
impl NetworkParentDriver for Slirp4netnsParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    async fn start(&mut self, ctx: &ParentContext) -> Result<NetworkMessage> {
        let addressing = Addressing::for_cidr(self.cidr)?;
        let (ready_read, ready_write) = pipe2(OFlag::O_CLOEXEC)?;
        let (exit_read, exit_write) = pipe2(OFlag::O_CLOEXEC)?;

        let api_socket = self
            .api_socket
            .then(|| ctx.state_dir.join(SLIRP4NETNS_SOCKET));
        let args = self.args(
            ctx.child_pid,
            ready_write.as_raw_fd(),
            exit_read.as_raw_fd(),
            api_socket.as_deref(),
        );

        tracing::debug!(binary = %self.binary.display(), args = ?args, "Starting slirp4netns");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        pass_fd(&mut cmd, ready_write.as_raw_fd());
        pass_fd(&mut cmd, exit_read.as_raw_fd());
        kill_with_parent(&mut cmd);

        let process = cmd
            .spawn()
            .map_err(|e| Self::failed(format!("cannot spawn {}: {e}", self.binary.display())))?;
        drop(ready_write);
        drop(exit_read);
        self.exit_fd = Some(exit_write);
        let process = self.process.insert(process);

        let mut ready = pipe::Receiver::from_owned_fd(ready_read)?;
        let mut byte = [0u8; 1];
        tokio::select! {
            read = ready.read(&mut byte) => match read {
                Ok(1) => {}
                Ok(_) => return Err(Self::failed("exited before becoming ready")),
                Err(e) => return Err(Self::failed(format!("reading ready fd: {e}"))),
            },
            status = process.wait() => {
                let status = status?;
                return Err(Self::failed(format!("exited before becoming ready ({status})")));
            }
            () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        }

        tracing::debug!(
            child_pid = %ctx.child_pid,
            ip = %addressing.ip,
            mtu = self.mtu,
            "slirp4netns ready"
        );

        let mut opaque = BTreeMap::new();
        if let Some(socket) = api_socket {
            opaque.insert(
                "slirp4netns.api_socket".to_string(),
                socket.display().to_string(),
            );
        }
        Ok(NetworkMessage {
            dev: DEVICE.to_string(),
            ip: addressing.ip,
            prefix: addressing.prefix,
            gateway: addressing.gateway,
            dns: addressing.dns,
            mtu: self.mtu,
            disable_host_loopback: self.disable_host_loopback,
            opaque,
        })
    }

    async fn stop(&mut self) -> Result<()> {
        // EOF on --exit-fd asks slirp4netns to leave
        self.exit_fd = None;
        if let Some(mut process) = self.process.take() {
            let status = terminate(&mut process, STOP_GRACE).await?;
            tracing::debug!(status = ?status, "slirp4netns stopped");
        }
        Ok(())
    }
}

/// Child-side slirp4netns driver
///
/// `tap0` already exists when the child runs; only addressing is left.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slirp4netnsChild;

impl NetworkChildDriver for Slirp4netnsChild {
    fn configure(&self, msg: &NetworkMessage) -> Result<()> {
        configure_interface(DRIVER, msg)
    }
}
