//! vpnkit backend
//!
//! The parent launches vpnkit with an ethernet socket in the state
//! directory and negotiates an interface over it to learn the MAC. The child
//! opens a TAP device with that MAC, negotiates the same interface again and
//! leaves a detached relay copying frames between the two.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use uuid::Uuid;

use rootgate_core::process::{daemonize, kill_with_parent, terminate};
use rootgate_core::state::VPNKIT_SOCKET;
use rootgate_core::{Error, NetworkMessage, Result};

use crate::configure::{configure_interface, ip};
use crate::driver::{NetworkChildDriver, NetworkParentDriver, ParentContext};
use crate::tap::Tap;
use crate::vmnet;

const DRIVER: &str = "vpnkit";

/// Opaque key: path of the ethernet socket
pub const OPAQUE_SOCKET: &str = "vpnkit.socket";
/// Opaque key: interface UUID
pub const OPAQUE_UUID: &str = "vpnkit.uuid";
/// Opaque key: negotiated MAC
pub const OPAQUE_MAC: &str = "vpnkit.mac";

const DEVICE: &str = "tap0";
const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 65, 3);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 65, 1);
const PREFIX: u8 = 24;

const CONNECT_RETRY: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Parent-side vpnkit driver
#[derive(Debug)]
pub struct VpnkitParent {
    binary: PathBuf,
    mtu: u32,
    disable_host_loopback: bool,
    process: Option<Child>,
}

impl VpnkitParent {
    /// Create the driver; `mtu` is already resolved
    #[must_use]
    pub const fn new(binary: PathBuf, mtu: u32, disable_host_loopback: bool) -> Self {
        Self {
            binary,
            mtu,
            disable_host_loopback,
            process: None,
        }
    }

    /// Command-line arguments for one launch
    #[must_use]
    pub fn args(&self, socket: &Path) -> Vec<String> {
        let mut args = vec![
            "--ethernet".to_string(),
            socket.display().to_string(),
            "--mtu".to_string(),
            self.mtu.to_string(),
        ];
        if self.disable_host_loopback {
            args.push("--host-ip".to_string());
            args.push("0.0.0.0".to_string());
        }
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
impl NetworkParentDriver for VpnkitParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    async fn start(&mut self, ctx: &ParentContext) -> Result<NetworkMessage> {
        let socket = ctx.state_dir.join(VPNKIT_SOCKET);
        let _ = std::fs::remove_file(&socket);
        let args = self.args(&socket);

        tracing::debug!(binary = %self.binary.display(), args = ?args, "Starting vpnkit");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        kill_with_parent(&mut cmd);
        let process = cmd
            .spawn()
            .map_err(|e| Self::failed(format!("cannot spawn {}: {e}", self.binary.display())))?;
        let process = self.process.insert(process);

        // vpnkit is ready once its socket accepts connections
        let stream = loop {
            tokio::select! {
                connected = UnixStream::connect(&socket) => {
                    if let Ok(stream) = connected {
                        break stream;
                    }
                }
                status = process.wait() => {
                    let status = status?;
                    return Err(Self::failed(format!("exited before becoming ready ({status})")));
                }
                () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            }
            tokio::select! {
                () = tokio::time::sleep(CONNECT_RETRY) => {}
                () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            }
        };

        let uuid = Uuid::new_v4();
        let mut stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let vif = tokio::task::spawn_blocking(move || vmnet::handshake(&mut stream, &uuid, IP))
            .await??;

        let mac = vmnet::format_mac(&vif.mac);
        tracing::debug!(uuid = %uuid, mac = %mac, vif_mtu = vif.mtu, "vpnkit interface negotiated");

        let opaque = BTreeMap::from([
            (OPAQUE_SOCKET.to_string(), socket.display().to_string()),
            (OPAQUE_UUID.to_string(), uuid.to_string()),
            (OPAQUE_MAC.to_string(), mac),
        ]);
        Ok(NetworkMessage {
            dev: DEVICE.to_string(),
            ip: IP,
            prefix: PREFIX,
            gateway: GATEWAY,
            dns: GATEWAY,
            mtu: self.mtu,
            disable_host_loopback: self.disable_host_loopback,
            opaque,
        })
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut process) = self.process.take() {
            let status = terminate(&mut process, STOP_GRACE).await?;
            tracing::debug!(status = ?status, "vpnkit stopped");
        }
        Ok(())
    }
}

/// Child-side vpnkit driver
#[derive(Debug, Clone, Copy, Default)]
pub struct VpnkitChild;

impl NetworkChildDriver for VpnkitChild {
    fn configure(&self, msg: &NetworkMessage) -> Result<()> {
        let socket = msg.opaque_value(OPAQUE_SOCKET)?;
        let uuid = Uuid::parse_str(msg.opaque_value(OPAQUE_UUID)?)
            .map_err(|e| Error::handshake(format!("invalid vpnkit uuid: {e}")))?;
        let mac = msg.opaque_value(OPAQUE_MAC)?;
        vmnet::parse_mac(mac)?;

        let tap = Tap::open(&msg.dev)?;
        ip(DRIVER, &["link", "set", "dev", &msg.dev, "address", mac])?;

        let mut stream = StdUnixStream::connect(socket).map_err(|e| Error::Network {
            driver: DRIVER,
            message: format!("cannot connect to {socket}: {e}"),
        })?;
        vmnet::handshake(&mut stream, &uuid, msg.ip)?;

        let keep = [tap.as_raw_fd(), stream.as_raw_fd()];
        daemonize("vpnkit-relay", &keep, move || relay(tap.into_file(), stream))?;

        configure_interface(DRIVER, msg)
    }
}

/// Copy frames between the TAP device and vpnkit until either side closes
fn relay(tap: File, stream: StdUnixStream) -> Result<()> {
    let mut tap_in = tap.try_clone()?;
    let mut vpnkit_out = stream.try_clone()?;
    std::thread::spawn(move || {
        let mut buf = vec![0u8; 65536];
        loop {
            match tap_in.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if vmnet::write_frame(&mut vpnkit_out, &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut tap_out = tap;
    let mut vpnkit_in = stream;
    let mut frame = Vec::with_capacity(65536);
    while vmnet::read_frame(&mut vpnkit_in, &mut frame).is_ok() {
        tap_out.write_all(&frame)?;
    }
    tracing::debug!("vpnkit relay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let driver = VpnkitParent::new(PathBuf::from("vpnkit"), 1500, false);
        assert_eq!(
            driver.args(Path::new("/s/vpnkit-ethernet.sock")),
            vec!["--ethernet", "/s/vpnkit-ethernet.sock", "--mtu", "1500"]
        );

        let driver = VpnkitParent::new(PathBuf::from("vpnkit"), 1500, true);
        let args = driver.args(Path::new("/s/vpnkit-ethernet.sock"));
        assert_eq!(&args[4..], &["--host-ip", "0.0.0.0"]);
    }

    #[test]
    fn test_child_requires_opaque_data() {
        let msg = NetworkMessage {
            dev: DEVICE.to_string(),
            ip: IP,
            prefix: PREFIX,
            gateway: GATEWAY,
            dns: GATEWAY,
            mtu: 1500,
            disable_host_loopback: false,
            opaque: BTreeMap::new(),
        };
        let err = VpnkitChild.configure(&msg).unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_socket() {
        use std::os::unix::fs::PermissionsExt;

        // A backend that never creates its socket
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-vpnkit");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut driver = VpnkitParent::new(fake, 1500, false);
        let ctx = ParentContext {
            child_pid: rootgate_core::ProcessId::current(),
            state_dir: dir.path().to_path_buf(),
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let err = driver.start(&ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        driver.stop().await.unwrap();
    }
}
