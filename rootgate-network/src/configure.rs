//! Interface configuration inside the child's network namespace
//!
//! The child is single-threaded and has no runtime, so everything here is
//! blocking. Interfaces are configured with the `ip` command.

use std::fmt::Write;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};

use nix::mount::{MsFlags, mount};
use rootgate_core::{Error, NetworkMessage, Result};

/// Run `ip` with `args`, turning a non-zero exit into an error
///
/// # Errors
/// Returns error if `ip` is missing or fails
pub fn ip(driver: &'static str, args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Network {
            driver,
            message: format!("cannot run ip: {e}"),
        })?;
    if !output.status.success() {
        return Err(Error::Network {
            driver,
            message: format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    tracing::trace!(args = ?args, "ip");
    Ok(())
}

/// Mount a fresh sysfs matching the new network namespace
///
/// Failure is logged, not fatal: some kernels refuse sysfs in a user
/// namespace and the interfaces still work.
pub fn mount_sysfs() {
    if let Err(e) = mount(
        Some("none"),
        "/sys",
        Some("sysfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    ) {
        tracing::warn!(error = %e, "Cannot mount sysfs on /sys");
    }
}

/// Steps shared by every backend once its device exists
///
/// # Errors
/// Returns error if any `ip` invocation fails
pub fn configure_interface(driver: &'static str, msg: &NetworkMessage) -> Result<()> {
    mount_sysfs();
    ip(driver, &["link", "set", "lo", "up"])?;

    let mtu = msg.mtu.to_string();
    let cidr = format!("{}/{}", msg.ip, msg.prefix);
    let gateway = msg.gateway.to_string();
    ip(driver, &["link", "set", "dev", &msg.dev, "mtu", &mtu])?;
    ip(driver, &["addr", "add", &cidr, "dev", &msg.dev])?;
    ip(driver, &["link", "set", "dev", &msg.dev, "up"])?;
    ip(driver, &["route", "add", "default", "via", &gateway, "dev", &msg.dev])?;

    tracing::debug!(
        driver,
        dev = %msg.dev,
        ip = %cidr,
        gateway = %gateway,
        mtu = msg.mtu,
        disable_host_loopback = msg.disable_host_loopback,
        "Interface configured"
    );
    Ok(())
}

/// Contents of `resolv.conf` for the namespace
#[must_use]
pub fn resolv_conf(dns: Ipv4Addr) -> String {
    format!("nameserver {dns}\n")
}

/// Contents of `hosts` for the namespace
#[must_use]
pub fn hosts() -> String {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let mut content = String::from("127.0.0.1 localhost\n::1 localhost ip6-localhost ip6-loopback\n");
    if !hostname.is_empty() && hostname != "localhost" {
        let _ = writeln!(content, "127.0.1.1 {hostname}");
    }
    content
}
