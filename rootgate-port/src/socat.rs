//! socat port driver
//!
//! Each mapping is one socat process listening on the host. Every accepted
//! connection forks a socat that enters the child's namespaces with
//! `nsenter` and connects to the target there.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::{Child, Command};

use rootgate_core::process::{kill_with_parent, terminate};
use rootgate_core::{Error, PortId, PortMessage, PortSpec, PortStatus, ProcessId, Protocol, Result};

use crate::driver::{PortContext, PortParentDriver};
use crate::table::PortTable;

const DRIVER: &str = "socat";
const DEFAULT_CHILD_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A socat that cannot bind exits within this window
const STARTUP_CHECK: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Parent-side socat driver
pub struct SocatParent {
    socat: PathBuf,
    nsenter: PathBuf,
    table: PortTable<Child>,
    child_pid: Mutex<Option<ProcessId>>,
}

impl SocatParent {
    /// Create the driver with resolved binaries
    #[must_use]
    pub const fn new(socat: PathBuf, nsenter: PathBuf) -> Self {
        Self {
            socat,
            nsenter,
            table: PortTable::new(),
            child_pid: Mutex::new(None),
        }
    }

    /// Arguments of the socat process serving `spec`
    #[must_use]
    pub fn args(&self, spec: &PortSpec, pid: ProcessId) -> Vec<String> {
        let proto = match spec.proto {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        };
        let child = spec.child_addr(DEFAULT_CHILD_IP);
        vec![
            format!(
                "{proto}-LISTEN:{},bind={},reuseaddr,fork",
                spec.host.port(),
                spec.host.ip()
            ),
            format!(
                "EXEC:\"{} -U -n --preserve-credentials -t {pid} {} STDIN {proto}4:{}:{}\"",
                self.nsenter.display(),
                self.socat.display(),
                child.ip(),
                child.port()
            ),
        ]
    }

    fn failed(message: impl Into<String>) -> Error {
        Error::Port {
            driver: DRIVER,
            message: message.into(),
        }
    }

    fn pid(&self) -> Result<ProcessId> {
        lock(&self.child_pid).ok_or_else(|| Self::failed("driver not started"))
    }

    async fn spawn(&self, spec: &PortSpec, pid: ProcessId) -> Result<Child> {
        let args = self.args(spec, pid);
        tracing::debug!(binary = %self.socat.display(), args = ?args, "Starting socat");

        let mut cmd = Command::new(&self.socat);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);
        kill_with_parent(&mut cmd);
        let mut process = cmd
            .spawn()
            .map_err(|e| Self::failed(format!("cannot spawn {}: {e}", self.socat.display())))?;

        if let Ok(status) = tokio::time::timeout(STARTUP_CHECK, process.wait()).await {
            return Err(Self::failed(format!(
                "socat for {spec} exited immediately ({})",
                status?
            )));
        }
        Ok(process)
    }
}

#[async_trait]
impl PortParentDriver for SocatParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    fn opaque_for_child(&self, _ctx: &PortContext) -> Result<PortMessage> {
        Ok(PortMessage::default())
    }

    async fn start(&self, ctx: &PortContext) -> Result<()> {
        *lock(&self.child_pid) = Some(ctx.child_pid);
        Ok(())
    }

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus> {
        let pid = self.pid()?;
        if spec.host.port() == 0 {
            return Err(Error::invalid_config(
                "port driver socat needs an explicit host port",
            ));
        }
        let (id, mut slot) = self.table.reserve(spec)?;
        match self.spawn(&spec, pid).await {
            Ok(process) => {
                *slot = Some(process);
                tracing::info!(id = %id, spec = %spec, "Port added");
                Ok(self.table.activate(id, spec))
            }
            Err(e) => {
                self.table.forget(id);
                Err(e)
            }
        }
    }

    async fn remove_port(&self, id: PortId) -> Result<()> {
        let mut process = self.table.take(id).await?;
        terminate(&mut process, STOP_GRACE).await?;
        tracing::info!(id = %id, "Port removed");
        Ok(())
    }

    async fn list_ports(&self) -> Vec<PortStatus> {
        self.table.list()
    }

    async fn stop(&self) -> Result<()> {
        for (id, mut process) in self.table.take_all().await {
            if let Err(e) = terminate(&mut process, STOP_GRACE).await {
                tracing::warn!(id = %id, error = %e, "Cannot stop socat");
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn driver() -> SocatParent {
        SocatParent::new(PathBuf::from("/usr/bin/socat"), PathBuf::from("/usr/bin/nsenter"))
    }

    #[test]
    fn test_tcp_args() {
        let spec: PortSpec = "127.0.0.1:8080:80".parse().unwrap();
        assert_eq!(
            driver().args(&spec, ProcessId::from_raw(42)),
            vec![
                "TCP-LISTEN:8080,bind=127.0.0.1,reuseaddr,fork",
                "EXEC:\"/usr/bin/nsenter -U -n --preserve-credentials -t 42 /usr/bin/socat STDIN TCP4:127.0.0.1:80\""
            ]
        );
    }

    #[test]
    fn test_udp_args_with_child_ip() {
        let spec: PortSpec = "0.0.0.0:5353:10.0.2.100:53/udp".parse().unwrap();
        let args = driver().args(&spec, ProcessId::from_raw(42));
        assert_eq!(args[0], "UDP-LISTEN:5353,bind=0.0.0.0,reuseaddr,fork");
        assert!(args[1].ends_with("STDIN UDP4:10.0.2.100:53\""));
    }

    #[tokio::test]
    async fn test_requires_start_and_explicit_port() {
        let driver = driver();
        assert!(driver.add_port("8080:80".parse().unwrap()).await.is_err());

        driver
            .start(&PortContext {
                child_pid: ProcessId::from_raw(42),
                state_dir: std::env::temp_dir(),
                network: None,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        let err = driver.add_port("0:80".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert!(matches!(
            driver.remove_port(PortId::from_raw(1)).await,
            Err(Error::PortNotFound { id: 1 })
        ));
    }

    #[tokio::test]
    async fn test_immediate_exit_fails_add() {
        let driver = SocatParent::new(PathBuf::from("false"), PathBuf::from("nsenter"));
        driver
            .start(&PortContext {
                child_pid: ProcessId::from_raw(42),
                state_dir: std::env::temp_dir(),
                network: None,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        let spec: PortSpec = "127.0.0.1:18080:80".parse().unwrap();
        assert!(driver.add_port(spec).await.is_err());
        // The failed mapping left nothing behind
        assert!(driver.list_ports().await.is_empty());
        assert!(driver.add_port(spec).await.is_err());
    }
}
