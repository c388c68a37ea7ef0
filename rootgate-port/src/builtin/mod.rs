//! builtin port driver
//!
//! Every mapping gets a listening socket on the host. Accepted connections
//! and datagrams are relayed to a socket opened inside the child's network
//! namespace by a detached helper, which passes it back over
//! `builtin.sock`. The helper connects to `builtin-ready.sock` once it
//! listens; that connection stays open for the whole session and the helper
//! exits when it closes.

pub mod dialer;
pub mod helper;
pub mod relay;
pub mod scm;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::{TcpListener, UdpSocket, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rootgate_core::process::daemonize;
use rootgate_core::state::{BUILTIN_READY_SOCKET, BUILTIN_SOCKET};
use rootgate_core::{Error, PortId, PortMessage, PortSpec, PortStatus, Protocol, Result};

use crate::driver::{PortChildDriver, PortContext, PortParentDriver};
use crate::table::PortTable;

pub use dialer::{DialRequest, Dialer, DirectDialer, HelperDialer};

const DRIVER: &str = "builtin";

/// Opaque key: helper socket path
pub const OPAQUE_SOCKET: &str = "builtin.socket";
/// Opaque key: readiness socket path
pub const OPAQUE_READY_SOCKET: &str = "builtin.ready_socket";

/// Address the helper dials when a mapping names no child address
const DEFAULT_CHILD_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Forwarding {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Forwarding {
    /// Stop accepting; returns once the listening socket is closed
    async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Listener task failed");
        }
    }
}

#[derive(Default)]
struct Helper {
    ready_listener: Option<StdUnixListener>,
    ready_conn: Option<UnixStream>,
}

/// Parent-side builtin driver
pub struct BuiltinParent {
    table: PortTable<Forwarding>,
    dialer: Mutex<Option<Arc<dyn Dialer>>>,
    helper: Mutex<Helper>,
    session: CancellationToken,
    tracker: TaskTracker,
}

impl Default for BuiltinParent {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinParent {
    /// Driver dialing through the helper in the child's namespaces
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: PortTable::new(),
            dialer: Mutex::new(None),
            helper: Mutex::new(Helper::default()),
            session: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Driver using `dialer` directly; no helper is involved
    #[must_use]
    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        let driver = Self::new();
        *lock(&driver.dialer) = Some(dialer);
        driver
    }

    fn dialer(&self) -> Result<Arc<dyn Dialer>> {
        lock(&self.dialer).clone().ok_or_else(|| Error::Port {
            driver: DRIVER,
            message: "driver not started".to_string(),
        })
    }

    async fn open(&self, id: PortId, spec: PortSpec, dialer: Arc<dyn Dialer>) -> Result<(Forwarding, PortSpec)> {
        let bind_failed = |source| Error::Bind {
            addr: spec.host.to_string(),
            source,
        };
        let ctx = relay::RelayContext {
            id,
            target: spec.child_addr(DEFAULT_CHILD_IP),
            dialer,
            session: self.session.clone(),
            tracker: self.tracker.clone(),
        };
        let cancel = self.session.child_token();

        let (task, bound) = match spec.proto {
            Protocol::Tcp => {
                let listener = TcpListener::bind(spec.host).await.map_err(bind_failed)?;
                let bound = listener.local_addr()?;
                let task = self
                    .tracker
                    .spawn(relay::accept_tcp(listener, ctx, cancel.clone()));
                (task, bound)
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(spec.host).await.map_err(bind_failed)?;
                let bound = socket.local_addr()?;
                let task = self
                    .tracker
                    .spawn(relay::serve_udp(socket, ctx, cancel.clone()));
                (task, bound)
            }
        };

        let mut resolved = spec;
        resolved.host = bound;
        Ok((Forwarding { cancel, task }, resolved))
    }
}

#[async_trait]
impl PortParentDriver for BuiltinParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    fn opaque_for_child(&self, ctx: &PortContext) -> Result<PortMessage> {
        if lock(&self.dialer).is_some() {
            return Ok(PortMessage::default());
        }

        let socket = ctx.state_dir.join(BUILTIN_SOCKET);
        let ready = ctx.state_dir.join(BUILTIN_READY_SOCKET);
        let _ = std::fs::remove_file(&ready);
        let listener = StdUnixListener::bind(&ready).map_err(|source| Error::Bind {
            addr: ready.display().to_string(),
            source,
        })?;
        lock(&self.helper).ready_listener = Some(listener);

        Ok(PortMessage {
            opaque: BTreeMap::from([
                (OPAQUE_SOCKET.to_string(), socket.display().to_string()),
                (OPAQUE_READY_SOCKET.to_string(), ready.display().to_string()),
            ]),
        })
    }

    async fn start(&self, ctx: &PortContext) -> Result<()> {
        let Some(listener) = lock(&self.helper).ready_listener.take() else {
            // Dialer given up front
            return self.dialer().map(drop);
        };
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        let conn = tokio::select! {
            accepted = listener.accept() => accepted?.0,
            () = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };
        drop(listener);
        let _ = std::fs::remove_file(ctx.state_dir.join(BUILTIN_READY_SOCKET));

        lock(&self.helper).ready_conn = Some(conn);
        *lock(&self.dialer) = Some(Arc::new(HelperDialer::new(
            ctx.state_dir.join(BUILTIN_SOCKET),
        )));
        tracing::debug!("builtin helper ready");
        Ok(())
    }

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus> {
        let dialer = self.dialer()?;
        let (id, mut slot) = self.table.reserve(spec)?;
        match self.open(id, spec, dialer).await {
            Ok((forwarding, resolved)) => {
                *slot = Some(forwarding);
                let status = self.table.activate(id, resolved);
                tracing::info!(id = %id, spec = %resolved, "Port added");
                Ok(status)
            }
            Err(e) => {
                self.table.forget(id);
                Err(e)
            }
        }
    }

    async fn remove_port(&self, id: PortId) -> Result<()> {
        let slot = self.table.slot(id)?;
        let mut guard = slot.lock().await;
        let forwarding = guard.take().ok_or(Error::PortNotFound { id: id.as_raw() })?;
        forwarding.close().await;
        self.table.forget(id);
        tracing::info!(id = %id, "Port removed");
        Ok(())
    }

    async fn list_ports(&self) -> Vec<PortStatus> {
        self.table.list()
    }

    async fn stop(&self) -> Result<()> {
        for (_, forwarding) in self.table.take_all().await {
            forwarding.close().await;
        }
        self.session.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        // Closing the readiness connection lets the helper exit
        let mut helper = lock(&self.helper);
        helper.ready_conn = None;
        helper.ready_listener = None;
        Ok(())
    }
}

/// Child-side builtin driver: starts the dial helper
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinChild;

impl PortChildDriver for BuiltinChild {
    fn setup(&self, msg: &PortMessage) -> Result<()> {
        let socket = msg.opaque_value(OPAQUE_SOCKET)?;
        let ready = msg.opaque_value(OPAQUE_READY_SOCKET)?;

        let _ = std::fs::remove_file(socket);
        let listener = StdUnixListener::bind(socket).map_err(|source| Error::Bind {
            addr: socket.to_string(),
            source,
        })?;
        let parent = StdUnixStream::connect(ready).map_err(|e| Error::Port {
            driver: DRIVER,
            message: format!("cannot reach {ready}: {e}"),
        })?;

        let keep = [listener.as_raw_fd(), parent.as_raw_fd()];
        daemonize("builtin-port-helper", &keep, move || {
            helper::serve(listener, parent)
        })
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
    use rootgate_core::ProcessId;

    fn context(state_dir: &std::path::Path) -> PortContext {
        PortContext {
            child_pid: ProcessId::current(),
            state_dir: state_dir.to_path_buf(),
            network: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_add_before_start_fails() {
        let driver = BuiltinParent::new();
        let err = driver.add_port("0:80".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::Port { .. }));
    }

    #[tokio::test]
    async fn test_opaque_names_state_dir_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BuiltinParent::new();
        let msg = driver.opaque_for_child(&context(dir.path())).unwrap();
        assert_eq!(
            msg.opaque_value(OPAQUE_SOCKET).unwrap(),
            dir.path().join("builtin.sock").display().to_string()
        );
        assert!(dir.path().join("builtin-ready.sock").exists());
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_waits_for_helper() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BuiltinParent::new();
        let ctx = context(dir.path());
        let msg = driver.opaque_for_child(&ctx).unwrap();

        let ready = msg.opaque_value(OPAQUE_READY_SOCKET).unwrap().to_string();
        let helper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            UnixStream::connect(ready).await.unwrap()
        });

        driver.start(&ctx).await.unwrap();
        let mut conn = helper.await.unwrap();

        driver.stop().await.unwrap();
        // The helper sees EOF once the driver stops
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut conn, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_start_is_cancellable() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BuiltinParent::new();
        let ctx = context(dir.path());
        driver.opaque_for_child(&ctx).unwrap();
        ctx.cancel.cancel();
        assert!(matches!(driver.start(&ctx).await, Err(Error::Cancelled)));
    }

    #[test]
    fn test_child_requires_opaque_data() {
        let err = BuiltinChild.setup(&PortMessage::default()).unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }
}
