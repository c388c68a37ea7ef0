//! slirp4netns port driver
//!
//! Forwards are installed inside slirp4netns itself through its API socket.
//! Each request is one JSON document; slirp4netns answers with `return` or
//! `error` and closes the connection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use rootgate_core::{Error, PortId, PortMessage, PortSpec, PortStatus, Result};

use crate::driver::{PortContext, PortParentDriver};
use crate::table::PortTable;

const DRIVER: &str = "slirp4netns";

/// Opaque key of the network attachment naming the API socket
pub const NETWORK_OPAQUE_API_SOCKET: &str = "slirp4netns.api_socket";

#[derive(Debug, Clone)]
struct Endpoint {
    socket: PathBuf,
    guest_ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    desc: String,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    execute: &'a str,
    arguments: Value,
}

/// Parent-side slirp4netns port driver
pub struct Slirp4netnsPortParent {
    table: PortTable<u64>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl Default for Slirp4netnsPortParent {
    fn default() -> Self {
        Self::new()
    }
}

impl Slirp4netnsPortParent {
    /// Driver that learns its API socket at `start`
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: PortTable::new(),
            endpoint: Mutex::new(None),
        }
    }

    fn failed(message: impl Into<String>) -> Error {
        Error::Port {
            driver: DRIVER,
            message: message.into(),
        }
    }

    fn endpoint(&self) -> Result<Endpoint> {
        lock(&self.endpoint)
            .clone()
            .ok_or_else(|| Self::failed("driver not started"))
    }

    async fn call(socket: &Path, execute: &str, arguments: Value) -> Result<Value> {
        let mut conn = UnixStream::connect(socket)
            .await
            .map_err(|e| Self::failed(format!("cannot connect to {}: {e}", socket.display())))?;
        let request = serde_json::to_vec(&Request { execute, arguments })?;
        conn.write_all(&request).await?;
        conn.shutdown().await?;

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await?;
        let reply: Reply = serde_json::from_slice(&response)?;
        if let Some(error) = reply.error {
            return Err(Self::failed(format!("{execute}: {}", error.desc)));
        }
        Ok(reply.ret.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PortParentDriver for Slirp4netnsPortParent {
    fn name(&self) -> &'static str {
        DRIVER
    }

    fn opaque_for_child(&self, _ctx: &PortContext) -> Result<PortMessage> {
        Ok(PortMessage::default())
    }

    async fn start(&self, ctx: &PortContext) -> Result<()> {
        let network = ctx
            .network
            .as_ref()
            .ok_or_else(|| Error::invalid_config("port driver slirp4netns requires --net=slirp4netns"))?;
        let socket = network.opaque_value(NETWORK_OPAQUE_API_SOCKET)?;
        *lock(&self.endpoint) = Some(Endpoint {
            socket: PathBuf::from(socket),
            guest_ip: IpAddr::V4(network.ip),
        });
        Ok(())
    }

    async fn add_port(&self, spec: PortSpec) -> Result<PortStatus> {
        let endpoint = self.endpoint()?;
        if spec.host.port() == 0 {
            return Err(Error::invalid_config(
                "port driver slirp4netns needs an explicit host port",
            ));
        }
        let (id, mut slot) = self.table.reserve(spec)?;

        let arguments = json!({
            "proto": spec.proto,
            "host_addr": spec.host.ip().to_string(),
            "host_port": spec.host.port(),
            "guest_addr": spec.child_ip.unwrap_or(endpoint.guest_ip).to_string(),
            "guest_port": spec.child_port,
        });
        let forward = match Self::call(&endpoint.socket, "add_hostfwd", arguments).await {
            Ok(ret) => ret.get("id").and_then(Value::as_u64).ok_or_else(|| {
                Self::failed(format!("add_hostfwd returned no id: {ret}"))
            }),
            Err(e) => Err(e),
        };
        match forward {
            Ok(forward) => {
                *slot = Some(forward);
                tracing::info!(id = %id, spec = %spec, forward, "Port added");
                Ok(self.table.activate(id, spec))
            }
            Err(e) => {
                self.table.forget(id);
                Err(e)
            }
        }
    }

    async fn remove_port(&self, id: PortId) -> Result<()> {
        let endpoint = self.endpoint()?;
        let slot = self.table.slot(id)?;
        let mut guard = slot.lock().await;
        let forward = (*guard).ok_or(Error::PortNotFound { id: id.as_raw() })?;
        Self::call(&endpoint.socket, "remove_hostfwd", json!({ "id": forward })).await?;
        *guard = None;
        self.table.forget(id);
        tracing::info!(id = %id, "Port removed");
        Ok(())
    }

    async fn list_ports(&self) -> Vec<PortStatus> {
        self.table.list()
    }

    async fn stop(&self) -> Result<()> {
        // Forwards die with slirp4netns; only the bookkeeping is left
        let dropped = self.table.take_all().await;
        tracing::debug!(count = dropped.len(), "slirp4netns port driver stopped");
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
    use rootgate_core::{NetworkMessage, ProcessId};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;

    /// Answers each request with the next canned reply and records requests
    fn fake_api(
        socket: &Path,
        replies: Vec<&'static str>,
    ) -> tokio::task::JoinHandle<Vec<Value>> {
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in replies {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                conn.read_to_end(&mut request).await.unwrap();
                seen.push(serde_json::from_slice(&request).unwrap());
                conn.write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        })
    }

    fn context(socket: &Path) -> PortContext {
        PortContext {
            child_pid: ProcessId::from_raw(1),
            state_dir: socket.parent().unwrap().to_path_buf(),
            network: Some(NetworkMessage {
                dev: "tap0".into(),
                ip: "10.0.2.100".parse().unwrap(),
                prefix: 24,
                gateway: "10.0.2.2".parse().unwrap(),
                dns: "10.0.2.3".parse().unwrap(),
                mtu: 65520,
                disable_host_loopback: true,
                opaque: BTreeMap::from([(
                    NETWORK_OPAQUE_API_SOCKET.to_string(),
                    socket.display().to_string(),
                )]),
            }),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_hostfwd() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("slirp4netns.sock");
        let api = fake_api(
            &socket,
            vec![r#"{"return":{"id":5}}"#, r#"{"return":{}}"#],
        );

        let driver = Arc::new(Slirp4netnsPortParent::new());
        driver.start(&context(&socket)).await.unwrap();

        let status = driver.add_port("127.0.0.1:8080:80".parse().unwrap()).await.unwrap();
        assert_eq!(status.id.as_raw(), 1);
        assert_eq!(driver.list_ports().await, vec![status.clone()]);
        driver.remove_port(status.id).await.unwrap();
        assert!(driver.list_ports().await.is_empty());

        let seen = api.await.unwrap();
        assert_eq!(seen[0]["execute"], "add_hostfwd");
        assert_eq!(seen[0]["arguments"]["proto"], "tcp");
        assert_eq!(seen[0]["arguments"]["host_addr"], "127.0.0.1");
        assert_eq!(seen[0]["arguments"]["host_port"], 8080);
        assert_eq!(seen[0]["arguments"]["guest_addr"], "10.0.2.100");
        assert_eq!(seen[0]["arguments"]["guest_port"], 80);
        assert_eq!(seen[1]["execute"], "remove_hostfwd");
        assert_eq!(seen[1]["arguments"]["id"], 5);
    }

    #[tokio::test]
    async fn test_api_error_frees_address() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("slirp4netns.sock");
        let _api = fake_api(
            &socket,
            vec![
                r#"{"error":{"desc":"bad request: add_hostfwd: cannot bind"}}"#,
                r#"{"return":{"id":1}}"#,
            ],
        );

        let driver = Slirp4netnsPortParent::new();
        driver.start(&context(&socket)).await.unwrap();

        let err = driver.add_port("8080:80".parse().unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("cannot bind"));
        assert!(driver.add_port("8080:80".parse().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn test_requires_slirp4netns_network() {
        let driver = Slirp4netnsPortParent::new();
        let mut ctx = context(Path::new("/nonexistent/slirp4netns.sock"));
        ctx.network = None;
        assert!(driver.start(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_port_zero_and_unknown_id() {
        let driver = Slirp4netnsPortParent::new();
        driver
            .start(&context(Path::new("/nonexistent/slirp4netns.sock")))
            .await
            .unwrap();
        let err = driver.add_port("0:80".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid");
        assert!(matches!(
            driver.remove_port(PortId::from_raw(3)).await,
            Err(Error::PortNotFound { id: 3 })
        ));
    }
}
